//! HTTP control API and runner gateway for the run dispatch core.

pub mod gateway;
pub mod http;
