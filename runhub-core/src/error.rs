use crate::types::{HitlAction, HitlStatus, RunStatus};
use thiserror::Error;

/// Error kinds surfaced by the core.
///
/// Client errors (quota, illegal state, not-found, validation) are surfaced
/// to callers and are not incidents. Storage and transient failures carry the
/// underlying cause and map to retryable responses at the API edge.
#[derive(Debug, Error)]
pub enum CoreError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("quota exceeded: {0}")]
    QuotaExceeded(String),

    #[error("bot version is not executable: {0}")]
    BotNotCompiled(String),

    #[error("run nesting depth {depth} exceeds limit {max}")]
    DepthExceeded { depth: u16, max: u16 },

    #[error("illegal state: run is {current:?}, expected one of {expected:?}")]
    IllegalState {
        current: RunStatus,
        expected: Vec<RunStatus>,
    },

    #[error("run is not retriable from {0:?}")]
    NotRetriable(RunStatus),

    #[error("approval request already resolved as {0:?}")]
    AlreadyResolved(HitlStatus),

    #[error("action {0:?} is not allowed for this request")]
    ActionNotAllowed(HitlAction),

    #[error("forbidden: {0}")]
    Forbidden(String),

    #[error("validation failed: {0}")]
    Validation(String),

    #[error("protocol violation: {0}")]
    Protocol(String),

    #[error("transient infrastructure failure: {0}")]
    Transient(String),

    #[error("storage failure: {0:#}")]
    Storage(#[from] anyhow::Error),
}

impl CoreError {
    /// Stable machine-readable code for API responses.
    pub fn code(&self) -> &'static str {
        match self {
            CoreError::NotFound(_) => "NOT_FOUND",
            CoreError::QuotaExceeded(_) => "QUOTA_EXCEEDED",
            CoreError::BotNotCompiled(_) => "BOT_NOT_COMPILED",
            CoreError::DepthExceeded { .. } => "DEPTH_EXCEEDED",
            CoreError::IllegalState { .. } => "ILLEGAL_STATE",
            CoreError::NotRetriable(_) => "NOT_RETRIABLE",
            CoreError::AlreadyResolved(_) => "ALREADY_RESOLVED",
            CoreError::ActionNotAllowed(_) => "ACTION_NOT_ALLOWED",
            CoreError::Forbidden(_) => "FORBIDDEN",
            CoreError::Validation(_) => "VALIDATION_FAILED",
            CoreError::Protocol(_) => "PROTOCOL_ERROR",
            CoreError::Transient(_) => "TRANSIENT",
            CoreError::Storage(_) => "STORAGE_ERROR",
        }
    }

    /// True for caller mistakes that should not be logged as incidents.
    pub fn is_client_error(&self) -> bool {
        !matches!(
            self,
            CoreError::Transient(_) | CoreError::Storage(_) | CoreError::Protocol(_)
        )
    }
}

pub type CoreResult<T> = Result<T, CoreError>;
