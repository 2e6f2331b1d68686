use serde::{Deserialize, Serialize};

/// Engine-wide defaults and quota limits. Zero means "unlimited" for the
/// quota fields.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CoreConfig {
    /// Max non-terminal runs per tenant at any instant.
    pub max_concurrent_runs: u64,
    /// Max runs created per tenant in a rolling 30-day window.
    pub max_monthly_runs: u64,
    pub default_timeout_seconds: u32,
    /// Rows processed per tick pass before carrying over.
    pub tick_batch_size: usize,
    pub tick_interval_seconds: u64,
    pub tick_lease_ttl_seconds: u64,
    /// Heartbeats older than this mark a persisted runner OFFLINE.
    pub runner_stale_seconds: u64,
    /// Silent sessions older than this are force-disconnected.
    pub session_dead_seconds: u64,
    /// Runner auth handshake deadline.
    pub handshake_timeout_seconds: u64,
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            max_concurrent_runs: 100,
            max_monthly_runs: 0,
            default_timeout_seconds: 3600,
            tick_batch_size: 1000,
            tick_interval_seconds: 5,
            tick_lease_ttl_seconds: 15,
            runner_stale_seconds: 60,
            session_dead_seconds: 90,
            handshake_timeout_seconds: 10,
        }
    }
}
