//! Engine configuration.

use std::time::Duration;

/// Tuning knobs for the engine and its worker pool.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Maximum number of concurrently live worker processes.
    pub max_children: usize,
    /// Period between admission checks waking pending pool waiters.
    pub check_children_period: Duration,
    /// Grace period between SIGTERM and SIGKILL when cancelling a worker.
    pub sigterm_timeout: Duration,
    /// How long terminal action entries stay in the engine state before
    /// they are collected.
    pub action_grace_period: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_children: 4,
            check_children_period: Duration::from_millis(100),
            sigterm_timeout: Duration::from_secs(5),
            action_grace_period: Duration::from_secs(60),
        }
    }
}
