use std::time::Duration;

use crate::progress::EtaBasis;

/// Fragments held in memory before they are flushed as one chunk.
pub const DEFAULT_BATCH_THRESHOLD: usize = 1000;
pub const DEFAULT_COMPLETION_DELAY: Duration = Duration::from_secs(10);
pub const DEFAULT_MESSAGE_EXPIRY: Duration = Duration::from_secs(30);

#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub batch_threshold: usize,
    pub eta_basis: EtaBasis,
    /// Time spent in `Waiting` after delivery before `Completed`.
    pub completion_delay: Duration,
    /// Time spent in `Completed` before the file is startable again.
    pub message_expiry: Duration,
    pub user_agent: String,
    pub connect_timeout: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            batch_threshold: DEFAULT_BATCH_THRESHOLD,
            eta_basis: EtaBasis::default(),
            completion_delay: DEFAULT_COMPLETION_DELAY,
            message_expiry: DEFAULT_MESSAGE_EXPIRY,
            user_agent: concat!("rdl/", env!("CARGO_PKG_VERSION")).to_string(),
            connect_timeout: Duration::from_secs(10),
        }
    }
}
