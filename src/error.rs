//! Construction-time failures.
//!
//! Per spec, nothing in the core's public API throws on normal wire events —
//! only option validation at construction time can fail.

use thiserror::Error;

/// Returned by [`crate::config::CoreConfig::validate`] and by constructors
/// that take a [`crate::config::CoreConfig`].
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    /// At least one listen section is required.
    #[error("no listen sections configured")]
    NoListens,

    /// Two listen sections collided on the same bind address/port pair.
    #[error("duplicate listen game port: {0}")]
    DuplicateListenPort(u16),

    /// `MaxRetries` must be at least 1 or no reliable packet would ever be sent.
    #[error("max_retries must be >= 1")]
    MaxRetriesZero,

    /// `PlayerReliableReceiveWindowSize`/`ClientConnectionReliableReceiveWindowSize` must be
    /// nonzero, or the reorder buffer could never accept anything.
    #[error("reliable receive window size must be >= 1")]
    ReceiveWindowZero,

    /// `SizedQueuePackets` must be nonzero or the sized-send engine can never make progress.
    #[error("sized_queue_packets must be >= 1")]
    SizedQueuePacketsZero,

    /// `ReliableThreads` must be at least 1.
    #[error("reliable_threads must be >= 1")]
    ReliableThreadsZero,
}
