//! Error taxonomy for the sync core.
//!
//! Every variant is contained at the boundary where it occurs. Callers see
//! them as reported-but-non-fatal outcomes: connection errors are retried,
//! malformed events are dropped, history errors degrade to an empty or stale
//! canvas.

use thiserror::Error;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SyncError {
    /// Broker connection could not be established or was lost.
    #[error("Connection error: {0}")]
    Connection(String),

    /// A wire message could not be decoded into an envelope.
    #[error("Malformed event: {0}")]
    MalformedEvent(String),

    /// The history store could not return a session's history.
    #[error("History fetch failed: {0}")]
    HistoryFetch(String),

    /// The history store rejected an append or delete.
    #[error("History mutation failed: {0}")]
    HistoryMutation(String),

    /// Configuration could not be parsed.
    #[error("Invalid configuration: {0}")]
    Config(String),

    /// The engine task is no longer running.
    #[error("Sync engine stopped")]
    EngineStopped,
}

pub type Result<T> = std::result::Result<T, SyncError>;

impl From<serde_json::Error> for SyncError {
    fn from(e: serde_json::Error) -> Self {
        SyncError::MalformedEvent(e.to_string())
    }
}
