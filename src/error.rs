//! Engine error types.

use thiserror::Error;

/// Errors surfaced by the engine's collaborators.
///
/// Most of the dispatch path is best-effort: these errors are logged and the
/// affected notification is dropped rather than propagated to a caller.
#[derive(Debug, Error)]
pub enum EngineError {
    /// Config store could not be read or parsed.
    #[error("config store error: {0}")]
    Store(String),

    /// Change feed subscription failed or reported an error.
    #[error("change feed error: {0}")]
    Feed(String),

    /// Record lookup failed (partial payload completion, backfill, contacts).
    #[error("record lookup failed: {0}")]
    Record(String),

    /// Invalid engine configuration.
    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl EngineError {
    pub fn store(msg: impl Into<String>) -> Self {
        Self::Store(msg.into())
    }

    pub fn feed(msg: impl Into<String>) -> Self {
        Self::Feed(msg.into())
    }

    pub fn record(msg: impl Into<String>) -> Self {
        Self::Record(msg.into())
    }
}

pub type Result<T> = std::result::Result<T, EngineError>;
