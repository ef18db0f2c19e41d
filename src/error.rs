//! Error taxonomy for the guard engine.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum GuardError {
    /// Broker or news feed timed out or returned an error
    #[error("data unavailable from {source_name}: {message}")]
    DataUnavailable {
        source_name: &'static str,
        message: String,
    },

    /// A single calendar entry could not be parsed
    #[error("malformed news event: {0}")]
    MalformedEvent(String),

    /// Persisted guard state missing or unreadable; callers fall back to defaults
    #[error("stale guard state: {0}")]
    StaleState(String),

    /// Broker rejected or failed to execute an action
    #[error("action dispatch failed: {0}")]
    ActionDispatchFailure(String),

    /// State could not be written; operator attention required
    #[error("guard state persistence failed: {0}")]
    PersistenceCorrupt(String),

    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl GuardError {
    pub fn unavailable(source_name: &'static str, message: impl Into<String>) -> Self {
        Self::DataUnavailable {
            source_name,
            message: message.into(),
        }
    }

    /// Only persistence failures stop the engine; every other error degrades
    /// to a logged no-op for the cycle.
    pub fn is_fatal(&self) -> bool {
        matches!(self, GuardError::PersistenceCorrupt(_))
    }
}

pub type Result<T> = std::result::Result<T, GuardError>;
