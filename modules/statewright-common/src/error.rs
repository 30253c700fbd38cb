use thiserror::Error;

use crate::types::EntityKey;

/// Result type alias for engine and storage operations.
pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    /// The storage transaction layer failed. Retryable: the originating signal
    /// is still queued.
    #[error("storage error: {0}")]
    Storage(#[source] Box<dyn std::error::Error + Send + Sync>),

    /// The commit found the originating signal already removed from the queue.
    #[error("signal {0} is no longer queued")]
    SignalNotQueued(i64),

    #[error("serialization error for {type_hint}: {message}")]
    Serialization { type_hint: String, message: String },

    #[error("no behaviour registered for entity type: {0}")]
    UnknownEntityType(String),

    #[error("unsupported query: {0}")]
    UnsupportedQuery(String),

    #[error(
        "replay of {key} rejected event {event_type} (seq {sequence_number}) in state {state:?}"
    )]
    ReplayInconsistency {
        key: EntityKey,
        sequence_number: i64,
        event_type: String,
        state: Option<String>,
    },

    #[error("dispatcher is shutting down")]
    ShuttingDown,

    #[error("configuration error: {0}")]
    Config(String),
}

impl Error {
    pub fn storage(err: impl Into<Box<dyn std::error::Error + Send + Sync>>) -> Self {
        Error::Storage(err.into())
    }

    pub fn serialization(type_hint: impl Into<String>, err: impl std::fmt::Display) -> Self {
        Error::Serialization {
            type_hint: type_hint.into(),
            message: err.to_string(),
        }
    }

    /// Whether re-driving the still-queued signal may succeed later.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::Storage(_))
    }
}

impl From<sqlx::Error> for Error {
    fn from(err: sqlx::Error) -> Self {
        Error::Storage(Box::new(err))
    }
}

impl From<sqlx::migrate::MigrateError> for Error {
    fn from(err: sqlx::migrate::MigrateError) -> Self {
        Error::Storage(Box::new(err))
    }
}
