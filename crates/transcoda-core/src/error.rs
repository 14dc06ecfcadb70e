//! Error types for transcoda.

use thiserror::Error;
use uuid::Uuid;

use crate::models::RequestStatus;

/// Result type alias using transcoda's Error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Core error type for transcoda operations.
#[derive(Error, Debug)]
pub enum Error {
    /// Database operation failed (wraps sqlx::Error)
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Resource not found
    #[error("Not found: {0}")]
    NotFound(String),

    /// Conversion request not found (zero rows matched)
    #[error("Request not found: {0}")]
    RequestNotFound(Uuid),

    /// Audio record not found
    #[error("The audio with the given id does not exist: {0}")]
    NoSuchAudio(Uuid),

    /// User not found
    #[error("The user with the given username does not exist: {0}")]
    NoSuchUser(String),

    /// Unique constraint violated
    #[error("Already exists: {0}")]
    AlreadyExists(String),

    /// Status change not permitted by the request state machine
    #[error("Invalid status transition: {from} -> {to}")]
    InvalidTransition {
        from: RequestStatus,
        to: RequestStatus,
    },

    /// Encoder failed to spawn or exited non-zero
    #[error("Conversion error: {0}")]
    Conversion(String),

    /// Object storage operation failed
    #[error("Storage error: {0}")]
    Storage(String),

    /// Queue/broker operation failed
    #[error("Queue error: {0}")]
    Queue(String),

    /// No limiter permit available
    #[error("Concurrency exhausted: no conversion permit available")]
    ConcurrencyExhausted,

    /// Deadline exceeded
    #[error("Timed out: {0}")]
    Timeout(String),

    /// Serialization/deserialization error
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Invalid input
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),

    /// File I/O operation failed
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// True for the "no such row" family (`NotFound`, `RequestNotFound`,
    /// `NoSuchAudio`, `NoSuchUser`).
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            Error::NotFound(_)
                | Error::RequestNotFound(_)
                | Error::NoSuchAudio(_)
                | Error::NoSuchUser(_)
        )
    }

    /// True for infrastructure failures that may succeed on a later attempt
    /// (database, broker, object store, filesystem, deadline).
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Error::Database(_)
                | Error::Queue(_)
                | Error::Storage(_)
                | Error::Io(_)
                | Error::Timeout(_)
        )
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}
