//! Error types for runrelay.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    /// The backing store is unreachable or the connection was lost.
    #[error("connection error: {0}")]
    Connection(#[from] sqlx::Error),

    /// Missing or invalid configuration. Never retried.
    #[error("configuration error: {0}")]
    Config(String),

    #[error("unknown queue: {0}")]
    UnknownQueue(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("invalid state transition: {from} -> {to}")]
    InvalidTransition { from: String, to: String },

    /// A log entry that is not a valid event record.
    #[error("malformed event: {0}")]
    MalformedEvent(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Other(String),
}

impl Error {
    /// Whether the error is a transient connectivity failure worth retrying.
    pub fn is_connection(&self) -> bool {
        match self {
            Error::Connection(e) => matches!(
                e,
                sqlx::Error::Io(_)
                    | sqlx::Error::PoolTimedOut
                    | sqlx::Error::Tls(_)
                    | sqlx::Error::Protocol(_)
                    | sqlx::Error::WorkerCrashed
            ),
            _ => false,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
