//! Error types for stream backends and facades

use thiserror::Error;

use crate::backend::HandlerError;

/// Stream error types
#[derive(Debug, Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Codec error: {0}")]
    Codec(String),

    /// A consumer handler failed and the backend propagates the failure
    /// instead of retrying in-process.
    #[error("Handler failed: {0}")]
    Handler(HandlerError),

    #[error("Backend unavailable: {0}")]
    Unavailable(String),

    #[error("Timeout: {0}")]
    Timeout(String),

    #[error("Stream facade closed: {0}")]
    Closed(String),
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Self::Codec(err.to_string())
    }
}

impl Error {
    /// Returns `true` if the error came from the consumer handler rather than
    /// the backend itself.
    #[must_use]
    pub const fn is_handler_failure(&self) -> bool {
        matches!(self, Self::Handler(_))
    }
}

/// Result type for stream operations
pub type Result<T> = std::result::Result<T, Error>;
