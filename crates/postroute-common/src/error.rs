//! Error types for PostRoute

use thiserror::Error;

/// Main error type for PostRoute
#[derive(Error, Debug)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(String),

    /// A handled, typed failure signalled by a processing step. Mail that
    /// hits one of these is rerouted to the error processor, never lost.
    #[error("Processing failure: {0}")]
    Processing(String),

    /// Any other runtime fault raised by a step.
    #[error("Unexpected fault: {0}")]
    Unexpected(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Spool error: {0}")]
    Spool(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Result type alias for PostRoute
pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Whether the error routing policy treats this as recoverable.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, Error::Processing(_))
    }
}
