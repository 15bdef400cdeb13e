//! Error types for vcmw-worker
//!
//! Collaborator failures keep their own enums so the pipeline can tell a
//! voice gateway's "already joined" apart from a hard rejection.

use thiserror::Error;

use crate::collaborators::{ChatError, FetchError, VoiceError};

/// Main error type for vcmw-worker
#[derive(Error, Debug)]
pub enum Error {
    /// Task Store, configuration or other shared-layer failure
    #[error("Store error: {0}")]
    Store(#[from] vcmw_common::Error),

    /// Chat transport failure
    #[error("Chat error: {0}")]
    Chat(#[from] ChatError),

    /// Voice session gateway failure
    #[error("Voice error: {0}")]
    Voice(#[from] VoiceError),

    /// Media fetch failure
    #[error("Fetch error: {0}")]
    Fetch(#[from] FetchError),

    /// A collaborator call exceeded its advisory timeout
    #[error("Timed out: {0}")]
    Timeout(String),

    /// Configuration errors specific to the worker
    #[error("Configuration error: {0}")]
    Config(String),

    /// File I/O errors
    #[error("File I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Request rejected before reaching a collaborator
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Invalid state for operation
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// Other errors
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// The Task Store could not be reached; the orchestrator cannot make progress
    pub fn is_store_failure(&self) -> bool {
        matches!(
            self,
            Error::Store(vcmw_common::Error::Database(_)) | Error::Store(vcmw_common::Error::Io(_))
        )
    }
}

impl From<sqlx::Error> for Error {
    fn from(err: sqlx::Error) -> Self {
        Error::Store(vcmw_common::Error::Database(err))
    }
}

/// Convenience Result type using vcmw-worker Error
pub type Result<T> = std::result::Result<T, Error>;
