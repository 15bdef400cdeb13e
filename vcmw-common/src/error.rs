//! Errors raised by the Task Store and bootstrap configuration
//!
//! The worker wraps these in its own error type; [`Error::Database`] and
//! [`Error::Io`] are what it treats as "the store is gone".

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    /// SQLite unreachable, locked past the busy timeout, or a query failed
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Database file or config file could not be created or read
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Bootstrap TOML missing a required value or holding an invalid one
    #[error("Configuration error: {0}")]
    Config(String),

    /// No task with the requested id
    #[error("Not found: {0}")]
    NotFound(String),

    /// Submission rejected before it reached the table
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// A `tasks` row whose id or status does not decode
    #[error("Corrupt record: {0}")]
    CorruptRecord(String),
}
