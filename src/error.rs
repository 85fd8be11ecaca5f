//! Error types shared across the crate

use thiserror::Error;

use crate::gateway::RemoteError;
use crate::media::MediaError;

/// Result type for local operations
pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    /// Missing or malformed runtime configuration
    #[error("Configuration error: {0}")]
    Config(String),

    /// A request was missing required fields
    #[error("Invalid input: {0}")]
    Validation(String),

    #[error("Not found: {0}")]
    NotFound(String),

    /// A shared handle is still held elsewhere
    #[error("Resource busy: {0}")]
    Busy(String),

    /// Local database failure (wraps native_db errors)
    #[error("Local store error: {0}")]
    Store(#[from] native_db::db_type::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Media error: {0}")]
    Media(#[from] MediaError),

    #[error("Remote error: {0}")]
    Remote(#[from] RemoteError),
}
