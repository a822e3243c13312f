//! Error types for the Safe Browsing library

use thiserror::Error;

/// Result type alias for Safe Browsing operations
pub type Result<T> = std::result::Result<T, Error>;

/// Error type for Safe Browsing operations
#[derive(Error, Debug)]
pub enum Error {
    /// Configuration errors
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Database operation errors
    #[error("Database error: {0}")]
    Database(#[from] safebrowsing_db::DatabaseError),

    /// Malformed chunk data
    #[error("Chunk error: {0}")]
    Chunk(#[from] safebrowsing_chunk::ChunkError),

    /// URL parsing and validation errors
    #[error("Invalid URL: {0}")]
    InvalidUrl(String),

    /// Hash processing errors
    #[error("Hash error: {0}")]
    Hash(#[from] safebrowsing_hash::HashError),

    /// IO errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// The database worker is gone
    #[error("Database worker stopped")]
    WorkerStopped,

    /// Internal library errors
    #[error("Internal error: {0}")]
    Internal(String),
}

impl From<safebrowsing_url::UrlError> for Error {
    fn from(err: safebrowsing_url::UrlError) -> Self {
        match err {
            safebrowsing_url::UrlError::Parse(parse_err) => Error::InvalidUrl(parse_err.to_string()),
            safebrowsing_url::UrlError::InvalidHost(msg) => Error::InvalidUrl(msg),
            safebrowsing_url::UrlError::Idna(msg) => {
                Error::InvalidUrl(format!("IDNA error: {msg}"))
            }
        }
    }
}

impl Error {
    /// Whether the error means the store is damaged and must be reset
    pub fn is_corrupt(&self) -> bool {
        matches!(self, Error::Database(e) if e.is_corrupt())
    }
}
