//! Error types for the twin settings and database bootstrap.

use mongodb::error::ErrorKind;
use thiserror::Error;

use crate::secrets::SecretStoreError;

/// Result type alias using our Error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while loading settings or opening connections.
#[derive(Error, Debug)]
pub enum Error {
    /// MongoDB driver error
    #[error("Database error: {0}")]
    Database(#[from] mongodb::error::Error),

    /// Connection could not be established
    #[error("Connection error: {0}")]
    Connection(String),

    /// Secret store error
    #[error("Secret store error: {0}")]
    SecretStore(#[from] SecretStoreError),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl Error {
    /// Whether the error came from reaching an external service rather than from local input.
    pub fn is_transient(&self) -> bool {
        match self {
            Error::Database(e) => is_network_error(e),
            Error::Connection(_) | Error::SecretStore(SecretStoreError::Unavailable(_)) => true,
            _ => false,
        }
    }
}

/// Driver errors caused by not reaching the server (as opposed to bad input or auth).
pub fn is_network_error(err: &mongodb::error::Error) -> bool {
    matches!(
        *err.kind,
        ErrorKind::ServerSelection { .. }
            | ErrorKind::Io(..)
            | ErrorKind::ConnectionPoolCleared { .. }
            | ErrorKind::DnsResolve { .. }
    )
}
