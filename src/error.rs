//! Error types for oauth-m2m

use std::io;

use thiserror::Error;

use crate::oauth::AuthError;

/// Result type alias for oauth-m2m
pub type Result<T> = std::result::Result<T, Error>;

/// Crate-level errors surfaced by startup and the CLI commands
#[derive(Error, Debug)]
pub enum Error {
    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// OpenID Connect discovery failed
    #[error("Discovery error: {0}")]
    Discovery(String),

    /// Token acquisition failed
    #[error(transparent)]
    Auth(#[from] AuthError),

    /// Downstream service answered with a non-success status
    #[error("Downstream returned HTTP {status}: {body}")]
    Downstream {
        /// HTTP status code
        status: u16,
        /// Response body (truncated)
        body: String,
    },

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// HTTP error
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Whether the failure is transient and the operation may succeed if repeated
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Auth(e) => e.is_retryable(),
            Self::Downstream { status, .. } => *status >= 500 || *status == 429,
            Self::Http(e) => e.is_timeout() || e.is_connect(),
            _ => false,
        }
    }
}
