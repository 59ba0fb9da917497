//! Error types for wikivc
//!
//! This module defines the single error type used throughout the workspace.
//! We use `thiserror` for automatic `Display` and `Error` trait implementations.
//!
//! ## Taxonomy
//!
//! - `NotFound` / `Validation`: surfaced to the caller as-is
//! - `InvalidKey` / `IdMismatch`: should never happen with correct writers;
//!   logged loudly where detected and treated as fatal
//! - `UpstreamTransient`: store or aggregate timeouts, retried locally first

use thiserror::Error;

/// Result type alias for wikivc operations
pub type Result<T> = std::result::Result<T, Error>;

/// Error types for the version-control engine
#[derive(Debug, Error)]
pub enum Error {
    /// Missing item or version
    #[error("Not found: {0}")]
    NotFound(String),

    /// A stored key string failed to parse into id/version
    #[error("Invalid key: {0}")]
    InvalidKey(String),

    /// Business-rule violation or malformed request payload
    #[error("Validation failed: {0}")]
    Validation(String),

    /// Item id disagrees with the id the entity container was declared for
    #[error("Id mismatch: expected {expected}, got {actual}")]
    IdMismatch {
        /// Id the container was created for
        expected: String,
        /// Id carried by the rejected item
        actual: String,
    },

    /// `Latest` was requested but no latest version has been loaded
    #[error("Latest version of {0} is not loaded")]
    NotLoaded(String),

    /// `Selected` was requested but no version has been selected
    #[error("No version of {0} is selected")]
    NotSelected(String),

    /// Store or upstream fetch failed in a way that may succeed on retry
    #[error("Upstream transient failure: {0}")]
    UpstreamTransient(String),

    /// Serialization/deserialization error
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Configuration could not be read or parsed
    #[error("Configuration error: {0}")]
    Config(String),
}

impl Error {
    /// Build a `NotFound` error
    pub fn not_found(what: impl Into<String>) -> Self {
        Error::NotFound(what.into())
    }

    /// Build a `Validation` error
    pub fn validation(msg: impl Into<String>) -> Self {
        Error::Validation(msg.into())
    }

    /// Build an `InvalidKey` error
    pub fn invalid_key(msg: impl Into<String>) -> Self {
        Error::InvalidKey(msg.into())
    }

    /// Build an `IdMismatch` error
    pub fn id_mismatch(expected: impl ToString, actual: impl ToString) -> Self {
        Error::IdMismatch {
            expected: expected.to_string(),
            actual: actual.to_string(),
        }
    }

    /// Whether the operation may succeed if retried
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::UpstreamTransient(_))
    }

    /// Whether the error indicates corrupt data or a programming error
    pub fn is_fatal(&self) -> bool {
        matches!(self, Error::InvalidKey(_) | Error::IdMismatch { .. })
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}
