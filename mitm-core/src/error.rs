//! Error types for interception operations

use thiserror::Error;

/// Main error type for the interception engine
#[derive(Debug, Error)]
pub enum MitmError {
    /// Session configuration is unusable (bad proxy URL, missing port, ...)
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Listener or upstream network failure
    #[error("Network error: {0}")]
    Network(String),

    /// CA or client certificate problem
    #[error("Certificate error: {0}")]
    Certificate(String),

    /// HTTP message could not be processed
    #[error("HTTP error: {0}")]
    Http(String),

    #[error("Storage error: {0}")]
    Storage(#[from] StoreError),

    #[error("Plugin error: {plugin}: {reason}")]
    Plugin { plugin: String, reason: String },

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors raised by key/value and flow stores
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// An entry with the same identity already exists
    #[error("conflicting entry for key {0}")]
    Conflict(String),

    #[error("no entry for key {0}")]
    NotFound(String),

    #[error("store backend failure: {0}")]
    Backend(String),
}

/// Raw packet could not be turned into a wire message
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum PacketError {
    #[error("missing or malformed start line")]
    StartLine,

    #[error("malformed header line: {0}")]
    Header(String),

    #[error("invalid uri: {0}")]
    Uri(String),
}

impl From<PacketError> for MitmError {
    fn from(err: PacketError) -> Self {
        MitmError::Http(err.to_string())
    }
}
