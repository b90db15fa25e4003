//! Error types for the distributed file store
//!
//! Every variant is serializable: errors raised by a remote handler travel
//! back over the wire and are re-raised unchanged at the caller.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Result type alias using our Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in the naming service, storage servers, or transport
#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[allow(clippy::enum_variant_names)]
pub enum Error {
    // =========================================================================
    // Application Errors
    // =========================================================================
    /// Malformed path string or path component
    #[error("Malformed path: {0}")]
    PathFormat(String),

    /// Path does not resolve, or resolves to the wrong kind of node
    #[error("Not found: {0}")]
    NotFound(String),

    /// Operation is not valid in the current state
    #[error("Illegal state: {0}")]
    IllegalState(String),

    /// Offset/length outside the bounds of a file
    #[error("Range error: {0}")]
    Range(String),

    /// Self-evidently invalid argument
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// Local filesystem error
    #[error("I/O error: {0}")]
    Io(String),

    // =========================================================================
    // Transport Errors
    // =========================================================================
    /// Remote call failed at the transport layer
    #[error("Remote call failed: {0}")]
    Rpc(String),

    /// Hostname could not be resolved while building a stub
    #[error("Failed to resolve address {0}")]
    AddressResolution(String),

    // =========================================================================
    // Bootstrapping Errors
    // =========================================================================
    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// True if this error was produced by the transport rather than a handler.
    pub fn is_transport(&self) -> bool {
        matches!(self, Error::Rpc(_))
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::Io(err.to_string())
    }
}

impl From<bincode::Error> for Error {
    fn from(err: bincode::Error) -> Self {
        Error::Rpc(format!("codec failure: {}", err))
    }
}

// =============================================================================
// Tests
// =============================================================================
