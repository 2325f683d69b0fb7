//! Error types for the tiered artifact cache

use std::path::PathBuf;

use thiserror::Error;

use crate::locking::LockMode;

/// Result type alias using our Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while looking up, verifying or storing artifacts
#[derive(Error, Debug)]
pub enum Error {
    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // =========================================================================
    // Transport / Protocol Errors
    // =========================================================================
    /// Peer closed the connection before a full frame arrived
    #[error("Connection closed by peer")]
    ConnectionClosed,

    /// Malformed frame, unexpected message kind or unexpected status
    #[error("Protocol violation: {0}")]
    Protocol(String),

    /// Caller broke the one-outstanding-request discipline of a connection
    #[error("Exchange out of order: {0}")]
    ExchangeOrder(String),

    /// A message was asked for a data key it does not carry
    #[error("Required key '{key}' absent from message")]
    MissingKey { key: String },

    // =========================================================================
    // Locking Errors
    // =========================================================================
    /// Directory lock denied; the caller decides whether to retry
    #[error("Directory {} is locked ({mode} request denied)", .path.display())]
    LockConflict { path: PathBuf, mode: LockMode },

    // =========================================================================
    // Checksum Errors
    // =========================================================================
    /// Calculated digests do not vouch for the artifact
    #[error("Checksum verification failed for {key}: {reason}")]
    ChecksumMismatch { key: String, reason: String },

    /// No factory registered under this algorithm name
    #[error("Unknown checksum algorithm: {0}")]
    UnknownAlgorithm(String),

    /// Artifact key cannot be mapped onto a tier layout
    #[error("Invalid cache key '{0}'")]
    InvalidKey(String),

    // =========================================================================
    // Configuration / Tier Errors
    // =========================================================================
    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Configuration file parse error
    #[error("Failed to parse configuration: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// A tier failed while serving a request
    #[error("Tier '{node}' failed: {reason}")]
    Tier { node: String, reason: String },

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Whether this error came from the byte stream rather than the caller
    pub fn is_transport(&self) -> bool {
        matches!(
            self,
            Error::Io(_) | Error::ConnectionClosed | Error::Protocol(_)
        )
    }

    /// Whether this error is a denied directory lock
    pub fn is_lock_conflict(&self) -> bool {
        matches!(self, Error::LockConflict { .. })
    }

    pub(crate) fn missing_key(key: impl Into<String>) -> Self {
        Error::MissingKey { key: key.into() }
    }
}
