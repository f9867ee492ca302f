// src/error.rs

//! Error types shared across the mirroring engine

use thiserror::Error;

/// Errors produced while reading repository metadata or mirroring artifacts
#[derive(Error, Debug)]
pub enum Error {
    /// Distribution, index or artifact absent upstream
    #[error("Not found: {0}")]
    NotFoundError(String),

    /// Transport gave up waiting; retried before being demoted to `NotFoundError`
    #[error("Timed out: {0}")]
    TimeoutError(String),

    /// Transfer failed after the request was accepted
    #[error("Download error: {0}")]
    DownloadError(String),

    /// Downloaded content does not match the expected digest or size
    #[error("Checksum mismatch: expected {expected}, got {actual}")]
    ChecksumMismatch { expected: String, actual: String },

    /// Unparsable metadata (stanza, hash line, descriptor)
    #[error("Parse error: {0}")]
    ParseError(String),

    /// Repository-supplied path tries to escape the cache root
    #[error("Path traversal rejected: {0}")]
    PathTraversal(String),

    #[error("Invalid path: {0}")]
    InvalidPath(String),

    /// Local filesystem failure
    #[error("I/O error: {0}")]
    IoError(String),

    /// Failed to construct a client or runtime component
    #[error("Initialization error: {0}")]
    InitError(String),

    #[error("Configuration error: {0}")]
    ConfigError(String),
}

impl Error {
    /// True for failures that mean "not available upstream" rather than a local fault
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFoundError(_))
    }

    /// True for metadata that was skipped rather than failed
    pub fn is_malformed(&self) -> bool {
        matches!(
            self,
            Self::ParseError(_) | Self::PathTraversal(_) | Self::InvalidPath(_)
        )
    }
}

/// Result alias using the crate error
pub type Result<T> = std::result::Result<T, Error>;
