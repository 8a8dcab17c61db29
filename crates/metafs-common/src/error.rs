//! Error types for MetaFS
//!
//! This module defines the common error types used throughout the
//! metadata server.

use thiserror::Error;

/// Common result type for MetaFS operations
pub type Result<T> = std::result::Result<T, Error>;

/// Common error type for MetaFS
#[derive(Debug, Error)]
pub enum Error {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("journal error: {0}")]
    Journal(String),

    #[error("event decode error: {0}")]
    Decode(String),

    #[error("streamer error: {0}")]
    Streamer(String),

    #[error("configuration error: {0}")]
    Configuration(String),
}

impl Error {
    /// Create a journal error
    pub fn journal(msg: impl Into<String>) -> Self {
        Self::Journal(msg.into())
    }

    /// Create an event decode error
    pub fn decode(msg: impl Into<String>) -> Self {
        Self::Decode(msg.into())
    }

    /// Create a streamer error
    pub fn streamer(msg: impl Into<String>) -> Self {
        Self::Streamer(msg.into())
    }

    /// Create a configuration error
    pub fn configuration(msg: impl Into<String>) -> Self {
        Self::Configuration(msg.into())
    }

    /// Check if this error indicates corrupt on-stream data
    #[must_use]
    pub fn is_corruption(&self) -> bool {
        matches!(self, Self::Decode(_))
    }
}
