// SPDX-License-Identifier: MIT
//
// QKD LKMS: ETSI QKD 004 Local Key Management System
//
// https://github.com/yourusername/qkd-lkms

//! Error types for the LKMS
//!
//! Provides a unified error taxonomy using `thiserror`. Everything that
//! escapes to a northbound caller is mapped onto the fixed ETSI status set
//! (see `protocol::Status`) or rejected at the call boundary; these variants
//! exist for the internal plumbing.

pub type Result<T> = std::result::Result<T, Error>;

/// Core error type for LKMS operations
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Configuration validation failed
    #[error("Configuration error: {0}")]
    Config(String),

    /// QoS or request validation failed
    #[error("Validation error: {0}")]
    Validation(String),

    /// Key buffer capacity would be exceeded
    #[error("Buffer capacity exceeded: {needed} bytes needed, {free} free")]
    CapacityExceeded { needed: usize, free: usize },

    /// Southbound key source reported a fault
    #[error("Key source error: {0}")]
    Source(String),

    /// Network communication failed
    #[error("Network error: {0}")]
    Network(#[from] reqwest::Error),

    /// Operation timed out
    #[error("Operation timed out")]
    Timeout,

    /// Serialization/deserialization failed
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Generic internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Check if error is transient and retryable
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::Network(_) | Error::Timeout | Error::Source(_) | Error::CapacityExceeded { .. }
        )
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}
