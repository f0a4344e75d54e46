// SPDX-License-Identifier: MIT
//
// QKD LKMS: ETSI QKD 004 Local Key Management System
//
// https://github.com/yourusername/qkd-lkms

//! Protocol data structures for the northbound key-delivery API
//!
//! Defines the key stream identifier, the ETSI GS QKD 004 status codes and
//! the JSON request/response shapes the northbound adapter exchanges with
//! applications. Multi-byte values serialize big-endian where a binary
//! binding applies; the JSON binding carries the numeric status code.

use crate::{Error, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Identifier of an open key stream
///
/// 128-bit, generated at open time, opaque to callers beyond equality.
/// Never reused for the lifetime of the process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct KeyStreamId(Uuid);

impl KeyStreamId {
    /// Generate a fresh random identifier
    pub fn generate() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl fmt::Display for KeyStreamId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// ETSI QKD 004 status codes
///
/// The only values a caller ever observes. Internal failure richness is
/// mapped onto this set or rejected before a session operation completes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(into = "u32", try_from = "u32")]
pub enum Status {
    /// All ok
    Success,
    /// Not enough key material available
    InsufficientKeys,
    /// No QKD connection present
    NoConnection,
    /// KeyStream ID is already in use
    KeyStreamInUse,
    /// Timeout error
    Timeout,
}

impl Status {
    /// Wire code as assigned by ETSI GS QKD 004
    pub fn code(&self) -> u32 {
        match self {
            Status::Success => 0,
            Status::InsufficientKeys => 1,
            Status::NoConnection => 2,
            Status::KeyStreamInUse => 3,
            Status::Timeout => 4,
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, Status::Success)
    }
}

impl From<Status> for u32 {
    fn from(status: Status) -> u32 {
        status.code()
    }
}

impl TryFrom<u32> for Status {
    type Error = Error;

    fn try_from(code: u32) -> Result<Self> {
        match code {
            0 => Ok(Status::Success),
            1 => Ok(Status::InsufficientKeys),
            2 => Ok(Status::NoConnection),
            3 => Ok(Status::KeyStreamInUse),
            4 => Ok(Status::Timeout),
            other => Err(Error::Validation(format!("unknown status code {other}"))),
        }
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Status::Success => "success",
            Status::InsufficientKeys => "insufficient_keys",
            Status::NoConnection => "no_connection",
            Status::KeyStreamInUse => "key_stream_in_use",
            Status::Timeout => "timeout",
        };
        write!(f, "{name}")
    }
}

/// `open` request body
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OpenRequest {
    /// Source endpoint URI
    pub source: String,
    /// Destination endpoint URI
    pub destination: String,
    /// Raw QoS parameter mapping (unknown parameters are ignored)
    #[serde(default)]
    pub qos: crate::qos::Qos,
}

/// `open` response body
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OpenResponse {
    /// Assigned key stream id, present on success only
    #[serde(skip_serializing_if = "Option::is_none")]
    pub key_stream_id: Option<KeyStreamId>,
    pub status: Status,
}

/// `get_key` request body
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GetKeyRequest {
    pub key_stream_id: KeyStreamId,
}

/// `get_key` response body
///
/// `index` is the monotonic chunk sequence number for the stream, starting
/// at 0, letting the consumer detect gaps or reordering. `key` is the
/// hex-encoded key octets; empty on any non-success status.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GetKeyResponse {
    pub index: u32,
    pub key: String,
    pub status: Status,
}

/// `close` request body
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CloseRequest {
    pub key_stream_id: KeyStreamId,
}

/// `close` response body
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CloseResponse {
    pub status: Status,
}

/// Health status for system monitoring
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Unhealthy,
}

/// Daemon status snapshot served northbound
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DaemonStatus {
    /// Overall health status
    pub status: HealthStatus,

    /// Southbound link state as last observed
    pub link_status: String,

    /// Currently live (non-terminal) sessions
    pub active_sessions: usize,

    /// Total key octets currently buffered across sessions
    pub buffered_bytes: usize,

    /// Timestamp of the snapshot
    pub observed_at: DateTime<Utc>,

    /// Service uptime in seconds
    pub uptime_seconds: u64,

    /// Total get_key requests served
    pub total_requests_served: u64,

    /// Total key octets delivered northbound
    pub total_bytes_delivered: u64,

    /// Any warnings or issues
    pub warnings: Vec<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_codes() {
        assert_eq!(Status::Success.code(), 0);
        assert_eq!(Status::InsufficientKeys.code(), 1);
        assert_eq!(Status::NoConnection.code(), 2);
        assert_eq!(Status::KeyStreamInUse.code(), 3);
        assert_eq!(Status::Timeout.code(), 4);
    }

    #[test]
    fn test_status_roundtrip() {
        for code in 0..=4u32 {
            let status = Status::try_from(code).unwrap();
            assert_eq!(u32::from(status), code);
        }
        assert!(Status::try_from(5).is_err());
    }

    #[test]
    fn test_status_serializes_as_number() {
        let json = serde_json::to_string(&Status::Timeout).unwrap();
        assert_eq!(json, "4");
        let back: Status = serde_json::from_str("2").unwrap();
        assert_eq!(back, Status::NoConnection);
    }

    #[test]
    fn test_stream_id_uniqueness() {
        let a = KeyStreamId::generate();
        let b = KeyStreamId::generate();
        assert_ne!(a, b);
    }
}
