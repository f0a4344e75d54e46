// SPDX-License-Identifier: MIT
//
// QKD LKMS: ETSI QKD 004 Local Key Management System
//
// https://github.com/yourusername/qkd-lkms

//! LKMS Core Library
//!
//! This crate provides the foundational types and machinery for the LKMS,
//! a local key management system exposing the ETSI GS QKD 004 application
//! interface. It buffers key material pulled from a QKD link endpoint and
//! delivers it to applications over per-stream sessions with QoS-derived
//! policies.
//!
//! # Architecture
//!
//! The library is organized into modules representing core concerns:
//! - `protocol`: Northbound request/response types and the ETSI status set
//! - `qos`: QoS parameter validation and policy derivation
//! - `buffer`: Bounded per-session key buffer with secure wipe
//! - `session`: Key stream state machine and registry
//! - `reactor`: Single-threaded event loop owning all session state
//! - `southbound`: Key source abstraction and the feed hand-off channel
//! - `link`: Resilient HTTPS client for the QKD link endpoint
//! - `config`: Configuration management with validation
//! - `error`: Unified error types
//!
//! # Design Principles
//!
//! 1. **Single writer**: every session mutation happens on the reactor task
//! 2. **No key duplication**: delivery is destructive, buffers are wiped on
//!    every terminal transition
//! 3. **Bounded everything**: buffers, queues and batch sizes have ceilings
//! 4. **Testability**: deadlines run on the tokio clock, sources are traits

pub mod buffer;
pub mod config;
pub mod error;
pub mod link;
pub mod metrics;
pub mod protocol;
pub mod qos;
pub mod reactor;
pub mod retry;
pub mod session;
pub mod southbound;

pub use error::{Error, Result};

/// Library version for reporting
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Maximum single southbound pull size to prevent OOM
pub const MAX_PULL_SIZE: usize = 65_536; // 64 KiB

/// Per-session buffer capacity ceiling (64 KiB)
pub const MAX_SESSION_BUFFER: usize = 64 * 1024;

/// Buffer capacity granted per session, in chunk sizes
pub const BUFFER_CHUNK_MULTIPLIER: usize = 4;

/// Default global ceiling over committed buffer capacity (16 MiB)
pub const DEFAULT_BUFFER_TOTAL: usize = 16 * 1024 * 1024;
