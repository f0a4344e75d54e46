//! QoS parameter handling and policy derivation
//!
//! The northbound `open` call carries a mapping of ETSI QKD 004 QoS
//! parameters. The raw mapping is tolerant (unknown parameter names are
//! ignored); everything that is recognized is validated exhaustively into a
//! typed [`QosValue`] and folded into a derived [`QosPolicy`] record that the
//! session manager consumes. Re-opening with different QoS requires a new
//! session: the policy is immutable once derived.

use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;

/// The QoS parameters defined by ETSI GS QKD 004
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum QosParameter {
    /// Length of the key buffer requested by the application, in octets
    KeyChunkSize,
    /// Maximum key rate requested, in bits per second
    MaxBps,
    /// Minimum key rate requested, in bits per second
    MinBps,
    /// Maximum expected deviation in key delivery, in milliseconds
    Jitter,
    /// Priority of the request
    Priority,
    /// Time in milliseconds after which a call is aborted with an error
    Timeout,
    /// Time in seconds after which keys for this stream must be erased
    Ttl,
}

impl QosParameter {
    /// Wire name of the parameter
    pub fn name(&self) -> &'static str {
        match self {
            QosParameter::KeyChunkSize => "key_chunk_size",
            QosParameter::MaxBps => "max_bps",
            QosParameter::MinBps => "min_bps",
            QosParameter::Jitter => "jitter",
            QosParameter::Priority => "priority",
            QosParameter::Timeout => "timeout",
            QosParameter::Ttl => "ttl",
        }
    }

    /// Parse a wire name; `None` for parameters this implementation does not
    /// know, which callers must ignore rather than reject
    pub fn parse(name: &str) -> Option<Self> {
        match name {
            "key_chunk_size" => Some(QosParameter::KeyChunkSize),
            "max_bps" => Some(QosParameter::MaxBps),
            "min_bps" => Some(QosParameter::MinBps),
            "jitter" => Some(QosParameter::Jitter),
            "priority" => Some(QosParameter::Priority),
            "timeout" => Some(QosParameter::Timeout),
            "ttl" => Some(QosParameter::Ttl),
            _ => None,
        }
    }
}

/// A validated QoS value; each parameter has exactly one value shape
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QosValue {
    /// A plain octet count
    Count(u64),
    /// A rate in bits per second
    BitsPerSecond(u64),
    /// A duration (timeout, ttl, jitter)
    Duration(Duration),
    /// A scheduling priority level
    Priority(u8),
}

/// Raw QoS mapping as received northbound, ordered by parameter name
///
/// Values are bare unsigned integers on the wire; their unit and shape are
/// fixed per parameter and checked during [`QosPolicy::derive`].
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(transparent)]
pub struct Qos(BTreeMap<String, u64>);

impl Qos {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set a parameter value, replacing any previous one
    pub fn set(mut self, parameter: QosParameter, value: u64) -> Self {
        self.0.insert(parameter.name().to_string(), value);
        self
    }

    /// Raw value for a known parameter, if present
    pub fn get(&self, parameter: QosParameter) -> Option<u64> {
        self.0.get(parameter.name()).copied()
    }

    /// Validate a known parameter's raw value into its typed shape
    pub fn typed(&self, parameter: QosParameter) -> Result<Option<QosValue>> {
        let Some(raw) = self.get(parameter) else {
            return Ok(None);
        };
        let value = match parameter {
            QosParameter::KeyChunkSize => QosValue::Count(raw),
            QosParameter::MaxBps | QosParameter::MinBps => QosValue::BitsPerSecond(raw),
            QosParameter::Jitter | QosParameter::Timeout => {
                QosValue::Duration(Duration::from_millis(raw))
            }
            QosParameter::Ttl => QosValue::Duration(Duration::from_secs(raw)),
            QosParameter::Priority => {
                let level = u8::try_from(raw).map_err(|_| {
                    Error::Validation(format!("priority {raw} out of range (0-255)"))
                })?;
                QosValue::Priority(level)
            }
        };
        Ok(Some(value))
    }
}

/// Derived, immutable per-session policy
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QosPolicy {
    /// Octets delivered per successful get_key
    pub chunk_size: usize,
    /// Rate ceiling for southbound refill, bits per second; 0 = unshaped
    pub max_bps: u64,
    /// Minimum rate contract, bits per second; 0 = best effort
    pub min_bps: u64,
    /// Tolerated delivery jitter
    pub jitter_tolerance: Duration,
    /// Scheduling priority; higher is serviced first, never affects correctness
    pub priority: u8,
    /// Deadline for an individual get_key call
    pub timeout: Duration,
    /// Retention limit for unconsumed key material
    pub ttl: Duration,
}

impl QosPolicy {
    /// Evaluate a raw QoS mapping into a policy record
    ///
    /// Applies the documented default for every absent parameter and rejects
    /// malformed combinations before any session state exists.
    pub fn derive(qos: &Qos) -> Result<Self> {
        let chunk_size = match qos.typed(QosParameter::KeyChunkSize)? {
            Some(QosValue::Count(n)) => usize::try_from(n)
                .map_err(|_| Error::Validation(format!("key_chunk_size {n} out of range")))?,
            _ => default_chunk_size(),
        };
        let max_bps = match qos.typed(QosParameter::MaxBps)? {
            Some(QosValue::BitsPerSecond(r)) => r,
            _ => 0,
        };
        let min_bps = match qos.typed(QosParameter::MinBps)? {
            Some(QosValue::BitsPerSecond(r)) => r,
            _ => 0,
        };
        let jitter_tolerance = match qos.typed(QosParameter::Jitter)? {
            Some(QosValue::Duration(d)) => d,
            _ => Duration::ZERO,
        };
        let priority = match qos.typed(QosParameter::Priority)? {
            Some(QosValue::Priority(p)) => p,
            _ => 0,
        };
        let timeout = match qos.typed(QosParameter::Timeout)? {
            Some(QosValue::Duration(d)) => d,
            _ => default_timeout(),
        };
        let ttl = match qos.typed(QosParameter::Ttl)? {
            Some(QosValue::Duration(d)) => d,
            _ => default_ttl(),
        };

        let policy = Self {
            chunk_size,
            max_bps,
            min_bps,
            jitter_tolerance,
            priority,
            timeout,
            ttl,
        };
        policy.validate()?;
        Ok(policy)
    }

    /// Validate the derived record
    ///
    /// Durations are bounded above as well as below: deadlines are computed
    /// as `now + duration`, so an unbounded value would overflow the clock.
    pub fn validate(&self) -> Result<()> {
        if self.chunk_size == 0 {
            return Err(Error::Validation("key_chunk_size must be > 0".to_string()));
        }
        if self.chunk_size > crate::MAX_SESSION_BUFFER {
            return Err(Error::Validation(format!(
                "key_chunk_size must be <= {}",
                crate::MAX_SESSION_BUFFER
            )));
        }
        if self.ttl.is_zero() {
            return Err(Error::Validation("ttl must be > 0".to_string()));
        }
        if self.ttl > max_ttl() {
            return Err(Error::Validation(format!(
                "ttl exceeds maximum of {} seconds",
                max_ttl().as_secs()
            )));
        }
        if self.timeout > max_timeout() {
            return Err(Error::Validation(format!(
                "timeout exceeds maximum of {} ms",
                max_timeout().as_millis()
            )));
        }
        if self.jitter_tolerance > max_jitter() {
            return Err(Error::Validation(format!(
                "jitter exceeds maximum of {} ms",
                max_jitter().as_millis()
            )));
        }
        if self.max_bps > 0 && self.min_bps > self.max_bps {
            return Err(Error::Validation(format!(
                "min_bps {} exceeds max_bps {}",
                self.min_bps, self.max_bps
            )));
        }
        Ok(())
    }

    /// Buffer capacity derived for a session with this policy
    ///
    /// A small multiple of the chunk size, bounded by the per-session ceiling.
    pub fn buffer_capacity(&self) -> usize {
        (self.chunk_size * crate::BUFFER_CHUNK_MULTIPLIER).min(crate::MAX_SESSION_BUFFER)
    }

    /// Whether a timed-out get_key may return fewer octets than a full chunk
    ///
    /// Only streams without a minimum-rate contract accept partial delivery;
    /// anything else gets `timeout` and no octets.
    pub fn allows_partial_delivery(&self) -> bool {
        self.min_bps == 0
    }

    /// Octets the southbound drain may feed this session per tick
    ///
    /// Zero `max_bps` means the refill is unshaped.
    pub fn refill_allowance(&self, tick: Duration) -> usize {
        if self.max_bps == 0 {
            return usize::MAX;
        }
        let bits = self.max_bps as f64 * tick.as_secs_f64();
        ((bits / 8.0).ceil() as usize).max(1)
    }
}

// Default value functions
fn default_chunk_size() -> usize {
    32
}

fn default_timeout() -> Duration {
    Duration::from_millis(5_000)
}

fn default_ttl() -> Duration {
    Duration::from_secs(3_600)
}

// Upper bounds on caller-supplied durations
fn max_timeout() -> Duration {
    Duration::from_secs(3_600) // 1 hour
}

fn max_ttl() -> Duration {
    Duration::from_secs(30 * 24 * 3_600) // 30 days
}

fn max_jitter() -> Duration {
    Duration::from_secs(60)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_apply() {
        let policy = QosPolicy::derive(&Qos::new()).unwrap();
        assert_eq!(policy.chunk_size, 32);
        assert_eq!(policy.max_bps, 0);
        assert_eq!(policy.min_bps, 0);
        assert_eq!(policy.priority, 0);
        assert_eq!(policy.timeout, Duration::from_millis(5_000));
        assert_eq!(policy.ttl, Duration::from_secs(3_600));
    }

    #[test]
    fn test_explicit_parameters() {
        let qos = Qos::new()
            .set(QosParameter::KeyChunkSize, 64)
            .set(QosParameter::Ttl, 5)
            .set(QosParameter::Timeout, 250)
            .set(QosParameter::Priority, 7);
        let policy = QosPolicy::derive(&qos).unwrap();
        assert_eq!(policy.chunk_size, 64);
        assert_eq!(policy.ttl, Duration::from_secs(5));
        assert_eq!(policy.timeout, Duration::from_millis(250));
        assert_eq!(policy.priority, 7);
    }

    #[test]
    fn test_unknown_parameters_ignored() {
        let json = r#"{"key_chunk_size": 16, "flux_capacitance": 88}"#;
        let qos: Qos = serde_json::from_str(json).unwrap();
        let policy = QosPolicy::derive(&qos).unwrap();
        assert_eq!(policy.chunk_size, 16);
    }

    #[test]
    fn test_rejects_zero_chunk() {
        let qos = Qos::new().set(QosParameter::KeyChunkSize, 0);
        assert!(QosPolicy::derive(&qos).is_err());
    }

    #[test]
    fn test_rejects_zero_ttl() {
        let qos = Qos::new().set(QosParameter::Ttl, 0);
        assert!(QosPolicy::derive(&qos).is_err());
    }

    #[test]
    fn test_rejects_oversized_ttl() {
        // Deadlines are now + ttl; an unbounded ttl must never reach the
        // clock arithmetic.
        let qos = Qos::new().set(QosParameter::Ttl, u64::MAX);
        assert!(QosPolicy::derive(&qos).is_err());
    }

    #[test]
    fn test_rejects_oversized_timeout() {
        let qos = Qos::new().set(QosParameter::Timeout, u64::MAX);
        assert!(QosPolicy::derive(&qos).is_err());

        let qos = Qos::new().set(QosParameter::Jitter, u64::MAX);
        assert!(QosPolicy::derive(&qos).is_err());
    }

    #[test]
    fn test_rejects_inverted_rates() {
        let qos = Qos::new()
            .set(QosParameter::MinBps, 2_000)
            .set(QosParameter::MaxBps, 1_000);
        assert!(QosPolicy::derive(&qos).is_err());
    }

    #[test]
    fn test_rejects_out_of_range_priority() {
        let qos = Qos::new().set(QosParameter::Priority, 300);
        assert!(QosPolicy::derive(&qos).is_err());
    }

    #[test]
    fn test_partial_delivery_follows_min_rate() {
        let best_effort = QosPolicy::derive(&Qos::new()).unwrap();
        assert!(best_effort.allows_partial_delivery());

        let contracted = QosPolicy::derive(
            &Qos::new()
                .set(QosParameter::MinBps, 100)
                .set(QosParameter::MaxBps, 1_000),
        )
        .unwrap();
        assert!(!contracted.allows_partial_delivery());
    }

    #[test]
    fn test_refill_allowance() {
        let qos = Qos::new().set(QosParameter::MaxBps, 8_000); // 1000 bytes/sec
        let policy = QosPolicy::derive(&qos).unwrap();
        assert_eq!(policy.refill_allowance(Duration::from_millis(250)), 250);

        let unshaped = QosPolicy::derive(&Qos::new()).unwrap();
        assert_eq!(
            unshaped.refill_allowance(Duration::from_millis(250)),
            usize::MAX
        );
    }

    #[test]
    fn test_buffer_capacity_bounded() {
        let qos = Qos::new().set(QosParameter::KeyChunkSize, 32_768);
        let policy = QosPolicy::derive(&qos).unwrap();
        assert_eq!(policy.buffer_capacity(), crate::MAX_SESSION_BUFFER);
    }
}
