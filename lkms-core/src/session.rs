// SPDX-License-Identifier: MIT
//
// QKD LKMS: ETSI QKD 004 Local Key Management System
//
// https://github.com/yourusername/qkd-lkms

//! Key stream sessions: state machine and registry
//!
//! A [`KeyStreamSession`] is one open key-delivery context between two named
//! endpoints. The [`SessionRegistry`] is the sole owner of all sessions; no
//! key octet is ever referenced by two sessions, and every path into a
//! terminal state wipes the session's buffer before anything else can
//! observe it.
//!
//! All mutation happens on the reactor thread. Deadlines use the tokio
//! clock so timer-driven transitions are testable under paused time;
//! wall-clock timestamps are kept for reporting only.

use crate::buffer::KeyBuffer;
use crate::protocol::{KeyStreamId, Status};
use crate::qos::{Qos, QosPolicy};
use crate::Result;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Lifecycle states of a key stream session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Created, not yet registered
    Opening,
    /// Serving get_key calls
    Active,
    /// Close requested with octets still buffered; wipe is imminent
    Draining,
    /// Closed by the application
    Closed,
    /// TTL deadline passed
    Expired,
    /// Unrecoverable per-session fault
    Failed,
}

impl SessionState {
    /// Terminal states admit no further transitions
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            SessionState::Closed | SessionState::Expired | SessionState::Failed
        )
    }
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            SessionState::Opening => "opening",
            SessionState::Active => "active",
            SessionState::Draining => "draining",
            SessionState::Closed => "closed",
            SessionState::Expired => "expired",
            SessionState::Failed => "failed",
        };
        write!(f, "{name}")
    }
}

/// One open key stream between two endpoints
pub struct KeyStreamSession {
    id: KeyStreamId,
    source: String,
    destination: String,
    qos: Qos,
    policy: QosPolicy,
    state: SessionState,
    buffer: KeyBuffer,
    created_at: DateTime<Utc>,
    last_access_at: DateTime<Utc>,
    ttl_deadline: Instant,
    terminal_at: Option<Instant>,
    bytes_delivered: u64,
    next_index: u32,
}

impl KeyStreamSession {
    fn new(
        id: KeyStreamId,
        source: &str,
        destination: &str,
        qos: Qos,
        policy: QosPolicy,
        now: Instant,
    ) -> Self {
        let created_at = Utc::now();
        let ttl_deadline = now + policy.ttl;
        let buffer = KeyBuffer::new(policy.buffer_capacity());
        Self {
            id,
            source: source.to_string(),
            destination: destination.to_string(),
            qos,
            policy,
            state: SessionState::Opening,
            buffer,
            created_at,
            last_access_at: created_at,
            ttl_deadline,
            terminal_at: None,
            bytes_delivered: 0,
            next_index: 0,
        }
    }

    pub fn id(&self) -> KeyStreamId {
        self.id
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn destination(&self) -> &str {
        &self.destination
    }

    /// QoS mapping captured at open time; immutable for the session lifetime
    pub fn qos(&self) -> &Qos {
        &self.qos
    }

    pub fn policy(&self) -> &QosPolicy {
        &self.policy
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn last_access_at(&self) -> DateTime<Utc> {
        self.last_access_at
    }

    pub fn ttl_deadline(&self) -> Instant {
        self.ttl_deadline
    }

    pub fn bytes_delivered(&self) -> u64 {
        self.bytes_delivered
    }

    /// Octets currently buffered for this stream
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    /// Free buffer space, for the southbound drain
    pub fn buffer_free(&self) -> usize {
        self.buffer.free()
    }

    /// Feed southbound production into the session's buffer
    pub fn refill(&mut self, octets: Vec<u8>) -> Result<usize> {
        self.buffer.push(octets)
    }

    /// Deliver one full chunk if buffered, consuming it
    ///
    /// Returns the chunk sequence index and the octets. `None` when fewer
    /// than a full chunk is available.
    pub fn deliver_chunk(&mut self) -> Option<(u32, Vec<u8>)> {
        if self.buffer.len() < self.policy.chunk_size {
            return None;
        }
        Some(self.deliver(self.policy.chunk_size))
    }

    /// Deliver whatever is buffered, up to one chunk
    ///
    /// Used on timeout for streams whose policy admits partial delivery.
    /// `None` when nothing is buffered.
    pub fn deliver_partial(&mut self) -> Option<(u32, Vec<u8>)> {
        if self.buffer.is_empty() {
            return None;
        }
        Some(self.deliver(self.policy.chunk_size))
    }

    fn deliver(&mut self, n: usize) -> (u32, Vec<u8>) {
        let octets = self.buffer.take(n);
        let index = self.next_index;
        self.next_index = self.next_index.wrapping_add(1);
        self.bytes_delivered += octets.len() as u64;
        self.last_access_at = Utc::now();
        debug_assert!(self.bytes_delivered <= self.buffer.total_in());
        (index, octets)
    }

    /// Record caller activity
    pub fn touch(&mut self) {
        self.last_access_at = Utc::now();
    }

    fn activate(&mut self) {
        debug_assert_eq!(self.state, SessionState::Opening);
        self.state = SessionState::Active;
    }

    /// Force the session into a terminal state, wiping its buffer
    fn enter_terminal(&mut self, terminal: SessionState, now: Instant) {
        debug_assert!(terminal.is_terminal());
        if self.state.is_terminal() {
            return;
        }
        // Close with octets still buffered passes through Draining; pending
        // reads were already cancelled by the reactor, so the drain is
        // immediate.
        if terminal == SessionState::Closed && !self.buffer.is_empty() {
            debug!(stream = %self.id, "session draining {} buffered octets", self.buffer.len());
            self.state = SessionState::Draining;
        }
        self.buffer.clear_secure();
        self.state = terminal;
        self.terminal_at = Some(now);
        info!(stream = %self.id, state = %terminal, "session terminated");
    }
}

impl std::fmt::Debug for KeyStreamSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyStreamSession")
            .field("id", &self.id)
            .field("source", &self.source)
            .field("destination", &self.destination)
            .field("state", &self.state)
            .field("buffered", &self.buffer.len())
            .field("bytes_delivered", &self.bytes_delivered)
            .finish()
    }
}

/// Result of an open attempt that passed validation
#[derive(Debug, PartialEq, Eq)]
pub enum OpenOutcome {
    /// Session registered and Active
    Opened(KeyStreamId),
    /// Rejected with an ETSI status; no session state was created
    Rejected(Status),
}

/// Sole owner of all key stream sessions
pub struct SessionRegistry {
    sessions: HashMap<KeyStreamId, KeyStreamSession>,
    /// Global ceiling over the sum of per-session buffer capacities
    max_total_capacity: usize,
    total_capacity: usize,
    /// Retention window for terminal sessions, for idempotent late closes
    terminal_grace: Duration,
}

impl SessionRegistry {
    pub fn new(max_total_capacity: usize, terminal_grace: Duration) -> Self {
        Self {
            sessions: HashMap::new(),
            max_total_capacity,
            total_capacity: 0,
            terminal_grace,
        }
    }

    /// Open a new key stream
    ///
    /// Validation failures (malformed QoS) surface as `Err` — the call is
    /// rejected before any session state exists. Everything else maps onto
    /// the ETSI status set.
    pub fn open(
        &mut self,
        source: &str,
        destination: &str,
        qos: Qos,
        now: Instant,
    ) -> Result<OpenOutcome> {
        let policy = QosPolicy::derive(&qos)?;
        let capacity = policy.buffer_capacity();

        if self.total_capacity + capacity > self.max_total_capacity {
            warn!(
                "open rejected: buffer ceiling reached ({}/{} octets committed)",
                self.total_capacity, self.max_total_capacity
            );
            return Ok(OpenOutcome::Rejected(Status::InsufficientKeys));
        }

        let id = KeyStreamId::generate();
        if self.sessions.contains_key(&id) {
            // Astronomically unlikely with v4 identifiers, but defined.
            warn!(stream = %id, "identifier collision at open");
            return Ok(OpenOutcome::Rejected(Status::KeyStreamInUse));
        }

        let mut session = KeyStreamSession::new(id, source, destination, qos, policy, now);
        session.activate();
        info!(
            stream = %id,
            source = source,
            destination = destination,
            chunk_size = session.policy.chunk_size,
            ttl_secs = session.policy.ttl.as_secs(),
            "key stream opened"
        );
        self.sessions.insert(id, session);
        self.total_capacity += capacity;
        Ok(OpenOutcome::Opened(id))
    }

    /// Look up a live (non-terminal) session
    pub fn lookup_live(&mut self, id: KeyStreamId) -> Option<&mut KeyStreamSession> {
        self.sessions
            .get_mut(&id)
            .filter(|s| !s.state().is_terminal())
    }

    pub fn get(&self, id: KeyStreamId) -> Option<&KeyStreamSession> {
        self.sessions.get(&id)
    }

    /// Close a key stream; idempotent
    ///
    /// A second close on a terminal session still inside the grace window
    /// returns success and changes nothing. An identifier never seen (or
    /// already purged) gets `no_connection`.
    pub fn close(&mut self, id: KeyStreamId, now: Instant) -> Status {
        let Some(state) = self.sessions.get(&id).map(|s| s.state()) else {
            return Status::NoConnection;
        };
        if state.is_terminal() {
            return Status::Success;
        }
        self.release_capacity(id);
        let session = self.sessions.get_mut(&id).expect("session present");
        session.enter_terminal(SessionState::Closed, now);
        Status::Success
    }

    /// Force a session into Failed, wiping its buffer
    ///
    /// Used for faults that cannot be mapped onto a defined status; fatal to
    /// this session only, never to the process.
    pub fn fail(&mut self, id: KeyStreamId, now: Instant) {
        let live = self
            .sessions
            .get(&id)
            .map(|s| !s.state().is_terminal())
            .unwrap_or(false);
        if live {
            self.release_capacity(id);
            let session = self.sessions.get_mut(&id).expect("session present");
            session.enter_terminal(SessionState::Failed, now);
        }
    }

    /// Expire every live session whose TTL deadline has passed
    ///
    /// Runs on the timer tick, independent of caller activity. Returns the
    /// expired identifiers so the reactor can fail their pending requests.
    pub fn expire_sweep(&mut self, now: Instant) -> Vec<KeyStreamId> {
        let due: Vec<KeyStreamId> = self
            .sessions
            .values()
            .filter(|s| !s.state().is_terminal() && s.ttl_deadline() <= now)
            .map(|s| s.id())
            .collect();
        for id in &due {
            self.release_capacity(*id);
            let session = self.sessions.get_mut(id).expect("session present");
            session.enter_terminal(SessionState::Expired, now);
        }
        due
    }

    /// Drop terminal sessions whose grace window has elapsed
    pub fn purge_terminal(&mut self, now: Instant) {
        let grace = self.terminal_grace;
        self.sessions.retain(|_, session| {
            match session.terminal_at {
                Some(at) => now.duration_since(at) < grace,
                None => true,
            }
        });
    }

    /// Wipe and terminate every live session (shutdown path)
    pub fn wipe_all(&mut self, now: Instant) {
        let live: Vec<KeyStreamId> = self
            .sessions
            .values()
            .filter(|s| !s.state().is_terminal())
            .map(|s| s.id())
            .collect();
        for id in live {
            self.close(id, now);
        }
    }

    /// Live session ids in southbound service order: priority descending,
    /// ties broken by creation time
    pub fn drain_order(&self) -> Vec<KeyStreamId> {
        let mut live: Vec<&KeyStreamSession> = self
            .sessions
            .values()
            .filter(|s| !s.state().is_terminal())
            .collect();
        live.sort_by(|a, b| {
            b.policy
                .priority
                .cmp(&a.policy.priority)
                .then(a.created_at.cmp(&b.created_at))
        });
        live.into_iter().map(|s| s.id()).collect()
    }

    /// Number of live sessions
    pub fn live_count(&self) -> usize {
        self.sessions
            .values()
            .filter(|s| !s.state().is_terminal())
            .count()
    }

    /// Total octets buffered across all sessions
    pub fn total_buffered(&self) -> usize {
        self.sessions.values().map(|s| s.buffered()).sum()
    }

    fn release_capacity(&mut self, id: KeyStreamId) {
        if let Some(session) = self.sessions.get(&id) {
            self.total_capacity = self
                .total_capacity
                .saturating_sub(session.policy.buffer_capacity());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::qos::QosParameter;

    fn registry() -> SessionRegistry {
        SessionRegistry::new(1024 * 1024, Duration::from_secs(30))
    }

    fn open_default(reg: &mut SessionRegistry, now: Instant) -> KeyStreamId {
        match reg.open("sae://a", "sae://b", Qos::new(), now).unwrap() {
            OpenOutcome::Opened(id) => id,
            other => panic!("unexpected outcome: {other:?}"),
        }
    }

    #[test]
    fn test_open_activates() {
        let mut reg = registry();
        let now = Instant::now();
        let id = open_default(&mut reg, now);
        let session = reg.get(id).unwrap();
        assert_eq!(session.state(), SessionState::Active);
        assert_eq!(session.bytes_delivered(), 0);
        assert!(session.ttl_deadline() > now);
    }

    #[test]
    fn test_open_rejects_malformed_qos() {
        let mut reg = registry();
        let qos = Qos::new().set(QosParameter::Ttl, 0);
        assert!(reg.open("a", "b", qos, Instant::now()).is_err());
        assert_eq!(reg.live_count(), 0);
    }

    #[test]
    fn test_open_honors_global_ceiling() {
        let mut reg = SessionRegistry::new(150, Duration::from_secs(30));
        let now = Instant::now();
        // chunk 32 -> capacity 128; a second one would exceed 150.
        open_default(&mut reg, now);
        match reg.open("a", "b", Qos::new(), now).unwrap() {
            OpenOutcome::Rejected(Status::InsufficientKeys) => {}
            other => panic!("unexpected outcome: {other:?}"),
        }
        assert_eq!(reg.live_count(), 1);
    }

    #[test]
    fn test_ceiling_released_on_close() {
        let mut reg = SessionRegistry::new(150, Duration::from_secs(30));
        let now = Instant::now();
        let id = open_default(&mut reg, now);
        reg.close(id, now);
        // Capacity released: a new stream fits again.
        open_default(&mut reg, now);
    }

    #[test]
    fn test_delivery_indices_and_accounting() {
        let mut reg = registry();
        let now = Instant::now();
        let id = open_default(&mut reg, now);
        let session = reg.lookup_live(id).unwrap();
        session.refill((0..64).collect()).unwrap();

        let (i0, first) = session.deliver_chunk().unwrap();
        let (i1, second) = session.deliver_chunk().unwrap();
        assert_eq!((i0, i1), (0, 1));
        assert_eq!(first, (0..32).collect::<Vec<u8>>());
        assert_eq!(second, (32..64).collect::<Vec<u8>>());
        assert_eq!(session.bytes_delivered(), 64);
        assert!(session.deliver_chunk().is_none());
    }

    #[test]
    fn test_close_is_idempotent() {
        let mut reg = registry();
        let now = Instant::now();
        let id = open_default(&mut reg, now);
        assert_eq!(reg.close(id, now), Status::Success);
        assert_eq!(reg.close(id, now), Status::Success);
        assert_eq!(reg.get(id).unwrap().state(), SessionState::Closed);
    }

    #[test]
    fn test_close_unknown_stream() {
        let mut reg = registry();
        assert_eq!(
            reg.close(KeyStreamId::generate(), Instant::now()),
            Status::NoConnection
        );
    }

    #[test]
    fn test_close_wipes_buffer() {
        let mut reg = registry();
        let now = Instant::now();
        let id = open_default(&mut reg, now);
        reg.lookup_live(id).unwrap().refill(vec![5; 48]).unwrap();
        reg.close(id, now);
        assert_eq!(reg.get(id).unwrap().buffered(), 0);
    }

    #[test]
    fn test_expire_sweep() {
        let mut reg = registry();
        let now = Instant::now();
        let qos = Qos::new().set(QosParameter::Ttl, 5);
        let id = match reg.open("a", "b", qos, now).unwrap() {
            OpenOutcome::Opened(id) => id,
            other => panic!("unexpected outcome: {other:?}"),
        };
        reg.lookup_live(id).unwrap().refill(vec![1; 32]).unwrap();

        assert!(reg.expire_sweep(now + Duration::from_secs(4)).is_empty());
        let expired = reg.expire_sweep(now + Duration::from_secs(5));
        assert_eq!(expired, vec![id]);

        let session = reg.get(id).unwrap();
        assert_eq!(session.state(), SessionState::Expired);
        assert_eq!(session.buffered(), 0);
        // Terminal: invisible to live lookups, close remains idempotent.
        assert!(reg.lookup_live(id).is_none());
        assert_eq!(reg.close(id, now + Duration::from_secs(6)), Status::Success);
    }

    #[test]
    fn test_terminal_purge_after_grace() {
        let mut reg = SessionRegistry::new(1024 * 1024, Duration::from_secs(30));
        let now = Instant::now();
        let id = open_default(&mut reg, now);
        reg.close(id, now);

        reg.purge_terminal(now + Duration::from_secs(29));
        assert!(reg.get(id).is_some());

        reg.purge_terminal(now + Duration::from_secs(31));
        assert!(reg.get(id).is_none());
        assert_eq!(reg.close(id, now + Duration::from_secs(31)), Status::NoConnection);
    }

    #[test]
    fn test_drain_order_by_priority() {
        let mut reg = registry();
        let now = Instant::now();
        let low = open_default(&mut reg, now);
        let high = match reg
            .open("a", "b", Qos::new().set(QosParameter::Priority, 9), now)
            .unwrap()
        {
            OpenOutcome::Opened(id) => id,
            other => panic!("unexpected outcome: {other:?}"),
        };
        assert_eq!(reg.drain_order(), vec![high, low]);
    }

    #[test]
    fn test_wipe_all() {
        let mut reg = registry();
        let now = Instant::now();
        let a = open_default(&mut reg, now);
        let b = open_default(&mut reg, now);
        reg.lookup_live(a).unwrap().refill(vec![1; 16]).unwrap();
        reg.wipe_all(now);
        assert_eq!(reg.live_count(), 0);
        assert_eq!(reg.total_buffered(), 0);
        assert_eq!(reg.get(b).unwrap().state(), SessionState::Closed);
    }
}
