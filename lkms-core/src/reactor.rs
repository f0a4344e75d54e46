// SPDX-License-Identifier: MIT
//
// QKD LKMS: ETSI QKD 004 Local Key Management System
//
// https://github.com/yourusername/qkd-lkms

//! Single-threaded reactor driving the session lifecycle
//!
//! The reactor owns the [`SessionRegistry`] and the southbound [`KeySource`]
//! outright; every state transition happens on its task, so nothing needs a
//! lock and nothing may block. Northbound adapters talk to it through a
//! [`ReactorHandle`]: each API call is a command carrying a oneshot reply.
//!
//! A get_key that cannot be satisfied immediately is not executed to
//! completion; it is parked as a pending response and resumed on a later
//! tick once the buffer fills, or failed when its deadline passes. Pending
//! requests are FIFO per stream; across streams the QoS priority decides,
//! ties broken by arrival. Timeout resolution is bounded by the tick
//! interval, not sub-tick-precise.
//!
//! Shutdown is itself a command posted into the queue — nothing stops the
//! loop from outside its own execution context. On shutdown the reactor
//! fails all pending requests, wipes every session buffer and exits.

use crate::config::LkmsConfig;
use crate::metrics::Metrics;
use crate::protocol::{KeyStreamId, Status};
use crate::qos::Qos;
use crate::session::{OpenOutcome, SessionRegistry};
use crate::southbound::{KeySource, LinkStatus};
use crate::{Error, Result};
use std::cmp::Reverse;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{interval, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

/// Reply to an `open` call; `Err` means call-level validation rejection
pub type OpenReply = Result<(Option<KeyStreamId>, Status)>;

/// Reply to a `get_key` call: chunk index, key octets, status
pub type GetKeyReply = (u32, Vec<u8>, Status);

/// Commands accepted by the reactor
pub enum Command {
    Open {
        source: String,
        destination: String,
        qos: Qos,
        reply: oneshot::Sender<OpenReply>,
    },
    GetKey {
        stream: KeyStreamId,
        reply: oneshot::Sender<GetKeyReply>,
    },
    Close {
        stream: KeyStreamId,
        reply: oneshot::Sender<Status>,
    },
    Snapshot {
        reply: oneshot::Sender<ReactorSnapshot>,
    },
    Shutdown,
}

/// Point-in-time view of the reactor's state, for status reporting
#[derive(Debug, Clone)]
pub struct ReactorSnapshot {
    /// Live (non-terminal) sessions
    pub live_sessions: usize,
    /// Key octets buffered across all sessions
    pub buffered_bytes: usize,
    /// get_key requests currently deferred
    pub pending_requests: usize,
}

/// Cloneable handle used by northbound adapters
#[derive(Clone)]
pub struct ReactorHandle {
    tx: mpsc::Sender<Command>,
}

impl ReactorHandle {
    pub async fn open(&self, source: String, destination: String, qos: Qos) -> OpenReply {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(Command::Open {
                source,
                destination,
                qos,
                reply,
            })
            .await
            .map_err(|_| reactor_gone())?;
        rx.await.map_err(|_| reactor_gone())?
    }

    pub async fn get_key(&self, stream: KeyStreamId) -> Result<GetKeyReply> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(Command::GetKey { stream, reply })
            .await
            .map_err(|_| reactor_gone())?;
        rx.await.map_err(|_| reactor_gone())
    }

    pub async fn close(&self, stream: KeyStreamId) -> Result<Status> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(Command::Close { stream, reply })
            .await
            .map_err(|_| reactor_gone())?;
        rx.await.map_err(|_| reactor_gone())
    }

    pub async fn snapshot(&self) -> Result<ReactorSnapshot> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(Command::Snapshot { reply })
            .await
            .map_err(|_| reactor_gone())?;
        rx.await.map_err(|_| reactor_gone())
    }

    /// Post a shutdown command into the reactor's queue
    pub async fn shutdown(&self) {
        let _ = self.tx.send(Command::Shutdown).await;
    }
}

fn reactor_gone() -> Error {
    Error::Internal("reactor is not running".to_string())
}

/// Reactor tuning knobs
#[derive(Debug, Clone)]
pub struct ReactorConfig {
    /// Timer tick; bounds TTL and timeout resolution
    pub tick_interval: Duration,
    /// Global ceiling over committed buffer capacity
    pub max_buffer_total: usize,
    /// Retention window for terminal sessions
    pub terminal_grace: Duration,
    /// Northbound commands processed per wake-up
    pub command_batch: usize,
}

impl Default for ReactorConfig {
    fn default() -> Self {
        Self {
            tick_interval: Duration::from_millis(250),
            max_buffer_total: crate::DEFAULT_BUFFER_TOTAL,
            terminal_grace: Duration::from_secs(30),
            command_batch: 32,
        }
    }
}

impl From<&LkmsConfig> for ReactorConfig {
    fn from(config: &LkmsConfig) -> Self {
        Self {
            tick_interval: config.tick_interval(),
            max_buffer_total: config.max_buffer_total,
            terminal_grace: config.terminal_grace(),
            command_batch: config.command_batch,
        }
    }
}

/// A parked get_key awaiting buffered octets or its deadline
struct PendingGet {
    stream: KeyStreamId,
    deadline: Instant,
    enqueued: Instant,
    seq: u64,
    reply: oneshot::Sender<GetKeyReply>,
}

/// The reactor itself; owns all session state
pub struct Reactor<S: KeySource> {
    cfg: ReactorConfig,
    commands: mpsc::Receiver<Command>,
    registry: SessionRegistry,
    source: S,
    metrics: Metrics,
    pending: Vec<PendingGet>,
    next_seq: u64,
}

impl<S: KeySource> Reactor<S> {
    /// Create a reactor and its handle
    pub fn new(cfg: ReactorConfig, source: S, metrics: Metrics) -> (Self, ReactorHandle) {
        let (tx, commands) = mpsc::channel(256);
        let registry = SessionRegistry::new(cfg.max_buffer_total, cfg.terminal_grace);
        (
            Self {
                cfg,
                commands,
                registry,
                source,
                metrics,
                pending: Vec::new(),
                next_seq: 0,
            },
            ReactorHandle { tx },
        )
    }

    /// Run until shutdown; consumes the reactor
    pub async fn run(mut self) {
        let mut ticker = interval(self.cfg.tick_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!(
            "reactor started, tick interval {:?}",
            self.cfg.tick_interval
        );

        'outer: loop {
            tokio::select! {
                maybe = self.commands.recv() => {
                    let Some(command) = maybe else { break 'outer };
                    if !self.dispatch(command) {
                        break 'outer;
                    }
                    // Process a bounded batch before yielding to the timer.
                    for _ in 1..self.cfg.command_batch {
                        match self.commands.try_recv() {
                            Ok(command) => {
                                if !self.dispatch(command) {
                                    break 'outer;
                                }
                            }
                            Err(_) => break,
                        }
                    }
                }
                _ = ticker.tick() => self.on_tick(),
            }
        }

        self.stop();
    }

    /// Returns false when the reactor must stop
    fn dispatch(&mut self, command: Command) -> bool {
        match command {
            Command::Open {
                source,
                destination,
                qos,
                reply,
            } => {
                let _ = reply.send(self.handle_open(&source, &destination, qos));
                true
            }
            Command::GetKey { stream, reply } => {
                self.handle_get_key(stream, reply);
                true
            }
            Command::Close { stream, reply } => {
                let _ = reply.send(self.handle_close(stream));
                true
            }
            Command::Snapshot { reply } => {
                let _ = reply.send(ReactorSnapshot {
                    live_sessions: self.registry.live_count(),
                    buffered_bytes: self.registry.total_buffered(),
                    pending_requests: self.pending.len(),
                });
                true
            }
            Command::Shutdown => false,
        }
    }

    fn handle_open(&mut self, source: &str, destination: &str, qos: Qos) -> OpenReply {
        let now = Instant::now();
        match self.registry.open(source, destination, qos, now)? {
            OpenOutcome::Opened(id) => {
                self.metrics.record_session_opened();
                Ok((Some(id), Status::Success))
            }
            OpenOutcome::Rejected(status) => Ok((None, status)),
        }
    }

    fn handle_get_key(&mut self, stream: KeyStreamId, reply: oneshot::Sender<GetKeyReply>) {
        let now = Instant::now();
        let link = self.source.status();

        let Some(session) = self.registry.lookup_live(stream) else {
            self.metrics.record_request_failure();
            let _ = reply.send((0, Vec::new(), Status::NoConnection));
            return;
        };
        session.touch();
        let timeout = session.policy().timeout;

        // Requests already parked for this stream are served first; a
        // newcomer must queue behind them, never overtake.
        let must_queue = self.pending.iter().any(|p| p.stream == stream);

        // Fast path: a full chunk is already buffered.
        if !must_queue {
            if let Some((index, octets)) = session.deliver_chunk() {
                self.metrics.record_request(octets.len(), 0);
                let _ = reply.send((index, octets, Status::Success));
                return;
            }
        }

        if link == LinkStatus::Unavailable {
            // Permanent unavailability: this stream cannot be served again.
            warn!(stream = %stream, "southbound link unavailable, failing session");
            self.metrics.record_session_failed();
            self.metrics.record_request_failure();
            self.registry.fail(stream, now);
            self.fail_pending_for(stream, Status::NoConnection);
            let _ = reply.send((0, Vec::new(), Status::NoConnection));
            return;
        }

        // Try to cover the shortfall with an immediate southbound pull.
        if !must_queue {
            let want = session
                .policy()
                .chunk_size
                .saturating_sub(session.buffered())
                .min(session.buffer_free());
            if want > 0 {
                let octets = self.source.pull(want);
                if !octets.is_empty() {
                    self.metrics.record_pull(octets.len());
                    if let Err(e) = session.refill(octets) {
                        warn!(stream = %stream, "refill failed: {e}");
                    }
                }
            }
            if let Some((index, octets)) = session.deliver_chunk() {
                self.metrics.record_request(octets.len(), 0);
                let _ = reply.send((index, octets, Status::Success));
                return;
            }
        }

        // Defer: resumed by a later tick, or failed at the deadline.
        let deadline = now + timeout;
        let seq = self.next_seq;
        self.next_seq += 1;
        debug!(stream = %stream, seq = seq, "get_key deferred");
        self.pending.push(PendingGet {
            stream,
            deadline,
            enqueued: now,
            seq,
            reply,
        });
    }

    fn handle_close(&mut self, stream: KeyStreamId) -> Status {
        let now = Instant::now();
        // A close cancels anything still parked for the stream.
        self.fail_pending_for(stream, Status::NoConnection);
        let status = self.registry.close(stream, now);
        if status == Status::Success {
            self.metrics.record_session_closed();
        }
        status
    }

    /// One timer tick: drain southbound, sweep TTLs, resume or expire
    /// deferred requests, purge stale terminal entries
    fn on_tick(&mut self) {
        let now = Instant::now();
        self.drain_south();
        for stream in self.registry.expire_sweep(now) {
            self.metrics.record_session_expired();
            self.fail_pending_for(stream, Status::NoConnection);
        }
        self.resolve_pending(now);
        self.expire_pending(now);
        self.registry.purge_terminal(now);
    }

    /// Route available southbound production into session buffers,
    /// highest priority first, respecting capacity and rate ceilings
    fn drain_south(&mut self) {
        if self.source.status() == LinkStatus::Unavailable {
            return;
        }
        for stream in self.registry.drain_order() {
            let Some(session) = self.registry.lookup_live(stream) else {
                continue;
            };
            let allowance = session.policy().refill_allowance(self.cfg.tick_interval);
            let want = session.buffer_free().min(allowance);
            if want == 0 {
                continue;
            }
            let octets = self.source.pull(want);
            if octets.is_empty() {
                // Source is dry; lower-priority streams get nothing either.
                break;
            }
            let n = octets.len();
            match session.refill(octets) {
                Ok(_) => self.metrics.record_pull(n),
                Err(e) => {
                    self.metrics.record_pull_failure();
                    warn!(stream = %stream, "southbound backpressure: {e}");
                }
            }
        }
    }

    /// Deliver parked requests that have become satisfiable
    fn resolve_pending(&mut self, now: Instant) {
        if self.pending.is_empty() {
            return;
        }
        // Service order: priority descending, then arrival. Same-stream
        // requests share a priority, so FIFO per stream is preserved.
        let registry = &self.registry;
        self.pending.sort_by_key(|p| {
            let priority = registry
                .get(p.stream)
                .map(|s| s.policy().priority)
                .unwrap_or(0);
            (Reverse(priority), p.seq)
        });

        let mut still_pending = Vec::new();
        for p in std::mem::take(&mut self.pending) {
            let Some(session) = self.registry.lookup_live(p.stream) else {
                self.metrics.record_request_failure();
                let _ = p.reply.send((0, Vec::new(), Status::NoConnection));
                continue;
            };
            match session.deliver_chunk() {
                Some((index, octets)) => {
                    let latency = now.duration_since(p.enqueued).as_micros() as u64;
                    self.metrics.record_request(octets.len(), latency);
                    let _ = p.reply.send((index, octets, Status::Success));
                }
                None => still_pending.push(p),
            }
        }
        self.pending = still_pending;
    }

    /// Fail or partially satisfy requests whose deadline has passed
    fn expire_pending(&mut self, now: Instant) {
        let mut still_pending = Vec::new();
        for p in std::mem::take(&mut self.pending) {
            if p.deadline > now {
                still_pending.push(p);
                continue;
            }
            let allows_partial = self
                .registry
                .get(p.stream)
                .filter(|s| !s.state().is_terminal())
                .map(|s| s.policy().allows_partial_delivery());
            let delivered = if allows_partial == Some(true) {
                self.registry
                    .lookup_live(p.stream)
                    .and_then(|s| s.deliver_partial())
            } else {
                None
            };
            match delivered {
                Some((index, octets)) => {
                    debug!(stream = %p.stream, "timeout with partial delivery of {} octets", octets.len());
                    let latency = now.duration_since(p.enqueued).as_micros() as u64;
                    self.metrics.record_request(octets.len(), latency);
                    let _ = p.reply.send((index, octets, Status::Success));
                }
                None => {
                    if allows_partial == Some(false) {
                        // Minimum-rate contract missed within the window:
                        // the stream cannot honor its QoS and is failed.
                        warn!(stream = %p.stream, "rate contract missed, failing session");
                        self.metrics.record_session_failed();
                        self.registry.fail(p.stream, now);
                    }
                    // No partial leakage: timeout returns zero octets.
                    self.metrics.record_request_failure();
                    let _ = p.reply.send((0, Vec::new(), Status::Timeout));
                }
            }
        }
        self.pending = still_pending;
    }

    fn fail_pending_for(&mut self, stream: KeyStreamId, status: Status) {
        let mut still_pending = Vec::new();
        for p in std::mem::take(&mut self.pending) {
            if p.stream == stream {
                self.metrics.record_request_failure();
                let _ = p.reply.send((0, Vec::new(), status));
            } else {
                still_pending.push(p);
            }
        }
        self.pending = still_pending;
    }

    /// Final wipe: no new northbound work, pending requests failed,
    /// every buffer zeroized
    fn stop(&mut self) {
        let now = Instant::now();
        info!(
            "reactor stopping: {} pending requests, {} live sessions",
            self.pending.len(),
            self.registry.live_count()
        );
        for p in std::mem::take(&mut self.pending) {
            let _ = p.reply.send((0, Vec::new(), Status::NoConnection));
        }
        self.registry.wipe_all(now);
    }
}
