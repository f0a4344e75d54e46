// SPDX-License-Identifier: MIT
//
// QKD LKMS: ETSI QKD 004 Local Key Management System
//
// https://github.com/yourusername/qkd-lkms

//! Metrics collection and reporting

use parking_lot::RwLock;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

/// Global metrics collector
#[derive(Clone)]
pub struct Metrics {
    inner: Arc<MetricsInner>,
}

struct MetricsInner {
    start_time: Instant,

    // Session lifecycle
    sessions_opened: AtomicU64,
    sessions_closed: AtomicU64,
    sessions_expired: AtomicU64,
    sessions_failed: AtomicU64,

    // Northbound requests
    requests_total: AtomicU64,
    requests_failed: AtomicU64,
    bytes_delivered: AtomicU64,

    // Southbound pulls
    pulls_total: AtomicU64,
    pulls_failed: AtomicU64,
    bytes_pulled: AtomicU64,

    // Latency tracking (microseconds)
    request_latencies: RwLock<Vec<u64>>,
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

impl Metrics {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(MetricsInner {
                start_time: Instant::now(),
                sessions_opened: AtomicU64::new(0),
                sessions_closed: AtomicU64::new(0),
                sessions_expired: AtomicU64::new(0),
                sessions_failed: AtomicU64::new(0),
                requests_total: AtomicU64::new(0),
                requests_failed: AtomicU64::new(0),
                bytes_delivered: AtomicU64::new(0),
                pulls_total: AtomicU64::new(0),
                pulls_failed: AtomicU64::new(0),
                bytes_pulled: AtomicU64::new(0),
                request_latencies: RwLock::new(Vec::with_capacity(10000)),
            }),
        }
    }

    // Session metrics
    pub fn record_session_opened(&self) {
        self.inner.sessions_opened.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_session_closed(&self) {
        self.inner.sessions_closed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_session_expired(&self) {
        self.inner.sessions_expired.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_session_failed(&self) {
        self.inner.sessions_failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn sessions_opened(&self) -> u64 {
        self.inner.sessions_opened.load(Ordering::Relaxed)
    }

    pub fn sessions_expired(&self) -> u64 {
        self.inner.sessions_expired.load(Ordering::Relaxed)
    }

    // Request metrics
    pub fn record_request(&self, bytes: usize, latency_micros: u64) {
        self.inner.requests_total.fetch_add(1, Ordering::Relaxed);
        self.inner
            .bytes_delivered
            .fetch_add(bytes as u64, Ordering::Relaxed);

        let mut latencies = self.inner.request_latencies.write();
        latencies.push(latency_micros);
        if latencies.len() > 10000 {
            latencies.drain(0..5000);
        }
    }

    pub fn record_request_failure(&self) {
        self.inner.requests_total.fetch_add(1, Ordering::Relaxed);
        self.inner.requests_failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn requests_total(&self) -> u64 {
        self.inner.requests_total.load(Ordering::Relaxed)
    }

    pub fn requests_failed(&self) -> u64 {
        self.inner.requests_failed.load(Ordering::Relaxed)
    }

    pub fn bytes_delivered(&self) -> u64 {
        self.inner.bytes_delivered.load(Ordering::Relaxed)
    }

    // Pull metrics
    pub fn record_pull(&self, bytes: usize) {
        self.inner.pulls_total.fetch_add(1, Ordering::Relaxed);
        self.inner
            .bytes_pulled
            .fetch_add(bytes as u64, Ordering::Relaxed);
    }

    pub fn record_pull_failure(&self) {
        self.inner.pulls_failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn pulls_total(&self) -> u64 {
        self.inner.pulls_total.load(Ordering::Relaxed)
    }

    // Derived metrics
    pub fn uptime_seconds(&self) -> u64 {
        self.inner.start_time.elapsed().as_secs()
    }

    pub fn latency_percentile(&self, percentile: f64) -> Option<u64> {
        let latencies = self.inner.request_latencies.read();
        if latencies.is_empty() {
            return None;
        }

        let mut sorted = latencies.clone();
        sorted.sort_unstable();
        let index = ((sorted.len() as f64 * percentile).ceil() as usize).min(sorted.len() - 1);
        Some(sorted[index])
    }

    pub fn latency_p50(&self) -> Option<u64> {
        self.latency_percentile(0.50)
    }

    pub fn latency_p99(&self) -> Option<u64> {
        self.latency_percentile(0.99)
    }

    /// Generate Prometheus-compatible metrics output
    pub fn prometheus_format(&self) -> String {
        let mut output = String::new();

        let counters = [
            ("lkms_sessions_opened", "Key streams opened", self.sessions_opened()),
            (
                "lkms_sessions_closed",
                "Key streams closed by the application",
                self.inner.sessions_closed.load(Ordering::Relaxed),
            ),
            (
                "lkms_sessions_expired",
                "Key streams expired by TTL",
                self.sessions_expired(),
            ),
            (
                "lkms_sessions_failed",
                "Key streams terminated by faults",
                self.inner.sessions_failed.load(Ordering::Relaxed),
            ),
            ("lkms_requests_total", "Northbound requests", self.requests_total()),
            (
                "lkms_requests_failed",
                "Northbound requests with non-success status",
                self.requests_failed(),
            ),
            (
                "lkms_bytes_delivered",
                "Key octets delivered northbound",
                self.bytes_delivered(),
            ),
            ("lkms_pulls_total", "Southbound pulls", self.pulls_total()),
            (
                "lkms_pulls_failed",
                "Southbound pull failures",
                self.inner.pulls_failed.load(Ordering::Relaxed),
            ),
            (
                "lkms_bytes_pulled",
                "Key octets pulled southbound",
                self.inner.bytes_pulled.load(Ordering::Relaxed),
            ),
        ];

        for (name, help, value) in counters {
            output.push_str(&format!("# HELP {name} {help}\n"));
            output.push_str(&format!("# TYPE {name} counter\n"));
            output.push_str(&format!("{name} {value}\n"));
        }

        output.push_str("# HELP lkms_uptime_seconds Service uptime in seconds\n");
        output.push_str("# TYPE lkms_uptime_seconds gauge\n");
        output.push_str(&format!("lkms_uptime_seconds {}\n", self.uptime_seconds()));

        if let Some(p50) = self.latency_p50() {
            output.push_str("# HELP lkms_latency_p50_microseconds Request latency 50th percentile\n");
            output.push_str("# TYPE lkms_latency_p50_microseconds gauge\n");
            output.push_str(&format!("lkms_latency_p50_microseconds {p50}\n"));
        }

        if let Some(p99) = self.latency_p99() {
            output.push_str("# HELP lkms_latency_p99_microseconds Request latency 99th percentile\n");
            output.push_str("# TYPE lkms_latency_p99_microseconds gauge\n");
            output.push_str(&format!("lkms_latency_p99_microseconds {p99}\n"));
        }

        output
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters() {
        let metrics = Metrics::new();

        metrics.record_session_opened();
        metrics.record_request(32, 100);
        metrics.record_request(32, 200);
        metrics.record_request_failure();

        assert_eq!(metrics.sessions_opened(), 1);
        assert_eq!(metrics.requests_total(), 3);
        assert_eq!(metrics.requests_failed(), 1);
        assert_eq!(metrics.bytes_delivered(), 64);
    }

    #[test]
    fn test_latency_percentiles() {
        let metrics = Metrics::new();
        for i in 1..=100 {
            metrics.record_request(32, i);
        }

        let p50 = metrics.latency_p50().unwrap();
        assert!((45..=55).contains(&p50));

        let p99 = metrics.latency_p99().unwrap();
        assert!((95..=100).contains(&p99));
    }

    #[test]
    fn test_prometheus_format() {
        let metrics = Metrics::new();
        metrics.record_session_opened();
        let text = metrics.prometheus_format();
        assert!(text.contains("lkms_sessions_opened 1"));
        assert!(text.contains("lkms_uptime_seconds"));
    }
}
