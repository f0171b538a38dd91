//! Observability and Metrics
//!
//! Counters for the data path: frames, drops, regions and pull traffic.
//!
//! Uses atomic counters for thread-safe metrics collection. Malformed frames
//! and stale replies are never errors to the application, so these counters are
//! the only place they surface.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;
use tracing::{debug, info};

/// Metrics collector shared by a NIC, its endpoints and their region tables
#[derive(Debug)]
pub struct Metrics {
    /// Frames handed to the transport
    pub frames_sent: AtomicU64,
    /// Frames received from the transport
    pub frames_received: AtomicU64,
    /// Frames dropped as malformed
    pub malformed_dropped: AtomicU64,
    /// Frames dropped for a bad endpoint, session or generation
    pub misrouted_dropped: AtomicU64,
    /// Frames the transport refused to send
    pub send_errors: AtomicU64,
    /// Messages posted for sending
    pub messages_sent: AtomicU64,
    /// Messages delivered to a posted receive
    pub messages_received: AtomicU64,
    /// Pull requests issued
    pub pulls_issued: AtomicU64,
    /// Pull requests serviced
    pub pulls_serviced: AtomicU64,
    /// Pull requests refused (bad region or range)
    pub pulls_refused: AtomicU64,
    /// Pull contexts that completed
    pub pulls_completed: AtomicU64,
    /// Pull contexts abandoned on timeout, nack or teardown
    pub pulls_abandoned: AtomicU64,
    /// Pull reply bytes accepted into regions
    pub pull_bytes: AtomicU64,
    /// Replies discarded as stale or duplicate
    pub stale_replies: AtomicU64,
    /// Regions registered
    pub regions_registered: AtomicU64,
    /// Regions destroyed
    pub regions_destroyed: AtomicU64,
    /// Start time for uptime calculation
    start_time: Instant,
}

impl Metrics {
    /// Create a new metrics collector
    pub fn new() -> Self {
        Self {
            frames_sent: AtomicU64::new(0),
            frames_received: AtomicU64::new(0),
            malformed_dropped: AtomicU64::new(0),
            misrouted_dropped: AtomicU64::new(0),
            send_errors: AtomicU64::new(0),
            messages_sent: AtomicU64::new(0),
            messages_received: AtomicU64::new(0),
            pulls_issued: AtomicU64::new(0),
            pulls_serviced: AtomicU64::new(0),
            pulls_refused: AtomicU64::new(0),
            pulls_completed: AtomicU64::new(0),
            pulls_abandoned: AtomicU64::new(0),
            pull_bytes: AtomicU64::new(0),
            stale_replies: AtomicU64::new(0),
            regions_registered: AtomicU64::new(0),
            regions_destroyed: AtomicU64::new(0),
            start_time: Instant::now(),
        }
    }

    pub fn frame_sent(&self) {
        self.frames_sent.fetch_add(1, Ordering::Relaxed);
    }

    pub fn frame_received(&self) {
        self.frames_received.fetch_add(1, Ordering::Relaxed);
    }

    pub fn malformed(&self) {
        self.malformed_dropped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn misrouted(&self) {
        self.misrouted_dropped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn send_error(&self) {
        self.send_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn message_sent(&self) {
        self.messages_sent.fetch_add(1, Ordering::Relaxed);
    }

    pub fn message_received(&self) {
        self.messages_received.fetch_add(1, Ordering::Relaxed);
    }

    pub fn pull_issued(&self) {
        self.pulls_issued.fetch_add(1, Ordering::Relaxed);
    }

    pub fn pull_serviced(&self) {
        self.pulls_serviced.fetch_add(1, Ordering::Relaxed);
    }

    pub fn pull_refused(&self) {
        self.pulls_refused.fetch_add(1, Ordering::Relaxed);
    }

    pub fn pull_completed(&self) {
        self.pulls_completed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn pull_abandoned(&self) {
        self.pulls_abandoned.fetch_add(1, Ordering::Relaxed);
    }

    pub fn pull_bytes_accepted(&self, n: u64) {
        self.pull_bytes.fetch_add(n, Ordering::Relaxed);
    }

    pub fn stale_reply(&self) {
        self.stale_replies.fetch_add(1, Ordering::Relaxed);
    }

    pub fn region_registered(&self) {
        self.regions_registered.fetch_add(1, Ordering::Relaxed);
    }

    pub fn region_destroyed(&self) {
        self.regions_destroyed.fetch_add(1, Ordering::Relaxed);
    }

    /// Get current metrics snapshot
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            frames_sent: self.frames_sent.load(Ordering::Relaxed),
            frames_received: self.frames_received.load(Ordering::Relaxed),
            malformed_dropped: self.malformed_dropped.load(Ordering::Relaxed),
            misrouted_dropped: self.misrouted_dropped.load(Ordering::Relaxed),
            send_errors: self.send_errors.load(Ordering::Relaxed),
            messages_sent: self.messages_sent.load(Ordering::Relaxed),
            messages_received: self.messages_received.load(Ordering::Relaxed),
            pulls_issued: self.pulls_issued.load(Ordering::Relaxed),
            pulls_serviced: self.pulls_serviced.load(Ordering::Relaxed),
            pulls_refused: self.pulls_refused.load(Ordering::Relaxed),
            pulls_completed: self.pulls_completed.load(Ordering::Relaxed),
            pulls_abandoned: self.pulls_abandoned.load(Ordering::Relaxed),
            pull_bytes: self.pull_bytes.load(Ordering::Relaxed),
            stale_replies: self.stale_replies.load(Ordering::Relaxed),
            regions_registered: self.regions_registered.load(Ordering::Relaxed),
            regions_destroyed: self.regions_destroyed.load(Ordering::Relaxed),
            uptime_seconds: self.start_time.elapsed().as_secs(),
        }
    }

    /// Log current metrics
    pub fn log_metrics(&self) {
        let snapshot = self.snapshot();
        info!(
            frames_sent = snapshot.frames_sent,
            frames_received = snapshot.frames_received,
            malformed_dropped = snapshot.malformed_dropped,
            misrouted_dropped = snapshot.misrouted_dropped,
            send_errors = snapshot.send_errors,
            messages_sent = snapshot.messages_sent,
            messages_received = snapshot.messages_received,
            pulls_issued = snapshot.pulls_issued,
            pulls_serviced = snapshot.pulls_serviced,
            pulls_refused = snapshot.pulls_refused,
            pulls_completed = snapshot.pulls_completed,
            pulls_abandoned = snapshot.pulls_abandoned,
            pull_bytes = snapshot.pull_bytes,
            stale_replies = snapshot.stale_replies,
            regions_registered = snapshot.regions_registered,
            regions_destroyed = snapshot.regions_destroyed,
            uptime_seconds = snapshot.uptime_seconds,
            "MX metrics snapshot"
        );
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Snapshot of metrics at a point in time
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MetricsSnapshot {
    pub frames_sent: u64,
    pub frames_received: u64,
    pub malformed_dropped: u64,
    pub misrouted_dropped: u64,
    pub send_errors: u64,
    pub messages_sent: u64,
    pub messages_received: u64,
    pub pulls_issued: u64,
    pub pulls_serviced: u64,
    pub pulls_refused: u64,
    pub pulls_completed: u64,
    pub pulls_abandoned: u64,
    pub pull_bytes: u64,
    pub stale_replies: u64,
    pub regions_registered: u64,
    pub regions_destroyed: u64,
    pub uptime_seconds: u64,
}

/// Process-wide metrics instance (lazy static for simplicity)
static METRICS: once_cell::sync::Lazy<std::sync::Arc<Metrics>> =
    once_cell::sync::Lazy::new(|| std::sync::Arc::new(Metrics::new()));

/// Get the process-wide metrics instance, shared by NICs opened without
/// their own collector
pub fn global_metrics() -> std::sync::Arc<Metrics> {
    METRICS.clone()
}

/// Timer for measuring operation duration
pub struct Timer {
    start: Instant,
    operation: &'static str,
}

impl Timer {
    /// Start timing an operation
    pub fn start(operation: &'static str) -> Self {
        Self {
            start: Instant::now(),
            operation,
        }
    }
}

impl Drop for Timer {
    fn drop(&mut self) {
        let duration = self.start.elapsed();
        debug!(
            operation = self.operation,
            duration_us = duration.as_micros() as u64,
            "Operation completed"
        );
    }
}
