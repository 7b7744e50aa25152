//! Capture counters.
//!
//! Global `AtomicU64` counters in the same style as the WAL metrics, bumped
//! on state transitions of the capture state machine.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

/// Global capture metrics singleton.
pub static GLOBAL_CAPTURE_METRICS: CaptureMetrics = CaptureMetrics::new();

pub struct CaptureMetrics {
    /// Transactions that reached the captured state.
    pub txns_captured_total: AtomicU64,
    /// Frames covered by captured slices.
    pub frames_captured_total: AtomicU64,
    /// `shallow_poll` and `poll` calls that returned a slice.
    pub polls_total: AtomicU64,
    pub applies_total: AtomicU64,
    /// Write or checkpoint lock requests refused while a transaction was
    /// captured.
    pub writers_rejected_total: AtomicU64,
}

impl CaptureMetrics {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            txns_captured_total: AtomicU64::new(0),
            frames_captured_total: AtomicU64::new(0),
            polls_total: AtomicU64::new(0),
            applies_total: AtomicU64::new(0),
            writers_rejected_total: AtomicU64::new(0),
        }
    }

    pub fn record_capture(&self, frames: u64) {
        self.txns_captured_total.fetch_add(1, Ordering::Relaxed);
        self.frames_captured_total
            .fetch_add(frames, Ordering::Relaxed);
    }

    pub fn record_poll(&self) {
        self.polls_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_apply(&self) {
        self.applies_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_rejected_writer(&self) {
        self.writers_rejected_total.fetch_add(1, Ordering::Relaxed);
    }

    #[must_use]
    pub fn snapshot(&self) -> CaptureMetricsSnapshot {
        CaptureMetricsSnapshot {
            txns_captured_total: self.txns_captured_total.load(Ordering::Relaxed),
            frames_captured_total: self.frames_captured_total.load(Ordering::Relaxed),
            polls_total: self.polls_total.load(Ordering::Relaxed),
            applies_total: self.applies_total.load(Ordering::Relaxed),
            writers_rejected_total: self.writers_rejected_total.load(Ordering::Relaxed),
        }
    }

    pub fn reset(&self) {
        self.txns_captured_total.store(0, Ordering::Relaxed);
        self.frames_captured_total.store(0, Ordering::Relaxed);
        self.polls_total.store(0, Ordering::Relaxed);
        self.applies_total.store(0, Ordering::Relaxed);
        self.writers_rejected_total.store(0, Ordering::Relaxed);
    }
}

impl Default for CaptureMetrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Point-in-time snapshot of capture metrics.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CaptureMetricsSnapshot {
    pub txns_captured_total: u64,
    pub frames_captured_total: u64,
    pub polls_total: u64,
    pub applies_total: u64,
    pub writers_rejected_total: u64,
}

impl fmt::Display for CaptureMetricsSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "captured_txns={} captured_frames={} polls={} applies={} rejected_writers={}",
            self.txns_captured_total,
            self.frames_captured_total,
            self.polls_total,
            self.applies_total,
            self.writers_rejected_total,
        )
    }
}
