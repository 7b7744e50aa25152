//! Process-wide WAL counters.
//!
//! [`WalFile`](crate::wal::WalFile) counts appends and restarts; the
//! [`WalSession`](crate::session::WalSession) counts transaction outcomes,
//! checkpoints and index recoveries.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

pub static GLOBAL_WAL_METRICS: WalMetrics = WalMetrics::new();

#[derive(Debug)]
pub struct WalMetrics {
    frames_appended_total: AtomicU64,
    /// Frame headers plus page data.
    bytes_appended_total: AtomicU64,
    commits_total: AtomicU64,
    rollbacks_total: AtomicU64,
    checkpoints_total: AtomicU64,
    frames_backfilled_total: AtomicU64,
    /// WAL restarts into a new salt epoch.
    restarts_total: AtomicU64,
    index_recoveries_total: AtomicU64,
}

fn bump(counter: &AtomicU64, by: u64) {
    counter.fetch_add(by, Ordering::Relaxed);
}

impl WalMetrics {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            frames_appended_total: AtomicU64::new(0),
            bytes_appended_total: AtomicU64::new(0),
            commits_total: AtomicU64::new(0),
            rollbacks_total: AtomicU64::new(0),
            checkpoints_total: AtomicU64::new(0),
            frames_backfilled_total: AtomicU64::new(0),
            restarts_total: AtomicU64::new(0),
            index_recoveries_total: AtomicU64::new(0),
        }
    }

    fn counters(&self) -> [&AtomicU64; 8] {
        [
            &self.frames_appended_total,
            &self.bytes_appended_total,
            &self.commits_total,
            &self.rollbacks_total,
            &self.checkpoints_total,
            &self.frames_backfilled_total,
            &self.restarts_total,
            &self.index_recoveries_total,
        ]
    }

    pub fn record_append(&self, frame_bytes: u64) {
        bump(&self.frames_appended_total, 1);
        bump(&self.bytes_appended_total, frame_bytes);
    }

    pub fn record_commit(&self) {
        bump(&self.commits_total, 1);
    }

    pub fn record_rollback(&self) {
        bump(&self.rollbacks_total, 1);
    }

    pub fn record_checkpoint(&self, frames_backfilled: u64) {
        bump(&self.checkpoints_total, 1);
        bump(&self.frames_backfilled_total, frames_backfilled);
    }

    pub fn record_restart(&self) {
        bump(&self.restarts_total, 1);
    }

    pub fn record_index_recovery(&self) {
        bump(&self.index_recoveries_total, 1);
    }

    #[must_use]
    pub fn snapshot(&self) -> WalMetricsSnapshot {
        let [frames, bytes, commits, rollbacks, checkpoints, backfilled, restarts, recoveries] =
            self.counters().map(|c| c.load(Ordering::Relaxed));
        WalMetricsSnapshot {
            frames_appended_total: frames,
            bytes_appended_total: bytes,
            commits_total: commits,
            rollbacks_total: rollbacks,
            checkpoints_total: checkpoints,
            frames_backfilled_total: backfilled,
            restarts_total: restarts,
            index_recoveries_total: recoveries,
        }
    }

    pub fn reset(&self) {
        for counter in self.counters() {
            counter.store(0, Ordering::Relaxed);
        }
    }
}

impl Default for WalMetrics {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct WalMetricsSnapshot {
    pub frames_appended_total: u64,
    pub bytes_appended_total: u64,
    pub commits_total: u64,
    pub rollbacks_total: u64,
    pub checkpoints_total: u64,
    pub frames_backfilled_total: u64,
    pub restarts_total: u64,
    pub index_recoveries_total: u64,
}

impl fmt::Display for WalMetricsSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "frames={} bytes={} commits={} rollbacks={} checkpoints={} backfilled={} \
             restarts={} recoveries={}",
            self.frames_appended_total,
            self.bytes_appended_total,
            self.commits_total,
            self.rollbacks_total,
            self.checkpoints_total,
            self.frames_backfilled_total,
            self.restarts_total,
            self.index_recoveries_total,
        )
    }
}
