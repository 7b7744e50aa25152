//! WAL frame capture for replication.
//!
//! [`CaptureVfs`] wraps a backend VFS. When a write transaction commits, the
//! frames it appended stay in the WAL but the WAL-index header readers use is
//! rolled back to the pre-transaction snapshot and the write lock stays
//! held. A consensus layer then reads the transaction with [`shallow_poll`]
//! or [`poll`] and makes it visible with [`apply`] once it is durable.

pub mod config;
pub mod file;
pub mod metrics;
pub mod state;
pub mod vfs;

pub use config::{CaptureConfig, DEFAULT_VFS_NAME};
pub use file::{CaptureFile, FileRole};
pub use metrics::{CaptureMetrics, CaptureMetricsSnapshot, GLOBAL_CAPTURE_METRICS};
pub use state::{PendingTxn, TxnState, WritingTxn};
pub use vfs::CaptureVfs;

use qlite_error::{QliteError, Result};
use qlite_types::{CapturedFrame, Cx, WalSlice};
use qlite_vfs::{FileControl, FileControlOutcome, VfsFile};

fn unexpected(op: FileControl, outcome: &FileControlOutcome) -> QliteError {
    QliteError::internal(format!("{} returned {outcome:?}", op.name()))
}

/// The slice of the captured transaction, without frame data.
///
/// Works on the main-database and the WAL handle. Fails with
/// [`QliteError::NoPendingTransaction`] unless a transaction is captured.
pub fn shallow_poll<F: VfsFile + ?Sized>(cx: &Cx, file: &mut F) -> Result<WalSlice> {
    match file.file_control(cx, FileControl::ShallowPoll)? {
        FileControlOutcome::Slice(slice) => Ok(slice),
        other => Err(unexpected(FileControl::ShallowPoll, &other)),
    }
}

/// The captured transaction's slice and frames, read back from the WAL.
///
/// WAL handle only.
pub fn poll<F: VfsFile + ?Sized>(cx: &Cx, file: &mut F) -> Result<(WalSlice, Vec<CapturedFrame>)> {
    match file.file_control(cx, FileControl::Poll)? {
        FileControlOutcome::Frames { slice, frames } => Ok((slice, frames)),
        other => Err(unexpected(FileControl::Poll, &other)),
    }
}

/// Make the captured transaction visible and release the write lock.
///
/// Main-database handle of the committing connection only.
pub fn apply<F: VfsFile + ?Sized>(cx: &Cx, file: &mut F) -> Result<()> {
    match file.file_control(cx, FileControl::Apply)? {
        FileControlOutcome::Ack => Ok(()),
        other => Err(unexpected(FileControl::Apply, &other)),
    }
}
