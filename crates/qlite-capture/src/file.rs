//! [`CaptureFile`]: the file handle handed out by [`CaptureVfs`](crate::CaptureVfs).
//!
//! WAL writes are classified and fed to the shared [`Tracker`]; the WAL
//! write lock is observed through `shm_lock`. When the engine releases the
//! write lock after a commit, the engine's new WAL-index header is set aside
//! and the pre-transaction header is put back, so readers keep their old
//! snapshot while the backend lock stays held. `apply` publishes the header
//! and releases the lock.
//!
//! Dropping the committing handle while its transaction is captured does not
//! discard the transaction: the backend file moves into the tracker, keeping
//! the write lock, and any main-database handle of the database can apply.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use qlite_error::{QliteError, Result};
use qlite_types::flags::{ShmLockFlags, SyncFlags};
use qlite_types::{CapturedFrame, Cx, LockLevel, WalSlice};
use qlite_vfs::{FileControl, FileControlOutcome, ShmRegion, VfsFile, SHM_REGION_SIZE};
use qlite_wal::{
    frame_offset, read_index_hdr_bytes, write_index_hdr_bytes, WalFrameHeader, WAL_CKPT_LOCK,
    WAL_FRAME_HEADER_SIZE, WAL_WRITE_LOCK,
};
use tracing::{debug, debug_span, error, warn};

use crate::config::CaptureConfig;
use crate::metrics::GLOBAL_CAPTURE_METRICS;
use crate::state::{ReleaseDecision, Tracker, TxnState, WalWrite};

static NEXT_CAPTURE_HANDLE: AtomicU64 = AtomicU64::new(1);

/// What a handle is to its database.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileRole {
    MainDb,
    Wal,
    /// Journals, temp files and anything else: passed through untouched.
    Other,
}

/// A file opened through the capture VFS.
pub struct CaptureFile<F: VfsFile + 'static> {
    /// Only `None` while the handle is being dropped.
    inner: Option<F>,
    id: u64,
    role: FileRole,
    tracker: Option<Arc<Mutex<Tracker>>>,
    /// Region 0 of the WAL index, mapped on first use.
    region: Option<ShmRegion>,
    page_size: usize,
    frame_size: usize,
}

impl<F: VfsFile + 'static> CaptureFile<F> {
    pub(crate) fn new(
        inner: F,
        role: FileRole,
        tracker: Option<Arc<Mutex<Tracker>>>,
        config: &CaptureConfig,
    ) -> Self {
        Self {
            inner: Some(inner),
            id: NEXT_CAPTURE_HANDLE.fetch_add(1, Ordering::Relaxed),
            role,
            tracker,
            region: None,
            page_size: config.page_size.as_usize(),
            frame_size: config.frame_size(),
        }
    }

    #[must_use]
    pub const fn id(&self) -> u64 {
        self.id
    }

    #[must_use]
    pub const fn role(&self) -> FileRole {
        self.role
    }

    fn file(&self) -> Result<&F> {
        self.inner.as_ref().ok_or_else(released)
    }

    fn file_mut(&mut self) -> Result<&mut F> {
        self.inner.as_mut().ok_or_else(released)
    }

    /// Current state of this handle's database, if it is tracked.
    #[must_use]
    pub fn txn_state(&self) -> Option<TxnState> {
        self.tracker.as_ref().map(|t| t.lock().state().clone())
    }

    /// Whether both handles belong to the same tracked database.
    #[must_use]
    pub fn shares_tracker_with(&self, other: &Self) -> bool {
        match (&self.tracker, &other.tracker) {
            (Some(a), Some(b)) => Arc::ptr_eq(a, b),
            _ => false,
        }
    }

    fn region(&mut self, cx: &Cx) -> Result<ShmRegion> {
        if let Some(region) = &self.region {
            return Ok(region.clone());
        }
        let region = self
            .file_mut()?
            .shm_map(cx, 0, SHM_REGION_SIZE, true)?
            .ok_or_else(|| QliteError::internal("WAL index region 0 unavailable"))?;
        self.region = Some(region.clone());
        Ok(region)
    }

    fn lock_shm(
        &mut self,
        cx: &Cx,
        tracker: &Mutex<Tracker>,
        offset: u32,
        n: u32,
        flags: ShmLockFlags,
    ) -> Result<()> {
        let covers = |slot: u32| slot >= offset && slot - offset < n;
        let write_slot = covers(WAL_WRITE_LOCK);

        if flags == ShmLockFlags::LOCK_EXCLUSIVE {
            let region = if write_slot {
                Some(self.region(cx)?)
            } else {
                None
            };
            let mut state = tracker.lock();
            if let Err(err) = state.check_exclusive_lock(write_slot, covers(WAL_CKPT_LOCK)) {
                GLOBAL_CAPTURE_METRICS.record_rejected_writer();
                return Err(err);
            }
            self.file_mut()?.shm_lock(cx, offset, n, flags)?;
            if let Some(region) = region {
                state.begin_write(self.id, read_index_hdr_bytes(&region));
            }
            return Ok(());
        }

        if flags != ShmLockFlags::UNLOCK_EXCLUSIVE || !write_slot {
            return self.file_mut()?.shm_lock(cx, offset, n, flags);
        }

        let mut state = tracker.lock();
        match state.release_write(self.id) {
            ReleaseDecision::Forward => self.file_mut()?.shm_lock(cx, offset, n, flags),
            ReleaseDecision::Rollback => {
                self.file_mut()?.shm_lock(cx, offset, n, flags)?;
                state.finish_rollback();
                Ok(())
            }
            ReleaseDecision::Hide { restore } => {
                let region = self.region(cx)?;
                let published = read_index_hdr_bytes(&region);
                write_index_hdr_bytes(&region, &restore);
                self.shm_barrier();
                state.hide(published);
                self.unlock_other_slots(cx, offset, n, flags)
            }
            ReleaseDecision::AlreadyHidden => self.unlock_other_slots(cx, offset, n, flags),
        }
    }

    /// Release every slot of `offset..offset + n` except the write lock.
    fn unlock_other_slots(
        &mut self,
        cx: &Cx,
        offset: u32,
        n: u32,
        flags: ShmLockFlags,
    ) -> Result<()> {
        for slot in offset..offset + n {
            if slot != WAL_WRITE_LOCK {
                self.file_mut()?.shm_lock(cx, slot, 1, flags)?;
            }
        }
        Ok(())
    }

    fn shallow_poll(&self, tracker: &Mutex<Tracker>) -> Result<WalSlice> {
        let slice = tracker.lock().shallow_poll()?;
        GLOBAL_CAPTURE_METRICS.record_poll();
        Ok(slice)
    }

    /// Read the captured frames back from the WAL.
    fn poll(
        &mut self,
        cx: &Cx,
        tracker: &Mutex<Tracker>,
    ) -> Result<(WalSlice, Vec<CapturedFrame>)> {
        let slice = tracker.lock().shallow_poll()?;
        let mut frames = Vec::with_capacity(slice.len as usize);
        let mut buf = vec![0u8; self.frame_size];
        for index in slice.start..=slice.end() {
            let offset = frame_offset(self.page_size, index as usize - 1);
            let read = self.file_mut()?.read(cx, &mut buf, offset)?;
            if read < self.frame_size {
                return Err(QliteError::ShortRead {
                    expected: self.frame_size,
                    actual: read,
                });
            }
            let header = WalFrameHeader::from_bytes(&buf)?;
            if header.salts != slice.salts {
                return Err(QliteError::wal_corrupt(format!(
                    "captured frame {index} no longer belongs to {slice}"
                )));
            }
            frames.push(CapturedFrame {
                page_number: header.page_number,
                db_size: header.db_size,
                data: buf[WAL_FRAME_HEADER_SIZE..].to_vec(),
            });
        }
        GLOBAL_CAPTURE_METRICS.record_poll();
        debug!(%slice, frames = frames.len(), "captured frames polled");
        Ok((slice, frames))
    }

    /// Publish the hidden index header and release the write lock.
    ///
    /// The lock is released through the committing handle, or through its
    /// backend file when that handle was dropped.
    fn apply(&mut self, cx: &Cx, tracker: &Mutex<Tracker>) -> Result<()> {
        let mut state = tracker.lock();
        let plan = state.plan_apply(self.id)?;
        let region = self.region(cx)?;

        let span = debug_span!("capture_apply", slice = %plan.slice, orphaned = plan.orphaned);
        let _guard = span.enter();
        let _mask = cx.masked();

        write_index_hdr_bytes(&region, &plan.publish);
        self.shm_barrier();
        let unlock = if plan.orphaned {
            state
                .orphaned_writer()
                .ok_or_else(|| QliteError::internal("orphaned writer vanished"))
                .and_then(|file| {
                    file.shm_lock(cx, WAL_WRITE_LOCK, 1, ShmLockFlags::UNLOCK_EXCLUSIVE)
                })
        } else {
            self.file_mut()?
                .shm_lock(cx, WAL_WRITE_LOCK, 1, ShmLockFlags::UNLOCK_EXCLUSIVE)
        };
        if let Err(err) = unlock {
            warn!(error = %err, "write lock release failed; transaction stays hidden");
            write_index_hdr_bytes(&region, &plan.snapshot);
            self.shm_barrier();
            return Err(err);
        }
        state.finish_apply();
        GLOBAL_CAPTURE_METRICS.record_apply();
        Ok(())
    }

    /// Hand a dropped committer's backend file to the tracker so the write
    /// lock outlives the handle.
    fn orphan_writer(&mut self, tracker: &Mutex<Tracker>) {
        let mut state = tracker.lock();
        let captured = match state.state() {
            TxnState::Writing(txn) if txn.writer == self.id => None,
            TxnState::Captured(pending) if pending.writer == self.id => Some(pending.slice),
            _ => return,
        };
        let Some(slice) = captured else {
            warn!(handle = self.id, "writer dropped mid-transaction; rolled back");
            state.finish_rollback();
            return;
        };
        error!(
            %slice,
            handle = self.id,
            "committing handle dropped while captured; write lock kept until apply"
        );

        if let ReleaseDecision::Hide { restore } = state.release_write(self.id) {
            let cx = Cx::new();
            match self.region(&cx) {
                Ok(region) => {
                    let published = read_index_hdr_bytes(&region);
                    write_index_hdr_bytes(&region, &restore);
                    self.shm_barrier();
                    state.hide(published);
                }
                Err(err) => warn!(error = %err, "cannot hide the dropped commit"),
            }
        }
        if let Some(inner) = self.inner.take() {
            state.adopt_writer(self.id, Box::new(inner));
        }
    }
}

fn released() -> QliteError {
    QliteError::internal("capture handle already released")
}

impl<F: VfsFile + 'static> Drop for CaptureFile<F> {
    fn drop(&mut self) {
        if self.role == FileRole::MainDb {
            if let Some(tracker) = self.tracker.clone() {
                self.orphan_writer(&tracker);
            }
        }
    }
}

impl<F: VfsFile + 'static> VfsFile for CaptureFile<F> {
    fn close(&mut self, cx: &Cx) -> Result<()> {
        if let Some(tracker) = &self.tracker {
            tracker.lock().check_close()?;
        }
        self.file_mut()?.close(cx)
    }

    fn read(&mut self, cx: &Cx, buf: &mut [u8], offset: u64) -> Result<usize> {
        self.file_mut()?.read(cx, buf, offset)
    }

    fn write(&mut self, cx: &Cx, buf: &[u8], offset: u64) -> Result<()> {
        let (FileRole::Wal, Some(tracker)) = (self.role, self.tracker.clone()) else {
            return self.file_mut()?.write(cx, buf, offset);
        };
        let event = WalWrite::classify(buf, offset, self.frame_size)?;
        let mut state = tracker.lock();
        state.check_wal_write(&event)?;
        self.file_mut()?.write(cx, buf, offset)?;
        if let Some(slice) = state.record_wal_write(&event) {
            GLOBAL_CAPTURE_METRICS.record_capture(u64::from(slice.len));
        }
        Ok(())
    }

    fn truncate(&mut self, cx: &Cx, size: u64) -> Result<()> {
        if let (FileRole::Wal, Some(tracker)) = (self.role, &self.tracker) {
            tracker.lock().check_truncate(size, self.frame_size)?;
        }
        self.file_mut()?.truncate(cx, size)
    }

    fn sync(&mut self, cx: &Cx, flags: SyncFlags) -> Result<()> {
        self.file_mut()?.sync(cx, flags)
    }

    fn file_size(&self, cx: &Cx) -> Result<u64> {
        self.file()?.file_size(cx)
    }

    fn lock(&mut self, cx: &Cx, level: LockLevel) -> Result<()> {
        self.file_mut()?.lock(cx, level)
    }

    fn unlock(&mut self, cx: &Cx, level: LockLevel) -> Result<()> {
        self.file_mut()?.unlock(cx, level)
    }

    fn check_reserved_lock(&self, cx: &Cx) -> Result<bool> {
        self.file()?.check_reserved_lock(cx)
    }

    fn shm_map(
        &mut self,
        cx: &Cx,
        region: u32,
        size: u32,
        extend: bool,
    ) -> Result<Option<ShmRegion>> {
        let mapped = self.file_mut()?.shm_map(cx, region, size, extend)?;
        if region == 0 && self.region.is_none() {
            self.region.clone_from(&mapped);
        }
        Ok(mapped)
    }

    fn shm_lock(&mut self, cx: &Cx, offset: u32, n: u32, flags: ShmLockFlags) -> Result<()> {
        let Some(tracker) = self.tracker.clone() else {
            return self.file_mut()?.shm_lock(cx, offset, n, flags);
        };
        self.lock_shm(cx, &tracker, offset, n, flags)
    }

    fn shm_barrier(&self) {
        if let Some(inner) = &self.inner {
            inner.shm_barrier();
        }
    }

    fn shm_unmap(&mut self, cx: &Cx, delete: bool) -> Result<()> {
        if let Some(tracker) = &self.tracker {
            tracker.lock().check_unmap(self.id)?;
        }
        self.region = None;
        self.file_mut()?.shm_unmap(cx, delete)
    }

    fn file_control(&mut self, cx: &Cx, op: FileControl) -> Result<FileControlOutcome> {
        let Some(tracker) = self.tracker.clone() else {
            return self.file_mut()?.file_control(cx, op);
        };
        let outcome = match (op, self.role) {
            (FileControl::ShallowPoll, _) => {
                self.shallow_poll(&tracker).map(FileControlOutcome::Slice)
            }
            (FileControl::Poll, FileRole::Wal) => self
                .poll(cx, &tracker)
                .map(|(slice, frames)| FileControlOutcome::Frames { slice, frames }),
            (FileControl::Apply, FileRole::MainDb) => {
                self.apply(cx, &tracker).map(|()| FileControlOutcome::Ack)
            }
            (FileControl::LockState, _) => return self.file_mut()?.file_control(cx, op),
            _ => Err(QliteError::FileControlNotFound { op: op.name() }),
        };
        if let Err(err) = &outcome {
            debug!(
                op = op.name(),
                code = ?err.error_code(),
                category = ?err.category(),
                hint = err.suggestion().unwrap_or_default(),
                %err,
                "file control refused"
            );
        }
        outcome
    }
}
