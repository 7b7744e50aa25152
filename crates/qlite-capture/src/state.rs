//! Per-database capture state machine.
//!
//! A [`Tracker`] is shared by the main-database and WAL handles of one
//! database. It never performs I/O: the file layer asks it to validate an
//! operation, performs the backend call, and only then records the outcome,
//! so a failed call leaves the state untouched.
//!
//! ```text
//! Idle --write lock--> Writing --commit frame--> Captured --apply--> Idle
//!                      Writing --unlock, no commit--> Idle
//! ```
//!
//! The one thing a tracker owns besides its state is an orphaned writer: the
//! backend file of a committing handle dropped while captured, kept so its
//! write lock holds until apply.

use std::fmt;

use qlite_error::{QliteError, Result};
use qlite_types::{WalSalts, WalSlice};
use qlite_vfs::VfsFile;
use qlite_wal::{WalFrameHeader, WalHeader, WalIndexHdr, WAL_HEADER_SIZE, WAL_INDEX_HDR_BYTES};
use tracing::{debug, info};

/// Raw bytes of one copy of the WAL-index header.
pub type IndexHeaderBytes = [u8; WAL_INDEX_HDR_BYTES];

/// Where a database is in the capture cycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TxnState {
    Idle,
    Writing(WritingTxn),
    Captured(PendingTxn),
}

/// A write transaction that has not written its commit frame yet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WritingTxn {
    /// Handle holding the backend write lock.
    pub writer: u64,
    /// 1-based index of the first frame the transaction wrote.
    pub first_frame: Option<u32>,
    /// Index header as it was when the write lock was taken.
    pub snapshot: IndexHeaderBytes,
}

/// A committed transaction that readers cannot see yet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingTxn {
    pub slice: WalSlice,
    pub commit_frame: WalFrameHeader,
    pub snapshot: IndexHeaderBytes,
    /// The index header the engine published, set aside once the engine
    /// released its write lock.
    pub hidden: Option<IndexHeaderBytes>,
    pub writer: u64,
}

/// A write to the WAL file, classified by the region it lands on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WalWrite {
    Header(WalHeader),
    /// A frame header write; `index` is 1-based.
    Frame { index: u32, header: WalFrameHeader },
    Other,
}

impl WalWrite {
    /// Classify a write of `buf` at `offset` in a WAL with `frame_size`-byte
    /// frames.
    pub fn classify(buf: &[u8], offset: u64, frame_size: usize) -> Result<Self> {
        let header_size = WAL_HEADER_SIZE as u64;
        if offset == 0 && buf.len() >= WAL_HEADER_SIZE {
            return WalHeader::from_bytes(buf).map(Self::Header);
        }
        if offset < header_size {
            return Ok(Self::Other);
        }
        let rel = offset - header_size;
        if rel % frame_size as u64 != 0 || buf.len() < qlite_wal::WAL_FRAME_HEADER_SIZE {
            return Ok(Self::Other);
        }
        let index = u32::try_from(rel / frame_size as u64 + 1).map_err(|_| QliteError::TooBig)?;
        Ok(Self::Frame {
            index,
            header: WalFrameHeader::from_bytes(buf)?,
        })
    }
}

/// What the file layer does with a release of the WAL write lock.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReleaseDecision {
    /// Not the writer: forward to the backend.
    Forward,
    /// Forward, then go back to idle.
    Rollback,
    /// Keep the backend lock and put `restore` back into shared memory.
    Hide { restore: IndexHeaderBytes },
    /// Already hidden by an earlier release.
    AlreadyHidden,
}

/// Everything `apply` needs once validation passed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ApplyPlan {
    pub slice: WalSlice,
    pub publish: IndexHeaderBytes,
    pub snapshot: IndexHeaderBytes,
    /// Release the write lock through the orphaned writer, not the caller.
    pub orphaned: bool,
}

struct OrphanedWriter {
    handle: u64,
    file: Box<dyn VfsFile>,
}

impl fmt::Debug for OrphanedWriter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OrphanedWriter")
            .field("handle", &self.handle)
            .finish_non_exhaustive()
    }
}

/// Capture state of one database, shared by all of its handles.
#[derive(Debug)]
pub struct Tracker {
    page_size: u32,
    /// Salts of the current WAL epoch, once seen in a header or frame.
    salts: Option<WalSalts>,
    state: TxnState,
    orphan: Option<OrphanedWriter>,
}

impl Tracker {
    #[must_use]
    pub const fn new(page_size: u32) -> Self {
        Self {
            page_size,
            salts: None,
            state: TxnState::Idle,
            orphan: None,
        }
    }

    #[must_use]
    pub const fn state(&self) -> &TxnState {
        &self.state
    }

    #[must_use]
    pub const fn write_lock_held(&self) -> bool {
        !matches!(self.state, TxnState::Idle)
    }

    #[must_use]
    pub const fn wal_salts(&self) -> Option<WalSalts> {
        self.salts
    }

    #[must_use]
    pub const fn pending(&self) -> Option<&PendingTxn> {
        match &self.state {
            TxnState::Captured(pending) => Some(pending),
            _ => None,
        }
    }

    /// Whether a dropped committer's file is waiting for apply.
    #[must_use]
    pub const fn has_orphaned_writer(&self) -> bool {
        self.orphan.is_some()
    }

    /// Keep the backend file of the dropped committing handle `handle`.
    ///
    /// Ignored unless `handle` is the writer of the captured transaction.
    pub fn adopt_writer(&mut self, handle: u64, file: Box<dyn VfsFile>) {
        if let TxnState::Captured(pending) = &self.state {
            if pending.writer == handle {
                self.orphan = Some(OrphanedWriter { handle, file });
            }
        }
    }

    /// The orphaned writer's backend file, which holds the write lock.
    pub fn orphaned_writer(&mut self) -> Option<&mut dyn VfsFile> {
        match &mut self.orphan {
            Some(orphan) => Some(orphan.file.as_mut()),
            None => None,
        }
    }

    /// Refuse a new writer or checkpointer while a transaction is captured.
    pub fn check_exclusive_lock(&self, write_slot: bool, ckpt_slot: bool) -> Result<()> {
        if let TxnState::Captured(pending) = &self.state {
            if write_slot || ckpt_slot {
                debug!(slice = %pending.slice, write_slot, ckpt_slot, "lock refused while captured");
                return Err(QliteError::Busy);
            }
        }
        Ok(())
    }

    /// The backend granted `writer` the WAL write lock.
    pub fn begin_write(&mut self, writer: u64, snapshot: IndexHeaderBytes) {
        if matches!(self.state, TxnState::Idle) {
            debug!(writer, "write transaction started");
            self.state = TxnState::Writing(WritingTxn {
                writer,
                first_frame: None,
                snapshot,
            });
        }
    }

    pub fn check_wal_write(&self, write: &WalWrite) -> Result<()> {
        match (&self.state, write) {
            (TxnState::Captured(pending), _) => Err(QliteError::consistency(format!(
                "WAL write while transaction {} is captured",
                pending.slice
            ))),
            (state, WalWrite::Header(header)) => {
                if header.page_size != self.page_size {
                    return Err(QliteError::consistency(format!(
                        "WAL header page size {} does not match configured {}",
                        header.page_size, self.page_size
                    )));
                }
                if let TxnState::Writing(WritingTxn {
                    first_frame: Some(first),
                    ..
                }) = state
                {
                    return Err(QliteError::consistency(format!(
                        "WAL header rewritten after frame {first} was appended"
                    )));
                }
                Ok(())
            }
            (TxnState::Idle, WalWrite::Frame { index, .. }) => Err(QliteError::consistency(
                format!("WAL frame {index} written without the write lock"),
            )),
            (TxnState::Writing(_), WalWrite::Frame { index, header }) => match self.salts {
                Some(salts) if salts != header.salts => Err(QliteError::consistency(format!(
                    "WAL frame {index} carries salts {} but the WAL epoch is {salts}",
                    header.salts
                ))),
                _ => Ok(()),
            },
            (_, WalWrite::Other) => Ok(()),
        }
    }

    /// Record a WAL write the backend accepted. Returns the slice when the
    /// write was a commit frame.
    pub fn record_wal_write(&mut self, write: &WalWrite) -> Option<WalSlice> {
        match *write {
            WalWrite::Header(header) => {
                self.salts = Some(header.salts);
                None
            }
            WalWrite::Frame { index, header } => {
                self.salts.get_or_insert(header.salts);
                let TxnState::Writing(txn) = &mut self.state else {
                    return None;
                };
                let start = txn.first_frame.map_or(index, |first| first.min(index));
                txn.first_frame = Some(start);
                if !header.is_commit() {
                    return None;
                }
                let pending = PendingTxn {
                    slice: WalSlice::new(header.salts, start, index.saturating_sub(start) + 1),
                    commit_frame: header,
                    snapshot: txn.snapshot,
                    hidden: None,
                    writer: txn.writer,
                };
                let slice = pending.slice;
                info!(%slice, db_size = header.db_size, "transaction captured");
                self.state = TxnState::Captured(pending);
                Some(slice)
            }
            WalWrite::Other => None,
        }
    }

    /// Refuse truncating the WAL into a captured slice.
    pub fn check_truncate(&self, size: u64, frame_size: usize) -> Result<()> {
        if let TxnState::Captured(pending) = &self.state {
            let keep = WAL_HEADER_SIZE as u64 + u64::from(pending.slice.end()) * frame_size as u64;
            if size < keep {
                return Err(QliteError::consistency(format!(
                    "truncating the WAL to {size} bytes would drop captured {}",
                    pending.slice
                )));
            }
        }
        Ok(())
    }

    #[must_use]
    pub fn release_write(&self, handle: u64) -> ReleaseDecision {
        match &self.state {
            TxnState::Writing(txn) if txn.writer == handle => ReleaseDecision::Rollback,
            TxnState::Captured(pending) if pending.writer == handle => match pending.hidden {
                None => ReleaseDecision::Hide {
                    restore: pending.snapshot,
                },
                Some(_) => ReleaseDecision::AlreadyHidden,
            },
            _ => ReleaseDecision::Forward,
        }
    }

    /// The backend released the write lock of a transaction without a
    /// commit frame.
    pub fn finish_rollback(&mut self) {
        if let TxnState::Writing(txn) = &self.state {
            debug!(writer = txn.writer, "write transaction rolled back");
            self.state = TxnState::Idle;
        }
    }

    /// Keep the engine's published header aside until apply.
    pub fn hide(&mut self, published: IndexHeaderBytes) {
        if let TxnState::Captured(pending) = &mut self.state {
            if pending.hidden.is_none() {
                debug!(slice = %pending.slice, "captured transaction hidden from readers");
                pending.hidden = Some(published);
            }
        }
    }

    pub fn shallow_poll(&self) -> Result<WalSlice> {
        self.pending()
            .map(|pending| pending.slice)
            .ok_or(QliteError::NoPendingTransaction)
    }

    /// Validate an apply issued on `handle`.
    ///
    /// Only the committing handle may apply, unless it was dropped; then any
    /// handle of the database may.
    pub fn plan_apply(&self, handle: u64) -> Result<ApplyPlan> {
        let TxnState::Captured(pending) = &self.state else {
            return Err(QliteError::NothingToApply);
        };
        let Some(publish) = pending.hidden else {
            return Err(QliteError::consistency(
                "apply before the commit released the write lock",
            ));
        };
        let orphaned = self
            .orphan
            .as_ref()
            .is_some_and(|orphan| orphan.handle == pending.writer);
        if pending.writer != handle && !orphaned {
            return Err(QliteError::consistency(
                "apply must run on the database handle that committed",
            ));
        }
        let published = WalIndexHdr::from_bytes(&publish)?.salts();
        let current = self.salts.unwrap_or(published);
        for salts in [published, current] {
            if salts != pending.slice.salts {
                return Err(QliteError::StaleSlice {
                    captured: pending.slice.salts.to_array(),
                    current: salts.to_array(),
                });
            }
        }
        Ok(ApplyPlan {
            slice: pending.slice,
            publish,
            snapshot: pending.snapshot,
            orphaned,
        })
    }

    /// The published header is visible and the backend lock released.
    pub fn finish_apply(&mut self) -> Option<WalSlice> {
        let TxnState::Captured(pending) = &self.state else {
            return None;
        };
        let slice = pending.slice;
        info!(%slice, "captured transaction applied");
        self.state = TxnState::Idle;
        if let Some(orphan) = self.orphan.take() {
            debug!(handle = orphan.handle, "orphaned writer released");
        }
        Some(slice)
    }

    /// Handles of a database with a captured transaction stay open.
    pub fn check_close(&self) -> Result<()> {
        match &self.state {
            TxnState::Captured(pending) => Err(QliteError::consistency(format!(
                "close while transaction {} is captured",
                pending.slice
            ))),
            _ => Ok(()),
        }
    }

    /// The writer may not drop its shared memory (and with it the write lock)
    /// while captured.
    pub fn check_unmap(&self, handle: u64) -> Result<()> {
        match &self.state {
            TxnState::Captured(pending) if pending.writer == handle => {
                Err(QliteError::consistency(format!(
                    "unmapping shared memory while transaction {} is captured",
                    pending.slice
                )))
            }
            _ => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::path::Path;

    use qlite_types::flags::VfsOpenFlags;
    use qlite_types::Cx;
    use qlite_vfs::{MemoryVfs, Vfs};
    use qlite_wal::{SqliteWalChecksum, WAL_FRAME_HEADER_SIZE};

    use super::*;

    const PAGE: u32 = 512;
    const FRAME: usize = WAL_FRAME_HEADER_SIZE + PAGE as usize;
    const SALTS: WalSalts = WalSalts::new(7, 9);
    const WRITER: u64 = 1;

    fn index_bytes(mx_frame: u32, salts: WalSalts) -> IndexHeaderBytes {
        WalIndexHdr {
            mx_frame,
            ..WalIndexHdr::new(PAGE, salts, SqliteWalChecksum::default())
        }
        .to_bytes()
    }

    fn header(salts: WalSalts) -> WalWrite {
        WalWrite::Header(WalHeader::new(PAGE, 0, salts))
    }

    fn frame(index: u32, db_size: u32, salts: WalSalts) -> WalWrite {
        WalWrite::Frame {
            index,
            header: WalFrameHeader {
                page_number: index,
                db_size,
                salts,
                checksum: SqliteWalChecksum::default(),
            },
        }
    }

    fn write(t: &mut Tracker, w: &WalWrite) -> Option<WalSlice> {
        t.check_wal_write(w).unwrap();
        t.record_wal_write(w)
    }

    fn captured(start: u32, len: u32) -> Tracker {
        let mut t = Tracker::new(PAGE);
        write(&mut t, &header(SALTS));
        t.begin_write(WRITER, index_bytes(start - 1, SALTS));
        for i in start..start + len - 1 {
            assert_eq!(write(&mut t, &frame(i, 0, SALTS)), None);
        }
        let slice = write(&mut t, &frame(start + len - 1, 3, SALTS)).unwrap();
        assert_eq!(slice, WalSlice::new(SALTS, start, len));
        t
    }

    #[test]
    fn commit_frame_captures_slice() {
        let t = captured(4, 3);
        assert!(t.write_lock_held());
        let pending = t.pending().unwrap();
        assert_eq!(pending.commit_frame.db_size, 3);
        assert_eq!(pending.writer, WRITER);
        assert!(pending.hidden.is_none());
        assert_eq!(t.shallow_poll().unwrap(), WalSlice::new(SALTS, 4, 3));
    }

    #[test]
    fn idle_tracker_has_nothing_to_poll_or_apply() {
        let t = Tracker::new(PAGE);
        assert!(!t.write_lock_held());
        assert!(matches!(t.shallow_poll(), Err(QliteError::NoPendingTransaction)));
        assert!(matches!(t.plan_apply(WRITER), Err(QliteError::NothingToApply)));
        assert_eq!(t.release_write(WRITER), ReleaseDecision::Forward);
        t.check_close().unwrap();
    }

    #[test]
    fn frames_need_the_write_lock() {
        let t = Tracker::new(PAGE);
        assert!(matches!(
            t.check_wal_write(&frame(1, 0, SALTS)),
            Err(QliteError::Consistency { .. })
        ));
    }

    #[test]
    fn header_rules() {
        let mut t = Tracker::new(PAGE);
        let wrong_size = WalWrite::Header(WalHeader::new(4096, 0, SALTS));
        assert!(matches!(
            t.check_wal_write(&wrong_size),
            Err(QliteError::Consistency { .. })
        ));
        assert_eq!(t.wal_salts(), None);

        t.begin_write(WRITER, index_bytes(0, SALTS));
        write(&mut t, &header(SALTS));
        assert_eq!(t.wal_salts(), Some(SALTS));
        write(&mut t, &frame(1, 0, SALTS));
        assert!(t.check_wal_write(&header(WalSalts::new(1, 1))).is_err());
        assert!(t.check_wal_write(&frame(2, 0, WalSalts::new(1, 1))).is_err());
    }

    #[test]
    fn rollback_returns_to_idle() {
        let mut t = Tracker::new(PAGE);
        t.begin_write(WRITER, index_bytes(0, SALTS));
        write(&mut t, &frame(1, 0, SALTS));
        assert_eq!(t.release_write(WRITER + 1), ReleaseDecision::Forward);
        assert_eq!(t.release_write(WRITER), ReleaseDecision::Rollback);
        t.finish_rollback();
        assert_eq!(t.state(), &TxnState::Idle);
    }

    #[test]
    fn captured_refuses_writers_writes_and_close() {
        let t = captured(1, 2);
        assert!(matches!(t.check_exclusive_lock(true, false), Err(QliteError::Busy)));
        assert!(matches!(t.check_exclusive_lock(false, true), Err(QliteError::Busy)));
        t.check_exclusive_lock(false, false).unwrap();
        for w in [header(SALTS), frame(3, 0, SALTS), WalWrite::Other] {
            assert!(matches!(
                t.check_wal_write(&w),
                Err(QliteError::Consistency { .. })
            ));
        }
        assert!(t.check_close().is_err());
        assert!(t.check_unmap(WRITER).is_err());
        t.check_unmap(WRITER + 1).unwrap();
    }

    #[test]
    fn truncate_into_slice_is_refused() {
        let t = captured(2, 2);
        let end = WAL_HEADER_SIZE as u64 + 3 * FRAME as u64;
        t.check_truncate(end, FRAME).unwrap();
        assert!(t.check_truncate(end - 1, FRAME).is_err());
        Tracker::new(PAGE).check_truncate(0, FRAME).unwrap();
    }

    #[test]
    fn apply_requires_hidden_header_and_writer() {
        let mut t = captured(1, 1);
        assert!(matches!(
            t.plan_apply(WRITER),
            Err(QliteError::Consistency { .. })
        ));

        let restore = match t.release_write(WRITER) {
            ReleaseDecision::Hide { restore } => restore,
            other => panic!("unexpected decision {other:?}"),
        };
        assert_eq!(restore, index_bytes(0, SALTS));
        t.hide(index_bytes(1, SALTS));
        assert_eq!(t.release_write(WRITER), ReleaseDecision::AlreadyHidden);

        assert!(t.plan_apply(WRITER + 1).is_err());
        let plan = t.plan_apply(WRITER).unwrap();
        assert_eq!(plan.slice, WalSlice::new(SALTS, 1, 1));
        assert_eq!(plan.publish, index_bytes(1, SALTS));
        assert!(!plan.orphaned);

        assert_eq!(t.finish_apply(), Some(plan.slice));
        assert_eq!(t.state(), &TxnState::Idle);
        assert!(matches!(t.plan_apply(WRITER), Err(QliteError::NothingToApply)));
        assert_eq!(t.finish_apply(), None);
    }

    fn memory_file(name: &str) -> Box<dyn VfsFile> {
        let flags = VfsOpenFlags::MAIN_DB | VfsOpenFlags::CREATE | VfsOpenFlags::READWRITE;
        let (file, _) = MemoryVfs::new()
            .open(&Cx::new(), Some(Path::new(name)), flags)
            .unwrap();
        Box::new(file)
    }

    #[test]
    fn orphaned_writer_lets_any_handle_apply() {
        let mut t = captured(1, 1);
        t.hide(index_bytes(1, SALTS));
        t.adopt_writer(WRITER + 1, memory_file("stray.db"));
        assert!(!t.has_orphaned_writer());
        assert!(t.plan_apply(WRITER + 7).is_err());

        t.adopt_writer(WRITER, memory_file("orphan.db"));
        assert!(t.has_orphaned_writer());
        assert!(t.orphaned_writer().is_some());
        let plan = t.plan_apply(WRITER + 7).unwrap();
        assert!(plan.orphaned);
        assert_eq!(plan.slice, WalSlice::new(SALTS, 1, 1));

        t.finish_apply();
        assert!(!t.has_orphaned_writer());
        assert_eq!(t.state(), &TxnState::Idle);
    }

    #[test]
    fn idle_tracker_adopts_nothing() {
        let mut t = Tracker::new(PAGE);
        t.adopt_writer(WRITER, memory_file("idle.db"));
        assert!(!t.has_orphaned_writer());
        assert!(t.orphaned_writer().is_none());
    }

    #[test]
    fn apply_with_moved_epoch_is_stale() {
        let mut t = captured(1, 1);
        let moved = WalSalts::new(8, 10);
        t.hide(index_bytes(1, moved));
        match t.plan_apply(WRITER) {
            Err(QliteError::StaleSlice { captured, current }) => {
                assert_eq!(captured, SALTS.to_array());
                assert_eq!(current, moved.to_array());
            }
            other => panic!("expected stale slice, got {other:?}"),
        }
        assert!(t.pending().is_some());
    }

    #[test]
    fn classify_writes() {
        let hdr = WalHeader::new(PAGE, 0, SALTS).to_bytes();
        assert!(matches!(
            WalWrite::classify(&hdr, 0, FRAME).unwrap(),
            WalWrite::Header(h) if h.salts == SALTS
        ));
        assert_eq!(WalWrite::classify(&[0; 4], 8, FRAME).unwrap(), WalWrite::Other);

        let mut buf = vec![0u8; FRAME];
        buf[..4].copy_from_slice(&5u32.to_be_bytes());
        buf[4..8].copy_from_slice(&2u32.to_be_bytes());
        let offset = WAL_HEADER_SIZE as u64 + 2 * FRAME as u64;
        match WalWrite::classify(&buf, offset, FRAME).unwrap() {
            WalWrite::Frame { index, header } => {
                assert_eq!(index, 3);
                assert_eq!(header.page_number, 5);
                assert!(header.is_commit());
            }
            other => panic!("expected frame, got {other:?}"),
        }
        assert_eq!(
            WalWrite::classify(&buf[24..], offset + 24, FRAME).unwrap(),
            WalWrite::Other
        );
    }

    #[test]
    fn first_frame_tracks_lowest_index() {
        let mut t = Tracker::new(PAGE);
        t.begin_write(WRITER, index_bytes(4, SALTS));
        write(&mut t, &frame(6, 0, SALTS));
        write(&mut t, &frame(5, 0, SALTS));
        let slice = write(&mut t, &frame(7, 7, SALTS)).unwrap();
        assert_eq!((slice.start, slice.len), (5, 3));
    }
}
