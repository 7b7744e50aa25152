//! The engine side of the WAL protocol.
//!
//! A [`WalSession`] drives one connection's view of a database in WAL mode
//! through a main-database handle and a WAL handle, the way the SQL engine
//! does: readers snapshot the WAL-index header, the writer takes the WAL
//! write lock, appends frames, publishes a new index header on commit and
//! releases the lock. Everything goes through the [`VfsFile`] trait so a
//! wrapping VFS observes exactly the calls a real engine would make.

use qlite_error::{QliteError, Result};
use qlite_types::flags::{ShmLockFlags, SyncFlags};
use qlite_types::{Cx, PageNumber, PageSize, WalSalts};
use qlite_vfs::{ShmRegion, VfsFile, SHM_REGION_SIZE};
use tracing::{debug, debug_span, info, warn};

use crate::checksum::WalFrameHeader;
use crate::metrics::GLOBAL_WAL_METRICS;
use crate::wal::WalFile;
use crate::wal_index::{
    read_shm_header, write_ckpt_info, write_index_hdr, WalCkptInfo, WalIndexHdr, WAL_CKPT_LOCK,
    WAL_READ_LOCK_BASE, WAL_WRITE_LOCK,
};

/// Reader slot shared by every open read transaction; a checkpoint needs
/// it exclusively.
pub const WAL_READER_SLOT: u32 = WAL_READ_LOCK_BASE + 1;

const HEADER_READ_ATTEMPTS: usize = 8;

/// Configuration for a [`WalSession`].
///
/// Salts are deterministic so that replicas applying the same transactions
/// restart the WAL into identical epochs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WalSessionConfig {
    pub page_size: PageSize,
    /// Salts of a freshly created WAL.
    pub initial_salts: WalSalts,
    /// Checkpoint sequence of a freshly created WAL.
    pub checkpoint_seq: u32,
}

impl Default for WalSessionConfig {
    fn default() -> Self {
        Self {
            page_size: PageSize::DEFAULT,
            initial_salts: WalSalts::new(0x5EED_0001, 0x2545_F491),
            checkpoint_seq: 0,
        }
    }
}

impl WalSessionConfig {
    #[must_use]
    pub const fn with_page_size(mut self, page_size: PageSize) -> Self {
        self.page_size = page_size;
        self
    }

    #[must_use]
    pub const fn with_initial_salts(mut self, salts: WalSalts) -> Self {
        self.initial_salts = salts;
        self
    }
}

/// Salts of the epoch that follows `prev`.
///
/// `salt1` is incremented and `salt2` is advanced with a xorshift step, so
/// every node restarting from the same epoch lands on the same salts.
#[must_use]
pub const fn next_salts(prev: WalSalts) -> WalSalts {
    let mut x = prev.salt2;
    x ^= x << 13;
    x ^= x >> 17;
    x ^= x << 5;
    if x == 0 {
        x = 0x9E37_79B9;
    }
    WalSalts::new(prev.salt1.wrapping_add(1), x)
}

/// What a read transaction sees.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WalSnapshot {
    /// Last WAL frame visible to the reader (1-based, 0 = none).
    pub mx_frame: u32,
    /// Database size in pages.
    pub n_page: u32,
    pub salts: WalSalts,
}

impl From<&WalIndexHdr> for WalSnapshot {
    fn from(hdr: &WalIndexHdr) -> Self {
        Self {
            mx_frame: hdr.mx_frame,
            n_page: hdr.n_page,
            salts: hdr.salts(),
        }
    }
}

#[derive(Debug)]
struct WriteTxn {
    /// Index header the transaction builds on (after any WAL restart).
    base: WalIndexHdr,
    restarted: bool,
}

/// One connection's WAL-mode session over a database and its WAL.
pub struct WalSession<F: VfsFile> {
    db: F,
    wal: WalFile<F>,
    shm: ShmRegion,
    config: WalSessionConfig,
    read: Option<WalSnapshot>,
    write: Option<WriteTxn>,
}

impl<F: VfsFile> WalSession<F> {
    /// Attach to a database. Creates the WAL if it is empty and rebuilds the
    /// WAL-index header from the WAL if shared memory is uninitialized.
    pub fn open(cx: &Cx, mut db: F, wal_file: F, config: WalSessionConfig) -> Result<Self> {
        let page_size = config.page_size.get();
        let wal = if wal_file.file_size(cx)? == 0 {
            WalFile::create(
                cx,
                wal_file,
                page_size,
                config.checkpoint_seq,
                config.initial_salts,
            )?
        } else {
            WalFile::open(cx, wal_file)?
        };
        if wal.page_size() != config.page_size.as_usize() {
            return Err(QliteError::wal_corrupt(format!(
                "WAL page size {} does not match configured {page_size}",
                wal.page_size()
            )));
        }

        let shm = db
            .shm_map(cx, 0, SHM_REGION_SIZE, true)?
            .ok_or_else(|| QliteError::internal("shared-memory region 0 missing after extend"))?;

        let mut session = Self {
            db,
            wal,
            shm,
            config,
            read: None,
            write: None,
        };
        let initialized = read_shm_header(&session.shm)?
            .is_some_and(|(hdr, _)| hdr.is_initialized());
        if !initialized {
            session.recover_index(cx)?;
        }
        Ok(session)
    }

    /// Rebuild the index header from the WAL's committed prefix.
    fn recover_index(&mut self, cx: &Cx) -> Result<()> {
        self.db
            .shm_lock(cx, WAL_WRITE_LOCK, 1, ShmLockFlags::LOCK_EXCLUSIVE)?;
        let result = self.recover_index_locked(cx);
        let unlock = self
            .db
            .shm_lock(cx, WAL_WRITE_LOCK, 1, ShmLockFlags::UNLOCK_EXCLUSIVE);
        result?;
        unlock
    }

    fn recover_index_locked(&mut self, cx: &Cx) -> Result<()> {
        self.wal.refresh(cx)?;
        let frames = self.wal.frame_count();
        let n_page = if frames > 0 {
            self.wal.read_frame_header(cx, frames - 1)?.db_size
        } else {
            let pages = self.db.file_size(cx)? / u64::from(self.config.page_size.get());
            u32::try_from(pages).map_err(|_| QliteError::TooBig)?
        };
        let hdr = WalIndexHdr {
            mx_frame: u32::try_from(frames).map_err(|_| QliteError::TooBig)?,
            n_page,
            ..WalIndexHdr::new(
                self.config.page_size.get(),
                self.wal.salts(),
                self.wal.running_checksum(),
            )
        }
        .sealed();
        write_index_hdr(&self.shm, &hdr);
        write_ckpt_info(&self.shm, &WalCkptInfo::default());
        GLOBAL_WAL_METRICS.record_index_recovery();
        info!(
            mx_frame = hdr.mx_frame,
            n_page, "WAL index recovered from WAL file"
        );
        Ok(())
    }

    fn current_index(&self) -> Result<(WalIndexHdr, WalCkptInfo)> {
        for _ in 0..HEADER_READ_ATTEMPTS {
            if let Some((hdr, ckpt)) = read_shm_header(&self.shm)? {
                if !hdr.is_initialized() {
                    return Err(QliteError::wal_corrupt("WAL index header not initialized"));
                }
                return Ok((hdr, ckpt));
            }
            self.db.shm_barrier();
        }
        Err(QliteError::Busy)
    }

    /// The index header currently published in shared memory.
    pub fn index_header(&self) -> Result<WalIndexHdr> {
        Ok(self.current_index()?.0)
    }

    /// Start a read transaction at the current index header.
    pub fn begin_read(&mut self, cx: &Cx) -> Result<WalSnapshot> {
        if let Some(snapshot) = self.read {
            return Ok(snapshot);
        }
        self.db
            .shm_lock(cx, WAL_READER_SLOT, 1, ShmLockFlags::LOCK_SHARED)?;
        let snapshot = match self.current_index() {
            Ok((hdr, _)) => WalSnapshot::from(&hdr),
            Err(err) => {
                self.db
                    .shm_lock(cx, WAL_READER_SLOT, 1, ShmLockFlags::UNLOCK_SHARED)?;
                return Err(err);
            }
        };
        debug!(
            mx_frame = snapshot.mx_frame,
            n_page = snapshot.n_page,
            "read transaction started"
        );
        self.read = Some(snapshot);
        Ok(snapshot)
    }

    pub fn end_read(&mut self, cx: &Cx) -> Result<()> {
        if self.read.take().is_some() {
            self.db
                .shm_lock(cx, WAL_READER_SLOT, 1, ShmLockFlags::UNLOCK_SHARED)?;
        }
        Ok(())
    }

    /// The snapshot of the open read transaction, if any.
    #[must_use]
    pub fn snapshot(&self) -> Option<WalSnapshot> {
        self.read
    }

    /// Read page `pgno`. Returns `None` beyond the end of the database.
    ///
    /// Inside a write transaction the writer's own frames are visible;
    /// otherwise the open read transaction's snapshot decides.
    pub fn read_page(&mut self, cx: &Cx, pgno: PageNumber) -> Result<Option<Vec<u8>>> {
        let (limit, n_page, salts) = if let Some(txn) = &self.write {
            let visible = u32::try_from(self.wal.frame_count()).map_err(|_| QliteError::TooBig)?;
            (visible, txn.base.n_page, txn.base.salts())
        } else if let Some(snapshot) = self.read {
            if pgno.get() > snapshot.n_page {
                return Ok(None);
            }
            self.wal.refresh(cx)?;
            (snapshot.mx_frame, snapshot.n_page, snapshot.salts)
        } else {
            return Err(QliteError::internal("read_page outside a transaction"));
        };

        // A different WAL epoch means every frame of this snapshot has been
        // checkpointed into the database file.
        if salts == self.wal.salts() {
            let limit = (limit as usize).min(self.wal.frame_count());
            for index in (0..limit).rev() {
                cx.checkpoint()?;
                if self.wal.read_frame_header(cx, index)?.page_number == pgno.get() {
                    return Ok(Some(self.wal.read_frame(cx, index)?.1));
                }
            }
        }
        if pgno.get() > n_page {
            return Ok(None);
        }

        let mut page = vec![0u8; self.config.page_size.as_usize()];
        self.db.read(cx, &mut page, pgno.offset(self.config.page_size))?;
        Ok(Some(page))
    }

    /// Take the WAL write lock and position the WAL for appending.
    ///
    /// Fails with [`QliteError::Busy`] while another writer holds the lock.
    /// Restarts the WAL into a new epoch when every frame has been
    /// checkpointed.
    pub fn begin_write(&mut self, cx: &Cx) -> Result<()> {
        if self.write.is_some() {
            return Err(QliteError::internal("write transaction already open"));
        }
        self.db
            .shm_lock(cx, WAL_WRITE_LOCK, 1, ShmLockFlags::LOCK_EXCLUSIVE)?;
        match self.prepare_write(cx) {
            Ok(txn) => {
                debug!(
                    mx_frame = txn.base.mx_frame,
                    restarted = txn.restarted,
                    "write transaction started"
                );
                self.write = Some(txn);
                Ok(())
            }
            Err(err) => {
                if let Err(unlock_err) =
                    self.db
                        .shm_lock(cx, WAL_WRITE_LOCK, 1, ShmLockFlags::UNLOCK_EXCLUSIVE)
                {
                    warn!(error = %unlock_err, "failed to release WAL write lock");
                }
                Err(err)
            }
        }
    }

    fn prepare_write(&mut self, cx: &Cx) -> Result<WriteTxn> {
        let (hdr, ckpt) = self.current_index()?;
        self.wal.refresh(cx)?;

        let fully_backfilled = hdr.mx_frame > 0 && ckpt.n_backfill == hdr.mx_frame;
        let epoch_moved = self.wal.salts() != hdr.salts();
        if epoch_moved && ckpt.n_backfill != hdr.mx_frame {
            return Err(QliteError::wal_corrupt(
                "WAL epoch changed before its frames were checkpointed",
            ));
        }

        if fully_backfilled || epoch_moved {
            let salts = next_salts(hdr.salts());
            let seq = self.wal.header().checkpoint_seq.wrapping_add(1);
            self.wal.reset(cx, seq, salts)?;
            let base = WalIndexHdr {
                i_change: hdr.i_change,
                n_page: hdr.n_page,
                ..WalIndexHdr::new(
                    self.config.page_size.get(),
                    salts,
                    self.wal.running_checksum(),
                )
            };
            return Ok(WriteTxn {
                base,
                restarted: true,
            });
        }

        self.wal.rewind(cx, hdr.mx_frame as usize)?;
        Ok(WriteTxn {
            base: hdr,
            restarted: false,
        })
    }

    /// Whether a write transaction is open.
    #[must_use]
    pub fn in_write(&self) -> bool {
        self.write.is_some()
    }

    /// Append non-commit frames for the open write transaction.
    pub fn write_frames(&mut self, cx: &Cx, pages: &[(PageNumber, &[u8])]) -> Result<()> {
        if self.write.is_none() {
            return Err(QliteError::internal("write_frames outside a write transaction"));
        }
        for (pgno, data) in pages {
            self.wal.append_frame(cx, pgno.get(), data, 0)?;
        }
        Ok(())
    }

    /// Append the final frames, marking the last one as the commit frame with
    /// `db_size` pages, publish the new index header and release the write
    /// lock.
    pub fn commit(&mut self, cx: &Cx, pages: &[(PageNumber, &[u8])], db_size: u32) -> Result<()> {
        let Some((last, rest)) = pages.split_last() else {
            return Err(QliteError::internal("commit requires at least one page"));
        };
        if db_size == 0 {
            return Err(QliteError::internal("commit db_size must be non-zero"));
        }
        let Some(txn) = self.write.as_ref() else {
            return Err(QliteError::internal("commit outside a write transaction"));
        };
        let base = txn.base;
        let restarted = txn.restarted;

        let span = debug_span!("wal_commit", frames = pages.len(), db_size);
        let _guard = span.enter();

        self.write_frames(cx, rest)?;
        self.wal.append_frame(cx, last.0.get(), last.1, db_size)?;
        self.wal.sync(cx, SyncFlags::NORMAL)?;

        let hdr = WalIndexHdr {
            mx_frame: u32::try_from(self.wal.frame_count()).map_err(|_| QliteError::TooBig)?,
            n_page: db_size,
            i_change: base.i_change.wrapping_add(1),
            a_frame_cksum: self.wal.running_checksum().to_array(),
            ..base
        }
        .sealed();

        let _mask = cx.masked();
        write_index_hdr(&self.shm, &hdr);
        if restarted {
            write_ckpt_info(&self.shm, &WalCkptInfo::default());
        }
        self.db.shm_barrier();
        self.write = None;
        self.db
            .shm_lock(cx, WAL_WRITE_LOCK, 1, ShmLockFlags::UNLOCK_EXCLUSIVE)?;
        GLOBAL_WAL_METRICS.record_commit();
        debug!(mx_frame = hdr.mx_frame, n_page = hdr.n_page, "transaction committed");
        Ok(())
    }

    /// Abandon the open write transaction and release the write lock.
    pub fn rollback(&mut self, cx: &Cx) -> Result<()> {
        let Some(txn) = self.write.take() else {
            return Ok(());
        };
        self.wal.rewind(cx, txn.base.mx_frame as usize)?;
        self.db
            .shm_lock(cx, WAL_WRITE_LOCK, 1, ShmLockFlags::UNLOCK_EXCLUSIVE)?;
        GLOBAL_WAL_METRICS.record_rollback();
        debug!(mx_frame = txn.base.mx_frame, "transaction rolled back");
        Ok(())
    }

    /// Copy committed WAL frames back into the database file.
    ///
    /// Returns the number of frames backfilled. Fails with
    /// [`QliteError::Busy`] while another checkpointer runs or while another
    /// session has a read transaction open.
    pub fn checkpoint(&mut self, cx: &Cx) -> Result<u32> {
        self.db
            .shm_lock(cx, WAL_CKPT_LOCK, 1, ShmLockFlags::LOCK_EXCLUSIVE)?;
        let result = self
            .db
            .shm_lock(cx, WAL_READER_SLOT, 1, ShmLockFlags::LOCK_EXCLUSIVE)
            .and_then(|()| {
                let backfilled = self.checkpoint_locked(cx);
                let mut reader_unlock =
                    self.db
                        .shm_lock(cx, WAL_READER_SLOT, 1, ShmLockFlags::UNLOCK_EXCLUSIVE);
                if reader_unlock.is_ok() && self.read.is_some() {
                    // Our own read transaction keeps its shared slot.
                    reader_unlock =
                        self.db
                            .shm_lock(cx, WAL_READER_SLOT, 1, ShmLockFlags::LOCK_SHARED);
                }
                let backfilled = backfilled?;
                reader_unlock.map(|()| backfilled)
            });
        let unlock = self
            .db
            .shm_lock(cx, WAL_CKPT_LOCK, 1, ShmLockFlags::UNLOCK_EXCLUSIVE);
        let backfilled = result?;
        unlock?;
        Ok(backfilled)
    }

    fn checkpoint_locked(&mut self, cx: &Cx) -> Result<u32> {
        let (hdr, mut ckpt) = self.current_index()?;
        self.wal.refresh(cx)?;
        if hdr.mx_frame == ckpt.n_backfill || self.wal.salts() != hdr.salts() {
            return Ok(0);
        }

        let _mask = cx.masked();
        let page_size = self.config.page_size.as_usize();
        let end = (hdr.mx_frame as usize).min(self.wal.frame_count());
        for index in ckpt.n_backfill as usize..end {
            let (frame, data): (WalFrameHeader, Vec<u8>) = self.wal.read_frame(cx, index)?;
            let pgno = PageNumber::new(frame.page_number)
                .ok_or_else(|| QliteError::wal_corrupt(format!("frame {index} names page 0")))?;
            self.db.write(cx, &data, pgno.offset(self.config.page_size))?;
        }
        self.db.truncate(cx, u64::from(hdr.n_page) * page_size as u64)?;
        self.db.sync(cx, SyncFlags::FULL)?;

        let backfilled = hdr.mx_frame - ckpt.n_backfill;
        ckpt.n_backfill = hdr.mx_frame;
        ckpt.n_backfill_attempted = hdr.mx_frame;
        write_ckpt_info(&self.shm, &ckpt);

        info!(backfilled, mx_frame = hdr.mx_frame, "checkpoint complete");
        GLOBAL_WAL_METRICS.record_checkpoint(u64::from(backfilled));
        Ok(backfilled)
    }

    /// The database file handle.
    pub fn db_file_mut(&mut self) -> &mut F {
        &mut self.db
    }

    /// The WAL file handle.
    pub fn wal_file_mut(&mut self) -> &mut F {
        self.wal.file_mut()
    }

    #[must_use]
    pub fn wal(&self) -> &WalFile<F> {
        &self.wal
    }

    #[must_use]
    pub fn config(&self) -> &WalSessionConfig {
        &self.config
    }

    /// End any open transactions and close both handles.
    ///
    /// If a handle refuses to close the error is returned and the session
    /// stays usable.
    pub fn close(&mut self, cx: &Cx) -> Result<()> {
        self.rollback(cx)?;
        self.end_read(cx)?;
        self.wal.file_mut().close(cx)?;
        self.db.close(cx)
    }
}
