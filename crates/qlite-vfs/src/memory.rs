//! Process-local VFS used by tests and in-memory databases.
//!
//! Every handle opened on the same path shares one byte buffer, and every
//! handle on a database path shares one shared-memory area with a real
//! shared/exclusive lock table, so several connections in one process
//! behave like several processes on a disk file.

use std::collections::HashMap;
use std::ops::Range;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use qlite_error::{QliteError, Result};
use qlite_types::flags::{AccessFlags, ShmLockFlags, SyncFlags, VfsOpenFlags};
use qlite_types::{Cx, LockLevel};
use tracing::trace;

use crate::shm::ShmRegion;
use crate::traits::{FileControl, FileControlOutcome, Vfs, VfsFile, SHM_NLOCK};

type Bytes = Arc<Mutex<Vec<u8>>>;
type Shm = Arc<Mutex<ShmState>>;

/// Holders of one lock slot, by handle id.
#[derive(Debug, Default)]
struct LockSlot {
    writer: Option<u64>,
    readers: Vec<u64>,
}

impl LockSlot {
    fn blocks_shared(&self, handle: u64) -> bool {
        matches!(self.writer, Some(w) if w != handle)
    }

    fn blocks_exclusive(&self, handle: u64) -> bool {
        self.blocks_shared(handle) || self.readers.iter().any(|&r| r != handle)
    }

    fn drop_shared(&mut self, handle: u64) {
        self.readers.retain(|&r| r != handle);
    }

    fn drop_exclusive(&mut self, handle: u64) {
        if self.writer == Some(handle) {
            self.writer = None;
        }
    }
}

#[derive(Debug, Default)]
struct ShmState {
    regions: Vec<ShmRegion>,
    slots: [LockSlot; SHM_NLOCK as usize],
}

impl ShmState {
    fn forget(&mut self, handle: u64) {
        for slot in &mut self.slots {
            slot.drop_shared(handle);
            slot.drop_exclusive(handle);
        }
    }
}

#[derive(Debug, Default)]
struct Namespace {
    files: HashMap<PathBuf, Bytes>,
    shm: HashMap<PathBuf, Shm>,
    anonymous: u64,
}

/// An in-memory VFS. Clones share one namespace.
#[derive(Debug, Clone, Default)]
pub struct MemoryVfs {
    names: Arc<Mutex<Namespace>>,
}

static HANDLE_IDS: AtomicU64 = AtomicU64::new(1);

impl MemoryVfs {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl Vfs for MemoryVfs {
    type File = MemoryFile;

    fn name(&self) -> &str {
        "memory"
    }

    fn open(
        &self,
        _cx: &Cx,
        path: Option<&Path>,
        flags: VfsOpenFlags,
    ) -> Result<(Self::File, VfsOpenFlags)> {
        let create = flags.contains(VfsOpenFlags::CREATE);
        let (path, bytes) = {
            let mut names = self.names.lock();
            let path = match path {
                Some(p) => p.to_path_buf(),
                None => {
                    names.anonymous += 1;
                    PathBuf::from(format!("__anon_{}__", names.anonymous))
                }
            };
            let bytes = match names.files.get(&path) {
                Some(bytes) => Arc::clone(bytes),
                None if create => Arc::clone(names.files.entry(path.clone()).or_default()),
                None => return Err(QliteError::CannotOpen { path }),
            };
            (path, bytes)
        };

        let file = MemoryFile {
            id: HANDLE_IDS.fetch_add(1, Ordering::Relaxed),
            path,
            bytes,
            shm: None,
            lock_level: LockLevel::None,
            delete_on_close: flags.contains(VfsOpenFlags::DELETEONCLOSE),
            names: Arc::clone(&self.names),
        };
        let granted = if create {
            flags | VfsOpenFlags::READWRITE
        } else {
            flags
        };
        Ok((file, granted))
    }

    fn delete(&self, _cx: &Cx, path: &Path, _sync_dir: bool) -> Result<()> {
        self.names.lock().files.remove(path);
        Ok(())
    }

    fn access(&self, _cx: &Cx, path: &Path, _flags: AccessFlags) -> Result<bool> {
        Ok(self.names.lock().files.contains_key(path))
    }

    fn full_pathname(&self, _cx: &Cx, path: &Path) -> Result<PathBuf> {
        Ok(Path::new("/").join(path))
    }
}

/// A handle on a [`MemoryVfs`] file.
#[derive(Debug)]
pub struct MemoryFile {
    id: u64,
    path: PathBuf,
    bytes: Bytes,
    shm: Option<Shm>,
    lock_level: LockLevel,
    delete_on_close: bool,
    names: Arc<Mutex<Namespace>>,
}

impl MemoryFile {
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Attach to the shared-memory area of this path on first use.
    fn shm(&mut self) -> Shm {
        let names = &self.names;
        let path = &self.path;
        Arc::clone(self.shm.get_or_insert_with(|| {
            Arc::clone(names.lock().shm.entry(path.clone()).or_default())
        }))
    }

    fn drop_shm_locks(&self) {
        if let Some(shm) = &self.shm {
            shm.lock().forget(self.id);
        }
    }
}

fn lock_slots(offset: u32, n: u32) -> Result<Range<usize>> {
    match offset.checked_add(n) {
        Some(end) if n > 0 && end <= SHM_NLOCK => Ok(offset as usize..end as usize),
        _ => Err(QliteError::LockFailed {
            detail: format!("shm lock range {offset}+{n} outside 0..{SHM_NLOCK}"),
        }),
    }
}

fn to_index(offset: u64) -> Result<usize> {
    usize::try_from(offset).map_err(|_| QliteError::Internal(format!("offset {offset} too large")))
}

impl VfsFile for MemoryFile {
    fn close(&mut self, _cx: &Cx) -> Result<()> {
        self.drop_shm_locks();
        if self.delete_on_close {
            self.names.lock().files.remove(&self.path);
        }
        self.lock_level = LockLevel::None;
        Ok(())
    }

    fn read(&mut self, _cx: &Cx, buf: &mut [u8], offset: u64) -> Result<usize> {
        let start = to_index(offset)?;
        let bytes = self.bytes.lock();
        let available = bytes.get(start..).unwrap_or_default();
        let n = available.len().min(buf.len());
        buf[..n].copy_from_slice(&available[..n]);
        buf[n..].fill(0);
        Ok(n)
    }

    fn write(&mut self, _cx: &Cx, buf: &[u8], offset: u64) -> Result<()> {
        let start = to_index(offset)?;
        let end = start + buf.len();
        let mut bytes = self.bytes.lock();
        if bytes.len() < end {
            bytes.resize(end, 0);
        }
        bytes[start..end].copy_from_slice(buf);
        Ok(())
    }

    fn truncate(&mut self, _cx: &Cx, size: u64) -> Result<()> {
        let size = to_index(size)?;
        self.bytes.lock().truncate(size);
        Ok(())
    }

    fn sync(&mut self, _cx: &Cx, _flags: SyncFlags) -> Result<()> {
        Ok(())
    }

    fn file_size(&self, _cx: &Cx) -> Result<u64> {
        Ok(self.bytes.lock().len() as u64)
    }

    fn lock(&mut self, _cx: &Cx, level: LockLevel) -> Result<()> {
        self.lock_level = self.lock_level.max(level);
        Ok(())
    }

    fn unlock(&mut self, _cx: &Cx, level: LockLevel) -> Result<()> {
        self.lock_level = self.lock_level.min(level);
        Ok(())
    }

    fn check_reserved_lock(&self, _cx: &Cx) -> Result<bool> {
        Ok(false)
    }

    fn shm_map(
        &mut self,
        _cx: &Cx,
        region: u32,
        size: u32,
        extend: bool,
    ) -> Result<Option<ShmRegion>> {
        let shm = self.shm();
        let mut state = shm.lock();
        let wanted = region as usize;
        if wanted >= state.regions.len() && !extend {
            return Ok(None);
        }
        while state.regions.len() <= wanted {
            state.regions.push(ShmRegion::new(size as usize));
        }
        Ok(Some(state.regions[wanted].clone()))
    }

    fn shm_lock(&mut self, _cx: &Cx, offset: u32, n: u32, flags: ShmLockFlags) -> Result<()> {
        if !flags.is_well_formed() {
            return Err(QliteError::LockFailed {
                detail: format!("malformed shm lock flags {:#x}", flags.bits()),
            });
        }
        let range = lock_slots(offset, n)?;
        let handle = self.id;
        let exclusive = flags.contains(ShmLockFlags::EXCLUSIVE);
        let shm = self.shm();
        let mut state = shm.lock();
        let slots = &mut state.slots[range];

        if flags.contains(ShmLockFlags::UNLOCK) {
            for slot in slots {
                if exclusive {
                    slot.drop_exclusive(handle);
                } else {
                    slot.drop_shared(handle);
                }
            }
            return Ok(());
        }

        let busy = if exclusive {
            slots.iter().any(|s| s.blocks_exclusive(handle))
        } else {
            slots.iter().any(|s| s.blocks_shared(handle))
        };
        if busy {
            trace!(handle, offset, n, exclusive, "shm lock busy");
            return Err(QliteError::Busy);
        }
        for slot in slots {
            if exclusive {
                slot.drop_shared(handle);
                slot.writer = Some(handle);
            } else if slot.writer != Some(handle) && !slot.readers.contains(&handle) {
                slot.readers.push(handle);
            }
        }
        Ok(())
    }

    fn shm_barrier(&self) {
        std::sync::atomic::fence(Ordering::SeqCst);
    }

    fn shm_unmap(&mut self, _cx: &Cx, delete: bool) -> Result<()> {
        self.drop_shm_locks();
        self.shm = None;
        if delete {
            self.names.lock().shm.remove(&self.path);
        }
        Ok(())
    }

    fn file_control(&mut self, _cx: &Cx, op: FileControl) -> Result<FileControlOutcome> {
        match op {
            FileControl::LockState => Ok(FileControlOutcome::LockLevel(self.lock_level)),
            _ => Err(QliteError::FileControlNotFound { op: op.name() }),
        }
    }
}

impl Drop for MemoryFile {
    fn drop(&mut self) {
        self.drop_shm_locks();
    }
}
