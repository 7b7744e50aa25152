use std::path::{Path, PathBuf};

use qlite_error::{QliteError, Result};
use qlite_types::flags::{AccessFlags, ShmLockFlags, SyncFlags, VfsOpenFlags};
use qlite_types::{CapturedFrame, Cx, LockLevel, WalSlice};

use crate::shm::ShmRegion;

/// Bytes per shared-memory region.
pub const SHM_REGION_SIZE: u32 = 32 * 1024;

/// Lock slots in a database's shared memory.
pub const SHM_NLOCK: u32 = 8;

/// A filesystem the storage engine opens its database, WAL and shared
/// memory through.
///
/// Backends range from the in-memory [`MemoryVfs`](crate::MemoryVfs) to
/// wrappers that watch and veto traffic to an inner VFS.
pub trait Vfs: Send + Sync {
    type File: VfsFile;

    /// Name under which the VFS is registered.
    fn name(&self) -> &str;

    /// Open `path`, or an anonymous temporary file when `path` is `None`.
    ///
    /// `flags` names the file's role and the open mode. The returned flags
    /// are the ones granted, which may add `READWRITE` to a `CREATE`.
    fn open(
        &self,
        cx: &Cx,
        path: Option<&Path>,
        flags: VfsOpenFlags,
    ) -> Result<(Self::File, VfsOpenFlags)>;

    fn delete(&self, cx: &Cx, path: &Path, sync_dir: bool) -> Result<()>;

    fn access(&self, cx: &Cx, path: &Path, flags: AccessFlags) -> Result<bool>;

    fn full_pathname(&self, cx: &Cx, path: &Path) -> Result<PathBuf>;
}

/// Extended operations reached through [`VfsFile::file_control`].
///
/// Plain backends answer only [`FileControl::LockState`]; wrapping layers add
/// their own opcodes and forward the rest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FileControl {
    /// Report the file's current lock level.
    LockState,
    /// Metadata of the captured transaction, without frame data.
    ShallowPoll,
    /// Metadata plus the captured frames.
    Poll,
    /// Make the captured transaction visible and release the write lock.
    Apply,
}

impl FileControl {
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::LockState => "lock_state",
            Self::ShallowPoll => "shallow_poll",
            Self::Poll => "poll",
            Self::Apply => "apply",
        }
    }
}

/// Successful result of a [`VfsFile::file_control`] call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FileControlOutcome {
    /// The operation completed and has nothing to report.
    Ack,
    LockLevel(LockLevel),
    Slice(WalSlice),
    Frames {
        slice: WalSlice,
        frames: Vec<CapturedFrame>,
    },
}

/// An open file: byte I/O, whole-file locks and, for database files, the
/// shared memory that holds the WAL index.
pub trait VfsFile: Send + Sync {
    /// A failed close leaves the handle open and usable.
    fn close(&mut self, cx: &Cx) -> Result<()>;

    /// Fill `buf` from `offset` and return how many bytes the file had.
    ///
    /// The part of `buf` past the end of the file is zeroed.
    fn read(&mut self, cx: &Cx, buf: &mut [u8], offset: u64) -> Result<usize>;

    fn write(&mut self, cx: &Cx, buf: &[u8], offset: u64) -> Result<()>;

    fn truncate(&mut self, cx: &Cx, size: u64) -> Result<()>;

    fn sync(&mut self, cx: &Cx, flags: SyncFlags) -> Result<()>;

    fn file_size(&self, cx: &Cx) -> Result<u64>;

    /// Raise the whole-file lock to at least `level`.
    fn lock(&mut self, cx: &Cx, level: LockLevel) -> Result<()>;

    /// Lower the whole-file lock to at most `level`.
    fn unlock(&mut self, cx: &Cx, level: LockLevel) -> Result<()>;

    /// Whether another connection holds RESERVED or higher.
    fn check_reserved_lock(&self, cx: &Cx) -> Result<bool>;

    /// Map region `region` of `size` bytes.
    ///
    /// A missing region is created only when `extend` is set; otherwise the
    /// result is `Ok(None)`.
    fn shm_map(&mut self, cx: &Cx, region: u32, size: u32, extend: bool)
        -> Result<Option<ShmRegion>>;

    /// Take or release slots `offset..offset + n`.
    ///
    /// A request that conflicts with another handle fails with
    /// [`QliteError::Busy`] and takes nothing.
    fn shm_lock(&mut self, cx: &Cx, offset: u32, n: u32, flags: ShmLockFlags) -> Result<()>;

    fn shm_barrier(&self);

    /// Drop this handle's mapping and slot locks, discarding the shared
    /// memory itself when `delete` is set.
    fn shm_unmap(&mut self, cx: &Cx, delete: bool) -> Result<()>;

    /// Opcodes a file does not know fail with
    /// [`QliteError::FileControlNotFound`].
    fn file_control(&mut self, cx: &Cx, op: FileControl) -> Result<FileControlOutcome> {
        let _ = cx;
        Err(QliteError::FileControlNotFound { op: op.name() })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// A file with no storage, to exercise the provided methods.
    struct Inert;

    impl VfsFile for Inert {
        fn close(&mut self, _cx: &Cx) -> Result<()> {
            Ok(())
        }
        fn read(&mut self, _cx: &Cx, buf: &mut [u8], _offset: u64) -> Result<usize> {
            buf.fill(0);
            Ok(0)
        }
        fn write(&mut self, _cx: &Cx, _buf: &[u8], _offset: u64) -> Result<()> {
            Err(QliteError::Unsupported)
        }
        fn truncate(&mut self, _cx: &Cx, _size: u64) -> Result<()> {
            Err(QliteError::Unsupported)
        }
        fn sync(&mut self, _cx: &Cx, _flags: SyncFlags) -> Result<()> {
            Ok(())
        }
        fn file_size(&self, _cx: &Cx) -> Result<u64> {
            Ok(0)
        }
        fn lock(&mut self, _cx: &Cx, _level: LockLevel) -> Result<()> {
            Ok(())
        }
        fn unlock(&mut self, _cx: &Cx, _level: LockLevel) -> Result<()> {
            Ok(())
        }
        fn check_reserved_lock(&self, _cx: &Cx) -> Result<bool> {
            Ok(false)
        }
        fn shm_map(
            &mut self,
            _cx: &Cx,
            _region: u32,
            _size: u32,
            _extend: bool,
        ) -> Result<Option<ShmRegion>> {
            Ok(None)
        }
        fn shm_lock(
            &mut self,
            _cx: &Cx,
            _offset: u32,
            _n: u32,
            _flags: ShmLockFlags,
        ) -> Result<()> {
            Err(QliteError::Unsupported)
        }
        fn shm_barrier(&self) {}
        fn shm_unmap(&mut self, _cx: &Cx, _delete: bool) -> Result<()> {
            Ok(())
        }
    }

    #[test]
    fn files_work_as_trait_objects() {
        let cx = Cx::new();
        let mut files: Vec<Box<dyn VfsFile>> = vec![Box::new(Inert)];
        let mut buf = [0xFF; 4];
        assert_eq!(files[0].read(&cx, &mut buf, 0).unwrap(), 0);
        assert_eq!(buf, [0; 4]);
    }

    #[test]
    fn unknown_file_controls_are_not_found() {
        let cx = Cx::new();
        for op in [
            FileControl::LockState,
            FileControl::ShallowPoll,
            FileControl::Poll,
            FileControl::Apply,
        ] {
            let err = Inert.file_control(&cx, op).unwrap_err();
            assert!(
                matches!(err, QliteError::FileControlNotFound { op: name } if name == op.name()),
                "{op:?}"
            );
        }
    }
}
