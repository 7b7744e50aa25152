//! Bit flags for VFS open, sync, access and shared-memory lock calls.
//!
//! Numeric values match the corresponding `SQLITE_OPEN_*`, `SQLITE_SYNC_*`,
//! `SQLITE_ACCESS_*` and `SQLITE_SHM_*` constants.

bitflags::bitflags! {
    /// How a file is opened and what role it plays.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct VfsOpenFlags: u32 {
        const READONLY = 0x0000_0001;
        const READWRITE = 0x0000_0002;
        const CREATE = 0x0000_0004;
        const DELETEONCLOSE = 0x0000_0008;
        const EXCLUSIVE = 0x0000_0010;
        /// Main database file.
        const MAIN_DB = 0x0000_0100;
        /// Temporary database file.
        const TEMP_DB = 0x0000_0200;
        /// Rollback journal of the main database.
        const MAIN_JOURNAL = 0x0000_0800;
        /// Write-ahead log of the main database.
        const WAL = 0x0008_0000;
    }
}

impl VfsOpenFlags {
    /// The role bits of these flags, with the access-mode bits removed.
    #[must_use]
    pub fn file_kind(self) -> Self {
        self & (Self::MAIN_DB | Self::TEMP_DB | Self::MAIN_JOURNAL | Self::WAL)
    }
}

bitflags::bitflags! {
    /// Kind of sync requested from `VfsFile::sync`.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct SyncFlags: u8 {
        const NORMAL = 0x02;
        const FULL = 0x03;
        const DATAONLY = 0x10;
    }
}

bitflags::bitflags! {
    /// Access checks for `Vfs::access`.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct AccessFlags: u8 {
        const EXISTS = 0x00;
        const READWRITE = 0x01;
        const READ = 0x02;
    }
}

bitflags::bitflags! {
    /// Shared-memory lock request passed to `VfsFile::shm_lock`.
    ///
    /// Exactly one of `LOCK` / `UNLOCK` and exactly one of `SHARED` /
    /// `EXCLUSIVE` must be set.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct ShmLockFlags: u8 {
        const UNLOCK = 0x01;
        const LOCK = 0x02;
        const SHARED = 0x04;
        const EXCLUSIVE = 0x08;
    }
}

impl ShmLockFlags {
    /// Acquire an exclusive lock.
    pub const LOCK_EXCLUSIVE: Self = Self::LOCK.union(Self::EXCLUSIVE);
    /// Release an exclusive lock.
    pub const UNLOCK_EXCLUSIVE: Self = Self::UNLOCK.union(Self::EXCLUSIVE);
    /// Acquire a shared lock.
    pub const LOCK_SHARED: Self = Self::LOCK.union(Self::SHARED);
    /// Release a shared lock.
    pub const UNLOCK_SHARED: Self = Self::UNLOCK.union(Self::SHARED);

    /// Whether the combination names exactly one action and one mode.
    #[must_use]
    pub fn is_well_formed(self) -> bool {
        self.contains(Self::LOCK) != self.contains(Self::UNLOCK)
            && self.contains(Self::SHARED) != self.contains(Self::EXCLUSIVE)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn open_flags_file_kind() {
        let flags = VfsOpenFlags::WAL | VfsOpenFlags::CREATE | VfsOpenFlags::READWRITE;
        assert_eq!(flags.file_kind(), VfsOpenFlags::WAL);
        let flags = VfsOpenFlags::MAIN_DB | VfsOpenFlags::READWRITE;
        assert_eq!(flags.file_kind(), VfsOpenFlags::MAIN_DB);
    }

    #[test]
    fn shm_lock_flags_well_formed() {
        assert!(ShmLockFlags::LOCK_EXCLUSIVE.is_well_formed());
        assert!(ShmLockFlags::UNLOCK_SHARED.is_well_formed());
        assert!(!ShmLockFlags::LOCK.is_well_formed());
        assert!(!(ShmLockFlags::LOCK | ShmLockFlags::UNLOCK | ShmLockFlags::SHARED).is_well_formed());
        assert!(!(ShmLockFlags::LOCK | ShmLockFlags::SHARED | ShmLockFlags::EXCLUSIVE).is_well_formed());
    }

    #[test]
    fn shm_lock_flag_values_match_sqlite() {
        assert_eq!(ShmLockFlags::LOCK_EXCLUSIVE.bits(), 10);
        assert_eq!(ShmLockFlags::UNLOCK_EXCLUSIVE.bits(), 9);
        assert_eq!(ShmLockFlags::LOCK_SHARED.bits(), 6);
        assert_eq!(ShmLockFlags::UNLOCK_SHARED.bits(), 5);
    }
}
