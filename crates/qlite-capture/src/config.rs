//! Capture VFS configuration.

use qlite_types::PageSize;

/// Name the capture VFS registers under when none is given.
pub const DEFAULT_VFS_NAME: &str = "capture";

/// Configuration for a [`CaptureVfs`](crate::CaptureVfs).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CaptureConfig {
    /// Name reported by [`Vfs::name`](qlite_vfs::Vfs::name).
    pub vfs_name: String,
    /// Page size of every database opened through the VFS. WAL headers
    /// announcing another size are refused.
    pub page_size: PageSize,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            vfs_name: DEFAULT_VFS_NAME.to_owned(),
            page_size: PageSize::DEFAULT,
        }
    }
}

impl CaptureConfig {
    #[must_use]
    pub fn with_vfs_name(mut self, name: impl Into<String>) -> Self {
        self.vfs_name = name.into();
        self
    }

    #[must_use]
    pub const fn with_page_size(mut self, page_size: PageSize) -> Self {
        self.page_size = page_size;
        self
    }

    /// Size of one WAL frame (header plus page) in bytes.
    #[must_use]
    pub(crate) const fn frame_size(&self) -> usize {
        qlite_wal::WAL_FRAME_HEADER_SIZE + self.page_size.as_usize()
    }
}
