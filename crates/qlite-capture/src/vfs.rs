//! [`CaptureVfs`]: a [`Vfs`] wrapper whose WAL-mode databases hold committed
//! transactions back until they are applied.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::Mutex;
use qlite_error::Result;
use qlite_types::flags::{AccessFlags, VfsOpenFlags};
use qlite_types::Cx;
use qlite_vfs::Vfs;
use tracing::debug;

use crate::config::CaptureConfig;
use crate::file::{CaptureFile, FileRole};
use crate::state::Tracker;

const WAL_SUFFIX: &str = "-wal";

/// Wraps a backend VFS and captures WAL commits.
///
/// Main-database and WAL files of the same database share one
/// [`Tracker`]; every other file passes straight through.
pub struct CaptureVfs<V: Vfs> {
    inner: V,
    config: CaptureConfig,
    /// Trackers keyed by database path. An entry goes once its last handle
    /// is gone and no dropped writer is waiting for apply.
    trackers: Mutex<HashMap<PathBuf, Arc<Mutex<Tracker>>>>,
}

impl<V: Vfs> CaptureVfs<V> {
    pub fn new(inner: V, config: CaptureConfig) -> Self {
        debug!(
            vfs = %config.vfs_name,
            inner = inner.name(),
            page_size = config.page_size.get(),
            "capture VFS created"
        );
        Self {
            inner,
            config,
            trackers: Mutex::new(HashMap::new()),
        }
    }

    #[must_use]
    pub fn config(&self) -> &CaptureConfig {
        &self.config
    }

    #[must_use]
    pub fn inner(&self) -> &V {
        &self.inner
    }

    /// Number of databases with an open handle or a transaction left
    /// captured by a dropped writer.
    #[must_use]
    pub fn tracked_databases(&self) -> usize {
        self.trackers.lock().values().filter(|t| in_use(t)).count()
    }

    fn tracker_for(&self, db_path: PathBuf) -> Arc<Mutex<Tracker>> {
        let mut trackers = self.trackers.lock();
        trackers.retain(|_, tracker| in_use(tracker));
        if let Some(tracker) = trackers.get(&db_path) {
            return Arc::clone(tracker);
        }
        let tracker = Arc::new(Mutex::new(Tracker::new(self.config.page_size.get())));
        debug!(db = %db_path.display(), "capture tracker created");
        trackers.insert(db_path, Arc::clone(&tracker));
        tracker
    }
}

fn in_use(tracker: &Arc<Mutex<Tracker>>) -> bool {
    Arc::strong_count(tracker) > 1 || tracker.lock().has_orphaned_writer()
}

/// The database a WAL file belongs to: `<db>-wal` maps to `<db>`.
fn database_path(wal_path: &Path) -> PathBuf {
    let raw = wal_path.as_os_str().to_string_lossy();
    raw.strip_suffix(WAL_SUFFIX)
        .map_or_else(|| wal_path.to_path_buf(), PathBuf::from)
}

impl<V: Vfs> Vfs for CaptureVfs<V>
where
    V::File: 'static,
{
    type File = CaptureFile<V::File>;

    fn name(&self) -> &str {
        &self.config.vfs_name
    }

    fn open(
        &self,
        cx: &Cx,
        path: Option<&Path>,
        flags: VfsOpenFlags,
    ) -> Result<(Self::File, VfsOpenFlags)> {
        let (inner_file, out_flags) = self.inner.open(cx, path, flags)?;
        let kind = flags.file_kind();
        let role = if kind.contains(VfsOpenFlags::MAIN_DB) {
            FileRole::MainDb
        } else if kind.contains(VfsOpenFlags::WAL) {
            FileRole::Wal
        } else {
            FileRole::Other
        };

        let tracker = match (role, path) {
            (FileRole::Other, _) | (_, None) => None,
            (role, Some(path)) => {
                let full = self.inner.full_pathname(cx, path)?;
                let db_path = if role == FileRole::Wal {
                    database_path(&full)
                } else {
                    full
                };
                Some(self.tracker_for(db_path))
            }
        };
        let role = if tracker.is_some() { role } else { FileRole::Other };
        Ok((
            CaptureFile::new(inner_file, role, tracker, &self.config),
            out_flags,
        ))
    }

    fn delete(&self, cx: &Cx, path: &Path, sync_dir: bool) -> Result<()> {
        self.inner.delete(cx, path, sync_dir)
    }

    fn access(&self, cx: &Cx, path: &Path, flags: AccessFlags) -> Result<bool> {
        self.inner.access(cx, path, flags)
    }

    fn full_pathname(&self, cx: &Cx, path: &Path) -> Result<PathBuf> {
        self.inner.full_pathname(cx, path)
    }
}
