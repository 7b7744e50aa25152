//! SQLite-format WAL: checksums, the WAL file, the shared-memory WAL index
//! and the engine-side session that drives them.

pub mod checksum;
pub mod metrics;
pub mod session;
pub mod wal;
pub mod wal_index;

pub use checksum::{
    SqliteWalChecksum, WalFrameHeader, WalHeader, WalSalts, WAL_FORMAT_VERSION,
    WAL_FRAME_HEADER_SIZE, WAL_HEADER_SIZE, WAL_MAGIC_BE, WAL_MAGIC_LE,
};
pub use metrics::{WalMetrics, WalMetricsSnapshot, GLOBAL_WAL_METRICS};
pub use session::{next_salts, WalSession, WalSessionConfig, WalSnapshot, WAL_READER_SLOT};
pub use wal::{frame_offset, WalFile};
pub use wal_index::{
    read_index_hdr_bytes, read_shm_header, write_ckpt_info, write_index_hdr,
    write_index_hdr_bytes, WalCkptInfo, WalIndexHdr, WAL_CKPT_INFO_BYTES, WAL_CKPT_LOCK,
    WAL_INDEX_AREA_BYTES, WAL_INDEX_HDR_BYTES, WAL_INDEX_VERSION, WAL_READ_LOCK_BASE,
    WAL_READ_MARK_COUNT, WAL_WRITE_LOCK,
};
