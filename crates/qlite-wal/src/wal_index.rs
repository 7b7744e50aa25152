//! The WAL index kept at the start of shared-memory region 0.
//!
//! Two copies of [`WalIndexHdr`] are followed by [`WalCkptInfo`]. A writer
//! updates the second copy before the first, so a reader that finds the
//! copies equal has a header no writer was halfway through. Everything here
//! is in native byte order because the index is rebuilt from the WAL after
//! a crash and never leaves the machine.

use qlite_error::{QliteError, Result};
use qlite_types::WalSalts;
use qlite_vfs::ShmRegion;

use crate::checksum::SqliteWalChecksum;

pub const WAL_INDEX_VERSION: u32 = 3_007_000;

/// Bytes in one header copy.
pub const WAL_INDEX_HDR_BYTES: usize = 48;
/// Bytes in the checkpoint block.
pub const WAL_CKPT_INFO_BYTES: usize = 40;
const CKPT_INFO_OFFSET: usize = 2 * WAL_INDEX_HDR_BYTES;
/// Bytes the index header area spans in region 0.
pub const WAL_INDEX_AREA_BYTES: usize = CKPT_INFO_OFFSET + WAL_CKPT_INFO_BYTES;

pub const WAL_READ_MARK_COUNT: usize = 5;

/// Lock slot held by the one writer.
pub const WAL_WRITE_LOCK: u32 = 0;
/// Lock slot held while backfilling into the database file.
pub const WAL_CKPT_LOCK: u32 = 1;
/// First of the reader lock slots.
pub const WAL_READ_LOCK_BASE: u32 = 3;

/// Bytes of a header copy covered by its checksum.
const HDR_BODY: usize = 40;

/// One copy of the WAL-index header.
///
/// ```text
/// Offset  Size  Field
///   0       4   version, 3007000
///   8       4   change counter, bumped per commit
///  12       1   initialized flag
///  13       1   big-endian WAL checksums flag
///  14       2   page size (65536 stored as 1)
///  16       4   mx_frame: last committed frame
///  20       4   n_page: database size in pages
///  24       8   rolling WAL checksum after mx_frame
///  32       8   WAL salts
///  40       8   checksum of bytes 0..40
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct WalIndexHdr {
    pub version: u32,
    pub i_change: u32,
    pub initialized: bool,
    pub big_endian_cksum: bool,
    pub page_size: u32,
    pub mx_frame: u32,
    pub n_page: u32,
    pub a_frame_cksum: [u32; 2],
    pub a_salt: [u32; 2],
    pub a_cksum: [u32; 2],
}

impl WalIndexHdr {
    /// An initialized header for an empty WAL epoch. Not yet sealed.
    #[must_use]
    pub fn new(page_size: u32, salts: WalSalts, frame_cksum: SqliteWalChecksum) -> Self {
        Self {
            version: WAL_INDEX_VERSION,
            initialized: true,
            page_size,
            a_frame_cksum: frame_cksum.to_array(),
            a_salt: salts.to_array(),
            ..Self::default()
        }
    }

    pub fn from_bytes(buf: &[u8]) -> Result<Self> {
        let buf = prefix(buf, WAL_INDEX_HDR_BYTES, "WAL-index header")?;
        let word = |n: usize| ne_u32(buf, 4 * n);
        Ok(Self {
            version: word(0),
            i_change: word(2),
            initialized: buf[12] != 0,
            big_endian_cksum: buf[13] != 0,
            page_size: match u16::from_ne_bytes([buf[14], buf[15]]) {
                1 => 65_536,
                n => u32::from(n),
            },
            mx_frame: word(4),
            n_page: word(5),
            a_frame_cksum: [word(6), word(7)],
            a_salt: [word(8), word(9)],
            a_cksum: [word(10), word(11)],
        })
    }

    #[must_use]
    pub fn to_bytes(&self) -> [u8; WAL_INDEX_HDR_BYTES] {
        let mut buf = [0u8; WAL_INDEX_HDR_BYTES];
        put_ne_u32(&mut buf, 0, self.version);
        put_ne_u32(&mut buf, 8, self.i_change);
        buf[12] = u8::from(self.initialized);
        buf[13] = u8::from(self.big_endian_cksum);
        let sz_page = u16::try_from(self.page_size).unwrap_or(1);
        buf[14..16].copy_from_slice(&sz_page.to_ne_bytes());
        let tail = [
            self.mx_frame,
            self.n_page,
            self.a_frame_cksum[0],
            self.a_frame_cksum[1],
            self.a_salt[0],
            self.a_salt[1],
            self.a_cksum[0],
            self.a_cksum[1],
        ];
        for (n, value) in tail.into_iter().enumerate() {
            put_ne_u32(&mut buf, 16 + 4 * n, value);
        }
        buf
    }

    #[must_use]
    pub const fn is_initialized(&self) -> bool {
        self.initialized && self.version == WAL_INDEX_VERSION
    }

    #[must_use]
    pub const fn salts(&self) -> WalSalts {
        WalSalts::new(self.a_salt[0], self.a_salt[1])
    }

    #[must_use]
    pub const fn frame_checksum(&self) -> SqliteWalChecksum {
        SqliteWalChecksum::from_array(self.a_frame_cksum)
    }

    fn expected_checksum(&self) -> [u32; 2] {
        SqliteWalChecksum::default()
            .fold_aligned(&self.to_bytes()[..HDR_BODY], cfg!(target_endian = "big"))
            .to_array()
    }

    /// Return a copy carrying its own checksum.
    #[must_use]
    pub fn sealed(mut self) -> Self {
        self.a_cksum = self.expected_checksum();
        self
    }

    #[must_use]
    pub fn checksum_valid(&self) -> bool {
        self.a_cksum == self.expected_checksum()
    }
}

/// The checkpoint block at offset 96 of region 0.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct WalCkptInfo {
    /// Frames already copied into the database file.
    pub n_backfill: u32,
    pub read_marks: [u32; WAL_READ_MARK_COUNT],
    pub n_backfill_attempted: u32,
}

impl WalCkptInfo {
    pub fn from_bytes(buf: &[u8]) -> Result<Self> {
        let buf = prefix(buf, WAL_CKPT_INFO_BYTES, "WAL checkpoint info")?;
        let word = |n: usize| ne_u32(buf, 4 * n);
        Ok(Self {
            n_backfill: word(0),
            read_marks: std::array::from_fn(|i| word(1 + i)),
            n_backfill_attempted: word(8),
        })
    }

    /// Encode the block. The eight lock bytes at 24..32 stay zero.
    #[must_use]
    pub fn to_bytes(&self) -> [u8; WAL_CKPT_INFO_BYTES] {
        let mut buf = [0u8; WAL_CKPT_INFO_BYTES];
        put_ne_u32(&mut buf, 0, self.n_backfill);
        for (i, mark) in self.read_marks.into_iter().enumerate() {
            put_ne_u32(&mut buf, 4 + 4 * i, mark);
        }
        put_ne_u32(&mut buf, 32, self.n_backfill_attempted);
        buf
    }
}

/// Header and checkpoint block of region 0, or `None` while the two header
/// copies disagree.
pub fn read_shm_header(region: &ShmRegion) -> Result<Option<(WalIndexHdr, WalCkptInfo)>> {
    let area = region.lock();
    let area = prefix(&area, WAL_INDEX_AREA_BYTES, "WAL-index area")?;
    let (first, rest) = area.split_at(WAL_INDEX_HDR_BYTES);
    if first != &rest[..WAL_INDEX_HDR_BYTES] {
        return Ok(None);
    }
    Ok(Some((
        WalIndexHdr::from_bytes(first)?,
        WalCkptInfo::from_bytes(&area[CKPT_INFO_OFFSET..])?,
    )))
}

/// Publish `hdr` to both copies.
pub fn write_index_hdr(region: &ShmRegion, hdr: &WalIndexHdr) {
    write_index_hdr_bytes(region, &hdr.to_bytes());
}

pub fn write_ckpt_info(region: &ShmRegion, ckpt: &WalCkptInfo) {
    region.write_bytes(CKPT_INFO_OFFSET, &ckpt.to_bytes());
}

/// The first header copy, byte for byte.
#[must_use]
pub fn read_index_hdr_bytes(region: &ShmRegion) -> [u8; WAL_INDEX_HDR_BYTES] {
    let mut out = [0u8; WAL_INDEX_HDR_BYTES];
    region.read_into(0, &mut out);
    out
}

/// Overwrite both copies, second copy first.
pub fn write_index_hdr_bytes(region: &ShmRegion, bytes: &[u8; WAL_INDEX_HDR_BYTES]) {
    region.write_bytes(WAL_INDEX_HDR_BYTES, bytes);
    region.write_bytes(0, bytes);
}

fn prefix<'a>(buf: &'a [u8], len: usize, what: &str) -> Result<&'a [u8]> {
    buf.get(..len).ok_or_else(|| {
        QliteError::wal_corrupt(format!("{what} needs {len} bytes, got {}", buf.len()))
    })
}

fn ne_u32(buf: &[u8], offset: usize) -> u32 {
    u32::from_ne_bytes([
        buf[offset],
        buf[offset + 1],
        buf[offset + 2],
        buf[offset + 3],
    ])
}

fn put_ne_u32(buf: &mut [u8], offset: usize, value: u32) {
    buf[offset..offset + 4].copy_from_slice(&value.to_ne_bytes());
}
