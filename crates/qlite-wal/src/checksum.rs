//! WAL header and frame-header codecs plus SQLite's rolling checksum.
//!
//! Every multi-byte field in the WAL file is big-endian. The checksum words
//! themselves are read in the byte order named by the header magic.

use qlite_error::{QliteError, Result};
pub use qlite_types::WalSalts;

/// SQLite WAL header size.
pub const WAL_HEADER_SIZE: usize = 32;
/// SQLite WAL frame header size.
pub const WAL_FRAME_HEADER_SIZE: usize = 24;

/// Magic for little-endian checksum words.
pub const WAL_MAGIC_LE: u32 = 0x377F_0682;
/// Magic for big-endian checksum words.
pub const WAL_MAGIC_BE: u32 = 0x377F_0683;
pub const WAL_FORMAT_VERSION: u32 = 3_007_000;

/// Bytes of the WAL header covered by its own checksum.
const HEADER_BODY: usize = 24;

/// SQLite cumulative checksum pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SqliteWalChecksum {
    pub s1: u32,
    pub s2: u32,
}

impl SqliteWalChecksum {
    #[must_use]
    pub const fn to_array(self) -> [u32; 2] {
        [self.s1, self.s2]
    }

    #[must_use]
    pub const fn from_array([s1, s2]: [u32; 2]) -> Self {
        Self { s1, s2 }
    }

    /// Fold `data` into this checksum two words at a time.
    ///
    /// `data` must be a multiple of 8 bytes long.
    pub fn fold(self, data: &[u8], big_endian: bool) -> Result<Self> {
        if data.len() % 8 != 0 {
            return Err(QliteError::wal_corrupt(format!(
                "checksum input of {} bytes is not 8-byte aligned",
                data.len()
            )));
        }
        Ok(self.fold_aligned(data, big_endian))
    }

    pub(crate) fn fold_aligned(self, data: &[u8], big_endian: bool) -> Self {
        let word = |bytes: &[u8]| {
            let raw = [bytes[0], bytes[1], bytes[2], bytes[3]];
            if big_endian {
                u32::from_be_bytes(raw)
            } else {
                u32::from_le_bytes(raw)
            }
        };
        data.chunks_exact(8).fold(self, |Self { s1, s2 }, pair| {
            let s1 = s1.wrapping_add(word(&pair[..4])).wrapping_add(s2);
            let s2 = s2.wrapping_add(word(&pair[4..])).wrapping_add(s1);
            Self { s1, s2 }
        })
    }
}

/// Parsed 32-byte WAL header.
///
/// ```text
/// Offset  Size  Field
///   0       4   magic (selects checksum word order)
///   4       4   format version, 3007000
///   8       4   page size
///  12       4   checkpoint sequence
///  16       8   salt-1, salt-2
///  24       8   checksum of bytes 0..24
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WalHeader {
    pub magic: u32,
    pub format_version: u32,
    pub page_size: u32,
    pub checkpoint_seq: u32,
    pub salts: WalSalts,
    pub checksum: SqliteWalChecksum,
}

impl WalHeader {
    /// A sealed header using little-endian checksum words.
    #[must_use]
    pub fn new(page_size: u32, checkpoint_seq: u32, salts: WalSalts) -> Self {
        Self {
            magic: WAL_MAGIC_LE,
            format_version: WAL_FORMAT_VERSION,
            page_size,
            checkpoint_seq,
            salts,
            checksum: SqliteWalChecksum::default(),
        }
        .sealed()
    }

    #[must_use]
    pub const fn big_endian_checksum(&self) -> bool {
        self.magic == WAL_MAGIC_BE
    }

    /// Parse a header, rejecting unknown magic and format versions.
    ///
    /// The stored checksum is kept as-is; see [`WalHeader::checksum_valid`].
    pub fn from_bytes(buf: &[u8]) -> Result<Self> {
        let buf = buf.get(..WAL_HEADER_SIZE).ok_or_else(|| {
            QliteError::wal_corrupt(format!(
                "WAL header needs {WAL_HEADER_SIZE} bytes, got {}",
                buf.len()
            ))
        })?;
        let field = |n: usize| be_u32(buf, 4 * n);
        let magic = field(0);
        if magic != WAL_MAGIC_LE && magic != WAL_MAGIC_BE {
            return Err(QliteError::wal_corrupt(format!(
                "bad WAL magic {magic:#010x}"
            )));
        }
        let format_version = field(1);
        if format_version != WAL_FORMAT_VERSION {
            return Err(QliteError::wal_corrupt(format!(
                "WAL format version {format_version} is not {WAL_FORMAT_VERSION}"
            )));
        }
        Ok(Self {
            magic,
            format_version,
            page_size: field(2),
            checkpoint_seq: field(3),
            salts: WalSalts::new(field(4), field(5)),
            checksum: SqliteWalChecksum::from_array([field(6), field(7)]),
        })
    }

    /// Encode the header with its stored checksum.
    #[must_use]
    pub fn to_bytes(&self) -> [u8; WAL_HEADER_SIZE] {
        let mut buf = [0u8; WAL_HEADER_SIZE];
        let fields = [
            self.magic,
            self.format_version,
            self.page_size,
            self.checkpoint_seq,
            self.salts.salt1,
            self.salts.salt2,
            self.checksum.s1,
            self.checksum.s2,
        ];
        for (n, value) in fields.into_iter().enumerate() {
            put_be_u32(&mut buf, 4 * n, value);
        }
        buf
    }

    /// The checksum the other fields call for.
    #[must_use]
    pub fn expected_checksum(&self) -> SqliteWalChecksum {
        SqliteWalChecksum::default()
            .fold_aligned(&self.to_bytes()[..HEADER_BODY], self.big_endian_checksum())
    }

    /// Return a copy whose checksum matches its fields.
    #[must_use]
    pub fn sealed(mut self) -> Self {
        self.checksum = self.expected_checksum();
        self
    }

    #[must_use]
    pub fn checksum_valid(&self) -> bool {
        self.checksum == self.expected_checksum()
    }
}

/// Parsed 24-byte WAL frame header.
///
/// ```text
/// Offset  Size  Field
///   0       4   page number
///   4       4   database size in pages for a commit frame, else 0
///   8       8   salt-1, salt-2 copied from the WAL header
///  16       8   rolling checksum through this frame
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WalFrameHeader {
    pub page_number: u32,
    pub db_size: u32,
    pub salts: WalSalts,
    pub checksum: SqliteWalChecksum,
}

impl WalFrameHeader {
    #[must_use]
    pub const fn is_commit(&self) -> bool {
        self.db_size > 0
    }

    pub fn from_bytes(buf: &[u8]) -> Result<Self> {
        let buf = buf.get(..WAL_FRAME_HEADER_SIZE).ok_or_else(|| {
            QliteError::wal_corrupt(format!(
                "WAL frame header needs {WAL_FRAME_HEADER_SIZE} bytes, got {}",
                buf.len()
            ))
        })?;
        let field = |n: usize| be_u32(buf, 4 * n);
        Ok(Self {
            page_number: field(0),
            db_size: field(1),
            salts: WalSalts::new(field(2), field(3)),
            checksum: SqliteWalChecksum::from_array([field(4), field(5)]),
        })
    }

    #[must_use]
    pub fn to_bytes(&self) -> [u8; WAL_FRAME_HEADER_SIZE] {
        let mut buf = [0u8; WAL_FRAME_HEADER_SIZE];
        let fields = [
            self.page_number,
            self.db_size,
            self.salts.salt1,
            self.salts.salt2,
            self.checksum.s1,
            self.checksum.s2,
        ];
        for (n, value) in fields.into_iter().enumerate() {
            put_be_u32(&mut buf, 4 * n, value);
        }
        buf
    }

    /// Rolling checksum through this frame, continuing from `previous`.
    ///
    /// Covers the page number, the commit size and `page`. Salts and the
    /// stored checksum are not part of it.
    pub fn chained_checksum(
        &self,
        page: &[u8],
        previous: SqliteWalChecksum,
        big_endian: bool,
    ) -> Result<SqliteWalChecksum> {
        let head = &self.to_bytes()[..8];
        previous
            .fold_aligned(head, big_endian)
            .fold(page, big_endian)
    }
}

fn be_u32(buf: &[u8], offset: usize) -> u32 {
    u32::from_be_bytes([
        buf[offset],
        buf[offset + 1],
        buf[offset + 2],
        buf[offset + 3],
    ])
}

fn put_be_u32(buf: &mut [u8], offset: usize, value: u32) {
    buf[offset..offset + 4].copy_from_slice(&value.to_be_bytes());
}
