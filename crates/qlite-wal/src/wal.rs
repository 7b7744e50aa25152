//! [`WalFile`]: the WAL file itself, read and written through a VFS handle.
//!
//! A 32-byte header is followed by frames of a 24-byte frame header plus
//! one page. Each frame carries the rolling checksum of everything before
//! it, so the valid prefix of the file ends at the first broken link or
//! salt mismatch, and only frames up to the last commit in that prefix
//! count. Frame indices here are 0-based; the WAL index and
//! [`WalSlice`](qlite_types::WalSlice) count from 1.

use qlite_error::{QliteError, Result};
use qlite_types::flags::SyncFlags;
use qlite_types::Cx;
use qlite_vfs::VfsFile;
use tracing::{debug, error};

use crate::checksum::{
    SqliteWalChecksum, WalFrameHeader, WalHeader, WalSalts, WAL_FRAME_HEADER_SIZE,
    WAL_HEADER_SIZE,
};
use crate::metrics::GLOBAL_WAL_METRICS;

const WAL_HEADER_SIZE_U64: u64 = WAL_HEADER_SIZE as u64;

/// Byte offset of 0-based frame `index` for a given page size.
#[must_use]
pub fn frame_offset(page_size: usize, index: usize) -> u64 {
    let frame_size = (WAL_FRAME_HEADER_SIZE + page_size) as u64;
    WAL_HEADER_SIZE_U64 + index as u64 * frame_size
}

/// One handle's view of the WAL: its header, how many frames are valid and
/// the checksum to continue the chain from.
pub struct WalFile<F: VfsFile> {
    file: F,
    page_size: usize,
    big_endian_checksum: bool,
    header: WalHeader,
    /// Rolling checksum after the last valid frame (or the header seed).
    running_checksum: SqliteWalChecksum,
    /// Frames up to and including the last valid commit.
    frame_count: usize,
}

/// Outcome of walking the checksum chain from some starting point.
struct ChainScan {
    last_commit_count: usize,
    last_commit_checksum: SqliteWalChecksum,
}

impl<F: VfsFile> WalFile<F> {
    /// Create a new WAL file, writing the 32-byte header and truncating
    /// anything after it.
    pub fn create(
        cx: &Cx,
        mut file: F,
        page_size: u32,
        checkpoint_seq: u32,
        salts: WalSalts,
    ) -> Result<Self> {
        let header = WalHeader::new(page_size, checkpoint_seq, salts);
        file.write(cx, &header.to_bytes(), 0)?;
        file.truncate(cx, WAL_HEADER_SIZE_U64)?;

        debug!(
            page_size,
            checkpoint_seq,
            salt1 = salts.salt1,
            salt2 = salts.salt2,
            "WAL file created"
        );

        Ok(Self {
            file,
            page_size: page_size as usize,
            big_endian_checksum: false,
            running_checksum: header.checksum,
            header,
            frame_count: 0,
        })
    }

    /// Open an existing WAL file by validating its header, then walking the
    /// checksum chain to find the last committed frame.
    pub fn open(cx: &Cx, mut file: F) -> Result<Self> {
        let header = read_valid_header(cx, &mut file)?;
        let mut wal = Self {
            file,
            page_size: header.page_size as usize,
            big_endian_checksum: header.big_endian_checksum(),
            running_checksum: header.checksum,
            header,
            frame_count: 0,
        };
        let scan = wal.scan_chain(cx, 0, header.checksum)?;
        wal.frame_count = scan.last_commit_count;
        wal.running_checksum = scan.last_commit_checksum;

        debug!(
            page_size = wal.page_size,
            checkpoint_seq = header.checkpoint_seq,
            valid_frames = wal.frame_count,
            "WAL file opened"
        );
        Ok(wal)
    }

    /// Re-synchronize with the on-disk WAL after another handle appended
    /// committed frames or reset the file.
    pub fn refresh(&mut self, cx: &Cx) -> Result<()> {
        let expected_size = frame_offset(self.page_size, self.frame_count);
        let file_size = self.file.file_size(cx)?;

        let disk_header = read_valid_header(cx, &mut self.file)?;
        if file_size < expected_size
            || disk_header.salts != self.header.salts
            || disk_header.page_size != self.header.page_size
            || disk_header.magic != self.header.magic
        {
            debug!(
                old_salt1 = self.header.salts.salt1,
                new_salt1 = disk_header.salts.salt1,
                "WAL changed underneath handle; rebuilding"
            );
            self.header = disk_header;
            self.page_size = disk_header.page_size as usize;
            self.big_endian_checksum = disk_header.big_endian_checksum();
            self.frame_count = 0;
            self.running_checksum = disk_header.checksum;
        }

        let scan = self.scan_chain(cx, self.frame_count, self.running_checksum)?;
        self.frame_count = scan.last_commit_count;
        self.running_checksum = scan.last_commit_checksum;
        Ok(())
    }

    /// Walk frames starting at `start` and report the last commit reached.
    fn scan_chain(
        &mut self,
        cx: &Cx,
        start: usize,
        seed: SqliteWalChecksum,
    ) -> Result<ChainScan> {
        let frame_size = self.frame_size();
        let file_size = self.file.file_size(cx)?;
        let max_frames = usize::try_from(
            file_size.saturating_sub(WAL_HEADER_SIZE_U64) / frame_size as u64,
        )
        .unwrap_or(usize::MAX);

        let mut running = seed;
        let mut scan = ChainScan {
            last_commit_count: start,
            last_commit_checksum: seed,
        };
        let mut frame_buf = vec![0u8; frame_size];
        for frame_index in start..max_frames {
            cx.checkpoint()?;
            let offset = frame_offset(self.page_size, frame_index);
            if self.file.read(cx, &mut frame_buf, offset)? < frame_size {
                break;
            }
            let frame_header = WalFrameHeader::from_bytes(&frame_buf)?;
            if frame_header.salts != self.header.salts {
                break;
            }
            let expected = frame_header.chained_checksum(
                &frame_buf[WAL_FRAME_HEADER_SIZE..],
                running,
                self.big_endian_checksum,
            )?;
            if frame_header.checksum != expected {
                error!(frame_index, "WAL frame checksum mismatch; chain terminated");
                break;
            }
            running = expected;
            if frame_header.is_commit() {
                scan.last_commit_count = frame_index + 1;
                scan.last_commit_checksum = running;
            }
        }
        Ok(scan)
    }

    #[must_use]
    pub fn frame_size(&self) -> usize {
        WAL_FRAME_HEADER_SIZE + self.page_size
    }

    #[must_use]
    pub fn frame_count(&self) -> usize {
        self.frame_count
    }

    #[must_use]
    pub fn header(&self) -> &WalHeader {
        &self.header
    }

    #[must_use]
    pub fn salts(&self) -> WalSalts {
        self.header.salts
    }

    #[must_use]
    pub fn page_size(&self) -> usize {
        self.page_size
    }

    /// The rolling checksum after the last valid frame, or the header seed.
    #[must_use]
    pub fn running_checksum(&self) -> SqliteWalChecksum {
        self.running_checksum
    }

    /// Append a frame, returning its 0-based index.
    ///
    /// `page_data` must be exactly `page_size` bytes. `db_size_if_commit` is
    /// the database size in pages for commit frames and 0 otherwise. The
    /// frame header and page are written with a single call.
    pub fn append_frame(
        &mut self,
        cx: &Cx,
        page_number: u32,
        page_data: &[u8],
        db_size_if_commit: u32,
    ) -> Result<usize> {
        if page_data.len() != self.page_size {
            return Err(QliteError::wal_corrupt(format!(
                "frame page is {} bytes, WAL page size is {}",
                page_data.len(),
                self.page_size
            )));
        }

        let mut frame_header = WalFrameHeader {
            page_number,
            db_size: db_size_if_commit,
            salts: self.header.salts,
            checksum: SqliteWalChecksum::default(),
        };
        frame_header.checksum = frame_header.chained_checksum(
            page_data,
            self.running_checksum,
            self.big_endian_checksum,
        )?;
        let frame_size = self.frame_size();
        let mut frame = Vec::with_capacity(frame_size);
        frame.extend_from_slice(&frame_header.to_bytes());
        frame.extend_from_slice(page_data);

        let index = self.frame_count;
        self.file
            .write(cx, &frame, frame_offset(self.page_size, index))?;
        self.running_checksum = frame_header.checksum;
        self.frame_count += 1;

        debug!(
            frame_index = index,
            page_number,
            is_commit = db_size_if_commit > 0,
            "WAL frame appended"
        );
        GLOBAL_WAL_METRICS.record_append(frame_size as u64);
        Ok(index)
    }

    /// Header and page of frame `frame_index`.
    pub fn read_frame(&mut self, cx: &Cx, frame_index: usize) -> Result<(WalFrameHeader, Vec<u8>)> {
        self.check_index(frame_index)?;
        let frame_size = self.frame_size();
        let mut buf = vec![0u8; frame_size];
        let bytes_read = self
            .file
            .read(cx, &mut buf, frame_offset(self.page_size, frame_index))?;
        if bytes_read < frame_size {
            return Err(QliteError::ShortRead {
                expected: frame_size,
                actual: bytes_read,
            });
        }
        let header = WalFrameHeader::from_bytes(&buf)?;
        buf.drain(..WAL_FRAME_HEADER_SIZE);
        Ok((header, buf))
    }

    pub fn read_frame_header(&mut self, cx: &Cx, frame_index: usize) -> Result<WalFrameHeader> {
        self.check_index(frame_index)?;
        let mut header_buf = [0u8; WAL_FRAME_HEADER_SIZE];
        let bytes_read = self.file.read(
            cx,
            &mut header_buf,
            frame_offset(self.page_size, frame_index),
        )?;
        if bytes_read < WAL_FRAME_HEADER_SIZE {
            return Err(QliteError::ShortRead {
                expected: WAL_FRAME_HEADER_SIZE,
                actual: bytes_read,
            });
        }
        WalFrameHeader::from_bytes(&header_buf)
    }

    fn check_index(&self, frame_index: usize) -> Result<()> {
        if frame_index >= self.frame_count {
            return Err(QliteError::wal_corrupt(format!(
                "frame index {frame_index} out of range (count: {})",
                self.frame_count
            )));
        }
        Ok(())
    }

    /// Move the append position back to `frame_count` frames, discarding
    /// frames of a rolled-back transaction. The file is not truncated; the
    /// next append overwrites the stale frames.
    pub fn rewind(&mut self, cx: &Cx, frame_count: usize) -> Result<()> {
        if frame_count > self.frame_count {
            return Err(QliteError::wal_corrupt(format!(
                "cannot rewind forward: {frame_count} > {}",
                self.frame_count
            )));
        }
        if frame_count == self.frame_count {
            return Ok(());
        }
        self.running_checksum = if frame_count == 0 {
            self.header.checksum
        } else {
            self.read_frame_header(cx, frame_count - 1)?.checksum
        };
        debug!(from = self.frame_count, to = frame_count, "WAL rewound");
        self.frame_count = frame_count;
        Ok(())
    }

    pub fn sync(&mut self, cx: &Cx, flags: SyncFlags) -> Result<()> {
        self.file.sync(cx, flags)
    }

    /// Reset the WAL for a new epoch: write a fresh header with the new
    /// checkpoint sequence and salts, then truncate to header-only.
    pub fn reset(&mut self, cx: &Cx, new_checkpoint_seq: u32, new_salts: WalSalts) -> Result<()> {
        let new_header = WalHeader {
            magic: self.header.magic,
            ..WalHeader::new(self.header.page_size, new_checkpoint_seq, new_salts)
        }
        .sealed();
        self.file.write(cx, &new_header.to_bytes(), 0)?;
        self.file.truncate(cx, WAL_HEADER_SIZE_U64)?;

        self.running_checksum = new_header.checksum;
        self.header = new_header;
        self.frame_count = 0;

        debug!(
            checkpoint_seq = new_checkpoint_seq,
            salt1 = new_salts.salt1,
            salt2 = new_salts.salt2,
            "WAL reset"
        );
        GLOBAL_WAL_METRICS.record_restart();
        Ok(())
    }

    pub fn close(mut self, cx: &Cx) -> Result<()> {
        self.file.close(cx)
    }

    #[must_use]
    pub fn file(&self) -> &F {
        &self.file
    }

    pub fn file_mut(&mut self) -> &mut F {
        &mut self.file
    }
}

fn read_valid_header<F: VfsFile>(cx: &Cx, file: &mut F) -> Result<WalHeader> {
    let mut header_buf = [0u8; WAL_HEADER_SIZE];
    let bytes_read = file.read(cx, &mut header_buf, 0)?;
    if bytes_read < WAL_HEADER_SIZE {
        return Err(QliteError::wal_corrupt(format!(
            "WAL holds {bytes_read} bytes, less than a header"
        )));
    }
    let header = WalHeader::from_bytes(&header_buf)?;
    if !header.checksum_valid() {
        error!("WAL header checksum mismatch; file may be corrupt");
        return Err(QliteError::wal_corrupt("WAL header checksum mismatch"));
    }
    Ok(header)
}

#[cfg(test)]
mod tests {
    use std::path::Path;

    use qlite_types::flags::VfsOpenFlags;
    use qlite_vfs::{MemoryFile, MemoryVfs, Vfs};

    use super::*;

    const PAGE_SIZE: u32 = 512;

    fn test_salts() -> WalSalts {
        WalSalts::new(0xDEAD_BEEF, 0xCAFE_BABE)
    }

    fn sample_page(seed: u8) -> Vec<u8> {
        (0..PAGE_SIZE as usize)
            .map(|i| (i % 251) as u8 ^ seed)
            .collect()
    }

    fn open_wal_file(vfs: &MemoryVfs, cx: &Cx) -> MemoryFile {
        let flags = VfsOpenFlags::READWRITE | VfsOpenFlags::CREATE | VfsOpenFlags::WAL;
        vfs.open(cx, Some(Path::new("test.db-wal")), flags).unwrap().0
    }

    #[test]
    fn test_create_and_open_empty_wal() {
        let cx = Cx::new();
        let vfs = MemoryVfs::new();
        let wal = WalFile::create(&cx, open_wal_file(&vfs, &cx), PAGE_SIZE, 0, test_salts())
            .unwrap();
        assert_eq!(wal.frame_count(), 0);
        assert_eq!(wal.page_size(), PAGE_SIZE as usize);
        assert_eq!(wal.salts(), test_salts());
        assert!(wal.close(&cx).is_ok());

        let wal2 = WalFile::open(&cx, open_wal_file(&vfs, &cx)).unwrap();
        assert_eq!(wal2.frame_count(), 0);
        assert_eq!(wal2.header().salts, test_salts());
    }

    #[test]
    fn test_append_read_and_reopen() {
        let cx = Cx::new();
        let vfs = MemoryVfs::new();
        let mut wal =
            WalFile::create(&cx, open_wal_file(&vfs, &cx), PAGE_SIZE, 1, test_salts()).unwrap();

        assert_eq!(wal.append_frame(&cx, 1, &sample_page(1), 0).unwrap(), 0);
        assert_eq!(wal.append_frame(&cx, 2, &sample_page(2), 2).unwrap(), 1);
        let (header, data) = wal.read_frame(&cx, 1).unwrap();
        assert_eq!(header.page_number, 2);
        assert!(header.is_commit());
        assert_eq!(data, sample_page(2));
        let checksum = wal.running_checksum();

        let reopened = WalFile::open(&cx, open_wal_file(&vfs, &cx)).unwrap();
        assert_eq!(reopened.frame_count(), 2);
        assert_eq!(reopened.running_checksum(), checksum);
    }

    #[test]
    fn test_open_ignores_uncommitted_tail() {
        let cx = Cx::new();
        let vfs = MemoryVfs::new();
        let mut wal =
            WalFile::create(&cx, open_wal_file(&vfs, &cx), PAGE_SIZE, 0, test_salts()).unwrap();
        wal.append_frame(&cx, 1, &sample_page(1), 1).unwrap();
        wal.append_frame(&cx, 2, &sample_page(2), 0).unwrap();

        let reopened = WalFile::open(&cx, open_wal_file(&vfs, &cx)).unwrap();
        assert_eq!(reopened.frame_count(), 1);
    }

    #[test]
    fn test_rewind_then_overwrite_keeps_chain_valid() {
        let cx = Cx::new();
        let vfs = MemoryVfs::new();
        let mut wal =
            WalFile::create(&cx, open_wal_file(&vfs, &cx), PAGE_SIZE, 0, test_salts()).unwrap();
        wal.append_frame(&cx, 1, &sample_page(1), 1).unwrap();
        let after_commit = wal.running_checksum();
        wal.append_frame(&cx, 2, &sample_page(2), 0).unwrap();
        wal.append_frame(&cx, 3, &sample_page(3), 0).unwrap();

        wal.rewind(&cx, 1).unwrap();
        assert_eq!(wal.frame_count(), 1);
        assert_eq!(wal.running_checksum(), after_commit);
        assert!(wal.rewind(&cx, 2).is_err());

        wal.append_frame(&cx, 4, &sample_page(4), 2).unwrap();
        let reopened = WalFile::open(&cx, open_wal_file(&vfs, &cx)).unwrap();
        assert_eq!(reopened.frame_count(), 2);

        wal.rewind(&cx, 0).unwrap();
        assert_eq!(wal.running_checksum(), wal.header().checksum);
    }

    #[test]
    fn test_refresh_absorbs_other_handle_commits_and_resets() {
        let cx = Cx::new();
        let vfs = MemoryVfs::new();
        let mut writer =
            WalFile::create(&cx, open_wal_file(&vfs, &cx), PAGE_SIZE, 0, test_salts()).unwrap();
        let mut follower = WalFile::open(&cx, open_wal_file(&vfs, &cx)).unwrap();

        writer.append_frame(&cx, 1, &sample_page(1), 0).unwrap();
        writer.append_frame(&cx, 2, &sample_page(2), 2).unwrap();
        follower.refresh(&cx).unwrap();
        assert_eq!(follower.frame_count(), 2);
        assert_eq!(follower.running_checksum(), writer.running_checksum());

        let new_salts = WalSalts::new(test_salts().salt1 + 1, 7);
        writer.reset(&cx, 1, new_salts).unwrap();
        writer.append_frame(&cx, 3, &sample_page(3), 3).unwrap();
        follower.refresh(&cx).unwrap();
        assert_eq!(follower.salts(), new_salts);
        assert_eq!(follower.frame_count(), 1);
        assert_eq!(follower.header().checkpoint_seq, 1);
    }

    #[test]
    fn test_page_size_mismatch_rejected() {
        let cx = Cx::new();
        let vfs = MemoryVfs::new();
        let mut wal =
            WalFile::create(&cx, open_wal_file(&vfs, &cx), PAGE_SIZE, 0, test_salts()).unwrap();
        let err = wal.append_frame(&cx, 1, &[0u8; 100], 1).unwrap_err();
        assert!(matches!(err, QliteError::WalCorrupt { .. }));
        assert_eq!(wal.frame_count(), 0);
    }

    #[test]
    fn test_frame_index_out_of_range() {
        let cx = Cx::new();
        let vfs = MemoryVfs::new();
        let mut wal =
            WalFile::create(&cx, open_wal_file(&vfs, &cx), PAGE_SIZE, 0, test_salts()).unwrap();
        assert!(wal.read_frame(&cx, 0).is_err());
        assert!(wal.read_frame_header(&cx, 0).is_err());
    }

    #[test]
    fn test_corrupt_payload_truncates_chain_on_reopen() {
        let cx = Cx::new();
        let vfs = MemoryVfs::new();
        let mut wal =
            WalFile::create(&cx, open_wal_file(&vfs, &cx), PAGE_SIZE, 0, test_salts()).unwrap();
        wal.append_frame(&cx, 1, &sample_page(1), 1).unwrap();
        wal.append_frame(&cx, 2, &sample_page(2), 2).unwrap();

        let offset = frame_offset(PAGE_SIZE as usize, 1) + WAL_FRAME_HEADER_SIZE as u64;
        wal.file_mut().write(&cx, &[0xFF; 4], offset).unwrap();

        let reopened = WalFile::open(&cx, open_wal_file(&vfs, &cx)).unwrap();
        assert_eq!(reopened.frame_count(), 1);
    }

    #[test]
    fn test_header_corruption_detected() {
        let cx = Cx::new();
        let vfs = MemoryVfs::new();
        let mut wal =
            WalFile::create(&cx, open_wal_file(&vfs, &cx), PAGE_SIZE, 0, test_salts()).unwrap();
        wal.file_mut().write(&cx, &[0xFF], 13).unwrap();
        assert!(matches!(
            WalFile::open(&cx, open_wal_file(&vfs, &cx)),
            Err(QliteError::WalCorrupt { .. })
        ));
    }

    #[test]
    fn test_empty_file_is_not_a_wal() {
        let cx = Cx::new();
        let vfs = MemoryVfs::new();
        assert!(WalFile::open(&cx, open_wal_file(&vfs, &cx)).is_err());
    }

    #[test]
    fn test_frame_offset_geometry() {
        assert_eq!(frame_offset(4096, 0), 32);
        assert_eq!(frame_offset(4096, 1), 32 + 4120);
        assert_eq!(frame_offset(65_536, 100_000), 32 + 100_000 * 65_560);
    }
}
