use std::path::Path;

use proptest::prelude::*;
use qlite_capture::{apply, poll, shallow_poll, CaptureConfig, CaptureFile, CaptureVfs};
use qlite_types::flags::VfsOpenFlags;
use qlite_types::{CapturedFrame, Cx, PageNumber, PageSize, WalSalts, WalSlice};
use qlite_vfs::{MemoryFile, MemoryVfs, Vfs, VfsFile};
use qlite_wal::{WalHeader, WalSession, WalSessionConfig};

const PAGE: usize = 512;
const SALTS: WalSalts = WalSalts::new(0x0000_0042, 0x5151_7A7A);

type Session = WalSession<CaptureFile<MemoryFile>>;

fn capture_vfs() -> CaptureVfs<MemoryVfs> {
    CaptureVfs::new(
        MemoryVfs::new(),
        CaptureConfig::default()
            .with_vfs_name("replica")
            .with_page_size(PageSize::MIN),
    )
}

fn session(vfs: &CaptureVfs<MemoryVfs>, cx: &Cx, name: &str) -> Session {
    let rw = VfsOpenFlags::CREATE | VfsOpenFlags::READWRITE;
    let db = vfs
        .open(cx, Some(Path::new(name)), VfsOpenFlags::MAIN_DB | rw)
        .unwrap()
        .0;
    let wal = vfs
        .open(cx, Some(Path::new(&format!("{name}-wal"))), VfsOpenFlags::WAL | rw)
        .unwrap()
        .0;
    let config = WalSessionConfig::default()
        .with_page_size(PageSize::MIN)
        .with_initial_salts(SALTS);
    WalSession::open(cx, db, wal, config).unwrap()
}

/// A page whose bytes depend on both the page number and the round.
fn page(pgno: u32, round: u8) -> Vec<u8> {
    (0..PAGE)
        .map(|i| (i as u32 ^ pgno.wrapping_mul(31)).to_le_bytes()[0] ^ round)
        .collect()
}

fn commit(s: &mut Session, cx: &Cx, pgnos: &[u32], round: u8, db_size: u32) {
    let data: Vec<(PageNumber, Vec<u8>)> = pgnos
        .iter()
        .map(|&n| (PageNumber::new(n).unwrap(), page(n, round)))
        .collect();
    let refs: Vec<(PageNumber, &[u8])> = data.iter().map(|(n, d)| (*n, d.as_slice())).collect();
    s.begin_write(cx).unwrap();
    s.commit(cx, &refs, db_size).unwrap();
}

/// Write polled frames through the follower's own engine session.
fn replay(follower: &mut Session, cx: &Cx, frames: &[CapturedFrame]) {
    let pages: Vec<(PageNumber, &[u8])> = frames
        .iter()
        .map(|f| (PageNumber::new(f.page_number).unwrap(), f.data.as_slice()))
        .collect();
    let db_size = frames.last().unwrap().db_size;
    follower.begin_write(cx).unwrap();
    follower.commit(cx, &pages, db_size).unwrap();
}

fn file_bytes<F: VfsFile>(file: &mut F, cx: &Cx) -> Vec<u8> {
    let size = usize::try_from(file.file_size(cx).unwrap()).unwrap();
    let mut buf = vec![0u8; size];
    file.read(cx, &mut buf, 0).unwrap();
    buf
}

#[test]
fn follower_converges_on_leader_wal() {
    let cx = Cx::new();
    let leader_vfs = capture_vfs();
    let follower_vfs = capture_vfs();
    let mut leader = session(&leader_vfs, &cx, "node.db");
    let mut follower = session(&follower_vfs, &cx, "node.db");

    let rounds: [(&[u32], u32); 4] = [(&[1, 2], 2), (&[2], 2), (&[1, 3], 3), (&[3], 3)];
    for (round, (pgnos, db_size)) in rounds.iter().enumerate() {
        let round = u8::try_from(round).unwrap();
        if round == 2 {
            // Both sides checkpoint at the same point so the next write
            // restarts both WALs into the same epoch.
            assert_eq!(leader.checkpoint(&cx).unwrap(), 3);
            assert_eq!(follower.checkpoint(&cx).unwrap(), 3);
        }

        commit(&mut leader, &cx, pgnos, round, *db_size);
        let (slice, frames) = poll(&cx, leader.wal_file_mut()).unwrap();
        assert_eq!(frames.len(), pgnos.len());

        replay(&mut follower, &cx, &frames);
        assert_eq!(shallow_poll(&cx, follower.db_file_mut()).unwrap(), slice);

        apply(&cx, leader.db_file_mut()).unwrap();
        apply(&cx, follower.db_file_mut()).unwrap();

        assert_eq!(
            file_bytes(leader.wal_file_mut(), &cx),
            file_bytes(follower.wal_file_mut(), &cx),
            "WAL divergence after round {round}"
        );
        assert_eq!(
            leader.index_header().unwrap(),
            follower.index_header().unwrap()
        );
    }

    assert_eq!(leader.checkpoint(&cx).unwrap(), 3);
    assert_eq!(follower.checkpoint(&cx).unwrap(), 3);
    assert_eq!(
        file_bytes(leader.db_file_mut(), &cx),
        file_bytes(follower.db_file_mut(), &cx)
    );

    follower.begin_read(&cx).unwrap();
    for pgno in 1..=3 {
        let expected = match pgno {
            1 => page(1, 2),
            2 => page(2, 1),
            _ => page(3, 3),
        };
        assert_eq!(
            follower
                .read_page(&cx, PageNumber::new(pgno).unwrap())
                .unwrap(),
            Some(expected)
        );
    }
}

#[test]
fn slices_and_frames_serialize_for_log_entries() {
    let cx = Cx::new();
    let vfs = capture_vfs();
    let mut s = session(&vfs, &cx, "serde.db");
    commit(&mut s, &cx, &[1, 2], 0, 2);

    let (slice, frames) = poll(&cx, s.wal_file_mut()).unwrap();
    let json = serde_json::to_value(slice).unwrap();
    assert_eq!(
        json,
        serde_json::json!({
            "salts": { "salt1": SALTS.salt1, "salt2": SALTS.salt2 },
            "start": 1,
            "len": 2,
        })
    );
    let text = serde_json::to_string(&frames).unwrap();
    let back: Vec<CapturedFrame> = serde_json::from_str(&text).unwrap();
    assert_eq!(back, frames);
    apply(&cx, s.db_file_mut()).unwrap();
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(24))]

    /// Every captured slice covers exactly the frames its transaction
    /// appended, in the WAL's current epoch, directly after the previous one.
    #[test]
    fn slices_track_appended_frames(
        txns in prop::collection::vec((1u32..6, any::<bool>()), 1..6)
    ) {
        let cx = Cx::new();
        let vfs = capture_vfs();
        let mut s = session(&vfs, &cx, "prop.db");
        let mut next_start = 1u32;

        for (round, (frames, abandon_first)) in txns.into_iter().enumerate() {
            let round = u8::try_from(round).unwrap();
            if abandon_first {
                s.begin_write(&cx).unwrap();
                let scratch = page(1, 0xEE);
                s.write_frames(&cx, &[(PageNumber::new(1).unwrap(), &scratch)]).unwrap();
                s.rollback(&cx).unwrap();
            }

            let pgnos: Vec<u32> = (1..=frames).collect();
            commit(&mut s, &cx, &pgnos, round, frames);

            let slice = shallow_poll(&cx, s.wal_file_mut()).unwrap();
            let header = file_bytes(s.wal_file_mut(), &cx);
            let salts = WalHeader::from_bytes(&header).unwrap().salts;
            prop_assert_eq!(slice, WalSlice::new(salts, next_start, frames));
            prop_assert!(!slice.is_empty());

            apply(&cx, s.db_file_mut()).unwrap();
            next_start = slice.end() + 1;
        }
    }
}
