//! Identifying metadata for a captured WAL transaction.
//!
//! A [`WalSlice`] names a contiguous run of frames inside one WAL epoch. The
//! epoch is identified by the pair of salts stored in the WAL header; every
//! WAL reset draws fresh salts, so a slice whose salts differ from the
//! current header refers to frames that no longer exist.

use std::fmt;

/// The two salt values from the WAL header.
///
/// `salt1` is incremented on every WAL reset; `salt2` is a fresh random
/// value. Together they identify one WAL epoch.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Default, serde::Serialize, serde::Deserialize,
)]
pub struct WalSalts {
    pub salt1: u32,
    pub salt2: u32,
}

impl WalSalts {
    #[must_use]
    pub const fn new(salt1: u32, salt2: u32) -> Self {
        Self { salt1, salt2 }
    }

    #[must_use]
    pub const fn to_array(self) -> [u32; 2] {
        [self.salt1, self.salt2]
    }
}

impl fmt::Display for WalSalts {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:08x}:{:08x}", self.salt1, self.salt2)
    }
}

/// A contiguous run of WAL frames written by one transaction.
///
/// `start` is the 1-based index of the first frame. Slices handed out by the
/// capture layer always have `len > 0`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub struct WalSlice {
    pub salts: WalSalts,
    pub start: u32,
    pub len: u32,
}

impl WalSlice {
    #[must_use]
    pub const fn new(salts: WalSalts, start: u32, len: u32) -> Self {
        Self { salts, start, len }
    }

    /// Index of the last frame in the slice (inclusive).
    ///
    /// For an empty slice this is `start - 1`.
    #[must_use]
    pub const fn end(&self) -> u32 {
        (self.start + self.len).saturating_sub(1)
    }

    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Whether the 1-based frame index `frame` lies inside the slice.
    #[must_use]
    pub const fn contains(&self, frame: u32) -> bool {
        frame >= self.start && frame - self.start < self.len
    }

    /// Whether this slice directly continues `prev` in the same epoch.
    #[must_use]
    pub fn follows(&self, prev: &Self) -> bool {
        self.salts == prev.salts && self.start == prev.start + prev.len
    }
}

impl fmt::Display for WalSlice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] frames {}..+{}", self.salts, self.start, self.len)
    }
}

/// One frame of a captured transaction: the page it writes and the page
/// image itself.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct CapturedFrame {
    pub page_number: u32,
    /// Database size in pages after commit; non-zero only on the commit frame.
    pub db_size: u32,
    pub data: Vec<u8>,
}

impl CapturedFrame {
    #[must_use]
    pub const fn is_commit(&self) -> bool {
        self.db_size != 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn salts() -> WalSalts {
        WalSalts::new(0x1234_5678, 0x9ABC_DEF0)
    }

    #[test]
    fn slice_bounds() {
        let slice = WalSlice::new(salts(), 4, 3);
        assert_eq!(slice.end(), 6);
        assert!(!slice.contains(3));
        assert!(slice.contains(4));
        assert!(slice.contains(6));
        assert!(!slice.contains(7));
        assert!(!slice.is_empty());
    }

    #[test]
    fn slice_follows_same_epoch_only() {
        let first = WalSlice::new(salts(), 1, 3);
        let second = WalSlice::new(salts(), 4, 2);
        assert!(second.follows(&first));
        assert!(!first.follows(&second));

        let gap = WalSlice::new(salts(), 5, 2);
        assert!(!gap.follows(&first));

        let other_epoch = WalSlice::new(WalSalts::new(1, 2), 4, 2);
        assert!(!other_epoch.follows(&first));
    }

    #[test]
    fn commit_frame() {
        let frame = CapturedFrame {
            page_number: 2,
            db_size: 0,
            data: vec![0; 16],
        };
        assert!(!frame.is_commit());
        let commit = CapturedFrame { db_size: 2, ..frame };
        assert!(commit.is_commit());
    }

    #[test]
    fn slice_serde_shape() {
        let slice = WalSlice::new(WalSalts::new(7, 9), 1, 2);
        let json = serde_json::to_value(slice).unwrap();
        assert_eq!(
            json,
            serde_json::json!({"salts": {"salt1": 7, "salt2": 9}, "start": 1, "len": 2})
        );
        let back: WalSlice = serde_json::from_value(json).unwrap();
        assert_eq!(back, slice);
    }

    #[test]
    fn display() {
        let slice = WalSlice::new(WalSalts::new(1, 0xff), 3, 2);
        assert_eq!(slice.to_string(), "[00000001:000000ff] frames 3..+2");
    }

    proptest! {
        #[test]
        fn prop_contains_matches_range(start in 1u32..10_000, len in 1u32..1000, probe in 0u32..12_000) {
            let slice = WalSlice::new(WalSalts::default(), start, len);
            prop_assert_eq!(slice.contains(probe), (start..=slice.end()).contains(&probe));
        }
    }
}
