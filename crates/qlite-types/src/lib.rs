pub mod cx;
pub mod flags;
pub mod slice;
pub mod value;

pub use cx::Cx;
pub use slice::{CapturedFrame, WalSalts, WalSlice};
pub use value::{Value, ValueType};

use std::fmt;
use std::num::NonZeroU32;

/// 1-based page number; there is no page 0.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, serde::Serialize, serde::Deserialize,
)]
#[repr(transparent)]
pub struct PageNumber(NonZeroU32);

impl PageNumber {
    #[inline]
    #[must_use]
    pub const fn new(n: u32) -> Option<Self> {
        match NonZeroU32::new(n) {
            Some(v) => Some(Self(v)),
            None => None,
        }
    }

    #[inline]
    #[must_use]
    pub const fn get(self) -> u32 {
        self.0.get()
    }

    /// Byte offset of this page in a database file with `page_size` pages.
    #[inline]
    #[must_use]
    pub const fn offset(self, page_size: PageSize) -> u64 {
        (self.0.get() as u64 - 1) * page_size.0 as u64
    }
}

impl fmt::Display for PageNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "page {}", self.0)
    }
}

/// Page size shared by the database file, the WAL and the WAL index.
///
/// A power of two in `512..=65536`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(try_from = "u32", into = "u32")]
pub struct PageSize(u32);

impl PageSize {
    pub const MIN: Self = Self(512);
    pub const DEFAULT: Self = Self(4096);
    pub const MAX: Self = Self(65536);

    #[must_use]
    pub const fn new(size: u32) -> Option<Self> {
        if size >= Self::MIN.0 && size <= Self::MAX.0 && size.is_power_of_two() {
            Some(Self(size))
        } else {
            None
        }
    }

    #[inline]
    #[must_use]
    pub const fn get(self) -> u32 {
        self.0
    }

    #[inline]
    #[must_use]
    pub const fn as_usize(self) -> usize {
        self.0 as usize
    }
}

impl Default for PageSize {
    fn default() -> Self {
        Self::DEFAULT
    }
}

impl TryFrom<u32> for PageSize {
    type Error = String;

    fn try_from(size: u32) -> Result<Self, Self::Error> {
        Self::new(size).ok_or_else(|| format!("invalid page size {size}"))
    }
}

impl From<PageSize> for u32 {
    fn from(size: PageSize) -> Self {
        size.0
    }
}

impl fmt::Display for PageSize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} bytes", self.0)
    }
}

/// File lock level, in SQLite's escalation order.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(u8)]
pub enum LockLevel {
    #[default]
    None = 0,
    Shared = 1,
    Reserved = 2,
    Pending = 3,
    Exclusive = 4,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn page_zero_does_not_exist() {
        assert!(PageNumber::new(0).is_none());
        let page = PageNumber::new(3).unwrap();
        assert_eq!(page.get(), 3);
        assert_eq!(page.to_string(), "page 3");
        assert_eq!(page.offset(PageSize::MIN), 1024);
        assert_eq!(PageNumber::new(1).unwrap().offset(PageSize::DEFAULT), 0);
    }

    #[test]
    fn page_sizes_are_bounded_powers_of_two() {
        for bad in [0, 256, 511, 1000, 131_072] {
            assert!(PageSize::new(bad).is_none(), "{bad}");
        }
        for good in [512, 1024, 4096, 65536] {
            assert_eq!(PageSize::new(good).map(PageSize::get), Some(good));
        }
        assert_eq!(PageSize::default(), PageSize::DEFAULT);
    }

    #[test]
    fn page_size_serde_validates() {
        assert_eq!(serde_json::to_string(&PageSize::MIN).unwrap(), "512");
        let ok: PageSize = serde_json::from_str("8192").unwrap();
        assert_eq!(ok.get(), 8192);
        assert!(serde_json::from_str::<PageSize>("3000").is_err());
    }

    #[test]
    fn lock_levels_escalate() {
        assert!(LockLevel::None < LockLevel::Shared);
        assert!(LockLevel::Shared < LockLevel::Reserved);
        assert!(LockLevel::Pending < LockLevel::Exclusive);
    }
}
