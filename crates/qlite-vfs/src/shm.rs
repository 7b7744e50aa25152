//! Shared memory handed out by [`VfsFile::shm_map`](crate::VfsFile::shm_map).

use std::ops::{Deref, DerefMut};
use std::sync::Arc;

use parking_lot::{Mutex, MutexGuard};

/// One mapped region of a database's shared memory.
///
/// Clones alias the same bytes, so every handle that maps region `n` of a
/// database observes the others' writes. Offsets are in bytes; accessors
/// panic when a range falls outside the region.
#[derive(Debug, Clone)]
pub struct ShmRegion {
    len: usize,
    data: Arc<Mutex<Vec<u8>>>,
}

impl ShmRegion {
    /// A zero-filled region of `size` bytes.
    #[must_use]
    pub fn new(size: usize) -> Self {
        Self {
            len: size,
            data: Arc::new(Mutex::new(vec![0; size])),
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.len
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    #[must_use]
    pub fn same_region(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.data, &other.data)
    }

    /// Exclusive access to the whole region.
    #[must_use]
    pub fn lock(&self) -> ShmRegionGuard<'_> {
        ShmRegionGuard {
            guard: self.data.lock(),
        }
    }

    /// Fill `out` from the bytes at `offset`.
    pub fn read_into(&self, offset: usize, out: &mut [u8]) {
        out.copy_from_slice(&self.lock()[offset..offset + out.len()]);
    }

    pub fn write_bytes(&self, offset: usize, bytes: &[u8]) {
        self.lock()[offset..offset + bytes.len()].copy_from_slice(bytes);
    }

    #[must_use]
    pub fn read_u32_le(&self, offset: usize) -> u32 {
        let mut word = [0u8; 4];
        self.read_into(offset, &mut word);
        u32::from_le_bytes(word)
    }

    pub fn write_u32_le(&self, offset: usize, val: u32) {
        self.write_bytes(offset, &val.to_le_bytes());
    }
}

/// Guard returned by [`ShmRegion::lock`].
pub struct ShmRegionGuard<'a> {
    guard: MutexGuard<'a, Vec<u8>>,
}

impl Deref for ShmRegionGuard<'_> {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        &self.guard
    }
}

impl DerefMut for ShmRegionGuard<'_> {
    fn deref_mut(&mut self) -> &mut [u8] {
        &mut self.guard
    }
}
