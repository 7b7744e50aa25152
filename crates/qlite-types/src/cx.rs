//! The context (`Cx`) threaded through every VFS and WAL call.
//!
//! It carries cooperative cancellation. Loops over frames call
//! [`Cx::checkpoint`] between steps. Sections that must finish once begun,
//! such as publishing a WAL-index header and then dropping the write lock,
//! hold a [`MaskGuard`], and checkpoints inside them always pass.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;

use qlite_error::{QliteError, Result};

#[derive(Debug, Default)]
struct Shared {
    cancelled: AtomicBool,
    masks: AtomicU32,
}

/// Cancellation handle. Clones observe and trigger the same cancellation.
#[derive(Debug, Clone, Default)]
pub struct Cx {
    shared: Arc<Shared>,
}

impl Cx {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.shared.cancelled.store(true, Ordering::Release);
    }

    #[must_use]
    pub fn is_cancel_requested(&self) -> bool {
        self.shared.cancelled.load(Ordering::Acquire)
    }

    /// Fails with [`QliteError::Interrupted`] once cancelled, unless a
    /// [`MaskGuard`] is alive.
    pub fn checkpoint(&self) -> Result<()> {
        if self.is_cancel_requested() && self.mask_depth() == 0 {
            return Err(QliteError::Interrupted);
        }
        Ok(())
    }

    /// Defer cancellation until the guard drops. Guards nest.
    #[must_use]
    pub fn masked(&self) -> MaskGuard<'_> {
        self.shared.masks.fetch_add(1, Ordering::AcqRel);
        MaskGuard { cx: self }
    }

    #[must_use]
    pub fn mask_depth(&self) -> u32 {
        self.shared.masks.load(Ordering::Acquire)
    }
}

/// Returned by [`Cx::masked`].
#[derive(Debug)]
pub struct MaskGuard<'a> {
    cx: &'a Cx,
}

impl Drop for MaskGuard<'_> {
    fn drop(&mut self) {
        self.cx.shared.masks.fetch_sub(1, Ordering::AcqRel);
    }
}
