//! RAII guards for page access.
//!
//! Three flavors, all move-only and all unpinning exactly once on drop:
//! - [`BasicPageGuard`] - a pin plus a stored dirty hint; the page latch is
//!   taken per access
//! - [`PageReadGuard`] - a pin plus the shared page latch
//! - [`PageWriteGuard`] - a pin plus the exclusive page latch
//!
//! The read/write guards release the page latch *before* unpinning. The
//! order matters: an evictor inside the pool latch may wait on a page latch,
//! so a dropping guard must never hold a page latch while it queues for the
//! pool latch.

use std::ops::{Deref, DerefMut};

use parking_lot::{RwLockReadGuard, RwLockWriteGuard};

use crate::common::{FrameId, PageId};
use crate::storage::Page;

use super::buffer_pool_manager::BufferPoolManager;

/// Guard holding only a pin.
///
/// Page data is reached through [`read`](BasicPageGuard::read) and
/// [`write`](BasicPageGuard::write), which take the page latch for the
/// duration of the returned lock guard. Taking `write` (or calling
/// [`mark_dirty`](BasicPageGuard::mark_dirty)) records a dirty hint that is
/// forwarded to the pool on drop.
pub struct BasicPageGuard<'a> {
    bpm: &'a BufferPoolManager,
    frame_id: FrameId,
    page_id: PageId,
    is_dirty: bool,
}

impl<'a> BasicPageGuard<'a> {
    pub(crate) fn new(bpm: &'a BufferPoolManager, frame_id: FrameId, page_id: PageId) -> Self {
        Self {
            bpm,
            frame_id,
            page_id,
            is_dirty: false,
        }
    }

    #[inline]
    pub fn page_id(&self) -> PageId {
        self.page_id
    }

    #[inline]
    pub fn frame_id(&self) -> FrameId {
        self.frame_id
    }

    /// Record that the page was modified; forwarded on drop.
    #[inline]
    pub fn mark_dirty(&mut self) {
        self.is_dirty = true;
    }

    /// Shared access to the page data.
    pub fn read(&self) -> RwLockReadGuard<'a, Page> {
        self.bpm.frame(self.frame_id).page()
    }

    /// Exclusive access to the page data. Marks the guard dirty.
    pub fn write(&mut self) -> RwLockWriteGuard<'a, Page> {
        self.is_dirty = true;
        self.bpm.frame(self.frame_id).page_mut()
    }
}

impl Drop for BasicPageGuard<'_> {
    fn drop(&mut self) {
        self.bpm.unpin_frame(self.frame_id, self.is_dirty);
    }
}

/// Guard holding a pin and the shared page latch.
///
/// Any number of read guards can coexist on a page. Unpins clean.
pub struct PageReadGuard<'a> {
    bpm: &'a BufferPoolManager,
    frame_id: FrameId,
    page_id: PageId,
    /// `Some` until drop; taken first so the latch is gone before unpinning.
    lock: Option<RwLockReadGuard<'a, Page>>,
}

impl<'a> PageReadGuard<'a> {
    pub(crate) fn new(
        bpm: &'a BufferPoolManager,
        frame_id: FrameId,
        page_id: PageId,
        lock: RwLockReadGuard<'a, Page>,
    ) -> Self {
        Self {
            bpm,
            frame_id,
            page_id,
            lock: Some(lock),
        }
    }

    #[inline]
    pub fn page_id(&self) -> PageId {
        self.page_id
    }

    #[inline]
    pub fn frame_id(&self) -> FrameId {
        self.frame_id
    }
}

impl Deref for PageReadGuard<'_> {
    type Target = Page;

    #[inline]
    fn deref(&self) -> &Page {
        self.lock.as_ref().expect("read guard lost its latch")
    }
}

impl Drop for PageReadGuard<'_> {
    fn drop(&mut self) {
        self.lock.take();
        self.bpm.unpin_frame(self.frame_id, false);
    }
}

/// Guard holding a pin and the exclusive page latch.
///
/// The dirty hint is set on the first mutable dereference (or an explicit
/// [`mark_dirty`](PageWriteGuard::mark_dirty)); a write guard that only ever
/// read unpins clean, so speculative write latches don't cause spurious
/// flushes.
pub struct PageWriteGuard<'a> {
    bpm: &'a BufferPoolManager,
    frame_id: FrameId,
    page_id: PageId,
    is_dirty: bool,
    /// `Some` until drop; taken first so the latch is gone before unpinning.
    lock: Option<RwLockWriteGuard<'a, Page>>,
}

impl<'a> PageWriteGuard<'a> {
    pub(crate) fn new(
        bpm: &'a BufferPoolManager,
        frame_id: FrameId,
        page_id: PageId,
        lock: RwLockWriteGuard<'a, Page>,
    ) -> Self {
        Self {
            bpm,
            frame_id,
            page_id,
            is_dirty: false,
            lock: Some(lock),
        }
    }

    #[inline]
    pub fn page_id(&self) -> PageId {
        self.page_id
    }

    #[inline]
    pub fn frame_id(&self) -> FrameId {
        self.frame_id
    }

    /// Record that the page was modified; forwarded on drop.
    #[inline]
    pub fn mark_dirty(&mut self) {
        self.is_dirty = true;
    }
}

impl Deref for PageWriteGuard<'_> {
    type Target = Page;

    #[inline]
    fn deref(&self) -> &Page {
        self.lock.as_ref().expect("write guard lost its latch")
    }
}

impl DerefMut for PageWriteGuard<'_> {
    #[inline]
    fn deref_mut(&mut self) -> &mut Page {
        self.is_dirty = true;
        self.lock.as_mut().expect("write guard lost its latch")
    }
}

impl Drop for PageWriteGuard<'_> {
    fn drop(&mut self) {
        let dirty = self.is_dirty;
        self.lock.take();
        self.bpm.unpin_frame(self.frame_id, dirty);
    }
}
