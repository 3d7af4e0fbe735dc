//! Frame - a slot in the buffer pool.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

use parking_lot::{Mutex, RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::common::PageId;
use crate::storage::Page;

/// One slot in the buffer pool, holding at most one resident page.
///
/// The payload sits behind the per-page latch that read/write guards hold;
/// the bookkeeping around it (resident id, pin count, dirty bit) is reached
/// without that latch, so a guard can drop while another thread is mid-read.
/// A frame with `page_id() == PageId::INVALID` is free.
pub struct Frame {
    /// The page payload, behind the per-page latch.
    page: RwLock<Page>,

    /// Resident page id; `PageId::INVALID` marks a free frame.
    page_id: Mutex<PageId>,

    /// Number of outstanding pins.
    pin_count: AtomicU32,

    /// Whether the payload differs from the on-disk page.
    is_dirty: AtomicBool,
}

impl Frame {
    /// Create a new free frame.
    pub fn new() -> Self {
        Self {
            page: RwLock::new(Page::new()),
            page_id: Mutex::new(PageId::INVALID),
            pin_count: AtomicU32::new(0),
            is_dirty: AtomicBool::new(false),
        }
    }

    /// Acquire the page latch shared.
    #[inline]
    pub fn page(&self) -> RwLockReadGuard<'_, Page> {
        self.page.read()
    }

    /// Acquire the page latch exclusive.
    #[inline]
    pub fn page_mut(&self) -> RwLockWriteGuard<'_, Page> {
        self.page.write()
    }

    /// Resident page id, or `PageId::INVALID` when the frame is free.
    #[inline]
    pub fn page_id(&self) -> PageId {
        *self.page_id.lock()
    }

    #[inline]
    pub fn set_page_id(&self, page_id: PageId) {
        *self.page_id.lock() = page_id;
    }

    /// Increment the pin count, returning the new value.
    #[inline]
    pub fn pin(&self) -> u32 {
        self.pin_count.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Decrement the pin count, returning the new value.
    ///
    /// # Panics
    /// Panics if the pin count is already 0.
    #[inline]
    pub fn unpin(&self) -> u32 {
        let old = self.pin_count.fetch_sub(1, Ordering::Relaxed);
        assert!(old > 0, "pin count underflow");
        old - 1
    }

    #[inline]
    pub fn pin_count(&self) -> u32 {
        self.pin_count.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn is_pinned(&self) -> bool {
        self.pin_count() > 0
    }

    #[inline]
    pub fn mark_dirty(&self) {
        self.is_dirty.store(true, Ordering::Relaxed);
    }

    #[inline]
    pub fn clear_dirty(&self) {
        self.is_dirty.store(false, Ordering::Relaxed);
    }

    #[inline]
    pub fn is_dirty(&self) -> bool {
        self.is_dirty.load(Ordering::Relaxed)
    }

    /// Whether no page is resident.
    #[inline]
    pub fn is_free(&self) -> bool {
        !self.page_id().is_valid()
    }
}

impl Default for Frame {
    fn default() -> Self {
        Self::new()
    }
}
