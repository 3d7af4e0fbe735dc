//! Buffer pool manager - the page caching layer.

use std::collections::HashMap;

use parking_lot::Mutex;

use crate::buffer::replacer::LruKReplacer;
use crate::buffer::{BasicPageGuard, BufferPoolStats, Frame, PageReadGuard, PageWriteGuard};
use crate::common::{Error, FrameId, PageId, Result};
use crate::storage::DiskManager;

/// Bookkeeping mutated only under the pool latch.
struct PoolState {
    /// Maps resident page ids to their frame.
    page_table: HashMap<PageId, FrameId>,
    /// Frames holding no page.
    free_list: Vec<FrameId>,
    /// Victim selection for resident, unpinned pages.
    replacer: LruKReplacer,
}

/// Caches disk pages in a fixed set of frames.
///
/// All bookkeeping (page table, free list, replacer) lives behind one
/// central latch, so pool operations are mutually exclusive and
/// linearizable. The per-page latches inside each [`Frame`] guard page
/// *contents* only and are acquired by guards after the pool latch is
/// released; clients can therefore hold a page latch for as long as they
/// like without stalling unrelated pool traffic.
///
/// A page returned by a fetch is pinned and will not be evicted until every
/// guard (or explicit pin) on it is gone. Eviction writes dirty victims back
/// but never touches their disk identity.
///
/// # Usage
/// ```ignore
/// let dm = DiskManager::create("test.db")?;
/// let bpm = BufferPoolManager::new(16, 2, dm);
///
/// let mut guard = bpm.new_page()?;
/// guard.write().as_mut_slice()[0] = 0xAB;
/// drop(guard); // unpins, dirty hint forwarded
///
/// let guard = bpm.fetch_page_read(page_id)?;
/// let byte = guard.as_slice()[0];
/// ```
pub struct BufferPoolManager {
    /// Fixed pool of frames allocated at startup.
    frames: Vec<Frame>,

    /// Central latch over the pool bookkeeping.
    latch: Mutex<PoolState>,

    /// Handles all disk I/O; called only while the latch is held.
    disk_manager: Mutex<DiskManager>,

    /// Performance counters.
    stats: BufferPoolStats,

    /// Number of frames (immutable after construction).
    pool_size: usize,
}

impl BufferPoolManager {
    /// Create a pool of `pool_size` frames with an LRU-K replacer of depth
    /// `replacer_k`.
    ///
    /// # Panics
    /// Panics if `pool_size` is 0 or `replacer_k` is 0.
    pub fn new(pool_size: usize, replacer_k: usize, disk_manager: DiskManager) -> Self {
        assert!(pool_size > 0, "pool_size must be > 0");

        let frames: Vec<Frame> = (0..pool_size).map(|_| Frame::new()).collect();
        // LIFO free list (recently freed frames are reused first), stacked
        // so frame 0 is handed out first on a fresh pool.
        let free_list: Vec<FrameId> = (0..pool_size).rev().map(FrameId::new).collect();

        Self {
            frames,
            latch: Mutex::new(PoolState {
                page_table: HashMap::new(),
                free_list,
                replacer: LruKReplacer::new(pool_size, replacer_k),
            }),
            disk_manager: Mutex::new(disk_manager),
            stats: BufferPoolStats::new(),
            pool_size,
        }
    }

    // ========================================================================
    // Guard factories
    // ========================================================================

    /// Allocate a fresh page and return it pinned, zeroed, and clean.
    ///
    /// # Errors
    /// [`Error::NoFreeFrames`] when every frame is pinned and the free list
    /// is empty; I/O errors from allocation or victim write-back.
    pub fn new_page(&self) -> Result<BasicPageGuard<'_>> {
        let (page_id, frame_id) = self.new_page_inner()?;
        Ok(BasicPageGuard::new(self, frame_id, page_id))
    }

    /// Fetch a page and return a pin-only guard.
    pub fn fetch_page_basic(&self, page_id: PageId) -> Result<BasicPageGuard<'_>> {
        let frame_id = self.fetch_page_inner(page_id)?;
        Ok(BasicPageGuard::new(self, frame_id, page_id))
    }

    /// Fetch a page for shared access.
    ///
    /// The page latch is acquired after the pool latch is released, so a
    /// long-held write latch on this page never blocks other pool traffic.
    pub fn fetch_page_read(&self, page_id: PageId) -> Result<PageReadGuard<'_>> {
        let frame_id = self.fetch_page_inner(page_id)?;
        let lock = self.frames[frame_id.0].page();
        Ok(PageReadGuard::new(self, frame_id, page_id, lock))
    }

    /// Fetch a page for exclusive access.
    pub fn fetch_page_write(&self, page_id: PageId) -> Result<PageWriteGuard<'_>> {
        let frame_id = self.fetch_page_inner(page_id)?;
        let lock = self.frames[frame_id.0].page_mut();
        Ok(PageWriteGuard::new(self, frame_id, page_id, lock))
    }

    // ========================================================================
    // Raw pin API
    // ========================================================================

    /// Drop one pin on a resident page.
    ///
    /// Returns `false` if the page is not resident or already fully
    /// unpinned. A true `is_dirty` hint sets the dirty bit; `false` never
    /// clears it.
    pub fn unpin_page(&self, page_id: PageId, is_dirty: bool) -> bool {
        let mut state = self.latch.lock();

        let Some(&frame_id) = state.page_table.get(&page_id) else {
            return false;
        };

        let frame = &self.frames[frame_id.0];
        if frame.pin_count() == 0 {
            return false;
        }

        if is_dirty {
            frame.mark_dirty();
        }

        if frame.unpin() == 0 {
            state.replacer.set_evictable(frame_id, true);
        }

        true
    }

    // ========================================================================
    // Flush and delete
    // ========================================================================

    /// Write a resident page to disk, dirty or not, and clear its dirty bit.
    ///
    /// Returns `Ok(false)` if the page is not resident. Must not be called
    /// while holding a write guard on the same page (the flush takes the
    /// shared page latch).
    pub fn flush_page(&self, page_id: PageId) -> Result<bool> {
        let state = self.latch.lock();

        let Some(&frame_id) = state.page_table.get(&page_id) else {
            return Ok(false);
        };

        self.flush_frame(frame_id, page_id)?;
        Ok(true)
    }

    /// Write every resident page to disk.
    pub fn flush_all_pages(&self) -> Result<()> {
        let state = self.latch.lock();

        let pages: Vec<(PageId, FrameId)> = state
            .page_table
            .iter()
            .map(|(&pid, &fid)| (pid, fid))
            .collect();

        for (page_id, frame_id) in pages {
            self.flush_frame(frame_id, page_id)?;
        }

        Ok(())
    }

    /// Drop a page from the pool and return its frame to the free list.
    ///
    /// Succeeds vacuously if the page is not resident. The disk manager is
    /// told the page id is free (a hint only).
    ///
    /// # Errors
    /// [`Error::PagePinned`] while guards still pin the page.
    pub fn delete_page(&self, page_id: PageId) -> Result<()> {
        let mut state = self.latch.lock();

        let Some(&frame_id) = state.page_table.get(&page_id) else {
            return Ok(());
        };

        let frame = &self.frames[frame_id.0];
        if frame.is_pinned() {
            return Err(Error::PagePinned(page_id.0));
        }

        state.page_table.remove(&page_id);
        state.replacer.remove(frame_id);

        frame.page_mut().reset();
        frame.set_page_id(PageId::INVALID);
        frame.clear_dirty();

        state.free_list.push(frame_id);
        self.disk_manager.lock().deallocate_page(page_id);

        Ok(())
    }

    // ========================================================================
    // Introspection
    // ========================================================================

    /// Buffer pool statistics.
    pub fn stats(&self) -> &BufferPoolStats {
        &self.stats
    }

    /// Number of frames in the pool.
    pub fn pool_size(&self) -> usize {
        self.pool_size
    }

    /// Number of frames holding no page.
    pub fn free_frame_count(&self) -> usize {
        self.latch.lock().free_list.len()
    }

    /// Number of resident pages.
    pub fn resident_page_count(&self) -> usize {
        self.latch.lock().page_table.len()
    }

    // ========================================================================
    // Internals
    // ========================================================================

    pub(crate) fn frame(&self, frame_id: FrameId) -> &Frame {
        &self.frames[frame_id.0]
    }

    /// Unpin a frame directly. Called by guards on drop; the guard has
    /// already released any page latch it held.
    pub(crate) fn unpin_frame(&self, frame_id: FrameId, is_dirty: bool) {
        let mut state = self.latch.lock();

        let frame = &self.frames[frame_id.0];
        if is_dirty {
            frame.mark_dirty();
        }

        if frame.unpin() == 0 {
            state.replacer.set_evictable(frame_id, true);
        }
    }

    fn new_page_inner(&self) -> Result<(PageId, FrameId)> {
        let mut state = self.latch.lock();

        let frame_id = self.acquire_frame(&mut state)?;

        let page_id = match self.disk_manager.lock().allocate_page() {
            Ok(page_id) => page_id,
            Err(e) => {
                state.free_list.push(frame_id);
                return Err(e);
            }
        };

        let frame = &self.frames[frame_id.0];
        frame.page_mut().reset();
        frame.set_page_id(page_id);
        frame.clear_dirty();
        frame.pin();

        state.page_table.insert(page_id, frame_id);
        state.replacer.record_access(frame_id);
        state.replacer.set_evictable(frame_id, false);

        Ok((page_id, frame_id))
    }

    /// Pin `page_id` into a frame, loading it from disk on a miss.
    fn fetch_page_inner(&self, page_id: PageId) -> Result<FrameId> {
        let mut state = self.latch.lock();

        // Fast path: already resident.
        if let Some(&frame_id) = state.page_table.get(&page_id) {
            self.frames[frame_id.0].pin();
            state.replacer.record_access(frame_id);
            state.replacer.set_evictable(frame_id, false);
            self.stats.record_hit();
            return Ok(frame_id);
        }

        self.stats.record_miss();

        let frame_id = self.acquire_frame(&mut state)?;

        let page = match self.disk_manager.lock().read_page(page_id) {
            Ok(page) => page,
            Err(e) => {
                state.free_list.push(frame_id);
                return Err(e);
            }
        };
        self.stats.record_page_read();

        let frame = &self.frames[frame_id.0];
        frame
            .page_mut()
            .as_mut_slice()
            .copy_from_slice(page.as_slice());
        frame.set_page_id(page_id);
        frame.clear_dirty();
        frame.pin();

        state.page_table.insert(page_id, frame_id);
        state.replacer.record_access(frame_id);
        state.replacer.set_evictable(frame_id, false);

        Ok(frame_id)
    }

    /// Produce an empty frame: pop the free list, or evict a victim.
    ///
    /// A dirty victim is written back first; its page id stays allocated on
    /// disk. The victim's mapping is always removed from the page table.
    fn acquire_frame(&self, state: &mut PoolState) -> Result<FrameId> {
        if let Some(frame_id) = state.free_list.pop() {
            return Ok(frame_id);
        }

        let frame_id = state.replacer.evict().ok_or(Error::NoFreeFrames)?;
        self.stats.record_eviction();

        let frame = &self.frames[frame_id.0];
        let old_page_id = frame.page_id();
        debug_assert!(old_page_id.is_valid(), "victim frame holds no page");

        // Victims have pin count 0, so no guard holds this page latch.
        if frame.is_dirty() {
            let page = frame.page();
            self.disk_manager.lock().write_page(old_page_id, &page)?;
            drop(page);
            frame.clear_dirty();
            self.stats.record_page_written();
        }

        state.page_table.remove(&old_page_id);
        frame.set_page_id(PageId::INVALID);

        log::debug!("evicted {} from {}", old_page_id, frame_id);

        Ok(frame_id)
    }

    fn flush_frame(&self, frame_id: FrameId, page_id: PageId) -> Result<()> {
        let frame = &self.frames[frame_id.0];

        let page = frame.page();
        self.disk_manager.lock().write_page(page_id, &page)?;
        drop(page);

        frame.clear_dirty();
        self.stats.record_page_written();

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn create_test_bpm(pool_size: usize, k: usize) -> (BufferPoolManager, tempfile::TempDir) {
        let dir = tempdir().unwrap();
        let dm = DiskManager::create(dir.path().join("test.db")).unwrap();
        (BufferPoolManager::new(pool_size, k, dm), dir)
    }

    #[test]
    fn test_new_page_ids_are_sequential() {
        let (bpm, _dir) = create_test_bpm(10, 2);

        let guard = bpm.new_page().unwrap();
        assert_eq!(guard.page_id(), PageId::new(0));
        drop(guard);

        let guard = bpm.new_page().unwrap();
        assert_eq!(guard.page_id(), PageId::new(1));
    }

    #[test]
    fn test_write_then_fetch_read() {
        let (bpm, _dir) = create_test_bpm(10, 2);

        {
            let mut guard = bpm.new_page().unwrap();
            guard.write().as_mut_slice()[0] = 0xAB;
        }

        let guard = bpm.fetch_page_read(PageId::new(0)).unwrap();
        assert_eq!(guard.as_slice()[0], 0xAB);
    }

    #[test]
    fn test_fetch_page_write_modifies() {
        let (bpm, _dir) = create_test_bpm(10, 2);

        drop(bpm.new_page().unwrap());

        {
            let mut guard = bpm.fetch_page_write(PageId::new(0)).unwrap();
            guard.as_mut_slice()[0] = 0xCD;
        }

        let guard = bpm.fetch_page_read(PageId::new(0)).unwrap();
        assert_eq!(guard.as_slice()[0], 0xCD);
    }

    #[test]
    fn test_cache_hits_counted() {
        let (bpm, _dir) = create_test_bpm(10, 2);

        drop(bpm.new_page().unwrap());
        drop(bpm.fetch_page_read(PageId::new(0)).unwrap());
        drop(bpm.fetch_page_read(PageId::new(0)).unwrap());

        assert!(bpm.stats().snapshot().cache_hits >= 2);
    }

    #[test]
    fn test_pool_exhaustion_and_recovery() {
        // Pool of 3: pin everything, fail, unpin one, retry.
        let (bpm, _dir) = create_test_bpm(3, 2);

        let (_p0, _) = bpm.new_page_inner().unwrap();
        let (p1, _) = bpm.new_page_inner().unwrap();
        let (_p2, _) = bpm.new_page_inner().unwrap();

        assert!(matches!(bpm.new_page(), Err(Error::NoFreeFrames)));

        assert!(bpm.unpin_page(p1, false));

        let (p3, _) = bpm.new_page_inner().unwrap();
        assert_eq!(p3, PageId::new(3));
        assert!(!bpm.latch.lock().page_table.contains_key(&p1));
    }

    #[test]
    fn test_unpin_page_edge_cases() {
        let (bpm, _dir) = create_test_bpm(4, 2);

        let guard = bpm.new_page().unwrap();
        let page_id = guard.page_id();
        drop(guard); // pin now 0

        // Over-unpin and unknown pages report false.
        assert!(!bpm.unpin_page(page_id, false));
        assert!(!bpm.unpin_page(PageId::new(99), false));
    }

    #[test]
    fn test_dirty_page_flushed_on_eviction() {
        let (bpm, _dir) = create_test_bpm(1, 2);

        {
            let mut guard = bpm.new_page().unwrap();
            guard.write().as_mut_slice()[0] = 0x42;
        }

        // Single frame: this eviction must write page 0 back.
        drop(bpm.new_page().unwrap());

        let guard = bpm.fetch_page_read(PageId::new(0)).unwrap();
        assert_eq!(guard.as_slice()[0], 0x42);
    }

    #[test]
    fn test_eviction_prefers_older_page() {
        // Dirty p0 goes first: it was touched before p1.
        let (bpm, _dir) = create_test_bpm(2, 2);

        {
            let mut g = bpm.new_page().unwrap();
            g.write().as_mut_slice()[0] = 0xB0;
        }
        drop(bpm.new_page().unwrap());

        drop(bpm.new_page().unwrap()); // evicts p0 (oldest access)

        let state = bpm.latch.lock();
        assert!(!state.page_table.contains_key(&PageId::new(0)));
        assert!(state.page_table.contains_key(&PageId::new(1)));
        drop(state);

        let guard = bpm.fetch_page_read(PageId::new(0)).unwrap();
        assert_eq!(guard.as_slice()[0], 0xB0);
    }

    #[test]
    fn test_delete_page() {
        let (bpm, _dir) = create_test_bpm(10, 2);

        drop(bpm.new_page().unwrap());
        assert_eq!(bpm.resident_page_count(), 1);

        bpm.delete_page(PageId::new(0)).unwrap();
        assert_eq!(bpm.free_frame_count(), 10);
        assert_eq!(bpm.resident_page_count(), 0);

        // Deleting a non-resident page succeeds vacuously.
        bpm.delete_page(PageId::new(0)).unwrap();
    }

    #[test]
    fn test_delete_pinned_page_fails() {
        let (bpm, _dir) = create_test_bpm(10, 2);

        let guard = bpm.new_page().unwrap();
        let result = bpm.delete_page(guard.page_id());
        assert!(matches!(result, Err(Error::PagePinned(_))));
    }

    #[test]
    fn test_flush_page_clears_dirty_and_persists() {
        let (bpm, _dir) = create_test_bpm(10, 2);

        let page_id = {
            let mut guard = bpm.new_page().unwrap();
            guard.write().as_mut_slice()[0] = 0xFF;
            guard.page_id()
        };

        assert!(bpm.flush_page(page_id).unwrap());
        assert!(!bpm.frames[0].is_dirty());
        assert!(bpm.stats().snapshot().pages_written >= 1);

        // Absent pages report false.
        assert!(!bpm.flush_page(PageId::new(77)).unwrap());
    }

    #[test]
    fn test_flush_all_pages() {
        let (bpm, _dir) = create_test_bpm(10, 2);

        for i in 0..5u8 {
            let mut guard = bpm.new_page().unwrap();
            guard.write().as_mut_slice()[0] = i;
        }

        bpm.flush_all_pages().unwrap();
        assert!(bpm.stats().snapshot().pages_written >= 5);
        for i in 0..5 {
            assert!(!bpm.frames[i].is_dirty());
        }
    }

    #[test]
    fn test_multiple_read_guards_coexist() {
        let (bpm, _dir) = create_test_bpm(10, 2);

        drop(bpm.new_page().unwrap());

        let g1 = bpm.fetch_page_read(PageId::new(0)).unwrap();
        let g2 = bpm.fetch_page_read(PageId::new(0)).unwrap();
        assert_eq!(g1.page_id(), g2.page_id());
        assert_eq!(bpm.frames[0].pin_count(), 2);
    }

    #[test]
    fn test_fetch_unknown_page_fails() {
        let (bpm, _dir) = create_test_bpm(10, 2);
        assert!(bpm.fetch_page_read(PageId::new(999)).is_err());
    }

    #[test]
    fn test_pin_count_follows_guards() {
        let (bpm, _dir) = create_test_bpm(10, 2);

        drop(bpm.new_page().unwrap());
        let frame = &bpm.frames[0];
        assert_eq!(frame.pin_count(), 0);

        {
            let _guard = bpm.fetch_page_read(PageId::new(0)).unwrap();
            assert_eq!(frame.pin_count(), 1);
        }
        assert_eq!(frame.pin_count(), 0);
    }

    #[test]
    fn test_basic_guard_clean_unless_written() {
        let (bpm, _dir) = create_test_bpm(10, 2);

        {
            let mut guard = bpm.new_page().unwrap();
            guard.write().as_mut_slice()[0] = 1;
        }
        bpm.flush_page(PageId::new(0)).unwrap();

        // Read-only basic guard leaves the page clean.
        {
            let guard = bpm.fetch_page_basic(PageId::new(0)).unwrap();
            assert_eq!(guard.read().as_slice()[0], 1);
        }
        assert!(!bpm.frames[0].is_dirty());

        // Taking write access marks it dirty again.
        {
            let mut guard = bpm.fetch_page_basic(PageId::new(0)).unwrap();
            guard.write().as_mut_slice()[0] = 2;
        }
        assert!(bpm.frames[0].is_dirty());
    }

    #[test]
    fn test_concurrent_readers() {
        use std::sync::Arc;
        use std::thread;

        let (bpm, _dir) = create_test_bpm(10, 2);
        let bpm = Arc::new(bpm);

        {
            let mut guard = bpm.new_page().unwrap();
            guard.write().as_mut_slice()[0] = 0x42;
        }

        let handles: Vec<_> = (0..10)
            .map(|_| {
                let bpm = Arc::clone(&bpm);
                thread::spawn(move || {
                    let guard = bpm.fetch_page_read(PageId::new(0)).unwrap();
                    assert_eq!(guard.as_slice()[0], 0x42);
                })
            })
            .collect();

        for handle in handles {
            handle.join().unwrap();
        }
    }

    #[test]
    fn test_pool_invariants_random_workload() {
        use rand::prelude::*;

        let (bpm, _dir) = create_test_bpm(4, 2);
        let mut rng = StdRng::seed_from_u64(0xB0F);

        let mut created = Vec::new();
        for _ in 0..200 {
            if created.is_empty() || rng.gen_bool(0.3) {
                if let Ok(guard) = bpm.new_page() {
                    created.push(guard.page_id());
                }
            } else {
                let page_id = *created.choose(&mut rng).unwrap();
                if let Ok(mut guard) = bpm.fetch_page_write(page_id) {
                    guard.as_mut_slice()[0] = page_id.0 as u8;
                }
            }

            // Page table and free list stay disjoint and consistent.
            let state = bpm.latch.lock();
            for (&page_id, &frame_id) in state.page_table.iter() {
                assert_eq!(bpm.frames[frame_id.0].page_id(), page_id);
                assert!(!state.free_list.contains(&frame_id));
            }
            for &frame_id in state.free_list.iter() {
                assert_eq!(bpm.frames[frame_id.0].page_id(), PageId::INVALID);
                assert_eq!(bpm.frames[frame_id.0].pin_count(), 0);
            }
        }
    }
}
