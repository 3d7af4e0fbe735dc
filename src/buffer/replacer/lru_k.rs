//! LRU-K replacement policy.

use std::collections::{HashMap, VecDeque};

use crate::common::FrameId;

/// Per-frame access bookkeeping.
struct LruKNode {
    /// Timestamps of the last `<= k` accesses, oldest first.
    history: VecDeque<u64>,
    /// Whether the buffer pool allows this frame to be evicted.
    evictable: bool,
}

/// Selects eviction victims by backward k-distance.
///
/// A frame's backward k-distance is the age of its k-th most recent access,
/// or infinite while it has fewer than `k` recorded accesses. Eviction picks
/// the evictable frame with the largest distance:
///
/// - frames with infinite distance all tie, broken by earliest first access
///   (plain LRU over the `less_k` queue, which keeps first-access order and
///   is never reshuffled by later accesses);
/// - otherwise the frame whose k-th most recent access is oldest wins.
///
/// One-shot scan traffic therefore drains out of the pool before anything
/// with demonstrated reuse is touched.
///
/// The replacer has no interior locking; it lives inside the buffer pool's
/// central latch.
pub struct LruKReplacer {
    k: usize,
    /// Upper bound on valid frame ids.
    num_frames: usize,
    /// Logical clock, bumped on every recorded access.
    current_tick: u64,
    /// Tracked frames.
    nodes: HashMap<FrameId, LruKNode>,
    /// Frames with fewer than `k` accesses, in first-access order.
    less_k: VecDeque<FrameId>,
    /// Frames with a full history of `k` accesses.
    full_k: Vec<FrameId>,
}

impl LruKReplacer {
    /// Create a replacer for `num_frames` frames with history depth `k`.
    ///
    /// # Panics
    /// Panics if `k` is 0.
    pub fn new(num_frames: usize, k: usize) -> Self {
        assert!(k > 0, "k must be > 0");
        Self {
            k,
            num_frames,
            current_tick: 0,
            nodes: HashMap::new(),
            less_k: VecDeque::new(),
            full_k: Vec::new(),
        }
    }

    /// Record an access to `frame_id` at the next clock tick.
    ///
    /// Starts tracking the frame on first access (non-evictable until the
    /// pool says otherwise). Never changes evictability.
    ///
    /// # Panics
    /// Panics if `frame_id` is out of range.
    pub fn record_access(&mut self, frame_id: FrameId) {
        self.check_range(frame_id);
        self.current_tick += 1;

        if !self.nodes.contains_key(&frame_id) {
            self.less_k.push_back(frame_id);
            self.nodes.insert(
                frame_id,
                LruKNode {
                    history: VecDeque::new(),
                    evictable: false,
                },
            );
        }

        let node = self.nodes.get_mut(&frame_id).expect("just inserted");
        node.history.push_back(self.current_tick);
        if node.history.len() > self.k {
            node.history.pop_front();
        }

        // Graduate into full_k once the history fills up.
        if node.history.len() == self.k && !self.full_k.contains(&frame_id) {
            self.less_k.retain(|&f| f != frame_id);
            self.full_k.push(frame_id);
        }
    }

    /// Set the evictable bit for a tracked frame.
    ///
    /// # Panics
    /// Panics if `frame_id` is out of range or untracked.
    pub fn set_evictable(&mut self, frame_id: FrameId, evictable: bool) {
        self.check_range(frame_id);
        match self.nodes.get_mut(&frame_id) {
            Some(node) => node.evictable = evictable,
            None => panic!("set_evictable on untracked frame {}", frame_id),
        }
    }

    /// Pick a victim and stop tracking it.
    ///
    /// Returns `None` when no tracked frame is evictable.
    pub fn evict(&mut self) -> Option<FrameId> {
        // Infinite k-distance beats any finite one: drain less_k first, in
        // first-access order.
        if let Some(pos) = self
            .less_k
            .iter()
            .position(|f| self.nodes[f].evictable)
        {
            let frame_id = self.less_k.remove(pos).expect("position was valid");
            self.nodes.remove(&frame_id);
            return Some(frame_id);
        }

        // All candidates have full history: largest k-distance means the
        // oldest retained timestamp.
        let victim = self
            .full_k
            .iter()
            .copied()
            .filter(|f| self.nodes[f].evictable)
            .min_by_key(|f| *self.nodes[f].history.front().expect("full history"))?;

        self.full_k.retain(|&f| f != victim);
        self.nodes.remove(&victim);
        Some(victim)
    }

    /// Stop tracking `frame_id` unconditionally.
    ///
    /// The caller must ensure the frame is not pinned. No-op for untracked
    /// frames.
    ///
    /// # Panics
    /// Panics if `frame_id` is out of range.
    pub fn remove(&mut self, frame_id: FrameId) {
        self.check_range(frame_id);
        if self.nodes.remove(&frame_id).is_some() {
            self.less_k.retain(|&f| f != frame_id);
            self.full_k.retain(|&f| f != frame_id);
        }
    }

    /// Number of tracked frames currently marked evictable.
    pub fn size(&self) -> usize {
        self.nodes.values().filter(|n| n.evictable).count()
    }

    fn check_range(&self, frame_id: FrameId) {
        assert!(
            frame_id.0 < self.num_frames,
            "frame id {} out of range (pool size {})",
            frame_id,
            self.num_frames
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fid(id: usize) -> FrameId {
        FrameId::new(id)
    }

    #[test]
    fn test_evict_prefers_less_k_in_first_access_order() {
        let mut replacer = LruKReplacer::new(8, 2);

        // Frames 1, 2, 3 accessed once each: all have infinite k-distance.
        replacer.record_access(fid(1));
        replacer.record_access(fid(2));
        replacer.record_access(fid(3));
        for f in [1, 2, 3] {
            replacer.set_evictable(fid(f), true);
        }
        assert_eq!(replacer.size(), 3);

        // Oldest first access goes first.
        assert_eq!(replacer.evict(), Some(fid(1)));

        // Frame 2 graduates to a full history; frame 3 still has one access.
        replacer.record_access(fid(2));
        assert_eq!(replacer.evict(), Some(fid(3)));

        assert_eq!(replacer.evict(), Some(fid(2)));
        assert_eq!(replacer.evict(), None);
    }

    #[test]
    fn test_reaccess_does_not_reorder_less_k() {
        let mut replacer = LruKReplacer::new(8, 3);

        replacer.record_access(fid(0));
        replacer.record_access(fid(1));
        // Re-access frame 0; with k = 3 it stays in less_k and keeps its
        // first-access position.
        replacer.record_access(fid(0));
        replacer.set_evictable(fid(0), true);
        replacer.set_evictable(fid(1), true);

        assert_eq!(replacer.evict(), Some(fid(0)));
        assert_eq!(replacer.evict(), Some(fid(1)));
    }

    #[test]
    fn test_full_k_evicts_oldest_kth_access() {
        let mut replacer = LruKReplacer::new(8, 2);

        // ticks: f0 at 1,2 ; f1 at 3,4 ; f2 at 5,6
        for f in [0, 0, 1, 1, 2, 2] {
            replacer.record_access(fid(f));
        }
        // Refresh f0: history {2, 7}; f1 keeps {3, 4}.
        replacer.record_access(fid(0));

        for f in [0, 1, 2] {
            replacer.set_evictable(fid(f), true);
        }

        // Oldest retained timestamp wins: f0 has 2, f1 has 3, f2 has 5.
        assert_eq!(replacer.evict(), Some(fid(0)));
        assert_eq!(replacer.evict(), Some(fid(1)));
        assert_eq!(replacer.evict(), Some(fid(2)));
    }

    #[test]
    fn test_evict_skips_non_evictable() {
        let mut replacer = LruKReplacer::new(8, 2);

        replacer.record_access(fid(0));
        replacer.record_access(fid(1));
        replacer.set_evictable(fid(0), false);
        replacer.set_evictable(fid(1), true);

        assert_eq!(replacer.size(), 1);
        assert_eq!(replacer.evict(), Some(fid(1)));
        assert_eq!(replacer.evict(), None);

        // Frame 0 is still tracked and can be released later.
        replacer.set_evictable(fid(0), true);
        assert_eq!(replacer.evict(), Some(fid(0)));
    }

    #[test]
    fn test_remove_untracks() {
        let mut replacer = LruKReplacer::new(8, 2);

        replacer.record_access(fid(0));
        replacer.record_access(fid(1));
        replacer.set_evictable(fid(0), true);
        replacer.set_evictable(fid(1), true);

        replacer.remove(fid(0));
        assert_eq!(replacer.size(), 1);
        assert_eq!(replacer.evict(), Some(fid(1)));
        assert_eq!(replacer.evict(), None);

        // Removing an untracked frame is fine.
        replacer.remove(fid(5));
    }

    #[test]
    fn test_size_counts_only_evictable() {
        let mut replacer = LruKReplacer::new(8, 2);

        for f in 0..4 {
            replacer.record_access(fid(f));
        }
        assert_eq!(replacer.size(), 0);

        replacer.set_evictable(fid(1), true);
        replacer.set_evictable(fid(2), true);
        assert_eq!(replacer.size(), 2);

        replacer.set_evictable(fid(2), false);
        assert_eq!(replacer.size(), 1);
    }

    #[test]
    #[should_panic(expected = "out of range")]
    fn test_record_access_out_of_range_panics() {
        let mut replacer = LruKReplacer::new(4, 2);
        replacer.record_access(fid(4));
    }

    #[test]
    #[should_panic(expected = "untracked frame")]
    fn test_set_evictable_untracked_panics() {
        let mut replacer = LruKReplacer::new(4, 2);
        replacer.set_evictable(fid(0), true);
    }

    #[test]
    fn test_history_is_trimmed_to_k() {
        let mut replacer = LruKReplacer::new(4, 2);

        // ticks: f0 at 1..=5, f1 at 6,7
        for _ in 0..5 {
            replacer.record_access(fid(0));
        }
        replacer.record_access(fid(1));
        replacer.record_access(fid(1));
        replacer.set_evictable(fid(0), true);
        replacer.set_evictable(fid(1), true);

        // f0's retained history is {4, 5}; f1's is {6, 7}. f0 is older.
        assert_eq!(replacer.evict(), Some(fid(0)));
    }
}
