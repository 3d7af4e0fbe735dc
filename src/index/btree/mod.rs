//! B+ tree index over the buffer pool.
//!
//! The tree owns no pages in memory: every node lives in the buffer pool
//! and is reached through a page guard. The root is found through a fixed
//! header page, so it can move across splits and collapses without the
//! tree's callers noticing.
//!
//! Readers (`get_value`, iteration) take `&self` and descend with
//! read-guard crabbing. Mutations (`insert`, `remove`) take `&mut self`:
//! one structural writer at a time, enforced by the borrow checker.
//! Concurrent mutators wrap the tree in a lock.

mod header;
mod internal;
mod iterator;
pub mod key;
mod leaf;
mod node;

use std::fmt::{self, Write as _};
use std::marker::PhantomData;
use std::sync::Arc;

use crate::buffer::{BufferPoolManager, PageWriteGuard};
use crate::common::{Error, PageId, Result};

pub use header::TreeHeader;
pub use internal::InternalPage;
pub use iterator::TreeIterator;
pub use key::{GenericKey, Int64Comparator, KeyComparator, RecordId, Storable};
pub use leaf::LeafPage;
pub use node::{BTreePageType, NodeHeader};

/// A disk-resident B+ tree mapping fixed-width keys to fixed-width values.
///
/// Keys are unique; inserting a duplicate reports `false`. Leaves are
/// chained left to right for ordered scans. The key ordering is supplied by
/// a [`KeyComparator`] rather than an `Ord` bound, matching an index whose
/// ordering depends on runtime schema.
pub struct BPlusTree<K, V, C> {
    /// Index name, used in log lines only.
    name: String,
    header_page_id: PageId,
    bpm: Arc<BufferPoolManager>,
    comparator: C,
    leaf_max_size: u32,
    internal_max_size: u32,
    _marker: PhantomData<(K, V)>,
}

impl<K, V, C> BPlusTree<K, V, C>
where
    K: Storable,
    V: Storable,
    C: KeyComparator<K>,
{
    /// Create a tree rooted through `header_page_id`, formatting the header
    /// as an empty tree.
    ///
    /// The header page must already be allocated (conventionally page 0,
    /// allocated by the caller right after creating the database).
    ///
    /// # Panics
    /// Panics if `leaf_max_size < 2`, `internal_max_size < 3`, or either
    /// exceeds what fits in a page.
    pub fn new(
        name: impl Into<String>,
        header_page_id: PageId,
        bpm: Arc<BufferPoolManager>,
        comparator: C,
        leaf_max_size: u32,
        internal_max_size: u32,
    ) -> Result<Self> {
        let tree = Self::open(
            name,
            header_page_id,
            bpm,
            comparator,
            leaf_max_size,
            internal_max_size,
        )?;

        let mut guard = tree.bpm.fetch_page_write(header_page_id)?;
        TreeHeader::empty().write_to(guard.as_mut_slice());
        drop(guard);

        Ok(tree)
    }

    /// Attach to a tree that already exists on disk, leaving its header
    /// untouched.
    pub fn open(
        name: impl Into<String>,
        header_page_id: PageId,
        bpm: Arc<BufferPoolManager>,
        comparator: C,
        leaf_max_size: u32,
        internal_max_size: u32,
    ) -> Result<Self> {
        assert!(leaf_max_size >= 2, "leaf_max_size must be >= 2");
        assert!(internal_max_size >= 3, "internal_max_size must be >= 3");
        assert!(
            leaf_max_size as usize <= LeafPage::<&[u8], K, V>::slot_capacity(),
            "leaf_max_size exceeds page capacity"
        );
        assert!(
            internal_max_size as usize <= InternalPage::<&[u8], K>::slot_capacity(),
            "internal_max_size exceeds page capacity"
        );

        Ok(Self {
            name: name.into(),
            header_page_id,
            bpm,
            comparator,
            leaf_max_size,
            internal_max_size,
            _marker: PhantomData,
        })
    }

    /// Page id of the current root, or [`PageId::INVALID`] for an empty
    /// tree.
    pub fn get_root_page_id(&self) -> Result<PageId> {
        let guard = self.bpm.fetch_page_read(self.header_page_id)?;
        Ok(TreeHeader::from_bytes(guard.as_slice()).root_page_id)
    }

    /// Whether the tree holds no entries.
    pub fn is_empty(&self) -> Result<bool> {
        Ok(!self.get_root_page_id()?.is_valid())
    }

    // ========================================================================
    // Search
    // ========================================================================

    /// Look up `key`, returning its value if present.
    ///
    /// The vector shape matches the lookup interface of a multi-valued
    /// index; a unique tree yields zero or one element.
    pub fn get_value(&self, key: &K) -> Result<Vec<V>> {
        if self.is_empty()? {
            return Ok(Vec::new());
        }

        let leaf_id = self.find_leaf(key)?;
        let guard = self.bpm.fetch_page_read(leaf_id)?;
        let leaf = LeafPage::<_, K, V>::new(guard.as_slice());

        let position = leaf.find_position(key, &self.comparator);
        if leaf.key_matches(position, key, &self.comparator) {
            Ok(vec![leaf.value_at(position)])
        } else {
            Ok(Vec::new())
        }
    }

    /// Descend from the root to the leaf that owns `key`.
    ///
    /// Read crabbing: the child guard is taken while the parent guard is
    /// still held, then the parent is released.
    fn find_leaf(&self, key: &K) -> Result<PageId> {
        let mut current = self.get_root_page_id()?;
        if !current.is_valid() {
            return Err(Error::TreeCorrupted("descending into an empty tree"));
        }

        let mut guard = self.bpm.fetch_page_read(current)?;
        loop {
            let header = NodeHeader::from_bytes(guard.as_slice());
            match header.page_type {
                BTreePageType::Leaf => return Ok(current),
                BTreePageType::Internal => {
                    let node = InternalPage::<_, K>::new(guard.as_slice());
                    let index = node.find_child_index(key, &self.comparator);
                    let child = node.child_at(index);

                    let child_guard = self.bpm.fetch_page_read(child)?;
                    guard = child_guard; // parent released here
                    current = child;
                }
                BTreePageType::Invalid => {
                    return Err(Error::TreeCorrupted("descent hit an unformatted page"))
                }
            }
        }
    }

    // ========================================================================
    // Insert
    // ========================================================================

    /// Insert a key/value pair. Returns `false` if the key already exists.
    pub fn insert(&mut self, key: K, value: V) -> Result<bool> {
        if self.is_empty()? {
            return self.start_new_tree(key, value);
        }

        let leaf_id = self.find_leaf(&key)?;
        // Guards taken below outlive calls on `&mut self`, so they borrow a
        // local handle to the pool rather than `self`.
        let bpm = Arc::clone(&self.bpm);
        let mut leaf_guard = bpm.fetch_page_write(leaf_id)?;

        let (position, exists, size, max_size) = {
            let leaf = LeafPage::<_, K, V>::new(leaf_guard.as_slice());
            let position = leaf.find_position(&key, &self.comparator);
            (
                position,
                leaf.key_matches(position, &key, &self.comparator),
                leaf.size(),
                leaf.max_size(),
            )
        };

        if exists {
            return Ok(false);
        }

        // A leaf is full at max_size - 1 entries.
        if size + 1 < max_size {
            let mut leaf = LeafPage::<_, K, V>::new(leaf_guard.as_mut_slice());
            leaf.insert(position, &key, &value);
            return Ok(true);
        }

        self.split_leaf(leaf_guard, position, key, value)?;
        Ok(true)
    }

    fn start_new_tree(&mut self, key: K, value: V) -> Result<bool> {
        let mut header_guard = self.bpm.fetch_page_write(self.header_page_id)?;

        let mut root_guard = self.bpm.new_page()?;
        let root_id = root_guard.page_id();
        {
            let mut page = root_guard.write();
            let mut leaf = LeafPage::<_, K, V>::new(page.as_mut_slice());
            leaf.init(root_id, self.leaf_max_size);
            leaf.set_is_root(true);
            leaf.insert(0, &key, &value);
        }

        TreeHeader {
            root_page_id: root_id,
        }
        .write_to(header_guard.as_mut_slice());

        log::debug!("{}: started new tree at {}", self.name, root_id);
        Ok(true)
    }

    /// Split a full leaf while inserting `(key, value)` at `position`.
    ///
    /// The first ⌈max/2⌉ entries stay put; the rest move to a fresh right
    /// sibling whose first key becomes the separator pushed upward.
    fn split_leaf(
        &mut self,
        mut leaf_guard: PageWriteGuard<'_>,
        position: usize,
        key: K,
        value: V,
    ) -> Result<()> {
        let leaf_id = leaf_guard.page_id();

        let (mut entries, old_next, was_root, parent_id) = {
            let leaf = LeafPage::<_, K, V>::new(leaf_guard.as_slice());
            let header = leaf.header();
            (
                leaf.entries(),
                leaf.next_page_id(),
                header.is_root,
                header.parent_page_id,
            )
        };
        entries.insert(position, (key, value));

        let mut new_guard = self.bpm.new_page()?;
        let new_id = new_guard.page_id();

        let split_at = entries.len().div_ceil(2);
        let middle_key = entries[split_at].0;

        {
            let mut leaf = LeafPage::<_, K, V>::new(leaf_guard.as_mut_slice());
            for (i, (k, v)) in entries[..split_at].iter().enumerate() {
                leaf.set_at(i, k, v);
            }
            leaf.set_size(split_at);
            leaf.set_next_page_id(new_id);
        }
        {
            let mut page = new_guard.write();
            let mut new_leaf = LeafPage::<_, K, V>::new(page.as_mut_slice());
            new_leaf.init(new_id, self.leaf_max_size);
            new_leaf.set_parent_page_id(parent_id);
            for (i, (k, v)) in entries[split_at..].iter().enumerate() {
                new_leaf.set_at(i, k, v);
            }
            new_leaf.set_size(entries.len() - split_at);
            new_leaf.set_next_page_id(old_next);
        }

        log::debug!("{}: split leaf {} -> {}", self.name, leaf_id, new_id);

        drop(leaf_guard);
        drop(new_guard);
        self.insert_in_parent(leaf_id, was_root, parent_id, middle_key, new_id)
    }

    /// Hook a freshly split-off node into the tree above it.
    ///
    /// `new_id`'s parent pointer already names `parent_id`; it only changes
    /// when a new root is built or the parent itself splits.
    fn insert_in_parent(
        &mut self,
        old_id: PageId,
        old_was_root: bool,
        parent_id: PageId,
        middle_key: K,
        new_id: PageId,
    ) -> Result<()> {
        if old_was_root {
            let mut root_guard = self.bpm.new_page()?;
            let root_id = root_guard.page_id();
            {
                let mut page = root_guard.write();
                let mut root = InternalPage::<_, K>::new(page.as_mut_slice());
                root.init(root_id, self.internal_max_size);
                root.set_is_root(true);
                root.populate_new_root(old_id, &middle_key, new_id);
            }
            drop(root_guard);

            // Both children hang off the new root now; the old root sheds
            // its flag.
            for child in [old_id, new_id] {
                let mut guard = self.bpm.fetch_page_write(child)?;
                let mut header = NodeHeader::from_bytes(guard.as_slice());
                header.parent_page_id = root_id;
                header.is_root = false;
                header.write_to(guard.as_mut_slice());
            }

            self.set_root_page_id(root_id)?;
            log::debug!("{}: new root {}", self.name, root_id);
            return Ok(());
        }

        let bpm = Arc::clone(&self.bpm);
        let mut parent_guard = bpm.fetch_page_write(parent_id)?;
        let (size, max_size, position) = {
            let parent = InternalPage::<_, K>::new(parent_guard.as_slice());
            (
                parent.size(),
                parent.max_size(),
                parent.find_insert_position(&middle_key, &self.comparator),
            )
        };

        if size < max_size {
            let mut parent = InternalPage::<_, K>::new(parent_guard.as_mut_slice());
            parent.insert_at(position, &middle_key, new_id);
            return Ok(());
        }

        self.split_internal(parent_guard, middle_key, new_id)
    }

    /// Split a full internal node while inserting `(key, child_id)`.
    ///
    /// The median key after insertion moves up rather than staying in
    /// either half. Every child handed to the new right node gets its
    /// parent pointer rewritten.
    fn split_internal(
        &mut self,
        mut guard: PageWriteGuard<'_>,
        key: K,
        child_id: PageId,
    ) -> Result<()> {
        let old_id = guard.page_id();

        let (mut entries, was_root, parent_id, position) = {
            let node = InternalPage::<_, K>::new(guard.as_slice());
            let header = node.header();
            (
                node.entries(),
                header.is_root,
                header.parent_page_id,
                node.find_child_index(&key, &self.comparator) + 1,
            )
        };
        entries.insert(position, (key, child_id));

        let mut new_guard = self.bpm.new_page()?;
        let new_id = new_guard.page_id();

        let split_at = entries.len() / 2;
        let middle_key = entries[split_at].0;

        {
            let mut node = InternalPage::<_, K>::new(guard.as_mut_slice());
            for (i, (k, c)) in entries[..split_at].iter().enumerate() {
                node.set_key_at(i, k);
                node.set_child_at(i, *c);
            }
            node.set_size(split_at);
        }

        let moved: Vec<PageId> = entries[split_at..].iter().map(|&(_, c)| c).collect();
        {
            let mut page = new_guard.write();
            let mut node = InternalPage::<_, K>::new(page.as_mut_slice());
            node.init(new_id, self.internal_max_size);
            node.set_parent_page_id(parent_id);
            for (i, (k, c)) in entries[split_at..].iter().enumerate() {
                node.set_key_at(i, k);
                node.set_child_at(i, *c);
            }
            node.set_size(entries.len() - split_at);
        }

        drop(guard);
        drop(new_guard);

        for child in moved {
            let mut child_guard = self.bpm.fetch_page_write(child)?;
            let mut header = NodeHeader::from_bytes(child_guard.as_slice());
            header.parent_page_id = new_id;
            header.write_to(child_guard.as_mut_slice());
        }

        log::debug!("{}: split internal {} -> {}", self.name, old_id, new_id);
        self.insert_in_parent(old_id, was_root, parent_id, middle_key, new_id)
    }

    // ========================================================================
    // Remove
    // ========================================================================

    /// Remove `key` if present. Absent keys are a no-op.
    pub fn remove(&mut self, key: &K) -> Result<()> {
        if self.is_empty()? {
            return Ok(());
        }

        let leaf_id = self.find_leaf(key)?;
        let mut leaf_guard = self.bpm.fetch_page_write(leaf_id)?;

        let (position, exists) = {
            let leaf = LeafPage::<_, K, V>::new(leaf_guard.as_slice());
            let position = leaf.find_position(key, &self.comparator);
            (position, leaf.key_matches(position, key, &self.comparator))
        };

        if !exists {
            return Ok(());
        }

        let (size, was_root, parent_id, min_size) = {
            let mut leaf = LeafPage::<_, K, V>::new(leaf_guard.as_mut_slice());
            leaf.remove(position);
            let header = leaf.header();
            (
                header.size as usize,
                header.is_root,
                header.parent_page_id,
                header.min_size() as usize,
            )
        };

        if was_root {
            // A root leaf never rebalances; an emptied root empties the
            // whole tree.
            if size == 0 {
                drop(leaf_guard);
                self.set_root_page_id(PageId::INVALID)?;
                self.bpm.delete_page(leaf_id)?;
                log::debug!("{}: tree emptied", self.name);
            }
            return Ok(());
        }

        if size < min_size {
            drop(leaf_guard);
            self.rebalance_leaf(leaf_id, parent_id)?;
        }

        Ok(())
    }

    /// Fix an underflowing leaf: borrow one entry through the parent
    /// separator if a sibling can spare it, else merge with a sibling.
    fn rebalance_leaf(&mut self, leaf_id: PageId, parent_id: PageId) -> Result<()> {
        let bpm = Arc::clone(&self.bpm);
        let mut parent_guard = bpm.fetch_page_write(parent_id)?;

        let (index, parent_size) = {
            let parent = InternalPage::<_, K>::new(parent_guard.as_slice());
            let index = parent
                .child_index_of(leaf_id)
                .ok_or(Error::TreeCorrupted("leaf missing from its parent"))?;
            (index, parent.size())
        };

        // Borrow from the right sibling.
        if index + 1 < parent_size {
            let right_id = {
                let parent = InternalPage::<_, K>::new(parent_guard.as_slice());
                parent.child_at(index + 1)
            };
            let mut right_guard = self.bpm.fetch_page_write(right_id)?;

            let can_lend = {
                let right = LeafPage::<_, K, V>::new(right_guard.as_slice());
                right.size() > right.header().min_size() as usize
            };
            if can_lend {
                let (borrowed_key, borrowed_value) = {
                    let right = LeafPage::<_, K, V>::new(right_guard.as_slice());
                    (right.key_at(0), right.value_at(0))
                };
                let new_separator = {
                    let mut right = LeafPage::<_, K, V>::new(right_guard.as_mut_slice());
                    right.remove(0);
                    right.key_at(0)
                };

                let mut leaf_guard = self.bpm.fetch_page_write(leaf_id)?;
                {
                    let mut leaf = LeafPage::<_, K, V>::new(leaf_guard.as_mut_slice());
                    let size = leaf.size();
                    leaf.insert(size, &borrowed_key, &borrowed_value);
                }

                let mut parent = InternalPage::<_, K>::new(parent_guard.as_mut_slice());
                parent.set_key_at(index + 1, &new_separator);
                return Ok(());
            }
        }

        // Borrow from the left sibling.
        if index > 0 {
            let left_id = {
                let parent = InternalPage::<_, K>::new(parent_guard.as_slice());
                parent.child_at(index - 1)
            };
            let mut left_guard = self.bpm.fetch_page_write(left_id)?;

            let can_lend = {
                let left = LeafPage::<_, K, V>::new(left_guard.as_slice());
                left.size() > left.header().min_size() as usize
            };
            if can_lend {
                let (borrowed_key, borrowed_value) = {
                    let mut left = LeafPage::<_, K, V>::new(left_guard.as_mut_slice());
                    let last = left.size() - 1;
                    let entry = (left.key_at(last), left.value_at(last));
                    left.remove(last);
                    entry
                };

                let mut leaf_guard = self.bpm.fetch_page_write(leaf_id)?;
                {
                    let mut leaf = LeafPage::<_, K, V>::new(leaf_guard.as_mut_slice());
                    leaf.insert(0, &borrowed_key, &borrowed_value);
                }

                let mut parent = InternalPage::<_, K>::new(parent_guard.as_mut_slice());
                parent.set_key_at(index, &borrowed_key);
                return Ok(());
            }
        }

        // No sibling can lend: merge. Prefer absorbing the right sibling,
        // else fold this leaf into the left one.
        if index + 1 < parent_size {
            let right_id = {
                let parent = InternalPage::<_, K>::new(parent_guard.as_slice());
                parent.child_at(index + 1)
            };

            let (right_entries, right_next) = {
                let right_guard = self.bpm.fetch_page_read(right_id)?;
                let right = LeafPage::<_, K, V>::new(right_guard.as_slice());
                (right.entries(), right.next_page_id())
            };

            {
                let mut leaf_guard = self.bpm.fetch_page_write(leaf_id)?;
                let mut leaf = LeafPage::<_, K, V>::new(leaf_guard.as_mut_slice());
                let mut size = leaf.size();
                for (k, v) in &right_entries {
                    leaf.set_at(size, k, v);
                    size += 1;
                }
                leaf.set_size(size);
                leaf.set_next_page_id(right_next);
            }

            {
                let mut parent = InternalPage::<_, K>::new(parent_guard.as_mut_slice());
                parent.remove_at(index + 1);
            }
            self.bpm.delete_page(right_id)?;
            log::debug!("{}: merged leaf {} into {}", self.name, right_id, leaf_id);
        } else {
            let left_id = {
                let parent = InternalPage::<_, K>::new(parent_guard.as_slice());
                parent.child_at(index - 1)
            };

            let (leaf_entries, leaf_next) = {
                let leaf_guard = self.bpm.fetch_page_read(leaf_id)?;
                let leaf = LeafPage::<_, K, V>::new(leaf_guard.as_slice());
                (leaf.entries(), leaf.next_page_id())
            };

            {
                let mut left_guard = self.bpm.fetch_page_write(left_id)?;
                let mut left = LeafPage::<_, K, V>::new(left_guard.as_mut_slice());
                let mut size = left.size();
                for (k, v) in &leaf_entries {
                    left.set_at(size, k, v);
                    size += 1;
                }
                left.set_size(size);
                left.set_next_page_id(leaf_next);
            }

            {
                let mut parent = InternalPage::<_, K>::new(parent_guard.as_mut_slice());
                parent.remove_at(index);
            }
            self.bpm.delete_page(leaf_id)?;
            log::debug!("{}: merged leaf {} into {}", self.name, leaf_id, left_id);
        }

        self.finish_parent_rebalance(parent_guard)
    }

    /// After a merge removed a separator, decide what happens to the
    /// parent: collapse it if it is a root left with one child, recurse if
    /// it underflowed, otherwise nothing.
    fn finish_parent_rebalance(&mut self, parent_guard: PageWriteGuard<'_>) -> Result<()> {
        let parent_id = parent_guard.page_id();
        let header = NodeHeader::from_bytes(parent_guard.as_slice());
        let size = header.size as usize;

        if header.is_root {
            if size == 1 {
                let only_child = {
                    let parent = InternalPage::<_, K>::new(parent_guard.as_slice());
                    parent.child_at(0)
                };
                drop(parent_guard);

                {
                    let mut child_guard = self.bpm.fetch_page_write(only_child)?;
                    let mut child_header = NodeHeader::from_bytes(child_guard.as_slice());
                    child_header.is_root = true;
                    child_header.parent_page_id = PageId::INVALID;
                    child_header.write_to(child_guard.as_mut_slice());
                }

                self.set_root_page_id(only_child)?;
                self.bpm.delete_page(parent_id)?;
                log::debug!("{}: root collapsed to {}", self.name, only_child);
            }
            return Ok(());
        }

        let min_size = header.min_size() as usize;
        let grandparent_id = header.parent_page_id;
        drop(parent_guard);

        if size < min_size {
            self.rebalance_internal(parent_id, grandparent_id)?;
        }
        Ok(())
    }

    /// Fix an underflowing internal node. Borrowing rotates a child through
    /// the parent separator; merging pulls the separator down between the
    /// two halves.
    fn rebalance_internal(&mut self, node_id: PageId, parent_id: PageId) -> Result<()> {
        let bpm = Arc::clone(&self.bpm);
        let mut parent_guard = bpm.fetch_page_write(parent_id)?;

        let (index, parent_size) = {
            let parent = InternalPage::<_, K>::new(parent_guard.as_slice());
            let index = parent
                .child_index_of(node_id)
                .ok_or(Error::TreeCorrupted("node missing from its parent"))?;
            (index, parent.size())
        };

        // Borrow from the right sibling: its first child swings over, the
        // separator comes down, its next key goes up.
        if index + 1 < parent_size {
            let right_id = {
                let parent = InternalPage::<_, K>::new(parent_guard.as_slice());
                parent.child_at(index + 1)
            };
            let mut right_guard = self.bpm.fetch_page_write(right_id)?;

            let can_lend = {
                let right = InternalPage::<_, K>::new(right_guard.as_slice());
                right.size() > right.header().min_size() as usize
            };
            if can_lend {
                let separator = {
                    let parent = InternalPage::<_, K>::new(parent_guard.as_slice());
                    parent.key_at(index + 1)
                };
                let (moved_child, lifted_key) = {
                    let right = InternalPage::<_, K>::new(right_guard.as_slice());
                    (right.child_at(0), right.key_at(1))
                };
                {
                    let mut right = InternalPage::<_, K>::new(right_guard.as_mut_slice());
                    right.remove_at(0);
                }
                {
                    let mut node_guard = self.bpm.fetch_page_write(node_id)?;
                    let mut node = InternalPage::<_, K>::new(node_guard.as_mut_slice());
                    let size = node.size();
                    node.set_key_at(size, &separator);
                    node.set_child_at(size, moved_child);
                    node.set_size(size + 1);
                }
                {
                    let mut parent = InternalPage::<_, K>::new(parent_guard.as_mut_slice());
                    parent.set_key_at(index + 1, &lifted_key);
                }
                self.reparent(moved_child, node_id)?;
                return Ok(());
            }
        }

        // Borrow from the left sibling: its last child swings over under
        // the separator, its last key goes up.
        if index > 0 {
            let left_id = {
                let parent = InternalPage::<_, K>::new(parent_guard.as_slice());
                parent.child_at(index - 1)
            };
            let mut left_guard = self.bpm.fetch_page_write(left_id)?;

            let can_lend = {
                let left = InternalPage::<_, K>::new(left_guard.as_slice());
                left.size() > left.header().min_size() as usize
            };
            if can_lend {
                let separator = {
                    let parent = InternalPage::<_, K>::new(parent_guard.as_slice());
                    parent.key_at(index)
                };
                let (moved_child, lifted_key) = {
                    let mut left = InternalPage::<_, K>::new(left_guard.as_mut_slice());
                    let last = left.size() - 1;
                    let entry = (left.child_at(last), left.key_at(last));
                    left.remove_at(last);
                    entry
                };
                {
                    let mut node_guard = self.bpm.fetch_page_write(node_id)?;
                    let mut node = InternalPage::<_, K>::new(node_guard.as_mut_slice());
                    node.insert_first(&separator, moved_child);
                }
                {
                    let mut parent = InternalPage::<_, K>::new(parent_guard.as_mut_slice());
                    parent.set_key_at(index, &lifted_key);
                }
                self.reparent(moved_child, node_id)?;
                return Ok(());
            }
        }

        // Merge, pulling the separator down between the halves.
        if index + 1 < parent_size {
            let (separator, right_id) = {
                let parent = InternalPage::<_, K>::new(parent_guard.as_slice());
                (parent.key_at(index + 1), parent.child_at(index + 1))
            };

            let right_entries = {
                let right_guard = self.bpm.fetch_page_read(right_id)?;
                InternalPage::<_, K>::new(right_guard.as_slice()).entries()
            };

            {
                let mut node_guard = self.bpm.fetch_page_write(node_id)?;
                let mut node = InternalPage::<_, K>::new(node_guard.as_mut_slice());
                let mut size = node.size();
                node.set_key_at(size, &separator);
                node.set_child_at(size, right_entries[0].1);
                size += 1;
                for (k, c) in &right_entries[1..] {
                    node.set_key_at(size, k);
                    node.set_child_at(size, *c);
                    size += 1;
                }
                node.set_size(size);
            }

            for &(_, child) in &right_entries {
                self.reparent(child, node_id)?;
            }

            {
                let mut parent = InternalPage::<_, K>::new(parent_guard.as_mut_slice());
                parent.remove_at(index + 1);
            }
            self.bpm.delete_page(right_id)?;
            log::debug!("{}: merged internal {} into {}", self.name, right_id, node_id);
        } else {
            let (separator, left_id) = {
                let parent = InternalPage::<_, K>::new(parent_guard.as_slice());
                (parent.key_at(index), parent.child_at(index - 1))
            };

            let node_entries = {
                let node_guard = self.bpm.fetch_page_read(node_id)?;
                InternalPage::<_, K>::new(node_guard.as_slice()).entries()
            };

            {
                let mut left_guard = self.bpm.fetch_page_write(left_id)?;
                let mut left = InternalPage::<_, K>::new(left_guard.as_mut_slice());
                let mut size = left.size();
                left.set_key_at(size, &separator);
                left.set_child_at(size, node_entries[0].1);
                size += 1;
                for (k, c) in &node_entries[1..] {
                    left.set_key_at(size, k);
                    left.set_child_at(size, *c);
                    size += 1;
                }
                left.set_size(size);
            }

            for &(_, child) in &node_entries {
                self.reparent(child, left_id)?;
            }

            {
                let mut parent = InternalPage::<_, K>::new(parent_guard.as_mut_slice());
                parent.remove_at(index);
            }
            self.bpm.delete_page(node_id)?;
            log::debug!("{}: merged internal {} into {}", self.name, node_id, left_id);
        }

        self.finish_parent_rebalance(parent_guard)
    }

    fn reparent(&self, child: PageId, new_parent: PageId) -> Result<()> {
        let mut guard = self.bpm.fetch_page_write(child)?;
        let mut header = NodeHeader::from_bytes(guard.as_slice());
        header.parent_page_id = new_parent;
        header.write_to(guard.as_mut_slice());
        Ok(())
    }

    fn set_root_page_id(&self, root_page_id: PageId) -> Result<()> {
        let mut guard = self.bpm.fetch_page_write(self.header_page_id)?;
        TreeHeader { root_page_id }.write_to(guard.as_mut_slice());
        Ok(())
    }

    // ========================================================================
    // Iteration
    // ========================================================================

    /// Iterate every entry in key order.
    pub fn iter(&self) -> Result<TreeIterator<'_, K, V>> {
        if self.is_empty()? {
            return Ok(TreeIterator::new(&self.bpm, PageId::INVALID, 0));
        }

        // Leftmost descent.
        let mut current = self.get_root_page_id()?;
        loop {
            let guard = self.bpm.fetch_page_read(current)?;
            let header = NodeHeader::from_bytes(guard.as_slice());
            match header.page_type {
                BTreePageType::Leaf => return Ok(TreeIterator::new(&self.bpm, current, 0)),
                BTreePageType::Internal => {
                    current = InternalPage::<_, K>::new(guard.as_slice()).child_at(0);
                }
                BTreePageType::Invalid => {
                    return Err(Error::TreeCorrupted("descent hit an unformatted page"))
                }
            }
        }
    }

    /// Iterate entries with keys not less than `key`, in key order.
    pub fn iter_from(&self, key: &K) -> Result<TreeIterator<'_, K, V>> {
        if self.is_empty()? {
            return Ok(TreeIterator::new(&self.bpm, PageId::INVALID, 0));
        }

        let leaf_id = self.find_leaf(key)?;
        let guard = self.bpm.fetch_page_read(leaf_id)?;
        let leaf = LeafPage::<_, K, V>::new(guard.as_slice());
        let position = leaf.find_position(key, &self.comparator);
        Ok(TreeIterator::new(&self.bpm, leaf_id, position))
    }

    // ========================================================================
    // Debug printers (best effort, not part of the correctness contract)
    // ========================================================================

    /// Render the tree as an indented textual outline.
    pub fn pretty_print(&self) -> Result<String>
    where
        K: fmt::Display,
    {
        if self.is_empty()? {
            return Ok("()".to_string());
        }

        let mut out = String::new();
        self.render_text(self.get_root_page_id()?, 0, &mut out)?;
        Ok(out)
    }

    fn render_text(&self, page_id: PageId, depth: usize, out: &mut String) -> Result<()>
    where
        K: fmt::Display,
    {
        let indent = "    ".repeat(depth);
        let guard = self.bpm.fetch_page_read(page_id)?;
        let header = NodeHeader::from_bytes(guard.as_slice());

        if header.page_type == BTreePageType::Leaf {
            let leaf = LeafPage::<_, K, V>::new(guard.as_slice());
            let keys: Vec<String> = (0..leaf.size()).map(|i| leaf.key_at(i).to_string()).collect();
            let _ = writeln!(out, "{}Leaf[{}] {}", indent, page_id, keys.join(","));
            return Ok(());
        }

        let node = InternalPage::<_, K>::new(guard.as_slice());
        let keys: Vec<String> = (1..node.size()).map(|i| node.key_at(i).to_string()).collect();
        let _ = writeln!(out, "{}Internal[{}] {}", indent, page_id, keys.join(","));

        let children: Vec<PageId> = (0..node.size()).map(|i| node.child_at(i)).collect();
        drop(guard);

        for child in children {
            self.render_text(child, depth + 1, out)?;
        }
        Ok(())
    }

    /// Render the tree as a DOT `digraph` for graphviz.
    pub fn to_dot(&self) -> Result<String>
    where
        K: fmt::Display,
    {
        let mut out = String::new();
        let _ = writeln!(out, "digraph G {{");

        if self.is_empty()? {
            log::warn!("{}: drawing an empty tree", self.name);
        } else {
            self.render_dot(self.get_root_page_id()?, &mut out)?;
        }

        let _ = writeln!(out, "}}");
        Ok(out)
    }

    fn render_dot(&self, page_id: PageId, out: &mut String) -> Result<()>
    where
        K: fmt::Display,
    {
        let guard = self.bpm.fetch_page_read(page_id)?;
        let header = NodeHeader::from_bytes(guard.as_slice());

        if header.page_type == BTreePageType::Leaf {
            let leaf = LeafPage::<_, K, V>::new(guard.as_slice());
            let keys: Vec<String> = (0..leaf.size()).map(|i| leaf.key_at(i).to_string()).collect();
            let _ = writeln!(
                out,
                "  leaf{} [shape=record label=\"P={}|{}\"];",
                page_id.0,
                page_id.0,
                keys.join("|")
            );
            if leaf.next_page_id().is_valid() {
                let _ = writeln!(out, "  leaf{} -> leaf{};", page_id.0, leaf.next_page_id().0);
            }
            return Ok(());
        }

        let node = InternalPage::<_, K>::new(guard.as_slice());
        let keys: Vec<String> = (1..node.size()).map(|i| node.key_at(i).to_string()).collect();
        let _ = writeln!(
            out,
            "  int{} [shape=record label=\"P={}|{}\"];",
            page_id.0,
            page_id.0,
            keys.join("|")
        );

        let children: Vec<PageId> = (0..node.size()).map(|i| node.child_at(i)).collect();
        drop(guard);

        for child in children {
            let child_guard = self.bpm.fetch_page_read(child)?;
            let child_is_leaf =
                NodeHeader::from_bytes(child_guard.as_slice()).page_type == BTreePageType::Leaf;
            drop(child_guard);

            let prefix = if child_is_leaf { "leaf" } else { "int" };
            let _ = writeln!(out, "  int{} -> {}{};", page_id.0, prefix, child.0);
            self.render_dot(child, out)?;
        }
        Ok(())
    }
}
