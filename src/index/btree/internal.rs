//! Internal node page view.

use std::cmp::Ordering;
use std::marker::PhantomData;

use crate::common::config::PAGE_SIZE;
use crate::common::PageId;

use super::key::{KeyComparator, Storable};
use super::node::{BTreePageType, NodeHeader};

/// Byte offset of the first slot.
const OFFSET_SLOTS: usize = NodeHeader::SIZE;

/// Typed view of an internal page.
///
/// Layout: [`NodeHeader`], then a dense array of `(key, child_page_id)`
/// slots. Slot 0's key is a sentinel and never compared: a node with `size
/// = n` carries `n` children separated by the `n - 1` keys in slots
/// `1..n`. Children under slot `i` hold keys in `[key(i), key(i + 1))`.
pub struct InternalPage<B, K> {
    buf: B,
    _marker: PhantomData<K>,
}

impl<B, K> InternalPage<B, K>
where
    B: AsRef<[u8]>,
    K: Storable,
{
    pub fn new(buf: B) -> Self {
        Self {
            buf,
            _marker: PhantomData,
        }
    }

    /// Most slots any internal node of this key shape can hold.
    pub fn slot_capacity() -> usize {
        (PAGE_SIZE - OFFSET_SLOTS) / (K::SIZE + PageId::SIZE)
    }

    pub fn header(&self) -> NodeHeader {
        NodeHeader::from_bytes(self.buf.as_ref())
    }

    pub fn size(&self) -> usize {
        self.header().size as usize
    }

    pub fn max_size(&self) -> usize {
        self.header().max_size as usize
    }

    pub fn key_at(&self, index: usize) -> K {
        K::read_from(&self.buf.as_ref()[Self::slot_offset(index)..])
    }

    pub fn child_at(&self, index: usize) -> PageId {
        PageId::read_from(&self.buf.as_ref()[Self::slot_offset(index) + K::SIZE..])
    }

    /// Index of the child to descend into for `key`.
    ///
    /// Returns the largest `i` with `key_at(i) <= key` over slots `[1,
    /// size)`, or 0 when `key` sorts before every separator (binary
    /// search; slot 0 has no key of its own).
    pub fn find_child_index<C: KeyComparator<K>>(&self, key: &K, comparator: &C) -> usize {
        let size = self.size();
        let mut lo = 1;
        let mut hi = size;
        // Invariant: separators in [1, lo) are <= key, those in [hi, size)
        // are > key.
        while lo < hi {
            let mid = (lo + hi) / 2;
            if comparator.compare(&self.key_at(mid), key) == Ordering::Greater {
                hi = mid;
            } else {
                lo = mid + 1;
            }
        }
        lo - 1
    }

    /// First separator slot in `[1, size)` whose key is not less than
    /// `key`, or `size` when every separator is smaller.
    pub fn find_insert_position<C: KeyComparator<K>>(&self, key: &K, comparator: &C) -> usize {
        let size = self.size();
        let mut lo = 1;
        let mut hi = size;
        while lo < hi {
            let mid = (lo + hi) / 2;
            if comparator.compare(&self.key_at(mid), key) == Ordering::Less {
                lo = mid + 1;
            } else {
                hi = mid;
            }
        }
        lo
    }

    /// Slot whose child pointer is `child`, if present.
    pub fn child_index_of(&self, child: PageId) -> Option<usize> {
        (0..self.size()).find(|&i| self.child_at(i) == child)
    }

    /// Copy every slot out, used when a split redistributes entries.
    pub fn entries(&self) -> Vec<(K, PageId)> {
        (0..self.size()).map(|i| (self.key_at(i), self.child_at(i))).collect()
    }

    fn slot_offset(index: usize) -> usize {
        OFFSET_SLOTS + index * (K::SIZE + PageId::SIZE)
    }
}

impl<B, K> InternalPage<B, K>
where
    B: AsRef<[u8]> + AsMut<[u8]>,
    K: Storable,
{
    /// Format the page as an empty, non-root internal node.
    ///
    /// # Panics
    /// Panics if `max_size` slots cannot fit in a page.
    pub fn init(&mut self, page_id: PageId, max_size: u32) {
        assert!(
            max_size as usize <= Self::slot_capacity(),
            "internal max_size {} exceeds page capacity {}",
            max_size,
            Self::slot_capacity()
        );
        NodeHeader::new(BTreePageType::Internal, page_id, max_size).write_to(self.buf.as_mut());
    }

    pub fn set_size(&mut self, size: usize) {
        self.update_header(|h| h.size = size as u32);
    }

    pub fn set_is_root(&mut self, is_root: bool) {
        self.update_header(|h| h.is_root = is_root);
    }

    pub fn set_parent_page_id(&mut self, parent: PageId) {
        self.update_header(|h| h.parent_page_id = parent);
    }

    pub fn set_key_at(&mut self, index: usize, key: &K) {
        key.write_to(&mut self.buf.as_mut()[Self::slot_offset(index)..]);
    }

    pub fn set_child_at(&mut self, index: usize, child: PageId) {
        child.write_to(&mut self.buf.as_mut()[Self::slot_offset(index) + K::SIZE..]);
    }

    /// Lay out a fresh root over a just-split pair of children.
    pub fn populate_new_root(&mut self, left: PageId, middle_key: &K, right: PageId) {
        self.set_child_at(0, left);
        self.set_key_at(1, middle_key);
        self.set_child_at(1, right);
        self.set_size(2);
    }

    /// Shift slots `[position, size)` right by one and place the new
    /// separator and child there.
    pub fn insert_at(&mut self, position: usize, key: &K, child: PageId) {
        let size = self.size();
        debug_assert!((1..=size).contains(&position));

        let slot = K::SIZE + PageId::SIZE;
        let data = self.buf.as_mut();
        data.copy_within(
            Self::slot_offset(position)..Self::slot_offset(size),
            Self::slot_offset(position) + slot,
        );

        self.set_key_at(position, key);
        self.set_child_at(position, child);
        self.set_size(size + 1);
    }

    /// Prepend a child, pushing the old first child behind `separator`.
    ///
    /// Used when borrowing from a left sibling: the new slot 0 holds
    /// `child`; the previous slot 0 child moves to slot 1 under
    /// `separator`.
    pub fn insert_first(&mut self, separator: &K, child: PageId) {
        let size = self.size();

        let slot = K::SIZE + PageId::SIZE;
        let data = self.buf.as_mut();
        data.copy_within(
            Self::slot_offset(0)..Self::slot_offset(size),
            Self::slot_offset(0) + slot,
        );

        self.set_child_at(0, child);
        self.set_key_at(1, separator);
        self.set_size(size + 1);
    }

    /// Shift slots left over `position` and shrink by one.
    pub fn remove_at(&mut self, position: usize) {
        let size = self.size();
        debug_assert!(position < size);

        let data = self.buf.as_mut();
        data.copy_within(
            Self::slot_offset(position + 1)..Self::slot_offset(size),
            Self::slot_offset(position),
        );

        self.set_size(size - 1);
    }

    fn update_header(&mut self, f: impl FnOnce(&mut NodeHeader)) {
        let mut header = NodeHeader::from_bytes(self.buf.as_ref());
        f(&mut header);
        header.write_to(self.buf.as_mut());
    }
}
