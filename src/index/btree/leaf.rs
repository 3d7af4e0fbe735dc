//! Leaf node page view.

use std::cmp::Ordering;
use std::marker::PhantomData;

use crate::common::config::PAGE_SIZE;
use crate::common::PageId;

use super::key::{KeyComparator, Storable};
use super::node::{BTreePageType, NodeHeader};

/// Byte offset of the sibling pointer.
const OFFSET_NEXT: usize = NodeHeader::SIZE;
/// Byte offset of the first slot.
const OFFSET_SLOTS: usize = OFFSET_NEXT + 4;

/// Typed view of a leaf page.
///
/// Layout: [`NodeHeader`], then the `next_page_id` sibling pointer, then a
/// dense array of `(key, value)` slots sorted by key. The view is generic
/// over its buffer so the same code serves read guards (`&[u8]`) and write
/// guards (`&mut [u8]`).
pub struct LeafPage<B, K, V> {
    buf: B,
    _marker: PhantomData<(K, V)>,
}

impl<B, K, V> LeafPage<B, K, V>
where
    B: AsRef<[u8]>,
    K: Storable,
    V: Storable,
{
    pub fn new(buf: B) -> Self {
        Self {
            buf,
            _marker: PhantomData,
        }
    }

    /// Most slots any leaf of this key/value shape can hold.
    pub fn slot_capacity() -> usize {
        (PAGE_SIZE - OFFSET_SLOTS) / (K::SIZE + V::SIZE)
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

    pub fn next_page_id(&self) -> PageId {
        let data = self.buf.as_ref();
        PageId::from_le_bytes([
            data[OFFSET_NEXT],
            data[OFFSET_NEXT + 1],
            data[OFFSET_NEXT + 2],
            data[OFFSET_NEXT + 3],
        ])
    }

    pub fn key_at(&self, index: usize) -> K {
        K::read_from(&self.buf.as_ref()[Self::slot_offset(index)..])
    }

    pub fn value_at(&self, index: usize) -> V {
        V::read_from(&self.buf.as_ref()[Self::slot_offset(index) + K::SIZE..])
    }

    /// First index whose key is not less than `key` (binary search).
    pub fn find_position<C: KeyComparator<K>>(&self, key: &K, comparator: &C) -> usize {
        let mut lo = 0;
        let mut hi = self.size();
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

    /// Whether `key` is present, given its `find_position` result.
    pub fn key_matches<C: KeyComparator<K>>(&self, position: usize, key: &K, comparator: &C) -> bool {
        position < self.size()
            && comparator.compare(&self.key_at(position), key) == Ordering::Equal
    }

    /// Copy every slot out, used when a split redistributes entries.
    pub fn entries(&self) -> Vec<(K, V)> {
        (0..self.size()).map(|i| (self.key_at(i), self.value_at(i))).collect()
    }

    fn slot_offset(index: usize) -> usize {
        OFFSET_SLOTS + index * (K::SIZE + V::SIZE)
    }
}

impl<B, K, V> LeafPage<B, K, V>
where
    B: AsRef<[u8]> + AsMut<[u8]>,
    K: Storable,
    V: Storable,
{
    /// Format the page as an empty, non-root leaf.
    ///
    /// # Panics
    /// Panics if `max_size` slots cannot fit in a page.
    pub fn init(&mut self, page_id: PageId, max_size: u32) {
        assert!(
            max_size as usize <= Self::slot_capacity(),
            "leaf max_size {} exceeds page capacity {}",
            max_size,
            Self::slot_capacity()
        );
        NodeHeader::new(BTreePageType::Leaf, page_id, max_size).write_to(self.buf.as_mut());
        self.set_next_page_id(PageId::INVALID);
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

    pub fn set_next_page_id(&mut self, next: PageId) {
        self.buf.as_mut()[OFFSET_NEXT..OFFSET_NEXT + 4].copy_from_slice(&next.to_le_bytes());
    }

    pub fn set_at(&mut self, index: usize, key: &K, value: &V) {
        let offset = Self::slot_offset(index);
        let data = self.buf.as_mut();
        key.write_to(&mut data[offset..]);
        value.write_to(&mut data[offset + K::SIZE..]);
    }

    /// Shift slots `[position, size)` right by one and place the new entry.
    pub fn insert(&mut self, position: usize, key: &K, value: &V) {
        let size = self.size();
        debug_assert!(position <= size);

        let slot = K::SIZE + V::SIZE;
        let data = self.buf.as_mut();
        data.copy_within(
            Self::slot_offset(position)..Self::slot_offset(size),
            Self::slot_offset(position) + slot,
        );

        self.set_at(position, key, value);
        self.set_size(size + 1);
    }

    /// Shift slots left over `position` and shrink by one.
    pub fn remove(&mut self, position: usize) {
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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::btree::key::{GenericKey, Int64Comparator, RecordId};

    type TestLeaf<B> = LeafPage<B, GenericKey<8>, RecordId>;

    fn key(v: i64) -> GenericKey<8> {
        GenericKey::from_i64(v)
    }

    fn rid(v: u32) -> RecordId {
        RecordId::new(PageId::new(v), v)
    }

    #[test]
    fn test_leaf_init() {
        let mut buf = vec![0u8; PAGE_SIZE];
        let mut leaf = TestLeaf::new(buf.as_mut_slice());
        leaf.init(PageId::new(3), 16);

        let header = leaf.header();
        assert_eq!(header.page_type, BTreePageType::Leaf);
        assert_eq!(header.page_id, PageId::new(3));
        assert_eq!(header.size, 0);
        assert!(!header.is_root);
        assert_eq!(leaf.next_page_id(), PageId::INVALID);
    }

    #[test]
    fn test_leaf_insert_keeps_order() {
        let mut buf = vec![0u8; PAGE_SIZE];
        let mut leaf = TestLeaf::new(buf.as_mut_slice());
        leaf.init(PageId::new(0), 16);

        let cmp = Int64Comparator;
        for v in [30, 10, 20, 5] {
            let k = key(v);
            let pos = leaf.find_position(&k, &cmp);
            leaf.insert(pos, &k, &rid(v as u32));
        }

        assert_eq!(leaf.size(), 4);
        let keys: Vec<i64> = (0..4).map(|i| leaf.key_at(i).as_i64()).collect();
        assert_eq!(keys, vec![5, 10, 20, 30]);
        assert_eq!(leaf.value_at(1), rid(10));
    }

    #[test]
    fn test_leaf_find_position_and_match() {
        let mut buf = vec![0u8; PAGE_SIZE];
        let mut leaf = TestLeaf::new(buf.as_mut_slice());
        leaf.init(PageId::new(0), 16);

        let cmp = Int64Comparator;
        for (i, v) in [10, 20, 30].iter().enumerate() {
            leaf.set_at(i, &key(*v), &rid(*v as u32));
        }
        leaf.set_size(3);

        assert_eq!(leaf.find_position(&key(5), &cmp), 0);
        assert_eq!(leaf.find_position(&key(20), &cmp), 1);
        assert_eq!(leaf.find_position(&key(25), &cmp), 2);
        assert_eq!(leaf.find_position(&key(99), &cmp), 3);

        assert!(leaf.key_matches(1, &key(20), &cmp));
        assert!(!leaf.key_matches(2, &key(25), &cmp));
        assert!(!leaf.key_matches(3, &key(99), &cmp));
    }

    #[test]
    fn test_leaf_remove_shifts_left() {
        let mut buf = vec![0u8; PAGE_SIZE];
        let mut leaf = TestLeaf::new(buf.as_mut_slice());
        leaf.init(PageId::new(0), 16);

        for (i, v) in [10, 20, 30].iter().enumerate() {
            leaf.set_at(i, &key(*v), &rid(*v as u32));
        }
        leaf.set_size(3);

        leaf.remove(1);
        assert_eq!(leaf.size(), 2);
        assert_eq!(leaf.key_at(0).as_i64(), 10);
        assert_eq!(leaf.key_at(1).as_i64(), 30);
    }

    #[test]
    fn test_leaf_sibling_pointer() {
        let mut buf = vec![0u8; PAGE_SIZE];
        let mut leaf = TestLeaf::new(buf.as_mut_slice());
        leaf.init(PageId::new(0), 16);

        leaf.set_next_page_id(PageId::new(42));
        assert_eq!(leaf.next_page_id(), PageId::new(42));
    }

    #[test]
    #[should_panic(expected = "exceeds page capacity")]
    fn test_leaf_oversized_max_size_panics() {
        let mut buf = vec![0u8; PAGE_SIZE];
        let mut leaf = TestLeaf::new(buf.as_mut_slice());
        leaf.init(PageId::new(0), u32::MAX);
    }

    #[test]
    fn test_leaf_read_view_over_shared_slice() {
        let mut buf = vec![0u8; PAGE_SIZE];
        {
            let mut leaf = TestLeaf::new(buf.as_mut_slice());
            leaf.init(PageId::new(0), 16);
            leaf.set_at(0, &key(7), &rid(7));
            leaf.set_size(1);
        }

        // Same accessors work over an immutable borrow.
        let leaf = TestLeaf::new(buf.as_slice());
        assert_eq!(leaf.size(), 1);
        assert_eq!(leaf.key_at(0).as_i64(), 7);
    }
}
