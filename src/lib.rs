//! burrowdb - a disk-backed storage engine core.
//!
//! The crate is the storage half of an educational database: a page cache
//! with eviction, scoped page handles, an on-disk index, and a persistent
//! in-memory map.
//!
//! # Layers
//! ```text
//!  index/btree        B+ tree over guarded pages
//!       |
//!  buffer/            BufferPoolManager + LRU-K replacer + page guards
//!       |
//!  storage/           DiskManager + raw Page
//!
//!  trie/              copy-on-write trie + TrieStore (independent of the
//!                     layers above; no buffer pool involved)
//! ```
//!
//! # Modules
//! - [`common`] - identifiers, constants, and the [`Error`] type
//! - [`storage`] - file-backed page store
//! - [`buffer`] - page caching, pinning, eviction
//! - [`index`] - B+ tree index
//! - [`trie`] - persistent trie and its concurrent store
//!
//! # Quick start
//! ```no_run
//! use std::sync::Arc;
//! use burrowdb::buffer::BufferPoolManager;
//! use burrowdb::storage::DiskManager;
//!
//! let dm = DiskManager::create("my.db").unwrap();
//! let bpm = Arc::new(BufferPoolManager::new(64, 2, dm));
//!
//! let mut guard = bpm.new_page().unwrap();
//! guard.write().as_mut_slice()[0] = 1;
//! ```

pub mod buffer;
pub mod common;
pub mod index;
pub mod storage;
pub mod trie;

pub use common::config::{DEFAULT_REPLACER_K, PAGE_SIZE};
pub use common::{Error, FrameId, PageId, Result};

pub use buffer::{
    BasicPageGuard, BufferPoolManager, BufferPoolStats, Frame, PageReadGuard, PageWriteGuard,
    StatsSnapshot,
};
pub use index::btree::BPlusTree;
pub use storage::{DiskManager, Page};
pub use trie::store::TrieStore;
pub use trie::Trie;
