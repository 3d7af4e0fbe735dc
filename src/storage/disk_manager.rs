//! Disk manager - low-level file I/O for database pages.

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;

use crate::common::config::PAGE_SIZE;
use crate::common::{Error, PageId, Result};
use crate::storage::page::Page;

/// Byte-addressable page store over a single database file.
///
/// Pages are laid out sequentially: page `n` lives at file offset
/// `n * PAGE_SIZE`. Allocation is monotonic; `deallocate_page` is only a
/// hint and never shrinks the file.
///
/// The disk manager itself is single-threaded. The buffer pool serializes
/// access to it behind a mutex.
pub struct DiskManager {
    file: File,
    /// Number of pages allocated in the file.
    page_count: u32,
}

impl DiskManager {
    /// Create a new database file. Fails if the file already exists.
    pub fn create<P: AsRef<Path>>(path: P) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .open(path)?;

        Ok(Self {
            file,
            page_count: 0,
        })
    }

    /// Open an existing database file.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let file = OpenOptions::new().read(true).write(true).open(&path)?;

        let file_size = file.metadata()?.len();
        let page_count = (file_size / PAGE_SIZE as u64) as u32;

        Ok(Self { file, page_count })
    }

    /// Open an existing database file, or create one if it doesn't exist.
    pub fn open_or_create<P: AsRef<Path>>(path: P) -> Result<Self> {
        if path.as_ref().exists() {
            Self::open(path)
        } else {
            Self::create(path)
        }
    }

    /// Read one page from disk.
    pub fn read_page(&mut self, page_id: PageId) -> Result<Page> {
        log::trace!("read_page {}", page_id);

        self.file.seek(SeekFrom::Start(self.offset_of(page_id)?))?;

        let mut page = Page::new();
        self.file.read_exact(page.as_mut_slice())?;

        Ok(page)
    }

    /// Write one page to disk and fsync.
    ///
    /// The page must have been allocated with [`allocate_page`] first.
    ///
    /// [`allocate_page`]: DiskManager::allocate_page
    pub fn write_page(&mut self, page_id: PageId, page: &Page) -> Result<()> {
        log::trace!("write_page {}", page_id);

        self.file.seek(SeekFrom::Start(self.offset_of(page_id)?))?;
        self.file.write_all(page.as_slice())?;
        self.file.sync_all()?;

        Ok(())
    }

    /// Allocate a new zeroed page at the end of the file.
    ///
    /// Page ids are handed out monotonically; the extension is fsynced so
    /// the allocation itself is durable.
    pub fn allocate_page(&mut self) -> Result<PageId> {
        let page_id = PageId::new(self.page_count);
        self.page_count += 1;

        self.file.seek(SeekFrom::Start(self.offset_of(page_id)?))?;
        self.file.write_all(&[0u8; PAGE_SIZE])?;
        self.file.sync_all()?;

        log::trace!("allocate_page -> {}", page_id);
        Ok(page_id)
    }

    /// Hint that a page is no longer referenced.
    ///
    /// Space reclamation is not implemented; the id stays allocated and the
    /// file keeps its size.
    pub fn deallocate_page(&mut self, page_id: PageId) {
        log::trace!("deallocate_page {} (hint, ignored)", page_id);
    }

    /// Number of pages allocated in the file.
    #[inline]
    pub fn page_count(&self) -> u32 {
        self.page_count
    }

    /// Total size of the database file in bytes.
    #[inline]
    pub fn file_size(&self) -> u64 {
        self.page_count as u64 * PAGE_SIZE as u64
    }

    /// File offset of an allocated page, or [`Error::PageNotFound`] for an
    /// id beyond the end of the file.
    fn offset_of(&self, page_id: PageId) -> Result<u64> {
        if page_id.0 >= self.page_count {
            return Err(Error::PageNotFound(page_id.0));
        }
        Ok(page_id.0 as u64 * PAGE_SIZE as u64)
    }
}
