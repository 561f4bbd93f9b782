#![forbid(unsafe_code)]

//! Page stores backing the durable vacuum structures.
//!
//! A store is one file: page 0 is a descriptor holding the first page of the
//! chain kept in the file, every other page is a chain page or a free page.
//! Pages are pinned through [`PinnedPage`] handles and latched per access.

mod file;
mod frame;
mod mem;
mod meta;

use std::ops::{Deref, DerefMut};
use std::sync::Arc;

use parking_lot::{
    lock_api::{ArcRwLockReadGuard, ArcRwLockWriteGuard},
    RawRwLock,
};

use crate::types::{page::PageKind, Lsa, PageId, Result};

pub use file::FilePageStore;
pub use mem::MemPageStore;
pub use meta::{read_first_page, write_first_page, META_PAGE};

use frame::Frame;

/// Options shared by the page store implementations.
#[derive(Clone, Debug)]
pub struct PageStoreOptions {
    /// Size of each page in bytes.
    pub page_size: u32,
    /// Upper bound on pages in the file, descriptor included. `None` is unbounded.
    pub max_pages: Option<u64>,
}

impl Default for PageStoreOptions {
    fn default() -> Self {
        Self {
            page_size: crate::types::page::DEFAULT_PAGE_SIZE,
            max_pages: None,
        }
    }
}

impl PageStoreOptions {
    /// Sets the page size.
    pub fn page_size(mut self, page_size: u32) -> Self {
        self.page_size = page_size;
        self
    }

    /// Caps the number of pages the store may hold.
    pub fn max_pages(mut self, max_pages: Option<u64>) -> Self {
        self.max_pages = max_pages;
        self
    }
}

/// Page manager interface used by vacuum bookkeeping.
pub trait PageStore: Send + Sync + 'static {
    /// Size of every page in bytes.
    fn page_size(&self) -> usize;

    /// Fetches a page and keeps it resident while the handle lives.
    fn pin(&self, id: PageId) -> Result<PinnedPage>;

    /// Allocates and formats a page of `kind`.
    ///
    /// Fails with `OutOfSpace` once the configured page limit is reached.
    fn allocate_page(&self, kind: PageKind) -> Result<PinnedPage>;

    /// Returns a page to the free list. Freeing a free page is a no-op.
    fn free_page(&self, id: PageId) -> Result<()>;

    /// Returns page `id`, materializing a zeroed page of `kind` when the
    /// file never saw it. Used while replaying redo after a crash.
    fn ensure_page(&self, id: PageId, kind: PageKind) -> Result<PinnedPage>;

    /// Writes every dirty page to durable storage.
    fn flush(&self) -> Result<()>;

    /// Number of pages currently in use, descriptor excluded.
    fn used_pages(&self) -> u64;

    /// Shared latch on a page.
    fn read(&self, id: PageId) -> Result<PageRead> {
        Ok(self.pin(id)?.read())
    }

    /// Exclusive latch on a page.
    fn write(&self, id: PageId) -> Result<PageWrite> {
        Ok(self.pin(id)?.write())
    }
}

/// Keeps a page resident. Latches are taken per access.
#[derive(Clone)]
pub struct PinnedPage {
    frame: Arc<Frame>,
}

impl PinnedPage {
    fn new(frame: Arc<Frame>) -> Self {
        Self { frame }
    }

    /// Identifier of the pinned page.
    pub fn id(&self) -> PageId {
        self.frame.id
    }

    /// Takes the shared latch.
    pub fn read(&self) -> PageRead {
        PageRead {
            id: self.frame.id,
            guard: self.frame.buf.read_arc(),
        }
    }

    /// Takes the exclusive latch and marks the page dirty.
    pub fn write(&self) -> PageWrite {
        let guard = self.frame.buf.write_arc();
        self.frame.mark_dirty();
        PageWrite {
            id: self.frame.id,
            guard,
        }
    }
}

impl std::fmt::Debug for PinnedPage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PinnedPage").field("id", &self.frame.id).finish()
    }
}

/// Shared latch over a page image.
pub struct PageRead {
    /// Page identifier.
    pub id: PageId,
    guard: ArcRwLockReadGuard<RawRwLock, Box<[u8]>>,
}

impl Deref for PageRead {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        &self.guard
    }
}

/// Exclusive latch over a page image.
pub struct PageWrite {
    /// Page identifier.
    pub id: PageId,
    guard: ArcRwLockWriteGuard<RawRwLock, Box<[u8]>>,
}

impl PageWrite {
    /// Position of the last redo record applied to this page.
    pub fn page_lsa(&self) -> Result<Lsa> {
        crate::types::page::page_lsa(&self.guard)
    }

    /// Stamps the page with the redo record that changed it.
    pub fn set_page_lsa(&mut self, lsa: Lsa) -> Result<()> {
        crate::types::page::set_page_lsa(&mut self.guard, lsa)
    }
}

impl Deref for PageWrite {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        &self.guard
    }
}

impl DerefMut for PageWrite {
    fn deref_mut(&mut self) -> &mut [u8] {
        &mut self.guard
    }
}

/// Writes a fresh header for `kind` and zeroes the body.
pub fn format_page(buf: &mut [u8], id: PageId, kind: PageKind) -> Result<()> {
    buf.fill(0);
    crate::types::page::PageHeader::new(id, kind, buf.len() as u32)?.encode(buf)
}
