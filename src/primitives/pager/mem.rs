use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::debug;

use super::frame::Frame;
use super::meta::{init_meta, META_PAGE};
use super::{format_page, PageStore, PageStoreOptions, PinnedPage};
use crate::types::checksum::{seal_page, verify_page};
use crate::types::{
    page::{self, PageKind, PAGE_HDR_LEN},
    PageId, ReclaimError, Result,
};

/// Volatile page store with an explicit "durable" image.
///
/// Writes land in resident frames; [`PageStore::flush`] copies dirty frames
/// into the durable image. [`MemPageStore::crash`] drops everything that was
/// never flushed, which is how tests simulate a server crash.
pub struct MemPageStore {
    page_size: usize,
    max_pages: Option<u64>,
    inner: Mutex<MemInner>,
    durable: Mutex<HashMap<PageId, Box<[u8]>>>,
}

struct MemInner {
    frames: HashMap<PageId, Arc<Frame>>,
    next_page: u64,
    free: BTreeSet<PageId>,
}

impl MemPageStore {
    /// Creates an empty store holding only a descriptor page.
    pub fn new(opts: PageStoreOptions) -> Result<Self> {
        let page_size = opts.page_size as usize;
        if page_size < PAGE_HDR_LEN * 2 {
            return Err(ReclaimError::Invalid("page size too small"));
        }
        let mut image = vec![0u8; page_size].into_boxed_slice();
        init_meta(&mut image)?;
        let meta = Arc::new(Frame::new(META_PAGE, image));
        meta.mark_dirty();
        let mut frames = HashMap::new();
        frames.insert(META_PAGE, meta);
        Ok(Self {
            page_size,
            max_pages: opts.max_pages,
            inner: Mutex::new(MemInner {
                frames,
                next_page: 1,
                free: BTreeSet::new(),
            }),
            durable: Mutex::new(HashMap::new()),
        })
    }

    /// Returns a store that only knows what was flushed to this one.
    pub fn crash(&self) -> Result<MemPageStore> {
        let durable: HashMap<PageId, Box<[u8]>> = self.durable.lock().clone();
        let mut next_page = 1;
        let mut free = BTreeSet::new();
        for (id, image) in &durable {
            next_page = next_page.max(id.0 + 1);
            if *id != META_PAGE && page::page_kind(image)? == PageKind::Free {
                free.insert(*id);
            }
        }
        let mut frames = HashMap::new();
        if !durable.contains_key(&META_PAGE) {
            let mut image = vec![0u8; self.page_size].into_boxed_slice();
            init_meta(&mut image)?;
            let meta = Arc::new(Frame::new(META_PAGE, image));
            meta.mark_dirty();
            frames.insert(META_PAGE, meta);
        }
        debug!(
            durable_pages = durable.len(),
            next_page, "pager.mem.crash"
        );
        Ok(MemPageStore {
            page_size: self.page_size,
            max_pages: self.max_pages,
            inner: Mutex::new(MemInner {
                frames,
                next_page,
                free,
            }),
            durable: Mutex::new(durable),
        })
    }

    fn load(&self, inner: &mut MemInner, id: PageId) -> Result<Arc<Frame>> {
        if let Some(frame) = inner.frames.get(&id) {
            return Ok(Arc::clone(frame));
        }
        let image = self
            .durable
            .lock()
            .get(&id)
            .cloned()
            .ok_or(ReclaimError::NotFound)?;
        verify_page(&image)?;
        let frame = Arc::new(Frame::new(id, image));
        inner.frames.insert(id, Arc::clone(&frame));
        Ok(frame)
    }

    fn fresh_frame(&self, id: PageId, kind: PageKind) -> Result<Arc<Frame>> {
        let mut image = vec![0u8; self.page_size].into_boxed_slice();
        format_page(&mut image, id, kind)?;
        let frame = Arc::new(Frame::new(id, image));
        frame.mark_dirty();
        Ok(frame)
    }
}

impl PageStore for MemPageStore {
    fn page_size(&self) -> usize {
        self.page_size
    }

    fn pin(&self, id: PageId) -> Result<PinnedPage> {
        let mut inner = self.inner.lock();
        Ok(PinnedPage::new(self.load(&mut inner, id)?))
    }

    fn allocate_page(&self, kind: PageKind) -> Result<PinnedPage> {
        let mut inner = self.inner.lock();
        let id = match inner.free.pop_first() {
            Some(id) => id,
            None => {
                if let Some(max) = self.max_pages {
                    if inner.next_page >= max {
                        return Err(ReclaimError::OutOfSpace("page store limit reached"));
                    }
                }
                let id = PageId(inner.next_page);
                inner.next_page += 1;
                id
            }
        };
        let frame = self.fresh_frame(id, kind)?;
        inner.frames.insert(id, Arc::clone(&frame));
        Ok(PinnedPage::new(frame))
    }

    fn free_page(&self, id: PageId) -> Result<()> {
        if id == META_PAGE {
            return Err(ReclaimError::Invalid("cannot free the descriptor page"));
        }
        let mut inner = self.inner.lock();
        if inner.free.contains(&id) {
            return Ok(());
        }
        let frame = self.load(&mut inner, id)?;
        let mut page = PinnedPage::new(frame).write();
        let lsa = page.page_lsa()?;
        format_page(&mut page, id, PageKind::Free)?;
        page.set_page_lsa(lsa)?;
        inner.free.insert(id);
        Ok(())
    }

    fn ensure_page(&self, id: PageId, kind: PageKind) -> Result<PinnedPage> {
        let mut inner = self.inner.lock();
        match self.load(&mut inner, id) {
            Ok(frame) => {
                inner.free.remove(&id);
                Ok(PinnedPage::new(frame))
            }
            Err(ReclaimError::NotFound) => {
                let frame = self.fresh_frame(id, kind)?;
                inner.frames.insert(id, Arc::clone(&frame));
                inner.next_page = inner.next_page.max(id.0 + 1);
                inner.free.remove(&id);
                Ok(PinnedPage::new(frame))
            }
            Err(err) => Err(err),
        }
    }

    fn flush(&self) -> Result<()> {
        let frames: Vec<Arc<Frame>> = self.inner.lock().frames.values().cloned().collect();
        let mut written = 0usize;
        for frame in frames {
            if !frame.take_dirty() {
                continue;
            }
            let mut image = frame.snapshot();
            seal_page(&mut image)?;
            self.durable
                .lock()
                .insert(frame.id, image.into_boxed_slice());
            written += 1;
        }
        debug!(written, "pager.mem.flush");
        Ok(())
    }

    fn used_pages(&self) -> u64 {
        let inner = self.inner.lock();
        inner.next_page - 1 - inner.free.len() as u64
    }
}
