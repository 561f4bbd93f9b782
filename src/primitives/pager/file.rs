use std::collections::{BTreeSet, HashMap};
use std::path::Path;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, info};

use super::frame::Frame;
use super::meta::{init_meta, META_PAGE};
use super::{format_page, PageStore, PageStoreOptions, PinnedPage};
use crate::primitives::io::{FileIo, StdFileIo};
use crate::types::checksum::{seal_page, verify_page};
use crate::types::{
    page::{PageHeader, PageKind, PAGE_HDR_LEN},
    PageId, ReclaimError, Result,
};

/// Page store persisted in a single file, page `n` at offset `n * page_size`.
pub struct FilePageStore {
    io: Arc<dyn FileIo>,
    page_size: usize,
    max_pages: Option<u64>,
    inner: Mutex<FileInner>,
}

struct FileInner {
    frames: HashMap<PageId, Arc<Frame>>,
    next_page: u64,
    free: BTreeSet<PageId>,
}

impl FilePageStore {
    /// Creates a new store at `path`, truncating nothing if the file exists
    /// but refusing to reuse a non-empty file.
    pub fn create(path: impl AsRef<Path>, opts: PageStoreOptions) -> Result<Self> {
        let io = StdFileIo::open(path.as_ref())?;
        if !io.is_empty()? {
            return Err(ReclaimError::Invalid("page store file already exists"));
        }
        let store = Self::with_io(Arc::new(io), opts, 1)?;
        {
            let mut inner = store.inner.lock();
            let mut image = vec![0u8; store.page_size].into_boxed_slice();
            init_meta(&mut image)?;
            let meta = Arc::new(Frame::new(META_PAGE, image));
            meta.mark_dirty();
            inner.frames.insert(META_PAGE, meta);
        }
        store.flush()?;
        info!(path = %path.as_ref().display(), page_size = store.page_size, "pager.file.create");
        Ok(store)
    }

    /// Opens an existing store read-write.
    pub fn open(path: impl AsRef<Path>, opts: PageStoreOptions) -> Result<Self> {
        Self::open_with_io(Arc::new(StdFileIo::open(path)?), opts)
    }

    /// Opens an existing store for inspection only.
    pub fn open_read_only(path: impl AsRef<Path>, opts: PageStoreOptions) -> Result<Self> {
        Self::open_with_io(Arc::new(StdFileIo::open_read_only(path)?), opts)
    }

    /// Opens a store over an arbitrary [`FileIo`].
    pub fn open_with_io(io: Arc<dyn FileIo>, opts: PageStoreOptions) -> Result<Self> {
        let len = io.len()?;
        let page_size = opts.page_size as u64;
        if len == 0 || len % page_size != 0 {
            return Err(ReclaimError::Corruption("page store length not page aligned"));
        }
        let pages = len / page_size;
        let store = Self::with_io(io, opts, pages)?;
        let mut free = BTreeSet::new();
        let mut image = vec![0u8; store.page_size];
        for n in 0..pages {
            store.io.read_at(n * page_size, &mut image)?;
            verify_page(&image)?;
            let header = PageHeader::decode(&image)?;
            if header.page_size as usize != store.page_size {
                return Err(ReclaimError::Corruption("page size mismatch"));
            }
            if header.kind == PageKind::Free {
                free.insert(PageId(n));
            }
        }
        debug!(pages, free = free.len(), "pager.file.open");
        store.inner.lock().free = free;
        Ok(store)
    }

    fn with_io(io: Arc<dyn FileIo>, opts: PageStoreOptions, next_page: u64) -> Result<Self> {
        let page_size = opts.page_size as usize;
        if page_size < PAGE_HDR_LEN * 2 {
            return Err(ReclaimError::Invalid("page size too small"));
        }
        Ok(Self {
            io,
            page_size,
            max_pages: opts.max_pages,
            inner: Mutex::new(FileInner {
                frames: HashMap::new(),
                next_page,
                free: BTreeSet::new(),
            }),
        })
    }

    fn load(&self, inner: &mut FileInner, id: PageId) -> Result<Arc<Frame>> {
        if let Some(frame) = inner.frames.get(&id) {
            return Ok(Arc::clone(frame));
        }
        if id.0 >= inner.next_page {
            return Err(ReclaimError::NotFound);
        }
        let mut image = vec![0u8; self.page_size].into_boxed_slice();
        self.io
            .read_at(id.0 * self.page_size as u64, &mut image)?;
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

impl PageStore for FilePageStore {
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
        let (frames, next_page) = {
            let inner = self.inner.lock();
            (
                inner.frames.values().cloned().collect::<Vec<_>>(),
                inner.next_page,
            )
        };
        let page_size = self.page_size as u64;
        if self.io.len()? < next_page * page_size {
            self.io.truncate(next_page * page_size)?;
        }
        let mut written = 0usize;
        for frame in frames {
            if !frame.take_dirty() {
                continue;
            }
            let mut image = frame.snapshot();
            seal_page(&mut image)?;
            self.io.write_at(frame.id.0 * page_size, &image)?;
            written += 1;
        }
        self.io.sync_all()?;
        debug!(written, next_page, "pager.file.flush");
        Ok(())
    }

    fn used_pages(&self) -> u64 {
        let inner = self.inner.lock();
        inner.next_page - 1 - inner.free.len() as u64
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn opts() -> PageStoreOptions {
        PageStoreOptions::default().page_size(512)
    }

    #[test]
    fn pages_survive_reopen() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("vacuum.data");
        let id = {
            let store = FilePageStore::create(&path, opts()).unwrap();
            let page = store.allocate_page(PageKind::VacuumData).unwrap();
            page.write()[300] = 0x5A;
            store.flush().unwrap();
            page.id()
        };
        let store = FilePageStore::open(&path, opts()).unwrap();
        assert_eq!(store.read(id).unwrap()[300], 0x5A);
        assert_eq!(store.used_pages(), 1);
    }

    #[test]
    fn create_refuses_existing_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("dropped.files");
        FilePageStore::create(&path, opts()).unwrap();
        assert!(matches!(
            FilePageStore::create(&path, opts()),
            Err(ReclaimError::Invalid(_))
        ));
    }

    #[test]
    fn torn_page_is_reported() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("torn.data");
        {
            let store = FilePageStore::create(&path, opts()).unwrap();
            store.allocate_page(PageKind::VacuumData).unwrap();
            store.flush().unwrap();
        }
        let io = StdFileIo::open(&path).unwrap();
        io.write_at(512 + 400, &[0xFF]).unwrap();
        assert!(matches!(
            FilePageStore::open(&path, opts()),
            Err(ReclaimError::Corruption(_))
        ));
    }

    #[test]
    fn free_pages_are_found_on_open() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("free.data");
        {
            let store = FilePageStore::create(&path, opts()).unwrap();
            let a = store.allocate_page(PageKind::VacuumData).unwrap();
            store.allocate_page(PageKind::VacuumData).unwrap();
            store.free_page(a.id()).unwrap();
            store.flush().unwrap();
        }
        let store = FilePageStore::open(&path, opts()).unwrap();
        assert_eq!(store.used_pages(), 1);
        assert_eq!(
            store.allocate_page(PageKind::VacuumData).unwrap().id(),
            PageId(1)
        );
    }
}
