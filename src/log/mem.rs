use std::collections::VecDeque;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, warn};

use super::{
    frame_record, BlockSummary, LogPage, LogRecord, LogSource, MvccOpKind, MvccOpPayload,
    MvccOpRecord, LOG_PAGE_HDR_LEN,
};
use crate::primitives::concurrency::BoundedQueue;
use crate::types::{BlockId, FileId, LogPageId, Lsa, Mvccid, ReclaimError, Result};
use crate::vacuum::redo::VacuumRedo;

/// Shape of an in-memory log.
#[derive(Clone, Debug)]
pub struct MemLogOptions {
    /// Bytes per log page.
    pub page_size: usize,
    /// Log pages per vacuum block.
    pub pages_per_block: u64,
}

impl Default for MemLogOptions {
    fn default() -> Self {
        Self {
            page_size: 4096,
            pages_per_block: 4,
        }
    }
}

impl MemLogOptions {
    /// Sets the page size.
    pub fn page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size;
        self
    }

    /// Sets the pages per block.
    pub fn pages_per_block(mut self, pages: u64) -> Self {
        self.pages_per_block = pages;
        self
    }
}

#[derive(Clone, Copy)]
struct OpenBlock {
    blockid: BlockId,
    start_lsa: Lsa,
    oldest: Mvccid,
    newest: Mvccid,
}

struct LogInner {
    sealed: Vec<Arc<LogPage>>,
    current: Vec<u8>,
    current_page: LogPageId,
    last_mvcc_op: Option<Lsa>,
    open_block: Option<OpenBlock>,
    undelivered: VecDeque<BlockSummary>,
    queue: Option<Arc<BoundedQueue<BlockSummary>>>,
}

/// Log kept entirely in memory, durable for the life of the value.
///
/// Appending an MVCC operation links it to the previous one and folds its id
/// into the summary of the open block. When the append position enters a
/// new block, the open block is sealed and its summary pushed to the
/// attached queue.
pub struct MemLog {
    opts: MemLogOptions,
    inner: Mutex<LogInner>,
}

impl MemLog {
    /// Empty log positioned at page 0.
    pub fn new(opts: MemLogOptions) -> Result<Self> {
        if opts.page_size < LOG_PAGE_HDR_LEN + 64 || opts.pages_per_block == 0 {
            return Err(ReclaimError::Invalid("log page too small or empty block"));
        }
        Ok(Self {
            inner: Mutex::new(LogInner {
                sealed: Vec::new(),
                current: fresh_page(0),
                current_page: 0,
                last_mvcc_op: None,
                open_block: None,
                undelivered: VecDeque::new(),
                queue: None,
            }),
            opts,
        })
    }

    /// Drops the attached queue along with anything still in it, the way a
    /// crash loses summaries that never reached vacuum data.
    pub fn detach_block_queue(&self) {
        self.inner.lock().queue = None;
    }

    /// Appends an MVCC operation by transaction `mvccid`.
    pub fn append_mvcc_op(
        &self,
        kind: MvccOpKind,
        mvccid: Mvccid,
        file: FileId,
        payload: MvccOpPayload,
    ) -> Result<Lsa> {
        let mut inner = self.inner.lock();
        let op = MvccOpRecord {
            kind,
            mvccid,
            prev_mvcc_op: inner.last_mvcc_op,
            file,
            payload,
        };
        op.validate()?;
        let lsa = self.append(&mut inner, &LogRecord::MvccOp(op))?;
        inner.last_mvcc_op = Some(lsa);
        let blockid = BlockId::of_page(lsa.page, self.opts.pages_per_block);
        inner.open_block = Some(match inner.open_block {
            Some(open) => OpenBlock {
                blockid,
                start_lsa: lsa,
                oldest: open.oldest.min(mvccid),
                newest: open.newest.max(mvccid),
            },
            None => OpenBlock {
                blockid,
                start_lsa: lsa,
                oldest: mvccid,
                newest: mvccid,
            },
        });
        Ok(lsa)
    }

    /// Writes `pages` empty pages, moving the append position forward.
    pub fn append_filler_pages(&self, pages: u64) -> Result<()> {
        let mut inner = self.inner.lock();
        for _ in 0..pages {
            let next = inner.current_page + 1;
            self.move_to_page(&mut inner, next)?;
        }
        Ok(())
    }

    /// Moves the append position to the first page of the next block,
    /// sealing the current one.
    pub fn advance_to_next_block(&self) -> Result<()> {
        let mut inner = self.inner.lock();
        let next = BlockId::of_page(inner.current_page, self.opts.pages_per_block)
            .next()
            .first_log_page(self.opts.pages_per_block);
        self.move_to_page(&mut inner, next)
    }

    /// Summaries sealed while no queue was attached, or refused by a full one.
    pub fn undelivered(&self) -> Vec<BlockSummary> {
        self.inner.lock().undelivered.iter().copied().collect()
    }

    fn append(&self, inner: &mut LogInner, record: &LogRecord) -> Result<Lsa> {
        let framed = frame_record(&record.encode()?);
        if framed.len() + LOG_PAGE_HDR_LEN > self.opts.page_size {
            return Err(ReclaimError::Invalid("log record larger than a log page"));
        }
        if inner.current.len() + framed.len() > self.opts.page_size {
            let next = inner.current_page + 1;
            self.move_to_page(inner, next)?;
        }
        let lsa = Lsa::new(inner.current_page, inner.current.len() as u32);
        inner.current.extend_from_slice(&framed);
        Ok(lsa)
    }

    fn move_to_page(&self, inner: &mut LogInner, page: LogPageId) -> Result<()> {
        while inner.current_page < page {
            let done = std::mem::replace(&mut inner.current, fresh_page(inner.current_page + 1));
            let id = inner.current_page;
            inner.sealed.push(Arc::new(LogPage::new(id, done)?));
            inner.current_page += 1;
        }
        let entered = BlockId::of_page(page, self.opts.pages_per_block);
        if let Some(open) = inner.open_block {
            if open.blockid < entered {
                inner.open_block = None;
                let summary = BlockSummary {
                    blockid: open.blockid,
                    start_lsa: open.start_lsa,
                    oldest_mvccid: open.oldest,
                    newest_mvccid: open.newest,
                };
                debug!(blockid = summary.blockid.0, start_lsa = %summary.start_lsa, "log.block.sealed");
                inner.undelivered.push_back(summary);
                deliver(inner)?;
            }
        }
        Ok(())
    }
}

fn fresh_page(id: LogPageId) -> Vec<u8> {
    id.to_be_bytes().to_vec()
}

fn deliver(inner: &mut LogInner) -> Result<()> {
    let Some(queue) = inner.queue.clone() else {
        return Ok(());
    };
    while let Some(summary) = inner.undelivered.pop_front() {
        if let Err(summary) = queue.push(summary) {
            inner.undelivered.push_front(summary);
            warn!(queue = queue.name(), capacity = queue.capacity(), "log.block_queue.full");
            return Err(ReclaimError::QueueFull(queue.name()));
        }
    }
    Ok(())
}

impl LogSource for MemLog {
    fn pages_per_block(&self) -> u64 {
        self.opts.pages_per_block
    }

    fn fetch_page(&self, page: LogPageId) -> Result<Arc<LogPage>> {
        let inner = self.inner.lock();
        if let Some(sealed) = inner.sealed.get(page as usize) {
            return Ok(Arc::clone(sealed));
        }
        if page == inner.current_page {
            return Ok(Arc::new(LogPage::new(page, inner.current.clone())?));
        }
        Err(ReclaimError::NotFound)
    }

    fn append_lsa(&self) -> Lsa {
        let inner = self.inner.lock();
        Lsa::new(inner.current_page, inner.current.len() as u32)
    }

    fn last_mvcc_op(&self) -> Option<Lsa> {
        self.inner.lock().last_mvcc_op
    }

    fn open_block_oldest(&self) -> Option<Mvccid> {
        self.inner.lock().open_block.map(|open| open.oldest)
    }

    fn attach_block_queue(&self, queue: Arc<BoundedQueue<BlockSummary>>) -> Result<()> {
        let mut inner = self.inner.lock();
        inner.queue = Some(queue);
        deliver(&mut inner)
    }

    fn append_redo(&self, redo: &VacuumRedo) -> Result<Lsa> {
        let mut inner = self.inner.lock();
        self.append(&mut inner, &LogRecord::Vacuum(redo.clone()))
    }

    fn records_from(&self, start: Lsa) -> Result<Vec<(Lsa, LogRecord)>> {
        let (pages, current) = {
            let inner = self.inner.lock();
            let first = (start.page as usize).min(inner.sealed.len());
            (
                inner.sealed[first..].to_vec(),
                LogPage::new(inner.current_page, inner.current.clone())?,
            )
        };
        let mut out = Vec::new();
        for page in pages.iter().map(|p| p.as_ref()).chain(std::iter::once(&current)) {
            if page.id() < start.page {
                continue;
            }
            for (offset, record) in page.records()? {
                let lsa = Lsa::new(page.id(), offset);
                if lsa >= start {
                    out.push((lsa, record));
                }
            }
        }
        Ok(out)
    }
}
