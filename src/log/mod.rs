#![forbid(unsafe_code)]

//! Narrow view of the write-ahead log that vacuum consumes.
//!
//! Vacuum never writes user records. It reads MVCC operation records back
//! through [`LogSource::fetch_page`], receives [`BlockSummary`] values
//! through a bounded queue once the log seals a block, and appends its own
//! redo records before changing its durable files.

mod iter;
mod mem;
mod record;

use std::sync::Arc;

use serde::Serialize;

use crate::primitives::concurrency::BoundedQueue;
use crate::types::{read_u32, read_u64, BlockId, LogPageId, Lsa, Mvccid, ReclaimError, Result};
use crate::vacuum::redo::VacuumRedo;

pub use iter::MvccOpIter;
pub use mem::{MemLog, MemLogOptions};
pub use record::{LogRecord, MvccOpKind, MvccOpPayload, MvccOpRecord};

/// Bytes at the start of every log page holding its page number.
pub const LOG_PAGE_HDR_LEN: usize = 8;
/// Length prefix of every framed record.
const FRAME_LEN: usize = 4;

/// Summary of one sealed block, produced by the log for vacuum.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize)]
pub struct BlockSummary {
    /// Block the summary describes.
    pub blockid: BlockId,
    /// Position of the last MVCC operation logged in the block.
    pub start_lsa: Lsa,
    /// Oldest id acting in the block.
    pub oldest_mvccid: Mvccid,
    /// Newest id acting in the block.
    pub newest_mvccid: Mvccid,
}

/// Log services vacuum relies on.
pub trait LogSource: Send + Sync + 'static {
    /// Log pages covered by one block.
    fn pages_per_block(&self) -> u64;

    /// Reads one log page.
    fn fetch_page(&self, page: LogPageId) -> Result<Arc<LogPage>>;

    /// Hints that `count` pages from `first` are about to be read.
    fn prefetch(&self, _first: LogPageId, _count: u64) {}

    /// Position the next record will be written at.
    fn append_lsa(&self) -> Lsa;

    /// Position of the last MVCC operation ever logged.
    fn last_mvcc_op(&self) -> Option<Lsa>;

    /// Oldest id acting in the block that has not been sealed yet.
    fn open_block_oldest(&self) -> Option<Mvccid>;

    /// Routes summaries of sealed blocks into `queue`. Summaries sealed
    /// while no queue was attached are delivered first.
    fn attach_block_queue(&self, queue: Arc<BoundedQueue<BlockSummary>>) -> Result<()>;

    /// Appends a vacuum redo record and returns its position.
    fn append_redo(&self, redo: &VacuumRedo) -> Result<Lsa>;

    /// Every record from `start` to the end of the log, in log order.
    fn records_from(&self, start: Lsa) -> Result<Vec<(Lsa, LogRecord)>>;

    /// Block holding the append position.
    fn append_block(&self) -> BlockId {
        BlockId::of_page(self.append_lsa().page, self.pages_per_block())
    }
}

/// Immutable image of one log page.
#[derive(Clone, Debug)]
pub struct LogPage {
    id: LogPageId,
    data: Vec<u8>,
}

impl LogPage {
    pub(crate) fn new(id: LogPageId, data: Vec<u8>) -> Result<Self> {
        if data.len() < LOG_PAGE_HDR_LEN || read_u64(&data, 0) != id {
            return Err(ReclaimError::Corruption("log page header mismatch"));
        }
        Ok(Self { id, data })
    }

    /// Page number.
    pub fn id(&self) -> LogPageId {
        self.id
    }

    fn frame_at(&self, offset: u32) -> Result<Option<&[u8]>> {
        let start = offset as usize;
        if start + FRAME_LEN > self.data.len() {
            return Ok(None);
        }
        let len = read_u32(&self.data, start) as usize;
        if len == 0 {
            return Ok(None);
        }
        let body = start + FRAME_LEN;
        if body + len > self.data.len() {
            return Err(ReclaimError::Corruption("log record overruns page"));
        }
        Ok(Some(&self.data[body..body + len]))
    }

    /// Decodes the record at `offset`.
    pub fn record_at(&self, offset: u32) -> Result<LogRecord> {
        match self.frame_at(offset)? {
            Some(body) => LogRecord::decode(body),
            None => Err(ReclaimError::Corruption("no log record at offset")),
        }
    }

    /// Decodes the MVCC operation at `offset`.
    pub fn mvcc_op_at(&self, offset: u32) -> Result<MvccOpRecord> {
        match self.record_at(offset)? {
            LogRecord::MvccOp(op) => Ok(op),
            LogRecord::Vacuum(_) => Err(ReclaimError::Corruption(
                "previous mvcc op link points at a vacuum record",
            )),
        }
    }

    /// Every record of the page with its offset.
    pub fn records(&self) -> Result<Vec<(u32, LogRecord)>> {
        let mut out = Vec::new();
        let mut offset = LOG_PAGE_HDR_LEN as u32;
        while let Some(body) = self.frame_at(offset)? {
            out.push((offset, LogRecord::decode(body)?));
            offset += (FRAME_LEN + body.len()) as u32;
        }
        Ok(out)
    }
}

pub(crate) fn frame_record(body: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(FRAME_LEN + body.len());
    out.extend_from_slice(&(body.len() as u32).to_be_bytes());
    out.extend_from_slice(body);
    out
}
