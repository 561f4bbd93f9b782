//! Durable layout of vacuum data pages.
//!
//! ```text
//! header (40) | first_unvacuumed u16 | first_free u16 | pad u32
//!             | next page u64 | last blockid u64 | entries (40 bytes each)
//! ```
//!
//! Entries `[first_unvacuumed, first_free)` are live, in strictly increasing
//! blockid order with no gaps.

use std::ops::Range;

use serde::Serialize;

use crate::primitives::bytes::{ByteReader, ByteWriter};
use crate::types::{
    page::{self, PageKind, PAGE_HDR_LEN},
    read_u16, read_u64, BlockId, Lsa, Mvccid, PageId, ReclaimError, Result,
};

const FIRST_UNVACUUMED: Range<usize> = PAGE_HDR_LEN..PAGE_HDR_LEN + 2;
const FIRST_FREE: Range<usize> = PAGE_HDR_LEN + 2..PAGE_HDR_LEN + 4;
const NEXT_PAGE: Range<usize> = PAGE_HDR_LEN + 8..PAGE_HDR_LEN + 16;
const LAST_BLOCKID: Range<usize> = PAGE_HDR_LEN + 16..PAGE_HDR_LEN + 24;
const ENTRIES_START: usize = PAGE_HDR_LEN + 24;
const NO_BLOCK: u64 = u64::MAX;

/// Encoded width of one entry.
pub const ENTRY_LEN: usize = 40;

/// Where a block is in its vacuum lifecycle.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize)]
#[repr(u8)]
pub enum BlockStatus {
    /// Waiting for a job.
    Available = 0,
    /// A worker owns the block.
    InProgress = 1,
    /// Nothing left to clean in the block.
    Vacuumed = 2,
}

impl TryFrom<u8> for BlockStatus {
    type Error = ReclaimError;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            0 => Ok(BlockStatus::Available),
            1 => Ok(BlockStatus::InProgress),
            2 => Ok(BlockStatus::Vacuumed),
            _ => Err(ReclaimError::Corruption("unknown block status")),
        }
    }
}

/// One block awaiting or done with vacuum.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize)]
pub struct VacuumDataEntry {
    /// Block this entry stands for.
    pub blockid: BlockId,
    /// Lifecycle state.
    pub status: BlockStatus,
    /// Set when a job on the block was cut short.
    pub was_interrupted: bool,
    /// Position of the last MVCC operation in the block.
    pub start_lsa: Lsa,
    /// Oldest id acting in the block.
    pub oldest_mvccid: Mvccid,
    /// Newest id acting in the block.
    pub newest_mvccid: Mvccid,
}

impl VacuumDataEntry {
    /// Entry of a block with work to do.
    pub fn available(
        blockid: BlockId,
        start_lsa: Lsa,
        oldest_mvccid: Mvccid,
        newest_mvccid: Mvccid,
    ) -> Self {
        Self {
            blockid,
            status: BlockStatus::Available,
            was_interrupted: false,
            start_lsa,
            oldest_mvccid,
            newest_mvccid,
        }
    }

    /// Placeholder for a block that logged no MVCC operation.
    pub fn gap(blockid: BlockId) -> Self {
        Self {
            blockid,
            status: BlockStatus::Vacuumed,
            was_interrupted: false,
            start_lsa: Lsa::NULL,
            oldest_mvccid: Mvccid::NULL,
            newest_mvccid: Mvccid::NULL,
        }
    }

    /// True once the block needs no more work.
    pub fn is_vacuumed(&self) -> bool {
        self.status == BlockStatus::Vacuumed
    }

    /// True when a job may be started on the block.
    pub fn is_available(&self) -> bool {
        self.status == BlockStatus::Available
    }

    /// Appends the 40-byte durable form.
    pub fn encode(&self, w: &mut ByteWriter) {
        w.put_u64(self.blockid.0);
        w.put_u8(self.status as u8);
        w.put_u8(self.was_interrupted as u8);
        w.put_u16(0);
        w.put_lsa(self.start_lsa);
        w.put_u64(self.oldest_mvccid.0);
        w.put_u64(self.newest_mvccid.0);
    }

    /// Reads an entry written by [`VacuumDataEntry::encode`].
    pub fn decode(r: &mut ByteReader<'_>) -> Result<Self> {
        let blockid = BlockId(r.u64()?);
        let status = BlockStatus::try_from(r.u8()?)?;
        let was_interrupted = match r.u8()? {
            0 => false,
            1 => true,
            _ => return Err(ReclaimError::Corruption("bad interrupted flag")),
        };
        r.u16()?;
        Ok(Self {
            blockid,
            status,
            was_interrupted,
            start_lsa: r.lsa()?,
            oldest_mvccid: Mvccid(r.u64()?),
            newest_mvccid: Mvccid(r.u64()?),
        })
    }
}

/// Entries one page of `page_size` bytes can hold.
pub fn capacity(page_size: usize) -> usize {
    page_size.saturating_sub(ENTRIES_START) / ENTRY_LEN
}

fn check_kind(buf: &[u8]) -> Result<()> {
    if page::page_kind(buf)? != PageKind::VacuumData {
        return Err(ReclaimError::Corruption("not a vacuum data page"));
    }
    Ok(())
}

/// Header fields of a data page.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct DataPageHeader {
    /// First live entry.
    pub first_unvacuumed: u16,
    /// One past the last live entry.
    pub first_free: u16,
    /// Next page of the chain.
    pub next: PageId,
    /// Newest blockid ever appended to this page.
    pub last_blockid: Option<BlockId>,
}

impl DataPageHeader {
    /// Live entry count.
    pub fn live(&self) -> usize {
        (self.first_free - self.first_unvacuumed) as usize
    }

    /// True when the page holds no live entry.
    pub fn is_empty(&self) -> bool {
        self.first_free == self.first_unvacuumed
    }
}

/// Reads the header fields of a data page.
pub fn header(buf: &[u8]) -> Result<DataPageHeader> {
    check_kind(buf)?;
    let first_unvacuumed = read_u16(buf, FIRST_UNVACUUMED.start);
    let first_free = read_u16(buf, FIRST_FREE.start);
    if first_unvacuumed > first_free || first_free as usize > capacity(buf.len()) {
        return Err(ReclaimError::Corruption("vacuum data page indices out of range"));
    }
    let last = read_u64(buf, LAST_BLOCKID.start);
    Ok(DataPageHeader {
        first_unvacuumed,
        first_free,
        next: PageId(read_u64(buf, NEXT_PAGE.start)),
        last_blockid: (last != NO_BLOCK).then_some(BlockId(last)),
    })
}

fn entry_range(index: usize) -> Range<usize> {
    let start = ENTRIES_START + index * ENTRY_LEN;
    start..start + ENTRY_LEN
}

/// Reads entry `index`.
pub fn entry(buf: &[u8], index: usize) -> Result<VacuumDataEntry> {
    let range = entry_range(index);
    if range.end > buf.len() {
        return Err(ReclaimError::Corruption("vacuum data entry out of page"));
    }
    VacuumDataEntry::decode(&mut ByteReader::new(&buf[range], "vacuum data entry"))
}

/// Live entries of the page, oldest first.
pub fn live_entries(buf: &[u8]) -> Result<Vec<VacuumDataEntry>> {
    let hdr = header(buf)?;
    (hdr.first_unvacuumed as usize..hdr.first_free as usize)
        .map(|idx| entry(buf, idx))
        .collect()
}

/// Formats the body of an empty page.
pub fn init(buf: &mut [u8], id: PageId, last_blockid: Option<BlockId>) -> Result<()> {
    let lsa = page::page_lsa(buf)?;
    crate::primitives::pager::format_page(buf, id, PageKind::VacuumData)?;
    page::set_page_lsa(buf, lsa)?;
    buf[NEXT_PAGE].copy_from_slice(&PageId::NULL.0.to_be_bytes());
    set_last_blockid(buf, last_blockid);
    Ok(())
}

fn set_last_blockid(buf: &mut [u8], last: Option<BlockId>) {
    let raw = last.map_or(NO_BLOCK, |b| b.0);
    buf[LAST_BLOCKID].copy_from_slice(&raw.to_be_bytes());
}

/// Writes `entries` from index `at` and makes them live.
pub fn append(
    buf: &mut [u8],
    at: u16,
    entries: &[VacuumDataEntry],
    last_blockid: BlockId,
) -> Result<()> {
    check_kind(buf)?;
    let end = at as usize + entries.len();
    if end > capacity(buf.len()) {
        return Err(ReclaimError::Corruption("vacuum data append past capacity"));
    }
    for (i, entry) in entries.iter().enumerate() {
        let mut w = ByteWriter::new();
        entry.encode(&mut w);
        buf[entry_range(at as usize + i)].copy_from_slice(&w.into_inner());
    }
    buf[FIRST_FREE].copy_from_slice(&(end as u16).to_be_bytes());
    set_last_blockid(buf, Some(last_blockid));
    Ok(())
}

/// Overwrites the live window.
pub fn set_window(buf: &mut [u8], first_unvacuumed: u16, first_free: u16) -> Result<()> {
    check_kind(buf)?;
    if first_unvacuumed > first_free || first_free as usize > capacity(buf.len()) {
        return Err(ReclaimError::Invalid("vacuum data window out of range"));
    }
    buf[FIRST_UNVACUUMED].copy_from_slice(&first_unvacuumed.to_be_bytes());
    buf[FIRST_FREE].copy_from_slice(&first_free.to_be_bytes());
    Ok(())
}

/// Sets the status of entry `index`.
pub fn set_status(
    buf: &mut [u8],
    index: u16,
    status: BlockStatus,
    was_interrupted: bool,
) -> Result<()> {
    let mut current = entry(buf, index as usize)?;
    current.status = status;
    current.was_interrupted = was_interrupted;
    let mut w = ByteWriter::new();
    current.encode(&mut w);
    buf[entry_range(index as usize)].copy_from_slice(&w.into_inner());
    Ok(())
}

/// Sets the forward link.
pub fn set_next(buf: &mut [u8], next: PageId) -> Result<()> {
    check_kind(buf)?;
    buf[NEXT_PAGE].copy_from_slice(&next.0.to_be_bytes());
    Ok(())
}

/// Index of `blockid` within the live window, if present.
pub fn find(buf: &[u8], blockid: BlockId) -> Result<Option<u16>> {
    let hdr = header(buf)?;
    if hdr.is_empty() {
        return Ok(None);
    }
    let first = entry(buf, hdr.first_unvacuumed as usize)?.blockid;
    if blockid < first {
        return Ok(None);
    }
    let idx = hdr.first_unvacuumed as u64 + (blockid.0 - first.0);
    if idx >= hdr.first_free as u64 {
        return Ok(None);
    }
    let found = entry(buf, idx as usize)?;
    if found.blockid != blockid {
        return Err(ReclaimError::Corruption("vacuum data entries not contiguous"));
    }
    Ok(Some(idx as u16))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn page(size: usize) -> Vec<u8> {
        let mut buf = vec![0u8; size];
        crate::primitives::pager::format_page(&mut buf, PageId(3), PageKind::VacuumData).unwrap();
        init(&mut buf, PageId(3), None).unwrap();
        buf
    }

    #[test]
    fn entries_and_window_round_trip() {
        let mut buf = page(512);
        let entries: Vec<_> = (10..14)
            .map(|b| {
                VacuumDataEntry::available(BlockId(b), Lsa::new(b * 4, 8), Mvccid(b), Mvccid(b + 2))
            })
            .collect();
        append(&mut buf, 0, &entries, BlockId(13)).unwrap();
        set_status(&mut buf, 1, BlockStatus::Vacuumed, false).unwrap();
        set_window(&mut buf, 1, 4).unwrap();
        let hdr = header(&buf).unwrap();
        assert_eq!(hdr.live(), 3);
        assert_eq!(hdr.last_blockid, Some(BlockId(13)));
        assert_eq!(hdr.next, PageId::NULL);
        let live = live_entries(&buf).unwrap();
        assert_eq!(live[0].blockid, BlockId(11));
        assert!(live[0].is_vacuumed());
        assert_eq!(find(&buf, BlockId(12)).unwrap(), Some(2));
        assert_eq!(find(&buf, BlockId(10)).unwrap(), None);
        assert_eq!(find(&buf, BlockId(14)).unwrap(), None);
    }

    #[test]
    fn capacity_is_enforced() {
        let mut buf = page(256);
        let cap = capacity(256);
        assert_eq!(cap, 4);
        let entries: Vec<_> = (0..5).map(|b| VacuumDataEntry::gap(BlockId(b))).collect();
        assert!(append(&mut buf, 0, &entries, BlockId(4)).is_err());
    }

    #[test]
    fn init_keeps_page_lsa() {
        let mut buf = page(256);
        page::set_page_lsa(&mut buf, Lsa::new(5, 9)).unwrap();
        init(&mut buf, PageId(3), Some(BlockId(2))).unwrap();
        assert_eq!(page::page_lsa(&buf).unwrap(), Lsa::new(5, 9));
        assert_eq!(header(&buf).unwrap().last_blockid, Some(BlockId(2)));
    }
}
