//! Durable layout of dropped-file pages.
//!
//! ```text
//! header (40) | count u16 | pad (6) | next page u64 | entries (16 bytes each)
//! ```
//!
//! Entries are sorted by file id within a page.

use std::ops::Range;

use serde::Serialize;

use crate::primitives::bytes::{ByteReader, ByteWriter};
use crate::types::{
    page::{self, PageKind, PAGE_HDR_LEN},
    read_u16, read_u64, FileId, Mvccid, PageId, ReclaimError, Result,
};

const COUNT: Range<usize> = PAGE_HDR_LEN..PAGE_HDR_LEN + 2;
const NEXT_PAGE: Range<usize> = PAGE_HDR_LEN + 8..PAGE_HDR_LEN + 16;
const ENTRIES_START: usize = PAGE_HDR_LEN + 16;

/// Encoded width of one entry.
pub const ENTRY_LEN: usize = 16;

/// A file dropped while vacuum may still reference it.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize)]
pub struct DroppedFileEntry {
    /// Dropped file.
    pub file: FileId,
    /// Records with older ids belong to the dropped generation of the file.
    pub mvccid: Mvccid,
}

impl DroppedFileEntry {
    /// Appends the 16-byte durable form.
    pub fn encode(&self, w: &mut ByteWriter) {
        w.put_u32(self.file.0);
        w.put_u32(0);
        w.put_u64(self.mvccid.0);
    }

    /// Reads an entry written by [`DroppedFileEntry::encode`].
    pub fn decode(r: &mut ByteReader<'_>) -> Result<Self> {
        let file = FileId(r.u32()?);
        r.u32()?;
        Ok(Self {
            file,
            mvccid: Mvccid(r.u64()?),
        })
    }
}

/// Entries one page of `page_size` bytes can hold.
pub fn capacity(page_size: usize) -> usize {
    page_size.saturating_sub(ENTRIES_START) / ENTRY_LEN
}

fn check_kind(buf: &[u8]) -> Result<()> {
    if page::page_kind(buf)? != PageKind::DroppedFiles {
        return Err(ReclaimError::Corruption("not a dropped files page"));
    }
    Ok(())
}

/// Number of entries on the page.
pub fn count(buf: &[u8]) -> Result<usize> {
    check_kind(buf)?;
    let count = read_u16(buf, COUNT.start) as usize;
    if count > capacity(buf.len()) {
        return Err(ReclaimError::Corruption("dropped files count out of range"));
    }
    Ok(count)
}

/// Forward link.
pub fn next(buf: &[u8]) -> Result<PageId> {
    check_kind(buf)?;
    Ok(PageId(read_u64(buf, NEXT_PAGE.start)))
}

/// Sets the forward link.
pub fn set_next(buf: &mut [u8], next: PageId) -> Result<()> {
    check_kind(buf)?;
    buf[NEXT_PAGE].copy_from_slice(&next.0.to_be_bytes());
    Ok(())
}

/// All entries of the page in file order.
pub fn entries(buf: &[u8]) -> Result<Vec<DroppedFileEntry>> {
    let count = count(buf)?;
    let mut r = ByteReader::new(
        &buf[ENTRIES_START..ENTRIES_START + count * ENTRY_LEN],
        "dropped file entry",
    );
    (0..count).map(|_| DroppedFileEntry::decode(&mut r)).collect()
}

fn write_entries(buf: &mut [u8], entries: &[DroppedFileEntry]) -> Result<()> {
    if entries.len() > capacity(buf.len()) {
        return Err(ReclaimError::Corruption("dropped files page overflow"));
    }
    let mut w = ByteWriter::new();
    for entry in entries {
        entry.encode(&mut w);
    }
    let bytes = w.into_inner();
    buf[ENTRIES_START..ENTRIES_START + bytes.len()].copy_from_slice(&bytes);
    buf[COUNT].copy_from_slice(&(entries.len() as u16).to_be_bytes());
    Ok(())
}

/// Formats an empty page.
pub fn init(buf: &mut [u8], id: PageId) -> Result<()> {
    let lsa = page::page_lsa(buf)?;
    crate::primitives::pager::format_page(buf, id, PageKind::DroppedFiles)?;
    page::set_page_lsa(buf, lsa)?;
    buf[NEXT_PAGE].copy_from_slice(&PageId::NULL.0.to_be_bytes());
    Ok(())
}

/// Inserts `entry` in file order, replacing an entry for the same file.
pub fn insert(buf: &mut [u8], entry: DroppedFileEntry) -> Result<()> {
    let mut all = entries(buf)?;
    match all.binary_search_by_key(&entry.file, |e| e.file) {
        Ok(idx) => all[idx] = entry,
        Err(idx) => all.insert(idx, entry),
    }
    write_entries(buf, &all)
}

/// Replaces the drop id of an existing entry. Missing files are ignored.
pub fn replace(buf: &mut [u8], entry: DroppedFileEntry) -> Result<()> {
    let mut all = entries(buf)?;
    if let Ok(idx) = all.binary_search_by_key(&entry.file, |e| e.file) {
        all[idx] = entry;
        write_entries(buf, &all)?;
    }
    Ok(())
}

/// Removes every entry dropped before `before`. Returns how many.
pub fn remove_before(buf: &mut [u8], before: Mvccid) -> Result<usize> {
    let mut all = entries(buf)?;
    let len = all.len();
    all.retain(|e| e.mvccid >= before);
    write_entries(buf, &all)?;
    Ok(len - all.len())
}

/// Drop id recorded for `file` on this page.
pub fn lookup(buf: &[u8], file: FileId) -> Result<Option<Mvccid>> {
    let all = entries(buf)?;
    Ok(all
        .binary_search_by_key(&file, |e| e.file)
        .ok()
        .map(|idx| all[idx].mvccid))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn page() -> Vec<u8> {
        let mut buf = vec![0u8; 120];
        crate::primitives::pager::format_page(&mut buf, PageId(1), PageKind::DroppedFiles)
            .unwrap();
        init(&mut buf, PageId(1)).unwrap();
        buf
    }

    #[test]
    fn insert_keeps_file_order_and_replaces() {
        let mut buf = page();
        for (file, id) in [(7, 10), (2, 11), (5, 12), (2, 20)] {
            insert(
                &mut buf,
                DroppedFileEntry {
                    file: FileId(file),
                    mvccid: Mvccid(id),
                },
            )
            .unwrap();
        }
        let files: Vec<_> = entries(&buf).unwrap().iter().map(|e| e.file.0).collect();
        assert_eq!(files, vec![2, 5, 7]);
        assert_eq!(lookup(&buf, FileId(2)).unwrap(), Some(Mvccid(20)));
        assert_eq!(lookup(&buf, FileId(3)).unwrap(), None);
    }

    #[test]
    fn remove_before_drops_old_generations() {
        let mut buf = page();
        for (file, id) in [(1, 5), (2, 50), (3, 8)] {
            insert(
                &mut buf,
                DroppedFileEntry {
                    file: FileId(file),
                    mvccid: Mvccid(id),
                },
            )
            .unwrap();
        }
        assert_eq!(remove_before(&mut buf, Mvccid(10)).unwrap(), 2);
        assert_eq!(count(&buf).unwrap(), 1);
        assert_eq!(next(&buf).unwrap(), PageId::NULL);
    }

    #[test]
    fn overflow_is_rejected() {
        let mut buf = page();
        let cap = capacity(buf.len());
        for file in 0..cap as u32 {
            insert(
                &mut buf,
                DroppedFileEntry {
                    file: FileId(file),
                    mvccid: Mvccid(1),
                },
            )
            .unwrap();
        }
        assert!(insert(
            &mut buf,
            DroppedFileEntry {
                file: FileId(999),
                mvccid: Mvccid(1),
            },
        )
        .is_err());
    }
}
