use std::ops::Range;

use crate::types::{
    page::{self, PageKind, PAGE_HDR_LEN},
    read_u64, PageId, ReclaimError, Result,
};

/// Descriptor page of every store.
pub const META_PAGE: PageId = PageId(0);

const META_FIRST_PAGE: Range<usize> = PAGE_HDR_LEN..PAGE_HDR_LEN + 8;

/// First page of the chain recorded in the descriptor, or `PageId::NULL`.
pub fn read_first_page(buf: &[u8]) -> Result<PageId> {
    if page::page_kind(buf)? != PageKind::Meta {
        return Err(ReclaimError::Corruption("descriptor page has wrong kind"));
    }
    Ok(PageId(read_u64(buf, META_FIRST_PAGE.start)))
}

/// Records the first page of the chain in the descriptor.
pub fn write_first_page(buf: &mut [u8], first: PageId) -> Result<()> {
    if page::page_kind(buf)? != PageKind::Meta {
        return Err(ReclaimError::Corruption("descriptor page has wrong kind"));
    }
    buf[META_FIRST_PAGE].copy_from_slice(&first.0.to_be_bytes());
    Ok(())
}

/// Formats a descriptor pointing at no chain.
pub(crate) fn init_meta(buf: &mut [u8]) -> Result<()> {
    super::format_page(buf, META_PAGE, PageKind::Meta)?;
    buf[META_FIRST_PAGE].copy_from_slice(&PageId::NULL.0.to_be_bytes());
    Ok(())
}
