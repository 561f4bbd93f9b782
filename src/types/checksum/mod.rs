#![forbid(unsafe_code)]

//! CRC32 protection for durable pages.

use super::page::{self, header};
use super::{read_u32, read_u64, ReclaimError, Result};

/// CRC32 over the page number followed by the page image.
pub fn page_crc32(page_no: u64, payload: &[u8]) -> u32 {
    let mut hasher = crc32fast::Hasher::new();
    hasher.update(&page_no.to_be_bytes());
    hasher.update(payload);
    hasher.finalize()
}

/// Recomputes the checksum of a full page image and stores it in the header.
pub fn seal_page(buf: &mut [u8]) -> Result<()> {
    page::clear_crc32(buf)?;
    let page_no = read_u64(buf, header::PAGE_NO.start);
    let crc = page_crc32(page_no, buf);
    buf[header::CRC32].copy_from_slice(&crc.to_be_bytes());
    Ok(())
}

/// Checks the checksum stored in a full page image.
pub fn verify_page(buf: &[u8]) -> Result<()> {
    if buf.len() < page::PAGE_HDR_LEN {
        return Err(ReclaimError::Corruption("page header truncated"));
    }
    let stored = read_u32(buf, header::CRC32.start);
    let mut scratch = buf.to_vec();
    page::clear_crc32(&mut scratch)?;
    let page_no = read_u64(buf, header::PAGE_NO.start);
    if page_crc32(page_no, &scratch) != stored {
        return Err(ReclaimError::Corruption("page checksum mismatch"));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::page::{PageHeader, PageKind};
    use crate::types::PageId;

    #[test]
    fn page_crc32_changes_with_components() {
        let payload = vec![0u8; 16];
        let crc_a = page_crc32(1, &payload);
        assert_eq!(crc_a, page_crc32(1, &payload));

        let mut different = payload.clone();
        different[0] = 1;
        assert_ne!(crc_a, page_crc32(1, &different));
        assert_ne!(crc_a, page_crc32(3, &payload));
    }

    #[test]
    fn sealed_page_detects_bit_flip() {
        let mut buf = vec![0u8; 256];
        PageHeader::new(PageId(5), PageKind::DroppedFiles, 256)
            .unwrap()
            .encode(&mut buf)
            .unwrap();
        buf[200] = 0xAB;
        seal_page(&mut buf).unwrap();
        verify_page(&buf).unwrap();
        buf[201] ^= 1;
        assert!(matches!(
            verify_page(&buf),
            Err(ReclaimError::Corruption("page checksum mismatch"))
        ));
    }
}
