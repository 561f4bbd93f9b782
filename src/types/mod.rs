#![forbid(unsafe_code)]

//! Identifier newtypes, the crate error type and the shared page header.

use std::fmt;

use serde::{Deserialize, Serialize};

pub mod checksum;

pub use checksum::page_crc32;

/// Transaction identifier used for visibility comparisons.
#[derive(
    Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug, Default, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct Mvccid(pub u64);

impl Mvccid {
    /// Invalid identifier, never handed out.
    pub const NULL: Mvccid = Mvccid(0);
    /// First identifier handed out after a fresh start.
    pub const FIRST: Mvccid = Mvccid(1);
    /// Largest representable identifier.
    pub const MAX: Mvccid = Mvccid(u64::MAX);

    /// Returns true unless this is [`Mvccid::NULL`].
    pub const fn is_valid(self) -> bool {
        self.0 != 0
    }

    /// Identifier immediately after this one.
    pub const fn next(self) -> Mvccid {
        Mvccid(self.0 + 1)
    }

    /// Identifier immediately before this one, saturating at zero.
    pub const fn prev(self) -> Mvccid {
        Mvccid(self.0.saturating_sub(1))
    }

    /// True when `self` is strictly older than `other`.
    pub fn precedes(self, other: Mvccid) -> bool {
        self < other
    }
}

impl fmt::Display for Mvccid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Page identifier inside one page store.
#[derive(
    Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug, Default, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct PageId(pub u64);

impl PageId {
    /// Durable "no page" marker used by chain links.
    pub const NULL: PageId = PageId(u64::MAX);

    /// Returns true unless this is [`PageId::NULL`].
    pub const fn is_valid(self) -> bool {
        self.0 != u64::MAX
    }
}

impl fmt::Display for PageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_valid() {
            write!(f, "{}", self.0)
        } else {
            f.write_str("null")
        }
    }
}

/// Storage file identifier (heap file or index).
#[derive(
    Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug, Default, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct FileId(pub u32);

impl fmt::Display for FileId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Slot number of a record inside a heap page.
#[derive(
    Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug, Default, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct SlotId(pub u16);

/// Physical location of a heap record.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug, Serialize, Deserialize)]
pub struct RecordLocation {
    /// Heap file.
    pub file: FileId,
    /// Page inside the heap file.
    pub page: PageId,
    /// Slot inside the page.
    pub slot: SlotId,
}

impl RecordLocation {
    /// Builds a location from raw parts.
    pub const fn new(file: FileId, page: PageId, slot: SlotId) -> Self {
        Self { file, page, slot }
    }
}

impl fmt::Display for RecordLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}|{}|{}", self.file.0, self.page.0, self.slot.0)
    }
}

/// Logical log page number.
pub type LogPageId = u64;

/// Identifier of a block: a fixed run of consecutive log pages.
#[derive(
    Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug, Default, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct BlockId(pub u64);

impl BlockId {
    /// Block containing `page`.
    pub const fn of_page(page: LogPageId, pages_per_block: u64) -> BlockId {
        BlockId(page / pages_per_block)
    }

    /// First log page covered by this block.
    pub const fn first_log_page(self, pages_per_block: u64) -> LogPageId {
        self.0 * pages_per_block
    }

    /// Last log page covered by this block.
    pub const fn last_log_page(self, pages_per_block: u64) -> LogPageId {
        (self.0 + 1) * pages_per_block - 1
    }

    /// Following block.
    pub const fn next(self) -> BlockId {
        BlockId(self.0 + 1)
    }
}

impl fmt::Display for BlockId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Log sequence address: a log page plus a byte offset inside it.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug, Serialize, Deserialize)]
pub struct Lsa {
    /// Log page.
    pub page: LogPageId,
    /// Offset of the record inside the page.
    pub offset: u32,
}

impl Lsa {
    /// Durable encoding of "no position".
    pub const NULL: Lsa = Lsa {
        page: u64::MAX,
        offset: u32::MAX,
    };
    /// Position before any record. Pages stamped with it have seen no redo.
    pub const ZERO: Lsa = Lsa { page: 0, offset: 0 };
    /// Encoded width in bytes.
    pub const ENCODED_LEN: usize = 12;

    /// Builds a position.
    pub const fn new(page: LogPageId, offset: u32) -> Self {
        Self { page, offset }
    }

    /// Returns true unless this is [`Lsa::NULL`].
    pub const fn is_valid(self) -> bool {
        !(self.page == u64::MAX && self.offset == u32::MAX)
    }

    /// Maps the NULL sentinel to `None`.
    pub fn into_option(self) -> Option<Lsa> {
        self.is_valid().then_some(self)
    }

    /// Maps `None` to the NULL sentinel.
    pub fn from_option(lsa: Option<Lsa>) -> Lsa {
        lsa.unwrap_or(Lsa::NULL)
    }

    /// Big-endian encoding.
    pub fn encode(self, dst: &mut [u8]) {
        dst[..8].copy_from_slice(&self.page.to_be_bytes());
        dst[8..12].copy_from_slice(&self.offset.to_be_bytes());
    }

    /// Decodes a position written by [`Lsa::encode`].
    pub fn decode(src: &[u8]) -> Result<Lsa> {
        if src.len() < Self::ENCODED_LEN {
            return Err(ReclaimError::Corruption("log position truncated"));
        }
        Ok(Lsa {
            page: read_u64(src, 0),
            offset: read_u32(src, 8),
        })
    }
}

impl fmt::Display for Lsa {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_valid() {
            write!(f, "{}|{}", self.page, self.offset)
        } else {
            f.write_str("null")
        }
    }
}

/// Errors produced by MVCC tracking and vacuum.
#[derive(thiserror::Error, Debug)]
pub enum ReclaimError {
    /// Underlying file IO failed.
    #[error("IO: {0}")]
    Io(#[from] std::io::Error),
    /// A durable structure failed validation while being read.
    #[error("corruption: {0}")]
    Corruption(&'static str),
    /// Caller passed an argument outside the accepted domain.
    #[error("invalid argument: {0}")]
    Invalid(&'static str),
    /// The requested page or entry does not exist.
    #[error("not found")]
    NotFound,
    /// A page could not be allocated for durable bookkeeping.
    #[error("out of space: {0}")]
    OutOfSpace(&'static str),
    /// The job was interrupted by shutdown or an explicit request.
    #[error("interrupted")]
    Interrupted,
    /// A consistency check found a record that should have been vacuumed.
    #[error("validation failed: {0}")]
    Validation(String),
    /// A bounded queue refused a producer.
    #[error("queue full: {0}")]
    QueueFull(&'static str),
    /// The subsystem has already shut down.
    #[error("vacuum is shut down")]
    Shutdown,
    /// An options file could not be parsed.
    #[error("config: {0}")]
    Config(String),
}

impl ReclaimError {
    /// Errors after which vacuum can no longer keep durable bookkeeping.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            ReclaimError::OutOfSpace(_) | ReclaimError::Corruption(_) | ReclaimError::QueueFull(_)
        )
    }
}

/// Crate result alias.
pub type Result<T> = std::result::Result<T, ReclaimError>;

pub(crate) fn read_u16(src: &[u8], at: usize) -> u16 {
    let mut buf = [0u8; 2];
    buf.copy_from_slice(&src[at..at + 2]);
    u16::from_be_bytes(buf)
}

pub(crate) fn read_u32(src: &[u8], at: usize) -> u32 {
    let mut buf = [0u8; 4];
    buf.copy_from_slice(&src[at..at + 4]);
    u32::from_be_bytes(buf)
}

pub(crate) fn read_u64(src: &[u8], at: usize) -> u64 {
    let mut buf = [0u8; 8];
    buf.copy_from_slice(&src[at..at + 8]);
    u64::from_be_bytes(buf)
}

pub mod page {
    //! Shared on-disk page metadata used by the page stores.

    use core::convert::TryFrom;

    use super::{read_u16, read_u32, read_u64, Lsa, PageId, ReclaimError, Result};

    /// Magic bytes at the start of every page.
    pub const PAGE_MAGIC: [u8; 4] = *b"RCLM";
    /// Current page format version.
    pub const PAGE_FORMAT_VERSION: u16 = 1;
    /// Page size used when none is configured.
    pub const DEFAULT_PAGE_SIZE: u32 = 4096;
    /// Length of the fixed header.
    pub const PAGE_HDR_LEN: usize = 40;

    pub mod header {
        //! Byte offsets for fixed header fields.
        use core::ops::Range;

        pub const MAGIC: Range<usize> = 0..4;
        pub const FORMAT_VERSION: Range<usize> = 4..6;
        pub const PAGE_KIND: usize = 6;
        pub const RESERVED: usize = 7;
        pub const PAGE_SIZE: Range<usize> = 8..12;
        pub const PAGE_NO: Range<usize> = 12..20;
        pub const PAGE_LSA: Range<usize> = 20..32;
        pub const CRC32: Range<usize> = 32..36;
        pub const RESERVED_2: Range<usize> = 36..40;
    }

    /// What a page holds.
    #[repr(u8)]
    #[derive(Copy, Clone, Debug, Eq, PartialEq)]
    pub enum PageKind {
        /// Page 0: descriptor of the chain stored in the file.
        Meta = 1,
        /// Allocated but not yet formatted.
        Free = 2,
        /// Vacuum data block entries.
        VacuumData = 3,
        /// Dropped file entries.
        DroppedFiles = 4,
    }

    impl PageKind {
        /// Raw tag.
        pub const fn as_u8(self) -> u8 {
            self as u8
        }
    }

    impl TryFrom<u8> for PageKind {
        type Error = ReclaimError;

        fn try_from(value: u8) -> Result<Self> {
            match value {
                1 => Ok(PageKind::Meta),
                2 => Ok(PageKind::Free),
                3 => Ok(PageKind::VacuumData),
                4 => Ok(PageKind::DroppedFiles),
                _ => Err(ReclaimError::Corruption("unknown page kind")),
            }
        }
    }

    /// Decoded fixed page header.
    #[derive(Clone, Debug, Eq, PartialEq)]
    pub struct PageHeader {
        /// Format version.
        pub format_version: u16,
        /// Page kind tag.
        pub kind: PageKind,
        /// Page size the page was written with.
        pub page_size: u32,
        /// Page number.
        pub page_no: PageId,
        /// Position of the last redo record applied to this page.
        pub page_lsa: Lsa,
        /// Checksum over the page with this field zeroed.
        pub crc32: u32,
    }

    impl PageHeader {
        /// Header for a freshly formatted page.
        pub fn new(page_no: PageId, kind: PageKind, page_size: u32) -> Result<Self> {
            if (page_size as usize) < PAGE_HDR_LEN {
                return Err(ReclaimError::Invalid("page size smaller than header"));
            }
            Ok(Self {
                format_version: PAGE_FORMAT_VERSION,
                kind,
                page_size,
                page_no,
                page_lsa: Lsa::ZERO,
                crc32: 0,
            })
        }

        /// Sets the checksum field.
        pub fn with_crc32(mut self, crc32: u32) -> Self {
            self.crc32 = crc32;
            self
        }

        /// Writes the header into the first [`PAGE_HDR_LEN`] bytes of `dst`.
        pub fn encode(&self, dst: &mut [u8]) -> Result<()> {
            if dst.len() < PAGE_HDR_LEN {
                return Err(ReclaimError::Invalid("page header buffer too small"));
            }
            let hdr = &mut dst[..PAGE_HDR_LEN];
            hdr[header::MAGIC].copy_from_slice(&PAGE_MAGIC);
            hdr[header::FORMAT_VERSION].copy_from_slice(&self.format_version.to_be_bytes());
            hdr[header::PAGE_KIND] = self.kind.as_u8();
            hdr[header::RESERVED] = 0;
            hdr[header::PAGE_SIZE].copy_from_slice(&self.page_size.to_be_bytes());
            hdr[header::PAGE_NO].copy_from_slice(&self.page_no.0.to_be_bytes());
            self.page_lsa.encode(&mut hdr[header::PAGE_LSA]);
            hdr[header::CRC32].copy_from_slice(&self.crc32.to_be_bytes());
            hdr[header::RESERVED_2].fill(0);
            Ok(())
        }

        /// Parses and validates a header.
        pub fn decode(src: &[u8]) -> Result<Self> {
            if src.len() < PAGE_HDR_LEN {
                return Err(ReclaimError::Corruption("page header truncated"));
            }
            let hdr = &src[..PAGE_HDR_LEN];
            if hdr[header::MAGIC] != PAGE_MAGIC {
                return Err(ReclaimError::Corruption("invalid page magic"));
            }
            let format_version = read_u16(hdr, header::FORMAT_VERSION.start);
            if format_version != PAGE_FORMAT_VERSION {
                return Err(ReclaimError::Corruption("unsupported page format version"));
            }
            if hdr[header::RESERVED] != 0 {
                return Err(ReclaimError::Corruption(
                    "page header reserved byte not zero",
                ));
            }
            let kind = PageKind::try_from(hdr[header::PAGE_KIND])?;
            let page_size = read_u32(hdr, header::PAGE_SIZE.start);
            if (page_size as usize) < PAGE_HDR_LEN {
                return Err(ReclaimError::Corruption("page size smaller than header"));
            }
            let page_no = PageId(read_u64(hdr, header::PAGE_NO.start));
            let page_lsa = Lsa::decode(&hdr[header::PAGE_LSA])?;
            let crc32 = read_u32(hdr, header::CRC32.start);
            Ok(Self {
                format_version,
                kind,
                page_size,
                page_no,
                page_lsa,
                crc32,
            })
        }
    }

    /// Reads only the page LSA field.
    pub fn page_lsa(buf: &[u8]) -> Result<Lsa> {
        if buf.len() < PAGE_HDR_LEN {
            return Err(ReclaimError::Corruption("page header truncated"));
        }
        Lsa::decode(&buf[header::PAGE_LSA])
    }

    /// Overwrites only the page LSA field.
    pub fn set_page_lsa(buf: &mut [u8], lsa: Lsa) -> Result<()> {
        if buf.len() < PAGE_HDR_LEN {
            return Err(ReclaimError::Invalid("page header buffer too small"));
        }
        lsa.encode(&mut buf[header::PAGE_LSA]);
        Ok(())
    }

    /// Reads only the page kind tag.
    pub fn page_kind(buf: &[u8]) -> Result<PageKind> {
        if buf.len() < PAGE_HDR_LEN {
            return Err(ReclaimError::Corruption("page header truncated"));
        }
        PageKind::try_from(buf[header::PAGE_KIND])
    }

    /// Zeroes the checksum field before hashing.
    pub fn clear_crc32(buf: &mut [u8]) -> Result<()> {
        if buf.len() < header::CRC32.end {
            return Err(ReclaimError::Invalid("page header buffer too small"));
        }
        buf[header::CRC32].fill(0);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::page::{self, PageHeader, PageKind};
    use super::*;
    use std::convert::TryFrom;

    #[test]
    fn page_header_roundtrip() {
        let mut buf = [0u8; page::PAGE_HDR_LEN];
        let mut header = PageHeader::new(PageId(42), PageKind::VacuumData, 4096)
            .unwrap()
            .with_crc32(0xDEAD_BEEF);
        header.page_lsa = Lsa::new(7, 128);
        header.encode(&mut buf).unwrap();
        let decoded = PageHeader::decode(&buf).unwrap();
        assert_eq!(decoded, header);
        assert_eq!(page::page_lsa(&buf).unwrap(), Lsa::new(7, 128));
    }

    #[test]
    fn page_kind_from_u8_rejects_unknown() {
        assert!(PageKind::try_from(0).is_err());
        assert!(PageKind::try_from(9).is_err());
    }

    #[test]
    fn block_page_arithmetic() {
        let block = BlockId(3);
        assert_eq!(block.first_log_page(4), 12);
        assert_eq!(block.last_log_page(4), 15);
        assert_eq!(BlockId::of_page(15, 4), block);
        assert_eq!(BlockId::of_page(16, 4), block.next());
    }

    #[test]
    fn null_sentinels() {
        assert!(!Mvccid::NULL.is_valid());
        assert!(Mvccid::FIRST.is_valid());
        assert!(!PageId::NULL.is_valid());
        assert_eq!(Lsa::NULL.into_option(), None);
        assert_eq!(Lsa::from_option(None), Lsa::NULL);
        let mut buf = [0u8; Lsa::ENCODED_LEN];
        Lsa::NULL.encode(&mut buf);
        assert_eq!(Lsa::decode(&buf).unwrap(), Lsa::NULL);
    }

    #[test]
    fn fatal_classification() {
        assert!(ReclaimError::OutOfSpace("x").is_fatal());
        assert!(ReclaimError::QueueFull("x").is_fatal());
        assert!(!ReclaimError::Interrupted.is_fatal());
        assert!(!ReclaimError::NotFound.is_fatal());
    }
}
