use crate::mvcc::RecordHeader;
use crate::primitives::bytes::{ByteReader, ByteWriter};
use crate::types::{FileId, Lsa, Mvccid, PageId, RecordLocation, ReclaimError, Result, SlotId};
use crate::vacuum::redo::VacuumRedo;

const TAG_MVCC_OP: u8 = 1;
const TAG_VACUUM: u8 = 2;
const HEAP_HOME: u8 = 0;
const HEAP_OVERFLOW: u8 = 1;

/// What an MVCC operation record did.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MvccOpKind {
    /// Inserted a heap record.
    HeapInsert = 1,
    /// Set the deleter of a heap record.
    HeapDelete = 2,
    /// Replaced a heap record, linking the old version.
    HeapUpdate = 3,
    /// Inserted an index entry with an insertion marker.
    IndexInsert = 4,
    /// Set the deleter of an index entry.
    IndexDelete = 5,
    /// Asked vacuum to look at an index entry without changing it.
    IndexNotifyVacuum = 6,
    /// Deleted a resource held in external storage.
    ExternalDelete = 7,
}

impl MvccOpKind {
    /// True for operations on heap records.
    pub fn is_heap(self) -> bool {
        matches!(
            self,
            MvccOpKind::HeapInsert | MvccOpKind::HeapDelete | MvccOpKind::HeapUpdate
        )
    }

    /// True for operations on index entries.
    pub fn is_index(self) -> bool {
        matches!(
            self,
            MvccOpKind::IndexInsert | MvccOpKind::IndexDelete | MvccOpKind::IndexNotifyVacuum
        )
    }
}

impl TryFrom<u8> for MvccOpKind {
    type Error = ReclaimError;

    fn try_from(value: u8) -> Result<Self> {
        Ok(match value {
            1 => MvccOpKind::HeapInsert,
            2 => MvccOpKind::HeapDelete,
            3 => MvccOpKind::HeapUpdate,
            4 => MvccOpKind::IndexInsert,
            5 => MvccOpKind::IndexDelete,
            6 => MvccOpKind::IndexNotifyVacuum,
            7 => MvccOpKind::ExternalDelete,
            _ => return Err(ReclaimError::Corruption("unknown mvcc op kind")),
        })
    }
}

/// Kind-specific part of an MVCC operation.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum MvccOpPayload {
    /// Heap record inside the record's file.
    Heap {
        /// Heap page.
        page: PageId,
        /// Slot inside the page.
        slot: SlotId,
    },
    /// Heap record too large for its page. The home slot points at the
    /// first overflow page, which carries the MVCC header.
    HeapOverflow {
        /// Heap page of the home slot.
        page: PageId,
        /// Home slot.
        slot: SlotId,
        /// First overflow page.
        overflow: PageId,
    },
    /// Index entry inside the record's file.
    Index {
        /// Key bytes.
        key: Vec<u8>,
        /// Heap record the entry points at.
        object: RecordLocation,
        /// MVCC fields the entry carried when logged.
        header: RecordHeader,
    },
    /// External storage resource.
    External {
        /// Resource name.
        resource: String,
    },
}

/// Decoded MVCC operation.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MvccOpRecord {
    /// Operation kind.
    pub kind: MvccOpKind,
    /// Acting transaction.
    pub mvccid: Mvccid,
    /// Previous MVCC operation in the log, any transaction.
    pub prev_mvcc_op: Option<Lsa>,
    /// Heap file or index the operation touched.
    pub file: FileId,
    /// Operation details.
    pub payload: MvccOpPayload,
}

impl MvccOpRecord {
    /// Checks that the payload matches the kind.
    pub fn validate(&self) -> Result<()> {
        let ok = match &self.payload {
            MvccOpPayload::Heap { .. } | MvccOpPayload::HeapOverflow { .. } => {
                self.kind.is_heap()
            }
            MvccOpPayload::Index { .. } => self.kind.is_index(),
            MvccOpPayload::External { .. } => self.kind == MvccOpKind::ExternalDelete,
        };
        if ok && self.mvccid.is_valid() {
            Ok(())
        } else {
            Err(ReclaimError::Invalid("mvcc op payload does not match its kind"))
        }
    }

    fn encode(&self, w: &mut ByteWriter) -> Result<()> {
        w.put_u8(self.kind as u8);
        w.put_u64(self.mvccid.0);
        w.put_lsa(Lsa::from_option(self.prev_mvcc_op));
        w.put_u32(self.file.0);
        match &self.payload {
            MvccOpPayload::Heap { page, slot } => {
                w.put_u64(page.0);
                w.put_u16(slot.0);
                w.put_u8(HEAP_HOME);
            }
            MvccOpPayload::HeapOverflow {
                page,
                slot,
                overflow,
            } => {
                w.put_u64(page.0);
                w.put_u16(slot.0);
                w.put_u8(HEAP_OVERFLOW);
                w.put_u64(overflow.0);
            }
            MvccOpPayload::Index {
                key,
                object,
                header,
            } => {
                w.put_bytes(key)?;
                w.put_u32(object.file.0);
                w.put_u64(object.page.0);
                w.put_u16(object.slot.0);
                header.encode(w);
            }
            MvccOpPayload::External { resource } => w.put_bytes(resource.as_bytes())?,
        }
        Ok(())
    }

    fn decode(r: &mut ByteReader<'_>) -> Result<Self> {
        let kind = MvccOpKind::try_from(r.u8()?)?;
        let mvccid = Mvccid(r.u64()?);
        let prev_mvcc_op = r.lsa()?.into_option();
        let file = FileId(r.u32()?);
        let payload = if kind.is_heap() {
            let page = PageId(r.u64()?);
            let slot = SlotId(r.u16()?);
            match r.u8()? {
                HEAP_HOME => MvccOpPayload::Heap { page, slot },
                HEAP_OVERFLOW => MvccOpPayload::HeapOverflow {
                    page,
                    slot,
                    overflow: PageId(r.u64()?),
                },
                _ => return Err(ReclaimError::Corruption("unknown heap record layout")),
            }
        } else if kind.is_index() {
            let key = r.bytes()?.to_vec();
            let object = RecordLocation::new(FileId(r.u32()?), PageId(r.u64()?), SlotId(r.u16()?));
            MvccOpPayload::Index {
                key,
                object,
                header: RecordHeader::decode(r)?,
            }
        } else {
            let resource = String::from_utf8(r.bytes()?.to_vec())
                .map_err(|_| ReclaimError::Corruption("external resource name is not utf-8"))?;
            MvccOpPayload::External { resource }
        };
        Ok(Self {
            kind,
            mvccid,
            prev_mvcc_op,
            file,
            payload,
        })
    }
}

/// Log records vacuum understands.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum LogRecord {
    /// A change made by a transaction that vacuum may have to clean up.
    MvccOp(MvccOpRecord),
    /// A change vacuum made to its own durable files.
    Vacuum(VacuumRedo),
}

impl LogRecord {
    /// Encodes the record body.
    pub fn encode(&self) -> Result<Vec<u8>> {
        let mut w = ByteWriter::new();
        match self {
            LogRecord::MvccOp(op) => {
                w.put_u8(TAG_MVCC_OP);
                op.encode(&mut w)?;
            }
            LogRecord::Vacuum(redo) => {
                w.put_u8(TAG_VACUUM);
                redo.encode(&mut w)?;
            }
        }
        Ok(w.into_inner())
    }

    /// Decodes a record body written by [`LogRecord::encode`].
    pub fn decode(body: &[u8]) -> Result<Self> {
        let mut r = ByteReader::new(body, "log record truncated");
        let record = match r.u8()? {
            TAG_MVCC_OP => LogRecord::MvccOp(MvccOpRecord::decode(&mut r)?),
            TAG_VACUUM => LogRecord::Vacuum(VacuumRedo::decode(&mut r)?),
            _ => return Err(ReclaimError::Corruption("unknown log record tag")),
        };
        if r.remaining() != 0 {
            return Err(ReclaimError::Corruption("trailing bytes after log record"));
        }
        Ok(record)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn index_op_survives_codec() {
        let op = MvccOpRecord {
            kind: MvccOpKind::IndexDelete,
            mvccid: Mvccid(42),
            prev_mvcc_op: Some(Lsa::new(7, 16)),
            file: FileId(3),
            payload: MvccOpPayload::Index {
                key: b"alice".to_vec(),
                object: RecordLocation::new(FileId(1), PageId(9), SlotId(4)),
                header: RecordHeader::inserted(Mvccid(40)).deleted_by(Mvccid(42)),
            },
        };
        let body = LogRecord::MvccOp(op.clone()).encode().unwrap();
        assert_eq!(LogRecord::decode(&body).unwrap(), LogRecord::MvccOp(op));
    }

    #[test]
    fn overflow_heap_op_keeps_its_layout() {
        let op = MvccOpRecord {
            kind: MvccOpKind::HeapInsert,
            mvccid: Mvccid(8),
            prev_mvcc_op: None,
            file: FileId(2),
            payload: MvccOpPayload::HeapOverflow {
                page: PageId(3),
                slot: SlotId(1),
                overflow: PageId(77),
            },
        };
        let body = LogRecord::MvccOp(op.clone()).encode().unwrap();
        assert_eq!(LogRecord::decode(&body).unwrap(), LogRecord::MvccOp(op));
    }

    #[test]
    fn unknown_tag_and_trailing_bytes_are_corruption() {
        assert!(matches!(
            LogRecord::decode(&[9]),
            Err(ReclaimError::Corruption(_))
        ));
        let mut body = LogRecord::Vacuum(VacuumRedo::SetFirstPage {
            file: crate::vacuum::redo::RedoFile::Data,
            first: PageId(2),
        })
        .encode()
        .unwrap();
        body.push(0);
        assert!(LogRecord::decode(&body).is_err());
    }

    #[test]
    fn payload_must_match_kind() {
        let op = MvccOpRecord {
            kind: MvccOpKind::HeapInsert,
            mvccid: Mvccid(1),
            prev_mvcc_op: None,
            file: FileId(1),
            payload: MvccOpPayload::External {
                resource: "blob-1".into(),
            },
        };
        assert!(op.validate().is_err());
    }
}
