use serde::Serialize;

use crate::admin::{AdminError, Result};
use crate::mvcc::RecordHeader;
use crate::storage::{HeapStore, IndexStore};
use crate::types::{FileId, Mvccid};
use crate::vacuum::Vacuum;

const MAX_FINDINGS: usize = 32;

/// Indicates the severity level of a verification finding.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum VerifySeverity {
    /// Informational message about the verification process.
    Info,
    /// Record vacuum should have processed but did not.
    Error,
}

/// Represents a single issue discovered during verification.
#[derive(Clone, Debug, Serialize)]
pub struct VerifyFinding {
    /// The severity level of this finding.
    pub severity: VerifySeverity,
    /// Human-readable description of the issue.
    pub message: String,
}

/// Statistics collected during the verification process.
#[derive(Clone, Debug, Default, Serialize)]
pub struct VerifyCounts {
    /// Heap records examined.
    pub heap_records: u64,
    /// Index entries examined.
    pub index_entries: u64,
    /// Records skipped because their file generation was dropped.
    pub dropped_skipped: u64,
}

/// Complete report of a verification operation.
#[derive(Clone, Debug, Serialize)]
pub struct VerifyReport {
    /// Every id below this one was claimed vacuumed when the check ran.
    pub oldest_unvacuumed: Mvccid,
    /// Whether verification passed without finding any issues.
    pub success: bool,
    /// List of issues discovered during verification.
    pub findings: Vec<VerifyFinding>,
    /// Statistics about the records examined.
    pub counts: VerifyCounts,
}

/// Checks every heap record and index entry against the oldest unvacuumed
/// id of `vacuum`.
///
/// A record deleted by an id below it should be gone and an insertion
/// marker below it should have been stripped. Records of dropped file
/// generations are skipped. Vacuum should be idle while this runs, or the
/// result may report records a worker is about to process.
pub fn verify_vacuumed(
    heap: &dyn HeapStore,
    index: &dyn IndexStore,
    vacuum: &Vacuum,
) -> Result<VerifyReport> {
    let oldest = vacuum.get_oldest_unvacuumed_id();
    let mut findings = Vec::new();
    let mut counts = VerifyCounts::default();

    for (loc, header) in heap.scan()? {
        counts.heap_records += 1;
        if is_dropped(vacuum, loc.file, &header)? {
            counts.dropped_skipped += 1;
            continue;
        }
        if let Some(problem) = check_header(&header, oldest) {
            push_error(&mut findings, format!("heap record {loc:?} {problem}"));
        }
    }
    for entry in index.scan()? {
        counts.index_entries += 1;
        if is_dropped(vacuum, entry.index, &entry.header)? {
            counts.dropped_skipped += 1;
            continue;
        }
        if let Some(problem) = check_header(&entry.header, oldest) {
            push_error(
                &mut findings,
                format!(
                    "index {} entry {:?} -> {:?} {problem}",
                    entry.index.0, entry.key, entry.object
                ),
            );
        }
    }

    Ok(VerifyReport {
        oldest_unvacuumed: oldest,
        success: findings.is_empty(),
        findings,
        counts,
    })
}

/// Like [`verify_vacuumed`], failing with [`AdminError::NotVacuumed`] on the
/// first finding.
pub fn check_vacuumed(heap: &dyn HeapStore, index: &dyn IndexStore, vacuum: &Vacuum) -> Result<()> {
    let report = verify_vacuumed(heap, index, vacuum)?;
    match report.findings.into_iter().next() {
        Some(finding) => Err(AdminError::NotVacuumed(finding.message)),
        None => Ok(()),
    }
}

fn check_header(header: &RecordHeader, oldest: Mvccid) -> Option<String> {
    if let Some(del) = header.del_id.filter(|del| *del < oldest) {
        return Some(format!("deleted by {} should have been removed", del.0));
    }
    if let Some(ins) = header.ins_id.filter(|ins| *ins < oldest) {
        return Some(format!("inserted by {} should have lost its marker", ins.0));
    }
    None
}

fn is_dropped(vacuum: &Vacuum, file: FileId, header: &RecordHeader) -> Result<bool> {
    let acting = header.del_id.or(header.ins_id);
    match acting {
        Some(id) => Ok(vacuum.is_file_dropped(file, id)?),
        None => Ok(false),
    }
}

fn push_error(findings: &mut Vec<VerifyFinding>, message: String) {
    if findings.len() < MAX_FINDINGS {
        findings.push(VerifyFinding {
            severity: VerifySeverity::Error,
            message,
        });
    } else if findings.len() == MAX_FINDINGS {
        findings.push(VerifyFinding {
            severity: VerifySeverity::Info,
            message: "further findings omitted".to_string(),
        });
    }
}
