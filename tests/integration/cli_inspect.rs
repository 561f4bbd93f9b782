#![allow(missing_docs)]

use std::path::{Path, PathBuf};
use std::sync::Arc;

use assert_cmd::cargo::cargo_bin_cmd;
use reclaim::log::{MemLog, MemLogOptions, MvccOpKind, MvccOpPayload};
use reclaim::mvcc::MvccTable;
use reclaim::primitives::pager::FilePageStore;
use reclaim::storage::{MemHeap, MemIndex};
use reclaim::types::{FileId, PageId, SlotId};
use reclaim::vacuum::{Vacuum, VacuumDeps};
use reclaim::{MvccOptions, VacuumOptions};
use serde_json::Value;
use tempfile::TempDir;

fn setup_stores() -> (TempDir, PathBuf, PathBuf) {
    let dir = TempDir::new().expect("tempdir");
    let data = dir.path().join("vacuum.data");
    let dropped = dir.path().join("vacuum.dropped");
    seed(&data, &dropped).expect("seed vacuum stores");
    (dir, data, dropped)
}

/// Three blocks held back by an open reader and one dropped file.
fn seed(data: &Path, dropped: &Path) -> reclaim::types::Result<()> {
    let opts = VacuumOptions::default();
    let table = MvccTable::new(MvccOptions::default());
    let log = Arc::new(MemLog::new(MemLogOptions::default())?);
    let deps = VacuumDeps::new(
        table.clone(),
        log.clone(),
        Arc::new(FilePageStore::create(data, opts.data_store_options())?),
        Arc::new(FilePageStore::create(dropped, opts.dropped_store_options())?),
        Arc::new(MemHeap::new()),
        Arc::new(MemIndex::new()),
    );
    let vacuum = Vacuum::open(deps, opts)?;
    let mut reader = table.begin()?;
    reader.build_snapshot();
    for page in 0..3 {
        let mut tx = table.begin()?;
        let id = tx.assign_id();
        log.append_mvcc_op(
            MvccOpKind::HeapInsert,
            id,
            FileId(1),
            MvccOpPayload::Heap {
                page: PageId(page),
                slot: SlotId(0),
            },
        )?;
        tx.commit();
        log.advance_to_next_block()?;
    }
    vacuum.add_dropped_file(FileId(42))?;
    vacuum.run_until_idle()?;
    vacuum.stop()?;
    reader.commit();
    Ok(())
}

#[test]
fn json_output_lists_entries_and_dropped_files() {
    let (_dir, data, dropped) = setup_stores();
    let output = cargo_bin_cmd!("reclaim-inspect")
        .args(["--format", "json", "--dropped"])
        .arg(&dropped)
        .arg(&data)
        .assert()
        .success()
        .get_output()
        .stdout
        .clone();
    let json: Value = serde_json::from_slice(&output).expect("valid json");
    assert_eq!(json["live_entries"], 3);
    assert_eq!(json["first_blockid"], 0);
    assert_eq!(json["last_blockid"], 2);
    let entries = json["data_pages"][0]["entries"].as_array().expect("entries");
    assert_eq!(entries.len(), 3);
    assert_eq!(entries[1]["status"], "Available");
    let files = json["dropped"].as_array().expect("dropped files");
    assert_eq!(files.len(), 1);
    assert_eq!(files[0]["file"], 42);
}

#[test]
fn text_output_summarizes_stores() {
    let (_dir, data, _dropped) = setup_stores();
    let output = cargo_bin_cmd!("reclaim-inspect")
        .arg(&data)
        .assert()
        .success()
        .get_output()
        .stdout
        .clone();
    let text = String::from_utf8(output).expect("utf8");
    assert!(text.contains("live_entries=3"), "{text}");
    assert!(text.contains("block 2 Available"), "{text}");
    assert!(!text.contains("Dropped files"));
}

#[test]
fn missing_store_fails() {
    let dir = TempDir::new().expect("tempdir");
    cargo_bin_cmd!("reclaim-inspect")
        .arg(dir.path().join("nope.data"))
        .assert()
        .failure()
        .code(1);
}
