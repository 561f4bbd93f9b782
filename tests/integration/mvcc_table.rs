#![allow(missing_docs)]

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Barrier};
use std::thread;

use rand::Rng;
use reclaim::mvcc::{
    is_not_deleted_for_snapshot, is_record_removable, satisfies_delete, satisfies_snapshot,
    DeleteVisibility, MvccTable, RecordHeader, SnapshotVisibility, VacuumDecision,
};
use reclaim::types::{Mvccid, Result};
use reclaim::{MvccOptions, ReclaimError};

#[test]
fn threshold_never_passes_an_id_a_reader_treats_as_active() {
    const WRITERS: usize = 4;
    const READERS: usize = 4;
    let table = MvccTable::new(MvccOptions::default().bitmap_high_water_units(4));
    let stop = Arc::new(AtomicBool::new(false));
    let start = Arc::new(Barrier::new(WRITERS + READERS));

    let mut handles = Vec::new();
    for _ in 0..WRITERS {
        let table = Arc::clone(&table);
        let stop = Arc::clone(&stop);
        let start = Arc::clone(&start);
        handles.push(thread::spawn(move || {
            let mut rng = rand::thread_rng();
            start.wait();
            while !stop.load(Ordering::Relaxed) {
                let mut tx = table.begin().unwrap();
                tx.assign_id();
                if rng.gen_bool(0.2) {
                    tx.begin_sub();
                }
                if rng.gen_bool(0.9) {
                    tx.commit();
                } else {
                    tx.rollback();
                }
            }
        }));
    }
    for _ in 0..READERS {
        let table = Arc::clone(&table);
        let start = Arc::clone(&start);
        handles.push(thread::spawn(move || {
            start.wait();
            let mut last = Mvccid::NULL;
            for _ in 0..2_000 {
                let mut reader = table.begin().unwrap();
                let snapshot = reader.build_snapshot().clone();
                for _ in 0..4 {
                    let oldest = table.update_global_oldest_visible();
                    assert!(oldest >= last, "threshold went back");
                    last = oldest;
                    let from = oldest.0.saturating_sub(128).max(1);
                    for id in from..oldest.0 {
                        assert!(
                            !snapshot.is_active(Mvccid(id)),
                            "id {id} below threshold {} is active for a live reader",
                            oldest.0
                        );
                    }
                    thread::yield_now();
                }
                reader.commit();
            }
        }));
    }

    for handle in handles.drain(WRITERS..) {
        handle.join().unwrap();
    }
    stop.store(true, Ordering::Relaxed);
    for handle in handles {
        handle.join().unwrap();
    }
    let stats = table.stats();
    assert_eq!(stats.live_transactions, 0);
    assert_eq!(table.update_global_oldest_visible(), stats.next_id);
}

#[test]
fn reader_isolation_across_commit() -> Result<()> {
    let table = MvccTable::new(MvccOptions::default());
    let mut writer = table.begin()?;
    let ins = writer.assign_id();
    let header = RecordHeader::inserted(ins);

    let mut before = table.begin()?;
    let early = before.build_snapshot().clone();
    assert_eq!(
        satisfies_snapshot(&header, &early, &[]),
        SnapshotVisibility::TooNew
    );
    assert_eq!(
        satisfies_snapshot(&header, &early, &writer.own_ids()),
        SnapshotVisibility::Satisfied
    );
    assert_eq!(
        satisfies_delete(&header, &[], |id| table.is_active(id)),
        DeleteVisibility::InsertInProgress
    );
    writer.commit();

    let mut after = table.begin()?;
    let late = after.build_snapshot().clone();
    assert_eq!(
        satisfies_snapshot(&header, &late, &[]),
        SnapshotVisibility::Satisfied
    );
    // The old snapshot keeps its view after the commit.
    assert_eq!(
        satisfies_snapshot(&header, &early, &[]),
        SnapshotVisibility::TooNew
    );

    let mut deleter = table.begin()?;
    let del = deleter.assign_id();
    let deleted = header.deleted_by(del);
    assert!(is_not_deleted_for_snapshot(&deleted, &late, &[]));
    assert!(!is_not_deleted_for_snapshot(&deleted, &late, &[del]));
    assert_eq!(
        satisfies_delete(&deleted, &[], |id| table.is_active(id)),
        DeleteVisibility::DeleteInProgress
    );
    deleter.commit();
    assert_eq!(
        satisfies_delete(&deleted, &[], |id| table.is_active(id)),
        DeleteVisibility::Deleted
    );

    // Both readers still pin the threshold at or below the inserter.
    assert!(table.update_global_oldest_visible() <= ins);
    before.commit();
    after.commit();
    let oldest = table.update_global_oldest_visible();
    assert_eq!(is_record_removable(&deleted, oldest), VacuumDecision::Remove);
    Ok(())
}

#[test]
fn long_transaction_holds_threshold_past_window() -> Result<()> {
    let table = MvccTable::new(MvccOptions::default().bitmap_high_water_units(2));
    let mut long = table.begin()?;
    let held = long.assign_id();
    for _ in 0..1_000 {
        let mut tx = table.begin()?;
        tx.assign_id();
        tx.commit();
    }
    assert!(table.is_active(held));
    assert!(table.stats().long_transactions >= 1);
    assert_eq!(table.update_global_oldest_visible(), held);

    long.commit();
    assert!(!table.is_active(held));
    assert_eq!(table.update_global_oldest_visible(), table.peek_next_id());
    Ok(())
}

#[test]
fn table_full_is_reported() -> Result<()> {
    let table = MvccTable::new(MvccOptions::default().max_transactions(2));
    let a = table.begin()?;
    let b = table.begin()?;
    assert!(matches!(table.begin(), Err(ReclaimError::OutOfSpace(_))));
    drop(a);
    let c = table.begin()?;
    drop(b);
    drop(c);
    assert_eq!(table.stats().live_transactions, 0);
    Ok(())
}
