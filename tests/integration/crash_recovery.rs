#![allow(missing_docs)]

use std::sync::Arc;

use reclaim::admin::check_vacuumed;
use reclaim::log::{MemLog, MemLogOptions, MvccOpKind, MvccOpPayload};
use reclaim::mvcc::{MvccTable, RecordHeader};
use reclaim::primitives::pager::{MemPageStore, PageStore};
use reclaim::storage::{MemHeap, MemIndex};
use reclaim::types::{BlockId, FileId, Lsa, Mvccid, PageId, RecordLocation, Result, SlotId};
use reclaim::vacuum::data::page::BlockStatus;
use reclaim::vacuum::recovery::notify_server_crashed;
use reclaim::vacuum::redo::RedoStores;
use reclaim::vacuum::{Vacuum, VacuumDeps};
use reclaim::{MvccOptions, VacuumOptions};

/// Durable parts of a server: the log and the heap outlive a crash, the
/// vacuum stores only keep what they flushed.
struct Server {
    table: Arc<MvccTable>,
    log: Arc<MemLog>,
    heap: Arc<MemHeap>,
    index: Arc<MemIndex>,
    data_store: Arc<MemPageStore>,
    dropped_store: Arc<MemPageStore>,
    opts: VacuumOptions,
}

impl Server {
    fn new(page_size: u32) -> Result<Self> {
        let opts = VacuumOptions::default()
            .workers(1)
            .log_pages_per_block(4)
            .page_size(page_size);
        Ok(Self {
            table: MvccTable::new(MvccOptions::default()),
            log: Arc::new(MemLog::new(
                MemLogOptions::default().page_size(2048).pages_per_block(4),
            )?),
            heap: Arc::new(MemHeap::new()),
            index: Arc::new(MemIndex::new()),
            data_store: Arc::new(MemPageStore::new(opts.data_store_options())?),
            dropped_store: Arc::new(MemPageStore::new(opts.dropped_store_options())?),
            opts,
        })
    }

    fn deps(&self) -> VacuumDeps {
        VacuumDeps::new(
            self.table.clone(),
            self.log.clone(),
            self.data_store.clone(),
            self.dropped_store.clone(),
            self.heap.clone(),
            self.index.clone(),
        )
    }

    fn open(&self) -> Result<Vacuum> {
        Vacuum::open(self.deps(), self.opts.clone())
    }

    /// Loses the block summary queue and every unflushed vacuum page.
    /// Transactions do not survive either; ids restart after the last one
    /// handed out.
    fn crash(&mut self, vacuum: Vacuum) -> Result<()> {
        drop(vacuum);
        self.log.detach_block_queue();
        self.data_store = Arc::new(self.data_store.crash()?);
        self.dropped_store = Arc::new(self.dropped_store.crash()?);
        self.table = MvccTable::with_next_id(MvccOptions::default(), self.table.peek_next_id());
        Ok(())
    }

    fn recover(&self) -> Result<Vacuum> {
        Vacuum::open_after_crash(self.deps(), self.opts.clone(), Lsa::new(0, 0))
    }

    fn stores(&self) -> RedoStores<'_> {
        RedoStores {
            data: &*self.data_store,
            dropped: &*self.dropped_store,
            heap: Some(&*self.heap),
        }
    }

    /// One committed insert and one committed delete of `at`, then the
    /// block is sealed.
    fn churn_block(&self, at: RecordLocation) -> Result<Mvccid> {
        let mut tx = self.table.begin()?;
        let id = tx.assign_id();
        self.heap.insert(at, RecordHeader::inserted(id));
        self.log_heap(MvccOpKind::HeapInsert, id, at)?;
        tx.commit();

        let mut tx = self.table.begin()?;
        let id = tx.assign_id();
        self.heap.delete(at, id)?;
        self.log_heap(MvccOpKind::HeapDelete, id, at)?;
        tx.commit();
        self.log.advance_to_next_block()?;
        Ok(id)
    }

    fn log_heap(&self, kind: MvccOpKind, id: Mvccid, at: RecordLocation) -> Result<()> {
        self.log.append_mvcc_op(
            kind,
            id,
            at.file,
            MvccOpPayload::Heap {
                page: at.page,
                slot: at.slot,
            },
        )?;
        Ok(())
    }
}

fn loc(page: u64, slot: u16) -> RecordLocation {
    RecordLocation::new(FileId(1), PageId(page), SlotId(slot))
}

#[test]
fn summaries_lost_with_the_queue_are_rebuilt() -> Result<()> {
    let mut server = Server::new(4096)?;
    let vacuum = server.open()?;
    server.churn_block(loc(1, 0))?;
    server.log.append_filler_pages(2)?;
    assert_eq!(vacuum.run_until_idle()?, 1);

    // Blocks 1 and 2 only ever reach the in-memory queue.
    server.churn_block(loc(2, 0))?;
    server.churn_block(loc(3, 0))?;
    server.log.append_filler_pages(2)?;
    server.crash(vacuum)?;

    let vacuum = server.recover()?;
    let entries = vacuum.entries()?;
    let blocks: Vec<BlockId> = entries.iter().map(|e| e.blockid).collect();
    assert_eq!(blocks, vec![BlockId(1), BlockId(2)]);
    assert!(entries.iter().all(|e| e.status == BlockStatus::Available));

    assert_eq!(vacuum.run_until_idle()?, 2);
    assert_eq!(server.heap.get(loc(2, 0)), None);
    assert_eq!(server.heap.get(loc(3, 0)), None);
    check_vacuumed(server.heap.as_ref(), server.index.as_ref(), &vacuum).unwrap();
    Ok(())
}

#[test]
fn nothing_flushed_is_rebuilt_from_the_log() -> Result<()> {
    let mut server = Server::new(4096)?;
    let vacuum = server.open()?;
    let last = server.churn_block(loc(1, 0))?;
    server.log.append_filler_pages(2)?;
    server.crash(vacuum)?;
    assert_eq!(server.data_store.used_pages(), 0);

    let report = notify_server_crashed(server.log.as_ref(), server.stores(), Lsa::new(0, 0))?;
    assert!(report.applied > 0);

    let vacuum = server.recover()?;
    assert_eq!(vacuum.entries()?.len(), 1);
    assert!(!vacuum.is_mvccid_vacuumed(last));
    vacuum.run_until_idle()?;
    assert!(vacuum.is_mvccid_vacuumed(last));
    Ok(())
}

#[test]
fn replay_twice_changes_nothing() -> Result<()> {
    let mut server = Server::new(4096)?;
    let vacuum = server.open()?;
    for page in 0..3 {
        server.churn_block(loc(page, 0))?;
    }
    server.log.append_filler_pages(2)?;
    vacuum.run_until_idle()?;
    server.crash(vacuum)?;

    let first = notify_server_crashed(server.log.as_ref(), server.stores(), Lsa::new(0, 0))?;
    assert_eq!(first.applied, 0);
    let second = notify_server_crashed(server.log.as_ref(), server.stores(), Lsa::new(0, 0))?;
    assert_eq!(second, first);

    let vacuum = server.recover()?;
    assert!(vacuum.entries()?.is_empty());
    assert_eq!(vacuum.first_log_page_to_keep()?, 12);
    Ok(())
}

#[test]
fn grown_chain_survives_crash() -> Result<()> {
    // 256-byte pages hold four entries each.
    let mut server = Server::new(256)?;
    let vacuum = server.open()?;
    let mut reader = server.table.begin()?;
    reader.build_snapshot();
    for page in 0..10 {
        server.churn_block(loc(page, 0))?;
    }
    server.log.append_filler_pages(2)?;
    assert_eq!(vacuum.run_until_idle()?, 0);
    assert_eq!(vacuum.stats()?.data_pages, 3);
    server.crash(vacuum)?;
    drop(reader);

    let vacuum = server.recover()?;
    assert_eq!(vacuum.entries()?.len(), 10);
    assert_eq!(vacuum.run_until_idle()?, 10);
    let stats = vacuum.stats()?;
    assert_eq!(stats.live_entries, 0);
    assert_eq!(stats.data_pages, 1);
    assert_eq!(server.heap.len(FileId(1)), 0);
    Ok(())
}

#[test]
fn dropped_files_survive_crash() -> Result<()> {
    let mut server = Server::new(4096)?;
    let vacuum = server.open()?;
    server.churn_block(loc(1, 0))?;
    vacuum.add_dropped_file(FileId(7))?;
    let dropped_at = server.table.peek_next_id();
    server.crash(vacuum)?;

    let vacuum = server.recover()?;
    let dropped = vacuum.dropped_files()?;
    assert_eq!(dropped.len(), 1);
    assert_eq!(dropped[0].file, FileId(7));
    assert_eq!(dropped[0].mvccid, dropped_at);
    assert!(vacuum.is_file_dropped(FileId(7), Mvccid(1))?);
    Ok(())
}
