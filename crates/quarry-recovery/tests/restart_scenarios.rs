//! End-to-end recovery scenarios: forward processing, crash, restart.

use std::sync::Arc;

use quarry_pager::{DiskManager, MemDiskManager, MemPageCache, PageCache};
use quarry_recovery::{RecoveryManager, Transaction};
use quarry_types::{Lsn, PageId, TxnId, TxnStatus};
use quarry_wal::{LogRecord, LogStore, MemLogStore};

struct Engine {
    log: Arc<MemLogStore>,
    disk: Arc<MemDiskManager>,
    cache: Arc<MemPageCache>,
    rm: Arc<RecoveryManager>,
}

fn wire(
    log: &Arc<MemLogStore>,
    disk: &Arc<MemDiskManager>,
    cache: &Arc<MemPageCache>,
) -> Arc<RecoveryManager> {
    let rm = Arc::new(RecoveryManager::new(
        Arc::clone(log) as Arc<dyn LogStore>,
        Box::new(Transaction::new),
    ));
    rm.set_managers(
        Arc::clone(disk) as Arc<dyn DiskManager>,
        Arc::clone(cache) as Arc<dyn PageCache>,
    );
    let hook = Arc::clone(&rm);
    cache.set_flush_hook(Arc::new(move |lsn| hook.page_flush_hook(lsn)));
    let hook = Arc::clone(&rm);
    cache.set_io_hook(Arc::new(move |page| hook.disk_io_hook(page)));
    rm
}

fn boot() -> Engine {
    let log = Arc::new(MemLogStore::new());
    let disk = Arc::new(MemDiskManager::new());
    disk.alloc_part(1).unwrap();
    let cache = Arc::new(MemPageCache::new());
    let rm = wire(&log, &disk, &cache);
    rm.initialize().unwrap();
    Engine {
        log,
        disk,
        cache,
        rm,
    }
}

impl Engine {
    fn begin(&self, num: u64) -> TxnId {
        let txn = Transaction::new(TxnId::new(num));
        let id = txn.num();
        self.rm.start_transaction(txn);
        id
    }

    /// Log a page write and apply it to the buffered page, as the table
    /// layer would.
    fn write(&self, txn: TxnId, page: PageId, offset: u16, before: &[u8], after: &[u8]) -> Lsn {
        let lsn = self
            .rm
            .log_page_write(txn, page, offset, before, after)
            .unwrap();
        self.cache
            .with_page(page, &mut |frame| {
                frame.write(usize::from(offset), after);
                frame.set_page_lsn(lsn);
            })
            .unwrap();
        lsn
    }

    fn read(&self, page: PageId, offset: usize, len: usize) -> Vec<u8> {
        let mut out = Vec::new();
        self.cache
            .with_page(page, &mut |frame| out = frame.read(offset, len).to_vec())
            .unwrap();
        out
    }

    /// Lose all volatile state, then boot a fresh recovery manager over the
    /// surviving log and disk and run restart.
    fn crash_and_restart(self) -> Engine {
        self.log.crash();
        self.cache.crash();
        let rm = wire(&self.log, &self.disk, &self.cache);
        rm.restart().unwrap();
        Engine { rm, ..self }
    }

    fn records_of(&self, txn: TxnId) -> Vec<LogRecord> {
        self.log
            .scan_from(Lsn::ZERO)
            .map(|(_, record)| record)
            .filter(|record| record.txn_id() == Some(txn))
            .collect()
    }
}

#[test]
fn committed_transaction_replays_after_crash() {
    let engine = boot();
    let t1 = engine.begin(1);
    let page = PageId::new(1, 5);
    engine.write(t1, page, 0, &[0; 4], b"bbbb");
    engine.rm.commit(t1).unwrap();

    let engine = engine.crash_and_restart();

    assert_eq!(engine.read(page, 0, 4), b"bbbb", "redo replays the commit");
    assert!(engine.rm.transactions().is_empty(), "analysis finished txn 1");
    let records = engine.records_of(t1);
    assert!(
        matches!(records.last(), Some(LogRecord::End { .. })),
        "an END record terminates the chain"
    );
    assert!(
        !records.iter().any(|r| matches!(r, LogRecord::UndoUpdatePage { .. })),
        "nothing was undone"
    );
}

#[test]
fn uncommitted_update_is_undone_at_restart() {
    let engine = boot();
    let t2 = engine.begin(2);
    let page = PageId::new(1, 7);
    let update_lsn = engine.write(t2, page, 0, &[0; 3], &[7, 7, 7]);
    // The update record reached the log device, but no commit did.
    engine.rm.flush_to_lsn(update_lsn);

    let engine = engine.crash_and_restart();

    assert_eq!(engine.read(page, 0, 3), [0, 0, 0], "before-image restored");
    assert!(engine.rm.transactions().is_empty());

    let records = engine.records_of(t2);
    let kinds: Vec<&LogRecord> = records.iter().collect();
    assert!(matches!(kinds[0], LogRecord::UpdatePage { .. }));
    assert!(matches!(kinds[1], LogRecord::Abort { .. }), "analysis aborts the loser");
    let LogRecord::UndoUpdatePage {
        after,
        undo_next_lsn,
        ..
    } = kinds[2]
    else {
        panic!("expected a CLR, got {:?}", kinds[2]);
    };
    assert_eq!(after, &[0, 0, 0]);
    assert_eq!(
        *undo_next_lsn,
        Lsn::ZERO,
        "the CLR compensates the transaction's first record"
    );
    assert!(matches!(kinds[3], LogRecord::End { .. }));
    assert_eq!(kinds.len(), 4);
}

#[test]
fn checkpoint_bounds_the_restart_scan() {
    let engine = boot();
    let t3 = engine.begin(3);
    let pages: Vec<PageId> = (0..4).map(|i| PageId::new(1, 10 + i)).collect();
    for i in 0..100_u16 {
        let page = pages[usize::from(i) % 4];
        let offset = (i / 4) * 4;
        engine.write(t3, page, offset, &[0; 4], &[u8::try_from(i % 250).unwrap() + 1; 4]);
    }
    engine.rm.checkpoint().unwrap();
    let LogRecord::Master { last_checkpoint_lsn: installed } =
        engine.log.fetch(Lsn::ZERO).unwrap()
    else {
        panic!("no master record");
    };
    assert!(!installed.is_zero(), "checkpoint was installed");

    let engine = engine.crash_and_restart();

    // The loser's 100 updates are all compensated even though analysis
    // started at the checkpoint: the prevLSN chain reaches behind it.
    for i in 0..100_u16 {
        let page = pages[usize::from(i) % 4];
        let offset = usize::from(i / 4) * 4;
        assert_eq!(engine.read(page, offset, 4), [0, 0, 0, 0], "update {i} undone");
    }
    assert!(engine.rm.transactions().is_empty());

    let clrs = engine
        .records_of(t3)
        .iter()
        .filter(|r| matches!(r, LogRecord::UndoUpdatePage { .. }))
        .count();
    assert_eq!(clrs, 100);

    let LogRecord::Master { last_checkpoint_lsn } = engine.log.fetch(Lsn::ZERO).unwrap() else {
        panic!("no master record");
    };
    assert!(last_checkpoint_lsn > installed, "restart takes a fresh checkpoint");
}

#[test]
fn rollback_to_savepoint_keeps_earlier_work() {
    let engine = boot();
    let t4 = engine.begin(4);
    let page = PageId::new(1, 3);
    engine.write(t4, page, 0, &[0; 2], &[1, 1]);
    engine.rm.savepoint(t4, "s").unwrap();
    engine.write(t4, page, 8, &[0; 2], &[2, 2]);
    engine.write(t4, page, 16, &[0; 2], &[3, 3]);

    engine.rm.rollback_to_savepoint(t4, "s").unwrap();

    assert_eq!(engine.read(page, 0, 2), [1, 1], "work before the savepoint survives");
    assert_eq!(engine.read(page, 8, 2), [0, 0]);
    assert_eq!(engine.read(page, 16, 2), [0, 0]);

    let records = engine.records_of(t4);
    let clrs: Vec<&LogRecord> = records
        .iter()
        .filter(|r| matches!(r, LogRecord::UndoUpdatePage { .. }))
        .collect();
    assert_eq!(clrs.len(), 2, "exactly the two post-savepoint updates are undone");

    let (status, last_lsn) = engine.rm.transactions()[&t4];
    assert_eq!(status, TxnStatus::Running, "partial rollback leaves the txn running");
    assert_eq!(
        Some(last_lsn),
        engine
            .log
            .scan_from(Lsn::ZERO)
            .filter(|(_, r)| r.txn_id() == Some(t4))
            .map(|(lsn, _)| lsn)
            .max(),
        "lastLSN is the final CLR"
    );

    // The transaction keeps running and can commit.
    engine.rm.commit(t4).unwrap();
    engine.rm.end(t4).unwrap();
}

#[test]
fn abort_rolls_back_every_record_including_the_first() {
    let engine = boot();
    let t5 = engine.begin(5);
    let page = PageId::new(1, 8);
    engine.write(t5, page, 0, &[0; 2], &[5, 5]);
    engine.write(t5, page, 4, &[0; 2], &[6, 6]);

    engine.rm.abort(t5).unwrap();
    engine.rm.end(t5).unwrap();

    assert_eq!(engine.read(page, 0, 2), [0, 0], "first record is undone too");
    assert_eq!(engine.read(page, 4, 2), [0, 0]);
    assert!(engine.rm.transactions().is_empty());

    let records = engine.records_of(t5);
    let clrs = records
        .iter()
        .filter(|r| matches!(r, LogRecord::UndoUpdatePage { .. }))
        .count();
    assert_eq!(clrs, 2);
    assert!(matches!(records.last(), Some(LogRecord::End { .. })));
}

#[test]
fn restart_twice_converges_to_the_same_state() {
    let engine = boot();
    let t1 = engine.begin(1);
    let committed_page = PageId::new(1, 2);
    engine.write(t1, committed_page, 0, &[0; 2], &[9, 9]);
    engine.rm.commit(t1).unwrap();

    let t2 = engine.begin(2);
    let loser_page = PageId::new(1, 4);
    let lsn = engine.write(t2, loser_page, 0, &[0; 2], &[4, 4]);
    engine.rm.flush_to_lsn(lsn);

    let engine = engine.crash_and_restart();
    let dpt_first = engine.rm.dirty_page_table();
    let txns_first = engine.rm.transactions();
    let committed_first = engine.read(committed_page, 0, 2);
    let loser_first = engine.read(loser_page, 0, 2);

    // Boot again over the same log, no crash in between.
    let rm = wire(&engine.log, &engine.disk, &engine.cache);
    rm.restart().unwrap();

    assert_eq!(rm.dirty_page_table(), dpt_first);
    assert_eq!(rm.transactions(), txns_first);
    assert!(txns_first.is_empty());
    assert_eq!(engine.read(committed_page, 0, 2), committed_first);
    assert_eq!(engine.read(loser_page, 0, 2), loser_first);
    assert_eq!(committed_first, [9, 9]);
    assert_eq!(loser_first, [0, 0]);
}

#[test]
fn allocation_survives_crash_and_replays() {
    let engine = boot();
    let t6 = engine.begin(6);
    engine.rm.log_alloc_part(t6, 2).unwrap().unwrap();
    engine.disk.alloc_part(2).unwrap();
    let page = PageId::new(2, 0);
    engine.rm.log_alloc_page(t6, page).unwrap().unwrap();
    engine.disk.alloc_page(page).unwrap();
    engine.write(t6, page, 0, &[0; 2], &[8, 8]);
    engine.rm.commit(t6).unwrap();

    let engine = engine.crash_and_restart();

    assert!(engine.disk.part_exists(2));
    assert!(engine.disk.page_exists(page));
    assert_eq!(engine.read(page, 0, 2), [8, 8]);
}

#[test]
fn aborted_page_free_is_reallocated() {
    let engine = boot();
    let setup = engine.begin(7);
    let page = PageId::new(1, 30);
    engine.rm.log_alloc_page(setup, page).unwrap().unwrap();
    engine.disk.alloc_page(page).unwrap();
    engine.rm.commit(setup).unwrap();
    engine.rm.end(setup).unwrap();

    let t8 = engine.begin(8);
    engine.rm.log_free_page(t8, page).unwrap().unwrap();
    engine.disk.free_page(page).unwrap();
    engine.cache.discard(page);
    assert!(!engine.disk.page_exists(page));

    engine.rm.abort(t8).unwrap();
    engine.rm.end(t8).unwrap();

    assert!(engine.disk.page_exists(page), "undo re-allocates the freed page");
    assert!(engine.rm.transactions().is_empty());
}

#[test]
fn prev_lsn_chains_strictly_decrease() {
    let engine = boot();
    let t1 = engine.begin(1);
    let page = PageId::new(1, 6);
    engine.write(t1, page, 0, &[0; 2], &[1, 1]);
    engine.write(t1, page, 4, &[0; 2], &[2, 2]);
    engine.rm.abort(t1).unwrap();
    engine.rm.end(t1).unwrap();
    engine.rm.checkpoint().unwrap();

    for (lsn, record) in engine.log.scan_from(Lsn::ZERO) {
        if let Some(prev) = record.prev_lsn() {
            assert!(prev < lsn, "prevLSN {prev} of record at {lsn} must be older");
        }
        if let Some(undo_next) = record.undo_next_lsn() {
            assert!(undo_next < lsn, "undoNextLSN points backwards");
        }
    }
}

#[test]
fn flushed_pages_leave_the_dpt_after_restart() {
    let engine = boot();
    let t9 = engine.begin(9);
    let flushed = PageId::new(1, 40);
    let dirty = PageId::new(1, 41);
    engine.write(t9, flushed, 0, &[0; 2], &[1, 2]);
    engine.write(t9, dirty, 0, &[0; 2], &[3, 4]);
    engine.rm.commit(t9).unwrap();
    engine.rm.end(t9).unwrap();

    // One page reaches disk (forcing the log first), the other stays dirty.
    engine.cache.flush_page(flushed);

    let engine = engine.crash_and_restart();

    let dpt = engine.rm.dirty_page_table();
    assert!(
        !dpt.contains_key(&flushed),
        "clean pages are dropped between redo and undo"
    );
    assert!(dpt.contains_key(&dirty), "redo re-dirtied the stale page");
    assert_eq!(engine.read(flushed, 0, 2), [1, 2]);
    assert_eq!(engine.read(dirty, 0, 2), [3, 4]);
}
