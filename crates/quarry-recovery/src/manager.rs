//! Forward processing: logging, rollback, and checkpoints.

use std::collections::{BTreeMap, HashMap};
use std::mem;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::OnceLock;

use parking_lot::Mutex;
use quarry_error::{QuarryError, Result};
use quarry_pager::{DiskManager, PageCache};
use quarry_types::limits::MAX_UPDATE_BYTES;
use quarry_types::{LOG_PARTITION, Lsn, PageId, PartId, TxnId, TxnStatus};
use quarry_wal::{LogRecord, LogStore, fits_in_one_record};
use tracing::{debug, info};

use crate::txn::{Transaction, TransactionTableEntry};

/// Factory re-creating transaction handles found only in the log during
/// restart analysis.
pub type TxnFactory = Box<dyn Fn(TxnId) -> Arc<Transaction> + Send + Sync>;

/// The ARIES recovery manager.
///
/// Constructed bare and wired to the storage collaborators afterwards: the
/// buffer pool needs the recovery manager for its eviction hooks while the
/// recovery manager needs the buffer pool for redo, so one of the two
/// references arrives through [`RecoveryManager::set_managers`].
pub struct RecoveryManager {
    pub(crate) log: Arc<dyn LogStore>,
    pub(crate) new_txn: TxnFactory,
    disk: OnceLock<Arc<dyn DiskManager>>,
    cache: OnceLock<Arc<dyn PageCache>>,
    /// Dirty page table: page -> recLSN.
    pub(crate) dirty_pages: Mutex<HashMap<PageId, Lsn>>,
    /// Transaction table: txn -> entry.
    pub(crate) txn_table: Mutex<HashMap<TxnId, TransactionTableEntry>>,
    /// Set once restart's redo phase finishes; gates DPT eviction updates.
    pub(crate) redo_complete: AtomicBool,
    /// Serializes `start_transaction` and `checkpoint` so checkpoint
    /// snapshots see a consistent transaction table.
    meta: Mutex<()>,
}

impl RecoveryManager {
    #[must_use]
    pub fn new(log: Arc<dyn LogStore>, new_txn: TxnFactory) -> Self {
        Self {
            log,
            new_txn,
            disk: OnceLock::new(),
            cache: OnceLock::new(),
            dirty_pages: Mutex::new(HashMap::new()),
            txn_table: Mutex::new(HashMap::new()),
            redo_complete: AtomicBool::new(false),
            meta: Mutex::new(()),
        }
    }

    /// Wire the storage collaborators. Must be called exactly once, before
    /// any logging or restart.
    pub fn set_managers(&self, disk: Arc<dyn DiskManager>, cache: Arc<dyn PageCache>) {
        assert!(self.disk.set(disk).is_ok(), "set_managers called twice");
        assert!(self.cache.set(cache).is_ok(), "set_managers called twice");
    }

    pub(crate) fn disk(&self) -> &Arc<dyn DiskManager> {
        self.disk.get().expect("set_managers before use")
    }

    pub(crate) fn cache(&self) -> &Arc<dyn PageCache> {
        self.cache.get().expect("set_managers before use")
    }

    /// First-time database setup: write the master record and take an
    /// initial checkpoint.
    pub fn initialize(&self) -> Result<()> {
        self.log.append(LogRecord::Master {
            last_checkpoint_lsn: Lsn::ZERO,
        });
        self.checkpoint()
    }

    // -----------------------------------------------------------------------
    // Forward processing
    // -----------------------------------------------------------------------

    /// Register a new transaction in the transaction table.
    pub fn start_transaction(&self, txn: Arc<Transaction>) {
        let _meta = self.meta.lock();
        self.txn_table
            .lock()
            .insert(txn.num(), TransactionTableEntry::new(txn));
    }

    /// Begin committing: append COMMIT, flush through it.
    pub fn commit(&self, txn: TxnId) -> Result<Lsn> {
        let lsn = {
            let mut table = self.txn_table.lock();
            let entry = entry_mut(&mut table, txn)?;
            entry.txn.transition(TxnStatus::Committing)?;
            let lsn = self.log.append(LogRecord::Commit {
                txn,
                prev_lsn: entry.last_lsn,
            });
            entry.last_lsn = lsn;
            lsn
        };
        self.log.flush_to(lsn);
        Ok(lsn)
    }

    /// Begin aborting: append ABORT. No rollback happens here; the work is
    /// done at [`RecoveryManager::end`].
    pub fn abort(&self, txn: TxnId) -> Result<Lsn> {
        let mut table = self.txn_table.lock();
        let entry = entry_mut(&mut table, txn)?;
        entry.txn.transition(TxnStatus::Aborting)?;
        let lsn = self.log.append(LogRecord::Abort {
            txn,
            prev_lsn: entry.last_lsn,
        });
        entry.last_lsn = lsn;
        Ok(lsn)
    }

    /// Finish a transaction: roll back if aborting, append END, drop the
    /// table entry.
    pub fn end(&self, txn: TxnId) -> Result<Lsn> {
        let status = {
            let table = self.txn_table.lock();
            entry_ref(&table, txn)?.txn.status()
        };
        if status == TxnStatus::Aborting {
            self.rollback_to_lsn(txn, Lsn::ZERO)?;
        }

        let mut table = self.txn_table.lock();
        let entry = entry_mut(&mut table, txn)?;
        let lsn = self.log.append(LogRecord::End {
            txn,
            prev_lsn: entry.last_lsn,
        });
        entry.last_lsn = lsn;
        entry.txn.transition(TxnStatus::Complete)?;
        table.remove(&txn);
        Ok(lsn)
    }

    /// Log a page write. Called before the buffered page changes; never
    /// called on a log page.
    pub fn log_page_write(
        &self,
        txn: TxnId,
        page: PageId,
        offset: u16,
        before: &[u8],
        after: &[u8],
    ) -> Result<Lsn> {
        assert_eq!(before.len(), after.len(), "before/after images must match");
        assert!(before.len() <= MAX_UPDATE_BYTES, "update image too large");
        assert!(!page.is_log_page(), "page writes are never logged for the log");

        let mut table = self.txn_table.lock();
        let entry = entry_mut(&mut table, txn)?;
        let lsn = self.log.append(LogRecord::UpdatePage {
            txn,
            page,
            prev_lsn: entry.last_lsn,
            offset,
            before: before.to_vec(),
            after: after.to_vec(),
        });
        entry.last_lsn = lsn;
        drop(table);

        self.dirty_pages.lock().entry(page).or_insert(lsn);
        Ok(lsn)
    }

    /// Log a partition allocation. Flushes: the change is visible on disk
    /// the moment the disk manager returns. `None` for the log partition.
    pub fn log_alloc_part(&self, txn: TxnId, part: PartId) -> Result<Option<Lsn>> {
        if part == LOG_PARTITION {
            return Ok(None);
        }
        self.log_flushed(txn, |prev_lsn| LogRecord::AllocPart { txn, part, prev_lsn })
            .map(Some)
    }

    /// Log a partition free. Flushes. `None` for the log partition.
    pub fn log_free_part(&self, txn: TxnId, part: PartId) -> Result<Option<Lsn>> {
        if part == LOG_PARTITION {
            return Ok(None);
        }
        self.log_flushed(txn, |prev_lsn| LogRecord::FreePart { txn, part, prev_lsn })
            .map(Some)
    }

    /// Log a page allocation. Flushes. `None` for pages of the log
    /// partition.
    pub fn log_alloc_page(&self, txn: TxnId, page: PageId) -> Result<Option<Lsn>> {
        if page.is_log_page() {
            return Ok(None);
        }
        self.log_flushed(txn, |prev_lsn| LogRecord::AllocPage { txn, page, prev_lsn })
            .map(Some)
    }

    /// Log a page free. Flushes, and drops the page from the DPT: the page
    /// is gone from disk, there is nothing left to redo onto it.
    pub fn log_free_page(&self, txn: TxnId, page: PageId) -> Result<Option<Lsn>> {
        if page.is_log_page() {
            return Ok(None);
        }
        let lsn = self.log_flushed(txn, |prev_lsn| LogRecord::FreePage { txn, page, prev_lsn })?;
        self.dirty_pages.lock().remove(&page);
        Ok(Some(lsn))
    }

    fn log_flushed(&self, txn: TxnId, build: impl FnOnce(Lsn) -> LogRecord) -> Result<Lsn> {
        let lsn = {
            let mut table = self.txn_table.lock();
            let entry = entry_mut(&mut table, txn)?;
            let lsn = self.log.append(build(entry.last_lsn));
            entry.last_lsn = lsn;
            lsn
        };
        self.log.flush_to(lsn);
        Ok(lsn)
    }

    /// Record a savepoint at the transaction's current lastLSN.
    pub fn savepoint(&self, txn: TxnId, name: &str) -> Result<()> {
        let mut table = self.txn_table.lock();
        entry_mut(&mut table, txn)?.add_savepoint(name);
        Ok(())
    }

    /// Delete a savepoint.
    pub fn release_savepoint(&self, txn: TxnId, name: &str) -> Result<()> {
        let mut table = self.txn_table.lock();
        entry_mut(&mut table, txn)?.delete_savepoint(name);
        Ok(())
    }

    /// Undo everything the transaction did after the named savepoint, in
    /// reverse order, logging CLRs. The status is unchanged.
    pub fn rollback_to_savepoint(&self, txn: TxnId, name: &str) -> Result<()> {
        let target = {
            let table = self.txn_table.lock();
            entry_ref(&table, txn)?.savepoint(name)?
        };
        self.rollback_to_lsn(txn, target)
    }

    /// Establish a page's recLSN.
    ///
    /// Insert-or-min: a later record can race an earlier one to the first
    /// insertion, so an existing entry is lowered rather than kept.
    pub fn dirty_page(&self, page: PageId, lsn: Lsn) {
        let mut dpt = self.dirty_pages.lock();
        let rec_lsn = dpt.entry(page).or_insert(lsn);
        *rec_lsn = (*rec_lsn).min(lsn);
    }

    /// Write-ahead rule: called before a dirty page leaves the buffer pool.
    pub fn page_flush_hook(&self, page_lsn: Lsn) {
        self.log.flush_to(page_lsn);
    }

    /// Called after a page's image reaches disk. Once redo has finished,
    /// the page is clean and leaves the DPT.
    pub fn disk_io_hook(&self, page: PageId) {
        if self.redo_complete.load(Ordering::Acquire) {
            self.dirty_pages.lock().remove(&page);
        }
    }

    /// Flush the log through `lsn`.
    pub fn flush_to_lsn(&self, lsn: Lsn) {
        self.log.flush_to(lsn);
    }

    /// Orderly shutdown: one final checkpoint.
    pub fn close(&self) -> Result<()> {
        self.checkpoint()
    }

    // -----------------------------------------------------------------------
    // Rollback
    // -----------------------------------------------------------------------

    /// Undo the transaction's records back to (but not including) `target`.
    ///
    /// Walks the prevLSN chain from the transaction's lastLSN. Each
    /// undoable record yields a CLR, which is appended and then redone to
    /// perform the undo in place. If the chain's head is already a CLR its
    /// `undo_next_lsn` skips everything that was previously undone.
    pub(crate) fn rollback_to_lsn(&self, txn: TxnId, target: Lsn) -> Result<()> {
        let mut last_lsn = {
            let table = self.txn_table.lock();
            entry_ref(&table, txn)?.last_lsn
        };
        let head = self.log.fetch(last_lsn)?;
        let mut cursor = head.undo_next_lsn().unwrap_or(last_lsn);

        while cursor > target {
            let record = self.log.fetch(cursor)?;
            if let Some(clr) = record.undo(last_lsn) {
                let clr_lsn = self.log.append(clr.clone());
                clr.redo(clr_lsn, self.disk().as_ref(), self.cache().as_ref())?;
                let mut table = self.txn_table.lock();
                entry_mut(&mut table, txn)?.last_lsn = clr_lsn;
                last_lsn = clr_lsn;
            }
            cursor = record.prev_lsn().unwrap_or(Lsn::ZERO);
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Checkpointing
    // -----------------------------------------------------------------------

    /// Take a fuzzy checkpoint.
    ///
    /// BEGIN_CHECKPOINT, then END_CHECKPOINT records filled with DPT
    /// entries first and transaction-table entries second, split whenever
    /// the next insertion would no longer fit in one record. The master
    /// record rewrite is the atomic install; a crash before it reverts to
    /// the previous checkpoint.
    pub fn checkpoint(&self) -> Result<()> {
        let _meta = self.meta.lock();
        let begin_lsn = self.log.append(LogRecord::BeginCheckpoint);

        let dpt_snapshot: Vec<(PageId, Lsn)> = {
            let dpt = self.dirty_pages.lock();
            dpt.iter().map(|(page, lsn)| (*page, *lsn)).collect()
        };
        let txn_snapshot: Vec<(TxnId, (TxnStatus, Lsn))> = {
            let table = self.txn_table.lock();
            table
                .iter()
                .map(|(txn, entry)| (*txn, (entry.txn.status(), entry.last_lsn)))
                .collect()
        };

        let mut chunk_dpt = BTreeMap::new();
        let mut chunk_txns = BTreeMap::new();
        let mut chunks = 0_u32;

        for (page, rec_lsn) in dpt_snapshot {
            // Peek first: emit the chunk while the entry in hand still fits
            // in the next one, so nothing is ever skipped.
            if !fits_in_one_record(chunk_dpt.len() + 1, chunk_txns.len()) {
                self.emit_end_checkpoint(&mut chunk_dpt, &mut chunk_txns);
                chunks += 1;
            }
            chunk_dpt.insert(page, rec_lsn);
        }
        for (txn, snapshot) in txn_snapshot {
            if !fits_in_one_record(chunk_dpt.len(), chunk_txns.len() + 1) {
                self.emit_end_checkpoint(&mut chunk_dpt, &mut chunk_txns);
                chunks += 1;
            }
            chunk_txns.insert(txn, snapshot);
        }

        let end_lsn = self.log.append(LogRecord::EndCheckpoint {
            dirty_pages: chunk_dpt,
            txn_table: chunk_txns,
        });
        self.log.flush_to(end_lsn);
        self.log.rewrite_master(LogRecord::Master {
            last_checkpoint_lsn: begin_lsn,
        })?;
        info!(begin_lsn = %begin_lsn, end_lsn = %end_lsn, chunks = chunks + 1, "checkpoint installed");
        Ok(())
    }

    fn emit_end_checkpoint(
        &self,
        dpt: &mut BTreeMap<PageId, Lsn>,
        txns: &mut BTreeMap<TxnId, (TxnStatus, Lsn)>,
    ) {
        let lsn = self.log.append(LogRecord::EndCheckpoint {
            dirty_pages: mem::take(dpt),
            txn_table: mem::take(txns),
        });
        debug!(lsn = %lsn, "end-checkpoint chunk");
    }

    // -----------------------------------------------------------------------
    // Introspection (used by restart and tests)
    // -----------------------------------------------------------------------

    /// Snapshot of the dirty page table.
    #[must_use]
    pub fn dirty_page_table(&self) -> BTreeMap<PageId, Lsn> {
        self.dirty_pages
            .lock()
            .iter()
            .map(|(page, lsn)| (*page, *lsn))
            .collect()
    }

    /// Transaction numbers currently in the table, with status and lastLSN.
    #[must_use]
    pub fn transactions(&self) -> BTreeMap<TxnId, (TxnStatus, Lsn)> {
        self.txn_table
            .lock()
            .iter()
            .map(|(txn, entry)| (*txn, (entry.txn.status(), entry.last_lsn)))
            .collect()
    }
}

pub(crate) fn entry_mut<'t>(
    table: &'t mut parking_lot::MutexGuard<'_, HashMap<TxnId, TransactionTableEntry>>,
    txn: TxnId,
) -> Result<&'t mut TransactionTableEntry> {
    table
        .get_mut(&txn)
        .ok_or(QuarryError::UnknownTransaction { txn })
}

pub(crate) fn entry_ref<'t>(
    table: &'t parking_lot::MutexGuard<'_, HashMap<TxnId, TransactionTableEntry>>,
    txn: TxnId,
) -> Result<&'t TransactionTableEntry> {
    table.get(&txn).ok_or(QuarryError::UnknownTransaction { txn })
}
