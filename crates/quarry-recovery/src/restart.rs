//! Restart recovery: Analysis, Redo, Undo.

use std::collections::{BinaryHeap, HashSet};

use quarry_error::{QuarryError, Result};
use quarry_types::{Lsn, TxnId, TxnStatus};
use quarry_wal::LogRecord;
use tracing::{info, warn};

use crate::manager::{RecoveryManager, entry_mut};
use crate::txn::TransactionTableEntry;

impl RecoveryManager {
    /// Run restart recovery to completion.
    ///
    /// Analysis rebuilds the transaction table and DPT from the log, Redo
    /// replays history from the DPT's oldest recLSN, Undo rolls back every
    /// loser transaction, and a fresh checkpoint caps the log. New
    /// transactions may start only after this returns; a failure here is
    /// fatal and no partial-state database is exposed.
    pub fn restart(&self) -> Result<()> {
        self.restart_analysis()?;
        self.restart_redo()?;
        self.redo_complete
            .store(true, std::sync::atomic::Ordering::Release);
        self.clean_dpt();
        self.restart_undo()?;
        self.checkpoint()?;
        info!("restart recovery complete");
        Ok(())
    }

    /// Analysis: scan forward from the last installed checkpoint.
    fn restart_analysis(&self) -> Result<()> {
        let master = self.log.fetch(Lsn::ZERO)?;
        let LogRecord::Master { last_checkpoint_lsn } = master else {
            return Err(QuarryError::corrupt("LSN 0 does not hold the master record"));
        };

        let mut ended: HashSet<TxnId> = HashSet::new();
        let mut scanned = 0_u64;

        for (lsn, record) in self.log.scan_from(last_checkpoint_lsn) {
            scanned += 1;

            // Transaction-owned records refresh the table.
            if let Some(txn_id) = record.txn_id() {
                let mut table = self.txn_table.lock();
                table
                    .entry(txn_id)
                    .or_insert_with(|| TransactionTableEntry::new((self.new_txn)(txn_id)))
                    .last_lsn = lsn;
            }

            // Page-related records refresh the DPT.
            if let Some(page) = record.page_id() {
                match record {
                    LogRecord::AllocPage { .. } | LogRecord::UndoFreePage { .. } => {
                        // Allocation reaches disk before returning; nothing dirty.
                    }
                    LogRecord::UpdatePage { .. } | LogRecord::UndoUpdatePage { .. } => {
                        self.dirty_page(page, lsn);
                    }
                    LogRecord::FreePage { .. } | LogRecord::UndoAllocPage { .. } => {
                        self.dirty_pages.lock().remove(&page);
                    }
                    _ => {}
                }
            }

            match &record {
                LogRecord::Commit { txn, .. } => {
                    let table = self.txn_table.lock();
                    if let Some(entry) = table.get(txn) {
                        entry.txn.transition_if_legal(TxnStatus::Committing);
                    }
                }
                LogRecord::Abort { txn, .. } => {
                    let table = self.txn_table.lock();
                    if let Some(entry) = table.get(txn) {
                        entry.txn.transition_if_legal(TxnStatus::RecoveryAborting);
                    }
                }
                LogRecord::End { txn, .. } => {
                    let mut table = self.txn_table.lock();
                    if let Some(entry) = table.remove(txn) {
                        entry.txn.transition_if_legal(TxnStatus::Complete);
                    }
                    ended.insert(*txn);
                }
                LogRecord::EndCheckpoint {
                    dirty_pages,
                    txn_table,
                } => {
                    // The checkpoint's recLSNs supersede what the scan built.
                    {
                        let mut dpt = self.dirty_pages.lock();
                        for (page, rec_lsn) in dirty_pages {
                            dpt.insert(*page, *rec_lsn);
                        }
                    }
                    let mut table = self.txn_table.lock();
                    for (txn_id, (status, last_lsn)) in txn_table {
                        if ended.contains(txn_id) || *status == TxnStatus::Complete {
                            continue;
                        }
                        let entry = table
                            .entry(*txn_id)
                            .or_insert_with(|| TransactionTableEntry::new((self.new_txn)(*txn_id)));
                        entry.last_lsn = entry.last_lsn.max(*last_lsn);
                        // A checkpointed ABORTING becomes RECOVERY_ABORTING:
                        // restart owns the rollback now. The transition
                        // function drops anything that would move backwards.
                        let target = if *status == TxnStatus::Aborting {
                            TxnStatus::RecoveryAborting
                        } else {
                            *status
                        };
                        entry.txn.transition_if_legal(target);
                    }
                }
                _ => {}
            }
        }

        // Every transaction the scan left behind either finishes or becomes
        // a loser.
        let mut to_finish = Vec::new();
        let mut to_abort = Vec::new();
        {
            let table = self.txn_table.lock();
            for (txn_id, entry) in table.iter() {
                match entry.txn.status() {
                    TxnStatus::Committing => to_finish.push(*txn_id),
                    TxnStatus::Running => to_abort.push(*txn_id),
                    _ => {}
                }
            }
        }
        for txn_id in to_finish {
            let mut table = self.txn_table.lock();
            let entry = entry_mut(&mut table, txn_id)?;
            entry.txn.transition_if_legal(TxnStatus::Complete);
            let lsn = self.log.append(LogRecord::End {
                txn: txn_id,
                prev_lsn: entry.last_lsn,
            });
            entry.last_lsn = lsn;
            table.remove(&txn_id);
        }
        for txn_id in to_abort {
            let mut table = self.txn_table.lock();
            let entry = entry_mut(&mut table, txn_id)?;
            entry.txn.transition_if_legal(TxnStatus::RecoveryAborting);
            let lsn = self.log.append(LogRecord::Abort {
                txn: txn_id,
                prev_lsn: entry.last_lsn,
            });
            entry.last_lsn = lsn;
        }

        info!(
            scanned,
            losers = self.txn_table.lock().len(),
            dirty_pages = self.dirty_pages.lock().len(),
            "analysis complete"
        );
        Ok(())
    }

    /// Redo: replay history from the oldest recLSN.
    fn restart_redo(&self) -> Result<()> {
        let start = self
            .dirty_pages
            .lock()
            .values()
            .min()
            .copied()
            .unwrap_or(Lsn::ZERO);

        let mut replayed = 0_u64;
        for (lsn, record) in self.log.scan_from(start) {
            if !record.is_redoable() {
                continue;
            }
            match &record {
                // Partition changes and page allocations were durable when
                // logged; redo unconditionally (the record tolerates finding
                // its effect already on disk).
                LogRecord::AllocPart { .. }
                | LogRecord::UndoAllocPart { .. }
                | LogRecord::FreePart { .. }
                | LogRecord::UndoFreePart { .. }
                | LogRecord::AllocPage { .. }
                | LogRecord::UndoFreePage { .. } => {
                    record.redo(lsn, self.disk().as_ref(), self.cache().as_ref())?;
                    replayed += 1;
                }
                // Page modifications replay only onto pages the DPT says may
                // be stale, and only if the page has not seen this record.
                LogRecord::UpdatePage { .. }
                | LogRecord::UndoUpdatePage { .. }
                | LogRecord::FreePage { .. }
                | LogRecord::UndoAllocPage { .. } => {
                    let page = record
                        .page_id()
                        .ok_or_else(|| QuarryError::corrupt("page record without page number"))?;
                    let Some(rec_lsn) = self.dirty_pages.lock().get(&page).copied() else {
                        continue;
                    };
                    if lsn < rec_lsn {
                        continue;
                    }
                    if self.cache().page_lsn(page)? >= lsn {
                        continue;
                    }
                    record.redo(lsn, self.disk().as_ref(), self.cache().as_ref())?;
                    replayed += 1;
                }
                _ => {}
            }
        }
        info!(start = %start, replayed, "redo complete");
        Ok(())
    }

    /// Drop DPT entries for pages the buffer pool does not consider dirty.
    /// O(pages); only run at restart.
    fn clean_dpt(&self) {
        let mut dirty = HashSet::new();
        self.cache().for_each_page(&mut |page, is_dirty| {
            if is_dirty {
                dirty.insert(page);
            }
        });
        let mut dpt = self.dirty_pages.lock();
        let before = dpt.len();
        dpt.retain(|page, _| dirty.contains(page));
        if dpt.len() != before {
            info!(dropped = before - dpt.len(), "cleaned dirty page table");
        }
    }

    /// Undo: roll back every loser, largest lastLSN first across all of
    /// them, so the log tail is consumed in one backwards sweep.
    fn restart_undo(&self) -> Result<()> {
        let mut heap: BinaryHeap<(Lsn, TxnId)> = {
            let table = self.txn_table.lock();
            table
                .iter()
                .filter(|(_, entry)| entry.txn.status() == TxnStatus::RecoveryAborting)
                .map(|(txn_id, entry)| (entry.last_lsn, *txn_id))
                .collect()
        };

        let mut compensated = 0_u64;
        while let Some((cursor, txn_id)) = heap.pop() {
            let record = self.log.fetch(cursor)?;
            let last_lsn = {
                let table = self.txn_table.lock();
                table
                    .get(&txn_id)
                    .ok_or(QuarryError::UnknownTransaction { txn: txn_id })?
                    .last_lsn
            };

            let next = if let Some(clr) = record.undo(last_lsn) {
                let undo_next = clr
                    .undo_next_lsn()
                    .ok_or_else(|| QuarryError::corrupt("CLR without undoNextLSN"))?;
                let clr_lsn = self.log.append(clr.clone());
                {
                    let mut table = self.txn_table.lock();
                    entry_mut(&mut table, txn_id)?.last_lsn = clr_lsn;
                }
                clr.redo(clr_lsn, self.disk().as_ref(), self.cache().as_ref())?;
                compensated += 1;
                undo_next
            } else if let Some(undo_next) = record.undo_next_lsn() {
                undo_next
            } else {
                record.prev_lsn().ok_or_else(|| {
                    QuarryError::corrupt(format!("record at {cursor} has no chain to follow"))
                })?
            };

            if next.is_zero() {
                let mut table = self.txn_table.lock();
                let entry = entry_mut(&mut table, txn_id)?;
                entry.txn.transition_if_legal(TxnStatus::Complete);
                let lsn = self.log.append(LogRecord::End {
                    txn: txn_id,
                    prev_lsn: entry.last_lsn,
                });
                entry.last_lsn = lsn;
                table.remove(&txn_id);
            } else {
                heap.push((next, txn_id));
            }
        }

        if !self.txn_table.lock().is_empty() {
            warn!("transaction table not empty after undo");
        }
        info!(compensated, "undo complete");
        Ok(())
    }
}
