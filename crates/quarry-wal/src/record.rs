//! The log record hierarchy as a tagged sum.

use std::collections::BTreeMap;

use quarry_error::Result;
use quarry_pager::{DiskManager, PageCache};
use quarry_types::limits::EFFECTIVE_PAGE_SIZE;
use quarry_types::{Lsn, PageId, PartId, TxnId, TxnStatus};

/// One logged event.
///
/// Every transaction-owned variant carries `prev_lsn`, the LSN of the same
/// transaction's previous record ([`Lsn::ZERO`] for the first). Compensation
/// records (`Undo*`) additionally carry `undo_next_lsn`, the next record to
/// undo when rolling back — always the `prev_lsn` of the record they
/// compensate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LogRecord {
    /// The record at LSN 0. Points at the last installed checkpoint.
    Master { last_checkpoint_lsn: Lsn },

    /// A byte-range write to a page. Undoable and redoable.
    UpdatePage {
        txn: TxnId,
        page: PageId,
        prev_lsn: Lsn,
        offset: u16,
        before: Vec<u8>,
        after: Vec<u8>,
    },
    /// CLR for [`LogRecord::UpdatePage`]: re-installs the before-image.
    UndoUpdatePage {
        txn: TxnId,
        page: PageId,
        prev_lsn: Lsn,
        undo_next_lsn: Lsn,
        offset: u16,
        after: Vec<u8>,
    },

    AllocPart {
        txn: TxnId,
        part: PartId,
        prev_lsn: Lsn,
    },
    UndoAllocPart {
        txn: TxnId,
        part: PartId,
        prev_lsn: Lsn,
        undo_next_lsn: Lsn,
    },
    FreePart {
        txn: TxnId,
        part: PartId,
        prev_lsn: Lsn,
    },
    UndoFreePart {
        txn: TxnId,
        part: PartId,
        prev_lsn: Lsn,
        undo_next_lsn: Lsn,
    },

    AllocPage {
        txn: TxnId,
        page: PageId,
        prev_lsn: Lsn,
    },
    UndoAllocPage {
        txn: TxnId,
        page: PageId,
        prev_lsn: Lsn,
        undo_next_lsn: Lsn,
    },
    FreePage {
        txn: TxnId,
        page: PageId,
        prev_lsn: Lsn,
    },
    UndoFreePage {
        txn: TxnId,
        page: PageId,
        prev_lsn: Lsn,
        undo_next_lsn: Lsn,
    },

    Commit { txn: TxnId, prev_lsn: Lsn },
    Abort { txn: TxnId, prev_lsn: Lsn },
    End { txn: TxnId, prev_lsn: Lsn },

    BeginCheckpoint,
    /// Checkpoint snapshot chunk: DPT entries first, then transaction-table
    /// entries. A checkpoint may span several of these.
    EndCheckpoint {
        dirty_pages: BTreeMap<PageId, Lsn>,
        txn_table: BTreeMap<TxnId, (TxnStatus, Lsn)>,
    },
}

impl LogRecord {
    /// The owning transaction, if this record belongs to one.
    #[must_use]
    pub fn txn_id(&self) -> Option<TxnId> {
        match self {
            Self::Master { .. } | Self::BeginCheckpoint | Self::EndCheckpoint { .. } => None,
            Self::UpdatePage { txn, .. }
            | Self::UndoUpdatePage { txn, .. }
            | Self::AllocPart { txn, .. }
            | Self::UndoAllocPart { txn, .. }
            | Self::FreePart { txn, .. }
            | Self::UndoFreePart { txn, .. }
            | Self::AllocPage { txn, .. }
            | Self::UndoAllocPage { txn, .. }
            | Self::FreePage { txn, .. }
            | Self::UndoFreePage { txn, .. }
            | Self::Commit { txn, .. }
            | Self::Abort { txn, .. }
            | Self::End { txn, .. } => Some(*txn),
        }
    }

    /// The same transaction's previous record, if this record belongs to one.
    #[must_use]
    pub fn prev_lsn(&self) -> Option<Lsn> {
        match self {
            Self::Master { .. } | Self::BeginCheckpoint | Self::EndCheckpoint { .. } => None,
            Self::UpdatePage { prev_lsn, .. }
            | Self::UndoUpdatePage { prev_lsn, .. }
            | Self::AllocPart { prev_lsn, .. }
            | Self::UndoAllocPart { prev_lsn, .. }
            | Self::FreePart { prev_lsn, .. }
            | Self::UndoFreePart { prev_lsn, .. }
            | Self::AllocPage { prev_lsn, .. }
            | Self::UndoAllocPage { prev_lsn, .. }
            | Self::FreePage { prev_lsn, .. }
            | Self::UndoFreePage { prev_lsn, .. }
            | Self::Commit { prev_lsn, .. }
            | Self::Abort { prev_lsn, .. }
            | Self::End { prev_lsn, .. } => Some(*prev_lsn),
        }
    }

    /// The page this record affects, if any.
    #[must_use]
    pub fn page_id(&self) -> Option<PageId> {
        match self {
            Self::UpdatePage { page, .. }
            | Self::UndoUpdatePage { page, .. }
            | Self::AllocPage { page, .. }
            | Self::UndoAllocPage { page, .. }
            | Self::FreePage { page, .. }
            | Self::UndoFreePage { page, .. } => Some(*page),
            _ => None,
        }
    }

    /// The partition this record affects, if any.
    #[must_use]
    pub fn partition(&self) -> Option<PartId> {
        match self {
            Self::AllocPart { part, .. }
            | Self::UndoAllocPart { part, .. }
            | Self::FreePart { part, .. }
            | Self::UndoFreePart { part, .. } => Some(*part),
            _ => None,
        }
    }

    /// For compensation records, the next record to undo.
    #[must_use]
    pub fn undo_next_lsn(&self) -> Option<Lsn> {
        match self {
            Self::UndoUpdatePage { undo_next_lsn, .. }
            | Self::UndoAllocPart { undo_next_lsn, .. }
            | Self::UndoFreePart { undo_next_lsn, .. }
            | Self::UndoAllocPage { undo_next_lsn, .. }
            | Self::UndoFreePage { undo_next_lsn, .. } => Some(*undo_next_lsn),
            _ => None,
        }
    }

    /// Whether rolling back must compensate this record.
    ///
    /// True only for forward mutations. CLRs, status records, and
    /// checkpoint records are never undone.
    #[must_use]
    pub fn is_undoable(&self) -> bool {
        matches!(
            self,
            Self::UpdatePage { .. }
                | Self::AllocPart { .. }
                | Self::FreePart { .. }
                | Self::AllocPage { .. }
                | Self::FreePage { .. }
        )
    }

    /// Whether this record has a concrete page/partition effect to replay.
    #[must_use]
    pub fn is_redoable(&self) -> bool {
        matches!(
            self,
            Self::UpdatePage { .. }
                | Self::UndoUpdatePage { .. }
                | Self::AllocPart { .. }
                | Self::UndoAllocPart { .. }
                | Self::FreePart { .. }
                | Self::UndoFreePart { .. }
                | Self::AllocPage { .. }
                | Self::UndoAllocPage { .. }
                | Self::FreePage { .. }
                | Self::UndoFreePage { .. }
        )
    }

    /// Build the compensation record for this record.
    ///
    /// Does **not** perform the undo; the caller appends the CLR and then
    /// redoes it. `last_lsn` becomes the CLR's `prev_lsn` (the rolling-back
    /// transaction's current lastLSN); the CLR's `undo_next_lsn` is this
    /// record's `prev_lsn`. Returns `None` for records that are not
    /// undoable.
    #[must_use]
    pub fn undo(&self, last_lsn: Lsn) -> Option<LogRecord> {
        match self {
            Self::UpdatePage {
                txn,
                page,
                prev_lsn,
                offset,
                before,
                ..
            } => Some(Self::UndoUpdatePage {
                txn: *txn,
                page: *page,
                prev_lsn: last_lsn,
                undo_next_lsn: *prev_lsn,
                offset: *offset,
                after: before.clone(),
            }),
            Self::AllocPart { txn, part, prev_lsn } => Some(Self::UndoAllocPart {
                txn: *txn,
                part: *part,
                prev_lsn: last_lsn,
                undo_next_lsn: *prev_lsn,
            }),
            Self::FreePart { txn, part, prev_lsn } => Some(Self::UndoFreePart {
                txn: *txn,
                part: *part,
                prev_lsn: last_lsn,
                undo_next_lsn: *prev_lsn,
            }),
            Self::AllocPage { txn, page, prev_lsn } => Some(Self::UndoAllocPage {
                txn: *txn,
                page: *page,
                prev_lsn: last_lsn,
                undo_next_lsn: *prev_lsn,
            }),
            Self::FreePage { txn, page, prev_lsn } => Some(Self::UndoFreePage {
                txn: *txn,
                page: *page,
                prev_lsn: last_lsn,
                undo_next_lsn: *prev_lsn,
            }),
            _ => None,
        }
    }

    /// Apply this record's effect to the disk/buffer state.
    ///
    /// `lsn` is the record's own LSN, stamped as the pageLSN of any page it
    /// touches. Redoing an allocation that is already present on disk (or a
    /// free whose target is already gone) is a no-op: those changes were
    /// durable before the crash.
    pub fn redo(&self, lsn: Lsn, disk: &dyn DiskManager, cache: &dyn PageCache) -> Result<()> {
        debug_assert!(self.is_redoable(), "redo of non-redoable record");
        match self {
            Self::UpdatePage {
                page,
                offset,
                after,
                ..
            }
            | Self::UndoUpdatePage {
                page,
                offset,
                after,
                ..
            } => cache.with_page(*page, &mut |frame| {
                frame.write(usize::from(*offset), after);
                frame.set_page_lsn(lsn);
            }),
            Self::AllocPart { part, .. } | Self::UndoFreePart { part, .. } => {
                tolerate_applied(disk.alloc_part(*part))
            }
            Self::FreePart { part, .. } | Self::UndoAllocPart { part, .. } => {
                tolerate_applied(disk.free_part(*part))
            }
            Self::AllocPage { page, .. } | Self::UndoFreePage { page, .. } => {
                tolerate_applied(disk.alloc_page(*page))
            }
            Self::FreePage { page, .. } | Self::UndoAllocPage { page, .. } => {
                cache.discard(*page);
                tolerate_applied(disk.free_page(*page))
            }
            _ => Ok(()),
        }
    }
}

fn tolerate_applied(result: Result<()>) -> Result<()> {
    match result {
        Err(e) if e.is_already_applied() => Ok(()),
        other => other,
    }
}

// ---------------------------------------------------------------------------
// Checkpoint sizing
// ---------------------------------------------------------------------------

/// Bytes of an `EndCheckpoint` header: tag + the two entry counts.
const END_CHECKPOINT_HEADER: usize = 1 + 2 + 2;
/// Bytes per DPT entry: page number + recLSN.
const DPT_ENTRY_BYTES: usize = 8 + 8;
/// Bytes per transaction-table entry: txn number + status + lastLSN.
const TXN_ENTRY_BYTES: usize = 8 + 1 + 8;

/// Whether an `EndCheckpoint` with the given entry counts still fits in one
/// page of log. The checkpoint builder emits and starts a fresh record when
/// the next insertion would not.
#[must_use]
pub const fn fits_in_one_record(dpt_entries: usize, txn_entries: usize) -> bool {
    END_CHECKPOINT_HEADER + dpt_entries * DPT_ENTRY_BYTES + txn_entries * TXN_ENTRY_BYTES
        <= EFFECTIVE_PAGE_SIZE
}

#[cfg(test)]
mod tests {
    use super::*;

    fn update(txn: u64, page: PageId, prev: u64) -> LogRecord {
        LogRecord::UpdatePage {
            txn: TxnId::new(txn),
            page,
            prev_lsn: Lsn::new(prev),
            offset: 64,
            before: vec![1, 2, 3],
            after: vec![4, 5, 6],
        }
    }

    #[test]
    fn undoable_exactly_for_forward_mutations() {
        let page = PageId::new(1, 1);
        assert!(update(1, page, 0).is_undoable());
        assert!(
            LogRecord::FreePage {
                txn: TxnId::new(1),
                page,
                prev_lsn: Lsn::ZERO
            }
            .is_undoable()
        );
        assert!(
            !LogRecord::Commit {
                txn: TxnId::new(1),
                prev_lsn: Lsn::ZERO
            }
            .is_undoable()
        );
        assert!(!LogRecord::BeginCheckpoint.is_undoable());
        assert!(
            !LogRecord::UndoUpdatePage {
                txn: TxnId::new(1),
                page,
                prev_lsn: Lsn::ZERO,
                undo_next_lsn: Lsn::ZERO,
                offset: 0,
                after: vec![],
            }
            .is_undoable()
        );
    }

    #[test]
    fn clr_swaps_images_and_links_chains() {
        let page = PageId::new(1, 5);
        let rec = update(2, page, 10);
        let clr = rec.undo(Lsn::new(30)).unwrap();
        match clr {
            LogRecord::UndoUpdatePage {
                txn,
                page: clr_page,
                prev_lsn,
                undo_next_lsn,
                offset,
                after,
            } => {
                assert_eq!(txn, TxnId::new(2));
                assert_eq!(clr_page, page);
                assert_eq!(prev_lsn, Lsn::new(30));
                assert_eq!(undo_next_lsn, Lsn::new(10));
                assert_eq!(offset, 64);
                assert_eq!(after, vec![1, 2, 3]);
            }
            other => panic!("expected UndoUpdatePage, got {other:?}"),
        }
    }

    #[test]
    fn status_records_have_no_compensation() {
        let rec = LogRecord::Abort {
            txn: TxnId::new(3),
            prev_lsn: Lsn::new(7),
        };
        assert!(rec.undo(Lsn::new(8)).is_none());
    }

    #[test]
    fn every_clr_carries_undo_next() {
        let page = PageId::new(1, 2);
        let records = [
            update(1, page, 4),
            LogRecord::AllocPart {
                txn: TxnId::new(1),
                part: 2,
                prev_lsn: Lsn::new(4),
            },
            LogRecord::FreePart {
                txn: TxnId::new(1),
                part: 2,
                prev_lsn: Lsn::new(4),
            },
            LogRecord::AllocPage {
                txn: TxnId::new(1),
                page,
                prev_lsn: Lsn::new(4),
            },
            LogRecord::FreePage {
                txn: TxnId::new(1),
                page,
                prev_lsn: Lsn::new(4),
            },
        ];
        for rec in records {
            let clr = rec.undo(Lsn::new(9)).unwrap();
            assert_eq!(clr.undo_next_lsn(), Some(Lsn::new(4)));
            assert!(!clr.is_undoable());
            assert!(clr.is_redoable());
        }
    }

    #[test]
    fn checkpoint_sizing_is_monotonic() {
        assert!(fits_in_one_record(0, 0));
        assert!(fits_in_one_record(1, 1));
        // Find the DPT-only capacity, then one more must not fit.
        let mut n = 0;
        while fits_in_one_record(n + 1, 0) {
            n += 1;
        }
        assert!(n > 100, "a page holds a useful number of DPT entries");
        assert!(!fits_in_one_record(n + 1, 0));
        assert!(!fits_in_one_record(n, 1));
    }
}
