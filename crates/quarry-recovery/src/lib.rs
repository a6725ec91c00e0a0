//! ARIES-style recovery: write-ahead logging during forward processing,
//! checkpoints, and the three-phase Analysis/Redo/Undo restart protocol.
//!
//! The [`RecoveryManager`] maintains the dirty page table and transaction
//! table, appends a log record for every mutation before the page changes,
//! rolls transactions back through compensation log records, and rebuilds
//! all in-memory state from the log after a crash. Transactions interact
//! with it through [`Transaction`] handles; the storage collaborators come
//! in through the `quarry-pager` and `quarry-wal` trait seams.

mod manager;
mod restart;
mod txn;

pub use manager::{RecoveryManager, TxnFactory};
pub use txn::{Transaction, TransactionTableEntry};
