//! Quarry: the recoverable, concurrency-controlled core of a small
//! relational storage engine.
//!
//! Two subsystems do the heavy lifting:
//!
//! - [`recovery`]: an ARIES-style recovery manager — write-ahead logging,
//!   fuzzy checkpoints, and the Analysis/Redo/Undo restart protocol.
//! - [`lock`]: a hierarchical multi-granularity lock manager over a tree of
//!   resources (database, tables, pages) with intention modes.
//!
//! They meet only at the transaction: a transaction asks the lock layer for
//! isolation and the recovery layer for durability. The buffer pool, disk
//! space manager, and log device are reached through the trait seams in
//! [`pager`] and [`wal`].

pub use quarry_error as error;
pub use quarry_lock as lock;
pub use quarry_pager as pager;
pub use quarry_recovery as recovery;
pub use quarry_types as types;
pub use quarry_wal as wal;

pub use quarry_error::{QuarryError, Result};
pub use quarry_lock::{LockContext, LockKind, LockManager, ResourceName};
pub use quarry_recovery::{RecoveryManager, Transaction};
pub use quarry_types::{Lsn, PageId, TxnId, TxnStatus};
pub use quarry_wal::{LogRecord, LogStore, MemLogStore};
