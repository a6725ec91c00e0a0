//! Primary error type for Quarry operations.
//!
//! One structured enum for the whole engine core: lock-protocol violations
//! surface to the caller (the transaction aborts at the user layer), while
//! log corruption is fatal — restart refuses to expose a partial-state
//! database.

use quarry_types::{Lsn, PageId, PartId, TxnId};
use thiserror::Error;

/// Error type shared by the lock manager, the log, and recovery.
#[derive(Error, Debug)]
pub enum QuarryError {
    // === Lock protocol ===
    /// A transaction re-requested a lock it already holds.
    #[error("transaction {txn} already holds a lock on {resource}")]
    DuplicateLockRequest { txn: TxnId, resource: String },

    /// Release/promote with no lock to act on.
    #[error("transaction {txn} holds no lock on {resource}")]
    NoLockHeld { txn: TxnId, resource: String },

    /// A multigranularity rule would be violated.
    #[error("invalid lock request: {detail}")]
    InvalidLock { detail: String },

    /// Mutation attempted on a readonly lock context.
    #[error("lock context {resource} is readonly")]
    ReadonlyContext { resource: String },

    // === Log ===
    /// The log contains a record that violates its own structure.
    #[error("corrupt log: {detail}")]
    CorruptLog { detail: String },

    /// No record starts at the requested LSN.
    #[error("no log record at LSN {lsn}")]
    UnknownLsn { lsn: Lsn },

    // === Recovery bookkeeping ===
    /// An operation referenced a transaction missing from the table.
    #[error("transaction {txn} is not in the transaction table")]
    UnknownTransaction { txn: TxnId },

    /// A named savepoint does not exist for the transaction.
    #[error("transaction {txn} has no savepoint named '{name}'")]
    UnknownSavepoint { txn: TxnId, name: String },

    /// A status change that the state machine forbids.
    #[error("transaction {txn} cannot move from {from} to {to}")]
    IllegalTransition { txn: TxnId, from: String, to: String },

    // === Disk state ===
    /// Allocating a partition that already exists.
    #[error("partition {part} already allocated")]
    PartitionExists { part: PartId },

    /// Freeing or using a partition that does not exist.
    #[error("no such partition: {part}")]
    UnknownPartition { part: PartId },

    /// Allocating a page that already exists.
    #[error("page {page} already allocated")]
    PageExists { page: PageId },

    /// Fetching or freeing a page that does not exist.
    #[error("no such page: {page}")]
    UnknownPage { page: PageId },

    // === I/O ===
    /// Underlying file I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl QuarryError {
    /// Whether this is a lock-protocol error the transaction layer should
    /// translate into an abort.
    #[must_use]
    pub const fn is_lock_error(&self) -> bool {
        matches!(
            self,
            Self::DuplicateLockRequest { .. }
                | Self::NoLockHeld { .. }
                | Self::InvalidLock { .. }
                | Self::ReadonlyContext { .. }
        )
    }

    /// Whether this error must halt startup rather than surface to a caller.
    #[must_use]
    pub const fn is_fatal(&self) -> bool {
        matches!(self, Self::CorruptLog { .. } | Self::UnknownLsn { .. })
    }

    /// Whether a redo that hits this error found the disk already in the
    /// state the record produces (safe to skip).
    #[must_use]
    pub const fn is_already_applied(&self) -> bool {
        matches!(
            self,
            Self::PartitionExists { .. }
                | Self::UnknownPartition { .. }
                | Self::PageExists { .. }
                | Self::UnknownPage { .. }
        )
    }

    /// Create an [`QuarryError::InvalidLock`].
    pub fn invalid_lock(detail: impl Into<String>) -> Self {
        Self::InvalidLock {
            detail: detail.into(),
        }
    }

    /// Create a [`QuarryError::CorruptLog`].
    pub fn corrupt(detail: impl Into<String>) -> Self {
        Self::CorruptLog {
            detail: detail.into(),
        }
    }
}

/// Result type alias using `QuarryError`.
pub type Result<T> = std::result::Result<T, QuarryError>;
