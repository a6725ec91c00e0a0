//! Transaction handles and transaction-table entries.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use quarry_error::{QuarryError, Result};
use quarry_types::{Lsn, TxnId, TxnStatus};

/// A transaction as the recovery manager sees it: a number and a status.
///
/// The session layer owns everything else about a transaction; recovery
/// only needs to drive the status state machine, including for synthetic
/// handles re-created from the log during restart.
#[derive(Debug)]
pub struct Transaction {
    num: TxnId,
    status: Mutex<TxnStatus>,
}

impl Transaction {
    /// A fresh `Running` transaction.
    #[must_use]
    pub fn new(num: TxnId) -> Arc<Self> {
        Arc::new(Self {
            num,
            status: Mutex::new(TxnStatus::Running),
        })
    }

    /// This transaction's number.
    #[must_use]
    pub fn num(&self) -> TxnId {
        self.num
    }

    /// Current status.
    #[must_use]
    pub fn status(&self) -> TxnStatus {
        *self.status.lock()
    }

    /// Move to `target`, failing on a backwards or sideways transition.
    pub fn transition(&self, target: TxnStatus) -> Result<()> {
        let mut status = self.status.lock();
        match status.transition(target) {
            Some(next) => {
                *status = next;
                Ok(())
            }
            None => Err(QuarryError::IllegalTransition {
                txn: self.num,
                from: status.to_string(),
                to: target.to_string(),
            }),
        }
    }

    /// Move to `target` if legal; keep the current status otherwise.
    ///
    /// Used when merging checkpoint snapshots during analysis, where the
    /// table may already hold newer information than the checkpoint.
    pub(crate) fn transition_if_legal(&self, target: TxnStatus) {
        let mut status = self.status.lock();
        if let Some(next) = status.transition(target) {
            *status = next;
        }
    }
}

/// Per-transaction recovery bookkeeping.
#[derive(Debug)]
pub struct TransactionTableEntry {
    pub txn: Arc<Transaction>,
    /// LSN of the last record appended for this transaction.
    pub last_lsn: Lsn,
    savepoints: HashMap<String, Lsn>,
}

impl TransactionTableEntry {
    #[must_use]
    pub fn new(txn: Arc<Transaction>) -> Self {
        Self {
            txn,
            last_lsn: Lsn::ZERO,
            savepoints: HashMap::new(),
        }
    }

    /// Record `name` at the current lastLSN, replacing any previous
    /// savepoint with the same name.
    pub fn add_savepoint(&mut self, name: &str) {
        self.savepoints.insert(name.to_owned(), self.last_lsn);
    }

    /// Drop `name`. Dropping an unknown savepoint is a no-op.
    pub fn delete_savepoint(&mut self, name: &str) {
        self.savepoints.remove(name);
    }

    /// The LSN recorded for `name`.
    pub fn savepoint(&self, name: &str) -> Result<Lsn> {
        self.savepoints
            .get(name)
            .copied()
            .ok_or_else(|| QuarryError::UnknownSavepoint {
                txn: self.txn.num(),
                name: name.to_owned(),
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn illegal_transition_is_an_error() {
        let txn = Transaction::new(TxnId::new(1));
        txn.transition(TxnStatus::Committing).unwrap();
        let err = txn.transition(TxnStatus::Running).unwrap_err();
        assert!(matches!(err, QuarryError::IllegalTransition { .. }));
        assert_eq!(txn.status(), TxnStatus::Committing);
    }

    #[test]
    fn transition_if_legal_keeps_newer_state() {
        let txn = Transaction::new(TxnId::new(1));
        txn.transition(TxnStatus::Committing).unwrap();
        // The checkpoint snapshot is older; Running must not win.
        txn.transition_if_legal(TxnStatus::Running);
        assert_eq!(txn.status(), TxnStatus::Committing);
        txn.transition_if_legal(TxnStatus::Complete);
        assert_eq!(txn.status(), TxnStatus::Complete);
    }

    #[test]
    fn savepoints_replace_and_delete() {
        let mut entry = TransactionTableEntry::new(Transaction::new(TxnId::new(4)));
        entry.last_lsn = Lsn::new(30);
        entry.add_savepoint("s");
        entry.last_lsn = Lsn::new(40);
        entry.add_savepoint("s");
        assert_eq!(entry.savepoint("s").unwrap(), Lsn::new(40));

        entry.delete_savepoint("s");
        assert!(matches!(
            entry.savepoint("s"),
            Err(QuarryError::UnknownSavepoint { .. })
        ));
    }
}
