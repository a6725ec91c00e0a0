//! The flat lock manager: per-resource grant lists and FIFO wait queues.
//!
//! The manager knows nothing about the resource hierarchy; [`crate::LockContext`]
//! layers the multigranularity rules on top. One mutex guards all manager
//! state (grants and queues change together during queue processing); a
//! single condvar wakes waiters whenever any grant happens, and each waiter
//! rechecks its own request.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::{Condvar, Mutex, MutexGuard};
use quarry_error::{QuarryError, Result};
use quarry_types::TxnId;
use tracing::debug;

use crate::context::LockContext;
use crate::kind::LockKind;
use crate::resource::ResourceName;

/// One granted lock.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Lock {
    pub txn: TxnId,
    pub name: ResourceName,
    pub kind: LockKind,
}

/// A queued request. `releases` are performed atomically with the grant
/// (empty for plain acquires).
#[derive(Debug)]
struct QueuedRequest {
    txn: TxnId,
    kind: LockKind,
    releases: Vec<ResourceName>,
}

#[derive(Debug, Default)]
struct ResourceEntry {
    granted: Vec<Lock>,
    queue: VecDeque<QueuedRequest>,
}

#[derive(Default)]
struct ManagerState {
    resources: HashMap<ResourceName, ResourceEntry>,
    txn_locks: HashMap<TxnId, Vec<Lock>>,
}

impl ManagerState {
    fn kind_held(&self, txn: TxnId, name: &ResourceName) -> LockKind {
        self.txn_locks
            .get(&txn)
            .and_then(|locks| locks.iter().find(|l| &l.name == name))
            .map_or(LockKind::NL, |l| l.kind)
    }

    /// Whether `kind` for `txn` is compatible with every granted lock held
    /// by *other* transactions on `name`. The requester's own lock (if any)
    /// is the one being replaced and never conflicts with itself.
    fn compatible_with_granted(&self, txn: TxnId, name: &ResourceName, kind: LockKind) -> bool {
        self.resources.get(name).is_none_or(|entry| {
            entry
                .granted
                .iter()
                .all(|l| l.txn == txn || l.kind.compatible(kind))
        })
    }

    /// Install `kind` for `txn` on `name`, replacing any existing lock the
    /// transaction holds there.
    fn install(&mut self, txn: TxnId, name: &ResourceName, kind: LockKind) {
        let lock = Lock {
            txn,
            name: name.clone(),
            kind,
        };
        let entry = self.resources.entry(name.clone()).or_default();
        if let Some(existing) = entry.granted.iter_mut().find(|l| l.txn == txn) {
            *existing = lock.clone();
        } else {
            entry.granted.push(lock.clone());
        }
        let txn_locks = self.txn_locks.entry(txn).or_default();
        if let Some(existing) = txn_locks.iter_mut().find(|l| &l.name == name) {
            *existing = lock;
        } else {
            txn_locks.push(lock);
        }
    }

    /// Drop `txn`'s lock on `name`. Returns false if none was held.
    fn remove(&mut self, txn: TxnId, name: &ResourceName) -> bool {
        let Some(entry) = self.resources.get_mut(name) else {
            return false;
        };
        let before = entry.granted.len();
        entry.granted.retain(|l| l.txn != txn);
        if entry.granted.len() == before {
            return false;
        }
        if let Some(locks) = self.txn_locks.get_mut(&txn) {
            locks.retain(|l| &l.name != name);
        }
        true
    }

    /// Grant queued requests in strict FIFO order on every resource in
    /// `pending`, stopping at the first incompatible request per queue.
    /// Releases performed by granted requests extend the worklist. Returns
    /// true if anything was granted.
    fn process_queues(&mut self, mut pending: Vec<ResourceName>) -> bool {
        let mut granted_any = false;
        while let Some(name) = pending.pop() {
            loop {
                let grantable = {
                    let Some(entry) = self.resources.get(&name) else {
                        break;
                    };
                    let Some(front) = entry.queue.front() else {
                        break;
                    };
                    self.compatible_with_granted(front.txn, &name, front.kind)
                };
                if !grantable {
                    break;
                }
                let request = self
                    .resources
                    .get_mut(&name)
                    .and_then(|entry| entry.queue.pop_front())
                    .expect("front request checked above");
                for released in &request.releases {
                    if released != &name && self.remove(request.txn, released) {
                        pending.push(released.clone());
                    }
                }
                debug!(txn = %request.txn, resource = %name, kind = %request.kind, "queued lock granted");
                self.install(request.txn, &name, request.kind);
                granted_any = true;
            }
        }
        granted_any
    }
}

/// Per-resource lock queues with a transaction-to-locks index.
///
/// Also the registry of root [`LockContext`]s: the hierarchy is reached
/// through [`LockManager::context`].
#[derive(Default)]
pub struct LockManager {
    state: Mutex<ManagerState>,
    wakeup: Condvar,
    roots: Mutex<HashMap<String, Arc<LockContext>>>,
    mutations: AtomicU64,
}

impl LockManager {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Root lock context for `name`, created on first use.
    #[must_use]
    pub fn context(self: &Arc<Self>, name: &str) -> Arc<LockContext> {
        let mut roots = self.roots.lock();
        roots
            .entry(name.to_owned())
            .or_insert_with(|| LockContext::new_root(Arc::clone(self), name))
            .clone()
    }

    /// Count of mutating calls (`acquire`, `release`, `promote`,
    /// `acquire_and_release`) accepted so far. Diagnostic only.
    #[must_use]
    pub fn mutation_count(&self) -> u64 {
        self.mutations.load(Ordering::Relaxed)
    }

    /// Acquire `kind` on `name` for `txn`, blocking while the request
    /// queues behind incompatible grants or earlier waiters.
    ///
    /// An immediate grant requires compatibility with every granted lock
    /// *and* an empty queue; otherwise the request joins the back of the
    /// queue. Requesting `NL` or a resource already locked by `txn` fails.
    pub fn acquire(&self, txn: TxnId, name: &ResourceName, kind: LockKind) -> Result<()> {
        if kind == LockKind::NL {
            return Err(QuarryError::invalid_lock("cannot acquire NL; use release"));
        }
        self.mutations.fetch_add(1, Ordering::Relaxed);
        let mut state = self.state.lock();
        if state.kind_held(txn, name) != LockKind::NL {
            return Err(QuarryError::DuplicateLockRequest {
                txn,
                resource: name.to_string(),
            });
        }
        let queue_empty = state.resources.get(name).is_none_or(|e| e.queue.is_empty());
        if queue_empty && state.compatible_with_granted(txn, name, kind) {
            state.install(txn, name, kind);
            return Ok(());
        }
        debug!(txn = %txn, resource = %name, kind = %kind, "lock request queued");
        state
            .resources
            .entry(name.clone())
            .or_default()
            .queue
            .push_back(QueuedRequest {
                txn,
                kind,
                releases: Vec::new(),
            });
        self.wait_until_held(&mut state, txn, name, kind);
        Ok(())
    }

    /// Release `txn`'s lock on `name` and grant what the queue now allows.
    pub fn release(&self, txn: TxnId, name: &ResourceName) -> Result<()> {
        self.mutations.fetch_add(1, Ordering::Relaxed);
        let mut state = self.state.lock();
        if !state.remove(txn, name) {
            return Err(QuarryError::NoLockHeld {
                txn,
                resource: name.to_string(),
            });
        }
        if state.process_queues(vec![name.clone()]) {
            self.wakeup.notify_all();
        }
        Ok(())
    }

    /// Atomically replace `txn`'s lock on `name` with the strictly stronger
    /// `new_kind`.
    ///
    /// An upgrade that conflicts with granted locks waits at the *front* of
    /// the queue: queueing it behind pending requests would deadlock, since
    /// those requests are themselves waiting for this transaction's current
    /// lock to go away.
    pub fn promote(&self, txn: TxnId, name: &ResourceName, new_kind: LockKind) -> Result<()> {
        if new_kind == LockKind::NL {
            return Err(QuarryError::invalid_lock("cannot promote to NL; use release"));
        }
        self.mutations.fetch_add(1, Ordering::Relaxed);
        let mut state = self.state.lock();
        let current = state.kind_held(txn, name);
        if current == LockKind::NL {
            return Err(QuarryError::NoLockHeld {
                txn,
                resource: name.to_string(),
            });
        }
        if current == new_kind {
            return Err(QuarryError::DuplicateLockRequest {
                txn,
                resource: name.to_string(),
            });
        }
        if !new_kind.substitutable(current) {
            return Err(QuarryError::invalid_lock(format!(
                "{new_kind} does not substitute {current}"
            )));
        }
        if state.compatible_with_granted(txn, name, new_kind) {
            state.install(txn, name, new_kind);
            return Ok(());
        }
        state
            .resources
            .entry(name.clone())
            .or_default()
            .queue
            .push_front(QueuedRequest {
                txn,
                kind: new_kind,
                releases: Vec::new(),
            });
        self.wait_until_held(&mut state, txn, name, new_kind);
        Ok(())
    }

    /// Grant `kind` on `name` and release every lock in `releases` as one
    /// atomic event. `name` itself may appear in `releases` (mode change).
    ///
    /// Used for SIX promotion and escalation. Like [`LockManager::promote`],
    /// a conflicting request waits at the front of the queue.
    pub fn acquire_and_release(
        &self,
        txn: TxnId,
        name: &ResourceName,
        kind: LockKind,
        releases: Vec<ResourceName>,
    ) -> Result<()> {
        if kind == LockKind::NL {
            return Err(QuarryError::invalid_lock("cannot acquire NL; use release"));
        }
        self.mutations.fetch_add(1, Ordering::Relaxed);
        let mut state = self.state.lock();
        if state.kind_held(txn, name) != LockKind::NL && !releases.contains(name) {
            return Err(QuarryError::DuplicateLockRequest {
                txn,
                resource: name.to_string(),
            });
        }
        for released in &releases {
            if state.kind_held(txn, released) == LockKind::NL {
                return Err(QuarryError::NoLockHeld {
                    txn,
                    resource: released.to_string(),
                });
            }
        }
        if state.compatible_with_granted(txn, name, kind) {
            let mut freed = Vec::new();
            for released in &releases {
                if released != name && state.remove(txn, released) {
                    freed.push(released.clone());
                }
            }
            state.install(txn, name, kind);
            if state.process_queues(freed) {
                self.wakeup.notify_all();
            }
            return Ok(());
        }
        state
            .resources
            .entry(name.clone())
            .or_default()
            .queue
            .push_front(QueuedRequest {
                txn,
                kind,
                releases,
            });
        self.wait_until_held(&mut state, txn, name, kind);
        Ok(())
    }

    /// All locks held by `txn`.
    #[must_use]
    pub fn locks_of(&self, txn: TxnId) -> Vec<Lock> {
        self.state.lock().txn_locks.get(&txn).cloned().unwrap_or_default()
    }

    /// All locks granted on `name`.
    #[must_use]
    pub fn locks_on(&self, name: &ResourceName) -> Vec<Lock> {
        self.state
            .lock()
            .resources
            .get(name)
            .map(|e| e.granted.clone())
            .unwrap_or_default()
    }

    /// The mode `txn` holds on `name` (`NL` if none).
    #[must_use]
    pub fn kind_held(&self, txn: TxnId, name: &ResourceName) -> LockKind {
        self.state.lock().kind_held(txn, name)
    }

    /// Locks held by `txn` on strict descendants of `ancestor`.
    #[must_use]
    pub fn descendant_locks(&self, txn: TxnId, ancestor: &ResourceName) -> Vec<Lock> {
        self.state
            .lock()
            .txn_locks
            .get(&txn)
            .map(|locks| {
                locks
                    .iter()
                    .filter(|l| l.name.is_descendant_of(ancestor))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Block until `txn` holds exactly `kind` on `name`.
    ///
    /// Only the waiting transaction's own queued request can install that
    /// lock, so observing it is proof the request was granted.
    fn wait_until_held(
        &self,
        state: &mut MutexGuard<'_, ManagerState>,
        txn: TxnId,
        name: &ResourceName,
        kind: LockKind,
    ) {
        while state.kind_held(txn, name) != kind {
            self.wakeup.wait(state);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, Ordering as AtomicOrdering};
    use std::thread;
    use std::time::Duration;

    use super::*;

    fn mgr() -> Arc<LockManager> {
        Arc::new(LockManager::new())
    }

    fn db() -> ResourceName {
        ResourceName::root("database")
    }

    #[test]
    fn acquire_and_query() {
        let lm = mgr();
        let t1 = TxnId::new(1);
        lm.acquire(t1, &db(), LockKind::IS).unwrap();
        assert_eq!(lm.kind_held(t1, &db()), LockKind::IS);
        assert_eq!(lm.locks_on(&db()).len(), 1);
        assert_eq!(lm.locks_of(t1).len(), 1);
    }

    #[test]
    fn nl_is_never_a_valid_request() {
        let lm = mgr();
        let err = lm.acquire(TxnId::new(1), &db(), LockKind::NL).unwrap_err();
        assert!(err.is_lock_error());
    }

    #[test]
    fn duplicate_acquire_is_rejected() {
        let lm = mgr();
        let t1 = TxnId::new(1);
        lm.acquire(t1, &db(), LockKind::S).unwrap();
        let err = lm.acquire(t1, &db(), LockKind::X).unwrap_err();
        assert!(matches!(err, QuarryError::DuplicateLockRequest { .. }));
    }

    #[test]
    fn compatible_grants_coexist() {
        let lm = mgr();
        lm.acquire(TxnId::new(1), &db(), LockKind::S).unwrap();
        lm.acquire(TxnId::new(2), &db(), LockKind::S).unwrap();
        assert_eq!(lm.locks_on(&db()).len(), 2);
    }

    #[test]
    fn release_without_lock_is_rejected() {
        let lm = mgr();
        let err = lm.release(TxnId::new(1), &db()).unwrap_err();
        assert!(matches!(err, QuarryError::NoLockHeld { .. }));
    }

    #[test]
    fn conflicting_acquire_blocks_until_release() {
        let lm = mgr();
        let t1 = TxnId::new(1);
        let t2 = TxnId::new(2);
        lm.acquire(t1, &db(), LockKind::X).unwrap();

        let entered = Arc::new(AtomicBool::new(false));
        let handle = {
            let lm = Arc::clone(&lm);
            let entered = Arc::clone(&entered);
            thread::spawn(move || {
                entered.store(true, AtomicOrdering::SeqCst);
                lm.acquire(t2, &db(), LockKind::S).unwrap();
            })
        };

        while !entered.load(AtomicOrdering::SeqCst) {
            thread::yield_now();
        }
        thread::sleep(Duration::from_millis(20));
        assert_eq!(lm.kind_held(t2, &db()), LockKind::NL, "t2 still waiting");

        lm.release(t1, &db()).unwrap();
        handle.join().unwrap();
        assert_eq!(lm.kind_held(t2, &db()), LockKind::S);
    }

    #[test]
    fn queue_is_fifo_and_stops_at_first_incompatible() {
        let lm = mgr();
        let t1 = TxnId::new(1);
        let t2 = TxnId::new(2);
        let t3 = TxnId::new(3);
        lm.acquire(t1, &db(), LockKind::X).unwrap();

        // t2 queues an X, then t3 queues an S. When t1 releases, only t2
        // may be granted: t3 sits behind the incompatible front.
        let h2 = {
            let lm = Arc::clone(&lm);
            thread::spawn(move || lm.acquire(t2, &db(), LockKind::X).unwrap())
        };
        while lm.state.lock().resources.get(&db()).is_none_or(|e| e.queue.is_empty()) {
            thread::yield_now();
        }
        let h3 = {
            let lm = Arc::clone(&lm);
            thread::spawn(move || lm.acquire(t3, &db(), LockKind::S).unwrap())
        };
        while lm.state.lock().resources.get(&db()).unwrap().queue.len() < 2 {
            thread::yield_now();
        }

        lm.release(t1, &db()).unwrap();
        h2.join().unwrap();
        assert_eq!(lm.kind_held(t2, &db()), LockKind::X);
        assert_eq!(lm.kind_held(t3, &db()), LockKind::NL, "S waits behind X holder");

        lm.release(t2, &db()).unwrap();
        h3.join().unwrap();
        assert_eq!(lm.kind_held(t3, &db()), LockKind::S);
    }

    #[test]
    fn later_compatible_requests_do_not_jump_the_queue() {
        let lm = mgr();
        let t1 = TxnId::new(1);
        let t2 = TxnId::new(2);
        let t3 = TxnId::new(3);
        lm.acquire(t1, &db(), LockKind::S).unwrap();

        // t2's X must wait; t3's S is compatible with t1's grant but must
        // not overtake t2.
        let h2 = {
            let lm = Arc::clone(&lm);
            thread::spawn(move || lm.acquire(t2, &db(), LockKind::X).unwrap())
        };
        while lm.state.lock().resources.get(&db()).is_none_or(|e| e.queue.is_empty()) {
            thread::yield_now();
        }
        let h3 = {
            let lm = Arc::clone(&lm);
            thread::spawn(move || lm.acquire(t3, &db(), LockKind::S).unwrap())
        };

        thread::sleep(Duration::from_millis(20));
        assert_eq!(lm.kind_held(t3, &db()), LockKind::NL, "queue is strict FIFO");

        lm.release(t1, &db()).unwrap();
        h2.join().unwrap();
        lm.release(t2, &db()).unwrap();
        h3.join().unwrap();
        assert_eq!(lm.kind_held(t3, &db()), LockKind::S);
    }

    #[test]
    fn promote_requires_strict_upgrade() {
        let lm = mgr();
        let t1 = TxnId::new(1);
        lm.acquire(t1, &db(), LockKind::S).unwrap();

        assert!(matches!(
            lm.promote(t1, &db(), LockKind::S).unwrap_err(),
            QuarryError::DuplicateLockRequest { .. }
        ));
        assert!(lm.promote(t1, &db(), LockKind::IS).unwrap_err().is_lock_error());

        lm.promote(t1, &db(), LockKind::X).unwrap();
        assert_eq!(lm.kind_held(t1, &db()), LockKind::X);
        assert_eq!(lm.locks_on(&db()).len(), 1, "promotion replaces, not adds");
    }

    #[test]
    fn promote_without_lock_is_rejected() {
        let lm = mgr();
        assert!(matches!(
            lm.promote(TxnId::new(1), &db(), LockKind::X).unwrap_err(),
            QuarryError::NoLockHeld { .. }
        ));
    }

    #[test]
    fn promote_overtakes_pending_requests_when_compatible_with_grants() {
        let lm = mgr();
        let t1 = TxnId::new(1);
        let t2 = TxnId::new(2);
        lm.acquire(t1, &db(), LockKind::S).unwrap();

        // t2 queues an X behind t1's S.
        let h2 = {
            let lm = Arc::clone(&lm);
            thread::spawn(move || lm.acquire(t2, &db(), LockKind::X).unwrap())
        };
        while lm.state.lock().resources.get(&db()).is_none_or(|e| e.queue.is_empty()) {
            thread::yield_now();
        }

        // Waiting behind t2 would deadlock; the upgrade goes through.
        lm.promote(t1, &db(), LockKind::X).unwrap();
        assert_eq!(lm.kind_held(t1, &db()), LockKind::X);

        lm.release(t1, &db()).unwrap();
        h2.join().unwrap();
        assert_eq!(lm.kind_held(t2, &db()), LockKind::X);
    }

    #[test]
    fn acquire_and_release_is_one_atomic_event() {
        let lm = mgr();
        let t1 = TxnId::new(1);
        let table = db().child("users");
        let p3 = table.child("3");
        let p5 = table.child("5");
        lm.acquire(t1, &table, LockKind::IX).unwrap();
        lm.acquire(t1, &p3, LockKind::S).unwrap();
        lm.acquire(t1, &p5, LockKind::X).unwrap();

        lm.acquire_and_release(t1, &table, LockKind::X, vec![p3.clone(), p5.clone(), table.clone()])
            .unwrap();

        assert_eq!(lm.kind_held(t1, &table), LockKind::X);
        assert_eq!(lm.kind_held(t1, &p3), LockKind::NL);
        assert_eq!(lm.kind_held(t1, &p5), LockKind::NL);
        assert_eq!(lm.locks_of(t1).len(), 1);
    }

    #[test]
    fn acquire_and_release_validates_the_release_set() {
        let lm = mgr();
        let t1 = TxnId::new(1);
        let table = db().child("users");
        lm.acquire(t1, &table, LockKind::IX).unwrap();

        let missing = table.child("9");
        let err = lm
            .acquire_and_release(t1, &table, LockKind::X, vec![table.clone(), missing])
            .unwrap_err();
        assert!(matches!(err, QuarryError::NoLockHeld { .. }));

        // Holding a lock on the target without releasing it is a duplicate.
        let err = lm
            .acquire_and_release(t1, &table, LockKind::X, vec![])
            .unwrap_err();
        assert!(matches!(err, QuarryError::DuplicateLockRequest { .. }));
    }

    #[test]
    fn releases_wake_waiters_on_other_resources() {
        let lm = mgr();
        let t1 = TxnId::new(1);
        let t2 = TxnId::new(2);
        let table = db().child("users");
        let p3 = table.child("3");
        lm.acquire(t1, &table, LockKind::IX).unwrap();
        lm.acquire(t1, &p3, LockKind::X).unwrap();

        let h2 = {
            let lm = Arc::clone(&lm);
            let p3 = p3.clone();
            thread::spawn(move || lm.acquire(t2, &p3, LockKind::S).unwrap())
        };
        while lm.state.lock().resources.get(&p3).is_none_or(|e| e.queue.is_empty()) {
            thread::yield_now();
        }

        // Escalating t1 to X on the table releases p3 and must wake t2
        // only after t1's table lock no longer conflicts... S on a page is
        // independent of X on the table at the manager level, so t2 runs.
        lm.acquire_and_release(t1, &table, LockKind::X, vec![p3.clone(), table.clone()])
            .unwrap();
        h2.join().unwrap();
        assert_eq!(lm.kind_held(t2, &p3), LockKind::S);
    }
}
