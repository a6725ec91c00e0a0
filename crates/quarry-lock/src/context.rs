//! Hierarchy-aware locking over a tree of resources.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use quarry_error::{QuarryError, Result};
use quarry_types::TxnId;
use tracing::debug;

use crate::kind::LockKind;
use crate::manager::LockManager;
use crate::resource::ResourceName;

/// A node in the resource tree (database, a table, a page).
///
/// Wraps [`LockManager`] calls with multigranularity enforcement: every
/// mutation checks the parent's intent mode, and the per-transaction count
/// of child locks is maintained so enclosing layers can decide when to
/// escalate. Contexts outlive transactions; parents own children through
/// the child map, children point up through a non-owning reference.
pub struct LockContext {
    manager: Arc<LockManager>,
    parent: Option<Weak<LockContext>>,
    name: ResourceName,
    readonly: AtomicBool,
    child_locks_disabled: AtomicBool,
    children: Mutex<HashMap<String, Arc<LockContext>>>,
    child_lock_counts: Mutex<HashMap<TxnId, usize>>,
}

impl LockContext {
    pub(crate) fn new_root(manager: Arc<LockManager>, name: &str) -> Arc<Self> {
        Arc::new(Self {
            manager,
            parent: None,
            name: ResourceName::root(name),
            readonly: AtomicBool::new(false),
            child_locks_disabled: AtomicBool::new(false),
            children: Mutex::new(HashMap::new()),
            child_lock_counts: Mutex::new(HashMap::new()),
        })
    }

    /// The context for the child named `segment`, created on first use.
    ///
    /// Children of a readonly context, or of one with child locks disabled,
    /// are created readonly.
    #[must_use]
    pub fn child(self: &Arc<Self>, segment: &str) -> Arc<Self> {
        let mut children = self.children.lock();
        children
            .entry(segment.to_owned())
            .or_insert_with(|| {
                let readonly =
                    self.readonly.load(Ordering::Acquire) || self.child_locks_disabled.load(Ordering::Acquire);
                Arc::new(Self {
                    manager: Arc::clone(&self.manager),
                    parent: Some(Arc::downgrade(self)),
                    name: self.name.child(segment),
                    readonly: AtomicBool::new(readonly),
                    child_locks_disabled: AtomicBool::new(readonly),
                    children: Mutex::new(HashMap::new()),
                    child_lock_counts: Mutex::new(HashMap::new()),
                })
            })
            .clone()
    }

    /// Walk the context tree to the node for a full resource path.
    #[must_use]
    pub fn from_resource_name(manager: &Arc<LockManager>, name: &ResourceName) -> Arc<Self> {
        let mut parts = name.parts().iter();
        let root = parts.next().expect("resource names are never empty");
        let mut ctx = manager.context(root);
        for segment in parts {
            ctx = ctx.child(segment);
        }
        ctx
    }

    /// The resource this context locks.
    #[must_use]
    pub fn name(&self) -> &ResourceName {
        &self.name
    }

    /// The enclosing context, or `None` at the root.
    #[must_use]
    pub fn parent(&self) -> Option<Arc<Self>> {
        self.parent.as_ref().and_then(Weak::upgrade)
    }

    /// Whether mutations through this context are forbidden.
    #[must_use]
    pub fn is_readonly(&self) -> bool {
        self.readonly.load(Ordering::Acquire)
    }

    /// Turn this context readonly. There is no way back.
    pub fn set_readonly(&self) {
        self.readonly.store(true, Ordering::Release);
    }

    /// Make all future child contexts readonly. Used for indices and
    /// temporary tables, where finer-grain locks are disallowed.
    pub fn disable_child_locks(&self) {
        self.child_locks_disabled.store(true, Ordering::Release);
    }

    /// The mode `txn` explicitly holds at this node (`NL` if none).
    #[must_use]
    pub fn explicit_lock(&self, txn: TxnId) -> LockKind {
        self.manager.kind_held(txn, &self.name)
    }

    /// The mode `txn` effectively has here: the explicit mode if present,
    /// else what an ancestor's lock implies (`S`/`X` carry down, `SIX`
    /// implies `S`, intent-only ancestors imply nothing).
    #[must_use]
    pub fn effective_lock(&self, txn: TxnId) -> LockKind {
        let explicit = self.explicit_lock(txn);
        if explicit != LockKind::NL {
            return explicit;
        }
        let mut ancestor = self.parent();
        while let Some(ctx) = ancestor {
            match ctx.explicit_lock(txn) {
                kind @ (LockKind::S | LockKind::X) => return kind,
                LockKind::SIX => return LockKind::S,
                _ => {}
            }
            ancestor = ctx.parent();
        }
        LockKind::NL
    }

    /// Locks held by `txn` on children of this node (transitively).
    #[must_use]
    pub fn num_children(&self, txn: TxnId) -> usize {
        self.child_lock_counts.lock().get(&txn).copied().unwrap_or(0)
    }

    /// Acquire `kind` at this node for `txn`.
    ///
    /// The parent must hold an intent mode that admits `kind` below it, and
    /// an `IS`/`S` request under a `SIX` ancestor is redundant and rejected.
    pub fn acquire(&self, txn: TxnId, kind: LockKind) -> Result<()> {
        self.check_writable()?;
        if kind == LockKind::NL {
            return Err(QuarryError::invalid_lock("cannot acquire NL; use release"));
        }
        if let Some(parent) = self.parent() {
            let parent_kind = parent.explicit_lock(txn);
            if !parent_kind.can_be_parent(kind) {
                return Err(QuarryError::invalid_lock(format!(
                    "parent {} holds {parent_kind}, which does not admit {kind} on {}",
                    parent.name, self.name
                )));
            }
        }
        if matches!(kind, LockKind::IS | LockKind::S) && self.has_six_ancestor(txn) {
            return Err(QuarryError::invalid_lock(format!(
                "{kind} on {} is redundant under a SIX ancestor",
                self.name
            )));
        }
        self.manager.acquire(txn, &self.name, kind)?;
        self.adjust_parent_count(txn, 1);
        Ok(())
    }

    /// Release `txn`'s lock at this node.
    ///
    /// Denied while `txn` still holds locks below: they would lose their
    /// intent cover.
    pub fn release(&self, txn: TxnId) -> Result<()> {
        self.check_writable()?;
        if self.explicit_lock(txn) == LockKind::NL {
            return Err(QuarryError::NoLockHeld {
                txn,
                resource: self.name.to_string(),
            });
        }
        if !self.manager.descendant_locks(txn, &self.name).is_empty() {
            return Err(QuarryError::invalid_lock(format!(
                "releasing {} would orphan descendant locks",
                self.name
            )));
        }
        self.manager.release(txn, &self.name)?;
        self.adjust_parent_count(txn, -1);
        Ok(())
    }

    /// Promote `txn`'s lock here to the strictly stronger `new_kind`.
    ///
    /// Promoting to `SIX` absorbs every `S`/`IS` the transaction holds
    /// below this node: they become redundant and are released in the same
    /// atomic event that installs the `SIX`.
    pub fn promote(&self, txn: TxnId, new_kind: LockKind) -> Result<()> {
        self.check_writable()?;
        let current = self.explicit_lock(txn);
        if current == LockKind::NL {
            return Err(QuarryError::NoLockHeld {
                txn,
                resource: self.name.to_string(),
            });
        }
        if current == new_kind {
            return Err(QuarryError::DuplicateLockRequest {
                txn,
                resource: self.name.to_string(),
            });
        }
        if !new_kind.substitutable(current) {
            return Err(QuarryError::invalid_lock(format!(
                "{new_kind} does not substitute {current} on {}",
                self.name
            )));
        }
        if let Some(parent) = self.parent() {
            let parent_kind = parent.explicit_lock(txn);
            if !parent_kind.can_be_parent(new_kind) {
                return Err(QuarryError::invalid_lock(format!(
                    "parent {} holds {parent_kind}, which does not admit {new_kind}",
                    parent.name
                )));
            }
        }

        if new_kind == LockKind::SIX {
            if self.has_six_ancestor(txn) {
                return Err(QuarryError::invalid_lock(format!(
                    "SIX on {} under a SIX ancestor",
                    self.name
                )));
            }
            let absorbed: Vec<ResourceName> = self
                .manager
                .descendant_locks(txn, &self.name)
                .into_iter()
                .filter(|l| matches!(l.kind, LockKind::S | LockKind::IS))
                .map(|l| l.name)
                .collect();
            let mut releases = absorbed.clone();
            releases.push(self.name.clone());
            self.manager
                .acquire_and_release(txn, &self.name, LockKind::SIX, releases)?;
            debug!(txn = %txn, resource = %self.name, absorbed = absorbed.len(), "promoted to SIX");
            for released in &absorbed {
                Self::uncount_released(&self.manager, released, txn);
            }
            Ok(())
        } else {
            self.manager.promote(txn, &self.name, new_kind)
        }
    }

    /// Collapse every lock `txn` holds below this node into one `S` or `X`
    /// here.
    ///
    /// `X` is chosen iff this node or any descendant holds `IX`, `SIX`, or
    /// `X`. Idempotent: when the node already holds the target mode nothing
    /// is issued; otherwise exactly one mutating manager call is made.
    pub fn escalate(&self, txn: TxnId) -> Result<()> {
        self.check_writable()?;
        let current = self.explicit_lock(txn);
        if current == LockKind::NL {
            return Err(QuarryError::NoLockHeld {
                txn,
                resource: self.name.to_string(),
            });
        }

        let descendants = self.manager.descendant_locks(txn, &self.name);
        let needs_x = matches!(current, LockKind::IX | LockKind::SIX | LockKind::X)
            || descendants
                .iter()
                .any(|l| matches!(l.kind, LockKind::IX | LockKind::SIX | LockKind::X));
        let target = if needs_x { LockKind::X } else { LockKind::S };
        if current == target {
            return Ok(());
        }

        let released_names: Vec<ResourceName> = descendants.into_iter().map(|l| l.name).collect();
        let mut releases = released_names.clone();
        releases.push(self.name.clone());
        self.manager
            .acquire_and_release(txn, &self.name, target, releases)?;
        debug!(txn = %txn, resource = %self.name, target = %target, collapsed = released_names.len(), "escalated");
        for released in &released_names {
            Self::uncount_released(&self.manager, released, txn);
        }
        Ok(())
    }

    fn check_writable(&self) -> Result<()> {
        if self.is_readonly() {
            return Err(QuarryError::ReadonlyContext {
                resource: self.name.to_string(),
            });
        }
        Ok(())
    }

    fn has_six_ancestor(&self, txn: TxnId) -> bool {
        let mut ancestor = self.parent();
        while let Some(ctx) = ancestor {
            if ctx.explicit_lock(txn) == LockKind::SIX {
                return true;
            }
            ancestor = ctx.parent();
        }
        false
    }

    fn adjust_parent_count(&self, txn: TxnId, delta: isize) {
        if let Some(parent) = self.parent() {
            let mut counts = parent.child_lock_counts.lock();
            let count = counts.entry(txn).or_insert(0);
            *count = count.checked_add_signed(delta).unwrap_or(0);
        }
    }

    /// Decrement the child count above a lock released out-of-band (by an
    /// `acquire_and_release` rather than through its own context).
    fn uncount_released(manager: &Arc<LockManager>, released: &ResourceName, txn: TxnId) {
        let ctx = Self::from_resource_name(manager, released);
        ctx.adjust_parent_count(txn, -1);
    }
}

impl std::fmt::Debug for LockContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LockContext")
            .field("name", &self.name.to_string())
            .field("readonly", &self.is_readonly())
            .finish_non_exhaustive()
    }
}
