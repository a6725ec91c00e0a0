//! Declarative lock acquisition.
//!
//! Callers say what they need (`S`, `X`, or nothing) at a context; this
//! module issues the least permissive sequence of acquires, promotes, and
//! escalations that gets there, fixing up ancestor intents along the way.

use std::sync::Arc;

use quarry_error::Result;
use quarry_types::TxnId;

use crate::context::LockContext;
use crate::kind::LockKind;

/// Ensure `txn` can perform actions requiring `request` at `ctx`.
///
/// `request` must be one of `NL`, `S`, `X`. On return, the transaction's
/// effective lock at `ctx` substitutes `request`:
///
/// 1. Already sufficient: nothing happens (this covers `NL`).
/// 2. Explicit `IX` and `S` requested: promote to `SIX`.
/// 3. Explicit intent lock: escalate (the intent proves the ancestors are
///    already covered).
/// 4. Otherwise: bring every ancestor to the matching intent, root first,
///    then acquire or promote here.
pub fn ensure_sufficient_lock_held(
    txn: TxnId,
    ctx: &Arc<LockContext>,
    request: LockKind,
) -> Result<()> {
    debug_assert!(
        matches!(request, LockKind::NL | LockKind::S | LockKind::X),
        "effective-lock requests are NL, S, or X"
    );

    let effective = ctx.effective_lock(txn);
    if effective.substitutable(request) {
        return Ok(());
    }

    let explicit = ctx.explicit_lock(txn);
    if explicit == LockKind::IX && request == LockKind::S {
        return ctx.promote(txn, LockKind::SIX);
    }
    if explicit.is_intent() {
        return ctx.escalate(txn);
    }

    // Explicit is NL or S here. Cover the ancestors, then take the lock.
    let intent = if request == LockKind::X {
        LockKind::IX
    } else {
        LockKind::IS
    };
    if let Some(parent) = ctx.parent() {
        ensure_ancestor_intent(txn, &parent, intent)?;
    }
    if effective == LockKind::NL {
        ctx.acquire(txn, request)
    } else {
        ctx.promote(txn, request)
    }
}

/// Bring `ctx` and all its ancestors to at least `intent`, root first.
fn ensure_ancestor_intent(txn: TxnId, ctx: &Arc<LockContext>, intent: LockKind) -> Result<()> {
    if let Some(parent) = ctx.parent() {
        ensure_ancestor_intent(txn, &parent, intent)?;
    }
    let held = ctx.effective_lock(txn);
    if held.substitutable(intent) {
        return Ok(());
    }
    if held == LockKind::NL {
        ctx.acquire(txn, intent)
    } else {
        ctx.promote(txn, intent)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manager::LockManager;

    fn setup() -> (Arc<LockManager>, Arc<LockContext>, Arc<LockContext>, Arc<LockContext>) {
        let manager = Arc::new(LockManager::new());
        let db = manager.context("database");
        let table = db.child("users");
        let page = table.child("3");
        (manager, db, table, page)
    }

    #[test]
    fn read_request_builds_the_intent_chain() {
        let (_, db, table, page) = setup();
        let t1 = TxnId::new(1);
        ensure_sufficient_lock_held(t1, &page, LockKind::S).unwrap();

        assert_eq!(db.explicit_lock(t1), LockKind::IS);
        assert_eq!(table.explicit_lock(t1), LockKind::IS);
        assert_eq!(page.explicit_lock(t1), LockKind::S);
    }

    #[test]
    fn write_after_read_upgrades_the_chain() {
        let (_, db, table, page) = setup();
        let t1 = TxnId::new(1);
        ensure_sufficient_lock_held(t1, &page, LockKind::S).unwrap();
        ensure_sufficient_lock_held(t1, &page, LockKind::X).unwrap();

        assert_eq!(db.explicit_lock(t1), LockKind::IX);
        assert_eq!(table.explicit_lock(t1), LockKind::IX);
        assert_eq!(page.explicit_lock(t1), LockKind::X);
    }

    #[test]
    fn satisfied_requests_do_nothing() {
        let (manager, _, table, page) = setup();
        let t1 = TxnId::new(1);
        ensure_sufficient_lock_held(t1, &table, LockKind::S).unwrap();

        let before = manager.mutation_count();
        ensure_sufficient_lock_held(t1, &page, LockKind::S).unwrap();
        ensure_sufficient_lock_held(t1, &table, LockKind::NL).unwrap();
        assert_eq!(manager.mutation_count(), before, "ancestor S already covers");
    }

    #[test]
    fn shared_request_over_ix_promotes_to_six() {
        let (_, db, table, page) = setup();
        let t1 = TxnId::new(1);
        ensure_sufficient_lock_held(t1, &page, LockKind::X).unwrap();

        ensure_sufficient_lock_held(t1, &table, LockKind::S).unwrap();
        assert_eq!(table.explicit_lock(t1), LockKind::SIX);
        assert_eq!(db.explicit_lock(t1), LockKind::IX);
        assert_eq!(
            page.explicit_lock(t1),
            LockKind::X,
            "X below SIX is kept, only S/IS are absorbed"
        );
    }

    #[test]
    fn intent_holder_escalates() {
        let (_, _, table, page) = setup();
        let t1 = TxnId::new(1);
        ensure_sufficient_lock_held(t1, &page, LockKind::S).unwrap();

        // Table holds IS; asking for S at the table escalates instead of
        // stacking a second chain.
        ensure_sufficient_lock_held(t1, &table, LockKind::S).unwrap();
        assert_eq!(table.explicit_lock(t1), LockKind::S);
        assert_eq!(page.explicit_lock(t1), LockKind::NL);
    }

    #[test]
    fn exclusive_request_over_intent_escalates_to_x() {
        let (_, _, table, page) = setup();
        let t1 = TxnId::new(1);
        ensure_sufficient_lock_held(t1, &page, LockKind::X).unwrap();

        ensure_sufficient_lock_held(t1, &table, LockKind::X).unwrap();
        assert_eq!(table.explicit_lock(t1), LockKind::X);
        assert_eq!(page.explicit_lock(t1), LockKind::NL);
    }
}
