//! Deferred callback dispatch.
//!
//! The applier never calls observers directly. It records every callback in a
//! [`DispatchQueue`] while mutating the mirrors, and the queue is flushed only
//! once the whole event has been applied. Observers therefore never see a
//! half-applied transaction.

use std::cell::RefCell;
use std::sync::atomic::{AtomicU64, Ordering};

use smallvec::SmallVec;

use super::diff::DiffError;
use super::observer::{EventContext, ObserverId, ObserverRegistry};
use crate::predicate::{scope_matches, BoundPredicate};
use crate::schema::Row;

// ---------------------------------------------------------------------------
// Transition
// ---------------------------------------------------------------------------

/// Membership change of a row relative to one observer's predicate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Transition {
    /// Matched neither before nor after: no callback.
    StayOut,
    /// Entered the scope: `on_insert(new)`.
    Enter,
    /// Left the scope: `on_delete(old)`.
    Leave,
    /// Matched before and after: `on_update(old, new)`.
    StayIn,
}

impl Transition {
    /// Classifies from the predicate outcome before and after.
    #[must_use]
    pub fn from_matches(before: bool, after: bool) -> Self {
        match (before, after) {
            (false, false) => Self::StayOut,
            (false, true) => Self::Enter,
            (true, false) => Self::Leave,
            (true, true) => Self::StayIn,
        }
    }
}

/// Reclassifies an update against a scope. An absent scope always yields
/// [`Transition::StayIn`].
#[must_use]
pub fn reclassify(scope: Option<&BoundPredicate>, old: &Row, new: &Row) -> Transition {
    Transition::from_matches(scope_matches(scope, old), scope_matches(scope, new))
}

// ---------------------------------------------------------------------------
// DispatchQueue
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub(crate) enum DispatchKind {
    Insert(Row),
    Delete(Row),
    Update { old: Row, new: Row },
    Error(DiffError),
}

#[derive(Debug, Clone)]
pub(crate) struct Dispatch {
    pub(crate) observer: ObserverId,
    pub(crate) kind: DispatchKind,
}

/// Callbacks recorded during one event, in the order they must fire.
#[derive(Debug, Default)]
pub(crate) struct DispatchQueue {
    pending: Vec<Dispatch>,
}

impl DispatchQueue {
    pub(crate) fn push(&mut self, observer: ObserverId, kind: DispatchKind) {
        self.pending.push(Dispatch { observer, kind });
    }

    /// Queues `on_insert(row)` for each observer of `table` that matches it.
    pub(crate) fn inserted(&mut self, observers: &ObserverRegistry, table: &str, row: &Row) {
        for id in observers.matching(table, row) {
            self.push(id, DispatchKind::Insert(row.clone()));
        }
    }

    /// Queues `on_delete(row)` for each observer of `table` that matches it.
    pub(crate) fn deleted(&mut self, observers: &ObserverRegistry, table: &str, row: &Row) {
        for id in observers.matching(table, row) {
            self.push(id, DispatchKind::Delete(row.clone()));
        }
    }

    /// Queues the reclassified callback of an update for every observer of
    /// `table`.
    pub(crate) fn updated(
        &mut self,
        observers: &ObserverRegistry,
        table: &str,
        old: &Row,
        new: &Row,
    ) {
        for &id in observers.for_table(table) {
            let Some(scope) = observers.scope(id) else {
                continue;
            };
            let kind = match reclassify(scope, old, new) {
                Transition::StayOut => continue,
                Transition::Enter => DispatchKind::Insert(new.clone()),
                Transition::Leave => DispatchKind::Delete(old.clone()),
                Transition::StayIn => DispatchKind::Update {
                    old: old.clone(),
                    new: new.clone(),
                },
            };
            self.push(id, kind);
        }
    }

    /// Queues `on_error` for every observer of `table`.
    pub(crate) fn failed(&mut self, observers: &ObserverRegistry, table: &str, error: &DiffError) {
        for &id in observers.for_table(table) {
            self.push(id, DispatchKind::Error(error.clone()));
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.pending.len()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    #[cfg(test)]
    pub(crate) fn into_vec(self) -> Vec<Dispatch> {
        self.pending
    }

    /// Fires every queued callback in order.
    pub(crate) fn flush(
        self,
        observers: &mut ObserverRegistry,
        ctx: &EventContext<'_>,
        scope: DispatchScope,
    ) {
        if self.is_empty() {
            return;
        }
        tracing::trace!(epoch = ctx.epoch, callbacks = self.pending.len(), "flushing dispatch queue");
        let _guard = scope.enter();
        for Dispatch { observer, kind } in self.pending {
            let Some(target) = observers.get_mut(observer) else {
                continue;
            };
            match &kind {
                DispatchKind::Insert(row) => target.on_insert(ctx, row),
                DispatchKind::Delete(row) => target.on_delete(ctx, row),
                DispatchKind::Update { old, new } => target.on_update(ctx, old, new),
                DispatchKind::Error(err) => target.on_error(ctx, err),
            }
        }
    }
}

// ---------------------------------------------------------------------------
// DispatchScope
// ---------------------------------------------------------------------------

thread_local! {
    static ACTIVE_SCOPES: RefCell<SmallVec<[u64; 4]>> = RefCell::new(SmallVec::new());
}

/// Identity of one cache on the per-thread stack of running dispatches.
///
/// A callback of one cache may drive another cache; only reentry into the
/// cache whose callback is running is rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct DispatchScope(u64);

impl DispatchScope {
    pub(crate) fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        Self(NEXT.fetch_add(1, Ordering::Relaxed))
    }

    /// Marks this scope as running callbacks until the guard drops.
    pub(crate) fn enter(self) -> DispatchGuard {
        ACTIVE_SCOPES.with(|s| s.borrow_mut().push(self.0));
        DispatchGuard(self)
    }

    /// Returns `true` while a callback of this scope runs on this thread.
    pub(crate) fn is_active(self) -> bool {
        ACTIVE_SCOPES.with(|s| s.borrow().contains(&self.0))
    }
}

/// Pops its scope off the thread's dispatch stack on drop.
pub(crate) struct DispatchGuard(DispatchScope);

impl Drop for DispatchGuard {
    fn drop(&mut self) {
        let DispatchScope(own) = self.0;
        ACTIVE_SCOPES.with(|s| {
            let mut scopes = s.borrow_mut();
            if let Some(pos) = scopes.iter().rposition(|&id| id == own) {
                scopes.remove(pos);
            }
        });
    }
}

/// Returns `true` while the current thread is inside an observer callback of
/// any cache.
#[must_use]
pub fn in_dispatch() -> bool {
    ACTIVE_SCOPES.with(|s| !s.borrow().is_empty())
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use parking_lot::Mutex;

    use super::*;
    use crate::mirror::observer::{CacheEvent, RowCallbacks};
    use crate::mirror::table::MirrorSet;
    use crate::predicate::col;
    use crate::schema::{ColumnType, TableSchema};

    fn schema() -> TableSchema {
        TableSchema::new("orders")
            .column("id", ColumnType::Int)
            .column("amount", ColumnType::Int)
            .primary_key("id")
    }

    fn r(id: i64, amount: i64) -> Row {
        Row::new(vec![id.into(), amount.into()])
    }

    #[test]
    fn test_reclassify_table() {
        let p = col("amount").gt(100).bind(&schema()).unwrap();
        let scope = Some(&p);
        assert_eq!(reclassify(scope, &r(1, 50), &r(1, 60)), Transition::StayOut);
        assert_eq!(reclassify(scope, &r(1, 50), &r(1, 150)), Transition::Enter);
        assert_eq!(reclassify(scope, &r(1, 150), &r(1, 50)), Transition::Leave);
        assert_eq!(reclassify(scope, &r(1, 150), &r(1, 200)), Transition::StayIn);
        assert_eq!(reclassify(None, &r(1, 1), &r(1, 2)), Transition::StayIn);
    }

    #[test]
    fn test_updated_queues_one_callback_per_observer() {
        let mut observers = ObserverRegistry::default();
        let p = col("amount").gt(100).bind(&schema()).unwrap();
        let filtered = observers.register("orders", Some(p), Box::new(RowCallbacks::new()));
        let all = observers.register("orders", None, Box::new(RowCallbacks::new()));

        let mut q = DispatchQueue::default();
        q.updated(&observers, "orders", &r(1, 50), &r(1, 150));
        assert_eq!(q.len(), 2);
        assert!(matches!(
            &q.pending[0],
            Dispatch { observer, kind: DispatchKind::Insert(_) } if *observer == filtered
        ));
        assert!(matches!(
            &q.pending[1],
            Dispatch { observer, kind: DispatchKind::Update { .. } } if *observer == all
        ));
    }

    #[test]
    fn test_flush_marks_only_its_own_scope() {
        let scope = DispatchScope::next();
        let other = DispatchScope::next();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let s = Arc::clone(&seen);
        let mut observers = ObserverRegistry::default();
        observers.register(
            "orders",
            None,
            Box::new(RowCallbacks::new().on_insert(move |ctx, _| {
                s.lock()
                    .push((ctx.epoch, in_dispatch(), scope.is_active(), other.is_active()));
            })),
        );
        let mut q = DispatchQueue::default();
        q.inserted(&observers, "orders", &r(1, 1));
        q.inserted(&observers, "orders", &r(2, 2));

        let mirrors = MirrorSet::default();
        let ctx = EventContext {
            event: CacheEvent::Transaction { sequence: 1 },
            epoch: 9,
            tables: &mirrors,
        };
        assert!(!in_dispatch());
        q.flush(&mut observers, &ctx, scope);
        assert!(!in_dispatch());
        assert!(!scope.is_active());
        assert_eq!(
            seen.lock().as_slice(),
            &[(9, true, true, false), (9, true, true, false)]
        );
    }

    #[test]
    fn test_nested_scopes_unwind_in_order() {
        let outer = DispatchScope::next();
        let inner = DispatchScope::next();
        let a = outer.enter();
        {
            let _b = inner.enter();
            assert!(outer.is_active() && inner.is_active());
        }
        assert!(outer.is_active() && !inner.is_active());
        drop(a);
        assert!(!in_dispatch());
    }
}
