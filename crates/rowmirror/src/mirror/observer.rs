//! Row-level observers: the [`RowObserver`] trait, closure adapters and the
//! per-table observer registry.
//!
//! # API Styles
//!
//! - **Trait-based**: implement [`RowObserver`] to handle inserts, deletes,
//!   updates and skipped diffs in one place.
//! - **Closure-based**: build a [`RowCallbacks`] or use the single-callback
//!   shortcuts on [`ClientCache`](crate::cache::ClientCache).
//!
//! Callbacks receive an [`EventContext`] with shared access to every mirror.
//! They cannot mutate the cache that dispatched them; any attempt to do so
//! is rejected. Other caches stay usable from inside a callback.

use fxhash::FxHashMap;
use smallvec::SmallVec;

use super::diff::DiffError;
use super::table::{MirrorSet, TableMirror};
use crate::predicate::{scope_matches, BoundPredicate};
use crate::schema::Row;
use crate::subscription::SubscriptionId;

// ---------------------------------------------------------------------------
// EventContext
// ---------------------------------------------------------------------------

/// What caused a dispatch batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheEvent {
    /// A server transaction.
    Transaction {
        /// Server sequence number.
        sequence: u64,
    },
    /// Initial rows of a subscription.
    SubscriptionApplied(SubscriptionId),
    /// A subscription was rejected.
    SubscriptionError(SubscriptionId),
    /// Rows left the mirror because a subscription was removed.
    SubscriptionRemoved(SubscriptionId),
    /// Mirrors were cleared for a new session.
    Reconnect,
    /// The cache was shut down.
    Shutdown,
}

/// Read-only view of the cache handed to every callback.
///
/// `epoch` identifies the dispatch batch. All callbacks fired for one
/// transaction share an epoch, and the mirrors they see already reflect the
/// whole transaction.
#[derive(Debug, Clone, Copy)]
pub struct EventContext<'a> {
    /// Origin of the batch.
    pub event: CacheEvent,
    /// Batch identity, unique per cache.
    pub epoch: u64,
    /// Mirrors after the batch was applied.
    pub tables: &'a MirrorSet,
}

impl<'a> EventContext<'a> {
    /// Mirror of `table`, if it is covered.
    #[must_use]
    pub fn table(&self, table: &str) -> Option<&'a TableMirror> {
        self.tables.get(table)
    }
}

// ---------------------------------------------------------------------------
// RowObserver
// ---------------------------------------------------------------------------

/// Receives row changes for one table.
///
/// Every method has a default, so implementors override only what they need.
///
/// ```rust,ignore
/// struct Counter(usize);
///
/// impl RowObserver for Counter {
///     fn on_insert(&mut self, _ctx: &EventContext<'_>, _row: &Row) {
///         self.0 += 1;
///     }
/// }
/// ```
pub trait RowObserver: Send + 'static {
    /// A row entered the observer's scope.
    fn on_insert(&mut self, ctx: &EventContext<'_>, row: &Row) {
        let _ = (ctx, row);
    }

    /// A row left the observer's scope.
    fn on_delete(&mut self, ctx: &EventContext<'_>, row: &Row) {
        let _ = (ctx, row);
    }

    /// A row changed and stayed in scope.
    fn on_update(&mut self, ctx: &EventContext<'_>, old: &Row, new: &Row) {
        let _ = (ctx, old, new);
    }

    /// A diff for this table was skipped.
    ///
    /// Default implementation logs the error via `tracing::warn!`.
    fn on_error(&mut self, ctx: &EventContext<'_>, error: &DiffError) {
        tracing::warn!(epoch = ctx.epoch, "row observer error: {}", error);
    }
}

type RowFn = Box<dyn FnMut(&EventContext<'_>, &Row) + Send>;
type UpdateFn = Box<dyn FnMut(&EventContext<'_>, &Row, &Row) + Send>;
type ErrorFn = Box<dyn FnMut(&EventContext<'_>, &DiffError) + Send>;

/// Closure-based [`RowObserver`].
///
/// ```
/// use rowmirror::mirror::RowCallbacks;
///
/// let callbacks = RowCallbacks::new()
///     .on_insert(|_ctx, row| println!("insert {row:?}"))
///     .on_delete(|_ctx, row| println!("delete {row:?}"));
/// # drop(callbacks);
/// ```
#[derive(Default)]
pub struct RowCallbacks {
    insert: Option<RowFn>,
    delete: Option<RowFn>,
    update: Option<UpdateFn>,
    error: Option<ErrorFn>,
}

impl RowCallbacks {
    /// Creates an observer with no callbacks.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the insert callback.
    #[must_use]
    pub fn on_insert(
        mut self,
        f: impl FnMut(&EventContext<'_>, &Row) + Send + 'static,
    ) -> Self {
        self.insert = Some(Box::new(f));
        self
    }

    /// Sets the delete callback.
    #[must_use]
    pub fn on_delete(
        mut self,
        f: impl FnMut(&EventContext<'_>, &Row) + Send + 'static,
    ) -> Self {
        self.delete = Some(Box::new(f));
        self
    }

    /// Sets the update callback.
    #[must_use]
    pub fn on_update(
        mut self,
        f: impl FnMut(&EventContext<'_>, &Row, &Row) + Send + 'static,
    ) -> Self {
        self.update = Some(Box::new(f));
        self
    }

    /// Sets the error callback, replacing the logging default.
    #[must_use]
    pub fn on_error(
        mut self,
        f: impl FnMut(&EventContext<'_>, &DiffError) + Send + 'static,
    ) -> Self {
        self.error = Some(Box::new(f));
        self
    }
}

impl std::fmt::Debug for RowCallbacks {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RowCallbacks")
            .field("insert", &self.insert.is_some())
            .field("delete", &self.delete.is_some())
            .field("update", &self.update.is_some())
            .field("error", &self.error.is_some())
            .finish()
    }
}

impl RowObserver for RowCallbacks {
    fn on_insert(&mut self, ctx: &EventContext<'_>, row: &Row) {
        if let Some(f) = &mut self.insert {
            f(ctx, row);
        }
    }

    fn on_delete(&mut self, ctx: &EventContext<'_>, row: &Row) {
        if let Some(f) = &mut self.delete {
            f(ctx, row);
        }
    }

    fn on_update(&mut self, ctx: &EventContext<'_>, old: &Row, new: &Row) {
        if let Some(f) = &mut self.update {
            f(ctx, old, new);
        }
    }

    fn on_error(&mut self, ctx: &EventContext<'_>, error: &DiffError) {
        match &mut self.error {
            Some(f) => f(ctx, error),
            None => tracing::warn!(epoch = ctx.epoch, "row observer error: {}", error),
        }
    }
}

// ---------------------------------------------------------------------------
// ObserverRegistry
// ---------------------------------------------------------------------------

/// Identifier of a registered observer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObserverId(pub u64);

impl std::fmt::Display for ObserverId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "obs-{}", self.0)
    }
}

struct ObserverEntry {
    table: String,
    scope: Option<BoundPredicate>,
    observer: Box<dyn RowObserver>,
}

/// Observers indexed by table, in registration order.
#[derive(Default)]
pub(crate) struct ObserverRegistry {
    next_id: u64,
    entries: FxHashMap<ObserverId, ObserverEntry>,
    by_table: FxHashMap<String, Vec<ObserverId>>,
}

impl ObserverRegistry {
    pub(crate) fn register(
        &mut self,
        table: &str,
        scope: Option<BoundPredicate>,
        observer: Box<dyn RowObserver>,
    ) -> ObserverId {
        let id = ObserverId(self.next_id);
        self.next_id += 1;
        self.entries.insert(
            id,
            ObserverEntry {
                table: table.to_string(),
                scope,
                observer,
            },
        );
        self.by_table.entry(table.to_string()).or_default().push(id);
        id
    }

    pub(crate) fn remove(&mut self, id: ObserverId) -> bool {
        let Some(entry) = self.entries.remove(&id) else {
            return false;
        };
        if let Some(ids) = self.by_table.get_mut(&entry.table) {
            ids.retain(|other| *other != id);
            if ids.is_empty() {
                self.by_table.remove(&entry.table);
            }
        }
        true
    }

    /// Drops every observer of `table`, returning how many were removed.
    pub(crate) fn remove_table(&mut self, table: &str) -> usize {
        let ids = self.by_table.remove(table).unwrap_or_default();
        for id in &ids {
            self.entries.remove(id);
        }
        ids.len()
    }

    pub(crate) fn clear(&mut self) {
        self.entries.clear();
        self.by_table.clear();
    }

    pub(crate) fn contains(&self, id: ObserverId) -> bool {
        self.entries.contains_key(&id)
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }

    /// Observers of `table`, in registration order.
    pub(crate) fn for_table(&self, table: &str) -> &[ObserverId] {
        self.by_table.get(table).map_or(&[], Vec::as_slice)
    }

    /// Scope of an observer: `None` if unknown, `Some(None)` if unfiltered.
    pub(crate) fn scope(&self, id: ObserverId) -> Option<Option<&BoundPredicate>> {
        self.entries.get(&id).map(|e| e.scope.as_ref())
    }

    /// Observers of `table` whose scope matches `row`.
    pub(crate) fn matching(&self, table: &str, row: &Row) -> SmallVec<[ObserverId; 4]> {
        self.for_table(table)
            .iter()
            .copied()
            .filter(|id| {
                self.scope(*id)
                    .is_some_and(|scope| scope_matches(scope, row))
            })
            .collect()
    }

    pub(crate) fn get_mut(&mut self, id: ObserverId) -> Option<&mut (dyn RowObserver + 'static)> {
        self.entries.get_mut(&id).map(|e| e.observer.as_mut())
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use parking_lot::Mutex;

    use super::*;
    use crate::predicate::col;
    use crate::schema::{ColumnType, TableSchema};

    fn schema() -> TableSchema {
        TableSchema::new("orders")
            .column("id", ColumnType::Int)
            .column("amount", ColumnType::Int)
            .primary_key("id")
    }

    #[test]
    fn test_matching_respects_scope_and_order() {
        let mut reg = ObserverRegistry::default();
        let big = col("amount").gt(100).bind(&schema()).unwrap();
        let a = reg.register("orders", Some(big), Box::new(RowCallbacks::new()));
        let b = reg.register("orders", None, Box::new(RowCallbacks::new()));
        reg.register("users", None, Box::new(RowCallbacks::new()));

        let small = Row::new(vec![1.into(), 5.into()]);
        let large = Row::new(vec![2.into(), 500.into()]);
        assert_eq!(reg.matching("orders", &small).as_slice(), &[b]);
        assert_eq!(reg.matching("orders", &large).as_slice(), &[a, b]);
        assert!(reg.matching("missing", &large).is_empty());
    }

    #[test]
    fn test_remove_and_remove_table() {
        let mut reg = ObserverRegistry::default();
        let a = reg.register("orders", None, Box::new(RowCallbacks::new()));
        reg.register("orders", None, Box::new(RowCallbacks::new()));
        assert!(reg.remove(a));
        assert!(!reg.remove(a));
        assert_eq!(reg.remove_table("orders"), 1);
        assert_eq!(reg.len(), 0);
        assert!(reg.for_table("orders").is_empty());
    }

    #[test]
    fn test_row_callbacks_dispatch() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let s = Arc::clone(&seen);
        let mut cb = RowCallbacks::new().on_update(move |_, old, new| {
            s.lock().push((old.clone(), new.clone()));
        });
        let mirrors = MirrorSet::default();
        let ctx = EventContext {
            event: CacheEvent::Reconnect,
            epoch: 1,
            tables: &mirrors,
        };
        let old = Row::new(vec![1.into(), 1.into()]);
        let new = Row::new(vec![1.into(), 2.into()]);
        RowObserver::on_insert(&mut cb, &ctx, &old);
        RowObserver::on_update(&mut cb, &ctx, &old, &new);
        assert_eq!(seen.lock().as_slice(), &[(old, new)]);
    }
}
