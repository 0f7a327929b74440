//! Reactive views: continuously updated, read-only row lists.
//!
//! A view is the single contract UI bindings build on. It owns no diffing
//! logic of its own. It registers a row observer for its table and predicate,
//! and whenever that observer fires it recomputes its list from the table
//! mirror. The recompute happens at most once per dispatch epoch, so a
//! transaction touching a hundred matching rows rebuilds the list once.
//!
//! `ready` becomes `true` only after the view's subscription was applied and
//! its `on_applied` callback ran, so a reader never mistakes a mirror that is
//! still loading for an empty result.

use std::fmt;
use std::sync::Arc;

use parking_lot::RwLock;

use crate::mirror::{DiffError, EventContext, MirrorSet, RowObserver};
use crate::predicate::{BoundPredicate, Predicate};
use crate::schema::Row;

/// Identifier of a reactive view.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ViewId(pub u64);

impl fmt::Display for ViewId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "view-{}", self.0)
    }
}

#[derive(Debug, Default)]
struct ViewState {
    rows: Arc<Vec<Row>>,
    ready: bool,
    error: Option<String>,
    recomputes: u64,
    last_epoch: Option<u64>,
}

#[derive(Debug)]
pub(crate) struct ViewShared {
    table: String,
    scope: Option<BoundPredicate>,
    state: RwLock<ViewState>,
}

impl ViewShared {
    /// Rebuilds the row list unless this epoch was already processed.
    pub(crate) fn refresh(&self, tables: &MirrorSet, epoch: u64) {
        let mut state = self.state.write();
        if state.last_epoch == Some(epoch) {
            return;
        }
        let rows = tables
            .get(&self.table)
            .map(|mirror| mirror.filter(self.scope.as_ref()))
            .unwrap_or_default();
        state.rows = Arc::new(rows);
        state.recomputes += 1;
        state.last_epoch = Some(epoch);
        tracing::trace!(table = %self.table, epoch, rows = state.rows.len(), "view recomputed");
    }

    pub(crate) fn set_ready(&self, ready: bool) {
        let mut state = self.state.write();
        state.ready = ready;
        if ready {
            state.error = None;
        }
    }

    pub(crate) fn set_error(&self, message: &str) {
        let mut state = self.state.write();
        state.ready = false;
        state.error = Some(message.to_string());
    }
}

// ---------------------------------------------------------------------------
// ReactiveView
// ---------------------------------------------------------------------------

/// Read-only, continuously updated projection of one table.
///
/// Cloning is cheap and clones observe the same state, so a view can be handed
/// to a UI thread while the cache stays on the session thread.
#[derive(Clone)]
pub struct ReactiveView {
    id: ViewId,
    predicate: Option<Predicate>,
    shared: Arc<ViewShared>,
}

impl ReactiveView {
    pub(crate) fn new(
        id: ViewId,
        table: &str,
        predicate: Option<Predicate>,
        scope: Option<BoundPredicate>,
    ) -> Self {
        Self {
            id,
            predicate,
            shared: Arc::new(ViewShared {
                table: table.to_string(),
                scope,
                state: RwLock::new(ViewState::default()),
            }),
        }
    }

    pub(crate) fn shared(&self) -> &Arc<ViewShared> {
        &self.shared
    }

    /// View id.
    #[must_use]
    pub fn id(&self) -> ViewId {
        self.id
    }

    /// Table the view projects.
    #[must_use]
    pub fn table(&self) -> &str {
        &self.shared.table
    }

    /// Filter of the view, if any.
    #[must_use]
    pub fn predicate(&self) -> Option<&Predicate> {
        self.predicate.as_ref()
    }

    /// Current rows, ordered by row key.
    #[must_use]
    pub fn rows(&self) -> Arc<Vec<Row>> {
        Arc::clone(&self.shared.state.read().rows)
    }

    /// Rows and readiness read together.
    #[must_use]
    pub fn snapshot(&self) -> (Arc<Vec<Row>>, bool) {
        let state = self.shared.state.read();
        (Arc::clone(&state.rows), state.ready)
    }

    /// Number of rows.
    #[must_use]
    pub fn len(&self) -> usize {
        self.shared.state.read().rows.len()
    }

    /// Returns `true` if the view has no rows.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Returns `true` once the initial rows have arrived.
    #[must_use]
    pub fn is_ready(&self) -> bool {
        self.shared.state.read().ready
    }

    /// Server message if the view's subscription was rejected.
    #[must_use]
    pub fn error(&self) -> Option<String> {
        self.shared.state.read().error.clone()
    }

    /// How many times the row list has been rebuilt.
    #[must_use]
    pub fn recompute_count(&self) -> u64 {
        self.shared.state.read().recomputes
    }

    /// Epoch of the last rebuild.
    #[must_use]
    pub fn last_epoch(&self) -> Option<u64> {
        self.shared.state.read().last_epoch
    }
}

impl fmt::Debug for ReactiveView {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.shared.state.read();
        f.debug_struct("ReactiveView")
            .field("id", &self.id)
            .field("table", &self.shared.table)
            .field("rows", &state.rows.len())
            .field("ready", &state.ready)
            .finish()
    }
}

// ---------------------------------------------------------------------------
// ViewObserver
// ---------------------------------------------------------------------------

/// Row observer that drives a view's recomputation.
pub(crate) struct ViewObserver {
    shared: Arc<ViewShared>,
}

impl ViewObserver {
    pub(crate) fn new(shared: Arc<ViewShared>) -> Self {
        Self { shared }
    }
}

impl RowObserver for ViewObserver {
    fn on_insert(&mut self, ctx: &EventContext<'_>, _row: &Row) {
        self.shared.refresh(ctx.tables, ctx.epoch);
    }

    fn on_delete(&mut self, ctx: &EventContext<'_>, _row: &Row) {
        self.shared.refresh(ctx.tables, ctx.epoch);
    }

    fn on_update(&mut self, ctx: &EventContext<'_>, _old: &Row, _new: &Row) {
        self.shared.refresh(ctx.tables, ctx.epoch);
    }

    fn on_error(&mut self, ctx: &EventContext<'_>, error: &DiffError) {
        tracing::debug!(table = %self.shared.table, epoch = ctx.epoch, %error, "view skipped a malformed diff");
    }
}

// ===========================================================================
// Tests
// ===========================================================================
