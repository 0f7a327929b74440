//! The client cache: the context object that owns every registry.
//!
//! [`ClientCache`] holds the table mirrors, the observer and subscription
//! registries and the reactive views. There is no global state: everything a
//! callback can see is reachable from the cache that dispatched it.
//!
//! # Event handling
//!
//! Session events are processed one at a time and to completion. For a
//! transaction the cache
//!
//! 1. drops it if its sequence number is not greater than the last one,
//! 2. applies every table update to the mirrors, queueing callbacks,
//! 3. flushes the queue under a fresh epoch.
//!
//! Callbacks only receive shared access to the mirrors. Mutating a cache
//! from inside one of its own callbacks is a programming error: it panics in
//! debug builds and returns [`Error::Reentrant`] otherwise. Driving a
//! different cache from a callback is allowed.

mod builder;

pub use builder::ClientCacheBuilder;

use std::fmt;
use std::sync::Arc;

use fxhash::FxHashMap;

use crate::config::{CacheConfig, ReconnectPolicy};
use crate::mirror::applier::DiffApplier;
use crate::mirror::dispatch::{DispatchQueue, DispatchScope};
use crate::mirror::observer::ObserverRegistry;
use crate::mirror::{
    CacheEvent, DiffError, EventContext, MirrorSet, ObserverId, RowCallbacks,
    RowObserver, TableMirror, TableUpdate, TransactionEvent,
};
use crate::predicate::{Predicate, SubscriptionQuery};
use crate::schema::{Row, TableSchema};
use crate::session::{CommandSink, Identity, SessionCommand, SessionEvent};
use crate::subscription::registry::{
    AppliedCallback, BoundQuery, EndedCallback, ErrorCallback, Owner, SubscriptionEntry,
    SubscriptionRegistry,
};
use crate::subscription::{
    IntoQueries, SubscriptionBuilder, SubscriptionError, SubscriptionHandle, SubscriptionId,
    SubscriptionState,
};
use crate::view::{ReactiveView, ViewId, ViewObserver};
use crate::{Error, Result};

pub(crate) type ConnectFn = Box<dyn FnMut(&Identity, &str) + Send>;
pub(crate) type DisconnectFn = Box<dyn FnMut(Option<&str>) + Send>;

#[derive(Default)]
pub(crate) struct ConnectionHooks {
    pub(crate) on_connect: Option<ConnectFn>,
    pub(crate) on_disconnect: Option<DisconnectFn>,
}

#[derive(Debug, Default)]
struct SessionState {
    identity: Option<Identity>,
    token: Option<String>,
    connected: bool,
    sessions: u64,
}

struct ViewEntry {
    subscription: SubscriptionId,
    observer: ObserverId,
    view: ReactiveView,
}

// ---------------------------------------------------------------------------
// ClientCache
// ---------------------------------------------------------------------------

/// Client-side subscription cache.
///
/// Create one with [`ClientCache::builder`].
pub struct ClientCache {
    config: CacheConfig,
    schemas: FxHashMap<String, Arc<TableSchema>>,
    mirrors: MirrorSet,
    observers: ObserverRegistry,
    subscriptions: SubscriptionRegistry,
    views: FxHashMap<ViewId, ViewEntry>,
    next_view: u64,
    sink: Box<dyn CommandSink>,
    hooks: ConnectionHooks,
    session: SessionState,
    last_sequence: Option<u64>,
    epoch: u64,
    scope: DispatchScope,
}

impl ClientCache {
    /// Starts building a cache.
    #[must_use]
    pub fn builder() -> ClientCacheBuilder {
        ClientCacheBuilder::new()
    }

    pub(crate) fn from_parts(
        config: CacheConfig,
        schemas: FxHashMap<String, Arc<TableSchema>>,
        sink: Box<dyn CommandSink>,
        hooks: ConnectionHooks,
    ) -> Self {
        Self {
            config,
            schemas,
            mirrors: MirrorSet::default(),
            observers: ObserverRegistry::default(),
            subscriptions: SubscriptionRegistry::default(),
            views: FxHashMap::default(),
            next_view: 0,
            sink,
            hooks,
            session: SessionState::default(),
            last_sequence: None,
            epoch: 0,
            scope: DispatchScope::next(),
        }
    }

    // -- accessors ----------------------------------------------------------

    /// Active configuration.
    #[must_use]
    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    /// Declared schema of `table`.
    #[must_use]
    pub fn schema(&self, table: &str) -> Option<&Arc<TableSchema>> {
        self.schemas.get(table)
    }

    /// Every mirrored table.
    #[must_use]
    pub fn tables(&self) -> &MirrorSet {
        &self.mirrors
    }

    /// Mirror of `table`, if an applied subscription covers it.
    #[must_use]
    pub fn table(&self, table: &str) -> Option<&TableMirror> {
        self.mirrors.get(table)
    }

    /// Identity of the current or last session.
    #[must_use]
    pub fn identity(&self) -> Option<&Identity> {
        self.session.identity.as_ref()
    }

    /// Token of the current or last session.
    #[must_use]
    pub fn token(&self) -> Option<&str> {
        self.session.token.as_deref()
    }

    /// Returns `true` between `connected` and `disconnected`.
    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.session.connected
    }

    /// Sequence number of the last applied transaction in this session.
    #[must_use]
    pub fn last_sequence(&self) -> Option<u64> {
        self.last_sequence
    }

    /// Current dispatch epoch.
    #[must_use]
    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    /// State of a subscription, `None` once it was removed.
    #[must_use]
    pub fn subscription_state(&self, id: SubscriptionId) -> Option<SubscriptionState> {
        self.subscriptions.state(id)
    }

    /// Number of registered subscriptions, including view-owned ones.
    #[must_use]
    pub fn subscription_count(&self) -> usize {
        self.subscriptions.len()
    }

    /// Ids of subscriptions in `state`, oldest first.
    #[must_use]
    pub fn subscriptions_in(&self, state: SubscriptionState) -> Vec<SubscriptionId> {
        self.subscriptions.ids_in(state)
    }

    /// Number of registered row observers, including those behind views.
    #[must_use]
    pub fn observer_count(&self) -> usize {
        self.observers.len()
    }

    /// Returns `true` if the observer is still registered.
    #[must_use]
    pub fn has_observer(&self, id: ObserverId) -> bool {
        self.observers.contains(id)
    }

    /// Number of live views.
    #[must_use]
    pub fn view_count(&self) -> usize {
        self.views.len()
    }

    // -- session events -----------------------------------------------------

    /// Routes one session event.
    ///
    /// # Errors
    ///
    /// - [`Error::IdentityChanged`] if a reconnect reports another identity.
    /// - [`Error::Reentrant`] if called from inside one of this cache's callbacks.
    pub fn handle_event(&mut self, event: SessionEvent) -> Result<()> {
        tracing::trace!(kind = event.kind(), "session event");
        match event {
            SessionEvent::Connected { identity, token } => self.connected(identity, token),
            SessionEvent::Disconnected { error } => self.disconnected(error),
            SessionEvent::Transaction(tx) => self.apply(tx).map(|_| ()),
            SessionEvent::SubscriptionApplied {
                subscription,
                initial,
            } => self.subscription_applied(subscription, initial),
            SessionEvent::SubscriptionError {
                subscription,
                message,
            } => self.subscription_error(subscription, &message),
            SessionEvent::UnsubscribeApplied { subscription } => {
                self.unsubscribe_applied(subscription)
            }
        }
    }

    /// A session was established.
    ///
    /// On every session after the first, mirrors are cleared according to
    /// [`ReconnectPolicy`] and every live subscription is reissued.
    /// Subscriptions made while disconnected are sent now.
    ///
    /// # Errors
    ///
    /// - [`Error::IdentityChanged`] if the identity differs from the first
    ///   session's. The event is otherwise ignored.
    /// - [`Error::Reentrant`] if called from inside one of this cache's callbacks.
    pub fn connected(&mut self, identity: Identity, token: String) -> Result<()> {
        self.guard()?;
        if let Some(expected) = &self.session.identity {
            if *expected != identity {
                return Err(Error::IdentityChanged {
                    expected: expected.clone(),
                    actual: identity,
                });
            }
        }
        if self.session.sessions > 0 {
            self.reset_session();
        }
        self.session.sessions += 1;
        self.session.connected = true;
        tracing::debug!(%identity, session = self.session.sessions, "connected");

        if let Some(hook) = &mut self.hooks.on_connect {
            let _guard = self.scope.enter();
            hook(&identity, &token);
        }
        self.session.identity = Some(identity);
        self.session.token = Some(token);
        self.send_unsent();
        Ok(())
    }

    /// The session ended.
    ///
    /// Mirrors stay readable until the next `connected`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Reentrant`] if called from inside one of this cache's callbacks.
    pub fn disconnected(&mut self, error: Option<String>) -> Result<()> {
        self.guard()?;
        self.session.connected = false;
        match &error {
            Some(err) => tracing::warn!(error = %err, "session disconnected"),
            None => tracing::debug!("session closed"),
        }
        if let Some(hook) = &mut self.hooks.on_disconnect {
            let _guard = self.scope.enter();
            hook(error.as_deref());
        }
        Ok(())
    }

    /// Applies one transaction atomically and fires the resulting callbacks.
    ///
    /// Returns `false` if the transaction was ignored because its sequence
    /// number was already processed.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Reentrant`] if called from inside one of this cache's callbacks.
    pub fn apply(&mut self, event: TransactionEvent) -> Result<bool> {
        self.guard()?;
        let sequence = event.sequence;
        if let Some(last) = self.last_sequence {
            if sequence <= last {
                tracing::debug!(seq = sequence, last, "duplicate or stale transaction ignored");
                return Ok(false);
            }
        }
        self.last_sequence = Some(sequence);

        let mut applier = DiffApplier::new(
            &self.schemas,
            &mut self.mirrors,
            &self.observers,
            &self.subscriptions,
            self.config.pair_primary_key_updates,
        );
        for update in event.tables {
            applier.apply_table(update);
        }
        let (tables, skipped) = applier.stats();
        let queue = applier.finish();
        tracing::trace!(seq = sequence, tables, skipped, callbacks = queue.len(), "transaction applied");
        self.flush(queue, CacheEvent::Transaction { sequence });
        Ok(true)
    }

    /// The server applied a subscription.
    ///
    /// The initial rows are applied and their callbacks flushed first; then
    /// `on_applied` fires; then views on the subscription become ready.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Reentrant`] if called from inside one of this cache's callbacks.
    pub fn subscription_applied(
        &mut self,
        id: SubscriptionId,
        initial: Vec<TableUpdate>,
    ) -> Result<()> {
        self.guard()?;
        let Some(entry) = self.subscriptions.get(id) else {
            self.log_stray_answer(id, "applied");
            return Ok(());
        };
        if entry.state != SubscriptionState::Pending {
            tracing::debug!(subscription = %id, state = ?entry.state, "duplicate applied ignored");
            return Ok(());
        }
        let tables = self.tables_read(entry);
        for table in &tables {
            if let Some(schema) = self.schemas.get(table) {
                self.mirrors.ensure(schema);
            }
        }
        let on_applied = self.subscriptions.get_mut(id).and_then(|entry| {
            entry.state = SubscriptionState::Applied;
            entry.on_error = None;
            entry.on_applied.take()
        });

        let mut applier = DiffApplier::new(
            &self.schemas,
            &mut self.mirrors,
            &self.observers,
            &self.subscriptions,
            self.config.pair_primary_key_updates,
        );
        for update in initial {
            applier.apply_table(update);
        }
        let queue = applier.finish();
        let event = CacheEvent::SubscriptionApplied(id);
        let epoch = self.flush(queue, event);
        tracing::debug!(subscription = %id, ?tables, epoch, "subscription applied");

        if let Some(callback) = on_applied {
            let ctx = self.context(event, epoch);
            let _guard = self.scope.enter();
            callback(&ctx);
        }
        for entry in self.views.values().filter(|v| v.subscription == id) {
            entry.view.shared().refresh(&self.mirrors, epoch);
            entry.view.shared().set_ready(true);
        }
        Ok(())
    }

    /// The server rejected a subscription.
    ///
    /// The subscription moves to `Error`, stops covering its tables and
    /// `on_error` fires. Other subscriptions are unaffected.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Reentrant`] if called from inside one of this cache's callbacks.
    pub fn subscription_error(&mut self, id: SubscriptionId, message: &str) -> Result<()> {
        self.guard()?;
        let Some(entry) = self.subscriptions.get(id) else {
            self.log_stray_answer(id, "error");
            return Ok(());
        };
        if entry.state == SubscriptionState::Error {
            return Ok(());
        }
        let was_applied = entry.state == SubscriptionState::Applied;
        let tables = self.tables_read(entry);
        let on_error = self.subscriptions.get_mut(id).and_then(|entry| {
            entry.state = SubscriptionState::Error;
            entry.on_applied = None;
            entry.on_error.take()
        });
        tracing::warn!(subscription = %id, %message, "subscription rejected");

        let queue = self.release(&tables, was_applied);
        let event = CacheEvent::SubscriptionError(id);
        let epoch = self.flush(queue, event);
        if let Some(callback) = on_error {
            let ctx = self.context(event, epoch);
            let _guard = self.scope.enter();
            callback(&ctx, message);
        }
        for entry in self.views.values().filter(|v| v.subscription == id) {
            entry.view.shared().refresh(&self.mirrors, epoch);
            entry.view.shared().set_error(message);
        }
        Ok(())
    }

    /// The server confirmed an unsubscribe; runs the pending `on_ended`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Reentrant`] if called from inside one of this cache's callbacks.
    pub fn unsubscribe_applied(&mut self, id: SubscriptionId) -> Result<()> {
        self.guard()?;
        match self.subscriptions.finish_ending(id) {
            Some(on_ended) => {
                tracing::debug!(subscription = %id, "unsubscribe confirmed");
                self.fire_ended(vec![(id, on_ended)], CacheEvent::SubscriptionRemoved(id), self.epoch);
            }
            None => tracing::debug!(subscription = %id, "unsubscribe confirmation for unknown subscription"),
        }
        Ok(())
    }

    // -- subscriptions ------------------------------------------------------

    /// Starts a subscription with callbacks.
    pub fn subscription_builder(&mut self) -> SubscriptionBuilder<'_> {
        SubscriptionBuilder::new(self)
    }

    /// Subscribes without callbacks.
    ///
    /// # Errors
    ///
    /// See [`SubscriptionBuilder::subscribe`].
    pub fn subscribe(&mut self, queries: impl IntoQueries) -> Result<SubscriptionHandle> {
        self.subscription_builder().subscribe(queries)
    }

    /// Subscribes to every row of every table.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Reentrant`] if called from inside one of this cache's callbacks.
    pub fn subscribe_to_all_tables(&mut self) -> Result<SubscriptionHandle> {
        self.subscription_builder().subscribe_to_all_tables()
    }

    pub(crate) fn subscribe_with(
        &mut self,
        queries: Vec<SubscriptionQuery>,
        on_applied: Option<AppliedCallback>,
        on_error: Option<ErrorCallback>,
    ) -> Result<SubscriptionHandle> {
        self.guard()?;
        if queries.is_empty() {
            return Err(SubscriptionError::NoQueries.into());
        }
        let bound = queries
            .into_iter()
            .map(|q| self.bind_query(q))
            .collect::<Result<Vec<_>>>()?;
        let id = self
            .subscriptions
            .insert(bound, Owner::User, on_applied, on_error);
        tracing::debug!(subscription = %id, "subscription registered");
        self.send(id);
        Ok(SubscriptionHandle::new(id))
    }

    /// Removes a subscription.
    ///
    /// Callbacks for it stop immediately. Rows no remaining applied
    /// subscription covers leave the mirror with `on_delete`; if no
    /// subscription covers a table any more, its mirror and observers are torn
    /// down. The server is told asynchronously: a following `subscribe` may
    /// still race with the removal on the server side.
    ///
    /// # Errors
    ///
    /// - [`SubscriptionError::AlreadyUnsubscribed`] if awaiting confirmation.
    /// - [`SubscriptionError::AlreadyEnded`] if it ended earlier.
    /// - [`SubscriptionError::UnknownSubscription`] for foreign ids.
    /// - [`Error::Reentrant`] if called from inside one of this cache's callbacks.
    pub fn unsubscribe(&mut self, handle: SubscriptionHandle) -> Result<()> {
        self.end_subscription(handle.id(), None)
    }

    /// Like [`unsubscribe`](Self::unsubscribe), then runs `on_ended` once the
    /// server confirms. If the subscription never reached the server,
    /// `on_ended` runs before this returns.
    ///
    /// # Errors
    ///
    /// Same as [`unsubscribe`](Self::unsubscribe).
    pub fn unsubscribe_then(
        &mut self,
        handle: SubscriptionHandle,
        on_ended: impl FnOnce(&EventContext<'_>) + Send + 'static,
    ) -> Result<()> {
        self.end_subscription(handle.id(), Some(Box::new(on_ended)))
    }

    fn end_subscription(
        &mut self,
        id: SubscriptionId,
        on_ended: Option<EndedCallback>,
    ) -> Result<()> {
        self.guard()?;
        let Some(entry) = self.subscriptions.remove(id) else {
            let err = if self.subscriptions.is_ending(id) {
                SubscriptionError::AlreadyUnsubscribed(id)
            } else if self.subscriptions.was_issued(id) {
                SubscriptionError::AlreadyEnded(id)
            } else {
                SubscriptionError::UnknownSubscription(id)
            };
            return Err(err.into());
        };
        let tables = self.tables_read(&entry);
        let queue = self.release(&tables, entry.state == SubscriptionState::Applied);
        let event = CacheEvent::SubscriptionRemoved(id);
        let epoch = self.flush(queue, event);

        let server_knows = entry.sent && entry.state != SubscriptionState::Error;
        if server_knows && self.session.connected {
            self.sink
                .send(SessionCommand::Unsubscribe { subscription: id });
            self.subscriptions.begin_ending(id, on_ended);
            tracing::debug!(subscription = %id, "unsubscribe sent");
        } else {
            tracing::debug!(subscription = %id, "subscription ended locally");
            self.fire_ended(vec![(id, on_ended)], event, epoch);
        }
        Ok(())
    }

    // -- observers ----------------------------------------------------------

    /// Registers a row observer on `table`, optionally filtered.
    ///
    /// The registration lives until removed or until the last subscription
    /// covering `table` goes away.
    ///
    /// # Errors
    ///
    /// - [`Error::UnknownTable`] if `table` was not declared.
    /// - [`Error::Predicate`] if the predicate does not fit the schema.
    /// - [`Error::Reentrant`] if called from inside one of this cache's callbacks.
    pub fn observe(
        &mut self,
        table: &str,
        predicate: Option<Predicate>,
        observer: impl RowObserver,
    ) -> Result<ObserverId> {
        self.guard()?;
        let schema = self.schema_of(table)?;
        let scope = predicate.map(|p| p.bind(&schema)).transpose()?;
        let id = self.observers.register(table, scope, Box::new(observer));
        tracing::trace!(%table, observer = %id, "observer registered");
        Ok(id)
    }

    /// Registers an insert callback. See [`observe`](Self::observe).
    ///
    /// # Errors
    ///
    /// Same as [`observe`](Self::observe).
    pub fn on_insert(
        &mut self,
        table: &str,
        predicate: Option<Predicate>,
        f: impl FnMut(&EventContext<'_>, &Row) + Send + 'static,
    ) -> Result<ObserverId> {
        self.observe(table, predicate, RowCallbacks::new().on_insert(f))
    }

    /// Registers a delete callback. See [`observe`](Self::observe).
    ///
    /// # Errors
    ///
    /// Same as [`observe`](Self::observe).
    pub fn on_delete(
        &mut self,
        table: &str,
        predicate: Option<Predicate>,
        f: impl FnMut(&EventContext<'_>, &Row) + Send + 'static,
    ) -> Result<ObserverId> {
        self.observe(table, predicate, RowCallbacks::new().on_delete(f))
    }

    /// Registers an update callback. See [`observe`](Self::observe).
    ///
    /// # Errors
    ///
    /// Same as [`observe`](Self::observe).
    pub fn on_update(
        &mut self,
        table: &str,
        predicate: Option<Predicate>,
        f: impl FnMut(&EventContext<'_>, &Row, &Row) + Send + 'static,
    ) -> Result<ObserverId> {
        self.observe(table, predicate, RowCallbacks::new().on_update(f))
    }

    /// Registers a callback for skipped diffs. See [`observe`](Self::observe).
    ///
    /// # Errors
    ///
    /// Same as [`observe`](Self::observe).
    pub fn on_error(
        &mut self,
        table: &str,
        f: impl FnMut(&EventContext<'_>, &DiffError) + Send + 'static,
    ) -> Result<ObserverId> {
        self.observe(table, None, RowCallbacks::new().on_error(f))
    }

    /// Removes an observer. Returns `false` if it was already gone.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Reentrant`] if called from inside one of this cache's callbacks.
    pub fn remove_observer(&mut self, id: ObserverId) -> Result<bool> {
        self.guard()?;
        Ok(self.observers.remove(id))
    }

    // -- views --------------------------------------------------------------

    /// Creates a reactive view of `table`, optionally filtered.
    ///
    /// Reuses the subscription of an existing view with the same query.
    /// Otherwise a new subscription is issued. The view is ready once that
    /// subscription is applied.
    ///
    /// # Errors
    ///
    /// - [`Error::UnknownTable`] if `table` was not declared.
    /// - [`Error::Predicate`] if the predicate does not fit the schema or has
    ///   no SQL spelling.
    /// - [`Error::Reentrant`] if called from inside one of this cache's callbacks.
    pub fn view(&mut self, table: &str, predicate: Option<Predicate>) -> Result<ReactiveView> {
        self.guard()?;
        let schema = self.schema_of(table)?;
        let scope = predicate.as_ref().map(|p| p.bind(&schema)).transpose()?;
        let query = SubscriptionQuery::for_table(table, predicate.clone())?;

        let subscription = match self.subscriptions.find_view_subscription(query.sql()) {
            Some(id) => {
                if let Some(Owner::Views(refs)) =
                    self.subscriptions.get_mut(id).map(|e| &mut e.owner)
                {
                    *refs += 1;
                }
                id
            }
            None => {
                let bound = BoundQuery {
                    query,
                    scope: scope.clone(),
                };
                let id = self
                    .subscriptions
                    .insert(vec![bound], Owner::Views(1), None, None);
                self.send(id);
                id
            }
        };

        self.next_view += 1;
        let view = ReactiveView::new(ViewId(self.next_view), table, predicate, scope.clone());
        let observer = self.observers.register(
            table,
            scope,
            Box::new(ViewObserver::new(Arc::clone(view.shared()))),
        );
        if self.subscriptions.state(subscription) == Some(SubscriptionState::Applied) {
            view.shared().refresh(&self.mirrors, self.epoch);
            view.shared().set_ready(true);
        }
        tracing::debug!(view = %view.id(), %table, subscription = %subscription, "view created");
        self.views.insert(
            view.id(),
            ViewEntry {
                subscription,
                observer,
                view: view.clone(),
            },
        );
        Ok(view)
    }

    /// Tears down a view: removes its observer and releases its subscription.
    ///
    /// Returns `false` if the view was already dropped.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Reentrant`] if called from inside one of this cache's callbacks.
    pub fn drop_view(&mut self, view: &ReactiveView) -> Result<bool> {
        self.guard()?;
        let Some(entry) = self.views.remove(&view.id()) else {
            return Ok(false);
        };
        self.observers.remove(entry.observer);
        entry.view.shared().set_ready(false);

        let last_ref = match self.subscriptions.get_mut(entry.subscription).map(|e| &mut e.owner) {
            Some(Owner::Views(refs)) => {
                *refs = refs.saturating_sub(1);
                *refs == 0
            }
            _ => false,
        };
        if last_ref {
            self.end_subscription(entry.subscription, None)?;
        }
        tracing::debug!(view = %view.id(), "view dropped");
        Ok(true)
    }

    // -- teardown -----------------------------------------------------------

    /// Tears down every subscription, mirror, observer and view.
    ///
    /// Pending `on_ended` callbacks fire; pending `on_applied`/`on_error`
    /// callbacks are dropped. No commands are sent.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Reentrant`] if called from inside one of this cache's callbacks.
    pub fn shutdown(&mut self) -> Result<()> {
        self.guard()?;
        let ending = self.subscriptions.drain_ending();
        let removed = self.subscriptions.drain();
        let tables: Vec<String> = self.mirrors.names().into_iter().map(str::to_string).collect();
        for table in &tables {
            self.mirrors.remove(table);
        }
        self.observers.clear();
        self.session.connected = false;
        self.last_sequence = None;

        self.epoch += 1;
        let epoch = self.epoch;
        for (_, entry) in self.views.drain() {
            entry.view.shared().set_ready(false);
            entry.view.shared().refresh(&self.mirrors, epoch);
        }
        tracing::debug!(subscriptions = removed.len(), tables = tables.len(), "cache shut down");
        self.fire_ended(ending, CacheEvent::Shutdown, epoch);
        Ok(())
    }

    // -- internals ----------------------------------------------------------

    fn guard(&self) -> Result<()> {
        let reentrant = self.scope.is_active();
        debug_assert!(
            !reentrant,
            "reentrant cache mutation from inside an observer callback"
        );
        if reentrant {
            return Err(Error::Reentrant);
        }
        Ok(())
    }

    fn schema_of(&self, table: &str) -> Result<Arc<TableSchema>> {
        self.schemas
            .get(table)
            .cloned()
            .ok_or_else(|| Error::UnknownTable(table.to_string()))
    }

    fn bind_query(&self, query: SubscriptionQuery) -> Result<BoundQuery> {
        let scope = match query.table() {
            Some(table) => {
                let schema = self.schema_of(table)?;
                query.predicate().map(|p| p.bind(&schema)).transpose()?
            }
            None => None,
        };
        Ok(BoundQuery { query, scope })
    }

    /// Declared tables a subscription reads.
    fn tables_read(&self, entry: &SubscriptionEntry) -> Vec<String> {
        if entry.reads_all_tables() {
            let mut names: Vec<String> = self.schemas.keys().cloned().collect();
            names.sort_unstable();
            names
        } else {
            entry.tables()
        }
    }

    fn context(&self, event: CacheEvent, epoch: u64) -> EventContext<'_> {
        EventContext {
            event,
            epoch,
            tables: &self.mirrors,
        }
    }

    /// Flushes `queue` under a new epoch and returns the epoch.
    fn flush(&mut self, queue: DispatchQueue, event: CacheEvent) -> u64 {
        self.epoch += 1;
        let ctx = EventContext {
            event,
            epoch: self.epoch,
            tables: &self.mirrors,
        };
        queue.flush(&mut self.observers, &ctx, self.scope);
        self.epoch
    }

    /// Drops coverage of `tables` after a subscription stopped covering them.
    fn release(&mut self, tables: &[String], was_applied: bool) -> DispatchQueue {
        let mut queue = DispatchQueue::default();
        for table in tables {
            if !self.subscriptions.is_covered(table) {
                let rows = self.mirrors.remove(table).map_or(0, |m| m.len());
                let observers = self.observers.remove_table(table);
                tracing::debug!(%table, rows, observers, "mirror torn down");
            } else if was_applied {
                let subscriptions = &self.subscriptions;
                let Some(mirror) = self.mirrors.get_mut(table) else {
                    continue;
                };
                let pruned = mirror.prune(|row| subscriptions.retains(table, row));
                for row in &pruned {
                    queue.deleted(&self.observers, table, row);
                }
                if !pruned.is_empty() {
                    tracing::debug!(%table, rows = pruned.len(), "rows no longer covered");
                }
            }
        }
        queue
    }

    /// Clears mirrors for a new session and returns subscriptions to pending.
    fn reset_session(&mut self) {
        let ending = self.subscriptions.drain_ending();
        self.subscriptions.reset_for_reconnect();
        self.last_sequence = None;

        let synthesize = self.config.reconnect_policy == ReconnectPolicy::SynthesizeDeletes;
        let mut queue = DispatchQueue::default();
        let tables: Vec<String> = self.mirrors.names().into_iter().map(str::to_string).collect();
        for table in &tables {
            let Some(mut mirror) = self.mirrors.remove(table) else {
                continue;
            };
            let rows = mirror.drain();
            if synthesize {
                for row in &rows {
                    queue.deleted(&self.observers, table, row);
                }
            }
            tracing::debug!(%table, rows = rows.len(), synthesize, "mirror cleared for reconnect");
        }
        let epoch = self.flush(queue, CacheEvent::Reconnect);
        for entry in self.views.values() {
            entry.view.shared().set_ready(false);
            entry.view.shared().refresh(&self.mirrors, epoch);
        }
        self.fire_ended(ending, CacheEvent::Reconnect, epoch);
    }

    fn send(&mut self, id: SubscriptionId) {
        if !self.session.connected {
            tracing::trace!(subscription = %id, "not connected, subscribe deferred");
            return;
        }
        let Some(entry) = self.subscriptions.get_mut(id) else {
            return;
        };
        entry.sent = true;
        let queries = entry.sql();
        self.sink.send(SessionCommand::Subscribe {
            subscription: id,
            queries,
        });
    }

    fn send_unsent(&mut self) {
        for id in self.subscriptions.unsent() {
            self.send(id);
        }
    }

    fn fire_ended(
        &self,
        ended: Vec<(SubscriptionId, Option<EndedCallback>)>,
        event: CacheEvent,
        epoch: u64,
    ) {
        let ctx = self.context(event, epoch);
        let _guard = self.scope.enter();
        for callback in ended.into_iter().filter_map(|(_, callback)| callback) {
            callback(&ctx);
        }
    }

    fn log_stray_answer(&self, id: SubscriptionId, answer: &str) {
        if self.subscriptions.is_ending(id) {
            tracing::debug!(subscription = %id, answer, "answer for unsubscribed subscription ignored");
        } else {
            tracing::warn!(subscription = %id, answer, "answer for unknown subscription ignored");
        }
    }
}

impl fmt::Debug for ClientCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientCache")
            .field("config", &self.config)
            .field("tables", &self.mirrors.names())
            .field("subscriptions", &self.subscriptions.len())
            .field("observers", &self.observers.len())
            .field("views", &self.views.len())
            .field("connected", &self.session.connected)
            .field("last_sequence", &self.last_sequence)
            .field("epoch", &self.epoch)
            .finish_non_exhaustive()
    }
}

// ===========================================================================
// Tests
// ===========================================================================
