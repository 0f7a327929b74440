//! Subscription registry and handles.
//!
//! A subscription is a standing request that the server keep a filtered set of
//! rows mirrored locally. Each one is `Pending` until the server answers with
//! applied (`Applied`) or rejected (`Error`). The `on_applied` and `on_error`
//! callbacks fire exactly once, synchronously, with the current mirror state.
//!
//! ```rust,ignore
//! let handle = cache
//!     .subscription_builder()
//!     .on_applied(|ctx| println!("{} orders", ctx.table("orders").map_or(0, |t| t.len())))
//!     .on_error(|_ctx, msg| eprintln!("rejected: {msg}"))
//!     .subscribe("SELECT * FROM orders WHERE status = 'open'")?;
//! ```

pub(crate) mod registry;

use std::fmt;

use crate::cache::ClientCache;
use crate::mirror::EventContext;
use crate::predicate::{Predicate, SubscriptionQuery};
use crate::Result;

use registry::{AppliedCallback, ErrorCallback};

// ---------------------------------------------------------------------------
// SubscriptionId / SubscriptionState
// ---------------------------------------------------------------------------

/// Unique subscription identifier.
///
/// Monotonically assigned by the cache and echoed back by the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriptionId(pub u64);

impl fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sub-{}", self.0)
    }
}

/// Lifecycle state of a subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriptionState {
    /// Waiting for the server.
    Pending,
    /// The server accepted the subscription and sent its rows.
    Applied,
    /// The server rejected the subscription.
    Error,
}

// ---------------------------------------------------------------------------
// SubscriptionError
// ---------------------------------------------------------------------------

/// Misuse of the subscription API.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SubscriptionError {
    /// `subscribe` was called with an empty query list.
    #[error("a subscription needs at least one query")]
    NoQueries,
    /// `unsubscribe` was already called for this subscription.
    #[error("{0} is already unsubscribed")]
    AlreadyUnsubscribed(SubscriptionId),
    /// The subscription ended (unsubscribe confirmed or cache shut down).
    #[error("{0} has already ended")]
    AlreadyEnded(SubscriptionId),
    /// The id was never issued by this cache.
    #[error("unknown subscription {0}")]
    UnknownSubscription(SubscriptionId),
}

// ---------------------------------------------------------------------------
// SubscriptionHandle
// ---------------------------------------------------------------------------

/// Handle to a subscription created by [`SubscriptionBuilder::subscribe`].
///
/// Handles are plain ids: dropping one does not unsubscribe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionHandle {
    id: SubscriptionId,
}

impl SubscriptionHandle {
    pub(crate) fn new(id: SubscriptionId) -> Self {
        Self { id }
    }

    /// Subscription id.
    #[must_use]
    pub fn id(&self) -> SubscriptionId {
        self.id
    }

    /// Current state, or `None` once the subscription was removed.
    #[must_use]
    pub fn state(&self, cache: &ClientCache) -> Option<SubscriptionState> {
        cache.subscription_state(self.id)
    }

    /// Returns `true` while the subscription is pending or applied.
    #[must_use]
    pub fn is_active(&self, cache: &ClientCache) -> bool {
        matches!(
            self.state(cache),
            Some(SubscriptionState::Pending | SubscriptionState::Applied)
        )
    }

    /// Removes the subscription. Callbacks stop immediately; the server is
    /// told asynchronously.
    ///
    /// # Errors
    ///
    /// See [`ClientCache::unsubscribe`].
    pub fn unsubscribe(self, cache: &mut ClientCache) -> Result<()> {
        cache.unsubscribe(self)
    }

    /// Like [`unsubscribe`](Self::unsubscribe), then runs `on_ended` once the
    /// server confirms the removal.
    ///
    /// # Errors
    ///
    /// See [`ClientCache::unsubscribe`].
    pub fn unsubscribe_then(
        self,
        cache: &mut ClientCache,
        on_ended: impl FnOnce(&EventContext<'_>) + Send + 'static,
    ) -> Result<()> {
        cache.unsubscribe_then(self, on_ended)
    }
}

// ---------------------------------------------------------------------------
// IntoQuery / IntoQueries
// ---------------------------------------------------------------------------

/// Anything that names one subscription query.
pub trait IntoQuery {
    /// Converts into a parsed query.
    ///
    /// # Errors
    ///
    /// Returns the parse or compile error.
    fn into_query(self) -> Result<SubscriptionQuery>;
}

impl IntoQuery for SubscriptionQuery {
    fn into_query(self) -> Result<SubscriptionQuery> {
        Ok(self)
    }
}

impl IntoQuery for &str {
    fn into_query(self) -> Result<SubscriptionQuery> {
        Ok(SubscriptionQuery::parse(self)?)
    }
}

impl IntoQuery for String {
    fn into_query(self) -> Result<SubscriptionQuery> {
        self.as_str().into_query()
    }
}

impl IntoQuery for &String {
    fn into_query(self) -> Result<SubscriptionQuery> {
        self.as_str().into_query()
    }
}

/// `(table, predicate)`: a typed query that is compiled rather than parsed.
impl IntoQuery for (&str, Predicate) {
    fn into_query(self) -> Result<SubscriptionQuery> {
        Ok(SubscriptionQuery::for_table(self.0, Some(self.1))?)
    }
}

/// `(table, None)` subscribes to the whole table.
impl IntoQuery for (&str, Option<Predicate>) {
    fn into_query(self) -> Result<SubscriptionQuery> {
        Ok(SubscriptionQuery::for_table(self.0, self.1)?)
    }
}

/// One query or a collection of them.
pub trait IntoQueries {
    /// Converts into parsed queries.
    ///
    /// # Errors
    ///
    /// Returns the first parse or compile error.
    fn into_queries(self) -> Result<Vec<SubscriptionQuery>>;
}

impl<T: IntoQuery> IntoQueries for T {
    fn into_queries(self) -> Result<Vec<SubscriptionQuery>> {
        Ok(vec![self.into_query()?])
    }
}

impl<T: IntoQuery> IntoQueries for Vec<T> {
    fn into_queries(self) -> Result<Vec<SubscriptionQuery>> {
        self.into_iter().map(IntoQuery::into_query).collect()
    }
}

impl<T: IntoQuery, const N: usize> IntoQueries for [T; N] {
    fn into_queries(self) -> Result<Vec<SubscriptionQuery>> {
        self.into_iter().map(IntoQuery::into_query).collect()
    }
}

// ---------------------------------------------------------------------------
// SubscriptionBuilder
// ---------------------------------------------------------------------------

/// Fluent builder returned by [`ClientCache::subscription_builder`].
#[must_use = "a subscription builder does nothing until `subscribe` is called"]
pub struct SubscriptionBuilder<'c> {
    cache: &'c mut ClientCache,
    on_applied: Option<AppliedCallback>,
    on_error: Option<ErrorCallback>,
}

impl<'c> SubscriptionBuilder<'c> {
    pub(crate) fn new(cache: &'c mut ClientCache) -> Self {
        Self {
            cache,
            on_applied: None,
            on_error: None,
        }
    }

    /// Runs `f` once the server has applied the subscription and its initial
    /// rows are in the mirror.
    pub fn on_applied(mut self, f: impl FnOnce(&EventContext<'_>) + Send + 'static) -> Self {
        self.on_applied = Some(Box::new(f));
        self
    }

    /// Runs `f` if the server rejects the subscription.
    pub fn on_error(mut self, f: impl FnOnce(&EventContext<'_>, &str) + Send + 'static) -> Self {
        self.on_error = Some(Box::new(f));
        self
    }

    /// Registers the subscription and forwards it to the session (or defers
    /// it until the next `connected` event).
    ///
    /// # Errors
    ///
    /// - [`SubscriptionError::NoQueries`] for an empty query list.
    /// - Query, predicate or unknown-table errors for invalid queries.
    pub fn subscribe(self, queries: impl IntoQueries) -> Result<SubscriptionHandle> {
        let queries = queries.into_queries()?;
        self.cache
            .subscribe_with(queries, self.on_applied, self.on_error)
    }

    /// Subscribes to every row of every table (`SELECT * FROM *`).
    ///
    /// # Errors
    ///
    /// Returns [`crate::Error::Reentrant`] if called from a callback.
    pub fn subscribe_to_all_tables(self) -> Result<SubscriptionHandle> {
        self.subscribe(SubscriptionQuery::all_tables())
    }
}

impl fmt::Debug for SubscriptionBuilder<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SubscriptionBuilder")
            .field("on_applied", &self.on_applied.is_some())
            .field("on_error", &self.on_error.is_some())
            .finish_non_exhaustive()
    }
}

// ===========================================================================
// Tests
// ===========================================================================
