//! Table mirrors and the diff applier.
//!
//! This module keeps the client-local copy of each covered table and turns
//! server diffs into row callbacks:
//!
//! - [`TransactionEvent`] / [`TableUpdate`] carry the diffs.
//! - [`TableMirror`] stores the rows of one table, keyed by [`RowKey`].
//! - The applier mutates mirrors and queues callbacks; the queue is flushed
//!   only after the whole event is applied.
//! - [`RowObserver`] receives the callbacks, after membership
//!   reclassification against each observer's predicate ([`reclassify`]).
//!
//! [`RowKey`]: crate::schema::RowKey

pub(crate) mod applier;
pub mod diff;
pub mod dispatch;
pub mod observer;
pub mod table;

pub use diff::{DiffError, RowUpdate, TableUpdate, TransactionEvent};
pub use dispatch::{in_dispatch, reclassify, Transition};
pub use observer::{CacheEvent, EventContext, ObserverId, RowCallbacks, RowObserver};
pub use table::{MirrorSet, TableMirror};
