//! # rowmirror
//!
//! Client-side subscription cache. Keeps a local, partial mirror of remote
//! tables consistent with an ordered stream of transactional row diffs, and
//! turns those diffs into row callbacks and reactive views.
//!
//! This crate provides:
//! - **Schema**: declared table schemas, typed values and rows
//! - **Predicates**: comparison trees that compile to SQL and evaluate locally
//! - **Subscriptions**: `Pending -> Applied | Error` lifecycle with callbacks
//! - **Mirrors**: per-table keyed stores updated atomically per transaction
//! - **Views**: read-only row lists recomputed once per transaction
//!
//! ## Event Flow
//!
//! ```text
//! session driver --SessionEvent--> ClientCache::handle_event
//!                                    -> diff applier -> table mirrors
//!                                    -> dispatch queue (flushed after apply)
//!                                    -> row observers / reactive views
//! ClientCache --SessionCommand--> CommandSink --> session driver
//! ```
//!
//! The transport is not part of this crate. A driver decodes server messages
//! into [`SessionEvent`]s and feeds them to the cache one at a time.
//!
//! ## Example
//!
//! ```
//! use rowmirror::prelude::*;
//!
//! let outbox = Outbox::new();
//! let mut cache = ClientCache::builder()
//!     .table(
//!         TableSchema::new("orders")
//!             .column("id", ColumnType::Int)
//!             .column("status", ColumnType::String)
//!             .primary_key("id"),
//!     )
//!     .command_sink(outbox.clone())
//!     .build()
//!     .unwrap();
//!
//! let open = cache.view("orders", Some(col("status").eq("open"))).unwrap();
//! cache
//!     .handle_event(SessionEvent::Connected {
//!         identity: "alice".into(),
//!         token: "t".into(),
//!     })
//!     .unwrap();
//!
//! let Some(SessionCommand::Subscribe { subscription, .. }) = outbox.drain().pop() else {
//!     unreachable!()
//! };
//! cache
//!     .handle_event(SessionEvent::SubscriptionApplied {
//!         subscription,
//!         initial: vec![TableUpdate::new("orders").insert(Row::from_iter([
//!             Value::from(1),
//!             Value::from("open"),
//!         ]))],
//!     })
//!     .unwrap();
//!
//! assert!(open.is_ready());
//! assert_eq!(open.len(), 1);
//! ```

#![deny(missing_docs)]
#![deny(unsafe_code)]
#![warn(clippy::all, clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::should_implement_trait)]

pub mod cache;
pub mod config;
pub mod mirror;
pub mod predicate;
pub mod schema;
pub mod session;
pub mod subscription;
pub mod view;

pub use cache::{ClientCache, ClientCacheBuilder};
pub use config::{CacheConfig, ReconnectPolicy};
pub use session::{Identity, SessionCommand, SessionEvent};

/// Commonly used types.
pub mod prelude {
    pub use crate::cache::{ClientCache, ClientCacheBuilder};
    pub use crate::config::{CacheConfig, ReconnectPolicy};
    pub use crate::mirror::{
        CacheEvent, EventContext, ObserverId, RowCallbacks, RowObserver, TableUpdate,
        TransactionEvent,
    };
    pub use crate::predicate::{col, lit, Predicate};
    pub use crate::schema::{ColumnType, Row, TableSchema, Value};
    pub use crate::session::{CommandSink, Identity, Outbox, SessionCommand, SessionEvent};
    pub use crate::subscription::{SubscriptionHandle, SubscriptionId, SubscriptionState};
    pub use crate::view::ReactiveView;
}

/// Result type for rowmirror operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Error types for rowmirror.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum Error {
    /// Invalid schema declaration or row.
    #[error("Schema error: {0}")]
    Schema(#[from] schema::SchemaError),
    /// Predicate does not fit the table schema.
    #[error("Predicate error: {0}")]
    Predicate(#[from] predicate::PredicateError),
    /// Query string could not be parsed.
    #[error("Query error: {0}")]
    Query(#[from] predicate::QueryError),
    /// Subscription API misuse.
    #[error("Subscription error: {0}")]
    Subscription(#[from] subscription::SubscriptionError),
    /// Table was never declared.
    #[error("unknown table {0}")]
    UnknownTable(String),
    /// The server assigned a different identity on reconnect.
    #[error("identity changed from {expected} to {actual}")]
    IdentityChanged {
        /// Identity of the first session.
        expected: Identity,
        /// Identity the new session reported.
        actual: Identity,
    },
    /// The cache was mutated from inside one of its own callbacks.
    #[error("cache mutated from inside an observer callback")]
    Reentrant,
}
