//! Connection session contract.
//!
//! The transport, handshake and wire encoding live outside this crate. A
//! session driver decodes server messages into [`SessionEvent`]s and feeds
//! them, one at a time, to [`ClientCache::handle_event`]. In the other
//! direction the cache emits [`SessionCommand`]s through a [`CommandSink`]
//! supplied at build time.
//!
//! [`ClientCache::handle_event`]: crate::cache::ClientCache::handle_event

use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::mirror::{TableUpdate, TransactionEvent};
use crate::subscription::SubscriptionId;

// ---------------------------------------------------------------------------
// Identity
// ---------------------------------------------------------------------------

/// Server-assigned identity of the connected client.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Identity(pub String);

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Identity {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

// ---------------------------------------------------------------------------
// SessionEvent
// ---------------------------------------------------------------------------

/// Event delivered by the connection session.
#[derive(Debug, Clone)]
pub enum SessionEvent {
    /// A session was established.
    Connected {
        /// Identity the server assigned.
        identity: Identity,
        /// Token to present when reconnecting.
        token: String,
    },
    /// The session ended.
    Disconnected {
        /// Transport error, if the session did not close cleanly.
        error: Option<String>,
    },
    /// One atomic, server-ordered batch of row diffs.
    Transaction(TransactionEvent),
    /// The server accepted a subscription and sent its initial rows.
    SubscriptionApplied {
        /// Subscription the server is answering.
        subscription: SubscriptionId,
        /// Rows that currently match, as inserts per table.
        initial: Vec<TableUpdate>,
    },
    /// The server rejected a subscription.
    SubscriptionError {
        /// Subscription the server is answering.
        subscription: SubscriptionId,
        /// Server message.
        message: String,
    },
    /// The server finished removing a subscription.
    UnsubscribeApplied {
        /// Subscription the server is answering.
        subscription: SubscriptionId,
    },
}

impl SessionEvent {
    /// Short name for logging.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Connected { .. } => "connected",
            Self::Disconnected { .. } => "disconnected",
            Self::Transaction(_) => "transaction",
            Self::SubscriptionApplied { .. } => "subscription_applied",
            Self::SubscriptionError { .. } => "subscription_error",
            Self::UnsubscribeApplied { .. } => "unsubscribe_applied",
        }
    }
}

// ---------------------------------------------------------------------------
// SessionCommand / CommandSink
// ---------------------------------------------------------------------------

/// Request the cache asks the session to forward to the server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionCommand {
    /// Start a subscription.
    Subscribe {
        /// Client-chosen id the server echoes back.
        subscription: SubscriptionId,
        /// Compiled query strings.
        queries: Vec<String>,
    },
    /// Stop a subscription.
    Unsubscribe {
        /// Subscription to stop.
        subscription: SubscriptionId,
    },
}

/// Outbound half of the session.
///
/// `send` must not block; a driver that cannot write immediately should queue.
pub trait CommandSink: Send {
    /// Hands a command to the session.
    fn send(&mut self, command: SessionCommand);
}

impl<F> CommandSink for F
where
    F: FnMut(SessionCommand) + Send,
{
    fn send(&mut self, command: SessionCommand) {
        self(command);
    }
}

/// Sink that drops every command. Used when no session is attached.
#[derive(Debug, Default, Clone, Copy)]
pub struct DiscardSink;

impl CommandSink for DiscardSink {
    fn send(&mut self, command: SessionCommand) {
        tracing::trace!(?command, "no session attached, command dropped");
    }
}

/// In-memory command queue shared between the cache and a session driver.
///
/// Clones share the same queue.
#[derive(Debug, Default, Clone)]
pub struct Outbox {
    queue: Arc<Mutex<VecDeque<SessionCommand>>>,
}

impl Outbox {
    /// Creates an empty outbox.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Removes and returns every queued command, oldest first.
    #[must_use]
    pub fn drain(&self) -> Vec<SessionCommand> {
        self.queue.lock().drain(..).collect()
    }

    /// Number of queued commands.
    #[must_use]
    pub fn len(&self) -> usize {
        self.queue.lock().len()
    }

    /// Returns `true` if nothing is queued.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.queue.lock().is_empty()
    }
}

impl CommandSink for Outbox {
    fn send(&mut self, command: SessionCommand) {
        self.queue.lock().push_back(command);
    }
}

// ===========================================================================
// Tests
// ===========================================================================
