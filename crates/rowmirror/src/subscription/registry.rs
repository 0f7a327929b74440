//! Subscription bookkeeping.
//!
//! Two indices sit beside the primary map:
//! - `by_table`: table name to the single-table subscriptions reading it
//! - `all_tables`: subscriptions issued as `SELECT * FROM *`
//!
//! Subscriptions in the `Error` state stay registered (so their state can be
//! queried) but no longer cover any table.

use fxhash::FxHashMap;

use super::{SubscriptionId, SubscriptionState};
use crate::mirror::applier::RowCoverage;
use crate::mirror::EventContext;
use crate::predicate::{scope_matches, BoundPredicate, QueryScope, SubscriptionQuery};
use crate::schema::Row;

pub(crate) type AppliedCallback = Box<dyn FnOnce(&EventContext<'_>) + Send>;
pub(crate) type ErrorCallback = Box<dyn FnOnce(&EventContext<'_>, &str) + Send>;
pub(crate) type EndedCallback = Box<dyn FnOnce(&EventContext<'_>) + Send>;

// ---------------------------------------------------------------------------
// SubscriptionEntry
// ---------------------------------------------------------------------------

/// A query together with its predicate bound to the table schema.
#[derive(Debug, Clone)]
pub(crate) struct BoundQuery {
    pub(crate) query: SubscriptionQuery,
    /// `None` when every row of the table is covered (no filter, an opaque
    /// filter, or `SELECT * FROM *`).
    pub(crate) scope: Option<BoundPredicate>,
}

/// Who owns a subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Owner {
    /// Created through the public subscribe API.
    User,
    /// Shared by this many reactive views.
    Views(usize),
}

pub(crate) struct SubscriptionEntry {
    pub(crate) id: SubscriptionId,
    pub(crate) queries: Vec<BoundQuery>,
    pub(crate) state: SubscriptionState,
    /// Whether the subscribe command reached the session in this session.
    pub(crate) sent: bool,
    pub(crate) owner: Owner,
    pub(crate) on_applied: Option<AppliedCallback>,
    pub(crate) on_error: Option<ErrorCallback>,
}

impl SubscriptionEntry {
    /// Returns `true` if any query reads `table`.
    pub(crate) fn reads(&self, table: &str) -> bool {
        self.queries.iter().any(|q| q.query.covers(table))
    }

    /// Returns `true` if some query of this subscription matches `row` of `table`.
    pub(crate) fn matches(&self, table: &str, row: &Row) -> bool {
        self.queries
            .iter()
            .filter(|q| q.query.covers(table))
            .any(|q| scope_matches(q.scope.as_ref(), row))
    }

    /// Returns `true` if one query is `SELECT * FROM *`.
    pub(crate) fn reads_all_tables(&self) -> bool {
        self.queries
            .iter()
            .any(|q| *q.query.scope() == QueryScope::AllTables)
    }

    /// Single-table names read, in query order.
    pub(crate) fn tables(&self) -> Vec<String> {
        let mut out: Vec<String> = Vec::new();
        for q in &self.queries {
            if let Some(t) = q.query.table() {
                if !out.iter().any(|seen| seen == t) {
                    out.push(t.to_string());
                }
            }
        }
        out
    }

    /// Query strings as sent to the server.
    pub(crate) fn sql(&self) -> Vec<String> {
        self.queries.iter().map(|q| q.query.sql().to_string()).collect()
    }
}

impl std::fmt::Debug for SubscriptionEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubscriptionEntry")
            .field("id", &self.id)
            .field("queries", &self.sql())
            .field("state", &self.state)
            .field("sent", &self.sent)
            .field("owner", &self.owner)
            .finish_non_exhaustive()
    }
}

// ---------------------------------------------------------------------------
// SubscriptionRegistry
// ---------------------------------------------------------------------------

/// Registry of every live subscription.
#[derive(Default)]
pub(crate) struct SubscriptionRegistry {
    entries: FxHashMap<SubscriptionId, SubscriptionEntry>,
    by_table: FxHashMap<String, Vec<SubscriptionId>>,
    all_tables: Vec<SubscriptionId>,
    /// Removed locally, waiting for the server to confirm.
    ending: FxHashMap<SubscriptionId, Option<EndedCallback>>,
    next_id: u64,
}

impl SubscriptionRegistry {
    pub(crate) fn insert(
        &mut self,
        queries: Vec<BoundQuery>,
        owner: Owner,
        on_applied: Option<AppliedCallback>,
        on_error: Option<ErrorCallback>,
    ) -> SubscriptionId {
        self.next_id += 1;
        let id = SubscriptionId(self.next_id);
        let entry = SubscriptionEntry {
            id,
            queries,
            state: SubscriptionState::Pending,
            sent: false,
            owner,
            on_applied,
            on_error,
        };
        for table in entry.tables() {
            self.by_table.entry(table).or_default().push(id);
        }
        if entry.reads_all_tables() {
            self.all_tables.push(id);
        }
        self.entries.insert(id, entry);
        id
    }

    pub(crate) fn get(&self, id: SubscriptionId) -> Option<&SubscriptionEntry> {
        self.entries.get(&id)
    }

    pub(crate) fn get_mut(&mut self, id: SubscriptionId) -> Option<&mut SubscriptionEntry> {
        self.entries.get_mut(&id)
    }

    pub(crate) fn state(&self, id: SubscriptionId) -> Option<SubscriptionState> {
        self.entries.get(&id).map(|e| e.state)
    }

    pub(crate) fn remove(&mut self, id: SubscriptionId) -> Option<SubscriptionEntry> {
        let entry = self.entries.remove(&id)?;
        for table in entry.tables() {
            if let Some(ids) = self.by_table.get_mut(&table) {
                ids.retain(|other| *other != id);
                if ids.is_empty() {
                    self.by_table.remove(&table);
                }
            }
        }
        self.all_tables.retain(|other| *other != id);
        Some(entry)
    }

    /// Returns `true` if `id` was handed out by this registry.
    pub(crate) fn was_issued(&self, id: SubscriptionId) -> bool {
        id.0 >= 1 && id.0 <= self.next_id
    }

    /// Live (pending or applied) subscriptions reading `table`.
    pub(crate) fn covering<'s>(
        &'s self,
        table: &'s str,
    ) -> impl Iterator<Item = &'s SubscriptionEntry> + 's {
        self.by_table
            .get(table)
            .into_iter()
            .flatten()
            .chain(self.all_tables.iter())
            .filter_map(|id| self.entries.get(id))
            .filter(|e| e.state != SubscriptionState::Error && e.reads(table))
    }

    pub(crate) fn is_covered(&self, table: &str) -> bool {
        self.covering(table).next().is_some()
    }

    /// Returns `true` if an applied subscription still wants `row` of `table`.
    pub(crate) fn retains(&self, table: &str, row: &Row) -> bool {
        self.covering(table)
            .filter(|e| e.state == SubscriptionState::Applied)
            .any(|e| e.matches(table, row))
    }

    /// Pending subscriptions not yet sent in this session, oldest first.
    pub(crate) fn unsent(&self) -> Vec<SubscriptionId> {
        let mut ids: Vec<SubscriptionId> = self
            .entries
            .values()
            .filter(|e| e.state == SubscriptionState::Pending && !e.sent)
            .map(|e| e.id)
            .collect();
        ids.sort_unstable();
        ids
    }

    /// Returns every live subscription to `Pending` for reissue.
    pub(crate) fn reset_for_reconnect(&mut self) {
        for entry in self.entries.values_mut() {
            if entry.state != SubscriptionState::Error {
                entry.state = SubscriptionState::Pending;
            }
            entry.sent = false;
        }
    }

    /// View-owned subscription issued for exactly `sql`, if one is live.
    pub(crate) fn find_view_subscription(&self, sql: &str) -> Option<SubscriptionId> {
        self.entries
            .values()
            .filter(|e| matches!(e.owner, Owner::Views(_)))
            .filter(|e| e.state != SubscriptionState::Error)
            .find(|e| matches!(e.queries.as_slice(), [q] if q.query.sql() == sql))
            .map(|e| e.id)
    }

    pub(crate) fn begin_ending(&mut self, id: SubscriptionId, on_ended: Option<EndedCallback>) {
        self.ending.insert(id, on_ended);
    }

    pub(crate) fn is_ending(&self, id: SubscriptionId) -> bool {
        self.ending.contains_key(&id)
    }

    pub(crate) fn finish_ending(&mut self, id: SubscriptionId) -> Option<Option<EndedCallback>> {
        self.ending.remove(&id)
    }

    /// Removes every subscription awaiting server confirmation, oldest first.
    pub(crate) fn drain_ending(&mut self) -> Vec<(SubscriptionId, Option<EndedCallback>)> {
        let mut out: Vec<_> = self.ending.drain().collect();
        out.sort_unstable_by_key(|(id, _)| *id);
        out
    }

    /// Removes every subscription, oldest first.
    pub(crate) fn drain(&mut self) -> Vec<SubscriptionEntry> {
        self.by_table.clear();
        self.all_tables.clear();
        let mut out: Vec<SubscriptionEntry> = self.entries.drain().map(|(_, e)| e).collect();
        out.sort_unstable_by_key(|e| e.id);
        out
    }

    /// Ids of subscriptions in `state`, oldest first.
    pub(crate) fn ids_in(&self, state: SubscriptionState) -> Vec<SubscriptionId> {
        let mut ids: Vec<SubscriptionId> = self
            .entries
            .values()
            .filter(|e| e.state == state)
            .map(|e| e.id)
            .collect();
        ids.sort_unstable();
        ids
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }
}

impl RowCoverage for SubscriptionRegistry {
    fn retains(&self, table: &str, row: &Row) -> bool {
        SubscriptionRegistry::retains(self, table, row)
    }
}

// ===========================================================================
// Tests
// ===========================================================================
