//! Transaction events and per-table row diffs.
//!
//! A [`TransactionEvent`] is the atomic update unit: every [`TableUpdate`] it
//! carries is applied before any observer runs.

use std::collections::hash_map::Entry;

use fxhash::FxHashMap;

use crate::schema::{Row, RowKey, SchemaError, TableSchema};

// ---------------------------------------------------------------------------
// RowUpdate
// ---------------------------------------------------------------------------

/// Explicit replacement of one row by another.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RowUpdate {
    /// Row as it was before the transaction.
    pub old: Row,
    /// Row as it is after the transaction.
    pub new: Row,
}

// ---------------------------------------------------------------------------
// TableUpdate
// ---------------------------------------------------------------------------

/// Diffs for one table within a transaction.
///
/// The three sets are disjoint: a row appears in at most one of them.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TableUpdate {
    /// Table name.
    pub table: String,
    /// Rows added.
    pub inserts: Vec<Row>,
    /// Rows removed.
    pub deletes: Vec<Row>,
    /// Rows replaced.
    pub updates: Vec<RowUpdate>,
}

impl TableUpdate {
    /// Creates an empty update for `table`.
    #[must_use]
    pub fn new(table: impl Into<String>) -> Self {
        Self {
            table: table.into(),
            ..Self::default()
        }
    }

    /// Adds an insert.
    #[must_use]
    pub fn insert(mut self, row: impl Into<Row>) -> Self {
        self.inserts.push(row.into());
        self
    }

    /// Adds a delete.
    #[must_use]
    pub fn delete(mut self, row: impl Into<Row>) -> Self {
        self.deletes.push(row.into());
        self
    }

    /// Adds an update.
    #[must_use]
    pub fn update(mut self, old: impl Into<Row>, new: impl Into<Row>) -> Self {
        self.updates.push(RowUpdate {
            old: old.into(),
            new: new.into(),
        });
        self
    }

    /// Total number of row diffs.
    #[must_use]
    pub fn len(&self) -> usize {
        self.inserts.len() + self.deletes.len() + self.updates.len()
    }

    /// Returns `true` if the update carries no diffs.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Merges each delete with an insert of the same primary key into an update.
///
/// Servers commonly encode an in-place row change as delete old + insert new.
/// Without pairing, an observer whose predicate matches both rows would see
/// `on_delete` then `on_insert` instead of `on_update`. Tables without a
/// primary key are returned unchanged.
pub(crate) fn pair_by_primary_key(schema: &TableSchema, update: &mut TableUpdate) {
    if schema.primary_key_index().is_none() || update.deletes.is_empty() || update.inserts.is_empty()
    {
        return;
    }

    let mut deleted: FxHashMap<RowKey, Row> = FxHashMap::default();
    let mut unpaired_deletes = Vec::new();
    for row in update.deletes.drain(..) {
        match deleted.entry(schema.row_key(&row)) {
            Entry::Vacant(slot) => {
                slot.insert(row);
            }
            Entry::Occupied(_) => unpaired_deletes.push(row),
        }
    }

    let mut inserts = Vec::with_capacity(update.inserts.len());
    for row in update.inserts.drain(..) {
        match deleted.remove(&schema.row_key(&row)) {
            Some(old) => update.updates.push(RowUpdate { old, new: row }),
            None => inserts.push(row),
        }
    }

    update.inserts = inserts;
    update.deletes = unpaired_deletes;
    update.deletes.extend(deleted.into_values());
}

// ---------------------------------------------------------------------------
// TransactionEvent
// ---------------------------------------------------------------------------

/// Atomic, server-ordered batch of row diffs across tables.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TransactionEvent {
    /// Server-assigned sequence number; strictly increasing per session.
    pub sequence: u64,
    /// Per-table diffs.
    pub tables: Vec<TableUpdate>,
}

impl TransactionEvent {
    /// Creates an empty event.
    #[must_use]
    pub fn new(sequence: u64) -> Self {
        Self {
            sequence,
            tables: Vec::new(),
        }
    }

    /// Adds a table update.
    #[must_use]
    pub fn with_table(mut self, update: TableUpdate) -> Self {
        self.tables.push(update);
        self
    }

    /// Total number of row diffs across tables.
    #[must_use]
    pub fn row_count(&self) -> usize {
        self.tables.iter().map(TableUpdate::len).sum()
    }
}

// ---------------------------------------------------------------------------
// DiffError
// ---------------------------------------------------------------------------

/// A diff the applier skipped.
///
/// Reported to the table's observers through `on_error`; never fatal.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DiffError {
    /// Row does not fit the declared schema.
    #[error("malformed row for table {table}: {source}")]
    Malformed {
        /// Table name.
        table: String,
        /// Validation failure.
        #[source]
        source: SchemaError,
    },
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::ColumnType;

    fn schema() -> TableSchema {
        TableSchema::new("t")
            .column("id", ColumnType::Int)
            .column("v", ColumnType::String)
            .primary_key("id")
    }

    fn r(id: i64, v: &str) -> Row {
        Row::new(vec![id.into(), v.into()])
    }

    #[test]
    fn test_table_update_builder() {
        let u = TableUpdate::new("t")
            .insert(r(1, "a"))
            .delete(r(2, "b"))
            .update(r(3, "c"), r(3, "d"));
        assert_eq!(u.len(), 3);
        let ev = TransactionEvent::new(7).with_table(u);
        assert_eq!(ev.row_count(), 3);
    }

    #[test]
    fn test_pair_by_primary_key() {
        let mut u = TableUpdate::new("t")
            .delete(r(1, "old"))
            .delete(r(2, "gone"))
            .insert(r(1, "new"))
            .insert(r(3, "fresh"));
        pair_by_primary_key(&schema(), &mut u);
        assert_eq!(
            u.updates,
            vec![RowUpdate {
                old: r(1, "old"),
                new: r(1, "new")
            }]
        );
        assert_eq!(u.deletes, vec![r(2, "gone")]);
        assert_eq!(u.inserts, vec![r(3, "fresh")]);
    }

    #[test]
    fn test_pair_skips_keyless_tables() {
        let keyless = TableSchema::new("t").column("v", ColumnType::Int);
        let mut u = TableUpdate::new("t")
            .delete(Row::new(vec![1.into()]))
            .insert(Row::new(vec![1.into()]));
        pair_by_primary_key(&keyless, &mut u);
        assert!(u.updates.is_empty());
        assert_eq!(u.len(), 2);
    }
}
