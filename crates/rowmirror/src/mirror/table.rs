//! Keyed in-memory row store for one table.
//!
//! A [`TableMirror`] exists only while at least one applied subscription
//! covers its table. Readers get shared access through [`MirrorSet`]; only the
//! diff applier and the cache mutate it.

use std::sync::Arc;

use fxhash::FxHashMap;

use crate::predicate::{scope_matches, BoundPredicate};
use crate::schema::{Row, RowKey, TableSchema, Value};

// ---------------------------------------------------------------------------
// TableMirror
// ---------------------------------------------------------------------------

/// Client-local copy of the mirrored subset of one table.
#[derive(Debug, Clone)]
pub struct TableMirror {
    schema: Arc<TableSchema>,
    rows: FxHashMap<RowKey, Row>,
}

impl TableMirror {
    pub(crate) fn new(schema: Arc<TableSchema>) -> Self {
        Self {
            schema,
            rows: FxHashMap::default(),
        }
    }

    /// Table name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.schema.name
    }

    /// Declared schema.
    #[must_use]
    pub fn schema(&self) -> &Arc<TableSchema> {
        &self.schema
    }

    /// Number of mirrored rows.
    #[must_use]
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    /// Returns `true` if no rows are mirrored.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Looks up a row by key.
    #[must_use]
    pub fn get(&self, key: &RowKey) -> Option<&Row> {
        self.rows.get(key)
    }

    /// Looks up a row by primary key value.
    ///
    /// Always `None` for tables without a primary key.
    #[must_use]
    pub fn find(&self, primary_key: &Value) -> Option<&Row> {
        self.schema.primary_key_index()?;
        self.rows.get(&RowKey::Primary(primary_key.clone()))
    }

    /// Returns `true` if an identical row is mirrored.
    #[must_use]
    pub fn contains(&self, row: &Row) -> bool {
        self.rows
            .get(&self.schema.row_key(row))
            .is_some_and(|stored| stored == row)
    }

    /// Iterates rows in unspecified order.
    pub fn iter(&self) -> impl Iterator<Item = &Row> + '_ {
        self.rows.values()
    }

    /// All rows, ordered by key.
    #[must_use]
    pub fn rows(&self) -> Vec<Row> {
        self.filter(None)
    }

    /// Rows matching `predicate`, ordered by key.
    #[must_use]
    pub fn filter(&self, predicate: Option<&BoundPredicate>) -> Vec<Row> {
        let mut matched: Vec<(&RowKey, &Row)> = self
            .rows
            .iter()
            .filter(|(_, row)| scope_matches(predicate, row))
            .collect();
        matched.sort_unstable_by(|a, b| a.0.cmp(b.0));
        matched.into_iter().map(|(_, row)| row.clone()).collect()
    }

    /// Stores `row`, returning the row it displaced (same key), if any.
    pub(crate) fn insert(&mut self, row: Row) -> Option<Row> {
        self.rows.insert(self.schema.row_key(&row), row)
    }

    pub(crate) fn remove(&mut self, key: &RowKey) -> Option<Row> {
        self.rows.remove(key)
    }

    /// Removes every row, returning them ordered by key.
    pub(crate) fn drain(&mut self) -> Vec<Row> {
        let mut rows: Vec<(RowKey, Row)> = self.rows.drain().collect();
        rows.sort_unstable_by(|a, b| a.0.cmp(&b.0));
        rows.into_iter().map(|(_, row)| row).collect()
    }

    /// Removes rows for which `keep` is `false`, returning them ordered by key.
    pub(crate) fn prune(&mut self, mut keep: impl FnMut(&Row) -> bool) -> Vec<Row> {
        let mut doomed: Vec<RowKey> = self
            .rows
            .iter()
            .filter(|(_, row)| !keep(row))
            .map(|(key, _)| key.clone())
            .collect();
        doomed.sort_unstable();
        doomed
            .iter()
            .filter_map(|key| self.rows.remove(key))
            .collect()
    }
}

// ---------------------------------------------------------------------------
// MirrorSet
// ---------------------------------------------------------------------------

/// Mirrors of every currently covered table.
#[derive(Debug, Default)]
pub struct MirrorSet {
    tables: FxHashMap<String, TableMirror>,
}

impl MirrorSet {
    /// Mirror of `table`, if it is covered.
    #[must_use]
    pub fn get(&self, table: &str) -> Option<&TableMirror> {
        self.tables.get(table)
    }

    /// Returns `true` if `table` is mirrored.
    #[must_use]
    pub fn contains(&self, table: &str) -> bool {
        self.tables.contains_key(table)
    }

    /// Names of mirrored tables, sorted.
    #[must_use]
    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.tables.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    /// Number of mirrored tables.
    #[must_use]
    pub fn len(&self) -> usize {
        self.tables.len()
    }

    /// Returns `true` if no table is mirrored.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.tables.is_empty()
    }

    pub(crate) fn get_mut(&mut self, table: &str) -> Option<&mut TableMirror> {
        self.tables.get_mut(table)
    }

    /// Creates the mirror for `schema` unless it already exists.
    pub(crate) fn ensure(&mut self, schema: &Arc<TableSchema>) -> &mut TableMirror {
        self.tables
            .entry(schema.name.clone())
            .or_insert_with(|| TableMirror::new(Arc::clone(schema)))
    }

    pub(crate) fn remove(&mut self, table: &str) -> Option<TableMirror> {
        self.tables.remove(table)
    }
}

// ===========================================================================
// Tests
// ===========================================================================
