//! Applies table diffs to mirrors and records the resulting callbacks.
//!
//! Per table the order is deletes, then inserts, then updates. Callbacks are
//! queued, not fired: the caller flushes the [`DispatchQueue`] only after
//! every table of the event has been applied.
//!
//! A row is only stored while some applied subscription still wants it. An
//! update that moves a row out of every subscription is applied as a delete
//! of the stored row, so the mirror never holds rows nothing subscribes to.

use std::sync::Arc;

use fxhash::FxHashMap;

use super::diff::{pair_by_primary_key, DiffError, RowUpdate, TableUpdate};
use super::dispatch::DispatchQueue;
use super::observer::ObserverRegistry;
use super::table::{MirrorSet, TableMirror};
use crate::schema::{Row, TableSchema};

/// Decides whether a row still belongs in its table mirror.
pub(crate) trait RowCoverage {
    fn retains(&self, table: &str, row: &Row) -> bool;
}

/// Applies the table updates of one event.
pub(crate) struct DiffApplier<'a> {
    schemas: &'a FxHashMap<String, Arc<TableSchema>>,
    mirrors: &'a mut MirrorSet,
    observers: &'a ObserverRegistry,
    coverage: &'a dyn RowCoverage,
    pair_updates: bool,
    queue: DispatchQueue,
    applied: usize,
    skipped: usize,
}

impl<'a> DiffApplier<'a> {
    pub(crate) fn new(
        schemas: &'a FxHashMap<String, Arc<TableSchema>>,
        mirrors: &'a mut MirrorSet,
        observers: &'a ObserverRegistry,
        coverage: &'a dyn RowCoverage,
        pair_updates: bool,
    ) -> Self {
        Self {
            schemas,
            mirrors,
            observers,
            coverage,
            pair_updates,
            queue: DispatchQueue::default(),
            applied: 0,
            skipped: 0,
        }
    }

    /// Applies one table's diffs. Unknown or unmirrored tables are skipped.
    pub(crate) fn apply_table(&mut self, mut update: TableUpdate) {
        let Some(mirror) = self.mirrors.get_mut(&update.table) else {
            if self.schemas.contains_key(&update.table) {
                tracing::debug!(table = %update.table, rows = update.len(), "table not mirrored, skipping diff");
            } else {
                tracing::warn!(table = %update.table, rows = update.len(), "diff for undeclared table, skipping");
            }
            self.skipped += update.len();
            return;
        };
        let table = update.table.clone();
        let schema = Arc::clone(mirror.schema());

        let before = update.len();
        let observers = self.observers;
        let queue = &mut self.queue;
        let mut check = |row: &Row| match schema.check_row(row) {
            Ok(()) => true,
            Err(source) => {
                tracing::warn!(table = %table, error = %source, "malformed row, skipping diff");
                let error = DiffError::Malformed {
                    table: table.clone(),
                    source,
                };
                queue.failed(observers, &table, &error);
                false
            }
        };
        update.deletes.retain(|row| check(row));
        update.inserts.retain(|row| check(row));
        update.updates.retain(|u| check(&u.old) && check(&u.new));
        self.skipped += before - update.len();

        if self.pair_updates {
            pair_by_primary_key(&schema, &mut update);
        }

        let mut step = TableStep {
            table: &table,
            mirror,
            observers,
            coverage: self.coverage,
            queue: &mut self.queue,
        };
        for row in update.deletes {
            step.delete(&row);
        }
        for row in update.inserts {
            step.insert(row);
        }
        for RowUpdate { old, new } in update.updates {
            step.update(&old, new);
        }
        self.applied += 1;
    }

    /// Number of tables applied and diffs skipped.
    pub(crate) fn stats(&self) -> (usize, usize) {
        (self.applied, self.skipped)
    }

    pub(crate) fn finish(self) -> DispatchQueue {
        self.queue
    }
}

/// Mutations of one table mirror.
struct TableStep<'s> {
    table: &'s str,
    mirror: &'s mut TableMirror,
    observers: &'s ObserverRegistry,
    coverage: &'s dyn RowCoverage,
    queue: &'s mut DispatchQueue,
}

impl TableStep<'_> {
    fn delete(&mut self, row: &Row) {
        let key = self.mirror.schema().row_key(row);
        match self.mirror.remove(&key) {
            Some(stored) => self.queue.deleted(self.observers, self.table, &stored),
            None => tracing::debug!(table = self.table, "delete of row not mirrored"),
        }
    }

    fn insert(&mut self, row: Row) {
        if !self.coverage.retains(self.table, &row) {
            tracing::debug!(table = self.table, "inserted row outside every subscription");
            self.delete(&row);
            return;
        }
        match self.mirror.insert(row.clone()) {
            None => self.queue.inserted(self.observers, self.table, &row),
            // Same row delivered again, e.g. by an overlapping subscription.
            Some(prev) if prev == row => {}
            Some(prev) => self.queue.updated(self.observers, self.table, &prev, &row),
        }
    }

    fn update(&mut self, old: &Row, new: Row) {
        let old_key = self.mirror.schema().row_key(old);
        let stored = self.mirror.remove(&old_key);
        if !self.coverage.retains(self.table, &new) {
            tracing::debug!(table = self.table, "row left every subscription, dropping it");
            if let Some(prev) = stored {
                self.queue.deleted(self.observers, self.table, &prev);
            }
            return;
        }
        let displaced = self.mirror.insert(new.clone());
        match (stored, displaced) {
            (Some(prev), None) => self.queue.updated(self.observers, self.table, &prev, &new),
            (Some(prev), Some(other)) => {
                // The new key collided with a different mirrored row.
                self.queue.deleted(self.observers, self.table, &other);
                self.queue.updated(self.observers, self.table, &prev, &new);
            }
            (None, Some(other)) if other == new => {}
            (None, Some(other)) => self.queue.updated(self.observers, self.table, &other, &new),
            (None, None) => {
                tracing::debug!(table = self.table, "update of row not mirrored, treating as insert");
                self.queue.inserted(self.observers, self.table, &new);
            }
        }
    }
}

// ===========================================================================
// Tests
// ===========================================================================
