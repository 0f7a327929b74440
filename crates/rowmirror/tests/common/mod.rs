//! Shared helpers for integration tests.

#![allow(dead_code)]

use std::sync::Arc;

use parking_lot::Mutex;
use rowmirror::prelude::*;
use tracing_subscriber::EnvFilter;

/// Routes cache logs to the test harness; filter with `RUST_LOG`.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// `orders(id INT PRIMARY KEY, status STRING, amount INT)`.
pub fn orders_schema() -> TableSchema {
    TableSchema::new("orders")
        .column("id", ColumnType::Int)
        .column("status", ColumnType::String)
        .column("amount", ColumnType::Int)
        .primary_key("id")
}

/// `audit(msg STRING)`: no primary key, rows keyed by their content.
pub fn audit_schema() -> TableSchema {
    TableSchema::new("audit").column("msg", ColumnType::String)
}

pub fn order(id: i64, status: &str, amount: i64) -> Row {
    Row::new(vec![id.into(), status.into(), amount.into()])
}

pub fn cache_with(policy: ReconnectPolicy) -> (ClientCache, Outbox) {
    init_tracing();
    let outbox = Outbox::new();
    let cache = ClientCache::builder()
        .tables([orders_schema(), audit_schema()])
        .reconnect_policy(policy)
        .command_sink(outbox.clone())
        .build()
        .unwrap();
    (cache, outbox)
}

pub fn cache() -> (ClientCache, Outbox) {
    cache_with(ReconnectPolicy::default())
}

pub fn connect(cache: &mut ClientCache) {
    cache
        .handle_event(SessionEvent::Connected {
            identity: "alice".into(),
            token: "token-1".into(),
        })
        .unwrap();
}

/// Answers every queued subscribe with an applied event carrying `initial`.
pub fn apply_pending(cache: &mut ClientCache, outbox: &Outbox, initial: &[TableUpdate]) {
    for command in outbox.drain() {
        if let SessionCommand::Subscribe { subscription, .. } = command {
            cache
                .handle_event(SessionEvent::SubscriptionApplied {
                    subscription,
                    initial: initial.to_vec(),
                })
                .unwrap();
        }
    }
}

pub fn tx(cache: &mut ClientCache, sequence: u64, update: TableUpdate) {
    cache
        .handle_event(SessionEvent::Transaction(
            TransactionEvent::new(sequence).with_table(update),
        ))
        .unwrap();
}

/// One recorded observer callback.
#[derive(Debug, Clone, PartialEq)]
pub enum Call {
    Insert(Row),
    Delete(Row),
    Update(Row, Row),
}

/// Observer that records every callback it receives.
#[derive(Clone, Default)]
pub struct Recorder {
    calls: Arc<Mutex<Vec<Call>>>,
}

impl Recorder {
    pub fn take(&self) -> Vec<Call> {
        std::mem::take(&mut *self.calls.lock())
    }
}

impl RowObserver for Recorder {
    fn on_insert(&mut self, _ctx: &EventContext<'_>, row: &Row) {
        self.calls.lock().push(Call::Insert(row.clone()));
    }

    fn on_delete(&mut self, _ctx: &EventContext<'_>, row: &Row) {
        self.calls.lock().push(Call::Delete(row.clone()));
    }

    fn on_update(&mut self, _ctx: &EventContext<'_>, old: &Row, new: &Row) {
        self.calls.lock().push(Call::Update(old.clone(), new.clone()));
    }
}
