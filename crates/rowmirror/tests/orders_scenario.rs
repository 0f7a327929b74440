//! End-to-end scenarios driven through `ClientCache::handle_event`.

mod common;

use std::sync::Arc;

use common::{apply_pending, cache, connect, order, tx, Call, Recorder};
use parking_lot::Mutex;
use rowmirror::prelude::*;
use rowmirror::mirror::TableMirror;
use rowmirror::Error;

#[test]
fn test_open_orders_view_follows_status_changes() {
    let (mut cache, outbox) = cache();
    let open = cache.view("orders", Some(col("status").eq("open"))).unwrap();
    let recorder = Recorder::default();
    cache
        .observe("orders", Some(col("status").eq("open")), recorder.clone())
        .unwrap();

    connect(&mut cache);
    assert!(!open.is_ready());
    apply_pending(&mut cache, &outbox, &[]);
    assert!(open.is_ready());
    assert!(open.is_empty());

    tx(&mut cache, 1, TableUpdate::new("orders").insert(order(1, "open", 10)));
    assert_eq!(*open.rows(), vec![order(1, "open", 10)]);
    assert_eq!(recorder.take(), vec![Call::Insert(order(1, "open", 10))]);

    tx(
        &mut cache,
        2,
        TableUpdate::new("orders").update(order(1, "open", 10), order(1, "closed", 10)),
    );
    assert_eq!(recorder.take(), vec![Call::Delete(order(1, "open", 10))]);
    assert!(open.is_empty());
    assert!(open.is_ready());
    // No subscription wants a closed order, so the mirror drops it.
    assert_eq!(cache.table("orders").map(TableMirror::len), Some(0));

    // A later update back into scope is seen as an insert.
    tx(
        &mut cache,
        3,
        TableUpdate::new("orders").update(order(1, "closed", 10), order(1, "open", 12)),
    );
    assert_eq!(recorder.take(), vec![Call::Insert(order(1, "open", 12))]);
    assert_eq!(*open.rows(), vec![order(1, "open", 12)]);
}

#[test]
fn test_mirror_retained_while_another_subscription_covers_it() {
    let (mut cache, outbox) = cache();
    connect(&mut cache);
    let open = cache.view("orders", Some(col("status").eq("open"))).unwrap();
    apply_pending(
        &mut cache,
        &outbox,
        &[TableUpdate::new("orders").insert(order(1, "open", 10))],
    );

    let big = cache.subscribe(("orders", col("amount").gt(100))).unwrap();
    apply_pending(
        &mut cache,
        &outbox,
        &[TableUpdate::new("orders").insert(order(2, "open", 500))],
    );
    assert_eq!(open.len(), 2);

    let deletes = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&deletes);
    let watcher = cache
        .on_delete("orders", None, move |_ctx, row| sink.lock().push(row.clone()))
        .unwrap();

    // Dropping the view releases its subscription; row 1 is no longer covered.
    assert!(cache.drop_view(&open).unwrap());
    assert!(matches!(
        outbox.drain().as_slice(),
        [SessionCommand::Unsubscribe { .. }]
    ));
    let mirror = cache.table("orders").unwrap();
    assert_eq!(mirror.rows(), vec![order(2, "open", 500)]);
    assert_eq!(*deletes.lock(), vec![order(1, "open", 10)]);
    assert!(cache.has_observer(watcher));

    // Last subscriber gone: mirror and observers are torn down silently.
    big.unsubscribe(&mut cache).unwrap();
    assert!(cache.table("orders").is_none());
    assert!(!cache.has_observer(watcher));
    assert_eq!(deletes.lock().len(), 1);
    assert_eq!(
        outbox.drain(),
        vec![SessionCommand::Unsubscribe {
            subscription: big.id()
        }]
    );
}

#[test]
fn test_views_with_the_same_query_share_a_subscription() {
    let (mut cache, outbox) = cache();
    connect(&mut cache);
    let a = cache.view("orders", None).unwrap();
    let b = cache.view("orders", None).unwrap();
    assert_eq!(outbox.len(), 1);
    apply_pending(
        &mut cache,
        &outbox,
        &[TableUpdate::new("orders").insert(order(1, "open", 1))],
    );
    assert!(a.is_ready() && b.is_ready());

    cache.drop_view(&a).unwrap();
    assert!(outbox.is_empty());
    assert!(cache.table("orders").is_some());
    assert!(b.is_ready());

    cache.drop_view(&b).unwrap();
    assert_eq!(outbox.len(), 1);
    assert!(cache.table("orders").is_none());
    assert!(!cache.drop_view(&b).unwrap());
}

#[test]
fn test_view_created_after_apply_is_ready_immediately() {
    let (mut cache, outbox) = cache();
    connect(&mut cache);
    let first = cache.view("orders", None).unwrap();
    apply_pending(
        &mut cache,
        &outbox,
        &[TableUpdate::new("orders").insert(order(3, "open", 1))],
    );
    let second = cache.view("orders", None).unwrap();
    assert!(second.is_ready());
    assert_eq!(*second.rows(), *first.rows());
}

#[test]
fn test_transaction_is_coalesced_into_one_recompute() {
    let (mut cache, outbox) = cache();
    connect(&mut cache);
    let open = cache.view("orders", Some(col("status").eq("open"))).unwrap();
    apply_pending(&mut cache, &outbox, &[]);
    let before = open.recompute_count();

    let mut update = TableUpdate::new("orders");
    for id in 0..100 {
        update = update.insert(order(id, "open", id));
    }
    tx(&mut cache, 1, update);
    assert_eq!(open.len(), 100);
    assert_eq!(open.recompute_count(), before + 1);
}

#[test]
fn test_unfiltered_observer_sees_updates() {
    let (mut cache, outbox) = cache();
    connect(&mut cache);
    cache.subscribe("SELECT * FROM orders").unwrap();
    apply_pending(
        &mut cache,
        &outbox,
        &[TableUpdate::new("orders").insert(order(1, "open", 10))],
    );
    let recorder = Recorder::default();
    cache.observe("orders", None, recorder.clone()).unwrap();

    tx(
        &mut cache,
        1,
        TableUpdate::new("orders").update(order(1, "open", 10), order(1, "open", 20)),
    );
    assert_eq!(
        recorder.take(),
        vec![Call::Update(order(1, "open", 10), order(1, "open", 20))]
    );
}

#[test]
fn test_delete_then_insert_of_same_key_is_one_update() {
    let (mut cache, outbox) = cache();
    connect(&mut cache);
    cache.subscribe("SELECT * FROM orders").unwrap();
    apply_pending(
        &mut cache,
        &outbox,
        &[TableUpdate::new("orders").insert(order(1, "open", 10))],
    );
    let recorder = Recorder::default();
    cache.observe("orders", None, recorder.clone()).unwrap();

    tx(
        &mut cache,
        1,
        TableUpdate::new("orders")
            .delete(order(1, "open", 10))
            .insert(order(1, "paid", 10)),
    );
    assert_eq!(
        recorder.take(),
        vec![Call::Update(order(1, "open", 10), order(1, "paid", 10))]
    );
}

#[test]
fn test_malformed_rows_are_skipped() {
    let (mut cache, outbox) = cache();
    connect(&mut cache);
    cache.subscribe("SELECT * FROM orders").unwrap();
    apply_pending(&mut cache, &outbox, &[]);

    let errors = Arc::new(Mutex::new(0));
    let count = Arc::clone(&errors);
    cache
        .on_error("orders", move |_ctx, _err| *count.lock() += 1)
        .unwrap();

    let event = TransactionEvent::new(1)
        .with_table(
            TableUpdate::new("orders")
                .insert(Row::new(vec![Value::Int(1)]))
                .insert(order(2, "open", 5)),
        )
        .with_table(TableUpdate::new("ghosts").insert(Row::new(vec![Value::Int(1)])));
    cache.handle_event(SessionEvent::Transaction(event)).unwrap();

    assert_eq!(*errors.lock(), 1);
    let mirror = cache.table("orders").unwrap();
    assert_eq!(mirror.len(), 1);
    assert!(mirror.find(&Value::Int(2)).is_some());
}

#[test]
fn test_keyless_table_uses_row_identity() {
    let (mut cache, outbox) = cache();
    connect(&mut cache);
    cache.subscribe("SELECT * FROM audit").unwrap();
    apply_pending(&mut cache, &outbox, &[]);

    let line = Row::new(vec![Value::from("login")]);
    tx(&mut cache, 1, TableUpdate::new("audit").insert(line.clone()).insert(line.clone()));
    assert_eq!(cache.table("audit").map(TableMirror::len), Some(1));
    tx(&mut cache, 2, TableUpdate::new("audit").delete(line.clone()));
    assert!(cache.table("audit").is_some_and(|m| !m.contains(&line)));
}

#[test]
fn test_rejected_subscription_reports_error_once() {
    let (mut cache, outbox) = cache();
    connect(&mut cache);
    let messages = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&messages);
    let handle = cache
        .subscription_builder()
        .on_applied(|_| panic!("rejected subscription must not apply"))
        .on_error(move |_ctx, msg| sink.lock().push(msg.to_string()))
        .subscribe("SELECT * FROM orders WHERE amount > 5")
        .unwrap();
    let _ = outbox.drain();

    for _ in 0..2 {
        cache
            .handle_event(SessionEvent::SubscriptionError {
                subscription: handle.id(),
                message: "no such column".into(),
            })
            .unwrap();
    }
    assert_eq!(*messages.lock(), vec!["no such column".to_string()]);
    assert_eq!(handle.state(&cache), Some(SubscriptionState::Error));
    assert!(!handle.is_active(&cache));

    // Never confirmed by the server, so no unsubscribe is sent.
    handle.unsubscribe(&mut cache).unwrap();
    assert!(outbox.is_empty());
    assert_eq!(handle.state(&cache), None);
}

#[test]
fn test_rejected_view_carries_the_error() {
    let (mut cache, outbox) = cache();
    connect(&mut cache);
    let view = cache.view("orders", None).unwrap();
    let Some(SessionCommand::Subscribe { subscription, .. }) = outbox.drain().pop() else {
        panic!("expected a subscribe command");
    };
    cache
        .handle_event(SessionEvent::SubscriptionError {
            subscription,
            message: "denied".into(),
        })
        .unwrap();
    assert_eq!(view.error().as_deref(), Some("denied"));
    assert!(!view.is_ready());
}

#[test]
fn test_revoked_view_drops_rows_of_the_torn_down_mirror() {
    let (mut cache, outbox) = cache();
    connect(&mut cache);
    let view = cache.view("orders", None).unwrap();
    let Some(SessionCommand::Subscribe { subscription, .. }) = outbox.drain().pop() else {
        panic!("expected a subscribe command");
    };
    cache
        .subscription_applied(
            subscription,
            vec![TableUpdate::new("orders").insert(order(1, "open", 10))],
        )
        .unwrap();
    assert_eq!(view.len(), 1);

    cache
        .handle_event(SessionEvent::SubscriptionError {
            subscription,
            message: "revoked".into(),
        })
        .unwrap();
    assert!(cache.table("orders").is_none());
    assert!(view.is_empty());
    assert_eq!(view.error().as_deref(), Some("revoked"));
    assert!(!view.is_ready());
}

#[test]
fn test_unknown_table_and_bad_predicate_fail_at_registration() {
    let (mut cache, _outbox) = cache();
    assert_eq!(
        cache.view("ghosts", None).unwrap_err(),
        Error::UnknownTable("ghosts".into())
    );
    assert!(matches!(
        cache.observe("orders", Some(col("colour").eq("red")), Recorder::default()),
        Err(Error::Predicate(_))
    ));
    assert!(matches!(
        cache.view("orders", Some(col("amount").eq("lots"))),
        Err(Error::Predicate(_))
    ));
}

#[test]
fn test_callback_may_drive_another_cache() {
    let (mut cache, outbox) = cache();
    connect(&mut cache);
    cache.subscribe("SELECT * FROM orders").unwrap();
    apply_pending(&mut cache, &outbox, &[]);

    let (other, _) = common::cache();
    let other = Arc::new(Mutex::new(other));
    let inner = Arc::clone(&other);
    let outcome = Arc::new(Mutex::new(None));
    let slot = Arc::clone(&outcome);
    cache
        .on_insert("orders", None, move |_ctx, _row| {
            let result = inner.lock().subscribe("SELECT * FROM orders");
            *slot.lock() = Some(result.map(|_| ()));
        })
        .unwrap();

    tx(&mut cache, 1, TableUpdate::new("orders").insert(order(1, "open", 1)));
    assert_eq!(*outcome.lock(), Some(Ok(())));
    assert_eq!(other.lock().subscription_count(), 1);
}
