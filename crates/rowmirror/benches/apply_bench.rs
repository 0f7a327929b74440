//! Diff application Criterion benchmarks.
//!
//! Measures transaction apply with and without observers, update
//! reclassification through a filtered view, and predicate evaluation.
//!
//! Run with: cargo bench --bench apply_bench

use std::hint::black_box;

use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};

use rowmirror::prelude::*;

// ---------------------------------------------------------------------------
// Helper functions
// ---------------------------------------------------------------------------

fn orders() -> TableSchema {
    TableSchema::new("orders")
        .column("id", ColumnType::Int)
        .column("status", ColumnType::String)
        .column("amount", ColumnType::Int)
        .primary_key("id")
}

fn order(id: i64, amount: i64) -> Row {
    Row::new(vec![id.into(), "open".into(), amount.into()])
}

/// A connected cache with an applied `SELECT * FROM orders`, plus an
/// optional filtered view.
fn applied_cache(with_view: bool) -> (ClientCache, Option<ReactiveView>) {
    let outbox = Outbox::new();
    let mut cache = ClientCache::builder()
        .table(orders())
        .command_sink(outbox.clone())
        .build()
        .unwrap();
    cache
        .connected(Identity::from("bench"), String::new())
        .unwrap();
    cache.subscribe("SELECT * FROM orders").unwrap();
    let view = with_view.then(|| cache.view("orders", Some(col("amount").gt(500))).unwrap());
    for command in outbox.drain() {
        if let SessionCommand::Subscribe { subscription, .. } = command {
            cache.subscription_applied(subscription, Vec::new()).unwrap();
        }
    }
    (cache, view)
}

fn insert_batch(size: i64) -> TableUpdate {
    (0..size).fold(TableUpdate::new("orders"), |u, id| u.insert(order(id, id)))
}

// ---------------------------------------------------------------------------
// Benchmarks
// ---------------------------------------------------------------------------

fn bench_apply_inserts(c: &mut Criterion) {
    let mut group = c.benchmark_group("apply_inserts");
    for size in [10i64, 100, 1_000] {
        group.throughput(Throughput::Elements(size as u64));
        group.bench_with_input(BenchmarkId::from_parameter(size), &size, |b, &size| {
            b.iter_batched(
                || applied_cache(false).0,
                |mut cache| {
                    cache
                        .apply(TransactionEvent::new(1).with_table(insert_batch(size)))
                        .unwrap();
                    black_box(cache)
                },
                criterion::BatchSize::SmallInput,
            );
        });
    }
    group.finish();
}

fn bench_update_through_view(c: &mut Criterion) {
    let mut group = c.benchmark_group("update_through_view");
    let size = 1_000i64;
    group.throughput(Throughput::Elements(size as u64));
    group.bench_function("reclassify_1000", |b| {
        b.iter_batched(
            || {
                let (mut cache, view) = applied_cache(true);
                cache
                    .apply(TransactionEvent::new(1).with_table(insert_batch(size)))
                    .unwrap();
                (cache, view)
            },
            |(mut cache, view)| {
                let update = (0..size).fold(TableUpdate::new("orders"), |u, id| {
                    u.update(order(id, id), order(id, size - id))
                });
                cache
                    .apply(TransactionEvent::new(2).with_table(update))
                    .unwrap();
                black_box(view.map(|v| v.len()))
            },
            criterion::BatchSize::SmallInput,
        );
    });
    group.finish();
}

fn bench_predicate_evaluate(c: &mut Criterion) {
    let schema = orders();
    let bound = col("amount")
        .gt(100)
        .and(col("status").eq("open").or(col("id").lt(10)))
        .bind(&schema)
        .unwrap();
    let row = order(42, 250);
    c.bench_function("predicate_matches", |b| {
        b.iter(|| black_box(bound.matches(black_box(&row))));
    });
}

criterion_group!(
    benches,
    bench_apply_inserts,
    bench_update_through_view,
    bench_predicate_evaluate
);
criterion_main!(benches);
