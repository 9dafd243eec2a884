//! Benchmark scaffolding for dt-engine-core's pure in-process functions.
//!
//! These measure the rewrite pipeline and key hashing, the parts of a
//! refresh attempt that run entirely in this process rather than against
//! the lake. Database-level benchmarks (actual refresh duration against a
//! live Postgres instance) need a running lake and aren't covered here.

use criterion::{BenchmarkId, Criterion, black_box, criterion_group, criterion_main};
use dt_engine_core::hash::{bucket_of, hash_key_parts};
use dt_engine_core::model::QualifiedName;
use dt_engine_core::rewrite::{add_predicate, parse, pin_snapshots, render};
use std::collections::HashMap;

fn bench_parse(c: &mut Criterion) {
    let queries = [
        ("simple", "SELECT customer_id, count(*) FROM orders GROUP BY customer_id"),
        (
            "join",
            "SELECT o.customer_id, sum(o.amount) FROM orders o JOIN customers c ON o.customer_id = c.id \
             WHERE c.region = 'us' GROUP BY o.customer_id",
        ),
        (
            "cte",
            "WITH recent AS (SELECT * FROM orders WHERE created_at > '2024-01-01') \
             SELECT customer_id, count(*) FROM recent GROUP BY customer_id",
        ),
    ];

    let mut group = c.benchmark_group("rewrite_parse");
    for (name, sql) in queries {
        group.bench_with_input(BenchmarkId::from_parameter(name), sql, |b, sql| {
            b.iter(|| parse(black_box(sql)).unwrap());
        });
    }
    group.finish();
}

fn bench_pin_and_render(c: &mut Criterion) {
    let sql = "SELECT o.customer_id, sum(o.amount) FROM orders o JOIN customers c ON o.customer_id = c.id \
               GROUP BY o.customer_id";
    let mut pins = HashMap::new();
    pins.insert(QualifiedName::parse("public.orders"), "1000".to_string());
    pins.insert(QualifiedName::parse("public.customers"), "2000".to_string());

    c.bench_function("rewrite_pin_and_render", |b| {
        b.iter(|| {
            let query = parse(black_box(sql)).unwrap();
            let pinned = pin_snapshots(query, black_box(&pins));
            render(black_box(&pinned))
        });
    });
}

fn bench_add_predicate(c: &mut Criterion) {
    let sql = "SELECT customer_id, count(*) FROM orders GROUP BY customer_id";
    for size in [1, 50, 500] {
        let values: Vec<String> = (0..size).map(|i| format!("'{i}'")).collect();
        let predicate = format!("customer_id IN ({})", values.join(", "));
        let label = format!("{size}_keys");
        c.bench_with_input(BenchmarkId::new("rewrite_add_predicate", label), &predicate, |b, predicate| {
            b.iter(|| {
                let query = parse(black_box(sql)).unwrap();
                add_predicate(query, black_box(predicate)).unwrap()
            });
        });
    }
}

fn bench_hash_key_parts(c: &mut Criterion) {
    let mut group = c.benchmark_group("hash_key_parts");
    for width in [1, 2, 4] {
        let parts: Vec<Option<&str>> = (0..width).map(|_| Some("12345678")).collect();
        group.bench_with_input(BenchmarkId::from_parameter(width), &parts, |b, parts| {
            b.iter(|| hash_key_parts(black_box(parts)));
        });
    }
    group.finish();
}

fn bench_bucket_of(c: &mut Criterion) {
    c.bench_function("bucket_of", |b| {
        b.iter(|| bucket_of(black_box(0x9e3779b97f4a7c15), black_box(16)));
    });
}

criterion_group!(
    benches,
    bench_parse,
    bench_pin_and_render,
    bench_add_predicate,
    bench_hash_key_parts,
    bench_bucket_of,
);
criterion_main!(benches);
