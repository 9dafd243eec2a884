//! Benchmark scaffolding for the scheduler's pure in-process decisions:
//! dependency-graph closure/topo-sort over a due set, and the strategy
//! selector's early decision, at a few fleet sizes. Claim and history I/O
//! against the metadata store aren't covered here.

use criterion::{BenchmarkId, Criterion, black_box, criterion_group, criterion_main};
use dt_engine_core::dag::DependencyGraph;
use dt_engine_core::model::{
    DurationSecs, InitializeMode, QualifiedName, RefreshStrategyPref, TableProperties, TableStatus, TargetLag,
};
use dt_engine_core::rewrite::parse;
use dt_engine_core::strategy::select_early;
use std::collections::HashSet;

fn chain_graph(depth: usize) -> (DependencyGraph, Vec<QualifiedName>) {
    let mut graph = DependencyGraph::new();
    let names: Vec<QualifiedName> = (0..depth).map(|i| QualifiedName::parse(&format!("public.t{i}"))).collect();
    for name in &names {
        graph.add_node(name.clone());
    }
    for pair in names.windows(2) {
        graph.add_edge(pair[1].clone(), pair[0].clone());
    }
    (graph, names)
}

fn bench_close_and_topo_sort(c: &mut Criterion) {
    let mut group = c.benchmark_group("dag_close_and_topo_sort");
    for depth in [10, 100, 1000] {
        let (graph, names) = chain_graph(depth);
        let due: HashSet<QualifiedName> = [names.last().unwrap().clone()].into_iter().collect();
        group.bench_with_input(BenchmarkId::from_parameter(depth), &(graph, due), |b, (graph, due)| {
            b.iter(|| {
                let closed = graph.close_under_dependencies(black_box(due));
                graph.topo_sort(black_box(&closed)).unwrap()
            });
        });
    }
    group.finish();
}

fn bench_depth(c: &mut Criterion) {
    let (graph, names) = chain_graph(500);
    c.bench_function("dag_depth_at_tail", |b| {
        b.iter(|| graph.depth(black_box(names.last().unwrap())));
    });
}

fn bench_select_early(c: &mut Criterion) {
    let query = parse("SELECT customer_id, count(*) FROM orders GROUP BY customer_id").unwrap();
    let table = dt_engine_core::model::DynamicTable {
        name: QualifiedName::parse("analytics.daily_orders"),
        definition: "SELECT customer_id, count(*) FROM orders GROUP BY customer_id".to_string(),
        grouping_keys: vec!["customer_id".to_string()],
        sources: vec![],
        properties: TableProperties {
            target_lag: TargetLag::Duration(DurationSecs(3600)),
            refresh_strategy: RefreshStrategyPref::Auto,
            deduplication: false,
            cardinality_threshold: 0.3,
            allow_parallel: false,
            parallel_threshold: 10_000_000,
            max_parallelism: 4,
            initialize: InitializeMode::OnCreate,
            status: TableStatus::Active,
            comment: None,
        },
        created_at: chrono::Utc::now(),
        updated_at: chrono::Utc::now(),
    };

    c.bench_function("strategy_select_early", |b| {
        b.iter(|| select_early(black_box(&table), black_box(&query), true, true));
    });
}

criterion_group!(benches, bench_close_and_topo_sort, bench_depth, bench_select_early);
criterion_main!(benches);
