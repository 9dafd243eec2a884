//! Integration tests for [`PostgresMetadataStore`] against a live
//! Postgres instance (spec §6.1's CRUD + claim + subtask operation set).

mod common;

use std::collections::HashMap;
use std::time::Duration;

use chrono::Utc;
use common::TestDb;
use dt_engine_core::metadata::{MetadataStore, NewSubtask, PostgresMetadataStore, RefreshHistoryEntry};
use dt_engine_core::model::{
    DurationSecs, DynamicTable, InitializeMode, QualifiedName, RefreshOutcome, RefreshStrategyPref, SourceRef,
    Strategy, SubtaskKind, TableProperties, TableStatus, TargetLag, Trigger,
};
use tokio_postgres::NoTls;

async fn second_client(db: &TestDb) -> tokio_postgres::Client {
    let (client, connection) = tokio_postgres::connect(&db.url, NoTls).await.expect("second connection");
    tokio::spawn(async move {
        let _ = connection.await;
    });
    client
}

fn table(name: &str, grouping_keys: Vec<&str>) -> DynamicTable {
    let now = Utc::now();
    DynamicTable {
        name: QualifiedName::parse(name),
        definition: "SELECT customer_id, count(*) FROM orders GROUP BY customer_id".to_string(),
        grouping_keys: grouping_keys.into_iter().map(String::from).collect(),
        sources: vec![SourceRef {
            name: QualifiedName::parse("orders"),
            is_dynamic_table: false,
            key_columns: vec!["customer_id".to_string()],
        }],
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
        created_at: now,
        updated_at: now,
    }
}

#[tokio::test]
async fn create_and_fetch_round_trips_sources_and_properties() {
    let db = TestDb::with_schema().await;
    let store = PostgresMetadataStore::new(second_client(&db).await);

    let t = table("analytics.daily_orders", vec!["customer_id"]);
    store.create_table(&t).await.unwrap();

    let fetched = store.get_table(&t.name).await.unwrap().expect("table exists");
    assert_eq!(fetched.definition, t.definition);
    assert_eq!(fetched.grouping_keys, vec!["customer_id".to_string()]);
    assert_eq!(fetched.sources.len(), 1);
    assert_eq!(fetched.sources[0].name, QualifiedName::parse("orders"));
    assert_eq!(fetched.properties.target_lag, TargetLag::Duration(DurationSecs(3600)));
}

#[tokio::test]
async fn create_table_rejects_duplicate_name() {
    let db = TestDb::with_schema().await;
    let store = PostgresMetadataStore::new(second_client(&db).await);

    let t = table("analytics.daily_orders", vec!["customer_id"]);
    store.create_table(&t).await.unwrap();
    let err = store.create_table(&t).await.unwrap_err();
    assert_eq!(err.code(), "already_exists");
}

#[tokio::test]
async fn dependency_graph_round_trips_edges() {
    let db = TestDb::with_schema().await;
    let store = PostgresMetadataStore::new(second_client(&db).await);

    let a = table("a", vec!["k"]);
    let b = table("b", vec!["k"]);
    store.create_table(&a).await.unwrap();
    store.create_table(&b).await.unwrap();
    store.add_dependency(&b.name, &a.name).await.unwrap();

    let graph = store.load_dependency_graph().await.unwrap();
    assert_eq!(graph.upstreams_of(&b.name), &[a.name.clone()]);
    assert!(graph.would_cycle(&a.name, &b.name));
}

#[tokio::test]
async fn source_snapshots_advance_and_are_readable() {
    let db = TestDb::with_schema().await;
    let store = PostgresMetadataStore::new(second_client(&db).await);

    let t = table("analytics.daily_orders", vec!["customer_id"]);
    store.create_table(&t).await.unwrap();

    let mut pins = HashMap::new();
    pins.insert(QualifiedName::parse("orders"), "7".to_string());
    store.advance_source_snapshots(&t.name, &pins, Utc::now()).await.unwrap();

    let snaps = store.get_source_snapshots(&t.name).await.unwrap();
    assert_eq!(snaps.len(), 1);
    assert_eq!(snaps[0].last_snapshot, "7");

    // Monotonicity: a later advance overwrites, never rewinds silently.
    let mut later = HashMap::new();
    later.insert(QualifiedName::parse("orders"), "9".to_string());
    store.advance_source_snapshots(&t.name, &later, Utc::now()).await.unwrap();
    let snaps = store.get_source_snapshots(&t.name).await.unwrap();
    assert_eq!(snaps[0].last_snapshot, "9");
}

#[tokio::test]
async fn claim_is_exclusive_across_workers() {
    let db = TestDb::with_schema().await;
    let store = PostgresMetadataStore::new(second_client(&db).await);

    let t = table("analytics.daily_orders", vec!["customer_id"]);
    store.create_table(&t).await.unwrap();
    let now = Utc::now();
    let timeout = Duration::from_secs(300);

    assert!(store.try_claim_table(&t.name, "worker-1", timeout, now).await.unwrap());
    // Uniqueness invariant: a second worker cannot also claim the same table.
    assert!(!store.try_claim_table(&t.name, "worker-2", timeout, now).await.unwrap());

    store.release_claim(&t.name, "worker-1").await.unwrap();
    assert!(store.try_claim_table(&t.name, "worker-2", timeout, now).await.unwrap());
}

#[tokio::test]
async fn expire_stale_claims_returns_expired_tables() {
    let db = TestDb::with_schema().await;
    let store = PostgresMetadataStore::new(second_client(&db).await);

    let t = table("analytics.daily_orders", vec!["customer_id"]);
    store.create_table(&t).await.unwrap();
    let past = Utc::now() - chrono::Duration::seconds(600);
    store.try_claim_table(&t.name, "worker-1", Duration::from_secs(1), past).await.unwrap();

    let expired = store.expire_stale_claims(Utc::now()).await.unwrap();
    assert_eq!(expired, vec![t.name.clone()]);
    assert_eq!(store.active_claim_count().await.unwrap(), 0);
}

#[tokio::test]
async fn subtasks_round_trip_through_claim_and_completion() {
    let db = TestDb::with_schema().await;
    let store = PostgresMetadataStore::new(second_client(&db).await);

    let t = table("analytics.daily_orders", vec!["customer_id"]);
    store.create_table(&t).await.unwrap();
    store.enqueue_pending(&t.name, Utc::now(), 0).await.unwrap();
    store.try_claim_table(&t.name, "worker-1", Duration::from_secs(300), Utc::now()).await.unwrap();
    store.convert_claim_to_coordinator(&t.name, "worker-1", 2).await.unwrap();

    let ids = store
        .insert_subtasks(
            &t.name,
            &[
                NewSubtask { kind: SubtaskKind::HashRange, partition_spec_json: serde_json::json!({"lo": 0}) },
                NewSubtask { kind: SubtaskKind::HashRange, partition_spec_json: serde_json::json!({"lo": 1}) },
            ],
        )
        .await
        .unwrap();
    assert_eq!(ids.len(), 2);

    let claimed = store.claim_next_subtask("worker-2", Utc::now()).await.unwrap().expect("one subtask ready");
    assert_eq!(claimed.dynamic_table, t.name);
    store.complete_subtask(claimed.id, "dt_result_0", Utc::now()).await.unwrap();

    let all = store.subtasks_for_refresh(&t.name).await.unwrap();
    assert_eq!(all.iter().filter(|s| s.status == dt_engine_core::model::SubtaskStatus::Completed).count(), 1);
}

#[tokio::test]
async fn append_history_is_idempotent_on_start_time_conflict() {
    let db = TestDb::with_schema().await;
    let store = PostgresMetadataStore::new(second_client(&db).await);

    let t = table("analytics.daily_orders", vec!["customer_id"]);
    store.create_table(&t).await.unwrap();

    let started = Utc::now();
    let entry = RefreshHistoryEntry {
        id: 0,
        dynamic_table: t.name.clone(),
        started_at: started,
        completed_at: Some(started),
        status: RefreshOutcome::Success,
        strategy: Some(Strategy::Full),
        rows_affected: 10,
        duration_ms: 5,
        error_code: None,
        error_message: None,
        snapshots_json: serde_json::json!({}),
        trigger: Trigger::Scheduled,
    };
    store.append_history(&entry).await.unwrap();
    store.append_history(&entry).await.unwrap();

    let history = store.recent_history(&t.name, 10).await.unwrap();
    assert_eq!(history.len(), 1);
}
