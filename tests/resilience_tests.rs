//! Scenario 4 (claim recovery): a worker claims a table and "crashes"
//! without releasing or heartbeating; after the claim timeout elapses, a
//! second worker reclaims and completes the refresh exactly once.

mod common;

use std::time::Duration;

use chrono::Utc;
use common::TestDb;
use dt_engine_core::executor::RefreshExecutor;
use dt_engine_core::lake::{LakeClient, PostgresLake};
use dt_engine_core::metadata::{MetadataStore, PostgresMetadataStore};
use dt_engine_core::model::{
    DurationSecs, DynamicTable, InitializeMode, QualifiedName, RefreshStrategyPref, SourceRef, Strategy,
    TableProperties, TableStatus, TargetLag, Trigger,
};
use std::sync::Arc;
use tokio_postgres::NoTls;

async fn second_client(db: &TestDb) -> tokio_postgres::Client {
    let (client, connection) = tokio_postgres::connect(&db.url, NoTls).await.expect("second connection");
    tokio::spawn(async move {
        let _ = connection.await;
    });
    client
}

#[tokio::test]
async fn crashed_worker_claim_expires_and_is_reclaimed_exactly_once() {
    let db = TestDb::with_schema().await;
    let metadata: Arc<dyn MetadataStore> = Arc::new(PostgresMetadataStore::new(second_client(&db).await));
    let lake: Arc<dyn LakeClient> = Arc::new(PostgresLake::new(second_client(&db).await, "dt_engine_changes"));
    let executor = RefreshExecutor::new(metadata.clone(), lake.clone());

    db.execute("CREATE TABLE orders (id INT PRIMARY KEY, customer_id INT)").await;
    db.execute("INSERT INTO orders VALUES (1, 1), (2, 2)").await;
    db.execute("CREATE TABLE analytics.daily_orders (customer_id INT, count BIGINT)").await;
    lake.register_source(&QualifiedName::parse("orders"), &["customer_id".to_string()]).await.unwrap();

    let t = DynamicTable {
        name: QualifiedName::parse("analytics.daily_orders"),
        definition: "SELECT customer_id, count(*) AS count FROM orders GROUP BY customer_id".to_string(),
        grouping_keys: vec!["customer_id".to_string()],
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
        created_at: Utc::now(),
        updated_at: Utc::now(),
    };
    metadata.create_table(&t).await.unwrap();

    // Worker 1 claims the table, in the past relative to a short timeout,
    // then "crashes" — no release, no heartbeat.
    let stale_claim_time = Utc::now() - chrono::Duration::seconds(10);
    let timeout = Duration::from_secs(1);
    assert!(metadata.try_claim_table(&t.name, "worker-1", timeout, stale_claim_time).await.unwrap());
    assert!(!metadata.try_claim_table(&t.name, "worker-2", timeout, Utc::now()).await.unwrap());

    // Expiry sweep (the scheduler's tick) finds the stale claim.
    let expired = metadata.expire_stale_claims(Utc::now()).await.unwrap();
    assert_eq!(expired, vec![t.name.clone()]);
    assert_eq!(metadata.active_claim_count().await.unwrap(), 0);

    // Worker 2 claims and completes the refresh.
    assert!(metadata.try_claim_table(&t.name, "worker-2", timeout, Utc::now()).await.unwrap());
    let result = executor.execute(&t, Strategy::Bootstrap, Trigger::Scheduled).await.unwrap();
    assert_eq!(result.rows_affected, 2);
    metadata.release_claim(&t.name, "worker-2").await.unwrap();

    // Exactly one history row recorded, and exactly one snapshot advance.
    let history = metadata.recent_history(&t.name, 10).await.unwrap();
    assert_eq!(history.len(), 1);
    let snaps = metadata.get_source_snapshots(&t.name).await.unwrap();
    assert_eq!(snaps.len(), 1);
}
