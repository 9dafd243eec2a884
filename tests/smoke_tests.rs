//! Basic PostgreSQL connectivity checks via Testcontainers, run before the
//! heavier metadata/lake/scenario suites.

mod common;

use common::TestDb;

#[tokio::test]
async fn container_starts_and_connects() {
    let db = TestDb::new().await;

    let version: String = db.query_scalar("SELECT version()").await;
    assert!(version.contains("PostgreSQL"), "expected a PostgreSQL version string, got: {version}");
}

#[tokio::test]
async fn create_table_and_insert() {
    let db = TestDb::new().await;

    db.execute("CREATE TABLE smoke_orders (id INT PRIMARY KEY, amount NUMERIC)").await;
    db.execute("INSERT INTO smoke_orders VALUES (1, 100.50), (2, 200.75)").await;

    assert_eq!(db.count("smoke_orders").await, 2);
}

#[tokio::test]
async fn schemas_can_be_created() {
    let db = TestDb::new().await;

    db.execute("CREATE SCHEMA IF NOT EXISTS smoke_schema").await;

    let exists: bool = db
        .query_scalar("SELECT EXISTS(SELECT 1 FROM information_schema.schemata WHERE schema_name = 'smoke_schema')")
        .await;
    assert!(exists, "smoke_schema should exist");
}

#[tokio::test]
async fn migrations_apply_cleanly_and_are_idempotent() {
    let db = TestDb::with_schema().await;

    let tables: Vec<String> = {
        let rows = db
            .client
            .query(
                "SELECT table_name FROM information_schema.tables WHERE table_schema = 'public' ORDER BY table_name",
                &[],
            )
            .await
            .expect("listing tables should not fail");
        rows.iter().map(|r| r.get(0)).collect()
    };
    assert!(tables.contains(&"dynamic_tables".to_string()));
    assert!(tables.contains(&"lake_versions".to_string()));

    let dir = std::path::Path::new(env!("CARGO_MANIFEST_DIR")).join("migrations");
    dt_engine_core::migrate::run(&db.client, &dir)
        .await
        .expect("re-running migrations against an already-migrated database should be a no-op");
}
