//! Metadata Store Client: typed operations over the coordination schema
//! (spec §6.1). Ported from the reference implementation's
//! `src/catalog.rs` CRUD shape — there, catalog rows live in `pgstream.*`
//! tables and are read/written through pgrx's `Spi`; here the same
//! operation set runs over `tokio-postgres` against a standalone metadata
//! database, because this engine is not a Postgres extension.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value as Json;
use tokio_postgres::Client;

use crate::dag::DependencyGraph;
use crate::error::EngineError;
use crate::model::{
    DynamicTable, InitializeMode, QualifiedName, RefreshOutcome, RefreshStrategyPref, SourceRef,
    Strategy, SubtaskKind, SubtaskStatus, TableProperties, TableStatus, TargetLag, Trigger,
};

#[derive(Debug, Clone)]
pub struct SourceSnapshotRow {
    pub source: QualifiedName,
    pub last_snapshot: String,
    pub last_processed_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct RefreshHistoryEntry {
    pub id: i64,
    pub dynamic_table: QualifiedName,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub status: RefreshOutcome,
    pub strategy: Option<Strategy>,
    pub rows_affected: i64,
    pub duration_ms: i64,
    pub error_code: Option<String>,
    pub error_message: Option<String>,
    pub snapshots_json: Json,
    pub trigger: Trigger,
}

#[derive(Debug, Clone)]
pub struct RefreshSubtask {
    pub id: i64,
    pub parent_refresh: QualifiedName,
    pub dynamic_table: QualifiedName,
    pub kind: SubtaskKind,
    pub partition_spec_json: Json,
    pub status: SubtaskStatus,
    pub result_location: Option<String>,
    pub claimed_by: Option<String>,
    pub retry_count: i32,
}

#[derive(Debug, Clone)]
pub struct NewSubtask {
    pub kind: SubtaskKind,
    pub partition_spec_json: Json,
}

/// Typed operations over the coordination schema. Implemented against
/// `tokio-postgres` by [`PostgresMetadataStore`]; a trait so the executor
/// and scheduler can be exercised in tests against an in-memory fake
/// without a running database.
#[async_trait]
pub trait MetadataStore: Send + Sync {
    async fn get_table(&self, name: &QualifiedName) -> Result<Option<DynamicTable>, EngineError>;
    async fn list_active_tables(&self) -> Result<Vec<DynamicTable>, EngineError>;
    async fn create_table(&self, table: &DynamicTable) -> Result<(), EngineError>;
    async fn update_properties(
        &self,
        name: &QualifiedName,
        props: &TableProperties,
    ) -> Result<(), EngineError>;
    async fn set_status(&self, name: &QualifiedName, status: TableStatus) -> Result<(), EngineError>;
    async fn drop_table(&self, name: &QualifiedName) -> Result<(), EngineError>;

    async fn add_dependency(
        &self,
        downstream: &QualifiedName,
        upstream: &QualifiedName,
    ) -> Result<(), EngineError>;
    async fn load_dependency_graph(&self) -> Result<DependencyGraph, EngineError>;

    async fn get_source_snapshots(
        &self,
        table: &QualifiedName,
    ) -> Result<Vec<SourceSnapshotRow>, EngineError>;
    async fn advance_source_snapshots(
        &self,
        table: &QualifiedName,
        pins: &HashMap<QualifiedName, String>,
        now: DateTime<Utc>,
    ) -> Result<(), EngineError>;

    async fn append_history(&self, entry: &RefreshHistoryEntry) -> Result<(), EngineError>;
    async fn recent_history(
        &self,
        table: &QualifiedName,
        limit: i64,
    ) -> Result<Vec<RefreshHistoryEntry>, EngineError>;

    /// `INSERT ... ON CONFLICT (dynamic_table) DO NOTHING` (spec §4.7 step 4).
    async fn enqueue_pending(
        &self,
        table: &QualifiedName,
        due_at: DateTime<Utc>,
        priority: i32,
    ) -> Result<(), EngineError>;
    async fn next_due_unclaimed(&self, now: DateTime<Utc>) -> Result<Option<QualifiedName>, EngineError>;

    async fn try_claim_table(
        &self,
        table: &QualifiedName,
        worker_id: &str,
        timeout: Duration,
        now: DateTime<Utc>,
    ) -> Result<bool, EngineError>;
    async fn heartbeat_claim(
        &self,
        table: &QualifiedName,
        worker_id: &str,
        timeout: Duration,
        now: DateTime<Utc>,
    ) -> Result<bool, EngineError>;
    async fn release_claim(&self, table: &QualifiedName, worker_id: &str) -> Result<(), EngineError>;
    async fn convert_claim_to_coordinator(
        &self,
        table: &QualifiedName,
        worker_id: &str,
        subtasks_total: i32,
    ) -> Result<(), EngineError>;
    /// Returns the tables whose claims were expired, so the scheduler can
    /// re-enqueue them.
    async fn expire_stale_claims(&self, now: DateTime<Utc>) -> Result<Vec<QualifiedName>, EngineError>;

    async fn insert_subtasks(
        &self,
        table: &QualifiedName,
        subtasks: &[NewSubtask],
    ) -> Result<Vec<i64>, EngineError>;
    async fn claim_next_subtask(
        &self,
        worker_id: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<RefreshSubtask>, EngineError>;
    async fn heartbeat_subtask(&self, id: i64, worker_id: &str, now: DateTime<Utc>) -> Result<bool, EngineError>;
    async fn complete_subtask(&self, id: i64, result_location: &str, now: DateTime<Utc>) -> Result<(), EngineError>;
    async fn fail_subtask(&self, id: i64, error_message: &str) -> Result<(), EngineError>;
    async fn subtasks_for_refresh(&self, table: &QualifiedName) -> Result<Vec<RefreshSubtask>, EngineError>;
    async fn sweep_orphaned_subtasks(
        &self,
        stale_before: DateTime<Utc>,
        retry_max: u32,
    ) -> Result<(), EngineError>;

    /// Number of table-level claims currently held fleet-wide, used to
    /// estimate idle workers for the parallel strategy's idle-worker check
    /// (spec §4.5 expanded note): `total_workers - active_claim_count`.
    async fn active_claim_count(&self) -> Result<u32, EngineError>;
}

/// `tokio-postgres`-backed implementation. A thin wrapper rather than a
/// connection pool — the worker binary holds one client per task group,
/// the same one-connection-per-background-worker model the reference
/// implementation used (a single pgrx `Spi` connection per backend).
pub struct PostgresMetadataStore {
    client: Client,
}

impl PostgresMetadataStore {
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

fn row_table_status(s: &str) -> Result<TableStatus, EngineError> {
    TableStatus::from_str(s)
}

#[async_trait]
impl MetadataStore for PostgresMetadataStore {
    async fn get_table(&self, name: &QualifiedName) -> Result<Option<DynamicTable>, EngineError> {
        let row = self
            .client
            .query_opt(
                "SELECT name, definition, grouping_keys, target_lag, refresh_strategy, \
                 deduplication, cardinality_threshold, allow_parallel, parallel_threshold, \
                 max_parallelism, initialize, status, comment, created_at, updated_at \
                 FROM dynamic_tables WHERE name = $1",
                &[&name.to_string()],
            )
            .await?;
        let Some(row) = row else { return Ok(None) };

        let sources = self.load_sources(name).await?;
        let target_lag: String = row.get("target_lag");
        let refresh_strategy: String = row.get("refresh_strategy");
        let initialize: String = row.get("initialize");
        let status: String = row.get("status");

        Ok(Some(DynamicTable {
            name: name.clone(),
            definition: row.get("definition"),
            grouping_keys: row.get::<_, Vec<String>>("grouping_keys"),
            sources,
            properties: TableProperties {
                target_lag: TargetLag::parse(&target_lag)?,
                refresh_strategy: RefreshStrategyPref::from_str(&refresh_strategy)?,
                deduplication: row.get("deduplication"),
                cardinality_threshold: row.get("cardinality_threshold"),
                allow_parallel: row.get("allow_parallel"),
                parallel_threshold: row.get::<_, i64>("parallel_threshold") as u64,
                max_parallelism: row.get::<_, i32>("max_parallelism") as u32,
                initialize: InitializeMode::from_str(&initialize)?,
                status: row_table_status(&status)?,
                comment: row.get("comment"),
            },
            created_at: row.get("created_at"),
            updated_at: row.get("updated_at"),
        }))
    }

    async fn list_active_tables(&self) -> Result<Vec<DynamicTable>, EngineError> {
        let rows = self
            .client
            .query(
                "SELECT name FROM dynamic_tables WHERE status = 'active'",
                &[],
            )
            .await?;
        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            let name = QualifiedName::parse(&row.get::<_, String>("name"));
            if let Some(t) = self.get_table(&name).await? {
                out.push(t);
            }
        }
        Ok(out)
    }

    async fn create_table(&self, table: &DynamicTable) -> Result<(), EngineError> {
        self.client
            .execute(
                "INSERT INTO dynamic_tables \
                 (name, definition, grouping_keys, target_lag, refresh_strategy, deduplication, \
                  cardinality_threshold, allow_parallel, parallel_threshold, max_parallelism, \
                  initialize, status, comment, created_at, updated_at) \
                 VALUES ($1,$2,$3,$4,$5,$6,$7,$8,$9,$10,$11,$12,$13,$14,$15)",
                &[
                    &table.name.to_string(),
                    &table.definition,
                    &table.grouping_keys,
                    &table.properties.target_lag.as_str(),
                    &table.properties.refresh_strategy.as_str(),
                    &table.properties.deduplication,
                    &table.properties.cardinality_threshold,
                    &table.properties.allow_parallel,
                    &(table.properties.parallel_threshold as i64),
                    &(table.properties.max_parallelism as i32),
                    &table.properties.initialize.as_str(),
                    &table.properties.status.as_str(),
                    &table.properties.comment,
                    &table.created_at,
                    &table.updated_at,
                ],
            )
            .await
            .map_err(|e| {
                if e.to_string().contains("duplicate key") {
                    EngineError::AlreadyExists(table.name.to_string())
                } else {
                    EngineError::from(e)
                }
            })?;

        for source in &table.sources {
            self.client
                .execute(
                    "INSERT INTO source_refs (dynamic_table, source, is_dynamic_table, key_columns) \
                     VALUES ($1,$2,$3,$4)",
                    &[
                        &table.name.to_string(),
                        &source.name.to_string(),
                        &source.is_dynamic_table,
                        &source.key_columns,
                    ],
                )
                .await?;
        }
        Ok(())
    }

    async fn update_properties(
        &self,
        name: &QualifiedName,
        props: &TableProperties,
    ) -> Result<(), EngineError> {
        let n = self
            .client
            .execute(
                "UPDATE dynamic_tables SET target_lag=$2, refresh_strategy=$3, deduplication=$4, \
                 cardinality_threshold=$5, allow_parallel=$6, parallel_threshold=$7, \
                 max_parallelism=$8, initialize=$9, status=$10, comment=$11, updated_at=now() \
                 WHERE name=$1",
                &[
                    &name.to_string(),
                    &props.target_lag.as_str(),
                    &props.refresh_strategy.as_str(),
                    &props.deduplication,
                    &props.cardinality_threshold,
                    &props.allow_parallel,
                    &(props.parallel_threshold as i64),
                    &(props.max_parallelism as i32),
                    &props.initialize.as_str(),
                    &props.status.as_str(),
                    &props.comment,
                ],
            )
            .await?;
        if n == 0 {
            return Err(EngineError::NotFound(name.to_string()));
        }
        Ok(())
    }

    async fn set_status(&self, name: &QualifiedName, status: TableStatus) -> Result<(), EngineError> {
        let n = self
            .client
            .execute(
                "UPDATE dynamic_tables SET status=$2, updated_at=now() WHERE name=$1",
                &[&name.to_string(), &status.as_str()],
            )
            .await?;
        if n == 0 {
            return Err(EngineError::NotFound(name.to_string()));
        }
        Ok(())
    }

    async fn drop_table(&self, name: &QualifiedName) -> Result<(), EngineError> {
        let n = self
            .client
            .execute("DELETE FROM dynamic_tables WHERE name=$1", &[&name.to_string()])
            .await?;
        if n == 0 {
            return Err(EngineError::NotFound(name.to_string()));
        }
        Ok(())
    }

    async fn add_dependency(
        &self,
        downstream: &QualifiedName,
        upstream: &QualifiedName,
    ) -> Result<(), EngineError> {
        self.client
            .execute(
                "INSERT INTO dependencies (downstream, upstream) VALUES ($1,$2) \
                 ON CONFLICT DO NOTHING",
                &[&downstream.to_string(), &upstream.to_string()],
            )
            .await?;
        Ok(())
    }

    async fn load_dependency_graph(&self) -> Result<DependencyGraph, EngineError> {
        let mut g = DependencyGraph::new();
        for row in self.client.query("SELECT name FROM dynamic_tables", &[]).await? {
            g.add_node(QualifiedName::parse(&row.get::<_, String>("name")));
        }
        for row in self
            .client
            .query("SELECT downstream, upstream FROM dependencies", &[])
            .await?
        {
            g.add_edge(
                QualifiedName::parse(&row.get::<_, String>("downstream")),
                QualifiedName::parse(&row.get::<_, String>("upstream")),
            );
        }
        Ok(g)
    }

    async fn get_source_snapshots(
        &self,
        table: &QualifiedName,
    ) -> Result<Vec<SourceSnapshotRow>, EngineError> {
        let rows = self
            .client
            .query(
                "SELECT source, last_snapshot, last_processed_at FROM source_snapshots \
                 WHERE dynamic_table=$1",
                &[&table.to_string()],
            )
            .await?;
        Ok(rows
            .into_iter()
            .map(|r| SourceSnapshotRow {
                source: QualifiedName::parse(&r.get::<_, String>("source")),
                last_snapshot: r.get("last_snapshot"),
                last_processed_at: r.get("last_processed_at"),
            })
            .collect())
    }

    async fn advance_source_snapshots(
        &self,
        table: &QualifiedName,
        pins: &HashMap<QualifiedName, String>,
        now: DateTime<Utc>,
    ) -> Result<(), EngineError> {
        for (source, snapshot_id) in pins {
            self.client
                .execute(
                    "INSERT INTO source_snapshots (dynamic_table, source, last_snapshot, last_processed_at) \
                     VALUES ($1,$2,$3,$4) \
                     ON CONFLICT (dynamic_table, source) \
                     DO UPDATE SET last_snapshot=EXCLUDED.last_snapshot, last_processed_at=EXCLUDED.last_processed_at",
                    &[&table.to_string(), &source.to_string(), snapshot_id, &now],
                )
                .await?;
        }
        Ok(())
    }

    async fn append_history(&self, entry: &RefreshHistoryEntry) -> Result<(), EngineError> {
        // Idempotent by (table, start_time): see spec §3's history/advancement note.
        self.client
            .execute(
                "INSERT INTO refresh_history \
                 (dynamic_table, started_at, completed_at, status, strategy, rows_affected, \
                  duration_ms, error_code, error_message, snapshots_json, trigger) \
                 VALUES ($1,$2,$3,$4,$5,$6,$7,$8,$9,$10,$11) \
                 ON CONFLICT (dynamic_table, started_at) DO NOTHING",
                &[
                    &entry.dynamic_table.to_string(),
                    &entry.started_at,
                    &entry.completed_at,
                    &entry.status.as_str(),
                    &entry.strategy.map(|s| s.as_str()),
                    &entry.rows_affected,
                    &entry.duration_ms,
                    &entry.error_code,
                    &entry.error_message,
                    &entry.snapshots_json,
                    &entry.trigger.as_str(),
                ],
            )
            .await?;
        Ok(())
    }

    async fn recent_history(
        &self,
        table: &QualifiedName,
        limit: i64,
    ) -> Result<Vec<RefreshHistoryEntry>, EngineError> {
        let rows = self
            .client
            .query(
                "SELECT id, dynamic_table, started_at, completed_at, status, strategy, \
                 rows_affected, duration_ms, error_code, error_message, snapshots_json, trigger \
                 FROM refresh_history WHERE dynamic_table=$1 ORDER BY started_at DESC LIMIT $2",
                &[&table.to_string(), &limit],
            )
            .await?;
        rows.into_iter()
            .map(|r| {
                let status: String = r.get("status");
                let strategy: Option<String> = r.get("strategy");
                let trigger: String = r.get("trigger");
                Ok(RefreshHistoryEntry {
                    id: r.get("id"),
                    dynamic_table: QualifiedName::parse(&r.get::<_, String>("dynamic_table")),
                    started_at: r.get("started_at"),
                    completed_at: r.get("completed_at"),
                    status: match status.as_str() {
                        "success" => RefreshOutcome::Success,
                        "failed" => RefreshOutcome::Failed,
                        "skipped" => RefreshOutcome::Skipped,
                        other => {
                            return Err(EngineError::Internal(format!(
                                "unknown history status: {other}"
                            )))
                        }
                    },
                    strategy: strategy.as_deref().map(strategy_from_str).transpose()?,
                    rows_affected: r.get("rows_affected"),
                    duration_ms: r.get("duration_ms"),
                    error_code: r.get("error_code"),
                    error_message: r.get("error_message"),
                    snapshots_json: r.get("snapshots_json"),
                    trigger: match trigger.as_str() {
                        "scheduled" => Trigger::Scheduled,
                        "manual" => Trigger::Manual,
                        other => {
                            return Err(EngineError::Internal(format!("unknown trigger: {other}")))
                        }
                    },
                })
            })
            .collect()
    }

    async fn enqueue_pending(
        &self,
        table: &QualifiedName,
        due_at: DateTime<Utc>,
        priority: i32,
    ) -> Result<(), EngineError> {
        self.client
            .execute(
                "INSERT INTO pending_refreshes (dynamic_table, due_at, priority, enqueued_at) \
                 VALUES ($1,$2,$3,now()) ON CONFLICT (dynamic_table) DO NOTHING",
                &[&table.to_string(), &due_at, &priority],
            )
            .await?;
        Ok(())
    }

    async fn next_due_unclaimed(&self, now: DateTime<Utc>) -> Result<Option<QualifiedName>, EngineError> {
        let row = self
            .client
            .query_opt(
                "SELECT p.dynamic_table FROM pending_refreshes p \
                 LEFT JOIN refresh_claims c ON c.dynamic_table = p.dynamic_table \
                 WHERE p.due_at <= $1 AND c.dynamic_table IS NULL \
                 ORDER BY p.priority ASC, p.enqueued_at ASC LIMIT 1",
                &[&now],
            )
            .await?;
        Ok(row.map(|r| QualifiedName::parse(&r.get::<_, String>("dynamic_table"))))
    }

    async fn try_claim_table(
        &self,
        table: &QualifiedName,
        worker_id: &str,
        timeout: Duration,
        now: DateTime<Utc>,
    ) -> Result<bool, EngineError> {
        let expires_at = now + chrono::Duration::from_std(timeout).unwrap_or_default();
        let n = self
            .client
            .execute(
                "INSERT INTO refresh_claims \
                 (dynamic_table, worker_id, claimed_at, heartbeat_at, expires_at, mode, \
                  subtasks_total, subtasks_completed) \
                 VALUES ($1,$2,$3,$3,$4,'single',0,0) \
                 ON CONFLICT (dynamic_table) DO NOTHING",
                &[&table.to_string(), &worker_id, &now, &expires_at],
            )
            .await?;
        Ok(n == 1)
    }

    async fn heartbeat_claim(
        &self,
        table: &QualifiedName,
        worker_id: &str,
        timeout: Duration,
        now: DateTime<Utc>,
    ) -> Result<bool, EngineError> {
        let expires_at = now + chrono::Duration::from_std(timeout).unwrap_or_default();
        let n = self
            .client
            .execute(
                "UPDATE refresh_claims SET heartbeat_at=$3, expires_at=$4 \
                 WHERE dynamic_table=$1 AND worker_id=$2",
                &[&table.to_string(), &worker_id, &now, &expires_at],
            )
            .await?;
        Ok(n == 1)
    }

    async fn release_claim(&self, table: &QualifiedName, worker_id: &str) -> Result<(), EngineError> {
        self.client
            .execute(
                "DELETE FROM refresh_claims WHERE dynamic_table=$1 AND worker_id=$2",
                &[&table.to_string(), &worker_id],
            )
            .await?;
        self.client
            .execute("DELETE FROM pending_refreshes WHERE dynamic_table=$1", &[&table.to_string()])
            .await?;
        Ok(())
    }

    async fn convert_claim_to_coordinator(
        &self,
        table: &QualifiedName,
        worker_id: &str,
        subtasks_total: i32,
    ) -> Result<(), EngineError> {
        let n = self
            .client
            .execute(
                "UPDATE refresh_claims SET mode='coordinator', subtasks_total=$3 \
                 WHERE dynamic_table=$1 AND worker_id=$2",
                &[&table.to_string(), &worker_id, &subtasks_total],
            )
            .await?;
        if n == 0 {
            return Err(EngineError::ClaimLost(table.to_string()));
        }
        Ok(())
    }

    async fn expire_stale_claims(&self, now: DateTime<Utc>) -> Result<Vec<QualifiedName>, EngineError> {
        let rows = self
            .client
            .query(
                "DELETE FROM refresh_claims WHERE expires_at < $1 RETURNING dynamic_table",
                &[&now],
            )
            .await?;
        Ok(rows
            .into_iter()
            .map(|r| QualifiedName::parse(&r.get::<_, String>("dynamic_table")))
            .collect())
    }

    async fn insert_subtasks(
        &self,
        table: &QualifiedName,
        subtasks: &[NewSubtask],
    ) -> Result<Vec<i64>, EngineError> {
        let mut ids = Vec::with_capacity(subtasks.len());
        for st in subtasks {
            let row = self
                .client
                .query_one(
                    "INSERT INTO refresh_subtasks \
                     (parent_refresh, dynamic_table, kind, partition_spec_json, status, \
                      retry_count, created_at) \
                     VALUES ($1,$1,$2,$3,'pending',0,now()) RETURNING id",
                    &[&table.to_string(), &st.kind.as_str(), &st.partition_spec_json],
                )
                .await?;
            ids.push(row.get("id"));
        }
        Ok(ids)
    }

    async fn claim_next_subtask(
        &self,
        worker_id: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<RefreshSubtask>, EngineError> {
        let row = self
            .client
            .query_opt(
                "UPDATE refresh_subtasks SET status='claimed', claimed_by=$1, claimed_at=$2, \
                 heartbeat_at=$2 \
                 WHERE id = ( \
                     SELECT id FROM refresh_subtasks WHERE status='pending' \
                     ORDER BY id FOR UPDATE SKIP LOCKED LIMIT 1 \
                 ) \
                 RETURNING id, parent_refresh, dynamic_table, kind, partition_spec_json, status, \
                           result_location, claimed_by, retry_count",
                &[&worker_id, &now],
            )
            .await?;
        Ok(row.map(row_to_subtask).transpose()?)
    }

    async fn heartbeat_subtask(&self, id: i64, worker_id: &str, now: DateTime<Utc>) -> Result<bool, EngineError> {
        let n = self
            .client
            .execute(
                "UPDATE refresh_subtasks SET heartbeat_at=$3 WHERE id=$1 AND claimed_by=$2",
                &[&id, &worker_id, &now],
            )
            .await?;
        Ok(n == 1)
    }

    async fn complete_subtask(&self, id: i64, result_location: &str, now: DateTime<Utc>) -> Result<(), EngineError> {
        self.client
            .execute(
                "UPDATE refresh_subtasks SET status='completed', result_location=$2, completed_at=$3 \
                 WHERE id=$1",
                &[&id, &result_location, &now],
            )
            .await?;
        Ok(())
    }

    async fn fail_subtask(&self, id: i64, error_message: &str) -> Result<(), EngineError> {
        self.client
            .execute(
                "UPDATE refresh_subtasks SET status='failed', error_message=$2, \
                 retry_count=retry_count+1 WHERE id=$1",
                &[&id, &error_message],
            )
            .await?;
        Ok(())
    }

    async fn subtasks_for_refresh(&self, table: &QualifiedName) -> Result<Vec<RefreshSubtask>, EngineError> {
        let rows = self
            .client
            .query(
                "SELECT id, parent_refresh, dynamic_table, kind, partition_spec_json, status, \
                 result_location, claimed_by, retry_count \
                 FROM refresh_subtasks WHERE parent_refresh=$1 ORDER BY id",
                &[&table.to_string()],
            )
            .await?;
        rows.into_iter().map(row_to_subtask).collect()
    }

    async fn sweep_orphaned_subtasks(
        &self,
        stale_before: DateTime<Utc>,
        retry_max: u32,
    ) -> Result<(), EngineError> {
        // Cascade: subtasks whose parent refresh has no live claim.
        self.client
            .execute(
                "DELETE FROM refresh_subtasks s \
                 WHERE NOT EXISTS ( \
                     SELECT 1 FROM refresh_claims c WHERE c.dynamic_table = s.parent_refresh \
                 )",
                &[],
            )
            .await?;
        // Claimed subtasks with a stale heartbeat: requeue if budget remains.
        self.client
            .execute(
                "UPDATE refresh_subtasks SET status='pending', claimed_by=NULL, claimed_at=NULL, \
                 retry_count=retry_count+1 \
                 WHERE status='claimed' AND heartbeat_at < $1 AND retry_count < $2",
                &[&stale_before, &(retry_max as i32)],
            )
            .await?;
        self.client
            .execute(
                "UPDATE refresh_subtasks SET status='failed' \
                 WHERE status='claimed' AND heartbeat_at < $1 AND retry_count >= $2",
                &[&stale_before, &(retry_max as i32)],
            )
            .await?;
        Ok(())
    }

    async fn active_claim_count(&self) -> Result<u32, EngineError> {
        let row = self.client.query_one("SELECT count(*) AS n FROM refresh_claims", &[]).await?;
        Ok(row.get::<_, i64>("n") as u32)
    }
}

impl PostgresMetadataStore {
    async fn load_sources(&self, table: &QualifiedName) -> Result<Vec<SourceRef>, EngineError> {
        let rows = self
            .client
            .query(
                "SELECT source, is_dynamic_table, key_columns FROM source_refs WHERE dynamic_table=$1",
                &[&table.to_string()],
            )
            .await?;
        Ok(rows
            .into_iter()
            .map(|r| SourceRef {
                name: QualifiedName::parse(&r.get::<_, String>("source")),
                is_dynamic_table: r.get("is_dynamic_table"),
                key_columns: r.get("key_columns"),
            })
            .collect())
    }
}

fn strategy_from_str(s: &str) -> Result<Strategy, EngineError> {
    match s {
        "bootstrap" => Ok(Strategy::Bootstrap),
        "full" => Ok(Strategy::Full),
        "affected_keys" => Ok(Strategy::AffectedKeys),
        "parallel_affected_keys" => Ok(Strategy::ParallelAffectedKeys),
        "no_op" => Ok(Strategy::NoOp),
        other => Err(EngineError::Internal(format!("unknown strategy: {other}"))),
    }
}

fn row_to_subtask(r: tokio_postgres::Row) -> Result<RefreshSubtask, EngineError> {
    let kind: String = r.get("kind");
    let status: String = r.get("status");
    Ok(RefreshSubtask {
        id: r.get("id"),
        parent_refresh: QualifiedName::parse(&r.get::<_, String>("parent_refresh")),
        dynamic_table: QualifiedName::parse(&r.get::<_, String>("dynamic_table")),
        kind: SubtaskKind::from_str(&kind)?,
        partition_spec_json: r.get("partition_spec_json"),
        status: SubtaskStatus::from_str(&status)?,
        result_location: r.get("result_location"),
        claimed_by: r.get("claimed_by"),
        retry_count: r.get("retry_count"),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strategy_round_trips_through_as_str() {
        for s in [
            Strategy::Bootstrap,
            Strategy::Full,
            Strategy::AffectedKeys,
            Strategy::ParallelAffectedKeys,
            Strategy::NoOp,
        ] {
            assert_eq!(strategy_from_str(s.as_str()).unwrap().as_str(), s.as_str());
        }
        assert!(strategy_from_str("bogus").is_err());
    }
}
