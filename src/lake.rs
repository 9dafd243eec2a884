//! Lake Client: executes data statements, reads current and historical
//! snapshots, invokes the change feed, and manages transactions on the
//! lake (spec §6.2). The real target is a versioned analytical engine
//! with native snapshot travel; `PostgresLake` is a stand-in adapter for
//! this engine's own tests, playing the same role the reference
//! implementation's `cdc.rs` trigger-buffer pattern plays for the
//! extension's in-process change capture — a `<source>_changes` log
//! table per tracked source, generalized here into a trait any lake
//! backend can implement.

use async_trait::async_trait;
use tokio::sync::Mutex;
use tokio_postgres::Client;

use crate::error::EngineError;
use crate::model::QualifiedName;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeKind {
    Insert,
    Delete,
    UpdatePreimage,
    UpdatePostimage,
}

impl ChangeKind {
    fn from_str(s: &str) -> Result<Self, EngineError> {
        match s {
            "insert" => Ok(ChangeKind::Insert),
            "delete" => Ok(ChangeKind::Delete),
            "update_preimage" => Ok(ChangeKind::UpdatePreimage),
            "update_postimage" => Ok(ChangeKind::UpdatePostimage),
            other => Err(EngineError::Internal(format!("unknown change kind: {other}"))),
        }
    }
}

/// One row from a source's change feed, projected to its grouping-key
/// columns only (spec §6.2: "the engine requires at least the
/// grouping-key columns in the result").
#[derive(Debug, Clone)]
pub struct ChangeRow {
    pub kind: ChangeKind,
    pub key_values: Vec<Option<String>>,
}

/// Outcome of a dedup-aware apply (spec §4.3 step 4's dedup branch): the
/// NULL-safe diff may turn out empty, in which case the executor records
/// a `skipped` outcome without touching the lake transaction.
pub enum DedupApply {
    Applied(u64),
    NoChange,
}

/// Capabilities the engine consumes from the lake (spec §6.2). Transaction
/// boundaries live inside each method rather than being exposed to callers,
/// since the protocol steps in §4.3–§4.5 always pair a lake write with a
/// single, specific statement sequence.
#[async_trait]
pub trait LakeClient: Send + Sync {
    async fn current_snapshot(&self, source: &QualifiedName) -> Result<String, EngineError>;

    async fn table_changes(
        &self,
        source: &QualifiedName,
        key_columns: &[String],
        from_snapshot: &str,
        to_snapshot: &str,
    ) -> Result<Vec<ChangeRow>, EngineError>;

    /// TRUNCATE + INSERT from the rendered, pinned definition query, in one
    /// transaction (spec §4.4 full/bootstrap path). Returns rows inserted.
    async fn full_replace(&self, target: &QualifiedName, rendered_select: &str) -> Result<u64, EngineError>;

    /// DELETE by `predicate_sql` then INSERT from `rendered_select`, in one
    /// transaction (spec §4.3 step 4, non-dedup branch).
    async fn delete_and_insert(
        &self,
        target: &QualifiedName,
        predicate_sql: &str,
        rendered_select: &str,
    ) -> Result<u64, EngineError>;

    /// Materialize `rendered_select` into a temporary location, diff it
    /// NULL-safely against `target` restricted to `predicate_sql`, and
    /// write only the differing rows (spec §4.3 step 4, dedup branch).
    async fn diff_and_apply(
        &self,
        target: &QualifiedName,
        predicate_sql: &str,
        rendered_select: &str,
    ) -> Result<DedupApply, EngineError>;

    /// Materialize `rendered_select` into a named result location (a
    /// subtask's slice of the affected-keys set, spec §4.6). Returns rows
    /// written.
    async fn materialize(&self, location: &str, rendered_select: &str) -> Result<u64, EngineError>;

    /// Read back a materialized result table's `columns`, text-encoded.
    /// Used by the executor to pull a translated affected-key set back
    /// into process memory for predicate construction (spec §4.3 step 2).
    async fn read_result(&self, location: &str, columns: &[String]) -> Result<Vec<Vec<Option<String>>>, EngineError>;

    /// Coordinator merge (spec §4.5 step 5): DELETE by `predicate_sql`,
    /// then INSERT-SELECT from each location in order, all in one
    /// transaction.
    async fn merge_from_locations(
        &self,
        target: &QualifiedName,
        predicate_sql: &str,
        locations: &[String],
    ) -> Result<u64, EngineError>;

    async fn drop_result_table(&self, location: &str) -> Result<(), EngineError>;

    /// Current row count of an already-materialized target, used by the
    /// strategy selector's cardinality ratio (spec §4.2 step 4).
    async fn row_count(&self, target: &QualifiedName) -> Result<u64, EngineError>;

    /// Test/bootstrap helper: set up the `_dt_version` column, change-log
    /// table, and a row-level trigger that maintains both on every
    /// INSERT/UPDATE/DELETE against `source`. Not part of spec §6.2's
    /// consumed interface; exists because `PostgresLake` owns the
    /// stand-in storage layout it reads from.
    async fn register_source(&self, source: &QualifiedName, key_columns: &[String]) -> Result<(), EngineError>;
}

/// Strip the rewriter's `AS OF SNAPSHOT '<id>'` pin markers before handing
/// SQL to a plain Postgres server, which has no relation-level time
/// travel. `PostgresLake` is explicitly a stand-in for integration tests —
/// every read observes the current state of its bookkeeping tables, not a
/// true historical snapshot. The coordination logic this exercises
/// (claims, subtasks, scheduling) is unaffected by this simplification;
/// only true point-in-time consistency is not faithfully reproduced.
fn strip_snapshot_pins(sql: &str) -> String {
    const MARKER: &str = "AS OF SNAPSHOT '";
    let mut out = String::with_capacity(sql.len());
    let mut rest = sql;
    while let Some(idx) = rest.find(MARKER) {
        out.push_str(&rest[..idx]);
        let after = &rest[idx + MARKER.len()..];
        match after.find('\'') {
            Some(end) => rest = &after[end + 1..],
            None => {
                rest = after;
                break;
            }
        }
    }
    out.push_str(rest);
    out
}

pub struct PostgresLake {
    // `Client::transaction()` needs `&mut Client`; the trait's methods are
    // `&self` so this can be shared behind an `Arc<dyn LakeClient>` across
    // worker tasks, the same single-connection-per-task-group model as
    // `PostgresMetadataStore`.
    client: Mutex<Client>,
    changes_schema: String,
}

impl PostgresLake {
    pub fn new(client: Client, changes_schema: impl Into<String>) -> Self {
        Self {
            client: Mutex::new(client),
            changes_schema: changes_schema.into(),
        }
    }

    fn changes_table(&self, source: &QualifiedName) -> String {
        format!("{}.changes_{}_{}", self.changes_schema, source.schema, source.name)
    }
}

#[async_trait]
impl LakeClient for PostgresLake {
    async fn current_snapshot(&self, source: &QualifiedName) -> Result<String, EngineError> {
        let client = self.client.lock().await;
        let row = client
            .query_opt(
                "SELECT current_version FROM lake_versions WHERE source = $1",
                &[&source.to_string()],
            )
            .await?;
        let version: i64 = row.map(|r| r.get("current_version")).unwrap_or(0);
        Ok(version.to_string())
    }

    async fn table_changes(
        &self,
        source: &QualifiedName,
        key_columns: &[String],
        from_snapshot: &str,
        to_snapshot: &str,
    ) -> Result<Vec<ChangeRow>, EngineError> {
        let from: i64 = from_snapshot.parse().unwrap_or(0);
        let to: i64 = to_snapshot
            .parse()
            .map_err(|_| EngineError::Internal(format!("invalid snapshot id: {to_snapshot}")))?;
        let cols: Vec<String> = key_columns.iter().map(|c| format!("\"{c}\"")).collect();
        let sql = format!(
            "SELECT change_kind, {} FROM {} WHERE _dt_version > $1 AND _dt_version <= $2",
            cols.join(", "),
            self.changes_table(source)
        );
        let client = self.client.lock().await;
        let rows = client.query(&sql, &[&from, &to]).await?;
        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            let kind: String = row.get("change_kind");
            let mut key_values = Vec::with_capacity(key_columns.len());
            for (i, _) in key_columns.iter().enumerate() {
                key_values.push(row.get::<_, Option<String>>(i + 1));
            }
            out.push(ChangeRow {
                kind: ChangeKind::from_str(&kind)?,
                key_values,
            });
        }
        Ok(out)
    }

    async fn full_replace(&self, target: &QualifiedName, rendered_select: &str) -> Result<u64, EngineError> {
        let select = strip_snapshot_pins(rendered_select);
        let mut client = self.client.lock().await;
        let mut txn = client.transaction().await?;
        let result = async {
            txn.execute(&format!("TRUNCATE TABLE {target}"), &[]).await?;
            let n = txn
                .execute(&format!("INSERT INTO {target} {select}"), &[])
                .await?;
            Ok::<u64, tokio_postgres::Error>(n)
        }
        .await;
        match result {
            Ok(n) => {
                txn.commit().await?;
                Ok(n)
            }
            Err(e) => {
                let _ = txn.rollback().await;
                Err(EngineError::from(e))
            }
        }
    }

    async fn delete_and_insert(
        &self,
        target: &QualifiedName,
        predicate_sql: &str,
        rendered_select: &str,
    ) -> Result<u64, EngineError> {
        let select = strip_snapshot_pins(rendered_select);
        let mut client = self.client.lock().await;
        let mut txn = client.transaction().await?;
        let result = async {
            txn.execute(&format!("DELETE FROM {target} WHERE {predicate_sql}"), &[])
                .await?;
            let n = txn
                .execute(&format!("INSERT INTO {target} {select}"), &[])
                .await?;
            Ok::<u64, tokio_postgres::Error>(n)
        }
        .await;
        match result {
            Ok(n) => {
                txn.commit().await?;
                Ok(n)
            }
            Err(e) => {
                let _ = txn.rollback().await;
                Err(EngineError::from(e))
            }
        }
    }

    async fn diff_and_apply(
        &self,
        target: &QualifiedName,
        predicate_sql: &str,
        rendered_select: &str,
    ) -> Result<DedupApply, EngineError> {
        let select = strip_snapshot_pins(rendered_select);
        let staging = format!("dt_stage_{}_{}", target.schema, target.name);
        let mut client = self.client.lock().await;
        let mut txn = client.transaction().await?;
        let result = async {
            txn.execute(
                &format!("CREATE TEMP TABLE {staging} ON COMMIT DROP AS {select}"),
                &[],
            )
            .await?;
            // NULL-safe row-wise diff: rows in staging not already present
            // (by every column, via IS NOT DISTINCT FROM) restricted to the
            // target's affected-key slice.
            let diff_count: i64 = txn
                .query_one(
                    &format!(
                        "SELECT count(*) AS n FROM {staging} s \
                         WHERE NOT EXISTS ( \
                             SELECT 1 FROM {target} t WHERE {predicate_sql} \
                             AND t IS NOT DISTINCT FROM s \
                         )"
                    ),
                    &[],
                )
                .await?
                .get("n");
            if diff_count == 0 {
                return Ok::<Option<u64>, tokio_postgres::Error>(None);
            }
            txn.execute(&format!("DELETE FROM {target} WHERE {predicate_sql}"), &[])
                .await?;
            let n = txn
                .execute(&format!("INSERT INTO {target} SELECT * FROM {staging}"), &[])
                .await?;
            Ok(Some(n))
        }
        .await;
        match result {
            Ok(Some(n)) => {
                txn.commit().await?;
                Ok(DedupApply::Applied(n))
            }
            Ok(None) => {
                txn.rollback().await?;
                Ok(DedupApply::NoChange)
            }
            Err(e) => {
                let _ = txn.rollback().await;
                Err(EngineError::from(e))
            }
        }
    }

    async fn materialize(&self, location: &str, rendered_select: &str) -> Result<u64, EngineError> {
        let select = strip_snapshot_pins(rendered_select);
        let client = self.client.lock().await;
        client
            .execute(&format!("CREATE TABLE {location} AS {select}"), &[])
            .await
            .map_err(EngineError::from)
    }

    async fn read_result(&self, location: &str, columns: &[String]) -> Result<Vec<Vec<Option<String>>>, EngineError> {
        let cols: Vec<String> = columns.iter().map(|c| format!("\"{c}\"::text")).collect();
        let client = self.client.lock().await;
        let rows = client
            .query(&format!("SELECT {} FROM {location}", cols.join(", ")), &[])
            .await?;
        Ok(rows
            .into_iter()
            .map(|row| (0..columns.len()).map(|i| row.get::<_, Option<String>>(i)).collect())
            .collect())
    }

    async fn merge_from_locations(
        &self,
        target: &QualifiedName,
        predicate_sql: &str,
        locations: &[String],
    ) -> Result<u64, EngineError> {
        let mut client = self.client.lock().await;
        let mut txn = client.transaction().await?;
        let result = async {
            txn.execute(&format!("DELETE FROM {target} WHERE {predicate_sql}"), &[])
                .await?;
            let mut total = 0u64;
            for loc in locations {
                total += txn
                    .execute(&format!("INSERT INTO {target} SELECT * FROM {loc}"), &[])
                    .await?;
            }
            Ok::<u64, tokio_postgres::Error>(total)
        }
        .await;
        match result {
            Ok(n) => {
                txn.commit().await?;
                Ok(n)
            }
            Err(e) => {
                let _ = txn.rollback().await;
                Err(EngineError::from(e))
            }
        }
    }

    async fn drop_result_table(&self, location: &str) -> Result<(), EngineError> {
        let client = self.client.lock().await;
        client
            .execute(&format!("DROP TABLE IF EXISTS {location}"), &[])
            .await?;
        Ok(())
    }

    async fn row_count(&self, target: &QualifiedName) -> Result<u64, EngineError> {
        let client = self.client.lock().await;
        let row = client.query_one(&format!("SELECT count(*) AS n FROM {target}"), &[]).await?;
        Ok(row.get::<_, i64>("n") as u64)
    }

    async fn register_source(&self, source: &QualifiedName, key_columns: &[String]) -> Result<(), EngineError> {
        let changes = self.changes_table(source);
        let key_cols_decl: String = key_columns.iter().map(|c| format!(", \"{c}\" TEXT")).collect();
        let key_cols_list: String = key_columns.iter().map(|c| format!(", \"{c}\"")).collect();
        let new_key_vals: String = key_columns.iter().map(|c| format!(", NEW.\"{c}\"::text")).collect();
        let old_key_vals: String = key_columns.iter().map(|c| format!(", OLD.\"{c}\"::text")).collect();
        let fn_name = format!("{}.bump_{}_{}", self.changes_schema, source.schema, source.name);
        let trigger_name = format!("dt_engine_cdc_{}_{}", source.schema, source.name);
        let source_key = source.to_string();
        let schema = &self.changes_schema;

        let client = self.client.lock().await;
        client
            .batch_execute(&format!(
                "CREATE SCHEMA IF NOT EXISTS {schema};\n\
                 CREATE TABLE IF NOT EXISTS {changes} (change_kind TEXT NOT NULL, _dt_version BIGINT NOT NULL{key_cols_decl});\n\
                 ALTER TABLE {source} ADD COLUMN IF NOT EXISTS _dt_version BIGINT NOT NULL DEFAULT 0;\n\
                 INSERT INTO lake_versions (source, current_version) VALUES ('{source_key}', 0) ON CONFLICT DO NOTHING;\n\
                 CREATE OR REPLACE FUNCTION {fn_name}() RETURNS trigger LANGUAGE plpgsql AS $dtcdc$\n\
                 DECLARE\n\
                   v BIGINT;\n\
                 BEGIN\n\
                   UPDATE lake_versions SET current_version = current_version + 1\n\
                     WHERE source = '{source_key}' RETURNING current_version INTO v;\n\
                   IF TG_OP = 'INSERT' THEN\n\
                     NEW._dt_version := v;\n\
                     INSERT INTO {changes} (change_kind, _dt_version{key_cols_list}) VALUES ('insert', v{new_key_vals});\n\
                     RETURN NEW;\n\
                   ELSIF TG_OP = 'UPDATE' THEN\n\
                     NEW._dt_version := v;\n\
                     INSERT INTO {changes} (change_kind, _dt_version{key_cols_list}) VALUES ('update_preimage', v{old_key_vals});\n\
                     INSERT INTO {changes} (change_kind, _dt_version{key_cols_list}) VALUES ('update_postimage', v{new_key_vals});\n\
                     RETURN NEW;\n\
                   ELSIF TG_OP = 'DELETE' THEN\n\
                     INSERT INTO {changes} (change_kind, _dt_version{key_cols_list}) VALUES ('delete', v{old_key_vals});\n\
                     RETURN OLD;\n\
                   END IF;\n\
                   RETURN NULL;\n\
                 END;\n\
                 $dtcdc$;\n\
                 DROP TRIGGER IF EXISTS {trigger_name} ON {source};\n\
                 CREATE TRIGGER {trigger_name}\n\
                   BEFORE INSERT OR UPDATE OR DELETE ON {source}\n\
                   FOR EACH ROW EXECUTE FUNCTION {fn_name}();\n"
            ))
            .await?;
        Ok(())
    }
}
