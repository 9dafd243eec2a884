//! Refresh Executor — runs one refresh attempt for one dynamic table,
//! single worker (spec §4.3 affected-keys steps, §4.4 full/bootstrap
//! paths). Grounded on the reference implementation's `src/refresh.rs`,
//! which drives the same pin -> rewrite -> apply -> advance sequence
//! against Postgres's own MVCC snapshots rather than this engine's lake
//! trait. The parallel affected-keys strategy is not executed here; it
//! is the coordinator's job (spec §4.5), which uses this executor only
//! for its subtasks' underlying statements via `lake`, not via this type.

use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tracing::debug;

use crate::error::{EngineError, RetryPolicy, RetryState};
use crate::lake::{ChangeRow, DedupApply, LakeClient};
use crate::metadata::{MetadataStore, RefreshHistoryEntry};
use crate::model::{DynamicTable, QualifiedName, RefreshOutcome, SourceRef, Strategy, Trigger};
use crate::rewrite::ast::{Distinct, SetExpr};
use crate::rewrite::tokenizer::Token;
use crate::rewrite::{self, Query};

pub struct ExecutionResult {
    pub strategy: Strategy,
    pub outcome: RefreshOutcome,
    pub rows_affected: u64,
}

struct RunOutcome {
    rows: u64,
    outcome: RefreshOutcome,
    pins: HashMap<QualifiedName, String>,
}

pub struct RefreshExecutor {
    metadata: Arc<dyn MetadataStore>,
    lake: Arc<dyn LakeClient>,
    retry_policy: RetryPolicy,
}

impl RefreshExecutor {
    pub fn new(metadata: Arc<dyn MetadataStore>, lake: Arc<dyn LakeClient>) -> Self {
        Self {
            metadata,
            lake,
            retry_policy: RetryPolicy::default(),
        }
    }

    /// Run `strategy` (already decided by the strategy selector) and record
    /// the attempt to `refresh_history` regardless of outcome.
    pub async fn execute(
        &self,
        table: &DynamicTable,
        strategy: Strategy,
        trigger: Trigger,
    ) -> Result<ExecutionResult, EngineError> {
        let started = Utc::now();
        let attempt = match strategy {
            Strategy::Bootstrap | Strategy::Full => self.run_full(table, strategy).await,
            Strategy::AffectedKeys => self.run_affected_keys(table).await,
            Strategy::ParallelAffectedKeys => Err(EngineError::Internal(
                "parallel_affected_keys must be run through the coordinator".to_string(),
            )),
            Strategy::NoOp => Ok(RunOutcome {
                rows: 0,
                outcome: RefreshOutcome::Skipped,
                pins: HashMap::new(),
            }),
        };

        match attempt {
            Ok(run) => {
                self.record_history(table, strategy, run.outcome, run.rows, started, &run.pins, trigger, None)
                    .await?;
                Ok(ExecutionResult {
                    strategy,
                    outcome: run.outcome,
                    rows_affected: run.rows,
                })
            }
            Err(e) => {
                self.record_history(
                    table,
                    strategy,
                    RefreshOutcome::Failed,
                    0,
                    started,
                    &HashMap::new(),
                    trigger,
                    Some((e.code().to_string(), e.to_string())),
                )
                .await?;
                Err(e)
            }
        }
    }

    /// Snapshot every base source at its current version before the
    /// definition ever runs (spec §4.3 step 1 / §4.4's pin-before-query
    /// ordering for bootstrap and full refreshes).
    async fn capture_pins(&self, table: &DynamicTable) -> Result<HashMap<QualifiedName, String>, EngineError> {
        let mut pins = HashMap::new();
        for source in table.base_sources() {
            let snap = self
                .with_retry(|| self.lake.current_snapshot(&source.name))
                .await?;
            pins.insert(source.name.clone(), snap);
        }
        Ok(pins)
    }

    async fn run_full(&self, table: &DynamicTable, strategy: Strategy) -> Result<RunOutcome, EngineError> {
        let pins = self.capture_pins(table).await?;
        let query = rewrite::parse(&table.definition)?;
        rewrite::check_unsupported(&query, strategy.as_str())?;
        let pinned = rewrite::pin_snapshots(query, &pins);
        let sql = rewrite::render(&pinned);
        let rows = self
            .with_retry(|| self.lake.full_replace(&table.name, &sql))
            .await?;
        self.metadata.advance_source_snapshots(&table.name, &pins, Utc::now()).await?;
        Ok(RunOutcome {
            rows,
            outcome: RefreshOutcome::Success,
            pins,
        })
    }

    /// Affected-keys refresh, single worker (spec §4.3 steps 1-5).
    async fn run_affected_keys(&self, table: &DynamicTable) -> Result<RunOutcome, EngineError> {
        let stored = self.metadata.get_source_snapshots(&table.name).await?;
        let stored_map: HashMap<QualifiedName, String> =
            stored.into_iter().map(|r| (r.source, r.last_snapshot)).collect();
        let current_pins = self.capture_pins(table).await?;

        let affected = self.collect_affected_keys(table, &stored_map, &current_pins).await?;
        if affected.is_empty() {
            self.metadata
                .advance_source_snapshots(&table.name, &current_pins, Utc::now())
                .await?;
            return Ok(RunOutcome {
                rows: 0,
                outcome: RefreshOutcome::Skipped,
                pins: current_pins,
            });
        }

        let predicate = build_in_predicate(&table.grouping_keys, &affected);
        let query = rewrite::parse(&table.definition)?;
        rewrite::check_unsupported(&query, "affected_keys")?;
        let pinned = rewrite::pin_snapshots(query, &current_pins);
        let restricted = rewrite::add_predicate(pinned, &predicate)?;
        let sql = rewrite::render(&restricted);

        let rows = if table.properties.deduplication {
            match self
                .with_retry(|| self.lake.diff_and_apply(&table.name, &predicate, &sql))
                .await?
            {
                DedupApply::Applied(n) => n,
                DedupApply::NoChange => 0,
            }
        } else {
            self.with_retry(|| self.lake.delete_and_insert(&table.name, &predicate, &sql))
                .await?
        };

        self.metadata
            .advance_source_snapshots(&table.name, &current_pins, Utc::now())
            .await?;
        Ok(RunOutcome {
            rows,
            outcome: RefreshOutcome::Success,
            pins: current_pins,
        })
    }

    /// Public entry point for the coordinator's parallel path (spec §4.5
    /// step 2): fetch stored and current snapshots and compute the union of
    /// affected grouping-key tuples, without applying anything. The caller
    /// is responsible for partitioning the result across subtasks.
    pub async fn affected_keys_for_parallel(
        &self,
        table: &DynamicTable,
    ) -> Result<(HashSet<Vec<Option<String>>>, HashMap<QualifiedName, String>), EngineError> {
        let stored = self.metadata.get_source_snapshots(&table.name).await?;
        let stored_map: HashMap<QualifiedName, String> =
            stored.into_iter().map(|r| (r.source, r.last_snapshot)).collect();
        let current_pins = self.capture_pins(table).await?;
        let affected = self.collect_affected_keys(table, &stored_map, &current_pins).await?;
        Ok((affected, current_pins))
    }

    /// Record a `refresh_history` row for a coordinator-driven parallel
    /// refresh, whose statement sequence the coordinator itself runs
    /// against the lake (spec §4.5 step 5 onward).
    pub async fn record_parallel_history(
        &self,
        table: &DynamicTable,
        outcome: RefreshOutcome,
        rows: u64,
        started: chrono::DateTime<Utc>,
        pins: &HashMap<QualifiedName, String>,
        trigger: Trigger,
        error: Option<(String, String)>,
    ) -> Result<(), EngineError> {
        self.record_history(table, Strategy::ParallelAffectedKeys, outcome, rows, started, pins, trigger, error)
            .await
    }

    /// Step 2 of §4.3: union the affected grouping-key tuples contributed by
    /// every source whose snapshot moved. A source whose own key columns
    /// equal the target's grouping keys contributes its changed keys
    /// directly; otherwise its changed rows are translated into
    /// grouping-key terms by re-deriving the definition restricted to those
    /// rows at the current pins (spec §4.3 step 2's "joining against the
    /// other source(s) at their pinned snapshots").
    async fn collect_affected_keys(
        &self,
        table: &DynamicTable,
        stored: &HashMap<QualifiedName, String>,
        current: &HashMap<QualifiedName, String>,
    ) -> Result<HashSet<Vec<Option<String>>>, EngineError> {
        let mut affected = HashSet::new();
        for source in table.base_sources() {
            let to = match current.get(&source.name) {
                Some(v) => v,
                None => continue,
            };
            let from = stored.get(&source.name).cloned().unwrap_or_else(|| "0".to_string());
            if &from == to {
                continue;
            }

            let changes = self
                .with_retry(|| self.lake.table_changes(&source.name, &source.key_columns, &from, to))
                .await?;
            if changes.is_empty() {
                continue;
            }

            if key_sets_match(&source.key_columns, &table.grouping_keys) {
                for row in changes {
                    affected.insert(row.key_values);
                }
            } else {
                let translated = self.translate_keys(table, source, &changes, current).await?;
                affected.extend(translated);
            }
        }
        Ok(affected)
    }

    /// Translate `source`'s own changed-key tuples into the target's
    /// grouping-key terms: re-run the definition's FROM clause, pinned at
    /// `current`, projected down to `DISTINCT` grouping keys and restricted
    /// to the changed rows of `source`. Assumes the grouping keys are
    /// reachable from `source` via the definition's own joins at a single
    /// hop; deeper multi-hop key translation is out of scope (see design
    /// notes).
    async fn translate_keys(
        &self,
        table: &DynamicTable,
        source: &SourceRef,
        changes: &[ChangeRow],
        current: &HashMap<QualifiedName, String>,
    ) -> Result<HashSet<Vec<Option<String>>>, EngineError> {
        let changed_keys: HashSet<Vec<Option<String>>> =
            changes.iter().map(|c| c.key_values.clone()).collect();
        let predicate = build_in_predicate(&source.key_columns, &changed_keys);

        let query = rewrite::parse(&table.definition)?;
        let pinned = rewrite::pin_snapshots(query, current);
        let extraction = build_extraction_query(pinned, &table.grouping_keys)?;
        let restricted = rewrite::add_predicate(extraction, &predicate)?;
        let sql = rewrite::render(&restricted);

        let location = format!(
            "dt_xlate_{}_{}_{}",
            table.name.schema, table.name.name, source.name.name
        );
        self.with_retry(|| self.lake.materialize(&location, &sql)).await?;
        let rows = self
            .with_retry(|| self.lake.read_result(&location, &table.grouping_keys))
            .await;
        // Always attempt cleanup, even if the read failed.
        let _ = self.lake.drop_result_table(&location).await;
        Ok(rows?.into_iter().collect())
    }

    async fn record_history(
        &self,
        table: &DynamicTable,
        strategy: Strategy,
        outcome: RefreshOutcome,
        rows: u64,
        started: chrono::DateTime<Utc>,
        pins: &HashMap<QualifiedName, String>,
        trigger: Trigger,
        error: Option<(String, String)>,
    ) -> Result<(), EngineError> {
        let completed = Utc::now();
        let duration_ms = (completed - started).num_milliseconds().max(0);
        let snapshots: HashMap<String, String> =
            pins.iter().map(|(k, v)| (k.to_string(), v.clone())).collect();
        let snapshots_json = serde_json::to_value(snapshots).unwrap_or(serde_json::Value::Null);
        let (error_code, error_message) = match error {
            Some((code, message)) => (Some(code), Some(message)),
            None => (None, None),
        };
        debug!(table = %table.name, ?strategy, ?outcome, rows, "recording refresh attempt");
        self.metadata
            .append_history(&RefreshHistoryEntry {
                id: 0,
                dynamic_table: table.name.clone(),
                started_at: started,
                completed_at: Some(completed),
                status: outcome,
                strategy: Some(strategy),
                rows_affected: rows as i64,
                duration_ms,
                error_code,
                error_message,
                snapshots_json,
                trigger,
            })
            .await
    }

    /// Retry a transient lake operation with the engine's default backoff
    /// (spec §5). `f` is called again from scratch on each retryable
    /// failure, since lake operations here are idempotent re-reads or
    /// whole-transaction writes.
    async fn with_retry<F, Fut, T>(&self, mut f: F) -> Result<T, EngineError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, EngineError>>,
    {
        let mut state = RetryState::new();
        loop {
            match f().await {
                Ok(v) => return Ok(v),
                Err(e) if e.is_retryable() && state.record_failure(&self.retry_policy) => {
                    let delay = self.retry_policy.backoff_ms(state.attempts - 1);
                    tokio::time::sleep(Duration::from_millis(delay)).await;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

fn key_sets_match(source_keys: &[String], grouping_keys: &[String]) -> bool {
    let a: HashSet<&String> = source_keys.iter().collect();
    let b: HashSet<&String> = grouping_keys.iter().collect();
    a == b
}

/// Rewrite a pinned definition query into `SELECT DISTINCT <grouping keys>
/// FROM ...` over the same source list, dropping projection/group-by/order
/// clauses that no longer apply once the projection is replaced.
fn build_extraction_query(mut query: Query, grouping_keys: &[String]) -> Result<Query, EngineError> {
    match &mut query.body {
        SetExpr::Select(sel) => {
            sel.distinct = Distinct::All;
            sel.projection = grouping_keys
                .iter()
                .map(|k| vec![Token::Word(k.clone())])
                .collect();
            sel.group_by = None;
            sel.having = None;
            sel.tail = Vec::new();
            Ok(query)
        }
        SetExpr::SetOp { .. } => Err(EngineError::UnsupportedConstruct {
            strategy: "affected_keys".to_string(),
            detail: "set operations cannot be used for affected-key translation".to_string(),
        }),
    }
}

fn sql_literal(value: &Option<String>) -> String {
    match value {
        Some(s) => format!("'{}'", s.replace('\'', "''")),
        None => "NULL".to_string(),
    }
}

/// Build a `col IN (...)` (or tuple-`IN` for composite keys) predicate
/// restricting rows to the given key tuples.
pub(crate) fn build_in_predicate(columns: &[String], keys: &HashSet<Vec<Option<String>>>) -> String {
    if columns.len() == 1 {
        let values: Vec<String> = keys.iter().map(|k| sql_literal(&k[0])).collect();
        format!("\"{}\" IN ({})", columns[0], values.join(", "))
    } else {
        let cols: Vec<String> = columns.iter().map(|c| format!("\"{c}\"")).collect();
        let tuples: Vec<String> = keys
            .iter()
            .map(|k| format!("({})", k.iter().map(sql_literal).collect::<Vec<_>>().join(", ")))
            .collect();
        format!("({}) IN ({})", cols.join(", "), tuples.join(", "))
    }
}
