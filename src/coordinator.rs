//! Coordinator — runs the parallel affected-keys strategy for one table
//! (spec §4.5). Converts its own table-level claim to coordinator mode,
//! fans the affected-key set out into subtasks, waits for them, and merges
//! their results back in a deterministic order. Grounded on the reference
//! implementation's `src/scheduler.rs` `execute_scheduled_refresh`, which
//! runs a single refresh end-to-end the way this type runs a fan-out one.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tracing::info;

use crate::error::EngineError;
use crate::executor::{build_in_predicate, RefreshExecutor};
use crate::lake::LakeClient;
use crate::metadata::MetadataStore;
use crate::model::{DynamicTable, QualifiedName, RefreshOutcome, SubtaskKind, SubtaskStatus, Trigger};
use crate::rewrite;
use crate::strategy;
use crate::subtask;

pub struct Coordinator {
    metadata: Arc<dyn MetadataStore>,
    lake: Arc<dyn LakeClient>,
    executor: Arc<RefreshExecutor>,
    poll_interval: Duration,
    wait_timeout: Duration,
}

impl Coordinator {
    pub fn new(
        metadata: Arc<dyn MetadataStore>,
        lake: Arc<dyn LakeClient>,
        executor: Arc<RefreshExecutor>,
        poll_interval: Duration,
        wait_timeout: Duration,
    ) -> Self {
        Self {
            metadata,
            lake,
            executor,
            poll_interval,
            wait_timeout,
        }
    }

    /// Run the full parallel-affected-keys protocol for `table`, whose
    /// table-level claim `worker_id` already holds in `single` mode. Records
    /// a `refresh_history` row regardless of outcome.
    pub async fn run(&self, table: &DynamicTable, worker_id: &str, trigger: Trigger) -> Result<u64, EngineError> {
        let started = Utc::now();
        match self.run_inner(table, worker_id).await {
            Ok((rows, pins)) => {
                self.executor
                    .record_parallel_history(table, RefreshOutcome::Success, rows, started, &pins, trigger, None)
                    .await?;
                Ok(rows)
            }
            Err(e) => {
                self.executor
                    .record_parallel_history(
                        table,
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

    async fn run_inner(
        &self,
        table: &DynamicTable,
        worker_id: &str,
    ) -> Result<(u64, HashMap<QualifiedName, String>), EngineError> {
        // Step 2: compute the affected-key set at freshly captured pins.
        let (affected, pins) = self.executor.affected_keys_for_parallel(table).await?;
        if affected.is_empty() {
            self.metadata
                .advance_source_snapshots(&table.name, &pins, Utc::now())
                .await?;
            return Ok((0, pins));
        }

        // Step 1: convert the table-level claim to coordinator mode.
        let subtask_total = strategy::subtask_count(table, affected.len() as u64);
        self.metadata
            .convert_claim_to_coordinator(&table.name, worker_id, subtask_total as i32)
            .await?;

        // Pin the definition once; every subtask restricts the same pinned
        // query to its own key slice (spec §4.5 step 1's "pins captured
        // before any subtask starts").
        let query = rewrite::parse(&table.definition)?;
        rewrite::check_unsupported(&query, "parallel_affected_keys")?;
        let pinned_sql = rewrite::render(&rewrite::pin_snapshots(query, &pins));

        // Step 3: fan out.
        let new_subtasks = subtask::partition(
            &table.grouping_keys,
            &pinned_sql,
            &affected,
            subtask_total,
            SubtaskKind::HashRange,
        );
        let ids = self.metadata.insert_subtasks(&table.name, &new_subtasks).await?;
        info!(table = %table.name, subtasks = ids.len(), "parallel refresh fanned out");

        // Step 4: wait for every subtask to complete or fail.
        let locations = self.wait_for_subtasks(table, &ids).await?;

        // Step 5: merge in ascending subtask id order (deterministic).
        let predicate = build_in_predicate(&table.grouping_keys, &affected);
        let rows = self.lake.merge_from_locations(&table.name, &predicate, &locations).await?;
        for location in &locations {
            let _ = self.lake.drop_result_table(location).await;
        }

        // Step 6/7: advance snapshots, let the caller release the claim.
        self.metadata
            .advance_source_snapshots(&table.name, &pins, Utc::now())
            .await?;
        Ok((rows, pins))
    }

    async fn wait_for_subtasks(&self, table: &DynamicTable, ids: &[i64]) -> Result<Vec<String>, EngineError> {
        let deadline = tokio::time::Instant::now() + self.wait_timeout;
        loop {
            let current = self.metadata.subtasks_for_refresh(&table.name).await?;
            let relevant: Vec<_> = current.into_iter().filter(|s| ids.contains(&s.id)).collect();

            if let Some(failed) = relevant.iter().find(|s| s.status == SubtaskStatus::Failed) {
                return Err(EngineError::SubtaskTimeout(format!(
                    "subtask {} for {} exhausted its retries",
                    failed.id, table.name
                )));
            }
            if relevant.len() == ids.len() && relevant.iter().all(|s| s.status == SubtaskStatus::Completed) {
                let mut completed = relevant;
                completed.sort_by_key(|s| s.id);
                return Ok(completed.into_iter().filter_map(|s| s.result_location).collect());
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(EngineError::CoordinatorDeadline(table.name.to_string()));
            }
            tokio::time::sleep(self.poll_interval).await;
        }
    }
}
