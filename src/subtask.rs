//! Subtask Worker — claims and executes one slice of a parallel
//! affected-keys refresh (spec §4.6). Grounded on the reference
//! implementation's `src/scheduler.rs` worker-loop shape (claim, run,
//! record), generalized from a single whole-table refresh to one
//! partition of one.
//!
//! A subtask carries everything it needs to run without consulting the
//! catalog again: the coordinator pins and renders the definition once
//! (spec §4.5 step 1, pins captured before any subtask starts) and stores
//! that rendered, pinned SQL alongside its slice of the affected-key set in
//! `partition_spec_json`. `kind` records which split algorithm produced the
//! slice (hash-range, modulo, or plain partition); all three serialize to
//! the same shape since the coordinator already holds the full key set in
//! memory and only needs to divide it, not re-derive it per subtask.

use std::collections::HashSet;
use std::sync::Arc;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::error::EngineError;
use crate::executor::build_in_predicate;
use crate::lake::LakeClient;
use crate::metadata::{MetadataStore, NewSubtask, RefreshSubtask};
use crate::model::SubtaskKind;
use crate::rewrite;

/// The JSON shape stored in `refresh_subtasks.partition_spec_json`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PartitionSpec {
    pub columns: Vec<String>,
    pub keys: Vec<Vec<Option<String>>>,
    /// The definition query, already pinned to the snapshots the
    /// coordinator captured for this refresh, not yet restricted to any
    /// key set.
    pub pinned_sql: String,
}

/// Split `affected` into `num_subtasks` roughly-equal [`NewSubtask`]s using
/// `kind`'s algorithm to assign each key tuple to a partition (spec §4.5
/// step 2 / §4.6).
pub fn partition(
    columns: &[String],
    pinned_sql: &str,
    affected: &HashSet<Vec<Option<String>>>,
    num_subtasks: u32,
    kind: SubtaskKind,
) -> Vec<NewSubtask> {
    let num_subtasks = num_subtasks.max(1);
    let mut buckets: Vec<Vec<Vec<Option<String>>>> = vec![Vec::new(); num_subtasks as usize];

    match kind {
        SubtaskKind::HashRange => {
            for key in affected {
                let parts: Vec<Option<&str>> = key.iter().map(|v| v.as_deref()).collect();
                let hash = crate::hash::hash_key_parts(&parts);
                let bucket = crate::hash::bucket_of(hash, num_subtasks);
                buckets[bucket as usize].push(key.clone());
            }
        }
        SubtaskKind::Modulo => {
            // `key mod n = i` (spec's literal-modulo predicate, distinct
            // from hash_range's `hash(key) mod n = i`): the leading key
            // column is the partitioning value. Non-integer keys have no
            // literal modulus; they fall into bucket 0 rather than being
            // hashed, since hashing them here would collapse back into
            // hash_range's predicate.
            for key in affected {
                let value: i64 = key
                    .first()
                    .and_then(|v| v.as_deref())
                    .and_then(|s| s.parse::<i64>().ok())
                    .unwrap_or(0);
                let bucket = value.rem_euclid(num_subtasks as i64) as u32;
                buckets[bucket as usize].push(key.clone());
            }
        }
        SubtaskKind::Partition => {
            // Plain contiguous slicing over a deterministic (sorted) order.
            let mut sorted: Vec<_> = affected.iter().cloned().collect();
            sorted.sort();
            for (i, key) in sorted.into_iter().enumerate() {
                buckets[i % num_subtasks as usize].push(key);
            }
        }
    }

    buckets
        .into_iter()
        .filter(|b| !b.is_empty())
        .map(|keys| NewSubtask {
            kind,
            partition_spec_json: serde_json::to_value(PartitionSpec {
                columns: columns.to_vec(),
                keys,
                pinned_sql: pinned_sql.to_string(),
            })
            .unwrap_or(serde_json::Value::Null),
        })
        .collect()
}

/// Runs subtasks to completion: claim, materialize its slice of the pinned
/// definition restricted to its key set, record the result.
pub struct SubtaskWorker {
    metadata: Arc<dyn MetadataStore>,
    lake: Arc<dyn LakeClient>,
    worker_id: String,
}

impl SubtaskWorker {
    pub fn new(metadata: Arc<dyn MetadataStore>, lake: Arc<dyn LakeClient>, worker_id: impl Into<String>) -> Self {
        Self {
            metadata,
            lake,
            worker_id: worker_id.into(),
        }
    }

    /// Claim and run the next pending subtask, if any. Returns `false` when
    /// there was nothing to claim, so the caller's poll loop can back off.
    pub async fn run_one(&self) -> Result<bool, EngineError> {
        let Some(subtask) = self.metadata.claim_next_subtask(&self.worker_id, Utc::now()).await? else {
            return Ok(false);
        };
        self.execute(&subtask).await?;
        Ok(true)
    }

    async fn execute(&self, subtask: &RefreshSubtask) -> Result<(), EngineError> {
        match self.materialize_slice(subtask).await {
            Ok(location) => {
                self.metadata.complete_subtask(subtask.id, &location, Utc::now()).await?;
                info!(subtask_id = subtask.id, table = %subtask.dynamic_table, "subtask completed");
            }
            Err(e) => {
                warn!(subtask_id = subtask.id, table = %subtask.dynamic_table, error = %e, "subtask failed");
                self.metadata.fail_subtask(subtask.id, &e.to_string()).await?;
            }
        }
        Ok(())
    }

    async fn materialize_slice(&self, subtask: &RefreshSubtask) -> Result<String, EngineError> {
        let spec: PartitionSpec = serde_json::from_value(subtask.partition_spec_json.clone())
            .map_err(|e| EngineError::Internal(format!("malformed subtask partition spec: {e}")))?;
        let keys: HashSet<Vec<Option<String>>> = spec.keys.into_iter().collect();
        let predicate = build_in_predicate(&spec.columns, &keys);

        let pinned = rewrite::parse(&spec.pinned_sql)?;
        let restricted = rewrite::add_predicate(pinned, &predicate)?;
        let sql = rewrite::render(&restricted);

        let location = format!(
            "temp_{}_{}_{}",
            subtask.dynamic_table.schema,
            subtask.dynamic_table.name,
            uuid::Uuid::new_v4().simple()
        );
        self.lake.materialize(&location, &sql).await?;
        Ok(location)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partition_by_hash_range_covers_every_key_exactly_once() {
        let affected: HashSet<Vec<Option<String>>> = (0..20).map(|i| vec![Some(i.to_string())]).collect();
        let subtasks = partition(&["customer_id".to_string()], "SELECT 1", &affected, 4, SubtaskKind::HashRange);
        let mut seen = HashSet::new();
        for st in &subtasks {
            let spec: PartitionSpec = serde_json::from_value(st.partition_spec_json.clone()).unwrap();
            for k in spec.keys {
                assert!(seen.insert(k), "key assigned to more than one subtask");
            }
        }
        assert_eq!(seen.len(), 20);
    }

    #[test]
    fn partition_by_modulo_matches_literal_key_mod_n() {
        let affected: HashSet<Vec<Option<String>>> = (0..10).map(|i| vec![Some(i.to_string())]).collect();
        let subtasks = partition(&["customer_id".to_string()], "SELECT 1", &affected, 3, SubtaskKind::Modulo);
        for st in &subtasks {
            let spec: PartitionSpec = serde_json::from_value(st.partition_spec_json.clone()).unwrap();
            let buckets: HashSet<i64> = spec
                .keys
                .iter()
                .map(|k| k[0].as_ref().unwrap().parse::<i64>().unwrap() % 3)
                .collect();
            assert_eq!(buckets.len(), 1, "a modulo bucket must hold only one residue class");
        }
    }

    #[test]
    fn partition_drops_empty_buckets() {
        let affected: HashSet<Vec<Option<String>>> = [vec![Some("1".to_string())]].into_iter().collect();
        let subtasks = partition(&["id".to_string()], "SELECT 1", &affected, 8, SubtaskKind::Partition);
        assert_eq!(subtasks.len(), 1);
    }

    #[test]
    fn partition_kind_contiguous_slicing_covers_every_key_exactly_once() {
        let affected: HashSet<Vec<Option<String>>> = (0..9).map(|i| vec![Some(i.to_string())]).collect();
        let subtasks = partition(&["id".to_string()], "SELECT 1", &affected, 3, SubtaskKind::Partition);
        let total: usize = subtasks
            .iter()
            .map(|st| {
                let spec: PartitionSpec = serde_json::from_value(st.partition_spec_json.clone()).unwrap();
                spec.keys.len()
            })
            .sum();
        assert_eq!(total, 9);
    }
}
