//! Strategy Selector — decides the refresh plan for one pending table
//! (spec §4.2). Grounded on the reference implementation's
//! `check_upstream_changes`/`execute_scheduled_refresh` pair in
//! `src/scheduler.rs`: there, a cheap existence check against the
//! change-buffer tables decides whether a refresh is even needed before
//! picking full vs. differential; here the same cheap-check-before-expensive-
//! check shape picks among five strategies instead of two.
//!
//! The decision is split across two calls because steps 1–3 of spec §4.2
//! can be answered from snapshot ids alone, while steps 4–6 need the
//! affected-key count and target row count, which cost a change-feed read
//! worth avoiding when an earlier step already settled the question.

use crate::model::{DynamicTable, RefreshStrategyPref, Strategy};
use crate::rewrite::{self, Query};

/// Answerable from snapshot comparison alone (spec §4.2 steps 1–3).
pub enum EarlyDecision {
    Bootstrap,
    NoOp,
    Full,
    /// Steps 1–3 didn't settle it; the caller must fetch the affected-key
    /// count and target row count and call [`select_with_counts`].
    NeedsCounts,
}

/// Steps 1–3: does this refresh even need the lake's change feed?
///
/// `has_stored_snapshots` is false only for a table that has never
/// completed a refresh. `sources_changed` is whether any base source's
/// current snapshot differs from its stored `SourceSnapshot` row.
pub fn select_early(
    table: &DynamicTable,
    query: &Query,
    has_stored_snapshots: bool,
    sources_changed: bool,
) -> EarlyDecision {
    if !has_stored_snapshots {
        return EarlyDecision::Bootstrap;
    }
    if !sources_changed {
        return EarlyDecision::NoOp;
    }
    if full_only(table, query) {
        return EarlyDecision::Full;
    }
    EarlyDecision::NeedsCounts
}

/// Whether this table must use Full regardless of cardinality: an explicit
/// `full` preference, absent grouping keys, or a query the rewriter
/// classifies as unsupported for affected-keys (spec §4.2 step 3, and
/// the `auto`-classified full-only edge case).
fn full_only(table: &DynamicTable, query: &Query) -> bool {
    if table.properties.refresh_strategy == RefreshStrategyPref::Full {
        return true;
    }
    if !table.supports_affected_keys() {
        return true;
    }
    rewrite::check_unsupported(query, "affected_keys").is_err()
}

/// Steps 4–6: given the affected-key count and current target size, pick
/// among Full / Parallel-affected-keys / Single-worker-affected-keys.
pub fn select_with_counts(
    table: &DynamicTable,
    affected_count: u64,
    target_row_count: u64,
    idle_worker_count: u32,
) -> Strategy {
    let ratio = if target_row_count == 0 {
        1.0
    } else {
        affected_count as f64 / target_row_count as f64
    };
    if ratio > table.properties.cardinality_threshold {
        return Strategy::Full;
    }
    if table.properties.allow_parallel
        && affected_count >= table.properties.parallel_threshold
        && idle_worker_count >= 2
    {
        return Strategy::ParallelAffectedKeys;
    }
    Strategy::AffectedKeys
}

/// Subtask count for the parallel path (spec §4.5 step 2):
/// `min(max_parallelism, max(2, ceil(affected_count / 5_000_000)))`.
pub fn subtask_count(table: &DynamicTable, affected_count: u64) -> u32 {
    let by_volume = affected_count.div_ceil(5_000_000).max(2) as u32;
    by_volume.min(table.properties.max_parallelism)
}
