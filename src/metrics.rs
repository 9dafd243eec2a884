//! Metrics sink: a small, side-effect-free trait the rest of the engine
//! reports through, kept mockable in tests. Named events mirror the alert
//! taxonomy of the reference implementation's `src/monitor.rs`
//! (`AlertEvent::{RefreshFailed, RefreshSlow, ConsecutiveErrors, ...}`),
//! generalized from a single Postgres-process monitor to a trait any
//! worker process can implement — `dt-engine-worker` backs it with
//! `prometheus` and serves it over `axum`'s `/metrics`.

use crate::model::{QualifiedName, Strategy};
use std::time::Duration;

pub trait MetricsSink: Send + Sync {
    /// A scheduler tick completed; `due_count` tables were enqueued.
    fn scheduler_tick(&self, due_count: usize, duration: Duration);

    /// A refresh attempt finished successfully under the given strategy.
    fn refresh_succeeded(&self, table: &QualifiedName, strategy: Strategy, rows_affected: u64, duration: Duration);

    /// A refresh attempt failed; `error_code` is `EngineError::code()`.
    fn refresh_failed(&self, table: &QualifiedName, error_code: &str);

    /// A refresh was skipped as a no-op (no source snapshot advance).
    fn refresh_skipped(&self, table: &QualifiedName);

    /// A table-level claim was lost (expired heartbeat) mid-refresh.
    fn claim_lost(&self, table: &QualifiedName);

    /// A subtask was requeued by the sweeper after a stale heartbeat.
    fn subtask_requeued(&self, table: &QualifiedName, subtask_id: i64);
}

/// A no-op sink, useful as a default and in unit tests that don't assert
/// on metrics.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullMetrics;

impl MetricsSink for NullMetrics {
    fn scheduler_tick(&self, _due_count: usize, _duration: Duration) {}
    fn refresh_succeeded(&self, _table: &QualifiedName, _strategy: Strategy, _rows_affected: u64, _duration: Duration) {}
    fn refresh_failed(&self, _table: &QualifiedName, _error_code: &str) {}
    fn refresh_skipped(&self, _table: &QualifiedName) {}
    fn claim_lost(&self, _table: &QualifiedName) {}
    fn subtask_requeued(&self, _table: &QualifiedName, _subtask_id: i64) {}
}
