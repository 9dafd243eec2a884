//! Prometheus-backed [`MetricsSink`], served by `main.rs` over `/metrics`.
//! Event names mirror the trait; label cardinality is kept to table name
//! and strategy/error code, not per-refresh ids.

use std::time::Duration;

use dt_engine_core::metrics::MetricsSink;
use dt_engine_core::model::{QualifiedName, Strategy};
use prometheus::{Encoder, Histogram, HistogramOpts, IntCounter, IntCounterVec, Opts, Registry, TextEncoder};

pub struct PrometheusMetrics {
    registry: Registry,
    tick_duration: Histogram,
    tick_due_total: IntCounter,
    refresh_succeeded: IntCounterVec,
    refresh_failed: IntCounterVec,
    refresh_skipped: IntCounter,
    claims_lost: IntCounter,
    subtasks_requeued: IntCounter,
}

impl PrometheusMetrics {
    pub fn new() -> Self {
        let registry = Registry::new();

        let tick_duration =
            Histogram::with_opts(HistogramOpts::new("dt_engine_scheduler_tick_seconds", "Scheduler tick duration"))
                .expect("static histogram opts");
        let tick_due_total = IntCounter::new("dt_engine_scheduler_tick_due_total", "Tables enqueued, cumulative")
            .expect("static counter opts");
        let refresh_succeeded = IntCounterVec::new(
            Opts::new("dt_engine_refresh_succeeded_total", "Successful refreshes"),
            &["table", "strategy"],
        )
        .expect("static vec opts");
        let refresh_failed = IntCounterVec::new(
            Opts::new("dt_engine_refresh_failed_total", "Failed refreshes"),
            &["table", "error_code"],
        )
        .expect("static vec opts");
        let refresh_skipped = IntCounter::new("dt_engine_refresh_skipped_total", "No-op refreshes, cumulative")
            .expect("static counter opts");
        let claims_lost = IntCounter::new("dt_engine_claims_lost_total", "Claims lost to heartbeat expiry")
            .expect("static counter opts");
        let subtasks_requeued =
            IntCounter::new("dt_engine_subtasks_requeued_total", "Subtasks requeued by the sweeper")
                .expect("static counter opts");

        for collector in [
            Box::new(tick_duration.clone()) as Box<dyn prometheus::core::Collector>,
            Box::new(tick_due_total.clone()),
            Box::new(refresh_succeeded.clone()),
            Box::new(refresh_failed.clone()),
            Box::new(refresh_skipped.clone()),
            Box::new(claims_lost.clone()),
            Box::new(subtasks_requeued.clone()),
        ] {
            registry.register(collector).expect("metric names are unique and registered once");
        }

        Self {
            registry,
            tick_duration,
            tick_due_total,
            refresh_succeeded,
            refresh_failed,
            refresh_skipped,
            claims_lost,
            subtasks_requeued,
        }
    }

    pub fn render(&self) -> String {
        let families = self.registry.gather();
        let mut buf = Vec::new();
        TextEncoder::new().encode(&families, &mut buf).expect("gathered families always encode");
        String::from_utf8(buf).unwrap_or_default()
    }
}

impl Default for PrometheusMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl MetricsSink for PrometheusMetrics {
    fn scheduler_tick(&self, due_count: usize, duration: Duration) {
        self.tick_duration.observe(duration.as_secs_f64());
        self.tick_due_total.inc_by(due_count as u64);
    }

    fn refresh_succeeded(&self, table: &QualifiedName, strategy: Strategy, _rows_affected: u64, _duration: Duration) {
        self.refresh_succeeded.with_label_values(&[&table.to_string(), strategy.as_str()]).inc();
    }

    fn refresh_failed(&self, table: &QualifiedName, error_code: &str) {
        self.refresh_failed.with_label_values(&[&table.to_string(), error_code]).inc();
    }

    fn refresh_skipped(&self, _table: &QualifiedName) {
        self.refresh_skipped.inc();
    }

    fn claim_lost(&self, _table: &QualifiedName) {
        self.claims_lost.inc();
    }

    fn subtask_requeued(&self, _table: &QualifiedName, _subtask_id: i64) {
        self.subtasks_requeued.inc();
    }
}
