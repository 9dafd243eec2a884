//! The Query Model — parsed representation of a dynamic-table definition.
//!
//! Mirrors the catalog row shape of the reference implementation's
//! `StreamTableMeta` (`catalog.rs`), generalized from a Postgres-relid-keyed
//! extension catalog to a qualified-name-keyed metadata store row, and
//! from `RefreshMode`/`DtStatus` (`dag.rs`) to the richer policy surface
//! spec §3 requires (`target_lag`, `allow_parallel`, `cardinality_threshold`,
//! ...).

use crate::error::EngineError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// A schema-qualified table name, e.g. `analytics.daily_orders`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct QualifiedName {
    pub schema: String,
    pub name: String,
}

impl QualifiedName {
    pub fn new(schema: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            schema: schema.into(),
            name: name.into(),
        }
    }

    /// Parse `schema.name` or a bare `name` (defaulting to `public`).
    pub fn parse(s: &str) -> Self {
        match s.split_once('.') {
            Some((schema, name)) => Self::new(schema, name),
            None => Self::new("public", s),
        }
    }
}

impl std::fmt::Display for QualifiedName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}", self.schema, self.name)
    }
}

/// A source referenced by a dynamic table's definition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceRef {
    pub name: QualifiedName,
    /// Whether this source is itself a dynamic table (materialized at a
    /// pinned version, never pinned again by the rewriter) versus a base
    /// lake relation (pinned per refresh).
    pub is_dynamic_table: bool,
    /// This source's own natural key columns, used both for change-feed
    /// projection and, when they differ from the target's grouping keys,
    /// for translating this source's changed rows into grouping-key terms
    /// by joining against the definition's other sources (spec §4.3 step 2).
    pub key_columns: Vec<String>,
}

/// Target lag policy: either a duration bound or `downstream` propagation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TargetLag {
    Duration(DurationSecs),
    Downstream,
}

/// Wrapper so `Duration` round-trips through JSON/TEXT as whole seconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DurationSecs(pub u64);

impl From<Duration> for DurationSecs {
    fn from(d: Duration) -> Self {
        DurationSecs(d.as_secs())
    }
}

impl From<DurationSecs> for Duration {
    fn from(d: DurationSecs) -> Self {
        Duration::from_secs(d.0)
    }
}

impl TargetLag {
    pub fn as_str(&self) -> String {
        match self {
            TargetLag::Duration(d) => format!("{}s", d.0),
            TargetLag::Downstream => "downstream".to_string(),
        }
    }

    pub fn parse(s: &str) -> Result<Self, EngineError> {
        if s.eq_ignore_ascii_case("downstream") {
            return Ok(TargetLag::Downstream);
        }
        parse_duration_literal(s)
            .map(|secs| TargetLag::Duration(DurationSecs(secs)))
            .ok_or_else(|| EngineError::InvalidArgument(format!("invalid target_lag: {s}")))
    }
}

/// Parse a literal like `5m`, `1h`, `30s`, `2d` into whole seconds.
fn parse_duration_literal(s: &str) -> Option<u64> {
    let s = s.trim();
    if s.is_empty() {
        return None;
    }
    let (digits, unit) = s.split_at(s.len() - 1);
    let (digits, mult) = if digits.chars().all(|c| c.is_ascii_digit()) && !unit.is_empty() {
        match unit {
            "s" => (digits, 1),
            "m" => (digits, 60),
            "h" => (digits, 3600),
            "d" => (digits, 86_400),
            _ => (s, 1),
        }
    } else {
        (s, 1)
    };
    digits.parse::<u64>().ok().map(|n| n * mult)
}

/// User-facing refresh strategy preference.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RefreshStrategyPref {
    Auto,
    Full,
    AffectedKeys,
}

impl RefreshStrategyPref {
    pub fn as_str(&self) -> &'static str {
        match self {
            RefreshStrategyPref::Auto => "auto",
            RefreshStrategyPref::Full => "full",
            RefreshStrategyPref::AffectedKeys => "affected_keys",
        }
    }

    #[allow(clippy::should_implement_trait)]
    pub fn from_str(s: &str) -> Result<Self, EngineError> {
        match s {
            "auto" => Ok(RefreshStrategyPref::Auto),
            "full" => Ok(RefreshStrategyPref::Full),
            "affected_keys" => Ok(RefreshStrategyPref::AffectedKeys),
            other => Err(EngineError::InvalidArgument(format!(
                "unknown refresh_strategy: {other}"
            ))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum InitializeMode {
    OnCreate,
    OnSchedule,
}

impl InitializeMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            InitializeMode::OnCreate => "on_create",
            InitializeMode::OnSchedule => "on_schedule",
        }
    }

    #[allow(clippy::should_implement_trait)]
    pub fn from_str(s: &str) -> Result<Self, EngineError> {
        match s {
            "on_create" => Ok(InitializeMode::OnCreate),
            "on_schedule" => Ok(InitializeMode::OnSchedule),
            other => Err(EngineError::InvalidArgument(format!(
                "unknown initialize mode: {other}"
            ))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TableStatus {
    Active,
    Suspended,
    Failed,
}

impl TableStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TableStatus::Active => "active",
            TableStatus::Suspended => "suspended",
            TableStatus::Failed => "failed",
        }
    }

    #[allow(clippy::should_implement_trait)]
    pub fn from_str(s: &str) -> Result<Self, EngineError> {
        match s {
            "active" => Ok(TableStatus::Active),
            "suspended" => Ok(TableStatus::Suspended),
            "failed" => Ok(TableStatus::Failed),
            other => Err(EngineError::InvalidArgument(format!(
                "unknown status: {other}"
            ))),
        }
    }
}

/// Policy properties for a dynamic table (spec §3).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TableProperties {
    pub target_lag: TargetLag,
    pub refresh_strategy: RefreshStrategyPref,
    pub deduplication: bool,
    pub cardinality_threshold: f64,
    pub allow_parallel: bool,
    pub parallel_threshold: u64,
    pub max_parallelism: u32,
    pub initialize: InitializeMode,
    pub status: TableStatus,
    pub comment: Option<String>,
}

impl Default for TableProperties {
    fn default() -> Self {
        Self {
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
        }
    }
}

/// Mode of a table-level refresh claim: `single` until a coordinator
/// fans a refresh out into subtasks, at which point it converts in place
/// to `coordinator` (spec §4.5 step 1).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ClaimMode {
    Single,
    Coordinator,
}

impl ClaimMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ClaimMode::Single => "single",
            ClaimMode::Coordinator => "coordinator",
        }
    }

    #[allow(clippy::should_implement_trait)]
    pub fn from_str(s: &str) -> Result<Self, EngineError> {
        match s {
            "single" => Ok(ClaimMode::Single),
            "coordinator" => Ok(ClaimMode::Coordinator),
            other => Err(EngineError::InvalidArgument(format!("unknown claim mode: {other}"))),
        }
    }
}

/// Subtask partitioning scheme (spec §4.6).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SubtaskKind {
    HashRange,
    Modulo,
    Partition,
}

impl SubtaskKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            SubtaskKind::HashRange => "hash_range",
            SubtaskKind::Modulo => "modulo",
            SubtaskKind::Partition => "partition",
        }
    }

    #[allow(clippy::should_implement_trait)]
    pub fn from_str(s: &str) -> Result<Self, EngineError> {
        match s {
            "hash_range" => Ok(SubtaskKind::HashRange),
            "modulo" => Ok(SubtaskKind::Modulo),
            "partition" => Ok(SubtaskKind::Partition),
            other => Err(EngineError::InvalidArgument(format!("unknown subtask kind: {other}"))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SubtaskStatus {
    Pending,
    Claimed,
    Completed,
    Failed,
}

impl SubtaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SubtaskStatus::Pending => "pending",
            SubtaskStatus::Claimed => "claimed",
            SubtaskStatus::Completed => "completed",
            SubtaskStatus::Failed => "failed",
        }
    }

    #[allow(clippy::should_implement_trait)]
    pub fn from_str(s: &str) -> Result<Self, EngineError> {
        match s {
            "pending" => Ok(SubtaskStatus::Pending),
            "claimed" => Ok(SubtaskStatus::Claimed),
            "completed" => Ok(SubtaskStatus::Completed),
            "failed" => Ok(SubtaskStatus::Failed),
            other => Err(EngineError::InvalidArgument(format!("unknown subtask status: {other}"))),
        }
    }
}

/// Outcome of one refresh attempt, recorded in `refresh_history.status`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RefreshOutcome {
    Success,
    Failed,
    Skipped,
}

impl RefreshOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            RefreshOutcome::Success => "success",
            RefreshOutcome::Failed => "failed",
            RefreshOutcome::Skipped => "skipped",
        }
    }
}

/// Strategy actually chosen and recorded for a refresh attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Strategy {
    Bootstrap,
    Full,
    AffectedKeys,
    ParallelAffectedKeys,
    NoOp,
}

impl Strategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            Strategy::Bootstrap => "bootstrap",
            Strategy::Full => "full",
            Strategy::AffectedKeys => "affected_keys",
            Strategy::ParallelAffectedKeys => "parallel_affected_keys",
            Strategy::NoOp => "no_op",
        }
    }
}

/// What triggered a refresh (spec §3 `RefreshHistory.trigger`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Trigger {
    Scheduled,
    Manual,
}

impl Trigger {
    pub fn as_str(&self) -> &'static str {
        match self {
            Trigger::Scheduled => "scheduled",
            Trigger::Manual => "manual",
        }
    }
}

/// A dynamic table: identity, definition, sources, grouping keys, policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DynamicTable {
    pub name: QualifiedName,
    pub definition: String,
    /// Non-empty iff `refresh_strategy` can be `affected_keys` (spec §3
    /// invariant: grouping keys are non-empty iff the table can use the
    /// affected-keys path).
    pub grouping_keys: Vec<String>,
    pub sources: Vec<SourceRef>,
    pub properties: TableProperties,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl DynamicTable {
    /// Whether this table's grouping keys allow the affected-keys strategy.
    pub fn supports_affected_keys(&self) -> bool {
        !self.grouping_keys.is_empty()
    }

    /// Base-lake sources (excludes dynamic-table sources, which are already
    /// materialized at a pinned version and are never re-pinned — spec §4.1).
    pub fn base_sources(&self) -> impl Iterator<Item = &SourceRef> {
        self.sources.iter().filter(|s| !s.is_dynamic_table)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn qualified_name_parses_bare_and_qualified() {
        assert_eq!(
            QualifiedName::parse("orders"),
            QualifiedName::new("public", "orders")
        );
        assert_eq!(
            QualifiedName::parse("sales.orders"),
            QualifiedName::new("sales", "orders")
        );
    }

    #[test]
    fn target_lag_parses_durations_and_downstream() {
        assert_eq!(
            TargetLag::parse("5m").unwrap(),
            TargetLag::Duration(DurationSecs(300))
        );
        assert_eq!(
            TargetLag::parse("1h").unwrap(),
            TargetLag::Duration(DurationSecs(3600))
        );
        assert_eq!(TargetLag::parse("downstream").unwrap(), TargetLag::Downstream);
        assert!(TargetLag::parse("").is_err());
    }

    #[test]
    fn base_sources_excludes_dynamic_table_sources() {
        let dt = DynamicTable {
            name: QualifiedName::parse("analytics.daily_orders"),
            definition: "SELECT 1".into(),
            grouping_keys: vec!["customer_id".into()],
            sources: vec![
                SourceRef {
                    name: QualifiedName::parse("orders"),
                    is_dynamic_table: false,
                    key_columns: vec!["customer_id".into()],
                },
                SourceRef {
                    name: QualifiedName::parse("customer_summary"),
                    is_dynamic_table: true,
                    key_columns: vec!["customer_id".into()],
                },
            ],
            properties: TableProperties::default(),
            created_at: Utc::now(),
            updated_at: Utc::now(),
        };
        let bases: Vec<_> = dt.base_sources().collect();
        assert_eq!(bases.len(), 1);
        assert_eq!(bases[0].name.name, "orders");
    }
}
