//! Dynamic table definition files consumed by `create`/`validate`.
//!
//! Spec §1 excludes DDL parsing for user queries from the engine itself
//! ("the engine receives a parsed model"); this is that parsing boundary.
//! A definition file is TOML rather than a bespoke `CREATE DYNAMIC TABLE`
//! grammar, reusing the same `serde`+`toml` stack `config::Config` already
//! leans on instead of inventing a second parser for the same job.

use std::path::Path;

use chrono::Utc;
use dt_engine_core::error::EngineError;
use dt_engine_core::model::{
    DynamicTable, InitializeMode, QualifiedName, RefreshStrategyPref, SourceRef, TableProperties, TableStatus,
    TargetLag,
};
use serde::Deserialize;

#[derive(Debug, Deserialize)]
pub struct SourceSpec {
    pub name: String,
    #[serde(default)]
    pub is_dynamic_table: bool,
    #[serde(default)]
    pub key_columns: Vec<String>,
}

#[derive(Debug, Deserialize)]
pub struct TableSpec {
    pub name: String,
    pub definition: String,
    #[serde(default)]
    pub grouping_keys: Vec<String>,
    #[serde(default)]
    pub sources: Vec<SourceSpec>,
    #[serde(default = "default_target_lag")]
    pub target_lag: String,
    #[serde(default = "default_refresh_strategy")]
    pub refresh_strategy: String,
    #[serde(default)]
    pub deduplication: bool,
    #[serde(default = "default_cardinality_threshold")]
    pub cardinality_threshold: f64,
    #[serde(default)]
    pub allow_parallel: bool,
    #[serde(default = "default_parallel_threshold")]
    pub parallel_threshold: u64,
    #[serde(default = "default_max_parallelism")]
    pub max_parallelism: u32,
    #[serde(default = "default_initialize")]
    pub initialize: String,
    #[serde(default)]
    pub comment: Option<String>,
}

fn default_target_lag() -> String {
    "1h".to_string()
}
fn default_refresh_strategy() -> String {
    "auto".to_string()
}
fn default_cardinality_threshold() -> f64 {
    0.3
}
fn default_parallel_threshold() -> u64 {
    10_000_000
}
fn default_max_parallelism() -> u32 {
    4
}
fn default_initialize() -> String {
    "on_create".to_string()
}

impl TableSpec {
    pub fn from_file(path: &Path) -> Result<Self, EngineError> {
        let raw = std::fs::read_to_string(path)
            .map_err(|e| EngineError::InvalidArgument(format!("reading {}: {e}", path.display())))?;
        toml::from_str(&raw).map_err(|e| EngineError::InvalidArgument(format!("invalid definition file: {e}")))
    }

    /// Validates the embedded query and converts to a [`DynamicTable`].
    /// Does not check cycles or existing dependents — the caller does that
    /// against the live dependency graph.
    pub fn into_dynamic_table(self) -> Result<DynamicTable, EngineError> {
        let query = dt_engine_core::rewrite::parse(&self.definition)?;
        let target_lag = TargetLag::parse(&self.target_lag)?;
        let refresh_strategy = RefreshStrategyPref::from_str(&self.refresh_strategy)?;
        let initialize = InitializeMode::from_str(&self.initialize)?;

        if !self.grouping_keys.is_empty() && matches!(refresh_strategy, RefreshStrategyPref::AffectedKeys) {
            dt_engine_core::rewrite::check_unsupported(&query, "affected_keys")?;
        }

        let sources = self
            .sources
            .into_iter()
            .map(|s| SourceRef {
                name: QualifiedName::parse(&s.name),
                is_dynamic_table: s.is_dynamic_table,
                key_columns: s.key_columns,
            })
            .collect();

        let now = Utc::now();
        Ok(DynamicTable {
            name: QualifiedName::parse(&self.name),
            definition: self.definition,
            grouping_keys: self.grouping_keys,
            sources,
            properties: TableProperties {
                target_lag,
                refresh_strategy,
                deduplication: self.deduplication,
                cardinality_threshold: self.cardinality_threshold,
                allow_parallel: self.allow_parallel,
                parallel_threshold: self.parallel_threshold,
                max_parallelism: self.max_parallelism,
                initialize,
                status: TableStatus::Active,
                comment: self.comment,
            },
            created_at: now,
            updated_at: now,
        })
    }
}
