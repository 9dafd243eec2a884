//! Engine configuration.
//!
//! A typed, serde-backed `Config` replacing the reference implementation's
//! GUC-variable approach (`src/config.rs`, `pgstream.*` settings read via
//! `pgrx::GucSetting`): this engine runs as a standalone service, not a
//! Postgres extension, so configuration is a TOML file with environment
//! overrides (`clap`'s `env` feature, as in `pgtrickle-relay`), not
//! per-backend GUCs. Every parameter in spec §6.4 is a field here, with the
//! literal defaults §5/§8 specify.

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::error::EngineError;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Metadata store connection string (`postgres://...`).
    pub metadata_url: String,
    /// Lake connection string. Defaults to `metadata_url` when unset, since
    /// the reference adapter treats a Postgres schema as a stand-in lake.
    pub lake_url: Option<String>,

    /// How often the scheduler tick runs, in seconds. Default 60s (spec §4.9).
    pub poll_interval_secs: u64,
    /// Table-level claim expiry if the heartbeat goes stale. Default 5 min
    /// (spec §4.8, §5 "Subtask claim stale after heartbeat timeout").
    pub claim_timeout_secs: u64,
    /// Heartbeat write cadence while a refresh is in flight. Default 30s
    /// (spec §4.8).
    pub heartbeat_interval_secs: u64,
    /// Hard deadline for one table refresh. Default 1h (spec §5).
    pub refresh_timeout_secs: u64,
    /// Hard deadline for the coordinator's subtask wait-loop. Default 1h
    /// (spec §5).
    pub coordinator_wait_timeout_secs: u64,
    /// Max retries for a transient lake error within one refresh attempt.
    /// Default 3 (spec §7, §5).
    pub max_retries: u32,
    /// Max re-queues for a single subtask before it is marked `failed`.
    /// Default 3 (spec §4.7 step 6).
    pub subtask_retry_max: u32,

    /// Worker identity used in claim rows; defaults to a generated uuid if
    /// left empty at startup (see `dt-engine-worker`).
    pub worker_id: String,

    /// HTTP bind address for `/metrics` and `/health`.
    pub http_bind: String,

    /// Directory containing the numbered `.sql` migration files.
    pub migrations_dir: String,

    /// Size of the worker fleet, used only to estimate idle workers for the
    /// parallel strategy's "at least two workers appear idle" check (spec
    /// §4.5), since claims are the only fleet-visible signal this engine
    /// has — there is no separate worker registry.
    pub total_workers: u32,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            metadata_url: "postgres://localhost/dt_engine".to_string(),
            lake_url: None,
            poll_interval_secs: 60,
            claim_timeout_secs: 300,
            heartbeat_interval_secs: 30,
            refresh_timeout_secs: 3_600,
            coordinator_wait_timeout_secs: 3_600,
            max_retries: 3,
            subtask_retry_max: 3,
            worker_id: String::new(),
            http_bind: "0.0.0.0:9090".to_string(),
            migrations_dir: "migrations".to_string(),
            total_workers: 4,
        }
    }
}

impl Config {
    /// Parse a TOML config file, falling back to defaults for anything it
    /// doesn't set.
    pub fn from_toml_str(s: &str) -> Result<Self, EngineError> {
        toml::from_str(s).map_err(|e| EngineError::InvalidArgument(format!("invalid config: {e}")))
    }

    pub fn lake_url(&self) -> &str {
        self.lake_url.as_deref().unwrap_or(&self.metadata_url)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }

    pub fn claim_timeout(&self) -> Duration {
        Duration::from_secs(self.claim_timeout_secs)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs)
    }

    pub fn refresh_timeout(&self) -> Duration {
        Duration::from_secs(self.refresh_timeout_secs)
    }

    pub fn coordinator_wait_timeout(&self) -> Duration {
        Duration::from_secs(self.coordinator_wait_timeout_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_spec_literals() {
        let cfg = Config::default();
        assert_eq!(cfg.poll_interval_secs, 60);
        assert_eq!(cfg.claim_timeout_secs, 300);
        assert_eq!(cfg.heartbeat_interval_secs, 30);
        assert_eq!(cfg.refresh_timeout_secs, 3_600);
        assert_eq!(cfg.coordinator_wait_timeout_secs, 3_600);
        assert_eq!(cfg.max_retries, 3);
        assert_eq!(cfg.subtask_retry_max, 3);
        assert_eq!(cfg.total_workers, 4);
    }

    #[test]
    fn partial_toml_keeps_remaining_defaults() {
        let cfg = Config::from_toml_str("metadata_url = \"postgres://db/x\"\n").unwrap();
        assert_eq!(cfg.metadata_url, "postgres://db/x");
        assert_eq!(cfg.poll_interval_secs, 60);
    }

    #[test]
    fn lake_url_falls_back_to_metadata_url() {
        let cfg = Config::default();
        assert_eq!(cfg.lake_url(), cfg.metadata_url);
    }
}
