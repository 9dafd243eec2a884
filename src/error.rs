//! Error types for the refresh engine.
//!
//! All errors that can occur while orchestrating a refresh are represented
//! by [`EngineError`]. Errors are propagated via `Result<T, EngineError>`
//! throughout the codebase and classified into the kinds spec'd in the
//! engine design so the executor and scheduler can decide on retry/suspend
//! behavior without re-deriving policy at every call site.
//!
//! # Error Classification
//!
//! - **Definitional** — query cannot be parsed, references a nonexistent
//!   source, violates an invariant, would create a cycle. Never retried;
//!   surfaced to the user or, if encountered mid-refresh, moves the table
//!   to `failed` with no further retries until the definition changes.
//! - **Transient** — lake connection loss, conflict, statement timeout.
//!   Retried with backoff within a single refresh attempt.
//! - **Resource** — memory-limit reached, temp-space exhausted. Fails the
//!   attempt; upgrading strategy on the next scheduled attempt is a policy
//!   decision, not automatic.
//! - **Coordination** — claim lost mid-refresh, subtask timeout, parent
//!   claim expired. Handled by the sweeper and re-queue, not reported as a
//!   hard failure unless retries are exhausted.
//! - **Fatal** — an unexpected internal error. Indicates a bug.

use std::fmt;

/// Primary error type for the engine.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    // ── Definitional — fail, don't retry ─────────────────────────────
    /// The definition query could not be parsed.
    #[error("query parse error: {0}")]
    QueryParseError(String),

    /// The definition query uses a construct unsupported for its target
    /// strategy (see spec §4.1's enumerated list).
    #[error("unsupported query construct for {strategy}: {detail}")]
    UnsupportedConstruct { strategy: String, detail: String },

    /// Adding or altering this table would create a cycle in the
    /// dependency graph.
    #[error("cycle detected in dependency graph: {}", .0.join(" -> "))]
    CycleDetected(Vec<String>),

    /// The table was not found in the metadata store.
    #[error("dynamic table not found: {0}")]
    NotFound(String),

    /// The table already exists.
    #[error("dynamic table already exists: {0}")]
    AlreadyExists(String),

    /// An invalid argument was provided to an API or CLI operation.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    // ── Definitional, discovered at refresh time ─────────────────────
    /// A source referenced by the definition no longer exists.
    #[error("source dropped: {0}")]
    SourceDropped(String),

    // ── Transient lake errors — retry with backoff ───────────────────
    #[error("lake connection error: {0}")]
    LakeConnection(String),

    #[error("lake statement timeout: {0}")]
    LakeTimeout(String),

    #[error("lake transaction conflict: {0}")]
    LakeConflict(String),

    // ── Resource errors — fail the attempt, no automatic upgrade ─────
    #[error("resource limit reached: {0}")]
    ResourceLimit(String),

    // ── Coordination errors — handled by sweeper/re-queue ────────────
    #[error("claim lost: {0}")]
    ClaimLost(String),

    #[error("subtask timed out: {0}")]
    SubtaskTimeout(String),

    #[error("coordinator wait deadline exceeded: {0}")]
    CoordinatorDeadline(String),

    /// A single table refresh exceeded its configured wall-clock budget
    /// (spec §5 "Table refresh timeout"). The claim is released and the
    /// attempt recorded as failed; no lake-side rollback is needed here
    /// since each statement already commits or rolls back atomically.
    #[error("refresh timed out: {0}")]
    RefreshTimeout(String),

    // ── Metadata store plumbing ───────────────────────────────────────
    #[error("metadata store error: {0}")]
    MetadataStore(String),

    // ── Fatal — should not happen ─────────────────────────────────────
    #[error("internal error: {0}")]
    Internal(String),
}

impl EngineError {
    /// Whether this error is retryable within a single refresh attempt.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            EngineError::LakeConnection(_)
                | EngineError::LakeTimeout(_)
                | EngineError::LakeConflict(_)
        )
    }

    /// Whether this error requires operator intervention (table moves to
    /// `failed` and the scheduler stops enqueuing it).
    pub fn is_fatal_to_table(&self) -> bool {
        matches!(
            self,
            EngineError::QueryParseError(_)
                | EngineError::UnsupportedConstruct { .. }
                | EngineError::SourceDropped(_)
                | EngineError::Internal(_)
        )
    }

    /// Whether this error is a coordination failure, handled by the
    /// sweeper rather than reported as a hard failure.
    pub fn is_coordination(&self) -> bool {
        matches!(
            self,
            EngineError::ClaimLost(_)
                | EngineError::SubtaskTimeout(_)
                | EngineError::CoordinatorDeadline(_)
                | EngineError::RefreshTimeout(_)
        )
    }

    /// Classify the error for monitoring/alerting.
    pub fn kind(&self) -> EngineErrorKind {
        match self {
            EngineError::QueryParseError(_)
            | EngineError::UnsupportedConstruct { .. }
            | EngineError::CycleDetected(_)
            | EngineError::NotFound(_)
            | EngineError::AlreadyExists(_)
            | EngineError::InvalidArgument(_)
            | EngineError::SourceDropped(_) => EngineErrorKind::Definitional,

            EngineError::LakeConnection(_)
            | EngineError::LakeTimeout(_)
            | EngineError::LakeConflict(_) => EngineErrorKind::Transient,

            EngineError::ResourceLimit(_) => EngineErrorKind::Resource,

            EngineError::ClaimLost(_)
            | EngineError::SubtaskTimeout(_)
            | EngineError::CoordinatorDeadline(_)
            | EngineError::RefreshTimeout(_) => EngineErrorKind::Coordination,

            EngineError::MetadataStore(_) => EngineErrorKind::Transient,

            EngineError::Internal(_) => EngineErrorKind::Fatal,
        }
    }

    /// A stable, short error code for history rows and CLI output.
    pub fn code(&self) -> &'static str {
        match self {
            EngineError::QueryParseError(_) => "query_parse_error",
            EngineError::UnsupportedConstruct { .. } => "unsupported_construct",
            EngineError::CycleDetected(_) => "cycle_detected",
            EngineError::NotFound(_) => "not_found",
            EngineError::AlreadyExists(_) => "already_exists",
            EngineError::InvalidArgument(_) => "invalid_argument",
            EngineError::SourceDropped(_) => "source_dropped",
            EngineError::LakeConnection(_) => "lake_connection",
            EngineError::LakeTimeout(_) => "lake_timeout",
            EngineError::LakeConflict(_) => "lake_conflict",
            EngineError::ResourceLimit(_) => "resource_limit",
            EngineError::ClaimLost(_) => "claim_lost",
            EngineError::SubtaskTimeout(_) => "subtask_timeout",
            EngineError::CoordinatorDeadline(_) => "coordinator_deadline",
            EngineError::RefreshTimeout(_) => "refresh_timeout",
            EngineError::MetadataStore(_) => "metadata_store",
            EngineError::Internal(_) => "internal",
        }
    }
}

/// Classification of error severity/kind for monitoring.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineErrorKind {
    Definitional,
    Transient,
    Resource,
    Coordination,
    Fatal,
}

impl fmt::Display for EngineErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EngineErrorKind::Definitional => write!(f, "DEFINITIONAL"),
            EngineErrorKind::Transient => write!(f, "TRANSIENT"),
            EngineErrorKind::Resource => write!(f, "RESOURCE"),
            EngineErrorKind::Coordination => write!(f, "COORDINATION"),
            EngineErrorKind::Fatal => write!(f, "FATAL"),
        }
    }
}

impl From<tokio_postgres::Error> for EngineError {
    fn from(e: tokio_postgres::Error) -> Self {
        if e.is_closed() {
            EngineError::LakeConnection(e.to_string())
        } else {
            EngineError::MetadataStore(e.to_string())
        }
    }
}

// ── Retry policy ─────────────────────────────────────────────────────

/// Exponential backoff with jitter for transient lake errors, per spec §5:
/// base 1s, factor 2, cap 60s, up to 3 attempts within one refresh attempt.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub max_attempts: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base_delay_ms: 1_000,
            max_delay_ms: 60_000,
            max_attempts: 3,
        }
    }
}

impl RetryPolicy {
    /// Backoff delay in milliseconds for the given attempt number (0-based).
    /// `base_delay * 2^attempt`, capped at `max_delay`, jittered ±25%.
    pub fn backoff_ms(&self, attempt: u32) -> u64 {
        let delay = self.base_delay_ms.saturating_mul(1u64 << attempt.min(16));
        let capped = delay.min(self.max_delay_ms);

        if attempt.is_multiple_of(2) {
            capped.saturating_mul(3) / 4
        } else {
            capped.saturating_mul(5) / 4
        }
    }

    pub fn should_retry(&self, attempt: u32) -> bool {
        attempt < self.max_attempts
    }
}

/// Tracks retry state for a single in-flight refresh attempt.
#[derive(Debug, Clone, Default)]
pub struct RetryState {
    pub attempts: u32,
}

impl RetryState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a retryable failure. Returns `true` if another retry is
    /// allowed under `policy`.
    pub fn record_failure(&mut self, policy: &RetryPolicy) -> bool {
        self.attempts += 1;
        policy.should_retry(self.attempts)
    }
}
