//! Storage boundary for OFAL: the `OfferStore` trait, its Postgres and
//! in-memory backends, transient-error retry, and the source-file archive.
//!
//! Every invariant that must hold under concurrent runs (one current fact
//! per natural key, one active run per checksum, unique dimension tuples) is
//! enforced inside the store, never by check-then-act in the caller.

use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use ofal_core::{
    DimensionId, FactOffer, IngestRun, InstitutionRecord, NewFact, NewIngestRun, ProgramRecord,
    QualityFinding, QualityRun, RunFinish, StagedRow, TerritoryRecord,
};
use thiserror::Error;
use tracing::warn;
use uuid::Uuid;

pub mod archive;
pub mod memory;
pub mod postgres;

pub use archive::{sha256_hex, ArchiveAction, ArchivedSource, SourceArchive};
pub use memory::MemoryStore;
pub use postgres::PgOfferStore;

#[derive(Debug, Error)]
pub enum StoreError {
    /// A uniqueness or state constraint rejected the write. Never retried.
    #[error("constraint conflict: {0}")]
    Conflict(String),
    #[error("{entity} not found: {id}")]
    NotFound { entity: &'static str, id: String },
    #[error("invalid transition: {0}")]
    InvalidTransition(String),
    #[error("transient storage error: {0}")]
    Transient(String),
    #[error("decoding stored row: {0}")]
    Decode(String),
    #[error("database error: {0}")]
    Database(#[source] sqlx::Error),
    #[error("migration failed: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),
}

pub type StoreResult<T> = Result<T, StoreError>;

impl StoreError {
    pub fn is_conflict(&self) -> bool {
        matches!(self, StoreError::Conflict(_))
    }

    pub fn disposition(&self) -> RetryDisposition {
        match self {
            StoreError::Transient(_) => RetryDisposition::Retryable,
            _ => RetryDisposition::NonRetryable,
        }
    }
}

impl From<sqlx::Error> for StoreError {
    fn from(err: sqlx::Error) -> Self {
        match classify_sqlx_error(&err) {
            SqlxClass::UniqueViolation => StoreError::Conflict(err.to_string()),
            SqlxClass::Transient => StoreError::Transient(err.to_string()),
            SqlxClass::Other => StoreError::Database(err),
        }
    }
}

enum SqlxClass {
    UniqueViolation,
    Transient,
    Other,
}

fn classify_sqlx_error(err: &sqlx::Error) -> SqlxClass {
    match err {
        sqlx::Error::Database(db) if db.is_unique_violation() => SqlxClass::UniqueViolation,
        // serialization_failure, deadlock_detected
        sqlx::Error::Database(db) if matches!(db.code().as_deref(), Some("40001" | "40P01")) => {
            SqlxClass::Transient
        }
        sqlx::Error::Io(_) | sqlx::Error::PoolTimedOut => SqlxClass::Transient,
        _ => SqlxClass::Other,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retryable,
    NonRetryable,
}

/// Bounded exponential backoff between attempts at a transient storage
/// failure (dropped connection, pool timeout, serialization failure).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffPolicy {
    pub max_retries: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self::with_max_retries(3)
    }
}

impl BackoffPolicy {
    pub fn with_max_retries(max_retries: usize) -> Self {
        Self {
            max_retries,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(2),
        }
    }

    /// Delay before retry number `attempt + 1`: doubles from `base_delay`,
    /// capped at `max_delay`.
    pub fn delay_for_attempt(&self, attempt: usize) -> Duration {
        let exponent = u32::try_from(attempt).unwrap_or(u32::MAX);
        self.base_delay
            .saturating_mul(2u32.saturating_pow(exponent))
            .min(self.max_delay)
    }

    /// Total sleep before an operation that keeps failing is given up on.
    pub fn worst_case_wait(&self) -> Duration {
        (0..self.max_retries)
            .map(|attempt| self.delay_for_attempt(attempt))
            .fold(Duration::ZERO, Duration::saturating_add)
    }
}

/// Run `op`, retrying only transient failures, at most `policy.max_retries`
/// extra times. Conflicts and every other error are returned immediately.
pub async fn with_retry<T, F, Fut>(policy: &BackoffPolicy, op_name: &str, mut op: F) -> StoreResult<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = StoreResult<T>>,
{
    let mut attempt = 0usize;
    loop {
        match op().await {
            Err(err) if err.disposition() == RetryDisposition::Retryable => {
                if attempt >= policy.max_retries {
                    if policy.max_retries > 0 {
                        warn!(
                            op = op_name,
                            retries = policy.max_retries,
                            waited_ms = policy.worst_case_wait().as_millis() as u64,
                            error = %err,
                            "transient storage error persisted; giving up"
                        );
                    }
                    return Err(err);
                }
                warn!(op = op_name, attempt, error = %err, "transient storage error; retrying");
                tokio::time::sleep(policy.delay_for_attempt(attempt)).await;
                attempt += 1;
            }
            other => return other,
        }
    }
}

/// Relational store behind the ingestion engine.
///
/// All methods are bounded request/response calls. Writes that guard an
/// invariant return [`StoreError::Conflict`] when the invariant would break.
#[async_trait]
pub trait OfferStore: Send + Sync {
    // -- run ledger -------------------------------------------------------

    /// Insert a `running` ledger row. Conflicts when a `running` or
    /// `success` row already owns the checksum.
    async fn insert_running_run(&self, run_id: Uuid, new: &NewIngestRun) -> StoreResult<IngestRun>;

    /// The `running` or `success` row owning `checksum`, if any.
    async fn active_run_for_checksum(&self, checksum: &str) -> StoreResult<Option<IngestRun>>;

    /// Record an attempt that was short-circuited because `duplicate_of`
    /// already owns the checksum. The row is terminal on insert.
    async fn insert_skipped_run(
        &self,
        run_id: Uuid,
        new: &NewIngestRun,
        duplicate_of: Uuid,
        notes: &str,
    ) -> StoreResult<IngestRun>;

    /// Finalize a `running` row as `success` or `failed`.
    async fn finish_run(&self, run_id: Uuid, finish: &RunFinish) -> StoreResult<IngestRun>;

    async fn get_run(&self, run_id: Uuid) -> StoreResult<Option<IngestRun>>;

    /// Most recently started runs first.
    async fn list_runs(&self, limit: usize) -> StoreResult<Vec<IngestRun>>;

    /// Mark every `running` row started before `cutoff` as `failed`.
    async fn abandon_runs_started_before(
        &self,
        cutoff: DateTime<Utc>,
        finished_at: DateTime<Utc>,
        note: &str,
    ) -> StoreResult<Vec<IngestRun>>;

    // -- staging ----------------------------------------------------------

    async fn insert_staged_rows(
        &self,
        run_id: Uuid,
        ingested_at: DateTime<Utc>,
        rows: &[StagedRow],
    ) -> StoreResult<()>;

    // -- dimensions -------------------------------------------------------

    /// Insert-if-absent by `name_norm`, else return the existing id,
    /// bumping `updated_at` only when a non-identifying attribute changed.
    async fn upsert_institution(
        &self,
        record: &InstitutionRecord,
        now: DateTime<Utc>,
    ) -> StoreResult<DimensionId>;

    async fn upsert_territory(
        &self,
        record: &TerritoryRecord,
        now: DateTime<Utc>,
    ) -> StoreResult<DimensionId>;

    async fn upsert_program(&self, record: &ProgramRecord, now: DateTime<Utc>) -> StoreResult<DimensionId>;

    // -- facts ------------------------------------------------------------

    async fn current_fact(&self, natural_key: &str) -> StoreResult<Option<FactOffer>>;

    /// Insert the first current version of a key. Conflicts when the key
    /// already has a current row.
    async fn insert_current_fact(&self, fact: &NewFact) -> StoreResult<FactOffer>;

    /// Advance `last_seen_at` (never backwards) on a current row.
    /// Conflicts when `fact_id` is no longer current.
    async fn touch_fact(&self, fact_id: i64, seen_at: DateTime<Utc>, run_id: Uuid) -> StoreResult<()>;

    /// Atomically close `current_id` and insert `fact` as the new current
    /// version. Conflicts, with nothing applied, when `current_id` is no
    /// longer current.
    async fn supersede_fact(&self, current_id: i64, fact: &NewFact) -> StoreResult<FactOffer>;

    /// Every version of a key, oldest first.
    async fn fact_history(&self, natural_key: &str) -> StoreResult<Vec<FactOffer>>;

    // -- data quality -----------------------------------------------------

    async fn insert_quality_run(&self, run: &QualityRun, findings: &[QualityFinding]) -> StoreResult<()>;

    async fn quality_findings(&self, run_id: Uuid) -> StoreResult<Vec<QualityFinding>>;
}
