//! Postgres backend. Invariants live in the schema (see `migrations/`):
//! partial unique indexes for current facts and active checksums, unique
//! natural keys on every dimension.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use ofal_core::{
    DimensionId, DimensionRefs, FactOffer, IngestRun, InstitutionRecord, NewFact, NewIngestRun,
    ProgramRecord, QualityFinding, QualityRun, RunCounters, RunFinish, RunStatus, StagedRow,
    TerritoryRecord,
};
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::types::Json;
use sqlx::Row;
use tracing::debug;
use uuid::Uuid;

use crate::{OfferStore, StoreError, StoreResult};

const RUN_COLUMNS: &str = "run_id, checksum_sha256, file_name, file_size_bytes, status, started_at, \
     finished_at, duration_seconds, counters, notes, duplicate_of, process_metrics";

const FACT_COLUMNS: &str = "fact_id, institution_id, territory_id, program_id, status_original, \
     status_norm, natural_key, row_hash, first_seen_at, last_seen_at, last_run_id, is_current";

#[derive(Debug, Clone)]
pub struct PgOfferStore {
    pool: PgPool,
}

impl PgOfferStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn connect(database_url: &str, max_connections: u32) -> StoreResult<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(database_url)
            .await?;
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub async fn migrate(&self) -> StoreResult<()> {
        sqlx::migrate!("../../migrations").run(&self.pool).await?;
        Ok(())
    }

    async fn run_exists(&self, run_id: Uuid) -> StoreResult<bool> {
        let row = sqlx::query("SELECT 1 FROM ingest_runs WHERE run_id = $1")
            .bind(run_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.is_some())
    }
}

fn to_i64(value: u64, what: &str) -> StoreResult<i64> {
    i64::try_from(value).map_err(|_| StoreError::Decode(format!("{what} out of range: {value}")))
}

fn to_i32(value: u32, what: &str) -> StoreResult<i32> {
    i32::try_from(value).map_err(|_| StoreError::Decode(format!("{what} out of range: {value}")))
}

fn to_u64(value: i64, what: &str) -> StoreResult<u64> {
    u64::try_from(value).map_err(|_| StoreError::Decode(format!("{what} is negative: {value}")))
}

fn run_from_row(row: &PgRow) -> StoreResult<IngestRun> {
    let status: String = row.try_get("status")?;
    let status = status
        .parse::<RunStatus>()
        .map_err(|err| StoreError::Decode(err.to_string()))?;
    let Json(counters): Json<RunCounters> = row.try_get("counters")?;
    Ok(IngestRun {
        run_id: row.try_get("run_id")?,
        checksum_sha256: row.try_get("checksum_sha256")?,
        file_name: row.try_get("file_name")?,
        file_size_bytes: to_u64(row.try_get("file_size_bytes")?, "file_size_bytes")?,
        status,
        started_at: row.try_get("started_at")?,
        finished_at: row.try_get("finished_at")?,
        duration_seconds: row.try_get("duration_seconds")?,
        counters,
        notes: row.try_get("notes")?,
        duplicate_of: row.try_get("duplicate_of")?,
        process_metrics: row.try_get("process_metrics")?,
    })
}

fn fact_from_row(row: &PgRow) -> StoreResult<FactOffer> {
    Ok(FactOffer {
        fact_id: row.try_get("fact_id")?,
        dims: DimensionRefs {
            institution_id: row.try_get("institution_id")?,
            territory_id: row.try_get("territory_id")?,
            program_id: row.try_get("program_id")?,
        },
        status_original: row.try_get("status_original")?,
        status_norm: row.try_get("status_norm")?,
        natural_key: row.try_get("natural_key")?,
        row_hash: row.try_get("row_hash")?,
        first_seen_at: row.try_get("first_seen_at")?,
        last_seen_at: row.try_get("last_seen_at")?,
        last_run_id: row.try_get("last_run_id")?,
        is_current: row.try_get("is_current")?,
    })
}

fn finding_from_row(row: &PgRow) -> StoreResult<QualityFinding> {
    let kind: String = row.try_get("kind")?;
    let row_num: Option<i32> = row.try_get("row_num")?;
    Ok(QualityFinding {
        finding_id: row.try_get("finding_id")?,
        kind: kind
            .parse()
            .map_err(|err: ofal_core::Error| StoreError::Decode(err.to_string()))?,
        natural_key: row.try_get("natural_key")?,
        row_num: row_num
            .map(|n| u32::try_from(n).map_err(|_| StoreError::Decode(format!("row_num {n}"))))
            .transpose()?,
        row_skipped: row.try_get("row_skipped")?,
        detail: row.try_get("detail")?,
    })
}

#[async_trait]
impl OfferStore for PgOfferStore {
    async fn insert_running_run(&self, run_id: Uuid, new: &NewIngestRun) -> StoreResult<IngestRun> {
        let sql = format!(
            r#"
            INSERT INTO ingest_runs (run_id, checksum_sha256, file_name, file_size_bytes, status, started_at, counters)
            VALUES ($1, $2, $3, $4, 'running', $5, $6)
            RETURNING {RUN_COLUMNS}
            "#
        );
        let row = sqlx::query(&sql)
            .bind(run_id)
            .bind(&new.checksum_sha256)
            .bind(&new.file_name)
            .bind(to_i64(new.file_size_bytes, "file_size_bytes")?)
            .bind(new.started_at)
            .bind(Json(RunCounters::default()))
            .fetch_one(&self.pool)
            .await?;
        run_from_row(&row)
    }

    async fn active_run_for_checksum(&self, checksum: &str) -> StoreResult<Option<IngestRun>> {
        let sql = format!(
            r#"
            SELECT {RUN_COLUMNS}
              FROM ingest_runs
             WHERE checksum_sha256 = $1
               AND status IN ('running', 'success')
             LIMIT 1
            "#
        );
        let row = sqlx::query(&sql)
            .bind(checksum)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(run_from_row).transpose()
    }

    async fn insert_skipped_run(
        &self,
        run_id: Uuid,
        new: &NewIngestRun,
        duplicate_of: Uuid,
        notes: &str,
    ) -> StoreResult<IngestRun> {
        let sql = format!(
            r#"
            INSERT INTO ingest_runs (
                run_id, checksum_sha256, file_name, file_size_bytes, status,
                started_at, finished_at, duration_seconds, duplicate_of, notes, counters
            )
            VALUES ($1, $2, $3, $4, 'skipped', $5, $5, 0, $6, $7, $8)
            RETURNING {RUN_COLUMNS}
            "#
        );
        let row = sqlx::query(&sql)
            .bind(run_id)
            .bind(&new.checksum_sha256)
            .bind(&new.file_name)
            .bind(to_i64(new.file_size_bytes, "file_size_bytes")?)
            .bind(new.started_at)
            .bind(duplicate_of)
            .bind(notes)
            .bind(Json(RunCounters::default()))
            .fetch_one(&self.pool)
            .await?;
        run_from_row(&row)
    }

    async fn finish_run(&self, run_id: Uuid, finish: &RunFinish) -> StoreResult<IngestRun> {
        if !matches!(finish.status, RunStatus::Success | RunStatus::Failed) {
            return Err(StoreError::InvalidTransition(format!(
                "a run can only finish as success or failed, not {}",
                finish.status
            )));
        }
        let counters = &finish.counters;
        let sql = format!(
            r#"
            UPDATE ingest_runs
               SET status = $2,
                   finished_at = $3,
                   duration_seconds = GREATEST(EXTRACT(EPOCH FROM ($3 - started_at))::double precision, 0),
                   ingest_new = $4,
                   ingest_updated = $5,
                   ingest_unchanged = $6,
                   skipped_missing_dims = $7,
                   counters = $8,
                   notes = $9,
                   process_metrics = $10
             WHERE run_id = $1
               AND status = 'running'
            RETURNING {RUN_COLUMNS}
            "#
        );
        let row = sqlx::query(&sql)
            .bind(run_id)
            .bind(finish.status.as_str())
            .bind(finish.finished_at)
            .bind(to_i64(counters.new, "new")?)
            .bind(to_i64(counters.updated, "updated")?)
            .bind(to_i64(counters.unchanged, "unchanged")?)
            .bind(to_i64(counters.skipped_missing_dims, "skipped_missing_dims")?)
            .bind(Json(counters))
            .bind(&finish.notes)
            .bind(&finish.process_metrics)
            .fetch_optional(&self.pool)
            .await?;
        match row {
            Some(row) => run_from_row(&row),
            None if self.run_exists(run_id).await? => Err(StoreError::Conflict(format!(
                "run {run_id} is no longer running"
            ))),
            None => Err(StoreError::NotFound {
                entity: "ingest run",
                id: run_id.to_string(),
            }),
        }
    }

    async fn get_run(&self, run_id: Uuid) -> StoreResult<Option<IngestRun>> {
        let sql = format!("SELECT {RUN_COLUMNS} FROM ingest_runs WHERE run_id = $1");
        let row = sqlx::query(&sql)
            .bind(run_id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(run_from_row).transpose()
    }

    async fn list_runs(&self, limit: usize) -> StoreResult<Vec<IngestRun>> {
        let sql = format!(
            "SELECT {RUN_COLUMNS} FROM ingest_runs ORDER BY started_at DESC, run_id LIMIT $1"
        );
        let rows = sqlx::query(&sql)
            .bind(to_i64(limit as u64, "limit")?)
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(run_from_row).collect()
    }

    async fn abandon_runs_started_before(
        &self,
        cutoff: DateTime<Utc>,
        finished_at: DateTime<Utc>,
        note: &str,
    ) -> StoreResult<Vec<IngestRun>> {
        let sql = format!(
            r#"
            UPDATE ingest_runs
               SET status = 'failed',
                   finished_at = GREATEST($2, started_at),
                   duration_seconds = GREATEST(EXTRACT(EPOCH FROM ($2 - started_at))::double precision, 0),
                   notes = $3
             WHERE status = 'running'
               AND started_at < $1
            RETURNING {RUN_COLUMNS}
            "#
        );
        let rows = sqlx::query(&sql)
            .bind(cutoff)
            .bind(finished_at)
            .bind(note)
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(run_from_row).collect()
    }

    async fn insert_staged_rows(
        &self,
        run_id: Uuid,
        ingested_at: DateTime<Utc>,
        rows: &[StagedRow],
    ) -> StoreResult<()> {
        let mut tx = self.pool.begin().await?;
        for row in rows {
            sqlx::query(
                r#"
                INSERT INTO stg_offer (run_id, row_num, raw, normalized, natural_key, row_hash, ingested_at)
                VALUES ($1, $2, $3, $4, $5, $6, $7)
                "#,
            )
            .bind(run_id)
            .bind(to_i32(row.row_num(), "row_num")?)
            .bind(Json(&row.raw))
            .bind(Json(&row.normalized))
            .bind(&row.natural_key)
            .bind(&row.row_hash)
            .bind(ingested_at)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        debug!(%run_id, rows = rows.len(), "staged rows persisted");
        Ok(())
    }

    async fn upsert_institution(
        &self,
        record: &InstitutionRecord,
        now: DateTime<Utc>,
    ) -> StoreResult<DimensionId> {
        let inserted = sqlx::query(
            r#"
            INSERT INTO dim_institution (name_norm, name_original, institution_type, financing_type, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $5)
            ON CONFLICT (name_norm) DO UPDATE
               SET name_original = EXCLUDED.name_original,
                   institution_type = EXCLUDED.institution_type,
                   financing_type = EXCLUDED.financing_type,
                   updated_at = EXCLUDED.updated_at
             WHERE (dim_institution.name_original, dim_institution.institution_type, dim_institution.financing_type)
                   IS DISTINCT FROM (EXCLUDED.name_original, EXCLUDED.institution_type, EXCLUDED.financing_type)
            RETURNING institution_id
            "#,
        )
        .bind(&record.name_norm)
        .bind(&record.name_original)
        .bind(&record.institution_type)
        .bind(&record.financing_type)
        .bind(now)
        .fetch_optional(&self.pool)
        .await?;
        if let Some(row) = inserted {
            return Ok(row.try_get("institution_id")?);
        }
        let row = sqlx::query("SELECT institution_id FROM dim_institution WHERE name_norm = $1")
            .bind(&record.name_norm)
            .fetch_one(&self.pool)
            .await?;
        Ok(row.try_get("institution_id")?)
    }

    async fn upsert_territory(
        &self,
        record: &TerritoryRecord,
        now: DateTime<Utc>,
    ) -> StoreResult<DimensionId> {
        let inserted = sqlx::query(
            r#"
            INSERT INTO dim_territory (province_norm, canton_norm, province_original, canton_original, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $5)
            ON CONFLICT (province_norm, canton_norm) DO UPDATE
               SET province_original = EXCLUDED.province_original,
                   canton_original = EXCLUDED.canton_original,
                   updated_at = EXCLUDED.updated_at
             WHERE (dim_territory.province_original, dim_territory.canton_original)
                   IS DISTINCT FROM (EXCLUDED.province_original, EXCLUDED.canton_original)
            RETURNING territory_id
            "#,
        )
        .bind(&record.province_norm)
        .bind(&record.canton_norm)
        .bind(&record.province_original)
        .bind(&record.canton_original)
        .bind(now)
        .fetch_optional(&self.pool)
        .await?;
        if let Some(row) = inserted {
            return Ok(row.try_get("territory_id")?);
        }
        let row = sqlx::query(
            "SELECT territory_id FROM dim_territory WHERE province_norm = $1 AND canton_norm = $2",
        )
        .bind(&record.province_norm)
        .bind(&record.canton_norm)
        .fetch_one(&self.pool)
        .await?;
        Ok(row.try_get("territory_id")?)
    }

    async fn upsert_program(&self, record: &ProgramRecord, now: DateTime<Utc>) -> StoreResult<DimensionId> {
        let inserted = sqlx::query(
            r#"
            INSERT INTO dim_program (program_norm, broad_field_norm, level_norm, modality_norm, program_original, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $6)
            ON CONFLICT (program_norm, broad_field_norm, level_norm, modality_norm) DO UPDATE
               SET program_original = EXCLUDED.program_original,
                   updated_at = EXCLUDED.updated_at
             WHERE dim_program.program_original IS DISTINCT FROM EXCLUDED.program_original
            RETURNING program_id
            "#,
        )
        .bind(&record.program_norm)
        .bind(&record.broad_field_norm)
        .bind(&record.level_norm)
        .bind(&record.modality_norm)
        .bind(&record.program_original)
        .bind(now)
        .fetch_optional(&self.pool)
        .await?;
        if let Some(row) = inserted {
            return Ok(row.try_get("program_id")?);
        }
        let row = sqlx::query(
            r#"
            SELECT program_id
              FROM dim_program
             WHERE program_norm = $1
               AND broad_field_norm = $2
               AND level_norm = $3
               AND modality_norm = $4
            "#,
        )
        .bind(&record.program_norm)
        .bind(&record.broad_field_norm)
        .bind(&record.level_norm)
        .bind(&record.modality_norm)
        .fetch_one(&self.pool)
        .await?;
        Ok(row.try_get("program_id")?)
    }

    async fn current_fact(&self, natural_key: &str) -> StoreResult<Option<FactOffer>> {
        let sql = format!(
            "SELECT {FACT_COLUMNS} FROM fact_offer WHERE natural_key = $1 AND is_current"
        );
        let row = sqlx::query(&sql)
            .bind(natural_key)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(fact_from_row).transpose()
    }

    async fn insert_current_fact(&self, fact: &NewFact) -> StoreResult<FactOffer> {
        let sql = format!(
            r#"
            INSERT INTO fact_offer (
                institution_id, territory_id, program_id, status_original, status_norm,
                natural_key, row_hash, first_seen_at, last_seen_at, last_run_id, is_current
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $8, $9, TRUE)
            RETURNING {FACT_COLUMNS}
            "#
        );
        let row = sqlx::query(&sql)
            .bind(fact.dims.institution_id)
            .bind(fact.dims.territory_id)
            .bind(fact.dims.program_id)
            .bind(&fact.status_original)
            .bind(&fact.status_norm)
            .bind(&fact.natural_key)
            .bind(&fact.row_hash)
            .bind(fact.seen_at)
            .bind(fact.run_id)
            .fetch_one(&self.pool)
            .await?;
        fact_from_row(&row)
    }

    async fn touch_fact(&self, fact_id: i64, seen_at: DateTime<Utc>, run_id: Uuid) -> StoreResult<()> {
        let result = sqlx::query(
            r#"
            UPDATE fact_offer
               SET last_seen_at = GREATEST(last_seen_at, $2),
                   last_run_id = $3
             WHERE fact_id = $1
               AND is_current
            "#,
        )
        .bind(fact_id)
        .bind(seen_at)
        .bind(run_id)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 1 {
            return Ok(());
        }
        let exists = sqlx::query("SELECT 1 FROM fact_offer WHERE fact_id = $1")
            .bind(fact_id)
            .fetch_optional(&self.pool)
            .await?;
        match exists {
            Some(_) => Err(StoreError::Conflict(format!("fact {fact_id} is no longer current"))),
            None => Err(StoreError::NotFound {
                entity: "fact",
                id: fact_id.to_string(),
            }),
        }
    }

    async fn supersede_fact(&self, current_id: i64, fact: &NewFact) -> StoreResult<FactOffer> {
        let mut tx = self.pool.begin().await?;
        let closed = sqlx::query(
            r#"
            UPDATE fact_offer
               SET is_current = FALSE
             WHERE fact_id = $1
               AND natural_key = $2
               AND is_current
            RETURNING last_seen_at
            "#,
        )
        .bind(current_id)
        .bind(&fact.natural_key)
        .fetch_optional(&mut *tx)
        .await?;
        let Some(closed) = closed else {
            tx.rollback().await?;
            return Err(StoreError::Conflict(format!(
                "fact {current_id} is no longer the current version of {:?}",
                fact.natural_key
            )));
        };
        let closed_last_seen: DateTime<Utc> = closed.try_get("last_seen_at")?;
        let first_seen_at = fact.seen_at.max(closed_last_seen);

        let sql = format!(
            r#"
            INSERT INTO fact_offer (
                institution_id, territory_id, program_id, status_original, status_norm,
                natural_key, row_hash, first_seen_at, last_seen_at, last_run_id, is_current
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $8, $9, TRUE)
            RETURNING {FACT_COLUMNS}
            "#
        );
        let row = sqlx::query(&sql)
            .bind(fact.dims.institution_id)
            .bind(fact.dims.territory_id)
            .bind(fact.dims.program_id)
            .bind(&fact.status_original)
            .bind(&fact.status_norm)
            .bind(&fact.natural_key)
            .bind(&fact.row_hash)
            .bind(first_seen_at)
            .bind(fact.run_id)
            .fetch_one(&mut *tx)
            .await?;
        let inserted = fact_from_row(&row)?;
        tx.commit().await?;
        Ok(inserted)
    }

    async fn fact_history(&self, natural_key: &str) -> StoreResult<Vec<FactOffer>> {
        let sql = format!(
            "SELECT {FACT_COLUMNS} FROM fact_offer WHERE natural_key = $1 ORDER BY first_seen_at, fact_id"
        );
        let rows = sqlx::query(&sql)
            .bind(natural_key)
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(fact_from_row).collect()
    }

    async fn insert_quality_run(&self, run: &QualityRun, findings: &[QualityFinding]) -> StoreResult<()> {
        let mut tx = self.pool.begin().await?;
        sqlx::query(
            r#"
            INSERT INTO quality_runs (quality_run_id, run_id, created_at, metrics)
            VALUES ($1, $2, $3, $4)
            "#,
        )
        .bind(run.quality_run_id)
        .bind(run.run_id)
        .bind(run.created_at)
        .bind(&run.metrics)
        .execute(&mut *tx)
        .await?;
        for finding in findings {
            sqlx::query(
                r#"
                INSERT INTO quality_findings (finding_id, quality_run_id, kind, natural_key, row_num, row_skipped, detail)
                VALUES ($1, $2, $3, $4, $5, $6, $7)
                "#,
            )
            .bind(finding.finding_id)
            .bind(run.quality_run_id)
            .bind(finding.kind.as_str())
            .bind(&finding.natural_key)
            .bind(
                finding
                    .row_num
                    .map(|n| to_i32(n, "row_num"))
                    .transpose()?,
            )
            .bind(finding.row_skipped)
            .bind(&finding.detail)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn quality_findings(&self, run_id: Uuid) -> StoreResult<Vec<QualityFinding>> {
        let rows = sqlx::query(
            r#"
            SELECT f.finding_id, f.kind, f.natural_key, f.row_num, f.row_skipped, f.detail
              FROM quality_findings f
              JOIN quality_runs q ON q.quality_run_id = f.quality_run_id
             WHERE q.run_id = $1
             ORDER BY f.kind, f.row_num NULLS LAST, f.finding_id
            "#,
        )
        .bind(run_id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(finding_from_row).collect()
    }
}
