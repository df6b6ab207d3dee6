use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use anyhow::Result;
use chrono::{DateTime, Utc};
use ofal_core::{
    detect_header, stage_row, FindingKind, IngestRun, NewIngestRun, QualityRun, RunCounters,
    RunFinish, RunStatus, StagedRow,
};
use ofal_storage::{sha256_hex, with_retry, OfferStore, SourceArchive, StoreResult};
use serde::Serialize;
use serde_json::{json, Value};
use tokio::fs;
use tracing::{debug, error, info, info_span, Instrument};
use uuid::Uuid;

use crate::reports::{write_run_reports, RunReportInput};
use crate::table::load_table;
use crate::versioner::latest_per_key;
use crate::{
    BeginOutcome, DimensionResolver, FactVersioner, IngestConfig, IngestError, QualityAuditor,
    ReferenceData, RunLedger,
};

#[derive(Debug, Clone, Serialize)]
pub struct IngestOutcome {
    pub run_id: Uuid,
    pub status: RunStatus,
    pub checksum_sha256: String,
    pub counters: RunCounters,
    pub duplicate_of: Option<Uuid>,
    pub reports_dir: Option<PathBuf>,
}

#[derive(Debug, Serialize)]
struct StepTiming {
    step: &'static str,
    seconds: f64,
}

#[derive(Debug, Default)]
struct ProcessMetrics {
    steps: Vec<StepTiming>,
    batch: Value,
}

impl ProcessMetrics {
    fn record(&mut self, step: &'static str, started: Instant) {
        let seconds = started.elapsed().as_secs_f64();
        debug!(step, seconds, "step finished");
        self.steps.push(StepTiming { step, seconds });
    }

    fn to_json(&self) -> Value {
        json!({
            "steps": self.steps,
            "total_seconds": self.steps.iter().map(|s| s.seconds).sum::<f64>(),
            "batch": self.batch,
        })
    }
}

pub struct IngestPipeline {
    store: Arc<dyn OfferStore>,
    config: IngestConfig,
    reference: ReferenceData,
    archive: SourceArchive,
}

impl IngestPipeline {
    pub fn new(store: Arc<dyn OfferStore>, config: IngestConfig, reference: ReferenceData) -> Self {
        let archive = SourceArchive::new(config.archive_dir.clone());
        Self {
            store,
            config,
            reference,
            archive,
        }
    }

    /// Loads the catalog and vocabulary named by `config`.
    pub fn from_config(store: Arc<dyn OfferStore>, config: IngestConfig) -> Result<Self> {
        let reference = ReferenceData::load(&config)?;
        Ok(Self::new(store, config, reference))
    }

    pub fn store(&self) -> &dyn OfferStore {
        self.store.as_ref()
    }

    fn ledger(&self) -> RunLedger<'_> {
        RunLedger::new(self.store.as_ref(), self.config.backoff())
    }

    pub async fn ingest_file(&self, path: &Path) -> Result<IngestOutcome, IngestError> {
        self.ingest_file_at(path, Utc::now()).await
    }

    /// Ingest `path` as observed at `now`; `now` becomes the run start and
    /// the `first_seen_at`/`last_seen_at` stamp of every fact it touches.
    pub async fn ingest_file_at(
        &self,
        path: &Path,
        now: DateTime<Utc>,
    ) -> Result<IngestOutcome, IngestError> {
        let span = info_span!("ingest", file = %path.display());
        self.run_ingest(path, now).instrument(span).await
    }

    pub async fn reconcile_stale(&self, now: DateTime<Utc>) -> StoreResult<Vec<IngestRun>> {
        self.ledger()
            .reconcile_stale(now, self.config.stale_run_after)
            .await
    }

    async fn run_ingest(&self, path: &Path, now: DateTime<Utc>) -> Result<IngestOutcome, IngestError> {
        let mut metrics = ProcessMetrics::default();

        let t = Instant::now();
        let bytes = fs::read(path).await.map_err(|source| IngestError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let checksum = sha256_hex(&bytes);
        metrics.record("checksum", t);

        let new = NewIngestRun {
            checksum_sha256: checksum.clone(),
            file_name: path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_else(|| path.display().to_string()),
            file_size_bytes: bytes.len() as u64,
            started_at: now,
        };

        let run_id = Uuid::new_v4();
        let ledger = self.ledger();
        let begin = ledger.begin(run_id, &new).await?;
        if !matches!(begin, BeginOutcome::Started(_)) {
            ledger.record_skipped(run_id, &new, &begin).await?;
            return Ok(IngestOutcome {
                run_id,
                status: RunStatus::Skipped,
                checksum_sha256: checksum,
                counters: RunCounters::default(),
                duplicate_of: begin.existing().map(|r| r.run_id),
                reports_dir: None,
            });
        }
        info!(%run_id, checksum = %checksum, size = bytes.len(), "run started");

        let mut counters = RunCounters::default();
        let result = self
            .process(run_id, &new, path, &bytes, now, &mut counters, &mut metrics)
            .await;
        let finished_at = Utc::now().max(now);

        match result {
            Ok(reports_dir) => {
                let finish = RunFinish {
                    status: RunStatus::Success,
                    finished_at,
                    counters,
                    notes: None,
                    process_metrics: metrics.to_json(),
                };
                ledger
                    .finish(run_id, &finish)
                    .await
                    .map_err(|err| IngestError::RunFailed {
                        run_id,
                        source: Box::new(err.into()),
                    })?;
                info!(
                    %run_id,
                    rows = counters.rows_loaded,
                    new = counters.new,
                    updated = counters.updated,
                    unchanged = counters.unchanged,
                    skipped_missing_dims = counters.skipped_missing_dims,
                    "ingest complete"
                );
                Ok(IngestOutcome {
                    run_id,
                    status: RunStatus::Success,
                    checksum_sha256: checksum,
                    counters,
                    duplicate_of: None,
                    reports_dir: Some(reports_dir),
                })
            }
            Err(err) => {
                error!(%run_id, error = %err, "ingest failed");
                let finish = RunFinish {
                    status: RunStatus::Failed,
                    finished_at,
                    counters,
                    notes: Some(err.to_string()),
                    process_metrics: metrics.to_json(),
                };
                if let Err(finish_err) = ledger.finish(run_id, &finish).await {
                    error!(%run_id, error = %finish_err, "could not record run failure");
                }
                Err(IngestError::RunFailed {
                    run_id,
                    source: Box::new(err),
                })
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn process(
        &self,
        run_id: Uuid,
        new: &NewIngestRun,
        path: &Path,
        bytes: &[u8],
        now: DateTime<Utc>,
        counters: &mut RunCounters,
        metrics: &mut ProcessMetrics,
    ) -> Result<PathBuf, IngestError> {
        let store = self.store.as_ref();
        let policy = self.config.backoff();

        let t = Instant::now();
        let extension = path.extension().and_then(|e| e.to_str()).unwrap_or("bin");
        let archived = self
            .archive
            .store_bytes(extension, bytes)
            .await
            .map_err(IngestError::Archive)?;
        debug!(
            path = %archived.relative_path.display(),
            action = ?archived.action,
            "source archived"
        );
        metrics.record("archive", t);

        let t = Instant::now();
        let table = load_table(path)?;
        metrics.record("load_table", t);

        let t = Instant::now();
        let header = detect_header(&table.grid, self.config.header_scan_rows)?;
        let raw_rows = header.extract_rows(&table.grid, table.first_sheet_row);
        counters.rows_loaded = raw_rows.len() as u64;
        info!(
            sheet = table.sheet.as_deref().unwrap_or("-"),
            header_row = table.first_sheet_row + header.row_index as u32,
            rows = raw_rows.len(),
            "source table read"
        );
        metrics.record("normalize", t);

        let t = Instant::now();
        let staged: Vec<StagedRow> = raw_rows.into_iter().map(stage_row).collect();
        with_retry(&policy, "insert_staged_rows", || {
            store.insert_staged_rows(run_id, now, &staged)
        })
        .await?;
        metrics.record("stage", t);

        let t = Instant::now();
        let resolution = DimensionResolver::new(store, &self.reference.catalog, policy, now)
            .resolve_all(&staged)
            .await?;
        counters.skipped_missing_dims = resolution.skipped.len() as u64;
        metrics.record("resolve", t);

        let t = Instant::now();
        let candidates = latest_per_key(&staged, &resolution.resolved);
        let versions = FactVersioner::new(store, policy, run_id, now)
            .version_all(&candidates)
            .await?;
        counters.new = versions.new;
        counters.updated = versions.updated;
        counters.unchanged = versions.unchanged;
        counters.row_conflicts = versions.row_conflicts;
        metrics.record("version", t);

        let t = Instant::now();
        let audit = QualityAuditor::new(&self.reference.catalog, &self.reference.vocabulary)
            .audit(&staged, &resolution.skipped_row_nums());
        counters.duplicates_in_file = audit.count(FindingKind::DuplicateInFile);
        counters.conflicting_status = audit.count(FindingKind::ConflictingStatus);
        counters.invalid_territory = audit.count(FindingKind::InvalidTerritory);
        counters.invalid_category = audit.count(FindingKind::InvalidCategory);
        let quality_run = QualityRun {
            quality_run_id: Uuid::new_v4(),
            run_id,
            created_at: now,
            metrics: audit.metrics.clone(),
        };
        with_retry(&policy, "insert_quality_run", || {
            store.insert_quality_run(&quality_run, &audit.findings)
        })
        .await?;
        metrics.batch = audit.metrics.clone();
        metrics.record("audit", t);

        let t = Instant::now();
        let reports_dir = write_run_reports(
            &self.config.reports_dir,
            &RunReportInput {
                run_id,
                file_name: &new.file_name,
                checksum_sha256: &new.checksum_sha256,
                generated_at: now,
                counters,
                audit: &audit,
            },
        )
        .await
        .map_err(IngestError::Reports)?;
        metrics.record("reports", t);

        Ok(reports_dir)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use ofal_core::{Column, TerritoryCatalog, Vocabulary};
    use ofal_storage::MemoryStore;
    use tempfile::{tempdir, TempDir};

    const HEADER: &str = "NOMBRE_IES,TIPO_IES,TIPO_FINANCIAMIENTO,NOMBRE_CARRERA,CAMPO_AMPLIO,\
                          NIVEL_FORMACION,MODALIDAD,PROVINCIA,CANTON,ESTADO";

    fn ts(day: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, day, 8, 0, 0).single().unwrap()
    }

    fn offer(institution: &str, canton: &str, estado: &str) -> String {
        format!(
            "{institution},Pública,Fiscal,Ingeniería,Ingeniería industria y construcción,\
             Grado,Presencial,Pichincha,{canton},{estado}"
        )
    }

    struct Harness {
        dir: TempDir,
        store: Arc<MemoryStore>,
        pipeline: IngestPipeline,
    }

    fn reference() -> ReferenceData {
        ReferenceData {
            catalog: TerritoryCatalog::from_pairs([
                ("Pichincha", "Quito"),
                ("Pichincha", "Cayambe"),
                ("Guayas", "Guayaquil"),
            ]),
            vocabulary: Vocabulary::from_entries([
                (Column::EducationLevel, vec!["Grado", "Tecnológico"]),
                (Column::Modality, vec!["Presencial", "En línea"]),
            ]),
        }
    }

    fn harness() -> Harness {
        let dir = tempdir().expect("tempdir");
        let config = IngestConfig::rooted_at(dir.path());
        let store = Arc::new(MemoryStore::new());
        let pipeline = IngestPipeline::new(store.clone(), config, reference());
        Harness {
            dir,
            store,
            pipeline,
        }
    }

    impl Harness {
        /// A CSV with one title row above the header; data starts at row 3.
        fn write_csv(&self, name: &str, title: &str, header: &str, lines: &[String]) -> PathBuf {
            let mut body = format!("Oferta académica {title}\n{header}\n");
            for line in lines {
                body.push_str(line);
                body.push('\n');
            }
            let path = self.dir.path().join(name);
            std::fs::write(&path, body).expect("write csv");
            path
        }

        fn write_offers(&self, name: &str, title: &str, lines: &[String]) -> PathBuf {
            self.write_csv(name, title, HEADER, lines)
        }

        async fn ingest(&self, path: &Path, at: DateTime<Utc>) -> IngestOutcome {
            self.pipeline.ingest_file_at(path, at).await.expect("ingest")
        }

        async fn history(&self, institution: &str, canton: &str) -> Vec<ofal_core::FactOffer> {
            let key = format!(
                "{}|INGENIERIA|INGENIERIA INDUSTRIA Y CONSTRUCCION|GRADO|PRESENCIAL|PICHINCHA|{}",
                institution, canton
            );
            self.store.fact_history(&key).await.unwrap()
        }
    }

    /// `MemoryStore` that fails the named operations until healed.
    struct FlakyStore {
        inner: MemoryStore,
        failing: std::sync::Mutex<Vec<&'static str>>,
    }

    impl FlakyStore {
        fn new() -> Self {
            Self {
                inner: MemoryStore::new(),
                failing: std::sync::Mutex::new(Vec::new()),
            }
        }

        fn fail(&self, op: &'static str) {
            self.failing.lock().unwrap().push(op);
        }

        fn heal(&self) {
            self.failing.lock().unwrap().clear();
        }

        fn check(&self, op: &'static str) -> StoreResult<()> {
            if self.failing.lock().unwrap().contains(&op) {
                return Err(ofal_storage::StoreError::Transient(format!("{op}: connection reset")));
            }
            Ok(())
        }
    }

    #[async_trait::async_trait]
    impl OfferStore for FlakyStore {
        async fn insert_running_run(&self, run_id: Uuid, new: &NewIngestRun) -> StoreResult<IngestRun> {
            self.inner.insert_running_run(run_id, new).await
        }

        async fn active_run_for_checksum(&self, checksum: &str) -> StoreResult<Option<IngestRun>> {
            self.inner.active_run_for_checksum(checksum).await
        }

        async fn insert_skipped_run(
            &self,
            run_id: Uuid,
            new: &NewIngestRun,
            duplicate_of: Uuid,
            notes: &str,
        ) -> StoreResult<IngestRun> {
            self.inner.insert_skipped_run(run_id, new, duplicate_of, notes).await
        }

        async fn finish_run(&self, run_id: Uuid, finish: &RunFinish) -> StoreResult<IngestRun> {
            self.inner.finish_run(run_id, finish).await
        }

        async fn get_run(&self, run_id: Uuid) -> StoreResult<Option<IngestRun>> {
            self.inner.get_run(run_id).await
        }

        async fn list_runs(&self, limit: usize) -> StoreResult<Vec<IngestRun>> {
            self.inner.list_runs(limit).await
        }

        async fn abandon_runs_started_before(
            &self,
            cutoff: DateTime<Utc>,
            finished_at: DateTime<Utc>,
            note: &str,
        ) -> StoreResult<Vec<IngestRun>> {
            self.inner.abandon_runs_started_before(cutoff, finished_at, note).await
        }

        async fn insert_staged_rows(
            &self,
            run_id: Uuid,
            ingested_at: DateTime<Utc>,
            rows: &[StagedRow],
        ) -> StoreResult<()> {
            self.check("insert_staged_rows")?;
            self.inner.insert_staged_rows(run_id, ingested_at, rows).await
        }

        async fn upsert_institution(
            &self,
            record: &ofal_core::InstitutionRecord,
            now: DateTime<Utc>,
        ) -> StoreResult<ofal_core::DimensionId> {
            self.check("upsert_institution")?;
            self.inner.upsert_institution(record, now).await
        }

        async fn upsert_territory(
            &self,
            record: &ofal_core::TerritoryRecord,
            now: DateTime<Utc>,
        ) -> StoreResult<ofal_core::DimensionId> {
            self.check("upsert_territory")?;
            self.inner.upsert_territory(record, now).await
        }

        async fn upsert_program(
            &self,
            record: &ofal_core::ProgramRecord,
            now: DateTime<Utc>,
        ) -> StoreResult<ofal_core::DimensionId> {
            self.check("upsert_program")?;
            self.inner.upsert_program(record, now).await
        }

        async fn current_fact(&self, natural_key: &str) -> StoreResult<Option<ofal_core::FactOffer>> {
            self.inner.current_fact(natural_key).await
        }

        async fn insert_current_fact(&self, fact: &ofal_core::NewFact) -> StoreResult<ofal_core::FactOffer> {
            self.check("insert_current_fact")?;
            self.inner.insert_current_fact(fact).await
        }

        async fn touch_fact(&self, fact_id: i64, seen_at: DateTime<Utc>, run_id: Uuid) -> StoreResult<()> {
            self.inner.touch_fact(fact_id, seen_at, run_id).await
        }

        async fn supersede_fact(
            &self,
            current_id: i64,
            fact: &ofal_core::NewFact,
        ) -> StoreResult<ofal_core::FactOffer> {
            self.inner.supersede_fact(current_id, fact).await
        }

        async fn fact_history(&self, natural_key: &str) -> StoreResult<Vec<ofal_core::FactOffer>> {
            self.inner.fact_history(natural_key).await
        }

        async fn insert_quality_run(
            &self,
            run: &QualityRun,
            findings: &[ofal_core::QualityFinding],
        ) -> StoreResult<()> {
            self.check("insert_quality_run")?;
            self.inner.insert_quality_run(run, findings).await
        }

        async fn quality_findings(&self, run_id: Uuid) -> StoreResult<Vec<ofal_core::QualityFinding>> {
            self.inner.quality_findings(run_id).await
        }
    }

    #[tokio::test]
    async fn storage_failure_mid_run_fails_the_run_and_frees_the_file() {
        for op in [
            "insert_staged_rows",
            "upsert_institution",
            "upsert_program",
            "insert_current_fact",
            "insert_quality_run",
        ] {
            let dir = tempdir().expect("tempdir");
            let mut config = IngestConfig::rooted_at(dir.path());
            config.db_max_retries = 0;
            let store = Arc::new(FlakyStore::new());
            let pipeline = IngestPipeline::new(store.clone(), config, reference());
            let path = dir.path().join("enero.csv");
            std::fs::write(
                &path,
                format!("Oferta\n{HEADER}\n{}\n", offer("Universidad X", "Quito", "Activa")),
            )
            .unwrap();

            store.fail(op);
            let err = pipeline.ingest_file_at(&path, ts(1)).await.unwrap_err();
            let run_id = err.run_id().expect("failed run is recorded");
            assert!(
                matches!(
                    err,
                    IngestError::RunFailed { ref source, .. }
                        if matches!(**source, IngestError::Store(ofal_storage::StoreError::Transient(_)))
                ),
                "{op}: {err}"
            );

            let run = store.get_run(run_id).await.unwrap().unwrap();
            assert_eq!(run.status, RunStatus::Failed, "{op}");
            assert!(run.notes.as_deref().unwrap_or_default().contains(op), "{op}");
            assert!(run.process_metrics["steps"].as_array().is_some());
            assert!(store
                .active_run_for_checksum(&run.checksum_sha256)
                .await
                .unwrap()
                .is_none());

            store.heal();
            let retried = pipeline.ingest_file_at(&path, ts(2)).await.unwrap();
            assert_eq!(retried.status, RunStatus::Success, "{op}");
            assert_eq!(retried.counters.new + retried.counters.unchanged, 1, "{op}");
            let key = "UNIVERSIDAD X|INGENIERIA|INGENIERIA INDUSTRIA Y CONSTRUCCION|GRADO|PRESENCIAL|PICHINCHA|QUITO";
            let history = store.fact_history(key).await.unwrap();
            assert_eq!(history.len(), 1, "{op}");
            assert!(history[0].is_current);
        }
    }

    #[tokio::test]
    async fn first_sighting_creates_one_current_fact() {
        let h = harness();
        let path = h.write_offers("enero.csv", "enero", &[offer("Universidad X", "Quito", "Activa")]);
        let outcome = h.ingest(&path, ts(1)).await;

        assert_eq!(outcome.status, RunStatus::Success);
        assert_eq!(outcome.counters.rows_loaded, 1);
        assert_eq!(outcome.counters.new, 1);
        assert_eq!(outcome.counters.skipped_missing_dims, 0);

        let history = h.history("UNIVERSIDAD X", "QUITO").await;
        assert_eq!(history.len(), 1);
        assert!(history[0].is_current);
        assert_eq!(history[0].status_norm.as_deref(), Some("ACTIVA"));
        assert_eq!(history[0].first_seen_at, ts(1));
        assert_eq!(history[0].last_seen_at, ts(1));
        assert_eq!(history[0].last_run_id, outcome.run_id);

        let staged = h.store.staged_rows(outcome.run_id).await;
        assert_eq!(staged.len(), 1);
        assert_eq!(staged[0].row_num(), 3);

        let run = h.store.get_run(outcome.run_id).await.unwrap().unwrap();
        assert_eq!(run.status, RunStatus::Success);
        assert_eq!(run.counters.new, 1);
        assert!(run.finished_at.is_some());
        assert!(run.process_metrics["steps"].as_array().unwrap().len() >= 8);
        assert_eq!(run.process_metrics["batch"]["unique"]["institutions"], 1);

        let reports_dir = outcome.reports_dir.unwrap();
        assert!(reports_dir.join(crate::reports::DATA_QUALITY_JSON).exists());
        assert!(reports_dir.join(crate::reports::INCONSISTENCIES_CSV).exists());
        assert!(reports_dir.join(crate::reports::DATA_QUALITY_HTML).exists());
    }

    #[tokio::test]
    async fn unchanged_row_only_advances_last_seen() {
        let h = harness();
        let row = offer("Universidad X", "Quito", "Activa");
        let first = h.write_offers("enero.csv", "enero", &[row.clone()]);
        let second = h.write_offers("febrero.csv", "febrero", &[row]);
        h.ingest(&first, ts(1)).await;
        let outcome = h.ingest(&second, ts(2)).await;

        assert_eq!(outcome.counters.unchanged, 1);
        assert_eq!(outcome.counters.new, 0);
        let history = h.history("UNIVERSIDAD X", "QUITO").await;
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].first_seen_at, ts(1));
        assert_eq!(history[0].last_seen_at, ts(2));
        assert_eq!(history[0].last_run_id, outcome.run_id);
    }

    #[tokio::test]
    async fn changed_status_closes_the_version_and_opens_another() {
        let h = harness();
        let first = h.write_offers("enero.csv", "enero", &[offer("Universidad X", "Quito", "Activa")]);
        let second =
            h.write_offers("febrero.csv", "febrero", &[offer("Universidad X", "Quito", "Inactiva")]);
        h.ingest(&first, ts(1)).await;
        let outcome = h.ingest(&second, ts(2)).await;

        assert_eq!(outcome.counters.updated, 1);
        let history = h.history("UNIVERSIDAD X", "QUITO").await;
        assert_eq!(history.len(), 2);
        assert!(!history[0].is_current);
        assert_eq!(history[0].status_norm.as_deref(), Some("ACTIVA"));
        assert!(history[1].is_current);
        assert_eq!(history[1].status_norm.as_deref(), Some("INACTIVA"));
        assert!(history[0].last_seen_at <= history[1].first_seen_at);
        assert_eq!(history.iter().filter(|f| f.is_current).count(), 1);
    }

    #[tokio::test]
    async fn conflicting_status_in_one_file_is_reported_once() {
        let h = harness();
        let path = h.write_offers(
            "marzo.csv",
            "marzo",
            &[
                offer("Universidad X", "Quito", "Activa"),
                offer("Universidad X", "Quito", "Inactiva"),
            ],
        );
        let outcome = h.ingest(&path, ts(1)).await;

        assert_eq!(outcome.counters.conflicting_status, 1);
        assert_eq!(outcome.counters.duplicates_in_file, 1);
        assert_eq!(outcome.counters.new, 1);

        let findings = h.store.quality_findings(outcome.run_id).await.unwrap();
        let conflicts = findings
            .iter()
            .filter(|f| f.kind == FindingKind::ConflictingStatus)
            .collect::<Vec<_>>();
        assert_eq!(conflicts.len(), 1);
        assert!(conflicts[0]
            .natural_key
            .as_deref()
            .unwrap()
            .starts_with("UNIVERSIDAD X|INGENIERIA|"));

        let history = h.history("UNIVERSIDAD X", "QUITO").await;
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].status_norm.as_deref(), Some("INACTIVA"));
    }

    #[tokio::test]
    async fn unknown_canton_is_flagged_and_skipped() {
        let h = harness();
        let path = h.write_offers(
            "abril.csv",
            "abril",
            &[
                offer("Universidad X", "Quito", "Activa"),
                offer("Universidad X", "NoExiste", "Activa"),
            ],
        );
        let outcome = h.ingest(&path, ts(1)).await;

        assert_eq!(outcome.counters.invalid_territory, 1);
        assert_eq!(outcome.counters.skipped_missing_dims, 1);
        assert_eq!(outcome.counters.new, 1);
        assert!(h.history("UNIVERSIDAD X", "NOEXISTE").await.is_empty());

        let findings = h.store.quality_findings(outcome.run_id).await.unwrap();
        let invalid = findings
            .iter()
            .find(|f| f.kind == FindingKind::InvalidTerritory)
            .unwrap();
        assert_eq!(invalid.row_num, Some(4));
        assert!(invalid.row_skipped);
        assert_eq!(invalid.detail["reason"], "canton_not_in_province");
    }

    #[tokio::test]
    async fn identical_file_is_skipped_without_changes() {
        let h = harness();
        let path = h.write_offers("enero.csv", "enero", &[offer("Universidad X", "Quito", "Activa")]);
        let first = h.ingest(&path, ts(1)).await;
        let before = h.store.table_counts().await;

        let second = h.ingest(&path, ts(2)).await;
        assert_eq!(second.status, RunStatus::Skipped);
        assert_eq!(second.duplicate_of, Some(first.run_id));
        assert_eq!(second.counters, RunCounters::default());

        let after = h.store.table_counts().await;
        assert_eq!(after.runs, before.runs + 1);
        assert_eq!(
            (after.facts, after.staged_rows, after.institutions),
            (before.facts, before.staged_rows, before.institutions)
        );
        let history = h.history("UNIVERSIDAD X", "QUITO").await;
        assert_eq!(history[0].last_seen_at, ts(1));

        let skipped = h.store.get_run(second.run_id).await.unwrap().unwrap();
        assert_eq!(skipped.status, RunStatus::Skipped);
        assert_eq!(skipped.duplicate_of, Some(first.run_id));
    }

    #[tokio::test]
    async fn column_order_and_spelling_do_not_change_identity() {
        let h = harness();
        let first = h.write_offers("enero.csv", "enero", &[offer("Universidad X", "Quito", "Activa")]);

        let reversed = |line: &str| line.split(',').rev().collect::<Vec<_>>().join(",");
        let respelled = offer("  universidad   x ", "QUITO", "ACTIVA");
        let second = h.write_csv(
            "febrero.csv",
            "febrero",
            &reversed(HEADER),
            &[reversed(&respelled)],
        );

        h.ingest(&first, ts(1)).await;
        let outcome = h.ingest(&second, ts(2)).await;
        assert_eq!(outcome.counters.unchanged, 1);
        assert_eq!(h.history("UNIVERSIDAD X", "QUITO").await.len(), 1);
    }

    #[tokio::test]
    async fn missing_header_fails_the_run_and_releases_the_file() {
        let h = harness();
        let path = h.write_csv("roto.csv", "sin cabecera", "A,B,C", &["1,2,3".to_string()]);
        let err = h.pipeline.ingest_file_at(&path, ts(1)).await.unwrap_err();
        let run_id = err.run_id().expect("failed run is recorded");
        assert!(matches!(
            err,
            IngestError::RunFailed { ref source, .. }
                if matches!(**source, IngestError::Table(ofal_core::Error::HeaderNotFound { .. }))
        ));

        let run = h.store.get_run(run_id).await.unwrap().unwrap();
        assert_eq!(run.status, RunStatus::Failed);
        assert!(run.notes.unwrap().contains("header row not found"));
        assert!(h
            .store
            .active_run_for_checksum(&run.checksum_sha256)
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn unsupported_files_fail_as_recorded_runs() {
        let h = harness();
        let path = h.dir.path().join("oferta.pdf");
        std::fs::write(&path, b"%PDF-1.7").unwrap();
        let err = h.pipeline.ingest_file_at(&path, ts(1)).await.unwrap_err();
        assert!(err.run_id().is_some());
    }

    #[tokio::test]
    async fn interrupted_run_blocks_until_reconciled() {
        let h = harness();
        let path = h.write_offers("enero.csv", "enero", &[offer("Universidad X", "Quito", "Activa")]);
        let checksum = sha256_hex(&std::fs::read(&path).unwrap());
        let stuck = h
            .store
            .seed_running_run(
                Uuid::new_v4(),
                NewIngestRun {
                    checksum_sha256: checksum,
                    file_name: "enero.csv".into(),
                    file_size_bytes: 1,
                    started_at: ts(1),
                },
            )
            .await
            .unwrap();

        let blocked = h.ingest(&path, ts(2)).await;
        assert_eq!(blocked.status, RunStatus::Skipped);
        assert_eq!(blocked.duplicate_of, Some(stuck.run_id));

        let abandoned = h.pipeline.reconcile_stale(ts(2)).await.unwrap();
        assert_eq!(abandoned.len(), 1);
        assert_eq!(abandoned[0].run_id, stuck.run_id);

        let retried = h.ingest(&path, ts(3)).await;
        assert_eq!(retried.status, RunStatus::Success);
        assert_eq!(retried.counters.new, 1);
    }

    #[tokio::test]
    async fn history_stays_monotonic_across_many_runs() {
        let h = harness();
        let statuses = ["Activa", "Activa", "Inactiva", "Activa", "Activa", "Inactiva"];
        for (i, status) in statuses.iter().enumerate() {
            let path = h.write_offers(
                &format!("corte-{i}.csv"),
                &format!("corte {i}"),
                &[offer("Universidad X", "Quito", status)],
            );
            h.ingest(&path, ts(i as u32 + 1)).await;
        }

        let history = h.history("UNIVERSIDAD X", "QUITO").await;
        assert_eq!(history.len(), 4);
        assert_eq!(history.iter().filter(|f| f.is_current).count(), 1);
        assert!(history.last().unwrap().is_current);
        for pair in history.windows(2) {
            assert!(pair[0].first_seen_at <= pair[0].last_seen_at);
            assert!(pair[0].last_seen_at <= pair[1].first_seen_at);
        }
    }
}
