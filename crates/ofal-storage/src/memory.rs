//! In-process `OfferStore` used by tests and dry runs.
//!
//! A single async mutex serializes every call, so each method is atomic in
//! the same way a constraint-guarded statement or transaction is in Postgres.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use ofal_core::{
    DimensionId, DimensionRow, FactOffer, IngestRun, InstitutionRecord, NewFact, NewIngestRun,
    ProgramRecord, QualityFinding, QualityRun, RunFinish, RunStatus, StagedRow, TerritoryRecord,
};
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::{OfferStore, StoreError, StoreResult};

#[derive(Debug, Default)]
struct MemoryState {
    runs: Vec<IngestRun>,
    staged: Vec<(Uuid, DateTime<Utc>, StagedRow)>,
    institutions: Vec<DimensionRow<InstitutionRecord>>,
    institution_index: HashMap<String, usize>,
    territories: Vec<DimensionRow<TerritoryRecord>>,
    territory_index: HashMap<(String, String), usize>,
    programs: Vec<DimensionRow<ProgramRecord>>,
    program_index: HashMap<(String, String, String, String), usize>,
    facts: Vec<FactOffer>,
    current_by_key: HashMap<String, usize>,
    quality_runs: Vec<QualityRun>,
    findings: Vec<(Uuid, QualityFinding)>,
}

impl MemoryState {
    fn run_mut(&mut self, run_id: Uuid) -> StoreResult<&mut IngestRun> {
        self.runs
            .iter_mut()
            .find(|r| r.run_id == run_id)
            .ok_or_else(|| StoreError::NotFound {
                entity: "ingest run",
                id: run_id.to_string(),
            })
    }

    fn active_for_checksum(&self, checksum: &str) -> Option<&IngestRun> {
        self.runs.iter().find(|r| {
            r.checksum_sha256 == checksum
                && matches!(r.status, RunStatus::Running | RunStatus::Success)
        })
    }

    fn push_fact(&mut self, fact: &NewFact, first_seen_at: DateTime<Utc>) -> FactOffer {
        let row = FactOffer {
            fact_id: self.facts.len() as i64 + 1,
            dims: fact.dims,
            status_original: fact.status_original.clone(),
            status_norm: fact.status_norm.clone(),
            natural_key: fact.natural_key.clone(),
            row_hash: fact.row_hash.clone(),
            first_seen_at,
            last_seen_at: first_seen_at,
            last_run_id: fact.run_id,
            is_current: true,
        };
        self.current_by_key
            .insert(row.natural_key.clone(), self.facts.len());
        self.facts.push(row.clone());
        row
    }
}

/// Counts of rows per table, for assertions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TableCounts {
    pub institutions: usize,
    pub territories: usize,
    pub programs: usize,
    pub facts: usize,
    pub current_facts: usize,
    pub staged_rows: usize,
    pub runs: usize,
}

#[derive(Debug, Default)]
pub struct MemoryStore {
    state: Mutex<MemoryState>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn table_counts(&self) -> TableCounts {
        let state = self.state.lock().await;
        TableCounts {
            institutions: state.institutions.len(),
            territories: state.territories.len(),
            programs: state.programs.len(),
            facts: state.facts.len(),
            current_facts: state.facts.iter().filter(|f| f.is_current).count(),
            staged_rows: state.staged.len(),
            runs: state.runs.len(),
        }
    }

    pub async fn institutions(&self) -> Vec<DimensionRow<InstitutionRecord>> {
        self.state.lock().await.institutions.clone()
    }

    pub async fn staged_rows(&self, run_id: Uuid) -> Vec<StagedRow> {
        let state = self.state.lock().await;
        state
            .staged
            .iter()
            .filter(|(id, _, _)| *id == run_id)
            .map(|(_, _, row)| row.clone())
            .collect()
    }

    /// Simulates an interrupted process: a `running` row that nobody will
    /// finish, started at `started_at`.
    pub async fn seed_running_run(&self, run_id: Uuid, new: NewIngestRun) -> StoreResult<IngestRun> {
        self.insert_running_run(run_id, &new).await
    }
}

#[async_trait]
impl OfferStore for MemoryStore {
    async fn insert_running_run(&self, run_id: Uuid, new: &NewIngestRun) -> StoreResult<IngestRun> {
        let mut state = self.state.lock().await;
        if let Some(existing) = state.active_for_checksum(&new.checksum_sha256) {
            return Err(StoreError::Conflict(format!(
                "checksum {} already owned by run {} ({})",
                new.checksum_sha256, existing.run_id, existing.status
            )));
        }
        let run = IngestRun::started(run_id, new.clone());
        state.runs.push(run.clone());
        Ok(run)
    }

    async fn active_run_for_checksum(&self, checksum: &str) -> StoreResult<Option<IngestRun>> {
        let state = self.state.lock().await;
        Ok(state.active_for_checksum(checksum).cloned())
    }

    async fn insert_skipped_run(
        &self,
        run_id: Uuid,
        new: &NewIngestRun,
        duplicate_of: Uuid,
        notes: &str,
    ) -> StoreResult<IngestRun> {
        let mut state = self.state.lock().await;
        let mut run = IngestRun::started(run_id, new.clone());
        run.status = RunStatus::Skipped;
        run.finished_at = Some(new.started_at);
        run.duration_seconds = Some(0.0);
        run.duplicate_of = Some(duplicate_of);
        run.notes = Some(notes.to_string());
        state.runs.push(run.clone());
        Ok(run)
    }

    async fn finish_run(&self, run_id: Uuid, finish: &RunFinish) -> StoreResult<IngestRun> {
        if !matches!(finish.status, RunStatus::Success | RunStatus::Failed) {
            return Err(StoreError::InvalidTransition(format!(
                "a run can only finish as success or failed, not {}",
                finish.status
            )));
        }
        let mut state = self.state.lock().await;
        let run = state.run_mut(run_id)?;
        if run.status != RunStatus::Running {
            return Err(StoreError::Conflict(format!(
                "run {run_id} is already {}",
                run.status
            )));
        }
        run.apply_finish(finish.clone());
        Ok(run.clone())
    }

    async fn get_run(&self, run_id: Uuid) -> StoreResult<Option<IngestRun>> {
        let state = self.state.lock().await;
        Ok(state.runs.iter().find(|r| r.run_id == run_id).cloned())
    }

    async fn list_runs(&self, limit: usize) -> StoreResult<Vec<IngestRun>> {
        let state = self.state.lock().await;
        let mut runs = state.runs.clone();
        runs.sort_by(|a, b| b.started_at.cmp(&a.started_at));
        runs.truncate(limit);
        Ok(runs)
    }

    async fn abandon_runs_started_before(
        &self,
        cutoff: DateTime<Utc>,
        finished_at: DateTime<Utc>,
        note: &str,
    ) -> StoreResult<Vec<IngestRun>> {
        let mut state = self.state.lock().await;
        let mut abandoned = Vec::new();
        for run in state.runs.iter_mut() {
            if run.status == RunStatus::Running && run.started_at < cutoff {
                let finish = RunFinish {
                    status: RunStatus::Failed,
                    finished_at,
                    counters: run.counters,
                    notes: Some(note.to_string()),
                    process_metrics: run.process_metrics.clone(),
                };
                run.apply_finish(finish);
                abandoned.push(run.clone());
            }
        }
        Ok(abandoned)
    }

    async fn insert_staged_rows(
        &self,
        run_id: Uuid,
        ingested_at: DateTime<Utc>,
        rows: &[StagedRow],
    ) -> StoreResult<()> {
        let mut state = self.state.lock().await;
        for row in rows {
            let duplicate = state
                .staged
                .iter()
                .any(|(id, _, r)| *id == run_id && r.row_num() == row.row_num());
            if duplicate {
                return Err(StoreError::Conflict(format!(
                    "staged row {} already exists for run {run_id}",
                    row.row_num()
                )));
            }
        }
        state
            .staged
            .extend(rows.iter().map(|r| (run_id, ingested_at, r.clone())));
        Ok(())
    }

    async fn upsert_institution(
        &self,
        record: &InstitutionRecord,
        now: DateTime<Utc>,
    ) -> StoreResult<DimensionId> {
        let mut state = self.state.lock().await;
        if let Some(&idx) = state.institution_index.get(&record.name_norm) {
            let row = &mut state.institutions[idx];
            if row.record != *record {
                row.record = record.clone();
                row.updated_at = now;
            }
            return Ok(row.id);
        }
        let id = state.institutions.len() as DimensionId + 1;
        let idx = state.institutions.len();
        state.institutions.push(DimensionRow {
            id,
            record: record.clone(),
            created_at: now,
            updated_at: now,
        });
        state.institution_index.insert(record.name_norm.clone(), idx);
        Ok(id)
    }

    async fn upsert_territory(
        &self,
        record: &TerritoryRecord,
        now: DateTime<Utc>,
    ) -> StoreResult<DimensionId> {
        let mut state = self.state.lock().await;
        let key = (record.province_norm.clone(), record.canton_norm.clone());
        if let Some(&idx) = state.territory_index.get(&key) {
            let row = &mut state.territories[idx];
            if row.record != *record {
                row.record = record.clone();
                row.updated_at = now;
            }
            return Ok(row.id);
        }
        let id = state.territories.len() as DimensionId + 1;
        let idx = state.territories.len();
        state.territories.push(DimensionRow {
            id,
            record: record.clone(),
            created_at: now,
            updated_at: now,
        });
        state.territory_index.insert(key, idx);
        Ok(id)
    }

    async fn upsert_program(&self, record: &ProgramRecord, now: DateTime<Utc>) -> StoreResult<DimensionId> {
        let mut state = self.state.lock().await;
        let key = record.identity();
        if let Some(&idx) = state.program_index.get(&key) {
            let row = &mut state.programs[idx];
            if row.record != *record {
                row.record = record.clone();
                row.updated_at = now;
            }
            return Ok(row.id);
        }
        let id = state.programs.len() as DimensionId + 1;
        let idx = state.programs.len();
        state.programs.push(DimensionRow {
            id,
            record: record.clone(),
            created_at: now,
            updated_at: now,
        });
        state.program_index.insert(key, idx);
        Ok(id)
    }

    async fn current_fact(&self, natural_key: &str) -> StoreResult<Option<FactOffer>> {
        let state = self.state.lock().await;
        Ok(state
            .current_by_key
            .get(natural_key)
            .map(|&idx| state.facts[idx].clone()))
    }

    async fn insert_current_fact(&self, fact: &NewFact) -> StoreResult<FactOffer> {
        let mut state = self.state.lock().await;
        if state.current_by_key.contains_key(&fact.natural_key) {
            return Err(StoreError::Conflict(format!(
                "natural key {:?} already has a current fact",
                fact.natural_key
            )));
        }
        Ok(state.push_fact(fact, fact.seen_at))
    }

    async fn touch_fact(&self, fact_id: i64, seen_at: DateTime<Utc>, run_id: Uuid) -> StoreResult<()> {
        let mut state = self.state.lock().await;
        let fact = state
            .facts
            .iter_mut()
            .find(|f| f.fact_id == fact_id)
            .ok_or_else(|| StoreError::NotFound {
                entity: "fact",
                id: fact_id.to_string(),
            })?;
        if !fact.is_current {
            return Err(StoreError::Conflict(format!("fact {fact_id} is no longer current")));
        }
        fact.last_seen_at = fact.last_seen_at.max(seen_at);
        fact.last_run_id = run_id;
        Ok(())
    }

    async fn supersede_fact(&self, current_id: i64, fact: &NewFact) -> StoreResult<FactOffer> {
        let mut state = self.state.lock().await;
        let idx = state
            .current_by_key
            .get(&fact.natural_key)
            .copied()
            .filter(|&idx| state.facts[idx].fact_id == current_id)
            .ok_or_else(|| {
                StoreError::Conflict(format!(
                    "fact {current_id} is no longer the current version of {:?}",
                    fact.natural_key
                ))
            })?;
        let closed_last_seen = state.facts[idx].last_seen_at;
        state.facts[idx].is_current = false;
        state.current_by_key.remove(&fact.natural_key);
        Ok(state.push_fact(fact, fact.seen_at.max(closed_last_seen)))
    }

    async fn fact_history(&self, natural_key: &str) -> StoreResult<Vec<FactOffer>> {
        let state = self.state.lock().await;
        let mut history = state
            .facts
            .iter()
            .filter(|f| f.natural_key == natural_key)
            .cloned()
            .collect::<Vec<_>>();
        history.sort_by(|a, b| (a.first_seen_at, a.fact_id).cmp(&(b.first_seen_at, b.fact_id)));
        Ok(history)
    }

    async fn insert_quality_run(&self, run: &QualityRun, findings: &[QualityFinding]) -> StoreResult<()> {
        let mut state = self.state.lock().await;
        if state
            .quality_runs
            .iter()
            .any(|q| q.quality_run_id == run.quality_run_id)
        {
            return Err(StoreError::Conflict(format!(
                "quality run {} already recorded",
                run.quality_run_id
            )));
        }
        state.quality_runs.push(run.clone());
        state
            .findings
            .extend(findings.iter().map(|f| (run.quality_run_id, f.clone())));
        Ok(())
    }

    async fn quality_findings(&self, run_id: Uuid) -> StoreResult<Vec<QualityFinding>> {
        let state = self.state.lock().await;
        let quality_ids = state
            .quality_runs
            .iter()
            .filter(|q| q.run_id == run_id)
            .map(|q| q.quality_run_id)
            .collect::<Vec<_>>();
        Ok(state
            .findings
            .iter()
            .filter(|(qid, _)| quality_ids.contains(qid))
            .map(|(_, f)| f.clone())
            .collect())
    }
}
