//! Run ledger: one row per ingestion attempt, keyed by the file checksum.

use chrono::{DateTime, Utc};
use ofal_core::{IngestRun, NewIngestRun, RunFinish, RunStatus};
use ofal_storage::{with_retry, BackoffPolicy, OfferStore, StoreError, StoreResult};
use tracing::{info, warn};
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq)]
pub enum BeginOutcome {
    Started(IngestRun),
    /// A successful run already ingested these bytes.
    DuplicateFile { existing: IngestRun },
    /// Another run holds these bytes right now (or died holding them).
    RunInProgress { existing: IngestRun },
}

impl BeginOutcome {
    pub fn existing(&self) -> Option<&IngestRun> {
        match self {
            BeginOutcome::Started(_) => None,
            BeginOutcome::DuplicateFile { existing } | BeginOutcome::RunInProgress { existing } => {
                Some(existing)
            }
        }
    }
}

pub struct RunLedger<'a> {
    store: &'a dyn OfferStore,
    policy: BackoffPolicy,
}

impl<'a> RunLedger<'a> {
    pub fn new(store: &'a dyn OfferStore, policy: BackoffPolicy) -> Self {
        Self { store, policy }
    }

    /// Claim the checksum with a `running` row. The claim is decided by the
    /// store's uniqueness constraint, so two concurrent callers cannot both
    /// start.
    pub async fn begin(&self, run_id: Uuid, new: &NewIngestRun) -> StoreResult<BeginOutcome> {
        let store = self.store;
        for _ in 0..2 {
            match with_retry(&self.policy, "insert_running_run", || {
                store.insert_running_run(run_id, new)
            })
            .await
            {
                Ok(run) => return Ok(BeginOutcome::Started(run)),
                Err(err) if err.is_conflict() => {
                    let existing = with_retry(&self.policy, "active_run_for_checksum", || {
                        store.active_run_for_checksum(&new.checksum_sha256)
                    })
                    .await?;
                    match existing {
                        // A retried insert that had in fact committed.
                        Some(run) if run.run_id == run_id => return Ok(BeginOutcome::Started(run)),
                        Some(run) if run.status == RunStatus::Success => {
                            return Ok(BeginOutcome::DuplicateFile { existing: run })
                        }
                        Some(run) => return Ok(BeginOutcome::RunInProgress { existing: run }),
                        // The owner finished as failed in between; claim again.
                        None => continue,
                    }
                }
                Err(err) => return Err(err),
            }
        }
        Err(StoreError::Conflict(format!(
            "could not claim checksum {}",
            new.checksum_sha256
        )))
    }

    /// Record a short-circuited attempt pointing at the run that owns the
    /// checksum.
    pub async fn record_skipped(
        &self,
        run_id: Uuid,
        new: &NewIngestRun,
        outcome: &BeginOutcome,
    ) -> StoreResult<Option<IngestRun>> {
        let (existing, notes) = match outcome {
            BeginOutcome::Started(_) => return Ok(None),
            BeginOutcome::DuplicateFile { existing } => (
                existing,
                format!("duplicate of successful run {}", existing.run_id),
            ),
            BeginOutcome::RunInProgress { existing } => (
                existing,
                format!("run {} is still processing this file", existing.run_id),
            ),
        };
        let store = self.store;
        let run = with_retry(&self.policy, "insert_skipped_run", || {
            store.insert_skipped_run(run_id, new, existing.run_id, &notes)
        })
        .await?;
        warn!(%run_id, duplicate_of = %existing.run_id, checksum = %new.checksum_sha256, "{notes}; skipped");
        Ok(Some(run))
    }

    pub async fn finish(&self, run_id: Uuid, finish: &RunFinish) -> StoreResult<IngestRun> {
        let store = self.store;
        let run = with_retry(&self.policy, "finish_run", || store.finish_run(run_id, finish)).await?;
        info!(
            %run_id,
            status = %run.status,
            duration_seconds = run.duration_seconds.unwrap_or_default(),
            "run finished"
        );
        Ok(run)
    }

    /// Fail every `running` row older than `timeout`, releasing its checksum.
    pub async fn reconcile_stale(
        &self,
        now: DateTime<Utc>,
        timeout: chrono::Duration,
    ) -> StoreResult<Vec<IngestRun>> {
        let cutoff = now - timeout;
        let note = format!(
            "abandoned: still running after {} minutes",
            timeout.num_minutes()
        );
        let store = self.store;
        let abandoned = with_retry(&self.policy, "abandon_runs_started_before", || {
            store.abandon_runs_started_before(cutoff, now, &note)
        })
        .await?;
        for run in &abandoned {
            warn!(run_id = %run.run_id, started_at = %run.started_at, "stale run marked failed");
        }
        Ok(abandoned)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use ofal_core::RunCounters;
    use ofal_storage::MemoryStore;

    fn ts(hour: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 1, hour, 0, 0).single().unwrap()
    }

    fn new_run(hour: u32) -> NewIngestRun {
        NewIngestRun {
            checksum_sha256: "c0ffee".into(),
            file_name: "oferta.xlsx".into(),
            file_size_bytes: 1024,
            started_at: ts(hour),
        }
    }

    fn success(hour: u32) -> RunFinish {
        RunFinish {
            status: RunStatus::Success,
            finished_at: ts(hour),
            counters: RunCounters::default(),
            notes: None,
            process_metrics: serde_json::json!({}),
        }
    }

    #[tokio::test]
    async fn second_claim_on_a_successful_file_is_a_duplicate() {
        let store = MemoryStore::new();
        let ledger = RunLedger::new(&store, BackoffPolicy::default());

        let first_id = Uuid::new_v4();
        assert!(matches!(
            ledger.begin(first_id, &new_run(1)).await.unwrap(),
            BeginOutcome::Started(_)
        ));

        let in_progress = ledger.begin(Uuid::new_v4(), &new_run(2)).await.unwrap();
        assert!(matches!(in_progress, BeginOutcome::RunInProgress { ref existing } if existing.run_id == first_id));

        ledger.finish(first_id, &success(3)).await.unwrap();

        let second_id = Uuid::new_v4();
        let outcome = ledger.begin(second_id, &new_run(4)).await.unwrap();
        assert!(matches!(outcome, BeginOutcome::DuplicateFile { ref existing } if existing.run_id == first_id));

        let skipped = ledger
            .record_skipped(second_id, &new_run(4), &outcome)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(skipped.status, RunStatus::Skipped);
        assert_eq!(skipped.duplicate_of, Some(first_id));
        assert_eq!(store.list_runs(10).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn finishing_twice_is_rejected() {
        let store = MemoryStore::new();
        let ledger = RunLedger::new(&store, BackoffPolicy::default());
        let run_id = Uuid::new_v4();
        ledger.begin(run_id, &new_run(1)).await.unwrap();
        let run = ledger.finish(run_id, &success(2)).await.unwrap();
        assert_eq!(run.duration_seconds, Some(3600.0));
        assert!(ledger.finish(run_id, &success(3)).await.unwrap_err().is_conflict());
    }

    #[tokio::test]
    async fn reconcile_releases_the_checksum_of_stale_runs() {
        let store = MemoryStore::new();
        let ledger = RunLedger::new(&store, BackoffPolicy::default());
        let stuck = Uuid::new_v4();
        ledger.begin(stuck, &new_run(1)).await.unwrap();

        let abandoned = ledger
            .reconcile_stale(ts(4), chrono::Duration::minutes(120))
            .await
            .unwrap();
        assert_eq!(abandoned.len(), 1);
        assert_eq!(abandoned[0].status, RunStatus::Failed);
        assert!(abandoned[0]
            .notes
            .as_deref()
            .unwrap_or_default()
            .starts_with("abandoned"));

        let retry = ledger.begin(Uuid::new_v4(), &new_run(5)).await.unwrap();
        assert!(matches!(retry, BeginOutcome::Started(_)));
    }

    #[tokio::test]
    async fn recent_running_rows_survive_reconcile() {
        let store = MemoryStore::new();
        let ledger = RunLedger::new(&store, BackoffPolicy::default());
        ledger.begin(Uuid::new_v4(), &new_run(3)).await.unwrap();
        let abandoned = ledger
            .reconcile_stale(ts(4), chrono::Duration::minutes(120))
            .await
            .unwrap();
        assert!(abandoned.is_empty());
    }
}
