//! SCD2 fact versioning against the current version of each natural key.
//!
//! | current | hash    | action                                  |
//! |---------|---------|-----------------------------------------|
//! | absent  |         | insert a current version                |
//! | present | equal   | advance `last_seen_at`                  |
//! | present | differs | close it and insert a new current one   |

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use ofal_core::{DimensionRefs, NewFact, StagedRow};
use ofal_storage::{with_retry, BackoffPolicy, OfferStore, StoreResult};
use serde::Serialize;
use tracing::warn;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    Inserted,
    Touched,
    Superseded,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct VersionCounts {
    pub new: u64,
    pub updated: u64,
    pub unchanged: u64,
    pub row_conflicts: u64,
}

impl VersionCounts {
    fn record(&mut self, transition: Transition) {
        match transition {
            Transition::Inserted => self.new += 1,
            Transition::Touched => self.unchanged += 1,
            Transition::Superseded => self.updated += 1,
        }
    }
}

/// One row per natural key: the last resolved occurrence in file order.
/// Keys keep the order of their first appearance.
pub fn latest_per_key<'r>(
    rows: &'r [StagedRow],
    resolved: &[(usize, DimensionRefs)],
) -> Vec<(&'r StagedRow, DimensionRefs)> {
    let mut order: Vec<&str> = Vec::new();
    let mut latest: HashMap<&str, (&StagedRow, DimensionRefs)> = HashMap::new();
    for (index, refs) in resolved {
        let Some(row) = rows.get(*index) else {
            continue;
        };
        let key = row.natural_key.as_str();
        if latest.insert(key, (row, *refs)).is_none() {
            order.push(key);
        }
    }
    order
        .into_iter()
        .filter_map(|key| latest.remove(key))
        .collect()
}

pub struct FactVersioner<'a> {
    store: &'a dyn OfferStore,
    policy: BackoffPolicy,
    run_id: Uuid,
    seen_at: DateTime<Utc>,
}

impl<'a> FactVersioner<'a> {
    pub fn new(
        store: &'a dyn OfferStore,
        policy: BackoffPolicy,
        run_id: Uuid,
        seen_at: DateTime<Utc>,
    ) -> Self {
        Self {
            store,
            policy,
            run_id,
            seen_at,
        }
    }

    pub async fn version_all(
        &self,
        candidates: &[(&StagedRow, DimensionRefs)],
    ) -> StoreResult<VersionCounts> {
        let mut counts = VersionCounts::default();
        for (row, dims) in candidates {
            match self.apply(row, *dims).await? {
                Some(transition) => counts.record(transition),
                None => counts.row_conflicts += 1,
            }
        }
        Ok(counts)
    }

    /// Apply one transition. A constraint conflict means another writer
    /// moved the key; re-read and try once more, then give up on the row
    /// (`Ok(None)`).
    pub async fn apply(&self, row: &StagedRow, dims: DimensionRefs) -> StoreResult<Option<Transition>> {
        let fact = NewFact {
            dims,
            status_original: row
                .raw
                .get(ofal_core::Column::Status)
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string),
            status_norm: row.normalized.status.clone(),
            natural_key: row.natural_key.clone(),
            row_hash: row.row_hash.clone(),
            seen_at: self.seen_at,
            run_id: self.run_id,
        };

        for attempt in 0..2 {
            let store = self.store;
            let current = with_retry(&self.policy, "current_fact", || {
                store.current_fact(&fact.natural_key)
            })
            .await?;

            let result = match &current {
                None => with_retry(&self.policy, "insert_current_fact", || {
                    store.insert_current_fact(&fact)
                })
                .await
                .map(|_| Transition::Inserted),
                Some(existing) if existing.row_hash == fact.row_hash => {
                    with_retry(&self.policy, "touch_fact", || {
                        store.touch_fact(existing.fact_id, fact.seen_at, fact.run_id)
                    })
                    .await
                    .map(|_| Transition::Touched)
                }
                Some(existing) => with_retry(&self.policy, "supersede_fact", || {
                    store.supersede_fact(existing.fact_id, &fact)
                })
                .await
                .map(|_| Transition::Superseded),
            };

            match result {
                Ok(transition) => return Ok(Some(transition)),
                Err(err) if err.is_conflict() && attempt == 0 => continue,
                Err(err) if err.is_conflict() => {
                    warn!(
                        natural_key = %fact.natural_key,
                        row_num = row.row_num(),
                        error = %err,
                        "fact transition lost a race twice; row left unversioned"
                    );
                    return Ok(None);
                }
                Err(err) => return Err(err),
            }
        }
        Ok(None)
    }
}
