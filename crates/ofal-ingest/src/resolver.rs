//! Resolves staged rows to dimension ids via atomic upserts, memoized per run.

use std::collections::{BTreeSet, HashMap};

use chrono::{DateTime, Utc};
use ofal_core::{
    Column, DimensionId, DimensionKind, DimensionRefs, InstitutionRecord, ProgramRecord,
    StagedRow, TerritoryCatalog, TerritoryCheck, TerritoryRecord,
};
use ofal_storage::{with_retry, BackoffPolicy, OfferStore, StoreResult};
use tracing::debug;

/// Trimmed original text of a cell, for the `*_original` attributes.
fn original(row: &StagedRow, column: Column) -> String {
    row.raw.get(column).map(str::trim).unwrap_or_default().to_string()
}

pub fn institution_record(row: &StagedRow) -> Option<InstitutionRecord> {
    let fields = &row.normalized;
    Some(InstitutionRecord {
        name_norm: fields.institution_name.clone()?,
        name_original: original(row, Column::InstitutionName),
        institution_type: fields.institution_type.clone(),
        financing_type: fields.financing_type.clone(),
    })
}

/// Only catalog-valid pairs become territory records.
pub fn territory_record(
    row: &StagedRow,
    catalog: &TerritoryCatalog,
) -> Result<TerritoryRecord, TerritoryCheck> {
    let fields = &row.normalized;
    match catalog.check(fields.province.as_deref(), fields.canton.as_deref()) {
        TerritoryCheck::Valid => Ok(TerritoryRecord {
            province_norm: fields.province.clone().unwrap_or_default(),
            canton_norm: fields.canton.clone().unwrap_or_default(),
            province_original: original(row, Column::Province),
            canton_original: original(row, Column::Canton),
        }),
        other => Err(other),
    }
}

pub fn program_record(row: &StagedRow) -> Option<ProgramRecord> {
    let fields = &row.normalized;
    Some(ProgramRecord {
        program_norm: fields.program_name.clone()?,
        broad_field_norm: fields.broad_field.clone().unwrap_or_default(),
        level_norm: fields.education_level.clone().unwrap_or_default(),
        modality_norm: fields.modality.clone().unwrap_or_default(),
        program_original: original(row, Column::ProgramName),
    })
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SkippedRow {
    /// Index into the staged batch.
    pub index: usize,
    pub row_num: u32,
    pub natural_key: String,
    pub missing: Vec<DimensionKind>,
}

#[derive(Debug, Clone, Default)]
pub struct Resolution {
    /// `(index into the staged batch, dimension ids)`, in batch order.
    pub resolved: Vec<(usize, DimensionRefs)>,
    pub skipped: Vec<SkippedRow>,
    pub store_calls: usize,
}

impl Resolution {
    pub fn skipped_row_nums(&self) -> BTreeSet<u32> {
        self.skipped.iter().map(|s| s.row_num).collect()
    }
}

pub struct DimensionResolver<'a> {
    store: &'a dyn OfferStore,
    catalog: &'a TerritoryCatalog,
    policy: BackoffPolicy,
    now: DateTime<Utc>,
    institutions: HashMap<InstitutionRecord, DimensionId>,
    territories: HashMap<TerritoryRecord, DimensionId>,
    programs: HashMap<ProgramRecord, DimensionId>,
    store_calls: usize,
}

impl<'a> DimensionResolver<'a> {
    pub fn new(
        store: &'a dyn OfferStore,
        catalog: &'a TerritoryCatalog,
        policy: BackoffPolicy,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            store,
            catalog,
            policy,
            now,
            institutions: HashMap::new(),
            territories: HashMap::new(),
            programs: HashMap::new(),
            store_calls: 0,
        }
    }

    /// Resolve every row. A row missing any dimension is skipped, never fatal;
    /// storage errors (after retries) are.
    pub async fn resolve_all(mut self, rows: &[StagedRow]) -> StoreResult<Resolution> {
        let mut resolution = Resolution::default();
        for (index, row) in rows.iter().enumerate() {
            match self.resolve_row(row).await? {
                Ok(refs) => resolution.resolved.push((index, refs)),
                Err(missing) => {
                    debug!(row_num = row.row_num(), ?missing, "row skipped: missing dimensions");
                    resolution.skipped.push(SkippedRow {
                        index,
                        row_num: row.row_num(),
                        natural_key: row.natural_key.clone(),
                        missing,
                    });
                }
            }
        }
        resolution.store_calls = self.store_calls;
        Ok(resolution)
    }

    pub async fn resolve_row(
        &mut self,
        row: &StagedRow,
    ) -> StoreResult<Result<DimensionRefs, Vec<DimensionKind>>> {
        let mut missing = Vec::new();

        let institution = match institution_record(row) {
            Some(record) => Some(self.institution_id(record).await?),
            None => {
                missing.push(DimensionKind::Institution);
                None
            }
        };
        let territory = match territory_record(row, self.catalog) {
            Ok(record) => Some(self.territory_id(record).await?),
            Err(_) => {
                missing.push(DimensionKind::Territory);
                None
            }
        };
        let program = match program_record(row) {
            Some(record) => Some(self.program_id(record).await?),
            None => {
                missing.push(DimensionKind::Program);
                None
            }
        };

        Ok(match (institution, territory, program) {
            (Some(institution_id), Some(territory_id), Some(program_id)) => Ok(DimensionRefs {
                institution_id,
                territory_id,
                program_id,
            }),
            _ => Err(missing),
        })
    }

    async fn institution_id(&mut self, record: InstitutionRecord) -> StoreResult<DimensionId> {
        if let Some(id) = self.institutions.get(&record) {
            return Ok(*id);
        }
        let (store, now) = (self.store, self.now);
        let id = with_retry(&self.policy, "upsert_institution", || {
            store.upsert_institution(&record, now)
        })
        .await?;
        self.store_calls += 1;
        self.institutions.insert(record, id);
        Ok(id)
    }

    async fn territory_id(&mut self, record: TerritoryRecord) -> StoreResult<DimensionId> {
        if let Some(id) = self.territories.get(&record) {
            return Ok(*id);
        }
        let (store, now) = (self.store, self.now);
        let id = with_retry(&self.policy, "upsert_territory", || {
            store.upsert_territory(&record, now)
        })
        .await?;
        self.store_calls += 1;
        self.territories.insert(record, id);
        Ok(id)
    }

    async fn program_id(&mut self, record: ProgramRecord) -> StoreResult<DimensionId> {
        if let Some(id) = self.programs.get(&record) {
            return Ok(*id);
        }
        let (store, now) = (self.store, self.now);
        let id = with_retry(&self.policy, "upsert_program", || store.upsert_program(&record, now))
            .await?;
        self.store_calls += 1;
        self.programs.insert(record, id);
        Ok(id)
    }
}
