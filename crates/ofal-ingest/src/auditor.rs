//! Data-quality detectors over a staged batch. Findings are informational:
//! they never change what gets loaded, only record it.

use std::collections::{BTreeMap, BTreeSet, HashSet};

use ofal_core::{
    Column, FindingKind, QualityFinding, StagedRow, TerritoryCatalog, Vocabulary,
};
use serde_json::{json, Value};
use uuid::Uuid;

/// Columns whose absence makes a row unusable.
const CRITICAL_COLUMNS: [Column; 2] = [Column::InstitutionName, Column::ProgramName];

#[derive(Debug, Clone, Default)]
pub struct AuditReport {
    pub findings: Vec<QualityFinding>,
    pub counts: BTreeMap<FindingKind, u64>,
    pub metrics: Value,
}

impl AuditReport {
    pub fn count(&self, kind: FindingKind) -> u64 {
        self.counts.get(&kind).copied().unwrap_or(0)
    }

    pub fn of_kind(&self, kind: FindingKind) -> impl Iterator<Item = &QualityFinding> {
        self.findings.iter().filter(move |f| f.kind == kind)
    }
}

pub struct QualityAuditor<'a> {
    catalog: &'a TerritoryCatalog,
    vocabulary: &'a Vocabulary,
}

impl<'a> QualityAuditor<'a> {
    pub fn new(catalog: &'a TerritoryCatalog, vocabulary: &'a Vocabulary) -> Self {
        Self { catalog, vocabulary }
    }

    /// `skipped_rows` holds the row numbers excluded from versioning, so each
    /// finding can say whether its row was loaded.
    pub fn audit(&self, rows: &[StagedRow], skipped_rows: &BTreeSet<u32>) -> AuditReport {
        let mut findings = Vec::new();
        let skipped = |row_num: u32| skipped_rows.contains(&row_num);

        let mut by_key: BTreeMap<&str, Vec<&StagedRow>> = BTreeMap::new();
        for row in rows {
            by_key.entry(row.natural_key.as_str()).or_default().push(row);
        }

        for (key, occurrences) in &by_key {
            if occurrences.len() > 1 {
                let first_row_num = occurrences[0].row_num();
                for (i, row) in occurrences.iter().enumerate().skip(1) {
                    findings.push(finding(
                        FindingKind::DuplicateInFile,
                        Some(*key),
                        Some(row.row_num()),
                        skipped(row.row_num()),
                        json!({
                            "occurrence": i + 1,
                            "occurrences": occurrences.len(),
                            "first_row_num": first_row_num,
                        }),
                    ));
                }
            }

            let statuses = occurrences
                .iter()
                .filter_map(|r| r.normalized.status.as_deref())
                .collect::<BTreeSet<_>>();
            if statuses.len() > 1 {
                let last = occurrences[occurrences.len() - 1];
                findings.push(finding(
                    FindingKind::ConflictingStatus,
                    Some(*key),
                    None,
                    skipped(last.row_num()),
                    json!({
                        "statuses": statuses,
                        "chosen": last.normalized.status,
                        "rule": "last_occurrence_wins",
                        "row_nums": occurrences.iter().map(|r| r.row_num()).collect::<Vec<_>>(),
                    }),
                ));
            }
        }

        for row in rows {
            let fields = &row.normalized;
            let row_num = row.row_num();
            let key = Some(row.natural_key.as_str());

            let check = self
                .catalog
                .check(fields.province.as_deref(), fields.canton.as_deref());
            if !check.is_valid() {
                findings.push(finding(
                    FindingKind::InvalidTerritory,
                    key,
                    Some(row_num),
                    skipped(row_num),
                    json!({
                        "reason": check.reason(),
                        "province": fields.province,
                        "canton": fields.canton,
                    }),
                ));
            }

            for column in self.vocabulary.controlled_columns() {
                let Some(value) = fields.get(column) else {
                    continue;
                };
                if self.vocabulary.allows(column, value) == Some(false) {
                    findings.push(finding(
                        FindingKind::InvalidCategory,
                        key,
                        Some(row_num),
                        skipped(row_num),
                        json!({ "column": column.header(), "value": value }),
                    ));
                }
            }

            for column in &row.raw.rejected_cells {
                findings.push(finding(
                    FindingKind::MissingField,
                    key,
                    Some(row_num),
                    skipped(row_num),
                    json!({ "column": column.header(), "reason": "rejected_cell" }),
                ));
            }
            for column in CRITICAL_COLUMNS {
                if fields.get(column).is_none() && !row.raw.rejected_cells.contains(&column) {
                    findings.push(finding(
                        FindingKind::MissingField,
                        key,
                        Some(row_num),
                        skipped(row_num),
                        json!({ "column": column.header(), "reason": "missing" }),
                    ));
                }
            }
        }

        findings.sort_by(|a, b| {
            (a.kind, a.row_num, &a.natural_key).cmp(&(b.kind, b.row_num, &b.natural_key))
        });

        let mut counts = FindingKind::ALL
            .into_iter()
            .map(|k| (k, 0u64))
            .collect::<BTreeMap<_, _>>();
        for f in &findings {
            *counts.entry(f.kind).or_default() += 1;
        }

        let metrics = batch_metrics(rows, by_key.len(), skipped_rows.len(), &counts);
        AuditReport {
            findings,
            counts,
            metrics,
        }
    }
}

fn finding(
    kind: FindingKind,
    natural_key: Option<&str>,
    row_num: Option<u32>,
    row_skipped: bool,
    detail: Value,
) -> QualityFinding {
    QualityFinding {
        finding_id: Uuid::new_v4(),
        kind,
        natural_key: natural_key.map(str::to_string),
        row_num,
        row_skipped,
        detail,
    }
}

fn distinct<F>(rows: &[StagedRow], identity: F) -> usize
where
    F: Fn(&StagedRow) -> Option<String>,
{
    rows.iter().filter_map(identity).collect::<HashSet<_>>().len()
}

fn batch_metrics(
    rows: &[StagedRow],
    natural_keys: usize,
    rows_skipped: usize,
    counts: &BTreeMap<FindingKind, u64>,
) -> Value {
    let institutions = distinct(rows, |r| r.normalized.institution_name.clone());
    let territories = distinct(rows, |r| {
        let f = &r.normalized;
        Some(format!("{}|{}", f.province.as_deref()?, f.canton.as_deref()?))
    });
    let programs = distinct(rows, |r| {
        let f = &r.normalized;
        Some(format!(
            "{}|{}|{}|{}",
            f.program_name.as_deref()?,
            f.broad_field.as_deref().unwrap_or(""),
            f.education_level.as_deref().unwrap_or(""),
            f.modality.as_deref().unwrap_or(""),
        ))
    });
    let findings = counts
        .iter()
        .map(|(kind, n)| (kind.as_str().to_string(), json!(n)))
        .collect::<serde_json::Map<_, _>>();

    json!({
        "rows": rows.len(),
        "rows_skipped": rows_skipped,
        "unique": {
            "natural_keys": natural_keys,
            "institutions": institutions,
            "territories": territories,
            "programs": programs,
        },
        "findings": findings,
    })
}
