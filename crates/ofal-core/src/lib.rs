//! Core domain model for OFAL: source columns, staged rows, dimensions,
//! SCD2 fact versions, the run ledger and data-quality findings.
//!
//! Everything in this crate is pure; storage and orchestration live in
//! `ofal-storage` and `ofal-ingest`.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

pub mod catalog;
pub mod keys;
pub mod normalize;

pub use catalog::{TerritoryCatalog, TerritoryCheck, Vocabulary};
pub use keys::{natural_key, row_hash, stage_row, NATURAL_KEY_COLUMNS};
pub use normalize::{detect_header, normalize_column_name, normalize_text, HeaderMatch};

#[derive(Debug, Error)]
pub enum Error {
    #[error("header row not found in the first {scanned} rows (expected columns {expected:?})")]
    HeaderNotFound {
        scanned: usize,
        expected: Vec<&'static str>,
    },
    #[error("duplicate columns after normalization: {0:?}")]
    DuplicateColumns(Vec<String>),
    #[error("unknown run status {0:?}")]
    UnknownRunStatus(String),
    #[error("unknown finding kind {0:?}")]
    UnknownFindingKind(String),
    #[error("territory catalog needs provincia and canton columns")]
    CatalogColumns,
    #[error("vocabulary names unknown column {0:?}")]
    UnknownVocabularyColumn(String),
    #[error("unsupported vocabulary version {found} (expected {supported})")]
    VocabularyVersion { found: u32, supported: u32 },
    #[error("reading csv: {0}")]
    Csv(#[from] csv::Error),
    #[error("parsing vocabulary: {0}")]
    Yaml(#[from] serde_yaml::Error),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// The ten source columns, in the order the row hash consumes them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Column {
    InstitutionName,
    InstitutionType,
    FinancingType,
    ProgramName,
    BroadField,
    EducationLevel,
    Modality,
    Province,
    Canton,
    Status,
}

impl Column {
    pub const ALL: [Column; 10] = [
        Column::InstitutionName,
        Column::InstitutionType,
        Column::FinancingType,
        Column::ProgramName,
        Column::BroadField,
        Column::EducationLevel,
        Column::Modality,
        Column::Province,
        Column::Canton,
        Column::Status,
    ];

    /// Normalized header text as it appears in the published spreadsheet.
    pub fn header(self) -> &'static str {
        match self {
            Column::InstitutionName => "NOMBRE_IES",
            Column::InstitutionType => "TIPO_IES",
            Column::FinancingType => "TIPO_FINANCIAMIENTO",
            Column::ProgramName => "NOMBRE_CARRERA",
            Column::BroadField => "CAMPO_AMPLIO",
            Column::EducationLevel => "NIVEL_FORMACION",
            Column::Modality => "MODALIDAD",
            Column::Province => "PROVINCIA",
            Column::Canton => "CANTON",
            Column::Status => "ESTADO",
        }
    }

    /// Matches an already-normalized header name.
    pub fn from_header(normalized: &str) -> Option<Column> {
        Column::ALL.into_iter().find(|c| c.header() == normalized)
    }
}

impl fmt::Display for Column {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.header())
    }
}

/// One spreadsheet cell after type coercion.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Cell {
    Empty,
    Text(String),
    /// A cell that could not be coerced to text (e.g. a `#REF!` error cell).
    Rejected(String),
}

impl Cell {
    pub fn text(value: impl Into<String>) -> Self {
        let value = value.into();
        if value.trim().is_empty() {
            Cell::Empty
        } else {
            Cell::Text(value)
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            Cell::Text(s) => Some(s.as_str()),
            _ => None,
        }
    }
}

/// A record as read from the source table, before normalization.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct RawRow {
    /// 1-based row number in the source sheet.
    pub row_num: u32,
    pub cells: BTreeMap<Column, String>,
    #[serde(default)]
    pub rejected_cells: Vec<Column>,
}

impl RawRow {
    pub fn get(&self, column: Column) -> Option<&str> {
        self.cells.get(&column).map(String::as_str)
    }

    pub fn is_blank(&self) -> bool {
        self.cells.values().all(|v| v.trim().is_empty()) && self.rejected_cells.is_empty()
    }
}

/// Fixed typed schema of normalized values; `None` means absent or empty.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct NormalizedFields {
    pub institution_name: Option<String>,
    pub institution_type: Option<String>,
    pub financing_type: Option<String>,
    pub program_name: Option<String>,
    pub broad_field: Option<String>,
    pub education_level: Option<String>,
    pub modality: Option<String>,
    pub province: Option<String>,
    pub canton: Option<String>,
    pub status: Option<String>,
}

impl NormalizedFields {
    pub fn get(&self, column: Column) -> Option<&str> {
        let value = match column {
            Column::InstitutionName => &self.institution_name,
            Column::InstitutionType => &self.institution_type,
            Column::FinancingType => &self.financing_type,
            Column::ProgramName => &self.program_name,
            Column::BroadField => &self.broad_field,
            Column::EducationLevel => &self.education_level,
            Column::Modality => &self.modality,
            Column::Province => &self.province,
            Column::Canton => &self.canton,
            Column::Status => &self.status,
        };
        value.as_deref()
    }

    pub fn set(&mut self, column: Column, value: Option<String>) {
        let slot = match column {
            Column::InstitutionName => &mut self.institution_name,
            Column::InstitutionType => &mut self.institution_type,
            Column::FinancingType => &mut self.financing_type,
            Column::ProgramName => &mut self.program_name,
            Column::BroadField => &mut self.broad_field,
            Column::EducationLevel => &mut self.education_level,
            Column::Modality => &mut self.modality,
            Column::Province => &mut self.province,
            Column::Canton => &mut self.canton,
            Column::Status => &mut self.status,
        };
        *slot = value;
    }
}

/// Raw row plus its normalized fields and derived identity/change keys.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StagedRow {
    pub raw: RawRow,
    pub normalized: NormalizedFields,
    pub natural_key: String,
    pub row_hash: String,
}

impl StagedRow {
    pub fn row_num(&self) -> u32 {
        self.raw.row_num
    }
}

// ---------------------------------------------------------------------------
// Dimensions
// ---------------------------------------------------------------------------

pub type DimensionId = i64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DimensionKind {
    Institution,
    Territory,
    Program,
}

impl DimensionKind {
    pub fn as_str(self) -> &'static str {
        match self {
            DimensionKind::Institution => "institution",
            DimensionKind::Territory => "territory",
            DimensionKind::Program => "program",
        }
    }
}

/// Institution dimension values; identified by `name_norm`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct InstitutionRecord {
    pub name_norm: String,
    pub name_original: String,
    pub institution_type: Option<String>,
    pub financing_type: Option<String>,
}

/// Territory dimension values; identified by `(province_norm, canton_norm)`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TerritoryRecord {
    pub province_norm: String,
    pub canton_norm: String,
    pub province_original: String,
    pub canton_original: String,
}

/// Program dimension values; identified by the four normalized fields.
/// Absent optional parts are stored as empty strings so the tuple stays unique.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ProgramRecord {
    pub program_norm: String,
    pub broad_field_norm: String,
    pub level_norm: String,
    pub modality_norm: String,
    pub program_original: String,
}

impl ProgramRecord {
    pub fn identity(&self) -> (String, String, String, String) {
        (
            self.program_norm.clone(),
            self.broad_field_norm.clone(),
            self.level_norm.clone(),
            self.modality_norm.clone(),
        )
    }
}

/// A persisted dimension row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DimensionRow<T> {
    pub id: DimensionId,
    pub record: T,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DimensionRefs {
    pub institution_id: DimensionId,
    pub territory_id: DimensionId,
    pub program_id: DimensionId,
}

// ---------------------------------------------------------------------------
// Facts
// ---------------------------------------------------------------------------

/// One SCD2 version of an offering.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FactOffer {
    pub fact_id: i64,
    pub dims: DimensionRefs,
    pub status_original: Option<String>,
    pub status_norm: Option<String>,
    pub natural_key: String,
    pub row_hash: String,
    pub first_seen_at: DateTime<Utc>,
    pub last_seen_at: DateTime<Utc>,
    pub last_run_id: Uuid,
    pub is_current: bool,
}

/// Values for a new current fact version.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewFact {
    pub dims: DimensionRefs,
    pub status_original: Option<String>,
    pub status_norm: Option<String>,
    pub natural_key: String,
    pub row_hash: String,
    pub seen_at: DateTime<Utc>,
    pub run_id: Uuid,
}

// ---------------------------------------------------------------------------
// Run ledger
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Running,
    Success,
    Failed,
    Skipped,
}

impl RunStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            RunStatus::Running => "running",
            RunStatus::Success => "success",
            RunStatus::Failed => "failed",
            RunStatus::Skipped => "skipped",
        }
    }

    pub fn is_terminal(self) -> bool {
        !matches!(self, RunStatus::Running)
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RunStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "running" => Ok(RunStatus::Running),
            "success" => Ok(RunStatus::Success),
            "failed" => Ok(RunStatus::Failed),
            "skipped" => Ok(RunStatus::Skipped),
            other => Err(Error::UnknownRunStatus(other.to_string())),
        }
    }
}

/// Aggregate counters recorded on the ledger row when a run finishes.
/// Rows that never finished carry `{}`, which reads back as all zeros.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RunCounters {
    pub rows_loaded: u64,
    pub new: u64,
    pub updated: u64,
    pub unchanged: u64,
    pub skipped_missing_dims: u64,
    pub row_conflicts: u64,
    pub duplicates_in_file: u64,
    pub invalid_territory: u64,
    pub conflicting_status: u64,
    pub invalid_category: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewIngestRun {
    pub checksum_sha256: String,
    pub file_name: String,
    pub file_size_bytes: u64,
    pub started_at: DateTime<Utc>,
}

/// Terminal values written by `finish_run`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunFinish {
    pub status: RunStatus,
    pub finished_at: DateTime<Utc>,
    pub counters: RunCounters,
    pub notes: Option<String>,
    pub process_metrics: serde_json::Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IngestRun {
    pub run_id: Uuid,
    pub checksum_sha256: String,
    pub file_name: String,
    pub file_size_bytes: u64,
    pub status: RunStatus,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub duration_seconds: Option<f64>,
    pub counters: RunCounters,
    pub notes: Option<String>,
    /// For skipped attempts, the run that already owns the checksum.
    pub duplicate_of: Option<Uuid>,
    pub process_metrics: serde_json::Value,
}

impl IngestRun {
    pub fn started(run_id: Uuid, new: NewIngestRun) -> Self {
        Self {
            run_id,
            checksum_sha256: new.checksum_sha256,
            file_name: new.file_name,
            file_size_bytes: new.file_size_bytes,
            status: RunStatus::Running,
            started_at: new.started_at,
            finished_at: None,
            duration_seconds: None,
            counters: RunCounters::default(),
            notes: None,
            duplicate_of: None,
            process_metrics: serde_json::Value::Null,
        }
    }

    pub fn apply_finish(&mut self, finish: RunFinish) {
        let elapsed = finish.finished_at - self.started_at;
        self.status = finish.status;
        self.finished_at = Some(finish.finished_at);
        self.duration_seconds = Some(elapsed.num_milliseconds().max(0) as f64 / 1000.0);
        self.counters = finish.counters;
        self.notes = finish.notes;
        self.process_metrics = finish.process_metrics;
    }
}

// ---------------------------------------------------------------------------
// Data quality
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FindingKind {
    DuplicateInFile,
    ConflictingStatus,
    InvalidTerritory,
    InvalidCategory,
    MissingField,
}

impl FindingKind {
    pub const ALL: [FindingKind; 5] = [
        FindingKind::DuplicateInFile,
        FindingKind::ConflictingStatus,
        FindingKind::InvalidTerritory,
        FindingKind::InvalidCategory,
        FindingKind::MissingField,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            FindingKind::DuplicateInFile => "duplicate_in_file",
            FindingKind::ConflictingStatus => "conflicting_status",
            FindingKind::InvalidTerritory => "invalid_territory",
            FindingKind::InvalidCategory => "invalid_category",
            FindingKind::MissingField => "missing_field",
        }
    }
}

impl fmt::Display for FindingKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for FindingKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        FindingKind::ALL
            .into_iter()
            .find(|k| k.as_str() == s)
            .ok_or_else(|| Error::UnknownFindingKind(s.to_string()))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QualityFinding {
    pub finding_id: Uuid,
    pub kind: FindingKind,
    pub natural_key: Option<String>,
    pub row_num: Option<u32>,
    /// True when the offending row was excluded from fact versioning.
    pub row_skipped: bool,
    pub detail: serde_json::Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QualityRun {
    pub quality_run_id: Uuid,
    pub run_id: Uuid,
    pub created_at: DateTime<Utc>,
    pub metrics: serde_json::Value,
}
