//! Ingestion pipeline: load a source file, normalize and stage its rows,
//! resolve dimensions, version facts (SCD2), audit data quality and close
//! the run in the ledger.

use std::path::PathBuf;

use ofal_storage::StoreError;
use thiserror::Error;
use uuid::Uuid;

pub mod auditor;
pub mod config;
pub mod ledger;
pub mod pipeline;
pub mod reports;
pub mod resolver;
pub mod table;
pub mod versioner;

pub use auditor::{AuditReport, QualityAuditor};
pub use config::{IngestConfig, ReferenceData};
pub use ledger::{BeginOutcome, RunLedger};
pub use pipeline::{IngestOutcome, IngestPipeline};
pub use resolver::{DimensionResolver, Resolution};
pub use versioner::{FactVersioner, VersionCounts};

#[derive(Debug, Error)]
pub enum IngestError {
    #[error("reading {}: {source}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("unsupported source format: {0}")]
    UnsupportedFormat(String),
    #[error("opening workbook: {0}")]
    Workbook(#[from] calamine::Error),
    #[error("workbook has no sheets")]
    EmptyWorkbook,
    #[error("reading csv: {0}")]
    Csv(#[from] csv::Error),
    #[error(transparent)]
    Table(#[from] ofal_core::Error),
    #[error("storage: {0}")]
    Store(#[from] StoreError),
    #[error("archiving source: {0:#}")]
    Archive(anyhow::Error),
    #[error("writing reports: {0:#}")]
    Reports(anyhow::Error),
    #[error("run {run_id} failed: {source}")]
    RunFailed {
        run_id: Uuid,
        #[source]
        source: Box<IngestError>,
    },
}

impl IngestError {
    pub fn run_id(&self) -> Option<Uuid> {
        match self {
            IngestError::RunFailed { run_id, .. } => Some(*run_id),
            _ => None,
        }
    }
}
