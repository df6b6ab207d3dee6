//! Per-run data-quality artifacts under `<reports_dir>/<run_id>/`.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use askama::Template;
use chrono::{DateTime, Utc};
use ofal_core::{QualityFinding, RunCounters};
use serde::Serialize;
use tokio::fs;
use uuid::Uuid;

use crate::AuditReport;

pub const DATA_QUALITY_JSON: &str = "data_quality.json";
pub const INCONSISTENCIES_CSV: &str = "inconsistencies.csv";
pub const DATA_QUALITY_HTML: &str = "data_quality.html";

/// Findings listed in the HTML summary; the CSV always has all of them.
const HTML_FINDINGS_PREVIEW: usize = 200;

#[derive(Debug, Serialize)]
struct DataQualityReport<'a> {
    run_id: Uuid,
    file_name: &'a str,
    checksum_sha256: &'a str,
    generated_at: DateTime<Utc>,
    counters: &'a RunCounters,
    metrics: &'a serde_json::Value,
    findings: &'a [QualityFinding],
}

#[derive(Debug, Serialize)]
struct InconsistencyRow<'a> {
    kind: &'a str,
    natural_key: &'a str,
    row_num: Option<u32>,
    row_skipped: bool,
    detail: String,
}

struct NameValue {
    name: String,
    value: String,
}

struct FindingLine {
    kind: &'static str,
    row_num: String,
    row_skipped: bool,
    natural_key: String,
    detail: String,
}

#[derive(Template)]
#[template(path = "data_quality.html")]
struct DataQualityHtml<'a> {
    run_id: Uuid,
    file_name: &'a str,
    checksum_sha256: &'a str,
    generated_at: String,
    counters: Vec<NameValue>,
    metrics: Vec<NameValue>,
    findings: Vec<FindingLine>,
    total_findings: usize,
}

pub struct RunReportInput<'a> {
    pub run_id: Uuid,
    pub file_name: &'a str,
    pub checksum_sha256: &'a str,
    pub generated_at: DateTime<Utc>,
    pub counters: &'a RunCounters,
    pub audit: &'a AuditReport,
}

pub async fn write_run_reports(reports_root: &Path, input: &RunReportInput<'_>) -> Result<PathBuf> {
    let reports_dir = reports_root.join(input.run_id.to_string());
    fs::create_dir_all(&reports_dir)
        .await
        .with_context(|| format!("creating {}", reports_dir.display()))?;

    let report = DataQualityReport {
        run_id: input.run_id,
        file_name: input.file_name,
        checksum_sha256: input.checksum_sha256,
        generated_at: input.generated_at,
        counters: input.counters,
        metrics: &input.audit.metrics,
        findings: &input.audit.findings,
    };
    let json = serde_json::to_vec_pretty(&report).context("serializing data quality report")?;
    fs::write(reports_dir.join(DATA_QUALITY_JSON), json)
        .await
        .with_context(|| format!("writing {DATA_QUALITY_JSON}"))?;

    let csv = inconsistencies_csv(&input.audit.findings)?;
    fs::write(reports_dir.join(INCONSISTENCIES_CSV), csv)
        .await
        .with_context(|| format!("writing {INCONSISTENCIES_CSV}"))?;

    let html = data_quality_html(input)?;
    fs::write(reports_dir.join(DATA_QUALITY_HTML), html)
        .await
        .with_context(|| format!("writing {DATA_QUALITY_HTML}"))?;

    Ok(reports_dir)
}

fn inconsistencies_csv(findings: &[QualityFinding]) -> Result<Vec<u8>> {
    let mut writer = csv::Writer::from_writer(Vec::new());
    for finding in findings {
        writer.serialize(InconsistencyRow {
            kind: finding.kind.as_str(),
            natural_key: finding.natural_key.as_deref().unwrap_or_default(),
            row_num: finding.row_num,
            row_skipped: finding.row_skipped,
            detail: finding.detail.to_string(),
        })?;
    }
    writer
        .into_inner()
        .map_err(|err| anyhow::anyhow!("flushing inconsistencies csv: {}", err.error()))
}

fn data_quality_html(input: &RunReportInput<'_>) -> Result<String> {
    let mut counters = Vec::new();
    flatten_json("", &serde_json::to_value(input.counters)?, &mut counters);
    let mut metrics = Vec::new();
    flatten_json("", &input.audit.metrics, &mut metrics);

    let findings = input
        .audit
        .findings
        .iter()
        .take(HTML_FINDINGS_PREVIEW)
        .map(|finding| FindingLine {
            kind: finding.kind.as_str(),
            row_num: finding.row_num.map(|n| n.to_string()).unwrap_or_default(),
            row_skipped: finding.row_skipped,
            natural_key: finding.natural_key.clone().unwrap_or_default(),
            detail: finding.detail.to_string(),
        })
        .collect();

    DataQualityHtml {
        run_id: input.run_id,
        file_name: input.file_name,
        checksum_sha256: input.checksum_sha256,
        generated_at: input.generated_at.to_rfc3339(),
        counters,
        metrics,
        findings,
        total_findings: input.audit.findings.len(),
    }
    .render()
    .context("rendering data quality html")
}

/// Nested objects become dotted names (`unique.institutions`).
fn flatten_json(prefix: &str, value: &serde_json::Value, out: &mut Vec<NameValue>) {
    match value {
        serde_json::Value::Object(map) => {
            for (key, nested) in map {
                let name = if prefix.is_empty() {
                    key.clone()
                } else {
                    format!("{prefix}.{key}")
                };
                flatten_json(&name, nested, out);
            }
        }
        other => out.push(NameValue {
            name: prefix.to_string(),
            value: match other {
                serde_json::Value::String(text) => text.clone(),
                _ => other.to_string(),
            },
        }),
    }
}
