//! Deterministic text normalization and header-row detection.

use std::collections::BTreeMap;

use unicode_normalization::char::is_combining_mark;
use unicode_normalization::UnicodeNormalization;

use crate::{Cell, Column, Error, RawRow, Result};

/// Default number of leading rows scanned for the header.
pub const DEFAULT_HEADER_SCAN_ROWS: usize = 50;

/// Canonical form of a categorical value: uppercased, diacritics stripped,
/// internal whitespace collapsed to single spaces, trimmed.
///
/// Returns `None` when nothing but whitespace remains.
pub fn normalize_text(input: &str) -> Option<String> {
    let stripped = input
        .to_uppercase()
        .nfkd()
        .filter(|c| !is_combining_mark(*c))
        .collect::<String>();
    let collapsed = stripped.split_whitespace().collect::<Vec<_>>().join(" ");
    if collapsed.is_empty() {
        None
    } else {
        Some(collapsed)
    }
}

/// Header form: `normalize_text`, then every run of non-alphanumerics
/// becomes a single `_` (`"Nivel  Formación"` -> `NIVEL_FORMACION`).
pub fn normalize_column_name(input: &str) -> String {
    let text = normalize_text(input).unwrap_or_default();
    text.chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { ' ' })
        .collect::<String>()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join("_")
}

/// Location of the header row and the index of each required column.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HeaderMatch {
    /// 0-based index of the header row within the scanned grid.
    pub row_index: usize,
    pub columns: BTreeMap<Column, usize>,
}

/// Scan the first `max_scan` rows for one whose normalized cells contain
/// every required column. Rows above the header are noise.
pub fn detect_header(grid: &[Vec<Cell>], max_scan: usize) -> Result<HeaderMatch> {
    let limit = max_scan.min(grid.len());
    for (row_index, row) in grid.iter().take(limit).enumerate() {
        let mut seen: BTreeMap<Column, Vec<usize>> = BTreeMap::new();
        for (col_index, cell) in row.iter().enumerate() {
            let Some(text) = cell.as_text() else {
                continue;
            };
            if let Some(column) = Column::from_header(&normalize_column_name(text)) {
                seen.entry(column).or_default().push(col_index);
            }
        }

        if seen.len() != Column::ALL.len() {
            continue;
        }

        let dupes = seen
            .iter()
            .filter(|(_, idx)| idx.len() > 1)
            .map(|(column, _)| column.header().to_string())
            .collect::<Vec<_>>();
        if !dupes.is_empty() {
            return Err(Error::DuplicateColumns(dupes));
        }

        let columns = seen
            .into_iter()
            .map(|(column, idx)| (column, idx[0]))
            .collect();
        return Ok(HeaderMatch { row_index, columns });
    }

    Err(Error::HeaderNotFound {
        scanned: limit,
        expected: Column::ALL.iter().map(|c| c.header()).collect(),
    })
}

impl HeaderMatch {
    /// Build raw rows from everything below the header, dropping blank rows.
    /// `first_sheet_row` is the 1-based sheet row number of `grid[0]`.
    pub fn extract_rows(&self, grid: &[Vec<Cell>], first_sheet_row: u32) -> Vec<RawRow> {
        let mut rows = Vec::new();
        for (offset, cells) in grid.iter().enumerate().skip(self.row_index + 1) {
            let mut row = RawRow {
                row_num: first_sheet_row + offset as u32,
                ..Default::default()
            };
            for (column, idx) in &self.columns {
                match cells.get(*idx) {
                    Some(Cell::Text(text)) => {
                        row.cells.insert(*column, text.clone());
                    }
                    Some(Cell::Rejected(_)) => row.rejected_cells.push(*column),
                    Some(Cell::Empty) | None => {}
                }
            }
            if !row.is_blank() {
                rows.push(row);
            }
        }
        rows
    }
}
