//! Loading the first sheet of a workbook (or a CSV file) into a grid of
//! cells. Header detection happens later, on the grid.

use std::io::Read;
use std::path::Path;

use calamine::{open_workbook_auto, Data, Reader};
use ofal_core::Cell;

use crate::IngestError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceFormat {
    Workbook,
    Csv,
}

impl SourceFormat {
    pub fn from_path(path: &Path) -> Result<Self, IngestError> {
        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .map(str::to_ascii_lowercase)
            .unwrap_or_default();
        match ext.as_str() {
            "xlsx" | "xlsm" | "xls" | "xlsb" | "ods" => Ok(SourceFormat::Workbook),
            "csv" => Ok(SourceFormat::Csv),
            _ => Err(IngestError::UnsupportedFormat(path.display().to_string())),
        }
    }
}

/// Raw cells of the source sheet.
#[derive(Debug, Clone, Default)]
pub struct SourceTable {
    pub sheet: Option<String>,
    pub grid: Vec<Vec<Cell>>,
    /// 1-based sheet row of `grid[0]`; workbooks may start below row 1.
    pub first_sheet_row: u32,
}

pub fn load_table(path: &Path) -> Result<SourceTable, IngestError> {
    match SourceFormat::from_path(path)? {
        SourceFormat::Workbook => load_workbook(path),
        SourceFormat::Csv => {
            let file = std::fs::File::open(path).map_err(|source| IngestError::Read {
                path: path.to_path_buf(),
                source,
            })?;
            table_from_csv_reader(file)
        }
    }
}

fn load_workbook(path: &Path) -> Result<SourceTable, IngestError> {
    let mut workbook = open_workbook_auto(path)?;
    let sheet = workbook.sheet_names().first().cloned();
    let range = workbook
        .worksheet_range_at(0)
        .ok_or(IngestError::EmptyWorkbook)??;

    let first_sheet_row = range.start().map(|(row, _)| row + 1).unwrap_or(1);
    let grid = range
        .rows()
        .map(|row| row.iter().map(cell_from_data).collect())
        .collect();
    Ok(SourceTable {
        sheet,
        grid,
        first_sheet_row,
    })
}

/// Headerless, ragged CSV. Invalid UTF-8 is replaced rather than rejected.
///
/// The csv reader skips blank lines, so the grid is padded with empty rows
/// to keep `grid[i]` on file line `i + 1`.
pub fn table_from_csv_reader(reader: impl Read) -> Result<SourceTable, IngestError> {
    let mut csv = csv::ReaderBuilder::new()
        .has_headers(false)
        .flexible(true)
        .from_reader(reader);
    let mut grid: Vec<Vec<Cell>> = Vec::new();
    for record in csv.byte_records() {
        let record = record?;
        if let Some(position) = record.position() {
            let line = usize::try_from(position.line()).unwrap_or(usize::MAX);
            while grid.len() + 1 < line {
                grid.push(Vec::new());
            }
        }
        grid.push(
            record
                .iter()
                .map(|field| Cell::text(String::from_utf8_lossy(field).into_owned()))
                .collect(),
        );
    }
    Ok(SourceTable {
        sheet: None,
        grid,
        first_sheet_row: 1,
    })
}

fn cell_from_data(data: &Data) -> Cell {
    match data {
        Data::Empty => Cell::Empty,
        Data::Error(_) => Cell::Rejected(data.to_string()),
        // Whole numbers come back as floats; keep "2020", not "2020.0".
        Data::Float(f) if f.fract() == 0.0 && f.abs() < 1e15 => Cell::text((*f as i64).to_string()),
        other => Cell::text(other.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use calamine::CellErrorType;

    #[test]
    fn format_follows_the_extension() {
        assert_eq!(
            SourceFormat::from_path(Path::new("oferta.XLSX")).unwrap(),
            SourceFormat::Workbook
        );
        assert_eq!(
            SourceFormat::from_path(Path::new("oferta.csv")).unwrap(),
            SourceFormat::Csv
        );
        assert!(matches!(
            SourceFormat::from_path(Path::new("oferta.pdf")),
            Err(IngestError::UnsupportedFormat(_))
        ));
    }

    #[test]
    fn csv_rows_may_be_ragged() {
        let table = table_from_csv_reader("titulo\na,b,,c\n".as_bytes()).unwrap();
        assert_eq!(table.first_sheet_row, 1);
        assert_eq!(table.grid.len(), 2);
        assert_eq!(table.grid[0], vec![Cell::Text("titulo".into())]);
        assert_eq!(table.grid[1][2], Cell::Empty);
        assert_eq!(table.grid[1][3], Cell::Text("c".into()));
    }

    #[test]
    fn csv_row_numbers_follow_file_lines_across_blank_lines() {
        let header = "NOMBRE_IES,TIPO_IES,TIPO_FINANCIAMIENTO,NOMBRE_CARRERA,CAMPO_AMPLIO,\
                      NIVEL_FORMACION,MODALIDAD,PROVINCIA,CANTON,ESTADO";
        let text = format!(
            "Oferta vigente\n\n{header}\nU. Central,PUBLICA,,DERECHO,,GRADO,PRESENCIAL,PICHINCHA,QUITO,VIGENTE\n\n\nU. Andina,,,MEDICINA,,,,,,\n"
        );
        let table = table_from_csv_reader(text.as_bytes()).unwrap();
        assert_eq!(table.grid.len(), 7);
        assert!(table.grid[1].is_empty());

        let header = ofal_core::detect_header(&table.grid, 50).unwrap();
        assert_eq!(header.row_index, 2);
        let rows = header.extract_rows(&table.grid, table.first_sheet_row);
        assert_eq!(rows.iter().map(|r| r.row_num).collect::<Vec<_>>(), vec![4, 7]);
    }

    #[test]
    fn quoted_multiline_fields_keep_the_starting_line() {
        let table = table_from_csv_reader("a,\"x\ny\"\nb\n".as_bytes()).unwrap();
        assert_eq!(table.grid.len(), 3);
        assert_eq!(table.grid[0][1], Cell::Text("x\ny".into()));
        assert!(table.grid[1].is_empty());
        assert_eq!(table.grid[2], vec![Cell::Text("b".into())]);
    }

    #[test]
    fn workbook_cells_are_coerced_to_text() {
        assert_eq!(cell_from_data(&Data::Float(2020.0)), Cell::Text("2020".into()));
        assert_eq!(cell_from_data(&Data::Int(7)), Cell::Text("7".into()));
        assert_eq!(cell_from_data(&Data::String("  ".into())), Cell::Empty);
        assert!(matches!(
            cell_from_data(&Data::Error(CellErrorType::Ref)),
            Cell::Rejected(_)
        ));
    }
}
