//! Natural-key and row-hash derivation.
//!
//! The natural key identifies "the same offering" across files; the row hash
//! detects changes between versions of it. Both are computed from normalized
//! fields only, in a fixed field order, so they are stable across runs.

use sha2::{Digest, Sha256};

use crate::{normalize_text, Column, NormalizedFields, RawRow, StagedRow};

/// Fields composing the natural key, in key order. Status is excluded.
pub const NATURAL_KEY_COLUMNS: [Column; 7] = [
    Column::InstitutionName,
    Column::ProgramName,
    Column::BroadField,
    Column::EducationLevel,
    Column::Modality,
    Column::Province,
    Column::Canton,
];

pub fn natural_key(fields: &NormalizedFields) -> String {
    NATURAL_KEY_COLUMNS
        .iter()
        .map(|c| fields.get(*c).unwrap_or(""))
        .collect::<Vec<_>>()
        .join("|")
}

/// SHA-256 over `HEADER=value\n` for every column in [`Column::ALL`] order.
pub fn row_hash(fields: &NormalizedFields) -> String {
    let mut hasher = Sha256::new();
    for column in Column::ALL {
        hasher.update(column.header().as_bytes());
        hasher.update(b"=");
        hasher.update(fields.get(column).unwrap_or("").as_bytes());
        hasher.update(b"\n");
    }
    hex::encode(hasher.finalize())
}

pub fn normalize_row(raw: &RawRow) -> NormalizedFields {
    let mut fields = NormalizedFields::default();
    for column in Column::ALL {
        fields.set(column, raw.get(column).and_then(normalize_text));
    }
    fields
}

pub fn stage_row(raw: RawRow) -> StagedRow {
    let normalized = normalize_row(&raw);
    StagedRow {
        natural_key: natural_key(&normalized),
        row_hash: row_hash(&normalized),
        normalized,
        raw,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn raw(values: &[(Column, &str)]) -> RawRow {
        let mut row = RawRow {
            row_num: 2,
            ..Default::default()
        };
        for (column, value) in values {
            row.cells.insert(*column, value.to_string());
        }
        row
    }

    fn sample(status: &str, institution: &str) -> RawRow {
        raw(&[
            (Column::InstitutionName, institution),
            (Column::ProgramName, "Ingeniería"),
            (Column::Province, "Pichincha"),
            (Column::Canton, "Quito"),
            (Column::Status, status),
        ])
    }

    #[test]
    fn key_and_hash_ignore_casing_and_spacing() {
        let a = stage_row(sample("Activa", "Universidad X"));
        let b = stage_row(sample("  ACTIVA ", "universidad   x"));
        assert_eq!(a.natural_key, b.natural_key);
        assert_eq!(a.row_hash, b.row_hash);
        assert_eq!(a.natural_key, "UNIVERSIDAD X|INGENIERIA||||PICHINCHA|QUITO");
    }

    #[test]
    fn status_changes_hash_but_not_key() {
        let active = stage_row(sample("Activa", "Universidad X"));
        let inactive = stage_row(sample("Inactiva", "Universidad X"));
        assert_eq!(active.natural_key, inactive.natural_key);
        assert_ne!(active.row_hash, inactive.row_hash);
    }

    #[test]
    fn hash_is_pinned_to_field_order() {
        let empty = NormalizedFields::default();
        let mut hasher = Sha256::new();
        hasher.update(
            "NOMBRE_IES=\nTIPO_IES=\nTIPO_FINANCIAMIENTO=\nNOMBRE_CARRERA=\nCAMPO_AMPLIO=\n\
             NIVEL_FORMACION=\nMODALIDAD=\nPROVINCIA=\nCANTON=\nESTADO=\n"
                .as_bytes(),
        );
        assert_eq!(row_hash(&empty), hex::encode(hasher.finalize()));
    }

    #[test]
    fn moving_a_value_between_fields_changes_the_key() {
        let a = stage_row(raw(&[(Column::BroadField, "Salud"), (Column::EducationLevel, "")]));
        let b = stage_row(raw(&[(Column::BroadField, ""), (Column::EducationLevel, "Salud")]));
        assert_ne!(a.natural_key, b.natural_key);
    }
}
