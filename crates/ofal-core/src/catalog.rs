//! Reference data consulted read-only: the territory catalog of valid
//! (province, canton) pairs and the controlled category vocabulary.

use std::collections::{BTreeMap, BTreeSet};
use std::io::Read;
use std::path::Path;

use serde::Deserialize;

use crate::{normalize_column_name, normalize_text, Column, Error, Result};

/// Outcome of checking a normalized (province, canton) pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TerritoryCheck {
    Valid,
    MissingProvince,
    MissingCanton,
    UnknownProvince,
    CantonNotInProvince,
}

impl TerritoryCheck {
    pub fn is_valid(self) -> bool {
        self == TerritoryCheck::Valid
    }

    pub fn reason(self) -> &'static str {
        match self {
            TerritoryCheck::Valid => "valid",
            TerritoryCheck::MissingProvince => "missing_province",
            TerritoryCheck::MissingCanton => "missing_canton",
            TerritoryCheck::UnknownProvince => "unknown_province",
            TerritoryCheck::CantonNotInProvince => "canton_not_in_province",
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TerritoryCatalog {
    cantons_by_province: BTreeMap<String, BTreeSet<String>>,
}

impl TerritoryCatalog {
    pub fn from_pairs<P, C>(pairs: impl IntoIterator<Item = (P, C)>) -> Self
    where
        P: AsRef<str>,
        C: AsRef<str>,
    {
        let mut catalog = Self::default();
        for (province, canton) in pairs {
            if let (Some(p), Some(c)) = (
                normalize_text(province.as_ref()),
                normalize_text(canton.as_ref()),
            ) {
                catalog.cantons_by_province.entry(p).or_default().insert(c);
            }
        }
        catalog
    }

    /// CSV with `provincia`/`canton` columns (or their `_norm` variants).
    /// Values are normalized on load, so either spelling works.
    pub fn from_csv_reader(reader: impl Read) -> Result<Self> {
        let mut csv = csv::ReaderBuilder::new()
            .trim(csv::Trim::All)
            .from_reader(reader);
        let headers = csv
            .headers()?
            .iter()
            .map(normalize_column_name)
            .collect::<Vec<_>>();
        let find = |names: &[&str]| headers.iter().position(|h| names.contains(&h.as_str()));
        let province_idx =
            find(&["PROVINCIA", "PROVINCIA_NORM"]).ok_or(Error::CatalogColumns)?;
        let canton_idx = find(&["CANTON", "CANTON_NORM"]).ok_or(Error::CatalogColumns)?;

        let mut pairs = Vec::new();
        for record in csv.records() {
            let record = record?;
            pairs.push((
                record.get(province_idx).unwrap_or_default().to_string(),
                record.get(canton_idx).unwrap_or_default().to_string(),
            ));
        }
        Ok(Self::from_pairs(pairs))
    }

    pub fn from_path(path: impl AsRef<Path>) -> Result<Self> {
        let file = std::fs::File::open(path.as_ref())?;
        Self::from_csv_reader(file)
    }

    pub fn is_empty(&self) -> bool {
        self.cantons_by_province.is_empty()
    }

    pub fn province_count(&self) -> usize {
        self.cantons_by_province.len()
    }

    pub fn pair_count(&self) -> usize {
        self.cantons_by_province.values().map(BTreeSet::len).sum()
    }

    /// Exact match on already-normalized names.
    pub fn check(&self, province: Option<&str>, canton: Option<&str>) -> TerritoryCheck {
        let Some(province) = province else {
            return TerritoryCheck::MissingProvince;
        };
        let Some(canton) = canton else {
            return TerritoryCheck::MissingCanton;
        };
        match self.cantons_by_province.get(province) {
            None => TerritoryCheck::UnknownProvince,
            Some(cantons) if cantons.contains(canton) => TerritoryCheck::Valid,
            Some(_) => TerritoryCheck::CantonNotInProvince,
        }
    }
}

/// Vocabulary file format understood by this build.
pub const VOCABULARY_VERSION: u32 = 1;

#[derive(Debug, Deserialize)]
struct VocabularyFile {
    version: u32,
    #[serde(default)]
    fields: BTreeMap<String, Vec<String>>,
}

/// Controlled vocabulary for categorical columns. Columns without an entry
/// are not controlled.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Vocabulary {
    allowed: BTreeMap<Column, BTreeSet<String>>,
}

impl Vocabulary {
    pub fn from_entries<V: AsRef<str>>(
        entries: impl IntoIterator<Item = (Column, Vec<V>)>,
    ) -> Self {
        let allowed = entries
            .into_iter()
            .map(|(column, values)| {
                let values = values
                    .iter()
                    .filter_map(|v| normalize_text(v.as_ref()))
                    .collect();
                (column, values)
            })
            .collect();
        Self { allowed }
    }

    pub fn from_yaml_str(text: &str) -> Result<Self> {
        let file: VocabularyFile = serde_yaml::from_str(text)?;
        if file.version != VOCABULARY_VERSION {
            return Err(Error::VocabularyVersion {
                found: file.version,
                supported: VOCABULARY_VERSION,
            });
        }
        let mut entries = Vec::with_capacity(file.fields.len());
        for (name, values) in file.fields {
            let column = Column::from_header(&normalize_column_name(&name))
                .ok_or(Error::UnknownVocabularyColumn(name))?;
            entries.push((column, values));
        }
        Ok(Self::from_entries(entries))
    }

    pub fn from_path(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path.as_ref())?;
        Self::from_yaml_str(&text)
    }

    pub fn controlled_columns(&self) -> impl Iterator<Item = Column> + '_ {
        self.allowed.keys().copied()
    }

    /// `None` when the column is not controlled.
    pub fn allows(&self, column: Column, normalized: &str) -> Option<bool> {
        self.allowed
            .get(&column)
            .map(|values| values.contains(normalized))
    }
}
