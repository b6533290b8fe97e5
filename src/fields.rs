//! Per-(source, entity) report field definitions.
//!
//! The tables live in `resources/fields.json` so adding a platform column is a
//! data change. Each entry keeps the request order of the fields together with
//! the semantic type used when casting the downloaded CSV.

use crate::error::Error;
use crate::job::{Entity, Source};
use serde::Deserialize;
use std::collections::HashMap;

const FIELDS_JSON: &str = include_str!("../resources/fields.json");

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum FieldType {
    Long,
    Double,
    /// A rate reported as `"12.5%"`, stored as a 0..1 ratio.
    Percent,
    String,
    Enum,
    /// A label field holding several values.
    List,
}

#[derive(Debug, Clone, Deserialize)]
pub struct EntityFields {
    pub report_type: Option<String>,
    pub fields: Vec<(String, FieldType)>,
}

impl EntityFields {
    pub fn names(&self) -> Vec<String> {
        self.fields.iter().map(|(name, _)| name.clone()).collect()
    }

    pub fn type_table(&self) -> TypeTable {
        TypeTable::new(self.fields.iter().cloned())
    }
}

#[derive(Debug, Clone)]
pub struct FieldCatalog {
    entries: HashMap<(Source, Entity), EntityFields>,
}

impl FieldCatalog {
    /// Loads the catalog embedded in the binary.
    pub fn embedded() -> Result<Self, Error> {
        Self::from_json(FIELDS_JSON)
    }

    pub fn from_json(json: &str) -> Result<Self, Error> {
        let raw: HashMap<String, HashMap<String, EntityFields>> = serde_json::from_str(json)?;

        let mut entries = HashMap::new();
        for (source, entities) in raw {
            let source: Source = source.parse()?;
            for (entity, fields) in entities {
                let entity: Entity = entity.parse()?;
                entries.insert((source, entity), fields);
            }
        }
        Ok(Self { entries })
    }

    pub fn get(&self, source: Source, entity: Entity) -> Result<&EntityFields, Error> {
        self.entries
            .get(&(source, entity))
            .ok_or_else(|| Error::MissingFieldSpec {
                source_name: source.to_string(),
                entity: entity.to_string(),
            })
    }
}

/// Column name to semantic type lookup used by the caster.
///
/// Matches on the exact column name first, then on a normalized form so that
/// a localized CSV header such as `Clicks` resolves to the `CLICKS` field.
#[derive(Debug, Clone, Default)]
pub struct TypeTable {
    exact: HashMap<String, FieldType>,
    normalized: HashMap<String, FieldType>,
}

impl TypeTable {
    pub fn new(fields: impl IntoIterator<Item = (String, FieldType)>) -> Self {
        let mut table = Self::default();
        for (name, field_type) in fields {
            table.normalized.insert(normalize(&name), field_type);
            table.exact.insert(name, field_type);
        }
        table
    }

    pub fn lookup(&self, column: &str) -> Option<FieldType> {
        self.exact
            .get(column)
            .or_else(|| self.normalized.get(&normalize(column)))
            .copied()
    }
}

fn normalize(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    for ch in name.trim().chars() {
        if ch.is_alphanumeric() {
            out.extend(ch.to_uppercase());
        } else if !out.ends_with('_') {
            out.push('_');
        }
    }
    out.trim_matches('_').to_string()
}
