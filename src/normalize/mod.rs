//! Response normalization.
//!
//! Each [`ResponseShape`] has its own normalizer; all of them produce a
//! [`NormalizedTable`] whose column names come from [`crate::sanitize`].

mod analytics;
mod records;

use std::collections::{BTreeMap, HashMap};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::catalog::{Axis, VirtualTable};
use crate::error::{ConnectorError, Result, SchemaMismatch};
use crate::sanitize::try_sanitize;

pub use analytics::{pivot_long_to_wide, LONG_DATA, LONG_ORG_UNIT, LONG_PERIOD, LONG_VALUE};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ResponseShape {
    AnalyticsLong,
    AnalyticsWide,
    ValueSet,
    EventSet,
    EntitySet,
    MetadataList,
    Generic,
}

/// Column names plus positional rows; every row has exactly one cell per column.
#[derive(Debug, Clone, PartialEq)]
pub struct NormalizedTable {
    column_names: Vec<String>,
    rows: Vec<Vec<Value>>,
}

impl NormalizedTable {
    pub fn new(column_names: Vec<String>, rows: Vec<Vec<Value>>) -> Result<Self> {
        for (index, row) in rows.iter().enumerate() {
            if row.len() != column_names.len() {
                return Err(SchemaMismatch::RowArity {
                    row: index,
                    expected: column_names.len(),
                    actual: row.len(),
                }
                .into());
            }
        }
        Ok(Self { column_names, rows })
    }

    pub fn empty(column_names: Vec<String>) -> Self {
        Self {
            column_names,
            rows: Vec::new(),
        }
    }

    pub fn column_names(&self) -> &[String] {
        &self.column_names
    }

    pub fn rows(&self) -> &[Vec<Value>] {
        &self.rows
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.column_names.iter().position(|c| c == name)
    }

    pub fn into_parts(self) -> (Vec<String>, Vec<Vec<Value>>) {
        (self.column_names, self.rows)
    }

    /// Concatenates the rows of tables that share one column list.
    pub fn concat(tables: Vec<NormalizedTable>) -> Result<Self> {
        let mut tables = tables.into_iter();
        let Some(first) = tables.next() else {
            return Ok(Self::empty(Vec::new()));
        };
        let (column_names, mut rows) = first.into_parts();
        for table in tables {
            if table.column_names != column_names {
                return Err(SchemaMismatch::BatchColumns {
                    expected: column_names,
                    actual: table.column_names,
                }
                .into());
            }
            rows.extend(table.rows);
        }
        Ok(Self { column_names, rows })
    }

    pub fn retain_rows<F>(self, mut keep: F) -> Self
    where
        F: FnMut(&[Value]) -> bool,
    {
        let rows = self.rows.into_iter().filter(|row| keep(row)).collect();
        Self {
            column_names: self.column_names,
            rows,
        }
    }
}

/// What a normalizer needs to know about the table being loaded.
#[derive(Debug, Clone, Default)]
pub struct NormalizeContext {
    /// Upstream field key → display name.
    pub display_names: BTreeMap<String, String>,
    /// Field keys that are always emitted, in this order, ahead of any
    /// undeclared payload fields.
    pub declared_fields: Vec<String>,
    /// Data item display names a wide table must carry as columns even when
    /// the upstream returned no values for them.
    pub expected_data_items: Vec<String>,
}

impl NormalizeContext {
    pub fn for_table(table: &VirtualTable) -> Self {
        Self {
            display_names: table.display_names(),
            declared_fields: table
                .dimensions
                .iter()
                .filter(|d| matches!(d.axis, Axis::Field | Axis::OrgUnit | Axis::Period))
                .map(|d| d.id.clone())
                .collect(),
            expected_data_items: Vec::new(),
        }
    }

    pub fn with_expected_data_items(mut self, items: Vec<String>) -> Self {
        self.expected_data_items = items;
        self
    }

    fn display_name<'a>(&'a self, key: &'a str) -> &'a str {
        self.display_names
            .get(key)
            .map(String::as_str)
            .unwrap_or(key)
    }
}

/// Normalizes one or more pages of a single upstream response.
pub fn normalize(
    shape: ResponseShape,
    pages: &[Value],
    context: &NormalizeContext,
) -> Result<NormalizedTable> {
    match shape {
        ResponseShape::AnalyticsLong => analytics::normalize_long(pages, context),
        ResponseShape::AnalyticsWide => analytics::normalize_wide(pages, context),
        ResponseShape::ValueSet => records::normalize_value_set(pages, context),
        ResponseShape::EventSet => records::normalize_event_set(pages, context),
        ResponseShape::EntitySet => records::normalize_entity_set(pages, context),
        ResponseShape::MetadataList => records::normalize_metadata_list(pages, context),
        ResponseShape::Generic => records::normalize_generic(pages, context),
    }
}

/// Number of pages reported by a paged payload, if it carries a pager.
pub fn page_count(payload: &Value) -> Option<u32> {
    let candidates = [
        payload.pointer("/pager/pageCount"),
        payload.pointer("/metaData/pager/pageCount"),
        payload.pointer("/pageCount"),
    ];
    candidates
        .into_iter()
        .flatten()
        .find_map(Value::as_u64)
        .map(|count| count as u32)
}

/// Assigns canonical names to a list of field keys, once per table.
fn canonical_columns(keys: &[String], names: &HashMap<&str, &str>) -> Result<Vec<String>> {
    let mut seen: HashMap<String, &str> = HashMap::new();
    let mut columns = Vec::with_capacity(keys.len());
    for key in keys {
        let display = names.get(key.as_str()).copied().unwrap_or(key.as_str());
        let canonical = try_sanitize(display)?;
        if let Some(first) = seen.insert(canonical.clone(), display) {
            return Err(ConnectorError::DuplicateColumn {
                canonical,
                first: first.to_string(),
                second: display.to_string(),
            });
        }
        columns.push(canonical);
    }
    Ok(columns)
}
