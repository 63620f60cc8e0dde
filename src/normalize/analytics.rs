use std::collections::{BTreeMap, HashMap};

use log::warn;
use serde_json::{Map, Value};

use super::{canonical_columns, NormalizeContext, NormalizedTable};
use crate::error::{ConnectorError, Result, SchemaMismatch};

/// Column positions of a long-format analytics table.
pub const LONG_DATA: usize = 0;
pub const LONG_PERIOD: usize = 1;
pub const LONG_ORG_UNIT: usize = 2;
pub const LONG_VALUE: usize = 3;

const LONG_KEYS: [(&str, &str); 4] = [
    ("dx", "Data"),
    ("pe", "Period"),
    ("ou", "Organisation unit"),
    ("value", "Value"),
];

pub(super) fn normalize_long(pages: &[Value], context: &NormalizeContext) -> Result<NormalizedTable> {
    let columns = long_columns(context)?;
    let mut rows = Vec::new();
    for page in pages {
        rows.extend(long_rows(page, context)?);
    }
    NormalizedTable::new(columns, rows)
}

pub(super) fn normalize_wide(pages: &[Value], context: &NormalizeContext) -> Result<NormalizedTable> {
    let long = normalize_long(pages, context)?;
    pivot_long_to_wide(&long, &context.expected_data_items)
}

fn long_columns(context: &NormalizeContext) -> Result<Vec<String>> {
    let keys: Vec<String> = LONG_KEYS.iter().map(|(key, _)| key.to_string()).collect();
    let names: HashMap<&str, &str> = LONG_KEYS
        .iter()
        .map(|(key, default)| {
            let display = context
                .display_names
                .get(*key)
                .map(String::as_str)
                .unwrap_or(default);
            (*key, display)
        })
        .collect();
    canonical_columns(&keys, &names)
}

fn header_index(headers: &[Value], name: &str) -> Result<usize> {
    headers
        .iter()
        .position(|h| h.get("name").and_then(Value::as_str) == Some(name))
        .ok_or_else(|| {
            ConnectorError::UnsupportedResponseShape(format!(
                "analytics payload has no {:?} header",
                name
            ))
        })
}

/// Replaces an item id by its name: the catalog's name first, then the
/// payload's `metaData.items`, else the id itself.
fn item_name(
    catalog: Option<&BTreeMap<String, String>>,
    items: Option<&Map<String, Value>>,
    cell: &Value,
) -> Value {
    let id = match cell {
        Value::String(id) => id.as_str(),
        other => return other.clone(),
    };
    let name = catalog
        .and_then(|names| names.get(id))
        .map(String::as_str)
        .or_else(|| {
            items
                .and_then(|items| items.get(id))
                .and_then(|item| item.get("name"))
                .and_then(Value::as_str)
        })
        .unwrap_or(id);
    Value::String(name.to_string())
}

fn long_rows(page: &Value, context: &NormalizeContext) -> Result<Vec<Vec<Value>>> {
    let headers = page
        .get("headers")
        .and_then(Value::as_array)
        .ok_or_else(|| {
            ConnectorError::UnsupportedResponseShape(
                "analytics payload has no headers".to_string(),
            )
        })?;
    let data = header_index(headers, "dx")?;
    let period = header_index(headers, "pe")?;
    let org_unit = header_index(headers, "ou")?;
    let value = header_index(headers, "value")?;
    let items = page.pointer("/metaData/items").and_then(Value::as_object);

    let Some(rows) = page.get("rows").and_then(Value::as_array) else {
        return Ok(Vec::new());
    };

    rows.iter()
        .enumerate()
        .map(|(index, row)| {
            let cells = row.as_array().ok_or_else(|| {
                ConnectorError::UnsupportedResponseShape(format!(
                    "analytics row {} is not an array",
                    index
                ))
            })?;
            if cells.len() != headers.len() {
                return Err(SchemaMismatch::RowArity {
                    row: index,
                    expected: headers.len(),
                    actual: cells.len(),
                }
                .into());
            }
            Ok(vec![
                item_name(Some(&context.display_names), items, &cells[data]),
                cells[period].clone(),
                item_name(None, items, &cells[org_unit]),
                cells[value].clone(),
            ])
        })
        .collect()
}

fn cell_key(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Pivots a long analytics table into one row per (organisation unit,
/// period) with one column per data item.
///
/// The organisation unit and period columns always lead, in that order.
/// `expected_items` are emitted as columns even if no row carries them.
pub fn pivot_long_to_wide(
    long: &NormalizedTable,
    expected_items: &[String],
) -> Result<NormalizedTable> {
    let long_columns = long.column_names();
    if long_columns.len() <= LONG_VALUE {
        return Err(ConnectorError::UnsupportedResponseShape(format!(
            "long analytics table needs {} columns, found {}",
            LONG_VALUE + 1,
            long_columns.len()
        )));
    }

    let mut items: Vec<String> = Vec::new();
    let mut item_index: HashMap<String, usize> = HashMap::new();
    let expected = expected_items.iter().cloned();
    let observed = long.rows().iter().map(|row| cell_key(&row[LONG_DATA]));
    for item in expected.chain(observed) {
        if !item_index.contains_key(&item) {
            item_index.insert(item.clone(), items.len());
            items.push(item);
        }
    }

    let mut keys = vec![
        long_columns[LONG_ORG_UNIT].clone(),
        long_columns[LONG_PERIOD].clone(),
    ];
    keys.extend(items.iter().cloned());
    let columns = canonical_columns(&keys, &HashMap::new())?;

    let mut rows: Vec<Vec<Value>> = Vec::new();
    let mut row_index: HashMap<(String, String), usize> = HashMap::new();
    for row in long.rows() {
        let key = (cell_key(&row[LONG_ORG_UNIT]), cell_key(&row[LONG_PERIOD]));
        let position = *row_index.entry(key).or_insert_with(|| {
            let mut wide = vec![Value::Null; columns.len()];
            wide[0] = row[LONG_ORG_UNIT].clone();
            wide[1] = row[LONG_PERIOD].clone();
            rows.push(wide);
            rows.len() - 1
        });

        let item = cell_key(&row[LONG_DATA]);
        let column = 2 + item_index[&item];
        let cell = &mut rows[position][column];
        if cell.is_null() {
            *cell = row[LONG_VALUE].clone();
        } else {
            warn!(
                "Duplicate analytics value for {:?} at ({}, {}); keeping the first",
                item, row[LONG_ORG_UNIT], row[LONG_PERIOD]
            );
        }
    }

    NormalizedTable::new(columns, rows)
}
