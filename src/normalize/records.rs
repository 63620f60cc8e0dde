use std::collections::HashMap;

use serde_json::{Map, Value};

use super::{canonical_columns, NormalizeContext, NormalizedTable};
use crate::error::{ConnectorError, Result};

/// One payload object flattened to `(field key, cell)` pairs.
type Record = Vec<(String, Value)>;

/// Field key → display name reported by the payload itself.
type NameHints = HashMap<String, String>;

pub(super) fn normalize_value_set(
    pages: &[Value],
    context: &NormalizeContext,
) -> Result<NormalizedTable> {
    let mut records = Vec::new();
    for page in pages {
        for object in collection(page, &["dataValues"], "value set")? {
            records.push(scalar_fields(object));
        }
    }
    build_table(records, context, &NameHints::new())
}

pub(super) fn normalize_event_set(
    pages: &[Value],
    context: &NormalizeContext,
) -> Result<NormalizedTable> {
    let mut records = Vec::new();
    for page in pages {
        for event in collection(page, &["instances", "events"], "event set")? {
            let mut record = scalar_fields(event);
            if let Some(values) = event.get("dataValues").and_then(Value::as_array) {
                record.extend(keyed_values(values, "dataElement", None));
            }
            records.push(record);
        }
    }
    build_table(records, context, &NameHints::new())
}

pub(super) fn normalize_entity_set(
    pages: &[Value],
    context: &NormalizeContext,
) -> Result<NormalizedTable> {
    let mut records = Vec::new();
    let mut hints = NameHints::new();
    let keys = ["instances", "trackedEntities", "trackedEntityInstances"];
    for page in pages {
        for entity in collection(page, &keys, "entity set")? {
            let mut record = scalar_fields(entity);
            if let Some(attributes) = entity.get("attributes").and_then(Value::as_array) {
                record.extend(keyed_values(attributes, "attribute", Some(&mut hints)));
            }
            records.push(record);
        }
    }
    build_table(records, context, &hints)
}

pub(super) fn normalize_metadata_list(
    pages: &[Value],
    context: &NormalizeContext,
) -> Result<NormalizedTable> {
    let mut records = Vec::new();
    for page in pages {
        let object = page.as_object().ok_or_else(|| {
            ConnectorError::UnsupportedResponseShape(
                "metadata list payload is not an object".to_string(),
            )
        })?;
        let list = object
            .iter()
            .filter(|(key, _)| key.as_str() != "pager")
            .find_map(|(_, value)| value.as_array())
            .ok_or_else(|| {
                ConnectorError::UnsupportedResponseShape(
                    "metadata list payload has no collection".to_string(),
                )
            })?;
        records.extend(objects(list, "metadata list")?.into_iter().map(all_fields));
    }
    build_table(records, context, &NameHints::new())
}

pub(super) fn normalize_generic(
    pages: &[Value],
    context: &NormalizeContext,
) -> Result<NormalizedTable> {
    let mut records = Vec::new();
    for page in pages {
        match page {
            Value::Array(items) => {
                records.extend(objects(items, "generic")?.into_iter().map(all_fields));
            }
            Value::Object(object) => {
                let arrays: Vec<&Vec<Value>> =
                    object.values().filter_map(Value::as_array).collect();
                match arrays.as_slice() {
                    [only] if only.iter().all(Value::is_object) => {
                        records.extend(objects(only, "generic")?.into_iter().map(all_fields));
                    }
                    _ => records.push(scalar_fields(object)),
                }
            }
            other => {
                return Err(ConnectorError::UnsupportedResponseShape(format!(
                    "generic payload must be an object or array, got {}",
                    kind(other)
                )))
            }
        }
    }
    build_table(records, context, &NameHints::new())
}

fn kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

/// The first present collection among `keys`, as objects.
fn collection<'a>(
    page: &'a Value,
    keys: &[&str],
    what: &str,
) -> Result<Vec<&'a Map<String, Value>>> {
    let list = keys
        .iter()
        .find_map(|key| page.get(*key).and_then(Value::as_array))
        .ok_or_else(|| {
            ConnectorError::UnsupportedResponseShape(format!(
                "{} payload has none of the fields {:?}",
                what, keys
            ))
        })?;
    objects(list, what)
}

fn objects<'a>(list: &'a [Value], what: &str) -> Result<Vec<&'a Map<String, Value>>> {
    list.iter()
        .map(|item| {
            item.as_object().ok_or_else(|| {
                ConnectorError::UnsupportedResponseShape(format!(
                    "{} entry is a {}, not an object",
                    what,
                    kind(item)
                ))
            })
        })
        .collect()
}

fn scalar_fields(object: &Map<String, Value>) -> Record {
    object
        .iter()
        .filter(|(_, value)| !value.is_array() && !value.is_object())
        .map(|(key, value)| (key.clone(), value.clone()))
        .collect()
}

/// Every field; nested values are kept as their JSON text.
fn all_fields(object: &Map<String, Value>) -> Record {
    object
        .iter()
        .map(|(key, value)| {
            let cell = match value {
                Value::Array(_) | Value::Object(_) => Value::String(value.to_string()),
                scalar => scalar.clone(),
            };
            (key.clone(), cell)
        })
        .collect()
}

/// Flattens `[{<key_field>: id, value: v, displayName?}]` into `(id, v)` pairs.
fn keyed_values(
    values: &[Value],
    key_field: &str,
    mut hints: Option<&mut NameHints>,
) -> Vec<(String, Value)> {
    values
        .iter()
        .filter_map(|entry| {
            let key = entry.get(key_field)?.as_str()?.to_string();
            if let (Some(hints), Some(name)) = (
                hints.as_deref_mut(),
                entry.get("displayName").and_then(Value::as_str),
            ) {
                hints.entry(key.clone()).or_insert_with(|| name.to_string());
            }
            let value = entry.get("value").cloned().unwrap_or(Value::Null);
            Some((key, value))
        })
        .collect()
}

fn build_table(
    records: Vec<Record>,
    context: &NormalizeContext,
    hints: &NameHints,
) -> Result<NormalizedTable> {
    let mut keys: Vec<String> = context.declared_fields.clone();
    let mut positions: HashMap<String, usize> = keys
        .iter()
        .enumerate()
        .map(|(i, key)| (key.clone(), i))
        .collect();
    for record in &records {
        for (key, _) in record {
            if !positions.contains_key(key) {
                positions.insert(key.clone(), keys.len());
                keys.push(key.clone());
            }
        }
    }

    let mut names: HashMap<&str, &str> = hints
        .iter()
        .map(|(key, name)| (key.as_str(), name.as_str()))
        .collect();
    for key in &keys {
        let display = context.display_name(key);
        if display != key.as_str() || !names.contains_key(key.as_str()) {
            names.insert(key.as_str(), display);
        }
    }
    let columns = canonical_columns(&keys, &names)?;

    let rows = records
        .into_iter()
        .map(|record| {
            let mut row = vec![Value::Null; columns.len()];
            for (key, value) in record {
                row[positions[&key]] = value;
            }
            row
        })
        .collect();

    NormalizedTable::new(columns, rows)
}
