//! Typed rows over a normalized table.

use std::fmt;
use std::sync::Arc;

use log::debug;
use serde::Serialize;
use serde_json::Value;

use crate::catalog::SemanticType;
use crate::error::{Result, SchemaMismatch};
use crate::resolver;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum TypedValue {
    Text(String),
    Float(f64),
    Null,
}

impl TypedValue {
    /// Coerces a raw cell. A measure cell that does not parse to a finite
    /// number becomes [`TypedValue::Null`].
    pub fn coerce(raw: &Value, semantic_type: SemanticType) -> Self {
        match (semantic_type, raw) {
            (_, Value::Null) => TypedValue::Null,
            (SemanticType::String, Value::String(s)) => TypedValue::Text(s.clone()),
            (SemanticType::String, other) => TypedValue::Text(other.to_string()),
            (SemanticType::Float, Value::Number(n)) => n
                .as_f64()
                .filter(|f| f.is_finite())
                .map_or(TypedValue::Null, TypedValue::Float),
            (SemanticType::Float, Value::String(s)) => s
                .trim()
                .parse::<f64>()
                .ok()
                .filter(|f| f.is_finite())
                .map_or(TypedValue::Null, TypedValue::Float),
            (SemanticType::Float, _) => TypedValue::Null,
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, TypedValue::Null)
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            TypedValue::Float(f) => Some(*f),
            TypedValue::Text(s) => s.trim().parse::<f64>().ok().filter(|f| f.is_finite()),
            TypedValue::Null => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            TypedValue::Text(s) => Some(s),
            _ => None,
        }
    }

    /// Text form used for grouping and distinct counts; `None` for null.
    pub fn key(&self) -> Option<String> {
        match self {
            TypedValue::Null => None,
            other => Some(other.to_string()),
        }
    }
}

impl fmt::Display for TypedValue {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            TypedValue::Text(s) => write!(f, "{}", s),
            TypedValue::Float(v) => write!(f, "{}", v),
            TypedValue::Null => Ok(()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CursorColumn {
    pub name: String,
    pub semantic_type: SemanticType,
}

impl CursorColumn {
    pub fn new(name: impl Into<String>, semantic_type: SemanticType) -> Self {
        Self {
            name: name.into(),
            semantic_type,
        }
    }
}

/// One row, addressable by canonical column name.
#[derive(Debug, Clone, PartialEq)]
pub struct TypedRow {
    names: Arc<Vec<String>>,
    values: Vec<TypedValue>,
}

impl TypedRow {
    pub fn names(&self) -> &[String] {
        &self.names
    }

    pub fn values(&self) -> &[TypedValue] {
        &self.values
    }

    pub fn into_values(self) -> Vec<TypedValue> {
        self.values
    }

    /// Value of the column named exactly `name`.
    pub fn get(&self, name: &str) -> Option<&TypedValue> {
        let index = self.names.iter().position(|n| n == name)?;
        self.values.get(index)
    }

    /// Value of the column `reference` resolves to.
    pub fn get_resolved(&self, reference: &str) -> Result<&TypedValue> {
        let index = resolver::resolve_index(reference, &self.names)?;
        Ok(&self.values[index])
    }
}

/// Forward-only iterator of [`TypedRow`]s.
#[derive(Debug)]
pub struct TypedCursor {
    columns: Vec<CursorColumn>,
    names: Arc<Vec<String>>,
    rows: std::vec::IntoIter<Vec<TypedValue>>,
}

fn check_arity<T>(expected: usize, rows: &[Vec<T>]) -> Result<()> {
    for (index, row) in rows.iter().enumerate() {
        if row.len() != expected {
            return Err(SchemaMismatch::RowArity {
                row: index,
                expected,
                actual: row.len(),
            }
            .into());
        }
    }
    Ok(())
}

impl TypedCursor {
    /// Checks every row against the column list, then coerces each cell to
    /// its column's semantic type.
    pub fn new(columns: Vec<CursorColumn>, rows: Vec<Vec<Value>>) -> Result<Self> {
        check_arity(columns.len(), &rows)?;

        let mut nulled = 0usize;
        let typed: Vec<Vec<TypedValue>> = rows
            .iter()
            .map(|row| {
                row.iter()
                    .zip(&columns)
                    .map(|(cell, column)| {
                        let value = TypedValue::coerce(cell, column.semantic_type);
                        if value.is_null() && !cell.is_null() {
                            nulled += 1;
                        }
                        value
                    })
                    .collect()
            })
            .collect();
        if nulled > 0 {
            debug!("{} unparseable measure cell(s) coerced to null", nulled);
        }
        Self::from_typed(columns, typed)
    }

    pub fn from_typed(columns: Vec<CursorColumn>, rows: Vec<Vec<TypedValue>>) -> Result<Self> {
        check_arity(columns.len(), &rows)?;
        let names = Arc::new(columns.iter().map(|c| c.name.clone()).collect());
        Ok(Self {
            columns,
            names,
            rows: rows.into_iter(),
        })
    }

    pub fn columns(&self) -> &[CursorColumn] {
        &self.columns
    }

    pub fn column_names(&self) -> &[String] {
        &self.names
    }

    /// Rows not yet returned.
    pub fn remaining(&self) -> usize {
        self.rows.len()
    }

    pub fn next_row(&mut self) -> Option<TypedRow> {
        self.rows.next().map(|values| TypedRow {
            names: Arc::clone(&self.names),
            values,
        })
    }

    /// Name of the result column `reference` resolves to.
    pub fn resolve(&self, reference: &str) -> Result<String> {
        resolver::resolve(reference, &self.names)
    }

    pub(crate) fn into_parts(self) -> (Vec<CursorColumn>, Vec<Vec<TypedValue>>) {
        (self.columns, self.rows.collect())
    }
}

impl Iterator for TypedCursor {
    type Item = TypedRow;

    fn next(&mut self) -> Option<TypedRow> {
        self.next_row()
    }
}
