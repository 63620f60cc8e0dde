use std::collections::HashMap;

use log::debug;

use super::{Axis, ColumnDescriptor, DimensionDescriptor, SemanticType, VirtualTable};
use crate::error::{ConnectorError, Result};
use crate::sanitize::{sanitize, try_sanitize};

/// Discovered columns of one virtual table.
#[derive(Debug, Clone, PartialEq)]
pub struct TableSchema {
    pub table: String,
    pub columns: Vec<ColumnDescriptor>,
}

impl TableSchema {
    /// Looks a caller reference up by canonical name, then display name, then
    /// by the canonical form of the reference.
    pub fn column(&self, reference: &str) -> Option<&ColumnDescriptor> {
        self.columns
            .iter()
            .find(|c| c.canonical_name == reference)
            .or_else(|| self.columns.iter().find(|c| c.display_name == reference))
            .or_else(|| {
                let canonical = sanitize(reference);
                self.columns.iter().find(|c| c.canonical_name == canonical)
            })
    }

    pub fn columns_on(&self, axis: Axis) -> impl Iterator<Item = &ColumnDescriptor> {
        self.columns.iter().filter(move |c| c.axis == axis)
    }

    pub fn canonical_names(&self) -> Vec<String> {
        self.columns
            .iter()
            .map(|c| c.canonical_name.clone())
            .collect()
    }
}

/// Builds the column descriptors of `table`.
///
/// A display name without a canonical form, or two display names that share
/// one, is a catalog error reported here rather than at query time.
pub fn discover(table: &VirtualTable) -> Result<TableSchema> {
    let mut seen: HashMap<String, String> = HashMap::new();
    let mut columns = Vec::with_capacity(table.dimensions.len());

    for dimension in &table.dimensions {
        let column = describe(dimension)?;
        if let Some(first) = seen.insert(
            column.canonical_name.clone(),
            dimension.display_name.clone(),
        ) {
            return Err(ConnectorError::DuplicateColumn {
                canonical: column.canonical_name,
                first,
                second: dimension.display_name.clone(),
            });
        }
        columns.push(column);
    }

    debug!(
        "Discovered {} columns for table {}: {:?}",
        columns.len(),
        table.name,
        columns
            .iter()
            .map(|c| c.canonical_name.as_str())
            .collect::<Vec<_>>()
    );

    Ok(TableSchema {
        table: table.name.clone(),
        columns,
    })
}

fn describe(dimension: &DimensionDescriptor) -> Result<ColumnDescriptor> {
    let canonical_name = try_sanitize(&dimension.display_name)?;
    let numeric = dimension.value_type.is_numeric() && !dimension.is_temporal;
    let semantic_type = if dimension.is_aggregatable || numeric {
        SemanticType::Float
    } else {
        SemanticType::String
    };

    Ok(ColumnDescriptor {
        canonical_name,
        display_name: dimension.display_name.clone(),
        semantic_type,
        groupable: !dimension.is_aggregatable,
        filterable: true,
        is_temporal: dimension.is_temporal,
        axis: dimension.axis,
        dimension_id: dimension.id.clone(),
        query_param: dimension.query_param.clone(),
    })
}
