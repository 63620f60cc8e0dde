pub mod discovery;
pub mod local_store;

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::normalize::ResponseShape;

pub use discovery::{discover, TableSchema};
pub use local_store::LocalCatalogStore;

/// Which upstream axis a dimension belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Axis {
    /// The `dx` column of a long-format table; its values are data item names.
    Data,
    /// One data element or indicator, exposed as its own measure column.
    DataItem,
    Period,
    OrgUnit,
    /// The value column of a long-format table.
    Value,
    /// A plain payload field (value sets, events, metadata lists).
    Field,
}

impl Default for Axis {
    fn default() -> Self {
        Axis::Field
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ValueType {
    Text,
    LongText,
    Number,
    Integer,
    IntegerPositive,
    IntegerNegative,
    IntegerZeroOrPositive,
    Percentage,
    UnitInterval,
    Boolean,
    TrueOnly,
    Date,
    Datetime,
    #[serde(other)]
    Other,
}

impl Default for ValueType {
    fn default() -> Self {
        ValueType::Text
    }
}

impl ValueType {
    pub fn is_numeric(&self) -> bool {
        matches!(
            self,
            ValueType::Number
                | ValueType::Integer
                | ValueType::IntegerPositive
                | ValueType::IntegerNegative
                | ValueType::IntegerZeroOrPositive
                | ValueType::Percentage
                | ValueType::UnitInterval
        )
    }
}

/// One upstream axis or field as declared in the catalog.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct DimensionDescriptor {
    pub id: String,
    pub display_name: String,
    #[serde(default)]
    pub value_type: ValueType,
    #[serde(default)]
    pub is_temporal: bool,
    #[serde(default)]
    pub is_aggregatable: bool,
    #[serde(default)]
    pub axis: Axis,
    /// Upstream request parameter that filters on this field, if any.
    #[serde(default)]
    pub query_param: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum SemanticType {
    String,
    Float,
}

/// A column of a virtual table as seen by the execution pipeline.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ColumnDescriptor {
    pub canonical_name: String,
    pub display_name: String,
    pub semantic_type: SemanticType,
    pub groupable: bool,
    pub filterable: bool,
    pub is_temporal: bool,
    pub axis: Axis,
    pub dimension_id: String,
    pub query_param: Option<String>,
}

/// A selectable member of the data axis of a long-format table.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct DataItem {
    pub id: String,
    pub display_name: String,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct VirtualTable {
    pub name: String,
    #[serde(default)]
    pub label: String,
    #[serde(default)]
    pub description: String,
    /// Path below `/api/`, e.g. `analytics` or `dataValueSets`.
    pub endpoint: String,
    pub shape: ResponseShape,
    pub dimensions: Vec<DimensionDescriptor>,
    #[serde(default)]
    pub data_items: Vec<DataItem>,
    #[serde(default)]
    pub default_periods: Vec<String>,
    #[serde(default)]
    pub default_org_units: Vec<String>,
    #[serde(default)]
    pub static_params: BTreeMap<String, String>,
    #[serde(default)]
    pub page_size: Option<u32>,
}

impl VirtualTable {
    pub fn is_analytics(&self) -> bool {
        matches!(
            self.shape,
            ResponseShape::AnalyticsLong | ResponseShape::AnalyticsWide
        )
    }

    /// Upstream field key → display name, used by the normalizers so that
    /// payload fields get the same canonical names discovery declared.
    pub fn display_names(&self) -> BTreeMap<String, String> {
        let mut names: BTreeMap<String, String> = self
            .dimensions
            .iter()
            .map(|d| (d.id.clone(), d.display_name.clone()))
            .collect();
        for item in &self.data_items {
            names
                .entry(item.id.clone())
                .or_insert_with(|| item.display_name.clone());
        }
        names
    }
}

/// Source of [`VirtualTable`] definitions.
pub trait CatalogStore: Send + Sync {
    fn get_table(&self, name: &str) -> Result<VirtualTable>;
    fn list_tables(&self) -> Result<BTreeMap<String, VirtualTable>>;
}
