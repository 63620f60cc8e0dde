use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use log::{debug, info};

use super::{Axis, CatalogStore, DataItem, DimensionDescriptor, ValueType, VirtualTable};
use crate::error::{ConnectorError, Result};
use crate::normalize::ResponseShape;

/// In-memory catalog, loaded from a JSON file or built from the mock tables.
#[derive(Clone, Debug, Default)]
pub struct LocalCatalogStore {
    tables: BTreeMap<String, VirtualTable>,
}

impl LocalCatalogStore {
    pub fn new(tables: Vec<VirtualTable>) -> Self {
        Self {
            tables: tables
                .into_iter()
                .map(|table| (table.name.clone(), table))
                .collect(),
        }
    }

    /// Reads a JSON array of virtual table definitions.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path).map_err(|e| {
            ConnectorError::Catalog(format!("cannot read {}: {}", path.display(), e))
        })?;
        let store = Self::from_json_str(&content)?;
        info!(
            "Loaded {} virtual tables from {}",
            store.tables.len(),
            path.display()
        );
        Ok(store)
    }

    pub fn from_json_str(content: &str) -> Result<Self> {
        let tables: Vec<VirtualTable> = serde_json::from_str(content)
            .map_err(|e| ConnectorError::Catalog(format!("invalid catalog JSON: {}", e)))?;
        Ok(Self::new(tables))
    }

    pub fn insert(&mut self, table: VirtualTable) {
        debug!("Registering virtual table {}", table.name);
        self.tables.insert(table.name.clone(), table);
    }

    pub fn mock() -> Self {
        Self::new(vec![
            analytics_table(),
            analytics_long_table(),
            data_values_table(),
            events_table(),
            tracked_entities_table(),
            data_elements_table(),
        ])
    }
}

impl CatalogStore for LocalCatalogStore {
    fn get_table(&self, name: &str) -> Result<VirtualTable> {
        self.tables
            .get(name)
            .cloned()
            .ok_or_else(|| ConnectorError::TableNotFound(name.to_string()))
    }

    fn list_tables(&self) -> Result<BTreeMap<String, VirtualTable>> {
        Ok(self.tables.clone())
    }
}

fn field(id: &str, display_name: &str, value_type: ValueType) -> DimensionDescriptor {
    DimensionDescriptor {
        id: id.to_string(),
        display_name: display_name.to_string(),
        value_type,
        is_temporal: false,
        is_aggregatable: false,
        axis: Axis::Field,
        query_param: None,
    }
}

fn measure(id: &str, display_name: &str, axis: Axis) -> DimensionDescriptor {
    DimensionDescriptor {
        is_aggregatable: true,
        axis,
        ..field(id, display_name, ValueType::Number)
    }
}

fn org_unit(id: &str) -> DimensionDescriptor {
    DimensionDescriptor {
        axis: Axis::OrgUnit,
        ..field(id, "Organisation unit", ValueType::Text)
    }
}

fn period(id: &str, display_name: &str) -> DimensionDescriptor {
    DimensionDescriptor {
        is_temporal: true,
        axis: Axis::Period,
        ..field(id, display_name, ValueType::Text)
    }
}

fn with_param(dimension: DimensionDescriptor, param: &str) -> DimensionDescriptor {
    DimensionDescriptor {
        query_param: Some(param.to_string()),
        ..dimension
    }
}

fn mock_data_items() -> Vec<DataItem> {
    [
        ("fbfJHSPpUQD", "ANC 1st visit"),
        ("cYeuwXTCPkU", "ANC 2nd visit"),
        ("hfdmMSPBgLG", "105-EP01b. Malaria Total"),
    ]
    .into_iter()
    .map(|(id, display_name)| DataItem {
        id: id.to_string(),
        display_name: display_name.to_string(),
    })
    .collect()
}

fn analytics_table() -> VirtualTable {
    let mut dimensions = vec![org_unit("ou"), period("pe", "Period")];
    dimensions.extend(
        mock_data_items()
            .iter()
            .map(|item| measure(&item.id, &item.display_name, Axis::DataItem)),
    );
    VirtualTable {
        name: "analytics".to_string(),
        label: "Analytics".to_string(),
        description: "Aggregated data values, one column per data element".to_string(),
        endpoint: "analytics".to_string(),
        shape: ResponseShape::AnalyticsWide,
        dimensions,
        data_items: Vec::new(),
        default_periods: vec!["LAST_12_MONTHS".to_string()],
        default_org_units: vec!["USER_ORGUNIT".to_string()],
        static_params: BTreeMap::new(),
        page_size: None,
    }
}

fn analytics_long_table() -> VirtualTable {
    VirtualTable {
        name: "analytics_long".to_string(),
        label: "Analytics (long)".to_string(),
        description: "Aggregated data values, one row per data element".to_string(),
        endpoint: "analytics".to_string(),
        shape: ResponseShape::AnalyticsLong,
        dimensions: vec![
            DimensionDescriptor {
                axis: Axis::Data,
                ..field("dx", "Data", ValueType::Text)
            },
            period("pe", "Period"),
            org_unit("ou"),
            measure("value", "Value", Axis::Value),
        ],
        data_items: mock_data_items(),
        default_periods: vec!["LAST_12_MONTHS".to_string()],
        default_org_units: vec!["USER_ORGUNIT".to_string()],
        static_params: BTreeMap::new(),
        page_size: None,
    }
}

fn data_values_table() -> VirtualTable {
    VirtualTable {
        name: "data_values".to_string(),
        label: "Data values".to_string(),
        description: "Raw data values of one data set".to_string(),
        endpoint: "dataValueSets".to_string(),
        shape: ResponseShape::ValueSet,
        dimensions: vec![
            field("dataElement", "Data element", ValueType::Text),
            with_param(period("period", "Period"), "period"),
            with_param(org_unit("orgUnit"), "orgUnit"),
            field("categoryOptionCombo", "Category option combo", ValueType::Text),
            measure("value", "Value", Axis::Field),
            field("storedBy", "Stored by", ValueType::Text),
            field("lastUpdated", "Last updated", ValueType::Datetime),
        ],
        data_items: Vec::new(),
        default_periods: Vec::new(),
        default_org_units: Vec::new(),
        static_params: BTreeMap::from([("dataSet".to_string(), "BfMAe6Itzgt".to_string())]),
        page_size: None,
    }
}

fn events_table() -> VirtualTable {
    VirtualTable {
        name: "events".to_string(),
        label: "Events".to_string(),
        description: "Tracker events of one program".to_string(),
        endpoint: "tracker/events".to_string(),
        shape: ResponseShape::EventSet,
        dimensions: vec![
            field("event", "Event", ValueType::Text),
            with_param(field("program", "Program", ValueType::Text), "program"),
            with_param(org_unit("orgUnit"), "orgUnit"),
            period("occurredAt", "Occurred at"),
            field("status", "Status", ValueType::Text),
            measure("qrur9Dvnyt5", "Age in years", Axis::Field),
            field("oZg33kd9taw", "Gender", ValueType::Text),
        ],
        data_items: Vec::new(),
        default_periods: Vec::new(),
        default_org_units: Vec::new(),
        static_params: BTreeMap::from([("program".to_string(), "eBAyeGv0exc".to_string())]),
        page_size: Some(50),
    }
}

fn tracked_entities_table() -> VirtualTable {
    VirtualTable {
        name: "tracked_entities".to_string(),
        label: "Tracked entities".to_string(),
        description: "Enrolled tracked entities with their attributes".to_string(),
        endpoint: "tracker/trackedEntities".to_string(),
        shape: ResponseShape::EntitySet,
        dimensions: vec![
            field("trackedEntity", "Tracked entity", ValueType::Text),
            with_param(org_unit("orgUnit"), "orgUnit"),
            period("createdAt", "Created at"),
            field("w75KJ2mc4zz", "First name", ValueType::Text),
            field("zDhUuAYrxNC", "Last name", ValueType::Text),
        ],
        data_items: Vec::new(),
        default_periods: Vec::new(),
        default_org_units: Vec::new(),
        static_params: BTreeMap::from([("program".to_string(), "IpHINAT79UW".to_string())]),
        page_size: Some(50),
    }
}

fn data_elements_table() -> VirtualTable {
    VirtualTable {
        name: "data_elements".to_string(),
        label: "Data elements".to_string(),
        description: "Data element metadata".to_string(),
        endpoint: "dataElements".to_string(),
        shape: ResponseShape::MetadataList,
        dimensions: vec![
            field("id", "Id", ValueType::Text),
            field("displayName", "Display name", ValueType::Text),
            field("valueType", "Value type", ValueType::Text),
        ],
        data_items: Vec::new(),
        default_periods: Vec::new(),
        default_org_units: Vec::new(),
        static_params: BTreeMap::from([(
            "fields".to_string(),
            "id,displayName,valueType".to_string(),
        )]),
        page_size: Some(50),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mock_tables_are_listed() {
        let store = LocalCatalogStore::mock();
        let tables = store.list_tables().unwrap();
        assert_eq!(tables.len(), 6);
        assert!(tables.contains_key("analytics"));
        assert!(matches!(
            store.get_table("nope"),
            Err(ConnectorError::TableNotFound(name)) if name == "nope"
        ));
    }

    #[test]
    fn test_from_json_str() {
        let json = r#"
        [
            {
                "name": "malaria",
                "endpoint": "analytics",
                "shape": "analytics_wide",
                "dimensions": [
                    {"id": "ou", "display_name": "Organisation unit", "axis": "org_unit"},
                    {"id": "pe", "display_name": "Period", "axis": "period", "is_temporal": true},
                    {
                        "id": "hfdmMSPBgLG",
                        "display_name": "105-EP01b. Malaria Total",
                        "value_type": "NUMBER",
                        "is_aggregatable": true,
                        "axis": "data_item"
                    },
                    {"id": "x", "display_name": "Odd", "value_type": "FILE_RESOURCE"}
                ],
                "default_org_units": ["ImspTQPwCqd"]
            }
        ]
        "#;
        let store = LocalCatalogStore::from_json_str(json).unwrap();
        let table = store.get_table("malaria").unwrap();
        assert_eq!(table.shape, ResponseShape::AnalyticsWide);
        assert_eq!(table.dimensions[1].axis, Axis::Period);
        assert_eq!(table.dimensions[2].value_type, ValueType::Number);
        assert_eq!(table.dimensions[3].value_type, ValueType::Other);
        assert_eq!(table.dimensions[3].axis, Axis::Field);
        assert_eq!(table.default_org_units, vec!["ImspTQPwCqd".to_string()]);
        assert!(table.default_periods.is_empty());
    }

    #[test]
    fn test_invalid_json_is_catalog_error() {
        assert!(matches!(
            LocalCatalogStore::from_json_str("{not json"),
            Err(ConnectorError::Catalog(_))
        ));
    }
}
