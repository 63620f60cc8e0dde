//! The entry point the execution pipeline talks to.

use std::collections::HashMap;

use log::info;
use parking_lot::RwLock;
use serde_json::Value;

use crate::aggregate;
use crate::cache::{CacheStats, TtlCache};
use crate::catalog::{
    discover, Axis, CatalogStore, ColumnDescriptor, DimensionDescriptor, LocalCatalogStore,
    TableSchema, ValueType, VirtualTable,
};
use crate::config::{ConnectorSettings, UpstreamConfig};
use crate::cursor::{CursorColumn, TypedCursor, TypedValue};
use crate::error::{ConnectorError, Result};
use crate::loader::{LoadStrategy, Loader, PartialBatchFailure};
use crate::normalize::{NormalizeContext, ResponseShape};
use crate::query::sql::parse_select;
use crate::query::{translate, QueryObject, Translation};
use crate::upstream::{HttpTransport, RetryingFetcher, Transport};

/// Typed rows of one execution, plus how they were loaded.
#[derive(Debug)]
pub struct QueryResult {
    pub strategy: LoadStrategy,
    /// Set when some batches failed; their data items are missing from the rows.
    pub partial_failure: Option<PartialBatchFailure>,
    cursor: TypedCursor,
}

impl QueryResult {
    pub fn columns(&self) -> &[CursorColumn] {
        self.cursor.columns()
    }

    pub fn column_names(&self) -> &[String] {
        self.cursor.column_names()
    }

    /// Name of the result column a caller reference resolves to.
    pub fn resolve(&self, reference: &str) -> Result<String> {
        self.cursor.resolve(reference)
    }

    pub fn into_cursor(self) -> TypedCursor {
        self.cursor
    }
}

pub struct Connector<T, S> {
    store: S,
    fetcher: RetryingFetcher<T>,
    settings: ConnectorSettings,
    cache: Option<TtlCache>,
    schemas: RwLock<HashMap<String, TableSchema>>,
}

impl Connector<HttpTransport, LocalCatalogStore> {
    /// Builds a connector from `DHIS2_*` environment variables, reading the
    /// catalog from `DHIS2_CATALOG_PATH`.
    pub fn from_env() -> Result<Self> {
        let config =
            UpstreamConfig::new().map_err(|e| ConnectorError::Configuration(e.to_string()))?;
        let settings = ConnectorSettings::from_env()?;
        let store = LocalCatalogStore::from_json_file(&config.catalog_path)?;
        let transport = HttpTransport::from_config(&config)?;
        Self::new(transport, store, settings)
    }
}

impl<T: Transport, S: CatalogStore> Connector<T, S> {
    pub fn new(transport: T, store: S, settings: ConnectorSettings) -> Result<Self> {
        settings.validate()?;
        let cache = settings
            .cache
            .enabled
            .then(|| TtlCache::new(settings.cache.ttl));
        info!(
            "Connector ready: batch_size={}, max_concurrent_batches={}, max_retries={}, cache={}",
            settings.loading.batch_size,
            settings.loading.max_concurrent_batches,
            settings.retry.max_retries,
            if cache.is_some() { "on" } else { "off" }
        );
        Ok(Self {
            store,
            fetcher: RetryingFetcher::new(transport, settings.retry.clone()),
            settings,
            cache,
            schemas: RwLock::new(HashMap::new()),
        })
    }

    pub fn settings(&self) -> &ConnectorSettings {
        &self.settings
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn transport(&self) -> &T {
        self.fetcher.transport()
    }

    pub fn list_tables(&self) -> Result<Vec<String>> {
        Ok(self.store.list_tables()?.into_keys().collect())
    }

    /// Column descriptors of a virtual table. Cached per table until
    /// [`Connector::invalidate_schema`].
    pub fn discover_schema(&self, table: &str) -> Result<Vec<ColumnDescriptor>> {
        let table = self.store.get_table(table)?;
        Ok(self.schema(&table)?.columns)
    }

    fn schema(&self, table: &VirtualTable) -> Result<TableSchema> {
        if let Some(schema) = self.schemas.read().get(&table.name) {
            return Ok(schema.clone());
        }
        let schema = discover(table)?;
        self.schemas
            .write()
            .insert(table.name.clone(), schema.clone());
        Ok(schema)
    }

    pub fn invalidate_schema(&self, table: &str) -> bool {
        self.schemas.write().remove(table).is_some()
    }

    /// Runs `query` against one virtual table.
    pub async fn execute(&self, table: &str, query: &QueryObject) -> Result<QueryResult> {
        let table = self.store.get_table(table)?;
        let schema = self.schema(&table)?;
        let Translation { request, plan } = translate(&table, &schema, query)?;

        let loader = Loader::new(
            &self.fetcher,
            self.cache.as_ref(),
            &self.settings.loading,
            &self.settings.timeouts,
        );
        let context = NormalizeContext::for_table(&table);
        let loaded = loader.load(&table, &request, &context).await?;

        let filtered = aggregate::apply_filters(loaded.table, &plan)?;
        let cursor = aggregate::typed_cursor(filtered, &schema)?;
        let cursor = aggregate::evaluate(cursor, &plan)?;
        info!(
            "Executed query on {}: {} row(s), columns {:?}",
            table.name,
            cursor.remaining(),
            cursor.column_names()
        );

        Ok(QueryResult {
            strategy: loaded.strategy,
            partial_failure: loaded.partial_failure,
            cursor,
        })
    }

    /// Parses a single `SELECT` and runs it.
    pub async fn execute_sql(&self, sql: &str) -> Result<QueryResult> {
        let parsed = parse_select(sql)?;
        self.execute(&parsed.table, &parsed.query).await
    }

    /// Reads a metadata list table and turns each entry into a data item
    /// dimension, typed by its `valueType`.
    pub async fn load_data_items(&self, table: &str) -> Result<Vec<DimensionDescriptor>> {
        let virtual_table = self.store.get_table(table)?;
        if virtual_table.shape != ResponseShape::MetadataList {
            return Err(ConnectorError::InvalidQuery(format!(
                "table {} is not a metadata list",
                table
            )));
        }
        let schema = self.schema(&virtual_table)?;
        let column_of = |field: &str| -> Result<String> {
            schema
                .columns
                .iter()
                .find(|c| c.dimension_id == field)
                .map(|c| c.canonical_name.clone())
                .ok_or_else(|| ConnectorError::ColumnNotFound {
                    requested: field.to_string(),
                    available: schema.canonical_names(),
                })
        };
        let id_column = column_of("id")?;
        let name_column = column_of("displayName")?;
        let type_column = column_of("valueType").ok();

        let result = self.execute(table, &QueryObject::default()).await?;
        let mut descriptors = Vec::new();
        for row in result.into_cursor() {
            let Some(TypedValue::Text(id)) = row.get(&id_column) else {
                continue;
            };
            let name = match row.get(&name_column) {
                Some(TypedValue::Text(name)) => name.clone(),
                _ => id.clone(),
            };
            let value_type = type_column
                .as_deref()
                .and_then(|column| row.get(column))
                .and_then(TypedValue::as_str)
                .and_then(|v| serde_json::from_value(Value::String(v.to_string())).ok())
                .unwrap_or(ValueType::Number);
            descriptors.push(DimensionDescriptor {
                id: id.clone(),
                display_name: name,
                value_type,
                is_temporal: false,
                is_aggregatable: value_type.is_numeric(),
                axis: Axis::DataItem,
                query_param: None,
            });
        }
        info!("Loaded {} data item(s) from {}", descriptors.len(), table);
        Ok(descriptors)
    }

    pub fn clear_cache(&self) {
        if let Some(cache) = &self.cache {
            cache.clear();
        }
    }

    pub fn purge_expired(&self) -> usize {
        self.cache.as_ref().map_or(0, TtlCache::purge_expired)
    }

    pub fn cache_stats(&self) -> Option<CacheStats> {
        self.cache.as_ref().map(TtlCache::stats)
    }
}
