use std::collections::HashSet;

use log::debug;

use super::period::{period_codes, TimeGrain, TimeRange};
use super::{AggregateFn, Filter, QueryObject, ALL_ROWS};
use crate::catalog::{Axis, ColumnDescriptor, DataItem, TableSchema, VirtualTable};
use crate::error::{ConnectorError, Result};
use crate::sanitize::sanitize;

/// Dimension items and plain parameters of the upstream request.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DimensionRequest {
    pub data_items: Vec<DataItem>,
    pub periods: Vec<String>,
    pub org_units: Vec<String>,
    pub params: Vec<(String, String)>,
}

impl DimensionRequest {
    /// `|data items| × |organisation units|`, each counted as at least one.
    pub fn complexity(&self) -> usize {
        self.data_items.len().max(1) * self.org_units.len().max(1)
    }
}

/// One dimension column of the result, in caller order.
#[derive(Debug, Clone, PartialEq)]
pub struct OutputDimension {
    pub column: String,
    /// Set only for a temporal granularity column with a time grain.
    pub bucket: Option<TimeGrain>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PlannedMetric {
    pub aggregate_fn: AggregateFn,
    /// Canonical source column; `None` counts rows.
    pub column: Option<String>,
    pub output_name: String,
}

/// Work left to do on the normalized table after loading.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LocalPlan {
    pub dimensions: Vec<OutputDimension>,
    pub metrics: Vec<PlannedMetric>,
    /// Rows are grouped by the dimensions when there are metrics or group-bys.
    pub grouped: bool,
    pub filters: Vec<Filter>,
    pub time_filter: Option<(String, TimeRange)>,
    pub row_limit: Option<usize>,
}

impl LocalPlan {
    /// No projection at all: every normalized column is returned.
    pub fn is_passthrough(&self) -> bool {
        self.dimensions.is_empty() && self.metrics.is_empty()
    }

    pub fn output_names(&self) -> Vec<String> {
        self.dimensions
            .iter()
            .map(|d| d.column.clone())
            .chain(self.metrics.iter().map(|m| m.output_name.clone()))
            .collect()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Translation {
    pub request: DimensionRequest,
    pub plan: LocalPlan,
}

fn lookup<'a>(schema: &'a TableSchema, reference: &str) -> Result<&'a ColumnDescriptor> {
    schema
        .column(reference)
        .ok_or_else(|| ConnectorError::ColumnNotFound {
            requested: reference.to_string(),
            available: schema.canonical_names(),
        })
}

/// Translates `query` against one virtual table.
pub fn translate(
    table: &VirtualTable,
    schema: &TableSchema,
    query: &QueryObject,
) -> Result<Translation> {
    let granularity = match &query.granularity_column_key {
        Some(key) => Some(
            schema
                .column(key)
                .ok_or_else(|| ConnectorError::MissingDimensionColumn(key.clone()))?,
        ),
        None => None,
    };

    let dimensions = output_dimensions(schema, query, granularity)?;
    let metrics = planned_metrics(schema, query)?;
    let mut plan = LocalPlan {
        dimensions,
        metrics,
        grouped: !query.metrics.is_empty() || !query.group_by.is_empty(),
        filters: Vec::new(),
        time_filter: None,
        row_limit: query.row_limit,
    };
    check_unique_outputs(&plan)?;

    let request = if table.is_analytics() {
        analytics_request(table, schema, query, &mut plan)?
    } else {
        record_request(table, schema, query, granularity, &mut plan)?
    };

    debug!(
        "Translated query on {}: {} data item(s), {} period(s), {} org unit(s), outputs {:?}",
        table.name,
        request.data_items.len(),
        request.periods.len(),
        request.org_units.len(),
        plan.output_names()
    );
    Ok(Translation { request, plan })
}

fn output_dimensions(
    schema: &TableSchema,
    query: &QueryObject,
    granularity: Option<&ColumnDescriptor>,
) -> Result<Vec<OutputDimension>> {
    let mut seen = HashSet::new();
    let mut dimensions = Vec::new();
    for reference in query.columns.iter().chain(&query.group_by) {
        let column = lookup(schema, reference)?;
        if !seen.insert(column.canonical_name.clone()) {
            continue;
        }
        let is_granularity =
            granularity.map_or(false, |g| g.canonical_name == column.canonical_name);
        let bucket = if is_granularity && column.is_temporal {
            query.time_grain
        } else {
            if is_granularity {
                debug!(
                    "Granularity column {} is categorical; keeping it at position {}",
                    column.canonical_name,
                    dimensions.len()
                );
            }
            None
        };
        dimensions.push(OutputDimension {
            column: column.canonical_name.clone(),
            bucket,
        });
    }
    Ok(dimensions)
}

fn planned_metrics(schema: &TableSchema, query: &QueryObject) -> Result<Vec<PlannedMetric>> {
    let mut seen: HashSet<(AggregateFn, Option<String>, Option<String>)> = HashSet::new();
    let mut metrics = Vec::new();
    for metric in &query.metrics {
        let column = if metric.column_ref == ALL_ROWS {
            if metric.aggregate_fn != AggregateFn::Count {
                return Err(ConnectorError::InvalidQuery(format!(
                    "{}(*) is not supported; only COUNT(*) is",
                    metric.aggregate_fn
                )));
            }
            None
        } else {
            let canonical = sanitize(&metric.column_ref);
            let column = schema.column(&canonical).ok_or_else(|| {
                ConnectorError::ColumnNotFound {
                    requested: metric.column_ref.clone(),
                    available: schema.canonical_names(),
                }
            })?;
            Some(column.canonical_name.clone())
        };

        if !seen.insert((metric.aggregate_fn, column.clone(), metric.label.clone())) {
            debug!(
                "Dropping repeated metric {}({})",
                metric.aggregate_fn, metric.column_ref
            );
            continue;
        }
        let output_name = metric.label.clone().unwrap_or_else(|| {
            metric
                .aggregate_fn
                .label(column.as_deref().unwrap_or(ALL_ROWS))
        });
        metrics.push(PlannedMetric {
            aggregate_fn: metric.aggregate_fn,
            column,
            output_name,
        });
    }
    Ok(metrics)
}

fn check_unique_outputs(plan: &LocalPlan) -> Result<()> {
    let mut seen = HashSet::new();
    for name in plan.output_names() {
        if !seen.insert(name.clone()) {
            return Err(ConnectorError::InvalidQuery(format!(
                "more than one result column is named {:?}",
                name
            )));
        }
    }
    Ok(())
}

fn analytics_request(
    table: &VirtualTable,
    schema: &TableSchema,
    query: &QueryObject,
    plan: &mut LocalPlan,
) -> Result<DimensionRequest> {
    let mut data_items = if schema.columns_on(Axis::Data).next().is_some() {
        table.data_items.clone()
    } else {
        referenced_data_items(schema, query, plan)?
    };
    let mut periods = Vec::new();
    let mut org_units = Vec::new();
    let mut excluded_periods = Vec::new();
    let mut excluded_org_units = Vec::new();

    for filter in &query.filters {
        let column = lookup(schema, &filter.column)?;
        let inclusive = filter.op.is_inclusive();
        match column.axis {
            Axis::Period if inclusive => periods.extend(filter.values.iter().cloned()),
            Axis::OrgUnit if inclusive => org_units.extend(filter.values.iter().cloned()),
            // Ids leave the dimension list. Org unit cells come back as
            // display names, so a local filter still handles excluded names.
            Axis::Period | Axis::OrgUnit => {
                let excluded = if column.axis == Axis::Period {
                    &mut excluded_periods
                } else {
                    &mut excluded_org_units
                };
                excluded.extend(filter.values.iter().cloned());
                plan.filters.push(Filter::new(
                    column.canonical_name.clone(),
                    filter.op,
                    filter.values.clone(),
                ));
            }
            Axis::Data => data_items.retain(|item| {
                let listed = filter
                    .values
                    .iter()
                    .any(|v| *v == item.id || *v == item.display_name);
                listed == inclusive
            }),
            _ => plan.filters.push(Filter::new(
                column.canonical_name.clone(),
                filter.op,
                filter.values.clone(),
            )),
        }
    }

    if data_items.is_empty() {
        return Err(ConnectorError::InvalidQuery(format!(
            "no data items selected from table {}",
            table.name
        )));
    }
    if periods.is_empty() {
        periods = match &query.time_range {
            Some(range) => period_codes(range, query.time_grain.unwrap_or(TimeGrain::Month)),
            None => table.default_periods.clone(),
        };
    }
    periods.retain(|p| !excluded_periods.contains(p));
    if periods.is_empty() {
        return Err(ConnectorError::InvalidQuery(format!(
            "table {} needs a period filter or a time range",
            table.name
        )));
    }
    if org_units.is_empty() {
        org_units = table.default_org_units.clone();
    }
    org_units.retain(|ou| !excluded_org_units.contains(ou));
    if org_units.is_empty() {
        return Err(ConnectorError::InvalidQuery(format!(
            "table {} needs an organisation unit filter",
            table.name
        )));
    }

    let mut params: Vec<(String, String)> = table
        .static_params
        .iter()
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect();
    if !table.static_params.contains_key("displayProperty") {
        params.push(("displayProperty".to_string(), "NAME".to_string()));
    }

    Ok(DimensionRequest {
        data_items,
        periods,
        org_units,
        params,
    })
}

/// Data item columns of a wide table that the query touches, or all of
/// them when it touches none.
fn referenced_data_items(
    schema: &TableSchema,
    query: &QueryObject,
    plan: &LocalPlan,
) -> Result<Vec<DataItem>> {
    let mut referenced: HashSet<String> = plan
        .dimensions
        .iter()
        .map(|d| d.column.clone())
        .chain(plan.metrics.iter().filter_map(|m| m.column.clone()))
        .collect();
    for filter in &query.filters {
        referenced.insert(lookup(schema, &filter.column)?.canonical_name.clone());
    }

    let all: Vec<&ColumnDescriptor> = schema.columns_on(Axis::DataItem).collect();
    let chosen: Vec<&ColumnDescriptor> = all
        .iter()
        .copied()
        .filter(|c| referenced.contains(&c.canonical_name))
        .collect();
    let chosen = if chosen.is_empty() { all } else { chosen };
    Ok(chosen
        .into_iter()
        .map(|c| DataItem {
            id: c.dimension_id.clone(),
            display_name: c.display_name.clone(),
        })
        .collect())
}

fn record_request(
    table: &VirtualTable,
    schema: &TableSchema,
    query: &QueryObject,
    granularity: Option<&ColumnDescriptor>,
    plan: &mut LocalPlan,
) -> Result<DimensionRequest> {
    let mut params: Vec<(String, String)> = table
        .static_params
        .iter()
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect();

    for filter in &query.filters {
        let column = lookup(schema, &filter.column)?;
        match (&column.query_param, filter.op.is_inclusive(), filter.values.as_slice()) {
            (Some(param), true, [value]) => {
                params.retain(|(k, _)| k != param);
                params.push((param.clone(), value.clone()));
            }
            _ => plan.filters.push(Filter::new(
                column.canonical_name.clone(),
                filter.op,
                filter.values.clone(),
            )),
        }
    }

    if let Some(range) = query.time_range {
        params.push(("startDate".to_string(), range.start.format("%Y-%m-%d").to_string()));
        params.push(("endDate".to_string(), range.end.format("%Y-%m-%d").to_string()));
        let temporal = granularity
            .filter(|c| c.is_temporal)
            .or_else(|| schema.columns.iter().find(|c| c.is_temporal));
        if let Some(column) = temporal {
            plan.time_filter = Some((column.canonical_name.clone(), range));
        }
    }

    Ok(DimensionRequest {
        params,
        ..DimensionRequest::default()
    })
}
