//! Local evaluation of a [`LocalPlan`] over a loaded table.

use std::cmp::Ordering;
use std::collections::{HashMap, HashSet};

use log::debug;
use serde_json::Value;

use crate::catalog::{SemanticType, TableSchema};
use crate::cursor::{CursorColumn, TypedCursor, TypedValue};
use crate::error::Result;
use crate::normalize::NormalizedTable;
use crate::query::period::{bucket, parse_period};
use crate::query::{AggregateFn, LocalPlan, PlannedMetric};
use crate::resolver;

fn cell_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

/// Drops the rows that the plan's local filters and time filter reject.
pub fn apply_filters(table: NormalizedTable, plan: &LocalPlan) -> Result<NormalizedTable> {
    let mut table = table;
    let before = table.len();

    for filter in &plan.filters {
        let index = resolver::resolve_index(&filter.column, table.column_names())?;
        table = table.retain_rows(|row| filter.matches(&cell_text(&row[index])));
    }

    if let Some((column, range)) = &plan.time_filter {
        let index = resolver::resolve_index(column, table.column_names())?;
        table = table.retain_rows(|row| match parse_period(&cell_text(&row[index])) {
            Some(date) => range.contains(date),
            None => true,
        });
    }

    if table.len() != before {
        debug!("Local filters kept {} of {} rows", table.len(), before);
    }
    Ok(table)
}

/// Builds a cursor over `table`, typing each column from the schema.
/// Columns the schema does not declare are strings.
pub fn typed_cursor(table: NormalizedTable, schema: &TableSchema) -> Result<TypedCursor> {
    let (names, rows) = table.into_parts();
    let columns = names
        .into_iter()
        .map(|name| {
            let semantic_type = schema
                .columns
                .iter()
                .find(|c| c.canonical_name == name)
                .map_or(SemanticType::String, |c| c.semantic_type);
            CursorColumn::new(name, semantic_type)
        })
        .collect();
    TypedCursor::new(columns, rows)
}

struct Group {
    dimensions: Vec<TypedValue>,
    rows: usize,
    inputs: Vec<Vec<TypedValue>>,
}

/// Projects, groups and aggregates the cursor as the plan asks.
pub fn evaluate(cursor: TypedCursor, plan: &LocalPlan) -> Result<TypedCursor> {
    if plan.is_passthrough() {
        let (columns, mut rows) = cursor.into_parts();
        limit(&mut rows, plan.row_limit);
        return TypedCursor::from_typed(columns, rows);
    }

    let names = cursor.column_names().to_vec();
    let source_types: Vec<SemanticType> =
        cursor.columns().iter().map(|c| c.semantic_type).collect();

    let dimension_indexes = plan
        .dimensions
        .iter()
        .map(|d| resolver::resolve_index(&d.column, &names))
        .collect::<Result<Vec<_>>>()?;
    let metric_indexes = plan
        .metrics
        .iter()
        .map(|m| match &m.column {
            Some(column) => resolver::resolve_index(column, &names).map(Some),
            None => Ok(None),
        })
        .collect::<Result<Vec<_>>>()?;

    let mut columns: Vec<CursorColumn> = plan
        .dimensions
        .iter()
        .zip(&dimension_indexes)
        .map(|(d, &index)| {
            let semantic_type = if d.bucket.is_some() {
                SemanticType::String
            } else {
                source_types[index]
            };
            CursorColumn::new(d.column.clone(), semantic_type)
        })
        .collect();
    columns.extend(plan.metrics.iter().zip(&metric_indexes).map(|(m, index)| {
        let semantic_type = match (m.aggregate_fn, index) {
            (AggregateFn::Min | AggregateFn::Max, Some(index)) => source_types[*index],
            _ => SemanticType::Float,
        };
        CursorColumn::new(m.output_name.clone(), semantic_type)
    }));

    let project = |values: &[TypedValue]| -> Vec<TypedValue> {
        plan.dimensions
            .iter()
            .zip(&dimension_indexes)
            .map(|(d, &index)| match (&values[index], d.bucket) {
                (TypedValue::Text(text), Some(grain)) => TypedValue::Text(bucket(text, grain)),
                (value, _) => value.clone(),
            })
            .collect()
    };

    if !plan.grouped {
        let mut rows: Vec<Vec<TypedValue>> = cursor.map(|row| project(row.values())).collect();
        limit(&mut rows, plan.row_limit);
        return TypedCursor::from_typed(columns, rows);
    }

    let mut groups: Vec<Group> = Vec::new();
    let mut index_of: HashMap<Vec<Option<String>>, usize> = HashMap::new();
    for row in cursor {
        let dimensions = project(row.values());
        let key: Vec<Option<String>> = dimensions.iter().map(TypedValue::key).collect();
        let position = *index_of.entry(key).or_insert_with(|| {
            groups.push(Group {
                dimensions,
                rows: 0,
                inputs: vec![Vec::new(); plan.metrics.len()],
            });
            groups.len() - 1
        });
        let group = &mut groups[position];
        group.rows += 1;
        for (inputs, index) in group.inputs.iter_mut().zip(&metric_indexes) {
            if let Some(index) = index {
                inputs.push(row.values()[*index].clone());
            }
        }
    }
    if groups.is_empty() && plan.dimensions.is_empty() {
        groups.push(Group {
            dimensions: Vec::new(),
            rows: 0,
            inputs: vec![Vec::new(); plan.metrics.len()],
        });
    }
    debug!(
        "Aggregated into {} group(s) over {} dimension(s)",
        groups.len(),
        plan.dimensions.len()
    );

    let mut rows: Vec<Vec<TypedValue>> = groups
        .into_iter()
        .map(|group| {
            let mut values = group.dimensions;
            for ((metric, inputs), index) in plan.metrics.iter().zip(&group.inputs).zip(&metric_indexes) {
                let numeric = index.map_or(false, |i| source_types[i] == SemanticType::Float);
                values.push(compute(metric, group.rows, inputs, numeric));
            }
            values
        })
        .collect();
    limit(&mut rows, plan.row_limit);
    TypedCursor::from_typed(columns, rows)
}

fn limit(rows: &mut Vec<Vec<TypedValue>>, row_limit: Option<usize>) {
    if let Some(max) = row_limit {
        rows.truncate(max);
    }
}

fn compute(metric: &PlannedMetric, rows: usize, inputs: &[TypedValue], numeric: bool) -> TypedValue {
    let present = || inputs.iter().filter(|v| !v.is_null());
    let numbers = || present().filter_map(TypedValue::as_f64).collect::<Vec<f64>>();

    match metric.aggregate_fn {
        AggregateFn::Count if metric.column.is_none() => TypedValue::Float(rows as f64),
        AggregateFn::Count => TypedValue::Float(present().count() as f64),
        AggregateFn::CountDistinct if metric.column.is_none() => TypedValue::Float(rows as f64),
        AggregateFn::CountDistinct => {
            let distinct: HashSet<String> = present().filter_map(TypedValue::key).collect();
            TypedValue::Float(distinct.len() as f64)
        }
        AggregateFn::Sum => {
            let values = numbers();
            if values.is_empty() {
                TypedValue::Null
            } else {
                TypedValue::Float(values.iter().sum())
            }
        }
        AggregateFn::Avg => {
            let values = numbers();
            if values.is_empty() {
                TypedValue::Null
            } else {
                TypedValue::Float(values.iter().sum::<f64>() / values.len() as f64)
            }
        }
        AggregateFn::Median => median(numbers()),
        AggregateFn::Min | AggregateFn::Max => {
            let compare = |a: &&TypedValue, b: &&TypedValue| -> Ordering {
                if numeric {
                    let (a, b) = (a.as_f64().unwrap_or(f64::NAN), b.as_f64().unwrap_or(f64::NAN));
                    a.partial_cmp(&b).unwrap_or(Ordering::Equal)
                } else {
                    a.to_string().cmp(&b.to_string())
                }
            };
            let chosen = if metric.aggregate_fn == AggregateFn::Min {
                present().min_by(compare)
            } else {
                present().max_by(compare)
            };
            chosen.cloned().unwrap_or(TypedValue::Null)
        }
    }
}

fn median(mut values: Vec<f64>) -> TypedValue {
    if values.is_empty() {
        return TypedValue::Null;
    }
    values.sort_by(|a, b| a.partial_cmp(b).unwrap_or(Ordering::Equal));
    let mid = values.len() / 2;
    if values.len() % 2 == 0 {
        TypedValue::Float((values[mid - 1] + values[mid]) / 2.0)
    } else {
        TypedValue::Float(values[mid])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::query::{Filter, FilterOp, OutputDimension, TimeGrain, TimeRange};
    use chrono::NaiveDate;
    use rstest::{fixture, rstest};
    use serde_json::json;

    fn strings(values: &[&str]) -> Vec<String> {
        values.iter().map(|v| v.to_string()).collect()
    }

    #[fixture]
    fn wide() -> TypedCursor {
        TypedCursor::new(
            vec![
                CursorColumn::new("Organisation_unit", SemanticType::String),
                CursorColumn::new("Period", SemanticType::String),
                CursorColumn::new("ANC_1st_visit", SemanticType::Float),
            ],
            vec![
                vec![json!("Bo"), json!("202401"), json!("10")],
                vec![json!("Bo"), json!("202402"), json!("20")],
                vec![json!("Bombali"), json!("202401"), json!("5")],
                vec![json!("Bombali"), json!("202404"), json!(null)],
            ],
        )
        .unwrap()
    }

    fn dimension(column: &str) -> OutputDimension {
        OutputDimension {
            column: column.to_string(),
            bucket: None,
        }
    }

    fn metric(aggregate_fn: AggregateFn, column: Option<&str>) -> PlannedMetric {
        let column = column.map(str::to_string);
        PlannedMetric {
            aggregate_fn,
            output_name: aggregate_fn.label(column.as_deref().unwrap_or("*")),
            column,
        }
    }

    fn rows(cursor: TypedCursor) -> Vec<Vec<TypedValue>> {
        cursor.map(|row| row.into_values()).collect()
    }

    fn text(value: &str) -> TypedValue {
        TypedValue::Text(value.to_string())
    }

    #[rstest]
    fn test_several_metrics_on_one_column(wide: TypedCursor) {
        let plan = LocalPlan {
            dimensions: vec![dimension("Organisation_unit")],
            metrics: vec![
                metric(AggregateFn::Sum, Some("ANC_1st_visit")),
                metric(AggregateFn::Avg, Some("ANC_1st_visit")),
                metric(AggregateFn::Max, Some("ANC_1st_visit")),
                metric(AggregateFn::Count, None),
            ],
            grouped: true,
            ..LocalPlan::default()
        };
        let result = evaluate(wide, &plan).unwrap();
        assert_eq!(
            result.column_names(),
            strings(&[
                "Organisation_unit",
                "SUM(ANC_1st_visit)",
                "AVG(ANC_1st_visit)",
                "MAX(ANC_1st_visit)",
                "COUNT(*)"
            ])
            .as_slice()
        );
        assert_eq!(
            rows(result),
            vec![
                vec![
                    text("Bo"),
                    TypedValue::Float(30.0),
                    TypedValue::Float(15.0),
                    TypedValue::Float(20.0),
                    TypedValue::Float(2.0)
                ],
                vec![
                    text("Bombali"),
                    TypedValue::Float(5.0),
                    TypedValue::Float(5.0),
                    TypedValue::Float(5.0),
                    TypedValue::Float(2.0)
                ],
            ]
        );
    }

    #[rstest]
    fn test_categorical_dimension_keeps_caller_position(wide: TypedCursor) {
        let plan = LocalPlan {
            dimensions: vec![dimension("Period"), dimension("Organisation_unit")],
            metrics: vec![metric(AggregateFn::Sum, Some("ANC_1st_visit"))],
            grouped: true,
            ..LocalPlan::default()
        };
        let result = evaluate(wide, &plan).unwrap();
        for row in rows(result) {
            assert!(matches!(&row[1], TypedValue::Text(ou) if ou.starts_with("Bo")));
        }
    }

    #[rstest]
    fn test_temporal_dimension_is_bucketed(wide: TypedCursor) {
        let plan = LocalPlan {
            dimensions: vec![OutputDimension {
                column: "Period".to_string(),
                bucket: Some(TimeGrain::Quarter),
            }],
            metrics: vec![metric(AggregateFn::Sum, Some("ANC_1st_visit"))],
            grouped: true,
            ..LocalPlan::default()
        };
        assert_eq!(
            rows(evaluate(wide, &plan).unwrap()),
            vec![
                vec![text("2024-01-01"), TypedValue::Float(35.0)],
                vec![text("2024-04-01"), TypedValue::Null],
            ]
        );
    }

    #[rstest]
    fn test_projection_without_metrics_keeps_rows(wide: TypedCursor) {
        let plan = LocalPlan {
            dimensions: vec![dimension("Period")],
            row_limit: Some(3),
            ..LocalPlan::default()
        };
        assert_eq!(
            rows(evaluate(wide, &plan).unwrap()),
            vec![vec![text("202401")], vec![text("202402")], vec![text("202401")]]
        );
    }

    #[test]
    fn test_metrics_over_no_rows_yield_one_row() {
        let empty = TypedCursor::new(
            vec![CursorColumn::new("Value", SemanticType::Float)],
            Vec::new(),
        )
        .unwrap();
        let plan = LocalPlan {
            metrics: vec![
                metric(AggregateFn::Sum, Some("Value")),
                metric(AggregateFn::Count, None),
            ],
            grouped: true,
            ..LocalPlan::default()
        };
        assert_eq!(
            rows(evaluate(empty, &plan).unwrap()),
            vec![vec![TypedValue::Null, TypedValue::Float(0.0)]]
        );
    }

    #[rstest]
    #[case(vec![3.0, 1.0, 2.0], TypedValue::Float(2.0))]
    #[case(vec![4.0, 1.0, 2.0, 3.0], TypedValue::Float(2.5))]
    #[case(vec![], TypedValue::Null)]
    fn test_median(#[case] values: Vec<f64>, #[case] expected: TypedValue) {
        assert_eq!(median(values), expected);
    }

    #[test]
    fn test_filters_and_time_filter() {
        let table = NormalizedTable::new(
            strings(&["Organisation_unit", "Period", "Value"]),
            vec![
                vec![json!("Bo"), json!("202401"), json!(1)],
                vec![json!("Bo"), json!("202406"), json!(2)],
                vec![json!("Kenema"), json!("202402"), json!(3)],
            ],
        )
        .unwrap();
        let range = TimeRange::new(
            NaiveDate::from_ymd_opt(2024, 1, 1).unwrap(),
            NaiveDate::from_ymd_opt(2024, 3, 31).unwrap(),
        )
        .unwrap();
        let plan = LocalPlan {
            filters: vec![Filter::new(
                "Organisation_unit",
                FilterOp::NotEq,
                strings(&["Kenema"]),
            )],
            time_filter: Some(("Period".to_string(), range)),
            ..LocalPlan::default()
        };
        let filtered = apply_filters(table, &plan).unwrap();
        assert_eq!(filtered.rows(), &[vec![json!("Bo"), json!("202401"), json!(1)]]);
    }
}
