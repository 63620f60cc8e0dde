//! The generic query object and its translation to upstream parameters.

pub mod period;
pub mod sql;
pub mod translator;

use std::fmt;

use serde::{Deserialize, Serialize};

pub use period::{TimeGrain, TimeRange};
pub use translator::{translate, DimensionRequest, LocalPlan, OutputDimension, PlannedMetric, Translation};

/// Column reference that `COUNT(*)` uses.
pub const ALL_ROWS: &str = "*";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AggregateFn {
    Sum,
    Avg,
    Count,
    CountDistinct,
    Min,
    Max,
    Median,
}

impl AggregateFn {
    pub fn name(&self) -> &'static str {
        match self {
            AggregateFn::Sum => "SUM",
            AggregateFn::Avg => "AVG",
            AggregateFn::Count => "COUNT",
            AggregateFn::CountDistinct => "COUNT_DISTINCT",
            AggregateFn::Min => "MIN",
            AggregateFn::Max => "MAX",
            AggregateFn::Median => "MEDIAN",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        match name.to_ascii_uppercase().as_str() {
            "SUM" => Some(AggregateFn::Sum),
            "AVG" | "MEAN" => Some(AggregateFn::Avg),
            "COUNT" => Some(AggregateFn::Count),
            "COUNT_DISTINCT" => Some(AggregateFn::CountDistinct),
            "MIN" => Some(AggregateFn::Min),
            "MAX" => Some(AggregateFn::Max),
            "MEDIAN" => Some(AggregateFn::Median),
            _ => None,
        }
    }

    /// `FN(column)`, the result column name of an unlabeled metric.
    pub fn label(&self, column: &str) -> String {
        format!("{}({})", self.name(), column)
    }
}

impl fmt::Display for AggregateFn {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct Metric {
    pub aggregate_fn: AggregateFn,
    /// Column display or canonical name, or [`ALL_ROWS`].
    pub column_ref: String,
    #[serde(default)]
    pub label: Option<String>,
}

impl Metric {
    pub fn new(aggregate_fn: AggregateFn, column_ref: impl Into<String>) -> Self {
        Self {
            aggregate_fn,
            column_ref: column_ref.into(),
            label: None,
        }
    }

    pub fn labeled(mut self, label: impl Into<String>) -> Self {
        self.label = Some(label.into());
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FilterOp {
    Eq,
    NotEq,
    In,
    NotIn,
}

impl FilterOp {
    /// Whether the filter keeps only the listed values.
    pub fn is_inclusive(&self) -> bool {
        matches!(self, FilterOp::Eq | FilterOp::In)
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct Filter {
    pub column: String,
    pub op: FilterOp,
    pub values: Vec<String>,
}

impl Filter {
    pub fn new(column: impl Into<String>, op: FilterOp, values: Vec<String>) -> Self {
        Self {
            column: column.into(),
            op,
            values,
        }
    }

    pub fn matches(&self, cell: &str) -> bool {
        let listed = self.values.iter().any(|v| v == cell);
        listed == self.op.is_inclusive()
    }
}

/// What the execution pipeline asks for. Immutable once built.
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct QueryObject {
    pub columns: Vec<String>,
    pub metrics: Vec<Metric>,
    pub group_by: Vec<String>,
    pub filters: Vec<Filter>,
    pub granularity_column_key: Option<String>,
    pub time_range: Option<TimeRange>,
    pub time_grain: Option<TimeGrain>,
    pub row_limit: Option<usize>,
}
