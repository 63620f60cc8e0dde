//! `SELECT` text → [`QueryObject`].
//!
//! Only the subset a virtual table can answer is accepted: one table, plain
//! or aggregated columns, conjunctive filters, `GROUP BY` and `LIMIT`.

use chrono::NaiveDate;
use log::{debug, warn};
use sqlparser::ast::*;
use sqlparser::dialect::PostgreSqlDialect;
use sqlparser::parser::Parser;
use thiserror::Error;

use super::period::{TimeGrain, TimeRange};
use super::{AggregateFn, Filter, FilterOp, Metric, QueryObject, ALL_ROWS};
use crate::error::ConnectorError;

#[derive(Error, Debug)]
pub enum SqlParserError {
    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    #[error("SQL parsing error: {0}")]
    SqlParseError(String),

    #[error("Unsupported SQL construct: {0}")]
    UnsupportedSqlConstruct(String),
}

impl From<SqlParserError> for ConnectorError {
    fn from(e: SqlParserError) -> Self {
        ConnectorError::InvalidQuery(e.to_string())
    }
}

type Result<T> = std::result::Result<T, SqlParserError>;

fn unsupported<T>(what: impl std::fmt::Display) -> Result<T> {
    Err(SqlParserError::UnsupportedSqlConstruct(what.to_string()))
}

/// A parsed statement: the virtual table it reads and what it asks for.
#[derive(Debug, Clone, PartialEq)]
pub struct SqlQuery {
    pub table: String,
    pub query: QueryObject,
}

pub fn parse_select(sql: &str) -> Result<SqlQuery> {
    let dialect = PostgreSqlDialect {};
    let mut statements =
        Parser::parse_sql(&dialect, sql).map_err(|e| SqlParserError::SqlParseError(e.to_string()))?;
    if statements.len() != 1 {
        return unsupported(format!("expected one statement, found {}", statements.len()));
    }
    let query = match statements.remove(0) {
        Statement::Query(query) => query,
        _ => {
            return Err(SqlParserError::PermissionDenied(
                "Only read-only SQL statements are allowed".to_string(),
            ))
        }
    };
    let parsed = parse_query(&query)?;
    debug!("Parsed SQL on table {}: {:?}", parsed.table, parsed.query);
    Ok(parsed)
}

fn parse_query(query: &Query) -> Result<SqlQuery> {
    if query.with.is_some() {
        return unsupported("WITH clauses");
    }
    let select = match query.body.as_ref() {
        SetExpr::Select(select) => select,
        SetExpr::SetOperation { .. } => return unsupported("set operations"),
        other => return unsupported(format!("query body {}", other)),
    };
    if select.having.is_some() {
        return unsupported("HAVING");
    }

    let table = table_name(&select.from)?;
    let mut parsed = QueryObject::default();

    for item in &select.projection {
        match item {
            SelectItem::UnnamedExpr(expr) => projection(expr, None, &mut parsed)?,
            SelectItem::ExprWithAlias { expr, alias } => {
                projection(expr, Some(alias.value.clone()), &mut parsed)?
            }
            SelectItem::Wildcard(_) => {}
            SelectItem::QualifiedWildcard(name, _) => {
                return unsupported(format!("qualified wildcard {}.*", name))
            }
        }
    }

    match &select.distinct {
        None => {}
        Some(Distinct::Distinct) => parsed.group_by = parsed.columns.clone(),
        Some(Distinct::On(_)) => return unsupported("DISTINCT ON"),
    }

    match &select.group_by {
        GroupByExpr::Expressions(exprs, modifiers) => {
            if !modifiers.is_empty() {
                return unsupported("GROUP BY modifiers");
            }
            for expr in exprs {
                let column = dimension(expr, &mut parsed)?;
                if !parsed.group_by.contains(&column) {
                    parsed.group_by.push(column);
                }
            }
        }
        GroupByExpr::All(_) => return unsupported("GROUP BY ALL"),
    }

    if let Some(selection) = &select.selection {
        conjuncts(selection, &mut parsed)?;
    }

    if let Some(limit) = &query.limit {
        let rows = literal(limit)?
            .parse::<usize>()
            .map_err(|e| SqlParserError::SqlParseError(format!("invalid LIMIT: {}", e)))?;
        parsed.row_limit = Some(rows);
    }

    Ok(SqlQuery {
        table,
        query: parsed,
    })
}

fn table_name(from: &[TableWithJoins]) -> Result<String> {
    let [source] = from else {
        return unsupported("queries must read exactly one table");
    };
    if !source.joins.is_empty() {
        return unsupported("joins");
    }
    match &source.relation {
        TableFactor::Table { name, .. } => name
            .0
            .last()
            .map(|ident| ident.value.clone())
            .ok_or_else(|| SqlParserError::SqlParseError("empty table name".to_string())),
        TableFactor::Derived { .. } => unsupported("subqueries"),
        other => unsupported(format!("table factor {}", other)),
    }
}

fn column_name(expr: &Expr) -> Option<String> {
    match expr {
        Expr::Identifier(ident) => Some(ident.value.clone()),
        Expr::CompoundIdentifier(idents) => idents.last().map(|ident| ident.value.clone()),
        Expr::Nested(inner) => column_name(inner),
        _ => None,
    }
}

fn function_args(func: &Function) -> Result<(&[FunctionArg], bool)> {
    match &func.args {
        FunctionArguments::List(list) => Ok((
            &list.args,
            matches!(list.duplicate_treatment, Some(DuplicateTreatment::Distinct)),
        )),
        FunctionArguments::None => Ok((&[], false)),
        FunctionArguments::Subquery(_) => unsupported("subqueries"),
    }
}

/// `DATE_TRUNC('<grain>', <column>)` → (column, grain).
fn date_trunc(func: &Function) -> Result<Option<(String, TimeGrain)>> {
    if !func.name.to_string().eq_ignore_ascii_case("DATE_TRUNC") {
        return Ok(None);
    }
    let (args, _) = function_args(func)?;
    let [FunctionArg::Unnamed(FunctionArgExpr::Expr(grain)), FunctionArg::Unnamed(FunctionArgExpr::Expr(column))] =
        args
    else {
        return unsupported("DATE_TRUNC expects a grain and a column");
    };
    let grain_name = literal(grain)?;
    let grain = TimeGrain::parse(&grain_name)
        .ok_or_else(|| SqlParserError::UnsupportedSqlConstruct(format!("time grain {:?}", grain_name)))?;
    let column = column_name(column)
        .ok_or_else(|| SqlParserError::UnsupportedSqlConstruct(format!("DATE_TRUNC of {}", column)))?;
    Ok(Some((column, grain)))
}

/// A plain column or a `DATE_TRUNC` of one; the latter sets the granularity.
fn dimension(expr: &Expr, parsed: &mut QueryObject) -> Result<String> {
    if let Some(column) = column_name(expr) {
        return Ok(column);
    }
    if let Expr::Function(func) = expr {
        if let Some((column, grain)) = date_trunc(func)? {
            parsed.granularity_column_key = Some(column.clone());
            parsed.time_grain = Some(grain);
            return Ok(column);
        }
    }
    unsupported(format!("expression {}", expr))
}

fn projection(expr: &Expr, alias: Option<String>, parsed: &mut QueryObject) -> Result<()> {
    if let Expr::Function(func) = expr {
        let name = func.name.to_string();
        if let Some(aggregate_fn) = AggregateFn::from_name(&name) {
            let metric = aggregate(func, aggregate_fn, alias)?;
            parsed.metrics.push(metric);
            return Ok(());
        }
    }
    let column = dimension(expr, parsed)?;
    if let Some(alias) = alias {
        warn!("Ignoring alias {:?} on column {:?}", alias, column);
    }
    if !parsed.columns.contains(&column) {
        parsed.columns.push(column);
    }
    Ok(())
}

fn aggregate(func: &Function, aggregate_fn: AggregateFn, label: Option<String>) -> Result<Metric> {
    if func.over.is_some() || func.filter.is_some() {
        return unsupported(format!("window or filtered aggregate {}", func));
    }
    let (args, distinct) = function_args(func)?;
    let column_ref = match args {
        [FunctionArg::Unnamed(FunctionArgExpr::Wildcard)] => ALL_ROWS.to_string(),
        [FunctionArg::Unnamed(FunctionArgExpr::Expr(expr))] => column_name(expr)
            .ok_or_else(|| SqlParserError::UnsupportedSqlConstruct(format!("{} of {}", aggregate_fn, expr)))?,
        _ => return unsupported(format!("{} expects one column", aggregate_fn)),
    };
    let aggregate_fn = match (aggregate_fn, distinct) {
        (AggregateFn::Count, true) => AggregateFn::CountDistinct,
        (other, true) => return unsupported(format!("{}(DISTINCT ...)", other)),
        (other, false) => other,
    };
    Ok(Metric {
        aggregate_fn,
        column_ref,
        label,
    })
}

fn literal(expr: &Expr) -> Result<String> {
    match expr {
        Expr::Value(Value::SingleQuotedString(s)) => Ok(s.clone()),
        Expr::Value(Value::Number(n, _)) => Ok(n.clone()),
        Expr::Value(Value::Boolean(b)) => Ok(b.to_string()),
        Expr::Nested(inner) => literal(inner),
        other => unsupported(format!("non-literal value {}", other)),
    }
}

fn date(expr: &Expr) -> Result<NaiveDate> {
    let text = literal(expr)?;
    NaiveDate::parse_from_str(&text, "%Y-%m-%d")
        .map_err(|e| SqlParserError::SqlParseError(format!("invalid date {:?}: {}", text, e)))
}

fn conjuncts(expr: &Expr, parsed: &mut QueryObject) -> Result<()> {
    match expr {
        Expr::Nested(inner) => conjuncts(inner, parsed),
        Expr::BinaryOp {
            left,
            op: BinaryOperator::And,
            right,
        } => {
            conjuncts(left, parsed)?;
            conjuncts(right, parsed)
        }
        Expr::BinaryOp { left, op, right } => {
            let op = match op {
                BinaryOperator::Eq => FilterOp::Eq,
                BinaryOperator::NotEq => FilterOp::NotEq,
                other => return unsupported(format!("operator {}", other)),
            };
            let column = column_name(left)
                .ok_or_else(|| SqlParserError::UnsupportedSqlConstruct(format!("filter on {}", left)))?;
            parsed.filters.push(Filter::new(column, op, vec![literal(right)?]));
            Ok(())
        }
        Expr::InList {
            expr,
            list,
            negated,
        } => {
            let column = column_name(expr)
                .ok_or_else(|| SqlParserError::UnsupportedSqlConstruct(format!("filter on {}", expr)))?;
            let values = list.iter().map(literal).collect::<Result<Vec<_>>>()?;
            let op = if *negated { FilterOp::NotIn } else { FilterOp::In };
            parsed.filters.push(Filter::new(column, op, values));
            Ok(())
        }
        Expr::Between {
            expr,
            negated: false,
            low,
            high,
        } => {
            let column = column_name(expr)
                .ok_or_else(|| SqlParserError::UnsupportedSqlConstruct(format!("filter on {}", expr)))?;
            let range = TimeRange::new(date(low)?, date(high)?)
                .map_err(|e| SqlParserError::SqlParseError(e.to_string()))?;
            parsed.time_range = Some(range);
            if parsed.granularity_column_key.is_none() {
                parsed.granularity_column_key = Some(column);
            }
            Ok(())
        }
        Expr::InSubquery { .. } | Expr::Exists { .. } | Expr::Subquery(_) => unsupported("subqueries"),
        other => unsupported(format!("filter {}", other)),
    }
}
