use std::fmt;
use thiserror::Error;

use crate::loader::PartialBatchFailure;

pub type Result<T> = std::result::Result<T, ConnectorError>;

#[derive(Error, Debug)]
pub enum ConnectorError {
    #[error("Connection failed after {attempts} attempt(s): {cause}")]
    Connection { attempts: u32, cause: FetchCause },

    #[error("Schema mismatch: {0}")]
    SchemaMismatch(#[from] SchemaMismatch),

    #[error("Unknown column {requested:?}; available columns: {available:?}")]
    ColumnNotFound {
        requested: String,
        available: Vec<String>,
    },

    #[error("Column {requested:?} is ambiguous; candidates: {candidates:?}")]
    AmbiguousColumn {
        requested: String,
        candidates: Vec<String>,
    },

    #[error("Granularity column {0:?} is not a column of this table")]
    MissingDimensionColumn(String),

    #[error("Unsupported response shape: {0}")]
    UnsupportedResponseShape(String),

    #[error("{0}")]
    PartialBatchFailure(PartialBatchFailure),

    #[error("Display name {0:?} has no canonical form")]
    InvalidColumnName(String),

    #[error("Display names {first:?} and {second:?} both map to column {canonical:?}")]
    DuplicateColumn {
        canonical: String,
        first: String,
        second: String,
    },

    #[error("Table not found: {0}")]
    TableNotFound(String),

    #[error("Invalid query: {0}")]
    InvalidQuery(String),

    #[error("Catalog error: {0}")]
    Catalog(String),

    #[error("Configuration error: {0}")]
    Configuration(String),
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum SchemaMismatch {
    #[error("row {row} has {actual} values but the table declares {expected} columns")]
    RowArity {
        row: usize,
        expected: usize,
        actual: usize,
    },

    #[error("batch columns {actual:?} differ from {expected:?}")]
    BatchColumns {
        expected: Vec<String>,
        actual: Vec<String>,
    },
}

/// Why a single upstream attempt failed.
#[derive(Debug, Clone, PartialEq)]
pub enum FetchCause {
    Timeout,
    Status(u16),
    Transport(String),
    Decode(String),
}

impl fmt::Display for FetchCause {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            FetchCause::Timeout => write!(f, "request timed out"),
            FetchCause::Status(status) => write!(f, "upstream returned HTTP {}", status),
            FetchCause::Transport(message) => write!(f, "transport error: {}", message),
            FetchCause::Decode(message) => write!(f, "invalid JSON payload: {}", message),
        }
    }
}
