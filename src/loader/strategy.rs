use std::fmt;

use serde::Serialize;

/// Largest complexity served by one request.
pub const DIRECT_LIMIT: usize = 50;
/// Largest complexity served by concurrent batches.
pub const BATCHED_LIMIT: usize = 200;
/// Largest complexity served by one paged request sequence.
pub const PAGINATED_LIMIT: usize = 1000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LoadStrategy {
    Direct,
    Batched,
    Paginated,
    /// Batches queued one at a time under the large-query timeout.
    Deferred,
}

impl fmt::Display for LoadStrategy {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let name = match self {
            LoadStrategy::Direct => "direct",
            LoadStrategy::Batched => "batched",
            LoadStrategy::Paginated => "paginated",
            LoadStrategy::Deferred => "deferred",
        };
        write!(f, "{}", name)
    }
}

pub fn select_strategy(complexity: usize) -> LoadStrategy {
    match complexity {
        c if c <= DIRECT_LIMIT => LoadStrategy::Direct,
        c if c <= BATCHED_LIMIT => LoadStrategy::Batched,
        c if c <= PAGINATED_LIMIT => LoadStrategy::Paginated,
        _ => LoadStrategy::Deferred,
    }
}
