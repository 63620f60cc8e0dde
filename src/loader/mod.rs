//! Turns a [`DimensionRequest`] into upstream calls and one merged table.
//!
//! Analytics tables pick a [`LoadStrategy`] from the request complexity.
//! Batched and deferred loads split the data items into chunks and keep the
//! chunks that succeed; the ones that exhaust their retries are reported in a
//! [`PartialBatchFailure`]. Record tables are loaded directly, or page by
//! page when the table declares a page size.

mod strategy;

use std::fmt;
use std::time::Duration;

use futures::future::join_all;
use log::{debug, info, warn};
use serde_json::Value;
use tokio::time::sleep;

use crate::cache::TtlCache;
use crate::catalog::{DataItem, VirtualTable};
use crate::config::{LoadingPolicy, TimeoutPolicy};
use crate::error::{ConnectorError, FetchCause, Result};
use crate::normalize::{normalize, page_count, pivot_long_to_wide, NormalizeContext, NormalizedTable, ResponseShape};
use crate::query::DimensionRequest;
use crate::upstream::{
    RetryingFetcher, Transport, UpstreamRequest, DATA_DIMENSION, ORG_UNIT_DIMENSION,
    PERIOD_DIMENSION,
};

pub use strategy::{select_strategy, LoadStrategy, BATCHED_LIMIT, DIRECT_LIMIT, PAGINATED_LIMIT};

/// A batch whose fetch exhausted its retries.
#[derive(Debug, Clone, PartialEq)]
pub struct FailedBatch {
    /// Data item ids of the batch.
    pub data_items: Vec<String>,
    pub attempts: u32,
    pub cause: FetchCause,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PartialBatchFailure {
    pub failed: Vec<FailedBatch>,
    pub succeeded: usize,
}

impl PartialBatchFailure {
    /// Every data item id whose values are missing from the result.
    pub fn unresolved_items(&self) -> Vec<String> {
        self.failed
            .iter()
            .flat_map(|batch| batch.data_items.iter().cloned())
            .collect()
    }
}

impl fmt::Display for PartialBatchFailure {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "{} of {} batch(es) failed; unresolved data items: {}",
            self.failed.len(),
            self.failed.len() + self.succeeded,
            self.unresolved_items().join(", ")
        )?;
        if let Some(last) = self.failed.last() {
            write!(f, " (last cause after {} attempt(s): {})", last.attempts, last.cause)?;
        }
        Ok(())
    }
}

/// A loaded and normalized table.
#[derive(Debug, Clone)]
pub struct Loaded {
    pub table: NormalizedTable,
    pub strategy: LoadStrategy,
    pub partial_failure: Option<PartialBatchFailure>,
}

/// Loads one table per call. Borrowed from the connector for the length of
/// one execution.
pub struct Loader<'a, T> {
    fetcher: &'a RetryingFetcher<T>,
    cache: Option<&'a TtlCache>,
    loading: &'a LoadingPolicy,
    timeouts: &'a TimeoutPolicy,
}

impl<'a, T: Transport> Loader<'a, T> {
    pub fn new(
        fetcher: &'a RetryingFetcher<T>,
        cache: Option<&'a TtlCache>,
        loading: &'a LoadingPolicy,
        timeouts: &'a TimeoutPolicy,
    ) -> Self {
        Self {
            fetcher,
            cache,
            loading,
            timeouts,
        }
    }

    pub async fn load(
        &self,
        table: &VirtualTable,
        request: &DimensionRequest,
        context: &NormalizeContext,
    ) -> Result<Loaded> {
        if table.is_analytics() {
            self.load_analytics(table, request, context).await
        } else {
            self.load_records(table, request, context).await
        }
    }

    async fn load_analytics(
        &self,
        table: &VirtualTable,
        request: &DimensionRequest,
        context: &NormalizeContext,
    ) -> Result<Loaded> {
        let complexity = request.complexity();
        let strategy = select_strategy(complexity);
        info!(
            "Loading {} with the {} strategy: {} data item(s) x {} org unit(s) = {}",
            table.name,
            strategy,
            request.data_items.len(),
            request.org_units.len(),
            complexity
        );

        let (long, partial_failure) = match strategy {
            LoadStrategy::Direct | LoadStrategy::Paginated => {
                let timeout = self
                    .timeouts
                    .timeout_for(request.data_items.len(), request.org_units.len());
                let base = analytics_request(table, request, &request.data_items, timeout);
                let page_size = (strategy == LoadStrategy::Paginated).then_some(self.loading.page_size);
                let long = self
                    .fetch_unit(table, base, page_size, ResponseShape::AnalyticsLong, context)
                    .await?;
                (long, None)
            }
            LoadStrategy::Batched | LoadStrategy::Deferred => {
                self.load_batches(table, request, context, strategy).await?
            }
        };

        // Items of failed batches keep their columns, filled with nulls.
        let merged = if table.shape == ResponseShape::AnalyticsWide {
            let expected: Vec<String> = request
                .data_items
                .iter()
                .map(|item| item.display_name.clone())
                .collect();
            pivot_long_to_wide(&long, &expected)?
        } else {
            long
        };
        debug!(
            "Loaded {} row(s) x {} column(s) for {}",
            merged.len(),
            merged.column_names().len(),
            table.name
        );
        Ok(Loaded {
            table: merged,
            strategy,
            partial_failure,
        })
    }

    async fn load_batches(
        &self,
        table: &VirtualTable,
        request: &DimensionRequest,
        context: &NormalizeContext,
        strategy: LoadStrategy,
    ) -> Result<(NormalizedTable, Option<PartialBatchFailure>)> {
        let batches: Vec<&[DataItem]> = request
            .data_items
            .chunks(self.loading.batch_size.max(1))
            .collect();
        let concurrency = match strategy {
            LoadStrategy::Deferred => 1,
            _ => self.loading.max_concurrent_batches.max(1),
        };
        info!(
            "Dispatching {} batch(es) of up to {} data item(s), {} at a time",
            batches.len(),
            self.loading.batch_size,
            concurrency
        );

        let mut outcomes = Vec::with_capacity(batches.len());
        for (wave, items) in batches.chunks(concurrency).enumerate() {
            if wave > 0 && !self.loading.batch_delay.is_zero() {
                sleep(self.loading.batch_delay).await;
            }
            let fetches = items.iter().map(|items| {
                let timeout = match strategy {
                    LoadStrategy::Deferred => self.timeouts.large_query,
                    _ => self.timeouts.timeout_for(items.len(), request.org_units.len()),
                };
                let base = analytics_request(table, request, items, timeout);
                self.fetch_unit(table, base, None, ResponseShape::AnalyticsLong, context)
            });
            let results = join_all(fetches).await;
            outcomes.extend(items.iter().copied().zip(results));
        }

        let mut tables = Vec::new();
        let mut failed = Vec::new();
        for (items, outcome) in outcomes {
            match outcome {
                Ok(table) => tables.push(table),
                Err(ConnectorError::Connection { attempts, cause }) => failed.push(FailedBatch {
                    data_items: items.iter().map(|item| item.id.clone()).collect(),
                    attempts,
                    cause,
                }),
                Err(other) => return Err(other),
            }
        }

        let failure = (!failed.is_empty()).then(|| PartialBatchFailure {
            failed,
            succeeded: tables.len(),
        });
        match failure {
            Some(failure) if tables.is_empty() => Err(ConnectorError::PartialBatchFailure(failure)),
            failure => {
                if let Some(failure) = &failure {
                    warn!("Partial load of {}: {}", table.name, failure);
                }
                Ok((NormalizedTable::concat(tables)?, failure))
            }
        }
    }

    async fn load_records(
        &self,
        table: &VirtualTable,
        request: &DimensionRequest,
        context: &NormalizeContext,
    ) -> Result<Loaded> {
        let timeout = self.timeouts.timeout_for(0, 0);
        let mut base = UpstreamRequest::new(table.endpoint.clone(), timeout);
        for (key, value) in &request.params {
            base = base.with_param(key.clone(), value.clone());
        }
        let strategy = if table.page_size.is_some() {
            LoadStrategy::Paginated
        } else {
            LoadStrategy::Direct
        };
        info!("Loading {} with the {} strategy", table.name, strategy);

        let normalized = self
            .fetch_unit(table, base, table.page_size, table.shape, context)
            .await?;
        Ok(Loaded {
            table: normalized,
            strategy,
            partial_failure: None,
        })
    }

    /// Fetches one request, or every page of it, and normalizes the payloads.
    /// Goes through the cache when one is configured.
    async fn fetch_unit(
        &self,
        table: &VirtualTable,
        base: UpstreamRequest,
        page_size: Option<u32>,
        shape: ResponseShape,
        context: &NormalizeContext,
    ) -> Result<NormalizedTable> {
        let key = format!("{}:{}", table.name, base.cache_key());
        if let Some(cached) = self.cache.and_then(|cache| cache.get(&key)) {
            return Ok(cached);
        }

        let pages = match page_size {
            Some(page_size) => self.fetch_pages(&base, page_size).await?,
            None => vec![self.fetcher.fetch(&base).await?.payload],
        };
        let normalized = normalize(shape, &pages, context)?;
        if let Some(cache) = self.cache {
            cache.insert(key, normalized.clone());
        }
        Ok(normalized)
    }

    async fn fetch_pages(&self, base: &UpstreamRequest, page_size: u32) -> Result<Vec<Value>> {
        let page = |number: u32| {
            base.clone()
                .with_param("paging", "true")
                .with_param("totalPages", "true")
                .with_param("page", number.to_string())
                .with_param("pageSize", page_size.to_string())
        };

        let first = self.fetcher.fetch(&page(1)).await?.payload;
        let total = page_count(&first).unwrap_or(1).max(1);
        debug!("GET {}: {} page(s) of {}", base.endpoint, total, page_size);

        let mut pages = vec![first];
        for number in 2..=total {
            pages.push(self.fetcher.fetch(&page(number)).await?.payload);
        }
        Ok(pages)
    }
}

/// The analytics request for `items`, with every period and org unit.
fn analytics_request(
    table: &VirtualTable,
    request: &DimensionRequest,
    items: &[DataItem],
    timeout: Duration,
) -> UpstreamRequest {
    let ids: Vec<String> = items.iter().map(|item| item.id.clone()).collect();
    let mut upstream = UpstreamRequest::new(table.endpoint.clone(), timeout)
        .with_dimension(DATA_DIMENSION, &ids)
        .with_dimension(PERIOD_DIMENSION, &request.periods)
        .with_dimension(ORG_UNIT_DIMENSION, &request.org_units);
    for (key, value) in &request.params {
        upstream = upstream.with_param(key.clone(), value.clone());
    }
    upstream
}
