//! Requests against the analytics server and the transport that carries them.

pub mod fetcher;
mod http;
#[cfg(test)]
pub(crate) mod mock;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use sha2::{Digest, Sha256};
use thiserror::Error;

pub use fetcher::{AttemptRecord, Fetched, RetryingFetcher};
pub use http::{Auth, HttpTransport};

/// Dimension parameter of the data axis.
pub const DATA_DIMENSION: &str = "dx";
/// Dimension parameter of the period axis.
pub const PERIOD_DIMENSION: &str = "pe";
/// Dimension parameter of the organisation unit axis.
pub const ORG_UNIT_DIMENSION: &str = "ou";
/// Separator between the members of one dimension clause.
pub const ITEM_SEPARATOR: &str = ";";

/// One GET request below `/api/`.
#[derive(Debug, Clone, PartialEq)]
pub struct UpstreamRequest {
    pub endpoint: String,
    pub params: Vec<(String, String)>,
    pub timeout: Duration,
}

impl UpstreamRequest {
    pub fn new(endpoint: impl Into<String>, timeout: Duration) -> Self {
        Self {
            endpoint: endpoint.into(),
            params: Vec::new(),
            timeout,
        }
    }

    pub fn with_param(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.params.push((key.into(), value.into()));
        self
    }

    /// Adds a `dimension=<axis>:<item>;<item>` clause.
    pub fn with_dimension(self, axis: &str, items: &[String]) -> Self {
        self.with_param("dimension", format!("{}:{}", axis, items.join(ITEM_SEPARATOR)))
    }

    pub fn param(&self, key: &str) -> Option<&str> {
        self.params
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    /// Members of the `dimension=<axis>:...` clause, if the request has one.
    pub fn dimension_items(&self, axis: &str) -> Option<Vec<&str>> {
        let prefix = format!("{}:", axis);
        self.params
            .iter()
            .filter(|(k, _)| k == "dimension" || k == "filter")
            .find_map(|(_, v)| v.strip_prefix(prefix.as_str()))
            .map(|items| items.split(ITEM_SEPARATOR).collect())
    }

    /// Deterministic hash of the endpoint and the sorted parameters.
    ///
    /// The timeout is not part of the key.
    pub fn cache_key(&self) -> String {
        let mut params: Vec<&(String, String)> = self.params.iter().collect();
        params.sort();
        let mut hasher = Sha256::new();
        hasher.update(self.endpoint.as_bytes());
        for (key, value) in params {
            hasher.update(b"\n");
            hasher.update(key.as_bytes());
            hasher.update(b"=");
            hasher.update(value.as_bytes());
        }
        hex::encode(hasher.finalize())
    }
}

/// Status and raw body of one completed HTTP exchange.
#[derive(Debug, Clone, PartialEq)]
pub struct TransportResponse {
    pub status: u16,
    pub body: String,
}

impl TransportResponse {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum TransportError {
    #[error("request timed out")]
    Timeout,

    #[error("{0}")]
    Connect(String),
}

/// Sends one request and returns whatever the server answered.
///
/// Retrying and status interpretation belong to [`RetryingFetcher`].
#[async_trait]
pub trait Transport: Send + Sync {
    async fn send(
        &self,
        request: &UpstreamRequest,
    ) -> std::result::Result<TransportResponse, TransportError>;
}

#[async_trait]
impl<T: Transport + ?Sized> Transport for Arc<T> {
    async fn send(
        &self,
        request: &UpstreamRequest,
    ) -> std::result::Result<TransportResponse, TransportError> {
        (**self).send(request).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request() -> UpstreamRequest {
        UpstreamRequest::new("analytics", Duration::from_secs(30))
            .with_dimension(DATA_DIMENSION, &["a".to_string(), "b".to_string()])
            .with_dimension(PERIOD_DIMENSION, &["LAST_12_MONTHS".to_string()])
            .with_param("displayProperty", "NAME")
    }

    #[test]
    fn test_cache_key_ignores_param_order_and_timeout() {
        let a = request();
        let mut b = request();
        b.params.reverse();
        b.timeout = Duration::from_secs(1);
        assert_eq!(a.cache_key(), b.cache_key());
        assert_eq!(a.cache_key().len(), 64);

        let c = request().with_param("skipMeta", "true");
        assert_ne!(a.cache_key(), c.cache_key());

        let mut d = request();
        d.endpoint = "dataValueSets".to_string();
        assert_ne!(a.cache_key(), d.cache_key());
    }

    #[test]
    fn test_dimension_items() {
        let request = request();
        assert_eq!(request.dimension_items(DATA_DIMENSION), Some(vec!["a", "b"]));
        assert_eq!(
            request.dimension_items(PERIOD_DIMENSION),
            Some(vec!["LAST_12_MONTHS"])
        );
        assert_eq!(request.dimension_items(ORG_UNIT_DIMENSION), None);
        assert_eq!(request.param("displayProperty"), Some("NAME"));
    }
}
