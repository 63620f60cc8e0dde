use std::time::Duration;

use envconfig::Envconfig;
use log::debug;

use crate::error::ConnectorError;

#[derive(Envconfig, Clone)]
pub struct UpstreamConfig {
    #[envconfig(from = "DHIS2_BASE_URL", default = "http://localhost:8080")]
    pub base_url: String,

    #[envconfig(from = "DHIS2_USERNAME")]
    pub username: Option<String>,

    #[envconfig(from = "DHIS2_PASSWORD")]
    pub password: Option<String>,

    /// Personal access token, sent as a bearer token when set.
    #[envconfig(from = "DHIS2_TOKEN")]
    pub token: Option<String>,

    #[envconfig(from = "DHIS2_CATALOG_PATH", default = "virtual_tables.json")]
    pub catalog_path: String,
}

impl UpstreamConfig {
    pub fn new() -> Result<Self, envconfig::Error> {
        let config = Self::init_from_env()?;
        debug!(
            "UpstreamConfig loaded: base_url={}, username={:?}, token_set={}, catalog_path={}",
            config.base_url,
            config.username,
            config.token.is_some(),
            config.catalog_path
        );
        Ok(config)
    }
}

#[derive(Envconfig, Clone)]
pub struct LoadingConfig {
    #[envconfig(from = "DHIS2_BATCH_SIZE", default = "5")]
    pub batch_size: usize,

    #[envconfig(from = "DHIS2_MAX_CONCURRENT_BATCHES", default = "3")]
    pub max_concurrent_batches: usize,

    #[envconfig(from = "DHIS2_BATCH_DELAY_MS", default = "100")]
    pub batch_delay_ms: u64,

    #[envconfig(from = "DHIS2_PAGE_SIZE", default = "1000")]
    pub page_size: u32,
}

impl LoadingConfig {
    pub fn new() -> Result<Self, envconfig::Error> {
        let config = Self::init_from_env()?;
        debug!(
            "LoadingConfig loaded: batch_size={}, max_concurrent_batches={}, batch_delay_ms={}, page_size={}",
            config.batch_size, config.max_concurrent_batches, config.batch_delay_ms, config.page_size
        );
        Ok(config)
    }
}

#[derive(Envconfig, Clone)]
pub struct RetryConfig {
    #[envconfig(from = "DHIS2_MAX_RETRIES", default = "3")]
    pub max_retries: u32,

    #[envconfig(from = "DHIS2_INITIAL_BACKOFF_MS", default = "500")]
    pub initial_backoff_ms: u64,

    #[envconfig(from = "DHIS2_BACKOFF_MULTIPLIER", default = "2.0")]
    pub backoff_multiplier: f64,

    #[envconfig(from = "DHIS2_MAX_BACKOFF_MS", default = "10000")]
    pub max_backoff_ms: u64,

    #[envconfig(from = "DHIS2_RETRY_STATUS_CODES", default = "408,429,500,502,503,504")]
    pub retry_status_codes: String,
}

impl RetryConfig {
    pub fn new() -> Result<Self, envconfig::Error> {
        let config = Self::init_from_env()?;
        debug!(
            "RetryConfig loaded: max_retries={}, initial_backoff_ms={}, backoff_multiplier={}, max_backoff_ms={}, retry_status_codes={}",
            config.max_retries,
            config.initial_backoff_ms,
            config.backoff_multiplier,
            config.max_backoff_ms,
            config.retry_status_codes
        );
        Ok(config)
    }

    pub fn status_codes(&self) -> Result<Vec<u16>, ConnectorError> {
        self.retry_status_codes
            .split(',')
            .map(str::trim)
            .filter(|code| !code.is_empty())
            .map(|code| {
                code.parse::<u16>().map_err(|e| {
                    ConnectorError::Configuration(format!(
                        "invalid retry status code {:?}: {}",
                        code, e
                    ))
                })
            })
            .collect()
    }
}

#[derive(Envconfig, Clone)]
pub struct TimeoutConfig {
    #[envconfig(from = "DHIS2_BASE_TIMEOUT_MS", default = "30000")]
    pub base_timeout_ms: u64,

    #[envconfig(from = "DHIS2_TIMEOUT_PER_DATA_ELEMENT_MS", default = "500")]
    pub per_data_element_ms: u64,

    #[envconfig(from = "DHIS2_TIMEOUT_PER_ORG_UNIT_MS", default = "200")]
    pub per_org_unit_ms: u64,

    #[envconfig(from = "DHIS2_PREVIEW_TIMEOUT_MS", default = "10000")]
    pub preview_timeout_ms: u64,

    #[envconfig(from = "DHIS2_LARGE_QUERY_TIMEOUT_MS", default = "300000")]
    pub large_query_timeout_ms: u64,
}

impl TimeoutConfig {
    pub fn new() -> Result<Self, envconfig::Error> {
        let config = Self::init_from_env()?;
        debug!(
            "TimeoutConfig loaded: base={}ms, per_data_element={}ms, per_org_unit={}ms, preview={}ms, large_query={}ms",
            config.base_timeout_ms,
            config.per_data_element_ms,
            config.per_org_unit_ms,
            config.preview_timeout_ms,
            config.large_query_timeout_ms
        );
        Ok(config)
    }
}

#[derive(Envconfig, Clone)]
pub struct CacheConfig {
    #[envconfig(from = "DHIS2_CACHE_ENABLED", default = "true")]
    pub enabled: bool,

    #[envconfig(from = "DHIS2_CACHE_TTL_SECS", default = "300")]
    pub ttl_secs: u64,
}

impl CacheConfig {
    pub fn new() -> Result<Self, envconfig::Error> {
        let config = Self::init_from_env()?;
        debug!(
            "CacheConfig loaded: enabled={}, ttl_secs={}",
            config.enabled, config.ttl_secs
        );
        Ok(config)
    }
}

/// Retry and backoff policy of the fetcher.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub initial_backoff: Duration,
    pub multiplier: f64,
    pub max_backoff: Duration,
    pub retry_status_codes: Vec<u16>,
}

impl RetryPolicy {
    /// `min(initial * multiplier^attempt, max)`, with `attempt` counted from 0.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = self.multiplier.powi(attempt as i32);
        let millis = self.initial_backoff.as_millis() as f64 * factor;
        let capped = millis.min(self.max_backoff.as_millis() as f64);
        if !capped.is_finite() || capped < 0.0 {
            return self.max_backoff;
        }
        Duration::from_millis(capped as u64)
    }

    pub fn is_retryable_status(&self, status: u16) -> bool {
        self.retry_status_codes.contains(&status)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_backoff: Duration::from_millis(500),
            multiplier: 2.0,
            max_backoff: Duration::from_millis(10_000),
            retry_status_codes: vec![408, 429, 500, 502, 503, 504],
        }
    }
}

/// Per-axis constants of the adaptive request timeout.
#[derive(Debug, Clone, PartialEq)]
pub struct TimeoutPolicy {
    pub base: Duration,
    pub per_data_element: Duration,
    pub per_org_unit: Duration,
    pub preview: Duration,
    pub large_query: Duration,
}

impl TimeoutPolicy {
    /// `clamp(base + perDataElement*|DE| + perOrgUnit*|OU|, preview, largeQuery)`
    pub fn timeout_for(&self, data_elements: usize, org_units: usize) -> Duration {
        let raw = self.base
            + self.per_data_element * data_elements as u32
            + self.per_org_unit * org_units as u32;
        let (lower, upper) = if self.preview <= self.large_query {
            (self.preview, self.large_query)
        } else {
            (self.large_query, self.preview)
        };
        raw.clamp(lower, upper)
    }
}

impl Default for TimeoutPolicy {
    fn default() -> Self {
        Self {
            base: Duration::from_millis(30_000),
            per_data_element: Duration::from_millis(500),
            per_org_unit: Duration::from_millis(200),
            preview: Duration::from_millis(10_000),
            large_query: Duration::from_millis(300_000),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct LoadingPolicy {
    pub batch_size: usize,
    pub max_concurrent_batches: usize,
    pub batch_delay: Duration,
    pub page_size: u32,
}

impl Default for LoadingPolicy {
    fn default() -> Self {
        Self {
            batch_size: 5,
            max_concurrent_batches: 3,
            batch_delay: Duration::from_millis(100),
            page_size: 1000,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct CachePolicy {
    pub enabled: bool,
    pub ttl: Duration,
}

impl Default for CachePolicy {
    fn default() -> Self {
        Self {
            enabled: true,
            ttl: Duration::from_secs(300),
        }
    }
}

/// Everything the connector needs at runtime, in typed form.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ConnectorSettings {
    pub loading: LoadingPolicy,
    pub retry: RetryPolicy,
    pub timeouts: TimeoutPolicy,
    pub cache: CachePolicy,
}

impl ConnectorSettings {
    pub fn from_env() -> Result<Self, ConnectorError> {
        let env_error = |e: envconfig::Error| ConnectorError::Configuration(e.to_string());
        let loading = LoadingConfig::new().map_err(env_error)?;
        let retry = RetryConfig::new().map_err(env_error)?;
        let timeouts = TimeoutConfig::new().map_err(env_error)?;
        let cache = CacheConfig::new().map_err(env_error)?;

        let settings = Self {
            loading: LoadingPolicy {
                batch_size: loading.batch_size,
                max_concurrent_batches: loading.max_concurrent_batches,
                batch_delay: Duration::from_millis(loading.batch_delay_ms),
                page_size: loading.page_size,
            },
            retry: RetryPolicy {
                max_retries: retry.max_retries,
                initial_backoff: Duration::from_millis(retry.initial_backoff_ms),
                multiplier: retry.backoff_multiplier,
                max_backoff: Duration::from_millis(retry.max_backoff_ms),
                retry_status_codes: retry.status_codes()?,
            },
            timeouts: TimeoutPolicy {
                base: Duration::from_millis(timeouts.base_timeout_ms),
                per_data_element: Duration::from_millis(timeouts.per_data_element_ms),
                per_org_unit: Duration::from_millis(timeouts.per_org_unit_ms),
                preview: Duration::from_millis(timeouts.preview_timeout_ms),
                large_query: Duration::from_millis(timeouts.large_query_timeout_ms),
            },
            cache: CachePolicy {
                enabled: cache.enabled,
                ttl: Duration::from_secs(cache.ttl_secs),
            },
        };
        settings.validate()?;
        Ok(settings)
    }

    pub fn validate(&self) -> Result<(), ConnectorError> {
        if self.loading.batch_size == 0 {
            return Err(ConnectorError::Configuration(
                "batch size must be at least 1".to_string(),
            ));
        }
        if self.loading.max_concurrent_batches == 0 {
            return Err(ConnectorError::Configuration(
                "max concurrent batches must be at least 1".to_string(),
            ));
        }
        if self.retry.max_retries == 0 {
            return Err(ConnectorError::Configuration(
                "max retries must allow at least one attempt".to_string(),
            ));
        }
        if self.retry.multiplier < 1.0 {
            return Err(ConnectorError::Configuration(format!(
                "backoff multiplier must be >= 1.0, got {}",
                self.retry.multiplier
            )));
        }
        Ok(())
    }
}
