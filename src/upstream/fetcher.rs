use std::fmt;
use std::time::Duration;

use log::{debug, error, warn};
use serde_json::Value;
use tokio::time::{sleep, timeout};

use super::{Transport, TransportError, UpstreamRequest};
use crate::config::RetryPolicy;
use crate::error::{ConnectorError, FetchCause, Result};

/// One failed attempt that is about to be retried.
#[derive(Debug, Clone, PartialEq)]
pub struct AttemptRecord {
    /// 1-based attempt number.
    pub index: u32,
    pub cause: FetchCause,
    /// Sleep before the next attempt.
    pub delay: Duration,
}

impl fmt::Display for AttemptRecord {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "attempt {} failed ({}); retrying in {}ms",
            self.index,
            self.cause,
            self.delay.as_millis()
        )
    }
}

/// A decoded payload and how many attempts it took.
#[derive(Debug, Clone)]
pub struct Fetched {
    pub payload: Value,
    pub attempts: u32,
    pub retries: Vec<AttemptRecord>,
}

/// Wraps a [`Transport`] with per-call timeouts and bounded exponential backoff.
pub struct RetryingFetcher<T> {
    transport: T,
    policy: RetryPolicy,
}

impl<T: Transport> RetryingFetcher<T> {
    pub fn new(transport: T, policy: RetryPolicy) -> Self {
        Self { transport, policy }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    /// Sends `request` until it succeeds, fails with a non-retryable cause, or
    /// `max_retries` attempts have been made.
    pub async fn fetch(&self, request: &UpstreamRequest) -> Result<Fetched> {
        let max_attempts = self.policy.max_retries.max(1);
        let mut retries = Vec::new();
        let mut attempt = 0;

        loop {
            attempt += 1;
            let cause = match self.attempt(request).await {
                Ok(payload) => {
                    debug!(
                        "GET {} succeeded on attempt {}/{}",
                        request.endpoint, attempt, max_attempts
                    );
                    return Ok(Fetched {
                        payload,
                        attempts: attempt,
                        retries,
                    });
                }
                Err(cause) => cause,
            };

            if !self.is_retryable(&cause) {
                error!(
                    "GET {} failed on attempt {} with non-retryable cause: {}",
                    request.endpoint, attempt, cause
                );
                return Err(ConnectorError::Connection {
                    attempts: attempt,
                    cause,
                });
            }
            if attempt >= max_attempts {
                error!(
                    "GET {} gave up after {} attempt(s); last cause: {}",
                    request.endpoint, attempt, cause
                );
                return Err(ConnectorError::Connection {
                    attempts: attempt,
                    cause,
                });
            }

            let record = AttemptRecord {
                index: attempt,
                delay: self.policy.backoff(attempt - 1),
                cause,
            };
            warn!("GET {}: {}", request.endpoint, record);
            sleep(record.delay).await;
            retries.push(record);
        }
    }

    async fn attempt(&self, request: &UpstreamRequest) -> std::result::Result<Value, FetchCause> {
        let response = match timeout(request.timeout, self.transport.send(request)).await {
            Err(_) | Ok(Err(TransportError::Timeout)) => return Err(FetchCause::Timeout),
            Ok(Err(TransportError::Connect(message))) => {
                return Err(FetchCause::Transport(message))
            }
            Ok(Ok(response)) => response,
        };
        if !response.is_success() {
            return Err(FetchCause::Status(response.status));
        }
        serde_json::from_str(&response.body).map_err(|e| FetchCause::Decode(e.to_string()))
    }

    fn is_retryable(&self, cause: &FetchCause) -> bool {
        match cause {
            FetchCause::Timeout | FetchCause::Transport(_) => true,
            FetchCause::Status(status) => self.policy.is_retryable_status(*status),
            FetchCause::Decode(_) => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::upstream::mock::{ok_json, status, ScriptedTransport};
    use crate::upstream::TransportResponse;
    use rstest::{fixture, rstest};
    use serde_json::json;

    #[fixture]
    fn policy() -> RetryPolicy {
        RetryPolicy {
            max_retries: 3,
            initial_backoff: Duration::from_millis(1),
            multiplier: 2.0,
            max_backoff: Duration::from_millis(4),
            retry_status_codes: vec![408, 429, 500, 502, 503, 504],
        }
    }

    fn request() -> UpstreamRequest {
        UpstreamRequest::new("analytics", Duration::from_secs(5))
    }

    fn succeeds_on(n: usize) -> ScriptedTransport {
        ScriptedTransport::new(move |_, call| {
            if call < n {
                status(503)
            } else {
                ok_json(&json!({"rows": []}))
            }
        })
    }

    #[rstest]
    #[case::first_attempt(1)]
    #[case::second_attempt(2)]
    #[case::last_allowed_attempt(3)]
    #[tokio::test]
    async fn test_succeeds_within_retry_bound(policy: RetryPolicy, #[case] n: usize) {
        let fetcher = RetryingFetcher::new(succeeds_on(n), policy);
        let fetched = fetcher.fetch(&request()).await.unwrap();
        assert_eq!(fetched.attempts, n as u32);
        assert_eq!(fetched.retries.len(), n - 1);
        assert_eq!(fetcher.transport().call_count(), n);
        for (i, record) in fetched.retries.iter().enumerate() {
            assert_eq!(record.index, i as u32 + 1);
            assert_eq!(record.cause, FetchCause::Status(503));
            assert_eq!(record.delay, fetcher.policy().backoff(i as u32));
        }
    }

    #[rstest]
    #[tokio::test]
    async fn test_exhausted_retries_raise_connection_error(policy: RetryPolicy) {
        let fetcher = RetryingFetcher::new(succeeds_on(4), policy);
        match fetcher.fetch(&request()).await {
            Err(ConnectorError::Connection { attempts, cause }) => {
                assert_eq!(attempts, 3);
                assert_eq!(cause, FetchCause::Status(503));
            }
            other => panic!("expected Connection error, got {:?}", other.map(|f| f.attempts)),
        }
        assert_eq!(fetcher.transport().call_count(), 3);
    }

    #[rstest]
    #[case::not_found(404)]
    #[case::unauthorized(401)]
    #[tokio::test]
    async fn test_non_retryable_status_fails_immediately(policy: RetryPolicy, #[case] code: u16) {
        let fetcher = RetryingFetcher::new(ScriptedTransport::new(move |_, _| status(code)), policy);
        assert!(matches!(
            fetcher.fetch(&request()).await,
            Err(ConnectorError::Connection { attempts: 1, cause: FetchCause::Status(c) }) if c == code
        ));
        assert_eq!(fetcher.transport().call_count(), 1);
    }

    #[rstest]
    #[tokio::test]
    async fn test_slow_upstream_times_out_and_is_retried(policy: RetryPolicy) {
        let transport = ScriptedTransport::always(json!({})).with_latency(Duration::from_millis(200));
        let fetcher = RetryingFetcher::new(transport, policy);
        let request = UpstreamRequest::new("analytics", Duration::from_millis(5));
        assert!(matches!(
            fetcher.fetch(&request).await,
            Err(ConnectorError::Connection { attempts: 3, cause: FetchCause::Timeout })
        ));
    }

    #[rstest]
    #[tokio::test]
    async fn test_invalid_json_is_not_retried(policy: RetryPolicy) {
        let transport = ScriptedTransport::new(|_, _| {
            Ok(TransportResponse {
                status: 200,
                body: "<html>login</html>".to_string(),
            })
        });
        let fetcher = RetryingFetcher::new(transport, policy);
        assert!(matches!(
            fetcher.fetch(&request()).await,
            Err(ConnectorError::Connection { attempts: 1, cause: FetchCause::Decode(_) })
        ));
    }

    #[rstest]
    #[tokio::test]
    async fn test_transport_errors_are_retried(policy: RetryPolicy) {
        let transport = ScriptedTransport::new(|_, call| {
            if call == 1 {
                Err(TransportError::Connect("connection reset".to_string()))
            } else {
                ok_json(&json!({"ok": true}))
            }
        });
        let fetched = RetryingFetcher::new(transport, policy)
            .fetch(&request())
            .await
            .unwrap();
        assert_eq!(fetched.attempts, 2);
        assert_eq!(fetched.payload, json!({"ok": true}));
    }
}
