use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;

use super::{Transport, TransportError, TransportResponse, UpstreamRequest};

type Handler = dyn Fn(&UpstreamRequest, usize) -> Result<TransportResponse, TransportError>
    + Send
    + Sync;

/// In-memory upstream driven by a closure that sees each request and its
/// 1-based call number.
pub(crate) struct ScriptedTransport {
    handler: Box<Handler>,
    latency: Duration,
    requests: Mutex<Vec<UpstreamRequest>>,
    in_flight: AtomicUsize,
    peak_in_flight: AtomicUsize,
}

impl ScriptedTransport {
    pub fn new<F>(handler: F) -> Self
    where
        F: Fn(&UpstreamRequest, usize) -> Result<TransportResponse, TransportError>
            + Send
            + Sync
            + 'static,
    {
        Self {
            handler: Box::new(handler),
            latency: Duration::ZERO,
            requests: Mutex::new(Vec::new()),
            in_flight: AtomicUsize::new(0),
            peak_in_flight: AtomicUsize::new(0),
        }
    }

    /// Always answers with the same JSON body.
    pub fn always(payload: Value) -> Self {
        Self::new(move |_, _| ok_json(&payload))
    }

    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    pub fn requests(&self) -> Vec<UpstreamRequest> {
        self.requests.lock().clone()
    }

    pub fn call_count(&self) -> usize {
        self.requests.lock().len()
    }

    /// Most requests that were ever awaiting a response at once.
    pub fn peak_in_flight(&self) -> usize {
        self.peak_in_flight.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Transport for ScriptedTransport {
    async fn send(&self, request: &UpstreamRequest) -> Result<TransportResponse, TransportError> {
        let call = {
            let mut requests = self.requests.lock();
            requests.push(request.clone());
            requests.len()
        };
        let current = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak_in_flight.fetch_max(current, Ordering::SeqCst);
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        (self.handler)(request, call)
    }
}

pub(crate) fn ok_json(payload: &Value) -> Result<TransportResponse, TransportError> {
    Ok(TransportResponse {
        status: 200,
        body: payload.to_string(),
    })
}

pub(crate) fn status(code: u16) -> Result<TransportResponse, TransportError> {
    Ok(TransportResponse {
        status: code,
        body: format!(r#"{{"httpStatusCode": {}, "status": "ERROR"}}"#, code),
    })
}
