//! Scripted transport for unit tests
//!
//! Routes are keyed by "METHOD endpoint" where the endpoint is the URL path
//! below `/api/rest/v1/`. One-shot replies are consumed before the route's
//! standing reply. Every call is recorded along with the highest number of
//! requests that were in flight at once.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;
use url::Url;

use crate::error::{Error, Result};

use super::{Method, RequestTimeouts, Transport};

const API_PREFIX: &str = "/api/rest/v1/";

/// What a scripted route answers with
#[derive(Debug, Clone)]
pub enum MockReply {
    Json(Value),
    Timeout,
    Refused,
    Status(u16),
    Malformed,
}

impl MockReply {
    fn into_result(self, url: &str) -> Result<Value> {
        match self {
            MockReply::Json(value) => Ok(value),
            MockReply::Timeout => Err(Error::timeout(url)),
            MockReply::Refused => Err(Error::connection_failed(url, "connection refused")),
            MockReply::Status(status) => Err(Error::from_status(url, status)),
            MockReply::Malformed => Err(Error::MalformedResponse {
                url: url.to_string(),
                message: "expected value at line 1 column 1".to_string(),
            }),
        }
    }
}

/// A request seen by the mock
#[derive(Debug, Clone)]
pub struct RecordedCall {
    pub method: Method,
    pub endpoint: String,
    pub body: Option<Value>,
}

#[derive(Default)]
struct Script {
    standing: HashMap<String, MockReply>,
    queued: HashMap<String, VecDeque<MockReply>>,
    delays: HashMap<String, Duration>,
}

#[derive(Default)]
pub struct MockTransport {
    script: Mutex<Script>,
    calls: Mutex<Vec<RecordedCall>>,
    delay: Mutex<Duration>,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

fn route_key(method: Method, endpoint: &str) -> String {
    format!("{} {}", method, endpoint)
}

impl MockTransport {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Answer every `GET endpoint` with `value`
    pub fn respond(&self, endpoint: &str, value: Value) {
        self.respond_with(Method::Get, endpoint, MockReply::Json(value));
    }

    pub fn respond_with(&self, method: Method, endpoint: &str, reply: MockReply) {
        self.script
            .lock()
            .standing
            .insert(route_key(method, endpoint), reply);
    }

    /// Answer the next `method endpoint` call with `reply`, then fall back
    pub fn push_reply(&self, method: Method, endpoint: &str, reply: MockReply) {
        self.script
            .lock()
            .queued
            .entry(route_key(method, endpoint))
            .or_default()
            .push_back(reply);
    }

    /// Delay applied to every call
    pub fn set_delay(&self, delay: Duration) {
        *self.delay.lock() = delay;
    }

    /// Delay applied to one route, overriding the global delay
    pub fn set_route_delay(&self, method: Method, endpoint: &str, delay: Duration) {
        self.script
            .lock()
            .delays
            .insert(route_key(method, endpoint), delay);
    }

    pub fn calls(&self) -> Vec<RecordedCall> {
        self.calls.lock().clone()
    }

    pub fn endpoints(&self) -> Vec<String> {
        self.calls.lock().iter().map(|c| c.endpoint.clone()).collect()
    }

    pub fn call_count(&self, endpoint: &str) -> usize {
        self.calls
            .lock()
            .iter()
            .filter(|c| c.endpoint == endpoint)
            .count()
    }

    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn request(
        &self,
        method: Method,
        url: Url,
        body: Option<Value>,
        _timeouts: &RequestTimeouts,
    ) -> Result<Value> {
        let endpoint = url
            .path()
            .strip_prefix(API_PREFIX)
            .unwrap_or(url.path())
            .to_string();
        let key = route_key(method, &endpoint);

        self.calls.lock().push(RecordedCall {
            method,
            endpoint,
            body,
        });

        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);

        let (reply, delay) = {
            let mut script = self.script.lock();
            let queued = script.queued.get_mut(&key).and_then(VecDeque::pop_front);
            let reply = queued
                .or_else(|| script.standing.get(&key).cloned())
                .unwrap_or(MockReply::Status(404));
            let delay = script
                .delays
                .get(&key)
                .copied()
                .unwrap_or(*self.delay.lock());
            (reply, delay)
        };

        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        reply.into_result(url.as_str())
    }
}
