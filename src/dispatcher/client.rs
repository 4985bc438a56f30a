//! REST request dispatcher
//!
//! Turns endpoint calls into transport requests queued on the shared
//! [`CueExecutor`], and keeps the consecutive-error accounting that decides
//! when the connection has to be torn down and re-established.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::{debug, error, trace, warn};
use url::Url;

use crate::config::DEFAULT_ERROR_THRESHOLD;
use crate::error::{Error, ErrorClass, Result};
use crate::executor::{CueExecutor, Priority};
use crate::transport::{Method, RequestTimeouts, Transport};

/// Endpoint used to check that the device answers at all
pub const PROBE_ENDPOINT: &str = "engines";

const EVENT_QUEUE_SIZE: usize = 16;

// ─────────────────────────────────────────────────────────────────
// Events
// ─────────────────────────────────────────────────────────────────

/// Signals from the dispatcher to the connection lifecycle
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatcherEvent {
    /// Failures crossed the threshold or hit a connection-fatal class
    Escalated {
        /// Session the failing request belonged to
        epoch: u64,
        class: ErrorClass,
        subject: String,
        consecutive: u32,
    },
}

// ─────────────────────────────────────────────────────────────────
// Error accounting
// ─────────────────────────────────────────────────────────────────

#[derive(Debug, Default)]
struct ErrorTracker {
    consecutive: u32,
    /// Last logged (class, subject), to log repeats only once
    last: Option<(ErrorClass, String)>,
}

enum FailureAction {
    Escalate { consecutive: u32 },
    LogFirst { consecutive: u32 },
    Repeat { consecutive: u32 },
}

impl ErrorTracker {
    fn success(&mut self) {
        self.consecutive = 0;
    }

    fn failure(&mut self, class: ErrorClass, subject: &str, threshold: u32) -> FailureAction {
        self.consecutive += 1;
        let consecutive = self.consecutive;

        let repeated = matches!(&self.last, Some((c, s)) if *c == class && s == subject);
        if !repeated {
            self.last = Some((class, subject.to_string()));
        }

        if class.is_connection_fatal() || consecutive >= threshold {
            self.consecutive = 0;
            FailureAction::Escalate { consecutive }
        } else if repeated {
            FailureAction::Repeat { consecutive }
        } else {
            FailureAction::LogFirst { consecutive }
        }
    }
}

// ─────────────────────────────────────────────────────────────────
// Dispatcher
// ─────────────────────────────────────────────────────────────────

/// Builds, queues and accounts for every request to the device
pub struct RequestDispatcher {
    base_url: RwLock<Url>,
    timeouts: RwLock<RequestTimeouts>,
    executor: CueExecutor,
    transport: Arc<dyn Transport>,
    enabled: AtomicBool,
    threshold: u32,
    epoch: AtomicU64,
    errors: Mutex<ErrorTracker>,
    event_tx: mpsc::Sender<DispatcherEvent>,
}

impl RequestDispatcher {
    /// Create a dispatcher for the REST API rooted at `base_url`.
    ///
    /// Requests start out disabled; the lifecycle enables them once the
    /// device has answered a probe.
    pub fn new(
        base_url: &str,
        timeouts: RequestTimeouts,
        executor: CueExecutor,
        transport: Arc<dyn Transport>,
    ) -> Result<(Self, mpsc::Receiver<DispatcherEvent>)> {
        let (event_tx, event_rx) = mpsc::channel(EVENT_QUEUE_SIZE);
        let dispatcher = Self {
            base_url: RwLock::new(parse_base_url(base_url)?),
            timeouts: RwLock::new(timeouts),
            executor,
            transport,
            enabled: AtomicBool::new(false),
            threshold: DEFAULT_ERROR_THRESHOLD,
            epoch: AtomicU64::new(0),
            errors: Mutex::new(ErrorTracker::default()),
            event_tx,
        };
        Ok((dispatcher, event_rx))
    }

    /// Point the dispatcher at a new address and timeouts
    pub fn reconfigure(&self, base_url: &str, timeouts: RequestTimeouts) -> Result<()> {
        *self.base_url.write() = parse_base_url(base_url)?;
        *self.timeouts.write() = timeouts;
        Ok(())
    }

    /// Resolve `endpoint` against the base URL
    pub fn url(&self, endpoint: &str) -> Result<Url> {
        self.base_url
            .read()
            .join(endpoint.trim_start_matches('/'))
            .map_err(|e| Error::InvalidEndpoint {
                endpoint: endpoint.to_string(),
                message: e.to_string(),
            })
    }

    /// `MalformedResponse` for a body from `endpoint` that did not decode.
    /// Carries the absolute URL, as transport errors do.
    pub fn malformed(&self, endpoint: &str, err: impl std::fmt::Display) -> Error {
        let url = self
            .url(endpoint)
            .map(|url| url.to_string())
            .unwrap_or_else(|_| endpoint.to_string());
        Error::MalformedResponse {
            url,
            message: err.to_string(),
        }
    }

    /// Queue a request and wait for its result.
    ///
    /// `RequestsDisabled` and `ExecutionBlocked` are returned without touching
    /// the network or the error counter. Request failures count towards the
    /// threshold and may emit [`DispatcherEvent::Escalated`].
    pub async fn call(
        &self,
        method: Method,
        endpoint: &str,
        body: Option<Value>,
        priority: Priority,
    ) -> Result<Value> {
        if !self.is_enabled() {
            trace!(%method, endpoint, "Requests disabled, skipping");
            return Err(Error::RequestsDisabled);
        }

        let url = self.url(endpoint)?;
        let timeouts = *self.timeouts.read();
        let transport = self.transport.clone();

        let handle = self.executor.submit(priority, move || async move {
            transport.request(method, url, body, &timeouts).await
        })?;
        let task_id = handle.task_id();

        match handle.await {
            Ok(value) => {
                self.errors.lock().success();
                Ok(value)
            }
            Err(err) if err.is_request_failure() => {
                self.record_failure(&err);
                Err(err)
            }
            Err(err @ Error::TaskAbandoned { .. }) => {
                debug!(task_id, %method, endpoint, "Request abandoned before it was sent");
                Err(err)
            }
            Err(err) => Err(err),
        }
    }

    pub async fn get(&self, endpoint: &str) -> Result<Value> {
        self.call(Method::Get, endpoint, None, Priority::High).await
    }

    pub async fn post(&self, endpoint: &str, body: Value) -> Result<Value> {
        self.call(Method::Post, endpoint, Some(body), Priority::High)
            .await
    }

    pub async fn patch(&self, endpoint: &str, body: Value) -> Result<Value> {
        self.call(Method::Patch, endpoint, Some(body), Priority::High)
            .await
    }

    pub async fn put(&self, endpoint: &str, body: Value) -> Result<Value> {
        self.call(Method::Put, endpoint, Some(body), Priority::High)
            .await
    }

    pub async fn delete(&self, endpoint: &str) -> Result<Value> {
        self.call(Method::Delete, endpoint, None, Priority::High)
            .await
    }

    /// Cheap reachability check straight on the transport.
    ///
    /// Bypasses the executor (which is blocked while disconnected) and
    /// leaves the error counter alone.
    pub async fn probe(&self) -> Result<Value> {
        let url = self.url(PROBE_ENDPOINT)?;
        let timeouts = *self.timeouts.read();
        debug!(url = %url, "Probing device");
        self.transport.request(Method::Get, url, None, &timeouts).await
    }

    fn record_failure(&self, err: &Error) {
        let class = err.class();
        let subject = err.subject().unwrap_or_default();
        let action = self.errors.lock().failure(class, subject, self.threshold);

        match action {
            FailureAction::Escalate { consecutive } => {
                let epoch = self.epoch();
                error!(
                    class = %class,
                    subject,
                    consecutive,
                    error = %err.format_for_log(),
                    "Request failure escalated"
                );
                let event = DispatcherEvent::Escalated {
                    epoch,
                    class,
                    subject: subject.to_string(),
                    consecutive,
                };
                if let Err(e) = self.event_tx.try_send(event) {
                    warn!(error = %e, "Escalation not delivered");
                }
            }
            FailureAction::LogFirst { consecutive } => {
                debug!(class = %class, subject, consecutive, error = %err, "Request failed");
            }
            FailureAction::Repeat { consecutive } => {
                trace!(class = %class, subject, consecutive, "Request failed again");
            }
        }
    }

    pub fn enable(&self) {
        self.enabled.store(true, Ordering::SeqCst);
    }

    pub fn disable(&self) {
        self.enabled.store(false, Ordering::SeqCst);
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    /// Start a new connection session: forget previous failures and tag
    /// future escalations with `epoch`
    pub fn begin_session(&self, epoch: u64) {
        self.epoch.store(epoch, Ordering::SeqCst);
        *self.errors.lock() = ErrorTracker::default();
    }

    pub fn epoch(&self) -> u64 {
        self.epoch.load(Ordering::SeqCst)
    }

    pub fn consecutive_errors(&self) -> u32 {
        self.errors.lock().consecutive
    }

    pub fn executor(&self) -> &CueExecutor {
        &self.executor
    }
}

fn parse_base_url(base_url: &str) -> Result<Url> {
    let normalized = if base_url.ends_with('/') {
        base_url.to_string()
    } else {
        format!("{}/", base_url)
    };
    Url::parse(&normalized).map_err(|e| Error::InvalidEndpoint {
        endpoint: base_url.to_string(),
        message: e.to_string(),
    })
}

// ─────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::mock::{MockReply, MockTransport};
    use serde_json::json;
    use std::time::Duration;

    const BASE: &str = "http://10.0.0.5/api/rest/v1/";

    fn dispatcher(
        mock: &Arc<MockTransport>,
    ) -> (RequestDispatcher, mpsc::Receiver<DispatcherEvent>) {
        let (dispatcher, events) = RequestDispatcher::new(
            BASE,
            RequestTimeouts::default(),
            CueExecutor::new(),
            mock.clone(),
        )
        .unwrap();
        dispatcher.enable();
        (dispatcher, events)
    }

    #[test]
    fn test_url_building() {
        let mock = MockTransport::new();
        let (dispatcher, _events) =
            RequestDispatcher::new("http://10.0.0.5:8080/api/rest/v1", RequestTimeouts::default(), CueExecutor::new(), mock)
                .unwrap();

        assert_eq!(
            dispatcher.url("engines").unwrap().as_str(),
            "http://10.0.0.5:8080/api/rest/v1/engines"
        );
        assert_eq!(
            dispatcher.url("/lino/rundown/3/7/items/").unwrap().as_str(),
            "http://10.0.0.5:8080/api/rest/v1/lino/rundown/3/7/items/"
        );
    }

    #[tokio::test]
    async fn test_call_returns_parsed_response() {
        let mock = MockTransport::new();
        mock.respond("engines", json!([{ "id": 1 }]));
        let (dispatcher, _events) = dispatcher(&mock);

        let value = dispatcher.get("engines").await.unwrap();
        assert_eq!(value, json!([{ "id": 1 }]));
        assert_eq!(mock.call_count("engines"), 1);
    }

    #[tokio::test]
    async fn test_body_is_forwarded() {
        let mock = MockTransport::new();
        mock.respond_with(Method::Patch, "engines/1/nodes/Mixer/properties/Gain", MockReply::Json(json!({})));
        let (dispatcher, _events) = dispatcher(&mock);

        dispatcher
            .patch("engines/1/nodes/Mixer/properties/Gain", json!({ "Value": 0.5 }))
            .await
            .unwrap();

        let calls = mock.calls();
        assert_eq!(calls[0].method, Method::Patch);
        assert_eq!(calls[0].body, Some(json!({ "Value": 0.5 })));
    }

    #[tokio::test]
    async fn test_disabled_short_circuits() {
        let mock = MockTransport::new();
        let (dispatcher, _events) = dispatcher(&mock);
        dispatcher.disable();

        let err = dispatcher.get("engines").await.unwrap_err();
        assert!(matches!(err, Error::RequestsDisabled));
        assert!(mock.calls().is_empty());
        assert_eq!(dispatcher.executor().stats().submitted, 0);
    }

    #[tokio::test]
    async fn test_blocked_never_reaches_transport() {
        let mock = MockTransport::new();
        let (dispatcher, _events) = dispatcher(&mock);
        dispatcher.executor().block();

        let err = dispatcher.get("engines").await.unwrap_err();
        assert!(matches!(err, Error::ExecutionBlocked));
        assert!(mock.calls().is_empty());
        assert_eq!(dispatcher.consecutive_errors(), 0);
    }

    #[tokio::test]
    async fn test_threshold_escalation() {
        let mock = MockTransport::new();
        mock.respond_with(Method::Get, "engines", MockReply::Status(500));
        let (dispatcher, mut events) = dispatcher(&mock);
        dispatcher.begin_session(3);

        for expected in 1..DEFAULT_ERROR_THRESHOLD {
            assert!(dispatcher.get("engines").await.is_err());
            assert_eq!(dispatcher.consecutive_errors(), expected);
            assert!(events.try_recv().is_err());
        }

        assert!(dispatcher.get("engines").await.is_err());
        match events.try_recv().unwrap() {
            DispatcherEvent::Escalated {
                epoch,
                class,
                subject,
                consecutive,
            } => {
                assert_eq!(epoch, 3);
                assert_eq!(class, ErrorClass::Other);
                assert_eq!(subject, format!("{}engines", BASE));
                assert_eq!(consecutive, DEFAULT_ERROR_THRESHOLD);
            }
        }
        assert_eq!(dispatcher.consecutive_errors(), 0);
    }

    #[tokio::test]
    async fn test_success_resets_counter() {
        let mock = MockTransport::new();
        mock.respond_with(Method::Get, "engines", MockReply::Status(404));
        mock.respond("templates", json!([]));
        let (dispatcher, mut events) = dispatcher(&mock);

        for _ in 0..3 {
            let _ = dispatcher.get("engines").await;
            let _ = dispatcher.get("engines").await;
            let _ = dispatcher.get("engines").await;
            assert_eq!(dispatcher.consecutive_errors(), 3);
            dispatcher.get("templates").await.unwrap();
            assert_eq!(dispatcher.consecutive_errors(), 0);
        }

        assert!(events.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_connection_fatal_escalates_immediately() {
        let mock = MockTransport::new();
        mock.push_reply(Method::Get, "engines", MockReply::Timeout);
        mock.push_reply(Method::Get, "nodes", MockReply::Refused);
        let (dispatcher, mut events) = dispatcher(&mock);

        let err = dispatcher.get("engines").await.unwrap_err();
        assert_eq!(err.class(), ErrorClass::Timeout);
        assert!(matches!(
            events.try_recv(),
            Ok(DispatcherEvent::Escalated { class: ErrorClass::Timeout, consecutive: 1, .. })
        ));

        dispatcher.get("nodes").await.unwrap_err();
        assert!(matches!(
            events.try_recv(),
            Ok(DispatcherEvent::Escalated { class: ErrorClass::ConnectionRefused, .. })
        ));
    }

    #[tokio::test]
    async fn test_auth_errors_do_not_escalate_below_threshold() {
        let mock = MockTransport::new();
        mock.respond_with(Method::Get, "engines", MockReply::Status(401));
        let (dispatcher, mut events) = dispatcher(&mock);

        let err = dispatcher.get("engines").await.unwrap_err();
        assert_eq!(err.class(), ErrorClass::Unauthorized);
        assert!(events.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_begin_session_resets_counter() {
        let mock = MockTransport::new();
        mock.respond_with(Method::Get, "engines", MockReply::Malformed);
        let (dispatcher, _events) = dispatcher(&mock);

        let _ = dispatcher.get("engines").await;
        let _ = dispatcher.get("engines").await;
        assert_eq!(dispatcher.consecutive_errors(), 2);

        dispatcher.begin_session(9);
        assert_eq!(dispatcher.consecutive_errors(), 0);
        assert_eq!(dispatcher.epoch(), 9);
    }

    #[tokio::test]
    async fn test_probe_bypasses_executor_and_counter() {
        let mock = MockTransport::new();
        mock.push_reply(Method::Get, "engines", MockReply::Refused);
        mock.respond("engines", json!([]));
        let (dispatcher, mut events) = dispatcher(&mock);
        dispatcher.disable();
        dispatcher.executor().block();

        assert!(dispatcher.probe().await.is_err());
        assert_eq!(dispatcher.consecutive_errors(), 0);
        assert!(events.try_recv().is_err());

        assert_eq!(dispatcher.probe().await.unwrap(), json!([]));
        assert_eq!(dispatcher.executor().stats().submitted, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_calls_are_serialized() {
        let mock = MockTransport::new();
        mock.respond("engines", json!([]));
        mock.set_delay(Duration::from_millis(20));
        let (dispatcher, _events) = dispatcher(&mock);
        let dispatcher = Arc::new(dispatcher);

        let mut tasks = Vec::new();
        for i in 0..6 {
            let dispatcher = dispatcher.clone();
            let priority = Priority::ALL[i % 3];
            tasks.push(tokio::spawn(async move {
                dispatcher.call(Method::Get, "engines", None, priority).await
            }));
        }
        for task in tasks {
            task.await.unwrap().unwrap();
        }

        assert_eq!(mock.call_count("engines"), 6);
        assert_eq!(mock.max_in_flight(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cleared_request_is_not_counted() {
        let mock = MockTransport::new();
        mock.respond("engines", json!([]));
        mock.set_delay(Duration::from_millis(50));
        let (dispatcher, _events) = dispatcher(&mock);
        let dispatcher = Arc::new(dispatcher);

        let first = {
            let d = dispatcher.clone();
            tokio::spawn(async move { d.get("engines").await })
        };
        tokio::time::sleep(Duration::from_millis(5)).await;
        let second = {
            let d = dispatcher.clone();
            tokio::spawn(async move { d.call(Method::Get, "engines", None, Priority::Low).await })
        };
        tokio::time::sleep(Duration::from_millis(5)).await;

        assert_eq!(dispatcher.executor().clear(None), 1);
        assert!(first.await.unwrap().is_ok());
        assert!(matches!(
            second.await.unwrap(),
            Err(Error::TaskAbandoned { .. })
        ));
        assert_eq!(dispatcher.consecutive_errors(), 0);
    }
}
