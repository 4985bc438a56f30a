//! Connection lifecycle
//!
//! Disconnected → Probing → Loading → Steady, with ErrorBackoff entered on
//! escalations from the dispatcher. Each connection attempt runs as one
//! session tagged with an epoch; anything carrying an older epoch is stale.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use backoff::{backoff::Backoff, ExponentialBackoff};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tracing::{debug, info, warn};

use crate::config::{
    BridgeConfig, Feature, ENGINES_POLL_INTERVAL, PROBE_RETRY_DELAY, PROBE_RETRY_MAX_DELAY,
    STATE_FLUSH_PERIOD,
};
use crate::dispatcher::{DispatcherEvent, RequestDispatcher};
use crate::error::{ErrorClass, Result};
use crate::executor::ExecutorState;
use crate::polling::{DevicePoller, PollingTimer, Resource};
use crate::state::{PresentationLayer, StateUpdateBuffer};

pub const STATUS_CONNECTING: &str = "connecting";
pub const STATUS_CONNECTION_FAILED: &str = "Connection Failed!";
pub const STATUS_OK: &str = "ok";
pub const STATUS_WAITING_FOR_CONFIG: &str = "Waiting for config!";

/// Resources loaded after the engines, in order
const LOAD_ORDER: [Resource; 3] = [Resource::Rundowns, Resource::Templates, Resource::Nodes];

// ─────────────────────────────────────────────────────────────────
// State
// ─────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    /// No session; executor blocked
    #[default]
    Disconnected,
    /// Checking that the device answers
    Probing,
    /// Initial load of every enabled resource
    Loading,
    /// Connected, timers running
    Steady,
    /// Tearing down after an escalated failure
    ErrorBackoff,
}

impl ConnectionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Probing => "probing",
            ConnectionState::Loading => "loading",
            ConnectionState::Steady => "steady",
            ConnectionState::ErrorBackoff => "error_backoff",
        }
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Point-in-time view of the lifecycle
#[derive(Debug, Clone, Serialize)]
pub struct LifecycleSnapshot {
    pub state: ConnectionState,
    pub epoch: u64,
    pub executor: ExecutorState,
    pub consecutive_errors: u32,
    pub retry_pending: bool,
    pub active_timers: usize,
}

fn probe_backoff() -> ExponentialBackoff {
    ExponentialBackoff {
        current_interval: PROBE_RETRY_DELAY,
        initial_interval: PROBE_RETRY_DELAY,
        max_interval: PROBE_RETRY_MAX_DELAY,
        randomization_factor: 0.0,
        multiplier: 2.0,
        max_elapsed_time: None, // Retry forever
        ..Default::default()
    }
}

// ─────────────────────────────────────────────────────────────────
// Lifecycle
// ─────────────────────────────────────────────────────────────────

struct Inner {
    config: RwLock<BridgeConfig>,
    dispatcher: Arc<RequestDispatcher>,
    poller: Arc<DevicePoller>,
    buffer: Arc<StateUpdateBuffer>,
    presentation: Arc<dyn PresentationLayer>,
    state: RwLock<ConnectionState>,
    epoch: AtomicU64,
    session: Mutex<Option<JoinHandle<()>>>,
    retry: Mutex<Option<JoinHandle<()>>>,
    backoff: Mutex<ExponentialBackoff>,
    timers: Mutex<Vec<PollingTimer>>,
    supervisor: Mutex<Option<JoinHandle<()>>>,
    events: Mutex<Option<mpsc::Receiver<DispatcherEvent>>>,
}

/// Drives the connection to one device
pub struct ConnectionLifecycle {
    inner: Arc<Inner>,
}

impl ConnectionLifecycle {
    pub fn new(
        config: BridgeConfig,
        dispatcher: Arc<RequestDispatcher>,
        events: mpsc::Receiver<DispatcherEvent>,
        poller: Arc<DevicePoller>,
        buffer: Arc<StateUpdateBuffer>,
        presentation: Arc<dyn PresentationLayer>,
    ) -> Self {
        dispatcher.disable();
        dispatcher.executor().block();

        Self {
            inner: Arc::new(Inner {
                config: RwLock::new(config),
                dispatcher,
                poller,
                buffer,
                presentation,
                state: RwLock::new(ConnectionState::Disconnected),
                epoch: AtomicU64::new(0),
                session: Mutex::new(None),
                retry: Mutex::new(None),
                backoff: Mutex::new(probe_backoff()),
                timers: Mutex::new(Vec::new()),
                supervisor: Mutex::new(None),
                events: Mutex::new(Some(events)),
            }),
        }
    }

    /// Start watching for escalations and open the first session.
    ///
    /// Fails if the configuration is incomplete; the lifecycle then stays
    /// disconnected with a "Waiting for config!" status.
    pub fn start(&self) -> Result<()> {
        self.inner.spawn_supervisor();
        self.inner.connect()
    }

    /// Apply new settings and reconnect from scratch
    pub fn reconfigure(&self, config: BridgeConfig) -> Result<()> {
        info!(host = %config.device.host, "Configuration updated");
        *self.inner.config.write() = config;
        self.inner.connect()
    }

    /// Stop everything and leave the executor drained
    pub async fn shutdown(&self) {
        let inner = &self.inner;
        info!("Shutting down connection");

        inner.epoch.fetch_add(1, Ordering::SeqCst);
        inner.dispatcher.disable();
        inner.stop_timers();
        inner.poller.set_initialized(false);
        for slot in [&inner.retry, &inner.session, &inner.supervisor] {
            if let Some(handle) = slot.lock().take() {
                handle.abort();
            }
        }
        inner.buffer.stop();

        let executor = inner.dispatcher.executor();
        executor.block();
        let grace = inner.config.read().requests.grace_period();
        sleep(grace).await;
        let cleared = executor.clear(None);
        executor.stop();

        inner.set_state(ConnectionState::Disconnected);
        debug!(cleared, "Connection shut down");
    }

    pub fn state(&self) -> ConnectionState {
        self.inner.state()
    }

    pub fn epoch(&self) -> u64 {
        self.inner.epoch.load(Ordering::SeqCst)
    }

    /// Whether a delayed reconnect attempt is scheduled
    pub fn retry_pending(&self) -> bool {
        self.inner.retry_pending()
    }

    pub fn snapshot(&self) -> LifecycleSnapshot {
        LifecycleSnapshot {
            state: self.state(),
            epoch: self.epoch(),
            executor: self.inner.dispatcher.executor().state(),
            consecutive_errors: self.inner.dispatcher.consecutive_errors(),
            retry_pending: self.retry_pending(),
            active_timers: self
                .inner
                .timers
                .lock()
                .iter()
                .filter(|timer| timer.is_active())
                .count(),
        }
    }
}

impl Drop for ConnectionLifecycle {
    fn drop(&mut self) {
        for slot in [&self.inner.retry, &self.inner.session, &self.inner.supervisor] {
            if let Some(handle) = slot.lock().take() {
                handle.abort();
            }
        }
    }
}

impl Inner {
    fn state(&self) -> ConnectionState {
        *self.state.read()
    }

    fn set_state(&self, state: ConnectionState) {
        let previous = std::mem::replace(&mut *self.state.write(), state);
        if previous != state {
            debug!(from = %previous, to = %state, "Connection state changed");
        }
    }

    fn is_current(&self, epoch: u64) -> bool {
        self.epoch.load(Ordering::SeqCst) == epoch
    }

    fn retry_pending(&self) -> bool {
        self.retry
            .lock()
            .as_ref()
            .is_some_and(|handle| !handle.is_finished())
    }

    /// Drop the current session, if any, and start over from Probing
    fn connect(self: &Arc<Self>) -> Result<()> {
        let config = self.config.read().clone();
        self.teardown();

        if let Err(err) = config.validate() {
            warn!(error = %err, "Configuration incomplete, not connecting");
            self.presentation.set_status(STATUS_WAITING_FOR_CONFIG, None);
            return Err(err);
        }

        self.dispatcher
            .reconfigure(&config.device.base_url(), config.requests.timeouts())?;
        self.poller.reconfigure(config.device.clone());
        self.backoff.lock().reset();

        info!(host = %config.device.host, "Trying to connect");
        self.presentation.set_status(STATUS_CONNECTING, None);
        self.spawn_session();
        Ok(())
    }

    /// Back to Disconnected without waiting for in-flight work
    fn teardown(&self) {
        self.dispatcher.disable();
        self.stop_timers();
        self.poller.set_initialized(false);
        for slot in [&self.retry, &self.session] {
            if let Some(handle) = slot.lock().take() {
                handle.abort();
            }
        }

        let executor = self.dispatcher.executor();
        executor.block();
        executor.clear(None);
        self.set_state(ConnectionState::Disconnected);
    }

    fn spawn_session(self: &Arc<Self>) {
        let epoch = self.epoch.fetch_add(1, Ordering::SeqCst) + 1;
        self.dispatcher.begin_session(epoch);

        let inner = Arc::clone(self);
        let handle = tokio::spawn(async move { inner.run_session(epoch).await });
        if let Some(previous) = self.session.lock().replace(handle) {
            previous.abort();
        }
    }

    async fn run_session(self: Arc<Self>, epoch: u64) {
        self.set_state(ConnectionState::Probing);

        if let Err(err) = self.dispatcher.probe().await {
            if !self.is_current(epoch) {
                return;
            }
            info!(error = %err, "Connection failed");
            self.presentation.set_status(STATUS_CONNECTION_FAILED, None);
            self.schedule_retry();
            return;
        }
        if !self.is_current(epoch) {
            return;
        }

        info!(epoch, "Connection succeeded");
        self.backoff.lock().reset();
        self.dispatcher.executor().unblock();
        self.dispatcher.enable();
        self.buffer.start(STATE_FLUSH_PERIOD);
        self.set_state(ConnectionState::Loading);

        self.load().await;

        if !self.is_current(epoch) || !self.dispatcher.is_enabled() {
            debug!(epoch, "Session ended during loading");
            return;
        }

        self.poller.set_initialized(true);
        self.set_state(ConnectionState::Steady);
        self.presentation.set_status(STATUS_OK, None);
        info!("Bridge ready");

        self.start_timers();
    }

    /// Initial load: engines first, then every enabled feature
    async fn load(&self) {
        let device = self.config.read().device.clone();

        self.presentation
            .set_status(&Resource::Engines.loading_status(), None);
        self.poller.poll(Resource::Engines).await;
        info!(
            engines = self.poller.catalog().count(Resource::Engines),
            "Engines loaded"
        );

        for resource in LOAD_ORDER {
            let enabled = resource
                .feature()
                .is_some_and(|feature| device.has_feature(feature));
            if !enabled {
                continue;
            }
            if !self.dispatcher.is_enabled() {
                return;
            }

            self.presentation
                .set_status(&resource.loading_status(), Some("0%"));
            self.poller.poll(resource).await;
            info!(
                %resource,
                count = self.poller.catalog().count(resource),
                "Data loaded"
            );
        }
    }

    fn poll_timer(&self, resource: Resource) -> PollingTimer {
        let poller = self.poller.clone();
        PollingTimer::new(resource.name(), move || {
            let poller = poller.clone();
            async move {
                poller.poll(resource).await;
            }
        })
    }

    fn start_timers(&self) {
        let device = self.config.read().device.clone();
        let mut timers = self.timers.lock();
        for timer in timers.drain(..) {
            timer.stop();
        }

        let engines = self.poll_timer(Resource::Engines);
        engines.start(ENGINES_POLL_INTERVAL);
        timers.push(engines);

        let period = device.interval.period();
        for feature in Feature::ALL {
            if !device.auto_updates(feature) {
                continue;
            }
            let resource = Resource::from_feature(feature);
            let timer = self.poll_timer(resource);
            timer.start(period);
            debug!(%resource, interval_ms = period.as_millis() as u64, "Auto update started");
            timers.push(timer);
        }
    }

    fn stop_timers(&self) {
        for timer in self.timers.lock().drain(..) {
            timer.stop();
        }
    }

    /// Reconnect after the next backoff delay. A pending retry is kept.
    fn schedule_retry(self: &Arc<Self>) {
        let mut retry = self.retry.lock();
        if retry.as_ref().is_some_and(|handle| !handle.is_finished()) {
            debug!("Retry already pending");
            return;
        }

        let delay = self
            .backoff
            .lock()
            .next_backoff()
            .unwrap_or(PROBE_RETRY_MAX_DELAY);
        let epoch = self.epoch.load(Ordering::SeqCst);
        debug!(delay_s = delay.as_secs(), "Retrying connection");

        let inner = Arc::clone(self);
        *retry = Some(tokio::spawn(async move {
            sleep(delay).await;
            inner.retry.lock().take();
            if !inner.is_current(epoch) {
                return;
            }
            inner.spawn_session();
        }));
    }

    fn spawn_supervisor(self: &Arc<Self>) {
        let Some(mut events) = self.events.lock().take() else {
            return;
        };

        let weak: Weak<Inner> = Arc::downgrade(self);
        let handle = tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                let Some(inner) = weak.upgrade() else {
                    break;
                };
                match event {
                    DispatcherEvent::Escalated {
                        epoch,
                        class,
                        subject,
                        consecutive,
                    } => {
                        let state = inner.state();
                        let live = matches!(state, ConnectionState::Loading | ConnectionState::Steady);
                        if !inner.is_current(epoch) || !live {
                            debug!(epoch, %state, "Ignoring stale escalation");
                            continue;
                        }
                        inner.recover(class, &subject, consecutive).await;
                    }
                }
            }
        });
        *self.supervisor.lock() = Some(handle);
    }

    /// ErrorBackoff: stop, let the in-flight request finish, drop the queue,
    /// then either reconnect or wait for the retry.
    ///
    /// A `connect()` while this runs starts a newer session; the recovery
    /// then stops without touching the queue, the state or the retry slot.
    async fn recover(self: &Arc<Self>, class: ErrorClass, subject: &str, consecutive: u32) {
        let epoch = self.epoch.load(Ordering::SeqCst);
        warn!(class = %class, subject, consecutive, "Connection lost");
        self.set_state(ConnectionState::ErrorBackoff);
        self.presentation
            .set_status(&format!("ERROR: {}", class), None);

        self.dispatcher.disable();
        self.stop_timers();
        self.poller.set_initialized(false);
        if let Some(session) = self.session.lock().take() {
            session.abort();
        }

        let executor = self.dispatcher.executor();
        executor.block();
        let grace = self.config.read().requests.grace_period();
        sleep(grace).await;
        if !self.is_current(epoch) {
            debug!(epoch, "Reconnected during grace period, recovery abandoned");
            return;
        }
        let cleared = executor.clear(None);
        debug!(cleared, "Request queue cleared");

        let probe = self.dispatcher.probe().await;
        if !self.is_current(epoch) {
            debug!(epoch, "Reconnected during recovery probe, result ignored");
            return;
        }
        match probe {
            Ok(_) => {
                info!("Device reachable again, reconnecting");
                self.presentation.set_status(STATUS_CONNECTING, None);
                self.spawn_session();
            }
            Err(err) => {
                info!(error = %err, "Device unreachable");
                self.set_state(ConnectionState::Disconnected);
                self.presentation.set_status(STATUS_CONNECTION_FAILED, None);
                self.schedule_retry();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use serde_json::{json, Value};

    use crate::config::Interval;
    use crate::executor::CueExecutor;
    use crate::state::{InMemoryStateStore, RecordingPresentation};
    use crate::transport::mock::{MockReply, MockTransport};
    use crate::transport::{Method, RequestTimeouts};

    struct Harness {
        lifecycle: ConnectionLifecycle,
        transport: Arc<MockTransport>,
        presentation: Arc<RecordingPresentation>,
        dispatcher: Arc<RequestDispatcher>,
    }

    fn config(features: Vec<Feature>, auto_update: Vec<Feature>) -> BridgeConfig {
        let mut config = BridgeConfig::default();
        config.device.host = "10.0.0.1".to_string();
        config.device.features = features;
        config.device.auto_update = auto_update;
        config.device.interval = Interval::Short;
        config
    }

    fn harness(config: BridgeConfig) -> Harness {
        let transport = MockTransport::new();
        let (dispatcher, events) = RequestDispatcher::new(
            "http://10.0.0.1/api/rest/v1/",
            RequestTimeouts::default(),
            CueExecutor::new(),
            transport.clone(),
        )
        .unwrap();
        let dispatcher = Arc::new(dispatcher);
        let presentation = Arc::new(RecordingPresentation::default());
        let buffer = Arc::new(StateUpdateBuffer::new(presentation.clone()));
        let poller = Arc::new(DevicePoller::new(
            dispatcher.clone(),
            Arc::new(InMemoryStateStore::new()),
            buffer.clone(),
            presentation.clone(),
            config.device.clone(),
        ));
        let lifecycle = ConnectionLifecycle::new(
            config,
            dispatcher.clone(),
            events,
            poller,
            buffer,
            presentation.clone(),
        );

        Harness {
            lifecycle,
            transport,
            presentation,
            dispatcher,
        }
    }

    fn engines() -> Value {
        json!([
            { "id": 1, "name": "RE-1", "role": "Engine", "rgraphId": 3 },
            { "id": 9, "name": "Lino", "role": "Lino", "rgraphId": null }
        ])
    }

    fn first_index(endpoints: &[String], prefix: &str) -> usize {
        endpoints
            .iter()
            .position(|e| e.starts_with(prefix))
            .unwrap_or(usize::MAX)
    }

    #[tokio::test(start_paused = true)]
    async fn test_connects_and_loads_in_order() {
        let h = harness(config(vec![Feature::Nodes, Feature::Rundowns], vec![]));
        h.transport.respond("engines", engines());
        h.transport.respond("engines/1/nodes", json!([]));
        h.transport
            .respond("lino/rundowns/9", json!([{ "id": 1, "name": "Show" }]));
        h.transport.respond("lino/rundown/9/1/items/", json!([]));

        h.lifecycle.start().unwrap();
        assert_eq!(h.lifecycle.epoch(), 1);
        sleep(Duration::from_millis(100)).await;

        assert_eq!(h.lifecycle.state(), ConnectionState::Steady);
        let snapshot = h.lifecycle.snapshot();
        assert!(!snapshot.executor.blocked);
        assert_eq!(snapshot.consecutive_errors, 0);

        let statuses = h.presentation.statuses();
        assert_eq!(statuses.first().map(String::as_str), Some(STATUS_CONNECTING));
        assert!(statuses.contains(&"LOAD: Engines data ...".to_string()));
        assert!(statuses.contains(&"LOAD: Nodes data ...".to_string()));
        assert_eq!(statuses.last().map(String::as_str), Some(STATUS_OK));

        let endpoints = h.transport.endpoints();
        assert_eq!(&endpoints[..2], &["engines".to_string(), "engines".to_string()]);
        assert!(first_index(&endpoints, "lino/") < first_index(&endpoints, "engines/1/nodes"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_invalid_config_waits() {
        let mut bad = config(vec![], vec![]);
        bad.device.host = String::new();
        let h = harness(bad);

        assert!(h.lifecycle.start().is_err());
        sleep(Duration::from_secs(30)).await;

        assert_eq!(h.lifecycle.state(), ConnectionState::Disconnected);
        assert_eq!(
            h.presentation.last_status().map(|(s, _)| s),
            Some(STATUS_WAITING_FOR_CONFIG.to_string())
        );
        assert!(h.transport.calls().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_probe_failure_retries_with_backoff() {
        let h = harness(config(vec![], vec![]));
        h.transport
            .respond_with(Method::Get, "engines", MockReply::Refused);

        h.lifecycle.start().unwrap();
        sleep(Duration::from_millis(100)).await;

        assert_eq!(h.lifecycle.state(), ConnectionState::Probing);
        assert!(h.lifecycle.retry_pending());
        assert!(h.lifecycle.snapshot().executor.blocked);
        assert_eq!(
            h.presentation.last_status().map(|(s, _)| s),
            Some(STATUS_CONNECTION_FAILED.to_string())
        );
        assert_eq!(h.transport.call_count("engines"), 1);

        // 10 s, then 20 s
        sleep(Duration::from_secs(10)).await;
        assert_eq!(h.transport.call_count("engines"), 2);
        sleep(Duration::from_secs(15)).await;
        assert_eq!(h.transport.call_count("engines"), 2);
        sleep(Duration::from_secs(10)).await;
        assert_eq!(h.transport.call_count("engines"), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_timer_not_duplicated() {
        let h = harness(config(vec![], vec![]));
        h.transport
            .respond_with(Method::Get, "engines", MockReply::Refused);

        h.lifecycle.start().unwrap();
        sleep(Duration::from_millis(100)).await;
        assert!(h.lifecycle.retry_pending());

        h.lifecycle.inner.schedule_retry();
        h.lifecycle.inner.schedule_retry();

        sleep(Duration::from_secs(10)).await;
        assert_eq!(h.transport.call_count("engines"), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_recovers_after_connection_fatal_error() {
        let h = harness(config(vec![], vec![]));
        h.transport.respond("engines", engines());

        h.lifecycle.start().unwrap();
        sleep(Duration::from_millis(100)).await;
        assert_eq!(h.lifecycle.state(), ConnectionState::Steady);

        // The next engines poll times out
        h.transport
            .push_reply(Method::Get, "engines", MockReply::Timeout);
        sleep(Duration::from_millis(5100)).await;

        assert_eq!(h.lifecycle.state(), ConnectionState::ErrorBackoff);
        assert!(h.lifecycle.snapshot().executor.blocked);
        assert!(!h.dispatcher.is_enabled());
        assert!(h
            .presentation
            .statuses()
            .contains(&"ERROR: TimeoutError".to_string()));

        sleep(Duration::from_secs(1)).await;
        assert_eq!(h.lifecycle.state(), ConnectionState::Steady);
        assert_eq!(h.lifecycle.epoch(), 2);
        assert!(h.dispatcher.is_enabled());
    }

    #[tokio::test(start_paused = true)]
    async fn test_reconfigure_during_grace_period_wins() {
        let h = harness(config(vec![], vec![]));
        h.transport.respond("engines", engines());

        h.lifecycle.start().unwrap();
        sleep(Duration::from_millis(100)).await;
        h.transport
            .push_reply(Method::Get, "engines", MockReply::Timeout);
        sleep(Duration::from_millis(5000)).await;
        assert_eq!(h.lifecycle.state(), ConnectionState::ErrorBackoff);

        // New address while the old session is still draining
        let mut updated = config(vec![], vec![]);
        updated.device.host = "10.0.0.2".to_string();
        h.lifecycle.reconfigure(updated).unwrap();
        sleep(Duration::from_millis(10)).await;
        assert_eq!(h.lifecycle.state(), ConnectionState::Steady);
        assert_eq!(h.lifecycle.epoch(), 2);

        // The old recovery neither reaches the device nor touches the new session
        h.transport
            .respond_with(Method::Get, "engines", MockReply::Refused);
        let requests = h.transport.call_count("engines");
        sleep(Duration::from_secs(1)).await;

        assert_eq!(h.transport.call_count("engines"), requests);
        assert_eq!(h.lifecycle.state(), ConnectionState::Steady);
        assert_eq!(h.lifecycle.epoch(), 2);
        assert!(!h.lifecycle.retry_pending());
        assert!(h.dispatcher.is_enabled());
        assert!(!h.lifecycle.snapshot().executor.blocked);
    }

    #[tokio::test(start_paused = true)]
    async fn test_threshold_escalation_then_disconnect() {
        let h = harness(config(vec![], vec![]));
        h.transport.respond("engines", engines());

        h.lifecycle.start().unwrap();
        sleep(Duration::from_millis(100)).await;

        h.transport
            .respond_with(Method::Get, "engines", MockReply::Status(500));

        // Engines polls at 5, 10, 15 and 20 s stay below the threshold
        sleep(Duration::from_secs(21)).await;
        assert_eq!(h.lifecycle.state(), ConnectionState::Steady);
        assert_eq!(h.dispatcher.consecutive_errors(), 4);

        // The fifth escalates; the follow-up probe fails as well
        sleep(Duration::from_secs(5)).await;
        assert_eq!(h.lifecycle.state(), ConnectionState::Disconnected);
        assert!(h.lifecycle.retry_pending());
        assert_eq!(
            h.presentation.last_status().map(|(s, _)| s),
            Some(STATUS_CONNECTION_FAILED.to_string())
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_auto_update_timers() {
        let h = harness(config(vec![Feature::Rundowns], vec![Feature::Rundowns]));
        h.transport.respond("engines", engines());
        h.transport.respond("lino/rundowns/9", json!([]));

        h.lifecycle.start().unwrap();
        sleep(Duration::from_millis(100)).await;
        assert_eq!(h.transport.call_count("lino/rundowns/9"), 1);

        // Short interval: one rundowns poll per second
        sleep(Duration::from_millis(2050)).await;
        assert_eq!(h.transport.call_count("lino/rundowns/9"), 3);
        // Engines plus rundowns
        assert_eq!(h.lifecycle.snapshot().active_timers, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reconfigure_starts_new_session() {
        let h = harness(config(vec![], vec![]));
        h.transport.respond("engines", engines());

        h.lifecycle.start().unwrap();
        sleep(Duration::from_millis(100)).await;
        assert_eq!(h.lifecycle.epoch(), 1);

        let mut updated = config(vec![], vec![]);
        updated.device.host = "10.0.0.2".to_string();
        h.lifecycle.reconfigure(updated).unwrap();
        sleep(Duration::from_millis(100)).await;

        assert_eq!(h.lifecycle.epoch(), 2);
        assert_eq!(h.lifecycle.state(), ConnectionState::Steady);
        let connecting = h
            .presentation
            .statuses()
            .iter()
            .filter(|s| *s == STATUS_CONNECTING)
            .count();
        assert_eq!(connecting, 2);
        assert_eq!(
            h.dispatcher.url("engines").unwrap().as_str(),
            "http://10.0.0.2/api/rest/v1/engines"
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_stops_everything() {
        let h = harness(config(vec![], vec![]));
        h.transport.respond("engines", engines());

        h.lifecycle.start().unwrap();
        sleep(Duration::from_millis(100)).await;
        h.lifecycle.shutdown().await;

        assert_eq!(h.lifecycle.state(), ConnectionState::Disconnected);
        assert!(!h.dispatcher.is_enabled());
        let snapshot = h.lifecycle.snapshot();
        assert!(snapshot.executor.blocked);
        assert!(!snapshot.executor.running);
        assert_eq!(snapshot.active_timers, 0);

        // Buffer flushed the engine variables on stop
        assert!(h.presentation.variables().contains_key("connectedEngines"));

        let calls = h.transport.calls().len();
        sleep(Duration::from_secs(30)).await;
        assert_eq!(h.transport.calls().len(), calls);
    }
}
