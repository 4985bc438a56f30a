//! Actions run against one or more engines

use std::collections::HashSet;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde_json::{json, Value};
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tracing::{debug, error, info, warn};

use crate::dispatcher::RequestDispatcher;
use crate::error::{Error, Result};
use crate::executor::Priority;
use crate::polling::{PropertyRecord, FEEDBACK_NODE_PROPERTY};
use crate::state::{PresentationLayer, StateKey, StateStore};
use crate::transport::{encode_segment, Method};

/// Feedback re-evaluated when a mixer channel changes
pub const FEEDBACK_MIXER_CHANNEL: &str = "basicMixerChannel";
/// Feedback re-evaluated when a media file path changes
pub const FEEDBACK_MEDIA_FILE_PATH: &str = "basicMediaFilePath";

const TRANSITION_FUNCTION: &str = "Default//DoTransition/0";
const TRANSITION_DURATION: &str = "DoTransition/Duration";
const FILE_PATH_PROPERTY: &str = "File//FilePath/0";
const PROGRAM_CHANNEL: &str = "ProgramChannel";
const PREVIEW_CHANNEL: &str = "PreviewChannel";

/// Channels are read back after the transition duration plus 3%
const TRANSITION_SETTLE_FACTOR: f64 = 1.03;
const MAX_TRANSITION_SECS: f64 = 3600.0;

// ─────────────────────────────────────────────────────────────────
// Arguments
// ─────────────────────────────────────────────────────────────────

/// Mixer channel targeted by a channel switch
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MixerChannel {
    Preview,
    Program,
}

impl MixerChannel {
    /// Property path of the channel on a mixer node
    pub fn property(&self) -> &'static str {
        match self {
            MixerChannel::Preview => "Channels//PreviewChannel/0",
            MixerChannel::Program => "Channels//ProgramChannel/0",
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            MixerChannel::Preview => "preview",
            MixerChannel::Program => "program",
        }
    }
}

impl fmt::Display for MixerChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MixerChannel {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "preview" => Ok(MixerChannel::Preview),
            "program" => Ok(MixerChannel::Program),
            other => Err(Error::Config(format!(
                "Unknown mixer channel '{}'. Must be one of: preview, program",
                other
            ))),
        }
    }
}

/// Function path for a display name: "Do Transition" becomes
/// "Default//DoTransition/0". Function paths are returned unchanged.
pub fn function_id(name: &str) -> String {
    if name.contains("//") {
        return name.to_string();
    }

    let mut converted = String::new();
    for word in name.split(' ') {
        let mut chars = word.chars();
        if let Some(first) = chars.next() {
            converted.extend(first.to_uppercase());
            converted.push_str(&chars.as_str().to_lowercase());
        }
    }
    format!("Default//{}/0", converted)
}

/// Asset share of the RealityHub host, e.g. `\\10.0.0.1\Reality_Share\Reality\Assets\`
pub fn default_media_directory(host: &str) -> String {
    let server = host.split(':').next().unwrap_or(host);
    format!(r"\\{}\Reality_Share\Reality\Assets\", server)
}

fn media_file_value(directory: &str, path: &str) -> String {
    let mut value = directory.to_string();
    if !value.ends_with('\\') {
        value.push('\\');
    }
    value.push_str(path.strip_prefix('\\').unwrap_or(path));
    value
}

// ─────────────────────────────────────────────────────────────────
// Report
// ─────────────────────────────────────────────────────────────────

/// Per-engine outcome of one action
#[derive(Debug)]
pub struct ActionReport {
    pub action: &'static str,
    pub succeeded: Vec<String>,
    pub failed: Vec<(String, Error)>,
}

impl ActionReport {
    fn new(action: &'static str) -> Self {
        Self {
            action,
            succeeded: Vec::new(),
            failed: Vec::new(),
        }
    }

    fn record(&mut self, engine: &str, result: Result<()>) {
        match result {
            Ok(()) => {
                debug!(action = self.action, engine, "Action executed");
                self.succeeded.push(engine.to_string());
            }
            Err(err) if err.is_retryable() => {
                warn!(action = self.action, engine, error = %err, "Action not executed, device busy or unreachable");
                self.failed.push((engine.to_string(), err));
            }
            Err(err) => {
                error!(action = self.action, engine, error = %err, "Action execution failed");
                self.failed.push((engine.to_string(), err));
            }
        }
    }

    pub fn is_success(&self) -> bool {
        self.failed.is_empty()
    }

    /// The first engine failure, if any
    pub fn into_result(self) -> Result<()> {
        match self.failed.into_iter().next() {
            Some((_, err)) => Err(err),
            None => Ok(()),
        }
    }
}

// ─────────────────────────────────────────────────────────────────
// Actions
// ─────────────────────────────────────────────────────────────────

type ReadKey = (String, String);

/// Marks a property read of one engine and node as in flight
struct ReadGuard<'a> {
    reads: &'a Mutex<HashSet<ReadKey>>,
    key: ReadKey,
}

impl<'a> ReadGuard<'a> {
    fn acquire(reads: &'a Mutex<HashSet<ReadKey>>, engine: &str, node: &str) -> Option<Self> {
        let key = (engine.to_string(), node.to_string());
        if !reads.lock().insert(key.clone()) {
            return None;
        }
        Some(Self { reads, key })
    }
}

impl Drop for ReadGuard<'_> {
    fn drop(&mut self) {
        self.reads.lock().remove(&self.key);
    }
}

/// Operator actions sent through the request dispatcher.
///
/// Multi-engine actions run engine by engine; a failing engine is recorded
/// in the [`ActionReport`] and never stops the others.
pub struct DeviceActions {
    dispatcher: Arc<RequestDispatcher>,
    store: Arc<dyn StateStore>,
    presentation: Arc<dyn PresentationLayer>,
    reads: Mutex<HashSet<ReadKey>>,
    refreshes: Mutex<Vec<JoinHandle<()>>>,
}

impl DeviceActions {
    pub fn new(
        dispatcher: Arc<RequestDispatcher>,
        store: Arc<dyn StateStore>,
        presentation: Arc<dyn PresentationLayer>,
    ) -> Self {
        Self {
            dispatcher,
            store,
            presentation,
            reads: Mutex::new(HashSet::new()),
            refreshes: Mutex::new(Vec::new()),
        }
    }

    /// Run the transition of `node` on every engine. Once the transition
    /// duration has passed, the program and preview channels are read back
    /// into the state store.
    pub async fn do_transition(&self, engines: &[String], node: &str) -> Result<ActionReport> {
        require("node", node)?;

        let mut report = ActionReport::new("transition");
        for engine in engines {
            let result = self.transition(engine, node).await;
            report.record(engine, result);
        }
        Ok(report)
    }

    async fn transition(&self, engine: &str, node: &str) -> Result<()> {
        let endpoint = function_endpoint(engine, node, TRANSITION_FUNCTION);
        let response = self.dispatcher.post(&endpoint, json!({})).await?;
        confirm(&response, "transition", engine)?;

        let properties = fetch_properties(&self.dispatcher, engine, node, Priority::High).await?;
        let duration = properties
            .iter()
            .find(|p| p.property_path.contains(TRANSITION_DURATION))
            .and_then(|p| p.value.as_f64());
        if let Some(seconds) = duration {
            self.schedule_channel_refresh(engine, node, seconds);
        }
        Ok(())
    }

    fn schedule_channel_refresh(&self, engine: &str, node: &str, seconds: f64) {
        let seconds = if seconds.is_finite() {
            seconds.clamp(0.0, MAX_TRANSITION_SECS)
        } else {
            0.0
        };
        let delay = Duration::from_secs_f64(seconds * TRANSITION_SETTLE_FACTOR);
        debug!(engine, node, delay_ms = delay.as_millis() as u64, "Channel refresh scheduled");

        let dispatcher = self.dispatcher.clone();
        let store = self.store.clone();
        let presentation = self.presentation.clone();
        let engine = engine.to_string();
        let node = node.to_string();

        let handle = tokio::spawn(async move {
            sleep(delay).await;
            match fetch_properties(&dispatcher, &engine, &node, Priority::Medium).await {
                Ok(properties) => {
                    for property in properties
                        .into_iter()
                        .filter(|p| is_channel(&p.property_path))
                    {
                        store.write(
                            StateKey::new(&engine, &node, property.property_path),
                            property.value,
                        );
                    }
                    presentation.check_feedbacks(&[FEEDBACK_MIXER_CHANNEL, FEEDBACK_NODE_PROPERTY]);
                }
                Err(err) => debug!(engine = %engine, node = %node, error = %err, "Channel refresh failed"),
            }
        });

        let mut refreshes = self.refreshes.lock();
        refreshes.retain(|handle| !handle.is_finished());
        refreshes.push(handle);
    }

    /// Wait for every scheduled channel refresh
    pub async fn settle(&self) {
        let pending: Vec<JoinHandle<()>> = self.refreshes.lock().drain(..).collect();
        for handle in pending {
            if let Err(err) = handle.await {
                debug!(error = %err, "Channel refresh ended early");
            }
        }
    }

    /// Put channel `name` on the preview or program bus of a mixer node
    pub async fn set_mixer_channel(
        &self,
        engines: &[String],
        node: &str,
        channel: MixerChannel,
        name: &str,
    ) -> Result<ActionReport> {
        require("node", node)?;
        require("channel name", name)?;

        Ok(self
            .set_on_engines(
                "mixer-channel",
                engines,
                node,
                channel.property(),
                json!({ "Value": name }),
                &[FEEDBACK_MIXER_CHANNEL, FEEDBACK_NODE_PROPERTY],
            )
            .await)
    }

    /// Point a media input node at a file below `directory`
    pub async fn set_media_file_path(
        &self,
        engines: &[String],
        node: &str,
        directory: &str,
        path: &str,
    ) -> Result<ActionReport> {
        require("node", node)?;

        let value = media_file_value(directory, path);
        Ok(self
            .set_on_engines(
                "media-file-path",
                engines,
                node,
                FILE_PATH_PROPERTY,
                json!({ "Value": value }),
                &[FEEDBACK_MEDIA_FILE_PATH, FEEDBACK_NODE_PROPERTY],
            )
            .await)
    }

    /// Set any property of a node
    pub async fn set_property(
        &self,
        engines: &[String],
        node: &str,
        property: &str,
        value: Value,
    ) -> Result<ActionReport> {
        require("node", node)?;
        require("property", property)?;

        Ok(self
            .set_on_engines(
                "set-property",
                engines,
                node,
                property,
                json!({ "Value": value }),
                &[FEEDBACK_NODE_PROPERTY, FEEDBACK_MIXER_CHANNEL, FEEDBACK_MEDIA_FILE_PATH],
            )
            .await)
    }

    async fn set_on_engines(
        &self,
        action: &'static str,
        engines: &[String],
        node: &str,
        property: &str,
        body: Value,
        feedbacks: &[&str],
    ) -> ActionReport {
        let mut report = ActionReport::new(action);
        for engine in engines {
            let result = self
                .patch_property(action, engine, node, property, body.clone())
                .await;
            let changed = result.is_ok();
            report.record(engine, result);
            if changed {
                self.presentation.check_feedbacks(feedbacks);
            }
        }
        report
    }

    /// PATCH one property and store the value the device reports back
    async fn patch_property(
        &self,
        action: &str,
        engine: &str,
        node: &str,
        property: &str,
        body: Value,
    ) -> Result<()> {
        let endpoint = format!(
            "{}/properties/{}",
            node_endpoint(engine, node),
            encode_segment(property)
        );
        let response = self.dispatcher.patch(&endpoint, body).await?;
        if response.as_object().map_or(true, |map| map.is_empty()) {
            return Err(rejected(action, engine));
        }

        let record: PropertyRecord = serde_json::from_value(response)
            .map_err(|e| self.dispatcher.malformed(&endpoint, e))?;
        self.store.write(
            StateKey::new(engine, node, record.property_path),
            record.value,
        );
        Ok(())
    }

    /// Trigger a node function by display name ("Do Transition") or path
    pub async fn trigger_function(
        &self,
        engines: &[String],
        node: &str,
        function: &str,
    ) -> Result<ActionReport> {
        require("node", node)?;
        require("function", function)?;

        let function = function_id(function);
        let mut report = ActionReport::new("trigger-function");
        for engine in engines {
            let endpoint = function_endpoint(engine, node, &function);
            let result = match self.dispatcher.post(&endpoint, json!({})).await {
                Ok(response) => confirm(&response, "trigger-function", engine),
                Err(err) => Err(err),
            };
            report.record(engine, result);
        }
        Ok(report)
    }

    /// Press a button of a rundown or template item. Playout answers
    /// without a confirmation flag.
    pub async fn press_button(&self, rundown: &str, item: &str, button: &str) -> Result<()> {
        require("rundown", rundown)?;
        require("item", item)?;
        require("button", button)?;

        let endpoint = format!(
            "playout/rundowns/{}/items/{}/{}",
            encode_segment(rundown),
            encode_segment(item),
            encode_segment(button)
        );
        self.dispatcher.post(&endpoint, json!({})).await?;
        info!(rundown, item, button, "Button pressed");
        Ok(())
    }

    /// Read the properties of `node` at medium priority and store `property`.
    ///
    /// One read per engine and node at a time: a concurrent call returns
    /// `Ok(None)` without a request, as does a property the node lacks.
    /// `feedback_id` is re-checked whenever the node returned properties.
    pub async fn read_property(
        &self,
        engine: &str,
        node: &str,
        property: &str,
        feedback_id: &str,
    ) -> Result<Option<Value>> {
        require("node", node)?;
        require("property", property)?;

        let Some(_guard) = ReadGuard::acquire(&self.reads, engine, node) else {
            debug!(engine, node, "Property read already in flight");
            return Ok(None);
        };

        let properties = fetch_properties(&self.dispatcher, engine, node, Priority::Medium).await?;
        let found = properties
            .iter()
            .find(|record| record.property_path == property)
            .map(|record| record.value.clone());
        if let Some(value) = &found {
            self.store
                .write(StateKey::new(engine, node, property), value.clone());
        }
        if !properties.is_empty() {
            self.presentation.check_feedbacks(&[feedback_id]);
        }
        Ok(found)
    }
}

// ─────────────────────────────────────────────────────────────────
// Helpers
// ─────────────────────────────────────────────────────────────────

fn require(what: &str, value: &str) -> Result<()> {
    if value.trim().is_empty() {
        return Err(Error::InvalidEndpoint {
            endpoint: what.to_string(),
            message: format!("{} must not be empty", what),
        });
    }
    Ok(())
}

fn node_endpoint(engine: &str, node: &str) -> String {
    format!("engines/{}/nodes/{}", encode_segment(engine), encode_segment(node))
}

fn function_endpoint(engine: &str, node: &str, function: &str) -> String {
    format!("{}/functions/{}", node_endpoint(engine, node), encode_segment(function))
}

fn is_channel(property_path: &str) -> bool {
    property_path.contains(PROGRAM_CHANNEL) || property_path.contains(PREVIEW_CHANNEL)
}

fn rejected(action: &str, engine: &str) -> Error {
    Error::ActionRejected {
        action: action.to_string(),
        engine: engine.to_string(),
    }
}

/// Function calls answer `{ "success": true }` when they ran
fn confirm(response: &Value, action: &str, engine: &str) -> Result<()> {
    if response.get("success").and_then(Value::as_bool) == Some(true) {
        Ok(())
    } else {
        Err(rejected(action, engine))
    }
}

async fn fetch_properties(
    dispatcher: &RequestDispatcher,
    engine: &str,
    node: &str,
    priority: Priority,
) -> Result<Vec<PropertyRecord>> {
    let endpoint = format!("{}/properties", node_endpoint(engine, node));
    let value = dispatcher
        .call(Method::Get, &endpoint, None, priority)
        .await?;
    if value.is_null() {
        return Ok(Vec::new());
    }
    serde_json::from_value(value).map_err(|e| dispatcher.malformed(&endpoint, e))
}
