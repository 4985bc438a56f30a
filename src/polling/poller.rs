//! Device pollers
//!
//! Each [`Resource`] has one poll routine that walks the REST API through the
//! dispatcher, rebuilds its part of the [`DeviceCatalog`], writes values to
//! the state store and reports progress through the update buffer.

use std::collections::{BTreeMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use serde::de::DeserializeOwned;
use serde_json::{json, Value};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::config::DeviceSettings;
use crate::dispatcher::RequestDispatcher;
use crate::error::{Error, Result};
use crate::executor::Priority;
use crate::state::{PresentationLayer, StateKey, StateStore, StateUpdateBuffer};
use crate::transport::{encode_segment, Method};

use super::catalog::{
    DeviceCatalog, EngineInfo, EngineRecord, FunctionRecord, ItemInfo, ItemRecord, NodeInfo,
    NodeRecord, PropertyRecord, RundownInfo, RundownRecord, TemplateRecord,
};
use super::resource::{format_duration, LoadingFlags, PollOutcome, Resource};

/// Feedback re-evaluated when the node set changes
pub const FEEDBACK_NODE_PROPERTY: &str = "nodesProperty";
/// Feedback re-evaluated when rundown buttons change
pub const FEEDBACK_RUNDOWN_BUTTONS: &str = "rundownButtonLabel";
/// Feedback re-evaluated when template buttons change
pub const FEEDBACK_TEMPLATE_BUTTONS: &str = "templateButtonLabel";

/// Property prefixes that are device internals, not user state
const HIDDEN_PROPERTY_PREFIXES: [&str; 2] = ["Node", "Debug"];

/// Pool names that turn template syncing off
fn pool_disabled(name: &str) -> bool {
    let name = name.trim();
    name.is_empty() || name == "*"
}

/// Errors raised because requests are being torn down rather than failing
fn is_teardown(err: &Error) -> bool {
    matches!(
        err,
        Error::RequestsDisabled | Error::ExecutionBlocked | Error::TaskAbandoned { .. }
    )
}

/// Step counter behind the `update{X}Progress` variables
struct Progress {
    resource: Resource,
    current: usize,
    total: usize,
}

impl Progress {
    fn new(resource: Resource, total: usize) -> Self {
        Self {
            resource,
            current: 0,
            total,
        }
    }

    fn step(&mut self, poller: &DevicePoller) {
        self.advance(poller, 1);
    }

    fn advance(&mut self, poller: &DevicePoller, steps: usize) {
        self.current += steps;
        if self.current < self.total {
            poller.report_progress(self.resource, 100 * self.current / self.total);
        }
    }
}

pub struct DevicePoller {
    dispatcher: Arc<RequestDispatcher>,
    store: Arc<dyn StateStore>,
    buffer: Arc<StateUpdateBuffer>,
    presentation: Arc<dyn PresentationLayer>,
    settings: RwLock<DeviceSettings>,
    flags: LoadingFlags,
    catalog: RwLock<DeviceCatalog>,
    initialized: AtomicBool,
}

impl DevicePoller {
    pub fn new(
        dispatcher: Arc<RequestDispatcher>,
        store: Arc<dyn StateStore>,
        buffer: Arc<StateUpdateBuffer>,
        presentation: Arc<dyn PresentationLayer>,
        settings: DeviceSettings,
    ) -> Self {
        Self {
            dispatcher,
            store,
            buffer,
            presentation,
            settings: RwLock::new(settings),
            flags: LoadingFlags::default(),
            catalog: RwLock::new(DeviceCatalog::default()),
            initialized: AtomicBool::new(false),
        }
    }

    /// Poll `resource` once.
    ///
    /// Returns [`PollOutcome::Skipped`] without any request when a poll of
    /// the same resource is already running.
    pub async fn poll(&self, resource: Resource) -> PollOutcome {
        let Some(guard) = self.flags.try_begin(resource) else {
            debug!(%resource, "Poll already running, skipping");
            return PollOutcome::Skipped;
        };

        let feedback = resource.feedback_id();
        self.presentation.check_feedbacks(&[feedback]);
        let started = Instant::now();

        match resource {
            Resource::Engines => self.poll_engines(started).await,
            Resource::Nodes => self.poll_nodes(started).await,
            Resource::Rundowns => self.poll_rundowns(started).await,
            Resource::Templates => self.poll_templates(started).await,
        }

        drop(guard);
        self.presentation.check_feedbacks(&[feedback]);
        PollOutcome::Completed
    }

    #[cfg(test)]
    pub fn is_loading(&self, resource: Resource) -> bool {
        self.flags.is_loading(resource)
    }

    /// Initial loading is over; progress no longer goes to the status line
    pub fn set_initialized(&self, initialized: bool) {
        self.initialized.store(initialized, Ordering::SeqCst);
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized.load(Ordering::SeqCst)
    }

    pub fn reconfigure(&self, settings: DeviceSettings) {
        *self.settings.write() = settings;
    }

    pub fn catalog(&self) -> DeviceCatalog {
        self.catalog.read().clone()
    }

    // ─────────────────────────────────────────────────────────────
    // Engines
    // ─────────────────────────────────────────────────────────────

    async fn poll_engines(&self, started: Instant) {
        let resource = Resource::Engines;
        let records = match self
            .fetch_list::<EngineRecord>("engines", resource.priority())
            .await
        {
            Ok(records) => records,
            Err(err) if is_teardown(&err) => {
                debug!(error = %err, "Engines poll interrupted");
                return;
            }
            Err(err) => {
                debug!(error = %err, "Engines poll failed");
                self.catalog.write().engines.clear();
                self.buffer.append_all(self.catalog.read().engine_variables());
                self.buffer.append(resource.duration_variable(), "0s");
                return;
            }
        };

        let engines: BTreeMap<String, EngineInfo> = records
            .into_iter()
            .map(|record| (record.id.clone(), EngineInfo::from(record)))
            .collect();

        for (id, engine) in &engines {
            self.store
                .write(StateKey::new(id, "", "name"), json!(engine.name));
            self.store
                .write(StateKey::new(id, "", "displayName"), json!(engine.display_name));
            self.store.write(StateKey::new(id, "", "ip"), json!(engine.ip));
            self.store.write(StateKey::new(id, "", "role"), json!(engine.role));
            self.store
                .write(StateKey::new(id, "", "status"), engine.status.clone());
            self.store
                .write(StateKey::new(id, "", "activeProject"), json!(engine.active_project));
        }

        let changed = {
            let mut catalog = self.catalog.write();
            if catalog.engines != engines {
                catalog.engines = engines;
                true
            } else {
                false
            }
        };

        if changed {
            let catalog = self.catalog.read();
            debug!(
                engines = catalog.engines.len(),
                lino = catalog.lino_engines().len(),
                "Engines changed"
            );
            self.buffer.append_all(catalog.engine_variables());
        }
        self.buffer
            .append(resource.duration_variable(), format_duration(started.elapsed()));
    }

    // ─────────────────────────────────────────────────────────────
    // Nodes
    // ─────────────────────────────────────────────────────────────

    async fn poll_nodes(&self, started: Instant) {
        let resource = Resource::Nodes;
        let priority = resource.priority();
        self.report_progress(resource, 0);

        let (engines, display_names) = {
            let catalog = self.catalog.read();
            let names: BTreeMap<String, String> = catalog
                .engines
                .iter()
                .map(|(id, engine)| (id.clone(), engine.display_name.clone()))
                .collect();
            (catalog.launched_engines(), names)
        };
        let engine_count = self.catalog.read().engines.len();

        let mut nodes = BTreeMap::new();
        let mut progress = Progress::new(resource, 0);
        let mut node_counts: Vec<usize> = Vec::new();

        for engine in engines {
            let engine_segment = encode_segment(&engine);
            let records = self
                .fetch_list::<NodeRecord>(&format!("engines/{}/nodes", engine_segment), priority)
                .await
                .unwrap_or_else(|err| {
                    debug!(engine = %engine, error = %err, "Node list unavailable");
                    Vec::new()
                });
            progress.current += 1;

            if !records.is_empty() {
                // Extrapolate the total from the engines seen so far
                node_counts.push(records.len());
                let seen: usize = node_counts.iter().sum();
                progress.total =
                    (seen * engine_count + node_counts.len() / 2) / node_counts.len() + engine_count;
            }

            let mut engine_nodes = BTreeMap::new();
            for record in records {
                let node_segment = encode_segment(&record.node_path);
                let base = format!("engines/{}/nodes/{}", engine_segment, node_segment);
                let mut node = NodeInfo::default();

                match self
                    .fetch_list::<PropertyRecord>(&format!("{}/properties", base), priority)
                    .await
                {
                    Ok(properties) => {
                        for property in properties {
                            if HIDDEN_PROPERTY_PREFIXES
                                .iter()
                                .any(|prefix| property.property_path.starts_with(prefix))
                            {
                                continue;
                            }
                            self.store.write(
                                StateKey::new(&engine, &record.node_path, &property.property_path),
                                property.value.clone(),
                            );
                            node.properties
                                .insert(property.property_path, property.value);
                        }
                    }
                    Err(err) => {
                        debug!(node = %record.node_path, error = %err, "Node properties unavailable")
                    }
                }
                progress.current += 1;

                match self
                    .fetch_list::<FunctionRecord>(&format!("{}/functions", base), priority)
                    .await
                {
                    Ok(functions) => {
                        node.functions = functions.into_iter().map(|f| f.function_path).collect();
                    }
                    Err(err) => {
                        debug!(node = %record.node_path, error = %err, "Node functions unavailable")
                    }
                }

                engine_nodes.insert(record.node_path, node);
                progress.advance(self, 0);
            }

            if !self.is_initialized() {
                let name = display_names.get(&engine).cloned().unwrap_or_default();
                info!(engine = %name, nodes = engine_nodes.len(), "Nodes loaded");
            }
            nodes.insert(engine, engine_nodes);
        }

        if !self.dispatcher.is_enabled() {
            debug!("Requests disabled during nodes poll, discarding result");
            return;
        }

        let changed = {
            let mut catalog = self.catalog.write();
            if catalog.nodes != nodes {
                catalog.nodes = nodes;
                true
            } else {
                false
            }
        };
        if changed {
            self.presentation.check_feedbacks(&[FEEDBACK_NODE_PROPERTY]);
        }

        self.finish(resource, started);
    }

    // ─────────────────────────────────────────────────────────────
    // Rundowns
    // ─────────────────────────────────────────────────────────────

    async fn poll_rundowns(&self, started: Instant) {
        let resource = Resource::Rundowns;
        let priority = resource.priority();
        self.report_progress(resource, 0);

        let lino_engines = self.catalog.read().lino_engines();
        if lino_engines.is_empty() {
            warn!("Skipping rundowns update: no Lino engines available");
            self.finish(resource, started);
            return;
        }

        let mut rundowns = BTreeMap::new();
        let mut progress = Progress::new(resource, lino_engines.len());

        for engine in &lino_engines {
            match self
                .fetch_list::<RundownRecord>(
                    &format!("lino/rundowns/{}", encode_segment(engine)),
                    priority,
                )
                .await
            {
                Ok(records) => {
                    progress.total += records.len();
                    for record in records {
                        let items = self
                            .fetch_items(engine, &record.id, priority)
                            .await
                            .unwrap_or_else(|err| {
                                debug!(
                                    rundown = %record.name,
                                    engine = %engine,
                                    error = %err,
                                    "No items found for rundown"
                                );
                                BTreeMap::new()
                            });
                        rundowns.insert(
                            record.id,
                            RundownInfo {
                                name: record.name,
                                engine: engine.clone(),
                                items,
                            },
                        );
                        progress.step(self);
                    }
                }
                Err(err) => debug!(engine = %engine, error = %err, "Rundown list unavailable"),
            }
            progress.step(self);
        }

        if !self.dispatcher.is_enabled() {
            debug!("Requests disabled during rundowns poll, discarding result");
            return;
        }

        let changed = {
            let mut catalog = self.catalog.write();
            if catalog.rundowns != rundowns {
                catalog.rundowns = rundowns;
                true
            } else {
                false
            }
        };
        if changed {
            let catalog = self.catalog.read();
            info!(rundowns = catalog.rundowns.len(), "Rundowns updated");
            for (id, rundown) in &catalog.rundowns {
                self.write_rundown("rundown", id, rundown);
            }
            self.presentation.check_feedbacks(&[FEEDBACK_RUNDOWN_BUTTONS]);
        }

        self.finish(resource, started);
    }

    // ─────────────────────────────────────────────────────────────
    // Templates
    // ─────────────────────────────────────────────────────────────

    async fn poll_templates(&self, started: Instant) {
        let resource = Resource::Templates;
        let priority = resource.priority();

        let pool_name = self.settings.read().template_pool.trim().to_string();
        if pool_disabled(&pool_name) {
            debug!("Template pool sync disabled");
            self.catalog.write().templates.clear();
            return;
        }

        self.report_progress(resource, 0);

        let lino_engines = self.catalog.read().lino_engines();
        if lino_engines.is_empty() {
            warn!("Skipping templates update: no Lino engines available");
            self.finish(resource, started);
            return;
        }

        let available = self
            .fetch_list::<TemplateRecord>("lino/templates", priority)
            .await
            .unwrap_or_else(|err| {
                debug!(error = %err, "Template list unavailable");
                Vec::new()
            });

        let mut templates = BTreeMap::new();
        if !available.is_empty() {
            let mut progress = Progress::new(resource, available.len() + 2);

            let pool = self.find_pool(&lino_engines, &pool_name, priority).await;
            progress.step(self);

            match &pool {
                None => info!(pool = %pool_name, "Template pool rundown not found, skipping sync"),
                Some((engine, rundown)) => {
                    if let Some(info) = self.load_pool(engine, rundown, priority).await {
                        progress.advance(self, info.items.len());
                        templates.insert(rundown.id.clone(), info);
                    }
                }
            }
            progress.step(self);

            if let Some((engine, rundown)) = &pool {
                let present: HashSet<String> = templates
                    .get(&rundown.id)
                    .map(|info: &RundownInfo| info.items.values().map(|i| i.name.clone()).collect())
                    .unwrap_or_default();

                let added = self
                    .add_missing_templates(engine, rundown, &available, &present, &mut progress)
                    .await;

                if added {
                    templates.clear();
                    if let Some(info) = self.load_pool(engine, rundown, priority).await {
                        templates.insert(rundown.id.clone(), info);
                    }
                }
            }
        }

        if !self.dispatcher.is_enabled() {
            debug!("Requests disabled during templates poll, discarding result");
            return;
        }

        let changed = {
            let mut catalog = self.catalog.write();
            if catalog.templates != templates {
                catalog.templates = templates;
                true
            } else {
                false
            }
        };
        if changed {
            let catalog = self.catalog.read();
            info!(templates = catalog.template_count(), "Templates updated");
            for (id, pool) in &catalog.templates {
                self.write_rundown("templates", id, pool);
            }
            self.presentation.check_feedbacks(&[FEEDBACK_TEMPLATE_BUTTONS]);
        }

        self.finish(resource, started);
    }

    /// Locate the rundown named `pool_name` on the first Lino engine that has it
    async fn find_pool(
        &self,
        lino_engines: &[String],
        pool_name: &str,
        priority: Priority,
    ) -> Option<(String, RundownRecord)> {
        for engine in lino_engines {
            let endpoint = format!("lino/rundowns/{}", encode_segment(engine));
            match self.fetch_list::<RundownRecord>(&endpoint, priority).await {
                Ok(rundowns) => {
                    if let Some(rundown) = rundowns.into_iter().find(|r| r.name == pool_name) {
                        return Some((engine.clone(), rundown));
                    }
                }
                Err(err) => debug!(engine = %engine, error = %err, "Rundown list unavailable"),
            }
        }
        None
    }

    async fn load_pool(
        &self,
        engine: &str,
        rundown: &RundownRecord,
        priority: Priority,
    ) -> Option<RundownInfo> {
        match self.fetch_items(engine, &rundown.id, priority).await {
            Ok(items) => Some(RundownInfo {
                name: rundown.name.clone(),
                engine: engine.to_string(),
                items,
            }),
            Err(err) => {
                debug!(pool = %rundown.name, error = %err, "Template pool items unavailable");
                None
            }
        }
    }

    /// Add every template not yet in the pool as a new pool item. Stops at
    /// the first rejected insert. Returns whether anything was attempted.
    async fn add_missing_templates(
        &self,
        engine: &str,
        rundown: &RundownRecord,
        available: &[TemplateRecord],
        present: &HashSet<String>,
        progress: &mut Progress,
    ) -> bool {
        let endpoint = format!(
            "lino/rundown/{}/{}/items/",
            encode_segment(engine),
            encode_segment(&rundown.id)
        );
        let mut added = false;

        for template in available {
            if !present.contains(&template.name) {
                added = true;
                let body = json!({ "template": template.name, "name": template.name });
                match self
                    .dispatcher
                    .call(Method::Post, &endpoint, Some(body), Resource::Templates.priority())
                    .await
                {
                    Ok(response) if response.get("name").is_some() => {
                        debug!(template = %template.name, "Template added to pool");
                    }
                    Ok(_) => {
                        warn!(template = %template.name, "Template pool rejected new item");
                        break;
                    }
                    Err(err) => {
                        warn!(template = %template.name, error = %err, "Adding template to pool failed");
                        break;
                    }
                }
            }
            progress.step(self);
        }

        added
    }

    // ─────────────────────────────────────────────────────────────
    // Helpers
    // ─────────────────────────────────────────────────────────────

    /// GET a JSON array; an empty response counts as an empty list
    async fn fetch_list<T: DeserializeOwned>(
        &self,
        endpoint: &str,
        priority: Priority,
    ) -> Result<Vec<T>> {
        let value = self
            .dispatcher
            .call(Method::Get, endpoint, None, priority)
            .await?;
        if value.is_null() {
            return Ok(Vec::new());
        }
        serde_json::from_value(value).map_err(|e| self.dispatcher.malformed(endpoint, e))
    }

    async fn fetch_items(
        &self,
        engine: &str,
        rundown: &str,
        priority: Priority,
    ) -> Result<BTreeMap<String, ItemInfo>> {
        let endpoint = format!(
            "lino/rundown/{}/{}/items/",
            encode_segment(engine),
            encode_segment(rundown)
        );
        let records = self.fetch_list::<ItemRecord>(&endpoint, priority).await?;
        Ok(records
            .into_iter()
            .map(|record| (record.id.clone(), ItemInfo::from(record)))
            .collect())
    }

    fn write_rundown(&self, kind: &str, id: &str, rundown: &RundownInfo) {
        let node = format!("{}/{}", kind, id);
        self.store
            .write(StateKey::new(&rundown.engine, &node, "name"), json!(rundown.name));

        for (item_id, item) in &rundown.items {
            let item_node = format!("{}/item/{}", node, item_id);
            self.store
                .write(StateKey::new(&rundown.engine, &item_node, "name"), json!(item.name));
            if let Some(template) = &item.template {
                self.store.write(
                    StateKey::new(&rundown.engine, &item_node, "template"),
                    json!(template),
                );
            }
            for (key, label) in &item.buttons {
                self.store.write(
                    StateKey::new(&rundown.engine, &item_node, format!("button/{}", key)),
                    Value::from(label.as_str()),
                );
            }
        }
    }

    fn report_progress(&self, resource: Resource, percent: usize) {
        let text = format!("{}%", percent);
        self.buffer.append(resource.progress_variable(), text.as_str());
        if !self.is_initialized() {
            self.presentation
                .set_status(&resource.loading_status(), Some(&text));
        }
    }

    fn finish(&self, resource: Resource, started: Instant) {
        self.buffer.append(resource.progress_variable(), "100%");
        self.buffer
            .append(resource.duration_variable(), format_duration(started.elapsed()));
    }
}
