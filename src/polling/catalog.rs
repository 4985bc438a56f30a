//! Device data as last seen by the pollers
//!
//! Wire records mirror the REST payloads loosely: every field the device may
//! omit or null out has a default, and ids may arrive as numbers or strings.

use std::collections::BTreeMap;

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

use super::resource::Resource;

// ─────────────────────────────────────────────────────────────────
// Wire records
// ─────────────────────────────────────────────────────────────────

/// Accept `3`, `"3"` or `null` as an id
fn id_string<'de, D>(deserializer: D) -> std::result::Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(match Value::deserialize(deserializer)? {
        Value::String(s) => s,
        Value::Null => String::new(),
        other => other.to_string(),
    })
}

fn string_or_empty<'de, D>(deserializer: D) -> std::result::Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(Option::<String>::deserialize(deserializer)?.unwrap_or_default())
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct EngineRecord {
    #[serde(deserialize_with = "id_string")]
    pub id: String,
    #[serde(default, deserialize_with = "string_or_empty")]
    pub name: String,
    #[serde(default, deserialize_with = "string_or_empty")]
    pub display_name: String,
    #[serde(default, deserialize_with = "string_or_empty")]
    pub ip: String,
    #[serde(default, deserialize_with = "string_or_empty")]
    pub role: String,
    #[serde(default)]
    pub status: Value,
    #[serde(default)]
    pub rgraph_id: Value,
}

#[derive(Debug, Clone, Deserialize)]
pub(crate) struct NodeRecord {
    #[serde(rename = "NodePath")]
    pub node_path: String,
}

#[derive(Debug, Clone, Deserialize)]
pub(crate) struct PropertyRecord {
    #[serde(rename = "PropertyPath")]
    pub property_path: String,
    #[serde(rename = "Value", default)]
    pub value: Value,
}

#[derive(Debug, Clone, Deserialize)]
pub(crate) struct FunctionRecord {
    #[serde(rename = "FunctionPath")]
    pub function_path: String,
}

#[derive(Debug, Clone, Deserialize)]
pub(crate) struct RundownRecord {
    #[serde(deserialize_with = "id_string")]
    pub id: String,
    #[serde(default, deserialize_with = "string_or_empty")]
    pub name: String,
}

#[derive(Debug, Clone, Deserialize)]
pub(crate) struct ItemRecord {
    #[serde(deserialize_with = "id_string")]
    pub id: String,
    #[serde(default, deserialize_with = "string_or_empty")]
    pub name: String,
    #[serde(default)]
    pub template: Option<String>,
    #[serde(default)]
    pub buttons: Option<BTreeMap<String, Value>>,
}

#[derive(Debug, Clone, Deserialize)]
pub(crate) struct TemplateRecord {
    #[serde(default, deserialize_with = "string_or_empty")]
    pub name: String,
}

// ─────────────────────────────────────────────────────────────────
// Catalog
// ─────────────────────────────────────────────────────────────────

/// Engine role hosting rundowns and templates
pub const LINO_ROLE: &str = "Lino";

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EngineInfo {
    pub name: String,
    pub display_name: String,
    pub ip: String,
    pub role: String,
    pub status: Value,
    /// A render graph (project) is loaded
    pub active_project: bool,
}

impl EngineInfo {
    pub fn is_lino(&self) -> bool {
        self.role.eq_ignore_ascii_case(LINO_ROLE)
    }
}

impl From<EngineRecord> for EngineInfo {
    fn from(record: EngineRecord) -> Self {
        Self {
            name: record.name,
            display_name: record.display_name,
            ip: record.ip,
            role: record.role,
            status: record.status,
            active_project: !record.rgraph_id.is_null(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct NodeInfo {
    pub properties: BTreeMap<String, Value>,
    pub functions: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ItemInfo {
    pub name: String,
    pub template: Option<String>,
    /// Button key to label
    pub buttons: BTreeMap<String, String>,
}

impl From<ItemRecord> for ItemInfo {
    fn from(record: ItemRecord) -> Self {
        let buttons = record
            .buttons
            .unwrap_or_default()
            .into_iter()
            .map(|(key, label)| {
                let label = match label {
                    Value::String(s) if !s.is_empty() => s,
                    Value::Null | Value::Bool(false) => key.clone(),
                    Value::String(_) => key.clone(),
                    other => other.to_string(),
                };
                (key, label)
            })
            .collect();

        Self {
            name: record.name,
            template: record.template,
            buttons,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RundownInfo {
    pub name: String,
    /// Lino engine owning the rundown
    pub engine: String,
    pub items: BTreeMap<String, ItemInfo>,
}

/// Everything the pollers know about the device
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct DeviceCatalog {
    pub engines: BTreeMap<String, EngineInfo>,
    /// engine id -> node path -> node
    pub nodes: BTreeMap<String, BTreeMap<String, NodeInfo>>,
    pub rundowns: BTreeMap<String, RundownInfo>,
    /// The template pool rundown, keyed by rundown id
    pub templates: BTreeMap<String, RundownInfo>,
}

impl DeviceCatalog {
    pub fn lino_engines(&self) -> Vec<String> {
        self.engines
            .iter()
            .filter(|(_, engine)| engine.is_lino())
            .map(|(id, _)| id.clone())
            .collect()
    }

    /// Engines with a loaded project; only those expose nodes
    pub fn launched_engines(&self) -> Vec<String> {
        self.engines
            .iter()
            .filter(|(_, engine)| engine.active_project)
            .map(|(id, _)| id.clone())
            .collect()
    }

    pub fn node_count(&self) -> usize {
        self.nodes.values().map(BTreeMap::len).sum()
    }

    pub fn template_count(&self) -> usize {
        self.templates.values().map(|pool| pool.items.len()).sum()
    }

    /// Number of entries loaded for `resource`
    pub fn count(&self, resource: Resource) -> usize {
        match resource {
            Resource::Engines => self.engines.len(),
            Resource::Nodes => self.node_count(),
            Resource::Rundowns => self.rundowns.len(),
            Resource::Templates => self.template_count(),
        }
    }

    /// Variables describing the engines
    pub fn engine_variables(&self) -> Vec<(String, Value)> {
        let mut vars = vec![("connectedEngines".to_string(), Value::from(self.engines.len()))];
        for (id, engine) in &self.engines {
            vars.push((format!("engine{}_name", id), Value::from(engine.name.clone())));
            vars.push((format!("engine{}_ip", id), Value::from(engine.ip.clone())));
            vars.push((format!("engine{}_role", id), Value::from(engine.role.clone())));
            vars.push((format!("engine{}_status", id), engine.status.clone()));
            vars.push((format!("engine{}_launched", id), Value::from(engine.active_project)));
        }
        vars
    }
}
