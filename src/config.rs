//! Configuration system for the RealityHub bridge
//!
//! Supports multiple configuration sources with the following precedence (highest to lowest):
//! 1. CLI arguments
//! 2. Environment variables (REALITYHUB_* prefix)
//! 3. Configuration file (TOML)
//! 4. Default values

use std::fmt;
use std::fs;
use std::net::Ipv4Addr;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::{Error, Result};
use crate::transport::RequestTimeouts;

/// Consecutive request failures tolerated before a reconnect is forced
pub const DEFAULT_ERROR_THRESHOLD: u32 = 5;

/// Period of the state flush tick
pub const STATE_FLUSH_PERIOD: Duration = Duration::from_millis(100);

/// Engines are always polled on this fixed period once connected
pub const ENGINES_POLL_INTERVAL: Duration = Duration::from_millis(5000);

/// First delay before a failed probe is retried
pub const PROBE_RETRY_DELAY: Duration = Duration::from_secs(10);

/// Upper bound for the probe retry backoff
pub const PROBE_RETRY_MAX_DELAY: Duration = Duration::from_secs(60);

/// Main bridge configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct BridgeConfig {
    /// Target device and polled features
    pub device: DeviceSettings,

    /// Request timeouts and teardown timing
    pub requests: RequestSettings,

    /// Logging configuration
    pub logging: LoggingSettings,
}

/// Optional data sets polled from the device in addition to engines
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Feature {
    Nodes,
    Rundowns,
    Templates,
}

impl Feature {
    pub const ALL: [Feature; 3] = [Feature::Nodes, Feature::Rundowns, Feature::Templates];

    pub fn as_str(&self) -> &'static str {
        match self {
            Feature::Nodes => "nodes",
            Feature::Rundowns => "rundowns",
            Feature::Templates => "templates",
        }
    }
}

impl fmt::Display for Feature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Feature {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "nodes" => Ok(Feature::Nodes),
            "rundowns" => Ok(Feature::Rundowns),
            "templates" => Ok(Feature::Templates),
            other => Err(Error::config_field_invalid(
                "device.features",
                format!("unknown feature '{}'", other),
            )),
        }
    }
}

/// Auto-update interval presets
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Interval {
    /// As often as possible (1 s)
    Short,
    /// 10 s
    Medium,
    /// Every minute
    Long,
}

impl Interval {
    pub fn period(&self) -> Duration {
        match self {
            Interval::Short => Duration::from_secs(1),
            Interval::Medium => Duration::from_secs(10),
            Interval::Long => Duration::from_secs(60),
        }
    }
}

impl FromStr for Interval {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "short" => Ok(Interval::Short),
            "medium" => Ok(Interval::Medium),
            "long" => Ok(Interval::Long),
            other => Err(Error::config_field_invalid(
                "device.interval",
                format!("unknown interval '{}' (expected short, medium or long)", other),
            )),
        }
    }
}

/// Target device settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceSettings {
    /// RealityHub server address (IPv4, optionally with ":port")
    pub host: String,

    /// Additional features to load
    pub features: Vec<Feature>,

    /// Features refreshed periodically once connected
    pub auto_update: Vec<Feature>,

    /// Auto-update interval preset
    pub interval: Interval,

    /// Name of the rundown that holds the templates
    pub template_pool: String,
}

/// Request timing settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RequestSettings {
    /// DNS lookup timeout in milliseconds
    pub lookup_ms: u64,

    /// TCP connect timeout in milliseconds
    pub connect_ms: u64,

    /// TLS handshake timeout in milliseconds
    pub secure_connect_ms: u64,

    /// Socket idle timeout in milliseconds
    pub socket_ms: u64,

    /// Request upload timeout in milliseconds
    pub send_ms: u64,

    /// Response timeout in milliseconds
    pub response_ms: u64,

    /// Delay between blocking the queue and clearing it on teardown
    pub grace_period_ms: u64,
}

/// Logging settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingSettings {
    /// Log level: trace, debug, info, warn, error
    pub level: String,

    /// Log file path (empty = no file logging)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file: Option<String>,

    /// Maximum log file size in MB before rotation
    pub max_file_size_mb: u64,

    /// Number of rotated log files to keep
    pub max_files: u32,

    /// Enable JSON formatted logging
    pub json_format: bool,
}

impl Default for DeviceSettings {
    fn default() -> Self {
        Self {
            host: String::new(),
            features: vec![],
            auto_update: vec![],
            interval: Interval::Short,
            template_pool: "CompanionTemplatesPool".to_string(),
        }
    }
}

impl Default for RequestSettings {
    fn default() -> Self {
        Self {
            lookup_ms: 1000,
            connect_ms: 1000,
            secure_connect_ms: 1000,
            socket_ms: 1000,
            send_ms: 1000,
            response_ms: 1000,
            grace_period_ms: 500,
        }
    }
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            file: None,
            max_file_size_mb: 100,
            max_files: 5,
            json_format: false,
        }
    }
}

impl DeviceSettings {
    pub fn has_feature(&self, feature: Feature) -> bool {
        self.features.contains(&feature)
    }

    /// Whether `feature` is enabled and refreshed on a timer
    pub fn auto_updates(&self, feature: Feature) -> bool {
        self.has_feature(feature) && self.auto_update.contains(&feature)
    }

    /// Base URL of the REST API
    pub fn base_url(&self) -> String {
        format!("http://{}/api/rest/v1/", self.host)
    }
}

impl RequestSettings {
    pub fn timeouts(&self) -> RequestTimeouts {
        RequestTimeouts {
            lookup: Duration::from_millis(self.lookup_ms),
            connect: Duration::from_millis(self.connect_ms),
            secure_connect: Duration::from_millis(self.secure_connect_ms),
            socket: Duration::from_millis(self.socket_ms),
            send: Duration::from_millis(self.send_ms),
            response: Duration::from_millis(self.response_ms),
        }
    }

    pub fn grace_period(&self) -> Duration {
        Duration::from_millis(self.grace_period_ms)
    }
}

impl BridgeConfig {
    /// Load configuration from file with environment variable overrides
    pub fn load(config_path: Option<&str>) -> Result<Self> {
        let mut config = Self::default();

        // 1. Load from config file if it exists
        if let Some(path) = Self::find_config_file(config_path)? {
            debug!(path = %path.display(), "Loading configuration file");
            let content = fs::read_to_string(&path).map_err(|source| Error::IoRead {
                path: path.clone(),
                source,
            })?;
            config = toml::from_str(&content).map_err(|e| Error::ConfigParse {
                message: format!("{}: {}", path.display(), e.message()),
                source: Some(e),
            })?;
            info!(path = %path.display(), "Configuration loaded from file");
        }

        // 2. Apply environment variable overrides
        config.apply_env_overrides();

        // 3. Expand paths
        config.expand_paths();

        Ok(config)
    }

    /// Find the configuration file to use
    fn find_config_file(explicit_path: Option<&str>) -> Result<Option<PathBuf>> {
        if let Some(path) = explicit_path {
            let path = PathBuf::from(expand_path(path));
            if path.exists() {
                return Ok(Some(path));
            }
            return Err(Error::config_not_found(path));
        }

        let search_paths = [
            PathBuf::from("realityhub-bridge.toml"),
            PathBuf::from("config.toml"),
            dirs::config_dir()
                .map(|p| p.join("realityhub").join("bridge.toml"))
                .unwrap_or_default(),
            dirs::home_dir()
                .map(|p| p.join(".realityhub").join("bridge.toml"))
                .unwrap_or_default(),
            PathBuf::from("/etc/realityhub/bridge.toml"),
        ];

        for path in &search_paths {
            if !path.as_os_str().is_empty() && path.exists() {
                debug!(path = %path.display(), "Found configuration file");
                return Ok(Some(path.clone()));
            }
        }

        debug!("No configuration file found, using defaults");
        Ok(None)
    }

    /// Apply environment variable overrides
    fn apply_env_overrides(&mut self) {
        // Device settings
        if let Ok(val) = std::env::var("REALITYHUB_HOST") {
            self.device.host = val;
        }
        if let Ok(val) = std::env::var("REALITYHUB_FEATURES") {
            self.device.features = parse_feature_list(&val);
        }
        if let Ok(val) = std::env::var("REALITYHUB_AUTO_UPDATE") {
            self.device.auto_update = parse_feature_list(&val);
        }
        if let Ok(val) = std::env::var("REALITYHUB_INTERVAL") {
            if let Ok(interval) = val.parse() {
                self.device.interval = interval;
            }
        }
        if let Ok(val) = std::env::var("REALITYHUB_TEMPLATE_POOL") {
            self.device.template_pool = val;
        }

        // Request settings
        if let Ok(val) = std::env::var("REALITYHUB_RESPONSE_TIMEOUT_MS") {
            if let Ok(n) = val.parse() {
                self.requests.response_ms = n;
            }
        }
        if let Ok(val) = std::env::var("REALITYHUB_CONNECT_TIMEOUT_MS") {
            if let Ok(n) = val.parse() {
                self.requests.connect_ms = n;
            }
        }
        if let Ok(val) = std::env::var("REALITYHUB_GRACE_PERIOD_MS") {
            if let Ok(n) = val.parse() {
                self.requests.grace_period_ms = n;
            }
        }

        // Logging settings
        if let Ok(val) = std::env::var("REALITYHUB_LOG_LEVEL") {
            self.logging.level = val;
        }
        if let Ok(val) = std::env::var("REALITYHUB_LOG_FILE") {
            self.logging.file = Some(val);
        }
        if let Ok(val) = std::env::var("REALITYHUB_LOG_JSON") {
            self.logging.json_format = val.to_lowercase() == "true" || val == "1";
        }
    }

    /// Expand ~ and other path variables
    fn expand_paths(&mut self) {
        if let Some(ref file) = self.logging.file {
            self.logging.file = Some(expand_path(file));
        }
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        validate_host(&self.device.host)?;

        if let Some(feature) = self
            .device
            .auto_update
            .iter()
            .find(|f| !self.device.features.contains(f))
        {
            return Err(Error::config_field_invalid(
                "device.auto_update",
                format!("'{}' is auto-updated but not listed in device.features", feature),
            ));
        }

        if self.device.has_feature(Feature::Templates) && self.device.template_pool.trim().is_empty() {
            return Err(Error::config_field_invalid(
                "device.template_pool",
                "a template pool rundown name is required when the templates feature is enabled",
            ));
        }

        let timeouts = [
            ("requests.lookup_ms", self.requests.lookup_ms),
            ("requests.connect_ms", self.requests.connect_ms),
            ("requests.secure_connect_ms", self.requests.secure_connect_ms),
            ("requests.socket_ms", self.requests.socket_ms),
            ("requests.send_ms", self.requests.send_ms),
            ("requests.response_ms", self.requests.response_ms),
        ];
        if let Some((field, _)) = timeouts.iter().find(|(_, ms)| *ms == 0) {
            return Err(Error::config_field_invalid(*field, "timeout must be greater than 0"));
        }

        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.logging.level.to_lowercase().as_str()) {
            return Err(Error::config_field_invalid(
                "logging.level",
                format!(
                    "invalid log level '{}'. Must be one of: {}",
                    self.logging.level,
                    valid_levels.join(", ")
                ),
            ));
        }

        Ok(())
    }
}

/// Check that `host` is an IPv4 address with an optional port
fn validate_host(host: &str) -> Result<()> {
    if host.trim().is_empty() {
        return Err(Error::config_field_invalid(
            "device.host",
            "host cannot be empty",
        ));
    }

    let (addr, port) = match host.split_once(':') {
        Some((addr, port)) => (addr, Some(port)),
        None => (host, None),
    };

    if addr.parse::<Ipv4Addr>().is_err() {
        return Err(Error::config_field_invalid(
            "device.host",
            format!("'{}' is not an IPv4 address", addr),
        ));
    }

    if let Some(port) = port {
        match port.parse::<u16>() {
            Ok(p) if p > 0 => {}
            _ => {
                return Err(Error::config_field_invalid(
                    "device.host",
                    format!("'{}' is not a valid port", port),
                ))
            }
        }
    }

    Ok(())
}

/// Parse a comma separated feature list, ignoring unknown entries
fn parse_feature_list(value: &str) -> Vec<Feature> {
    let mut features = Vec::new();
    for feature in value.split(',').filter_map(|s| s.parse::<Feature>().ok()) {
        if !features.contains(&feature) {
            features.push(feature);
        }
    }
    features
}

/// Expand ~ and environment variables in paths
fn expand_path(path: &str) -> String {
    shellexpand::full(path)
        .unwrap_or(std::borrow::Cow::Borrowed(path))
        .into_owned()
}

/// Initialize a new configuration file
pub fn init_config(path: Option<&str>, force: bool) -> Result<PathBuf> {
    let config_path = path
        .map(|p| PathBuf::from(expand_path(p)))
        .unwrap_or_else(|| {
            dirs::home_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join(".realityhub")
                .join("bridge.toml")
        });

    if config_path.exists() && !force {
        return Err(Error::Config(format!(
            "Configuration file already exists: {}. Use --force to overwrite.",
            config_path.display()
        )));
    }

    if let Some(parent) = config_path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent).map_err(|source| Error::IoWrite {
                path: parent.to_path_buf(),
                source,
            })?;
        }
    }

    fs::write(&config_path, generate_default_config()).map_err(|source| Error::IoWrite {
        path: config_path.clone(),
        source,
    })?;

    Ok(config_path)
}

/// Generate default configuration content with comments
pub fn generate_default_config() -> String {
    r#"# RealityHub Bridge Configuration

[device]
# RealityHub server address (IPv4, optionally with :port)
host = "127.0.0.1"

# Additional data to load besides engines: nodes, rundowns, templates
features = []

# Features refreshed periodically once connected (must also be in features)
auto_update = []

# Auto-update interval: short (1s), medium (10s), long (60s)
interval = "short"

# Rundown holding the templates (templates feature only)
template_pool = "CompanionTemplatesPool"

[requests]
# Per-phase request timeouts in milliseconds
lookup_ms = 1000
connect_ms = 1000
secure_connect_ms = 1000
socket_ms = 1000
send_ms = 1000
response_ms = 1000

# Delay between pausing the request queue and clearing it after an error
grace_period_ms = 500

[logging]
# Log level: trace, debug, info, warn, error
level = "info"

# Log file path (comment out to disable file logging)
# file = "~/.realityhub/logs/bridge.log"

# Maximum log file size in MB before rotation
max_file_size_mb = 100

# Number of rotated log files to keep
max_files = 5

# Enable JSON formatted logging
json_format = false
"#
    .to_string()
}
