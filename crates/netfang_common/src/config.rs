//! Configuration management for netfangd.
//!
//! Loads settings from /etc/netfang/config.toml or uses defaults. The file is
//! read once at startup; changing plugins or network flows needs a restart.

use crate::error::ConfigError;
use crate::fingerprint::Classification;
use crate::mac::MacAddress;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

/// Config file path
pub const CONFIG_PATH: &str = "/etc/netfang/config.toml";

/// Default database location
pub const DEFAULT_DATABASE_PATH: &str = "/var/lib/netfang/netfang.db";

/// Prefix for plugin_config values pulled from the environment
const ENV_PREFIX: &str = "env:";

/// Network classification settings
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NetworkFlowsConfig {
    /// Gateway MAC of the home network
    #[serde(default)]
    pub home_network_mac: Option<MacAddress>,

    #[serde(default)]
    pub blacklisted_macs: BTreeSet<MacAddress>,

    #[serde(default)]
    pub auto_scan_new_network: bool,

    #[serde(default)]
    pub auto_scan_known_network: bool,

    /// Promote a New network to Known once its first scan completes
    #[serde(default)]
    pub mark_known_after_scan: bool,

    #[serde(default = "default_monitored_interfaces")]
    pub monitored_interfaces: Vec<String>,

    /// Command run by the `restartNetwork` admin action
    #[serde(default)]
    pub restart_command: Vec<String>,
}

fn default_monitored_interfaces() -> Vec<String> {
    vec!["eth0".to_string()]
}

impl NetworkFlowsConfig {
    /// Whether entering a network of this classification starts a scan.
    /// Home and blacklisted networks never auto-scan.
    pub fn auto_scan_for(&self, classification: Classification) -> bool {
        match classification {
            Classification::New => self.auto_scan_new_network,
            Classification::Known => self.auto_scan_known_network,
            Classification::Home | Classification::Blacklisted => false,
        }
    }
}

/// Alert bus settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AlertsConfig {
    /// Alerts kept in memory before the oldest is evicted
    #[serde(default = "default_history_size")]
    pub history_size: usize,

    /// Append every alert to the database audit log
    #[serde(default = "default_true")]
    pub persist: bool,

    /// Buffer per dashboard subscriber
    #[serde(default = "default_subscriber_buffer")]
    pub subscriber_buffer: usize,
}

fn default_history_size() -> usize {
    200
}

fn default_subscriber_buffer() -> usize {
    1024
}

fn default_true() -> bool {
    true
}

impl Default for AlertsConfig {
    fn default() -> Self {
        Self {
            history_size: default_history_size(),
            persist: default_true(),
            subscriber_buffer: default_subscriber_buffer(),
        }
    }
}

/// Process supervisor settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SupervisorConfig {
    /// Output lines retained per process
    #[serde(default = "default_output_buffer_lines")]
    pub output_buffer_lines: usize,

    /// Capacity of the per-process output channel and the completion channel
    #[serde(default = "default_channel_capacity")]
    pub channel_capacity: usize,

    /// How long a cancel waits for the killed process to be reaped
    #[serde(default = "default_cancel_grace_ms")]
    pub cancel_grace_ms: u64,
}

fn default_output_buffer_lines() -> usize {
    500
}

fn default_channel_capacity() -> usize {
    256
}

fn default_cancel_grace_ms() -> u64 {
    2_000
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            output_buffer_lines: default_output_buffer_lines(),
            channel_capacity: default_channel_capacity(),
            cancel_grace_ms: default_cancel_grace_ms(),
        }
    }
}

/// Which configuration group a plugin was declared in
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PluginCategory {
    Default,
    Optional,
}

/// One `[default_plugins.<name>]` / `[optional_plugins.<name>]` entry
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PluginEntry {
    /// Defaults to true for default plugins and false for optional ones
    #[serde(default)]
    pub enabled: Option<bool>,

    #[serde(default)]
    pub dependencies: Vec<String>,

    /// Per-hook time box
    #[serde(default = "default_plugin_timeout")]
    pub timeout_secs: u64,

    /// Retry a timed-out hook once
    #[serde(default = "default_true")]
    pub retry_on_timeout: bool,

    #[serde(default)]
    pub plugin_config: serde_json::Map<String, Value>,
}

fn default_plugin_timeout() -> u64 {
    30
}

impl Default for PluginEntry {
    fn default() -> Self {
        Self {
            enabled: None,
            dependencies: Vec::new(),
            timeout_secs: default_plugin_timeout(),
            retry_on_timeout: default_true(),
            plugin_config: serde_json::Map::new(),
        }
    }
}

impl PluginEntry {
    pub fn is_enabled(&self, category: PluginCategory) -> bool {
        self.enabled
            .unwrap_or(category == PluginCategory::Default)
    }
}

/// Top-level daemon configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetfangConfig {
    #[serde(default = "default_database_path")]
    pub database_path: PathBuf,

    #[serde(default = "default_log_level")]
    pub log_level: String,

    #[serde(default)]
    pub network_flows: NetworkFlowsConfig,

    #[serde(default)]
    pub alerts: AlertsConfig,

    #[serde(default)]
    pub supervisor: SupervisorConfig,

    #[serde(default)]
    pub default_plugins: BTreeMap<String, PluginEntry>,

    #[serde(default)]
    pub optional_plugins: BTreeMap<String, PluginEntry>,
}

fn default_database_path() -> PathBuf {
    PathBuf::from(DEFAULT_DATABASE_PATH)
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for NetfangConfig {
    fn default() -> Self {
        Self {
            database_path: default_database_path(),
            log_level: default_log_level(),
            network_flows: NetworkFlowsConfig::default(),
            alerts: AlertsConfig::default(),
            supervisor: SupervisorConfig::default(),
            default_plugins: BTreeMap::new(),
            optional_plugins: BTreeMap::new(),
        }
    }
}

impl NetfangConfig {
    /// Load and validate config from a specific path
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let config = Self::from_toml_str(&content)?;
        info!("[CONFIG] Loaded config from {}", path.display());
        Ok(config)
    }

    /// Load config, falling back to defaults only when the file is missing.
    /// A file that exists but fails to parse or validate is still an error.
    pub fn load_or_default(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            warn!("[CONFIG] {} not found, using defaults", path.display());
            return Ok(Self::default());
        }
        Self::load(path)
    }

    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let raw: NetfangConfig = toml::from_str(content)?;
        raw.normalized()
    }

    /// Lower-case plugin names, expand `env:` values, and check invariants
    fn normalized(mut self) -> Result<Self, ConfigError> {
        self.default_plugins = normalize_group(std::mem::take(&mut self.default_plugins))?;
        self.optional_plugins = normalize_group(std::mem::take(&mut self.optional_plugins))?;

        if let Some(dup) = self
            .default_plugins
            .keys()
            .find(|name| self.optional_plugins.contains_key(*name))
        {
            return Err(ConfigError::DuplicatePlugin(dup.clone()));
        }

        if let Some(home) = &self.network_flows.home_network_mac {
            if self.network_flows.blacklisted_macs.contains(home) {
                return Err(ConfigError::Invalid(format!(
                    "home network MAC {} is also blacklisted",
                    home
                )));
            }
        }

        if self.alerts.history_size == 0 {
            return Err(ConfigError::Invalid("alerts.history_size must be > 0".into()));
        }
        if self.alerts.subscriber_buffer == 0 {
            return Err(ConfigError::Invalid("alerts.subscriber_buffer must be > 0".into()));
        }
        if self.supervisor.channel_capacity == 0 || self.supervisor.output_buffer_lines == 0 {
            return Err(ConfigError::Invalid(
                "supervisor buffers must hold at least one entry".into(),
            ));
        }

        for (name, entry) in self.plugins() {
            if entry.timeout_secs == 0 {
                return Err(ConfigError::Invalid(format!(
                    "plugin '{}' has a zero timeout",
                    name
                )));
            }
        }

        Ok(self)
    }

    /// All plugin entries with their group, default group first
    pub fn plugins(&self) -> impl Iterator<Item = (&String, &PluginEntry)> {
        self.default_plugins
            .iter()
            .chain(self.optional_plugins.iter())
    }

    /// Plugin entries tagged with their category
    pub fn plugin_entries(&self) -> Vec<(String, PluginCategory, PluginEntry)> {
        let defaults = self
            .default_plugins
            .iter()
            .map(|(n, e)| (n.clone(), PluginCategory::Default, e.clone()));
        let optional = self
            .optional_plugins
            .iter()
            .map(|(n, e)| (n.clone(), PluginCategory::Optional, e.clone()));
        defaults.chain(optional).collect()
    }
}

fn normalize_group(
    group: BTreeMap<String, PluginEntry>,
) -> Result<BTreeMap<String, PluginEntry>, ConfigError> {
    let mut out = BTreeMap::new();
    for (name, mut entry) in group {
        let key = name.trim().to_ascii_lowercase();
        if key.is_empty() {
            return Err(ConfigError::Invalid("plugin name must not be empty".into()));
        }
        entry.dependencies = entry
            .dependencies
            .iter()
            .map(|d| d.trim().to_ascii_lowercase())
            .collect();
        entry.plugin_config = entry
            .plugin_config
            .into_iter()
            .map(|(k, v)| (k, expand_env(v)))
            .collect();
        if out.insert(key.clone(), entry).is_some() {
            return Err(ConfigError::DuplicatePlugin(key));
        }
    }
    Ok(out)
}

/// Replace `"env:VAR"` strings with the variable's value (empty if unset)
fn expand_env(value: Value) -> Value {
    match value {
        Value::String(s) => match s.strip_prefix(ENV_PREFIX) {
            Some(var) => Value::String(std::env::var(var).unwrap_or_default()),
            None => Value::String(s),
        },
        Value::Array(items) => Value::Array(items.into_iter().map(expand_env).collect()),
        Value::Object(map) => Value::Object(map.into_iter().map(|(k, v)| (k, expand_env(v))).collect()),
        other => other,
    }
}
