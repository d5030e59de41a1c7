//! Plugin registry and dependency resolver.
//!
//! Built once from configuration. Disabled plugins are left out of the
//! graph entirely, so depending on one is an unknown dependency. The
//! resolved order never changes for the lifetime of the registry.

use netfang_common::{ConfigError, NetfangConfig, PluginCategory};
use serde_json::{Map, Value};
use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;
use tracing::{debug, info};

#[derive(Debug, Clone, PartialEq)]
pub struct PluginDescriptor {
    pub name: String,
    pub enabled: bool,
    pub dependencies: Vec<String>,
    pub config: Map<String, Value>,
    pub category: PluginCategory,
    pub timeout: Duration,
    pub retry_on_timeout: bool,
}

impl PluginDescriptor {
    pub fn new(name: impl Into<String>, category: PluginCategory) -> Self {
        Self {
            name: name.into(),
            enabled: true,
            dependencies: Vec::new(),
            config: Map::new(),
            category,
            timeout: Duration::from_secs(30),
            retry_on_timeout: true,
        }
    }

    pub fn depends_on(mut self, deps: &[&str]) -> Self {
        self.dependencies = deps.iter().map(|d| d.to_string()).collect();
        self
    }

    pub fn disabled(mut self) -> Self {
        self.enabled = false;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_config(mut self, config: Map<String, Value>) -> Self {
        self.config = config;
        self
    }
}

#[derive(Debug, Clone)]
pub struct PluginRegistry {
    descriptors: BTreeMap<String, PluginDescriptor>,
    order: Vec<String>,
}

impl PluginRegistry {
    pub fn from_config(config: &NetfangConfig) -> Result<Self, ConfigError> {
        let descriptors = config
            .plugin_entries()
            .into_iter()
            .map(|(name, category, entry)| PluginDescriptor {
                enabled: entry.is_enabled(category),
                dependencies: entry.dependencies,
                config: entry.plugin_config,
                category,
                timeout: Duration::from_secs(entry.timeout_secs),
                retry_on_timeout: entry.retry_on_timeout,
                name,
            })
            .collect();
        Self::from_descriptors(descriptors)
    }

    pub fn from_descriptors(descriptors: Vec<PluginDescriptor>) -> Result<Self, ConfigError> {
        let mut by_name = BTreeMap::new();
        for mut descriptor in descriptors {
            // Repeated dependency names add nothing to the graph
            let mut seen = BTreeSet::new();
            descriptor.dependencies.retain(|d| seen.insert(d.clone()));

            let name = descriptor.name.clone();
            if by_name.insert(name.clone(), descriptor).is_some() {
                return Err(ConfigError::DuplicatePlugin(name));
            }
        }

        let order = resolve(&by_name)?;
        let disabled = by_name.len() - order.len();
        info!(
            "[DISPATCH] Plugin order: [{}] ({} disabled)",
            order.join(", "),
            disabled
        );

        Ok(Self {
            descriptors: by_name,
            order,
        })
    }

    /// Enabled plugin names, every plugin after all of its dependencies
    pub fn order(&self) -> &[String] {
        &self.order
    }

    pub fn descriptor(&self, name: &str) -> Option<&PluginDescriptor> {
        self.descriptors.get(name)
    }

    /// Enabled descriptors in dispatch order
    pub fn enabled(&self) -> impl Iterator<Item = &PluginDescriptor> {
        self.order.iter().filter_map(|name| self.descriptors.get(name))
    }

    pub fn all(&self) -> impl Iterator<Item = &PluginDescriptor> {
        self.descriptors.values()
    }
}

/// Topological sort of the enabled plugins, ties broken by ascending name
fn resolve(descriptors: &BTreeMap<String, PluginDescriptor>) -> Result<Vec<String>, ConfigError> {
    let enabled: BTreeMap<&str, &PluginDescriptor> = descriptors
        .iter()
        .filter(|(_, d)| d.enabled)
        .map(|(name, d)| (name.as_str(), d))
        .collect();

    for (name, descriptor) in &enabled {
        for dep in &descriptor.dependencies {
            if !enabled.contains_key(dep.as_str()) {
                return Err(ConfigError::UnknownDependency {
                    plugin: name.to_string(),
                    dependency: dep.clone(),
                });
            }
        }
    }

    // remaining[n] = dependencies of n not yet placed
    let mut remaining: BTreeMap<&str, BTreeSet<&str>> = enabled
        .iter()
        .map(|(name, d)| (*name, d.dependencies.iter().map(String::as_str).collect()))
        .collect();
    let mut dependents: BTreeMap<&str, Vec<&str>> = BTreeMap::new();
    for (name, deps) in &remaining {
        for dep in deps {
            dependents.entry(*dep).or_default().push(*name);
        }
    }

    let mut ready: BTreeSet<&str> = remaining
        .iter()
        .filter(|(_, deps)| deps.is_empty())
        .map(|(name, _)| *name)
        .collect();
    let mut order = Vec::with_capacity(enabled.len());

    while let Some(next) = ready.pop_first() {
        remaining.remove(next);
        order.push(next.to_string());
        for dependent in dependents.get(next).into_iter().flatten() {
            if let Some(deps) = remaining.get_mut(dependent) {
                deps.remove(next);
                if deps.is_empty() {
                    ready.insert(*dependent);
                }
            }
        }
    }

    if remaining.is_empty() {
        Ok(order)
    } else {
        let member = cycle_member(&remaining);
        debug!("[DISPATCH] Unresolvable plugins: {:?}", remaining.keys());
        Err(ConfigError::DependencyCycle { member })
    }
}

/// Every leftover node still waits on another leftover node, so walking
/// unplaced dependencies must eventually revisit a node on a cycle.
fn cycle_member(remaining: &BTreeMap<&str, BTreeSet<&str>>) -> String {
    let Some(mut current) = remaining.keys().next().copied() else {
        return String::new();
    };
    let mut path: Vec<&str> = Vec::new();
    loop {
        if let Some(pos) = path.iter().position(|n| *n == current) {
            return path[pos..]
                .iter()
                .min()
                .map(|n| n.to_string())
                .unwrap_or_default();
        }
        path.push(current);
        match remaining.get(current).and_then(|deps| deps.iter().next()) {
            Some(dep) => current = *dep,
            None => return current.to_string(),
        }
    }
}
