//! Generic command plugin built from a descriptor's `plugin_config`.
//!
//! ```toml
//! [default_plugins.arpscan.plugin_config]
//! hook = "on_scan_start"
//! command = "arp-scan"
//! args = ["--interface", "eth0", "--localnet"]
//! timeout_secs = 120
//! stream = true
//! requires_path = "/usr/sbin/arp-scan"
//! ```

use async_trait::async_trait;
use netfang_common::ConfigError;
use serde_json::Value;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

use crate::error::PluginError;
use crate::plugin::{Hook, HookContext, HookReply, Plugin, Precondition};
use crate::registry::{PluginDescriptor, PluginRegistry};
use crate::supervisor::ScanRequest;

#[derive(Debug, Clone)]
pub struct CommandPlugin {
    name: String,
    hook: Hook,
    command: String,
    args: Vec<String>,
    timeout: Option<Duration>,
    stream: bool,
    requires_path: Option<PathBuf>,
}

impl CommandPlugin {
    /// None when the descriptor has no `command`
    pub fn from_descriptor(descriptor: &PluginDescriptor) -> Result<Option<Self>, ConfigError> {
        let config = &descriptor.config;
        let command = match config.get("command") {
            None => return Ok(None),
            Some(Value::String(c)) if !c.trim().is_empty() => c.clone(),
            Some(_) => return Err(invalid(&descriptor.name, "command must be a non-empty string")),
        };

        let hook = match config.get("hook") {
            None => Hook::OnScanStart,
            Some(Value::String(h)) => {
                Hook::parse(h).ok_or_else(|| invalid(&descriptor.name, &format!("unknown hook '{}'", h)))?
            }
            Some(_) => return Err(invalid(&descriptor.name, "hook must be a string")),
        };

        let args = match config.get("args") {
            None => Vec::new(),
            Some(Value::Array(items)) => items
                .iter()
                .map(|v| match v {
                    Value::String(s) => Ok(s.clone()),
                    Value::Number(n) => Ok(n.to_string()),
                    _ => Err(invalid(&descriptor.name, "args must be strings")),
                })
                .collect::<Result<Vec<_>, _>>()?,
            Some(_) => return Err(invalid(&descriptor.name, "args must be a list")),
        };

        let timeout = match config.get("timeout_secs") {
            None => None,
            Some(v) => match v.as_u64() {
                Some(secs) if secs > 0 => Some(Duration::from_secs(secs)),
                _ => return Err(invalid(&descriptor.name, "timeout_secs must be a positive integer")),
            },
        };

        let stream = config.get("stream").and_then(Value::as_bool).unwrap_or(true);
        let requires_path = config
            .get("requires_path")
            .and_then(Value::as_str)
            .map(PathBuf::from);

        Ok(Some(Self {
            name: descriptor.name.clone(),
            hook,
            command,
            args,
            timeout,
            stream,
            requires_path,
        }))
    }

    /// Substitute `{mac}` and `{ssid}` from the active fingerprint
    fn render_args(&self, ctx: &HookContext) -> Vec<String> {
        let mac = ctx
            .fingerprint
            .as_ref()
            .map(|fp| fp.mac.to_string())
            .unwrap_or_default();
        let ssid = ctx
            .fingerprint
            .as_ref()
            .and_then(|fp| fp.ssid.clone())
            .unwrap_or_default();
        self.args
            .iter()
            .chain(ctx.args.iter())
            .map(|a| a.replace("{mac}", &mac).replace("{ssid}", &ssid))
            .collect()
    }
}

fn invalid(plugin: &str, reason: &str) -> ConfigError {
    ConfigError::Invalid(format!("plugin '{}': {}", plugin, reason))
}

#[async_trait]
impl Plugin for CommandPlugin {
    fn name(&self) -> &str {
        &self.name
    }

    fn handles(&self, hook: Hook) -> bool {
        hook == self.hook || hook == Hook::OnActionRequested
    }

    fn precondition(&self) -> Precondition {
        match &self.requires_path {
            Some(path) if !path.exists() => {
                Precondition::Unavailable(format!("{} not present", path.display()))
            }
            _ => Precondition::Ready,
        }
    }

    async fn on_hook(&self, hook: Hook, ctx: &HookContext) -> Result<HookReply, PluginError> {
        if ctx.fingerprint.is_none() {
            return Ok(HookReply::Nothing);
        }
        debug!("[DISPATCH] {} requests '{}' for {}", self.name, self.command, hook);
        let mut request = ScanRequest::new(self.command.clone(), self.render_args(ctx));
        request.timeout = self.timeout;
        request.stream_output = self.stream;
        Ok(HookReply::Spawn(request))
    }
}

/// Command plugins for every registry descriptor that names a command
pub fn command_plugins(registry: &PluginRegistry) -> Result<Vec<Arc<dyn Plugin>>, ConfigError> {
    let mut plugins: Vec<Arc<dyn Plugin>> = Vec::new();
    for descriptor in registry.all() {
        if let Some(plugin) = CommandPlugin::from_descriptor(descriptor)? {
            plugins.push(Arc::new(plugin));
        }
    }
    Ok(plugins)
}
