//! Plugin Dispatcher - invokes one hook on every plugin in resolved order.
//!
//! Each call runs on its own task under the plugin's timeout, so a hung or
//! panicking plugin only fails its own outcome. Spawn replies are handed to
//! the process supervisor against the context's fingerprint.

use netfang_common::ConfigError;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

use crate::alert_bus::AlertBus;
use crate::error::{PluginError, SupervisorError};
use crate::plugin::{Hook, HookContext, HookReply, Plugin, Precondition};
use crate::registry::{PluginDescriptor, PluginRegistry};
use crate::supervisor::{ProcessId, ProcessSupervisor, ScanRequest};

#[derive(Debug, Clone, PartialEq)]
pub enum OutcomeKind {
    /// Inline reply (`Nothing`, `Merge` or `MarkKnown`)
    Completed(HookReply),
    /// The requested process is running
    Spawned(ProcessId),
    /// The supervisor refused the requested process
    SpawnRejected(SupervisorError),
    /// Runtime precondition not met
    Skipped(String),
    /// The plugin does not handle this hook
    NotImplemented,
    Failed(PluginError),
}

#[derive(Debug, Clone, PartialEq)]
pub struct PluginOutcome {
    pub plugin: String,
    pub kind: OutcomeKind,
    pub attempts: u32,
    pub elapsed: Duration,
}

impl PluginOutcome {
    pub fn failed(&self) -> bool {
        matches!(self.kind, OutcomeKind::Failed(_))
    }
}

pub struct PluginDispatcher {
    registry: Arc<PluginRegistry>,
    plugins: HashMap<String, Arc<dyn Plugin>>,
    supervisor: ProcessSupervisor,
    bus: AlertBus,
}

impl PluginDispatcher {
    /// Bind implementations to the registry. Every enabled descriptor needs one.
    pub fn new(
        registry: Arc<PluginRegistry>,
        plugins: Vec<Arc<dyn Plugin>>,
        supervisor: ProcessSupervisor,
        bus: AlertBus,
    ) -> Result<Self, ConfigError> {
        let mut by_name: HashMap<String, Arc<dyn Plugin>> = HashMap::new();
        for plugin in plugins {
            let name = plugin.name().to_ascii_lowercase();
            if registry.descriptor(&name).is_none() {
                debug!("[DISPATCH] Ignoring undeclared plugin '{}'", name);
                continue;
            }
            if by_name.insert(name.clone(), plugin).is_some() {
                return Err(ConfigError::DuplicatePlugin(name));
            }
        }

        if let Some(missing) = registry.order().iter().find(|n| !by_name.contains_key(*n)) {
            return Err(ConfigError::MissingImplementation(missing.clone()));
        }

        Ok(Self {
            registry,
            plugins: by_name,
            supervisor,
            bus,
        })
    }

    pub fn order(&self) -> &[String] {
        self.registry.order()
    }

    pub fn registry(&self) -> &PluginRegistry {
        &self.registry
    }

    /// Run `hook` on every enabled plugin, in order.
    ///
    /// Results merged by one plugin are visible in the payload of the next.
    pub async fn dispatch(&self, hook: Hook, mut ctx: HookContext) -> Vec<PluginOutcome> {
        let mut outcomes = Vec::with_capacity(self.registry.order().len());
        for name in self.registry.order() {
            let Some(outcome) = self.invoke(name, hook, &ctx).await else {
                continue;
            };
            if let OutcomeKind::Completed(HookReply::Merge(results)) = &outcome.kind {
                for (key, value) in results {
                    ctx.payload.insert(key.clone(), value.clone());
                }
            }
            outcomes.push(outcome);
        }

        let failed = outcomes.iter().filter(|o| o.failed()).count();
        debug!(
            "[DISPATCH] {} dispatched to {} plugin(s), {} failed",
            hook,
            outcomes.len(),
            failed
        );
        outcomes
    }

    /// Run `hook` on a single named plugin. None if it is unknown or disabled.
    pub async fn dispatch_to(
        &self,
        plugin: &str,
        hook: Hook,
        ctx: HookContext,
    ) -> Option<PluginOutcome> {
        self.invoke(&plugin.to_ascii_lowercase(), hook, &ctx).await
    }

    async fn invoke(&self, name: &str, hook: Hook, ctx: &HookContext) -> Option<PluginOutcome> {
        let descriptor = self.registry.descriptor(name).filter(|d| d.enabled)?;
        let plugin = self.plugins.get(name)?.clone();
        let started = Instant::now();

        let outcome = |kind: OutcomeKind, attempts: u32| PluginOutcome {
            plugin: name.to_string(),
            kind,
            attempts,
            elapsed: started.elapsed(),
        };

        if !plugin.handles(hook) {
            return Some(outcome(OutcomeKind::NotImplemented, 0));
        }
        if let Precondition::Unavailable(reason) = plugin.precondition() {
            info!("[DISPATCH] Skipping {} for {}: {}", hook, name, reason);
            return Some(outcome(OutcomeKind::Skipped(reason), 0));
        }

        let (result, attempts) = self.call_with_retry(descriptor, plugin, hook, ctx).await;
        let kind = match result {
            Ok(HookReply::Spawn(request)) => self.spawn(name, ctx, request),
            Ok(reply) => OutcomeKind::Completed(reply),
            Err(e) => {
                error!("[DISPATCH] {} failed in {}: {}", hook, name, e);
                self.bus
                    .critical(name, format!("Plugin '{}' failed during {}: {}", name, hook, e));
                OutcomeKind::Failed(e)
            }
        };
        Some(outcome(kind, attempts))
    }

    async fn call_with_retry(
        &self,
        descriptor: &PluginDescriptor,
        plugin: Arc<dyn Plugin>,
        hook: Hook,
        ctx: &HookContext,
    ) -> (Result<HookReply, PluginError>, u32) {
        let max_attempts = if descriptor.retry_on_timeout { 2 } else { 1 };
        let mut attempts = 0;
        loop {
            attempts += 1;
            let result = call_once(&descriptor.name, plugin.clone(), hook, ctx, descriptor.timeout).await;
            match result {
                Err(e) if e.is_timeout() && attempts < max_attempts => {
                    warn!("[DISPATCH] {} timed out in {}, retrying once", hook, descriptor.name);
                }
                other => return (other, attempts),
            }
        }
    }

    fn spawn(&self, name: &str, ctx: &HookContext, request: ScanRequest) -> OutcomeKind {
        let Some(fingerprint) = &ctx.fingerprint else {
            let e = PluginError::failed(name, "requested a process with no active network");
            warn!("[DISPATCH] {}", e);
            self.bus.critical(name, e.to_string());
            return OutcomeKind::Failed(e);
        };
        match self.supervisor.start(name, &fingerprint.mac, request) {
            Ok(id) => OutcomeKind::Spawned(id),
            Err(e) => OutcomeKind::SpawnRejected(e),
        }
    }
}

/// One time-boxed hook call on its own task
async fn call_once(
    name: &str,
    plugin: Arc<dyn Plugin>,
    hook: Hook,
    ctx: &HookContext,
    timeout: Duration,
) -> Result<HookReply, PluginError> {
    let ctx = ctx.clone();
    let mut handle = tokio::spawn(async move { plugin.on_hook(hook, &ctx).await });

    match tokio::time::timeout(timeout, &mut handle).await {
        Ok(Ok(result)) => result,
        Ok(Err(join)) if join.is_panic() => Err(PluginError::Panicked {
            plugin: name.to_string(),
        }),
        Ok(Err(join)) => Err(PluginError::failed(name, join.to_string())),
        Err(_) => {
            handle.abort();
            Err(PluginError::Timeout {
                plugin: name.to_string(),
                after: timeout,
            })
        }
    }
}
