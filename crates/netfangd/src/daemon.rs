//! Daemon event loop
//!
//! A single task owns the state machine. Link events and admin actions
//! arrive over a control channel, process completions over the supervisor's
//! channel; both are applied one at a time.

use chrono::Utc;
use netfang_common::{ConfigError, FingerprintStore, MacAddress, NetfangConfig};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{interval, Duration, MissedTickBehavior};
use tracing::{debug, info};

use crate::alert_bus::{AlertBus, Subscription};
use crate::builtin::command_plugins;
use crate::dispatcher::PluginDispatcher;
use crate::error::AdminError;
use crate::plugin::Plugin;
use crate::registry::PluginRegistry;
use crate::state::{
    AdminAction, AdminRequest, AdminResponse, LinkEvent, MachineSnapshot, StateMachine,
};
use crate::supervisor::{ProcessSupervisor, SupervisorEvent};

/// Pending control messages before senders wait
const CONTROL_QUEUE: usize = 64;

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("daemon is not running")]
pub struct DaemonGone;

/// One line of the stdin control feed
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ControlMessage {
    LinkUp {
        gateway_mac: MacAddress,
        #[serde(default)]
        ssid: Option<String>,
        #[serde(default)]
        interface: Option<String>,
    },
    LinkDown,
    Admin(AdminRequest),
}

enum Control {
    Link(LinkEvent, oneshot::Sender<()>),
    Admin(AdminAction, oneshot::Sender<Result<AdminResponse, AdminError>>),
    Snapshot(oneshot::Sender<MachineSnapshot>),
}

pub struct Daemon {
    machine: StateMachine,
    control: mpsc::Receiver<Control>,
    events: mpsc::Receiver<SupervisorEvent>,
    supervisor: ProcessSupervisor,
    bus: AlertBus,
}

/// Clonable front door to a running daemon
#[derive(Clone)]
pub struct DaemonHandle {
    control: mpsc::Sender<Control>,
    bus: AlertBus,
}

impl Daemon {
    /// Wire every component from `config`. `plugins` are programmatic
    /// implementations; descriptors with a `command` get a command plugin.
    pub fn new(
        config: &NetfangConfig,
        store: FingerprintStore,
        mut plugins: Vec<Arc<dyn Plugin>>,
    ) -> Result<(Self, DaemonHandle), ConfigError> {
        let registry = Arc::new(PluginRegistry::from_config(config)?);

        let alerts = &config.alerts;
        let bus = if alerts.persist {
            AlertBus::with_audit(alerts.history_size, alerts.subscriber_buffer, store.clone())
        } else {
            AlertBus::new(alerts.history_size, alerts.subscriber_buffer)
        };

        let (supervisor, events) =
            ProcessSupervisor::new(config.supervisor.clone(), bus.clone(), Some(store.clone()));

        plugins.extend(command_plugins(&registry)?);
        let dispatcher =
            PluginDispatcher::new(registry, plugins, supervisor.clone(), bus.clone())?;

        let machine = StateMachine::new(
            config.network_flows.clone(),
            store,
            bus.clone(),
            dispatcher,
            supervisor.clone(),
        );

        let (tx, rx) = mpsc::channel(CONTROL_QUEUE);
        let daemon = Self {
            machine,
            control: rx,
            events,
            supervisor,
            bus: bus.clone(),
        };
        Ok((daemon, DaemonHandle { control: tx, bus }))
    }

    pub fn supervisor(&self) -> ProcessSupervisor {
        self.supervisor.clone()
    }

    /// Process events until every handle is dropped, then cancel all processes
    pub async fn run(mut self) {
        info!("[STATE] NetFang daemon running");
        let mut sweep = interval(Duration::from_secs(1));
        sweep.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                control = self.control.recv() => match control {
                    Some(control) => self.apply(control).await,
                    None => break,
                },
                Some(event) = self.events.recv() => {
                    self.machine.handle_supervisor_event(event).await;
                }
                _ = sweep.tick() => {
                    let resolved = self.bus.sweep_expired(Utc::now());
                    if resolved > 0 {
                        debug!("[BUS] Auto-dismissed {} alert(s)", resolved);
                    }
                }
            }
        }

        info!("[STATE] Control channel closed, stopping");
        self.supervisor.shutdown().await;
    }

    async fn apply(&mut self, control: Control) {
        match control {
            Control::Link(event, done) => {
                self.machine.handle_link_event(event).await;
                let _ = done.send(());
            }
            Control::Admin(action, reply) => {
                let result = self.machine.handle_admin(action).await;
                let _ = reply.send(result);
            }
            Control::Snapshot(reply) => {
                let _ = reply.send(self.machine.snapshot());
            }
        }
    }
}

impl DaemonHandle {
    /// Deliver a link observation and wait until it has been applied
    pub async fn link_event(&self, event: LinkEvent) -> Result<(), DaemonGone> {
        let (tx, rx) = oneshot::channel();
        self.control
            .send(Control::Link(event, tx))
            .await
            .map_err(|_| DaemonGone)?;
        rx.await.map_err(|_| DaemonGone)
    }

    pub async fn admin(&self, request: AdminRequest) -> Result<AdminResponse, AdminError> {
        let action = request.parse()?;
        self.admin_action(action).await
    }

    pub async fn admin_action(&self, action: AdminAction) -> Result<AdminResponse, AdminError> {
        let (tx, rx) = oneshot::channel();
        self.control
            .send(Control::Admin(action, tx))
            .await
            .map_err(|_| AdminError::DaemonGone)?;
        rx.await.map_err(|_| AdminError::DaemonGone)?
    }

    pub async fn snapshot(&self) -> Result<MachineSnapshot, DaemonGone> {
        let (tx, rx) = oneshot::channel();
        self.control
            .send(Control::Snapshot(tx))
            .await
            .map_err(|_| DaemonGone)?;
        rx.await.map_err(|_| DaemonGone)
    }

    /// Alert backlog, current state and the live event stream
    pub fn subscribe(&self) -> Subscription {
        self.bus.subscribe()
    }

    pub fn bus(&self) -> &AlertBus {
        &self.bus
    }

    /// Apply one control-feed message. Admin messages return their reply.
    pub async fn submit(
        &self,
        message: ControlMessage,
    ) -> Result<Option<AdminResponse>, AdminError> {
        match message {
            ControlMessage::LinkUp {
                gateway_mac,
                ssid,
                interface,
            } => {
                let event = LinkEvent::LinkUp {
                    gateway_mac,
                    ssid,
                    interface,
                };
                self.link_event(event)
                    .await
                    .map_err(|_| AdminError::DaemonGone)?;
                Ok(None)
            }
            ControlMessage::LinkDown => {
                self.link_event(LinkEvent::LinkDown)
                    .await
                    .map_err(|_| AdminError::DaemonGone)?;
                Ok(None)
            }
            ControlMessage::Admin(request) => self.admin(request).await.map(Some),
        }
    }
}
