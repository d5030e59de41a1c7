//! Network state machine
//!
//! Owns every transition. Link events, supervisor completions and admin
//! actions are applied one at a time through `&mut self`, so the
//! classify → dispatch → persist sequence for a network is never
//! interleaved with another transition.

use chrono::Utc;
use netfang_common::{
    classify, Classification, FingerprintStore, MacAddress, NetworkFingerprint,
    NetworkFlowsConfig,
};
use serde_json::{json, Value};
use std::collections::HashMap;
use tracing::{debug, error, info, warn};

use super::admin::{AdminAction, AdminResponse};
use super::types::{LinkEvent, MachineSnapshot, NetworkState, StateUpdate};
use crate::alert_bus::AlertBus;
use crate::dispatcher::{OutcomeKind, PluginDispatcher, PluginOutcome};
use crate::error::{AdminError, SupervisorError};
use crate::plugin::{Hook, HookContext, HookReply};
use crate::supervisor::{
    ProcessId, ProcessSnapshot, ProcessStatus, ProcessSupervisor, ScanRequest, SupervisorEvent,
};

/// Pseudo-plugin that owns the `restartNetwork` process
pub const NETWORK_PLUGIN: &str = "network";

/// Output lines kept per process in the scan results
const RESULT_TAIL_LINES: usize = 100;

/// Why a process was started
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    /// Spawned from a connect or disconnect hook
    Background,
    Scan,
    Action,
    /// Admin-requested network restart
    Maintenance,
}

pub struct StateMachine {
    flows: NetworkFlowsConfig,
    store: FingerprintStore,
    bus: AlertBus,
    dispatcher: PluginDispatcher,
    supervisor: ProcessSupervisor,
    state: NetworkState,
    active: Option<NetworkFingerprint>,
    /// Network active before the last link-down
    last_network: Option<MacAddress>,
    in_flight: HashMap<ProcessId, Phase>,
    scan_partial: bool,
    halted: Option<String>,
}

impl StateMachine {
    pub fn new(
        flows: NetworkFlowsConfig,
        store: FingerprintStore,
        bus: AlertBus,
        dispatcher: PluginDispatcher,
        supervisor: ProcessSupervisor,
    ) -> Self {
        Self {
            flows,
            store,
            bus,
            dispatcher,
            supervisor,
            state: NetworkState::WaitingForNetwork,
            active: None,
            last_network: None,
            in_flight: HashMap::new(),
            scan_partial: false,
            halted: None,
        }
    }

    pub fn state(&self) -> NetworkState {
        self.state
    }

    pub fn active(&self) -> Option<&NetworkFingerprint> {
        self.active.as_ref()
    }

    pub fn halted(&self) -> Option<&str> {
        self.halted.as_deref()
    }

    pub fn snapshot(&self) -> MachineSnapshot {
        let mut in_flight: Vec<ProcessId> = self.in_flight.keys().copied().collect();
        in_flight.sort_unstable();
        MachineSnapshot {
            state: self.state,
            fingerprint: self.active.clone(),
            in_flight,
            halted: self.halted.clone(),
        }
    }

    pub async fn handle_link_event(&mut self, event: LinkEvent) {
        match event {
            LinkEvent::LinkUp {
                gateway_mac,
                ssid,
                interface,
            } => self.link_up(gateway_mac, ssid, interface).await,
            LinkEvent::LinkDown => self.link_down().await,
        }
    }

    async fn link_up(&mut self, mac: MacAddress, ssid: Option<String>, interface: Option<String>) {
        if let Some(reason) = &self.halted {
            warn!("[STATE] Ignoring link-up for {}, classification halted: {}", mac, reason);
            return;
        }

        let same_network = self.active.as_ref().map(|fp| fp.mac == mac);
        match same_network {
            Some(true) if self.state.is_busy() => {
                info!("[STATE] {} re-observed while {}, restarting", mac, self.state);
                self.supervisor.cancel_all(&mac).await;
                self.in_flight.clear();
                self.connect(mac, ssid, interface, NetworkState::Reconnecting).await;
            }
            Some(true) => {
                debug!("[STATE] {} re-observed while {}, nothing to do", mac, self.state);
            }
            Some(false) => {
                info!("[STATE] Gateway changed to {}", mac);
                self.link_down().await;
                self.connect(mac, ssid, interface, NetworkState::Connecting).await;
            }
            None => {
                let via = if self.last_network.as_ref() == Some(&mac) {
                    NetworkState::Reconnecting
                } else {
                    NetworkState::Connecting
                };
                self.connect(mac, ssid, interface, via).await;
            }
        }
    }

    async fn connect(
        &mut self,
        mac: MacAddress,
        ssid: Option<String>,
        interface: Option<String>,
        via: NetworkState,
    ) {
        self.transition_to(via, Some(mac.clone()), None);

        let previous = match self.store.get(&mac) {
            Ok(previous) => previous,
            Err(e) => return self.halt(format!("fingerprint store unavailable: {}", e)),
        };
        let classification = classify(
            &mac,
            self.flows.home_network_mac.as_ref(),
            &self.flows.blacklisted_macs,
            previous.as_ref(),
        );
        let now = Utc::now();
        let fingerprint = match previous {
            Some(previous) => previous.resighted(ssid, interface, classification, now),
            None => NetworkFingerprint::first_sighting(mac.clone(), ssid, interface, classification, now),
        };
        if let Err(e) = self.store.save(&fingerprint) {
            return self.halt(format!("fingerprint store unavailable: {}", e));
        }

        self.active = Some(fingerprint);
        self.last_network = Some(mac.clone());
        self.scan_partial = false;
        self.transition(NetworkState::connected(classification));

        self.bus.info(
            "network",
            format!("Connected to {} network {}", classification, mac),
        );
        if classification == Classification::Blacklisted {
            self.bus.critical(
                "network",
                format!("Blacklisted network {} detected, restart available", mac),
            );
        }

        self.run_hook(Hook::OnNetworkConnected, Phase::Background, Vec::new())
            .await;
        self.run_hook(
            Hook::for_classification(classification),
            Phase::Background,
            Vec::new(),
        )
        .await;

        if self.halted.is_none() && self.flows.auto_scan_for(classification) {
            self.start_scan().await;
        }
    }

    async fn link_down(&mut self) {
        if self.active.is_none()
            && matches!(
                self.state,
                NetworkState::WaitingForNetwork | NetworkState::Disconnected
            )
        {
            debug!("[STATE] Link-down with no network, nothing to do");
            return;
        }

        self.transition(NetworkState::Disconnected);
        let mut cancelled = Vec::new();
        if let Some(fp) = &self.active {
            cancelled = self.supervisor.cancel_all(&fp.mac).await;
        }
        // Completions for cancelled processes arrive later and are reaped as stale
        self.in_flight.clear();

        if self.halted.is_none() {
            self.run_hook(Hook::OnDisconnect, Phase::Background, Vec::new())
                .await;
            // Disconnect hook processes run to completion untracked
            self.in_flight.clear();
        }
        let outgoing = self.active.take();
        self.scan_partial = false;

        let network = outgoing
            .as_ref()
            .map(|fp| fp.mac.to_string())
            .unwrap_or_else(|| "unknown network".to_string());
        self.bus.warning(
            "network",
            format!(
                "Link lost on {}, cancelled {} process(es)",
                network,
                cancelled.len()
            ),
        );
        self.transition(NetworkState::WaitingForNetwork);
    }

    async fn start_scan(&mut self) {
        self.scan_partial = false;
        // Everything already running against the network is part of the scan
        for phase in self.in_flight.values_mut() {
            if *phase != Phase::Maintenance {
                *phase = Phase::Scan;
            }
        }
        self.transition(NetworkState::ScanningInProgress);
        if let Some(fp) = &self.active {
            self.bus.info("scan", format!("Scan started on {}", fp.mac));
        }

        self.run_hook(Hook::OnScanStart, Phase::Scan, Vec::new()).await;
        // A halt leaves the machine in ScanningInProgress
        if self.halted.is_none() && !self.has_phase(Phase::Scan) {
            self.complete_scan().await;
        }
    }

    async fn complete_scan(&mut self) {
        let partial = self.scan_partial;
        if let Some(fp) = &mut self.active {
            fp.last_seen = Utc::now();
            fp.scan_results.insert(
                "scan_status".to_string(),
                Value::from(if partial { "partial" } else { "complete" }),
            );
            if self.flows.mark_known_after_scan && fp.classification == Classification::New {
                info!("[STATE] {} scanned, now known", fp.mac);
                fp.classification = Classification::Known;
            }
        }
        if !self.persist() {
            return;
        }

        self.transition(NetworkState::ScanCompleted);
        if let Some(fp) = &self.active {
            if partial {
                self.bus
                    .warning("scan", format!("Scan of {} completed with failures", fp.mac));
            } else {
                self.bus.info("scan", format!("Scan of {} completed", fp.mac));
            }
        }

        self.run_hook(Hook::OnScanComplete, Phase::Action, Vec::new())
            .await;
        if self.halted.is_some() {
            return;
        }
        if self.has_phase(Phase::Action) {
            self.transition(NetworkState::PerformingAction);
        } else {
            self.settle();
        }
    }

    /// Return to the stable state for the active classification
    fn settle(&mut self) {
        if let Some(classification) = self.active.as_ref().map(|fp| fp.classification) {
            self.transition(NetworkState::connected(classification));
        }
    }

    pub async fn handle_supervisor_event(&mut self, event: SupervisorEvent) {
        let SupervisorEvent::Finished(snapshot) = event;
        self.supervisor.reap(snapshot.id);

        let Some(phase) = self.in_flight.remove(&snapshot.id) else {
            debug!("[STATE] Reaped stale process #{} ({})", snapshot.id, snapshot.plugin);
            return;
        };
        if self.halted.is_some() {
            return;
        }

        if phase == Phase::Maintenance {
            debug!("[STATE] Network restart #{} {}", snapshot.id, snapshot.status.as_str());
            return;
        }

        if let Some(fp) = &mut self.active {
            if fp.mac == snapshot.mac {
                fp.scan_results
                    .insert(snapshot.plugin.clone(), process_record(&snapshot));
            }
        }
        if phase == Phase::Scan && snapshot.status != ProcessStatus::Succeeded {
            self.scan_partial = true;
        }
        if !self.persist() {
            return;
        }

        match (phase, self.state) {
            (Phase::Scan, NetworkState::ScanningInProgress) if !self.has_phase(Phase::Scan) => {
                self.complete_scan().await
            }
            (Phase::Action, NetworkState::PerformingAction) if !self.has_phase(Phase::Action) => {
                self.settle()
            }
            _ => {}
        }
    }

    pub async fn handle_admin(&mut self, action: AdminAction) -> Result<AdminResponse, AdminError> {
        let name = action.name();
        match action {
            AdminAction::ClearAlerts => {
                let cleared = self.bus.clear();
                return Ok(AdminResponse::new(format!("Cleared {} alert(s)", cleared)));
            }
            AdminAction::DismissAlert { id } => {
                return if self.bus.resolve(id) {
                    Ok(AdminResponse::new(format!("Dismissed alert {}", id)))
                } else {
                    Err(AdminError::UnknownAlert(id))
                };
            }
            _ => {}
        }

        if let Some(reason) = &self.halted {
            return Err(AdminError::Halted(reason.clone()));
        }

        match action {
            AdminAction::RestartNetwork => self.restart_network(name),
            AdminAction::StartScan => {
                if !self.state.is_stable_connected()
                    || self.state == NetworkState::ConnectedBlacklisted
                {
                    return Err(self.not_allowed(name));
                }
                self.start_scan().await;
                Ok(AdminResponse::new(format!("Scan finished in state {}", self.state)))
            }
            AdminAction::PluginAction { plugin, args } => {
                self.plugin_action(name, &plugin, args).await
            }
            AdminAction::ForgetNetwork { mac } => {
                if self.active.as_ref().map(|fp| &fp.mac) == Some(&mac) {
                    return Err(self.not_allowed(name));
                }
                match self.store.delete(&mac) {
                    Ok(true) => Ok(AdminResponse::new(format!("Forgot network {}", mac))),
                    Ok(false) => Err(AdminError::UnknownNetwork(mac)),
                    Err(e) => {
                        self.halt(format!("fingerprint store unavailable: {}", e));
                        Err(e.into())
                    }
                }
            }
            AdminAction::ClearAlerts | AdminAction::DismissAlert { .. } => {
                Err(AdminError::UnknownAction(name.to_string()))
            }
        }
    }

    fn restart_network(&mut self, name: &str) -> Result<AdminResponse, AdminError> {
        let mac = match (&self.active, self.state) {
            (Some(fp), NetworkState::ConnectedBlacklisted) => fp.mac.clone(),
            _ => return Err(self.not_allowed(name)),
        };

        if let Some((command, args)) = self.flows.restart_command.split_first() {
            let request = ScanRequest::new(command.clone(), args.to_vec());
            match self.supervisor.start(NETWORK_PLUGIN, &mac, request) {
                Ok(id) => {
                    self.in_flight.insert(id, Phase::Maintenance);
                }
                Err(SupervisorError::Unavailable) => {
                    self.halt("process supervisor unavailable".to_string());
                    return Err(SupervisorError::Unavailable.into());
                }
                Err(e) => return Err(e.into()),
            }
        }

        self.bus
            .info("network", format!("Network restart requested on {}", mac));
        Ok(AdminResponse::new(format!("Restarting network on {}", mac)))
    }

    async fn plugin_action(
        &mut self,
        name: &str,
        plugin: &str,
        args: Vec<String>,
    ) -> Result<AdminResponse, AdminError> {
        if self.active.is_none() {
            return Err(self.not_allowed(name));
        }
        let ctx = HookContext::new(self.state, self.active.clone()).with_args(args);
        let outcome = self
            .dispatcher
            .dispatch_to(plugin, Hook::OnActionRequested, ctx)
            .await
            .ok_or_else(|| AdminError::UnknownPlugin(plugin.to_string()))?;

        let message = match &outcome.kind {
            OutcomeKind::SpawnRejected(e) if !matches!(e, SupervisorError::Unavailable) => {
                return Err(e.clone().into());
            }
            OutcomeKind::NotImplemented => {
                return Err(AdminError::InvalidParams {
                    action: name.to_string(),
                    reason: format!("plugin '{}' has no actions", plugin),
                });
            }
            OutcomeKind::Spawned(id) => format!("Started process {} for {}", id, plugin),
            OutcomeKind::Skipped(reason) => format!("Skipped {}: {}", plugin, reason),
            OutcomeKind::Failed(e) => format!("Action failed: {}", e),
            _ => format!("Action on {} completed", plugin),
        };

        self.absorb(vec![outcome], Phase::Action);
        if let Some(reason) = &self.halted {
            return Err(AdminError::Halted(reason.clone()));
        }
        if self.has_phase(Phase::Action) && self.state.is_stable_connected() {
            self.transition(NetworkState::PerformingAction);
        }
        Ok(AdminResponse::new(message))
    }

    async fn run_hook(&mut self, hook: Hook, phase: Phase, args: Vec<String>) {
        let ctx = HookContext::new(self.state, self.active.clone()).with_args(args);
        let outcomes = self.dispatcher.dispatch(hook, ctx).await;
        self.absorb(outcomes, phase);
    }

    /// Fold hook outcomes into the active fingerprint and the in-flight set
    fn absorb(&mut self, outcomes: Vec<PluginOutcome>, phase: Phase) {
        let mut changed = false;
        for outcome in outcomes {
            match outcome.kind {
                OutcomeKind::Completed(HookReply::Merge(results)) => {
                    if let Some(fp) = &mut self.active {
                        fp.merge_results(results);
                        changed = true;
                    }
                }
                OutcomeKind::Completed(HookReply::MarkKnown) => {
                    if let Some(fp) = &mut self.active {
                        if fp.classification == Classification::New {
                            info!("[STATE] {} marked known by {}", fp.mac, outcome.plugin);
                            fp.classification = Classification::Known;
                            changed = true;
                        }
                    }
                }
                OutcomeKind::Spawned(id) => {
                    self.in_flight.insert(id, phase);
                }
                OutcomeKind::SpawnRejected(SupervisorError::Unavailable) => {
                    self.halt("process supervisor unavailable".to_string());
                }
                OutcomeKind::SpawnRejected(SupervisorError::DuplicateScan { plugin, mac }) => {
                    match self.supervisor.active_process(&plugin, &mac) {
                        Some(id) if phase != Phase::Background => {
                            debug!("[STATE] {} already running as #{}, waiting on it", plugin, id);
                            self.in_flight.insert(id, phase);
                        }
                        _ => debug!("[STATE] {} already running, not restarted", plugin),
                    }
                }
                OutcomeKind::SpawnRejected(_) | OutcomeKind::Failed(_) => {
                    if phase == Phase::Scan {
                        self.scan_partial = true;
                    }
                }
                _ => {}
            }
        }

        if changed && self.persist() && self.state.is_stable_connected() {
            // MarkKnown may have moved the stable state
            self.settle();
        }
    }

    fn has_phase(&self, phase: Phase) -> bool {
        self.in_flight.values().any(|p| *p == phase)
    }

    /// Save the active fingerprint. Returns false (and halts) on store failure.
    fn persist(&mut self) -> bool {
        let Some(fp) = &self.active else {
            return true;
        };
        match self.store.save(fp) {
            Ok(()) => true,
            Err(e) => {
                self.halt(format!("fingerprint store unavailable: {}", e));
                false
            }
        }
    }

    fn halt(&mut self, reason: String) {
        if self.halted.is_some() {
            return;
        }
        error!("[STATE] Halting in {}: {}", self.state, reason);
        self.bus
            .critical("netfang", format!("Network classification halted: {}", reason));
        self.halted = Some(reason);
    }

    fn not_allowed(&self, action: &str) -> AdminError {
        AdminError::NotAllowed {
            action: action.to_string(),
            state: self.state,
        }
    }

    fn transition(&mut self, next: NetworkState) {
        let mac = self.active.as_ref().map(|fp| fp.mac.clone());
        let classification = self.active.as_ref().map(|fp| fp.classification);
        self.transition_to(next, mac, classification);
    }

    fn transition_to(
        &mut self,
        next: NetworkState,
        mac: Option<MacAddress>,
        classification: Option<Classification>,
    ) {
        let previous = self.state;
        if previous == next {
            return;
        }
        self.state = next;
        info!("[STATE] {} -> {}", previous, next);
        self.bus.publish_state(StateUpdate {
            state: next,
            previous,
            mac,
            classification,
            timestamp: Utc::now(),
        });
    }
}

/// What a finished process contributes to the scan results
fn process_record(snapshot: &ProcessSnapshot) -> Value {
    let skip = snapshot.output.len().saturating_sub(RESULT_TAIL_LINES);
    json!({
        "status": snapshot.status.as_str(),
        "exit_code": snapshot.exit_code,
        "command": snapshot.command,
        "started_at": snapshot.started_at,
        "ended_at": snapshot.ended_at,
        "output": &snapshot.output[skip..],
    })
}
