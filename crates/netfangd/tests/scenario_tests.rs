//! End-to-end scenarios through the daemon's public API
//!
//! Each test builds a daemon from a TOML config with an on-disk store in a
//! temporary directory and drives it the way the link monitor and the
//! dashboard would.

use netfang_common::{AlertLevel, Classification, FingerprintStore, MacAddress, NetfangConfig};
use netfangd::{
    AdminError, AdminRequest, Daemon, DaemonHandle, DashboardEvent, LinkEvent, NetworkState,
    ProcessSupervisor, Subscription,
};
use serde_json::Value;
use std::time::Duration;
use tempfile::TempDir;
use tokio::task::JoinHandle;

const HOME_MAC: &str = "AA:BB:CC:11:22:33";
const BLACKLISTED_MAC: &str = "DE:AD:BE:EF:CA:FE";
const CAFE_MAC: &str = "10:20:30:40:50:60";

struct Running {
    handle: DaemonHandle,
    store: FingerprintStore,
    supervisor: ProcessSupervisor,
    task: JoinHandle<()>,
    _dir: TempDir,
}

fn mac(s: &str) -> MacAddress {
    MacAddress::parse(s).unwrap()
}

fn start_in(dir: TempDir, extra: &str) -> Running {
    let toml = format!(
        r#"
        [network_flows]
        home_network_mac = "{}"
        blacklisted_macs = ["{}"]
        {}
        "#,
        HOME_MAC, BLACKLISTED_MAC, extra
    );
    let config = NetfangConfig::from_toml_str(&toml).unwrap();
    let store = FingerprintStore::open(&dir.path().join("netfang.db")).unwrap();
    let (daemon, handle) = Daemon::new(&config, store.clone(), Vec::new()).unwrap();
    let supervisor = daemon.supervisor();
    let task = tokio::spawn(daemon.run());
    Running {
        handle,
        store,
        supervisor,
        task,
        _dir: dir,
    }
}

fn start(extra: &str) -> Running {
    start_in(TempDir::new().unwrap(), extra)
}

impl Running {
    async fn up(&self, m: &str) {
        self.handle.link_event(LinkEvent::up(mac(m))).await.unwrap();
    }

    async fn state(&self) -> NetworkState {
        self.handle.snapshot().await.unwrap().state
    }

    async fn admin(&self, action: &str) -> Result<String, AdminError> {
        self.handle
            .admin(AdminRequest::new(action, Value::Null))
            .await
            .map(|r| r.message)
    }

    async fn stop(self) -> TempDir {
        drop(self.handle);
        self.task.await.unwrap();
        self._dir
    }
}

/// Drain everything already queued on a subscription
fn drain(sub: &mut Subscription) -> Vec<DashboardEvent> {
    let mut events = Vec::new();
    while let Ok(event) = sub.receiver.try_recv() {
        events.push(event);
    }
    events
}

fn alerts(events: &[DashboardEvent]) -> Vec<(AlertLevel, String)> {
    events
        .iter()
        .filter_map(|e| match e {
            DashboardEvent::Alert(a) => Some((a.level, a.message.clone())),
            _ => None,
        })
        .collect()
}

/// Collect state updates until `last` is reached
async fn states_until(sub: &mut Subscription, last: NetworkState) -> Vec<NetworkState> {
    let mut states = Vec::new();
    loop {
        let event = tokio::time::timeout(Duration::from_secs(10), sub.receiver.recv())
            .await
            .expect("timed out waiting for state")
            .unwrap();
        if let DashboardEvent::StateUpdate(update) = event {
            states.push(update.state);
            if update.state == last {
                return states;
            }
        }
    }
}

#[tokio::test]
async fn test_home_network_single_info_alert() {
    let daemon = start("auto_scan_new_network = true\nauto_scan_known_network = true");
    let mut sub = daemon.handle.subscribe();

    daemon.up(HOME_MAC).await;

    assert_eq!(daemon.state().await, NetworkState::ConnectedHome);
    let events = drain(&mut sub);
    let raised = alerts(&events);
    assert_eq!(raised.len(), 1, "alerts: {:?}", raised);
    assert_eq!(raised[0].0, AlertLevel::Info);
    assert!(raised[0].1.contains("home"));
    // Home never auto-scans
    assert!(!events.iter().any(|e| matches!(
        e,
        DashboardEvent::StateUpdate(u) if u.state == NetworkState::ScanningInProgress
    )));
    assert!(daemon.handle.snapshot().await.unwrap().in_flight.is_empty());
    daemon.stop().await;
}

#[tokio::test]
async fn test_blacklisted_network_and_restart_action() {
    let daemon = start(r#"restart_command = ["sh", "-c", "exit 0"]"#);
    let mut sub = daemon.handle.subscribe();

    daemon.up(BLACKLISTED_MAC).await;
    assert_eq!(daemon.state().await, NetworkState::ConnectedBlacklisted);

    let critical: Vec<_> = alerts(&drain(&mut sub))
        .into_iter()
        .filter(|(level, _)| *level == AlertLevel::Critical)
        .collect();
    assert_eq!(critical.len(), 1);

    assert!(daemon.admin("restartNetwork").await.is_ok());

    daemon.up(HOME_MAC).await;
    assert_eq!(daemon.state().await, NetworkState::ConnectedHome);
    assert!(matches!(
        daemon.admin("restartNetwork").await,
        Err(AdminError::NotAllowed {
            state: NetworkState::ConnectedHome,
            ..
        })
    ));
    daemon.stop().await;
}

#[tokio::test]
async fn test_new_network_auto_scan() {
    let daemon = start(
        r#"
        auto_scan_new_network = true

        [default_plugins.arpscan.plugin_config]
        command = "sh"
        args = ["-c", "echo scanning {mac}; sleep 0.1"]
        "#,
    );
    let mut sub = daemon.handle.subscribe();

    daemon.up(CAFE_MAC).await;
    let states = states_until(&mut sub, NetworkState::ScanCompleted).await;
    let tail = &states[states.len() - 3..];
    assert_eq!(
        tail,
        &[
            NetworkState::ConnectedNew,
            NetworkState::ScanningInProgress,
            NetworkState::ScanCompleted
        ]
    );
    let settled = states_until(&mut sub, NetworkState::ConnectedNew).await;
    assert_eq!(settled, vec![NetworkState::ConnectedNew]);

    let stored = daemon.store.get(&mac(CAFE_MAC)).unwrap().unwrap();
    assert_eq!(stored.classification, Classification::New);
    assert!(stored.last_seen > stored.first_seen);
    assert_eq!(stored.scan_results["arpscan"]["status"], "succeeded");
    assert_eq!(
        stored.scan_results["arpscan"]["output"][0],
        format!("scanning {}", CAFE_MAC)
    );
    assert!(!daemon.store.plugin_logs("arpscan", 10).unwrap().is_empty());

    // Re-observing the same network: no alert, no process
    let before = daemon.handle.bus().alerts().len();
    daemon.up(CAFE_MAC).await;
    assert_eq!(daemon.state().await, NetworkState::ConnectedNew);
    assert_eq!(daemon.handle.bus().alerts().len(), before);
    assert!(daemon.supervisor.running_for(&mac(CAFE_MAC)).is_empty());
    assert!(daemon.handle.snapshot().await.unwrap().in_flight.is_empty());
    daemon.stop().await;
}

#[tokio::test]
async fn test_failed_scan_still_completes() {
    let daemon = start(
        r#"
        auto_scan_new_network = true

        [default_plugins.broken.plugin_config]
        command = "sh"
        args = ["-c", "exit 2"]

        [default_plugins.missing.plugin_config]
        command = "/nonexistent/netfang/scanner"
        "#,
    );
    let mut sub = daemon.handle.subscribe();

    daemon.up(CAFE_MAC).await;
    states_until(&mut sub, NetworkState::ConnectedNew).await;
    states_until(&mut sub, NetworkState::ConnectedNew).await;

    let stored = daemon.store.get(&mac(CAFE_MAC)).unwrap().unwrap();
    assert_eq!(stored.scan_results["broken"]["status"], "failed");
    assert_eq!(stored.scan_results["broken"]["exit_code"], 2);
    assert_eq!(stored.scan_results["scan_status"], "partial");

    let levels: Vec<AlertLevel> = daemon.handle.bus().alerts().iter().map(|a| a.level).collect();
    assert!(levels.contains(&AlertLevel::Critical), "spawn failure is critical");
    assert!(levels.contains(&AlertLevel::Warning), "non-zero exit is a warning");
    daemon.stop().await;
}

#[tokio::test]
async fn test_link_down_cancels_running_scan() {
    let daemon = start(
        r#"
        auto_scan_new_network = true

        [default_plugins.slow.plugin_config]
        command = "sleep"
        args = ["30"]
        "#,
    );

    daemon.up(CAFE_MAC).await;
    assert_eq!(daemon.state().await, NetworkState::ScanningInProgress);
    assert_eq!(daemon.supervisor.running_for(&mac(CAFE_MAC)).len(), 1);

    daemon.handle.link_event(LinkEvent::LinkDown).await.unwrap();
    assert_eq!(daemon.state().await, NetworkState::WaitingForNetwork);
    assert!(daemon.supervisor.running_for(&mac(CAFE_MAC)).is_empty());

    let lost = daemon
        .handle
        .bus()
        .alerts()
        .into_iter()
        .find(|a| a.message.starts_with("Link lost"))
        .unwrap();
    assert_eq!(lost.level, AlertLevel::Warning);
    assert!(lost.message.contains("cancelled 1"));
    daemon.stop().await;
}

#[tokio::test]
async fn test_classification_survives_restart() {
    let first = start("auto_scan_new_network = true\nmark_known_after_scan = true");
    first.up(CAFE_MAC).await;
    assert_eq!(first.state().await, NetworkState::ConnectedKnown);
    let dir = first.stop().await;

    let second = start_in(dir, "");
    second.up(CAFE_MAC).await;
    assert_eq!(second.state().await, NetworkState::ConnectedKnown);

    // Home wins over stored history
    let stored = second.store.list().unwrap();
    assert_eq!(stored.len(), 1);
    second.up(HOME_MAC).await;
    assert_eq!(second.state().await, NetworkState::ConnectedHome);
    second.stop().await;
}

#[tokio::test]
async fn test_dismiss_and_forget() {
    let daemon = start("");
    daemon.up(CAFE_MAC).await;
    let id = daemon.handle.bus().alerts()[0].id;

    let dismissed = daemon
        .handle
        .admin(AdminRequest::new("dismissAlert", serde_json::json!({ "id": id })))
        .await;
    assert!(dismissed.is_ok());
    assert!(daemon.handle.bus().alerts()[0].resolved);

    daemon.handle.link_event(LinkEvent::LinkDown).await.unwrap();
    let forgot = daemon
        .handle
        .admin(AdminRequest::new(
            "forgetNetwork",
            serde_json::json!({ "mac": CAFE_MAC }),
        ))
        .await;
    assert!(forgot.is_ok());
    assert!(daemon.store.get(&mac(CAFE_MAC)).unwrap().is_none());
    daemon.stop().await;
}
