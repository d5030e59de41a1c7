//! Replay and concurrency tests
//!
//! Same event sequence in, same state sequence out; and the supervisor's
//! one-process-per-(plugin, network) rule holds under racing starts.

use netfang_common::{
    Classification, FingerprintStore, MacAddress, NetworkFlowsConfig, SupervisorConfig,
};
use netfangd::{
    AlertBus, LinkEvent, NetworkState, PluginDispatcher, PluginRegistry, ProcessSupervisor,
    ScanRequest, StateMachine, SupervisorError, SupervisorEvent,
};
use std::sync::Arc;
use tokio::sync::mpsc;

const HOME: &str = "AA:BB:CC:11:22:33";
const BAD: &str = "DE:AD:BE:EF:CA:FE";
const NETWORKS: [&str; 4] = [HOME, BAD, "10:20:30:40:50:60", "66:55:44:33:22:11"];

fn mac(s: &str) -> MacAddress {
    MacAddress::parse(s).unwrap()
}

fn machine(flows: NetworkFlowsConfig) -> (StateMachine, mpsc::Receiver<SupervisorEvent>) {
    let store = FingerprintStore::open_in_memory().unwrap();
    let bus = AlertBus::new(100, 256);
    let (supervisor, events) = ProcessSupervisor::new(SupervisorConfig::default(), bus.clone(), None);
    let registry = Arc::new(PluginRegistry::from_descriptors(Vec::new()).unwrap());
    let dispatcher =
        PluginDispatcher::new(registry, Vec::new(), supervisor.clone(), bus.clone()).unwrap();
    (StateMachine::new(flows, store, bus, dispatcher, supervisor), events)
}

/// Fixed-seed event sequence over a handful of networks
fn sequence(seed: u64, len: usize) -> Vec<LinkEvent> {
    let mut x = seed;
    (0..len)
        .map(|_| {
            x = x.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
            match (x >> 33) % 6 {
                0 => LinkEvent::LinkDown,
                n => LinkEvent::up(mac(NETWORKS[(n as usize - 1) % NETWORKS.len()])),
            }
        })
        .collect()
}

// ============================================================================
// Replay determinism
// ============================================================================

#[tokio::test]
async fn test_replay_is_deterministic() {
    for (seed, mark_known) in [(1, false), (7, true), (42, false), (2024, true)] {
        let flows = NetworkFlowsConfig {
            home_network_mac: Some(mac(HOME)),
            blacklisted_macs: [mac(BAD)].into_iter().collect(),
            auto_scan_new_network: true,
            mark_known_after_scan: mark_known,
            ..NetworkFlowsConfig::default()
        };
        let (mut first, _first_events) = machine(flows.clone());
        let (mut second, _second_events) = machine(flows);

        for event in sequence(seed, 60) {
            first.handle_link_event(event.clone()).await;
            second.handle_link_event(event).await;

            assert_eq!(first.state(), second.state(), "seed {}", seed);
            assert_eq!(
                first.active().map(|fp| fp.classification),
                second.active().map(|fp| fp.classification)
            );
            // With nothing to run every event settles
            assert!(
                first.state().is_stable_connected()
                    || first.state() == NetworkState::WaitingForNetwork,
                "unsettled in {}",
                first.state()
            );
        }
    }
}

#[tokio::test]
async fn test_replay_classification_rules() {
    let flows = NetworkFlowsConfig {
        home_network_mac: Some(mac(HOME)),
        blacklisted_macs: [mac(BAD)].into_iter().collect(),
        ..NetworkFlowsConfig::default()
    };
    let (mut m, _events) = machine(flows);

    for event in sequence(99, 80) {
        m.handle_link_event(event).await;
        let Some(fp) = m.active() else {
            assert_eq!(m.state(), NetworkState::WaitingForNetwork);
            continue;
        };
        let expected = match fp.mac.as_str() {
            HOME => Classification::Home,
            BAD => Classification::Blacklisted,
            // Without scans nothing is promoted from New
            _ => Classification::New,
        };
        assert_eq!(fp.classification, expected, "{}", fp.mac);
        assert_eq!(m.state(), NetworkState::connected(expected));
    }
}

// ============================================================================
// Supervisor under concurrency
// ============================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_racing_starts_admit_one() {
    let bus = AlertBus::new(100, 256);
    let (supervisor, _events) = ProcessSupervisor::new(SupervisorConfig::default(), bus, None);
    let target = mac("10:20:30:40:50:60");

    let tasks: Vec<_> = (0..8)
        .map(|_| {
            let supervisor = supervisor.clone();
            let target = target.clone();
            tokio::spawn(async move {
                supervisor.start("nmap", &target, ScanRequest::new("sleep", vec!["30".into()]))
            })
        })
        .collect();

    let mut admitted = Vec::new();
    for task in tasks {
        match task.await.unwrap() {
            Ok(id) => admitted.push(id),
            Err(e) => assert!(matches!(e, SupervisorError::DuplicateScan { .. }), "{}", e),
        }
    }
    assert_eq!(admitted.len(), 1);
    assert_eq!(supervisor.running_for(&target), admitted);

    // A different network is independent
    let other = mac("66:55:44:33:22:11");
    assert!(supervisor
        .start("nmap", &other, ScanRequest::new("sleep", vec!["30".into()]))
        .is_ok());

    let cancelled = supervisor.cancel_all(&target).await;
    assert_eq!(cancelled, admitted);
    assert!(supervisor.running_for(&target).is_empty());
    assert_eq!(supervisor.running_for(&other).len(), 1);

    // Released: the pair can run again
    assert!(supervisor
        .start("nmap", &target, ScanRequest::new("sleep", vec!["30".into()]))
        .is_ok());
    supervisor.shutdown().await;
}
