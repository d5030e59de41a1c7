//! Network state machine types
//!
//! States are mutually exclusive; the stable `Connected*` states are the
//! ones the machine rests in between scans.

use chrono::{DateTime, Utc};
use netfang_common::{Classification, MacAddress, NetworkFingerprint};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::supervisor::ProcessId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum NetworkState {
    WaitingForNetwork,
    Connecting,
    Reconnecting,
    ConnectedHome,
    ConnectedKnown,
    ConnectedNew,
    ConnectedBlacklisted,
    ScanningInProgress,
    ScanCompleted,
    PerformingAction,
    Disconnected,
}

impl NetworkState {
    /// The stable state for a classification
    pub fn connected(classification: Classification) -> Self {
        match classification {
            Classification::Home => NetworkState::ConnectedHome,
            Classification::Known => NetworkState::ConnectedKnown,
            Classification::New => NetworkState::ConnectedNew,
            Classification::Blacklisted => NetworkState::ConnectedBlacklisted,
        }
    }

    pub fn is_stable_connected(&self) -> bool {
        matches!(
            self,
            NetworkState::ConnectedHome
                | NetworkState::ConnectedKnown
                | NetworkState::ConnectedNew
                | NetworkState::ConnectedBlacklisted
        )
    }

    /// Scanning or acting on the current network
    pub fn is_busy(&self) -> bool {
        matches!(
            self,
            NetworkState::ScanningInProgress
                | NetworkState::ScanCompleted
                | NetworkState::PerformingAction
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            NetworkState::WaitingForNetwork => "WAITING_FOR_NETWORK",
            NetworkState::Connecting => "CONNECTING",
            NetworkState::Reconnecting => "RECONNECTING",
            NetworkState::ConnectedHome => "CONNECTED_HOME",
            NetworkState::ConnectedKnown => "CONNECTED_KNOWN",
            NetworkState::ConnectedNew => "CONNECTED_NEW",
            NetworkState::ConnectedBlacklisted => "CONNECTED_BLACKLISTED",
            NetworkState::ScanningInProgress => "SCANNING_IN_PROGRESS",
            NetworkState::ScanCompleted => "SCAN_COMPLETED",
            NetworkState::PerformingAction => "PERFORMING_ACTION",
            NetworkState::Disconnected => "DISCONNECTED",
        }
    }
}

impl fmt::Display for NetworkState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Broadcast to dashboard subscribers on every transition
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateUpdate {
    pub state: NetworkState,
    pub previous: NetworkState,
    pub mac: Option<MacAddress>,
    pub classification: Option<Classification>,
    pub timestamp: DateTime<Utc>,
}

/// Observation from the link monitor
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum LinkEvent {
    LinkUp {
        gateway_mac: MacAddress,
        #[serde(default)]
        ssid: Option<String>,
        #[serde(default)]
        interface: Option<String>,
    },
    LinkDown,
}

impl LinkEvent {
    pub fn up(mac: MacAddress) -> Self {
        LinkEvent::LinkUp {
            gateway_mac: mac,
            ssid: None,
            interface: None,
        }
    }
}

/// Read-only view of the machine for the dashboard
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MachineSnapshot {
    pub state: NetworkState,
    pub fingerprint: Option<NetworkFingerprint>,
    pub in_flight: Vec<ProcessId>,
    pub halted: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connected_state_per_classification() {
        assert_eq!(
            NetworkState::connected(Classification::Blacklisted),
            NetworkState::ConnectedBlacklisted
        );
        assert!(NetworkState::ConnectedNew.is_stable_connected());
        assert!(!NetworkState::ScanningInProgress.is_stable_connected());
        assert!(NetworkState::ScanCompleted.is_busy());
    }

    #[test]
    fn test_link_event_wire_format() {
        let up: LinkEvent = serde_json::from_str(
            r#"{"kind":"link_up","gateway_mac":"aa:bb:cc:11:22:33","ssid":"home"}"#,
        )
        .unwrap();
        assert_eq!(
            up,
            LinkEvent::LinkUp {
                gateway_mac: MacAddress::parse("AA:BB:CC:11:22:33").unwrap(),
                ssid: Some("home".into()),
                interface: None,
            }
        );
        let down: LinkEvent = serde_json::from_str(r#"{"kind":"link_down"}"#).unwrap();
        assert_eq!(down, LinkEvent::LinkDown);
        assert_eq!(
            serde_json::to_string(&NetworkState::ConnectedHome).unwrap(),
            "\"CONNECTED_HOME\""
        );
    }
}
