//! Plugin capability interface.
//!
//! Every hook is optional: a plugin declares the hooks it handles through
//! `handles`, and the dispatcher records `NotImplemented` for the rest
//! instead of probing for methods.

use async_trait::async_trait;
use netfang_common::{Classification, NetworkFingerprint, ScanResults};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::PluginError;
use crate::state::NetworkState;
use crate::supervisor::ScanRequest;

/// Lifecycle hooks, in the order a typical connection fires them
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Hook {
    OnNetworkConnected,
    OnNewNetwork,
    OnKnownNetwork,
    OnHomeNetwork,
    OnBlacklistedNetwork,
    OnScanStart,
    OnScanComplete,
    OnDisconnect,
    OnActionRequested,
}

impl Hook {
    pub const ALL: [Hook; 9] = [
        Hook::OnNetworkConnected,
        Hook::OnNewNetwork,
        Hook::OnKnownNetwork,
        Hook::OnHomeNetwork,
        Hook::OnBlacklistedNetwork,
        Hook::OnScanStart,
        Hook::OnScanComplete,
        Hook::OnDisconnect,
        Hook::OnActionRequested,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Hook::OnNetworkConnected => "on_network_connected",
            Hook::OnNewNetwork => "on_new_network",
            Hook::OnKnownNetwork => "on_known_network",
            Hook::OnHomeNetwork => "on_home_network",
            Hook::OnBlacklistedNetwork => "on_blacklisted_network",
            Hook::OnScanStart => "on_scan_start",
            Hook::OnScanComplete => "on_scan_complete",
            Hook::OnDisconnect => "on_disconnect",
            Hook::OnActionRequested => "on_action_requested",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Hook::ALL.into_iter().find(|h| h.as_str() == s)
    }

    /// Classification-specific hook fired after `on_network_connected`
    pub fn for_classification(classification: Classification) -> Self {
        match classification {
            Classification::Home => Hook::OnHomeNetwork,
            Classification::Known => Hook::OnKnownNetwork,
            Classification::New => Hook::OnNewNetwork,
            Classification::Blacklisted => Hook::OnBlacklistedNetwork,
        }
    }
}

impl fmt::Display for Hook {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What a hook sees
#[derive(Debug, Clone)]
pub struct HookContext {
    pub state: NetworkState,
    pub fingerprint: Option<NetworkFingerprint>,
    /// Stored scan results plus everything merged by earlier plugins in
    /// this dispatch
    pub payload: ScanResults,
    /// Extra arguments for `on_action_requested`
    pub args: Vec<String>,
}

impl HookContext {
    pub fn new(state: NetworkState, fingerprint: Option<NetworkFingerprint>) -> Self {
        let payload = fingerprint
            .as_ref()
            .map(|fp| fp.scan_results.clone())
            .unwrap_or_default();
        Self {
            state,
            fingerprint,
            payload,
            args: Vec::new(),
        }
    }

    pub fn with_args(mut self, args: Vec<String>) -> Self {
        self.args = args;
        self
    }
}

/// What a hook gives back
#[derive(Debug, Clone, PartialEq)]
pub enum HookReply {
    Nothing,
    /// Merged into the fingerprint's scan results
    Merge(ScanResults),
    /// Long-running work for the process supervisor
    Spawn(ScanRequest),
    /// Promote the current network from New to Known
    MarkKnown,
}

/// Runtime readiness, checked before every dispatch
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Precondition {
    Ready,
    Unavailable(String),
}

#[async_trait]
pub trait Plugin: Send + Sync {
    fn name(&self) -> &str;

    /// Whether this plugin implements `hook`
    fn handles(&self, hook: Hook) -> bool;

    fn precondition(&self) -> Precondition {
        Precondition::Ready
    }

    /// Must be idempotent: a timed-out call may be retried once
    async fn on_hook(&self, hook: Hook, ctx: &HookContext) -> Result<HookReply, PluginError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hook_names_round_trip() {
        for hook in Hook::ALL {
            assert_eq!(Hook::parse(hook.as_str()), Some(hook));
        }
        assert_eq!(Hook::parse("on_reboot"), None);
        assert_eq!(
            Hook::for_classification(Classification::Blacklisted),
            Hook::OnBlacklistedNetwork
        );
    }

    #[test]
    fn test_context_starts_from_stored_results() {
        let mut fp = NetworkFingerprint::first_sighting(
            netfang_common::MacAddress::parse("10:20:30:40:50:60").unwrap(),
            None,
            None,
            Classification::Known,
            chrono::Utc::now(),
        );
        fp.scan_results.insert("arpscan".into(), serde_json::json!({"hosts": 2}));
        let ctx = HookContext::new(NetworkState::ConnectedKnown, Some(fp));
        assert_eq!(ctx.payload["arpscan"]["hosts"], 2);
        assert!(HookContext::new(NetworkState::WaitingForNetwork, None).payload.is_empty());
    }
}
