//! Daemon error types.
//!
//! Plugin and process errors are recovered locally and downgraded to alerts;
//! admin errors are returned to the caller that issued the request.

use netfang_common::{MacAddress, StoreError};
use std::time::Duration;
use thiserror::Error;

use crate::state::NetworkState;
use crate::supervisor::ProcessId;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PluginError {
    #[error("plugin '{plugin}' timed out after {after:?}")]
    Timeout { plugin: String, after: Duration },

    #[error("plugin '{plugin}' failed: {reason}")]
    Failed { plugin: String, reason: String },

    #[error("plugin '{plugin}' panicked")]
    Panicked { plugin: String },
}

impl PluginError {
    pub fn failed(plugin: impl Into<String>, reason: impl Into<String>) -> Self {
        PluginError::Failed {
            plugin: plugin.into(),
            reason: reason.into(),
        }
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, PluginError::Timeout { .. })
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SupervisorError {
    #[error("a scan for plugin '{plugin}' on {mac} is already running")]
    DuplicateScan { plugin: String, mac: MacAddress },

    #[error("unknown process {0}")]
    UnknownProcess(ProcessId),

    #[error("failed to spawn '{command}' for plugin '{plugin}': {reason}")]
    Spawn {
        plugin: String,
        command: String,
        reason: String,
    },

    #[error("process supervisor is shut down")]
    Unavailable,
}

#[derive(Error, Debug)]
pub enum AdminError {
    #[error("unknown admin action '{0}'")]
    UnknownAction(String),

    #[error("invalid parameters for '{action}': {reason}")]
    InvalidParams { action: String, reason: String },

    #[error("'{action}' is not allowed while {state}")]
    NotAllowed { action: String, state: NetworkState },

    #[error("no alert with id {0}")]
    UnknownAlert(u64),

    #[error("no plugin named '{0}'")]
    UnknownPlugin(String),

    #[error("no stored network {0}")]
    UnknownNetwork(MacAddress),

    #[error("network classification halted: {0}")]
    Halted(String),

    #[error("process supervisor error: {0}")]
    Supervisor(#[from] SupervisorError),

    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("daemon is not running")]
    DaemonGone,
}
