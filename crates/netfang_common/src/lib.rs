//! NetFang common library - domain types, configuration and persistence
//! shared by the daemon and its tests.

pub mod alert;
pub mod config;
pub mod error;
pub mod fingerprint;
pub mod mac;
pub mod store;

pub use alert::{Alert, AlertLevel};
pub use config::{
    AlertsConfig, NetfangConfig, NetworkFlowsConfig, PluginCategory, PluginEntry,
    SupervisorConfig, CONFIG_PATH,
};
pub use error::{ConfigError, StoreError};
pub use fingerprint::{classify, Classification, NetworkFingerprint, ScanResults};
pub use mac::{MacAddress, MacParseError};
pub use store::{AlertLogEntry, FingerprintStore, PluginLogEntry};
