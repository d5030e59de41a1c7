//! Network fingerprints and their classification.
//!
//! A fingerprint is keyed by the gateway MAC. Its classification is derived
//! on every sighting from the configured home/blacklist MACs and the stored
//! history; it is never edited by hand.

use crate::mac::MacAddress;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;

/// Opaque scan-result payload written by plugins
pub type ScanResults = serde_json::Map<String, serde_json::Value>;

/// How a network relates to this appliance
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Classification {
    Home,
    Known,
    New,
    Blacklisted,
}

impl Classification {
    pub fn as_str(&self) -> &'static str {
        match self {
            Classification::Home => "home",
            Classification::Known => "known",
            Classification::New => "new",
            Classification::Blacklisted => "blacklisted",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "home" => Some(Classification::Home),
            "known" => Some(Classification::Known),
            "new" => Some(Classification::New),
            "blacklisted" => Some(Classification::Blacklisted),
            _ => None,
        }
    }
}

impl fmt::Display for Classification {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Derive the classification for a sighting of `mac`.
///
/// Blacklist wins over home; a stored record only makes a network Known if
/// it was stored with a non-New classification.
pub fn classify(
    mac: &MacAddress,
    home: Option<&MacAddress>,
    blacklist: &BTreeSet<MacAddress>,
    previous: Option<&NetworkFingerprint>,
) -> Classification {
    if blacklist.contains(mac) {
        return Classification::Blacklisted;
    }
    if home == Some(mac) {
        return Classification::Home;
    }
    match previous {
        Some(fp) if fp.classification != Classification::New => Classification::Known,
        _ => Classification::New,
    }
}

/// Identity and classification record for one network
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NetworkFingerprint {
    pub mac: MacAddress,
    pub ssid: Option<String>,
    pub interface_type: Option<String>,
    pub classification: Classification,
    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
    #[serde(default)]
    pub scan_results: ScanResults,
}

impl NetworkFingerprint {
    pub fn first_sighting(
        mac: MacAddress,
        ssid: Option<String>,
        interface_type: Option<String>,
        classification: Classification,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            mac,
            ssid,
            interface_type,
            classification,
            first_seen: now,
            last_seen: now,
            scan_results: ScanResults::new(),
        }
    }

    /// Apply a new sighting to an existing record
    pub fn resighted(
        mut self,
        ssid: Option<String>,
        interface_type: Option<String>,
        classification: Classification,
        now: DateTime<Utc>,
    ) -> Self {
        if ssid.is_some() {
            self.ssid = ssid;
        }
        if interface_type.is_some() {
            self.interface_type = interface_type;
        }
        self.classification = classification;
        self.last_seen = now;
        self
    }

    /// Shallow merge: top-level keys from `results` replace existing ones
    pub fn merge_results(&mut self, results: ScanResults) {
        for (key, value) in results {
            self.scan_results.insert(key, value);
        }
    }
}
