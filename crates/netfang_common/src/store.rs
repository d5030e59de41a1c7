//! Fingerprint Store
//!
//! SQLite-backed persistence for network fingerprints, the alert audit log
//! and per-plugin diagnostic events.
//! Location: /var/lib/netfang/netfang.db unless configured otherwise.
//!
//! The handle is cheap to clone; all clones share one connection behind a
//! mutex, which serializes writers.

use crate::alert::{Alert, AlertLevel};
use crate::error::StoreError;
use crate::fingerprint::{Classification, NetworkFingerprint, ScanResults};
use crate::mac::MacAddress;
use chrono::{DateTime, Utc};
use rusqlite::types::Type;
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::debug;

const SCHEMA_VERSION: u32 = 1;

const NETWORK_COLUMNS: &str =
    "mac_address, ssid, interface_type, classification, first_seen, last_seen, scan_results";

/// One row of the `plugin_logs` table
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PluginLogEntry {
    pub plugin_name: String,
    pub event: String,
    pub timestamp: DateTime<Utc>,
}

/// One row of the append-only alert audit log
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlertLogEntry {
    pub alert_id: u64,
    pub level: String,
    pub category: String,
    pub message: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Clone)]
pub struct FingerprintStore {
    conn: Arc<Mutex<Connection>>,
}

impl FingerprintStore {
    /// Open or create the store at a specific path
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let conn = Connection::open(path)?;
        let store = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        store.init_schema()?;
        debug!("[STORE] Opened {}", path.display());
        Ok(store)
    }

    /// In-memory store, used by tests and dry runs
    pub fn open_in_memory() -> Result<Self, StoreError> {
        let store = Self {
            conn: Arc::new(Mutex::new(Connection::open_in_memory()?)),
        };
        store.init_schema()?;
        Ok(store)
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>, StoreError> {
        self.conn.lock().map_err(|_| StoreError::Poisoned)
    }

    fn init_schema(&self) -> Result<(), StoreError> {
        let conn = self.lock()?;

        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS networks (
                mac_address TEXT PRIMARY KEY,
                ssid TEXT,
                interface_type TEXT,
                classification TEXT NOT NULL,
                first_seen TEXT NOT NULL,
                last_seen TEXT NOT NULL,
                scan_results TEXT NOT NULL DEFAULT '{}'
            );

            CREATE TABLE IF NOT EXISTS alert_log (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                alert_id INTEGER NOT NULL,
                level TEXT NOT NULL,
                category TEXT NOT NULL,
                message TEXT NOT NULL,
                created_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS plugin_logs (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                plugin_name TEXT NOT NULL,
                event TEXT NOT NULL,
                timestamp TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS schema_meta (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_networks_last_seen ON networks(last_seen);
            CREATE INDEX IF NOT EXISTS idx_plugin_logs_plugin ON plugin_logs(plugin_name);
            "#,
        )?;

        conn.execute(
            "INSERT OR REPLACE INTO schema_meta (key, value) VALUES ('version', ?1)",
            params![SCHEMA_VERSION.to_string()],
        )?;

        Ok(())
    }

    /// Look up a fingerprint by gateway MAC
    pub fn get(&self, mac: &MacAddress) -> Result<Option<NetworkFingerprint>, StoreError> {
        let conn = self.lock()?;
        let fp = conn
            .query_row(
                &format!("SELECT {NETWORK_COLUMNS} FROM networks WHERE mac_address = ?1"),
                params![mac.as_str()],
                row_to_fingerprint,
            )
            .optional()?;
        Ok(fp)
    }

    /// Insert or fully replace a fingerprint
    pub fn save(&self, fp: &NetworkFingerprint) -> Result<(), StoreError> {
        let payload = serde_json::to_string(&fp.scan_results)?;
        let conn = self.lock()?;
        conn.execute(
            r#"
            INSERT INTO networks (mac_address, ssid, interface_type, classification, first_seen, last_seen, scan_results)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
            ON CONFLICT(mac_address) DO UPDATE SET
                ssid = excluded.ssid,
                interface_type = excluded.interface_type,
                classification = excluded.classification,
                last_seen = excluded.last_seen,
                scan_results = excluded.scan_results
            "#,
            params![
                fp.mac.as_str(),
                &fp.ssid,
                &fp.interface_type,
                fp.classification.as_str(),
                fp.first_seen,
                fp.last_seen,
                payload,
            ],
        )?;
        Ok(())
    }

    /// All fingerprints, most recently seen first
    pub fn list(&self) -> Result<Vec<NetworkFingerprint>, StoreError> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {NETWORK_COLUMNS} FROM networks ORDER BY last_seen DESC, mac_address"
        ))?;
        let rows = stmt.query_map([], row_to_fingerprint)?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    /// Delete a fingerprint (admin action only). Returns false if absent.
    pub fn delete(&self, mac: &MacAddress) -> Result<bool, StoreError> {
        let conn = self.lock()?;
        let n = conn.execute(
            "DELETE FROM networks WHERE mac_address = ?1",
            params![mac.as_str()],
        )?;
        Ok(n > 0)
    }

    pub fn append_alert(&self, alert: &Alert) -> Result<(), StoreError> {
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO alert_log (alert_id, level, category, message, created_at) VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                alert.id as i64,
                alert.level.as_str(),
                &alert.category,
                &alert.message,
                alert.timestamp,
            ],
        )?;
        Ok(())
    }

    /// Most recent audit entries, newest first
    pub fn recent_alerts(&self, limit: usize) -> Result<Vec<AlertLogEntry>, StoreError> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT alert_id, level, category, message, created_at FROM alert_log ORDER BY id DESC LIMIT ?1",
        )?;
        let rows = stmt.query_map(params![limit as i64], |row| {
            Ok(AlertLogEntry {
                alert_id: row.get::<_, i64>(0)? as u64,
                level: row.get(1)?,
                category: row.get(2)?,
                message: row.get(3)?,
                created_at: row.get(4)?,
            })
        })?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    pub fn add_plugin_log(&self, plugin_name: &str, event: &str) -> Result<(), StoreError> {
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO plugin_logs (plugin_name, event, timestamp) VALUES (?1, ?2, ?3)",
            params![plugin_name, event, Utc::now()],
        )?;
        Ok(())
    }

    /// Diagnostic events for one plugin, oldest first
    pub fn plugin_logs(&self, plugin_name: &str, limit: usize) -> Result<Vec<PluginLogEntry>, StoreError> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            r#"
            SELECT plugin_name, event, timestamp FROM (
                SELECT id, plugin_name, event, timestamp FROM plugin_logs
                WHERE plugin_name = ?1 ORDER BY id DESC LIMIT ?2
            ) ORDER BY id ASC
            "#,
        )?;
        let rows = stmt.query_map(params![plugin_name, limit as i64], |row| {
            Ok(PluginLogEntry {
                plugin_name: row.get(0)?,
                event: row.get(1)?,
                timestamp: row.get(2)?,
            })
        })?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }
}

fn row_to_fingerprint(row: &Row<'_>) -> rusqlite::Result<NetworkFingerprint> {
    let mac_raw: String = row.get(0)?;
    let mac = MacAddress::parse(&mac_raw)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(0, Type::Text, Box::new(e)))?;

    let class_raw: String = row.get(3)?;
    let classification = Classification::parse(&class_raw).ok_or_else(|| {
        rusqlite::Error::FromSqlConversionFailure(
            3,
            Type::Text,
            format!("unknown classification '{}'", class_raw).into(),
        )
    })?;

    let payload_raw: String = row.get(6)?;
    let scan_results: ScanResults = serde_json::from_str(&payload_raw)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(6, Type::Text, Box::new(e)))?;

    Ok(NetworkFingerprint {
        mac,
        ssid: row.get(1)?,
        interface_type: row.get(2)?,
        classification,
        first_seen: row.get(4)?,
        last_seen: row.get(5)?,
        scan_results,
    })
}

impl AlertLogEntry {
    pub fn level(&self) -> Option<AlertLevel> {
        match self.level.as_str() {
            "info" => Some(AlertLevel::Info),
            "warning" => Some(AlertLevel::Warning),
            "critical" => Some(AlertLevel::Critical),
            _ => None,
        }
    }
}
