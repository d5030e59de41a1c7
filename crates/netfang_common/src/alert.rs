//! Alert records shown on the dashboard and kept in the audit log.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

/// Alert severity
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AlertLevel {
    Info,
    Warning,
    Critical,
}

impl AlertLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            AlertLevel::Info => "info",
            AlertLevel::Warning => "warning",
            AlertLevel::Critical => "critical",
        }
    }
}

/// A single alert
///
/// `id` is assigned by the alert bus when the alert is appended; it is
/// unique for the lifetime of the process.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Alert {
    pub id: u64,
    pub level: AlertLevel,
    /// Plugin or subsystem name
    pub category: String,
    pub message: String,
    pub timestamp: DateTime<Utc>,
    pub resolved: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auto_dismiss_secs: Option<u64>,
}

impl Alert {
    pub fn new(level: AlertLevel, category: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            id: 0,
            level,
            category: category.into(),
            message: message.into(),
            timestamp: Utc::now(),
            resolved: false,
            auto_dismiss_secs: None,
        }
    }

    pub fn with_auto_dismiss(mut self, secs: u64) -> Self {
        self.auto_dismiss_secs = Some(secs);
        self
    }

    /// True once an auto-dismissing alert has outlived its window
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        match self.auto_dismiss_secs {
            Some(secs) if !self.resolved => {
                let secs = i64::try_from(secs).unwrap_or(i64::MAX);
                now.signed_duration_since(self.timestamp) >= Duration::seconds(secs)
            }
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_expiry_only_for_auto_dismiss() {
        let plain = Alert::new(AlertLevel::Info, "network", "connected");
        let later = plain.timestamp + Duration::hours(1);
        assert!(!plain.is_expired(later));

        let fleeting = Alert::new(AlertLevel::Info, "network", "connected").with_auto_dismiss(5);
        assert!(!fleeting.is_expired(fleeting.timestamp + Duration::seconds(4)));
        assert!(fleeting.is_expired(fleeting.timestamp + Duration::seconds(5)));

        let mut resolved = fleeting.clone();
        resolved.resolved = true;
        assert!(!resolved.is_expired(later));
    }

    #[test]
    fn test_levels_order_by_severity() {
        assert!(AlertLevel::Critical > AlertLevel::Warning);
        assert!(AlertLevel::Warning > AlertLevel::Info);
        assert_eq!(serde_json::to_string(&AlertLevel::Critical).unwrap(), "\"critical\"");
    }
}
