//! Alert Bus - bounded in-memory alert history with push-out to dashboard
//! subscribers.
//!
//! Appends and broadcasts happen under one lock, so every subscriber sees
//! events in append order. Subscribing takes the backlog and the live
//! receiver under the same lock, so nothing is missed or duplicated.

use chrono::{DateTime, Utc};
use netfang_common::{Alert, AlertLevel, FingerprintStore, MacAddress};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::broadcast;
use tracing::{debug, warn};

use crate::state::StateUpdate;
use crate::supervisor::ProcessId;

/// Which pipe an output line came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputStream {
    Stdout,
    Stderr,
}

/// One line of streamed process output
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PluginLogLine {
    pub level: AlertLevel,
    pub plugin: String,
    pub process_id: ProcessId,
    pub mac: MacAddress,
    pub stream: OutputStream,
    pub line: String,
    pub timestamp: DateTime<Utc>,
}

/// Everything pushed to dashboard subscribers
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum DashboardEvent {
    Alert(Alert),
    StateUpdate(StateUpdate),
    AlertResolved { id: u64 },
    AlertsCleared,
    PluginLog(PluginLogLine),
}

/// Handed to a (re)connecting subscriber
pub struct Subscription {
    /// Retained alerts, oldest first
    pub backlog: Vec<Alert>,
    /// Last state transition, if any happened yet
    pub state: Option<StateUpdate>,
    pub receiver: broadcast::Receiver<DashboardEvent>,
}

struct BusState {
    history: VecDeque<Alert>,
    last_state: Option<StateUpdate>,
}

struct BusInner {
    state: Mutex<BusState>,
    next_id: AtomicU64,
    capacity: usize,
    tx: broadcast::Sender<DashboardEvent>,
    audit: Option<FingerprintStore>,
}

#[derive(Clone)]
pub struct AlertBus {
    inner: Arc<BusInner>,
}

impl AlertBus {
    /// `capacity` bounds the alert history, `subscriber_buffer` each
    /// subscriber's lag allowance
    pub fn new(capacity: usize, subscriber_buffer: usize) -> Self {
        Self::build(capacity, subscriber_buffer, None)
    }

    /// Same as `new`, also appending every alert to the store's audit log
    pub fn with_audit(capacity: usize, subscriber_buffer: usize, store: FingerprintStore) -> Self {
        Self::build(capacity, subscriber_buffer, Some(store))
    }

    fn build(capacity: usize, subscriber_buffer: usize, audit: Option<FingerprintStore>) -> Self {
        let (tx, _) = broadcast::channel(subscriber_buffer.max(1));
        Self {
            inner: Arc::new(BusInner {
                state: Mutex::new(BusState {
                    history: VecDeque::with_capacity(capacity),
                    last_state: None,
                }),
                next_id: AtomicU64::new(1),
                capacity: capacity.max(1),
                tx,
                audit,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, BusState> {
        // The guarded data stays consistent even if a holder panicked
        self.inner
            .state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Append an alert, evicting the oldest when full. Returns its id.
    pub fn push(&self, mut alert: Alert) -> u64 {
        let id = self.inner.next_id.fetch_add(1, Ordering::SeqCst);
        alert.id = id;

        {
            let mut state = self.lock();
            state.history.push_back(alert.clone());
            while state.history.len() > self.inner.capacity {
                state.history.pop_front();
            }
            let _ = self.inner.tx.send(DashboardEvent::Alert(alert.clone()));
        }

        debug!("[BUS] alert #{} {} [{}] {}", id, alert.level.as_str(), alert.category, alert.message);

        if let Some(store) = &self.inner.audit {
            if let Err(e) = store.append_alert(&alert) {
                warn!("[BUS] Failed to persist alert #{}: {}", id, e);
            }
        }

        id
    }

    pub fn raise(&self, level: AlertLevel, category: &str, message: impl Into<String>) -> u64 {
        self.push(Alert::new(level, category, message))
    }

    pub fn info(&self, category: &str, message: impl Into<String>) -> u64 {
        self.raise(AlertLevel::Info, category, message)
    }

    pub fn warning(&self, category: &str, message: impl Into<String>) -> u64 {
        self.raise(AlertLevel::Warning, category, message)
    }

    pub fn critical(&self, category: &str, message: impl Into<String>) -> u64 {
        self.raise(AlertLevel::Critical, category, message)
    }

    /// Broadcast a state transition and remember it for new subscribers
    pub fn publish_state(&self, update: StateUpdate) {
        let mut state = self.lock();
        state.last_state = Some(update.clone());
        let _ = self.inner.tx.send(DashboardEvent::StateUpdate(update));
    }

    /// Stream a process output line; not kept in the alert history
    pub fn log_line(&self, line: PluginLogLine) {
        let _guard = self.lock();
        let _ = self.inner.tx.send(DashboardEvent::PluginLog(line));
    }

    pub fn subscribe(&self) -> Subscription {
        let state = self.lock();
        Subscription {
            backlog: state.history.iter().cloned().collect(),
            state: state.last_state.clone(),
            receiver: self.inner.tx.subscribe(),
        }
    }

    /// Mark an alert resolved. Returns false if it is not in the history.
    pub fn resolve(&self, id: u64) -> bool {
        let mut state = self.lock();
        match state.history.iter_mut().find(|a| a.id == id) {
            Some(alert) => {
                if !alert.resolved {
                    alert.resolved = true;
                    let _ = self.inner.tx.send(DashboardEvent::AlertResolved { id });
                }
                true
            }
            None => false,
        }
    }

    /// Drop the whole history. Returns how many alerts were removed.
    pub fn clear(&self) -> usize {
        let mut state = self.lock();
        let n = state.history.len();
        state.history.clear();
        let _ = self.inner.tx.send(DashboardEvent::AlertsCleared);
        n
    }

    /// Resolve auto-dismissing alerts whose window has passed
    pub fn sweep_expired(&self, now: DateTime<Utc>) -> usize {
        let mut state = self.lock();
        let mut resolved = 0;
        for alert in state.history.iter_mut().filter(|a| a.is_expired(now)) {
            alert.resolved = true;
            resolved += 1;
            let _ = self.inner.tx.send(DashboardEvent::AlertResolved { id: alert.id });
        }
        resolved
    }

    /// Snapshot of the retained alerts, oldest first
    pub fn alerts(&self) -> Vec<Alert> {
        self.lock().history.iter().cloned().collect()
    }

    pub fn last_state(&self) -> Option<StateUpdate> {
        self.lock().last_state.clone()
    }
}
