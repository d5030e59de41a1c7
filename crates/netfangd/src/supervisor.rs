//! Process Supervisor - spawns, tracks, streams and cancels external scan
//! commands.
//!
//! Each process runs on its own worker task. Output lines go through a
//! bounded per-process channel into the process's ring buffer and, when
//! requested, onto the Alert Bus. At most one process is active per
//! (plugin, network) pair.

use chrono::{DateTime, Utc};
use netfang_common::{AlertLevel, FingerprintStore, MacAddress, SupervisorConfig};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::process::{ExitStatus, Stdio};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, error, info, warn};

use crate::alert_bus::{AlertBus, OutputStream, PluginLogLine};
use crate::error::SupervisorError;

pub type ProcessId = u64;

/// Work a plugin asks the supervisor to run
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScanRequest {
    pub command: String,
    pub args: Vec<String>,
    /// Kill the process and mark it Failed after this long
    pub timeout: Option<Duration>,
    /// Stream output lines live to dashboard subscribers
    pub stream_output: bool,
}

impl ScanRequest {
    pub fn new(command: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            command: command.into(),
            args,
            timeout: None,
            stream_output: true,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn quiet(mut self) -> Self {
        self.stream_output = false;
        self
    }

    fn display(&self) -> String {
        std::iter::once(self.command.as_str())
            .chain(self.args.iter().map(String::as_str))
            .collect::<Vec<_>>()
            .join(" ")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProcessStatus {
    Running,
    Succeeded,
    Failed,
    Cancelled,
}

impl ProcessStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, ProcessStatus::Running)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ProcessStatus::Running => "running",
            ProcessStatus::Succeeded => "succeeded",
            ProcessStatus::Failed => "failed",
            ProcessStatus::Cancelled => "cancelled",
        }
    }
}

/// Point-in-time copy of a supervised process
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessSnapshot {
    pub id: ProcessId,
    pub plugin: String,
    pub mac: MacAddress,
    pub command: String,
    pub status: ProcessStatus,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub exit_code: Option<i32>,
    /// Most recent output lines, oldest first
    pub output: Vec<String>,
}

/// Completion notifications for the state machine
#[derive(Debug, Clone, PartialEq)]
pub enum SupervisorEvent {
    Finished(ProcessSnapshot),
}

struct ProcessEntry {
    plugin: String,
    mac: MacAddress,
    command: String,
    status: ProcessStatus,
    started_at: DateTime<Utc>,
    ended_at: Option<DateTime<Utc>>,
    exit_code: Option<i32>,
    output: VecDeque<String>,
    stream: bool,
    cancel: Option<oneshot::Sender<()>>,
    done: watch::Receiver<bool>,
}

impl ProcessEntry {
    fn snapshot(&self, id: ProcessId) -> ProcessSnapshot {
        ProcessSnapshot {
            id,
            plugin: self.plugin.clone(),
            mac: self.mac.clone(),
            command: self.command.clone(),
            status: self.status,
            started_at: self.started_at,
            ended_at: self.ended_at,
            exit_code: self.exit_code,
            output: self.output.iter().cloned().collect(),
        }
    }

    /// Flip to Cancelled and signal the worker. Returns false if already terminal.
    fn request_cancel(&mut self) -> bool {
        if self.status.is_terminal() {
            return false;
        }
        self.status = ProcessStatus::Cancelled;
        if let Some(tx) = self.cancel.take() {
            let _ = tx.send(());
        }
        true
    }
}

#[derive(Default)]
struct ProcessTable {
    entries: HashMap<ProcessId, ProcessEntry>,
    active: HashMap<(String, MacAddress), ProcessId>,
    next_id: ProcessId,
    closed: bool,
}

impl ProcessTable {
    fn release(&mut self, id: ProcessId) {
        if let Some(entry) = self.entries.get(&id) {
            let key = (entry.plugin.clone(), entry.mac.clone());
            if self.active.get(&key) == Some(&id) {
                self.active.remove(&key);
            }
        }
    }
}

struct Shared {
    table: Mutex<ProcessTable>,
    bus: AlertBus,
    events: mpsc::Sender<SupervisorEvent>,
    config: SupervisorConfig,
    store: Option<FingerprintStore>,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, ProcessTable> {
        self.table
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn record_line(&self, id: ProcessId, stream: OutputStream, line: String) {
        let log = {
            let mut table = self.lock();
            let Some(entry) = table.entries.get_mut(&id) else {
                return;
            };
            entry.output.push_back(line.clone());
            while entry.output.len() > self.config.output_buffer_lines {
                entry.output.pop_front();
            }
            entry.stream.then(|| PluginLogLine {
                level: AlertLevel::Info,
                plugin: entry.plugin.clone(),
                process_id: id,
                mac: entry.mac.clone(),
                stream,
                line,
                timestamp: Utc::now(),
            })
        };
        if let Some(log) = log {
            self.bus.log_line(log);
        }
    }
}

#[derive(Clone)]
pub struct ProcessSupervisor {
    shared: Arc<Shared>,
}

impl ProcessSupervisor {
    /// Build a supervisor and the receiver its completion events go to.
    /// `store`, when given, records one plugin log entry per finished process.
    pub fn new(
        config: SupervisorConfig,
        bus: AlertBus,
        store: Option<FingerprintStore>,
    ) -> (Self, mpsc::Receiver<SupervisorEvent>) {
        let (events, rx) = mpsc::channel(config.channel_capacity.max(1));
        let shared = Shared {
            table: Mutex::new(ProcessTable {
                next_id: 1,
                ..Default::default()
            }),
            bus,
            events,
            config,
            store,
        };
        (
            Self {
                shared: Arc::new(shared),
            },
            rx,
        )
    }

    /// Spawn `request` for `plugin` against the network `mac`
    pub fn start(
        &self,
        plugin: &str,
        mac: &MacAddress,
        request: ScanRequest,
    ) -> Result<ProcessId, SupervisorError> {
        let command_line = request.display();

        // The lock is held across spawn so two racing starts for the same
        // pair cannot both pass the duplicate check.
        let mut table = self.shared.lock();
        if table.closed {
            return Err(SupervisorError::Unavailable);
        }
        let key = (plugin.to_string(), mac.clone());
        if table.active.contains_key(&key) {
            debug!("[SUPERVISOR] Rejected duplicate {} scan on {}", plugin, mac);
            return Err(SupervisorError::DuplicateScan {
                plugin: plugin.to_string(),
                mac: mac.clone(),
            });
        }

        let spawned = Command::new(&request.command)
            .args(&request.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn();

        let child = match spawned {
            Ok(child) => child,
            Err(e) => {
                drop(table);
                error!("[SUPERVISOR] Failed to spawn '{}' for {}: {}", command_line, plugin, e);
                self.shared.bus.critical(
                    plugin,
                    format!("Could not start '{}': {}", command_line, e),
                );
                return Err(SupervisorError::Spawn {
                    plugin: plugin.to_string(),
                    command: command_line,
                    reason: e.to_string(),
                });
            }
        };

        let id = table.next_id;
        table.next_id += 1;

        let (cancel_tx, cancel_rx) = oneshot::channel();
        let (done_tx, done_rx) = watch::channel(false);
        table.entries.insert(
            id,
            ProcessEntry {
                plugin: plugin.to_string(),
                mac: mac.clone(),
                command: command_line.clone(),
                status: ProcessStatus::Running,
                started_at: Utc::now(),
                ended_at: None,
                exit_code: None,
                output: VecDeque::new(),
                stream: request.stream_output,
                cancel: Some(cancel_tx),
                done: done_rx,
            },
        );
        table.active.insert(key, id);
        drop(table);

        info!("[SUPERVISOR] Started #{} {} on {}: {}", id, plugin, mac, command_line);

        tokio::spawn(supervise(
            self.shared.clone(),
            id,
            child,
            cancel_rx,
            done_tx,
            request.timeout,
        ));

        Ok(id)
    }

    /// Terminate one process and wait (bounded) for it to be reaped
    pub async fn cancel(&self, id: ProcessId) -> Result<ProcessStatus, SupervisorError> {
        let done = {
            let mut table = self.shared.lock();
            let entry = table
                .entries
                .get_mut(&id)
                .ok_or(SupervisorError::UnknownProcess(id))?;
            if !entry.request_cancel() {
                return Ok(entry.status);
            }
            let done = entry.done.clone();
            table.release(id);
            done
        };
        info!("[SUPERVISOR] Cancelling #{}", id);
        self.wait_done(vec![done]).await;
        Ok(ProcessStatus::Cancelled)
    }

    /// Terminate every active process for `mac`.
    ///
    /// All of them are marked Cancelled before this returns; the call then
    /// waits up to the cancel grace period for the workers to reap them.
    pub async fn cancel_all(&self, mac: &MacAddress) -> Vec<ProcessId> {
        let (ids, dones) = {
            let mut table = self.shared.lock();
            let mut ids = Vec::new();
            let mut dones = Vec::new();
            for (id, entry) in table.entries.iter_mut() {
                if &entry.mac == mac && entry.request_cancel() {
                    ids.push(*id);
                    dones.push(entry.done.clone());
                }
            }
            for id in &ids {
                table.release(*id);
            }
            (ids, dones)
        };

        if !ids.is_empty() {
            info!("[SUPERVISOR] Cancelling {} process(es) on {}", ids.len(), mac);
            self.wait_done(dones).await;
        }
        ids
    }

    async fn wait_done(&self, dones: Vec<watch::Receiver<bool>>) {
        let grace = Duration::from_millis(self.shared.config.cancel_grace_ms);
        let all = async {
            for mut done in dones {
                let _ = done.wait_for(|finished| *finished).await;
            }
        };
        if tokio::time::timeout(grace, all).await.is_err() {
            warn!("[SUPERVISOR] Cancelled processes not reaped within {:?}", grace);
        }
    }

    pub fn status(&self, id: ProcessId) -> Result<ProcessSnapshot, SupervisorError> {
        self.shared
            .lock()
            .entries
            .get(&id)
            .map(|entry| entry.snapshot(id))
            .ok_or(SupervisorError::UnknownProcess(id))
    }

    /// Id of the process currently holding the (`plugin`, `mac`) pair
    pub fn active_process(&self, plugin: &str, mac: &MacAddress) -> Option<ProcessId> {
        self.shared
            .lock()
            .active
            .get(&(plugin.to_string(), mac.clone()))
            .copied()
    }

    /// Ids of processes still Running for `mac`
    pub fn running_for(&self, mac: &MacAddress) -> Vec<ProcessId> {
        let table = self.shared.lock();
        let mut ids: Vec<ProcessId> = table
            .entries
            .iter()
            .filter(|(_, e)| &e.mac == mac && e.status == ProcessStatus::Running)
            .map(|(id, _)| *id)
            .collect();
        ids.sort_unstable();
        ids
    }

    /// Drop a terminal process from the table
    pub fn reap(&self, id: ProcessId) -> Option<ProcessSnapshot> {
        let mut table = self.shared.lock();
        let terminal = table.entries.get(&id)?.status.is_terminal();
        if !terminal {
            return None;
        }
        table.entries.remove(&id).map(|entry| entry.snapshot(id))
    }

    /// Refuse new work and cancel everything still running
    pub async fn shutdown(&self) {
        let dones = {
            let mut table = self.shared.lock();
            table.closed = true;
            let mut dones = Vec::new();
            for entry in table.entries.values_mut() {
                if entry.request_cancel() {
                    dones.push(entry.done.clone());
                }
            }
            table.active.clear();
            dones
        };
        if !dones.is_empty() {
            info!("[SUPERVISOR] Shutting down, cancelling {} process(es)", dones.len());
        }
        self.wait_done(dones).await;
    }

    pub fn is_closed(&self) -> bool {
        self.shared.lock().closed
    }
}

enum Exit {
    Exited(std::io::Result<ExitStatus>),
    Cancelled,
    TimedOut(Duration),
}

type Line = (OutputStream, String);

async fn read_lines<R>(reader: R, stream: OutputStream, tx: mpsc::Sender<Line>)
where
    R: AsyncRead + Unpin,
{
    let mut lines = BufReader::new(reader).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        if tx.send((stream, line)).await.is_err() {
            break;
        }
    }
}

async fn supervise(
    shared: Arc<Shared>,
    id: ProcessId,
    mut child: Child,
    mut cancel_rx: oneshot::Receiver<()>,
    done_tx: watch::Sender<bool>,
    timeout: Option<Duration>,
) {
    let (line_tx, mut line_rx) = mpsc::channel::<Line>(shared.config.channel_capacity.max(1));
    let mut readers = Vec::new();
    if let Some(stdout) = child.stdout.take() {
        readers.push(tokio::spawn(read_lines(stdout, OutputStream::Stdout, line_tx.clone())));
    }
    if let Some(stderr) = child.stderr.take() {
        readers.push(tokio::spawn(read_lines(stderr, OutputStream::Stderr, line_tx.clone())));
    }
    drop(line_tx);

    let deadline = async {
        match timeout {
            Some(after) => tokio::time::sleep(after).await,
            None => std::future::pending::<()>().await,
        }
    };
    tokio::pin!(deadline);

    let mut lines_open = true;
    let exit = loop {
        tokio::select! {
            line = line_rx.recv(), if lines_open => match line {
                Some((stream, text)) => shared.record_line(id, stream, text),
                None => lines_open = false,
            },
            status = child.wait() => break Exit::Exited(status),
            _ = &mut cancel_rx => break Exit::Cancelled,
            _ = &mut deadline => break Exit::TimedOut(timeout.unwrap_or_default()),
        }
    };

    let grace = Duration::from_millis(shared.config.cancel_grace_ms);
    let (status, exit_code) = match exit {
        Exit::Exited(Ok(status)) => {
            // Pipes may still hold lines written just before exit
            let drain = async {
                while let Some((stream, text)) = line_rx.recv().await {
                    shared.record_line(id, stream, text);
                }
            };
            let _ = tokio::time::timeout(grace, drain).await;
            let outcome = if status.success() {
                ProcessStatus::Succeeded
            } else {
                ProcessStatus::Failed
            };
            (outcome, status.code())
        }
        Exit::Exited(Err(e)) => {
            warn!("[SUPERVISOR] Lost track of #{}: {}", id, e);
            (ProcessStatus::Failed, None)
        }
        Exit::Cancelled => {
            let _ = child.kill().await;
            drain_buffered(&shared, id, &mut line_rx);
            (ProcessStatus::Cancelled, None)
        }
        Exit::TimedOut(after) => {
            let _ = child.kill().await;
            drain_buffered(&shared, id, &mut line_rx);
            warn!("[SUPERVISOR] #{} timed out after {:?}", id, after);
            shared.record_line(
                id,
                OutputStream::Stderr,
                format!("killed after timeout of {}s", after.as_secs()),
            );
            (ProcessStatus::Failed, None)
        }
    };
    for reader in readers {
        reader.abort();
    }

    let snapshot = finish(&shared, id, status, exit_code);
    // Cancellers wait on `done`, not on the event queue
    let _ = done_tx.send(true);
    if let Some(snapshot) = snapshot {
        let _ = shared.events.send(SupervisorEvent::Finished(snapshot)).await;
    }
}

fn drain_buffered(shared: &Shared, id: ProcessId, line_rx: &mut mpsc::Receiver<Line>) {
    while let Ok((stream, text)) = line_rx.try_recv() {
        shared.record_line(id, stream, text);
    }
}

/// Settle the final status and raise the terminal alert. Returns the
/// snapshot to report to the state machine.
fn finish(
    shared: &Shared,
    id: ProcessId,
    status: ProcessStatus,
    exit_code: Option<i32>,
) -> Option<ProcessSnapshot> {
    let snapshot = {
        let mut table = shared.lock();
        table.release(id);
        let entry = table.entries.get_mut(&id)?;
        // A cancel that raced the exit wins
        if entry.status != ProcessStatus::Cancelled {
            entry.status = status;
        }
        entry.ended_at = Some(Utc::now());
        entry.exit_code = exit_code;
        entry.cancel = None;
        entry.snapshot(id)
    };

    let exit = exit_code
        .map(|c| c.to_string())
        .unwrap_or_else(|| "none".to_string());
    let message = format!(
        "'{}' on {} {} (exit {})",
        snapshot.command,
        snapshot.mac,
        snapshot.status.as_str(),
        exit
    );
    match snapshot.status {
        ProcessStatus::Failed => {
            warn!("[SUPERVISOR] #{} {}", id, message);
            shared.bus.warning(&snapshot.plugin, message.clone());
        }
        _ => {
            info!("[SUPERVISOR] #{} {}", id, message);
            shared.bus.info(&snapshot.plugin, message.clone());
        }
    }

    if let Some(store) = &shared.store {
        if let Err(e) = store.add_plugin_log(&snapshot.plugin, &message) {
            warn!("[SUPERVISOR] Failed to record plugin log for #{}: {}", id, e);
        }
    }

    Some(snapshot)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alert_bus::DashboardEvent;

    fn mac() -> MacAddress {
        MacAddress::parse("10:20:30:40:50:60").unwrap()
    }

    fn sh(script: &str) -> ScanRequest {
        ScanRequest::new("sh", vec!["-c".to_string(), script.to_string()])
    }

    fn supervisor() -> (ProcessSupervisor, mpsc::Receiver<SupervisorEvent>, AlertBus) {
        let bus = AlertBus::new(100, 256);
        let config = SupervisorConfig {
            cancel_grace_ms: 5_000,
            ..SupervisorConfig::default()
        };
        let (sup, rx) = ProcessSupervisor::new(config, bus.clone(), None);
        (sup, rx, bus)
    }

    async fn next_finished(rx: &mut mpsc::Receiver<SupervisorEvent>) -> ProcessSnapshot {
        match tokio::time::timeout(Duration::from_secs(10), rx.recv()).await {
            Ok(Some(SupervisorEvent::Finished(snapshot))) => snapshot,
            other => panic!("no completion event: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_output_streamed_in_order() {
        let (sup, mut rx, bus) = supervisor();
        let mut sub = bus.subscribe();

        let id = sup
            .start("echoer", &mac(), sh("for i in 1 2 3 4 5; do echo line$i; done"))
            .unwrap();
        let done = next_finished(&mut rx).await;
        assert_eq!(done.id, id);
        assert_eq!(done.status, ProcessStatus::Succeeded);
        assert_eq!(done.exit_code, Some(0));
        assert_eq!(done.output, vec!["line1", "line2", "line3", "line4", "line5"]);

        let mut streamed = Vec::new();
        let mut terminal_alert = None;
        while let Ok(event) = sub.receiver.try_recv() {
            match event {
                DashboardEvent::PluginLog(log) => {
                    assert_eq!(log.plugin, "echoer");
                    assert_eq!(log.level, AlertLevel::Info);
                    streamed.push(log.line);
                }
                DashboardEvent::Alert(alert) => terminal_alert = Some(alert),
                _ => {}
            }
        }
        assert_eq!(streamed, done.output);
        assert_eq!(terminal_alert.map(|a| a.level), Some(AlertLevel::Info));
    }

    #[tokio::test]
    async fn test_nonzero_exit_is_failed_with_warning() {
        let (sup, mut rx, bus) = supervisor();
        sup.start("broken", &mac(), sh("echo oops >&2; exit 3")).unwrap();
        let done = next_finished(&mut rx).await;
        assert_eq!(done.status, ProcessStatus::Failed);
        assert_eq!(done.exit_code, Some(3));
        assert_eq!(done.output, vec!["oops"]);

        let last = bus.alerts().pop().unwrap();
        assert_eq!(last.level, AlertLevel::Warning);
        assert_eq!(last.category, "broken");
    }

    #[tokio::test]
    async fn test_duplicate_scan_rejected() {
        let (sup, _rx, bus) = supervisor();
        let first = sup.start("nmap", &mac(), sh("sleep 5"));
        let second = sup.start("nmap", &mac(), sh("sleep 5"));
        assert!(first.is_ok());
        assert!(matches!(second, Err(SupervisorError::DuplicateScan { .. })));
        // Rejections are returned to the caller, not alerted
        assert!(bus.alerts().is_empty());

        // Another plugin on the same network is fine
        assert!(sup.start("arpscan", &mac(), sh("sleep 5")).is_ok());
        sup.shutdown().await;
    }

    #[tokio::test]
    async fn test_cancel_all_leaves_nothing_running() {
        let (sup, mut rx, _bus) = supervisor();
        let other = MacAddress::parse("AA:AA:AA:AA:AA:AA").unwrap();
        sup.start("a", &mac(), sh("sleep 30")).unwrap();
        sup.start("b", &mac(), sh("sleep 30")).unwrap();
        let survivor = sup.start("a", &other, sh("sleep 30")).unwrap();

        let cancelled = sup.cancel_all(&mac()).await;
        assert_eq!(cancelled.len(), 2);
        assert!(sup.running_for(&mac()).is_empty());
        for id in &cancelled {
            assert_eq!(sup.status(*id).unwrap().status, ProcessStatus::Cancelled);
        }
        assert_eq!(sup.running_for(&other), vec![survivor]);

        for _ in 0..2 {
            assert_eq!(next_finished(&mut rx).await.status, ProcessStatus::Cancelled);
        }
        // The pair is free again
        assert!(sup.start("a", &mac(), sh("true")).is_ok());
        sup.shutdown().await;
    }

    #[tokio::test]
    async fn test_cancel_single_process() {
        let (sup, mut rx, _bus) = supervisor();
        let target = sup.start("nmap", &mac(), sh("sleep 30")).unwrap();
        let neighbour = sup.start("arpscan", &mac(), sh("sleep 30")).unwrap();
        assert_eq!(sup.active_process("nmap", &mac()), Some(target));

        assert_eq!(sup.cancel(target).await, Ok(ProcessStatus::Cancelled));
        assert_eq!(sup.status(target).unwrap().status, ProcessStatus::Cancelled);
        assert_eq!(sup.running_for(&mac()), vec![neighbour]);
        assert_eq!(sup.active_process("nmap", &mac()), None);

        // The pair is free for a new start
        let again = sup.start("nmap", &mac(), sh("true")).unwrap();
        assert_ne!(again, target);

        // Terminal processes report their real status
        let mut finished = Vec::new();
        while finished.len() < 2 {
            finished.push(next_finished(&mut rx).await);
        }
        let quick = finished.iter().find(|s| s.id == again).unwrap();
        assert_eq!(quick.status, ProcessStatus::Succeeded);
        assert_eq!(sup.cancel(again).await, Ok(ProcessStatus::Succeeded));
        assert_eq!(sup.cancel(target).await, Ok(ProcessStatus::Cancelled));

        assert_eq!(sup.cancel(9_999).await, Err(SupervisorError::UnknownProcess(9_999)));
        sup.shutdown().await;
    }

    #[tokio::test]
    async fn test_cancel_not_blocked_by_full_event_queue() {
        let bus = AlertBus::new(100, 256);
        let config = SupervisorConfig {
            channel_capacity: 1,
            cancel_grace_ms: 5_000,
            ..SupervisorConfig::default()
        };
        let (sup, mut rx) = ProcessSupervisor::new(config, bus, None);
        for plugin in ["a", "b", "c"] {
            sup.start(plugin, &mac(), sh("sleep 30")).unwrap();
        }

        // Nobody drains completions while cancelling
        let started = std::time::Instant::now();
        let cancelled = sup.cancel_all(&mac()).await;
        assert_eq!(cancelled.len(), 3);
        assert!(started.elapsed() < Duration::from_secs(3), "{:?}", started.elapsed());

        for _ in 0..3 {
            assert_eq!(next_finished(&mut rx).await.status, ProcessStatus::Cancelled);
        }
    }

    #[tokio::test]
    async fn test_timeout_kills_process() {
        let (sup, mut rx, _bus) = supervisor();
        sup.start("slow", &mac(), sh("sleep 30").with_timeout(Duration::from_millis(200)))
            .unwrap();
        let done = next_finished(&mut rx).await;
        assert_eq!(done.status, ProcessStatus::Failed);
        assert!(done.output.last().unwrap().contains("timeout"));
    }

    #[tokio::test]
    async fn test_spawn_failure_raises_critical() {
        let (sup, _rx, bus) = supervisor();
        let err = sup
            .start("ghost", &mac(), ScanRequest::new("/nonexistent/netfang-tool", vec![]))
            .unwrap_err();
        assert!(matches!(err, SupervisorError::Spawn { .. }));
        assert_eq!(bus.alerts()[0].level, AlertLevel::Critical);
        assert!(sup.running_for(&mac()).is_empty());
    }

    #[tokio::test]
    async fn test_reap_only_terminal() {
        let (sup, mut rx, _bus) = supervisor();
        let running = sup.start("a", &mac(), sh("sleep 30")).unwrap();
        assert!(sup.reap(running).is_none());

        let quick = sup.start("b", &mac(), sh("true")).unwrap();
        next_finished(&mut rx).await;
        assert_eq!(sup.reap(quick).map(|s| s.status), Some(ProcessStatus::Succeeded));
        assert!(matches!(sup.status(quick), Err(SupervisorError::UnknownProcess(_))));
        sup.shutdown().await;
    }

    #[tokio::test]
    async fn test_shutdown_refuses_new_work() {
        let (sup, _rx, _bus) = supervisor();
        sup.shutdown().await;
        assert!(sup.is_closed());
        assert_eq!(
            sup.start("a", &mac(), sh("true")),
            Err(SupervisorError::Unavailable)
        );
    }
}
