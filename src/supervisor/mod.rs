//! Process Supervisor
//!
//! Launches inference subprocesses, streams their output, detects
//! readiness and enforces shutdown.
//!
//! Every child goes into a fresh process group. Stdout and stderr are read
//! line by line into a bounded ring and fanned out to subscribers; a line
//! containing the readiness sentinel flips the model to loaded. Stop sends
//! SIGTERM to the group and escalates to SIGKILL after a grace period.
//! Process records are keyed by model ID; a terminated record survives for
//! inspection until the next start for the same model replaces it.

pub mod launch;

use std::collections::{HashMap, VecDeque};
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tokio::sync::{broadcast, mpsc, watch, Mutex, RwLock};
use tracing::{error, info, warn};

use crate::config::SupervisorSection;

/// Byte budget for the retained stderr tail
const STDERR_TAIL_BYTES: usize = 10 * 1024;

/// Buffer size for per-subscriber output channels
const SUBSCRIBER_BUFFER: usize = 256;

/// Errors from the process supervisor
#[derive(Error, Debug)]
pub enum SupervisorError {
    #[error("Model '{0}' already has a live process")]
    Conflict(String),

    #[error("Port {0} is held by another supervised process")]
    PortInUse(u16),

    #[error("No free port in range {0}..={1}")]
    PortExhausted(u16, u16),

    #[error("No process record for model '{0}'")]
    NotFound(String),

    #[error("Failed to spawn subprocess: {0}")]
    SpawnFailed(String),

    #[error("Model '{0}' failed to become ready: {1}")]
    ReadyFailed(String, String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
}

/// Lifecycle state of a supervised model process
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ModelState {
    #[default]
    Stopped,
    Loading,
    Loaded,
    Running,
    Error,
}

/// Authoritative status of a model on this node
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ModelStatus {
    /// Current lifecycle state
    pub state: ModelState,

    /// Port the subprocess serves on, while one exists
    #[serde(skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,

    /// Subprocess PID, while one exists
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pid: Option<u32>,

    /// When the subprocess was launched
    #[serde(rename = "startedAt")]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,

    /// Last failure description
    #[serde(rename = "lastError")]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,

    /// Effective launch parameter set
    #[serde(rename = "loadParams")]
    #[serde(default)]
    pub load_params: HashMap<String, Value>,
}

/// Lifecycle events observed per model, in (started, ready, exited) order
#[derive(Debug, Clone)]
pub enum ProcessEvent {
    Started {
        model_id: String,
        pid: u32,
        port: u16,
    },
    Ready {
        model_id: String,
        port: u16,
    },
    Exited {
        model_id: String,
        exit_code: Option<i32>,
        expected: bool,
    },
}

/// Readiness signal for a launched process
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReadySignal {
    Pending,
    Ready,
    Failed(String),
}

/// Everything needed to launch one subprocess
#[derive(Debug, Clone)]
pub struct LaunchSpec {
    /// Model ID the process record is keyed by
    pub model_id: String,

    /// Absolute path to the binary
    pub binary_path: PathBuf,

    /// Arguments, excluding the binary name
    pub args: Vec<String>,

    /// Extra environment variables
    pub env: HashMap<String, String>,

    /// Pinned port; the supervisor allocates one when absent
    pub port: Option<u16>,

    /// Readiness sentinel; `None` skips readiness tracking and the process
    /// counts as running once spawned
    pub ready_sentinel: Option<String>,

    /// Recorded on the model status as the effective parameter set
    pub load_params: HashMap<String, Value>,
}

impl LaunchSpec {
    /// A spec with no args and no pinned port
    pub fn new(model_id: impl Into<String>, binary_path: impl Into<PathBuf>) -> Self {
        Self {
            model_id: model_id.into(),
            binary_path: binary_path.into(),
            args: Vec::new(),
            env: HashMap::new(),
            port: None,
            ready_sentinel: None,
            load_params: HashMap::new(),
        }
    }

    /// Set the argument vector
    pub fn with_args(mut self, args: Vec<String>) -> Self {
        self.args = args;
        self
    }

    /// Pin the port
    pub fn with_port(mut self, port: u16) -> Self {
        self.port = Some(port);
        self
    }

    /// Set the readiness sentinel
    pub fn with_sentinel(mut self, sentinel: impl Into<String>) -> Self {
        self.ready_sentinel = Some(sentinel.into());
        self
    }
}

/// Result of a successful launch
#[derive(Debug, Clone, Copy, Serialize)]
pub struct StartedProcess {
    pub pid: u32,
    pub port: u16,
}

/// Summary row for `list`
#[derive(Debug, Clone, Serialize)]
pub struct ProcessInfo {
    #[serde(rename = "modelId")]
    pub model_id: String,
    pub pid: u32,
    pub port: u16,
    pub state: ModelState,
    #[serde(rename = "startedAt")]
    pub started_at: DateTime<Utc>,
}

/// Output ring plus fan-out state, single-writer multi-reader
struct OutputFan {
    ring: VecDeque<String>,
    cap: usize,
    subscribers: Vec<mpsc::Sender<String>>,
    stderr_tail: VecDeque<String>,
    stderr_bytes: usize,
}

impl OutputFan {
    fn new(cap: usize) -> Self {
        Self {
            ring: VecDeque::new(),
            cap,
            subscribers: Vec::new(),
            stderr_tail: VecDeque::new(),
            stderr_bytes: 0,
        }
    }

    fn push(&mut self, line: String, is_stderr: bool) {
        if is_stderr {
            self.stderr_bytes += line.len();
            self.stderr_tail.push_back(line.clone());
            while self.stderr_bytes > STDERR_TAIL_BYTES {
                if let Some(old) = self.stderr_tail.pop_front() {
                    self.stderr_bytes -= old.len();
                } else {
                    break;
                }
            }
        }

        self.ring.push_back(line.clone());
        while self.ring.len() > self.cap {
            self.ring.pop_front();
        }

        // Non-blocking fan-out: a full subscriber drops this line.
        self.subscribers.retain(|tx| {
            !matches!(
                tx.try_send(line.clone()),
                Err(mpsc::error::TrySendError::Closed(_))
            )
        });
    }

    fn stderr_tail_string(&self) -> String {
        self.stderr_tail
            .iter()
            .cloned()
            .collect::<Vec<_>>()
            .join("\n")
    }
}

/// Shared mutable state of one supervised process
struct ProcessShared {
    model_id: String,
    status: RwLock<ModelStatus>,
    output: Mutex<OutputFan>,
    stopping: AtomicBool,
}

/// One record in the process map
struct ProcessEntry {
    pid: u32,
    port: u16,
    started_at: DateTime<Utc>,
    shared: Arc<ProcessShared>,
    ready_rx: watch::Receiver<ReadySignal>,
    done_rx: watch::Receiver<bool>,
}

impl ProcessEntry {
    fn is_live(&self) -> bool {
        !*self.done_rx.borrow()
    }
}

/// The process supervisor
pub struct ProcessSupervisor {
    config: SupervisorSection,
    processes: DashMap<String, ProcessEntry>,
    reserved_ports: Mutex<Vec<u16>>,
    events_tx: broadcast::Sender<ProcessEvent>,
}

impl ProcessSupervisor {
    /// Create a supervisor
    pub fn new(config: SupervisorSection) -> Self {
        let (events_tx, _) = broadcast::channel(256);
        Self {
            config,
            processes: DashMap::new(),
            reserved_ports: Mutex::new(Vec::new()),
            events_tx,
        }
    }

    /// Subscribe to process lifecycle events
    pub fn events(&self) -> broadcast::Receiver<ProcessEvent> {
        self.events_tx.subscribe()
    }

    /// The configured default readiness sentinel
    pub fn default_sentinel(&self) -> &str {
        &self.config.ready_sentinel
    }

    /// Launch a subprocess for a model
    ///
    /// Rejects a second start while a process for the same model is live.
    /// When no port is pinned, the lowest unused port in the configured
    /// range is allocated.
    pub async fn start(&self, spec: LaunchSpec) -> Result<StartedProcess, SupervisorError> {
        if let Some(existing) = self.processes.get(&spec.model_id) {
            if existing.is_live() {
                return Err(SupervisorError::Conflict(spec.model_id));
            }
        }

        let port = self.allocate_port(spec.port).await?;

        let mut command = Command::new(&spec.binary_path);
        command
            .args(&spec.args)
            .envs(&spec.env)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .process_group(0);

        let mut child = command
            .spawn()
            .map_err(|e| SupervisorError::SpawnFailed(format!("{}: {}", spec.binary_path.display(), e)))?;
        let pid = child
            .id()
            .ok_or_else(|| SupervisorError::SpawnFailed("child exited immediately".to_string()))?;

        let track_readiness = spec.ready_sentinel.is_some();
        let initial_state = if track_readiness {
            ModelState::Loading
        } else {
            ModelState::Running
        };

        let shared = Arc::new(ProcessShared {
            model_id: spec.model_id.clone(),
            status: RwLock::new(ModelStatus {
                state: initial_state,
                port: Some(port),
                pid: Some(pid),
                started_at: Some(Utc::now()),
                last_error: None,
                load_params: spec.load_params.clone(),
            }),
            output: Mutex::new(OutputFan::new(self.config.output_ring_size)),
            stopping: AtomicBool::new(false),
        });

        let initial_ready = if track_readiness {
            ReadySignal::Pending
        } else {
            ReadySignal::Ready
        };
        let (ready_tx, ready_rx) = watch::channel(initial_ready);
        let (done_tx, done_rx) = watch::channel(false);

        self.processes.insert(
            spec.model_id.clone(),
            ProcessEntry {
                pid,
                port,
                started_at: Utc::now(),
                shared: Arc::clone(&shared),
                ready_rx: ready_rx.clone(),
                done_rx: done_rx.clone(),
            },
        );

        info!(
            model = %spec.model_id,
            pid,
            port,
            binary = %spec.binary_path.display(),
            "Subprocess launched"
        );
        let _ = self.events_tx.send(ProcessEvent::Started {
            model_id: spec.model_id.clone(),
            pid,
            port,
        });

        // Output pumps: one per stream, both feeding the same ring.
        let stdout = child.stdout.take();
        let stderr = child.stderr.take();
        let sentinel = spec.ready_sentinel.clone();
        let ready_tx = Arc::new(ready_tx);

        if let Some(stdout) = stdout {
            tokio::spawn(Self::pump_stream(
                stdout,
                false,
                Arc::clone(&shared),
                sentinel.clone(),
                Arc::clone(&ready_tx),
                self.events_tx.clone(),
                port,
            ));
        }
        if let Some(stderr) = stderr {
            tokio::spawn(Self::pump_stream(
                stderr,
                true,
                Arc::clone(&shared),
                sentinel.clone(),
                Arc::clone(&ready_tx),
                self.events_tx.clone(),
                port,
            ));
        }

        // Readiness watchdog: kill the process when the sentinel never shows.
        if track_readiness {
            let watchdog_shared = Arc::clone(&shared);
            let watchdog_ready = ready_rx.clone();
            let watchdog_done = done_rx.clone();
            let watchdog_tx = Arc::clone(&ready_tx);
            let timeout = Duration::from_secs(self.config.ready_timeout_secs);
            tokio::spawn(async move {
                Self::ready_watchdog(watchdog_shared, watchdog_ready, watchdog_done, watchdog_tx, timeout, pid)
                    .await;
            });
        }

        // Reaper: records the exit status and classifies the exit.
        let reaper_shared = Arc::clone(&shared);
        let reaper_ready = Arc::clone(&ready_tx);
        let events = self.events_tx.clone();
        tokio::spawn(async move {
            let exit = child.wait().await;
            let exit_code = exit.as_ref().ok().and_then(|s| s.code());
            let expected = reaper_shared.stopping.load(Ordering::SeqCst);

            {
                let mut status = reaper_shared.status.write().await;
                status.pid = None;
                if expected {
                    status.state = ModelState::Stopped;
                    status.port = None;
                } else {
                    status.state = ModelState::Error;
                    status.last_error = Some(match exit_code {
                        Some(code) => format!("exited unexpectedly with status {}", code),
                        None => "terminated by signal".to_string(),
                    });
                }
            }

            let _ = reaper_ready.send(if expected {
                ReadySignal::Failed("stopped".to_string())
            } else {
                ReadySignal::Failed("process exited before ready".to_string())
            });

            if !expected {
                warn!(
                    model = %reaper_shared.model_id,
                    code = ?exit_code,
                    "Subprocess exited unexpectedly"
                );
            }
            let _ = events.send(ProcessEvent::Exited {
                model_id: reaper_shared.model_id.clone(),
                exit_code,
                expected,
            });
            let _ = done_tx.send(true);
        });

        Ok(StartedProcess { pid, port })
    }

    async fn pump_stream<R>(
        stream: R,
        is_stderr: bool,
        shared: Arc<ProcessShared>,
        sentinel: Option<String>,
        ready_tx: Arc<watch::Sender<ReadySignal>>,
        events: broadcast::Sender<ProcessEvent>,
        port: u16,
    ) where
        R: tokio::io::AsyncRead + Unpin + Send + 'static,
    {
        let mut lines = BufReader::new(stream).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            if let Some(ref needle) = sentinel {
                let pending = *ready_tx.borrow() == ReadySignal::Pending;
                if pending && line.contains(needle.as_str()) {
                    let mut status = shared.status.write().await;
                    status.state = ModelState::Loaded;
                    drop(status);
                    let _ = ready_tx.send(ReadySignal::Ready);
                    info!(model = %shared.model_id, "Readiness sentinel observed");
                    let _ = events.send(ProcessEvent::Ready {
                        model_id: shared.model_id.clone(),
                        port,
                    });
                }
            }
            shared.output.lock().await.push(line, is_stderr);
        }
    }

    async fn ready_watchdog(
        shared: Arc<ProcessShared>,
        mut ready_rx: watch::Receiver<ReadySignal>,
        mut done_rx: watch::Receiver<bool>,
        ready_tx: Arc<watch::Sender<ReadySignal>>,
        timeout: Duration,
        pid: u32,
    ) {
        let deadline = tokio::time::sleep(timeout);
        tokio::pin!(deadline);

        loop {
            tokio::select! {
                _ = &mut deadline => {
                    if *ready_rx.borrow() == ReadySignal::Pending {
                        error!(model = %shared.model_id, "Readiness timeout, killing subprocess");
                        {
                            let mut status = shared.status.write().await;
                            status.state = ModelState::Error;
                            status.last_error = Some("readiness timeout".to_string());
                        }
                        let _ = ready_tx.send(ReadySignal::Failed("readiness timeout".to_string()));
                        signal_group(pid, libc::SIGKILL);
                    }
                    return;
                }
                changed = ready_rx.changed() => {
                    if changed.is_err() || *ready_rx.borrow() != ReadySignal::Pending {
                        return;
                    }
                }
                _ = done_rx.changed() => {
                    if *done_rx.borrow() {
                        return;
                    }
                }
            }
        }
    }

    /// Wait for the readiness signal of a launched model
    pub async fn await_ready(&self, model_id: &str) -> Result<u16, SupervisorError> {
        let (mut ready_rx, port) = {
            let entry = self
                .processes
                .get(model_id)
                .ok_or_else(|| SupervisorError::NotFound(model_id.to_string()))?;
            (entry.ready_rx.clone(), entry.port)
        };

        loop {
            match ready_rx.borrow_and_update().clone() {
                ReadySignal::Ready => return Ok(port),
                ReadySignal::Failed(reason) => {
                    return Err(SupervisorError::ReadyFailed(model_id.to_string(), reason))
                }
                ReadySignal::Pending => {}
            }
            if ready_rx.changed().await.is_err() {
                return Err(SupervisorError::ReadyFailed(
                    model_id.to_string(),
                    "supervisor dropped the process".to_string(),
                ));
            }
        }
    }

    /// Stop a model's subprocess
    ///
    /// SIGTERM to the process group, SIGKILL after the grace period;
    /// `force` skips the grace. Returns once the process is reaped.
    pub async fn stop(&self, model_id: &str, force: bool) -> Result<(), SupervisorError> {
        let (pid, mut done_rx, shared) = {
            let entry = self
                .processes
                .get(model_id)
                .ok_or_else(|| SupervisorError::NotFound(model_id.to_string()))?;
            (entry.pid, entry.done_rx.clone(), Arc::clone(&entry.shared))
        };

        if *done_rx.borrow() {
            return Ok(()); // already reaped
        }

        shared.stopping.store(true, Ordering::SeqCst);
        info!(model = %model_id, pid, force, "Stopping subprocess");

        if force {
            signal_group(pid, libc::SIGKILL);
        } else {
            signal_group(pid, libc::SIGTERM);
        }

        let grace = Duration::from_secs(self.config.term_grace_secs);
        if !force && !wait_done(&mut done_rx, grace).await {
            warn!(model = %model_id, pid, "Grace period elapsed, sending SIGKILL");
            signal_group(pid, libc::SIGKILL);
        }

        // SIGKILL cannot be ignored; the reaper completes promptly.
        if !wait_done(&mut done_rx, grace).await {
            error!(model = %model_id, pid, "Subprocess did not reap after SIGKILL");
        }

        Ok(())
    }

    /// Summaries of all known process records, terminated ones included
    pub async fn list(&self) -> Vec<ProcessInfo> {
        let mut infos = Vec::with_capacity(self.processes.len());
        for entry in self.processes.iter() {
            let status = entry.shared.status.read().await;
            infos.push(ProcessInfo {
                model_id: entry.key().clone(),
                pid: entry.pid,
                port: entry.port,
                state: status.state,
                started_at: entry.started_at,
            });
        }
        infos.sort_by(|a, b| a.model_id.cmp(&b.model_id));
        infos
    }

    /// The authoritative status of a model, if a record exists
    pub async fn status(&self, model_id: &str) -> Option<ModelStatus> {
        let shared = Arc::clone(&self.processes.get(model_id)?.shared);
        let status = shared.status.read().await.clone();
        Some(status)
    }

    /// Whether a live process exists for the model
    pub fn is_live(&self, model_id: &str) -> bool {
        self.processes
            .get(model_id)
            .map(|e| e.is_live())
            .unwrap_or(false)
    }

    /// Number of live processes
    pub fn live_count(&self) -> usize {
        self.processes.iter().filter(|e| e.is_live()).count()
    }

    /// Subscribe to a model's output lines
    ///
    /// Delivery is non-blocking; a slow subscriber loses lines.
    pub async fn stream_output(
        &self,
        model_id: &str,
    ) -> Result<mpsc::Receiver<String>, SupervisorError> {
        let entry = self
            .processes
            .get(model_id)
            .ok_or_else(|| SupervisorError::NotFound(model_id.to_string()))?;
        let (tx, rx) = mpsc::channel(SUBSCRIBER_BUFFER);
        entry.shared.output.lock().await.subscribers.push(tx);
        Ok(rx)
    }

    /// The last `n` retained output lines of a model
    pub async fn output_tail(&self, model_id: &str, n: usize) -> Vec<String> {
        match self.processes.get(model_id) {
            Some(entry) => {
                let fan = entry.shared.output.lock().await;
                fan.ring.iter().rev().take(n).rev().cloned().collect()
            }
            None => Vec::new(),
        }
    }

    /// The retained stderr tail of a model
    pub async fn stderr_tail(&self, model_id: &str) -> String {
        match self.processes.get(model_id) {
            Some(entry) => entry.shared.output.lock().await.stderr_tail_string(),
            None => String::new(),
        }
    }

    /// Stop every live process; used during node shutdown
    pub async fn shutdown_all(&self) {
        let live: Vec<String> = self
            .processes
            .iter()
            .filter(|e| e.is_live())
            .map(|e| e.key().clone())
            .collect();

        for model_id in live {
            if let Err(e) = self.stop(&model_id, false).await {
                error!(model = %model_id, "Failed to stop subprocess: {}", e);
            }
        }
    }

    /// Pick a port: the pinned one when valid, otherwise the lowest unused
    ///
    /// A pinned port also consumes its reservation, so callers that
    /// reserved ahead of time hand the port straight back in.
    async fn allocate_port(&self, pinned: Option<u16>) -> Result<u16, SupervisorError> {
        let mut reserved = self.reserved_ports.lock().await;
        self.pick_port(pinned, &mut reserved)
    }

    fn pick_port(
        &self,
        pinned: Option<u16>,
        reserved: &mut Vec<u16>,
    ) -> Result<u16, SupervisorError> {
        let used: Vec<u16> = self
            .processes
            .iter()
            .filter(|e| e.is_live())
            .map(|e| e.port)
            .collect();

        if let Some(port) = pinned {
            reserved.retain(|p| *p != port);
            if used.contains(&port) {
                return Err(SupervisorError::PortInUse(port));
            }
            return Ok(port);
        }

        (self.config.port_range_start..=self.config.port_range_end)
            .find(|p| !used.contains(p) && !reserved.contains(p))
            .ok_or(SupervisorError::PortExhausted(
                self.config.port_range_start,
                self.config.port_range_end,
            ))
    }

    /// Reserve a port ahead of a start, for callers that must bake the
    /// port into the argument vector before launching
    pub async fn reserve_port(&self, pinned: Option<u16>) -> Result<u16, SupervisorError> {
        let mut reserved = self.reserved_ports.lock().await;
        let port = self.pick_port(pinned, &mut reserved)?;
        reserved.push(port);
        Ok(port)
    }

    /// Release a reservation that will not be used after all
    pub async fn release_port(&self, port: u16) {
        self.reserved_ports.lock().await.retain(|p| *p != port);
    }
}

/// Signal an entire process group
fn signal_group(pid: u32, signal: i32) {
    // The child was placed in a fresh group whose pgid equals its pid.
    unsafe {
        libc::kill(-(pid as i32), signal);
    }
}

async fn wait_done(done_rx: &mut watch::Receiver<bool>, timeout: Duration) -> bool {
    if *done_rx.borrow() {
        return true;
    }
    tokio::time::timeout(timeout, async {
        while done_rx.changed().await.is_ok() {
            if *done_rx.borrow() {
                return;
            }
        }
    })
    .await
    .is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config() -> SupervisorSection {
        SupervisorSection {
            port_range_start: 8081,
            port_range_end: 8090,
            ready_sentinel: "all slots are idle".to_string(),
            ready_timeout_secs: 600,
            term_grace_secs: 2,
            output_ring_size: 50,
        }
    }

    fn sh_spec(model_id: &str, script: &str) -> LaunchSpec {
        LaunchSpec::new(model_id, "/bin/sh").with_args(vec!["-c".to_string(), script.to_string()])
    }

    #[tokio::test]
    async fn test_ready_on_sentinel() {
        let supervisor = Arc::new(ProcessSupervisor::new(test_config()));
        let spec = sh_spec("m1", "echo starting; echo 'all slots are idle'; sleep 30")
            .with_sentinel("all slots are idle");

        let started = supervisor.start(spec).await.unwrap();
        assert_eq!(started.port, 8081);

        let port = supervisor.await_ready("m1").await.unwrap();
        assert_eq!(port, 8081);

        let status = supervisor.status("m1").await.unwrap();
        assert_eq!(status.state, ModelState::Loaded);
        assert_eq!(status.port, Some(8081));

        supervisor.stop("m1", true).await.unwrap();
    }

    #[tokio::test]
    async fn test_conflict_while_live() {
        let supervisor = Arc::new(ProcessSupervisor::new(test_config()));
        supervisor
            .start(sh_spec("m1", "sleep 30"))
            .await
            .unwrap();

        let result = supervisor.start(sh_spec("m1", "sleep 30")).await;
        assert!(matches!(result, Err(SupervisorError::Conflict(_))));

        supervisor.stop("m1", true).await.unwrap();
    }

    #[tokio::test]
    async fn test_restart_after_exit() {
        let supervisor = Arc::new(ProcessSupervisor::new(test_config()));
        supervisor.start(sh_spec("m1", "sleep 30")).await.unwrap();
        supervisor.stop("m1", true).await.unwrap();

        // Terminated record is replaced by the next start.
        supervisor.start(sh_spec("m1", "sleep 30")).await.unwrap();
        assert!(supervisor.is_live("m1"));
        supervisor.stop("m1", true).await.unwrap();
    }

    #[tokio::test]
    async fn test_stop_records_stopped_state() {
        let supervisor = Arc::new(ProcessSupervisor::new(test_config()));
        supervisor.start(sh_spec("m1", "sleep 30")).await.unwrap();
        supervisor.stop("m1", false).await.unwrap();

        let status = supervisor.status("m1").await.unwrap();
        assert_eq!(status.state, ModelState::Stopped);
        assert!(status.pid.is_none());
        assert!(!supervisor.is_live("m1"));
    }

    #[tokio::test]
    async fn test_unexpected_exit_is_error_with_stderr() {
        let supervisor = Arc::new(ProcessSupervisor::new(test_config()));
        supervisor
            .start(sh_spec("m1", "echo boom >&2; exit 3"))
            .await
            .unwrap();

        // Wait for the reaper.
        let mut done = supervisor.processes.get("m1").unwrap().done_rx.clone();
        wait_done(&mut done, Duration::from_secs(5)).await;

        let status = supervisor.status("m1").await.unwrap();
        assert_eq!(status.state, ModelState::Error);
        assert!(status
            .last_error
            .as_deref()
            .unwrap()
            .contains("status 3"));
        assert_eq!(supervisor.stderr_tail("m1").await, "boom");
    }

    #[tokio::test]
    async fn test_port_allocation_lowest_unused() {
        let supervisor = Arc::new(ProcessSupervisor::new(test_config()));
        let a = supervisor.start(sh_spec("m1", "sleep 30")).await.unwrap();
        let b = supervisor.start(sh_spec("m2", "sleep 30")).await.unwrap();

        assert_eq!(a.port, 8081);
        assert_eq!(b.port, 8082);

        // Freeing the lower port makes it the next allocation.
        supervisor.stop("m1", true).await.unwrap();
        let c = supervisor.start(sh_spec("m3", "sleep 30")).await.unwrap();
        assert_eq!(c.port, 8081);

        supervisor.stop("m2", true).await.unwrap();
        supervisor.stop("m3", true).await.unwrap();
    }

    #[tokio::test]
    async fn test_pinned_port_conflict() {
        let supervisor = Arc::new(ProcessSupervisor::new(test_config()));
        supervisor
            .start(sh_spec("m1", "sleep 30").with_port(8085))
            .await
            .unwrap();

        let result = supervisor
            .start(sh_spec("m2", "sleep 30").with_port(8085))
            .await;
        assert!(matches!(result, Err(SupervisorError::PortInUse(8085))));

        supervisor.stop("m1", true).await.unwrap();
    }

    #[tokio::test]
    async fn test_output_ring_and_stream() {
        let supervisor = Arc::new(ProcessSupervisor::new(test_config()));
        let mut rx = {
            supervisor
                .start(sh_spec("m1", "echo one; echo two; sleep 30"))
                .await
                .unwrap();
            supervisor.stream_output("m1").await.unwrap()
        };

        let first = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert!(first == "one" || first == "two");

        // Give the pump a moment to drain both lines into the ring.
        tokio::time::sleep(Duration::from_millis(200)).await;
        let tail = supervisor.output_tail("m1", 10).await;
        assert!(tail.contains(&"one".to_string()));
        assert!(tail.contains(&"two".to_string()));

        supervisor.stop("m1", true).await.unwrap();
    }

    #[tokio::test]
    async fn test_ready_timeout_kills_process() {
        let mut config = test_config();
        config.ready_timeout_secs = 1;
        let supervisor = Arc::new(ProcessSupervisor::new(config));

        supervisor
            .start(sh_spec("m1", "sleep 30").with_sentinel("never printed"))
            .await
            .unwrap();

        let result = supervisor.await_ready("m1").await;
        assert!(matches!(result, Err(SupervisorError::ReadyFailed(_, _))));

        let status = supervisor.status("m1").await.unwrap();
        assert_eq!(status.state, ModelState::Error);
    }

    #[tokio::test]
    async fn test_no_sentinel_means_running() {
        let supervisor = Arc::new(ProcessSupervisor::new(test_config()));
        supervisor.start(sh_spec("m1", "sleep 30")).await.unwrap();

        let status = supervisor.status("m1").await.unwrap();
        assert_eq!(status.state, ModelState::Running);
        supervisor.await_ready("m1").await.unwrap();

        supervisor.stop("m1", true).await.unwrap();
    }

    #[tokio::test]
    async fn test_events_in_order() {
        let supervisor = Arc::new(ProcessSupervisor::new(test_config()));
        let mut events = supervisor.events();

        supervisor
            .start(
                sh_spec("m1", "echo 'all slots are idle'; sleep 30")
                    .with_sentinel("all slots are idle"),
            )
            .await
            .unwrap();
        supervisor.await_ready("m1").await.unwrap();
        supervisor.stop("m1", true).await.unwrap();

        let first = events.recv().await.unwrap();
        assert!(matches!(first, ProcessEvent::Started { .. }));
        let second = events.recv().await.unwrap();
        assert!(matches!(second, ProcessEvent::Ready { .. }));
        let third = events.recv().await.unwrap();
        assert!(matches!(third, ProcessEvent::Exited { expected: true, .. }));
    }

    #[tokio::test]
    async fn test_stop_unknown_model() {
        let supervisor = Arc::new(ProcessSupervisor::new(test_config()));
        assert!(matches!(
            supervisor.stop("ghost", false).await,
            Err(SupervisorError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_port_exhaustion() {
        let mut config = test_config();
        config.port_range_start = 8081;
        config.port_range_end = 8082;
        let supervisor = Arc::new(ProcessSupervisor::new(config));

        supervisor.start(sh_spec("m1", "sleep 30")).await.unwrap();
        supervisor.start(sh_spec("m2", "sleep 30")).await.unwrap();

        let result = supervisor.start(sh_spec("m3", "sleep 30")).await;
        assert!(matches!(result, Err(SupervisorError::PortExhausted(_, _))));

        supervisor.shutdown_all().await;
    }
}
