//! Command Executor
//!
//! Runs commands received from the master under a concurrency bound. The
//! executor does not queue: admission control is the connector's job, and
//! a command arriving with no free slot is rejected outright. Payloads are
//! schemaless on the wire and destructured here against each command
//! type's schema; business logic never sees the raw map.
//!
//! The executor never retries - retry is the master's prerogative.

use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde_json::Value;
use tokio::sync::{RwLock, Semaphore};
use tracing::{debug, info, warn};

use crate::monitor::{binaries, ResourceMonitor};
use crate::registry::{stable_model_id, ModelRegistry};
use crate::supervisor::{launch, LaunchSpec, ProcessSupervisor};

use super::protocol::{Command, CommandResult, CommandType};

/// Configuration for the executor
#[derive(Debug, Clone)]
pub struct ExecutorConfig {
    /// Executing node's stable ID, stamped on every result
    pub node_id: String,

    /// Maximum commands executing simultaneously
    pub max_concurrent: usize,

    /// Applied when a command carries no timeout
    pub default_task_timeout: Duration,
}

/// Structured outcome of a dispatched command body
#[derive(Debug, Default)]
struct Outcome {
    values: HashMap<String, Value>,
    output: Option<String>,
}

/// Failure of a dispatched command body
#[derive(Debug)]
struct ExecFailure {
    error: String,
    output: Option<String>,
}

impl ExecFailure {
    fn new(error: impl Into<String>) -> Self {
        Self {
            error: error.into(),
            output: None,
        }
    }

    fn with_output(error: impl Into<String>, output: impl Into<String>) -> Self {
        Self {
            error: error.into(),
            output: Some(output.into()),
        }
    }
}

/// The bounded-concurrency command executor
pub struct CommandExecutor {
    config: ExecutorConfig,
    semaphore: Arc<Semaphore>,
    registry: Arc<ModelRegistry>,
    supervisor: Arc<ProcessSupervisor>,
    monitor: Arc<ResourceMonitor>,
    active: RwLock<HashSet<String>>,
    settings: RwLock<HashMap<String, Value>>,
}

impl CommandExecutor {
    /// Create an executor over this node's registry, supervisor and monitor
    pub fn new(
        config: ExecutorConfig,
        registry: Arc<ModelRegistry>,
        supervisor: Arc<ProcessSupervisor>,
        monitor: Arc<ResourceMonitor>,
    ) -> Self {
        let semaphore = Arc::new(Semaphore::new(config.max_concurrent));
        Self {
            config,
            semaphore,
            registry,
            supervisor,
            monitor,
            active: RwLock::new(HashSet::new()),
            settings: RwLock::new(HashMap::new()),
        }
    }

    /// Whether a slot is free right now; the connector checks this before
    /// polling for the next command
    pub fn has_capacity(&self) -> bool {
        self.semaphore.available_permits() > 0
    }

    /// IDs of commands currently executing, for the heartbeat
    pub async fn active_commands(&self) -> Vec<String> {
        self.active.read().await.iter().cloned().collect()
    }

    /// Execute one command to completion, producing exactly one result
    pub async fn execute(&self, command: Command) -> CommandResult {
        let started = Instant::now();

        if command.command_type == CommandType::Unknown {
            return CommandResult::failed(
                &command,
                self.config.node_id.as_str(),
                started.elapsed().as_millis() as u64,
                "unknown command type",
            );
        }

        let missing = command.missing_keys();
        if !missing.is_empty() {
            return CommandResult::failed(
                &command,
                self.config.node_id.as_str(),
                started.elapsed().as_millis() as u64,
                format!("missing required payload fields: {}", missing.join(", ")),
            );
        }

        let Ok(_permit) = self.semaphore.try_acquire() else {
            return CommandResult::failed(
                &command,
                self.config.node_id.as_str(),
                started.elapsed().as_millis() as u64,
                "executor saturated",
            );
        };

        let timeout = command
            .timeout_secs
            .map(Duration::from_secs)
            .unwrap_or(self.config.default_task_timeout);

        self.active.write().await.insert(command.id.to_string());
        info!(
            command = %command.id,
            kind = ?command.command_type,
            timeout_secs = timeout.as_secs(),
            "Executing command"
        );

        let outcome = tokio::time::timeout(timeout, self.dispatch(&command)).await;
        self.active.write().await.remove(&command.id.to_string());

        let duration_millis = started.elapsed().as_millis() as u64;
        match outcome {
            Ok(Ok(outcome)) => {
                let mut result = CommandResult::ok(&command, self.config.node_id.as_str(), duration_millis);
                result.result = outcome.values;
                result.output = outcome.output;
                result
            }
            Ok(Err(failure)) => {
                warn!(command = %command.id, "Command failed: {}", failure.error);
                let mut result = CommandResult::failed(
                    &command,
                    self.config.node_id.as_str(),
                    duration_millis,
                    failure.error,
                );
                result.output = failure.output;
                result
            }
            Err(_) => {
                warn!(command = %command.id, "Command timed out");
                self.cleanup_after_timeout(&command).await;
                CommandResult::failed(
                    &command,
                    self.config.node_id.as_str(),
                    duration_millis,
                    format!("timed out after {}s", timeout.as_secs()),
                )
                .mark_timed_out()
            }
        }
    }

    /// Best-effort cleanup of a load interrupted by the timeout
    async fn cleanup_after_timeout(&self, command: &Command) {
        if command.command_type != CommandType::LoadModel {
            return;
        }
        let Some(key) = command.payload_str("model_id") else {
            return;
        };
        if let Some(model) = self.registry.resolve(key).await {
            if self.supervisor.is_live(&model.id) {
                debug!(model = %model.id, "Killing load interrupted by timeout");
                let _ = self.supervisor.stop(&model.id, true).await;
            }
        }
    }

    async fn dispatch(&self, command: &Command) -> Result<Outcome, ExecFailure> {
        match command.command_type {
            CommandType::LoadModel => self.handle_load_model(command).await,
            CommandType::UnloadModel | CommandType::StopProcess => {
                self.handle_stop(command).await
            }
            CommandType::RunLlamacpp => self.handle_run_llamacpp(command).await,
            CommandType::ScanModels => self.handle_scan_models().await,
            CommandType::UpdateConfig => self.handle_update_config(command).await,
            CommandType::CollectLogs => self.handle_collect_logs(command).await,
            CommandType::Unknown => Err(ExecFailure::new("unknown command type")),
        }
    }

    /// `load_model`: resolve the model, pick a binary, launch, await ready
    async fn handle_load_model(&self, command: &Command) -> Result<Outcome, ExecFailure> {
        let key = command.payload_str("model_id").unwrap_or_default();
        let model = self
            .registry
            .resolve(key)
            .await
            .ok_or_else(|| ExecFailure::new(format!("model '{}' not found", key)))?;

        let binary = match command.payload_str("binary_path") {
            Some(path) => path.to_string(),
            None => self
                .pick_binary()
                .await
                .ok_or_else(|| ExecFailure::new("no llama.cpp binary available"))?,
        };

        let pinned = command.payload_u64("port").map(|p| p as u16);
        let port = self
            .supervisor
            .reserve_port(pinned)
            .await
            .map_err(|e| ExecFailure::new(e.to_string()))?;

        let params = command
            .payload
            .get("params")
            .and_then(|v| v.as_object())
            .map(|o| o.clone().into_iter().collect::<HashMap<String, Value>>())
            .unwrap_or_default();

        let args = launch::generate_args(
            &model.path.to_string_lossy(),
            "127.0.0.1",
            port,
            &params,
        );
        let sentinel = command
            .payload_str("ready_sentinel")
            .unwrap_or_else(|| self.supervisor.default_sentinel())
            .to_string();

        let spec = LaunchSpec {
            model_id: model.id.clone(),
            binary_path: binary.clone().into(),
            args,
            env: HashMap::new(),
            port: Some(port),
            ready_sentinel: Some(sentinel),
            load_params: params,
        };

        let started = match self.supervisor.start(spec).await {
            Ok(s) => s,
            Err(e) => {
                self.supervisor.release_port(port).await;
                return Err(ExecFailure::new(e.to_string()));
            }
        };

        match self.supervisor.await_ready(&model.id).await {
            Ok(ready_port) => Ok(Outcome {
                values: HashMap::from([
                    ("model_id".to_string(), Value::String(model.id.clone())),
                    ("port".to_string(), Value::from(ready_port)),
                    ("pid".to_string(), Value::from(started.pid)),
                ]),
                output: None,
            }),
            Err(e) => {
                let tail = self.supervisor.stderr_tail(&model.id).await;
                Err(ExecFailure::with_output(e.to_string(), tail))
            }
        }
    }

    /// `unload_model` / `stop_process`: SIGTERM then SIGKILL, return reaped
    async fn handle_stop(&self, command: &Command) -> Result<Outcome, ExecFailure> {
        let key = command.payload_str("model_id").unwrap_or_default();
        let model_id = match self.registry.resolve(key).await {
            Some(model) => model.id,
            None => key.to_string(), // direct run_llamacpp records are keyed by path hash
        };
        let force = command.payload_bool("force");

        self.supervisor
            .stop(&model_id, force)
            .await
            .map_err(|e| ExecFailure::new(e.to_string()))?;

        Ok(Outcome {
            values: HashMap::from([("model_id".to_string(), Value::String(model_id))]),
            output: None,
        })
    }

    /// `run_llamacpp`: direct subprocess launch bypassing the registry
    async fn handle_run_llamacpp(&self, command: &Command) -> Result<Outcome, ExecFailure> {
        let binary_path = command.payload_str("binary_path").unwrap_or_default();
        let model_path = command.payload_str("model_path").unwrap_or_default();

        let binary = Path::new(binary_path);
        if !binary.is_absolute() {
            return Err(ExecFailure::new(format!(
                "binary_path must be absolute: {}",
                binary_path
            )));
        }
        if !binaries::is_executable_file(binary) {
            return Err(ExecFailure::new(format!(
                "binary_path is not a regular executable file: {}",
                binary_path
            )));
        }
        if !Path::new(model_path).is_file() {
            return Err(ExecFailure::new(format!(
                "model_path does not exist: {}",
                model_path
            )));
        }

        let pinned = command.payload_u64("port").map(|p| p as u16);
        let port = self
            .supervisor
            .reserve_port(pinned)
            .await
            .map_err(|e| ExecFailure::new(e.to_string()))?;

        let mut args = vec![
            "--model".to_string(),
            model_path.to_string(),
            "--host".to_string(),
            "127.0.0.1".to_string(),
            "--port".to_string(),
            port.to_string(),
        ];
        if let Some(extra) = command.payload.get("args").and_then(|v| v.as_array()) {
            args.extend(extra.iter().filter_map(|v| v.as_str().map(String::from)));
        }

        let model_id = stable_model_id(Path::new(model_path));
        let spec = LaunchSpec {
            model_id: model_id.clone(),
            binary_path: binary.to_path_buf(),
            args,
            env: HashMap::new(),
            port: Some(port),
            ready_sentinel: None,
            load_params: HashMap::new(),
        };

        let started = match self.supervisor.start(spec).await {
            Ok(s) => s,
            Err(e) => {
                self.supervisor.release_port(port).await;
                return Err(ExecFailure::new(e.to_string()));
            }
        };

        Ok(Outcome {
            values: HashMap::from([
                ("model_id".to_string(), Value::String(model_id)),
                ("pid".to_string(), Value::from(started.pid)),
                ("port".to_string(), Value::from(started.port)),
            ]),
            output: None,
        })
    }

    /// `scan_models`: re-walk the configured roots
    async fn handle_scan_models(&self) -> Result<Outcome, ExecFailure> {
        let summary = self
            .registry
            .scan()
            .await
            .map_err(|e| ExecFailure::new(e.to_string()))?;

        Ok(Outcome {
            values: HashMap::from([
                ("modelCount".to_string(), Value::from(summary.model_count)),
                (
                    "scannedFiles".to_string(),
                    Value::from(summary.scanned_files),
                ),
                (
                    "durationMillis".to_string(),
                    Value::from(summary.duration_millis),
                ),
            ]),
            output: None,
        })
    }

    /// `update_config`: merge runtime-tunable settings
    async fn handle_update_config(&self, command: &Command) -> Result<Outcome, ExecFailure> {
        let updates = command
            .payload
            .get("config")
            .and_then(|v| v.as_object())
            .ok_or_else(|| ExecFailure::new("payload field 'config' must be an object"))?;

        if updates
            .get("invalidate_binaries")
            .and_then(|v| v.as_bool())
            .unwrap_or(false)
        {
            self.monitor.invalidate_binaries();
        }

        let mut settings = self.settings.write().await;
        for (key, value) in updates {
            settings.insert(key.clone(), value.clone());
        }

        Ok(Outcome {
            values: HashMap::from([("updated".to_string(), Value::from(updates.len()))]),
            output: None,
        })
    }

    /// `collect_logs`: return retained subprocess output
    async fn handle_collect_logs(&self, command: &Command) -> Result<Outcome, ExecFailure> {
        let lines = command.payload_u64("lines").unwrap_or(100) as usize;

        let output = match command.payload_str("model_id") {
            Some(model_id) => self.supervisor.output_tail(model_id, lines).await.join("\n"),
            None => {
                let mut combined = Vec::new();
                for info in self.supervisor.list().await {
                    let tail = self.supervisor.output_tail(&info.model_id, lines).await;
                    if !tail.is_empty() {
                        combined.push(format!("=== {} ===", info.model_id));
                        combined.extend(tail);
                    }
                }
                combined.join("\n")
            }
        };

        Ok(Outcome {
            values: HashMap::from([("lineCount".to_string(), Value::from(output.lines().count()))]),
            output: Some(output),
        })
    }

    /// The preferred available binary: GPU-capable first, then any
    async fn pick_binary(&self) -> Option<String> {
        let snapshot = self.monitor.latest().await?;
        let available: Vec<_> = snapshot
            .llama_binaries
            .iter()
            .filter(|b| b.available)
            .collect();

        available
            .iter()
            .find(|b| b.supports_gpu)
            .or_else(|| available.first())
            .map(|b| b.path.clone())
    }
}
