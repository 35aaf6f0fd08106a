//! Cluster wire protocol
//!
//! Heartbeats, commands and command results exchanged between clients and
//! masters, all JSON over HTTP. Heartbeats and commands carry a keyed
//! SHA-256 signature over a canonicalised payload; an empty key disables
//! signing (single-machine setups).

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::node::types::{NodeState, ResourceSnapshot};

/// Overall health classification carried in a heartbeat
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum HealthLevel {
    #[default]
    Healthy,
    Degraded,
    Unhealthy,
}

/// Health report computed by the client from its own monitor state
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct HealthReport {
    /// Overall classification
    pub overall: HealthLevel,

    /// Named boolean checks
    #[serde(default)]
    pub checks: HashMap<String, bool>,

    /// Human-readable descriptions of failing checks
    #[serde(default)]
    pub issues: Vec<String>,
}

impl HealthReport {
    /// Evaluate health from a resources snapshot
    ///
    /// Disk above 90% or memory above 95% fail their checks; both failing
    /// together is unhealthy, either alone is degraded.
    pub fn evaluate(snapshot: &ResourceSnapshot) -> Self {
        let disk_ok = snapshot.disk_percent() <= 90.0;
        let mem_ok = snapshot.mem_percent() <= 95.0;

        let mut checks = HashMap::new();
        checks.insert("disk".to_string(), disk_ok);
        checks.insert("memory".to_string(), mem_ok);

        let mut issues = Vec::new();
        if !disk_ok {
            issues.push(format!("disk usage at {:.0}%", snapshot.disk_percent()));
        }
        if !mem_ok {
            issues.push(format!("memory usage at {:.0}%", snapshot.mem_percent()));
        }

        let overall = match (disk_ok, mem_ok) {
            (true, true) => HealthLevel::Healthy,
            (false, false) => HealthLevel::Unhealthy,
            _ => HealthLevel::Degraded,
        };

        Self {
            overall,
            checks,
            issues,
        }
    }
}

/// A periodic liveness + resources message from client to master
///
/// Idempotent: the master applies a heartbeat only when its timestamp is
/// strictly newer than the stored one.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Heartbeat {
    /// Sender's stable node ID
    #[serde(rename = "nodeId")]
    pub node_id: String,

    /// Client-clock timestamp; orders duplicates
    pub timestamp: DateTime<Utc>,

    /// Resources sample taken closest to send time
    pub resources: ResourceSnapshot,

    /// Sender's view of its own state
    pub state: NodeState,

    /// Command IDs currently executing on the sender
    #[serde(rename = "activeTasks")]
    #[serde(default)]
    pub active_tasks: Vec<String>,

    /// Models currently loaded or running on the sender
    #[serde(rename = "loadedModels")]
    #[serde(default)]
    pub loaded_models: u32,

    /// Client-computed health report
    #[serde(default)]
    pub health: HealthReport,

    /// Keyed signature over the canonical payload
    #[serde(default)]
    pub signature: String,
}

impl Heartbeat {
    fn canonical(&self) -> String {
        format!(
            "{}|{}|{:?}",
            self.node_id,
            self.timestamp.timestamp_millis(),
            self.state
        )
    }

    /// Sign in place with the shared API key
    pub fn sign(&mut self, key: &str) {
        self.signature = sign_payload(key, &self.canonical());
    }

    /// Verify the signature; an empty key accepts everything
    pub fn verify(&self, key: &str) -> bool {
        verify_payload(key, &self.canonical(), &self.signature)
    }
}

/// Command types a master can dispatch
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommandType {
    LoadModel,
    UnloadModel,
    RunLlamacpp,
    StopProcess,
    UpdateConfig,
    CollectLogs,
    ScanModels,
    /// Anything this build does not understand
    #[serde(other)]
    Unknown,
}

impl CommandType {
    /// Payload keys that must be present for this command type
    pub fn required_keys(&self) -> &'static [&'static str] {
        match self {
            Self::LoadModel => &["model_id"],
            Self::UnloadModel => &["model_id"],
            Self::RunLlamacpp => &["binary_path", "model_path"],
            Self::StopProcess => &["model_id"],
            Self::UpdateConfig => &[],
            Self::CollectLogs => &[],
            Self::ScanModels => &[],
            Self::Unknown => &[],
        }
    }
}

/// A typed, signed work item created by a master
///
/// Immutable once created; every command produces exactly one result.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Command {
    /// Unique command ID; the dedup key for results
    pub id: Uuid,

    /// What to do
    #[serde(rename = "type")]
    pub command_type: CommandType,

    /// Originating node ID
    #[serde(rename = "fromNodeId")]
    pub from_node_id: String,

    /// Target node ID
    #[serde(rename = "toNodeId")]
    pub to_node_id: String,

    /// Schemaless payload, destructured at the executor boundary
    #[serde(default)]
    pub payload: HashMap<String, Value>,

    /// Per-command timeout in seconds; the executor default applies when
    /// absent
    #[serde(rename = "timeoutSecs")]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timeout_secs: Option<u64>,

    /// Larger runs earlier within a node's queue
    #[serde(default)]
    pub priority: i32,

    /// Master-clock creation time
    #[serde(rename = "createdAt")]
    pub created_at: DateTime<Utc>,

    /// Keyed signature over the canonical payload
    #[serde(default)]
    pub signature: String,
}

impl Command {
    /// Create a command addressed to a node
    pub fn new(command_type: CommandType, from: impl Into<String>, to: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            command_type,
            from_node_id: from.into(),
            to_node_id: to.into(),
            payload: HashMap::new(),
            timeout_secs: None,
            priority: 0,
            created_at: Utc::now(),
            signature: String::new(),
        }
    }

    /// Add a payload entry
    pub fn with_payload(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.payload.insert(key.into(), value.into());
        self
    }

    /// Set the per-command timeout
    pub fn with_timeout_secs(mut self, secs: u64) -> Self {
        self.timeout_secs = Some(secs);
        self
    }

    fn canonical(&self) -> String {
        format!(
            "{}|{:?}|{}|{}",
            self.id,
            self.command_type,
            self.to_node_id,
            self.created_at.timestamp_millis()
        )
    }

    /// Sign in place with the shared API key
    pub fn sign(&mut self, key: &str) {
        self.signature = sign_payload(key, &self.canonical());
    }

    /// Verify the signature; an empty key accepts everything
    pub fn verify(&self, key: &str) -> bool {
        verify_payload(key, &self.canonical(), &self.signature)
    }

    /// Missing required payload keys for this command's type
    pub fn missing_keys(&self) -> Vec<&'static str> {
        self.command_type
            .required_keys()
            .iter()
            .filter(|k| !self.payload.contains_key(**k))
            .copied()
            .collect()
    }

    /// A required string payload field
    pub fn payload_str(&self, key: &str) -> Option<&str> {
        self.payload.get(key).and_then(|v| v.as_str())
    }

    /// An optional boolean payload field, defaulting to false
    pub fn payload_bool(&self, key: &str) -> bool {
        self.payload
            .get(key)
            .and_then(|v| v.as_bool())
            .unwrap_or(false)
    }

    /// An optional unsigned payload field
    pub fn payload_u64(&self, key: &str) -> Option<u64> {
        self.payload.get(key).and_then(|v| v.as_u64())
    }
}

/// The outcome of exactly one command
///
/// Delivery from client to master is at-least-once; the master
/// de-duplicates by `commandId`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandResult {
    /// The command this result answers
    #[serde(rename = "commandId")]
    pub command_id: Uuid,

    /// Executing node ID
    #[serde(rename = "fromNodeId")]
    pub from_node_id: String,

    /// Originating node ID
    #[serde(rename = "toNodeId")]
    pub to_node_id: String,

    /// Whether execution succeeded
    pub success: bool,

    /// Structured result values
    #[serde(default)]
    pub result: HashMap<String, Value>,

    /// Failure description when `success` is false
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,

    /// Captured subprocess output tail, when relevant
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output: Option<String>,

    /// When execution finished
    #[serde(rename = "completedAt")]
    pub completed_at: DateTime<Utc>,

    /// Wall-clock execution time
    #[serde(rename = "durationMillis")]
    pub duration_millis: u64,

    /// Free-form metadata
    #[serde(default)]
    pub metadata: HashMap<String, String>,
}

impl CommandResult {
    /// A successful result
    pub fn ok(command: &Command, executor_id: impl Into<String>, duration_millis: u64) -> Self {
        Self {
            command_id: command.id,
            from_node_id: executor_id.into(),
            to_node_id: command.from_node_id.clone(),
            success: true,
            result: HashMap::new(),
            error: None,
            output: None,
            completed_at: Utc::now(),
            duration_millis,
            metadata: HashMap::new(),
        }
    }

    /// A failed result
    pub fn failed(
        command: &Command,
        executor_id: impl Into<String>,
        duration_millis: u64,
        error: impl Into<String>,
    ) -> Self {
        Self {
            success: false,
            error: Some(error.into()),
            ..Self::ok(command, executor_id, duration_millis)
        }
    }

    /// Add a structured result value
    pub fn with_value(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.result.insert(key.into(), value.into());
        self
    }

    /// Attach a captured output tail
    pub fn with_output(mut self, output: impl Into<String>) -> Self {
        self.output = Some(output.into());
        self
    }

    /// Mark this result as a timeout, distinguishing it from execution
    /// failure so the master can decide whether to reassign
    pub fn mark_timed_out(mut self) -> Self {
        self.metadata
            .insert("timedOut".to_string(), "true".to_string());
        self
    }

    /// Whether this result describes a timeout rather than a failure
    pub fn timed_out(&self) -> bool {
        self.metadata.get("timedOut").map(String::as_str) == Some("true")
    }
}

/// Master's answer to a registration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegisterResponse {
    /// Always true; the newer registration wins
    pub accepted: bool,

    /// True when an entry with the same ID but a different address was
    /// replaced
    #[serde(default)]
    pub conflict: bool,

    /// The master's own node ID, recorded as `connectedTo` on the client
    #[serde(rename = "masterId")]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub master_id: Option<String>,
}

/// Keyed SHA-256 signature over a canonical payload
fn sign_payload(key: &str, canonical: &str) -> String {
    if key.is_empty() {
        return String::new();
    }
    let mut hasher = Sha256::new();
    hasher.update(key.as_bytes());
    hasher.update(b"|");
    hasher.update(canonical.as_bytes());
    format!("{:x}", hasher.finalize())
}

fn verify_payload(key: &str, canonical: &str, signature: &str) -> bool {
    if key.is_empty() {
        return true;
    }
    sign_payload(key, canonical) == signature
}

#[cfg(test)]
mod tests {
    use super::*;

    fn snapshot(disk_pct: u64, mem_pct: u64) -> ResourceSnapshot {
        ResourceSnapshot {
            disk_used_bytes: disk_pct,
            disk_total_bytes: 100,
            mem_used_bytes: mem_pct,
            mem_total_bytes: 100,
            ..Default::default()
        }
    }

    #[test]
    fn test_health_evaluate_healthy() {
        let report = HealthReport::evaluate(&snapshot(50, 50));
        assert_eq!(report.overall, HealthLevel::Healthy);
        assert!(report.issues.is_empty());
        assert_eq!(report.checks.get("disk"), Some(&true));
    }

    #[test]
    fn test_health_evaluate_degraded() {
        let report = HealthReport::evaluate(&snapshot(95, 50));
        assert_eq!(report.overall, HealthLevel::Degraded);
        assert_eq!(report.issues.len(), 1);
    }

    #[test]
    fn test_health_evaluate_unhealthy() {
        let report = HealthReport::evaluate(&snapshot(95, 99));
        assert_eq!(report.overall, HealthLevel::Unhealthy);
        assert_eq!(report.issues.len(), 2);
    }

    #[test]
    fn test_heartbeat_sign_verify() {
        let mut hb = Heartbeat {
            node_id: "node-a".to_string(),
            timestamp: Utc::now(),
            resources: ResourceSnapshot::default(),
            state: NodeState::Online,
            active_tasks: Vec::new(),
            loaded_models: 0,
            health: HealthReport::default(),
            signature: String::new(),
        };

        hb.sign("secret");
        assert!(hb.verify("secret"));
        assert!(!hb.verify("wrong"));

        hb.node_id = "node-b".to_string();
        assert!(!hb.verify("secret"));
    }

    #[test]
    fn test_empty_key_accepts_unsigned() {
        let hb = Heartbeat {
            node_id: "node-a".to_string(),
            timestamp: Utc::now(),
            resources: ResourceSnapshot::default(),
            state: NodeState::Online,
            active_tasks: Vec::new(),
            loaded_models: 0,
            health: HealthReport::default(),
            signature: String::new(),
        };
        assert!(hb.verify(""));
    }

    #[test]
    fn test_command_builder_and_signing() {
        let mut cmd = Command::new(CommandType::LoadModel, "master-1", "node-a")
            .with_payload("model_id", "abc123")
            .with_timeout_secs(60);

        assert_eq!(cmd.timeout_secs, Some(60));
        assert!(cmd.missing_keys().is_empty());

        cmd.sign("secret");
        assert!(cmd.verify("secret"));
        assert!(!cmd.verify("other"));
    }

    #[test]
    fn test_command_missing_keys() {
        let cmd = Command::new(CommandType::RunLlamacpp, "m", "c")
            .with_payload("binary_path", "/usr/bin/llama-server");
        assert_eq!(cmd.missing_keys(), vec!["model_path"]);
    }

    #[test]
    fn test_command_type_wire_names() {
        let json = serde_json::to_string(&CommandType::LoadModel).unwrap();
        assert_eq!(json, "\"load_model\"");

        let parsed: CommandType = serde_json::from_str("\"scan_models\"").unwrap();
        assert_eq!(parsed, CommandType::ScanModels);
    }

    #[test]
    fn test_unknown_command_type() {
        let parsed: CommandType = serde_json::from_str("\"reboot_planet\"").unwrap();
        assert_eq!(parsed, CommandType::Unknown);
    }

    #[test]
    fn test_result_constructors() {
        let cmd = Command::new(CommandType::ScanModels, "master-1", "node-a");

        let ok = CommandResult::ok(&cmd, "node-a", 42).with_value("modelCount", 7);
        assert!(ok.success);
        assert_eq!(ok.command_id, cmd.id);
        assert_eq!(ok.to_node_id, "master-1");
        assert_eq!(ok.result.get("modelCount"), Some(&Value::from(7)));

        let failed = CommandResult::failed(&cmd, "node-a", 1000, "boom").mark_timed_out();
        assert!(!failed.success);
        assert!(failed.timed_out());
        assert_eq!(failed.error.as_deref(), Some("boom"));
    }

    #[test]
    fn test_payload_accessors() {
        let cmd = Command::new(CommandType::StopProcess, "m", "c")
            .with_payload("model_id", "x")
            .with_payload("force", true)
            .with_payload("port", 8085);

        assert_eq!(cmd.payload_str("model_id"), Some("x"));
        assert!(cmd.payload_bool("force"));
        assert!(!cmd.payload_bool("absent"));
        assert_eq!(cmd.payload_u64("port"), Some(8085));
    }
}
