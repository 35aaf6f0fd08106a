//! Shepherd configuration
//!
//! A single YAML file configures every subsystem. The file path is
//! role-selectable (`~/.shepherd/<role>.yaml` by default); a missing file
//! yields the defaults. CLI flags override the file.

use std::collections::HashMap;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::node::types::NodeRole;

/// Default node API port
pub const DEFAULT_API_PORT: u16 = 8080;

/// Default config file location for a role: ~/.shepherd/<role>.yaml
pub fn default_config_path(role: NodeRole) -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".shepherd")
        .join(format!("{}.yaml", role))
}

/// Default data directory: ~/.shepherd/data
pub fn default_data_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".shepherd")
        .join("data")
}

/// Errors that can occur loading configuration
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Config file not found: {0}")]
    NotFound(PathBuf),

    #[error("Failed to parse config: {0}")]
    ParseError(String),

    #[error("Invalid config: {0}")]
    Invalid(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
}

/// The complete configuration file structure
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ShepherdConfig {
    /// Node identity and bind settings
    #[serde(default)]
    pub node: NodeSection,

    /// Resource monitor settings
    #[serde(default)]
    pub monitor: MonitorSection,

    /// Client-side cluster settings (client / hybrid roles)
    #[serde(default)]
    pub client: ClientSection,

    /// Master-side cluster settings (master / hybrid roles)
    #[serde(default)]
    pub master: MasterSection,

    /// Process supervisor settings
    #[serde(default)]
    pub supervisor: SupervisorSection,

    /// Model registry and scanner settings
    #[serde(default)]
    pub models: ModelsSection,

    /// Shared API key for heartbeat / command signing
    #[serde(rename = "apiKey")]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,
}

/// Node identity and bind settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeSection {
    /// Stable node ID; derived from hardware when unset
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,

    /// Display name; defaults to the hostname
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,

    /// Role; the CLI mode flag overrides this
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mode: Option<String>,

    /// Bind address for the HTTP API
    #[serde(rename = "bindAddr")]
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,

    /// Port for the HTTP API
    #[serde(default = "default_api_port")]
    pub port: u16,

    /// Data directory for the model registry snapshot
    #[serde(rename = "dataDir")]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data_dir: Option<PathBuf>,

    /// Tags advertised to the master
    #[serde(default)]
    pub tags: Vec<String>,

    /// Free-form metadata advertised to the master
    #[serde(default)]
    pub metadata: HashMap<String, String>,

    /// Whether python-based tooling is enabled on this node
    #[serde(rename = "supportsPython")]
    #[serde(default)]
    pub supports_python: bool,
}

impl Default for NodeSection {
    fn default() -> Self {
        Self {
            id: None,
            name: None,
            mode: None,
            bind_addr: default_bind_addr(),
            port: DEFAULT_API_PORT,
            data_dir: None,
            tags: Vec::new(),
            metadata: HashMap::new(),
            supports_python: false,
        }
    }
}

/// Resource monitor settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MonitorSection {
    /// Sampling interval in seconds (minimum 1)
    #[serde(rename = "intervalSecs")]
    #[serde(default = "default_monitor_interval")]
    pub interval_secs: u64,

    /// Number of snapshots retained in the history ring
    #[serde(rename = "historySize")]
    #[serde(default = "default_history_size")]
    pub history_size: usize,

    /// Candidate llama.cpp binary paths to probe
    #[serde(rename = "llamaBinaries")]
    #[serde(default)]
    pub llama_binaries: Vec<String>,
}

impl Default for MonitorSection {
    fn default() -> Self {
        Self {
            interval_secs: default_monitor_interval(),
            history_size: default_history_size(),
            llama_binaries: Vec::new(),
        }
    }
}

/// Client-side cluster settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientSection {
    /// Master base URL, e.g. "http://10.0.0.1:8080"
    #[serde(rename = "masterAddress")]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub master_address: Option<String>,

    /// Heartbeat interval in seconds
    #[serde(rename = "heartbeatIntervalSecs")]
    #[serde(default = "default_heartbeat_interval")]
    pub heartbeat_interval_secs: u64,

    /// Per-send heartbeat timeout in seconds
    #[serde(rename = "heartbeatTimeoutSecs")]
    #[serde(default = "default_heartbeat_timeout")]
    pub heartbeat_timeout_secs: u64,

    /// Consecutive failures before entering reconnect
    #[serde(rename = "maxRetries")]
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Command poll interval in seconds
    #[serde(rename = "pollIntervalSecs")]
    #[serde(default = "default_poll_interval")]
    pub poll_interval_secs: u64,

    /// Maximum commands executing simultaneously
    #[serde(rename = "maxConcurrentCommands")]
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent_commands: usize,

    /// Default command timeout in seconds when a command carries none
    #[serde(rename = "defaultTaskTimeoutSecs")]
    #[serde(default = "default_task_timeout")]
    pub default_task_timeout_secs: u64,

    /// Result payloads retained for at-least-once redelivery
    #[serde(rename = "resultBufferSize")]
    #[serde(default = "default_result_buffer")]
    pub result_buffer_size: usize,
}

impl Default for ClientSection {
    fn default() -> Self {
        Self {
            master_address: None,
            heartbeat_interval_secs: default_heartbeat_interval(),
            heartbeat_timeout_secs: default_heartbeat_timeout(),
            max_retries: default_max_retries(),
            poll_interval_secs: default_poll_interval(),
            max_concurrent_commands: default_max_concurrent(),
            default_task_timeout_secs: default_task_timeout(),
            result_buffer_size: default_result_buffer(),
        }
    }
}

/// Master-side cluster settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MasterSection {
    /// Liveness sweep interval in seconds; defaults to the heartbeat interval
    #[serde(rename = "healthCheckIntervalSecs")]
    #[serde(default = "default_heartbeat_interval")]
    pub health_check_interval_secs: u64,

    /// Heartbeat age in seconds after which a node goes offline
    #[serde(rename = "timeoutThresholdSecs")]
    #[serde(default = "default_timeout_threshold")]
    pub timeout_threshold_secs: u64,

    /// Scheduler strategy: resource, load, locality or cost
    #[serde(default = "default_strategy")]
    pub strategy: String,

    /// Weights for the cost-based strategy
    #[serde(rename = "costWeights")]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cost_weights: Option<CostWeights>,
}

impl Default for MasterSection {
    fn default() -> Self {
        Self {
            health_check_interval_secs: default_heartbeat_interval(),
            timeout_threshold_secs: default_timeout_threshold(),
            strategy: default_strategy(),
            cost_weights: None,
        }
    }
}

/// User-supplied weights for the cost-based scheduler strategy
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct CostWeights {
    #[serde(default = "default_gpu_weight")]
    pub gpu: f64,
    #[serde(default = "default_cpu_weight")]
    pub cpu: f64,
    #[serde(default = "default_mem_weight")]
    pub memory: f64,
}

impl Default for CostWeights {
    fn default() -> Self {
        Self {
            gpu: default_gpu_weight(),
            cpu: default_cpu_weight(),
            memory: default_mem_weight(),
        }
    }
}

/// Process supervisor settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SupervisorSection {
    /// Lowest port handed to inference subprocesses
    #[serde(rename = "portRangeStart")]
    #[serde(default = "default_port_start")]
    pub port_range_start: u16,

    /// Highest port handed to inference subprocesses
    #[serde(rename = "portRangeEnd")]
    #[serde(default = "default_port_end")]
    pub port_range_end: u16,

    /// Substring a subprocess must print to be considered ready
    #[serde(rename = "readySentinel")]
    #[serde(default = "default_ready_sentinel")]
    pub ready_sentinel: String,

    /// Seconds to wait for the sentinel before killing the subprocess
    #[serde(rename = "readyTimeoutSecs")]
    #[serde(default = "default_ready_timeout")]
    pub ready_timeout_secs: u64,

    /// Seconds between SIGTERM and SIGKILL on stop
    #[serde(rename = "termGraceSecs")]
    #[serde(default = "default_term_grace")]
    pub term_grace_secs: u64,

    /// Lines of output retained per model
    #[serde(rename = "outputRingSize")]
    #[serde(default = "default_output_ring")]
    pub output_ring_size: usize,
}

impl Default for SupervisorSection {
    fn default() -> Self {
        Self {
            port_range_start: default_port_start(),
            port_range_end: default_port_end(),
            ready_sentinel: default_ready_sentinel(),
            ready_timeout_secs: default_ready_timeout(),
            term_grace_secs: default_term_grace(),
            output_ring_size: default_output_ring(),
        }
    }
}

/// Model registry and scanner settings
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ModelsSection {
    /// Legacy flat list of scan roots
    #[serde(default)]
    pub paths: Vec<String>,

    /// Structured scan roots
    #[serde(rename = "pathConfigs")]
    #[serde(default)]
    pub path_configs: Vec<ModelPathConfig>,
}

/// A structured scan root
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelPathConfig {
    /// Directory to scan
    pub path: String,

    /// Whether to descend into subdirectories
    #[serde(default = "default_true")]
    pub recursive: bool,
}

impl ModelsSection {
    /// Union of legacy paths and structured path configs, `~` expanded
    pub fn scan_roots(&self) -> Vec<PathBuf> {
        let mut roots: Vec<PathBuf> = Vec::new();
        for p in &self.paths {
            let expanded = shellexpand::tilde(p).into_owned();
            let path = PathBuf::from(expanded);
            if !roots.contains(&path) {
                roots.push(path);
            }
        }
        for pc in &self.path_configs {
            let expanded = shellexpand::tilde(&pc.path).into_owned();
            let path = PathBuf::from(expanded);
            if !roots.contains(&path) {
                roots.push(path);
            }
        }
        roots
    }
}

fn default_bind_addr() -> String {
    "0.0.0.0".to_string()
}

fn default_api_port() -> u16 {
    DEFAULT_API_PORT
}

fn default_monitor_interval() -> u64 {
    5
}

fn default_history_size() -> usize {
    100
}

fn default_heartbeat_interval() -> u64 {
    5
}

fn default_heartbeat_timeout() -> u64 {
    15
}

fn default_max_retries() -> u32 {
    3
}

fn default_poll_interval() -> u64 {
    2
}

fn default_max_concurrent() -> usize {
    4
}

fn default_task_timeout() -> u64 {
    300
}

fn default_result_buffer() -> usize {
    64
}

fn default_timeout_threshold() -> u64 {
    15
}

fn default_strategy() -> String {
    "resource".to_string()
}

fn default_gpu_weight() -> f64 {
    0.5
}

fn default_cpu_weight() -> f64 {
    0.25
}

fn default_mem_weight() -> f64 {
    0.25
}

fn default_port_start() -> u16 {
    8081
}

fn default_port_end() -> u16 {
    9000
}

fn default_ready_sentinel() -> String {
    "all slots are idle".to_string()
}

fn default_ready_timeout() -> u64 {
    600
}

fn default_term_grace() -> u64 {
    10
}

fn default_output_ring() -> usize {
    1000
}

fn default_true() -> bool {
    true
}

/// Parse config from a YAML string
pub fn parse_config(content: &str) -> Result<ShepherdConfig, ConfigError> {
    let config: ShepherdConfig =
        serde_yaml::from_str(content).map_err(|e| ConfigError::ParseError(e.to_string()))?;
    config.validate()?;
    Ok(config)
}

/// Load config from a specific path; a missing file yields the defaults
pub fn load_config_from(path: &PathBuf) -> Result<ShepherdConfig, ConfigError> {
    if !path.exists() {
        return Ok(ShepherdConfig::default());
    }
    let content = std::fs::read_to_string(path)?;
    parse_config(&content)
}

impl ShepherdConfig {
    /// Validate cross-field constraints
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.monitor.interval_secs < 1 {
            return Err(ConfigError::Invalid(
                "monitor.intervalSecs must be at least 1".to_string(),
            ));
        }
        if self.supervisor.port_range_start >= self.supervisor.port_range_end {
            return Err(ConfigError::Invalid(format!(
                "supervisor port range is empty: {}..{}",
                self.supervisor.port_range_start, self.supervisor.port_range_end
            )));
        }
        if self.client.max_concurrent_commands == 0 {
            return Err(ConfigError::Invalid(
                "client.maxConcurrentCommands must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    /// Effective data directory
    pub fn data_dir(&self) -> PathBuf {
        self.node.data_dir.clone().unwrap_or_else(default_data_dir)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = ShepherdConfig::default();
        assert_eq!(config.monitor.interval_secs, 5);
        assert_eq!(config.client.heartbeat_interval_secs, 5);
        assert_eq!(config.client.heartbeat_timeout_secs, 15);
        assert_eq!(config.client.max_concurrent_commands, 4);
        assert_eq!(config.client.poll_interval_secs, 2);
        assert_eq!(config.supervisor.port_range_start, 8081);
        assert_eq!(config.supervisor.port_range_end, 9000);
        assert_eq!(config.supervisor.ready_sentinel, "all slots are idle");
        assert_eq!(config.master.timeout_threshold_secs, 15);
        config.validate().unwrap();
    }

    #[test]
    fn test_parse_config() {
        let yaml = r#"
node:
  name: workstation
  mode: client
  port: 9090
  tags: [gpu, fast]
client:
  masterAddress: http://10.0.0.1:8080
  heartbeatIntervalSecs: 10
models:
  paths:
    - /srv/models
  pathConfigs:
    - path: /mnt/nas/gguf
      recursive: false
apiKey: secret
"#;
        let config = parse_config(yaml).unwrap();
        assert_eq!(config.node.name.as_deref(), Some("workstation"));
        assert_eq!(config.node.port, 9090);
        assert_eq!(
            config.client.master_address.as_deref(),
            Some("http://10.0.0.1:8080")
        );
        assert_eq!(config.client.heartbeat_interval_secs, 10);
        assert_eq!(config.api_key.as_deref(), Some("secret"));

        let roots = config.models.scan_roots();
        assert_eq!(roots.len(), 2);
        assert_eq!(roots[0], PathBuf::from("/srv/models"));
    }

    #[test]
    fn test_scan_roots_dedup() {
        let models = ModelsSection {
            paths: vec!["/srv/models".to_string()],
            path_configs: vec![ModelPathConfig {
                path: "/srv/models".to_string(),
                recursive: true,
            }],
        };
        assert_eq!(models.scan_roots().len(), 1);
    }

    #[test]
    fn test_invalid_interval() {
        let yaml = "monitor:\n  intervalSecs: 0\n";
        assert!(matches!(parse_config(yaml), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn test_invalid_port_range() {
        let yaml = "supervisor:\n  portRangeStart: 9000\n  portRangeEnd: 8081\n";
        assert!(matches!(parse_config(yaml), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn test_missing_file_yields_defaults() {
        let path = PathBuf::from("/nonexistent/shepherd/config.yaml");
        let config = load_config_from(&path).unwrap();
        assert_eq!(config.node.port, DEFAULT_API_PORT);
    }

    #[test]
    fn test_default_config_path_per_role() {
        let master = default_config_path(NodeRole::Master);
        let client = default_config_path(NodeRole::Client);
        assert!(master.to_string_lossy().ends_with("master.yaml"));
        assert!(client.to_string_lossy().ends_with("client.yaml"));
        assert_ne!(master, client);
    }
}
