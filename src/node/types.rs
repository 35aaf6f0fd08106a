//! Node data model - identity, capabilities and sampled resources
//!
//! These are the wire types exchanged between clients and masters. Field
//! names follow the JSON camelCase convention used across the HTTP API.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Metadata key under which a node advertises the model files on its disk
///
/// The scheduler's locality strategy reads this to find nodes that
/// already hold a model file.
pub const MODEL_FILES_METADATA_KEY: &str = "modelFiles";

/// The role a node runs as, fixed for the lifetime of the process
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum NodeRole {
    /// Local-only: monitor, supervisor and registry without any cluster
    Standalone,
    /// Coordinator: accepts registrations, dispatches commands
    Master,
    /// Worker: registers with a master and executes commands
    Client,
    /// Master and client subsystems in a single process
    #[default]
    Hybrid,
}

impl NodeRole {
    /// Parse a role from its CLI / config spelling
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "standalone" => Some(Self::Standalone),
            "master" => Some(Self::Master),
            "client" => Some(Self::Client),
            "hybrid" => Some(Self::Hybrid),
            _ => None,
        }
    }

    /// Whether this role runs the master-side subsystems
    pub fn is_master(&self) -> bool {
        matches!(self, Self::Master | Self::Hybrid)
    }

    /// Whether this role runs the client-side subsystems
    pub fn is_client(&self) -> bool {
        matches!(self, Self::Client | Self::Hybrid)
    }
}

impl std::fmt::Display for NodeRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Standalone => "standalone",
            Self::Master => "master",
            Self::Client => "client",
            Self::Hybrid => "hybrid",
        };
        f.write_str(s)
    }
}

/// Cluster-visible state of a node
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum NodeState {
    /// Not connected / missed heartbeats
    #[default]
    Offline,
    /// Connected and accepting work
    Online,
    /// Connected but at command capacity
    Busy,
    /// Running with a failed optional subsystem
    Degraded,
    /// A required subsystem failed
    Error,
    /// Administratively excluded from scheduling
    Disabled,
}

impl NodeState {
    /// Whether a scheduler may place work on a node in this state
    pub fn is_schedulable(&self) -> bool {
        matches!(self, Self::Online | Self::Busy | Self::Degraded)
    }
}

/// Static capabilities of a node, gathered once at startup
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Capabilities {
    /// Number of logical CPUs
    #[serde(rename = "cpuCount")]
    pub cpu_count: u32,

    /// Total physical memory in bytes
    #[serde(rename = "memoryBytes")]
    pub memory_bytes: u64,

    /// Number of detected GPUs
    #[serde(rename = "gpuCount")]
    pub gpu_count: u32,

    /// Total GPU memory in bytes across all devices
    #[serde(rename = "gpuMemoryBytes")]
    pub gpu_memory_bytes: u64,

    /// Name of the first GPU (empty when none)
    #[serde(rename = "gpuName")]
    #[serde(default)]
    pub gpu_name: String,

    /// Always true: every node can supervise llama.cpp binaries
    #[serde(rename = "supportsLlama")]
    #[serde(default = "default_true")]
    pub supports_llama: bool,

    /// Whether python-based tooling was found / enabled in config
    #[serde(rename = "supportsPython")]
    #[serde(default)]
    pub supports_python: bool,

    /// Conda environment names discovered at startup
    #[serde(rename = "condaEnvs")]
    #[serde(default)]
    pub conda_envs: Vec<String>,
}

fn default_true() -> bool {
    true
}

/// GPU vendor classification
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum GpuVendor {
    Nvidia,
    Amd,
    Intel,
}

impl std::fmt::Display for GpuVendor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Nvidia => "NVIDIA",
            Self::Amd => "AMD",
            Self::Intel => "Intel",
        };
        f.write_str(s)
    }
}

/// A single GPU as observed in one monitor sample
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GpuInfo {
    /// Device index within its vendor's enumeration
    pub index: u32,

    /// Vendor of the device
    pub vendor: GpuVendor,

    /// Device name as reported by the driver
    pub name: String,

    /// Total device memory in bytes
    #[serde(rename = "totalMemoryBytes")]
    pub total_memory_bytes: u64,

    /// Used device memory in bytes
    #[serde(rename = "usedMemoryBytes")]
    pub used_memory_bytes: u64,

    /// Temperature in degrees Celsius, if reported
    #[serde(rename = "temperatureC")]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature_c: Option<f64>,

    /// Utilization percentage (0.0 - 100.0), if reported
    #[serde(rename = "utilizationPercent")]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub utilization_percent: Option<f64>,

    /// Power draw in watts, if reported
    #[serde(rename = "powerWatts")]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub power_watts: Option<f64>,

    /// Driver version string, if reported
    #[serde(rename = "driverVersion")]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub driver_version: Option<String>,
}

impl GpuInfo {
    /// Free device memory in bytes
    pub fn free_memory_bytes(&self) -> u64 {
        self.total_memory_bytes
            .saturating_sub(self.used_memory_bytes)
    }
}

/// llama.cpp acceleration backend of a discovered binary
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LlamaBackend {
    Cuda,
    Rocm,
    Vulkan,
    Metal,
    Cpu,
}

/// A llama.cpp server binary discovered on this node
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlamaBinary {
    /// Absolute path to the binary
    pub path: String,

    /// Version string from `--version` (empty when probing failed)
    #[serde(default)]
    pub version: String,

    /// Acceleration backend the binary was built for
    pub backend: LlamaBackend,

    /// Largest usable VRAM for this backend on this node, in bytes
    #[serde(rename = "maxVramBytes")]
    #[serde(default)]
    pub max_vram_bytes: u64,

    /// Whether this binary can offload to a GPU
    #[serde(rename = "supportsGpu")]
    pub supports_gpu: bool,

    /// Whether the binary exists and is executable right now
    pub available: bool,
}

/// One immutable sample of a node's resources
///
/// Snapshots are versioned by `sampledAt`; a later snapshot fully supersedes
/// an earlier one.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ResourceSnapshot {
    /// Used CPU in millicores
    #[serde(rename = "cpuUsedMillicores")]
    pub cpu_used_millicores: u64,

    /// Total CPU in millicores (logical cores x 1000)
    #[serde(rename = "cpuTotalMillicores")]
    pub cpu_total_millicores: u64,

    /// Used physical memory in bytes
    #[serde(rename = "memUsedBytes")]
    pub mem_used_bytes: u64,

    /// Total physical memory in bytes
    #[serde(rename = "memTotalBytes")]
    pub mem_total_bytes: u64,

    /// Used root-filesystem space in bytes
    #[serde(rename = "diskUsedBytes")]
    pub disk_used_bytes: u64,

    /// Total root-filesystem space in bytes
    #[serde(rename = "diskTotalBytes")]
    pub disk_total_bytes: u64,

    /// GPUs observed in this sample, ordered by (vendor, index)
    #[serde(default)]
    pub gpus: Vec<GpuInfo>,

    /// 1, 5 and 15 minute load averages
    #[serde(rename = "loadAverage")]
    #[serde(default)]
    pub load_average: [f64; 3],

    /// Seconds since boot
    #[serde(rename = "uptimeSeconds")]
    pub uptime_seconds: u64,

    /// Kernel version string
    #[serde(rename = "kernelVersion")]
    #[serde(default)]
    pub kernel_version: String,

    /// ROCm version, when an AMD stack is present
    #[serde(rename = "rocmVersion")]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rocm_version: Option<String>,

    /// llama.cpp binaries known at sample time
    #[serde(rename = "llamaBinaries")]
    #[serde(default)]
    pub llama_binaries: Vec<LlamaBinary>,

    /// When this sample was taken; orders snapshots
    #[serde(rename = "sampledAt")]
    #[serde(default = "Utc::now")]
    pub sampled_at: DateTime<Utc>,
}

impl ResourceSnapshot {
    /// CPU utilization percentage (0.0 - 100.0)
    pub fn cpu_percent(&self) -> f64 {
        if self.cpu_total_millicores == 0 {
            return 0.0;
        }
        (self.cpu_used_millicores as f64 / self.cpu_total_millicores as f64) * 100.0
    }

    /// Memory utilization percentage (0.0 - 100.0)
    pub fn mem_percent(&self) -> f64 {
        if self.mem_total_bytes == 0 {
            return 0.0;
        }
        (self.mem_used_bytes as f64 / self.mem_total_bytes as f64) * 100.0
    }

    /// Disk utilization percentage (0.0 - 100.0)
    pub fn disk_percent(&self) -> f64 {
        if self.disk_total_bytes == 0 {
            return 0.0;
        }
        (self.disk_used_bytes as f64 / self.disk_total_bytes as f64) * 100.0
    }

    /// Free GPU memory in bytes, summed across all devices
    pub fn free_gpu_memory_bytes(&self) -> u64 {
        self.gpus.iter().map(|g| g.free_memory_bytes()).sum()
    }
}

/// Full description of a node as exchanged on the wire
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeInfo {
    /// Stable identifier, immutable for the process lifetime
    pub id: String,

    /// Human-readable name (defaults to the hostname)
    pub name: String,

    /// The role this node runs as
    pub role: NodeRole,

    /// Current cluster-visible state
    #[serde(default)]
    pub state: NodeState,

    /// Address where this node's API can be reached
    pub address: String,

    /// Port where this node's API listens
    pub port: u16,

    /// Shepherd version
    pub version: String,

    /// Ordered set of tags for selection and display
    #[serde(default)]
    pub tags: Vec<String>,

    /// Free-form metadata
    #[serde(default)]
    pub metadata: HashMap<String, String>,

    /// Static capabilities gathered at startup
    #[serde(default)]
    pub capabilities: Capabilities,

    /// Last resources sample, when one has been taken
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resources: Option<ResourceSnapshot>,

    /// Models currently loaded or running, from the latest heartbeat
    #[serde(rename = "loadedModels")]
    #[serde(default)]
    pub loaded_models: u32,

    /// When the last heartbeat from this node was applied
    #[serde(rename = "lastHeartbeat")]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_heartbeat: Option<DateTime<Utc>>,

    /// ID of the master this node is connected to (client/hybrid only)
    #[serde(rename = "connectedTo")]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub connected_to: Option<String>,

    /// IDs of registered child nodes (master/hybrid only)
    #[serde(rename = "subNodes")]
    #[serde(default)]
    pub sub_nodes: Vec<String>,
}

impl NodeInfo {
    /// Create a node description with minimal fields
    pub fn new(id: impl Into<String>, role: NodeRole, address: impl Into<String>, port: u16) -> Self {
        let id = id.into();
        Self {
            name: id.clone(),
            id,
            role,
            state: NodeState::Offline,
            address: address.into(),
            port,
            version: env!("CARGO_PKG_VERSION").to_string(),
            tags: Vec::new(),
            metadata: HashMap::new(),
            capabilities: Capabilities::default(),
            resources: None,
            loaded_models: 0,
            last_heartbeat: None,
            connected_to: None,
            sub_nodes: Vec::new(),
        }
    }

    /// Set the display name
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Add a tag, preserving order and uniqueness
    pub fn with_tag(mut self, tag: impl Into<String>) -> Self {
        let tag = tag.into();
        if !self.tags.contains(&tag) {
            self.tags.push(tag);
        }
        self
    }

    /// Set the static capabilities
    pub fn with_capabilities(mut self, caps: Capabilities) -> Self {
        self.capabilities = caps;
        self
    }

    /// The base URL of this node's API
    pub fn api_url(&self) -> String {
        format!("http://{}:{}", self.address, self.port)
    }

    /// Check if the last heartbeat is older than `threshold_secs`
    pub fn is_stale(&self, threshold_secs: i64) -> bool {
        match self.last_heartbeat {
            Some(t) => (Utc::now() - t).num_seconds() > threshold_secs,
            None => true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_role_parse() {
        assert_eq!(NodeRole::parse("master"), Some(NodeRole::Master));
        assert_eq!(NodeRole::parse("HYBRID"), Some(NodeRole::Hybrid));
        assert_eq!(NodeRole::parse("standalone"), Some(NodeRole::Standalone));
        assert_eq!(NodeRole::parse("coordinator"), None);
    }

    #[test]
    fn test_role_subsystems() {
        assert!(NodeRole::Hybrid.is_master());
        assert!(NodeRole::Hybrid.is_client());
        assert!(NodeRole::Master.is_master());
        assert!(!NodeRole::Master.is_client());
        assert!(!NodeRole::Standalone.is_master());
        assert!(!NodeRole::Standalone.is_client());
    }

    #[test]
    fn test_state_schedulable() {
        assert!(NodeState::Online.is_schedulable());
        assert!(NodeState::Busy.is_schedulable());
        assert!(!NodeState::Offline.is_schedulable());
        assert!(!NodeState::Disabled.is_schedulable());
        assert!(!NodeState::Error.is_schedulable());
    }

    #[test]
    fn test_node_builder() {
        let node = NodeInfo::new("node-a", NodeRole::Client, "10.0.0.5", 8080)
            .with_name("workstation")
            .with_tag("gpu")
            .with_tag("gpu");

        assert_eq!(node.id, "node-a");
        assert_eq!(node.name, "workstation");
        assert_eq!(node.tags, vec!["gpu".to_string()]);
        assert_eq!(node.api_url(), "http://10.0.0.5:8080");
    }

    #[test]
    fn test_staleness() {
        let mut node = NodeInfo::new("n", NodeRole::Client, "localhost", 8080);
        assert!(node.is_stale(15));

        node.last_heartbeat = Some(Utc::now());
        assert!(!node.is_stale(15));

        node.last_heartbeat = Some(Utc::now() - chrono::Duration::seconds(60));
        assert!(node.is_stale(15));
    }

    #[test]
    fn test_snapshot_percentages() {
        let snap = ResourceSnapshot {
            cpu_used_millicores: 2_000,
            cpu_total_millicores: 8_000,
            mem_used_bytes: 4 << 30,
            mem_total_bytes: 16 << 30,
            disk_used_bytes: 50 << 30,
            disk_total_bytes: 100 << 30,
            ..Default::default()
        };

        assert_eq!(snap.cpu_percent(), 25.0);
        assert_eq!(snap.mem_percent(), 25.0);
        assert_eq!(snap.disk_percent(), 50.0);
    }

    #[test]
    fn test_snapshot_zero_totals() {
        let snap = ResourceSnapshot::default();
        assert_eq!(snap.cpu_percent(), 0.0);
        assert_eq!(snap.mem_percent(), 0.0);
        assert_eq!(snap.disk_percent(), 0.0);
    }

    #[test]
    fn test_free_gpu_memory() {
        let snap = ResourceSnapshot {
            gpus: vec![
                GpuInfo {
                    index: 0,
                    vendor: GpuVendor::Nvidia,
                    name: "RTX 4090".to_string(),
                    total_memory_bytes: 24 << 30,
                    used_memory_bytes: 4 << 30,
                    temperature_c: None,
                    utilization_percent: None,
                    power_watts: None,
                    driver_version: None,
                },
                GpuInfo {
                    index: 1,
                    vendor: GpuVendor::Nvidia,
                    name: "RTX 4090".to_string(),
                    total_memory_bytes: 24 << 30,
                    used_memory_bytes: 24 << 30,
                    temperature_c: None,
                    utilization_percent: None,
                    power_watts: None,
                    driver_version: None,
                },
            ],
            ..Default::default()
        };

        assert_eq!(snap.free_gpu_memory_bytes(), 20 << 30);
    }

    #[test]
    fn test_wire_field_names() {
        let node = NodeInfo::new("n1", NodeRole::Master, "localhost", 8080);
        let json = serde_json::to_string(&node).unwrap();

        assert!(json.contains("\"role\":\"master\""));
        assert!(json.contains("\"state\":\"offline\""));
        assert!(json.contains("\"subNodes\""));
    }
}
