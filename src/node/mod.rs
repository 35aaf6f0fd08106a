//! Node lifecycle & identity
//!
//! A Node is one process in the fleet. It owns every subsystem and gates
//! their start and stop according to its role:
//!
//! - standalone: monitor + supervisor + registry
//! - master: those plus the node manager and scheduler
//! - client: those plus the executor and master connector
//! - hybrid: everything
//!
//! Startup is ordered monitor -> supervisor -> scan -> master registry ->
//! client connector; stop reverses the order under bounded timeouts. A
//! client that cannot reach its master fails fatally; a hybrid only
//! degrades and keeps retrying in the background.

pub mod identity;
pub mod types;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::{watch, RwLock};
use tracing::{error, info, warn};

use crate::cluster::{
    CommandExecutor, ConnectorConfig, ExecutorConfig, HeartbeatConfig, HeartbeatSource,
    MasterConnector, NodeManager, NodeManagerConfig, Scheduler,
};
use crate::config::ShepherdConfig;
use crate::monitor::ResourceMonitor;
use crate::registry::metadata::GgufFileProvider;
use crate::registry::{ModelRegistry, ScanRoot};
use crate::supervisor::{ModelState, ProcessSupervisor};

use types::{NodeInfo, NodeRole, NodeState, ResourceSnapshot};

/// Per-subsystem stop budget; the whole stop stays within ~10s
const STOP_STEP_TIMEOUT: Duration = Duration::from_secs(3);

/// Retry cadence for a hybrid whose master is unreachable at startup
const HYBRID_CONNECT_RETRY: Duration = Duration::from_secs(30);

/// Errors from the node lifecycle
#[derive(Error, Debug)]
pub enum NodeError {
    #[error("Invalid node configuration: {0}")]
    InvalidConfig(String),

    #[error("Resource monitor failed to start: {0}")]
    MonitorFailed(String),

    #[error("Cannot reach master: {0}")]
    ConnectFailed(String),

    #[error("Node is not in a startable state")]
    NotStartable,
}

/// Lifecycle state of the node process
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
    Created,
    Starting,
    Running,
    Degraded,
    Stopping,
    Stopped,
    /// Terminal; entered only from Starting
    Error,
}

/// Heartbeat body provider backed by the node's own subsystems
struct NodeHeartbeatSource {
    monitor: Arc<ResourceMonitor>,
    supervisor: Arc<ProcessSupervisor>,
    executor: Arc<CommandExecutor>,
    info: Arc<RwLock<NodeInfo>>,
}

#[async_trait]
impl HeartbeatSource for NodeHeartbeatSource {
    async fn snapshot(&self) -> ResourceSnapshot {
        self.monitor.latest().await.unwrap_or_default()
    }

    async fn state(&self) -> NodeState {
        self.info.read().await.state
    }

    async fn active_tasks(&self) -> Vec<String> {
        self.executor.active_commands().await
    }

    async fn loaded_models(&self) -> u32 {
        self.supervisor
            .list()
            .await
            .iter()
            .filter(|p| matches!(p.state, ModelState::Loaded | ModelState::Running))
            .count() as u32
    }
}

/// One Shepherd process: identity, role and owned subsystems
pub struct Node {
    role: NodeRole,
    info: Arc<RwLock<NodeInfo>>,
    config: ShepherdConfig,

    monitor: Arc<ResourceMonitor>,
    supervisor: Arc<ProcessSupervisor>,
    registry: Arc<ModelRegistry>,

    // Client-side subsystems
    executor: Option<Arc<CommandExecutor>>,
    connector: Option<Arc<MasterConnector>>,

    // Master-side subsystems
    manager: Option<Arc<NodeManager>>,
    scheduler: Option<Arc<Scheduler>>,

    lifecycle_tx: watch::Sender<LifecycleState>,
    lifecycle_rx: watch::Receiver<LifecycleState>,
}

impl Node {
    /// Build a node and its role-dependent subsystems
    ///
    /// The ID and role are immutable afterwards; state transitions happen
    /// only through `start` / `stop`.
    pub fn new(config: ShepherdConfig, role: NodeRole) -> Result<Arc<Self>, NodeError> {
        let id = config
            .node
            .id
            .clone()
            .unwrap_or_else(identity::derive_node_id);
        let name = config
            .node
            .name
            .clone()
            .unwrap_or_else(identity::local_hostname);

        let mut info = NodeInfo::new(id.as_str(), role, config.node.bind_addr.as_str(), config.node.port)
            .with_name(name);
        info.tags = config.node.tags.clone();
        info.metadata = config.node.metadata.clone();
        let info = Arc::new(RwLock::new(info));

        let monitor = Arc::new(ResourceMonitor::new(config.monitor.clone()));
        let supervisor = Arc::new(ProcessSupervisor::new(config.supervisor.clone()));

        let mut roots: Vec<ScanRoot> = config
            .models
            .paths
            .iter()
            .map(|p| ScanRoot {
                path: shellexpand::tilde(p).into_owned().into(),
                recursive: true,
            })
            .collect();
        for pc in &config.models.path_configs {
            roots.push(ScanRoot {
                path: shellexpand::tilde(&pc.path).into_owned().into(),
                recursive: pc.recursive,
            });
        }
        let registry = Arc::new(ModelRegistry::new(
            roots,
            config.data_dir(),
            Arc::new(GgufFileProvider),
        ));

        let api_key = config.api_key.clone().unwrap_or_default();

        let (executor, connector) = if role.is_client() {
            let executor = Arc::new(CommandExecutor::new(
                ExecutorConfig {
                    node_id: id.clone(),
                    max_concurrent: config.client.max_concurrent_commands,
                    default_task_timeout: Duration::from_secs(
                        config.client.default_task_timeout_secs,
                    ),
                },
                Arc::clone(&registry),
                Arc::clone(&supervisor),
                Arc::clone(&monitor),
            ));

            let connector = match config.client.master_address.clone() {
                Some(master_url) => {
                    let heartbeat_config = HeartbeatConfig::new(master_url.as_str(), id.as_str())
                        .with_interval(Duration::from_secs(config.client.heartbeat_interval_secs))
                        .with_timeout(Duration::from_secs(config.client.heartbeat_timeout_secs))
                        .with_api_key(api_key.as_str());
                    let source = Arc::new(NodeHeartbeatSource {
                        monitor: Arc::clone(&monitor),
                        supervisor: Arc::clone(&supervisor),
                        executor: Arc::clone(&executor),
                        info: Arc::clone(&info),
                    });
                    Some(MasterConnector::new(
                        ConnectorConfig {
                            master_url,
                            poll_interval: Duration::from_secs(config.client.poll_interval_secs),
                            result_buffer_size: config.client.result_buffer_size,
                            api_key: api_key.clone(),
                        },
                        heartbeat_config,
                        Arc::clone(&info),
                        Arc::clone(&executor),
                        source,
                    ))
                }
                None if role == NodeRole::Client => {
                    return Err(NodeError::InvalidConfig(
                        "client role requires client.masterAddress".to_string(),
                    ));
                }
                None => None, // hybrid without an upstream master is master-only
            };

            (Some(executor), connector)
        } else {
            (None, None)
        };

        let (manager, scheduler) = if role.is_master() {
            let manager = Arc::new(NodeManager::new(NodeManagerConfig {
                health_check_interval: Duration::from_secs(
                    config.master.health_check_interval_secs,
                ),
                timeout_threshold: Duration::from_secs(config.master.timeout_threshold_secs),
                api_key,
            }));
            let scheduler = Arc::new(Scheduler::from_config(
                &config.master.strategy,
                config.master.cost_weights,
            ));
            (Some(manager), Some(scheduler))
        } else {
            (None, None)
        };

        let (lifecycle_tx, lifecycle_rx) = watch::channel(LifecycleState::Created);

        Ok(Arc::new(Self {
            role,
            info,
            config,
            monitor,
            supervisor,
            registry,
            executor,
            connector,
            manager,
            scheduler,
            lifecycle_tx,
            lifecycle_rx,
        }))
    }

    /// The node's role
    pub fn role(&self) -> NodeRole {
        self.role
    }

    /// The shared API key, empty when signing is disabled
    pub fn api_key(&self) -> String {
        self.config.api_key.clone().unwrap_or_default()
    }

    /// A snapshot of the node's current info
    pub async fn info(&self) -> NodeInfo {
        let mut info = self.info.read().await.clone();
        info.resources = self.monitor.latest().await;
        if let Some(manager) = &self.manager {
            info.sub_nodes = manager.list().into_iter().map(|n| n.id).collect();
        }
        info
    }

    /// The shared info handle, for subsystems holding a narrow view
    pub fn info_handle(&self) -> Arc<RwLock<NodeInfo>> {
        Arc::clone(&self.info)
    }

    /// Current lifecycle state
    pub fn lifecycle(&self) -> LifecycleState {
        *self.lifecycle_rx.borrow()
    }

    /// Subscribe to lifecycle transitions
    pub fn subscribe_state(&self) -> watch::Receiver<LifecycleState> {
        self.lifecycle_rx.clone()
    }

    /// The resource monitor
    pub fn monitor(&self) -> &Arc<ResourceMonitor> {
        &self.monitor
    }

    /// The process supervisor
    pub fn supervisor(&self) -> &Arc<ProcessSupervisor> {
        &self.supervisor
    }

    /// The model registry
    pub fn registry(&self) -> &Arc<ModelRegistry> {
        &self.registry
    }

    /// The master-side node manager, when this role runs one
    pub fn manager(&self) -> Option<&Arc<NodeManager>> {
        self.manager.as_ref()
    }

    /// The master-side scheduler, when this role runs one
    pub fn scheduler(&self) -> Option<&Arc<Scheduler>> {
        self.scheduler.as_ref()
    }

    /// The client-side executor, when this role runs one
    pub fn executor(&self) -> Option<&Arc<CommandExecutor>> {
        self.executor.as_ref()
    }

    /// The client-side master connector, when one is configured
    pub fn connector(&self) -> Option<&Arc<MasterConnector>> {
        self.connector.as_ref()
    }

    /// Start every subsystem in dependency order
    pub async fn start(self: &Arc<Self>) -> Result<(), NodeError> {
        if self.lifecycle() != LifecycleState::Created {
            return Err(NodeError::NotStartable);
        }
        self.transition(LifecycleState::Starting);
        info!(role = %self.role, "Node starting");

        // 1. Monitor: required, its initial sample feeds capabilities.
        if let Err(e) = self.monitor.start().await {
            self.transition(LifecycleState::Error);
            return Err(NodeError::MonitorFailed(e.to_string()));
        }
        let capabilities = self
            .monitor
            .capabilities(self.config.node.supports_python)
            .await;
        self.info.write().await.capabilities = capabilities;

        // 2. Supervisor is passive until the first launch; nothing to start.

        // 3. Registry: snapshot then initial scan. Scan trouble degrades.
        if let Err(e) = self.registry.load_snapshot().await {
            warn!("Could not load model snapshot: {}", e);
        }
        if let Err(e) = self.registry.scan().await {
            warn!("Initial model scan failed: {}", e);
        }
        self.advertise_model_files().await;

        // 4. Master side.
        if let Some(manager) = &self.manager {
            manager.start();
        }

        // 5. Client side.
        let mut degraded = false;
        if let Some(connector) = &self.connector {
            match connector.connect().await {
                Ok(response) => {
                    let mut info = self.info.write().await;
                    info.connected_to = response.master_id;
                    info.state = NodeState::Online;
                }
                Err(e) if self.role == NodeRole::Client => {
                    error!("Cannot reach master: {}", e);
                    self.transition(LifecycleState::Error);
                    return Err(NodeError::ConnectFailed(e.to_string()));
                }
                Err(e) => {
                    warn!("Master unreachable, running degraded: {}", e);
                    degraded = true;
                    self.spawn_hybrid_reconnect();
                }
            }
        } else {
            self.info.write().await.state = NodeState::Online;
        }

        if degraded {
            self.info.write().await.state = NodeState::Degraded;
            self.transition(LifecycleState::Degraded);
        } else {
            self.transition(LifecycleState::Running);
        }
        info!(role = %self.role, "Node started");
        Ok(())
    }

    /// Advertise this node's model files for the locality scheduler
    async fn advertise_model_files(&self) {
        let files: Vec<String> = self
            .registry
            .list_models()
            .await
            .iter()
            .filter_map(|m| m.path.file_name().and_then(|f| f.to_str()).map(String::from))
            .collect();
        self.info
            .write()
            .await
            .metadata
            .insert(types::MODEL_FILES_METADATA_KEY.to_string(), files.join(","));
    }

    /// Keep trying to reach the master from a degraded hybrid
    fn spawn_hybrid_reconnect(self: &Arc<Self>) {
        let node = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(HYBRID_CONNECT_RETRY).await;
                match node.lifecycle() {
                    LifecycleState::Degraded => {}
                    _ => return,
                }
                let Some(connector) = &node.connector else {
                    return;
                };
                match connector.connect().await {
                    Ok(response) => {
                        {
                            let mut info = node.info.write().await;
                            info.connected_to = response.master_id;
                            info.state = NodeState::Online;
                        }
                        node.transition(LifecycleState::Running);
                        info!("Master reached, node no longer degraded");
                        return;
                    }
                    Err(e) => {
                        warn!("Master still unreachable: {}", e);
                    }
                }
            }
        });
    }

    /// Stop every subsystem in reverse order, with bounded timeouts
    pub async fn stop(&self) {
        match self.lifecycle() {
            LifecycleState::Running | LifecycleState::Degraded => {}
            _ => return,
        }
        self.transition(LifecycleState::Stopping);
        info!("Node stopping");

        if let Some(connector) = &self.connector {
            if tokio::time::timeout(STOP_STEP_TIMEOUT, connector.disconnect())
                .await
                .is_err()
            {
                warn!("Connector stop overran its budget, proceeding");
            }
        }

        if let Some(manager) = &self.manager {
            manager.stop();
        }

        if tokio::time::timeout(STOP_STEP_TIMEOUT * 2, self.supervisor.shutdown_all())
            .await
            .is_err()
        {
            warn!("Supervisor stop overran its budget, proceeding");
        }

        if tokio::time::timeout(STOP_STEP_TIMEOUT, self.monitor.stop())
            .await
            .is_err()
        {
            warn!("Monitor stop overran its budget, proceeding");
        }

        self.info.write().await.state = NodeState::Offline;
        self.transition(LifecycleState::Stopped);
        info!("Node stopped");
    }

    fn transition(&self, state: LifecycleState) {
        let _ = self.lifecycle_tx.send(state);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ShepherdConfig;

    fn test_config() -> ShepherdConfig {
        let mut config = ShepherdConfig::default();
        config.node.data_dir = Some(std::env::temp_dir().join(format!(
            "shepherd-test-{}",
            uuid::Uuid::new_v4()
        )));
        config
    }

    #[tokio::test]
    async fn test_standalone_lifecycle() {
        let node = Node::new(test_config(), NodeRole::Standalone).unwrap();
        assert_eq!(node.lifecycle(), LifecycleState::Created);
        assert!(node.manager().is_none());
        assert!(node.executor().is_none());
        assert!(node.connector().is_none());

        node.start().await.unwrap();
        assert_eq!(node.lifecycle(), LifecycleState::Running);

        let info = node.info().await;
        assert_eq!(info.state, NodeState::Online);
        assert!(info.capabilities.cpu_count > 0);
        assert!(info.capabilities.supports_llama);

        node.stop().await;
        assert_eq!(node.lifecycle(), LifecycleState::Stopped);
    }

    #[tokio::test]
    async fn test_master_has_manager_and_scheduler() {
        let node = Node::new(test_config(), NodeRole::Master).unwrap();
        assert!(node.manager().is_some());
        assert!(node.scheduler().is_some());
        assert!(node.executor().is_none());
    }

    #[tokio::test]
    async fn test_client_requires_master_address() {
        let result = Node::new(test_config(), NodeRole::Client);
        assert!(matches!(result, Err(NodeError::InvalidConfig(_))));
    }

    #[tokio::test]
    async fn test_client_unreachable_master_is_fatal() {
        let mut config = test_config();
        config.client.master_address = Some("http://127.0.0.1:1".to_string());
        config.client.heartbeat_timeout_secs = 1;

        let node = Node::new(config, NodeRole::Client).unwrap();
        let result = node.start().await;
        assert!(matches!(result, Err(NodeError::ConnectFailed(_))));
        assert_eq!(node.lifecycle(), LifecycleState::Error);
    }

    #[tokio::test]
    async fn test_hybrid_unreachable_master_degrades() {
        let mut config = test_config();
        config.client.master_address = Some("http://127.0.0.1:1".to_string());
        config.client.heartbeat_timeout_secs = 1;

        let node = Node::new(config, NodeRole::Hybrid).unwrap();
        node.start().await.unwrap();
        assert_eq!(node.lifecycle(), LifecycleState::Degraded);
        assert_eq!(node.info().await.state, NodeState::Degraded);

        node.stop().await;
    }

    #[tokio::test]
    async fn test_hybrid_without_master_runs_master_only() {
        let node = Node::new(test_config(), NodeRole::Hybrid).unwrap();
        assert!(node.manager().is_some());
        assert!(node.executor().is_some());
        assert!(node.connector().is_none());

        node.start().await.unwrap();
        assert_eq!(node.lifecycle(), LifecycleState::Running);
        node.stop().await;
    }

    #[tokio::test]
    async fn test_double_start_rejected() {
        let node = Node::new(test_config(), NodeRole::Standalone).unwrap();
        node.start().await.unwrap();
        assert!(matches!(node.start().await, Err(NodeError::NotStartable)));
        node.stop().await;
    }

    #[tokio::test]
    async fn test_state_subscription() {
        let node = Node::new(test_config(), NodeRole::Standalone).unwrap();
        let mut rx = node.subscribe_state();

        node.start().await.unwrap();
        rx.changed().await.unwrap();
        // The receiver observes at least the latest state.
        assert!(matches!(
            *rx.borrow(),
            LifecycleState::Starting | LifecycleState::Running
        ));

        node.stop().await;
        assert_eq!(node.lifecycle(), LifecycleState::Stopped);
    }

    #[tokio::test]
    async fn test_id_is_stable_and_lowercase() {
        let node = Node::new(test_config(), NodeRole::Standalone).unwrap();
        let info = node.info().await;
        assert!(!info.id.is_empty());
        assert_eq!(info.id, info.id.to_lowercase());
    }
}
