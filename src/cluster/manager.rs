//! Node Manager (master side)
//!
//! The authoritative registry of connected client nodes: registration,
//! heartbeat application in monotonic timestamp order, per-node pending
//! command queues with long-poll dequeue, an idempotent result sink keyed
//! by command ID, liveness sweeping and a state-change event broadcast.
//!
//! Command enqueue/dequeue and result ingestion are serialized per node;
//! across nodes they are independent.

use std::collections::{HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;
use thiserror::Error;
use tokio::sync::{broadcast, watch, Mutex, Notify};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::node::types::{NodeInfo, NodeState};

use super::protocol::{Command, CommandResult, Heartbeat};

/// Bound on the retained result sink
const RESULT_SINK_CAP: usize = 1024;

/// Errors from the node manager
#[derive(Error, Debug)]
pub enum ManagerError {
    #[error("Node '{0}' is not registered")]
    UnknownNode(String),

    #[error("Signature verification failed for node '{0}'")]
    NotAuthenticated(String),
}

/// Configuration for the node manager
#[derive(Debug, Clone)]
pub struct NodeManagerConfig {
    /// Liveness sweep cadence
    pub health_check_interval: Duration,

    /// Heartbeat age beyond which a node goes offline
    pub timeout_threshold: Duration,

    /// Shared API key; empty disables signature checks
    pub api_key: String,
}

impl Default for NodeManagerConfig {
    fn default() -> Self {
        Self {
            health_check_interval: Duration::from_secs(5),
            timeout_threshold: Duration::from_secs(15),
            api_key: String::new(),
        }
    }
}

/// A node state transition, broadcast to subscribers
#[derive(Debug, Clone, Serialize)]
pub struct NodeEvent {
    #[serde(rename = "nodeId")]
    pub node_id: String,
    #[serde(rename = "oldState")]
    pub old_state: NodeState,
    #[serde(rename = "newState")]
    pub new_state: NodeState,
    pub timestamp: DateTime<Utc>,
}

/// Outcome of a registration
#[derive(Debug, Clone, Copy, Serialize)]
pub struct RegisterOutcome {
    /// Always true; the newer registration wins
    pub accepted: bool,

    /// True when an entry with the same ID but a different address was
    /// replaced
    pub conflict: bool,
}

/// Per-node pending command queue with long-poll support
struct NodeQueue {
    items: Mutex<VecDeque<Command>>,
    notify: Notify,
}

impl NodeQueue {
    fn new() -> Self {
        Self {
            items: Mutex::new(VecDeque::new()),
            notify: Notify::new(),
        }
    }
}

/// The master-side node manager
pub struct NodeManager {
    config: NodeManagerConfig,
    nodes: DashMap<String, NodeInfo>,
    queues: DashMap<String, Arc<NodeQueue>>,
    results: DashMap<Uuid, CommandResult>,
    result_order: Mutex<VecDeque<Uuid>>,
    seen_results: DashMap<String, HashSet<Uuid>>,
    events_tx: broadcast::Sender<NodeEvent>,
    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,
}

impl NodeManager {
    /// Create a node manager
    pub fn new(config: NodeManagerConfig) -> Self {
        let (events_tx, _) = broadcast::channel(256);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        Self {
            config,
            nodes: DashMap::new(),
            queues: DashMap::new(),
            results: DashMap::new(),
            result_order: Mutex::new(VecDeque::new()),
            seen_results: DashMap::new(),
            events_tx,
            shutdown_tx,
            shutdown_rx,
        }
    }

    /// Subscribe to node state-change events
    pub fn subscribe_events(&self) -> broadcast::Receiver<NodeEvent> {
        self.events_tx.subscribe()
    }

    /// Spawn the liveness sweeper
    pub fn start(self: &Arc<Self>) {
        let manager = Arc::clone(self);
        let mut shutdown = self.shutdown_rx.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(manager.config.health_check_interval);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        manager.sweep_once().await;
                    }
                    _ = shutdown.changed() => {
                        if *shutdown.borrow() {
                            break;
                        }
                    }
                }
            }
        });
        info!(
            interval_secs = self.config.health_check_interval.as_secs(),
            "Node manager sweeper started"
        );
    }

    /// Stop the sweeper
    pub fn stop(&self) {
        let _ = self.shutdown_tx.send(true);
    }

    /// Register a node; the newer registration always wins
    pub fn register(&self, mut info: NodeInfo) -> RegisterOutcome {
        let conflict = match self.nodes.get(&info.id) {
            Some(existing) => {
                existing.address != info.address || existing.port != info.port
            }
            None => false,
        };

        let old_state = self
            .nodes
            .get(&info.id)
            .map(|n| n.state)
            .unwrap_or(NodeState::Offline);

        info.state = NodeState::Online;
        info.last_heartbeat = Some(Utc::now());
        let node_id = info.id.clone();

        self.queues
            .entry(node_id.clone())
            .or_insert_with(|| Arc::new(NodeQueue::new()));
        self.nodes.insert(node_id.clone(), info);

        if conflict {
            warn!(node = %node_id, "Re-registration with a new address, replacing entry");
        } else {
            info!(node = %node_id, "Node registered");
        }
        if old_state != NodeState::Online {
            self.emit(&node_id, old_state, NodeState::Online);
        }

        RegisterOutcome {
            accepted: true,
            conflict,
        }
    }

    /// Apply a heartbeat
    ///
    /// Heartbeats are applied only when their timestamp is strictly newer
    /// than the stored one; older duplicates are dropped without any
    /// visible state change.
    pub fn heartbeat(&self, hb: &Heartbeat) -> Result<(), ManagerError> {
        if !hb.verify(&self.config.api_key) {
            return Err(ManagerError::NotAuthenticated(hb.node_id.clone()));
        }

        let mut node = self
            .nodes
            .get_mut(&hb.node_id)
            .ok_or_else(|| ManagerError::UnknownNode(hb.node_id.clone()))?;

        if let Some(stored) = node.last_heartbeat {
            if hb.timestamp <= stored {
                debug!(node = %hb.node_id, "Dropping out-of-order heartbeat");
                return Ok(());
            }
        }

        let old_state = node.state;
        node.last_heartbeat = Some(hb.timestamp);
        node.resources = Some(hb.resources.clone());
        node.loaded_models = hb.loaded_models;
        // Disabled is an administrative override the heartbeat cannot lift.
        if old_state != NodeState::Disabled {
            node.state = hb.state;
        }
        let new_state = node.state;
        drop(node);

        if old_state != new_state {
            if old_state == NodeState::Offline {
                // A returning node gets a fresh result-dedup window.
                self.seen_results.remove(&hb.node_id);
                info!(node = %hb.node_id, "Node back online");
            }
            self.emit(&hb.node_id, old_state, new_state);
        }

        Ok(())
    }

    /// Remove a node and its queue entirely
    pub fn deregister(&self, node_id: &str) -> Result<NodeInfo, ManagerError> {
        let (_, info) = self
            .nodes
            .remove(node_id)
            .ok_or_else(|| ManagerError::UnknownNode(node_id.to_string()))?;
        self.queues.remove(node_id);
        self.seen_results.remove(node_id);
        info!(node = %node_id, "Node deregistered");
        self.emit(node_id, info.state, NodeState::Offline);
        Ok(info)
    }

    /// All registered nodes
    pub fn list(&self) -> Vec<NodeInfo> {
        let mut nodes: Vec<NodeInfo> = self.nodes.iter().map(|n| n.clone()).collect();
        nodes.sort_by(|a, b| a.id.cmp(&b.id));
        nodes
    }

    /// One node by ID
    pub fn get(&self, node_id: &str) -> Option<NodeInfo> {
        self.nodes.get(node_id).map(|n| n.clone())
    }

    /// Queue a command for its target node
    pub async fn enqueue_command(&self, command: Command) -> Result<(), ManagerError> {
        let queue = self
            .queues
            .get(&command.to_node_id)
            .map(|q| Arc::clone(&q))
            .ok_or_else(|| ManagerError::UnknownNode(command.to_node_id.clone()))?;

        debug!(
            command = %command.id,
            node = %command.to_node_id,
            "Command enqueued"
        );
        queue.items.lock().await.push_back(command);
        queue.notify.notify_one();
        Ok(())
    }

    /// Dequeue the next command for a node, waiting up to `wait`
    ///
    /// This is the long-poll endpoint's backend; commands come out in
    /// enqueue order.
    pub async fn dequeue_command(
        &self,
        node_id: &str,
        wait: Duration,
    ) -> Result<Option<Command>, ManagerError> {
        let queue = self
            .queues
            .get(node_id)
            .map(|q| Arc::clone(&q))
            .ok_or_else(|| ManagerError::UnknownNode(node_id.to_string()))?;

        let deadline = tokio::time::Instant::now() + wait;
        loop {
            if let Some(command) = queue.items.lock().await.pop_front() {
                return Ok(Some(command));
            }
            let now = tokio::time::Instant::now();
            if now >= deadline {
                return Ok(None);
            }
            let _ = tokio::time::timeout_at(deadline, queue.notify.notified()).await;
        }
    }

    /// Pending commands for a node
    pub async fn pending_count(&self, node_id: &str) -> usize {
        match self.queues.get(node_id) {
            Some(q) => q.items.lock().await.len(),
            None => 0,
        }
    }

    /// Ingest a command result, idempotently
    ///
    /// Returns true when the result was stored, false when a result for
    /// the same command ID had already arrived (duplicate delivery).
    pub async fn ingest_result(&self, result: CommandResult) -> bool {
        let node_id = result.from_node_id.clone();
        let mut seen = self.seen_results.entry(node_id).or_default();
        if !seen.insert(result.command_id) {
            debug!(command = %result.command_id, "Duplicate result dropped");
            return false;
        }
        if self.results.contains_key(&result.command_id) {
            return false;
        }
        drop(seen);

        let command_id = result.command_id;
        self.results.insert(command_id, result);

        let mut order = self.result_order.lock().await;
        order.push_back(command_id);
        while order.len() > RESULT_SINK_CAP {
            if let Some(evicted) = order.pop_front() {
                self.results.remove(&evicted);
            }
        }
        true
    }

    /// Look up the result for a command
    pub fn get_result(&self, command_id: &Uuid) -> Option<CommandResult> {
        self.results.get(command_id).map(|r| r.clone())
    }

    /// One liveness sweep: stale nodes go offline and their queues drain
    /// to the error sink
    pub async fn sweep_once(&self) {
        let threshold = self.config.timeout_threshold.as_secs() as i64;
        let mut gone_offline = Vec::new();

        for mut node in self.nodes.iter_mut() {
            if matches!(node.state, NodeState::Offline | NodeState::Disabled) {
                continue;
            }
            if node.is_stale(threshold) {
                let old_state = node.state;
                node.state = NodeState::Offline;
                gone_offline.push((node.id.clone(), old_state));
            }
        }

        for (node_id, old_state) in gone_offline {
            warn!(node = %node_id, "Node missed heartbeats, marking offline");
            self.emit(&node_id, old_state, NodeState::Offline);
            self.drain_queue_to_errors(&node_id).await;
        }
    }

    /// Fail every pending command of an offline node into the result sink
    async fn drain_queue_to_errors(&self, node_id: &str) {
        let Some(queue) = self.queues.get(node_id).map(|q| Arc::clone(&q)) else {
            return;
        };
        let drained: Vec<Command> = queue.items.lock().await.drain(..).collect();
        for command in drained {
            let result = CommandResult::failed(&command, node_id, 0, "node went offline");
            self.ingest_result(result).await;
        }
    }

    fn emit(&self, node_id: &str, old_state: NodeState, new_state: NodeState) {
        let _ = self.events_tx.send(NodeEvent {
            node_id: node_id.to_string(),
            old_state,
            new_state,
            timestamp: Utc::now(),
        });
    }
}
