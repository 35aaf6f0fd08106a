//! Master Connector (client side)
//!
//! Orchestrates the heartbeat manager and the command executor on a
//! client node: registers with the master, long-polls the per-node
//! command queue, runs commands, and delivers results at-least-once with
//! a bounded redelivery buffer. Polling pauses while the master is
//! unreachable and resumes with a fresh registration on reconnect.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use reqwest::Client;
use thiserror::Error;
use tokio::sync::{watch, Mutex, RwLock};
use tracing::{debug, info, warn};

use crate::node::types::NodeInfo;
use crate::server::envelope::Envelope;

use super::executor::CommandExecutor;
use super::heartbeat::{HeartbeatConfig, HeartbeatManager, HeartbeatSource};
use super::protocol::{Command, CommandResult, RegisterResponse};

/// Deadline for flushing buffered results during disconnect
const FINAL_FLUSH_DEADLINE: Duration = Duration::from_secs(30);

/// Errors from the master connector
#[derive(Error, Debug)]
pub enum ConnectorError {
    #[error("Registration failed: {0}")]
    RegistrationFailed(String),

    #[error("HTTP request failed: {0}")]
    RequestFailed(#[from] reqwest::Error),
}

/// Configuration for the connector
#[derive(Debug, Clone)]
pub struct ConnectorConfig {
    /// Master base URL
    pub master_url: String,

    /// Command poll cadence
    pub poll_interval: Duration,

    /// Result payloads retained for redelivery
    pub result_buffer_size: usize,

    /// Shared API key; empty disables signing
    pub api_key: String,
}

/// The client-side master connector
pub struct MasterConnector {
    config: ConnectorConfig,
    http_client: Client,
    info: Arc<RwLock<NodeInfo>>,
    executor: Arc<CommandExecutor>,
    heartbeat: Arc<HeartbeatManager>,
    polling_paused: Arc<AtomicBool>,
    unacked: Mutex<VecDeque<CommandResult>>,
    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,
}

impl MasterConnector {
    /// Create a connector
    ///
    /// `info` is the shared node snapshot owned by the node lifecycle;
    /// `source` feeds the embedded heartbeat manager.
    pub fn new(
        config: ConnectorConfig,
        heartbeat_config: HeartbeatConfig,
        info: Arc<RwLock<NodeInfo>>,
        executor: Arc<CommandExecutor>,
        source: Arc<dyn HeartbeatSource>,
    ) -> Arc<Self> {
        let polling_paused = Arc::new(AtomicBool::new(true));

        let paused_on_connect = Arc::clone(&polling_paused);
        let paused_on_disconnect = Arc::clone(&polling_paused);
        let heartbeat = Arc::new(
            HeartbeatManager::new(heartbeat_config, source)
                .on_connect(Arc::new(move || {
                    paused_on_connect.store(false, Ordering::SeqCst);
                }))
                .on_disconnect(Arc::new(move |err| {
                    warn!("Master lost ({}), pausing command polling", err);
                    paused_on_disconnect.store(true, Ordering::SeqCst);
                })),
        );

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        Arc::new(Self {
            config,
            http_client: Client::builder()
                .timeout(Duration::from_secs(30))
                .build()
                .unwrap_or_default(),
            info,
            executor,
            heartbeat,
            polling_paused,
            unacked: Mutex::new(VecDeque::new()),
            shutdown_tx,
            shutdown_rx,
        })
    }

    /// The embedded heartbeat manager
    pub fn heartbeat(&self) -> &Arc<HeartbeatManager> {
        &self.heartbeat
    }

    /// Whether command polling is currently paused
    pub fn is_paused(&self) -> bool {
        self.polling_paused.load(Ordering::SeqCst)
    }

    /// Register with the master and start the heartbeat and poll loops
    pub async fn connect(self: &Arc<Self>) -> Result<RegisterResponse, ConnectorError> {
        let outcome = self.register().await?;
        self.polling_paused.store(false, Ordering::SeqCst);

        let hb = Arc::clone(&self.heartbeat);
        let hb_shutdown = hb.shutdown_receiver();
        tokio::spawn(async move {
            hb.run(hb_shutdown).await;
        });

        let connector = Arc::clone(self);
        let shutdown = self.shutdown_rx.clone();
        tokio::spawn(async move {
            connector.poll_loop(shutdown).await;
        });

        info!(master = %self.config.master_url, "Connected to master");
        Ok(outcome)
    }

    /// POST the node's full info to the master
    ///
    /// On an ID conflict the master keeps the newer registration, so a
    /// conflict outcome is still a success for this node.
    pub async fn register(&self) -> Result<RegisterResponse, ConnectorError> {
        let info = self.info.read().await.clone();
        let url = format!("{}/api/master/clients/register", self.config.master_url);

        let response = self.http_client.post(&url).json(&info).send().await?;
        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(ConnectorError::RegistrationFailed(format!(
                "{}: {}",
                status, body
            )));
        }

        let envelope: Envelope<RegisterResponse> = response.json().await?;
        let outcome = envelope.data.unwrap_or(RegisterResponse {
            accepted: true,
            conflict: false,
            master_id: None,
        });
        if outcome.conflict {
            info!("Master replaced a previous registration for this node ID");
        }
        Ok(outcome)
    }

    /// Stop polling, let in-flight commands finish, flush buffered
    /// results under a final deadline, then stop the heartbeat
    pub async fn disconnect(&self) {
        info!("Disconnecting from master");
        let _ = self.shutdown_tx.send(true);
        self.polling_paused.store(true, Ordering::SeqCst);

        let _ = tokio::time::timeout(FINAL_FLUSH_DEADLINE, self.flush_results()).await;
        self.heartbeat.stop();
    }

    async fn poll_loop(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.config.poll_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        let mut was_paused = false;

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if self.polling_paused.load(Ordering::SeqCst) {
                        was_paused = true;
                        continue;
                    }
                    if was_paused {
                        // The master restarted while we were away: its
                        // registry is in-memory only, so register again
                        // before resuming the queue.
                        match self.register().await {
                            Ok(_) => {
                                info!("Re-registered with master after reconnect");
                                was_paused = false;
                            }
                            Err(e) => {
                                warn!("Re-registration failed: {}", e);
                                continue;
                            }
                        }
                    }
                    // Retry anything the master has not acknowledged yet.
                    self.flush_results().await;

                    // Admission control: no free executor slot, no poll.
                    if !self.executor.has_capacity() {
                        debug!("Executor saturated, skipping this poll");
                        continue;
                    }

                    match self.poll_next_command().await {
                        Ok(Some(command)) => {
                            let connector = Arc::clone(&self);
                            tokio::spawn(async move {
                                connector.run_command(command).await;
                            });
                        }
                        Ok(None) => {}
                        Err(e) => {
                            debug!("Command poll failed: {}", e);
                        }
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        debug!("Connector poll loop exiting");
                        break;
                    }
                }
            }
        }
    }

    /// Long-poll the master for the next command
    async fn poll_next_command(&self) -> Result<Option<Command>, ConnectorError> {
        let node_id = self.info.read().await.id.clone();
        let wait_millis = self.config.poll_interval.as_millis() as u64;
        let url = format!(
            "{}/api/master/clients/{}/commands/next?waitMillis={}",
            self.config.master_url, node_id, wait_millis
        );

        let response = self.http_client.get(&url).send().await?;
        if !response.status().is_success() {
            return Ok(None);
        }

        let envelope: Envelope<Option<Command>> = response.json().await?;
        let Some(Some(command)) = envelope.data else {
            return Ok(None);
        };

        if !command.verify(&self.config.api_key) {
            warn!(command = %command.id, "Dropping command with a bad signature");
            return Ok(None);
        }
        Ok(Some(command))
    }

    /// Execute a command and deliver its result
    async fn run_command(&self, command: Command) {
        let result = self.executor.execute(command).await;
        self.buffer_result(result).await;
        self.flush_results().await;
    }

    /// Retain a result for at-least-once delivery, bounded to the last N
    async fn buffer_result(&self, result: CommandResult) {
        let mut unacked = self.unacked.lock().await;
        unacked.push_back(result);
        while unacked.len() > self.config.result_buffer_size {
            let dropped = unacked.pop_front();
            if let Some(dropped) = dropped {
                warn!(
                    command = %dropped.command_id,
                    "Result buffer full, dropping oldest unacked result"
                );
            }
        }
    }

    /// Post every buffered result until the master acknowledges
    async fn flush_results(&self) {
        let pending: Vec<CommandResult> = {
            let unacked = self.unacked.lock().await;
            unacked.iter().cloned().collect()
        };
        if pending.is_empty() {
            return;
        }

        let node_id = self.info.read().await.id.clone();
        let url = format!(
            "{}/api/master/clients/{}/results",
            self.config.master_url, node_id
        );

        for result in pending {
            match self.http_client.post(&url).json(&result).send().await {
                Ok(response) if response.status().is_success() => {
                    let mut unacked = self.unacked.lock().await;
                    unacked.retain(|r| r.command_id != result.command_id);
                }
                Ok(response) => {
                    debug!(
                        command = %result.command_id,
                        status = %response.status(),
                        "Result not acknowledged, will retry"
                    );
                }
                Err(e) => {
                    debug!(command = %result.command_id, "Result delivery failed: {}", e);
                    // Transport failure: later results would fail the same way.
                    break;
                }
            }
        }
    }

    /// Number of results awaiting acknowledgement
    pub async fn unacked_count(&self) -> usize {
        self.unacked.lock().await.len()
    }
}
