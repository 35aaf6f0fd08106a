//! Heartbeat manager for client nodes
//!
//! Runs a background loop that sends a signed heartbeat to the master:
//! one immediately on start, then one per interval. After `max_retries`
//! consecutive failures the manager enters reconnecting and keeps sending
//! with exponential backoff (1s, 2s, 4s, ... capped at 60s, ±25% jitter)
//! until the master answers again.

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use rand::Rng;
use reqwest::Client;
use thiserror::Error;
use tokio::sync::{watch, Mutex};
use tracing::{debug, error, info, warn};

use crate::node::types::{NodeState, ResourceSnapshot};

use super::protocol::{HealthReport, Heartbeat};

/// Maximum backoff delay while reconnecting
const BACKOFF_CAP: Duration = Duration::from_secs(60);

/// Errors that can occur during a heartbeat send
#[derive(Debug, Error)]
pub enum HeartbeatError {
    #[error("HTTP request failed: {0}")]
    RequestFailed(#[from] reqwest::Error),

    #[error("Server error {status}: {message}")]
    ServerError { status: u16, message: String },

    #[error("Send timed out")]
    Timeout,
}

/// Source of the data carried in each heartbeat
#[async_trait]
pub trait HeartbeatSource: Send + Sync {
    /// The most recent resources sample
    async fn snapshot(&self) -> ResourceSnapshot;

    /// The sender's view of its own state
    async fn state(&self) -> NodeState;

    /// Command IDs currently executing
    async fn active_tasks(&self) -> Vec<String>;

    /// Models currently loaded or running; feeds the scheduler tie-break
    async fn loaded_models(&self) -> u32;
}

/// Callback fired when the master becomes reachable
pub type ConnectCallback = Arc<dyn Fn() + Send + Sync>;

/// Callback fired with the triggering error when the master is lost
pub type DisconnectCallback = Arc<dyn Fn(String) + Send + Sync>;

/// Configuration for the heartbeat manager
#[derive(Debug, Clone)]
pub struct HeartbeatConfig {
    /// Master base URL, e.g. "http://10.0.0.1:8080"
    pub master_url: String,

    /// Sender's stable node ID
    pub node_id: String,

    /// Interval between sends
    pub interval: Duration,

    /// Per-send timeout
    pub timeout: Duration,

    /// Consecutive failures before entering reconnecting
    pub max_retries: u32,

    /// Shared API key; empty disables signing
    pub api_key: String,
}

impl HeartbeatConfig {
    /// Create a config with the default cadence (5s interval, 15s timeout)
    pub fn new(master_url: impl Into<String>, node_id: impl Into<String>) -> Self {
        Self {
            master_url: master_url.into(),
            node_id: node_id.into(),
            interval: Duration::from_secs(5),
            timeout: Duration::from_secs(15),
            max_retries: 3,
            api_key: String::new(),
        }
    }

    /// Set the send interval
    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    /// Set the per-send timeout
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Set the shared API key
    pub fn with_api_key(mut self, key: impl Into<String>) -> Self {
        self.api_key = key.into();
        self
    }
}

/// The heartbeat manager
pub struct HeartbeatManager {
    config: HeartbeatConfig,
    http_client: Client,
    source: Arc<dyn HeartbeatSource>,
    on_connect: Option<ConnectCallback>,
    on_disconnect: Option<DisconnectCallback>,
    connected: AtomicBool,
    consecutive_failures: AtomicU32,
    successful_sends: AtomicU64,
    last_timestamp_millis: Mutex<i64>,
    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,
}

impl HeartbeatManager {
    /// Create a manager; `source` provides the heartbeat body
    pub fn new(config: HeartbeatConfig, source: Arc<dyn HeartbeatSource>) -> Self {
        let http_client = Client::builder()
            .timeout(config.timeout)
            .build()
            .unwrap_or_default();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        Self {
            config,
            http_client,
            source,
            on_connect: None,
            on_disconnect: None,
            connected: AtomicBool::new(false),
            consecutive_failures: AtomicU32::new(0),
            successful_sends: AtomicU64::new(0),
            last_timestamp_millis: Mutex::new(0),
            shutdown_tx,
            shutdown_rx,
        }
    }

    /// Register the connect callback
    pub fn on_connect(mut self, cb: ConnectCallback) -> Self {
        self.on_connect = Some(cb);
        self
    }

    /// Register the disconnect callback
    pub fn on_disconnect(mut self, cb: DisconnectCallback) -> Self {
        self.on_disconnect = Some(cb);
        self
    }

    /// Whether the last send succeeded
    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    /// Total successful sends (the connection-quality counter)
    pub fn successful_sends(&self) -> u64 {
        self.successful_sends.load(Ordering::SeqCst)
    }

    /// Stop the loop; the in-flight send is cancelled by its own timeout
    pub fn stop(&self) {
        let _ = self.shutdown_tx.send(true);
    }

    /// A receiver on the shutdown signal, for spawning
    pub fn shutdown_receiver(&self) -> watch::Receiver<bool> {
        self.shutdown_rx.clone()
    }

    /// Run the heartbeat loop until shutdown
    ///
    /// Sends an immediate heartbeat, then one per interval while connected,
    /// or per backoff delay while reconnecting.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        info!(
            master = %self.config.master_url,
            node = %self.config.node_id,
            interval_secs = self.config.interval.as_secs(),
            "Heartbeat manager started"
        );

        self.beat_once().await;

        loop {
            let delay = self.next_delay();
            tokio::select! {
                _ = tokio::time::sleep(delay) => {
                    self.beat_once().await;
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("Heartbeat manager shutting down");
                        break;
                    }
                }
            }
        }
    }

    /// The delay before the next send, honoring reconnect backoff
    fn next_delay(&self) -> Duration {
        let failures = self.consecutive_failures.load(Ordering::SeqCst);
        if failures < self.config.max_retries {
            return self.config.interval;
        }
        let attempt = failures - self.config.max_retries;
        backoff_with_jitter(attempt, &mut rand::thread_rng())
    }

    async fn beat_once(&self) {
        match self.send_heartbeat().await {
            Ok(()) => {
                let failures = self.consecutive_failures.swap(0, Ordering::SeqCst);
                self.successful_sends.fetch_add(1, Ordering::SeqCst);
                let was_connected = self.connected.swap(true, Ordering::SeqCst);
                if !was_connected {
                    if failures > 0 {
                        info!("Heartbeat recovered after {} failures", failures);
                    }
                    if let Some(cb) = &self.on_connect {
                        cb();
                    }
                } else {
                    debug!("Heartbeat sent");
                }
            }
            Err(e) => {
                let failures = self.consecutive_failures.fetch_add(1, Ordering::SeqCst) + 1;
                if failures == self.config.max_retries {
                    let was_connected = self.connected.swap(false, Ordering::SeqCst);
                    error!(
                        "Heartbeat failed {} consecutive times, entering reconnect: {}",
                        failures, e
                    );
                    if was_connected {
                        if let Some(cb) = &self.on_disconnect {
                            cb(e.to_string());
                        }
                    }
                } else {
                    warn!("Heartbeat failed (attempt {}): {}", failures, e);
                }
            }
        }
    }

    /// Send a single signed heartbeat
    async fn send_heartbeat(&self) -> Result<(), HeartbeatError> {
        let snapshot = self.source.snapshot().await;
        let state = self.source.state().await;
        let active_tasks = self.source.active_tasks().await;
        let loaded_models = self.source.loaded_models().await;
        let health = HealthReport::evaluate(&snapshot);

        let mut heartbeat = Heartbeat {
            node_id: self.config.node_id.clone(),
            timestamp: self.next_timestamp().await,
            resources: snapshot,
            state,
            active_tasks,
            loaded_models,
            health,
            signature: String::new(),
        };
        heartbeat.sign(&self.config.api_key);

        let url = format!("{}/api/master/heartbeat", self.config.master_url);
        let send = self.http_client.post(&url).json(&heartbeat).send();

        let response = tokio::time::timeout(self.config.timeout, send)
            .await
            .map_err(|_| HeartbeatError::Timeout)??;

        if !response.status().is_success() {
            let status = response.status().as_u16();
            let message = response.text().await.unwrap_or_default();
            return Err(HeartbeatError::ServerError { status, message });
        }

        Ok(())
    }

    /// A strictly increasing client-clock timestamp
    async fn next_timestamp(&self) -> DateTime<Utc> {
        let mut last = self.last_timestamp_millis.lock().await;
        let now = Utc::now().timestamp_millis();
        let millis = if now > *last { now } else { *last + 1 };
        *last = millis;
        Utc.timestamp_millis_opt(millis)
            .single()
            .unwrap_or_else(Utc::now)
    }
}

/// Exponential backoff with ±25% jitter, capped at 60s
pub fn backoff_with_jitter<R: Rng>(attempt: u32, rng: &mut R) -> Duration {
    let base_secs = 1u64 << attempt.min(6); // 1, 2, 4, ..., 64
    let base = Duration::from_secs(base_secs).min(BACKOFF_CAP);
    let jitter = rng.gen_range(-0.25..=0.25);
    base.mul_f64(1.0 + jitter)
}

/// Spawn the heartbeat manager as a background task
pub fn spawn_heartbeat(manager: Arc<HeartbeatManager>) -> Arc<HeartbeatManager> {
    let shutdown = manager.shutdown_receiver();
    let runner = Arc::clone(&manager);
    tokio::spawn(async move {
        runner.run(shutdown).await;
    });
    manager
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::mock::StepRng;

    struct StaticSource;

    #[async_trait]
    impl HeartbeatSource for StaticSource {
        async fn snapshot(&self) -> ResourceSnapshot {
            ResourceSnapshot::default()
        }

        async fn state(&self) -> NodeState {
            NodeState::Online
        }

        async fn active_tasks(&self) -> Vec<String> {
            Vec::new()
        }

        async fn loaded_models(&self) -> u32 {
            0
        }
    }

    #[test]
    fn test_config_defaults() {
        let config = HeartbeatConfig::new("http://localhost:8080", "node-a");
        assert_eq!(config.interval, Duration::from_secs(5));
        assert_eq!(config.timeout, Duration::from_secs(15));
        assert_eq!(config.max_retries, 3);
    }

    #[test]
    fn test_backoff_progression() {
        let mut rng = StepRng::new(u64::MAX / 2, 0); // midpoint => near-zero jitter
        let delays: Vec<u64> = (0..8)
            .map(|a| backoff_with_jitter(a, &mut rng).as_secs())
            .collect();

        // Roughly 1, 2, 4, 8, 16, 32, 60, 60 around the jitter window.
        assert!(delays[0] <= 2);
        assert!(delays[1] >= 1 && delays[1] <= 3);
        assert!(delays[5] >= 24 && delays[5] <= 40);
        assert!(delays[6] <= 75);
        assert_eq!(delays[6], delays[7]);
    }

    #[test]
    fn test_backoff_jitter_bounds() {
        let mut rng = rand::thread_rng();
        for attempt in 0..10 {
            let d = backoff_with_jitter(attempt, &mut rng);
            let base = (1u64 << attempt.min(6)).min(60) as f64;
            assert!(d.as_secs_f64() >= base * 0.75 - 1e-6);
            assert!(d.as_secs_f64() <= base * 1.25 + 1e-6);
        }
    }

    #[tokio::test]
    async fn test_timestamps_strictly_increase() {
        let manager = HeartbeatManager::new(
            HeartbeatConfig::new("http://localhost:1", "node-a"),
            Arc::new(StaticSource),
        );

        let a = manager.next_timestamp().await;
        let b = manager.next_timestamp().await;
        let c = manager.next_timestamp().await;
        assert!(b > a);
        assert!(c > b);
    }

    #[tokio::test]
    async fn test_disconnect_fires_after_max_retries() {
        let fired = Arc::new(AtomicBool::new(false));
        let fired_clone = Arc::clone(&fired);

        // Nothing listens on this port; every send fails fast.
        let config = HeartbeatConfig::new("http://127.0.0.1:1", "node-a")
            .with_timeout(Duration::from_millis(500));
        let manager = Arc::new(
            HeartbeatManager::new(config, Arc::new(StaticSource)).on_disconnect(Arc::new(
                move |_err| {
                    fired_clone.store(true, Ordering::SeqCst);
                },
            )),
        );

        // The transition only fires from a previously connected state.
        manager.connected.store(true, Ordering::SeqCst);
        for _ in 0..3 {
            manager.beat_once().await;
        }

        assert!(fired.load(Ordering::SeqCst));
        assert!(!manager.is_connected());
    }

    #[tokio::test]
    async fn test_next_delay_uses_backoff_when_reconnecting() {
        let manager = HeartbeatManager::new(
            HeartbeatConfig::new("http://127.0.0.1:1", "node-a"),
            Arc::new(StaticSource),
        );

        assert_eq!(manager.next_delay(), Duration::from_secs(5));

        manager.consecutive_failures.store(5, Ordering::SeqCst);
        // attempt = 5 - 3 = 2 => base 4s, jittered within [3, 5].
        let delay = manager.next_delay();
        assert!(delay >= Duration::from_secs(3));
        assert!(delay <= Duration::from_secs(5));
    }
}
