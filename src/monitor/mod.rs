//! Resource Monitor
//!
//! Samples CPU, memory, disk, load, uptime, GPUs and the llama.cpp binary
//! inventory on a fixed ticker, publishing immutable snapshots to
//! subscribers and into a bounded history ring.
//!
//! Sampling is single-threaded: one sample is in flight at a time, and when
//! a sample overruns the interval the next tick is skipped rather than
//! queued. Subscribers get snapshots through a one-slot mailbox with
//! non-blocking delivery - a slow subscriber never blocks sampling.

pub mod binaries;
pub mod gpu;

use std::collections::VecDeque;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use sysinfo::{Disks, System};
use thiserror::Error;
use tokio::sync::{mpsc, watch, Mutex, RwLock};
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::config::MonitorSection;
use crate::node::types::{Capabilities, GpuInfo, LlamaBinary, ResourceSnapshot};

use gpu::GpuProvider;

/// How often the llama.cpp inventory is re-detected
const BINARY_REFRESH_INTERVAL: Duration = Duration::from_secs(60);

/// Errors from the resource monitor
#[derive(Error, Debug)]
pub enum MonitorError {
    #[error("Initial resource sample failed: {0}")]
    InitialSample(String),

    #[error("Monitor is already running")]
    AlreadyRunning,
}

/// Sysinfo-backed sampler state, refreshed in place between samples
struct Sampler {
    system: System,
    disks: Disks,
}

impl Sampler {
    fn new() -> Self {
        Self {
            system: System::new_all(),
            disks: Disks::new_with_refreshed_list(),
        }
    }
}

/// Cached llama.cpp inventory with its refresh deadline
struct BinaryCache {
    binaries: Vec<LlamaBinary>,
    rocm_version: Option<String>,
    refreshed_at: Option<Instant>,
}

/// The resource monitor
///
/// Shared as `Arc<ResourceMonitor>`; `start` spawns the sampling loop and
/// `stop` cancels it.
pub struct ResourceMonitor {
    config: MonitorSection,
    providers: Vec<Box<dyn GpuProvider>>,
    sampler: Mutex<Sampler>,
    latest: RwLock<Option<ResourceSnapshot>>,
    history: RwLock<VecDeque<ResourceSnapshot>>,
    subscribers: RwLock<Vec<mpsc::Sender<ResourceSnapshot>>>,
    binary_cache: Mutex<BinaryCache>,
    binaries_invalidated: AtomicBool,
    running: AtomicBool,
    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,
}

impl ResourceMonitor {
    /// Create a monitor with the default provider set
    pub fn new(config: MonitorSection) -> Self {
        Self::with_providers(config, gpu::default_providers())
    }

    /// Create a monitor with explicit providers (used by tests)
    pub fn with_providers(config: MonitorSection, providers: Vec<Box<dyn GpuProvider>>) -> Self {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        Self {
            config,
            providers,
            sampler: Mutex::new(Sampler::new()),
            latest: RwLock::new(None),
            history: RwLock::new(VecDeque::new()),
            subscribers: RwLock::new(Vec::new()),
            binary_cache: Mutex::new(BinaryCache {
                binaries: Vec::new(),
                rocm_version: None,
                refreshed_at: None,
            }),
            binaries_invalidated: AtomicBool::new(false),
            running: AtomicBool::new(false),
            shutdown_tx,
            shutdown_rx,
        }
    }

    /// Take the initial sample and spawn the sampling loop
    ///
    /// Fails only if the initial snapshot cannot be obtained.
    pub async fn start(self: &Arc<Self>) -> Result<(), MonitorError> {
        if self.running.swap(true, Ordering::SeqCst) {
            return Err(MonitorError::AlreadyRunning);
        }

        let snapshot = self.sample().await;
        if snapshot.cpu_total_millicores == 0 && snapshot.mem_total_bytes == 0 {
            self.running.store(false, Ordering::SeqCst);
            return Err(MonitorError::InitialSample(
                "no CPU or memory information available".to_string(),
            ));
        }
        self.publish(snapshot).await;

        let monitor = Arc::clone(self);
        let shutdown = self.shutdown_rx.clone();
        tokio::spawn(async move {
            monitor.run(shutdown).await;
        });

        info!(
            interval_secs = self.config.interval_secs,
            "Resource monitor started"
        );
        Ok(())
    }

    /// Cancel the sampling loop and drop all subscriber mailboxes
    pub async fn stop(&self) {
        let _ = self.shutdown_tx.send(true);
        self.running.store(false, Ordering::SeqCst);
        self.subscribers.write().await.clear();
        info!("Resource monitor stopped");
    }

    /// Subscribe to snapshots through a one-slot mailbox
    ///
    /// Delivery is best-effort: when the slot is full the snapshot is
    /// dropped for that subscriber.
    pub async fn subscribe(&self) -> mpsc::Receiver<ResourceSnapshot> {
        let (tx, rx) = mpsc::channel(1);
        self.subscribers.write().await.push(tx);
        rx
    }

    /// The most recent snapshot, if any sample has completed
    pub async fn latest(&self) -> Option<ResourceSnapshot> {
        self.latest.read().await.clone()
    }

    /// The retained history, oldest first
    pub async fn history(&self) -> Vec<ResourceSnapshot> {
        self.history.read().await.iter().cloned().collect()
    }

    /// Force the llama.cpp inventory to be re-detected on the next sample
    pub fn invalidate_binaries(&self) {
        self.binaries_invalidated.store(true, Ordering::SeqCst);
    }

    /// Derive static capabilities from the latest snapshot
    pub async fn capabilities(&self, supports_python: bool) -> Capabilities {
        let snapshot = self.latest().await.unwrap_or_default();
        let conda_envs = if supports_python {
            probe_conda_envs().await
        } else {
            Vec::new()
        };

        Capabilities {
            cpu_count: (snapshot.cpu_total_millicores / 1000) as u32,
            memory_bytes: snapshot.mem_total_bytes,
            gpu_count: snapshot.gpus.len() as u32,
            gpu_memory_bytes: snapshot.gpus.iter().map(|g| g.total_memory_bytes).sum(),
            gpu_name: snapshot
                .gpus
                .first()
                .map(|g| g.name.clone())
                .unwrap_or_default(),
            supports_llama: true,
            supports_python,
            conda_envs,
        }
    }

    async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut ticker =
            tokio::time::interval(Duration::from_secs(self.config.interval_secs.max(1)));
        // Overrunning samples skip ticks instead of queueing them.
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        ticker.tick().await; // immediate first tick already consumed by start()

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let snapshot = self.sample().await;
                    self.publish(snapshot).await;
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        debug!("Resource monitor loop exiting");
                        break;
                    }
                }
            }
        }
    }

    /// Take one full sample
    async fn sample(&self) -> ResourceSnapshot {
        let (cpu_used, cpu_total, mem_used, mem_total, disk_used, disk_total, kernel, uptime) = {
            let mut sampler = self.sampler.lock().await;
            sampler.system.refresh_cpu_all();
            sampler.system.refresh_memory();
            sampler.disks.refresh(true);

            let cores = sampler.system.cpus().len() as u64;
            let cpu_total = cores * 1000;
            let cpu_used =
                ((sampler.system.global_cpu_usage() as f64 / 100.0) * cpu_total as f64) as u64;

            let mem_total = sampler.system.total_memory();
            let mem_used = sampler.system.used_memory();

            let (disk_total, disk_used) = root_disk_usage(&sampler.disks);

            (
                cpu_used,
                cpu_total,
                mem_used,
                mem_total,
                disk_used,
                disk_total,
                System::kernel_version().unwrap_or_default(),
                System::uptime(),
            )
        };

        let load = System::load_average();
        let gpus = self.detect_gpus().await;
        let (binaries, rocm_version) = self.current_binaries(&gpus).await;

        ResourceSnapshot {
            cpu_used_millicores: cpu_used,
            cpu_total_millicores: cpu_total,
            mem_used_bytes: mem_used,
            mem_total_bytes: mem_total,
            disk_used_bytes: disk_used,
            disk_total_bytes: disk_total,
            gpus,
            load_average: [load.one, load.five, load.fifteen],
            uptime_seconds: uptime,
            kernel_version: kernel,
            rocm_version,
            llama_binaries: binaries,
            sampled_at: Utc::now(),
        }
    }

    /// Run every provider, silently downgrading the ones that fail
    async fn detect_gpus(&self) -> Vec<GpuInfo> {
        let mut gpus = Vec::new();
        for provider in &self.providers {
            if !provider.is_available().await {
                continue;
            }
            match provider.detect().await {
                Ok(found) => gpus.extend(found),
                Err(e) => {
                    debug!(provider = provider.name(), "GPU probe failed: {}", e);
                }
            }
        }
        gpus
    }

    /// The llama.cpp inventory, refreshed once a minute or on invalidation
    async fn current_binaries(&self, gpus: &[GpuInfo]) -> (Vec<LlamaBinary>, Option<String>) {
        let mut cache = self.binary_cache.lock().await;

        let stale = match cache.refreshed_at {
            Some(at) => at.elapsed() >= BINARY_REFRESH_INTERVAL,
            None => true,
        };
        if stale || self.binaries_invalidated.swap(false, Ordering::SeqCst) {
            let gpu_memory: u64 = gpus.iter().map(|g| g.total_memory_bytes).sum();
            cache.binaries =
                binaries::detect_binaries(&self.config.llama_binaries, gpu_memory).await;
            cache.rocm_version = gpu::detect_rocm_version().await;
            cache.refreshed_at = Some(Instant::now());
        }

        (cache.binaries.clone(), cache.rocm_version.clone())
    }

    /// Store a snapshot and fan it out
    async fn publish(&self, snapshot: ResourceSnapshot) {
        {
            let mut history = self.history.write().await;
            history.push_back(snapshot.clone());
            while history.len() > self.config.history_size {
                history.pop_front();
            }
        }
        *self.latest.write().await = Some(snapshot.clone());

        let mut subscribers = self.subscribers.write().await;
        subscribers.retain(|tx| match tx.try_send(snapshot.clone()) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => true, // slot taken, drop this one
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        });
    }
}

/// Usage of the root filesystem, falling back to the largest disk
fn root_disk_usage(disks: &Disks) -> (u64, u64) {
    let root = disks
        .iter()
        .find(|d| d.mount_point() == std::path::Path::new("/"))
        .or_else(|| disks.iter().max_by_key(|d| d.total_space()));

    match root {
        Some(d) => (d.total_space(), d.total_space() - d.available_space()),
        None => (0, 0),
    }
}

/// Enumerate conda environment names, tolerating a missing conda
async fn probe_conda_envs() -> Vec<String> {
    let output = tokio::time::timeout(
        Duration::from_secs(8),
        tokio::process::Command::new("conda")
            .args(["env", "list"])
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .output(),
    )
    .await;

    match output {
        Ok(Ok(out)) if out.status.success() => {
            parse_conda_env_list(&String::from_utf8_lossy(&out.stdout))
        }
        _ => {
            warn!("conda env enumeration unavailable");
            Vec::new()
        }
    }
}

/// Parse `conda env list` output into environment names
pub fn parse_conda_env_list(out: &str) -> Vec<String> {
    out.lines()
        .filter(|l| !l.trim_start().starts_with('#') && !l.trim().is_empty())
        .filter_map(|l| l.split_whitespace().next())
        .filter(|name| *name != "*")
        .map(|s| s.to_string())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::types::GpuVendor;
    use async_trait::async_trait;

    struct FakeGpuProvider {
        gpus: Vec<GpuInfo>,
    }

    #[async_trait]
    impl GpuProvider for FakeGpuProvider {
        fn name(&self) -> &'static str {
            "fake"
        }

        fn vendor(&self) -> GpuVendor {
            GpuVendor::Nvidia
        }

        async fn is_available(&self) -> bool {
            true
        }

        async fn detect(&self) -> Result<Vec<GpuInfo>, gpu::GpuError> {
            Ok(self.gpus.clone())
        }
    }

    struct FailingProvider;

    #[async_trait]
    impl GpuProvider for FailingProvider {
        fn name(&self) -> &'static str {
            "failing"
        }

        fn vendor(&self) -> GpuVendor {
            GpuVendor::Amd
        }

        async fn is_available(&self) -> bool {
            true
        }

        async fn detect(&self) -> Result<Vec<GpuInfo>, gpu::GpuError> {
            Err(gpu::GpuError::ProbeFailed("boom".to_string()))
        }
    }

    fn fake_gpu(index: u32) -> GpuInfo {
        GpuInfo {
            index,
            vendor: GpuVendor::Nvidia,
            name: "Fake GPU".to_string(),
            total_memory_bytes: 8 << 30,
            used_memory_bytes: 1 << 30,
            temperature_c: None,
            utilization_percent: None,
            power_watts: None,
            driver_version: None,
        }
    }

    fn test_config() -> MonitorSection {
        MonitorSection {
            interval_secs: 1,
            history_size: 3,
            llama_binaries: Vec::new(),
        }
    }

    #[tokio::test]
    async fn test_start_takes_initial_sample() {
        let monitor = Arc::new(ResourceMonitor::with_providers(
            test_config(),
            vec![Box::new(FakeGpuProvider {
                gpus: vec![fake_gpu(0)],
            })],
        ));

        monitor.start().await.unwrap();
        let latest = monitor.latest().await.unwrap();
        assert!(latest.cpu_total_millicores > 0);
        assert_eq!(latest.gpus.len(), 1);
        monitor.stop().await;
    }

    #[tokio::test]
    async fn test_double_start_rejected() {
        let monitor = Arc::new(ResourceMonitor::with_providers(test_config(), vec![]));
        monitor.start().await.unwrap();
        assert!(matches!(
            monitor.start().await,
            Err(MonitorError::AlreadyRunning)
        ));
        monitor.stop().await;
    }

    #[tokio::test]
    async fn test_failing_provider_downgraded() {
        let monitor = Arc::new(ResourceMonitor::with_providers(
            test_config(),
            vec![
                Box::new(FailingProvider),
                Box::new(FakeGpuProvider {
                    gpus: vec![fake_gpu(0)],
                }),
            ],
        ));

        monitor.start().await.unwrap();
        // The failing AMD provider is silently skipped.
        let latest = monitor.latest().await.unwrap();
        assert_eq!(latest.gpus.len(), 1);
        monitor.stop().await;
    }

    #[tokio::test]
    async fn test_history_is_bounded() {
        let monitor = Arc::new(ResourceMonitor::with_providers(test_config(), vec![]));

        for _ in 0..5 {
            let snap = monitor.sample().await;
            monitor.publish(snap).await;
        }

        let history = monitor.history().await;
        assert_eq!(history.len(), 3);
        // Oldest first, ordered by sample time.
        assert!(history[0].sampled_at <= history[2].sampled_at);
    }

    #[tokio::test]
    async fn test_subscriber_receives_snapshot() {
        let monitor = Arc::new(ResourceMonitor::with_providers(test_config(), vec![]));
        let mut rx = monitor.subscribe().await;

        let snap = monitor.sample().await;
        monitor.publish(snap).await;

        let received = rx.recv().await.unwrap();
        assert!(received.cpu_total_millicores > 0);
    }

    #[tokio::test]
    async fn test_slow_subscriber_does_not_block() {
        let monitor = Arc::new(ResourceMonitor::with_providers(test_config(), vec![]));
        let mut rx = monitor.subscribe().await;

        // Fill the one-slot mailbox and keep publishing; nothing deadlocks.
        for _ in 0..4 {
            let snap = monitor.sample().await;
            monitor.publish(snap).await;
        }

        // Only the slot's snapshot is retained.
        assert!(rx.try_recv().is_ok());
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_dropped_subscriber_pruned() {
        let monitor = Arc::new(ResourceMonitor::with_providers(test_config(), vec![]));
        let rx = monitor.subscribe().await;
        drop(rx);

        let snap = monitor.sample().await;
        monitor.publish(snap).await;

        assert!(monitor.subscribers.read().await.is_empty());
    }

    #[test]
    fn test_parse_conda_env_list() {
        let out = "# conda environments:\n#\nbase                  *  /opt/conda\nml                       /opt/conda/envs/ml\n";
        let envs = parse_conda_env_list(out);
        assert_eq!(envs, vec!["base".to_string(), "ml".to_string()]);
    }

    #[tokio::test]
    async fn test_capabilities_from_snapshot() {
        let monitor = Arc::new(ResourceMonitor::with_providers(
            test_config(),
            vec![Box::new(FakeGpuProvider {
                gpus: vec![fake_gpu(0), fake_gpu(1)],
            })],
        ));
        monitor.start().await.unwrap();

        let caps = monitor.capabilities(false).await;
        assert!(caps.cpu_count > 0);
        assert_eq!(caps.gpu_count, 2);
        assert_eq!(caps.gpu_memory_bytes, 16 << 30);
        assert_eq!(caps.gpu_name, "Fake GPU");
        assert!(caps.supports_llama);
        assert!(!caps.supports_python);
        monitor.stop().await;
    }
}
