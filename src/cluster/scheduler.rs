//! Scheduler (master side)
//!
//! Picks the best node for a model load under a pluggable strategy.
//! Decisions are deterministic: given the same candidate list, snapshot
//! and strategy, the same node comes out, with the node ID as the final
//! tie-break.

use thiserror::Error;

use crate::config::CostWeights;
use crate::node::types::{NodeInfo, NodeState};

/// Headroom factor a candidate's free VRAM must cover
const VRAM_HEADROOM: f64 = 1.2;

/// Errors from a scheduling decision
#[derive(Error, Debug, PartialEq)]
pub enum ScheduleError {
    #[error("No eligible nodes")]
    NoCandidates,

    #[error("No node has capacity for the model ({0} bytes required)")]
    NoCapacity(u64),
}

/// The model being placed
#[derive(Debug, Clone)]
pub struct ModelPlacement {
    /// Stable model ID
    pub model_id: String,

    /// Bare file name, used for locality matching
    pub file_name: String,

    /// Model file size in bytes
    pub size_bytes: u64,
}

/// One node as seen by the scheduler
#[derive(Debug, Clone)]
pub struct NodeCandidate {
    /// The node's registry entry with its latest resources
    pub info: NodeInfo,

    /// Commands currently queued or executing on the node
    pub active_commands: usize,

    /// Models currently loaded on the node
    pub loaded_models: usize,

    /// Whether the target model file already exists on the node's disk
    pub has_model_file: bool,
}

impl NodeCandidate {
    fn free_vram(&self) -> u64 {
        self.info
            .resources
            .as_ref()
            .map(|r| r.free_gpu_memory_bytes())
            .unwrap_or(0)
    }

    /// Free memory on whichever device would host the model: VRAM when
    /// the node has GPUs, system memory headroom otherwise
    fn free_model_memory(&self) -> u64 {
        match &self.info.resources {
            Some(r) if !r.gpus.is_empty() => r.free_gpu_memory_bytes(),
            Some(r) => r.mem_total_bytes.saturating_sub(r.mem_used_bytes),
            None => 0,
        }
    }

    fn cpu_percent(&self) -> f64 {
        self.info
            .resources
            .as_ref()
            .map(|r| r.cpu_percent())
            .unwrap_or(0.0)
    }

    fn mem_fraction(&self) -> f64 {
        self.info
            .resources
            .as_ref()
            .map(|r| r.mem_percent() / 100.0)
            .unwrap_or(0.0)
    }

    fn gpu_used_fraction(&self) -> f64 {
        let Some(resources) = &self.info.resources else {
            return 0.0;
        };
        let total: u64 = resources.gpus.iter().map(|g| g.total_memory_bytes).sum();
        if total == 0 {
            return 0.0;
        }
        let used: u64 = resources.gpus.iter().map(|g| g.used_memory_bytes).sum();
        used as f64 / total as f64
    }
}

/// A pluggable node selection policy
pub trait SchedulerStrategy: Send + Sync {
    /// Strategy name for logs and config
    fn name(&self) -> &'static str;

    /// Pick a node among eligible candidates, or decline
    fn select_node<'a>(
        &self,
        candidates: &'a [NodeCandidate],
        model: &ModelPlacement,
    ) -> Result<&'a NodeCandidate, ScheduleError>;
}

/// Most free GPU memory, then fewest loaded models, then lowest CPU
pub struct ResourceBasedStrategy;

impl ResourceBasedStrategy {
    fn pick<'a>(
        candidates: &'a [NodeCandidate],
        model: &ModelPlacement,
    ) -> Result<&'a NodeCandidate, ScheduleError> {
        let floor = (model.size_bytes as f64 * VRAM_HEADROOM) as u64;
        let fitting: Vec<&NodeCandidate> = candidates
            .iter()
            .filter(|c| c.free_model_memory() >= floor)
            .collect();
        if fitting.is_empty() {
            return Err(ScheduleError::NoCapacity(floor));
        }

        Ok(fitting
            .into_iter()
            .min_by(|a, b| {
                b.free_vram()
                    .cmp(&a.free_vram())
                    .then(a.loaded_models.cmp(&b.loaded_models))
                    .then(
                        a.cpu_percent()
                            .partial_cmp(&b.cpu_percent())
                            .unwrap_or(std::cmp::Ordering::Equal),
                    )
                    .then(a.info.id.cmp(&b.info.id))
            })
            .unwrap())
    }
}

impl SchedulerStrategy for ResourceBasedStrategy {
    fn name(&self) -> &'static str {
        "resource"
    }

    fn select_node<'a>(
        &self,
        candidates: &'a [NodeCandidate],
        model: &ModelPlacement,
    ) -> Result<&'a NodeCandidate, ScheduleError> {
        Self::pick(candidates, model)
    }
}

/// Fewest active commands, then lowest CPU utilization
pub struct LoadBalancedStrategy;

impl SchedulerStrategy for LoadBalancedStrategy {
    fn name(&self) -> &'static str {
        "load"
    }

    fn select_node<'a>(
        &self,
        candidates: &'a [NodeCandidate],
        _model: &ModelPlacement,
    ) -> Result<&'a NodeCandidate, ScheduleError> {
        candidates
            .iter()
            .min_by(|a, b| {
                a.active_commands
                    .cmp(&b.active_commands)
                    .then(
                        a.cpu_percent()
                            .partial_cmp(&b.cpu_percent())
                            .unwrap_or(std::cmp::Ordering::Equal),
                    )
                    .then(a.info.id.cmp(&b.info.id))
            })
            .ok_or(ScheduleError::NoCandidates)
    }
}

/// Prefer nodes that already hold the model file, resource-based among
/// those, falling back to resource-based across all nodes
pub struct LocalityStrategy;

impl SchedulerStrategy for LocalityStrategy {
    fn name(&self) -> &'static str {
        "locality"
    }

    fn select_node<'a>(
        &self,
        candidates: &'a [NodeCandidate],
        model: &ModelPlacement,
    ) -> Result<&'a NodeCandidate, ScheduleError> {
        let local: Vec<NodeCandidate> = candidates
            .iter()
            .filter(|c| c.has_model_file)
            .cloned()
            .collect();

        if !local.is_empty() {
            // Resolve back into the caller's slice to keep the lifetime.
            if let Ok(picked) = ResourceBasedStrategy::pick(&local, model) {
                let id = picked.info.id.clone();
                return candidates
                    .iter()
                    .find(|c| c.info.id == id)
                    .ok_or(ScheduleError::NoCandidates);
            }
        }

        ResourceBasedStrategy::pick(candidates, model)
    }
}

/// Lowest weighted cost over GPU, CPU and memory utilization
pub struct CostBasedStrategy {
    weights: CostWeights,
}

impl CostBasedStrategy {
    pub fn new(weights: CostWeights) -> Self {
        Self { weights }
    }

    fn cost(&self, candidate: &NodeCandidate) -> f64 {
        self.weights.gpu * candidate.gpu_used_fraction()
            + self.weights.cpu * (candidate.cpu_percent() / 100.0)
            + self.weights.memory * candidate.mem_fraction()
    }
}

impl SchedulerStrategy for CostBasedStrategy {
    fn name(&self) -> &'static str {
        "cost"
    }

    fn select_node<'a>(
        &self,
        candidates: &'a [NodeCandidate],
        _model: &ModelPlacement,
    ) -> Result<&'a NodeCandidate, ScheduleError> {
        candidates
            .iter()
            .min_by(|a, b| {
                self.cost(a)
                    .partial_cmp(&self.cost(b))
                    .unwrap_or(std::cmp::Ordering::Equal)
                    .then(a.info.id.cmp(&b.info.id))
            })
            .ok_or(ScheduleError::NoCandidates)
    }
}

/// The scheduler: eligibility filtering plus a strategy
pub struct Scheduler {
    strategy: Box<dyn SchedulerStrategy>,
}

impl Scheduler {
    /// Create a scheduler over a strategy
    pub fn new(strategy: Box<dyn SchedulerStrategy>) -> Self {
        Self { strategy }
    }

    /// Build the configured strategy by name; unknown names fall back to
    /// resource-based
    pub fn from_config(name: &str, cost_weights: Option<CostWeights>) -> Self {
        let strategy: Box<dyn SchedulerStrategy> = match name {
            "load" => Box::new(LoadBalancedStrategy),
            "locality" => Box::new(LocalityStrategy),
            "cost" => Box::new(CostBasedStrategy::new(cost_weights.unwrap_or_default())),
            _ => Box::new(ResourceBasedStrategy),
        };
        Self::new(strategy)
    }

    /// The active strategy's name
    pub fn strategy_name(&self) -> &'static str {
        self.strategy.name()
    }

    /// Pick a node for a model
    ///
    /// Nodes in offline, error or disabled states never participate.
    pub fn schedule<'a>(
        &self,
        candidates: &'a [NodeCandidate],
        model: &ModelPlacement,
    ) -> Result<&'a NodeCandidate, ScheduleError> {
        let eligible: Vec<NodeCandidate> = candidates
            .iter()
            .filter(|c| is_eligible(&c.info))
            .cloned()
            .collect();
        if eligible.is_empty() {
            return Err(ScheduleError::NoCandidates);
        }

        let picked = self.strategy.select_node(&eligible, model)?;
        let id = picked.info.id.clone();
        candidates
            .iter()
            .find(|c| c.info.id == id)
            .ok_or(ScheduleError::NoCandidates)
    }
}

/// Whether a node may receive scheduled work
pub fn is_eligible(info: &NodeInfo) -> bool {
    !matches!(
        info.state,
        NodeState::Offline | NodeState::Error | NodeState::Disabled
    )
}
