//! # Shepherd cluster runtime
//!
//! Client/master coordination for a fleet of inference nodes:
//!
//! - **protocol**: heartbeat, command and result wire types with signing
//! - **heartbeat**: client-side liveness loop with reconnect backoff
//! - **executor**: bounded-concurrency command execution on clients
//! - **manager**: the master's node registry, queues and result sink
//! - **scheduler**: pluggable placement strategies for model loads
//! - **connector**: the client's registration / poll / result loop
//!
//! A single master coordinates the cluster; clients survive master
//! restarts by re-registering on reconnect, and the command plane gives
//! at-most-once execution with at-least-once result delivery de-duplicated
//! by command ID.

pub mod connector;
pub mod executor;
pub mod heartbeat;
pub mod manager;
pub mod protocol;
pub mod scheduler;

pub use connector::{ConnectorConfig, ConnectorError, MasterConnector};
pub use executor::{CommandExecutor, ExecutorConfig};
pub use heartbeat::{
    backoff_with_jitter, spawn_heartbeat, HeartbeatConfig, HeartbeatError, HeartbeatManager,
    HeartbeatSource,
};
pub use manager::{ManagerError, NodeEvent, NodeManager, NodeManagerConfig, RegisterOutcome};
pub use protocol::{
    Command, CommandResult, CommandType, HealthLevel, HealthReport, Heartbeat,
};
pub use scheduler::{
    is_eligible, CostBasedStrategy, LoadBalancedStrategy, LocalityStrategy, ModelPlacement,
    NodeCandidate, ResourceBasedStrategy, ScheduleError, Scheduler, SchedulerStrategy,
};

/// Default heartbeat interval in seconds
pub const HEARTBEAT_INTERVAL_SECS: u64 = 5;

/// Default heartbeat timeout in seconds (3 intervals)
pub const HEARTBEAT_TIMEOUT_SECS: u64 = 15;

/// Default command poll interval in seconds
pub const POLL_INTERVAL_SECS: u64 = 2;
