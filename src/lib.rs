//! # Shepherd
//!
//! A distributed management plane for local llama.cpp inference servers.
//!
//! A fleet of nodes discovers model files on disk, launches and supervises
//! inference subprocesses, exposes a JSON HTTP API, and (in clustered mode)
//! schedules model loads onto the best-fit node.
//!
//! ## Roles
//!
//! - **standalone**: local monitor + supervisor + registry, no cluster
//! - **master**: accepts client registrations, dispatches commands, schedules
//! - **client**: registers with a master, heartbeats, executes commands
//! - **hybrid**: master and client subsystems in one process (the default)
//!
//! ## Architecture
//!
//! ```text
//! ┌────────────────────────────────────────────────────────┐
//! │                     Master Node                        │
//! │  ┌────────────┐  ┌──────────────┐  ┌───────────────┐  │
//! │  │ HTTP API   │  │ Node Manager │  │  Scheduler    │  │
//! │  │ /api/...   │  │ + queues     │  │  strategies   │  │
//! │  └────────────┘  └──────────────┘  └───────────────┘  │
//! └────────────────────────────────────────────────────────┘
//!           ▲ register / heartbeat / poll / results
//!           │
//!   ┌───────┴───────┐       ┌───────────────┐
//!   │  Client Node  │  ...  │  Client Node  │
//!   │ monitor       │       │ monitor       │
//!   │ executor      │       │ executor      │
//!   │ supervisor    │       │ supervisor    │
//!   └───────────────┘       └───────────────┘
//! ```

pub mod cli;
pub mod cluster;
pub mod config;
pub mod monitor;
pub mod node;
pub mod registry;
pub mod server;
pub mod supervisor;
