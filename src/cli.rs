//! Command-line interface definitions

use clap::{ArgAction, Parser};
use std::path::PathBuf;

use crate::node::types::NodeRole;

#[derive(Parser, Debug)]
#[command(name = "shepherd")]
#[command(about = "Distributed management plane for local llama.cpp inference servers")]
#[command(version)]
pub struct Cli {
    /// Run mode: hybrid, master, client or standalone (wins over --mode)
    #[arg(value_name = "MODE")]
    pub mode: Option<String>,

    /// Path to the YAML configuration file
    #[arg(long, value_name = "PATH")]
    pub config: Option<PathBuf>,

    /// Run mode, overridden by the positional MODE
    #[arg(long = "mode", value_name = "MODE")]
    pub mode_flag: Option<String>,

    /// Master base URL for client and hybrid modes
    #[arg(long = "master-address", value_name = "URL")]
    pub master_address: Option<String>,

    /// Override the bind address for the HTTP API
    #[arg(long, value_name = "ADDR")]
    pub bind_addr: Option<String>,

    /// Override the HTTP API port
    #[arg(short, long, value_name = "PORT")]
    pub port: Option<u16>,

    /// Enable verbose logging output (-v, -vv, -vvv)
    #[arg(short, long, action = ArgAction::Count)]
    pub verbose: u8,

    /// Path to a .env file loaded before startup
    #[arg(long, value_name = "FILE")]
    pub env_file: Option<PathBuf>,
}

/// Resolve the effective role: positional mode wins over the flag, the
/// flag over the config file, and hybrid is the default
pub fn determine_role(
    positional: Option<&str>,
    flag: Option<&str>,
    config_mode: Option<&str>,
) -> Result<NodeRole, String> {
    let chosen = positional.or(flag).or(config_mode);
    match chosen {
        Some(name) => {
            NodeRole::parse(name).ok_or_else(|| format!("unknown mode '{}'", name))
        }
        None => Ok(NodeRole::Hybrid),
    }
}
