use std::process;

use clap::Parser;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use shepherd::cli::{determine_role, Cli};
use shepherd::config;
use shepherd::node::Node;
use shepherd::server::{create_router, AppState};

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    // Initialize logging
    let filter = match cli.verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)),
        )
        .init();

    // Load .env file if specified
    if let Some(ref env_file) = cli.env_file {
        if let Err(e) = dotenvy::from_path(env_file) {
            error!("Failed to load env file {}: {}", env_file.display(), e);
            process::exit(1);
        }
    }

    // The CLI mode (positional over flag) decides which default config
    // file applies; the file's own mode only matters when the CLI is
    // silent.
    let cli_mode = cli.mode.as_deref().or(cli.mode_flag.as_deref());
    let provisional_role = match determine_role(cli_mode, None, None) {
        Ok(role) => role,
        Err(e) => {
            eprintln!("{}", e);
            process::exit(2);
        }
    };

    let config_path = cli
        .config
        .clone()
        .unwrap_or_else(|| config::default_config_path(provisional_role));
    let mut cfg = match config::load_config_from(&config_path) {
        Ok(cfg) => cfg,
        Err(e) => {
            error!("Failed to load config {}: {}", config_path.display(), e);
            process::exit(1);
        }
    };

    let role = match determine_role(cli_mode, None, cfg.node.mode.as_deref()) {
        Ok(role) => role,
        Err(e) => {
            eprintln!("{}", e);
            process::exit(2);
        }
    };

    // CLI overrides on top of the file.
    if let Some(master_address) = cli.master_address.clone() {
        cfg.client.master_address = Some(master_address);
    }
    if let Some(bind_addr) = cli.bind_addr.clone() {
        cfg.node.bind_addr = bind_addr;
    }
    if let Some(port) = cli.port {
        cfg.node.port = port;
    }

    let bind = format!("{}:{}", cfg.node.bind_addr, cfg.node.port);

    let node = match Node::new(cfg, role) {
        Ok(node) => node,
        Err(e) => {
            error!("{}", e);
            process::exit(2);
        }
    };

    if let Err(e) = node.start().await {
        error!("Startup failed: {}", e);
        process::exit(1);
    }

    let info = node.info().await;
    info!(
        node = %info.id,
        role = %role,
        "Shepherd node running"
    );

    let app = create_router(AppState::new(node.clone()));
    let listener = match tokio::net::TcpListener::bind(&bind).await {
        Ok(listener) => listener,
        Err(e) => {
            error!("Cannot bind {}: {}", bind, e);
            node.stop().await;
            process::exit(1);
        }
    };
    info!("API listening on {}", bind);

    let serve = axum::serve(listener, app).with_graceful_shutdown(shutdown_signal());
    if let Err(e) = serve.await {
        error!("Server error: {}", e);
    }

    // HTTP is down; unwind the node in reverse startup order.
    node.stop().await;
    info!("Shutdown complete");
}

async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    {
        let mut sigterm =
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
                .expect("failed to install SIGTERM handler");
        tokio::select! {
            _ = ctrl_c => {}
            _ = sigterm.recv() => {}
        }
    }

    #[cfg(not(unix))]
    {
        let _ = ctrl_c.await;
    }

    info!("Shutdown signal received");
}
