//! Tool Supervisor daemon.
//!
//! Connects to every server in the config file, keeps the connections alive
//! in the background, and logs status until interrupted.
//!
//! # Usage
//!
//! ```bash
//! # Config from TOOL_SUPERVISOR_CONFIG, or supervisor.yaml found upward from cwd
//! tool-supervisor
//!
//! # Explicit config
//! tool-supervisor ./supervisor.yaml
//!
//! # Verbose logging
//! RUST_LOG=tool_supervisor=debug tool-supervisor
//! ```
//!
//! # Environment Variables
//!
//! - `TOOL_SUPERVISOR_CONFIG`: config file path
//! - `TOOL_SUPERVISOR_LOG_DIR`: log directory (default: platform data dir)
//! - `RUST_LOG`: log filter (default: `tool_supervisor=info,warn`)
//!
//! # Signals
//!
//! - SIGINT: graceful shutdown (stops timers, disconnects every server)

use std::path::PathBuf;

use anyhow::Context;
use tokio::signal;
use tracing::{error, info, warn};

use tool_supervisor::supervisor::config::find_config_path;
use tool_supervisor::{init_tracing, load_config, ConnectionManager};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let log_path = init_tracing().context("failed to initialize logging")?;
    eprintln!("tool-supervisor: logging to {}", log_path.display());

    let explicit = std::env::args_os().nth(1).map(PathBuf::from);
    let cwd = std::env::current_dir().context("failed to read working directory")?;
    let config_path = find_config_path(explicit.as_deref(), &cwd)?;
    let config = load_config(&config_path)?;
    info!(
        path = %config_path.display(),
        servers = config.servers.len(),
        "config loaded"
    );

    let manager = ConnectionManager::new(config.settings.clone())?;
    for descriptor in config.servers {
        let name = descriptor.name.clone();
        if let Err(e) = manager.register_server(descriptor) {
            error!(server = %name, error = %e, "invalid server descriptor");
            return Err(e).context("refusing to start with an invalid server descriptor");
        }
    }

    let failures = manager.initialize_all().await;
    for (server, e) in &failures {
        warn!(server = %server, error = %e, "server unavailable at startup, will retry");
    }
    for status in manager.get_server_status() {
        info!(
            server = %status.name,
            url = %status.url,
            connected = status.connected,
            "server status"
        );
    }
    log_stats(&manager);

    let mut ticker = tokio::time::interval(config.settings.health_check_interval());
    ticker.tick().await;

    loop {
        tokio::select! {
            result = signal::ctrl_c() => {
                if let Err(e) = result {
                    error!(error = %e, "failed to listen for Ctrl-C, shutting down");
                }
                break;
            }
            _ = ticker.tick() => log_stats(&manager),
        }
    }

    info!("received shutdown signal");
    manager.shutdown().await;
    Ok(())
}

fn log_stats(manager: &ConnectionManager) {
    let stats = manager.get_connection_stats();
    info!(
        total = stats.total_servers,
        connected = stats.connected_servers,
        disconnected = stats.disconnected_servers,
        reconnection_active = stats.reconnection_active,
        "connection stats"
    );
}
