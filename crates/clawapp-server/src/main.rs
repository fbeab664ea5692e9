//! clawapp-server: session bridge between mobile web clients and an OpenClaw gateway.
//!
//! Clients speak short HTTP requests plus an SSE push stream (or a single
//! WebSocket). Each client session owns one authenticated gateway socket.

mod auth;
mod config;
mod error;
mod server;
mod session;
mod transport;
mod upstream;

#[cfg(test)]
mod test_support;

use clap::Parser;
use clawapp_core::DeviceIdentity;
use config::{CliOverrides, ServerConfig};
use server::BridgeServer;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info};

/// clawapp-server: mobile bridge for the OpenClaw gateway
#[derive(Parser, Debug)]
#[command(name = "clawapp-server", version, about = "Mobile bridge for the OpenClaw gateway")]
struct Cli {
    /// Listen port
    #[arg(short, long, env = "PROXY_PORT")]
    port: Option<u16>,

    /// Listen address
    #[arg(long)]
    host: Option<String>,

    /// Token clients must present on connect (empty disables the check)
    #[arg(long, env = "PROXY_TOKEN", hide_env_values = true)]
    proxy_token: Option<String>,

    /// Gateway WebSocket URL
    #[arg(long, env = "OPENCLAW_GATEWAY_URL")]
    gateway_url: Option<String>,

    /// Token sent to the gateway in the connect request
    #[arg(long, env = "OPENCLAW_GATEWAY_TOKEN", hide_env_values = true)]
    gateway_token: Option<String>,

    /// Device key file (created on first start)
    #[arg(long)]
    device_key: Option<String>,

    /// Maximum concurrent sessions
    #[arg(long)]
    max_sessions: Option<usize>,

    /// Config file path
    #[arg(long, default_value = "~/.clawapp/config.toml")]
    config: String,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    // Initialize tracing
    use tracing_subscriber::EnvFilter;
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cli.log_level));
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .init();

    info!(version = env!("CARGO_PKG_VERSION"), "starting clawapp-server");

    // wss:// gateways need a process-wide crypto provider
    if rustls::crypto::ring::default_provider().install_default().is_err() {
        tracing::debug!("rustls crypto provider already installed");
    }

    let config_path = PathBuf::from(&cli.config);
    let server_config = match ServerConfig::load(
        Some(&config_path),
        CliOverrides {
            host: cli.host,
            port: cli.port,
            proxy_token: cli.proxy_token,
            gateway_url: cli.gateway_url,
            gateway_token: cli.gateway_token,
            device_key: cli.device_key,
            max_sessions: cli.max_sessions,
        },
    ) {
        Ok(cfg) => cfg,
        Err(e) => {
            error!(error = %e, "failed to load config");
            std::process::exit(1);
        }
    };

    let identity = match DeviceIdentity::load_or_create(&server_config.device_key_path) {
        Ok(identity) => Arc::new(identity),
        Err(e) => {
            error!(error = %e, "failed to load device identity");
            std::process::exit(1);
        }
    };
    info!(device = %identity.short_id(), gateway = %server_config.gateway_url, "device identity ready");

    let bridge = BridgeServer::new(server_config, identity);
    if let Err(e) = bridge.run(shutdown_signal()).await {
        error!(error = %e, "server error");
        std::process::exit(1);
    }

    info!("clawapp-server stopped");
}

/// Wait for SIGTERM or SIGINT (Ctrl+C).
async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = ctrl_c => {}
                    _ = sigterm.recv() => {}
                }
            }
            Err(e) => {
                error!(error = %e, "failed to install SIGTERM handler");
                ctrl_c.await.ok();
            }
        }
    }

    #[cfg(not(unix))]
    {
        ctrl_c.await.ok();
    }
}
