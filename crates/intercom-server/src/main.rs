//! intercom-server: push relay server.
//!
//! Accepts WebSocket clients that register a user identity, and HTTP push
//! requests that are relayed to those clients and answered synchronously.

use clap::Parser;
use intercom_server::auth::{bearer_secret, token_table};
use intercom_server::{metrics, IntercomServer, ServerConfig};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info, warn};

/// intercom-server — push relay server
#[derive(Parser, Debug)]
#[command(name = "intercom-server", version, about = "Push relay server")]
struct Cli {
    /// Listen address
    #[arg(long)]
    host: Option<String>,

    /// Listen port
    #[arg(short, long)]
    port: Option<u16>,

    /// Config file path
    #[arg(long, default_value = "~/.intercom/config.toml")]
    config: String,

    /// Seconds a push waits for the client's answer
    #[arg(long)]
    push_timeout: Option<u64>,

    /// Disable the Prometheus metrics endpoint
    #[arg(long)]
    no_metrics: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    // Initialize tracing
    use tracing_subscriber::EnvFilter;
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&cli.log_level));
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .init();

    info!(version = env!("CARGO_PKG_VERSION"), "starting intercom-server");

    // Load server config (file + CLI overrides)
    let config_path = PathBuf::from(&cli.config);
    let config = match ServerConfig::load(
        Some(&config_path),
        cli.host.as_deref(),
        cli.port,
        cli.push_timeout,
    ) {
        Ok(cfg) => cfg,
        Err(e) => {
            error!(error = %e, "failed to load config");
            std::process::exit(1);
        }
    };

    let auth_token = token_table(config.tokens.clone());
    if auth_token.is_some() {
        info!(tokens = config.tokens.len(), "registration tokens loaded");
    }
    let push_auth = config.push_secret.clone().map(bearer_secret);
    if push_auth.is_none() {
        warn!("no push_secret configured, push endpoint is open");
    }

    let metrics_handle = if cli.no_metrics {
        None
    } else {
        match metrics::install_recorder() {
            Ok(handle) => Some(handle),
            Err(e) => {
                warn!(error = %e, "metrics disabled");
                None
            }
        }
    };

    let server = match IntercomServer::new(config, auth_token, push_auth) {
        Ok(s) => Arc::new(s),
        Err(e) => {
            error!(error = %e, "failed to create server");
            std::process::exit(1);
        }
    };

    // Run until shutdown signal
    if let Err(e) = server.run(metrics_handle, shutdown_signal()).await {
        error!(error = %e, "server error");
        std::process::exit(1);
    }

    info!("intercom-server stopped");
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
                warn!(error = %e, "failed to install SIGTERM handler");
                ctrl_c.await.ok();
            }
        }
    }

    #[cfg(not(unix))]
    {
        ctrl_c.await.ok();
    }

    info!("received shutdown signal");
}
