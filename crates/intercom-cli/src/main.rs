//! intercom — load harnesses for the intercom relay.
//!
//! `clients` opens many WebSocket clients that echo every request back;
//! `push` drives the push endpoint for those clients.

mod commands;
mod config;

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::time::Duration;
use tracing::error;

/// intercom — relay load harnesses
#[derive(Parser)]
#[command(name = "intercom", version, about = "Load harnesses for the intercom push relay")]
struct Cli {
    /// Relay host:port (overrides config)
    #[arg(short, long, global = true)]
    server: Option<String>,

    /// Config file path
    #[arg(long = "config", global = true)]
    config: Option<PathBuf>,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Open simulated clients that echo every pushed message
    Clients {
        /// Number of clients; identities are 0..N
        #[arg(short = 'n', long, default_value_t = 10)]
        number: usize,

        /// Maximum dials in flight
        #[arg(long, default_value_t = 10)]
        dial_limit: usize,

        /// Seconds between pings
        #[arg(long, default_value_t = 20)]
        ping_secs: u64,
    },

    /// Push a timestamped message to each user periodically
    Push {
        /// Number of users; identities are 0..N
        #[arg(short = 'n', long, default_value_t = 1)]
        users: usize,

        /// Seconds between rounds
        #[arg(long, default_value_t = 10)]
        interval_secs: u64,

        /// Run one round and exit
        #[arg(long)]
        once: bool,

        /// Fire-and-forget instead of waiting for answers
        #[arg(long = "async")]
        is_async: bool,

        /// Bearer secret (overrides config)
        #[arg(long)]
        secret: Option<String>,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    // Initialize tracing.
    if cli.verbose {
        tracing_subscriber::fmt()
            .with_env_filter("intercom=debug,intercom_cli=debug,intercom_core=debug")
            .with_target(true)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter("intercom=info,intercom_cli=info")
            .with_target(false)
            .init();
    }

    // Load config file.
    let config_path = cli.config.clone().unwrap_or_else(config::Config::default_path);
    let mut cfg = match config::Config::load(&config_path) {
        Ok(cfg) => cfg.default,
        Err(e) => {
            eprintln!("intercom: {e:#}");
            std::process::exit(1);
        }
    };
    if let Some(server) = cli.server {
        cfg.server = server;
    }

    let result = match cli.command {
        Command::Clients {
            number,
            dial_limit,
            ping_secs,
        } => {
            commands::clients::run(
                &cfg.ws_url(),
                number,
                dial_limit,
                Duration::from_secs(ping_secs),
            )
            .await
        }
        Command::Push {
            users,
            interval_secs,
            once,
            is_async,
            secret,
        } => {
            let options = commands::push::PushOptions {
                url: cfg.push_url(),
                users,
                interval: Duration::from_secs(interval_secs),
                once,
                is_async,
                secret: secret.or(cfg.push_secret),
            };
            commands::push::run(&options).await
        }
    };

    if let Err(e) = result {
        error!("{:#}", e);
        eprintln!("intercom: {e:#}");
        std::process::exit(1);
    }
}
