//! mTLS Layer-4 Load Balancer
//!
//! A TCP reverse proxy built with Tokio and rustls.
//!
//! # Architecture Overview
//!
//! ```text
//!                        ┌──────────────────────────────────────────────┐
//!                        │                LOAD BALANCER                  │
//!                        │                                               │
//!   TLS 1.3 + client     │  ┌─────────┐   ┌──────────┐   ┌───────────┐  │
//!   certificate          │  │   net   │──▶│ security │──▶│ forwarder │  │
//!   ─────────────────────┼─▶│listener │   │policy/rl │   │ (LCU pick)│  │
//!                        │  └─────────┘   └──────────┘   └─────┬─────┘  │
//!                        │                                      │        │
//!                        │                                      ▼        │
//!                        │  ┌────────────────┐        ┌──────────────┐  │
//!   plaintext TCP        │  │ load_balancer  │◀───────│   backend    │──┼──▶ Backend
//!   ◀────────────────────┼──│ tracker/manager│ health │  connection  │  │
//!                        │  └────────────────┘ events └──────────────┘  │
//!                        │                                               │
//!                        │  ┌─────────────────────────────────────────┐ │
//!                        │  │   config · health · observability ·     │ │
//!                        │  │              lifecycle                  │ │
//!                        │  └─────────────────────────────────────────┘ │
//!                        └──────────────────────────────────────────────┘
//! ```

use std::path::PathBuf;

use clap::{Parser, Subcommand};

use mtls_balancer::config::load_config;
use mtls_balancer::lifecycle::{wait_for_signal, Shutdown};
use mtls_balancer::observability::{logging, metrics};
use mtls_balancer::{LeastConnectionsForwarder, Server};

#[derive(Parser)]
#[command(name = "mtls-balancer")]
#[command(about = "Layer-4 load balancer with mutual TLS", long_about = None)]
struct Cli {
    /// Path to the TOML configuration file
    #[arg(short, long, default_value = "balancer.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the load balancer
    Run,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Run => run(cli.config).await,
    }
}

async fn run(config_path: PathBuf) -> Result<(), Box<dyn std::error::Error>> {
    rustls::crypto::ring::default_provider()
        .install_default()
        .ok();

    let config = load_config(&config_path)?;
    logging::init_logging(&config.observability.log_level);

    tracing::info!(
        listeners = config.listeners.len(),
        upstreams = config.upstreams.len(),
        "Configuration loaded"
    );

    if config.observability.metrics_enabled {
        if let Ok(addr) = config.observability.metrics_address.parse() {
            metrics::init_metrics(addr);
        } else {
            tracing::error!(
                metrics_address = %config.observability.metrics_address,
                "Failed to parse metrics address"
            );
        }
    }

    let forwarder = std::sync::Arc::new(LeastConnectionsForwarder::from_config(&config));
    let server = Server::with_forwarder(&config, std::sync::Arc::clone(&forwarder)).await?;

    let shutdown = Shutdown::new();
    let server_task = tokio::spawn(server.listen_and_serve(shutdown.token()));

    let fatal = shutdown.token();
    tokio::select! {
        _ = wait_for_signal() => {
            tracing::info!("Shutdown signal received");
            shutdown.trigger();
        }
        // Fatal listener error; the server has already torn itself down
        _ = fatal.cancelled() => {}
    }

    let served = server_task.await?;
    forwarder.stop().await;
    served?;

    tracing::info!("Shutdown complete");
    Ok(())
}
