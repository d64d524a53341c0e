//! Subscription Controller CLI
//!
//! Reads consumer change notifications as JSON lines on stdin, e.g.
//! `{"kind":"UPDATE","consumer":{...}}`, and reconciles them into the
//! subscription store.

use clap::Parser;
use events_core::config::GatewayConfig;
use events_core::store::FileSubscriptionStore;
use events_core::strategy::Lifecycle;
use std::sync::Arc;
use subscription_controller::{Controller, ConsumerChange};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Parser, Debug)]
#[command(name = "subscription-controller")]
#[command(about = "Keeps subscription records in step with consumer changes")]
#[command(version)]
struct Args {
    /// Configuration file (YAML, TOML or JSON)
    #[arg(long, short, env = "EVENT_GATEWAY_CONFIG")]
    config: Option<String>,

    /// Subscription store directory, overrides the configuration file
    #[arg(long, env = "STORE_DIR")]
    store_dir: Option<String>,

    /// Worker count, overrides the configuration file
    #[arg(long, env = "CONTROLLER_WORKERS")]
    workers: Option<usize>,

    #[arg(long, env = "LOG_LEVEL")]
    log_level: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let mut config = GatewayConfig::load(args.config.as_deref())?;
    if let Some(dir) = args.store_dir {
        config.store.dir = dir;
    }
    if let Some(workers) = args.workers {
        config.controller.workers = workers;
    }
    config.validate()?;
    let log_level = args
        .log_level
        .unwrap_or_else(|| config.observability.log_level.clone());

    // Logs go to stderr; stdin carries the notifications
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&log_level));
    if config.observability.log_format == "pretty" {
        tracing_subscriber::registry()
            .with(fmt::layer().with_writer(std::io::stderr))
            .with(filter)
            .init();
    } else {
        tracing_subscriber::registry()
            .with(fmt::layer().json().with_writer(std::io::stderr))
            .with(filter)
            .init();
    }

    info!(
        version = env!("CARGO_PKG_VERSION"),
        store = %config.store.dir,
        workers = config.controller.workers,
        "Starting subscription-controller"
    );

    let store = Arc::new(FileSubscriptionStore::new(&config.store.dir));
    let controller = Controller::new(store, config.controller.clone());
    controller.start().await?;

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Shutdown signal received");
                break;
            }
            line = lines.next_line() => match line {
                Ok(Some(line)) => {
                    let line = line.trim();
                    if line.is_empty() {
                        continue;
                    }
                    match serde_json::from_str::<ConsumerChange>(line) {
                        Ok(change) => {
                            if let Err(e) = controller.submit(change).await {
                                error!(error = %e, "Failed to queue consumer change");
                                break;
                            }
                        }
                        Err(e) => warn!(error = %e, "Skipping malformed notification"),
                    }
                }
                Ok(None) => {
                    info!("Notification stream closed");
                    break;
                }
                Err(e) => {
                    error!(error = %e, "Failed to read notifications");
                    break;
                }
            },
        }
    }

    controller.stop().await?;
    Ok(())
}
