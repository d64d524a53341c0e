//! Event Gateway CLI

use clap::Parser;
use event_gateway::{Gateway, NetworkTransportFactory};
use events_core::config::GatewayConfig;
use events_core::store::FileSubscriptionStore;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Parser, Debug)]
#[command(name = "event-gateway")]
#[command(about = "Webhook event gateway with fan-out to HTTP and NATS subscribers")]
#[command(version)]
struct Args {
    /// Configuration file (YAML, TOML or JSON)
    #[arg(long, short, env = "EVENT_GATEWAY_CONFIG")]
    config: Option<String>,

    /// Gateway name, overrides the configuration file
    #[arg(long, env = "GATEWAY_NAME")]
    name: Option<String>,

    /// Subscription store directory, overrides the configuration file
    #[arg(long, env = "STORE_DIR")]
    store_dir: Option<String>,

    /// Admin API listen address, overrides the configuration file
    #[arg(long, env = "ADMIN_LISTEN")]
    admin_listen: Option<String>,

    /// Disable admin API
    #[arg(long, env = "ADMIN_DISABLED")]
    admin_disabled: bool,

    #[arg(long, env = "LOG_LEVEL")]
    log_level: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let mut config = GatewayConfig::load(args.config.as_deref())?;
    if let Some(name) = args.name {
        config.gateway.name = name;
    }
    if let Some(dir) = args.store_dir {
        config.store.dir = dir;
    }
    if let Some(listen) = args.admin_listen {
        config.admin.listen = listen;
    }
    if args.admin_disabled {
        config.admin.enabled = false;
    }
    let log_level = args
        .log_level
        .unwrap_or_else(|| config.observability.log_level.clone());

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&log_level));
    if config.observability.log_format == "pretty" {
        tracing_subscriber::registry()
            .with(fmt::layer())
            .with(filter)
            .init();
    } else {
        tracing_subscriber::registry()
            .with(fmt::layer().json())
            .with(filter)
            .init();
    }

    info!(
        version = env!("CARGO_PKG_VERSION"),
        gateway = %config.gateway.name,
        routes = config.routes.len(),
        store = %config.store.dir,
        "Starting event-gateway"
    );

    let store = Arc::new(FileSubscriptionStore::new(&config.store.dir));
    let factory = Arc::new(NetworkTransportFactory::new(&config.dispatch)?);
    let gateway = Gateway::new(config, store, factory)?;

    gateway.run().await?;
    info!("event-gateway stopped");
    Ok(())
}
