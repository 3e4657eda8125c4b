// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
//  socksrelay — SOCKS relay-multiplexing proxy
//
//  Wires the active-relay registry, the demonstration plugin set, the
//  admission feed consumer, the keepalive engine, the SOCKS accept loop,
//  and the optional status endpoint together on one tokio runtime.
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

use clap::Parser;
use socksrelay_admin::StatusServer;
use socksrelay_core::ProxyConfig;
use socksrelay_plugin::PluginRegistry;
use socksrelay_registry::Registry;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info};

#[derive(Parser, Debug)]
#[command(name = "socksrelay", version, about = "SOCKS relay-multiplexing proxy")]
struct Cli {
    /// Path to a YAML configuration file
    #[arg(long)]
    config: Option<PathBuf>,

    /// Log level (overrides config file / SOCKSRELAY_LOG_LEVEL)
    #[arg(long)]
    log_level: Option<String>,

    /// SOCKS listen address (overrides config)
    #[arg(long)]
    listen: Option<SocketAddr>,

    /// Status endpoint listen address (overrides config)
    #[arg(long)]
    status_addr: Option<SocketAddr>,

    /// Disable the status endpoint entirely
    #[arg(long)]
    no_status: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let mut config = ProxyConfig::load(cli.config.as_deref().and_then(|p| p.to_str()))?;
    if let Some(log_level) = cli.log_level {
        config.log_level = log_level;
    }
    if let Some(listen) = cli.listen {
        config.listen_addr = listen;
    }
    if let Some(status_addr) = cli.status_addr {
        config.status.addr = status_addr;
    }
    if cli.no_status {
        config.status.enabled = false;
    }

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&config.log_level)),
        )
        .with_target(false)
        .init();

    info!(version = env!("CARGO_PKG_VERSION"), "socksrelay starting");

    let registry = Arc::new(Registry::new());

    let mut plugin_registry = PluginRegistry::new();
    socksrelay_plugins::register_demo_plugins(&mut plugin_registry);
    info!(plugins = plugin_registry.len(), "plugins registered");
    let plugin_registry = Arc::new(plugin_registry);

    // The admission feed's producer is the (out-of-scope) relay subsystem;
    // this process only owns the consumer side. The sender is kept alive
    // here so the consumer does not see its channel close while nothing
    // else holds a clone.
    let (_admission_sender, consumer) = socksrelay_registry::channel(config.admission_capacity, registry.clone());
    let consumer_handle = tokio::spawn(consumer);

    let keepalive_handle = tokio::spawn(socksrelay_proxy::keepalive::run(
        registry.clone(),
        config.keepalive.interval_secs,
    ));

    let status_handle = if config.status.enabled {
        let status_registry = registry.clone();
        let addr = config.status.addr;
        Some(tokio::spawn(async move {
            if let Err(err) = StatusServer::new(addr, status_registry).start().await {
                error!(%err, "status endpoint failed");
            }
        }))
    } else {
        info!("status endpoint disabled");
        None
    };

    let socks_server = socksrelay_proxy::server::run(
        config.listen_addr,
        registry.clone(),
        plugin_registry.clone(),
        config.dns_passthrough,
    );

    tokio::select! {
        result = socks_server => {
            if let Err(err) = result {
                error!(%err, "SOCKS accept loop exited");
            }
        }
        _ = tokio::signal::ctrl_c() => {
            info!("shutdown signal received");
        }
    }

    keepalive_handle.abort();
    consumer_handle.abort();
    if let Some(handle) = status_handle {
        handle.abort();
    }

    info!("socksrelay stopped");
    Ok(())
}
