//! Relaynet router entry point.
//!
//! Starts a router with configuration from a TOML file, CLI overrides and
//! defaults, then supervises its coordinating loop until ctrl-c.

use std::net::IpAddr;
use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use tokio::net::UdpSocket;
use tracing_subscriber::EnvFilter;

use relaynet_network::{TcpTransport, TcpTransportConfig};
use relaynet_node::config::with_host;
use relaynet_node::{Router, RouterConfig};

/// Relaynet Router
#[derive(Parser, Debug)]
#[command(name = "relaynet-router", version, about = "Relaynet overlay router")]
struct Args {
    /// Path to the configuration file (TOML).
    #[arg(short, long, default_value = "relaynet.toml")]
    config: PathBuf,

    /// Override the router id.
    #[arg(long)]
    id: Option<String>,

    /// Override the router address (host:port).
    #[arg(long)]
    address: Option<String>,

    /// Override the bootstrap routers, comma separated.
    #[arg(long, value_delimiter = ',')]
    discovery: Option<Vec<String>>,

    /// Override the log level (trace, debug, info, warn, error).
    #[arg(long)]
    log_level: Option<String>,

    /// Emit logs as JSON.
    #[arg(long)]
    json_logs: bool,

    /// Generate a default config file and exit.
    #[arg(long)]
    init: bool,
}

fn init_tracing(level: &str, json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    if json {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .with_target(true)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(true)
            .init();
    }
}

/// Local IP the OS would use to reach the outside world. No packet is sent.
async fn detect_local_ip() -> Option<IpAddr> {
    let socket = UdpSocket::bind("0.0.0.0:0").await.ok()?;
    socket.connect("8.8.8.8:80").await.ok()?;
    socket.local_addr().ok().map(|addr| addr.ip())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    // Handle --init flag
    if args.init {
        init_tracing(args.log_level.as_deref().unwrap_or("info"), args.json_logs);
        let config = RouterConfig::default();
        config.save(&args.config)?;
        tracing::info!(path = %args.config.display(), "wrote default config");
        return Ok(());
    }

    // Load configuration
    let mut config = RouterConfig::load(&args.config)?;

    // Apply CLI overrides
    if let Some(id) = args.id {
        config.router.id = id;
    }
    if let Some(address) = args.address {
        config.router.address = address;
    }
    if let Some(discovery) = args.discovery {
        config.router.discovery = discovery;
    }
    if let Some(level) = args.log_level {
        config.logging.level = level;
    }
    let json = args.json_logs || config.logging.format.eq_ignore_ascii_case("json");
    init_tracing(&config.logging.level, json);

    tracing::info!("Relaynet router v{}", env!("CARGO_PKG_VERSION"));

    if config.router.address_auto_detect {
        match detect_local_ip().await {
            Some(ip) => {
                let Some(address) = with_host(&config.router.address, ip) else {
                    anyhow::bail!("router address {} has no port", config.router.address);
                };
                if config.router.listen.is_none() {
                    config.router.listen = Some(format!("0.0.0.0:{}", ip_port(&address)?));
                }
                tracing::info!(%address, "detected router address");
                config.router.address = address;
            }
            None => tracing::warn!(
                address = %config.router.address,
                "address auto-detect failed, using configured address"
            ),
        }
    }

    let transport = Arc::new(TcpTransport::new(TcpTransportConfig {
        listen_address: config.listen_address().to_string(),
        queue_capacity: config.router.queue_capacity,
        ..TcpTransportConfig::default()
    }));
    let router = Router::from_config(&config, transport);

    let Some(mut handle) = router.start().await? else {
        anyhow::bail!("router was already running");
    };

    tokio::select! {
        joined = &mut handle => match joined {
            Ok(Ok(())) => tracing::info!("router loop finished"),
            Ok(Err(e)) => tracing::error!(error = %e, "router loop failed"),
            Err(e) => tracing::error!(error = %e, "router loop panicked"),
        },
        signal = tokio::signal::ctrl_c() => {
            if let Err(e) = signal {
                tracing::warn!(error = %e, "failed to listen for ctrl-c");
            }
            tracing::info!("received shutdown signal");
        }
    }

    router.stop().await;
    tracing::info!("Relaynet router exited cleanly");
    Ok(())
}

fn ip_port(address: &str) -> anyhow::Result<u16> {
    relaynet_core::address_port(address)
        .ok_or_else(|| anyhow::anyhow!("router address {address} has no port"))
}
