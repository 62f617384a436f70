//! sniproxy
//!
//! L4 proxy with TLS passthrough and SNI routing.
//!
//! This service:
//! - Loads routes from a TOML file at startup
//! - Accepts TCP connections on a single listener
//! - Inspects the TLS ClientHello for SNI-based routing
//! - Enforces per-route allow/deny subnets
//! - Optionally injects PROXY protocol v1/v2 headers
//! - Relays bytes between client and backend without terminating TLS

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, ValueEnum};
use tracing::{debug, error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use sniproxy::{Config, Dispatcher, HostnamePattern, Listener};

/// Address used when neither the command line nor the config file sets one.
const DEFAULT_BIND: &str = "[::]:443";

#[derive(Debug, Clone, Copy, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

/// TLS SNI routing proxy.
#[derive(Debug, Parser)]
#[command(name = "sniproxy", version, about)]
struct Cli {
    /// Path to the TOML configuration file.
    #[arg(short, long, env = "SNIPROXY_CONFIG", default_value = "sniproxy.toml")]
    config: PathBuf,

    /// Address to listen on (overrides `bind` from the config file).
    #[arg(short, long, env = "SNIPROXY_BIND")]
    bind: Option<String>,

    /// Log level (trace, debug, info, warn, error). RUST_LOG takes precedence.
    #[arg(long, env = "SNIPROXY_LOG_LEVEL", default_value = "info")]
    log_level: String,

    /// Log output format.
    #[arg(long, value_enum, default_value = "text")]
    log_format: LogFormat,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize tracing (prefer RUST_LOG, fallback to --log-level)
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| cli.log_level.clone().into());
    match cli.log_format {
        LogFormat::Text => tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer())
            .init(),
        LogFormat::Json => tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().json())
            .init(),
    }

    info!("Starting sniproxy");

    let config = Config::load(&cli.config)
        .with_context(|| format!("failed to load configuration from {}", cli.config.display()))?;
    let routes = config.route_table();

    let bind = cli
        .bind
        .or_else(|| config.bind.clone())
        .unwrap_or_else(|| DEFAULT_BIND.to_string());

    info!(
        config = %cli.config.display(),
        bind_addr = %bind,
        route_count = routes.len(),
        "Configuration loaded"
    );
    for route in routes.routes() {
        let domains: Vec<&str> = route.domains.iter().map(HostnamePattern::as_str).collect();
        debug!(
            domains = ?domains,
            backend = %route.backend,
            send_proxy = %route.send_proxy,
            acl = route.acl.is_enabled(),
            "Route loaded"
        );
    }

    let dispatcher = Dispatcher::new(routes, config.dispatch_config());
    let listener = Listener::bind(bind.as_str(), dispatcher)
        .await
        .with_context(|| format!("failed to bind listener on {}", bind))?;

    if let Err(e) = listener.run().await {
        error!(error = %e, "Listener failed");
        return Err(e).context("listener stopped accepting connections");
    }

    Ok(())
}
