//! Veil Proxy server
//!
//! Terminates TLS, authenticates the first bytes of every stream
//! against the configured password set, and relays authenticated
//! traffic to its origin. Everything else is served by the decoy so
//! active probes see an ordinary webserver.

use anyhow::{bail, Context, Result};
use clap::Parser;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::EnvFilter;
use veil_proxy::config::RunType;
use veil_proxy::{Config, Service};

/// Veil Proxy server - TLS-camouflaged circumvention proxy
#[derive(Parser, Debug)]
#[command(name = "veil-server")]
#[command(about = "Veil Proxy server - TLS-camouflaged circumvention proxy")]
#[command(version)]
struct Args {
    /// Configuration file path (JSON)
    #[arg(short, long, default_value = "config.json")]
    config: String,

    /// Log filter (trace, debug, info, warn, error); overrides the
    /// config's log_level
    #[arg(short = 'v', long)]
    log_level: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let config = match Config::sip003().context("SIP003 environment rejected")? {
        Some(config) => config,
        None => Config::load(&args.config).context("failed to load configuration")?,
    };

    let directive = args
        .log_level
        .clone()
        .unwrap_or_else(|| config.log_directive().to_string());
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(directive))
        .init();

    if config.run_type != RunType::Server {
        bail!("run_type is not a server mode; use veil-client");
    }

    info!("veil-proxy server v{}", veil_proxy::VERSION);
    info!("listening on {}", config.local_endpoint());
    if config.ssl.plain_http_response.is_empty() {
        info!("decoy: opaque relay to {}", config.remote_endpoint());
    } else {
        info!("decoy: serving {}", config.ssl.plain_http_response);
    }

    let service = Arc::new(Service::new(config)?);
    let runner = Arc::clone(&service);

    tokio::select! {
        result = runner.run() => result.context("service failed")?,
        _ = tokio::signal::ctrl_c() => {
            info!("shutting down...");
            service.stop();
        }
    }

    Ok(())
}
