//! Veil Proxy client
//!
//! Runs the client-side modes: a local SOCKS5 acceptor (client), a
//! fixed-target tunnel (forward), or a transparent redirect acceptor
//! (nat), all relaying through the remote server over TLS.

use anyhow::{bail, Context, Result};
use clap::Parser;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::EnvFilter;
use veil_proxy::config::RunType;
use veil_proxy::{Config, Service};

/// Veil Proxy client - TLS-camouflaged circumvention proxy
#[derive(Parser, Debug)]
#[command(name = "veil-client")]
#[command(about = "Veil Proxy client - TLS-camouflaged circumvention proxy")]
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

    // SIP003 plugin environment wins over the config file
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

    if matches!(config.run_type, RunType::Server | RunType::ServerTun) {
        bail!("run_type is a server mode; use veil-server");
    }

    info!("veil-proxy client v{}", veil_proxy::VERSION);
    info!("local: {}", config.local_endpoint());
    info!("remote: {}", config.remote_endpoint());
    if config.experimental.pipeline_num > 0 {
        info!(
            "pipelines enabled: up to {} per target, ack window {}",
            config.experimental.pipeline_num, config.experimental.pipeline_ack_window
        );
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
