//! Progressive Delivery Controller - daemon.
//!
//! Gates releases behind feature flags, advances exposure in stages against
//! live metrics, watches rollback triggers, and executes rollbacks when
//! violations persist. Serves the operator API over HTTP.

#![forbid(unsafe_code)]

mod controller;
mod flags;
mod http_api;
mod providers;
mod rollback;
mod rollout;
mod scheduler;
mod store;
mod trigger;

use anyhow::{Context, Result};
use clap::Parser;
use pdc_common::config::{ControllerConfig, default_state_dir};
use pdc_common::{EventBus, ProviderMode, events};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

use controller::Controller;
use http_api::{ApiContext, create_router};
use providers::{ActionBackend, MetricsBackend, TrafficBackend};
use store::StateStore;

#[derive(Parser)]
#[command(name = "pdcd")]
#[command(author, version, about = "PDC daemon - progressive delivery control loop")]
struct Cli {
    /// Path to the configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Listen address for the operator API (overrides config)
    #[arg(long)]
    http_addr: Option<String>,

    /// Durable-state directory (overrides config)
    #[arg(long)]
    state_dir: Option<PathBuf>,

    /// Use simulated collaborators regardless of config
    #[arg(long)]
    simulate: bool,

    /// Enable verbose output
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::new("info")
    };
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(filter)
        .init();

    info!("Starting PDC daemon...");

    let mut config = ControllerConfig::load(cli.config.as_deref())?;
    if let Some(addr) = cli.http_addr {
        config.daemon.http_addr = addr;
    }
    if cli.simulate {
        config.providers.mode = ProviderMode::Simulated;
    }

    let state_dir = cli
        .state_dir
        .or_else(|| config.daemon.state_dir.clone())
        .or_else(default_state_dir)
        .context("no usable state directory")?;
    let store = StateStore::open(&state_dir)?;
    info!("State directory: {}", state_dir.display());

    let bus = EventBus::default();
    if let Some(ref path) = config.daemon.event_log {
        info!("Audit log: {}", path.display());
        let _audit = events::spawn_audit_writer(&bus, path.clone());
    }

    match config.providers.mode {
        ProviderMode::Simulated => {
            warn!("Running with simulated collaborators; not for production use")
        }
        ProviderMode::Http => info!(
            "Collaborators: metrics={}, traffic={}, actions={}",
            config.providers.metrics_url, config.providers.traffic_url, config.providers.actions_url
        ),
    }
    let metrics = Arc::new(MetricsBackend::from_config(&config.providers));
    let traffic = Arc::new(TrafficBackend::from_config(&config.providers));
    let actions = Arc::new(ActionBackend::from_config(&config.providers));

    let http_addr = config.daemon.http_addr.clone();
    let controller = Controller::open(config, metrics, traffic, actions, bus, store)?;
    let _coordination = controller.start();

    let router = create_router(ApiContext {
        controller,
        started_at: Instant::now(),
        version: env!("CARGO_PKG_VERSION"),
    });

    let listener = tokio::net::TcpListener::bind(&http_addr)
        .await
        .with_context(|| format!("failed to bind {http_addr}"))?;
    info!("Operator API listening on {}", http_addr);
    axum::serve(listener, router).await?;

    Ok(())
}
