//! CLI entry point for the LAST unit.
//!
//! Serve the unit:
//! ```bash
//! last_unit serve --config config/last_unit.toml
//! ```
//!
//! Check a configuration file without starting anything:
//! ```bash
//! last_unit check-config --config config/last_unit.toml
//! ```

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use last_unit::config::{UnitConfig, DEFAULT_CONFIG_PATH};
use last_unit::equipment::Site;
use last_unit::server::{self, AppState};
use last_unit::slots::{SlotManager, SlotRegistry};
use last_unit::unit::Unit;
use last_unit::{activities::UnitActivities, logging};

#[derive(Parser)]
#[command(name = "last_unit")]
#[command(about = "LAST unit control plane: local LIPP drivers and peer forwarding", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the drivers and serve HTTP until shut down
    Serve {
        /// Configuration file
        #[arg(long, default_value = DEFAULT_CONFIG_PATH)]
        config: PathBuf,

        /// Override the HTTP port
        #[arg(long)]
        port: Option<u16>,

        /// Act as this host (e.g. last07e) instead of the system host name
        #[arg(long)]
        hostname: Option<String>,
    },

    /// Load and validate a configuration file, then print the effective settings
    CheckConfig {
        /// Configuration file
        #[arg(long, default_value = DEFAULT_CONFIG_PATH)]
        config: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Serve {
            config,
            port,
            hostname,
        } => serve(config, port, hostname).await,
        Commands::CheckConfig { config } => check_config(config),
    }
}

fn load(path: &PathBuf) -> Result<UnitConfig> {
    let config = UnitConfig::load_from(path)
        .with_context(|| format!("failed to load configuration from {}", path.display()))?;
    config
        .validate()
        .map_err(|e| anyhow::anyhow!("invalid configuration: {}", e))?;
    Ok(config)
}

fn check_config(path: PathBuf) -> Result<()> {
    let config = load(&path)?;
    let site = Site::detect(config.site.hostname.as_deref())?;
    println!("Configuration OK: {}", path.display());
    println!("  host:      {} (peer {})", site.hostname(), site.peer_hostname());
    println!(
        "  server:    {}:{}{}",
        config.server.bind, config.server.port, config.server.api_root
    );
    println!(
        "  driver:    {} {}",
        config.driver.program,
        config.driver.args.join(" ")
    );
    println!(
        "  sockets:   prefix '{}', {:?} namespace",
        config.driver.socket_prefix, config.driver.namespace
    );
    println!(
        "  timeouts:  ready {:?}, response {:?}, probe {:?}, lock {:?}",
        config.driver.ready_timeout,
        config.driver.response_timeout,
        config.driver.probe_timeout,
        config.driver.lock_timeout
    );
    Ok(())
}

async fn serve(path: PathBuf, port: Option<u16>, hostname: Option<String>) -> Result<()> {
    let mut config = load(&path)?;
    if let Some(port) = port {
        config.server.port = port;
    }
    if hostname.is_some() {
        config.site.hostname = hostname;
    }

    let _log_guard = logging::init_from_config(&config.logging).map_err(|e| anyhow::anyhow!(e))?;

    let site = Site::detect(config.site.hostname.as_deref())?;
    tracing::info!(
        host = %site.hostname(),
        peer = %site.peer_hostname(),
        side = ?site.side(),
        "starting unit"
    );

    let config = Arc::new(config);
    let registry = Arc::new(SlotRegistry::for_rig());
    let manager = SlotManager::new(registry.clone(), site, config.clone());
    let unit = Unit::new(registry, config.unit.clone());

    unit.activities().start(UnitActivities::STARTING_UP);
    manager.populate().await;
    unit.activities().end(UnitActivities::STARTING_UP);

    let shutdown = CancellationToken::new();
    let manager_task = manager.run(shutdown.clone());
    let timer_task = unit.spawn_activity_timer();

    let signal_token = shutdown.clone();
    tokio::spawn(async move {
        wait_for_signal().await;
        tracing::info!("shutdown signal received");
        signal_token.cancel();
    });

    let state = AppState {
        unit: unit.clone(),
        shutdown: shutdown.clone(),
    };
    let served = server::serve(&config.server, state).await;

    shutdown.cancel();
    unit.quit().await;
    let _ = manager_task.await;
    let _ = timer_task.await;
    tracing::info!("unit stopped");
    served
}

async fn wait_for_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigterm = match signal(SignalKind::terminate()) {
        Ok(s) => s,
        Err(e) => {
            tracing::warn!(error = %e, "no SIGTERM handler, Ctrl+C only");
            let _ = tokio::signal::ctrl_c().await;
            return;
        }
    };
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = sigterm.recv() => {}
    }
}
