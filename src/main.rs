//! CLI entry point for astro-daq
//!
//! ```bash
//! astro-daq run --config config/astro-daq.toml
//! astro-daq check-config config/astro-daq.toml
//! ```

use anyhow::{Context, Result};
use astro_core::driver::DriverContext;
use astro_core::property::MemoryPropertyStore;
use astro_core::timer::Scheduler;
use astro_daq::app::{driver_registry, validate_devices};
use astro_daq::config::{AstroConfig, DEFAULT_CONFIG_PATH};
use astro_daq::logging::{self, LoggingConfig};
use astro_daq::Daemon;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;

#[derive(Parser)]
#[command(name = "astro-daq")]
#[command(about = "Astronomy device drivers: mounts, cameras, filter wheels", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Load the configuration, attach devices and run until Ctrl+C
    Run {
        #[arg(long, default_value = DEFAULT_CONFIG_PATH)]
        config: PathBuf,
    },

    /// Validate a configuration file, including every device's driver config
    CheckConfig {
        #[arg(default_value = DEFAULT_CONFIG_PATH)]
        path: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    match cli.command {
        Commands::Run { config } => run(config).await,
        Commands::CheckConfig { path } => check_config(path),
    }
}

fn load(path: &PathBuf) -> Result<AstroConfig> {
    let config = AstroConfig::load_from(path)
        .with_context(|| format!("loading {}", path.display()))?;
    config.validate()?;
    Ok(config)
}

async fn run(path: PathBuf) -> Result<()> {
    let config = load(&path)?;
    let logging = LoggingConfig::from_config(&config).map_err(anyhow::Error::msg)?;
    logging::init(&logging);
    tracing::info!(config = %path.display(), "configuration loaded");

    let daemon = match Daemon::start(&config).await {
        Ok(daemon) => daemon,
        Err(e) => {
            tracing::error!(error = %format!("{e:#}"), "startup failed");
            return Err(e);
        }
    };

    tokio::signal::ctrl_c().await.context("waiting for Ctrl+C")?;
    daemon.shutdown().await;
    tracing::info!("bye");
    Ok(())
}

fn check_config(path: PathBuf) -> Result<()> {
    let config = load(&path)?;
    let store = Arc::new(MemoryPropertyStore::new());
    let registry = driver_registry(DriverContext::new(store, Scheduler::new()));
    validate_devices(&registry, &config.devices)?;

    println!("{}: OK", path.display());
    println!(
        "  {} device(s), {} enabled; hot-plug {}",
        config.devices.len(),
        config.enabled_devices().count(),
        if config.hotplug.enabled { "on" } else { "off" }
    );
    for device in &config.devices {
        println!(
            "  - {} ({}){}",
            device.id,
            device.driver,
            if device.enabled { "" } else { " [disabled]" }
        );
    }
    Ok(())
}
