//! CLI Entry Point for vkdaq-server
//!
//! Boots the acquisition worker and the HTTP server, then runs until Ctrl+C.
//!
//! # Usage
//!
//! ```bash
//! vkdaq-server --config config/vkdaq.toml
//! vkdaq-server --mock --port 8001 --log-level debug
//! ```

use anyhow::{Context, Result};
use clap::Parser;
use mimalloc::MiMalloc;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};

use vkdaq_server::config::{Backend, ServerConfig, DEFAULT_CONFIG_PATH};
use vkdaq_server::driver::{DaqDriver, MockDaq, VkDaqLibrary};
use vkdaq_server::{
    logging, server, AcquisitionState, AcquisitionWorker, ControlSurface, DaqError,
};

#[global_allocator]
static GLOBAL: MiMalloc = MiMalloc;

#[derive(Parser)]
#[command(name = "vkdaq-server")]
#[command(about = "Trigger-driven acquisition server publishing the latest capture over HTTP", long_about = None)]
struct Cli {
    /// Configuration file
    #[arg(long, default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    /// HTTP port (overrides the configuration)
    #[arg(long)]
    port: Option<u16>,

    /// Use the simulated device instead of libvkdaq
    #[arg(long)]
    mock: bool,

    /// Log level (overrides the configuration)
    #[arg(long)]
    log_level: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut config = ServerConfig::load_from(&cli.config)
        .map_err(DaqError::from)
        .with_context(|| format!("Failed to load {}", cli.config.display()))?;
    if let Some(port) = cli.port {
        config.http.port = port;
    }
    if cli.mock {
        config.driver.backend = Backend::Mock;
    }
    if let Some(level) = cli.log_level {
        config.application.log_level = level;
    }
    config.validate().map_err(DaqError::Configuration)?;
    logging::init_from_config(&config).map_err(anyhow::Error::msg)?;

    let addr = config.bind_addr().map_err(DaqError::Configuration)?;
    let driver = open_driver(&config)?;

    let state = Arc::new(AcquisitionState::new(config.initial_configuration()));
    let worker = AcquisitionWorker::new(driver, Arc::clone(&state), config.worker_settings());
    info!(
        name = %config.application.name,
        task = worker.task_name(),
        backend = ?config.driver.backend,
        "Starting acquisition worker"
    );
    let worker = worker
        .spawn()
        .map_err(DaqError::from)
        .context("Failed to spawn acquisition worker")?;

    let channels = config
        .acquisition
        .channels
        .iter()
        .map(|channel| channel.name.clone())
        .collect();
    let surface = ControlSurface::new(
        Arc::clone(&state),
        config.limits(),
        channels,
        config.application.name.clone(),
    );

    let served = server::serve(addr, surface, async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "Failed to listen for Ctrl+C");
        }
        info!("Shutdown requested");
    })
    .await;

    // Joining waits out the current blocking read.
    worker.request_stop();
    tokio::task::spawn_blocking(move || worker.shutdown())
        .await
        .context("Acquisition worker shutdown failed")?;
    info!("Acquisition worker joined");

    served?;
    Ok(())
}

fn open_driver(config: &ServerConfig) -> Result<Box<dyn DaqDriver>> {
    match config.driver.backend {
        Backend::Mock => {
            let (driver, _handle) = MockDaq::new(config.mock.clone());
            Ok(Box::new(driver))
        }
        Backend::Vkdaq => {
            let path = config
                .driver
                .library_path
                .clone()
                .map_or_else(VkDaqLibrary::default_library_name, PathBuf::into_os_string);
            let driver = VkDaqLibrary::open(&path)
                .map_err(DaqError::from)
                .context("Failed to open libvkdaq (use --mock to run without hardware)")?;
            Ok(Box::new(driver))
        }
    }
}
