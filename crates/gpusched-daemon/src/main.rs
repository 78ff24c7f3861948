//! gpusched daemon
//!
//! Runs the scheduler loop and serves the HTTP API on one host.

use anyhow::{Context, Result};
use clap::Parser;
use gpusched_api::create_router;
use gpusched_core::{DaemonConfig, LoggingConfig};
use gpusched_scheduler::Scheduler;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use tracing::{info, warn};
use tracing_subscriber::fmt::writer::BoxMakeWriter;
use tracing_subscriber::EnvFilter;

/// gpuschedd - single-host GPU job scheduler
#[derive(Parser, Debug)]
#[command(name = "gpuschedd")]
#[command(version, about, long_about = None)]
struct Args {
    /// Configuration file (TOML)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Address to bind the API server
    #[arg(long)]
    address: Option<String>,

    /// Port for the API server
    #[arg(long)]
    port: Option<u16>,

    /// Seconds between scheduler ticks
    #[arg(long)]
    poll_interval: Option<u64>,

    /// Minimum free memory (MiB) for a GPU to accept work
    #[arg(long)]
    min_free_memory: Option<u64>,

    /// Maximum utilization (%) for a GPU to accept work
    #[arg(long)]
    max_utilization: Option<u32>,

    /// Root directory for job output
    #[arg(long)]
    output_dir: Option<PathBuf>,

    /// Log level
    #[arg(long)]
    log_level: Option<String>,
}

impl Args {
    /// Load the config file, if any, and apply flag overrides
    fn into_config(self) -> Result<DaemonConfig> {
        let mut config = match &self.config {
            Some(path) => DaemonConfig::from_file(path)
                .with_context(|| format!("failed to load config from {}", path.display()))?,
            None => DaemonConfig::default(),
        };

        if let Some(address) = self.address {
            config.api.address = address;
        }
        if let Some(port) = self.port {
            config.api.port = port;
        }
        if let Some(secs) = self.poll_interval {
            config.scheduler.poll_interval_secs = secs;
        }
        if let Some(mb) = self.min_free_memory {
            config.scheduler.min_free_memory_mb = mb;
        }
        if let Some(percent) = self.max_utilization {
            config.scheduler.max_utilization_percent = percent;
        }
        if let Some(dir) = self.output_dir {
            config.runtime.output_dir = dir;
        }
        if let Some(level) = self.log_level {
            config.logging.level = level;
        }

        Ok(config)
    }
}

/// Install the global subscriber; `RUST_LOG` wins over the configured level
fn init_logging(config: &LoggingConfig) -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.level))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    let writer = match &config.file {
        Some(path) => {
            let file = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .with_context(|| format!("failed to open log file {}", path.display()))?;
            BoxMakeWriter::new(Mutex::new(file))
        }
        None => BoxMakeWriter::new(std::io::stderr),
    };

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(writer);

    let result = if config.format.eq_ignore_ascii_case("json") {
        builder.json().try_init()
    } else {
        builder.with_ansi(config.file.is_none()).try_init()
    };
    result.map_err(|e| anyhow::anyhow!("failed to set subscriber: {}", e))
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "Failed to listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }

    info!("Shutdown signal received");
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let config = args.into_config()?;

    init_logging(&config.logging)?;

    info!("Starting gpusched daemon v{}", env!("CARGO_PKG_VERSION"));

    let scheduler = Arc::new(Scheduler::from_config(&config)?);
    scheduler
        .start()
        .await
        .context("scheduler failed to start")?;

    let router = create_router(scheduler.clone(), config.api.recent_output_lines);

    let addr: SocketAddr = format!("{}:{}", config.api.address, config.api.port)
        .parse()
        .context("invalid listen address")?;

    info!("API server listening on {}", addr);
    info!(
        output_dir = %config.runtime.output_dir.display(),
        poll_interval_secs = config.scheduler.poll_interval().as_secs(),
        "Scheduler running"
    );

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {}", addr))?;
    let served = axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal())
        .await;

    scheduler.stop().await;
    served.context("server error")?;

    info!("gpusched daemon stopped");
    Ok(())
}
