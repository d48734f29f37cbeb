#![forbid(unsafe_code)]

//! HTTP service entry point. Reads the env file, applies CLI overrides, and
//! serves the download API until Ctrl+C.

use std::{net::SocketAddr, path::PathBuf};

use anyhow::{Context, Result};
use clap::Parser;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use zero_downloader::{
    cleanup::{self, CleanupHours},
    config::{DEFAULT_CONFIG_PATH, load_settings_from},
    logging::init_logging,
    security::ensure_not_root,
    server::{AppState, router},
};

#[derive(Parser, Debug)]
#[command(author, version, about = "Serve the Zero Downloader HTTP API.")]
struct Cli {
    #[arg(long = "config", value_name = "PATH", default_value = DEFAULT_CONFIG_PATH, help = "Path to the env config file")]
    config: PathBuf,
    #[arg(
        long = "download-dir",
        value_name = "PATH",
        help = "Override the download directory"
    )]
    download_dir: Option<PathBuf>,
    #[arg(long = "host", value_name = "ADDR", help = "Override the bind address")]
    host: Option<String>,
    #[arg(short = 'p', long = "port", value_name = "PORT", help = "Override the port")]
    port: Option<u16>,
    #[arg(
        long = "timeout-secs",
        value_name = "SECS",
        help = "Override the per-download timeout"
    )]
    timeout_secs: Option<u64>,
    #[arg(long = "allow-root", help = "Allow running as root")]
    allow_root: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging()?;

    if !cli.allow_root {
        ensure_not_root("backend")?;
    }

    let mut settings = load_settings_from(&cli.config)?;
    if let Some(dir) = cli.download_dir {
        settings.download_dir = dir;
    }
    if let Some(host) = cli.host {
        settings.host = host;
    }
    if let Some(port) = cli.port {
        settings.port = port;
    }
    if let Some(secs) = cli.timeout_secs {
        settings.download_timeout = std::time::Duration::from_secs(secs);
    }

    let shutdown = CancellationToken::new();
    let state = AppState::new(&settings, shutdown.clone()).context("preparing download store")?;
    let root = state.downloader().store().root().to_path_buf();
    info!("download directory: {}", root.display());

    for tool in state.downloader().check_tools().await {
        warn!("{tool} is not installed or not runnable; related downloads will fail");
    }

    if let Some((hours, interval)) = settings.periodic_cleanup() {
        let hours = CleanupHours::new(hours).context("AUTO_CLEANUP_HOURS")?;
        info!(
            "removing files older than {}h every {}m",
            hours.get(),
            interval.as_secs() / 60
        );
        tokio::spawn(cleanup::run_periodic(
            root,
            hours,
            interval,
            shutdown.clone(),
        ));
    }

    let addr = SocketAddr::new(
        settings
            .host
            .parse()
            .with_context(|| format!("parsing host {}", settings.host))?,
        settings.port,
    );
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("binding to {}", addr))?;
    info!("API server listening on http://{}", addr);

    axum::serve(listener, router(state))
        .with_graceful_shutdown(shutdown_signal(shutdown))
        .await
        .context("running API server")?;

    Ok(())
}

/// Waits for Ctrl+C, then cancels in-flight downloads so graceful shutdown
/// does not wait on them.
async fn shutdown_signal(shutdown: CancellationToken) {
    if let Err(err) = signal::ctrl_c().await {
        warn!("Failed to install Ctrl+C handler: {}", err);
    }
    info!("shutting down");
    shutdown.cancel();
}
