#![forbid(unsafe_code)]

//! One-shot cleanup of the download directory, meant to be run from cron or
//! a systemd timer alongside (or instead of) the backend's periodic sweep.

use std::path::PathBuf;

use anyhow::Result;
use chrono::Utc;
use clap::Parser;
use tracing::info;
use zero_downloader::{
    cleanup::{CleanupHours, sweep},
    config::{DEFAULT_CONFIG_PATH, load_settings_from},
    logging::init_logging,
};

#[derive(Parser, Debug)]
#[command(author, version, about = "Delete downloads older than a number of hours.")]
struct SweepArgs {
    #[arg(long = "config", value_name = "PATH", default_value = DEFAULT_CONFIG_PATH, help = "Path to the env config file")]
    config: PathBuf,
    #[arg(
        long = "download-dir",
        value_name = "PATH",
        help = "Override the download directory"
    )]
    download_dir: Option<PathBuf>,
    #[arg(
        long = "hours",
        value_name = "N",
        default_value_t = CleanupHours::DEFAULT.get(),
        value_parser = clap::value_parser!(u32).range(i64::from(CleanupHours::MIN)..=i64::from(CleanupHours::MAX)),
        help = "Remove files older than N hours (1-168)"
    )]
    hours: u32,
}

fn main() -> Result<()> {
    let args = SweepArgs::parse();
    init_logging()?;

    let settings = load_settings_from(&args.config)?;
    let root = args.download_dir.unwrap_or(settings.download_dir);
    let hours = CleanupHours::new(args.hours)?;

    info!("sweeping {} (older than {}h)", root.display(), hours.get());
    let summary = sweep(&root, hours, Utc::now())?;

    println!("{}", summary.message);
    println!("Freed: {:.2} MB", summary.freed_space_mb);

    Ok(())
}
