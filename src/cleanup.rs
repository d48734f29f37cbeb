//! Age-based sweeping of the download directory.
//!
//! Sweeps take no lock: a file can be removed while a concurrent request is
//! about to serve it, and a download can land while a sweep is walking.

use std::{
    collections::HashSet,
    fs,
    path::{Path, PathBuf},
    time::Duration,
};

use anyhow::{Result, bail};
use chrono::{DateTime, TimeDelta, Utc};
use serde::Serialize;
use tokio::task;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use walkdir::WalkDir;

/// Validated age threshold in hours.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CleanupHours(u32);

impl CleanupHours {
    pub const MIN: u32 = 1;
    pub const MAX: u32 = 168;
    pub const DEFAULT: Self = Self(24);

    pub fn new(hours: u32) -> Result<Self> {
        if !(Self::MIN..=Self::MAX).contains(&hours) {
            bail!(
                "hours must be between {} and {}, got {hours}",
                Self::MIN,
                Self::MAX
            );
        }
        Ok(Self(hours))
    }

    pub fn get(self) -> u32 {
        self.0
    }

    pub fn as_delta(self) -> TimeDelta {
        TimeDelta::hours(i64::from(self.0))
    }
}

impl Default for CleanupHours {
    fn default() -> Self {
        Self::DEFAULT
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CleanupSummary {
    pub message: String,
    pub cleaned_files: u64,
    pub freed_bytes: u64,
    pub freed_space_mb: f64,
}

impl CleanupSummary {
    fn new(cleaned_files: u64, freed_bytes: u64, hours: CleanupHours) -> Self {
        let freed_space_mb = (freed_bytes as f64 / (1024.0 * 1024.0) * 100.0).round() / 100.0;
        Self {
            message: format!(
                "Cleaned up {cleaned_files} file(s) older than {} hour(s)",
                hours.get()
            ),
            cleaned_files,
            freed_bytes,
            freed_space_mb,
        }
    }
}

/// Deletes every regular file under `root` whose modification time is
/// strictly older than `now - hours`.
///
/// Files that vanish or cannot be removed mid-sweep are logged and skipped.
/// Sub-directories emptied by the sweep (or already empty and stale) are
/// removed as well; `root` itself is always kept.
pub fn sweep(root: &Path, hours: CleanupHours, now: DateTime<Utc>) -> Result<CleanupSummary> {
    let cutoff = now - hours.as_delta();
    let mut cleaned_files = 0u64;
    let mut freed_bytes = 0u64;
    let mut touched_dirs: HashSet<PathBuf> = HashSet::new();

    if !root.exists() {
        return Ok(CleanupSummary::new(0, 0, hours));
    }

    for entry in WalkDir::new(root)
        .min_depth(1)
        .into_iter()
        .filter_map(|entry| match entry {
            Ok(entry) => Some(entry),
            Err(err) => {
                warn!("skipping unreadable entry during sweep: {err}");
                None
            }
        })
        .filter(|entry| entry.file_type().is_file())
    {
        let metadata = match entry.metadata() {
            Ok(metadata) => metadata,
            Err(err) => {
                debug!("{} vanished before inspection: {err}", entry.path().display());
                continue;
            }
        };
        let Ok(modified) = metadata.modified() else {
            continue;
        };
        if DateTime::<Utc>::from(modified) >= cutoff {
            continue;
        }

        match fs::remove_file(entry.path()) {
            Ok(()) => {
                debug!("removed {}", entry.path().display());
                cleaned_files += 1;
                freed_bytes += metadata.len();
                if let Some(parent) = entry.path().parent() {
                    touched_dirs.insert(parent.to_path_buf());
                }
            }
            Err(err) => warn!("could not remove {}: {err}", entry.path().display()),
        }
    }

    prune_empty_dirs(root, cutoff, &touched_dirs);

    Ok(CleanupSummary::new(cleaned_files, freed_bytes, hours))
}

/// Removes empty directories below `root`, deepest first. A directory is only
/// eligible when the sweep emptied it or its own mtime is older than `cutoff`,
/// so freshly created download directories survive.
fn prune_empty_dirs(root: &Path, cutoff: DateTime<Utc>, touched: &HashSet<PathBuf>) {
    let mut emptied: HashSet<PathBuf> = touched.clone();
    for entry in WalkDir::new(root)
        .min_depth(1)
        .contents_first(true)
        .into_iter()
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.file_type().is_dir())
    {
        let path = entry.path();
        let stale = entry
            .metadata()
            .ok()
            .and_then(|metadata| metadata.modified().ok())
            .is_some_and(|modified| DateTime::<Utc>::from(modified) < cutoff);
        if !stale && !emptied.contains(path) {
            continue;
        }
        if fs::remove_dir(path).is_ok() {
            debug!("removed empty directory {}", path.display());
            if let Some(parent) = path.parent() {
                emptied.insert(parent.to_path_buf());
            }
        }
    }
}

/// Sweeps `root` every `interval` until `shutdown` fires. The first sweep runs
/// immediately.
pub async fn run_periodic(
    root: PathBuf,
    hours: CleanupHours,
    interval: Duration,
    shutdown: CancellationToken,
) {
    let mut ticker = tokio::time::interval(interval);
    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = shutdown.cancelled() => break,
        }

        let sweep_root = root.clone();
        match task::spawn_blocking(move || sweep(&sweep_root, hours, Utc::now())).await {
            Ok(Ok(summary)) if summary.cleaned_files > 0 => info!(
                cleaned_files = summary.cleaned_files,
                freed_bytes = summary.freed_bytes,
                "periodic cleanup finished"
            ),
            Ok(Ok(_)) => debug!("periodic cleanup found nothing to remove"),
            Ok(Err(err)) => warn!("periodic cleanup failed: {err:#}"),
            Err(err) => warn!("periodic cleanup task panicked: {err}"),
        }
    }
    debug!("periodic cleanup stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs::File;
    use std::time::{Duration, SystemTime};
    use tempfile::tempdir;

    fn write_aged(path: &Path, bytes: &[u8], age_hours: u64) {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).unwrap();
        }
        fs::write(path, bytes).unwrap();
        let modified = SystemTime::now() - Duration::from_secs(age_hours * 3600);
        File::options()
            .write(true)
            .open(path)
            .unwrap()
            .set_modified(modified)
            .unwrap();
    }

    #[test]
    fn cleanup_hours_are_bounded() {
        assert!(CleanupHours::new(0).is_err());
        assert!(CleanupHours::new(169).is_err());
        assert_eq!(CleanupHours::new(1).unwrap().get(), 1);
        assert_eq!(CleanupHours::new(168).unwrap().get(), 168);
        assert_eq!(CleanupHours::default().get(), 24);
    }

    #[test]
    fn sweep_removes_only_files_older_than_threshold() -> Result<()> {
        let dir = tempdir()?;
        let fresh = dir.path().join("fresh.mp4");
        let day_old = dir.path().join("day_old.mp4");
        let week_old = dir.path().join("nested/week_old.mp3");
        write_aged(&fresh, &[0u8; 100], 1);
        write_aged(&day_old, &[0u8; 2048], 25);
        write_aged(&week_old, &[0u8; 4096], 200);

        let summary = sweep(dir.path(), CleanupHours::new(24)?, Utc::now())?;

        assert_eq!(summary.cleaned_files, 2);
        assert_eq!(summary.freed_bytes, 2048 + 4096);
        assert!(fresh.exists());
        assert!(!day_old.exists());
        assert!(!week_old.exists());
        assert!(!dir.path().join("nested").exists());
        assert!(dir.path().exists());
        Ok(())
    }

    #[test]
    fn second_sweep_is_a_no_op() -> Result<()> {
        let dir = tempdir()?;
        write_aged(&dir.path().join("old.mp4"), b"old", 48);
        write_aged(&dir.path().join("new.mp4"), b"new", 0);

        let first = sweep(dir.path(), CleanupHours::DEFAULT, Utc::now())?;
        assert_eq!(first.cleaned_files, 1);

        let second = sweep(dir.path(), CleanupHours::DEFAULT, Utc::now())?;
        assert_eq!(second.cleaned_files, 0);
        assert_eq!(second.freed_bytes, 0);
        assert!(dir.path().join("new.mp4").exists());
        Ok(())
    }

    #[test]
    fn cutoff_is_relative_to_supplied_now() -> Result<()> {
        let dir = tempdir()?;
        let file = dir.path().join("clip.mp4");
        write_aged(&file, b"clip", 2);

        let earlier = Utc::now() - TimeDelta::hours(3);
        let summary = sweep(dir.path(), CleanupHours::new(1)?, earlier)?;
        assert_eq!(summary.cleaned_files, 0);
        assert!(file.exists());

        let summary = sweep(dir.path(), CleanupHours::new(1)?, Utc::now())?;
        assert_eq!(summary.cleaned_files, 1);
        Ok(())
    }

    #[test]
    fn fresh_empty_directories_survive() -> Result<()> {
        let dir = tempdir()?;
        fs::create_dir_all(dir.path().join("instagram/in-flight"))?;

        sweep(dir.path(), CleanupHours::DEFAULT, Utc::now())?;
        assert!(dir.path().join("instagram/in-flight").exists());
        Ok(())
    }

    #[test]
    fn missing_root_reports_nothing() -> Result<()> {
        let dir = tempdir()?;
        let summary = sweep(&dir.path().join("absent"), CleanupHours::DEFAULT, Utc::now())?;
        assert_eq!(summary.cleaned_files, 0);
        Ok(())
    }

    #[tokio::test]
    async fn periodic_sweeper_runs_until_cancelled() -> Result<()> {
        let dir = tempdir()?;
        let old = dir.path().join("old.mp4");
        write_aged(&old, b"old", 48);
        let shutdown = CancellationToken::new();

        let handle = tokio::spawn(run_periodic(
            dir.path().to_path_buf(),
            CleanupHours::DEFAULT,
            Duration::from_millis(20),
            shutdown.clone(),
        ));
        for _ in 0..100 {
            if !old.exists() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert!(!old.exists());

        shutdown.cancel();
        tokio::time::timeout(Duration::from_secs(5), handle).await??;
        Ok(())
    }

    #[test]
    fn summary_reports_megabytes_rounded() {
        let summary = CleanupSummary::new(1, 1_572_864, CleanupHours::DEFAULT);
        assert_eq!(summary.freed_space_mb, 1.5);
        assert_eq!(summary.message, "Cleaned up 1 file(s) older than 24 hour(s)");
    }
}
