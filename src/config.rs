use anyhow::{Context, Result};
use std::{
    fs,
    path::{Path, PathBuf},
    time::Duration,
};

pub const DEFAULT_CONFIG_PATH: &str = "/etc/zero-downloader-env";
pub const DEFAULT_DOWNLOAD_DIR: &str = "downloads";
pub const DEFAULT_HOST: &str = "0.0.0.0";
pub const DEFAULT_PORT: u16 = 8000;
pub const DEFAULT_YTDLP_BIN: &str = "yt-dlp";
pub const DEFAULT_INSTALOADER_BIN: &str = "instaloader";
pub const DEFAULT_DOWNLOAD_TIMEOUT_SECS: u64 = 600;
pub const DEFAULT_MAX_CONCURRENT_DOWNLOADS: usize = 4;
pub const DEFAULT_AUTO_CLEANUP_HOURS: u32 = 24;
pub const DEFAULT_CLEANUP_INTERVAL_MINUTES: u64 = 60;

/// Raw values as they appear in the env file. Everything is optional so the
/// file only needs to list what differs from the defaults.
#[derive(Debug, Clone, Default)]
pub struct EnvConfig {
    pub download_dir: Option<PathBuf>,
    pub host: Option<String>,
    pub port: Option<u16>,
    pub ytdlp_bin: Option<PathBuf>,
    pub instaloader_bin: Option<PathBuf>,
    pub download_timeout_secs: Option<u64>,
    pub max_concurrent_downloads: Option<usize>,
    pub auto_cleanup_hours: Option<u32>,
    pub cleanup_interval_minutes: Option<u64>,
}

/// Fully resolved settings handed to the service.
#[derive(Debug, Clone)]
pub struct Settings {
    pub download_dir: PathBuf,
    pub host: String,
    pub port: u16,
    pub ytdlp_bin: PathBuf,
    pub instaloader_bin: PathBuf,
    pub download_timeout: Duration,
    pub max_concurrent_downloads: usize,
    /// `0` disables the periodic sweep.
    pub auto_cleanup_hours: u32,
    /// `0` disables the periodic sweep.
    pub cleanup_interval_minutes: u64,
}

impl Default for Settings {
    fn default() -> Self {
        EnvConfig::default().into_settings()
    }
}

impl Settings {
    pub fn periodic_cleanup(&self) -> Option<(u32, Duration)> {
        if self.auto_cleanup_hours == 0 || self.cleanup_interval_minutes == 0 {
            return None;
        }
        Some((
            self.auto_cleanup_hours,
            Duration::from_secs(self.cleanup_interval_minutes.saturating_mul(60)),
        ))
    }
}

impl EnvConfig {
    pub fn into_settings(self) -> Settings {
        Settings {
            download_dir: self
                .download_dir
                .unwrap_or_else(|| PathBuf::from(DEFAULT_DOWNLOAD_DIR)),
            host: self.host.unwrap_or_else(|| DEFAULT_HOST.to_string()),
            port: self.port.unwrap_or(DEFAULT_PORT),
            ytdlp_bin: self
                .ytdlp_bin
                .unwrap_or_else(|| PathBuf::from(DEFAULT_YTDLP_BIN)),
            instaloader_bin: self
                .instaloader_bin
                .unwrap_or_else(|| PathBuf::from(DEFAULT_INSTALOADER_BIN)),
            download_timeout: Duration::from_secs(
                self.download_timeout_secs
                    .unwrap_or(DEFAULT_DOWNLOAD_TIMEOUT_SECS),
            ),
            max_concurrent_downloads: self
                .max_concurrent_downloads
                .unwrap_or(DEFAULT_MAX_CONCURRENT_DOWNLOADS)
                .max(1),
            auto_cleanup_hours: self
                .auto_cleanup_hours
                .unwrap_or(DEFAULT_AUTO_CLEANUP_HOURS),
            cleanup_interval_minutes: self
                .cleanup_interval_minutes
                .unwrap_or(DEFAULT_CLEANUP_INTERVAL_MINUTES),
        }
    }
}

fn parse_value<T>(key: &str, value: &str, path: &Path) -> Result<T>
where
    T: std::str::FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    value
        .parse()
        .with_context(|| format!("Parsing {key} from {}", path.display()))
}

pub fn read_env_config(path: &Path) -> Result<Option<EnvConfig>> {
    if !path.exists() {
        return Ok(None);
    }
    let content =
        fs::read_to_string(path).with_context(|| format!("Reading {}", path.display()))?;
    let mut cfg = EnvConfig::default();
    for line in content.lines() {
        let trimmed = line.trim();
        if trimmed.is_empty() || trimmed.starts_with('#') {
            continue;
        }
        if let Some((key, value_raw)) = trimmed.split_once('=') {
            let key = key.trim();
            let value = value_raw.trim().trim_matches('"');
            if value.is_empty() {
                continue;
            }
            match key {
                "DOWNLOAD_DIR" => cfg.download_dir = Some(PathBuf::from(value)),
                "HOST" => cfg.host = Some(value.to_string()),
                "PORT" => cfg.port = Some(parse_value(key, value, path)?),
                "YTDLP_BIN" => cfg.ytdlp_bin = Some(PathBuf::from(value)),
                "INSTALOADER_BIN" => cfg.instaloader_bin = Some(PathBuf::from(value)),
                "DOWNLOAD_TIMEOUT_SECS" => {
                    cfg.download_timeout_secs = Some(parse_value(key, value, path)?)
                }
                "MAX_CONCURRENT_DOWNLOADS" => {
                    cfg.max_concurrent_downloads = Some(parse_value(key, value, path)?)
                }
                "AUTO_CLEANUP_HOURS" => {
                    cfg.auto_cleanup_hours = Some(parse_value(key, value, path)?)
                }
                "CLEANUP_INTERVAL_MINUTES" => {
                    cfg.cleanup_interval_minutes = Some(parse_value(key, value, path)?)
                }
                _ => {}
            }
        }
    }
    Ok(Some(cfg))
}

/// Loads the env file when present and fills in defaults for everything else.
/// A missing file is not an error.
pub fn load_settings_from(path: impl AsRef<Path>) -> Result<Settings> {
    let cfg = read_env_config(path.as_ref())?.unwrap_or_default();
    Ok(cfg.into_settings())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn make_config(contents: &str) -> NamedTempFile {
        let mut file = NamedTempFile::new().unwrap();
        write!(file, "{}", contents).unwrap();
        file
    }

    #[test]
    fn read_env_config_extracts_port() {
        let cfg = make_config("DOWNLOAD_DIR=\"/srv/dl\"\nPORT=\"4242\"\n");
        let parsed = read_env_config(cfg.path()).unwrap().unwrap();
        assert_eq!(parsed.port, Some(4242));
        assert_eq!(parsed.download_dir, Some(PathBuf::from("/srv/dl")));
    }

    #[test]
    fn load_settings_defaults_missing_keys() {
        let cfg = make_config("# comment\n\nHOST=\"127.0.0.1\"\n");
        let settings = load_settings_from(cfg.path()).unwrap();
        assert_eq!(settings.host, "127.0.0.1");
        assert_eq!(settings.port, DEFAULT_PORT);
        assert_eq!(settings.download_dir, PathBuf::from(DEFAULT_DOWNLOAD_DIR));
        assert_eq!(
            settings.download_timeout,
            Duration::from_secs(DEFAULT_DOWNLOAD_TIMEOUT_SECS)
        );
        assert_eq!(settings.ytdlp_bin, PathBuf::from(DEFAULT_YTDLP_BIN));
    }

    #[test]
    fn missing_file_yields_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let settings = load_settings_from(dir.path().join("absent-env")).unwrap();
        assert_eq!(settings.port, DEFAULT_PORT);
        assert_eq!(
            settings.max_concurrent_downloads,
            DEFAULT_MAX_CONCURRENT_DOWNLOADS
        );
    }

    #[test]
    fn invalid_numbers_are_reported() {
        let cfg = make_config("DOWNLOAD_TIMEOUT_SECS=\"soon\"\n");
        let err = read_env_config(cfg.path()).unwrap_err();
        assert!(err.to_string().contains("DOWNLOAD_TIMEOUT_SECS"));
    }

    #[test]
    fn zero_concurrency_is_clamped_and_periodic_cleanup_can_be_disabled() {
        let cfg = make_config("MAX_CONCURRENT_DOWNLOADS=0\nAUTO_CLEANUP_HOURS=0\n");
        let settings = load_settings_from(cfg.path()).unwrap();
        assert_eq!(settings.max_concurrent_downloads, 1);
        assert!(settings.periodic_cleanup().is_none());

        let defaults = Settings::default();
        assert_eq!(
            defaults.periodic_cleanup(),
            Some((24, Duration::from_secs(60 * 60)))
        );
    }

    #[test]
    fn huge_cleanup_interval_saturates() {
        let cfg = make_config(&format!("CLEANUP_INTERVAL_MINUTES=\"{}\"\n", u64::MAX));
        let settings = load_settings_from(cfg.path()).unwrap();
        let (_, interval) = settings.periodic_cleanup().unwrap();
        assert_eq!(interval, Duration::from_secs(u64::MAX));
    }
}
