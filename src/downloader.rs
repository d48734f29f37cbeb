//! Runs the external extractors and turns their output into a
//! [`DownloadResult`].
//!
//! Every platform except Instagram goes through `yt-dlp`. Instagram video and
//! image posts go through `instaloader`, which writes into its own
//! sub-directory of the store. Audio requests for Instagram fall back to
//! `yt-dlp`, since `instaloader` cannot extract audio.
//!
//! Each external process holds a slot of a shared semaphore for as long as it
//! runs. It is started in its own process group, and the whole group is killed
//! when the run exceeds the configured timeout, when the server shuts down, or
//! when the request future is dropped.
//!
//! Stored files get their mtime reset once a download finishes, so the
//! cleanup sweeper ages them from the fetch rather than the upload date.

use std::{
    fs::File,
    io,
    path::{Path, PathBuf},
    process::{Output, Stdio},
    sync::Arc,
    time::{Duration, SystemTime},
};

use nix::{
    errno::Errno,
    sys::signal::{self, Signal},
    unistd::Pid,
};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::{process::Command, sync::Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use url::Url;
use uuid::Uuid;
use walkdir::WalkDir;

use crate::{
    config::Settings,
    platform::{self, MediaType, Platform, PlatformMatch},
    store::FileStore,
};

const YTDLP_TOOL: &str = "yt-dlp";
const INSTALOADER_TOOL: &str = "instaloader";
/// `yt-dlp` output template, relative to the store root.
const OUTPUT_TEMPLATE: &str = "%(title).80B_%(id)s.%(ext)s";
const AUDIO_FORMAT: &str = "mp3";
const INSTAGRAM_SUBDIR: &str = "instagram";
const STDERR_TAIL_LINES: usize = 20;
const VERSION_CHECK_TIMEOUT: Duration = Duration::from_secs(15);
const VIDEO_EXTENSIONS: &[&str] = &["mp4", "mov", "webm"];
const IMAGE_EXTENSIONS: &[&str] = &["jpg", "jpeg", "png", "webp"];

#[derive(Debug, Error)]
pub enum DownloadError {
    #[error("Unsupported platform for URL: {0}")]
    UnsupportedPlatform(String),
    #[error("Failed to run {tool}: {source}")]
    Spawn {
        tool: &'static str,
        #[source]
        source: io::Error,
    },
    #[error("{tool} failed: {message}")]
    ToolFailed { tool: &'static str, message: String },
    #[error("{tool} did not finish within {}s", timeout.as_secs())]
    TimedOut {
        tool: &'static str,
        timeout: Duration,
    },
    #[error("Download cancelled because the server is shutting down")]
    Cancelled,
    #[error("Could not understand {tool} output: {message}")]
    UnexpectedOutput { tool: &'static str, message: String },
    #[error("Download completed but file not found")]
    FileMissing(PathBuf),
}

/// What the caller asked for: a raw `yt-dlp` format string, or audio only.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FormatSelector {
    Format(String),
    Audio,
}

impl FormatSelector {
    pub const DEFAULT_FORMAT: &'static str = "best";

    /// `mp3`/`audio` select audio extraction; empty input and `video` mean
    /// `best`. Anything else is handed to `yt-dlp -f` untouched.
    pub fn parse(raw: Option<&str>) -> Self {
        let raw = raw.map(str::trim).unwrap_or_default();
        if raw.eq_ignore_ascii_case("mp3") || raw.eq_ignore_ascii_case("audio") {
            return Self::Audio;
        }
        if raw.is_empty() || raw.eq_ignore_ascii_case("video") {
            return Self::Format(Self::DEFAULT_FORMAT.to_owned());
        }
        Self::Format(raw.to_owned())
    }

    pub fn is_audio(&self) -> bool {
        matches!(self, Self::Audio)
    }

    fn ytdlp_args(&self) -> Vec<String> {
        match self {
            Self::Format(format) => vec!["-f".to_owned(), format.clone()],
            Self::Audio => vec![
                "-x".to_owned(),
                "--audio-format".to_owned(),
                AUDIO_FORMAT.to_owned(),
            ],
        }
    }
}

impl Default for FormatSelector {
    fn default() -> Self {
        Self::parse(None)
    }
}

/// Metadata copied from the extractor, plus what we learn from disk.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MediaMetadata {
    pub title: String,
    pub uploader: Option<String>,
    pub duration: Option<f64>,
    pub file_size: u64,
    pub file_name: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DownloadResult {
    pub success: bool,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file_path: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub download_url: Option<String>,
    pub platform: Platform,
    pub media_type: MediaType,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<MediaMetadata>,
}

impl DownloadResult {
    pub fn failure(matched: PlatformMatch, message: impl Into<String>) -> Self {
        Self {
            success: false,
            message: message.into(),
            file_path: None,
            download_url: None,
            platform: matched.platform,
            media_type: matched.media_type,
            metadata: None,
        }
    }
}

/// Builds the public URL under which a stored file is served.
pub fn download_url_for(relative: &str) -> String {
    let encoded: Vec<String> = relative
        .split('/')
        .map(|segment| urlencoding::encode(segment).into_owned())
        .collect();
    format!("/download/{}", encoded.join("/"))
}

#[derive(Debug, Clone)]
pub struct DownloaderConfig {
    pub ytdlp_bin: PathBuf,
    pub instaloader_bin: PathBuf,
    pub timeout: Duration,
    pub max_concurrent: usize,
}

impl From<&Settings> for DownloaderConfig {
    fn from(settings: &Settings) -> Self {
        Self {
            ytdlp_bin: settings.ytdlp_bin.clone(),
            instaloader_bin: settings.instaloader_bin.clone(),
            timeout: settings.download_timeout,
            max_concurrent: settings.max_concurrent_downloads,
        }
    }
}

/// A file the extractor reported, before it has been checked on disk.
#[derive(Debug)]
struct ProducedFile {
    tool: &'static str,
    path: PathBuf,
    title: Option<String>,
    uploader: Option<String>,
    duration: Option<f64>,
}

/// Only the fields of `yt-dlp`'s info JSON that end up in the response.
#[derive(Debug, Deserialize)]
struct YtDlpInfo {
    id: Option<String>,
    title: Option<String>,
    uploader: Option<String>,
    channel: Option<String>,
    duration: Option<f64>,
    filepath: Option<String>,
    #[serde(rename = "_filename")]
    underscore_filename: Option<String>,
    filename: Option<String>,
}

#[derive(Debug, Clone)]
pub struct Downloader {
    store: FileStore,
    config: DownloaderConfig,
    slots: Arc<Semaphore>,
    shutdown: CancellationToken,
}

impl Downloader {
    pub fn new(store: FileStore, config: DownloaderConfig, shutdown: CancellationToken) -> Self {
        let slots = Arc::new(Semaphore::new(config.max_concurrent.max(1)));
        Self {
            store,
            config,
            slots,
            shutdown,
        }
    }

    pub fn store(&self) -> &FileStore {
        &self.store
    }

    /// Identifies the platform and downloads.
    pub async fn download(&self, url: &str, format: &FormatSelector) -> DownloadResult {
        self.download_as(url, platform::identify(url), format).await
    }

    /// Downloads with an already identified platform. Unknown platforms fail
    /// without spawning anything.
    pub async fn download_as(
        &self,
        url: &str,
        matched: PlatformMatch,
        format: &FormatSelector,
    ) -> DownloadResult {
        if !matched.platform.is_supported() {
            debug!("rejecting {url}: no platform matched");
            return DownloadResult::failure(
                matched,
                DownloadError::UnsupportedPlatform(url.to_owned()).to_string(),
            );
        }

        let matched = PlatformMatch {
            media_type: if format.is_audio() {
                MediaType::Audio
            } else {
                matched.media_type
            },
            ..matched
        };

        info!(
            platform = matched.platform.as_str(),
            audio = format.is_audio(),
            "starting download of {url}"
        );

        let produced = if matched.platform == Platform::Instagram && !format.is_audio() {
            self.run_instaloader(url).await
        } else {
            self.run_ytdlp(url, format).await
        };

        match produced.and_then(|file| self.finish(file)) {
            Ok(result) => {
                info!(
                    platform = matched.platform.as_str(),
                    file = result.file_path.as_deref().unwrap_or_default(),
                    "download finished"
                );
                DownloadResult {
                    platform: matched.platform,
                    media_type: matched.media_type,
                    ..result
                }
            }
            Err(err) => {
                warn!(platform = matched.platform.as_str(), "download of {url} failed: {err}");
                DownloadResult::failure(matched, err.to_string())
            }
        }
    }

    /// Checks the produced file on disk and assembles the success result.
    fn finish(&self, produced: ProducedFile) -> Result<DownloadResult, DownloadError> {
        let metadata = match std::fs::metadata(&produced.path) {
            Ok(metadata) if metadata.is_file() => metadata,
            _ => return Err(DownloadError::FileMissing(produced.path)),
        };
        let relative = self
            .store
            .relative_path(&produced.path)
            .ok_or_else(|| DownloadError::UnexpectedOutput {
                tool: produced.tool,
                message: format!(
                    "{} is outside {}",
                    produced.path.display(),
                    self.store.root().display()
                ),
            })?;
        // Extractors stamp files with the upload date.
        if let Err(err) = touch(&produced.path) {
            warn!("could not reset mtime of {}: {err}", produced.path.display());
        }
        let file_name = produced
            .path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_default();
        let title = produced.title.unwrap_or_else(|| {
            produced
                .path
                .file_stem()
                .map(|stem| stem.to_string_lossy().into_owned())
                .unwrap_or_default()
        });

        Ok(DownloadResult {
            success: true,
            message: "Download completed".to_owned(),
            download_url: Some(download_url_for(&relative)),
            file_path: Some(relative),
            platform: Platform::Unknown,
            media_type: MediaType::Unknown,
            metadata: Some(MediaMetadata {
                title,
                uploader: produced.uploader,
                duration: produced.duration,
                file_size: metadata.len(),
                file_name,
            }),
        })
    }

    async fn run_ytdlp(
        &self,
        url: &str,
        format: &FormatSelector,
    ) -> Result<ProducedFile, DownloadError> {
        let template = self.store.root().join(OUTPUT_TEMPLATE);
        let mut command = Command::new(&self.config.ytdlp_bin);
        command
            .arg("--no-playlist")
            .arg("--no-warnings")
            .arg("--no-progress")
            .arg("--no-mtime")
            .arg("--restrict-filenames")
            .arg("--no-simulate")
            .arg("--print")
            .arg("after_move:%()j")
            .arg("-o")
            .arg(&template)
            .args(format.ytdlp_args())
            .arg("--")
            .arg(url);

        let output = self.run_tool(YTDLP_TOOL, command).await?;
        parse_ytdlp_output(&output.stdout)
    }

    async fn run_instaloader(&self, url: &str) -> Result<ProducedFile, DownloadError> {
        let shortcode = instagram_shortcode(url);
        let dir_name = shortcode
            .clone()
            .unwrap_or_else(|| Uuid::new_v4().simple().to_string());
        let target_dir = self.store.root().join(INSTAGRAM_SUBDIR).join(&dir_name);

        let mut command = Command::new(&self.config.instaloader_bin);
        command
            .arg("--quiet")
            .arg("--dirname-pattern")
            .arg(&target_dir)
            .arg("--filename-pattern")
            .arg("{shortcode}")
            .arg("--no-metadata-json")
            .arg("--no-captions")
            .arg("--no-compress-json")
            .arg("--");
        match &shortcode {
            Some(code) => command.arg(format!("-{code}")),
            None => command.arg(url),
        };

        self.run_tool(INSTALOADER_TOOL, command).await?;

        let path = find_instagram_media(&target_dir)
            .ok_or_else(|| DownloadError::FileMissing(target_dir.clone()))?;
        Ok(ProducedFile {
            tool: INSTALOADER_TOOL,
            path,
            title: shortcode,
            uploader: None,
            duration: None,
        })
    }

    /// Runs one external process inside a concurrency slot, bounded by the
    /// timeout and the shutdown token.
    async fn run_tool(
        &self,
        tool: &'static str,
        mut command: Command,
    ) -> Result<Output, DownloadError> {
        let _permit = tokio::select! {
            permit = self.slots.acquire() => permit.map_err(|_| DownloadError::Cancelled)?,
            _ = self.shutdown.cancelled() => return Err(DownloadError::Cancelled),
        };

        command
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .process_group(0);
        let child = command
            .spawn()
            .map_err(|source| DownloadError::Spawn { tool, source })?;
        let group = ProcessGroup::led_by(child.id());

        let output = tokio::select! {
            result = tokio::time::timeout(self.config.timeout, child.wait_with_output()) => {
                match result {
                    Ok(output) => output.map_err(|source| DownloadError::Spawn { tool, source })?,
                    Err(_) => {
                        return Err(DownloadError::TimedOut {
                            tool,
                            timeout: self.config.timeout,
                        });
                    }
                }
            }
            _ = self.shutdown.cancelled() => return Err(DownloadError::Cancelled),
        };
        group.release();

        if !output.status.success() {
            let message = stderr_tail(&output.stderr)
                .unwrap_or_else(|| format!("exited with {}", output.status));
            return Err(DownloadError::ToolFailed { tool, message });
        }

        Ok(output)
    }

    /// Runs `<tool> --version` for both extractors and returns the names of
    /// those that could not be executed.
    pub async fn check_tools(&self) -> Vec<&'static str> {
        let mut missing = Vec::new();
        for (tool, bin) in [
            (YTDLP_TOOL, &self.config.ytdlp_bin),
            (INSTALOADER_TOOL, &self.config.instaloader_bin),
        ] {
            let mut command = Command::new(bin);
            command
                .arg("--version")
                .stdin(Stdio::null())
                .stdout(Stdio::null())
                .stderr(Stdio::null())
                .kill_on_drop(true);
            let available = matches!(
                tokio::time::timeout(VERSION_CHECK_TIMEOUT, command.status()).await,
                Ok(Ok(status)) if status.success()
            );
            if !available {
                missing.push(tool);
            }
        }
        missing
    }
}

/// Kills every process in an extractor's group when dropped, so helpers it
/// started (an `ffmpeg` merge, say) stop with it.
struct ProcessGroup(Option<Pid>);

impl ProcessGroup {
    fn led_by(leader: Option<u32>) -> Self {
        Self(
            leader
                .and_then(|id| i32::try_from(id).ok())
                .map(Pid::from_raw),
        )
    }

    /// The run ended on its own; leave the group alone.
    fn release(mut self) {
        self.0 = None;
    }
}

impl Drop for ProcessGroup {
    fn drop(&mut self) {
        if let Some(pgid) = self.0.take() {
            match signal::killpg(pgid, Signal::SIGKILL) {
                Ok(()) | Err(Errno::ESRCH) => {}
                Err(err) => debug!("killing process group {pgid} failed: {err}"),
            }
        }
    }
}

fn touch(path: &Path) -> io::Result<()> {
    File::options()
        .write(true)
        .open(path)?
        .set_modified(SystemTime::now())
}

/// Reads the info JSON that `--print after_move:%()j` writes as the last line
/// of stdout.
fn parse_ytdlp_output(stdout: &[u8]) -> Result<ProducedFile, DownloadError> {
    let text = String::from_utf8_lossy(stdout);
    let line = text
        .lines()
        .map(str::trim)
        .rev()
        .find(|line| line.starts_with('{'))
        .ok_or_else(|| DownloadError::UnexpectedOutput {
            tool: YTDLP_TOOL,
            message: "no info JSON printed".to_owned(),
        })?;
    let info: YtDlpInfo =
        serde_json::from_str(line).map_err(|err| DownloadError::UnexpectedOutput {
            tool: YTDLP_TOOL,
            message: err.to_string(),
        })?;

    let path = info
        .filepath
        .or(info.underscore_filename)
        .or(info.filename)
        .map(PathBuf::from)
        .ok_or_else(|| DownloadError::UnexpectedOutput {
            tool: YTDLP_TOOL,
            message: "info JSON has no file path".to_owned(),
        })?;

    Ok(ProducedFile {
        tool: YTDLP_TOOL,
        path,
        title: info.title.or(info.id),
        uploader: info.uploader.or(info.channel),
        duration: info.duration,
    })
}

fn stderr_tail(stderr: &[u8]) -> Option<String> {
    let text = String::from_utf8_lossy(stderr);
    let lines: Vec<&str> = text
        .lines()
        .map(str::trim_end)
        .filter(|line| !line.trim().is_empty())
        .collect();
    if lines.is_empty() {
        return None;
    }
    let start = lines.len().saturating_sub(STDERR_TAIL_LINES);
    Some(lines[start..].join("\n"))
}

/// Pulls the post shortcode out of `/p/<code>`, `/reel/<code>`,
/// `/reels/<code>` and `/tv/<code>` URLs.
pub fn instagram_shortcode(url: &str) -> Option<String> {
    let parsed = Url::parse(url.trim()).ok()?;
    let mut segments = parsed.path_segments()?;
    while let Some(segment) = segments.next() {
        if matches!(segment, "p" | "reel" | "reels" | "tv") {
            let code = segments.next()?;
            let valid = !code.is_empty()
                && code
                    .chars()
                    .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
            return valid.then(|| code.to_owned());
        }
    }
    None
}

/// Picks the post's main file: the first video by name, otherwise the first
/// image.
fn find_instagram_media(dir: &Path) -> Option<PathBuf> {
    let mut files: Vec<PathBuf> = WalkDir::new(dir)
        .into_iter()
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.file_type().is_file())
        .map(|entry| entry.into_path())
        .collect();
    files.sort();

    files
        .iter()
        .find(|path| has_extension(path, VIDEO_EXTENSIONS))
        .or_else(|| files.iter().find(|path| has_extension(path, IMAGE_EXTENSIONS)))
        .cloned()
}

fn has_extension(path: &Path, allowed: &[&str]) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| allowed.contains(&ext.to_ascii_lowercase().as_str()))
}
