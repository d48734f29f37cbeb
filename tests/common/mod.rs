//! Shared fixtures for the HTTP tests: a temp download directory and stub
//! extractor scripts standing in for `yt-dlp` and `instaloader`.

#![allow(dead_code)]

use std::{
    fs,
    path::{Path, PathBuf},
    time::Duration,
};

#[cfg(unix)]
use std::os::unix::fs::PermissionsExt;

use axum::Router;
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;
use zero_downloader::{
    downloader::{Downloader, DownloaderConfig},
    server::{AppState, router},
    store::FileStore,
};

/// Writes `title_id.<ext>` next to the `-o` template and prints the info JSON
/// the way `--print after_move:%()j` does.
pub const YTDLP_OK: &str = r#"
out=""
prev=""
ext="mp4"
for arg in "$@"; do
    if [[ "$prev" == "-o" ]]; then
        out="$arg"
    fi
    if [[ "$arg" == "-x" ]]; then
        ext="mp3"
    fi
    prev="$arg"
done
dir="$(dirname "$out")"
path="$dir/Stub_Title_stub123.$ext"
printf 'stub media bytes \x00\x01\x02' > "$path"
echo "{\"id\":\"stub123\",\"title\":\"Stub Title\",\"uploader\":\"Stub Channel\",\"duration\":12,\"filepath\":\"$path\"}"
"#;

pub struct TestApp {
    _temp: TempDir,
    pub root: PathBuf,
    pub bin_dir: PathBuf,
    pub app: Router,
}

impl TestApp {
    pub fn new(ytdlp_script: &str) -> Self {
        Self::with_script(|_| ytdlp_script.to_owned())
    }

    /// Both extractors are replaced by a stub that only records that it ran.
    pub fn marking() -> Self {
        Self::with_script(marking_script)
    }

    fn with_script(make_ytdlp: impl FnOnce(&Path) -> String) -> Self {
        let temp = tempfile::tempdir().unwrap();
        let root = temp.path().join("downloads");
        let bin_dir = temp.path().join("bin");
        fs::create_dir_all(&root).unwrap();
        fs::create_dir_all(&bin_dir).unwrap();

        let config = DownloaderConfig {
            ytdlp_bin: install_stub(&bin_dir, "yt-dlp", &make_ytdlp(&bin_dir)),
            instaloader_bin: install_stub(&bin_dir, "instaloader", &marking_script(&bin_dir)),
            timeout: Duration::from_secs(10),
            max_concurrent: 2,
        };
        let downloader = Downloader::new(FileStore::new(&root), config, CancellationToken::new());
        let app = router(AppState::from_downloader(downloader));

        Self {
            _temp: temp,
            root,
            bin_dir,
            app,
        }
    }

    pub fn marker(&self) -> PathBuf {
        self.bin_dir.join("invoked")
    }
}

pub fn marking_script(bin_dir: &Path) -> String {
    format!("touch \"{}\"\nexit 1\n", bin_dir.join("invoked").display())
}

pub fn install_stub(dir: &Path, name: &str, body: &str) -> PathBuf {
    let script_path = dir.join(name);
    fs::write(
        &script_path,
        format!("#!/usr/bin/env bash\nset -euo pipefail\n{body}"),
    )
    .unwrap();
    #[cfg(unix)]
    {
        let mut perms = fs::metadata(&script_path).unwrap().permissions();
        perms.set_mode(0o755);
        fs::set_permissions(&script_path, perms).unwrap();
    }
    script_path
}
