//! The shared download directory.
//!
//! Nothing is indexed in memory: whether a file exists, how large it is and
//! how old it is all come from the filesystem at the moment of the request.

use std::{
    io,
    path::{Path, PathBuf},
};

use anyhow::Context;
use thiserror::Error;
use tokio::fs::File;

use crate::security::join_within;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("invalid file path: {0}")]
    InvalidPath(String),
    #[error("file not found: {0}")]
    NotFound(String),
    #[error("i/o error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// Handle to a file that is ready to be streamed back to a client.
#[derive(Debug)]
pub struct StoredFile {
    pub file: File,
    pub path: PathBuf,
    pub file_name: String,
    pub size: u64,
}

#[derive(Debug, Clone)]
pub struct FileStore {
    root: PathBuf,
}

impl FileStore {
    /// The root is made absolute against the current directory so that paths
    /// reported back by the extractors can be matched against it.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        let root = std::path::absolute(&root).unwrap_or(root);
        Self { root }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Creates the download directory if needed.
    pub fn ensure_root(&self) -> anyhow::Result<()> {
        std::fs::create_dir_all(&self.root)
            .with_context(|| format!("creating {}", self.root.display()))
    }

    /// Maps a client-supplied relative path to an absolute path under the
    /// root, rejecting anything that would leave it.
    pub fn resolve(&self, relative: &str) -> Result<PathBuf, StoreError> {
        join_within(&self.root, relative)
            .ok_or_else(|| StoreError::InvalidPath(relative.to_owned()))
    }

    /// Inverse of [`FileStore::resolve`]: renders `path` relative to the root
    /// with `/` separators. Returns `None` for paths outside the root.
    pub fn relative_path(&self, path: &Path) -> Option<String> {
        let relative = path.strip_prefix(&self.root).ok()?;
        let parts: Vec<String> = relative
            .components()
            .map(|component| component.as_os_str().to_string_lossy().into_owned())
            .collect();
        if parts.is_empty() {
            return None;
        }
        Some(parts.join("/"))
    }

    /// Opens a stored file for serving. Symlinks that resolve outside the root
    /// are treated the same as `..` segments.
    pub async fn open(&self, relative: &str) -> Result<StoredFile, StoreError> {
        let candidate = self.resolve(relative)?;

        let canonical = match tokio::fs::canonicalize(&candidate).await {
            Ok(path) => path,
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                return Err(StoreError::NotFound(relative.to_owned()));
            }
            Err(source) => {
                return Err(StoreError::Io {
                    path: candidate,
                    source,
                });
            }
        };
        let canonical_root =
            tokio::fs::canonicalize(&self.root)
                .await
                .map_err(|source| StoreError::Io {
                    path: self.root.clone(),
                    source,
                })?;
        if !canonical.starts_with(&canonical_root) {
            return Err(StoreError::InvalidPath(relative.to_owned()));
        }

        let metadata = tokio::fs::metadata(&canonical)
            .await
            .map_err(|_| StoreError::NotFound(relative.to_owned()))?;
        if !metadata.is_file() {
            return Err(StoreError::NotFound(relative.to_owned()));
        }

        let file = File::open(&canonical)
            .await
            .map_err(|_| StoreError::NotFound(relative.to_owned()))?;
        let file_name = candidate
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_else(|| "download.bin".to_owned());

        Ok(StoredFile {
            file,
            path: canonical,
            file_name,
            size: metadata.len(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;
    use tokio::io::AsyncReadExt;

    #[tokio::test]
    async fn open_returns_bytes_and_name() {
        let dir = tempdir().unwrap();
        let store = FileStore::new(dir.path());
        std::fs::create_dir_all(dir.path().join("instagram/abc")).unwrap();
        std::fs::write(dir.path().join("instagram/abc/abc.mp4"), b"reel-bytes").unwrap();

        let mut stored = store.open("instagram/abc/abc.mp4").await.unwrap();
        assert_eq!(stored.file_name, "abc.mp4");
        assert_eq!(stored.size, 10);
        let mut contents = Vec::new();
        stored.file.read_to_end(&mut contents).await.unwrap();
        assert_eq!(contents, b"reel-bytes");
    }

    #[tokio::test]
    async fn open_reports_missing_files_and_directories() {
        let dir = tempdir().unwrap();
        let store = FileStore::new(dir.path());
        std::fs::create_dir_all(dir.path().join("instagram")).unwrap();

        assert!(matches!(
            store.open("nope.mp4").await,
            Err(StoreError::NotFound(_))
        ));
        assert!(matches!(
            store.open("instagram").await,
            Err(StoreError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn open_rejects_traversal() {
        let parent = tempdir().unwrap();
        let root = parent.path().join("downloads");
        std::fs::create_dir_all(&root).unwrap();
        std::fs::write(parent.path().join("secret.txt"), b"secret").unwrap();
        let store = FileStore::new(&root);

        assert!(matches!(
            store.open("../secret.txt").await,
            Err(StoreError::InvalidPath(_))
        ));
        assert!(matches!(
            store.open("/etc/passwd").await,
            Err(StoreError::InvalidPath(_))
        ));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn open_rejects_symlinks_leaving_the_root() {
        let parent = tempdir().unwrap();
        let root = parent.path().join("downloads");
        std::fs::create_dir_all(&root).unwrap();
        std::fs::write(parent.path().join("secret.txt"), b"secret").unwrap();
        std::os::unix::fs::symlink(parent.path().join("secret.txt"), root.join("link.txt"))
            .unwrap();
        let store = FileStore::new(&root);

        assert!(matches!(
            store.open("link.txt").await,
            Err(StoreError::InvalidPath(_))
        ));
    }

    #[test]
    fn relative_path_uses_forward_slashes() {
        let store = FileStore::new("/srv/downloads");
        assert_eq!(
            store.relative_path(Path::new("/srv/downloads/instagram/abc/abc.mp4")),
            Some("instagram/abc/abc.mp4".to_owned())
        );
        assert_eq!(store.relative_path(Path::new("/srv/downloads")), None);
        assert_eq!(store.relative_path(Path::new("/tmp/other.mp4")), None);
    }
}
