#![forbid(unsafe_code)]

//! Shared security helpers used by the zero-downloader binaries.

use std::path::{Component, Path, PathBuf};

use anyhow::{Result, bail};
use nix::unistd::Uid;

/// Fails fast when a binary is started as root. The service only ever needs
/// write access to its download directory, so it is expected to run under a
/// dedicated unprivileged account.
pub fn ensure_not_root(process: &str) -> Result<()> {
    if Uid::current().is_root() {
        bail!("{process} must not be run as root; pass --allow-root to override");
    }
    Ok(())
}

/// Joins a client-supplied relative path onto `root` lexically, returning
/// `None` when the path is empty, absolute, or climbs above `root`.
///
/// This does not touch the filesystem; callers that follow symlinks must
/// re-check the canonical path.
pub fn join_within(root: &Path, relative: &str) -> Option<PathBuf> {
    let mut joined = root.to_path_buf();
    let mut depth = 0usize;

    for component in Path::new(relative).components() {
        match component {
            Component::Normal(part) => {
                joined.push(part);
                depth += 1;
            }
            Component::CurDir => {}
            Component::ParentDir => {
                depth = depth.checked_sub(1)?;
                joined.pop();
            }
            Component::RootDir | Component::Prefix(_) => return None,
        }
    }

    (depth > 0).then_some(joined)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn join_within_accepts_nested_paths() {
        let root = Path::new("/srv/downloads");
        assert_eq!(
            join_within(root, "instagram/abc/abc.mp4"),
            Some(PathBuf::from("/srv/downloads/instagram/abc/abc.mp4"))
        );
        assert_eq!(
            join_within(root, "./clip.mp4"),
            Some(PathBuf::from("/srv/downloads/clip.mp4"))
        );
        assert_eq!(
            join_within(root, "a/../clip.mp4"),
            Some(PathBuf::from("/srv/downloads/clip.mp4"))
        );
    }

    #[test]
    fn join_within_rejects_escapes() {
        let root = Path::new("/srv/downloads");
        assert_eq!(join_within(root, "../etc/passwd"), None);
        assert_eq!(join_within(root, "a/../../etc/passwd"), None);
        assert_eq!(join_within(root, "/etc/passwd"), None);
        assert_eq!(join_within(root, ""), None);
        assert_eq!(join_within(root, "."), None);
        assert_eq!(join_within(root, "a/.."), None);
    }
}
