//! Crash-safe file persistence
//!
//! Ticket state and config lists are replaced atomically: content goes to a
//! temporary file in the same directory (mode 0o600), is flushed with
//! `sync_all`, and is renamed over the target. A reader therefore sees
//! either the old or the new content, never a partial write.

use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;
use tracing::warn;

/// Creates `dir` (and parents) with mode 0o700 if it does not exist.
pub fn ensure_dir(dir: &Path) -> std::io::Result<()> {
    #[cfg(unix)]
    {
        use std::fs::DirBuilder;
        use std::os::unix::fs::DirBuilderExt;

        DirBuilder::new().mode(0o700).recursive(true).create(dir)
    }

    #[cfg(not(unix))]
    {
        std::fs::create_dir_all(dir)
    }
}

fn temp_path_for(path: &Path) -> PathBuf {
    let mut name = path.file_name().map(std::ffi::OsStr::to_os_string).unwrap_or_default();
    name.push(".tmp");
    path.with_file_name(name)
}

/// Atomically replaces `path` with `contents`.
///
/// On failure the previous content of `path` is left untouched and the
/// temporary file is removed on a best-effort basis.
pub async fn write_atomic(path: &Path, contents: &[u8]) -> std::io::Result<()> {
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        ensure_dir(parent)?;
    }

    let temp_path = temp_path_for(path);

    let result = async {
        let mut options = tokio::fs::OpenOptions::new();
        options.create(true).write(true).truncate(true);
        #[cfg(unix)]
        options.mode(0o600);

        let mut file = options.open(&temp_path).await?;
        file.write_all(contents).await?;
        file.sync_all().await?;
        drop(file);

        tokio::fs::rename(&temp_path, path).await
    }
    .await;

    if let Err(e) = result {
        let _ = tokio::fs::remove_file(&temp_path).await;
        if e.kind() == std::io::ErrorKind::StorageFull {
            return Err(std::io::Error::new(
                std::io::ErrorKind::StorageFull,
                format!("Disk full: cannot write {}", path.display()),
            ));
        }
        return Err(e);
    }

    Ok(())
}

/// Hex SHA-256 of `contents`.
pub fn checksum(contents: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(contents);
    format!("{:x}", hasher.finalize())
}

fn checksum_path_for(path: &Path) -> PathBuf {
    let mut name = path.file_name().map(std::ffi::OsStr::to_os_string).unwrap_or_default();
    name.push(".sha256");
    path.with_file_name(name)
}

/// Writes `contents` atomically, then its checksum sidecar.
///
/// The sidecar is advisory: the data file is the commit point.
pub async fn write_with_checksum(path: &Path, contents: &[u8]) -> std::io::Result<()> {
    write_atomic(path, contents).await?;
    let sum = checksum(contents);
    if let Err(e) = write_atomic(&checksum_path_for(path), sum.as_bytes()).await {
        warn!("Failed to write checksum for {}: {}", path.display(), e);
    }
    Ok(())
}

/// Reads `path`, returning `None` if it does not exist.
///
/// A checksum mismatch is logged but not fatal, since the file may have been
/// edited by hand.
pub async fn read_with_checksum(path: &Path) -> std::io::Result<Option<String>> {
    let contents = match tokio::fs::read_to_string(path).await {
        Ok(c) => c,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e),
    };

    if let Ok(expected) = tokio::fs::read_to_string(checksum_path_for(path)).await {
        let actual = checksum(contents.as_bytes());
        if expected.trim() != actual {
            warn!(
                "{} checksum mismatch (expected: {}, got: {})",
                path.display(),
                expected.trim(),
                actual
            );
        }
    }

    Ok(Some(contents))
}
