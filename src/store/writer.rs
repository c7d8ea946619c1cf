//! Atomic file replacement and numbered backup rotation.
//!
//! Every write lands in a uniquely named `.<file>.<random>.tmp` sibling and
//! is persisted over the target with a single rename, so a reader sees
//! either the previous complete file or the new complete file.

use std::ffi::OsString;
use std::io::Write;
use std::path::{Path, PathBuf};

use serde::de::DeserializeOwned;
use tempfile::Builder;
use tracing::debug;

use crate::{AppError, Result};

const TMP_SUFFIX: &str = ".tmp";

/// Numbered backup `n` (1 is the most recent).
#[must_use]
pub fn backup_path(path: &Path, n: u32) -> PathBuf {
    let mut name: OsString = path.as_os_str().to_owned();
    name.push(format!(".backup.{n}"));
    PathBuf::from(name)
}

/// Glob pattern matching every in-flight temp file under `dir`.
#[must_use]
pub fn tmp_pattern(dir: &Path) -> String {
    let dir = glob::Pattern::escape(&dir.to_string_lossy());
    format!("{dir}/.*{TMP_SUFFIX}")
}

fn tmp_prefix(path: &Path) -> OsString {
    let mut prefix = OsString::from(".");
    if let Some(name) = path.file_name() {
        prefix.push(name);
    }
    prefix.push(".");
    prefix
}

fn persistence_err(action: &str, path: &Path, err: &std::io::Error) -> AppError {
    AppError::Persistence(format!("failed to {action} {}: {err}", path.display()))
}

/// Write `bytes` to `path` through a synced temp file and rename.
///
/// Blocks the calling thread; async callers use [`write_atomic`].
///
/// # Errors
///
/// Returns `AppError::Persistence` if any step fails. The target file is
/// left untouched on failure.
pub fn write_atomic_blocking(path: &Path, bytes: &[u8]) -> Result<()> {
    let parent = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    std::fs::create_dir_all(parent).map_err(|e| persistence_err("create directory", parent, &e))?;

    let mut file = Builder::new()
        .prefix(&tmp_prefix(path))
        .suffix(TMP_SUFFIX)
        .tempfile_in(parent)
        .map_err(|e| persistence_err("create temp file in", parent, &e))?;
    file.write_all(bytes)
        .map_err(|e| persistence_err("write", file.path(), &e))?;
    file.as_file()
        .sync_all()
        .map_err(|e| persistence_err("sync", file.path(), &e))?;
    file.persist(path)
        .map_err(|e| persistence_err("rename into", path, &e.error))?;

    debug!(path = %path.display(), bytes = bytes.len(), "file replaced atomically");
    Ok(())
}

/// Async wrapper running [`write_atomic_blocking`] on the blocking pool.
///
/// # Errors
///
/// Returns `AppError::Persistence` if the write fails or its task panics.
pub async fn write_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
    let target = path.to_path_buf();
    let bytes = bytes.to_vec();
    tokio::task::spawn_blocking(move || write_atomic_blocking(&target, &bytes))
        .await
        .map_err(|err| {
            AppError::Persistence(format!("write task for {} failed: {err}", path.display()))
        })?
}

/// Shift `.backup.1..N-1` up by one and copy the current file into `.backup.1`.
///
/// The current file stays in place so it is never missing while a save is
/// in flight. Does nothing when `path` does not exist yet or `max_backups`
/// is zero.
///
/// # Errors
///
/// Returns `AppError::Persistence` if a rename or copy fails.
pub async fn rotate_backups(path: &Path, max_backups: u32) -> Result<()> {
    if max_backups == 0 || !tokio::fs::try_exists(path).await.unwrap_or(false) {
        return Ok(());
    }

    for n in (1..max_backups).rev() {
        let from = backup_path(path, n);
        if tokio::fs::try_exists(&from).await.unwrap_or(false) {
            let to = backup_path(path, n + 1);
            tokio::fs::rename(&from, &to)
                .await
                .map_err(|e| persistence_err("rotate backup", &from, &e))?;
        }
    }

    let newest = backup_path(path, 1);
    tokio::fs::copy(path, &newest)
        .await
        .map_err(|e| persistence_err("write backup", &newest, &e))?;
    Ok(())
}

/// Read and decode a JSON file. Returns `Ok(None)` when the file is absent.
///
/// # Errors
///
/// Returns `AppError::Persistence` on read failure and
/// `AppError::Serialization` when the content is not valid for `T`.
pub async fn read_json<T: DeserializeOwned>(path: &Path) -> Result<Option<T>> {
    let bytes = match tokio::fs::read(path).await {
        Ok(bytes) => bytes,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(err) => return Err(persistence_err("read", path, &err)),
    };
    serde_json::from_slice(&bytes)
        .map(Some)
        .map_err(|err| AppError::Serialization(format!("{}: {err}", path.display())))
}

/// Remove temp files left in `dir` by interrupted writes.
///
/// Returns how many were removed.
///
/// # Errors
///
/// Returns `AppError::Persistence` if a leftover cannot be removed.
pub async fn discard_stale_tmp(dir: &Path) -> Result<usize> {
    let paths = glob::glob(&tmp_pattern(dir))
        .map_err(|err| AppError::Persistence(format!("invalid temp file pattern: {err}")))?;
    let mut removed = 0;
    for path in paths.filter_map(std::result::Result::ok) {
        match tokio::fs::remove_file(&path).await {
            Ok(()) => removed += 1,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
            Err(err) => return Err(persistence_err("remove", &path, &err)),
        }
    }
    Ok(removed)
}
