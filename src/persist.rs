//! Whole-file JSON tables with atomic replacement.
//!
//! Every durable table is a JSON array rewritten in full on each change:
//! - Writes go to `<file>.tmp` and are renamed over the target
//! - An exclusive `fs2` lock on `<file>.lock` keeps processes from interleaving
//! - A missing file is an empty table; an unreadable one is set aside

use anyhow::{Context, Result};
use fs2::FileExt;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::ffi::OsString;
use std::fs::{self, OpenOptions};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

/// Reads a table, treating a missing or blank file as empty.
pub fn read_table<T: DeserializeOwned>(path: &Path) -> Result<Vec<T>> {
    let content = match fs::read_to_string(path) {
        Ok(content) => content,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => {
            return Err(e).with_context(|| format!("Failed to read table: {}", path.display()))
        }
    };

    if content.trim().is_empty() {
        return Ok(Vec::new());
    }

    serde_json::from_str(&content)
        .with_context(|| format!("Failed to parse table: {}", path.display()))
}

/// Reads a table, starting empty when it is unreadable.
///
/// An unreadable file is moved aside to `<file>.corrupt` so the next write
/// cannot destroy whatever is still recoverable in it.
pub fn load_table_or_empty<T: DeserializeOwned>(path: &Path) -> Vec<T> {
    match read_table(path) {
        Ok(rows) => rows,
        Err(e) => {
            let backup = sibling_with_suffix(path, ".corrupt");
            let moved = fs::rename(path, &backup).is_ok();
            tracing::warn!(
                path = %path.display(),
                backup = %backup.display(),
                moved,
                error = ?e,
                "unreadable table, starting empty"
            );
            Vec::new()
        }
    }
}

/// Replaces a table on disk with `rows`.
pub fn write_table<T: Serialize>(path: &Path, rows: &[T]) -> Result<()> {
    let content = serde_json::to_string_pretty(rows).context("Failed to serialize table")?;
    with_file_lock(path, || write_atomic(path, content.as_bytes()))
}

/// Deletes a table file; a missing file is not an error.
pub fn remove_table(path: &Path) -> Result<()> {
    with_file_lock(path, || match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e).with_context(|| format!("Failed to remove table: {}", path.display())),
    })
}

/// Writes `bytes` to a sibling temp file, then renames it over `path`.
pub fn write_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create directory: {}", parent.display()))?;
    }

    let temp_path = sibling_with_suffix(path, ".tmp");
    fs::write(&temp_path, bytes)
        .with_context(|| format!("Failed to write temp file: {}", temp_path.display()))?;
    fs::rename(&temp_path, path)
        .with_context(|| format!("Failed to rename temp file to: {}", path.display()))?;
    Ok(())
}

/// Returns `path` with `suffix` appended to its file name.
pub fn sibling_with_suffix(path: &Path, suffix: &str) -> PathBuf {
    let mut name = OsString::from(path.as_os_str());
    name.push(suffix);
    PathBuf::from(name)
}

fn with_file_lock<R>(path: &Path, f: impl FnOnce() -> Result<R>) -> Result<R> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create directory: {}", parent.display()))?;
    }

    let lock_path = sibling_with_suffix(path, ".lock");
    let lock_file = OpenOptions::new()
        .create(true)
        .truncate(false)
        .write(true)
        .open(&lock_path)
        .with_context(|| format!("Failed to open lock file: {}", lock_path.display()))?;
    lock_file
        .lock_exclusive()
        .with_context(|| format!("Failed to lock: {}", lock_path.display()))?;

    let result = f();
    let _ = FileExt::unlock(&lock_file);
    result
}

#[cfg(test)]
#[path = "tests/persist_tests.rs"]
mod tests;
