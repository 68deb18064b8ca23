//! On-disk artifact locations and writers.
//!
//! Everything forked persists lives under `<repo>/.forked/`:
//!
//! ```text
//! .forked/
//!   logs/forked-build.log   append-only build/sync events (JSON lines)
//!   logs/forked-guard.log   append-only guard events (JSON lines)
//!   conflicts/<id>-<wave>.json
//!   report.json             latest guard report
//!   worktrees/<id>/         default worktree root
//! ```
//!
//! Whole-file artifacts are written atomically (temp file in the same
//! directory, fsync, rename). Log files are appended one line at a time.

use std::fs::{self, OpenOptions};
use std::io::{self, Write as _};
use std::path::{Path, PathBuf};

use serde::Serialize;

/// Directory name for all forked state, relative to the repository root.
pub const STATE_DIR: &str = ".forked";

/// `<repo>/.forked`
#[must_use]
pub fn state_dir(repo_root: &Path) -> PathBuf {
    repo_root.join(STATE_DIR)
}

/// `<repo>/.forked/logs`
#[must_use]
pub fn logs_dir(repo_root: &Path) -> PathBuf {
    state_dir(repo_root).join("logs")
}

/// `<repo>/.forked/logs/forked-build.log`
#[must_use]
pub fn build_log_path(repo_root: &Path) -> PathBuf {
    logs_dir(repo_root).join("forked-build.log")
}

/// `<repo>/.forked/logs/forked-guard.log`
#[must_use]
pub fn guard_log_path(repo_root: &Path) -> PathBuf {
    logs_dir(repo_root).join("forked-guard.log")
}

/// `<repo>/.forked/conflicts`
#[must_use]
pub fn conflicts_dir(repo_root: &Path) -> PathBuf {
    state_dir(repo_root).join("conflicts")
}

/// `<repo>/.forked/report.json`
#[must_use]
pub fn default_report_path(repo_root: &Path) -> PathBuf {
    state_dir(repo_root).join("report.json")
}

/// Serialize `value` as pretty JSON and write it atomically to `path`,
/// creating parent directories as needed.
///
/// # Errors
/// Returns an I/O error if serialization, the write, the fsync, or the
/// rename fails.
pub fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> io::Result<()> {
    let mut json = serde_json::to_vec_pretty(value)?;
    json.push(b'\n');
    write_bytes_atomic(path, &json)
}

/// Write raw bytes atomically to `path`, creating parent directories.
///
/// # Errors
/// Returns an I/O error if any step fails.
pub fn write_bytes_atomic(path: &Path, bytes: &[u8]) -> io::Result<()> {
    let dir = match path.parent() {
        Some(dir) if !dir.as_os_str().is_empty() => dir.to_path_buf(),
        _ => PathBuf::from("."),
    };
    fs::create_dir_all(&dir)?;

    let mut tmp = tempfile::NamedTempFile::new_in(&dir)?;
    tmp.write_all(bytes)?;
    tmp.as_file().sync_all()?;
    tmp.persist(path).map_err(|e| e.error)?;
    Ok(())
}

/// Append `value` as one JSON line to `path`, creating it if needed.
///
/// # Errors
/// Returns an I/O error if serialization or the write fails.
pub fn append_json_line<T: Serialize>(path: &Path, value: &T) -> io::Result<()> {
    if let Some(dir) = path.parent() {
        fs::create_dir_all(dir)?;
    }
    let mut line = serde_json::to_vec(value)?;
    line.push(b'\n');
    let mut file = OpenOptions::new().create(true).append(true).open(path)?;
    file.write_all(&line)?;
    Ok(())
}
