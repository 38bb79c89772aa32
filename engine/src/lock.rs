//! Host-wide run lock
//!
//! At most one pipeline run executes per host. The lock is a small JSON file
//! naming the holder; acquisition fails while the holder is alive and
//! reclaims the file when it is dead. Release happens on every termination
//! path through the RAII guard.

use std::path::{Path, PathBuf};
use std::process::Command;

use serde::{Deserialize, Serialize};

use crate::error::{IngestError, Result};

/// Contents of the lock file
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LockInfo {
    pub pid: u32,
    pub hostname: String,
    /// RFC 3339
    pub started_at: String,
}

/// Held lock; dropping it releases the file.
#[derive(Debug)]
pub struct RunLock {
    path: PathBuf,
    pid: u32,
}

impl RunLock {
    /// Acquire the lock at `path`.
    ///
    /// A live holder yields [`IngestError::AlreadyRunning`]. A dead holder
    /// (stale file) is reclaimed with a warning.
    pub fn acquire(path: &Path) -> Result<Self> {
        if let Some(existing) = read_lock(path) {
            if pid_alive(existing.pid) {
                return Err(IngestError::AlreadyRunning {
                    pid: existing.pid,
                    started_at: existing.started_at,
                });
            }
            log::warn!(
                "reclaiming stale run lock at {} (pid {} is gone)",
                path.display(),
                existing.pid
            );
            let _ = std::fs::remove_file(path);
        }

        let pid = std::process::id();
        let info = LockInfo {
            pid,
            hostname: hostname(),
            started_at: chrono::Utc::now().to_rfc3339(),
        };
        write_lock(path, &info)?;
        Ok(Self { path: path.to_path_buf(), pid })
    }

    /// Explicit release; equivalent to dropping the guard.
    pub fn release(self) {
        drop(self);
    }
}

impl Drop for RunLock {
    fn drop(&mut self) {
        // Only remove a file we still own; a crashed-and-reclaimed lock
        // belongs to someone else by now.
        if read_lock(&self.path).is_some_and(|info| info.pid == self.pid) {
            let _ = std::fs::remove_file(&self.path);
        }
    }
}

/// Probe for the CLI `--status` subcommand: the live holder, if any.
pub fn holder(path: &Path) -> Option<LockInfo> {
    read_lock(path).filter(|info| pid_alive(info.pid))
}

fn read_lock(path: &Path) -> Option<LockInfo> {
    let text = std::fs::read_to_string(path).ok()?;
    serde_json::from_str(&text).ok()
}

fn write_lock(path: &Path, info: &LockInfo) -> Result<()> {
    let text = serde_json::to_string_pretty(info)
        .map_err(|e| IngestError::Fatal(format!("lock serialization: {e}")))?;
    let tmp = path.with_extension("lock.tmp");
    std::fs::write(&tmp, text)
        .and_then(|()| std::fs::rename(&tmp, path))
        .map_err(|e| IngestError::Fatal(format!("cannot write run lock {}: {e}", path.display())))
}

/// `kill -0` probe; signal 0 delivers nothing but checks existence.
pub(crate) fn pid_alive(pid: u32) -> bool {
    Command::new("kill")
        .args(["-0", &pid.to_string()])
        .output()
        .map(|out| out.status.success())
        .unwrap_or(false)
}

fn hostname() -> String {
    std::env::var("HOSTNAME").unwrap_or_else(|_| "unknown".to_owned())
}
