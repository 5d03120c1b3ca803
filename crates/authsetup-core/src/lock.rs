//! Per-role setup lock.
//!
//! Uses OS-level file locking (via fs2) so only one process logs a given role
//! in at a time. Others wait, then find the fresh record the winner saved. A
//! sidecar metadata file records who holds the lock for diagnostics.
//!
//! Readers of storage-state files never take this lock.

use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use fs2::FileExt;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Lock directory under the storage directory.
pub const LOCK_DIR: &str = ".locks";

/// Default time to wait for another process to finish a role's setup.
pub const DEFAULT_LOCK_TIMEOUT: Duration = Duration::from_secs(120);

const POLL_INTERVAL: Duration = Duration::from_millis(200);

/// Errors that can occur during lock operations.
#[derive(Error, Debug)]
pub enum LockError {
    /// Another holder kept the lock past the wait budget.
    #[error("timed out after {waited_ms}ms waiting for setup lock on role '{role}'{}", holder_suffix(.holder.as_ref()))]
    Timeout {
        role: String,
        waited_ms: u64,
        holder: Option<LockMetadata>,
    },

    /// I/O error during lock operations.
    #[error("lock I/O error: {0}")]
    Io(#[from] io::Error),

    /// Failed to serialize/deserialize metadata.
    #[error("lock metadata error: {0}")]
    Metadata(#[from] serde_json::Error),
}

fn holder_suffix(holder: Option<&LockMetadata>) -> String {
    holder.map_or_else(String::new, |m| {
        format!(" (held by pid {} since {})", m.pid, m.started_at)
    })
}

/// Diagnostic metadata written alongside the lock file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LockMetadata {
    pub pid: u32,
    pub role: String,
    /// RFC 3339 acquisition time.
    pub started_at: String,
    pub version: String,
}

impl LockMetadata {
    fn new(role: &str) -> Self {
        Self {
            pid: std::process::id(),
            role: role.to_string(),
            started_at: chrono::Utc::now().to_rfc3339(),
            version: crate::VERSION.to_string(),
        }
    }
}

/// Path of the lock file for `role`.
#[must_use]
pub fn lock_path(storage_dir: &Path, role: &str) -> PathBuf {
    storage_dir.join(LOCK_DIR).join(format!("{role}.lock"))
}

/// An acquired per-role setup lock. Released when dropped.
#[derive(Debug)]
pub struct SetupLock {
    _lock_file: File,
    lock_path: PathBuf,
    meta_path: PathBuf,
}

impl SetupLock {
    /// Try once, without waiting. `Ok(None)` if someone else holds it.
    pub fn try_acquire(storage_dir: &Path, role: &str) -> Result<Option<Self>, LockError> {
        let lock_path = lock_path(storage_dir, role);
        if let Some(parent) = lock_path.parent() {
            fs::create_dir_all(parent)?;
        }

        let lock_file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&lock_path)?;

        match lock_file.try_lock_exclusive() {
            Ok(()) => {
                let lock = Self {
                    _lock_file: lock_file,
                    meta_path: metadata_path(&lock_path),
                    lock_path,
                };
                lock.write_metadata(role)?;
                tracing::debug!(role, lock_path = %lock.lock_path.display(), "Acquired setup lock");
                Ok(Some(lock))
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(None),
            // fs2 reports contention as its own error kind on some platforms.
            Err(e) if e.raw_os_error() == fs2::lock_contended_error().raw_os_error() => Ok(None),
            Err(e) => Err(LockError::Io(e)),
        }
    }

    /// Wait up to `timeout` for the lock, polling.
    pub async fn acquire(
        storage_dir: &Path,
        role: &str,
        timeout: Duration,
    ) -> Result<Self, LockError> {
        let started = Instant::now();
        let mut logged_wait = false;
        loop {
            if let Some(lock) = Self::try_acquire(storage_dir, role)? {
                if logged_wait {
                    tracing::info!(
                        role,
                        waited_ms = started.elapsed().as_millis() as u64,
                        "Setup lock released by other holder"
                    );
                }
                return Ok(lock);
            }
            if !logged_wait {
                tracing::info!(
                    role,
                    holder_pid = holder(storage_dir, role).map(|m| m.pid),
                    "Waiting for another process to finish setup"
                );
                logged_wait = true;
            }
            let elapsed = started.elapsed();
            if elapsed >= timeout {
                return Err(LockError::Timeout {
                    role: role.to_string(),
                    waited_ms: elapsed.as_millis() as u64,
                    holder: holder(storage_dir, role),
                });
            }
            tokio::time::sleep(POLL_INTERVAL.min(timeout - elapsed)).await;
        }
    }

    fn write_metadata(&self, role: &str) -> Result<(), LockError> {
        let metadata = LockMetadata::new(role);
        let json = serde_json::to_string_pretty(&metadata)?;

        let mut file = File::create(&self.meta_path)?;
        file.write_all(json.as_bytes())?;
        file.sync_all()?;
        Ok(())
    }

    #[must_use]
    pub fn lock_path(&self) -> &Path {
        &self.lock_path
    }

    #[must_use]
    pub fn meta_path(&self) -> &Path {
        &self.meta_path
    }
}

impl Drop for SetupLock {
    fn drop(&mut self) {
        if let Err(e) = fs::remove_file(&self.meta_path) {
            if e.kind() != io::ErrorKind::NotFound {
                tracing::warn!(
                    meta_path = %self.meta_path.display(),
                    error = %e,
                    "Failed to remove lock metadata"
                );
            }
        }
        tracing::debug!(lock_path = %self.lock_path.display(), "Released setup lock");
        // The flock itself goes away with _lock_file.
    }
}

fn metadata_path(lock_path: &Path) -> PathBuf {
    let mut meta_path = lock_path.to_path_buf();
    let file_name = lock_path
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("lock");
    meta_path.set_file_name(format!("{file_name}.meta.json"));
    meta_path
}

/// Who holds the lock for `role`, if anyone.
#[must_use]
pub fn holder(storage_dir: &Path, role: &str) -> Option<LockMetadata> {
    let lock_path = lock_path(storage_dir, role);
    let lock_file = OpenOptions::new().read(true).write(true).open(&lock_path).ok()?;

    match lock_file.try_lock_exclusive() {
        Ok(()) => None,
        Err(_) => fs::read_to_string(metadata_path(&lock_path))
            .ok()
            .and_then(|s| serde_json::from_str(&s).ok()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn acquire_and_release_lock() {
        let tmp = TempDir::new().unwrap();

        let lock = SetupLock::try_acquire(tmp.path(), "admin").unwrap().unwrap();
        assert!(lock.lock_path().exists());
        assert!(lock.lock_path().starts_with(tmp.path().join(LOCK_DIR)));
        let meta_path = lock.meta_path().to_path_buf();
        assert!(meta_path.exists());

        drop(lock);
        assert!(!meta_path.exists());
        assert!(SetupLock::try_acquire(tmp.path(), "admin").unwrap().is_some());
    }

    #[test]
    fn same_role_is_exclusive_other_roles_are_not() {
        let tmp = TempDir::new().unwrap();

        let _admin = SetupLock::try_acquire(tmp.path(), "admin").unwrap().unwrap();
        assert!(SetupLock::try_acquire(tmp.path(), "admin").unwrap().is_none());
        assert!(SetupLock::try_acquire(tmp.path(), "viewer").unwrap().is_some());
    }

    #[test]
    fn holder_reports_metadata() {
        let tmp = TempDir::new().unwrap();
        assert!(holder(tmp.path(), "admin").is_none());

        let _lock = SetupLock::try_acquire(tmp.path(), "admin").unwrap().unwrap();
        let meta = holder(tmp.path(), "admin").unwrap();
        assert_eq!(meta.pid, std::process::id());
        assert_eq!(meta.role, "admin");
        assert!(!meta.version.is_empty());
    }

    #[tokio::test]
    async fn acquire_times_out_while_held() {
        let tmp = TempDir::new().unwrap();
        let _held = SetupLock::try_acquire(tmp.path(), "admin").unwrap().unwrap();

        let err = SetupLock::acquire(tmp.path(), "admin", Duration::from_millis(300))
            .await
            .unwrap_err();
        match err {
            LockError::Timeout { role, holder, .. } => {
                assert_eq!(role, "admin");
                assert_eq!(holder.unwrap().pid, std::process::id());
            }
            other => panic!("expected timeout, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn acquire_waits_for_release() {
        let tmp = TempDir::new().unwrap();
        let held = SetupLock::try_acquire(tmp.path(), "admin").unwrap().unwrap();

        let dir = tmp.path().to_path_buf();
        let waiter = tokio::spawn(async move {
            SetupLock::acquire(&dir, "admin", Duration::from_secs(10)).await
        });
        tokio::time::sleep(Duration::from_millis(300)).await;
        drop(held);

        let lock = waiter.await.unwrap().unwrap();
        assert!(lock.meta_path().exists());
    }
}
