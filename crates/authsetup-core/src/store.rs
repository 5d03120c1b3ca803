//! Storage-state store: one JSON record per role under the storage directory.
//!
//! # Layout
//!
//! ```text
//! {storageDir}/
//!   admin.json              storage-state record (filePattern = "{role}.json")
//!   .admin.json.1234.0.tmp  in-flight write, renamed over admin.json
//!   .locks/admin.lock       setup lock (see crate::lock)
//!   .failures/admin.json    last failed setup for the role
//! ```
//!
//! Records are written to a temp file in the same directory, synced, then
//! renamed into place, so a reader sees either the previous record or the new
//! one. Readers never lock.
//!
//! A record's creation time is its file mtime. Missing, unreadable, malformed,
//! and expired records all read as absent.

use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, SystemTime};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::browser::BrowserSession;
use crate::config::StorageStateConfig;
use crate::error::{AuthError, AuthPhase, Result, StorageError};
use crate::storage_state::StorageStateRecord;

/// Records older than this are deleted by the sweep regardless of `maxAgeMinutes`.
pub const HARD_MAX_AGE: Duration = Duration::from_secs(24 * 60 * 60);

/// Temp files untouched for this long belong to an interrupted write.
const STALE_TEMP_AGE: Duration = Duration::from_secs(10 * 60);

pub const FAILURE_DIR: &str = ".failures";

const TEMP_SUFFIX: &str = ".tmp";

static TEMP_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Non-empty ASCII letters, digits, `-` and `_`.
#[must_use]
pub fn is_valid_role_name(role: &str) -> bool {
    !role.is_empty()
        && role
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'-' || b == b'_')
}

/// Derived view of a stored record. Never written into the record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StorageStateMetadata {
    pub role: String,
    pub path: PathBuf,
    pub created_at: DateTime<Utc>,
    pub age_seconds: u64,
    pub is_valid: bool,
}

/// Left behind by a failed setup so dependents can skip.
///
/// Holds no credentials and no raw IdP output.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FailureMarker {
    pub role: String,
    pub phase: AuthPhase,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remediation: Option<String>,
    pub attempts: u32,
    pub failed_at: DateTime<Utc>,
}

impl FailureMarker {
    #[must_use]
    pub fn from_error(err: &AuthError) -> Self {
        Self {
            role: err.role.clone(),
            phase: err.phase,
            message: err.message.clone(),
            remediation: err.remediation.clone(),
            attempts: err.attempts,
            failed_at: Utc::now(),
        }
    }
}

/// Filesystem-backed storage-state store.
#[derive(Debug, Clone)]
pub struct StorageStateStore {
    dir: PathBuf,
    file_pattern: String,
    max_age: Duration,
}

impl StorageStateStore {
    #[must_use]
    pub fn new(config: &StorageStateConfig) -> Self {
        Self {
            dir: config.directory.clone(),
            file_pattern: config.file_pattern.clone(),
            max_age: config.max_age(),
        }
    }

    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    #[must_use]
    pub fn max_age(&self) -> Duration {
        self.max_age
    }

    /// Record path for `role`, whether or not it exists.
    pub fn path_for(&self, role: &str) -> Result<PathBuf, StorageError> {
        if !is_valid_role_name(role) {
            return Err(StorageError::InvalidRole(role.to_string()));
        }
        Ok(self.dir.join(self.file_pattern.replace("{role}", role)))
    }

    fn failure_path(&self, role: &str) -> Result<PathBuf, StorageError> {
        if !is_valid_role_name(role) {
            return Err(StorageError::InvalidRole(role.to_string()));
        }
        Ok(self.dir.join(FAILURE_DIR).join(format!("{role}.json")))
    }

    /// Export the session's state and write it atomically.
    pub async fn save(&self, session: &dyn BrowserSession, role: &str) -> Result<PathBuf> {
        let record = session.storage_state().await?;
        Ok(self.save_record(role, &record)?)
    }

    /// Write `record` for `role` atomically, replacing any previous record.
    pub fn save_record(
        &self,
        role: &str,
        record: &StorageStateRecord,
    ) -> Result<PathBuf, StorageError> {
        let path = self.path_for(role)?;
        let json = record.to_json_pretty()?;
        write_atomic(&path, json.as_bytes())?;
        tracing::info!(
            role,
            path = %path.display(),
            cookies = record.cookies.len(),
            origins = record.origins.len(),
            "Saved storage state"
        );
        Ok(path)
    }

    /// Fresh (`age < max_age`) and structurally sound. `max_age` defaults to
    /// `maxAgeMinutes`.
    #[must_use]
    pub fn is_valid(&self, role: &str, max_age: Option<Duration>) -> bool {
        self.is_valid_at(role, max_age.unwrap_or(self.max_age), SystemTime::now())
    }

    /// [`is_valid`](Self::is_valid) against an explicit clock.
    #[must_use]
    pub fn is_valid_at(&self, role: &str, max_age: Duration, now: SystemTime) -> bool {
        let Ok(path) = self.path_for(role) else {
            return false;
        };
        let Some(created) = modified(&path) else {
            return false;
        };
        if age(created, now) >= max_age {
            tracing::debug!(role, "Storage state expired");
            return false;
        }
        match read_record(&path) {
            Some(_) => true,
            None => {
                tracing::warn!(role, path = %path.display(), "Storage state is malformed; treating as absent");
                false
            }
        }
    }

    /// Path to a fresh record, if there is one.
    #[must_use]
    pub fn load(&self, role: &str) -> Option<PathBuf> {
        if self.is_valid(role, None) {
            self.path_for(role).ok()
        } else {
            None
        }
    }

    /// Delete one role's record, or every record when `role` is `None`.
    /// Failure markers go too. Returns the number of records removed.
    pub fn clear(&self, role: Option<&str>) -> Result<usize, StorageError> {
        let roles = match role {
            Some(role) => vec![role.to_string()],
            None => {
                let mut roles = self.stored_roles()?;
                for failed in self.failed_roles()? {
                    if !roles.contains(&failed) {
                        roles.push(failed);
                    }
                }
                roles
            }
        };

        let mut removed = 0;
        for role in &roles {
            if remove_if_exists(&self.path_for(role)?)? {
                removed += 1;
            }
            remove_if_exists(&self.failure_path(role)?)?;
        }
        tracing::info!(removed, scope = role.unwrap_or("all"), "Cleared storage state");
        Ok(removed)
    }

    /// Delete records older than [`HARD_MAX_AGE`], stale failure markers, and
    /// temp files from interrupted writes. Must finish before any login starts.
    pub fn cleanup_expired(&self) -> Result<usize, StorageError> {
        self.cleanup_expired_at(SystemTime::now())
    }

    pub fn cleanup_expired_at(&self, now: SystemTime) -> Result<usize, StorageError> {
        let mut removed = 0;
        for role in self.stored_roles()? {
            let path = self.path_for(&role)?;
            let expired = modified(&path).is_some_and(|created| age(created, now) > HARD_MAX_AGE);
            if expired && remove_if_exists(&path)? {
                tracing::info!(role, "Removed storage state older than 24h");
                removed += 1;
            }
        }

        for role in self.failed_roles()? {
            let path = self.failure_path(&role)?;
            if modified(&path).is_some_and(|at| age(at, now) > HARD_MAX_AGE) {
                remove_if_exists(&path)?;
            }
        }

        for entry in read_dir(&self.dir)? {
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            if name.starts_with('.') && name.ends_with(TEMP_SUFFIX) {
                let path = entry.path();
                if modified(&path).is_some_and(|at| age(at, now) > STALE_TEMP_AGE) {
                    remove_if_exists(&path)?;
                    tracing::debug!(path = %path.display(), "Removed leftover temp file");
                }
            }
        }

        tracing::debug!(removed, dir = %self.dir.display(), "Storage sweep complete");
        Ok(removed)
    }

    /// Metadata for one role's record, if the file exists.
    #[must_use]
    pub fn metadata(&self, role: &str) -> Option<StorageStateMetadata> {
        let path = self.path_for(role).ok()?;
        let created = modified(&path)?;
        let now = SystemTime::now();
        Some(StorageStateMetadata {
            role: role.to_string(),
            created_at: DateTime::<Utc>::from(created),
            age_seconds: age(created, now).as_secs(),
            is_valid: self.is_valid_at(role, self.max_age, now),
            path,
        })
    }

    /// Metadata for every stored record, sorted by role.
    pub fn list(&self) -> Result<Vec<StorageStateMetadata>, StorageError> {
        let mut roles = self.stored_roles()?;
        roles.sort();
        Ok(roles.iter().filter_map(|r| self.metadata(r)).collect())
    }

    /// Remember that `err.role` failed setup.
    pub fn record_failure(&self, err: &AuthError) -> Result<PathBuf, StorageError> {
        let path = self.failure_path(&err.role)?;
        let marker = FailureMarker::from_error(err);
        let json = serde_json::to_string_pretty(&marker)?;
        write_atomic(&path, json.as_bytes())?;
        tracing::debug!(role = %err.role, phase = %err.phase, "Recorded setup failure");
        Ok(path)
    }

    #[must_use]
    pub fn last_failure(&self, role: &str) -> Option<FailureMarker> {
        let path = self.failure_path(role).ok()?;
        let json = fs::read_to_string(path).ok()?;
        serde_json::from_str(&json).ok()
    }

    /// Returns whether a marker was removed.
    pub fn clear_failure(&self, role: &str) -> Result<bool, StorageError> {
        remove_if_exists(&self.failure_path(role)?)
    }

    /// Roles with a record file, derived by matching `filePattern`.
    fn stored_roles(&self) -> Result<Vec<String>, StorageError> {
        let (prefix, suffix) = self
            .file_pattern
            .split_once("{role}")
            .unwrap_or((self.file_pattern.as_str(), ""));
        let mut roles = Vec::new();
        for entry in read_dir(&self.dir)? {
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            let Some(role) = name
                .strip_prefix(prefix)
                .and_then(|rest| rest.strip_suffix(suffix))
            else {
                continue;
            };
            if is_valid_role_name(role) && entry.path().is_file() {
                roles.push(role.to_string());
            }
        }
        Ok(roles)
    }

    fn failed_roles(&self) -> Result<Vec<String>, StorageError> {
        let mut roles = Vec::new();
        for entry in read_dir(&self.dir.join(FAILURE_DIR))? {
            let name = entry.file_name();
            if let Some(role) = name.to_str().and_then(|n| n.strip_suffix(".json")) {
                if is_valid_role_name(role) {
                    roles.push(role.to_string());
                }
            }
        }
        Ok(roles)
    }
}

fn age(created: SystemTime, now: SystemTime) -> Duration {
    // A record from the future counts as brand new.
    now.duration_since(created).unwrap_or(Duration::ZERO)
}

fn modified(path: &Path) -> Option<SystemTime> {
    fs::metadata(path).and_then(|m| m.modified()).ok()
}

fn read_record(path: &Path) -> Option<StorageStateRecord> {
    let json = fs::read_to_string(path).ok()?;
    let record = StorageStateRecord::from_json(&json).ok()?;
    record.validate().ok()?;
    Some(record)
}

/// Entries of `dir`; a missing directory is empty.
fn read_dir(dir: &Path) -> Result<Vec<fs::DirEntry>, StorageError> {
    match fs::read_dir(dir) {
        Ok(entries) => entries
            .collect::<std::io::Result<Vec<_>>>()
            .map_err(|e| StorageError::io(dir, e)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Vec::new()),
        Err(e) => Err(StorageError::io(dir, e)),
    }
}

fn remove_if_exists(path: &Path) -> Result<bool, StorageError> {
    match fs::remove_file(path) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(StorageError::io(path, e)),
    }
}

/// Temp file in the target's directory, fsync, rename over the target.
fn write_atomic(path: &Path, bytes: &[u8]) -> Result<(), StorageError> {
    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    fs::create_dir_all(dir).map_err(|e| StorageError::io(dir, e))?;

    let file_name = path
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("state");
    let tmp = dir.join(format!(
        ".{file_name}.{}.{}{TEMP_SUFFIX}",
        std::process::id(),
        TEMP_COUNTER.fetch_add(1, Ordering::Relaxed)
    ));

    let written = File::create(&tmp)
        .and_then(|mut file| {
            file.write_all(bytes)?;
            file.sync_all()
        })
        .and_then(|()| fs::rename(&tmp, path));

    if let Err(e) = written {
        let _ = fs::remove_file(&tmp);
        return Err(StorageError::io(path, e));
    }
    Ok(())
}
