// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Filesystem lock protocol for exclusive task access
//!
//! Each task directory carries at most one `.lock` marker. Creation uses
//! `create_new`, so the filesystem arbitrates between concurrent owners
//! without a lock server. Holders renew a heartbeat timestamp inside the
//! marker; a marker whose heartbeat is older than the stale threshold can be
//! reclaimed by any other owner. A process that dies while holding a lock is
//! therefore covered by the next staleness check, not by its own cleanup.

use crate::clock::Clock;
use crate::stage::{atomic_write_json, LOCK_MARKER};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// Identifies a lock owner (process + worker)
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct OwnerId(pub String);

impl OwnerId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }
}

impl std::fmt::Display for OwnerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Lock protocol configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct LockConfig {
    /// How long before a holder without heartbeat renewal is considered stale
    #[serde(with = "humantime_serde")]
    pub stale_after: Duration,
    /// How often holders should refresh their heartbeat
    #[serde(with = "humantime_serde")]
    pub heartbeat_interval: Duration,
}

impl LockConfig {
    /// Derive the stale threshold from a scan interval, as a multiple of it
    pub fn for_scan_interval(scan_interval: Duration, stale_multiple: u32) -> Self {
        let stale_after = scan_interval.saturating_mul(stale_multiple.max(2));
        Self {
            stale_after,
            heartbeat_interval: stale_after / 4,
        }
    }

    pub fn with_stale_after(mut self, stale_after: Duration) -> Self {
        self.stale_after = stale_after;
        self
    }

    pub fn with_heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = interval;
        self
    }
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            stale_after: Duration::from_secs(60),
            heartbeat_interval: Duration::from_secs(15),
        }
    }
}

/// The serialized content of a `.lock` marker
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct LockRecord {
    pub task_id: String,
    pub owner: String,
    pub acquired_at: DateTime<Utc>,
    pub heartbeat_at: DateTime<Utc>,
}

impl LockRecord {
    /// Age of the last heartbeat relative to the given wall time
    pub fn heartbeat_age(&self, now: DateTime<Utc>) -> Duration {
        (now - self.heartbeat_at).to_std().unwrap_or(Duration::ZERO)
    }

    /// Whether this record may be reclaimed under the given config
    pub fn is_stale(&self, now: DateTime<Utc>, config: &LockConfig) -> bool {
        self.heartbeat_age(now) > config.stale_after
    }
}

/// Errors from lock operations
#[derive(Debug, Error)]
pub enum LockError {
    #[error("io error on lock marker {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("lock marker {path} is not valid json: {source}")]
    Corrupt {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

/// Result of an acquisition attempt
#[derive(Debug)]
pub enum Acquire {
    /// The marker was created fresh
    Acquired(LockHandle),
    /// A stale marker was replaced; the previous owner is reported
    Reclaimed {
        handle: LockHandle,
        previous_owner: String,
    },
    /// A fresh marker belongs to someone else; skip this task this cycle
    Contended { owner: String },
}

impl Acquire {
    /// Extract the handle if the lock was obtained either way
    pub fn into_handle(self) -> Option<LockHandle> {
        match self {
            Acquire::Acquired(handle) => Some(handle),
            Acquire::Reclaimed { handle, .. } => Some(handle),
            Acquire::Contended { .. } => None,
        }
    }
}

/// Acquires and inspects task locks on behalf of one owner
#[derive(Clone, Debug)]
pub struct FsLockManager {
    owner: OwnerId,
    config: LockConfig,
}

impl FsLockManager {
    pub fn new(owner: OwnerId, config: LockConfig) -> Self {
        Self { owner, config }
    }

    pub fn owner(&self) -> &OwnerId {
        &self.owner
    }

    pub fn config(&self) -> &LockConfig {
        &self.config
    }

    /// Attempt to lock a task directory. Never blocks; contention returns
    /// immediately.
    pub fn acquire(
        &self,
        task_dir: &Path,
        task_id: &str,
        clock: &impl Clock,
    ) -> Result<Acquire, LockError> {
        let marker = task_dir.join(LOCK_MARKER);
        let record = self.new_record(task_id, clock);

        match create_marker(&marker, &record) {
            Ok(()) => Ok(Acquire::Acquired(LockHandle::new(marker, record))),
            Err(source) if source.kind() == ErrorKind::AlreadyExists => {
                self.try_reclaim(&marker, record, clock)
            }
            Err(source) => Err(LockError::Io {
                path: marker,
                source,
            }),
        }
    }

    /// A marker exists, decide between contention and stale reclaim
    fn try_reclaim(
        &self,
        marker: &Path,
        record: LockRecord,
        clock: &impl Clock,
    ) -> Result<Acquire, LockError> {
        let existing = match read_marker(marker) {
            Ok(existing) => Some(existing),
            // Marker vanished between create and read: the holder released.
            // Treat as contention and pick it up next cycle.
            Err(LockError::Io { source, .. }) if source.kind() == ErrorKind::NotFound => {
                return Ok(Acquire::Contended {
                    owner: String::new(),
                });
            }
            Err(LockError::Corrupt { path, source }) => {
                tracing::warn!(marker = %path.display(), error = %source,
                    "unreadable lock marker, treating as stale");
                None
            }
            Err(e) => return Err(e),
        };

        if let Some(existing) = &existing {
            if !existing.is_stale(clock.wall(), &self.config) {
                return Ok(Acquire::Contended {
                    owner: existing.owner.clone(),
                });
            }
        }

        let previous_owner = existing.map(|r| r.owner).unwrap_or_default();

        // Remove the stale marker, then race for a fresh one. create_new
        // arbitrates: at most one of the competing reclaimers wins.
        if let Err(source) = std::fs::remove_file(marker) {
            if source.kind() != ErrorKind::NotFound {
                return Err(LockError::Io {
                    path: marker.to_path_buf(),
                    source,
                });
            }
        }

        match create_marker(marker, &record) {
            Ok(()) => {
                tracing::warn!(
                    marker = %marker.display(),
                    previous_owner = %previous_owner,
                    new_owner = %self.owner,
                    "reclaimed stale lock"
                );
                Ok(Acquire::Reclaimed {
                    handle: LockHandle::new(marker.to_path_buf(), record),
                    previous_owner,
                })
            }
            Err(source) if source.kind() == ErrorKind::AlreadyExists => {
                let owner = read_marker(marker).map(|r| r.owner).unwrap_or_default();
                Ok(Acquire::Contended { owner })
            }
            Err(source) => Err(LockError::Io {
                path: marker.to_path_buf(),
                source,
            }),
        }
    }

    /// Whether a fresh marker currently guards the directory
    pub fn is_locked(&self, task_dir: &Path, clock: &impl Clock) -> bool {
        let marker = task_dir.join(LOCK_MARKER);
        match read_marker(&marker) {
            Ok(record) => !record.is_stale(clock.wall(), &self.config),
            Err(_) => false,
        }
    }

    fn new_record(&self, task_id: &str, clock: &impl Clock) -> LockRecord {
        let now = clock.wall();
        LockRecord {
            task_id: task_id.to_string(),
            owner: self.owner.0.clone(),
            acquired_at: now,
            heartbeat_at: now,
        }
    }
}

/// A held lock. Release it on every exit path; the `Drop` backstop covers
/// early returns, and the staleness check covers process death.
#[derive(Debug)]
pub struct LockHandle {
    marker: PathBuf,
    record: LockRecord,
    released: bool,
}

impl LockHandle {
    fn new(marker: PathBuf, record: LockRecord) -> Self {
        Self {
            marker,
            record,
            released: false,
        }
    }

    pub fn task_id(&self) -> &str {
        &self.record.task_id
    }

    pub fn owner(&self) -> &str {
        &self.record.owner
    }

    /// Renew the heartbeat by atomically rewriting the marker
    pub fn heartbeat(&mut self, clock: &impl Clock) -> Result<(), LockError> {
        self.record.heartbeat_at = clock.wall();
        atomic_write_json(&self.marker, &self.record).map_err(|source| LockError::Io {
            path: self.marker.clone(),
            source,
        })
    }

    /// Re-point the handle after its task directory was renamed to a new
    /// stage root. The marker file travels with the directory.
    pub fn relocate(&mut self, new_task_dir: &Path) {
        self.marker = new_task_dir.join(LOCK_MARKER);
    }

    /// Remove the marker. Idempotent; a missing marker is not an error.
    pub fn release(mut self) -> Result<(), LockError> {
        self.released = true;
        match std::fs::remove_file(&self.marker) {
            Ok(()) => Ok(()),
            Err(source) if source.kind() == ErrorKind::NotFound => Ok(()),
            Err(source) => Err(LockError::Io {
                path: self.marker.clone(),
                source,
            }),
        }
    }
}

impl Drop for LockHandle {
    fn drop(&mut self) {
        if !self.released {
            let _ = std::fs::remove_file(&self.marker);
        }
    }
}

fn create_marker(marker: &Path, record: &LockRecord) -> std::io::Result<()> {
    use std::io::Write;
    let mut file = std::fs::OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(marker)?;
    let json = serde_json::to_vec_pretty(record)
        .map_err(|e| std::io::Error::new(ErrorKind::InvalidData, e))?;
    file.write_all(&json)?;
    file.sync_all()
}

fn read_marker(marker: &Path) -> Result<LockRecord, LockError> {
    let text = std::fs::read_to_string(marker).map_err(|source| LockError::Io {
        path: marker.to_path_buf(),
        source,
    })?;
    serde_json::from_str(&text).map_err(|source| LockError::Corrupt {
        path: marker.to_path_buf(),
        source,
    })
}

#[cfg(test)]
#[path = "lock_tests.rs"]
mod tests;
