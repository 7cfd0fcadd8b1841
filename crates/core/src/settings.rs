// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Global tunables with hot-reload snapshots
//!
//! Settings are edited externally and re-read once per scan cycle when the
//! file changed. Readers hold an immutable `Arc` snapshot; a broken edit
//! keeps the previous snapshot in place with a loud log instead of taking
//! the pipeline down.

use crate::completion::TriggerConfig;
use crate::lock::LockConfig;
use chrono::{DateTime, Duration as ChronoDuration, NaiveTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use thiserror::Error;

/// Which processing-runner backend executes module steps
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunnerKind {
    #[default]
    Docker,
    Cluster,
}

/// A daily wall-clock window in which offpeak work is allowed to run.
/// The window may wrap midnight (e.g. 22:00 to 06:00). Times are UTC.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct OffpeakWindow {
    pub start: NaiveTime,
    pub end: NaiveTime,
}

impl Default for OffpeakWindow {
    fn default() -> Self {
        Self {
            start: NaiveTime::from_hms_opt(22, 0, 0).unwrap_or(NaiveTime::MIN),
            end: NaiveTime::from_hms_opt(6, 0, 0).unwrap_or(NaiveTime::MIN),
        }
    }
}

impl OffpeakWindow {
    pub fn contains(&self, at: DateTime<Utc>) -> bool {
        let t = at.time();
        if self.start <= self.end {
            t >= self.start && t < self.end
        } else {
            // Wraps midnight
            t >= self.start || t < self.end
        }
    }

    /// The next instant at or after `from` that falls inside the window
    pub fn next_start_after(&self, from: DateTime<Utc>) -> DateTime<Utc> {
        if self.contains(from) {
            return from;
        }
        let today_start = from
            .date_naive()
            .and_time(self.start)
            .and_utc();
        if today_start > from {
            today_start
        } else {
            today_start + ChronoDuration::days(1)
        }
    }
}

/// Worker identity settings for non-root container execution
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RunAs {
    /// uid:gid passed to the container engine for non-root modules
    #[serde(default)]
    pub user: Option<String>,
}

/// All global tunables, loaded from `settings.toml`
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Base directory holding every stage root
    pub data_dir: PathBuf,

    /// Scan interval of the routing loop
    #[serde(with = "humantime_serde")]
    pub router_interval: Duration,
    /// Scan interval of the processing loop
    #[serde(with = "humantime_serde")]
    pub processor_interval: Duration,
    /// Scan interval of the dispatch loop
    #[serde(with = "humantime_serde")]
    pub dispatcher_interval: Duration,

    /// A lock is stale after this many router scan intervals without
    /// heartbeat
    pub lock_stale_multiple: u32,

    /// Delay before a failed task is retried
    #[serde(with = "humantime_serde")]
    pub retry_delay: Duration,
    /// Attempts before a failure becomes terminal
    pub retry_max: u32,

    /// Completion triggers per scope
    pub series: TriggerConfig,
    pub study: TriggerConfig,
    pub patient: TriggerConfig,

    pub offpeak: OffpeakWindow,

    /// Selected processing-runner backend
    pub runner: RunnerKind,
    /// Ceiling on a single module run
    #[serde(with = "humantime_serde")]
    pub module_timeout: Duration,
    pub run_as: RunAs,

    /// Concurrent tasks per loop worker pool
    pub concurrency: usize,

    /// Bookkeeper endpoint; events go to a local journal when unset
    #[serde(default)]
    pub bookkeeper_url: Option<String>,

    /// Consumed by the external retention collaborator, carried here so the
    /// whole deployment shares one document
    #[serde(with = "humantime_serde")]
    pub retention_window: Duration,
    pub emergency_min_free_mb: u64,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("/var/lib/radroute/data"),
            router_interval: Duration::from_millis(500),
            processor_interval: Duration::from_secs(2),
            dispatcher_interval: Duration::from_millis(500),
            lock_stale_multiple: 120,
            retry_delay: Duration::from_secs(60),
            retry_max: 5,
            series: TriggerConfig {
                quiet_period: Duration::from_secs(60),
                max_wait: Duration::from_secs(3600),
                on_ceiling: Default::default(),
            },
            study: TriggerConfig {
                quiet_period: Duration::from_secs(900),
                max_wait: Duration::from_secs(14_400),
                on_ceiling: Default::default(),
            },
            patient: TriggerConfig {
                quiet_period: Duration::from_secs(1800),
                max_wait: Duration::from_secs(86_400),
                on_ceiling: Default::default(),
            },
            offpeak: OffpeakWindow::default(),
            runner: RunnerKind::default(),
            module_timeout: Duration::from_secs(1800),
            run_as: RunAs::default(),
            concurrency: 4,
            bookkeeper_url: None,
            retention_window: Duration::from_secs(3 * 86_400),
            emergency_min_free_mb: 2048,
        }
    }
}

impl Settings {
    pub fn load(path: &Path) -> Result<Self, SettingsError> {
        let text = std::fs::read_to_string(path).map_err(|source| SettingsError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        toml::from_str(&text).map_err(|source| SettingsError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Lock protocol parameters derived from the router scan interval
    pub fn lock_config(&self) -> LockConfig {
        LockConfig::for_scan_interval(self.router_interval, self.lock_stale_multiple)
    }

    pub fn trigger_for(&self, scope: crate::tags::Scope) -> &TriggerConfig {
        match scope {
            crate::tags::Scope::Series => &self.series,
            crate::tags::Scope::Study => &self.study,
            crate::tags::Scope::Patient => &self.patient,
        }
    }
}

/// Errors from loading settings
#[derive(Debug, Error)]
pub enum SettingsError {
    #[error("cannot read settings {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("cannot parse settings {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
}

/// Re-reads the settings file when it changes, never mid-cycle
#[derive(Debug)]
pub struct SettingsWatcher {
    path: PathBuf,
    mtime: Option<SystemTime>,
    current: Arc<Settings>,
}

impl SettingsWatcher {
    /// Load the initial snapshot; the file must parse at startup
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, SettingsError> {
        let path = path.into();
        let settings = Settings::load(&path)?;
        let mtime = std::fs::metadata(&path).and_then(|m| m.modified()).ok();
        Ok(Self {
            path,
            mtime,
            current: Arc::new(settings),
        })
    }

    /// Start from in-memory settings without a backing file (tests)
    pub fn fixed(settings: Settings) -> Self {
        Self {
            path: PathBuf::new(),
            mtime: None,
            current: Arc::new(settings),
        }
    }

    /// The snapshot for this cycle, re-reading the file if it changed.
    /// A broken edit keeps the previous snapshot.
    pub fn snapshot(&mut self) -> Arc<Settings> {
        if self.path.as_os_str().is_empty() {
            return Arc::clone(&self.current);
        }
        let mtime = std::fs::metadata(&self.path)
            .and_then(|m| m.modified())
            .ok();
        if mtime != self.mtime {
            match Settings::load(&self.path) {
                Ok(settings) => {
                    tracing::info!(path = %self.path.display(), "settings reloaded");
                    self.current = Arc::new(settings);
                }
                Err(e) => {
                    tracing::error!(path = %self.path.display(), error = %e,
                        "settings reload failed, keeping previous snapshot");
                }
            }
            self.mtime = mtime;
        }
        Arc::clone(&self.current)
    }
}

#[cfg(test)]
#[path = "settings_tests.rs"]
mod tests;
