// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Daemon lifecycle: startup, single-instance locking, shutdown.

use fs2::FileExt;
use radroute_core::settings::{SettingsError, SettingsWatcher};
use radroute_core::stage::{StageError, StageStore};
use radroute_rules::{CatalogError, CatalogWatcher};
use std::fs::File;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use thiserror::Error;

/// Daemon configuration paths
#[derive(Debug, Clone)]
pub struct Config {
    /// Directory holding the configuration documents
    pub config_dir: PathBuf,
    /// Global tunables
    pub settings_path: PathBuf,
    /// Rules, targets, and modules
    pub catalog_path: PathBuf,
}

impl Config {
    pub fn for_dir(config_dir: impl Into<PathBuf>) -> Self {
        let config_dir = config_dir.into();
        Self {
            settings_path: config_dir.join("settings.toml"),
            catalog_path: config_dir.join("catalog.toml"),
            config_dir,
        }
    }
}

/// Lifecycle errors
#[derive(Debug, Error)]
pub enum LifecycleError {
    #[error(transparent)]
    Settings(#[from] SettingsError),

    #[error(transparent)]
    Catalog(#[from] CatalogError),

    #[error(transparent)]
    Stage(#[from] StageError),

    #[error("failed to acquire {0}: daemon already running?")]
    LockFailed(PathBuf, #[source] std::io::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// A started daemon holding the single-instance lock
pub struct Daemon {
    pub config: Config,
    pub settings: Arc<Mutex<SettingsWatcher>>,
    pub catalog: Arc<Mutex<CatalogWatcher>>,
    /// Stage base directory from the initial settings snapshot
    pub data_dir: PathBuf,
    // NOTE(lifetime): held to maintain the exclusive file lock; released on drop
    #[allow(dead_code)]
    lock_file: File,
    pid_path: PathBuf,
}

impl Daemon {
    pub fn shutdown(&self) {
        if let Err(e) = std::fs::remove_file(&self.pid_path) {
            tracing::warn!(path = %self.pid_path.display(), error = %e,
                "pid file not removed");
        }
        tracing::info!("daemon shutdown complete");
    }
}

/// Start the daemon: load configuration, take the instance lock, create the
/// stage layout.
pub fn startup(config: &Config) -> Result<Daemon, LifecycleError> {
    let mut settings = SettingsWatcher::open(&config.settings_path)?;
    let snapshot = settings.snapshot();
    let data_dir = snapshot.data_dir.clone();
    std::fs::create_dir_all(&data_dir)?;

    // Instance lock first, before touching any shared state
    let pid_path = data_dir.join("radrouted.pid");
    let lock_file = take_instance_lock(&pid_path)?;

    StageStore::new(&data_dir).ensure_layout()?;
    let catalog = CatalogWatcher::open(&config.catalog_path)?;

    tracing::info!(
        config = %config.config_dir.display(),
        data = %data_dir.display(),
        "daemon started"
    );

    Ok(Daemon {
        config: config.clone(),
        settings: Arc::new(Mutex::new(settings)),
        catalog: Arc::new(Mutex::new(catalog)),
        data_dir,
        lock_file,
        pid_path,
    })
}

fn take_instance_lock(pid_path: &Path) -> Result<File, LifecycleError> {
    let mut lock_file = File::create(pid_path)?;
    lock_file
        .try_lock_exclusive()
        .map_err(|e| LifecycleError::LockFailed(pid_path.to_path_buf(), e))?;
    writeln!(lock_file, "{}", std::process::id())?;
    Ok(lock_file)
}
