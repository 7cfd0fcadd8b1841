// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Shared plumbing for the polling loops: effect application, lock sharing,
//! and per-cycle snapshot helpers.

use radroute_adapters::bookkeeper::Bookkeeper;
use radroute_adapters::runner::RunnerError;
use radroute_core::clock::Clock;
use radroute_core::effect::Effect;
use radroute_core::lock::{LockError, LockHandle};
use radroute_core::settings::{Settings, SettingsWatcher};
use radroute_core::stage::{StageError, StageStore};
use radroute_core::task::{RetryPolicy, TaskFileError};
use radroute_rules::{Catalog, CatalogWatcher};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use thiserror::Error;

/// Errors a loop worker can hit while advancing one task
#[derive(Debug, Error)]
pub enum CycleError {
    #[error("io error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error(transparent)]
    Stage(#[from] StageError),
    #[error(transparent)]
    Lock(#[from] LockError),
    #[error(transparent)]
    Task(#[from] TaskFileError),
    #[error(transparent)]
    Runner(#[from] RunnerError),
}

pub(crate) fn io_err(path: &Path, source: std::io::Error) -> CycleError {
    CycleError::Io {
        path: path.to_path_buf(),
        source,
    }
}

/// A lock handle shared between a worker and its heartbeat task
pub(crate) type SharedLock = Arc<Mutex<Option<LockHandle>>>;

pub(crate) fn shared_lock(handle: LockHandle) -> SharedLock {
    Arc::new(Mutex::new(Some(handle)))
}

/// Release if still held; idempotent across the effect path and the worker's
/// own exit path.
pub(crate) fn release_lock(lock: &SharedLock) -> Result<(), LockError> {
    let handle = lock.lock().unwrap_or_else(|e| e.into_inner()).take();
    match handle {
        Some(handle) => handle.release(),
        None => Ok(()),
    }
}

/// Renew the lock heartbeat in the background while a long module run or
/// dispatch attempt is in flight. Stops once the lock is released.
pub(crate) fn spawn_heartbeat<C: Clock + 'static>(
    lock: SharedLock,
    interval: Duration,
    clock: C,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            tokio::time::sleep(interval).await;
            let mut guard = lock.lock().unwrap_or_else(|e| e.into_inner());
            match guard.as_mut() {
                Some(handle) => {
                    if let Err(e) = handle.heartbeat(&clock) {
                        tracing::warn!(error = %e, "lock heartbeat failed");
                    }
                }
                None => break,
            }
        }
    })
}

/// Performs the side effects a task transition requested
pub(crate) struct EffectRunner<'a> {
    pub store: &'a StageStore,
    pub sink: &'a Bookkeeper,
}

impl EffectRunner<'_> {
    /// Apply effects in order. `task_dir` tracks the directory across stage
    /// moves; the shared lock follows the directory and is dropped on a
    /// release effect.
    pub async fn apply(
        &self,
        effects: Vec<Effect>,
        task_dir: &mut PathBuf,
        lock: &SharedLock,
    ) -> Result<(), CycleError> {
        for effect in effects {
            match effect {
                Effect::Emit(event) => self.sink.submit(&event).await,
                Effect::MoveStage { to, .. } => {
                    let moved = self.store.promote(task_dir, to)?;
                    if let Some(handle) = lock
                        .lock()
                        .unwrap_or_else(|e| e.into_inner())
                        .as_mut()
                    {
                        handle.relocate(&moved);
                    }
                    *task_dir = moved;
                }
                Effect::ReleaseLock { .. } => release_lock(lock)?,
                Effect::ScheduleRetry { task_id, delay } => {
                    // The retry instant is persisted in the task record; the
                    // processing loop picks it up when due
                    tracing::debug!(task_id = %task_id, delay = ?delay, "retry scheduled");
                }
            }
        }
        Ok(())
    }
}

pub(crate) fn snapshot_settings(watcher: &Mutex<SettingsWatcher>) -> Arc<Settings> {
    watcher.lock().unwrap_or_else(|e| e.into_inner()).snapshot()
}

pub(crate) fn snapshot_catalog(watcher: &Mutex<CatalogWatcher>) -> Arc<Catalog> {
    watcher.lock().unwrap_or_else(|e| e.into_inner()).snapshot()
}

pub(crate) fn retry_policy(settings: &Settings) -> RetryPolicy {
    RetryPolicy {
        max_retries: settings.retry_max,
        retry_delay: settings.retry_delay,
        offpeak: settings.offpeak,
    }
}

/// Every payload file under a task directory, including files nested in
/// child group directories, excluding markers, sidecars, and the record.
pub(crate) fn payload_files_recursive(dir: &Path) -> Result<Vec<PathBuf>, CycleError> {
    let mut files = Vec::new();
    let mut stack = vec![dir.to_path_buf()];
    while let Some(current) = stack.pop() {
        let entries = std::fs::read_dir(&current).map_err(|e| io_err(&current, e))?;
        for entry in entries {
            let entry = entry.map_err(|e| io_err(&current, e))?;
            let path = entry.path();
            let name = entry.file_name().to_string_lossy().to_string();
            if name.starts_with('.') {
                continue;
            }
            if path.is_dir() {
                stack.push(path);
                continue;
            }
            if name == radroute_core::stage::TASK_FILE {
                continue;
            }
            if path
                .extension()
                .is_some_and(|ext| ext == radroute_core::stage::TAGS_EXTENSION)
            {
                continue;
            }
            files.push(path);
        }
    }
    files.sort();
    Ok(files)
}
