// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Processor loop
//!
//! Scans the processing root and drives the module chain of each locked
//! task. Module output lands in the `out/` staging area and only becomes the
//! payload of the next step (or the dispatch stage) through renames after
//! the runner reports success. A background heartbeat keeps the lock fresh
//! while a container runs.

use crate::effects::{
    release_lock, retry_policy, shared_lock, snapshot_catalog, snapshot_settings, spawn_heartbeat,
    CycleError, EffectRunner, SharedLock,
};
use radroute_adapters::bookkeeper::Bookkeeper;
use radroute_adapters::runner::{ProcessRunner, RunRequest, RunnerBackend};
use radroute_core::clock::Clock;
use radroute_core::effect::{JobEvent, JobEventKind};
use radroute_core::lock::{Acquire, FsLockManager, OwnerId};
use radroute_core::settings::Settings;
use radroute_core::settings::SettingsWatcher;
use radroute_core::stage::{StageKind, StageStore, TASK_FILE};
use radroute_core::task::{AttemptDiagnostic, TaskInput, TaskRecord, TaskStage};
use radroute_rules::{Catalog, CatalogWatcher};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tokio::task::JoinSet;

const SENDER: &str = "processor";

/// The polling loop that executes module chains
pub struct ProcessorLoop<C: Clock> {
    settings: Arc<Mutex<SettingsWatcher>>,
    catalog: Arc<Mutex<CatalogWatcher>>,
    sink: Arc<Bookkeeper>,
    runner: Arc<RunnerBackend>,
    clock: C,
    owner: OwnerId,
}

impl<C: Clock + 'static> ProcessorLoop<C> {
    pub fn new(
        settings: Arc<Mutex<SettingsWatcher>>,
        catalog: Arc<Mutex<CatalogWatcher>>,
        sink: Arc<Bookkeeper>,
        runner: Arc<RunnerBackend>,
        clock: C,
    ) -> Self {
        Self {
            settings,
            catalog,
            sink,
            runner,
            clock,
            owner: OwnerId::new(format!("processor/{}", std::process::id())),
        }
    }

    pub async fn run(self, mut shutdown: tokio::sync::watch::Receiver<bool>) {
        loop {
            if *shutdown.borrow() {
                break;
            }
            if let Err(e) = self.cycle().await {
                tracing::error!(error = %e, "processor cycle failed");
            }
            let interval = snapshot_settings(&self.settings).processor_interval;
            tokio::select! {
                _ = tokio::time::sleep(interval) => {}
                _ = shutdown.changed() => {}
            }
        }
        tracing::info!("processor loop stopped");
    }

    /// One scan of the processing root, driving due tasks through a bounded
    /// worker pool. Lock contention inside a worker is an immediate skip.
    pub async fn cycle(&self) -> Result<(), CycleError> {
        let settings = snapshot_settings(&self.settings);
        let catalog = snapshot_catalog(&self.catalog);
        let store = StageStore::new(&settings.data_dir);
        store.ensure_layout()?;

        let mut pool: JoinSet<()> = JoinSet::new();
        let concurrency = settings.concurrency.max(1);
        for dir in store.task_dirs(StageKind::Processing)? {
            while pool.len() >= concurrency {
                let _ = pool.join_next().await;
            }
            let worker = Worker {
                settings: Arc::clone(&settings),
                catalog: Arc::clone(&catalog),
                sink: Arc::clone(&self.sink),
                runner: Arc::clone(&self.runner),
                store: store.clone(),
                locks: FsLockManager::new(self.owner.clone(), settings.lock_config()),
                clock: self.clock.clone(),
            };
            pool.spawn(async move { worker.process_one(dir).await });
        }
        while pool.join_next().await.is_some() {}
        Ok(())
    }
}

struct Worker<C: Clock> {
    settings: Arc<Settings>,
    catalog: Arc<Catalog>,
    sink: Arc<Bookkeeper>,
    runner: Arc<RunnerBackend>,
    store: StageStore,
    locks: FsLockManager,
    clock: C,
}

impl<C: Clock + 'static> Worker<C> {
    async fn process_one(&self, dir: PathBuf) {
        let task = match TaskRecord::load(&dir) {
            Ok(task) => task,
            Err(e) => {
                tracing::error!(dir = %dir.display(), error = %e,
                    "unreadable task record, parked until fixed");
                return;
            }
        };

        let due = match &task.stage {
            TaskStage::RetryableError { retry_at } => *retry_at <= self.clock.wall(),
            TaskStage::Complete | TaskStage::Locked | TaskStage::ModuleExecuting { .. } => true,
            _ => false,
        };
        if !due {
            return;
        }

        let acquire = match self.locks.acquire(&dir, &task.id.0, &self.clock) {
            Ok(acquire) => acquire,
            Err(e) => {
                tracing::warn!(task_id = %task.id, error = %e, "lock attempt failed");
                return;
            }
        };
        if let Acquire::Reclaimed { previous_owner, .. } = &acquire {
            self.sink
                .submit(
                    &JobEvent::new(
                        JobEventKind::LockReclaimed,
                        task.id.clone(),
                        SENDER,
                        self.clock.wall(),
                    )
                    .with_info(format!("previous owner {}", previous_owner)),
                )
                .await;
        }
        let Some(handle) = acquire.into_handle() else {
            return;
        };
        let lock = shared_lock(handle);

        // Re-read under the lock; the first read may have raced a previous
        // holder's final save
        let task = match TaskRecord::load(&dir) {
            Ok(task) => task,
            Err(e) => {
                tracing::error!(dir = %dir.display(), error = %e, "task record vanished under lock");
                let _ = release_lock(&lock);
                return;
            }
        };

        let heartbeat = spawn_heartbeat(
            lock.clone(),
            self.settings.lock_config().heartbeat_interval,
            self.clock.clone(),
        );
        let result = self.drive(task, dir, &lock).await;
        heartbeat.abort();

        if let Err(e) = result {
            tracing::error!(error = %e, "processing worker failed, task deferred");
        }
        if let Err(e) = release_lock(&lock) {
            tracing::warn!(error = %e, "lock release failed");
        }
    }

    /// Advance the task from wherever the last cycle (or a dead owner) left
    /// it, then run module steps until the chain ends or fails
    async fn drive(
        &self,
        mut task: TaskRecord,
        mut dir: PathBuf,
        lock: &SharedLock,
    ) -> Result<(), CycleError> {
        let policy = retry_policy(&self.settings);
        let effects = EffectRunner {
            store: &self.store,
            sink: &self.sink,
        };

        loop {
            let input = match &task.stage {
                TaskStage::RetryableError { .. } => TaskInput::RetryDue,
                TaskStage::Complete => TaskInput::LockAcquired,
                TaskStage::Locked => TaskInput::ResumeProcessing,
                TaskStage::ModuleExecuting { .. } => break,
                _ => return Ok(()),
            };
            let before = task.stage.clone();
            let (next, fx) = task.transition(input, &policy, &self.clock);
            effects.apply(fx, &mut dir, lock).await?;
            task = next;
            task.save(&dir)?;
            if task.stage == TaskStage::Dispatching {
                // Selection carries no modules; hand straight to dispatch
                let moved = self.store.promote(&dir, StageKind::Outgoing)?;
                if let Some(handle) = lock.lock().unwrap_or_else(|e| e.into_inner()).as_mut() {
                    handle.relocate(&moved);
                }
                return Ok(());
            }
            if task.stage == before {
                tracing::error!(task_id = %task.id, stage = ?task.stage,
                    "task record made no progress, parked until fixed");
                return Ok(());
            }
        }

        while let TaskStage::ModuleExecuting { step } = task.stage {
            let Some(module_name) = task.module_at(step).map(str::to_string) else {
                tracing::error!(task_id = %task.id, step,
                    "module chain index out of range, parked until fixed");
                return Ok(());
            };

            let input = match self.catalog.module(&module_name) {
                None => {
                    // Configuration raced ahead of the task; skip the step
                    tracing::warn!(task_id = %task.id, module = %module_name,
                        "module no longer in catalog, skipping step");
                    TaskInput::ModuleSucceeded
                }
                Some(module) => {
                    self.sink
                        .submit(
                            &JobEvent::new(
                                JobEventKind::ModuleBegin,
                                task.id.clone(),
                                SENDER,
                                self.clock.wall(),
                            )
                            .with_target(&module_name),
                        )
                        .await;

                    let request = RunRequest {
                        task_id: task.id.clone(),
                        module_name: module_name.clone(),
                        module: module.clone(),
                        work_dir: dir.clone(),
                        timeout: self.settings.module_timeout,
                    };
                    match self.runner.run(&request).await {
                        Ok((outcome, _outputs)) if outcome.success() => {
                            rotate_staging(&dir)?;
                            TaskInput::ModuleSucceeded
                        }
                        Ok((outcome, _)) => TaskInput::ModuleFailed {
                            diagnostic: AttemptDiagnostic {
                                module: Some(module_name.clone()),
                                target: None,
                                exit_code: outcome.exit_code,
                                stdout: outcome.stdout,
                                stderr: outcome.stderr,
                                timed_out: outcome.timed_out,
                                error: String::new(),
                                at: self.clock.wall(),
                            },
                        },
                        Err(e) => TaskInput::ModuleFailed {
                            diagnostic: AttemptDiagnostic {
                                module: Some(module_name.clone()),
                                target: None,
                                exit_code: None,
                                stdout: String::new(),
                                stderr: String::new(),
                                timed_out: false,
                                error: e.to_string(),
                                at: self.clock.wall(),
                            },
                        },
                    }
                }
            };

            let (next, fx) = task.transition(input, &policy, &self.clock);
            if matches!(
                next.stage,
                TaskStage::RestagedForDispatch | TaskStage::Success
            ) {
                promote_result(&dir)?;
            }
            next.save(&dir)?;
            effects.apply(fx, &mut dir, lock).await?;
            task = next;
        }

        if task.stage == TaskStage::RestagedForDispatch {
            let (next, fx) = task.transition(TaskInput::Restaged, &policy, &self.clock);
            next.save(&dir)?;
            effects.apply(fx, &mut dir, lock).await?;
        }
        Ok(())
    }
}

/// The output of a finished step becomes the input of the next one
fn rotate_staging(dir: &Path) -> Result<(), CycleError> {
    let input = dir.join("in");
    let output = dir.join("out");
    if input.is_dir() {
        std::fs::remove_dir_all(&input).map_err(|e| crate::effects::io_err(&input, e))?;
    }
    std::fs::rename(&output, &input).map_err(|e| crate::effects::io_err(&output, e))?;
    std::fs::create_dir(&output).map_err(|e| crate::effects::io_err(&output, e))?;
    Ok(())
}

/// After the last step, the staged result becomes the task payload
fn promote_result(dir: &Path) -> Result<(), CycleError> {
    let staged = dir.join("in");
    if staged.is_dir() {
        let entries: Vec<_> = std::fs::read_dir(&staged)
            .map_err(|e| crate::effects::io_err(&staged, e))?
            .collect::<Result<_, _>>()
            .map_err(|e| crate::effects::io_err(&staged, e))?;
        for entry in entries {
            let name = entry.file_name();
            if name.to_string_lossy() == TASK_FILE {
                // The live record stays in the task directory root
                continue;
            }
            let dest = dir.join(&name);
            std::fs::rename(entry.path(), &dest)
                .map_err(|e| crate::effects::io_err(&dest, e))?;
        }
        std::fs::remove_dir_all(&staged).map_err(|e| crate::effects::io_err(&staged, e))?;
    }
    let output = dir.join("out");
    if output.is_dir() {
        std::fs::remove_dir_all(&output).map_err(|e| crate::effects::io_err(&output, e))?;
    }
    Ok(())
}

#[cfg(test)]
#[path = "processor_tests.rs"]
mod tests;
