// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Dispatcher loop
//!
//! Scans the outgoing root and attempts delivery to every due target of
//! each task. Targets are independent: one target's failure burns only that
//! target's attempt counter while the others proceed. Offpeak-priority
//! tasks wait until the wall clock enters the configured window; urgent
//! tasks never wait.

use crate::effects::{
    payload_files_recursive, release_lock, retry_policy, shared_lock, snapshot_catalog,
    snapshot_settings, spawn_heartbeat, CycleError, EffectRunner,
};
use radroute_adapters::bookkeeper::Bookkeeper;
use radroute_adapters::target::{TargetChannel, TargetRegistry};
use radroute_core::clock::Clock;
use radroute_core::effect::{JobEvent, JobEventKind};
use radroute_core::lock::{Acquire, FsLockManager, OwnerId};
use radroute_core::settings::{Settings, SettingsWatcher};
use radroute_core::stage::{StageKind, StageStore};
use radroute_core::task::{Priority, TaskInput, TaskRecord, TaskStage};
use radroute_rules::{Catalog, CatalogWatcher, Direction};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use tokio::task::JoinSet;

const SENDER: &str = "dispatcher";

/// The polling loop that delivers task output to its targets
pub struct DispatcherLoop<C: Clock> {
    settings: Arc<Mutex<SettingsWatcher>>,
    catalog: Arc<Mutex<CatalogWatcher>>,
    sink: Arc<Bookkeeper>,
    registry: Arc<TargetRegistry>,
    clock: C,
    owner: OwnerId,
}

impl<C: Clock + 'static> DispatcherLoop<C> {
    pub fn new(
        settings: Arc<Mutex<SettingsWatcher>>,
        catalog: Arc<Mutex<CatalogWatcher>>,
        sink: Arc<Bookkeeper>,
        registry: Arc<TargetRegistry>,
        clock: C,
    ) -> Self {
        Self {
            settings,
            catalog,
            sink,
            registry,
            clock,
            owner: OwnerId::new(format!("dispatcher/{}", std::process::id())),
        }
    }

    pub async fn run(self, mut shutdown: tokio::sync::watch::Receiver<bool>) {
        loop {
            if *shutdown.borrow() {
                break;
            }
            if let Err(e) = self.cycle().await {
                tracing::error!(error = %e, "dispatcher cycle failed");
            }
            let interval = snapshot_settings(&self.settings).dispatcher_interval;
            tokio::select! {
                _ = tokio::time::sleep(interval) => {}
                _ = shutdown.changed() => {}
            }
        }
        tracing::info!("dispatcher loop stopped");
    }

    /// One scan of the outgoing root through a bounded worker pool
    pub async fn cycle(&self) -> Result<(), CycleError> {
        let settings = snapshot_settings(&self.settings);
        let catalog = snapshot_catalog(&self.catalog);
        let store = StageStore::new(&settings.data_dir);
        store.ensure_layout()?;

        let mut pool: JoinSet<()> = JoinSet::new();
        let concurrency = settings.concurrency.max(1);
        for dir in store.task_dirs(StageKind::Outgoing)? {
            while pool.len() >= concurrency {
                let _ = pool.join_next().await;
            }
            let worker = Worker {
                settings: Arc::clone(&settings),
                catalog: Arc::clone(&catalog),
                sink: Arc::clone(&self.sink),
                registry: Arc::clone(&self.registry),
                store: store.clone(),
                locks: FsLockManager::new(self.owner.clone(), settings.lock_config()),
                clock: self.clock.clone(),
            };
            pool.spawn(async move { worker.dispatch_one(dir).await });
        }
        while pool.join_next().await.is_some() {}
        Ok(())
    }
}

struct Worker<C: Clock> {
    settings: Arc<Settings>,
    catalog: Arc<Catalog>,
    sink: Arc<Bookkeeper>,
    registry: Arc<TargetRegistry>,
    store: StageStore,
    locks: FsLockManager,
    clock: C,
}

impl<C: Clock + 'static> Worker<C> {
    async fn dispatch_one(&self, dir: PathBuf) {
        let task = match TaskRecord::load(&dir) {
            Ok(task) => task,
            Err(e) => {
                tracing::error!(dir = %dir.display(), error = %e,
                    "unreadable task record, parked until fixed");
                return;
            }
        };
        if task.stage != TaskStage::Dispatching {
            return;
        }

        let now = self.clock.wall();
        if task.priority == Priority::Offpeak && !self.settings.offpeak.contains(now) {
            tracing::debug!(task_id = %task.id, "offpeak task deferred until window opens");
            return;
        }

        let due: Vec<String> = task
            .targets
            .iter()
            .filter(|t| {
                !t.delivered
                    && t.attempts < self.settings.retry_max
                    && t.next_attempt_at.is_none_or(|at| at <= now)
            })
            .map(|t| t.name.clone())
            .collect();
        if due.is_empty() {
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
        let result = self.attempt_targets(task, dir, &lock, due).await;
        heartbeat.abort();

        if let Err(e) = result {
            tracing::error!(error = %e, "dispatch worker failed, task deferred");
        }
        if let Err(e) = release_lock(&lock) {
            tracing::warn!(error = %e, "lock release failed");
        }
    }

    async fn attempt_targets(
        &self,
        mut task: TaskRecord,
        mut dir: PathBuf,
        lock: &crate::effects::SharedLock,
        due: Vec<String>,
    ) -> Result<(), CycleError> {
        let policy = retry_policy(&self.settings);
        let effects = EffectRunner {
            store: &self.store,
            sink: &self.sink,
        };
        let files = payload_files_recursive(&dir)?;

        for name in due {
            if task
                .targets
                .iter()
                .any(|t| t.name == name && t.delivered)
            {
                continue;
            }
            let Some(target) = self.catalog.target(&name) else {
                // Configuration raced ahead of the task; skip, not an error
                tracing::warn!(task_id = %task.id, target = %name,
                    "target no longer in catalog, skipping");
                continue;
            };
            if target.direction == Direction::Pull {
                tracing::error!(task_id = %task.id, target = %name,
                    "pull-only target cannot receive a push, check configuration");
                continue;
            }
            let Some(handler) = self.registry.get(&target.protocol) else {
                tracing::error!(task_id = %task.id, target = %name, protocol = %target.protocol,
                    "no handler for target protocol, parked until configuration is fixed");
                continue;
            };

            let input = match handler.push(&files, target).await {
                Ok(()) => {
                    tracing::info!(task_id = %task.id, target = %name, "target delivered");
                    TaskInput::TargetDelivered { name: name.clone() }
                }
                Err(e) => {
                    tracing::warn!(task_id = %task.id, target = %name, error = %e,
                        "target push failed");
                    TaskInput::TargetFailed {
                        name: name.clone(),
                        error: e.to_string(),
                    }
                }
            };

            let (next, fx) = task.transition(input, &policy, &self.clock);
            next.save(&dir)?;
            effects.apply(fx, &mut dir, lock).await?;
            task = next;
            if task.stage.is_terminal() {
                break;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
#[path = "dispatcher_tests.rs"]
mod tests;
