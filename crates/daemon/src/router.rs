// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Router loop
//!
//! Scans the intake and grouping roots, feeds the completion detector, and
//! routes each completed group: lock it, evaluate the rules, write the task
//! record, and move the directory into the stage the selection demands.
//! A completed series that matches study-scope rules is collected under its
//! study instead of being routed directly (and studies under their patient).

use crate::effects::{
    io_err, release_lock, retry_policy, shared_lock, snapshot_catalog, snapshot_settings,
    CycleError, EffectRunner,
};
use radroute_adapters::bookkeeper::Bookkeeper;
use radroute_core::clock::Clock;
use radroute_core::completion::{
    CompletionDetector, Disposition, GroupKey, GroupOutcome, TriggerConfig,
};
use radroute_core::effect::{JobEvent, JobEventKind};
use radroute_core::lock::{Acquire, FsLockManager, OwnerId};
use radroute_core::settings::{Settings, SettingsWatcher};
use radroute_core::stage::{StageKind, StageStore, FORCE_COMPLETE_MARKER, TAGS_EXTENSION};
use radroute_core::tags::{Scope, TagSnapshot};
use radroute_core::task::{TaskFileEntry, TaskId, TaskInput, TaskRecord};
use radroute_rules::{evaluate, Catalog, CatalogWatcher, EvalContext};
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

const SENDER: &str = "router";

/// The polling loop that turns completed file groups into tasks
pub struct RouterLoop<C: Clock> {
    settings: Arc<Mutex<SettingsWatcher>>,
    catalog: Arc<Mutex<CatalogWatcher>>,
    sink: Arc<Bookkeeper>,
    clock: C,
    owner: OwnerId,
    detector: CompletionDetector,
    /// Sidecar names already counted per group, so a rescan is not an arrival
    seen: HashMap<GroupKey, HashSet<String>>,
    /// Lead tag snapshot per group, for rule evaluation and nesting
    lead: HashMap<GroupKey, TagSnapshot>,
}

impl<C: Clock + 'static> RouterLoop<C> {
    pub fn new(
        settings: Arc<Mutex<SettingsWatcher>>,
        catalog: Arc<Mutex<CatalogWatcher>>,
        sink: Arc<Bookkeeper>,
        clock: C,
    ) -> Self {
        Self {
            settings,
            catalog,
            sink,
            clock,
            owner: OwnerId::new(format!("router/{}", std::process::id())),
            detector: CompletionDetector::new(HashMap::new()),
            seen: HashMap::new(),
            lead: HashMap::new(),
        }
    }

    pub async fn run(mut self, mut shutdown: tokio::sync::watch::Receiver<bool>) {
        loop {
            if *shutdown.borrow() {
                break;
            }
            if let Err(e) = self.cycle().await {
                tracing::error!(error = %e, "router cycle failed");
            }
            let interval = snapshot_settings(&self.settings).router_interval;
            tokio::select! {
                _ = tokio::time::sleep(interval) => {}
                _ = shutdown.changed() => {}
            }
        }
        tracing::info!("router loop stopped");
    }

    /// One scan cycle over intake and the grouping roots
    pub async fn cycle(&mut self) -> Result<(), CycleError> {
        let settings = snapshot_settings(&self.settings);
        let catalog = snapshot_catalog(&self.catalog);
        let store = StageStore::new(&settings.data_dir);
        store.ensure_layout()?;
        self.detector.set_triggers(triggers_from(&settings));

        self.scan_intake(&store);
        self.scan_parents(&store, StageKind::Studies, Scope::Study);
        self.scan_parents(&store, StageKind::Patients, Scope::Patient);
        self.update_pending_children();

        for outcome in self.detector.poll(&self.clock) {
            let lead = self.lead.remove(&outcome.key).unwrap_or_default();
            self.seen.remove(&outcome.key);
            let group = outcome.key.clone();
            let result = if outcome.disposition == Disposition::Discard {
                self.discard_group(&store, outcome).await
            } else {
                self.route_group(&store, &settings, &catalog, outcome, lead)
                    .await
            };
            if let Err(e) = result {
                // The files are untouched; the group re-accumulates and is
                // decided again on a later cycle
                tracing::error!(group = %group, error = %e, "routing failed, group deferred");
            }
        }
        Ok(())
    }

    /// Count new sidecar arrivals per series directory under intake
    fn scan_intake(&mut self, store: &StageStore) {
        let dirs = match store.task_dirs(StageKind::Intake) {
            Ok(dirs) => dirs,
            Err(e) => {
                tracing::warn!(error = %e, "intake scan failed, retrying next cycle");
                return;
            }
        };
        for dir in dirs {
            let Some(uid) = dir_name(&dir) else { continue };
            let key = GroupKey::new(Scope::Series, uid);
            for (name, sidecar) in sidecars_in(&dir) {
                if self.seen.entry(key.clone()).or_default().insert(name) {
                    self.detector.observe_file(key.clone(), &dir, &self.clock);
                    if !self.lead.contains_key(&key) {
                        match TagSnapshot::load(&sidecar) {
                            Ok(tags) => {
                                self.lead.insert(key.clone(), tags);
                            }
                            Err(e) => {
                                tracing::warn!(sidecar = %sidecar.display(), error = %e,
                                    "unreadable tag sidecar");
                            }
                        }
                    }
                }
            }
            if dir.join(FORCE_COMPLETE_MARKER).exists() {
                self.detector.force(&key);
            }
        }
    }

    /// Count completed child groups arriving under a nesting root
    fn scan_parents(&mut self, store: &StageStore, stage: StageKind, scope: Scope) {
        let dirs = match store.task_dirs(stage) {
            Ok(dirs) => dirs,
            Err(e) => {
                tracing::warn!(stage = %stage, error = %e, "group scan failed, retrying next cycle");
                return;
            }
        };
        for dir in dirs {
            let Some(uid) = dir_name(&dir) else { continue };
            let key = GroupKey::new(scope, uid);
            for child in child_dirs(&dir) {
                let Some(child_uid) = dir_name(&child) else { continue };
                if self
                    .seen
                    .entry(key.clone())
                    .or_default()
                    .insert(child_uid.clone())
                {
                    let child_tags = first_sidecar_tags(&child);
                    let description = child_tags.as_ref().and_then(|t| t.series_description());
                    self.detector
                        .observe_child(key.clone(), &dir, &child_uid, description, &self.clock);
                    if let (false, Some(tags)) = (self.lead.contains_key(&key), child_tags) {
                        self.lead.insert(key.clone(), tags);
                    }
                }
            }
            if dir.join(FORCE_COMPLETE_MARKER).exists() {
                self.detector.force(&key);
            }
        }
    }

    /// A parent group waits for every still-pending child group with the
    /// same parent UID; children that completed or vanished stop holding it
    /// back. Recomputed every cycle from current detector state.
    fn update_pending_children(&mut self) {
        for scope in [Scope::Study, Scope::Patient] {
            let Some(child_scope) = scope.child() else { continue };
            for parent_uid in self.detector.pending_uids(scope) {
                let parent_key = GroupKey::new(scope, &parent_uid);
                let children: HashSet<String> = self
                    .detector
                    .pending_uids(child_scope)
                    .into_iter()
                    .filter(|child_uid| {
                        let child_key = GroupKey::new(child_scope, child_uid);
                        self.lead
                            .get(&child_key)
                            .and_then(|tags| tags.uid_for(scope))
                            .as_deref()
                            == Some(parent_uid.as_str())
                    })
                    .collect();
                self.detector.set_pending_children(&parent_key, children);
            }
        }
    }

    /// The hard ceiling fired with `discard` configured: drop the group
    async fn discard_group(
        &self,
        store: &StageStore,
        outcome: GroupOutcome,
    ) -> Result<(), CycleError> {
        store.promote(&outcome.dir, StageKind::Discard)?;
        tracing::warn!(group = %outcome.key, "group discarded by hard-ceiling action");
        self.sink
            .submit(
                &JobEvent::new(
                    JobEventKind::Discard,
                    TaskId::from(outcome.key.uid.as_str()),
                    SENDER,
                    self.clock.wall(),
                )
                .with_info("hard completion ceiling"),
            )
            .await;
        Ok(())
    }

    /// Lock a completed group and either nest it under its parent scope or
    /// turn it into a task
    async fn route_group(
        &mut self,
        store: &StageStore,
        settings: &Settings,
        catalog: &Catalog,
        outcome: GroupOutcome,
        lead: TagSnapshot,
    ) -> Result<(), CycleError> {
        let GroupOutcome { key, mut dir, .. } = outcome;

        let locks = FsLockManager::new(self.owner.clone(), settings.lock_config());
        let acquire = locks.acquire(&dir, &key.uid, &self.clock)?;
        if let Acquire::Reclaimed { previous_owner, .. } = &acquire {
            self.sink
                .submit(
                    &JobEvent::new(
                        JobEventKind::LockReclaimed,
                        TaskId::from(key.uid.as_str()),
                        SENDER,
                        self.clock.wall(),
                    )
                    .with_info(format!("previous owner {}", previous_owner)),
                )
                .await;
        }
        let Some(handle) = acquire.into_handle() else {
            tracing::debug!(group = %key, "group locked by another owner, skipping");
            return Ok(());
        };
        let lock = shared_lock(handle);

        let marker = dir.join(FORCE_COMPLETE_MARKER);
        if marker.exists() {
            let _ = std::fs::remove_file(&marker);
        }

        let entries = collect_entries(&dir)?;
        let ctx = EvalContext {
            tags: &lead,
            file_count: entries.len() as u64,
            received_at: self.clock.wall(),
            offpeak: settings.offpeak.contains(self.clock.wall()),
        };

        // Collection into the parent scope wins over direct routing
        if let Some((parent_scope, parent_stage)) = parent_of(key.scope) {
            let parent_sel = evaluate(catalog, parent_scope, &ctx);
            if !parent_sel.is_empty() {
                if let Some(parent_uid) = lead.uid_for(parent_scope) {
                    let moved = store.promote_into_group(&dir, parent_stage, &parent_uid)?;
                    if let Some(handle) =
                        lock.lock().unwrap_or_else(|e| e.into_inner()).as_mut()
                    {
                        handle.relocate(&moved);
                    }
                    release_lock(&lock)?;

                    let parent_key = GroupKey::new(parent_scope, &parent_uid);
                    let parent_dir = store.root(parent_stage).join(&parent_uid);
                    self.seen
                        .entry(parent_key.clone())
                        .or_default()
                        .insert(key.uid.clone());
                    self.detector.observe_child(
                        parent_key.clone(),
                        &parent_dir,
                        &key.uid,
                        lead.series_description(),
                        &self.clock,
                    );
                    if !parent_sel.required_series.is_empty() {
                        self.detector
                            .set_required_series(&parent_key, parent_sel.required_series);
                    }
                    self.lead.entry(parent_key).or_insert(lead);
                    tracing::info!(group = %key, parent = %parent_uid, scope = %parent_scope,
                        "group collected under parent scope");
                    return Ok(());
                }
                tracing::warn!(group = %key, scope = %parent_scope,
                    "parent-scope rules matched but the parent UID tag is missing, routing directly");
            }
        }

        let selection = evaluate(catalog, key.scope, &ctx);
        let policy = retry_policy(settings);
        let runner = EffectRunner {
            store,
            sink: &self.sink,
        };

        let task = TaskRecord::new(TaskId::generate(), &key.uid, key.scope, entries, &self.clock);
        let (task, fx) = task.transition(TaskInput::GroupComplete, &policy, &self.clock);
        runner.apply(fx, &mut dir, &lock).await?;
        let (task, fx) = task.transition(TaskInput::LockAcquired, &policy, &self.clock);
        runner.apply(fx, &mut dir, &lock).await?;

        let (task, fx) = task.transition(
            TaskInput::RulesEvaluated {
                matched_rules: selection.matched_rules,
                targets: selection.targets,
                modules: selection.modules,
                priority: selection.priority,
            },
            &policy,
            &self.clock,
        );
        task.save(&dir)?;
        runner.apply(fx, &mut dir, &lock).await?;
        release_lock(&lock)?;

        tracing::info!(task_id = %task.id, group = %key, stage = ?task.stage, "group routed");
        Ok(())
    }
}

fn parent_of(scope: Scope) -> Option<(Scope, StageKind)> {
    match scope {
        Scope::Series => Some((Scope::Study, StageKind::Studies)),
        Scope::Study => Some((Scope::Patient, StageKind::Patients)),
        Scope::Patient => None,
    }
}

fn triggers_from(settings: &Settings) -> HashMap<Scope, TriggerConfig> {
    HashMap::from([
        (Scope::Series, settings.series.clone()),
        (Scope::Study, settings.study.clone()),
        (Scope::Patient, settings.patient.clone()),
    ])
}

fn dir_name(dir: &Path) -> Option<String> {
    dir.file_name().map(|n| n.to_string_lossy().to_string())
}

/// Tag sidecars directly inside a directory, as (file name, full path)
fn sidecars_in(dir: &Path) -> Vec<(String, PathBuf)> {
    let Ok(entries) = std::fs::read_dir(dir) else {
        return Vec::new();
    };
    let mut found: Vec<(String, PathBuf)> = entries
        .flatten()
        .map(|entry| entry.path())
        .filter(|path| {
            path.is_file() && path.extension().is_some_and(|ext| ext == TAGS_EXTENSION)
        })
        .filter_map(|path| {
            let name = path.file_name()?.to_string_lossy().to_string();
            Some((name, path))
        })
        .collect();
    found.sort();
    found
}

fn child_dirs(dir: &Path) -> Vec<PathBuf> {
    let Ok(entries) = std::fs::read_dir(dir) else {
        return Vec::new();
    };
    let mut dirs: Vec<PathBuf> = entries
        .flatten()
        .map(|entry| entry.path())
        .filter(|path| path.is_dir())
        .collect();
    dirs.sort();
    dirs
}

/// Lead tags of a child group, searching one level of nesting
fn first_sidecar_tags(dir: &Path) -> Option<TagSnapshot> {
    if let Some((_, sidecar)) = sidecars_in(dir).into_iter().next() {
        return TagSnapshot::load(&sidecar).ok();
    }
    for child in child_dirs(dir) {
        if let Some((_, sidecar)) = sidecars_in(&child).into_iter().next() {
            return TagSnapshot::load(&sidecar).ok();
        }
    }
    None
}

/// Build the task's file set: every payload file with its tag snapshot,
/// paths relative to the task directory
fn collect_entries(dir: &Path) -> Result<Vec<TaskFileEntry>, CycleError> {
    let mut entries = Vec::new();
    let mut stack = vec![dir.to_path_buf()];
    while let Some(current) = stack.pop() {
        let dir_entries = std::fs::read_dir(&current).map_err(|e| io_err(&current, e))?;
        for entry in dir_entries {
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
            if name == radroute_core::stage::TASK_FILE
                || path.extension().is_some_and(|ext| ext == TAGS_EXTENSION)
            {
                continue;
            }
            let tags = TagSnapshot::load(&path.with_extension(TAGS_EXTENSION)).unwrap_or_default();
            let rel = path.strip_prefix(dir).unwrap_or(&path).to_path_buf();
            entries.push(TaskFileEntry { path: rel, tags });
        }
    }
    entries.sort_by(|a, b| a.path.cmp(&b.path));
    Ok(entries)
}

#[cfg(test)]
#[path = "router_tests.rs"]
mod tests;
