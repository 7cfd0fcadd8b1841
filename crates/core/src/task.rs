// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Task record and state machine
//!
//! A task is one completed file group moving through the pipeline. Its
//! record is persisted as `task.json` inside the task directory, so any
//! process holding the lock can pick it up where the previous one left off.
//! Transitions are pure: they return the new record plus the effects the
//! calling loop must perform (stage moves, job events, retry scheduling).

use crate::clock::Clock;
use crate::effect::{Effect, JobEvent, JobEventKind};
use crate::settings::OffpeakWindow;
use crate::stage::{atomic_write_json, StageKind, TASK_FILE};
use crate::tags::{Scope, TagSnapshot};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// Unique identifier for a task
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TaskId(pub String);

impl TaskId {
    /// Generate a fresh id for a newly registered task
    pub fn generate() -> Self {
        TaskId(uuid::Uuid::new_v4().to_string())
    }
}

impl std::fmt::Display for TaskId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for TaskId {
    fn from(s: String) -> Self {
        TaskId(s)
    }
}

impl From<&str> for TaskId {
    fn from(s: &str) -> Self {
        TaskId(s.to_string())
    }
}

/// Dispatch urgency selected by the matching rules
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    /// Dispatched only inside the offpeak window
    Offpeak,
    #[default]
    Normal,
    /// Ignores the offpeak window entirely
    Urgent,
}

/// One received file with its immutable tag snapshot
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskFileEntry {
    /// Path relative to the task directory
    pub path: PathBuf,
    pub tags: TagSnapshot,
}

/// Per-target dispatch bookkeeping, tracked independently per target
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TargetState {
    pub name: String,
    pub attempts: u32,
    pub delivered: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_attempt_at: Option<DateTime<Utc>>,
}

impl TargetState {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            attempts: 0,
            delivered: false,
            last_error: None,
            next_attempt_at: None,
        }
    }
}

/// Diagnostics captured for one failed attempt (module run or target push)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AttemptDiagnostic {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub module: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
    #[serde(default)]
    pub stdout: String,
    #[serde(default)]
    pub stderr: String,
    #[serde(default)]
    pub timed_out: bool,
    #[serde(default)]
    pub error: String,
    pub at: DateTime<Utc>,
}

/// Where a task is in the pipeline
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TaskStage {
    /// Group still receiving files (tracked by the completion detector)
    Accumulating,
    /// Group complete, waiting for a worker to pick it up
    Complete,
    /// Held by a lock owner, rules not yet applied
    Locked,
    /// Running module step `step` of the chain
    ModuleExecuting { step: usize },
    /// Module output promoted, waiting for the move to outgoing
    RestagedForDispatch,
    /// Delivering to targets
    Dispatching,
    /// Terminal: all targets delivered (or nothing to deliver)
    Success,
    /// Waiting out the retry delay before re-entering Complete
    RetryableError { retry_at: DateTime<Utc> },
    /// Terminal: retries exhausted or configuration broken
    TerminalError,
    /// Terminal: no rule matched
    Discard,
}

impl TaskStage {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskStage::Success | TaskStage::TerminalError | TaskStage::Discard
        )
    }
}

/// Retry behavior, taken from the settings snapshot of the current cycle
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub retry_delay: Duration,
    pub offpeak: OffpeakWindow,
}

impl RetryPolicy {
    /// When a failed task should be attempted again. Offpeak tasks are
    /// deferred into the window.
    fn retry_at(&self, priority: Priority, now: DateTime<Utc>) -> DateTime<Utc> {
        let at = now + ChronoDuration::from_std(self.retry_delay).unwrap_or_default();
        if priority == Priority::Offpeak {
            self.offpeak.next_start_after(at)
        } else {
            at
        }
    }
}

/// Inputs that drive task transitions
#[derive(Debug, Clone)]
pub enum TaskInput {
    /// The completion detector decided the group is done
    GroupComplete,
    /// A worker obtained the task lock
    LockAcquired,
    /// Lock contention: expected, leaves the task untouched
    LockDenied,
    /// Rule evaluation finished
    RulesEvaluated {
        matched_rules: Vec<String>,
        targets: Vec<String>,
        modules: Vec<String>,
        priority: Priority,
    },
    /// Re-enter execution after a retry; the stored selection stands
    ResumeProcessing,
    /// The current module step exited successfully
    ModuleSucceeded,
    /// The current module step failed or timed out
    ModuleFailed { diagnostic: AttemptDiagnostic },
    /// Output promotion into the dispatch stage finished
    Restaged,
    /// The retry delay elapsed
    RetryDue,
    /// One target received the files
    TargetDelivered { name: String },
    /// Delivery to one target failed
    TargetFailed { name: String, error: String },
}

/// The persisted task record
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskRecord {
    pub id: TaskId,
    /// UID of the group this task was built from
    pub uid: String,
    pub scope: Scope,
    pub stage: TaskStage,
    pub priority: Priority,
    pub files: Vec<TaskFileEntry>,
    pub created_at: DateTime<Utc>,
    pub last_seen_at: DateTime<Utc>,
    pub retry_count: u32,
    #[serde(default)]
    pub matched_rules: Vec<String>,
    #[serde(default)]
    pub modules: Vec<String>,
    #[serde(default)]
    pub targets: Vec<TargetState>,
    #[serde(default)]
    pub diagnostics: Vec<AttemptDiagnostic>,
}

impl TaskRecord {
    pub fn new(
        id: TaskId,
        uid: impl Into<String>,
        scope: Scope,
        files: Vec<TaskFileEntry>,
        clock: &impl Clock,
    ) -> Self {
        let now = clock.wall();
        Self {
            id,
            uid: uid.into(),
            scope,
            stage: TaskStage::Accumulating,
            priority: Priority::Normal,
            files,
            created_at: now,
            last_seen_at: now,
            retry_count: 0,
            matched_rules: Vec::new(),
            modules: Vec::new(),
            targets: Vec::new(),
            diagnostics: Vec::new(),
        }
    }

    /// The module name for a step index, if the chain has one
    pub fn module_at(&self, step: usize) -> Option<&str> {
        self.modules.get(step).map(String::as_str)
    }

    pub fn all_targets_delivered(&self) -> bool {
        !self.targets.is_empty() && self.targets.iter().all(|t| t.delivered)
    }

    /// Pure transition function: new record plus effects for the caller
    pub fn transition(
        &self,
        input: TaskInput,
        policy: &RetryPolicy,
        clock: &impl Clock,
    ) -> (TaskRecord, Vec<Effect>) {
        let now = clock.wall();
        let mut task = self.clone();
        let mut effects = Vec::new();

        match (&self.stage, input) {
            (TaskStage::Accumulating, TaskInput::GroupComplete) => {
                task.stage = TaskStage::Complete;
                effects.push(Effect::Emit(self.event(JobEventKind::Complete, now)));
            }

            (TaskStage::Complete, TaskInput::LockAcquired) => {
                task.stage = TaskStage::Locked;
            }

            // Contention is not an error; the task is untouched and the
            // next cycle tries again.
            (_, TaskInput::LockDenied) => {}

            (
                TaskStage::Locked,
                TaskInput::RulesEvaluated {
                    matched_rules,
                    targets,
                    modules,
                    priority,
                },
            ) => {
                task.matched_rules = matched_rules;
                task.priority = priority;
                task.modules = modules;
                task.targets = targets.into_iter().map(TargetState::new).collect();

                if task.matched_rules.is_empty()
                    || (task.modules.is_empty() && task.targets.is_empty())
                {
                    task.stage = TaskStage::Discard;
                    effects.push(Effect::Emit(self.event(JobEventKind::Discard, now)));
                    effects.push(Effect::MoveStage {
                        task_id: self.id.clone(),
                        to: StageKind::Discard,
                    });
                    effects.push(Effect::ReleaseLock {
                        task_id: self.id.clone(),
                    });
                } else {
                    effects.push(Effect::Emit(
                        self.event(JobEventKind::Registered, now)
                            .with_info(task.matched_rules.join(", ")),
                    ));
                    if task.modules.is_empty() {
                        task.stage = TaskStage::Dispatching;
                        effects.push(Effect::Emit(self.event(JobEventKind::DispatchBegin, now)));
                        effects.push(Effect::MoveStage {
                            task_id: self.id.clone(),
                            to: StageKind::Outgoing,
                        });
                    } else {
                        task.stage = TaskStage::ModuleExecuting { step: 0 };
                        effects.push(Effect::MoveStage {
                            task_id: self.id.clone(),
                            to: StageKind::Processing,
                        });
                    }
                }
            }

            (TaskStage::Locked, TaskInput::ResumeProcessing) => {
                if !self.modules.is_empty() {
                    // The chain restarts from the first step on retry
                    task.stage = TaskStage::ModuleExecuting { step: 0 };
                } else if !self.targets.is_empty() {
                    task.stage = TaskStage::Dispatching;
                }
            }

            (TaskStage::ModuleExecuting { step }, TaskInput::ModuleSucceeded) => {
                let module = self.module_at(*step).unwrap_or("?").to_string();
                effects.push(Effect::Emit(
                    self.event(JobEventKind::ModuleComplete, now)
                        .with_target(module),
                ));

                let next = step + 1;
                if next < self.modules.len() {
                    task.stage = TaskStage::ModuleExecuting { step: next };
                } else if self.targets.is_empty() {
                    task.stage = TaskStage::Success;
                    effects.push(Effect::Emit(self.event(JobEventKind::Success, now)));
                    effects.push(Effect::MoveStage {
                        task_id: self.id.clone(),
                        to: StageKind::Success,
                    });
                    effects.push(Effect::ReleaseLock {
                        task_id: self.id.clone(),
                    });
                } else {
                    task.stage = TaskStage::RestagedForDispatch;
                }
            }

            (TaskStage::ModuleExecuting { step }, TaskInput::ModuleFailed { diagnostic }) => {
                let module = self.module_at(*step).unwrap_or("?").to_string();
                task.retry_count += 1;
                task.diagnostics.push(diagnostic.clone());
                effects.push(Effect::Emit(
                    self.event(JobEventKind::ModuleFailed, now)
                        .with_target(module)
                        .with_info(diagnostic_summary(&diagnostic)),
                ));

                if task.retry_count >= policy.max_retries {
                    task.stage = TaskStage::TerminalError;
                    effects.push(Effect::Emit(
                        self.event(JobEventKind::Error, now)
                            .with_info(format!("retries exhausted after {}", task.retry_count)),
                    ));
                    effects.push(Effect::MoveStage {
                        task_id: self.id.clone(),
                        to: StageKind::Error,
                    });
                } else {
                    let retry_at = policy.retry_at(self.priority, now);
                    task.stage = TaskStage::RetryableError { retry_at };
                    let delay = (retry_at - now).to_std().unwrap_or(Duration::ZERO);
                    effects.push(Effect::Emit(
                        self.event(JobEventKind::RetryScheduled, now)
                            .with_info(format!("attempt {}", task.retry_count + 1)),
                    ));
                    effects.push(Effect::ScheduleRetry {
                        task_id: self.id.clone(),
                        delay,
                    });
                }
                effects.push(Effect::ReleaseLock {
                    task_id: self.id.clone(),
                });
            }

            (TaskStage::RestagedForDispatch, TaskInput::Restaged) => {
                task.stage = TaskStage::Dispatching;
                effects.push(Effect::Emit(self.event(JobEventKind::DispatchBegin, now)));
                effects.push(Effect::MoveStage {
                    task_id: self.id.clone(),
                    to: StageKind::Outgoing,
                });
            }

            (TaskStage::RetryableError { .. }, TaskInput::RetryDue) => {
                task.stage = TaskStage::Complete;
            }

            (TaskStage::Dispatching, TaskInput::TargetDelivered { name }) => {
                if let Some(target) = task.targets.iter_mut().find(|t| t.name == name) {
                    target.delivered = true;
                    target.last_error = None;
                    target.next_attempt_at = None;
                }
                effects.push(Effect::Emit(
                    self.event(JobEventKind::TargetDelivered, now)
                        .with_target(name),
                ));

                if task.all_targets_delivered() {
                    task.stage = TaskStage::Success;
                    effects.push(Effect::Emit(self.event(JobEventKind::Success, now)));
                    effects.push(Effect::MoveStage {
                        task_id: self.id.clone(),
                        to: StageKind::Success,
                    });
                    effects.push(Effect::ReleaseLock {
                        task_id: self.id.clone(),
                    });
                }
            }

            (TaskStage::Dispatching, TaskInput::TargetFailed { name, error }) => {
                let mut exhausted = false;
                if let Some(target) = task.targets.iter_mut().find(|t| t.name == name) {
                    target.attempts += 1;
                    target.last_error = Some(error.clone());
                    target.next_attempt_at = Some(policy.retry_at(self.priority, now));
                    task.retry_count = task.retry_count.max(target.attempts);
                    exhausted = target.attempts >= policy.max_retries;
                }
                task.diagnostics.push(AttemptDiagnostic {
                    module: None,
                    target: Some(name.clone()),
                    exit_code: None,
                    stdout: String::new(),
                    stderr: String::new(),
                    timed_out: false,
                    error: error.clone(),
                    at: now,
                });
                effects.push(Effect::Emit(
                    self.event(JobEventKind::TargetFailed, now)
                        .with_target(name)
                        .with_info(error),
                ));

                if exhausted {
                    task.stage = TaskStage::TerminalError;
                    effects.push(Effect::Emit(
                        self.event(JobEventKind::Error, now)
                            .with_info(format!("dispatch retries exhausted after {}", task.retry_count)),
                    ));
                    effects.push(Effect::MoveStage {
                        task_id: self.id.clone(),
                        to: StageKind::Error,
                    });
                    effects.push(Effect::ReleaseLock {
                        task_id: self.id.clone(),
                    });
                }
            }

            // Invalid combinations are no-ops
            _ => {}
        }

        (task, effects)
    }

    fn event(&self, kind: JobEventKind, at: DateTime<Utc>) -> JobEvent {
        let sender = match kind {
            JobEventKind::ModuleBegin
            | JobEventKind::ModuleComplete
            | JobEventKind::ModuleFailed => "processor",
            JobEventKind::DispatchBegin
            | JobEventKind::TargetDelivered
            | JobEventKind::TargetFailed => "dispatcher",
            _ => "router",
        };
        JobEvent::new(kind, self.id.clone(), sender, at)
    }

    // === Persistence ===

    pub fn path_in(task_dir: &Path) -> PathBuf {
        task_dir.join(TASK_FILE)
    }

    pub fn load(task_dir: &Path) -> Result<Self, TaskFileError> {
        let path = Self::path_in(task_dir);
        let text = std::fs::read_to_string(&path).map_err(|source| TaskFileError::Io {
            path: path.clone(),
            source,
        })?;
        serde_json::from_str(&text).map_err(|source| TaskFileError::Invalid { path, source })
    }

    pub fn save(&self, task_dir: &Path) -> Result<(), TaskFileError> {
        let path = Self::path_in(task_dir);
        atomic_write_json(&path, self).map_err(|source| TaskFileError::Io { path, source })
    }
}

fn diagnostic_summary(diagnostic: &AttemptDiagnostic) -> String {
    if diagnostic.timed_out {
        "timed out".to_string()
    } else if let Some(code) = diagnostic.exit_code {
        format!("exit code {}", code)
    } else {
        diagnostic.error.clone()
    }
}

/// Errors from reading or writing task records
#[derive(Debug, Error)]
pub enum TaskFileError {
    #[error("io error on task file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid task file {path}: {source}")]
    Invalid {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

#[cfg(test)]
#[path = "task_tests.rs"]
mod tests;
