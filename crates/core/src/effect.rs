// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Effects and job events for state machine orchestration
//!
//! State machines stay pure: transitions return the new state plus a list of
//! effects, and the calling loop performs the I/O. Job events are the audit
//! records pushed to the external bookkeeper.

use crate::stage::StageKind;
use crate::task::TaskId;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Effects are side effects that state machines request
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Effect {
    /// Emit a job event for the bookkeeper
    Emit(JobEvent),
    /// Move the task directory to another stage root
    MoveStage { task_id: TaskId, to: StageKind },
    /// Release the task lock held by the current owner
    ReleaseLock { task_id: TaskId },
    /// Re-attempt the task after the given delay
    ScheduleRetry { task_id: TaskId, delay: Duration },
}

/// The kind of a job event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobEventKind {
    /// Task created from a completed group
    Registered,
    /// Group completion detected
    Complete,
    /// A stale lock was taken over
    LockReclaimed,
    /// Module execution started
    ModuleBegin,
    /// Module execution finished successfully
    ModuleComplete,
    /// Module execution failed or timed out
    ModuleFailed,
    /// A retry was scheduled after a failure
    RetryScheduled,
    /// Dispatch of the task output started
    DispatchBegin,
    /// One target received the task output
    TargetDelivered,
    /// Delivery to one target failed
    TargetFailed,
    /// Task finished successfully
    Success,
    /// Task failed permanently
    Error,
    /// Task matched no rules and was discarded
    Discard,
}

impl JobEventKind {
    /// Event name for pattern matching and log queries.
    /// Format: "category:action"
    pub fn name(&self) -> &'static str {
        match self {
            JobEventKind::Registered => "task:registered",
            JobEventKind::Complete => "task:complete",
            JobEventKind::LockReclaimed => "lock:reclaimed",
            JobEventKind::ModuleBegin => "module:begin",
            JobEventKind::ModuleComplete => "module:complete",
            JobEventKind::ModuleFailed => "module:failed",
            JobEventKind::RetryScheduled => "task:retry",
            JobEventKind::DispatchBegin => "dispatch:begin",
            JobEventKind::TargetDelivered => "dispatch:delivered",
            JobEventKind::TargetFailed => "dispatch:failed",
            JobEventKind::Success => "task:success",
            JobEventKind::Error => "task:error",
            JobEventKind::Discard => "task:discard",
        }
    }
}

/// A structured audit record for the external bookkeeper
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobEvent {
    pub task_id: TaskId,
    pub kind: JobEventKind,
    /// Component that produced the event (router, processor, dispatcher)
    pub sender: String,
    /// Target or module this event refers to, if any
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target: Option<String>,
    /// Free-text detail
    #[serde(default)]
    pub info: String,
    pub timestamp: DateTime<Utc>,
}

impl JobEvent {
    pub fn new(
        kind: JobEventKind,
        task_id: TaskId,
        sender: impl Into<String>,
        timestamp: DateTime<Utc>,
    ) -> Self {
        Self {
            task_id,
            kind,
            sender: sender.into(),
            target: None,
            info: String::new(),
            timestamp,
        }
    }

    pub fn with_target(mut self, target: impl Into<String>) -> Self {
        self.target = Some(target.into());
        self
    }

    pub fn with_info(mut self, info: impl Into<String>) -> Self {
        self.info = info.into();
        self
    }
}
