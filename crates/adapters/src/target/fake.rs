// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Fake target handler for testing

use super::{PushError, TargetChannel};
use async_trait::async_trait;
use radroute_rules::Target;
use std::collections::{HashMap, VecDeque};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

/// Recorded push attempt
#[derive(Debug, Clone)]
pub struct PushCall {
    pub target: String,
    pub files: Vec<PathBuf>,
}

/// Fake handler with per-target scripted failures and recorded pushes.
///
/// Failures are queued per target name (the `name` parameter of the target
/// configuration, falling back to the protocol); an empty queue succeeds.
#[derive(Clone, Default)]
pub struct FakeTarget {
    failures: Arc<Mutex<HashMap<String, VecDeque<String>>>>,
    always_fail: Arc<Mutex<HashMap<String, String>>>,
    calls: Arc<Mutex<Vec<PushCall>>>,
}

impl FakeTarget {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue one failed attempt for a target
    pub fn push_failure(&self, target: impl Into<String>, error: impl Into<String>) {
        self.failures
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .entry(target.into())
            .or_default()
            .push_back(error.into());
    }

    /// Make every attempt for a target fail
    pub fn fail_always(&self, target: impl Into<String>, error: impl Into<String>) {
        self.always_fail
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(target.into(), error.into());
    }

    /// Get all recorded push attempts
    pub fn calls(&self) -> Vec<PushCall> {
        self.calls.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Recorded attempts for one target
    pub fn attempts_for(&self, target: &str) -> usize {
        self.calls()
            .iter()
            .filter(|call| call.target == target)
            .count()
    }
}

fn target_key(target: &Target) -> String {
    target
        .params
        .get("name")
        .cloned()
        .unwrap_or_else(|| target.protocol.clone())
}

#[async_trait]
impl TargetChannel for FakeTarget {
    async fn push(&self, files: &[PathBuf], target: &Target) -> Result<(), PushError> {
        let key = target_key(target);
        self.calls
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(PushCall {
                target: key.clone(),
                files: files.to_vec(),
            });

        if let Some(error) = self
            .always_fail
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(&key)
        {
            return Err(PushError::Rejected(error.clone()));
        }
        let scripted = self
            .failures
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get_mut(&key)
            .and_then(VecDeque::pop_front);
        match scripted {
            Some(error) => Err(PushError::Rejected(error)),
            None => Ok(()),
        }
    }
}
