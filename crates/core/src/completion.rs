// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Completion detection for incoming file groups
//!
//! Files arrive from scanners in bursts with no end-of-transfer signal. The
//! detector groups them by the UID at the configured scope and applies two
//! timers per group: a quiet period since the last arrival (assumes the
//! transfer finished) and a hard ceiling since the first arrival (guards
//! against indefinitely growing groups). Study and patient groups nest:
//! a parent is held back while any child group is still pending.

use crate::clock::Clock;
use crate::tags::Scope;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::time::{Duration, Instant};

/// What to do with a group when the hard ceiling fires
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CeilingAction {
    /// Complete the group with whatever has arrived
    #[default]
    Proceed,
    /// Keep waiting on the quiet period only
    Ignore,
    /// Drop the group into the discard stage
    Discard,
}

/// Per-scope trigger timers
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TriggerConfig {
    /// Quiet period since the last file before a group is complete
    #[serde(with = "humantime_serde")]
    pub quiet_period: Duration,
    /// Ceiling since the first file after which the group stops waiting
    #[serde(with = "humantime_serde")]
    pub max_wait: Duration,
    #[serde(default)]
    pub on_ceiling: CeilingAction,
}

impl Default for TriggerConfig {
    fn default() -> Self {
        Self {
            quiet_period: Duration::from_secs(60),
            max_wait: Duration::from_secs(3600),
            on_ceiling: CeilingAction::Proceed,
        }
    }
}

/// Identifies a group: the UID at its scope
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct GroupKey {
    pub scope: Scope,
    pub uid: String,
}

impl GroupKey {
    pub fn new(scope: Scope, uid: impl Into<String>) -> Self {
        Self {
            scope,
            uid: uid.into(),
        }
    }
}

impl std::fmt::Display for GroupKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.scope, self.uid)
    }
}

/// Why a group was reported complete
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadyReason {
    /// Quiet period elapsed since the last arrival
    QuietPeriod,
    /// Hard ceiling elapsed since the first arrival
    Ceiling,
    /// Every required series arrived
    RequiredSeries,
    /// Operator forced completion
    Forced,
}

/// Completion verdict for one group
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Disposition {
    Ready(ReadyReason),
    Discard,
}

/// A group the detector decided on, removed from tracking
#[derive(Debug, Clone)]
pub struct GroupOutcome {
    pub key: GroupKey,
    pub dir: PathBuf,
    pub disposition: Disposition,
}

/// A group still accumulating
#[derive(Debug, Clone)]
pub struct PendingGroup {
    pub key: GroupKey,
    pub dir: PathBuf,
    pub first_seen: Instant,
    pub last_seen: Instant,
    /// Number of members: files for series groups, arrived children for
    /// study/patient groups
    pub size: usize,
    /// Child group UIDs that must complete before this group can
    pub pending_children: HashSet<String>,
    /// Series descriptions that have arrived (study scope)
    pub received_series: Vec<String>,
    /// When set, the group completes as soon as every listed description
    /// has arrived, regardless of timers
    pub required_series: Option<Vec<String>>,
    pub forced: bool,
}

impl PendingGroup {
    fn new(key: GroupKey, dir: PathBuf, now: Instant) -> Self {
        Self {
            key,
            dir,
            first_seen: now,
            last_seen: now,
            size: 0,
            pending_children: HashSet::new(),
            received_series: Vec::new(),
            required_series: None,
            forced: false,
        }
    }

    fn required_series_satisfied(&self) -> bool {
        match &self.required_series {
            None => false,
            Some(required) if required.is_empty() => false,
            Some(required) => required.iter().all(|want| {
                self.received_series
                    .iter()
                    .any(|got| got.eq_ignore_ascii_case(want))
            }),
        }
    }
}

/// Tracks pending groups and decides completion
#[derive(Debug)]
pub struct CompletionDetector {
    triggers: HashMap<Scope, TriggerConfig>,
    groups: HashMap<GroupKey, PendingGroup>,
}

impl CompletionDetector {
    pub fn new(triggers: HashMap<Scope, TriggerConfig>) -> Self {
        Self {
            triggers,
            groups: HashMap::new(),
        }
    }

    fn trigger_for(&self, scope: Scope) -> TriggerConfig {
        self.triggers.get(&scope).cloned().unwrap_or_default()
    }

    /// Swap in the trigger timers of the current settings snapshot.
    /// Pending groups keep their first/last-seen instants.
    pub fn set_triggers(&mut self, triggers: HashMap<Scope, TriggerConfig>) {
        self.triggers = triggers;
    }

    fn entry(&mut self, key: GroupKey, dir: &PathBuf, clock: &impl Clock) -> &mut PendingGroup {
        let now = clock.now();
        self.groups
            .entry(key.clone())
            .or_insert_with(|| PendingGroup::new(key, dir.clone(), now))
    }

    /// Record a file arrival in a group. Resets the quiet period, never the
    /// ceiling.
    pub fn observe_file(&mut self, key: GroupKey, dir: &PathBuf, clock: &impl Clock) {
        let now = clock.now();
        let group = self.entry(key, dir, clock);
        group.size += 1;
        group.last_seen = now;
    }

    /// Record the arrival of a completed child group in a parent group
    pub fn observe_child(
        &mut self,
        key: GroupKey,
        dir: &PathBuf,
        child_uid: &str,
        series_description: Option<String>,
        clock: &impl Clock,
    ) {
        let now = clock.now();
        let group = self.entry(key, dir, clock);
        group.size += 1;
        group.last_seen = now;
        group.pending_children.remove(child_uid);
        if let Some(description) = series_description {
            group.received_series.push(description);
        }
    }

    /// Replace the set of child groups a parent must wait for. Called each
    /// scan cycle from the current intake state, so an excluded or vanished
    /// child stops holding its parent back.
    pub fn set_pending_children(&mut self, key: &GroupKey, children: HashSet<String>) {
        if let Some(group) = self.groups.get_mut(key) {
            group.pending_children = children;
        }
    }

    /// Configure the required-series completion trigger for a group
    pub fn set_required_series(&mut self, key: &GroupKey, required: Vec<String>) {
        if let Some(group) = self.groups.get_mut(key) {
            if required.is_empty() {
                tracing::warn!(group = %group.key,
                    "required-series trigger configured with empty list, using timeout instead");
                group.required_series = None;
            } else {
                group.required_series = Some(required);
            }
        }
    }

    /// Force a group to complete on the next poll (operator override)
    pub fn force(&mut self, key: &GroupKey) {
        if let Some(group) = self.groups.get_mut(key) {
            group.forced = true;
        }
    }

    pub fn get(&self, key: &GroupKey) -> Option<&PendingGroup> {
        self.groups.get(key)
    }

    /// Drop a group without deciding it (e.g. its directory disappeared)
    pub fn remove(&mut self, key: &GroupKey) -> Option<PendingGroup> {
        self.groups.remove(key)
    }

    /// UIDs of pending groups at a scope (used to hold back parents)
    pub fn pending_uids(&self, scope: Scope) -> Vec<String> {
        let mut uids: Vec<String> = self
            .groups
            .keys()
            .filter(|k| k.scope == scope)
            .map(|k| k.uid.clone())
            .collect();
        uids.sort();
        uids
    }

    /// Evaluate every tracked group, removing and returning the decided ones
    pub fn poll(&mut self, clock: &impl Clock) -> Vec<GroupOutcome> {
        let now = clock.now();
        let mut decided: Vec<GroupKey> = Vec::new();
        let mut outcomes = Vec::new();

        for (key, group) in &self.groups {
            let config = self.trigger_for(key.scope);
            if let Some(disposition) = evaluate(group, &config, now) {
                decided.push(key.clone());
                outcomes.push(GroupOutcome {
                    key: key.clone(),
                    dir: group.dir.clone(),
                    disposition,
                });
            }
        }

        for key in decided {
            self.groups.remove(&key);
        }
        outcomes.sort_by(|a, b| a.key.uid.cmp(&b.key.uid));
        outcomes
    }
}

/// Decide one group. Tie-break when several triggers are eligible in the
/// same tick: forced, then required-series, then quiet period, then ceiling.
fn evaluate(group: &PendingGroup, config: &TriggerConfig, now: Instant) -> Option<Disposition> {
    if group.size == 0 {
        return None;
    }
    if group.forced {
        return Some(Disposition::Ready(ReadyReason::Forced));
    }
    if group.required_series_satisfied() {
        return Some(Disposition::Ready(ReadyReason::RequiredSeries));
    }
    if !group.pending_children.is_empty() {
        return None;
    }
    if now.duration_since(group.last_seen) >= config.quiet_period {
        return Some(Disposition::Ready(ReadyReason::QuietPeriod));
    }
    if now.duration_since(group.first_seen) >= config.max_wait {
        return match config.on_ceiling {
            CeilingAction::Proceed => Some(Disposition::Ready(ReadyReason::Ceiling)),
            CeilingAction::Ignore => None,
            CeilingAction::Discard => Some(Disposition::Discard),
        };
    }
    None
}

#[cfg(test)]
#[path = "completion_tests.rs"]
mod tests;
