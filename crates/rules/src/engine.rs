// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Rule evaluation: task metadata in, selected actions out
//!
//! Every enabled rule whose condition is true applies (fan-out, not
//! first-match). Duplicate target/module selections across rules are
//! deduplicated preserving first-seen order. A malformed rule or a dangling
//! reference is skipped with a log line and never aborts the evaluation of
//! other rules.

use crate::catalog::Catalog;
use crate::expr::{Expr, FieldSource, Value};
use chrono::{DateTime, SecondsFormat, Utc};
use radroute_core::tags::{Scope, TagSnapshot};
use radroute_core::task::Priority;

/// Task metadata visible to rule conditions
#[derive(Debug, Clone)]
pub struct EvalContext<'a> {
    pub tags: &'a TagSnapshot,
    pub file_count: u64,
    pub received_at: DateTime<Utc>,
    /// Whether the current wall time falls inside the offpeak window
    pub offpeak: bool,
}

impl FieldSource for EvalContext<'_> {
    fn field(&self, name: &str) -> Value {
        match name {
            "FileCount" => Value::Num(self.file_count as f64),
            "ReceivedTime" => Value::Str(
                self.received_at
                    .to_rfc3339_opts(SecondsFormat::Secs, true),
            ),
            "OffPeak" => Value::Bool(self.offpeak),
            tag => Value::Str(self.tags.get(tag).unwrap_or_default()),
        }
    }
}

/// The actions selected for one task
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Selection {
    pub matched_rules: Vec<String>,
    pub targets: Vec<String>,
    pub modules: Vec<String>,
    pub priority: Priority,
    /// Union of the matching rules' required-series lists (study scope)
    pub required_series: Vec<String>,
}

impl Selection {
    pub fn is_empty(&self) -> bool {
        self.matched_rules.is_empty()
    }
}

/// Evaluate all enabled rules at a scope against one task's metadata
pub fn evaluate(catalog: &Catalog, scope: Scope, ctx: &EvalContext<'_>) -> Selection {
    let mut selection = Selection::default();
    let mut urgent = false;
    let mut all_offpeak = true;

    for (name, rule) in catalog.rules_for_scope(scope) {
        let expr = match Expr::parse(&rule.condition) {
            Ok(expr) => expr,
            Err(e) => {
                tracing::warn!(rule = %name, error = %e, "skipping malformed rule");
                continue;
            }
        };
        if !expr.eval(ctx) {
            continue;
        }

        tracing::debug!(rule = %name, "rule matched");
        selection.matched_rules.push(name.clone());

        match rule.priority {
            Priority::Urgent => {
                urgent = true;
                all_offpeak = false;
            }
            Priority::Normal => all_offpeak = false,
            Priority::Offpeak => {}
        }

        for target in &rule.targets {
            if !catalog.targets.contains_key(target) {
                // Configuration raced ahead of the rule; skip, not an error
                tracing::warn!(rule = %name, target = %target,
                    "rule references a target that no longer exists, skipping");
                continue;
            }
            if !selection.targets.contains(target) {
                selection.targets.push(target.clone());
            }
        }

        for module in &rule.modules {
            if !catalog.modules.contains_key(module) {
                tracing::warn!(rule = %name, module = %module,
                    "rule references a module that no longer exists, skipping");
                continue;
            }
            if !selection.modules.contains(module) {
                selection.modules.push(module.clone());
            }
        }

        for series in &rule.required_series {
            if !selection.required_series.contains(series) {
                selection.required_series.push(series.clone());
            }
        }
    }

    selection.priority = if urgent {
        Priority::Urgent
    } else if all_offpeak && !selection.matched_rules.is_empty() {
        Priority::Offpeak
    } else {
        Priority::Normal
    };

    selection
}

#[cfg(test)]
#[path = "engine_tests.rs"]
mod tests;
