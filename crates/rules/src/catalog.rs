// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Catalog of routing configuration documents
//!
//! Rules, targets, and modules are edited externally (admin interface) and
//! consumed here as one TOML document:
//!
//! ```toml
//! [rule.ct_archive]
//! condition = 'Modality == "CT"'
//! targets = ["archive"]
//!
//! [target.archive]
//! protocol = "folder"
//! [target.archive.params]
//! path = "/exports/archive"
//!
//! [module.denoise]
//! image = "vendor/denoise:1.2"
//! gpu = true
//! ```
//!
//! Like the settings file, the catalog is re-read per cycle through a
//! watcher; a broken edit keeps the previous snapshot.

use radroute_core::tags::Scope;
use radroute_core::task::Priority;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::SystemTime;
use thiserror::Error;

/// A declarative routing rule
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Rule {
    /// Condition expression; see the expr module for the language
    pub condition: String,
    pub scope: Scope,
    pub priority: Priority,
    pub disabled: bool,
    pub targets: Vec<String>,
    pub modules: Vec<String>,
    /// Study scope only: series descriptions that complete the study as
    /// soon as all of them arrived
    pub required_series: Vec<String>,
    /// Free-text note from the rule author
    pub comment: String,
}

impl Default for Rule {
    fn default() -> Self {
        Self {
            condition: String::new(),
            scope: Scope::Series,
            priority: Priority::Normal,
            disabled: false,
            targets: Vec::new(),
            modules: Vec::new(),
            required_series: Vec::new(),
            comment: String::new(),
        }
    }
}

/// Transfer direction of a target
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    #[default]
    Push,
    Pull,
    Both,
}

/// A dispatch destination
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Target {
    /// Protocol handler name ("folder", plus externally provided handlers)
    pub protocol: String,
    pub direction: Direction,
    /// Connection parameters, interpreted by the protocol handler
    pub params: BTreeMap<String, String>,
    pub comment: String,
}

/// Resource requirements of a module run
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Resources {
    pub memory_mb: Option<u64>,
    pub cpus: Option<f64>,
}

/// A containerized processing step
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Module {
    /// Container image reference
    pub image: String,
    /// host path -> container path bind mounts, in addition to in/out
    pub volumes: BTreeMap<String, String>,
    pub environment: BTreeMap<String, String>,
    /// Extra arguments passed to the container runtime verbatim
    pub extra_args: Vec<String>,
    pub gpu: bool,
    pub requires_root: bool,
    /// Placement constraints, passed through opaquely to cluster backends
    /// and ignored by the local engine
    pub constraints: BTreeMap<String, String>,
    pub resources: Resources,
    /// Free-text metadata
    pub comment: String,
}

/// The full configuration document
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Catalog {
    #[serde(rename = "rule")]
    pub rules: BTreeMap<String, Rule>,
    #[serde(rename = "target")]
    pub targets: BTreeMap<String, Target>,
    #[serde(rename = "module")]
    pub modules: BTreeMap<String, Module>,
}

impl Catalog {
    pub fn parse(text: &str) -> Result<Self, CatalogError> {
        toml::from_str(text).map_err(CatalogError::Parse)
    }

    pub fn load(path: &Path) -> Result<Self, CatalogError> {
        let text = std::fs::read_to_string(path).map_err(|source| CatalogError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::parse(&text)
    }

    pub fn rule(&self, name: &str) -> Option<&Rule> {
        self.rules.get(name)
    }

    pub fn target(&self, name: &str) -> Option<&Target> {
        self.targets.get(name)
    }

    pub fn module(&self, name: &str) -> Option<&Module> {
        self.modules.get(name)
    }

    /// Enabled rules at a scope, in stable (name) order
    pub fn rules_for_scope(&self, scope: Scope) -> impl Iterator<Item = (&String, &Rule)> {
        self.rules
            .iter()
            .filter(move |(_, rule)| !rule.disabled && rule.scope == scope)
    }

    /// Dangling references. These do not fail loading; the engine skips
    /// them at evaluation time, but operators want to see them listed.
    pub fn validate(&self) -> Vec<String> {
        let mut problems = Vec::new();
        for (name, rule) in &self.rules {
            for target in &rule.targets {
                if !self.targets.contains_key(target) {
                    problems.push(format!("rule '{}' references unknown target '{}'", name, target));
                }
            }
            for module in &rule.modules {
                if !self.modules.contains_key(module) {
                    problems.push(format!("rule '{}' references unknown module '{}'", name, module));
                }
            }
            if let Err(e) = crate::expr::Expr::parse(&rule.condition) {
                problems.push(format!("rule '{}' has a malformed condition: {}", name, e));
            }
        }
        problems
    }
}

/// Errors from loading the catalog document
#[derive(Debug, Error)]
pub enum CatalogError {
    #[error("cannot read catalog {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("cannot parse catalog: {0}")]
    Parse(#[source] toml::de::Error),
}

/// Re-reads the catalog when its file changes, never mid-cycle
#[derive(Debug)]
pub struct CatalogWatcher {
    path: PathBuf,
    mtime: Option<SystemTime>,
    current: Arc<Catalog>,
}

impl CatalogWatcher {
    /// Load the initial snapshot. A missing file yields an empty catalog
    /// (every task discards until rules appear).
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, CatalogError> {
        let path = path.into();
        let catalog = if path.exists() {
            let catalog = Catalog::load(&path)?;
            for problem in catalog.validate() {
                tracing::warn!(catalog = %path.display(), problem = %problem, "catalog validation");
            }
            catalog
        } else {
            tracing::warn!(catalog = %path.display(), "no catalog file, starting empty");
            Catalog::default()
        };
        let mtime = std::fs::metadata(&path).and_then(|m| m.modified()).ok();
        Ok(Self {
            path,
            mtime,
            current: Arc::new(catalog),
        })
    }

    /// Start from an in-memory catalog without a backing file (tests)
    pub fn fixed(catalog: Catalog) -> Self {
        Self {
            path: PathBuf::new(),
            mtime: None,
            current: Arc::new(catalog),
        }
    }

    /// The snapshot for this cycle; a broken edit keeps the previous one
    pub fn snapshot(&mut self) -> Arc<Catalog> {
        if self.path.as_os_str().is_empty() {
            return Arc::clone(&self.current);
        }
        let mtime = std::fs::metadata(&self.path)
            .and_then(|m| m.modified())
            .ok();
        if mtime != self.mtime {
            match Catalog::load(&self.path) {
                Ok(catalog) => {
                    for problem in catalog.validate() {
                        tracing::warn!(catalog = %self.path.display(), problem = %problem, "catalog validation");
                    }
                    tracing::info!(catalog = %self.path.display(), "catalog reloaded");
                    self.current = Arc::new(catalog);
                }
                Err(e) => {
                    tracing::error!(catalog = %self.path.display(), error = %e,
                        "catalog reload failed, keeping previous snapshot");
                }
            }
            self.mtime = mtime;
        }
        Arc::clone(&self.current)
    }
}
