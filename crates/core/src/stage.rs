// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Stage-folder layout and atomic task directory moves
//!
//! Task data lives under named stage roots. A task is one directory holding
//! its DICOM files, their tag sidecars, `task.json`, and (while held) the
//! lock marker. Moving between stages is a single directory rename, so a
//! task's files are never split across two stages mid-transition.

use serde::Serialize;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Lock marker file inside a task directory
pub const LOCK_MARKER: &str = ".lock";
/// Serialized task record inside a task directory
pub const TASK_FILE: &str = "task.json";
/// Operator-dropped marker forcing group completion on the next scan
pub const FORCE_COMPLETE_MARKER: &str = ".force-complete";
/// Extension of tag sidecar documents
pub const TAGS_EXTENSION: &str = "tags";

/// The named stage roots a task moves through
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StageKind {
    /// Receiver drop zone, grouped per series
    Intake,
    /// Study-level grouping root for nested completion
    Studies,
    /// Patient-level grouping root for nested completion
    Patients,
    /// Tasks with module steps awaiting or under execution
    Processing,
    /// Tasks awaiting dispatch to their targets
    Outgoing,
    /// Terminal: everything delivered
    Success,
    /// Terminal: retries exhausted or configuration broken
    Error,
    /// Terminal: no rule matched
    Discard,
}

impl StageKind {
    pub fn dir_name(&self) -> &'static str {
        match self {
            StageKind::Intake => "incoming",
            StageKind::Studies => "studies",
            StageKind::Patients => "patients",
            StageKind::Processing => "processing",
            StageKind::Outgoing => "outgoing",
            StageKind::Success => "success",
            StageKind::Error => "error",
            StageKind::Discard => "discard",
        }
    }

    pub const ALL: [StageKind; 8] = [
        StageKind::Intake,
        StageKind::Studies,
        StageKind::Patients,
        StageKind::Processing,
        StageKind::Outgoing,
        StageKind::Success,
        StageKind::Error,
        StageKind::Discard,
    ];

    /// Terminal stages are never re-entered
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            StageKind::Success | StageKind::Error | StageKind::Discard
        )
    }
}

impl std::fmt::Display for StageKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.dir_name())
    }
}

/// Errors from stage filesystem operations
#[derive(Debug, Error)]
pub enum StageError {
    #[error("io error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("destination already exists: {path}")]
    DestinationExists { path: PathBuf },
    #[error("json error for {path}: {source}")]
    Json {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

fn io_err(path: &Path, source: std::io::Error) -> StageError {
    StageError::Io {
        path: path.to_path_buf(),
        source,
    }
}

/// Resolves stage roots under one data directory and performs moves
#[derive(Debug, Clone)]
pub struct StageStore {
    base: PathBuf,
}

impl StageStore {
    pub fn new(base: impl Into<PathBuf>) -> Self {
        Self { base: base.into() }
    }

    pub fn base(&self) -> &Path {
        &self.base
    }

    pub fn root(&self, stage: StageKind) -> PathBuf {
        self.base.join(stage.dir_name())
    }

    /// Create every stage root that does not exist yet
    pub fn ensure_layout(&self) -> Result<(), StageError> {
        for stage in StageKind::ALL {
            let root = self.root(stage);
            std::fs::create_dir_all(&root).map_err(|e| io_err(&root, e))?;
        }
        Ok(())
    }

    /// List task directories currently under a stage root
    pub fn task_dirs(&self, stage: StageKind) -> Result<Vec<PathBuf>, StageError> {
        let root = self.root(stage);
        let entries = match std::fs::read_dir(&root) {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(io_err(&root, e)),
        };

        let mut dirs = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|e| io_err(&root, e))?;
            let path = entry.path();
            if path.is_dir() {
                dirs.push(path);
            }
        }
        dirs.sort();
        Ok(dirs)
    }

    /// Atomically move a task directory into another stage root.
    ///
    /// The whole directory is renamed, lock marker included; callers holding
    /// a `LockHandle` must `relocate` it to the returned path.
    pub fn promote(&self, task_dir: &Path, to: StageKind) -> Result<PathBuf, StageError> {
        let name = task_dir
            .file_name()
            .ok_or_else(|| io_err(task_dir, std::io::Error::from(ErrorKind::InvalidInput)))?;
        let dest = self.root(to).join(name);
        if dest.exists() {
            return Err(StageError::DestinationExists { path: dest });
        }
        std::fs::rename(task_dir, &dest).map_err(|e| io_err(task_dir, e))?;
        Ok(dest)
    }

    /// Move a task directory under a named group directory in a nesting root
    /// (used when a series joins a study group, or a study joins a patient).
    pub fn promote_into_group(
        &self,
        task_dir: &Path,
        to: StageKind,
        group: &str,
    ) -> Result<PathBuf, StageError> {
        let name = task_dir
            .file_name()
            .ok_or_else(|| io_err(task_dir, std::io::Error::from(ErrorKind::InvalidInput)))?;
        let group_dir = self.root(to).join(group);
        std::fs::create_dir_all(&group_dir).map_err(|e| io_err(&group_dir, e))?;
        let dest = group_dir.join(name);
        if dest.exists() {
            return Err(StageError::DestinationExists { path: dest });
        }
        std::fs::rename(task_dir, &dest).map_err(|e| io_err(task_dir, e))?;
        Ok(dest)
    }

    /// Remove a now-empty group directory (ignores leftovers)
    pub fn remove_if_empty(&self, dir: &Path) -> Result<(), StageError> {
        match std::fs::remove_dir(dir) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            // Directory not empty: leave it for the next cycle
            Err(e) if e.kind() == ErrorKind::DirectoryNotEmpty => Ok(()),
            Err(e) => Err(io_err(dir, e)),
        }
    }

}

/// Write a JSON document atomically: temp file in the same directory, then
/// rename over the destination. Readers never observe a partial document.
pub fn atomic_write_json<T: Serialize>(path: &Path, value: &T) -> std::io::Result<()> {
    let json = serde_json::to_vec_pretty(value)
        .map_err(|e| std::io::Error::new(ErrorKind::InvalidData, e))?;

    let parent = path
        .parent()
        .ok_or_else(|| std::io::Error::from(ErrorKind::InvalidInput))?;
    let tmp = parent.join(format!(
        ".{}.tmp",
        path.file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| "write".to_string())
    ));

    std::fs::write(&tmp, &json)?;
    std::fs::rename(&tmp, path)
}
