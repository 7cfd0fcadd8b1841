// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Processing-runner abstraction over container execution backends
//!
//! A module run goes through five capabilities: prepare the staging area,
//! start the workload, await completion under a time ceiling, collect the
//! output files, clean up. Backends are a closed set selected by the
//! `runner` setting; dispatch is an explicit match, not inheritance.

pub mod cluster;
pub mod container;
#[cfg(any(test, feature = "test-support"))]
pub mod fake;

use async_trait::async_trait;
use radroute_core::settings::{RunnerKind, Settings};
use radroute_core::task::TaskId;
use radroute_rules::Module;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

pub use cluster::ClusterScheduler;
pub use container::ContainerEngine;
#[cfg(any(test, feature = "test-support"))]
pub use fake::{FakeRunner, RunnerCall};

/// Everything a backend needs to run one module step
#[derive(Debug, Clone)]
pub struct RunRequest {
    pub task_id: TaskId,
    pub module_name: String,
    pub module: Module,
    /// Task directory holding the `in/` and `out/` staging areas
    pub work_dir: PathBuf,
    /// Ceiling after which the run is forcibly terminated
    pub timeout: Duration,
}

impl RunRequest {
    pub fn input_dir(&self) -> PathBuf {
        self.work_dir.join("in")
    }

    pub fn output_dir(&self) -> PathBuf {
        self.work_dir.join("out")
    }
}

/// Conventional environment passed to every module
pub const ENV_IN_DIR: &str = "RADROUTE_IN_DIR";
pub const ENV_OUT_DIR: &str = "RADROUTE_OUT_DIR";
/// Mount points inside the container
pub const CONTAINER_IN_DIR: &str = "/tmp/data";
pub const CONTAINER_OUT_DIR: &str = "/tmp/output";

/// What a finished (or killed) run looked like
#[derive(Debug, Clone, Default)]
pub struct RunOutcome {
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
    pub timed_out: bool,
    pub duration: Duration,
}

impl RunOutcome {
    pub fn success(&self) -> bool {
        !self.timed_out && self.exit_code == Some(0)
    }
}

/// Errors from runner backends
#[derive(Debug, Error)]
pub enum RunnerError {
    #[error("module has no image reference")]
    MissingImage,
    #[error("failed to spawn {command}: {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },
    #[error("{command} failed: {stderr}")]
    CommandFailed { command: String, stderr: String },
    #[error("io error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("job template error: {0}")]
    Template(#[from] minijinja::Error),
}

/// Opaque handle to a started run, owned by the backend that created it
#[derive(Debug, Clone)]
pub struct RunToken {
    pub run_id: String,
    pub(crate) handle: TokenHandle,
}

#[derive(Debug, Clone)]
pub(crate) enum TokenHandle {
    /// Named container on the local engine
    Container,
    /// Job id on the cluster scheduler
    ClusterJob { job_id: String },
    #[cfg(any(test, feature = "test-support"))]
    Fake,
}

/// Capability interface implemented by every backend
#[async_trait]
pub trait ProcessRunner: Send + Sync {
    /// Set up `in/` and `out/`; stage the task's payload into `in/` when it
    /// has not been staged yet
    async fn prepare(&self, req: &RunRequest) -> Result<(), RunnerError>;

    /// Launch the workload without waiting for it
    async fn start(&self, req: &RunRequest) -> Result<RunToken, RunnerError>;

    /// Wait for the workload, enforcing the time ceiling. A run past the
    /// ceiling is terminated and reported with `timed_out = true`.
    async fn await_completion(
        &self,
        token: &RunToken,
        req: &RunRequest,
    ) -> Result<RunOutcome, RunnerError>;

    /// Files the module produced in the `out/` staging area
    async fn collect_output(
        &self,
        token: &RunToken,
        req: &RunRequest,
    ) -> Result<Vec<PathBuf>, RunnerError>;

    /// Remove backend resources for the run; must be safe to call after
    /// failures
    async fn cleanup(&self, token: RunToken, req: &RunRequest) -> Result<(), RunnerError>;

    /// Drive the full capability sequence for one module step
    async fn run(&self, req: &RunRequest) -> Result<(RunOutcome, Vec<PathBuf>), RunnerError> {
        self.prepare(req).await?;
        let token = self.start(req).await?;
        let outcome = self.await_completion(&token, req).await?;
        let outputs = if outcome.success() {
            self.collect_output(&token, req).await?
        } else {
            Vec::new()
        };
        self.cleanup(token, req).await?;
        Ok((outcome, outputs))
    }
}

/// The closed set of backends, selected by the global `runner` setting
pub enum RunnerBackend {
    Container(ContainerEngine),
    Cluster(ClusterScheduler),
    #[cfg(any(test, feature = "test-support"))]
    Fake(FakeRunner),
}

impl RunnerBackend {
    pub fn from_settings(settings: &Settings) -> Self {
        match settings.runner {
            RunnerKind::Docker => {
                RunnerBackend::Container(ContainerEngine::new(settings.run_as.clone()))
            }
            RunnerKind::Cluster => RunnerBackend::Cluster(ClusterScheduler::default()),
        }
    }

    fn inner(&self) -> &dyn ProcessRunner {
        match self {
            RunnerBackend::Container(engine) => engine,
            RunnerBackend::Cluster(scheduler) => scheduler,
            #[cfg(any(test, feature = "test-support"))]
            RunnerBackend::Fake(fake) => fake,
        }
    }
}

#[async_trait]
impl ProcessRunner for RunnerBackend {
    async fn prepare(&self, req: &RunRequest) -> Result<(), RunnerError> {
        self.inner().prepare(req).await
    }

    async fn start(&self, req: &RunRequest) -> Result<RunToken, RunnerError> {
        self.inner().start(req).await
    }

    async fn await_completion(
        &self,
        token: &RunToken,
        req: &RunRequest,
    ) -> Result<RunOutcome, RunnerError> {
        self.inner().await_completion(token, req).await
    }

    async fn collect_output(
        &self,
        token: &RunToken,
        req: &RunRequest,
    ) -> Result<Vec<PathBuf>, RunnerError> {
        self.inner().collect_output(token, req).await
    }

    async fn cleanup(&self, token: RunToken, req: &RunRequest) -> Result<(), RunnerError> {
        self.inner().cleanup(token, req).await
    }
}

/// Shared staging used by the real backends: make sure `in/` and `out/`
/// exist, moving an unstaged payload (files plus sidecars) into `in/`.
pub(crate) fn stage_input(work_dir: &Path) -> Result<(), RunnerError> {
    let input = work_dir.join("in");
    let output = work_dir.join("out");

    if !input.exists() {
        std::fs::create_dir(&input).map_err(|source| RunnerError::Io {
            path: input.clone(),
            source,
        })?;
        let entries = std::fs::read_dir(work_dir).map_err(|source| RunnerError::Io {
            path: work_dir.to_path_buf(),
            source,
        })?;
        for entry in entries {
            let entry = entry.map_err(|source| RunnerError::Io {
                path: work_dir.to_path_buf(),
                source,
            })?;
            let path = entry.path();
            let name = entry.file_name().to_string_lossy().to_string();
            // Payload files plus nested child-group directories move; the
            // record, markers, and the staging areas themselves stay put
            if name.starts_with('.')
                || name == radroute_core::stage::TASK_FILE
                || name == "in"
                || name == "out"
            {
                continue;
            }
            let dest = input.join(entry.file_name());
            std::fs::rename(&path, &dest).map_err(|source| RunnerError::Io {
                path: path.clone(),
                source,
            })?;
        }

        // Modules read the task record from their input directory
        let task_file = work_dir.join(radroute_core::stage::TASK_FILE);
        if task_file.exists() {
            std::fs::copy(&task_file, input.join(radroute_core::stage::TASK_FILE)).map_err(
                |source| RunnerError::Io {
                    path: task_file.clone(),
                    source,
                },
            )?;
        }
    }

    std::fs::create_dir_all(&output).map_err(|source| RunnerError::Io {
        path: output.clone(),
        source,
    })?;
    Ok(())
}

/// List the files a run left in `out/`
pub(crate) fn list_output(out_dir: &Path) -> Result<Vec<PathBuf>, RunnerError> {
    let mut files = Vec::new();
    let entries = std::fs::read_dir(out_dir).map_err(|source| RunnerError::Io {
        path: out_dir.to_path_buf(),
        source,
    })?;
    for entry in entries {
        let entry = entry.map_err(|source| RunnerError::Io {
            path: out_dir.to_path_buf(),
            source,
        })?;
        let path = entry.path();
        if path.is_file() {
            files.push(path);
        }
    }
    files.sort();
    Ok(files)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stage_input_moves_payload_once() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.dcm"), b"x").unwrap();
        std::fs::write(dir.path().join("a.tags"), b"{}").unwrap();
        std::fs::write(dir.path().join(".lock"), b"{}").unwrap();

        stage_input(dir.path()).unwrap();

        assert!(dir.path().join("in/a.dcm").exists());
        assert!(dir.path().join("in/a.tags").exists());
        assert!(dir.path().join(".lock").exists());
        assert!(dir.path().join("out").is_dir());

        // Second call must not disturb an already staged area
        std::fs::write(dir.path().join("late.dcm"), b"x").unwrap();
        stage_input(dir.path()).unwrap();
        assert!(dir.path().join("late.dcm").exists());
    }

    #[test]
    fn run_outcome_success_requires_zero_exit() {
        let ok = RunOutcome {
            exit_code: Some(0),
            ..Default::default()
        };
        assert!(ok.success());

        let failed = RunOutcome {
            exit_code: Some(2),
            ..Default::default()
        };
        assert!(!failed.success());

        let killed = RunOutcome {
            exit_code: Some(0),
            timed_out: true,
            ..Default::default()
        };
        assert!(!killed.success());
    }
}
