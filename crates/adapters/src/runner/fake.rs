// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Fake runner backend for testing

use super::{
    list_output, stage_input, ProcessRunner, RunOutcome, RunRequest, RunToken, RunnerError,
    TokenHandle,
};
use async_trait::async_trait;
use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Recorded runner call
#[derive(Debug, Clone)]
pub enum RunnerCall {
    Prepare { module: String },
    Start { module: String },
    Await { run_id: String },
    Collect { run_id: String },
    Cleanup { run_id: String },
}

/// Fake runner with scripted outcomes and recorded calls
#[derive(Clone, Default)]
pub struct FakeRunner {
    outcomes: Arc<Mutex<VecDeque<Result<RunOutcome, String>>>>,
    output_files: Arc<Mutex<Vec<String>>>,
    calls: Arc<Mutex<Vec<RunnerCall>>>,
    next_id: Arc<Mutex<u64>>,
}

impl FakeRunner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue the outcome of the next run. With an empty queue every run
    /// succeeds with exit code 0.
    pub fn push_outcome(&self, outcome: RunOutcome) {
        self.outcomes
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push_back(Ok(outcome));
    }

    /// Queue a failed run with the given exit code and stderr
    pub fn push_failure(&self, exit_code: i32, stderr: impl Into<String>) {
        self.push_outcome(RunOutcome {
            exit_code: Some(exit_code),
            stderr: stderr.into(),
            ..Default::default()
        });
    }

    /// Queue a timed-out run
    pub fn push_timeout(&self) {
        self.push_outcome(RunOutcome {
            exit_code: None,
            timed_out: true,
            ..Default::default()
        });
    }

    /// Queue a backend error (e.g. the engine is unreachable)
    pub fn push_error(&self, message: impl Into<String>) {
        self.outcomes
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push_back(Err(message.into()));
    }

    /// Files a successful run leaves in the `out/` staging area
    pub fn set_output_files(&self, names: Vec<String>) {
        *self.output_files.lock().unwrap_or_else(|e| e.into_inner()) = names;
    }

    /// Get all recorded calls
    pub fn calls(&self) -> Vec<RunnerCall> {
        self.calls.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    fn record(&self, call: RunnerCall) {
        self.calls.lock().unwrap_or_else(|e| e.into_inner()).push(call);
    }
}

#[async_trait]
impl ProcessRunner for FakeRunner {
    async fn prepare(&self, req: &RunRequest) -> Result<(), RunnerError> {
        self.record(RunnerCall::Prepare {
            module: req.module_name.clone(),
        });
        if req.module.image.is_empty() {
            return Err(RunnerError::MissingImage);
        }
        stage_input(&req.work_dir)
    }

    async fn start(&self, req: &RunRequest) -> Result<RunToken, RunnerError> {
        self.record(RunnerCall::Start {
            module: req.module_name.clone(),
        });
        let mut next = self.next_id.lock().unwrap_or_else(|e| e.into_inner());
        *next += 1;
        Ok(RunToken {
            run_id: format!("fake-{}", *next),
            handle: TokenHandle::Fake,
        })
    }

    async fn await_completion(
        &self,
        token: &RunToken,
        req: &RunRequest,
    ) -> Result<RunOutcome, RunnerError> {
        self.record(RunnerCall::Await {
            run_id: token.run_id.clone(),
        });
        let scripted = self
            .outcomes
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .pop_front();
        let outcome = match scripted {
            Some(Ok(outcome)) => outcome,
            Some(Err(message)) => {
                return Err(RunnerError::CommandFailed {
                    command: "fake run".to_string(),
                    stderr: message,
                })
            }
            None => RunOutcome {
                exit_code: Some(0),
                duration: Duration::from_millis(1),
                ..Default::default()
            },
        };

        if outcome.success() {
            let names = self
                .output_files
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .clone();
            for name in names {
                let path = req.output_dir().join(name);
                std::fs::write(&path, b"fake output").map_err(|source| RunnerError::Io {
                    path,
                    source,
                })?;
            }
        }
        Ok(outcome)
    }

    async fn collect_output(
        &self,
        token: &RunToken,
        req: &RunRequest,
    ) -> Result<Vec<PathBuf>, RunnerError> {
        self.record(RunnerCall::Collect {
            run_id: token.run_id.clone(),
        });
        list_output(&req.output_dir())
    }

    async fn cleanup(&self, token: RunToken, _req: &RunRequest) -> Result<(), RunnerError> {
        self.record(RunnerCall::Cleanup { run_id: token.run_id });
        Ok(())
    }
}
