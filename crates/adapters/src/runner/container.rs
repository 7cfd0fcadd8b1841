// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Local container engine backend
//!
//! Shells out to the container CLI. The run is started detached under a
//! generated name so logs survive a non-zero exit and a timed-out run can
//! be killed by name.

use super::{
    list_output, stage_input, ProcessRunner, RunOutcome, RunRequest, RunToken, RunnerError,
    TokenHandle, CONTAINER_IN_DIR, CONTAINER_OUT_DIR, ENV_IN_DIR, ENV_OUT_DIR,
};
use async_trait::async_trait;
use radroute_core::settings::RunAs;
use std::path::PathBuf;
use std::process::Output;
use std::time::Instant;
use tokio::process::Command;

/// Backend driving the local container engine CLI
#[derive(Clone, Debug)]
pub struct ContainerEngine {
    cli: String,
    run_as: RunAs,
}

impl ContainerEngine {
    pub fn new(run_as: RunAs) -> Self {
        Self {
            cli: "docker".to_string(),
            run_as,
        }
    }

    /// Use a different CLI binary (e.g. podman)
    pub fn with_cli(mut self, cli: impl Into<String>) -> Self {
        self.cli = cli.into();
        self
    }

    async fn cli_output(&self, args: &[String]) -> Result<Output, RunnerError> {
        Command::new(&self.cli)
            .args(args)
            .output()
            .await
            .map_err(|source| RunnerError::Spawn {
                command: format!("{} {}", self.cli, args.join(" ")),
                source,
            })
    }

    fn run_args(&self, req: &RunRequest, name: &str) -> Vec<String> {
        let mut args: Vec<String> = vec![
            "run".into(),
            "-d".into(),
            "--name".into(),
            name.into(),
            "-v".into(),
            format!("{}:{}", req.input_dir().display(), CONTAINER_IN_DIR),
            "-v".into(),
            format!("{}:{}", req.output_dir().display(), CONTAINER_OUT_DIR),
            "-e".into(),
            format!("{}={}", ENV_IN_DIR, CONTAINER_IN_DIR),
            "-e".into(),
            format!("{}={}", ENV_OUT_DIR, CONTAINER_OUT_DIR),
        ];

        for (key, value) in &req.module.environment {
            args.push("-e".into());
            args.push(format!("{}={}", key, value));
        }
        for (host, container) in &req.module.volumes {
            args.push("-v".into());
            args.push(format!("{}:{}", host, container));
        }
        if req.module.gpu {
            args.push("--gpus".into());
            args.push("all".into());
        }
        if !req.module.requires_root {
            if let Some(user) = &self.run_as.user {
                args.push("--user".into());
                args.push(user.clone());
            }
        }
        if let Some(memory_mb) = req.module.resources.memory_mb {
            args.push("--memory".into());
            args.push(format!("{}m", memory_mb));
        }
        if let Some(cpus) = req.module.resources.cpus {
            args.push("--cpus".into());
            args.push(format!("{}", cpus));
        }
        args.extend(req.module.extra_args.iter().cloned());
        // Placement constraints only mean something to the cluster backend
        args.push(req.module.image.clone());
        args
    }
}

#[async_trait]
impl ProcessRunner for ContainerEngine {
    async fn prepare(&self, req: &RunRequest) -> Result<(), RunnerError> {
        if req.module.image.is_empty() {
            return Err(RunnerError::MissingImage);
        }
        stage_input(&req.work_dir)
    }

    async fn start(&self, req: &RunRequest) -> Result<RunToken, RunnerError> {
        let name = format!("radroute-{}", uuid::Uuid::new_v4().simple());
        let args = self.run_args(req, &name);

        tracing::info!(
            task_id = %req.task_id,
            module = %req.module_name,
            image = %req.module.image,
            container = %name,
            "starting module container"
        );

        let output = self.cli_output(&args).await?;
        if !output.status.success() {
            return Err(RunnerError::CommandFailed {
                command: format!("{} run", self.cli),
                stderr: String::from_utf8_lossy(&output.stderr).to_string(),
            });
        }

        Ok(RunToken {
            run_id: name,
            handle: TokenHandle::Container,
        })
    }

    async fn await_completion(
        &self,
        token: &RunToken,
        req: &RunRequest,
    ) -> Result<RunOutcome, RunnerError> {
        let started = Instant::now();
        let wait_args = vec!["wait".to_string(), token.run_id.clone()];
        let wait = self.cli_output(&wait_args);

        let exit_code = match tokio::time::timeout(req.timeout, wait).await {
            Ok(output) => {
                let output = output?;
                String::from_utf8_lossy(&output.stdout).trim().parse().ok()
            }
            Err(_) => {
                tracing::warn!(
                    task_id = %req.task_id,
                    container = %token.run_id,
                    timeout = ?req.timeout,
                    "module run exceeded its ceiling, killing container"
                );
                let _ = self
                    .cli_output(&["kill".into(), token.run_id.clone()])
                    .await;
                let logs = self.logs(&token.run_id).await;
                return Ok(RunOutcome {
                    exit_code: None,
                    stdout: logs.0,
                    stderr: logs.1,
                    timed_out: true,
                    duration: started.elapsed(),
                });
            }
        };

        let (stdout, stderr) = self.logs(&token.run_id).await;
        Ok(RunOutcome {
            exit_code,
            stdout,
            stderr,
            timed_out: false,
            duration: started.elapsed(),
        })
    }

    async fn collect_output(
        &self,
        _token: &RunToken,
        req: &RunRequest,
    ) -> Result<Vec<PathBuf>, RunnerError> {
        list_output(&req.output_dir())
    }

    async fn cleanup(&self, token: RunToken, _req: &RunRequest) -> Result<(), RunnerError> {
        // Best effort; a missing container is fine
        let _ = self
            .cli_output(&["rm".into(), "-f".into(), token.run_id])
            .await;
        Ok(())
    }
}

impl ContainerEngine {
    /// Container stdout/stderr, best effort
    async fn logs(&self, name: &str) -> (String, String) {
        match self.cli_output(&["logs".into(), name.to_string()]).await {
            Ok(output) => (
                String::from_utf8_lossy(&output.stdout).to_string(),
                String::from_utf8_lossy(&output.stderr).to_string(),
            ),
            Err(_) => (String::new(), String::new()),
        }
    }
}
