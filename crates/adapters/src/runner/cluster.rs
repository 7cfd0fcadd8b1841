// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Cluster scheduler backend
//!
//! Renders a batch job definition from a template and submits it through the
//! scheduler CLI. Placement constraints from the module configuration are
//! passed through opaquely; the local container backend ignores them.

use super::{
    list_output, stage_input, ProcessRunner, RunOutcome, RunRequest, RunToken, RunnerError,
    TokenHandle, CONTAINER_IN_DIR, CONTAINER_OUT_DIR, ENV_IN_DIR, ENV_OUT_DIR,
};
use async_trait::async_trait;
use minijinja::{context, Environment};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::process::Output;
use std::time::{Duration, Instant};
use tokio::process::Command;

/// Default job definition handed to the scheduler CLI
const JOB_TEMPLATE: &str = r#"job "{{ job_id }}" {
  type = "batch"
{% for key, value in constraints|items %}
  constraint {
    attribute = "{{ key }}"
    value     = "{{ value }}"
  }
{% endfor %}
  group "processor" {
    reschedule {
      attempts  = 0
      unlimited = false
    }
    task "module" {
      driver = "docker"
      config {
        image = "{{ image }}"
        volumes = [
          "{{ in_dir }}:{{ container_in }}",
          "{{ out_dir }}:{{ container_out }}",
        ]
{% if gpu %}
        gpus = "all"
{% endif %}
      }
      env {
{% for key, value in environment|items %}
        {{ key }} = "{{ value }}"
{% endfor %}
      }
      resources {
        memory = {{ memory_mb }}
        cpu    = {{ cpu_mhz }}
      }
    }
  }
}
"#;

/// Rendered job file inside the task directory (dot-file, not payload)
const JOB_FILE: &str = ".job.nomad";

/// Backend submitting module runs to the cluster scheduler CLI
#[derive(Clone, Debug)]
pub struct ClusterScheduler {
    cli: String,
    template: String,
    poll_interval: Duration,
}

impl Default for ClusterScheduler {
    fn default() -> Self {
        Self {
            cli: "nomad".to_string(),
            template: JOB_TEMPLATE.to_string(),
            poll_interval: Duration::from_secs(2),
        }
    }
}

impl ClusterScheduler {
    /// Replace the built-in job template (site-specific deployments)
    pub fn with_template(mut self, template: impl Into<String>) -> Self {
        self.template = template.into();
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
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

    fn render_job(&self, req: &RunRequest, job_id: &str) -> Result<String, RunnerError> {
        let mut environment: BTreeMap<String, String> = req.module.environment.clone();
        environment.insert(ENV_IN_DIR.to_string(), CONTAINER_IN_DIR.to_string());
        environment.insert(ENV_OUT_DIR.to_string(), CONTAINER_OUT_DIR.to_string());

        let env = Environment::new();
        let template = env.template_from_str(&self.template)?;
        let rendered = template.render(context! {
            job_id => job_id,
            image => req.module.image,
            in_dir => req.input_dir().display().to_string(),
            out_dir => req.output_dir().display().to_string(),
            container_in => CONTAINER_IN_DIR,
            container_out => CONTAINER_OUT_DIR,
            environment => environment,
            constraints => req.module.constraints,
            gpu => req.module.gpu,
            memory_mb => req.module.resources.memory_mb.unwrap_or(512),
            cpu_mhz => req.module.resources.cpus.map(|c| (c * 1000.0) as u64).unwrap_or(500),
        })?;
        Ok(rendered)
    }

    /// One status poll; `Some(failed)` once the job reached a dead state
    async fn job_finished(&self, job_id: &str) -> Result<Option<bool>, RunnerError> {
        let status = self
            .cli_output(&["job".into(), "status".into(), "-short".into(), job_id.into()])
            .await?;
        let text = String::from_utf8_lossy(&status.stdout);
        if !job_is_dead(&text) {
            return Ok(None);
        }

        let allocs = self
            .cli_output(&["job".into(), "allocs".into(), "-json".into(), job_id.into()])
            .await?;
        Ok(Some(any_alloc_failed(&String::from_utf8_lossy(
            &allocs.stdout,
        ))))
    }

    /// Allocation stdout/stderr, best effort
    async fn logs(&self, job_id: &str) -> (String, String) {
        let stdout = self
            .cli_output(&["alloc".into(), "logs".into(), "-job".into(), job_id.into()])
            .await
            .map(|o| String::from_utf8_lossy(&o.stdout).to_string())
            .unwrap_or_default();
        let stderr = self
            .cli_output(&[
                "alloc".into(),
                "logs".into(),
                "-stderr".into(),
                "-job".into(),
                job_id.into(),
            ])
            .await
            .map(|o| String::from_utf8_lossy(&o.stdout).to_string())
            .unwrap_or_default();
        (stdout, stderr)
    }

    async fn stop_job(&self, job_id: &str) {
        let _ = self
            .cli_output(&["job".into(), "stop".into(), "-purge".into(), job_id.into()])
            .await;
    }
}

/// `job status -short` prints a `Status = <state>` line
fn job_is_dead(status_output: &str) -> bool {
    status_output.lines().any(|line| {
        let mut parts = line.splitn(2, '=');
        matches!(
            (parts.next().map(str::trim), parts.next().map(str::trim)),
            (Some("Status"), Some("dead"))
        )
    })
}

/// `job allocs -json` returns an array with a ClientStatus per allocation
fn any_alloc_failed(allocs_json: &str) -> bool {
    let Ok(allocs) = serde_json::from_str::<serde_json::Value>(allocs_json) else {
        // No parseable allocation list: treat the run as failed rather
        // than reporting success blindly
        return true;
    };
    match allocs.as_array() {
        Some(list) if !list.is_empty() => list
            .iter()
            .any(|alloc| alloc.get("ClientStatus").and_then(|s| s.as_str()) == Some("failed")),
        _ => true,
    }
}

#[async_trait]
impl ProcessRunner for ClusterScheduler {
    async fn prepare(&self, req: &RunRequest) -> Result<(), RunnerError> {
        if req.module.image.is_empty() {
            return Err(RunnerError::MissingImage);
        }
        stage_input(&req.work_dir)
    }

    async fn start(&self, req: &RunRequest) -> Result<RunToken, RunnerError> {
        let job_id = format!("radroute-{}", uuid::Uuid::new_v4().simple());
        let rendered = self.render_job(req, &job_id)?;

        let job_file = req.work_dir.join(JOB_FILE);
        std::fs::write(&job_file, &rendered).map_err(|source| RunnerError::Io {
            path: job_file.clone(),
            source,
        })?;

        tracing::info!(
            task_id = %req.task_id,
            module = %req.module_name,
            image = %req.module.image,
            job = %job_id,
            "submitting module job to scheduler"
        );

        let output = self
            .cli_output(&[
                "job".into(),
                "run".into(),
                "-detach".into(),
                job_file.display().to_string(),
            ])
            .await?;
        if !output.status.success() {
            return Err(RunnerError::CommandFailed {
                command: format!("{} job run", self.cli),
                stderr: String::from_utf8_lossy(&output.stderr).to_string(),
            });
        }

        Ok(RunToken {
            run_id: job_id.clone(),
            handle: TokenHandle::ClusterJob { job_id },
        })
    }

    async fn await_completion(
        &self,
        token: &RunToken,
        req: &RunRequest,
    ) -> Result<RunOutcome, RunnerError> {
        let job_id = match &token.handle {
            TokenHandle::ClusterJob { job_id } => job_id.as_str(),
            _ => token.run_id.as_str(),
        };
        let started = Instant::now();
        let poll = async {
            loop {
                if let Some(failed) = self.job_finished(job_id).await? {
                    return Ok::<bool, RunnerError>(failed);
                }
                tokio::time::sleep(self.poll_interval).await;
            }
        };

        match tokio::time::timeout(req.timeout, poll).await {
            Ok(failed) => {
                let failed = failed?;
                let (stdout, stderr) = self.logs(&token.run_id).await;
                Ok(RunOutcome {
                    // The scheduler does not expose the raw exit code;
                    // a failed allocation maps to 1
                    exit_code: Some(i32::from(failed)),
                    stdout,
                    stderr,
                    timed_out: false,
                    duration: started.elapsed(),
                })
            }
            Err(_) => {
                tracing::warn!(
                    task_id = %req.task_id,
                    job = %token.run_id,
                    timeout = ?req.timeout,
                    "module job exceeded its ceiling, stopping it"
                );
                self.stop_job(&token.run_id).await;
                let (stdout, stderr) = self.logs(&token.run_id).await;
                Ok(RunOutcome {
                    exit_code: None,
                    stdout,
                    stderr,
                    timed_out: true,
                    duration: started.elapsed(),
                })
            }
        }
    }

    async fn collect_output(
        &self,
        _token: &RunToken,
        req: &RunRequest,
    ) -> Result<Vec<PathBuf>, RunnerError> {
        list_output(&req.output_dir())
    }

    async fn cleanup(&self, token: RunToken, req: &RunRequest) -> Result<(), RunnerError> {
        self.stop_job(&token.run_id).await;
        let job_file = req.work_dir.join(JOB_FILE);
        if job_file.exists() {
            let _ = std::fs::remove_file(&job_file);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use radroute_core::task::TaskId;
    use radroute_rules::{Module, Resources};

    fn request() -> RunRequest {
        let mut constraints = BTreeMap::new();
        constraints.insert("node.class".to_string(), "gpu-pool".to_string());
        let mut environment = BTreeMap::new();
        environment.insert("MODEL".to_string(), "v3".to_string());

        RunRequest {
            task_id: TaskId::from("t-1"),
            module_name: "denoise".to_string(),
            module: Module {
                image: "vendor/denoise:1.2".to_string(),
                environment,
                constraints,
                gpu: true,
                resources: Resources {
                    memory_mb: Some(4096),
                    cpus: Some(2.0),
                },
                ..Default::default()
            },
            work_dir: PathBuf::from("/data/processing/t-1"),
            timeout: Duration::from_secs(60),
        }
    }

    #[test]
    fn rendered_job_carries_constraints_opaquely() {
        let scheduler = ClusterScheduler::default();
        let job = scheduler.render_job(&request(), "radroute-abc").unwrap();

        assert!(job.contains(r#"job "radroute-abc""#));
        assert!(job.contains(r#"image = "vendor/denoise:1.2""#));
        assert!(job.contains(r#"attribute = "node.class""#));
        assert!(job.contains(r#"value     = "gpu-pool""#));
        assert!(job.contains(r#"MODEL = "v3""#));
        assert!(job.contains(&format!("{} = \"{}\"", ENV_IN_DIR, CONTAINER_IN_DIR)));
        assert!(job.contains("memory = 4096"));
        assert!(job.contains("cpu    = 2000"));
        assert!(job.contains(r#"gpus = "all""#));
    }

    #[test]
    fn resource_defaults_apply_when_unset() {
        let mut req = request();
        req.module.resources = Resources::default();
        req.module.gpu = false;

        let job = ClusterScheduler::default()
            .render_job(&req, "radroute-abc")
            .unwrap();
        assert!(job.contains("memory = 512"));
        assert!(job.contains("cpu    = 500"));
        assert!(!job.contains("gpus"));
    }

    #[test]
    fn status_parsing_detects_dead_jobs() {
        let running = "ID = radroute-x\nStatus = running\n";
        let dead = "ID            = radroute-x\nStatus        = dead\n";
        assert!(!job_is_dead(running));
        assert!(job_is_dead(dead));
    }

    #[test]
    fn alloc_parsing_flags_failures() {
        let ok = r#"[{"ID": "a1", "ClientStatus": "complete"}]"#;
        let failed = r#"[{"ID": "a1", "ClientStatus": "complete"}, {"ID": "a2", "ClientStatus": "failed"}]"#;
        assert!(!any_alloc_failed(ok));
        assert!(any_alloc_failed(failed));
        // An empty or unreadable allocation list never reports success
        assert!(any_alloc_failed("[]"));
        assert!(any_alloc_failed("not json"));
    }
}
