use std::collections::BTreeMap;
use std::process::Stdio;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::process::Command;
use uuid::Uuid;

use crate::capacity::CapacityHandle;
use crate::config::SandboxConfig;
use crate::error::{BatchError, Result};
use crate::scheduler::job::{FailureReason, JobId, ResourceRequest};

/// What to start on one capacity handle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContainerSpec {
    pub job_id: JobId,
    pub attempt: u32,
    pub node_index: u32,
    pub image: String,
    pub command: String,
    pub environment: BTreeMap<String, String>,
    pub resources: ResourceRequest,
}

/// A launched workload, as returned by [`Executor::launch`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionHandle {
    pub id: Uuid,
    pub job_id: JobId,
    pub node_index: u32,
    pub instance_id: String,
    /// Executor-specific reference, e.g. a container name
    pub reference: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExecutionStatus {
    Running,
    Succeeded,
    Failed(FailureReason),
}

impl ExecutionStatus {
    pub fn is_finished(&self) -> bool {
        !matches!(self, ExecutionStatus::Running)
    }
}

/// Starts, observes and stops workloads on claimed capacity.
#[async_trait]
pub trait Executor: Send + Sync {
    async fn launch(&self, spec: &ContainerSpec, handle: &CapacityHandle) -> Result<ExecutionHandle>;

    async fn poll(&self, execution: &ExecutionHandle) -> Result<ExecutionStatus>;

    async fn terminate(&self, execution: &ExecutionHandle) -> Result<()>;
}

const OOM_MESSAGE: &str = "OutOfMemoryError: Container killed due to memory usage";
const EXITED_MESSAGE: &str = "Essential container in task exited";

/// Runs workloads as detached, sandboxed Docker containers.
///
/// Every container gets:
/// - Network isolation (unless disabled in config)
/// - Dropped capabilities and no privilege escalation
/// - Read-only root filesystem
/// - CPU and memory limits taken from the job's resource request
#[derive(Debug, Clone)]
pub struct DockerExecutor {
    config: SandboxConfig,
}

impl DockerExecutor {
    pub fn new(config: SandboxConfig) -> Self {
        Self { config }
    }

    fn container_name(spec: &ContainerSpec, id: Uuid) -> String {
        let job = spec.job_id.as_str().replace(':', "-");
        format!("batch-{}-{}-{}", job, spec.node_index, id.simple())
    }

    fn run_args(&self, spec: &ContainerSpec, name: &str) -> Vec<String> {
        let mut args = vec![
            "run".to_string(),
            "-d".to_string(),
            format!("--name={}", name),
        ];

        if self.config.network_disabled {
            args.push("--network=none".to_string());
        }
        args.push(format!("--cpus={}", spec.resources.vcpus));
        args.push(format!("--memory={}m", spec.resources.memory_mib));

        if self.config.drop_capabilities {
            args.push("--cap-drop=ALL".to_string());
            args.push("--security-opt=no-new-privileges".to_string());
        }
        if self.config.read_only_root {
            args.push("--read-only".to_string());
        }

        for (key, value) in &spec.environment {
            args.push("-e".to_string());
            args.push(format!("{}={}", key, value));
        }

        args.push(spec.image.clone());
        args.push("sh".to_string());
        args.push("-c".to_string());
        args.push(spec.command.clone());
        args
    }

    async fn docker(&self, args: &[String]) -> Result<String> {
        let result = Command::new(&self.config.docker_binary)
            .args(args)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .await;
        Self::process_output(result)
    }

    fn process_output(result: std::io::Result<std::process::Output>) -> Result<String> {
        let output = result?;
        let stdout = String::from_utf8_lossy(&output.stdout).trim().to_string();
        if output.status.success() {
            return Ok(stdout);
        }
        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
        Err(BatchError::Executor(if stderr.is_empty() {
            format!("docker exited with {:?}", output.status.code())
        } else {
            stderr
        }))
    }

    /// Parse `docker inspect` output formatted as `<status> <exit code> <oom killed>`.
    fn parse_inspect(output: &str) -> Result<ExecutionStatus> {
        let mut fields = output.split_whitespace();
        let (Some(status), Some(exit_code), Some(oom)) = (fields.next(), fields.next(), fields.next())
        else {
            return Err(BatchError::Executor(format!(
                "unexpected inspect output: {}",
                output
            )));
        };
        let exit_code: i32 = exit_code
            .parse()
            .map_err(|_| BatchError::Executor(format!("bad exit code: {}", exit_code)))?;

        match status {
            "created" | "running" | "restarting" | "paused" => Ok(ExecutionStatus::Running),
            "exited" | "dead" | "removing" => {
                if oom == "true" {
                    Ok(ExecutionStatus::Failed(FailureReason::execution(
                        OOM_MESSAGE,
                        Some(exit_code),
                    )))
                } else if exit_code == 0 {
                    Ok(ExecutionStatus::Succeeded)
                } else {
                    Ok(ExecutionStatus::Failed(FailureReason::execution(
                        EXITED_MESSAGE,
                        Some(exit_code),
                    )))
                }
            }
            other => Err(BatchError::Executor(format!(
                "unknown container status: {}",
                other
            ))),
        }
    }
}

#[async_trait]
impl Executor for DockerExecutor {
    async fn launch(&self, spec: &ContainerSpec, handle: &CapacityHandle) -> Result<ExecutionHandle> {
        let id = Uuid::new_v4();
        let name = Self::container_name(spec, id);
        tracing::info!(
            job_id = %spec.job_id,
            attempt = spec.attempt,
            node = spec.node_index,
            image = %spec.image,
            instance = %handle.instance_id,
            "Launching container"
        );

        self.docker(&self.run_args(spec, &name)).await?;
        Ok(ExecutionHandle {
            id,
            job_id: spec.job_id.clone(),
            node_index: spec.node_index,
            instance_id: handle.instance_id.clone(),
            reference: name,
        })
    }

    async fn poll(&self, execution: &ExecutionHandle) -> Result<ExecutionStatus> {
        let args = vec![
            "inspect".to_string(),
            "--format".to_string(),
            "{{.State.Status}} {{.State.ExitCode}} {{.State.OOMKilled}}".to_string(),
            execution.reference.clone(),
        ];
        let status = Self::parse_inspect(&self.docker(&args).await?)?;
        if status.is_finished() {
            if let Err(e) = self.terminate(execution).await {
                tracing::warn!(job_id = %execution.job_id, error = %e, "Failed to remove container");
            }
        }
        Ok(status)
    }

    async fn terminate(&self, execution: &ExecutionHandle) -> Result<()> {
        let args = vec![
            "rm".to_string(),
            "-f".to_string(),
            execution.reference.clone(),
        ];
        self.docker(&args).await.map(|_| ())
    }
}
