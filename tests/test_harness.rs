//! Test harness for orchestrator integration tests.
//!
//! Provides a scripted in-memory executor, small pool/queue stacks with short
//! intervals, and helpers for waiting on job states.

#![allow(dead_code)]

use std::collections::{HashMap, HashSet, VecDeque};
use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use batch_lite::capacity::{CapacityHandle, InstanceClass, StaticSpotSignal};
use batch_lite::config::{OrchestratorConfig, PoolConfig, QueueConfig, SchedulerConfig};
use batch_lite::error::{BatchError, Result};
use batch_lite::scheduler::job::{FailureReason, JobId, JobRun, JobState};
use batch_lite::telemetry::TracingSink;
use batch_lite::worker::{ContainerSpec, ExecutionHandle, ExecutionStatus, Executor};
use batch_lite::Orchestrator;

/// What one launched container does.
#[derive(Debug, Clone)]
pub enum Scripted {
    Succeed,
    Fail {
        reason: String,
        exit_code: Option<i32>,
    },
    /// Keeps running until terminated.
    Hang,
    /// Keeps running until [`ScriptedExecutor::release`] is called for the job, then succeeds.
    Hold,
    /// The launch itself is rejected.
    LaunchError(String),
}

impl Scripted {
    pub fn fail(reason: &str) -> Self {
        Scripted::Fail {
            reason: reason.to_string(),
            exit_code: Some(1),
        }
    }
}

#[derive(Default)]
struct ExecutorState {
    scripts: HashMap<String, VecDeque<Scripted>>,
    executions: HashMap<Uuid, Scripted>,
    released: HashSet<String>,
    launched: Vec<ContainerSpec>,
    terminated: Vec<ExecutionHandle>,
}

/// Executor whose containers finish according to a per-job script.
///
/// Every launch pops the next entry scripted for the job; jobs without a
/// script (or with an exhausted one) succeed.
#[derive(Default)]
pub struct ScriptedExecutor {
    state: Mutex<ExecutorState>,
    running: AtomicUsize,
    max_running: AtomicUsize,
}

impl ScriptedExecutor {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn script(&self, job_id: &str, outcomes: impl IntoIterator<Item = Scripted>) {
        self.state
            .lock()
            .scripts
            .entry(job_id.to_string())
            .or_default()
            .extend(outcomes);
    }

    /// Let every held container of `job_id` finish successfully.
    pub fn release(&self, job_id: &str) {
        self.state.lock().released.insert(job_id.to_string());
    }

    pub fn launched(&self) -> Vec<ContainerSpec> {
        self.state.lock().launched.clone()
    }

    pub fn launches_for(&self, job_id: &str) -> usize {
        self.state
            .lock()
            .launched
            .iter()
            .filter(|spec| spec.job_id.as_str() == job_id)
            .count()
    }

    pub fn terminated(&self) -> usize {
        self.state.lock().terminated.len()
    }

    pub fn running(&self) -> usize {
        self.running.load(Ordering::SeqCst)
    }

    /// Highest number of containers that were running at the same time.
    pub fn max_running(&self) -> usize {
        self.max_running.load(Ordering::SeqCst)
    }

    fn stopped(&self) {
        self.running.fetch_sub(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl Executor for ScriptedExecutor {
    async fn launch(&self, spec: &ContainerSpec, handle: &CapacityHandle) -> Result<ExecutionHandle> {
        let scripted = {
            let mut state = self.state.lock();
            state.launched.push(spec.clone());
            state
                .scripts
                .get_mut(spec.job_id.as_str())
                .and_then(|queue| queue.pop_front())
                .unwrap_or(Scripted::Succeed)
        };
        if let Scripted::LaunchError(message) = scripted {
            return Err(BatchError::Executor(message));
        }

        let execution = ExecutionHandle {
            id: Uuid::new_v4(),
            job_id: spec.job_id.clone(),
            node_index: spec.node_index,
            instance_id: handle.instance_id.clone(),
            reference: format!("scripted-{}-{}", spec.job_id, spec.node_index),
        };
        self.state.lock().executions.insert(execution.id, scripted);
        let now = self.running.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_running.fetch_max(now, Ordering::SeqCst);
        Ok(execution)
    }

    async fn poll(&self, execution: &ExecutionHandle) -> Result<ExecutionStatus> {
        let (scripted, released) = {
            let state = self.state.lock();
            (
                state.executions.get(&execution.id).cloned(),
                state.released.contains(execution.job_id.as_str()),
            )
        };
        let status = match scripted {
            Some(Scripted::Hang) => return Ok(ExecutionStatus::Running),
            Some(Scripted::Hold) if !released => return Ok(ExecutionStatus::Running),
            Some(Scripted::Hold) => ExecutionStatus::Succeeded,
            Some(Scripted::Succeed) => ExecutionStatus::Succeeded,
            Some(Scripted::Fail { reason, exit_code }) => {
                ExecutionStatus::Failed(FailureReason::execution(reason, exit_code))
            }
            Some(Scripted::LaunchError(_)) | None => {
                return Err(BatchError::Executor(format!(
                    "unknown execution {}",
                    execution.reference
                )))
            }
        };
        if self.state.lock().executions.remove(&execution.id).is_some() {
            self.stopped();
        }
        Ok(status)
    }

    async fn terminate(&self, execution: &ExecutionHandle) -> Result<()> {
        let mut state = self.state.lock();
        state.terminated.push(execution.clone());
        if state.executions.remove(&execution.id).is_some() {
            drop(state);
            self.stopped();
        }
        Ok(())
    }
}

/// Scheduler settings with short intervals for faster tests
pub fn fast_scheduler() -> SchedulerConfig {
    SchedulerConfig {
        tick_interval_ms: 10,
        poll_interval_ms: 5,
        ..SchedulerConfig::default()
    }
}

/// One serverless pool of `max_vcpus` behind queue `q`.
pub fn fargate_config(max_vcpus: u32) -> OrchestratorConfig {
    let mut config = OrchestratorConfig::empty()
        .with_pool(PoolConfig::fargate("fargate", max_vcpus))
        .with_queue(QueueConfig::new("q", 1).with_pool("fargate", 1));
    config.scheduler = fast_scheduler();
    config
}

/// One instance pool of 2-vCPU instances behind queue `q`.
pub fn ec2_config(max_vcpus: u32) -> OrchestratorConfig {
    let mut config = OrchestratorConfig::empty()
        .with_pool(
            PoolConfig::ec2("ec2", 0, max_vcpus)
                .with_class(InstanceClass::new("c7a.large", 2, 4096)),
        )
        .with_queue(QueueConfig::new("q", 1).with_pool("ec2", 1));
    config.scheduler = fast_scheduler();
    config
}

pub fn orchestrator(config: OrchestratorConfig, executor: Arc<ScriptedExecutor>) -> Orchestrator {
    Orchestrator::new(
        config,
        executor,
        Arc::new(StaticSpotSignal::default()),
        Arc::new(TracingSink),
    )
    .expect("test configuration is valid")
}

/// An orchestrator with its control loop running in the background.
pub struct TestCluster {
    pub orchestrator: Orchestrator,
    pub executor: Arc<ScriptedExecutor>,
    shutdown: CancellationToken,
    handle: JoinHandle<()>,
}

impl TestCluster {
    pub fn start(config: OrchestratorConfig) -> Self {
        let executor = ScriptedExecutor::new();
        let orchestrator = orchestrator(config, executor.clone());
        let shutdown = CancellationToken::new();

        let control = orchestrator.clone();
        let token = shutdown.clone();
        let handle = tokio::spawn(async move {
            control.run(token).await.expect("control loop runs once");
        });

        Self {
            orchestrator,
            executor,
            shutdown,
            handle,
        }
    }

    pub fn status(&self, id: &str) -> JobRun {
        self.orchestrator
            .get_job_status(&JobId::from(id))
            .expect("job exists")
    }

    pub async fn wait_for_state(&self, id: &str, state: JobState) -> bool {
        wait_for_state(&self.orchestrator, id, state, Duration::from_secs(5)).await
    }

    pub async fn shutdown(self) {
        self.shutdown.cancel();
        let _ = self.handle.await;
    }
}

pub async fn wait_for_state(
    orchestrator: &Orchestrator,
    id: &str,
    state: JobState,
    timeout_duration: Duration,
) -> bool {
    let id = JobId::from(id);
    wait_for(
        || {
            let current = orchestrator.get_job_status(&id).map(|r| r.state).ok();
            async move { current == Some(state) }
        },
        timeout_duration,
        Duration::from_millis(5),
    )
    .await
}

/// Wait for a condition to become true with timeout
pub async fn wait_for<F, Fut>(
    condition: F,
    timeout_duration: Duration,
    poll_interval: Duration,
) -> bool
where
    F: Fn() -> Fut,
    Fut: Future<Output = bool>,
{
    let start = tokio::time::Instant::now();
    while start.elapsed() < timeout_duration {
        if condition().await {
            return true;
        }
        tokio::time::sleep(poll_interval).await;
    }
    false
}

/// Assert a condition eventually becomes true
pub async fn assert_eventually<F, Fut>(condition: F, timeout_duration: Duration, message: &str)
where
    F: Fn() -> Fut,
    Fut: Future<Output = bool>,
{
    let result = wait_for(condition, timeout_duration, Duration::from_millis(5)).await;
    assert!(result, "{}", message);
}
