use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use dashmap::DashMap;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::capacity::{CapacityHandle, PoolManager};
use crate::error::Result;
use crate::scheduler::job::{FailureCode, FailureReason, JobId, JobRun, JobState};
use crate::scheduler::placement::Placement;
use crate::scheduler::store::JobStore;
use crate::worker::executor::{ContainerSpec, ExecutionHandle, ExecutionStatus, Executor};

/// How one attempt ended, after the retry policy was applied.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AttemptOutcome {
    Succeeded,
    /// Back to RUNNABLE; the run must be re-enqueued.
    Retry(FailureReason),
    Failed(FailureReason),
    /// The run was cancelled while the attempt was in flight.
    Cancelled,
}

#[derive(Debug, Clone)]
pub enum SupervisorEvent {
    /// Every node of the attempt was launched and the run is RUNNING.
    Started { job_id: JobId, attempt: u32 },
    Finished {
        job_id: JobId,
        attempt: u32,
        outcome: AttemptOutcome,
    },
}

enum Launch {
    Started(Vec<ExecutionHandle>),
    Failed(FailureReason),
    Cancelled,
}

enum Termination {
    Finished(Option<FailureReason>, Option<i32>),
    Cancelled,
}

/// Environment every container of an attempt receives.
pub fn job_environment(
    run: &JobRun,
    attempt: u32,
    node_offset: u32,
    handles: &[CapacityHandle],
) -> BTreeMap<String, String> {
    let mut env = run.spec.environment.clone();
    env.insert("BATCH_JOB_ID".to_string(), run.job_id.to_string());
    env.insert("BATCH_JOB_ATTEMPT".to_string(), attempt.to_string());
    if let Some(index) = run.array_index() {
        env.insert("BATCH_JOB_ARRAY_INDEX".to_string(), index.to_string());
    }
    if let Some(range) = run.spec.node_range {
        env.insert(
            "BATCH_JOB_NODE_INDEX".to_string(),
            (range.start_node + node_offset).to_string(),
        );
        env.insert(
            "BATCH_JOB_MAIN_NODE_INDEX".to_string(),
            range.start_node.to_string(),
        );
        env.insert(
            "BATCH_JOB_NUM_NODES".to_string(),
            range.node_count().to_string(),
        );
        if let Some(main) = handles.first() {
            env.insert(
                "BATCH_JOB_MAIN_NODE_INSTANCE".to_string(),
                main.instance_id.clone(),
            );
        }
    }
    env
}

/// Runs one task per in-flight attempt.
pub struct ExecutionSupervisor {
    store: Arc<JobStore>,
    pools: Arc<PoolManager>,
    executor: Arc<dyn Executor>,
    poll_interval: Duration,
    events: mpsc::UnboundedSender<SupervisorEvent>,
    tokens: DashMap<JobId, CancellationToken>,
}

impl ExecutionSupervisor {
    pub fn new(
        store: Arc<JobStore>,
        pools: Arc<PoolManager>,
        executor: Arc<dyn Executor>,
        poll_interval: Duration,
        events: mpsc::UnboundedSender<SupervisorEvent>,
    ) -> Self {
        Self {
            store,
            pools,
            executor,
            poll_interval,
            events,
            tokens: DashMap::new(),
        }
    }

    /// Start supervising a placed run. The attempt stops early when either
    /// the run is cancelled or `shutdown` fires.
    pub fn spawn(self: &Arc<Self>, placement: Placement, shutdown: &CancellationToken) -> JoinHandle<()> {
        let token = shutdown.child_token();
        self.tokens.insert(placement.job_id.clone(), token.clone());

        let supervisor = Arc::clone(self);
        tokio::spawn(async move {
            let job_id = placement.job_id.clone();
            let (attempt, outcome) = match supervisor.supervise(&placement, &token).await {
                Ok(result) => result,
                Err(e) => {
                    tracing::error!(job_id = %job_id, error = %e, "Supervision failed");
                    supervisor.release(&job_id);
                    (0, AttemptOutcome::Cancelled)
                }
            };
            supervisor.tokens.remove(&job_id);
            let _ = supervisor.events.send(SupervisorEvent::Finished {
                job_id,
                attempt,
                outcome,
            });
        })
    }

    /// Fire the cancellation token of an in-flight run.
    pub fn cancel(&self, job_id: &JobId) -> bool {
        match self.tokens.get(job_id) {
            Some(token) => {
                token.cancel();
                true
            }
            None => false,
        }
    }

    pub fn in_flight(&self) -> usize {
        self.tokens.len()
    }

    fn release(&self, job_id: &JobId) {
        if let Ok(handles) = self.store.take_handles(job_id) {
            self.pools.release_all(&handles);
        }
    }

    async fn supervise(
        &self,
        placement: &Placement,
        token: &CancellationToken,
    ) -> Result<(u32, AttemptOutcome)> {
        let job_id = &placement.job_id;
        let claimed = self.store.get(job_id)?;
        if token.is_cancelled() || claimed.state != JobState::Starting {
            tracing::debug!(job_id = %job_id, state = %claimed.state, "Run stopped before launch");
            self.release(job_id);
            return Ok((claimed.attempt_count(), AttemptOutcome::Cancelled));
        }

        let attempt = self.store.begin_attempt(job_id, Utc::now())?;
        let run = self.store.get(job_id)?;

        let executions = match self.launch_all(&run, attempt, &placement.handles, token).await {
            Launch::Started(executions) => executions,
            Launch::Failed(failure) => {
                tracing::warn!(job_id = %job_id, attempt, reason = %failure.message, "Launch failed");
                let outcome = self.conclude(&run, attempt, Some(failure), None)?;
                return Ok((attempt, outcome));
            }
            Launch::Cancelled => {
                self.release(job_id);
                self.store
                    .finish_attempt(job_id, None, Some(cancelled()), Utc::now())?;
                return Ok((attempt, AttemptOutcome::Cancelled));
            }
        };

        if self
            .store
            .transition(job_id, JobState::Running, None)
            .is_err()
        {
            self.terminate_all(&executions).await;
            self.release(job_id);
            self.store
                .finish_attempt(job_id, None, Some(cancelled()), Utc::now())?;
            return Ok((attempt, AttemptOutcome::Cancelled));
        }
        let _ = self.events.send(SupervisorEvent::Started {
            job_id: job_id.clone(),
            attempt,
        });

        let termination = self.watch(&run, &executions, token).await;
        let outcome = match termination {
            Termination::Cancelled => {
                self.terminate_all(&executions).await;
                self.release(job_id);
                self.store
                    .finish_attempt(job_id, None, Some(cancelled()), Utc::now())?;
                AttemptOutcome::Cancelled
            }
            Termination::Finished(failure, exit_code) => {
                self.conclude(&run, attempt, failure, exit_code)?
            }
        };
        Ok((attempt, outcome))
    }

    async fn launch_all(
        &self,
        run: &JobRun,
        attempt: u32,
        handles: &[CapacityHandle],
        token: &CancellationToken,
    ) -> Launch {
        let mut executions = Vec::with_capacity(handles.len());
        for (offset, handle) in handles.iter().enumerate() {
            if token.is_cancelled() {
                self.terminate_all(&executions).await;
                return Launch::Cancelled;
            }
            let spec = ContainerSpec {
                job_id: run.job_id.clone(),
                attempt,
                node_index: offset as u32,
                image: run.spec.image.clone(),
                command: run.spec.command.clone(),
                environment: job_environment(run, attempt, offset as u32, handles),
                resources: run.spec.resources,
            };
            match self.executor.launch(&spec, handle).await {
                Ok(execution) => executions.push(execution),
                Err(e) => {
                    self.terminate_all(&executions).await;
                    return Launch::Failed(FailureReason::new(FailureCode::LaunchFailed, e.to_string()));
                }
            }
        }
        Launch::Started(executions)
    }

    /// Poll until every node finished, one node failed, the timeout passed
    /// or the token fired.
    async fn watch(
        &self,
        run: &JobRun,
        executions: &[ExecutionHandle],
        token: &CancellationToken,
    ) -> Termination {
        let timeout = run.spec.timeout();
        let deadline = async move {
            match timeout {
                Some(limit) => tokio::time::sleep(limit).await,
                None => std::future::pending::<()>().await,
            }
        };
        tokio::pin!(deadline);

        let mut finished = vec![false; executions.len()];
        loop {
            tokio::select! {
                _ = token.cancelled() => return Termination::Cancelled,
                _ = &mut deadline => {
                    tracing::warn!(job_id = %run.job_id, "Attempt timed out");
                    self.terminate_all(executions).await;
                    return Termination::Finished(Some(FailureReason::timeout()), None);
                }
                _ = tokio::time::sleep(self.poll_interval) => {}
            }

            let mut last_exit = None;
            for (index, execution) in executions.iter().enumerate() {
                if finished[index] {
                    continue;
                }
                match self.executor.poll(execution).await {
                    Ok(ExecutionStatus::Running) => {}
                    Ok(ExecutionStatus::Succeeded) => {
                        finished[index] = true;
                        last_exit = Some(0);
                    }
                    Ok(ExecutionStatus::Failed(failure)) => {
                        self.terminate_all(executions).await;
                        let exit_code = failure.exit_code;
                        return Termination::Finished(Some(failure), exit_code);
                    }
                    Err(e) => {
                        tracing::warn!(job_id = %run.job_id, node = execution.node_index, error = %e, "Poll failed");
                        self.terminate_all(executions).await;
                        return Termination::Finished(
                            Some(FailureReason::execution(e.to_string(), None)),
                            None,
                        );
                    }
                }
            }
            if finished.iter().all(|f| *f) {
                return Termination::Finished(None, last_exit.or(Some(0)));
            }
        }
    }

    async fn terminate_all(&self, executions: &[ExecutionHandle]) {
        for execution in executions {
            if let Err(e) = self.executor.terminate(execution).await {
                tracing::debug!(job_id = %execution.job_id, node = execution.node_index, error = %e, "Terminate failed");
            }
        }
    }

    /// Release capacity, close the attempt and apply the retry policy.
    fn conclude(
        &self,
        run: &JobRun,
        attempt: u32,
        failure: Option<FailureReason>,
        exit_code: Option<i32>,
    ) -> Result<AttemptOutcome> {
        let job_id = &run.job_id;
        self.release(job_id);
        let now = Utc::now();
        self.store
            .finish_attempt(job_id, exit_code, failure.clone(), now)?;

        let outcome = match failure {
            None => match self.store.transition_at(job_id, JobState::Succeeded, None, now) {
                Ok(_) => AttemptOutcome::Succeeded,
                Err(_) => AttemptOutcome::Cancelled,
            },
            Some(failure) if run.spec.retry.should_retry(&failure, attempt) => {
                match self.store.transition_at(
                    job_id,
                    JobState::Runnable,
                    Some(failure.message.clone()),
                    now,
                ) {
                    Ok(_) => {
                        tracing::info!(job_id = %job_id, attempt, reason = %failure.message, "Retrying job");
                        AttemptOutcome::Retry(failure)
                    }
                    Err(_) => AttemptOutcome::Cancelled,
                }
            }
            Some(failure) => match self.store.fail_at(job_id, JobState::Failed, failure.clone(), now) {
                Ok(_) => AttemptOutcome::Failed(failure),
                Err(_) => AttemptOutcome::Cancelled,
            },
        };
        Ok(outcome)
    }
}

fn cancelled() -> FailureReason {
    FailureReason::new(FailureCode::Cancelled, "Cancelled while running")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduler::job::{JobSpec, RunKind};

    fn handle(instance: &str) -> CapacityHandle {
        CapacityHandle {
            id: uuid::Uuid::new_v4(),
            pool: "pool".to_string(),
            instance_id: instance.to_string(),
            instance_class: "c7a.large".to_string(),
            vcpus: 1,
            memory_mib: 1024,
            spot: false,
        }
    }

    #[test]
    fn multi_node_environment_names_the_main_node() {
        let spec = JobSpec::new("mnp", "q", "alpine", "true").with_nodes(0, 2);
        let run = JobRun::new(JobId::from("mnp"), spec, RunKind::MultiNode { nodes: 3 }, 1);
        let handles = vec![handle("i-a"), handle("i-b"), handle("i-c")];

        let env = job_environment(&run, 2, 1, &handles);
        assert_eq!(env["BATCH_JOB_ID"], "mnp");
        assert_eq!(env["BATCH_JOB_ATTEMPT"], "2");
        assert_eq!(env["BATCH_JOB_NODE_INDEX"], "1");
        assert_eq!(env["BATCH_JOB_MAIN_NODE_INDEX"], "0");
        assert_eq!(env["BATCH_JOB_NUM_NODES"], "3");
        assert_eq!(env["BATCH_JOB_MAIN_NODE_INSTANCE"], "i-a");
        assert!(!env.contains_key("BATCH_JOB_ARRAY_INDEX"));
    }

    #[test]
    fn array_child_environment_carries_index() {
        let spec = JobSpec::new("arr", "q", "alpine", "true")
            .with_array_size(4)
            .with_env("MODE", "cpu");
        let run = JobRun::new(
            JobId::from("arr:2"),
            spec,
            RunKind::ArrayChild {
                parent: JobId::from("arr"),
                index: 2,
            },
            1,
        );
        let env = job_environment(&run, 1, 0, &[handle("i-a")]);
        assert_eq!(env["BATCH_JOB_ID"], "arr:2");
        assert_eq!(env["BATCH_JOB_ARRAY_INDEX"], "2");
        assert_eq!(env["MODE"], "cpu");
        assert!(!env.contains_key("BATCH_JOB_NUM_NODES"));
    }
}
