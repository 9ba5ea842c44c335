use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::capacity::{PoolManager, PoolSummary, SpotSignal};
use crate::config::OrchestratorConfig;
use crate::error::{BatchError, Result};
use crate::scheduler::job::{
    Dependency, FailureCode, FailureReason, JobId, JobRun, JobSpec, JobState,
};
use crate::scheduler::{
    DependencyCoordinator, JobQueue, JobStore, QueueSummary, Scheduler, TickReport,
};
use crate::telemetry::EventSink;
use crate::worker::{AttemptOutcome, ExecutionSupervisor, Executor, SupervisorEvent};

/// Submission that instantiates a configured job definition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DefinitionSubmission {
    pub id: JobId,
    pub queue: String,
    pub definition: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command: Option<String>,
    #[serde(default)]
    pub array_size: u32,
    #[serde(default)]
    pub priority: i32,
    #[serde(default)]
    pub environment: BTreeMap<String, String>,
    #[serde(default)]
    pub dependencies: Vec<Dependency>,
    #[serde(default)]
    pub fail_fast: bool,
}

impl DefinitionSubmission {
    pub fn new(
        id: impl Into<JobId>,
        queue: impl Into<String>,
        definition: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            queue: queue.into(),
            definition: definition.into(),
            command: None,
            array_size: 0,
            priority: 0,
            environment: BTreeMap::new(),
            dependencies: Vec::new(),
            fail_fast: false,
        }
    }
}

/// Body accepted by the submit endpoint: a full spec or a definition reference.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum SubmitRequest {
    Definition(DefinitionSubmission),
    Spec(JobSpec),
}

struct Inner {
    config: OrchestratorConfig,
    store: Arc<JobStore>,
    pools: Arc<PoolManager>,
    deps: Arc<DependencyCoordinator>,
    scheduler: Scheduler,
    supervisor: Arc<ExecutionSupervisor>,
    events: Mutex<Option<mpsc::UnboundedReceiver<SupervisorEvent>>>,
    /// Parent of every supervisor token; fired when the control loop exits.
    shutdown: CancellationToken,
}

/// Wires the store, queues, pools, scheduler, supervisor and dependency
/// coordinator together and exposes the public job interface.
#[derive(Clone)]
pub struct Orchestrator {
    inner: Arc<Inner>,
}

impl Orchestrator {
    pub fn new(
        config: OrchestratorConfig,
        executor: Arc<dyn Executor>,
        spot_signal: Arc<dyn SpotSignal>,
        sink: Arc<dyn EventSink>,
    ) -> Result<Self> {
        config.validate()?;

        let store = Arc::new(JobStore::with_capacity(config.scheduler.max_jobs).with_sink(sink));
        let pools = Arc::new(PoolManager::new(&config.pools, spot_signal)?);
        let deps = Arc::new(DependencyCoordinator::new());
        let queues: Vec<Arc<JobQueue>> = config
            .queues
            .iter()
            .map(|q| Arc::new(JobQueue::new(q.clone())))
            .collect();
        let scheduler = Scheduler::new(store.clone(), pools.clone(), deps.clone(), queues);

        let (tx, rx) = mpsc::unbounded_channel();
        let supervisor = Arc::new(ExecutionSupervisor::new(
            store.clone(),
            pools.clone(),
            executor,
            config.scheduler.poll_interval(),
            tx,
        ));

        tracing::info!(
            pools = config.pools.len(),
            queues = config.queues.len(),
            definitions = config.job_definitions.len(),
            "Orchestrator initialized"
        );

        Ok(Self {
            inner: Arc::new(Inner {
                config,
                store,
                pools,
                deps,
                scheduler,
                supervisor,
                events: Mutex::new(Some(rx)),
                shutdown: CancellationToken::new(),
            }),
        })
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.inner.config
    }

    /// Accept a job. Array jobs also create their children.
    ///
    /// Either the whole submission is recorded or none of it is. A failure
    /// part way through an array removes what it created and puts back the
    /// run and dependency declaration it replaced.
    pub fn submit_job(&self, spec: JobSpec) -> Result<JobId> {
        let inner = &self.inner;
        spec.validate()?;
        let queue = inner.scheduler.queue(&spec.queue)?;

        let spec_id = spec.id.clone();
        let dependencies = spec.dependencies.clone();
        let admission = inner
            .store
            .submit_with(spec, || inner.deps.register(&spec_id, &dependencies))?;
        let run = admission.run;
        let job_id = run.job_id.clone();

        if run.is_array_parent() {
            let mut created = Vec::new();
            if let Err(e) = self.create_children(&queue, &run, &mut created) {
                tracing::warn!(job_id = %job_id, error = %e, "Array submission rolled back");
                for child in &created {
                    queue.dequeue(child);
                    inner.store.remove(child);
                }
                inner.store.remove(&job_id);
                if let Some(replaced) = admission.replaced {
                    inner.store.reinstate(replaced);
                }
                inner.deps.restore(&job_id, admission.admitted);
                return Err(e);
            }
        } else {
            queue.enqueue(&run);
        }
        inner.store.transition(&job_id, JobState::Pending, None)?;
        tracing::info!(job_id = %job_id, queue = %queue.name(), "Job submitted");

        if let Some(failed) = inner.deps.failed_predecessor(&job_id) {
            self.cancel_cascade(
                &job_id,
                FailureReason::new(
                    FailureCode::DependencyFailed,
                    format!("Dependent job {} failed", failed),
                ),
                Utc::now(),
            );
        } else if inner.deps.is_satisfied(&job_id) {
            self.make_runnable(&job_id)?;
        }
        Ok(job_id)
    }

    fn create_children(
        &self,
        queue: &JobQueue,
        parent: &JobRun,
        created: &mut Vec<JobId>,
    ) -> Result<()> {
        let store = &self.inner.store;
        for index in 0..parent.spec.array_size {
            let child = store.submit_array_child(&parent.spec, index)?;
            created.push(child.job_id.clone());
            queue.enqueue(&child);
            store.transition(&child.job_id, JobState::Pending, None)?;
        }
        Ok(())
    }

    pub fn submit_from_definition(&self, submission: DefinitionSubmission) -> Result<JobId> {
        let definition = self
            .inner
            .config
            .job_definitions
            .iter()
            .find(|d| d.name == submission.definition)
            .ok_or_else(|| BatchError::DefinitionNotFound(submission.definition.clone()))?;

        let mut spec = definition.instantiate(submission.id, submission.queue);
        if let Some(command) = submission.command {
            spec.command = command;
        }
        spec.array_size = submission.array_size;
        spec.priority = submission.priority;
        spec.environment.extend(submission.environment);
        spec.dependencies = submission.dependencies;
        spec.fail_fast = submission.fail_fast;
        self.submit_job(spec)
    }

    pub fn submit(&self, request: SubmitRequest) -> Result<JobId> {
        match request {
            SubmitRequest::Definition(submission) => self.submit_from_definition(submission),
            SubmitRequest::Spec(spec) => self.submit_job(spec),
        }
    }

    pub fn get_job_status(&self, id: &JobId) -> Result<JobRun> {
        self.inner.store.get(id)
    }

    pub fn list_jobs(&self, state: Option<JobState>) -> Vec<JobRun> {
        self.inner.store.list(state)
    }

    pub fn array_children(&self, parent: &JobId) -> Vec<JobRun> {
        self.inner.store.children(parent)
    }

    pub fn list_queues(&self) -> Vec<QueueSummary> {
        self.inner
            .scheduler
            .queues()
            .iter()
            .map(|q| q.summary(&self.inner.store))
            .collect()
    }

    pub fn list_pools(&self) -> Vec<PoolSummary> {
        self.inner.pools.summaries()
    }

    pub fn counts_by_state(&self) -> BTreeMap<String, usize> {
        self.inner.store.counts_by_state()
    }

    /// Cancel a live run (and, for an array job, every live child).
    /// Cancelling a finished run is a no-op that returns its record.
    pub fn cancel_job(&self, id: &JobId, reason: impl Into<String>) -> Result<JobRun> {
        let run = self.inner.store.get(id)?;
        if run.is_terminal() {
            return Ok(run);
        }
        let failure = FailureReason::new(FailureCode::Cancelled, reason);
        tracing::info!(job_id = %id, reason = %failure.message, "Cancelling job");
        self.cancel_cascade(id, failure, Utc::now());
        self.inner.store.get(id)
    }

    fn make_runnable(&self, id: &JobId) -> Result<()> {
        let store = &self.inner.store;
        let run = store.get(id)?;
        if run.state != JobState::Pending {
            return Ok(());
        }
        if run.is_array_parent() {
            for child in store.children(id) {
                if child.state == JobState::Pending {
                    store.transition(&child.job_id, JobState::Runnable, None)?;
                }
            }
        } else {
            store.transition(id, JobState::Runnable, None)?;
        }
        Ok(())
    }

    /// Cancel one run and everything that can no longer run because of it.
    fn cancel_cascade(&self, id: &JobId, failure: FailureReason, now: DateTime<Utc>) {
        let mut finished = Vec::new();
        self.cancel_one(id, failure, now, &mut finished);
        self.settle(finished, now);
    }

    fn cancel_one(
        &self,
        id: &JobId,
        failure: FailureReason,
        now: DateTime<Utc>,
        finished: &mut Vec<JobId>,
    ) {
        let inner = &self.inner;
        let Ok(run) = inner.store.get(id) else {
            return;
        };
        if run.is_terminal() {
            return;
        }
        if run.is_array_parent() {
            for child in inner.store.children(id) {
                if !child.is_terminal() {
                    self.cancel_one(&child.job_id, failure.clone(), now, finished);
                }
            }
        }
        if let Err(e) = inner.store.fail_at(id, JobState::Cancelled, failure, now) {
            tracing::debug!(job_id = %id, error = %e, "Cancel skipped");
            return;
        }
        if let Ok(queue) = inner.scheduler.queue(&run.spec.queue) {
            queue.dequeue(id);
        }
        if !inner.supervisor.cancel(id) {
            if let Ok(handles) = inner.store.take_handles(id) {
                inner.pools.release_all(&handles);
            }
        }
        finished.push(id.clone());
    }

    /// Propagate terminal runs: unblock or cancel dependents and settle
    /// array parents, until nothing else changes.
    fn settle(&self, mut finished: Vec<JobId>, now: DateTime<Utc>) {
        let inner = &self.inner;
        while let Some(id) = finished.pop() {
            let Ok(run) = inner.store.get(&id) else {
                continue;
            };
            if !run.is_terminal() {
                continue;
            }

            if let Some(parent) = run.array_parent() {
                let parent = parent.clone();
                if let Some(state) = self.settle_array_parent(&parent, now, &mut finished) {
                    tracing::info!(job_id = %parent, state = %state, "Array job finished");
                    finished.push(parent);
                }
            }

            let resolution = if run.state == JobState::Succeeded {
                inner.deps.on_succeeded(&id)
            } else {
                inner.deps.on_failed(&id)
            };
            for eligible in resolution.eligible {
                if let Err(e) = self.make_runnable(&eligible) {
                    tracing::debug!(job_id = %eligible, error = %e, "Dependent not promoted");
                }
            }
            for doomed in resolution.cancelled {
                let failure = FailureReason::new(
                    FailureCode::DependencyFailed,
                    format!("Dependent job {} failed", id),
                );
                self.cancel_one(&doomed, failure, now, &mut finished);
            }
        }
    }

    /// Finish an array parent once its children allow it. Returns the new
    /// parent state if it became terminal.
    fn settle_array_parent(
        &self,
        parent: &JobId,
        now: DateTime<Utc>,
        finished: &mut Vec<JobId>,
    ) -> Option<JobState> {
        let store = &self.inner.store;
        let parent_run = store.get(parent).ok()?;
        if parent_run.is_terminal() {
            return None;
        }
        let children = store.children(parent);
        let failed = children
            .iter()
            .filter(|c| matches!(c.state, JobState::Failed | JobState::Cancelled))
            .count();
        let all_done = children.iter().all(|c| c.is_terminal());

        if failed > 0 && parent_run.spec.fail_fast {
            let reason = FailureReason::new(
                FailureCode::ArrayChildFailed,
                "Array child failed; remaining children cancelled",
            );
            for child in children.iter().filter(|c| !c.is_terminal()) {
                self.cancel_one(&child.job_id, reason.clone(), now, finished);
            }
            return store
                .fail_at(parent, JobState::Failed, reason, now)
                .ok()
                .map(|r| r.state);
        }
        if !all_done {
            return None;
        }
        if failed == 0 {
            store
                .transition_at(parent, JobState::Succeeded, None, now)
                .ok()
                .map(|r| r.state)
        } else {
            let reason = FailureReason::new(
                FailureCode::ArrayChildFailed,
                format!("{} of {} child jobs did not succeed", failed, children.len()),
            );
            store
                .fail_at(parent, JobState::Failed, reason, now)
                .ok()
                .map(|r| r.state)
        }
    }

    fn handle_event(&self, event: SupervisorEvent) {
        let inner = &self.inner;
        match event {
            SupervisorEvent::Started { job_id, .. } => {
                let parent = inner
                    .store
                    .get(&job_id)
                    .ok()
                    .and_then(|r| r.array_parent().cloned());
                if let Some(parent) = parent {
                    if let Ok(run) = inner.store.get(&parent) {
                        if run.state == JobState::Pending {
                            if let Err(e) = inner.store.transition(&parent, JobState::Running, None) {
                                tracing::debug!(job_id = %parent, error = %e, "Array parent not started");
                            }
                        }
                    }
                }
            }
            SupervisorEvent::Finished {
                job_id,
                attempt,
                outcome,
            } => match outcome {
                AttemptOutcome::Retry(failure) => {
                    tracing::debug!(job_id = %job_id, attempt, reason = %failure.message, "Requeueing job");
                    match inner.store.get(&job_id) {
                        Ok(run) if run.state == JobState::Runnable => {
                            if let Ok(queue) = inner.scheduler.queue(&run.spec.queue) {
                                queue.enqueue(&run);
                            }
                        }
                        Ok(run) => {
                            tracing::debug!(job_id = %job_id, state = %run.state, "Retry dropped");
                        }
                        Err(_) => {}
                    }
                }
                _ => self.settle(vec![job_id], Utc::now()),
            },
        }
    }

    /// Apply supervisor events that have arrived, without waiting.
    /// Does nothing while the control loop owns the event stream.
    pub fn process_events(&self) -> usize {
        let mut processed = 0;
        loop {
            let event = {
                let mut guard = self.inner.events.lock();
                match guard.as_mut().map(|rx| rx.try_recv()) {
                    Some(Ok(event)) => event,
                    _ => break,
                }
            };
            self.handle_event(event);
            processed += 1;
        }
        processed
    }

    /// One control-loop step evaluated at `now`: apply pending events,
    /// expire runs past their queue time limits, place runnable runs,
    /// start their supervisors and sweep expired records.
    pub fn tick_at(&self, now: DateTime<Utc>) -> TickReport {
        let inner = &self.inner;
        self.process_events();

        let report = inner.scheduler.tick(now);
        for expired in &report.expired {
            tracing::info!(job_id = %expired.job_id, queue = %expired.queue, reason = %expired.reason, "Time limit exceeded");
            self.cancel_cascade(
                &expired.job_id,
                FailureReason::new(
                    FailureCode::TimeLimitExceeded,
                    format!("Time limit exceeded waiting on {}", expired.reason),
                ),
                now,
            );
        }
        for placement in &report.placed {
            inner.supervisor.spawn(placement.clone(), &inner.shutdown);
        }

        let archived = inner
            .store
            .purge_expired(now, inner.config.scheduler.retention());
        inner.deps.forget(&archived);
        report
    }

    pub fn tick(&self) -> TickReport {
        self.tick_at(Utc::now())
    }

    /// Control loop: ticks on the configured interval and applies supervisor
    /// events as they arrive, until `shutdown` fires.
    pub async fn run(&self, shutdown: CancellationToken) -> Result<()> {
        let inner = &self.inner;
        let mut events = inner
            .events
            .lock()
            .take()
            .ok_or_else(|| BatchError::Config("control loop is already running".to_string()))?;
        let mut interval = tokio::time::interval(inner.config.scheduler.tick_interval());
        tracing::info!("Control loop started");

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = interval.tick() => {
                    self.tick_at(Utc::now());
                }
                Some(event) = events.recv() => self.handle_event(event),
            }
        }

        inner.shutdown.cancel();
        tracing::info!(in_flight = inner.supervisor.in_flight(), "Control loop stopped");
        Ok(())
    }
}
