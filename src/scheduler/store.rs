use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;

use crate::capacity::{CapacityHandle, CapacityShortfall};
use crate::error::{BatchError, Result};
use crate::scheduler::job::{
    AttemptRecord, FailureReason, JobId, JobRun, JobSpec, JobState, RunKind,
};
use crate::telemetry::{EventSink, LifecycleEvent, TracingSink};

const DEFAULT_MAX_JOBS: usize = 10_000;

/// Result of [`JobStore::submit_with`].
#[derive(Debug)]
pub struct Admission<T> {
    pub run: JobRun,
    /// The finished run this submission replaced, if any
    pub replaced: Option<JobRun>,
    pub admitted: T,
}

/// Record of every run the orchestrator knows about.
///
/// Each run lives in its own map entry, and every mutation happens while that
/// entry is locked, so updates to one job id are linearized while different
/// ids proceed independently.
pub struct JobStore {
    runs: DashMap<JobId, JobRun>,
    sequence: AtomicU64,
    max_jobs: usize,
    sink: Arc<dyn EventSink>,
}

impl std::fmt::Debug for JobStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobStore")
            .field("runs", &self.runs.len())
            .field("max_jobs", &self.max_jobs)
            .finish()
    }
}

impl Default for JobStore {
    fn default() -> Self {
        Self::new()
    }
}

impl JobStore {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_MAX_JOBS)
    }

    pub fn with_capacity(max_jobs: usize) -> Self {
        Self {
            runs: DashMap::new(),
            sequence: AtomicU64::new(0),
            max_jobs,
            sink: Arc::new(TracingSink),
        }
    }

    pub fn with_sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.sink = sink;
        self
    }

    fn emit(&self, job_id: &JobId, from: JobState, run: &JobRun) {
        self.sink.emit(&LifecycleEvent {
            job_id: job_id.clone(),
            from,
            to: run.state,
            reason: run.status_reason.clone(),
            at: run.state_entered_at,
        });
    }

    /// Record a new submission.
    ///
    /// Fails if a run with the same id is still live. A terminal run with the
    /// same id is replaced.
    pub fn submit(&self, spec: JobSpec) -> Result<JobRun> {
        self.submit_with(spec, || Ok(())).map(|admission| admission.run)
    }

    /// Record a new submission, running `admit` while the job's entry is
    /// locked.
    ///
    /// Liveness and capacity (including every array child the submission
    /// will create) are checked before `admit` runs. If `admit` fails
    /// nothing is stored. Submissions of one id never interleave.
    pub fn submit_with<T>(
        &self,
        spec: JobSpec,
        admit: impl FnOnce() -> Result<T>,
    ) -> Result<Admission<T>> {
        spec.validate()?;
        let job_id = spec.id.clone();
        let kind = if spec.is_array() {
            RunKind::ArrayParent {
                size: spec.array_size,
            }
        } else if let Some(range) = spec.node_range {
            RunKind::MultiNode {
                nodes: range.node_count(),
            }
        } else {
            RunKind::Single
        };

        // Sized before the entry is locked: len() takes every shard.
        let new_slots = usize::from(!self.runs.contains_key(&job_id))
            + (0..spec.array_size)
                .filter(|index| !self.runs.contains_key(&job_id.array_child(*index)))
                .count();
        if self.runs.len() + new_slots > self.max_jobs {
            return Err(BatchError::QueueFull(self.max_jobs));
        }

        match self.runs.entry(job_id.clone()) {
            Entry::Occupied(mut existing) => {
                if !existing.get().is_terminal() {
                    return Err(BatchError::DuplicateJob(job_id));
                }
                let admitted = admit()?;
                tracing::debug!(job_id = %job_id, "Replacing finished run");
                let run = self.new_run(job_id, spec, kind);
                let replaced = existing.insert(run.clone());
                Ok(Admission {
                    run,
                    replaced: Some(replaced),
                    admitted,
                })
            }
            Entry::Vacant(slot) => {
                let admitted = admit()?;
                let run = self.new_run(job_id, spec, kind);
                slot.insert(run.clone());
                Ok(Admission {
                    run,
                    replaced: None,
                    admitted,
                })
            }
        }
    }

    /// Record child `index` of an array job.
    pub fn submit_array_child(&self, parent: &JobSpec, index: u32) -> Result<JobRun> {
        let kind = RunKind::ArrayChild {
            parent: parent.id.clone(),
            index,
        };
        self.insert(parent.id.array_child(index), parent.clone(), kind)
    }

    fn new_run(&self, job_id: JobId, spec: JobSpec, kind: RunKind) -> JobRun {
        let sequence = self.sequence.fetch_add(1, Ordering::SeqCst) + 1;
        JobRun::new(job_id, spec, kind, sequence)
    }

    fn insert(&self, job_id: JobId, spec: JobSpec, kind: RunKind) -> Result<JobRun> {
        let full = self.runs.len() >= self.max_jobs;
        match self.runs.entry(job_id.clone()) {
            Entry::Occupied(mut existing) => {
                if !existing.get().is_terminal() {
                    return Err(BatchError::DuplicateJob(job_id));
                }
                tracing::debug!(job_id = %job_id, "Replacing finished run");
                let run = self.new_run(job_id, spec, kind);
                existing.insert(run.clone());
                Ok(run)
            }
            Entry::Vacant(slot) => {
                if full {
                    return Err(BatchError::QueueFull(self.max_jobs));
                }
                let run = self.new_run(job_id, spec, kind);
                slot.insert(run.clone());
                Ok(run)
            }
        }
    }

    /// Drop a run outright, bypassing retention.
    pub fn remove(&self, id: &JobId) -> Option<JobRun> {
        self.runs.remove(id).map(|(_, run)| run)
    }

    /// Put back a record taken out by `remove` or replaced by a submission.
    pub fn reinstate(&self, run: JobRun) {
        self.runs.insert(run.job_id.clone(), run);
    }

    pub fn get(&self, id: &JobId) -> Result<JobRun> {
        self.runs
            .get(id)
            .map(|r| r.clone())
            .ok_or_else(|| BatchError::JobNotFound(id.clone()))
    }

    pub fn contains(&self, id: &JobId) -> bool {
        self.runs.contains_key(id)
    }

    /// Run `f` against the record while its entry is locked.
    pub fn update<T>(&self, id: &JobId, f: impl FnOnce(&mut JobRun) -> Result<T>) -> Result<T> {
        let mut run = self
            .runs
            .get_mut(id)
            .ok_or_else(|| BatchError::JobNotFound(id.clone()))?;
        f(&mut *run)
    }

    pub fn transition(
        &self,
        id: &JobId,
        to: JobState,
        reason: Option<String>,
    ) -> Result<JobRun> {
        self.transition_at(id, to, reason, Utc::now())
    }

    pub fn transition_at(
        &self,
        id: &JobId,
        to: JobState,
        reason: Option<String>,
        now: DateTime<Utc>,
    ) -> Result<JobRun> {
        let (from, run) = self.update(id, |run| {
            let from = run.state;
            run.transition(to, reason, now)?;
            Ok((from, run.clone()))
        })?;
        self.emit(id, from, &run);
        Ok(run)
    }

    /// Move a run to a terminal failure state and remember why.
    pub fn fail(&self, id: &JobId, to: JobState, failure: FailureReason) -> Result<JobRun> {
        self.fail_at(id, to, failure, Utc::now())
    }

    pub fn fail_at(
        &self,
        id: &JobId,
        to: JobState,
        failure: FailureReason,
        now: DateTime<Utc>,
    ) -> Result<JobRun> {
        let (from, run) = self.update(id, |run| {
            let from = run.state;
            run.transition(to, Some(failure.message.clone()), now)?;
            run.failure = Some(failure);
            Ok((from, run.clone()))
        })?;
        self.emit(id, from, &run);
        Ok(run)
    }

    /// Move a RUNNABLE run to STARTING and hand it `handles`. Returns false,
    /// leaving the run untouched, if it is no longer RUNNABLE.
    pub fn claim(
        &self,
        id: &JobId,
        handles: Vec<CapacityHandle>,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let claimed = self.update(id, |run| {
            if run.state != JobState::Runnable {
                return Ok(None);
            }
            run.transition(JobState::Starting, None, now)?;
            run.handles = handles;
            Ok(Some(run.clone()))
        })?;
        match claimed {
            Some(run) => {
                self.emit(id, JobState::Runnable, &run);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    pub fn assign_handles(&self, id: &JobId, handles: Vec<CapacityHandle>) -> Result<()> {
        self.update(id, |run| {
            run.handles = handles;
            Ok(())
        })
    }

    pub fn take_handles(&self, id: &JobId) -> Result<Vec<CapacityHandle>> {
        self.update(id, |run| Ok(std::mem::take(&mut run.handles)))
    }

    /// Open a new attempt record; returns the 1-based attempt number.
    pub fn begin_attempt(&self, id: &JobId, now: DateTime<Utc>) -> Result<u32> {
        self.update(id, |run| {
            let attempt = run.attempt_count() + 1;
            run.attempts.push(AttemptRecord {
                attempt,
                started_at: now,
                stopped_at: None,
                instances: run.handles.iter().map(|h| h.instance_id.clone()).collect(),
                exit_code: None,
                failure: None,
            });
            Ok(attempt)
        })
    }

    pub fn finish_attempt(
        &self,
        id: &JobId,
        exit_code: Option<i32>,
        failure: Option<FailureReason>,
        now: DateTime<Utc>,
    ) -> Result<()> {
        self.update(id, |run| {
            if let Some(attempt) = run.attempts.last_mut() {
                attempt.stopped_at = Some(now);
                attempt.exit_code = exit_code;
                attempt.failure = failure;
            }
            Ok(())
        })
    }

    /// Record why a RUNNABLE run is still waiting. The clock restarts only
    /// when the reason changes.
    pub fn set_waiting_reason(
        &self,
        id: &JobId,
        reason: CapacityShortfall,
        now: DateTime<Utc>,
    ) -> Result<()> {
        self.update(id, |run| {
            if run.state != JobState::Runnable {
                return Ok(());
            }
            if run.waiting_reason != Some(reason) {
                run.waiting_reason = Some(reason);
                run.waiting_since = Some(now);
                run.status_reason = Some(reason.to_string());
            }
            Ok(())
        })
    }

    /// All runs, oldest submission first, optionally filtered by state.
    pub fn list(&self, state: Option<JobState>) -> Vec<JobRun> {
        let mut runs: Vec<JobRun> = self
            .runs
            .iter()
            .filter(|r| state.map_or(true, |s| r.state == s))
            .map(|r| r.clone())
            .collect();
        runs.sort_by_key(|r| r.sequence);
        runs
    }

    pub fn children(&self, parent: &JobId) -> Vec<JobRun> {
        let mut children: Vec<JobRun> = self
            .runs
            .iter()
            .filter(|r| r.array_parent() == Some(parent))
            .map(|r| r.clone())
            .collect();
        children.sort_by_key(|r| r.array_index());
        children
    }

    pub fn counts_by_state(&self) -> BTreeMap<String, usize> {
        let mut counts = BTreeMap::new();
        for run in self.runs.iter() {
            *counts.entry(run.state.to_string()).or_insert(0) += 1;
        }
        counts
    }

    /// Drop terminal runs whose retention window has passed. Returns their ids.
    pub fn purge_expired(&self, now: DateTime<Utc>, retention: chrono::Duration) -> Vec<JobId> {
        let mut purged = Vec::new();
        self.runs.retain(|id, run| {
            let expired = run.is_terminal()
                && run
                    .stopped_at
                    .and_then(|stopped| stopped.checked_add_signed(retention))
                    .is_some_and(|expires| expires <= now);
            if expired {
                purged.push(id.clone());
            }
            !expired
        });
        if !purged.is_empty() {
            tracing::info!(count = purged.len(), "Archived finished jobs");
        }
        purged
    }

    pub fn len(&self) -> usize {
        self.runs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.runs.is_empty()
    }
}
