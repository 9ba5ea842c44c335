use std::collections::HashSet;
use std::sync::Arc;

use chrono::{DateTime, Utc};

use crate::capacity::{CapacityHandle, CapacityShortfall, PoolManager};
use crate::error::{BatchError, Result};
use crate::scheduler::dependency::DependencyCoordinator;
use crate::scheduler::job::{JobId, JobState};
use crate::scheduler::queue::{JobQueue, QueueEntry};
use crate::scheduler::store::JobStore;

/// A run that got capacity and is now STARTING.
#[derive(Debug, Clone)]
pub struct Placement {
    pub job_id: JobId,
    pub queue: String,
    pub pool: String,
    pub handles: Vec<CapacityHandle>,
}

/// A RUNNABLE run whose time-limit action fired.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExpiredRun {
    pub job_id: JobId,
    pub queue: String,
    pub reason: CapacityShortfall,
}

#[derive(Debug, Default)]
pub struct TickReport {
    pub placed: Vec<Placement>,
    pub waiting: Vec<(JobId, CapacityShortfall)>,
    pub expired: Vec<ExpiredRun>,
}

enum Outcome {
    Placed(Placement),
    Waiting(CapacityShortfall),
    Skipped,
}

/// Matches queued runs to pool capacity.
pub struct Scheduler {
    store: Arc<JobStore>,
    pools: Arc<PoolManager>,
    deps: Arc<DependencyCoordinator>,
    /// Highest queue priority first
    queues: Vec<Arc<JobQueue>>,
}

impl Scheduler {
    pub fn new(
        store: Arc<JobStore>,
        pools: Arc<PoolManager>,
        deps: Arc<DependencyCoordinator>,
        mut queues: Vec<Arc<JobQueue>>,
    ) -> Self {
        queues.sort_by(|a, b| {
            b.priority()
                .cmp(&a.priority())
                .then_with(|| a.name().cmp(b.name()))
        });
        Self {
            store,
            pools,
            deps,
            queues,
        }
    }

    pub fn queues(&self) -> &[Arc<JobQueue>] {
        &self.queues
    }

    pub fn queue(&self, name: &str) -> Result<Arc<JobQueue>> {
        self.queues
            .iter()
            .find(|q| q.name() == name)
            .cloned()
            .ok_or_else(|| BatchError::QueueNotFound(name.to_string()))
    }

    /// One scheduling pass. Expired runs are reported, not placed.
    pub fn tick(&self, now: DateTime<Utc>) -> TickReport {
        let mut report = TickReport::default();

        for queue in &self.queues {
            let expired = self.expired_runs(queue, now);
            let skip: HashSet<JobId> = expired.iter().map(|e| e.job_id.clone()).collect();
            report.expired.extend(expired);

            for entry in queue.ready_entries(&self.store, &self.deps) {
                if skip.contains(&entry.job_id) {
                    continue;
                }
                match self.place(queue, &entry, now) {
                    Ok(Outcome::Placed(placement)) => report.placed.push(placement),
                    Ok(Outcome::Waiting(reason)) => report.waiting.push((entry.job_id, reason)),
                    Ok(Outcome::Skipped) => {}
                    Err(e) => {
                        tracing::warn!(job_id = %entry.job_id, queue = %queue.name(), error = %e, "Placement failed");
                    }
                }
            }
        }

        if !report.placed.is_empty() {
            tracing::debug!(placed = report.placed.len(), waiting = report.waiting.len(), "Scheduling tick");
        }
        report
    }

    fn place(&self, queue: &JobQueue, entry: &QueueEntry, now: DateTime<Utc>) -> Result<Outcome> {
        let mut fits_somewhere = false;
        let mut last_shortfall = None;

        for pool_name in queue.pools() {
            let pool = self.pools.get(pool_name)?;
            if !pool.can_ever_fit(&entry.resources, entry.nodes) {
                continue;
            }
            fits_somewhere = true;

            let handles = match pool.reserve_nodes(&entry.resources, entry.nodes) {
                Ok(handles) => handles,
                Err(shortfall) => {
                    last_shortfall = Some(shortfall);
                    continue;
                }
            };

            let claimed = self.store.claim(&entry.job_id, handles.clone(), now);
            return match claimed {
                Ok(true) => {
                    queue.dequeue(&entry.job_id);
                    tracing::info!(
                        job_id = %entry.job_id,
                        queue = %queue.name(),
                        pool = %pool_name,
                        nodes = handles.len(),
                        "Job placed"
                    );
                    Ok(Outcome::Placed(Placement {
                        job_id: entry.job_id.clone(),
                        queue: queue.name().to_string(),
                        pool: pool_name.clone(),
                        handles,
                    }))
                }
                Ok(false) => {
                    self.pools.release_all(&handles);
                    Ok(Outcome::Skipped)
                }
                Err(e) => {
                    self.pools.release_all(&handles);
                    Err(e)
                }
            };
        }

        let reason = if fits_somewhere {
            last_shortfall.unwrap_or(CapacityShortfall::InsufficientInstanceCapacity)
        } else {
            CapacityShortfall::JobResourceRequirement
        };
        self.store.set_waiting_reason(&entry.job_id, reason, now)?;
        Ok(Outcome::Waiting(reason))
    }

    fn expired_runs(&self, queue: &JobQueue, now: DateTime<Utc>) -> Vec<ExpiredRun> {
        if queue.time_limit_actions().is_empty() {
            return Vec::new();
        }
        queue
            .entries()
            .into_iter()
            .filter_map(|entry| self.store.get(&entry.job_id).ok())
            .filter_map(|run| {
                if run.state != JobState::Runnable {
                    return None;
                }
                let reason = run.waiting_reason?;
                let since = run.waiting_since?;
                queue
                    .time_limit_actions()
                    .iter()
                    .find(|action| action.reason == reason && now - since >= action.max_time())
                    .map(|_| ExpiredRun {
                        job_id: run.job_id.clone(),
                        queue: queue.name().to_string(),
                        reason,
                    })
            })
            .collect()
    }
}
