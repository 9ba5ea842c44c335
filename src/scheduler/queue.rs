use std::cmp::Reverse;
use std::collections::{BTreeMap, HashMap};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::capacity::CapacityPool;
use crate::config::{QueueConfig, TimeLimitAction};
use crate::scheduler::dependency::DependencyCoordinator;
use crate::scheduler::job::{JobId, JobRun, JobState, ResourceRequest};
use crate::scheduler::store::JobStore;

/// Position of a run inside a queue: priority descending, then submission
/// time, then submission sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct QueueKey {
    priority: Reverse<i32>,
    submitted_at: DateTime<Utc>,
    sequence: u64,
}

impl QueueKey {
    pub fn for_run(run: &JobRun) -> Self {
        Self {
            priority: Reverse(run.spec.priority),
            submitted_at: run.created_at,
            sequence: run.sequence,
        }
    }
}

#[derive(Debug, Clone)]
pub struct QueueEntry {
    pub job_id: JobId,
    pub key: QueueKey,
    pub resources: ResourceRequest,
    pub nodes: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueSummary {
    pub name: String,
    pub priority: i32,
    pub pools: Vec<String>,
    pub submitted: usize,
    pub pending: usize,
    pub runnable: usize,
    pub total: usize,
}

#[derive(Debug, Default)]
struct Entries {
    ordered: BTreeMap<QueueKey, QueueEntry>,
    keys: HashMap<JobId, QueueKey>,
}

/// Admission structure of one job queue.
#[derive(Debug)]
pub struct JobQueue {
    config: QueueConfig,
    pools: Vec<String>,
    entries: Mutex<Entries>,
}

impl JobQueue {
    pub fn new(config: QueueConfig) -> Self {
        let pools = config.ordered_pools();
        Self {
            config,
            pools,
            entries: Mutex::new(Entries::default()),
        }
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    pub fn priority(&self) -> i32 {
        self.config.priority
    }

    /// Pool names in the order placement should try them.
    pub fn pools(&self) -> &[String] {
        &self.pools
    }

    pub fn time_limit_actions(&self) -> &[TimeLimitAction] {
        &self.config.time_limit_actions
    }

    /// Add a run. Re-adding a run that left the queue puts it back at its
    /// original position. Returns false if it is already queued.
    pub fn enqueue(&self, run: &JobRun) -> bool {
        let key = QueueKey::for_run(run);
        let mut entries = self.entries.lock();
        if entries.keys.contains_key(&run.job_id) {
            return false;
        }
        entries.keys.insert(run.job_id.clone(), key);
        entries.ordered.insert(
            key,
            QueueEntry {
                job_id: run.job_id.clone(),
                key,
                resources: run.spec.resources,
                nodes: run.spec.node_count(),
            },
        );
        true
    }

    pub fn dequeue(&self, job_id: &JobId) -> Option<QueueEntry> {
        let mut entries = self.entries.lock();
        let key = entries.keys.remove(job_id)?;
        entries.ordered.remove(&key)
    }

    pub fn contains(&self, job_id: &JobId) -> bool {
        self.entries.lock().keys.contains_key(job_id)
    }

    pub fn len(&self) -> usize {
        self.entries.lock().ordered.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Snapshot of all entries in queue order.
    pub fn entries(&self) -> Vec<QueueEntry> {
        self.entries.lock().ordered.values().cloned().collect()
    }

    /// Entries that could be placed now, in queue order: RUNNABLE with every
    /// dependency satisfied.
    pub fn ready_entries(&self, store: &JobStore, deps: &DependencyCoordinator) -> Vec<QueueEntry> {
        self.entries()
            .into_iter()
            .filter(|entry| {
                store
                    .get(&entry.job_id)
                    .map(|run| run.state == JobState::Runnable)
                    .unwrap_or(false)
                    && deps.is_satisfied(&entry.job_id)
            })
            .collect()
    }

    /// Ready entries whose request some class of `pool` can serve.
    pub fn peek_ready(
        &self,
        pool: &CapacityPool,
        store: &JobStore,
        deps: &DependencyCoordinator,
    ) -> Vec<QueueEntry> {
        self.ready_entries(store, deps)
            .into_iter()
            .filter(|entry| pool.can_ever_fit(&entry.resources, entry.nodes))
            .collect()
    }

    pub fn summary(&self, store: &JobStore) -> QueueSummary {
        let mut summary = QueueSummary {
            name: self.config.name.clone(),
            priority: self.config.priority,
            pools: self.pools.clone(),
            submitted: 0,
            pending: 0,
            runnable: 0,
            total: 0,
        };
        for entry in self.entries() {
            let Ok(run) = store.get(&entry.job_id) else {
                continue;
            };
            match run.state {
                JobState::Submitted => summary.submitted += 1,
                JobState::Pending => summary.pending += 1,
                JobState::Runnable => summary.runnable += 1,
                _ => {}
            }
            summary.total += 1;
        }
        summary
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capacity::pool::InstanceClass;
    use crate::capacity::BestFitProgressive;
    use crate::config::PoolConfig;
    use crate::scheduler::job::JobSpec;

    fn queue() -> JobQueue {
        JobQueue::new(QueueConfig::new("q", 1).with_pool("pool", 1))
    }

    fn runnable(store: &JobStore, spec: JobSpec) -> JobRun {
        let id = spec.id.clone();
        store.submit(spec).unwrap();
        store.transition(&id, JobState::Pending, None).unwrap();
        store.transition(&id, JobState::Runnable, None).unwrap()
    }

    fn ids(entries: &[QueueEntry]) -> Vec<String> {
        entries.iter().map(|e| e.job_id.to_string()).collect()
    }

    #[test]
    fn higher_priority_first_then_fifo() {
        let store = JobStore::new();
        let deps = DependencyCoordinator::new();
        let queue = queue();
        for (id, priority) in [("a", 0), ("b", 5), ("c", 0), ("d", 5)] {
            let run = runnable(&store, JobSpec::new(id, "q", "alpine", "true").with_priority(priority));
            queue.enqueue(&run);
        }
        assert_eq!(ids(&queue.ready_entries(&store, &deps)), vec!["b", "d", "a", "c"]);
    }

    #[test]
    fn requeue_keeps_original_position() {
        let store = JobStore::new();
        let deps = DependencyCoordinator::new();
        let queue = queue();
        let first = runnable(&store, JobSpec::new("first", "q", "alpine", "true"));
        let second = runnable(&store, JobSpec::new("second", "q", "alpine", "true"));
        queue.enqueue(&first);
        queue.enqueue(&second);

        let key = queue.dequeue(&first.job_id).unwrap().key;
        assert!(!queue.contains(&first.job_id));
        assert!(queue.enqueue(&store.get(&first.job_id).unwrap()));
        let entries = queue.ready_entries(&store, &deps);
        assert_eq!(ids(&entries), vec!["first", "second"]);
        assert_eq!(entries[0].key, key);
    }

    #[test]
    fn enqueue_is_idempotent() {
        let store = JobStore::new();
        let queue = queue();
        let run = runnable(&store, JobSpec::new("a", "q", "alpine", "true"));
        assert!(queue.enqueue(&run));
        assert!(!queue.enqueue(&run));
        assert_eq!(queue.len(), 1);
    }

    #[test]
    fn peek_ready_skips_blocked_and_oversized_runs() {
        let store = JobStore::new();
        let deps = DependencyCoordinator::new();
        let queue = queue();
        let pool = CapacityPool::new(
            PoolConfig::ec2("pool", 0, 8).with_class(InstanceClass::new("c7a.large", 2, 4096)),
            Box::new(BestFitProgressive),
        )
        .unwrap();

        let small = runnable(&store, JobSpec::new("small", "q", "alpine", "true"));
        let huge = runnable(
            &store,
            JobSpec::new("huge", "q", "alpine", "true").with_resources(16, 1024),
        );
        let blocked = runnable(
            &store,
            JobSpec::new("blocked", "q", "alpine", "true").depends_on("small"),
        );
        deps.register(&blocked.job_id, &blocked.spec.dependencies).unwrap();
        store.submit(JobSpec::new("waiting", "q", "alpine", "true")).unwrap();
        let waiting = store.get(&JobId::from("waiting")).unwrap();

        for run in [&small, &huge, &blocked, &waiting] {
            queue.enqueue(run);
        }
        assert_eq!(ids(&queue.peek_ready(&pool, &store, &deps)), vec!["small"]);

        let summary = queue.summary(&store);
        assert_eq!(summary.runnable, 3);
        assert_eq!(summary.submitted, 1);
        assert_eq!(summary.total, 4);
    }
}
