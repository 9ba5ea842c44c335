use std::collections::{HashMap, HashSet, VecDeque};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::error::{BatchError, Result};
use crate::scheduler::job::{Dependency, JobId};

/// `successor` may not become runnable before `predecessor` finishes.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DependencyEdge {
    pub predecessor: JobId,
    pub successor: JobId,
    pub tolerate_failure: bool,
}

impl DependencyEdge {
    pub fn new(predecessor: impl Into<JobId>, successor: impl Into<JobId>) -> Self {
        Self {
            predecessor: predecessor.into(),
            successor: successor.into(),
            tolerate_failure: false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Outcome {
    Succeeded,
    Failed,
}

/// What a finished predecessor means for its successors.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Resolution {
    /// Successors whose predecessors are now all satisfied
    pub eligible: Vec<JobId>,
    /// Successors that can never run because a required predecessor failed
    pub cancelled: Vec<JobId>,
}

#[derive(Debug, Default)]
struct Graph {
    /// successor -> (predecessor -> tolerate_failure)
    predecessors: HashMap<JobId, HashMap<JobId, bool>>,
    successors: HashMap<JobId, HashSet<JobId>>,
    outcomes: HashMap<JobId, Outcome>,
    /// Archived jobs whose outcome is kept only while a successor still
    /// depends on it
    retired: HashSet<JobId>,
}

/// A successor's declaration before `register` replaced it.
#[derive(Debug, Default)]
pub struct PriorDeclaration {
    edges: Option<HashMap<JobId, bool>>,
    outcome: Option<Outcome>,
}

impl Graph {
    fn edge_satisfied(&self, predecessor: &JobId, tolerate_failure: bool) -> bool {
        match self.outcomes.get(predecessor) {
            Some(Outcome::Succeeded) => true,
            Some(Outcome::Failed) => tolerate_failure,
            None => false,
        }
    }

    fn is_satisfied(&self, job: &JobId) -> bool {
        self.predecessors.get(job).map_or(true, |preds| {
            preds
                .iter()
                .all(|(pred, tolerate)| self.edge_satisfied(pred, *tolerate))
        })
    }

    /// Kahn's algorithm over the current edges plus `extra`.
    fn is_acyclic_with(&self, extra: &[DependencyEdge]) -> bool {
        let mut out: HashMap<&JobId, Vec<&JobId>> = HashMap::new();
        let mut in_degree: HashMap<&JobId, usize> = HashMap::new();
        let mut seen: HashSet<(&JobId, &JobId)> = HashSet::new();

        let existing = self.predecessors.iter().flat_map(|(succ, preds)| {
            preds.keys().map(move |pred| (pred, succ))
        });
        let added = extra.iter().map(|e| (&e.predecessor, &e.successor));

        for (pred, succ) in existing.chain(added) {
            in_degree.entry(pred).or_insert(0);
            in_degree.entry(succ).or_insert(0);
            if seen.insert((pred, succ)) {
                out.entry(pred).or_default().push(succ);
                *in_degree.entry(succ).or_insert(0) += 1;
            }
        }

        let mut ready: VecDeque<&JobId> = in_degree
            .iter()
            .filter(|(_, d)| **d == 0)
            .map(|(id, _)| *id)
            .collect();
        let mut visited = 0usize;
        while let Some(node) = ready.pop_front() {
            visited += 1;
            for next in out.get(node).into_iter().flatten() {
                if let Some(d) = in_degree.get_mut(next) {
                    *d -= 1;
                    if *d == 0 {
                        ready.push_back(*next);
                    }
                }
            }
        }
        visited == in_degree.len()
    }
}

/// Tracks dependency edges and predecessor outcomes.
#[derive(Debug, Default)]
pub struct DependencyCoordinator {
    graph: Mutex<Graph>,
}

impl DependencyCoordinator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Declare the predecessors of `successor`, replacing any earlier
    /// declaration. Rejects the whole set if it would close a cycle.
    ///
    /// The returned declaration can be handed to [`restore`](Self::restore)
    /// if the submission is abandoned.
    pub fn register(
        &self,
        successor: &JobId,
        dependencies: &[Dependency],
    ) -> Result<PriorDeclaration> {
        let edges: Vec<DependencyEdge> = dependencies
            .iter()
            .map(|d| DependencyEdge {
                predecessor: d.job_id.clone(),
                successor: successor.clone(),
                tolerate_failure: d.tolerate_failure,
            })
            .collect();

        let mut graph = self.graph.lock();
        let previous = graph.predecessors.get(successor).cloned();
        Self::detach_locked(&mut graph, successor);
        if let Err(e) = Self::add_edges_locked(&mut graph, &edges) {
            if let Some(previous) = previous {
                Self::attach_declared(&mut graph, successor, previous);
            }
            return Err(e);
        }
        graph.retired.remove(successor);
        Ok(PriorDeclaration {
            edges: previous,
            outcome: graph.outcomes.remove(successor),
        })
    }

    /// Undo a successful `register`: put back the earlier edges and the
    /// recorded outcome of `successor`.
    pub fn restore(&self, successor: &JobId, prior: PriorDeclaration) {
        let mut graph = self.graph.lock();
        Self::detach_locked(&mut graph, successor);
        if let Some(edges) = prior.edges {
            Self::attach_declared(&mut graph, successor, edges);
        }
        match prior.outcome {
            Some(outcome) => {
                graph.outcomes.insert(successor.clone(), outcome);
            }
            None => {
                graph.outcomes.remove(successor);
            }
        }
    }

    fn attach_declared(graph: &mut Graph, successor: &JobId, edges: HashMap<JobId, bool>) {
        let edges: Vec<DependencyEdge> = edges
            .into_iter()
            .map(|(predecessor, tolerate_failure)| DependencyEdge {
                predecessor,
                successor: successor.clone(),
                tolerate_failure,
            })
            .collect();
        Self::attach_locked(graph, &edges);
    }

    /// Drop archived jobs from the graph.
    ///
    /// Their own declarations go away. Their outcome is kept while some
    /// successor still declares them, and dropped once none does; after that
    /// a new dependency on the id waits as if it was never submitted.
    pub fn forget(&self, archived: &[JobId]) {
        if archived.is_empty() {
            return;
        }
        let mut graph = self.graph.lock();
        for id in archived {
            Self::detach_locked(&mut graph, id);
            graph.retired.insert(id.clone());
        }
        let Graph {
            successors,
            outcomes,
            retired,
            ..
        } = &mut *graph;
        retired.retain(|id| {
            if successors.get(id).is_some_and(|s| !s.is_empty()) {
                return true;
            }
            successors.remove(id);
            outcomes.remove(id);
            false
        });
    }

    /// Add a batch of edges atomically.
    pub fn add_edges(&self, edges: &[DependencyEdge]) -> Result<()> {
        let mut graph = self.graph.lock();
        Self::add_edges_locked(&mut graph, edges)
    }

    fn add_edges_locked(graph: &mut Graph, edges: &[DependencyEdge]) -> Result<()> {
        if let Some(self_loop) = edges.iter().find(|e| e.predecessor == e.successor) {
            return Err(BatchError::CyclicDependency(self_loop.successor.clone()));
        }
        if !graph.is_acyclic_with(edges) {
            let culprit = edges
                .first()
                .map(|e| e.successor.clone())
                .unwrap_or_else(|| JobId::from(""));
            return Err(BatchError::CyclicDependency(culprit));
        }
        Self::attach_locked(graph, edges);
        Ok(())
    }

    fn attach_locked(graph: &mut Graph, edges: &[DependencyEdge]) {
        for edge in edges {
            graph
                .predecessors
                .entry(edge.successor.clone())
                .or_default()
                .insert(edge.predecessor.clone(), edge.tolerate_failure);
            graph
                .successors
                .entry(edge.predecessor.clone())
                .or_default()
                .insert(edge.successor.clone());
        }
    }

    fn detach_locked(graph: &mut Graph, successor: &JobId) {
        if let Some(preds) = graph.predecessors.remove(successor) {
            for pred in preds.keys() {
                if let Some(succs) = graph.successors.get_mut(pred) {
                    succs.remove(successor);
                    if succs.is_empty() {
                        graph.successors.remove(pred);
                    }
                }
            }
        }
    }

    /// Drop the declared predecessors of `successor`.
    pub fn remove(&self, successor: &JobId) {
        let mut graph = self.graph.lock();
        Self::detach_locked(&mut graph, successor);
    }

    pub fn is_satisfied(&self, job: &JobId) -> bool {
        self.graph.lock().is_satisfied(job)
    }

    /// A required predecessor that already failed, if any.
    pub fn failed_predecessor(&self, job: &JobId) -> Option<JobId> {
        let graph = self.graph.lock();
        graph.predecessors.get(job).and_then(|preds| {
            preds
                .iter()
                .find(|(pred, tolerate)| {
                    !**tolerate && graph.outcomes.get(*pred) == Some(&Outcome::Failed)
                })
                .map(|(pred, _)| pred.clone())
        })
    }

    pub fn on_succeeded(&self, job: &JobId) -> Resolution {
        self.resolve(job, Outcome::Succeeded)
    }

    /// Failed and cancelled predecessors are treated alike.
    pub fn on_failed(&self, job: &JobId) -> Resolution {
        self.resolve(job, Outcome::Failed)
    }

    fn resolve(&self, job: &JobId, outcome: Outcome) -> Resolution {
        let mut graph = self.graph.lock();
        graph.outcomes.insert(job.clone(), outcome);

        let mut resolution = Resolution::default();
        let successors: Vec<JobId> = graph
            .successors
            .get(job)
            .map(|s| s.iter().cloned().collect())
            .unwrap_or_default();
        for succ in successors {
            let tolerate = graph
                .predecessors
                .get(&succ)
                .and_then(|p| p.get(job))
                .copied()
                .unwrap_or(false);
            if outcome == Outcome::Failed && !tolerate {
                resolution.cancelled.push(succ);
            } else if graph.is_satisfied(&succ) {
                resolution.eligible.push(succ);
            }
        }
        resolution.eligible.sort();
        resolution.cancelled.sort();
        resolution
    }

    pub fn edges(&self) -> Vec<DependencyEdge> {
        let graph = self.graph.lock();
        let mut edges: Vec<DependencyEdge> = graph
            .predecessors
            .iter()
            .flat_map(|(succ, preds)| {
                preds.iter().map(move |(pred, tolerate)| DependencyEdge {
                    predecessor: pred.clone(),
                    successor: succ.clone(),
                    tolerate_failure: *tolerate,
                })
            })
            .collect();
        edges.sort_by(|a, b| {
            (&a.predecessor, &a.successor).cmp(&(&b.predecessor, &b.successor))
        });
        edges
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dep(id: &str) -> Dependency {
        Dependency {
            job_id: JobId::from(id),
            tolerate_failure: false,
        }
    }

    #[test]
    fn two_node_cycle_is_rejected() {
        let coordinator = DependencyCoordinator::new();
        let err = coordinator
            .add_edges(&[DependencyEdge::new("A", "B"), DependencyEdge::new("B", "A")])
            .unwrap_err();
        assert!(matches!(err, BatchError::CyclicDependency(_)));
        assert!(coordinator.edges().is_empty());
    }

    #[test]
    fn cycle_across_submissions_is_rejected() {
        let coordinator = DependencyCoordinator::new();
        coordinator.register(&JobId::from("B"), &[dep("A")]).unwrap();
        coordinator.register(&JobId::from("C"), &[dep("B")]).unwrap();
        let err = coordinator
            .register(&JobId::from("A"), &[dep("C")])
            .unwrap_err();
        assert!(matches!(err, BatchError::CyclicDependency(_)));
        assert_eq!(coordinator.edges().len(), 2);
    }

    #[test]
    fn self_dependency_is_a_cycle() {
        let coordinator = DependencyCoordinator::new();
        assert!(coordinator.register(&JobId::from("A"), &[dep("A")]).is_err());
    }

    #[test]
    fn diamond_is_accepted() {
        let coordinator = DependencyCoordinator::new();
        coordinator.register(&JobId::from("B"), &[dep("A")]).unwrap();
        coordinator.register(&JobId::from("C"), &[dep("A")]).unwrap();
        coordinator
            .register(&JobId::from("D"), &[dep("B"), dep("C")])
            .unwrap();
        assert_eq!(coordinator.edges().len(), 4);
    }

    #[test]
    fn successor_waits_for_all_predecessors() {
        let coordinator = DependencyCoordinator::new();
        let d = JobId::from("D");
        coordinator.register(&d, &[dep("B"), dep("C")]).unwrap();
        assert!(!coordinator.is_satisfied(&d));

        let first = coordinator.on_succeeded(&JobId::from("B"));
        assert!(first.eligible.is_empty());

        let second = coordinator.on_succeeded(&JobId::from("C"));
        assert_eq!(second.eligible, vec![d.clone()]);
        assert!(coordinator.is_satisfied(&d));
    }

    #[test]
    fn failure_cancels_unless_tolerated() {
        let coordinator = DependencyCoordinator::new();
        coordinator
            .register(&JobId::from("strict"), &[dep("leader")])
            .unwrap();
        coordinator
            .register(
                &JobId::from("lenient"),
                &[Dependency {
                    job_id: JobId::from("leader"),
                    tolerate_failure: true,
                }],
            )
            .unwrap();

        let resolution = coordinator.on_failed(&JobId::from("leader"));
        assert_eq!(resolution.cancelled, vec![JobId::from("strict")]);
        assert_eq!(resolution.eligible, vec![JobId::from("lenient")]);
        assert_eq!(
            coordinator.failed_predecessor(&JobId::from("strict")),
            Some(JobId::from("leader"))
        );
    }

    #[test]
    fn job_without_dependencies_is_satisfied() {
        let coordinator = DependencyCoordinator::new();
        assert!(coordinator.is_satisfied(&JobId::from("solo")));
    }

    #[test]
    fn rejected_redeclaration_keeps_earlier_edges() {
        let coordinator = DependencyCoordinator::new();
        coordinator.register(&JobId::from("B"), &[dep("A")]).unwrap();
        coordinator.register(&JobId::from("C"), &[dep("B")]).unwrap();
        assert!(coordinator.register(&JobId::from("B"), &[dep("C")]).is_err());

        let edges = coordinator.edges();
        assert_eq!(edges.len(), 2);
        assert!(edges.contains(&DependencyEdge::new("A", "B")));
    }

    #[test]
    fn restore_puts_back_edges_and_outcome() {
        let coordinator = DependencyCoordinator::new();
        let a = JobId::from("A");
        let c = JobId::from("C");
        coordinator.register(&c, &[dep("A")]).unwrap();
        coordinator.on_failed(&a);

        // A is resubmitted with a new predecessor, then the submission is dropped
        let prior = coordinator.register(&a, &[dep("X")]).unwrap();
        assert_eq!(coordinator.failed_predecessor(&c), None);
        coordinator.restore(&a, prior);

        assert_eq!(coordinator.failed_predecessor(&c), Some(a.clone()));
        assert_eq!(coordinator.edges(), vec![DependencyEdge::new("A", "C")]);
    }

    #[test]
    fn forget_prunes_archived_jobs() {
        let coordinator = DependencyCoordinator::new();
        let b = JobId::from("B");
        coordinator.register(&b, &[dep("A")]).unwrap();
        coordinator.on_succeeded(&JobId::from("A"));
        coordinator.on_succeeded(&b);

        coordinator.forget(&[JobId::from("A"), b]);
        assert!(coordinator.edges().is_empty());

        // A forgotten predecessor behaves like one never submitted
        let late = JobId::from("late");
        coordinator.register(&late, &[dep("A")]).unwrap();
        assert!(!coordinator.is_satisfied(&late));
    }

    #[test]
    fn forgotten_outcome_survives_while_referenced() {
        let coordinator = DependencyCoordinator::new();
        let c = JobId::from("C");
        coordinator.register(&c, &[dep("A"), dep("X")]).unwrap();
        coordinator.on_succeeded(&JobId::from("A"));
        coordinator.forget(&[JobId::from("A")]);

        let resolution = coordinator.on_succeeded(&JobId::from("X"));
        assert_eq!(resolution.eligible, vec![c.clone()]);

        coordinator.on_succeeded(&c);
        coordinator.forget(&[c, JobId::from("X")]);
        assert!(coordinator.edges().is_empty());
        let late = JobId::from("late");
        coordinator.register(&late, &[dep("A")]).unwrap();
        assert!(!coordinator.is_satisfied(&late));
    }
}
