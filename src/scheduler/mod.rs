//! Job model, admission and placement.
//!
//! # Components
//!
//! - [`job`]: specs, runs and the lifecycle state machine
//! - [`JobStore`]: every run the orchestrator knows about
//! - [`JobQueue`]: priority/FIFO ordering of runs waiting for capacity
//! - [`DependencyCoordinator`]: predecessor edges and cycle rejection
//! - [`Scheduler`]: the tick that matches queued runs to pools

pub mod dependency;
pub mod job;
pub mod placement;
pub mod queue;
pub mod store;

pub use dependency::{DependencyCoordinator, DependencyEdge, Resolution};
pub use job::{
    Dependency, FailureCode, FailureReason, JobId, JobRun, JobSpec, JobState, ResourceRequest,
    RetryAction, RetryPolicy, RetryRule, RunKind,
};
pub use placement::{ExpiredRun, Placement, Scheduler, TickReport};
pub use queue::{JobQueue, QueueEntry, QueueKey, QueueSummary};
pub use store::JobStore;
