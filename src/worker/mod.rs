//! Execution of placed runs.
//!
//! # Components
//!
//! - [`Executor`]: launches, polls and terminates workloads on claimed
//!   capacity; [`DockerExecutor`] is the shipped implementation
//! - [`ExecutionSupervisor`]: one task per in-flight attempt, applying
//!   timeout and retry policy
//!
//! # Attempt Flow
//!
//! 1. The scheduler claims capacity and moves the run to STARTING
//! 2. The supervisor launches one container per capacity handle
//! 3. The run moves to RUNNING and every node is polled until it finishes
//! 4. Capacity is released and the retry policy picks SUCCEEDED, RUNNABLE
//!    or FAILED
//! 5. A [`SupervisorEvent`] tells the orchestrator what happened

pub mod executor;
pub mod supervisor;

pub use executor::{ContainerSpec, DockerExecutor, ExecutionHandle, ExecutionStatus, Executor};
pub use supervisor::{AttemptOutcome, ExecutionSupervisor, SupervisorEvent};
