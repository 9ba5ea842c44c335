use thiserror::Error;

use crate::capacity::CapacityShortfall;
use crate::scheduler::job::{JobId, JobState};

#[derive(Error, Debug)]
pub enum BatchError {
    #[error("Insufficient capacity: {0}")]
    InsufficientCapacity(CapacityShortfall),

    #[error("Invalid transition for job {job_id}: {from} -> {to}")]
    InvalidTransition {
        job_id: JobId,
        from: JobState,
        to: JobState,
    },

    #[error("Job {0} already has a run that is not finished")]
    DuplicateJob(JobId),

    #[error("Dependency cycle involving job {0}")]
    CyclicDependency(JobId),

    #[error("Job not found: {0}")]
    JobNotFound(JobId),

    #[error("Job queue not found: {0}")]
    QueueNotFound(String),

    #[error("Capacity pool not found: {0}")]
    PoolNotFound(String),

    #[error("Job definition not found: {0}")]
    DefinitionNotFound(String),

    #[error("Invalid job spec: {0}")]
    InvalidSpec(String),

    #[error("Job store is at capacity ({0} jobs)")]
    QueueFull(usize),

    #[error("Execution failed: {0}")]
    ExecutionFailure(String),

    #[error("Job attempt exceeded its timeout")]
    Timeout,

    #[error("Executor error: {0}")]
    Executor(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("API returned {status}: {message}")]
    Api { status: u16, message: String },
}

impl BatchError {
    /// Errors the caller can retry later without changing the request.
    pub fn is_retriable(&self) -> bool {
        matches!(self, BatchError::InsufficientCapacity(_))
    }
}

pub type Result<T> = std::result::Result<T, BatchError>;
