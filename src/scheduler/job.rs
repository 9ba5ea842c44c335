use std::collections::BTreeMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::capacity::{CapacityHandle, CapacityShortfall};
use crate::error::{BatchError, Result};

pub const MAX_ARRAY_SIZE: u32 = 10_000;
pub const MAX_RETRY_ATTEMPTS: u32 = 10;
pub const MAX_RETRY_RULES: usize = 5;

/// Logical job identifier supplied by the submitter.
///
/// Array children are addressed as `<parent>:<index>`, so `:` is reserved.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(String);

impl JobId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn array_child(&self, index: u32) -> JobId {
        JobId(format!("{}:{}", self.0, index))
    }
}

impl std::fmt::Display for JobId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for JobId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl From<String> for JobId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobState {
    Submitted,
    Pending,
    Runnable,
    Starting,
    Running,
    Succeeded,
    Failed,
    Cancelled,
}

impl JobState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            JobState::Succeeded | JobState::Failed | JobState::Cancelled
        )
    }

    /// States a run may occupy while it sits in a queue.
    pub fn is_queued(self) -> bool {
        matches!(
            self,
            JobState::Submitted | JobState::Pending | JobState::Runnable
        )
    }

    /// Lifecycle edges for runs that are placed on capacity.
    ///
    /// Forward moves follow SUBMITTED -> PENDING -> RUNNABLE -> STARTING -> RUNNING.
    /// RUNNING -> RUNNABLE is the retry edge; STARTING -> RUNNABLE/FAILED covers a
    /// launch that never reached the container. Any live state can be cancelled.
    pub fn can_transition_to(self, next: JobState) -> bool {
        use JobState::*;
        match (self, next) {
            (Submitted, Pending)
            | (Pending, Runnable)
            | (Runnable, Starting)
            | (Starting, Running)
            | (Running, Succeeded)
            | (Running, Failed)
            | (Running, Runnable)
            | (Starting, Runnable)
            | (Starting, Failed) => true,
            (from, Cancelled) => !from.is_terminal(),
            _ => false,
        }
    }

    /// Array parents never run a container; they mirror their children.
    pub fn can_array_parent_transition_to(self, next: JobState) -> bool {
        use JobState::*;
        matches!(
            (self, next),
            (Submitted, Pending)
                | (Submitted, Cancelled)
                | (Pending, Running)
                | (Pending, Succeeded)
                | (Pending, Failed)
                | (Pending, Cancelled)
                | (Running, Succeeded)
                | (Running, Failed)
                | (Running, Cancelled)
        )
    }
}

impl std::fmt::Display for JobState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            JobState::Submitted => write!(f, "SUBMITTED"),
            JobState::Pending => write!(f, "PENDING"),
            JobState::Runnable => write!(f, "RUNNABLE"),
            JobState::Starting => write!(f, "STARTING"),
            JobState::Running => write!(f, "RUNNING"),
            JobState::Succeeded => write!(f, "SUCCEEDED"),
            JobState::Failed => write!(f, "FAILED"),
            JobState::Cancelled => write!(f, "CANCELLED"),
        }
    }
}

impl std::str::FromStr for JobState {
    type Err = BatchError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_uppercase().as_str() {
            "SUBMITTED" => Ok(JobState::Submitted),
            "PENDING" => Ok(JobState::Pending),
            "RUNNABLE" => Ok(JobState::Runnable),
            "STARTING" => Ok(JobState::Starting),
            "RUNNING" => Ok(JobState::Running),
            "SUCCEEDED" => Ok(JobState::Succeeded),
            "FAILED" => Ok(JobState::Failed),
            "CANCELLED" => Ok(JobState::Cancelled),
            other => Err(BatchError::InvalidSpec(format!("unknown job state {}", other))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceRequest {
    pub vcpus: u32,
    pub memory_mib: u64,
}

impl ResourceRequest {
    pub fn new(vcpus: u32, memory_mib: u64) -> Self {
        Self { vcpus, memory_mib }
    }
}

impl Default for ResourceRequest {
    fn default() -> Self {
        Self {
            vcpus: 1,
            memory_mib: 1024,
        }
    }
}

/// Inclusive node range of a multi-node parallel job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeRange {
    pub start_node: u32,
    pub end_node: u32,
}

impl NodeRange {
    pub fn node_count(&self) -> u32 {
        self.end_node.saturating_sub(self.start_node) + 1
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Dependency {
    pub job_id: JobId,
    /// Let the successor proceed even when this predecessor fails.
    #[serde(default)]
    pub tolerate_failure: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RetryAction {
    Retry,
    Exit,
}

/// One `(action, matcher)` entry of a retry policy.
///
/// Matchers are glob patterns (`Host EC2*`). A rule matches when every matcher
/// it carries matches.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryRule {
    pub action: RetryAction,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub on_reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub on_exit_code: Option<String>,
}

impl RetryRule {
    pub fn on_reason(action: RetryAction, pattern: impl Into<String>) -> Self {
        Self {
            action,
            on_reason: Some(pattern.into()),
            on_exit_code: None,
        }
    }

    pub fn on_exit_code(action: RetryAction, pattern: impl Into<String>) -> Self {
        Self {
            action,
            on_reason: None,
            on_exit_code: Some(pattern.into()),
        }
    }

    pub fn matches(&self, failure: &FailureReason) -> bool {
        let reason_ok = self
            .on_reason
            .as_deref()
            .map_or(true, |pattern| glob_match(pattern, &failure.message));
        let exit_ok = self.on_exit_code.as_deref().map_or(true, |pattern| {
            failure
                .exit_code
                .is_some_and(|code| glob_match(pattern, &code.to_string()))
        });
        reason_ok && exit_ok
    }
}

fn glob_match(pattern: &str, text: &str) -> bool {
    match glob::Pattern::new(pattern) {
        Ok(p) => p.matches(text),
        // Reasons may contain glob metacharacters; fall back to a literal match.
        Err(_) => pattern == text,
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Maximum number of attempts, including the first one.
    pub attempts: u32,
    #[serde(default)]
    pub rules: Vec<RetryRule>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 1,
            rules: Vec::new(),
        }
    }
}

impl RetryPolicy {
    pub fn with_attempts(attempts: u32) -> Self {
        Self {
            attempts,
            rules: Vec::new(),
        }
    }

    pub fn with_rule(mut self, rule: RetryRule) -> Self {
        self.rules.push(rule);
        self
    }

    /// First matching rule wins; no match means retry.
    pub fn action_for(&self, failure: &FailureReason) -> RetryAction {
        self.rules
            .iter()
            .find(|rule| rule.matches(failure))
            .map(|rule| rule.action)
            .unwrap_or(RetryAction::Retry)
    }

    /// Whether a run that has made `attempts_made` attempts goes back to the queue.
    pub fn should_retry(&self, failure: &FailureReason, attempts_made: u32) -> bool {
        match self.action_for(failure) {
            RetryAction::Exit => false,
            RetryAction::Retry => attempts_made < self.attempts,
        }
    }

    fn validate(&self) -> Result<()> {
        if self.attempts == 0 || self.attempts > MAX_RETRY_ATTEMPTS {
            return Err(BatchError::InvalidSpec(format!(
                "retry attempts must be between 1 and {}",
                MAX_RETRY_ATTEMPTS
            )));
        }
        if self.rules.len() > MAX_RETRY_RULES {
            return Err(BatchError::InvalidSpec(format!(
                "at most {} retry rules are allowed",
                MAX_RETRY_RULES
            )));
        }
        if self
            .rules
            .iter()
            .any(|r| r.on_reason.is_none() && r.on_exit_code.is_none())
        {
            return Err(BatchError::InvalidSpec(
                "retry rule needs on_reason or on_exit_code".to_string(),
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FailureCode {
    ExecutionFailure,
    Timeout,
    LaunchFailed,
    Cancelled,
    DependencyFailed,
    TimeLimitExceeded,
    ArrayChildFailed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailureReason {
    pub code: FailureCode,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
}

impl FailureReason {
    pub fn new(code: FailureCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            exit_code: None,
        }
    }

    pub fn execution(message: impl Into<String>, exit_code: Option<i32>) -> Self {
        Self {
            code: FailureCode::ExecutionFailure,
            message: message.into(),
            exit_code,
        }
    }

    pub fn timeout() -> Self {
        Self::new(FailureCode::Timeout, "Timeout")
    }
}

impl From<&BatchError> for FailureReason {
    fn from(err: &BatchError) -> Self {
        match err {
            BatchError::Timeout => FailureReason::timeout(),
            BatchError::ExecutionFailure(reason) => FailureReason::execution(reason.clone(), None),
            other => FailureReason::new(FailureCode::LaunchFailed, other.to_string()),
        }
    }
}

/// Immutable description of a submitted job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobSpec {
    pub id: JobId,
    pub queue: String,
    pub image: String,
    pub command: String,
    #[serde(default)]
    pub environment: BTreeMap<String, String>,
    #[serde(default)]
    pub resources: ResourceRequest,
    /// Scheduling priority inside the queue, higher first.
    #[serde(default)]
    pub priority: i32,
    /// 0 means a plain job; otherwise the number of array children.
    #[serde(default)]
    pub array_size: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_range: Option<NodeRange>,
    #[serde(default)]
    pub dependencies: Vec<Dependency>,
    #[serde(default)]
    pub retry: RetryPolicy,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_secs: Option<u64>,
    /// Array jobs: fail the parent on the first failed child.
    #[serde(default)]
    pub fail_fast: bool,
}

impl JobSpec {
    pub fn new(
        id: impl Into<JobId>,
        queue: impl Into<String>,
        image: impl Into<String>,
        command: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            queue: queue.into(),
            image: image.into(),
            command: command.into(),
            environment: BTreeMap::new(),
            resources: ResourceRequest::default(),
            priority: 0,
            array_size: 0,
            node_range: None,
            dependencies: Vec::new(),
            retry: RetryPolicy::default(),
            timeout_secs: None,
            fail_fast: false,
        }
    }

    pub fn with_resources(mut self, vcpus: u32, memory_mib: u64) -> Self {
        self.resources = ResourceRequest::new(vcpus, memory_mib);
        self
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_array_size(mut self, size: u32) -> Self {
        self.array_size = size;
        self
    }

    pub fn with_nodes(mut self, start_node: u32, end_node: u32) -> Self {
        self.node_range = Some(NodeRange {
            start_node,
            end_node,
        });
        self
    }

    pub fn depends_on(mut self, job_id: impl Into<JobId>) -> Self {
        self.dependencies.push(Dependency {
            job_id: job_id.into(),
            tolerate_failure: false,
        });
        self
    }

    pub fn depends_on_tolerating_failure(mut self, job_id: impl Into<JobId>) -> Self {
        self.dependencies.push(Dependency {
            job_id: job_id.into(),
            tolerate_failure: true,
        });
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout_secs = Some(timeout.as_secs());
        self
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.environment.insert(key.into(), value.into());
        self
    }

    pub fn with_fail_fast(mut self, fail_fast: bool) -> Self {
        self.fail_fast = fail_fast;
        self
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout_secs.map(Duration::from_secs)
    }

    pub fn is_array(&self) -> bool {
        self.array_size > 0
    }

    pub fn node_count(&self) -> u32 {
        self.node_range.map(|r| r.node_count()).unwrap_or(1)
    }

    pub fn validate(&self) -> Result<()> {
        let invalid = |msg: &str| Err(BatchError::InvalidSpec(format!("{}: {}", self.id, msg)));

        if self.id.as_str().is_empty() || self.id.as_str().contains(':') {
            return invalid("job id must be non-empty and must not contain ':'");
        }
        if self.queue.is_empty() {
            return invalid("queue is required");
        }
        if self.image.is_empty() {
            return invalid("image is required");
        }
        if self.resources.vcpus == 0 || self.resources.memory_mib == 0 {
            return invalid("vcpus and memory must be positive");
        }
        if self.array_size == 1 || self.array_size > MAX_ARRAY_SIZE {
            return invalid("array size must be 0 or between 2 and 10000");
        }
        if let Some(range) = self.node_range {
            if range.end_node < range.start_node {
                return invalid("end_node must not be lower than start_node");
            }
            if self.is_array() {
                return invalid("multi-node jobs cannot be array jobs");
            }
        }
        if self.timeout_secs == Some(0) {
            return invalid("timeout must be positive");
        }
        self.retry.validate()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RunKind {
    Single,
    MultiNode { nodes: u32 },
    ArrayParent { size: u32 },
    ArrayChild { parent: JobId, index: u32 },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttemptRecord {
    pub attempt: u32,
    pub started_at: DateTime<Utc>,
    #[serde(default)]
    pub stopped_at: Option<DateTime<Utc>>,
    pub instances: Vec<String>,
    #[serde(default)]
    pub exit_code: Option<i32>,
    #[serde(default)]
    pub failure: Option<FailureReason>,
}

/// Mutable lifecycle record of one submitted job (or array child).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobRun {
    pub job_id: JobId,
    pub spec: JobSpec,
    pub kind: RunKind,
    pub state: JobState,
    /// Submission order, used as the final FIFO tie-break in queues.
    pub sequence: u64,
    pub attempts: Vec<AttemptRecord>,
    pub handles: Vec<CapacityHandle>,
    pub created_at: DateTime<Utc>,
    pub state_entered_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub stopped_at: Option<DateTime<Utc>>,
    pub status_reason: Option<String>,
    /// Why a RUNNABLE run could not be placed, and since when.
    pub waiting_reason: Option<CapacityShortfall>,
    pub waiting_since: Option<DateTime<Utc>>,
    pub failure: Option<FailureReason>,
}

impl JobRun {
    pub fn new(job_id: JobId, spec: JobSpec, kind: RunKind, sequence: u64) -> Self {
        let now = Utc::now();
        Self {
            job_id,
            spec,
            kind,
            state: JobState::Submitted,
            sequence,
            attempts: Vec::new(),
            handles: Vec::new(),
            created_at: now,
            state_entered_at: now,
            started_at: None,
            stopped_at: None,
            status_reason: None,
            waiting_reason: None,
            waiting_since: None,
            failure: None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }

    pub fn is_array_parent(&self) -> bool {
        matches!(self.kind, RunKind::ArrayParent { .. })
    }

    pub fn array_parent(&self) -> Option<&JobId> {
        match &self.kind {
            RunKind::ArrayChild { parent, .. } => Some(parent),
            _ => None,
        }
    }

    pub fn array_index(&self) -> Option<u32> {
        match self.kind {
            RunKind::ArrayChild { index, .. } => Some(index),
            _ => None,
        }
    }

    pub fn attempt_count(&self) -> u32 {
        self.attempts.len() as u32
    }

    /// Failure reasons of every attempt, oldest first, followed by the terminal one.
    pub fn failure_history(&self) -> Vec<&FailureReason> {
        let mut history: Vec<&FailureReason> = self
            .attempts
            .iter()
            .filter_map(|a| a.failure.as_ref())
            .collect();
        if let Some(failure) = &self.failure {
            if history.last() != Some(&failure) {
                history.push(failure);
            }
        }
        history
    }

    pub fn time_in_state(&self, now: DateTime<Utc>) -> chrono::Duration {
        now - self.state_entered_at
    }

    /// Apply a lifecycle edge, rejecting anything the state machine does not allow.
    pub fn transition(
        &mut self,
        to: JobState,
        reason: Option<String>,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let allowed = if self.is_array_parent() {
            self.state.can_array_parent_transition_to(to)
        } else {
            self.state.can_transition_to(to)
        };
        if !allowed {
            return Err(BatchError::InvalidTransition {
                job_id: self.job_id.clone(),
                from: self.state,
                to,
            });
        }

        if self.state == JobState::Runnable {
            self.waiting_reason = None;
            self.waiting_since = None;
        }
        self.state = to;
        self.state_entered_at = now;
        if reason.is_some() {
            self.status_reason = reason;
        }
        if to == JobState::Running && self.started_at.is_none() {
            self.started_at = Some(now);
        }
        if to.is_terminal() {
            self.stopped_at = Some(now);
        }
        Ok(())
    }
}
