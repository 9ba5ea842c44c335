use std::collections::{BTreeMap, HashMap, HashSet};
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::capacity::signal::SpotObservation;
use crate::capacity::{CapacityShortfall, InstanceClass};
use crate::error::{BatchError, Result};
use crate::scheduler::job::{
    JobId, JobSpec, NodeRange, ResourceRequest, RetryAction, RetryPolicy, RetryRule,
};

/// Maximum number of pools a single queue may draw from.
const MAX_POOLS_PER_QUEUE: usize = 3;
/// Longest retention or time limit accepted: about a century.
const MAX_DURATION_SECS: u64 = 100 * 365 * 24 * 60 * 60;

/// Sandbox applied to every container started by the Docker executor.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SandboxConfig {
    /// Docker CLI binary to invoke
    pub docker_binary: String,
    /// Disable network access in containers
    pub network_disabled: bool,
    /// Drop all Linux capabilities and forbid privilege escalation
    pub drop_capabilities: bool,
    /// Mount the container root filesystem read-only
    pub read_only_root: bool,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            docker_binary: "docker".to_string(),
            network_disabled: true,
            drop_capabilities: true,
            read_only_root: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Interval between scheduling ticks
    pub tick_interval_ms: u64,
    /// Interval between executor polls of a running attempt
    pub poll_interval_ms: u64,
    /// How long terminal runs stay queryable before the archive sweep drops them
    pub retention_secs: u64,
    /// Upper bound on runs held by the job store
    pub max_jobs: usize,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            tick_interval_ms: 1000,
            poll_interval_ms: 1000,
            retention_secs: 24 * 60 * 60,
            max_jobs: 10_000,
        }
    }
}

impl SchedulerConfig {
    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn retention(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.retention_secs.min(MAX_DURATION_SECS) as i64)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PoolKind {
    /// Instance-backed pool; jobs are bin-packed onto instances
    #[default]
    Ec2,
    /// Serverless pool; every handle gets a slot sized to its request
    Fargate,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StrategyKind {
    #[default]
    BestFitProgressive,
    SpotCapacityOptimized,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolConfig {
    pub name: String,
    #[serde(default)]
    pub kind: PoolKind,
    #[serde(default)]
    pub min_vcpus: u32,
    pub max_vcpus: u32,
    #[serde(default)]
    pub spot: bool,
    /// Highest spot price accepted, as a percentage of on-demand
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub spot_bid_percentage: Option<u32>,
    #[serde(default)]
    pub allocation_strategy: StrategyKind,
    #[serde(default)]
    pub instance_classes: Vec<InstanceClass>,
}

impl PoolConfig {
    pub fn ec2(name: impl Into<String>, min_vcpus: u32, max_vcpus: u32) -> Self {
        Self {
            name: name.into(),
            kind: PoolKind::Ec2,
            min_vcpus,
            max_vcpus,
            spot: false,
            spot_bid_percentage: None,
            allocation_strategy: StrategyKind::BestFitProgressive,
            instance_classes: Vec::new(),
        }
    }

    pub fn fargate(name: impl Into<String>, max_vcpus: u32) -> Self {
        Self {
            kind: PoolKind::Fargate,
            ..Self::ec2(name, 0, max_vcpus)
        }
    }

    pub fn with_class(mut self, class: InstanceClass) -> Self {
        self.instance_classes.push(class);
        self
    }

    pub fn spot(mut self, bid_percentage: u32) -> Self {
        self.spot = true;
        self.spot_bid_percentage = Some(bid_percentage);
        self.allocation_strategy = StrategyKind::SpotCapacityOptimized;
        self
    }

    pub fn validate(&self) -> Result<()> {
        let invalid = |msg: &str| Err(BatchError::Config(format!("pool {}: {}", self.name, msg)));

        if self.name.is_empty() {
            return invalid("name is required");
        }
        if self.min_vcpus > self.max_vcpus {
            return invalid("min_vcpus must not exceed max_vcpus");
        }
        if let Some(bid) = self.spot_bid_percentage {
            if !self.spot {
                return invalid("spot_bid_percentage requires spot");
            }
            if !(1..=100).contains(&bid) {
                return invalid("spot_bid_percentage must be between 1 and 100");
            }
        }
        if self.allocation_strategy == StrategyKind::SpotCapacityOptimized && !self.spot {
            return invalid("spot_capacity_optimized requires spot");
        }
        match self.kind {
            PoolKind::Ec2 => {
                if self.instance_classes.is_empty() {
                    return invalid("at least one instance class is required");
                }
                if self
                    .instance_classes
                    .iter()
                    .any(|c| c.vcpus == 0 || c.memory_mib == 0)
                {
                    return invalid("instance classes need positive vcpus and memory");
                }
            }
            PoolKind::Fargate => {
                if self.min_vcpus > 0 {
                    return invalid("fargate pools cannot keep a vCPU floor");
                }
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolOrder {
    pub pool: String,
    /// Lower is preferred
    pub order: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TimeLimitState {
    #[default]
    Runnable,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TimeLimitActionKind {
    #[default]
    Cancel,
}

/// Act on runs stuck in `state` for `reason` longer than `max_time_secs`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeLimitAction {
    pub reason: CapacityShortfall,
    pub max_time_secs: u64,
    #[serde(default)]
    pub state: TimeLimitState,
    #[serde(default)]
    pub action: TimeLimitActionKind,
}

impl TimeLimitAction {
    pub fn cancel_after(reason: CapacityShortfall, max_time: Duration) -> Self {
        Self {
            reason,
            max_time_secs: max_time.as_secs(),
            state: TimeLimitState::Runnable,
            action: TimeLimitActionKind::Cancel,
        }
    }

    pub fn max_time(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.max_time_secs.min(MAX_DURATION_SECS) as i64)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueConfig {
    pub name: String,
    /// Queues with a higher priority are scheduled first
    #[serde(default)]
    pub priority: i32,
    pub pools: Vec<PoolOrder>,
    #[serde(default)]
    pub time_limit_actions: Vec<TimeLimitAction>,
}

impl QueueConfig {
    pub fn new(name: impl Into<String>, priority: i32) -> Self {
        Self {
            name: name.into(),
            priority,
            pools: Vec::new(),
            time_limit_actions: Vec::new(),
        }
    }

    pub fn with_pool(mut self, pool: impl Into<String>, order: u32) -> Self {
        self.pools.push(PoolOrder {
            pool: pool.into(),
            order,
        });
        self
    }

    pub fn with_time_limit(mut self, action: TimeLimitAction) -> Self {
        self.time_limit_actions.push(action);
        self
    }

    /// Pool names in preference order.
    pub fn ordered_pools(&self) -> Vec<String> {
        let mut pools = self.pools.clone();
        pools.sort_by_key(|p| p.order);
        pools.into_iter().map(|p| p.pool).collect()
    }
}

/// Reusable job template; submissions reference it by name.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobDefinition {
    pub name: String,
    pub image: String,
    pub command: String,
    #[serde(default)]
    pub resources: ResourceRequest,
    #[serde(default)]
    pub environment: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_range: Option<NodeRange>,
    #[serde(default)]
    pub retry: RetryPolicy,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_secs: Option<u64>,
}

impl JobDefinition {
    pub fn new(name: impl Into<String>, image: impl Into<String>, command: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            image: image.into(),
            command: command.into(),
            resources: ResourceRequest::default(),
            environment: BTreeMap::new(),
            node_range: None,
            retry: RetryPolicy::default(),
            timeout_secs: None,
        }
    }

    /// Build a job spec from this template.
    pub fn instantiate(&self, job_id: impl Into<JobId>, queue: impl Into<String>) -> JobSpec {
        let mut spec = JobSpec::new(job_id, queue, self.image.clone(), self.command.clone());
        spec.resources = self.resources;
        spec.environment = self.environment.clone();
        spec.node_range = self.node_range;
        spec.retry = self.retry.clone();
        spec.timeout_secs = self.timeout_secs;
        spec
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrchestratorConfig {
    #[serde(default = "default_api_addr")]
    pub api_addr: SocketAddr,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub sandbox: SandboxConfig,
    #[serde(default)]
    pub pools: Vec<PoolConfig>,
    #[serde(default)]
    pub queues: Vec<QueueConfig>,
    #[serde(default)]
    pub job_definitions: Vec<JobDefinition>,
    /// Static spot market observations per instance class
    #[serde(default)]
    pub spot_market: HashMap<String, SpotObservation>,
}

fn default_api_addr() -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], 8080))
}

fn workshop_classes() -> Vec<InstanceClass> {
    vec![
        InstanceClass::new("c7a.medium", 1, 2048),
        InstanceClass::new("c7a.large", 2, 4096),
        InstanceClass::new("m7a.medium", 1, 4096),
        InstanceClass::new("m7a.large", 2, 8192),
    ]
}

fn workshop_definition(name: &str, image: &str, vcpus: u32, memory_mib: u64) -> JobDefinition {
    let mut def = JobDefinition::new(name, image, "stress-ng --cpu 1 --timeout 60s");
    def.resources = ResourceRequest::new(vcpus, memory_mib);
    def.timeout_secs = Some(180);
    def.retry = RetryPolicy::with_attempts(3);
    def
}

impl Default for OrchestratorConfig {
    /// A stack with an on-demand pool, a spot pool and a serverless pool.
    fn default() -> Self {
        let mut on_demand = PoolConfig::ec2("stress-ng-ec2", 0, 256);
        on_demand.instance_classes = workshop_classes();
        let mut spot = PoolConfig::ec2("stress-ng-ce-spot", 0, 256).spot(100);
        spot.instance_classes = workshop_classes();
        let fargate = PoolConfig::fargate("fargate", 256);

        let ten_minutes = Duration::from_secs(600);
        let queues = vec![
            QueueConfig::new("stress-ng-queue", 1)
                .with_pool("stress-ng-ec2", 1)
                .with_time_limit(TimeLimitAction::cancel_after(
                    CapacityShortfall::InsufficientInstanceCapacity,
                    ten_minutes,
                ))
                .with_time_limit(TimeLimitAction::cancel_after(
                    CapacityShortfall::ComputeEnvironmentMaxResource,
                    ten_minutes,
                ))
                .with_time_limit(TimeLimitAction::cancel_after(
                    CapacityShortfall::JobResourceRequirement,
                    ten_minutes,
                )),
            QueueConfig::new("stress-ng-queue-spot", 1).with_pool("stress-ng-ce-spot", 1),
            QueueConfig::new("fargate-queue", 1).with_pool("fargate", 1),
        ];

        let mut mnp = workshop_definition("mnp-job-definition", "batch-lite/multi-node", 2, 1024);
        mnp.node_range = Some(NodeRange {
            start_node: 0,
            end_node: 2,
        });
        let mut follower_spot = workshop_definition(
            "stress-ng-follower-spot-job-definition",
            "batch-lite/follower",
            1,
            1024,
        );
        follower_spot.retry = RetryPolicy::with_attempts(5)
            .with_rule(RetryRule::on_reason(RetryAction::Retry, "Host EC2*"))
            .with_rule(RetryRule::on_reason(RetryAction::Exit, "*"));

        Self {
            api_addr: default_api_addr(),
            scheduler: SchedulerConfig::default(),
            sandbox: SandboxConfig::default(),
            pools: vec![on_demand, spot, fargate],
            queues,
            job_definitions: vec![
                workshop_definition("stress-ng-job-definition", "batch-lite/single", 1, 1024),
                workshop_definition(
                    "stress-ng-array-job-definition",
                    "batch-lite/array",
                    1,
                    1024,
                ),
                mnp,
                workshop_definition(
                    "stress-ng-leader-job-definition",
                    "batch-lite/leader",
                    1,
                    1024,
                ),
                workshop_definition(
                    "stress-ng-follower-job-definition",
                    "batch-lite/follower",
                    1,
                    1024,
                ),
                follower_spot,
                workshop_definition("fargate-job-definition", "batch-lite/single", 1, 2048),
            ],
            spot_market: HashMap::new(),
        }
    }
}

impl OrchestratorConfig {
    /// An empty configuration: no pools, queues or definitions.
    pub fn empty() -> Self {
        Self {
            pools: Vec::new(),
            queues: Vec::new(),
            job_definitions: Vec::new(),
            ..Self::default()
        }
    }

    pub fn with_pool(mut self, pool: PoolConfig) -> Self {
        self.pools.push(pool);
        self
    }

    pub fn with_queue(mut self, queue: QueueConfig) -> Self {
        self.queues.push(queue);
        self
    }

    pub fn with_definition(mut self, definition: JobDefinition) -> Self {
        self.job_definitions.push(definition);
        self
    }

    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let config: Self = serde_yaml::from_str(yaml)?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let contents = std::fs::read_to_string(path.as_ref())?;
        Self::from_yaml(&contents)
    }

    pub fn validate(&self) -> Result<()> {
        let mut pool_names = HashSet::new();
        for pool in &self.pools {
            pool.validate()?;
            if !pool_names.insert(pool.name.as_str()) {
                return Err(BatchError::Config(format!("duplicate pool {}", pool.name)));
            }
        }

        let mut queue_names = HashSet::new();
        for queue in &self.queues {
            if !queue_names.insert(queue.name.as_str()) {
                return Err(BatchError::Config(format!("duplicate queue {}", queue.name)));
            }
            if queue.pools.is_empty() || queue.pools.len() > MAX_POOLS_PER_QUEUE {
                return Err(BatchError::Config(format!(
                    "queue {} must reference between 1 and {} pools",
                    queue.name, MAX_POOLS_PER_QUEUE
                )));
            }
            if queue
                .time_limit_actions
                .iter()
                .any(|a| a.max_time_secs > MAX_DURATION_SECS)
            {
                return Err(BatchError::Config(format!(
                    "queue {} has a time limit above {} seconds",
                    queue.name, MAX_DURATION_SECS
                )));
            }
            if let Some(missing) = queue
                .pools
                .iter()
                .find(|p| !pool_names.contains(p.pool.as_str()))
            {
                return Err(BatchError::Config(format!(
                    "queue {} references unknown pool {}",
                    queue.name, missing.pool
                )));
            }
        }

        let mut definition_names = HashSet::new();
        for definition in &self.job_definitions {
            if !definition_names.insert(definition.name.as_str()) {
                return Err(BatchError::Config(format!(
                    "duplicate job definition {}",
                    definition.name
                )));
            }
        }

        if self.scheduler.tick_interval_ms == 0 || self.scheduler.poll_interval_ms == 0 {
            return Err(BatchError::Config(
                "tick and poll intervals must be positive".to_string(),
            ));
        }
        if self.scheduler.retention_secs > MAX_DURATION_SECS {
            return Err(BatchError::Config(format!(
                "retention_secs must not exceed {}",
                MAX_DURATION_SECS
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sandbox_config_default() {
        let cfg = SandboxConfig::default();
        assert_eq!(cfg.docker_binary, "docker");
        assert!(cfg.network_disabled);
        assert!(cfg.drop_capabilities);
        assert!(cfg.read_only_root);
    }

    #[test]
    fn scheduler_config_default() {
        let cfg = SchedulerConfig::default();
        assert_eq!(cfg.tick_interval(), Duration::from_secs(1));
        assert_eq!(cfg.poll_interval(), Duration::from_secs(1));
        assert_eq!(cfg.retention(), chrono::Duration::hours(24));
        assert_eq!(cfg.max_jobs, 10_000);
    }

    #[test]
    fn default_stack_is_valid() {
        let cfg = OrchestratorConfig::default();
        cfg.validate().unwrap();
        assert_eq!(cfg.pools.len(), 3);
        assert_eq!(cfg.queues.len(), 3);
        assert_eq!(cfg.queues[0].time_limit_actions.len(), 3);

        let spot = &cfg.pools[1];
        assert!(spot.spot);
        assert_eq!(spot.spot_bid_percentage, Some(100));
        assert_eq!(spot.allocation_strategy, StrategyKind::SpotCapacityOptimized);
    }

    #[test]
    fn min_above_max_is_rejected() {
        let pool = PoolConfig::ec2("p", 8, 4).with_class(InstanceClass::new("c", 1, 1024));
        assert!(pool.validate().is_err());
    }

    #[test]
    fn bid_percentage_bounds() {
        let pool = PoolConfig::ec2("p", 0, 4)
            .with_class(InstanceClass::new("c", 1, 1024))
            .spot(0);
        assert!(pool.validate().is_err());

        let pool = PoolConfig::ec2("p", 0, 4)
            .with_class(InstanceClass::new("c", 1, 1024))
            .spot(101);
        assert!(pool.validate().is_err());
    }

    #[test]
    fn queue_with_unknown_pool_is_rejected() {
        let cfg = OrchestratorConfig::empty()
            .with_pool(PoolConfig::fargate("fargate", 4))
            .with_queue(QueueConfig::new("q", 1).with_pool("missing", 1));
        assert!(matches!(cfg.validate(), Err(BatchError::Config(_))));
    }

    #[test]
    fn unbounded_durations_are_rejected() {
        let mut cfg = OrchestratorConfig::default();
        cfg.scheduler.retention_secs = u64::MAX;
        assert!(matches!(cfg.validate(), Err(BatchError::Config(_))));
        assert!(cfg.scheduler.retention() > chrono::Duration::days(365));

        let cfg = OrchestratorConfig::empty()
            .with_pool(PoolConfig::fargate("fargate", 4))
            .with_queue(
                QueueConfig::new("q", 1)
                    .with_pool("fargate", 1)
                    .with_time_limit(TimeLimitAction {
                        reason: CapacityShortfall::JobResourceRequirement,
                        max_time_secs: u64::MAX,
                        state: TimeLimitState::Runnable,
                        action: TimeLimitActionKind::Cancel,
                    }),
            );
        assert!(matches!(cfg.validate(), Err(BatchError::Config(ref msg)) if msg.contains("time limit")));
    }

    #[test]
    fn ordered_pools_follow_order_field() {
        let queue = QueueConfig::new("q", 1)
            .with_pool("second", 2)
            .with_pool("first", 1);
        assert_eq!(queue.ordered_pools(), vec!["first", "second"]);
    }

    #[test]
    fn yaml_config_parses() {
        let yaml = r#"
api_addr: "127.0.0.1:9090"
scheduler:
  tick_interval_ms: 250
pools:
  - name: spot
    max_vcpus: 64
    spot: true
    spot_bid_percentage: 60
    allocation_strategy: spot_capacity_optimized
    instance_classes:
      - { name: c7a.large, vcpus: 2, memory_mib: 4096 }
queues:
  - name: q
    priority: 10
    pools:
      - { pool: spot, order: 1 }
    time_limit_actions:
      - { reason: insufficient_instance_capacity, max_time_secs: 600 }
job_definitions:
  - name: follower
    image: alpine
    command: "echo hi"
    retry:
      attempts: 5
      rules:
        - { action: RETRY, on_reason: "Host EC2*" }
        - { action: EXIT, on_reason: "*" }
"#;
        let cfg = OrchestratorConfig::from_yaml(yaml).unwrap();
        assert_eq!(cfg.api_addr.port(), 9090);
        assert_eq!(cfg.scheduler.tick_interval_ms, 250);
        assert_eq!(cfg.scheduler.poll_interval_ms, 1000);
        assert_eq!(cfg.pools[0].kind, PoolKind::Ec2);
        assert_eq!(cfg.queues[0].time_limit_actions[0].action, TimeLimitActionKind::Cancel);
        assert_eq!(cfg.job_definitions[0].retry.rules.len(), 2);
    }

    #[test]
    fn definition_instantiates_spec() {
        let cfg = OrchestratorConfig::default();
        let mnp = cfg
            .job_definitions
            .iter()
            .find(|d| d.name == "mnp-job-definition")
            .unwrap();
        let spec = mnp.instantiate("mnp-1", "stress-ng-queue");
        assert_eq!(spec.node_count(), 3);
        assert_eq!(spec.timeout_secs, Some(180));
        assert_eq!(spec.retry.attempts, 3);
        spec.validate().unwrap();
    }
}
