//! Capacity pools: where jobs get their vCPUs and memory.
//!
//! A pool owns a set of provisioned instances (or serverless slots) and hands
//! out [`CapacityHandle`]s against them. Pools scale between a vCPU floor and
//! ceiling; which instance class to use is decided by a pluggable
//! [`AllocationStrategy`].
//!
//! # Components
//!
//! - [`CapacityPool`]: one pool with its own lock, so reservations on different
//!   pools never contend
//! - [`PoolManager`]: name-indexed set of pools built from configuration
//! - [`strategy`]: best-fit-progressive and spot-capacity-optimized selection
//! - [`signal`]: spot interruption signal consumed by the spot strategy

pub mod pool;
pub mod signal;
pub mod strategy;

use std::collections::HashMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::config::PoolConfig;
use crate::error::{BatchError, Result};
use crate::scheduler::job::ResourceRequest;

pub use pool::{CapacityPool, InstanceClass, PoolSummary};
pub use signal::{SpotSignal, StaticSpotSignal};
pub use strategy::{AllocationStrategy, BestFitProgressive, Candidate, SpotCapacityOptimized};

/// Why a reservation could not be satisfied.
///
/// Doubles as the waiting reason of a RUNNABLE run and as the trigger of
/// queue time-limit actions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CapacityShortfall {
    /// Capacity for the preferred classes is not available right now.
    InsufficientInstanceCapacity,
    /// Serving the request would push the pool above its vCPU ceiling.
    ComputeEnvironmentMaxResource,
    /// No class in the pool can ever serve the request.
    JobResourceRequirement,
}

impl std::fmt::Display for CapacityShortfall {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CapacityShortfall::InsufficientInstanceCapacity => {
                write!(f, "CAPACITY:INSUFFICIENT_INSTANCE_CAPACITY")
            }
            CapacityShortfall::ComputeEnvironmentMaxResource => {
                write!(f, "MISCONFIGURATION:COMPUTE_ENVIRONMENT_MAX_RESOURCE")
            }
            CapacityShortfall::JobResourceRequirement => {
                write!(f, "MISCONFIGURATION:JOB_RESOURCE_REQUIREMENT")
            }
        }
    }
}

/// A claim on part of one instance of one pool.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CapacityHandle {
    pub id: Uuid,
    pub pool: String,
    pub instance_id: String,
    pub instance_class: String,
    pub vcpus: u32,
    pub memory_mib: u64,
    pub spot: bool,
}

/// All pools known to the orchestrator, keyed by name.
pub struct PoolManager {
    pools: HashMap<String, Arc<CapacityPool>>,
}

impl PoolManager {
    pub fn new(configs: &[PoolConfig], signal: Arc<dyn SpotSignal>) -> Result<Self> {
        let mut pools = HashMap::new();
        for config in configs {
            let pool = CapacityPool::from_config(config.clone(), signal.clone())?;
            if pools.insert(config.name.clone(), Arc::new(pool)).is_some() {
                return Err(BatchError::Config(format!(
                    "duplicate pool name {}",
                    config.name
                )));
            }
        }
        Ok(Self { pools })
    }

    pub fn get(&self, name: &str) -> Result<Arc<CapacityPool>> {
        self.pools
            .get(name)
            .cloned()
            .ok_or_else(|| BatchError::PoolNotFound(name.to_string()))
    }

    pub fn reserve(&self, pool: &str, request: &ResourceRequest) -> Result<CapacityHandle> {
        self.get(pool)?
            .reserve(request)
            .map_err(BatchError::InsufficientCapacity)
    }

    /// Return a handle to the pool it came from. Unknown handles are ignored.
    pub fn release(&self, handle: &CapacityHandle) -> bool {
        match self.pools.get(&handle.pool) {
            Some(pool) => pool.release(handle),
            None => {
                tracing::warn!(pool = %handle.pool, handle = %handle.id, "Release for unknown pool");
                false
            }
        }
    }

    pub fn release_all(&self, handles: &[CapacityHandle]) {
        for handle in handles {
            self.release(handle);
        }
    }

    pub fn summaries(&self) -> Vec<PoolSummary> {
        let mut summaries: Vec<PoolSummary> = self.pools.values().map(|p| p.summary()).collect();
        summaries.sort_by(|a, b| a.name.cmp(&b.name));
        summaries
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manager() -> PoolManager {
        let configs = vec![
            PoolConfig::fargate("serverless", 2),
            PoolConfig::ec2("on-demand", 0, 4).with_class(InstanceClass::new("c7a.large", 2, 4096)),
        ];
        PoolManager::new(&configs, Arc::new(StaticSpotSignal::default())).unwrap()
    }

    #[test]
    fn test_reserve_and_release_through_manager() {
        let pools = manager();
        let handle = pools
            .reserve("on-demand", &ResourceRequest::new(2, 2048))
            .unwrap();
        assert_eq!(handle.pool, "on-demand");
        assert_eq!(pools.get("on-demand").unwrap().summary().reserved_vcpus, 2);

        assert!(pools.release(&handle));
        assert!(!pools.release(&handle));
        assert_eq!(pools.get("on-demand").unwrap().summary().reserved_vcpus, 0);
    }

    #[test]
    fn test_shortfall_is_a_retriable_error() {
        let pools = manager();
        let request = ResourceRequest::new(2, 1024);
        let held = pools.reserve("serverless", &request).unwrap();

        let err = pools.reserve("serverless", &request).unwrap_err();
        assert!(matches!(
            err,
            BatchError::InsufficientCapacity(CapacityShortfall::ComputeEnvironmentMaxResource)
        ));
        assert!(err.is_retriable());

        let err = pools.reserve("elsewhere", &request).unwrap_err();
        assert!(matches!(err, BatchError::PoolNotFound(_)));
        assert!(!err.is_retriable());

        pools.release_all(&[held]);
        assert!(pools.reserve("serverless", &request).is_ok());
    }

    #[test]
    fn test_duplicate_pool_names_are_rejected() {
        let configs = vec![
            PoolConfig::fargate("twin", 2),
            PoolConfig::fargate("twin", 4),
        ];
        let result = PoolManager::new(&configs, Arc::new(StaticSpotSignal::default()));
        assert!(matches!(result, Err(BatchError::Config(_))));
    }

    #[test]
    fn test_summaries_are_sorted_by_name() {
        let names: Vec<String> = manager().summaries().into_iter().map(|s| s.name).collect();
        assert_eq!(names, vec!["on-demand", "serverless"]);
    }
}
