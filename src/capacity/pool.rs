use std::collections::HashSet;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::capacity::signal::SpotSignal;
use crate::capacity::strategy::{
    AllocationStrategy, BestFitProgressive, Candidate, PoolView, SpotCapacityOptimized,
};
use crate::capacity::{CapacityHandle, CapacityShortfall};
use crate::config::{PoolConfig, PoolKind, StrategyKind};
use crate::error::Result;
use crate::scheduler::job::ResourceRequest;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstanceClass {
    pub name: String,
    pub vcpus: u32,
    pub memory_mib: u64,
}

impl InstanceClass {
    pub fn new(name: impl Into<String>, vcpus: u32, memory_mib: u64) -> Self {
        Self {
            name: name.into(),
            vcpus,
            memory_mib,
        }
    }

    pub fn fits(&self, request: &ResourceRequest) -> bool {
        self.vcpus >= request.vcpus && self.memory_mib >= request.memory_mib
    }
}

/// A provisioned instance (or serverless slot) and what is left on it.
#[derive(Debug, Clone)]
pub struct Instance {
    pub id: String,
    pub class: InstanceClass,
    pub free_vcpus: u32,
    pub free_memory_mib: u64,
    pub handles: HashSet<Uuid>,
    pub launched_at: DateTime<Utc>,
}

impl Instance {
    pub fn new(id: String, class: InstanceClass) -> Self {
        Self {
            id,
            free_vcpus: class.vcpus,
            free_memory_mib: class.memory_mib,
            class,
            handles: HashSet::new(),
            launched_at: Utc::now(),
        }
    }

    pub fn can_fit(&self, request: &ResourceRequest) -> bool {
        self.free_vcpus >= request.vcpus && self.free_memory_mib >= request.memory_mib
    }

    pub fn is_idle(&self) -> bool {
        self.handles.is_empty()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolSummary {
    pub name: String,
    pub kind: PoolKind,
    pub strategy: String,
    pub spot: bool,
    pub min_vcpus: u32,
    pub max_vcpus: u32,
    pub provisioned_vcpus: u32,
    pub reserved_vcpus: u32,
    pub instances: usize,
    pub active_handles: usize,
}

#[derive(Debug, Default)]
struct PoolState {
    instances: Vec<Instance>,
    provisioned_vcpus: u32,
    reserved_vcpus: u32,
    next_instance: u64,
}

/// One capacity pool. All mutations happen under the pool's own lock.
pub struct CapacityPool {
    config: PoolConfig,
    strategy: Box<dyn AllocationStrategy>,
    state: Mutex<PoolState>,
}

impl std::fmt::Debug for CapacityPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CapacityPool")
            .field("name", &self.config.name)
            .field("strategy", &self.strategy.name())
            .finish()
    }
}

impl CapacityPool {
    pub fn new(config: PoolConfig, strategy: Box<dyn AllocationStrategy>) -> Result<Self> {
        config.validate()?;
        let pool = Self {
            config,
            strategy,
            state: Mutex::new(PoolState::default()),
        };
        pool.provision_floor();
        Ok(pool)
    }

    pub fn from_config(config: PoolConfig, signal: Arc<dyn SpotSignal>) -> Result<Self> {
        let strategy: Box<dyn AllocationStrategy> = match config.allocation_strategy {
            StrategyKind::BestFitProgressive => Box::new(BestFitProgressive),
            StrategyKind::SpotCapacityOptimized => Box::new(SpotCapacityOptimized::new(signal)),
        };
        Self::new(config, strategy)
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    fn provision_floor(&self) {
        if self.config.kind == PoolKind::Fargate {
            return;
        }
        let Some(smallest) = self
            .config
            .instance_classes
            .iter()
            .min_by_key(|c| (c.vcpus, c.memory_mib))
            .cloned()
        else {
            return;
        };

        let mut state = self.state.lock();
        while state.provisioned_vcpus < self.config.min_vcpus
            && state.provisioned_vcpus + smallest.vcpus <= self.config.max_vcpus
        {
            self.launch_instance(&mut state, smallest.clone());
        }
        if state.provisioned_vcpus > 0 {
            tracing::info!(
                pool = %self.config.name,
                vcpus = state.provisioned_vcpus,
                "Provisioned pool floor"
            );
        }
    }

    fn launch_instance(&self, state: &mut PoolState, class: InstanceClass) -> usize {
        state.next_instance += 1;
        let id = format!("{}-i-{:06}", self.config.name, state.next_instance);
        state.provisioned_vcpus += class.vcpus;
        tracing::debug!(pool = %self.config.name, instance = %id, class = %class.name, "Instance launched");
        state.instances.push(Instance::new(id, class));
        state.instances.len() - 1
    }

    /// Whether some class in this pool can serve `nodes` copies of `request`.
    pub fn can_ever_fit(&self, request: &ResourceRequest, nodes: u32) -> bool {
        let total = request.vcpus.saturating_mul(nodes);
        if total > self.config.max_vcpus {
            return false;
        }
        match self.config.kind {
            PoolKind::Fargate => true,
            PoolKind::Ec2 => self.config.instance_classes.iter().any(|c| c.fits(request)),
        }
    }

    pub fn reserve(
        &self,
        request: &ResourceRequest,
    ) -> std::result::Result<CapacityHandle, CapacityShortfall> {
        let mut state = self.state.lock();
        self.reserve_locked(&mut state, request)
    }

    /// Reserve `nodes` handles at once. Either all are granted or none remain.
    pub fn reserve_nodes(
        &self,
        request: &ResourceRequest,
        nodes: u32,
    ) -> std::result::Result<Vec<CapacityHandle>, CapacityShortfall> {
        if !self.can_ever_fit(request, nodes) {
            return Err(CapacityShortfall::JobResourceRequirement);
        }

        let mut state = self.state.lock();
        let mut granted = Vec::with_capacity(nodes as usize);
        for _ in 0..nodes {
            match self.reserve_locked(&mut state, request) {
                Ok(handle) => granted.push(handle),
                Err(shortfall) => {
                    for handle in &granted {
                        self.release_locked(&mut state, handle);
                    }
                    tracing::debug!(
                        pool = %self.config.name,
                        nodes,
                        rolled_back = granted.len(),
                        reason = %shortfall,
                        "Multi-node reservation rolled back"
                    );
                    return Err(shortfall);
                }
            }
        }
        Ok(granted)
    }

    fn reserve_locked(
        &self,
        state: &mut PoolState,
        request: &ResourceRequest,
    ) -> std::result::Result<CapacityHandle, CapacityShortfall> {
        let headroom = self.config.max_vcpus.saturating_sub(state.provisioned_vcpus);

        let candidate = match self.config.kind {
            PoolKind::Fargate => {
                if request.vcpus > self.config.max_vcpus {
                    return Err(CapacityShortfall::JobResourceRequirement);
                }
                if request.vcpus > headroom {
                    return Err(CapacityShortfall::ComputeEnvironmentMaxResource);
                }
                Candidate::Provision {
                    class: InstanceClass::new(
                        format!("fargate-{}vcpu-{}mib", request.vcpus, request.memory_mib),
                        request.vcpus,
                        request.memory_mib,
                    ),
                }
            }
            PoolKind::Ec2 => {
                let view = PoolView {
                    name: &self.config.name,
                    spot: self.config.spot,
                    bid_percentage: self.config.spot_bid_percentage.unwrap_or(100),
                    classes: &self.config.instance_classes,
                    instances: &state.instances,
                    headroom_vcpus: headroom,
                };
                self.strategy.select_candidate(&view, request)?
            }
        };

        let index = match candidate {
            Candidate::Existing { instance_id } => state
                .instances
                .iter()
                .position(|i| i.id == instance_id && i.can_fit(request))
                .ok_or(CapacityShortfall::InsufficientInstanceCapacity)?,
            Candidate::Provision { class } => {
                if !class.fits(request) {
                    return Err(CapacityShortfall::JobResourceRequirement);
                }
                if class.vcpus > headroom {
                    return Err(CapacityShortfall::ComputeEnvironmentMaxResource);
                }
                self.launch_instance(state, class)
            }
        };

        let instance = &mut state.instances[index];
        instance.free_vcpus -= request.vcpus;
        instance.free_memory_mib -= request.memory_mib;
        let handle = CapacityHandle {
            id: Uuid::new_v4(),
            pool: self.config.name.clone(),
            instance_id: instance.id.clone(),
            instance_class: instance.class.name.clone(),
            vcpus: request.vcpus,
            memory_mib: request.memory_mib,
            spot: self.config.spot,
        };
        instance.handles.insert(handle.id);
        state.reserved_vcpus += request.vcpus;

        debug_assert!(state.reserved_vcpus <= state.provisioned_vcpus);
        debug_assert!(state.provisioned_vcpus <= self.config.max_vcpus);
        Ok(handle)
    }

    pub fn release(&self, handle: &CapacityHandle) -> bool {
        let mut state = self.state.lock();
        self.release_locked(&mut state, handle)
    }

    fn release_locked(&self, state: &mut PoolState, handle: &CapacityHandle) -> bool {
        let Some(index) = state
            .instances
            .iter()
            .position(|i| i.id == handle.instance_id && i.handles.contains(&handle.id))
        else {
            tracing::warn!(pool = %self.config.name, handle = %handle.id, "Release of unknown handle");
            return false;
        };

        let instance = &mut state.instances[index];
        instance.handles.remove(&handle.id);
        instance.free_vcpus += handle.vcpus;
        instance.free_memory_mib += handle.memory_mib;
        state.reserved_vcpus -= handle.vcpus;

        let instance = &state.instances[index];
        let retire = instance.is_idle()
            && match self.config.kind {
                PoolKind::Fargate => true,
                PoolKind::Ec2 => {
                    state.provisioned_vcpus - instance.class.vcpus >= self.config.min_vcpus
                }
            };
        if retire {
            let instance = state.instances.remove(index);
            state.provisioned_vcpus -= instance.class.vcpus;
            tracing::debug!(pool = %self.config.name, instance = %instance.id, "Instance retired");
        }
        true
    }

    pub fn summary(&self) -> PoolSummary {
        let state = self.state.lock();
        PoolSummary {
            name: self.config.name.clone(),
            kind: self.config.kind,
            strategy: match self.config.kind {
                PoolKind::Fargate => "fargate".to_string(),
                PoolKind::Ec2 => self.strategy.name().to_string(),
            },
            spot: self.config.spot,
            min_vcpus: self.config.min_vcpus,
            max_vcpus: self.config.max_vcpus,
            provisioned_vcpus: state.provisioned_vcpus,
            reserved_vcpus: state.reserved_vcpus,
            instances: state.instances.len(),
            active_handles: state.instances.iter().map(|i| i.handles.len()).sum(),
        }
    }
}
