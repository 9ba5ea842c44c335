use std::cmp::Ordering;
use std::sync::Arc;

use crate::capacity::pool::{Instance, InstanceClass};
use crate::capacity::signal::SpotSignal;
use crate::capacity::CapacityShortfall;
use crate::scheduler::job::ResourceRequest;

/// Read-only view of a pool handed to a strategy while the pool lock is held.
pub struct PoolView<'a> {
    pub name: &'a str,
    pub spot: bool,
    pub bid_percentage: u32,
    pub classes: &'a [InstanceClass],
    pub instances: &'a [Instance],
    /// vCPUs that may still be provisioned before hitting the ceiling.
    pub headroom_vcpus: u32,
}

/// Where a reservation should land.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Candidate {
    Existing { instance_id: String },
    Provision { class: InstanceClass },
}

pub trait AllocationStrategy: Send + Sync {
    fn name(&self) -> &'static str;

    fn select_candidate(
        &self,
        pool: &PoolView<'_>,
        request: &ResourceRequest,
    ) -> Result<Candidate, CapacityShortfall>;
}

fn tightest_instance<'a>(
    instances: impl Iterator<Item = &'a Instance>,
    request: &ResourceRequest,
) -> Option<&'a Instance> {
    instances
        .filter(|i| i.can_fit(request))
        .min_by_key(|i| {
            (
                i.free_vcpus - request.vcpus,
                i.free_memory_mib - request.memory_mib,
            )
        })
}

/// Fill existing instances first (smallest leftover), then scale up with the
/// smallest class that fits.
#[derive(Debug, Default, Clone, Copy)]
pub struct BestFitProgressive;

impl AllocationStrategy for BestFitProgressive {
    fn name(&self) -> &'static str {
        "best_fit_progressive"
    }

    fn select_candidate(
        &self,
        pool: &PoolView<'_>,
        request: &ResourceRequest,
    ) -> Result<Candidate, CapacityShortfall> {
        if let Some(instance) = tightest_instance(pool.instances.iter(), request) {
            return Ok(Candidate::Existing {
                instance_id: instance.id.clone(),
            });
        }

        let mut fitting = pool.classes.iter().filter(|c| c.fits(request)).peekable();
        if fitting.peek().is_none() {
            return Err(CapacityShortfall::JobResourceRequirement);
        }
        fitting
            .filter(|c| c.vcpus <= pool.headroom_vcpus)
            .min_by_key(|c| (c.vcpus, c.memory_mib))
            .map(|c| Candidate::Provision { class: c.clone() })
            .ok_or(CapacityShortfall::ComputeEnvironmentMaxResource)
    }
}

/// Prefer the spot class least likely to be interrupted.
pub struct SpotCapacityOptimized {
    signal: Arc<dyn SpotSignal>,
}

impl SpotCapacityOptimized {
    pub fn new(signal: Arc<dyn SpotSignal>) -> Self {
        Self { signal }
    }
}

impl AllocationStrategy for SpotCapacityOptimized {
    fn name(&self) -> &'static str {
        "spot_capacity_optimized"
    }

    fn select_candidate(
        &self,
        pool: &PoolView<'_>,
        request: &ResourceRequest,
    ) -> Result<Candidate, CapacityShortfall> {
        let fitting: Vec<&InstanceClass> =
            pool.classes.iter().filter(|c| c.fits(request)).collect();
        if fitting.is_empty() {
            return Err(CapacityShortfall::JobResourceRequirement);
        }

        let mut ranked: Vec<(&InstanceClass, f64)> = fitting
            .into_iter()
            .filter(|c| self.signal.has_capacity(&c.name))
            .filter(|c| self.signal.price_percentage(&c.name) <= pool.bid_percentage)
            .map(|c| (c, self.signal.interruption_rate(&c.name)))
            .collect();
        if ranked.is_empty() {
            return Err(CapacityShortfall::InsufficientInstanceCapacity);
        }
        ranked.sort_by(|(a, ra), (b, rb)| {
            ra.partial_cmp(rb)
                .unwrap_or(Ordering::Equal)
                .then_with(|| (a.vcpus, a.memory_mib).cmp(&(b.vcpus, b.memory_mib)))
        });

        for (class, _) in &ranked {
            let same_class = pool.instances.iter().filter(|i| i.class.name == class.name);
            if let Some(instance) = tightest_instance(same_class, request) {
                return Ok(Candidate::Existing {
                    instance_id: instance.id.clone(),
                });
            }
            if class.vcpus <= pool.headroom_vcpus {
                return Ok(Candidate::Provision {
                    class: (*class).clone(),
                });
            }
        }
        Err(CapacityShortfall::ComputeEnvironmentMaxResource)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capacity::signal::StaticSpotSignal;

    fn classes() -> Vec<InstanceClass> {
        vec![
            InstanceClass::new("c7a.large", 2, 4096),
            InstanceClass::new("c7a.medium", 1, 2048),
            InstanceClass::new("m7a.large", 2, 8192),
        ]
    }

    fn view<'a>(
        classes: &'a [InstanceClass],
        instances: &'a [Instance],
        headroom: u32,
    ) -> PoolView<'a> {
        PoolView {
            name: "pool",
            spot: true,
            bid_percentage: 100,
            classes,
            instances,
            headroom_vcpus: headroom,
        }
    }

    #[test]
    fn best_fit_provisions_smallest_fitting_class() {
        let classes = classes();
        let candidate = BestFitProgressive
            .select_candidate(&view(&classes, &[], 256), &ResourceRequest::new(1, 1024))
            .unwrap();
        assert_eq!(
            candidate,
            Candidate::Provision {
                class: InstanceClass::new("c7a.medium", 1, 2048)
            }
        );
    }

    #[test]
    fn best_fit_prefers_tightest_existing_instance() {
        let classes = classes();
        let mut roomy = Instance::new("i-1".into(), InstanceClass::new("m7a.large", 2, 8192));
        roomy.free_vcpus = 2;
        let mut tight = Instance::new("i-2".into(), InstanceClass::new("c7a.large", 2, 4096));
        tight.free_vcpus = 1;
        tight.free_memory_mib = 2048;
        let instances = vec![roomy, tight];

        let candidate = BestFitProgressive
            .select_candidate(
                &view(&classes, &instances, 0),
                &ResourceRequest::new(1, 1024),
            )
            .unwrap();
        assert_eq!(
            candidate,
            Candidate::Existing {
                instance_id: "i-2".into()
            }
        );
    }

    #[test]
    fn best_fit_reports_max_resource_without_headroom() {
        let classes = classes();
        let err = BestFitProgressive
            .select_candidate(&view(&classes, &[], 1), &ResourceRequest::new(2, 1024))
            .unwrap_err();
        assert_eq!(err, CapacityShortfall::ComputeEnvironmentMaxResource);
    }

    #[test]
    fn oversized_request_is_a_resource_requirement_problem() {
        let classes = classes();
        let err = BestFitProgressive
            .select_candidate(&view(&classes, &[], 256), &ResourceRequest::new(64, 1024))
            .unwrap_err();
        assert_eq!(err, CapacityShortfall::JobResourceRequirement);
    }

    #[test]
    fn spot_strategy_picks_lowest_interruption_rate() {
        let classes = classes();
        let signal = StaticSpotSignal::default()
            .with_rate("c7a.large", 0.4)
            .with_rate("c7a.medium", 0.3)
            .with_rate("m7a.large", 0.05);
        let strategy = SpotCapacityOptimized::new(Arc::new(signal));

        let candidate = strategy
            .select_candidate(&view(&classes, &[], 256), &ResourceRequest::new(1, 1024))
            .unwrap();
        assert_eq!(
            candidate,
            Candidate::Provision {
                class: InstanceClass::new("m7a.large", 2, 8192)
            }
        );
    }

    #[test]
    fn spot_strategy_without_market_capacity() {
        let classes = classes();
        let signal = StaticSpotSignal::default()
            .unavailable("c7a.large")
            .unavailable("c7a.medium")
            .unavailable("m7a.large");
        let strategy = SpotCapacityOptimized::new(Arc::new(signal));

        let err = strategy
            .select_candidate(&view(&classes, &[], 256), &ResourceRequest::new(1, 1024))
            .unwrap_err();
        assert_eq!(err, CapacityShortfall::InsufficientInstanceCapacity);
    }
}
