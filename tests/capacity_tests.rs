//! Placement against bounded pools: vCPU ceilings and floors, multi-node
//! reservations and queue time limits.

mod test_harness;

use std::time::Duration;

use chrono::Utc;

use batch_lite::capacity::{CapacityShortfall, InstanceClass};
use batch_lite::config::{PoolConfig, QueueConfig, TimeLimitAction};
use batch_lite::scheduler::job::{FailureCode, JobId, JobSpec, JobState};
use test_harness::{
    assert_eventually, ec2_config, fargate_config, orchestrator, Scripted, ScriptedExecutor,
    TestCluster,
};

#[tokio::test]
async fn test_running_jobs_never_exceed_pool_ceiling() {
    let cluster = TestCluster::start(fargate_config(2));
    for i in 0..6 {
        let id = format!("job-{}", i);
        cluster.executor.script(&id, [Scripted::Hold]);
        cluster
            .orchestrator
            .submit_job(JobSpec::new(id.as_str(), "q", "alpine", "true"))
            .unwrap();
    }

    let orchestrator = cluster.orchestrator.clone();
    assert_eventually(
        || {
            let running = orchestrator.list_jobs(Some(JobState::Running)).len();
            async move { running == 2 }
        },
        Duration::from_secs(5),
        "two jobs should be running",
    )
    .await;

    let pool = &cluster.orchestrator.list_pools()[0];
    assert_eq!(pool.reserved_vcpus, 2);
    assert!(pool.provisioned_vcpus <= pool.max_vcpus);
    let waiting = cluster.orchestrator.list_jobs(Some(JobState::Runnable));
    assert_eq!(waiting.len(), 4);
    assert!(waiting.iter().all(|r| {
        r.waiting_reason == Some(CapacityShortfall::ComputeEnvironmentMaxResource)
    }));

    for i in 0..6 {
        cluster.executor.release(&format!("job-{}", i));
    }
    for i in 0..6 {
        assert!(
            cluster
                .wait_for_state(&format!("job-{}", i), JobState::Succeeded)
                .await
        );
    }
    assert!(cluster.executor.max_running() <= 2);
    let pool = &cluster.orchestrator.list_pools()[0];
    assert_eq!(pool.reserved_vcpus, 0);
    assert_eq!(pool.provisioned_vcpus, 0);
    cluster.shutdown().await;
}

#[tokio::test]
async fn test_pool_floor_survives_idle_periods() {
    let mut config = ec2_config(8);
    config.pools[0].min_vcpus = 4;
    let cluster = TestCluster::start(config);
    assert_eq!(cluster.orchestrator.list_pools()[0].provisioned_vcpus, 4);

    for i in 0..4 {
        cluster
            .orchestrator
            .submit_job(
                JobSpec::new(format!("floor-{}", i), "q", "alpine", "true")
                    .with_resources(2, 2048),
            )
            .unwrap();
    }
    for i in 0..4 {
        assert!(
            cluster
                .wait_for_state(&format!("floor-{}", i), JobState::Succeeded)
                .await
        );
    }

    let pool = &cluster.orchestrator.list_pools()[0];
    assert_eq!(pool.reserved_vcpus, 0);
    assert!(pool.provisioned_vcpus >= 4);
    assert!(pool.provisioned_vcpus <= 8);
    cluster.shutdown().await;
}

#[tokio::test]
async fn test_multi_node_job_is_all_or_nothing() {
    let cluster = TestCluster::start(ec2_config(6));
    cluster.executor.script("blocker", [Scripted::Hold]);
    cluster
        .orchestrator
        .submit_job(JobSpec::new("blocker", "q", "alpine", "true").with_resources(2, 2048))
        .unwrap();
    assert!(cluster.wait_for_state("blocker", JobState::Running).await);

    cluster
        .orchestrator
        .submit_job(
            JobSpec::new("mnp", "q", "alpine", "mpirun")
                .with_resources(2, 2048)
                .with_nodes(0, 2),
        )
        .unwrap();

    let orchestrator = cluster.orchestrator.clone();
    let mnp = JobId::from("mnp");
    assert_eventually(
        || {
            let waiting = orchestrator
                .get_job_status(&mnp)
                .map(|r| r.waiting_reason.is_some())
                .unwrap_or(false);
            async move { waiting }
        },
        Duration::from_secs(5),
        "multi-node job should record why it waits",
    )
    .await;

    let run = cluster.status("mnp");
    assert_eq!(run.state, JobState::Runnable);
    assert!(run.handles.is_empty());
    assert_eq!(
        run.waiting_reason,
        Some(CapacityShortfall::ComputeEnvironmentMaxResource)
    );
    let pool = &cluster.orchestrator.list_pools()[0];
    assert_eq!(pool.reserved_vcpus, 2);
    assert_eq!(pool.active_handles, 1);
    assert_eq!(cluster.orchestrator.list_queues()[0].runnable, 1);

    cluster.executor.release("blocker");
    assert!(cluster.wait_for_state("mnp", JobState::Succeeded).await);

    let nodes: Vec<_> = cluster
        .executor
        .launched()
        .into_iter()
        .filter(|spec| spec.job_id.as_str() == "mnp")
        .collect();
    assert_eq!(nodes.len(), 3);
    for (i, node) in nodes.iter().enumerate() {
        assert_eq!(node.environment["BATCH_JOB_NODE_INDEX"], i.to_string());
        assert_eq!(node.environment["BATCH_JOB_MAIN_NODE_INDEX"], "0");
        assert_eq!(node.environment["BATCH_JOB_NUM_NODES"], "3");
    }
    let main = &nodes[0].environment["BATCH_JOB_MAIN_NODE_INSTANCE"];
    assert!(nodes
        .iter()
        .all(|n| &n.environment["BATCH_JOB_MAIN_NODE_INSTANCE"] == main));
    cluster.shutdown().await;
}

#[tokio::test]
async fn test_multi_node_attempt_fails_when_one_node_fails() {
    let cluster = TestCluster::start(ec2_config(6));
    cluster.executor.script(
        "mnp",
        [
            Scripted::Hang,
            Scripted::fail("Essential container in task exited"),
            Scripted::Hang,
        ],
    );
    cluster
        .orchestrator
        .submit_job(
            JobSpec::new("mnp", "q", "alpine", "mpirun")
                .with_resources(2, 2048)
                .with_nodes(0, 2),
        )
        .unwrap();

    assert!(cluster.wait_for_state("mnp", JobState::Failed).await);
    assert_eq!(cluster.executor.running(), 0);
    assert!(cluster.executor.terminated() >= 2);
    assert_eq!(cluster.orchestrator.list_pools()[0].reserved_vcpus, 0);
    cluster.shutdown().await;
}

#[tokio::test]
async fn test_request_larger_than_any_class_waits_on_requirement() {
    let executor = ScriptedExecutor::new();
    let orch = orchestrator(ec2_config(16), executor.clone());
    orch.submit_job(JobSpec::new("huge", "q", "alpine", "true").with_resources(8, 4096))
        .unwrap();

    let report = orch.tick();
    assert!(report.placed.is_empty());
    assert_eq!(report.waiting.len(), 1);
    let run = orch.get_job_status(&JobId::from("huge")).unwrap();
    assert_eq!(run.state, JobState::Runnable);
    assert_eq!(
        run.waiting_reason,
        Some(CapacityShortfall::JobResourceRequirement)
    );
    assert!(executor.launched().is_empty());
}

#[tokio::test]
async fn test_time_limit_cancels_job_stuck_in_runnable() {
    let executor = ScriptedExecutor::new();
    let mut config = ec2_config(16);
    config.queues[0] = QueueConfig::new("q", 1)
        .with_pool("ec2", 1)
        .with_time_limit(TimeLimitAction::cancel_after(
            CapacityShortfall::JobResourceRequirement,
            Duration::from_secs(600),
        ));
    let orch = orchestrator(config, executor);
    orch.submit_job(JobSpec::new("stuck", "q", "alpine", "true").with_resources(8, 4096))
        .unwrap();
    let id = JobId::from("stuck");

    let t0 = Utc::now();
    orch.tick_at(t0);
    assert_eq!(orch.get_job_status(&id).unwrap().waiting_since, Some(t0));

    let report = orch.tick_at(t0 + chrono::Duration::minutes(9));
    assert!(report.expired.is_empty());
    assert_eq!(orch.get_job_status(&id).unwrap().state, JobState::Runnable);

    let report = orch.tick_at(t0 + chrono::Duration::minutes(10));
    assert_eq!(report.expired.len(), 1);
    let run = orch.get_job_status(&id).unwrap();
    assert_eq!(run.state, JobState::Cancelled);
    assert_eq!(run.failure.unwrap().code, FailureCode::TimeLimitExceeded);
    assert_eq!(orch.list_queues()[0].total, 0);
}

#[tokio::test]
async fn test_higher_priority_queue_is_served_first() {
    let executor = ScriptedExecutor::new();
    let mut config = fargate_config(1);
    config.queues.push(QueueConfig::new("urgent", 10).with_pool("fargate", 1));
    let orch = orchestrator(config, executor.clone());

    orch.submit_job(JobSpec::new("routine", "q", "alpine", "true"))
        .unwrap();
    orch.submit_job(JobSpec::new("page", "urgent", "alpine", "true"))
        .unwrap();

    let report = orch.tick();
    assert_eq!(report.placed.len(), 1);
    assert_eq!(report.placed[0].job_id, JobId::from("page"));
    assert_eq!(report.placed[0].queue, "urgent");
    assert_eq!(
        orch.get_job_status(&JobId::from("routine")).unwrap().state,
        JobState::Runnable
    );
}

#[tokio::test]
async fn test_queue_falls_through_to_second_pool() {
    let executor = ScriptedExecutor::new();
    let mut config = ec2_config(2);
    config.pools.push(
        PoolConfig::ec2("overflow", 0, 8).with_class(InstanceClass::new("m7a.large", 2, 8192)),
    );
    config.queues[0] = QueueConfig::new("q", 1)
        .with_pool("ec2", 1)
        .with_pool("overflow", 2);
    let orch = orchestrator(config, executor);

    for i in 0..2 {
        orch.submit_job(
            JobSpec::new(format!("spill-{}", i), "q", "alpine", "true").with_resources(2, 2048),
        )
        .unwrap();
    }
    let report = orch.tick();
    assert_eq!(report.placed.len(), 2);
    assert_eq!(report.placed[0].pool, "ec2");
    assert_eq!(report.placed[1].pool, "overflow");
}
