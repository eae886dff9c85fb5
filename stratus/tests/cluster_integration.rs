//! End-to-end controller scenarios against the mock cluster.
//!
//! These tests exercise the full stack: facade preconditions, the
//! runtime proxy actor, failover dispatch and the process surface, all
//! over the in-process transport hub.

mod common;

use std::sync::Arc;
use std::time::Duration;

use common::MockCluster;
use stratus::error::ControllerError;
use stratus::package::StagedDependency;
use stratus::process::ProcessStatus;
use stratus::service::StratusCluster;

fn three_node_cluster() -> MockCluster {
    MockCluster::new(&[("n1", 7001), ("n2", 7002), ("n3", 7003)])
}

async fn booted_controller(mock: &MockCluster) -> StratusCluster {
    let cluster = StratusCluster::new_unbooted(mock.hub.clone()).unwrap();
    cluster
        .boot(mock.nodes(), Some(1), Some(1), None)
        .await
        .unwrap();
    cluster
}

#[tokio::test]
async fn test_boot_ping_shutdown_roundtrip() {
    let mock = three_node_cluster();
    let cluster = StratusCluster::new_unbooted(mock.hub.clone()).unwrap();

    let deployment = cluster
        .boot(mock.nodes(), Some(1), Some(1), None)
        .await
        .unwrap();
    assert!(!deployment.is_nil());
    assert!(cluster.is_active().await.unwrap());

    let view = cluster.last_view().await.unwrap();
    assert_eq!(view.deployment_id, deployment);
    assert_eq!(view.master, Some(mock.node("n1")));
    assert_eq!(view.alts, vec![mock.node("n2")]);
    assert!(view.workers.contains(&mock.node("n3")));

    let rtt = cluster.ping().await.unwrap();
    assert!(rtt > Duration::ZERO);

    cluster.shutdown().await.unwrap();
    assert!(!cluster.is_active().await.unwrap());

    cluster.dispose().await;
}

#[tokio::test]
async fn test_boot_on_active_cluster_fails_without_network_traffic() {
    let mock = three_node_cluster();
    let cluster = booted_controller(&mock).await;

    let before = mock.request_count();
    let err = cluster
        .boot(mock.nodes(), Some(1), Some(1), None)
        .await
        .unwrap_err();
    assert!(matches!(err, ControllerError::Precondition(_)));
    assert!(err.to_string().contains("already active"));
    assert_eq!(mock.request_count(), before);
}

#[tokio::test]
async fn test_boot_in_place_requires_prior_view() {
    let mock = three_node_cluster();
    let cluster = StratusCluster::new_unbooted(mock.hub.clone()).unwrap();

    let err = cluster.boot_in_place(None, None).await.unwrap_err();
    assert!(matches!(err, ControllerError::Precondition(_)));
    assert!(err.to_string().contains("insufficient cluster information"));
}

#[tokio::test]
async fn test_reboot_reuses_last_node_list() {
    let mock = three_node_cluster();
    let cluster = booted_controller(&mock).await;
    let first = cluster.last_view().await.unwrap().deployment_id;

    let second = cluster.reboot(Some(1), Some(1)).await.unwrap();
    assert_ne!(first, second);

    let view = cluster.last_view().await.unwrap();
    assert!(view.is_booted());
    assert_eq!(view.members().len(), 3);
}

#[tokio::test]
async fn test_attach_detach_roundtrip() {
    let mut mock = three_node_cluster();
    let cluster = booted_controller(&mock).await;
    assert_eq!(cluster.last_view().await.unwrap().members().len(), 3);

    let n4 = mock.add_node("n4", 7004);
    cluster.attach(n4.clone()).await.unwrap();
    assert_eq!(cluster.last_view().await.unwrap().members().len(), 4);

    let info = cluster.cluster_info().await.unwrap();
    assert!(!info.is_stale);
    assert_eq!(info.value.nodes.len(), 4);

    cluster.detach(n4.clone()).await.unwrap();
    let view = cluster.last_view().await.unwrap();
    assert_eq!(view.members().len(), 3);
    assert!(!view.workers.contains(&n4));
}

#[tokio::test]
async fn test_detach_requires_known_worker() {
    let mut mock = three_node_cluster();
    let cluster = booted_controller(&mock).await;

    let stranger = mock.add_node("n9", 7009);
    let err = cluster.detach(stranger).await.unwrap_err();
    assert!(matches!(err, ControllerError::Precondition(_)));
}

#[tokio::test]
async fn test_remote_error_is_transparent_and_leaves_view_unchanged() {
    let mock = three_node_cluster();
    let cluster = booted_controller(&mock).await;
    let view_before = cluster.last_view().await.unwrap();
    let requests_before = mock.request_count();

    let err = cluster
        .submit(
            &("wordcount", 7u64),
            "u64",
            vec![StagedDependency::new("missing-corpus", vec![1, 2, 3])],
        )
        .await
        .unwrap_err();

    match err {
        ControllerError::Remote(info) => {
            assert_eq!(info.message, "missing dependency: missing-corpus")
        }
        other => panic!("expected Remote, got {other:?}"),
    }

    // Exactly one attempt reached the cluster: no retry on a remote
    // error.
    assert_eq!(mock.request_count(), requests_before + 1);

    let view_after = cluster.last_view().await.unwrap();
    assert_eq!(view_after.deployment_id, view_before.deployment_id);
    assert_eq!(view_after.master, view_before.master);
}

#[tokio::test]
async fn test_submit_and_await_result() {
    let mock = three_node_cluster();
    let cluster = booted_controller(&mock).await;

    let input = ("sum-range", 0u64, 1000u64);
    let outcome = stratus::package::ComputationPackager::new(uuid::Uuid::new_v4())
        .package_named(&input, "quick-sum", "u64", Vec::new())
        .unwrap();
    let handle = cluster.create_process(outcome.image).await.unwrap();

    // The mock completes "quick-" processes after a few polls, echoing
    // the payload back as the result.
    let result: (String, u64, u64) = handle.await_result_as(None).await.unwrap();
    assert_eq!(result, ("sum-range".to_string(), 0, 1000));
    assert_eq!(handle.status().await.unwrap(), ProcessStatus::Completed);

    let logs = handle.logs().await.unwrap();
    assert_eq!(logs.len(), 1);
    assert_eq!(logs[0].message, "process created");
}

#[tokio::test]
async fn test_await_on_killed_process_fails_quickly() {
    let mock = three_node_cluster();
    let cluster = Arc::new(booted_controller(&mock).await);

    // Long-running process: never completes on its own.
    let handle = cluster.submit(&("spin", ()), "unit", Vec::new()).await.unwrap();
    let pid = handle.id();

    let killer = cluster.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(300)).await;
        killer.kill_process(pid).await.unwrap();
    });

    let started = tokio::time::Instant::now();
    let err = handle.await_result(Some(Duration::from_secs(5))).await.unwrap_err();
    assert!(matches!(err, ControllerError::ProcessKilled(id) if id == pid));
    assert!(started.elapsed() < Duration::from_secs(2));
}

#[tokio::test]
async fn test_await_timeout_leaves_process_running() {
    let mock = three_node_cluster();
    let cluster = booted_controller(&mock).await;

    let handle = cluster.submit(&("spin", ()), "unit", Vec::new()).await.unwrap();
    let err = handle
        .await_result(Some(Duration::from_millis(500)))
        .await
        .unwrap_err();
    assert!(matches!(err, ControllerError::AwaitTimeout(_)));

    // The deadline never cancels the remote process.
    assert_eq!(handle.status().await.unwrap(), ProcessStatus::Running);
}

#[tokio::test]
async fn test_clear_process_info_lifecycle() {
    let mock = three_node_cluster();
    let cluster = booted_controller(&mock).await;

    let handle = cluster.submit(&("spin", ()), "unit", Vec::new()).await.unwrap();
    let pid = handle.id();

    let err = cluster.clear_process_info(pid).await.unwrap_err();
    assert!(matches!(err, ControllerError::Precondition(_)));

    cluster.kill_process(pid).await.unwrap();
    cluster.clear_process_info(pid).await.unwrap();

    let err = cluster.process(pid).await.unwrap_err();
    assert!(matches!(err, ControllerError::NoSuchProcess(id) if id == pid));
}

#[tokio::test]
async fn test_dispose_is_idempotent_and_fences_operations() {
    let mock = three_node_cluster();
    let cluster = booted_controller(&mock).await;

    cluster.dispose().await;
    cluster.dispose().await;

    let err = cluster.ping().await.unwrap_err();
    assert!(matches!(err, ControllerError::Disposed));
    let err = cluster.last_view().await.unwrap_err();
    assert!(matches!(err, ControllerError::Disposed));
}
