//! Heartbeats and reaping of stale running products.

use std::time::Duration;

use pretty_assertions::assert_eq;
use tokio::sync::watch;

use productflow::liveness::ReapStats;
use productflow::{
    events, AddDependency, ClaimNext, ClaimOutcome, Coordinator, CoordinatorApi,
    CoordinatorConfig, CoordinatorConfigBuilder, ReapPolicy, UpdateProduct,
};

fn short_ttl() -> CoordinatorConfigBuilder {
    CoordinatorConfig::builder()
        .temporary_store()
        .default_ttl(Duration::from_millis(200))
        .heartbeat_interval(Duration::from_millis(50))
        .reap_interval(Duration::from_millis(50))
}

async fn claim_one(coord: &Coordinator, downstream: &str, role: &str) -> String {
    coord
        .update_product(UpdateProduct::new("src").state("completed"))
        .await
        .unwrap();
    coord
        .add_dependency(AddDependency::new(downstream, "src").role(role))
        .await
        .unwrap();
    match coord.claim_next(ClaimNext::new([role])).await.unwrap() {
        ClaimOutcome::Claimed(p) => p.pid,
        ClaimOutcome::NoWork => panic!("expected {} to be claimable", downstream),
    }
}

#[tokio::test]
async fn test_stale_product_is_requeued() {
    let coord = Coordinator::new(short_ttl().build().unwrap()).unwrap();
    let pid = claim_one(&coord, "b", "any").await;

    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(coord.monitor().stale().unwrap().len(), 1);

    let stats = coord.reaper().reap_once().unwrap();
    assert_eq!(
        stats,
        ReapStats {
            stale: 1,
            requeued: 1,
            errored: 0,
            skipped: 0
        }
    );
    let record = coord.get_product(&pid).await.unwrap();
    assert_eq!(record.state, "available");
    assert_eq!(record.event.as_deref(), Some(events::REQUEUED));

    // another worker can pick it up again
    let again = coord.claim_next(ClaimNext::new(["any"])).await.unwrap();
    assert_eq!(again.into_product().unwrap().pid, "b");
}

#[tokio::test]
async fn test_requeued_product_does_not_unblock_downstream() {
    let coord = Coordinator::new(short_ttl().build().unwrap()).unwrap();
    let mid = claim_one(&coord, "mid", "any").await;
    coord
        .add_dependency(AddDependency::new("top", &mid))
        .await
        .unwrap();

    tokio::time::sleep(Duration::from_millis(300)).await;
    let stats = coord.reaper().reap_once().unwrap();
    assert_eq!(stats.requeued, 1);
    assert_eq!(coord.get_product("mid").await.unwrap().state, "available");

    // mid has to be redone before top can start
    let next = coord.claim_next(ClaimNext::new(["any"])).await.unwrap();
    assert_eq!(next.into_product().unwrap().pid, "mid");
    assert_eq!(
        coord.claim_next(ClaimNext::new(["any"])).await.unwrap(),
        ClaimOutcome::NoWork
    );
    assert_eq!(coord.get_product("top").await.unwrap().state, "waiting");
}

#[tokio::test]
async fn test_error_policy_marks_product_failed() {
    let config = short_ttl().reap_policy(ReapPolicy::Error).build().unwrap();
    let coord = Coordinator::new(config).unwrap();
    let pid = claim_one(&coord, "b", "any").await;

    tokio::time::sleep(Duration::from_millis(300)).await;
    let stats = coord.reaper().reap_once().unwrap();
    assert_eq!(stats.errored, 1);

    let record = coord.get_product(&pid).await.unwrap();
    assert_eq!(record.state, "error");
    assert_eq!(record.event.as_deref(), Some(events::EXPIRED));
    assert_eq!(
        coord.claim_next(ClaimNext::new(["any"])).await.unwrap(),
        ClaimOutcome::NoWork
    );
}

#[tokio::test]
async fn test_heartbeat_keeps_product_alive() {
    let coord = Coordinator::new(short_ttl().build().unwrap()).unwrap();
    let pid = claim_one(&coord, "b", "any").await;

    tokio::time::sleep(Duration::from_millis(150)).await;
    let beat = coord
        .heartbeat(&pid, Some("halfway".into()))
        .await
        .unwrap();
    assert_eq!(beat.state, "running");
    assert_eq!(beat.message.as_deref(), Some("halfway"));

    tokio::time::sleep(Duration::from_millis(100)).await;
    let stats = coord.reaper().reap_once().unwrap();
    assert_eq!(stats, ReapStats::default());
    assert_eq!(coord.get_product(&pid).await.unwrap().state, "running");
}

#[tokio::test]
async fn test_role_ttl_overrides_default() {
    let config = short_ttl()
        .role_ttl("slow", Duration::from_secs(30))
        .build()
        .unwrap();
    let coord = Coordinator::new(config).unwrap();
    let slow = claim_one(&coord, "slow_job", "slow").await;
    let fast = claim_one(&coord, "fast_job", "fast").await;

    tokio::time::sleep(Duration::from_millis(300)).await;
    coord.reaper().reap_once().unwrap();

    assert_eq!(coord.get_product(&slow).await.unwrap().state, "running");
    assert_eq!(coord.get_product(&fast).await.unwrap().state, "available");
}

#[tokio::test]
async fn test_heartbeat_for_unknown_product_creates_it() {
    let coord = Coordinator::new(short_ttl().build().unwrap()).unwrap();
    let record = coord.heartbeat("late", None).await.unwrap();
    assert_eq!(record.state, "updated");
    assert_eq!(record.event.as_deref(), Some(events::HEARTBEAT));
}

#[tokio::test]
async fn test_reaper_loop_runs_until_shutdown() {
    let coord = Coordinator::new(short_ttl().build().unwrap()).unwrap();
    let pid = claim_one(&coord, "b", "any").await;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let reaper = coord.reaper();
    let task = tokio::spawn(async move { reaper.run(shutdown_rx).await });

    tokio::time::sleep(Duration::from_millis(500)).await;
    assert_eq!(coord.get_product(&pid).await.unwrap().state, "available");

    shutdown_tx.send(true).unwrap();
    tokio::time::timeout(Duration::from_secs(2), task)
        .await
        .unwrap()
        .unwrap()
        .unwrap();
}
