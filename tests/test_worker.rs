//! Worker driver against an in-process coordinator.

use std::sync::Arc;
use std::time::Duration;

use anyhow::anyhow;
use pretty_assertions::assert_eq;
use tokio::sync::watch;

use productflow::{
    events, job_fn, AddDependency, Coordinator, CoordinatorApi, CoordinatorConfig, CreateProduct,
    ProductRecord, ProductState, Worker, WorkerConfig, WorkerHandle,
};

fn pipeline_config() -> CoordinatorConfig {
    CoordinatorConfig::builder()
        .temporary_store()
        .satisfied_state(ProductState::Completed)
        .default_ttl(Duration::from_millis(200))
        .heartbeat_interval(Duration::from_millis(50))
        .idle_backoff(Duration::from_millis(20), Duration::from_millis(200))
        .build()
        .unwrap()
}

async fn chain(coord: &Coordinator) {
    coord
        .create_product(CreateProduct::new("raw").state("completed"))
        .await
        .unwrap();
    coord
        .add_dependency(AddDependency::new("zip", "raw"))
        .await
        .unwrap();
    coord
        .add_dependency(AddDependency::new("blobs", "zip"))
        .await
        .unwrap();
}

fn worker(coord: &Coordinator) -> Worker {
    Worker::new(
        Arc::new(coord.clone()),
        vec!["any".to_string()],
        coord.config().worker.clone(),
    )
}

#[tokio::test]
async fn test_do_all_work_follows_the_chain() {
    let coord = Coordinator::new(pipeline_config()).unwrap();
    chain(&coord).await;

    let job = job_fn(|product: ProductRecord, handle: WorkerHandle| async move {
        handle.heartbeat("working").await?;
        Ok::<_, anyhow::Error>(Some(format!("built {}", product.pid)))
    });
    let done = worker(&coord)
        .do_all_work(&job, Duration::from_millis(200))
        .await
        .unwrap();
    assert_eq!(done, 2);

    for pid in ["zip", "blobs"] {
        let record = coord.get_product(pid).await.unwrap();
        assert_eq!(record.state, "completed");
        assert_eq!(record.event.as_deref(), Some(events::COMPLETED));
        assert_eq!(record.message, Some(format!("built {}", pid)));
    }
}

#[tokio::test]
async fn test_default_config_runs_a_full_chain() {
    let coord = Coordinator::new(CoordinatorConfig::development()).unwrap();
    chain(&coord).await;

    let job = job_fn(|_product: ProductRecord, _handle: WorkerHandle| async move {
        Ok::<_, anyhow::Error>(None)
    });
    let done = worker(&coord)
        .do_all_work(&job, Duration::from_millis(200))
        .await
        .unwrap();
    assert_eq!(done, 2);
    assert_eq!(coord.get_product("blobs").await.unwrap().state, "completed");
}

#[tokio::test]
async fn test_failed_job_reports_error() {
    let coord = Coordinator::new(pipeline_config()).unwrap();
    chain(&coord).await;

    let job = job_fn(|_product: ProductRecord, _handle: WorkerHandle| async move {
        Err::<Option<String>, _>(anyhow!("disk full"))
    });
    let done = worker(&coord)
        .do_all_work(&job, Duration::from_millis(200))
        .await
        .unwrap();
    // blobs never becomes eligible once zip fails
    assert_eq!(done, 1);

    let zip = coord.get_product("zip").await.unwrap();
    assert_eq!(zip.state, "error");
    assert_eq!(zip.event.as_deref(), Some(events::ERROR));
    assert!(zip.message.unwrap().contains("disk full"));
    assert_eq!(coord.get_product("blobs").await.unwrap().state, "waiting");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_long_job_is_kept_alive_by_heartbeats() {
    let coord = Coordinator::new(pipeline_config()).unwrap();
    coord
        .create_product(CreateProduct::new("raw").state("completed"))
        .await
        .unwrap();
    coord
        .add_dependency(AddDependency::new("slow", "raw"))
        .await
        .unwrap();

    let w = worker(&coord);
    let task = tokio::spawn(async move {
        let job = job_fn(|_product: ProductRecord, _handle: WorkerHandle| async move {
            tokio::time::sleep(Duration::from_millis(400)).await;
            Ok::<_, anyhow::Error>(None)
        });
        w.do_all_work(&job, Duration::from_millis(200)).await
    });

    tokio::time::sleep(Duration::from_millis(300)).await;
    let stats = coord.reaper().reap_once().unwrap();
    assert_eq!(stats.stale, 0);
    assert_eq!(coord.get_product("slow").await.unwrap().state, "running");

    assert_eq!(task.await.unwrap().unwrap(), 1);
    assert_eq!(coord.get_product("slow").await.unwrap().state, "completed");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_run_wakes_up_for_new_work() {
    let coord = Coordinator::new(pipeline_config()).unwrap();
    coord
        .create_product(CreateProduct::new("raw").state("completed"))
        .await
        .unwrap();

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let w = worker(&coord);
    let task = tokio::spawn(async move {
        let job = job_fn(|_product: ProductRecord, _handle: WorkerHandle| async move {
            Ok::<_, anyhow::Error>(Some("ok".to_string()))
        });
        w.run(&job, Duration::from_millis(200), shutdown_rx).await
    });

    tokio::time::sleep(Duration::from_millis(100)).await;
    coord
        .add_dependency(AddDependency::new("late", "raw"))
        .await
        .unwrap();

    let mut state = String::new();
    for _ in 0..50 {
        state = coord.get_product("late").await.unwrap().state;
        if state == "completed" {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert_eq!(state, "completed");

    shutdown_tx.send(true).unwrap();
    tokio::time::timeout(Duration::from_secs(2), task)
        .await
        .unwrap()
        .unwrap();
}

#[test]
fn test_worker_config_defaults() {
    let config = WorkerConfig::default();
    assert!(config.heartbeat_interval < CoordinatorConfig::default().liveness.default_ttl);
}
