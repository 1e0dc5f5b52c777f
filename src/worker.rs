//! Worker driver
//!
//! The collaborator loop a worker runs against any `CoordinatorApi`:
//! claim, heartbeat while the job runs, report the outcome, repeat.

use std::future::Future;
use std::marker::PhantomData;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::watch;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::api::{ApiResult, ClaimNext, ClaimOutcome, CoordinatorApi, ProductRecord, UpdateProduct};
use crate::config::WorkerConfig;
use crate::model::{events, ProductState};

/// Work performed on a claimed product. `Ok` carries an optional
/// completion message.
#[async_trait]
pub trait Job: Send + Sync {
    async fn run(&self, product: ProductRecord, handle: WorkerHandle) -> anyhow::Result<Option<String>>;
}

/// Adapts an async closure into a `Job`
pub struct FnJob<F, Fut> {
    f: F,
    _fut: PhantomData<fn() -> Fut>,
}

pub fn job_fn<F, Fut>(f: F) -> FnJob<F, Fut>
where
    F: Fn(ProductRecord, WorkerHandle) -> Fut + Send + Sync,
    Fut: Future<Output = anyhow::Result<Option<String>>> + Send,
{
    FnJob {
        f,
        _fut: PhantomData,
    }
}

#[async_trait]
impl<F, Fut> Job for FnJob<F, Fut>
where
    F: Fn(ProductRecord, WorkerHandle) -> Fut + Send + Sync,
    Fut: Future<Output = anyhow::Result<Option<String>>> + Send,
{
    async fn run(&self, product: ProductRecord, handle: WorkerHandle) -> anyhow::Result<Option<String>> {
        (self.f)(product, handle).await
    }
}

/// Given to a running job so it can report progress
#[derive(Clone)]
pub struct WorkerHandle {
    api: Arc<dyn CoordinatorApi>,
    pid: String,
}

impl WorkerHandle {
    pub fn pid(&self) -> &str {
        &self.pid
    }

    /// Heartbeat with a progress message
    pub async fn heartbeat(&self, message: impl Into<String>) -> ApiResult<ProductRecord> {
        self.api.heartbeat(&self.pid, Some(message.into())).await
    }
}

pub struct Worker {
    id: String,
    api: Arc<dyn CoordinatorApi>,
    roles: Vec<String>,
    config: WorkerConfig,
}

impl Worker {
    pub fn new(api: Arc<dyn CoordinatorApi>, roles: Vec<String>, config: WorkerConfig) -> Self {
        Self {
            id: format!("worker_{}", cuid2::create_id()),
            api,
            roles,
            config,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Heartbeat period for a job with `ttl`: the configured interval,
    /// but never more than half the TTL
    pub fn heartbeat_period(&self, ttl: Duration) -> Duration {
        self.config
            .heartbeat_interval
            .min(ttl / 2)
            .max(Duration::from_millis(1))
    }

    /// Idle sleep after `streak` consecutive empty polls
    pub fn backoff_delay(&self, streak: u32) -> Duration {
        let base = self
            .config
            .idle_backoff
            .saturating_mul(2u32.saturating_pow(streak.min(16)))
            .min(self.config.max_idle_backoff);
        let spread = self.config.jitter * (fastrand::f64() * 2.0 - 1.0);
        base.mul_f64(1.0 + spread)
    }

    /// Claim and process a single product. `None` means no work.
    pub async fn work_once(&self, job: &dyn Job, ttl: Duration) -> ApiResult<Option<ProductRecord>> {
        let claimed = match self.api.claim_next(ClaimNext::new(self.roles.clone())).await? {
            ClaimOutcome::Claimed(product) => product,
            ClaimOutcome::NoWork => return Ok(None),
        };
        info!("{} claimed {}", self.id, claimed.pid);

        let (stop_tx, stop_rx) = watch::channel(false);
        let beat = tokio::spawn(heartbeat_loop(
            self.api.clone(),
            claimed.pid.clone(),
            self.heartbeat_period(ttl),
            stop_rx,
        ));

        let handle = WorkerHandle {
            api: self.api.clone(),
            pid: claimed.pid.clone(),
        };
        let outcome = job.run(claimed.clone(), handle).await;

        let _ = stop_tx.send(true);
        if let Err(e) = beat.await {
            warn!("Heartbeat task for {} ended abnormally: {}", claimed.pid, e);
        }

        let report = match outcome {
            Ok(message) => UpdateProduct::new(&claimed.pid)
                .state(ProductState::Completed.as_str())
                .event(events::COMPLETED)
                .message(message.unwrap_or_else(|| format!("completed by {}", self.id))),
            Err(e) => {
                error!("Job on {} failed: {:#}", claimed.pid, e);
                UpdateProduct::new(&claimed.pid)
                    .state(ProductState::Error.as_str())
                    .event(events::ERROR)
                    .message(format!("{:#}", e))
            }
        };
        let finished = self.api.update_product(report).await?;
        info!("{} finished {} as {}", self.id, finished.pid, finished.state);
        Ok(Some(finished))
    }

    /// Process products until none are eligible; returns how many ran
    pub async fn do_all_work(&self, job: &dyn Job, ttl: Duration) -> ApiResult<usize> {
        let mut done = 0;
        while self.work_once(job, ttl).await?.is_some() {
            done += 1;
        }
        debug!("{} ran out of work after {} products", self.id, done);
        Ok(done)
    }

    /// Work until `shutdown` flips to true, backing off while idle and
    /// waking early on coordinator notifications
    pub async fn run(&self, job: &dyn Job, ttl: Duration, mut shutdown: watch::Receiver<bool>) {
        info!("{} serving roles {:?}", self.id, self.roles);
        let mut wakeups = self.api.subscribe();
        let mut streak: u32 = 0;

        loop {
            if *shutdown.borrow() {
                break;
            }
            match self.do_all_work(job, ttl).await {
                Ok(0) => streak = streak.saturating_add(1),
                Ok(_) => streak = 0,
                Err(e) if e.retry_after().is_some() => {
                    warn!("{} hit a transient coordinator error: {}", self.id, e);
                    streak = streak.saturating_add(1);
                    if let Some(pause) = e.retry_after() {
                        tokio::time::sleep(pause).await;
                    }
                }
                Err(e) => {
                    error!("{} stopping on non-retryable error: {}", self.id, e);
                    break;
                }
            }

            let delay = self.backoff_delay(streak.saturating_sub(1));
            debug!("{} idle for {:?}", self.id, delay);
            let woken = async {
                match wakeups.as_mut() {
                    Some(rx) => {
                        // overflow still means something happened
                        let _ = rx.recv().await;
                    }
                    None => std::future::pending::<()>().await,
                }
            };
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = woken => streak = 0,
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        info!("{} shutting down", self.id);
    }
}

async fn heartbeat_loop(
    api: Arc<dyn CoordinatorApi>,
    pid: String,
    period: Duration,
    mut stop: watch::Receiver<bool>,
) {
    let mut ticker = interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                if let Err(e) = api.heartbeat(&pid, None).await {
                    warn!("Heartbeat for {} failed: {}", pid, e);
                }
            }
            _ = stop.changed() => break,
        }
    }
}
