//! In-process coordinator
//!
//! Wires the store, resolver, scheduler, liveness monitor and notifier
//! together behind `CoordinatorApi`. Cloning is cheap and every clone
//! shares the same database.

use async_broadcast::Receiver;
use async_trait::async_trait;
use tracing::{debug, info, warn};

use crate::api::{
    AddDependency, ApiError, ApiResult, ClaimNext, ClaimOutcome, CoordinatorApi, CreateProduct,
    ProductRecord, UpdateProduct,
};
use crate::config::CoordinatorConfig;
use crate::core::errors::{CoordError, Result};
use crate::liveness::{LivenessMonitor, Reaper};
use crate::model::{events, Product, ProductState, DEFAULT_ROLE};
use crate::notify::{Notifier, Wakeup};
use crate::resolver::DependencyResolver;
use crate::scheduler::ClaimScheduler;
use crate::store::{implicit_upstream, ProductStore};

#[derive(Clone)]
pub struct Coordinator {
    store: ProductStore,
    scheduler: ClaimScheduler,
    monitor: LivenessMonitor,
    notifier: Notifier,
    config: CoordinatorConfig,
}

impl Coordinator {
    /// Validate `config` and open its store
    pub fn new(config: CoordinatorConfig) -> Result<Self> {
        config.validate()?;
        let store = ProductStore::open(&config.store)?;
        Ok(Self::with_store(store, config))
    }

    /// Coordinator over an already opened store
    pub fn with_store(store: ProductStore, config: CoordinatorConfig) -> Self {
        let resolver = DependencyResolver::new(store.clone(), config.resolver.clone());
        let scheduler = ClaimScheduler::new(store.clone(), resolver, config.scheduler.clone());
        let monitor = LivenessMonitor::new(store.clone(), config.liveness.clone());
        let notifier = Notifier::new(config.notify_capacity);
        Self {
            store,
            scheduler,
            monitor,
            notifier,
            config,
        }
    }

    pub fn store(&self) -> &ProductStore {
        &self.store
    }

    pub fn scheduler(&self) -> &ClaimScheduler {
        &self.scheduler
    }

    pub fn resolver(&self) -> &DependencyResolver {
        self.scheduler.resolver()
    }

    pub fn monitor(&self) -> &LivenessMonitor {
        &self.monitor
    }

    pub fn config(&self) -> &CoordinatorConfig {
        &self.config
    }

    /// Reaper sharing this coordinator's store and wakeup channel
    pub fn reaper(&self) -> Reaper {
        Reaper::new(
            self.store.clone(),
            self.monitor.clone(),
            self.notifier.clone(),
        )
    }

    fn announce(&self, product: &Product) {
        if !product.state.is_recognized() {
            warn!(
                "Product {} is in unrecognised state '{}'",
                product.pid, product.state
            );
        }
        if matches!(
            product.state,
            ProductState::Completed | ProductState::Available
        ) {
            self.notifier.notify(Wakeup::ProductReady {
                pid: product.pid.clone(),
            });
        }
    }

    pub fn create(&self, req: &CreateProduct) -> Result<Product> {
        let transition = req
            .fields
            .resolve(ProductState::Available, Some(events::CREATED));
        let product = self.store.create(&req.pid, &transition)?;
        self.announce(&product);
        Ok(product)
    }

    pub fn update(&self, req: &UpdateProduct) -> Result<Product> {
        let transition = req
            .fields
            .resolve(ProductState::Updated, Some(events::HEARTBEAT));
        let product = self.store.update(&req.pid, &transition)?;
        self.announce(&product);
        Ok(product)
    }

    pub fn link(&self, req: &AddDependency) -> Result<Product> {
        let upstream = req
            .upstream
            .as_deref()
            .ok_or_else(|| CoordError::bad_request("dependency requires an upstream product"))?;
        let role = req.role.as_deref().unwrap_or(DEFAULT_ROLE);
        let downstream_default = req
            .fields
            .resolve(ProductState::Waiting, Some(events::IMPLICIT_CREATE));
        let linked = self.store.add_dependency(
            &req.downstream,
            upstream,
            role,
            &downstream_default,
            &implicit_upstream(),
        )?;
        if linked.inserted {
            self.notifier.notify(Wakeup::DependencyAdded {
                downstream: linked.downstream.pid.clone(),
            });
        }
        Ok(linked.downstream)
    }

    pub fn claim(&self, roles: &[String]) -> Result<Option<Product>> {
        let (claimed, stats) = self.scheduler.claim_next_with_stats(roles)?;
        if stats.contended > 0 {
            debug!(
                "claim_next for {:?} lost {} races over {} candidates",
                roles, stats.contended, stats.candidates
            );
        }
        Ok(claimed)
    }
}

#[async_trait]
impl CoordinatorApi for Coordinator {
    async fn create_product(&self, req: CreateProduct) -> ApiResult<ProductRecord> {
        Ok(self.create(&req)?.into())
    }

    async fn get_product(&self, pid: &str) -> ApiResult<ProductRecord> {
        match self.store.get(pid)? {
            Some(product) => Ok(product.into()),
            None => Err(ApiError::from(CoordError::not_found(pid))),
        }
    }

    async fn delete_product(&self, pid: &str) -> ApiResult<ProductRecord> {
        Ok(self.store.delete(pid)?.into())
    }

    async fn delete_subtree(&self, pid: &str) -> ApiResult<Vec<ProductRecord>> {
        let removed = self.store.delete_subtree(pid)?;
        info!("Subtree delete of {} removed {} products", pid, removed.len());
        Ok(removed.into_iter().map(ProductRecord::from).collect())
    }

    async fn update_product(&self, req: UpdateProduct) -> ApiResult<ProductRecord> {
        Ok(self.update(&req)?.into())
    }

    async fn heartbeat(&self, pid: &str, message: Option<String>) -> ApiResult<ProductRecord> {
        Ok(self.monitor.heartbeat(pid, message.as_deref())?.into())
    }

    async fn add_dependency(&self, req: AddDependency) -> ApiResult<ProductRecord> {
        Ok(self.link(&req)?.into())
    }

    async fn claim_next(&self, req: ClaimNext) -> ApiResult<ClaimOutcome> {
        Ok(match self.claim(&req.roles)? {
            Some(product) => ClaimOutcome::Claimed(product.into()),
            None => ClaimOutcome::NoWork,
        })
    }

    fn subscribe(&self) -> Option<Receiver<Wakeup>> {
        Some(self.notifier.subscribe())
    }
}
