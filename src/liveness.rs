//! Liveness monitoring
//!
//! Workers heartbeat running products; the monitor only reports staleness.
//! The `Reaper` is the policy that acts on it, requeueing or failing
//! stale products with a conditional write so a heartbeat that lands
//! first always wins.

use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::config::{LivenessConfig, ReapPolicy};
use crate::core::errors::Result;
use crate::model::{events, Product, ProductState, Transition};
use crate::notify::{Notifier, Wakeup};
use crate::store::ProductStore;

/// `now - updated_at > ttl` while running
pub fn is_stale_at(product: &Product, ttl: Duration, now: DateTime<Utc>) -> bool {
    if product.state != ProductState::Running {
        return false;
    }
    match (now - product.updated_at).to_std() {
        Ok(age) => age > ttl,
        // updated_at in the future: clock skew, not staleness
        Err(_) => false,
    }
}

pub fn is_stale(product: &Product, ttl: Duration) -> bool {
    is_stale_at(product, ttl, Utc::now())
}

#[derive(Clone)]
pub struct LivenessMonitor {
    store: ProductStore,
    config: LivenessConfig,
}

impl LivenessMonitor {
    pub fn new(store: ProductStore, config: LivenessConfig) -> Self {
        Self { store, config }
    }

    pub fn config(&self) -> &LivenessConfig {
        &self.config
    }

    /// Record a heartbeat without changing the product's state
    pub fn heartbeat(&self, pid: &str, message: Option<&str>) -> Result<Product> {
        let product = self.store.touch(pid, events::HEARTBEAT, message)?;
        debug!("Heartbeat for {} ({})", pid, product.state);
        Ok(product)
    }

    /// TTL for a product: the longest configured TTL among the roles of its
    /// upstream edges, falling back to the default
    pub fn ttl_for(&self, product: &Product) -> Result<Duration> {
        let links = self.store.upstream_links(product.id)?;
        Ok(links
            .iter()
            .filter_map(|link| self.config.role_ttls.get(&link.role))
            .max()
            .copied()
            .unwrap_or(self.config.default_ttl))
    }

    pub fn is_stale(&self, product: &Product) -> Result<bool> {
        Ok(is_stale(product, self.ttl_for(product)?))
    }

    /// All running products past their TTL, oldest first
    pub fn stale(&self) -> Result<Vec<Product>> {
        let now = Utc::now();
        let mut found = Vec::new();
        for product in self.store.scan_state(&ProductState::Running, usize::MAX)? {
            if is_stale_at(&product, self.ttl_for(&product)?, now) {
                found.push(product);
            }
        }
        Ok(found)
    }
}

/// Reaper statistics
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReapStats {
    pub stale: usize,
    pub requeued: usize,
    pub errored: usize,
    /// Stale when scanned but refreshed before the write
    pub skipped: usize,
}

/// Acts on stale running products according to the configured policy
#[derive(Clone)]
pub struct Reaper {
    store: ProductStore,
    monitor: LivenessMonitor,
    notifier: Notifier,
    policy: ReapPolicy,
    interval: Duration,
}

impl Reaper {
    pub fn new(store: ProductStore, monitor: LivenessMonitor, notifier: Notifier) -> Self {
        let policy = monitor.config().policy;
        let interval = monitor.config().reap_interval;
        Self {
            store,
            monitor,
            notifier,
            policy,
            interval,
        }
    }

    pub fn with_policy(mut self, policy: ReapPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn reap_once(&self) -> Result<ReapStats> {
        let mut stats = ReapStats::default();
        for product in self.monitor.stale()? {
            stats.stale += 1;
            let transition = match self.policy {
                ReapPolicy::Requeue => Transition::new(ProductState::Available)
                    .event(events::REQUEUED)
                    .message(format!("no heartbeat since {}", product.updated_at.to_rfc3339())),
                ReapPolicy::Error => Transition::new(ProductState::Error)
                    .event(events::EXPIRED)
                    .message(format!("no heartbeat since {}", product.updated_at.to_rfc3339())),
            };
            let observed = product.updated_at;
            let reaped = self.store.transition_if(
                product.id,
                |current, _| current.state == ProductState::Running && current.updated_at == observed,
                &transition,
            )?;
            match reaped {
                Some(reaped) => {
                    warn!("Reaped stale product {} -> {}", reaped.pid, reaped.state);
                    match self.policy {
                        ReapPolicy::Requeue => {
                            stats.requeued += 1;
                            self.notifier.notify(Wakeup::Requeued { pid: reaped.pid });
                        }
                        ReapPolicy::Error => stats.errored += 1,
                    }
                }
                None => {
                    debug!("Product {} refreshed before reaping", product.pid);
                    stats.skipped += 1;
                }
            }
        }
        Ok(stats)
    }

    /// Reap on the configured interval until `shutdown` flips to true
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        info!("Reaper running every {:?} with policy {:?}", self.interval, self.policy);
        let mut ticker = tokio::time::interval(self.interval);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let reaper = self.clone();
                    match tokio::task::spawn_blocking(move || reaper.reap_once()).await {
                        Ok(Ok(stats)) if stats.stale > 0 => info!("Reap pass: {:?}", stats),
                        Ok(Ok(_)) => {}
                        Ok(Err(e)) => error!("Reap pass failed: {}", e),
                        Err(e) => error!("Reap task panicked: {}", e),
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        info!("Reaper shutting down");
                        return Ok(());
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration as ChronoDuration;

    fn running(updated_at: DateTime<Utc>) -> Product {
        Product {
            id: 1,
            pid: "p".into(),
            state: ProductState::Running,
            event: None,
            message: None,
            updated_at,
        }
    }

    #[test]
    fn test_stale_only_when_running_past_ttl() {
        let now = Utc::now();
        let old = running(now - ChronoDuration::seconds(120));
        assert!(is_stale_at(&old, Duration::from_secs(60), now));
        assert!(!is_stale_at(&old, Duration::from_secs(300), now));

        let mut done = old.clone();
        done.state = ProductState::Completed;
        assert!(!is_stale_at(&done, Duration::from_secs(60), now));
    }

    #[test]
    fn test_exactly_ttl_is_not_stale() {
        let now = Utc::now();
        let p = running(now - ChronoDuration::seconds(60));
        assert!(!is_stale_at(&p, Duration::from_secs(60), now));
    }

    #[test]
    fn test_future_timestamp_is_not_stale() {
        let now = Utc::now();
        let p = running(now + ChronoDuration::seconds(30));
        assert!(!is_stale_at(&p, Duration::ZERO, now));
    }
}
