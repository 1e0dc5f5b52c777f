//! Claim scheduler
//!
//! `claim_next` picks the oldest eligible product and moves it to
//! `running` inside one store transaction that re-checks both the
//! product's state and its dependencies. Two callers can never both win
//! the same product: the loser sees the precondition fail, treats it as
//! contention, and moves on to the next candidate.

use tracing::{debug, info};

use crate::config::SchedulerConfig;
use crate::core::errors::{CoordError, Result};
use crate::model::{events, Product, ProductState, Transition};
use crate::resolver::DependencyResolver;
use crate::store::ProductStore;

/// Claim statistics for one `claim_next` call
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ClaimStats {
    pub candidates: usize,
    pub attempts: usize,
    pub contended: usize,
}

#[derive(Clone)]
pub struct ClaimScheduler {
    store: ProductStore,
    resolver: DependencyResolver,
    config: SchedulerConfig,
}

impl ClaimScheduler {
    pub fn new(store: ProductStore, resolver: DependencyResolver, config: SchedulerConfig) -> Self {
        Self {
            store,
            resolver,
            config,
        }
    }

    pub fn resolver(&self) -> &DependencyResolver {
        &self.resolver
    }

    /// Claim one eligible product for any of `roles`, tried in order.
    /// Candidates are the oldest eligible products; blocked ones never
    /// occupy the scan window.
    /// `None` means no work right now.
    pub fn claim_next(&self, roles: &[String]) -> Result<Option<Product>> {
        self.claim_next_with_stats(roles).map(|(claimed, _)| claimed)
    }

    pub fn claim_next_with_stats(&self, roles: &[String]) -> Result<(Option<Product>, ClaimStats)> {
        let mut stats = ClaimStats::default();
        if roles.is_empty() {
            debug!("claim_next called without roles");
            return Ok((None, stats));
        }

        for role in roles {
            let candidates = self.resolver.eligible(role)?;
            stats.candidates += candidates.len();
            for candidate in &candidates {
                if stats.attempts >= self.config.max_claim_attempts {
                    debug!(
                        "Giving up after {} contended claim attempts",
                        stats.attempts
                    );
                    return Ok((None, stats));
                }
                stats.attempts += 1;
                match self.try_claim(candidate, role) {
                    Ok(claimed) => {
                        info!("Claimed product {} for role {}", claimed.pid, role);
                        return Ok((Some(claimed), stats));
                    }
                    Err(CoordError::Contention { pid }) => {
                        debug!("Lost claim race on {}, trying next candidate", pid);
                        stats.contended += 1;
                    }
                    Err(e) => return Err(e),
                }
            }
        }

        debug!("No eligible product for roles {:?}", roles);
        Ok((None, stats))
    }

    /// Conditional transition to `running`: only succeeds if the row is
    /// still in the state we observed and still eligible.
    fn try_claim(&self, candidate: &Product, role: &str) -> Result<Product> {
        let transition = Transition::new(ProductState::Running)
            .event(events::CLAIMED)
            .message(role);
        let observed = &candidate.state;
        self.store
            .transition_if(
                candidate.id,
                |current, links| {
                    &current.state == observed && self.resolver.is_eligible(current, links, role)
                },
                &transition,
            )?
            .ok_or_else(|| CoordError::Contention {
                pid: candidate.pid.clone(),
            })
    }
}
