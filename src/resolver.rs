//! Dependency resolver
//!
//! Decides which waiting/available products may run for a given role.
//! Candidates come from the store's state index rather than a graph walk,
//! and only their direct upstream edges are examined.

use tracing::debug;

use crate::config::{ResolverConfig, RoleMatch};
use crate::core::errors::Result;
use crate::model::{Product, ProductState};
use crate::store::{ProductStore, UpstreamLink};

#[derive(Clone)]
pub struct DependencyResolver {
    store: ProductStore,
    config: ResolverConfig,
}

impl DependencyResolver {
    pub fn new(store: ProductStore, config: ResolverConfig) -> Self {
        Self { store, config }
    }

    pub fn config(&self) -> &ResolverConfig {
        &self.config
    }

    /// The upstream state that satisfies an edge of `role`
    pub fn satisfied_state(&self, role: &str) -> &ProductState {
        self.config
            .role_satisfied_states
            .get(role)
            .unwrap_or(&self.config.satisfied_state)
    }

    pub fn is_claimable(&self, product: &Product) -> bool {
        self.config.claimable_states.contains(&product.state)
    }

    /// Pure eligibility check, run both when scanning and again inside the
    /// claim transaction.
    ///
    /// A product with no upstream edges at all is a raw input, not a unit
    /// of work, and is never eligible.
    pub fn is_eligible(&self, product: &Product, links: &[UpstreamLink], role: &str) -> bool {
        if !self.is_claimable(product) || links.is_empty() {
            return false;
        }
        let wanted = self.satisfied_state(role);
        let mut relevant = links.iter().filter(|l| l.role == role).peekable();
        if relevant.peek().is_none() {
            return self.config.role_match == RoleMatch::Lenient;
        }
        relevant.all(|link| {
            link.upstream
                .as_ref()
                .map_or(false, |upstream| &upstream.state == wanted)
        })
    }

    /// Products eligible for `role`, oldest `updated_at` first.
    ///
    /// The state index is walked lazily and only eligible products count
    /// against the scan limit, so a backlog of blocked products can never
    /// hide newer work.
    pub fn eligible(&self, role: &str) -> Result<Vec<Product>> {
        let limit = self.config.scan_limit;
        let mut ready = Vec::new();
        for state in &self.config.claimable_states {
            let mut taken = 0;
            for candidate in self.store.iter_state(state) {
                let candidate = candidate?;
                let links = self.store.upstream_links(candidate.id)?;
                if !self.is_eligible(&candidate, &links, role) {
                    debug!("Product {} not eligible for role {}", candidate.pid, role);
                    continue;
                }
                ready.push(candidate);
                taken += 1;
                if taken >= limit {
                    break;
                }
            }
        }
        // each state's run is already oldest first; merge them
        ready.sort_by(|a, b| a.updated_at.cmp(&b.updated_at).then(a.id.cmp(&b.id)));
        ready.truncate(limit);
        Ok(ready)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Transition;
    use chrono::Utc;

    fn product(id: u64, state: ProductState) -> Product {
        Product {
            id,
            pid: format!("p{}", id),
            state,
            event: None,
            message: None,
            updated_at: Utc::now(),
        }
    }

    fn link(role: &str, state: Option<ProductState>) -> UpstreamLink {
        UpstreamLink {
            upstream_id: 99,
            role: role.to_string(),
            upstream: state.map(|s| product(99, s)),
        }
    }

    fn resolver(config: ResolverConfig) -> DependencyResolver {
        DependencyResolver::new(ProductStore::temporary().unwrap(), config)
    }

    #[test]
    fn test_satisfied_state_is_per_role() {
        let mut config = ResolverConfig {
            satisfied_state: ProductState::Completed,
            ..Default::default()
        };
        config
            .role_satisfied_states
            .insert("raw".into(), ProductState::Available);
        let r = resolver(config);
        let waiting = product(1, ProductState::Waiting);

        assert!(r.is_eligible(&waiting, &[link("raw", Some(ProductState::Available))], "raw"));
        assert!(!r.is_eligible(&waiting, &[link("any", Some(ProductState::Available))], "any"));
        assert!(r.is_eligible(&waiting, &[link("any", Some(ProductState::Completed))], "any"));
    }

    #[test]
    fn test_all_edges_of_role_must_be_satisfied() {
        let r = resolver(ResolverConfig::default());
        let waiting = product(1, ProductState::Waiting);
        let links = [
            link("any", Some(ProductState::Available)),
            link("any", Some(ProductState::Running)),
        ];
        assert!(!r.is_eligible(&waiting, &links, "any"));
    }

    #[test]
    fn test_missing_upstream_is_unsatisfied() {
        let r = resolver(ResolverConfig::default());
        let waiting = product(1, ProductState::Waiting);
        assert!(!r.is_eligible(&waiting, &[link("any", None)], "any"));
    }

    #[test]
    fn test_role_match_modes() {
        let waiting = product(1, ProductState::Waiting);
        let links = [link("binzip", Some(ProductState::Running))];

        let lenient = resolver(ResolverConfig::default());
        assert!(lenient.is_eligible(&waiting, &links, "blobs"));

        let strict = resolver(ResolverConfig {
            role_match: RoleMatch::Strict,
            ..Default::default()
        });
        assert!(!strict.is_eligible(&waiting, &links, "blobs"));
    }

    #[test]
    fn test_inputs_and_running_products_never_eligible() {
        let r = resolver(ResolverConfig::default());
        assert!(!r.is_eligible(&product(1, ProductState::Available), &[], "any"));
        let links = [link("any", Some(ProductState::Available))];
        assert!(!r.is_eligible(&product(2, ProductState::Running), &links, "any"));
        assert!(!r.is_eligible(&product(3, ProductState::Completed), &links, "any"));
    }

    #[test]
    fn test_eligible_spans_claimable_states_oldest_first() {
        let store = ProductStore::temporary().unwrap();
        let done = Transition::new(ProductState::Completed);
        for (pid, state) in [
            ("w1", ProductState::Waiting),
            ("a1", ProductState::Available),
            ("r1", ProductState::Running),
            ("w2", ProductState::Waiting),
        ] {
            store
                .add_dependency(pid, "src", "any", &Transition::new(state), &done)
                .unwrap();
        }

        let r = DependencyResolver::new(store, ResolverConfig::default());
        let pids: Vec<String> = r.eligible("any").unwrap().into_iter().map(|p| p.pid).collect();
        assert_eq!(pids, vec!["w1", "a1", "w2"]);
    }

    #[test]
    fn test_blocked_backlog_does_not_hide_newer_work() {
        let store = ProductStore::temporary().unwrap();
        let waiting = Transition::new(ProductState::Waiting);
        store
            .create("busy", &Transition::new(ProductState::Running))
            .unwrap();
        for pid in ["blocked1", "blocked2", "blocked3"] {
            store
                .add_dependency(pid, "busy", "any", &waiting, &waiting)
                .unwrap();
        }
        store
            .add_dependency("ready", "raw", "any", &waiting, &Transition::new(ProductState::Completed))
            .unwrap();

        let r = DependencyResolver::new(
            store,
            ResolverConfig {
                scan_limit: 2,
                ..Default::default()
            },
        );
        let pids: Vec<String> = r.eligible("any").unwrap().into_iter().map(|p| p.pid).collect();
        assert_eq!(pids, vec!["ready"]);
    }
}
