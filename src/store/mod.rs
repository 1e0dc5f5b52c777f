//! Product store
//!
//! Durable table of products and dependency edges backed by sled. The
//! store accepts any state string; lifecycle legality is enforced by the
//! resolver and scheduler, not here.
//!
//! Every mutating operation is a single multi-tree transaction. The
//! handle is a cheap `Clone` and holds no per-request state.

mod codec;
mod txn;

use chrono::Utc;
use sled::Transactional;
use tracing::{debug, info, warn};

use crate::config::StoreConfig;
use crate::core::errors::{CoordError, Result};
use crate::model::{events, Dependency, Product, ProductId, ProductState, Transition};
use txn::{fail, Txn, TxResult};

const PRODUCTS_TREE: &str = "products";
const PIDS_TREE: &str = "pids";
const UPSTREAM_TREE: &str = "upstream";
const DOWNSTREAM_TREE: &str = "downstream";
const STATES_TREE: &str = "states";

/// An upstream edge of a product together with the upstream's current row.
/// `upstream` is `None` only if the edge dangles, which the store never
/// produces on its own.
#[derive(Debug, Clone, PartialEq)]
pub struct UpstreamLink {
    pub upstream_id: ProductId,
    pub role: String,
    pub upstream: Option<Product>,
}

/// Result of `add_dependency`
#[derive(Debug, Clone, PartialEq)]
pub struct Linked {
    pub downstream: Product,
    pub upstream: Product,
    /// False when the identical edge already existed
    pub inserted: bool,
}

#[derive(Clone)]
pub struct ProductStore {
    db: sled::Db,
    products: sled::Tree,
    pids: sled::Tree,
    upstream: sled::Tree,
    downstream: sled::Tree,
    states: sled::Tree,
}

fn validate_pid(pid: &str) -> Result<()> {
    if pid.trim().is_empty() {
        return Err(CoordError::bad_request("product id must not be empty"));
    }
    Ok(())
}

impl ProductStore {
    /// Open (or create) the store described by `config`
    pub fn open(config: &StoreConfig) -> Result<Self> {
        let mut sled_config = sled::Config::new()
            .cache_capacity(config.cache_capacity)
            .flush_every_ms(config.flush_every_ms);
        if config.temporary {
            sled_config = sled_config.temporary(true);
        } else {
            sled_config = sled_config.path(&config.path);
        }
        let db = sled_config.open()?;
        info!("Opened product store (temporary: {})", config.temporary);
        Self::from_db(db)
    }

    /// In-memory store that disappears on drop
    pub fn temporary() -> Result<Self> {
        Self::open(&StoreConfig::temporary())
    }

    pub fn from_db(db: sled::Db) -> Result<Self> {
        Ok(Self {
            products: db.open_tree(PRODUCTS_TREE)?,
            pids: db.open_tree(PIDS_TREE)?,
            upstream: db.open_tree(UPSTREAM_TREE)?,
            downstream: db.open_tree(DOWNSTREAM_TREE)?,
            states: db.open_tree(STATES_TREE)?,
            db,
        })
    }

    fn transact<T, F>(&self, f: F) -> Result<T>
    where
        F: Fn(&Txn<'_>) -> TxResult<T>,
    {
        let trees = (
            &self.products,
            &self.pids,
            &self.upstream,
            &self.downstream,
            &self.states,
        );
        trees
            .transaction(|(products, pids, upstream, downstream, states)| {
                f(&Txn {
                    products,
                    pids,
                    upstream,
                    downstream,
                    states,
                })
            })
            .map_err(CoordError::from)
    }

    /// Create a product. Fails with `Conflict` if the pid exists.
    pub fn create(&self, pid: &str, transition: &Transition) -> Result<Product> {
        validate_pid(pid)?;
        let id = self.db.generate_id()?;
        let product = self.transact(|txn| {
            if txn.id_of(pid)?.is_some() {
                return fail(CoordError::conflict(pid));
            }
            let product = Product::new(id, pid, transition, Utc::now());
            txn.put(&product, None)?;
            Ok(product)
        })?;
        info!("Created product {} in state {}", pid, product.state);
        Ok(product)
    }

    pub fn get(&self, pid: &str) -> Result<Option<Product>> {
        match self.pids.get(pid.as_bytes())? {
            Some(raw) => self.get_by_id(codec::decode_id(&raw)?),
            None => Ok(None),
        }
    }

    pub fn get_by_id(&self, id: ProductId) -> Result<Option<Product>> {
        match self.products.get(codec::id_key(id))? {
            Some(raw) => Ok(Some(codec::decode_product(&raw)?)),
            None => Ok(None),
        }
    }

    /// Update a product, creating it if absent
    pub fn update(&self, pid: &str, transition: &Transition) -> Result<Product> {
        validate_pid(pid)?;
        let id = self.db.generate_id()?;
        let product = self.transact(|txn| {
            let now = Utc::now();
            match txn.product_by_pid(pid)? {
                Some(current) => {
                    let next = current.apply(transition, now);
                    txn.put(&next, Some(&current))?;
                    Ok(next)
                }
                None => {
                    let created = Product::new(id, pid, transition, now);
                    txn.put(&created, None)?;
                    Ok(created)
                }
            }
        })?;
        if !product.state.is_recognized() {
            warn!("Product {} moved to unrecognised state '{}'", pid, product.state);
        }
        debug!("Updated product {} to {}", pid, product.state);
        Ok(product)
    }

    /// Refresh `updated_at`, event and message while keeping the state.
    /// An absent product is created in the `updated` state.
    pub fn touch(&self, pid: &str, event: &str, message: Option<&str>) -> Result<Product> {
        validate_pid(pid)?;
        let id = self.db.generate_id()?;
        self.transact(|txn| {
            let now = Utc::now();
            let current = txn.product_by_pid(pid)?;
            let state = current
                .as_ref()
                .map(|p| p.state.clone())
                .unwrap_or(ProductState::Updated);
            let transition = Transition::new(state)
                .event(event)
                .maybe_message(message.map(str::to_string));
            let next = match &current {
                Some(current) => current.apply(&transition, now),
                None => Product::new(id, pid, &transition, now),
            };
            txn.put(&next, current.as_ref())?;
            Ok(next)
        })
    }

    /// Apply `transition` to product `id` only if `precondition` holds on the
    /// row and its upstream links as seen inside the same transaction.
    /// Returns `None` when the product is gone or the precondition fails.
    pub fn transition_if<F>(
        &self,
        id: ProductId,
        precondition: F,
        transition: &Transition,
    ) -> Result<Option<Product>>
    where
        F: Fn(&Product, &[UpstreamLink]) -> bool,
    {
        self.transact(|txn| {
            let Some(current) = txn.product(id)? else {
                return Ok(None);
            };
            let links = txn.upstream_links(id)?;
            if !precondition(&current, &links) {
                return Ok(None);
            }
            let next = current.apply(transition, Utc::now());
            txn.put(&next, Some(&current))?;
            Ok(Some(next))
        })
    }

    /// Remove a product and every edge touching it
    pub fn delete(&self, pid: &str) -> Result<Product> {
        let removed = self.transact(|txn| {
            let Some(product) = txn.product_by_pid(pid)? else {
                return fail(CoordError::not_found(pid));
            };
            txn.remove(&product)?;
            Ok(product)
        })?;
        info!("Deleted product {}", pid);
        Ok(removed)
    }

    /// Remove a product and its whole upstream closure atomically.
    /// The product comes first in the result, ancestors follow breadth first.
    pub fn delete_subtree(&self, pid: &str) -> Result<Vec<Product>> {
        let removed = self.transact(|txn| {
            let Some(root) = txn.product_by_pid(pid)? else {
                return fail(CoordError::not_found(pid));
            };
            let mut doomed = vec![root];
            for id in txn.ancestors(doomed[0].id)? {
                if let Some(product) = txn.product(id)? {
                    doomed.push(product);
                }
            }
            for product in &doomed {
                txn.remove(product)?;
            }
            Ok(doomed)
        })?;
        info!("Deleted product {} and {} ancestors", pid, removed.len() - 1);
        Ok(removed)
    }

    /// Declare that `downstream` depends on `upstream` under `role`,
    /// creating either endpoint from its default if missing. Re-adding an
    /// existing edge is a no-op. Rejects self-loops and cycles.
    pub fn add_dependency(
        &self,
        downstream: &str,
        upstream: &str,
        role: &str,
        downstream_default: &Transition,
        upstream_default: &Transition,
    ) -> Result<Linked> {
        validate_pid(downstream)?;
        validate_pid(upstream)?;
        if role.is_empty() {
            return Err(CoordError::bad_request("dependency role must not be empty"));
        }
        if downstream == upstream {
            return Err(CoordError::bad_request(format!(
                "product {} cannot depend on itself",
                downstream
            )));
        }
        let down_id = self.db.generate_id()?;
        let up_id = self.db.generate_id()?;

        let linked = self.transact(|txn| {
            let now = Utc::now();
            let down = match txn.product_by_pid(downstream)? {
                Some(p) => p,
                None => {
                    let p = Product::new(down_id, downstream, downstream_default, now);
                    txn.put(&p, None)?;
                    p
                }
            };
            let up = match txn.product_by_pid(upstream)? {
                Some(p) => p,
                None => {
                    let p = Product::new(up_id, upstream, upstream_default, now);
                    txn.put(&p, None)?;
                    p
                }
            };
            if txn.depends_on(up.id, down.id)? {
                return fail(CoordError::CycleDetected {
                    downstream: downstream.to_string(),
                    upstream: upstream.to_string(),
                });
            }
            let inserted = txn.link(down.id, up.id, role)?;
            Ok(Linked {
                downstream: down,
                upstream: up,
                inserted,
            })
        })?;

        if linked.inserted {
            info!("Added dependency {} -> {} ({})", downstream, upstream, role);
        } else {
            debug!("Dependency {} -> {} ({}) already present", downstream, upstream, role);
        }
        Ok(linked)
    }

    /// Products in `state`, oldest `updated_at` first, read lazily from
    /// the state index
    pub fn iter_state<'a>(
        &'a self,
        state: &'a ProductState,
    ) -> impl Iterator<Item = Result<Product>> + 'a {
        self.states
            .scan_prefix(codec::state_prefix(state))
            .filter_map(move |entry| {
                let id = match entry
                    .map_err(CoordError::from)
                    .and_then(|(key, _)| codec::id_from_state_key(&key))
                {
                    Ok(id) => id,
                    Err(e) => return Some(Err(e)),
                };
                // index and row are written together, but this read is not
                // transactional: skip rows that moved under us
                match self.get_by_id(id) {
                    Ok(Some(product)) if &product.state == state => Some(Ok(product)),
                    Ok(_) => {
                        debug!("Skipping product {} that left state {}", id, state);
                        None
                    }
                    Err(e) => Some(Err(e)),
                }
            })
    }

    /// Products in `state`, oldest `updated_at` first, at most `limit`
    pub fn scan_state(&self, state: &ProductState, limit: usize) -> Result<Vec<Product>> {
        self.iter_state(state).take(limit).collect()
    }

    /// All products, or only those in `state`, oldest first
    pub fn list(&self, state: Option<&ProductState>) -> Result<Vec<Product>> {
        if let Some(state) = state {
            return self.scan_state(state, usize::MAX);
        }
        let mut all = Vec::new();
        for entry in self.products.iter() {
            let (_, raw) = entry?;
            all.push(codec::decode_product(&raw)?);
        }
        all.sort_by(|a, b| a.updated_at.cmp(&b.updated_at).then(a.id.cmp(&b.id)));
        Ok(all)
    }

    pub fn upstream_links(&self, id: ProductId) -> Result<Vec<UpstreamLink>> {
        let mut links = Vec::new();
        if let Some(raw) = self.upstream.get(codec::id_key(id))? {
            for edge in codec::decode_edges(&raw)? {
                links.push(UpstreamLink {
                    upstream: self.get_by_id(edge.peer)?,
                    upstream_id: edge.peer,
                    role: edge.role,
                });
            }
        }
        Ok(links)
    }

    fn resolve_edges(
        &self,
        tree: &sled::Tree,
        product: &Product,
        upstream: bool,
    ) -> Result<Vec<Dependency>> {
        let mut deps = Vec::new();
        let Some(raw) = tree.get(codec::id_key(product.id))? else {
            return Ok(deps);
        };
        for edge in codec::decode_edges(&raw)? {
            let Some(peer) = self.get_by_id(edge.peer)? else {
                warn!("Dangling edge from {} to product {}", product.pid, edge.peer);
                continue;
            };
            let (downstream, upstream) = if upstream {
                (product.pid.clone(), peer.pid)
            } else {
                (peer.pid, product.pid.clone())
            };
            deps.push(Dependency {
                downstream,
                upstream,
                role: edge.role,
            });
        }
        Ok(deps)
    }

    /// Dependencies `pid` has on other products
    pub fn upstream_of(&self, pid: &str) -> Result<Vec<Dependency>> {
        let product = self.get(pid)?.ok_or_else(|| CoordError::not_found(pid))?;
        self.resolve_edges(&self.upstream, &product, true)
    }

    /// Dependencies other products have on `pid`
    pub fn downstream_of(&self, pid: &str) -> Result<Vec<Dependency>> {
        let product = self.get(pid)?.ok_or_else(|| CoordError::not_found(pid))?;
        self.resolve_edges(&self.downstream, &product, false)
    }

    /// Upstream closure of `pid` without deleting anything
    pub fn ancestors(&self, pid: &str) -> Result<Vec<Product>> {
        self.transact(|txn| {
            let Some(root) = txn.product_by_pid(pid)? else {
                return fail(CoordError::not_found(pid));
            };
            let mut found = Vec::new();
            for id in txn.ancestors(root.id)? {
                if let Some(product) = txn.product(id)? {
                    found.push(product);
                }
            }
            Ok(found)
        })
    }

    pub fn len(&self) -> usize {
        self.products.len()
    }

    pub fn is_empty(&self) -> bool {
        self.products.is_empty()
    }

    /// Flush pending writes to disk
    pub async fn flush(&self) -> Result<()> {
        self.db.flush_async().await?;
        Ok(())
    }
}

/// Default transition for a product implicitly created as an upstream
pub fn implicit_upstream() -> Transition {
    Transition::new(ProductState::Available).event(events::IMPLICIT_CREATE)
}

/// Default transition for a product implicitly created as a downstream
pub fn implicit_downstream() -> Transition {
    Transition::new(ProductState::Waiting).event(events::IMPLICIT_CREATE)
}
