//! Multi-tree transaction view.
//!
//! Every mutation of the graph goes through a `Txn` so that the product
//! row, the pid index, the state index and both adjacency lists move
//! together.

use std::collections::{HashSet, VecDeque};

use sled::transaction::{
    ConflictableTransactionError, ConflictableTransactionResult, TransactionalTree,
};

use super::codec::{self, Edge, EMPTY};
use super::UpstreamLink;
use crate::core::errors::{CoordError, Result};
use crate::model::{Product, ProductId};

pub(crate) type TxResult<T> = ConflictableTransactionResult<T, CoordError>;

/// Abort the surrounding transaction with a domain error
pub(crate) fn fail<T>(err: CoordError) -> TxResult<T> {
    Err(ConflictableTransactionError::Abort(err))
}

pub(crate) fn lift<T>(result: Result<T>) -> TxResult<T> {
    result.map_err(ConflictableTransactionError::Abort)
}

pub(crate) struct Txn<'a> {
    pub products: &'a TransactionalTree,
    pub pids: &'a TransactionalTree,
    pub upstream: &'a TransactionalTree,
    pub downstream: &'a TransactionalTree,
    pub states: &'a TransactionalTree,
}

impl Txn<'_> {
    pub fn id_of(&self, pid: &str) -> TxResult<Option<ProductId>> {
        match self.pids.get(pid.as_bytes())? {
            Some(raw) => lift(codec::decode_id(&raw)).map(Some),
            None => Ok(None),
        }
    }

    pub fn product(&self, id: ProductId) -> TxResult<Option<Product>> {
        match self.products.get(&codec::id_key(id)[..])? {
            Some(raw) => lift(codec::decode_product(&raw)).map(Some),
            None => Ok(None),
        }
    }

    pub fn product_by_pid(&self, pid: &str) -> TxResult<Option<Product>> {
        match self.id_of(pid)? {
            Some(id) => self.product(id),
            None => Ok(None),
        }
    }

    /// Write a product row and keep the indices in step with it
    pub fn put(&self, product: &Product, previous: Option<&Product>) -> TxResult<()> {
        if let Some(prev) = previous {
            self.states
                .remove(codec::state_key(&prev.state, prev.updated_at, prev.id))?;
        }
        let key = codec::id_key(product.id);
        self.products
            .insert(&key[..], lift(codec::encode_product(product))?)?;
        self.pids.insert(product.pid.as_bytes(), &key[..])?;
        self.states.insert(
            codec::state_key(&product.state, product.updated_at, product.id),
            EMPTY,
        )?;
        Ok(())
    }

    fn edges(tree: &TransactionalTree, id: ProductId) -> TxResult<Vec<Edge>> {
        match tree.get(&codec::id_key(id)[..])? {
            Some(raw) => lift(codec::decode_edges(&raw)),
            None => Ok(Vec::new()),
        }
    }

    fn put_edges(tree: &TransactionalTree, id: ProductId, edges: &[Edge]) -> TxResult<()> {
        let key = codec::id_key(id);
        if edges.is_empty() {
            tree.remove(&key[..])?;
        } else {
            tree.insert(&key[..], lift(codec::encode_edges(edges))?)?;
        }
        Ok(())
    }

    pub fn upstream_edges(&self, id: ProductId) -> TxResult<Vec<Edge>> {
        Self::edges(self.upstream, id)
    }

    pub fn downstream_edges(&self, id: ProductId) -> TxResult<Vec<Edge>> {
        Self::edges(self.downstream, id)
    }

    /// Insert `downstream -> upstream` under `role`. Returns false if the
    /// identical edge already exists.
    pub fn link(&self, downstream: ProductId, upstream: ProductId, role: &str) -> TxResult<bool> {
        let mut ups = self.upstream_edges(downstream)?;
        let edge = Edge::new(upstream, role);
        if ups.contains(&edge) {
            return Ok(false);
        }
        ups.push(edge);
        Self::put_edges(self.upstream, downstream, &ups)?;

        let mut downs = self.downstream_edges(upstream)?;
        downs.push(Edge::new(downstream, role));
        Self::put_edges(self.downstream, upstream, &downs)?;
        Ok(true)
    }

    /// Remove a product together with every edge touching it
    pub fn remove(&self, product: &Product) -> TxResult<()> {
        for edge in self.upstream_edges(product.id)? {
            let mut downs = self.downstream_edges(edge.peer)?;
            downs.retain(|e| e.peer != product.id);
            Self::put_edges(self.downstream, edge.peer, &downs)?;
        }
        for edge in self.downstream_edges(product.id)? {
            let mut ups = self.upstream_edges(edge.peer)?;
            ups.retain(|e| e.peer != product.id);
            Self::put_edges(self.upstream, edge.peer, &ups)?;
        }

        let key = codec::id_key(product.id);
        self.upstream.remove(&key[..])?;
        self.downstream.remove(&key[..])?;
        self.states
            .remove(codec::state_key(&product.state, product.updated_at, product.id))?;
        self.pids.remove(product.pid.as_bytes())?;
        self.products.remove(&key[..])?;
        Ok(())
    }

    /// Transitive upstream closure of `id`, breadth first, excluding `id`
    pub fn ancestors(&self, id: ProductId) -> TxResult<Vec<ProductId>> {
        let mut seen = HashSet::from([id]);
        let mut queue = VecDeque::from([id]);
        let mut found = Vec::new();
        while let Some(next) = queue.pop_front() {
            for edge in self.upstream_edges(next)? {
                if seen.insert(edge.peer) {
                    found.push(edge.peer);
                    queue.push_back(edge.peer);
                }
            }
        }
        Ok(found)
    }

    /// Whether `from` depends on `target`, directly or transitively
    pub fn depends_on(&self, from: ProductId, target: ProductId) -> TxResult<bool> {
        if from == target {
            return Ok(true);
        }
        Ok(self.ancestors(from)?.contains(&target))
    }

    pub fn upstream_links(&self, id: ProductId) -> TxResult<Vec<UpstreamLink>> {
        let mut links = Vec::new();
        for edge in self.upstream_edges(id)? {
            links.push(UpstreamLink {
                upstream: self.product(edge.peer)?,
                upstream_id: edge.peer,
                role: edge.role,
            });
        }
        Ok(links)
    }
}
