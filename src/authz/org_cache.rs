//! Transitive-descendant cache over the organization tree.
//!
//! Every rebuild computes the full closure and writes it under a fresh
//! generation number before that number is published. Stale generations are
//! never deleted; they simply stop being addressed and expire through the
//! backend's TTL.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use serde_json::Value;
use thiserror::Error;

use crate::authz::errors::AuthzError;
use crate::authz::store::OrgStore;
use crate::authz::types::{OrgEdge, OrgId};

pub type Descendants = Arc<BTreeSet<OrgId>>;

#[derive(Debug, Error)]
#[error("cache backend unavailable: {0}")]
pub struct BackendError(pub String);

/// Key-value store the cache writes its snapshots to.
pub trait CacheBackend: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<Descendants>, BackendError>;
    fn set(&self, key: String, value: Descendants) -> Result<(), BackendError>;
}

/// In-process backend with a fixed time-to-live per entry.
pub struct MokaBackend {
    cache: moka::sync::Cache<String, Descendants>,
}

impl MokaBackend {
    pub fn new(ttl: Duration, max_capacity: u64) -> Self {
        let cache = moka::sync::Cache::builder()
            .max_capacity(max_capacity)
            .time_to_live(ttl)
            .build();
        Self { cache }
    }
}

impl CacheBackend for MokaBackend {
    fn get(&self, key: &str) -> Result<Option<Descendants>, BackendError> {
        Ok(self.cache.get(key))
    }

    fn set(&self, key: String, value: Descendants) -> Result<(), BackendError> {
        self.cache.insert(key, value);
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct CacheStats {
    pub generation: u64,
    pub hits: u64,
    pub misses: u64,
}

#[derive(Debug, Default)]
struct OrgNode {
    parent: Option<OrgId>,
    descendants: BTreeSet<OrgId>,
}

/// Compute every organization's full set of descendants.
///
/// Parent links to unknown organizations are ignored, and a parent cycle
/// stops the upward walk instead of looping.
pub fn descendant_closure(edges: &[OrgEdge]) -> HashMap<OrgId, BTreeSet<OrgId>> {
    let mut nodes: HashMap<OrgId, OrgNode> = edges
        .iter()
        .map(|edge| {
            (
                edge.id,
                OrgNode {
                    parent: edge.parent,
                    descendants: BTreeSet::new(),
                },
            )
        })
        .collect();

    for edge in edges {
        let mut seen = HashSet::from([edge.id]);
        let mut current = edge.parent;
        while let Some(ancestor) = current {
            if !seen.insert(ancestor) {
                break;
            }
            let Some(node) = nodes.get_mut(&ancestor) else {
                break;
            };
            node.descendants.insert(edge.id);
            current = node.parent;
        }
    }

    nodes
        .into_iter()
        .map(|(id, node)| (id, node.descendants))
        .collect()
}

pub struct OrgDescendantCache {
    name: String,
    /// Highest generation whose entries are fully written.
    generation: AtomicU64,
    /// Last generation handed to a rebuild.
    reserved: AtomicU64,
    backend: Arc<dyn CacheBackend>,
    orgs: Arc<dyn OrgStore>,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl OrgDescendantCache {
    pub fn new(name: &str, orgs: Arc<dyn OrgStore>, backend: Arc<dyn CacheBackend>) -> Self {
        Self {
            name: name.to_string(),
            generation: AtomicU64::new(0),
            reserved: AtomicU64::new(0),
            backend,
            orgs,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::SeqCst)
    }

    /// Backend key for `org_id` under the current generation.
    pub fn cache_key(&self, org_id: OrgId) -> String {
        self.key(self.generation(), org_id)
    }

    fn key(&self, generation: u64, org_id: OrgId) -> String {
        format!("{}:{}:{}", self.name, generation, org_id)
    }

    /// Recompute the closure and publish it as a new generation. Returns the
    /// descendants of `return_key` when one is given and exists.
    pub fn rebuild(&self, return_key: Option<OrgId>) -> Result<Option<Descendants>, AuthzError> {
        // Reserve first: an invalidation racing the load must outrank this tree.
        let generation = self.reserved.fetch_add(1, Ordering::SeqCst) + 1;
        let edges = self.orgs.load_org_edges()?;
        let closure = descendant_closure(&edges);

        let mut wanted = None;
        let mut failed_writes = 0usize;
        for (org_id, descendants) in closure {
            let descendants = Arc::new(descendants);
            if Some(org_id) == return_key {
                wanted = Some(Arc::clone(&descendants));
            }
            if self
                .backend
                .set(self.key(generation, org_id), descendants)
                .is_err()
            {
                failed_writes += 1;
            }
        }
        if failed_writes > 0 {
            tracing::warn!(
                cache = %self.name,
                generation,
                failed_writes,
                "org cache backend rejected writes; lookups will rebuild"
            );
        }
        self.generation.fetch_max(generation, Ordering::SeqCst);
        tracing::debug!(cache = %self.name, generation, orgs = edges.len(), "org cache rebuilt");
        Ok(wanted)
    }

    /// Called by the repository after any organization create, save or delete.
    pub fn invalidate(&self) -> Result<u64, AuthzError> {
        self.rebuild(None)?;
        Ok(self.generation())
    }

    /// Descendants of `org_id`, or `None` when no such organization exists.
    pub fn get(&self, org_id: OrgId) -> Result<Option<Descendants>, AuthzError> {
        match self.backend.get(&self.cache_key(org_id)) {
            Ok(Some(descendants)) => {
                self.hits.fetch_add(1, Ordering::Relaxed);
                return Ok(Some(descendants));
            }
            Ok(None) => {}
            Err(err) => {
                tracing::warn!(cache = %self.name, error = %err, "org cache read failed");
            }
        }
        self.misses.fetch_add(1, Ordering::Relaxed);
        self.rebuild(Some(org_id))
    }

    /// Like [`get`](Self::get), for keys of unknown type. Only integral JSON
    /// numbers are accepted.
    pub fn lookup(&self, key: &Value) -> Result<Option<Descendants>, AuthzError> {
        match key {
            Value::Number(n) => match n.as_i64() {
                Some(org_id) => self.get(org_id),
                None => Err(AuthzError::InvalidOrgKey(key.to_string())),
            },
            other => Err(AuthzError::InvalidOrgKey(other.to_string())),
        }
    }

    /// Whether `target` is one of `held` or lies below one of them.
    pub fn covers(&self, held: &BTreeSet<OrgId>, target: OrgId) -> Result<bool, AuthzError> {
        if held.contains(&target) {
            return Ok(true);
        }
        for &org in held {
            if let Some(descendants) = self.get(org)? {
                if descendants.contains(&target) {
                    return Ok(true);
                }
            }
        }
        Ok(false)
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            generation: self.generation(),
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
        }
    }
}

impl std::fmt::Debug for OrgDescendantCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OrgDescendantCache")
            .field("name", &self.name)
            .field("stats", &self.stats())
            .finish()
    }
}
