//! Node Chain
//!
//! Distance-ordered list of tiers with lookup fallback and promotion.
//!
//! # Lookup Flow
//!
//! ```text
//! lookup(key)
//!    │
//!    ├─► tier 0 ── miss ──► tier 1 ── miss ──► tier 2 ── HIT
//!    │                                           │
//!    │         ◄── store ◄───────────────────────┤  promote into
//!    │  ◄── store ◄──────────────────────────────┘  every closer tier
//!    ▼
//!  entry
//! ```
//!
//! A failing tier is logged and skipped so a lookup degrades to farther
//! tiers. The error is only surfaced when no tier produced the entry.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};

use futures::future::join_all;
use tracing::{debug, info, warn};

use super::entry::{CacheEntry, CacheKey};
use super::{Node, NodeFactory};
use crate::error::{Error, Result};

/// Where a lookup found its entry
#[derive(Debug, Clone)]
pub struct Hit {
    pub entry: CacheEntry,
    /// Index of the producing tier in the chain
    pub position: usize,
    pub distance: u32,
}

/// Ordered set of tiers owned for the chain's lifetime
pub struct NodeChain {
    nodes: Vec<Box<dyn Node>>,
    closed: AtomicBool,
}

impl NodeChain {
    /// Create a chain from already built tiers, ordering them by distance
    ///
    /// Tiers at equal distance keep the order they were given in.
    pub fn new(mut nodes: Vec<Box<dyn Node>>) -> Self {
        nodes.sort_by_key(|node| node.distance());
        Self {
            nodes,
            closed: AtomicBool::new(false),
        }
    }

    /// Ask every factory for a tier and keep the ones that came up
    pub async fn assemble(factories: &[Box<dyn NodeFactory>]) -> Self {
        let created = join_all(factories.iter().map(|factory| factory.create())).await;

        let mut nodes = Vec::with_capacity(created.len());
        for (factory, node) in factories.iter().zip(created) {
            match node {
                Some(node) => {
                    debug!(factory = factory.name(), node = node.id(), distance = node.distance(), "tier available");
                    nodes.push(node);
                }
                None => debug!(factory = factory.name(), "tier unavailable, skipping"),
            }
        }

        let chain = Self::new(nodes);
        info!(tiers = %chain, "node chain assembled");
        chain
    }

    /// Find the closest tier holding `key`, without promoting
    pub async fn locate(&self, key: &CacheKey) -> Result<Option<Hit>> {
        self.ensure_open()?;

        let mut last_error = None;
        for (position, node) in self.nodes.iter().enumerate() {
            match node.locate(key).await {
                Ok(Some(entry)) => {
                    debug!(%key, node = node.id(), distance = node.distance(), "cache hit");
                    return Ok(Some(Hit {
                        entry,
                        position,
                        distance: node.distance(),
                    }));
                }
                Ok(None) => {
                    debug!(%key, node = node.id(), "cache miss");
                }
                Err(e) => {
                    warn!(%key, node = node.id(), error = %e, "tier lookup failed");
                    last_error = Some(e);
                }
            }
        }

        match last_error {
            Some(e) => Err(e),
            None => Ok(None),
        }
    }

    /// Store `entry` into every tier before `position`, closest first
    ///
    /// Returns how many tiers accepted the entry. Failures are logged and do
    /// not stop the remaining tiers.
    pub async fn promote(&self, entry: &CacheEntry, position: usize) -> usize {
        let mut stored = 0;
        for node in self.nodes.iter().take(position) {
            match node.store(entry).await {
                Ok(true) => {
                    debug!(key = %entry.key(), from = entry.node_id(), to = node.id(), "promoted");
                    stored += 1;
                }
                Ok(false) => {
                    debug!(key = %entry.key(), node = node.id(), "tier is read-only");
                }
                Err(e) => {
                    warn!(key = %entry.key(), node = node.id(), error = %e, "promotion failed");
                }
            }
        }
        stored
    }

    /// Locate `key` and promote a hit into every closer tier
    pub async fn lookup(&self, key: &CacheKey) -> Result<Option<CacheEntry>> {
        let Some(hit) = self.locate(key).await? else {
            return Ok(None);
        };
        if hit.position > 0 {
            self.promote(&hit.entry, hit.position).await;
        }
        Ok(Some(hit.entry))
    }

    /// Store `entry` into the closest tier that accepts writes
    ///
    /// Returns the id of that tier, or `None` when every tier is read-only.
    pub async fn store(&self, entry: &CacheEntry) -> Result<Option<String>> {
        self.ensure_open()?;

        let mut last_error = None;
        for node in &self.nodes {
            match node.store(entry).await {
                Ok(true) => return Ok(Some(node.id().to_string())),
                Ok(false) => {}
                Err(e) => {
                    warn!(key = %entry.key(), node = node.id(), error = %e, "store failed");
                    last_error = Some(e);
                }
            }
        }

        match last_error {
            Some(e) => Err(e),
            None => Ok(None),
        }
    }

    /// Tiers in lookup order
    pub fn nodes(&self) -> impl Iterator<Item = &dyn Node> + '_ {
        self.nodes.iter().map(|node| node.as_ref())
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Close every tier; later calls do nothing
    pub async fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }

        let results = join_all(self.nodes.iter().map(|node| node.close())).await;
        let mut first_error = None;
        for (node, result) in self.nodes.iter().zip(results) {
            if let Err(e) = result {
                warn!(node = node.id(), error = %e, "failed to close tier");
                first_error.get_or_insert(e);
            }
        }

        info!("node chain closed");
        first_error.map_or(Ok(()), Err)
    }

    fn ensure_open(&self) -> Result<()> {
        if self.is_closed() {
            return Err(Error::Internal("node chain is closed".into()));
        }
        Ok(())
    }
}

impl fmt::Display for NodeChain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[")?;
        for (i, node) in self.nodes.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{}@{}", node.id(), node.distance())?;
        }
        write!(f, "]")
    }
}

impl fmt::Debug for NodeChain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NodeChain")
            .field("nodes", &format_args!("{}", self))
            .field("closed", &self.is_closed())
            .finish()
    }
}

// =============================================================================
// Tests
// =============================================================================
