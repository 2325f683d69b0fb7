//! Artifact Cache
//!
//! Front door of the cache: resolves a key through the node chain, verifies
//! what the producing tier handed back, and only then back-fills the closer
//! tiers.
//!
//! # Fetch Flow
//!
//! ```text
//! fetch(key)
//!   │
//!   ├─► NodeChain::locate ──► miss ──► Ok(None)
//!   │
//!   ├─► hit at position i
//!   │     │
//!   │     ├─► stream content through ChecksumInputStream (blocking pool)
//!   │     ├─► ChecksumEnforcer: expected (tier) vs calculated
//!   │     │       └─► reject ──► Err(ChecksumMismatch), nothing promoted
//!   │     └─► promote into tiers 0..i
//!   ▼
//! Ok(Some(verified entry))
//! ```

use std::io;
use std::sync::Arc;

use bytes::Bytes;
use tokio::sync::oneshot;
use tracing::{debug, warn};

use super::metrics::{CacheMetrics, LatencyTracker, MetricsSnapshot};
use crate::checksum::{
    calculate, ChecksumAlgorithmFactory, ChecksumEnforcer, ChecksumInputStream, ChecksumRegistry,
    Checksums,
};
use crate::config::CacheConfig;
use crate::error::{Error, Result};
use crate::locking::DirectoryLocker;
use crate::node::{CacheEntry, CacheKey, NodeChain};

/// Verifying, promoting front end over a node chain
pub struct ArtifactCache {
    chain: Arc<NodeChain>,
    algorithms: Vec<Arc<dyn ChecksumAlgorithmFactory>>,
    enforcer: ChecksumEnforcer,
    metrics: Arc<CacheMetrics>,
}

impl ArtifactCache {
    /// Create a cache over an assembled chain, verifying with `algorithms`
    pub fn new(chain: Arc<NodeChain>, algorithms: Vec<Arc<dyn ChecksumAlgorithmFactory>>) -> Self {
        Self {
            chain,
            algorithms,
            enforcer: ChecksumEnforcer::new(),
            metrics: Arc::new(CacheMetrics::new()),
        }
    }

    /// Assemble every configured tier and build a cache over them
    pub async fn from_config(config: &CacheConfig) -> Result<Self> {
        config.validate()?;
        let registry = ChecksumRegistry::default();
        let algorithms = registry.select(&config.checksums)?;
        let factories = config.factories(&registry, DirectoryLocker::global())?;
        let chain = NodeChain::assemble(&factories).await;
        Ok(Self::new(Arc::new(chain), algorithms))
    }

    /// Look `key` up, verify it, and promote it into closer tiers
    ///
    /// A total miss is `Ok(None)`. An artifact whose digests do not verify
    /// is a hard error and is never promoted.
    pub async fn fetch(&self, key: &CacheKey) -> Result<Option<CacheEntry>> {
        let tracker = LatencyTracker::start();

        let hit = match self.chain.locate(key).await {
            Ok(Some(hit)) => hit,
            Ok(None) => {
                debug!(%key, "artifact not cached");
                self.metrics.record_miss();
                return Ok(None);
            }
            Err(e) => {
                self.metrics.record_lookup_error();
                return Err(e);
            }
        };
        self.metrics.record_hit(hit.distance);

        let verified = self.verify(&hit.entry).await?;
        if hit.position > 0 {
            let promoted = self.chain.promote(&verified, hit.position).await;
            self.metrics.record_promotions(promoted);
        }

        self.metrics.record_fetch_latency(tracker.elapsed());
        Ok(Some(verified))
    }

    /// Stream `entry`'s content through the configured digests and enforce them
    ///
    /// Returns the entry carrying the calculated digests.
    pub async fn verify(&self, entry: &CacheEntry) -> Result<CacheEntry> {
        let calculated = self.digest_sized(entry).await?;
        let key = entry.key().to_string();
        match self.enforcer.enforce(&key, entry.checksums(), &calculated) {
            Ok(agreed) => {
                debug!(%key, node = entry.node_id(), algorithms = ?agreed, "checksums verified");
                Ok(entry.clone().with_checksums(calculated))
            }
            Err(e) => {
                self.metrics.record_rejection();
                warn!(%key, node = entry.node_id(), error = %e, "rejecting artifact");
                Err(e)
            }
        }
    }

    /// Put new content into the closest writable tier
    ///
    /// Returns the id of the tier that took it, or `None` if every tier is
    /// read-only.
    pub async fn store(&self, key: CacheKey, data: impl Into<Bytes>) -> Result<Option<String>> {
        key.relative_path()?;
        let data = data.into();
        let algorithms = self.algorithms.clone();
        let (checksums, data) = tokio::task::spawn_blocking(move || {
            let sums = calculate(&data, &algorithms);
            (sums, data)
        })
        .await
        .map_err(|e| Error::Internal(format!("checksum task failed: {}", e)))?;

        let entry = CacheEntry::inline(key, data, "client").with_checksums(checksums);
        self.put(&entry).await
    }

    /// Put an entry handed over by another process into the closest writable tier
    ///
    /// Digests the entry claims are enforced like a fetched artifact's; an
    /// entry claiming none is stored with the calculated digests.
    pub async fn store_entry(&self, entry: &CacheEntry) -> Result<Option<String>> {
        entry.key().relative_path()?;
        let verified = if entry.checksums().is_empty() {
            let calculated = self.digest_sized(entry).await?;
            entry.clone().with_checksums(calculated)
        } else {
            self.verify(entry).await?
        };
        self.put(&verified).await
    }

    async fn put(&self, entry: &CacheEntry) -> Result<Option<String>> {
        let stored = self.chain.store(entry).await?;
        if stored.is_some() {
            self.metrics.record_store();
        }
        Ok(stored)
    }

    /// Digest the whole content and check it against the reported size
    async fn digest_sized(&self, entry: &CacheEntry) -> Result<Checksums> {
        let (calculated, consumed) = self.digest(entry).await?;
        self.metrics.record_verified(consumed);

        if consumed != entry.size() {
            self.metrics.record_rejection();
            let key = entry.key().to_string();
            warn!(%key, node = entry.node_id(), expected = entry.size(), actual = consumed, "size mismatch");
            return Err(Error::ChecksumMismatch {
                key,
                reason: format!("size {} does not match reported {}", consumed, entry.size()),
            });
        }
        Ok(calculated)
    }

    /// Read the whole content on the blocking pool, returning digests and length
    async fn digest(&self, entry: &CacheEntry) -> Result<(Checksums, u64)> {
        let content = entry.content().clone();
        let algorithms = self.algorithms.clone();
        let (tx, rx) = oneshot::channel();

        let consumed = tokio::task::spawn_blocking(move || -> Result<u64> {
            let reader = content.reader()?;
            let mut stream = ChecksumInputStream::new(reader, &algorithms, move |sums| {
                let _ = tx.send(sums);
            });
            io::copy(&mut stream, &mut io::sink())?;
            let consumed = stream.consumed();
            stream.close();
            Ok(consumed)
        })
        .await
        .map_err(|e| Error::Internal(format!("checksum task failed: {}", e)))??;

        let calculated = rx
            .await
            .map_err(|_| Error::Internal("content stream closed before its end".into()))?;
        Ok((calculated, consumed))
    }

    pub fn chain(&self) -> &Arc<NodeChain> {
        &self.chain
    }

    /// Names of the algorithms every fetch verifies with
    pub fn algorithms(&self) -> Vec<&str> {
        self.algorithms.iter().map(|a| a.name()).collect()
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        self.metrics.snapshot()
    }

    /// Close every tier
    pub async fn close(&self) -> Result<()> {
        self.chain.close().await
    }
}

impl std::fmt::Debug for ArtifactCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ArtifactCache")
            .field("chain", &self.chain)
            .field("algorithms", &self.algorithms())
            .finish()
    }
}

// =============================================================================
// Tests
// =============================================================================
