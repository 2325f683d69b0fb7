//! In-Process Memory Tier
//!
//! Tier backed by a concurrent map, for embedders that run several caches in
//! one process and for exercising the chain without disks or sockets.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use tracing::debug;

use super::entry::{CacheEntry, CacheKey, Content};
use super::{Node, NodeFactory};
use crate::checksum::{calculate, ChecksumRegistry, Checksums, SHA1, SHA256};
use crate::error::{Error, Result};

#[derive(Debug)]
struct Stored {
    data: Bytes,
    checksums: Checksums,
}

#[derive(Debug)]
struct Inner {
    id: String,
    distance: u32,
    read_only: bool,
    /// Lock-free storage via DashMap
    entries: DashMap<CacheKey, Stored>,
    lookups: AtomicU64,
    stores: AtomicU64,
    closed: AtomicBool,
}

/// Memory tier; clones share the same storage
#[derive(Debug, Clone)]
pub struct MemoryNode {
    inner: Arc<Inner>,
}

impl MemoryNode {
    /// Create a new writable memory tier
    pub fn new(id: impl Into<String>, distance: u32) -> Self {
        Self::build(id.into(), distance, false)
    }

    /// Create a memory tier that refuses promotion writes
    pub fn read_only(id: impl Into<String>, distance: u32) -> Self {
        Self::build(id.into(), distance, true)
    }

    fn build(id: String, distance: u32, read_only: bool) -> Self {
        Self {
            inner: Arc::new(Inner {
                id,
                distance,
                read_only,
                entries: DashMap::new(),
                lookups: AtomicU64::new(0),
                stores: AtomicU64::new(0),
                closed: AtomicBool::new(false),
            }),
        }
    }

    /// Seed an artifact, recording its SHA-1 and SHA-256 digests
    pub fn put(&self, key: CacheKey, data: impl Into<Bytes>) {
        let data = data.into();
        let registry = ChecksumRegistry::default();
        let checksums = registry
            .select(&[SHA1, SHA256])
            .map(|factories| calculate(&data, &factories))
            .unwrap_or_default();
        self.put_with_checksums(key, data, checksums);
    }

    /// Seed an artifact with caller-supplied digests
    pub fn put_with_checksums(&self, key: CacheKey, data: impl Into<Bytes>, checksums: Checksums) {
        self.inner.entries.insert(
            key,
            Stored {
                data: data.into(),
                checksums,
            },
        );
    }

    pub fn contains(&self, key: &CacheKey) -> bool {
        self.inner.entries.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.inner.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.entries.is_empty()
    }

    /// Number of `locate` calls served
    pub fn lookups(&self) -> u64 {
        self.inner.lookups.load(Ordering::Relaxed)
    }

    /// Number of entries accepted through `store`
    pub fn stores(&self) -> u64 {
        self.inner.stores.load(Ordering::Relaxed)
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    fn ensure_open(&self) -> Result<()> {
        if self.is_closed() {
            return Err(Error::Tier {
                node: self.inner.id.clone(),
                reason: "node is closed".into(),
            });
        }
        Ok(())
    }
}

#[async_trait]
impl Node for MemoryNode {
    fn id(&self) -> &str {
        &self.inner.id
    }

    fn distance(&self) -> u32 {
        self.inner.distance
    }

    async fn locate(&self, key: &CacheKey) -> Result<Option<CacheEntry>> {
        self.ensure_open()?;
        self.inner.lookups.fetch_add(1, Ordering::Relaxed);

        Ok(self.inner.entries.get(key).map(|stored| {
            CacheEntry::inline(key.clone(), stored.data.clone(), self.inner.id.as_str())
                .with_checksums(stored.checksums.clone())
        }))
    }

    async fn store(&self, entry: &CacheEntry) -> Result<bool> {
        self.ensure_open()?;
        if self.inner.read_only {
            return Ok(false);
        }

        let data = match entry.content() {
            Content::Inline(bytes) => bytes.clone(),
            Content::File(path) => Bytes::from(tokio::fs::read(path).await?),
        };
        debug!(node = %self.inner.id, key = %entry.key(), size = data.len(), "stored in memory");
        self.put_with_checksums(entry.key().clone(), data, entry.checksums().clone());
        self.inner.stores.fetch_add(1, Ordering::Relaxed);
        Ok(true)
    }

    async fn close(&self) -> Result<()> {
        self.inner.closed.store(true, Ordering::Release);
        Ok(())
    }
}

/// Hands out a shared [`MemoryNode`]
#[derive(Debug, Clone)]
pub struct MemoryNodeFactory {
    node: MemoryNode,
}

impl MemoryNodeFactory {
    pub fn new(node: MemoryNode) -> Self {
        Self { node }
    }
}

#[async_trait]
impl NodeFactory for MemoryNodeFactory {
    fn name(&self) -> &str {
        "memory"
    }

    async fn create(&self) -> Option<Box<dyn Node>> {
        Some(Box::new(self.node.clone()))
    }
}

// =============================================================================
// Tests
// =============================================================================
