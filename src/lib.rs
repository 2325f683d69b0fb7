//! tiercache - Multi-Tier Artifact Cache
//!
//! Build processes ask one [`ArtifactCache`] for an artifact; the cache
//! consults a chain of tiers ordered by proximity (local disk, a shared local
//! daemon, archives, peer mirrors), verifies what it finds, and back-fills
//! the closer tiers so the next build resolves the artifact locally.
//!
//! # Architecture
//!
//! ```text
//! ┌───────────────────────────────────────────────────────────────────┐
//! │                          ArtifactCache                             │
//! │          locate ─► verify (checksum) ─► promote                    │
//! ├───────────────────────────────────────────────────────────────────┤
//! │                            NodeChain                               │
//! │  ┌─────────┐   ┌──────────┐   ┌─────────┐   ┌──────────────────┐  │
//! │  │ Local 0 │──▶│ Daemon 1 │──▶│ Archive │──▶│ Mirror 3, 4, ... │  │
//! │  └────┬────┘   └────┬─────┘   └─────────┘   └────────┬─────────┘  │
//! │       │             │ wire protocol                   │            │
//! │  DirectoryLocker    └──────────▶ tiercached ◀─────────┘            │
//! └───────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Modules
//!
//! - [`cache`] - Fetch orchestration and metrics
//! - [`checksum`] - Digest algorithms, streaming digests and enforcement
//! - [`config`] - YAML configuration of the tiers
//! - [`daemon`] - Shared local daemon server
//! - [`error`] - Error types
//! - [`locking`] - Cross-process reentrant directory locks
//! - [`node`] - Tier capability, tier variants and the node chain
//! - [`protocol`] - Daemon wire protocol

pub mod cache;
pub mod checksum;
pub mod config;
pub mod daemon;
pub mod error;
pub mod locking;
pub mod node;
pub mod protocol;

// Re-export commonly used types
pub use cache::{ArtifactCache, CacheMetrics, MetricsSnapshot};
pub use checksum::{ChecksumEnforcer, ChecksumInputStream, ChecksumRegistry, Checksums};
pub use config::{CacheConfig, MirrorSpec};
pub use daemon::DaemonServer;
pub use error::{Error, Result};
pub use locking::{DirectoryLocker, LockMode};
pub use node::{CacheEntry, CacheKey, Content, Node, NodeChain, NodeFactory};
