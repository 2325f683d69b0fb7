//! Cache Tiers
//!
//! Every tier implements [`Node`] and is built by a [`NodeFactory`]. The
//! [`NodeChain`] orders the tiers by distance and resolves lookups through
//! them, back-filling closer tiers on a hit.
//!
//! # Tier Variants
//!
//! | Variant | Distance | Writable | Transport |
//! |---------|----------|----------|-----------|
//! | [`LocalNode`] | 0 | yes | local disk, guarded by the directory locker |
//! | [`DaemonNode`] | configurable | yes (file content) | wire protocol |
//! | [`ArchiveNode`] | configurable | no | read-only bundle directory |
//! | [`MemoryNode`] | configurable | yes | in-process map |

mod archive;
mod chain;
mod daemon;
mod entry;
mod local;
mod memory;

pub use archive::{ArchiveNode, ArchiveNodeFactory};
pub use chain::{Hit, NodeChain};
pub use daemon::{DaemonNode, DaemonNodeFactory};
pub use entry::{CacheEntry, CacheKey, Content};
pub use local::{LocalNode, LocalNodeFactory, LOCAL_DISTANCE};
pub use memory::{MemoryNode, MemoryNodeFactory};

pub(crate) use daemon::{
    entry_from_data, entry_to_data, key_from_data, CLIENT, SERVER, VERSION,
};

use async_trait::async_trait;

use crate::error::Result;

/// One cache tier
///
/// Implementations guard their own private state; the chain may query a
/// tier from several tasks at once.
#[async_trait]
pub trait Node: Send + Sync {
    /// Stable identifier, used in logs and recorded on entries
    fn id(&self) -> &str;

    /// Proximity rank; 0 is local. Never changes after construction.
    fn distance(&self) -> u32;

    /// Look the key up without mutating the tier
    async fn locate(&self, key: &CacheKey) -> Result<Option<CacheEntry>>;

    /// Store an entry found on a farther tier
    ///
    /// Returns `false` when this tier does not accept writes.
    async fn store(&self, _entry: &CacheEntry) -> Result<bool> {
        Ok(false)
    }

    /// Release transport and resources; idempotent
    async fn close(&self) -> Result<()>;
}

/// Builds one tier from configuration
#[async_trait]
pub trait NodeFactory: Send + Sync {
    /// Variant name, for logs
    fn name(&self) -> &str;

    /// Construct the tier, or `None` when its preconditions are not met
    async fn create(&self) -> Option<Box<dyn Node>>;
}
