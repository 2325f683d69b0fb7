//! Cache Orchestration
//!
//! [`ArtifactCache`] combines the node chain with the checksum pipeline;
//! [`CacheMetrics`] records how its lookups resolve.

mod metrics;
mod orchestrator;

pub use metrics::{CacheMetrics, LatencyTracker, MetricsSnapshot};
pub use orchestrator::ArtifactCache;
