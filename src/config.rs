//! Cache Configuration
//!
//! YAML-backed description of which tiers a cache should assemble.
//!
//! ```yaml
//! local:
//!   directory: /var/cache/tiercache
//! daemon:
//!   enabled: true
//!   endpoints: ["unix:///run/tiercache.sock", "127.0.0.1:7601"]
//! archives:
//!   - id: offline
//!     directory: /opt/bundle
//! mirrors:
//!   - "office=10.0.0.5:7601,10.0.0.6:7601"
//! checksums: ["SHA-1", "SHA-256"]
//! ```

use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::checksum::{ChecksumRegistry, SHA1, SHA256};
use crate::error::{Error, Result};
use crate::locking::DirectoryLocker;
use crate::node::{ArchiveNodeFactory, DaemonNodeFactory, LocalNodeFactory, NodeFactory};
use crate::protocol::Endpoint;

/// Distance of the first mirror; later mirrors follow in declared order
pub const MIRROR_BASE_DISTANCE: u32 = 3;

/// Top-level cache configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    pub local: LocalConfig,
    pub daemon: DaemonConfig,
    pub archives: Vec<ArchiveConfig>,
    /// Compact mirror specs, `id=endpoint1,endpoint2,...`
    pub mirrors: Vec<String>,
    /// Algorithms computed and verified for every fetched artifact
    pub checksums: Vec<String>,
    pub connect_timeout_ms: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            local: LocalConfig::default(),
            daemon: DaemonConfig::default(),
            archives: Vec::new(),
            mirrors: Vec::new(),
            checksums: vec![SHA1.to_string(), SHA256.to_string()],
            connect_timeout_ms: 1000,
        }
    }
}

/// Local disk tier
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LocalConfig {
    pub enabled: bool,
    pub directory: PathBuf,
}

impl Default for LocalConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            directory: PathBuf::from(".tiercache"),
        }
    }
}

/// Shared local daemon tier
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DaemonConfig {
    pub enabled: bool,
    /// Tried in order; the first reachable one is used
    pub endpoints: Vec<String>,
    pub distance: u32,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            endpoints: vec!["127.0.0.1:7601".to_string()],
            distance: 1,
        }
    }
}

/// Read-only archive tier
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArchiveConfig {
    pub id: String,
    pub directory: PathBuf,
    #[serde(default = "default_archive_distance")]
    pub distance: u32,
}

fn default_archive_distance() -> u32 {
    2
}

impl CacheConfig {
    /// Parse configuration from YAML text
    pub fn from_yaml_str(yaml: &str) -> Result<Self> {
        let config: Self = serde_yaml::from_str(yaml)?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a YAML file
    pub fn load(path: &Path) -> Result<Self> {
        let yaml = std::fs::read_to_string(path)?;
        Self::from_yaml_str(&yaml)
    }

    /// Check everything that can be checked without touching the network
    pub fn validate(&self) -> Result<()> {
        ChecksumRegistry::default().select(&self.checksums)?;
        if self.checksums.is_empty() {
            return Err(Error::Config("at least one checksum algorithm is required".into()));
        }
        for endpoint in &self.daemon.endpoints {
            Endpoint::from_str(endpoint)?;
        }
        for archive in &self.archives {
            if archive.id.is_empty() {
                return Err(Error::Config("archive without an id".into()));
            }
        }
        self.mirror_specs()?;
        Ok(())
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    /// Parsed mirror specs, in declared order
    pub fn mirror_specs(&self) -> Result<Vec<MirrorSpec>> {
        self.mirrors.iter().map(|m| MirrorSpec::parse(m)).collect()
    }

    /// One factory per configured tier
    pub fn factories(
        &self,
        registry: &ChecksumRegistry,
        locker: Arc<DirectoryLocker>,
    ) -> Result<Vec<Box<dyn NodeFactory>>> {
        let timeout = self.connect_timeout();
        let mut factories: Vec<Box<dyn NodeFactory>> = Vec::new();

        factories.push(Box::new(LocalNodeFactory::new(
            self.local.enabled,
            self.local.directory.clone(),
            registry.clone(),
            locker,
        )));

        if self.daemon.enabled {
            let endpoints = self
                .daemon
                .endpoints
                .iter()
                .map(|e| Endpoint::from_str(e))
                .collect::<Result<Vec<_>>>()?;
            factories.push(Box::new(
                DaemonNodeFactory::new("daemon", endpoints, self.daemon.distance)
                    .with_timeout(timeout),
            ));
        }

        for archive in &self.archives {
            factories.push(Box::new(ArchiveNodeFactory::new(
                archive.id.clone(),
                archive.directory.clone(),
                archive.distance,
                registry.clone(),
            )));
        }

        for (index, mirror) in self.mirror_specs()?.into_iter().enumerate() {
            factories.push(Box::new(
                DaemonNodeFactory::new(
                    mirror.id,
                    mirror.endpoints,
                    MIRROR_BASE_DISTANCE + index as u32,
                )
                .with_timeout(timeout),
            ));
        }

        Ok(factories)
    }
}

/// A named mirror with its fallback endpoints
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MirrorSpec {
    pub id: String,
    /// In the order they were written
    pub endpoints: Vec<Endpoint>,
}

impl MirrorSpec {
    /// Parse `id=endpoint1,endpoint2,...`
    pub fn parse(spec: &str) -> Result<Self> {
        let (id, endpoints) = spec
            .split_once('=')
            .ok_or_else(|| Error::Config(format!("mirror '{}' is not of the form id=endpoints", spec)))?;

        let id = id.trim();
        if id.is_empty() {
            return Err(Error::Config(format!("mirror '{}' has an empty id", spec)));
        }

        let endpoints = endpoints
            .split(',')
            .map(str::trim)
            .filter(|e| !e.is_empty())
            .map(Endpoint::from_str)
            .collect::<Result<Vec<_>>>()?;
        if endpoints.is_empty() {
            return Err(Error::Config(format!("mirror '{}' lists no endpoints", id)));
        }

        Ok(Self {
            id: id.to_string(),
            endpoints,
        })
    }
}

impl FromStr for MirrorSpec {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    #[test]
    fn test_defaults() {
        let config = CacheConfig::default();
        assert!(config.local.enabled);
        assert!(!config.daemon.enabled);
        assert_eq!(config.checksums, vec!["SHA-1", "SHA-256"]);
        assert_eq!(config.connect_timeout(), Duration::from_secs(1));
    }

    #[test]
    fn test_from_yaml() {
        let yaml = r#"
local:
  directory: /var/cache/tiercache
daemon:
  enabled: true
  endpoints: ["unix:///run/tiercache.sock", "127.0.0.1:7601"]
archives:
  - id: offline
    directory: /opt/bundle
  - id: vendor
    directory: /opt/vendor
    distance: 6
mirrors:
  - "office=10.0.0.5:7601,10.0.0.6:7601"
checksums: ["SHA-512"]
"#;
        let config = CacheConfig::from_yaml_str(yaml).unwrap();
        assert_eq!(config.local.directory, PathBuf::from("/var/cache/tiercache"));
        assert!(config.local.enabled);
        assert_eq!(config.daemon.endpoints.len(), 2);
        assert_eq!(config.daemon.distance, 1);
        assert_eq!(config.archives[0].distance, 2);
        assert_eq!(config.archives[1].distance, 6);
        assert_eq!(config.checksums, vec!["SHA-512"]);
        assert_eq!(config.connect_timeout_ms, 1000);

        let factories = config
            .factories(&ChecksumRegistry::default(), Arc::new(DirectoryLocker::new()))
            .unwrap();
        let names: Vec<_> = factories.iter().map(|f| f.name()).collect();
        assert_eq!(names, vec!["local", "daemon", "offline", "vendor", "office"]);
    }

    #[test]
    fn test_invalid_config_rejected() {
        assert_matches!(
            CacheConfig::from_yaml_str("checksums: [\"CRC-7\"]"),
            Err(Error::UnknownAlgorithm(_))
        );
        assert_matches!(
            CacheConfig::from_yaml_str("checksums: []"),
            Err(Error::Config(_))
        );
        assert_matches!(
            CacheConfig::from_yaml_str("daemon:\n  endpoints: [\"nowhere\"]"),
            Err(Error::Config(_))
        );
        assert_matches!(
            CacheConfig::from_yaml_str("local: [1, 2]"),
            Err(Error::Yaml(_))
        );
    }

    #[test]
    fn test_mirror_spec_preserves_order() {
        let spec = MirrorSpec::parse("office=10.0.0.9:7601, 10.0.0.1:7601 ,unix:///run/m.sock").unwrap();
        assert_eq!(spec.id, "office");
        assert_eq!(
            spec.endpoints,
            vec![
                Endpoint::from_str("10.0.0.9:7601").unwrap(),
                Endpoint::from_str("10.0.0.1:7601").unwrap(),
                Endpoint::Unix(PathBuf::from("/run/m.sock")),
            ]
        );
    }

    #[test]
    fn test_mirror_spec_errors() {
        for bad in ["office", "=1.2.3.4:1", "office=", "office= , ", "office=not-an-endpoint"] {
            assert_matches!(MirrorSpec::parse(bad), Err(Error::Config(_)), "{}", bad);
        }
    }

    #[test]
    fn test_mirror_distances_follow_declaration() {
        let config = CacheConfig {
            mirrors: vec!["b=127.0.0.1:1".into(), "a=127.0.0.1:2".into()],
            ..Default::default()
        };
        let specs = config.mirror_specs().unwrap();
        assert_eq!(specs[0].id, "b");
        assert_eq!(specs[1].id, "a");
    }
}
