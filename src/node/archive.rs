//! Archive Tier
//!
//! Read-only bundle of artifacts unpacked into a directory, for example an
//! offline repository shipped alongside a build image. Artifacts are laid out
//! by path alone, so one archive serves every origin.

use std::io;
use std::path::{Component, Path, PathBuf};

use async_trait::async_trait;
use tracing::debug;

use super::entry::{CacheEntry, CacheKey, Content};
use super::local::read_sidecars;
use super::{Node, NodeFactory};
use crate::checksum::ChecksumRegistry;
use crate::error::{Error, Result};

/// Read-only directory tier
#[derive(Debug)]
pub struct ArchiveNode {
    id: String,
    distance: u32,
    root: PathBuf,
    registry: ChecksumRegistry,
}

impl ArchiveNode {
    pub fn new(
        id: impl Into<String>,
        root: impl Into<PathBuf>,
        distance: u32,
        registry: ChecksumRegistry,
    ) -> Self {
        Self {
            id: id.into(),
            distance,
            root: root.into(),
            registry,
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn artifact_path(&self, key: &CacheKey) -> Result<PathBuf> {
        let mut path = self.root.clone();
        for component in Path::new(key.path()).components() {
            match component {
                Component::Normal(c) => path.push(c),
                Component::CurDir => {}
                _ => return Err(Error::InvalidKey(key.to_string())),
            }
        }
        if path == self.root {
            return Err(Error::InvalidKey(key.to_string()));
        }
        Ok(path)
    }
}

#[async_trait]
impl Node for ArchiveNode {
    fn id(&self) -> &str {
        &self.id
    }

    fn distance(&self) -> u32 {
        self.distance
    }

    async fn locate(&self, key: &CacheKey) -> Result<Option<CacheEntry>> {
        let path = self.artifact_path(key)?;
        let metadata = match tokio::fs::metadata(&path).await {
            Ok(m) if m.is_file() => m,
            Ok(_) => return Ok(None),
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        let checksums = read_sidecars(&path, &self.registry).await?;
        debug!(archive = %self.id, %key, "found in archive");
        Ok(Some(
            CacheEntry::new(key.clone(), Content::File(path), metadata.len(), self.id.as_str())
                .with_checksums(checksums),
        ))
    }

    async fn close(&self) -> Result<()> {
        Ok(())
    }
}

/// Builds an archive tier if its directory exists
#[derive(Debug)]
pub struct ArchiveNodeFactory {
    id: String,
    root: PathBuf,
    distance: u32,
    registry: ChecksumRegistry,
}

impl ArchiveNodeFactory {
    pub fn new(
        id: impl Into<String>,
        root: impl Into<PathBuf>,
        distance: u32,
        registry: ChecksumRegistry,
    ) -> Self {
        Self {
            id: id.into(),
            root: root.into(),
            distance,
            registry,
        }
    }
}

#[async_trait]
impl NodeFactory for ArchiveNodeFactory {
    fn name(&self) -> &str {
        &self.id
    }

    async fn create(&self) -> Option<Box<dyn Node>> {
        match tokio::fs::metadata(&self.root).await {
            Ok(m) if m.is_dir() => Some(Box::new(ArchiveNode::new(
                self.id.clone(),
                self.root.clone(),
                self.distance,
                self.registry.clone(),
            ))),
            _ => {
                debug!(archive = %self.id, root = %self.root.display(), "archive directory missing");
                None
            }
        }
    }
}
