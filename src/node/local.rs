//! Local Disk Tier
//!
//! Artifacts live under `<base>/<origin>/<path>`, each with one sidecar file
//! per digest algorithm named `<file>.<extension>` (for example
//! `foo-1.0.jar.sha1`). Every operation holds the base directory through the
//! [`DirectoryLocker`], shared for lookups and stores, exclusive for purges.

use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::entry::{CacheEntry, CacheKey, Content};
use super::{Node, NodeFactory};
use crate::checksum::{ChecksumRegistry, Checksums};
use crate::error::{Error, Result};
use crate::locking::{DirectoryLocker, LockMode, OwnedDirectoryGuard, LOCK_FILE_NAME};

/// Distance of the local tier
pub const LOCAL_DISTANCE: u32 = 0;

const LOCAL_ID: &str = "local";

/// Disk tier rooted at one base directory
#[derive(Debug)]
pub struct LocalNode {
    base: PathBuf,
    registry: ChecksumRegistry,
    locker: Arc<DirectoryLocker>,
}

impl LocalNode {
    /// Create a new local tier over an existing directory
    pub fn new(base: impl Into<PathBuf>, registry: ChecksumRegistry, locker: Arc<DirectoryLocker>) -> Self {
        Self {
            base: base.into(),
            registry,
            locker,
        }
    }

    pub fn base(&self) -> &Path {
        &self.base
    }

    /// Where `key` lives below the base directory
    pub fn artifact_path(&self, key: &CacheKey) -> Result<PathBuf> {
        Ok(self.base.join(key.relative_path()?))
    }

    /// Remove every cached artifact
    ///
    /// Fails with a lock conflict while any lookup or store, in this process
    /// or another, holds the directory.
    pub async fn purge(&self) -> Result<usize> {
        let _guard = self.hold(LockMode::Exclusive).await?;

        let mut removed = 0;
        let mut dir = tokio::fs::read_dir(&self.base).await?;
        while let Some(child) = dir.next_entry().await? {
            if child.file_name() == LOCK_FILE_NAME {
                continue;
            }
            if child.file_type().await?.is_dir() {
                tokio::fs::remove_dir_all(child.path()).await?;
            } else {
                tokio::fs::remove_file(child.path()).await?;
            }
            removed += 1;
        }
        info!(base = %self.base.display(), removed, "local cache purged");
        Ok(removed)
    }

    /// Hold the base directory; canonicalizing and locking touch the disk, so
    /// they run on the blocking pool
    async fn hold(&self, mode: LockMode) -> Result<OwnedDirectoryGuard> {
        let locker = self.locker.clone();
        let base = self.base.clone();
        tokio::task::spawn_blocking(move || locker.owned_guard(&base, mode))
            .await
            .map_err(|e| Error::Internal(format!("lock task failed: {}", e)))?
    }
}

#[async_trait]
impl Node for LocalNode {
    fn id(&self) -> &str {
        LOCAL_ID
    }

    fn distance(&self) -> u32 {
        LOCAL_DISTANCE
    }

    async fn locate(&self, key: &CacheKey) -> Result<Option<CacheEntry>> {
        let path = self.artifact_path(key)?;
        let _guard = self.hold(LockMode::Shared).await?;

        let metadata = match tokio::fs::metadata(&path).await {
            Ok(m) if m.is_file() => m,
            Ok(_) => return Ok(None),
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let checksums = read_sidecars(&path, &self.registry).await?;

        Ok(Some(
            CacheEntry::new(key.clone(), Content::File(path), metadata.len(), LOCAL_ID)
                .with_checksums(checksums),
        ))
    }

    async fn store(&self, entry: &CacheEntry) -> Result<bool> {
        let path = self.artifact_path(entry.key())?;
        let _guard = self.hold(LockMode::Shared).await?;

        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        // Write beside the target and rename so readers never see a partial file
        let staging = staging_path(&path);
        let written = match entry.content() {
            Content::File(source) => tokio::fs::copy(source, &staging).await.map(|_| ()),
            Content::Inline(bytes) => tokio::fs::write(&staging, bytes).await,
        };
        if let Err(e) = written {
            let _ = tokio::fs::remove_file(&staging).await;
            return Err(e.into());
        }
        // Digests of the previous content must not vouch for the new one
        remove_stale_sidecars(&path, entry.checksums(), &self.registry).await?;
        tokio::fs::rename(&staging, &path).await?;

        write_sidecars(&path, entry.checksums(), &self.registry).await?;
        debug!(key = %entry.key(), path = %path.display(), "stored on local disk");
        Ok(true)
    }

    async fn close(&self) -> Result<()> {
        Ok(())
    }
}

fn staging_path(path: &Path) -> PathBuf {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    path.with_file_name(format!(".{}.{}.part", name, Uuid::new_v4()))
}

// =============================================================================
// Sidecar Files
// =============================================================================

/// Sidecar path for one algorithm extension
pub(crate) fn sidecar_path(artifact: &Path, extension: &str) -> PathBuf {
    let mut name = artifact.as_os_str().to_owned();
    name.push(".");
    name.push(extension);
    PathBuf::from(name)
}

/// Read the digests recorded next to `artifact` for every registered algorithm
pub(crate) async fn read_sidecars(artifact: &Path, registry: &ChecksumRegistry) -> Result<Checksums> {
    let mut checksums = Checksums::new();
    for factory in registry.factories() {
        let sidecar = sidecar_path(artifact, factory.file_extension());
        match tokio::fs::read_to_string(&sidecar).await {
            Ok(content) => {
                // Sidecars may carry "<digest>  <file name>"
                if let Some(digest) = content.split_whitespace().next() {
                    checksums.insert(factory.name().to_string(), digest.to_ascii_lowercase());
                }
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
    }
    Ok(checksums)
}

/// Record `checksums` next to `artifact`, skipping unregistered algorithms
pub(crate) async fn write_sidecars(
    artifact: &Path,
    checksums: &Checksums,
    registry: &ChecksumRegistry,
) -> Result<()> {
    for (name, digest) in checksums {
        let Some(factory) = registry.get(name) else {
            warn!(algorithm = %name, "no sidecar extension for algorithm, skipping");
            continue;
        };
        tokio::fs::write(sidecar_path(artifact, factory.file_extension()), digest).await?;
    }
    Ok(())
}

/// Delete sidecars of registered algorithms that `checksums` does not cover
pub(crate) async fn remove_stale_sidecars(
    artifact: &Path,
    checksums: &Checksums,
    registry: &ChecksumRegistry,
) -> Result<()> {
    for factory in registry.factories() {
        if checksums.keys().any(|name| name.eq_ignore_ascii_case(factory.name())) {
            continue;
        }
        match tokio::fs::remove_file(sidecar_path(artifact, factory.file_extension())).await {
            Ok(()) => debug!(artifact = %artifact.display(), algorithm = factory.name(), "removed stale sidecar"),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
    }
    Ok(())
}

// =============================================================================
// Factory
// =============================================================================

/// Builds the local tier when it is enabled and its directory is usable
#[derive(Debug)]
pub struct LocalNodeFactory {
    enabled: bool,
    directory: PathBuf,
    registry: ChecksumRegistry,
    locker: Arc<DirectoryLocker>,
}

impl LocalNodeFactory {
    pub fn new(
        enabled: bool,
        directory: impl Into<PathBuf>,
        registry: ChecksumRegistry,
        locker: Arc<DirectoryLocker>,
    ) -> Self {
        Self {
            enabled,
            directory: directory.into(),
            registry,
            locker,
        }
    }
}

#[async_trait]
impl NodeFactory for LocalNodeFactory {
    fn name(&self) -> &str {
        LOCAL_ID
    }

    async fn create(&self) -> Option<Box<dyn Node>> {
        if !self.enabled {
            return None;
        }
        if let Err(e) = tokio::fs::create_dir_all(&self.directory).await {
            warn!(directory = %self.directory.display(), error = %e, "local cache directory unusable");
            return None;
        }
        Some(Box::new(LocalNode::new(
            self.directory.clone(),
            self.registry.clone(),
            self.locker.clone(),
        )))
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checksum::{calculate, SHA1, SHA256};
    use crate::error::Error;
    use assert_matches::assert_matches;
    use tempfile::TempDir;

    fn node(dir: &TempDir) -> LocalNode {
        LocalNode::new(
            dir.path(),
            ChecksumRegistry::default(),
            Arc::new(DirectoryLocker::new()),
        )
    }

    fn entry(data: &'static [u8]) -> CacheEntry {
        let registry = ChecksumRegistry::default();
        let sums = calculate(data, &registry.select(&[SHA1, SHA256]).unwrap());
        CacheEntry::inline(CacheKey::new("central", "org/foo/foo-1.0.jar"), data, "far")
            .with_checksums(sums)
    }

    #[tokio::test]
    async fn test_store_then_locate() {
        let dir = TempDir::new().unwrap();
        let local = node(&dir);
        let stored = entry(b"jar contents");

        assert!(local.store(&stored).await.unwrap());

        let found = local.locate(stored.key()).await.unwrap().unwrap();
        assert_eq!(found.node_id(), "local");
        assert_eq!(found.size(), 12);
        assert_eq!(found.checksums(), stored.checksums());
        let path = found.content().location().unwrap();
        assert_eq!(std::fs::read(path).unwrap(), b"jar contents");
        assert!(sidecar_path(path, "sha1").exists());
        assert!(sidecar_path(path, "sha256").exists());
    }

    #[tokio::test]
    async fn test_locate_missing() {
        let dir = TempDir::new().unwrap();
        let local = node(&dir);
        assert!(local
            .locate(&CacheKey::new("central", "absent.jar"))
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_sidecar_with_file_name_suffix() {
        let dir = TempDir::new().unwrap();
        let local = node(&dir);
        let key = CacheKey::new("central", "x.pom");
        let path = local.artifact_path(&key).unwrap();
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(&path, b"pom").unwrap();
        std::fs::write(sidecar_path(&path, "sha1"), "ABCDEF  x.pom\n").unwrap();

        let found = local.locate(&key).await.unwrap().unwrap();
        assert_eq!(found.checksums()[SHA1], "abcdef");
        assert_eq!(found.checksums().len(), 1);
    }

    #[tokio::test]
    async fn test_store_from_file_content() {
        let dir = TempDir::new().unwrap();
        let source = dir.path().join("source.bin");
        std::fs::write(&source, b"from disk").unwrap();

        let cache_dir = TempDir::new().unwrap();
        let local = node(&cache_dir);
        let key = CacheKey::new("o", "a/b.bin");
        let entry = CacheEntry::new(key.clone(), Content::File(source), 9, "daemon");

        assert!(local.store(&entry).await.unwrap());
        let path = local.artifact_path(&key).unwrap();
        assert_eq!(std::fs::read(path).unwrap(), b"from disk");
    }

    #[tokio::test]
    async fn test_overwrite_drops_sidecars_of_previous_content() {
        let dir = TempDir::new().unwrap();
        let local = node(&dir);
        let first = entry(b"version one");
        local.store(&first).await.unwrap();

        let second = CacheEntry::inline(first.key().clone(), &b"version two"[..], "builder");
        local.store(&second).await.unwrap();

        let found = local.locate(first.key()).await.unwrap().unwrap();
        assert!(found.checksums().is_empty(), "{:?}", found.checksums());
        let path = found.content().location().unwrap();
        assert_eq!(std::fs::read(path).unwrap(), b"version two");
        assert!(!sidecar_path(path, "sha1").exists());
    }

    #[tokio::test]
    async fn test_overwrite_keeps_only_new_digests() {
        let dir = TempDir::new().unwrap();
        let local = node(&dir);
        let first = entry(b"version one");
        local.store(&first).await.unwrap();

        let registry = ChecksumRegistry::default();
        let sums = calculate(b"version two", &registry.select(&[SHA256]).unwrap());
        let second = CacheEntry::inline(first.key().clone(), &b"version two"[..], "builder")
            .with_checksums(sums.clone());
        local.store(&second).await.unwrap();

        let found = local.locate(first.key()).await.unwrap().unwrap();
        assert_eq!(found.checksums(), &sums);
    }

    #[tokio::test]
    async fn test_concurrent_lookups_share_the_directory() {
        let dir = TempDir::new().unwrap();
        let local = node(&dir);
        let stored = entry(b"shared");
        local.store(&stored).await.unwrap();

        let (a, b) = tokio::join!(local.locate(stored.key()), local.locate(stored.key()));
        assert!(a.unwrap().is_some());
        assert!(b.unwrap().is_some());
        assert_eq!(local.locker.holds(dir.path()), 0);
    }

    #[tokio::test]
    async fn test_lookup_denied_while_purging_elsewhere() {
        let dir = TempDir::new().unwrap();
        let local = node(&dir);
        local.store(&entry(b"x")).await.unwrap();

        // A second locker stands in for another process
        let other = DirectoryLocker::new();
        other.lock_directory(dir.path(), LockMode::Exclusive).unwrap();
        assert_matches!(
            local.locate(entry(b"x").key()).await,
            Err(Error::LockConflict { .. })
        );
        other.unlock_directory(dir.path());

        assert!(local.locate(entry(b"x").key()).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_purge_keeps_sentinel() {
        let dir = TempDir::new().unwrap();
        let local = node(&dir);
        local.store(&entry(b"x")).await.unwrap();

        assert_eq!(local.purge().await.unwrap(), 1);
        assert!(local.locate(entry(b"x").key()).await.unwrap().is_none());
        assert!(dir.path().join(LOCK_FILE_NAME).exists());
    }

    #[tokio::test]
    async fn test_invalid_key_rejected() {
        let dir = TempDir::new().unwrap();
        let local = node(&dir);
        assert_matches!(
            local.locate(&CacheKey::new("central", "../escape")).await,
            Err(Error::InvalidKey(_))
        );
    }

    #[tokio::test]
    async fn test_factory_respects_enabled_flag() {
        let dir = TempDir::new().unwrap();
        let locker = Arc::new(DirectoryLocker::new());

        let disabled = LocalNodeFactory::new(false, dir.path(), ChecksumRegistry::default(), locker.clone());
        assert!(disabled.create().await.is_none());

        let nested = dir.path().join("nested").join("cache");
        let enabled = LocalNodeFactory::new(true, &nested, ChecksumRegistry::default(), locker);
        let built = enabled.create().await.unwrap();
        assert_eq!(built.distance(), LOCAL_DISTANCE);
        assert!(nested.is_dir());
    }
}
