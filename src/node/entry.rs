//! Cache Entry Types
//!
//! Keys identify an artifact across every tier; entries describe where one
//! tier found it.

use std::fmt;
use std::fs::File;
use std::io::{Cursor, Read};
use std::path::{Component, Path, PathBuf};

use bytes::Bytes;

use crate::checksum::Checksums;
use crate::error::{Error, Result};

/// Cache key - origin repository plus artifact path
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CacheKey {
    /// Repository the artifact was resolved from
    origin: String,
    /// Slash-separated artifact path within the origin
    path: String,
}

impl CacheKey {
    /// Create a new cache key
    pub fn new(origin: impl Into<String>, path: impl Into<String>) -> Self {
        Self {
            origin: origin.into(),
            path: path.into(),
        }
    }

    /// Get origin identifier
    #[inline]
    pub fn origin(&self) -> &str {
        &self.origin
    }

    /// Get artifact path
    #[inline]
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Path of this artifact below a tier's base directory
    ///
    /// Rejects keys that would escape the base directory.
    pub fn relative_path(&self) -> Result<PathBuf> {
        let mut out = PathBuf::new();
        for part in [self.origin.as_str(), self.path.as_str()] {
            let rel = Path::new(part);
            if part.is_empty() {
                return Err(Error::InvalidKey(self.to_string()));
            }
            for component in rel.components() {
                match component {
                    Component::Normal(c) => out.push(c),
                    Component::CurDir => {}
                    _ => return Err(Error::InvalidKey(self.to_string())),
                }
            }
        }
        Ok(out)
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.origin, self.path)
    }
}

/// Where an entry's bytes can be read from
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Content {
    /// File on a locally reachable filesystem
    File(PathBuf),
    /// Bytes held in memory
    Inline(Bytes),
}

impl Content {
    /// Open a blocking reader over the content
    pub fn reader(&self) -> Result<Box<dyn Read + Send>> {
        match self {
            Content::File(path) => Ok(Box::new(File::open(path)?)),
            Content::Inline(bytes) => Ok(Box::new(Cursor::new(bytes.clone()))),
        }
    }

    /// File location, if the content lives on disk
    pub fn location(&self) -> Option<&Path> {
        match self {
            Content::File(path) => Some(path),
            Content::Inline(_) => None,
        }
    }
}

/// Result of a successful lookup on one tier
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CacheEntry {
    key: CacheKey,
    content: Content,
    size: u64,
    checksums: Checksums,
    node_id: String,
}

impl CacheEntry {
    /// Create a new entry without digests
    pub fn new(key: CacheKey, content: Content, size: u64, node_id: impl Into<String>) -> Self {
        Self {
            key,
            content,
            size,
            checksums: Checksums::new(),
            node_id: node_id.into(),
        }
    }

    /// Create an in-memory entry sized from its bytes
    pub fn inline(key: CacheKey, data: impl Into<Bytes>, node_id: impl Into<String>) -> Self {
        let data = data.into();
        let size = data.len() as u64;
        Self::new(key, Content::Inline(data), size, node_id)
    }

    /// Attach the digests the producing tier reports
    pub fn with_checksums(mut self, checksums: Checksums) -> Self {
        self.checksums = checksums;
        self
    }

    pub fn key(&self) -> &CacheKey {
        &self.key
    }

    pub fn content(&self) -> &Content {
        &self.content
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    /// Algorithm name to hex digest, as reported by the producing tier
    pub fn checksums(&self) -> &Checksums {
        &self.checksums
    }

    /// Id of the tier that produced this entry
    pub fn node_id(&self) -> &str {
        &self.node_id
    }
}

// =============================================================================
// Tests
// =============================================================================
