//! Checksum Algorithms
//!
//! Named digest factories and the single-use accumulators they produce.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use sha1::Sha1;
use sha2::{Digest, Sha256, Sha512};

use crate::error::{Error, Result};

/// Algorithm name → lowercase hex digest
pub type Checksums = BTreeMap<String, String>;

pub const SHA512: &str = "SHA-512";
pub const SHA256: &str = "SHA-256";
pub const SHA1: &str = "SHA-1";
pub const MD5: &str = "MD5";

// =============================================================================
// Traits
// =============================================================================

/// Mutable digest state for one computation
///
/// `checksum` consumes the accumulator, so a finalized instance can never be
/// fed again; every computation needs a fresh instance from its factory.
pub trait ChecksumAlgorithm: Send {
    /// Feed bytes, in any chunking
    fn update(&mut self, bytes: &[u8]);

    /// Finalize to a lowercase hex digest
    fn checksum(self: Box<Self>) -> String;
}

/// Registered source of accumulators for one algorithm
pub trait ChecksumAlgorithmFactory: fmt::Debug + Send + Sync {
    /// Canonical algorithm name, e.g. `SHA-1`
    fn name(&self) -> &str;

    /// Lowercase, dot-free sidecar extension, e.g. `sha1`
    fn file_extension(&self) -> &str;

    /// A fresh accumulator
    fn algorithm(&self) -> Box<dyn ChecksumAlgorithm>;
}

// =============================================================================
// Implementations
// =============================================================================

/// Accumulator over any RustCrypto digest
struct DigestAlgorithm<D> {
    hasher: D,
}

impl<D: Digest + Send> ChecksumAlgorithm for DigestAlgorithm<D> {
    fn update(&mut self, bytes: &[u8]) {
        Digest::update(&mut self.hasher, bytes);
    }

    fn checksum(self: Box<Self>) -> String {
        hex::encode(self.hasher.finalize())
    }
}

struct Md5Algorithm {
    context: md5::Context,
}

impl ChecksumAlgorithm for Md5Algorithm {
    fn update(&mut self, bytes: &[u8]) {
        self.context.consume(bytes);
    }

    fn checksum(self: Box<Self>) -> String {
        format!("{:x}", self.context.finalize())
    }
}

/// Factory for the built-in algorithms
pub struct BuiltinFactory {
    name: &'static str,
    extension: &'static str,
    create: fn() -> Box<dyn ChecksumAlgorithm>,
}

impl BuiltinFactory {
    pub fn sha512() -> Self {
        Self {
            name: SHA512,
            extension: "sha512",
            create: || Box::new(DigestAlgorithm { hasher: Sha512::new() }),
        }
    }

    pub fn sha256() -> Self {
        Self {
            name: SHA256,
            extension: "sha256",
            create: || Box::new(DigestAlgorithm { hasher: Sha256::new() }),
        }
    }

    pub fn sha1() -> Self {
        Self {
            name: SHA1,
            extension: "sha1",
            create: || Box::new(DigestAlgorithm { hasher: Sha1::new() }),
        }
    }

    pub fn md5() -> Self {
        Self {
            name: MD5,
            extension: "md5",
            create: || {
                Box::new(Md5Algorithm {
                    context: md5::Context::new(),
                })
            },
        }
    }
}

impl ChecksumAlgorithmFactory for BuiltinFactory {
    fn name(&self) -> &str {
        self.name
    }

    fn file_extension(&self) -> &str {
        self.extension
    }

    fn algorithm(&self) -> Box<dyn ChecksumAlgorithm> {
        (self.create)()
    }
}

impl fmt::Debug for BuiltinFactory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BuiltinFactory")
            .field("name", &self.name)
            .field("extension", &self.extension)
            .finish()
    }
}

// =============================================================================
// Registry
// =============================================================================

/// Named set of checksum factories
#[derive(Clone)]
pub struct ChecksumRegistry {
    factories: Vec<Arc<dyn ChecksumAlgorithmFactory>>,
}

impl ChecksumRegistry {
    /// Registry with no algorithms
    pub fn empty() -> Self {
        Self {
            factories: Vec::new(),
        }
    }

    /// Register a factory, replacing any factory of the same name
    pub fn register(&mut self, factory: Arc<dyn ChecksumAlgorithmFactory>) {
        self.factories
            .retain(|f| !f.name().eq_ignore_ascii_case(factory.name()));
        self.factories.push(factory);
    }

    /// Find a factory by name (case-insensitive)
    pub fn get(&self, name: &str) -> Option<Arc<dyn ChecksumAlgorithmFactory>> {
        self.factories
            .iter()
            .find(|f| f.name().eq_ignore_ascii_case(name))
            .cloned()
    }

    /// Resolve a list of names, failing on the first unknown one
    pub fn select<S: AsRef<str>>(
        &self,
        names: &[S],
    ) -> Result<Vec<Arc<dyn ChecksumAlgorithmFactory>>> {
        names
            .iter()
            .map(|name| {
                self.get(name.as_ref())
                    .ok_or_else(|| Error::UnknownAlgorithm(name.as_ref().to_string()))
            })
            .collect()
    }

    /// All registered factories, in registration order
    pub fn factories(&self) -> &[Arc<dyn ChecksumAlgorithmFactory>] {
        &self.factories
    }

    /// Canonical names of all registered algorithms
    pub fn names(&self) -> Vec<&str> {
        self.factories.iter().map(|f| f.name()).collect()
    }
}

impl Default for ChecksumRegistry {
    fn default() -> Self {
        let mut registry = Self::empty();
        registry.register(Arc::new(BuiltinFactory::sha512()));
        registry.register(Arc::new(BuiltinFactory::sha256()));
        registry.register(Arc::new(BuiltinFactory::sha1()));
        registry.register(Arc::new(BuiltinFactory::md5()));
        registry
    }
}

impl fmt::Debug for ChecksumRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.names()).finish()
    }
}

/// Compute digests of an in-memory buffer directly
pub fn calculate(data: &[u8], factories: &[Arc<dyn ChecksumAlgorithmFactory>]) -> Checksums {
    factories
        .iter()
        .map(|factory| {
            let mut algorithm = factory.algorithm();
            algorithm.update(data);
            (factory.name().to_string(), algorithm.checksum())
        })
        .collect()
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    #[test]
    fn test_known_digests() {
        let registry = ChecksumRegistry::default();
        let all = registry.factories().to_vec();
        let sums = calculate(b"abc", &all);

        assert_eq!(sums[SHA1], "a9993e364706816aba3e25717850c26c9cd0d89d");
        assert_eq!(
            sums[SHA256],
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
        assert_eq!(sums[MD5], "900150983cd24fb0d6963f7d28e17f72");
        assert!(sums[SHA512].starts_with("ddaf35a193617aba"));
    }

    #[test]
    fn test_chunked_updates_match_single_update() {
        let factory = BuiltinFactory::sha256();

        let mut whole = factory.algorithm();
        whole.update(b"hello world");

        let mut chunked = factory.algorithm();
        chunked.update(b"hel");
        chunked.update(b"");
        chunked.update(b"lo wor");
        chunked.update(b"ld");

        assert_eq!(whole.checksum(), chunked.checksum());
    }

    #[test]
    fn test_file_extensions() {
        let registry = ChecksumRegistry::default();
        let extensions: Vec<_> = registry
            .factories()
            .iter()
            .map(|f| f.file_extension().to_string())
            .collect();
        assert_eq!(extensions, vec!["sha512", "sha256", "sha1", "md5"]);
        for ext in extensions {
            assert!(!ext.contains('.'));
            assert_eq!(ext, ext.to_lowercase());
        }
    }

    #[test]
    fn test_lookup_is_case_insensitive() {
        let registry = ChecksumRegistry::default();
        assert_eq!(registry.get("sha-1").unwrap().name(), SHA1);
        assert!(registry.get("CRC32").is_none());
    }

    #[test]
    fn test_select_unknown_algorithm() {
        let registry = ChecksumRegistry::default();
        assert_eq!(registry.select(&["SHA-1", "MD5"]).unwrap().len(), 2);
        assert_matches!(
            registry.select(&["SHA-1", "CRC32"]),
            Err(Error::UnknownAlgorithm(name)) if name == "CRC32"
        );
    }

    #[test]
    fn test_selected_factories_are_debuggable() {
        let selected = ChecksumRegistry::default().select(&[SHA256, MD5]).unwrap();
        let rendered = format!("{:?}", selected);
        assert!(rendered.contains("SHA-256"), "{}", rendered);
        assert!(rendered.contains("md5"), "{}", rendered);
    }

    #[test]
    fn test_register_replaces_same_name() {
        let mut registry = ChecksumRegistry::default();
        registry.register(Arc::new(BuiltinFactory::sha1()));
        assert_eq!(registry.factories().len(), 4);
        assert_eq!(registry.names().last(), Some(&SHA1));
    }
}
