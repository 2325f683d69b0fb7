//! Checksum Pipeline
//!
//! Pluggable digest algorithms, a streaming decorator that digests bytes as a
//! consumer reads them, and the policy that accepts or rejects an artifact
//! by comparing expected and calculated digests.
//!
//! ```
//! use std::io::{Cursor, Read};
//! use std::sync::{Arc, Mutex};
//! use tiercache::checksum::{ChecksumInputStream, ChecksumRegistry, SHA1};
//!
//! let registry = ChecksumRegistry::default();
//! let factories = registry.select(&[SHA1]).unwrap();
//! let result = Arc::new(Mutex::new(None));
//! let sink = result.clone();
//!
//! let mut stream = ChecksumInputStream::new(Cursor::new(b"abc".to_vec()), &factories, move |sums| {
//!     *sink.lock().unwrap() = Some(sums);
//! });
//! std::io::copy(&mut stream, &mut std::io::sink()).unwrap();
//! stream.close();
//!
//! let sums = result.lock().unwrap().take().unwrap();
//! assert_eq!(sums[SHA1], "a9993e364706816aba3e25717850c26c9cd0d89d");
//! ```

mod algorithm;
mod enforcer;
mod stream;

#[cfg(test)]
mod proptest;

pub use algorithm::{
    calculate, BuiltinFactory, ChecksumAlgorithm, ChecksumAlgorithmFactory, ChecksumRegistry,
    Checksums, MD5, SHA1, SHA256, SHA512,
};
pub use enforcer::{ChecksumEnforcer, Rejection};
pub use stream::{ChecksumCallback, ChecksumInputStream};
