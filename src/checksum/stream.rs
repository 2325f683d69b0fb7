//! Checksum Input Stream
//!
//! `Read` decorator that feeds every byte handed to its consumer into a set of
//! accumulators, and reports the digests when it is closed after being read
//! to the end.

use std::fmt;
use std::io::{self, Read};
use std::sync::Arc;

use super::algorithm::{ChecksumAlgorithm, ChecksumAlgorithmFactory, Checksums};

/// Receives the digests of a fully consumed stream
pub type ChecksumCallback = Box<dyn FnOnce(Checksums) + Send>;

/// Digesting reader
///
/// The callback runs on the thread that closes (or drops) the stream, exactly
/// once, and only if the inner reader reported end-of-stream.
pub struct ChecksumInputStream<R> {
    inner: R,
    algorithms: Vec<(String, Box<dyn ChecksumAlgorithm>)>,
    callback: Option<ChecksumCallback>,
    consumed: u64,
    exhausted: bool,
}

impl<R: Read> ChecksumInputStream<R> {
    /// Wrap `inner`, digesting with a fresh accumulator from each factory
    pub fn new(
        inner: R,
        factories: &[Arc<dyn ChecksumAlgorithmFactory>],
        callback: impl FnOnce(Checksums) + Send + 'static,
    ) -> Self {
        let algorithms = factories
            .iter()
            .map(|f| (f.name().to_string(), f.algorithm()))
            .collect();
        Self {
            inner,
            algorithms,
            callback: Some(Box::new(callback)),
            consumed: 0,
            exhausted: false,
        }
    }

    /// Bytes delivered to the consumer so far
    pub fn consumed(&self) -> u64 {
        self.consumed
    }

    /// Whether the inner reader has reported end-of-stream
    pub fn is_exhausted(&self) -> bool {
        self.exhausted
    }

    /// Close the stream, reporting digests if it was read to the end
    pub fn close(self) {
        drop(self);
    }
}

impl<R: Read> Read for ChecksumInputStream<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self.inner.read(buf)?;
        if n == 0 {
            if !buf.is_empty() {
                self.exhausted = true;
            }
            return Ok(0);
        }
        for (_, algorithm) in self.algorithms.iter_mut() {
            algorithm.update(&buf[..n]);
        }
        self.consumed += n as u64;
        Ok(n)
    }
}

impl<R> Drop for ChecksumInputStream<R> {
    fn drop(&mut self) {
        let Some(callback) = self.callback.take() else {
            return;
        };
        if self.exhausted {
            let checksums = self
                .algorithms
                .drain(..)
                .map(|(name, algorithm)| (name, algorithm.checksum()))
                .collect();
            callback(checksums);
        }
    }
}

impl<R> fmt::Debug for ChecksumInputStream<R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChecksumInputStream")
            .field(
                "algorithms",
                &self.algorithms.iter().map(|(n, _)| n).collect::<Vec<_>>(),
            )
            .field("consumed", &self.consumed)
            .field("exhausted", &self.exhausted)
            .finish()
    }
}

// =============================================================================
// Tests
// =============================================================================
