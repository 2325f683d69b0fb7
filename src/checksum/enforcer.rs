//! Checksum Enforcement
//!
//! Decides whether calculated digests vouch for an artifact given the digests
//! a tier claimed for it. Trust requires at least one algorithm known to both
//! sides and agreement on every algorithm known to both sides.

use std::fmt;

use super::algorithm::Checksums;
use crate::error::{Error, Result};

/// Why a set of digests was not accepted
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Rejection {
    /// An algorithm present on both sides disagrees
    Mismatch {
        algorithm: String,
        expected: String,
        actual: String,
    },
    /// No algorithm is present on both sides
    NoCommonAlgorithm,
}

impl fmt::Display for Rejection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Rejection::Mismatch {
                algorithm,
                expected,
                actual,
            } => write!(
                f,
                "{} mismatch (expected {}, calculated {})",
                algorithm, expected, actual
            ),
            Rejection::NoCommonAlgorithm => write!(f, "no checksum algorithm in common"),
        }
    }
}

/// Expected-vs-calculated digest policy
#[derive(Debug, Clone, Copy, Default)]
pub struct ChecksumEnforcer;

impl ChecksumEnforcer {
    pub fn new() -> Self {
        Self
    }

    /// Compare digest maps, returning the algorithms that agreed
    ///
    /// Hex digests are compared case-insensitively.
    pub fn check(
        &self,
        expected: &Checksums,
        calculated: &Checksums,
    ) -> std::result::Result<Vec<String>, Rejection> {
        let mut agreed = Vec::new();
        for (algorithm, want) in expected {
            let Some(got) = calculated.get(algorithm) else {
                continue;
            };
            if !want.trim().eq_ignore_ascii_case(got.trim()) {
                return Err(Rejection::Mismatch {
                    algorithm: algorithm.clone(),
                    expected: want.clone(),
                    actual: got.clone(),
                });
            }
            agreed.push(algorithm.clone());
        }

        if agreed.is_empty() {
            return Err(Rejection::NoCommonAlgorithm);
        }
        Ok(agreed)
    }

    /// Like [`check`](Self::check), mapping a rejection to a hard error for `key`
    pub fn enforce(
        &self,
        key: &str,
        expected: &Checksums,
        calculated: &Checksums,
    ) -> Result<Vec<String>> {
        self.check(expected, calculated)
            .map_err(|rejection| Error::ChecksumMismatch {
                key: key.to_string(),
                reason: rejection.to_string(),
            })
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    fn sums(pairs: &[(&str, &str)]) -> Checksums {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_equal_maps_accept() {
        let a = sums(&[("SHA-1", "aa"), ("MD5", "bb")]);
        assert_eq!(
            ChecksumEnforcer.check(&a, &a).unwrap(),
            vec!["MD5".to_string(), "SHA-1".to_string()]
        );
    }

    #[test]
    fn test_calculated_superset_accepts() {
        let expected = sums(&[("SHA-1", "aa")]);
        let calculated = sums(&[("SHA-1", "aa"), ("SHA-256", "cc")]);
        assert!(ChecksumEnforcer.check(&expected, &calculated).is_ok());
    }

    #[test]
    fn test_calculated_subset_accepts() {
        let expected = sums(&[("SHA-1", "aa"), ("SHA-256", "cc")]);
        let calculated = sums(&[("SHA-1", "aa")]);
        assert!(ChecksumEnforcer.check(&expected, &calculated).is_ok());
    }

    #[test]
    fn test_disjoint_rejects() {
        let expected = sums(&[("SHA-1", "aa")]);
        let calculated = sums(&[("MD5", "aa")]);
        assert_eq!(
            ChecksumEnforcer.check(&expected, &calculated),
            Err(Rejection::NoCommonAlgorithm)
        );
        assert_eq!(
            ChecksumEnforcer.check(&Checksums::new(), &Checksums::new()),
            Err(Rejection::NoCommonAlgorithm)
        );
    }

    #[test]
    fn test_one_disagreement_rejects() {
        let expected = sums(&[("MD5", "bb"), ("SHA-1", "aa")]);
        let calculated = sums(&[("MD5", "bb"), ("SHA-1", "ff")]);
        assert_matches!(
            ChecksumEnforcer.check(&expected, &calculated),
            Err(Rejection::Mismatch { algorithm, .. }) if algorithm == "SHA-1"
        );
    }

    #[test]
    fn test_hex_case_and_whitespace_ignored() {
        let expected = sums(&[("SHA-1", "ABCDEF\n")]);
        let calculated = sums(&[("SHA-1", "abcdef")]);
        assert!(ChecksumEnforcer.check(&expected, &calculated).is_ok());
    }

    #[test]
    fn test_enforce_maps_to_error() {
        let expected = sums(&[("SHA-1", "aa")]);
        let calculated = sums(&[("SHA-1", "bb")]);
        let err = ChecksumEnforcer
            .enforce("central:org/x.jar", &expected, &calculated)
            .unwrap_err();
        assert_matches!(err, Error::ChecksumMismatch { ref key, .. } if key == "central:org/x.jar");
        assert!(err.to_string().contains("SHA-1 mismatch"));
    }
}
