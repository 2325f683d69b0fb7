//! Property-Based Tests for the Checksum Pipeline
//!
//! # Test Properties
//!
//! 1. **Chunk Invariance**: streamed digests equal direct digests for any read sizes
//! 2. **Enforcer Acceptance**: identical, superset and subset digest maps are accepted
//! 3. **Enforcer Rejection**: disjoint maps and any overlapping disagreement are rejected

#![cfg(test)]

use std::io::{Cursor, Read};
use std::sync::Arc;

use parking_lot::Mutex;
use proptest::prelude::*;

use super::algorithm::{calculate, ChecksumRegistry, Checksums};
use super::enforcer::{ChecksumEnforcer, Rejection};
use super::stream::ChecksumInputStream;

// =============================================================================
// Property Strategies
// =============================================================================

fn data_strategy() -> impl Strategy<Value = Vec<u8>> {
    prop::collection::vec(any::<u8>(), 0..4096)
}

/// Read sizes cycled through while draining a stream
fn chunk_strategy() -> impl Strategy<Value = Vec<usize>> {
    prop::collection::vec(1usize..300, 1..16)
}

/// Subset of the registered algorithm names (by index bitmask)
fn algorithm_mask_strategy() -> impl Strategy<Value = u8> {
    1u8..16
}

fn names_for(mask: u8) -> Vec<String> {
    ChecksumRegistry::default()
        .names()
        .into_iter()
        .enumerate()
        .filter(|(i, _)| mask & (1 << i) != 0)
        .map(|(_, n)| n.to_string())
        .collect()
}

/// Digest maps keyed by algorithm names drawn from `names`
fn digest_map_strategy(
    names: &'static str,
    size: std::ops::Range<usize>,
) -> impl Strategy<Value = Checksums> {
    prop::collection::btree_map(names, "[0-9a-f]{4}", size)
}

// =============================================================================
// Streaming Properties
// =============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    /// Property: digests reported on close equal direct digests, whatever the read sizes.
    #[test]
    fn prop_stream_matches_direct(
        data in data_strategy(),
        chunks in chunk_strategy(),
        mask in algorithm_mask_strategy(),
        drain_tail in any::<bool>(),
    ) {
        let registry = ChecksumRegistry::default();
        let factories = registry.select(&names_for(mask))?;

        let seen = Arc::new(Mutex::new(None));
        let sink = seen.clone();
        let mut stream = ChecksumInputStream::new(Cursor::new(data.clone()), &factories, move |sums| {
            *sink.lock() = Some(sums);
        });

        let mut received = Vec::new();
        let mut i = 0;
        loop {
            if drain_tail && received.len() > data.len() / 2 {
                stream.read_to_end(&mut received)?;
                break;
            }
            let mut buf = vec![0u8; chunks[i % chunks.len()]];
            let n = stream.read(&mut buf)?;
            if n == 0 {
                break;
            }
            received.extend_from_slice(&buf[..n]);
            i += 1;
        }
        stream.close();

        prop_assert_eq!(&received, &data);
        let reported = seen.lock().take();
        prop_assert_eq!(reported, Some(calculate(&data, &factories)));
    }
}

// =============================================================================
// Enforcer Properties
// =============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(128))]

    /// Property: a non-empty map is always accepted against itself and its supersets.
    #[test]
    fn prop_superset_accepts(
        expected in digest_map_strategy("[A-D]", 1..4),
        extra in digest_map_strategy("[A-F]", 0..4),
    ) {
        let mut calculated = extra;
        calculated.extend(expected.clone());

        prop_assert!(ChecksumEnforcer.check(&expected, &calculated).is_ok());
        prop_assert!(ChecksumEnforcer.check(&calculated, &expected).is_ok());
    }

    /// Property: disjoint maps never verify.
    #[test]
    fn prop_disjoint_rejects(
        expected in digest_map_strategy("[A-C]", 0..3),
        calculated in digest_map_strategy("[D-F]", 0..3),
    ) {
        prop_assert_eq!(
            ChecksumEnforcer.check(&expected, &calculated),
            Err(Rejection::NoCommonAlgorithm)
        );
    }

    /// Property: corrupting any shared digest is detected.
    #[test]
    fn prop_disagreement_rejects(
        expected in digest_map_strategy("[A-D]", 1..4),
        pick in any::<prop::sample::Index>(),
    ) {
        let mut calculated = expected.clone();
        let victim = pick.get(&expected.keys().cloned().collect::<Vec<_>>()).clone();
        calculated.insert(victim.clone(), "corrupt".to_string());

        let is_mismatch = matches!(
            ChecksumEnforcer.check(&expected, &calculated),
            Err(Rejection::Mismatch { ref algorithm, .. }) if *algorithm == victim
        );
        prop_assert!(is_mismatch);
    }
}
