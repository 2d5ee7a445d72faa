//! Property-based tests for the pair finder.
//!
//! These tests verify invariants that should hold regardless of input:
//! - Jaccard similarity is symmetric, bounded, and 1 on itself
//! - candidates are unique, ordered, and bounded by the bucket count
//! - documents with identical feature sets always become candidates
//! - signature agreement is an unbiased Jaccard estimate

use std::collections::HashSet;

use proptest::prelude::*;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use simpairs::{
    IncidenceIndex, PairFinder, PairFinderConfig, Representation, SignatureMatrix,
    SignatureMethod,
};

prop_compose! {
    /// Up to 12 documents over a universe of 40 features, each with 1..8 features.
    fn arb_pairs()(docs in prop::collection::vec(prop::collection::btree_set(0i64..40, 1..8), 2..12))
        -> Vec<(i64, i64)> {
        docs.iter()
            .enumerate()
            .flat_map(|(d, fs)| fs.iter().map(move |&f| (d as i64, f)))
            .collect()
    }
}

fn config(seed: u64, max_buckets: u64) -> PairFinderConfig {
    PairFinderConfig {
        sig_len: 12,
        n_bands: 4,
        max_buckets,
        seed,
        ..Default::default()
    }
}

mod similarity_props {
    use super::*;

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(64))]

        #[test]
        fn jaccard_symmetric_and_bounded(pairs in arb_pairs()) {
            let ix = IncidenceIndex::from_pairs(pairs, Representation::Sparse, 0).unwrap();
            let n = ix.n_docs() as u32;
            for a in 0..n {
                let own = simpairs::jaccard_similarity(&ix, a, a).unwrap();
                prop_assert_eq!(own, 1.0);
                for b in 0..n {
                    let ab = simpairs::jaccard_similarity(&ix, a, b).unwrap();
                    let ba = simpairs::jaccard_similarity(&ix, b, a).unwrap();
                    prop_assert_eq!(ab, ba);
                    prop_assert!((0.0..=1.0).contains(&ab), "out of range: {}", ab);
                }
            }
        }

        #[test]
        fn representations_agree(pairs in arb_pairs()) {
            let sparse = IncidenceIndex::from_pairs(pairs.clone(), Representation::Sparse, 0).unwrap();
            let dense = IncidenceIndex::from_pairs(pairs, Representation::Dense, 1 << 20).unwrap();
            let n = sparse.n_docs() as u32;
            for a in 0..n {
                for b in 0..n {
                    prop_assert_eq!(
                        simpairs::jaccard_similarity(&sparse, a, b).unwrap(),
                        simpairs::jaccard_similarity(&dense, a, b).unwrap()
                    );
                }
            }
        }
    }
}

mod candidate_props {
    use super::*;

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(64))]

        #[test]
        fn candidates_unique_ordered_and_bounded(
            pairs in arb_pairs(),
            seed in any::<u64>(),
            max_buckets in 1u64..64,
        ) {
            let finder = PairFinder::build(pairs, config(seed, max_buckets)).unwrap();
            let mut seen = HashSet::new();
            let mut count = 0u64;
            for p in finder.candidates() {
                prop_assert!(p.a < p.b, "unordered pair {:?}", p);
                prop_assert!((p.b as usize) < finder.n_docs());
                prop_assert!(seen.insert(p.ids()), "duplicate pair {:?}", p);
                prop_assert!((0.0..=1.0).contains(&p.estimated));
                count += 1;
            }
            prop_assert!(count <= finder.count_candidates());

            let mut lazy: Vec<_> = finder.candidates().collect();
            lazy.sort_by_key(|p| p.ids());
            prop_assert_eq!(lazy, finder.candidates_parallel().unwrap());
        }

        #[test]
        fn identical_sets_are_always_candidates(
            pairs in arb_pairs(),
            seed in any::<u64>(),
            method in prop_oneof![Just(SignatureMethod::MinHash), Just(SignatureMethod::Permutation)],
        ) {
            // Append a copy of document 0 as a new last document.
            let copy = pairs.iter().map(|&(d, _)| d).max().unwrap() + 1;
            let mut pairs = pairs;
            let extra: Vec<(i64, i64)> =
                pairs.iter().filter(|&&(d, _)| d == 0).map(|&(_, f)| (copy, f)).collect();
            pairs.extend(extra);

            let finder = PairFinder::build(pairs, config(seed, 1 << 32).with_method(method)).unwrap();
            let hit = finder.candidates().find(|p| p.ids() == (0, copy as u32));
            prop_assert!(hit.is_some());
            prop_assert_eq!(hit.unwrap().estimated, 1.0);
        }

        #[test]
        fn signatures_never_keep_the_sentinel(pairs in arb_pairs(), seed in any::<u64>()) {
            let ix = IncidenceIndex::from_pairs(pairs, Representation::Dense, 1 << 20).unwrap();
            for method in [SignatureMethod::MinHash, SignatureMethod::Permutation] {
                let sigs = SignatureMatrix::compute(&ix, 8, method, seed).unwrap();
                for d in 0..ix.n_docs() as u32 {
                    let has_features = ix.doc_len(d).unwrap() > 0;
                    prop_assert_eq!(sigs.is_defined(d), has_features);
                    if has_features {
                        prop_assert!(sigs.column(d).all(|v| v < sigs.sentinel()));
                    }
                }
            }
        }
    }
}

/// Two documents sharing 40 random features, with 40 private features each (J = 1/3).
fn third_overlap(rng: &mut StdRng, universe: i64) -> Vec<(i64, i64)> {
    let mut ids = HashSet::new();
    while ids.len() < 120 {
        ids.insert(rng.gen_range(0..universe));
    }
    let ids: Vec<i64> = ids.into_iter().collect();
    let mut pairs = Vec::new();
    for &f in &ids[..40] {
        pairs.push((0, f));
        pairs.push((1, f));
    }
    for &f in &ids[40..80] {
        pairs.push((0, f));
    }
    for &f in &ids[80..] {
        pairs.push((1, f));
    }
    pairs
}

fn mean_agreement(method: SignatureMethod, universe: i64, trials: u64) -> f64 {
    let mut rng = StdRng::seed_from_u64(2024);
    let mut total = 0.0;
    for seed in 0..trials {
        let pairs = third_overlap(&mut rng, universe);
        let repr = match method {
            SignatureMethod::MinHash => Representation::Sparse,
            SignatureMethod::Permutation => Representation::Dense,
        };
        let ix = IncidenceIndex::from_pairs(pairs, repr, 1 << 20).unwrap();
        let exact = simpairs::jaccard_similarity(&ix, 0, 1).unwrap();
        assert!((exact - 1.0 / 3.0).abs() < 1e-12);
        let sigs = SignatureMatrix::compute(&ix, 128, method, seed).unwrap();
        total += sigs.agreement(0, 1);
    }
    total / trials as f64
}

#[test]
fn minhash_estimate_is_unbiased() {
    let mean = mean_agreement(SignatureMethod::MinHash, 1_000_000, 100);
    assert!((mean - 1.0 / 3.0).abs() < 0.05, "mean agreement {mean}");
}

#[test]
fn permutation_estimate_is_unbiased() {
    let mean = mean_agreement(SignatureMethod::Permutation, 2_000, 50);
    assert!((mean - 1.0 / 3.0).abs() < 0.05, "mean agreement {mean}");
}
