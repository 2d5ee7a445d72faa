//! Banding-based LSH over a [`SignatureMatrix`].
//!
//! The signature rows are split into `n_bands` contiguous bands of `rows_per_band` rows.
//! Each document's band slice is hashed into one of `max_buckets` buckets of that band.
//! Two documents collide in a band whenever their slices are identical (AND within a band);
//! they become candidates if they collide in any band (OR across bands). For true
//! similarity `s` this happens with probability `1 − (1 − s^r)^b`.
//!
//! Every band owns its own bucket map, and [`band_hash`] folds the band index into its
//! input, so buckets of different bands never alias.

use std::collections::{BTreeMap, HashSet};
use std::hash::Hasher;
use std::time::Instant;

use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::{config, Error, Result};
use crate::minhash::SignatureMatrix;

/// Version of [`band_hash`]. Bump whenever bucket assignment changes.
pub const BAND_HASH_VERSION: u32 = 1;

/// A small stable 64-bit FNV-1a hasher.
///
/// This avoids relying on `std`'s `DefaultHasher` stability guarantees.
pub(crate) struct Fnv1a64 {
    state: u64,
}

impl Fnv1a64 {
    pub(crate) fn new() -> Self {
        // FNV offset basis
        Self {
            state: 0xcbf29ce484222325,
        }
    }
}

impl Hasher for Fnv1a64 {
    fn finish(&self) -> u64 {
        self.state
    }

    fn write(&mut self, bytes: &[u8]) {
        // FNV-1a
        const PRIME: u64 = 0x00000100000001B3;
        for &b in bytes {
            self.state ^= b as u64;
            self.state = self.state.wrapping_mul(PRIME);
        }
    }
}

/// SplitMix64 finalizer; spreads FNV's weak low bits before the modulo.
fn mix64(mut z: u64) -> u64 {
    z = z.wrapping_add(0x9E3779B97F4A7C15);
    z = (z ^ (z >> 30)).wrapping_mul(0xBF58476D1CE4E5B9);
    z = (z ^ (z >> 27)).wrapping_mul(0x94D049BB133111EB);
    z ^ (z >> 31)
}

/// Deterministic hash of one band slice (version [`BAND_HASH_VERSION`]).
///
/// FNV-1a over the little-endian bytes of `band` as `u64` followed by each value, then a
/// SplitMix64 finalizer. Portable across platforms and implementations.
pub fn band_hash(band: usize, values: &[u64]) -> u64 {
    let mut hasher = Fnv1a64::new();
    hasher.write(&(band as u64).to_le_bytes());
    for v in values {
        hasher.write(&v.to_le_bytes());
    }
    mix64(hasher.finish())
}

/// Identifies a bucket: band index plus bucket id within that band.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct BucketKey {
    /// Band index.
    pub band: u32,
    /// Bucket id in `[0, max_buckets)`.
    pub bucket: u64,
}

/// Bucket utilization diagnostics.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BucketStats {
    /// Non-empty buckets across all bands.
    pub used_buckets: usize,
    /// Non-empty buckets per band.
    pub used_per_band: Vec<usize>,
    /// Size of the largest bucket.
    pub largest_bucket: usize,
    /// Buckets holding a single document.
    pub singleton_buckets: usize,
    /// `Σ C(|bucket|, 2)`, see [`BandIndex::count_candidates`].
    pub estimated_candidates: u64,
}

/// Banded bucket index over a signature matrix.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BandIndex {
    n_bands: usize,
    rows_per_band: usize,
    max_buckets: u64,
    n_docs: usize,
    hash_version: u32,
    bands: Vec<BTreeMap<u64, Vec<u32>>>,
}

impl BandIndex {
    /// Bucket every defined document of `signatures`.
    ///
    /// `sig_len` must be divisible by `n_bands`. Bands are filled in parallel, each into
    /// its own map; documents inside a bucket are kept in ascending order.
    pub fn build(signatures: &SignatureMatrix, n_bands: usize, max_buckets: u64) -> Result<Self> {
        let rows_per_band = rows_per_band(signatures.sig_len(), n_bands)?;
        if max_buckets == 0 {
            return Err(config("max_buckets must be >= 1"));
        }
        let start = Instant::now();
        let n_docs = signatures.n_docs();
        let bands: Vec<BTreeMap<u64, Vec<u32>>> = (0..n_bands)
            .into_par_iter()
            .map(|band| {
                let mut buckets: BTreeMap<u64, Vec<u32>> = BTreeMap::new();
                let mut slice = vec![0u64; rows_per_band];
                for doc in 0..n_docs as u32 {
                    if !signatures.is_defined(doc) {
                        continue;
                    }
                    for (i, v) in slice.iter_mut().enumerate() {
                        *v = signatures.get(band * rows_per_band + i, doc);
                    }
                    let bucket = band_hash(band, &slice) % max_buckets;
                    buckets.entry(bucket).or_default().push(doc);
                }
                debug!(band, used = buckets.len(), "band filled");
                buckets
            })
            .collect();

        let index = Self {
            n_bands,
            rows_per_band,
            max_buckets,
            n_docs,
            hash_version: BAND_HASH_VERSION,
            bands,
        };
        info!(
            n_bands,
            rows_per_band,
            max_buckets,
            used_buckets = index.bands.iter().map(BTreeMap::len).sum::<usize>(),
            elapsed_ms = start.elapsed().as_millis() as u64,
            "filled buckets"
        );
        Ok(index)
    }

    /// Internal invariants hold (used to vet deserialized indexes).
    pub(crate) fn is_consistent(&self) -> bool {
        self.bands.len() == self.n_bands
            && self.bands.iter().all(|band| {
                band.iter().all(|(&bucket, docs)| {
                    bucket < self.max_buckets
                        && !docs.is_empty()
                        && docs.windows(2).all(|w| w[0] < w[1])
                        && docs.iter().all(|&d| (d as usize) < self.n_docs)
                })
            })
    }

    /// Number of bands.
    pub fn n_bands(&self) -> usize {
        self.n_bands
    }

    /// Signature rows per band.
    pub fn rows_per_band(&self) -> usize {
        self.rows_per_band
    }

    /// Bucket-id space per band.
    pub fn max_buckets(&self) -> u64 {
        self.max_buckets
    }

    /// Number of documents of the underlying signature matrix.
    pub fn n_docs(&self) -> usize {
        self.n_docs
    }

    /// Signature length covered by the bands.
    pub fn sig_len(&self) -> usize {
        self.n_bands * self.rows_per_band
    }

    /// [`band_hash`] version the buckets were built with.
    pub fn hash_version(&self) -> u32 {
        self.hash_version
    }

    /// Buckets of one band, keyed by bucket id.
    pub fn band(&self, band: usize) -> Option<&BTreeMap<u64, Vec<u32>>> {
        self.bands.get(band)
    }

    /// All non-empty buckets, band by band, in bucket-id order.
    pub fn buckets(&self) -> impl Iterator<Item = (BucketKey, &[u32])> + '_ {
        self.bands.iter().enumerate().flat_map(|(band, buckets)| {
            buckets.iter().map(move |(&bucket, docs)| {
                (
                    BucketKey {
                        band: band as u32,
                        bucket,
                    },
                    docs.as_slice(),
                )
            })
        })
    }

    /// Documents sharing at least one bucket with a signature column.
    ///
    /// Returns sorted ids.
    pub fn query(&self, column: &[u64]) -> Result<Vec<u32>> {
        if column.len() != self.sig_len() {
            return Err(Error::DimensionMismatch {
                expected: self.sig_len(),
                got: column.len(),
            });
        }
        let mut candidates: HashSet<u32> = HashSet::new();
        for (band_idx, chunk) in column.chunks(self.rows_per_band).enumerate() {
            let bucket = band_hash(band_idx, chunk) % self.max_buckets;
            if let Some(docs) = self.bands[band_idx].get(&bucket) {
                candidates.extend(docs.iter().copied());
            }
        }
        let mut v: Vec<u32> = candidates.into_iter().collect();
        v.sort_unstable();
        Ok(v)
    }

    /// Documents sharing at least one bucket with `doc`, excluding `doc` itself.
    pub fn bucket_mates(&self, signatures: &SignatureMatrix, doc: u32) -> Result<Vec<u32>> {
        if doc as usize >= signatures.n_docs() {
            return Err(Error::UnknownDocument {
                doc,
                n_docs: signatures.n_docs(),
            });
        }
        if !signatures.is_defined(doc) {
            return Ok(Vec::new());
        }
        let column: Vec<u64> = signatures.column(doc).collect();
        let mut mates = self.query(&column)?;
        mates.retain(|&d| d != doc);
        Ok(mates)
    }

    /// Cheap upper bound on the number of candidate pairs: `Σ C(|bucket|, 2)`.
    ///
    /// Pairs sharing several buckets are counted once per bucket, so this is never smaller
    /// than the deduplicated count produced by enumeration.
    pub fn count_candidates(&self) -> u64 {
        self.buckets()
            .map(|(_, docs)| {
                let n = docs.len() as u64;
                n * n.saturating_sub(1) / 2
            })
            .sum()
    }

    /// Bucket utilization diagnostics.
    pub fn stats(&self) -> BucketStats {
        let used_per_band: Vec<usize> = self.bands.iter().map(BTreeMap::len).collect();
        BucketStats {
            used_buckets: used_per_band.iter().sum(),
            used_per_band,
            largest_bucket: self.buckets().map(|(_, d)| d.len()).max().unwrap_or(0),
            singleton_buckets: self.buckets().filter(|(_, d)| d.len() == 1).count(),
            estimated_candidates: self.count_candidates(),
        }
    }

    /// Probability that two documents of Jaccard similarity `s` share a bucket
    /// (ignoring bucket-id collisions).
    pub fn candidate_probability(&self, s: f64) -> f64 {
        candidate_probability(s, self.rows_per_band, self.n_bands)
    }
}

/// `sig_len / n_bands`, or a configuration error if it is not a positive integer.
pub fn rows_per_band(sig_len: usize, n_bands: usize) -> Result<usize> {
    if sig_len == 0 || n_bands == 0 {
        return Err(config("sig_len and n_bands must be >= 1"));
    }
    if sig_len % n_bands != 0 {
        return Err(config(format!(
            "sig_len ({sig_len}) must be divisible by n_bands ({n_bands})"
        )));
    }
    Ok(sig_len / n_bands)
}

/// \(P(\text{candidate}) = 1 - (1 - s^r)^b\).
pub fn candidate_probability(s: f64, rows_per_band: usize, n_bands: usize) -> f64 {
    1.0 - (1.0 - s.powi(rows_per_band as i32)).powi(n_bands as i32)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::incidence::{IncidenceIndex, Representation};
    use crate::minhash::SignatureMethod;

    fn signatures(sig_len: usize) -> SignatureMatrix {
        let pairs = vec![
            (0, 1),
            (0, 2),
            (0, 3),
            (1, 1),
            (1, 2),
            (1, 3),
            (2, 1),
            (2, 2),
            (2, 4),
            (3, 9),
            (3, 10),
            (3, 11),
            (5, 4),
        ];
        let ix = IncidenceIndex::from_pairs(pairs, Representation::Sparse, 0).unwrap();
        SignatureMatrix::compute(&ix, sig_len, SignatureMethod::MinHash, 17).unwrap()
    }

    #[test]
    fn band_hash_is_stable() {
        assert_eq!(band_hash(0, &[1, 2, 3]), 0xe671a8c45f01d41b);
        assert_eq!(band_hash(1, &[1, 2, 3]), 0x90a18054904f6726);
        assert_eq!(band_hash(0, &[]), 0x5ba314b8cfda3b6b);
    }

    #[test]
    fn band_index_is_folded_into_hash() {
        assert_ne!(band_hash(0, &[7, 7]), band_hash(1, &[7, 7]));
    }

    #[test]
    fn non_divisible_bands_are_rejected() {
        let s = signatures(10);
        assert!(matches!(BandIndex::build(&s, 3, 100), Err(Error::Config(_))));
        assert!(matches!(BandIndex::build(&s, 0, 100), Err(Error::Config(_))));
        assert!(matches!(BandIndex::build(&s, 5, 0), Err(Error::Config(_))));
        assert_eq!(BandIndex::build(&s, 5, 100).unwrap().rows_per_band(), 2);
    }

    #[test]
    fn identical_documents_share_every_band() {
        let s = signatures(12);
        let ix = BandIndex::build(&s, 4, 1 << 32).unwrap();
        for band in 0..4 {
            let shared = ix
                .band(band)
                .unwrap()
                .values()
                .any(|docs| docs.contains(&0) && docs.contains(&1));
            assert!(shared, "band {band}");
        }
        assert!(ix.bucket_mates(&s, 0).unwrap().contains(&1));
    }

    #[test]
    fn empty_documents_are_not_bucketed() {
        let s = signatures(6);
        let ix = BandIndex::build(&s, 3, 1).unwrap();
        assert!(ix.buckets().all(|(_, docs)| !docs.contains(&4)));
        assert!(ix.bucket_mates(&s, 4).unwrap().is_empty());
        assert!(matches!(
            ix.bucket_mates(&s, 9),
            Err(Error::UnknownDocument { doc: 9, .. })
        ));
    }

    #[test]
    fn single_bucket_degrades_gracefully() {
        let s = signatures(6);
        let ix = BandIndex::build(&s, 3, 1).unwrap();
        // Five defined documents land in one bucket per band.
        assert_eq!(ix.stats().used_per_band, vec![1, 1, 1]);
        assert_eq!(ix.stats().largest_bucket, 5);
        assert_eq!(ix.count_candidates(), 3 * 10);
        assert_eq!(ix.bucket_mates(&s, 3).unwrap(), vec![0, 1, 2, 5]);
    }

    #[test]
    fn query_checks_dimension() {
        let s = signatures(6);
        let ix = BandIndex::build(&s, 3, 64).unwrap();
        assert!(matches!(
            ix.query(&[1, 2, 3]),
            Err(Error::DimensionMismatch {
                expected: 6,
                got: 3
            })
        ));
    }

    #[test]
    fn candidate_probability_curve() {
        assert_eq!(candidate_probability(0.0, 4, 5), 0.0);
        assert_eq!(candidate_probability(1.0, 4, 5), 1.0);
        let p = candidate_probability(0.5, 2, 3);
        assert!((p - (1.0 - 0.75f64.powi(3))).abs() < 1e-12);
        let s = signatures(6);
        let ix = BandIndex::build(&s, 3, 64).unwrap();
        assert_eq!(ix.candidate_probability(0.5), p);
    }
}
