//! Candidate-pair enumeration over a [`BandIndex`].
//!
//! Every unordered pair of documents sharing a bucket is reported exactly once per
//! enumeration, normalized to `(min_id, max_id)`, together with its estimated
//! similarity over the *full* signature (not only the band that produced it).

use std::collections::{btree_map, HashSet};

use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{Error, Result};
use crate::lsh::BandIndex;
use crate::minhash::SignatureMatrix;

/// An unordered candidate pair with `a < b`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CandidatePair {
    /// Smaller document id.
    pub a: u32,
    /// Larger document id.
    pub b: u32,
    /// Fraction of signature positions where `a` and `b` agree.
    pub estimated: f64,
}

impl CandidatePair {
    /// `(a, b)`.
    pub fn ids(&self) -> (u32, u32) {
        (self.a, self.b)
    }
}

/// Lazy, deduplicating walk over every bucket of a [`BandIndex`].
///
/// The seen-pairs set lives in the iterator, so it is scoped to one enumeration.
#[derive(Debug)]
pub struct Candidates<'a> {
    bands: &'a BandIndex,
    signatures: &'a SignatureMatrix,
    next_band: usize,
    buckets: Option<btree_map::Values<'a, u64, Vec<u32>>>,
    members: &'a [u32],
    i: usize,
    j: usize,
    seen: HashSet<(u32, u32)>,
}

impl<'a> Candidates<'a> {
    /// Start an enumeration. `bands` must have been built from `signatures`.
    pub fn new(bands: &'a BandIndex, signatures: &'a SignatureMatrix) -> Result<Self> {
        check_shapes(bands, signatures)?;
        Ok(Self::unchecked(bands, signatures))
    }

    pub(crate) fn unchecked(bands: &'a BandIndex, signatures: &'a SignatureMatrix) -> Self {
        Self {
            bands,
            signatures,
            next_band: 0,
            buckets: None,
            members: &[],
            i: 0,
            j: 1,
            seen: HashSet::new(),
        }
    }

    /// Number of distinct pairs emitted so far.
    pub fn emitted(&self) -> usize {
        self.seen.len()
    }

    fn advance_bucket(&mut self) -> bool {
        loop {
            if let Some(values) = &mut self.buckets {
                if let Some(docs) = values.next() {
                    self.members = docs.as_slice();
                    self.i = 0;
                    self.j = 1;
                    return true;
                }
            }
            if self.next_band >= self.bands.n_bands() {
                return false;
            }
            self.buckets = self.bands.band(self.next_band).map(|m| m.values());
            self.next_band += 1;
        }
    }
}

impl Iterator for Candidates<'_> {
    type Item = CandidatePair;

    fn next(&mut self) -> Option<CandidatePair> {
        loop {
            while self.i < self.members.len() {
                if self.j < self.members.len() {
                    let (x, y) = (self.members[self.i], self.members[self.j]);
                    self.j += 1;
                    let (a, b) = (x.min(y), x.max(y));
                    if a != b && self.seen.insert((a, b)) {
                        return Some(CandidatePair {
                            a,
                            b,
                            estimated: self.signatures.agreement(a, b),
                        });
                    }
                } else {
                    self.i += 1;
                    self.j = self.i + 1;
                }
            }
            if !self.advance_bucket() {
                debug!(pairs = self.seen.len(), "candidate enumeration finished");
                return None;
            }
        }
    }
}

/// Parallel enumeration: discover pairs per band, then merge and deduplicate.
///
/// Yields the same pairs as [`Candidates`], sorted by `(a, b)`.
pub fn collect_parallel(
    bands: &BandIndex,
    signatures: &SignatureMatrix,
) -> Result<Vec<CandidatePair>> {
    check_shapes(bands, signatures)?;
    let shards: Vec<HashSet<(u32, u32)>> = (0..bands.n_bands())
        .into_par_iter()
        .map(|band| {
            let mut local = HashSet::new();
            for docs in bands.band(band).into_iter().flat_map(|m| m.values()) {
                for (i, &x) in docs.iter().enumerate() {
                    for &y in &docs[i + 1..] {
                        if x != y {
                            local.insert((x.min(y), x.max(y)));
                        }
                    }
                }
            }
            local
        })
        .collect();

    let mut merged: HashSet<(u32, u32)> = HashSet::new();
    for shard in shards {
        merged.extend(shard);
    }
    let mut pairs: Vec<(u32, u32)> = merged.into_iter().collect();
    pairs.sort_unstable();
    Ok(pairs
        .into_par_iter()
        .map(|(a, b)| CandidatePair {
            a,
            b,
            estimated: signatures.agreement(a, b),
        })
        .collect())
}

fn check_shapes(bands: &BandIndex, signatures: &SignatureMatrix) -> Result<()> {
    if bands.sig_len() != signatures.sig_len() {
        return Err(Error::DimensionMismatch {
            expected: signatures.sig_len(),
            got: bands.sig_len(),
        });
    }
    if bands.n_docs() != signatures.n_docs() {
        return Err(Error::DimensionMismatch {
            expected: signatures.n_docs(),
            got: bands.n_docs(),
        });
    }
    Ok(())
}
