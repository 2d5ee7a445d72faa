//! MinHash signatures for Jaccard similarity estimation.
//!
//! For every hash function (or permutation) `k` and document `d`,
//! `signature[k][d] = min_{f ∈ features(d)} h_k(f)`. The probability that two documents
//! agree at one position equals their Jaccard similarity \(J(A,B) = |A ∩ B| / |A ∪ B|\),
//! so the fraction of agreeing positions is an unbiased estimate of it.
//!
//! Two generators are available:
//!
//! - [`SignatureMethod::MinHash`]: affine functions `h_k(x) = (a_k·x + b_k) mod P`
//!   over the Mersenne prime `P = 2^61 − 1`.
//! - [`SignatureMethod::Permutation`]: explicit random permutations of the feature rows;
//!   the signature value is the lowest permuted rank. Needs feature rows, i.e. a dense
//!   [`IncidenceIndex`].
//!
//! Signature rows are computed in parallel. Every random draw happens up-front from one
//! seeded RNG, so results do not depend on thread scheduling.

use std::collections::HashSet;
use std::fmt;
use std::str::FromStr;
use std::time::Instant;

use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, RngCore, SeedableRng};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::{config, Error, Result};
use crate::incidence::IncidenceIndex;

/// Modulus of the affine hash family: the Mersenne prime `2^61 − 1`.
///
/// Larger than every `u32` feature id. Hash outputs lie in `[0, P)`, so `P` itself is
/// the sentinel for unset entries and can never be produced by a hash.
pub const MERSENNE_61: u64 = (1 << 61) - 1;

/// Signature algorithm.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SignatureMethod {
    /// Affine hash-family min-hashing.
    MinHash,
    /// Full row-permutation min-hashing.
    Permutation,
}

impl SignatureMethod {
    /// Short lowercase name, used in cache identifiers.
    pub fn as_str(&self) -> &'static str {
        match self {
            SignatureMethod::MinHash => "minhash",
            SignatureMethod::Permutation => "permutation",
        }
    }
}

impl fmt::Display for SignatureMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SignatureMethod {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "minhash" => Ok(SignatureMethod::MinHash),
            "permutation" => Ok(SignatureMethod::Permutation),
            other => Err(config(format!("unknown signature method `{other}`"))),
        }
    }
}

/// A family of `sig_len` affine hash functions modulo [`MERSENNE_61`].
#[derive(Debug, Clone)]
pub struct HashFamily {
    coefficients: Vec<(u64, u64)>,
}

impl HashFamily {
    /// Draw `sig_len` functions from a generator seeded with `seed`.
    ///
    /// The `a_k` are distinct and non-zero (so each `h_k` is a bijection on `[0, P)`);
    /// the `b_k` are distinct.
    pub fn with_seed(sig_len: usize, seed: u64) -> Self {
        let mut rng = StdRng::seed_from_u64(seed);
        let a = sample_distinct(&mut rng, sig_len, 1);
        let b = sample_distinct(&mut rng, sig_len, 0);
        Self {
            coefficients: a.into_iter().zip(b).collect(),
        }
    }

    /// Number of functions.
    pub fn len(&self) -> usize {
        self.coefficients.len()
    }

    /// True if the family is empty.
    pub fn is_empty(&self) -> bool {
        self.coefficients.is_empty()
    }

    /// `h_k(x)`.
    #[inline]
    pub fn hash(&self, k: usize, x: u32) -> u64 {
        let (a, b) = self.coefficients[k];
        ((a as u128 * x as u128 + b as u128) % MERSENNE_61 as u128) as u64
    }

    /// Signature column of an ad-hoc feature set (e.g. a query document).
    ///
    /// An empty set yields a column of sentinels.
    pub fn signature<I: IntoIterator<Item = u32>>(&self, features: I) -> Vec<u64> {
        let mut mins = vec![MERSENNE_61; self.len()];
        for f in features {
            for (k, slot) in mins.iter_mut().enumerate() {
                *slot = (*slot).min(self.hash(k, f));
            }
        }
        mins
    }
}

fn sample_distinct(rng: &mut StdRng, n: usize, low: u64) -> Vec<u64> {
    let mut seen = HashSet::with_capacity(n);
    let mut out = Vec::with_capacity(n);
    while out.len() < n {
        let v = rng.gen_range(low..MERSENNE_61);
        if seen.insert(v) {
            out.push(v);
        }
    }
    out
}

/// Ranks are enumerated as `u32`, so `n_features` itself must fit in `u32`.
fn rank_count(n_features: usize) -> Result<u32> {
    u32::try_from(n_features).map_err(|_| {
        config(format!(
            "{n_features} features cannot be permuted; the largest feature id must be below {}",
            u32::MAX
        ))
    })
}

/// `sig_len × n_docs` signature matrix, stored row-major.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignatureMatrix {
    sig_len: usize,
    n_docs: usize,
    method: SignatureMethod,
    sentinel: u64,
    values: Vec<u64>,
}

impl SignatureMatrix {
    /// Compute signatures for every document of `index`.
    pub fn compute(
        index: &IncidenceIndex,
        sig_len: usize,
        method: SignatureMethod,
        seed: u64,
    ) -> Result<Self> {
        if sig_len == 0 {
            return Err(config("sig_len must be >= 1"));
        }
        let start = Instant::now();
        let matrix = match method {
            SignatureMethod::MinHash => Self::compute_minhash(index, sig_len, seed),
            SignatureMethod::Permutation => Self::compute_permutation(index, sig_len, seed)?,
        };
        info!(
            sig_len,
            n_docs = matrix.n_docs,
            method = method.as_str(),
            elapsed_ms = start.elapsed().as_millis() as u64,
            "computed signature matrix"
        );
        Ok(matrix)
    }

    fn compute_minhash(index: &IncidenceIndex, sig_len: usize, seed: u64) -> Self {
        let n_docs = index.n_docs();
        let family = HashFamily::with_seed(sig_len, seed);
        let mut values = vec![MERSENNE_61; sig_len * n_docs];
        values
            .par_chunks_mut(n_docs)
            .enumerate()
            .for_each(|(k, row)| {
                index.for_each_incidence(|d, f| {
                    let slot = &mut row[d as usize];
                    *slot = (*slot).min(family.hash(k, f));
                });
                debug!(row = k, "signature row done");
            });
        Self {
            sig_len,
            n_docs,
            method: SignatureMethod::MinHash,
            sentinel: MERSENNE_61,
            values,
        }
    }

    fn compute_permutation(index: &IncidenceIndex, sig_len: usize, seed: u64) -> Result<Self> {
        let rows = index.feature_rows().ok_or_else(|| {
            config("permutation signatures need feature rows; use a dense incidence index")
        })?;
        let n_docs = index.n_docs();
        let n_features = index.n_features();
        let n_ranks = rank_count(n_features)?;
        let active = n_docs - index.empty_docs();
        let sentinel = n_features as u64;

        let mut rng = StdRng::seed_from_u64(seed);
        let row_seeds: Vec<u64> = (0..sig_len).map(|_| rng.next_u64()).collect();

        let mut values = vec![sentinel; sig_len * n_docs];
        values
            .par_chunks_mut(n_docs)
            .zip(row_seeds.par_iter())
            .enumerate()
            .for_each(|(k, (row, &row_seed))| {
                let mut order: Vec<u32> = (0..n_ranks).collect();
                order.shuffle(&mut StdRng::seed_from_u64(row_seed));
                let mut remaining = active;
                for (rank, &feature) in order.iter().enumerate() {
                    if remaining == 0 {
                        break;
                    }
                    for &d in rows.row(feature) {
                        let slot = &mut row[d as usize];
                        if *slot == sentinel {
                            *slot = rank as u64;
                            remaining -= 1;
                        }
                    }
                }
                debug!(row = k, "permutation row done");
            });

        Ok(Self {
            sig_len,
            n_docs,
            method: SignatureMethod::Permutation,
            sentinel,
            values,
        })
    }

    /// Internal invariants hold (used to vet deserialized matrices).
    pub(crate) fn is_consistent(&self) -> bool {
        self.sig_len > 0 && self.n_docs > 0 && self.values.len() == self.sig_len * self.n_docs
    }

    /// Signature length (number of rows).
    pub fn sig_len(&self) -> usize {
        self.sig_len
    }

    /// Number of documents (columns).
    pub fn n_docs(&self) -> usize {
        self.n_docs
    }

    /// Algorithm that produced the matrix.
    pub fn method(&self) -> SignatureMethod {
        self.method
    }

    /// Initial value of every entry; survives only in columns of empty documents.
    pub fn sentinel(&self) -> u64 {
        self.sentinel
    }

    /// `signature[k][doc]`.
    ///
    /// # Panics
    ///
    /// If `k >= sig_len` or `doc >= n_docs`.
    pub fn get(&self, k: usize, doc: u32) -> u64 {
        self.values[k * self.n_docs + doc as usize]
    }

    /// Row `k` across all documents.
    pub fn row(&self, k: usize) -> &[u64] {
        &self.values[k * self.n_docs..(k + 1) * self.n_docs]
    }

    /// Column of `doc` (its full signature).
    pub fn column(&self, doc: u32) -> impl Iterator<Item = u64> + '_ {
        (0..self.sig_len).map(move |k| self.get(k, doc))
    }

    /// Whether `doc` had at least one feature. Non-empty documents never keep the sentinel.
    pub fn is_defined(&self, doc: u32) -> bool {
        (doc as usize) < self.n_docs && self.get(0, doc) != self.sentinel
    }

    /// Estimated Jaccard similarity with checked ids.
    ///
    /// Two undefined columns (both documents empty) give
    /// [`Error::UndefinedSimilarity`]. One undefined column gives `0`, as the exact
    /// similarity of an empty and a non-empty set does.
    pub fn estimate(&self, a: u32, b: u32) -> Result<f64> {
        for doc in [a, b] {
            if doc as usize >= self.n_docs {
                return Err(Error::UnknownDocument {
                    doc,
                    n_docs: self.n_docs,
                });
            }
        }
        match (self.is_defined(a), self.is_defined(b)) {
            (true, true) => Ok(self.agreement(a, b)),
            (false, false) => Err(Error::UndefinedSimilarity { a, b }),
            _ => Ok(0.0),
        }
    }

    /// Fraction of positions where the two columns agree, without any checks.
    ///
    /// Columns of empty documents are all sentinels and agree with each other; use
    /// [`SignatureMatrix::estimate`] when either document may be empty.
    ///
    /// # Panics
    ///
    /// If either id is `>= n_docs`.
    pub fn agreement(&self, a: u32, b: u32) -> f64 {
        self.sig_len.saturating_sub(self.hamming_distance(a, b)) as f64 / self.sig_len as f64
    }

    /// Number of positions where the two columns differ.
    ///
    /// # Panics
    ///
    /// If either id is `>= n_docs`.
    pub fn hamming_distance(&self, a: u32, b: u32) -> usize {
        (0..self.sig_len)
            .filter(|&k| self.get(k, a) != self.get(k, b))
            .count()
    }
}
