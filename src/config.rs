//! Pipeline configuration.

use serde::{Deserialize, Serialize};

use crate::error::{config, Result};
use crate::incidence::Representation;
use crate::lsh;
use crate::minhash::SignatureMethod;

/// Configuration for [`crate::PairFinder`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PairFinderConfig {
    /// Signature length (number of hash functions or permutations).
    pub sig_len: usize,
    /// Number of bands; must divide `sig_len`.
    pub n_bands: usize,
    /// Bucket-id space per band.
    pub max_buckets: u64,
    /// Signature algorithm.
    pub method: SignatureMethod,
    /// Sparse (memory-efficient) or dense (faster set algebra) incidence index.
    pub use_sparse_index: bool,
    /// Seed for every random draw.
    pub seed: u64,
    /// Upper bound on the dense bitset, in 64-bit words.
    pub dense_word_limit: usize,
}

impl Default for PairFinderConfig {
    fn default() -> Self {
        Self {
            sig_len: 105,
            n_bands: 15,
            max_buckets: 100_000,
            method: SignatureMethod::MinHash,
            use_sparse_index: true,
            seed: 42,
            // 1 GiB of bits.
            dense_word_limit: 1 << 27,
        }
    }
}

impl PairFinderConfig {
    /// Create config optimized for high recall (short bands, many of them).
    pub fn high_recall() -> Self {
        Self {
            sig_len: 100,
            n_bands: 50,
            ..Default::default()
        }
    }

    /// Create config optimized for high precision (long bands, few of them).
    pub fn high_precision() -> Self {
        Self {
            sig_len: 80,
            n_bands: 10,
            ..Default::default()
        }
    }

    /// Derive banding parameters from any two of `sig_len`, `n_bands` and `rows_per_band`.
    ///
    /// With none given the defaults are used. A single parameter, or three inconsistent
    /// ones, is a configuration error.
    pub fn from_two_of(
        sig_len: Option<usize>,
        n_bands: Option<usize>,
        rows_per_band: Option<usize>,
    ) -> Result<Self> {
        let (sig_len, n_bands) = match (sig_len, n_bands, rows_per_band) {
            (None, None, None) => {
                let d = Self::default();
                (d.sig_len, d.n_bands)
            }
            (Some(s), Some(b), None) => (s, b),
            (Some(s), None, Some(r)) => {
                if r == 0 || s % r != 0 {
                    return Err(config(format!(
                        "sig_len ({s}) must be divisible by rows_per_band ({r})"
                    )));
                }
                (s, s / r)
            }
            (None, Some(b), Some(r)) => (
                r.checked_mul(b)
                    .ok_or_else(|| config("rows_per_band * n_bands overflows"))?,
                b,
            ),
            (Some(s), Some(b), Some(r)) => {
                if b.checked_mul(r) != Some(s) {
                    return Err(config(format!(
                        "sig_len ({s}) != n_bands ({b}) * rows_per_band ({r})"
                    )));
                }
                (s, b)
            }
            _ => {
                return Err(config(
                    "specify two of sig_len, n_bands and rows_per_band",
                ))
            }
        };
        let cfg = Self {
            sig_len,
            n_bands,
            ..Default::default()
        };
        cfg.validate()?;
        Ok(cfg)
    }

    /// Set the seed.
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    /// Set the signature method; the permutation method also switches to a dense index.
    pub fn with_method(mut self, method: SignatureMethod) -> Self {
        self.method = method;
        if method == SignatureMethod::Permutation {
            self.use_sparse_index = false;
        }
        self
    }

    /// Check every parameter rule.
    pub fn validate(&self) -> Result<()> {
        lsh::rows_per_band(self.sig_len, self.n_bands)?;
        if self.max_buckets == 0 {
            return Err(config("max_buckets must be >= 1"));
        }
        if self.method == SignatureMethod::Permutation && self.use_sparse_index {
            return Err(config(
                "the permutation method needs feature rows; set use_sparse_index = false",
            ));
        }
        Ok(())
    }

    /// `sig_len / n_bands`.
    pub fn rows_per_band(&self) -> Result<usize> {
        lsh::rows_per_band(self.sig_len, self.n_bands)
    }

    /// Incidence representation selected by `use_sparse_index`.
    pub fn representation(&self) -> Representation {
        if self.use_sparse_index {
            Representation::Sparse
        } else {
            Representation::Dense
        }
    }

    /// Probability that two documents with Jaccard similarity `s` become candidates.
    ///
    /// \(P(\text{candidate}) = 1 - (1 - s^r)^b\) with `r = sig_len / n_bands`, `b = n_bands`.
    pub fn candidate_probability(&self, s: f64) -> Result<f64> {
        Ok(lsh::candidate_probability(
            s,
            self.rows_per_band()?,
            self.n_bands,
        ))
    }
}
