//! The assembled near-duplicate pair finder.
//!
//! ```rust
//! use simpairs::{PairFinder, PairFinderConfig};
//!
//! let pairs = vec![(0, 1), (0, 2), (0, 3), (1, 1), (1, 2), (1, 3), (2, 7), (2, 8)];
//! let config = PairFinderConfig {
//!     sig_len: 12,
//!     n_bands: 4,
//!     max_buckets: 1 << 20,
//!     ..Default::default()
//! };
//! let finder = PairFinder::build(pairs, config).unwrap();
//!
//! let found: Vec<(u32, u32)> = finder.candidates().map(|p| p.ids()).collect();
//! assert!(found.contains(&(0, 1)));
//! assert_eq!(finder.jaccard_similarity(0, 1).unwrap(), 1.0);
//! ```
//!
//! Callers that enforce a wall-clock budget can run the phases one by one
//! ([`IncidenceIndex::from_pairs`], [`SignatureMatrix::compute`], [`BandIndex::build`])
//! and assemble the result with [`PairFinder::from_parts`].

use std::time::Instant;

use tracing::info;

use crate::cache::{ArtifactCache, ArtifactKey, BandShape, DatasetId, NoCache, SignatureShape};
use crate::candidates::{collect_parallel, CandidatePair, Candidates};
use crate::config::PairFinderConfig;
use crate::error::{Error, Result};
use crate::incidence::IncidenceIndex;
use crate::lsh::{BandIndex, BucketStats};
use crate::minhash::SignatureMatrix;
use crate::similarity;

/// Incidence index, signatures and buckets for one dataset and configuration.
#[derive(Debug, Clone)]
pub struct PairFinder {
    config: PairFinderConfig,
    incidence: IncidenceIndex,
    signatures: SignatureMatrix,
    bands: BandIndex,
}

impl PairFinder {
    /// Run every phase on `pairs` without caching.
    pub fn build<I>(pairs: I, config: PairFinderConfig) -> Result<Self>
    where
        I: IntoIterator<Item = (i64, i64)>,
    {
        config.validate()?;
        let incidence =
            IncidenceIndex::from_pairs(pairs, config.representation(), config.dense_word_limit)?;
        Self::from_index(incidence, config)
    }

    /// Run the signature and banding phases on an existing index, without caching.
    pub fn from_index(incidence: IncidenceIndex, config: PairFinderConfig) -> Result<Self> {
        Self::from_index_cached(DatasetId(0), incidence, config, &mut NoCache)
    }

    /// Run every phase, fetching each artifact from `cache` when a valid entry exists.
    pub fn build_cached<C: ArtifactCache>(
        dataset: DatasetId,
        pairs: &[(i64, i64)],
        config: PairFinderConfig,
        cache: &mut C,
    ) -> Result<Self> {
        config.validate()?;
        let representation = config.representation();
        let incidence = cache.fetch_or_compute(
            &ArtifactKey::Incidence {
                dataset,
                representation,
            },
            &representation,
            || {
                IncidenceIndex::from_pairs(
                    pairs.iter().copied(),
                    representation,
                    config.dense_word_limit,
                )
            },
        )?;
        Self::from_index_cached(dataset, incidence, config, cache)
    }

    fn from_index_cached<C: ArtifactCache>(
        dataset: DatasetId,
        incidence: IncidenceIndex,
        config: PairFinderConfig,
        cache: &mut C,
    ) -> Result<Self> {
        config.validate()?;
        let start = Instant::now();
        let n_docs = incidence.n_docs();

        let signatures = cache.fetch_or_compute(
            &ArtifactKey::Signature {
                dataset,
                sig_len: config.sig_len,
                method: config.method,
                seed: config.seed,
            },
            &SignatureShape {
                sig_len: config.sig_len,
                n_docs,
                method: config.method,
            },
            || SignatureMatrix::compute(&incidence, config.sig_len, config.method, config.seed),
        )?;

        let bands = cache.fetch_or_compute(
            &ArtifactKey::Buckets {
                dataset,
                sig_len: config.sig_len,
                method: config.method,
                seed: config.seed,
                n_bands: config.n_bands,
                max_buckets: config.max_buckets,
            },
            &BandShape {
                n_bands: config.n_bands,
                rows_per_band: config.rows_per_band()?,
                max_buckets: config.max_buckets,
                n_docs,
            },
            || BandIndex::build(&signatures, config.n_bands, config.max_buckets),
        )?;

        let finder = Self::from_parts(config, incidence, signatures, bands)?;
        info!(
            n_docs,
            estimated_candidates = finder.count_candidates(),
            elapsed_ms = start.elapsed().as_millis() as u64,
            "pair finder ready"
        );
        Ok(finder)
    }

    /// Assemble separately built phases, checking that they fit together and match `config`.
    pub fn from_parts(
        config: PairFinderConfig,
        incidence: IncidenceIndex,
        signatures: SignatureMatrix,
        bands: BandIndex,
    ) -> Result<Self> {
        config.validate()?;
        if signatures.n_docs() != incidence.n_docs() {
            return Err(Error::DimensionMismatch {
                expected: incidence.n_docs(),
                got: signatures.n_docs(),
            });
        }
        if signatures.sig_len() != config.sig_len || signatures.method() != config.method {
            return Err(Error::Config(format!(
                "signatures ({} x {}) do not match the configuration ({} x {})",
                signatures.method(),
                signatures.sig_len(),
                config.method,
                config.sig_len
            )));
        }
        if bands.n_bands() != config.n_bands
            || bands.max_buckets() != config.max_buckets
            || bands.sig_len() != signatures.sig_len()
            || bands.n_docs() != signatures.n_docs()
        {
            return Err(Error::Config(format!(
                "buckets ({} bands, {} buckets) do not match the configuration ({} bands, {} buckets)",
                bands.n_bands(),
                bands.max_buckets(),
                config.n_bands,
                config.max_buckets
            )));
        }
        Ok(Self {
            config,
            incidence,
            signatures,
            bands,
        })
    }

    /// The configuration.
    pub fn config(&self) -> &PairFinderConfig {
        &self.config
    }

    /// The incidence index.
    pub fn incidence(&self) -> &IncidenceIndex {
        &self.incidence
    }

    /// The signature matrix.
    pub fn signatures(&self) -> &SignatureMatrix {
        &self.signatures
    }

    /// The bucket index.
    pub fn bands(&self) -> &BandIndex {
        &self.bands
    }

    /// Number of documents.
    pub fn n_docs(&self) -> usize {
        self.incidence.n_docs()
    }

    /// Lazily enumerate candidate pairs, each exactly once.
    pub fn candidates(&self) -> Candidates<'_> {
        Candidates::unchecked(&self.bands, &self.signatures)
    }

    /// All candidate pairs, discovered in parallel, sorted by `(a, b)`.
    pub fn candidates_parallel(&self) -> Result<Vec<CandidatePair>> {
        collect_parallel(&self.bands, &self.signatures)
    }

    /// Upper bound on the number of candidate pairs (`Σ C(|bucket|, 2)`).
    pub fn count_candidates(&self) -> u64 {
        self.bands.count_candidates()
    }

    /// Exact Jaccard similarity from the incidence index.
    pub fn jaccard_similarity(&self, a: u32, b: u32) -> Result<f64> {
        similarity::jaccard_similarity(&self.incidence, a, b)
    }

    /// Signature agreement of two documents.
    ///
    /// Follows [`Self::jaccard_similarity`] on empty documents: both empty is
    /// [`Error::UndefinedSimilarity`], one empty is `0`.
    pub fn estimated_similarity(&self, a: u32, b: u32) -> Result<f64> {
        self.signatures.estimate(a, b)
    }

    /// Documents sharing a bucket with `doc`.
    pub fn bucket_mates(&self, doc: u32) -> Result<Vec<u32>> {
        self.bands.bucket_mates(&self.signatures, doc)
    }

    /// Bucket utilization diagnostics.
    pub fn bucket_stats(&self) -> BucketStats {
        self.bands.stats()
    }
}
