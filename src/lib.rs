//! `simpairs`: near-duplicate pair discovery over sparse binary data.
//!
//! Input is a list of `(document, feature)` incidences. The crate finds document pairs
//! whose feature sets have high Jaccard similarity without comparing all pairs:
//! - MinHash signatures (affine hashing or row permutations)
//! - LSH banding into a bounded number of buckets
//! - deduplicated candidate enumeration, lazy or parallel
//! - exact Jaccard verification for confirming candidates
//!
//! Expensive artifacts (index, signatures, buckets) can be reused across runs through an
//! [`ArtifactCache`]. Thresholding policy and output formats beyond [`PairSink`] belong
//! to callers.

#![warn(missing_docs)]

pub mod cache;
pub mod candidates;
pub mod config;
pub mod error;
pub mod incidence;
pub mod lsh;
pub mod minhash;
pub mod pipeline;
pub mod similarity;
pub mod verify;

pub use cache::{ArtifactCache, ArtifactKey, DatasetId, DiskCache, MemoryCache, NoCache};
pub use candidates::{CandidatePair, Candidates};
pub use config::PairFinderConfig;
pub use error::{Error, Result};
pub use incidence::{IncidenceIndex, Representation};
pub use lsh::{BandIndex, BucketKey, BucketStats};
pub use minhash::{HashFamily, SignatureMatrix, SignatureMethod};
pub use pipeline::PairFinder;
pub use similarity::jaccard_similarity;
pub use verify::{find_similar_pairs, Evaluation, PairSink, WriteSink};
