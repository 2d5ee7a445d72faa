//! Memoization of the expensive pipeline artifacts.
//!
//! Each stage of [`crate::PairFinder`] is wrapped in [`ArtifactCache::fetch_or_compute`]:
//! the cache either returns a stored artifact that passes validation against the requested
//! configuration, or runs the stage and stores its output.
//!
//! # Stored format
//!
//! ```text
//! ┌──────────────────────────────────────┐
//! │ magic "SPAC" │ format version (u32)  │
//! │ artifact kind │ key identifier       │
//! │ payload (postcard)                   │
//! └──────────────────────────────────────┘
//! ```
//!
//! The key identifier embeds every parameter that shapes the artifact, so entries for
//! different configurations never share a slot. A stored entry that fails to decode, was
//! written for another key or version, or does not match the expected shape is discarded
//! and recomputed ([`Error::CacheMismatch`] is logged, never returned).

use std::collections::HashMap;
use std::fs::{self, File};
use std::hash::Hasher;
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::incidence::{IncidenceIndex, Representation};
use crate::lsh::{BandIndex, Fnv1a64, BAND_HASH_VERSION};
use crate::minhash::{SignatureMatrix, SignatureMethod};

/// Magic bytes of a stored artifact.
pub const CACHE_MAGIC: [u8; 4] = *b"SPAC";

/// Current stored-artifact format version.
pub const CACHE_FORMAT_VERSION: u32 = 1;

/// Identity of an input dataset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DatasetId(pub u64);

impl DatasetId {
    /// Fingerprint of the raw `(document, feature)` pairs, in input order.
    pub fn of_pairs(pairs: &[(i64, i64)]) -> Self {
        let mut hasher = Fnv1a64::new();
        for &(d, f) in pairs {
            hasher.write(&d.to_le_bytes());
            hasher.write(&f.to_le_bytes());
        }
        Self(hasher.finish())
    }

    /// Identity derived from a caller-chosen name (e.g. a file path).
    pub fn named(name: &str) -> Self {
        let mut hasher = Fnv1a64::new();
        hasher.write(name.as_bytes());
        Self(hasher.finish())
    }
}

/// Cache key of one artifact.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ArtifactKey {
    /// The incidence index of a dataset.
    Incidence {
        /// Dataset identity.
        dataset: DatasetId,
        /// Backing representation.
        representation: Representation,
    },
    /// A signature matrix.
    Signature {
        /// Dataset identity.
        dataset: DatasetId,
        /// Signature length.
        sig_len: usize,
        /// Signature algorithm.
        method: SignatureMethod,
        /// Seed of the random draws.
        seed: u64,
    },
    /// A bucket index built from a signature matrix.
    Buckets {
        /// Dataset identity.
        dataset: DatasetId,
        /// Signature length.
        sig_len: usize,
        /// Signature algorithm.
        method: SignatureMethod,
        /// Seed of the random draws.
        seed: u64,
        /// Number of bands.
        n_bands: usize,
        /// Bucket-id space per band.
        max_buckets: u64,
    },
}

impl ArtifactKey {
    /// File-name-safe identifier embedding every parameter of the key.
    pub fn id(&self) -> String {
        match self {
            ArtifactKey::Incidence {
                dataset,
                representation,
            } => format!("incidence-{:016x}-{}", dataset.0, representation.as_str()),
            ArtifactKey::Signature {
                dataset,
                sig_len,
                method,
                seed,
            } => format!("signature-{:016x}-{method}-s{sig_len}-seed{seed}", dataset.0),
            ArtifactKey::Buckets {
                dataset,
                sig_len,
                method,
                seed,
                n_bands,
                max_buckets,
            } => format!(
                "buckets-{:016x}-{method}-s{sig_len}-seed{seed}-b{n_bands}-m{max_buckets}-h{BAND_HASH_VERSION}",
                dataset.0
            ),
        }
    }
}

/// A cacheable pipeline artifact.
pub trait Artifact: Serialize + DeserializeOwned {
    /// Kind tag stored alongside the payload.
    const KIND: &'static str;
    /// What the requested configuration expects the artifact to look like.
    type Expect;
    /// Check a fetched artifact against the expected shape.
    fn validate(&self, expect: &Self::Expect) -> std::result::Result<(), String>;
}

impl Artifact for IncidenceIndex {
    const KIND: &'static str = "incidence";
    type Expect = Representation;

    fn validate(&self, expect: &Representation) -> std::result::Result<(), String> {
        if self.representation() != *expect {
            return Err(format!(
                "representation {} != {}",
                self.representation().as_str(),
                expect.as_str()
            ));
        }
        if self.n_docs() == 0 || self.nnz() == 0 || !self.is_consistent() {
            return Err("inconsistent incidence index".into());
        }
        Ok(())
    }
}

/// Expected shape of a [`SignatureMatrix`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SignatureShape {
    /// Signature length.
    pub sig_len: usize,
    /// Number of documents.
    pub n_docs: usize,
    /// Signature algorithm.
    pub method: SignatureMethod,
}

impl Artifact for SignatureMatrix {
    const KIND: &'static str = "signature";
    type Expect = SignatureShape;

    fn validate(&self, expect: &SignatureShape) -> std::result::Result<(), String> {
        let got = SignatureShape {
            sig_len: self.sig_len(),
            n_docs: self.n_docs(),
            method: self.method(),
        };
        if got != *expect {
            return Err(format!("shape {got:?} != {expect:?}"));
        }
        if !self.is_consistent() {
            return Err("inconsistent signature matrix".into());
        }
        Ok(())
    }
}

/// Expected shape of a [`BandIndex`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BandShape {
    /// Number of bands.
    pub n_bands: usize,
    /// Rows per band.
    pub rows_per_band: usize,
    /// Bucket-id space per band.
    pub max_buckets: u64,
    /// Number of documents.
    pub n_docs: usize,
}

impl Artifact for BandIndex {
    const KIND: &'static str = "buckets";
    type Expect = BandShape;

    fn validate(&self, expect: &BandShape) -> std::result::Result<(), String> {
        if self.hash_version() != BAND_HASH_VERSION {
            return Err(format!(
                "band hash version {} != {BAND_HASH_VERSION}",
                self.hash_version()
            ));
        }
        let got = BandShape {
            n_bands: self.n_bands(),
            rows_per_band: self.rows_per_band(),
            max_buckets: self.max_buckets(),
            n_docs: self.n_docs(),
        };
        if got != *expect {
            return Err(format!("shape {got:?} != {expect:?}"));
        }
        if !self.is_consistent() {
            return Err("inconsistent bucket index".into());
        }
        Ok(())
    }
}

#[derive(Serialize, Deserialize)]
struct Envelope {
    magic: [u8; 4],
    version: u32,
    kind: String,
    key: String,
    payload: Vec<u8>,
}

fn encode<A: Artifact>(id: &str, artifact: &A) -> Result<Vec<u8>> {
    let envelope = Envelope {
        magic: CACHE_MAGIC,
        version: CACHE_FORMAT_VERSION,
        kind: A::KIND.to_string(),
        key: id.to_string(),
        payload: postcard::to_stdvec(artifact)?,
    };
    Ok(postcard::to_stdvec(&envelope)?)
}

fn decode<A: Artifact>(id: &str, bytes: &[u8], expect: &A::Expect) -> Result<A> {
    let mismatch = |reason: String| Error::CacheMismatch {
        key: id.to_string(),
        reason,
    };
    let envelope: Envelope =
        postcard::from_bytes(bytes).map_err(|e| mismatch(format!("undecodable entry: {e}")))?;
    if envelope.magic != CACHE_MAGIC {
        return Err(mismatch("bad magic".into()));
    }
    if envelope.version != CACHE_FORMAT_VERSION {
        return Err(mismatch(format!("format version {}", envelope.version)));
    }
    if envelope.kind != A::KIND || envelope.key != id {
        return Err(mismatch(format!(
            "entry holds {} `{}`",
            envelope.kind, envelope.key
        )));
    }
    let artifact: A = postcard::from_bytes(&envelope.payload)
        .map_err(|e| mismatch(format!("undecodable payload: {e}")))?;
    artifact.validate(expect).map_err(mismatch)?;
    Ok(artifact)
}

/// Storage backend for pipeline artifacts.
pub trait ArtifactCache {
    /// Raw bytes stored under `id`, if any. Errors are treated as a miss.
    fn load(&mut self, id: &str) -> Result<Option<Vec<u8>>>;

    /// Store raw bytes under `id`, replacing any previous entry.
    fn store(&mut self, id: &str, bytes: &[u8]) -> Result<()>;

    /// Return the stored artifact for `key` if it validates against `expect`; otherwise run
    /// `compute`, store the result, and return it.
    ///
    /// Only errors from `compute` and failures to persist are returned.
    fn fetch_or_compute<A, F>(&mut self, key: &ArtifactKey, expect: &A::Expect, compute: F) -> Result<A>
    where
        A: Artifact,
        F: FnOnce() -> Result<A>,
    {
        let id = key.id();
        match self.load(&id) {
            Ok(Some(bytes)) => match decode::<A>(&id, &bytes, expect) {
                Ok(artifact) => {
                    debug!(key = %id, "cache hit");
                    return Ok(artifact);
                }
                Err(e) => warn!(error = %e, "discarding cached artifact"),
            },
            Ok(None) => debug!(key = %id, "cache miss"),
            Err(e) => warn!(key = %id, error = %e, "cache read failed, recomputing"),
        }
        let artifact = compute()?;
        self.store(&id, &encode(&id, &artifact)?)?;
        Ok(artifact)
    }
}

/// A cache that never stores anything.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoCache;

impl ArtifactCache for NoCache {
    fn load(&mut self, _id: &str) -> Result<Option<Vec<u8>>> {
        Ok(None)
    }

    fn store(&mut self, _id: &str, _bytes: &[u8]) -> Result<()> {
        Ok(())
    }

    fn fetch_or_compute<A, F>(&mut self, _key: &ArtifactKey, _expect: &A::Expect, compute: F) -> Result<A>
    where
        A: Artifact,
        F: FnOnce() -> Result<A>,
    {
        compute()
    }
}

/// In-process cache of encoded artifacts.
#[derive(Debug, Clone, Default)]
pub struct MemoryCache {
    entries: HashMap<String, Vec<u8>>,
}

impl MemoryCache {
    /// Empty cache.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored entries.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// True if nothing is stored.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Stored identifiers.
    pub fn ids(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(String::as_str)
    }
}

impl ArtifactCache for MemoryCache {
    fn load(&mut self, id: &str) -> Result<Option<Vec<u8>>> {
        Ok(self.entries.get(id).cloned())
    }

    fn store(&mut self, id: &str, bytes: &[u8]) -> Result<()> {
        self.entries.insert(id.to_string(), bytes.to_vec());
        Ok(())
    }
}

/// One file per artifact inside a directory.
#[derive(Debug, Clone)]
pub struct DiskCache {
    dir: PathBuf,
}

impl DiskCache {
    /// Use (and create if needed) `dir`.
    pub fn new(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    /// Cache directory.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// File holding the artifact stored under `id`.
    pub fn path_for(&self, id: &str) -> PathBuf {
        self.dir.join(format!("{id}.bin"))
    }
}

impl ArtifactCache for DiskCache {
    fn load(&mut self, id: &str) -> Result<Option<Vec<u8>>> {
        let mut file = match File::open(self.path_for(id)) {
            Ok(f) => f,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let mut bytes = Vec::new();
        file.read_to_end(&mut bytes)?;
        Ok(Some(bytes))
    }

    fn store(&mut self, id: &str, bytes: &[u8]) -> Result<()> {
        let path = self.path_for(id);
        let tmp = self.dir.join(format!("{id}.bin.tmp"));
        let written = File::create(&tmp)
            .and_then(|mut file| {
                file.write_all(bytes)?;
                file.sync_all()
            })
            .and_then(|()| fs::rename(&tmp, &path));
        if let Err(e) = written {
            // The partial file must not outlive the failed store.
            let _ = fs::remove_file(&tmp);
            return Err(e.into());
        }
        debug!(path = %path.display(), bytes = bytes.len(), "stored artifact");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    fn index() -> IncidenceIndex {
        IncidenceIndex::from_pairs(
            vec![(0, 1), (0, 2), (1, 2), (2, 5)],
            Representation::Sparse,
            0,
        )
        .unwrap()
    }

    fn sig_key(sig_len: usize) -> ArtifactKey {
        ArtifactKey::Signature {
            dataset: DatasetId(7),
            sig_len,
            method: SignatureMethod::MinHash,
            seed: 1,
        }
    }

    fn shape(sig_len: usize) -> SignatureShape {
        SignatureShape {
            sig_len,
            n_docs: 3,
            method: SignatureMethod::MinHash,
        }
    }

    #[test]
    fn ids_embed_every_parameter() {
        let a = ArtifactKey::Buckets {
            dataset: DatasetId(1),
            sig_len: 20,
            method: SignatureMethod::MinHash,
            seed: 3,
            n_bands: 5,
            max_buckets: 100,
        };
        let id = a.id();
        for part in ["minhash", "s20", "seed3", "b5", "m100", "h1"] {
            assert!(id.contains(part), "{id} lacks {part}");
        }
        assert_ne!(sig_key(20).id(), sig_key(21).id());
        assert_ne!(
            DatasetId::of_pairs(&[(0, 1), (1, 0)]),
            DatasetId::of_pairs(&[(1, 0), (0, 1)])
        );
    }

    #[test]
    fn memory_cache_hits_after_first_compute() {
        let ix = index();
        let mut cache = MemoryCache::new();
        let calls = Cell::new(0);
        let compute = || {
            calls.set(calls.get() + 1);
            SignatureMatrix::compute(&ix, 8, SignatureMethod::MinHash, 1)
        };
        let a: SignatureMatrix = cache.fetch_or_compute(&sig_key(8), &shape(8), compute).unwrap();
        let b: SignatureMatrix = cache.fetch_or_compute(&sig_key(8), &shape(8), compute).unwrap();
        assert_eq!(a, b);
        assert_eq!(calls.get(), 1);
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn shape_mismatch_forces_recompute() {
        let ix = index();
        let mut cache = MemoryCache::new();
        // An entry stored under the right id but holding a matrix of another length.
        let wrong = SignatureMatrix::compute(&ix, 4, SignatureMethod::MinHash, 1).unwrap();
        let id = sig_key(8).id();
        cache.store(&id, &encode(&id, &wrong).unwrap()).unwrap();

        let calls = Cell::new(0);
        let got: SignatureMatrix = cache
            .fetch_or_compute(&sig_key(8), &shape(8), || {
                calls.set(calls.get() + 1);
                SignatureMatrix::compute(&ix, 8, SignatureMethod::MinHash, 1)
            })
            .unwrap();
        assert_eq!(calls.get(), 1);
        assert_eq!(got.sig_len(), 8);
        // The bad entry was replaced.
        let bytes = cache.load(&id).unwrap().unwrap();
        assert!(decode::<SignatureMatrix>(&id, &bytes, &shape(8)).is_ok());
    }

    #[test]
    fn decode_reports_mismatches() {
        let ix = index();
        let id = sig_key(8).id();
        let sig = SignatureMatrix::compute(&ix, 8, SignatureMethod::MinHash, 1).unwrap();
        let bytes = encode(&id, &sig).unwrap();
        assert!(matches!(
            decode::<SignatureMatrix>(&sig_key(9).id(), &bytes, &shape(8)),
            Err(Error::CacheMismatch { .. })
        ));
        assert!(matches!(
            decode::<SignatureMatrix>(&id, b"garbage", &shape(8)),
            Err(Error::CacheMismatch { .. })
        ));
        assert!(matches!(
            decode::<IncidenceIndex>(&id, &bytes, &Representation::Sparse),
            Err(Error::CacheMismatch { .. })
        ));
    }

    #[test]
    fn incidence_representation_is_validated() {
        let ix = index();
        assert!(ix.validate(&Representation::Sparse).is_ok());
        assert!(ix.validate(&Representation::Dense).is_err());
    }

    #[test]
    fn disk_cache_round_trip_and_corruption() {
        let dir = tempfile::tempdir().unwrap();
        let mut cache = DiskCache::new(dir.path().join("nested")).unwrap();
        let ix = index();
        let key = ArtifactKey::Incidence {
            dataset: DatasetId(3),
            representation: Representation::Sparse,
        };
        let calls = Cell::new(0);
        let compute = || {
            calls.set(calls.get() + 1);
            Ok(ix.clone())
        };
        let _: IncidenceIndex = cache
            .fetch_or_compute(&key, &Representation::Sparse, compute)
            .unwrap();
        let path = cache.path_for(&key.id());
        assert!(path.exists());
        let again: IncidenceIndex = cache
            .fetch_or_compute(&key, &Representation::Sparse, compute)
            .unwrap();
        assert_eq!(again, ix);
        assert_eq!(calls.get(), 1);

        fs::write(&path, b"not an artifact").unwrap();
        let fixed: IncidenceIndex = cache
            .fetch_or_compute(&key, &Representation::Sparse, compute)
            .unwrap();
        assert_eq!(fixed, ix);
        assert_eq!(calls.get(), 2);
    }

    #[test]
    fn failed_disk_store_leaves_no_partial_file() {
        let dir = tempfile::tempdir().unwrap();
        let mut cache = DiskCache::new(dir.path()).unwrap();
        // A non-empty directory where the entry should go makes the final rename fail.
        let blocked = cache.path_for("blocked");
        fs::create_dir(&blocked).unwrap();
        fs::write(blocked.join("keep"), b"x").unwrap();

        assert!(matches!(cache.store("blocked", b"payload"), Err(Error::Io(_))));
        assert!(!dir.path().join("blocked.bin.tmp").exists());
        assert!(blocked.is_dir());

        cache.store("fine", b"payload").unwrap();
        assert_eq!(cache.load("fine").unwrap().unwrap(), b"payload");
        assert!(!dir.path().join("fine.bin.tmp").exists());
    }

    #[test]
    fn no_cache_always_computes() {
        let mut cache = NoCache;
        let calls = Cell::new(0);
        for _ in 0..3 {
            let _: IncidenceIndex = cache
                .fetch_or_compute(
                    &ArtifactKey::Incidence {
                        dataset: DatasetId(0),
                        representation: Representation::Sparse,
                    },
                    &Representation::Sparse,
                    || {
                        calls.set(calls.get() + 1);
                        Ok(index())
                    },
                )
                .unwrap();
        }
        assert_eq!(calls.get(), 3);
    }
}
