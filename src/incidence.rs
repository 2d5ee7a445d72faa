//! Document ↔ feature incidence index.
//!
//! Conceptually a boolean matrix with features as rows and documents as columns.
//! Two backing representations answer every query identically:
//!
//! - [`Representation::Sparse`]: per-document sorted feature lists (compressed columns).
//!   Memory is proportional to the number of incidences. It cannot walk feature rows.
//! - [`Representation::Dense`]: per-document bitsets for popcount set algebra, plus the
//!   transposed feature rows so min-hash permutations can walk rows in permuted order.
//!   Memory is bounded by `n_docs × n_features` bits.

use std::time::Instant;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::error::{config, Error, Result};

/// Backing representation of an [`IncidenceIndex`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Representation {
    /// Sorted per-document feature lists.
    Sparse,
    /// Per-document bitsets plus feature rows.
    Dense,
}

impl Representation {
    /// Short lowercase name, used in cache identifiers.
    pub fn as_str(&self) -> &'static str {
        match self {
            Representation::Sparse => "sparse",
            Representation::Dense => "dense",
        }
    }
}

/// Grouped id lists: `ids[offsets[i]..offsets[i + 1]]` belong to group `i`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
struct Postings {
    offsets: Vec<usize>,
    ids: Vec<u32>,
}

impl Postings {
    /// Build from `(group, id)` pairs sorted by group then id, without duplicates.
    fn from_sorted(groups: usize, pairs: &[(u32, u32)]) -> Self {
        let mut offsets = vec![0usize; groups + 1];
        for &(g, _) in pairs {
            offsets[g as usize + 1] += 1;
        }
        for i in 0..groups {
            offsets[i + 1] += offsets[i];
        }
        let ids = pairs.iter().map(|&(_, id)| id).collect();
        Self { offsets, ids }
    }

    fn get(&self, group: usize) -> &[u32] {
        &self.ids[self.offsets[group]..self.offsets[group + 1]]
    }

    fn groups(&self) -> usize {
        self.offsets.len() - 1
    }

    fn is_consistent(&self, groups: usize, id_bound: usize) -> bool {
        self.offsets.len() == groups + 1
            && self.offsets.first() == Some(&0)
            && self.offsets.last() == Some(&self.ids.len())
            && self.offsets.windows(2).all(|w| w[0] <= w[1])
            && self.ids.iter().all(|&id| (id as usize) < id_bound)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
enum Storage {
    Sparse {
        columns: Postings,
    },
    Dense {
        words_per_doc: usize,
        bits: Vec<u64>,
        rows: Postings,
    },
}

/// Immutable incidence relation between documents and features.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IncidenceIndex {
    n_docs: usize,
    n_features: usize,
    nnz: usize,
    storage: Storage,
}

impl IncidenceIndex {
    /// Build the index from `(document_id, feature_id)` pairs.
    ///
    /// Duplicate pairs are idempotent. Ids must be non-negative and fit in `u32`.
    /// `dense_word_limit` bounds the dense bitset (in 64-bit words) and is ignored
    /// for the sparse representation.
    pub fn from_pairs<I>(
        pairs: I,
        representation: Representation,
        dense_word_limit: usize,
    ) -> Result<Self>
    where
        I: IntoIterator<Item = (i64, i64)>,
    {
        let start = Instant::now();
        let mut by_doc = Vec::new();
        for (doc, feature) in pairs {
            by_doc.push((to_id(doc, "document")?, to_id(feature, "feature")?));
        }
        if by_doc.is_empty() {
            return Err(config("incidence input contains no pairs"));
        }
        by_doc.sort_unstable();
        by_doc.dedup();

        let n_docs = by_doc.iter().map(|&(d, _)| d as usize).max().unwrap_or(0) + 1;
        let n_features = by_doc.iter().map(|&(_, f)| f as usize).max().unwrap_or(0) + 1;
        let nnz = by_doc.len();

        let storage = match representation {
            Representation::Sparse => Storage::Sparse {
                columns: Postings::from_sorted(n_docs, &by_doc),
            },
            Representation::Dense => {
                let words_per_doc = n_features.div_ceil(64);
                let words = n_docs
                    .checked_mul(words_per_doc)
                    .filter(|&w| w <= dense_word_limit)
                    .ok_or_else(|| {
                        config(format!(
                            "dense index of {n_docs} documents x {n_features} features exceeds \
                             the limit of {dense_word_limit} words"
                        ))
                    })?;
                let mut bits = vec![0u64; words];
                for &(d, f) in &by_doc {
                    let f = f as usize;
                    bits[d as usize * words_per_doc + f / 64] |= 1u64 << (f % 64);
                }
                let mut by_feature: Vec<(u32, u32)> =
                    by_doc.iter().map(|&(d, f)| (f, d)).collect();
                by_feature.sort_unstable();
                Storage::Dense {
                    words_per_doc,
                    bits,
                    rows: Postings::from_sorted(n_features, &by_feature),
                }
            }
        };

        let index = Self {
            n_docs,
            n_features,
            nnz,
            storage,
        };
        let empty = index.empty_docs();
        if empty > 0 {
            warn!(empty, n_docs, "incidence index contains documents without features");
        }
        info!(
            n_docs,
            n_features,
            nnz,
            representation = representation.as_str(),
            elapsed_ms = start.elapsed().as_millis() as u64,
            "built incidence index"
        );
        Ok(index)
    }

    /// Number of documents (`max document id + 1`).
    pub fn n_docs(&self) -> usize {
        self.n_docs
    }

    /// Number of features (`max feature id + 1`).
    pub fn n_features(&self) -> usize {
        self.n_features
    }

    /// Number of distinct `(document, feature)` incidences.
    pub fn nnz(&self) -> usize {
        self.nnz
    }

    /// The backing representation.
    pub fn representation(&self) -> Representation {
        match self.storage {
            Storage::Sparse { .. } => Representation::Sparse,
            Storage::Dense { .. } => Representation::Dense,
        }
    }

    /// Sorted features of `doc`.
    pub fn features(&self, doc: u32) -> Result<Features<'_>> {
        let d = self.check_doc(doc)?;
        Ok(match &self.storage {
            Storage::Sparse { columns } => Features::Listed(columns.get(d).iter()),
            Storage::Dense {
                words_per_doc,
                bits,
                ..
            } => Features::Bits {
                words: &bits[d * words_per_doc..(d + 1) * words_per_doc],
                word: 0,
                current: bits.get(d * words_per_doc).copied().unwrap_or(0),
            },
        })
    }

    /// Number of features of `doc`.
    pub fn doc_len(&self, doc: u32) -> Result<usize> {
        let d = self.check_doc(doc)?;
        Ok(self.len_unchecked(d))
    }

    /// Whether `(doc, feature)` is an incidence.
    pub fn contains(&self, doc: u32, feature: u32) -> Result<bool> {
        let d = self.check_doc(doc)?;
        if feature as usize >= self.n_features {
            return Ok(false);
        }
        Ok(match &self.storage {
            Storage::Sparse { columns } => columns.get(d).binary_search(&feature).is_ok(),
            Storage::Dense {
                words_per_doc,
                bits,
                ..
            } => {
                let f = feature as usize;
                (bits[d * words_per_doc + f / 64] >> (f % 64)) & 1 == 1
            }
        })
    }

    /// `|features(a) ∩ features(b)|`.
    pub fn intersection_len(&self, a: u32, b: u32) -> Result<usize> {
        let (da, db) = (self.check_doc(a)?, self.check_doc(b)?);
        Ok(match &self.storage {
            Storage::Sparse { columns } => sorted_intersection_len(columns.get(da), columns.get(db)),
            Storage::Dense {
                words_per_doc,
                bits,
                ..
            } => {
                let wa = &bits[da * words_per_doc..(da + 1) * words_per_doc];
                let wb = &bits[db * words_per_doc..(db + 1) * words_per_doc];
                wa.iter()
                    .zip(wb)
                    .map(|(x, y)| (x & y).count_ones() as usize)
                    .sum()
            }
        })
    }

    /// `|features(a) ∪ features(b)|`.
    pub fn union_len(&self, a: u32, b: u32) -> Result<usize> {
        let inter = self.intersection_len(a, b)?;
        Ok(self.doc_len(a)? + self.doc_len(b)? - inter)
    }

    /// Number of documents with no features.
    pub fn empty_docs(&self) -> usize {
        (0..self.n_docs)
            .filter(|&d| self.len_unchecked(d) == 0)
            .count()
    }

    /// Feature rows (feature → documents), available only for the dense representation.
    pub fn feature_rows(&self) -> Option<FeatureRows<'_>> {
        match &self.storage {
            Storage::Sparse { .. } => None,
            Storage::Dense { rows, .. } => Some(FeatureRows { rows }),
        }
    }

    /// Visit every incidence as `(doc, feature)` in the representation's natural order:
    /// document-major for sparse, feature-major for dense.
    pub fn for_each_incidence(&self, mut f: impl FnMut(u32, u32)) {
        match &self.storage {
            Storage::Sparse { columns } => {
                for d in 0..columns.groups() {
                    for &feature in columns.get(d) {
                        f(d as u32, feature);
                    }
                }
            }
            Storage::Dense { rows, .. } => {
                for feature in 0..rows.groups() {
                    for &d in rows.get(feature) {
                        f(d, feature as u32);
                    }
                }
            }
        }
    }

    /// Internal invariants hold (used to vet deserialized indexes).
    pub(crate) fn is_consistent(&self) -> bool {
        match &self.storage {
            Storage::Sparse { columns } => {
                columns.is_consistent(self.n_docs, self.n_features) && columns.ids.len() == self.nnz
            }
            Storage::Dense {
                words_per_doc,
                bits,
                rows,
            } => {
                *words_per_doc == self.n_features.div_ceil(64)
                    && bits.len() == self.n_docs * words_per_doc
                    && rows.is_consistent(self.n_features, self.n_docs)
                    && rows.ids.len() == self.nnz
            }
        }
    }

    pub(crate) fn check_doc(&self, doc: u32) -> Result<usize> {
        if (doc as usize) < self.n_docs {
            Ok(doc as usize)
        } else {
            Err(Error::UnknownDocument {
                doc,
                n_docs: self.n_docs,
            })
        }
    }

    fn len_unchecked(&self, d: usize) -> usize {
        match &self.storage {
            Storage::Sparse { columns } => columns.get(d).len(),
            Storage::Dense {
                words_per_doc,
                bits,
                ..
            } => bits[d * words_per_doc..(d + 1) * words_per_doc]
                .iter()
                .map(|w| w.count_ones() as usize)
                .sum(),
        }
    }
}

/// Feature-major view of a dense index.
#[derive(Debug, Clone, Copy)]
pub struct FeatureRows<'a> {
    rows: &'a Postings,
}

impl<'a> FeatureRows<'a> {
    /// Number of feature rows.
    pub fn len(&self) -> usize {
        self.rows.groups()
    }

    /// True if there are no rows.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Sorted documents incident to `feature`.
    pub fn row(&self, feature: u32) -> &'a [u32] {
        self.rows.get(feature as usize)
    }
}

/// Iterator over one document's features in ascending order.
#[derive(Debug, Clone)]
pub enum Features<'a> {
    /// Backed by a sorted list.
    Listed(std::slice::Iter<'a, u32>),
    /// Backed by a bitset.
    Bits {
        /// The document's bitset words.
        words: &'a [u64],
        /// Index of the word being drained.
        word: usize,
        /// Remaining set bits of that word.
        current: u64,
    },
}

impl Iterator for Features<'_> {
    type Item = u32;

    fn next(&mut self) -> Option<u32> {
        match self {
            Features::Listed(it) => it.next().copied(),
            Features::Bits {
                words,
                word,
                current,
            } => loop {
                if *current != 0 {
                    let bit = current.trailing_zeros();
                    *current &= *current - 1;
                    return Some((*word * 64) as u32 + bit);
                }
                *word += 1;
                *current = *words.get(*word)?;
            },
        }
    }
}

fn to_id(raw: i64, what: &str) -> Result<u32> {
    u32::try_from(raw).map_err(|_| config(format!("{what} id {raw} is negative or exceeds u32")))
}

fn sorted_intersection_len(a: &[u32], b: &[u32]) -> usize {
    let (mut i, mut j, mut n) = (0, 0, 0);
    while i < a.len() && j < b.len() {
        match a[i].cmp(&b[j]) {
            std::cmp::Ordering::Less => i += 1,
            std::cmp::Ordering::Greater => j += 1,
            std::cmp::Ordering::Equal => {
                n += 1;
                i += 1;
                j += 1;
            }
        }
    }
    n
}
