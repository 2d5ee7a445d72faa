//! Exact Jaccard similarity from the incidence index.
//!
//! The signature matrix is never consulted here; this is the ground truth used to
//! confirm candidates.

use crate::error::{Error, Result};
use crate::incidence::IncidenceIndex;

/// `|features(a) ∩ features(b)| / |features(a) ∪ features(b)|`.
///
/// If both documents are empty the ratio is `0/0` and the result is
/// [`Error::UndefinedSimilarity`], never a silent `0` or `1`. A single empty document
/// against a non-empty one has similarity `0`.
pub fn jaccard_similarity(index: &IncidenceIndex, a: u32, b: u32) -> Result<f64> {
    let union = index.union_len(a, b)?;
    if union == 0 {
        return Err(Error::UndefinedSimilarity { a, b });
    }
    Ok(index.intersection_len(a, b)? as f64 / union as f64)
}

/// Like [`jaccard_similarity`], mapping the undefined case to `None`.
pub fn jaccard_or_none(index: &IncidenceIndex, a: u32, b: u32) -> Result<Option<f64>> {
    match jaccard_similarity(index, a, b) {
        Ok(s) => Ok(Some(s)),
        Err(Error::UndefinedSimilarity { .. }) => Ok(None),
        Err(e) => Err(e),
    }
}
