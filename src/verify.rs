//! Exact verification of candidates and scoring of reported pairs.
//!
//! Results leave the crate only through a [`PairSink`], so callers decide where rows go
//! (a file, a channel, a vector in a test).

use std::collections::HashSet;
use std::io::Write;

use tracing::{debug, info};

use crate::candidates::CandidatePair;
use crate::error::{Error, Result};
use crate::incidence::IncidenceIndex;
use crate::pipeline::PairFinder;
use crate::similarity;

/// Destination for confirmed pairs.
pub trait PairSink {
    /// Write one confirmed pair.
    fn write(&mut self, pair: &CandidatePair) -> Result<()>;
}

impl PairSink for Vec<CandidatePair> {
    fn write(&mut self, pair: &CandidatePair) -> Result<()> {
        self.push(*pair);
        Ok(())
    }
}

/// Writes `a,b` lines to any [`Write`], shifting ids by a fixed offset.
#[derive(Debug)]
pub struct WriteSink<W: Write> {
    inner: W,
    id_offset: u32,
}

impl<W: Write> WriteSink<W> {
    /// Zero-based ids.
    pub fn new(inner: W) -> Self {
        Self::with_offset(inner, 0)
    }

    /// Ids shifted by `id_offset` (e.g. `1` for one-based output).
    pub fn with_offset(inner: W, id_offset: u32) -> Self {
        Self { inner, id_offset }
    }

    /// Recover the writer.
    pub fn into_inner(self) -> W {
        self.inner
    }
}

impl<W: Write> PairSink for WriteSink<W> {
    fn write(&mut self, pair: &CandidatePair) -> Result<()> {
        writeln!(
            self.inner,
            "{},{}",
            u64::from(pair.a) + u64::from(self.id_offset),
            u64::from(pair.b) + u64::from(self.id_offset)
        )?;
        Ok(())
    }
}

/// Confirm candidates with the exact oracle and write those with similarity `>= threshold`.
///
/// Candidates are checked in descending order of estimated similarity (ties by id), so the
/// most promising pairs reach the sink first. Returns the number of pairs written.
pub fn find_similar_pairs<S: PairSink>(
    finder: &PairFinder,
    threshold: f64,
    sink: &mut S,
) -> Result<usize> {
    let mut candidates: Vec<CandidatePair> = finder.candidates().collect();
    candidates.sort_by(|x, y| {
        y.estimated
            .total_cmp(&x.estimated)
            .then_with(|| x.ids().cmp(&y.ids()))
    });

    let mut found = 0;
    for pair in &candidates {
        match finder.jaccard_similarity(pair.a, pair.b) {
            Ok(s) if s >= threshold => {
                sink.write(pair)?;
                found += 1;
                debug!(found, estimated = pair.estimated, "confirmed pair");
            }
            Ok(_) | Err(Error::UndefinedSimilarity { .. }) => {}
            Err(e) => return Err(e),
        }
    }
    info!(
        candidates = candidates.len(),
        found, threshold, "verified candidates"
    );
    Ok(found)
}

/// Outcome of scoring a list of reported pairs against the exact similarity.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Evaluation {
    /// Pairs that are ordered, new, and at least `threshold` similar.
    pub found: usize,
    /// Everything else.
    pub incorrect: usize,
}

impl Evaluation {
    /// Score reported pairs.
    ///
    /// A pair is incorrect if it is not ordered `a < b`, was already reported, names an
    /// unknown document, has undefined similarity, or is below `threshold`. A pair exactly
    /// at `threshold` is found, the same boundary [`find_similar_pairs`] writes with.
    pub fn score<I>(pairs: I, index: &IncidenceIndex, threshold: f64) -> Self
    where
        I: IntoIterator<Item = (u32, u32)>,
    {
        let mut seen = HashSet::new();
        let mut eval = Self::default();
        for (a, b) in pairs {
            let ok = a < b
                && seen.insert((a, b))
                && matches!(similarity::jaccard_similarity(index, a, b), Ok(s) if s >= threshold);
            if ok {
                eval.found += 1;
            } else {
                eval.incorrect += 1;
            }
        }
        eval
    }

    /// `found / (found + incorrect)`, or `0` when nothing was reported.
    pub fn precision(&self) -> f64 {
        let total = self.found + self.incorrect;
        if total == 0 {
            0.0
        } else {
            self.found as f64 / total as f64
        }
    }
}
