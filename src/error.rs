//! Error types shared by every stage of the pipeline.

/// Errors for index construction, signature generation, banding and caching.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// A parameter is out of range, inconsistent, or the input contains an invalid id.
    #[error("configuration error: {0}")]
    Config(String),
    /// Both documents have empty feature sets, so `0/0` has no meaning.
    #[error("similarity undefined: documents {a} and {b} are both empty")]
    UndefinedSimilarity {
        /// First document.
        a: u32,
        /// Second document.
        b: u32,
    },
    /// The document id lies outside the index.
    #[error("unknown document {doc} (index has {n_docs} documents)")]
    UnknownDocument {
        /// Requested document.
        doc: u32,
        /// Number of documents in the index.
        n_docs: usize,
    },
    /// Dimension mismatch between expected and provided signatures.
    #[error("dimension mismatch (expected {expected}, got {got})")]
    DimensionMismatch {
        /// Expected dimension.
        expected: usize,
        /// Actual provided dimension.
        got: usize,
    },
    /// A cached artifact does not match the requested configuration.
    ///
    /// Produced during cache validation; the cache layer recovers from it by recomputing.
    #[error("cache mismatch for {key}: {reason}")]
    CacheMismatch {
        /// Cache identifier of the rejected entry.
        key: String,
        /// What did not match.
        reason: String,
    },
    /// Unrecoverable I/O failure.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    /// An artifact could not be encoded or decoded.
    #[error("serialization error: {0}")]
    Serialization(String),
}

impl From<postcard::Error> for Error {
    fn from(e: postcard::Error) -> Self {
        Self::Serialization(format!("postcard error: {e}"))
    }
}

/// Crate-wide result alias.
pub type Result<T> = std::result::Result<T, Error>;

pub(crate) fn config(msg: impl Into<String>) -> Error {
    Error::Config(msg.into())
}
