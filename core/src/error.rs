use thiserror::Error;

/// Failure reported by the injected API client.
///
/// `Clone` because a single in-flight fetch is shared by every caller waiting
/// on the same node.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ApiError {
    #[error("request to {url} failed: {message}")]
    Request { url: String, message: String },

    #[error("event {0} not found")]
    NotFound(String),

    #[error("malformed event payload: {0}")]
    Malformed(String),
}

#[derive(Debug, Error)]
pub enum TraceTreeError {
    /// The payload does not have the shape of a trace at all.
    #[error("malformed trace payload: {0}")]
    MalformedTrace(String),

    #[error("failed to fetch spans for {key}: {source}")]
    Fetch {
        key: String,
        #[source]
        source: ApiError,
    },

    #[error("node cannot be fetched without a {0}")]
    MissingFetchKey(&'static str),

    #[error("invalid path segment: {0:?}")]
    InvalidPathSegment(String),

    #[error("tree invariant violated: {0}")]
    InvariantViolation(String),
}

impl From<serde_json::Error> for TraceTreeError {
    fn from(err: serde_json::Error) -> Self {
        TraceTreeError::MalformedTrace(err.to_string())
    }
}

pub type Result<T, E = TraceTreeError> = std::result::Result<T, E>;
