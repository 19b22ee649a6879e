//! Error taxonomy for indexing and retrieval.
//!
//! Callers branch on these variants: the HTTP layer maps each one to a
//! distinct error code, and the pipeline records any of them verbatim as the
//! `failed` status message.

/// Errors produced by the snapshot, chunking, writing, control-plane and
/// retrieval stages.
#[derive(Debug, thiserror::Error)]
pub enum IndexError {
    /// Repository or revision does not exist or is private. Never retried.
    #[error("repository inaccessible: {0}")]
    NotFound(String),

    /// Repository host refused the request (HTTP 403/429).
    #[error("repository host rate limited the request: {0}")]
    RateLimited(String),

    /// Download or decompressed entry exceeded a hard byte ceiling.
    #[error("{what} exceeds size limit of {limit} bytes")]
    SizeLimitExceeded { what: String, limit: u64 },

    /// Archive entry would escape the extraction directory.
    #[error("archive entry escapes extraction directory: {entry}")]
    PathSecurity { entry: String },

    /// Query issued while the index is queued or being built.
    #[error("index for submission {submission_id} is not ready (status: {status})")]
    IndexNotReady {
        submission_id: String,
        status: String,
    },

    /// Query issued against an index whose last run failed. Carries no
    /// failure detail on purpose; the status endpoint exposes it.
    #[error("submission {0} is not indexed")]
    IndexFailed(String),

    /// No indexing run has ever been started for this submission revision.
    #[error("no index exists for submission {0}")]
    NoIndex(String),

    #[error("query must not be empty")]
    EmptyQuery,

    #[error("unknown submission: {0}")]
    UnknownSubmission(String),

    /// Repository reference is malformed or not pinned to a commit.
    #[error("invalid repository reference: {0}")]
    InvalidReference(String),

    /// Any other failure while fetching the archive.
    #[error("archive fetch failed: {0}")]
    Fetch(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("zip error: {0}")]
    Zip(#[from] zip::result::ZipError),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("embedding failed: {0}")]
    Embedding(String),

    #[error("vector index error: {0}")]
    VectorIndex(String),

    #[error("{0}")]
    Other(String),
}

impl IndexError {
    /// Machine-readable code used in HTTP error bodies.
    pub fn code(&self) -> &'static str {
        match self {
            IndexError::NotFound(_) => "repository_not_found",
            IndexError::RateLimited(_) => "rate_limited",
            IndexError::SizeLimitExceeded { .. } => "size_limit_exceeded",
            IndexError::PathSecurity { .. } => "path_security",
            IndexError::IndexNotReady { .. } => "index_not_ready",
            IndexError::IndexFailed(_) => "index_failed",
            IndexError::NoIndex(_) => "no_index",
            IndexError::EmptyQuery => "empty_query",
            IndexError::UnknownSubmission(_) => "unknown_submission",
            IndexError::InvalidReference(_) => "bad_request",
            _ => "internal",
        }
    }

    /// Full error chain, one cause per line, for the status record detail.
    pub fn chain(&self) -> String {
        let mut out = self.to_string();
        let mut source = std::error::Error::source(self);
        while let Some(cause) = source {
            out.push_str("\ncaused by: ");
            out.push_str(&cause.to_string());
            source = cause.source();
        }
        out
    }
}

impl From<anyhow::Error> for IndexError {
    fn from(err: anyhow::Error) -> Self {
        IndexError::Other(format!("{:#}", err))
    }
}

/// Result type alias using [`IndexError`].
pub type Result<T> = std::result::Result<T, IndexError>;
