use std::fmt;
use std::time::Duration;

use thiserror::Error;

use crate::query::fetch::FetchError;
use crate::types::RangeId;

/// Result alias used throughout the query pipeline.
pub type Result<T> = std::result::Result<T, QueryError>;

/// Errors raised by the cross-partition query pipeline.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum QueryError {
    /// The query plan asks for an unsupported or contradictory combination.
    #[error("unsupported query plan: {0}")]
    QueryPlan(String),
    /// The request itself is invalid (options, partition key, query text).
    #[error("bad request: {0}")]
    BadRequest(String),
    /// A caller-supplied continuation token could not be used.
    #[error("malformed continuation token: {0}")]
    MalformedContinuation(String),
    /// A range kept moving after the split retry budget was spent.
    #[error("partition range {range} is gone and could not be re-resolved")]
    PartitionGone {
        /// Range that reported `Gone`.
        range: RangeId,
    },
    /// The fetch collaborator gave up on a throttled request.
    #[error("request to partition range {range} was throttled")]
    Throttled {
        /// Range whose fetch was throttled.
        range: RangeId,
        /// Backoff hint supplied by the service, if any.
        retry_after: Option<Duration>,
    },
    /// The collection or range does not exist.
    #[error("partition range {range} not found: {message}")]
    NotFound {
        /// Range whose fetch failed.
        range: RangeId,
        /// Collaborator-supplied detail.
        message: String,
    },
    /// The service rejected a per-range request.
    #[error("partition range {range} rejected the request: {message}")]
    RangeBadRequest {
        /// Range whose fetch failed.
        range: RangeId,
        /// Collaborator-supplied detail.
        message: String,
    },
    /// The partition topology could not be read.
    #[error("partition topology unavailable: {0}")]
    Topology(FetchError),
    /// The merge observed data violating its own ordering contract.
    #[error("merge invariant violated: {0}")]
    MergeInvariant(String),
    /// The caller cancelled the read.
    #[error("query execution cancelled")]
    Cancelled,
}

impl QueryError {
    /// Returns a machine-readable code for the error variant.
    pub fn code(&self) -> &'static str {
        match self {
            QueryError::QueryPlan(_) => "QueryPlanError",
            QueryError::BadRequest(_) => "BadRequest",
            QueryError::MalformedContinuation(_) => "BadRequest",
            QueryError::PartitionGone { .. } => "PartitionGone",
            QueryError::Throttled { .. } => "Throttled",
            QueryError::NotFound { .. } => "NotFound",
            QueryError::RangeBadRequest { .. } => "BadRequest",
            QueryError::Topology(source) => match source {
                FetchError::NotFound(_) => "NotFound",
                FetchError::BadRequest(_) => "BadRequest",
                FetchError::Throttled { .. } => "Throttled",
                FetchError::Gone => "PartitionGone",
            },
            QueryError::MergeInvariant(_) => "InternalMergeInvariantViolation",
            QueryError::Cancelled => "Cancelled",
        }
    }

    /// Whether repeating the same call (with the same continuation) may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            QueryError::Throttled { .. }
                | QueryError::PartitionGone { .. }
                | QueryError::Cancelled
                | QueryError::Topology(FetchError::Throttled { .. } | FetchError::Gone)
        )
    }

    /// Range the error is attributed to, when it came from a single range.
    pub fn range(&self) -> Option<&RangeId> {
        match self {
            QueryError::PartitionGone { range }
            | QueryError::Throttled { range, .. }
            | QueryError::NotFound { range, .. }
            | QueryError::RangeBadRequest { range, .. } => Some(range),
            _ => None,
        }
    }

    pub(crate) fn plan(message: impl Into<String>) -> Self {
        QueryError::QueryPlan(message.into())
    }

    pub(crate) fn bad_request(message: impl Into<String>) -> Self {
        QueryError::BadRequest(message.into())
    }

    pub(crate) fn malformed(message: impl Into<String>) -> Self {
        QueryError::MalformedContinuation(message.into())
    }
}

const SNIPPET_LEN: usize = 64;

/// Error surfaced by [`FeedIterator`](crate::query::feed::FeedIterator), carrying
/// enough context to reproduce the failing call.
#[derive(Debug, Clone, PartialEq)]
pub struct FeedError {
    kind: QueryError,
    query: String,
    continuation: Option<String>,
}

impl FeedError {
    pub(crate) fn new(kind: QueryError, query: &str, continuation: Option<&str>) -> Self {
        Self {
            kind,
            query: query.to_owned(),
            continuation: continuation.map(str::to_owned),
        }
    }

    /// Underlying pipeline error.
    pub fn kind(&self) -> &QueryError {
        &self.kind
    }

    /// Query text the failing iterator was executing.
    pub fn query(&self) -> &str {
        &self.query
    }

    /// Continuation token the failing call started from.
    pub fn continuation(&self) -> Option<&str> {
        self.continuation.as_deref()
    }

    /// Shorthand for `kind().code()`.
    pub fn code(&self) -> &'static str {
        self.kind.code()
    }

    /// Shorthand for `kind().is_retryable()`.
    pub fn is_retryable(&self) -> bool {
        self.kind.is_retryable()
    }

    /// Consumes the wrapper, returning the pipeline error.
    pub fn into_kind(self) -> QueryError {
        self.kind
    }
}

impl fmt::Display for FeedError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {} (query: {}", self.kind.code(), self.kind, self.query)?;
        if let Some(token) = &self.continuation {
            let snippet: String = token.chars().take(SNIPPET_LEN).collect();
            if snippet.len() < token.len() {
                write!(f, ", continuation: {snippet}...")?;
            } else {
                write!(f, ", continuation: {snippet}")?;
            }
        }
        write!(f, ")")
    }
}

impl std::error::Error for FeedError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&self.kind)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn feed_error_display_truncates_long_tokens() {
        let token = "x".repeat(200);
        let err = FeedError::new(
            QueryError::malformed("bad base64"),
            "SELECT * FROM r",
            Some(&token),
        );
        let rendered = err.to_string();
        assert!(rendered.starts_with("[BadRequest] malformed continuation token"));
        assert!(rendered.contains("query: SELECT * FROM r"));
        assert!(rendered.contains(&format!("{}...", "x".repeat(SNIPPET_LEN))));
        assert!(!rendered.contains(&"x".repeat(SNIPPET_LEN + 1)));
    }

    #[test]
    fn retryable_classification() {
        let range = RangeId::from("3");
        assert!(QueryError::Throttled {
            range: range.clone(),
            retry_after: None
        }
        .is_retryable());
        assert!(QueryError::Cancelled.is_retryable());
        assert!(!QueryError::plan("x").is_retryable());
        assert!(!QueryError::MergeInvariant("x".into()).is_retryable());
        assert_eq!(
            QueryError::NotFound {
                range: range.clone(),
                message: "gone".into()
            }
            .range(),
            Some(&range)
        );
    }
}
