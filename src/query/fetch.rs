//! Per-range page fetch seam and a throttling-aware adapter.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rand::Rng;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tracing::warn;

use crate::error::QueryError;
use crate::query::topology::{PartitionKey, PartitionRange};
use crate::types::RangeId;

/// Failure reported by a fetch or topology collaborator.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum FetchError {
    /// The collection or range does not exist.
    #[error("not found: {0}")]
    NotFound(String),
    /// The service rejected the request.
    #[error("bad request: {0}")]
    BadRequest(String),
    /// Request rate too large; retry after the hint.
    #[error("throttled")]
    Throttled {
        /// Server backoff hint.
        retry_after: Option<Duration>,
    },
    /// The range split or merged and must be re-resolved.
    #[error("partition range gone")]
    Gone,
}

impl FetchError {
    /// Attributes the collaborator failure to `range`.
    pub fn into_query_error(self, range: &RangeId) -> QueryError {
        match self {
            FetchError::NotFound(message) => QueryError::NotFound {
                range: range.clone(),
                message,
            },
            FetchError::BadRequest(message) => QueryError::RangeBadRequest {
                range: range.clone(),
                message,
            },
            FetchError::Throttled { retry_after } => QueryError::Throttled {
                range: range.clone(),
                retry_after,
            },
            FetchError::Gone => QueryError::PartitionGone {
                range: range.clone(),
            },
        }
    }
}

/// One per-range page request.
#[derive(Clone, Debug, PartialEq)]
pub struct FetchRequest {
    /// Range to read from.
    pub range: PartitionRange,
    /// Position to resume from; `None` starts the range.
    pub continuation: Option<String>,
    /// Suggested page size; `None` lets the range decide.
    pub page_size: Option<usize>,
    /// Logical partition restriction.
    pub partition_key: Option<PartitionKey>,
    /// Request index metrics and query advice.
    pub populate_index_metrics: bool,
    /// Corpus statistics for full-text scoring in a hybrid search.
    pub statistics: Option<Arc<GlobalStatistics>>,
}

impl FetchRequest {
    /// First-page request for `range` with no options set.
    pub fn new(range: PartitionRange) -> Self {
        Self {
            range,
            continuation: None,
            page_size: None,
            partition_key: None,
            populate_index_metrics: false,
            statistics: None,
        }
    }
}

/// Full-text statistics of one text component.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FullTextStatistics {
    /// Words in the component's text over every counted document.
    pub total_word_count: u64,
    /// Documents containing each search term, in term order.
    pub hit_counts: Vec<u64>,
}

/// Corpus statistics full-text scoring needs, summed over ranges.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GlobalStatistics {
    /// Documents counted.
    pub document_count: u64,
    /// One entry per full-text component, in declaration order.
    pub full_text: Vec<FullTextStatistics>,
}

impl GlobalStatistics {
    /// Adds another range's statistics; both must describe the same components.
    pub fn merge(&mut self, other: &GlobalStatistics) -> Result<(), QueryError> {
        if self.full_text.len() != other.full_text.len() {
            return Err(QueryError::MergeInvariant(format!(
                "expected {} full-text statistics, got {}",
                self.full_text.len(),
                other.full_text.len()
            )));
        }
        for (mine, theirs) in self.full_text.iter().zip(&other.full_text) {
            if mine.hit_counts.len() != theirs.hit_counts.len() {
                return Err(QueryError::MergeInvariant(format!(
                    "expected {} hit counts, got {}",
                    mine.hit_counts.len(),
                    theirs.hit_counts.len()
                )));
            }
        }
        self.document_count += other.document_count;
        for (mine, theirs) in self.full_text.iter_mut().zip(&other.full_text) {
            mine.total_word_count += theirs.total_word_count;
            for (hits, more) in mine.hit_counts.iter_mut().zip(&theirs.hit_counts) {
                *hits += more;
            }
        }
        Ok(())
    }
}

/// One range's statistics response.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct StatisticsPage {
    /// Statistics of the range.
    pub statistics: GlobalStatistics,
    /// Response statistics.
    pub stats: FetchStats,
}

/// One result row as a range returns it.
///
/// `order_by`, `group_by` and `aggregates` carry the rewritten projections the
/// merge needs; `payload` is what the caller eventually sees. An AVG partial
/// is `{"sum": s, "count": c}` and a `null` partial means "no input".
/// Hybrid searches also return the document's `rid` and one score per
/// ranking in `component_scores`.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct RemoteItem {
    /// Projected document.
    pub payload: Value,
    /// ORDER BY key values, one per key.
    #[serde(default)]
    pub order_by: Vec<Value>,
    /// GROUP BY key values, one per expression.
    #[serde(default)]
    pub group_by: Vec<Value>,
    /// Aggregate partials, one per aggregate.
    #[serde(default)]
    pub aggregates: Vec<Value>,
    /// Resource id identifying the document across ranges.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rid: Option<String>,
    /// Hybrid search scores, one per ranking.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub component_scores: Vec<Value>,
}

impl RemoteItem {
    /// Plain item with no merge projections.
    pub fn plain(payload: Value) -> Self {
        Self {
            payload,
            ..Self::default()
        }
    }

    /// Item carrying ORDER BY values.
    pub fn ordered(payload: Value, order_by: Vec<Value>) -> Self {
        Self {
            payload,
            order_by,
            ..Self::default()
        }
    }
}

/// Statistics attached to one per-range response.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct FetchStats {
    /// Request units consumed.
    pub request_charge: f64,
    /// Items in the response.
    pub item_count: usize,
    /// Server-side duration.
    pub duration: Duration,
    /// Index utilization report, when requested.
    pub index_metrics: Option<String>,
    /// Query advice, when requested.
    pub query_advice: Option<String>,
}

/// One per-range response.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct RemotePage {
    /// Items in range order.
    pub items: Vec<RemoteItem>,
    /// Resume position; `None` when the range is exhausted.
    pub continuation: Option<String>,
    /// Response statistics.
    pub stats: FetchStats,
}

/// Per-range page fetch collaborator.
#[async_trait]
pub trait PageFetcher: Send + Sync {
    /// Fetches the next page of `request.range`.
    async fn fetch(&self, request: FetchRequest) -> Result<RemotePage, FetchError>;

    /// Full-text statistics of `request.range` for the query's text components.
    async fn full_text_statistics(&self, request: FetchRequest) -> Result<StatisticsPage, FetchError> {
        Err(FetchError::BadRequest(format!(
            "range {} does not serve full-text statistics",
            request.range.id
        )))
    }
}

#[async_trait]
impl<F: PageFetcher + ?Sized> PageFetcher for Arc<F> {
    async fn fetch(&self, request: FetchRequest) -> Result<RemotePage, FetchError> {
        (**self).fetch(request).await
    }

    async fn full_text_statistics(&self, request: FetchRequest) -> Result<StatisticsPage, FetchError> {
        (**self).full_text_statistics(request).await
    }
}

/// Backoff policy for [`RetryingFetcher`].
#[derive(Clone, Debug, PartialEq)]
pub struct RetryPolicy {
    /// Attempts after the first one.
    pub max_retries: u32,
    /// Delay before the first retry when the server gives no hint.
    pub initial_backoff: Duration,
    /// Upper bound on any single delay.
    pub max_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 5,
            initial_backoff: Duration::from_millis(20),
            max_backoff: Duration::from_secs(2),
        }
    }
}

impl RetryPolicy {
    /// Delay for the zero-based `attempt`, honoring a server hint.
    pub fn backoff(&self, attempt: u32, hint: Option<Duration>) -> Duration {
        if let Some(hint) = hint {
            return hint.min(self.max_backoff);
        }
        let base = self
            .initial_backoff
            .saturating_mul(1u32 << attempt.min(16))
            .min(self.max_backoff);
        let jitter = rand::thread_rng().gen_range(0..=base.as_millis() as u64 / 4);
        (base + Duration::from_millis(jitter)).min(self.max_backoff)
    }
}

/// Retries throttled fetches with exponential backoff; other errors pass through.
pub struct RetryingFetcher<F> {
    inner: F,
    policy: RetryPolicy,
}

impl<F: PageFetcher> RetryingFetcher<F> {
    /// Wraps `inner` with the default policy.
    pub fn new(inner: F) -> Self {
        Self::with_policy(inner, RetryPolicy::default())
    }

    /// Wraps `inner` with an explicit policy.
    pub fn with_policy(inner: F, policy: RetryPolicy) -> Self {
        Self { inner, policy }
    }

    /// Wrapped fetcher.
    pub fn inner(&self) -> &F {
        &self.inner
    }

    async fn retrying<T, Fut>(&self, range: &RangeId, mut call: impl FnMut() -> Fut) -> Result<T, FetchError>
    where
        Fut: Future<Output = Result<T, FetchError>>,
    {
        let mut attempt = 0;
        loop {
            match call().await {
                Err(FetchError::Throttled { retry_after }) if attempt < self.policy.max_retries => {
                    let delay = self.policy.backoff(attempt, retry_after);
                    warn!(
                        range = %range,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        "query.fetch.throttled"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                other => return other,
            }
        }
    }
}

#[async_trait]
impl<F: PageFetcher> PageFetcher for RetryingFetcher<F> {
    async fn fetch(&self, request: FetchRequest) -> Result<RemotePage, FetchError> {
        let range = request.range.id.clone();
        self.retrying(&range, || self.inner.fetch(request.clone())).await
    }

    async fn full_text_statistics(&self, request: FetchRequest) -> Result<StatisticsPage, FetchError> {
        let range = request.range.id.clone();
        self.retrying(&range, || self.inner.full_text_statistics(request.clone()))
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::EpkRange;
    use parking_lot::Mutex;

    struct Flaky {
        throttles_left: Mutex<u32>,
        calls: Mutex<u32>,
    }

    #[async_trait]
    impl PageFetcher for Flaky {
        async fn fetch(&self, _request: FetchRequest) -> Result<RemotePage, FetchError> {
            *self.calls.lock() += 1;
            let mut left = self.throttles_left.lock();
            if *left > 0 {
                *left -= 1;
                return Err(FetchError::Throttled {
                    retry_after: Some(Duration::from_millis(1)),
                });
            }
            Ok(RemotePage {
                items: vec![RemoteItem::plain(Value::from(1))],
                continuation: None,
                stats: FetchStats::default(),
            })
        }

        async fn full_text_statistics(&self, request: FetchRequest) -> Result<StatisticsPage, FetchError> {
            self.fetch(request).await?;
            Ok(StatisticsPage {
                statistics: GlobalStatistics {
                    document_count: 4,
                    full_text: Vec::new(),
                },
                stats: FetchStats::default(),
            })
        }
    }

    struct PagesOnly;

    #[async_trait]
    impl PageFetcher for PagesOnly {
        async fn fetch(&self, _request: FetchRequest) -> Result<RemotePage, FetchError> {
            Ok(RemotePage::default())
        }
    }

    fn request() -> FetchRequest {
        FetchRequest {
            page_size: Some(10),
            ..FetchRequest::new(PartitionRange::new("0", EpkRange::FULL))
        }
    }

    fn policy(max_retries: u32) -> RetryPolicy {
        RetryPolicy {
            max_retries,
            initial_backoff: Duration::from_millis(1),
            max_backoff: Duration::from_millis(5),
        }
    }

    #[tokio::test]
    async fn retries_until_success() {
        let fetcher = RetryingFetcher::with_policy(
            Flaky {
                throttles_left: Mutex::new(2),
                calls: Mutex::new(0),
            },
            policy(3),
        );
        let page = fetcher.fetch(request()).await.unwrap();
        assert_eq!(page.items.len(), 1);
        assert_eq!(*fetcher.inner().calls.lock(), 3);
    }

    #[tokio::test]
    async fn surfaces_throttle_after_budget() {
        let fetcher = RetryingFetcher::with_policy(
            Flaky {
                throttles_left: Mutex::new(10),
                calls: Mutex::new(0),
            },
            policy(2),
        );
        let err = fetcher.fetch(request()).await.unwrap_err();
        assert!(matches!(err, FetchError::Throttled { .. }));
        assert_eq!(*fetcher.inner().calls.lock(), 3);
    }

    #[test]
    fn backoff_is_capped() {
        let policy = policy(10);
        assert!(policy.backoff(12, None) <= policy.max_backoff);
        assert_eq!(
            policy.backoff(0, Some(Duration::from_secs(9))),
            policy.max_backoff
        );
    }

    #[test]
    fn errors_are_attributed_to_ranges() {
        let range = RangeId::from("7");
        let err = FetchError::Gone.into_query_error(&range);
        assert_eq!(err.code(), "PartitionGone");
        assert_eq!(err.range(), Some(&range));
    }

    #[tokio::test]
    async fn statistics_are_retried_and_default_to_unsupported() {
        let fetcher = RetryingFetcher::with_policy(
            Flaky {
                throttles_left: Mutex::new(1),
                calls: Mutex::new(0),
            },
            policy(3),
        );
        let page = fetcher.full_text_statistics(request()).await.unwrap();
        assert_eq!(page.statistics.document_count, 4);
        assert_eq!(*fetcher.inner().calls.lock(), 2);

        let unsupported = Arc::new(PagesOnly).full_text_statistics(request()).await;
        assert!(matches!(unsupported, Err(FetchError::BadRequest(_))));
    }

    #[test]
    fn statistics_sum_per_component_and_term() {
        let range = |docs, words, hits: Vec<u64>| GlobalStatistics {
            document_count: docs,
            full_text: vec![FullTextStatistics {
                total_word_count: words,
                hit_counts: hits,
            }],
        };
        let mut total = range(3, 30, vec![1, 0]);
        total.merge(&range(5, 12, vec![2, 4])).unwrap();
        assert_eq!(total, range(8, 42, vec![3, 4]));

        assert!(total.merge(&range(1, 1, vec![1])).is_err());
        assert!(total.merge(&GlobalStatistics::default()).is_err());
        assert_eq!(total.document_count, 8);
    }
}
