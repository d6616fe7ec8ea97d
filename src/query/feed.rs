use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::error::{FeedError, QueryError};
use crate::query::cancel::CancelToken;
use crate::query::continuation::ContinuationToken;
use crate::query::diagnostics::QueryDiagnostics;
use crate::query::executor::{CrossPartitionExecutor, ExecutorPhase};
use crate::query::fetch::PageFetcher;
use crate::query::options::QueryOptions;
use crate::query::plan::QueryPlan;
use crate::query::selector::PipelineKind;
use crate::query::topology::TopologyProvider;

/// One page of merged results.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Page {
    /// Items in result order.
    pub items: Vec<Value>,
    /// Token resuming right after the last item; `None` once the query is done.
    pub continuation: Option<String>,
    /// Request units charged while building the page.
    pub request_charge: f64,
    /// Per-range fetches issued while building the page.
    pub fetch_count: usize,
    /// Index utilization reports, when requested.
    pub index_metrics: Option<String>,
    /// Query advice, when requested.
    pub query_advice: Option<String>,
}

impl Page {
    /// Number of items.
    pub fn len(&self) -> usize {
        self.items.len()
    }

    /// True when the page carries no items.
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Deserializes every item into `T`.
    pub fn deserialize_items<T: DeserializeOwned>(&self) -> serde_json::Result<Vec<T>> {
        self.items
            .iter()
            .map(|item| T::deserialize(item))
            .collect()
    }
}

/// Pull-based, resumable page sequence over a cross-partition query.
///
/// Reads take `&mut self`, so one iterator never serves two reads at once.
pub struct FeedIterator {
    plan: Arc<QueryPlan>,
    executor: CrossPartitionExecutor,
    diagnostics: QueryDiagnostics,
    continuation: Option<String>,
}

impl FeedIterator {
    /// Validates the plan, options and resume token; performs no I/O.
    pub fn new(
        plan: QueryPlan,
        options: QueryOptions,
        fetcher: Arc<dyn PageFetcher>,
        topology: Arc<dyn TopologyProvider>,
    ) -> Result<Self, FeedError> {
        let wrap = |err: QueryError| FeedError::new(err, &plan.query, options.continuation.as_deref());
        plan.validate().map_err(wrap)?;
        options.validate().map_err(wrap)?;
        let resume = match options.continuation.as_deref() {
            Some(raw) => {
                let token = ContinuationToken::decode(raw).map_err(wrap)?;
                token.check_query(&plan.query).map_err(wrap)?;
                Some(token)
            }
            None => None,
        };

        let continuation = options.continuation.clone();
        let plan = Arc::new(plan);
        let diagnostics = QueryDiagnostics::new();
        let executor = CrossPartitionExecutor::new(
            Arc::clone(&plan),
            options,
            fetcher,
            topology,
            resume,
            diagnostics.clone(),
        );
        Ok(Self {
            plan,
            executor,
            diagnostics,
            continuation,
        })
    }

    /// True until a page has been returned with no continuation.
    pub fn has_more_results(&self) -> bool {
        self.executor.has_more_results()
    }

    /// Runs one fetch, merge and yield cycle.
    ///
    /// Returns at least one item unless the query is exhausted. On error the
    /// iterator is unchanged and the call can be repeated.
    pub async fn read_next_page(&mut self, cancel: &CancelToken) -> Result<Page, FeedError> {
        match self.executor.next_page(cancel).await {
            Ok(page) => {
                self.continuation = page.continuation.clone();
                Ok(page)
            }
            Err(err) => Err(FeedError::new(
                err,
                &self.plan.query,
                self.continuation.as_deref(),
            )),
        }
    }

    /// Token the next read resumes from.
    pub fn continuation(&self) -> Option<&str> {
        self.continuation.as_deref()
    }

    /// Executor phase.
    pub fn phase(&self) -> ExecutorPhase {
        self.executor.phase()
    }

    /// Pipeline in use, once the first read has started it.
    pub fn pipeline_kind(&self) -> Option<PipelineKind> {
        self.executor.pipeline_kind()
    }

    /// Shared diagnostics handle.
    pub fn diagnostics(&self) -> QueryDiagnostics {
        self.diagnostics.clone()
    }
}
