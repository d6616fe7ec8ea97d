use std::num::NonZeroUsize;

use serde::{Deserialize, Serialize};

use crate::error::{QueryError, Result};
use crate::query::topology::PartitionKey;

/// Page size value meaning "return whatever one fetch round produced".
pub const UNBOUNDED_PAGE_SIZE: i32 = -1;

/// Fallback parallelism when the host cannot report its core count.
const FALLBACK_PARALLELISM: usize = 4;

/// How many times one range may be re-resolved after `Gone` within a single read.
const DEFAULT_SPLIT_RETRIES: usize = 3;

/// Recognized request options for one query execution.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueryOptions {
    /// Target a single logical partition.
    pub partition_key: Option<PartitionKey>,
    /// Maximum items per returned page; [`UNBOUNDED_PAGE_SIZE`] disables the cap.
    pub max_item_count: i32,
    /// Concurrent range fetches: `Some(0)` is serial, `None` uses host parallelism.
    pub max_concurrency: Option<usize>,
    /// Allow the single-roundtrip optimistic path for single-partition queries.
    pub enable_optimistic_direct_execution: bool,
    /// Skip merge planning and pass every range straight through.
    pub force_passthrough: bool,
    /// Ask ranges for index utilization metrics and query advice.
    pub populate_index_metrics: bool,
    /// Resume from a token returned by an earlier page.
    pub continuation: Option<String>,
    /// Re-resolution budget per range for `Gone` responses.
    pub max_split_retries: usize,
}

impl Default for QueryOptions {
    fn default() -> Self {
        Self {
            partition_key: None,
            max_item_count: 100,
            max_concurrency: None,
            enable_optimistic_direct_execution: true,
            force_passthrough: false,
            populate_index_metrics: false,
            continuation: None,
            max_split_retries: DEFAULT_SPLIT_RETRIES,
        }
    }
}

impl QueryOptions {
    /// One outstanding fetch at a time; required for exact TOP short-circuiting.
    pub fn serial() -> Self {
        Self {
            max_concurrency: Some(0),
            ..Self::default()
        }
    }

    /// Single logical partition with the optimistic direct path enabled.
    pub fn optimistic(partition_key: PartitionKey) -> Self {
        Self {
            partition_key: Some(partition_key),
            enable_optimistic_direct_execution: true,
            ..Self::default()
        }
    }

    /// Sets the page size.
    pub fn with_max_item_count(mut self, max_item_count: i32) -> Self {
        self.max_item_count = max_item_count;
        self
    }

    /// Sets the fetch concurrency.
    pub fn with_max_concurrency(mut self, max_concurrency: Option<usize>) -> Self {
        self.max_concurrency = max_concurrency;
        self
    }

    /// Sets the resume token.
    pub fn with_continuation(mut self, continuation: Option<String>) -> Self {
        self.continuation = continuation;
        self
    }

    /// Sets the target partition key.
    pub fn with_partition_key(mut self, partition_key: PartitionKey) -> Self {
        self.partition_key = Some(partition_key);
        self
    }

    /// Rejects option values with no meaning.
    pub fn validate(&self) -> Result<()> {
        if self.max_item_count == 0 || self.max_item_count < UNBOUNDED_PAGE_SIZE {
            return Err(QueryError::bad_request(format!(
                "max_item_count must be -1 or positive (got {})",
                self.max_item_count
            )));
        }
        if matches!(&self.continuation, Some(token) if token.trim().is_empty()) {
            return Err(QueryError::malformed("continuation token is empty"));
        }
        Ok(())
    }

    /// Items per returned page, `None` when unbounded.
    pub fn page_size(&self) -> Option<usize> {
        usize::try_from(self.max_item_count).ok().filter(|size| *size > 0)
    }

    /// Effective number of concurrent fetches; 0 means serial.
    pub fn effective_concurrency(&self) -> usize {
        match self.max_concurrency {
            Some(limit) => limit,
            None => std::thread::available_parallelism()
                .map(NonZeroUsize::get)
                .unwrap_or(FALLBACK_PARALLELISM),
        }
    }
}
