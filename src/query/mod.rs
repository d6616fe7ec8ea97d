#![forbid(unsafe_code)]

//! Cross-partition query execution.
//!
//! A query plan and request options enter through [`FeedIterator`]; the
//! selector picks a pipeline, the executor drives one cursor per partition
//! range through the fetch collaborator, and the merge pipeline turns the
//! per-range streams into pages addressed by continuation tokens.

/// Cooperative cancellation for in-flight reads.
pub mod cancel;

/// Continuation token encoding, decoding, and validation.
pub mod continuation;

/// Per-range fetch progress and the cursor arena.
pub mod cursor;

/// Pipeline selection, page, and split diagnostics.
pub mod diagnostics;

/// Page-driving executor.
///
/// Owns the cursors, issues fetch rounds, handles splits, and packages pages.
pub mod executor;

/// Public paged iterator.
pub mod feed;

/// Per-range fetch collaborator seam.
pub mod fetch;

/// Merge strategies and the merge pipeline.
pub mod merge;

/// Request options.
pub mod options;

/// Query plan descriptor and its validation.
pub mod plan;

/// Pipeline selection.
pub mod selector;

/// Partition topology seam.
pub mod topology;

/// JSON value ordering and hashing.
pub mod value;

pub use cancel::CancelToken;
pub use diagnostics::{DiagnosticsSnapshot, QueryDiagnostics};
pub use feed::{FeedIterator, Page};
pub use fetch::{
    FetchError, FetchRequest, FetchStats, FullTextStatistics, GlobalStatistics, PageFetcher,
    RemoteItem, RemotePage, RetryPolicy, RetryingFetcher, StatisticsPage,
};
pub use merge::MergeStrategy;
pub use options::QueryOptions;
pub use plan::{AggregateKind, DistinctKind, HybridSearch, QueryPlan, RankComponent, SortOrder};
pub use selector::PipelineKind;
pub use topology::{PartitionKey, PartitionRange, Topology, TopologyProvider};
