//! Cross-partition query execution for a partitioned document store client.
//!
//! The crate fans a single query out over the partition ranges of a
//! collection, merges the per-range results according to the query plan, and
//! exposes them as a resumable page sequence. Network access is abstracted by
//! the [`query::PageFetcher`] and [`query::TopologyProvider`] traits;
//! [`memory::InMemoryContainer`] implements both in-process.

#![warn(missing_docs)]

/// Error types surfaced by the pipeline.
pub mod error;
pub mod memory;
pub mod query;
/// Key-space primitives shared by every layer.
pub mod types;

pub use error::{FeedError, QueryError, Result};
