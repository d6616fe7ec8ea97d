//! Partition topology: ranges, partition keys, and the lookup seam.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::query::fetch::FetchError;
use crate::query::value::hash_value;
use crate::types::{Epk, EpkRange, RangeId};

/// Logical partition key value supplied by the caller.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PartitionKey(pub Value);

impl PartitionKey {
    /// Wraps a JSON value.
    pub fn new(value: impl Into<Value>) -> Self {
        PartitionKey(value.into())
    }

    /// Position of this key in the hashed key space.
    pub fn effective(&self) -> Epk {
        Epk(hash_value(&self.0) >> 1)
    }
}

/// One physical partition range.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PartitionRange {
    /// Identifier reported by the topology.
    pub id: RangeId,
    /// Key span owned by this range.
    pub span: EpkRange,
}

impl PartitionRange {
    /// Builds a range.
    pub fn new(id: impl Into<RangeId>, span: EpkRange) -> Self {
        Self {
            id: id.into(),
            span,
        }
    }
}

/// Snapshot of a collection's partitioning.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Topology {
    /// False for collections without a partition key definition.
    pub partitioned: bool,
    /// Ranges sorted by their lower bound.
    pub ranges: Vec<PartitionRange>,
}

impl Topology {
    /// Builds a topology, sorting ranges by key order.
    pub fn new(partitioned: bool, mut ranges: Vec<PartitionRange>) -> Self {
        ranges.sort_by_key(|range| range.span.min);
        Self {
            partitioned,
            ranges,
        }
    }

    /// Ranges sharing keys with any of `spans`, in key order.
    pub fn overlapping(&self, spans: &[EpkRange]) -> Vec<PartitionRange> {
        self.ranges
            .iter()
            .filter(|range| spans.iter().any(|span| range.span.overlaps(span)))
            .cloned()
            .collect()
    }

    /// Ranges that replaced `parent` after a split or merge.
    pub fn successors(&self, parent: &PartitionRange) -> Vec<PartitionRange> {
        self.overlapping(&[parent.span])
    }
}

/// Partition topology lookup collaborator.
#[async_trait]
pub trait TopologyProvider: Send + Sync {
    /// Returns the current ranges; `force_refresh` bypasses any cache.
    async fn partition_ranges(&self, force_refresh: bool) -> Result<Topology, FetchError>;
}
