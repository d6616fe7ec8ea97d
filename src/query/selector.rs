//! Chooses the cheapest correct execution pipeline for a query.

use std::fmt;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{QueryError, Result};
use crate::query::merge::MergeStrategy;
use crate::query::options::QueryOptions;
use crate::query::plan::QueryPlan;
use crate::query::topology::{PartitionRange, Topology, TopologyProvider};
use crate::types::{Epk, EpkRange};

/// Execution pipeline variants.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PipelineKind {
    /// Ranges are read and returned without any merge logic.
    Passthrough,
    /// Single logical partition, returned in one round trip when possible.
    SingleRoundtripOptimisticExecution,
    /// Single logical partition that still needs merge stages.
    TryExecute,
    /// Cross-partition execution led by a specialized strategy.
    Specialized(MergeStrategy),
    /// Plain cross-partition execution.
    ParallelCrossPartition(MergeStrategy),
}

impl fmt::Display for PipelineKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PipelineKind::Passthrough => f.write_str("Passthrough"),
            PipelineKind::SingleRoundtripOptimisticExecution => {
                f.write_str("SingleRoundtripOptimisticExecution")
            }
            PipelineKind::TryExecute => f.write_str("TryExecute"),
            PipelineKind::Specialized(strategy) => write!(f, "Specialized({strategy})"),
            PipelineKind::ParallelCrossPartition(strategy) => {
                write!(f, "ParallelCrossPartition({strategy})")
            }
        }
    }
}

impl PipelineKind {
    /// True for variants that target a single logical partition.
    pub fn is_single_partition(&self) -> bool {
        matches!(
            self,
            PipelineKind::SingleRoundtripOptimisticExecution | PipelineKind::TryExecute
        )
    }

    /// Source merge the variant runs for `plan`.
    ///
    /// Single-partition variants read one logical partition whose results the
    /// range already orders, so they concatenate unless the query fuses
    /// rankings client side. Passthrough keeps the plan's merge so that a
    /// split of its only range stays correctly ordered.
    pub fn source_strategy(&self, plan: &QueryPlan) -> MergeStrategy {
        let planned = if plan.hybrid.is_some() {
            MergeStrategy::HybridRrf
        } else if plan.non_streaming_order_by {
            MergeStrategy::NonStreamingOrderBy
        } else if plan.has_order_by() {
            MergeStrategy::OrderByMerge
        } else {
            MergeStrategy::Concatenate
        };
        match self {
            PipelineKind::SingleRoundtripOptimisticExecution | PipelineKind::TryExecute
                if plan.hybrid.is_none() =>
            {
                MergeStrategy::Concatenate
            }
            _ => planned,
        }
    }

    /// True when a token produced by `other` can resume under `self`.
    ///
    /// The variant may legitimately change between calls (a split can move a
    /// query from one to several target ranges); the source merge may not.
    pub fn can_resume(&self, other: &PipelineKind, plan: &QueryPlan) -> bool {
        self.source_strategy(plan) == other.source_strategy(plan)
    }
}

/// First-match-wins selection over an already validated plan.
pub fn select_pipeline(
    plan: &QueryPlan,
    options: &QueryOptions,
    partitioned: bool,
    target_count: usize,
) -> PipelineKind {
    if !partitioned || (options.force_passthrough && target_count <= 1) {
        return PipelineKind::Passthrough;
    }
    if options.force_passthrough {
        debug!(targets = target_count, "query.pipeline.passthrough_ignored");
    }
    let single_partition =
        options.partition_key.is_some() || plan.single_point_range().is_some();
    if single_partition {
        let needs_merge = plan.has_order_by()
            || plan.has_group_by()
            || plan.has_aggregates()
            || plan.hybrid.is_some();
        if !needs_merge && options.enable_optimistic_direct_execution {
            return PipelineKind::SingleRoundtripOptimisticExecution;
        }
        return PipelineKind::TryExecute;
    }
    if plan.has_group_by() || plan.has_aggregates() {
        return PipelineKind::Specialized(MergeStrategy::GroupByAggregate);
    }
    if plan.hybrid.is_some() {
        return PipelineKind::Specialized(MergeStrategy::HybridRrf);
    }
    if plan.has_distinct() {
        return PipelineKind::Specialized(MergeStrategy::DistinctDedup);
    }
    if plan.non_streaming_order_by {
        return PipelineKind::Specialized(MergeStrategy::NonStreamingOrderBy);
    }
    if plan.has_order_by() && target_count > 1 {
        return PipelineKind::Specialized(MergeStrategy::OrderByMerge);
    }
    if plan.has_order_by() {
        PipelineKind::ParallelCrossPartition(MergeStrategy::OrderByMerge)
    } else {
        PipelineKind::ParallelCrossPartition(MergeStrategy::Concatenate)
    }
}

/// Restriction of the key space a query can touch.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct TargetFilter {
    point: Option<Epk>,
    spans: Vec<EpkRange>,
}

impl TargetFilter {
    /// Filter derived from the partition key option and the plan's query ranges.
    pub fn for_query(plan: &QueryPlan, options: &QueryOptions) -> Self {
        let point = options
            .partition_key
            .as_ref()
            .map(|key| key.effective())
            .or_else(|| plan.single_point_range().map(|range| range.min));
        Self {
            point,
            spans: plan.query_ranges.clone(),
        }
    }

    /// Filter admitting every range.
    pub fn everything() -> Self {
        Self::default()
    }

    fn spans(&self) -> Vec<EpkRange> {
        match self.point {
            Some(point) => vec![EpkRange::point(point)],
            None => self.spans.clone(),
        }
    }

    /// Ranges of `topology` the query must visit.
    pub fn targets(&self, topology: &Topology) -> Vec<PartitionRange> {
        let spans = self.spans();
        if spans.is_empty() {
            topology.ranges.clone()
        } else {
            topology.overlapping(&spans)
        }
    }

    /// Drops ranges the query cannot touch.
    pub fn retain(&self, ranges: Vec<PartitionRange>) -> Vec<PartitionRange> {
        let spans = self.spans();
        if spans.is_empty() {
            return ranges;
        }
        ranges
            .into_iter()
            .filter(|range| spans.iter().any(|span| range.span.overlaps(span)))
            .collect()
    }
}

/// Selected pipeline plus the ranges it starts from.
#[derive(Clone, Debug, PartialEq)]
pub struct Resolution {
    /// Selected pipeline.
    pub kind: PipelineKind,
    /// Initial target ranges in key order.
    pub targets: Vec<PartitionRange>,
    /// Filter applied to successors after splits.
    pub filter: TargetFilter,
}

/// Reads the topology and selects the pipeline for `plan`.
#[tracing::instrument(level = "debug", skip_all, err)]
pub async fn resolve(
    plan: &QueryPlan,
    options: &QueryOptions,
    provider: &dyn TopologyProvider,
) -> Result<Resolution> {
    let topology = provider
        .partition_ranges(false)
        .await
        .map_err(QueryError::Topology)?;
    let filter = if topology.partitioned {
        TargetFilter::for_query(plan, options)
    } else {
        TargetFilter::everything()
    };
    let targets = filter.targets(&topology);
    let kind = select_pipeline(plan, options, topology.partitioned, targets.len());
    debug!(
        pipeline = %kind,
        partitioned = topology.partitioned,
        targets = targets.len(),
        "query.pipeline.selected"
    );
    Ok(Resolution {
        kind,
        targets,
        filter,
    })
}
