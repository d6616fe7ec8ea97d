//! Merge strategies and their static composition into a pipeline.
//!
//! A pipeline is one source merge (concatenation, streaming ORDER BY,
//! non-streaming ORDER BY or hybrid rank fusion) followed by optional
//! GROUP BY/aggregate, DISTINCT and OFFSET/TOP/LIMIT stages, in that order. Stages are plain enums and
//! structs; there is no dynamic dispatch.

pub mod aggregate;
pub mod concat;
pub mod distinct;
pub mod hybrid;
pub mod limit;
pub mod non_streaming;
pub mod order_by;

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{QueryError, Result};
use crate::query::cursor::{CursorArena, SkipOrder};
use crate::query::fetch::RemoteItem;
use crate::query::plan::QueryPlan;
use crate::types::RangeId;

pub use aggregate::GroupByAggregate;
pub use concat::Concatenate;
pub use distinct::{DistinctDedup, DistinctSnapshot};
pub use hybrid::HybridRrf;
pub use limit::{LimitSnapshot, TopLimit};
pub use non_streaming::NonStreamingOrderBy;
pub use order_by::OrderByMerge;

/// Named merge strategies.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MergeStrategy {
    /// Ranges drained one after another.
    Concatenate,
    /// Streaming k-way ORDER BY merge.
    OrderByMerge,
    /// Drain-and-sort ranking merge.
    NonStreamingOrderBy,
    /// OFFSET/TOP/LIMIT short-circuit.
    TopLimit,
    /// DISTINCT deduplication.
    DistinctDedup,
    /// GROUP BY / value aggregate finalization.
    GroupByAggregate,
    /// Reciprocal-rank fusion of hybrid search rankings.
    HybridRrf,
}

impl fmt::Display for MergeStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Outcome of pulling one item from a merge stage.
#[derive(Clone, Debug, PartialEq)]
pub enum MergePoll<T> {
    /// Next item in merge order.
    Item(T),
    /// Nothing can be produced until these ranges are fetched.
    Pending(Vec<RangeId>),
    /// No more items will ever be produced.
    Finished,
}

impl<T> MergePoll<T> {
    /// Maps the item, keeping demand and completion.
    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> MergePoll<U> {
        match self {
            MergePoll::Item(item) => MergePoll::Item(f(item)),
            MergePoll::Pending(demand) => MergePoll::Pending(demand),
            MergePoll::Finished => MergePoll::Finished,
        }
    }
}

/// Source merge over the cursor arena.
#[derive(Clone, Debug, PartialEq)]
pub enum Source {
    /// Key-order concatenation.
    Concatenate(Concatenate),
    /// Streaming ORDER BY.
    OrderBy(OrderByMerge),
    /// Drain-and-sort ORDER BY.
    NonStreaming(NonStreamingOrderBy),
    /// Drain-and-fuse hybrid search.
    Hybrid(HybridRrf),
}

impl Source {
    /// Source implementing `strategy` for `plan`.
    pub fn for_plan(plan: &QueryPlan, strategy: MergeStrategy) -> Result<Self> {
        match strategy {
            MergeStrategy::Concatenate => Ok(Source::Concatenate(Concatenate)),
            MergeStrategy::OrderByMerge => Ok(Source::OrderBy(OrderByMerge::new(plan.sort_orders()))),
            MergeStrategy::NonStreamingOrderBy => {
                let window = Self::window(plan, "non-streaming ORDER BY")?;
                Ok(Source::NonStreaming(NonStreamingOrderBy::new(plan.sort_orders(), window)))
            }
            MergeStrategy::HybridRrf => {
                let components = plan
                    .hybrid
                    .as_ref()
                    .map(|hybrid| hybrid.components.len())
                    .ok_or_else(|| QueryError::plan("rank fusion requires a hybrid search"))?;
                let window = Self::window(plan, "hybrid search")?;
                Ok(Source::Hybrid(HybridRrf::new(components, window)))
            }
            other => Err(QueryError::plan(format!("{other} is not a source merge"))),
        }
    }

    fn window(plan: &QueryPlan, what: &str) -> Result<usize> {
        let window = TopLimit::from_plan(plan)
            .and_then(|limit| limit.window())
            .ok_or_else(|| QueryError::plan(format!("{what} requires TOP or LIMIT")))?;
        Ok(usize::try_from(window).unwrap_or(usize::MAX))
    }

    /// Strategy this source implements.
    pub fn strategy(&self) -> MergeStrategy {
        match self {
            Source::Concatenate(_) => MergeStrategy::Concatenate,
            Source::OrderBy(_) => MergeStrategy::OrderByMerge,
            Source::NonStreaming(_) => MergeStrategy::NonStreamingOrderBy,
            Source::Hybrid(_) => MergeStrategy::HybridRrf,
        }
    }

    /// True when the source drains every range before emitting.
    fn is_blocking(&self) -> bool {
        matches!(self, Source::NonStreaming(_) | Source::Hybrid(_))
    }

    /// Next merged item.
    pub fn poll(&mut self, arena: &mut CursorArena) -> Result<MergePoll<RemoteItem>> {
        match self {
            Source::Concatenate(merge) => merge.poll(arena),
            Source::OrderBy(merge) => merge.poll(arena),
            Source::NonStreaming(merge) => merge.poll(arena),
            Source::Hybrid(merge) => merge.poll(arena),
        }
    }

    fn skip_order(&self) -> SkipOrder<'_> {
        match self {
            Source::OrderBy(merge) => SkipOrder::Sorted(merge.orders()),
            Source::Concatenate(_) | Source::NonStreaming(_) | Source::Hybrid(_) => {
                SkipOrder::Sequential
            }
        }
    }
}

/// Merge state persisted in continuation tokens.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MergeSnapshot {
    /// DISTINCT state, when the query deduplicates.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub distinct: Option<DistinctSnapshot>,
    /// Remaining OFFSET/TOP/LIMIT budget.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limit: Option<LimitSnapshot>,
    /// ORDER BY values of the last item the streaming merge returned.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_key: Option<Vec<Value>>,
    /// Items already returned by a pipeline that restarts on resume.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub replay: Option<u64>,
}

/// Source merge plus the post-merge stages a query needs.
#[derive(Clone, Debug, PartialEq)]
pub struct MergePipeline {
    source: Source,
    aggregate: Option<GroupByAggregate>,
    distinct: Option<DistinctDedup>,
    limit: Option<TopLimit>,
    fetch_window: Option<usize>,
    replay_skip: u64,
}

impl MergePipeline {
    /// Fresh pipeline for `plan` over the given source strategy.
    pub fn build(plan: &QueryPlan, source: MergeStrategy) -> Result<Self> {
        let source = Source::for_plan(plan, source)?;
        let aggregate = GroupByAggregate::from_plan(plan);
        let distinct = DistinctDedup::new(plan.distinct);
        let limit = TopLimit::from_plan(plan);
        let bounded_by_limit = aggregate.is_none() && distinct.is_none() && !source.is_blocking();
        let fetch_window = limit
            .as_ref()
            .and_then(TopLimit::window)
            .filter(|_| bounded_by_limit)
            .map(|window| usize::try_from(window).unwrap_or(usize::MAX));
        Ok(Self {
            source,
            aggregate,
            distinct,
            limit,
            fetch_window,
            replay_skip: 0,
        })
    }

    /// Pipeline resumed from `snapshot`.
    ///
    /// Replayed pipelines restart from scratch and silently drop the items the
    /// caller already received; streaming pipelines restore their stage state.
    pub fn restore(plan: &QueryPlan, source: MergeStrategy, snapshot: &MergeSnapshot) -> Result<Self> {
        let mut pipeline = Self::build(plan, source)?;
        if pipeline.is_replayed() {
            pipeline.replay_skip = snapshot
                .replay
                .ok_or_else(|| QueryError::malformed("token lacks the replay position"))?;
            return Ok(pipeline);
        }
        if snapshot.replay.is_some() {
            return Err(QueryError::malformed("streaming query token carries a replay position"));
        }
        pipeline.distinct = match (plan.distinct, &snapshot.distinct) {
            (kind, Some(state)) => Some(DistinctDedup::restore(kind, state)?),
            (kind, None) => match DistinctDedup::new(kind) {
                Some(_) => return Err(QueryError::malformed("token lacks DISTINCT state")),
                None => None,
            },
        };
        match (&mut pipeline.source, &snapshot.last_key) {
            (Source::OrderBy(merge), Some(last)) => merge.resume_after(last.clone())?,
            (_, None) => {}
            (_, Some(_)) => {
                return Err(QueryError::malformed("unordered query token carries a sort key"));
            }
        }
        pipeline.limit = match &snapshot.limit {
            Some(state) => Some(TopLimit::restore(plan, state)?),
            None if plan.has_take() => {
                return Err(QueryError::malformed("token lacks limit state"));
            }
            None => None,
        };
        Ok(pipeline)
    }

    /// True when resumption re-runs the query and skips already returned items.
    pub fn is_replayed(&self) -> bool {
        self.aggregate.is_some() || self.source.is_blocking()
    }

    /// Stages in evaluation order.
    pub fn strategies(&self) -> Vec<MergeStrategy> {
        let mut stages = vec![self.source.strategy()];
        if self.aggregate.is_some() {
            stages.push(MergeStrategy::GroupByAggregate);
        }
        if self.distinct.is_some() {
            stages.push(MergeStrategy::DistinctDedup);
        }
        if self.limit.is_some() {
            stages.push(MergeStrategy::TopLimit);
        }
        stages
    }

    /// Most items one range can contribute to the result, when the query's
    /// TOP/LIMIT bounds it; used to size range fetches.
    pub fn fetch_window(&self) -> Option<usize> {
        self.fetch_window
    }

    /// Order in which split ranges owe their skipped items.
    pub fn skip_order(&self) -> SkipOrder<'_> {
        self.source.skip_order()
    }

    /// Pulls the next output value.
    pub fn poll_next(&mut self, arena: &mut CursorArena) -> Result<MergePoll<Value>> {
        loop {
            if self.limit.as_ref().is_some_and(TopLimit::is_satisfied) {
                return Ok(MergePoll::Finished);
            }
            let demand = arena.resolve_skip_groups(self.source.skip_order());
            if !demand.is_empty() {
                return Ok(MergePoll::Pending(demand));
            }
            let polled = match &mut self.aggregate {
                Some(aggregate) => aggregate.poll(&mut self.source, arena)?,
                None => self.source.poll(arena)?.map(|item| item.payload),
            };
            let value = match polled {
                MergePoll::Item(value) => value,
                MergePoll::Pending(demand) => return Ok(MergePoll::Pending(demand)),
                MergePoll::Finished => return Ok(MergePoll::Finished),
            };
            if let Some(distinct) = &mut self.distinct {
                if !distinct.admit(&value) {
                    continue;
                }
            }
            if let Some(limit) = &mut self.limit {
                if !limit.admit() {
                    continue;
                }
            }
            if self.replay_skip > 0 {
                self.replay_skip -= 1;
                continue;
            }
            return Ok(MergePoll::Item(value));
        }
    }

    /// True when no further value can be produced.
    pub fn is_exhausted(&self, arena: &CursorArena) -> bool {
        if self.limit.as_ref().is_some_and(TopLimit::is_satisfied) {
            return true;
        }
        if let Some(aggregate) = &self.aggregate {
            return aggregate.is_drained();
        }
        match &self.source {
            Source::NonStreaming(merge) => merge.is_drained(),
            Source::Hybrid(merge) => merge.is_drained(),
            Source::Concatenate(_) | Source::OrderBy(_) => arena.all_done(),
        }
    }

    /// State to persist; `emitted` counts every value returned so far.
    pub fn snapshot(&self, emitted: u64) -> MergeSnapshot {
        if self.is_replayed() {
            return MergeSnapshot {
                replay: Some(emitted),
                ..MergeSnapshot::default()
            };
        }
        let last_key = match &self.source {
            Source::OrderBy(merge) => merge.last_key().map(<[Value]>::to_vec),
            _ => None,
        };
        MergeSnapshot {
            distinct: self.distinct.as_ref().map(DistinctDedup::snapshot),
            limit: self.limit.as_ref().map(TopLimit::snapshot),
            last_key,
            replay: None,
        }
    }
}
