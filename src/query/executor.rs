//! Cross-partition executor: drives cursors, fetches, merging, and paging.
//!
//! Each read works on a clone of the execution state and commits it only when
//! the read succeeds, so a failed or cancelled read leaves the previous state
//! (and the continuation token already handed out) valid.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Instant;

use futures::stream::{self, StreamExt};
use tracing::{debug, info};

use crate::error::{QueryError, Result};
use crate::query::cancel::CancelToken;
use crate::query::continuation::ContinuationToken;
use crate::query::cursor::{Cursor, CursorArena};
use crate::query::diagnostics::QueryDiagnostics;
use crate::query::feed::Page;
use crate::query::fetch::{
    FetchError, FetchRequest, FetchStats, GlobalStatistics, PageFetcher, RemotePage,
};
use crate::query::merge::{MergePipeline, MergePoll, TopLimit};
use crate::query::options::QueryOptions;
use crate::query::plan::QueryPlan;
use crate::query::selector::{self, PipelineKind, TargetFilter};
use crate::query::topology::{PartitionRange, TopologyProvider};
use crate::types::RangeId;

/// Lifecycle of one executor.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ExecutorPhase {
    /// Topology not read yet.
    Initializing,
    /// Waiting on range fetches.
    FetchingPage,
    /// Pulling items through the merge pipeline.
    Merging,
    /// A page was returned and more results remain.
    Yielding,
    /// Every range is consumed; buffered merge output remains.
    Draining,
    /// No more results.
    Exhausted,
}

#[derive(Clone, Debug)]
struct Running {
    kind: PipelineKind,
    filter: TargetFilter,
    arena: CursorArena,
    pipeline: MergePipeline,
    emitted: u64,
    statistics: Option<Arc<GlobalStatistics>>,
}

#[derive(Clone, Debug)]
struct ExecutionState {
    phase: ExecutorPhase,
    running: Option<Running>,
}

#[derive(Debug, Default)]
struct ReadStats {
    request_charge: f64,
    fetch_count: usize,
    index_metrics: Vec<String>,
    query_advice: Vec<String>,
    split_attempts: HashMap<RangeId, usize>,
}

impl ReadStats {
    fn record(&mut self, stats: &FetchStats) {
        self.request_charge += stats.request_charge;
        self.fetch_count += 1;
        if let Some(metrics) = &stats.index_metrics {
            self.index_metrics.push(metrics.clone());
        }
        if let Some(advice) = &stats.query_advice {
            self.query_advice.push(advice.clone());
        }
    }

    fn joined(parts: Vec<String>) -> Option<String> {
        (!parts.is_empty()).then(|| parts.join("\n"))
    }
}

/// Executes one query across partition ranges, a page at a time.
pub struct CrossPartitionExecutor {
    plan: Arc<QueryPlan>,
    options: QueryOptions,
    fetcher: Arc<dyn PageFetcher>,
    topology: Arc<dyn TopologyProvider>,
    resume: Option<ContinuationToken>,
    diagnostics: QueryDiagnostics,
    state: ExecutionState,
}

impl CrossPartitionExecutor {
    /// Creates an executor; nothing is fetched until the first read.
    pub fn new(
        plan: Arc<QueryPlan>,
        options: QueryOptions,
        fetcher: Arc<dyn PageFetcher>,
        topology: Arc<dyn TopologyProvider>,
        resume: Option<ContinuationToken>,
        diagnostics: QueryDiagnostics,
    ) -> Self {
        Self {
            plan,
            options,
            fetcher,
            topology,
            resume,
            diagnostics,
            state: ExecutionState {
                phase: ExecutorPhase::Initializing,
                running: None,
            },
        }
    }

    /// Current phase.
    pub fn phase(&self) -> ExecutorPhase {
        self.state.phase
    }

    /// True until the executor reaches [`ExecutorPhase::Exhausted`].
    pub fn has_more_results(&self) -> bool {
        self.state.phase != ExecutorPhase::Exhausted
    }

    /// Pipeline in use, once initialized.
    pub fn pipeline_kind(&self) -> Option<PipelineKind> {
        self.state.running.as_ref().map(|running| running.kind)
    }

    /// Produces the next page, or fails leaving the state untouched.
    pub async fn next_page(&mut self, cancel: &CancelToken) -> Result<Page> {
        if cancel.is_cancelled() {
            return Err(QueryError::Cancelled);
        }
        let mut state = self.state.clone();
        let result = tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(QueryError::Cancelled),
            result = self.drive(&mut state) => result,
        };
        match &result {
            Ok(_) => self.state = state,
            Err(QueryError::Cancelled) => debug!(query = %self.plan.query, "query.read.cancelled"),
            Err(err) => debug!(code = err.code(), error = %err, "query.read.failed"),
        }
        result
    }

    async fn drive(&self, state: &mut ExecutionState) -> Result<Page> {
        let started = Instant::now();
        let mut stats = ReadStats::default();
        if state.phase == ExecutorPhase::Initializing {
            if TopLimit::from_plan(&self.plan).is_some_and(|limit| limit.is_satisfied()) {
                state.phase = ExecutorPhase::Exhausted;
                self.diagnostics.record_page(0, 0, 0.0, started.elapsed());
                return Ok(Page::default());
            }
            state.running = Some(self.initialize(&mut stats).await?);
        }
        let Some(run) = state.running.as_mut() else {
            return Ok(Page::default());
        };
        if state.phase == ExecutorPhase::Exhausted {
            return Ok(Page::default());
        }

        let page_size = self.options.page_size();
        let mut items = Vec::new();
        let mut finished = false;
        loop {
            state.phase = ExecutorPhase::Merging;
            match run.pipeline.poll_next(&mut run.arena)? {
                MergePoll::Item(value) => {
                    items.push(value);
                    if page_size.is_some_and(|size| items.len() >= size) {
                        break;
                    }
                }
                MergePoll::Finished => {
                    finished = true;
                    break;
                }
                MergePoll::Pending(demand) => {
                    if !items.is_empty() && !run.arena.has_skip_groups() {
                        break;
                    }
                    state.phase = ExecutorPhase::FetchingPage;
                    self.fetch_round(run, demand, &mut stats).await?;
                }
            }
        }

        run.emitted += items.len() as u64;
        let finished = finished || run.pipeline.is_exhausted(&run.arena);
        state.phase = if finished {
            ExecutorPhase::Exhausted
        } else if run.arena.all_done() {
            ExecutorPhase::Draining
        } else {
            ExecutorPhase::Yielding
        };
        let continuation = if finished {
            None
        } else {
            let positions = if run.pipeline.is_replayed() {
                Vec::new()
            } else {
                run.arena.positions()
            };
            let token = ContinuationToken::new(
                &self.plan.query,
                run.kind,
                positions,
                run.pipeline.snapshot(run.emitted),
            );
            Some(token.encode()?)
        };

        debug!(
            items = items.len(),
            fetches = stats.fetch_count,
            request_charge = stats.request_charge,
            phase = ?state.phase,
            "query.page.yielded"
        );
        self.diagnostics.record_page(
            items.len(),
            stats.fetch_count,
            stats.request_charge,
            started.elapsed(),
        );
        Ok(Page {
            items,
            continuation,
            request_charge: stats.request_charge,
            fetch_count: stats.fetch_count,
            index_metrics: ReadStats::joined(stats.index_metrics),
            query_advice: ReadStats::joined(stats.query_advice),
        })
    }

    async fn initialize(&self, stats: &mut ReadStats) -> Result<Running> {
        let resolution = selector::resolve(&self.plan, &self.options, self.topology.as_ref()).await?;
        let kind = resolution.kind;
        self.diagnostics.record_pipeline(kind);
        let source = kind.source_strategy(&self.plan);
        let statistics = match &self.plan.hybrid {
            Some(hybrid) if hybrid.requires_global_statistics() => Some(Arc::new(
                self.gather_statistics(&resolution.filter, &resolution.targets, stats)
                    .await?,
            )),
            _ => None,
        };

        let (arena, pipeline, emitted) = match &self.resume {
            Some(token) => {
                if !kind.can_resume(&token.pipeline, &self.plan) {
                    return Err(QueryError::malformed(format!(
                        "token was produced by {} but the query now runs {kind}",
                        token.pipeline
                    )));
                }
                let pipeline = MergePipeline::restore(&self.plan, source, &token.merge)?;
                if pipeline.is_replayed() {
                    let emitted = token.merge.replay.unwrap_or(0);
                    (CursorArena::new(resolution.targets), pipeline, emitted)
                } else {
                    (CursorArena::restore(token.positions()), pipeline, 0)
                }
            }
            None => (
                CursorArena::new(resolution.targets),
                MergePipeline::build(&self.plan, source)?,
                0,
            ),
        };
        info!(
            pipeline = %kind,
            stages = ?pipeline.strategies(),
            ranges = arena.len(),
            resumed = self.resume.is_some(),
            "query.executor.initialized"
        );
        Ok(Running {
            kind,
            filter: resolution.filter,
            arena,
            pipeline,
            emitted,
            statistics,
        })
    }

    /// Sums the full-text statistics of every target range, following splits.
    async fn gather_statistics(
        &self,
        filter: &TargetFilter,
        targets: &[PartitionRange],
        stats: &mut ReadStats,
    ) -> Result<GlobalStatistics> {
        let concurrency = self.options.effective_concurrency().max(1);
        let mut pending: VecDeque<(PartitionRange, usize)> =
            targets.iter().cloned().map(|range| (range, 0)).collect();
        let mut total: Option<GlobalStatistics> = None;
        while !pending.is_empty() {
            let round: Vec<(PartitionRange, usize)> = pending.drain(..).collect();
            let results: Vec<_> = stream::iter(round)
                .map(|(range, attempt)| {
                    let fetcher = Arc::clone(&self.fetcher);
                    let request = FetchRequest {
                        partition_key: self.options.partition_key.clone(),
                        ..FetchRequest::new(range.clone())
                    };
                    async move { (range, attempt, fetcher.full_text_statistics(request).await) }
                })
                .buffered(concurrency)
                .collect()
                .await;
            for (range, attempt, result) in results {
                match result {
                    Ok(page) => {
                        stats.record(&page.stats);
                        match &mut total {
                            Some(total) => total.merge(&page.statistics)?,
                            None => total = Some(page.statistics),
                        }
                    }
                    Err(FetchError::Gone) => {
                        if attempt >= self.options.max_split_retries {
                            return Err(QueryError::PartitionGone { range: range.id });
                        }
                        let topology = self
                            .topology
                            .partition_ranges(true)
                            .await
                            .map_err(QueryError::Topology)?;
                        let successors = filter.retain(topology.successors(&range));
                        if successors.is_empty() {
                            return Err(QueryError::PartitionGone { range: range.id });
                        }
                        debug!(range = %range.id, children = successors.len(), "query.statistics.split");
                        pending.extend(successors.into_iter().map(|child| (child, attempt + 1)));
                    }
                    Err(err) => return Err(err.into_query_error(&range.id)),
                }
            }
        }
        let total = total.unwrap_or_default();
        debug!(
            documents = total.document_count,
            components = total.full_text.len(),
            "query.statistics.gathered"
        );
        Ok(total)
    }

    fn request_for(&self, run: &Running, cursor: &Cursor, page_size: Option<usize>) -> FetchRequest {
        FetchRequest {
            range: cursor.range().clone(),
            continuation: cursor.next_continuation().map(str::to_owned),
            page_size,
            partition_key: self.options.partition_key.clone(),
            populate_index_metrics: self.options.populate_index_metrics,
            statistics: run.statistics.clone(),
        }
    }

    async fn fetch_round(
        &self,
        run: &mut Running,
        demand: Vec<RangeId>,
        stats: &mut ReadStats,
    ) -> Result<()> {
        let concurrency = self.options.effective_concurrency();
        let mut targets: Vec<RangeId> = Vec::with_capacity(demand.len());
        for id in demand {
            if !targets.contains(&id) && run.arena.get(&id).is_some_and(Cursor::needs_fetch) {
                targets.push(id);
            }
        }
        if concurrency > 0 {
            for id in run.arena.fetchable() {
                if targets.len() >= concurrency {
                    break;
                }
                if !targets.contains(&id) {
                    targets.push(id);
                }
            }
        }

        let page_size = match (self.options.page_size(), run.pipeline.fetch_window()) {
            (Some(size), Some(window)) => Some(size.min(window).max(1)),
            (None, Some(window)) => Some(window.max(1)),
            (size, None) => size,
        };
        let requests: Vec<(RangeId, FetchRequest)> = targets
            .iter()
            .filter_map(|id| {
                let cursor = run.arena.get(id)?;
                Some((id.clone(), self.request_for(run, cursor, page_size)))
            })
            .collect();

        let results: Vec<(RangeId, std::result::Result<RemotePage, FetchError>)> =
            if concurrency <= 1 {
                let mut results = Vec::with_capacity(requests.len());
                for (id, request) in requests {
                    let result = self.fetcher.fetch(request).await;
                    let failed = matches!(&result, Err(err) if *err != FetchError::Gone);
                    results.push((id, result));
                    if failed {
                        break;
                    }
                }
                results
            } else {
                let mut results: Vec<_> = stream::iter(requests.into_iter().enumerate())
                    .map(|(index, (id, request))| {
                        let fetcher = Arc::clone(&self.fetcher);
                        async move { (index, id, fetcher.fetch(request).await) }
                    })
                    .buffer_unordered(concurrency)
                    .collect()
                    .await;
                results.sort_by_key(|(index, _, _)| *index);
                results
                    .into_iter()
                    .map(|(_, id, result)| (id, result))
                    .collect()
            };

        for (id, result) in results {
            match result {
                Ok(page) => {
                    stats.record(&page.stats);
                    debug!(
                        range = %id,
                        items = page.items.len(),
                        request_charge = page.stats.request_charge,
                        has_more = page.continuation.is_some(),
                        "query.fetch.page"
                    );
                    run.arena.receive(&id, page);
                }
                Err(FetchError::Gone) => self.split(run, &id, stats).await?,
                Err(err) => return Err(err.into_query_error(&id)),
            }
        }
        Ok(())
    }

    async fn split(&self, run: &mut Running, id: &RangeId, stats: &mut ReadStats) -> Result<()> {
        let attempt = stats.split_attempts.get(id).copied().unwrap_or(0) + 1;
        if attempt > self.options.max_split_retries {
            return Err(QueryError::PartitionGone { range: id.clone() });
        }
        let Some(parent) = run.arena.get(id).map(|cursor| cursor.range().clone()) else {
            return Ok(());
        };
        let topology = self
            .topology
            .partition_ranges(true)
            .await
            .map_err(QueryError::Topology)?;
        let successors = run.filter.retain(topology.successors(&parent));
        if successors.is_empty() {
            return Err(QueryError::PartitionGone { range: id.clone() });
        }
        let children = run.arena.replace_with_children(id, successors);
        for child in &children {
            stats.split_attempts.insert(child.clone(), attempt);
        }
        info!(
            range = %id,
            children = ?children,
            attempt,
            "query.range.split"
        );
        self.diagnostics.record_split(id.clone(), children.clone());
        if run.kind == PipelineKind::SingleRoundtripOptimisticExecution {
            debug!(range = %id, "query.pipeline.fallback");
            self.diagnostics.record_fallback(format!(
                "range {id} split during optimistic direct execution; continuing over {} range(s)",
                children.len()
            ));
        }
        Ok(())
    }
}
