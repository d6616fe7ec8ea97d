#![allow(missing_docs)]

use std::sync::Arc;

use docquery::memory::{InMemoryContainer, LocalQuery};
use docquery::query::selector::resolve;
use docquery::query::{
    AggregateKind, CancelToken, DistinctKind, FeedIterator, MergeStrategy, PartitionKey,
    PipelineKind, QueryOptions, QueryPlan, SortOrder,
};
use docquery::types::{Epk, EpkRange};
use serde_json::json;

fn seeded() -> InMemoryContainer {
    let container = InMemoryContainer::new("tenant", 4);
    container
        .extend((0..120).map(|i| {
            json!({
                "id": format!("{i}"),
                "tenant": format!("tenant-{}", i % 6),
                "n": i,
            })
        }))
        .unwrap();
    container
}

async fn kind_of(container: &InMemoryContainer, plan: &QueryPlan, options: &QueryOptions) -> PipelineKind {
    resolve(plan, options, container).await.unwrap().kind
}

#[tokio::test]
async fn cross_partition_variants() {
    let container = seeded();
    let options = QueryOptions::default();
    let scan = QueryPlan::new("SELECT * FROM r");

    assert_eq!(
        kind_of(&container, &scan, &options).await,
        PipelineKind::ParallelCrossPartition(MergeStrategy::Concatenate)
    );
    assert_eq!(
        kind_of(
            &container,
            &scan.clone().order_by("r.n", SortOrder::Ascending),
            &options
        )
        .await,
        PipelineKind::Specialized(MergeStrategy::OrderByMerge)
    );
    assert_eq!(
        kind_of(
            &container,
            &scan.clone().distinct(DistinctKind::Unordered),
            &options
        )
        .await,
        PipelineKind::Specialized(MergeStrategy::DistinctDedup)
    );
    assert_eq!(
        kind_of(
            &container,
            &scan
                .clone()
                .group_by("r.tenant")
                .aggregate(AggregateKind::Count, None, Some("c")),
            &options
        )
        .await,
        PipelineKind::Specialized(MergeStrategy::GroupByAggregate)
    );
    assert_eq!(
        kind_of(
            &container,
            &scan
                .clone()
                .order_by("r.n", SortOrder::Descending)
                .top(10)
                .non_streaming(),
            &options
        )
        .await,
        PipelineKind::Specialized(MergeStrategy::NonStreamingOrderBy)
    );
}

#[tokio::test]
async fn order_by_over_one_target_range_is_not_specialized() {
    let container = seeded();
    let range = container.ranges()[1].clone();
    let inner = EpkRange::new(range.span.min.0 + 1, range.span.max.0 - 1);
    let plan = QueryPlan::new("SELECT * FROM r WHERE r.tenant IN (...) ORDER BY r.n")
        .order_by("r.n", SortOrder::Ascending)
        .with_query_ranges(vec![inner]);

    let resolution = resolve(&plan, &QueryOptions::default(), &container)
        .await
        .unwrap();
    assert_eq!(
        resolution.kind,
        PipelineKind::ParallelCrossPartition(MergeStrategy::OrderByMerge)
    );
    assert_eq!(resolution.targets, vec![range]);
}

#[tokio::test]
async fn partition_key_selects_single_partition_variants() {
    let container = seeded();
    let key = PartitionKey::new("tenant-2");
    let scan = QueryPlan::new("SELECT * FROM r");

    assert_eq!(
        kind_of(&container, &scan, &QueryOptions::optimistic(key.clone())).await,
        PipelineKind::SingleRoundtripOptimisticExecution
    );
    let mut no_ode = QueryOptions::default().with_partition_key(key.clone());
    no_ode.enable_optimistic_direct_execution = false;
    assert_eq!(kind_of(&container, &scan, &no_ode).await, PipelineKind::TryExecute);
    assert_eq!(
        kind_of(
            &container,
            &scan.clone().order_by("r.n", SortOrder::Ascending),
            &QueryOptions::optimistic(key.clone())
        )
        .await,
        PipelineKind::TryExecute
    );

    let point = QueryPlan::new("SELECT * FROM r WHERE r.tenant = 'tenant-2'")
        .with_query_ranges(vec![EpkRange::point(key.effective())]);
    assert_eq!(
        kind_of(&container, &point, &QueryOptions::default()).await,
        PipelineKind::SingleRoundtripOptimisticExecution
    );
}

#[tokio::test]
async fn passthrough_for_forced_single_range_or_unpartitioned_collections() {
    let mut forced = QueryOptions::default();
    forced.force_passthrough = true;
    let container = seeded();
    let range = container.ranges()[2].clone();
    let plan = QueryPlan::new("SELECT * FROM r").order_by("r.n", SortOrder::Ascending);
    let narrowed = plan
        .clone()
        .with_query_ranges(vec![EpkRange::new(range.span.min.0 + 1, range.span.max.0 - 1)]);
    assert_eq!(kind_of(&container, &narrowed, &forced).await, PipelineKind::Passthrough);
    assert_eq!(
        kind_of(
            &InMemoryContainer::unpartitioned(),
            &plan,
            &QueryOptions::default()
        )
        .await,
        PipelineKind::Passthrough
    );
}

async fn drain_numbers(container: &InMemoryContainer, plan: QueryPlan, options: QueryOptions) -> Vec<i64> {
    let fetcher = Arc::new(container.query(&plan, LocalQuery::all()));
    let mut feed = FeedIterator::new(plan, options, fetcher, Arc::new(container.clone())).unwrap();
    let cancel = CancelToken::new();
    let mut numbers = Vec::new();
    while feed.has_more_results() {
        let page = feed.read_next_page(&cancel).await.unwrap();
        numbers.extend(page.items.iter().map(|item| item["n"].as_i64().unwrap()));
    }
    numbers
}

#[tokio::test]
async fn forced_passthrough_over_several_ranges_keeps_ordering() {
    let container = InMemoryContainer::new("tenant", 4);
    container
        .extend((0..40).map(|i| json!({"id": format!("{i}"), "tenant": format!("t-{i}"), "n": i})))
        .unwrap();
    let mut forced = QueryOptions::default().with_max_item_count(7);
    forced.force_passthrough = true;

    let ascending = QueryPlan::new("SELECT * FROM r ORDER BY r.n").order_by("r.n", SortOrder::Ascending);
    assert_eq!(
        kind_of(&container, &ascending, &forced).await,
        PipelineKind::Specialized(MergeStrategy::OrderByMerge)
    );
    assert_eq!(
        drain_numbers(&container, ascending, forced.clone()).await,
        (0..40).collect::<Vec<_>>()
    );

    let top = QueryPlan::new("SELECT TOP 3 * FROM r ORDER BY r.n DESC")
        .order_by("r.n", SortOrder::Descending)
        .non_streaming()
        .top(3);
    assert_eq!(drain_numbers(&container, top, forced).await, vec![39, 38, 37]);
}

#[tokio::test]
async fn optimistic_execution_reads_only_the_owning_range() {
    let container = seeded();
    let key = PartitionKey::new("tenant-4");
    let owner = container.range_for(&key).unwrap();
    let plan = QueryPlan::new("SELECT * FROM r");
    let fetcher = Arc::new(container.query(&plan, LocalQuery::all()));
    let mut feed = FeedIterator::new(
        plan,
        QueryOptions::optimistic(key).with_max_item_count(-1),
        fetcher,
        Arc::new(container.clone()),
    )
    .unwrap();

    let page = feed.read_next_page(&CancelToken::new()).await.unwrap();
    assert_eq!(page.len(), 20);
    assert!(page.items.iter().all(|item| item["tenant"] == json!("tenant-4")));
    assert!(page.continuation.is_none());
    assert_eq!(container.total_fetches(), 1);
    assert_eq!(container.fetch_count(&owner.id), 1);
    assert_eq!(
        feed.diagnostics().pipeline(),
        Some(PipelineKind::SingleRoundtripOptimisticExecution)
    );
}

#[test]
fn partition_keys_hash_into_the_key_space() {
    for value in [json!("a"), json!(1), json!(null), json!([1, "x"])] {
        let epk = PartitionKey(value).effective();
        assert!(epk < Epk::MAX);
    }
    assert_eq!(
        PartitionKey::new("same").effective(),
        PartitionKey::new("same").effective()
    );
}
