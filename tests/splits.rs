#![allow(missing_docs)]

use std::sync::{Arc, Once};

use docquery::memory::{InMemoryContainer, LocalQuery};
use docquery::query::{
    CancelToken, FeedIterator, PartitionKey, PipelineKind, QueryOptions, QueryPlan, SortOrder,
};
use docquery::types::RangeId;
use docquery::QueryError;
use serde_json::{json, Value};
use tracing_subscriber::EnvFilter;

fn init_tracing() {
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let filter = EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new("docquery=info"));
        let _ = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .with_ansi(false)
            .try_init();
    });
}

fn seeded(partitions: usize, count: usize) -> InMemoryContainer {
    let container = InMemoryContainer::new("pk", partitions);
    container
        .extend((0..count).map(|i| {
            json!({
                "id": format!("doc-{i}"),
                "pk": format!("pk-{}", i % 11),
                "n": i,
            })
        }))
        .unwrap();
    container
}

fn ordered() -> QueryPlan {
    QueryPlan::new("SELECT * FROM r ORDER BY r.n").order_by("r.n", SortOrder::Ascending)
}

fn feed(container: &InMemoryContainer, plan: &QueryPlan, options: QueryOptions) -> FeedIterator {
    let fetcher = Arc::new(container.query(plan, LocalQuery::all()));
    FeedIterator::new(plan.clone(), options, fetcher, Arc::new(container.clone())).unwrap()
}

async fn rest(feed: &mut FeedIterator) -> Result<Vec<Value>, docquery::FeedError> {
    let cancel = CancelToken::new();
    let mut items = Vec::new();
    while feed.has_more_results() {
        items.extend(feed.read_next_page(&cancel).await?.items);
    }
    Ok(items)
}

fn numbers(items: &[Value]) -> Vec<i64> {
    items.iter().map(|item| item["n"].as_i64().unwrap()).collect()
}

fn sorted(mut values: Vec<i64>) -> Vec<i64> {
    values.sort_unstable();
    values
}

#[tokio::test]
async fn split_between_pages_keeps_order_and_completeness() {
    init_tracing();
    let container = seeded(2, 100);
    let plan = ordered();
    let mut feed = feed(&container, &plan, QueryOptions::default().with_max_item_count(15));

    let mut items = feed.read_next_page(&CancelToken::new()).await.unwrap().items;
    for range in container.ranges() {
        container.split(&range.id).unwrap();
    }
    items.extend(rest(&mut feed).await.unwrap());

    assert_eq!(numbers(&items), (0..100).collect::<Vec<_>>());
    let snapshot = feed.diagnostics().snapshot();
    assert!(!snapshot.splits.is_empty());
    assert!(snapshot.splits.iter().all(|split| split.children.len() == 2));
}

#[tokio::test]
async fn split_on_first_fetch_is_reresolved() {
    let container = seeded(3, 90);
    let first = container.ranges()[0].id.clone();
    container.split_on_next_fetch(&first);
    let mut feed = feed(
        &container,
        &QueryPlan::new("SELECT * FROM r"),
        QueryOptions::serial().with_max_item_count(8),
    );

    let items = rest(&mut feed).await.unwrap();
    assert_eq!(sorted(numbers(&items)), (0..90).collect::<Vec<_>>());
    let splits = feed.diagnostics().snapshot().splits;
    assert_eq!(splits.len(), 1);
    assert_eq!(splits[0].parent, first);
    assert_eq!(container.ranges().len(), 4);
}

#[tokio::test]
async fn resuming_a_token_after_splits_replays_skipped_items_once() {
    init_tracing();
    for plan in [QueryPlan::new("SELECT * FROM r"), ordered()] {
        let container = seeded(2, 80);
        let options = QueryOptions::default().with_max_item_count(7);
        let expected = rest(&mut feed(&container, &plan, options.clone())).await.unwrap();

        let mut first = feed(&container, &plan, options.clone());
        let cancel = CancelToken::new();
        let mut items = first.read_next_page(&cancel).await.unwrap().items;
        items.extend(first.read_next_page(&cancel).await.unwrap().items);
        let token = first.continuation().map(str::to_owned);
        assert!(token.is_some());

        for range in container.ranges() {
            container.split(&range.id).unwrap();
        }
        let (left, _) = container.split(&container.ranges()[0].id).unwrap();
        assert!(container.ranges().iter().any(|range| range.id == left));

        let mut resumed = feed(&container, &plan, options.with_continuation(token));
        items.extend(rest(&mut resumed).await.unwrap());
        assert_eq!(items, expected, "{}", plan.query);
        assert!(!resumed.diagnostics().snapshot().splits.is_empty());
    }
}

#[tokio::test]
async fn optimistic_execution_falls_back_after_a_split() {
    let container = seeded(2, 110);
    let key = PartitionKey::new("pk-3");
    let owner = container.range_for(&key).unwrap();
    container.split_on_next_fetch(&owner.id);
    let plan = QueryPlan::new("SELECT * FROM r");
    let fetcher = Arc::new(container.query(&plan, LocalQuery::all()));
    let mut feed = FeedIterator::new(
        plan,
        QueryOptions::optimistic(key).with_max_item_count(4),
        fetcher,
        Arc::new(container.clone()),
    )
    .unwrap();

    let items = rest(&mut feed).await.unwrap();
    assert_eq!(
        sorted(numbers(&items)),
        (0..110).filter(|i| i % 11 == 3).collect::<Vec<_>>()
    );
    let snapshot = feed.diagnostics().snapshot();
    assert_eq!(snapshot.pipeline, Some(PipelineKind::SingleRoundtripOptimisticExecution));
    assert!(snapshot.fallback.is_some());
    assert_eq!(snapshot.splits.len(), 1);
    assert_eq!(snapshot.splits[0].children.len(), 1);
}

#[tokio::test]
async fn repeated_splits_respect_the_retry_budget() {
    let chain = |budget: usize| {
        let container = seeded(1, 40);
        container.split_on_next_fetch(&RangeId::from("0"));
        container.split_on_next_fetch(&RangeId::from("1"));
        let mut options = QueryOptions::serial().with_max_item_count(10);
        options.max_split_retries = budget;
        (container, options)
    };

    let (container, options) = chain(1);
    let mut exhausted = feed(&container, &QueryPlan::new("SELECT * FROM r"), options);
    let err = rest(&mut exhausted).await.unwrap_err();
    assert_eq!(
        err.kind(),
        &QueryError::PartitionGone {
            range: RangeId::from("1")
        }
    );
    assert_eq!(err.code(), "PartitionGone");

    let (container, options) = chain(3);
    let mut recovered = feed(&container, &QueryPlan::new("SELECT * FROM r"), options);
    let items = rest(&mut recovered).await.unwrap();
    assert_eq!(sorted(numbers(&items)), (0..40).collect::<Vec<_>>());
    assert_eq!(recovered.diagnostics().snapshot().splits.len(), 2);
}
