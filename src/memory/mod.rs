//! In-process partitioned container.
//!
//! [`InMemoryContainer`] stores JSON documents, hashes each document's
//! partition key into the effective key space, and serves both collaborator
//! seams of the query pipeline: topology lookup and per-range page fetches.
//! Ranges can be split at runtime and failures injected per range, which makes
//! it the harness for integration tests and the backing store of the CLI.

pub mod eval;
pub mod scoring;

use std::cmp::Ordering;
use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use thiserror::Error;
use tracing::debug;

use crate::query::fetch::{
    FetchError, FetchRequest, FetchStats, PageFetcher, RemoteItem, RemotePage, StatisticsPage,
};
use crate::query::plan::{AggregateKind, AggregateSpec, QueryPlan};
use crate::query::topology::{PartitionKey, PartitionRange, Topology, TopologyProvider};
use crate::query::value::{compare_order_by, compare_values, hash_value, SortKey};
use crate::types::{Epk, EpkRange, RangeId};

pub use eval::{evaluate, Condition, LocalQuery, Operator, Projection};
use scoring::Scorer;

/// Items per range page when the request does not ask for a size.
pub const DEFAULT_RANGE_PAGE_SIZE: usize = 100;

const BASE_REQUEST_CHARGE: f64 = 2.5;
const PER_ITEM_CHARGE: f64 = 0.05;

/// Errors raised while loading or reshaping the container.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum ContainerError {
    /// Documents must be JSON objects.
    #[error("document is not an object")]
    NotAnObject,
    /// Documents need a string `id`.
    #[error("document has no string id")]
    MissingId,
    /// The `(partition key, id)` pair already exists.
    #[error("document {0} already exists")]
    Duplicate(String),
    /// No range with that id exists.
    #[error("unknown partition range {0}")]
    UnknownRange(RangeId),
    /// The range spans a single key and cannot be split.
    #[error("partition range {0} is too small to split")]
    RangeTooSmall(RangeId),
}

#[derive(Clone, Debug)]
struct StoredDocument {
    epk: Epk,
    id: String,
    body: Value,
}

#[derive(Clone, Debug)]
enum Injected {
    Error(FetchError),
    SplitThenGone,
}

#[derive(Debug, Default)]
struct ContainerState {
    partitioned: bool,
    ranges: Vec<PartitionRange>,
    next_range_id: u64,
    documents: Vec<StoredDocument>,
    injected: HashMap<RangeId, VecDeque<Injected>>,
    topology_failures: VecDeque<FetchError>,
    fetches: HashMap<RangeId, usize>,
    topology_reads: usize,
}

impl ContainerState {
    fn split(&mut self, id: &RangeId) -> Result<(RangeId, RangeId), ContainerError> {
        let index = self
            .ranges
            .iter()
            .position(|range| &range.id == id)
            .ok_or_else(|| ContainerError::UnknownRange(id.clone()))?;
        let span = self.ranges[index].span;
        if span.max.0 - span.min.0 < 2 {
            return Err(ContainerError::RangeTooSmall(id.clone()));
        }
        let mid = span.min.0 + (span.max.0 - span.min.0) / 2;
        let left = RangeId(self.next_range_id.to_string());
        let right = RangeId((self.next_range_id + 1).to_string());
        self.next_range_id += 2;
        self.ranges.splice(
            index..=index,
            [
                PartitionRange::new(left.clone(), EpkRange::new(span.min.0, mid)),
                PartitionRange::new(right.clone(), EpkRange::new(mid, span.max.0)),
            ],
        );
        debug!(range = %id, left = %left, right = %right, "memory.range.split");
        Ok((left, right))
    }
}

/// Partitioned JSON document store living in process memory.
///
/// Clones share the same data.
#[derive(Clone, Debug)]
pub struct InMemoryContainer {
    partition_key_path: Arc<str>,
    latency: Arc<Mutex<Duration>>,
    state: Arc<Mutex<ContainerState>>,
}

impl InMemoryContainer {
    /// Partitioned container with `partitions` equal ranges (at least one).
    pub fn new(partition_key_path: &str, partitions: usize) -> Self {
        let partitions = partitions.max(1) as u64;
        let width = Epk::MAX.0 / partitions;
        let ranges = (0..partitions)
            .map(|index| {
                let max = if index + 1 == partitions {
                    Epk::MAX.0
                } else {
                    (index + 1) * width
                };
                PartitionRange::new(index.to_string(), EpkRange::new(index * width, max))
            })
            .collect();
        Self {
            partition_key_path: Arc::from(partition_key_path),
            latency: Arc::new(Mutex::new(Duration::ZERO)),
            state: Arc::new(Mutex::new(ContainerState {
                partitioned: true,
                ranges,
                next_range_id: partitions,
                ..ContainerState::default()
            })),
        }
    }

    /// Container without a partition key definition: one range, passthrough only.
    pub fn unpartitioned() -> Self {
        let container = Self::new("", 1);
        container.state.lock().partitioned = false;
        container
    }

    /// Delay applied to every fetch.
    pub fn set_latency(&self, latency: Duration) {
        *self.latency.lock() = latency;
    }

    /// Partition key of a document; a missing key hashes like `null`.
    pub fn partition_key_of(&self, document: &Value) -> PartitionKey {
        let value = if self.partition_key_path.is_empty() {
            None
        } else {
            evaluate(document, &self.partition_key_path)
        };
        PartitionKey(value.cloned().unwrap_or(Value::Null))
    }

    /// Stores one document.
    pub fn insert(&self, document: Value) -> Result<(), ContainerError> {
        if !document.is_object() {
            return Err(ContainerError::NotAnObject);
        }
        let id = document
            .get("id")
            .and_then(Value::as_str)
            .ok_or(ContainerError::MissingId)?
            .to_owned();
        let epk = self.partition_key_of(&document).effective();
        let mut state = self.state.lock();
        if state
            .documents
            .iter()
            .any(|stored| stored.epk == epk && stored.id == id)
        {
            return Err(ContainerError::Duplicate(id));
        }
        state.documents.push(StoredDocument {
            epk,
            id,
            body: document,
        });
        Ok(())
    }

    /// Stores every document, stopping at the first failure.
    pub fn extend(&self, documents: impl IntoIterator<Item = Value>) -> Result<usize, ContainerError> {
        let mut count = 0;
        for document in documents {
            self.insert(document)?;
            count += 1;
        }
        Ok(count)
    }

    /// Number of stored documents.
    pub fn len(&self) -> usize {
        self.state.lock().documents.len()
    }

    /// True when nothing is stored.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Current ranges in key order.
    pub fn ranges(&self) -> Vec<PartitionRange> {
        self.state.lock().ranges.clone()
    }

    /// Range owning `key`.
    pub fn range_for(&self, key: &PartitionKey) -> Option<PartitionRange> {
        let epk = key.effective();
        self.state
            .lock()
            .ranges
            .iter()
            .find(|range| range.span.contains(epk))
            .cloned()
    }

    /// Splits `id` at its midpoint; later fetches of `id` report `Gone`.
    pub fn split(&self, id: &RangeId) -> Result<(RangeId, RangeId), ContainerError> {
        self.state.lock().split(id)
    }

    /// Makes the next fetch of `range` split it and report `Gone`.
    pub fn split_on_next_fetch(&self, range: &RangeId) {
        self.state
            .lock()
            .injected
            .entry(range.clone())
            .or_default()
            .push_back(Injected::SplitThenGone);
    }

    /// Makes the next fetch of `range` fail with `error`.
    pub fn inject_failure(&self, range: &RangeId, error: FetchError) {
        self.state
            .lock()
            .injected
            .entry(range.clone())
            .or_default()
            .push_back(Injected::Error(error));
    }

    /// Makes the next topology read fail with `error`.
    pub fn inject_topology_failure(&self, error: FetchError) {
        self.state.lock().topology_failures.push_back(error);
    }

    /// Fetches issued against `range`, including failed ones.
    pub fn fetch_count(&self, range: &RangeId) -> usize {
        self.state.lock().fetches.get(range).copied().unwrap_or(0)
    }

    /// Fetches issued against all ranges.
    pub fn total_fetches(&self) -> usize {
        self.state.lock().fetches.values().sum()
    }

    /// Topology reads served.
    pub fn topology_reads(&self) -> usize {
        self.state.lock().topology_reads
    }

    /// Fetch collaborator evaluating `local` under `plan` on each range.
    pub fn query(&self, plan: &QueryPlan, local: LocalQuery) -> ContainerQuery {
        ContainerQuery {
            container: self.clone(),
            plan: Arc::new(plan.clone()),
            local: Arc::new(local),
        }
    }
}

#[async_trait]
impl TopologyProvider for InMemoryContainer {
    async fn partition_ranges(&self, _force_refresh: bool) -> Result<Topology, FetchError> {
        let mut state = self.state.lock();
        state.topology_reads += 1;
        if let Some(error) = state.topology_failures.pop_front() {
            return Err(error);
        }
        Ok(Topology::new(state.partitioned, state.ranges.clone()))
    }
}

/// Position of a document within one range's result order; serialized as
/// the range continuation.
#[derive(Clone, Debug, Serialize, Deserialize)]
struct ResumeKey {
    #[serde(rename = "k", default)]
    order_by: Vec<Value>,
    #[serde(rename = "e")]
    epk: Epk,
    #[serde(rename = "i")]
    id: String,
}

/// A query bound to an [`InMemoryContainer`]; implements [`PageFetcher`].
#[derive(Clone, Debug)]
pub struct ContainerQuery {
    container: InMemoryContainer,
    plan: Arc<QueryPlan>,
    local: Arc<LocalQuery>,
}

impl ContainerQuery {
    fn order_values(&self, document: &Value) -> Vec<Value> {
        self.plan
            .order_by
            .iter()
            .map(|key| evaluate(document, &key.expression).cloned().unwrap_or(Value::Null))
            .collect()
    }

    fn compare_keys(&self, left: &ResumeKey, right: &ResumeKey) -> Ordering {
        compare_order_by(&left.order_by, &right.order_by, &self.plan.sort_orders())
            .then(left.epk.cmp(&right.epk))
            .then_with(|| left.id.cmp(&right.id))
    }

    fn rows(&self, documents: Vec<StoredDocument>, request: &FetchRequest) -> Result<RemotePage, FetchError> {
        let resume = match &request.continuation {
            Some(raw) => Some(
                serde_json::from_str::<ResumeKey>(raw)
                    .map_err(|err| FetchError::BadRequest(format!("invalid continuation: {err}")))?,
            ),
            None => None,
        };
        let mut keyed: Vec<(ResumeKey, StoredDocument)> = documents
            .into_iter()
            .map(|doc| {
                let key = ResumeKey {
                    order_by: self.order_values(&doc.body),
                    epk: doc.epk,
                    id: doc.id.clone(),
                };
                (key, doc)
            })
            .filter(|(key, _)| {
                resume
                    .as_ref()
                    .map_or(true, |after| self.compare_keys(key, after) == Ordering::Greater)
            })
            .collect();
        keyed.sort_by(|a, b| self.compare_keys(&a.0, &b.0));

        let size = request.page_size.unwrap_or(DEFAULT_RANGE_PAGE_SIZE).max(1);
        let has_more = keyed.len() > size;
        keyed.truncate(size);
        let continuation = match (has_more, keyed.last()) {
            (true, Some((key, _))) => Some(
                serde_json::to_string(key)
                    .map_err(|err| FetchError::BadRequest(format!("continuation: {err}")))?,
            ),
            _ => None,
        };
        let scorer = self
            .plan
            .hybrid
            .as_ref()
            .map(|hybrid| Scorer::new(hybrid, request.statistics.as_deref()))
            .transpose()?;
        let items = keyed
            .into_iter()
            .map(|(key, doc)| RemoteItem {
                payload: self.local.projection.apply(&doc.body),
                order_by: key.order_by,
                rid: scorer.as_ref().map(|_| format!("{}.{}", doc.epk, doc.id)),
                component_scores: scorer
                    .as_ref()
                    .map_or_else(Vec::new, |scorer| scorer.scores(&doc.body)),
                ..RemoteItem::default()
            })
            .collect();
        Ok(RemotePage {
            items,
            continuation,
            stats: FetchStats::default(),
        })
    }

    fn partials(&self, documents: &[StoredDocument]) -> RemotePage {
        let mut groups: BTreeMap<SortKey, (Value, Vec<&Value>)> = BTreeMap::new();
        for doc in documents {
            let key = SortKey(
                self.plan
                    .group_by
                    .iter()
                    .map(|expr| evaluate(&doc.body, expr).cloned().unwrap_or(Value::Null))
                    .collect(),
            );
            groups
                .entry(key)
                .or_insert_with(|| (self.local.projection.apply(&doc.body), Vec::new()))
                .1
                .push(&doc.body);
        }
        if groups.is_empty() && !self.plan.has_group_by() {
            groups.insert(SortKey::default(), (Value::Null, Vec::new()));
        }
        let items = groups
            .into_iter()
            .map(|(key, (payload, members))| RemoteItem {
                payload,
                group_by: key.0,
                aggregates: self
                    .plan
                    .aggregates
                    .iter()
                    .map(|spec| partial(spec, &members))
                    .collect(),
                ..RemoteItem::default()
            })
            .collect();
        RemotePage {
            items,
            continuation: None,
            stats: FetchStats::default(),
        }
    }
}

fn partial(spec: &AggregateSpec, members: &[&Value]) -> Value {
    let values: Vec<&Value> = match &spec.expression {
        Some(expr) => members
            .iter()
            .filter_map(|doc| evaluate(doc, expr))
            .filter(|value| !value.is_null())
            .collect(),
        None => members.to_vec(),
    };
    match spec.kind {
        AggregateKind::Count => json!(values.len()),
        AggregateKind::Sum => {
            if let Some(bad) = values.iter().find(|value| !value.is_number()) {
                return (*bad).clone();
            }
            if values.is_empty() {
                return Value::Null;
            }
            json!(values.iter().filter_map(|value| value.as_f64()).sum::<f64>())
        }
        AggregateKind::Min => values
            .iter()
            .min_by(|a, b| compare_values(a, b))
            .map_or(Value::Null, |value| (*value).clone()),
        AggregateKind::Max => values
            .iter()
            .max_by(|a, b| compare_values(a, b))
            .map_or(Value::Null, |value| (*value).clone()),
        AggregateKind::Avg => {
            let numbers: Vec<f64> = values.iter().filter_map(|value| value.as_f64()).collect();
            if numbers.is_empty() {
                Value::Null
            } else {
                json!({ "sum": numbers.iter().sum::<f64>(), "count": numbers.len() })
            }
        }
        AggregateKind::CountIf => json!(values.iter().filter(|value| value.as_bool() == Some(true)).count()),
        AggregateKind::MakeList => Value::Array(values.into_iter().cloned().collect()),
        AggregateKind::MakeSet => {
            let mut seen = HashSet::new();
            Value::Array(
                values
                    .into_iter()
                    .filter(|value| seen.insert(hash_value(value)))
                    .cloned()
                    .collect(),
            )
        }
    }
}

impl ContainerQuery {
    /// Documents of `request.range` that pass the partition key and filter,
    /// plus how many documents the range scan touched.
    async fn select(&self, request: &FetchRequest) -> Result<(Vec<StoredDocument>, usize), FetchError> {
        let latency = *self.container.latency.lock();
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }
        let mut state = self.container.state.lock();
        *state.fetches.entry(request.range.id.clone()).or_default() += 1;
        let injected = state
            .injected
            .get_mut(&request.range.id)
            .and_then(VecDeque::pop_front);
        match injected {
            Some(Injected::Error(error)) => return Err(error),
            Some(Injected::SplitThenGone) => {
                state
                    .split(&request.range.id)
                    .map_err(|err| FetchError::BadRequest(err.to_string()))?;
                return Err(FetchError::Gone);
            }
            None => {}
        }
        let Some(owner) = state
            .ranges
            .iter()
            .find(|range| range.id == request.range.id)
        else {
            return Err(FetchError::Gone);
        };
        let span = EpkRange {
            min: owner.span.min.max(request.range.span.min),
            max: owner.span.max.min(request.range.span.max),
        };
        let point = request.partition_key.as_ref().map(|key| (key, key.effective()));
        let mut scanned = 0usize;
        let documents: Vec<StoredDocument> = state
            .documents
            .iter()
            .filter(|doc| span.contains(doc.epk))
            .inspect(|_| scanned += 1)
            .filter(|doc| match &point {
                Some((key, epk)) => {
                    doc.epk == *epk && self.container.partition_key_of(&doc.body) == **key
                }
                None => true,
            })
            .filter(|doc| self.local.matches(&doc.body))
            .cloned()
            .collect();
        Ok((documents, scanned))
    }

    fn charge(scanned: usize) -> f64 {
        BASE_REQUEST_CHARGE + PER_ITEM_CHARGE * scanned as f64
    }
}

#[async_trait]
impl PageFetcher for ContainerQuery {
    async fn fetch(&self, request: FetchRequest) -> Result<RemotePage, FetchError> {
        let started = Instant::now();
        let (documents, scanned) = self.select(&request).await?;
        let matched = documents.len();
        let mut page = if self.plan.has_group_by() || self.plan.has_aggregates() {
            self.partials(&documents)
        } else {
            self.rows(documents, &request)?
        };
        page.stats = FetchStats {
            request_charge: Self::charge(scanned),
            item_count: page.items.len(),
            duration: started.elapsed(),
            index_metrics: request.populate_index_metrics.then(|| {
                json!({
                    "range": request.range.id,
                    "scanned": scanned,
                    "matched": matched,
                    "filters": self.local.filter.len(),
                })
                .to_string()
            }),
            query_advice: (request.populate_index_metrics
                && self.local.filter.iter().any(|c| c.op == Operator::Ne))
            .then(|| "prefer equality or range filters over '!=' for index use".to_owned()),
        };
        Ok(page)
    }

    async fn full_text_statistics(&self, request: FetchRequest) -> Result<StatisticsPage, FetchError> {
        let Some(hybrid) = &self.plan.hybrid else {
            return Err(FetchError::BadRequest("query has no hybrid search".into()));
        };
        let started = Instant::now();
        let (documents, scanned) = self.select(&request).await?;
        let statistics = scoring::statistics(hybrid, documents.iter().map(|doc| &doc.body));
        Ok(StatisticsPage {
            statistics,
            stats: FetchStats {
                request_charge: Self::charge(scanned),
                item_count: 1,
                duration: started.elapsed(),
                ..FetchStats::default()
            },
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::query::fetch::GlobalStatistics;
    use crate::query::plan::{RankComponent, SortOrder};

    fn request(range: PartitionRange, continuation: Option<String>, size: usize) -> FetchRequest {
        FetchRequest {
            continuation,
            page_size: Some(size),
            ..FetchRequest::new(range)
        }
    }

    fn seeded(partitions: usize, count: usize) -> InMemoryContainer {
        let container = InMemoryContainer::new("pk", partitions);
        container
            .extend((0..count).map(|i| json!({"id": format!("{i}"), "pk": format!("p{i}"), "n": i})))
            .unwrap();
        container
    }

    #[tokio::test]
    async fn ranges_partition_the_documents() {
        let container = seeded(4, 100);
        let query = container.query(&QueryPlan::new("SELECT * FROM r"), LocalQuery::all());
        let mut total = 0;
        for range in container.ranges() {
            let page = query.fetch(request(range, None, 1000)).await.unwrap();
            assert!(page.continuation.is_none());
            total += page.items.len();
        }
        assert_eq!(total, 100);
        assert_eq!(container.total_fetches(), 4);
    }

    #[tokio::test]
    async fn split_children_continue_the_parent_sequence() {
        let container = seeded(1, 50);
        let plan = QueryPlan::new("q").order_by("r.n", SortOrder::Descending);
        let query = container.query(&plan, LocalQuery::all());
        let parent = container.ranges().remove(0);
        let first = query.fetch(request(parent.clone(), None, 10)).await.unwrap();
        let values: Vec<i64> = first.items.iter().map(|i| i.payload["n"].as_i64().unwrap()).collect();
        assert_eq!(values, (40..50).rev().collect::<Vec<_>>());

        container.split(&parent.id).unwrap();
        assert_eq!(
            query.fetch(request(parent, first.continuation.clone(), 10)).await,
            Err(FetchError::Gone)
        );
        let mut rest = Vec::new();
        for child in container.ranges() {
            let page = query
                .fetch(request(child, first.continuation.clone(), 100))
                .await
                .unwrap();
            rest.extend(page.items.iter().map(|i| i.payload["n"].as_i64().unwrap()));
        }
        rest.sort_unstable();
        assert_eq!(rest, (0..40).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn aggregates_return_one_partial_per_group() {
        let container = seeded(1, 10);
        let plan = QueryPlan::new("q")
            .aggregate(AggregateKind::Avg, Some("r.n"), None)
            .select_value();
        let query = container.query(&plan, LocalQuery::all());
        let page = query
            .fetch(request(container.ranges().remove(0), None, 1))
            .await
            .unwrap();
        assert_eq!(page.items.len(), 1);
        assert_eq!(page.items[0].aggregates, vec![json!({"sum": 45.0, "count": 10})]);
    }

    #[tokio::test]
    async fn list_and_conditional_partials() {
        let container = InMemoryContainer::new("pk", 1);
        container
            .extend((0..6).map(|i| {
                json!({"id": format!("{i}"), "pk": "p", "tag": (["a", "b", "a"][i % 3]), "hot": i % 2 == 0})
            }))
            .unwrap();
        let plan = QueryPlan::new("q")
            .group_by("r.pk")
            .aggregate(AggregateKind::MakeList, Some("r.tag"), Some("tags"))
            .aggregate(AggregateKind::MakeSet, Some("r.tag"), Some("set"))
            .aggregate(AggregateKind::CountIf, Some("r.hot"), Some("hot"));
        let query = container.query(&plan, LocalQuery::all());
        let page = query
            .fetch(request(container.ranges().remove(0), None, 10))
            .await
            .unwrap();
        assert_eq!(
            page.items[0].aggregates,
            vec![json!(["a", "b", "a", "a", "b", "a"]), json!(["a", "b"]), json!(3)]
        );
    }

    #[tokio::test]
    async fn hybrid_rows_carry_rids_and_scores() {
        let container = InMemoryContainer::new("pk", 2);
        container
            .extend([
                json!({"id": "1", "pk": "a", "body": "red fox"}),
                json!({"id": "2", "pk": "b", "body": "blue whale"}),
                json!({"id": "3", "pk": "c", "body": "fox den"}),
            ])
            .unwrap();
        let plan = QueryPlan::new("q")
            .rank_fusion(vec![RankComponent::FullText {
                path: "r.body".into(),
                terms: vec!["fox".into()],
            }])
            .top(2);
        let query = container.query(&plan, LocalQuery::all());

        let mut total: Option<GlobalStatistics> = None;
        for range in container.ranges() {
            let page = query.full_text_statistics(FetchRequest::new(range)).await.unwrap();
            match &mut total {
                Some(total) => total.merge(&page.statistics).unwrap(),
                None => total = Some(page.statistics),
            }
        }
        let total = total.unwrap();
        assert_eq!(total.document_count, 3);
        assert_eq!(total.full_text[0].total_word_count, 6);
        assert_eq!(total.full_text[0].hit_counts, vec![2]);

        let range = container.ranges().remove(0);
        assert!(query.fetch(request(range.clone(), None, 10)).await.is_err());
        let page = query
            .fetch(FetchRequest {
                statistics: Some(Arc::new(total)),
                ..request(range, None, 10)
            })
            .await
            .unwrap();
        for item in &page.items {
            let id = item.payload["id"].as_str().unwrap();
            assert!(item.rid.as_deref().unwrap().ends_with(id));
            let score = item.component_scores[0].as_f64().unwrap();
            assert_eq!(score > 0.0, id != "2");
        }

        let plain = container.query(&QueryPlan::new("q"), LocalQuery::all());
        assert!(plain
            .full_text_statistics(FetchRequest::new(container.ranges().remove(0)))
            .await
            .is_err());
    }

    #[tokio::test]
    async fn injected_failures_fire_once() {
        let container = seeded(2, 10);
        let range = container.ranges().remove(0);
        container.inject_failure(&range.id, FetchError::Throttled { retry_after: None });
        let query = container.query(&QueryPlan::new("q"), LocalQuery::all());
        assert!(matches!(
            query.fetch(request(range.clone(), None, 5)).await,
            Err(FetchError::Throttled { .. })
        ));
        assert!(query.fetch(request(range.clone(), None, 5)).await.is_ok());
        assert_eq!(container.fetch_count(&range.id), 2);
    }

    #[test]
    fn rejects_invalid_documents() {
        let container = InMemoryContainer::new("pk", 2);
        assert_eq!(container.insert(json!(1)), Err(ContainerError::NotAnObject));
        assert_eq!(container.insert(json!({"pk": 1})), Err(ContainerError::MissingId));
        container.insert(json!({"id": "a", "pk": 1})).unwrap();
        assert_eq!(
            container.insert(json!({"id": "a", "pk": 1})),
            Err(ContainerError::Duplicate("a".into()))
        );
        container.insert(json!({"id": "a", "pk": 2})).unwrap();
    }
}
