//! Query plan: the capability descriptor produced by the external parser/binder.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{QueryError, Result};
use crate::types::EpkRange;

/// Direction of one ORDER BY key.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SortOrder {
    /// Smallest values first.
    #[default]
    #[serde(alias = "asc")]
    Ascending,
    /// Largest values first.
    #[serde(alias = "desc")]
    Descending,
}

/// One ORDER BY key.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderByKey {
    /// Sort expression as written in the query, e.g. `r.numberField`.
    pub expression: String,
    /// Sort direction.
    #[serde(default)]
    pub order: SortOrder,
}

/// DISTINCT flavor requested by the query.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DistinctKind {
    /// No DISTINCT.
    #[default]
    None,
    /// DISTINCT over an ORDER BY stream: duplicates are adjacent.
    Ordered,
    /// DISTINCT over an unordered stream.
    Unordered,
}

/// Aggregate functions the merge can finalize from per-range partials.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AggregateKind {
    /// `COUNT(...)`
    Count,
    /// `SUM(...)`
    Sum,
    /// `MIN(...)`
    Min,
    /// `MAX(...)`
    Max,
    /// `AVG(...)`
    Avg,
    /// `COUNTIF(...)`: documents whose argument is `true`.
    CountIf,
    /// `MAKELIST(...)`: every argument value.
    MakeList,
    /// `MAKESET(...)`: distinct argument values.
    MakeSet,
}

impl fmt::Display for AggregateKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            AggregateKind::Count => "COUNT",
            AggregateKind::Sum => "SUM",
            AggregateKind::Min => "MIN",
            AggregateKind::Max => "MAX",
            AggregateKind::Avg => "AVG",
            AggregateKind::CountIf => "COUNTIF",
            AggregateKind::MakeList => "MAKELIST",
            AggregateKind::MakeSet => "MAKESET",
        };
        f.write_str(name)
    }
}

/// One aggregate in the SELECT list.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AggregateSpec {
    /// Aggregate function.
    pub kind: AggregateKind,
    /// Argument expression; `None` means `COUNT(1)`.
    #[serde(default)]
    pub expression: Option<String>,
    /// Output property name when the query does not use `SELECT VALUE`.
    #[serde(default)]
    pub alias: Option<String>,
}

/// One ranking fused by a hybrid search.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RankComponent {
    /// Full-text relevance of `terms` in the text at `path`.
    FullText {
        /// Text expression, e.g. `r.body`.
        path: String,
        /// Search terms.
        terms: Vec<String>,
    },
    /// Similarity of the vector at `path` to `embedding`.
    Vector {
        /// Vector expression, e.g. `r.embedding`.
        path: String,
        /// Query vector.
        embedding: Vec<f64>,
    },
}

/// `ORDER BY RANK RRF(...)`: reciprocal-rank fusion over several rankings.
///
/// Each range returns one score per component; the merge ranks every
/// component globally and fuses the ranks.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct HybridSearch {
    /// Rankings in declaration order.
    pub components: Vec<RankComponent>,
}

impl HybridSearch {
    /// Full-text components in declaration order.
    pub fn full_text(&self) -> impl Iterator<Item = (&str, &[String])> {
        self.components.iter().filter_map(|component| match component {
            RankComponent::FullText { path, terms } => Some((path.as_str(), terms.as_slice())),
            RankComponent::Vector { .. } => None,
        })
    }

    /// True when scoring needs corpus statistics gathered from every range.
    pub fn requires_global_statistics(&self) -> bool {
        self.full_text().next().is_some()
    }
}

/// Payload encodings the executing client can consume.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SerializationFormat {
    /// Plain JSON text.
    Json,
    /// Vendor binary encoding.
    Binary,
}

/// Immutable description of what the merge must do for one query.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct QueryPlan {
    /// Query text sent to each range.
    pub query: String,
    /// ORDER BY keys in declaration order.
    #[serde(default)]
    pub order_by: Vec<OrderByKey>,
    /// `SELECT TOP n`.
    #[serde(default)]
    pub top: Option<u64>,
    /// `OFFSET n`.
    #[serde(default)]
    pub offset: Option<u64>,
    /// `LIMIT n`.
    #[serde(default)]
    pub limit: Option<u64>,
    /// DISTINCT flavor.
    #[serde(default)]
    pub distinct: DistinctKind,
    /// GROUP BY expressions.
    #[serde(default)]
    pub group_by: Vec<String>,
    /// Aggregates in the SELECT list.
    #[serde(default)]
    pub aggregates: Vec<AggregateSpec>,
    /// `SELECT VALUE` projection.
    #[serde(default)]
    pub select_value: bool,
    /// ORDER BY over a ranking function (vector distance, full-text score)
    /// whose per-range results cannot be streamed.
    #[serde(default)]
    pub non_streaming_order_by: bool,
    /// Hybrid search fusing several rankings.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hybrid: Option<HybridSearch>,
    /// Effective-partition-key spans the filter can match; empty means all.
    #[serde(default)]
    pub query_ranges: Vec<EpkRange>,
    /// Encodings supported for the query; empty means JSON.
    #[serde(default)]
    pub serialization_formats: Vec<SerializationFormat>,
}

impl QueryPlan {
    /// Starts a plan with no capabilities beyond a plain scan.
    pub fn new(query: impl Into<String>) -> Self {
        Self {
            query: query.into(),
            ..Self::default()
        }
    }

    /// Appends an ORDER BY key.
    pub fn order_by(mut self, expression: impl Into<String>, order: SortOrder) -> Self {
        self.order_by.push(OrderByKey {
            expression: expression.into(),
            order,
        });
        self
    }

    /// Sets `TOP n`.
    pub fn top(mut self, top: u64) -> Self {
        self.top = Some(top);
        self
    }

    /// Sets `OFFSET offset LIMIT limit`.
    pub fn offset_limit(mut self, offset: u64, limit: u64) -> Self {
        self.offset = Some(offset);
        self.limit = Some(limit);
        self
    }

    /// Sets the DISTINCT flavor.
    pub fn distinct(mut self, kind: DistinctKind) -> Self {
        self.distinct = kind;
        self
    }

    /// Appends a GROUP BY expression.
    pub fn group_by(mut self, expression: impl Into<String>) -> Self {
        self.group_by.push(expression.into());
        self
    }

    /// Appends an aggregate.
    pub fn aggregate(
        mut self,
        kind: AggregateKind,
        expression: Option<&str>,
        alias: Option<&str>,
    ) -> Self {
        self.aggregates.push(AggregateSpec {
            kind,
            expression: expression.map(str::to_owned),
            alias: alias.map(str::to_owned),
        });
        self
    }

    /// Marks the projection as `SELECT VALUE`.
    pub fn select_value(mut self) -> Self {
        self.select_value = true;
        self
    }

    /// Marks the ORDER BY as non-streaming.
    pub fn non_streaming(mut self) -> Self {
        self.non_streaming_order_by = true;
        self
    }

    /// Ranks results by fusing `components`.
    pub fn rank_fusion(mut self, components: Vec<RankComponent>) -> Self {
        self.hybrid = Some(HybridSearch { components });
        self
    }

    /// Restricts the plan to the given key spans.
    pub fn with_query_ranges(mut self, ranges: Vec<EpkRange>) -> Self {
        self.query_ranges = ranges;
        self
    }

    /// True when the query has ORDER BY keys.
    pub fn has_order_by(&self) -> bool {
        !self.order_by.is_empty()
    }

    /// True when the query has GROUP BY expressions.
    pub fn has_group_by(&self) -> bool {
        !self.group_by.is_empty()
    }

    /// True when the query has aggregates.
    pub fn has_aggregates(&self) -> bool {
        !self.aggregates.is_empty()
    }

    /// True when the query has DISTINCT.
    pub fn has_distinct(&self) -> bool {
        self.distinct != DistinctKind::None
    }

    /// True when TOP, OFFSET or LIMIT is present.
    pub fn has_take(&self) -> bool {
        self.top.is_some() || self.limit.is_some() || self.offset.is_some()
    }

    /// Sort directions of the ORDER BY keys.
    pub fn sort_orders(&self) -> Vec<SortOrder> {
        self.order_by.iter().map(|key| key.order).collect()
    }

    /// Single key-space point the plan is restricted to, if any.
    pub fn single_point_range(&self) -> Option<EpkRange> {
        match self.query_ranges.as_slice() {
            [only] if only.is_point() => Some(*only),
            _ => None,
        }
    }

    /// Rejects capability combinations the cross-partition merge cannot honor.
    pub fn validate(&self) -> Result<()> {
        if self.query.trim().is_empty() {
            return Err(QueryError::bad_request("query text is empty"));
        }
        if self.top.is_some() && (self.limit.is_some() || self.offset.is_some()) {
            return Err(QueryError::plan("TOP cannot be combined with OFFSET/LIMIT"));
        }
        if self.offset.is_some() != self.limit.is_some() {
            return Err(QueryError::plan("OFFSET and LIMIT must be used together"));
        }
        if self.has_aggregates() && self.has_order_by() {
            return Err(QueryError::plan(
                "queries with both ORDER BY and aggregates are not supported",
            ));
        }
        if self.has_group_by() && self.has_order_by() {
            return Err(QueryError::plan(
                "queries with both ORDER BY and GROUP BY are not supported",
            ));
        }
        if self.has_aggregates() && !self.has_group_by() && !self.select_value {
            return Err(QueryError::plan("non-value aggregates are not supported"));
        }
        if self.select_value && self.aggregates.len() > 1 {
            return Err(QueryError::plan(
                "SELECT VALUE supports a single aggregate",
            ));
        }
        if !self.select_value
            && self
                .aggregates
                .iter()
                .any(|aggregate| aggregate.alias.as_deref().map_or(true, str::is_empty))
        {
            return Err(QueryError::plan("aggregates in a GROUP BY projection need an alias"));
        }
        if let Some(spec) = self
            .aggregates
            .iter()
            .find(|aggregate| aggregate.kind != AggregateKind::Count && aggregate.expression.is_none())
        {
            return Err(QueryError::plan(format!("{} requires an argument", spec.kind)));
        }
        if self.distinct == DistinctKind::Ordered && !self.has_order_by() {
            return Err(QueryError::plan("ordered DISTINCT requires ORDER BY"));
        }
        if self.non_streaming_order_by {
            if !self.has_order_by() {
                return Err(QueryError::plan("non-streaming ORDER BY requires ORDER BY keys"));
            }
            if self.top.is_none() && self.limit.is_none() {
                return Err(QueryError::plan(
                    "non-streaming ORDER BY requires TOP or LIMIT",
                ));
            }
        }
        if let Some(hybrid) = &self.hybrid {
            if hybrid.components.is_empty() {
                return Err(QueryError::plan("hybrid search requires at least one ranking"));
            }
            if self.has_order_by() || self.has_group_by() || self.has_aggregates() {
                return Err(QueryError::plan(
                    "hybrid search cannot be combined with ORDER BY, GROUP BY or aggregates",
                ));
            }
            if self.top.is_none() && self.limit.is_none() {
                return Err(QueryError::plan("hybrid search requires TOP or LIMIT"));
            }
        }
        if let Some(range) = self.query_ranges.iter().find(|range| range.is_empty()) {
            return Err(QueryError::plan(format!("query range {range} is empty")));
        }
        if !self.serialization_formats.is_empty()
            && !self.serialization_formats.contains(&SerializationFormat::Json)
        {
            return Err(QueryError::plan("JSON serialization must be supported"));
        }
        Ok(())
    }
}
