//! GROUP BY and value aggregates finalized from per-range partials.
//!
//! Each range returns one item per group it saw, carrying the group key values
//! and one partial per aggregate. Partials are folded into a table keyed by the
//! canonical group key; groups are emitted in key order once every range is
//! exhausted.

use std::collections::{BTreeMap, HashSet, VecDeque};

use serde_json::{Map, Value};

use crate::error::{QueryError, Result};
use crate::query::cursor::CursorArena;
use crate::query::merge::{MergePoll, Source};
use crate::query::plan::{AggregateKind, QueryPlan};
use crate::query::value::{compare_values, hash_value, number_value, SortKey};

#[derive(Clone, Debug, PartialEq)]
enum Accumulator {
    Count(f64),
    Sum {
        total: f64,
        defined: bool,
        invalid: bool,
    },
    Min(Option<Value>),
    Max(Option<Value>),
    Avg {
        sum: f64,
        count: f64,
    },
    List(Vec<Value>),
    Set {
        values: Vec<Value>,
        seen: HashSet<u64>,
    },
}

impl Accumulator {
    fn new(kind: AggregateKind) -> Self {
        match kind {
            AggregateKind::Count | AggregateKind::CountIf => Accumulator::Count(0.0),
            AggregateKind::Sum => Accumulator::Sum {
                total: 0.0,
                defined: false,
                invalid: false,
            },
            AggregateKind::Min => Accumulator::Min(None),
            AggregateKind::Max => Accumulator::Max(None),
            AggregateKind::Avg => Accumulator::Avg {
                sum: 0.0,
                count: 0.0,
            },
            AggregateKind::MakeList => Accumulator::List(Vec::new()),
            AggregateKind::MakeSet => Accumulator::Set {
                values: Vec::new(),
                seen: HashSet::new(),
            },
        }
    }

    fn fold(&mut self, partial: &Value) -> Result<()> {
        if partial.is_null() {
            return Ok(());
        }
        match self {
            Accumulator::Count(count) => *count += expect_number(partial, "COUNT")?,
            Accumulator::Sum {
                total,
                defined,
                invalid,
            } => match partial.as_f64() {
                Some(value) => {
                    *total += value;
                    *defined = true;
                }
                None => *invalid = true,
            },
            Accumulator::Min(best) => {
                if best
                    .as_ref()
                    .map_or(true, |b| compare_values(partial, b).is_lt())
                {
                    *best = Some(partial.clone());
                }
            }
            Accumulator::Max(best) => {
                if best
                    .as_ref()
                    .map_or(true, |b| compare_values(partial, b).is_gt())
                {
                    *best = Some(partial.clone());
                }
            }
            Accumulator::Avg { sum, count } => {
                *sum += expect_number(&partial["sum"], "AVG sum")?;
                *count += expect_number(&partial["count"], "AVG count")?;
            }
            Accumulator::List(values) => values.extend(expect_array(partial, "MAKELIST")?.iter().cloned()),
            Accumulator::Set { values, seen } => {
                for value in expect_array(partial, "MAKESET")? {
                    if seen.insert(hash_value(value)) {
                        values.push(value.clone());
                    }
                }
            }
        }
        Ok(())
    }

    /// Final value; `None` when the aggregate is undefined.
    fn finish(&self) -> Option<Value> {
        match self {
            Accumulator::Count(count) => Some(number_value(*count)),
            Accumulator::Sum {
                total,
                defined,
                invalid,
            } => (*defined && !*invalid).then(|| number_value(*total)),
            Accumulator::Min(best) | Accumulator::Max(best) => best.clone(),
            Accumulator::Avg { sum, count } => (*count > 0.0).then(|| number_value(sum / count)),
            Accumulator::List(values) | Accumulator::Set { values, .. } => {
                Some(Value::Array(values.clone()))
            }
        }
    }
}

fn expect_number(value: &Value, what: &str) -> Result<f64> {
    value.as_f64().ok_or_else(|| {
        QueryError::MergeInvariant(format!("{what} partial is not a number: {value}"))
    })
}

fn expect_array<'a>(value: &'a Value, what: &str) -> Result<&'a Vec<Value>> {
    value.as_array().ok_or_else(|| {
        QueryError::MergeInvariant(format!("{what} partial is not an array: {value}"))
    })
}

#[derive(Clone, Debug, PartialEq)]
struct GroupEntry {
    payload: Value,
    accumulators: Vec<Accumulator>,
}

/// Folds partial aggregates per group and emits finalized rows.
#[derive(Clone, Debug, PartialEq)]
pub struct GroupByAggregate {
    kinds: Vec<AggregateKind>,
    aliases: Vec<Option<String>>,
    grouped: bool,
    select_value: bool,
    groups: BTreeMap<SortKey, GroupEntry>,
    output: Option<VecDeque<Value>>,
}

impl GroupByAggregate {
    /// Stage for the plan's GROUP BY / aggregates, if any.
    pub fn from_plan(plan: &QueryPlan) -> Option<Self> {
        if !plan.has_group_by() && !plan.has_aggregates() {
            return None;
        }
        Some(Self {
            kinds: plan.aggregates.iter().map(|spec| spec.kind).collect(),
            aliases: plan.aggregates.iter().map(|spec| spec.alias.clone()).collect(),
            grouped: plan.has_group_by(),
            select_value: plan.select_value,
            groups: BTreeMap::new(),
            output: None,
        })
    }

    /// True once every finalized row has been handed out.
    pub fn is_drained(&self) -> bool {
        self.output.as_ref().is_some_and(VecDeque::is_empty)
    }

    /// Next finalized row; consumes the whole source first.
    pub fn poll(&mut self, source: &mut Source, arena: &mut CursorArena) -> Result<MergePoll<Value>> {
        loop {
            if let Some(output) = &mut self.output {
                return Ok(output.pop_front().map_or(MergePoll::Finished, MergePoll::Item));
            }
            match source.poll(arena)? {
                MergePoll::Item(item) => {
                    if item.aggregates.len() != self.kinds.len() {
                        return Err(QueryError::MergeInvariant(format!(
                            "expected {} aggregate partials, got {}",
                            self.kinds.len(),
                            item.aggregates.len()
                        )));
                    }
                    let kinds = &self.kinds;
                    let entry = self
                        .groups
                        .entry(SortKey(item.group_by))
                        .or_insert_with(|| GroupEntry {
                            payload: item.payload,
                            accumulators: kinds.iter().copied().map(Accumulator::new).collect(),
                        });
                    for (acc, partial) in entry.accumulators.iter_mut().zip(&item.aggregates) {
                        acc.fold(partial)?;
                    }
                }
                MergePoll::Pending(demand) => return Ok(MergePoll::Pending(demand)),
                MergePoll::Finished => self.output = Some(self.finalize()),
            }
        }
    }

    fn finalize(&mut self) -> VecDeque<Value> {
        if self.groups.is_empty() && !self.grouped {
            self.groups.insert(
                SortKey::default(),
                GroupEntry {
                    payload: Value::Null,
                    accumulators: self.kinds.iter().copied().map(Accumulator::new).collect(),
                },
            );
        }
        let groups = std::mem::take(&mut self.groups);
        groups
            .into_values()
            .filter_map(|entry| self.render(entry))
            .collect()
    }

    fn render(&self, entry: GroupEntry) -> Option<Value> {
        if self.select_value {
            return match entry.accumulators.first() {
                Some(acc) => acc.finish(),
                None => Some(entry.payload),
            };
        }
        let mut row = match entry.payload {
            Value::Object(map) => map,
            _ => Map::new(),
        };
        for (alias, acc) in self.aliases.iter().zip(&entry.accumulators) {
            let Some(alias) = alias else { continue };
            match acc.finish() {
                Some(value) => {
                    row.insert(alias.clone(), value);
                }
                None => {
                    row.remove(alias);
                }
            }
        }
        Some(Value::Object(row))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::query::fetch::{RemoteItem, RemotePage};
    use crate::query::merge::concat::Concatenate;
    use crate::query::topology::PartitionRange;
    use crate::types::{EpkRange, RangeId};
    use serde_json::json;

    fn arena_with(pages: Vec<Vec<RemoteItem>>) -> CursorArena {
        let ranges: Vec<PartitionRange> = (0..pages.len() as u64)
            .map(|i| PartitionRange::new(format!("r{i}"), EpkRange::new(i * 10, i * 10 + 10)))
            .collect();
        let mut arena = CursorArena::new(ranges);
        for (i, items) in pages.into_iter().enumerate() {
            arena.receive(
                &RangeId::from(format!("r{i}")),
                RemotePage {
                    items,
                    continuation: None,
                    stats: Default::default(),
                },
            );
        }
        arena
    }

    fn run(stage: &mut GroupByAggregate, arena: &mut CursorArena) -> Vec<Value> {
        let mut source = Source::Concatenate(Concatenate);
        let mut out = Vec::new();
        loop {
            match stage.poll(&mut source, arena).unwrap() {
                MergePoll::Item(value) => out.push(value),
                MergePoll::Finished => return out,
                MergePoll::Pending(ids) => panic!("unexpected demand {ids:?}"),
            }
        }
    }

    fn partial(group: &str, count: i64, sum: f64) -> RemoteItem {
        RemoteItem {
            payload: json!({ "team": group }),
            group_by: vec![json!(group)],
            aggregates: vec![json!(count), json!({ "sum": sum, "count": count })],
            ..RemoteItem::default()
        }
    }

    #[test]
    fn groups_merge_across_ranges_in_key_order() {
        let plan = QueryPlan::new("q")
            .group_by("r.team")
            .aggregate(AggregateKind::Count, None, Some("n"))
            .aggregate(AggregateKind::Avg, Some("r.score"), Some("avg"));
        let mut stage = GroupByAggregate::from_plan(&plan).unwrap();
        let mut arena = arena_with(vec![
            vec![partial("red", 2, 10.0), partial("blue", 1, 3.0)],
            vec![partial("red", 2, 2.0)],
        ]);
        assert_eq!(
            run(&mut stage, &mut arena),
            vec![
                json!({"team": "blue", "n": 1, "avg": 3}),
                json!({"team": "red", "n": 4, "avg": 3}),
            ]
        );
        assert!(stage.is_drained());
    }

    #[test]
    fn value_aggregates_over_empty_input() {
        let count = QueryPlan::new("q")
            .aggregate(AggregateKind::Count, None, None)
            .select_value();
        let mut stage = GroupByAggregate::from_plan(&count).unwrap();
        assert_eq!(run(&mut stage, &mut arena_with(vec![vec![], vec![]])), vec![json!(0)]);

        let sum = QueryPlan::new("q")
            .aggregate(AggregateKind::Sum, Some("r.v"), None)
            .select_value();
        let mut stage = GroupByAggregate::from_plan(&sum).unwrap();
        let undefined = RemoteItem {
            aggregates: vec![Value::Null],
            ..RemoteItem::default()
        };
        assert!(run(&mut stage, &mut arena_with(vec![vec![undefined]])).is_empty());
    }

    #[test]
    fn min_max_use_value_order() {
        let plan = QueryPlan::new("q")
            .aggregate(AggregateKind::Max, Some("r.v"), None)
            .select_value();
        let mut stage = GroupByAggregate::from_plan(&plan).unwrap();
        let item = |v: Value| RemoteItem {
            aggregates: vec![v],
            ..RemoteItem::default()
        };
        let mut arena = arena_with(vec![vec![item(json!(4))], vec![item(json!("a"))], vec![item(json!(9))]]);
        assert_eq!(run(&mut stage, &mut arena), vec![json!("a")]);
    }

    #[test]
    fn list_set_and_conditional_count_fold_ranges() {
        let plan = QueryPlan::new("q")
            .group_by("r.team")
            .aggregate(AggregateKind::MakeList, Some("r.tag"), Some("tags"))
            .aggregate(AggregateKind::MakeSet, Some("r.tag"), Some("distinct"))
            .aggregate(AggregateKind::CountIf, Some("r.active"), Some("active"));
        let mut stage = GroupByAggregate::from_plan(&plan).unwrap();
        let item = |tags: Value, set: Value, active: i64| RemoteItem {
            payload: json!({ "team": "red" }),
            group_by: vec![json!("red")],
            aggregates: vec![tags, set, json!(active)],
            ..RemoteItem::default()
        };
        let mut arena = arena_with(vec![
            vec![item(json!(["a", "b", "a"]), json!(["a", "b"]), 2)],
            vec![item(json!(["b", 1]), json!(["b", 1]), 0)],
            vec![item(json!([]), json!([1.0]), 1)],
        ]);
        assert_eq!(
            run(&mut stage, &mut arena),
            vec![json!({
                "team": "red",
                "tags": ["a", "b", "a", "b", 1],
                "distinct": ["a", "b", 1],
                "active": 3,
            })]
        );
    }

    #[test]
    fn list_aggregates_reject_scalar_partials() {
        let plan = QueryPlan::new("q")
            .aggregate(AggregateKind::MakeSet, Some("r.v"), None)
            .select_value();
        let mut stage = GroupByAggregate::from_plan(&plan).unwrap();
        let mut arena = arena_with(vec![vec![RemoteItem {
            aggregates: vec![json!(3)],
            ..RemoteItem::default()
        }]]);
        let mut source = Source::Concatenate(Concatenate);
        assert!(matches!(
            stage.poll(&mut source, &mut arena),
            Err(QueryError::MergeInvariant(_))
        ));

        let empty = QueryPlan::new("q")
            .aggregate(AggregateKind::MakeList, Some("r.v"), None)
            .select_value();
        let mut stage = GroupByAggregate::from_plan(&empty).unwrap();
        assert_eq!(run(&mut stage, &mut arena_with(vec![vec![]])), vec![json!([])]);
    }
}
