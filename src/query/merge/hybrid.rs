//! Reciprocal-rank fusion of hybrid search rankings.
//!
//! Ranges score each document once per ranking. The merge drains every range,
//! coalesces documents several ranges returned, ranks each component globally
//! and orders documents by `sum(1 / (RRF_CONSTANT + rank))`.

use std::collections::VecDeque;

use crate::error::{QueryError, Result};
use crate::query::cursor::CursorArena;
use crate::query::fetch::RemoteItem;
use crate::query::merge::MergePoll;

/// Damping constant added to every rank.
pub const RRF_CONSTANT: f64 = 60.0;

/// Drain-and-fuse source for hybrid searches.
#[derive(Clone, Debug, PartialEq)]
pub struct HybridRrf {
    components: usize,
    window: usize,
    collected: Vec<RemoteItem>,
    fused: Option<VecDeque<RemoteItem>>,
}

impl HybridRrf {
    /// Fusion of `components` rankings, retaining the best `window` documents.
    pub fn new(components: usize, window: usize) -> Self {
        Self {
            components,
            window,
            collected: Vec::new(),
            fused: None,
        }
    }

    /// True once the fused output has been fully handed out.
    pub fn is_drained(&self) -> bool {
        self.fused.as_ref().is_some_and(VecDeque::is_empty)
    }

    /// Next document in fused order.
    pub fn poll(&mut self, arena: &mut CursorArena) -> Result<MergePoll<RemoteItem>> {
        if self.fused.is_none() {
            for id in arena.order().to_vec() {
                while let Some(item) = arena.pop(&id) {
                    self.collected.push(item);
                }
            }
            let demand = arena.fetchable();
            if !demand.is_empty() {
                return Ok(MergePoll::Pending(demand));
            }
            let mut fused = fuse(std::mem::take(&mut self.collected), self.components)?;
            fused.truncate(self.window);
            self.fused = Some(fused.into());
        }
        Ok(self
            .fused
            .as_mut()
            .and_then(VecDeque::pop_front)
            .map_or(MergePoll::Finished, MergePoll::Item))
    }
}

/// Orders `items` by fused rank, best first.
///
/// Identical scores share a rank; the rank grows by one at each strictly lower
/// score. Ties in the fused score keep `rid` order.
pub fn fuse(items: Vec<RemoteItem>, components: usize) -> Result<Vec<RemoteItem>> {
    let mut rids = Vec::with_capacity(items.len());
    for item in &items {
        let rid = item
            .rid
            .clone()
            .ok_or_else(|| QueryError::MergeInvariant("hybrid search result has no rid".into()))?;
        rids.push(rid);
    }
    let mut keyed: Vec<(String, RemoteItem)> = rids.into_iter().zip(items).collect();
    keyed.sort_by(|a, b| a.0.cmp(&b.0));
    keyed.dedup_by(|later, earlier| later.0 == earlier.0);

    let scores = component_scores(&keyed, components)?;
    let mut fused = vec![0.0f64; keyed.len()];
    for column in &scores {
        let mut ranked: Vec<(f64, usize)> = column.iter().copied().zip(0..).collect();
        ranked.sort_by(|a, b| b.0.total_cmp(&a.0));
        let mut rank = 1u64;
        for (position, (score, index)) in ranked.iter().enumerate() {
            if position > 0 && *score < ranked[position - 1].0 {
                rank += 1;
            }
            fused[*index] += 1.0 / (RRF_CONSTANT + rank as f64);
        }
    }

    let mut order: Vec<usize> = (0..keyed.len()).collect();
    order.sort_by(|a, b| fused[*b].total_cmp(&fused[*a]));
    let mut slots: Vec<Option<RemoteItem>> = keyed.into_iter().map(|(_, item)| Some(item)).collect();
    Ok(order
        .into_iter()
        .filter_map(|index| slots[index].take())
        .collect())
}

fn component_scores(items: &[(String, RemoteItem)], components: usize) -> Result<Vec<Vec<f64>>> {
    let mut columns = vec![Vec::with_capacity(items.len()); components];
    for (rid, item) in items {
        if item.component_scores.len() != components {
            return Err(QueryError::MergeInvariant(format!(
                "document {rid} has {} component scores, expected {components}",
                item.component_scores.len()
            )));
        }
        for (column, score) in columns.iter_mut().zip(&item.component_scores) {
            let score = score.as_f64().ok_or_else(|| {
                QueryError::MergeInvariant(format!("component score {score} of {rid} is not a number"))
            })?;
            column.push(score);
        }
    }
    Ok(columns)
}
