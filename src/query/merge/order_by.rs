//! Streaming k-way merge of per-range ORDER BY results.

use std::cmp::Ordering;

use serde_json::Value;
use tracing::error;

use crate::error::{QueryError, Result};
use crate::query::cursor::CursorArena;
use crate::query::fetch::RemoteItem;
use crate::query::merge::MergePoll;
use crate::query::plan::SortOrder;
use crate::query::value::compare_order_by;
use crate::types::RangeId;

/// k-way merge of per-range ORDER BY streams.
///
/// Every unfinished range must expose a head before anything is emitted; the
/// smallest head wins and ties go to the range earlier in key-space order.
#[derive(Clone, Debug, PartialEq)]
pub struct OrderByMerge {
    orders: Vec<SortOrder>,
    last: Option<Vec<Value>>,
}

impl OrderByMerge {
    /// Merge over keys with the given directions.
    pub fn new(orders: Vec<SortOrder>) -> Self {
        Self { orders, last: None }
    }

    /// Key directions.
    pub fn orders(&self) -> &[SortOrder] {
        &self.orders
    }

    /// ORDER BY values of the last item handed out.
    pub fn last_key(&self) -> Option<&[Value]> {
        self.last.as_deref()
    }

    /// Continues after an item with `last` ORDER BY values was handed out.
    pub fn resume_after(&mut self, last: Vec<Value>) -> Result<()> {
        if last.len() != self.orders.len() {
            return Err(QueryError::malformed(format!(
                "token sort key has {} values, query has {} ORDER BY keys",
                last.len(),
                self.orders.len()
            )));
        }
        self.last = Some(last);
        Ok(())
    }

    /// Next item in global order.
    pub fn poll(&mut self, arena: &mut CursorArena) -> Result<MergePoll<RemoteItem>> {
        let active: Vec<&RangeId> = arena
            .order()
            .iter()
            .filter(|id| !arena.is_done(id))
            .collect();
        if active.is_empty() {
            return Ok(MergePoll::Finished);
        }
        let missing: Vec<RangeId> = active
            .iter()
            .filter(|id| arena.head(id).is_none())
            .map(|id| (*id).clone())
            .collect();
        if !missing.is_empty() {
            return Ok(MergePoll::Pending(missing));
        }
        let Some(id) = arena.min_head(active.into_iter(), &self.orders) else {
            return Ok(MergePoll::Finished);
        };
        let Some(item) = arena.pop(&id) else {
            return Ok(MergePoll::Pending(vec![id]));
        };
        if let Some(last) = &self.last {
            if compare_order_by(&item.order_by, last, &self.orders) == Ordering::Less {
                error!(
                    range = %id,
                    previous = ?last,
                    current = ?item.order_by,
                    "query.merge.invariant_violation"
                );
                return Err(QueryError::MergeInvariant(format!(
                    "range {id} returned ORDER BY values out of order"
                )));
            }
        }
        self.last = Some(item.order_by.clone());
        Ok(MergePoll::Item(item))
    }
}
