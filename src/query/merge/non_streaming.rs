//! Drain-and-sort ORDER BY for rankings ranges cannot stream.

use std::collections::VecDeque;

use crate::error::Result;
use crate::query::cursor::CursorArena;
use crate::query::fetch::RemoteItem;
use crate::query::merge::MergePoll;
use crate::query::plan::SortOrder;
use crate::query::value::compare_order_by;

/// Global sort for rankings that ranges cannot stream (vector distance,
/// full-text score): drain every range, keep the best `window` items.
#[derive(Clone, Debug, PartialEq)]
pub struct NonStreamingOrderBy {
    orders: Vec<SortOrder>,
    window: usize,
    collected: Vec<RemoteItem>,
    sorted: Option<VecDeque<RemoteItem>>,
}

impl NonStreamingOrderBy {
    /// Sort over `orders`, retaining `window` items (OFFSET plus TOP/LIMIT).
    pub fn new(orders: Vec<SortOrder>, window: usize) -> Self {
        Self {
            orders,
            window,
            collected: Vec::new(),
            sorted: None,
        }
    }

    /// True once the sorted output has been fully handed out.
    pub fn is_drained(&self) -> bool {
        self.sorted.as_ref().is_some_and(VecDeque::is_empty)
    }

    fn compact(&mut self) {
        let orders = &self.orders;
        self.collected
            .sort_by(|a, b| compare_order_by(&a.order_by, &b.order_by, orders));
        self.collected.truncate(self.window);
    }

    /// Next item of the global ranking.
    pub fn poll(&mut self, arena: &mut CursorArena) -> Result<MergePoll<RemoteItem>> {
        if self.sorted.is_none() {
            for id in arena.order().to_vec() {
                while let Some(item) = arena.pop(&id) {
                    self.collected.push(item);
                }
            }
            if self.collected.len() > self.window.saturating_mul(2) {
                self.compact();
            }
            let demand = arena.fetchable();
            if !demand.is_empty() {
                return Ok(MergePoll::Pending(demand));
            }
            self.compact();
            self.sorted = Some(std::mem::take(&mut self.collected).into());
        }
        Ok(self
            .sorted
            .as_mut()
            .and_then(VecDeque::pop_front)
            .map_or(MergePoll::Finished, MergePoll::Item))
    }
}
