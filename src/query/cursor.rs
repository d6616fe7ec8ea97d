//! Per-range fetch progress and the arena that owns it.
//!
//! A cursor is addressed in continuation tokens by the pair (page continuation,
//! items to skip). While a page is buffered the pair points at the start of that
//! page plus the number of items already consumed from it; once the buffer is
//! empty it points at the next page with nothing to skip. Re-fetching from the
//! recorded continuation and dropping the skip count reproduces the exact
//! position without storing item payloads in the token.

use std::cmp::Ordering;
use std::collections::{HashMap, VecDeque};

use crate::query::fetch::{RemoteItem, RemotePage};
use crate::query::plan::SortOrder;
use crate::query::topology::PartitionRange;
use crate::query::value::compare_order_by;
use crate::types::{EpkRange, RangeId};

/// Fetch progress for one partition range.
#[derive(Clone, Debug)]
pub struct Cursor {
    range: PartitionRange,
    page_start: Option<String>,
    next: Option<String>,
    buffer: VecDeque<RemoteItem>,
    consumed: usize,
    pending_skip: usize,
    exhausted: bool,
}

impl Cursor {
    /// Cursor positioned at the start of `range`.
    pub fn new(range: PartitionRange) -> Self {
        Self::resume(range, None, 0)
    }

    /// Cursor positioned at `continuation`, dropping the first `skip` items it returns.
    pub fn resume(range: PartitionRange, continuation: Option<String>, skip: usize) -> Self {
        Self {
            range,
            page_start: None,
            next: continuation,
            buffer: VecDeque::new(),
            consumed: 0,
            pending_skip: skip,
            exhausted: false,
        }
    }

    /// Range this cursor reads.
    pub fn range(&self) -> &PartitionRange {
        &self.range
    }

    /// Continuation to send with the next fetch.
    pub fn next_continuation(&self) -> Option<&str> {
        self.next.as_deref()
    }

    /// Next buffered item, if any.
    pub fn head(&self) -> Option<&RemoteItem> {
        self.buffer.front()
    }

    /// Items buffered but not yet consumed.
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    /// True once the range has no more pages to fetch.
    pub fn is_exhausted(&self) -> bool {
        self.exhausted
    }

    /// True when nothing remains buffered or fetchable.
    pub fn is_done(&self) -> bool {
        self.exhausted && self.buffer.is_empty()
    }

    /// True when the merge cannot read from this cursor without a fetch.
    pub fn needs_fetch(&self) -> bool {
        self.buffer.is_empty() && !self.exhausted
    }

    /// Installs a freshly fetched page.
    pub fn receive(&mut self, page: RemotePage) {
        self.page_start = self.next.take();
        self.next = page.continuation;
        self.exhausted = self.next.is_none();
        self.buffer = page.items.into();
        let skip = self.pending_skip.min(self.buffer.len());
        self.buffer.drain(..skip);
        self.consumed = skip;
        self.pending_skip -= skip;
    }

    /// Consumes the head item.
    pub fn pop(&mut self) -> Option<RemoteItem> {
        let item = self.buffer.pop_front()?;
        self.consumed += 1;
        Some(item)
    }

    /// Resume position `(continuation, skip)`, or `None` once fully consumed.
    pub fn position(&self) -> Option<(Option<String>, usize)> {
        if !self.buffer.is_empty() {
            Some((self.page_start.clone(), self.consumed))
        } else if self.exhausted {
            None
        } else {
            Some((self.next.clone(), self.pending_skip))
        }
    }
}

/// Resume entry for one cursor.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CursorPosition {
    /// Range and the key span this cursor is responsible for.
    pub range: PartitionRange,
    /// Continuation of the page to re-fetch.
    pub continuation: Option<String>,
    /// Items to drop from what that page returns.
    pub skip: usize,
}

/// Items still to be dropped from the combined output of a split range's children.
#[derive(Clone, Debug, PartialEq, Eq)]
struct SkipGroup {
    members: Vec<RangeId>,
    remaining: usize,
}

/// How a skip group walks its members, mirroring the merge that reads them.
#[derive(Clone, Copy, Debug)]
pub enum SkipOrder<'a> {
    /// Members drained one after another in key order.
    Sequential,
    /// Members merged by ORDER BY values.
    Sorted(&'a [SortOrder]),
}

/// Owns every cursor of one execution, in key-space order.
#[derive(Clone, Debug, Default)]
pub struct CursorArena {
    cursors: HashMap<RangeId, Cursor>,
    order: Vec<RangeId>,
    skip_groups: Vec<SkipGroup>,
}

impl CursorArena {
    /// Fresh cursors over `ranges`.
    pub fn new(ranges: Vec<PartitionRange>) -> Self {
        Self::from_cursors(ranges.into_iter().map(Cursor::new).collect())
    }

    /// Cursors restored from resume positions.
    pub fn restore(positions: Vec<CursorPosition>) -> Self {
        Self::from_cursors(
            positions
                .into_iter()
                .map(|pos| Cursor::resume(pos.range, pos.continuation, pos.skip))
                .collect(),
        )
    }

    fn from_cursors(mut cursors: Vec<Cursor>) -> Self {
        cursors.sort_by_key(|cursor| cursor.range.span.min);
        let order = cursors.iter().map(|c| c.range.id.clone()).collect();
        Self {
            cursors: cursors
                .into_iter()
                .map(|c| (c.range.id.clone(), c))
                .collect(),
            order,
            skip_groups: Vec::new(),
        }
    }

    /// Range ids in key-space order.
    pub fn order(&self) -> &[RangeId] {
        &self.order
    }

    /// Number of cursors.
    pub fn len(&self) -> usize {
        self.order.len()
    }

    /// True when no cursors exist.
    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    /// Cursor for `id`.
    pub fn get(&self, id: &RangeId) -> Option<&Cursor> {
        self.cursors.get(id)
    }

    /// Cursors in key-space order.
    pub fn iter(&self) -> impl Iterator<Item = &Cursor> + '_ {
        self.order.iter().filter_map(|id| self.cursors.get(id))
    }

    /// Head item of `id`.
    pub fn head(&self, id: &RangeId) -> Option<&RemoteItem> {
        self.cursors.get(id).and_then(Cursor::head)
    }

    /// Consumes the head item of `id`.
    pub fn pop(&mut self, id: &RangeId) -> Option<RemoteItem> {
        self.cursors.get_mut(id).and_then(Cursor::pop)
    }

    /// Installs a fetched page into `id`.
    pub fn receive(&mut self, id: &RangeId, page: RemotePage) {
        if let Some(cursor) = self.cursors.get_mut(id) {
            cursor.receive(page);
        }
    }

    /// True when `id` is unknown or fully consumed.
    pub fn is_done(&self, id: &RangeId) -> bool {
        self.cursors.get(id).map_or(true, Cursor::is_done)
    }

    /// True when every cursor is fully consumed and no skips are outstanding.
    pub fn all_done(&self) -> bool {
        self.skip_groups.is_empty() && self.cursors.values().all(Cursor::is_done)
    }

    /// Cursors that must be fetched before they can yield, in key order.
    pub fn fetchable(&self) -> Vec<RangeId> {
        self.iter()
            .filter(|cursor| cursor.needs_fetch())
            .map(|cursor| cursor.range.id.clone())
            .collect()
    }

    /// True while a split range still owes dropped items.
    pub fn has_skip_groups(&self) -> bool {
        !self.skip_groups.is_empty()
    }

    /// Resume positions of every unfinished cursor, in key order.
    pub fn positions(&self) -> Vec<CursorPosition> {
        self.iter()
            .filter_map(|cursor| {
                cursor
                    .position()
                    .map(|(continuation, skip)| CursorPosition {
                        range: cursor.range.clone(),
                        continuation,
                        skip,
                    })
            })
            .collect()
    }

    /// Replaces `parent` by `children`, which continue from the parent's next page.
    ///
    /// Children are clipped to the parent's span. A resume skip still owed by the
    /// parent becomes a skip group over the children. Returns the ids installed.
    pub fn replace_with_children(
        &mut self,
        parent: &RangeId,
        children: Vec<PartitionRange>,
    ) -> Vec<RangeId> {
        let Some(slot) = self.order.iter().position(|id| id == parent) else {
            return Vec::new();
        };
        let Some(old) = self.cursors.remove(parent) else {
            return Vec::new();
        };
        let mut installed: Vec<Cursor> = children
            .into_iter()
            .filter_map(|child| {
                let span = clip(&child.span, &old.range.span)?;
                Some(Cursor::resume(
                    PartitionRange { id: child.id, span },
                    old.next.clone(),
                    0,
                ))
            })
            .collect();
        installed.sort_by_key(|cursor| cursor.range.span.min);
        if let Some(first) = installed.first_mut() {
            // Only empty cursors are fetched, but keep any residue with the lowest child.
            first.buffer = old.buffer;
            first.page_start = old.page_start;
            first.consumed = old.consumed;
        }
        let ids: Vec<RangeId> = installed.iter().map(|c| c.range.id.clone()).collect();

        if old.pending_skip > 0 {
            if let [only] = installed.as_mut_slice() {
                only.pending_skip = old.pending_skip;
            } else {
                self.skip_groups.push(SkipGroup {
                    members: ids.clone(),
                    remaining: old.pending_skip,
                });
            }
        }
        for group in &mut self.skip_groups {
            if let Some(pos) = group.members.iter().position(|id| id == parent) {
                group.members.splice(pos..=pos, ids.iter().cloned());
            }
        }

        self.order.splice(slot..=slot, ids.iter().cloned());
        for cursor in installed {
            self.cursors.insert(cursor.range.id.clone(), cursor);
        }
        ids
    }

    /// Drops items owed by skip groups, walking members in `order`.
    ///
    /// Returns the cursors that must be fetched before the groups can make
    /// progress; an empty result means every group is settled.
    pub fn resolve_skip_groups(&mut self, order: SkipOrder<'_>) -> Vec<RangeId> {
        let mut demand = Vec::new();
        let mut groups = std::mem::take(&mut self.skip_groups);
        for group in &mut groups {
            while group.remaining > 0 {
                let live: Vec<&RangeId> = group
                    .members
                    .iter()
                    .filter(|id| !self.is_done(id))
                    .collect();
                if live.is_empty() {
                    group.remaining = 0;
                    break;
                }
                let next = match order {
                    SkipOrder::Sequential => {
                        let first = live[0];
                        if self.head(first).is_none() {
                            demand.push(first.clone());
                            break;
                        }
                        first.clone()
                    }
                    SkipOrder::Sorted(orders) => {
                        let missing: Vec<RangeId> = live
                            .iter()
                            .filter(|id| self.head(id).is_none())
                            .map(|id| (*id).clone())
                            .collect();
                        if !missing.is_empty() {
                            demand.extend(missing);
                            break;
                        }
                        match self.min_head(live.into_iter(), orders) {
                            Some(id) => id,
                            None => break,
                        }
                    }
                };
                self.pop(&next);
                group.remaining -= 1;
            }
        }
        groups.retain(|group| group.remaining > 0);
        self.skip_groups = groups;
        demand
    }

    /// Id whose head sorts first; ties go to the earlier id in `candidates`.
    pub fn min_head<'a>(
        &self,
        candidates: impl Iterator<Item = &'a RangeId>,
        orders: &[SortOrder],
    ) -> Option<RangeId> {
        let mut best: Option<(&'a RangeId, &RemoteItem)> = None;
        for id in candidates {
            let Some(head) = self.head(id) else { continue };
            let better = match best {
                None => true,
                Some((_, current)) => {
                    compare_order_by(&head.order_by, &current.order_by, orders) == Ordering::Less
                }
            };
            if better {
                best = Some((id, head));
            }
        }
        best.map(|(id, _)| id.clone())
    }
}

fn clip(child: &EpkRange, parent: &EpkRange) -> Option<EpkRange> {
    let span = EpkRange {
        min: child.min.max(parent.min),
        max: child.max.min(parent.max),
    };
    (!span.is_empty()).then_some(span)
}
