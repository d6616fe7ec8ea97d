//! Key-order concatenation of range streams.

use crate::error::Result;
use crate::query::cursor::CursorArena;
use crate::query::fetch::RemoteItem;
use crate::query::merge::MergePoll;

/// Drains ranges one after another in key-space order.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Concatenate;

impl Concatenate {
    /// Next item of the first unfinished range.
    pub fn poll(&mut self, arena: &mut CursorArena) -> Result<MergePoll<RemoteItem>> {
        let Some(id) = arena.order().iter().find(|id| !arena.is_done(id)).cloned() else {
            return Ok(MergePoll::Finished);
        };
        match arena.pop(&id) {
            Some(item) => Ok(MergePoll::Item(item)),
            None => Ok(MergePoll::Pending(vec![id])),
        }
    }
}
