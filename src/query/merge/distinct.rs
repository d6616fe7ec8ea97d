//! DISTINCT deduplication by canonical value hash.
//!
//! Ordered DISTINCT sees duplicates adjacently and keeps only the last hash;
//! unordered DISTINCT keeps every hash it has returned.

use std::collections::HashSet;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{QueryError, Result};
use crate::query::plan::DistinctKind;
use crate::query::value::hash_value;

/// DISTINCT state persisted in continuation tokens.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum DistinctSnapshot {
    /// Hash of the last returned value.
    Ordered {
        /// `None` before the first value.
        last: Option<u64>,
    },
    /// Hashes of every returned value, sorted.
    Unordered {
        /// Seen hashes.
        seen: Vec<u64>,
    },
}

/// Drops values whose normalized hash was already returned.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum DistinctDedup {
    /// Duplicates are adjacent, so only the last hash is kept.
    Ordered {
        /// Hash of the last admitted value.
        last: Option<u64>,
    },
    /// Duplicates may appear anywhere.
    Unordered {
        /// Hashes of admitted values.
        seen: HashSet<u64>,
    },
}

impl DistinctDedup {
    /// Stage for `kind`, if any.
    pub fn new(kind: DistinctKind) -> Option<Self> {
        match kind {
            DistinctKind::None => None,
            DistinctKind::Ordered => Some(DistinctDedup::Ordered { last: None }),
            DistinctKind::Unordered => Some(DistinctDedup::Unordered {
                seen: HashSet::new(),
            }),
        }
    }

    /// Restores the stage; the snapshot flavor must match the query's.
    pub fn restore(kind: DistinctKind, snapshot: &DistinctSnapshot) -> Result<Self> {
        match (kind, snapshot) {
            (DistinctKind::Ordered, DistinctSnapshot::Ordered { last }) => {
                Ok(DistinctDedup::Ordered { last: *last })
            }
            (DistinctKind::Unordered, DistinctSnapshot::Unordered { seen }) => {
                Ok(DistinctDedup::Unordered {
                    seen: seen.iter().copied().collect(),
                })
            }
            _ => Err(QueryError::malformed(
                "DISTINCT state does not match the query",
            )),
        }
    }

    /// True when `value` has not been returned yet; records it.
    pub fn admit(&mut self, value: &Value) -> bool {
        let hash = hash_value(value);
        match self {
            DistinctDedup::Ordered { last } => {
                if *last == Some(hash) {
                    return false;
                }
                *last = Some(hash);
                true
            }
            DistinctDedup::Unordered { seen } => seen.insert(hash),
        }
    }

    /// Current state.
    pub fn snapshot(&self) -> DistinctSnapshot {
        match self {
            DistinctDedup::Ordered { last } => DistinctSnapshot::Ordered { last: *last },
            DistinctDedup::Unordered { seen } => {
                let mut seen: Vec<u64> = seen.iter().copied().collect();
                seen.sort_unstable();
                DistinctSnapshot::Unordered { seen }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn unordered_dedup_spans_the_stream() {
        let mut stage = DistinctDedup::new(DistinctKind::Unordered).unwrap();
        let admitted: Vec<bool> = [json!(1), json!("a"), json!(1.0), json!({"a": 1}), json!("a")]
            .iter()
            .map(|v| stage.admit(v))
            .collect();
        assert_eq!(admitted, vec![true, true, false, true, false]);
    }

    #[test]
    fn ordered_dedup_only_compares_neighbours() {
        let mut stage = DistinctDedup::new(DistinctKind::Ordered).unwrap();
        let admitted: Vec<bool> = [json!(1), json!(1), json!(2), json!(1)]
            .iter()
            .map(|v| stage.admit(v))
            .collect();
        assert_eq!(admitted, vec![true, false, true, true]);
    }

    #[test]
    fn snapshot_restores_seen_set() {
        let mut stage = DistinctDedup::new(DistinctKind::Unordered).unwrap();
        stage.admit(&json!("x"));
        let mut restored =
            DistinctDedup::restore(DistinctKind::Unordered, &stage.snapshot()).unwrap();
        assert!(!restored.admit(&json!("x")));
        assert!(DistinctDedup::restore(DistinctKind::Ordered, &stage.snapshot()).is_err());
    }
}
