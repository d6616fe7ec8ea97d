//! OFFSET, TOP and LIMIT over the merged stream.

use serde::{Deserialize, Serialize};

use crate::error::{QueryError, Result};
use crate::query::plan::QueryPlan;

/// Remaining OFFSET/TOP/LIMIT budget, persisted in continuation tokens.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct LimitSnapshot {
    /// Items still to be dropped.
    pub offset_remaining: u64,
    /// Items still to be returned; `None` when only OFFSET applies.
    pub take_remaining: Option<u64>,
}

/// OFFSET then TOP/LIMIT applied to the merged stream.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TopLimit {
    offset_remaining: u64,
    take_remaining: Option<u64>,
}

impl TopLimit {
    /// Stage for the plan's TOP/OFFSET/LIMIT, if any.
    pub fn from_plan(plan: &QueryPlan) -> Option<Self> {
        plan.has_take().then(|| Self {
            offset_remaining: plan.offset.unwrap_or(0),
            take_remaining: plan.top.or(plan.limit),
        })
    }

    /// Restores the stage, rejecting budgets larger than the plan allows.
    pub fn restore(plan: &QueryPlan, snapshot: &LimitSnapshot) -> Result<Self> {
        let fresh = Self::from_plan(plan)
            .ok_or_else(|| QueryError::malformed("token carries a limit the query does not have"))?;
        let take_fits = match (snapshot.take_remaining, fresh.take_remaining) {
            (Some(left), Some(total)) => left <= total,
            (None, None) => true,
            _ => false,
        };
        if snapshot.offset_remaining > fresh.offset_remaining || !take_fits {
            return Err(QueryError::malformed("limit state exceeds the query's limit"));
        }
        Ok(Self {
            offset_remaining: snapshot.offset_remaining,
            take_remaining: snapshot.take_remaining,
        })
    }

    /// Items the source must produce before the limit is reached.
    pub fn window(&self) -> Option<u64> {
        self.take_remaining
            .map(|take| take.saturating_add(self.offset_remaining))
    }

    /// True once no further item can be returned.
    pub fn is_satisfied(&self) -> bool {
        self.take_remaining == Some(0)
    }

    /// Consumes one incoming item; true when it should be returned.
    pub fn admit(&mut self) -> bool {
        if self.offset_remaining > 0 {
            self.offset_remaining -= 1;
            return false;
        }
        match &mut self.take_remaining {
            Some(0) => false,
            Some(take) => {
                *take -= 1;
                true
            }
            None => true,
        }
    }

    /// Current budget.
    pub fn snapshot(&self) -> LimitSnapshot {
        LimitSnapshot {
            offset_remaining: self.offset_remaining,
            take_remaining: self.take_remaining,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn offset_then_take() {
        let mut limit = TopLimit::from_plan(&QueryPlan::new("q").offset_limit(2, 2)).unwrap();
        let admitted: Vec<bool> = (0..6).map(|_| limit.admit()).collect();
        assert_eq!(admitted, vec![false, false, true, true, false, false]);
        assert!(limit.is_satisfied());
    }

    #[test]
    fn top_zero_is_satisfied_immediately() {
        let limit = TopLimit::from_plan(&QueryPlan::new("q").top(0)).unwrap();
        assert!(limit.is_satisfied());
        assert!(TopLimit::from_plan(&QueryPlan::new("q")).is_none());
    }

    #[test]
    fn restore_rejects_inflated_budgets() {
        let plan = QueryPlan::new("q").top(5);
        let ok = LimitSnapshot {
            offset_remaining: 0,
            take_remaining: Some(3),
        };
        assert_eq!(TopLimit::restore(&plan, &ok).unwrap().snapshot(), ok);
        let inflated = LimitSnapshot {
            offset_remaining: 0,
            take_remaining: Some(6),
        };
        assert_eq!(
            TopLimit::restore(&plan, &inflated).unwrap_err().code(),
            "BadRequest"
        );
    }
}
