//! Execution diagnostics collected alongside query pages.
//!
//! Diagnostics are observational only: nothing recorded here is read back by
//! the executor, so results never depend on them.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::Serialize;

use crate::query::selector::PipelineKind;
use crate::types::RangeId;

/// Statistics for one returned page.
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct PageDiagnostics {
    /// Zero-based page number within this iterator.
    pub page: usize,
    /// Items returned.
    pub item_count: usize,
    /// Per-range fetches issued while building the page.
    pub fetch_count: usize,
    /// Request units charged across those fetches.
    pub request_charge: f64,
    /// Wall time spent producing the page.
    pub elapsed: Duration,
}

/// A range replaced by its successors after a `Gone` response.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct SplitEvent {
    /// Range that reported `Gone`.
    pub parent: RangeId,
    /// Ranges now covering its span.
    pub children: Vec<RangeId>,
}

/// Point-in-time copy of everything recorded so far.
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct DiagnosticsSnapshot {
    /// Pipeline chosen for the query.
    pub pipeline: Option<PipelineKind>,
    /// One entry per returned page.
    pub pages: Vec<PageDiagnostics>,
    /// Observed splits, in order.
    pub splits: Vec<SplitEvent>,
    /// Set when a single-range strategy had to continue across several ranges.
    pub fallback: Option<String>,
}

impl DiagnosticsSnapshot {
    /// Request units charged across all pages.
    pub fn total_request_charge(&self) -> f64 {
        self.pages.iter().map(|page| page.request_charge).sum()
    }

    /// Fetches issued across all pages.
    pub fn total_fetches(&self) -> usize {
        self.pages.iter().map(|page| page.fetch_count).sum()
    }
}

/// Shared diagnostics handle; clones observe the same record.
#[derive(Clone, Debug, Default)]
pub struct QueryDiagnostics {
    inner: Arc<Mutex<DiagnosticsSnapshot>>,
}

impl QueryDiagnostics {
    /// Creates an empty record.
    pub fn new() -> Self {
        Self::default()
    }

    /// Pipeline chosen for the query, once known.
    pub fn pipeline(&self) -> Option<PipelineKind> {
        self.inner.lock().pipeline
    }

    /// Copies the current record.
    pub fn snapshot(&self) -> DiagnosticsSnapshot {
        self.inner.lock().clone()
    }

    pub(crate) fn record_pipeline(&self, kind: PipelineKind) {
        self.inner.lock().pipeline = Some(kind);
    }

    pub(crate) fn record_page(
        &self,
        item_count: usize,
        fetch_count: usize,
        request_charge: f64,
        elapsed: Duration,
    ) {
        let mut inner = self.inner.lock();
        let page = inner.pages.len();
        inner.pages.push(PageDiagnostics {
            page,
            item_count,
            fetch_count,
            request_charge,
            elapsed,
        });
    }

    pub(crate) fn record_split(&self, parent: RangeId, children: Vec<RangeId>) {
        self.inner.lock().splits.push(SplitEvent { parent, children });
    }

    pub(crate) fn record_fallback(&self, reason: impl Into<String>) {
        let mut inner = self.inner.lock();
        if inner.fallback.is_none() {
            inner.fallback = Some(reason.into());
        }
    }
}
