//! Versioned continuation tokens.
//!
//! A token is the URL-safe base64 encoding of a small JSON document: the
//! format version, a fingerprint of the query text, the pipeline that produced
//! it, one `(continuation, skip)` entry per unfinished range, and the merge
//! stage state. Tokens never contain result payloads, so their size is bounded
//! by the number of ranges and the DISTINCT set.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use serde::{Deserialize, Serialize};
use xxhash_rust::xxh64::xxh64;

use crate::error::{QueryError, Result};
use crate::query::cursor::CursorPosition;
use crate::query::merge::MergeSnapshot;
use crate::query::selector::PipelineKind;
use crate::query::topology::PartitionRange;
use crate::types::{Epk, EpkRange, RangeId};

/// Format version written by this build.
pub const TOKEN_VERSION: u32 = 1;

/// Oldest format version this build still reads.
pub const MIN_TOKEN_VERSION: u32 = 1;

const FINGERPRINT_SEED: u64 = 0x0d0c_0e0e_7a11_0001;

/// Fingerprint binding a token to its query text.
pub fn fingerprint(query: &str) -> u64 {
    xxh64(query.as_bytes(), FINGERPRINT_SEED)
}

/// Resume entry for one range.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RangeToken {
    /// Range id.
    pub id: RangeId,
    /// Inclusive lower bound of the span this entry covers.
    pub min: Epk,
    /// Exclusive upper bound of the span this entry covers.
    pub max: Epk,
    /// Range continuation of the page to re-fetch.
    #[serde(rename = "c", default, skip_serializing_if = "Option::is_none")]
    pub continuation: Option<String>,
    /// Items to drop from that page.
    #[serde(rename = "s", default, skip_serializing_if = "is_zero")]
    pub skip: usize,
}

fn is_zero(value: &usize) -> bool {
    *value == 0
}

impl From<CursorPosition> for RangeToken {
    fn from(position: CursorPosition) -> Self {
        Self {
            id: position.range.id,
            min: position.range.span.min,
            max: position.range.span.max,
            continuation: position.continuation,
            skip: position.skip,
        }
    }
}

impl From<&RangeToken> for CursorPosition {
    fn from(token: &RangeToken) -> Self {
        CursorPosition {
            range: PartitionRange {
                id: token.id.clone(),
                span: EpkRange {
                    min: token.min,
                    max: token.max,
                },
            },
            continuation: token.continuation.clone(),
            skip: token.skip,
        }
    }
}

/// Decoded continuation token.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContinuationToken {
    /// Format version.
    #[serde(rename = "v")]
    pub version: u32,
    /// Query text fingerprint.
    #[serde(rename = "q")]
    pub query: u64,
    /// Pipeline that produced the token.
    #[serde(rename = "p")]
    pub pipeline: PipelineKind,
    /// Unfinished ranges in key order.
    #[serde(rename = "r", default)]
    pub ranges: Vec<RangeToken>,
    /// Merge stage state.
    #[serde(rename = "m", default)]
    pub merge: MergeSnapshot,
}

impl ContinuationToken {
    /// Token for the current execution state.
    pub fn new(
        query: &str,
        pipeline: PipelineKind,
        positions: Vec<CursorPosition>,
        merge: MergeSnapshot,
    ) -> Self {
        Self {
            version: TOKEN_VERSION,
            query: fingerprint(query),
            pipeline,
            ranges: positions.into_iter().map(RangeToken::from).collect(),
            merge,
        }
    }

    /// Opaque string form.
    pub fn encode(&self) -> Result<String> {
        let json = serde_json::to_vec(self)
            .map_err(|err| QueryError::malformed(format!("cannot serialize token: {err}")))?;
        Ok(URL_SAFE_NO_PAD.encode(json))
    }

    /// Parses and structurally validates an opaque token.
    pub fn decode(token: &str) -> Result<Self> {
        let bytes = URL_SAFE_NO_PAD
            .decode(token.trim())
            .map_err(|err| QueryError::malformed(format!("not base64: {err}")))?;
        let decoded: ContinuationToken = serde_json::from_slice(&bytes)
            .map_err(|err| QueryError::malformed(format!("not a continuation token: {err}")))?;
        decoded.validate()?;
        Ok(decoded)
    }

    fn validate(&self) -> Result<()> {
        if self.version > TOKEN_VERSION {
            return Err(QueryError::malformed(format!(
                "token version {} is from a newer client (max {TOKEN_VERSION})",
                self.version
            )));
        }
        if self.version < MIN_TOKEN_VERSION {
            return Err(QueryError::malformed(format!(
                "token version {} is no longer supported (min {MIN_TOKEN_VERSION})",
                self.version
            )));
        }
        if self.ranges.is_empty() && self.merge.replay.is_none() {
            return Err(QueryError::malformed("token has no ranges to resume"));
        }
        if let Some(range) = self.ranges.iter().find(|range| range.min >= range.max) {
            return Err(QueryError::malformed(format!(
                "range {} has an empty span",
                range.id
            )));
        }
        Ok(())
    }

    /// Rejects a token issued for different query text.
    pub fn check_query(&self, query: &str) -> Result<()> {
        if self.query != fingerprint(query) {
            return Err(QueryError::malformed("token was issued for a different query"));
        }
        Ok(())
    }

    /// Resume positions for the cursor arena.
    pub fn positions(&self) -> Vec<CursorPosition> {
        self.ranges.iter().map(CursorPosition::from).collect()
    }
}
