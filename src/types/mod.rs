#![forbid(unsafe_code)]

//! Identifier and key-space types shared by the query pipeline.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Identifier of a physical partition range, as reported by the topology.
#[derive(Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RangeId(pub String);

impl fmt::Display for RangeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for RangeId {
    fn from(value: &str) -> Self {
        RangeId(value.to_owned())
    }
}

impl From<String> for RangeId {
    fn from(value: String) -> Self {
        RangeId(value)
    }
}

/// Effective partition key: position of a logical partition in the hashed key space.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Epk(pub u64);

impl Epk {
    /// Lowest key in the space.
    pub const MIN: Epk = Epk(0);
    /// Exclusive upper bound of the space.
    pub const MAX: Epk = Epk(1 << 63);
}

impl fmt::Display for Epk {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}

/// Half-open span `[min, max)` of the effective partition key space.
#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug, Serialize, Deserialize)]
pub struct EpkRange {
    /// Inclusive lower bound.
    pub min: Epk,
    /// Exclusive upper bound.
    pub max: Epk,
}

impl EpkRange {
    /// The whole key space.
    pub const FULL: EpkRange = EpkRange {
        min: Epk::MIN,
        max: Epk::MAX,
    };

    /// Builds a span from raw bounds.
    pub const fn new(min: u64, max: u64) -> Self {
        Self {
            min: Epk(min),
            max: Epk(max),
        }
    }

    /// Span containing exactly one key.
    pub const fn point(epk: Epk) -> Self {
        Self {
            min: epk,
            max: Epk(epk.0 + 1),
        }
    }

    /// True when the span holds no keys.
    pub fn is_empty(&self) -> bool {
        self.min >= self.max
    }

    /// True when the span holds exactly one key.
    pub fn is_point(&self) -> bool {
        self.max.0 == self.min.0.saturating_add(1)
    }

    /// True when `epk` falls inside the span.
    pub fn contains(&self, epk: Epk) -> bool {
        self.min <= epk && epk < self.max
    }

    /// True when the two spans share at least one key.
    pub fn overlaps(&self, other: &EpkRange) -> bool {
        self.min < other.max && other.min < self.max
    }

    /// True when `other` lies entirely inside this span.
    pub fn covers(&self, other: &EpkRange) -> bool {
        self.min <= other.min && other.max <= self.max
    }
}

impl fmt::Display for EpkRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, {})", self.min, self.max)
    }
}
