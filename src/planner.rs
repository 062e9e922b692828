//! Offset planning for paginated listings
//!
//! Turns a fetch-mode descriptor (`"all"`, a bare number, or `"A-B"`) plus the
//! profile's total item count into the listing offsets to visit, optionally with an
//! ID predicate applied to the fetched records.
//!
//! ID-range early termination assumes listings arrive ordered by ID. That holds for
//! the APIs this crate targets but is not guaranteed; when it fails the scan simply
//! stops early or late, and records outside the range are still never emitted.

use crate::config::ExtractionConfig;
use crate::error::{Error, Result};
use std::collections::HashSet;

/// Predicate on record IDs used when the fetch mode names IDs rather than offsets
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum IdFilter {
    /// Exactly this ID
    Exact(String),
    /// Numeric IDs in `low..=high`
    Range {
        /// Inclusive lower bound
        low: u64,
        /// Inclusive upper bound
        high: u64,
    },
}

impl IdFilter {
    /// Whether a record with this ID should be kept
    pub fn matches(&self, id: &str) -> bool {
        match self {
            IdFilter::Exact(wanted) => id == wanted,
            IdFilter::Range { low, high } => id
                .trim()
                .parse::<u64>()
                .is_ok_and(|n| (*low..=*high).contains(&n)),
        }
    }

    /// IDs whose observation ends the scan
    pub fn boundaries(&self) -> Vec<String> {
        match self {
            IdFilter::Exact(id) => vec![id.clone()],
            IdFilter::Range { low, high } => vec![low.to_string(), high.to_string()],
        }
    }
}

/// Tracks which boundary IDs have been seen in the filtered stream
#[derive(Debug)]
pub struct BoundaryTracker {
    remaining: HashSet<String>,
}

impl BoundaryTracker {
    /// Start tracking the boundaries of `filter`
    pub fn new(filter: &IdFilter) -> Self {
        Self {
            remaining: filter.boundaries().into_iter().collect(),
        }
    }

    /// Record an emitted ID; returns true once every boundary has been seen
    pub fn observe(&mut self, id: &str) -> bool {
        self.remaining.remove(id);
        self.remaining.is_empty()
    }

    /// Whether every boundary has been seen
    pub fn is_complete(&self) -> bool {
        self.remaining.is_empty()
    }
}

/// Offsets to visit, plus an optional post-fetch ID predicate
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct OffsetPlan {
    /// Listing offsets in visiting order
    pub offsets: Vec<u64>,
    /// Predicate applied to every fetched record, if the mode selected IDs
    pub filter: Option<IdFilter>,
}

impl OffsetPlan {
    /// Whether there is nothing to fetch
    pub fn is_empty(&self) -> bool {
        self.offsets.is_empty()
    }
}

/// Computes [`OffsetPlan`]s for a fixed page size
#[derive(Clone, Copy, Debug)]
pub struct OffsetPlanner {
    page_size: u64,
    offset_digit_limit: usize,
}

impl Default for OffsetPlanner {
    fn default() -> Self {
        Self::new(50, 5)
    }
}

impl OffsetPlanner {
    /// Planner for `page_size` items per page; bare values with more than
    /// `offset_digit_limit` digits are treated as item IDs
    pub fn new(page_size: u64, offset_digit_limit: usize) -> Self {
        Self {
            page_size: page_size.max(1),
            offset_digit_limit,
        }
    }

    /// Planner using the extraction settings
    pub fn from_config(config: &ExtractionConfig) -> Self {
        Self::new(config.page_size, config.offset_digit_limit)
    }

    /// 1-based page number of a listing offset
    pub fn page_number(&self, offset: u64) -> u64 {
        offset / self.page_size + 1
    }

    /// Plan the offsets for `fetch_mode` against a profile with `total` items
    ///
    /// A range is an offset range only when both ends fit within `total`; otherwise
    /// it is an ID range. `start`/`end` resolve to `0`/`total` first, so `"100-end"`
    /// on a profile with 50 items becomes the ID range `50..=100`, not an empty
    /// offset range.
    pub fn plan(&self, fetch_mode: &str, total: u64) -> Result<OffsetPlan> {
        let mode = fetch_mode.trim();
        let plan = self.parse(mode, total)?;
        if total == 0 {
            return Ok(OffsetPlan::default());
        }
        Ok(plan)
    }

    fn parse(&self, mode: &str, total: u64) -> Result<OffsetPlan> {
        if mode.eq_ignore_ascii_case("all") {
            return Ok(self.full_range(total, None));
        }

        if is_number(mode) {
            let value = parse_number(mode)?;
            if mode.len() <= self.offset_digit_limit {
                return Ok(OffsetPlan {
                    offsets: vec![value],
                    filter: None,
                });
            }
            return Ok(self.full_range(total, Some(IdFilter::Exact(mode.to_string()))));
        }

        if let Some((start, end)) = mode.split_once('-') {
            let start = match start.trim() {
                "start" => 0,
                s => parse_number(s)?,
            };
            let end = match end.trim() {
                "end" => total,
                s => parse_number(s)?,
            };

            if start <= total && end <= total {
                if end < start {
                    return Err(Error::InvalidFetchMode(format!(
                        "range end {end} is before start {start}"
                    )));
                }
                let pages = (end - start).div_ceil(self.page_size);
                let offsets = (0..pages).map(|i| start + i * self.page_size).collect();
                return Ok(OffsetPlan {
                    offsets,
                    filter: None,
                });
            }

            let (low, high) = if start <= end { (start, end) } else { (end, start) };
            return Ok(self.full_range(total, Some(IdFilter::Range { low, high })));
        }

        Err(Error::InvalidFetchMode(mode.to_string()))
    }

    fn full_range(&self, total: u64, filter: Option<IdFilter>) -> OffsetPlan {
        OffsetPlan {
            offsets: (0..total).step_by(self.page_size as usize).collect(),
            filter,
        }
    }
}

fn is_number(s: &str) -> bool {
    !s.is_empty() && s.bytes().all(|b| b.is_ascii_digit())
}

fn parse_number(s: &str) -> Result<u64> {
    if !is_number(s) {
        return Err(Error::InvalidFetchMode(format!("not a number: {s:?}")));
    }
    s.parse()
        .map_err(|_| Error::InvalidFetchMode(format!("number out of range: {s}")))
}
