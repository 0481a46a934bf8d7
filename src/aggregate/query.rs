//! Query/merge engine
//!
//! Answers dashboard-style read requests: pick a dimension, a time range,
//! an output interval, a server set, and optionally a top-K limit. The
//! engine re-buckets ingestion buckets onto the requested grid, merges
//! accumulators across servers and sub-buckets (all merges are associative,
//! so grouping order is irrelevant), truncates breakdowns deterministically,
//! and emits a gap-free series in ascending timestamp order.

use super::bucket::{BucketState, BucketStore};
use super::metrics::QUERIES_SERVED;
use super::rollup::{CountSlot, Dimension, DimensionAccumulator};
use derive_more::{Display, Error};
use serde::{Deserialize, Serialize};
use std::cmp::Reverse;
use std::collections::HashMap;
use std::sync::Arc;

/// Half-open time range `[start, end)` in unix seconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeRange {
    pub start: u64,
    pub end: u64,
}

impl TimeRange {
    pub fn new(start: u64, end: u64) -> Self {
        Self { start, end }
    }
}

/// One read request against the engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryRequest {
    /// Dimension to aggregate or break down by.
    pub dimension: Dimension,
    /// Time range to cover.
    pub range: TimeRange,
    /// Output bucket width; must be a positive multiple of the ingest width
    /// (the dashboard's adjustable `$interval`, coarsening only).
    pub interval_secs: u64,
    /// Servers to merge across (multi-server OR). Empty means all servers.
    #[serde(default)]
    pub servers: Vec<String>,
    /// Keep only the K highest-counted values per output point.
    #[serde(default)]
    pub top_k: Option<usize>,
    /// With `top_k`, fold the truncated remainder into an `"other"` entry
    /// (pie-chart grouping) instead of dropping it.
    #[serde(default)]
    pub group_remainder: bool,
    /// Merge still-open buckets for a live view. Live points are
    /// approximate; the response says whether any were included.
    #[serde(default)]
    pub include_open: bool,
}

/// One entry of a per-point breakdown.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BreakdownEntry {
    pub value: String,
    pub count: u64,
}

/// The merged value at one output timestamp.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum PointValue {
    /// Plain event count (flag dimensions).
    Count(u64),
    /// Packet size statistics; `average` is derived from the merged sum and
    /// count, never from averaging pre-computed averages.
    Size {
        sum_bytes: u64,
        events: u64,
        average: f64,
    },
    /// Approximate distinct-domain count.
    Distinct(f64),
    /// Per-value breakdown, ordered by count descending.
    Breakdown(Vec<BreakdownEntry>),
}

/// One output time point.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryPoint {
    pub timestamp: u64,
    #[serde(flatten)]
    pub value: PointValue,
}

/// A complete query answer: a regular time grid with zero-filled gaps.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QuerySeries {
    pub points: Vec<QueryPoint>,
    /// True if any merged bucket was still open (live, approximate data).
    pub includes_open: bool,
}

/// Caller errors. A range with no data is *not* an error; it yields an
/// empty (or zero-filled) series.
#[derive(Debug, Clone, Display, Error, PartialEq, Eq)]
pub enum QueryError {
    /// Interval is zero or not a multiple of the ingest bucket width.
    #[display(
        fmt = "interval {}s is not a positive multiple of the {}s ingest bucket width",
        interval_secs,
        bucket_width_secs
    )]
    InvalidInterval {
        interval_secs: u64,
        bucket_width_secs: u64,
    },
    /// `range.end` is not after `range.start`.
    #[display(fmt = "empty time range [{}, {})", start, end)]
    EmptyRange { start: u64, end: u64 },
}

pub type QueryResult = Result<QuerySeries, QueryError>;

/// Read-side engine over the shared bucket store. Queries are pure reads:
/// aborting one mid-merge has no side effects.
pub struct QueryEngine {
    store: Arc<BucketStore>,
}

impl QueryEngine {
    pub fn new(store: Arc<BucketStore>) -> Self {
        Self { store }
    }

    /// Answer one request. See the module docs for the merge protocol.
    pub fn query(&self, request: &QueryRequest) -> QueryResult {
        let width = self.store.bucket_width();
        if request.interval_secs == 0 || request.interval_secs % width != 0 {
            return Err(QueryError::InvalidInterval {
                interval_secs: request.interval_secs,
                bucket_width_secs: width,
            });
        }
        if request.range.end <= request.range.start {
            return Err(QueryError::EmptyRange {
                start: request.range.start,
                end: request.range.end,
            });
        }
        QUERIES_SERVED
            .with_label_values(&[request.dimension.name()])
            .inc();

        let interval = request.interval_secs;
        let grid_start = request.range.start - request.range.start % interval;
        let slots = ((request.range.end - grid_start) + interval - 1) / interval;

        // One snapshot of every overlapping bucket; the per-slot grouping
        // below does the re-bucketing.
        let buckets = self
            .store
            .buckets_in_range(None, grid_start, request.range.end);

        let precision = self.store.sketch_precision();
        let mut merged: Vec<DimensionAccumulator> = (0..slots)
            .map(|_| DimensionAccumulator::empty(request.dimension, precision))
            .collect();
        let mut includes_open = false;

        for bucket in buckets {
            if !request.servers.is_empty()
                && !request.servers.iter().any(|s| s == bucket.server())
            {
                continue;
            }
            match bucket.state() {
                BucketState::Open if !request.include_open => continue,
                BucketState::Open => includes_open = true,
                BucketState::Sealed => {}
            }
            let slot = ((bucket.start() - grid_start) / interval) as usize;
            let accumulator = bucket.with_rollups(|r| r.accumulator(request.dimension));
            merged[slot].merge_from(&accumulator);
        }

        let points = merged
            .into_iter()
            .enumerate()
            .map(|(i, accumulator)| QueryPoint {
                timestamp: grid_start + i as u64 * interval,
                value: finish_point(accumulator, request.top_k, request.group_remainder),
            })
            .collect();

        Ok(QuerySeries {
            points,
            includes_open,
        })
    }
}

/// Turn a fully-merged accumulator into its output value, applying top-K
/// truncation for breakdown dimensions.
fn finish_point(
    accumulator: DimensionAccumulator,
    top_k: Option<usize>,
    group_remainder: bool,
) -> PointValue {
    match accumulator {
        DimensionAccumulator::Flag(count) => PointValue::Count(count),
        DimensionAccumulator::Size(stat) => PointValue::Size {
            sum_bytes: stat.sum_bytes,
            events: stat.events,
            average: stat.average(),
        },
        DimensionAccumulator::Distinct(sketch) => PointValue::Distinct(sketch.estimate()),
        DimensionAccumulator::Counts(map) => {
            PointValue::Breakdown(rank_breakdown(map, top_k, group_remainder))
        }
    }
}

/// Order a merged count map: count descending, ties broken by first-seen
/// sequence so repeated queries over the same state rank identically.
fn rank_breakdown(
    map: HashMap<String, CountSlot>,
    top_k: Option<usize>,
    group_remainder: bool,
) -> Vec<BreakdownEntry> {
    let mut ranked: Vec<(String, CountSlot)> = map.into_iter().collect();
    ranked.sort_by_key(|(_, slot)| (Reverse(slot.count), slot.first_seen));

    let k = match top_k {
        Some(k) => k,
        None => {
            return ranked
                .into_iter()
                .map(|(value, slot)| BreakdownEntry {
                    value,
                    count: slot.count,
                })
                .collect();
        }
    };

    let mut entries: Vec<BreakdownEntry> = ranked
        .iter()
        .take(k)
        .map(|(value, slot)| BreakdownEntry {
            value: value.clone(),
            count: slot.count,
        })
        .collect();

    if group_remainder && ranked.len() > k {
        let remainder: u64 = ranked[k..].iter().map(|(_, slot)| slot.count).sum();
        entries.push(BreakdownEntry {
            value: "other".to_string(),
            count: remainder,
        });
    }
    entries
}
