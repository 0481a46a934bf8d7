//! Time-bucket lifecycle and retention management
//!
//! Buckets are keyed by `(server, bucket_start)` and live in a sharded
//! concurrent map, so applies to different buckets never contend. Each
//! bucket's accumulators sit behind a single lock shared with its sealed
//! flag: sealing takes the write lock, so an apply can never land after a
//! bucket seals. Sealing and eviction are time-triggered by the engine's
//! housekeeping task, never by ingest itself.

use super::config::AggregateConfig;
use super::metrics::{BUCKETS_EVICTED, BUCKETS_SEALED, DIMENSION_VALUE_OVERFLOWS};
use super::rollup::BucketRollups;
use super::DnsEvent;
use chrono::NaiveDate;
use dashmap::DashMap;
use parking_lot::RwLock;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Identity of one bucket: capturing server plus aligned start time.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct BucketKey {
    pub server: String,
    pub start: u64,
}

/// Lifecycle state visible to callers. Evicted buckets are simply gone.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BucketState {
    /// Accepting applies; readable only as a live (approximate) view.
    Open,
    /// Read-only; end time plus grace period has elapsed.
    Sealed,
}

struct BucketInner {
    sealed: bool,
    rollups: BucketRollups,
}

/// One `(server, bucket_start)` aggregation bucket.
pub struct Bucket {
    server: String,
    start: u64,
    width: u64,
    inner: RwLock<BucketInner>,
}

impl Bucket {
    pub fn server(&self) -> &str {
        &self.server
    }

    /// Inclusive start of the bucket's `[start, start + width)` interval.
    pub fn start(&self) -> u64 {
        self.start
    }

    /// Exclusive end of the interval.
    pub fn end(&self) -> u64 {
        self.start + self.width
    }

    /// UTC day this bucket belongs to (the original schema's day partition).
    pub fn day(&self) -> Option<NaiveDate> {
        chrono::DateTime::from_timestamp(self.start as i64, 0).map(|dt| dt.date_naive())
    }

    pub fn state(&self) -> BucketState {
        if self.inner.read().sealed {
            BucketState::Sealed
        } else {
            BucketState::Open
        }
    }

    /// Run a closure against this bucket's rollups under the read lock.
    ///
    /// Sealed buckets never change, so the lock is uncontended there; on an
    /// open bucket the caller gets a live snapshot with no linearizability
    /// guarantee across buckets.
    pub fn with_rollups<R>(&self, f: impl FnOnce(&BucketRollups) -> R) -> R {
        f(&self.inner.read().rollups)
    }

    fn apply(&self, event: &DnsEvent, seq: u64, value_cap: usize) -> bool {
        let mut inner = self.inner.write();
        if inner.sealed {
            return false;
        }
        let before = inner.rollups.overflowed_values();
        inner.rollups.apply(event, seq, value_cap);
        let dropped = inner.rollups.overflowed_values() - before;
        if dropped > 0 {
            DIMENSION_VALUE_OVERFLOWS.inc_by(dropped);
        }
        true
    }

    fn seal(&self) -> bool {
        let mut inner = self.inner.write();
        if inner.sealed {
            return false;
        }
        inner.sealed = true;
        true
    }
}

/// Why an apply was refused. Both cases surface as a late event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyRejection {
    /// The target bucket's seal deadline has already passed.
    PastGraceWindow,
    /// The target bucket exists and has been sealed.
    BucketSealed,
}

/// Sharded store of all live buckets for all servers.
pub struct BucketStore {
    buckets: DashMap<BucketKey, Arc<Bucket>>,
    width: u64,
    grace: u64,
    retention: u64,
    sketch_precision: u8,
    value_cap: usize,
    /// Engine-wide first-seen sequence for top-K tie-breaking.
    seq: AtomicU64,
}

impl BucketStore {
    pub fn new(config: &AggregateConfig) -> Self {
        Self {
            buckets: DashMap::new(),
            width: config.bucket_width_secs,
            grace: config.seal_grace_secs,
            retention: config.retention_secs,
            sketch_precision: config.sketch_precision,
            value_cap: config.max_values_per_dimension,
            seq: AtomicU64::new(0),
        }
    }

    /// Ingest-side bucket width in seconds.
    pub fn bucket_width(&self) -> u64 {
        self.width
    }

    pub fn sketch_precision(&self) -> u8 {
        self.sketch_precision
    }

    /// Align a timestamp down to its bucket start.
    pub fn bucket_start(&self, timestamp: u64) -> u64 {
        timestamp - timestamp % self.width
    }

    fn seal_deadline(&self, start: u64) -> u64 {
        start + self.width + self.grace
    }

    /// Route one event into its bucket, creating the bucket if this is the
    /// first event that maps into it. `now` is passed in so that replay
    /// tools and tests control the clock.
    pub fn apply_event(&self, event: &DnsEvent, now: u64) -> Result<(), ApplyRejection> {
        let start = self.bucket_start(event.timestamp);
        if self.seal_deadline(start) <= now {
            return Err(ApplyRejection::PastGraceWindow);
        }

        let key = BucketKey {
            server: event.server.clone(),
            start,
        };
        let bucket = self
            .buckets
            .entry(key)
            .or_insert_with(|| {
                Arc::new(Bucket {
                    server: event.server.clone(),
                    start,
                    width: self.width,
                    inner: RwLock::new(BucketInner {
                        sealed: false,
                        rollups: BucketRollups::new(self.sketch_precision),
                    }),
                })
            })
            .clone();

        let seq = self.seq.fetch_add(1, Ordering::Relaxed);
        if bucket.apply(event, seq, self.value_cap) {
            Ok(())
        } else {
            Err(ApplyRejection::BucketSealed)
        }
    }

    /// Seal every open bucket whose grace window has elapsed. Returns the
    /// number of buckets sealed.
    pub fn seal_due(&self, now: u64) -> usize {
        let mut sealed = 0;
        for entry in self.buckets.iter() {
            let bucket = entry.value();
            if self.seal_deadline(bucket.start) <= now && bucket.seal() {
                sealed += 1;
            }
        }
        if sealed > 0 {
            BUCKETS_SEALED.inc_by(sealed as u64);
            log::debug!("sealed {} bucket(s)", sealed);
        }
        sealed
    }

    /// Drop buckets past the retention horizon. Returns the number evicted.
    pub fn evict_expired(&self, now: u64) -> usize {
        let retention = self.retention;
        let before = self.buckets.len();
        self.buckets
            .retain(|key, _| now.saturating_sub(key.start) <= retention);
        let evicted = before - self.buckets.len();
        if evicted > 0 {
            BUCKETS_EVICTED.inc_by(evicted as u64);
            log::info!("evicted {} bucket(s) past retention horizon", evicted);
        }
        evicted
    }

    /// Snapshot of buckets overlapping `[from, to)`, optionally restricted
    /// to one server, ordered by `(start, server)`. The returned handles
    /// stay valid even if the bucket is evicted mid-query.
    pub fn buckets_in_range(
        &self,
        server: Option<&str>,
        from: u64,
        to: u64,
    ) -> Vec<Arc<Bucket>> {
        let mut matched: Vec<Arc<Bucket>> = self
            .buckets
            .iter()
            .filter(|entry| {
                let bucket = entry.value();
                bucket.start < to
                    && bucket.end() > from
                    && server.map_or(true, |s| s == bucket.server)
            })
            .map(|entry| entry.value().clone())
            .collect();
        matched.sort_by(|a, b| (a.start, a.server.as_str()).cmp(&(b.start, b.server.as_str())));
        matched
    }

    /// Number of live (open or sealed) buckets.
    pub fn len(&self) -> usize {
        self.buckets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buckets.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aggregate::config::AggregateConfig;

    fn config() -> AggregateConfig {
        AggregateConfig {
            bucket_width_secs: 10,
            seal_grace_secs: 5,
            retention_secs: 3_600,
            ..AggregateConfig::default()
        }
    }

    fn event(server: &str, timestamp: u64) -> DnsEvent {
        DnsEvent {
            server: server.to_string(),
            timestamp,
            question: "example.com".to_string(),
            query_type: 1,
            query_class: 1,
            op_code: 0,
            response_code: 0,
            protocol: "udp".to_string(),
            ip_version: 4,
            prefix: "192.0.2.0".parse().unwrap(),
            packet_size: 64,
            edns_present: false,
            do_bit: false,
        }
    }

    #[test]
    fn test_bucket_created_on_first_event() {
        let store = BucketStore::new(&config());
        assert!(store.is_empty());
        store.apply_event(&event("a", 100), 100).unwrap();
        assert_eq!(store.len(), 1);
        let buckets = store.buckets_in_range(Some("a"), 0, 1_000);
        assert_eq!(buckets.len(), 1);
        assert_eq!(buckets[0].start(), 100);
        assert_eq!(buckets[0].state(), BucketState::Open);
    }

    #[test]
    fn test_apply_past_grace_window_is_rejected() {
        let store = BucketStore::new(&config());
        // Bucket [100, 110) seals at 115; at now=115 the event is late.
        let err = store.apply_event(&event("a", 105), 115).unwrap_err();
        assert_eq!(err, ApplyRejection::PastGraceWindow);
        assert!(store.is_empty());
    }

    #[test]
    fn test_apply_after_seal_is_rejected_and_does_not_mutate() {
        let store = BucketStore::new(&config());
        store.apply_event(&event("a", 100), 100).unwrap();
        assert_eq!(store.seal_due(115), 1);

        let bucket = store.buckets_in_range(Some("a"), 0, 1_000)[0].clone();
        assert_eq!(bucket.state(), BucketState::Sealed);
        let before = bucket.with_rollups(|r| {
            match r.accumulator(crate::aggregate::Dimension::Domain) {
                crate::aggregate::DimensionAccumulator::Counts(m) => m["example.com"].count,
                _ => unreachable!(),
            }
        });

        // Force the sealed-bucket path: the grace check would also reject
        // this, so drive the bucket directly.
        assert!(!bucket.apply(&event("a", 105), 99, 1_024));
        let after = bucket.with_rollups(|r| {
            match r.accumulator(crate::aggregate::Dimension::Domain) {
                crate::aggregate::DimensionAccumulator::Counts(m) => m["example.com"].count,
                _ => unreachable!(),
            }
        });
        assert_eq!(before, after);
    }

    #[test]
    fn test_seal_is_time_triggered_not_event_triggered() {
        let store = BucketStore::new(&config());
        store.apply_event(&event("a", 100), 100).unwrap();
        // Deadline is 115: not yet.
        assert_eq!(store.seal_due(114), 0);
        assert_eq!(store.seal_due(115), 1);
        // Idempotent.
        assert_eq!(store.seal_due(120), 0);
    }

    #[test]
    fn test_eviction_past_retention_horizon() {
        let store = BucketStore::new(&config());
        store.apply_event(&event("a", 100), 100).unwrap();
        store.apply_event(&event("a", 5_000), 5_000).unwrap();
        assert_eq!(store.evict_expired(3_000), 0);
        // now - 100 > 3600 evicts only the first bucket.
        assert_eq!(store.evict_expired(3_701), 1);
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn test_buckets_in_range_filters_and_orders() {
        let store = BucketStore::new(&config());
        store.apply_event(&event("b", 120), 120).unwrap();
        store.apply_event(&event("a", 120), 120).unwrap();
        store.apply_event(&event("a", 100), 100).unwrap();
        store.apply_event(&event("a", 500), 500).unwrap();

        let all = store.buckets_in_range(None, 100, 130);
        let keys: Vec<(u64, String)> = all
            .iter()
            .map(|b| (b.start(), b.server().to_string()))
            .collect();
        assert_eq!(
            keys,
            vec![
                (100, "a".to_string()),
                (120, "a".to_string()),
                (120, "b".to_string()),
            ]
        );

        let only_b = store.buckets_in_range(Some("b"), 0, 1_000);
        assert_eq!(only_b.len(), 1);
        assert_eq!(only_b[0].server(), "b");
    }

    #[test]
    fn test_servers_are_isolated() {
        let store = BucketStore::new(&config());
        store.apply_event(&event("a", 100), 100).unwrap();
        store.apply_event(&event("b", 100), 100).unwrap();
        assert_eq!(store.len(), 2);
    }

    #[test]
    fn test_day_partition() {
        let store = BucketStore::new(&config());
        // 2017-09-28 (the sample dashboard's capture day).
        store.apply_event(&event("a", 1_506_625_902), 1_506_625_902).unwrap();
        let bucket = store.buckets_in_range(None, 0, u64::MAX)[0].clone();
        let day = bucket.day().unwrap();
        assert_eq!(day.to_string(), "2017-09-28");
    }
}
