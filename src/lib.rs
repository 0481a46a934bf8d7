//! dnsmill: streaming DNS-traffic aggregation engine
//!
//! Consumes already-decoded DNS event records from one or more monitoring
//! servers and maintains mergeable, time-bucketed rollups across every
//! dashboard dimension, plus an approximate distinct-domain count.
//!
//! # Features
//!
//! * Fixed-width time buckets partitioned by capturing server and UTC day
//! * Lazily-growing per-dimension rollups (no fixed value enumeration)
//! * Mergeable HyperLogLog sketch for unique-domain panels
//! * Open -> Sealed -> Evicted bucket lifecycle on a background schedule
//! * Query-time re-bucketing, multi-server merge, and deterministic top-K
//!
//! # Architecture
//!
//! Everything lives under one module:
//! * `aggregate` - bucket store, ingestion pipeline, query/merge engine

/// Aggregation engine: rollups, buckets, ingestion, and queries
pub mod aggregate;
