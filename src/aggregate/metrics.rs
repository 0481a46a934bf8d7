//! Operational counters for the aggregation engine
//!
//! Prometheus counters covering the paths an operator needs to watch:
//! ingest volume per server, late-event drops, bucket lifecycle churn,
//! dimension-cap overflows, and query traffic. Exported in the Prometheus
//! text format via [`gather_metrics`].

use lazy_static::lazy_static;
use prometheus::{
    register_int_counter, register_int_counter_vec, Encoder, IntCounter, IntCounterVec,
    TextEncoder,
};

lazy_static! {
    /// Events accepted into a bucket, by capturing server.
    pub static ref EVENTS_INGESTED: IntCounterVec = register_int_counter_vec!(
        "dnsmill_events_ingested_total",
        "DNS events applied to rollup state",
        &["server"]
    ).unwrap();

    /// Late events dropped at ingest, by capturing server.
    pub static ref LATE_EVENTS: IntCounterVec = register_int_counter_vec!(
        "dnsmill_late_events_total",
        "DNS events dropped because their bucket was sealed or past grace",
        &["server"]
    ).unwrap();

    /// Buckets transitioned from Open to Sealed.
    pub static ref BUCKETS_SEALED: IntCounter = register_int_counter!(
        "dnsmill_buckets_sealed_total",
        "Time buckets sealed read-only"
    ).unwrap();

    /// Buckets reclaimed past the retention horizon.
    pub static ref BUCKETS_EVICTED: IntCounter = register_int_counter!(
        "dnsmill_buckets_evicted_total",
        "Time buckets evicted past retention"
    ).unwrap();

    /// New dimension values dropped by the per-bucket value cap.
    pub static ref DIMENSION_VALUE_OVERFLOWS: IntCounter = register_int_counter!(
        "dnsmill_dimension_value_overflows_total",
        "Dimension values folded into overflow by the per-bucket cap"
    ).unwrap();

    /// Queries served, by requested dimension.
    pub static ref QUERIES_SERVED: IntCounterVec = register_int_counter_vec!(
        "dnsmill_queries_total",
        "Read queries answered by the merge engine",
        &["dimension"]
    ).unwrap();
}

/// Render all registered metrics in the Prometheus text format.
pub fn gather_metrics() -> String {
    let encoder = TextEncoder::new();
    let families = prometheus::gather();
    let mut buffer = Vec::new();
    if encoder.encode(&families, &mut buffer).is_err() {
        return String::new();
    }
    String::from_utf8(buffer).unwrap_or_default()
}
