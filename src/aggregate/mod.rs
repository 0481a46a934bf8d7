//! Streaming DNS-Traffic Aggregation Engine
//!
//! Ingests decoded DNS events from one or more monitoring servers and
//! maintains continuously-updated, mergeable rollups across every query
//! dimension (domain, record type/class, opcode, response code, transport,
//! IP version/prefix, EDNS flags, packet size) plus an approximate
//! distinct-domain count, bucketed by time and partitioned by capturing
//! server. A query/merge engine answers dashboard-style reads: adjustable
//! interval, multi-server filter, per-dimension breakdowns, top-K.

pub mod bucket;
pub mod config;
pub mod ingest;
pub mod metrics;
pub mod query;
pub mod rollup;
pub mod sketch;

pub use bucket::{Bucket, BucketKey, BucketState, BucketStore};
pub use config::{AggregateConfig, ConfigError};
pub use ingest::{IngestError, IngestPipeline};
pub use metrics::gather_metrics;
pub use query::{
    BreakdownEntry, PointValue, QueryEngine, QueryError, QueryPoint, QueryRequest, QuerySeries,
    TimeRange,
};
pub use rollup::{BucketRollups, CountSlot, Dimension, DimensionAccumulator, SizeStat};
pub use sketch::HyperLogLog;

use serde::{Deserialize, Serialize};
use std::net::IpAddr;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// One decoded DNS transaction observed on the wire.
///
/// Produced upstream by the capture/parser layer; the engine never
/// re-derives these fields. The shape follows the classic analytics row:
/// numeric wire codes stay numeric, the IP prefix arrives pre-masked.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DnsEvent {
    /// Id of the capturing agent.
    pub server: String,
    /// Wall-clock seconds since the unix epoch.
    pub timestamp: u64,
    /// Queried domain name.
    pub question: String,
    /// DNS record type code.
    pub query_type: u16,
    /// DNS class code.
    pub query_class: u16,
    /// DNS opcode.
    pub op_code: u8,
    /// DNS response code.
    pub response_code: u8,
    /// Transport protocol ("udp", "tcp", ...). Open-ended on purpose.
    pub protocol: String,
    /// 4 or 6.
    pub ip_version: u8,
    /// Masked source-or-destination prefix.
    pub prefix: IpAddr,
    /// Packet size in bytes.
    pub packet_size: u32,
    /// Whether the packet carried an EDNS0 OPT record.
    pub edns_present: bool,
    /// Whether the DNSSEC DO bit was set.
    pub do_bit: bool,
}

/// Current wall-clock time in unix seconds.
pub(crate) fn now_unix() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

/// The assembled engine: ingestion front-end, bucket store, query engine,
/// and the background sealing/eviction schedule.
pub struct AggregationEngine {
    config: AggregateConfig,
    store: Arc<BucketStore>,
    pipeline: IngestPipeline,
    query: QueryEngine,
}

impl AggregationEngine {
    /// Build an engine from a validated configuration. Configuration
    /// errors are the only fatal startup condition.
    pub fn new(config: AggregateConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        let store = Arc::new(BucketStore::new(&config));
        let pipeline = IngestPipeline::new(store.clone());
        let query = QueryEngine::new(store.clone());
        Ok(Self {
            config,
            store,
            pipeline,
            query,
        })
    }

    pub fn config(&self) -> &AggregateConfig {
        &self.config
    }

    /// Apply one event against the wall clock. The only rejection is
    /// [`IngestError::LateEvent`], which the caller may treat as routine.
    pub fn ingest(&self, event: &DnsEvent) -> Result<(), IngestError> {
        self.pipeline.ingest(event)
    }

    /// Clock-injected ingest for replaying historical captures.
    pub fn ingest_at(&self, event: &DnsEvent, now: u64) -> Result<(), IngestError> {
        self.pipeline.ingest_at(event, now)
    }

    /// Answer a read request. Pure and side-effect free.
    pub fn query(&self, request: &QueryRequest) -> Result<QuerySeries, QueryError> {
        self.query.query(request)
    }

    /// Seal due buckets and evict expired ones as of `now`. The background
    /// task calls this on a timer; replay tools call it directly.
    pub fn run_housekeeping_at(&self, now: u64) -> (usize, usize) {
        let sealed = self.store.seal_due(now);
        let evicted = self.store.evict_expired(now);
        (sealed, evicted)
    }

    /// Spawn the periodic sealing/eviction task on the current tokio
    /// runtime. Runs independently of ingest; never touches the hot path.
    pub fn start_background_tasks(&self) {
        let store = self.store.clone();
        let period = Duration::from_secs(self.config.housekeeping_interval_secs);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            loop {
                interval.tick().await;
                let now = now_unix();
                store.seal_due(now);
                store.evict_expired(now);
            }
        });
    }

    /// Events accepted since startup.
    pub fn accepted_events(&self) -> u64 {
        self.pipeline.accepted()
    }

    /// Late events dropped since startup.
    pub fn late_events(&self) -> u64 {
        self.pipeline.late_events()
    }

    /// Number of live (open or sealed) buckets across all servers.
    pub fn bucket_count(&self) -> usize {
        self.store.len()
    }
}
