//! Event ingestion pipeline
//!
//! The hot path: route each decoded DNS event into its bucket and fan it
//! out to every dimension rollup and the cardinality sketch. The only
//! rejection is a late event, which is dropped and counted: lateness must
//! never stall ingestion, and must never pass silently.

use super::bucket::BucketStore;
use super::metrics::{EVENTS_INGESTED, LATE_EVENTS};
use super::{now_unix, DnsEvent};
use derive_more::{Display, Error};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Ingestion failure. `LateEvent` is the only rejection the pipeline
/// produces; it is recovered locally by dropping the event.
#[derive(Debug, Clone, Display, Error, PartialEq, Eq)]
pub enum IngestError {
    /// The event's bucket is already sealed (or past its grace window).
    #[display(
        fmt = "late event from server '{}' for sealed bucket starting at {}",
        server,
        bucket_start
    )]
    LateEvent { server: String, bucket_start: u64 },
}

pub type IngestResult = Result<(), IngestError>;

/// Concurrent ingestion front-end over a [`BucketStore`].
pub struct IngestPipeline {
    store: Arc<BucketStore>,
    accepted: AtomicU64,
    late: AtomicU64,
}

impl IngestPipeline {
    pub fn new(store: Arc<BucketStore>) -> Self {
        Self {
            store,
            accepted: AtomicU64::new(0),
            late: AtomicU64::new(0),
        }
    }

    /// Apply one event against the wall clock.
    pub fn ingest(&self, event: &DnsEvent) -> IngestResult {
        self.ingest_at(event, now_unix())
    }

    /// Clock-injected variant used by replay tools and tests: `now` decides
    /// which buckets still accept applies.
    pub fn ingest_at(&self, event: &DnsEvent, now: u64) -> IngestResult {
        match self.store.apply_event(event, now) {
            Ok(()) => {
                self.accepted.fetch_add(1, Ordering::Relaxed);
                EVENTS_INGESTED.with_label_values(&[&event.server]).inc();
                Ok(())
            }
            Err(rejection) => {
                let bucket_start = self.store.bucket_start(event.timestamp);
                self.late.fetch_add(1, Ordering::Relaxed);
                LATE_EVENTS.with_label_values(&[&event.server]).inc();
                log::debug!(
                    "dropping late event: server={} bucket_start={} reason={:?}",
                    event.server,
                    bucket_start,
                    rejection
                );
                Err(IngestError::LateEvent {
                    server: event.server.clone(),
                    bucket_start,
                })
            }
        }
    }

    /// Events applied since startup.
    pub fn accepted(&self) -> u64 {
        self.accepted.load(Ordering::Relaxed)
    }

    /// Late events dropped since startup.
    pub fn late_events(&self) -> u64 {
        self.late.load(Ordering::Relaxed)
    }
}
