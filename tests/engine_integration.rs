//! End-to-end tests for the aggregation engine: ingest through sealing
//! through query, exercising the merge protocol the dashboard relies on.

use dnsmill::aggregate::{
    AggregateConfig, AggregationEngine, Dimension, DnsEvent, IngestError, PointValue,
    QueryRequest, TimeRange,
};

fn engine(width: u64) -> AggregationEngine {
    AggregationEngine::new(AggregateConfig {
        bucket_width_secs: width,
        seal_grace_secs: 5,
        retention_secs: 86_400,
        ..AggregateConfig::default()
    })
    .unwrap()
}

fn event(server: &str, timestamp: u64, question: &str) -> DnsEvent {
    DnsEvent {
        server: server.to_string(),
        timestamp,
        question: question.to_string(),
        query_type: 1,
        query_class: 1,
        op_code: 0,
        response_code: 0,
        protocol: "udp".to_string(),
        ip_version: 4,
        prefix: "192.0.2.0".parse().unwrap(),
        packet_size: 100,
        edns_present: false,
        do_bit: false,
    }
}

fn request(dimension: Dimension, range: TimeRange, interval: u64) -> QueryRequest {
    QueryRequest {
        dimension,
        range,
        interval_secs: interval,
        servers: Vec::new(),
        top_k: None,
        group_remainder: false,
        include_open: false,
    }
}

fn breakdown_counts(value: &PointValue) -> Vec<(String, u64)> {
    match value {
        PointValue::Breakdown(entries) => entries
            .iter()
            .map(|e| (e.value.clone(), e.count))
            .collect(),
        other => panic!("expected breakdown, got {:?}", other),
    }
}

#[test]
fn merged_counts_are_independent_of_ingest_order() {
    let events: Vec<DnsEvent> = (0..60)
        .map(|i| {
            event(
                if i % 2 == 0 { "a" } else { "b" },
                100 + (i % 30),
                &format!("host-{}.example", i % 7),
            )
        })
        .collect();

    let forward = engine(10);
    for ev in &events {
        forward.ingest_at(ev, ev.timestamp).unwrap();
    }
    let backward = engine(10);
    for ev in events.iter().rev() {
        backward.ingest_at(ev, ev.timestamp).unwrap();
    }

    forward.run_housekeeping_at(1_000);
    backward.run_housekeeping_at(1_000);

    let req = request(Dimension::Domain, TimeRange::new(100, 130), 30);
    let a = forward.query(&req).unwrap();
    let b = backward.query(&req).unwrap();

    let mut counts_a = breakdown_counts(&a.points[0].value);
    let mut counts_b = breakdown_counts(&b.points[0].value);
    counts_a.sort();
    counts_b.sort();
    assert_eq!(counts_a, counts_b);
}

#[test]
fn rebucketing_matches_direct_coarse_ingest() {
    // Same events into a 10s-bucket engine queried at 20s, and a
    // 20s-bucket engine queried at 20s: identical series.
    let events: Vec<DnsEvent> = (0..40)
        .map(|i| event("a", 200 + i, &format!("h{}.example", i % 5)))
        .collect();

    let fine = engine(10);
    let coarse = engine(20);
    for ev in &events {
        fine.ingest_at(ev, ev.timestamp).unwrap();
        coarse.ingest_at(ev, ev.timestamp).unwrap();
    }
    fine.run_housekeeping_at(10_000);
    coarse.run_housekeeping_at(10_000);

    let req = request(Dimension::Domain, TimeRange::new(200, 240), 20);
    let fine_series = fine.query(&req).unwrap();
    let coarse_series = coarse.query(&req).unwrap();

    assert_eq!(fine_series.points.len(), coarse_series.points.len());
    for (f, c) in fine_series.points.iter().zip(&coarse_series.points) {
        assert_eq!(f.timestamp, c.timestamp);
        let mut fc = breakdown_counts(&f.value);
        let mut cc = breakdown_counts(&c.value);
        fc.sort();
        cc.sort();
        assert_eq!(fc, cc);
    }
}

#[test]
fn zero_event_slot_appears_as_zero_point() {
    let e = engine(10);
    e.ingest_at(&event("a", 100, "x.example"), 100).unwrap();
    e.ingest_at(&event("a", 130, "x.example"), 130).unwrap();
    e.run_housekeeping_at(1_000);

    let series = e
        .query(&request(Dimension::Domain, TimeRange::new(100, 140), 10))
        .unwrap();
    let timestamps: Vec<u64> = series.points.iter().map(|p| p.timestamp).collect();
    assert_eq!(timestamps, vec![100, 110, 120, 130]);
    assert_eq!(breakdown_counts(&series.points[1].value), Vec::new());
    assert_eq!(breakdown_counts(&series.points[2].value), Vec::new());
}

#[test]
fn top_five_with_deterministic_tie_break() {
    let e = engine(10);
    // {a:10, b:8, c:8, d:5, e:3, f:1}; b is seen before c.
    for (name, count) in &[("a", 10u64), ("b", 8), ("c", 8), ("d", 5), ("e", 3), ("f", 1)] {
        for _ in 0..*count {
            e.ingest_at(&event("s1", 100, &format!("{}.example", name)), 100)
                .unwrap();
        }
    }
    e.run_housekeeping_at(1_000);

    let mut req = request(Dimension::Domain, TimeRange::new(100, 110), 10);
    req.top_k = Some(5);
    for _ in 0..5 {
        let series = e.query(&req).unwrap();
        let counts = breakdown_counts(&series.points[0].value);
        assert_eq!(counts.len(), 5);
        assert_eq!(counts[0], ("a.example".to_string(), 10));
        assert_eq!(counts[1], ("b.example".to_string(), 8));
        assert_eq!(counts[2], ("c.example".to_string(), 8));
        assert_eq!(counts[3], ("d.example".to_string(), 5));
        assert_eq!(counts[4], ("e.example".to_string(), 3));
    }
}

#[test]
fn average_size_over_merged_accumulators() {
    let e = engine(10);
    for _ in 0..3 {
        let mut ev = event("a", 100, "x.example");
        ev.packet_size = 100;
        e.ingest_at(&ev, 100).unwrap();
    }
    for _ in 0..7 {
        let mut ev = event("b", 100, "x.example");
        ev.packet_size = 100;
        e.ingest_at(&ev, 100).unwrap();
    }
    e.run_housekeeping_at(1_000);

    let series = e
        .query(&request(Dimension::PacketSize, TimeRange::new(100, 110), 10))
        .unwrap();
    match series.points[0].value {
        PointValue::Size {
            sum_bytes,
            events,
            average,
        } => {
            assert_eq!(sum_bytes, 1_000);
            assert_eq!(events, 10);
            assert_eq!(average, 100.0);
        }
        ref other => panic!("expected size value, got {:?}", other),
    }
}

#[test]
fn sealed_bucket_rejects_late_event_without_mutation() {
    let e = engine(10);
    e.ingest_at(&event("a", 100, "x.example"), 100).unwrap();
    e.run_housekeeping_at(200);

    let err = e.ingest_at(&event("a", 105, "y.example"), 200).unwrap_err();
    assert_eq!(
        err,
        IngestError::LateEvent {
            server: "a".to_string(),
            bucket_start: 100,
        }
    );
    assert_eq!(e.late_events(), 1);

    let series = e
        .query(&request(Dimension::Domain, TimeRange::new(100, 110), 10))
        .unwrap();
    let counts = breakdown_counts(&series.points[0].value);
    assert_eq!(counts, vec![("x.example".to_string(), 1)]);
}

#[test]
fn unique_domains_merge_is_idempotent_across_servers() {
    let e = engine(10);
    // Both servers observe the same 40 domains.
    for server in &["a", "b"] {
        for i in 0..40 {
            e.ingest_at(&event(server, 100, &format!("h{}.example", i)), 100)
                .unwrap();
        }
    }
    e.run_housekeeping_at(1_000);

    let series = e
        .query(&request(
            Dimension::UniqueDomains,
            TimeRange::new(100, 110),
            10,
        ))
        .unwrap();
    match series.points[0].value {
        PointValue::Distinct(estimate) => {
            assert!(
                (estimate - 40.0).abs() < 4.0,
                "union of identical sets should stay ~40, got {}",
                estimate
            );
        }
        ref other => panic!("expected distinct value, got {:?}", other),
    }
}

#[test]
fn retention_evicts_old_buckets_from_queries() {
    let e = AggregationEngine::new(AggregateConfig {
        bucket_width_secs: 10,
        seal_grace_secs: 5,
        retention_secs: 100,
        ..AggregateConfig::default()
    })
    .unwrap();
    e.ingest_at(&event("a", 100, "x.example"), 100).unwrap();
    e.ingest_at(&event("a", 300, "y.example"), 300).unwrap();

    // At now=320 the first bucket is past retention (320-100 > 100).
    let (_, evicted) = e.run_housekeeping_at(320);
    assert_eq!(evicted, 1);
    assert_eq!(e.bucket_count(), 1);

    let series = e
        .query(&request(Dimension::Domain, TimeRange::new(100, 110), 10))
        .unwrap();
    assert_eq!(breakdown_counts(&series.points[0].value), Vec::new());
}

#[test]
fn query_range_without_buckets_returns_empty_series() {
    let e = engine(10);
    let series = e
        .query(&request(Dimension::Domain, TimeRange::new(5_000, 5_030), 10))
        .unwrap();
    assert_eq!(series.points.len(), 3);
    assert!(!series.includes_open);
}
