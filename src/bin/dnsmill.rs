//! dnsmill CLI
//!
//! Operational harness for the aggregation engine: replays a JSONL capture
//! file (or synthesizes traffic) into the engine, seals the resulting
//! buckets, runs one query, and prints the series as JSON. Useful for
//! smoke-testing retention settings and eyeballing rollup output without a
//! dashboard in front.

use clap::Parser;
use dnsmill::aggregate::{
    gather_metrics, AggregateConfig, AggregationEngine, Dimension, DnsEvent, QueryRequest,
    TimeRange,
};
use rand::Rng;
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::PathBuf;
use std::process;
use std::time::{SystemTime, UNIX_EPOCH};

/// dnsmill - replay or synthesize DNS traffic and query the rollups
#[derive(Parser)]
#[command(name = "dnsmill")]
#[command(version)]
#[command(about = "Streaming DNS-traffic aggregation engine", long_about = None)]
struct Cli {
    /// TOML configuration file (defaults apply when omitted)
    #[arg(short, long, env = "DNSMILL_CONFIG")]
    config: Option<PathBuf>,

    /// JSONL file of decoded DNS events; omit to synthesize traffic
    #[arg(short, long)]
    input: Option<PathBuf>,

    /// Number of synthetic events to generate (without --input)
    #[arg(long, default_value_t = 10_000)]
    events: usize,

    /// Comma-separated synthetic server names (without --input)
    #[arg(long, default_value = "default")]
    servers: String,

    /// Dimension to query after the replay
    #[arg(short, long, default_value = "domain")]
    dimension: Dimension,

    /// Query interval in seconds (defaults to the ingest bucket width)
    #[arg(long)]
    interval: Option<u64>,

    /// Truncate breakdowns to the top K values per point
    #[arg(long)]
    top: Option<usize>,

    /// With --top, fold the remainder into an "other" entry
    #[arg(long)]
    others: bool,

    /// Merge still-open buckets into the answer (live view)
    #[arg(long)]
    live: bool,

    /// Print prometheus counters after the query
    #[arg(long)]
    metrics: bool,

    /// Verbose logging
    #[arg(short, long)]
    verbose: bool,
}

fn main() {
    let cli = Cli::parse();

    let level = if cli.verbose {
        log::Level::Debug
    } else {
        log::Level::Info
    };
    simple_logger::init_with_level(level).expect("failed to initialize logger");

    let config = match &cli.config {
        Some(path) => match AggregateConfig::from_toml_file(path) {
            Ok(config) => config,
            Err(err) => {
                log::error!("cannot load config {}: {}", path.display(), err);
                process::exit(1);
            }
        },
        None => AggregateConfig::default(),
    };

    let engine = match AggregationEngine::new(config) {
        Ok(engine) => engine,
        Err(err) => {
            log::error!("invalid configuration: {}", err);
            process::exit(1);
        }
    };

    let span = match &cli.input {
        Some(path) => replay_file(&engine, path),
        None => synthesize(&engine, cli.events, &cli.servers),
    };
    let (first, last) = match span {
        Some(span) => span,
        None => {
            log::warn!("no events ingested; nothing to query");
            return;
        }
    };

    // Push the clock past every grace window so the replay is queryable.
    let config = engine.config().clone();
    let seal_at = last + config.bucket_width_secs + config.seal_grace_secs;
    let (sealed, _) = engine.run_housekeeping_at(seal_at);
    log::info!(
        "ingested {} event(s) across {} bucket(s), sealed {}, dropped {} late",
        engine.accepted_events(),
        engine.bucket_count(),
        sealed,
        engine.late_events()
    );

    let request = QueryRequest {
        dimension: cli.dimension,
        range: TimeRange::new(first, last + 1),
        interval_secs: cli.interval.unwrap_or(config.bucket_width_secs),
        servers: Vec::new(),
        top_k: cli.top,
        group_remainder: cli.others,
        include_open: cli.live,
    };
    match engine.query(&request) {
        Ok(series) => match serde_json::to_string_pretty(&series) {
            Ok(json) => println!("{}", json),
            Err(err) => log::error!("cannot encode series: {}", err),
        },
        Err(err) => {
            log::error!("query failed: {}", err);
            process::exit(1);
        }
    }

    if cli.metrics {
        print!("{}", gather_metrics());
    }
}

/// Replay a JSONL capture, one `DnsEvent` per line. Historical captures are
/// replayed against their own timestamps so nothing is dropped as late.
fn replay_file(engine: &AggregationEngine, path: &PathBuf) -> Option<(u64, u64)> {
    let file = match File::open(path) {
        Ok(file) => file,
        Err(err) => {
            log::error!("cannot open {}: {}", path.display(), err);
            process::exit(1);
        }
    };

    let mut span: Option<(u64, u64)> = None;
    let mut malformed = 0usize;
    for (number, line) in BufReader::new(file).lines().enumerate() {
        let line = match line {
            Ok(line) => line,
            Err(err) => {
                log::error!("read error in {}: {}", path.display(), err);
                process::exit(1);
            }
        };
        if line.trim().is_empty() {
            continue;
        }
        let event: DnsEvent = match serde_json::from_str(&line) {
            Ok(event) => event,
            Err(err) => {
                malformed += 1;
                log::debug!("skipping malformed line {}: {}", number + 1, err);
                continue;
            }
        };
        let timestamp = event.timestamp;
        if engine.ingest_at(&event, timestamp).is_ok() {
            span = Some(match span {
                Some((first, last)) => (first.min(timestamp), last.max(timestamp)),
                None => (timestamp, timestamp),
            });
        }
    }
    if malformed > 0 {
        log::warn!("skipped {} malformed line(s)", malformed);
    }
    span
}

/// Generate a skewed synthetic workload over the last five minutes.
fn synthesize(engine: &AggregationEngine, count: usize, servers: &str) -> Option<(u64, u64)> {
    let servers: Vec<&str> = servers.split(',').filter(|s| !s.is_empty()).collect();
    if servers.is_empty() {
        log::error!("--servers must name at least one server");
        process::exit(1);
    }

    let domains: Vec<String> = (0..200)
        .map(|i| format!("host-{}.example.com", i))
        .collect();
    let query_types: &[u16] = &[1, 28, 15, 16, 2, 12];
    let response_codes: &[u8] = &[0, 0, 0, 0, 3, 2];

    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs();
    let window = 300u64;
    let start = now.saturating_sub(window);

    let mut rng = rand::thread_rng();
    let mut span: Option<(u64, u64)> = None;
    for _ in 0..count {
        // Quadratic skew so a handful of domains dominate, like real traffic.
        let skew = rng.gen::<f64>() * rng.gen::<f64>();
        let domain = &domains[(skew * domains.len() as f64) as usize % domains.len()];
        let timestamp = start + rng.gen_range(0, window);
        let event = DnsEvent {
            server: servers[rng.gen_range(0, servers.len())].to_string(),
            timestamp,
            question: domain.clone(),
            query_type: query_types[rng.gen_range(0, query_types.len())],
            query_class: 1,
            op_code: 0,
            response_code: response_codes[rng.gen_range(0, response_codes.len())],
            protocol: if rng.gen::<f64>() < 0.9 { "udp" } else { "tcp" }.to_string(),
            ip_version: if rng.gen::<f64>() < 0.7 { 4 } else { 6 },
            prefix: if rng.gen::<f64>() < 0.7 {
                format!("10.{}.0.0", rng.gen_range(0, 32)).parse().unwrap()
            } else {
                format!("2001:db8:{:x}::", rng.gen_range(0, 32)).parse().unwrap()
            },
            packet_size: rng.gen_range(48, 512),
            edns_present: rng.gen::<f64>() < 0.8,
            do_bit: rng.gen::<f64>() < 0.3,
        };
        if engine.ingest_at(&event, timestamp).is_ok() {
            span = Some(match span {
                Some((first, last)) => (first.min(timestamp), last.max(timestamp)),
                None => (timestamp, timestamp),
            });
        }
    }
    span
}
