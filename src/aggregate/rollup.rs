//! Per-bucket dimension rollups
//!
//! Each time bucket keeps one accumulator per dimension: lazily-growing
//! count maps for open-ended value spaces (domains, record types, IP
//! prefixes, ...), flat counters for the EDNS/DO flags, a sum/count pair
//! for packet sizes, and a cardinality sketch over domain names. All
//! accumulator updates are commutative and associative, so buckets merge
//! across servers and sub-buckets in any order.

use super::sketch::HyperLogLog;
use super::DnsEvent;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::hash::Hash;
use std::net::IpAddr;

/// A dimension the engine can break traffic down by.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Dimension {
    /// Queried domain name (`Question`).
    Domain,
    /// DNS record type code (A, AAAA, MX, ...).
    QueryType,
    /// DNS class code (almost always IN).
    QueryClass,
    /// DNS opcode.
    OpCode,
    /// Response code (NOERROR, NXDOMAIN, ...).
    ResponseCode,
    /// Transport protocol (udp, tcp, ...).
    Protocol,
    /// IP version (4 or 6).
    IpVersion,
    /// Masked source-or-destination prefix.
    IpPrefix,
    /// Events carrying an EDNS0 OPT record.
    EdnsPresent,
    /// Events with the DNSSEC DO bit set.
    DoBit,
    /// Packet size statistics (sum, count, derived average).
    PacketSize,
    /// Approximate distinct domain names observed.
    UniqueDomains,
}

impl Dimension {
    /// Stable name used for metrics labels and CLI output.
    pub fn name(&self) -> &'static str {
        match self {
            Dimension::Domain => "domain",
            Dimension::QueryType => "query_type",
            Dimension::QueryClass => "query_class",
            Dimension::OpCode => "op_code",
            Dimension::ResponseCode => "response_code",
            Dimension::Protocol => "protocol",
            Dimension::IpVersion => "ip_version",
            Dimension::IpPrefix => "ip_prefix",
            Dimension::EdnsPresent => "edns_present",
            Dimension::DoBit => "do_bit",
            Dimension::PacketSize => "packet_size",
            Dimension::UniqueDomains => "unique_domains",
        }
    }
}

impl fmt::Display for Dimension {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl std::str::FromStr for Dimension {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "domain" => Ok(Dimension::Domain),
            "query_type" => Ok(Dimension::QueryType),
            "query_class" => Ok(Dimension::QueryClass),
            "op_code" => Ok(Dimension::OpCode),
            "response_code" => Ok(Dimension::ResponseCode),
            "protocol" => Ok(Dimension::Protocol),
            "ip_version" => Ok(Dimension::IpVersion),
            "ip_prefix" => Ok(Dimension::IpPrefix),
            "edns_present" => Ok(Dimension::EdnsPresent),
            "do_bit" => Ok(Dimension::DoBit),
            "packet_size" => Ok(Dimension::PacketSize),
            "unique_domains" => Ok(Dimension::UniqueDomains),
            other => Err(format!("unknown dimension '{}'", other)),
        }
    }
}

/// Counter for one dimension value within one bucket.
///
/// `first_seen` is an engine-wide sequence number stamped when the value
/// first entered this bucket's map. Merges keep the minimum, which gives
/// top-K ties a deterministic first-seen ordering across repeated queries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CountSlot {
    pub count: u64,
    pub first_seen: u64,
}

impl CountSlot {
    fn merge_from(&mut self, other: &CountSlot) {
        self.count += other.count;
        if other.first_seen < self.first_seen {
            self.first_seen = other.first_seen;
        }
    }
}

/// Packet size accumulator: element-wise mergeable sum and event count.
///
/// The average is always re-derived from the merged sum and count; merging
/// pre-computed averages would weight sparse buckets incorrectly.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SizeStat {
    pub sum_bytes: u64,
    pub events: u64,
}

impl SizeStat {
    pub fn record(&mut self, bytes: u32) {
        self.sum_bytes += u64::from(bytes);
        self.events += 1;
    }

    pub fn merge_from(&mut self, other: &SizeStat) {
        self.sum_bytes += other.sum_bytes;
        self.events += other.events;
    }

    /// Average packet size in bytes, 0.0 for an empty accumulator.
    pub fn average(&self) -> f64 {
        if self.events == 0 {
            0.0
        } else {
            self.sum_bytes as f64 / self.events as f64
        }
    }
}

/// All accumulators for one `(server, bucket_start)` bucket.
pub struct BucketRollups {
    domains: HashMap<String, CountSlot>,
    query_types: HashMap<u16, CountSlot>,
    query_classes: HashMap<u16, CountSlot>,
    op_codes: HashMap<u8, CountSlot>,
    response_codes: HashMap<u8, CountSlot>,
    protocols: HashMap<String, CountSlot>,
    ip_versions: HashMap<u8, CountSlot>,
    prefixes: HashMap<IpAddr, CountSlot>,
    edns_present: u64,
    do_bit: u64,
    size: SizeStat,
    unique_domains: HyperLogLog,
    /// New dimension values dropped after a count map hit the per-bucket cap.
    overflowed_values: u64,
}

impl BucketRollups {
    pub fn new(sketch_precision: u8) -> Self {
        Self {
            domains: HashMap::new(),
            query_types: HashMap::new(),
            query_classes: HashMap::new(),
            op_codes: HashMap::new(),
            response_codes: HashMap::new(),
            protocols: HashMap::new(),
            ip_versions: HashMap::new(),
            prefixes: HashMap::new(),
            edns_present: 0,
            do_bit: 0,
            size: SizeStat::default(),
            unique_domains: HyperLogLog::with_precision(sketch_precision),
            overflowed_values: 0,
        }
    }

    /// Apply one event to every dimension. O(1) amortized.
    ///
    /// `seq` stamps values on first appearance (top-K tie-break order);
    /// `value_cap` bounds each count map's size within this bucket.
    pub fn apply(&mut self, event: &DnsEvent, seq: u64, value_cap: usize) {
        self.overflowed_values += bump(
            &mut self.domains,
            event.question.clone(),
            seq,
            value_cap,
        );
        self.overflowed_values += bump(&mut self.query_types, event.query_type, seq, value_cap);
        self.overflowed_values +=
            bump(&mut self.query_classes, event.query_class, seq, value_cap);
        self.overflowed_values += bump(&mut self.op_codes, event.op_code, seq, value_cap);
        self.overflowed_values +=
            bump(&mut self.response_codes, event.response_code, seq, value_cap);
        self.overflowed_values += bump(
            &mut self.protocols,
            event.protocol.clone(),
            seq,
            value_cap,
        );
        self.overflowed_values += bump(&mut self.ip_versions, event.ip_version, seq, value_cap);
        self.overflowed_values += bump(&mut self.prefixes, event.prefix, seq, value_cap);

        if event.edns_present {
            self.edns_present += 1;
        }
        if event.do_bit {
            self.do_bit += 1;
        }
        self.size.record(event.packet_size);
        self.unique_domains.add(event.question.as_str());
    }

    /// Total count-map inserts dropped by the per-bucket value cap.
    pub fn overflowed_values(&self) -> u64 {
        self.overflowed_values
    }

    /// Extract the accumulator for one dimension.
    ///
    /// Count-map keys are stringified here so that every breakdown, whatever
    /// the underlying key type, merges and renders uniformly.
    pub fn accumulator(&self, dimension: Dimension) -> DimensionAccumulator {
        match dimension {
            Dimension::Domain => DimensionAccumulator::Counts(stringify(&self.domains)),
            Dimension::QueryType => DimensionAccumulator::Counts(stringify(&self.query_types)),
            Dimension::QueryClass => {
                DimensionAccumulator::Counts(stringify(&self.query_classes))
            }
            Dimension::OpCode => DimensionAccumulator::Counts(stringify(&self.op_codes)),
            Dimension::ResponseCode => {
                DimensionAccumulator::Counts(stringify(&self.response_codes))
            }
            Dimension::Protocol => DimensionAccumulator::Counts(stringify(&self.protocols)),
            Dimension::IpVersion => DimensionAccumulator::Counts(stringify(&self.ip_versions)),
            Dimension::IpPrefix => DimensionAccumulator::Counts(stringify(&self.prefixes)),
            Dimension::EdnsPresent => DimensionAccumulator::Flag(self.edns_present),
            Dimension::DoBit => DimensionAccumulator::Flag(self.do_bit),
            Dimension::PacketSize => DimensionAccumulator::Size(self.size),
            Dimension::UniqueDomains => {
                DimensionAccumulator::Distinct(self.unique_domains.clone())
            }
        }
    }
}

fn bump<K: Eq + Hash>(
    map: &mut HashMap<K, CountSlot>,
    key: K,
    seq: u64,
    value_cap: usize,
) -> u64 {
    if let Some(slot) = map.get_mut(&key) {
        slot.count += 1;
        return 0;
    }
    if map.len() >= value_cap {
        return 1;
    }
    map.insert(
        key,
        CountSlot {
            count: 1,
            first_seen: seq,
        },
    );
    0
}

fn stringify<K: ToString>(map: &HashMap<K, CountSlot>) -> HashMap<String, CountSlot> {
    map.iter().map(|(k, v)| (k.to_string(), *v)).collect()
}

/// A single dimension's accumulator, detached from its bucket.
///
/// This is the unit of query-time merging: cross-server and cross-bucket
/// merges fold accumulators of the same variant together.
pub enum DimensionAccumulator {
    /// Per-value counters for breakdown dimensions.
    Counts(HashMap<String, CountSlot>),
    /// Count of events with a boolean flag set.
    Flag(u64),
    /// Packet size sum/count.
    Size(SizeStat),
    /// Approximate distinct-domain sketch.
    Distinct(HyperLogLog),
}

impl DimensionAccumulator {
    /// Identity element for merging, shaped for the given dimension.
    pub fn empty(dimension: Dimension, sketch_precision: u8) -> Self {
        match dimension {
            Dimension::EdnsPresent | Dimension::DoBit => DimensionAccumulator::Flag(0),
            Dimension::PacketSize => DimensionAccumulator::Size(SizeStat::default()),
            Dimension::UniqueDomains => {
                DimensionAccumulator::Distinct(HyperLogLog::with_precision(sketch_precision))
            }
            _ => DimensionAccumulator::Counts(HashMap::new()),
        }
    }

    /// Fold another accumulator of the same shape into this one.
    /// Sum for counts and flags, element-wise sum for sizes, sketch union
    /// for distinct counts.
    pub fn merge_from(&mut self, other: &DimensionAccumulator) {
        match (self, other) {
            (DimensionAccumulator::Counts(a), DimensionAccumulator::Counts(b)) => {
                for (value, slot) in b {
                    match a.get_mut(value) {
                        Some(existing) => existing.merge_from(slot),
                        None => {
                            a.insert(value.clone(), *slot);
                        }
                    }
                }
            }
            (DimensionAccumulator::Flag(a), DimensionAccumulator::Flag(b)) => *a += *b,
            (DimensionAccumulator::Size(a), DimensionAccumulator::Size(b)) => a.merge_from(b),
            (DimensionAccumulator::Distinct(a), DimensionAccumulator::Distinct(b)) => {
                a.absorb(b)
            }
            _ => unreachable!("mismatched accumulator shapes for one dimension"),
        }
    }
}
