//! Mergeable approximate-cardinality sketch for unique-domain counting
//!
//! A HyperLogLog estimator with configurable precision. Every time bucket
//! carries one sketch over the domain names it observed; query-time merges
//! union sketches across servers and sub-buckets without losing accuracy,
//! regardless of merge order or fan-in.

use ahash::RandomState;
use std::hash::{BuildHasher, Hash, Hasher};

/// Minimum supported precision (16 registers).
pub const MIN_PRECISION: u8 = 4;

/// Maximum supported precision (262144 registers).
pub const MAX_PRECISION: u8 = 18;

/// Default precision: 4096 registers (~4 KiB), ~1.6% standard error,
/// inside the 2% target for unique-domain panels.
pub const DEFAULT_PRECISION: u8 = 12;

// Fixed seeds so the same value set always produces the same registers,
// independent of process or merge order.
const SEED: (u64, u64, u64, u64) = (
    0x9e37_79b9_7f4a_7c15,
    0x2545_f491_4f6c_dd1d,
    0x27d4_eb2f_1656_67c5,
    0x1656_67b1_9e37_79f9,
);

/// HyperLogLog cardinality estimator.
///
/// `merge` is commutative, associative, and idempotent: re-merging the same
/// sketch changes nothing, and a merged estimate never drops below either
/// input's estimate. Memory is fixed by precision, never by cardinality.
#[derive(Clone)]
pub struct HyperLogLog {
    precision: u8,
    registers: Vec<u8>,
    hasher: RandomState,
}

impl HyperLogLog {
    /// Create an empty sketch with the given precision (`4 ..= 18`).
    ///
    /// Precision `p` allocates `2^p` one-byte registers. Standard error is
    /// roughly `1.04 / sqrt(2^p)`.
    pub fn with_precision(precision: u8) -> Self {
        assert!(
            (MIN_PRECISION..=MAX_PRECISION).contains(&precision),
            "sketch precision out of range"
        );
        Self {
            precision,
            registers: vec![0u8; 1 << precision],
            hasher: RandomState::with_seeds(SEED.0, SEED.1, SEED.2, SEED.3),
        }
    }

    /// Create an empty sketch with the default precision.
    pub fn new() -> Self {
        Self::with_precision(DEFAULT_PRECISION)
    }

    /// Precision this sketch was created with.
    pub fn precision(&self) -> u8 {
        self.precision
    }

    /// Record one observation. Repeats of the same value are no-ops.
    pub fn add<T: Hash + ?Sized>(&mut self, value: &T) {
        let mut h = self.hasher.build_hasher();
        value.hash(&mut h);
        let hash = h.finish();

        let index = (hash >> (64 - self.precision)) as usize;
        let suffix = hash << self.precision;
        let rank = if suffix == 0 {
            64 - self.precision + 1
        } else {
            suffix.leading_zeros() as u8 + 1
        };
        if rank > self.registers[index] {
            self.registers[index] = rank;
        }
    }

    /// Approximate count of distinct values added so far.
    pub fn estimate(&self) -> f64 {
        let m = self.registers.len() as f64;
        let mut sum = 0.0f64;
        let mut zeros = 0u32;
        for &reg in &self.registers {
            sum += f64::exp2(-f64::from(reg));
            if reg == 0 {
                zeros += 1;
            }
        }

        let raw = self.alpha() * m * m / sum;

        // Linear counting handles the small-cardinality range where the
        // raw harmonic-mean estimate is biased.
        if raw <= 2.5 * m && zeros > 0 {
            return m * (m / f64::from(zeros)).ln();
        }
        raw
    }

    /// True if no value has ever been added.
    pub fn is_empty(&self) -> bool {
        self.registers.iter().all(|&r| r == 0)
    }

    /// Union of two sketches, mutating neither input.
    ///
    /// Both sketches must share a precision; the engine creates every sketch
    /// from one configuration, so mixed precisions indicate a logic bug.
    pub fn merge(&self, other: &Self) -> Self {
        assert_eq!(
            self.precision, other.precision,
            "cannot merge sketches of different precision"
        );
        let registers = self
            .registers
            .iter()
            .zip(&other.registers)
            .map(|(&a, &b)| a.max(b))
            .collect();
        Self {
            precision: self.precision,
            registers,
            hasher: self.hasher.clone(),
        }
    }

    /// Fold another sketch into this one in place. Same union semantics as
    /// [`merge`](Self::merge); used on the query path to avoid reallocating
    /// per sub-bucket.
    pub fn absorb(&mut self, other: &Self) {
        assert_eq!(
            self.precision, other.precision,
            "cannot merge sketches of different precision"
        );
        for (a, &b) in self.registers.iter_mut().zip(&other.registers) {
            if b > *a {
                *a = b;
            }
        }
    }

    fn alpha(&self) -> f64 {
        let m = self.registers.len() as f64;
        match self.registers.len() {
            16 => 0.673,
            32 => 0.697,
            64 => 0.709,
            _ => 0.7213 / (1.0 + 1.079 / m),
        }
    }
}

impl Default for HyperLogLog {
    fn default() -> Self {
        Self::new()
    }
}
