//! Integer log-probability arithmetic.
//!
//! Probabilities are held as `i32` values in a log base `B = 1 + ε` chosen
//! small enough that useful probabilities fit comfortably in 32 bits. Scores
//! are negative (or zero) and higher is better throughout the crate;
//! [`WORST_SCORE`] is the inactive sentinel and sits far enough above
//! `i32::MIN` that one addition cannot wrap.
//!
//! The interesting operation is [`LogMath::add`], which computes
//! `logB(B^x + B^y)` with a table lookup on `|x - y|`: since
//! `logB(B^x + B^y) = max(x, y) + logB(1 + B^-|x-y|)` the correction term
//! only depends on the difference, and it decays to zero, so the table is
//! built at init by iterating until the quantised correction reaches zero.
//!
//! A context built with `shift > 0` works in right-shifted score units and
//! its add-table entries are guaranteed to fit in a `u8`. The
//! semi-continuous scorer relies on this: its mixture weights are stored as
//! 8-bit quantised negative logs in shifted units, and the mixing loop adds
//! them with the narrow table.
use crate::error::{Error, Result};

/// Sentinel for an unreachable state. Anything at or below this is treated
/// as log-zero.
pub const WORST_SCORE: i32 = -0x2000_0000;

/// Score assigned to a senone with no usable density.
pub const LOGPROB_ZERO: i32 = WORST_SCORE;

#[derive(Debug, Clone)]
pub struct LogMath {
    base: f64,
    log_of_base: f64,
    inv_log_of_base: f64,
    inv_log10_of_base: f64,
    /// Quantised `logB(1 + B^-(d << shift)) >> shift` for d = 0, 1, 2, ...
    add_table: Vec<u16>,
    shift: u32,
}

impl LogMath {
    /// Build a log-math context for the given base. With `shift > 0` all
    /// scores produced and consumed by this context are in units of
    /// `2^shift` base-B log steps, and every add-table entry must fit in a
    /// `u8`.
    pub fn new(base: f64, shift: u32) -> Result<Self> {
        if base <= 1.0 {
            return Err(Error::Config(format!(
                "log base must be > 1.0, got {base:e}"
            )));
        }

        let log_of_base = base.ln();
        let inv_log_of_base = 1.0 / log_of_base;
        let inv_log10_of_base = 1.0 / base.log10();

        // logB(2) is the largest correction the table ever holds; it must
        // fit the entry type or the base is uselessly small.
        let widest = ((2.0f64.ln() * inv_log_of_base + 0.5) as i64) >> shift;
        let limit = if shift > 0 { u8::MAX as i64 } else { u16::MAX as i64 };
        if widest > limit {
            return Err(Error::Config(format!(
                "log base {base:e} too small: add-table entry {widest} exceeds {limit}"
            )));
        }

        let mut add_table = Vec::new();
        let f = 1.0 / base;
        let mut d = 1.0f64;
        loop {
            let t = (1.0 + d).ln() * inv_log_of_base;
            let k = (((t + 0.5) as i64) >> shift) as u16;
            add_table.push(k);
            if k == 0 {
                break;
            }
            // The next slot covers a difference one shifted unit larger.
            for _ in 0..(1u64 << shift) {
                d *= f;
            }
        }

        Ok(LogMath {
            base,
            log_of_base,
            inv_log_of_base,
            inv_log10_of_base,
            add_table,
            shift,
        })
    }

    pub fn base(&self) -> f64 {
        self.base
    }

    pub fn shift(&self) -> u32 {
        self.shift
    }

    /// `logB(B^a + B^b)` over scores in this context's units. When the
    /// operands are further apart than the table covers, the smaller one is
    /// swamped and simply discarded.
    #[inline]
    pub fn add(&self, a: i32, b: i32) -> i32 {
        let (hi, d) = if a > b {
            (a, (a - b) as usize)
        } else {
            (b, (b - a) as usize)
        };
        if d < self.add_table.len() {
            hi + self.add_table[d] as i32
        } else {
            hi
        }
    }

    /// Convert a linear probability to this context's units. Non-positive
    /// inputs map to log-zero.
    pub fn log(&self, p: f64) -> i32 {
        if p <= 0.0 {
            return LOGPROB_ZERO;
        }
        ((p.ln() * self.inv_log_of_base) as i64 >> self.shift) as i32
    }

    /// Convert a natural-log probability to this context's units.
    pub fn ln_to_log(&self, log_p: f64) -> i32 {
        ((log_p * self.inv_log_of_base) as i64 >> self.shift) as i32
    }

    /// Convert a base-10 log probability (the ARPA convention).
    pub fn log10_to_log(&self, log10_p: f64) -> i32 {
        ((log10_p * self.inv_log10_of_base) as i64 >> self.shift) as i32
    }

    /// Back to a natural-log value.
    pub fn log_to_ln(&self, score: i32) -> f64 {
        ((score as i64) << self.shift) as f64 * self.log_of_base
    }

    /// Back to a linear probability.
    pub fn exp(&self, score: i32) -> f64 {
        self.log_to_ln(score).exp()
    }

    pub fn add_table_len(&self) -> usize {
        self.add_table.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_degenerate_base() {
        assert!(LogMath::new(1.0, 0).is_err());
        assert!(LogMath::new(0.5, 0).is_err());
    }

    #[test]
    fn log_add_matches_linear_addition() {
        let lmath = LogMath::new(1.0001, 0).unwrap();
        for &(p, q) in &[(0.5, 0.5), (0.1, 0.0001), (1e-8, 1e-9), (0.3, 0.7)] {
            let lp = lmath.log(p);
            let lq = lmath.log(q);
            let sum = lmath.add(lp, lq);
            let expected = lmath.log(p + q);
            // One quantisation step of slack on either side.
            assert!(
                (sum - expected).abs() <= 2,
                "log({p}+{q}): got {sum}, expected {expected}"
            );
        }
    }

    #[test]
    fn add_is_commutative_and_swamps_tiny_operands() {
        let lmath = LogMath::new(1.0001, 0).unwrap();
        let a = lmath.log(0.25);
        let b = lmath.log(1e-30);
        assert_eq!(lmath.add(a, b), lmath.add(b, a));
        // 1e-30 is far outside the table; 0.25 wins outright.
        assert_eq!(lmath.add(a, WORST_SCORE), a);
    }

    #[test]
    fn narrow_table_works_in_shifted_units() {
        let lmath = LogMath::new(1.0001, 10).unwrap();
        assert!(lmath.add_table_len() > 0);
        let half = lmath.log(0.5);
        // Adding two equal halves lands close to log(1.0) = 0; with a
        // 10-bit shift one unit of slack is ~1024 raw steps.
        let sum = lmath.add(half, half);
        assert!(sum.abs() <= 1, "0.5 + 0.5 gave shifted score {sum}");
        // Entries really are byte-sized.
        let p = lmath.exp(half);
        assert!((p - 0.5).abs() < 0.05);
    }

    #[test]
    fn round_trips_through_linear() {
        let lmath = LogMath::new(1.0001, 0).unwrap();
        for &p in &[1.0, 0.5, 0.01, 1e-6] {
            let back = lmath.exp(lmath.log(p));
            assert!((back - p).abs() / p < 1e-3, "{p} -> {back}");
        }
    }
}
