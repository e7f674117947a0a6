// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use xxhash_rust::xxh3::xxh3_64;

/// Register count exponent (2^10 = 1024 registers, ~3% standard error)
const P: u32 = 10;

const M: usize = 1 << P;

/// Hyper-log-log sketch for estimating the number of distinct keys
///
/// Every kvset carries one; a node folds the sketches of all its kvsets
/// to derive the unique-key fraction that scales the node's
/// compacted-size estimate.
#[derive(Clone)]
pub struct Hlog {
    registers: Box<[u8]>,
}

impl std::fmt::Debug for Hlog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Hlog(~{} distinct)", self.estimate())
    }
}

impl Default for Hlog {
    fn default() -> Self {
        Self {
            registers: vec![0; M].into_boxed_slice(),
        }
    }
}

impl Hlog {
    /// Folds a key into the sketch.
    pub fn add(&mut self, key: &[u8]) {
        self.add_hash(xxh3_64(key));
    }

    /// Folds a precomputed 64-bit key hash into the sketch.
    pub fn add_hash(&mut self, hash: u64) {
        let idx = (hash >> (64 - P)) as usize;

        // Rank of the remaining bits, 1-based
        #[allow(clippy::cast_possible_truncation)]
        let rank = ((hash << P) | (1 << (P - 1))).leading_zeros() as u8 + 1;

        let slot = self.registers.get_mut(idx).expect("index fits register count");
        if *slot < rank {
            *slot = rank;
        }
    }

    /// Merges another sketch into this one (register-wise maximum).
    pub fn merge(&mut self, other: &Self) {
        for (a, b) in self.registers.iter_mut().zip(other.registers.iter()) {
            if *a < *b {
                *a = *b;
            }
        }
    }

    /// Returns `true` if no key was ever folded in.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.registers.iter().all(|&r| r == 0)
    }

    /// Estimates the number of distinct keys folded into the sketch.
    #[must_use]
    #[allow(clippy::cast_precision_loss, clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    pub fn estimate(&self) -> u64 {
        let m = M as f64;

        let mut sum = 0.0f64;
        let mut zeros = 0u32;

        for &r in &*self.registers {
            sum += 2.0f64.powi(-i32::from(r));
            if r == 0 {
                zeros += 1;
            }
        }

        let alpha = 0.7213 / (1.0 + 1.079 / m);
        let raw = alpha * m * m / sum;

        // Linear counting for the small range
        let estimate = if raw <= 2.5 * m && zeros > 0 {
            m * (m / f64::from(zeros)).ln()
        } else {
            raw
        };

        estimate.round() as u64
    }
}

#[cfg(test)]
mod tests {
    use super::Hlog;
    use test_log::test;

    #[test]
    fn hlog_empty() {
        let hlog = Hlog::default();
        assert!(hlog.is_empty());
        assert_eq!(0, hlog.estimate());
    }

    #[test]
    fn hlog_small_exact_ballpark() {
        let mut hlog = Hlog::default();

        for x in 0u32..100 {
            hlog.add(&x.to_be_bytes());
        }

        let est = hlog.estimate();
        assert!((90..=110).contains(&est), "estimate was {est}");
    }

    #[test]
    fn hlog_duplicates_do_not_count() {
        let mut hlog = Hlog::default();

        for _ in 0..1_000 {
            hlog.add(b"same-key");
        }

        assert!(hlog.estimate() <= 2);
    }

    #[test]
    fn hlog_merge_is_union() {
        let mut a = Hlog::default();
        let mut b = Hlog::default();

        for x in 0u32..500 {
            a.add(&x.to_be_bytes());
        }
        for x in 250u32..750 {
            b.add(&x.to_be_bytes());
        }

        a.merge(&b);

        let est = a.estimate();
        assert!((650..=850).contains(&est), "estimate was {est}");
    }

    #[test]
    fn hlog_larger_cardinality() {
        let mut hlog = Hlog::default();

        for x in 0u32..50_000 {
            hlog.add(&x.to_be_bytes());
        }

        let est = hlog.estimate();

        // ~3% standard error at 1024 registers; allow 10%
        assert!((45_000..=55_000).contains(&est), "estimate was {est}");
    }
}
