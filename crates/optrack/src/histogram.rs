//! Power-of-two histogram for op-age distributions.

use serde::{Deserialize, Serialize};

/// Counter histogram with power-of-two buckets.
///
/// Bucket 0 counts zero values; bucket `k` counts values in
/// `[2^(k-1), 2^k)`. Used for millisecond op ages, where the coarse
/// exponential buckets are enough to spot a latency cliff.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Pow2Histogram {
    buckets: Vec<u64>,
}

/// Serializable point-in-time view of a [`Pow2Histogram`].
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Pow2HistogramSnapshot {
    pub buckets: Vec<u64>,
    pub total: u64,
    pub upper_bound: u64,
}

impl Pow2Histogram {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn clear(&mut self) {
        self.buckets.clear();
    }

    pub fn add(&mut self, value: u64) {
        let index = bucket_index(value);
        if self.buckets.len() <= index {
            self.buckets.resize(index + 1, 0);
        }
        self.buckets[index] = self.buckets[index].saturating_add(1);
    }

    pub fn is_empty(&self) -> bool {
        self.buckets.iter().all(|count| *count == 0)
    }

    pub fn buckets(&self) -> &[u64] {
        &self.buckets
    }

    /// Smallest power of two greater than every recorded value.
    pub fn upper_bound(&self) -> u64 {
        if self.buckets.len() <= 1 {
            1
        } else {
            1u64 << (self.buckets.len() - 1)
        }
    }

    pub fn snapshot(&self) -> Pow2HistogramSnapshot {
        Pow2HistogramSnapshot {
            buckets: self.buckets.clone(),
            total: self.buckets.iter().copied().sum(),
            upper_bound: self.upper_bound(),
        }
    }
}

fn bucket_index(value: u64) -> usize {
    (u64::BITS - value.leading_zeros()) as usize
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn values_land_in_power_of_two_buckets() {
        let mut h = Pow2Histogram::new();
        h.add(0);
        h.add(1);
        h.add(2);
        h.add(3);
        h.add(4);
        h.add(1023);
        h.add(1024);

        assert_eq!(h.buckets()[0], 1, "zero bucket");
        assert_eq!(h.buckets()[1], 1, "value 1");
        assert_eq!(h.buckets()[2], 2, "values 2..4");
        assert_eq!(h.buckets()[3], 1, "values 4..8");
        assert_eq!(h.buckets()[10], 1, "values 512..1024");
        assert_eq!(h.buckets()[11], 1, "values 1024..2048");
        assert_eq!(h.upper_bound(), 2048);
    }

    #[test]
    fn clear_resets_counts() {
        let mut h = Pow2Histogram::new();
        h.add(100);
        assert!(!h.is_empty());
        h.clear();
        assert!(h.is_empty());
        assert_eq!(h.upper_bound(), 1);
    }

    #[test]
    fn snapshot_totals_match() {
        let mut h = Pow2Histogram::new();
        for ms in [1u64, 10, 100, 1000, 10_000] {
            h.add(ms);
        }
        let snap = h.snapshot();
        assert_eq!(snap.total, 5);
        assert_eq!(snap.buckets, h.buckets());
        assert_eq!(snap.upper_bound, h.upper_bound());
    }
}
