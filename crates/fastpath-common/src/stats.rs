//! Online timing statistics
//!
//! Running sums and sums of squares, enough for mean/variance reporting
//! without keeping samples around.

/// Running sum / sum-of-squares accumulator over microsecond samples
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct RunningStats {
    count: u64,
    sum: u64,
    sum_sq: u64,
}

impl RunningStats {
    /// Empty accumulator
    pub const fn new() -> Self {
        Self { count: 0, sum: 0, sum_sq: 0 }
    }

    /// Add one sample
    #[inline]
    pub fn record(&mut self, sample_us: u64) {
        self.count += 1;
        self.sum = self.sum.saturating_add(sample_us);
        self.sum_sq = self.sum_sq.saturating_add(sample_us.saturating_mul(sample_us));
    }

    /// Number of samples
    pub fn count(&self) -> u64 {
        self.count
    }

    /// Sum of samples
    pub fn sum(&self) -> u64 {
        self.sum
    }

    /// Sum of squared samples
    pub fn sum_sq(&self) -> u64 {
        self.sum_sq
    }

    /// Mean, 0 when empty
    pub fn mean(&self) -> f64 {
        if self.count == 0 {
            return 0.0;
        }
        self.sum as f64 / self.count as f64
    }

    /// Population variance, 0 when empty
    pub fn variance(&self) -> f64 {
        if self.count == 0 {
            return 0.0;
        }
        let mean = self.mean();
        (self.sum_sq as f64 / self.count as f64 - mean * mean).max(0.0)
    }

    /// Standard deviation
    pub fn std_dev(&self) -> f64 {
        self.variance().sqrt()
    }
}
