use core::fmt::Debug;
use core::ops::AddAssign;
use num_traits::{cast::FromPrimitive, float::Float, identities::One, identities::Zero};
use rolling_stats::Stats;

use crate::percentile::{percentile, sorted_finite};

/// A growing series of samples with running mean and deviation.
/// Non-finite samples are rejected on push so that one bad finite
/// difference never poisons a whole run.
#[derive(Clone)]
pub struct SampleSet<F: Float + Zero + One + AddAssign + FromPrimitive + PartialEq + Debug = f64>
{
    values: Vec<F>,
    stats: Stats<F>,
}

impl<F: Float + Zero + One + AddAssign + FromPrimitive + PartialEq + Debug> Debug
    for SampleSet<F>
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SampleSet")
            .field("len", &self.values.len())
            .field("mean", &self.stats.mean)
            .field("std_dev", &self.stats.std_dev)
            .finish()
    }
}

impl<F: Float + Zero + One + AddAssign + FromPrimitive + PartialEq + Debug> Default
    for SampleSet<F>
{
    fn default() -> Self {
        Self::new()
    }
}

impl<F: Float + Zero + One + AddAssign + FromPrimitive + PartialEq + Debug> SampleSet<F> {
    pub fn new() -> Self {
        Self {
            values: Vec::new(),
            stats: Stats::new(),
        }
    }

    /// Returns false (and records nothing) for NaN or infinite samples.
    pub fn push(&mut self, value: F) -> bool {
        if !value.is_finite() {
            return false;
        }
        self.values.push(value);
        self.stats.update(value);
        true
    }

    pub fn mean(&self) -> Option<F> {
        if self.values.is_empty() {
            None
        } else {
            Some(self.stats.mean)
        }
    }

    /// Sample (n - 1) standard deviation, zero until there are two samples.
    pub fn std_dev(&self) -> F {
        if self.values.len() < 2 || !self.stats.std_dev.is_finite() {
            F::zero()
        } else {
            self.stats.std_dev
        }
    }

    /// Population (n) standard deviation.
    pub fn population_std_dev(&self) -> F {
        let n = match F::from_usize(self.values.len()) {
            Some(n) if self.values.len() > 1 => n,
            _ => return F::zero(),
        };
        let mean = self.stats.mean;
        let sum_sq = self
            .values
            .iter()
            .fold(F::zero(), |acc, v| acc + (*v - mean) * (*v - mean));
        (sum_sq / n).sqrt()
    }

    pub fn min(&self) -> Option<F> {
        self.values.iter().copied().fold(None, |acc, v| match acc {
            Some(m) if m <= v => Some(m),
            _ => Some(v),
        })
    }

    pub fn max(&self) -> Option<F> {
        self.values.iter().copied().fold(None, |acc, v| match acc {
            Some(m) if m >= v => Some(m),
            _ => Some(v),
        })
    }

    pub fn percentile(&self, q: f64) -> Option<F> {
        percentile(&sorted_finite(&self.values), q)
    }

    pub fn median(&self) -> Option<F> {
        self.percentile(0.5)
    }

    /// Share of samples for which `pred` holds, zero when empty.
    pub fn fraction_where(&self, pred: impl Fn(F) -> bool) -> F {
        let n = match F::from_usize(self.values.len()) {
            Some(n) if !self.values.is_empty() => n,
            _ => return F::zero(),
        };
        let hits = self.values.iter().filter(|v| pred(**v)).count();
        F::from_usize(hits).unwrap_or_else(F::zero) / n
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &F> {
        self.values.iter()
    }
}

impl<F: Float + Zero + One + AddAssign + FromPrimitive + PartialEq + Debug> Extend<F>
    for SampleSet<F>
{
    fn extend<I: IntoIterator<Item = F>>(&mut self, iter: I) {
        for v in iter {
            self.push(v);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    #[test]
    fn test_mean_and_deviations() {
        let mut set = SampleSet::new();
        set.extend(vec![10.0, 20.0, 30.0]);

        assert_eq!(set.len(), 3);
        assert_abs_diff_eq!(set.mean().unwrap(), 20.0, epsilon = 1e-9);
        assert_abs_diff_eq!(set.population_std_dev(), (200.0f64 / 3.0).sqrt(), epsilon = 1e-9);
        assert_abs_diff_eq!(set.min().unwrap(), 10.0, epsilon = 1e-12);
        assert_abs_diff_eq!(set.max().unwrap(), 30.0, epsilon = 1e-12);
    }

    #[test]
    fn test_rejects_non_finite() {
        let mut set = SampleSet::new();
        assert!(set.push(1.0));
        assert!(!set.push(f64::NAN));
        assert!(!set.push(f64::NEG_INFINITY));
        assert_eq!(set.len(), 1);
        assert_abs_diff_eq!(set.std_dev(), 0.0, epsilon = 1e-12);
    }

    #[test]
    fn test_empty_set() {
        let set: SampleSet = SampleSet::new();
        assert!(set.mean().is_none());
        assert!(set.median().is_none());
        assert_abs_diff_eq!(set.fraction_where(|v| v > 0.0), 0.0, epsilon = 1e-12);
    }

    #[test]
    fn test_fraction_where() {
        let mut set = SampleSet::new();
        set.extend(vec![0.5, 1.5, 2.5, 3.5]);
        assert_abs_diff_eq!(set.fraction_where(|v| v < 2.0), 0.5, epsilon = 1e-12);
    }
}
