use std::cmp::Ordering;

use num_traits::{cast::FromPrimitive, float::Float};

/// Copies out the finite values in ascending order.
pub fn sorted_finite<F: Float>(values: &[F]) -> Vec<F> {
    let mut sorted: Vec<F> = values.iter().copied().filter(|v| v.is_finite()).collect();
    sorted.sort_by(|a, b| a.partial_cmp(b).unwrap_or(Ordering::Equal));
    sorted
}

/// Linearly interpolated percentile of an ascending slice, `q` in [0, 1].
/// Position `q * (n - 1)` is split between its two neighbors, the same
/// convention numeric libraries default to.
pub fn percentile<F: Float + FromPrimitive>(sorted: &[F], q: f64) -> Option<F> {
    if sorted.is_empty() {
        return None;
    }
    let q = q.max(0.0).min(1.0);
    let pos = q * (sorted.len() - 1) as f64;
    let low_i = pos.floor() as usize;
    let high_i = pos.ceil() as usize;
    let frac = F::from_f64(pos - low_i as f64)?;

    let low = sorted[low_i];
    let high = sorted[high_i];
    Some(low + (high - low) * frac)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    #[test]
    fn test_percentile_interpolates() {
        let sorted = [1.0, 2.0, 3.0, 4.0];
        assert_abs_diff_eq!(percentile(&sorted, 0.5).unwrap(), 2.5, epsilon = 1e-12);
        assert_abs_diff_eq!(percentile(&sorted, 0.0).unwrap(), 1.0, epsilon = 1e-12);
        assert_abs_diff_eq!(percentile(&sorted, 1.0).unwrap(), 4.0, epsilon = 1e-12);
        assert_abs_diff_eq!(percentile(&sorted, 0.95).unwrap(), 3.85, epsilon = 1e-12);
    }

    #[test]
    fn test_percentile_empty_and_single() {
        let empty: [f64; 0] = [];
        assert_eq!(percentile(&empty, 0.5), None);
        assert_abs_diff_eq!(percentile(&[7.0], 0.05).unwrap(), 7.0, epsilon = 1e-12);
    }

    #[test]
    fn test_sorted_finite_drops_nan_and_inf() {
        let values = [3.0, f64::NAN, -1.0, f64::INFINITY, 2.0];
        assert_eq!(sorted_finite(&values), vec![-1.0, 2.0, 3.0]);
    }
}
