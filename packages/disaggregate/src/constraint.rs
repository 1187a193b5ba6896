//! Allocation of a district rate onto fine areas and the population-weighted
//! constraint that keeps the allocation consistent with the district.

/// Initial per-area estimates: `rate × normalized_weight × n`, clamped to
/// `[min_scale × rate, max_scale × rate]`.
///
/// `rate` must be finite and non-negative and `min_scale <= max_scale`.
#[must_use]
pub fn initial_estimates(
    rate: f64,
    normalized_weights: &[f64],
    min_scale: f64,
    max_scale: f64,
) -> Vec<f64> {
    #[allow(clippy::cast_precision_loss)]
    let n = normalized_weights.len() as f64;
    let lo = rate * min_scale;
    let hi = rate * max_scale;

    normalized_weights
        .iter()
        .map(|w| (rate * w * n).clamp(lo, hi))
        .collect()
}

/// Rescales `estimates` in place by one multiplicative factor so that
/// `Σ(estimate × population) / Σ(population) == target`.
///
/// Returns `false` when the rescale is impossible (no population or a
/// non-positive weighted sum), in which case the estimates are untouched.
/// A zero target with all-zero estimates already satisfies the constraint
/// and returns `true`.
pub fn constrain_to_rate(estimates: &mut [f64], populations: &[f64], target: f64) -> bool {
    let total_population: f64 = populations.iter().sum();
    if total_population <= 0.0 {
        return false;
    }

    let weighted_sum: f64 = estimates
        .iter()
        .zip(populations)
        .map(|(e, p)| e * p)
        .sum();

    if weighted_sum <= 0.0 {
        return target.abs() < f64::EPSILON;
    }

    let current_mean = weighted_sum / total_population;
    let factor = target / current_mean;
    for estimate in estimates.iter_mut() {
        *estimate *= factor;
    }

    true
}

/// Population-weighted mean of `values`.
#[must_use]
pub fn weighted_mean(values: &[f64], populations: &[f64]) -> Option<f64> {
    let total: f64 = populations.iter().sum();
    if total <= 0.0 {
        return None;
    }

    Some(values.iter().zip(populations).map(|(v, p)| v * p).sum::<f64>() / total)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn estimates_scale_by_weight_share() {
        let estimates = initial_estimates(10.0, &[0.8, 0.2], 0.1, 3.0);
        assert!((estimates[0] - 16.0).abs() < 1e-12);
        assert!((estimates[1] - 4.0).abs() < 1e-12);
    }

    #[test]
    fn estimates_are_clamped() {
        let estimates = initial_estimates(10.0, &[0.98, 0.01, 0.01], 0.1, 3.0);
        assert!((estimates[0] - 29.4).abs() < 1e-9);
        assert!((estimates[1] - 1.0).abs() < 1e-12);

        let estimates = initial_estimates(10.0, &[1.0, 0.0, 0.0, 0.0], 0.1, 3.0);
        assert!((estimates[0] - 30.0).abs() < 1e-12);
    }

    #[test]
    fn constraint_reproduces_target() {
        let mut estimates = vec![16.0, 4.0];
        let populations = vec![100.0, 300.0];
        assert!(constrain_to_rate(&mut estimates, &populations, 10.0));

        let mean = weighted_mean(&estimates, &populations).unwrap();
        assert!((mean - 10.0).abs() < 1e-9);
        assert!((estimates[0] - 160.0 / 7.0).abs() < 1e-9);
        assert!((estimates[1] - 40.0 / 7.0).abs() < 1e-9);
    }

    #[test]
    fn constraint_skips_without_population() {
        let mut estimates = vec![5.0, 6.0];
        assert!(!constrain_to_rate(&mut estimates, &[0.0, 0.0], 10.0));
        assert_eq!(estimates, vec![5.0, 6.0]);
    }

    #[test]
    fn zero_rate_is_trivially_constrained() {
        let mut estimates = vec![0.0, 0.0];
        assert!(constrain_to_rate(&mut estimates, &[10.0, 20.0], 0.0));
        assert!(!constrain_to_rate(&mut estimates, &[10.0, 20.0], 4.0));
    }
}
