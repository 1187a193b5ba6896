//! Normalization algorithms over a slice of finite raw values.
//!
//! Every function returns one output per input, in input order, within
//! `[0, 1]`.

use std::f64::consts::PI;

use area_score_indicator_models::NormalizationMethod;

/// Value given to every observation when the input carries no spread.
pub const NEUTRAL: f64 = 0.5;

/// Runs `method` over `values`.
#[must_use]
pub fn apply(method: NormalizationMethod, values: &[f64]) -> Vec<f64> {
    match method {
        NormalizationMethod::RankPercentile => rank_percentile(values),
        NormalizationMethod::MinMax => min_max(values),
        NormalizationMethod::ZScore => z_score(values),
    }
}

/// Percentile rank `(rank - 1) / (n - 1)` where tied values share their
/// average rank. A single observation is placed at the middle.
#[must_use]
pub fn rank_percentile(values: &[f64]) -> Vec<f64> {
    let n = values.len();
    let mut out = vec![NEUTRAL; n];
    if n < 2 {
        return out;
    }

    let mut order: Vec<usize> = (0..n).collect();
    order.sort_by(|a, b| values[*a].total_cmp(&values[*b]));

    #[allow(clippy::cast_precision_loss)]
    let denominator = (n - 1) as f64;

    let mut start = 0;
    while start < n {
        let mut end = start;
        while end + 1 < n && values[order[end + 1]].total_cmp(&values[order[start]]).is_eq() {
            end += 1;
        }

        // zero-based average position of the tie group
        #[allow(clippy::cast_precision_loss)]
        let average = (start + end) as f64 / 2.0;
        let percentile = average / denominator;

        for &index in &order[start..=end] {
            out[index] = percentile;
        }
        start = end + 1;
    }

    out
}

/// `(value - min) / (max - min)`; every value gets [`NEUTRAL`] when
/// `max == min`.
#[must_use]
pub fn min_max(values: &[f64]) -> Vec<f64> {
    let Some(min) = values.iter().copied().reduce(f64::min) else {
        return Vec::new();
    };
    let max = values.iter().copied().fold(min, f64::max);
    let range = max - min;

    if range <= 0.0 {
        return vec![NEUTRAL; values.len()];
    }

    values.iter().map(|v| (v - min) / range).collect()
}

/// Standardizes by the population mean and standard deviation, then maps
/// through [`s_curve`]. Zero deviation yields `z = 0` for every value.
#[must_use]
pub fn z_score(values: &[f64]) -> Vec<f64> {
    if values.is_empty() {
        return Vec::new();
    }

    #[allow(clippy::cast_precision_loss)]
    let n = values.len() as f64;
    let mean = values.iter().sum::<f64>() / n;
    let variance = values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / n;
    let stddev = variance.sqrt();

    values
        .iter()
        .map(|v| {
            let z = if stddev > 0.0 { (v - mean) / stddev } else { 0.0 };
            s_curve(z)
        })
        .collect()
}

/// Smooth CDF-like map from a z-score to `[0, 1]`:
/// `0.5 + 0.5 × sign(z) × sqrt(1 - exp(-2z² / π))`.
///
/// Symmetric around 0.5 at `z = 0` and saturating toward 0 and 1.
#[must_use]
pub fn s_curve(z: f64) -> f64 {
    let magnitude = (1.0 - (-2.0 * z * z / PI).exp()).sqrt();
    let signed = if z < 0.0 { -magnitude } else { magnitude };
    0.5f64.mul_add(signed, 0.5).clamp(0.0, 1.0)
}
