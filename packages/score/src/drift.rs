//! Comparison of a fresh scoring run against previously stored scores.

use std::collections::BTreeMap;

use area_score_score_models::{AreaDrift, CompositeScore, DriftReport};

use crate::{mean_and_stddev, round_to};

/// Compares `current` against `previous` scores of the same year.
///
/// Drift statistics cover areas present in both versions; version means
/// and deviations cover each version in full. Areas whose absolute drift
/// exceeds `threshold` are listed, largest first.
#[must_use]
pub fn drift_report(
    previous: &BTreeMap<String, f64>,
    current: &[CompositeScore],
    threshold: f64,
) -> DriftReport {
    let old_values: Vec<f64> = previous.values().copied().collect();
    let new_values: Vec<f64> = current.iter().map(|s| s.score).collect();
    let (mean_old, stddev_old) = mean_and_stddev(&old_values);
    let (mean_new, stddev_new) = mean_and_stddev(&new_values);

    let mut drifts: Vec<AreaDrift> = current
        .iter()
        .filter_map(|score| {
            previous.get(&score.area_code).map(|old| AreaDrift {
                area_code: score.area_code.clone(),
                old_score: *old,
                new_score: score.score,
                drift: round_to(score.score - old, 2),
            })
        })
        .collect();

    drifts.sort_by(|a, b| {
        b.drift
            .abs()
            .total_cmp(&a.drift.abs())
            .then_with(|| a.area_code.cmp(&b.area_code))
    });

    let total_areas = drifts.len();
    let (mean_drift, max_drift) = if drifts.is_empty() {
        (0.0, 0.0)
    } else {
        let abs: Vec<f64> = drifts.iter().map(|d| d.drift.abs()).collect();
        #[allow(clippy::cast_precision_loss)]
        let mean = abs.iter().sum::<f64>() / abs.len() as f64;
        (mean, abs.iter().copied().fold(0.0, f64::max))
    };

    if total_areas > 0 {
        log::info!(
            "Drift over {total_areas} areas: mean {mean_drift:.2}, max {max_drift:.2}"
        );
    }

    DriftReport {
        total_areas,
        mean_drift: round_to(mean_drift, 2),
        max_drift: round_to(max_drift, 2),
        mean_score_new: round_to(mean_new, 2),
        mean_score_old: round_to(mean_old, 2),
        stddev_new: round_to(stddev_new, 2),
        stddev_old: round_to(stddev_old, 2),
        areas_with_large_drift: drifts
            .into_iter()
            .filter(|d| d.drift.abs() > threshold)
            .collect(),
    }
}
