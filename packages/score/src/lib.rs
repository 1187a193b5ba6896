#![cfg_attr(feature = "fail-on-warnings", deny(warnings))]
#![warn(clippy::all, clippy::pedantic, clippy::nursery, clippy::cargo)]
#![allow(clippy::multiple_crate_versions, clippy::cargo_common_metadata)]

//! Composite area scoring.
//!
//! Every scored indicator contributes its direction-corrected normalized
//! value, weighted by the indicator weight. Weights are renormalized per
//! area over the indicators that actually have data for it, so an area
//! missing a statistic is neither rewarded nor punished for the gap.
//! Configured vulnerability penalties are then subtracted and the result
//! is clamped to `[0, 100]`.

pub mod drift;

use std::collections::{BTreeMap, BTreeSet};

use area_score_config::progress::{StageProgress, WorkUnit};
use area_score_config::{Penalty, PipelineConfig};
use area_score_geography_models::VulnerabilityMapping;
use area_score_indicator_models::{Indicator, IndicatorValue};
use area_score_score_models::{AppliedPenalty, CompositeScore, ScoreRun};
use rayon::prelude::*;

pub use drift::drift_report;

/// Errors raised by scoring.
#[derive(Debug, thiserror::Error)]
pub enum ScoreError {
    /// No indicator is active with a positive weight.
    #[error("No scored indicators are configured")]
    NoIndicators,
    /// No scored indicator has a normalized value in any year.
    #[error("No normalized indicator values available to score {year}")]
    NoData {
        /// Requested year.
        year: i32,
    },
}

/// Rounds to `places` decimal places.
#[must_use]
pub fn round_to(value: f64, places: i32) -> f64 {
    let factor = 10f64.powi(places);
    (value * factor).round() / factor
}

/// The year closest to `target` among `available`. Equal distances
/// resolve to the later year.
#[must_use]
pub fn nearest_year(available: impl IntoIterator<Item = i32>, target: i32) -> Option<i32> {
    available
        .into_iter()
        .min_by_key(|year| ((year - target).abs(), std::cmp::Reverse(*year)))
}

/// Normalized values of one indicator for the year used to score it.
struct IndicatorSlice<'a> {
    indicator: &'a Indicator,
    year: i32,
    values: BTreeMap<&'a str, f64>,
}

/// Computes composite scores under one configuration snapshot.
pub struct ScoreComposer<'a> {
    config: &'a PipelineConfig,
}

impl<'a> ScoreComposer<'a> {
    /// Creates a composer using the configuration's scored indicators,
    /// penalties and factor thresholds.
    #[must_use]
    pub const fn new(config: &'a PipelineConfig) -> Self {
        Self { config }
    }

    /// Scores every area with at least one scored indicator value for
    /// `year`, falling back per indicator to the nearest year with data.
    ///
    /// `values` may hold rows of any indicator and year. `vulnerability`
    /// is used for penalties only. Areas without data produce no row.
    ///
    /// # Errors
    ///
    /// * [`ScoreError::NoIndicators`] if nothing is configured to score.
    /// * [`ScoreError::NoData`] if no scored indicator has normalized
    ///   values in any year.
    pub fn compute_scores(
        &self,
        year: i32,
        values: &[IndicatorValue],
        vulnerability: &[VulnerabilityMapping],
        progress: &dyn StageProgress,
    ) -> Result<Vec<CompositeScore>, ScoreError> {
        let indicators: Vec<&Indicator> = self.config.scored_indicators().collect();
        if indicators.is_empty() {
            return Err(ScoreError::NoIndicators);
        }

        let slices = resolve_slices(&indicators, values, year);
        if slices.is_empty() {
            return Err(ScoreError::NoData { year });
        }

        let area_codes: Vec<&str> = slices
            .iter()
            .flat_map(|slice| slice.values.keys().copied())
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();

        let mut vulnerability_by_area: BTreeMap<&str, Vec<&VulnerabilityMapping>> = BTreeMap::new();
        for mapping in vulnerability {
            vulnerability_by_area
                .entry(mapping.area_code.as_str())
                .or_default()
                .push(mapping);
        }
        let penalties: Vec<&Penalty> = self.config.scoring.active_penalties().collect();

        progress.start(area_codes.len() as u64, WorkUnit::Areas);

        let scores: Vec<CompositeScore> = area_codes
            .par_iter()
            .filter_map(|code| {
                let score = self.compose_area(
                    code,
                    year,
                    &slices,
                    &penalties,
                    vulnerability_by_area.get(code).map_or(&[][..], Vec::as_slice),
                );
                progress.advance(1);
                score
            })
            .collect();

        progress.done(&format!("Scored {} areas for {year}", scores.len()));
        log::info!(
            "Scored {} of {} areas for {year} with {} indicators",
            scores.len(),
            area_codes.len(),
            slices.len()
        );

        Ok(scores)
    }

    fn compose_area(
        &self,
        area_code: &str,
        year: i32,
        slices: &[IndicatorSlice<'_>],
        penalties: &[&Penalty],
        vulnerability: &[&VulnerabilityMapping],
    ) -> Option<CompositeScore> {
        let scoring = &self.config.scoring;
        let mut weighted_sum = 0.0;
        let mut available_weight = 0.0;
        let mut factor_scores = BTreeMap::new();
        let mut top_positive = Vec::new();
        let mut top_negative = Vec::new();
        let mut fallback_years = BTreeMap::new();

        for slice in slices {
            let Some(normalized) = slice.values.get(area_code) else {
                continue;
            };
            let Some(directed) = slice.indicator.direction.directed(*normalized) else {
                continue;
            };

            weighted_sum += slice.indicator.weight * directed;
            available_weight += slice.indicator.weight;
            factor_scores.insert(slice.indicator.slug.clone(), round_to(directed, 4));

            if directed >= scoring.top_positive_threshold {
                top_positive.push(slice.indicator.slug.clone());
            } else if directed <= scoring.top_negative_threshold {
                top_negative.push(slice.indicator.slug.clone());
            }

            if slice.year != year {
                log::debug!(
                    "{area_code}: {} scored from {} instead of {year}",
                    slice.indicator.slug,
                    slice.year
                );
                fallback_years.insert(slice.indicator.slug.clone(), slice.year);
            }
        }

        if available_weight <= 0.0 {
            return None;
        }

        let raw_score = round_to(weighted_sum / available_weight * 100.0, 2);
        let penalties_applied = applicable_penalties(raw_score, penalties, vulnerability);
        let total_penalty: f64 = penalties_applied.iter().map(|p| p.amount).sum();
        let score = round_to(raw_score + total_penalty, 2).clamp(0.0, 100.0);

        Some(CompositeScore {
            area_code: area_code.to_string(),
            year,
            score,
            raw_score_before_penalties: (!penalties_applied.is_empty()).then_some(raw_score),
            trend_1y: None,
            trend_3y: None,
            factor_scores,
            top_positive,
            top_negative,
            penalties_applied,
            fallback_years,
        })
    }
}

/// Picks, per indicator, the target year when it has normalized values and
/// the nearest year with values otherwise. Indicators with no normalized
/// value in any year are left out.
fn resolve_slices<'a>(
    indicators: &[&'a Indicator],
    values: &'a [IndicatorValue],
    year: i32,
) -> Vec<IndicatorSlice<'a>> {
    let mut by_indicator: BTreeMap<&str, BTreeMap<i32, BTreeMap<&'a str, f64>>> = BTreeMap::new();
    for value in values {
        let Some(normalized) = value.normalized_value.filter(|v| v.is_finite()) else {
            continue;
        };
        by_indicator
            .entry(value.indicator.as_str())
            .or_default()
            .entry(value.year)
            .or_default()
            .insert(value.area_code.as_str(), normalized);
    }

    indicators
        .iter()
        .filter_map(|indicator| {
            let Some(mut years) = by_indicator.remove(indicator.slug.as_str()) else {
                log::warn!("{}: no normalized values in any year", indicator.slug);
                return None;
            };
            let resolved = nearest_year(years.keys().copied(), year)?;
            if resolved != year {
                log::info!(
                    "{}: no normalized values for {year}, using nearest year {resolved}",
                    indicator.slug
                );
            }
            years.remove(&resolved).map(|values| IndicatorSlice {
                indicator,
                year: resolved,
                values,
            })
        })
        .collect()
}

/// Penalties triggered by the area's vulnerability mappings, keeping only
/// the most negative one per category.
fn applicable_penalties(
    raw_score: f64,
    penalties: &[&Penalty],
    vulnerability: &[&VulnerabilityMapping],
) -> Vec<AppliedPenalty> {
    let mut worst: BTreeMap<&str, AppliedPenalty> = BTreeMap::new();

    for penalty in penalties {
        let triggered = vulnerability
            .iter()
            .any(|m| m.tier == penalty.tier && m.overlap_fraction >= penalty.min_overlap);
        if !triggered {
            continue;
        }

        let amount = round_to(penalty.kind.amount(penalty.value, raw_score), 2);
        let replace = worst
            .get(penalty.category.as_str())
            .is_none_or(|current| amount < current.amount);
        if replace {
            worst.insert(
                penalty.category.as_str(),
                AppliedPenalty {
                    slug: penalty.slug.clone(),
                    amount,
                },
            );
        }
    }

    worst.into_values().collect()
}

/// Fills `trend_1y` and `trend_3y` from the same areas' scores one and
/// three years earlier. Areas absent from a prior year keep `None`.
pub fn attach_deltas(
    scores: &mut [CompositeScore],
    one_year_ago: &BTreeMap<String, f64>,
    three_years_ago: &BTreeMap<String, f64>,
) {
    for score in scores.iter_mut() {
        score.trend_1y = one_year_ago
            .get(&score.area_code)
            .map(|prev| round_to(score.score - prev, 2));
        score.trend_3y = three_years_ago
            .get(&score.area_code)
            .map(|prev| round_to(score.score - prev, 2));
    }
}

/// Mean and population standard deviation of `values`.
#[must_use]
pub fn mean_and_stddev(values: &[f64]) -> (f64, f64) {
    if values.is_empty() {
        return (0.0, 0.0);
    }

    #[allow(clippy::cast_precision_loss)]
    let n = values.len() as f64;
    let mean = values.iter().sum::<f64>() / n;
    let variance = values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / n;

    (mean, variance.sqrt())
}

/// Summary row for one scoring run.
#[must_use]
pub fn score_run(year: i32, scores: &[CompositeScore], config_fingerprint: &str) -> ScoreRun {
    let values: Vec<f64> = scores.iter().map(|s| s.score).collect();
    let (mean, stddev) = mean_and_stddev(&values);

    ScoreRun {
        id: uuid::Uuid::new_v4().to_string(),
        year,
        computed_at: chrono::Utc::now().to_rfc3339(),
        area_count: scores.len(),
        mean_score: round_to(mean, 2),
        stddev_score: round_to(stddev, 2),
        config_fingerprint: config_fingerprint.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use area_score_config::progress::NullProgress;
    use area_score_geography_models::VulnerabilityTier;

    use super::*;

    fn normalized(area: &str, indicator: &str, year: i32, value: f64) -> IndicatorValue {
        IndicatorValue {
            area_code: area.to_string(),
            indicator: indicator.to_string(),
            year,
            raw_value: Some(0.0),
            normalized_value: Some(value),
        }
    }

    fn by_code(scores: &[CompositeScore]) -> BTreeMap<&str, &CompositeScore> {
        scores.iter().map(|s| (s.area_code.as_str(), s)).collect()
    }

    #[test]
    fn negative_direction_is_inverted() {
        let config = PipelineConfig::embedded().unwrap();
        let values = vec![normalized("A", "crime_violent_rate", 2024, 0.8)];

        let scores = ScoreComposer::new(&config)
            .compute_scores(2024, &values, &[], &NullProgress)
            .unwrap();

        assert_eq!(scores.len(), 1);
        assert!((scores[0].factor_scores["crime_violent_rate"] - 0.2).abs() < 1e-9);
        assert!((scores[0].score - 20.0).abs() < 1e-9);
        assert_eq!(scores[0].top_negative, vec!["crime_violent_rate".to_string()]);
    }

    #[test]
    fn weights_renormalize_over_available_indicators() {
        let config = PipelineConfig::embedded().unwrap();
        let mut values = vec![
            normalized("FULL", "median_income", 2024, 1.0),
            normalized("FULL", "employment_rate", 2024, 0.0),
            normalized("PART", "median_income", 2024, 1.0),
        ];
        values.push(normalized("OTHER", "employment_rate", 2024, 0.5));

        let scores = ScoreComposer::new(&config)
            .compute_scores(2024, &values, &[], &NullProgress)
            .unwrap();
        let scores = by_code(&scores);

        // 0.075 * 1.0 / (0.075 + 0.065)
        assert!((scores["FULL"].score - 53.57).abs() < 1e-9);
        assert!((scores["PART"].score - 100.0).abs() < 1e-9);
        assert!((scores["OTHER"].score - 50.0).abs() < 1e-9);
    }

    #[test]
    fn area_without_scored_data_gets_no_row() {
        let config = PipelineConfig::embedded().unwrap();
        let values = vec![
            normalized("A", "median_income", 2024, 0.6),
            normalized("NEUTRAL_ONLY", "population", 2024, 0.9),
            IndicatorValue::raw("RAW_ONLY", "median_income", 2024, 300_000.0),
        ];

        let scores = ScoreComposer::new(&config)
            .compute_scores(2024, &values, &[], &NullProgress)
            .unwrap();

        assert_eq!(scores.len(), 1);
        assert_eq!(scores[0].area_code, "A");
    }

    #[test]
    fn no_normalized_values_is_an_error() {
        let config = PipelineConfig::embedded().unwrap();
        let values = vec![IndicatorValue::raw("A", "median_income", 2024, 1.0)];

        let result = ScoreComposer::new(&config).compute_scores(2024, &values, &[], &NullProgress);
        assert!(matches!(result, Err(ScoreError::NoData { year: 2024 })));
    }

    #[test]
    fn nearest_year_fallback_is_recorded() {
        let config = PipelineConfig::embedded().unwrap();
        let values = vec![
            normalized("A", "median_income", 2024, 0.5),
            normalized("A", "perceived_safety", 2021, 0.1),
            normalized("A", "perceived_safety", 2022, 0.9),
        ];

        let scores = ScoreComposer::new(&config)
            .compute_scores(2024, &values, &[], &NullProgress)
            .unwrap();

        assert_eq!(scores[0].fallback_years.get("perceived_safety"), Some(&2022));
        assert!(!scores[0].fallback_years.contains_key("median_income"));
        assert!((scores[0].factor_scores["perceived_safety"] - 0.9).abs() < 1e-9);
    }

    #[test]
    fn nearest_year_prefers_later_on_tie() {
        assert_eq!(nearest_year([2022, 2026], 2024), Some(2026));
        assert_eq!(nearest_year([2020, 2023], 2024), Some(2023));
        assert_eq!(nearest_year(std::iter::empty(), 2024), None);
    }

    #[test]
    fn worst_penalty_per_category_applies() {
        let config = PipelineConfig::embedded().unwrap();
        let values = vec![normalized("A", "median_income", 2024, 0.6)];
        let vulnerability = vec![
            VulnerabilityMapping {
                area_code: "A".to_string(),
                tier: VulnerabilityTier::Vulnerable,
                overlap_fraction: 0.5,
            },
            VulnerabilityMapping {
                area_code: "A".to_string(),
                tier: VulnerabilityTier::SeverelyVulnerable,
                overlap_fraction: 0.2,
            },
        ];

        let scores = ScoreComposer::new(&config)
            .compute_scores(2024, &values, &vulnerability, &NullProgress)
            .unwrap();

        let score = &scores[0];
        assert_eq!(score.penalties_applied.len(), 1);
        assert_eq!(score.penalties_applied[0].slug, "vuln_severely_vulnerable");
        assert_eq!(score.raw_score_before_penalties, Some(60.0));
        assert!((score.score - 45.0).abs() < 1e-9);
    }

    #[test]
    fn small_overlap_does_not_trigger_penalty() {
        let config = PipelineConfig::embedded().unwrap();
        let values = vec![normalized("A", "median_income", 2024, 0.05)];
        let vulnerability = vec![VulnerabilityMapping {
            area_code: "A".to_string(),
            tier: VulnerabilityTier::SeverelyVulnerable,
            overlap_fraction: 0.05,
        }];

        let scores = ScoreComposer::new(&config)
            .compute_scores(2024, &values, &vulnerability, &NullProgress)
            .unwrap();
        assert!(scores[0].penalties_applied.is_empty());
        assert_eq!(scores[0].raw_score_before_penalties, None);
    }

    #[test]
    fn penalized_score_is_clamped_at_zero() {
        let config = PipelineConfig::embedded().unwrap();
        let values = vec![normalized("A", "median_income", 2024, 0.05)];
        let vulnerability = vec![VulnerabilityMapping {
            area_code: "A".to_string(),
            tier: VulnerabilityTier::SeverelyVulnerable,
            overlap_fraction: 1.0,
        }];

        let scores = ScoreComposer::new(&config)
            .compute_scores(2024, &values, &vulnerability, &NullProgress)
            .unwrap();
        assert!(scores[0].score.abs() < f64::EPSILON);
        assert_eq!(scores[0].raw_score_before_penalties, Some(5.0));
    }

    #[test]
    fn deltas_join_prior_years() {
        let config = PipelineConfig::embedded().unwrap();
        let values = vec![
            normalized("A", "median_income", 2024, 0.6),
            normalized("B", "median_income", 2024, 0.4),
        ];
        let mut scores = ScoreComposer::new(&config)
            .compute_scores(2024, &values, &[], &NullProgress)
            .unwrap();

        let one: BTreeMap<String, f64> = [("A".to_string(), 55.5)].into_iter().collect();
        let three: BTreeMap<String, f64> = [("B".to_string(), 48.0)].into_iter().collect();
        attach_deltas(&mut scores, &one, &three);

        let scores = by_code(&scores);
        assert_eq!(scores["A"].trend_1y, Some(4.5));
        assert_eq!(scores["A"].trend_3y, None);
        assert_eq!(scores["B"].trend_1y, None);
        assert_eq!(scores["B"].trend_3y, Some(-8.0));
    }

    #[test]
    fn run_summary_carries_fingerprint() {
        let config = PipelineConfig::embedded().unwrap();
        let values = vec![
            normalized("A", "median_income", 2024, 0.6),
            normalized("B", "median_income", 2024, 0.4),
        ];
        let scores = ScoreComposer::new(&config)
            .compute_scores(2024, &values, &[], &NullProgress)
            .unwrap();

        let run = score_run(2024, &scores, config.fingerprint());
        assert_eq!(run.area_count, 2);
        assert!((run.mean_score - 50.0).abs() < 1e-9);
        assert!((run.stddev_score - 10.0).abs() < 1e-9);
        assert_eq!(run.config_fingerprint, config.fingerprint());
        assert_eq!(run.id.len(), 36);
    }

    #[test]
    fn rounding() {
        assert!((round_to(53.571_428, 2) - 53.57).abs() < 1e-12);
        assert!((round_to(0.123_456, 4) - 0.1235).abs() < 1e-12);
    }
}
