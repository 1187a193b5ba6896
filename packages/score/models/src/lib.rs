#![cfg_attr(feature = "fail-on-warnings", deny(warnings))]
#![warn(clippy::all, clippy::pedantic, clippy::nursery, clippy::cargo)]
#![allow(clippy::multiple_crate_versions, clippy::cargo_common_metadata)]

//! Output types of the scoring pipeline.
//!
//! Covers disaggregation estimates, indicator trends, composite scores
//! with their factor breakdown, scoring-run summaries and drift reports,
//! and hex-grid cell scores together with the smoothing presets that
//! produce them.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use strum_macros::{AsRefStr, Display, EnumString};

/// A coarse-area (district) statistic destined for disaggregation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DistrictRate {
    /// District code.
    pub district_code: String,
    /// Observation year.
    pub year: i32,
    /// Published rate for the whole district.
    pub rate: f64,
    /// Optional second rate disaggregated with the same weights.
    pub secondary_rate: Option<f64>,
    /// District population, informational.
    pub population: Option<u64>,
}

/// Estimated rate(s) for one fine area produced by disaggregation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DisaggregationResult {
    /// Fine area code.
    pub area_code: String,
    /// District the estimate was derived from.
    pub district_code: String,
    /// Observation year.
    pub year: i32,
    /// Target indicator the estimate was written to (e.g. `"crime_total_rate"`).
    pub target: String,
    /// Constrained estimate of the primary rate.
    pub estimated_rate: f64,
    /// Constrained estimate of the secondary rate.
    pub estimated_secondary_rate: Option<f64>,
    /// Demographic propensity weight before normalization and clamping.
    pub propensity_weight: f64,
    /// Propensity weight normalized to sum to one within the district.
    pub normalized_weight: f64,
    /// Whether the population-weighted constraint was applied.
    pub is_constrained: bool,
    /// Version tag of the model that produced the estimate.
    pub model_version: String,
}

/// Diagnostic fit of a disaggregation model against district truth.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ValidationReport {
    /// Target indicator of the fitted model.
    pub target: String,
    /// Year validated.
    pub year: i32,
    /// Coefficient of determination of district rate on mean propensity.
    pub r_squared: f64,
    /// Root mean squared error of the fitted line.
    pub rmse: f64,
    /// Number of districts used as evaluation points.
    pub districts: usize,
}

/// Classification of an indicator's change over a trend window.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    Display,
    EnumString,
    AsRefStr,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum TrendDirection {
    /// Increased beyond the stable threshold.
    Rising,
    /// Decreased beyond the stable threshold.
    Falling,
    /// Changed by no more than the stable threshold.
    Stable,
    /// Not enough data to say.
    Insufficient,
}

/// Change of one indicator for one area between two years.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IndicatorTrend {
    /// Fine area code.
    pub area_code: String,
    /// Indicator slug.
    pub indicator: String,
    /// First year of the window.
    pub base_year: i32,
    /// Last year of the window.
    pub end_year: i32,
    /// Non-null observations inside the window.
    pub data_points: u32,
    /// `end - base`, when both ends are present.
    pub absolute_change: Option<f64>,
    /// Change relative to `|base|` in percent.
    pub percent_change: Option<f64>,
    /// Direction classification.
    pub direction: TrendDirection,
    /// Share of expected observations present, capped at one.
    pub confidence: f64,
}

impl IndicatorTrend {
    /// Whether the trend is reliable enough to show.
    #[must_use]
    pub fn is_displayable(&self, min_confidence: f64) -> bool {
        self.direction != TrendDirection::Insufficient && self.confidence >= min_confidence
    }
}

/// A penalty subtracted from an area's composite score.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AppliedPenalty {
    /// Penalty identifier.
    pub slug: String,
    /// Signed score adjustment.
    pub amount: f64,
}

/// Composite quality score of one area for one year.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompositeScore {
    /// Fine area code.
    pub area_code: String,
    /// Scored year.
    pub year: i32,
    /// Final score in `[0, 100]`.
    pub score: f64,
    /// Score before penalties, when any penalty applied.
    pub raw_score_before_penalties: Option<f64>,
    /// `score - score(year - 1)`.
    pub trend_1y: Option<f64>,
    /// `score - score(year - 3)`.
    pub trend_3y: Option<f64>,
    /// Directed value per contributing indicator.
    pub factor_scores: BTreeMap<String, f64>,
    /// Indicators with a directed value at or above the positive threshold.
    pub top_positive: Vec<String>,
    /// Indicators with a directed value at or below the negative threshold.
    pub top_negative: Vec<String>,
    /// Penalties subtracted from the score.
    pub penalties_applied: Vec<AppliedPenalty>,
    /// Indicators whose value came from another year, with that year.
    pub fallback_years: BTreeMap<String, i32>,
}

/// Summary of one scoring run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScoreRun {
    /// Unique run identifier.
    pub id: String,
    /// Scored year.
    pub year: i32,
    /// RFC 3339 timestamp.
    pub computed_at: String,
    /// Number of areas scored.
    pub area_count: usize,
    /// Mean score.
    pub mean_score: f64,
    /// Population standard deviation of the score.
    pub stddev_score: f64,
    /// Fingerprint of the configuration the run used.
    pub config_fingerprint: String,
}

/// Score movement of one area between two versions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AreaDrift {
    /// Fine area code.
    pub area_code: String,
    /// Previously published score.
    pub old_score: f64,
    /// Newly computed score.
    pub new_score: f64,
    /// `new - old`.
    pub drift: f64,
}

/// Comparison of two score versions for the same year.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DriftReport {
    /// Areas present in both versions.
    pub total_areas: usize,
    /// Mean absolute drift.
    pub mean_drift: f64,
    /// Largest absolute drift.
    pub max_drift: f64,
    /// Mean score of the new version.
    pub mean_score_new: f64,
    /// Mean score of the previous version.
    pub mean_score_old: f64,
    /// Standard deviation of the new version.
    pub stddev_new: f64,
    /// Standard deviation of the previous version.
    pub stddev_old: f64,
    /// Areas whose absolute drift exceeds the threshold, largest first.
    pub areas_with_large_drift: Vec<AreaDrift>,
}

/// Weighting of neighbors by ring distance for multi-ring smoothing.
#[derive(
    Debug,
    Clone,
    Copy,
    Default,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    Display,
    EnumString,
    AsRefStr,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum DecayFunction {
    /// Every neighbor weighs the same.
    None,
    /// `1 - d / (k + 1)`.
    #[default]
    Linear,
    /// `exp(-(d / k)^2 / 2)`.
    Gaussian,
}

impl DecayFunction {
    /// Weight of a neighbor `ring_distance` rings away when smoothing over
    /// `k_rings` rings.
    #[must_use]
    pub fn weight(self, ring_distance: u32, k_rings: u32) -> f64 {
        let d = f64::from(ring_distance);
        let k = f64::from(k_rings.max(1));

        match self {
            Self::None => 1.0,
            Self::Linear => 1.0 - d / (k + 1.0),
            Self::Gaussian => (-(d / k).powi(2) / 2.0).exp(),
        }
    }
}

/// A named spatial smoothing preset.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SmoothingConfig {
    /// Preset name (e.g. `"light"`).
    pub name: String,
    /// Weight of a hex's own score.
    pub self_weight: f64,
    /// Weight of the neighbor average.
    pub neighbor_weight: f64,
    /// Neighborhood radius in rings.
    pub k_rings: u32,
    /// Decay by ring distance, used when `k_rings > 1`.
    #[serde(default)]
    pub decay: DecayFunction,
}

impl SmoothingConfig {
    /// Whether this preset leaves every score unchanged.
    #[must_use]
    pub fn is_identity(&self) -> bool {
        self.k_rings == 0 || self.neighbor_weight == 0.0
    }

    /// Whether self and neighbor weights sum to one.
    #[must_use]
    pub fn is_energy_preserving(&self) -> bool {
        (self.self_weight + self.neighbor_weight - 1.0).abs() < 1e-6
    }
}

/// Assignment of a hex cell to the area it represents.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HexAssignment {
    /// Fine area code.
    pub area_code: String,
    /// H3 cell index.
    pub h3_index: u64,
    /// H3 resolution of the cell.
    pub resolution: u8,
    /// 1.0 when the cell centroid lies in the area; the area's share of the
    /// cell otherwise.
    pub area_weight: f64,
    /// Whether the cell was assigned from the area's own centroid.
    pub centroid_fallback: bool,
}

/// Score of one hex cell at one resolution for one year.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HexCellScore {
    /// H3 cell index.
    pub h3_index: u64,
    /// H3 resolution of the cell.
    pub resolution: u8,
    /// Scored year.
    pub year: i32,
    /// Score projected from the area.
    pub score_raw: f64,
    /// Score after spatial smoothing.
    pub score_smoothed: Option<f64>,
    /// Neighbor weight used to smooth; zero when unsmoothed.
    pub smoothing_factor: f64,
    /// One-year score change projected from the area.
    pub trend_1y: Option<f64>,
    /// Area the score came from. `None` for aggregated parent cells.
    pub primary_area_code: Option<String>,
}
