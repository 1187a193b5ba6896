#![cfg_attr(feature = "fail-on-warnings", deny(warnings))]
#![warn(clippy::all, clippy::pedantic, clippy::nursery, clippy::cargo)]
#![allow(clippy::multiple_crate_versions, clippy::cargo_common_metadata)]

//! Indicator configuration types and per-area indicator values.
//!
//! An [`Indicator`] describes one statistic (median income, violent crime
//! rate, debt rate, ...) and how it feeds the composite score. Its
//! normalization method, scope, direction, and unit are closed enums so
//! that every stage dispatches on a resolved variant rather than on
//! configuration strings.

use serde::{Deserialize, Serialize};
use strum_macros::{AsRefStr, Display, EnumString};

/// Whether higher raw values of an indicator are good or bad.
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
pub enum Direction {
    /// Higher is better.
    Positive,
    /// Higher is worse.
    Negative,
    /// Informational only; never scored.
    Neutral,
}

impl Direction {
    /// Converts a normalized value into a value where higher is always
    /// better. Returns `None` for neutral indicators.
    #[must_use]
    pub fn directed(self, normalized: f64) -> Option<f64> {
        match self {
            Self::Positive => Some(normalized),
            Self::Negative => Some(1.0 - normalized),
            Self::Neutral => None,
        }
    }
}

/// Algorithm used to map raw values onto the unit interval.
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
pub enum NormalizationMethod {
    /// Fractional rank with ties sharing their average rank.
    #[default]
    RankPercentile,
    /// Linear rescale between the observed minimum and maximum.
    MinMax,
    /// Standardized value passed through an S-curve.
    ZScore,
}

/// Population against which an area is ranked.
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
pub enum NormalizationScope {
    /// All areas nationwide.
    #[default]
    National,
    /// Areas of the same urbanity tier.
    StratifiedByUrbanity,
}

/// Measurement unit of an indicator's raw value.
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
pub enum Unit {
    /// Percentage of a population.
    Percent,
    /// Monetary amount per person or household.
    Currency,
    /// Rate per 1,000 residents.
    #[serde(rename = "per_1000")]
    #[strum(serialize = "per_1000")]
    Per1000,
    /// Rate per 100,000 residents.
    #[serde(rename = "per_100000")]
    #[strum(serialize = "per_100000")]
    Per100000,
    /// Generic rate.
    Rate,
    /// Dimensionless ratio.
    Ratio,
    /// Absolute count (people, facilities, incidents).
    Count,
    /// Points on an arbitrary scale.
    Points,
}

impl Unit {
    /// Whether values in this unit describe an intensity that does not
    /// divide with area. Rates are copied onto split areas; counts are
    /// apportioned.
    #[must_use]
    pub const fn is_rate(self) -> bool {
        matches!(
            self,
            Self::Percent
                | Self::Currency
                | Self::Per1000
                | Self::Per100000
                | Self::Rate
                | Self::Ratio
                | Self::Points
        )
    }
}

/// Configuration of one indicator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Indicator {
    /// Unique identifier (e.g. `"median_income"`).
    pub slug: String,
    /// Human-readable name.
    #[serde(default)]
    pub name: String,
    /// Whether higher raw values are good.
    pub direction: Direction,
    /// Contribution to the composite score. Zero excludes the indicator.
    #[serde(default)]
    pub weight: f64,
    /// Normalization algorithm.
    #[serde(default)]
    pub normalization: NormalizationMethod,
    /// Normalization population.
    #[serde(default)]
    pub scope: NormalizationScope,
    /// Unit of the raw value.
    pub unit: Unit,
    /// Inactive indicators are ignored by every stage.
    #[serde(default = "default_true")]
    pub active: bool,
    /// Grouping used for display and penalties.
    #[serde(default)]
    pub category: Option<String>,
}

const fn default_true() -> bool {
    true
}

impl Indicator {
    /// Whether this indicator contributes to the composite score.
    #[must_use]
    pub fn is_scored(&self) -> bool {
        self.active && self.weight > 0.0 && self.direction != Direction::Neutral
    }
}

/// One `(area, indicator, year)` observation.
///
/// The raw value is written by ingestion or disaggregation; the normalized
/// value is written only by normalization.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IndicatorValue {
    /// Fine area code.
    pub area_code: String,
    /// Indicator slug.
    pub indicator: String,
    /// Observation year.
    pub year: i32,
    /// Source value.
    pub raw_value: Option<f64>,
    /// Unit-interval value after normalization.
    pub normalized_value: Option<f64>,
}

impl IndicatorValue {
    /// Creates a row with a raw value and no normalized value.
    #[must_use]
    pub fn raw(
        area_code: impl Into<String>,
        indicator: impl Into<String>,
        year: i32,
        raw_value: f64,
    ) -> Self {
        Self {
            area_code: area_code.into(),
            indicator: indicator.into(),
            year,
            raw_value: Some(raw_value),
            normalized_value: None,
        }
    }
}

/// A point where a source redefined how a statistic is measured.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MethodologyBreak {
    /// Indicator slug.
    pub indicator: String,
    /// First year measured under the new methodology.
    pub year_affected: i32,
    /// Whether comparisons across this year are invalid.
    pub breaks_trend: bool,
    /// What changed.
    pub description: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn negative_direction_inverts() {
        let directed = Direction::Negative.directed(0.8).unwrap();
        assert!((directed - 0.2).abs() < 1e-12);
        assert_eq!(Direction::Positive.directed(0.8), Some(0.8));
        assert_eq!(Direction::Neutral.directed(0.8), None);
    }

    #[test]
    fn rate_units() {
        assert!(Unit::Percent.is_rate());
        assert!(Unit::Per100000.is_rate());
        assert!(Unit::Currency.is_rate());
        assert!(!Unit::Count.is_rate());
    }

    #[test]
    fn zero_weight_is_not_scored() {
        let mut indicator = Indicator {
            slug: "median_income".to_string(),
            name: "Median income".to_string(),
            direction: Direction::Positive,
            weight: 0.0,
            normalization: NormalizationMethod::RankPercentile,
            scope: NormalizationScope::National,
            unit: Unit::Currency,
            active: true,
            category: None,
        };
        assert!(!indicator.is_scored());

        indicator.weight = 0.1;
        assert!(indicator.is_scored());

        indicator.direction = Direction::Neutral;
        assert!(!indicator.is_scored());
    }

    #[test]
    fn method_parses_from_config_strings() {
        assert_eq!(
            "z_score".parse::<NormalizationMethod>().unwrap(),
            NormalizationMethod::ZScore
        );
        assert_eq!(
            "stratified_by_urbanity".parse::<NormalizationScope>().unwrap(),
            NormalizationScope::StratifiedByUrbanity
        );
        assert_eq!("per_100000".parse::<Unit>().unwrap(), Unit::Per100000);
    }
}
