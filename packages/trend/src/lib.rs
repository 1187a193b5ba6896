#![cfg_attr(feature = "fail-on-warnings", deny(warnings))]
#![warn(clippy::all, clippy::pedantic, clippy::nursery, clippy::cargo)]
#![allow(clippy::multiple_crate_versions, clippy::cargo_common_metadata)]

//! Per-area indicator trends over a year window.
//!
//! A trend compares an area's raw value in the base year with its value in
//! the end year. Indicators with a trend-breaking methodology change inside
//! the window are refused outright, and areas whose boundaries changed are
//! never given a trend.

use std::collections::{BTreeMap, BTreeSet};

use area_score_config::PipelineConfig;
use area_score_indicator_models::{Direction, Indicator, IndicatorValue, MethodologyBreak};
use area_score_score_models::{IndicatorTrend, TrendDirection};

/// Errors raised by trend computation.
#[derive(Debug, thiserror::Error)]
pub enum TrendError {
    /// The indicator was redefined inside the window.
    #[error("Methodology break for {indicator} in {year} lies within {base_year}-{end_year}")]
    MethodologyBreak {
        /// Indicator slug.
        indicator: String,
        /// Year the new methodology took effect.
        year: i32,
        /// Window start.
        base_year: i32,
        /// Window end.
        end_year: i32,
    },
    /// The window ends before it starts.
    #[error("Invalid trend window {base_year}-{end_year}")]
    InvalidWindow {
        /// Window start.
        base_year: i32,
        /// Window end.
        end_year: i32,
    },
}

/// Outcome of [`TrendComputer::compute_all`].
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TrendSummary {
    /// Computed trends.
    pub trends: Vec<IndicatorTrend>,
    /// Indicators refused because of a methodology break.
    pub broken: Vec<String>,
    /// Indicators processed without a break.
    pub indicators: usize,
}

/// Computes trends under one configuration snapshot.
pub struct TrendComputer<'a> {
    config: &'a PipelineConfig,
    breaks: &'a [MethodologyBreak],
}

impl<'a> TrendComputer<'a> {
    /// Creates a computer aware of the given methodology breaks.
    #[must_use]
    pub const fn new(config: &'a PipelineConfig, breaks: &'a [MethodologyBreak]) -> Self {
        Self { config, breaks }
    }

    /// The first trend-breaking change to `indicator` inside the window.
    #[must_use]
    pub fn break_within(&self, indicator: &str, base_year: i32, end_year: i32) -> Option<&MethodologyBreak> {
        self.breaks.iter().find(|b| {
            b.indicator == indicator
                && b.breaks_trend
                && (base_year..=end_year).contains(&b.year_affected)
        })
    }

    /// Computes the trend of one indicator for every eligible area with
    /// data in the window.
    ///
    /// `values` may hold rows of any indicator and year; only rows of
    /// `indicator` inside `[base_year, end_year]` are read. Areas listed in
    /// `ineligible` are skipped. Neutral indicators yield no trends.
    ///
    /// # Errors
    ///
    /// * [`TrendError::InvalidWindow`] if `end_year < base_year`.
    /// * [`TrendError::MethodologyBreak`] if a trend-breaking change lies
    ///   inside the window.
    pub fn compute_trend(
        &self,
        indicator: &Indicator,
        base_year: i32,
        end_year: i32,
        values: &[IndicatorValue],
        ineligible: &BTreeSet<String>,
    ) -> Result<Vec<IndicatorTrend>, TrendError> {
        if end_year < base_year {
            return Err(TrendError::InvalidWindow { base_year, end_year });
        }
        if let Some(change) = self.break_within(&indicator.slug, base_year, end_year) {
            return Err(TrendError::MethodologyBreak {
                indicator: indicator.slug.clone(),
                year: change.year_affected,
                base_year,
                end_year,
            });
        }
        if indicator.direction == Direction::Neutral {
            log::debug!("Skipping trend for neutral indicator {}", indicator.slug);
            return Ok(Vec::new());
        }

        let mut by_area: BTreeMap<&str, BTreeMap<i32, f64>> = BTreeMap::new();
        for value in values {
            if value.indicator != indicator.slug || !(base_year..=end_year).contains(&value.year) {
                continue;
            }
            let Some(raw) = value.raw_value.filter(|r| r.is_finite()) else {
                continue;
            };
            if ineligible.contains(&value.area_code) {
                continue;
            }
            by_area
                .entry(value.area_code.as_str())
                .or_default()
                .insert(value.year, raw);
        }

        let expected = f64::from(end_year - base_year + 1);
        let stable_threshold = self.config.trend.stable_threshold_pct;

        let trends: Vec<IndicatorTrend> = by_area
            .into_iter()
            .map(|(area_code, series)| {
                #[allow(clippy::cast_possible_truncation)]
                let data_points = series.len() as u32;
                let absolute_change = match (series.get(&base_year), series.get(&end_year)) {
                    (Some(base), Some(end)) => Some(end - base),
                    _ => None,
                };
                let percent_change = absolute_change.and_then(|change| {
                    let base = series.get(&base_year).copied().unwrap_or(0.0);
                    (base != 0.0).then(|| change / base.abs() * 100.0)
                });

                IndicatorTrend {
                    area_code: area_code.to_string(),
                    indicator: indicator.slug.clone(),
                    base_year,
                    end_year,
                    data_points,
                    absolute_change,
                    percent_change,
                    direction: classify(percent_change, data_points, stable_threshold),
                    confidence: (f64::from(data_points) / expected).min(1.0),
                }
            })
            .collect();

        log::debug!(
            "{}: {} trends for {base_year}-{end_year}",
            indicator.slug,
            trends.len()
        );

        Ok(trends)
    }

    /// Computes trends for every scored indicator. Indicators with a
    /// methodology break in the window are reported, not computed.
    ///
    /// # Errors
    ///
    /// Returns [`TrendError::InvalidWindow`] if `end_year < base_year`.
    pub fn compute_all(
        &self,
        base_year: i32,
        end_year: i32,
        values: &[IndicatorValue],
        ineligible: &BTreeSet<String>,
    ) -> Result<TrendSummary, TrendError> {
        let mut summary = TrendSummary::default();

        for indicator in self.config.scored_indicators() {
            match self.compute_trend(indicator, base_year, end_year, values, ineligible) {
                Ok(trends) => {
                    summary.indicators += 1;
                    summary.trends.extend(trends);
                }
                Err(TrendError::MethodologyBreak { indicator, year, .. }) => {
                    log::warn!(
                        "Skipping trend for {indicator}: methodology break in {year} within {base_year}-{end_year}"
                    );
                    summary.broken.push(indicator);
                }
                Err(e) => return Err(e),
            }
        }

        log::info!(
            "Computed {} trends over {} indicators for {base_year}-{end_year} ({} refused)",
            summary.trends.len(),
            summary.indicators,
            summary.broken.len()
        );

        Ok(summary)
    }
}

/// Direction of a trend from its percent change and data coverage.
#[must_use]
pub fn classify(percent_change: Option<f64>, data_points: u32, stable_threshold_pct: f64) -> TrendDirection {
    let Some(percent) = percent_change else {
        return TrendDirection::Insufficient;
    };
    if data_points < 2 {
        return TrendDirection::Insufficient;
    }
    if percent.abs() <= stable_threshold_pct {
        TrendDirection::Stable
    } else if percent > 0.0 {
        TrendDirection::Rising
    } else {
        TrendDirection::Falling
    }
}
