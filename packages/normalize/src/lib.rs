#![cfg_attr(feature = "fail-on-warnings", deny(warnings))]
#![warn(clippy::all, clippy::pedantic, clippy::nursery, clippy::cargo)]
#![allow(clippy::multiple_crate_versions, clippy::cargo_common_metadata)]

//! Turns raw indicator values into comparable unit-interval scores.
//!
//! Each indicator is normalized per year with the method configured for it
//! (see [`methods`]). Indicators scoped `stratified_by_urbanity` always use
//! rank-percentile, ranked within each urbanity tier; tiers with fewer than
//! `normalization.min_stratum_size` observations, and areas without a tier,
//! keep the national ranking instead.
//!
//! Indicators only read and write their own rows, so
//! [`Normalizer::normalize_all`] runs them in parallel.

pub mod methods;
pub mod urbanity;

pub use urbanity::{classify_urbanity, tiers_by_code};

use std::collections::BTreeMap;

use area_score_config::PipelineConfig;
use area_score_geography_models::UrbanityTier;
use area_score_indicator_models::{
    Indicator, IndicatorValue, NormalizationMethod, NormalizationScope,
};
use rayon::prelude::*;

/// Errors raised by normalization.
#[derive(Debug, thiserror::Error)]
pub enum NormalizeError {
    /// The indicator has no raw values in the requested year.
    #[error("No raw values for indicator {indicator} in {year}")]
    NoData {
        /// Indicator slug.
        indicator: String,
        /// Requested year.
        year: i32,
    },
    /// No active indicator has raw values in the requested year.
    #[error("No raw values for any active indicator in {year}")]
    NothingToNormalize {
        /// Requested year.
        year: i32,
    },
}

/// Per-indicator outcome of [`Normalizer::normalize_all`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NormalizationSummary {
    /// Rows updated per indicator slug.
    pub updated: BTreeMap<String, usize>,
    /// Active indicators with no data in the year.
    pub skipped: Vec<String>,
}

impl NormalizationSummary {
    /// Total rows updated.
    #[must_use]
    pub fn total(&self) -> usize {
        self.updated.values().sum()
    }
}

/// Stratified indicators compare ranks across tiers, so only
/// rank-percentile keeps tiers on one scale.
const fn method_for(indicator: &Indicator) -> NormalizationMethod {
    match indicator.scope {
        NormalizationScope::StratifiedByUrbanity => NormalizationMethod::RankPercentile,
        NormalizationScope::National => indicator.normalization,
    }
}

/// Normalizes indicator values under one configuration snapshot.
pub struct Normalizer<'a> {
    config: &'a PipelineConfig,
}

impl<'a> Normalizer<'a> {
    /// Creates a normalizer.
    #[must_use]
    pub const fn new(config: &'a PipelineConfig) -> Self {
        Self { config }
    }

    /// Normalizes the rows of one indicator for one year in place.
    ///
    /// `values` must hold only rows of `indicator` for `year`. Rows without
    /// a finite raw value get no normalized value. Returns the number of
    /// rows given a normalized value.
    ///
    /// # Errors
    ///
    /// Returns [`NormalizeError::NoData`] if no row has a finite raw value.
    pub fn normalize(
        &self,
        indicator: &Indicator,
        year: i32,
        values: &mut [IndicatorValue],
        tiers: &BTreeMap<String, UrbanityTier>,
    ) -> Result<usize, NormalizeError> {
        let observed: Vec<usize> = values
            .iter()
            .enumerate()
            .filter(|(_, v)| v.raw_value.is_some_and(f64::is_finite))
            .map(|(i, _)| i)
            .collect();

        for value in values.iter_mut() {
            value.normalized_value = None;
        }

        if observed.is_empty() {
            return Err(NormalizeError::NoData {
                indicator: indicator.slug.clone(),
                year,
            });
        }

        let raw: Vec<f64> = observed
            .iter()
            .filter_map(|i| values[*i].raw_value)
            .collect();
        let method = method_for(indicator);
        let mut normalized = methods::apply(method, &raw);

        if indicator.scope == NormalizationScope::StratifiedByUrbanity {
            let codes: Vec<&str> = observed
                .iter()
                .map(|i| values[*i].area_code.as_str())
                .collect();
            self.stratify(indicator, &codes, &raw, &mut normalized, tiers);
        }

        for (i, n) in observed.iter().zip(normalized) {
            values[*i].normalized_value = Some(n);
        }

        log::debug!(
            "Normalized {} {year}: {} rows ({method}, {})",
            indicator.slug,
            observed.len(),
            indicator.scope
        );

        Ok(observed.len())
    }

    /// Replaces national ranks with within-tier ranks for every tier that
    /// is large enough.
    fn stratify(
        &self,
        indicator: &Indicator,
        codes: &[&str],
        raw: &[f64],
        normalized: &mut [f64],
        tiers: &BTreeMap<String, UrbanityTier>,
    ) {
        let mut members: BTreeMap<UrbanityTier, Vec<usize>> = BTreeMap::new();
        for (i, code) in codes.iter().enumerate() {
            if let Some(tier) = tiers.get(*code) {
                members.entry(*tier).or_default().push(i);
            }
        }

        for (tier, indices) in members {
            if indices.len() < self.config.normalization.min_stratum_size {
                log::debug!(
                    "{}: {tier} stratum has {} observations; using national ranking",
                    indicator.slug,
                    indices.len()
                );
                continue;
            }

            let stratum: Vec<f64> = indices.iter().map(|i| raw[*i]).collect();
            let within = methods::apply(NormalizationMethod::RankPercentile, &stratum);
            for (i, n) in indices.into_iter().zip(within) {
                normalized[i] = n;
            }
        }
    }

    /// Normalizes every active indicator for `year` in place.
    ///
    /// Rows of other years and of unknown or inactive indicators are left
    /// untouched. Rows are regrouped by indicator, so their order is not
    /// preserved. Indicators without data are reported in
    /// [`NormalizationSummary::skipped`].
    ///
    /// # Errors
    ///
    /// Returns [`NormalizeError::NothingToNormalize`] if no active indicator
    /// has data for `year`.
    pub fn normalize_all(
        &self,
        year: i32,
        values: &mut Vec<IndicatorValue>,
        tiers: &BTreeMap<String, UrbanityTier>,
    ) -> Result<NormalizationSummary, NormalizeError> {
        let mut partitions: BTreeMap<String, Vec<IndicatorValue>> = self
            .config
            .active_indicators()
            .map(|i| (i.slug.clone(), Vec::new()))
            .collect();
        let mut untouched = Vec::new();

        for value in values.drain(..) {
            match partitions.get_mut(&value.indicator) {
                Some(rows) if value.year == year => rows.push(value),
                _ => untouched.push(value),
            }
        }

        let outcomes: Vec<(String, Option<usize>)> = partitions
            .par_iter_mut()
            .filter_map(|(slug, rows)| {
                let indicator = self.config.indicator(slug)?;
                let outcome = self.normalize(indicator, year, rows, tiers).ok();
                Some((slug.clone(), outcome))
            })
            .collect();

        values.extend(untouched);
        values.extend(partitions.into_values().flatten());

        let mut summary = NormalizationSummary::default();
        for (slug, outcome) in outcomes {
            match outcome {
                Some(count) => {
                    summary.updated.insert(slug, count);
                }
                None => summary.skipped.push(slug),
            }
        }

        if summary.updated.is_empty() {
            return Err(NormalizeError::NothingToNormalize { year });
        }

        if !summary.skipped.is_empty() {
            log::warn!(
                "No {year} data for {} indicators: {}",
                summary.skipped.len(),
                summary.skipped.join(", ")
            );
        }
        log::info!(
            "Normalized {} rows across {} indicators for {year}",
            summary.total(),
            summary.updated.len()
        );

        Ok(summary)
    }
}
