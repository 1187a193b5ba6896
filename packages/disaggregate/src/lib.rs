#![cfg_attr(feature = "fail-on-warnings", deny(warnings))]
#![warn(clippy::all, clippy::pedantic, clippy::nursery, clippy::cargo)]
#![allow(clippy::multiple_crate_versions, clippy::cargo_common_metadata)]

//! District-to-area disaggregation.
//!
//! Crime and enforcement-debt statistics are published per municipality
//! (district). [`Disaggregator`] spreads a district's rate across its fine
//! areas in four steps:
//!
//! 1. a propensity weight per area from percentile-ranked demographic
//!    covariates plus a vulnerability bonus, floored at a small positive
//!    value;
//! 2. weights normalized within the district (equal split when the
//!    district has no usable covariate data);
//! 3. `rate × normalized_weight × n`, clamped to a band around the rate;
//! 4. one multiplicative rescale so the population-weighted mean of the
//!    estimates equals the district rate exactly.
//!
//! Districts share no state, so they are processed in parallel.

pub mod constraint;
pub mod validation;

use std::collections::BTreeMap;

use area_score_config::PropensityModel;
use area_score_config::progress::{StageProgress, WorkUnit};
use area_score_geography_models::{Area, VulnerabilityMapping, VulnerabilityTier};
use area_score_indicator_models::IndicatorValue;
use area_score_score_models::{DisaggregationResult, DistrictRate, ValidationReport};
use rayon::prelude::*;

use crate::constraint::{constrain_to_rate, initial_estimates};

/// Fewest districts a validation fit is computed over.
pub const MIN_VALIDATION_DISTRICTS: usize = 10;

/// Errors raised by a disaggregation run.
#[derive(Debug, thiserror::Error)]
pub enum DisaggregateError {
    /// No district rates exist for the target and year.
    #[error("No district rates for {target} in {year}")]
    NoData {
        /// Target indicator.
        target: String,
        /// Requested year.
        year: i32,
    },
    /// District rates exist but none of the districts has fine areas.
    #[error("No fine areas found for any of the {districts} districts with {target} rates")]
    NoMatchingAreas {
        /// Target indicator.
        target: String,
        /// Number of districts with rates.
        districts: usize,
    },
}

/// One fine area as seen by the model.
#[derive(Debug, Clone, PartialEq)]
pub struct FineArea {
    /// Area code.
    pub code: String,
    /// Resident population.
    pub population: Option<u64>,
    /// Covariate percentiles keyed by indicator slug.
    pub percentiles: BTreeMap<String, f64>,
    /// Most severe vulnerability tier the area belongs to.
    pub vulnerability: Option<VulnerabilityTier>,
}

impl FineArea {
    /// Creates an area with no covariate data.
    #[must_use]
    pub fn new(code: impl Into<String>, population: Option<u64>) -> Self {
        Self {
            code: code.into(),
            population,
            percentiles: BTreeMap::new(),
            vulnerability: None,
        }
    }
}

/// Applies one [`PropensityModel`].
pub struct Disaggregator<'a> {
    model: &'a PropensityModel,
}

impl<'a> Disaggregator<'a> {
    /// Creates a disaggregator for `model`.
    #[must_use]
    pub const fn new(model: &'a PropensityModel) -> Self {
        Self { model }
    }

    /// The model in use.
    #[must_use]
    pub const fn model(&self) -> &PropensityModel {
        self.model
    }

    fn has_covariates(&self, area: &FineArea) -> bool {
        self.model
            .covariates
            .iter()
            .any(|c| area.percentiles.contains_key(&c.indicator))
    }

    /// Propensity weight of one area, before normalization.
    ///
    /// Covariates only contribute when the area has data for at least one
    /// of them; individually missing covariates use the model's default
    /// percentile.
    #[must_use]
    pub fn propensity_weight(&self, area: &FineArea) -> f64 {
        let mut weight = self.model.base_weight;

        if self.has_covariates(area) {
            for covariate in &self.model.covariates {
                let percentile = area
                    .percentiles
                    .get(&covariate.indicator)
                    .copied()
                    .unwrap_or(self.model.default_percentile);
                weight += covariate
                    .orientation
                    .contribution(percentile, covariate.coefficient);
            }
        }

        weight += self.model.vulnerability_adjustment(area.vulnerability);

        weight.max(self.model.weight_floor)
    }

    /// Disaggregates one district. Returns no rows when the district has no
    /// areas or its rate is unusable.
    #[must_use]
    pub fn estimate_district(
        &self,
        district: &DistrictRate,
        areas: &[FineArea],
    ) -> Vec<DisaggregationResult> {
        if areas.is_empty() {
            return Vec::new();
        }
        if !is_usable_rate(district.rate) {
            log::warn!(
                "District {} has unusable rate {}; skipped",
                district.district_code,
                district.rate
            );
            return Vec::new();
        }

        let weights: Vec<f64> = areas.iter().map(|a| self.propensity_weight(a)).collect();
        let total: f64 = weights.iter().sum();
        let usable = self.model.covariates.is_empty() || areas.iter().any(|a| self.has_covariates(a));

        #[allow(clippy::cast_precision_loss)]
        let n = areas.len() as f64;
        let normalized: Vec<f64> = if usable && total > 0.0 {
            weights.iter().map(|w| w / total).collect()
        } else {
            log::debug!(
                "District {} has no usable covariate data; splitting equally",
                district.district_code
            );
            vec![1.0 / n; areas.len()]
        };

        #[allow(clippy::cast_precision_loss)]
        let populations: Vec<f64> = areas
            .iter()
            .map(|a| a.population.unwrap_or(self.model.fallback_population) as f64)
            .collect();

        let mut primary = initial_estimates(
            district.rate,
            &normalized,
            self.model.min_scale,
            self.model.max_scale,
        );
        let constrained = constrain_to_rate(&mut primary, &populations, district.rate);
        if !constrained {
            log::warn!(
                "District {} could not be constrained to its rate",
                district.district_code
            );
        }

        let secondary = district
            .secondary_rate
            .filter(|r| is_usable_rate(*r))
            .map(|rate| {
                let mut estimates =
                    initial_estimates(rate, &normalized, self.model.min_scale, self.model.max_scale);
                constrain_to_rate(&mut estimates, &populations, rate);
                estimates
            });

        areas
            .iter()
            .enumerate()
            .map(|(i, area)| DisaggregationResult {
                area_code: area.code.clone(),
                district_code: district.district_code.clone(),
                year: district.year,
                target: self.model.target_indicator.clone(),
                estimated_rate: primary[i],
                estimated_secondary_rate: secondary.as_ref().map(|s| s[i]),
                propensity_weight: weights[i],
                normalized_weight: normalized[i],
                is_constrained: constrained,
                model_version: self.model.model_version.clone(),
            })
            .collect()
    }

    /// Disaggregates every district rate in parallel.
    ///
    /// Rates for districts without fine areas are skipped with a warning.
    ///
    /// # Errors
    ///
    /// * [`DisaggregateError::NoData`] if `rates` is empty.
    /// * [`DisaggregateError::NoMatchingAreas`] if no district has areas.
    pub fn disaggregate(
        &self,
        year: i32,
        rates: &[DistrictRate],
        areas_by_district: &BTreeMap<String, Vec<FineArea>>,
        progress: &dyn StageProgress,
    ) -> Result<Vec<DisaggregationResult>, DisaggregateError> {
        if rates.is_empty() {
            return Err(DisaggregateError::NoData {
                target: self.model.target_indicator.clone(),
                year,
            });
        }

        progress.start(rates.len() as u64, WorkUnit::Districts);

        let results: Vec<DisaggregationResult> = rates
            .par_iter()
            .flat_map_iter(|rate| {
                let rows = areas_by_district.get(&rate.district_code).map_or_else(
                    || {
                        log::warn!("No fine areas for district {}", rate.district_code);
                        Vec::new()
                    },
                    |areas| self.estimate_district(rate, areas),
                );
                progress.advance(1);
                rows
            })
            .collect();

        if results.is_empty() {
            return Err(DisaggregateError::NoMatchingAreas {
                target: self.model.target_indicator.clone(),
                districts: rates.len(),
            });
        }

        let districts = results
            .iter()
            .map(|r| r.district_code.as_str())
            .collect::<std::collections::BTreeSet<_>>()
            .len();
        progress.done(&format!(
            "{}: {districts} districts -> {} area estimates",
            self.model.target_indicator,
            results.len()
        ));
        log::info!(
            "Disaggregated {} ({}) for {year}: {districts} districts -> {} areas",
            self.model.target_indicator,
            self.model.model_version,
            results.len()
        );

        Ok(results)
    }

    /// Regresses each district's rate on the mean propensity weight of its
    /// areas and reports the fit.
    ///
    /// Diagnostic only. Districts with fewer than two areas are left out;
    /// with fewer than [`MIN_VALIDATION_DISTRICTS`] points no report is
    /// produced.
    #[must_use]
    pub fn validate(
        &self,
        year: i32,
        rates: &[DistrictRate],
        areas_by_district: &BTreeMap<String, Vec<FineArea>>,
    ) -> Option<ValidationReport> {
        let mut predicted = Vec::new();
        let mut actual = Vec::new();

        for rate in rates.iter().filter(|r| is_usable_rate(r.rate)) {
            let Some(areas) = areas_by_district.get(&rate.district_code) else {
                continue;
            };
            if areas.len() < 2 {
                continue;
            }

            #[allow(clippy::cast_precision_loss)]
            let mean_weight = areas.iter().map(|a| self.propensity_weight(a)).sum::<f64>()
                / areas.len() as f64;
            predicted.push(mean_weight);
            actual.push(rate.rate);
        }

        if predicted.len() < MIN_VALIDATION_DISTRICTS {
            log::warn!(
                "Too few districts ({}) to validate {}",
                predicted.len(),
                self.model.target_indicator
            );
            return None;
        }

        let fit = validation::linear_fit(&predicted, &actual)?;
        log::info!(
            "Validation {}: R² = {:.4}, RMSE = {:.4} ({} districts)",
            self.model.target_indicator,
            fit.r_squared,
            fit.rmse,
            predicted.len()
        );

        Some(ValidationReport {
            target: self.model.target_indicator.clone(),
            year,
            r_squared: fit.r_squared,
            rmse: fit.rmse,
            districts: predicted.len(),
        })
    }

    /// Converts results into raw indicator rows for the target indicator
    /// and, when configured, the secondary indicator.
    #[must_use]
    pub fn to_indicator_values(&self, results: &[DisaggregationResult]) -> Vec<IndicatorValue> {
        let mut values = Vec::with_capacity(results.len() * 2);

        for result in results {
            values.push(IndicatorValue::raw(
                &result.area_code,
                &self.model.target_indicator,
                result.year,
                result.estimated_rate,
            ));

            if let (Some(slug), Some(rate)) = (
                &self.model.secondary_indicator,
                result.estimated_secondary_rate,
            ) {
                values.push(IndicatorValue::raw(&result.area_code, slug, result.year, rate));
            }
        }

        values
    }
}

fn is_usable_rate(rate: f64) -> bool {
    rate.is_finite() && rate >= 0.0
}

/// Most severe vulnerability tier per area among mappings with at least
/// `min_overlap` overlap.
#[must_use]
pub fn strongest_vulnerability(
    mappings: &[VulnerabilityMapping],
    min_overlap: f64,
) -> BTreeMap<String, VulnerabilityTier> {
    let mut tiers: BTreeMap<String, VulnerabilityTier> = BTreeMap::new();

    for mapping in mappings.iter().filter(|m| m.overlap_fraction >= min_overlap) {
        tiers
            .entry(mapping.area_code.clone())
            .and_modify(|t| *t = (*t).max(mapping.tier))
            .or_insert(mapping.tier);
    }

    tiers
}

/// Covariate percentiles per area, taken from the normalized values of the
/// model's covariate indicators.
#[must_use]
pub fn covariate_percentiles(
    model: &PropensityModel,
    values: &[IndicatorValue],
) -> BTreeMap<String, BTreeMap<String, f64>> {
    let mut percentiles: BTreeMap<String, BTreeMap<String, f64>> = BTreeMap::new();

    for value in values {
        let Some(normalized) = value.normalized_value else {
            continue;
        };
        if model.covariates.iter().any(|c| c.indicator == value.indicator) {
            percentiles
                .entry(value.area_code.clone())
                .or_default()
                .insert(value.indicator.clone(), normalized);
        }
    }

    percentiles
}

/// Groups areas by district, attaching covariates and vulnerability tiers.
/// Areas without a district are left out.
#[must_use]
pub fn group_fine_areas(
    areas: &[Area],
    percentiles: &BTreeMap<String, BTreeMap<String, f64>>,
    vulnerability: &BTreeMap<String, VulnerabilityTier>,
) -> BTreeMap<String, Vec<FineArea>> {
    let mut grouped: BTreeMap<String, Vec<FineArea>> = BTreeMap::new();

    for area in areas {
        let Some(district) = &area.district_code else {
            continue;
        };

        grouped.entry(district.clone()).or_default().push(FineArea {
            code: area.code.clone(),
            population: area.population,
            percentiles: percentiles.get(&area.code).cloned().unwrap_or_default(),
            vulnerability: vulnerability.get(&area.code).copied(),
        });
    }

    grouped
}

#[cfg(test)]
mod tests {
    use area_score_config::progress::NullProgress;
    use area_score_config::{Covariate, CovariateOrientation, PipelineConfig};

    use super::*;
    use crate::constraint::weighted_mean;

    fn income_model() -> PropensityModel {
        PropensityModel {
            model_version: "test-v1".to_string(),
            target_indicator: "crime_total_rate".to_string(),
            secondary_indicator: None,
            base_weight: 0.2,
            weight_floor: 0.01,
            min_scale: 0.1,
            max_scale: 3.0,
            default_percentile: 0.5,
            fallback_population: 100,
            vulnerability_min_overlap: 0.25,
            vulnerability_bonus: 0.3,
            severe_vulnerability_bonus: 0.2,
            covariates: vec![Covariate {
                indicator: "median_income".to_string(),
                coefficient: 0.6,
                orientation: CovariateOrientation::LowIncreases,
            }],
        }
    }

    fn area(code: &str, population: u64, income_pct: f64) -> FineArea {
        let mut a = FineArea::new(code, Some(population));
        a.percentiles.insert("median_income".to_string(), income_pct);
        a
    }

    fn rate(district: &str, rate: f64) -> DistrictRate {
        DistrictRate {
            district_code: district.to_string(),
            year: 2024,
            rate,
            secondary_rate: None,
            population: None,
        }
    }

    #[test]
    fn two_area_district_scenario() {
        let model = income_model();
        let disaggregator = Disaggregator::new(&model);
        // weights 0.2 + 0.6 = 0.8 and 0.2 + 0 = 0.2
        let areas = vec![area("A", 100, 0.0), area("B", 300, 1.0)];

        let results = disaggregator.estimate_district(&rate("D", 10.0), &areas);
        assert_eq!(results.len(), 2);
        assert!((results[0].propensity_weight - 0.8).abs() < 1e-12);
        assert!((results[1].propensity_weight - 0.2).abs() < 1e-12);
        assert!((results[0].normalized_weight - 0.8).abs() < 1e-12);

        assert!((results[0].estimated_rate - 22.857_142_857).abs() < 1e-6);
        assert!((results[1].estimated_rate - 5.714_285_714).abs() < 1e-6);
        assert!(results.iter().all(|r| r.is_constrained));

        let mean = (results[0].estimated_rate * 100.0 + results[1].estimated_rate * 300.0) / 400.0;
        assert!((mean - 10.0).abs() < 1e-9);
    }

    #[test]
    fn population_weighted_mean_matches_district_rate() {
        let config = PipelineConfig::embedded().unwrap();
        let model = config.model("crime").unwrap();
        let disaggregator = Disaggregator::new(model);

        let mut areas = Vec::new();
        for i in 0..7_u32 {
            let mut a = FineArea::new(format!("A{i}"), Some(200 + u64::from(i) * 150));
            a.percentiles
                .insert("median_income".to_string(), f64::from(i) / 6.0);
            a.percentiles
                .insert("employment_rate".to_string(), 1.0 - f64::from(i) / 6.0);
            areas.push(a);
        }
        areas[3].vulnerability = Some(VulnerabilityTier::SeverelyVulnerable);
        areas[5].population = None;

        let results = disaggregator.estimate_district(&rate("D", 1234.5), &areas);
        let estimates: Vec<f64> = results.iter().map(|r| r.estimated_rate).collect();
        let populations: Vec<f64> = areas
            .iter()
            .map(|a| a.population.unwrap_or(100) as f64)
            .collect();

        let mean = weighted_mean(&estimates, &populations).unwrap();
        assert!(((mean - 1234.5) / 1234.5).abs() < 1e-6);
    }

    #[test]
    fn weight_never_below_floor() {
        let mut model = income_model();
        model.base_weight = -1.0;
        let disaggregator = Disaggregator::new(&model);
        let weight = disaggregator.propensity_weight(&area("A", 10, 1.0));
        assert!((weight - 0.01).abs() < f64::EPSILON);
    }

    #[test]
    fn severe_tier_adds_both_bonuses() {
        let model = income_model();
        let disaggregator = Disaggregator::new(&model);
        let mut a = area("A", 10, 1.0);
        a.vulnerability = Some(VulnerabilityTier::SeverelyVulnerable);
        assert!((disaggregator.propensity_weight(&a) - 0.7).abs() < 1e-12);

        a.vulnerability = Some(VulnerabilityTier::Vulnerable);
        assert!((disaggregator.propensity_weight(&a) - 0.5).abs() < 1e-12);
    }

    #[test]
    fn missing_covariates_use_default_percentile() {
        let config = PipelineConfig::embedded().unwrap();
        let model = config.model("crime").unwrap();
        let disaggregator = Disaggregator::new(model);

        let mut partial = FineArea::new("A", Some(10));
        partial
            .percentiles
            .insert("median_income".to_string(), 0.5);
        // 0.5 + 0.5 * (0.35 + 0.20 + 0.15)
        assert!((disaggregator.propensity_weight(&partial) - 0.85).abs() < 1e-12);

        // no data at all: covariates are not applied
        let bare = FineArea::new("B", Some(10));
        assert!((disaggregator.propensity_weight(&bare) - 0.5).abs() < 1e-12);
    }

    #[test]
    fn district_without_covariates_splits_equally() {
        let model = income_model();
        let disaggregator = Disaggregator::new(&model);
        let mut areas = vec![
            FineArea::new("A", Some(100)),
            FineArea::new("B", Some(100)),
            FineArea::new("C", Some(100)),
        ];
        areas[0].vulnerability = Some(VulnerabilityTier::Vulnerable);

        let results = disaggregator.estimate_district(&rate("D", 6.0), &areas);
        for result in &results {
            assert!((result.normalized_weight - 1.0 / 3.0).abs() < 1e-12);
            assert!((result.estimated_rate - 6.0).abs() < 1e-9);
        }
    }

    #[test]
    fn secondary_rate_constrained_separately() {
        let model = income_model();
        let disaggregator = Disaggregator::new(&model);
        let areas = vec![area("A", 100, 0.0), area("B", 300, 1.0)];
        let mut district = rate("D", 10.0);
        district.secondary_rate = Some(40.0);

        let results = disaggregator.estimate_district(&district, &areas);
        let secondary: Vec<f64> = results
            .iter()
            .map(|r| r.estimated_secondary_rate.unwrap())
            .collect();
        let mean = weighted_mean(&secondary, &[100.0, 300.0]).unwrap();
        assert!((mean - 40.0).abs() < 1e-9);
    }

    #[test]
    fn negative_rate_is_skipped() {
        let model = income_model();
        let disaggregator = Disaggregator::new(&model);
        let areas = vec![area("A", 100, 0.0)];
        assert!(
            disaggregator
                .estimate_district(&rate("D", -1.0), &areas)
                .is_empty()
        );
    }

    #[test]
    fn no_rates_is_a_batch_error() {
        let model = income_model();
        let disaggregator = Disaggregator::new(&model);
        let result = disaggregator.disaggregate(2024, &[], &BTreeMap::new(), &NullProgress);
        assert!(matches!(result, Err(DisaggregateError::NoData { .. })));

        let result = disaggregator.disaggregate(
            2024,
            &[rate("NOWHERE", 5.0)],
            &BTreeMap::new(),
            &NullProgress,
        );
        assert!(matches!(
            result,
            Err(DisaggregateError::NoMatchingAreas { .. })
        ));
    }

    #[test]
    fn disaggregates_all_districts() {
        let model = income_model();
        let disaggregator = Disaggregator::new(&model);
        let mut by_district = BTreeMap::new();
        by_district.insert(
            "D1".to_string(),
            vec![area("A", 100, 0.0), area("B", 300, 1.0)],
        );
        by_district.insert("D2".to_string(), vec![area("C", 50, 0.5)]);

        let results = disaggregator
            .disaggregate(
                2024,
                &[rate("D1", 10.0), rate("D2", 3.0), rate("D3", 1.0)],
                &by_district,
                &NullProgress,
            )
            .unwrap();
        assert_eq!(results.len(), 3);
        let c = results.iter().find(|r| r.area_code == "C").unwrap();
        assert!((c.estimated_rate - 3.0).abs() < 1e-9);
    }

    #[test]
    fn validation_needs_ten_districts() {
        let model = income_model();
        let disaggregator = Disaggregator::new(&model);

        let mut by_district = BTreeMap::new();
        let mut rates = Vec::new();
        for i in 0..12_u32 {
            let p = f64::from(i) / 11.0;
            let code = format!("D{i}");
            by_district.insert(
                code.clone(),
                vec![area("X", 100, p), area("Y", 100, p)],
            );
            // exactly linear in mean weight: 0.2 + 0.6 * (1 - p)
            rates.push(rate(&code, 10.0 * 0.6f64.mul_add(1.0 - p, 0.2)));
        }

        let report = disaggregator.validate(2024, &rates, &by_district).unwrap();
        assert_eq!(report.districts, 12);
        assert!((report.r_squared - 1.0).abs() < 1e-9);
        assert!(report.rmse < 1e-9);

        assert!(disaggregator.validate(2024, &rates[..9], &by_district).is_none());
    }

    #[test]
    fn most_severe_tier_wins_above_overlap() {
        let mappings = vec![
            VulnerabilityMapping {
                area_code: "A".to_string(),
                tier: VulnerabilityTier::Vulnerable,
                overlap_fraction: 0.9,
            },
            VulnerabilityMapping {
                area_code: "A".to_string(),
                tier: VulnerabilityTier::SeverelyVulnerable,
                overlap_fraction: 0.3,
            },
            VulnerabilityMapping {
                area_code: "B".to_string(),
                tier: VulnerabilityTier::SeverelyVulnerable,
                overlap_fraction: 0.1,
            },
        ];

        let tiers = strongest_vulnerability(&mappings, 0.25);
        assert_eq!(tiers.get("A"), Some(&VulnerabilityTier::SeverelyVulnerable));
        assert_eq!(tiers.get("B"), None);
    }

    #[test]
    fn writes_target_and_secondary_values() {
        let mut model = income_model();
        model.secondary_indicator = Some("eviction_rate".to_string());
        let disaggregator = Disaggregator::new(&model);
        let areas = vec![area("A", 100, 0.0), area("B", 300, 1.0)];
        let mut district = rate("D", 10.0);
        district.secondary_rate = Some(40.0);

        let results = disaggregator.estimate_district(&district, &areas);
        let values = disaggregator.to_indicator_values(&results);
        assert_eq!(values.len(), 4);
        assert!(values.iter().any(|v| v.indicator == "eviction_rate"));
        assert!(values.iter().all(|v| v.normalized_value.is_none()));
    }

    #[test]
    fn groups_areas_with_covariates() {
        let mut a = Area::new("A");
        a.district_code = Some("D".to_string());
        let orphan = Area::new("O");

        let model = income_model();
        let mut value = IndicatorValue::raw("A", "median_income", 2024, 300_000.0);
        value.normalized_value = Some(0.25);
        let ignored = {
            let mut v = IndicatorValue::raw("A", "foreign_background_pct", 2024, 12.0);
            v.normalized_value = Some(0.9);
            v
        };
        let percentiles = covariate_percentiles(&model, &[value, ignored]);

        let grouped = group_fine_areas(&[a, orphan], &percentiles, &BTreeMap::new());
        assert_eq!(grouped.len(), 1);
        let fine = &grouped["D"][0];
        assert_eq!(fine.percentiles.len(), 1);
        assert!((fine.percentiles["median_income"] - 0.25).abs() < f64::EPSILON);
    }
}
