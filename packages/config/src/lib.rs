#![cfg_attr(feature = "fail-on-warnings", deny(warnings))]
#![warn(clippy::all, clippy::pedantic, clippy::nursery, clippy::cargo)]
#![allow(clippy::multiple_crate_versions, clippy::cargo_common_metadata)]

//! Pipeline configuration snapshot.
//!
//! The whole pipeline is driven by one TOML document: indicator weights and
//! normalization settings, smoothing presets, disaggregation models, score
//! penalties, and the handful of thresholds each stage needs. A default
//! document is embedded at compile time via [`include_str!`]; a different
//! one can be pinned with [`PipelineConfig::load`].
//!
//! The loaded [`PipelineConfig`] is never mutated. Each stage receives it
//! by reference, and its [`PipelineConfig::fingerprint`] (SHA-256 of the
//! source text) is stored with every score run so results can be traced
//! back to the exact configuration that produced them.

pub mod progress;

use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;

use area_score_geography_models::VulnerabilityTier;
use area_score_indicator_models::{Indicator, NormalizationMethod, NormalizationScope};
use area_score_score_models::SmoothingConfig;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Configuration shipped with the binary.
pub const DEFAULT_CONFIG_TOML: &str = include_str!("../default.toml");

/// Errors raised while loading or validating a configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// The configuration file could not be read.
    #[error("Failed to read config: {0}")]
    Io(#[from] std::io::Error),
    /// The configuration is not valid TOML for [`PipelineConfig`].
    #[error("Failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),
    /// The configuration parsed but is internally inconsistent.
    #[error("Invalid config: {0}")]
    Invalid(String),
    /// A smoothing preset name was not found.
    #[error("Unknown smoothing preset: {0}")]
    UnknownPreset(String),
    /// A disaggregation model name was not found.
    #[error("Unknown disaggregation model: {0}")]
    UnknownModel(String),
}

/// `[crosswalk]` section.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CrosswalkSettings {
    /// Overlap fraction a polygon intersection must exceed to be kept as a
    /// mapping row.
    pub min_overlap: f64,
    /// Allowed deviation of an old code's overlap sum from 1.0.
    pub overlap_sum_tolerance: f64,
}

/// `[normalization]` section.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NormalizationSettings {
    /// Smallest urbanity stratum that is ranked on its own.
    pub min_stratum_size: usize,
}

/// `[trend]` section.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrendSettings {
    /// Absolute percent change at or below which a trend is stable.
    pub stable_threshold_pct: f64,
    /// Confidence below which a trend is not shown.
    pub min_confidence: f64,
}

/// How a penalty value is turned into score points.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PenaltyKind {
    /// The value is added to the score as-is.
    Absolute,
    /// The value is a percentage of the pre-penalty score.
    Percentage,
}

impl PenaltyKind {
    /// Score points deducted (negative) for a given pre-penalty score.
    #[must_use]
    pub fn amount(self, value: f64, raw_score: f64) -> f64 {
        match self {
            Self::Absolute => value,
            Self::Percentage => raw_score * value / 100.0,
        }
    }
}

/// A score penalty triggered by a vulnerability classification.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Penalty {
    /// Unique identifier.
    pub slug: String,
    /// Only the most negative applicable penalty per category is applied.
    pub category: String,
    /// Vulnerability tier that triggers the penalty.
    pub tier: VulnerabilityTier,
    /// Absolute or percentage.
    pub kind: PenaltyKind,
    /// Penalty value (negative for deductions).
    pub value: f64,
    /// Minimum overlap between the area and the vulnerability area.
    #[serde(default = "default_penalty_min_overlap")]
    pub min_overlap: f64,
    /// Inactive penalties are ignored.
    #[serde(default = "default_true")]
    pub active: bool,
}

const fn default_penalty_min_overlap() -> f64 {
    0.10
}

const fn default_true() -> bool {
    true
}

/// `[scoring]` section.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScoringSettings {
    /// Directed value at or above which an indicator is a top positive.
    pub top_positive_threshold: f64,
    /// Directed value at or below which an indicator is a top negative.
    pub top_negative_threshold: f64,
    /// Score movement above which an area is listed in a drift report.
    pub drift_threshold: f64,
    /// Configured penalties.
    #[serde(default)]
    pub penalties: Vec<Penalty>,
}

impl ScoringSettings {
    /// Penalties that are switched on.
    pub fn active_penalties(&self) -> impl Iterator<Item = &Penalty> {
        self.penalties.iter().filter(|p| p.active)
    }
}

/// `[grid]` section.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GridSettings {
    /// Base H3 resolution areas are projected onto.
    pub resolution: u8,
    /// Coarser resolutions derived by parent rollup.
    pub rollup_resolutions: Vec<u8>,
    /// Smoothing preset used when none is requested.
    pub default_smoothing: String,
}

/// Whether low or high covariate percentiles raise the propensity weight.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CovariateOrientation {
    /// Contribution is `(1 - percentile) * coefficient`.
    LowIncreases,
    /// Contribution is `percentile * coefficient`.
    HighIncreases,
}

impl CovariateOrientation {
    /// Contribution of one covariate to the propensity weight.
    #[must_use]
    pub fn contribution(self, percentile: f64, coefficient: f64) -> f64 {
        match self {
            Self::LowIncreases => (1.0 - percentile) * coefficient,
            Self::HighIncreases => percentile * coefficient,
        }
    }
}

/// One demographic input to a propensity model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Covariate {
    /// Indicator slug whose normalized value is the percentile.
    pub indicator: String,
    /// Weight of the covariate.
    pub coefficient: f64,
    /// Direction of influence.
    pub orientation: CovariateOrientation,
}

/// A transparent weighted-feature model for spreading district rates.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PropensityModel {
    /// Version tag stored with every result.
    pub model_version: String,
    /// Indicator that receives the disaggregated rate.
    pub target_indicator: String,
    /// Indicator that receives the secondary rate, if any.
    #[serde(default)]
    pub secondary_indicator: Option<String>,
    /// Starting weight before covariates.
    pub base_weight: f64,
    /// Minimum weight any area can receive.
    pub weight_floor: f64,
    /// Lower clamp on `estimate / district_rate`.
    pub min_scale: f64,
    /// Upper clamp on `estimate / district_rate`.
    pub max_scale: f64,
    /// Percentile substituted for a missing covariate.
    pub default_percentile: f64,
    /// Population assumed for areas without one in the constraint step.
    pub fallback_population: u64,
    /// Overlap a vulnerability mapping needs to count.
    pub vulnerability_min_overlap: f64,
    /// Added for any vulnerability classification.
    pub vulnerability_bonus: f64,
    /// Added on top of the bonus for the severe tier.
    pub severe_vulnerability_bonus: f64,
    /// Demographic inputs.
    #[serde(default)]
    pub covariates: Vec<Covariate>,
}

impl PropensityModel {
    /// Total bonus for an area's most severe vulnerability tier.
    #[must_use]
    pub fn vulnerability_adjustment(&self, tier: Option<VulnerabilityTier>) -> f64 {
        match tier {
            None => 0.0,
            Some(VulnerabilityTier::Vulnerable) => self.vulnerability_bonus,
            Some(VulnerabilityTier::SeverelyVulnerable) => {
                self.vulnerability_bonus + self.severe_vulnerability_bonus
            }
        }
    }
}

/// `[disaggregation]` section.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DisaggregationSettings {
    /// Named models (e.g. `crime`, `debt`).
    #[serde(default)]
    pub models: BTreeMap<String, PropensityModel>,
}

/// Immutable configuration for one pipeline run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// Crosswalk thresholds.
    pub crosswalk: CrosswalkSettings,
    /// Normalization thresholds.
    pub normalization: NormalizationSettings,
    /// Trend thresholds.
    pub trend: TrendSettings,
    /// Scoring thresholds and penalties.
    pub scoring: ScoringSettings,
    /// Grid resolutions.
    pub grid: GridSettings,
    /// Named smoothing presets.
    #[serde(default)]
    pub smoothing: Vec<SmoothingConfig>,
    /// Disaggregation models.
    #[serde(default)]
    pub disaggregation: DisaggregationSettings,
    /// Indicator definitions.
    #[serde(default)]
    pub indicators: Vec<Indicator>,
    #[serde(skip)]
    fingerprint: String,
}

impl PipelineConfig {
    /// Parses and validates a configuration document.
    ///
    /// # Errors
    ///
    /// Returns an error if the document is not valid TOML, does not match
    /// the expected shape, or fails validation.
    pub fn from_toml_str(source: &str) -> Result<Self, ConfigError> {
        let mut config: Self = toml::de::from_str(source)?;
        config.fingerprint = hex::encode(Sha256::digest(source.as_bytes()));
        config.validate()?;
        Ok(config)
    }

    /// Loads the configuration at `path`, or the embedded default when no
    /// path is given.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or the configuration is
    /// invalid.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let config = match path {
            Some(path) => {
                let source = std::fs::read_to_string(path)?;
                let config = Self::from_toml_str(&source)?;
                log::info!(
                    "Loaded config from {} (fingerprint {})",
                    path.display(),
                    config.short_fingerprint()
                );
                config
            }
            None => {
                let config = Self::embedded()?;
                log::info!(
                    "Using embedded default config (fingerprint {})",
                    config.short_fingerprint()
                );
                config
            }
        };

        Ok(config)
    }

    /// Parses the embedded default configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if the embedded document is invalid.
    pub fn embedded() -> Result<Self, ConfigError> {
        Self::from_toml_str(DEFAULT_CONFIG_TOML)
    }

    /// Hex-encoded SHA-256 of the source document.
    #[must_use]
    pub fn fingerprint(&self) -> &str {
        &self.fingerprint
    }

    /// First 12 characters of the fingerprint, for log lines.
    #[must_use]
    pub fn short_fingerprint(&self) -> &str {
        self.fingerprint.get(..12).unwrap_or(&self.fingerprint)
    }

    /// Looks up an indicator by slug.
    #[must_use]
    pub fn indicator(&self, slug: &str) -> Option<&Indicator> {
        self.indicators.iter().find(|i| i.slug == slug)
    }

    /// Indicators that are switched on, including neutral ones.
    pub fn active_indicators(&self) -> impl Iterator<Item = &Indicator> {
        self.indicators.iter().filter(|i| i.active)
    }

    /// Indicators that contribute to the composite score.
    pub fn scored_indicators(&self) -> impl Iterator<Item = &Indicator> {
        self.indicators.iter().filter(|i| i.is_scored())
    }

    /// Looks up a smoothing preset by name.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::UnknownPreset`] if no preset has that name.
    pub fn smoothing_preset(&self, name: &str) -> Result<&SmoothingConfig, ConfigError> {
        self.smoothing
            .iter()
            .find(|s| s.name == name)
            .ok_or_else(|| ConfigError::UnknownPreset(name.to_string()))
    }

    /// The preset named by `grid.default_smoothing`.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::UnknownPreset`] if the default is missing.
    pub fn default_smoothing(&self) -> Result<&SmoothingConfig, ConfigError> {
        self.smoothing_preset(&self.grid.default_smoothing)
    }

    /// Looks up a disaggregation model by name.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::UnknownModel`] if no model has that name.
    pub fn model(&self, name: &str) -> Result<&PropensityModel, ConfigError> {
        self.disaggregation
            .models
            .get(name)
            .ok_or_else(|| ConfigError::UnknownModel(name.to_string()))
    }

    fn validate(&self) -> Result<(), ConfigError> {
        let mut slugs = BTreeSet::new();
        for indicator in &self.indicators {
            if !slugs.insert(indicator.slug.as_str()) {
                return Err(ConfigError::Invalid(format!(
                    "duplicate indicator slug '{}'",
                    indicator.slug
                )));
            }
            if !indicator.weight.is_finite() || indicator.weight < 0.0 {
                return Err(ConfigError::Invalid(format!(
                    "indicator '{}' has invalid weight {}",
                    indicator.slug, indicator.weight
                )));
            }
            if indicator.scope == NormalizationScope::StratifiedByUrbanity
                && indicator.normalization != NormalizationMethod::RankPercentile
            {
                return Err(ConfigError::Invalid(format!(
                    "indicator '{}' is stratified by urbanity, which ranks by percentile, \
                     but asks for {} normalization",
                    indicator.slug, indicator.normalization
                )));
            }
        }

        let mut presets = BTreeSet::new();
        for preset in &self.smoothing {
            if !presets.insert(preset.name.as_str()) {
                return Err(ConfigError::Invalid(format!(
                    "duplicate smoothing preset '{}'",
                    preset.name
                )));
            }
            if !(0.0..=1.0).contains(&preset.self_weight)
                || !(0.0..=1.0).contains(&preset.neighbor_weight)
            {
                return Err(ConfigError::Invalid(format!(
                    "smoothing preset '{}' weights must be within [0, 1]",
                    preset.name
                )));
            }
            if !preset.is_energy_preserving() {
                log::warn!(
                    "Smoothing preset '{}' weights sum to {:.3}, not 1.0",
                    preset.name,
                    preset.self_weight + preset.neighbor_weight
                );
            }
        }
        self.default_smoothing()?;

        if self.grid.resolution > 15 {
            return Err(ConfigError::Invalid(format!(
                "grid resolution {} is above 15",
                self.grid.resolution
            )));
        }
        if let Some(bad) = self
            .grid
            .rollup_resolutions
            .iter()
            .find(|r| **r >= self.grid.resolution)
        {
            return Err(ConfigError::Invalid(format!(
                "rollup resolution {bad} must be coarser than base resolution {}",
                self.grid.resolution
            )));
        }

        for (name, model) in &self.disaggregation.models {
            if model.weight_floor <= 0.0 {
                return Err(ConfigError::Invalid(format!(
                    "model '{name}' weight_floor must be positive"
                )));
            }
            if model.min_scale > model.max_scale {
                return Err(ConfigError::Invalid(format!(
                    "model '{name}' min_scale exceeds max_scale"
                )));
            }
        }

        if self.scoring.top_negative_threshold > self.scoring.top_positive_threshold {
            return Err(ConfigError::Invalid(
                "top_negative_threshold exceeds top_positive_threshold".to_string(),
            ));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use area_score_indicator_models::Direction;
    use area_score_score_models::DecayFunction;

    use super::*;

    #[test]
    fn embedded_config_loads() {
        let config = PipelineConfig::embedded().unwrap();
        assert_eq!(config.normalization.min_stratum_size, 30);
        assert_eq!(config.grid.resolution, 8);
        assert_eq!(config.grid.rollup_resolutions, vec![5, 6, 7]);
        assert!((config.crosswalk.min_overlap - 0.01).abs() < f64::EPSILON);
        assert_eq!(config.fingerprint().len(), 64);
    }

    #[test]
    fn four_smoothing_presets() {
        let config = PipelineConfig::embedded().unwrap();
        let names: Vec<&str> = config.smoothing.iter().map(|s| s.name.as_str()).collect();
        assert_eq!(names, vec!["none", "light", "medium", "strong"]);

        assert!(config.smoothing_preset("none").unwrap().is_identity());
        assert_eq!(config.default_smoothing().unwrap().name, "light");

        let strong = config.smoothing_preset("strong").unwrap();
        assert_eq!(strong.k_rings, 2);
        assert_eq!(strong.decay, DecayFunction::Gaussian);

        for preset in &config.smoothing {
            assert!(preset.is_energy_preserving(), "{}", preset.name);
        }
    }

    #[test]
    fn unknown_preset_is_an_error() {
        let config = PipelineConfig::embedded().unwrap();
        assert!(matches!(
            config.smoothing_preset("extreme"),
            Err(ConfigError::UnknownPreset(_))
        ));
    }

    #[test]
    fn neutral_indicators_are_not_scored() {
        let config = PipelineConfig::embedded().unwrap();
        let population = config.indicator("population").unwrap();
        assert_eq!(population.direction, Direction::Neutral);
        assert!(config.scored_indicators().all(|i| i.slug != "population"));
        assert!(config.active_indicators().any(|i| i.slug == "population"));

        let merit = config.indicator("school_merit_value_avg").unwrap();
        assert_eq!(merit.scope, NormalizationScope::StratifiedByUrbanity);
    }

    #[test]
    fn crime_and_debt_models() {
        let config = PipelineConfig::embedded().unwrap();

        let crime = config.model("crime").unwrap();
        assert_eq!(crime.covariates.len(), 3);
        assert!((crime.base_weight - 0.5).abs() < f64::EPSILON);
        let severe = crime.vulnerability_adjustment(Some(VulnerabilityTier::SeverelyVulnerable));
        assert!((severe - 0.5).abs() < 1e-12);

        let debt = config.model("debt").unwrap();
        assert_eq!(debt.secondary_indicator.as_deref(), Some("eviction_rate"));
        assert!(
            debt.covariates
                .iter()
                .any(|c| c.orientation == CovariateOrientation::HighIncreases)
        );

        assert!(matches!(
            config.model("housing"),
            Err(ConfigError::UnknownModel(_))
        ));
    }

    #[test]
    fn covariate_contributions() {
        let low = CovariateOrientation::LowIncreases.contribution(0.2, 0.35);
        assert!((low - 0.28).abs() < 1e-12);
        let high = CovariateOrientation::HighIncreases.contribution(0.2, 0.15);
        assert!((high - 0.03).abs() < 1e-12);
    }

    #[test]
    fn percentage_penalty_scales_with_score() {
        assert!((PenaltyKind::Percentage.amount(-10.0, 80.0) + 8.0).abs() < 1e-12);
        assert!((PenaltyKind::Absolute.amount(-15.0, 80.0) + 15.0).abs() < 1e-12);
    }

    #[test]
    fn duplicate_slugs_rejected() {
        let source = DEFAULT_CONFIG_TOML.to_string()
            + r#"
[[indicators]]
slug = "median_income"
direction = "positive"
weight = 0.1
unit = "currency"
"#;
        assert!(matches!(
            PipelineConfig::from_toml_str(&source),
            Err(ConfigError::Invalid(_))
        ));
    }

    #[test]
    fn stratified_indicators_must_rank_by_percentile() {
        let source = DEFAULT_CONFIG_TOML.replacen(
            "scope = \"stratified_by_urbanity\"",
            "normalization = \"min_max\"\nscope = \"stratified_by_urbanity\"",
            1,
        );
        assert!(matches!(
            PipelineConfig::from_toml_str(&source),
            Err(ConfigError::Invalid(message)) if message.contains("school_merit_value_avg")
        ));
    }

    #[test]
    fn rollup_must_be_coarser() {
        let source = DEFAULT_CONFIG_TOML.replace(
            "rollup_resolutions = [5, 6, 7]",
            "rollup_resolutions = [5, 9]",
        );
        assert!(matches!(
            PipelineConfig::from_toml_str(&source),
            Err(ConfigError::Invalid(_))
        ));
    }

    #[test]
    fn fingerprint_tracks_source_text() {
        let a = PipelineConfig::embedded().unwrap();
        let source = DEFAULT_CONFIG_TOML.replace("stable_threshold_pct = 3.0", "stable_threshold_pct = 5.0");
        let b = PipelineConfig::from_toml_str(&source).unwrap();
        assert_ne!(a.fingerprint(), b.fingerprint());
        assert!((b.trend.stable_threshold_pct - 5.0).abs() < f64::EPSILON);
    }
}
