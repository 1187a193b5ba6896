#![cfg_attr(feature = "fail-on-warnings", deny(warnings))]
#![warn(clippy::all, clippy::pedantic, clippy::nursery, clippy::cargo)]
#![allow(clippy::multiple_crate_versions, clippy::cargo_common_metadata)]

//! Statistical area and boundary types.
//!
//! An [`Area`] is the smallest geography the engine scores. Areas roll up
//! into districts (coarse areas that only publish aggregate statistics)
//! and regions. Boundary vintages change over time, so historical values
//! are carried onto the current vintage through [`CrosswalkMapping`] rows.

use serde::{Deserialize, Serialize};
use strum_macros::{AsRefStr, Display, EnumString};

/// Population density (people per km²) above which an area is urban.
pub const URBAN_DENSITY_THRESHOLD: f64 = 1500.0;

/// Population density (people per km²) above which an area is semi-urban.
pub const SEMI_URBAN_DENSITY_THRESHOLD: f64 = 100.0;

/// Urbanity classification used to stratify normalization.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Serialize,
    Deserialize,
    Display,
    EnumString,
    AsRefStr,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum UrbanityTier {
    /// Dense city areas.
    Urban,
    /// Suburbs and small towns.
    SemiUrban,
    /// Sparsely populated areas.
    Rural,
}

impl UrbanityTier {
    /// Classifies an area by population density.
    ///
    /// Returns `None` when population or land area is unknown or the land
    /// area is not positive.
    #[must_use]
    pub fn from_density(population: Option<u64>, land_area_km2: Option<f64>) -> Option<Self> {
        let population = population?;
        let land_area = land_area_km2.filter(|a| *a > 0.0)?;

        #[allow(clippy::cast_precision_loss)]
        let density = population as f64 / land_area;

        Some(if density > URBAN_DENSITY_THRESHOLD {
            Self::Urban
        } else if density > SEMI_URBAN_DENSITY_THRESHOLD {
            Self::SemiUrban
        } else {
            Self::Rural
        })
    }

    /// Returns all variants of this enum.
    #[must_use]
    pub const fn all() -> &'static [Self] {
        &[Self::Urban, Self::SemiUrban, Self::Rural]
    }
}

/// Police-designated vulnerability classification of an area.
///
/// Ordered by severity so the most severe tier compares greatest.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Serialize,
    Deserialize,
    Display,
    EnumString,
    AsRefStr,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum VulnerabilityTier {
    /// Vulnerable area.
    Vulnerable,
    /// Especially vulnerable area.
    SeverelyVulnerable,
}

/// Overlap between a fine area and a classified vulnerability area.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VulnerabilityMapping {
    /// Fine area code.
    pub area_code: String,
    /// Severity tier of the vulnerability area.
    pub tier: VulnerabilityTier,
    /// Share of the fine area's footprint inside the vulnerability area.
    pub overlap_fraction: f64,
}

/// A fine statistical area for one boundary vintage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Area {
    /// Stable area identifier.
    pub code: String,
    /// Coarse area (municipality) this area belongs to.
    pub district_code: Option<String>,
    /// Region (county) this area belongs to.
    pub region_code: Option<String>,
    /// Resident population, backfilled after boundary import.
    pub population: Option<u64>,
    /// Land area in km².
    pub land_area_km2: Option<f64>,
    /// Urbanity stratum, if classified.
    pub urbanity_tier: Option<UrbanityTier>,
    /// Whether multi-year trends may be computed for this area. Areas whose
    /// boundaries changed between vintages are not comparable over time.
    pub trend_eligible: bool,
}

impl Area {
    /// Creates an area with only its code set.
    #[must_use]
    pub fn new(code: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            district_code: None,
            region_code: None,
            population: None,
            land_area_km2: None,
            urbanity_tier: None,
            trend_eligible: true,
        }
    }
}

/// How an old-vintage area relates to a new-vintage area.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Serialize,
    Deserialize,
    Display,
    EnumString,
    AsRefStr,
)]
pub enum MappingType {
    /// Both footprints coincide.
    #[serde(rename = "1:1")]
    #[strum(serialize = "1:1")]
    OneToOne,
    /// The old area was divided between several new areas.
    #[serde(rename = "split")]
    #[strum(serialize = "split")]
    Split,
    /// Several old areas were combined into the new area.
    #[serde(rename = "merge")]
    #[strum(serialize = "merge")]
    Merge,
    /// Boundary adjustment that is neither a clean split nor merge.
    #[serde(rename = "partial")]
    #[strum(serialize = "partial")]
    Partial,
}

/// Fraction above which two footprints are considered the same.
pub const COINCIDENT_FRACTION: f64 = 0.95;

impl MappingType {
    /// Classifies a mapping from its overlap and reverse fractions.
    #[must_use]
    pub fn classify(overlap_fraction: f64, reverse_fraction: f64) -> Self {
        if overlap_fraction > COINCIDENT_FRACTION && reverse_fraction > COINCIDENT_FRACTION {
            Self::OneToOne
        } else if overlap_fraction < COINCIDENT_FRACTION {
            Self::Split
        } else if reverse_fraction < COINCIDENT_FRACTION {
            Self::Merge
        } else {
            Self::Partial
        }
    }
}

/// One pre-computed polygon-overlap row between two boundary vintages.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CrosswalkMapping {
    /// Area code in the old vintage.
    pub old_code: String,
    /// Area code in the current vintage.
    pub new_code: String,
    /// Share of the old area's footprint inside the new area.
    pub overlap_fraction: f64,
    /// Share of the new area's footprint inside the old area.
    pub reverse_fraction: f64,
}

impl CrosswalkMapping {
    /// Classifies this mapping.
    #[must_use]
    pub fn mapping_type(&self) -> MappingType {
        MappingType::classify(self.overlap_fraction, self.reverse_fraction)
    }
}
