//! Urbanity tiers from population density.

use std::collections::BTreeMap;

use area_score_geography_models::{Area, UrbanityTier};

/// Assigns an urbanity tier to every area.
///
/// Areas without a usable population or land area are classified rural.
/// Returns the number of areas per tier.
pub fn classify_urbanity(areas: &mut [Area]) -> BTreeMap<UrbanityTier, usize> {
    let mut counts = BTreeMap::new();
    let mut missing = 0usize;

    for area in areas.iter_mut() {
        let tier = UrbanityTier::from_density(area.population, area.land_area_km2)
            .unwrap_or_else(|| {
                missing += 1;
                UrbanityTier::Rural
            });
        area.urbanity_tier = Some(tier);
        *counts.entry(tier).or_insert(0) += 1;
    }

    if missing > 0 {
        log::warn!("{missing} areas lack population or land area; classified as rural");
    }
    log::info!("Classified {} areas by urbanity: {counts:?}", areas.len());

    counts
}

/// Tier lookup by area code for areas that have one.
#[must_use]
pub fn tiers_by_code(areas: &[Area]) -> BTreeMap<String, UrbanityTier> {
    areas
        .iter()
        .filter_map(|a| a.urbanity_tier.map(|t| (a.code.clone(), t)))
        .collect()
}
