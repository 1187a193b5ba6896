//! Loads plain-row inputs from CSV and area boundaries from `GeoJSON`.
//!
//! Rows that fail to parse are skipped with a warning; a file that cannot
//! be opened aborts the import.

use std::collections::BTreeMap;
use std::path::Path;

use area_score_crosswalk::AreaCrosswalk;
use area_score_geography_models::{Area, CrosswalkMapping, VulnerabilityMapping, VulnerabilityTier};
use area_score_indicator_models::{IndicatorValue, MethodologyBreak};
use area_score_score_models::DistrictRate;
use serde::de::DeserializeOwned;
use serde::Deserialize;

use crate::Context;

/// Reads every well-formed row of a headed CSV file.
fn read_rows<T: DeserializeOwned>(path: &Path) -> Result<Vec<T>, csv::Error> {
    let mut reader = csv::ReaderBuilder::new().trim(csv::Trim::All).from_path(path)?;

    let mut rows = Vec::new();
    let mut skipped = 0_usize;
    for (line, record) in reader.deserialize::<T>().enumerate() {
        match record {
            Ok(row) => rows.push(row),
            Err(e) => {
                skipped += 1;
                log::debug!("{}: skipping record {}: {e}", path.display(), line + 1);
            }
        }
    }

    if skipped > 0 {
        log::warn!("{}: skipped {skipped} malformed rows", path.display());
    }
    log::info!("{}: read {} rows", path.display(), rows.len());

    Ok(rows)
}

/// Keeps the last row per key. One upsert statement cannot write the same
/// key twice.
fn dedup_by_key<T, K: Ord>(rows: Vec<T>, key: impl Fn(&T) -> K) -> Vec<T> {
    let total = rows.len();
    let unique: BTreeMap<K, T> = rows.into_iter().map(|row| (key(&row), row)).collect();

    if unique.len() < total {
        log::warn!("Dropped {} rows with duplicate keys", total - unique.len());
    }

    unique.into_values().collect()
}

#[derive(Deserialize)]
struct ValueRow {
    area_code: String,
    indicator: String,
    year: i32,
    raw_value: Option<f64>,
}

#[derive(Deserialize)]
struct DistrictRateRow {
    district_code: String,
    year: i32,
    rate: f64,
    secondary_rate: Option<f64>,
    population: Option<u64>,
}

#[derive(Deserialize)]
struct VulnerabilityRow {
    area_code: String,
    tier: VulnerabilityTier,
    overlap_fraction: f64,
}

#[derive(Deserialize)]
struct BreakRow {
    indicator: String,
    year_affected: i32,
    breaks_trend: bool,
    description: Option<String>,
}

#[derive(Deserialize)]
struct CrosswalkRow {
    old_code: String,
    new_code: String,
    overlap_fraction: f64,
    reverse_fraction: f64,
}

/// Property names read from area features.
pub struct AreaProperties<'a> {
    /// Area code.
    pub code: &'a str,
    /// Code of the district the area reports under.
    pub district: &'a str,
    /// Region code.
    pub region: &'a str,
    /// Resident population.
    pub population: &'a str,
    /// Land area in km².
    pub land_area: &'a str,
}

/// Imports area boundaries and attributes from a `GeoJSON` feature
/// collection as one boundary vintage.
///
/// # Errors
///
/// Returns an error if the file cannot be read or parsed, or the write
/// fails.
pub fn areas(
    ctx: &Context,
    path: &Path,
    vintage: &str,
    properties: &AreaProperties<'_>,
) -> Result<(), Box<dyn std::error::Error>> {
    let text = std::fs::read_to_string(path)?;
    let features = area_score_spatial::parse_area_features(&text, properties.code)?;

    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    let areas: Vec<Area> = features
        .iter()
        .map(|f| Area {
            district_code: f.string_property(properties.district),
            region_code: f.string_property(properties.region),
            population: f
                .f64_property(properties.population)
                .filter(|p| p.is_finite() && *p >= 0.0)
                .map(|p| p.round() as u64),
            land_area_km2: f.f64_property(properties.land_area),
            ..Area::new(f.code.clone())
        })
        .collect();
    let geometries: Vec<(String, String)> = features
        .into_iter()
        .map(|f| (f.code, f.geojson))
        .collect();

    area_score_database::areas::upsert_areas(&ctx.conn, &areas)?;
    area_score_database::areas::upsert_geometries(&ctx.conn, vintage, &geometries)?;
    log::info!("Imported {} areas for vintage {vintage}", areas.len());

    Ok(())
}

/// Imports raw indicator values. With `remap`, codes are treated as the
/// previous boundary vintage and mapped through the stored crosswalk first.
///
/// # Errors
///
/// Returns an error if the file cannot be read, the crosswalk is invalid,
/// or the write fails.
pub fn values(ctx: &Context, path: &Path, remap: bool) -> Result<(), Box<dyn std::error::Error>> {
    let rows = dedup_by_key(read_rows::<ValueRow>(path)?, |r| {
        (r.area_code.clone(), r.indicator.clone(), r.year)
    });
    let mut values: Vec<IndicatorValue> = rows
        .into_iter()
        .filter(|r| {
            let known = ctx.config.indicator(&r.indicator).is_some();
            if !known {
                log::debug!("Skipping value for unknown indicator {}", r.indicator);
            }
            known
        })
        .map(|r| IndicatorValue {
            area_code: r.area_code,
            indicator: r.indicator,
            year: r.year,
            raw_value: r.raw_value.filter(|v| v.is_finite()),
            normalized_value: None,
        })
        .collect();

    if remap {
        let crosswalk = load_crosswalk(ctx)?;
        values = crosswalk.remap_values(&values, |slug| ctx.config.indicator(slug).map(|i| i.unit));
    }

    let written = area_score_database::values::upsert_values(&ctx.conn, &values)?;
    log::info!("Imported {written} indicator values");

    Ok(())
}

/// Imports district rates for one disaggregation model.
///
/// # Errors
///
/// Returns an error if the model is unknown, the file cannot be read, or
/// the write fails.
pub fn district_rates(
    ctx: &Context,
    model: &str,
    path: &Path,
) -> Result<(), Box<dyn std::error::Error>> {
    ctx.config.model(model)?;

    let rows = dedup_by_key(read_rows::<DistrictRateRow>(path)?, |r| {
        (r.district_code.clone(), r.year)
    });
    let rates: Vec<DistrictRate> = rows
        .into_iter()
        .map(|r| DistrictRate {
            district_code: r.district_code,
            year: r.year,
            rate: r.rate,
            secondary_rate: r.secondary_rate,
            population: r.population,
        })
        .collect();

    let written = area_score_database::values::upsert_district_rates(&ctx.conn, model, &rates)?;
    log::info!("Imported {written} district rates for model {model}");

    Ok(())
}

/// Imports vulnerability-area overlaps.
///
/// # Errors
///
/// Returns an error if the file cannot be read or the write fails.
pub fn vulnerability(ctx: &Context, path: &Path) -> Result<(), Box<dyn std::error::Error>> {
    let rows = dedup_by_key(read_rows::<VulnerabilityRow>(path)?, |r| {
        (r.area_code.clone(), r.tier)
    });
    let mappings: Vec<VulnerabilityMapping> = rows
        .into_iter()
        .map(|r| VulnerabilityMapping {
            area_code: r.area_code,
            tier: r.tier,
            overlap_fraction: r.overlap_fraction,
        })
        .collect();

    let written = area_score_database::areas::upsert_vulnerability(&ctx.conn, &mappings)?;
    log::info!("Imported {written} vulnerability mappings");

    Ok(())
}

/// Imports methodology breaks.
///
/// # Errors
///
/// Returns an error if the file cannot be read or the write fails.
pub fn breaks(ctx: &Context, path: &Path) -> Result<(), Box<dyn std::error::Error>> {
    let rows = dedup_by_key(read_rows::<BreakRow>(path)?, |r| {
        (r.indicator.clone(), r.year_affected)
    });
    let breaks: Vec<MethodologyBreak> = rows
        .into_iter()
        .map(|r| MethodologyBreak {
            indicator: r.indicator,
            year_affected: r.year_affected,
            breaks_trend: r.breaks_trend,
            description: r.description.filter(|d| !d.is_empty()),
        })
        .collect();

    let written = area_score_database::areas::upsert_breaks(&ctx.conn, &breaks)?;
    log::info!("Imported {written} methodology breaks");

    Ok(())
}

/// Imports a precomputed crosswalk, then refreshes trend eligibility.
///
/// # Errors
///
/// Returns an error if the file cannot be read, a fraction is invalid, or
/// the write fails.
pub fn crosswalk(ctx: &Context, path: &Path) -> Result<(), Box<dyn std::error::Error>> {
    let rows = dedup_by_key(read_rows::<CrosswalkRow>(path)?, |r| {
        (r.old_code.clone(), r.new_code.clone())
    });
    let mappings: Vec<CrosswalkMapping> = rows
        .into_iter()
        .map(|r| CrosswalkMapping {
            old_code: r.old_code,
            new_code: r.new_code,
            overlap_fraction: r.overlap_fraction,
            reverse_fraction: r.reverse_fraction,
        })
        .collect();

    crate::stages::store_crosswalk(ctx, mappings)
}

/// Builds an [`AreaCrosswalk`] from the stored mapping rows.
///
/// # Errors
///
/// Returns an error if the query fails or a stored fraction is invalid.
pub fn load_crosswalk(ctx: &Context) -> Result<AreaCrosswalk, Box<dyn std::error::Error>> {
    let mappings = area_score_database::areas::load_crosswalk(&ctx.conn)?;
    Ok(AreaCrosswalk::new(mappings, ctx.config.crosswalk.min_overlap)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn malformed_rows_are_skipped() {
        let path = std::env::temp_dir().join(format!(
            "area_score_values_{}.csv",
            std::process::id()
        ));
        std::fs::write(
            &path,
            "area_code,indicator,year,raw_value\n\
             A, median_income ,2024,310000\n\
             B,median_income,not-a-year,1\n\
             C,median_income,2024,\n",
        )
        .unwrap();

        let rows: Vec<ValueRow> = read_rows(&path).unwrap();
        std::fs::remove_file(&path).unwrap();

        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].indicator, "median_income");
        assert_eq!(rows[1].raw_value, None);
    }

    #[test]
    fn duplicate_keys_keep_the_last_row() {
        let rows = vec![("A", 1), ("B", 2), ("A", 3)];

        let unique = dedup_by_key(rows, |r| r.0);

        assert_eq!(unique, vec![("A", 3), ("B", 2)]);
    }
}
