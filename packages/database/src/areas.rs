//! Areas, boundaries, and the reference tables attached to them.

use std::collections::BTreeSet;

use area_score_geography_models::{Area, CrosswalkMapping, VulnerabilityMapping};
use area_score_indicator_models::MethodologyBreak;
use duckdb::Connection;

use crate::{DbError, parse_column, upsert_chunked};

/// Upserts areas by code.
///
/// # Errors
///
/// Returns [`DbError`] if the write fails.
pub fn upsert_areas(conn: &Connection, areas: &[Area]) -> Result<u64, DbError> {
    upsert_chunked(
        conn,
        "areas",
        &[
            "code",
            "district_code",
            "region_code",
            "population",
            "land_area_km2",
            "urbanity_tier",
            "trend_eligible",
        ],
        areas,
        |stmt, i, area| {
            stmt.raw_bind_parameter(i, &area.code)?;
            stmt.raw_bind_parameter(i + 1, area.district_code.as_deref())?;
            stmt.raw_bind_parameter(i + 2, area.region_code.as_deref())?;
            stmt.raw_bind_parameter(i + 3, area.population.and_then(|p| i64::try_from(p).ok()))?;
            stmt.raw_bind_parameter(i + 4, area.land_area_km2)?;
            stmt.raw_bind_parameter(i + 5, area.urbanity_tier.map(|t| t.to_string()))?;
            stmt.raw_bind_parameter(i + 6, area.trend_eligible)
        },
    )
}

/// Loads every area, ordered by code.
///
/// # Errors
///
/// Returns [`DbError`] if the query fails or a tier is unknown.
pub fn load_areas(conn: &Connection) -> Result<Vec<Area>, DbError> {
    let mut stmt = conn.prepare(
        "SELECT code, district_code, region_code, population, land_area_km2,
                urbanity_tier, trend_eligible
         FROM areas ORDER BY code",
    )?;
    let rows = stmt
        .query_map([], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, Option<String>>(1)?,
                row.get::<_, Option<String>>(2)?,
                row.get::<_, Option<i64>>(3)?,
                row.get::<_, Option<f64>>(4)?,
                row.get::<_, Option<String>>(5)?,
                row.get::<_, bool>(6)?,
            ))
        })?
        .collect::<Result<Vec<_>, _>>()?;

    rows.into_iter()
        .map(
            |(code, district_code, region_code, population, land_area_km2, tier, trend_eligible)| {
                Ok(Area {
                    code,
                    district_code,
                    region_code,
                    population: population.and_then(|p| u64::try_from(p).ok()),
                    land_area_km2,
                    urbanity_tier: tier
                        .as_deref()
                        .map(|t| parse_column("urbanity_tier", t))
                        .transpose()?,
                    trend_eligible,
                })
            },
        )
        .collect()
}

/// Stores `GeoJSON` geometries for one boundary vintage.
///
/// # Errors
///
/// Returns [`DbError`] if the write fails.
pub fn upsert_geometries(
    conn: &Connection,
    vintage: &str,
    geometries: &[(String, String)],
) -> Result<u64, DbError> {
    upsert_chunked(
        conn,
        "area_geometries",
        &["area_code", "vintage", "geojson"],
        geometries,
        |stmt, i, (code, geojson)| {
            stmt.raw_bind_parameter(i, code)?;
            stmt.raw_bind_parameter(i + 1, vintage)?;
            stmt.raw_bind_parameter(i + 2, geojson)
        },
    )
}

/// Sets `trend_eligible` to false for `ineligible` codes and true for
/// every other area.
///
/// Returns the number of areas marked ineligible.
///
/// # Errors
///
/// Returns [`DbError`] if an update fails.
pub fn set_trend_eligibility(
    conn: &Connection,
    ineligible: &BTreeSet<String>,
) -> Result<u64, DbError> {
    let tx = conn.unchecked_transaction()?;
    tx.execute_batch("UPDATE areas SET trend_eligible = TRUE;")?;

    let mut marked = 0u64;
    {
        let mut stmt = tx.prepare("UPDATE areas SET trend_eligible = FALSE WHERE code = ?")?;
        for code in ineligible {
            marked += u64::try_from(stmt.execute([code])?).unwrap_or(0);
        }
    }
    tx.commit()?;

    log::info!("Marked {marked} areas trend-ineligible");
    Ok(marked)
}

/// Codes of areas whose boundaries changed between vintages.
///
/// # Errors
///
/// Returns [`DbError`] if the query fails.
pub fn trend_ineligible_codes(conn: &Connection) -> Result<BTreeSet<String>, DbError> {
    let mut stmt = conn.prepare("SELECT code FROM areas WHERE NOT trend_eligible")?;
    let codes = stmt
        .query_map([], |row| row.get::<_, String>(0))?
        .collect::<Result<BTreeSet<_>, _>>()?;
    Ok(codes)
}

/// Upserts vulnerability overlaps by `(area_code, tier)`.
///
/// # Errors
///
/// Returns [`DbError`] if the write fails.
pub fn upsert_vulnerability(
    conn: &Connection,
    mappings: &[VulnerabilityMapping],
) -> Result<u64, DbError> {
    upsert_chunked(
        conn,
        "vulnerability_mappings",
        &["area_code", "tier", "overlap_fraction"],
        mappings,
        |stmt, i, mapping| {
            stmt.raw_bind_parameter(i, &mapping.area_code)?;
            stmt.raw_bind_parameter(i + 1, mapping.tier.to_string())?;
            stmt.raw_bind_parameter(i + 2, mapping.overlap_fraction)
        },
    )
}

/// Loads every vulnerability overlap.
///
/// # Errors
///
/// Returns [`DbError`] if the query fails or a tier is unknown.
pub fn load_vulnerability(conn: &Connection) -> Result<Vec<VulnerabilityMapping>, DbError> {
    let mut stmt = conn.prepare(
        "SELECT area_code, tier, overlap_fraction FROM vulnerability_mappings
         ORDER BY area_code, tier",
    )?;
    let rows = stmt
        .query_map([], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, f64>(2)?,
            ))
        })?
        .collect::<Result<Vec<_>, _>>()?;

    rows.into_iter()
        .map(|(area_code, tier, overlap_fraction)| {
            Ok(VulnerabilityMapping {
                area_code,
                tier: parse_column("tier", &tier)?,
                overlap_fraction,
            })
        })
        .collect()
}

/// Upserts methodology breaks by `(indicator, year_affected)`.
///
/// # Errors
///
/// Returns [`DbError`] if the write fails.
pub fn upsert_breaks(conn: &Connection, breaks: &[MethodologyBreak]) -> Result<u64, DbError> {
    upsert_chunked(
        conn,
        "methodology_breaks",
        &["indicator", "year_affected", "breaks_trend", "description"],
        breaks,
        |stmt, i, b| {
            stmt.raw_bind_parameter(i, &b.indicator)?;
            stmt.raw_bind_parameter(i + 1, b.year_affected)?;
            stmt.raw_bind_parameter(i + 2, b.breaks_trend)?;
            stmt.raw_bind_parameter(i + 3, b.description.as_deref())
        },
    )
}

/// Loads every methodology break.
///
/// # Errors
///
/// Returns [`DbError`] if the query fails.
pub fn load_breaks(conn: &Connection) -> Result<Vec<MethodologyBreak>, DbError> {
    let mut stmt = conn.prepare(
        "SELECT indicator, year_affected, breaks_trend, description
         FROM methodology_breaks ORDER BY indicator, year_affected",
    )?;
    let breaks = stmt
        .query_map([], |row| {
            Ok(MethodologyBreak {
                indicator: row.get(0)?,
                year_affected: row.get(1)?,
                breaks_trend: row.get(2)?,
                description: row.get(3)?,
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(breaks)
}

/// Upserts crosswalk rows by `(old_code, new_code)`, storing each row's
/// mapping type alongside.
///
/// # Errors
///
/// Returns [`DbError`] if the write fails.
pub fn upsert_crosswalk(conn: &Connection, mappings: &[CrosswalkMapping]) -> Result<u64, DbError> {
    upsert_chunked(
        conn,
        "crosswalk",
        &[
            "old_code",
            "new_code",
            "overlap_fraction",
            "reverse_fraction",
            "mapping_type",
        ],
        mappings,
        |stmt, i, m| {
            stmt.raw_bind_parameter(i, &m.old_code)?;
            stmt.raw_bind_parameter(i + 1, &m.new_code)?;
            stmt.raw_bind_parameter(i + 2, m.overlap_fraction)?;
            stmt.raw_bind_parameter(i + 3, m.reverse_fraction)?;
            stmt.raw_bind_parameter(i + 4, m.mapping_type().to_string())
        },
    )
}

/// Loads the crosswalk.
///
/// # Errors
///
/// Returns [`DbError`] if the query fails.
pub fn load_crosswalk(conn: &Connection) -> Result<Vec<CrosswalkMapping>, DbError> {
    let mut stmt = conn.prepare(
        "SELECT old_code, new_code, overlap_fraction, reverse_fraction
         FROM crosswalk ORDER BY old_code, new_code",
    )?;
    let mappings = stmt
        .query_map([], |row| {
            Ok(CrosswalkMapping {
                old_code: row.get(0)?,
                new_code: row.get(1)?,
                overlap_fraction: row.get(2)?,
                reverse_fraction: row.get(3)?,
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(mappings)
}

#[cfg(test)]
mod tests {
    use area_score_geography_models::{UrbanityTier, VulnerabilityTier};

    use super::*;
    use crate::open_in_memory;

    #[test]
    fn areas_round_trip_with_tier() {
        let conn = open_in_memory().unwrap();
        let mut area = Area::new("0180C1010");
        area.district_code = Some("0180".to_string());
        area.population = Some(1_843);
        area.land_area_km2 = Some(0.42);
        area.urbanity_tier = Some(UrbanityTier::Urban);

        upsert_areas(&conn, &[area.clone(), Area::new("2584A0010")]).unwrap();

        let loaded = load_areas(&conn).unwrap();
        assert_eq!(loaded.len(), 2);
        assert_eq!(loaded[0], area);
        assert_eq!(loaded[1].urbanity_tier, None);
    }

    #[test]
    fn eligibility_resets_on_each_call() {
        let conn = open_in_memory().unwrap();
        upsert_areas(&conn, &[Area::new("A"), Area::new("B"), Area::new("C")]).unwrap();

        let first: BTreeSet<String> = ["A".to_string()].into_iter().collect();
        assert_eq!(set_trend_eligibility(&conn, &first).unwrap(), 1);

        let second: BTreeSet<String> = ["B".to_string(), "C".to_string()].into_iter().collect();
        set_trend_eligibility(&conn, &second).unwrap();
        assert_eq!(trend_ineligible_codes(&conn).unwrap(), second);
    }

    #[test]
    fn reimport_replaces_rows() {
        let conn = open_in_memory().unwrap();
        let mut mapping = VulnerabilityMapping {
            area_code: "A".to_string(),
            tier: VulnerabilityTier::Vulnerable,
            overlap_fraction: 0.3,
        };
        upsert_vulnerability(&conn, &[mapping.clone()]).unwrap();
        mapping.overlap_fraction = 0.6;
        upsert_vulnerability(&conn, &[mapping.clone()]).unwrap();

        assert_eq!(load_vulnerability(&conn).unwrap(), vec![mapping]);
    }

    #[test]
    fn crosswalk_and_breaks_round_trip() {
        let conn = open_in_memory().unwrap();
        let mappings = vec![
            CrosswalkMapping {
                old_code: "OLD".to_string(),
                new_code: "N1".to_string(),
                overlap_fraction: 0.6,
                reverse_fraction: 1.0,
            },
            CrosswalkMapping {
                old_code: "OLD".to_string(),
                new_code: "N2".to_string(),
                overlap_fraction: 0.4,
                reverse_fraction: 1.0,
            },
        ];
        upsert_crosswalk(&conn, &mappings).unwrap();
        assert_eq!(load_crosswalk(&conn).unwrap(), mappings);

        let breaks = vec![MethodologyBreak {
            indicator: "perceived_safety".to_string(),
            year_affected: 2021,
            breaks_trend: true,
            description: Some("survey redesign".to_string()),
        }];
        upsert_breaks(&conn, &breaks).unwrap();
        assert_eq!(load_breaks(&conn).unwrap(), breaks);
    }
}
