//! Area-to-hex mappings and hex cell scores.
//!
//! H3 indexes are unsigned 64-bit values; they are stored as `BIGINT`
//! through a bit-preserving cast.

use area_score_score_models::{HexAssignment, HexCellScore};
use duckdb::{Connection, ToSql};

use crate::{DbError, replace_chunked};

#[allow(clippy::cast_possible_wrap)]
const fn h3_to_db(index: u64) -> i64 {
    index as i64
}

#[allow(clippy::cast_sign_loss)]
const fn h3_from_db(value: i64) -> u64 {
    value as u64
}

fn check_resolution<'a>(
    resolution: u8,
    mut found: impl Iterator<Item = (u8, &'a str)>,
) -> Result<(), DbError> {
    match found.find(|(r, _)| *r != resolution) {
        Some((r, what)) => Err(DbError::Conversion {
            message: format!("{what} is at resolution {r}, not {resolution}"),
        }),
        None => Ok(()),
    }
}

/// Replaces the whole area-to-hex mapping at `resolution`.
///
/// # Errors
///
/// Returns [`DbError`] if an assignment is at another resolution or the
/// write fails; on failure the previous mapping is kept.
pub fn replace_hex_mapping(
    conn: &Connection,
    resolution: u8,
    mapping: &[HexAssignment],
) -> Result<u64, DbError> {
    check_resolution(
        resolution,
        mapping.iter().map(|a| (a.resolution, a.area_code.as_str())),
    )?;

    let scope: [&dyn ToSql; 1] = [&resolution];
    replace_chunked(
        conn,
        ("resolution = ?", &scope),
        "area_hex_mapping",
        &[
            "area_code",
            "h3_index",
            "resolution",
            "area_weight",
            "centroid_fallback",
        ],
        mapping,
        |stmt, i, a| {
            stmt.raw_bind_parameter(i, &a.area_code)?;
            stmt.raw_bind_parameter(i + 1, h3_to_db(a.h3_index))?;
            stmt.raw_bind_parameter(i + 2, a.resolution)?;
            stmt.raw_bind_parameter(i + 3, a.area_weight)?;
            stmt.raw_bind_parameter(i + 4, a.centroid_fallback)
        },
    )
}

/// Loads the area-to-hex mapping at one resolution.
///
/// # Errors
///
/// Returns [`DbError`] if the query fails.
pub fn load_hex_mapping(conn: &Connection, resolution: u8) -> Result<Vec<HexAssignment>, DbError> {
    let mut stmt = conn.prepare(
        "SELECT area_code, h3_index, resolution, area_weight, centroid_fallback
         FROM area_hex_mapping WHERE resolution = ?
         ORDER BY area_code, h3_index",
    )?;
    let mapping = stmt
        .query_map([resolution], |row| {
            Ok(HexAssignment {
                area_code: row.get(0)?,
                h3_index: h3_from_db(row.get(1)?),
                resolution: row.get(2)?,
                area_weight: row.get(3)?,
                centroid_fallback: row.get(4)?,
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(mapping)
}

/// Replaces every hex cell score of `year` at `resolution` with `cells`.
///
/// Cells that no longer receive a score lose their row.
///
/// # Errors
///
/// Returns [`DbError`] if a cell belongs to another year or resolution, or
/// the write fails.
pub fn replace_hex_scores(
    conn: &Connection,
    year: i32,
    resolution: u8,
    cells: &[HexCellScore],
) -> Result<u64, DbError> {
    if let Some(stray) = cells.iter().find(|c| c.year != year) {
        return Err(DbError::Conversion {
            message: format!("Cell {:x} is from {}, not {year}", stray.h3_index, stray.year),
        });
    }
    check_resolution(resolution, cells.iter().map(|c| (c.resolution, "hex cell")))?;

    let scope: [&dyn ToSql; 2] = [&year, &resolution];
    replace_chunked(
        conn,
        ("year = ? AND resolution = ?", &scope),
        "hex_scores",
        &[
            "h3_index",
            "resolution",
            "year",
            "score_raw",
            "score_smoothed",
            "smoothing_factor",
            "trend_1y",
            "primary_area_code",
        ],
        cells,
        |stmt, i, c| {
            stmt.raw_bind_parameter(i, h3_to_db(c.h3_index))?;
            stmt.raw_bind_parameter(i + 1, c.resolution)?;
            stmt.raw_bind_parameter(i + 2, c.year)?;
            stmt.raw_bind_parameter(i + 3, c.score_raw)?;
            stmt.raw_bind_parameter(i + 4, c.score_smoothed)?;
            stmt.raw_bind_parameter(i + 5, c.smoothing_factor)?;
            stmt.raw_bind_parameter(i + 6, c.trend_1y)?;
            stmt.raw_bind_parameter(i + 7, c.primary_area_code.as_deref())
        },
    )
}

/// Loads the hex cell scores of one year at one resolution.
///
/// # Errors
///
/// Returns [`DbError`] if the query fails.
pub fn load_hex_scores(
    conn: &Connection,
    year: i32,
    resolution: u8,
) -> Result<Vec<HexCellScore>, DbError> {
    let mut stmt = conn.prepare(
        "SELECT h3_index, resolution, year, score_raw, score_smoothed,
                smoothing_factor, trend_1y, primary_area_code
         FROM hex_scores WHERE year = ? AND resolution = ?
         ORDER BY h3_index",
    )?;
    let cells = stmt
        .query_map(duckdb::params![year, resolution], |row| {
            Ok(HexCellScore {
                h3_index: h3_from_db(row.get(0)?),
                resolution: row.get(1)?,
                year: row.get(2)?,
                score_raw: row.get(3)?,
                score_smoothed: row.get(4)?,
                smoothing_factor: row.get(5)?,
                trend_1y: row.get(6)?,
                primary_area_code: row.get(7)?,
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(cells)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::open_in_memory;

    // High bit set, so the BIGINT cast goes negative.
    const HIGH_INDEX: u64 = 0x8a1f_b466_2967_fff0 | (1 << 63);

    #[test]
    fn h3_cast_preserves_bits() {
        assert!(h3_to_db(HIGH_INDEX) < 0);
        assert_eq!(h3_from_db(h3_to_db(HIGH_INDEX)), HIGH_INDEX);
    }

    #[test]
    fn mapping_is_replaced_per_resolution() {
        let conn = open_in_memory().unwrap();
        let assignment = |code: &str, index: u64| HexAssignment {
            area_code: code.to_string(),
            h3_index: index,
            resolution: 8,
            area_weight: 1.0,
            centroid_fallback: false,
        };

        replace_hex_mapping(&conn, 8, &[assignment("A", 1), assignment("A", 2)]).unwrap();
        replace_hex_mapping(&conn, 8, &[assignment("B", HIGH_INDEX)]).unwrap();

        let loaded = load_hex_mapping(&conn, 8).unwrap();
        assert_eq!(loaded, vec![assignment("B", HIGH_INDEX)]);
    }

    #[test]
    fn rejected_mapping_keeps_the_previous_one() {
        let conn = open_in_memory().unwrap();
        let assignment = |resolution: u8| HexAssignment {
            area_code: "A".to_string(),
            h3_index: 1,
            resolution,
            area_weight: 1.0,
            centroid_fallback: false,
        };
        replace_hex_mapping(&conn, 8, &[assignment(8)]).unwrap();

        assert!(replace_hex_mapping(&conn, 8, &[assignment(7)]).is_err());
        assert_eq!(load_hex_mapping(&conn, 8).unwrap(), vec![assignment(8)]);
    }

    #[test]
    fn hex_scores_round_trip() {
        let conn = open_in_memory().unwrap();
        let cell = HexCellScore {
            h3_index: HIGH_INDEX,
            resolution: 8,
            year: 2024,
            score_raw: 50.0,
            score_smoothed: Some(62.0),
            smoothing_factor: 0.4,
            trend_1y: None,
            primary_area_code: Some("A".to_string()),
        };
        replace_hex_scores(&conn, 2024, 8, std::slice::from_ref(&cell)).unwrap();

        assert_eq!(load_hex_scores(&conn, 2024, 8).unwrap(), vec![cell]);
        assert!(load_hex_scores(&conn, 2024, 7).unwrap().is_empty());
    }

    #[test]
    fn reprojection_drops_cells_no_longer_scored() {
        let conn = open_in_memory().unwrap();
        let cell = |index: u64, resolution: u8| HexCellScore {
            h3_index: index,
            resolution,
            year: 2024,
            score_raw: 50.0,
            score_smoothed: None,
            smoothing_factor: 0.0,
            trend_1y: None,
            primary_area_code: None,
        };
        replace_hex_scores(&conn, 2024, 8, &[cell(1, 8), cell(2, 8)]).unwrap();
        replace_hex_scores(&conn, 2024, 7, &[cell(9, 7)]).unwrap();

        replace_hex_scores(&conn, 2024, 8, &[cell(1, 8)]).unwrap();

        assert_eq!(load_hex_scores(&conn, 2024, 8).unwrap(), vec![cell(1, 8)]);
        assert_eq!(load_hex_scores(&conn, 2024, 7).unwrap(), vec![cell(9, 7)]);
    }
}
