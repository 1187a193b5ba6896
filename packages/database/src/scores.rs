//! Trends, composite scores, and score run history.

use std::collections::BTreeMap;

use area_score_score_models::{CompositeScore, IndicatorTrend, ScoreRun, TrendDirection};
use duckdb::{Connection, ToSql};

use crate::{DbError, parse_column, replace_chunked, upsert_chunked};

/// Upserts indicator trends by `(area_code, indicator, base_year, end_year)`.
///
/// # Errors
///
/// Returns [`DbError`] if the write fails.
pub fn upsert_trends(conn: &Connection, trends: &[IndicatorTrend]) -> Result<u64, DbError> {
    upsert_chunked(
        conn,
        "indicator_trends",
        &[
            "area_code",
            "indicator",
            "base_year",
            "end_year",
            "data_points",
            "absolute_change",
            "percent_change",
            "direction",
            "confidence",
        ],
        trends,
        |stmt, i, t| {
            stmt.raw_bind_parameter(i, &t.area_code)?;
            stmt.raw_bind_parameter(i + 1, &t.indicator)?;
            stmt.raw_bind_parameter(i + 2, t.base_year)?;
            stmt.raw_bind_parameter(i + 3, t.end_year)?;
            stmt.raw_bind_parameter(i + 4, t.data_points)?;
            stmt.raw_bind_parameter(i + 5, t.absolute_change)?;
            stmt.raw_bind_parameter(i + 6, t.percent_change)?;
            stmt.raw_bind_parameter(i + 7, t.direction.to_string())?;
            stmt.raw_bind_parameter(i + 8, t.confidence)
        },
    )
}

/// Loads the trends of one window.
///
/// # Errors
///
/// Returns [`DbError`] if the query fails or a stored direction is
/// unknown.
pub fn load_trends(
    conn: &Connection,
    base_year: i32,
    end_year: i32,
) -> Result<Vec<IndicatorTrend>, DbError> {
    let mut stmt = conn.prepare(
        "SELECT area_code, indicator, base_year, end_year, data_points,
                absolute_change, percent_change, direction, confidence
         FROM indicator_trends WHERE base_year = ? AND end_year = ?
         ORDER BY indicator, area_code",
    )?;
    let rows = stmt
        .query_map(duckdb::params![base_year, end_year], |row| {
            Ok((
                IndicatorTrend {
                    area_code: row.get(0)?,
                    indicator: row.get(1)?,
                    base_year: row.get(2)?,
                    end_year: row.get(3)?,
                    data_points: row.get(4)?,
                    absolute_change: row.get(5)?,
                    percent_change: row.get(6)?,
                    direction: TrendDirection::Insufficient,
                    confidence: row.get(8)?,
                },
                row.get::<_, String>(7)?,
            ))
        })?
        .collect::<Result<Vec<_>, _>>()?;

    rows.into_iter()
        .map(|(mut trend, direction)| -> Result<IndicatorTrend, DbError> {
            trend.direction = parse_column("direction", &direction)?;
            Ok(trend)
        })
        .collect()
}

/// Replaces every stored composite score of `year` with `scores`.
///
/// An area scored by an earlier run but missing from `scores` loses its
/// row. Map and list fields are stored as JSON text.
///
/// # Errors
///
/// Returns [`DbError`] if a score belongs to another year, serialization
/// fails, or the write fails.
pub fn replace_scores(
    conn: &Connection,
    year: i32,
    scores: &[CompositeScore],
) -> Result<u64, DbError> {
    if let Some(stray) = scores.iter().find(|s| s.year != year) {
        return Err(DbError::Conversion {
            message: format!("Score for {} is from {}, not {year}", stray.area_code, stray.year),
        });
    }

    let encoded = scores
        .iter()
        .map(|s| {
            Ok((
                s,
                serde_json::to_string(&s.factor_scores)?,
                serde_json::to_string(&s.top_positive)?,
                serde_json::to_string(&s.top_negative)?,
                serde_json::to_string(&s.penalties_applied)?,
                serde_json::to_string(&s.fallback_years)?,
            ))
        })
        .collect::<Result<Vec<_>, serde_json::Error>>()?;

    let scope: [&dyn ToSql; 1] = [&year];
    replace_chunked(
        conn,
        ("year = ?", &scope),
        "composite_scores",
        &[
            "area_code",
            "year",
            "score",
            "raw_score_before_penalties",
            "trend_1y",
            "trend_3y",
            "factor_scores",
            "top_positive",
            "top_negative",
            "penalties_applied",
            "fallback_years",
        ],
        &encoded,
        |stmt, i, (s, factors, positive, negative, penalties, fallbacks)| {
            stmt.raw_bind_parameter(i, &s.area_code)?;
            stmt.raw_bind_parameter(i + 1, s.year)?;
            stmt.raw_bind_parameter(i + 2, s.score)?;
            stmt.raw_bind_parameter(i + 3, s.raw_score_before_penalties)?;
            stmt.raw_bind_parameter(i + 4, s.trend_1y)?;
            stmt.raw_bind_parameter(i + 5, s.trend_3y)?;
            stmt.raw_bind_parameter(i + 6, factors)?;
            stmt.raw_bind_parameter(i + 7, positive)?;
            stmt.raw_bind_parameter(i + 8, negative)?;
            stmt.raw_bind_parameter(i + 9, penalties)?;
            stmt.raw_bind_parameter(i + 10, fallbacks)
        },
    )
}

/// Loads the full composite scores of one year.
///
/// # Errors
///
/// Returns [`DbError`] if the query or JSON decoding fails.
pub fn load_scores(conn: &Connection, year: i32) -> Result<Vec<CompositeScore>, DbError> {
    let mut stmt = conn.prepare(
        "SELECT area_code, year, score, raw_score_before_penalties, trend_1y, trend_3y,
                factor_scores, top_positive, top_negative, penalties_applied, fallback_years
         FROM composite_scores WHERE year = ?
         ORDER BY area_code",
    )?;
    let rows = stmt
        .query_map([year], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, i32>(1)?,
                row.get::<_, f64>(2)?,
                row.get::<_, Option<f64>>(3)?,
                row.get::<_, Option<f64>>(4)?,
                row.get::<_, Option<f64>>(5)?,
                [
                    row.get::<_, String>(6)?,
                    row.get::<_, String>(7)?,
                    row.get::<_, String>(8)?,
                    row.get::<_, String>(9)?,
                    row.get::<_, String>(10)?,
                ],
            ))
        })?
        .collect::<Result<Vec<_>, _>>()?;

    rows.into_iter()
        .map(
            |(area_code, year, score, raw, trend_1y, trend_3y, [factors, pos, neg, pen, fall])|
             -> Result<CompositeScore, DbError> {
                Ok(CompositeScore {
                    area_code,
                    year,
                    score,
                    raw_score_before_penalties: raw,
                    trend_1y,
                    trend_3y,
                    factor_scores: serde_json::from_str(&factors)?,
                    top_positive: serde_json::from_str(&pos)?,
                    top_negative: serde_json::from_str(&neg)?,
                    penalties_applied: serde_json::from_str(&pen)?,
                    fallback_years: serde_json::from_str(&fall)?,
                })
            },
        )
        .collect()
}

/// Final score per area code for one year.
///
/// # Errors
///
/// Returns [`DbError`] if the query fails.
pub fn scores_for_year(conn: &Connection, year: i32) -> Result<BTreeMap<String, f64>, DbError> {
    let mut stmt =
        conn.prepare("SELECT area_code, score FROM composite_scores WHERE year = ?")?;
    let scores = stmt
        .query_map([year], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, f64>(1)?))
        })?
        .collect::<Result<BTreeMap<_, _>, _>>()?;
    Ok(scores)
}

/// Records a score run.
///
/// # Errors
///
/// Returns [`DbError`] if the write fails.
pub fn insert_score_run(conn: &Connection, run: &ScoreRun) -> Result<(), DbError> {
    conn.execute(
        "INSERT INTO score_runs
            (id, year, computed_at, area_count, mean_score, stddev_score, config_fingerprint)
         VALUES (?, ?, ?, ?, ?, ?, ?)",
        duckdb::params![
            run.id,
            run.year,
            run.computed_at,
            i64::try_from(run.area_count).unwrap_or(i64::MAX),
            run.mean_score,
            run.stddev_score,
            run.config_fingerprint,
        ],
    )?;
    Ok(())
}

/// Score runs of one year, newest first.
///
/// # Errors
///
/// Returns [`DbError`] if the query fails.
pub fn load_score_runs(conn: &Connection, year: i32) -> Result<Vec<ScoreRun>, DbError> {
    let mut stmt = conn.prepare(
        "SELECT id, year, computed_at, area_count, mean_score, stddev_score, config_fingerprint
         FROM score_runs WHERE year = ?
         ORDER BY computed_at DESC",
    )?;
    let runs = stmt
        .query_map([year], |row| {
            Ok(ScoreRun {
                id: row.get(0)?,
                year: row.get(1)?,
                computed_at: row.get(2)?,
                area_count: usize::try_from(row.get::<_, i64>(3)?).unwrap_or(0),
                mean_score: row.get(4)?,
                stddev_score: row.get(5)?,
                config_fingerprint: row.get(6)?,
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(runs)
}
