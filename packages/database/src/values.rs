//! Indicator values and the district inputs and outputs of disaggregation.

use area_score_indicator_models::IndicatorValue;
use area_score_score_models::{DisaggregationResult, DistrictRate, ValidationReport};
use duckdb::{Connection, Row};

use crate::{DbError, upsert_chunked};

const VALUE_COLUMNS: &str = "area_code, indicator, year, raw_value, normalized_value";

fn value_from_row(row: &Row<'_>) -> duckdb::Result<IndicatorValue> {
    Ok(IndicatorValue {
        area_code: row.get(0)?,
        indicator: row.get(1)?,
        year: row.get(2)?,
        raw_value: row.get(3)?,
        normalized_value: row.get(4)?,
    })
}

/// Upserts indicator values by `(area_code, indicator, year)`.
///
/// # Errors
///
/// Returns [`DbError`] if the write fails.
pub fn upsert_values(conn: &Connection, values: &[IndicatorValue]) -> Result<u64, DbError> {
    upsert_chunked(
        conn,
        "indicator_values",
        &["area_code", "indicator", "year", "raw_value", "normalized_value"],
        values,
        |stmt, i, v| {
            stmt.raw_bind_parameter(i, &v.area_code)?;
            stmt.raw_bind_parameter(i + 1, &v.indicator)?;
            stmt.raw_bind_parameter(i + 2, v.year)?;
            stmt.raw_bind_parameter(i + 3, v.raw_value)?;
            stmt.raw_bind_parameter(i + 4, v.normalized_value)
        },
    )
}

/// Loads every indicator value from `from_year` to `to_year` inclusive.
///
/// # Errors
///
/// Returns [`DbError`] if the query fails.
pub fn load_values_between(
    conn: &Connection,
    from_year: i32,
    to_year: i32,
) -> Result<Vec<IndicatorValue>, DbError> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {VALUE_COLUMNS} FROM indicator_values
         WHERE year BETWEEN ? AND ?
         ORDER BY indicator, year, area_code"
    ))?;
    let values = stmt
        .query_map(duckdb::params![from_year, to_year], value_from_row)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(values)
}

/// Loads every indicator value of one year.
///
/// # Errors
///
/// Returns [`DbError`] if the query fails.
pub fn load_values_for_year(conn: &Connection, year: i32) -> Result<Vec<IndicatorValue>, DbError> {
    load_values_between(conn, year, year)
}

/// Loads every stored indicator value with a normalized value.
///
/// # Errors
///
/// Returns [`DbError`] if the query fails.
pub fn load_normalized_values(conn: &Connection) -> Result<Vec<IndicatorValue>, DbError> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {VALUE_COLUMNS} FROM indicator_values
         WHERE normalized_value IS NOT NULL
         ORDER BY indicator, year, area_code"
    ))?;
    let values = stmt
        .query_map([], value_from_row)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(values)
}

/// Upserts district rates of one disaggregation model by
/// `(model, district_code, year)`.
///
/// # Errors
///
/// Returns [`DbError`] if the write fails.
pub fn upsert_district_rates(
    conn: &Connection,
    model: &str,
    rates: &[DistrictRate],
) -> Result<u64, DbError> {
    upsert_chunked(
        conn,
        "district_rates",
        &[
            "model",
            "district_code",
            "year",
            "rate",
            "secondary_rate",
            "population",
        ],
        rates,
        |stmt, i, r| {
            stmt.raw_bind_parameter(i, model)?;
            stmt.raw_bind_parameter(i + 1, &r.district_code)?;
            stmt.raw_bind_parameter(i + 2, r.year)?;
            stmt.raw_bind_parameter(i + 3, r.rate)?;
            stmt.raw_bind_parameter(i + 4, r.secondary_rate)?;
            stmt.raw_bind_parameter(i + 5, r.population.and_then(|p| i64::try_from(p).ok()))
        },
    )
}

/// Loads the district rates of one model for one year.
///
/// # Errors
///
/// Returns [`DbError`] if the query fails.
pub fn load_district_rates(
    conn: &Connection,
    model: &str,
    year: i32,
) -> Result<Vec<DistrictRate>, DbError> {
    let mut stmt = conn.prepare(
        "SELECT district_code, year, rate, secondary_rate, population
         FROM district_rates WHERE model = ? AND year = ?
         ORDER BY district_code",
    )?;
    let rates = stmt
        .query_map(duckdb::params![model, year], |row| {
            Ok(DistrictRate {
                district_code: row.get(0)?,
                year: row.get(1)?,
                rate: row.get(2)?,
                secondary_rate: row.get(3)?,
                population: row
                    .get::<_, Option<i64>>(4)?
                    .and_then(|p| u64::try_from(p).ok()),
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rates)
}

/// Upserts disaggregation results by `(area_code, year, target)`.
///
/// # Errors
///
/// Returns [`DbError`] if the write fails.
pub fn upsert_disaggregation(
    conn: &Connection,
    results: &[DisaggregationResult],
) -> Result<u64, DbError> {
    upsert_chunked(
        conn,
        "disaggregation_results",
        &[
            "area_code",
            "year",
            "target",
            "district_code",
            "estimated_rate",
            "estimated_secondary_rate",
            "propensity_weight",
            "normalized_weight",
            "is_constrained",
            "model_version",
        ],
        results,
        |stmt, i, r| {
            stmt.raw_bind_parameter(i, &r.area_code)?;
            stmt.raw_bind_parameter(i + 1, r.year)?;
            stmt.raw_bind_parameter(i + 2, &r.target)?;
            stmt.raw_bind_parameter(i + 3, &r.district_code)?;
            stmt.raw_bind_parameter(i + 4, r.estimated_rate)?;
            stmt.raw_bind_parameter(i + 5, r.estimated_secondary_rate)?;
            stmt.raw_bind_parameter(i + 6, r.propensity_weight)?;
            stmt.raw_bind_parameter(i + 7, r.normalized_weight)?;
            stmt.raw_bind_parameter(i + 8, r.is_constrained)?;
            stmt.raw_bind_parameter(i + 9, &r.model_version)
        },
    )
}

/// Loads the disaggregation results of one target indicator and year.
///
/// # Errors
///
/// Returns [`DbError`] if the query fails.
pub fn load_disaggregation(
    conn: &Connection,
    target: &str,
    year: i32,
) -> Result<Vec<DisaggregationResult>, DbError> {
    let mut stmt = conn.prepare(
        "SELECT area_code, district_code, year, target, estimated_rate,
                estimated_secondary_rate, propensity_weight, normalized_weight,
                is_constrained, model_version
         FROM disaggregation_results WHERE target = ? AND year = ?
         ORDER BY area_code",
    )?;
    let results = stmt
        .query_map(duckdb::params![target, year], |row| {
            Ok(DisaggregationResult {
                area_code: row.get(0)?,
                district_code: row.get(1)?,
                year: row.get(2)?,
                target: row.get(3)?,
                estimated_rate: row.get(4)?,
                estimated_secondary_rate: row.get(5)?,
                propensity_weight: row.get(6)?,
                normalized_weight: row.get(7)?,
                is_constrained: row.get(8)?,
                model_version: row.get(9)?,
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(results)
}

/// Stores a validation report, replacing any previous one for the same
/// target and year.
///
/// # Errors
///
/// Returns [`DbError`] if the write fails.
pub fn upsert_validation(conn: &Connection, report: &ValidationReport) -> Result<u64, DbError> {
    upsert_chunked(
        conn,
        "validation_reports",
        &["target", "year", "r_squared", "rmse", "districts"],
        std::slice::from_ref(report),
        |stmt, i, r| {
            stmt.raw_bind_parameter(i, &r.target)?;
            stmt.raw_bind_parameter(i + 1, r.year)?;
            stmt.raw_bind_parameter(i + 2, r.r_squared)?;
            stmt.raw_bind_parameter(i + 3, r.rmse)?;
            stmt.raw_bind_parameter(i + 4, i64::try_from(r.districts).unwrap_or(i64::MAX))
        },
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::open_in_memory;

    #[test]
    fn values_upsert_is_idempotent() {
        let conn = open_in_memory().unwrap();
        let mut values = vec![
            IndicatorValue::raw("A", "median_income", 2023, 300_000.0),
            IndicatorValue::raw("A", "median_income", 2024, 310_000.0),
            IndicatorValue::raw("B", "median_income", 2024, 250_000.0),
        ];
        upsert_values(&conn, &values).unwrap();

        values[2].normalized_value = Some(0.0);
        upsert_values(&conn, &values).unwrap();

        assert_eq!(crate::count_rows(&conn, "indicator_values").unwrap(), 3);
        let year = load_values_for_year(&conn, 2024).unwrap();
        assert_eq!(year.len(), 2);
        assert_eq!(load_normalized_values(&conn).unwrap(), vec![values[2].clone()]);
    }

    #[test]
    fn chunking_spans_many_statements() {
        let conn = open_in_memory().unwrap();
        let values: Vec<IndicatorValue> = (0..2_500)
            .map(|i| IndicatorValue::raw(format!("A{i:05}"), "population", 2024, f64::from(i)))
            .collect();

        assert_eq!(upsert_values(&conn, &values).unwrap(), 2_500);
        assert_eq!(load_values_between(&conn, 2020, 2030).unwrap().len(), 2_500);
    }

    #[test]
    fn district_rates_are_scoped_by_model() {
        let conn = open_in_memory().unwrap();
        let rate = DistrictRate {
            district_code: "0180".to_string(),
            year: 2024,
            rate: 10.0,
            secondary_rate: Some(0.4),
            population: Some(980_000),
        };
        upsert_district_rates(&conn, "crime", &[rate.clone()]).unwrap();

        assert_eq!(load_district_rates(&conn, "crime", 2024).unwrap(), vec![rate]);
        assert!(load_district_rates(&conn, "debt", 2024).unwrap().is_empty());
    }

    #[test]
    fn disaggregation_round_trip() {
        let conn = open_in_memory().unwrap();
        let result = DisaggregationResult {
            area_code: "A".to_string(),
            district_code: "D".to_string(),
            year: 2024,
            target: "crime_total_rate".to_string(),
            estimated_rate: 22.857,
            estimated_secondary_rate: None,
            propensity_weight: 0.8,
            normalized_weight: 0.8,
            is_constrained: true,
            model_version: "crime-v1".to_string(),
        };
        upsert_disaggregation(&conn, &[result.clone()]).unwrap();

        assert_eq!(
            load_disaggregation(&conn, "crime_total_rate", 2024).unwrap(),
            vec![result]
        );
    }
}
