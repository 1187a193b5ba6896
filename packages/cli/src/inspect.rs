//! Read-only views of stored stage output.

use area_score_database::{scores, values};
use area_score_score_models::{CompositeScore, DisaggregationResult, IndicatorTrend, ScoreRun};
use area_score_spatial::AreaIndex;

use crate::Context;

type InspectResult<T> = Result<T, Box<dyn std::error::Error>>;

/// The area of `vintage` containing a point, with its stored score for
/// `year` if one exists.
///
/// # Errors
///
/// Returns an error if the boundaries or scores cannot be loaded.
pub fn locate(
    ctx: &Context,
    lng: f64,
    lat: f64,
    vintage: &str,
    year: i32,
) -> InspectResult<Option<(String, Option<CompositeScore>)>> {
    let index = AreaIndex::load(&ctx.conn, vintage)?;
    let Some(code) = index.lookup(lng, lat) else {
        return Ok(None);
    };

    let score = scores::load_scores(&ctx.conn, year)?
        .into_iter()
        .find(|s| s.area_code == code);

    Ok(Some((code.to_string(), score)))
}

/// Prints the result of [`locate`].
pub fn print_location(found: Option<&(String, Option<CompositeScore>)>, year: i32) {
    let Some((code, score)) = found else {
        println!("No area contains that point");
        return;
    };

    let Some(score) = score else {
        println!("{code}: no {year} score");
        return;
    };

    println!("{code}: {:.1} in {year}", score.score);
    if let Some(raw) = score.raw_score_before_penalties {
        println!("  before penalties: {raw:.1}");
    }
    for (label, delta) in [("1y", score.trend_1y), ("3y", score.trend_3y)] {
        if let Some(delta) = delta {
            println!("  {label} change: {delta:+.1}");
        }
    }
    if !score.top_positive.is_empty() {
        println!("  strengths: {}", score.top_positive.join(", "));
    }
    if !score.top_negative.is_empty() {
        println!("  weaknesses: {}", score.top_negative.join(", "));
    }
    for (indicator, from) in &score.fallback_years {
        println!("  {indicator} taken from {from}");
    }
}

/// Score runs of one year, newest first.
///
/// # Errors
///
/// Returns an error if the query fails.
pub fn runs(ctx: &Context, year: i32) -> InspectResult<Vec<ScoreRun>> {
    Ok(scores::load_score_runs(&ctx.conn, year)?)
}

/// Prints score runs as a table.
pub fn print_runs(runs: &[ScoreRun]) {
    println!(
        "{:<36} {:<25} {:>6} {:>7} {:>7} CONFIG",
        "RUN", "COMPUTED", "AREAS", "MEAN", "STDDEV"
    );
    println!("{}", "-".repeat(98));
    for run in runs {
        println!(
            "{:<36} {:<25} {:>6} {:>7.2} {:>7.2} {}",
            run.id,
            run.computed_at,
            run.area_count,
            run.mean_score,
            run.stddev_score,
            run.config_fingerprint.get(..12).unwrap_or(&run.config_fingerprint)
        );
    }
}

/// Stored trends of one window, optionally for one area, hiding those
/// below the configured confidence unless `all` is set.
///
/// # Errors
///
/// Returns an error if the query fails.
pub fn trends(
    ctx: &Context,
    base_year: i32,
    end_year: i32,
    area: Option<&str>,
    all: bool,
) -> InspectResult<Vec<IndicatorTrend>> {
    let min_confidence = ctx.config.trend.min_confidence;
    let stored = scores::load_trends(&ctx.conn, base_year, end_year)?;

    Ok(stored
        .into_iter()
        .filter(|t| area.is_none_or(|code| t.area_code == code))
        .filter(|t| all || t.is_displayable(min_confidence))
        .collect())
}

/// Prints trends as a table.
pub fn print_trends(trends: &[IndicatorTrend]) {
    println!(
        "{:<14} {:<28} {:>12} {:>8} {:<12} {:>5}",
        "AREA", "INDICATOR", "CHANGE", "PCT", "DIRECTION", "CONF"
    );
    println!("{}", "-".repeat(84));
    for t in trends {
        let change = t.absolute_change.map_or_else(|| "-".to_string(), |c| format!("{c:+.2}"));
        let pct = t.percent_change.map_or_else(|| "-".to_string(), |p| format!("{p:+.1}%"));
        println!(
            "{:<14} {:<28} {change:>12} {pct:>8} {:<12} {:>5.2}",
            t.area_code,
            t.indicator,
            t.direction.to_string(),
            t.confidence
        );
    }
}

/// Stored disaggregation estimates of a target indicator, optionally for
/// one district.
///
/// # Errors
///
/// Returns an error if the query fails.
pub fn disaggregation(
    ctx: &Context,
    target: &str,
    year: i32,
    district: Option<&str>,
) -> InspectResult<Vec<DisaggregationResult>> {
    Ok(values::load_disaggregation(&ctx.conn, target, year)?
        .into_iter()
        .filter(|r| district.is_none_or(|code| r.district_code == code))
        .collect())
}

/// Prints disaggregation estimates as a table.
pub fn print_disaggregation(results: &[DisaggregationResult]) {
    println!(
        "{:<14} {:<10} {:>10} {:>10} {:>8} {:>8}",
        "AREA", "DISTRICT", "RATE", "SECONDARY", "WEIGHT", "SHARE"
    );
    println!("{}", "-".repeat(65));
    for r in results {
        let secondary = r
            .estimated_secondary_rate
            .map_or_else(|| "-".to_string(), |s| format!("{s:.3}"));
        println!(
            "{:<14} {:<10} {:>10.3} {secondary:>10} {:>8.3} {:>8.3}",
            r.area_code, r.district_code, r.estimated_rate, r.propensity_weight, r.normalized_weight
        );
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use area_score_cli_utils::MultiProgress;
    use area_score_config::PipelineConfig;
    use area_score_database::areas;
    use area_score_score_models::TrendDirection;

    use super::*;

    fn context() -> Context {
        Context {
            config: PipelineConfig::load(None).unwrap(),
            conn: area_score_database::open_in_memory().unwrap(),
            multi: MultiProgress::new(),
        }
    }

    fn square(x0: f64, y0: f64, x1: f64, y1: f64) -> String {
        format!(
            r#"{{"type":"Polygon","coordinates":[[[{x0},{y0}],[{x1},{y0}],[{x1},{y1}],[{x0},{y1}],[{x0},{y0}]]]}}"#
        )
    }

    fn score(code: &str, value: f64) -> CompositeScore {
        CompositeScore {
            area_code: code.to_string(),
            year: 2024,
            score: value,
            raw_score_before_penalties: None,
            trend_1y: None,
            trend_3y: None,
            factor_scores: BTreeMap::new(),
            top_positive: Vec::new(),
            top_negative: Vec::new(),
            penalties_applied: Vec::new(),
            fallback_years: BTreeMap::new(),
        }
    }

    #[test]
    fn locate_finds_the_containing_area_and_its_score() {
        let ctx = context();
        areas::upsert_geometries(
            &ctx.conn,
            "2024",
            &[
                ("A".to_string(), square(0.0, 0.0, 1.0, 1.0)),
                ("B".to_string(), square(1.0, 0.0, 2.0, 1.0)),
            ],
        )
        .unwrap();
        scores::replace_scores(&ctx.conn, 2024, &[score("A", 61.5)]).unwrap();

        let (code, found) = locate(&ctx, 0.5, 0.5, "2024", 2024).unwrap().unwrap();
        assert_eq!(code, "A");
        assert_eq!(found.map(|s| s.score), Some(61.5));

        let (code, found) = locate(&ctx, 1.5, 0.5, "2024", 2024).unwrap().unwrap();
        assert_eq!(code, "B");
        assert!(found.is_none());

        assert!(locate(&ctx, 5.0, 5.0, "2024", 2024).unwrap().is_none());
    }

    #[test]
    fn low_confidence_trends_are_hidden_unless_asked() {
        let ctx = context();
        let trend = |code: &str, confidence: f64| IndicatorTrend {
            area_code: code.to_string(),
            indicator: "median_income".to_string(),
            base_year: 2019,
            end_year: 2024,
            data_points: 2,
            absolute_change: Some(1.0),
            percent_change: Some(5.0),
            direction: TrendDirection::Rising,
            confidence,
        };
        scores::upsert_trends(&ctx.conn, &[trend("A", 1.0), trend("B", 0.01)]).unwrap();

        let shown = trends(&ctx, 2019, 2024, None, false).unwrap();
        assert_eq!(shown, vec![trend("A", 1.0)]);

        assert_eq!(trends(&ctx, 2019, 2024, None, true).unwrap().len(), 2);
        assert_eq!(
            trends(&ctx, 2019, 2024, Some("B"), true).unwrap(),
            vec![trend("B", 0.01)]
        );
    }
}
