//! One function per pipeline stage: load inputs from the store, run the
//! stage, write its output back.

use area_score_cli_utils::IndicatifProgress;
use area_score_crosswalk::AreaCrosswalk;
use area_score_database::{areas, grid, scores, values};
use area_score_disaggregate::{
    Disaggregator, covariate_percentiles, group_fine_areas, strongest_vulnerability,
};
use area_score_geography_models::CrosswalkMapping;
use area_score_grid::{GridProjector, SpatialSmoother, rollup};
use area_score_normalize::{NormalizationSummary, Normalizer, classify_urbanity, tiers_by_code};
use area_score_score::{ScoreComposer, attach_deltas, drift_report, score_run};
use area_score_score_models::{CompositeScore, DriftReport};
use area_score_spatial::AreaIndex;
use area_score_trend::TrendComputer;

use crate::Context;

type StageResult<T> = Result<T, Box<dyn std::error::Error>>;

/// Validates and stores crosswalk rows, then marks areas whose boundaries
/// changed as trend-ineligible.
///
/// # Errors
///
/// Returns an error if a fraction is invalid or a write fails.
pub fn store_crosswalk(ctx: &Context, mappings: Vec<CrosswalkMapping>) -> StageResult<()> {
    let settings = &ctx.config.crosswalk;
    let crosswalk = AreaCrosswalk::new(mappings.iter().cloned(), settings.min_overlap)?;

    let report = crosswalk.validate(settings.overlap_sum_tolerance);
    log::info!(
        "Crosswalk: {} old codes -> {} new codes, {:?}",
        report.distinct_old,
        report.distinct_new,
        report.type_counts
    );
    for (code, sum) in &report.bad_sums {
        log::warn!("Overlap fractions of {code} sum to {sum:.3}");
    }

    areas::upsert_crosswalk(&ctx.conn, &mappings)?;

    let current = areas::load_areas(&ctx.conn)?;
    let changed = crosswalk.changed_codes(current.iter().map(|a| a.code.as_str()));
    areas::set_trend_eligibility(&ctx.conn, &changed)?;
    log::info!(
        "{} of {} areas are not trend-eligible",
        changed.len(),
        current.len()
    );

    Ok(())
}

/// Computes a crosswalk from the polygon overlap of two stored boundary
/// vintages.
///
/// # Errors
///
/// Returns an error if either vintage cannot be loaded or the result
/// cannot be stored.
pub fn build_crosswalk(ctx: &Context, old_vintage: &str, new_vintage: &str) -> StageResult<()> {
    let old = AreaIndex::load(&ctx.conn, old_vintage)?;
    let new = AreaIndex::load(&ctx.conn, new_vintage)?;
    if old.is_empty() || new.is_empty() {
        return Err(format!(
            "Vintages {old_vintage} ({} areas) and {new_vintage} ({} areas) must both have boundaries",
            old.len(),
            new.len()
        )
        .into());
    }

    let mappings =
        area_score_spatial::build_crosswalk(&old, &new, ctx.config.crosswalk.min_overlap);
    store_crosswalk(ctx, mappings)
}

/// Assigns urbanity tiers from population density.
///
/// # Errors
///
/// Returns an error if the areas cannot be loaded or stored.
pub fn classify(ctx: &Context) -> StageResult<()> {
    let mut all = areas::load_areas(&ctx.conn)?;
    classify_urbanity(&mut all);
    areas::upsert_areas(&ctx.conn, &all)?;
    Ok(())
}

/// Disaggregates district rates into area estimates.
///
/// With `model` unset, every configured model that has district rates for
/// the year runs. Returns the number of area estimates written.
///
/// # Errors
///
/// Returns an error if a named model is unknown, has no rates, or a write
/// fails.
pub fn disaggregate(
    ctx: &Context,
    year: i32,
    model: Option<&str>,
    validate: bool,
) -> StageResult<usize> {
    let models: Vec<&str> = match model {
        Some(name) => vec![name],
        None => ctx
            .config
            .disaggregation
            .models
            .keys()
            .map(String::as_str)
            .collect(),
    };

    let all_areas = areas::load_areas(&ctx.conn)?;
    let vulnerability = areas::load_vulnerability(&ctx.conn)?;
    let year_values = values::load_values_for_year(&ctx.conn, year)?;
    let mut written = 0;

    for name in models {
        let propensity = ctx.config.model(name)?;
        let rates = values::load_district_rates(&ctx.conn, name, year)?;
        if rates.is_empty() && model.is_none() {
            log::info!("No {year} district rates for model {name}; skipping");
            continue;
        }

        let tiers = strongest_vulnerability(&vulnerability, propensity.vulnerability_min_overlap);
        let percentiles = covariate_percentiles(propensity, &year_values);
        let grouped = group_fine_areas(&all_areas, &percentiles, &tiers);

        let disaggregator = Disaggregator::new(propensity);
        let progress = IndicatifProgress::stage(&ctx.multi, &format!("Disaggregating {name}"));
        let results = disaggregator.disaggregate(year, &rates, &grouped, &progress)?;

        values::upsert_disaggregation(&ctx.conn, &results)?;
        values::upsert_values(&ctx.conn, &disaggregator.to_indicator_values(&results))?;
        written += results.len();

        if validate {
            match disaggregator.validate(year, &rates, &grouped) {
                Some(report) => {
                    log::info!(
                        "{name} {year}: R² {:.3}, RMSE {:.3} over {} districts",
                        report.r_squared,
                        report.rmse,
                        report.districts
                    );
                    values::upsert_validation(&ctx.conn, &report)?;
                }
                None => log::warn!("{name} {year}: too few districts to validate"),
            }
        }
    }

    Ok(written)
}

/// Normalizes every active indicator for one year.
///
/// # Errors
///
/// Returns an error if no active indicator has data or a write fails.
pub fn normalize(ctx: &Context, year: i32) -> StageResult<NormalizationSummary> {
    let tiers = tiers_by_code(&areas::load_areas(&ctx.conn)?);
    if tiers.is_empty() {
        log::warn!("No urbanity tiers assigned; stratified indicators use national ranking");
    }

    let mut rows = values::load_values_for_year(&ctx.conn, year)?;
    let summary = Normalizer::new(&ctx.config).normalize_all(year, &mut rows, &tiers)?;
    values::upsert_values(&ctx.conn, &rows)?;

    Ok(summary)
}

/// Computes trends for the window `base_year..=end_year`.
///
/// # Errors
///
/// Returns an error if the window is invalid or a write fails.
pub fn trends(ctx: &Context, base_year: i32, end_year: i32) -> StageResult<()> {
    let breaks = areas::load_breaks(&ctx.conn)?;
    let window = values::load_values_between(&ctx.conn, base_year, end_year)?;
    let ineligible = areas::trend_ineligible_codes(&ctx.conn)?;

    let summary =
        TrendComputer::new(&ctx.config, &breaks).compute_all(base_year, end_year, &window, &ineligible)?;
    scores::upsert_trends(&ctx.conn, &summary.trends)?;

    let displayable = summary
        .trends
        .iter()
        .filter(|t| t.is_displayable(ctx.config.trend.min_confidence))
        .count();
    log::info!(
        "{} trends for {base_year}-{end_year} across {} indicators ({displayable} displayable)",
        summary.trends.len(),
        summary.indicators
    );

    Ok(())
}

/// Composes scores for `year` with one- and three-year deltas from the
/// stored scores of earlier years.
fn compose(ctx: &Context, year: i32) -> StageResult<Vec<CompositeScore>> {
    let normalized = values::load_normalized_values(&ctx.conn)?;
    let vulnerability = areas::load_vulnerability(&ctx.conn)?;

    let progress = IndicatifProgress::stage(&ctx.multi, &format!("Scoring {year}"));
    let mut composed = ScoreComposer::new(&ctx.config).compute_scores(
        year,
        &normalized,
        &vulnerability,
        &progress,
    )?;

    attach_deltas(
        &mut composed,
        &scores::scores_for_year(&ctx.conn, year - 1)?,
        &scores::scores_for_year(&ctx.conn, year - 3)?,
    );

    Ok(composed)
}

fn log_drift(year: i32, report: &DriftReport) {
    log::info!(
        "Drift {year}: {} areas, mean {:.2}, max {:.2}; mean {:.2} -> {:.2}, stddev {:.2} -> {:.2}",
        report.total_areas,
        report.mean_drift,
        report.max_drift,
        report.mean_score_old,
        report.mean_score_new,
        report.stddev_old,
        report.stddev_new
    );
    if !report.areas_with_large_drift.is_empty() {
        log::warn!(
            "{} areas drifted more than the threshold",
            report.areas_with_large_drift.len()
        );
    }
}

/// Computes composite scores for one year and replaces the stored ones,
/// recording a score run and logging drift against the scores it replaces.
/// Areas that no longer have data lose their stored score.
///
/// # Errors
///
/// Returns an error if scoring fails or a write fails.
pub fn score(ctx: &Context, year: i32) -> StageResult<()> {
    let composed = compose(ctx, year)?;

    let previous = scores::scores_for_year(&ctx.conn, year)?;
    if !previous.is_empty() {
        log_drift(
            year,
            &drift_report(&previous, &composed, ctx.config.scoring.drift_threshold),
        );
    }

    scores::replace_scores(&ctx.conn, year, &composed)?;
    let run = score_run(year, &composed, ctx.config.fingerprint());
    scores::insert_score_run(&ctx.conn, &run)?;
    log::info!(
        "Score run {} ({}): {} areas, mean {:.2}, stddev {:.2}",
        run.id,
        ctx.config.short_fingerprint(),
        run.area_count,
        run.mean_score,
        run.stddev_score
    );

    Ok(())
}

/// Recomputes scores for `year` without storing them and reports the
/// drift from the stored scores.
///
/// # Errors
///
/// Returns an error if scoring fails or no scores are stored for the year.
pub fn drift(ctx: &Context, year: i32) -> StageResult<DriftReport> {
    let previous = scores::scores_for_year(&ctx.conn, year)?;
    if previous.is_empty() {
        return Err(format!("No stored {year} scores to compare against").into());
    }

    let composed = compose(ctx, year)?;
    let report = drift_report(&previous, &composed, ctx.config.scoring.drift_threshold);
    log_drift(year, &report);

    Ok(report)
}

fn resolution_or_default(ctx: &Context, resolution: Option<u8>) -> u8 {
    resolution.unwrap_or(ctx.config.grid.resolution)
}

/// Maps every area of a boundary vintage onto hex cells.
///
/// # Errors
///
/// Returns an error if the resolution is invalid, the vintage has no
/// boundaries, or the write fails.
pub fn build_grid(ctx: &Context, vintage: &str, resolution: Option<u8>) -> StageResult<()> {
    let projector = GridProjector::new(resolution_or_default(ctx, resolution))?;
    let index = AreaIndex::load(&ctx.conn, vintage)?;
    if index.is_empty() {
        return Err(format!("No boundaries stored for vintage {vintage}").into());
    }

    let progress = IndicatifProgress::stage(
        &ctx.multi,
        &format!("Mapping {vintage} areas to resolution {}", projector.resolution()),
    );
    let mapping = projector.build_mapping(&index, &progress);

    grid::replace_hex_mapping(&ctx.conn, projector.resolution(), &mapping)?;
    log::info!(
        "Mapped {} areas to {} hex assignments at resolution {}",
        index.len(),
        mapping.len(),
        projector.resolution()
    );

    Ok(())
}

/// Projects stored composite scores onto the hex grid, replacing the
/// year's cells at the grid resolution.
///
/// # Errors
///
/// Returns an error if no mapping or no scores exist, or the write fails.
pub fn project(ctx: &Context, year: i32) -> StageResult<()> {
    let projector = GridProjector::new(ctx.config.grid.resolution)?;
    let mapping = grid::load_hex_mapping(&ctx.conn, projector.resolution())?;
    if mapping.is_empty() {
        return Err(format!(
            "No hex mapping at resolution {}; run build-grid first",
            projector.resolution()
        )
        .into());
    }

    let composed = scores::load_scores(&ctx.conn, year)?;
    let cells = projector.project(year, &mapping, &composed)?;
    grid::replace_hex_scores(&ctx.conn, year, projector.resolution(), &cells)?;
    log::info!("Projected {year} scores onto {} cells", cells.len());

    Ok(())
}

/// Smooths the projected cells of one year and rolls them up to the
/// configured coarser resolutions.
///
/// # Errors
///
/// Returns an error if the preset is unknown, no cells are projected, or
/// a write fails.
pub fn smooth(ctx: &Context, year: i32, preset: Option<&str>) -> StageResult<()> {
    let preset = match preset {
        Some(name) => ctx.config.smoothing_preset(name)?,
        None => ctx.config.default_smoothing()?,
    };

    let resolution = ctx.config.grid.resolution;
    let mut cells = grid::load_hex_scores(&ctx.conn, year, resolution)?;
    if cells.is_empty() {
        return Err(format!("No projected {year} cells at resolution {resolution}").into());
    }

    let diagnostics = SpatialSmoother::new(preset).smooth(&mut cells)?;
    grid::replace_hex_scores(&ctx.conn, year, resolution, &cells)?;
    log::debug!("Smoothing diagnostics: {diagnostics:?}");

    for target in &ctx.config.grid.rollup_resolutions {
        let parents = rollup(&cells, *target)?;
        grid::replace_hex_scores(&ctx.conn, year, *target, &parents)?;
        log::info!("Rolled {year} up to {} cells at resolution {target}", parents.len());
    }

    Ok(())
}

/// Smoothing preset names with their weights, in configuration order.
#[must_use]
pub fn preset_rows(ctx: &Context) -> Vec<[String; 5]> {
    let default = &ctx.config.grid.default_smoothing;
    ctx.config
        .smoothing
        .iter()
        .map(|p| {
            let marker = if &p.name == default { "*" } else { "" };
            [
                format!("{}{marker}", p.name),
                format!("{:.2}", p.self_weight),
                format!("{:.2}", p.neighbor_weight),
                p.k_rings.to_string(),
                p.decay.to_string(),
            ]
        })
        .collect()
}
