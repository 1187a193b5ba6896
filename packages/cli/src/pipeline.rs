//! Full pipeline run and the interactive stage picker.

use std::time::Instant;

use area_score_cli_utils::IndicatifProgress;
use area_score_config::progress::StageProgress;
use dialoguer::{Input, Select};

use crate::{Context, stages};

/// Stages of a full run, in execution order.
#[derive(Clone, Copy)]
enum Step {
    NormalizeCovariates,
    Disaggregate,
    Normalize,
    Score,
    Trends,
    BuildGrid,
    Project,
    Smooth,
}

impl Step {
    const ALL: &[Self] = &[
        Self::NormalizeCovariates,
        Self::Disaggregate,
        Self::Normalize,
        Self::Score,
        Self::Trends,
        Self::BuildGrid,
        Self::Project,
        Self::Smooth,
    ];

    const fn label(self) -> &'static str {
        match self {
            Self::NormalizeCovariates => "Normalize covariates",
            Self::Disaggregate => "Disaggregate district rates",
            Self::Normalize => "Normalize indicators",
            Self::Score => "Compose scores",
            Self::Trends => "Compute trends",
            Self::BuildGrid => "Map areas to hexes",
            Self::Project => "Project scores",
            Self::Smooth => "Smooth and roll up",
        }
    }
}

/// Options of a full run.
pub struct RunOptions<'a> {
    /// Year to disaggregate, normalize, score and project.
    pub year: i32,
    /// Boundary vintage the hex mapping is built from.
    pub vintage: &'a str,
    /// Trends cover `year - trend_years ..= year`.
    pub trend_years: i32,
    /// Reuse the stored hex mapping.
    pub skip_grid_build: bool,
}

/// Runs every stage for one year, in order.
///
/// Disaggregated estimates become raw indicator values, so indicators are
/// normalized twice: once so disaggregation can read covariate
/// percentiles, and again to pick up the new estimates.
///
/// # Errors
///
/// Returns the first stage error.
pub fn run(ctx: &Context, options: &RunOptions<'_>) -> Result<(), Box<dyn std::error::Error>> {
    let start = Instant::now();
    let year = options.year;
    let steps = IndicatifProgress::run(&ctx.multi, year, Step::ALL.len());

    for step in Step::ALL {
        steps.step(step.label());

        match step {
            Step::NormalizeCovariates => {
                if let Err(e) = stages::normalize(ctx, year) {
                    log::warn!("Covariate normalization skipped: {e}");
                }
            }
            Step::Disaggregate => {
                let written = stages::disaggregate(ctx, year, None, true)?;
                log::info!("Disaggregated {written} area estimates");
            }
            Step::Normalize => {
                stages::normalize(ctx, year)?;
            }
            Step::Score => stages::score(ctx, year)?,
            Step::Trends => stages::trends(ctx, year - options.trend_years, year)?,
            Step::BuildGrid => {
                if options.skip_grid_build {
                    log::info!("Reusing the stored hex mapping");
                } else {
                    stages::build_grid(ctx, options.vintage, None)?;
                }
            }
            Step::Project => stages::project(ctx, year)?,
            Step::Smooth => stages::smooth(ctx, year, None)?,
        }

        steps.advance(1);
    }

    steps.done(&format!("Pipeline {year} done in {:.1?}", start.elapsed()));
    Ok(())
}

/// Stages offered by the interactive picker.
#[derive(Clone, Copy)]
enum Choice {
    Run,
    ClassifyUrbanity,
    Disaggregate,
    Normalize,
    Score,
    Drift,
    Trends,
    Project,
    Smooth,
}

impl Choice {
    const ALL: &[Self] = &[
        Self::Run,
        Self::ClassifyUrbanity,
        Self::Disaggregate,
        Self::Normalize,
        Self::Score,
        Self::Drift,
        Self::Trends,
        Self::Project,
        Self::Smooth,
    ];

    const fn label(self) -> &'static str {
        match self {
            Self::Run => "Run full pipeline",
            Self::ClassifyUrbanity => "Classify urbanity",
            Self::Disaggregate => "Disaggregate district rates",
            Self::Normalize => "Normalize indicators",
            Self::Score => "Compose scores",
            Self::Drift => "Check score drift",
            Self::Trends => "Compute trends",
            Self::Project => "Project scores onto hexes",
            Self::Smooth => "Smooth hex scores",
        }
    }

    const fn needs_year(self) -> bool {
        !matches!(self, Self::ClassifyUrbanity)
    }
}

/// Prompts for a stage and its year, then runs it.
///
/// # Errors
///
/// Returns an error if a prompt or the chosen stage fails.
pub fn interactive(ctx: &Context) -> Result<(), Box<dyn std::error::Error>> {
    println!("Area Score Pipeline (config {})", ctx.config.short_fingerprint());
    println!();

    let labels: Vec<&str> = Choice::ALL.iter().map(|c| c.label()).collect();
    let idx = Select::new()
        .with_prompt("What would you like to do?")
        .items(&labels)
        .default(0)
        .interact()?;
    let choice = Choice::ALL[idx];

    let year = if choice.needs_year() {
        Input::<i32>::new().with_prompt("Year").interact_text()?
    } else {
        0
    };

    match choice {
        Choice::Run => {
            let vintage: String = Input::new()
                .with_prompt("Boundary vintage")
                .default("current".to_string())
                .interact_text()?;
            run(
                ctx,
                &RunOptions {
                    year,
                    vintage: &vintage,
                    trend_years: 5,
                    skip_grid_build: false,
                },
            )?;
        }
        Choice::ClassifyUrbanity => stages::classify(ctx)?,
        Choice::Disaggregate => {
            stages::disaggregate(ctx, year, None, true)?;
        }
        Choice::Normalize => {
            stages::normalize(ctx, year)?;
        }
        Choice::Score => stages::score(ctx, year)?,
        Choice::Drift => {
            let report = stages::drift(ctx, year)?;
            print_drift(&report);
        }
        Choice::Trends => {
            let base_year = Input::<i32>::new()
                .with_prompt("Base year")
                .default(year - 5)
                .interact_text()?;
            stages::trends(ctx, base_year, year)?;
        }
        Choice::Project => stages::project(ctx, year)?,
        Choice::Smooth => {
            let names: Vec<&str> = ctx.config.smoothing.iter().map(|p| p.name.as_str()).collect();
            let default = names
                .iter()
                .position(|n| *n == ctx.config.grid.default_smoothing)
                .unwrap_or(0);
            let preset = Select::new()
                .with_prompt("Smoothing preset")
                .items(&names)
                .default(default)
                .interact()?;
            stages::smooth(ctx, year, names.get(preset).copied())?;
        }
    }

    Ok(())
}

/// Prints a drift report as a table of the largest movers.
pub fn print_drift(report: &area_score_score_models::DriftReport) {
    println!(
        "{} areas compared: mean drift {:.2}, max drift {:.2}",
        report.total_areas, report.mean_drift, report.max_drift
    );
    println!(
        "mean {:.2} -> {:.2}, stddev {:.2} -> {:.2}",
        report.mean_score_old, report.mean_score_new, report.stddev_old, report.stddev_new
    );

    if report.areas_with_large_drift.is_empty() {
        return;
    }

    println!();
    println!("{:<16} {:>8} {:>8} {:>8}", "AREA", "OLD", "NEW", "DRIFT");
    println!("{}", "-".repeat(43));
    for area in &report.areas_with_large_drift {
        println!(
            "{:<16} {:>8.2} {:>8.2} {:>+8.2}",
            area.area_code, area.old_score, area.new_score, area.drift
        );
    }
}
