#![cfg_attr(feature = "fail-on-warnings", deny(warnings))]
#![warn(clippy::all, clippy::pedantic, clippy::nursery, clippy::cargo)]
#![allow(clippy::multiple_crate_versions, clippy::cargo_common_metadata)]

//! `area_score`: imports inputs, runs pipeline stages, and inspects their
//! output.
//!
//! Every stage reads its inputs from and writes its outputs to one `DuckDB`
//! file, so stages can run one at a time or chained with `run`. Without a
//! subcommand an interactive stage picker starts.
//!
//! Uses `indicatif-log-bridge` (via [`area_score_cli_utils::init_logger`])
//! so log lines and progress bars never fight for the terminal.

mod import;
mod inspect;
mod pipeline;
mod stages;

use std::path::PathBuf;

use area_score_cli_utils::MultiProgress;
use area_score_config::PipelineConfig;
use area_score_database::Connection;
use clap::{Parser, Subcommand};

/// Shared state for every command.
pub struct Context {
    /// Configuration snapshot every stage reads.
    pub config: PipelineConfig,
    /// The pipeline database.
    pub conn: Connection,
    /// Holder of every progress bar, shared with the logger.
    pub multi: MultiProgress,
}

#[derive(Parser)]
#[command(name = "area_score", about = "Area quality score pipeline")]
struct Cli {
    /// Pipeline configuration TOML. Defaults to the embedded configuration.
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    /// `DuckDB` file. Defaults to `area_score.duckdb` in the data directory.
    #[arg(long, global = true)]
    db: Option<PathBuf>,
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Import area boundaries and attributes from a `GeoJSON` feature collection
    ImportAreas {
        /// `GeoJSON` file
        file: PathBuf,
        /// Boundary vintage label (e.g., "2024")
        #[arg(long, default_value = "current")]
        vintage: String,
        /// Feature property holding the area code
        #[arg(long, default_value = "code")]
        code_property: String,
        /// Feature property holding the district code
        #[arg(long, default_value = "district_code")]
        district_property: String,
        /// Feature property holding the region code
        #[arg(long, default_value = "region_code")]
        region_property: String,
        /// Feature property holding the population
        #[arg(long, default_value = "population")]
        population_property: String,
        /// Feature property holding the land area in km²
        #[arg(long, default_value = "land_area_km2")]
        land_area_property: String,
    },
    /// Import raw indicator values (`area_code,indicator,year,raw_value`)
    ImportValues {
        /// CSV file
        file: PathBuf,
        /// Codes are from the previous boundary vintage; remap them through
        /// the stored crosswalk
        #[arg(long)]
        remap: bool,
    },
    /// Import district rates for a disaggregation model
    /// (`district_code,year,rate,secondary_rate,population`)
    ImportDistrictRates {
        /// Disaggregation model name (e.g., "crime")
        model: String,
        /// CSV file
        file: PathBuf,
    },
    /// Import vulnerability-area overlaps (`area_code,tier,overlap_fraction`)
    ImportVulnerability {
        /// CSV file
        file: PathBuf,
    },
    /// Import methodology breaks (`indicator,year_affected,breaks_trend,description`)
    ImportBreaks {
        /// CSV file
        file: PathBuf,
    },
    /// Import a precomputed crosswalk
    /// (`old_code,new_code,overlap_fraction,reverse_fraction`)
    ImportCrosswalk {
        /// CSV file
        file: PathBuf,
    },
    /// Build a crosswalk from the polygon overlap of two stored vintages
    BuildCrosswalk {
        /// Previous boundary vintage
        #[arg(long)]
        old_vintage: String,
        /// Current boundary vintage
        #[arg(long, default_value = "current")]
        new_vintage: String,
    },
    /// Assign urbanity tiers from population density
    ClassifyUrbanity,
    /// Spread district rates over their fine areas
    Disaggregate {
        #[arg(long)]
        year: i32,
        /// Only this model (default: every model with rates for the year)
        #[arg(long)]
        model: Option<String>,
        /// Also fit estimates against district rates and store the report
        #[arg(long)]
        validate: bool,
    },
    /// Normalize every active indicator for a year
    Normalize {
        #[arg(long)]
        year: i32,
    },
    /// Compute indicator trends over a window
    Trends {
        #[arg(long)]
        base_year: i32,
        #[arg(long)]
        end_year: i32,
    },
    /// Compose and store composite scores for a year
    Score {
        #[arg(long)]
        year: i32,
    },
    /// Recompute scores without storing them and report drift from the
    /// stored scores
    Drift {
        #[arg(long)]
        year: i32,
    },
    /// Map areas of a boundary vintage onto hex cells
    BuildGrid {
        #[arg(long, default_value = "current")]
        vintage: String,
        /// H3 resolution (default from configuration)
        #[arg(long)]
        resolution: Option<u8>,
    },
    /// Project stored scores onto the hex grid
    Project {
        #[arg(long)]
        year: i32,
    },
    /// Smooth projected hex scores and roll them up
    Smooth {
        #[arg(long)]
        year: i32,
        /// Smoothing preset (default from configuration)
        #[arg(long)]
        preset: Option<String>,
    },
    /// Run every stage for a year
    Run {
        #[arg(long)]
        year: i32,
        /// Boundary vintage to grid
        #[arg(long, default_value = "current")]
        vintage: String,
        /// Trend window length in years
        #[arg(long, default_value = "5")]
        trend_years: i32,
        /// Reuse the stored hex mapping instead of rebuilding it
        #[arg(long)]
        skip_grid_build: bool,
    },
    /// List smoothing presets
    Presets,
    /// Show the area containing a point and its stored score
    Locate {
        /// Longitude
        #[arg(long, allow_hyphen_values = true)]
        lng: f64,
        /// Latitude
        #[arg(long, allow_hyphen_values = true)]
        lat: f64,
        #[arg(long)]
        year: i32,
        #[arg(long, default_value = "current")]
        vintage: String,
    },
    /// List the score runs recorded for a year
    Runs {
        #[arg(long)]
        year: i32,
    },
    /// Show stored trends of a window
    ShowTrends {
        #[arg(long)]
        base_year: i32,
        #[arg(long)]
        end_year: i32,
        /// Only this area
        #[arg(long)]
        area: Option<String>,
        /// Include trends below the display confidence
        #[arg(long)]
        all: bool,
    },
    /// Show stored disaggregation estimates of a target indicator
    ShowDisaggregation {
        /// Target indicator (e.g., "crime_total_rate")
        target: String,
        #[arg(long)]
        year: i32,
        /// Only this district
        #[arg(long)]
        district: Option<String>,
    },
}

#[allow(clippy::too_many_lines)]
fn main() -> Result<(), Box<dyn std::error::Error>> {
    let multi = area_score_cli_utils::init_logger();
    let cli = Cli::parse();

    let config = PipelineConfig::load(cli.config.as_deref())?;
    log::info!("Loaded configuration {}", config.short_fingerprint());

    let conn = match &cli.db {
        Some(path) => area_score_database::open(path)?,
        None => area_score_database::open_default()?,
    };

    let ctx = Context {
        config,
        conn,
        multi,
    };

    let Some(command) = cli.command else {
        return pipeline::interactive(&ctx);
    };

    match command {
        Commands::ImportAreas {
            file,
            vintage,
            code_property,
            district_property,
            region_property,
            population_property,
            land_area_property,
        } => {
            import::areas(
                &ctx,
                &file,
                &vintage,
                &import::AreaProperties {
                    code: &code_property,
                    district: &district_property,
                    region: &region_property,
                    population: &population_property,
                    land_area: &land_area_property,
                },
            )?;
        }
        Commands::ImportValues { file, remap } => import::values(&ctx, &file, remap)?,
        Commands::ImportDistrictRates { model, file } => {
            import::district_rates(&ctx, &model, &file)?;
        }
        Commands::ImportVulnerability { file } => import::vulnerability(&ctx, &file)?,
        Commands::ImportBreaks { file } => import::breaks(&ctx, &file)?,
        Commands::ImportCrosswalk { file } => import::crosswalk(&ctx, &file)?,
        Commands::BuildCrosswalk {
            old_vintage,
            new_vintage,
        } => stages::build_crosswalk(&ctx, &old_vintage, &new_vintage)?,
        Commands::ClassifyUrbanity => stages::classify(&ctx)?,
        Commands::Disaggregate {
            year,
            model,
            validate,
        } => {
            let written = stages::disaggregate(&ctx, year, model.as_deref(), validate)?;
            log::info!("Disaggregated {written} area estimates");
        }
        Commands::Normalize { year } => {
            stages::normalize(&ctx, year)?;
        }
        Commands::Trends {
            base_year,
            end_year,
        } => stages::trends(&ctx, base_year, end_year)?,
        Commands::Score { year } => stages::score(&ctx, year)?,
        Commands::Drift { year } => {
            let report = stages::drift(&ctx, year)?;
            pipeline::print_drift(&report);
        }
        Commands::BuildGrid {
            vintage,
            resolution,
        } => stages::build_grid(&ctx, &vintage, resolution)?,
        Commands::Project { year } => stages::project(&ctx, year)?,
        Commands::Smooth { year, preset } => stages::smooth(&ctx, year, preset.as_deref())?,
        Commands::Run {
            year,
            vintage,
            trend_years,
            skip_grid_build,
        } => pipeline::run(
            &ctx,
            &pipeline::RunOptions {
                year,
                vintage: &vintage,
                trend_years,
                skip_grid_build,
            },
        )?,
        Commands::Presets => {
            println!(
                "{:<12} {:>6} {:>9} {:>6} DECAY",
                "NAME", "SELF", "NEIGHBOR", "RINGS"
            );
            println!("{}", "-".repeat(48));
            for [name, own, neighbor, rings, decay] in stages::preset_rows(&ctx) {
                println!("{name:<12} {own:>6} {neighbor:>9} {rings:>6} {decay}");
            }
        }
        Commands::Locate {
            lng,
            lat,
            year,
            vintage,
        } => {
            let found = inspect::locate(&ctx, lng, lat, &vintage, year)?;
            inspect::print_location(found.as_ref(), year);
        }
        Commands::Runs { year } => inspect::print_runs(&inspect::runs(&ctx, year)?),
        Commands::ShowTrends {
            base_year,
            end_year,
            area,
            all,
        } => inspect::print_trends(&inspect::trends(
            &ctx,
            base_year,
            end_year,
            area.as_deref(),
            all,
        )?),
        Commands::ShowDisaggregation {
            target,
            year,
            district,
        } => inspect::print_disaggregation(&inspect::disaggregation(
            &ctx,
            &target,
            year,
            district.as_deref(),
        )?),
    }

    Ok(())
}
