#![cfg_attr(feature = "fail-on-warnings", deny(warnings))]
#![warn(clippy::all, clippy::pedantic, clippy::nursery, clippy::cargo)]
#![allow(clippy::multiple_crate_versions, clippy::cargo_common_metadata)]

//! Terminal output for the `area_score` CLI.
//!
//! [`init_logger`] puts `pretty_env_logger` behind `indicatif-log-bridge`,
//! so log lines print above the bars instead of through them.
//! [`IndicatifProgress`] draws a stage's [`StageProgress`] reports.

use std::time::Duration;

use area_score_config::progress::{StageProgress, WorkUnit};
use indicatif::{ProgressBar, ProgressFinish, ProgressStyle};

pub use indicatif::MultiProgress;

/// Template of a counted bar, labelled with what it counts.
fn counted_template(unit: WorkUnit, color: &str) -> String {
    format!(
        "{{msg:<28}} {{wide_bar:.{color}/dim}} {{pos}}/{{len}} {} [{{elapsed}}<{{eta}}]",
        unit.label()
    )
}

fn counted_style(unit: WorkUnit, color: &str) -> ProgressStyle {
    ProgressStyle::with_template(&counted_template(unit, color))
        .unwrap_or_else(|_| ProgressStyle::default_bar())
        .progress_chars("=> ")
}

/// An `indicatif` bar for one stage or for a full run.
///
/// A bar dropped before [`StageProgress::done`] is cleared, so a stage
/// that fails leaves no spinner behind.
pub struct IndicatifProgress {
    bar: ProgressBar,
    color: &'static str,
}

impl IndicatifProgress {
    /// A spinner labelled `label` (e.g. `"Scoring 2024"`). It turns into a
    /// bar counting districts or areas once the stage starts.
    #[must_use]
    pub fn stage(multi: &MultiProgress, label: &str) -> Self {
        let bar = multi.add(ProgressBar::new_spinner().with_finish(ProgressFinish::AndClear));
        bar.enable_steady_tick(Duration::from_millis(120));
        bar.set_style(
            ProgressStyle::with_template("{spinner:.cyan} {msg}")
                .unwrap_or_else(|_| ProgressStyle::default_spinner()),
        );
        bar.set_message(label.to_string());

        Self { bar, color: "cyan" }
    }

    /// A bar over the `stages` stages of a full run for `year`.
    #[must_use]
    pub fn run(multi: &MultiProgress, year: i32, stages: usize) -> Self {
        let bar = multi.add(ProgressBar::new(0).with_finish(ProgressFinish::AndClear));
        bar.set_message(format!("Pipeline {year}"));

        let run = Self { bar, color: "green" };
        run.start(stages as u64, WorkUnit::Stages);
        run
    }

    /// Names the stage a run bar is working on.
    pub fn step(&self, label: &str) {
        self.bar.set_message(label.to_string());
    }
}

impl StageProgress for IndicatifProgress {
    fn start(&self, total: u64, unit: WorkUnit) {
        self.bar.set_length(total);
        self.bar.set_position(0);
        self.bar.set_style(counted_style(unit, self.color));
    }

    fn advance(&self, count: u64) {
        self.bar.inc(count);
    }

    fn done(&self, summary: &str) {
        self.bar.finish_with_message(summary.to_string());
    }
}

/// Installs `pretty_env_logger` behind `indicatif-log-bridge`.
///
/// `RUST_LOG` filters as usual; without it, `info` and above print.
/// Returns the [`MultiProgress`] every bar must be added to.
#[must_use]
pub fn init_logger() -> MultiProgress {
    let multi = MultiProgress::new();

    let mut builder = pretty_env_logger::formatted_builder();
    match std::env::var("RUST_LOG") {
        Ok(filters) => builder.parse_filters(&filters),
        Err(_) => builder.filter_level(log::LevelFilter::Info),
    };
    let logger = builder.build();
    let level = logger.filter();

    // A second call (tests) finds the logger already installed.
    indicatif_log_bridge::LogWrapper::new(multi.clone(), logger)
        .try_init()
        .ok();
    log::set_max_level(level);

    multi
}
