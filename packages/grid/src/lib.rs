#![cfg_attr(feature = "fail-on-warnings", deny(warnings))]
#![warn(clippy::all, clippy::pedantic, clippy::nursery, clippy::cargo)]
#![allow(clippy::multiple_crate_versions, clippy::cargo_common_metadata)]

//! H3 hex grid projection of composite area scores.
//!
//! [`GridProjector`] assigns every area the cells whose centers fall inside
//! it and joins scores onto those cells. [`SpatialSmoother`] blends each
//! cell with its neighbors, and [`rollup`] averages cells under their
//! parents at coarser resolutions.

pub mod projector;
pub mod rollup;
pub mod smoother;

pub use projector::GridProjector;
pub use rollup::rollup;
pub use smoother::{SmoothingDiagnostics, SpatialSmoother};

/// Errors raised by grid operations.
#[derive(Debug, thiserror::Error)]
pub enum GridError {
    /// Resolution outside `0..=15`.
    #[error(transparent)]
    InvalidResolution(#[from] h3o::error::InvalidResolution),
    /// A stored value is not a valid H3 cell index.
    #[error(transparent)]
    InvalidCell(#[from] h3o::error::InvalidCellIndex),
    /// There are no composite scores to project.
    #[error("No composite scores found for {year}")]
    NoScores {
        /// Requested year.
        year: i32,
    },
    /// A rollup target is not coarser than the cells it aggregates.
    #[error("Cannot roll resolution {base} up to {target}")]
    RollupResolution {
        /// Resolution of the aggregated cells.
        base: u8,
        /// Requested parent resolution.
        target: u8,
    },
}

pub(crate) fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

/// Population standard deviation.
pub(crate) fn stddev(values: &[f64]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }

    #[allow(clippy::cast_precision_loss)]
    let n = values.len() as f64;
    let mean = values.iter().sum::<f64>() / n;
    (values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / n).sqrt()
}
