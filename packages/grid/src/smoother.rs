//! Neighbor-blended hex scores.

use std::collections::BTreeMap;

use area_score_score_models::{HexCellScore, SmoothingConfig};
use h3o::CellIndex;
use rayon::prelude::*;

use crate::{GridError, round2, stddev};

/// Raw versus smoothed spread after a smoothing pass.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct SmoothingDiagnostics {
    /// Cells smoothed.
    pub cells: usize,
    /// Standard deviation of raw scores.
    pub raw_stddev: f64,
    /// Standard deviation of smoothed scores.
    pub smoothed_stddev: f64,
    /// Mean `|smoothed - raw|`.
    pub mean_abs_delta: f64,
    /// Largest `|smoothed - raw|`.
    pub max_abs_delta: f64,
}

/// Applies one smoothing preset.
pub struct SpatialSmoother<'a> {
    preset: &'a SmoothingConfig,
}

impl<'a> SpatialSmoother<'a> {
    /// Creates a smoother for `preset`.
    #[must_use]
    pub const fn new(preset: &'a SmoothingConfig) -> Self {
        Self { preset }
    }

    /// Sets `score_smoothed` and `smoothing_factor` on every cell.
    ///
    /// Neighbors are looked up among `cells` only, so the slice should
    /// hold one year at one resolution. A cell with no scored neighbor
    /// uses its own raw score as the neighbor average.
    ///
    /// # Errors
    ///
    /// Returns [`GridError::InvalidCell`] if a cell index is not valid H3.
    pub fn smooth(&self, cells: &mut [HexCellScore]) -> Result<SmoothingDiagnostics, GridError> {
        let preset = self.preset;

        if preset.is_identity() {
            for cell in cells.iter_mut() {
                cell.score_smoothed = Some(cell.score_raw);
                cell.smoothing_factor = 0.0;
            }
        } else {
            let raw: BTreeMap<u64, f64> = cells.iter().map(|c| (c.h3_index, c.score_raw)).collect();

            cells.par_iter_mut().try_for_each(|cell| {
                let index = CellIndex::try_from(cell.h3_index)?;
                let average = self
                    .neighbor_average(index, &raw)
                    .unwrap_or(cell.score_raw);
                cell.score_smoothed = Some(round2(
                    preset
                        .self_weight
                        .mul_add(cell.score_raw, preset.neighbor_weight * average),
                ));
                cell.smoothing_factor = preset.neighbor_weight;
                Ok::<_, GridError>(())
            })?;
        }

        let diagnostics = diagnostics(cells);
        log::info!(
            "Smoothed {} cells with '{}': stddev {:.2} -> {:.2}, mean |delta| {:.2}, max |delta| {:.2}",
            diagnostics.cells,
            preset.name,
            diagnostics.raw_stddev,
            diagnostics.smoothed_stddev,
            diagnostics.mean_abs_delta,
            diagnostics.max_abs_delta
        );

        Ok(diagnostics)
    }

    /// Mean of scored neighbors within `k_rings`, excluding the cell
    /// itself. Beyond the first ring each neighbor is weighted by the
    /// preset's decay of its ring distance.
    fn neighbor_average(&self, cell: CellIndex, raw: &BTreeMap<u64, f64>) -> Option<f64> {
        let k = self.preset.k_rings;
        let mut weighted = 0.0;
        let mut total = 0.0;

        for (neighbor, distance) in cell.grid_disk_distances::<Vec<_>>(k) {
            if distance == 0 {
                continue;
            }
            let Some(score) = raw.get(&u64::from(neighbor)) else {
                continue;
            };
            let weight = if k == 1 {
                1.0
            } else {
                self.preset.decay.weight(distance, k)
            };
            weighted += score * weight;
            total += weight;
        }

        (total > 0.0).then(|| weighted / total)
    }
}

fn diagnostics(cells: &[HexCellScore]) -> SmoothingDiagnostics {
    let pairs: Vec<(f64, f64)> = cells
        .iter()
        .filter_map(|c| c.score_smoothed.map(|s| (c.score_raw, s)))
        .collect();
    if pairs.is_empty() {
        return SmoothingDiagnostics::default();
    }

    let raw: Vec<f64> = pairs.iter().map(|(r, _)| *r).collect();
    let smoothed: Vec<f64> = pairs.iter().map(|(_, s)| *s).collect();
    let deltas: Vec<f64> = pairs.iter().map(|(r, s)| (s - r).abs()).collect();

    #[allow(clippy::cast_precision_loss)]
    let mean_abs_delta = deltas.iter().sum::<f64>() / deltas.len() as f64;

    SmoothingDiagnostics {
        cells: pairs.len(),
        raw_stddev: stddev(&raw),
        smoothed_stddev: stddev(&smoothed),
        mean_abs_delta,
        max_abs_delta: deltas.iter().copied().fold(0.0, f64::max),
    }
}
