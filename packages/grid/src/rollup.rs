//! Parent-cell aggregation for low-zoom views.

use std::collections::BTreeMap;

use area_score_score_models::HexCellScore;
use h3o::{CellIndex, Resolution};

use crate::{GridError, round2};

#[derive(Default)]
struct Accumulator {
    raw: Vec<f64>,
    smoothed: Vec<f64>,
    trend: Vec<f64>,
    factor: Vec<f64>,
}

fn mean(values: &[f64]) -> Option<f64> {
    if values.is_empty() {
        return None;
    }
    #[allow(clippy::cast_precision_loss)]
    let n = values.len() as f64;
    Some(values.iter().sum::<f64>() / n)
}

/// Averages smoothed cells under their parent at `target_resolution`.
///
/// Only cells that have a smoothed score take part. Parent cells carry
/// no primary area.
///
/// # Errors
///
/// * [`GridError::InvalidResolution`] if `target_resolution > 15`.
/// * [`GridError::InvalidCell`] if a cell index is not valid H3.
/// * [`GridError::RollupResolution`] if a cell is not finer than the
///   target.
pub fn rollup(cells: &[HexCellScore], target_resolution: u8) -> Result<Vec<HexCellScore>, GridError> {
    let target = Resolution::try_from(target_resolution)?;
    let mut groups: BTreeMap<(u64, i32), Accumulator> = BTreeMap::new();

    for cell in cells {
        let Some(smoothed) = cell.score_smoothed else {
            continue;
        };
        let index = CellIndex::try_from(cell.h3_index)?;
        let parent = index.parent(target).filter(|_| cell.resolution > target_resolution).ok_or(
            GridError::RollupResolution {
                base: cell.resolution,
                target: target_resolution,
            },
        )?;

        let group = groups.entry((u64::from(parent), cell.year)).or_default();
        group.raw.push(cell.score_raw);
        group.smoothed.push(smoothed);
        group.factor.push(cell.smoothing_factor);
        if let Some(trend) = cell.trend_1y {
            group.trend.push(trend);
        }
    }

    let parents: Vec<HexCellScore> = groups
        .into_iter()
        .filter_map(|((h3_index, year), group)| {
            Some(HexCellScore {
                h3_index,
                resolution: target_resolution,
                year,
                score_raw: round2(mean(&group.raw)?),
                score_smoothed: mean(&group.smoothed).map(round2),
                smoothing_factor: mean(&group.factor).unwrap_or(0.0),
                trend_1y: mean(&group.trend).map(round2),
                primary_area_code: None,
            })
        })
        .collect();

    log::info!(
        "Aggregated {} cells into {} parents at resolution {target_resolution}",
        cells.len(),
        parents.len()
    );

    Ok(parents)
}

#[cfg(test)]
mod tests {
    use h3o::LatLng;

    use super::*;

    fn cell(index: CellIndex, raw: f64, smoothed: Option<f64>, trend: Option<f64>) -> HexCellScore {
        HexCellScore {
            h3_index: u64::from(index),
            resolution: u8::from(index.resolution()),
            year: 2024,
            score_raw: raw,
            score_smoothed: smoothed,
            smoothing_factor: 0.3,
            trend_1y: trend,
            primary_area_code: Some("A".to_string()),
        }
    }

    #[test]
    fn children_average_into_parent() {
        let parent = LatLng::new(59.33, 18.07).unwrap().to_cell(Resolution::Seven);
        let children: Vec<CellIndex> = parent.children(Resolution::Eight).take(3).collect();
        let cells = vec![
            cell(children[0], 40.0, Some(45.0), Some(2.0)),
            cell(children[1], 60.0, Some(55.0), None),
            cell(children[2], 99.0, None, Some(9.0)),
        ];

        let parents = rollup(&cells, 7).unwrap();
        assert_eq!(parents.len(), 1);
        let p = &parents[0];
        assert_eq!(p.h3_index, u64::from(parent));
        assert_eq!(p.resolution, 7);
        assert!((p.score_raw - 50.0).abs() < 1e-9);
        assert_eq!(p.score_smoothed, Some(50.0));
        assert_eq!(p.trend_1y, Some(2.0));
        assert_eq!(p.primary_area_code, None);
    }

    #[test]
    fn rollup_target_must_be_coarser() {
        let index = LatLng::new(59.33, 18.07).unwrap().to_cell(Resolution::Seven);
        let cells = vec![cell(index, 40.0, Some(45.0), None)];
        assert!(matches!(
            rollup(&cells, 7),
            Err(GridError::RollupResolution { base: 7, target: 7 })
        ));
    }
}
