//! Area-to-cell assignment and score projection.

use std::collections::{BTreeMap, BTreeSet, VecDeque};

use area_score_config::progress::{StageProgress, WorkUnit};
use area_score_score_models::{CompositeScore, HexAssignment, HexCellScore};
use area_score_spatial::{AreaBoundary, AreaIndex};
use geo::{Area, LineString, Polygon};
use h3o::{CellIndex, LatLng, Resolution};
use rayon::prelude::*;

use crate::GridError;

/// Maps areas onto H3 cells at one resolution.
#[derive(Debug, Clone, Copy)]
pub struct GridProjector {
    resolution: Resolution,
}

impl GridProjector {
    /// Creates a projector at H3 `resolution`.
    ///
    /// # Errors
    ///
    /// Returns [`GridError::InvalidResolution`] if `resolution > 15`.
    pub fn new(resolution: u8) -> Result<Self, GridError> {
        Ok(Self {
            resolution: Resolution::try_from(resolution)?,
        })
    }

    /// H3 resolution of the cells this projector produces.
    #[must_use]
    pub fn resolution(&self) -> u8 {
        u8::from(self.resolution)
    }

    /// Cells whose centers lie inside `boundary`, in index order.
    ///
    /// Walks the grid outward from seed cells and stops expanding once a
    /// cell center leaves the boundary's bounding box padded by one cell.
    #[must_use]
    pub fn cells_within(&self, boundary: &AreaBoundary) -> Vec<CellIndex> {
        let seeds = self.seed_cells(boundary);
        let Some(first) = seeds.first() else {
            return Vec::new();
        };

        let (pad_lng, pad_lat) = cell_extent(*first);
        let ([min_lng, min_lat], [max_lng, max_lat]) = boundary.bounds();
        let in_padded_box = |ll: LatLng| {
            ll.lng() >= min_lng - pad_lng
                && ll.lng() <= max_lng + pad_lng
                && ll.lat() >= min_lat - pad_lat
                && ll.lat() <= max_lat + pad_lat
        };

        let mut visited: BTreeSet<CellIndex> = seeds.iter().copied().collect();
        let mut queue: VecDeque<CellIndex> = seeds.into_iter().collect();
        let mut inside = Vec::new();

        while let Some(cell) = queue.pop_front() {
            let center = LatLng::from(cell);
            if !in_padded_box(center) {
                continue;
            }
            if boundary.contains(center.lng(), center.lat()) {
                inside.push(cell);
            }
            for neighbor in cell.grid_disk::<Vec<_>>(1) {
                if visited.insert(neighbor) {
                    queue.push_back(neighbor);
                }
            }
        }

        inside.sort_unstable();
        inside
    }

    /// Starting cells: the bounding-box center and the first vertex of
    /// every polygon part, so disjoint parts are all reached.
    fn seed_cells(&self, boundary: &AreaBoundary) -> Vec<CellIndex> {
        let ([min_lng, min_lat], [max_lng, max_lat]) = boundary.bounds();
        let mut points = vec![((min_lng + max_lng) / 2.0, (min_lat + max_lat) / 2.0)];
        points.extend(
            boundary
                .polygon
                .0
                .iter()
                .filter_map(|part| part.exterior().0.first())
                .map(|c| (c.x, c.y)),
        );

        let mut seeds: Vec<CellIndex> = points
            .into_iter()
            .filter_map(|(lng, lat)| LatLng::new(lat, lng).ok())
            .map(|ll| ll.to_cell(self.resolution))
            .collect();
        seeds.sort_unstable();
        seeds.dedup();
        seeds
    }

    /// Assignments for one area: weight 1.0 for every cell whose center
    /// lies inside it, or, when none does, the single cell containing the
    /// area's own centroid weighted by the area's share of that cell.
    #[must_use]
    pub fn assign_area(&self, boundary: &AreaBoundary) -> Vec<HexAssignment> {
        let resolution = self.resolution();
        let cells = self.cells_within(boundary);

        if !cells.is_empty() {
            return cells
                .into_iter()
                .map(|cell| HexAssignment {
                    area_code: boundary.code.clone(),
                    h3_index: u64::from(cell),
                    resolution,
                    area_weight: 1.0,
                    centroid_fallback: false,
                })
                .collect();
        }

        let Some(cell) = boundary
            .centroid()
            .and_then(|c| LatLng::new(c.y(), c.x()).ok())
            .map(|ll| ll.to_cell(self.resolution))
        else {
            log::warn!("{}: empty geometry, no hex assigned", boundary.code);
            return Vec::new();
        };

        let cell_area = cell_polygon(cell).unsigned_area();
        let area_weight = if cell_area > 0.0 {
            (boundary.area / cell_area).clamp(0.0, 1.0)
        } else {
            1.0
        };

        vec![HexAssignment {
            area_code: boundary.code.clone(),
            h3_index: u64::from(cell),
            resolution,
            area_weight,
            centroid_fallback: true,
        }]
    }

    /// Assignments for every area in `index`, sorted by area code then
    /// cell.
    #[must_use]
    pub fn build_mapping(
        &self,
        index: &AreaIndex,
        progress: &dyn StageProgress,
    ) -> Vec<HexAssignment> {
        let boundaries: Vec<&AreaBoundary> = index.boundaries().collect();
        progress.start(boundaries.len() as u64, WorkUnit::Areas);

        let mut mapping: Vec<HexAssignment> = boundaries
            .par_iter()
            .flat_map_iter(|boundary| {
                let assignments = self.assign_area(boundary);
                progress.advance(1);
                assignments
            })
            .collect();

        mapping.sort_by(|a, b| {
            a.area_code
                .cmp(&b.area_code)
                .then_with(|| a.h3_index.cmp(&b.h3_index))
        });

        let fallbacks = mapping.iter().filter(|m| m.centroid_fallback).count();
        progress.done(&format!(
            "Mapped {} areas to {} cells at resolution {}",
            boundaries.len(),
            mapping.len(),
            self.resolution()
        ));
        log::info!(
            "Mapped {} areas to {} cells at resolution {} ({fallbacks} by centroid)",
            boundaries.len(),
            mapping.len(),
            self.resolution()
        );

        mapping
    }

    /// Joins `scores` onto `mapping`. Each cell takes the score of its
    /// heaviest assigned area; equal weights go to the lowest area code.
    ///
    /// # Errors
    ///
    /// Returns [`GridError::NoScores`] if `scores` is empty.
    pub fn project(
        &self,
        year: i32,
        mapping: &[HexAssignment],
        scores: &[CompositeScore],
    ) -> Result<Vec<HexCellScore>, GridError> {
        if scores.is_empty() {
            return Err(GridError::NoScores { year });
        }

        let resolution = self.resolution();
        let by_area: BTreeMap<&str, &CompositeScore> =
            scores.iter().map(|s| (s.area_code.as_str(), s)).collect();

        let mut best: BTreeMap<u64, &HexAssignment> = BTreeMap::new();
        for assignment in mapping.iter().filter(|m| m.resolution == resolution) {
            if !by_area.contains_key(assignment.area_code.as_str()) {
                continue;
            }
            let replace = best.get(&assignment.h3_index).is_none_or(|current| {
                assignment
                    .area_weight
                    .total_cmp(&current.area_weight)
                    .reverse()
                    .then_with(|| assignment.area_code.cmp(&current.area_code))
                    .is_lt()
            });
            if replace {
                best.insert(assignment.h3_index, assignment);
            }
        }

        let cells: Vec<HexCellScore> = best
            .into_iter()
            .filter_map(|(h3_index, assignment)| {
                let score = by_area.get(assignment.area_code.as_str())?;
                Some(HexCellScore {
                    h3_index,
                    resolution,
                    year,
                    score_raw: score.score,
                    score_smoothed: None,
                    smoothing_factor: 0.0,
                    trend_1y: score.trend_1y,
                    primary_area_code: Some(assignment.area_code.clone()),
                })
            })
            .collect();

        log::info!(
            "Projected {} area scores onto {} cells for {year}",
            scores.len(),
            cells.len()
        );

        Ok(cells)
    }
}

/// Cell outline as a planar polygon in degrees.
fn cell_polygon(cell: CellIndex) -> Polygon<f64> {
    let ring: Vec<(f64, f64)> = cell.boundary().iter().map(|ll| (ll.lng(), ll.lat())).collect();
    Polygon::new(LineString::from(ring), vec![])
}

/// Longitude and latitude span of a cell.
fn cell_extent(cell: CellIndex) -> (f64, f64) {
    let boundary = cell.boundary();
    let (mut min_lng, mut max_lng) = (f64::INFINITY, f64::NEG_INFINITY);
    let (mut min_lat, mut max_lat) = (f64::INFINITY, f64::NEG_INFINITY);
    for ll in boundary.iter() {
        min_lng = min_lng.min(ll.lng());
        max_lng = max_lng.max(ll.lng());
        min_lat = min_lat.min(ll.lat());
        max_lat = max_lat.max(ll.lat());
    }
    (max_lng - min_lng, max_lat - min_lat)
}

/// Center of a cell as `(lng, lat)`.
#[must_use]
pub fn cell_center(cell: CellIndex) -> (f64, f64) {
    let ll = LatLng::from(cell);
    (ll.lng(), ll.lat())
}

#[cfg(test)]
mod tests {
    use area_score_config::progress::NullProgress;
    use geo::MultiPolygon;

    use super::*;

    fn square(code: &str, lng: f64, lat: f64, half: f64) -> AreaBoundary {
        let ring = LineString::from(vec![
            (lng - half, lat - half),
            (lng + half, lat - half),
            (lng + half, lat + half),
            (lng - half, lat + half),
            (lng - half, lat - half),
        ]);
        AreaBoundary::new(code, MultiPolygon::new(vec![Polygon::new(ring, vec![])]))
    }

    fn composite(code: &str, score: f64) -> CompositeScore {
        CompositeScore {
            area_code: code.to_string(),
            year: 2024,
            score,
            raw_score_before_penalties: None,
            trend_1y: Some(1.5),
            trend_3y: None,
            factor_scores: BTreeMap::new(),
            top_positive: Vec::new(),
            top_negative: Vec::new(),
            penalties_applied: Vec::new(),
            fallback_years: BTreeMap::new(),
        }
    }

    fn assignment(code: &str, h3_index: u64, weight: f64) -> HexAssignment {
        HexAssignment {
            area_code: code.to_string(),
            h3_index,
            resolution: 8,
            area_weight: weight,
            centroid_fallback: weight < 1.0,
        }
    }

    #[test]
    fn large_area_gets_every_center_inside() {
        let projector = GridProjector::new(8).unwrap();
        let area = square("BIG", 18.07, 59.33, 0.02);

        let assignments = projector.assign_area(&area);
        assert!(assignments.len() > 10);
        for a in &assignments {
            assert!((a.area_weight - 1.0).abs() < f64::EPSILON);
            assert!(!a.centroid_fallback);
            let cell = CellIndex::try_from(a.h3_index).unwrap();
            let (lng, lat) = cell_center(cell);
            assert!(area.contains(lng, lat));
        }
    }

    #[test]
    fn neighboring_areas_do_not_share_cells() {
        let projector = GridProjector::new(8).unwrap();
        let west = square("W", 18.05, 59.33, 0.01);
        let east = square("E", 18.07, 59.33, 0.01);

        let west_cells: BTreeSet<u64> = projector.assign_area(&west).iter().map(|a| a.h3_index).collect();
        let east_cells: BTreeSet<u64> = projector.assign_area(&east).iter().map(|a| a.h3_index).collect();
        assert!(!west_cells.is_empty());
        assert!(!east_cells.is_empty());
        assert!(west_cells.is_disjoint(&east_cells));
    }

    #[test]
    fn tiny_area_falls_back_to_centroid_cell() {
        let projector = GridProjector::new(8).unwrap();
        let cell = LatLng::new(59.33, 18.07).unwrap().to_cell(Resolution::Eight);
        let (center_lng, center_lat) = cell_center(cell);
        let vertex = cell.boundary().iter().next().copied().unwrap();

        // well inside the cell but far from its center
        let lng = vertex.lng() + 0.2 * (center_lng - vertex.lng());
        let lat = vertex.lat() + 0.2 * (center_lat - vertex.lat());
        let area = square("TINY", lng, lat, 0.0001);

        let assignments = projector.assign_area(&area);
        assert_eq!(assignments.len(), 1);
        assert!(assignments[0].centroid_fallback);
        assert_eq!(assignments[0].h3_index, u64::from(cell));
        assert!(assignments[0].area_weight > 0.0 && assignments[0].area_weight < 1.0);
    }

    #[test]
    fn mapping_covers_index() {
        let projector = GridProjector::new(7).unwrap();
        let index = AreaIndex::new(vec![
            square("A", 18.00, 59.30, 0.03),
            square("B", 18.10, 59.30, 0.03),
        ]);

        let mapping = projector.build_mapping(&index, &NullProgress);
        let codes: BTreeSet<&str> = mapping.iter().map(|m| m.area_code.as_str()).collect();
        assert_eq!(codes.len(), 2);
        assert!(mapping.iter().all(|m| m.resolution == 7));
    }

    #[test]
    fn heaviest_assignment_wins() {
        let projector = GridProjector::new(8).unwrap();
        let mapping = vec![
            assignment("SMALL", 1, 0.2),
            assignment("FULL", 1, 1.0),
            assignment("B", 2, 0.5),
            assignment("A", 2, 0.5),
            assignment("UNSCORED", 3, 1.0),
        ];
        let scores = vec![
            composite("SMALL", 10.0),
            composite("FULL", 70.0),
            composite("A", 40.0),
            composite("B", 60.0),
        ];

        let cells = projector.project(2024, &mapping, &scores).unwrap();
        assert_eq!(cells.len(), 2);
        assert_eq!(cells[0].primary_area_code.as_deref(), Some("FULL"));
        assert!((cells[0].score_raw - 70.0).abs() < f64::EPSILON);
        assert_eq!(cells[1].primary_area_code.as_deref(), Some("A"));
        assert_eq!(cells[1].trend_1y, Some(1.5));
    }

    #[test]
    fn projecting_without_scores_fails() {
        let projector = GridProjector::new(8).unwrap();
        assert!(matches!(
            projector.project(2024, &[assignment("A", 1, 1.0)], &[]),
            Err(GridError::NoScores { year: 2024 })
        ));
    }

    #[test]
    fn invalid_resolution_is_rejected() {
        assert!(GridProjector::new(16).is_err());
    }
}
