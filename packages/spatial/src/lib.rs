#![cfg_attr(feature = "fail-on-warnings", deny(warnings))]
#![warn(clippy::all, clippy::pedantic, clippy::nursery, clippy::cargo)]
#![allow(clippy::multiple_crate_versions, clippy::cargo_common_metadata)]

//! In-memory spatial index over statistical area boundaries.
//!
//! Loads area polygons (from `GeoJSON` files or the pipeline `DuckDB`),
//! builds an R-tree over their bounding boxes, and provides point-in-polygon
//! lookups plus the polygon-overlap computation that produces
//! [`CrosswalkMapping`] rows between two boundary vintages.
//!
//! All geometry is planar in longitude/latitude degrees. Overlap fractions
//! are ratios of areas measured in the same projection, so the unit
//! cancels out.

use std::collections::BTreeMap;

use area_score_geography_models::CrosswalkMapping;
use geo::{Area, BooleanOps, BoundingRect, Centroid, Contains, MultiPolygon, Point};
use geojson::{GeoJson, JsonObject};
use rayon::prelude::*;
use rstar::{AABB, RTree, RTreeObject};

/// Errors raised while loading boundaries.
#[derive(Debug, thiserror::Error)]
pub enum SpatialError {
    /// Database query failed.
    #[error(transparent)]
    Db(#[from] duckdb::Error),
    /// The document is not valid `GeoJSON`.
    #[error(transparent)]
    GeoJson(#[from] geojson::Error),
    /// The document is valid `GeoJSON` but not a feature collection.
    #[error("Expected a GeoJSON FeatureCollection")]
    NotFeatureCollection,
}

/// An area polygon stored in the R-tree with its metadata.
#[derive(Debug, Clone)]
pub struct AreaBoundary {
    /// Area code.
    pub code: String,
    /// Planar area in square degrees.
    pub area: f64,
    envelope: AABB<[f64; 2]>,
    /// Boundary polygon.
    pub polygon: MultiPolygon<f64>,
}

impl RTreeObject for AreaBoundary {
    type Envelope = AABB<[f64; 2]>;

    fn envelope(&self) -> Self::Envelope {
        self.envelope
    }
}

impl AreaBoundary {
    /// Creates a boundary, computing its envelope and planar area.
    #[must_use]
    pub fn new(code: impl Into<String>, polygon: MultiPolygon<f64>) -> Self {
        let envelope = compute_envelope(&polygon);
        let area = polygon.unsigned_area();

        Self {
            code: code.into(),
            area,
            envelope,
            polygon,
        }
    }

    /// Lower-left and upper-right corners as `[lng, lat]`.
    #[must_use]
    pub fn bounds(&self) -> ([f64; 2], [f64; 2]) {
        (self.envelope.lower(), self.envelope.upper())
    }

    /// Geometric centroid, if the polygon is non-empty.
    #[must_use]
    pub fn centroid(&self) -> Option<Point<f64>> {
        self.polygon.centroid()
    }

    /// Whether the point lies strictly inside the polygon.
    #[must_use]
    pub fn contains(&self, lng: f64, lat: f64) -> bool {
        self.polygon.contains(&Point::new(lng, lat))
    }
}

/// Pre-built R-tree over one boundary vintage.
pub struct AreaIndex {
    tree: RTree<AreaBoundary>,
}

impl AreaIndex {
    /// Builds an index from parsed boundaries.
    #[must_use]
    pub fn new(boundaries: Vec<AreaBoundary>) -> Self {
        Self {
            tree: RTree::bulk_load(boundaries),
        }
    }

    /// Builds an index from `(code, geojson)` rows, skipping rows whose
    /// geometry cannot be parsed.
    pub fn from_geojson_rows<I>(rows: I) -> Self
    where
        I: IntoIterator<Item = (String, String)>,
    {
        let mut entries = Vec::new();

        for (code, geojson_str) in rows {
            if code.is_empty() || geojson_str.is_empty() {
                continue;
            }

            let Some(multi_polygon) = parse_geojson_to_multipolygon(&geojson_str) else {
                log::warn!("Failed to parse GeoJSON for area {code}");
                continue;
            };

            entries.push(AreaBoundary::new(code, multi_polygon));
        }

        Self::new(entries)
    }

    /// Loads the polygons of one vintage from the pipeline database.
    ///
    /// # Errors
    ///
    /// Returns an error if the database query fails.
    pub fn load(conn: &duckdb::Connection, vintage: &str) -> Result<Self, SpatialError> {
        let mut stmt = conn.prepare(
            "SELECT area_code, geojson FROM area_geometries \
             WHERE vintage = ? AND geojson IS NOT NULL",
        )?;
        let mut rows = stmt.query(duckdb::params![vintage])?;
        let mut raw = Vec::new();

        while let Some(row) = rows.next()? {
            let code: String = row.get(0)?;
            let geojson: String = row.get(1)?;
            raw.push((code, geojson));
        }

        let index = Self::from_geojson_rows(raw);
        log::info!(
            "Loaded {} '{vintage}' boundaries into spatial index",
            index.len()
        );

        Ok(index)
    }

    /// Number of indexed areas.
    #[must_use]
    pub fn len(&self) -> usize {
        self.tree.size()
    }

    /// Whether the index holds no areas.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.tree.size() == 0
    }

    /// All indexed boundaries in arbitrary order.
    pub fn boundaries(&self) -> impl Iterator<Item = &AreaBoundary> {
        self.tree.iter()
    }

    /// Looks up the area containing a point.
    ///
    /// Areas of one vintage tile without overlap, but sliver overlaps along
    /// shared edges exist in real data; the smallest containing area wins,
    /// then the lowest code.
    #[must_use]
    pub fn lookup(&self, lng: f64, lat: f64) -> Option<&str> {
        let point = Point::new(lng, lat);
        let query_env = AABB::from_point([lng, lat]);

        let mut best: Option<&AreaBoundary> = None;

        for entry in self.tree.locate_in_envelope_intersecting(&query_env) {
            if entry.polygon.contains(&point) {
                match best {
                    None => best = Some(entry),
                    Some(current)
                        if entry
                            .area
                            .total_cmp(&current.area)
                            .then_with(|| entry.code.cmp(&current.code))
                            .is_lt() =>
                    {
                        best = Some(entry);
                    }
                    _ => {}
                }
            }
        }

        best.map(|e| e.code.as_str())
    }

    /// Boundaries whose bounding boxes intersect `boundary`'s.
    fn candidates<'a>(
        &'a self,
        boundary: &'a AreaBoundary,
    ) -> impl Iterator<Item = &'a AreaBoundary> + 'a {
        self.tree.locate_in_envelope_intersecting(&boundary.envelope)
    }
}

/// Computes overlap mappings from every area in `old` to the areas in
/// `new` it intersects.
///
/// `overlap_fraction = area(old ∩ new) / area(old)` and
/// `reverse_fraction = area(old ∩ new) / area(new)`. Pairs whose overlap
/// fraction does not exceed `min_overlap` are discarded, as are degenerate
/// polygons with zero area. Output is sorted by `(old_code, new_code)`.
#[must_use]
pub fn build_crosswalk(old: &AreaIndex, new: &AreaIndex, min_overlap: f64) -> Vec<CrosswalkMapping> {
    let olds: Vec<&AreaBoundary> = old.boundaries().collect();

    let mut mappings: Vec<CrosswalkMapping> = olds
        .par_iter()
        .flat_map_iter(|old_area| {
            new.candidates(old_area)
                .filter_map(|new_area| overlap(old_area, new_area))
                .filter(|m| m.overlap_fraction > min_overlap)
                .collect::<Vec<_>>()
        })
        .collect();

    mappings.sort_by(|a, b| {
        a.old_code
            .cmp(&b.old_code)
            .then_with(|| a.new_code.cmp(&b.new_code))
    });

    log::info!(
        "Computed {} crosswalk mappings from {} old areas onto {} new areas",
        mappings.len(),
        old.len(),
        new.len()
    );

    mappings
}

fn overlap(old_area: &AreaBoundary, new_area: &AreaBoundary) -> Option<CrosswalkMapping> {
    if old_area.area <= 0.0 || new_area.area <= 0.0 {
        return None;
    }

    let shared = old_area.polygon.intersection(&new_area.polygon).unsigned_area();
    if shared <= 0.0 {
        return None;
    }

    Some(CrosswalkMapping {
        old_code: old_area.code.clone(),
        new_code: new_area.code.clone(),
        overlap_fraction: shared / old_area.area,
        reverse_fraction: shared / new_area.area,
    })
}

/// One feature of an area boundary file.
#[derive(Debug, Clone)]
pub struct AreaFeature {
    /// Area code read from the configured property.
    pub code: String,
    /// Parsed boundary.
    pub polygon: MultiPolygon<f64>,
    /// The feature's geometry re-serialized as `GeoJSON`.
    pub geojson: String,
    /// Remaining feature properties.
    pub properties: JsonObject,
}

impl AreaFeature {
    /// Reads a string property, accepting numbers as well.
    #[must_use]
    pub fn string_property(&self, key: &str) -> Option<String> {
        let value = self.properties.get(key)?;
        value
            .as_str()
            .map(str::to_string)
            .or_else(|| value.as_i64().map(|n| n.to_string()))
    }

    /// Reads a numeric property, accepting numeric strings as well.
    #[must_use]
    pub fn f64_property(&self, key: &str) -> Option<f64> {
        let value = self.properties.get(key)?;
        value
            .as_f64()
            .or_else(|| value.as_str().and_then(|s| s.trim().parse().ok()))
    }
}

/// Parses a `GeoJSON` feature collection of area boundaries.
///
/// Features without the code property or with non-polygonal geometry are
/// skipped with a warning. When the same code appears twice the later
/// feature wins.
///
/// # Errors
///
/// Returns an error if the document is not valid `GeoJSON` or is not a
/// feature collection.
pub fn parse_area_features(
    geojson_str: &str,
    code_property: &str,
) -> Result<Vec<AreaFeature>, SpatialError> {
    let geojson: GeoJson = geojson_str.parse()?;
    let GeoJson::FeatureCollection(collection) = geojson else {
        return Err(SpatialError::NotFeatureCollection);
    };

    let mut by_code = BTreeMap::new();
    let mut skipped = 0_usize;

    for feature in collection.features {
        let properties = feature.properties.clone().unwrap_or_default();
        let code = properties.get(code_property).and_then(|v| {
            v.as_str()
                .map(str::to_string)
                .or_else(|| v.as_i64().map(|n| n.to_string()))
        });

        let Some(code) = code else {
            skipped += 1;
            continue;
        };

        let Some(geometry) = feature.geometry else {
            log::warn!("Area {code} has no geometry");
            skipped += 1;
            continue;
        };

        let geojson = GeoJson::from(geometry.clone()).to_string();
        let Some(polygon) = geometry_to_multipolygon(geometry) else {
            log::warn!("Area {code} geometry is not a polygon");
            skipped += 1;
            continue;
        };

        by_code.insert(
            code.clone(),
            AreaFeature {
                code,
                polygon,
                geojson,
                properties,
            },
        );
    }

    if skipped > 0 {
        log::warn!("Skipped {skipped} features without a usable code or geometry");
    }

    Ok(by_code.into_values().collect())
}

/// Parse a `GeoJSON` string into a [`MultiPolygon`].
/// Handles bare geometries and features of `Polygon` or `MultiPolygon` type.
#[must_use]
pub fn parse_geojson_to_multipolygon(geojson_str: &str) -> Option<MultiPolygon<f64>> {
    let geojson: GeoJson = geojson_str.parse().ok()?;
    match geojson {
        GeoJson::Geometry(geom) => geometry_to_multipolygon(geom),
        GeoJson::Feature(feature) => feature.geometry.and_then(geometry_to_multipolygon),
        GeoJson::FeatureCollection(_) => None,
    }
}

fn geometry_to_multipolygon(geom: geojson::Geometry) -> Option<MultiPolygon<f64>> {
    let geo_geom: geo::Geometry<f64> = geom.try_into().ok()?;
    match geo_geom {
        geo::Geometry::MultiPolygon(mp) => Some(mp),
        geo::Geometry::Polygon(p) => Some(MultiPolygon(vec![p])),
        _ => None,
    }
}

/// Compute the bounding box envelope for a [`MultiPolygon`].
fn compute_envelope(mp: &MultiPolygon<f64>) -> AABB<[f64; 2]> {
    mp.bounding_rect().map_or_else(
        || AABB::from_point([0.0, 0.0]),
        |rect| AABB::from_corners([rect.min().x, rect.min().y], [rect.max().x, rect.max().y]),
    )
}

#[cfg(test)]
mod tests {
    use geo::{LineString, Polygon};

    use super::*;

    fn square(code: &str, x0: f64, y0: f64, x1: f64, y1: f64) -> AreaBoundary {
        let ring = LineString::from(vec![(x0, y0), (x1, y0), (x1, y1), (x0, y1), (x0, y0)]);
        AreaBoundary::new(code, MultiPolygon(vec![Polygon::new(ring, vec![])]))
    }

    #[test]
    fn lookup_finds_containing_area() {
        let index = AreaIndex::new(vec![
            square("A", 0.0, 0.0, 1.0, 1.0),
            square("B", 1.0, 0.0, 2.0, 1.0),
        ]);

        assert_eq!(index.lookup(0.5, 0.5), Some("A"));
        assert_eq!(index.lookup(1.5, 0.5), Some("B"));
        assert_eq!(index.lookup(5.0, 5.0), None);
    }

    #[test]
    fn lookup_prefers_smallest_area() {
        let index = AreaIndex::new(vec![
            square("BIG", 0.0, 0.0, 4.0, 4.0),
            square("SMALL", 1.0, 1.0, 2.0, 2.0),
        ]);

        assert_eq!(index.lookup(1.5, 1.5), Some("SMALL"));
    }

    #[test]
    fn split_produces_halves_summing_to_one() {
        let old = AreaIndex::new(vec![square("OLD", 0.0, 0.0, 2.0, 1.0)]);
        let new = AreaIndex::new(vec![
            square("W", 0.0, 0.0, 1.0, 1.0),
            square("E", 1.0, 0.0, 2.0, 1.0),
        ]);

        let mappings = build_crosswalk(&old, &new, 0.01);
        assert_eq!(mappings.len(), 2);
        assert_eq!(mappings[0].new_code, "E");
        assert_eq!(mappings[1].new_code, "W");

        let sum: f64 = mappings.iter().map(|m| m.overlap_fraction).sum();
        assert!((sum - 1.0).abs() < 1e-9);
        for m in &mappings {
            assert!((m.overlap_fraction - 0.5).abs() < 1e-9);
            assert!((m.reverse_fraction - 1.0).abs() < 1e-9);
        }
    }

    #[test]
    fn touching_and_tiny_overlaps_are_dropped() {
        let old = AreaIndex::new(vec![square("OLD", 0.0, 0.0, 1.0, 1.0)]);
        let new = AreaIndex::new(vec![
            square("SAME", 0.0, 0.0, 1.0, 1.0),
            square("EDGE", 1.0, 0.0, 2.0, 1.0),
            square("SLIVER", 0.995, 0.0, 2.0, 1.0),
        ]);

        let mappings = build_crosswalk(&old, &new, 0.01);
        let codes: Vec<&str> = mappings.iter().map(|m| m.new_code.as_str()).collect();
        assert_eq!(codes, vec!["SAME"]);
    }

    #[test]
    fn parses_feature_collection() {
        let doc = r#"{
            "type": "FeatureCollection",
            "features": [
                {
                    "type": "Feature",
                    "properties": {"code": "0114A0010", "population": 1520},
                    "geometry": {"type": "Polygon", "coordinates": [[[0,0],[1,0],[1,1],[0,1],[0,0]]]}
                },
                {
                    "type": "Feature",
                    "properties": {"name": "no code"},
                    "geometry": {"type": "Polygon", "coordinates": [[[0,0],[1,0],[1,1],[0,1],[0,0]]]}
                },
                {
                    "type": "Feature",
                    "properties": {"code": "POINT"},
                    "geometry": {"type": "Point", "coordinates": [0.5, 0.5]}
                }
            ]
        }"#;

        let features = parse_area_features(doc, "code").unwrap();
        assert_eq!(features.len(), 1);
        assert_eq!(features[0].code, "0114A0010");
        assert_eq!(features[0].f64_property("population"), Some(1520.0));
        assert!(parse_geojson_to_multipolygon(&features[0].geojson).is_some());
    }

    #[test]
    fn rejects_bare_geometry_as_collection() {
        let doc = r#"{"type": "Point", "coordinates": [0.5, 0.5]}"#;
        assert!(matches!(
            parse_area_features(doc, "code"),
            Err(SpatialError::NotFeatureCollection)
        ));
    }
}
