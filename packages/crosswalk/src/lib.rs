#![cfg_attr(feature = "fail-on-warnings", deny(warnings))]
#![warn(clippy::all, clippy::pedantic, clippy::nursery, clippy::cargo)]
#![allow(clippy::multiple_crate_versions, clippy::cargo_common_metadata)]

//! Boundary-vintage crosswalk.
//!
//! Historical statistics are published on the boundaries that were current
//! at the time. [`AreaCrosswalk`] carries such values onto the current
//! vintage using pre-computed overlap fractions:
//!
//! * rate-like units (percentages, currency per capita, ratios) are not
//!   divisible by area, so every new area receives the old area's rate;
//!   merges are resolved by a `reverse_fraction`-weighted average.
//! * count-like units are apportioned by `overlap_fraction`; merges sum.
//!
//! Old areas without any mapping row are dropped with a warning rather
//! than imputed.

use std::collections::{BTreeMap, BTreeSet};

use area_score_geography_models::{CrosswalkMapping, MappingType};
use area_score_indicator_models::{IndicatorValue, Unit};

/// Errors raised while building a crosswalk.
#[derive(Debug, thiserror::Error)]
pub enum CrosswalkError {
    /// A mapping row carries a fraction outside `[0, 1]` or a non-finite
    /// value.
    #[error("Invalid fraction in mapping {old_code} -> {new_code}: {value}")]
    InvalidFraction {
        /// Old area code.
        old_code: String,
        /// New area code.
        new_code: String,
        /// Offending value.
        value: f64,
    },
}

/// Slack allowed above 1.0 for fractions computed from imperfect polygons.
const FRACTION_SLACK: f64 = 1e-6;

/// Result of mapping a batch of old-vintage values.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BulkMapping {
    /// Values keyed by new area code.
    pub values: BTreeMap<String, f64>,
    /// Old codes that had no mapping row.
    pub dropped: Vec<String>,
}

/// Summary of a crosswalk's consistency.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CrosswalkReport {
    /// Number of mapping rows per type.
    pub type_counts: BTreeMap<MappingType, usize>,
    /// Distinct old codes.
    pub distinct_old: usize,
    /// Distinct new codes.
    pub distinct_new: usize,
    /// Old codes whose overlap fractions do not sum to ~1.0, with the sum.
    pub bad_sums: Vec<(String, f64)>,
}

impl CrosswalkReport {
    /// Whether every old code's overlap fractions sum to ~1.0.
    #[must_use]
    pub fn is_consistent(&self) -> bool {
        self.bad_sums.is_empty()
    }
}

/// Overlap mappings from an old vintage onto the current one, grouped by
/// old code.
#[derive(Debug, Clone, Default)]
pub struct AreaCrosswalk {
    by_old: BTreeMap<String, Vec<CrosswalkMapping>>,
}

impl AreaCrosswalk {
    /// Builds a crosswalk, discarding rows whose overlap fraction does not
    /// exceed `min_overlap`.
    ///
    /// # Errors
    ///
    /// Returns [`CrosswalkError::InvalidFraction`] if any fraction is not a
    /// finite value in `[0, 1]`.
    pub fn new<I>(mappings: I, min_overlap: f64) -> Result<Self, CrosswalkError>
    where
        I: IntoIterator<Item = CrosswalkMapping>,
    {
        let mut by_old: BTreeMap<String, Vec<CrosswalkMapping>> = BTreeMap::new();
        let mut discarded = 0_usize;

        for mapping in mappings {
            for value in [mapping.overlap_fraction, mapping.reverse_fraction] {
                if !value.is_finite() || !(0.0..=1.0 + FRACTION_SLACK).contains(&value) {
                    return Err(CrosswalkError::InvalidFraction {
                        old_code: mapping.old_code,
                        new_code: mapping.new_code,
                        value,
                    });
                }
            }

            if mapping.overlap_fraction <= min_overlap {
                discarded += 1;
                continue;
            }

            by_old
                .entry(mapping.old_code.clone())
                .or_default()
                .push(mapping);
        }

        if discarded > 0 {
            log::debug!("Discarded {discarded} mappings at or below overlap {min_overlap}");
        }

        Ok(Self { by_old })
    }

    /// Number of mapping rows.
    #[must_use]
    pub fn len(&self) -> usize {
        self.by_old.values().map(Vec::len).sum()
    }

    /// Whether the crosswalk holds no mappings.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.by_old.is_empty()
    }

    /// Mapping rows for one old code.
    #[must_use]
    pub fn mappings_for(&self, old_code: &str) -> &[CrosswalkMapping] {
        self.by_old.get(old_code).map_or(&[], Vec::as_slice)
    }

    /// Maps one old-vintage value onto the new areas it overlaps.
    ///
    /// Returns an empty map (and logs a warning) when the old code has no
    /// mapping.
    #[must_use]
    pub fn map(&self, old_code: &str, raw_value: f64, unit: Unit) -> BTreeMap<String, f64> {
        let mappings = self.mappings_for(old_code);
        if mappings.is_empty() {
            log::warn!("No crosswalk mapping for old area {old_code}");
            return BTreeMap::new();
        }

        mappings
            .iter()
            .map(|m| {
                let value = if unit.is_rate() {
                    raw_value
                } else {
                    raw_value * m.overlap_fraction
                };
                (m.new_code.clone(), value)
            })
            .collect()
    }

    /// Maps a batch of old-vintage values, resolving merges.
    ///
    /// Rates landing on the same new area are averaged with
    /// `reverse_fraction` as weight, renormalized by the total weight so a
    /// 1:1 mapping returns the input unchanged. A new area whose total
    /// weight is zero is omitted. Counts are scaled by `overlap_fraction`
    /// and summed.
    #[must_use]
    pub fn bulk_map(&self, old_values: &BTreeMap<String, f64>, unit: Unit) -> BulkMapping {
        let is_rate = unit.is_rate();
        let mut sums: BTreeMap<String, f64> = BTreeMap::new();
        let mut weights: BTreeMap<String, f64> = BTreeMap::new();
        let mut dropped = Vec::new();

        for (old_code, raw_value) in old_values {
            let mappings = self.mappings_for(old_code);
            if mappings.is_empty() {
                dropped.push(old_code.clone());
                continue;
            }

            for mapping in mappings {
                if is_rate {
                    *sums.entry(mapping.new_code.clone()).or_default() +=
                        raw_value * mapping.reverse_fraction;
                    *weights.entry(mapping.new_code.clone()).or_default() +=
                        mapping.reverse_fraction;
                } else {
                    *sums.entry(mapping.new_code.clone()).or_default() +=
                        raw_value * mapping.overlap_fraction;
                }
            }
        }

        if !dropped.is_empty() {
            log::warn!(
                "Dropped {} old areas with no crosswalk mapping (first: {})",
                dropped.len(),
                dropped[0]
            );
        }

        let values = if is_rate {
            sums.into_iter()
                .filter_map(|(new_code, weighted_sum)| {
                    let total = weights.get(&new_code).copied().unwrap_or(0.0);
                    if total > 0.0 {
                        Some((new_code, weighted_sum / total))
                    } else {
                        log::warn!("Zero total overlap weight for new area {new_code}; omitted");
                        None
                    }
                })
                .collect()
        } else {
            sums
        };

        BulkMapping { values, dropped }
    }

    /// Carries a set of old-vintage indicator rows onto the new vintage.
    ///
    /// Rows are grouped by `(indicator, year)` and mapped in bulk; rows
    /// without a raw value are ignored. The unit is looked up per
    /// indicator slug; indicators without a unit are skipped.
    #[must_use]
    pub fn remap_values<F>(&self, values: &[IndicatorValue], unit_of: F) -> Vec<IndicatorValue>
    where
        F: Fn(&str) -> Option<Unit>,
    {
        let mut groups: BTreeMap<(&str, i32), BTreeMap<String, f64>> = BTreeMap::new();
        for value in values {
            let Some(raw) = value.raw_value else {
                continue;
            };
            groups
                .entry((value.indicator.as_str(), value.year))
                .or_default()
                .insert(value.area_code.clone(), raw);
        }

        let mut remapped = Vec::new();
        for ((indicator, year), old_values) in groups {
            let Some(unit) = unit_of(indicator) else {
                log::warn!("Unknown indicator '{indicator}' in historical values; skipped");
                continue;
            };

            let mapped = self.bulk_map(&old_values, unit);
            log::info!(
                "Crosswalked {indicator} {year}: {} old areas -> {} new areas ({} dropped)",
                old_values.len(),
                mapped.values.len(),
                mapped.dropped.len()
            );

            remapped.extend(
                mapped
                    .values
                    .into_iter()
                    .map(|(code, v)| IndicatorValue::raw(code, indicator, year, v)),
            );
        }

        remapped
    }

    /// Checks that every old code's overlap fractions sum to 1.0 within
    /// `tolerance` and tallies mapping types.
    #[must_use]
    pub fn validate(&self, tolerance: f64) -> CrosswalkReport {
        let mut report = CrosswalkReport {
            distinct_old: self.by_old.len(),
            ..CrosswalkReport::default()
        };
        let mut new_codes = BTreeSet::new();

        for (old_code, mappings) in &self.by_old {
            let mut sum = 0.0;
            for mapping in mappings {
                sum += mapping.overlap_fraction;
                new_codes.insert(mapping.new_code.as_str());
                *report.type_counts.entry(mapping.mapping_type()).or_default() += 1;
            }

            if (sum - 1.0).abs() > tolerance {
                report.bad_sums.push((old_code.clone(), sum));
            }
        }
        report.distinct_new = new_codes.len();

        if report.bad_sums.is_empty() {
            log::info!("All old codes have overlap fractions summing to ~1.0");
        } else {
            log::warn!(
                "{} old codes have overlap fractions not summing to ~1.0",
                report.bad_sums.len()
            );
        }

        report
    }

    /// Current-vintage codes whose boundaries changed: every code that is
    /// not the target of exactly one 1:1 mapping. Returns an empty set when
    /// the crosswalk is empty.
    #[must_use]
    pub fn changed_codes<'a, I>(&self, current_codes: I) -> BTreeSet<String>
    where
        I: IntoIterator<Item = &'a str>,
    {
        if self.is_empty() {
            return BTreeSet::new();
        }

        let mut incoming: BTreeMap<&str, Vec<MappingType>> = BTreeMap::new();
        for mapping in self.by_old.values().flatten() {
            incoming
                .entry(mapping.new_code.as_str())
                .or_default()
                .push(mapping.mapping_type());
        }

        current_codes
            .into_iter()
            .filter(|code| {
                !matches!(
                    incoming.get(code).map(Vec::as_slice),
                    Some([MappingType::OneToOne])
                )
            })
            .map(str::to_string)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mapping(old: &str, new: &str, overlap: f64, reverse: f64) -> CrosswalkMapping {
        CrosswalkMapping {
            old_code: old.to_string(),
            new_code: new.to_string(),
            overlap_fraction: overlap,
            reverse_fraction: reverse,
        }
    }

    fn crosswalk() -> AreaCrosswalk {
        AreaCrosswalk::new(
            vec![
                // OLD1 split into N1 and N2
                mapping("OLD1", "N1", 0.6, 1.0),
                mapping("OLD1", "N2", 0.4, 1.0),
                // OLD2 and OLD3 merged into N3
                mapping("OLD2", "N3", 1.0, 0.25),
                mapping("OLD3", "N3", 1.0, 0.75),
                // OLD4 unchanged
                mapping("OLD4", "N4", 1.0, 1.0),
                // sliver below threshold
                mapping("OLD4", "N5", 0.005, 0.001),
            ],
            0.01,
        )
        .unwrap()
    }

    #[test]
    fn split_copies_rates() {
        let mapped = crosswalk().map("OLD1", 12.5, Unit::Percent);
        assert_eq!(mapped.len(), 2);
        assert!((mapped["N1"] - 12.5).abs() < f64::EPSILON);
        assert!((mapped["N2"] - 12.5).abs() < f64::EPSILON);
    }

    #[test]
    fn split_apportions_counts() {
        let mapped = crosswalk().map("OLD1", 1000.0, Unit::Count);
        assert!((mapped["N1"] - 600.0).abs() < 1e-9);
        assert!((mapped["N2"] - 400.0).abs() < 1e-9);
    }

    #[test]
    fn unmapped_code_maps_to_nothing() {
        assert!(crosswalk().map("GONE", 5.0, Unit::Percent).is_empty());
    }

    #[test]
    fn bulk_merge_weights_rates_by_reverse_fraction() {
        let old: BTreeMap<String, f64> = [
            ("OLD2".to_string(), 10.0),
            ("OLD3".to_string(), 20.0),
            ("OLD4".to_string(), 7.0),
            ("GONE".to_string(), 99.0),
        ]
        .into_iter()
        .collect();

        let mapped = crosswalk().bulk_map(&old, Unit::Percent);
        assert!((mapped.values["N3"] - 17.5).abs() < 1e-9);
        // 1:1 returned unchanged
        assert!((mapped.values["N4"] - 7.0).abs() < 1e-12);
        assert!(!mapped.values.contains_key("N5"));
        assert_eq!(mapped.dropped, vec!["GONE".to_string()]);
    }

    #[test]
    fn bulk_merge_sums_counts() {
        let old: BTreeMap<String, f64> = [("OLD2".to_string(), 100.0), ("OLD3".to_string(), 300.0)]
            .into_iter()
            .collect();

        let mapped = crosswalk().bulk_map(&old, Unit::Count);
        assert!((mapped.values["N3"] - 400.0).abs() < 1e-9);
    }

    #[test]
    fn zero_reverse_weight_is_omitted_not_nan() {
        let cw = AreaCrosswalk::new(vec![mapping("A", "X", 1.0, 0.0)], 0.01).unwrap();
        let old: BTreeMap<String, f64> = [("A".to_string(), 3.0)].into_iter().collect();

        let mapped = cw.bulk_map(&old, Unit::Rate);
        assert!(mapped.values.is_empty());
        assert!(mapped.dropped.is_empty());
    }

    #[test]
    fn invalid_fraction_rejected() {
        let result = AreaCrosswalk::new(vec![mapping("A", "X", f64::NAN, 1.0)], 0.01);
        assert!(matches!(result, Err(CrosswalkError::InvalidFraction { .. })));

        let result = AreaCrosswalk::new(vec![mapping("A", "X", 1.0, 1.4)], 0.01);
        assert!(matches!(result, Err(CrosswalkError::InvalidFraction { .. })));
    }

    #[test]
    fn overlap_sums_within_tolerance() {
        let report = crosswalk().validate(0.05);
        assert!(report.is_consistent());
        assert_eq!(report.distinct_old, 4);
        assert_eq!(report.distinct_new, 4);
        assert_eq!(report.type_counts[&MappingType::OneToOne], 1);
        assert_eq!(report.type_counts[&MappingType::Split], 2);
        assert_eq!(report.type_counts[&MappingType::Merge], 2);

        let lossy = AreaCrosswalk::new(vec![mapping("A", "X", 0.7, 1.0)], 0.01).unwrap();
        let report = lossy.validate(0.05);
        assert_eq!(report.bad_sums.len(), 1);
        assert!((report.bad_sums[0].1 - 0.7).abs() < 1e-12);
    }

    #[test]
    fn changed_codes_exclude_one_to_one() {
        let changed = crosswalk().changed_codes(["N1", "N2", "N3", "N4", "N9"]);
        let expected: BTreeSet<String> = ["N1", "N2", "N3", "N9"]
            .into_iter()
            .map(str::to_string)
            .collect();
        assert_eq!(changed, expected);

        assert!(AreaCrosswalk::default().changed_codes(["N1"]).is_empty());
    }

    #[test]
    fn remaps_indicator_rows() {
        let rows = vec![
            IndicatorValue::raw("OLD1", "employment_rate", 2018, 71.0),
            IndicatorValue::raw("OLD1", "population", 2018, 1000.0),
        ];
        let remapped = crosswalk().remap_values(&rows, |slug| match slug {
            "employment_rate" => Some(Unit::Percent),
            "population" => Some(Unit::Count),
            _ => None,
        });

        assert_eq!(remapped.len(), 4);
        let pop_n2 = remapped
            .iter()
            .find(|v| v.indicator == "population" && v.area_code == "N2")
            .unwrap();
        assert!((pop_n2.raw_value.unwrap() - 400.0).abs() < 1e-9);
        assert!(remapped.iter().all(|v| v.year == 2018));
    }
}
