use std::mem;

use geo::algorithm::coords_iter::CoordsIter;
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, info};

use crate::grid::{self, BoundingBox, GridError, Tile};
use crate::provider::{FeatureProvider, FeatureRecord, ProviderError, TagSet};

/// Partition-order index of the tile sampled for the estimate. Grids with
/// fewer tiles fall back to the last tile.
const SAMPLE_TILE_INDEX: usize = 2;

#[derive(Debug, Error)]
pub enum EstimateError {
    #[error(transparent)]
    Grid(#[from] GridError),
    #[error("sample tile fetch failed: {0}")]
    SampleFetch(#[source] ProviderError),
}

/// Projected memory cost of a full run, derived from one sampled tile.
/// Derived data, never persisted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RamEstimate {
    pub tile_count: usize,
    pub sample_footprint_bytes: usize,
    pub projected_total_bytes: usize,
}

/// Samples one representative tile, measures its in-memory footprint, and
/// extrapolates linearly over the whole grid. Returns the tile list alongside
/// the estimate so callers need not re-partition.
///
/// Issues exactly one fetch against the provider. A failed sample fetch is an
/// error; there is no fall-back to a zero estimate.
pub fn estimate_usage<P: FeatureProvider>(
    provider: &P,
    bbox: &BoundingBox,
    tags: &TagSet,
    tile_size_deg: f64,
) -> Result<(RamEstimate, Vec<Tile>), EstimateError> {
    let tiles = grid::partition(bbox, tile_size_deg)?;
    let sample = tiles
        .get(SAMPLE_TILE_INDEX)
        .or_else(|| tiles.last())
        .copied()
        .ok_or(GridError::InvalidTileSize(tile_size_deg))?;

    debug!(?sample, total = tiles.len(), "fetching sample tile");
    let set = provider
        .fetch_features(&sample.bbox()?, tags)
        .map_err(EstimateError::SampleFetch)?;

    let sample_footprint_bytes: usize = set.records.iter().map(record_footprint).sum();
    let estimate = RamEstimate {
        tile_count: tiles.len(),
        sample_footprint_bytes,
        projected_total_bytes: sample_footprint_bytes * tiles.len(),
    };
    info!(
        tiles = estimate.tile_count,
        sample_bytes = estimate.sample_footprint_bytes,
        projected_bytes = estimate.projected_total_bytes,
        "usage estimate ready"
    );
    Ok((estimate, tiles))
}

/// Deep footprint of one record: struct overhead, coordinate storage, and the
/// attribute map's keys and values.
pub fn record_footprint(record: &FeatureRecord) -> usize {
    let coords = record.geometry.coords_count() * mem::size_of::<geo::Coord<f64>>();
    let properties: usize = record
        .properties
        .iter()
        .map(|(key, value)| key.len() + value_footprint(value))
        .sum();
    mem::size_of::<FeatureRecord>() + coords + properties
}

fn value_footprint(value: &Value) -> usize {
    let nested = match value {
        Value::String(s) => s.len(),
        Value::Array(items) => items.iter().map(value_footprint).sum(),
        Value::Object(map) => map
            .iter()
            .map(|(key, value)| key.len() + value_footprint(value))
            .sum(),
        _ => 0,
    };
    mem::size_of::<Value>() + nested
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::FeatureSet;
    use geo::Point;
    use serde_json::json;
    use std::cell::Cell;

    struct FixedProvider {
        records_per_fetch: usize,
        fetches: Cell<usize>,
    }

    impl FixedProvider {
        fn new(records_per_fetch: usize) -> Self {
            Self {
                records_per_fetch,
                fetches: Cell::new(0),
            }
        }
    }

    impl FeatureProvider for FixedProvider {
        fn geocode(&self, location: &str) -> Result<BoundingBox, ProviderError> {
            Err(ProviderError::Geocoding {
                location: location.to_string(),
                reason: "not supported in tests".to_string(),
            })
        }

        fn fetch_features(
            &self,
            _bbox: &BoundingBox,
            _tags: &TagSet,
        ) -> Result<FeatureSet, ProviderError> {
            self.fetches.set(self.fetches.get() + 1);
            let records = (0..self.records_per_fetch)
                .map(|i| FeatureRecord {
                    geometry: geo::Geometry::Point(Point::new(i as f64, i as f64)),
                    properties: [("highway".to_string(), json!("residential"))]
                        .into_iter()
                        .collect(),
                })
                .collect();
            Ok(FeatureSet {
                crs: crate::provider::WGS84.to_string(),
                records,
            })
        }
    }

    #[test]
    fn projection_scales_linearly_with_tile_count() {
        let provider = FixedProvider::new(4);
        let tags = TagSet::from_tags(["highway"]);

        let small = BoundingBox::new(1.0, 0.0, 2.0, 0.0).unwrap();
        let large = BoundingBox::new(2.0, 0.0, 4.0, 0.0).unwrap();
        let (small_estimate, small_tiles) =
            estimate_usage(&provider, &small, &tags, 1.0).unwrap();
        let (large_estimate, large_tiles) =
            estimate_usage(&provider, &large, &tags, 1.0).unwrap();

        assert_eq!(small_tiles.len(), 2);
        assert_eq!(large_tiles.len(), 8);
        assert_eq!(
            small_estimate.projected_total_bytes,
            small_estimate.sample_footprint_bytes * small_estimate.tile_count
        );
        // Same sample footprint, four times the tiles: four times the projection.
        assert_eq!(
            large_estimate.sample_footprint_bytes,
            small_estimate.sample_footprint_bytes
        );
        assert_eq!(
            large_estimate.projected_total_bytes,
            small_estimate.projected_total_bytes * 4
        );
    }

    #[test]
    fn estimator_issues_exactly_one_fetch() {
        let provider = FixedProvider::new(1);
        let bbox = BoundingBox::new(3.0, 0.0, 3.0, 0.0).unwrap();
        let (estimate, tiles) =
            estimate_usage(&provider, &bbox, &TagSet::from_tags(["highway"]), 1.0).unwrap();
        assert_eq!(provider.fetches.get(), 1);
        assert_eq!(estimate.tile_count, 9);
        assert_eq!(tiles.len(), 9);
    }

    #[test]
    fn sample_fetch_failure_is_an_error_not_a_zero_estimate() {
        struct FailingProvider;
        impl FeatureProvider for FailingProvider {
            fn geocode(&self, _location: &str) -> Result<BoundingBox, ProviderError> {
                unreachable!()
            }
            fn fetch_features(
                &self,
                _bbox: &BoundingBox,
                _tags: &TagSet,
            ) -> Result<FeatureSet, ProviderError> {
                Err(ProviderError::Status {
                    endpoint: "overpass".to_string(),
                    status: 429,
                })
            }
        }

        let bbox = BoundingBox::new(1.0, 0.0, 1.0, 0.0).unwrap();
        let result = estimate_usage(&FailingProvider, &bbox, &TagSet::default(), 1.0);
        assert!(matches!(result, Err(EstimateError::SampleFetch(_))));
    }

    #[test]
    fn footprint_counts_geometry_and_attributes() {
        let small = FeatureRecord {
            geometry: geo::Geometry::Point(Point::new(0.0, 0.0)),
            properties: Default::default(),
        };
        let larger = FeatureRecord {
            geometry: geo::Geometry::LineString(geo::LineString::new(vec![
                (0.0, 0.0).into(),
                (1.0, 1.0).into(),
                (2.0, 2.0).into(),
            ])),
            properties: [("name".to_string(), json!("long street name here"))]
                .into_iter()
                .collect(),
        };
        assert!(record_footprint(&larger) > record_footprint(&small));
    }
}
