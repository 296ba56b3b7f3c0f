use std::path::Path;

use geo::algorithm::coords_iter::CoordsIter;
use geo::Geometry;
use geojson::Feature;
use rayon::prelude::*;
use thiserror::Error;
use tracing::{debug, info};

use crate::bridge::{self, BridgeError};
use crate::provider::FeatureRecord;

#[derive(Debug, Error)]
pub enum ReprocessError {
    #[error("partition count must be positive")]
    InvalidPartitionCount,
    #[error(transparent)]
    Bridge(#[from] BridgeError),
}

/// Re-loads a previously finalized feature collection in `partitions`
/// near-equal chunks, filters out null and invalid geometries in each chunk
/// on the injected worker pool, and recombines the survivors into one
/// in-memory collection.
///
/// Partitions are disjoint by construction, so the filter runs without shared
/// mutable state. Record order is preserved within each partition. Failure of
/// any partition's filter step fails the whole call; the caller re-issues the
/// entire reprocessing request.
pub fn reprocess_file(
    path: &Path,
    partitions: usize,
    pool: &rayon::ThreadPool,
) -> Result<Vec<FeatureRecord>, ReprocessError> {
    if partitions == 0 {
        return Err(ReprocessError::InvalidPartitionCount);
    }

    let features = bridge::read_feature_collection(path)?;
    let total = features.len();
    let chunk_size = total.div_ceil(partitions).max(1);
    let chunks: Vec<&[Feature]> = features.chunks(chunk_size).collect();
    debug!(
        features = total,
        partitions = chunks.len(),
        chunk_size,
        "reprocessing in chunks"
    );

    let filtered: Vec<Vec<FeatureRecord>> = pool.install(|| {
        chunks
            .into_par_iter()
            .map(filter_partition)
            .collect::<Result<_, _>>()
    })?;

    let records: Vec<FeatureRecord> = filtered.into_iter().flatten().collect();
    info!(
        kept = records.len(),
        dropped = total - records.len(),
        "reprocessing complete"
    );
    Ok(records)
}

fn filter_partition(features: &[Feature]) -> Result<Vec<FeatureRecord>, ReprocessError> {
    let mut records = Vec::with_capacity(features.len());
    for feature in features {
        match bridge::feature_to_record(feature)? {
            Some(record) if is_valid_geometry(&record.geometry) => records.push(record),
            // Null geometries and degenerate shapes are dropped silently.
            _ => {}
        }
    }
    Ok(records)
}

/// A geometry is kept when every coordinate is finite and it has enough
/// points to be meaningful for its type.
pub fn is_valid_geometry(geometry: &Geometry<f64>) -> bool {
    if geometry.coords_iter().any(|c| !c.x.is_finite() || !c.y.is_finite()) {
        return false;
    }
    match geometry {
        Geometry::Point(_) | Geometry::MultiPoint(_) => geometry.coords_count() > 0,
        Geometry::LineString(line) => line.coords_count() >= 2,
        Geometry::MultiLineString(lines) => {
            !lines.0.is_empty() && lines.iter().all(|l| l.coords_count() >= 2)
        }
        Geometry::Polygon(polygon) => polygon.exterior().coords_count() >= 4,
        Geometry::MultiPolygon(polygons) => {
            !polygons.0.is_empty()
                && polygons.iter().all(|p| p.exterior().coords_count() >= 4)
        }
        _ => false,
    }
}
