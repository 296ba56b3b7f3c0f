use thiserror::Error;
use tracing::{debug, info, warn};

use crate::aggregate::{
    aggregator_for, AggregatedCollection, AggregationError, MemoryMode, TileBatch,
};
use crate::bridge;
use crate::cache::ResultCache;
use crate::config::HarvestConfig;
use crate::grid::{GridError, Tile};
use crate::provider::{FeatureProvider, TagSet};

#[derive(Debug, Error)]
pub enum DownloadError {
    #[error(transparent)]
    Aggregation(#[from] AggregationError),
    #[error(transparent)]
    Grid(#[from] GridError),
}

/// Terminal state of a run. A run in which no tile produced any feature is a
/// distinct successful outcome, not an error.
#[derive(Debug)]
pub enum RunStatus {
    Completed(AggregatedCollection),
    NoFeatures,
}

/// Run-scoped result returned from the pipeline entry point. Per-tile fetch
/// failures are surfaced here as a structured count, never re-raised.
#[derive(Debug)]
pub struct DownloadReport {
    pub tiles_total: usize,
    pub tiles_with_features: usize,
    pub tiles_empty: usize,
    pub tiles_failed: usize,
    pub feature_count: usize,
    pub status: RunStatus,
}

/// Drives every tile through the provider in partition order, strictly one
/// fetch outstanding at a time, and routes non-empty results into the
/// selected strategy's sink.
///
/// A single tile failure never aborts the run: the tile is skipped with a
/// warning and counted. Aggregation failures are fatal. `finalize` runs
/// exactly once, after the last tile.
pub fn run_download<P: FeatureProvider>(
    provider: &P,
    tiles: &[Tile],
    tags: &TagSet,
    mode: MemoryMode,
    config: &HarvestConfig,
) -> Result<DownloadReport, DownloadError> {
    let mut aggregator = aggregator_for(mode, config)?;
    info!(
        tiles = tiles.len(),
        %tags,
        mode = mode.as_str(),
        "starting tiled download"
    );

    let mut tiles_with_features = 0;
    let mut tiles_empty = 0;
    let mut tiles_failed = 0;
    let mut feature_count = 0;

    for (index, tile) in tiles.iter().enumerate() {
        debug!(tile = index + 1, total = tiles.len(), "fetching tile");
        match provider.fetch_features(&tile.bbox()?, tags) {
            Ok(set) if set.records.is_empty() => {
                tiles_empty += 1;
            }
            Ok(set) => {
                feature_count += set.records.len();
                tiles_with_features += 1;
                aggregator.accept(TileBatch {
                    tile: *tile,
                    crs: set.crs,
                    records: set.records,
                })?;
            }
            Err(e) => {
                warn!(tile = index + 1, error = %e, "tile fetch failed, skipping");
                tiles_failed += 1;
            }
        }
    }

    let collection = aggregator.finalize()?;
    let status = if feature_count == 0 {
        info!("no features found in any tile");
        RunStatus::NoFeatures
    } else {
        info!(
            features = feature_count,
            contributing = tiles_with_features,
            failed = tiles_failed,
            "download complete"
        );
        RunStatus::Completed(collection)
    };

    Ok(DownloadReport {
        tiles_total: tiles.len(),
        tiles_with_features,
        tiles_empty,
        tiles_failed,
        feature_count,
        status,
    })
}

/// Runs a download and publishes the serialized collection to the shared
/// cache slot. The generation taken at the start rejects stale overwrites
/// from an older run that finishes late. Empty runs leave the slot unset.
pub fn run_with_cache<P: FeatureProvider>(
    provider: &P,
    tiles: &[Tile],
    tags: &TagSet,
    mode: MemoryMode,
    config: &HarvestConfig,
    cache: &ResultCache,
) -> Result<DownloadReport, DownloadError> {
    let generation = cache.begin_run();
    let report = run_download(provider, tiles, tags, mode, config)?;
    if let RunStatus::Completed(collection) = &report.status {
        if let Some(records) = collection.records() {
            let body = bridge::collection_to_geojson_string(records)
                .map_err(AggregationError::from)?;
            cache.store(generation, body);
        }
    }
    Ok(report)
}
