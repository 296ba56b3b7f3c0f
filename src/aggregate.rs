use std::path::PathBuf;
use std::str::FromStr;

use tempfile::TempDir;
use thiserror::Error;
use tracing::{debug, info};

use crate::bridge::{self, BridgeError, FeatureStreamWriter};
use crate::config::HarvestConfig;
use crate::grid::Tile;
use crate::provider::{FeatureRecord, WGS84};

#[derive(Debug, Error)]
pub enum AggregationError {
    #[error("aggregation I/O failure: {0}")]
    Bridge(#[from] BridgeError),
    #[error("failed to create staging directory: {0}")]
    Staging(#[source] std::io::Error),
    #[error("tile reports CRS {found} but this run is fixed to {expected}")]
    CrsMismatch { expected: String, found: String },
}

#[derive(Debug, Error)]
#[error("unknown memory mode '{0}', expected ram|disk|stream|merge|manual")]
pub struct ModeParseError(String);

/// Memory/latency trade-off selected by the operator, one value per
/// aggregation strategy. Unrecognized selector strings are rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemoryMode {
    Ram,
    Disk,
    Stream,
    Merge,
    Manual,
}

impl MemoryMode {
    pub const ALL: [MemoryMode; 5] = [
        MemoryMode::Ram,
        MemoryMode::Disk,
        MemoryMode::Stream,
        MemoryMode::Merge,
        MemoryMode::Manual,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            MemoryMode::Ram => "ram",
            MemoryMode::Disk => "disk",
            MemoryMode::Stream => "stream",
            MemoryMode::Merge => "merge",
            MemoryMode::Manual => "manual",
        }
    }
}

impl FromStr for MemoryMode {
    type Err = ModeParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "ram" => Ok(MemoryMode::Ram),
            "disk" => Ok(MemoryMode::Disk),
            "stream" => Ok(MemoryMode::Stream),
            "merge" => Ok(MemoryMode::Merge),
            "manual" => Ok(MemoryMode::Manual),
            other => Err(ModeParseError(other.to_string())),
        }
    }
}

/// One tile's non-empty fetch result, handed to the active strategy.
#[derive(Debug)]
pub struct TileBatch {
    pub tile: Tile,
    pub crs: String,
    pub records: Vec<FeatureRecord>,
}

/// The finalized output of a run. `Loaded` holds the records in memory;
/// `Persisted` points at a written collection that may be loaded on request;
/// `Unloaded` is the manual-deferred terminal state whose file is never read
/// back by this process.
#[derive(Debug)]
pub enum AggregatedCollection {
    Loaded {
        crs: String,
        records: Vec<FeatureRecord>,
    },
    Persisted {
        path: PathBuf,
        feature_count: usize,
    },
    Unloaded {
        path: PathBuf,
    },
}

impl AggregatedCollection {
    pub fn records(&self) -> Option<&[FeatureRecord]> {
        match self {
            AggregatedCollection::Loaded { records, .. } => Some(records),
            _ => None,
        }
    }

    /// `None` for the unloaded variant, whose contents are deliberately
    /// unknown to this process.
    pub fn feature_count(&self) -> Option<usize> {
        match self {
            AggregatedCollection::Loaded { records, .. } => Some(records.len()),
            AggregatedCollection::Persisted { feature_count, .. } => Some(*feature_count),
            AggregatedCollection::Unloaded { .. } => None,
        }
    }

    pub fn output_path(&self) -> Option<&std::path::Path> {
        match self {
            AggregatedCollection::Loaded { .. } => None,
            AggregatedCollection::Persisted { path, .. } => Some(path),
            AggregatedCollection::Unloaded { path } => Some(path),
        }
    }
}

/// The single capability the orchestrator sees: push one tile's records in,
/// finalize exactly once when every tile has been processed.
pub trait Aggregator {
    fn accept(&mut self, batch: TileBatch) -> Result<(), AggregationError>;

    fn finalize(self: Box<Self>) -> Result<AggregatedCollection, AggregationError>;
}

/// Builds the strategy for `mode`. Called once per run; the strategy is never
/// switched mid-run.
pub fn aggregator_for(
    mode: MemoryMode,
    config: &HarvestConfig,
) -> Result<Box<dyn Aggregator>, AggregationError> {
    let output_path = config.geojson_output_path();
    let aggregator: Box<dyn Aggregator> = match mode {
        MemoryMode::Ram => Box::new(RamAggregator::new()),
        MemoryMode::Disk => Box::new(DiskAggregator::new()?),
        MemoryMode::Stream => Box::new(StreamAggregator::new(output_path)?),
        MemoryMode::Merge => Box::new(MergeAggregator::new(output_path)),
        MemoryMode::Manual => Box::new(ManualAggregator::new(output_path)?),
    };
    Ok(aggregator)
}

/// The run CRS is fixed by the first non-empty tile result; later tiles must
/// match it. Mixed-CRS input is rejected rather than silently concatenated.
fn pin_crs(slot: &mut Option<String>, incoming: &str) -> Result<(), AggregationError> {
    match slot {
        Some(expected) if expected != incoming => Err(AggregationError::CrsMismatch {
            expected: expected.clone(),
            found: incoming.to_string(),
        }),
        Some(_) => Ok(()),
        None => {
            *slot = Some(incoming.to_string());
            Ok(())
        }
    }
}

/// Holds every tile's record set in memory and concatenates on finalize.
struct RamAggregator {
    held: Vec<Vec<FeatureRecord>>,
    crs: Option<String>,
}

impl RamAggregator {
    fn new() -> Self {
        Self {
            held: Vec::new(),
            crs: None,
        }
    }
}

impl Aggregator for RamAggregator {
    fn accept(&mut self, batch: TileBatch) -> Result<(), AggregationError> {
        pin_crs(&mut self.crs, &batch.crs)?;
        self.held.push(batch.records);
        Ok(())
    }

    fn finalize(self: Box<Self>) -> Result<AggregatedCollection, AggregationError> {
        let records: Vec<FeatureRecord> = self.held.into_iter().flatten().collect();
        info!(features = records.len(), "finalized in-memory collection");
        Ok(AggregatedCollection::Loaded {
            crs: self.crs.unwrap_or_else(|| WGS84.to_string()),
            records,
        })
    }
}

/// Serializes each tile to a temporary columnar file, keeping only one tile
/// resident at a time; finalize reads every staged file back.
struct DiskAggregator {
    staging: TempDir,
    staged: Vec<PathBuf>,
    crs: Option<String>,
}

impl DiskAggregator {
    fn new() -> Result<Self, AggregationError> {
        let staging = TempDir::new().map_err(AggregationError::Staging)?;
        debug!(dir = %staging.path().display(), "created staging directory");
        Ok(Self {
            staging,
            staged: Vec::new(),
            crs: None,
        })
    }
}

impl Aggregator for DiskAggregator {
    fn accept(&mut self, batch: TileBatch) -> Result<(), AggregationError> {
        pin_crs(&mut self.crs, &batch.crs)?;
        let path = self
            .staging
            .path()
            .join(format!("tile_{:05}.parquet", self.staged.len()));
        bridge::write_parquet(&path, &batch.records)?;
        self.staged.push(path);
        Ok(())
    }

    fn finalize(self: Box<Self>) -> Result<AggregatedCollection, AggregationError> {
        let mut records = Vec::new();
        for path in &self.staged {
            records.extend(bridge::read_parquet(path)?);
        }
        info!(
            features = records.len(),
            staged_files = self.staged.len(),
            "finalized disk-staged collection"
        );
        // TempDir removes the staged files when dropped here.
        Ok(AggregatedCollection::Loaded {
            crs: self.crs.unwrap_or_else(|| WGS84.to_string()),
            records,
        })
    }
}

/// Streams every record straight into the output file as it arrives.
struct StreamAggregator {
    writer: FeatureStreamWriter,
    crs: Option<String>,
}

impl StreamAggregator {
    fn new(path: PathBuf) -> Result<Self, AggregationError> {
        Ok(Self {
            writer: FeatureStreamWriter::create(&path)?,
            crs: None,
        })
    }
}

impl Aggregator for StreamAggregator {
    fn accept(&mut self, batch: TileBatch) -> Result<(), AggregationError> {
        pin_crs(&mut self.crs, &batch.crs)?;
        for record in &batch.records {
            self.writer.write_record(record)?;
        }
        Ok(())
    }

    fn finalize(self: Box<Self>) -> Result<AggregatedCollection, AggregationError> {
        let (path, feature_count) = self.writer.finish()?;
        info!(features = feature_count, path = %path.display(), "finalized streamed collection");
        Ok(AggregatedCollection::Persisted {
            path,
            feature_count,
        })
    }
}

/// Accumulates everything in one in-memory list and writes the collection as
/// a single JSON document at the end. A simpler, non-streaming fallback.
struct MergeAggregator {
    records: Vec<FeatureRecord>,
    crs: Option<String>,
    path: PathBuf,
}

impl MergeAggregator {
    fn new(path: PathBuf) -> Self {
        Self {
            records: Vec::new(),
            crs: None,
            path,
        }
    }
}

impl Aggregator for MergeAggregator {
    fn accept(&mut self, batch: TileBatch) -> Result<(), AggregationError> {
        pin_crs(&mut self.crs, &batch.crs)?;
        self.records.extend(batch.records);
        Ok(())
    }

    fn finalize(self: Box<Self>) -> Result<AggregatedCollection, AggregationError> {
        bridge::write_geojson_file(&self.path, &self.records)?;
        info!(features = self.records.len(), path = %self.path.display(), "finalized merged collection");
        Ok(AggregatedCollection::Persisted {
            path: self.path,
            feature_count: self.records.len(),
        })
    }
}

/// Streams tiles to the shared output file but never loads the result back;
/// the operator performs any further loading out-of-band.
struct ManualAggregator {
    writer: FeatureStreamWriter,
    crs: Option<String>,
}

impl ManualAggregator {
    fn new(path: PathBuf) -> Result<Self, AggregationError> {
        Ok(Self {
            writer: FeatureStreamWriter::create(&path)?,
            crs: None,
        })
    }
}

impl Aggregator for ManualAggregator {
    fn accept(&mut self, batch: TileBatch) -> Result<(), AggregationError> {
        pin_crs(&mut self.crs, &batch.crs)?;
        for record in &batch.records {
            self.writer.write_record(record)?;
        }
        Ok(())
    }

    fn finalize(self: Box<Self>) -> Result<AggregatedCollection, AggregationError> {
        let (path, feature_count) = self.writer.finish()?;
        info!(features = feature_count, path = %path.display(), "wrote deferred collection, leaving it unloaded");
        Ok(AggregatedCollection::Unloaded { path })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::grid::{partition, BoundingBox};
    use geo::{Geometry, Point};
    use serde_json::json;

    fn tile() -> Tile {
        let bbox = BoundingBox::new(1.0, 0.0, 1.0, 0.0).unwrap();
        partition(&bbox, 1.0).unwrap()[0]
    }

    fn batch(count: usize, start: usize) -> TileBatch {
        TileBatch {
            tile: tile(),
            crs: WGS84.to_string(),
            records: (start..start + count)
                .map(|i| FeatureRecord {
                    geometry: Geometry::Point(Point::new(i as f64, i as f64)),
                    properties: [("osm_id".to_string(), json!(i))].into_iter().collect(),
                })
                .collect(),
        }
    }

    #[test]
    fn unknown_mode_is_rejected() {
        assert!("ram".parse::<MemoryMode>().is_ok());
        assert!("auto".parse::<MemoryMode>().is_err());
        assert!("RAM".parse::<MemoryMode>().is_err());
    }

    #[test]
    fn ram_strategy_concatenates_in_acceptance_order() {
        let mut aggregator: Box<dyn Aggregator> = Box::new(RamAggregator::new());
        aggregator.accept(batch(2, 0)).unwrap();
        aggregator.accept(batch(1, 2)).unwrap();
        let collection = aggregator.finalize().unwrap();
        let records = collection.records().unwrap();
        assert_eq!(records.len(), 3);
        assert_eq!(records[2].properties["osm_id"], json!(2));
    }

    #[test]
    fn crs_mismatch_is_fatal() {
        let mut aggregator = RamAggregator::new();
        aggregator.accept(batch(1, 0)).unwrap();
        let mut foreign = batch(1, 1);
        foreign.crs = "EPSG:25832".to_string();
        assert!(matches!(
            aggregator.accept(foreign),
            Err(AggregationError::CrsMismatch { .. })
        ));
    }

    #[test]
    fn disk_strategy_round_trips_through_staging_files() {
        let mut aggregator = Box::new(DiskAggregator::new().unwrap());
        aggregator.accept(batch(2, 0)).unwrap();
        aggregator.accept(batch(3, 2)).unwrap();
        let collection = (aggregator as Box<dyn Aggregator>).finalize().unwrap();
        let records = collection.records().unwrap();
        assert_eq!(records.len(), 5);
        let ids: Vec<_> = records
            .iter()
            .map(|r| r.properties["osm_id"].to_string())
            .collect();
        assert_eq!(ids, ["0", "1", "2", "3", "4"]);
    }

    #[test]
    fn manual_strategy_reports_path_only() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("osm_features.geojson");
        let mut aggregator = Box::new(ManualAggregator::new(path.clone()).unwrap());
        aggregator.accept(batch(2, 0)).unwrap();
        let collection = (aggregator as Box<dyn Aggregator>).finalize().unwrap();
        assert!(collection.records().is_none());
        assert_eq!(collection.feature_count(), None);
        assert_eq!(collection.output_path(), Some(path.as_path()));
        // The file itself is complete and parseable, out-of-band.
        let body = std::fs::read_to_string(&path).unwrap();
        assert_eq!(crate::bridge::parse_geojson_string(&body).unwrap().len(), 2);
    }
}
