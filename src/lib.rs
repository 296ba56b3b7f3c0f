//! Tiled OpenStreetMap feature harvester.
//!
//! Fetches vector features covering an arbitrarily large region from a
//! rate-limited provider by splitting the region into a grid of small tiles,
//! fetching each tile independently, and aggregating the results under an
//! operator-chosen memory budget. One sampled tile drives a memory estimate
//! before anything is downloaded; a previously merged output can be
//! re-filtered in parallel chunks afterwards.

pub mod aggregate;
pub mod bridge;
pub mod cache;
pub mod config;
pub mod download;
pub mod estimate;
pub mod grid;
pub mod provider;
pub mod reprocess;

pub use aggregate::{AggregatedCollection, MemoryMode};
pub use cache::ResultCache;
pub use config::HarvestConfig;
pub use download::{run_download, run_with_cache, DownloadReport, RunStatus};
pub use estimate::{estimate_usage, RamEstimate};
pub use grid::{partition, BoundingBox, Tile};
pub use provider::{FeatureProvider, FeatureRecord, OverpassProvider, TagSet};
pub use reprocess::reprocess_file;
