use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};

use serde::Deserialize;
use thiserror::Error;
use tracing::warn;

use crate::grid::Tile;

/// Tile edge length in degrees, roughly one square kilometre at the equator.
pub const DEFAULT_TILE_SIZE_DEG: f64 = 0.009;

/// Hard cap on tiles fetched in one run, protecting the rate-limited provider.
pub const MAX_TILES_HARD_LIMIT: usize = 50;

/// Multiplier applied to the linear memory projection before it is shown to
/// the operator. The projection itself stays linear; see `estimate`.
pub const RAM_SAFETY_FACTOR: usize = 3;

/// Well-known name of the exported feature collection.
pub const GEOJSON_FILE_NAME: &str = "osm_features.geojson";

/// Well-known name of the converted columnar artifact.
pub const PARQUET_FILE_NAME: &str = "osm_features.parquet";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse config file: {0}")]
    Parse(#[from] serde_json::Error),
}

/// Run configuration. `Default` reproduces the constants the pipeline has
/// always used; a JSON file or CLI flags can override individual fields.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct HarvestConfig {
    pub tile_size_deg: f64,
    pub max_tiles: usize,
    pub output_dir: PathBuf,
    pub fetch_timeout_secs: u64,
    pub nominatim_url: String,
    pub overpass_url: String,
    pub user_agent: String,
}

impl Default for HarvestConfig {
    fn default() -> Self {
        Self {
            tile_size_deg: DEFAULT_TILE_SIZE_DEG,
            max_tiles: MAX_TILES_HARD_LIMIT,
            output_dir: PathBuf::from("."),
            fetch_timeout_secs: 25,
            nominatim_url: "https://nominatim.openstreetmap.org".to_string(),
            overpass_url: "https://overpass-api.de/api/interpreter".to_string(),
            user_agent: concat!("osm-harvester/", env!("CARGO_PKG_VERSION")).to_string(),
        }
    }
}

impl HarvestConfig {
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let file = File::open(path)?;
        let config = serde_json::from_reader(BufReader::new(file))?;
        Ok(config)
    }

    pub fn geojson_output_path(&self) -> PathBuf {
        self.output_dir.join(GEOJSON_FILE_NAME)
    }

    pub fn parquet_output_path(&self) -> PathBuf {
        self.output_dir.join(PARQUET_FILE_NAME)
    }

    /// Truncates the tile list to `max_tiles`, logging when the cap bites.
    pub fn apply_tile_limit(&self, mut tiles: Vec<Tile>) -> Vec<Tile> {
        if tiles.len() > self.max_tiles {
            warn!(
                requested = tiles.len(),
                limit = self.max_tiles,
                "too many tiles, truncating run"
            );
            tiles.truncate(self.max_tiles);
        }
        tiles
    }
}
