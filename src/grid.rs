use thiserror::Error;

#[derive(Debug, Error, PartialEq)]
pub enum GridError {
    #[error("invalid bounding box: north ({north}) must exceed south ({south}) and east ({east}) must exceed west ({west})")]
    InvalidBounds {
        north: f64,
        south: f64,
        east: f64,
        west: f64,
    },
    #[error("tile size must be positive, got {0}")]
    InvalidTileSize(f64),
}

/// Geographic extent in WGS84 degrees. Immutable once constructed.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BoundingBox {
    north: f64,
    south: f64,
    east: f64,
    west: f64,
}

impl BoundingBox {
    pub fn new(north: f64, south: f64, east: f64, west: f64) -> Result<Self, GridError> {
        if !(north > south && east > west)
            || !(north.is_finite() && south.is_finite() && east.is_finite() && west.is_finite())
        {
            return Err(GridError::InvalidBounds {
                north,
                south,
                east,
                west,
            });
        }
        Ok(Self {
            north,
            south,
            east,
            west,
        })
    }

    pub fn north(&self) -> f64 {
        self.north
    }

    pub fn south(&self) -> f64 {
        self.south
    }

    pub fn east(&self) -> f64 {
        self.east
    }

    pub fn west(&self) -> f64 {
        self.west
    }
}

/// One rectangular sub-region of a [`BoundingBox`], fetched independently.
///
/// Tiles are produced once by [`partition`] and never mutated. Bounds always
/// lie within the parent box; the last row and column are clipped to the
/// parent edge rather than overshooting it.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Tile {
    pub north: f64,
    pub south: f64,
    pub east: f64,
    pub west: f64,
}

impl Tile {
    pub fn bbox(&self) -> Result<BoundingBox, GridError> {
        BoundingBox::new(self.north, self.south, self.east, self.west)
    }
}

/// Splits `bbox` into a regular grid of tiles with edge length
/// `tile_size_deg`, enumerated row-major from north-west to south-east.
///
/// Pure and deterministic: identical inputs yield an identical tile sequence,
/// which keeps cost estimates reproducible. The union of the returned tiles
/// covers `bbox` exactly, with overlap only along shared edges.
pub fn partition(bbox: &BoundingBox, tile_size_deg: f64) -> Result<Vec<Tile>, GridError> {
    if !(tile_size_deg > 0.0) || !tile_size_deg.is_finite() {
        return Err(GridError::InvalidTileSize(tile_size_deg));
    }

    let lat_steps = ((bbox.north() - bbox.south()) / tile_size_deg).ceil() as usize;
    let lon_steps = ((bbox.east() - bbox.west()) / tile_size_deg).ceil() as usize;

    let mut tiles = Vec::with_capacity(lat_steps * lon_steps);
    for i in 0..lat_steps {
        for j in 0..lon_steps {
            let north = bbox.north() - i as f64 * tile_size_deg;
            let south = (north - tile_size_deg).max(bbox.south());
            let west = bbox.west() + j as f64 * tile_size_deg;
            let east = (west + tile_size_deg).min(bbox.east());
            tiles.push(Tile {
                north,
                south,
                east,
                west,
            });
        }
    }

    Ok(tiles)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn boxed(north: f64, south: f64, east: f64, west: f64) -> BoundingBox {
        BoundingBox::new(north, south, east, west).unwrap()
    }

    #[test]
    fn rejects_inverted_bounds() {
        assert!(BoundingBox::new(1.0, 2.0, 3.0, 0.0).is_err());
        assert!(BoundingBox::new(2.0, 1.0, 0.0, 3.0).is_err());
        assert!(BoundingBox::new(f64::NAN, 1.0, 2.0, 0.0).is_err());
    }

    #[test]
    fn tile_count_matches_ceil_formula() {
        // 0.025 x 0.022 box at 0.009 degrees: neither axis is an integer
        // multiple, so the last row and column must be clipped.
        let bbox = boxed(10.025, 10.0, 20.022, 20.0);
        let tiles = partition(&bbox, 0.009).unwrap();
        let lat_steps = (0.025f64 / 0.009).ceil() as usize;
        let lon_steps = (0.022f64 / 0.009).ceil() as usize;
        assert_eq!(tiles.len(), lat_steps * lon_steps);
        assert_eq!(tiles.len(), 3 * 3);
    }

    #[test]
    fn tiles_cover_parent_box_without_gaps() {
        let bbox = boxed(10.025, 10.0, 20.022, 20.0);
        let tiles = partition(&bbox, 0.009).unwrap();

        for tile in &tiles {
            assert!(tile.north <= bbox.north() + 1e-12);
            assert!(tile.south >= bbox.south() - 1e-12);
            assert!(tile.east <= bbox.east() + 1e-12);
            assert!(tile.west >= bbox.west() - 1e-12);
            assert!(tile.north > tile.south);
            assert!(tile.east > tile.west);
        }

        // Row heights and column widths tile the full extent: summing the
        // first column's heights and the first row's widths recovers the box.
        let lon_steps = (0.022f64 / 0.009).ceil() as usize;
        let height: f64 = tiles
            .iter()
            .step_by(lon_steps)
            .map(|t| t.north - t.south)
            .sum();
        let width: f64 = tiles.iter().take(lon_steps).map(|t| t.east - t.west).sum();
        assert!((height - (bbox.north() - bbox.south())).abs() < 1e-9);
        assert!((width - (bbox.east() - bbox.west())).abs() < 1e-9);

        // No interior overlap: neighbouring tiles meet exactly at shared edges.
        assert_eq!(tiles[0].east, tiles[1].west);
        assert_eq!(tiles[0].south, tiles[lon_steps].north);
    }

    #[test]
    fn enumeration_is_row_major_from_north_west() {
        let bbox = boxed(2.0, 0.0, 2.0, 0.0);
        let tiles = partition(&bbox, 1.0).unwrap();
        assert_eq!(tiles.len(), 4);
        assert_eq!((tiles[0].north, tiles[0].west), (2.0, 0.0));
        assert_eq!((tiles[1].north, tiles[1].west), (2.0, 1.0));
        assert_eq!((tiles[2].north, tiles[2].west), (1.0, 0.0));
        assert_eq!((tiles[3].north, tiles[3].west), (1.0, 1.0));
    }

    #[test]
    fn partitioning_is_idempotent() {
        let bbox = boxed(59.95, 59.9, 10.8, 10.7);
        let first = partition(&bbox, 0.009).unwrap();
        let second = partition(&bbox, 0.009).unwrap();
        assert_eq!(first, second);
    }
}
