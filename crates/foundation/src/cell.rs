//! Deletion-grid cells and the coordinate normalizer.

use crate::quantize::{floor_units, units_to_degrees};

/// Decimal precision of the deletion grid (cells are `0.001°` squares).
pub const CELL_PRECISION_DECIMALS: u32 = 3;

/// A raw geographic coordinate in degrees.
#[derive(Debug, Copy, Clone, PartialEq)]
pub struct LatLon {
    pub lat: f64,
    pub lon: f64,
}

impl LatLon {
    pub fn new(lat: f64, lon: f64) -> Self {
        Self { lat, lon }
    }

    pub fn is_valid(&self) -> bool {
        (-90.0..=90.0).contains(&self.lat) && (-180.0..=180.0).contains(&self.lon)
    }
}

/// One square of the deletion grid.
///
/// Identity is the pair of floored grid indices; ordering is `(lat, lon)`,
/// which is the order the backend pages cells in.
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Cell {
    lat_index: i64,
    lon_index: i64,
}

impl Cell {
    pub fn from_indices(lat_index: i64, lon_index: i64) -> Self {
        Self {
            lat_index,
            lon_index,
        }
    }

    pub fn lat_index(&self) -> i64 {
        self.lat_index
    }

    pub fn lon_index(&self) -> i64 {
        self.lon_index
    }

    /// Snapped latitude (south edge of the cell).
    pub fn lat(&self) -> f64 {
        units_to_degrees(self.lat_index, CELL_PRECISION_DECIMALS)
    }

    /// Snapped longitude (west edge of the cell).
    pub fn lon(&self) -> f64 {
        units_to_degrees(self.lon_index, CELL_PRECISION_DECIMALS)
    }

    pub fn to_lat_lon(&self) -> LatLon {
        LatLon::new(self.lat(), self.lon())
    }
}

impl std::fmt::Display for Cell {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let p = CELL_PRECISION_DECIMALS as usize;
        write!(f, "({:.p$}, {:.p$})", self.lat(), self.lon())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum CoordError {
    InvalidCoordinate { lat: f64, lon: f64 },
    MalformedKey(String),
}

impl std::fmt::Display for CoordError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CoordError::InvalidCoordinate { lat, lon } => {
                write!(f, "invalid coordinate: lat={lat} lon={lon}")
            }
            CoordError::MalformedKey(raw) => write!(f, "malformed cache key: {raw:?}"),
        }
    }
}

impl std::error::Error for CoordError {}

/// Snap a raw coordinate onto the deletion grid.
///
/// Each axis is floored (never rounded) to `CELL_PRECISION_DECIMALS`.
/// Coordinates outside `[-90, 90] x [-180, 180]` (or NaN) are rejected.
pub fn normalize(raw: LatLon) -> Result<Cell, CoordError> {
    if !raw.is_valid() {
        return Err(CoordError::InvalidCoordinate {
            lat: raw.lat,
            lon: raw.lon,
        });
    }
    Ok(Cell {
        lat_index: floor_units(raw.lat, CELL_PRECISION_DECIMALS),
        lon_index: floor_units(raw.lon, CELL_PRECISION_DECIMALS),
    })
}
