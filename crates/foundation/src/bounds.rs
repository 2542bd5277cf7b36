use crate::cell::{Cell, LatLon};

/// Axis-aligned lat/lon rectangle (degrees), edges inclusive.
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct Region {
    pub min_lat: f64,
    pub max_lat: f64,
    pub min_lon: f64,
    pub max_lon: f64,
}

impl Region {
    pub fn new(min_lat: f64, max_lat: f64, min_lon: f64, max_lon: f64) -> Self {
        Region {
            min_lat,
            max_lat,
            min_lon,
            max_lon,
        }
    }

    pub fn lat_span(&self) -> f64 {
        self.max_lat - self.min_lat
    }

    pub fn lon_span(&self) -> f64 {
        self.max_lon - self.min_lon
    }

    /// Finite bounds with `min <= max` on both axes.
    pub fn is_well_formed(&self) -> bool {
        [self.min_lat, self.max_lat, self.min_lon, self.max_lon]
            .iter()
            .all(|v| v.is_finite())
            && self.min_lat <= self.max_lat
            && self.min_lon <= self.max_lon
    }

    /// The part of `self` inside the valid coordinate range
    /// (`[-90, 90] x [-180, 180]`). Each bound is clamped on its own, so a
    /// region entirely off the globe collapses onto its nearest edge.
    pub fn clamped_to_world(&self) -> Region {
        Region {
            min_lat: self.min_lat.clamp(-90.0, 90.0),
            max_lat: self.max_lat.clamp(-90.0, 90.0),
            min_lon: self.min_lon.clamp(-180.0, 180.0),
            max_lon: self.max_lon.clamp(-180.0, 180.0),
        }
    }

    pub fn contains(&self, p: LatLon) -> bool {
        p.lat >= self.min_lat && p.lat <= self.max_lat && p.lon >= self.min_lon && p.lon <= self.max_lon
    }

    pub fn contains_cell(&self, cell: Cell) -> bool {
        self.contains(cell.to_lat_lon())
    }
}
