//! Coarse, stable keys for "have we already queried this box".

use std::str::FromStr;

use crate::bounds::Region;
use crate::cell::{CELL_PRECISION_DECIMALS, Cell, CoordError};
use crate::quantize::{ceil_units, floor_units, rescale_units, round_units, units_to_degrees};

/// Default key precision (`0.01°`), one decade coarser than the cell grid.
pub const KEY_PRECISION_DECIMALS: u32 = 2;

/// Quantized region bounds.
///
/// Bounds are rounded outward onto the `10^-decimals` grid (min edges down,
/// max edges up) and kept as integers, so a key's bounds always contain the
/// region it was made from and regions with the same grid footprint share a
/// key. The string form is `"minLat,maxLat,minLon,maxLon"` with
/// `decimals` fractional digits, e.g. `"0.00,0.01,0.00,0.01"`.
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct CacheKey {
    decimals: u32,
    min_lat: i64,
    max_lat: i64,
    min_lon: i64,
    max_lon: i64,
}

impl CacheKey {
    /// Key for `region` at `decimals` precision.
    ///
    /// Precision is capped at the cell precision so a key always groups
    /// whole cells. A dimension of zero width is widened by one key unit.
    pub fn for_region(region: &Region, decimals: u32) -> Self {
        let decimals = decimals.min(CELL_PRECISION_DECIMALS);
        let min_lat = floor_units(region.min_lat, decimals);
        let min_lon = floor_units(region.min_lon, decimals);
        let max_lat = ceil_units(region.max_lat, decimals).max(min_lat.saturating_add(1));
        let max_lon = ceil_units(region.max_lon, decimals).max(min_lon.saturating_add(1));
        Self {
            decimals,
            min_lat,
            max_lat,
            min_lon,
            max_lon,
        }
    }

    pub fn decimals(&self) -> u32 {
        self.decimals
    }

    /// The quantized bounds this key stands for.
    pub fn region(&self) -> Region {
        let d = self.decimals;
        Region::new(
            units_to_degrees(self.min_lat, d),
            units_to_degrees(self.max_lat, d),
            units_to_degrees(self.min_lon, d),
            units_to_degrees(self.max_lon, d),
        )
    }

    /// Whether `cell` lies inside the key's bounds (edges inclusive).
    pub fn contains(&self, cell: Cell) -> bool {
        let scale = |u| rescale_units(u, self.decimals, CELL_PRECISION_DECIMALS);
        (scale(self.min_lat)..=scale(self.max_lat)).contains(&cell.lat_index())
            && (scale(self.min_lon)..=scale(self.max_lon)).contains(&cell.lon_index())
    }
}

/// Key for `region` at the default precision.
pub fn cache_key(region: &Region) -> CacheKey {
    CacheKey::for_region(region, KEY_PRECISION_DECIMALS)
}

impl std::fmt::Display for CacheKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let p = self.decimals as usize;
        let r = self.region();
        write!(
            f,
            "{:.p$},{:.p$},{:.p$},{:.p$}",
            r.min_lat, r.max_lat, r.min_lon, r.max_lon
        )
    }
}

impl FromStr for CacheKey {
    type Err = CoordError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let malformed = || CoordError::MalformedKey(s.to_string());

        let parts: Vec<&str> = s.split(',').collect();
        let [min_lat, max_lat, min_lon, max_lon] = parts.as_slice() else {
            return Err(malformed());
        };

        let decimals = min_lat
            .split_once('.')
            .map(|(_, frac)| frac.len() as u32)
            .unwrap_or(0);
        if decimals > CELL_PRECISION_DECIMALS {
            return Err(malformed());
        }

        let mut units = [0i64; 4];
        for (slot, raw) in units.iter_mut().zip([min_lat, max_lat, min_lon, max_lon]) {
            let deg = raw.trim().parse::<f64>().map_err(|_| malformed())?;
            if !deg.is_finite() {
                return Err(malformed());
            }
            *slot = round_units(deg, decimals);
        }

        let [min_lat, max_lat, min_lon, max_lon] = units;
        if min_lat >= max_lat || min_lon >= max_lon {
            return Err(malformed());
        }
        Ok(Self {
            decimals,
            min_lat,
            max_lat,
            min_lon,
            max_lon,
        })
    }
}
