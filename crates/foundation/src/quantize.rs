//! Fixed-precision quantization of degrees.
//!
//! Grid identities are stored as integer multiples of `10^-decimals` degrees
//! so equality, hashing and ordering are exact. Converting back to `f64` is
//! only done at the edges (wire format, display).

/// Tolerance, in grid units, added before flooring.
///
/// Values that are already on a grid line (e.g. `0.009` coming back from the
/// backend) may be represented as `8.999999999999998` units in binary; the
/// nudge keeps them in their own cell instead of the previous one.
pub const SNAP_EPSILON_UNITS: f64 = 1e-9;

/// Number of grid units per degree at the given precision.
#[inline]
pub fn units_per_degree(decimals: u32) -> f64 {
    10f64.powi(decimals as i32)
}

/// Floor `deg` onto the `10^-decimals` grid.
#[inline]
pub fn floor_units(deg: f64, decimals: u32) -> i64 {
    (deg * units_per_degree(decimals) + SNAP_EPSILON_UNITS).floor() as i64
}

/// Ceil `deg` onto the `10^-decimals` grid.
#[inline]
pub fn ceil_units(deg: f64, decimals: u32) -> i64 {
    (deg * units_per_degree(decimals) - SNAP_EPSILON_UNITS).ceil() as i64
}

/// Round `deg` to the nearest point of the `10^-decimals` grid.
#[inline]
pub fn round_units(deg: f64, decimals: u32) -> i64 {
    (deg * units_per_degree(decimals)).round() as i64
}

#[inline]
pub fn units_to_degrees(units: i64, decimals: u32) -> f64 {
    units as f64 / units_per_degree(decimals)
}

/// Rescale grid units from a coarser precision to a finer one.
///
/// `from_decimals` must not exceed `to_decimals`.
#[inline]
pub fn rescale_units(units: i64, from_decimals: u32, to_decimals: u32) -> i64 {
    debug_assert!(from_decimals <= to_decimals);
    units * 10i64.pow(to_decimals - from_decimals)
}
