//! Wire types for the deleted-cells HTTP backend.
//!
//! - `GET /deleted?minLat&maxLat&minLon&maxLon&limit[&lastLat&lastLon]`
//!   returns a JSON array of [`CellCoord`] ordered by `(lat, lon)`.
//! - `POST /delete` (bearer auth) takes a [`DeleteRequest`] and returns a
//!   [`DeleteResponse`].

use foundation::{Cell, CoordError, LatLon, Region, normalize};
use serde::{Deserialize, Serialize};

/// A cell as it appears on the wire and in the on-disk tile store.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CellCoord {
    pub lat: f64,
    pub lon: f64,
}

impl CellCoord {
    pub fn new(lat: f64, lon: f64) -> Self {
        Self { lat, lon }
    }

    /// Snap onto the local grid. Backend values are already snapped, so this
    /// is the identity for well-behaved servers.
    pub fn to_cell(self) -> Result<Cell, CoordError> {
        normalize(LatLon::new(self.lat, self.lon))
    }
}

impl From<Cell> for CellCoord {
    fn from(cell: Cell) -> Self {
        Self::new(cell.lat(), cell.lon())
    }
}

/// Deletion request semantics.
///
/// `Single` deletes the clicked cell; the batch modes let the server pick a
/// set of cells around it for one charge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ClickMode {
    #[default]
    Single,
    Super,
    Ultra,
}

impl ClickMode {
    pub fn is_batch(self) -> bool {
        !matches!(self, ClickMode::Single)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ClickMode::Single => "single",
            ClickMode::Super => "super",
            ClickMode::Ultra => "ultra",
        }
    }
}

impl std::fmt::Display for ClickMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for ClickMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "single" => Ok(ClickMode::Single),
            "super" => Ok(ClickMode::Super),
            "ultra" => Ok(ClickMode::Ultra),
            other => Err(format!("unknown click mode: {other}")),
        }
    }
}

/// One page request against `GET /deleted`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PageQuery {
    pub region: Region,
    pub limit: usize,
    /// Cursor: the last cell of the previous page. `None` for the first page.
    pub after: Option<CellCoord>,
}

impl PageQuery {
    pub fn first(region: Region, limit: usize) -> Self {
        Self {
            region,
            limit,
            after: None,
        }
    }

    /// Query-string pairs in the order the backend documents them.
    pub fn query_pairs(&self) -> Vec<(&'static str, String)> {
        let mut pairs = vec![
            ("minLat", self.region.min_lat.to_string()),
            ("maxLat", self.region.max_lat.to_string()),
            ("minLon", self.region.min_lon.to_string()),
            ("maxLon", self.region.max_lon.to_string()),
            ("limit", self.limit.to_string()),
        ];
        if let Some(after) = self.after {
            pairs.push(("lastLat", after.lat.to_string()));
            pairs.push(("lastLon", after.lon.to_string()));
        }
        pairs
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DeleteRequest {
    pub lat: f64,
    pub lon: f64,
    pub mode: ClickMode,
}

impl DeleteRequest {
    pub fn new(cell: Cell, mode: ClickMode) -> Self {
        Self {
            lat: cell.lat(),
            lon: cell.lon(),
            mode,
        }
    }
}

/// Response of `POST /delete`.
///
/// Single-mode responses carry only `alreadyDeleted`; batch responses also
/// list the affected cells.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeleteResponse {
    pub already_deleted: bool,
    #[serde(default)]
    pub coordinates: Vec<CellCoord>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub inserted_count: Option<u64>,
}

impl DeleteResponse {
    pub fn already_deleted() -> Self {
        Self {
            already_deleted: true,
            ..Self::default()
        }
    }
}
