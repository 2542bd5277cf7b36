//! Viewport partitioning into request-sized sub-regions.

use crate::bounds::Region;

/// Number of rows (latitude bands) and columns (longitude bands).
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct GridSize {
    pub rows: u32,
    pub cols: u32,
}

impl GridSize {
    pub fn new(rows: u32, cols: u32) -> Self {
        Self { rows, cols }
    }

    pub fn square(n: u32) -> Self {
        Self { rows: n, cols: n }
    }

    pub fn cells(&self) -> usize {
        self.rows as usize * self.cols as usize
    }
}

/// Split `region` into `rows x cols` equal sub-regions.
///
/// Output is row-major: row 0 is the southernmost band, and within a row
/// columns run west to east. Adjacent sub-regions share the exact same
/// boundary value and the outermost edges are copied from `region`, so the
/// pieces tile it with no gaps. An empty grid yields no sub-regions.
pub fn partition(region: Region, grid: GridSize) -> Vec<Region> {
    let mut out = Vec::with_capacity(grid.cells());
    for row in 0..grid.rows {
        let min_lat = edge(region.min_lat, region.max_lat, row, grid.rows);
        let max_lat = edge(region.min_lat, region.max_lat, row + 1, grid.rows);
        for col in 0..grid.cols {
            let min_lon = edge(region.min_lon, region.max_lon, col, grid.cols);
            let max_lon = edge(region.min_lon, region.max_lon, col + 1, grid.cols);
            out.push(Region::new(min_lat, max_lat, min_lon, max_lon));
        }
    }
    out
}

fn edge(min: f64, max: f64, i: u32, n: u32) -> f64 {
    if i == 0 {
        min
    } else if i == n {
        max
    } else {
        min + (max - min) * (i as f64) / (n as f64)
    }
}
