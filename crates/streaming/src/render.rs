use std::collections::HashSet;

use foundation::Cell;
use parking_lot::Mutex;

/// The 3-D layer that draws deleted cells.
pub trait CellRenderer: Send + Sync {
    fn render(&self, cell: Cell);
    /// Remove a cell drawn optimistically that the backend did not confirm.
    fn erase(&self, cell: Cell);
}

/// Tracks which cells have been drawn this session, independent of where
/// they came from (tile store, network page, deletion response).
#[derive(Debug, Default)]
pub struct RenderDedup {
    drawn: Mutex<HashSet<Cell>>,
}

impl RenderDedup {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns `true` exactly once per cell, marking it drawn in the same
    /// critical section as the check.
    pub fn should_render(&self, cell: Cell) -> bool {
        self.drawn.lock().insert(cell)
    }

    pub fn is_drawn(&self, cell: Cell) -> bool {
        self.drawn.lock().contains(&cell)
    }

    /// Forget a cell so it may be drawn again. Returns whether it was drawn.
    pub fn forget(&self, cell: Cell) -> bool {
        self.drawn.lock().remove(&cell)
    }

    pub fn reset(&self) {
        self.drawn.lock().clear();
    }

    pub fn len(&self) -> usize {
        self.drawn.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.drawn.lock().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::RenderDedup;
    use foundation::Cell;

    #[test]
    fn renders_each_cell_once() {
        let d = RenderDedup::new();
        let c = Cell::from_indices(1, 1);
        assert!(d.should_render(c));
        assert!(!d.should_render(c));
        assert!(d.should_render(Cell::from_indices(1, 2)));
        assert_eq!(d.len(), 2);
    }

    #[test]
    fn reset_and_forget_allow_redraw() {
        let d = RenderDedup::new();
        let c = Cell::from_indices(7, -3);
        assert!(d.should_render(c));
        assert!(d.forget(c));
        assert!(!d.forget(c));
        assert!(d.should_render(c));
        d.reset();
        assert!(d.is_empty());
        assert!(d.should_render(c));
    }
}
