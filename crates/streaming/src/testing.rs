//! In-process fakes for the backend and renderer, shared with downstream
//! crates' tests through the `test-support` feature.

use std::collections::{BTreeSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};

use foundation::Cell;
use parking_lot::Mutex;

use crate::backend::{BackendError, BoxFuture, DeletionBackend};
use crate::protocol::{CellCoord, ClickMode, DeleteRequest, DeleteResponse, PageQuery};
use crate::render::CellRenderer;

/// Cells a batch delete spreads over, eastward from the clicked cell.
pub const FAKE_BATCH_WIDTH: i64 = 3;

/// Backend holding deleted cells in memory.
///
/// Page requests suspend once before answering so concurrent syncs really
/// interleave. Delete calls answer from a script when one is queued,
/// otherwise they apply the request to the in-memory set.
#[derive(Debug, Default)]
pub struct FakeBackend {
    cells: Mutex<BTreeSet<Cell>>,
    page_log: Mutex<Vec<PageQuery>>,
    delete_log: Mutex<Vec<(String, DeleteRequest)>>,
    failing: AtomicBool,
    pages_before_failure: Mutex<Option<usize>>,
    delete_script: Mutex<VecDeque<Result<DeleteResponse, BackendError>>>,
}

impl FakeBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_cells(cells: impl IntoIterator<Item = Cell>) -> Self {
        let backend = Self::default();
        backend.cells.lock().extend(cells);
        backend
    }

    pub fn insert(&self, cell: Cell) {
        self.cells.lock().insert(cell);
    }

    pub fn contains(&self, cell: Cell) -> bool {
        self.cells.lock().contains(&cell)
    }

    /// Make every page request fail with a network error.
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    /// Serve `n` more pages, then fail.
    pub fn fail_after_pages(&self, n: usize) {
        *self.pages_before_failure.lock() = Some(n);
    }

    pub fn script_delete(&self, response: Result<DeleteResponse, BackendError>) {
        self.delete_script.lock().push_back(response);
    }

    pub fn page_requests(&self) -> Vec<PageQuery> {
        self.page_log.lock().clone()
    }

    pub fn delete_requests(&self) -> Vec<(String, DeleteRequest)> {
        self.delete_log.lock().clone()
    }

    fn answer_page(&self, query: PageQuery) -> Result<Vec<CellCoord>, BackendError> {
        self.page_log.lock().push(query);

        if self.failing.load(Ordering::SeqCst) {
            return Err(BackendError::Network("connection refused".to_string()));
        }
        if let Some(left) = self.pages_before_failure.lock().as_mut() {
            if *left == 0 {
                return Err(BackendError::Network("connection reset".to_string()));
            }
            *left -= 1;
        }

        let after = match query.after {
            Some(coord) => Some(coord.to_cell().map_err(|e| BackendError::Decode(e.to_string()))?),
            None => None,
        };
        Ok(self
            .cells
            .lock()
            .iter()
            .filter(|c| query.region.contains_cell(**c))
            .filter(|c| after.is_none_or(|a| **c > a))
            .take(query.limit)
            .map(|c| CellCoord::from(*c))
            .collect())
    }

    fn answer_delete(&self, token: &str, request: DeleteRequest) -> Result<DeleteResponse, BackendError> {
        self.delete_log.lock().push((token.to_string(), request));
        if let Some(scripted) = self.delete_script.lock().pop_front() {
            return scripted;
        }

        let clicked = CellCoord::new(request.lat, request.lon)
            .to_cell()
            .map_err(|e| BackendError::Status {
                status: 400,
                body: e.to_string(),
            })?;

        let mut cells = self.cells.lock();
        if request.mode == ClickMode::Single {
            let inserted = cells.insert(clicked);
            return Ok(DeleteResponse {
                already_deleted: !inserted,
                ..DeleteResponse::default()
            });
        }

        let affected: Vec<Cell> = (0..FAKE_BATCH_WIDTH)
            .map(|i| Cell::from_indices(clicked.lat_index(), clicked.lon_index() + i))
            .filter(|c| cells.insert(*c))
            .collect();
        Ok(DeleteResponse {
            already_deleted: affected.is_empty(),
            inserted_count: Some(affected.len() as u64),
            coordinates: affected.into_iter().map(CellCoord::from).collect(),
        })
    }
}

impl DeletionBackend for FakeBackend {
    fn fetch_page(&self, query: PageQuery) -> BoxFuture<'_, Result<Vec<CellCoord>, BackendError>> {
        Box::pin(async move {
            tokio::task::yield_now().await;
            self.answer_page(query)
        })
    }

    fn delete<'a>(
        &'a self,
        token: &'a str,
        request: DeleteRequest,
    ) -> BoxFuture<'a, Result<DeleteResponse, BackendError>> {
        Box::pin(async move {
            tokio::task::yield_now().await;
            self.answer_delete(token, request)
        })
    }
}

/// Renderer that records every call in order.
#[derive(Debug, Default)]
pub struct RecordingRenderer {
    rendered: Mutex<Vec<Cell>>,
    erased: Mutex<Vec<Cell>>,
}

impl RecordingRenderer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn rendered(&self) -> Vec<Cell> {
        self.rendered.lock().clone()
    }

    pub fn erased(&self) -> Vec<Cell> {
        self.erased.lock().clone()
    }
}

impl CellRenderer for RecordingRenderer {
    fn render(&self, cell: Cell) {
        self.rendered.lock().push(cell);
    }

    fn erase(&self, cell: Cell) {
        self.erased.lock().push(cell);
    }
}
