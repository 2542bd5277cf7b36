//! Click -> deletion state machine.
//!
//! ```text
//! Idle -> Validating -> Deleting -> Succeeded | Failed -> Idle
//! ```
//!
//! One click at a time: a click arriving while the machine is not `Idle` is
//! dropped without a message. The phase is reset to `Idle` by a drop guard,
//! so every exit path (early return, error, unwind) releases it.
//!
//! Single-mode deletions are drawn optimistically before the backend
//! answers and are not rolled back on failure. Instead the cell is marked
//! unconfirmed and its tiles invalidated, so the next sync over the area
//! erases it if the backend never recorded it.

use std::sync::Arc;

use foundation::{Cell, CoordError, LatLon, normalize};
use parking_lot::Mutex;
use streaming::{BackendError, ClickMode, DeleteRequest, DeleteResponse, TileCache};
use tracing::{debug, info, warn};

use crate::account::Account;

/// Camera heights above this (meters) are too far out to delete cells.
pub const DEFAULT_MAX_CAMERA_HEIGHT_M: f64 = 2_000_000.0;

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Phase {
    Idle,
    Validating,
    Deleting,
    Succeeded,
    Failed,
}

#[derive(Debug, Copy, Clone, PartialEq)]
pub struct ClickConfig {
    pub max_camera_height_m: f64,
}

impl Default for ClickConfig {
    fn default() -> Self {
        Self {
            max_camera_height_m: DEFAULT_MAX_CAMERA_HEIGHT_M,
        }
    }
}

/// A pointer click on the globe, after picking.
#[derive(Debug, Copy, Clone, PartialEq)]
pub struct Click {
    /// Where the pick ray hit the terrain; `None` if it missed the globe.
    pub pick: Option<LatLon>,
    pub camera_height_m: f64,
}

impl Click {
    pub fn at(lat: f64, lon: f64, camera_height_m: f64) -> Self {
        Self {
            pick: Some(LatLon::new(lat, lon)),
            camera_height_m,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ClickError {
    Unauthenticated,
    OutOfResource(ClickMode),
    TooFarZoomedOut { height_m: f64, max_height_m: f64 },
    InvalidCoordinate(CoordError),
    AlreadyDeleted,
    Backend(BackendError),
}

impl std::fmt::Display for ClickError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ClickError::Unauthenticated => write!(f, "sign in to delete cells"),
            ClickError::OutOfResource(ClickMode::Single) => write!(f, "no clicks left"),
            ClickError::OutOfResource(mode) => write!(f, "no {mode} clicks left"),
            ClickError::TooFarZoomedOut { .. } => write!(f, "zoom in closer to delete cells"),
            ClickError::InvalidCoordinate(err) => write!(f, "{err}"),
            ClickError::AlreadyDeleted => write!(f, "this cell is already deleted"),
            ClickError::Backend(err) => write!(f, "deletion failed: {err}"),
        }
    }
}

impl std::error::Error for ClickError {}

#[derive(Debug, Clone, PartialEq)]
pub enum ClickOutcome {
    /// Another click was still in flight; this one was dropped.
    Busy,
    /// The pick ray missed the globe.
    Missed,
    /// A precondition failed; nothing was sent.
    Rejected(ClickError),
    /// The backend confirmed the deletion of `cells`.
    Deleted { mode: ClickMode, cells: Vec<Cell> },
    /// The request was sent and did not delete anything.
    Failed(ClickError),
}

/// Receives deletion results for the UI.
pub trait DeletionListener: Send + Sync {
    /// Called for `Rejected`, `Deleted` and `Failed` outcomes.
    fn report(&self, outcome: &ClickOutcome);

    /// The user's profile (counters, stats) changed on the server.
    fn refresh_profile(&self) {}
}

/// Resets the phase to `Idle` when dropped.
struct PhaseGuard<'a> {
    phase: &'a Mutex<Phase>,
}

impl PhaseGuard<'_> {
    fn advance(&self, next: Phase) {
        *self.phase.lock() = next;
    }
}

impl Drop for PhaseGuard<'_> {
    fn drop(&mut self) {
        *self.phase.lock() = Phase::Idle;
    }
}

pub struct DeletionMachine {
    cache: Arc<TileCache>,
    listener: Arc<dyn DeletionListener>,
    account: Mutex<Account>,
    phase: Mutex<Phase>,
    config: ClickConfig,
}

impl DeletionMachine {
    pub fn new(
        cache: Arc<TileCache>,
        listener: Arc<dyn DeletionListener>,
        account: Account,
        config: ClickConfig,
    ) -> Self {
        Self {
            cache,
            listener,
            account: Mutex::new(account),
            phase: Mutex::new(Phase::Idle),
            config,
        }
    }

    pub fn phase(&self) -> Phase {
        *self.phase.lock()
    }

    /// Snapshot of the current account state.
    pub fn account(&self) -> Account {
        self.account.lock().clone()
    }

    pub fn update_account<R>(&self, f: impl FnOnce(&mut Account) -> R) -> R {
        f(&mut self.account.lock())
    }

    fn try_begin(&self) -> Option<PhaseGuard<'_>> {
        let mut phase = self.phase.lock();
        if *phase != Phase::Idle {
            return None;
        }
        *phase = Phase::Validating;
        Some(PhaseGuard { phase: &self.phase })
    }

    pub async fn handle_click(&self, click: Click) -> ClickOutcome {
        let Some(guard) = self.try_begin() else {
            debug!("click dropped: a deletion is already in progress");
            return ClickOutcome::Busy;
        };

        // Read mode, counters and session once, at the moment of handling.
        let account = self.account.lock().clone();
        let mode = account.mode();

        let (token, point) = match self.validate(&account, &click) {
            Ok(Some(target)) => target,
            Ok(None) => return ClickOutcome::Missed,
            Err(err) => return self.finish(ClickOutcome::Rejected(err)),
        };
        let cell = match normalize(point) {
            Ok(cell) => cell,
            Err(err) => {
                return self.finish(ClickOutcome::Rejected(ClickError::InvalidCoordinate(err)));
            }
        };

        guard.advance(Phase::Deleting);
        if !mode.is_batch() {
            self.cache.render_cell(cell);
        }

        let result = self
            .cache
            .backend()
            .delete(token, DeleteRequest::new(cell, mode))
            .await;

        let outcome = match result {
            Ok(resp) if resp.already_deleted => {
                guard.advance(Phase::Failed);
                ClickOutcome::Failed(ClickError::AlreadyDeleted)
            }
            Ok(resp) => {
                guard.advance(Phase::Succeeded);
                self.confirm(cell, mode, resp).await
            }
            Err(err) => {
                guard.advance(Phase::Failed);
                warn!("delete of {cell} ({mode}) failed: {err}");
                if !mode.is_batch() {
                    self.cache.mark_unconfirmed(cell);
                    self.cache.invalidate_cells(&[cell]).await;
                }
                ClickOutcome::Failed(ClickError::Backend(err))
            }
        };
        self.finish(outcome)
    }

    /// Precondition checks in user-facing priority order. `Ok(None)` means
    /// the click missed the globe, which is not worth a message.
    fn validate<'a>(
        &self,
        account: &'a Account,
        click: &Click,
    ) -> Result<Option<(&'a str, LatLon)>, ClickError> {
        let token = account.token().ok_or(ClickError::Unauthenticated)?;

        let mode = account.mode();
        if account.counters().available(mode) == 0 {
            return Err(ClickError::OutOfResource(mode));
        }

        // NaN heights fail this check too.
        if !(click.camera_height_m <= self.config.max_camera_height_m) {
            return Err(ClickError::TooFarZoomedOut {
                height_m: click.camera_height_m,
                max_height_m: self.config.max_camera_height_m,
            });
        }

        Ok(click.pick.map(|p| (token, p)))
    }

    async fn confirm(&self, clicked: Cell, mode: ClickMode, resp: DeleteResponse) -> ClickOutcome {
        let cells = if mode.is_batch() {
            let mut cells = Vec::with_capacity(resp.coordinates.len());
            for coord in resp.coordinates {
                match coord.to_cell() {
                    Ok(cell) => cells.push(cell),
                    Err(err) => warn!("ignoring malformed batch cell: {err}"),
                }
            }
            for &cell in &cells {
                self.cache.render_cell(cell);
            }
            cells
        } else {
            vec![clicked]
        };

        self.cache.invalidate_cells(&cells).await;
        self.account.lock().charge(mode);
        self.listener.refresh_profile();

        info!("deleted {} cell(s) in {mode} mode", cells.len());
        ClickOutcome::Deleted { mode, cells }
    }

    fn finish(&self, outcome: ClickOutcome) -> ClickOutcome {
        self.listener.report(&outcome);
        outcome
    }
}

#[cfg(test)]
mod tests {
    use std::panic::AssertUnwindSafe;
    use std::sync::Arc;

    use foundation::{Cell, LatLon, Region, normalize};
    use futures_util::FutureExt;
    use parking_lot::Mutex;
    use pretty_assertions::assert_eq;
    use streaming::testing::{FakeBackend, RecordingRenderer};
    use streaming::{
        BackendError, CellCoord, ClickMode, DeleteResponse, GridConfig, MemoryTileStore,
        TileCache, TileStore,
    };

    use super::{
        Click, ClickConfig, ClickError, ClickOutcome, DeletionListener, DeletionMachine, Phase,
    };
    use crate::account::{Account, ResourceCounters};

    const NEAR: f64 = 5_000.0;

    #[derive(Default)]
    struct Listener {
        reports: Mutex<Vec<ClickOutcome>>,
        refreshes: Mutex<usize>,
        panic_on_report: bool,
    }

    impl DeletionListener for Listener {
        fn report(&self, outcome: &ClickOutcome) {
            if self.panic_on_report {
                panic!("toast layer crashed");
            }
            self.reports.lock().push(outcome.clone());
        }

        fn refresh_profile(&self) {
            *self.refreshes.lock() += 1;
        }
    }

    struct Harness {
        machine: DeletionMachine,
        cache: Arc<TileCache>,
        backend: Arc<FakeBackend>,
        renderer: Arc<RecordingRenderer>,
        store: Arc<MemoryTileStore>,
        listener: Arc<Listener>,
    }

    fn counters() -> ResourceCounters {
        ResourceCounters {
            clicks_total: 10,
            clicks_used: 0,
            super_clicks_total: 2,
            ultra_clicks_total: 1,
        }
    }

    fn harness_with(account: Account, listener: Listener) -> Harness {
        let backend = Arc::new(FakeBackend::new());
        let renderer = Arc::new(RecordingRenderer::new());
        let store = Arc::new(MemoryTileStore::new());
        let cache = Arc::new(TileCache::new(
            &GridConfig::default(),
            store.clone(),
            backend.clone(),
            renderer.clone(),
        ));
        let listener = Arc::new(listener);
        let machine = DeletionMachine::new(
            cache.clone(),
            listener.clone(),
            account,
            ClickConfig::default(),
        );
        Harness {
            machine,
            cache,
            backend,
            renderer,
            store,
            listener,
        }
    }

    fn harness() -> Harness {
        harness_with(
            Account::new(Some("token".to_string()), counters()),
            Listener::default(),
        )
    }

    fn cell(lat: f64, lon: f64) -> Cell {
        normalize(LatLon::new(lat, lon)).unwrap()
    }

    #[tokio::test]
    async fn out_of_clicks_sends_nothing() {
        let h = harness_with(
            Account::new(
                Some("token".to_string()),
                ResourceCounters {
                    clicks_total: 0,
                    ..counters()
                },
            ),
            Listener::default(),
        );

        let outcome = h.machine.handle_click(Click::at(1.0, 1.0, NEAR)).await;

        let expected = ClickOutcome::Rejected(ClickError::OutOfResource(ClickMode::Single));
        assert_eq!(outcome, expected);
        assert_eq!(h.machine.phase(), Phase::Idle);
        assert!(h.backend.delete_requests().is_empty());
        assert!(h.renderer.rendered().is_empty());
        assert_eq!(*h.listener.reports.lock(), vec![expected]);
    }

    #[tokio::test]
    async fn unauthenticated_click_is_rejected_first() {
        let h = harness_with(
            Account::new(None, ResourceCounters::default()),
            Listener::default(),
        );
        let outcome = h.machine.handle_click(Click::at(1.0, 1.0, 1e9)).await;
        assert_eq!(outcome, ClickOutcome::Rejected(ClickError::Unauthenticated));
        assert!(h.backend.delete_requests().is_empty());
    }

    #[tokio::test]
    async fn zoomed_out_click_is_rejected() {
        let h = harness();
        let outcome = h.machine.handle_click(Click::at(1.0, 1.0, 9_000_000.0)).await;
        assert!(matches!(
            outcome,
            ClickOutcome::Rejected(ClickError::TooFarZoomedOut { .. })
        ));
        assert_eq!(h.machine.phase(), Phase::Idle);
    }

    #[tokio::test]
    async fn off_globe_click_is_silent() {
        let h = harness();
        let outcome = h
            .machine
            .handle_click(Click {
                pick: None,
                camera_height_m: NEAR,
            })
            .await;
        assert_eq!(outcome, ClickOutcome::Missed);
        assert!(h.listener.reports.lock().is_empty());
        assert!(h.backend.delete_requests().is_empty());
    }

    #[tokio::test]
    async fn invalid_pick_is_rejected() {
        let h = harness();
        let outcome = h.machine.handle_click(Click::at(95.0, 0.0, NEAR)).await;
        assert!(matches!(
            outcome,
            ClickOutcome::Rejected(ClickError::InvalidCoordinate(_))
        ));
        assert_eq!(h.machine.phase(), Phase::Idle);
    }

    #[tokio::test]
    async fn single_click_deletes_renders_and_charges() {
        let h = harness();
        let target = cell(0.0333, 0.0333);
        h.cache.sync_region(Region::new(0.0, 0.06, 0.0, 0.06)).await;
        assert_eq!(h.store.len(), 36);

        let outcome = h.machine.handle_click(Click::at(0.03337, 0.03339, NEAR)).await;

        assert_eq!(
            outcome,
            ClickOutcome::Deleted {
                mode: ClickMode::Single,
                cells: vec![target]
            }
        );
        assert_eq!(h.renderer.rendered(), vec![target]);
        assert!(h.backend.contains(target));

        let (token, request) = h.backend.delete_requests()[0].clone();
        assert_eq!(token, "token");
        assert_eq!(request.mode, ClickMode::Single);
        assert_eq!(CellCoord::new(request.lat, request.lon).to_cell().unwrap(), target);

        let c = h.machine.account().counters();
        assert_eq!((c.clicks_total, c.clicks_used), (9, 1));
        assert_eq!(*h.listener.refreshes.lock(), 1);
        assert_eq!(h.machine.phase(), Phase::Idle);

        // The covering tile was dropped from both the session and the store.
        let key = h.cache.key_for(&Region::new(0.03, 0.04, 0.03, 0.04));
        assert!(!h.cache.is_fetched(key));
        assert_eq!(h.store.get(key).await.unwrap(), None);
        assert_eq!(h.store.len(), 35);
    }

    #[tokio::test]
    async fn super_click_renders_server_cells_for_one_charge() {
        let h = harness();
        h.machine.update_account(|a| a.enable(ClickMode::Super));
        h.backend.script_delete(Ok(DeleteResponse {
            already_deleted: false,
            coordinates: vec![
                CellCoord::new(1.0, 1.0),
                CellCoord::new(1.0, 2.0),
                CellCoord::new(1.0, 3.0),
            ],
            inserted_count: Some(3),
        }));

        let outcome = h.machine.handle_click(Click::at(1.0, 2.0, NEAR)).await;

        let expected = vec![cell(1.0, 1.0), cell(1.0, 2.0), cell(1.0, 3.0)];
        assert_eq!(
            outcome,
            ClickOutcome::Deleted {
                mode: ClickMode::Super,
                cells: expected.clone()
            }
        );
        // No optimistic draw of the clicked cell: exactly the server's set.
        assert_eq!(h.renderer.rendered(), expected);

        let account = h.machine.account();
        assert_eq!(account.counters().super_clicks_total, 1);
        assert_eq!(account.counters().clicks_total, 10);
        assert_eq!(account.mode(), ClickMode::Single);
    }

    #[tokio::test]
    async fn ultra_click_uses_the_fake_batch() {
        let h = harness();
        h.machine.update_account(|a| a.enable(ClickMode::Ultra));

        let outcome = h.machine.handle_click(Click::at(-20.5, 150.25, NEAR)).await;
        let ClickOutcome::Deleted { mode, cells } = outcome else {
            panic!("expected deletion, got {outcome:?}");
        };
        assert_eq!(mode, ClickMode::Ultra);
        assert_eq!(cells.len(), 3);
        assert_eq!(h.machine.account().counters().ultra_clicks_total, 0);

        // Out of ultra clicks now, and the mode switched itself off.
        assert_eq!(h.machine.account().mode(), ClickMode::Single);
    }

    #[tokio::test]
    async fn already_deleted_costs_nothing() {
        let h = harness();
        let target = cell(10.0, 10.0);
        h.backend.insert(target);

        let outcome = h.machine.handle_click(Click::at(10.0, 10.0, NEAR)).await;

        assert_eq!(outcome, ClickOutcome::Failed(ClickError::AlreadyDeleted));
        assert_eq!(h.machine.account().counters(), counters());
        assert_eq!(*h.listener.refreshes.lock(), 0);
        assert_eq!(h.machine.phase(), Phase::Idle);
        assert_eq!(
            *h.listener.reports.lock(),
            vec![ClickOutcome::Failed(ClickError::AlreadyDeleted)]
        );
    }

    #[tokio::test]
    async fn backend_failure_costs_nothing_and_releases() {
        let h = harness();
        let err = BackendError::Network("timeout".to_string());
        h.backend.script_delete(Err(err.clone()));

        let outcome = h.machine.handle_click(Click::at(2.0, 2.0, NEAR)).await;

        assert_eq!(outcome, ClickOutcome::Failed(ClickError::Backend(err)));
        assert_eq!(h.machine.account().counters(), counters());
        assert_eq!(h.machine.phase(), Phase::Idle);
        assert!(h.cache.is_unconfirmed(cell(2.0, 2.0)));

        // The machine accepts the next click.
        let outcome = h.machine.handle_click(Click::at(2.0, 2.0, NEAR)).await;
        assert!(matches!(outcome, ClickOutcome::Deleted { .. }));
    }

    #[tokio::test]
    async fn failed_optimistic_draw_is_corrected_by_the_next_sync() {
        let h = harness();
        let ghost = cell(0.0444, 0.0111);
        h.backend
            .script_delete(Err(BackendError::Network("reset".to_string())));

        h.machine.handle_click(Click::at(0.0444, 0.0111, NEAR)).await;
        assert_eq!(h.renderer.rendered(), vec![ghost]);

        h.cache.sync_region(Region::new(0.0, 0.06, 0.0, 0.06)).await;
        assert_eq!(h.renderer.erased(), vec![ghost]);
        assert!(!h.cache.dedup().is_drawn(ghost));
    }

    #[tokio::test]
    async fn clicks_during_a_deletion_are_dropped() {
        let h = harness();

        let (first, second) = tokio::join!(
            h.machine.handle_click(Click::at(3.0, 3.0, NEAR)),
            h.machine.handle_click(Click::at(4.0, 4.0, NEAR)),
        );

        assert!(matches!(first, ClickOutcome::Deleted { .. }));
        assert_eq!(second, ClickOutcome::Busy);
        assert_eq!(h.backend.delete_requests().len(), 1);
        assert_eq!(h.listener.reports.lock().len(), 1);
        assert_eq!(h.machine.phase(), Phase::Idle);
    }

    #[tokio::test]
    async fn phase_is_released_when_the_listener_panics() {
        let h = harness_with(
            Account::new(Some("token".to_string()), counters()),
            Listener {
                panic_on_report: true,
                ..Listener::default()
            },
        );

        let result = AssertUnwindSafe(h.machine.handle_click(Click::at(5.0, 5.0, NEAR)))
            .catch_unwind()
            .await;
        assert!(result.is_err());
        assert_eq!(h.machine.phase(), Phase::Idle);
    }

    #[tokio::test]
    async fn counters_are_read_at_click_time() {
        let h = harness();
        h.machine.update_account(|a| {
            a.set_counters(ResourceCounters {
                super_clicks_total: 0,
                ..counters()
            });
            a.enable(ClickMode::Super);
        });

        let outcome = h.machine.handle_click(Click::at(6.0, 6.0, NEAR)).await;
        assert_eq!(
            outcome,
            ClickOutcome::Rejected(ClickError::OutOfResource(ClickMode::Super))
        );
        assert_eq!(
            ClickError::OutOfResource(ClickMode::Super).to_string(),
            "no super clicks left"
        );
    }
}
