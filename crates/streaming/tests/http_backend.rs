//! Drives `HttpBackend` and `TileCache` against an in-process axum server
//! speaking the deleted-cells API.

use std::collections::BTreeSet;
use std::sync::Arc;

use axum::Router;
use axum::extract::{Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::Json;
use foundation::{Cell, LatLon, Region, normalize};
use parking_lot::Mutex;
use pretty_assertions::assert_eq;
use serde::Deserialize;
use streaming::{
    BackendError, CellCoord, CellRenderer, ClickMode, DeleteRequest, DeleteResponse,
    DeletionBackend, GridConfig, HttpBackend, MemoryTileStore, PageQuery, TileCache,
};

const TOKEN: &str = "s3cret";

#[derive(Clone, Default)]
struct ServerState {
    cells: Arc<Mutex<BTreeSet<Cell>>>,
    requests: Arc<Mutex<Vec<DeletedQuery>>>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DeletedQuery {
    min_lat: f64,
    max_lat: f64,
    min_lon: f64,
    max_lon: f64,
    limit: usize,
    last_lat: Option<f64>,
    last_lon: Option<f64>,
}

async fn list_deleted(State(state): State<ServerState>, Query(q): Query<DeletedQuery>) -> Response {
    state.requests.lock().push(q.clone());
    let region = Region::new(q.min_lat, q.max_lat, q.min_lon, q.max_lon);
    let after = match (q.last_lat, q.last_lon) {
        (Some(lat), Some(lon)) => normalize(LatLon::new(lat, lon)).ok(),
        _ => None,
    };
    let page: Vec<CellCoord> = state
        .cells
        .lock()
        .iter()
        .filter(|c| region.contains_cell(**c))
        .filter(|c| after.is_none_or(|a| **c > a))
        .take(q.limit)
        .map(|c| CellCoord::from(*c))
        .collect();
    Json(page).into_response()
}

async fn delete_cell(
    State(state): State<ServerState>,
    headers: HeaderMap,
    Json(req): Json<DeleteRequest>,
) -> Response {
    let authorized = headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v == format!("Bearer {TOKEN}"));
    if !authorized {
        return (StatusCode::UNAUTHORIZED, "missing token").into_response();
    }

    let Ok(cell) = normalize(LatLon::new(req.lat, req.lon)) else {
        return (StatusCode::BAD_REQUEST, "bad coordinate").into_response();
    };
    let mut cells = state.cells.lock();
    match req.mode {
        ClickMode::Single => {
            if !cells.insert(cell) {
                return (StatusCode::CONFLICT, "already deleted").into_response();
            }
            Json(DeleteResponse::default()).into_response()
        }
        ClickMode::Super | ClickMode::Ultra => {
            let affected: Vec<CellCoord> = (0..2)
                .map(|i| Cell::from_indices(cell.lat_index() + i, cell.lon_index()))
                .filter(|c| cells.insert(*c))
                .map(CellCoord::from)
                .collect();
            Json(DeleteResponse {
                already_deleted: affected.is_empty(),
                inserted_count: Some(affected.len() as u64),
                coordinates: affected,
            })
            .into_response()
        }
    }
}

async fn spawn_server(state: ServerState) -> String {
    let app = Router::new()
        .route("/deleted", get(list_deleted))
        .route("/delete", post(delete_cell))
        .with_state(state);
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    format!("http://{addr}/")
}

#[derive(Default)]
struct Collect(Mutex<Vec<Cell>>);

impl CellRenderer for Collect {
    fn render(&self, cell: Cell) {
        self.0.lock().push(cell);
    }

    fn erase(&self, _cell: Cell) {}
}

fn cell(lat: f64, lon: f64) -> Cell {
    normalize(LatLon::new(lat, lon)).unwrap()
}

#[tokio::test]
async fn pages_over_http_with_cursor_params() {
    let state = ServerState::default();
    state
        .cells
        .lock()
        .extend((0..5).map(|i| cell(40.0 + 0.001 * i as f64, -3.7)));
    let base = spawn_server(state.clone()).await;
    let backend = HttpBackend::new(base);

    let region = Region::new(40.0, 40.01, -3.71, -3.69);
    let first = backend.fetch_page(PageQuery::first(region, 3)).await.unwrap();
    assert_eq!(first.len(), 3);

    let second = backend
        .fetch_page(PageQuery {
            region,
            limit: 3,
            after: first.last().copied(),
        })
        .await
        .unwrap();
    assert_eq!(second.len(), 2);

    let requests = state.requests.lock().clone();
    assert_eq!(requests[0].last_lat, None);
    assert_eq!(requests[1].last_lat, Some(first[2].lat));
    assert_eq!(requests[1].last_lon, Some(first[2].lon));
    assert_eq!(requests[1].limit, 3);
}

#[tokio::test]
async fn delete_round_trips_and_maps_conflict() {
    let state = ServerState::default();
    let backend = HttpBackend::new(spawn_server(state.clone()).await);
    let target = cell(12.3456, 65.4321);

    let resp = backend
        .delete(TOKEN, DeleteRequest::new(target, ClickMode::Single))
        .await
        .unwrap();
    assert!(!resp.already_deleted);
    assert!(state.cells.lock().contains(&target));

    let again = backend
        .delete(TOKEN, DeleteRequest::new(target, ClickMode::Single))
        .await
        .unwrap();
    assert_eq!(again, DeleteResponse::already_deleted());

    let batch = backend
        .delete(TOKEN, DeleteRequest::new(cell(1.0, 1.0), ClickMode::Super))
        .await
        .unwrap();
    assert_eq!(batch.coordinates.len(), 2);
    assert_eq!(batch.inserted_count, Some(2));
}

#[tokio::test]
async fn rejected_token_surfaces_status() {
    let backend = HttpBackend::new(spawn_server(ServerState::default()).await);
    let err = backend
        .delete("wrong", DeleteRequest::new(cell(0.0, 0.0), ClickMode::Single))
        .await
        .unwrap_err();
    assert_eq!(
        err,
        BackendError::Status {
            status: 401,
            body: "missing token".to_string()
        }
    );
}

#[tokio::test]
async fn unreachable_backend_is_a_network_error() {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);

    let backend = HttpBackend::new(format!("http://{addr}"));
    let err = backend
        .fetch_page(PageQuery::first(Region::new(0.0, 0.01, 0.0, 0.01), 10))
        .await
        .unwrap_err();
    assert!(matches!(err, BackendError::Network(_)), "{err:?}");
}

#[tokio::test]
async fn tile_cache_syncs_over_http() {
    let state = ServerState::default();
    let cells = vec![cell(0.0015, 0.0015), cell(0.0155, 0.0425), cell(0.0555, 0.0555)];
    state.cells.lock().extend(cells.iter().copied());
    let backend = Arc::new(HttpBackend::new(spawn_server(state.clone()).await));
    let renderer = Arc::new(Collect::default());
    let store = Arc::new(MemoryTileStore::new());

    let cache = TileCache::new(&GridConfig::default(), store.clone(), backend, renderer.clone());
    let report = cache.sync_region(Region::new(0.0, 0.06, 0.0, 0.06)).await;

    assert_eq!(report.from_network, 36);
    let mut rendered = renderer.0.lock().clone();
    rendered.sort();
    assert_eq!(rendered, cells);
    assert_eq!(store.len(), 36);
    assert_eq!(state.requests.lock().len(), 36);
}
