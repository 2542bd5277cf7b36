//! Viewport sync: partition, dedupe, fetch (store first, then paged network),
//! render, persist.
//!
//! All session state lives in one [`TileCache`] instance:
//! - the fetched-bounds set (keys requested this session, with the state of
//!   each claim),
//! - the render deduplicator (cells drawn this session),
//! - cells drawn optimistically whose deletion was never confirmed.
//!
//! Every check-and-set on that state happens under a short `parking_lot`
//! lock that is never held across an `.await`, so interleaved syncs cannot
//! both claim the same key.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use foundation::{CacheKey, Cell, GridSize, Region, partition};
use futures_util::future::join_all;
use parking_lot::Mutex;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::backend::{BackendError, DeletionBackend};
use crate::config::GridConfig;
use crate::protocol::PageQuery;
use crate::render::{CellRenderer, RenderDedup};
use crate::store::{StorageError, Tile, TileStore};

/// Summary of one [`TileCache::sync_region`] call.
#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize)]
pub struct SyncReport {
    pub sub_regions: usize,
    /// Already requested earlier this session (or by a concurrent sync).
    pub skipped: usize,
    pub from_store: usize,
    pub from_network: usize,
    pub failed: usize,
    /// Results that arrived after teardown and were dropped.
    pub discarded: usize,
    pub cells_rendered: usize,
}

/// State of one fetched-bounds entry.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
enum Claim {
    /// A fetch holding this generation is running.
    InFlight(u64),
    /// Invalidated while its fetch was running. The fetch must not persist
    /// its tile and releases the key when it ends.
    Stale(u64),
    Settled,
}

#[derive(Debug, Default)]
struct Claims {
    next_generation: u64,
    keys: HashMap<CacheKey, Claim>,
}

enum KeyOutcome {
    Store { rendered: usize },
    Network { rendered: usize },
    Failed { rendered: usize },
    Discarded,
}

pub struct TileCache {
    grid: GridSize,
    key_decimals: u32,
    page_size: usize,
    store: Arc<dyn TileStore>,
    backend: Arc<dyn DeletionBackend>,
    renderer: Arc<dyn CellRenderer>,
    fetched: Mutex<Claims>,
    drawn: RenderDedup,
    unconfirmed: Mutex<HashSet<Cell>>,
    live: AtomicBool,
}

impl TileCache {
    pub fn new(
        config: &GridConfig,
        store: Arc<dyn TileStore>,
        backend: Arc<dyn DeletionBackend>,
        renderer: Arc<dyn CellRenderer>,
    ) -> Self {
        Self {
            grid: config.grid_size(),
            key_decimals: config.key_precision_decimals,
            page_size: config.page_size.max(1),
            store,
            backend,
            renderer,
            fetched: Mutex::new(Claims::default()),
            drawn: RenderDedup::new(),
            unconfirmed: Mutex::new(HashSet::new()),
            live: AtomicBool::new(true),
        }
    }

    pub fn key_for(&self, region: &Region) -> CacheKey {
        CacheKey::for_region(region, self.key_decimals)
    }

    pub fn backend(&self) -> &Arc<dyn DeletionBackend> {
        &self.backend
    }

    pub fn dedup(&self) -> &RenderDedup {
        &self.drawn
    }

    pub fn is_fetched(&self, key: CacheKey) -> bool {
        self.fetched.lock().keys.contains_key(&key)
    }

    pub fn fetched_len(&self) -> usize {
        self.fetched.lock().keys.len()
    }

    pub fn is_live(&self) -> bool {
        self.live.load(Ordering::Acquire)
    }

    /// Mark the owning view as destroyed. In-flight work keeps running but
    /// its results are no longer rendered or persisted.
    pub fn teardown(&self) {
        self.live.store(false, Ordering::Release);
        info!("tile cache torn down");
    }

    /// Forget everything drawn or requested this session (full reload).
    /// The persistent store is left alone.
    pub fn reload(&self) {
        self.drawn.reset();
        self.fetched.lock().keys.clear();
        self.unconfirmed.lock().clear();
    }

    /// Wipe the persistent store and the session's fetched-bounds set.
    pub async fn clear_store(&self) -> Result<(), StorageError> {
        self.fetched.lock().keys.clear();
        self.store.clear().await
    }

    /// Bring every sub-region of `region` on screen. Bounds are clamped to
    /// the valid coordinate range first.
    ///
    /// Sub-regions already requested this session are skipped. The rest are
    /// fetched concurrently; the call resolves once all of them settle.
    pub async fn sync_region(&self, region: Region) -> SyncReport {
        let mut report = SyncReport::default();
        if !region.is_well_formed() {
            warn!("ignoring malformed sync region {region:?}");
            return report;
        }
        let region = region.clamped_to_world();

        let parts = partition(region, self.grid);
        report.sub_regions = parts.len();

        let mut claimed = Vec::with_capacity(parts.len());
        for part in &parts {
            let key = self.key_for(part);
            match self.claim(key) {
                Some(generation) => claimed.push((key, generation)),
                None => report.skipped += 1,
            }
        }

        let outcomes = join_all(
            claimed
                .into_iter()
                .map(|(key, generation)| self.sync_key(key, generation)),
        )
        .await;
        for outcome in outcomes {
            match outcome {
                KeyOutcome::Store { rendered } => {
                    report.from_store += 1;
                    report.cells_rendered += rendered;
                }
                KeyOutcome::Network { rendered } => {
                    report.from_network += 1;
                    report.cells_rendered += rendered;
                }
                KeyOutcome::Failed { rendered } => {
                    report.failed += 1;
                    report.cells_rendered += rendered;
                }
                KeyOutcome::Discarded => report.discarded += 1,
            }
        }

        debug!(?report, "sync complete");
        report
    }

    /// Claim `key` for this session. Returns the claim's generation, or
    /// `None` if the key is already claimed.
    fn claim(&self, key: CacheKey) -> Option<u64> {
        let mut claims = self.fetched.lock();
        if claims.keys.contains_key(&key) {
            return None;
        }
        claims.next_generation += 1;
        let generation = claims.next_generation;
        claims.keys.insert(key, Claim::InFlight(generation));
        Some(generation)
    }

    fn is_stale(&self, key: CacheKey, generation: u64) -> bool {
        self.fetched.lock().keys.get(&key) == Some(&Claim::Stale(generation))
    }

    /// End the claim `generation` on `key`. A running claim settles; a stale
    /// one is released so the next sync fetches again. Returns `true` if the
    /// claim went stale. Claims dropped by `reload` are left alone.
    fn finish_claim(&self, key: CacheKey, generation: u64) -> bool {
        let mut claims = self.fetched.lock();
        match claims.keys.get(&key).copied() {
            Some(Claim::InFlight(g)) if g == generation => {
                claims.keys.insert(key, Claim::Settled);
                false
            }
            Some(Claim::Stale(g)) if g == generation => {
                claims.keys.remove(&key);
                true
            }
            _ => false,
        }
    }

    fn release_claim(&self, key: CacheKey, generation: u64) {
        let mut claims = self.fetched.lock();
        if let Some(Claim::InFlight(g) | Claim::Stale(g)) = claims.keys.get(&key).copied() {
            if g == generation {
                claims.keys.remove(&key);
            }
        }
    }

    async fn sync_key(&self, key: CacheKey, generation: u64) -> KeyOutcome {
        match self.store.get(key).await {
            Ok(Some(tile)) => {
                if !self.is_live() {
                    return KeyOutcome::Discarded;
                }
                debug!("tile store hit for {key} ({} cells)", tile.cells.len());
                let rendered = self.render_all(&tile.cells);
                // The invalidation already removed the stored copy.
                self.finish_claim(key, generation);
                return KeyOutcome::Store { rendered };
            }
            Ok(None) => {}
            Err(err) => warn!("tile store read failed for {key}, fetching from network: {err}"),
        }

        let mut rendered = 0;
        match self.fetch_pages(key, &mut rendered).await {
            Ok(cells) => {
                if !self.is_live() {
                    return KeyOutcome::Discarded;
                }
                self.settle_unconfirmed(key, &cells);
                if !self.is_stale(key, generation) {
                    if let Err(err) = self.store.put(Tile::new(key, cells)).await {
                        warn!("tile store write failed for {key}: {err}");
                    }
                }
                if self.finish_claim(key, generation) {
                    // Invalidated mid-fetch: whatever was written predates it.
                    debug!("{key} invalidated during fetch, dropping its tile");
                    if let Err(err) = self.store.delete(key).await {
                        warn!("tile store delete failed for {key}: {err}");
                    }
                }
                KeyOutcome::Network { rendered }
            }
            Err(err) => {
                // Release the claim so the next sync retries this sub-region.
                self.release_claim(key, generation);
                warn!("fetch failed for {key}: {err}");
                KeyOutcome::Failed { rendered }
            }
        }
    }

    /// Page through the backend for `key`'s bounds, rendering each page as
    /// it arrives. `rendered` counts what reached the renderer even if a
    /// later page fails.
    async fn fetch_pages(
        &self,
        key: CacheKey,
        rendered: &mut usize,
    ) -> Result<Vec<Cell>, BackendError> {
        let mut query = PageQuery::first(key.region(), self.page_size);
        let mut cells = Vec::new();

        loop {
            let page = self.backend.fetch_page(query).await?;

            let mut page_cells = Vec::with_capacity(page.len());
            for coord in &page {
                match coord.to_cell() {
                    Ok(cell) => page_cells.push(cell),
                    Err(err) => warn!("skipping malformed cell from backend: {err}"),
                }
            }
            *rendered += self.render_all(&page_cells);
            cells.extend(page_cells);

            let Some(last) = page.last() else {
                break;
            };
            if page.len() < self.page_size {
                break;
            }
            query.after = Some(*last);
        }

        Ok(cells)
    }

    fn render_all(&self, cells: &[Cell]) -> usize {
        if !self.is_live() {
            return 0;
        }
        let mut n = 0;
        for &cell in cells {
            if self.drawn.should_render(cell) {
                self.renderer.render(cell);
                n += 1;
            }
        }
        n
    }

    /// Draw a single cell if it is not on screen yet.
    pub fn render_cell(&self, cell: Cell) -> bool {
        if !self.is_live() || !self.drawn.should_render(cell) {
            return false;
        }
        self.renderer.render(cell);
        true
    }

    /// Record an optimistically drawn cell whose deletion the backend did
    /// not confirm. The next network fetch covering it erases it unless the
    /// backend reports it after all.
    pub fn mark_unconfirmed(&self, cell: Cell) {
        self.unconfirmed.lock().insert(cell);
    }

    pub fn is_unconfirmed(&self, cell: Cell) -> bool {
        self.unconfirmed.lock().contains(&cell)
    }

    fn settle_unconfirmed(&self, key: CacheKey, authoritative: &[Cell]) {
        let stale: Vec<Cell> = {
            let mut pending = self.unconfirmed.lock();
            if pending.is_empty() {
                return;
            }
            let covered: Vec<Cell> = pending.iter().copied().filter(|c| key.contains(*c)).collect();
            if covered.is_empty() {
                return;
            }
            let truth: HashSet<Cell> = authoritative.iter().copied().collect();
            covered
                .into_iter()
                .filter(|c| {
                    pending.remove(c);
                    !truth.contains(c)
                })
                .collect()
        };

        for cell in stale {
            debug!("erasing unconfirmed cell {cell}");
            self.drawn.forget(cell);
            self.renderer.erase(cell);
        }
    }

    /// Drop the fetched marker and the stored tile for `key`. Unknown keys
    /// are a no-op. Returns whether anything was removed.
    ///
    /// A key whose fetch is still running stays claimed until that fetch
    /// ends, so no second fetch for it starts in the meantime; the running
    /// fetch then skips persisting and releases the key.
    pub async fn invalidate_key(&self, key: CacheKey) -> bool {
        let was_fetched = {
            let mut claims = self.fetched.lock();
            match claims.keys.get(&key).copied() {
                Some(Claim::InFlight(g)) => {
                    claims.keys.insert(key, Claim::Stale(g));
                    true
                }
                Some(Claim::Stale(_)) => true,
                Some(Claim::Settled) => {
                    claims.keys.remove(&key);
                    true
                }
                None => false,
            }
        };
        let was_stored = match self.store.delete(key).await {
            Ok(existed) => existed,
            Err(err) => {
                warn!("tile store delete failed for {key}: {err}");
                false
            }
        };
        was_fetched || was_stored
    }

    /// Invalidate every fetched or stored key whose bounds contain one of
    /// `cells`, so the next sync over them refetches from the backend.
    /// Returns the invalidated keys.
    ///
    /// Stored keys come from [`TileStore::keys`], which the bundled stores
    /// answer from memory.
    pub async fn invalidate_cells(&self, cells: &[Cell]) -> Vec<CacheKey> {
        if cells.is_empty() {
            return Vec::new();
        }
        let covers = |key: &CacheKey| cells.iter().any(|c| key.contains(*c));

        let mut keys: Vec<CacheKey> = self
            .fetched
            .lock()
            .keys
            .keys()
            .copied()
            .filter(covers)
            .collect();
        match self.store.keys().await {
            Ok(stored) => keys.extend(stored.into_iter().filter(covers)),
            Err(err) => warn!("tile store listing failed during invalidation: {err}"),
        }
        keys.sort();
        keys.dedup();

        for &key in &keys {
            self.invalidate_key(key).await;
        }
        debug!("invalidated {} tiles for {} cells", keys.len(), cells.len());
        keys
    }
}
