//! Persistent tile store: cache key -> list of deleted cells.
//!
//! The backend stays authoritative; this store only saves round trips across
//! sessions. Every operation may fail with [`StorageError`], and callers are
//! expected to degrade (treat as a miss, drop the write) rather than abort.

use std::collections::{BTreeMap, BTreeSet};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use foundation::{CacheKey, Cell};
use parking_lot::Mutex;
use tokio::sync::OnceCell;
use tracing::{debug, warn};

use crate::backend::BoxFuture;
use crate::protocol::CellCoord;

/// The persisted unit: all known deleted cells inside one key's bounds.
#[derive(Debug, Clone, PartialEq)]
pub struct Tile {
    pub key: CacheKey,
    pub cells: Vec<Cell>,
}

impl Tile {
    pub fn new(key: CacheKey, cells: Vec<Cell>) -> Self {
        Self { key, cells }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StorageError {
    Unavailable(String),
    Corrupt(String),
    Io(String),
}

impl std::fmt::Display for StorageError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StorageError::Unavailable(msg) => write!(f, "tile store unavailable: {msg}"),
            StorageError::Corrupt(msg) => write!(f, "tile store corrupt: {msg}"),
            StorageError::Io(msg) => write!(f, "tile store error: {msg}"),
        }
    }
}

impl std::error::Error for StorageError {}

/// Durable key -> cells storage.
///
/// `put` overwrites wholesale (last write wins, no merge). Deleting or
/// reading a key that was never stored is not an error.
pub trait TileStore: Send + Sync {
    fn get(&self, key: CacheKey) -> BoxFuture<'_, Result<Option<Tile>, StorageError>>;
    fn put(&self, tile: Tile) -> BoxFuture<'_, Result<(), StorageError>>;
    /// Returns whether an entry existed.
    fn delete(&self, key: CacheKey) -> BoxFuture<'_, Result<bool, StorageError>>;
    fn clear(&self) -> BoxFuture<'_, Result<(), StorageError>>;
    /// All stored keys, sorted.
    fn keys(&self) -> BoxFuture<'_, Result<Vec<CacheKey>, StorageError>>;
}

/// Process-local store, used by tests and when disk caching is disabled.
#[derive(Debug, Default)]
pub struct MemoryTileStore {
    tiles: Mutex<BTreeMap<CacheKey, Vec<Cell>>>,
}

impl MemoryTileStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.tiles.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.tiles.lock().is_empty()
    }
}

impl TileStore for MemoryTileStore {
    fn get(&self, key: CacheKey) -> BoxFuture<'_, Result<Option<Tile>, StorageError>> {
        let tile = self
            .tiles
            .lock()
            .get(&key)
            .map(|cells| Tile::new(key, cells.clone()));
        Box::pin(async move { Ok(tile) })
    }

    fn put(&self, tile: Tile) -> BoxFuture<'_, Result<(), StorageError>> {
        self.tiles.lock().insert(tile.key, tile.cells);
        Box::pin(async { Ok(()) })
    }

    fn delete(&self, key: CacheKey) -> BoxFuture<'_, Result<bool, StorageError>> {
        let existed = self.tiles.lock().remove(&key).is_some();
        Box::pin(async move { Ok(existed) })
    }

    fn clear(&self) -> BoxFuture<'_, Result<(), StorageError>> {
        self.tiles.lock().clear();
        Box::pin(async { Ok(()) })
    }

    fn keys(&self) -> BoxFuture<'_, Result<Vec<CacheKey>, StorageError>> {
        let keys = self.tiles.lock().keys().copied().collect();
        Box::pin(async move { Ok(keys) })
    }
}

/// On-disk store: one JSON file per key under
/// `<cache_root>/<store_name>/v<store_version>/`.
///
/// Each file holds the tile's cells as `[{"lat":..,"lon":..}, ...]` and is
/// named after the key string (`0.00,0.01,0.00,0.01.json`). The directory is
/// created and scanned once on first use; after that the set of stored keys
/// is kept in memory, so [`TileStore::keys`] does not touch the disk.
#[derive(Debug)]
pub struct DiskTileStore {
    dir: PathBuf,
    index: OnceCell<Mutex<BTreeSet<CacheKey>>>,
    tmp_seq: AtomicU64,
}

const TILE_EXT: &str = ".json";

impl DiskTileStore {
    pub fn new(cache_root: impl AsRef<Path>, store_name: &str, store_version: u32) -> Self {
        Self {
            dir: cache_root
                .as_ref()
                .join(store_name)
                .join(format!("v{store_version}")),
            index: OnceCell::new(),
            tmp_seq: AtomicU64::new(0),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn tile_path(&self, key: CacheKey) -> PathBuf {
        self.dir.join(format!("{key}{TILE_EXT}"))
    }

    async fn open(&self) -> Result<&Mutex<BTreeSet<CacheKey>>, StorageError> {
        self.index
            .get_or_try_init(|| async {
                tokio::fs::create_dir_all(&self.dir).await.map_err(|e| {
                    StorageError::Unavailable(format!("create {:?} failed: {e}", self.dir))
                })?;
                let keys = self.scan_keys().await?;
                debug!("opened tile store at {:?} ({} tiles)", self.dir, keys.len());
                Ok::<_, StorageError>(Mutex::new(keys))
            })
            .await
    }

    async fn read_tile(&self, key: CacheKey) -> Result<Option<Tile>, StorageError> {
        self.open().await?;
        let path = self.tile_path(key);
        let raw = match tokio::fs::read(&path).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(StorageError::Io(format!("read {path:?} failed: {e}"))),
        };

        let coords: Vec<CellCoord> = serde_json::from_slice(&raw)
            .map_err(|e| StorageError::Corrupt(format!("{path:?}: {e}")))?;
        let cells = coords
            .into_iter()
            .map(|c| c.to_cell())
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| StorageError::Corrupt(format!("{path:?}: {e}")))?;
        Ok(Some(Tile::new(key, cells)))
    }

    async fn write_tile(&self, tile: Tile) -> Result<(), StorageError> {
        let index = self.open().await?;
        let dir = &self.dir;
        let coords: Vec<CellCoord> = tile.cells.iter().copied().map(CellCoord::from).collect();
        let body = serde_json::to_vec(&coords).map_err(|e| StorageError::Io(e.to_string()))?;

        // Write-then-rename so concurrent writers of the same key never leave
        // a torn file; whichever rename lands last wins.
        let seq = self.tmp_seq.fetch_add(1, Ordering::Relaxed);
        let tmp = dir.join(format!(".{}{TILE_EXT}.{seq}.tmp", tile.key));
        let path = self.tile_path(tile.key);

        tokio::fs::write(&tmp, body)
            .await
            .map_err(|e| StorageError::Io(format!("write {tmp:?} failed: {e}")))?;
        if let Err(e) = tokio::fs::rename(&tmp, &path).await {
            let _ = tokio::fs::remove_file(&tmp).await;
            return Err(StorageError::Io(format!("rename to {path:?} failed: {e}")));
        }
        index.lock().insert(tile.key);
        Ok(())
    }

    async fn remove_tile(&self, key: CacheKey) -> Result<bool, StorageError> {
        let index = self.open().await?;
        let path = self.tile_path(key);
        let existed = match tokio::fs::remove_file(&path).await {
            Ok(()) => true,
            Err(e) if e.kind() == ErrorKind::NotFound => false,
            Err(e) => return Err(StorageError::Io(format!("remove {path:?} failed: {e}"))),
        };
        index.lock().remove(&key);
        Ok(existed)
    }

    async fn remove_all(&self) -> Result<(), StorageError> {
        let index = self.open().await?;
        let dir = &self.dir;
        index.lock().clear();
        match tokio::fs::remove_dir_all(dir).await {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => return Err(StorageError::Io(format!("clear {dir:?} failed: {e}"))),
        }
        tokio::fs::create_dir_all(dir)
            .await
            .map_err(|e| StorageError::Unavailable(format!("recreate {dir:?} failed: {e}")))
    }

    async fn list_keys(&self) -> Result<Vec<CacheKey>, StorageError> {
        let index = self.open().await?;
        let keys = index.lock().iter().copied().collect();
        Ok(keys)
    }

    async fn scan_keys(&self) -> Result<BTreeSet<CacheKey>, StorageError> {
        let dir = &self.dir;
        let mut entries = tokio::fs::read_dir(dir)
            .await
            .map_err(|e| StorageError::Io(format!("list {dir:?} failed: {e}")))?;

        let mut keys = BTreeSet::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| StorageError::Io(format!("list {dir:?} failed: {e}")))?
        {
            let name = entry.file_name();
            let Some(name) = name.to_str() else {
                continue;
            };
            if name.starts_with('.') {
                continue;
            }
            let Some(stem) = name.strip_suffix(TILE_EXT) else {
                continue;
            };
            match stem.parse::<CacheKey>() {
                Ok(key) => {
                    keys.insert(key);
                }
                Err(e) => warn!("ignoring stray file in tile store: {e}"),
            }
        }
        Ok(keys)
    }
}

impl TileStore for DiskTileStore {
    fn get(&self, key: CacheKey) -> BoxFuture<'_, Result<Option<Tile>, StorageError>> {
        Box::pin(self.read_tile(key))
    }

    fn put(&self, tile: Tile) -> BoxFuture<'_, Result<(), StorageError>> {
        Box::pin(self.write_tile(tile))
    }

    fn delete(&self, key: CacheKey) -> BoxFuture<'_, Result<bool, StorageError>> {
        Box::pin(self.remove_tile(key))
    }

    fn clear(&self) -> BoxFuture<'_, Result<(), StorageError>> {
        Box::pin(self.remove_all())
    }

    fn keys(&self) -> BoxFuture<'_, Result<Vec<CacheKey>, StorageError>> {
        Box::pin(self.list_keys())
    }
}
