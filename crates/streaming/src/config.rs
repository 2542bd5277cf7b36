use std::path::{Path, PathBuf};

use foundation::{GridSize, KEY_PRECISION_DECIMALS};
use serde::{Deserialize, Serialize};

/// Page size for `GET /deleted`.
pub const DEFAULT_PAGE_SIZE: usize = 1000;

/// Viewports are split into `N x N` sub-regions.
pub const DEFAULT_PARTITION: u32 = 6;

/// Name of the persistent tile store.
pub const STORE_NAME: &str = "deleted-cells";

/// Layout version of the persistent tile store. Bump when the on-disk value
/// format changes; old versions are left in place and ignored.
pub const STORE_VERSION: u32 = 1;

/// Configuration for region syncing and the persistent tile store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GridConfig {
    /// Base URL of the deleted-cells backend.
    pub api_base_url: String,

    /// Maximum cells per page request.
    pub page_size: usize,

    pub partition_rows: u32,
    pub partition_cols: u32,

    /// Cache-key precision in decimal digits (capped at cell precision).
    pub key_precision_decimals: u32,

    /// Root directory of the on-disk tile store.
    pub cache_root: PathBuf,
    pub store_name: String,
    pub store_version: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    Io(String),
    Parse(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Io(msg) => write!(f, "config read failed: {msg}"),
            ConfigError::Parse(msg) => write!(f, "config parse failed: {msg}"),
        }
    }
}

impl std::error::Error for ConfigError {}

impl GridConfig {
    pub fn grid_size(&self) -> GridSize {
        GridSize::new(self.partition_rows, self.partition_cols)
    }

    /// Read a JSON config file. Missing fields take their defaults.
    pub async fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let raw = tokio::fs::read_to_string(path)
            .await
            .map_err(|e| ConfigError::Io(format!("{path:?}: {e}")))?;
        serde_json::from_str(&raw).map_err(|e| ConfigError::Parse(format!("{path:?}: {e}")))
    }
}

impl Default for GridConfig {
    fn default() -> Self {
        Self {
            api_base_url: "http://127.0.0.1:8080".to_string(),
            page_size: DEFAULT_PAGE_SIZE,
            partition_rows: DEFAULT_PARTITION,
            partition_cols: DEFAULT_PARTITION,
            key_precision_decimals: KEY_PRECISION_DECIMALS,
            cache_root: PathBuf::from("data/cache"),
            store_name: STORE_NAME.to_string(),
            store_version: STORE_VERSION,
        }
    }
}
