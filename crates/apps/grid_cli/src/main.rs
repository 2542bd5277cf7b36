use std::env;
use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use deletion::{
    Account, Click, ClickConfig, ClickMode, ClickOutcome, DEFAULT_MAX_CAMERA_HEIGHT_M,
    DeletionListener, DeletionMachine, ResourceCounters,
};
use foundation::{Cell, Region};
use streaming::{
    CellRenderer, DiskTileStore, GridConfig, HttpBackend, MemoryTileStore, TileCache, TileStore,
};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(author, version, about = "Sync and delete cells of the shared world grid")]
struct Args {
    /// JSON config file; env vars and flags override its values
    #[arg(long)]
    config: Option<PathBuf>,

    /// Backend base URL (default: $GRID_API_URL)
    #[arg(long)]
    api_url: Option<String>,

    /// Tile store root directory (default: $GRID_CACHE_ROOT)
    #[arg(long)]
    cache_root: Option<PathBuf>,

    /// Cells per page request (default: $GRID_PAGE_SIZE)
    #[arg(long)]
    page_size: Option<usize>,

    /// Keep tiles in memory only; nothing is read from or written to disk
    #[arg(long)]
    no_disk_cache: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Fetch and print the deleted cells inside a region
    Sync {
        #[arg(long, allow_hyphen_values = true)]
        min_lat: f64,
        #[arg(long, allow_hyphen_values = true)]
        max_lat: f64,
        #[arg(long, allow_hyphen_values = true)]
        min_lon: f64,
        #[arg(long, allow_hyphen_values = true)]
        max_lon: f64,
    },

    /// Delete the cell under a point
    Delete {
        #[arg(long, allow_hyphen_values = true)]
        lat: f64,
        #[arg(long, allow_hyphen_values = true)]
        lon: f64,

        /// single, super or ultra
        #[arg(long, default_value_t = ClickMode::Single)]
        mode: ClickMode,

        /// Session token (default: $GRID_TOKEN)
        #[arg(long)]
        token: Option<String>,

        /// Charges available for the chosen mode (ignored with --profile)
        #[arg(long, default_value_t = 1)]
        credits: u64,

        /// Profile JSON carrying `clicksTotal`, `superClicksTotal`, ...
        #[arg(long)]
        profile: Option<PathBuf>,

        /// Camera height above the surface, in meters
        #[arg(long, default_value_t = 10_000.0)]
        camera_height_m: f64,
    },

    /// Remove every stored tile
    ClearCache,
}

/// Prints cells instead of drawing them.
struct LogRenderer;

impl CellRenderer for LogRenderer {
    fn render(&self, cell: Cell) {
        info!("deleted cell {cell}");
    }

    fn erase(&self, cell: Cell) {
        info!("restored cell {cell}");
    }
}

struct LogListener;

impl DeletionListener for LogListener {
    fn report(&self, outcome: &ClickOutcome) {
        match outcome {
            ClickOutcome::Deleted { mode, cells } => {
                info!("{mode} click deleted {} cell(s)", cells.len())
            }
            ClickOutcome::Rejected(err) | ClickOutcome::Failed(err) => error!("{err}"),
            ClickOutcome::Busy | ClickOutcome::Missed => {}
        }
    }

    fn refresh_profile(&self) {
        info!("profile changed; counters are stale until the next sign-in");
    }
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let args = Args::parse();
    let config = load_config(&args).await?;
    info!("backend {} store {}", config.api_base_url, config.cache_root.display());

    let store = open_store(&config, args.no_disk_cache);
    let backend = Arc::new(HttpBackend::new(config.api_base_url.clone()));
    let cache = Arc::new(TileCache::new(&config, store.clone(), backend, Arc::new(LogRenderer)));

    match args.command {
        Command::Sync {
            min_lat,
            max_lat,
            min_lon,
            max_lon,
        } => {
            let report = cache
                .sync_region(Region::new(min_lat, max_lat, min_lon, max_lon))
                .await;
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
        Command::Delete {
            lat,
            lon,
            mode,
            token,
            credits,
            profile,
            camera_height_m,
        } => {
            let token = token.or_else(|| env::var("GRID_TOKEN").ok());
            let counters = match profile {
                Some(path) => {
                    let raw = tokio::fs::read_to_string(&path).await?;
                    serde_json::from_str::<ResourceCounters>(&raw)?
                }
                None => counters_for(mode, credits),
            };
            let mut account = Account::new(token, counters);
            account.enable(mode);
            let click_config = ClickConfig {
                max_camera_height_m: env_var_f64(
                    "GRID_MAX_CAMERA_HEIGHT_M",
                    DEFAULT_MAX_CAMERA_HEIGHT_M,
                ),
            };

            let machine = DeletionMachine::new(cache, Arc::new(LogListener), account, click_config);
            let outcome = machine
                .handle_click(Click::at(lat, lon, camera_height_m))
                .await;
            match outcome {
                ClickOutcome::Deleted { cells, .. } => {
                    let coords: Vec<[f64; 2]> =
                        cells.iter().map(|c| [c.lat(), c.lon()]).collect();
                    println!("{}", serde_json::to_string(&coords)?);
                }
                ClickOutcome::Rejected(err) | ClickOutcome::Failed(err) => return Err(err.into()),
                ClickOutcome::Busy | ClickOutcome::Missed => {}
            }
        }
        Command::ClearCache => {
            let removed = store.keys().await?.len();
            store.clear().await?;
            info!("removed {removed} stored tiles");
        }
    }

    Ok(())
}

/// Config file (or defaults), then env vars, then flags.
async fn load_config(args: &Args) -> Result<GridConfig, streaming::ConfigError> {
    let defaults = match &args.config {
        Some(path) => GridConfig::load(path).await?,
        None => GridConfig::default(),
    };
    Ok(GridConfig {
        api_base_url: args
            .api_url
            .clone()
            .unwrap_or_else(|| env::var("GRID_API_URL").unwrap_or(defaults.api_base_url.clone())),
        cache_root: args.cache_root.clone().unwrap_or_else(|| {
            env::var("GRID_CACHE_ROOT")
                .map(PathBuf::from)
                .unwrap_or(defaults.cache_root.clone())
        }),
        page_size: args
            .page_size
            .unwrap_or_else(|| env_var_usize("GRID_PAGE_SIZE", defaults.page_size)),
        ..defaults
    })
}

fn open_store(config: &GridConfig, no_disk_cache: bool) -> Arc<dyn TileStore> {
    if no_disk_cache {
        return Arc::new(MemoryTileStore::new());
    }
    Arc::new(DiskTileStore::new(
        &config.cache_root,
        &config.store_name,
        config.store_version,
    ))
}

fn counters_for(mode: ClickMode, credits: u64) -> ResourceCounters {
    let mut counters = ResourceCounters::default();
    match mode {
        ClickMode::Single => counters.clicks_total = credits,
        ClickMode::Super => counters.super_clicks_total = credits,
        ClickMode::Ultra => counters.ultra_clicks_total = credits,
    }
    counters
}

fn env_var_usize(key: &str, default: usize) -> usize {
    env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_var_f64(key: &str, default: f64) -> f64 {
    env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}
