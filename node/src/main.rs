use std::fs;
use std::path::PathBuf;
use std::sync::atomic::AtomicUsize;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use clap::Parser;
use config::{Config, File as ConfigFile};
use serde::Deserialize;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use drophost_jad::JadMaker;
use drophost_limit::{RateLimitConfig, RateLimiter};
use drophost_rpc::{start_server, AppState};
use drophost_store::{FileStore, SWEEP_INTERVAL};

#[derive(Debug, Parser)]
#[command(name = "drophost-node", version, about = "Ephemeral anonymous file host")]
struct Cli {
    /// Optional TOML configuration file; CLI flags override its values.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Address to listen on, e.g. 0.0.0.0:3000.
    #[arg(long)]
    listen: Option<String>,

    /// Directory holding uploaded content.
    #[arg(long)]
    data_dir: Option<PathBuf>,

    /// Parent directory for per-request scratch space.
    #[arg(long)]
    scratch_dir: Option<PathBuf>,

    /// Directory of static assets (upload form) to serve at the root.
    #[arg(long)]
    static_dir: Option<PathBuf>,

    /// Descriptor-generation command.
    #[arg(long)]
    jadmaker: Option<String>,

    /// Seconds before a hung descriptor tool is killed.
    #[arg(long)]
    jadmaker_timeout_secs: Option<u64>,

    /// Log filter when RUST_LOG is unset.
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
struct NodeConfig {
    listen: String,
    data_dir: PathBuf,
    scratch_dir: PathBuf,
    static_dir: Option<PathBuf>,
    jadmaker: String,
    jadmaker_timeout_secs: u64,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            listen: "0.0.0.0:3000".to_string(),
            data_dir: PathBuf::from("uploads"),
            scratch_dir: std::env::temp_dir().join("drophost"),
            static_dir: None,
            jadmaker: "jadmaker".to_string(),
            jadmaker_timeout_secs: 10,
        }
    }
}

impl NodeConfig {
    fn load(cli: &Cli) -> Result<Self> {
        let mut config = match &cli.config {
            Some(path) => {
                let settings = Config::builder()
                    .add_source(ConfigFile::from(path.as_path()))
                    .build()
                    .with_context(|| format!("failed to read config file {}", path.display()))?;
                settings
                    .try_deserialize::<NodeConfig>()
                    .context("invalid configuration file")?
            }
            None => NodeConfig::default(),
        };

        if let Some(listen) = &cli.listen {
            config.listen = listen.clone();
        }
        if let Some(data_dir) = &cli.data_dir {
            config.data_dir = data_dir.clone();
        }
        if let Some(scratch_dir) = &cli.scratch_dir {
            config.scratch_dir = scratch_dir.clone();
        }
        if let Some(static_dir) = &cli.static_dir {
            config.static_dir = Some(static_dir.clone());
        }
        if let Some(jadmaker) = &cli.jadmaker {
            config.jadmaker = jadmaker.clone();
        }
        if let Some(secs) = cli.jadmaker_timeout_secs {
            config.jadmaker_timeout_secs = secs;
        }

        Ok(config)
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(cli.log_level.clone())),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = NodeConfig::load(&cli)?;
    info!(?config, "starting drophost");

    fs::create_dir_all(&config.scratch_dir).with_context(|| {
        format!(
            "failed to create scratch directory {}",
            config.scratch_dir.display()
        )
    })?;

    let store = FileStore::open(&config.data_dir)?;
    let limiter = RateLimiter::new(RateLimitConfig::default());
    let jad = JadMaker::new(
        &config.jadmaker,
        Duration::from_secs(config.jadmaker_timeout_secs),
    );

    if let Some(static_dir) = &config.static_dir {
        if !static_dir.exists() {
            warn!("static assets directory {} not found", static_dir.display());
        }
    }

    // Expiry sweep at startup and on a fixed cadence; the first interval
    // tick fires immediately.
    let sweep_store = store.clone();
    let sweep_limiter = limiter.clone();
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(SWEEP_INTERVAL);
        loop {
            ticker.tick().await;
            sweep_store.sweep();
            sweep_limiter.evict_stale();
        }
    });

    let state = AppState {
        store,
        limiter,
        jad,
        scratch_root: config.scratch_dir.clone(),
        static_assets: config.static_dir.clone(),
        start_time: Instant::now(),
        req_count: Arc::new(AtomicUsize::new(0)),
    };

    info!("listening on {}", config.listen);
    start_server(state, &config.listen).await
}
