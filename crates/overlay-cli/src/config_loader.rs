//! Configuration loading for CLI commands

use crate::cli::Cli;
use anyhow::{Context, Result};
use overlay_core::config::{parse_byte_size, CliConfigOverrides, LayeredConfig};
use overlay_core::models::Geography;
use overlay_engine::{ClippingEngine, ClippingOptions, FragmentStore, WorkerPool};
use overlay_source::SourceCache;
use std::path::{Path, PathBuf};
use std::sync::Arc;

const DEFAULT_CONFIG_FILE: &str = "overlay.toml";

/// Defaults, then the config file, then environment, then flags
pub fn load_config(cli: &Cli) -> Result<LayeredConfig> {
    let mut config = LayeredConfig::with_defaults();

    let path = cli.config.clone().or_else(|| {
        let default = PathBuf::from(DEFAULT_CONFIG_FILE);
        default.exists().then_some(default)
    });
    if let Some(path) = path {
        tracing::debug!(path = %path.display(), "loading configuration file");
        config = config
            .load_from_file(&path)
            .with_context(|| format!("Failed to load configuration from {}", path.display()))?;
    }
    let mut config = config.load_from_env();

    let cache_size = match &cli.cache_size {
        Some(raw) => Some(parse_byte_size(raw).context("Invalid --cache-size")?),
        None => None,
    };
    config.update_from_cli(CliConfigOverrides {
        cache_size,
        worker_threads: cli.workers,
        cover_target: cli.cover_target,
        equal_area: cli.equal_area.then_some(true),
    });

    Ok(config)
}

/// Worker pool, source cache and fragment store sized from configuration
pub fn build_engine(config: &LayeredConfig) -> Result<ClippingEngine> {
    let pool = WorkerPool::new(config.worker_threads.value, config.candidate_channel_capacity.value)
        .context("Failed to start worker pool")?;
    let sources = SourceCache::new(config.cache_size.value);
    Ok(ClippingEngine::new(
        Arc::new(pool),
        sources,
        FragmentStore::new(),
        ClippingOptions::from_config(config),
    ))
}

pub fn load_geography(path: &Path) -> Result<Geography> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read geography {}", path.display()))?;
    let geography: Geography = toml::from_str(&content)
        .with_context(|| format!("Failed to parse geography {}", path.display()))?;
    Ok(geography)
}
