//! Cirrus maintenance daemon.
//!
//! Opens the configured stores, verifies them and runs the reaper, either
//! once or on the configured schedule.

use anyhow::{Context, Result};
use cirrus_core::config::AppConfig;
use cirrus_engine::Engine;
use clap::Parser;
use figment::Figment;
use figment::providers::{Env, Format, Toml};
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Cirrus - chunked, deduplicating file storage
#[derive(Parser, Debug)]
#[command(name = "cirrusd")]
#[command(version, about, long_about = None)]
struct Args {
    /// Path to configuration file
    #[arg(
        short,
        long,
        env = "CIRRUS_CONFIG",
        default_value = "config/cirrus.toml"
    )]
    config: String,

    /// Run a single sweep and exit
    #[arg(long)]
    sweep_once: bool,

    /// Report what a sweep would reclaim without deleting anything
    #[arg(long)]
    dry_run: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,sqlx=warn".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Cirrus v{}", env!("CARGO_PKG_VERSION"));

    // Config file is optional; defaults plus CIRRUS_ env vars are enough
    let mut figment = Figment::new();
    if std::path::Path::new(&args.config).exists() {
        tracing::info!(config_path = %args.config, "Loading configuration from file");
        figment = figment.merge(Toml::file(&args.config));
    } else {
        tracing::debug!("No config file found at {}", args.config);
    }

    let mut config: AppConfig = figment
        .merge(Env::prefixed("CIRRUS_").split("__"))
        .extract()
        .context("failed to load configuration")?;
    if args.dry_run {
        config.gc.dry_run = true;
    }
    config
        .validate()
        .map_err(|e| anyhow::anyhow!(e))
        .context("invalid configuration")?;

    cirrus_engine::metrics::register_metrics();

    let engine = Engine::from_config(&config)
        .await
        .context("failed to initialize storage engine")?;
    engine
        .health_check()
        .await
        .context("storage health check failed")?;

    let stats = engine.chunk_stats().await?;
    tracing::info!(
        chunks = stats.count,
        total_bytes = stats.total_size,
        stored_bytes = stats.stored_size,
        unreferenced = stats.unreferenced_count,
        pending = stats.pending_count,
        "Storage engine ready"
    );

    let reaper = Arc::new(engine.reaper(config.gc.clone()));

    if args.sweep_once {
        let sweep = reaper.run_once().await.context("sweep failed")?;
        println!(
            "sessions_expired={} mapping_sets_retired={} chunks_purged={} bytes_reclaimed={} errors={}",
            sweep.sessions_expired,
            sweep.mapping_sets_retired,
            sweep.chunks_purged,
            sweep.bytes_reclaimed,
            sweep.errors
        );
        return Ok(());
    }

    if !config.gc.auto_schedule_enabled {
        tracing::info!("Automatic sweeps disabled; nothing to do");
        return Ok(());
    }

    let handle = reaper.spawn();
    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for shutdown signal")?;
    tracing::info!("Shutting down");
    handle.abort();

    match cirrus_engine::metrics::render() {
        Ok(text) => tracing::debug!(metrics = %text, "Final metrics"),
        Err(e) => tracing::warn!(error = %e, "Failed to render metrics"),
    }
    Ok(())
}
