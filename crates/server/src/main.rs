//! Gantry server binary.

use anyhow::{Context, Result};
use clap::Parser;
use figment::Figment;
use figment::providers::{Env, Format, Toml};
use gantry_core::config::AppConfig;
use gantry_server::{AppState, create_router};
use std::net::SocketAddr;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Gantry - a resumable chunked-upload coordinator
#[derive(Parser, Debug)]
#[command(name = "gantryd")]
#[command(version, about, long_about = None)]
struct Args {
    /// Path to configuration file
    #[arg(
        short,
        long,
        env = "GANTRY_CONFIG",
        default_value = "config/server.toml"
    )]
    config: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Parse CLI arguments
    let args = Args::parse();

    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,tower_http=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Gantry v{}", env!("CARGO_PKG_VERSION"));

    // Load configuration (file is optional, env vars can provide/override everything)
    let config_path = std::path::Path::new(&args.config);
    let mut figment = Figment::new();
    if config_path.exists() {
        tracing::info!(config_path = %args.config, "Loading configuration from file");
        figment = figment.merge(Toml::file(&args.config));
    } else {
        tracing::debug!("No config file found at {}, using defaults and environment", args.config);
    }

    let config: AppConfig = figment
        .merge(Env::prefixed("GANTRY_").split("__"))
        .extract()
        .context("failed to load configuration")?;

    // Register Prometheus metrics
    gantry_server::metrics::register_metrics();
    tracing::info!("Prometheus metrics registered");

    // Initialize the blob store
    let store = gantry_store::from_config(&config.storage)
        .await
        .context("failed to initialize blob store")?;
    // Verify storage before accepting requests: catches configuration
    // errors and unreachable volumes early.
    store
        .health_check()
        .await
        .context("blob store health check failed")?;
    tracing::info!("Blob store initialized");

    // Initialize the session registry
    let registry = gantry_registry::from_config(&config.registry)
        .await
        .context("failed to initialize session registry")?;
    registry
        .health_check()
        .await
        .context("session registry health check failed")?;
    tracing::info!("Session registry initialized");

    // Create application state
    let state = AppState::new(config.clone(), store, registry);

    // Spawn rate limiter cleanup task if rate limiting is enabled
    if let Some(cleanup_interval) = state.rate_limit_cleanup_interval() {
        gantry_server::ratelimit::spawn_cleanup_task(state.rate_limit.clone(), cleanup_interval);
        tracing::info!(
            interval_secs = cleanup_interval.as_secs(),
            "Rate limiter cleanup task spawned"
        );
    }

    // Spawn the reaper; its first pass runs immediately and clears work
    // orphaned by a previous process.
    let _reaper_handle = gantry_server::reaper::spawn_reaper(state.clone());
    tracing::info!(
        interval_secs = state.config.reaper.interval_secs,
        stale_threshold_minutes = state.config.reaper.stale_threshold_minutes,
        retention_days = state.config.reaper.retention_days,
        "Reaper spawned"
    );

    // Create router
    let app = create_router(state);

    // Parse bind address
    let addr: SocketAddr = config.server.bind.parse().context("invalid bind address")?;

    tracing::info!("Listening on {}", addr);

    // Start server with ConnectInfo for client IP extraction
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind to {}", addr))?;
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .await?;

    Ok(())
}
