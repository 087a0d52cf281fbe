// =============================================================================
// Meridian Intraday Engine — Main Entry Point
// =============================================================================
//
// Boot order matters: offload pool and store come up first, the broker
// session and market feed next, then the control API. The engine itself
// stays idle until POST /api/v1/engine/start supplies a configuration.
// =============================================================================

// ── Module declarations ──────────────────────────────────────────────────────
mod api;
mod broker;
mod clock;
mod config;
mod context;
mod core;
mod data;
mod engine;
mod error;
mod execution;
mod risk;
mod settings;
mod store;
mod strategy;
mod types;

use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use crate::engine::Engine;
use crate::settings::Settings;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // ── 1. Environment & logging ─────────────────────────────────────────
    let _ = dotenv::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let settings = Settings::from_env()?;
    info!(
        mode = if settings.paper_trading { "PAPER" } else { "LIVE" },
        square_off = %settings.square_off_time,
        "Meridian engine starting"
    );

    if !clock::is_trading_day(clock::now_exchange()) {
        warn!("today is not a trading day; the engine will accept config but see no feed");
    }

    // ── 2. Boot the engine (idle) ────────────────────────────────────────
    let bind_addr = settings.bind_addr.clone();
    let engine = Engine::boot(settings).await?;

    // ── 3. Control API ───────────────────────────────────────────────────
    let app = api::rest::router(engine.clone());
    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;
    info!(addr = %bind_addr, "control API listening");

    let api_engine = engine.clone();
    tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app).await {
            error!(error = %e, "control API failed");
            api_engine.stop();
        }
    });

    info!("engine idle — POST /api/v1/engine/start to begin trading");

    // ── 4. Graceful shutdown ─────────────────────────────────────────────
    tokio::signal::ctrl_c().await?;
    warn!("shutdown signal received");

    // Bounded shutdown: a hung broker call must not wedge the process.
    match tokio::time::timeout(std::time::Duration::from_secs(10), engine.shutdown()).await {
        Ok(()) => info!("shutdown complete"),
        Err(_) => error!("graceful shutdown timed out after 10s, aborting"),
    }
    Ok(())
}
