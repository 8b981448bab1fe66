// =============================================================================
// chartfeed — Main Entry Point
// =============================================================================
//
// Headless chart-feed service: one feed per configured symbol, History and
// indicator outputs kept in memory, everything exposed over HTTP/WebSocket.
// =============================================================================

// ── Module declarations ──────────────────────────────────────────────────────
mod api;
mod app_state;
mod binance;
mod chart;
mod config;
mod coordinator;
mod error;
mod feed;
mod indicators;
mod market_data;

use std::sync::Arc;

use anyhow::Context;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use crate::app_state::AppState;
use crate::config::{AppConfig, DEFAULT_CONFIG_PATH};
use crate::market_data::SubscriptionKey;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // ── 1. Environment & config ──────────────────────────────────────────
    let _ = dotenv::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    info!("chartfeed starting up");

    let config_path =
        std::env::var("CHARTFEED_CONFIG").unwrap_or_else(|_| DEFAULT_CONFIG_PATH.to_string());
    let file_config = AppConfig::load_or_default(&config_path);
    let config = file_config.with_env_overrides();

    info!(
        symbols = ?config.symbols,
        interval = %config.interval,
        history_limit = config.history_limit,
        "Configured feeds"
    );

    // ── 2. Build the session ─────────────────────────────────────────────
    let state = Arc::new(AppState::new(config)?);

    // ── 3. Start configured feeds ────────────────────────────────────────
    let (symbols, interval) = {
        let config = state.config.read();
        (config.symbols.clone(), config.interval.clone())
    };

    for symbol in &symbols {
        let key = SubscriptionKey::new(symbol, &interval);
        if !state.feed.validate_symbol(&key.symbol).await {
            warn!(symbol = %key.symbol, "Skipping feed: symbol not listed");
            continue;
        }
        match state.start_chart(&key).await {
            Ok(candles) => info!(key = %key, candles, "Feed running"),
            Err(e) => error!(key = %key, error = %e, "Failed to start feed"),
        }
    }

    info!(count = state.coordinator.running_keys().len(), "Feeds launched");

    // ── 4. Rate-limit window reset (every 60 seconds) ────────────────────
    let rl_state = state.clone();
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(tokio::time::Duration::from_secs(60));
        interval.tick().await;
        loop {
            interval.tick().await;
            rl_state.feed.rest().rate_limit().reset_1m_weight();
        }
    });

    // ── 5. Start the API server ──────────────────────────────────────────
    let bind_addr = state.config.read().bind_addr.clone();
    let listener = tokio::net::TcpListener::bind(&bind_addr)
        .await
        .with_context(|| format!("failed to bind API server on {bind_addr}"))?;
    info!(addr = %bind_addr, "API server listening");

    let app = api::rest::router(state.clone());
    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                error!(error = %e, "Failed to listen for shutdown signal");
            }
        })
        .await
        .context("API server failed")?;

    // ── 6. Graceful shutdown ─────────────────────────────────────────────
    warn!("Shutdown signal received — stopping gracefully");
    state.shutdown();

    // Environment overrides are per-process and never written back.
    if let Err(e) = file_config.save(&config_path) {
        error!(error = %e, "Failed to save config on shutdown");
    }

    info!("chartfeed shut down complete.");
    Ok(())
}
