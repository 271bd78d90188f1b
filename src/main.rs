// =============================================================================
// Candle Relay - Main Entry Point
// =============================================================================
//
// Startup order per symbol: backfill history, then open the live trade
// stream, so live ticks never race a history load. The broadcast loop and
// the API server run alongside; Ctrl+C flips the shared shutdown flag and
// every task winds down. The config file is only ever read.
// =============================================================================

// ── Module declarations ──────────────────────────────────────────────────────
mod api;
mod app_state;
mod binance;
mod error;
mod market_data;
mod paper;
mod persistence;
mod runtime_config;
mod types;

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use crate::app_state::AppState;
use crate::binance::BinanceClient;
use crate::market_data::{Aggregator, BroadcastScheduler, CandleCloseHook};
use crate::persistence::CsvCandleWriter;
use crate::runtime_config::RuntimeConfig;

const CONFIG_PATH: &str = "runtime_config.json";
const RECONNECT_DELAY: Duration = Duration::from_secs(5);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // ── 1. Environment & config ──────────────────────────────────────────
    let _ = dotenv::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    info!("Candle Relay starting up");

    let config = RuntimeConfig::resolve(CONFIG_PATH, |key| std::env::var(key).ok());

    // Unsupported timeframe or unusable sizing: refuse to start.
    let timeframe = config.validate().context("invalid runtime configuration")?;

    info!(
        symbols = ?config.symbols,
        timeframe = %timeframe,
        capacity = config.capacity,
        broadcast_interval_ms = config.broadcast_interval_ms,
        "Configured relay"
    );

    // ── 2. Aggregator & persistence hook ─────────────────────────────────
    let mut aggregator = Aggregator::new(timeframe, &config.symbols, config.capacity);
    if config.persist_closed_candles {
        let (writer, _writer_task) = CsvCandleWriter::spawn(config.data_dir.clone(), timeframe);
        let hook: Arc<dyn CandleCloseHook> = Arc::new(writer);
        aggregator = aggregator.with_close_hook(hook);
    }
    let aggregator = Arc::new(aggregator);

    // ── 3. Build shared state ────────────────────────────────────────────
    let bind_addr = config.bind_addr.clone();
    let broadcast_interval = config.broadcast_interval();
    let history_days = config.history_days;
    let persist = config.persist_closed_candles.then(|| config.data_dir.clone());
    let state = Arc::new(AppState::new(config, timeframe, aggregator.clone()));

    // ── 4. History backfill, then live trade stream, per symbol ──────────
    let binance_client = BinanceClient::new()?;

    for symbol in aggregator.symbols() {
        let agg = aggregator.clone();
        let task_state = state.clone();
        let client = binance_client.clone();
        let data_dir = persist.clone();
        let mut shutdown = state.shutdown_signal();

        tokio::spawn(async move {
            seed_symbol(&task_state, &client, &symbol, history_days, data_dir.as_deref()).await;

            loop {
                tokio::select! {
                    result = market_data::trade_stream::run_trade_stream(&symbol, &agg) => {
                        if let Err(e) = result {
                            error!(symbol = %symbol, error = %e, "Trade stream error - reconnecting in 5s");
                        }
                    }
                    _ = shutdown.changed() => break,
                }

                if !sleep_unless_shutdown(RECONNECT_DELAY, &mut shutdown).await {
                    break;
                }
            }
            info!(symbol = %symbol, "trade stream task stopped");
        });
    }

    // ── 5. Broadcast loop ────────────────────────────────────────────────
    let scheduler = BroadcastScheduler::new(
        aggregator.clone(),
        state.registry.clone(),
        broadcast_interval,
    );
    let broadcast_task = tokio::spawn(scheduler.run(state.shutdown_signal()));

    // ── 6. API server ────────────────────────────────────────────────────
    let app = api::rest::router(state.clone());
    let listener = tokio::net::TcpListener::bind(&bind_addr)
        .await
        .with_context(|| format!("failed to bind API server on {bind_addr}"))?;
    info!(addr = %bind_addr, "API server listening");

    let mut server_shutdown = state.shutdown_signal();
    let server_task = tokio::spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                let _ = server_shutdown.wait_for(|stopping| *stopping).await;
            })
            .await
    });

    info!("All subsystems running. Press Ctrl+C to stop.");

    // ── 7. Graceful shutdown ─────────────────────────────────────────────
    tokio::signal::ctrl_c().await?;
    warn!("Shutdown signal received - stopping gracefully");

    state.begin_shutdown();

    if let Err(e) = broadcast_task.await {
        error!(error = %e, "broadcast task panicked");
    }
    match server_task.await {
        Ok(Err(e)) => error!(error = %e, "API server failed"),
        Err(e) => error!(error = %e, "API server task panicked"),
        Ok(Ok(())) => {}
    }

    info!("Candle Relay shut down complete.");
    Ok(())
}

/// Load history for one symbol from Binance, falling back to the local CSV
/// archive. Failures are logged; the symbol then starts from live ticks only.
///
/// The API server is already accepting connections, so the seeded history is
/// re-sent as a snapshot to anyone who connected during the backfill.
async fn seed_symbol(
    state: &AppState,
    client: &BinanceClient,
    symbol: &str,
    history_days: u32,
    archive: Option<&std::path::Path>,
) {
    if history_days == 0 {
        return;
    }
    let timeframe = state.timeframe;

    let seeds = match client.fetch_recent(symbol, timeframe, history_days).await {
        Ok(seeds) => seeds,
        Err(e) => {
            warn!(symbol, error = %e, "history backfill failed");
            let Some(dir) = archive else {
                return;
            };
            match persistence::load_persisted(dir, symbol, timeframe) {
                Ok(seeds) => {
                    info!(symbol, count = seeds.len(), "seeding from local candle archive");
                    seeds
                }
                Err(e) => {
                    warn!(symbol, error = %e, "no usable local candle archive");
                    return;
                }
            }
        }
    };

    if let Err(e) = state.aggregator.seed_history(symbol, &seeds) {
        error!(symbol, error = %e, "history seeding rejected");
        return;
    }

    match market_data::publish_snapshot(
        &state.aggregator,
        &state.registry,
        symbol,
        state.snapshot_limit(),
    ) {
        Ok(report) if report.delivered > 0 || report.pruned > 0 => info!(
            symbol,
            delivered = report.delivered,
            pruned = report.pruned,
            "seeded history pushed to early subscribers"
        ),
        Ok(_) => {}
        Err(e) => warn!(symbol, error = %e, "failed to publish seeded snapshot"),
    }
}

/// Sleep for `delay`; returns `false` if shutdown began first.
async fn sleep_unless_shutdown(delay: Duration, shutdown: &mut watch::Receiver<bool>) -> bool {
    if *shutdown.borrow() {
        return false;
    }
    tokio::select! {
        _ = tokio::time::sleep(delay) => true,
        changed = shutdown.changed() => changed.is_ok() && !*shutdown.borrow(),
    }
}
