// =============================================================================
// WebSocket Handler - live candle feed
// =============================================================================
//
// Clients connect to `/api/v1/ws` (optionally `?symbol=BTCUSDT`) and receive:
//   1. One `snapshot` message per symbol with the most recent candles.
//   2. A `candle` message per symbol per broadcast cycle in which it changed.
//
// The connection registers a bounded channel sink with the subscriber
// registry before the snapshot is taken, so no update between snapshot and
// feed is lost. Updates already queued when the snapshot is taken can be
// older than it; within that backlog a candle whose volume is below the
// snapshot's volume for the same bucket is skipped. A client that cannot keep
// its queue drained is pruned by the registry; its queue closes and this
// handler sends a Close frame.
//
// The handler also:
//   - Responds to Ping frames with Pong frames.
//   - Bounds every socket write with the configured send timeout.
//   - Unregisters on disconnect.
// =============================================================================

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::{
        ws::{Message, WebSocket},
        Query, State, WebSocketUpgrade,
    },
    response::IntoResponse,
};
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use tracing::{debug, info, warn};

use crate::app_state::AppState;
use crate::market_data::{Candle, ChannelSink, OutboundMessage};

// =============================================================================
// Query parameters
// =============================================================================

#[derive(Deserialize)]
pub struct WsQuery {
    /// Restrict the connect snapshot to one symbol.
    symbol: Option<String>,
}

// =============================================================================
// WebSocket upgrade handler
// =============================================================================

pub async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
    Query(query): Query<WsQuery>,
) -> impl IntoResponse {
    if state.is_shutting_down() {
        return (
            axum::http::StatusCode::SERVICE_UNAVAILABLE,
            "Server is shutting down",
        )
            .into_response();
    }

    let symbol = query.symbol.map(|s| s.trim().to_uppercase());
    if let Some(sym) = &symbol {
        if !state.aggregator.is_tracked(sym) {
            warn!(symbol = %sym, "WebSocket connection rejected: unknown symbol");
            return (axum::http::StatusCode::NOT_FOUND, "Unknown symbol").into_response();
        }
    }

    ws.on_upgrade(move |socket| handle_ws_connection(socket, state, symbol))
        .into_response()
}

// =============================================================================
// Connection handler
// =============================================================================

/// Manages a single WebSocket connection lifecycle.
///
/// Runs two concurrent branches via `tokio::select!`:
///   1. **Feed** - forward payloads queued by the broadcast loop.
///   2. **Recv** - process incoming client frames (Ping, Close, keep-alives).
async fn handle_ws_connection(socket: WebSocket, state: Arc<AppState>, symbol: Option<String>) {
    let (sink, mut queue) = ChannelSink::channel(state.subscriber_buffer());
    let id = state.registry.register(Arc::new(sink));
    let send_timeout = state.send_timeout();
    info!(subscriber = id, symbol = ?symbol, "WebSocket subscriber connected");

    let (mut sender, mut receiver) = socket.split();

    let floor = match send_snapshots(&mut sender, &state, symbol.as_deref(), send_timeout).await {
        Ok(floor) => floor,
        Err(e) => {
            debug!(subscriber = id, error = %e, "initial snapshot failed - disconnecting");
            state.registry.unregister(id);
            return;
        }
    };
    // Everything queued by now may predate the snapshot.
    let mut backlog = queue.len();

    loop {
        tokio::select! {
            // ── Feed: drain the subscriber queue ─────────────────────────
            queued = queue.recv() => {
                let Some(payload) = queued else {
                    // Pruned by the registry or closed on shutdown.
                    debug!(subscriber = id, "subscriber queue closed - sending Close");
                    let _ = send_with_timeout(&mut sender, Message::Close(None), send_timeout).await;
                    break;
                };
                if backlog > 0 {
                    backlog -= 1;
                    if floor.is_stale(&payload) {
                        debug!(subscriber = id, "skipping update older than snapshot");
                        continue;
                    }
                }
                if let Err(e) = send_with_timeout(&mut sender, Message::Text(payload.to_string()), send_timeout).await {
                    debug!(subscriber = id, error = %e, "WebSocket send failed - disconnecting");
                    break;
                }
            }

            // ── Recv: process incoming messages ──────────────────────────
            msg = receiver.next() => {
                match msg {
                    Some(Ok(Message::Text(_))) => {
                        // Keep-alive; clients have nothing to request.
                    }
                    Some(Ok(Message::Ping(data))) => {
                        if let Err(e) = send_with_timeout(&mut sender, Message::Pong(data), send_timeout).await {
                            debug!(subscriber = id, error = %e, "failed to send Pong - disconnecting");
                            break;
                        }
                    }
                    Some(Ok(Message::Pong(_))) | Some(Ok(Message::Binary(_))) => {}
                    Some(Ok(Message::Close(_))) => {
                        debug!(subscriber = id, "WebSocket Close frame received");
                        break;
                    }
                    Some(Err(e)) => {
                        warn!(subscriber = id, error = %e, "WebSocket receive error - disconnecting");
                        break;
                    }
                    None => break,
                }
            }
        }
    }

    state.registry.unregister(id);
    info!(subscriber = id, "WebSocket subscriber disconnected");
}

// =============================================================================
// Helpers
// =============================================================================

/// Per-bucket volume of every candle sent in the connect snapshots.
///
/// Volume only grows while a bucket is live, so a queued update for a bucket
/// the snapshot already carried with more volume is an older state.
#[derive(Debug, Default)]
struct SnapshotFloor {
    volumes: HashMap<String, HashMap<i64, f64>>,
}

impl SnapshotFloor {
    fn record(&mut self, symbol: &str, candles: &[Candle]) {
        self.volumes.insert(
            symbol.to_string(),
            candles.iter().map(|c| (c.bucket_start, c.volume)).collect(),
        );
    }

    fn is_stale(&self, payload: &str) -> bool {
        let Ok(OutboundMessage::Candle { symbol, candle }) = serde_json::from_str(payload) else {
            return false;
        };
        self.volumes
            .get(&symbol)
            .and_then(|buckets| buckets.get(&candle.bucket_start))
            .is_some_and(|&volume| candle.volume < volume)
    }
}

/// Send one snapshot per requested symbol (all tracked symbols by default).
async fn send_snapshots<S>(
    sender: &mut S,
    state: &AppState,
    symbol: Option<&str>,
    send_timeout: Duration,
) -> anyhow::Result<SnapshotFloor>
where
    S: futures_util::Sink<Message, Error = axum::Error> + Unpin,
{
    let symbols = match symbol {
        Some(sym) => vec![sym.to_string()],
        None => state.aggregator.symbols(),
    };
    let limit = state.snapshot_limit();
    let mut floor = SnapshotFloor::default();

    for sym in symbols {
        let candles = state.aggregator.snapshot_tail(&sym, limit)?;
        floor.record(&sym, &candles);
        let payload = OutboundMessage::Snapshot {
            symbol: sym,
            candles,
        }
        .to_payload()?;
        send_with_timeout(sender, Message::Text(payload.to_string()), send_timeout).await?;
    }
    Ok(floor)
}

/// A write that exceeds `limit` counts as a failed write.
async fn send_with_timeout<S>(sender: &mut S, msg: Message, limit: Duration) -> anyhow::Result<()>
where
    S: futures_util::Sink<Message, Error = axum::Error> + Unpin,
{
    match tokio::time::timeout(limit, sender.send(msg)).await {
        Ok(result) => result.map_err(anyhow::Error::from),
        Err(_) => anyhow::bail!("socket write timed out after {} ms", limit.as_millis()),
    }
}

// =============================================================================
// Tests
// =============================================================================
