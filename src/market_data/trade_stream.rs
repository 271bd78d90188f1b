// =============================================================================
// Trade Stream - Binance raw trades normalised into ticks for the aggregator
// =============================================================================

use std::sync::Arc;

use anyhow::{Context, Result};
use futures_util::StreamExt;
use tokio_tungstenite::connect_async;
use tracing::{debug, error, info, warn};

use crate::market_data::aggregator::Aggregator;
use crate::types::TickEvent;

/// Binance spot WebSocket base.
pub const BINANCE_WS_BASE: &str = "wss://stream.binance.com:9443/ws";

/// Connect to the Binance `@trade` WebSocket stream for a single symbol and
/// feed every trade into `aggregator`.
///
/// Runs until the stream disconnects or an error occurs, then returns so that
/// the caller (main.rs) can handle reconnection.
pub async fn run_trade_stream(symbol: &str, aggregator: &Arc<Aggregator>) -> Result<()> {
    let lower = symbol.to_lowercase();
    let url = format!("{BINANCE_WS_BASE}/{lower}@trade");
    info!(url = %url, symbol = %symbol, "connecting to trade WebSocket");

    let (ws_stream, _response) = connect_async(&url)
        .await
        .context("failed to connect to trade WebSocket")?;

    info!(symbol = %symbol, "trade WebSocket connected");
    let (_write, mut read) = ws_stream.split();

    loop {
        match read.next().await {
            Some(Ok(msg)) => {
                if let tokio_tungstenite::tungstenite::Message::Text(text) = msg {
                    match parse_trade(&text) {
                        Ok(tick) => {
                            if let Err(e) = aggregator.ingest_tick(&tick) {
                                debug!(symbol = %tick.symbol, error = %e, "tick rejected");
                            }
                        }
                        Err(e) => {
                            warn!(error = %e, "failed to parse trade message");
                        }
                    }
                }
                // Ping/Pong/Binary/Close are handled by tungstenite or ignored.
            }
            Some(Err(e)) => {
                error!(symbol = %symbol, error = %e, "trade WebSocket read error");
                return Err(e.into());
            }
            None => {
                warn!(symbol = %symbol, "trade WebSocket stream ended");
                return Ok(());
            }
        }
    }
}

/// Parse a Binance trade message.
///
/// Expected shape (single stream, or wrapped in a combined-stream `data`):
/// ```json
/// { "e": "trade", "s": "BTCUSDT", "p": "37000.00", "q": "0.123", "T": 1700000000123 }
/// ```
pub fn parse_trade(text: &str) -> Result<TickEvent> {
    let root: serde_json::Value =
        serde_json::from_str(text).context("failed to parse trade JSON")?;

    let data = if root.get("data").is_some() {
        &root["data"]
    } else {
        &root
    };

    let symbol = data["s"]
        .as_str()
        .context("missing field s")?
        .to_uppercase();

    let price: f64 = data["p"]
        .as_str()
        .context("missing field p")?
        .parse()
        .context("failed to parse price")?;

    let quantity: f64 = data["q"]
        .as_str()
        .context("missing field q")?
        .parse()
        .context("failed to parse quantity")?;

    let event_time_ms = data["T"].as_i64().context("missing field T")?;

    Ok(TickEvent {
        symbol,
        event_time_ms,
        price,
        quantity,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_single_stream_trade() {
        let json = r#"{
            "e": "trade", "E": 1700000000200, "s": "BTCUSDT", "t": 12345,
            "p": "37000.50", "q": "0.125", "T": 1700000000123, "m": true, "M": true
        }"#;
        let tick = parse_trade(json).unwrap();
        assert_eq!(tick.symbol, "BTCUSDT");
        assert_eq!(tick.event_time_ms, 1_700_000_000_123);
        assert!((tick.price - 37000.5).abs() < f64::EPSILON);
        assert!((tick.quantity - 0.125).abs() < f64::EPSILON);
    }

    #[test]
    fn parses_combined_stream_envelope() {
        let json = r#"{"stream":"ethusdt@trade","data":{"s":"ethusdt","p":"2000","q":"1","T":5}}"#;
        let tick = parse_trade(json).unwrap();
        assert_eq!(tick.symbol, "ETHUSDT");
        assert_eq!(tick.event_time_ms, 5);
    }

    #[test]
    fn rejects_malformed_trade() {
        assert!(parse_trade("not json").is_err());
        assert!(parse_trade(r#"{"s":"BTCUSDT","p":"abc","q":"1","T":1}"#).is_err());
        assert!(parse_trade(r#"{"s":"BTCUSDT","p":"1","q":"1"}"#).is_err());
    }
}
