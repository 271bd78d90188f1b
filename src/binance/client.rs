// =============================================================================
// Binance REST Client - public klines for history backfill
// =============================================================================
//
// Only unauthenticated market-data endpoints are used, so no key or request
// signing is involved. History is fetched page by page from
// `/api/v3/klines`, advancing `startTime` past the last returned open time
// until the requested window is covered.
// =============================================================================

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tracing::{debug, info, instrument, warn};

use crate::binance::rate_limit::RateLimitTracker;
use crate::market_data::Timeframe;
use crate::types::SeedCandle;

/// Binance spot REST base.
pub const BINANCE_REST_BASE: &str = "https://api.binance.com";

/// Maximum klines Binance returns per request.
const KLINES_PAGE_LIMIT: usize = 1000;

/// Binance public REST client.
#[derive(Clone)]
pub struct BinanceClient {
    base_url: String,
    page_limit: usize,
    client: reqwest::Client,
    rate_limit: Arc<RateLimitTracker>,
}

impl BinanceClient {
    // -------------------------------------------------------------------------
    // Construction
    // -------------------------------------------------------------------------

    pub fn new() -> Result<Self> {
        Self::with_base_url(BINANCE_REST_BASE)
    }

    /// Point the client at another host (e.g. a mock server in tests).
    pub fn with_base_url(base_url: impl Into<String>) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .context("failed to build reqwest client")?;

        let base_url = base_url.into();
        debug!(base_url = %base_url, "BinanceClient initialised");

        Ok(Self {
            base_url,
            page_limit: KLINES_PAGE_LIMIT,
            client,
            rate_limit: Arc::new(RateLimitTracker::new()),
        })
    }

    /// Override the per-request kline count (capped at the Binance maximum).
    pub fn with_page_limit(mut self, limit: usize) -> Self {
        self.page_limit = limit.clamp(1, KLINES_PAGE_LIMIT);
        self
    }

    pub fn rate_limit(&self) -> &RateLimitTracker {
        &self.rate_limit
    }

    // -------------------------------------------------------------------------
    // Klines
    // -------------------------------------------------------------------------

    /// Candles for the last `days` days up to now.
    pub async fn fetch_recent(
        &self,
        symbol: &str,
        timeframe: Timeframe,
        days: u32,
    ) -> Result<Vec<SeedCandle>> {
        let end_ms = chrono::Utc::now().timestamp_millis();
        let start_ms = end_ms - i64::from(days) * 86_400_000;
        self.fetch_history(symbol, timeframe, start_ms, end_ms).await
    }

    /// All candles with open time in `[start_ms, end_ms)`, ascending.
    #[instrument(skip(self), name = "binance::fetch_history")]
    pub async fn fetch_history(
        &self,
        symbol: &str,
        timeframe: Timeframe,
        start_ms: i64,
        end_ms: i64,
    ) -> Result<Vec<SeedCandle>> {
        let mut candles = Vec::new();
        let mut cursor = start_ms;

        while cursor < end_ms {
            if let Some(wait) = self.rate_limit.backoff() {
                warn!(
                    used_weight = self.rate_limit.used_weight(),
                    wait_secs = wait.as_secs(),
                    "pausing history fetch for rate limit"
                );
                tokio::time::sleep(wait).await;
            }

            let page = self
                .fetch_klines_page(symbol, timeframe, cursor, end_ms)
                .await?;
            let Some(last) = page.last() else {
                break;
            };

            let next = last.bucket_start * 1000 + timeframe.millis();
            let exhausted = page.len() < self.page_limit;
            candles.extend(page);

            if exhausted || next <= cursor {
                break;
            }
            cursor = next;
        }

        info!(symbol, timeframe = %timeframe, count = candles.len(), "history fetched");
        Ok(candles)
    }

    /// GET /api/v3/klines (public - no signature required).
    ///
    /// Array indices used:
    ///   [0] openTime, [1] open, [2] high, [3] low, [4] close, [5] volume
    async fn fetch_klines_page(
        &self,
        symbol: &str,
        timeframe: Timeframe,
        start_ms: i64,
        end_ms: i64,
    ) -> Result<Vec<SeedCandle>> {
        let url = format!(
            "{}/api/v3/klines?symbol={}&interval={}&startTime={}&endTime={}&limit={}",
            self.base_url,
            symbol,
            timeframe.label(),
            start_ms,
            end_ms - 1,
            self.page_limit
        );

        let resp = self
            .client
            .get(&url)
            .send()
            .await
            .context("GET /api/v3/klines request failed")?;

        self.rate_limit.update_from_headers(resp.headers());

        let status = resp.status();
        let body: serde_json::Value = resp
            .json()
            .await
            .context("failed to parse klines response")?;

        if !status.is_success() {
            anyhow::bail!(
                "Binance GET /api/v3/klines returned {}: {}",
                status,
                body
            );
        }

        let raw = body
            .as_array()
            .context("klines response is not an array")?;

        let mut candles = Vec::with_capacity(raw.len());
        for entry in raw {
            let arr = entry
                .as_array()
                .context("kline entry is not an array")?;

            if arr.len() < 6 {
                warn!("skipping malformed kline entry with {} elements", arr.len());
                continue;
            }

            let open_time = arr[0].as_i64().context("kline open time is not an integer")?;
            candles.push(SeedCandle {
                bucket_start: open_time.div_euclid(1000),
                open: Self::parse_str_f64(&arr[1])?,
                high: Self::parse_str_f64(&arr[2])?,
                low: Self::parse_str_f64(&arr[3])?,
                close: Self::parse_str_f64(&arr[4])?,
                volume: Self::parse_str_f64(&arr[5])?,
            });
        }

        debug!(symbol, start_ms, count = candles.len(), "klines page fetched");
        Ok(candles)
    }

    // -------------------------------------------------------------------------
    // Internal helpers
    // -------------------------------------------------------------------------

    /// Parse a JSON value that may be either a string or a number into `f64`.
    fn parse_str_f64(val: &serde_json::Value) -> Result<f64> {
        if let Some(s) = val.as_str() {
            s.parse::<f64>()
                .with_context(|| format!("failed to parse '{s}' as f64"))
        } else if let Some(n) = val.as_f64() {
            Ok(n)
        } else {
            anyhow::bail!("expected string or number, got: {val}")
        }
    }
}

impl std::fmt::Debug for BinanceClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BinanceClient")
            .field("base_url", &self.base_url)
            .field("page_limit", &self.page_limit)
            .finish()
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use wiremock::matchers::{method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn kline(open_ms: i64, close: &str) -> serde_json::Value {
        json!([open_ms, "100.0", "110.0", "90.0", close, "5.5", open_ms + 59_999, "0", 10, "0", "0", "0"])
    }

    #[tokio::test]
    async fn paginates_until_short_page() {
        let server = MockServer::start().await;

        Mock::given(method("GET"))
            .and(path("/api/v3/klines"))
            .and(query_param("startTime", "0"))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header("X-MBX-USED-WEIGHT-1M", "4")
                    .set_body_json(json!([kline(0, "101.0"), kline(60_000, "102.0")])),
            )
            .expect(1)
            .mount(&server)
            .await;

        Mock::given(method("GET"))
            .and(path("/api/v3/klines"))
            .and(query_param("startTime", "120000"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!([kline(120_000, "103.0")])))
            .expect(1)
            .mount(&server)
            .await;

        let client = BinanceClient::with_base_url(server.uri())
            .unwrap()
            .with_page_limit(2);
        let candles = client
            .fetch_history("BTCUSDT", Timeframe::M1, 0, 600_000)
            .await
            .unwrap();

        let keys: Vec<i64> = candles.iter().map(|c| c.bucket_start).collect();
        assert_eq!(keys, vec![0, 60, 120]);
        assert_eq!(candles[2].close, 103.0);
        assert_eq!(candles[0].volume, 5.5);
        assert_eq!(client.rate_limit().used_weight(), 4);
    }

    #[tokio::test]
    async fn empty_page_ends_pagination() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/v3/klines"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!([])))
            .mount(&server)
            .await;

        let client = BinanceClient::with_base_url(server.uri()).unwrap();
        let candles = client
            .fetch_history("BTCUSDT", Timeframe::M1, 0, 600_000)
            .await
            .unwrap();
        assert!(candles.is_empty());
    }

    #[tokio::test]
    async fn error_status_is_reported() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/v3/klines"))
            .respond_with(
                ResponseTemplate::new(400).set_body_json(json!({"code": -1121, "msg": "Invalid symbol."})),
            )
            .mount(&server)
            .await;

        let client = BinanceClient::with_base_url(server.uri()).unwrap();
        let err = client
            .fetch_history("NOPE", Timeframe::M1, 0, 600_000)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("400"));
    }

    #[tokio::test]
    async fn short_entries_are_skipped() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/v3/klines"))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(json!([[0, "1"], kline(60_000, "2.0")])),
            )
            .mount(&server)
            .await;

        let client = BinanceClient::with_base_url(server.uri()).unwrap();
        let candles = client
            .fetch_history("BTCUSDT", Timeframe::M1, 0, 600_000)
            .await
            .unwrap();
        assert_eq!(candles.len(), 1);
        assert_eq!(candles[0].bucket_start, 60);
    }
}
