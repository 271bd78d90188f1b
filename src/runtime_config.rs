// =============================================================================
// Runtime Configuration - relay settings with env overrides
// =============================================================================
//
// Loaded from `runtime_config.json` at startup, then overridden by `RELAY_*`
// environment variables (a `.env` file is honoured). All fields carry a serde
// default so that adding new fields never breaks loading an older file.
//
// The file is read-only to the relay. Overrides live in memory for the life
// of the process and are never written back.
// =============================================================================

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::market_data::Timeframe;

// =============================================================================
// Default-value helpers (required by serde `default = "..."` attribute)
// =============================================================================

fn default_symbols() -> Vec<String> {
    vec!["BTCUSDT".to_string(), "ETHUSDT".to_string()]
}

fn default_timeframe() -> String {
    "1m".to_string()
}

fn default_capacity() -> usize {
    1440
}

fn default_broadcast_interval_ms() -> u64 {
    100
}

fn default_history_days() -> u32 {
    1
}

fn default_subscriber_buffer() -> usize {
    64
}

fn default_send_timeout_ms() -> u64 {
    2000
}

fn default_snapshot_limit() -> usize {
    1000
}

fn default_true() -> bool {
    true
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("data")
}

fn default_initial_balance() -> f64 {
    10_000.0
}

fn default_bind_addr() -> String {
    "0.0.0.0:3001".to_string()
}

// =============================================================================
// RuntimeConfig
// =============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuntimeConfig {
    // --- Market data ---------------------------------------------------------

    /// Symbols to aggregate. Fixed for the lifetime of the process.
    #[serde(default = "default_symbols")]
    pub symbols: Vec<String>,

    /// Candle timeframe label: "1m", "5m", "15m" or "1h".
    #[serde(default = "default_timeframe")]
    pub timeframe: String,

    /// Buckets retained per symbol.
    #[serde(default = "default_capacity")]
    pub capacity: usize,

    /// Days of history to backfill per symbol at startup.
    #[serde(default = "default_history_days")]
    pub history_days: u32,

    // --- Broadcast -----------------------------------------------------------

    #[serde(default = "default_broadcast_interval_ms")]
    pub broadcast_interval_ms: u64,

    /// Per-connection outbound queue depth. A subscriber whose queue is full
    /// at fan-out time is dropped.
    #[serde(default = "default_subscriber_buffer")]
    pub subscriber_buffer: usize,

    /// Per-socket write timeout.
    #[serde(default = "default_send_timeout_ms")]
    pub send_timeout_ms: u64,

    /// Max candles per symbol in the snapshot sent on connect.
    #[serde(default = "default_snapshot_limit")]
    pub snapshot_limit: usize,

    // --- Persistence ---------------------------------------------------------

    #[serde(default = "default_true")]
    pub persist_closed_candles: bool,

    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,

    // --- Paper ledger / server -----------------------------------------------

    #[serde(default = "default_initial_balance")]
    pub initial_balance: f64,

    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            symbols: default_symbols(),
            timeframe: default_timeframe(),
            capacity: default_capacity(),
            history_days: default_history_days(),
            broadcast_interval_ms: default_broadcast_interval_ms(),
            subscriber_buffer: default_subscriber_buffer(),
            send_timeout_ms: default_send_timeout_ms(),
            snapshot_limit: default_snapshot_limit(),
            persist_closed_candles: true,
            data_dir: default_data_dir(),
            initial_balance: default_initial_balance(),
            bind_addr: default_bind_addr(),
        }
    }
}

impl RuntimeConfig {
    /// Load configuration from a JSON file at `path`.
    ///
    /// If the file does not exist, returns an error so the caller can fall
    /// back to defaults with a warning.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read runtime config from {}", path.display()))?;

        let config: Self = serde_json::from_str(&content)
            .with_context(|| format!("failed to parse runtime config from {}", path.display()))?;

        info!(
            path = %path.display(),
            symbols = ?config.symbols,
            timeframe = %config.timeframe,
            "runtime config loaded"
        );

        Ok(config)
    }

    /// Startup resolution: the file at `path` (defaults if it is missing or
    /// unparseable), then overrides from `lookup`, then symbol normalisation.
    pub fn resolve<F>(path: impl AsRef<Path>, lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::load(path).unwrap_or_else(|e| {
            warn!(error = %e, "Failed to load config, using defaults");
            Self::default()
        });
        config.apply_overrides(lookup);
        config.symbols = config
            .symbols
            .iter()
            .map(|s| s.trim().to_uppercase())
            .filter(|s| !s.is_empty())
            .collect();
        config
    }

    /// Apply overrides from any key lookup. Unparseable values are ignored
    /// with a warning.
    pub fn apply_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(raw) = lookup("RELAY_SYMBOLS") {
            let symbols: Vec<String> = raw
                .split(',')
                .map(|s| s.trim().to_uppercase())
                .filter(|s| !s.is_empty())
                .collect();
            if symbols.is_empty() {
                warn!("RELAY_SYMBOLS is empty, keeping configured symbols");
            } else {
                self.symbols = symbols;
            }
        }

        if let Some(tf) = lookup("RELAY_TIMEFRAME") {
            self.timeframe = tf.trim().to_string();
        }

        if let Some(addr) = lookup("RELAY_BIND_ADDR") {
            self.bind_addr = addr.trim().to_string();
        }

        override_parsed(&lookup, "RELAY_CAPACITY", &mut self.capacity);
        override_parsed(&lookup, "RELAY_BROADCAST_INTERVAL_MS", &mut self.broadcast_interval_ms);
        override_parsed(&lookup, "RELAY_HISTORY_DAYS", &mut self.history_days);
    }

    /// Check the settings the relay cannot run without, resolving the
    /// timeframe label.
    pub fn validate(&self) -> Result<Timeframe> {
        let timeframe = Timeframe::from_label(&self.timeframe)
            .with_context(|| format!("invalid timeframe '{}'", self.timeframe))?;

        if self.symbols.is_empty() {
            anyhow::bail!("no symbols configured");
        }
        if self.capacity == 0 {
            anyhow::bail!("capacity must be at least 1");
        }
        if self.broadcast_interval_ms == 0 {
            anyhow::bail!("broadcast_interval_ms must be at least 1");
        }
        if self.subscriber_buffer == 0 {
            anyhow::bail!("subscriber_buffer must be at least 1");
        }

        Ok(timeframe)
    }

    pub fn broadcast_interval(&self) -> Duration {
        Duration::from_millis(self.broadcast_interval_ms)
    }

    pub fn send_timeout(&self) -> Duration {
        Duration::from_millis(self.send_timeout_ms)
    }
}

fn override_parsed<F, T>(lookup: &F, key: &str, target: &mut T)
where
    F: Fn(&str) -> Option<String>,
    T: std::str::FromStr,
{
    let Some(raw) = lookup(key) else {
        return;
    };
    match raw.trim().parse::<T>() {
        Ok(value) => *target = value,
        Err(_) => warn!(key, value = %raw, "ignoring unparseable override"),
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn default_config_has_expected_values() {
        let cfg = RuntimeConfig::default();
        assert_eq!(cfg.symbols, vec!["BTCUSDT", "ETHUSDT"]);
        assert_eq!(cfg.timeframe, "1m");
        assert_eq!(cfg.broadcast_interval_ms, 100);
        assert_eq!(cfg.history_days, 1);
        assert_eq!(cfg.subscriber_buffer, 64);
        assert_eq!(cfg.snapshot_limit, 1000);
        assert!((cfg.initial_balance - 10_000.0).abs() < f64::EPSILON);
        assert_eq!(cfg.validate().unwrap(), Timeframe::M1);
    }

    #[test]
    fn deserialise_partial_json_fills_defaults() {
        let json = r#"{ "symbols": ["SOLUSDT"], "timeframe": "5m" }"#;
        let cfg: RuntimeConfig = serde_json::from_str(json).unwrap();
        assert_eq!(cfg.symbols, vec!["SOLUSDT"]);
        assert_eq!(cfg.validate().unwrap(), Timeframe::M5);
        assert_eq!(cfg.capacity, 1440);
        assert!(cfg.persist_closed_candles);
    }

    #[test]
    fn env_overrides_replace_fields() {
        let mut cfg = RuntimeConfig::default();
        cfg.apply_overrides(env(&[
            ("RELAY_SYMBOLS", "bnbusdt, xrpusdt ,"),
            ("RELAY_TIMEFRAME", "1h"),
            ("RELAY_CAPACITY", "50"),
            ("RELAY_BROADCAST_INTERVAL_MS", "250"),
            ("RELAY_BIND_ADDR", "127.0.0.1:9000"),
        ]));
        assert_eq!(cfg.symbols, vec!["BNBUSDT", "XRPUSDT"]);
        assert_eq!(cfg.timeframe, "1h");
        assert_eq!(cfg.capacity, 50);
        assert_eq!(cfg.broadcast_interval(), Duration::from_millis(250));
        assert_eq!(cfg.bind_addr, "127.0.0.1:9000");
    }

    #[test]
    fn garbage_overrides_are_ignored() {
        let mut cfg = RuntimeConfig::default();
        cfg.apply_overrides(env(&[("RELAY_CAPACITY", "lots"), ("RELAY_SYMBOLS", " , ")]));
        assert_eq!(cfg.capacity, 1440);
        assert_eq!(cfg.symbols, default_symbols());
    }

    #[test]
    fn validate_rejects_unusable_settings() {
        let mut cfg = RuntimeConfig {
            timeframe: "2m".into(),
            ..RuntimeConfig::default()
        };
        assert!(cfg.validate().is_err());

        cfg.timeframe = "1m".into();
        cfg.capacity = 0;
        assert!(cfg.validate().is_err());

        cfg.capacity = 10;
        cfg.broadcast_interval_ms = 0;
        assert!(cfg.validate().is_err());

        cfg.broadcast_interval_ms = 100;
        cfg.symbols.clear();
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn resolve_reads_file_then_applies_overrides() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("runtime_config.json");
        std::fs::write(&path, r#"{ "symbols": [" solusdt "], "capacity": 500 }"#).unwrap();

        let cfg = RuntimeConfig::resolve(&path, env(&[("RELAY_HISTORY_DAYS", "0")]));
        assert_eq!(cfg.symbols, vec!["SOLUSDT"]);
        assert_eq!(cfg.capacity, 500);
        assert_eq!(cfg.history_days, 0);
    }

    #[test]
    fn resolve_never_rewrites_the_config_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("runtime_config.json");
        let malformed = r#"{"symbols":["SOLUSDT"],"capacity":500,}"#;
        std::fs::write(&path, malformed).unwrap();

        let cfg = RuntimeConfig::resolve(&path, env(&[("RELAY_BIND_ADDR", "127.0.0.1:1")]));
        assert_eq!(cfg.symbols, default_symbols());
        assert_eq!(cfg.bind_addr, "127.0.0.1:1");

        assert_eq!(std::fs::read_to_string(&path).unwrap(), malformed);
        assert!(!path.with_extension("json.tmp").exists());
    }

    #[test]
    fn missing_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        assert!(RuntimeConfig::load(dir.path().join("nope.json")).is_err());
    }
}
