// =============================================================================
// Candle Persistence - CSV archive of closed candles
// =============================================================================
//
// The aggregator calls the close hook on the ingesting task, so the hook only
// enqueues. A dedicated blocking thread owns the files and appends one row
// per closed candle to `<data_dir>/<SYMBOL>_<timeframe>.csv`.
//
// The same files double as a fallback seed when the REST backfill fails.
// =============================================================================

use std::fs::OpenOptions;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::market_data::{Candle, CandleCloseHook, Timeframe};
use crate::types::{CandleClose, SeedCandle};

/// Close hook that hands candles to the CSV writer thread.
pub struct CsvCandleWriter {
    tx: mpsc::UnboundedSender<CandleClose>,
}

impl CsvCandleWriter {
    /// Start the writer thread. It exits once every `CsvCandleWriter` handle
    /// has been dropped and the queue is drained.
    pub fn spawn(data_dir: impl Into<PathBuf>, timeframe: Timeframe) -> (Self, JoinHandle<()>) {
        let data_dir = data_dir.into();
        let (tx, mut rx) = mpsc::unbounded_channel::<CandleClose>();

        let handle = tokio::task::spawn_blocking(move || {
            info!(dir = %data_dir.display(), "candle writer started");
            while let Some(event) = rx.blocking_recv() {
                if let Err(e) = append_closed(&data_dir, timeframe, &event) {
                    error!(symbol = %event.symbol, error = %e, "failed to persist closed candle");
                }
            }
            info!("candle writer stopped");
        });

        (Self { tx }, handle)
    }
}

impl CandleCloseHook for CsvCandleWriter {
    fn on_candle_close(&self, event: &CandleClose) {
        if self.tx.send(event.clone()).is_err() {
            warn!(symbol = %event.symbol, "candle writer gone, closed candle not persisted");
        }
    }
}

pub fn csv_path(data_dir: &Path, symbol: &str, timeframe: Timeframe) -> PathBuf {
    data_dir.join(format!("{}_{}.csv", symbol, timeframe.label()))
}

/// Append one closed candle, writing the header if the file is new.
pub fn append_closed(data_dir: &Path, timeframe: Timeframe, event: &CandleClose) -> Result<()> {
    std::fs::create_dir_all(data_dir)
        .with_context(|| format!("failed to create {}", data_dir.display()))?;

    let path = csv_path(data_dir, &event.symbol, timeframe);
    let is_new = std::fs::metadata(&path).map(|m| m.len() == 0).unwrap_or(true);

    let file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(&path)
        .with_context(|| format!("failed to open {}", path.display()))?;

    let mut writer = csv::WriterBuilder::new()
        .has_headers(is_new)
        .from_writer(file);
    writer
        .serialize(event.final_candle)
        .context("failed to encode candle row")?;
    writer.flush().context("failed to flush candle row")?;

    debug!(symbol = %event.symbol, bucket = event.closed_bucket_start, "closed candle persisted");
    Ok(())
}

/// Read a symbol's archived candles back as seed input.
pub fn load_persisted(data_dir: &Path, symbol: &str, timeframe: Timeframe) -> Result<Vec<SeedCandle>> {
    let path = csv_path(data_dir, symbol, timeframe);
    let mut reader = csv::Reader::from_path(&path)
        .with_context(|| format!("failed to open {}", path.display()))?;

    let mut seeds = Vec::new();
    for row in reader.deserialize::<Candle>() {
        let c = row.with_context(|| format!("bad row in {}", path.display()))?;
        seeds.push(SeedCandle {
            bucket_start: c.bucket_start,
            open: c.open,
            high: c.high,
            low: c.low,
            close: c.close,
            volume: c.volume,
        });
    }
    Ok(seeds)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn closed(symbol: &str, bucket: i64, close: f64) -> CandleClose {
        let mut final_candle = Candle::opening(bucket, 100.0, 1.0);
        final_candle.close = close;
        final_candle.high = close.max(100.0);
        final_candle.low = close.min(100.0);
        CandleClose {
            symbol: symbol.to_string(),
            closed_bucket_start: bucket,
            final_candle,
        }
    }

    #[test]
    fn appends_rows_under_single_header() {
        let dir = tempfile::tempdir().unwrap();
        append_closed(dir.path(), Timeframe::M1, &closed("BTCUSDT", 0, 101.0)).unwrap();
        append_closed(dir.path(), Timeframe::M1, &closed("BTCUSDT", 60, 99.0)).unwrap();

        let text = std::fs::read_to_string(csv_path(dir.path(), "BTCUSDT", Timeframe::M1)).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 3);
        assert_eq!(lines[0], "bucket_start,open,high,low,close,volume");

        let seeds = load_persisted(dir.path(), "BTCUSDT", Timeframe::M1).unwrap();
        assert_eq!(seeds.len(), 2);
        assert_eq!(seeds[1].bucket_start, 60);
        assert_eq!(seeds[1].close, 99.0);
    }

    #[test]
    fn missing_archive_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        assert!(load_persisted(dir.path(), "ETHUSDT", Timeframe::M5).is_err());
    }

    #[tokio::test]
    async fn hook_events_reach_disk() {
        let dir = tempfile::tempdir().unwrap();
        let (writer, handle) = CsvCandleWriter::spawn(dir.path(), Timeframe::M1);

        writer.on_candle_close(&closed("ETHUSDT", 0, 10.0));
        writer.on_candle_close(&closed("ETHUSDT", 60, 11.0));
        drop(writer);
        handle.await.unwrap();

        let seeds = load_persisted(dir.path(), "ETHUSDT", Timeframe::M1).unwrap();
        assert_eq!(seeds.len(), 2);
    }
}
