// Shared harness for integration tests: an engine wired to a file-backed
// journal in a temp dir, with candles injected straight into the stream.
#![allow(dead_code)]

use std::path::PathBuf;
use std::sync::Arc;

use borealis_engine::config::EngineConfig;
use borealis_engine::engine::Engine;
use borealis_engine::events::EventBus;
use borealis_engine::history::file_store::FileHistoryStore;
use borealis_engine::market::adapter::default_adapters;
use borealis_engine::market::candle::Candle;
use borealis_engine::market::rest::PublicRestClient;
use borealis_engine::market::MarketStream;
use borealis_engine::strategy::StrategyStore;

pub struct Harness {
    pub engine: Arc<Engine>,
    pub dir: PathBuf,
}

impl Drop for Harness {
    fn drop(&mut self) {
        let _ = std::fs::remove_dir_all(&self.dir);
    }
}

pub fn build_engine(symbols: &[&str]) -> Harness {
    let dir = std::env::temp_dir().join(format!("borealis-it-{}", uuid::Uuid::new_v4()));
    let history = Arc::new(FileHistoryStore::open(&dir).expect("journal dir"));

    let config = EngineConfig {
        symbols: symbols.iter().map(|s| s.to_string()).collect(),
        data_dir: dir.to_string_lossy().to_string(),
        ..EngineConfig::default()
    };

    let events = EventBus::new();
    let stream = Arc::new(MarketStream::new(
        &config.timeframe,
        500,
        events.clone(),
        // Unroutable base URL: integration tests never touch the network.
        PublicRestClient::with_base_url("http://127.0.0.1:1"),
    ));

    let engine = Arc::new(Engine::new(
        config,
        StrategyStore::ephemeral(),
        history,
        stream,
        events,
        default_adapters(),
    ));
    Harness { engine, dir }
}

/// A closed bar `minutes_ago` minutes in the past (never stale for the
/// default 2 h threshold when small).
pub fn bar(minutes_ago: i64, close: f64) -> Candle {
    let now = chrono::Utc::now().timestamp_millis();
    let ts = now - minutes_ago * 60_000;
    Candle {
        ts,
        close_ts: ts + 59_999,
        open: close - 5.0,
        high: close + 20.0,
        low: close - 20.0,
        close,
        volume: 100.0,
        is_closed: true,
    }
}

/// Push one closed bar through the stream and the engine's indicators, the
/// same path the scheduler's symbol task takes.
pub async fn feed_bar(harness: &Harness, symbol: &str, candle: Candle) {
    let (tx, mut rx) = tokio::sync::mpsc::channel(4);
    harness
        .engine
        .stream
        .ingest(symbol, candle.clone(), &tx)
        .await;
    let _ = rx.try_recv();
    harness.engine.ingest_closed_bar(symbol, &candle);
}

/// Feed `n` bars of the S1 synthetic series: close = base + step * i.
pub async fn feed_series(harness: &Harness, symbol: &str, n: i64, base: f64, step: f64) {
    for i in 0..n {
        let minutes_ago = n - i;
        feed_bar(harness, symbol, bar(minutes_ago, base + step * i as f64)).await;
    }
}
