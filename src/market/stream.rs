// =============================================================================
// Market Stream — kline WebSocket per symbol with heartbeat, backoff and
// REST backfill
// =============================================================================
//
// One task per symbol runs a connect/read/reconnect loop:
//
//   * A 5 s heartbeat closes the socket when no message arrived for 20 s and
//     marks the symbol unstable; the circuit breaker gates evaluations while
//     instability persists.
//   * Reconnect backoff doubles from 500 ms up to 30 s and resets after a
//     connection that delivered data.
//   * After every reconnect the last 20 bars are backfilled over REST and
//     reconciled into the ring by upserting on identical `ts`.
//
// Exactly one `ClosedBar` is delivered per closed bar (the ring dedupes
// backfill overlaps), and each closed bar also publishes a `MarketUpdate`
// event carrying `lag_ms = now - candle_close_ts`.
// =============================================================================

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{Context, Result};
use futures_util::StreamExt;
use parking_lot::RwLock;
use tokio::sync::{mpsc, watch};
use tokio_tungstenite::connect_async;
use tracing::{debug, error, info, warn};

use crate::events::{EngineEvent, EventBus};
use crate::market::candle::{Candle, CandleKey, CandleRing, UpsertOutcome};
use crate::market::rest::{compact_symbol, PublicRestClient};
use crate::types::normalize_symbol;

/// Heartbeat cadence.
const HEARTBEAT_SECS: u64 = 5;
/// Silence beyond this closes the socket and flags instability.
const STALE_MS: i64 = 20_000;
/// Reconnect backoff window.
const BACKOFF_MIN_MS: u64 = 500;
const BACKOFF_MAX_MS: u64 = 30_000;
/// Bars reconciled over REST after every reconnect.
const BACKFILL_BARS: usize = 20;
/// A reconnect within this window still counts as "recent" for instability.
const RECENT_RECONNECT_MS: i64 = 60_000;

/// One closed bar delivered to the scheduler's handler channel.
#[derive(Debug, Clone)]
pub struct ClosedBar {
    pub symbol: String,
    pub candle: Candle,
}

#[derive(Debug, Clone, Copy)]
struct SymbolHealth {
    last_message_ms: i64,
    last_reconnect_ms: Option<i64>,
    reconnects: u64,
}

/// Shared stream state: the candle ring plus per-symbol health.
pub struct MarketStream {
    ring: Arc<CandleRing>,
    rest: PublicRestClient,
    events: EventBus,
    interval: String,
    max_buffer: usize,
    health: RwLock<HashMap<String, SymbolHealth>>,
    ws_base: String,
}

fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// Next reconnect delay: doubles until the cap.
fn next_backoff(current_ms: u64) -> u64 {
    (current_ms * 2).min(BACKOFF_MAX_MS)
}

impl MarketStream {
    pub fn new(interval: &str, max_buffer: usize, events: EventBus, rest: PublicRestClient) -> Self {
        Self {
            ring: Arc::new(CandleRing::new(max_buffer)),
            rest,
            events,
            interval: interval.to_string(),
            max_buffer,
            health: RwLock::new(HashMap::new()),
            ws_base: "wss://stream.binance.com:9443".to_string(),
        }
    }

    pub fn ring(&self) -> Arc<CandleRing> {
        self.ring.clone()
    }

    pub fn key(&self, symbol: &str) -> CandleKey {
        CandleKey {
            symbol: symbol.to_string(),
            interval: self.interval.clone(),
        }
    }

    /// Restartable view of the last <= `max_buffer` closed bars.
    pub fn buffer(&self, symbol: &str) -> Vec<Candle> {
        self.ring.closed(&self.key(symbol), self.max_buffer)
    }

    /// Seed the ring with the last `n` bars over REST.
    pub async fn bootstrap(&self, symbol: &str, n: usize) -> Result<usize> {
        let candles = self
            .rest
            .klines(symbol, &self.interval, n)
            .await
            .with_context(|| format!("bootstrap failed for {symbol}"))?;
        let key = self.key(symbol);
        let mut seeded = 0;
        for candle in candles {
            if self.ring.upsert(key.clone(), candle) == UpsertOutcome::Closed {
                seeded += 1;
            }
        }
        info!(symbol, bars = seeded, "bootstrap complete");
        self.mark_message(symbol, now_ms());
        Ok(seeded)
    }

    /// True when the symbol saw no message within 20 s or reconnected
    /// recently. Symbols that never subscribed are unstable by definition.
    pub fn is_unstable(&self, symbol: &str) -> bool {
        let now = now_ms();
        let health = self.health.read();
        match health.get(symbol) {
            Some(h) => {
                let silent = now - h.last_message_ms > STALE_MS;
                let recent_reconnect = h
                    .last_reconnect_ms
                    .map(|t| now - t < RECENT_RECONNECT_MS)
                    .unwrap_or(false);
                silent || recent_reconnect
            }
            None => true,
        }
    }

    pub fn reconnect_count(&self, symbol: &str) -> u64 {
        self.health
            .read()
            .get(symbol)
            .map(|h| h.reconnects)
            .unwrap_or(0)
    }

    fn mark_message(&self, symbol: &str, at_ms: i64) {
        let mut health = self.health.write();
        let entry = health.entry(symbol.to_string()).or_insert(SymbolHealth {
            last_message_ms: at_ms,
            last_reconnect_ms: None,
            reconnects: 0,
        });
        entry.last_message_ms = at_ms;
    }

    fn mark_reconnect(&self, symbol: &str, at_ms: i64) {
        let mut health = self.health.write();
        let entry = health.entry(symbol.to_string()).or_insert(SymbolHealth {
            last_message_ms: at_ms,
            last_reconnect_ms: None,
            reconnects: 0,
        });
        entry.last_reconnect_ms = Some(at_ms);
        entry.reconnects += 1;
    }

    /// Subscribe a symbol: spawns the connect/read/reconnect loop. Closed
    /// bars flow into `handler` (bounded — back-pressure on the scheduler
    /// bounds memory) until `shutdown` flips true.
    pub fn subscribe(
        self: &Arc<Self>,
        symbol: &str,
        handler: mpsc::Sender<ClosedBar>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let stream = self.clone();
        let symbol = symbol.to_string();
        tokio::spawn(async move {
            let mut backoff_ms = BACKOFF_MIN_MS;
            stream.mark_message(&symbol, now_ms());

            loop {
                if *shutdown.borrow() {
                    break;
                }

                let received_data = match stream
                    .run_connection(&symbol, &handler, &mut shutdown)
                    .await
                {
                    Ok(received) => received,
                    Err(e) => {
                        error!(symbol = %symbol, error = %e, "kline stream error");
                        false
                    }
                };

                if *shutdown.borrow() {
                    break;
                }

                stream.mark_reconnect(&symbol, now_ms());
                if received_data {
                    backoff_ms = BACKOFF_MIN_MS;
                } else {
                    backoff_ms = next_backoff(backoff_ms);
                }
                warn!(
                    symbol = %symbol,
                    backoff_ms,
                    "stream disconnected, reconnecting after backoff"
                );
                tokio::time::sleep(tokio::time::Duration::from_millis(backoff_ms)).await;

                // Reconcile bars missed while disconnected.
                if let Err(e) = stream.backfill(&symbol).await {
                    warn!(symbol = %symbol, error = %e, "backfill failed, continuing with in-memory buffer");
                }
            }
            info!(symbol = %symbol, "stream task stopped");
        });
    }

    /// One WebSocket connection lifetime. Returns whether any kline message
    /// was received (drives the backoff reset).
    async fn run_connection(
        &self,
        symbol: &str,
        handler: &mpsc::Sender<ClosedBar>,
        shutdown: &mut watch::Receiver<bool>,
    ) -> Result<bool> {
        let url = format!(
            "{}/ws/{}@kline_{}",
            self.ws_base,
            compact_symbol(symbol).to_lowercase(),
            self.interval
        );
        debug!(symbol, url = %url, "connecting kline WebSocket");

        let (ws_stream, _resp) = connect_async(&url)
            .await
            .context("failed to connect kline WebSocket")?;
        info!(symbol, "kline WebSocket connected");
        self.mark_message(symbol, now_ms());

        let (_write, mut read) = ws_stream.split();
        let mut heartbeat =
            tokio::time::interval(tokio::time::Duration::from_secs(HEARTBEAT_SECS));
        let mut received_any = false;

        loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        return Ok(received_any);
                    }
                }
                _ = heartbeat.tick() => {
                    let last = self
                        .health
                        .read()
                        .get(symbol)
                        .map(|h| h.last_message_ms)
                        .unwrap_or(0);
                    if now_ms() - last > STALE_MS {
                        warn!(symbol, "no stream message for 20s, closing socket");
                        return Ok(received_any);
                    }
                }
                msg = read.next() => {
                    match msg {
                        Some(Ok(tokio_tungstenite::tungstenite::Message::Text(text))) => {
                            self.mark_message(symbol, now_ms());
                            received_any = true;
                            match parse_kline_message(&text) {
                                Ok((sym, candle)) => {
                                    self.ingest(&sym, candle, handler).await;
                                }
                                Err(e) => {
                                    warn!(symbol, error = %e, "failed to parse kline message");
                                }
                            }
                        }
                        Some(Ok(_)) => {
                            // Ping/Pong/Binary frames keep the heartbeat alive.
                            self.mark_message(symbol, now_ms());
                        }
                        Some(Err(e)) => {
                            return Err(e).context("kline WebSocket read error");
                        }
                        None => {
                            warn!(symbol, "kline WebSocket stream ended");
                            return Ok(received_any);
                        }
                    }
                }
            }
        }
    }

    /// Feed one candle into the ring as if it arrived on the wire; fan out
    /// closed bars. Public so replay harnesses can drive the stream without
    /// a socket.
    pub async fn ingest(&self, symbol: &str, candle: Candle, handler: &mpsc::Sender<ClosedBar>) {
        self.mark_message(symbol, now_ms());
        let key = self.key(symbol);
        let close_ts = candle.close_ts;
        let close = candle.close;
        let outcome = self.ring.upsert(key, candle.clone());
        if outcome == UpsertOutcome::Closed {
            let lag_ms = now_ms() - close_ts;
            self.events.publish(EngineEvent::MarketUpdate {
                symbol: symbol.to_string(),
                lag_ms,
                candle_close_ts: close_ts,
                close,
            });
            if handler
                .send(ClosedBar {
                    symbol: symbol.to_string(),
                    candle,
                })
                .await
                .is_err()
            {
                debug!(symbol, "closed-bar handler channel dropped");
            }
        }
    }

    /// Reconcile the last `BACKFILL_BARS` bars over REST, upserting on `ts`.
    async fn backfill(&self, symbol: &str) -> Result<usize> {
        let candles = self
            .rest
            .klines(symbol, &self.interval, BACKFILL_BARS)
            .await?;
        let key = self.key(symbol);
        let mut reconciled = 0;
        for candle in candles {
            if candle.is_closed && self.ring.upsert(key.clone(), candle) == UpsertOutcome::Closed
            {
                reconciled += 1;
            }
        }
        debug!(symbol, bars = reconciled, "backfill reconciled");
        Ok(reconciled)
    }
}

/// Parse a kline WebSocket payload. Accepts both the combined-stream
/// envelope (`{"stream": ..., "data": {...}}`) and the direct single-stream
/// payload.
pub fn parse_kline_message(text: &str) -> Result<(String, Candle)> {
    let root: serde_json::Value =
        serde_json::from_str(text).context("failed to parse kline JSON")?;
    let data = if root.get("data").is_some() {
        &root["data"]
    } else {
        &root
    };

    let symbol = normalize_symbol(data["s"].as_str().context("missing field s")?);
    let k = &data["k"];

    let ts = k["t"].as_i64().context("missing field k.t")?;
    let close_ts = k["T"].as_i64().context("missing field k.T")?;

    let candle = Candle {
        ts,
        close_ts,
        open: wire_f64(&k["o"], "k.o")?,
        high: wire_f64(&k["h"], "k.h")?,
        low: wire_f64(&k["l"], "k.l")?,
        close: wire_f64(&k["c"], "k.c")?,
        volume: wire_f64(&k["v"], "k.v")?,
        is_closed: k["x"].as_bool().context("missing field k.x")?,
    };

    Ok((symbol, candle))
}

/// Kline payloads carry numbers as JSON strings.
fn wire_f64(val: &serde_json::Value, name: &str) -> Result<f64> {
    match val {
        serde_json::Value::String(s) => s
            .parse::<f64>()
            .with_context(|| format!("failed to parse {name} as f64: {s}")),
        serde_json::Value::Number(n) => n
            .as_f64()
            .with_context(|| format!("field {name} is not a valid f64")),
        _ => anyhow::bail!("field {name} has unexpected JSON type"),
    }
}
