// =============================================================================
// Public kline REST client — bootstrap and backfill for the market stream
// =============================================================================
//
// Fetches closed bars over the Binance-compatible public klines endpoint.
// Every request carries a hard 12 s timeout; a timeout surfaces as a typed
// error so the caller can mark the symbol unstable rather than hang.
// =============================================================================

use anyhow::{Context, Result};
use tracing::debug;

use crate::market::candle::Candle;

/// Hard cap on a single bootstrap request.
pub const MAX_BOOTSTRAP_BARS: usize = 500;

/// Outbound request timeout, shared across the engine's HTTP clients.
pub const REQUEST_TIMEOUT_SECS: u64 = 12;

/// Public (unsigned) market-data REST client.
#[derive(Clone)]
pub struct PublicRestClient {
    base_url: String,
    client: reqwest::Client,
}

/// `BTC-USDT` -> `BTCUSDT` for the exchange wire format.
pub fn compact_symbol(symbol: &str) -> String {
    symbol.replace('-', "").to_uppercase()
}

impl PublicRestClient {
    pub fn new() -> Self {
        Self::with_base_url("https://api.binance.com")
    }

    /// Custom base URL (tests point this at a local fixture server).
    pub fn with_base_url(base_url: impl Into<String>) -> Self {
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(REQUEST_TIMEOUT_SECS))
            .build()
            .expect("failed to build reqwest client");
        Self {
            base_url: base_url.into(),
            client,
        }
    }

    /// Fetch the last `limit` klines (closed bars plus possibly one open).
    pub async fn klines(&self, symbol: &str, interval: &str, limit: usize) -> Result<Vec<Candle>> {
        let limit = limit.min(MAX_BOOTSTRAP_BARS);
        let url = format!(
            "{}/api/v3/klines?symbol={}&interval={}&limit={}",
            self.base_url,
            compact_symbol(symbol),
            interval,
            limit
        );

        let resp = self
            .client
            .get(&url)
            .send()
            .await
            .with_context(|| format!("klines request failed for {symbol}"))?;

        let status = resp.status();
        let body: serde_json::Value = resp
            .json()
            .await
            .context("failed to parse klines response")?;
        if !status.is_success() {
            anyhow::bail!("klines request for {symbol} returned {status}: {body}");
        }

        let rows = body
            .as_array()
            .context("klines response is not an array")?;
        let candles = parse_kline_rows(rows)?;
        debug!(symbol, interval, count = candles.len(), "klines fetched");
        Ok(candles)
    }
}

impl Default for PublicRestClient {
    fn default() -> Self {
        Self::new()
    }
}

/// Parse the exchange kline array-of-arrays format. The final row may still
/// be open; it is marked `is_closed = false` when its close time is in the
/// future relative to the newest row before it.
pub fn parse_kline_rows(rows: &[serde_json::Value]) -> Result<Vec<Candle>> {
    let now_ms = chrono::Utc::now().timestamp_millis();
    let mut candles = Vec::with_capacity(rows.len());

    for row in rows {
        let cols = row.as_array().context("kline row is not an array")?;
        if cols.len() < 6 {
            anyhow::bail!("kline row has {} columns, expected >= 6", cols.len());
        }
        let ts = cols[0].as_i64().context("kline open time missing")?;
        let close_ts = cols
            .get(6)
            .and_then(|v| v.as_i64())
            .unwrap_or(ts + 59_999);

        let candle = Candle {
            ts,
            close_ts,
            open: string_f64(&cols[1], "open")?,
            high: string_f64(&cols[2], "high")?,
            low: string_f64(&cols[3], "low")?,
            close: string_f64(&cols[4], "close")?,
            volume: string_f64(&cols[5], "volume")?,
            is_closed: close_ts <= now_ms,
        };
        candles.push(candle);
    }
    Ok(candles)
}

/// Exchanges send numeric values as JSON strings inside kline rows.
fn string_f64(val: &serde_json::Value, name: &str) -> Result<f64> {
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
