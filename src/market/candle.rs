// =============================================================================
// Candle model + thread-safe ring buffer per (symbol, interval)
// =============================================================================
//
// The live (unclosed) bar is continuously upserted in place; when a bar
// closes it becomes permanent and the ring is trimmed to `max_bars`. Bars
// with non-finite prices or a non-monotone timestamp are dropped with a
// warning and never reach the indicator pipeline.
// =============================================================================

use std::collections::{HashMap, VecDeque};

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::warn;

/// A single OHLCV bar.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Candle {
    /// Bar open timestamp, epoch milliseconds.
    pub ts: i64,
    /// Bar close timestamp, epoch milliseconds.
    pub close_ts: i64,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
    pub is_closed: bool,
}

impl Candle {
    /// Structural validity: finite fields and `low <= open,close <= high`.
    pub fn is_valid(&self) -> bool {
        let finite = [self.open, self.high, self.low, self.close, self.volume]
            .iter()
            .all(|v| v.is_finite());
        finite
            && self.volume >= 0.0
            && self.low <= self.open
            && self.low <= self.close
            && self.open <= self.high
            && self.close <= self.high
    }
}

/// Composite key identifying a unique bar series.
#[derive(Debug, Clone, Hash, Eq, PartialEq, Serialize, Deserialize)]
pub struct CandleKey {
    pub symbol: String,
    pub interval: String,
}

impl std::fmt::Display for CandleKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}@{}", self.symbol, self.interval)
    }
}

/// What an upsert did to the ring. `Closed` means a new permanent bar landed
/// and downstream consumers (indicators, scheduler) should react.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertOutcome {
    /// A closed bar was appended (or replaced an earlier close with equal ts).
    Closed,
    /// The trailing in-progress bar was created or refreshed.
    Trailing,
    /// The bar was rejected (invalid prices or regressed timestamp).
    Dropped,
}

/// Thread-safe ring buffer storing the most recent bars per (symbol, interval).
pub struct CandleRing {
    buffers: RwLock<HashMap<CandleKey, VecDeque<Candle>>>,
    max_bars: usize,
}

impl CandleRing {
    /// Retain at most `max_bars` closed bars per key, plus one trailing bar.
    pub fn new(max_bars: usize) -> Self {
        Self {
            buffers: RwLock::new(HashMap::new()),
            max_bars,
        }
    }

    /// Insert or replace the latest bar for the given key.
    ///
    /// * Closed bars append; a bar whose `ts` equals an already-closed bar
    ///   replaces it in place (REST backfill reconciling a missed close).
    /// * An in-progress bar replaces the current trailing bar.
    /// * Invalid bars and closed bars older than the newest close are dropped.
    pub fn upsert(&self, key: CandleKey, candle: Candle) -> UpsertOutcome {
        if !candle.is_valid() {
            warn!(key = %key, ts = candle.ts, "dropping bar with invalid prices");
            return UpsertOutcome::Dropped;
        }

        let mut map = self.buffers.write();
        let ring = map
            .entry(key.clone())
            .or_insert_with(|| VecDeque::with_capacity(self.max_bars + 1));

        if candle.is_closed {
            // Backfill path: identical ts replaces the stored close.
            if let Some(existing) = ring
                .iter_mut()
                .filter(|c| c.is_closed)
                .find(|c| c.ts == candle.ts)
            {
                *existing = candle;
                return UpsertOutcome::Closed;
            }

            let newest_closed = ring.iter().rev().find(|c| c.is_closed).map(|c| c.ts);
            if let Some(newest) = newest_closed {
                if candle.ts < newest {
                    warn!(
                        key = %key,
                        ts = candle.ts,
                        newest,
                        "dropping closed bar with regressed timestamp"
                    );
                    return UpsertOutcome::Dropped;
                }
            }

            // A trailing version of this same bar is superseded by the close.
            if let Some(last) = ring.back() {
                if !last.is_closed && last.ts == candle.ts {
                    ring.pop_back();
                }
            }
            ring.push_back(candle);

            // Keep the trailing bar (if any) at the back after trimming.
            while ring.iter().filter(|c| c.is_closed).count() > self.max_bars {
                if let Some(front_idx) = ring.iter().position(|c| c.is_closed) {
                    ring.remove(front_idx);
                } else {
                    break;
                }
            }
            UpsertOutcome::Closed
        } else {
            if let Some(last) = ring.back() {
                if !last.is_closed {
                    ring.pop_back();
                }
            }
            ring.push_back(candle);
            UpsertOutcome::Trailing
        }
    }

    /// The most recent `count` **closed** bars, oldest first.
    pub fn closed(&self, key: &CandleKey, count: usize) -> Vec<Candle> {
        let map = self.buffers.read();
        match map.get(key) {
            Some(ring) => {
                let closed: Vec<&Candle> = ring.iter().filter(|c| c.is_closed).collect();
                let start = closed.len().saturating_sub(count);
                closed[start..].iter().map(|c| (*c).clone()).collect()
            }
            None => Vec::new(),
        }
    }

    /// Timestamp of the newest closed bar, if any.
    pub fn latest_closed_ts(&self, key: &CandleKey) -> Option<i64> {
        let map = self.buffers.read();
        map.get(key)
            .and_then(|ring| ring.iter().rev().find(|c| c.is_closed).map(|c| c.ts))
    }

    /// Close price of the newest closed bar, if any.
    pub fn last_close(&self, key: &CandleKey) -> Option<f64> {
        let map = self.buffers.read();
        map.get(key)
            .and_then(|ring| ring.iter().rev().find(|c| c.is_closed).map(|c| c.close))
    }

    /// Best-effort mark price: the trailing bar's close if present, otherwise
    /// the last closed bar's close.
    pub fn mark_price(&self, key: &CandleKey) -> Option<f64> {
        let map = self.buffers.read();
        map.get(key)
            .and_then(|ring| ring.back().map(|c| c.close))
    }

    /// Number of closed bars stored for a key.
    pub fn closed_count(&self, key: &CandleKey) -> usize {
        let map = self.buffers.read();
        map.get(key)
            .map_or(0, |ring| ring.iter().filter(|c| c.is_closed).count())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bar(ts: i64, close: f64, is_closed: bool) -> Candle {
        Candle {
            ts,
            close_ts: ts + 59_999,
            open: close,
            high: close + 1.0,
            low: close - 1.0,
            close,
            volume: 100.0,
            is_closed,
        }
    }

    fn key(sym: &str) -> CandleKey {
        CandleKey {
            symbol: sym.into(),
            interval: "1m".into(),
        }
    }

    #[test]
    fn ring_trims_oldest_closed_bars() {
        let ring = CandleRing::new(3);
        let k = key("BTC-USDT");
        for i in 0..5 {
            ring.upsert(k.clone(), bar(i * 60_000, 100.0 + i as f64, true));
        }
        assert_eq!(ring.closed_count(&k), 3);
        let closes: Vec<f64> = ring.closed(&k, 10).iter().map(|c| c.close).collect();
        assert_eq!(closes, vec![102.0, 103.0, 104.0]);
    }

    #[test]
    fn trailing_bar_is_replaced_then_finalized() {
        let ring = CandleRing::new(10);
        let k = key("ETH-USDC");

        assert_eq!(ring.upsert(k.clone(), bar(0, 50.0, false)), UpsertOutcome::Trailing);
        assert_eq!(ring.upsert(k.clone(), bar(0, 51.0, false)), UpsertOutcome::Trailing);
        assert_eq!(ring.closed_count(&k), 0);

        assert_eq!(ring.upsert(k.clone(), bar(0, 52.0, true)), UpsertOutcome::Closed);
        assert_eq!(ring.closed_count(&k), 1);
        assert_eq!(ring.last_close(&k), Some(52.0));
    }

    #[test]
    fn backfill_upserts_on_identical_ts() {
        let ring = CandleRing::new(10);
        let k = key("BTC-USDT");
        ring.upsert(k.clone(), bar(0, 100.0, true));
        ring.upsert(k.clone(), bar(60_000, 101.0, true));

        // Backfill corrects the bar at ts=0 without growing the ring.
        ring.upsert(k.clone(), bar(0, 99.5, true));
        assert_eq!(ring.closed_count(&k), 2);
        let closes: Vec<f64> = ring.closed(&k, 10).iter().map(|c| c.close).collect();
        assert_eq!(closes, vec![99.5, 101.0]);
    }

    #[test]
    fn invalid_bar_is_dropped() {
        let ring = CandleRing::new(10);
        let k = key("BTC-USDT");
        let mut c = bar(0, 100.0, true);
        c.high = f64::NAN;
        assert_eq!(ring.upsert(k.clone(), c), UpsertOutcome::Dropped);

        let mut inverted = bar(60_000, 100.0, true);
        inverted.low = 105.0;
        inverted.high = 95.0;
        assert_eq!(ring.upsert(k.clone(), inverted), UpsertOutcome::Dropped);
        assert_eq!(ring.closed_count(&k), 0);
    }

    #[test]
    fn regressed_timestamp_is_dropped() {
        let ring = CandleRing::new(10);
        let k = key("BTC-USDT");
        ring.upsert(k.clone(), bar(120_000, 100.0, true));
        assert_eq!(
            ring.upsert(k.clone(), bar(60_000, 99.0, true)),
            UpsertOutcome::Dropped
        );
    }

    #[test]
    fn mark_price_prefers_trailing_bar() {
        let ring = CandleRing::new(10);
        let k = key("BTC-USDT");
        ring.upsert(k.clone(), bar(0, 100.0, true));
        ring.upsert(k.clone(), bar(60_000, 104.5, false));
        assert_eq!(ring.mark_price(&k), Some(104.5));
        assert_eq!(ring.last_close(&k), Some(100.0));
    }
}
