// =============================================================================
// Indicator Engine — per-symbol incremental indicator state
// =============================================================================
//
// One engine per symbol, fed exactly once per closed bar in timestamp order.
// Combines EMA(9/21), RSI(14), ATR(14), volume SMA(20) and MACD(12/26/9).
// The engine is strictly causal: a bar with a timestamp at or before the
// last accepted bar is ignored, and the trailing (unclosed) bar never
// reaches it.
// =============================================================================

use serde::Serialize;

use crate::indicators::atr::Atr;
use crate::indicators::ema::Ema;
use crate::indicators::macd::{Macd, MacdValue};
use crate::indicators::rsi::Rsi;
use crate::indicators::volume::VolumeSma;
use crate::market::candle::Candle;

pub const EMA_SHORT_PERIOD: usize = 9;
pub const EMA_LONG_PERIOD: usize = 21;
pub const RSI_PERIOD: usize = 14;
pub const ATR_PERIOD: usize = 14;
pub const VOLUME_PERIOD: usize = 20;

/// Snapshot of the full indicator set for one symbol at one closed bar.
#[derive(Debug, Clone, Serialize)]
pub struct IndicatorSnapshot {
    pub ts: i64,
    pub close: f64,
    pub prev_close: f64,
    pub ema_short: f64,
    pub ema_long: f64,
    pub rsi: f64,
    pub rsi_rising: bool,
    pub atr: f64,
    /// `atr / close` — the volatility measure regime classification keys on.
    pub atr_pct: f64,
    pub volume_ratio: f64,
    #[serde(skip)]
    pub macd: MacdValue,
    /// Whether the one-bar return improved versus the prior bar.
    pub momentum_rising: bool,
    /// Closed bars consumed so far.
    pub bars_seen: usize,
}

/// Incremental indicator state for a single symbol.
pub struct IndicatorEngine {
    symbol: String,
    ema_short: Ema,
    ema_long: Ema,
    rsi: Rsi,
    atr: Atr,
    volume: VolumeSma,
    macd: Macd,
    last_ts: Option<i64>,
    prev_close: Option<f64>,
    prev_prev_close: Option<f64>,
    /// Rising flags computed at the last accepted bar, reused by `latest`.
    last_rsi_rising: bool,
    last_momentum_rising: bool,
    bars_seen: usize,
}

impl IndicatorEngine {
    pub fn new(symbol: impl Into<String>) -> Self {
        Self {
            symbol: symbol.into(),
            ema_short: Ema::new(EMA_SHORT_PERIOD),
            ema_long: Ema::new(EMA_LONG_PERIOD),
            rsi: Rsi::new(RSI_PERIOD),
            atr: Atr::new(ATR_PERIOD),
            volume: VolumeSma::new(VOLUME_PERIOD),
            macd: Macd::standard(),
            last_ts: None,
            prev_close: None,
            prev_prev_close: None,
            last_rsi_rising: false,
            last_momentum_rising: false,
            bars_seen: 0,
        }
    }

    pub fn symbol(&self) -> &str {
        &self.symbol
    }

    pub fn bars_seen(&self) -> usize {
        self.bars_seen
    }

    /// Feed one closed bar. Returns the full snapshot once every window is
    /// ready; `None` while any indicator is still seeding.
    ///
    /// Out-of-order and invalid bars are rejected without advancing state.
    pub fn update(&mut self, candle: &Candle) -> Option<IndicatorSnapshot> {
        if !candle.is_closed || !candle.is_valid() {
            return None;
        }
        if let Some(last) = self.last_ts {
            if candle.ts <= last {
                return None;
            }
        }
        self.last_ts = Some(candle.ts);
        self.bars_seen += 1;

        let rsi_before = self.rsi.value();

        self.ema_short.update(candle.close);
        self.ema_long.update(candle.close);
        self.rsi.update(candle.close);
        self.atr.update(candle);
        self.volume.update(candle.volume);
        self.macd.update(candle.close);

        let prev_close = self.prev_close;
        let prev_prev_close = self.prev_prev_close;
        self.prev_prev_close = self.prev_close;
        self.prev_close = Some(candle.close);

        let snapshot = self.snapshot_inner(candle, prev_close, prev_prev_close, rsi_before);
        if let Some(snap) = &snapshot {
            self.last_rsi_rising = snap.rsi_rising;
            self.last_momentum_rising = snap.momentum_rising;
        }
        snapshot
    }

    /// The snapshot at the last accepted bar, if all windows are ready.
    /// Used by tick-triggered evaluations that arrive between bar closes.
    pub fn latest(&self) -> Option<IndicatorSnapshot> {
        let ts = self.last_ts?;
        let close = self.prev_close?;
        let prev_close = self.prev_prev_close?;
        let ema_short = self.ema_short.value()?;
        let ema_long = self.ema_long.value()?;
        let rsi = self.rsi.value()?;
        let atr = self.atr.value()?;
        let volume_ratio = self.volume.ratio()?;
        let macd = self.macd.value()?;
        if close <= 0.0 {
            return None;
        }
        Some(IndicatorSnapshot {
            ts,
            close,
            prev_close,
            ema_short,
            ema_long,
            rsi,
            rsi_rising: self.last_rsi_rising,
            atr,
            atr_pct: atr / close,
            volume_ratio,
            macd,
            momentum_rising: self.last_momentum_rising,
            bars_seen: self.bars_seen,
        })
    }

    fn snapshot_inner(
        &self,
        candle: &Candle,
        prev_close: Option<f64>,
        prev_prev_close: Option<f64>,
        rsi_before: Option<f64>,
    ) -> Option<IndicatorSnapshot> {
        let prev_close = prev_close?;
        let ema_short = self.ema_short.value()?;
        let ema_long = self.ema_long.value()?;
        let rsi = self.rsi.value()?;
        let atr = self.atr.value()?;
        let volume_ratio = self.volume.ratio()?;
        let macd = self.macd.value()?;
        if candle.close <= 0.0 {
            return None;
        }

        // Momentum improves when this bar's return beats the prior bar's.
        let momentum_rising = match prev_prev_close {
            Some(pp) => (candle.close - prev_close) > (prev_close - pp),
            None => candle.close > prev_close,
        };

        Some(IndicatorSnapshot {
            ts: candle.ts,
            close: candle.close,
            prev_close,
            ema_short,
            ema_long,
            rsi,
            rsi_rising: rsi_before.map(|p| rsi >= p).unwrap_or(false),
            atr,
            atr_pct: atr / candle.close,
            volume_ratio,
            macd,
            momentum_rising,
            bars_seen: self.bars_seen,
        })
    }
}
