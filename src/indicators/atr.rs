// =============================================================================
// Average True Range (ATR) — Wilder's smoothing, incremental
// =============================================================================
//
// True Range per bar:
//   TR = max(H - L, |H - prevClose|, |L - prevClose|)
//
// ATR_0 = SMA of first `period` TR values
// ATR_t = (ATR_{t-1} * (period - 1) + TR_t) / period
// =============================================================================

use crate::market::candle::Candle;

#[derive(Debug, Clone, Copy)]
enum AtrState {
    Seeding { sum_tr: f64, count: usize },
    Ready { value: f64 },
}

/// Incremental ATR over closed bars.
#[derive(Debug, Clone)]
pub struct Atr {
    period: usize,
    prev_close: Option<f64>,
    state: AtrState,
}

impl Atr {
    pub fn new(period: usize) -> Self {
        assert!(period > 0, "ATR period must be positive");
        Self {
            period,
            prev_close: None,
            state: AtrState::Seeding {
                sum_tr: 0.0,
                count: 0,
            },
        }
    }

    pub fn update(&mut self, candle: &Candle) {
        if !candle.is_valid() {
            return;
        }
        let prev = match self.prev_close.replace(candle.close) {
            Some(p) => p,
            None => return, // first bar: TR needs a previous close
        };

        let hl = candle.high - candle.low;
        let hc = (candle.high - prev).abs();
        let lc = (candle.low - prev).abs();
        let tr = hl.max(hc).max(lc);
        let period_f = self.period as f64;

        match self.state {
            AtrState::Seeding { sum_tr, count } => {
                let sum_tr = sum_tr + tr;
                let count = count + 1;
                if count >= self.period {
                    self.state = AtrState::Ready {
                        value: sum_tr / period_f,
                    };
                } else {
                    self.state = AtrState::Seeding { sum_tr, count };
                }
            }
            AtrState::Ready { value } => {
                self.state = AtrState::Ready {
                    value: (value * (period_f - 1.0) + tr) / period_f,
                };
            }
        }
    }

    pub fn value(&self) -> Option<f64> {
        match self.state {
            AtrState::Ready { value } if value.is_finite() => Some(value),
            _ => None,
        }
    }

    pub fn is_ready(&self) -> bool {
        self.value().is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn candle(ts: i64, open: f64, high: f64, low: f64, close: f64) -> Candle {
        Candle {
            ts,
            close_ts: ts + 59_999,
            open,
            high,
            low,
            close,
            volume: 100.0,
            is_closed: true,
        }
    }

    #[test]
    fn needs_period_plus_one_bars() {
        let mut atr = Atr::new(14);
        for i in 0..14 {
            atr.update(&candle(i * 60_000, 100.0, 105.0, 95.0, 102.0));
        }
        assert!(atr.value().is_none());
        atr.update(&candle(14 * 60_000, 100.0, 105.0, 95.0, 102.0));
        assert!(atr.value().is_some());
    }

    #[test]
    fn constant_range_converges_to_range() {
        let mut atr = Atr::new(14);
        for i in 0..30 {
            let base = 100.0 + i as f64 * 0.1;
            atr.update(&candle(i * 60_000, base, base + 5.0, base - 5.0, base));
        }
        let v = atr.value().unwrap();
        assert!((v - 10.0).abs() < 1.0, "expected ATR near 10, got {v}");
    }

    #[test]
    fn gap_feeds_true_range() {
        // |H - prevClose| dominates when the bar gaps past the prior close.
        let mut atr = Atr::new(3);
        atr.update(&candle(0, 100.0, 105.0, 95.0, 95.0));
        atr.update(&candle(1, 110.0, 115.0, 108.0, 112.0)); // TR = |115-95| = 20
        atr.update(&candle(2, 112.0, 118.0, 110.0, 115.0));
        atr.update(&candle(3, 115.0, 120.0, 113.0, 118.0));
        let v = atr.value().unwrap();
        assert!(v > 7.0, "ATR should reflect the gap, got {v}");
    }

    #[test]
    fn invalid_bar_does_not_advance() {
        let mut atr = Atr::new(3);
        for i in 0..4 {
            atr.update(&candle(i * 60_000, 100.0, 105.0, 95.0, 100.0));
        }
        let before = atr.value().unwrap();
        let mut bad = candle(5 * 60_000, 100.0, f64::NAN, 95.0, 100.0);
        bad.is_closed = true;
        atr.update(&bad);
        assert_eq!(atr.value().unwrap(), before);
    }
}
