// =============================================================================
// MACD — EMA(12) − EMA(26), with a signal line EMA(9) of the MACD
// =============================================================================

use crate::indicators::ema::Ema;

/// Latest MACD reading.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MacdValue {
    pub macd: f64,
    pub signal: f64,
    pub histogram: f64,
}

/// Incremental MACD over closed bars.
#[derive(Debug, Clone)]
pub struct Macd {
    fast: Ema,
    slow: Ema,
    signal: Ema,
}

impl Macd {
    pub fn new(fast: usize, slow: usize, signal: usize) -> Self {
        assert!(fast < slow, "MACD fast period must be below the slow period");
        Self {
            fast: Ema::new(fast),
            slow: Ema::new(slow),
            signal: Ema::new(signal),
        }
    }

    /// Standard 12/26/9 configuration.
    pub fn standard() -> Self {
        Self::new(12, 26, 9)
    }

    pub fn update(&mut self, close: f64) {
        self.fast.update(close);
        self.slow.update(close);
        if let (Some(f), Some(s)) = (self.fast.value(), self.slow.value()) {
            self.signal.update(f - s);
        }
    }

    pub fn value(&self) -> Option<MacdValue> {
        let macd = self.fast.value()? - self.slow.value()?;
        let signal = self.signal.value()?;
        Some(MacdValue {
            macd,
            signal,
            histogram: macd - signal,
        })
    }

    pub fn is_ready(&self) -> bool {
        self.value().is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ready_only_after_slow_and_signal_seed() {
        let mut macd = Macd::standard();
        // Slow EMA seeds at 26 bars; the signal needs 9 MACD points on top.
        for i in 0..33 {
            macd.update(100.0 + i as f64);
            assert!(!macd.is_ready(), "should still be seeding at bar {i}");
        }
        macd.update(133.0);
        assert!(macd.is_ready());
    }

    #[test]
    fn flat_series_gives_zero_macd() {
        let mut macd = Macd::standard();
        for _ in 0..60 {
            macd.update(250.0);
        }
        let v = macd.value().unwrap();
        assert!(v.macd.abs() < 1e-9);
        assert!(v.signal.abs() < 1e-9);
        assert!(v.histogram.abs() < 1e-9);
    }

    #[test]
    fn rising_series_gives_positive_macd() {
        let mut macd = Macd::standard();
        for i in 0..80 {
            macd.update(100.0 + i as f64);
        }
        let v = macd.value().unwrap();
        assert!(v.macd > 0.0, "fast EMA should lead on a rising series");
    }

    #[test]
    #[should_panic]
    fn inverted_periods_panic() {
        Macd::new(26, 12, 9);
    }
}
