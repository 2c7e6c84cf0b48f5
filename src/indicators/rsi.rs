// =============================================================================
// Relative Strength Index (RSI) — Wilder's smoothing, incremental
// =============================================================================
//
// Step 1 — delta of consecutive closes.
// Step 2 — seed average gain / loss with the SMA of the first `period` deltas.
// Step 3 — Wilder smoothing:
//            avg_gain = (prev_avg_gain * (period - 1) + gain) / period
//            avg_loss = (prev_avg_loss * (period - 1) + loss) / period
// Step 4 — RS = avg_gain / avg_loss, RSI = 100 - 100 / (1 + RS)
//
// Edge behaviour: zero movement => 50, all gains => 100, all losses => 0.
// =============================================================================

#[derive(Debug, Clone, Copy)]
enum RsiState {
    /// Accumulating the first `period` deltas.
    Seeding {
        sum_gain: f64,
        sum_loss: f64,
        count: usize,
    },
    Ready {
        avg_gain: f64,
        avg_loss: f64,
    },
}

/// Incremental RSI over closed bars.
#[derive(Debug, Clone)]
pub struct Rsi {
    period: usize,
    prev_close: Option<f64>,
    state: RsiState,
}

impl Rsi {
    pub fn new(period: usize) -> Self {
        assert!(period > 0, "RSI period must be positive");
        Self {
            period,
            prev_close: None,
            state: RsiState::Seeding {
                sum_gain: 0.0,
                sum_loss: 0.0,
                count: 0,
            },
        }
    }

    pub fn update(&mut self, close: f64) {
        if !close.is_finite() {
            return;
        }
        let prev = match self.prev_close.replace(close) {
            Some(p) => p,
            None => return, // first close produces no delta
        };

        let delta = close - prev;
        let gain = if delta > 0.0 { delta } else { 0.0 };
        let loss = if delta < 0.0 { delta.abs() } else { 0.0 };
        let period_f = self.period as f64;

        match self.state {
            RsiState::Seeding {
                sum_gain,
                sum_loss,
                count,
            } => {
                let sum_gain = sum_gain + gain;
                let sum_loss = sum_loss + loss;
                let count = count + 1;
                if count >= self.period {
                    self.state = RsiState::Ready {
                        avg_gain: sum_gain / period_f,
                        avg_loss: sum_loss / period_f,
                    };
                } else {
                    self.state = RsiState::Seeding {
                        sum_gain,
                        sum_loss,
                        count,
                    };
                }
            }
            RsiState::Ready { avg_gain, avg_loss } => {
                self.state = RsiState::Ready {
                    avg_gain: (avg_gain * (period_f - 1.0) + gain) / period_f,
                    avg_loss: (avg_loss * (period_f - 1.0) + loss) / period_f,
                };
            }
        }
    }

    pub fn value(&self) -> Option<f64> {
        match self.state {
            RsiState::Ready { avg_gain, avg_loss } => {
                let rsi = if avg_loss == 0.0 && avg_gain == 0.0 {
                    50.0
                } else if avg_loss == 0.0 {
                    100.0
                } else {
                    let rs = avg_gain / avg_loss;
                    100.0 - 100.0 / (1.0 + rs)
                };
                rsi.is_finite().then_some(rsi)
            }
            RsiState::Seeding { .. } => None,
        }
    }

    pub fn is_ready(&self) -> bool {
        self.value().is_some()
    }
}
