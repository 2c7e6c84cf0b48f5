// =============================================================================
// Circuit Breaker — latching trade halt requiring explicit reset
// =============================================================================
//
// Evaluated on every tick with four inputs; any breach latches the breaker
// and no orders are placed until `reset()` is called. The reasons that
// tripped it are carried into Decision records so the journal explains
// every halted evaluation.
//
// Default thresholds: 5 % daily drawdown, 3 consecutive large losses,
// 6 % volatility, and any stream instability.
// =============================================================================

use parking_lot::RwLock;
use serde::Serialize;
use tracing::warn;

/// Inputs sampled once per tick.
#[derive(Debug, Clone, Copy)]
pub struct BreakerInputs {
    /// Realized daily loss as a positive fraction of equity.
    pub daily_drawdown_pct: f64,
    pub consecutive_large_losses: u32,
    /// Current volatility (`atr/close`) as a fraction.
    pub volatility_pct: f64,
    pub stream_unstable: bool,
}

/// Trip thresholds.
#[derive(Debug, Clone, Copy)]
pub struct BreakerThresholds {
    pub max_daily_drawdown_pct: f64,
    pub max_consecutive_large_losses: u32,
    pub max_volatility_pct: f64,
    pub trip_on_stream_unstable: bool,
}

impl Default for BreakerThresholds {
    fn default() -> Self {
        Self {
            max_daily_drawdown_pct: 0.05,
            max_consecutive_large_losses: 3,
            max_volatility_pct: 0.06,
            trip_on_stream_unstable: true,
        }
    }
}

/// Serialisable breaker state for status surfaces and Decision records.
#[derive(Debug, Clone, Serialize)]
pub struct BreakerSnapshot {
    pub tripped: bool,
    pub reasons: Vec<String>,
    pub tripped_at: Option<i64>,
}

struct Inner {
    tripped: bool,
    reasons: Vec<String>,
    tripped_at: Option<i64>,
}

/// Latching circuit breaker.
pub struct CircuitBreaker {
    thresholds: BreakerThresholds,
    state: RwLock<Inner>,
}

impl CircuitBreaker {
    pub fn new(thresholds: BreakerThresholds) -> Self {
        Self {
            thresholds,
            state: RwLock::new(Inner {
                tripped: false,
                reasons: Vec::new(),
                tripped_at: None,
            }),
        }
    }

    /// Evaluate this tick's inputs. Once latched, stays latched regardless
    /// of later inputs; returns whether the breaker is (now) tripped.
    pub fn evaluate(&self, inputs: &BreakerInputs, now_ms: i64) -> bool {
        let mut reasons = Vec::new();
        let t = &self.thresholds;

        if inputs.daily_drawdown_pct >= t.max_daily_drawdown_pct {
            reasons.push(format!(
                "daily drawdown {:.2}% >= {:.2}%",
                inputs.daily_drawdown_pct * 100.0,
                t.max_daily_drawdown_pct * 100.0
            ));
        }
        if inputs.consecutive_large_losses >= t.max_consecutive_large_losses {
            reasons.push(format!(
                "{} consecutive large losses >= {}",
                inputs.consecutive_large_losses, t.max_consecutive_large_losses
            ));
        }
        if inputs.volatility_pct >= t.max_volatility_pct {
            reasons.push(format!(
                "volatility {:.2}% >= {:.2}%",
                inputs.volatility_pct * 100.0,
                t.max_volatility_pct * 100.0
            ));
        }
        if t.trip_on_stream_unstable && inputs.stream_unstable {
            reasons.push("market stream unstable".to_string());
        }

        let mut s = self.state.write();
        if !reasons.is_empty() && !s.tripped {
            warn!(reasons = ?reasons, "circuit breaker TRIPPED");
            s.tripped = true;
            s.reasons = reasons;
            s.tripped_at = Some(now_ms);
        }
        s.tripped
    }

    pub fn is_tripped(&self) -> bool {
        self.state.read().tripped
    }

    pub fn snapshot(&self) -> BreakerSnapshot {
        let s = self.state.read();
        BreakerSnapshot {
            tripped: s.tripped,
            reasons: s.reasons.clone(),
            tripped_at: s.tripped_at,
        }
    }

    /// Explicit operator reset. The only way a latched breaker re-arms.
    pub fn reset(&self) {
        let mut s = self.state.write();
        if s.tripped {
            warn!(reasons = ?s.reasons, "circuit breaker reset by operator");
        }
        s.tripped = false;
        s.reasons.clear();
        s.tripped_at = None;
    }
}

impl Default for CircuitBreaker {
    fn default() -> Self {
        Self::new(BreakerThresholds::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn calm() -> BreakerInputs {
        BreakerInputs {
            daily_drawdown_pct: 0.0,
            consecutive_large_losses: 0,
            volatility_pct: 0.01,
            stream_unstable: false,
        }
    }

    #[test]
    fn calm_inputs_do_not_trip() {
        let b = CircuitBreaker::default();
        assert!(!b.evaluate(&calm(), 0));
        assert!(!b.is_tripped());
    }

    #[test]
    fn drawdown_trips_and_latches() {
        let b = CircuitBreaker::default();
        let mut inputs = calm();
        inputs.daily_drawdown_pct = 0.06;
        assert!(b.evaluate(&inputs, 1_000));

        // Inputs recover, but the breaker stays latched.
        assert!(b.evaluate(&calm(), 2_000));
        let snap = b.snapshot();
        assert!(snap.tripped);
        assert_eq!(snap.tripped_at, Some(1_000));
        assert!(snap.reasons[0].contains("daily drawdown"));
    }

    #[test]
    fn reset_rearms() {
        let b = CircuitBreaker::default();
        let mut inputs = calm();
        inputs.stream_unstable = true;
        assert!(b.evaluate(&inputs, 0));
        b.reset();
        assert!(!b.is_tripped());
        assert!(!b.evaluate(&calm(), 1));
    }

    #[test]
    fn large_loss_threshold_trips() {
        let b = CircuitBreaker::default();
        let mut inputs = calm();
        inputs.consecutive_large_losses = 3;
        assert!(b.evaluate(&inputs, 0));
    }

    #[test]
    fn volatility_threshold_trips() {
        let b = CircuitBreaker::default();
        let mut inputs = calm();
        inputs.volatility_pct = 0.07;
        assert!(b.evaluate(&inputs, 0));
        assert!(b.snapshot().reasons[0].contains("volatility"));
    }

    #[test]
    fn stream_instability_can_be_disarmed() {
        let b = CircuitBreaker::new(BreakerThresholds {
            trip_on_stream_unstable: false,
            ..BreakerThresholds::default()
        });
        let mut inputs = calm();
        inputs.stream_unstable = true;
        assert!(!b.evaluate(&inputs, 0));
    }

    #[test]
    fn first_trip_reasons_are_preserved() {
        let b = CircuitBreaker::default();
        let mut first = calm();
        first.volatility_pct = 0.08;
        b.evaluate(&first, 0);

        let mut second = calm();
        second.daily_drawdown_pct = 0.9;
        b.evaluate(&second, 1);

        // Reasons reflect what tripped it, not later breaches.
        let snap = b.snapshot();
        assert_eq!(snap.reasons.len(), 1);
        assert!(snap.reasons[0].contains("volatility"));
    }
}
