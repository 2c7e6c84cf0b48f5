// =============================================================================
// Strategy Parameters — sanitized, immutable once committed
// =============================================================================
//
// Every numeric field is clamped into a hard global bound by `sanitize`;
// refinement candidates pass through the same clamp after their ±15 % delta
// bound, so no committed parameter set can ever escape these ranges.
// =============================================================================

use serde::{Deserialize, Serialize};

/// Hard bound for one parameter.
#[derive(Debug, Clone, Copy)]
pub struct Bound {
    pub min: f64,
    pub max: f64,
}

impl Bound {
    pub fn clamp(&self, v: f64) -> f64 {
        if !v.is_finite() {
            return self.min;
        }
        v.clamp(self.min, self.max)
    }
}

pub const MIN_SCORE_BOUND: Bound = Bound { min: 0.5, max: 0.95 };
pub const ATR_MULTIPLIER_BOUND: Bound = Bound { min: 0.6, max: 2.5 };
pub const STOP_LOSS_ATR_BOUND: Bound = Bound { min: 0.8, max: 3.5 };
pub const TAKE_PROFIT_ATR_BOUND: Bound = Bound { min: 1.2, max: 5.0 };
pub const MAX_RISK_PER_TRADE_BOUND: Bound = Bound { min: 0.003, max: 0.03 };
pub const DAILY_MAX_LOSS_BOUND: Bound = Bound { min: 0.01, max: 0.1 };
pub const MAX_CONCURRENT_TRADES_BOUND: Bound = Bound { min: 1.0, max: 5.0 };
pub const KILL_SWITCH_LOSSES_BOUND: Bound = Bound { min: 2.0, max: 6.0 };
pub const MIN_ATR_PCT_BOUND: Bound = Bound { min: 0.0008, max: 0.02 };
pub const MAX_ATR_PCT_BOUND: Bound = Bound { min: 0.005, max: 0.08 };

/// Tunable strategy parameter set. Committed sets are immutable; evaluators
/// take a copy-on-write snapshot at the start of a tick.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StrategyParameters {
    /// Setup-score floor a BUY must clear.
    pub min_score: f64,
    /// Global scale on both stop and target distances.
    pub atr_multiplier: f64,
    /// Stop distance in ATR units.
    pub stop_loss_atr: f64,
    /// Target distance in ATR units.
    pub take_profit_atr: f64,
    /// Per-trade risk budget as a fraction of equity.
    pub max_risk_per_trade_pct: f64,
    /// Daily realized-loss limit as a fraction of equity.
    pub daily_max_loss_pct: f64,
    pub max_concurrent_trades: u32,
    /// Consecutive losses that halt new entries.
    pub kill_switch_losses: u32,
    /// Volatility floor (`atr/close`) below which the market is CHOP.
    pub min_atr_pct: f64,
    /// Volatility ceiling above which entries are refused.
    pub max_atr_pct: f64,
}

impl Default for StrategyParameters {
    fn default() -> Self {
        Self {
            min_score: 0.62,
            atr_multiplier: 1.0,
            stop_loss_atr: 1.5,
            take_profit_atr: 2.5,
            max_risk_per_trade_pct: 0.01,
            daily_max_loss_pct: 0.03,
            max_concurrent_trades: 3,
            kill_switch_losses: 4,
            min_atr_pct: 0.0015,
            max_atr_pct: 0.04,
        }
    }
}

impl StrategyParameters {
    /// Clamp every field into its hard global bound.
    pub fn sanitize(&self) -> Self {
        Self {
            min_score: MIN_SCORE_BOUND.clamp(self.min_score),
            atr_multiplier: ATR_MULTIPLIER_BOUND.clamp(self.atr_multiplier),
            stop_loss_atr: STOP_LOSS_ATR_BOUND.clamp(self.stop_loss_atr),
            take_profit_atr: TAKE_PROFIT_ATR_BOUND.clamp(self.take_profit_atr),
            max_risk_per_trade_pct: MAX_RISK_PER_TRADE_BOUND.clamp(self.max_risk_per_trade_pct),
            daily_max_loss_pct: DAILY_MAX_LOSS_BOUND.clamp(self.daily_max_loss_pct),
            max_concurrent_trades: MAX_CONCURRENT_TRADES_BOUND
                .clamp(self.max_concurrent_trades as f64)
                .round() as u32,
            kill_switch_losses: KILL_SWITCH_LOSSES_BOUND
                .clamp(self.kill_switch_losses as f64)
                .round() as u32,
            min_atr_pct: MIN_ATR_PCT_BOUND.clamp(self.min_atr_pct),
            max_atr_pct: MAX_ATR_PCT_BOUND.clamp(self.max_atr_pct),
        }
    }

    /// Whether every field already sits inside its bound.
    pub fn is_sane(&self) -> bool {
        *self == self.sanitize()
    }
}

/// Bound a refinement candidate's delta to ±`max_delta_pct` of the current
/// value, then leave final clamping to `sanitize`.
pub fn bound_delta(current: f64, candidate: f64, max_delta_pct: f64) -> f64 {
    if !candidate.is_finite() || current <= 0.0 {
        return current;
    }
    let lo = current * (1.0 - max_delta_pct);
    let hi = current * (1.0 + max_delta_pct);
    candidate.clamp(lo, hi)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_is_sane() {
        assert!(StrategyParameters::default().is_sane());
    }

    #[test]
    fn sanitize_clamps_every_field() {
        let wild = StrategyParameters {
            min_score: 2.0,
            atr_multiplier: 0.0,
            stop_loss_atr: 99.0,
            take_profit_atr: 0.1,
            max_risk_per_trade_pct: 1.0,
            daily_max_loss_pct: 0.0,
            max_concurrent_trades: 50,
            kill_switch_losses: 0,
            min_atr_pct: 1.0,
            max_atr_pct: 0.0,
        };
        let clean = wild.sanitize();
        assert_eq!(clean.min_score, 0.95);
        assert_eq!(clean.atr_multiplier, 0.6);
        assert_eq!(clean.stop_loss_atr, 3.5);
        assert_eq!(clean.take_profit_atr, 1.2);
        assert_eq!(clean.max_risk_per_trade_pct, 0.03);
        assert_eq!(clean.daily_max_loss_pct, 0.01);
        assert_eq!(clean.max_concurrent_trades, 5);
        assert_eq!(clean.kill_switch_losses, 2);
        assert_eq!(clean.min_atr_pct, 0.02);
        assert_eq!(clean.max_atr_pct, 0.005);
        assert!(clean.is_sane());
    }

    #[test]
    fn non_finite_falls_to_lower_bound() {
        let p = StrategyParameters {
            min_score: f64::NAN,
            ..StrategyParameters::default()
        };
        assert_eq!(p.sanitize().min_score, 0.5);
    }

    #[test]
    fn delta_bounding_caps_both_directions() {
        assert!((bound_delta(1.0, 2.0, 0.15) - 1.15).abs() < 1e-12);
        assert!((bound_delta(1.0, 0.2, 0.15) - 0.85).abs() < 1e-12);
        assert!((bound_delta(1.0, 1.05, 0.15) - 1.05).abs() < 1e-12);
    }

    #[test]
    fn delta_bounding_rejects_nan_candidate() {
        assert_eq!(bound_delta(1.2, f64::NAN, 0.15), 1.2);
    }
}
