// =============================================================================
// Refiner — regime classification + setup scoring + BUY/SELL/HOLD decision
// =============================================================================
//
// Pipeline per evaluation:
//   1. Require >= 50 closed bars, else HOLD at low confidence.
//   2. Classify regime from atr_pct and the EMA(9/21) trend gap.
//   3. Score the setup: five weighted sub-scores, each clamped to [0, 1].
//   4. Relax the min-score threshold after prolonged inactivity.
//   5. Map regime + score to an action; confidence from score and regime.
//
// `decide` is a pure function of its inputs: identical candles, parameters
// and context always produce a bit-identical decision. The stability audit
// enforces that plus robustness under small price perturbations.
// =============================================================================

use serde::Serialize;

use crate::indicators::{IndicatorEngine, IndicatorSnapshot};
use crate::market::candle::Candle;
use crate::strategy::params::StrategyParameters;
use crate::types::{Regime, Signal};

/// Minimum closed bars before the refiner will score a setup.
pub const MIN_BARS: usize = 50;

/// Trend-gap threshold for the trending regimes: `(emaShort - emaLong)/close`.
const TREND_GAP: f64 = 0.0015;

/// Sub-score weights: pullback / rsi-recovery / momentum / volume / trend.
const W_PULLBACK: f64 = 0.22;
const W_RSI: f64 = 0.20;
const W_MOMENTUM: f64 = 0.20;
const W_VOLUME: f64 = 0.16;
const W_TREND: f64 = 0.22;

/// Inactivity relaxation: after 2 h idle, `min_score` relaxes linearly by up
/// to 0.08 over the following 12 h.
const IDLE_GRACE_MS: i64 = 2 * 3_600_000;
const IDLE_RAMP_MS: i64 = 12 * 3_600_000;
const IDLE_MAX_RELAX: f64 = 0.08;

/// Extra score buffer required for ranging-market entries; shrinks after 6 h
/// without a trade. The inactivity relaxation is applied to `min_score`
/// first; this buffer sits on top of the relaxed value.
const RANGING_BUFFER: f64 = 0.04;
const RANGING_BUFFER_IDLE: f64 = 0.01;
const RANGING_IDLE_MS: i64 = 6 * 3_600_000;

/// Cross-symbol context the decision depends on besides the candles.
#[derive(Debug, Clone, Copy)]
pub struct DecisionContext {
    /// Whether the symbol currently has open holdings (enables SELL).
    pub has_holdings: bool,
    /// Milliseconds since the last executed trade for this symbol.
    pub idle_ms: i64,
    /// Strategy version stamped onto the decision.
    pub strategy_version: u64,
}

/// The five sub-scores, kept for decision reasons and audit.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct SetupScore {
    pub pullback: f64,
    pub rsi_recovery: f64,
    pub momentum: f64,
    pub volume: f64,
    pub trend_alignment: f64,
    pub total: f64,
}

/// Output of one refiner evaluation.
#[derive(Debug, Clone, Serialize)]
pub struct RefinerDecision {
    pub action: Signal,
    pub confidence: f64,
    pub regime: Regime,
    pub score: f64,
    pub model_version: u64,
    pub reasons: Vec<String>,
}

pub struct Refiner;

impl Refiner {
    /// Decide from raw candles. Pure: builds a fresh indicator pass over the
    /// input, so identical inputs yield identical outputs.
    pub fn decide(
        candles: &[Candle],
        params: &StrategyParameters,
        ctx: &DecisionContext,
    ) -> RefinerDecision {
        let closed: Vec<&Candle> = candles.iter().filter(|c| c.is_closed).collect();
        if closed.len() < MIN_BARS {
            return RefinerDecision {
                action: Signal::Hold,
                confidence: 0.2,
                regime: Regime::Ranging,
                score: 0.0,
                model_version: ctx.strategy_version,
                reasons: vec![format!(
                    "insufficient history: {} bars < {MIN_BARS}",
                    closed.len()
                )],
            };
        }

        let mut engine = IndicatorEngine::new("audit");
        let mut snapshot = None;
        for candle in closed.iter().copied() {
            if let Some(s) = engine.update(candle) {
                snapshot = Some(s);
            }
        }
        match snapshot {
            Some(snap) => Self::decide_from_snapshot(&snap, params, ctx),
            None => RefinerDecision {
                action: Signal::Hold,
                confidence: 0.2,
                regime: Regime::Ranging,
                score: 0.0,
                model_version: ctx.strategy_version,
                reasons: vec!["indicators not ready".to_string()],
            },
        }
    }

    /// Decide from an already-computed indicator snapshot. The live pipeline
    /// calls this with the per-symbol incremental engine's latest snapshot.
    pub fn decide_from_snapshot(
        snap: &IndicatorSnapshot,
        params: &StrategyParameters,
        ctx: &DecisionContext,
    ) -> RefinerDecision {
        let regime = Self::classify_regime(snap, params);
        let score = Self::score_setup(snap, regime);
        let effective_min = Self::effective_min_score(params.min_score, ctx.idle_ms);

        let mut reasons = vec![
            format!("regime={regime}"),
            format!("score={:.4}", score.total),
            format!("minScore={:.4} effective={:.4}", params.min_score, effective_min),
        ];

        let action = match regime {
            Regime::TrendingUp if score.total >= effective_min => {
                reasons.push("trend entry: score cleared threshold".to_string());
                Signal::Buy
            }
            Regime::Ranging => {
                let buffer = if ctx.idle_ms >= RANGING_IDLE_MS {
                    RANGING_BUFFER_IDLE
                } else {
                    RANGING_BUFFER
                };
                if score.total >= effective_min + buffer
                    && score.rsi_recovery >= 0.55
                    && score.momentum >= 0.5
                {
                    reasons.push(format!("ranging entry: buffer={buffer:.2} cleared"));
                    Signal::Buy
                } else {
                    Signal::Hold
                }
            }
            Regime::TrendingDown | Regime::HighVolatility if ctx.has_holdings => {
                reasons.push(format!("exit signal: adverse regime {regime}"));
                Signal::Sell
            }
            _ => Signal::Hold,
        };

        let penalty = Self::regime_penalty(regime);
        let mut confidence = (0.35 + 0.55 * score.total - penalty).clamp(0.1, 0.95);
        if action == Signal::Buy {
            confidence = confidence.max(0.62);
        }
        reasons.push(format!("confidence={confidence:.4}"));

        RefinerDecision {
            action,
            confidence,
            regime,
            score: score.total,
            model_version: ctx.strategy_version,
            reasons,
        }
    }

    /// Regime classification per the volatility and trend-gap thresholds.
    pub fn classify_regime(snap: &IndicatorSnapshot, params: &StrategyParameters) -> Regime {
        let atr_pct = snap.atr_pct;
        if atr_pct < params.min_atr_pct {
            return Regime::Chop;
        }
        if atr_pct > 1.2 * params.max_atr_pct {
            return Regime::HighVolatility;
        }
        let gap = (snap.ema_short - snap.ema_long) / snap.close;
        if gap > TREND_GAP && snap.close >= snap.ema_short {
            Regime::TrendingUp
        } else if gap < -TREND_GAP && snap.close <= snap.ema_short {
            Regime::TrendingDown
        } else {
            Regime::Ranging
        }
    }

    /// Weighted setup score in [0, 1]; each sub-score clamped to [0, 1].
    pub fn score_setup(snap: &IndicatorSnapshot, regime: Regime) -> SetupScore {
        let pullback =
            (1.0 - (snap.close - snap.ema_short).abs() / snap.close / 0.0035).clamp(0.0, 1.0);

        let rsi_bonus = if snap.rsi_rising { 0.2 } else { 0.0 };
        let rsi_recovery = ((snap.rsi - 45.0) / 20.0 + rsi_bonus).clamp(0.0, 1.0);

        let one_bar_return = if snap.prev_close > 0.0 {
            snap.close / snap.prev_close - 1.0
        } else {
            0.0
        };
        let momentum_bonus = if snap.momentum_rising { 0.3 } else { 0.0 };
        let momentum = (one_bar_return / 0.004 + momentum_bonus).clamp(0.0, 1.0);

        let volume = ((snap.volume_ratio - 0.9) / 0.4).clamp(0.0, 1.0);

        let trend_alignment = match regime {
            Regime::TrendingUp => 1.0,
            Regime::Ranging => 0.45,
            _ => 0.0,
        };

        let total = (W_PULLBACK * pullback
            + W_RSI * rsi_recovery
            + W_MOMENTUM * momentum
            + W_VOLUME * volume
            + W_TREND * trend_alignment)
            .clamp(0.0, 1.0);

        SetupScore {
            pullback,
            rsi_recovery,
            momentum,
            volume,
            trend_alignment,
            total,
        }
    }

    /// Linear relaxation of the score floor after prolonged inactivity.
    pub fn effective_min_score(min_score: f64, idle_ms: i64) -> f64 {
        if idle_ms < IDLE_GRACE_MS {
            return min_score;
        }
        let progress = ((idle_ms - IDLE_GRACE_MS) as f64 / IDLE_RAMP_MS as f64).clamp(0.0, 1.0);
        min_score - IDLE_MAX_RELAX * progress
    }

    fn regime_penalty(regime: Regime) -> f64 {
        match regime {
            Regime::TrendingUp | Regime::TrendingDown => 0.0,
            Regime::Ranging => 0.05,
            Regime::HighVolatility => 0.12,
            Regime::Chop => 0.18,
        }
    }

    /// Determinism + robustness audit.
    ///
    /// * Determinism: 100 identical runs must agree on the action with a
    ///   confidence spread below 1e-12.
    /// * Robustness: 20 trials with closes perturbed by up to ±0.1 % must
    ///   preserve the baseline action on at least 60 % of trials.
    pub fn stability_audit(
        candles: &[Candle],
        params: &StrategyParameters,
        ctx: &DecisionContext,
    ) -> StabilityReport {
        let baseline = Self::decide(candles, params, ctx);

        let mut deterministic = true;
        let mut max_confidence_delta: f64 = 0.0;
        for _ in 0..100 {
            let run = Self::decide(candles, params, ctx);
            if run.action != baseline.action {
                deterministic = false;
            }
            max_confidence_delta =
                max_confidence_delta.max((run.confidence - baseline.confidence).abs());
        }

        let trials = 20;
        let mut agreements = 0;
        for trial in 0..trials {
            // Deterministic perturbation sweep across [-0.1%, +0.1%].
            let factor = 1.0 + ((trial as f64 / (trials - 1) as f64) * 2.0 - 1.0) * 0.001;
            let perturbed: Vec<Candle> = candles
                .iter()
                .map(|c| Candle {
                    open: c.open * factor,
                    high: c.high * factor,
                    low: c.low * factor,
                    close: c.close * factor,
                    ..c.clone()
                })
                .collect();
            if Self::decide(&perturbed, params, ctx).action == baseline.action {
                agreements += 1;
            }
        }

        StabilityReport {
            deterministic: deterministic && max_confidence_delta < 1e-12,
            max_confidence_delta,
            robustness_agreements: agreements,
            robustness_trials: trials,
        }
    }
}

/// Result of [`Refiner::stability_audit`].
#[derive(Debug, Clone, Serialize)]
pub struct StabilityReport {
    pub deterministic: bool,
    pub max_confidence_delta: f64,
    pub robustness_agreements: usize,
    pub robustness_trials: usize,
}

impl StabilityReport {
    pub fn is_robust(&self) -> bool {
        self.robustness_agreements * 10 >= self.robustness_trials * 6
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bar(ts: i64, close: f64) -> Candle {
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

    fn rising_candles(n: usize) -> Vec<Candle> {
        (0..n)
            .map(|i| bar(i as i64 * 60_000, 60_000.0 + 10.0 * i as f64))
            .collect()
    }

    fn ctx() -> DecisionContext {
        DecisionContext {
            has_holdings: false,
            idle_ms: 0,
            strategy_version: 1,
        }
    }

    #[test]
    fn insufficient_history_holds_at_low_confidence() {
        let candles = rising_candles(30);
        let d = Refiner::decide(&candles, &StrategyParameters::default(), &ctx());
        assert_eq!(d.action, Signal::Hold);
        assert!((d.confidence - 0.2).abs() < f64::EPSILON);
        assert!(d.reasons[0].contains("insufficient history"));
    }

    #[test]
    fn hundred_runs_are_bit_identical() {
        let candles = rising_candles(60);
        let params = StrategyParameters::default();
        let context = ctx();
        let report = Refiner::stability_audit(&candles, &params, &context);
        assert!(report.deterministic);
        assert_eq!(report.max_confidence_delta, 0.0);
    }

    #[test]
    fn perturbation_preserves_action_on_most_trials() {
        let candles = rising_candles(80);
        let report =
            Refiner::stability_audit(&candles, &StrategyParameters::default(), &ctx());
        assert!(
            report.is_robust(),
            "only {}/{} trials agreed",
            report.robustness_agreements,
            report.robustness_trials
        );
    }

    #[test]
    fn sell_requires_holdings() {
        // A falling market with high volatility should only SELL when the
        // context reports open holdings.
        let mut candles: Vec<Candle> = (0..80)
            .map(|i| bar(i as i64 * 60_000, 70_000.0 - 60.0 * i as f64))
            .collect();
        for c in &mut candles {
            c.high = c.close + 300.0;
            c.low = c.close - 300.0;
        }
        let params = StrategyParameters::default();

        let flat = Refiner::decide(&candles, &params, &ctx());
        assert_ne!(flat.action, Signal::Sell);

        let holding = DecisionContext {
            has_holdings: true,
            ..ctx()
        };
        let d = Refiner::decide(&candles, &params, &holding);
        assert_eq!(d.action, Signal::Sell);
    }

    #[test]
    fn buy_confidence_is_floored() {
        let candles = rising_candles(120);
        let relaxed = StrategyParameters {
            min_score: 0.5,
            ..StrategyParameters::default()
        };
        let d = Refiner::decide(&candles, &relaxed, &ctx());
        if d.action == Signal::Buy {
            assert!(d.confidence >= 0.62);
        }
        assert!(d.confidence <= 0.95);
    }

    #[test]
    fn idle_relaxation_ramps_linearly() {
        let base = 0.70;
        assert_eq!(Refiner::effective_min_score(base, 0), base);
        assert_eq!(Refiner::effective_min_score(base, IDLE_GRACE_MS - 1), base);
        let half = Refiner::effective_min_score(base, IDLE_GRACE_MS + IDLE_RAMP_MS / 2);
        assert!((half - (base - 0.04)).abs() < 1e-9);
        let full = Refiner::effective_min_score(base, IDLE_GRACE_MS + IDLE_RAMP_MS * 2);
        assert!((full - (base - 0.08)).abs() < 1e-9);
    }

    #[test]
    fn chop_regime_below_min_atr() {
        // Tiny ranges around a flat price give a near-zero atr_pct.
        let candles: Vec<Candle> = (0..80)
            .map(|i| {
                let close = 60_000.0 + (i % 2) as f64 * 0.5;
                Candle {
                    ts: i as i64 * 60_000,
                    close_ts: i as i64 * 60_000 + 59_999,
                    open: close,
                    high: close + 0.5,
                    low: close - 0.5,
                    close,
                    volume: 100.0,
                    is_closed: true,
                }
            })
            .collect();
        let d = Refiner::decide(&candles, &StrategyParameters::default(), &ctx());
        assert_eq!(d.regime, Regime::Chop);
        assert_eq!(d.action, Signal::Hold);
    }
}
