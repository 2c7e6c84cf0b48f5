// =============================================================================
// Execution Simulator — deterministic spread / slippage / fee fill model
// =============================================================================
//
// No order ever reaches a venue. Fills are synthesised from the last close
// and current volatility:
//
//   spread   = close * (0.00015 + min(0.001, 0.18 * atr_pct))
//   slippage = close * (0.00005 + 0.08 * atr_pct + 0.0002 * hash_unit)
//   fill     = close + dir * (spread / 2 + slippage)   dir = +1 BUY, -1 SELL
//   fees     = fee_rate * fill * qty
//
// `hash_unit` is derived from SHA-256 of `symbol|ts|side`, so a given
// (symbol, bar, side) always fills at the same price — replays and the
// idempotency layer see identical simulations.
// =============================================================================

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::types::Side;

/// Full record of one simulated fill, embedded in the Trade journal.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionSimulation {
    pub side: Side,
    pub requested_price: f64,
    pub spread: f64,
    pub slippage: f64,
    pub fill_price: f64,
    pub fee_rate: f64,
    pub fees: f64,
    /// The deterministic noise input, kept for audit.
    pub hash_unit: f64,
}

/// Realized result of closing a slice against its entry.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct ExitOutcome {
    pub pnl: f64,
    pub r_multiple: f64,
}

pub struct ExecutionSimulator;

impl ExecutionSimulator {
    /// Map `symbol|ts|side` onto a stable unit float in [0, 1).
    pub fn hash_unit(symbol: &str, ts: i64, side: Side) -> f64 {
        let mut hasher = Sha256::new();
        hasher.update(symbol.as_bytes());
        hasher.update(b"|");
        hasher.update(ts.to_be_bytes());
        hasher.update(b"|");
        hasher.update(side.to_string().as_bytes());
        let digest = hasher.finalize();
        let mut bytes = [0u8; 8];
        bytes.copy_from_slice(&digest[..8]);
        u64::from_be_bytes(bytes) as f64 / (u64::MAX as f64 + 1.0)
    }

    /// Simulate a fill at the given close under the given volatility.
    pub fn simulate(
        symbol: &str,
        ts: i64,
        side: Side,
        close: f64,
        atr_pct: f64,
        qty: f64,
        fee_rate: f64,
    ) -> ExecutionSimulation {
        let atr_pct = atr_pct.max(0.0);
        let hash_unit = Self::hash_unit(symbol, ts, side);

        let spread = close * (0.00015 + (0.18 * atr_pct).min(0.001));
        let slippage = close * (0.00005 + 0.08 * atr_pct + 0.0002 * hash_unit);
        let fill_price = close + side.direction() * (spread / 2.0 + slippage);
        let fees = fee_rate * fill_price * qty;

        ExecutionSimulation {
            side,
            requested_price: close,
            spread,
            slippage,
            fill_price,
            fee_rate,
            fees,
            hash_unit,
        }
    }

    /// Realized PnL and R-multiple for a closed long slice.
    ///
    /// `entry_fee` and `exit_fee` are the fees attributable to this slice
    /// (per-unit fee * qty on the entry side).
    pub fn exit_outcome(
        entry_price: f64,
        exit_fill: f64,
        qty: f64,
        entry_fee: f64,
        exit_fee: f64,
        initial_risk_per_unit: f64,
    ) -> ExitOutcome {
        let pnl = (exit_fill - entry_price) * qty - entry_fee - exit_fee;
        let risk = initial_risk_per_unit * qty;
        let r_multiple = if risk > 0.0 { pnl / risk } else { 0.0 };
        ExitOutcome { pnl, r_multiple }
    }
}
