// =============================================================================
// History — append-only journals for decisions, orders, fills, trades and
// position snapshots, plus the idempotency index
// =============================================================================
//
// The core depends only on the `HistoryStore` trait. Two implementations are
// selected at startup:
//   * `SqliteHistoryStore` when `DATABASE_URL` is a `sqlite:` URL,
//   * `FileHistoryStore` (JSONL journals under the data dir) otherwise.
//
// Write ordering contract (per symbol): Decision -> Order -> Fill ->
// PositionSnapshot. FILLED fills are only recorded after the ledger
// mutation. Replays are made safe by the idempotency key
// `symbol|timeframe|decision_ts|side`: a non-SKIPPED order already holding
// the key turns any retry into a SKIPPED record with zero ledger effect.
// =============================================================================

pub mod file_store;
pub mod sqlite_store;

use anyhow::Result;
use async_trait::async_trait;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::execution::ExecutionSimulation;
use crate::types::{ExitReason, OrderStatus, Regime, Side, Signal};

/// Stable key preventing duplicate side-effects on retry or restart.
pub fn idempotency_key(symbol: &str, timeframe: &str, decision_ts: i64, side: Side) -> String {
    format!("{symbol}|{timeframe}|{decision_ts}|{side}")
}

// =============================================================================
// Journal records
// =============================================================================

/// One record per evaluation tick.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DecisionRecord {
    pub id: String,
    pub ts: i64,
    pub symbol: String,
    pub timeframe: String,
    /// SHA-256 over the evaluation inputs, for audit reproducibility.
    pub inputs_hash: String,
    pub signal: Signal,
    pub confidence: f64,
    pub reasons: Vec<String>,
    pub model_version: u64,
    #[serde(default)]
    pub regime: Option<Regime>,
}

/// One record per submitted order (including skips and rejections).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderRecord {
    pub order_id: String,
    pub decision_id: String,
    pub idempotency_key: String,
    pub symbol: String,
    pub side: Side,
    pub qty: Decimal,
    pub requested_price: Decimal,
    pub status: OrderStatus,
    pub ts: i64,
}

/// Exactly one FILLED fill per FILLED order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FillRecord {
    pub fill_id: String,
    pub order_id: String,
    pub avg_price: Decimal,
    pub qty: Decimal,
    pub fees: Decimal,
    pub status: OrderStatus,
    pub ts: i64,
}

/// One record per executed (simulated) trade.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TradeRecord {
    pub id: String,
    pub symbol: String,
    pub side: Side,
    pub price: Decimal,
    pub amount: Decimal,
    pub ts: i64,
    pub fee: Decimal,
    /// Present on every SELL.
    #[serde(default)]
    pub pnl: Option<Decimal>,
    #[serde(default)]
    pub r_multiple: Option<f64>,
    #[serde(default)]
    pub exit_reason: Option<ExitReason>,
    pub simulation: ExecutionSimulation,
    pub decision_id: String,
    /// Entry conditions carried for walk-forward re-filtering.
    #[serde(default)]
    pub entry_score: f64,
    #[serde(default)]
    pub entry_atr_pct: f64,
    #[serde(default)]
    pub regime: Option<Regime>,
    #[serde(default)]
    pub strategy_version: u64,
    /// Set when the trade was a leg (or hedge) of an arbitrage execution.
    #[serde(default)]
    pub arbitrage_id: Option<String>,
}

/// Periodic account snapshot, written after each fill.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapshotRecord {
    pub ts: i64,
    pub symbol: String,
    pub balance: Decimal,
    pub position_size: Decimal,
    pub avg_entry_price: Decimal,
    pub total_portfolio_value: Decimal,
}

// =============================================================================
// Store trait
// =============================================================================

/// Durable, append-only journal store. All writes must be visible to
/// subsequent reads from any task once the call returns.
#[async_trait]
pub trait HistoryStore: Send + Sync {
    async fn record_decision(&self, record: &DecisionRecord) -> Result<()>;
    async fn record_order(&self, record: &OrderRecord) -> Result<()>;
    async fn record_fill(&self, record: &FillRecord) -> Result<()>;
    async fn record_trade(&self, record: &TradeRecord) -> Result<()>;
    async fn record_snapshot(&self, record: &SnapshotRecord) -> Result<()>;

    /// The non-SKIPPED order holding this idempotency key, if any.
    async fn find_active_order(&self, idempotency_key: &str) -> Result<Option<OrderRecord>>;

    /// Newest-first decision records.
    async fn recent_decisions(&self, limit: usize) -> Result<Vec<DecisionRecord>>;
    /// Newest-first trade records.
    async fn recent_trades(&self, limit: usize) -> Result<Vec<TradeRecord>>;
    /// All trades at or after `ts`, chronological.
    async fn trades_since(&self, ts: i64) -> Result<Vec<TradeRecord>>;
}

/// Store-initialization failure. Distinct from config errors so main.rs can
/// exit with code 2 per the process contract.
#[derive(Debug)]
pub struct StoreInitError(pub String);

impl std::fmt::Display for StoreInitError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "history store error: {}", self.0)
    }
}

impl std::error::Error for StoreInitError {}

/// Select and open the history store from configuration.
pub async fn open_store(
    database_url: Option<&str>,
    data_dir: &str,
) -> Result<std::sync::Arc<dyn HistoryStore>, StoreInitError> {
    match database_url {
        Some(url) if url.starts_with("sqlite:") => {
            let store = sqlite_store::SqliteHistoryStore::connect(url)
                .await
                .map_err(|e| StoreInitError(format!("sqlite unreachable: {e}")))?;
            Ok(std::sync::Arc::new(store))
        }
        Some(url) => Err(StoreInitError(format!(
            "unsupported DATABASE_URL scheme: {url}"
        ))),
        None => {
            let store = file_store::FileHistoryStore::open(std::path::Path::new(data_dir))
                .map_err(|e| StoreInitError(format!("journal dir unusable: {e}")))?;
            Ok(std::sync::Arc::new(store))
        }
    }
}
