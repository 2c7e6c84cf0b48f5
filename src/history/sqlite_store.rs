// =============================================================================
// SQLite-backed history store — sqlx, one transaction per record
// =============================================================================
//
// Each table carries a small set of indexed columns for the queries the
// engine issues (idempotency lookups, recency scans) and the full record as
// a JSON payload, so the journal schema can evolve without migrations
// touching every column.
// =============================================================================

use anyhow::{Context, Result};
use async_trait::async_trait;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{Row, SqlitePool};
use std::str::FromStr;
use tracing::info;

use crate::history::{
    DecisionRecord, FillRecord, HistoryStore, OrderRecord, SnapshotRecord, TradeRecord,
};

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS decisions (
    id      TEXT PRIMARY KEY,
    ts      INTEGER NOT NULL,
    symbol  TEXT NOT NULL,
    payload TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_decisions_ts ON decisions (ts DESC);

CREATE TABLE IF NOT EXISTS orders (
    order_id        TEXT PRIMARY KEY,
    idempotency_key TEXT NOT NULL,
    status          TEXT NOT NULL,
    ts              INTEGER NOT NULL,
    payload         TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_orders_idem ON orders (idempotency_key);

CREATE TABLE IF NOT EXISTS fills (
    fill_id  TEXT PRIMARY KEY,
    order_id TEXT NOT NULL,
    ts       INTEGER NOT NULL,
    payload  TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS trades (
    id      TEXT PRIMARY KEY,
    ts      INTEGER NOT NULL,
    symbol  TEXT NOT NULL,
    payload TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_trades_ts ON trades (ts DESC);

CREATE TABLE IF NOT EXISTS snapshots (
    seq     INTEGER PRIMARY KEY AUTOINCREMENT,
    ts      INTEGER NOT NULL,
    symbol  TEXT NOT NULL,
    payload TEXT NOT NULL
);
"#;

/// SQLite-backed [`HistoryStore`].
pub struct SqliteHistoryStore {
    pool: SqlitePool,
}

impl SqliteHistoryStore {
    /// Connect and ensure the schema exists. A connection failure here is a
    /// fatal startup error (exit code 2 at the process boundary).
    pub async fn connect(url: &str) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(url)
            .context("invalid sqlite DATABASE_URL")?
            .create_if_missing(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(4)
            .connect_with(options)
            .await
            .context("failed to connect to sqlite")?;

        // Unprepared execute: the schema is multiple statements.
        use sqlx::Executor;
        pool.execute(SCHEMA)
            .await
            .context("failed to initialise history schema")?;

        info!(url, "sqlite history store connected");
        Ok(Self { pool })
    }

    fn payload<T: serde::Serialize>(record: &T) -> Result<String> {
        serde_json::to_string(record).context("failed to serialise record payload")
    }

    fn parse<T: serde::de::DeserializeOwned>(payload: &str) -> Result<T> {
        serde_json::from_str(payload).context("failed to parse record payload")
    }
}

#[async_trait]
impl HistoryStore for SqliteHistoryStore {
    async fn record_decision(&self, record: &DecisionRecord) -> Result<()> {
        // OR REPLACE: a replayed force-trade re-submits its decision id.
        sqlx::query("INSERT OR REPLACE INTO decisions (id, ts, symbol, payload) VALUES (?, ?, ?, ?)")
            .bind(&record.id)
            .bind(record.ts)
            .bind(&record.symbol)
            .bind(Self::payload(record)?)
            .execute(&self.pool)
            .await
            .context("failed to insert decision")?;
        Ok(())
    }

    async fn record_order(&self, record: &OrderRecord) -> Result<()> {
        sqlx::query(
            "INSERT INTO orders (order_id, idempotency_key, status, ts, payload) \
             VALUES (?, ?, ?, ?, ?)",
        )
        .bind(&record.order_id)
        .bind(&record.idempotency_key)
        .bind(record.status.to_string())
        .bind(record.ts)
        .bind(Self::payload(record)?)
        .execute(&self.pool)
        .await
        .context("failed to insert order")?;
        Ok(())
    }

    async fn record_fill(&self, record: &FillRecord) -> Result<()> {
        sqlx::query("INSERT INTO fills (fill_id, order_id, ts, payload) VALUES (?, ?, ?, ?)")
            .bind(&record.fill_id)
            .bind(&record.order_id)
            .bind(record.ts)
            .bind(Self::payload(record)?)
            .execute(&self.pool)
            .await
            .context("failed to insert fill")?;
        Ok(())
    }

    async fn record_trade(&self, record: &TradeRecord) -> Result<()> {
        sqlx::query("INSERT INTO trades (id, ts, symbol, payload) VALUES (?, ?, ?, ?)")
            .bind(&record.id)
            .bind(record.ts)
            .bind(&record.symbol)
            .bind(Self::payload(record)?)
            .execute(&self.pool)
            .await
            .context("failed to insert trade")?;
        Ok(())
    }

    async fn record_snapshot(&self, record: &SnapshotRecord) -> Result<()> {
        sqlx::query("INSERT INTO snapshots (ts, symbol, payload) VALUES (?, ?, ?)")
            .bind(record.ts)
            .bind(&record.symbol)
            .bind(Self::payload(record)?)
            .execute(&self.pool)
            .await
            .context("failed to insert snapshot")?;
        Ok(())
    }

    async fn find_active_order(&self, idempotency_key: &str) -> Result<Option<OrderRecord>> {
        let row = sqlx::query(
            "SELECT payload FROM orders \
             WHERE idempotency_key = ? AND status != 'SKIPPED' \
             ORDER BY ts DESC LIMIT 1",
        )
        .bind(idempotency_key)
        .fetch_optional(&self.pool)
        .await
        .context("idempotency lookup failed")?;

        row.map(|r| Self::parse(r.get::<String, _>("payload").as_str()))
            .transpose()
    }

    async fn recent_decisions(&self, limit: usize) -> Result<Vec<DecisionRecord>> {
        let rows = sqlx::query("SELECT payload FROM decisions ORDER BY ts DESC LIMIT ?")
            .bind(limit as i64)
            .fetch_all(&self.pool)
            .await
            .context("decision scan failed")?;
        rows.iter()
            .map(|r| Self::parse(r.get::<String, _>("payload").as_str()))
            .collect()
    }

    async fn recent_trades(&self, limit: usize) -> Result<Vec<TradeRecord>> {
        let rows = sqlx::query("SELECT payload FROM trades ORDER BY ts DESC LIMIT ?")
            .bind(limit as i64)
            .fetch_all(&self.pool)
            .await
            .context("trade scan failed")?;
        rows.iter()
            .map(|r| Self::parse(r.get::<String, _>("payload").as_str()))
            .collect()
    }

    async fn trades_since(&self, ts: i64) -> Result<Vec<TradeRecord>> {
        let rows = sqlx::query("SELECT payload FROM trades WHERE ts >= ? ORDER BY ts ASC")
            .bind(ts)
            .fetch_all(&self.pool)
            .await
            .context("trade range scan failed")?;
        rows.iter()
            .map(|r| Self::parse(r.get::<String, _>("payload").as_str()))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::history::idempotency_key;
    use crate::types::{OrderStatus, Side, Signal};
    use rust_decimal_macros::dec;

    async fn store() -> SqliteHistoryStore {
        SqliteHistoryStore::connect("sqlite::memory:").await.unwrap()
    }

    #[tokio::test]
    async fn decision_round_trips() {
        let s = store().await;
        let record = DecisionRecord {
            id: "d1".into(),
            ts: 10,
            symbol: "BTC-USDT".into(),
            timeframe: "1h".into(),
            inputs_hash: "hash".into(),
            signal: Signal::Buy,
            confidence: 0.7,
            reasons: vec!["r1".into()],
            model_version: 3,
            regime: None,
        };
        s.record_decision(&record).await.unwrap();
        let back = s.recent_decisions(5).await.unwrap();
        assert_eq!(back.len(), 1);
        assert_eq!(back[0].id, "d1");
        assert_eq!(back[0].signal, Signal::Buy);
        assert_eq!(back[0].model_version, 3);
    }

    #[tokio::test]
    async fn idempotency_lookup_ignores_skipped() {
        let s = store().await;
        let key = idempotency_key("BTC-USDT", "1h", 99, Side::Buy);
        let mut order = OrderRecord {
            order_id: "o1".into(),
            decision_id: "d1".into(),
            idempotency_key: key.clone(),
            symbol: "BTC-USDT".into(),
            side: Side::Buy,
            qty: dec!(0.5),
            requested_price: dec!(50000),
            status: OrderStatus::Skipped,
            ts: 1,
        };
        s.record_order(&order).await.unwrap();
        assert!(s.find_active_order(&key).await.unwrap().is_none());

        order.order_id = "o2".into();
        order.status = OrderStatus::Filled;
        order.ts = 2;
        s.record_order(&order).await.unwrap();
        let found = s.find_active_order(&key).await.unwrap().unwrap();
        assert_eq!(found.order_id, "o2");
        assert_eq!(found.qty, dec!(0.5));
    }
}
