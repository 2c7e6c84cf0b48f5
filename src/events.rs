// =============================================================================
// Typed event bus — one enum per event kind, broadcast to boot-time listeners
// =============================================================================
//
// Listeners subscribe once at boot; the subscriber set is never mutated at
// runtime. A bounded broadcast channel provides back-pressure: a slow
// listener lags and drops old events rather than growing memory.
// =============================================================================

use tokio::sync::broadcast;

use crate::types::{Regime, Signal};

/// Every event the engine publishes.
#[derive(Debug, Clone)]
pub enum EngineEvent {
    /// A closed bar arrived on a stream.
    MarketUpdate {
        symbol: String,
        lag_ms: i64,
        candle_close_ts: i64,
        close: f64,
    },
    /// The full indicator set for a symbol became (or stayed) ready.
    IndicatorUpdate {
        symbol: String,
        atr_pct: f64,
        rsi: f64,
    },
    /// An evaluation produced a decision.
    DecisionMade {
        symbol: String,
        signal: Signal,
        confidence: f64,
        regime: Regime,
    },
    /// A simulated fill committed to the ledger.
    TradeExecuted {
        symbol: String,
        trade_id: String,
    },
    /// The circuit breaker latched.
    BreakerTripped { reasons: Vec<String> },
}

/// Broadcast capacity. Sized for bursts of per-symbol closes in one tick.
const BUS_CAPACITY: usize = 256;

/// Thin wrapper over a broadcast channel. Cloning shares the same bus.
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<EngineEvent>,
}

impl EventBus {
    pub fn new() -> Self {
        let (tx, _rx) = broadcast::channel(BUS_CAPACITY);
        Self { tx }
    }

    /// Publish an event. Succeeds even with zero subscribers.
    pub fn publish(&self, event: EngineEvent) {
        let _ = self.tx.send(event);
    }

    /// Subscribe a new listener. Call at boot only.
    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.tx.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn publish_reaches_subscriber() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe();
        bus.publish(EngineEvent::MarketUpdate {
            symbol: "BTC-USDT".into(),
            lag_ms: 12,
            candle_close_ts: 1_700_000_059_999,
            close: 60_000.0,
        });
        match rx.recv().await.unwrap() {
            EngineEvent::MarketUpdate { symbol, lag_ms, .. } => {
                assert_eq!(symbol, "BTC-USDT");
                assert_eq!(lag_ms, 12);
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[test]
    fn publish_without_subscribers_is_ok() {
        let bus = EventBus::new();
        bus.publish(EngineEvent::BreakerTripped {
            reasons: vec!["stream unstable".into()],
        });
    }
}
