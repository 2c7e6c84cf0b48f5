// =============================================================================
// Market — candles, venue adapters, REST clients and the kline stream
// =============================================================================

pub mod adapter;
pub mod candle;
pub mod kucoin;
pub mod rest;
pub mod stream;

pub use candle::{Candle, CandleKey, CandleRing};
pub use stream::{ClosedBar, MarketStream};
