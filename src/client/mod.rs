// Exchange client: contract plus the live and offline implementations.
pub mod binance;
pub mod sim;

use anyhow::Result;
use async_trait::async_trait;
use thiserror::Error;

use crate::models::{Candle, OrderRequest, OrderState, RemotePosition, TradeFill};

pub use binance::BinanceFuturesClient;
pub use sim::SimClient;

/// Client failures the engine matches on. Everything else travels as a
/// plain `anyhow` error and is treated as transient.
#[derive(Debug, Error)]
pub enum ClientError {
    /// The exchange does not know the order — typically because it filled
    /// or was cancelled between our last status check and this request.
    #[error("unknown order {0}")]
    UnknownOrder(i64),
    #[error("exchange rejected request: {0}")]
    Rejected(String),
}

/// Contract every exchange backend must satisfy. One instance per bot;
/// all calls inside a tick are awaited to completion before the next call.
#[async_trait]
pub trait TradeClient: Send + Sync {
    /// Candle series, oldest first. The last row's `current_price` carries
    /// the live ticker price; all other rows mirror their close.
    async fn fetch_klines(&self, symbol: &str, timeframe: &str, limit: usize)
        -> Result<Vec<Candle>>;

    /// Live ticker price.
    async fn fetch_price(&self, symbol: &str) -> Result<f64>;

    /// The exchange's authoritative position for `symbol`, `None` if flat.
    async fn fetch_position(&self, symbol: &str) -> Result<Option<RemotePosition>>;

    async fn set_leverage(&self, symbol: &str, leverage: u32) -> Result<()>;

    async fn place_order(&self, request: &OrderRequest) -> Result<OrderState>;

    async fn fetch_order(&self, symbol: &str, order_id: i64) -> Result<OrderState>;

    /// Fails with [`ClientError::UnknownOrder`] when the exchange no longer
    /// knows the order; callers that tolerate that treat it as a no-op.
    async fn cancel_order(&self, symbol: &str, order_id: i64) -> Result<()>;

    /// Raw fills belonging to one order id.
    async fn fetch_trades(&self, symbol: &str, order_id: i64) -> Result<Vec<TradeFill>>;

    /// Inter-tick wait: sleeps a bounded-random duration below the
    /// configured maximum, staggering bots against each other.
    async fn wait(&self);
}
