use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use chrono::Utc;

use super::{ClientError, TradeClient};
use crate::models::{
    Candle, OrderRequest, OrderState, OrderStatus, OrderType, PositionSide, RemotePosition,
    TradeFill,
};

struct SimOrder {
    request: OrderRequest,
    state: OrderState,
    polls: u32,
}

struct SimState {
    price: f64,
    price_path: VecDeque<f64>,
    fee_rate: f64,
    candles: Vec<Candle>,
    position: Option<RemotePosition>,
    orders: HashMap<i64, SimOrder>,
    fills: HashMap<i64, Vec<TradeFill>>,
    cancels: HashMap<i64, u32>,
    next_order_id: i64,
    orders_placed: usize,
    leverage: Option<u32>,

    // Scripted behaviors for tests.
    partial_fill_parts: u32,
    limit_fill_after_polls: Option<u32>,
    market_orders_stuck: bool,
    fill_on_cancel: bool,
    ghost_orders: bool,
    fail_next_fetch_klines: bool,
}

/// Deterministic in-memory trade client.
///
/// Implements the full `TradeClient` contract against a scripted price path
/// and candle series; order fills, partial fills, cancel races, and position
/// emulation are all configurable from tests.
pub struct SimClient {
    inner: Mutex<SimState>,
}

impl SimClient {
    pub fn new(initial_price: f64, fee_rate: f64) -> Self {
        Self {
            inner: Mutex::new(SimState {
                price: initial_price,
                price_path: VecDeque::new(),
                fee_rate,
                candles: Vec::new(),
                position: None,
                orders: HashMap::new(),
                fills: HashMap::new(),
                cancels: HashMap::new(),
                next_order_id: 1,
                orders_placed: 0,
                leverage: None,
                partial_fill_parts: 1,
                limit_fill_after_polls: None,
                market_orders_stuck: false,
                fill_on_cancel: false,
                ghost_orders: false,
                fail_next_fetch_klines: false,
            }),
        }
    }

    // Test scripting surface.

    pub fn set_candles(&self, candles: Vec<Candle>) {
        self.inner.lock().unwrap().candles = candles;
    }

    pub fn set_price(&self, price: f64) {
        self.inner.lock().unwrap().price = price;
    }

    /// Prices returned by successive `fetch_price` calls; the last value
    /// sticks once the path is exhausted.
    pub fn set_price_path(&self, path: Vec<f64>) {
        self.inner.lock().unwrap().price_path = path.into();
    }

    /// Split every fill into this many equal partial executions.
    pub fn set_partial_fill_parts(&self, parts: u32) {
        self.inner.lock().unwrap().partial_fill_parts = parts.max(1);
    }

    /// Limit orders fill at their limit price after this many status polls.
    pub fn set_limit_fill_after_polls(&self, polls: u32) {
        self.inner.lock().unwrap().limit_fill_after_polls = Some(polls);
    }

    /// Market orders stay NEW forever (exercises poll exhaustion).
    pub fn set_market_orders_stuck(&self, stuck: bool) {
        self.inner.lock().unwrap().market_orders_stuck = stuck;
    }

    /// A cancelled order turns out to have filled already: the fill is
    /// recorded and the cancel reports "unknown order".
    pub fn set_fill_on_cancel(&self, enabled: bool) {
        self.inner.lock().unwrap().fill_on_cancel = enabled;
    }

    /// Orders fill but never produce an exchange position (exercises the
    /// fatal unconfirmed-order path).
    pub fn set_ghost_orders(&self, enabled: bool) {
        self.inner.lock().unwrap().ghost_orders = enabled;
    }

    /// The next `fetch_klines` call fails with a transient error.
    pub fn set_fail_next_fetch_klines(&self) {
        self.inner.lock().unwrap().fail_next_fetch_klines = true;
    }

    /// Force-fill a resting order at the given price (e.g. a stop trigger).
    pub fn trigger_order(&self, order_id: i64, price: f64) {
        let mut state = self.inner.lock().unwrap();
        fill_order(&mut state, order_id, price);
    }

    pub fn remove_position(&self) {
        self.inner.lock().unwrap().position = None;
    }

    pub fn set_position(&self, position: RemotePosition) {
        self.inner.lock().unwrap().position = Some(position);
    }

    pub fn orders_placed(&self) -> usize {
        self.inner.lock().unwrap().orders_placed
    }

    pub fn cancels_for(&self, order_id: i64) -> u32 {
        *self
            .inner
            .lock()
            .unwrap()
            .cancels
            .get(&order_id)
            .unwrap_or(&0)
    }

    pub fn leverage(&self) -> Option<u32> {
        self.inner.lock().unwrap().leverage
    }

    pub fn open_order_count(&self) -> usize {
        self.inner
            .lock()
            .unwrap()
            .orders
            .values()
            .filter(|o| {
                o.state.status == OrderStatus::New
                    || o.state.status == OrderStatus::PartiallyFilled
            })
            .count()
    }
}

/// Fill an order completely at `price`: record the trade fills (split into
/// the configured number of parts) and apply the position effect.
fn fill_order(state: &mut SimState, order_id: i64, price: f64) {
    let (closing, requested_qty, side, symbol, already_filled) = match state.orders.get(&order_id)
    {
        Some(o) => (
            o.request.reduce_only || o.request.close_position,
            o.request.quantity,
            o.request.side,
            o.request.symbol.clone(),
            o.state.status.is_filled(),
        ),
        None => return,
    };
    if already_filled {
        return;
    }

    // close_position stop orders carry no quantity; flatten whatever
    // position exists.
    let quantity = if requested_qty > 0.0 {
        requested_qty
    } else {
        state.position.as_ref().map(|p| p.quantity).unwrap_or(0.0)
    };

    // Position effect and realized pnl.
    let mut realized_pnl_total = 0.0;
    if closing {
        if let Some(position) = state.position.take() {
            let direction = match position.side {
                PositionSide::Long => 1.0,
                PositionSide::Short => -1.0,
                PositionSide::Zero => 0.0,
            };
            realized_pnl_total = (price - position.entry_price) * position.quantity * direction;
        }
    } else if !state.ghost_orders {
        let position_side = match side {
            crate::models::OrderSide::Buy => PositionSide::Long,
            crate::models::OrderSide::Sell => PositionSide::Short,
        };
        state.position = Some(RemotePosition {
            symbol,
            side: position_side,
            quantity,
            entry_price: price,
            mark_price: price,
            pnl: 0.0,
        });
    }

    if let Some(order) = state.orders.get_mut(&order_id) {
        order.state.status = OrderStatus::Filled;
        order.state.avg_price = price;
        order.state.executed_qty = quantity;
    }

    let parts = state.partial_fill_parts.max(1);
    let part_qty = quantity / parts as f64;
    let fee_rate = state.fee_rate;
    let fills = state.fills.entry(order_id).or_default();
    for _ in 0..parts {
        fills.push(TradeFill {
            order_id,
            price,
            quantity: part_qty,
            fee: fee_rate * price * part_qty,
            realized_pnl: realized_pnl_total / parts as f64,
            side,
            time: Utc::now(),
        });
    }
}

#[async_trait]
impl TradeClient for SimClient {
    async fn fetch_klines(
        &self,
        _symbol: &str,
        _timeframe: &str,
        limit: usize,
    ) -> Result<Vec<Candle>> {
        let mut state = self.inner.lock().unwrap();
        if state.fail_next_fetch_klines {
            state.fail_next_fetch_klines = false;
            return Err(anyhow!("simulated kline fetch failure"));
        }
        if state.candles.is_empty() {
            return Err(anyhow!("no candles scripted"));
        }
        let start = state.candles.len().saturating_sub(limit);
        let mut candles = state.candles[start..].to_vec();
        if let Some(last) = candles.last_mut() {
            last.current_price = state.price;
        }
        Ok(candles)
    }

    async fn fetch_price(&self, _symbol: &str) -> Result<f64> {
        let mut state = self.inner.lock().unwrap();
        if let Some(next) = state.price_path.pop_front() {
            state.price = next;
        }
        Ok(state.price)
    }

    async fn fetch_position(&self, _symbol: &str) -> Result<Option<RemotePosition>> {
        let mut state = self.inner.lock().unwrap();
        let price = state.price;
        if let Some(position) = state.position.as_mut() {
            let direction = match position.side {
                PositionSide::Long => 1.0,
                PositionSide::Short => -1.0,
                PositionSide::Zero => 0.0,
            };
            position.mark_price = price;
            position.pnl = (price - position.entry_price) * position.quantity * direction;
        }
        Ok(state.position.clone())
    }

    async fn set_leverage(&self, _symbol: &str, leverage: u32) -> Result<()> {
        self.inner.lock().unwrap().leverage = Some(leverage);
        Ok(())
    }

    async fn place_order(&self, request: &OrderRequest) -> Result<OrderState> {
        let mut state = self.inner.lock().unwrap();
        let order_id = state.next_order_id;
        state.next_order_id += 1;
        state.orders_placed += 1;

        let order_state = OrderState {
            order_id,
            symbol: request.symbol.clone(),
            status: OrderStatus::New,
            price: request.price.unwrap_or(0.0),
            avg_price: 0.0,
            executed_qty: 0.0,
        };
        state.orders.insert(
            order_id,
            SimOrder {
                request: request.clone(),
                state: order_state.clone(),
                polls: 0,
            },
        );

        // Market orders fill immediately at the current price unless stuck.
        if request.order_type == OrderType::Market && !state.market_orders_stuck {
            let price = state.price;
            fill_order(&mut state, order_id, price);
        }

        Ok(state.orders[&order_id].state.clone())
    }

    async fn fetch_order(&self, _symbol: &str, order_id: i64) -> Result<OrderState> {
        let mut state = self.inner.lock().unwrap();
        let fill_after = state.limit_fill_after_polls;
        let order = state
            .orders
            .get_mut(&order_id)
            .ok_or(ClientError::UnknownOrder(order_id))?;
        order.polls += 1;

        let should_fill = order.request.order_type == OrderType::Limit
            && order.state.status == OrderStatus::New
            && fill_after.is_some_and(|n| order.polls >= n);
        if should_fill {
            let price = order.state.price;
            fill_order(&mut state, order_id, price);
        }
        Ok(state.orders[&order_id].state.clone())
    }

    async fn cancel_order(&self, _symbol: &str, order_id: i64) -> Result<()> {
        let mut state = self.inner.lock().unwrap();
        *state.cancels.entry(order_id).or_insert(0) += 1;

        let (filled, price) = match state.orders.get(&order_id) {
            Some(o) => (o.state.status.is_filled(), o.state.price),
            None => return Err(ClientError::UnknownOrder(order_id).into()),
        };
        if filled {
            return Err(ClientError::UnknownOrder(order_id).into());
        }
        if state.fill_on_cancel {
            fill_order(&mut state, order_id, price);
            return Err(ClientError::UnknownOrder(order_id).into());
        }
        if let Some(order) = state.orders.get_mut(&order_id) {
            order.state.status = OrderStatus::Canceled;
        }
        Ok(())
    }

    async fn fetch_trades(&self, _symbol: &str, order_id: i64) -> Result<Vec<TradeFill>> {
        Ok(self
            .inner
            .lock()
            .unwrap()
            .fills
            .get(&order_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn wait(&self) {
        // The simulator never needs to pace itself.
        tokio::task::yield_now().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::OrderSide;

    #[tokio::test]
    async fn test_market_order_fills_and_opens_position() {
        let client = SimClient::new(100.0, 0.001);
        let ack = client
            .place_order(&OrderRequest::market("SOLUSDT", OrderSide::Buy, 2.0, false))
            .await
            .unwrap();
        assert!(ack.status.is_filled());

        let position = client.fetch_position("SOLUSDT").await.unwrap().unwrap();
        assert_eq!(position.side, PositionSide::Long);
        assert_eq!(position.entry_price, 100.0);
        assert_eq!(position.quantity, 2.0);
    }

    #[tokio::test]
    async fn test_reduce_only_fill_realizes_pnl() {
        let client = SimClient::new(100.0, 0.001);
        client
            .place_order(&OrderRequest::market("SOLUSDT", OrderSide::Buy, 2.0, false))
            .await
            .unwrap();

        client.set_price(110.0);
        let ack = client
            .place_order(&OrderRequest::market("SOLUSDT", OrderSide::Sell, 2.0, true))
            .await
            .unwrap();

        let fills = client.fetch_trades("SOLUSDT", ack.order_id).await.unwrap();
        let pnl: f64 = fills.iter().map(|f| f.realized_pnl).sum();
        assert!((pnl - 20.0).abs() < 1e-9);
        assert!(client.fetch_position("SOLUSDT").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_cancel_unknown_order_maps_to_client_error() {
        let client = SimClient::new(100.0, 0.001);
        let err = client.cancel_order("SOLUSDT", 42).await.unwrap_err();
        assert!(matches!(
            err.downcast_ref::<ClientError>(),
            Some(ClientError::UnknownOrder(42))
        ));
    }

    #[tokio::test]
    async fn test_price_path_sticks_at_last_value() {
        let client = SimClient::new(100.0, 0.001);
        client.set_price_path(vec![101.0, 102.0]);
        assert_eq!(client.fetch_price("SOLUSDT").await.unwrap(), 101.0);
        assert_eq!(client.fetch_price("SOLUSDT").await.unwrap(), 102.0);
        assert_eq!(client.fetch_price("SOLUSDT").await.unwrap(), 102.0);
    }
}
