use std::sync::Arc;

use anyhow::{bail, Context, Result};
use tokio::time::{sleep, Duration};

use crate::client::{ClientError, TradeClient};
use crate::config::BotConfig;
use crate::models::{FillSummary, OrderRequest, OrderSide, OrderState, PositionSide, TradeFill};

/// Which exit order produced a fill.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitTrigger {
    TakeProfit,
    StopLoss,
}

impl std::fmt::Display for ExitTrigger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ExitTrigger::TakeProfit => write!(f, "take-profit"),
            ExitTrigger::StopLoss => write!(f, "stop-loss"),
        }
    }
}

/// A confirmed exit-order fill and the order that produced it.
#[derive(Debug, Clone)]
pub struct ExitFill {
    pub trigger: ExitTrigger,
    pub summary: FillSummary,
}

/// Aggregate every raw fill of one order into a normalized summary:
/// volume-weighted average price, summed fee, summed realized pnl.
pub fn aggregate_fills(fills: &[TradeFill]) -> Option<FillSummary> {
    let total_qty: f64 = fills.iter().map(|f| f.quantity).sum();
    if fills.is_empty() || total_qty <= 0.0 {
        return None;
    }

    let price = fills.iter().map(|f| f.price * f.quantity).sum::<f64>() / total_qty;
    Some(FillSummary {
        price,
        fee: fills.iter().map(|f| f.fee).sum(),
        realized_pnl: fills.iter().map(|f| f.realized_pnl).sum(),
        side: fills[0].side,
    })
}

/// Turns a desired side + reduce-only flag into a confirmed fill.
///
/// Market orders settle, then get polled on a fixed interval. Limit orders
/// are chased: re-placed at the current market price whenever it moves away
/// from the resting order, never crossing the spread aggressively — at the
/// cost of potentially never filling in a fast market.
pub struct OrderExecutionCoordinator {
    config: Arc<BotConfig>,
    client: Arc<dyn TradeClient>,
}

impl OrderExecutionCoordinator {
    pub fn new(config: Arc<BotConfig>, client: Arc<dyn TradeClient>) -> Self {
        Self { config, client }
    }

    /// Execute an order of the configured entry order type and return the
    /// aggregated fill.
    pub async fn execute(&self, side: OrderSide, reduce_only: bool) -> Result<FillSummary> {
        match self.config.order_type {
            crate::models::OrderType::Limit => self.chase_limit_fill(side, reduce_only).await,
            _ => self.market_fill(side, reduce_only).await,
        }
    }

    /// Place a market order, wait for it to settle, then poll until FILLED
    /// (bounded by `fill_poll_max_attempts`).
    async fn market_fill(&self, side: OrderSide, reduce_only: bool) -> Result<FillSummary> {
        let request = OrderRequest::market(
            &self.config.symbol,
            side,
            self.config.quantity,
            reduce_only,
        );
        let ack = self
            .client
            .place_order(&request)
            .await
            .context("failed to place market order")?;
        tracing::debug!("Placed market order {} ({})", ack.order_id, side.as_str());

        sleep(Duration::from_secs(self.config.order_settle_secs)).await;

        let mut attempts = 0u32;
        loop {
            let state = self
                .client
                .fetch_order(&self.config.symbol, ack.order_id)
                .await?;
            if state.status.is_filled() {
                break;
            }
            attempts += 1;
            if attempts >= self.config.fill_poll_max_attempts {
                bail!(
                    "order {} not filled after {} polls (status {:?})",
                    ack.order_id,
                    attempts,
                    state.status
                );
            }
            sleep(Duration::from_secs(self.config.fill_poll_secs)).await;
        }

        self.fill_summary(ack.order_id).await
    }

    /// Chase the market with a limit order: whenever the market price moves
    /// off the price of the resting order, cancel and re-place at the new
    /// price; otherwise keep waiting on the resting order.
    async fn chase_limit_fill(&self, side: OrderSide, reduce_only: bool) -> Result<FillSummary> {
        let mut working: Option<(i64, f64)> = None;
        let mut replacements = 0u32;

        loop {
            let market_price = self.client.fetch_price(&self.config.symbol).await?;
            let needs_replacement = match working {
                Some((_, placed_at)) => market_price != placed_at,
                None => true,
            };

            if needs_replacement {
                if let Some((order_id, _)) = working.take() {
                    self.cancel_order_tolerant(order_id).await?;
                    // The order may have filled between our last poll and
                    // the cancel; check before replacing.
                    if let Some(state) = self.fetch_order_tolerant(order_id).await? {
                        if state.status.is_filled() {
                            return self.fill_summary(order_id).await;
                        }
                    }

                    // The initial placement is free; only re-placements
                    // count against the bound.
                    if replacements >= self.config.chase_max_replacements {
                        bail!(
                            "limit chase abandoned after {} re-placements without a fill",
                            replacements
                        );
                    }
                    replacements += 1;
                }

                let request = OrderRequest::limit(
                    &self.config.symbol,
                    side,
                    self.config.quantity,
                    market_price,
                    reduce_only,
                );
                let ack = self.client.place_order(&request).await?;
                tracing::debug!(
                    "Chasing: limit order {} re-placed at {:.4}",
                    ack.order_id,
                    market_price
                );
                working = Some((ack.order_id, market_price));
            }

            sleep(Duration::from_secs(self.config.fill_poll_secs)).await;

            if let Some((order_id, _)) = working {
                if let Some(state) = self.fetch_order_tolerant(order_id).await? {
                    if state.status.is_filled() {
                        return self.fill_summary(order_id).await;
                    }
                }
            }
        }
    }

    /// Reduce-only limit order at the take-profit price.
    pub async fn place_take_profit(
        &self,
        side: PositionSide,
        quantity: f64,
        tp_price: f64,
    ) -> Result<i64> {
        let order_side = side
            .exit_order_side()
            .context("cannot place take-profit for a ZERO side")?;
        let request = OrderRequest::limit(&self.config.symbol, order_side, quantity, tp_price, true);
        let ack = self
            .client
            .place_order(&request)
            .await
            .context("failed to place take-profit order")?;
        tracing::info!("Placed take-profit order {} at {:.4}", ack.order_id, tp_price);
        Ok(ack.order_id)
    }

    /// Close-position stop-market order at the stop-loss price.
    pub async fn place_stop_loss(&self, side: PositionSide, sl_price: f64) -> Result<i64> {
        let order_side = side
            .exit_order_side()
            .context("cannot place stop-loss for a ZERO side")?;
        let request = OrderRequest::stop_market_close(&self.config.symbol, order_side, sl_price);
        let ack = self
            .client
            .place_order(&request)
            .await
            .context("failed to place stop-loss order")?;
        tracing::info!("Placed stop-loss order {} at {:.4}", ack.order_id, sl_price);
        Ok(ack.order_id)
    }

    /// Single-pass fill check on the exit orders. SL is checked first; the
    /// moment either is observed FILLED, the other is cancelled so at most
    /// one exit order can ever execute.
    pub async fn poll_exit_orders(
        &self,
        tp_order_id: Option<i64>,
        sl_order_id: Option<i64>,
    ) -> Result<Option<ExitFill>> {
        if let Some(sl_id) = sl_order_id {
            let filled = self
                .fetch_order_tolerant(sl_id)
                .await?
                .is_some_and(|state| state.status.is_filled());
            if filled {
                if let Some(tp_id) = tp_order_id {
                    self.cancel_order_tolerant(tp_id).await?;
                }
                return Ok(Some(ExitFill {
                    trigger: ExitTrigger::StopLoss,
                    summary: self.fill_summary(sl_id).await?,
                }));
            }
        }

        if let Some(tp_id) = tp_order_id {
            let filled = self
                .fetch_order_tolerant(tp_id)
                .await?
                .is_some_and(|state| state.status.is_filled());
            if filled {
                if let Some(sl_id) = sl_order_id {
                    self.cancel_order_tolerant(sl_id).await?;
                }
                return Ok(Some(ExitFill {
                    trigger: ExitTrigger::TakeProfit,
                    summary: self.fill_summary(tp_id).await?,
                }));
            }
        }

        Ok(None)
    }

    /// Fetch an order's state, treating "unknown order" as no state at all:
    /// exchanges purge finished orders, and a purged order can never report
    /// a fill.
    async fn fetch_order_tolerant(&self, order_id: i64) -> Result<Option<OrderState>> {
        match self.client.fetch_order(&self.config.symbol, order_id).await {
            Ok(state) => Ok(Some(state)),
            Err(e) => match e.downcast_ref::<ClientError>() {
                Some(ClientError::UnknownOrder(_)) => {
                    tracing::debug!(
                        "Order {} unknown to the exchange, treating as not filled",
                        order_id
                    );
                    Ok(None)
                }
                _ => Err(e),
            },
        }
    }

    /// Cancel an order, treating "unknown order" as a no-op: exchanges
    /// routinely report that for orders that filled between our last status
    /// check and the cancel attempt.
    pub async fn cancel_order_tolerant(&self, order_id: i64) -> Result<()> {
        match self.client.cancel_order(&self.config.symbol, order_id).await {
            Ok(()) => Ok(()),
            Err(e) => match e.downcast_ref::<ClientError>() {
                Some(ClientError::UnknownOrder(_)) => {
                    tracing::debug!("Cancel of order {} was a no-op (already gone)", order_id);
                    Ok(())
                }
                _ => Err(e),
            },
        }
    }

    /// Fetch and aggregate every trade fill belonging to an order.
    async fn fill_summary(&self, order_id: i64) -> Result<FillSummary> {
        let fills = self
            .client
            .fetch_trades(&self.config.symbol, order_id)
            .await?;
        aggregate_fills(&fills)
            .with_context(|| format!("no trade fills recorded for order {order_id}"))
    }
}
