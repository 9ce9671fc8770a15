use std::sync::Arc;

use anyhow::{bail, Context, Result};
use thiserror::Error;

use super::coordinator::OrderExecutionCoordinator;
use crate::client::TradeClient;
use crate::config::BotConfig;
use crate::ledger::{CloseEvent, OpenEvent, PositionLedger};
use crate::models::{Candle, PositionSide, RemotePosition};
use crate::strategy::SignalProvider;

/// Errors the run loop must treat as fatal rather than retry.
#[derive(Debug, Error)]
pub enum EngineError {
    /// An entry order was accepted and filled, yet the exchange reports no
    /// position. Local and remote state cannot be reconciled automatically;
    /// a human has to look.
    #[error("order accepted but no position reported by exchange for {symbol}")]
    UnconfirmedOrder { symbol: String },
}

/// What reconciliation decided to do with the ledger before this tick acts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconcileAction {
    /// Local and remote agree; nothing to do.
    Keep,
    /// Ledger says open, exchange says flat, no exit orders working: the
    /// position vanished out-of-band. Drop it without a trade record.
    ClearDrift,
    /// Exchange says open, ledger says flat: track the untracked position.
    Adopt,
    /// Both say open: cross-check the fields, warn on mismatch.
    Verify,
    /// Ledger says open, exchange says flat, but exit orders are working:
    /// one of them likely filled. Let the exit-order monitor decide.
    Defer,
}

/// Decide the reconciliation step from the two views of the position.
pub fn reconcile_action(
    remote_open: bool,
    ledger_open: bool,
    has_exit_orders: bool,
) -> ReconcileAction {
    match (remote_open, ledger_open) {
        (false, false) => ReconcileAction::Keep,
        (false, true) if has_exit_orders => ReconcileAction::Defer,
        (false, true) => ReconcileAction::ClearDrift,
        (true, false) => ReconcileAction::Adopt,
        (true, true) => ReconcileAction::Verify,
    }
}

/// The per-tick state machine.
///
/// Each tick re-derives what to do from the exchange's view of the position
/// and the ledger's: reconcile the two, then either hunt for an entry,
/// supervise the open position, or monitor working exit orders. The ledger
/// is checkpointed at the end of every tick that leaves a position open.
pub struct ExecutionEngine {
    config: Arc<BotConfig>,
    client: Arc<dyn TradeClient>,
    strategy: Arc<dyn SignalProvider>,
    coordinator: OrderExecutionCoordinator,
    ledger: PositionLedger,
}

impl ExecutionEngine {
    pub fn new(
        config: Arc<BotConfig>,
        client: Arc<dyn TradeClient>,
        strategy: Arc<dyn SignalProvider>,
        ledger: PositionLedger,
    ) -> Self {
        let coordinator = OrderExecutionCoordinator::new(config.clone(), client.clone());
        Self {
            config,
            client,
            strategy,
            coordinator,
            ledger,
        }
    }

    pub fn ledger(&self) -> &PositionLedger {
        &self.ledger
    }

    /// One full pass of the state machine.
    pub async fn tick(&mut self) -> Result<()> {
        let candles = self
            .client
            .fetch_klines(
                &self.config.symbol,
                &self.config.timeframe,
                self.config.timeframe_limit,
            )
            .await
            .with_context(|| format!("failed to fetch {} klines", self.config.symbol))?;
        if candles.is_empty() {
            bail!("exchange returned no klines for {}", self.config.symbol);
        }

        let remote = self
            .client
            .fetch_position(&self.config.symbol)
            .await
            .with_context(|| format!("failed to fetch {} position", self.config.symbol))?;

        self.reconcile(remote.as_ref(), &candles);

        match remote {
            None if self.ledger.has_exit_orders() => self.monitor_exit_orders(&candles).await?,
            None => self.try_open(&candles).await?,
            Some(position) => self.supervise(&candles, &position).await?,
        }

        if self.ledger.is_open() {
            self.ledger.checkpoint()?;
        }
        Ok(())
    }

    /// Bring the ledger in line with the exchange before acting.
    fn reconcile(&mut self, remote: Option<&RemotePosition>, candles: &[Candle]) {
        let action = reconcile_action(
            remote.is_some(),
            self.ledger.is_open(),
            self.ledger.has_exit_orders(),
        );
        match action {
            ReconcileAction::Keep | ReconcileAction::Defer => {}
            ReconcileAction::ClearDrift => {
                tracing::warn!(
                    "{} position exists locally but not on the exchange; clearing",
                    self.config.symbol
                );
                self.ledger.clear_position();
            }
            ReconcileAction::Adopt => {
                if let Some(remote) = remote {
                    tracing::warn!(
                        "Adopting untracked {} {} position (entry {:.4})",
                        remote.symbol,
                        remote.side,
                        remote.entry_price
                    );
                    self.ledger.open_position(OpenEvent {
                        side: remote.side,
                        quantity: remote.quantity,
                        entry_price: remote.entry_price,
                        open_candle: candle_stamp(candles),
                        open_reason: "adopted from exchange position".to_string(),
                        open_fee: 0.0,
                    });
                }
            }
            ReconcileAction::Verify => {
                if let (Some(remote), Some(local)) = (remote, self.ledger.position()) {
                    if remote.side != local.side {
                        tracing::warn!(
                            "{} side mismatch: exchange {} vs ledger {}",
                            self.config.symbol,
                            remote.side,
                            local.side
                        );
                    }
                    if (remote.entry_price - local.entry_price).abs() > 1e-9 {
                        tracing::warn!(
                            "{} entry price mismatch: exchange {:.4} vs ledger {:.4}",
                            self.config.symbol,
                            remote.entry_price,
                            local.entry_price
                        );
                    }
                }
            }
        }
    }

    /// No position anywhere: ask the strategy whether to open one.
    async fn try_open(&mut self, candles: &[Candle]) -> Result<()> {
        let signal = self.strategy.should_open(candles, &self.ledger)?;
        let Some(order_side) = signal.side.entry_order_side() else {
            tracing::debug!("{}: no entry ({})", self.config.symbol, signal.reason);
            return Ok(());
        };

        tracing::info!(
            "🟢 {} entry signal: {} ({})",
            self.config.symbol,
            signal.side,
            signal.reason
        );
        let fill = self.coordinator.execute(order_side, false).await?;

        // The fill alone is not proof: the exchange must also report the
        // position before the ledger records it.
        let remote = self
            .client
            .fetch_position(&self.config.symbol)
            .await
            .context("failed to confirm position after entry order")?;
        let Some(remote) = remote else {
            return Err(EngineError::UnconfirmedOrder {
                symbol: self.config.symbol.clone(),
            }
            .into());
        };

        self.ledger.open_position(OpenEvent {
            side: signal.side,
            quantity: remote.quantity,
            entry_price: fill.price,
            open_candle: candle_stamp(candles),
            open_reason: signal.reason,
            open_fee: fill.fee,
        });

        if self.config.tp_enabled || self.config.sl_enabled {
            self.place_exit_orders(candles, signal.side, fill.price, remote.quantity)
                .await;
        }
        Ok(())
    }

    /// Place TP/SL orders for a freshly opened position. Failures here are
    /// logged, not raised: the position is live either way, and the exit
    /// signal path still protects it.
    async fn place_exit_orders(
        &mut self,
        candles: &[Candle],
        side: PositionSide,
        entry_price: f64,
        quantity: f64,
    ) {
        let (tp_price, sl_price) = match self.strategy.calculate_tp_sl(candles, side, entry_price)
        {
            Ok(prices) => prices,
            Err(e) => {
                tracing::warn!("TP/SL pricing failed, exits not placed: {e:#}");
                return;
            }
        };

        if self.config.tp_enabled {
            match self
                .coordinator
                .place_take_profit(side, quantity, tp_price)
                .await
            {
                Ok(order_id) => self.ledger.set_tp_order(order_id, tp_price),
                Err(e) => tracing::warn!("take-profit placement failed: {e:#}"),
            }
        }
        if self.config.sl_enabled {
            match self.coordinator.place_stop_loss(side, sl_price).await {
                Ok(order_id) => self.ledger.set_sl_order(order_id, sl_price),
                Err(e) => tracing::warn!("stop-loss placement failed: {e:#}"),
            }
        }
    }

    /// Exchange says flat while exit orders are working: one of them likely
    /// closed the position. Find which, record the close; if neither filled,
    /// the position vanished some other way and the leftovers are cancelled.
    async fn monitor_exit_orders(&mut self, candles: &[Candle]) -> Result<()> {
        let exit = self
            .coordinator
            .poll_exit_orders(self.ledger.tp_order_id(), self.ledger.sl_order_id())
            .await?;

        match exit {
            Some(fill) => {
                tracing::info!(
                    "🎯 {} {} order filled at {:.4}",
                    self.config.symbol,
                    fill.trigger,
                    fill.summary.price
                );
                self.ledger.clear_tp_sl_orders();
                self.ledger.close_position(CloseEvent {
                    close_price: fill.summary.price,
                    close_candle: candle_stamp(candles),
                    close_reason: format!("{} order filled", fill.trigger),
                    close_fee: fill.summary.fee,
                    pnl: fill.summary.realized_pnl,
                })?;
            }
            None => {
                tracing::warn!(
                    "{} position gone without an exit-order fill; cancelling leftovers",
                    self.config.symbol
                );
                self.cancel_exit_orders().await?;
                self.ledger.clear_position();
            }
        }
        Ok(())
    }

    /// Position is open on the exchange: track pnl and hunt for an exit.
    async fn supervise(&mut self, candles: &[Candle], remote: &RemotePosition) -> Result<()> {
        self.ledger.update_pnl(remote.pnl);

        let signal = self.strategy.should_close(candles, &self.ledger)?;
        if signal.side != PositionSide::Zero {
            tracing::debug!("{}: holding ({})", self.config.symbol, signal.reason);
            return Ok(());
        }

        tracing::info!(
            "🔴 {} exit signal: {}",
            self.config.symbol,
            signal.reason
        );

        // Exit orders must be gone before the closing order goes in, or a
        // late TP/SL fill could flip the account into a fresh position.
        self.cancel_exit_orders().await?;
        self.ledger.clear_tp_sl_orders();

        let held_side = self
            .ledger
            .position()
            .map(|p| p.side)
            .unwrap_or(remote.side);
        let order_side = held_side
            .exit_order_side()
            .context("cannot close a ZERO-side position")?;

        let fill = self.coordinator.execute(order_side, true).await?;
        self.ledger.close_position(CloseEvent {
            close_price: fill.price,
            close_candle: candle_stamp(candles),
            close_reason: signal.reason,
            close_fee: fill.fee,
            pnl: fill.realized_pnl,
        })?;
        Ok(())
    }

    async fn cancel_exit_orders(&mut self) -> Result<()> {
        if let Some(order_id) = self.ledger.tp_order_id() {
            self.coordinator.cancel_order_tolerant(order_id).await?;
        }
        if let Some(order_id) = self.ledger.sl_order_id() {
            self.coordinator.cancel_order_tolerant(order_id).await?;
        }
        Ok(())
    }
}

/// Open time of the most recent candle, used to stamp open/close records.
fn candle_stamp(candles: &[Candle]) -> String {
    candles
        .last()
        .map(|c| c.open_time.to_rfc3339())
        .unwrap_or_default()
}
