use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::Instrument;

use crate::client::TradeClient;
use crate::config::BotConfig;
use crate::execution::{EngineError, ExecutionEngine};
use crate::ledger::PositionLedger;
use crate::strategy::create_strategy;

/// One configured bot: a strategy, a ledger, and an engine wired to an
/// exchange client, run as a sequential tick loop.
pub struct Bot {
    config: Arc<BotConfig>,
    client: Arc<dyn TradeClient>,
    engine: ExecutionEngine,
    running: Arc<AtomicBool>,
}

impl Bot {
    /// Assemble the bot and recover any live position from its snapshot.
    /// Leverage is set once here, not per tick.
    pub async fn new(config: Arc<BotConfig>, client: Arc<dyn TradeClient>) -> Result<Self> {
        let strategy = create_strategy(config.strategy, &config.dynamic_config)
            .with_context(|| format!("failed to build strategy for bot '{}'", config.bot_name))?;
        let ledger = PositionLedger::new(
            config.run_id,
            &config.symbol,
            &config.state_dir,
            &config.records_dir,
        )?;

        client
            .set_leverage(&config.symbol, config.leverage)
            .await
            .with_context(|| format!("failed to set {} leverage", config.symbol))?;

        let engine = ExecutionEngine::new(config.clone(), client.clone(), strategy, ledger);
        Ok(Self {
            config,
            client,
            engine,
            running: Arc::new(AtomicBool::new(true)),
        })
    }

    /// Handle for asking the run loop to stop after its current tick.
    pub fn shutdown_handle(&self) -> Arc<AtomicBool> {
        self.running.clone()
    }

    /// Tick until shut down. Transient errors are logged and retried on the
    /// next tick; [`EngineError`]s stop the bot.
    pub async fn run(mut self) -> Result<()> {
        let span = tracing::info_span!(
            "bot",
            name = %self.config.bot_name,
            symbol = %self.config.symbol,
            run_id = %self.config.run_id
        );
        async move {
            tracing::info!(
                "🤖 Starting: {} on {} ({})",
                self.config.bot_name,
                self.config.symbol,
                self.config.timeframe
            );

            while self.running.load(Ordering::Relaxed) {
                if let Err(e) = self.engine.tick().await {
                    if e.downcast_ref::<EngineError>().is_some() {
                        tracing::error!("💥 Fatal: {e:#}");
                        return Err(e);
                    }
                    tracing::error!("Tick failed, retrying next tick: {e:#}");
                }
                self.client.wait().await;
            }

            tracing::info!("🛑 Stopped: {}", self.config.bot_name);
            Ok(())
        }
        .instrument(span)
        .await
    }
}
