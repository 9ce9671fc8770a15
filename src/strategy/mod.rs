// Trading signal providers.
pub mod macd_histogram;

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Result;
use serde::Deserialize;

use crate::ledger::PositionLedger;
use crate::models::{Candle, PositionSide, Signal};

pub use macd_histogram::MacdHistogramStrategy;

/// Capability interface for entry/exit decisions and TP/SL pricing.
///
/// Signal evaluation is pure computation over the candle series and the
/// ledger; providers never talk to the exchange.
pub trait SignalProvider: Send + Sync {
    /// Entry evaluation. A non-`Zero` side means "open in that direction".
    fn should_open(&self, candles: &[Candle], ledger: &PositionLedger) -> Result<Signal>;

    /// Exit evaluation. A `Zero` side means "close now".
    fn should_close(&self, candles: &[Candle], ledger: &PositionLedger) -> Result<Signal>;

    /// Take-profit and stop-loss prices for a freshly opened position.
    fn calculate_tp_sl(
        &self,
        candles: &[Candle],
        side: PositionSide,
        entry_price: f64,
    ) -> Result<(f64, f64)>;

    fn name(&self) -> &str;
}

/// Strategy selector, resolved once at bot construction.
#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum StrategyId {
    MacdHistogram,
}

/// Build the concrete provider for a strategy id. `dynamic_config` is the
/// bot's opaque parameter map; unknown keys are ignored by providers.
pub fn create_strategy(
    id: StrategyId,
    dynamic_config: &HashMap<String, String>,
) -> Result<Arc<dyn SignalProvider>> {
    match id {
        StrategyId::MacdHistogram => Ok(Arc::new(MacdHistogramStrategy::from_dynamic_config(
            dynamic_config,
        )?)),
    }
}
