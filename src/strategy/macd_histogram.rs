use std::collections::HashMap;

use anyhow::{bail, Context, Result};

use super::SignalProvider;
use crate::indicators::macd_histogram_series;
use crate::ledger::PositionLedger;
use crate::models::{Candle, PositionSide, Signal};

/// MACD histogram sign strategy.
///
/// Holds LONG while the histogram is positive and SHORT while it is
/// negative; an exit triggers as soon as the sign no longer supports the
/// held side. TP/SL prices are percent offsets from the entry price.
#[derive(Debug, Clone)]
pub struct MacdHistogramStrategy {
    fast: usize,
    slow: usize,
    signal: usize,
    tp_pct: f64,
    sl_pct: f64,
}

fn parse_param<T: std::str::FromStr>(
    dynamic_config: &HashMap<String, String>,
    key: &str,
    default: T,
) -> Result<T>
where
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match dynamic_config.get(key) {
        Some(raw) => raw
            .parse::<T>()
            .with_context(|| format!("invalid value for dynamic_config.{key}: {raw}")),
        None => Ok(default),
    }
}

impl MacdHistogramStrategy {
    pub fn from_dynamic_config(dynamic_config: &HashMap<String, String>) -> Result<Self> {
        let strategy = Self {
            fast: parse_param(dynamic_config, "macd_fast", 12)?,
            slow: parse_param(dynamic_config, "macd_slow", 26)?,
            signal: parse_param(dynamic_config, "macd_signal", 9)?,
            tp_pct: parse_param(dynamic_config, "tp_pct", 0.02)?,
            sl_pct: parse_param(dynamic_config, "sl_pct", 0.01)?,
        };
        if strategy.fast >= strategy.slow {
            bail!(
                "macd_fast ({}) must be below macd_slow ({})",
                strategy.fast,
                strategy.slow
            );
        }
        if strategy.tp_pct <= 0.0 || strategy.sl_pct <= 0.0 {
            bail!("tp_pct and sl_pct must be positive");
        }
        Ok(strategy)
    }

    fn min_candles_required(&self) -> usize {
        self.slow + self.signal
    }

    /// Histogram value of the last closed candle. The in-progress candle is
    /// excluded so the signal does not flicker intra-candle.
    fn last_histogram(&self, candles: &[Candle]) -> Result<f64> {
        if candles.len() < self.min_candles_required() + 1 {
            bail!(
                "insufficient data: {} candles, need {}",
                candles.len(),
                self.min_candles_required() + 1
            );
        }
        let closes: Vec<f64> = candles[..candles.len() - 1].iter().map(|c| c.close).collect();
        let hist = macd_histogram_series(&closes, self.fast, self.slow, self.signal)
            .context("MACD histogram computation failed")?;
        hist.last().copied().context("empty MACD histogram series")
    }

    fn side_for(hist: f64) -> PositionSide {
        if hist > 0.0 {
            PositionSide::Long
        } else if hist < 0.0 {
            PositionSide::Short
        } else {
            PositionSide::Zero
        }
    }
}

impl SignalProvider for MacdHistogramStrategy {
    fn should_open(&self, candles: &[Candle], _ledger: &PositionLedger) -> Result<Signal> {
        let hist = self.last_histogram(candles)?;
        let side = Self::side_for(hist);
        let reason = match side {
            PositionSide::Long => format!("MACD histogram positive ({hist:.4})"),
            PositionSide::Short => format!("MACD histogram negative ({hist:.4})"),
            PositionSide::Zero => "MACD histogram flat".to_string(),
        };
        Ok(Signal::new(side, reason))
    }

    fn should_close(&self, candles: &[Candle], ledger: &PositionLedger) -> Result<Signal> {
        let Some(position) = ledger.position() else {
            return Ok(Signal::zero("no position held"));
        };

        let hist = self.last_histogram(candles)?;
        let supported = Self::side_for(hist);
        if supported == position.side {
            Ok(Signal::new(
                position.side,
                format!("histogram still supports {} ({hist:.4})", position.side),
            ))
        } else {
            Ok(Signal::zero(format!(
                "histogram no longer supports {} ({hist:.4})",
                position.side
            )))
        }
    }

    fn calculate_tp_sl(
        &self,
        _candles: &[Candle],
        side: PositionSide,
        entry_price: f64,
    ) -> Result<(f64, f64)> {
        let (tp, sl) = match side {
            PositionSide::Long => (
                entry_price * (1.0 + self.tp_pct),
                entry_price * (1.0 - self.sl_pct),
            ),
            PositionSide::Short => (
                entry_price * (1.0 - self.tp_pct),
                entry_price * (1.0 + self.sl_pct),
            ),
            PositionSide::Zero => bail!("cannot price TP/SL for a ZERO side"),
        };
        Ok((tp, sl))
    }

    fn name(&self) -> &str {
        "macd_histogram"
    }
}
