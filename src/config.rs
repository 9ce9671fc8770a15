use std::collections::HashMap;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use uuid::Uuid;

use crate::models::OrderType;
use crate::strategy::StrategyId;

fn default_timeframe_limit() -> usize {
    500
}

fn default_wait_max_secs() -> u64 {
    30
}

fn default_order_settle_secs() -> u64 {
    2
}

fn default_fill_poll_secs() -> u64 {
    2
}

fn default_fill_poll_max_attempts() -> u32 {
    60
}

fn default_chase_max_replacements() -> u32 {
    30
}

fn default_state_dir() -> PathBuf {
    PathBuf::from("state")
}

fn default_records_dir() -> PathBuf {
    PathBuf::from("records")
}

fn default_enabled() -> bool {
    true
}

/// Immutable per-bot configuration. Loaded once at startup, never mutated
/// at runtime.
#[derive(Debug, Clone, Deserialize)]
pub struct BotConfig {
    pub bot_name: String,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    pub symbol: String,
    pub leverage: u32,
    pub quantity: f64,
    pub timeframe: String,
    #[serde(default = "default_timeframe_limit")]
    pub timeframe_limit: usize,
    #[serde(default)]
    pub order_type: OrderType,
    #[serde(default)]
    pub tp_enabled: bool,
    #[serde(default)]
    pub sl_enabled: bool,
    pub strategy: StrategyId,
    /// Opaque to the engine; handed to the strategy factory as-is.
    #[serde(default)]
    pub dynamic_config: HashMap<String, String>,

    /// Upper bound for the randomized inter-tick wait.
    #[serde(default = "default_wait_max_secs")]
    pub wait_max_secs: u64,
    /// Delay between placing a market order and the first status poll.
    #[serde(default = "default_order_settle_secs")]
    pub order_settle_secs: u64,
    /// Interval between fill polls.
    #[serde(default = "default_fill_poll_secs")]
    pub fill_poll_secs: u64,
    /// Give up on a market fill after this many polls.
    #[serde(default = "default_fill_poll_max_attempts")]
    pub fill_poll_max_attempts: u32,
    /// Give up on a chased limit order after this many re-placements.
    #[serde(default = "default_chase_max_replacements")]
    pub chase_max_replacements: u32,

    /// Directory for the live position snapshot, keyed by run id.
    #[serde(default = "default_state_dir")]
    pub state_dir: PathBuf,
    /// Directory for immutable closed-trade records.
    #[serde(default = "default_records_dir")]
    pub records_dir: PathBuf,

    /// Fresh per-process run identity; partitions snapshot and record files.
    #[serde(skip, default = "Uuid::new_v4")]
    pub run_id: Uuid,
}

impl BotConfig {
    pub fn validate(&self) -> Result<()> {
        if self.bot_name.trim().is_empty() {
            bail!("bot_name must not be empty");
        }
        if self.symbol.trim().is_empty() {
            bail!("symbol must not be empty");
        }
        if self.timeframe.trim().is_empty() {
            bail!("timeframe must not be empty");
        }
        if self.leverage == 0 {
            bail!("leverage must be positive");
        }
        if self.quantity <= 0.0 {
            bail!("quantity must be positive");
        }
        if self.timeframe_limit == 0 || self.timeframe_limit > 1500 {
            bail!("timeframe_limit must be between 1 and 1500");
        }
        if self.order_type == OrderType::StopMarket {
            bail!("STOP_MARKET is not a valid entry order type");
        }
        Ok(())
    }
}

/// Top-level application config: a list of bot definitions.
#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    pub bots: Vec<BotConfig>,
}

impl AppConfig {
    /// Load from a TOML file with `PERPBOT_`-prefixed environment overrides.
    pub fn load(path: &Path) -> Result<Self> {
        let settings = config::Config::builder()
            .add_source(config::File::from(path))
            .add_source(config::Environment::with_prefix("PERPBOT").separator("__"))
            .build()
            .with_context(|| format!("failed to read config from {}", path.display()))?;

        let app: AppConfig = settings
            .try_deserialize()
            .context("failed to deserialize bot configuration")?;

        if app.bots.is_empty() {
            bail!("no bots defined in configuration");
        }
        for bot in &app.bots {
            bot.validate()
                .with_context(|| format!("invalid config for bot '{}'", bot.bot_name))?;
        }
        Ok(app)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn sample_config() -> BotConfig {
        BotConfig {
            bot_name: "test-bot".to_string(),
            enabled: true,
            symbol: "SOLUSDT".to_string(),
            leverage: 10,
            quantity: 1.0,
            timeframe: "15m".to_string(),
            timeframe_limit: 500,
            order_type: OrderType::Market,
            tp_enabled: false,
            sl_enabled: false,
            strategy: StrategyId::MacdHistogram,
            dynamic_config: HashMap::new(),
            wait_max_secs: 30,
            order_settle_secs: 2,
            fill_poll_secs: 2,
            fill_poll_max_attempts: 60,
            chase_max_replacements: 30,
            state_dir: PathBuf::from("state"),
            records_dir: PathBuf::from("records"),
            run_id: Uuid::new_v4(),
        }
    }

    #[test]
    fn test_valid_config_passes() {
        assert!(sample_config().validate().is_ok());
    }

    #[test]
    fn test_rejects_zero_quantity() {
        let mut cfg = sample_config();
        cfg.quantity = 0.0;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_rejects_empty_symbol() {
        let mut cfg = sample_config();
        cfg.symbol = " ".to_string();
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_rejects_stop_market_entry() {
        let mut cfg = sample_config();
        cfg.order_type = OrderType::StopMarket;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_load_from_toml() {
        let mut file = tempfile::Builder::new()
            .suffix(".toml")
            .tempfile()
            .unwrap();
        write!(
            file,
            r#"
[[bots]]
bot_name = "macd-sol"
symbol = "SOLUSDT"
leverage = 10
quantity = 1.0
timeframe = "15m"
order_type = "LIMIT"
tp_enabled = true
sl_enabled = true
strategy = "macd_histogram"

[bots.dynamic_config]
tp_pct = "0.02"
sl_pct = "0.01"
"#
        )
        .unwrap();

        let app = AppConfig::load(file.path()).unwrap();
        assert_eq!(app.bots.len(), 1);
        let bot = &app.bots[0];
        assert_eq!(bot.symbol, "SOLUSDT");
        assert_eq!(bot.order_type, OrderType::Limit);
        assert!(bot.tp_enabled);
        assert_eq!(bot.dynamic_config.get("tp_pct").unwrap(), "0.02");
        // Defaults fill in the operational knobs.
        assert_eq!(bot.timeframe_limit, 500);
        assert_eq!(bot.wait_max_secs, 30);
    }
}
