//! Full trade cycle against the offline client: open from a signal, hold
//! across several ticks, close on the exit signal, and verify the durable
//! artifacts the run leaves behind.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};

use anyhow::Result;
use chrono::Utc;
use tempfile::TempDir;
use uuid::Uuid;

use perpbot::client::{SimClient, TradeClient};
use perpbot::config::BotConfig;
use perpbot::execution::ExecutionEngine;
use perpbot::ledger::{Position, PositionLedger};
use perpbot::models::{Candle, OrderType, PositionSide, Signal};
use perpbot::strategy::{SignalProvider, StrategyId};

/// Replays queued entry/exit signals, holding the current side once the
/// exit queue runs dry.
struct ScriptedStrategy {
    opens: Mutex<VecDeque<Signal>>,
    closes: Mutex<VecDeque<Signal>>,
}

impl ScriptedStrategy {
    fn new(opens: Vec<Signal>, closes: Vec<Signal>) -> Arc<Self> {
        Arc::new(Self {
            opens: Mutex::new(opens.into()),
            closes: Mutex::new(closes.into()),
        })
    }
}

impl SignalProvider for ScriptedStrategy {
    fn should_open(&self, _candles: &[Candle], _ledger: &PositionLedger) -> Result<Signal> {
        Ok(self
            .opens
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Signal::zero("no scripted entry")))
    }

    fn should_close(&self, _candles: &[Candle], ledger: &PositionLedger) -> Result<Signal> {
        if let Some(signal) = self.closes.lock().unwrap().pop_front() {
            return Ok(signal);
        }
        match ledger.position() {
            Some(p) => Ok(Signal::new(p.side, "hold")),
            None => Ok(Signal::zero("no position held")),
        }
    }

    fn calculate_tp_sl(
        &self,
        _candles: &[Candle],
        _side: PositionSide,
        entry_price: f64,
    ) -> Result<(f64, f64)> {
        Ok((entry_price * 1.02, entry_price * 0.99))
    }

    fn name(&self) -> &str {
        "scripted"
    }
}

fn test_config(dir: &TempDir, run_id: Uuid) -> Arc<BotConfig> {
    Arc::new(BotConfig {
        bot_name: "cycle-test".to_string(),
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
        wait_max_secs: 0,
        order_settle_secs: 0,
        fill_poll_secs: 0,
        fill_poll_max_attempts: 5,
        chase_max_replacements: 5,
        state_dir: dir.path().join("state"),
        records_dir: dir.path().join("records"),
        run_id,
    })
}

fn flat_candles(n: usize, price: f64) -> Vec<Candle> {
    (0..n)
        .map(|_| Candle {
            open_time: Utc::now(),
            open: price,
            high: price,
            low: price,
            close: price,
            volume: 1000.0,
            current_price: price,
        })
        .collect()
}

fn build_engine(
    config: Arc<BotConfig>,
    client: Arc<SimClient>,
    strategy: Arc<dyn SignalProvider>,
) -> ExecutionEngine {
    let ledger = PositionLedger::new(
        config.run_id,
        &config.symbol,
        &config.state_dir,
        &config.records_dir,
    )
    .unwrap();
    ExecutionEngine::new(config, client as Arc<dyn TradeClient>, strategy, ledger)
}

fn read_single_record(config: &BotConfig) -> Position {
    let records: Vec<_> = std::fs::read_dir(&config.records_dir)
        .unwrap()
        .collect::<std::io::Result<_>>()
        .unwrap();
    assert_eq!(records.len(), 1, "expected exactly one trade record");
    serde_json::from_str(&std::fs::read_to_string(records[0].path()).unwrap()).unwrap()
}

#[tokio::test]
async fn test_long_round_trip_leaves_one_record_and_no_snapshot() {
    let dir = TempDir::new().unwrap();
    let client = Arc::new(SimClient::new(100.0, 0.001));
    client.set_candles(flat_candles(10, 100.0));

    let strategy = ScriptedStrategy::new(
        vec![Signal::new(PositionSide::Long, "scripted long entry")],
        vec![
            Signal::new(PositionSide::Long, "hold"),
            Signal::new(PositionSide::Long, "hold"),
            Signal::new(PositionSide::Long, "hold"),
            Signal::zero("scripted exit"),
        ],
    );
    let config = test_config(&dir, Uuid::new_v4());
    let mut engine = build_engine(config.clone(), client.clone(), strategy);

    // Tick 1: opens LONG at 100.
    engine.tick().await.unwrap();
    {
        let position = engine.ledger().position().unwrap();
        assert_eq!(position.side, PositionSide::Long);
        assert!((position.entry_price - 100.0).abs() < 1e-9);
        assert!((position.open_fee - 0.1).abs() < 1e-9);
        assert_eq!(position.open_reason, "scripted long entry");
    }

    // Ticks 2-4: hold while the price climbs; pnl extremes are tracked.
    client.set_price(104.0);
    engine.tick().await.unwrap();
    client.set_price(98.0);
    engine.tick().await.unwrap();
    client.set_price(106.0);
    engine.tick().await.unwrap();
    {
        let position = engine.ledger().position().unwrap();
        assert!((position.max_pnl - 6.0).abs() < 1e-9);
        assert!((position.min_pnl - (-2.0)).abs() < 1e-9);
    }

    // Tick 5: exit signal closes at 110.
    client.set_price(110.0);
    engine.tick().await.unwrap();
    assert!(!engine.ledger().is_open());

    let record = read_single_record(&config);
    assert_eq!(record.close_price, Some(110.0));
    assert!((record.pnl - 10.0).abs() < 1e-9);
    assert!((record.close_fee.unwrap() - 0.11).abs() < 1e-9);
    assert_eq!(record.close_reason.as_deref(), Some("scripted exit"));
    assert!((record.max_pnl - 10.0).abs() < 1e-9);

    // The live snapshot is gone once the trade is recorded.
    let snapshot = config
        .state_dir
        .join(format!("position_{}.json", config.run_id));
    assert!(!snapshot.exists());
}

#[tokio::test]
async fn test_snapshot_recovers_position_across_restarts() {
    let dir = TempDir::new().unwrap();
    let run_id = Uuid::new_v4();
    let client = Arc::new(SimClient::new(100.0, 0.001));
    client.set_candles(flat_candles(10, 100.0));

    let config = test_config(&dir, run_id);
    {
        let strategy = ScriptedStrategy::new(
            vec![Signal::new(PositionSide::Long, "scripted long entry")],
            vec![],
        );
        let mut engine = build_engine(config.clone(), client.clone(), strategy);
        engine.tick().await.unwrap();
        assert!(engine.ledger().is_open());
        // Engine dropped here: simulated crash after the checkpoint.
    }

    // A fresh engine for the same run id picks the position back up and
    // keeps supervising it.
    let strategy = ScriptedStrategy::new(vec![], vec![Signal::zero("post-restart exit")]);
    let mut engine = build_engine(config.clone(), client.clone(), strategy);
    {
        let position = engine.ledger().position().unwrap();
        assert_eq!(position.side, PositionSide::Long);
        assert!((position.entry_price - 100.0).abs() < 1e-9);
    }

    client.set_price(103.0);
    engine.tick().await.unwrap();
    assert!(!engine.ledger().is_open());

    let record = read_single_record(&config);
    assert_eq!(record.close_reason.as_deref(), Some("post-restart exit"));
    assert!((record.pnl - 3.0).abs() < 1e-9);
}
