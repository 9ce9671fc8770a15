use std::fs;
use std::path::PathBuf;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::models::PositionSide;

/// The single live position record a bot believes it holds.
///
/// Close fields stay unset until a close event commits them; the record is
/// then appended to the immutable trade store and dropped from the ledger.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Position {
    pub run_id: Uuid,
    pub symbol: String,
    pub side: PositionSide,
    pub quantity: f64,
    pub entry_price: f64,
    pub open_time: DateTime<Utc>,
    pub open_candle: String,
    pub open_reason: String,
    pub open_fee: f64,

    pub close_price: Option<f64>,
    pub close_time: Option<DateTime<Utc>>,
    pub close_candle: Option<String>,
    pub close_reason: Option<String>,
    pub close_fee: Option<f64>,

    pub pnl: f64,
    pub max_pnl: f64,
    pub min_pnl: f64,

    pub tp_order_id: Option<i64>,
    pub tp_price: Option<f64>,
    pub sl_order_id: Option<i64>,
    pub sl_price: Option<f64>,
}

/// Exchange-confirmed fields required to open a position.
#[derive(Debug, Clone)]
pub struct OpenEvent {
    pub side: PositionSide,
    pub quantity: f64,
    pub entry_price: f64,
    pub open_candle: String,
    pub open_reason: String,
    pub open_fee: f64,
}

/// Fields stamped onto the live position when it closes.
#[derive(Debug, Clone)]
pub struct CloseEvent {
    pub close_price: f64,
    pub close_candle: String,
    pub close_reason: String,
    pub close_fee: f64,
    pub pnl: f64,
}

/// Owns the single current position record, its TP/SL order bookkeeping,
/// pnl extremes, and durable snapshotting. Never talks to the exchange.
///
/// Snapshot and record files are partitioned by run id, so no cross-bot
/// locking is needed: only this bot's own task ever writes them.
pub struct PositionLedger {
    run_id: Uuid,
    symbol: String,
    snapshot_path: PathBuf,
    records_dir: PathBuf,
    position: Option<Position>,
}

impl PositionLedger {
    /// Build the ledger and recover the last known live position from its
    /// snapshot file, if one survived a previous run of this run id.
    pub fn new(
        run_id: Uuid,
        symbol: &str,
        state_dir: &std::path::Path,
        records_dir: &std::path::Path,
    ) -> Result<Self> {
        fs::create_dir_all(state_dir)
            .with_context(|| format!("failed to create state dir {}", state_dir.display()))?;
        fs::create_dir_all(records_dir)
            .with_context(|| format!("failed to create records dir {}", records_dir.display()))?;

        let snapshot_path = state_dir.join(format!("position_{run_id}.json"));
        let position = Self::read_position_state(&snapshot_path);
        if let Some(ref p) = position {
            tracing::info!(
                "Recovered {} {} position from snapshot (entry {})",
                p.symbol,
                p.side,
                p.entry_price
            );
        }

        Ok(Self {
            run_id,
            symbol: symbol.to_string(),
            snapshot_path,
            records_dir: records_dir.to_path_buf(),
            position,
        })
    }

    pub fn is_open(&self) -> bool {
        self.position.is_some()
    }

    pub fn position(&self) -> Option<&Position> {
        self.position.as_ref()
    }

    /// Construct the live position from exchange-confirmed fields. Refuses
    /// (logged, not raised) when fields are unusable or a position is
    /// already open — financial state is never silently replaced.
    pub fn open_position(&mut self, event: OpenEvent) {
        if self.position.is_some() {
            tracing::warn!(
                "open_position ignored: a {} position is already open",
                self.symbol
            );
            return;
        }
        if event.side == PositionSide::Zero {
            tracing::error!("open_position ignored: side is ZERO");
            return;
        }
        if event.entry_price <= 0.0 || event.quantity <= 0.0 {
            tracing::error!(
                "open_position ignored: bad entry_price {} / quantity {}",
                event.entry_price,
                event.quantity
            );
            return;
        }

        tracing::info!(
            "{} | {:<5} | {:<5} | {:.4}",
            self.symbol,
            "OPEN",
            event.side.to_string(),
            event.entry_price
        );

        self.position = Some(Position {
            run_id: self.run_id,
            symbol: self.symbol.clone(),
            side: event.side,
            quantity: event.quantity,
            entry_price: event.entry_price,
            open_time: Utc::now(),
            open_candle: event.open_candle,
            open_reason: event.open_reason,
            open_fee: event.open_fee,
            close_price: None,
            close_time: None,
            close_candle: None,
            close_reason: None,
            close_fee: None,
            pnl: 0.0,
            max_pnl: 0.0,
            min_pnl: 0.0,
            tp_order_id: None,
            tp_price: None,
            sl_order_id: None,
            sl_price: None,
        });
    }

    /// Stamp close fields onto the live position, append it to the
    /// immutable record store, and delete the live snapshot.
    pub fn close_position(&mut self, event: CloseEvent) -> Result<()> {
        let Some(mut position) = self.position.take() else {
            tracing::warn!("close_position ignored: no open position");
            return Ok(());
        };

        let close_time = Utc::now();
        position.close_price = Some(event.close_price);
        position.close_time = Some(close_time);
        position.close_candle = Some(event.close_candle);
        position.close_reason = Some(event.close_reason);
        position.close_fee = Some(event.close_fee);
        position.pnl = event.pnl;
        position.max_pnl = position.max_pnl.max(event.pnl);
        position.min_pnl = position.min_pnl.min(event.pnl);

        tracing::info!(
            "{} | {:<5} | {:<5} | {:.4} -> {:.4} | {}{:.4}",
            self.symbol,
            "CLOSE",
            position.side.to_string(),
            position.entry_price,
            event.close_price,
            if event.pnl >= 0.0 { "+" } else { "" },
            event.pnl
        );

        self.append_trade_record(&position, close_time)?;
        self.remove_snapshot();
        Ok(())
    }

    /// Update running pnl and the max/min extremes seen while open.
    pub fn update_pnl(&mut self, pnl: f64) {
        if let Some(position) = self.position.as_mut() {
            position.pnl = pnl;
            position.max_pnl = position.max_pnl.max(pnl);
            position.min_pnl = position.min_pnl.min(pnl);
        }
    }

    /// Drop the position without recording a trade. Only used for
    /// drift-correction reconciliation.
    pub fn clear_position(&mut self) {
        if self.position.take().is_some() {
            tracing::warn!("{} position cleared without trade record", self.symbol);
        }
        self.remove_snapshot();
    }

    // TP/SL bookkeeping. Never talks to the exchange.

    pub fn set_tp_order(&mut self, order_id: i64, price: f64) {
        if let Some(position) = self.position.as_mut() {
            position.tp_order_id = Some(order_id);
            position.tp_price = Some(price);
        }
    }

    pub fn set_sl_order(&mut self, order_id: i64, price: f64) {
        if let Some(position) = self.position.as_mut() {
            position.sl_order_id = Some(order_id);
            position.sl_price = Some(price);
        }
    }

    pub fn tp_order_id(&self) -> Option<i64> {
        self.position.as_ref().and_then(|p| p.tp_order_id)
    }

    pub fn sl_order_id(&self) -> Option<i64> {
        self.position.as_ref().and_then(|p| p.sl_order_id)
    }

    pub fn has_exit_orders(&self) -> bool {
        self.tp_order_id().is_some() || self.sl_order_id().is_some()
    }

    pub fn clear_tp_sl_orders(&mut self) {
        if let Some(position) = self.position.as_mut() {
            position.tp_order_id = None;
            position.tp_price = None;
            position.sl_order_id = None;
            position.sl_price = None;
        }
    }

    /// Checkpoint the live position to its snapshot file with
    /// write-then-rename semantics, so a crash mid-write can never leave a
    /// truncated snapshot behind.
    pub fn checkpoint(&self) -> Result<()> {
        match &self.position {
            Some(position) => {
                let json = serde_json::to_string_pretty(position)
                    .context("failed to serialize position snapshot")?;
                let tmp = self.snapshot_path.with_extension("json.tmp");
                fs::write(&tmp, json)
                    .with_context(|| format!("failed to write {}", tmp.display()))?;
                fs::rename(&tmp, &self.snapshot_path).with_context(|| {
                    format!("failed to move snapshot into {}", self.snapshot_path.display())
                })?;
            }
            None => self.remove_snapshot(),
        }
        Ok(())
    }

    fn read_position_state(path: &std::path::Path) -> Option<Position> {
        let data = fs::read_to_string(path).ok()?;
        match serde_json::from_str(&data) {
            Ok(position) => Some(position),
            Err(e) => {
                tracing::warn!("Ignoring unreadable snapshot {}: {}", path.display(), e);
                None
            }
        }
    }

    fn append_trade_record(&self, position: &Position, close_time: DateTime<Utc>) -> Result<()> {
        let name = format!(
            "trade_{}_{}.json",
            self.run_id,
            close_time.format("%Y%m%dT%H%M%S%.3f")
        );
        let path = self.records_dir.join(name);
        let json = serde_json::to_string_pretty(position)
            .context("failed to serialize closed trade record")?;
        fs::write(&path, json)
            .with_context(|| format!("failed to write trade record {}", path.display()))?;
        tracing::debug!("Recorded closed trade at {}", path.display());
        Ok(())
    }

    fn remove_snapshot(&self) {
        if self.snapshot_path.exists() {
            if let Err(e) = fs::remove_file(&self.snapshot_path) {
                tracing::warn!(
                    "Failed to delete snapshot {}: {}",
                    self.snapshot_path.display(),
                    e
                );
            }
        }
    }

    #[cfg(test)]
    pub(crate) fn snapshot_path(&self) -> &std::path::Path {
        &self.snapshot_path
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn test_ledger(dir: &TempDir) -> PositionLedger {
        PositionLedger::new(
            Uuid::new_v4(),
            "SOLUSDT",
            &dir.path().join("state"),
            &dir.path().join("records"),
        )
        .unwrap()
    }

    fn open_event() -> OpenEvent {
        OpenEvent {
            side: PositionSide::Long,
            quantity: 2.0,
            entry_price: 100.0,
            open_candle: "2026-01-01T00:00:00Z".to_string(),
            open_reason: "MACD histogram positive".to_string(),
            open_fee: 0.1,
        }
    }

    #[test]
    fn test_open_and_close_position() {
        let dir = TempDir::new().unwrap();
        let mut ledger = test_ledger(&dir);

        assert!(!ledger.is_open());
        ledger.open_position(open_event());
        assert!(ledger.is_open());

        let p = ledger.position().unwrap();
        assert_eq!(p.side, PositionSide::Long);
        assert_eq!(p.entry_price, 100.0);
        assert!(p.close_price.is_none());

        ledger
            .close_position(CloseEvent {
                close_price: 110.0,
                close_candle: "2026-01-01T00:45:00Z".to_string(),
                close_reason: "histogram flipped".to_string(),
                close_fee: 0.11,
                pnl: 20.0,
            })
            .unwrap();
        assert!(!ledger.is_open());

        // Exactly one immutable record was written.
        let records: Vec<_> = fs::read_dir(dir.path().join("records"))
            .unwrap()
            .collect::<std::io::Result<_>>()
            .unwrap();
        assert_eq!(records.len(), 1);

        let record: Position =
            serde_json::from_str(&fs::read_to_string(records[0].path()).unwrap()).unwrap();
        assert_eq!(record.close_price, Some(110.0));
        assert_eq!(record.close_fee, Some(0.11));
        assert_eq!(record.pnl, 20.0);
    }

    #[test]
    fn test_single_position_invariant() {
        let dir = TempDir::new().unwrap();
        let mut ledger = test_ledger(&dir);

        ledger.open_position(open_event());
        let mut second = open_event();
        second.entry_price = 200.0;
        ledger.open_position(second);

        // The second open is refused; the first position is untouched.
        assert_eq!(ledger.position().unwrap().entry_price, 100.0);
    }

    #[test]
    fn test_open_refuses_zero_side_and_bad_price() {
        let dir = TempDir::new().unwrap();
        let mut ledger = test_ledger(&dir);

        let mut bad = open_event();
        bad.side = PositionSide::Zero;
        ledger.open_position(bad);
        assert!(!ledger.is_open());

        let mut bad = open_event();
        bad.entry_price = 0.0;
        ledger.open_position(bad);
        assert!(!ledger.is_open());
    }

    #[test]
    fn test_pnl_extremes() {
        let dir = TempDir::new().unwrap();
        let mut ledger = test_ledger(&dir);
        ledger.open_position(open_event());

        ledger.update_pnl(5.0);
        ledger.update_pnl(-3.0);
        ledger.update_pnl(1.0);

        let p = ledger.position().unwrap();
        assert_eq!(p.pnl, 1.0);
        assert_eq!(p.max_pnl, 5.0);
        assert_eq!(p.min_pnl, -3.0);
    }

    #[test]
    fn test_tp_sl_bookkeeping() {
        let dir = TempDir::new().unwrap();
        let mut ledger = test_ledger(&dir);
        ledger.open_position(open_event());

        ledger.set_tp_order(11, 110.0);
        ledger.set_sl_order(12, 95.0);
        assert_eq!(ledger.tp_order_id(), Some(11));
        assert_eq!(ledger.sl_order_id(), Some(12));
        assert!(ledger.has_exit_orders());

        ledger.clear_tp_sl_orders();
        assert_eq!(ledger.tp_order_id(), None);
        assert_eq!(ledger.sl_order_id(), None);
        assert!(!ledger.has_exit_orders());
    }

    #[test]
    fn test_snapshot_round_trip() {
        let dir = TempDir::new().unwrap();
        let run_id = Uuid::new_v4();
        let state_dir = dir.path().join("state");
        let records_dir = dir.path().join("records");

        let mut ledger =
            PositionLedger::new(run_id, "SOLUSDT", &state_dir, &records_dir).unwrap();
        ledger.open_position(open_event());
        ledger.set_tp_order(11, 110.0);
        ledger.set_sl_order(12, 95.0);
        ledger.checkpoint().unwrap();
        assert!(ledger.snapshot_path().exists());

        // A fresh ledger for the same run id recovers the live position.
        let recovered =
            PositionLedger::new(run_id, "SOLUSDT", &state_dir, &records_dir).unwrap();
        let p = recovered.position().unwrap();
        assert_eq!(p.side, PositionSide::Long);
        assert_eq!(p.entry_price, 100.0);
        assert_eq!(p.tp_order_id, Some(11));
        assert_eq!(p.sl_order_id, Some(12));
    }

    #[test]
    fn test_close_deletes_snapshot() {
        let dir = TempDir::new().unwrap();
        let mut ledger = test_ledger(&dir);
        ledger.open_position(open_event());
        ledger.checkpoint().unwrap();
        assert!(ledger.snapshot_path().exists());

        ledger
            .close_position(CloseEvent {
                close_price: 101.0,
                close_candle: String::new(),
                close_reason: "exit".to_string(),
                close_fee: 0.1,
                pnl: 2.0,
            })
            .unwrap();
        assert!(!ledger.snapshot_path().exists());
    }

    #[test]
    fn test_clear_position_records_nothing() {
        let dir = TempDir::new().unwrap();
        let mut ledger = test_ledger(&dir);
        ledger.open_position(open_event());
        ledger.checkpoint().unwrap();

        ledger.clear_position();
        assert!(!ledger.is_open());
        assert!(!ledger.snapshot_path().exists());

        let records: Vec<_> = fs::read_dir(dir.path().join("records"))
            .unwrap()
            .collect::<std::io::Result<_>>()
            .unwrap();
        assert!(records.is_empty());
    }
}
