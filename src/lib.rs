// Core modules
pub mod bot;
pub mod client;
pub mod config;
pub mod execution;
pub mod indicators;
pub mod ledger;
pub mod models;
pub mod strategy;

// Re-export commonly used types
pub use bot::Bot;
pub use client::{BinanceFuturesClient, SimClient, TradeClient};
pub use config::{AppConfig, BotConfig};
pub use ledger::PositionLedger;
pub use models::*;
pub use strategy::SignalProvider;
