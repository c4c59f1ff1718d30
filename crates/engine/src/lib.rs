//! DigiBot engine: EMA + RSI signals with a simulated position ledger
//!
//! Provides:
//! - EMA / RSI indicators over a rolling close window
//! - Crossover + RSI signal decision
//! - Paper-trading ledger with protective and profit-harvest exit policies
//! - Bybit / Binance market data, Telegram broadcast and an optional Bybit order hook
//! - Read-only Telegram commands (/status, /balance)
//! - Live cycle runner and bar-by-bar replay

pub mod api;
pub mod commands;
pub mod config;
pub mod error;
pub mod indicators;
pub mod ledger;
pub mod replay;
pub mod report;
pub mod runner;
pub mod sinks;
pub mod strategy;
pub mod types;

// Re-exports for convenience
pub use api::{
    account_balance_for, market_data_for, order_hook_for, AccountBalance, BinanceClient,
    BybitClient, BybitOrderClient, InboundMessage, MarketData, MessageSink, MessageSource,
    OrderHook, OrderRequest, PaperOrderHook, TelegramClient,
};
pub use commands::{Command, CommandResponder};
pub use config::{BotConfig, ExchangeKind, Preset};
pub use error::{AllocationError, ConfigError, EngineError, EngineResult};
pub use indicators::{IndicatorConfig, IndicatorSnapshot, PriceSeries, ZeroLossRsi};
pub use ledger::{
    Allocation, EngineState, ExitPolicy, ExitReason, LedgerConfig, LedgerEvent, PositionLedger,
    ProfitLockMode, ProtectiveExit,
};
pub use replay::{ReplayRunner, ReplaySummary};
pub use report::{CycleReport, SymbolRecord, SymbolRow};
pub use runner::CycleRunner;
pub use sinks::{ConsoleSink, ReportSink, SnapshotStore, TelegramSink};
pub use strategy::{decide, Signal, SignalRules};
pub use types::*;
