//! Exchange, messaging and order clients
//!
//! The cycle runner only sees the traits defined here, so tests and replays
//! can swap the network clients for in-memory fakes.

pub mod binance;
pub mod bybit;
pub mod telegram;

use async_trait::async_trait;
use rust_decimal::Decimal;
use serde::Serialize;
use std::sync::Arc;
use tracing::info;

use crate::config::{BotConfig, ExchangeKind};
use crate::error::EngineResult;
use crate::types::Side;

pub use binance::BinanceClient;
pub use bybit::{BybitClient, BybitOrderClient};
pub use telegram::TelegramClient;

/// Source of recent close prices
#[async_trait]
pub trait MarketData: Send + Sync {
    fn name(&self) -> &str;

    /// The latest closes for `symbol`, oldest first.
    async fn recent_closes(&self, symbol: &str) -> EngineResult<Vec<Decimal>>;
}

/// Destination for broadcast text
#[async_trait]
pub trait MessageSink: Send + Sync {
    async fn send_message(&self, chat_id: &str, text: &str) -> EngineResult<()>;
}

/// A chat message received by the bot
#[derive(Debug, Clone, PartialEq)]
pub struct InboundMessage {
    pub update_id: i64,
    pub chat_id: String,
    /// Empty for updates that carry no text
    pub text: String,
}

/// Incoming chat messages, acknowledged by offset
#[async_trait]
pub trait MessageSource: Send + Sync {
    /// Messages with `update_id >= offset`, oldest first.
    async fn poll_messages(&self, offset: Option<i64>) -> EngineResult<Vec<InboundMessage>>;
}

/// Exchange account balance lookup
#[async_trait]
pub trait AccountBalance: Send + Sync {
    async fn wallet_balance(&self, coin: &str) -> EngineResult<Decimal>;
}

/// Market order mirrored from a simulated ledger event
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OrderRequest {
    pub symbol: String,
    pub side: Side,
    pub quantity: Decimal,
    pub take_profit: Option<Decimal>,
    pub stop_loss: Option<Decimal>,
    /// Closing order for an existing position
    pub reduce_only: bool,
}

/// Notified when the ledger opens or closes a position. Results are logged
/// and never feed back into the simulated accounting.
#[async_trait]
pub trait OrderHook: Send + Sync {
    async fn submit(&self, order: &OrderRequest) -> EngineResult<String>;
}

/// Order hook that only logs
#[derive(Debug, Clone, Default)]
pub struct PaperOrderHook;

#[async_trait]
impl OrderHook for PaperOrderHook {
    async fn submit(&self, order: &OrderRequest) -> EngineResult<String> {
        info!(
            symbol = %order.symbol,
            side = %order.side,
            qty = %order.quantity,
            reduce_only = order.reduce_only,
            "Paper order"
        );
        Ok(format!("paper-{}", order.symbol))
    }
}

/// Bybit kline interval codes
pub(crate) fn bybit_interval(mins: u32) -> String {
    match mins {
        1440 => "D".to_string(),
        10080 => "W".to_string(),
        m => m.to_string(),
    }
}

/// Binance kline interval codes
pub(crate) fn binance_interval(mins: u32) -> String {
    match mins {
        m if m >= 10080 && m % 10080 == 0 => format!("{}w", m / 10080),
        m if m >= 1440 && m % 1440 == 0 => format!("{}d", m / 1440),
        m if m >= 60 && m % 60 == 0 => format!("{}h", m / 60),
        m => format!("{}m", m),
    }
}

/// Market-data client for the configured exchange
pub fn market_data_for(config: &BotConfig) -> EngineResult<Arc<dyn MarketData>> {
    let source: Arc<dyn MarketData> = match config.exchange {
        ExchangeKind::Bybit => Arc::new(BybitClient::new(
            config.testnet,
            config.kline_interval_mins,
            config.kline_limit,
        )?),
        ExchangeKind::Binance => Arc::new(BinanceClient::new(
            config.kline_interval_mins,
            config.kline_limit,
        )?),
    };
    Ok(source)
}

/// Order hook for the configured credentials: signed Bybit orders when
/// enabled, otherwise paper.
pub fn order_hook_for(config: &BotConfig) -> EngineResult<Arc<dyn OrderHook>> {
    let orders = &config.orders;
    match (orders.enabled, &orders.api_key, &orders.api_secret) {
        (true, Some(key), Some(secret)) => Ok(Arc::new(BybitOrderClient::new(
            key.clone(),
            secret.clone(),
            config.testnet,
            orders.category.clone(),
        )?)),
        _ => Ok(Arc::new(PaperOrderHook)),
    }
}

/// Signed Bybit balance lookup when an API key pair is configured
pub fn account_balance_for(
    config: &BotConfig,
) -> EngineResult<Option<Arc<dyn AccountBalance>>> {
    let orders = &config.orders;
    match (orders.api_key.as_deref(), orders.api_secret.as_deref()) {
        (Some(key), Some(secret)) if !key.is_empty() && !secret.is_empty() => {
            Ok(Some(Arc::new(BybitOrderClient::new(
                key.to_string(),
                secret.to_string(),
                config.testnet,
                orders.category.clone(),
            )?)))
        }
        _ => Ok(None),
    }
}
