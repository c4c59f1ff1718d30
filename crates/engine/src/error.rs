//! Error taxonomy for the trading core
//!
//! Nothing here is fatal once the bot is running: fetch, allocation, broadcast
//! and order failures are logged and the next cycle proceeds. Only a
//! [`ConfigError`] at startup aborts the process.

use rust_decimal::Decimal;
use std::fmt::Display;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("market data unavailable for {symbol}: {message}")]
    DataFetch { symbol: String, message: String },

    #[error(transparent)]
    Allocation(#[from] AllocationError),

    #[error("broadcast failed: {0}")]
    Broadcast(String),

    #[error("order rejected: {0}")]
    OrderRejected(String),

    #[error("account query failed: {0}")]
    Account(String),

    #[error(transparent)]
    Config(#[from] ConfigError),
}

impl EngineError {
    pub fn fetch(symbol: &str, message: impl Display) -> Self {
        Self::DataFetch {
            symbol: symbol.to_string(),
            message: message.to_string(),
        }
    }
}

pub type EngineResult<T> = Result<T, EngineError>;

/// Why an entry was refused. The ledger leaves all state untouched.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AllocationError {
    #[error("allocation {allocation} exceeds free cash {free_cash}")]
    InsufficientFunds {
        allocation: Decimal,
        free_cash: Decimal,
    },

    #[error("allocation must be positive, got {0}")]
    NonPositive(Decimal),

    #[error("cannot size an order at price {0}")]
    InvalidPrice(Decimal),

    #[error("quantity {quantity} is below the instrument minimum {min_qty}")]
    BelowMinQuantity { quantity: Decimal, min_qty: Decimal },
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid config file: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid value for {key}: {value}")]
    InvalidEnv { key: String, value: String },

    #[error("invalid configuration: {0}")]
    Invalid(String),

    #[error("missing required setting: {0}")]
    Missing(&'static str),
}
