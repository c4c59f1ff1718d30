//! Types shared by the market-data, decision and ledger layers

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::strategy::Signal;

/// A single candlestick (OHLCV)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Kline {
    pub open_time: i64,
    pub open: Decimal,
    pub high: Decimal,
    pub low: Decimal,
    pub close: Decimal,
    pub volume: Decimal,
    pub close_time: i64,
}

/// Direction of a simulated position
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Side {
    Long,
    Short,
}

impl Side {
    /// The side a signal opens, if any.
    pub fn from_signal(signal: Signal) -> Option<Self> {
        match signal {
            Signal::Buy => Some(Side::Long),
            Signal::Sell => Some(Side::Short),
            Signal::Wait => None,
        }
    }

    /// The signal that reverses this side.
    pub fn opposite_signal(self) -> Signal {
        match self {
            Side::Long => Signal::Sell,
            Side::Short => Signal::Buy,
        }
    }
}

impl fmt::Display for Side {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Side::Long => write!(f, "LONG"),
            Side::Short => write!(f, "SHORT"),
        }
    }
}

/// What the dashboard shows for an instrument in one cycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Action {
    Buy,
    Sell,
    Wait,
    /// No signal while a position is open
    Hold,
}

impl Action {
    pub fn new(signal: Signal, in_position: bool) -> Self {
        match signal {
            Signal::Buy => Action::Buy,
            Signal::Sell => Action::Sell,
            Signal::Wait if in_position => Action::Hold,
            Signal::Wait => Action::Wait,
        }
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Action::Buy => "BUY",
            Action::Sell => "SELL",
            Action::Wait => "WAIT",
            Action::Hold => "HOLD",
        };
        f.pad(label)
    }
}
