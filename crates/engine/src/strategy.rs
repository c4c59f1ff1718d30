//! Signal decision: EMA crossover filtered by RSI, with an RSI-extreme override

use rust_decimal::prelude::ToPrimitive;
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::indicators::IndicatorSnapshot;

/// Trading signal emitted by [`decide`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Signal {
    Buy,
    Sell,
    Wait,
}

impl fmt::Display for Signal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Signal::Buy => "BUY",
            Signal::Sell => "SELL",
            Signal::Wait => "WAIT",
        };
        f.pad(label)
    }
}

/// Thresholds for the decision rules
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SignalRules {
    /// RSI above this blocks crossover buys and triggers the sell override
    pub overbought: f64,
    /// RSI below this blocks crossover sells and triggers the buy override
    pub oversold: f64,
    /// Relative distance from the slow EMA under which entries are suppressed
    pub chop_threshold: f64,
    /// Enable the RSI-extreme (mean-reversion) rule
    pub rsi_extremes: bool,
}

impl Default for SignalRules {
    fn default() -> Self {
        Self {
            overbought: 70.0,
            oversold: 30.0,
            chop_threshold: 0.002,
            rsi_extremes: true,
        }
    }
}

/// Map an indicator snapshot to a signal.
///
/// Rules are checked in a fixed order: missing history -> `Wait`, then the
/// EMA crossover rule, then the RSI-extreme rule, else `Wait`. The chop
/// filter suppresses both entry rules.
pub fn decide(snapshot: &IndicatorSnapshot, rules: &SignalRules) -> Signal {
    let (Some(fast_now), Some(fast_prev), Some(slow_now), Some(slow_prev), Some(rsi)) = (
        snapshot.ema_fast,
        snapshot.ema_fast_prev,
        snapshot.ema_slow,
        snapshot.ema_slow_prev,
        snapshot.rsi,
    ) else {
        return Signal::Wait;
    };

    if slow_now <= 0.0 {
        return Signal::Wait;
    }

    let price = snapshot.price.to_f64().unwrap_or(0.0);
    let chop = ((price - slow_now) / slow_now).abs() < rules.chop_threshold;
    if chop {
        return Signal::Wait;
    }

    let crossed_up = fast_prev < slow_prev && fast_now > slow_now;
    let crossed_down = fast_prev > slow_prev && fast_now < slow_now;

    if crossed_up && rsi < rules.overbought {
        return Signal::Buy;
    }
    if crossed_down && rsi > rules.oversold {
        return Signal::Sell;
    }

    if rules.rsi_extremes {
        if rsi < rules.oversold {
            return Signal::Buy;
        }
        if rsi > rules.overbought {
            return Signal::Sell;
        }
    }

    Signal::Wait
}
