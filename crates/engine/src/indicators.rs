//! EMA and RSI over a rolling close-price window
//!
//! Prices arrive as `Decimal` closes; indicator math runs in `f64`.
//! Every function returns `None` when the series is too short for the
//! requested period instead of guessing a value.

use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use ta::indicators::ExponentialMovingAverage;
use ta::Next;

pub const DEFAULT_HISTORY_CAP: usize = 120;

// ============================================================================
// Price series
// ============================================================================

/// Close prices for one instrument, oldest first, capped to a rolling window.
#[derive(Debug, Clone)]
pub struct PriceSeries {
    closes: VecDeque<Decimal>,
    cap: usize,
}

impl PriceSeries {
    pub fn new(cap: usize) -> Self {
        let cap = cap.max(1);
        Self {
            closes: VecDeque::with_capacity(cap),
            cap,
        }
    }

    /// Append the newest close, dropping the oldest past the cap.
    pub fn push(&mut self, close: Decimal) {
        self.closes.push_back(close);
        while self.closes.len() > self.cap {
            self.closes.pop_front();
        }
    }

    /// Replace the window with a freshly fetched series (oldest first).
    pub fn replace(&mut self, closes: &[Decimal]) {
        self.closes.clear();
        let skip = closes.len().saturating_sub(self.cap);
        self.closes.extend(closes[skip..].iter().copied());
    }

    pub fn len(&self) -> usize {
        self.closes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.closes.is_empty()
    }

    pub fn cap(&self) -> usize {
        self.cap
    }

    pub fn last(&self) -> Option<Decimal> {
        self.closes.back().copied()
    }

    pub fn to_f64(&self) -> Vec<f64> {
        self.closes
            .iter()
            .map(|c| c.to_f64().unwrap_or(0.0))
            .collect()
    }
}

// ============================================================================
// EMA
// ============================================================================

/// EMA with `k = 2 / (period + 1)`, seeded by the first value of the series.
pub fn calc_ema(values: &[f64], period: usize) -> Option<f64> {
    ema_pair(values, period).now
}

/// EMA as of the latest sample and as of the sample before it.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct EmaPair {
    pub now: Option<f64>,
    pub prev: Option<f64>,
}

pub fn ema_pair(values: &[f64], period: usize) -> EmaPair {
    if period == 0 || values.len() < period {
        return EmaPair::default();
    }
    let Ok(mut ema) = ExponentialMovingAverage::new(period) else {
        return EmaPair::default();
    };

    let mut prev = None;
    let mut now = 0.0;
    for (i, &value) in values.iter().enumerate() {
        if i + 1 == values.len() && values.len() > period {
            prev = Some(now);
        }
        now = ema.next(value);
    }

    EmaPair {
        now: Some(now),
        prev,
    }
}

// ============================================================================
// RSI
// ============================================================================

/// RSI reported when the window has gains but no losses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ZeroLossRsi {
    /// Pure uptrend reads 100
    #[default]
    Saturate,
    /// Pure uptrend reads 50, like a flat market
    Neutral,
}

/// RSI over the trailing `period` deltas using plain averages of gains and
/// losses. A flat window reads 50.
pub fn calc_rsi(values: &[f64], period: usize, zero_loss: ZeroLossRsi) -> Option<f64> {
    if period == 0 || values.len() < period + 1 {
        return None;
    }

    let window = &values[values.len() - period - 1..];
    let (gains, losses) = window.windows(2).fold((0.0, 0.0), |(gains, losses), pair| {
        let delta = pair[1] - pair[0];
        if delta > 0.0 {
            (gains + delta, losses)
        } else {
            (gains, losses - delta)
        }
    });

    let avg_gain = gains / period as f64;
    let avg_loss = losses / period as f64;

    if avg_loss == 0.0 {
        if avg_gain == 0.0 {
            return Some(50.0);
        }
        return Some(match zero_loss {
            ZeroLossRsi::Saturate => 100.0,
            ZeroLossRsi::Neutral => 50.0,
        });
    }

    let rs = avg_gain / avg_loss;
    Some((100.0 - 100.0 / (1.0 + rs)).clamp(0.0, 100.0))
}

// ============================================================================
// Snapshot
// ============================================================================

/// Indicator periods and conventions
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IndicatorConfig {
    pub ema_fast: usize,
    pub ema_slow: usize,
    pub rsi_period: usize,
    pub zero_loss_rsi: ZeroLossRsi,
}

impl Default for IndicatorConfig {
    fn default() -> Self {
        Self {
            ema_fast: 9,
            ema_slow: 21,
            rsi_period: 14,
            zero_loss_rsi: ZeroLossRsi::Saturate,
        }
    }
}

impl IndicatorConfig {
    /// Samples needed before every snapshot field is populated.
    pub fn warmup(&self) -> usize {
        (self.ema_slow + 1).max(self.ema_fast + 1).max(self.rsi_period + 1)
    }
}

/// Indicator state for one instrument in one cycle. `None` = not enough history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndicatorSnapshot {
    pub price: Decimal,
    pub ema_fast: Option<f64>,
    pub ema_fast_prev: Option<f64>,
    pub ema_slow: Option<f64>,
    pub ema_slow_prev: Option<f64>,
    pub rsi: Option<f64>,
}

impl IndicatorSnapshot {
    pub fn from_closes(price: Decimal, closes: &[f64], config: &IndicatorConfig) -> Self {
        let fast = ema_pair(closes, config.ema_fast);
        let slow = ema_pair(closes, config.ema_slow);
        Self {
            price,
            ema_fast: fast.now,
            ema_fast_prev: fast.prev,
            ema_slow: slow.now,
            ema_slow_prev: slow.prev,
            rsi: calc_rsi(closes, config.rsi_period, config.zero_loss_rsi),
        }
    }
}

/// Snapshot of the series' latest close, or `None` for an empty series.
pub fn snapshot(series: &PriceSeries, config: &IndicatorConfig) -> Option<IndicatorSnapshot> {
    let price = series.last()?;
    Some(IndicatorSnapshot::from_closes(
        price,
        &series.to_f64(),
        config,
    ))
}
