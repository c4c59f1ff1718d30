//! Per-cycle report and its text renderings

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::Serialize;
use std::collections::HashMap;
use std::fmt::Write;

use crate::ledger::{EngineState, LedgerEvent, Position};
use crate::strategy::Signal;
use crate::types::{Action, Side};

/// One instrument's outcome in a cycle
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum SymbolRow {
    Available(SymbolRecord),
    Unavailable { symbol: String, reason: String },
}

impl SymbolRow {
    pub fn symbol(&self) -> &str {
        match self {
            SymbolRow::Available(record) => &record.symbol,
            SymbolRow::Unavailable { symbol, .. } => symbol,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SymbolRecord {
    pub symbol: String,
    pub action: Action,
    pub signal: Signal,
    pub price: Decimal,
    pub rsi: Option<f64>,
    pub ema_fast: Option<f64>,
    pub ema_slow: Option<f64>,
    /// Position still open after this cycle
    pub position: Option<Position>,
    pub floating_pnl: Decimal,
    pub floating_pnl_pct: Decimal,
    pub events: Vec<LedgerEvent>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CycleReport {
    pub cycle: u64,
    pub timestamp: DateTime<Utc>,
    pub rows: Vec<SymbolRow>,
    pub wallet: Decimal,
    pub vault: Decimal,
    /// Free cash plus open positions marked to the latest known price
    pub equity: Decimal,
    pub open_positions: usize,
    pub closed_trades: u32,
    pub winning_trades: u32,
}

impl CycleReport {
    /// Assemble a report from the post-cycle state. `marks` holds the latest
    /// known price per symbol; positions without a mark count at entry.
    pub fn new(
        cycle: u64,
        timestamp: DateTime<Utc>,
        rows: Vec<SymbolRow>,
        state: &EngineState,
        marks: &HashMap<String, Decimal>,
    ) -> Self {
        let open_value: Decimal = state
            .positions()
            .map(|(symbol, position)| {
                let mark = marks
                    .get(symbol)
                    .copied()
                    .unwrap_or(position.entry_price);
                position.allocation + position.floating_pnl(mark)
            })
            .sum();

        Self {
            cycle,
            timestamp,
            rows,
            wallet: state.wallet.free_cash,
            vault: state.wallet.locked_vault,
            equity: state.wallet.free_cash + open_value,
            open_positions: state.open_positions(),
            closed_trades: state.closed_trades(),
            winning_trades: state.winning_trades(),
        }
    }

    pub fn available(&self) -> impl Iterator<Item = &SymbolRecord> {
        self.rows.iter().filter_map(|row| match row {
            SymbolRow::Available(record) => Some(record),
            SymbolRow::Unavailable { .. } => None,
        })
    }
}

fn fmt_opt(value: Option<f64>, decimals: usize) -> String {
    value.map_or_else(|| "-".to_string(), |v| format!("{:.*}", decimals, v))
}

fn position_label(position: Option<&Position>) -> String {
    match position {
        Some(p) => format!("{} @ {}", p.side, p.entry_price.round_dp(4)),
        None => "FLAT".to_string(),
    }
}

/// Fixed-width dashboard table followed by the wallet lines
pub fn render_table(report: &CycleReport) -> String {
    let mut out = String::new();
    let _ = writeln!(
        out,
        "Cycle #{} | {}",
        report.cycle,
        report.timestamp.format("%Y-%m-%d %H:%M:%S UTC")
    );
    let _ = writeln!(
        out,
        "{:<10} {:>14} {:>7} {:>14} {:>14} {:<6} {:<22} {:>12}",
        "SYMBOL", "PRICE", "RSI", "EMA FAST", "EMA SLOW", "ACTION", "POSITION", "PNL"
    );
    let _ = writeln!(out, "{}", "-".repeat(106));

    for row in &report.rows {
        match row {
            SymbolRow::Available(r) => {
                let pnl = if r.position.is_some() {
                    format!(
                        "{:+} ({:+}%)",
                        r.floating_pnl.round_dp(2),
                        r.floating_pnl_pct.round_dp(2)
                    )
                } else {
                    "-".to_string()
                };
                let _ = writeln!(
                    out,
                    "{:<10} {:>14} {:>7} {:>14} {:>14} {:<6} {:<22} {:>12}",
                    r.symbol,
                    r.price.to_string(),
                    fmt_opt(r.rsi, 2),
                    fmt_opt(r.ema_fast, 4),
                    fmt_opt(r.ema_slow, 4),
                    r.action,
                    position_label(r.position.as_ref()),
                    pnl
                );
            }
            SymbolRow::Unavailable { symbol, reason } => {
                let _ = writeln!(out, "{:<10} unavailable: {}", symbol, reason);
            }
        }
    }

    let _ = writeln!(out, "{}", "-".repeat(106));
    let _ = writeln!(out, "Wallet: {} USDT", report.wallet.round_dp(4).normalize());
    let _ = writeln!(out, "Vault:  {} USDT", report.vault.round_dp(4).normalize());
    let _ = writeln!(
        out,
        "Equity: {} USDT | open {} | closed {} (won {})",
        report.equity.round_dp(4).normalize(),
        report.open_positions,
        report.closed_trades,
        report.winning_trades
    );
    out
}

/// Markdown broadcast: one block per instrument with signal, entry, SL and TP
pub fn render_broadcast(report: &CycleReport) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "*DigiBot* - EMA+RSI signals (cycle {})", report.cycle);
    let _ = writeln!(out, "{}", report.timestamp.format("%Y-%m-%d %H:%M UTC"));

    for row in &report.rows {
        let _ = writeln!(out);
        match row {
            SymbolRow::Available(r) => {
                let direction = match r.signal {
                    Signal::Buy => "LONG",
                    Signal::Sell => "SHORT",
                    Signal::Wait => "WAIT",
                };
                let _ = writeln!(out, "*{}*: {} ({})", r.symbol, direction, r.action);
                let _ = writeln!(out, "Price: {} | RSI: {}", r.price, fmt_opt(r.rsi, 1));
                if let Some(p) = &r.position {
                    let _ = writeln!(out, "Entry: {} {}", side_word(p.side), p.entry_price);
                    if let Some(sl) = p.stop_loss {
                        let _ = writeln!(out, "SL: {}", sl.round_dp(4));
                    }
                    if let Some(tp) = p.take_profit {
                        let _ = writeln!(out, "TP: {}", tp.round_dp(4));
                    }
                }
            }
            SymbolRow::Unavailable { symbol, .. } => {
                let _ = writeln!(out, "*{}*: data unavailable", symbol);
            }
        }
    }

    let _ = writeln!(out);
    let _ = write!(
        out,
        "Wallet: {} | Vault: {} USDT",
        report.wallet.round_dp(2),
        report.vault.round_dp(2)
    );
    out
}

fn side_word(side: Side) -> &'static str {
    match side {
        Side::Long => "long",
        Side::Short => "short",
    }
}
