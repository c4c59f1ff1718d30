//! Bar-by-bar replay of historical closes through the live decision and
//! ledger code

use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::Serialize;
use tracing::{debug, info};

use crate::config::BotConfig;
use crate::indicators::{snapshot, PriceSeries};
use crate::ledger::{EngineState, ExitReason, LedgerEvent, PositionLedger};
use crate::strategy::{decide, Signal};
use crate::types::{Kline, Side};

/// A round trip closed during the replay
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ReplayTrade {
    pub entry_time: i64,
    pub exit_time: i64,
    pub side: Side,
    pub entry_price: Decimal,
    pub exit_price: Decimal,
    pub allocation: Decimal,
    pub pnl: Decimal,
    pub reason: ExitReason,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EquityPoint {
    pub time: i64,
    pub equity: Decimal,
}

#[derive(Debug, Clone, Serialize)]
pub struct ReplaySummary {
    pub symbol: String,
    pub bars: usize,
    pub starting_cash: Decimal,
    pub final_wallet: Decimal,
    pub vault: Decimal,
    pub total_pnl: Decimal,
    pub total_pnl_pct: Decimal,
    pub closed_trades: u32,
    pub winning_trades: u32,
    pub win_rate: Decimal,
    /// Profit harvested from positions that stayed open
    pub harvested: Decimal,
    pub max_drawdown: Decimal,
    pub max_drawdown_pct: Decimal,
    pub trades: Vec<ReplayTrade>,
    pub equity_curve: Vec<EquityPoint>,
}

/// Entry details kept until the matching close
struct OpenTrade {
    entry_time: i64,
    entry_price: Decimal,
}

/// Replays one symbol on a private engine state
pub struct ReplayRunner;

impl ReplayRunner {
    /// Feed `klines` (oldest first) one bar at a time. A position still open
    /// after the last bar is closed at its close.
    pub fn run(config: &BotConfig, symbol: &str, klines: &[Kline]) -> ReplaySummary {
        let ledger = PositionLedger::new(config.ledger.clone());
        let mut state = EngineState::new(config.starting_cash);
        let mut series = PriceSeries::new(config.history_cap);
        let instrument = config.instrument(symbol);

        let mut trades: Vec<ReplayTrade> = Vec::new();
        let mut equity_curve: Vec<EquityPoint> = Vec::with_capacity(klines.len());
        let mut open: Option<OpenTrade> = None;
        let mut harvested = Decimal::ZERO;

        let mut peak_equity = config.starting_cash;
        let mut max_drawdown = Decimal::ZERO;
        let mut max_drawdown_pct = Decimal::ZERO;
        let hundred = dec!(100);

        info!(
            symbol,
            bars = klines.len(),
            cash = %config.starting_cash,
            "Starting replay"
        );

        for kline in klines {
            series.push(kline.close);
            let signal = snapshot(&series, &config.indicators)
                .map_or(Signal::Wait, |s| decide(&s, &config.signal));

            let events = match ledger.apply(
                &mut state,
                symbol,
                kline.close,
                signal,
                &instrument,
                kline.open_time,
            ) {
                Ok(events) => events,
                Err(e) => {
                    debug!(time = kline.open_time, error = %e, "Entry skipped");
                    Vec::new()
                }
            };

            for event in &events {
                record(event, kline.open_time, &mut open, &mut trades, &mut harvested);
            }

            let open_value = state
                .position(symbol)
                .map(|p| p.allocation + p.floating_pnl(kline.close))
                .unwrap_or_default();
            let equity = state.wallet.free_cash + open_value;
            equity_curve.push(EquityPoint {
                time: kline.open_time,
                equity,
            });

            if equity > peak_equity {
                peak_equity = equity;
            }
            let drawdown = peak_equity - equity;
            if drawdown > max_drawdown {
                max_drawdown = drawdown;
                if peak_equity > Decimal::ZERO {
                    max_drawdown_pct = drawdown / peak_equity * hundred;
                }
            }
        }

        if let Some(last) = klines.last() {
            if let Some(event) = state.close(symbol, last.close, ExitReason::EndOfData) {
                record(&event, last.open_time, &mut open, &mut trades, &mut harvested);
            }
        }

        let total_pnl = state.wallet.free_cash - config.starting_cash;
        let total_pnl_pct = if config.starting_cash > Decimal::ZERO {
            total_pnl / config.starting_cash * hundred
        } else {
            Decimal::ZERO
        };
        let win_rate = if state.closed_trades() > 0 {
            Decimal::from(state.winning_trades()) / Decimal::from(state.closed_trades()) * hundred
        } else {
            Decimal::ZERO
        };

        info!(
            symbol,
            trades = state.closed_trades(),
            wins = state.winning_trades(),
            total_pnl = %total_pnl.round_dp(4),
            max_drawdown = %max_drawdown.round_dp(4),
            "Replay complete"
        );

        ReplaySummary {
            symbol: symbol.to_string(),
            bars: klines.len(),
            starting_cash: config.starting_cash,
            final_wallet: state.wallet.free_cash,
            vault: state.wallet.locked_vault,
            total_pnl,
            total_pnl_pct,
            closed_trades: state.closed_trades(),
            winning_trades: state.winning_trades(),
            win_rate,
            harvested,
            max_drawdown,
            max_drawdown_pct,
            trades,
            equity_curve,
        }
    }
}

fn record(
    event: &LedgerEvent,
    time: i64,
    open: &mut Option<OpenTrade>,
    trades: &mut Vec<ReplayTrade>,
    harvested: &mut Decimal,
) {
    match event {
        LedgerEvent::Opened { entry_price, .. } => {
            *open = Some(OpenTrade {
                entry_time: time,
                entry_price: *entry_price,
            });
        }
        LedgerEvent::Harvested { amount, .. } => *harvested += *amount,
        LedgerEvent::Closed {
            side,
            reason,
            exit_price,
            allocation,
            realized_pnl,
        } => {
            let entry = open.take();
            trades.push(ReplayTrade {
                entry_time: entry.as_ref().map_or(time, |t| t.entry_time),
                exit_time: time,
                side: *side,
                entry_price: entry.map_or(*exit_price, |t| t.entry_price),
                exit_price: *exit_price,
                allocation: *allocation,
                pnl: *realized_pnl,
                reason: *reason,
            });
        }
        LedgerEvent::StopRatcheted { .. } => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::{ExitPolicy, ProfitLockMode};

    fn make_klines(prices: &[i64]) -> Vec<Kline> {
        prices
            .iter()
            .enumerate()
            .map(|(i, &p)| {
                let price = Decimal::from(p);
                Kline {
                    open_time: (i as i64) * 60000,
                    open: price,
                    high: price + dec!(1),
                    low: price - dec!(1),
                    close: price,
                    volume: dec!(100),
                    close_time: ((i + 1) as i64) * 60000 - 1,
                }
            })
            .collect()
    }

    /// Slide then a choppy rally that crosses up on the last bar at 109
    fn crossover_prices() -> Vec<i64> {
        let mut prices: Vec<i64> = (0..30).map(|i| 130 - i).collect();
        let mut price = 101;
        for i in 0..16 {
            price += if i % 2 == 0 { 2 } else { -1 };
            prices.push(price);
        }
        prices
    }

    fn quiet_config() -> BotConfig {
        let mut config = BotConfig::default();
        config.signal.rsi_extremes = false;
        config
    }

    #[test]
    fn test_empty_replay() {
        let summary = ReplayRunner::run(&BotConfig::default(), "BTCUSDT", &[]);
        assert_eq!(summary.bars, 0);
        assert_eq!(summary.closed_trades, 0);
        assert_eq!(summary.final_wallet, dec!(1000));
        assert_eq!(summary.total_pnl, Decimal::ZERO);
    }

    #[test]
    fn test_open_position_closed_at_end() {
        let klines = make_klines(&crossover_prices());
        let summary = ReplayRunner::run(&quiet_config(), "BTCUSDT", &klines);

        assert_eq!(summary.closed_trades, 1);
        let trade = &summary.trades[0];
        assert_eq!(trade.side, Side::Long);
        assert_eq!(trade.entry_price, dec!(109));
        assert_eq!(trade.reason, ExitReason::EndOfData);
        assert_eq!(trade.pnl, Decimal::ZERO);
        assert_eq!(summary.final_wallet, dec!(1000));
        assert_eq!(summary.equity_curve.len(), klines.len());
    }

    #[test]
    fn test_stop_loss_registers_drawdown() {
        let mut prices = crossover_prices();
        prices.push(108);
        let summary = ReplayRunner::run(&quiet_config(), "BTCUSDT", &make_klines(&prices));

        assert_eq!(summary.closed_trades, 1);
        assert_eq!(summary.winning_trades, 0);
        assert_eq!(summary.trades[0].reason, ExitReason::StopLoss);
        assert_eq!(summary.trades[0].exit_time, 46 * 60000);
        assert!(summary.total_pnl < Decimal::ZERO);
        assert_eq!(summary.max_drawdown, -summary.total_pnl);
        assert_eq!(summary.final_wallet, dec!(1000) + summary.vault);
    }

    #[test]
    fn test_harvest_replay_tracks_locked_profit() {
        let mut config = quiet_config();
        config.ledger.exit = ExitPolicy::Harvest {
            threshold: dec!(0.5),
            mode: ProfitLockMode::ResetBaseline,
        };
        let mut prices = crossover_prices();
        prices.push(110);
        let summary = ReplayRunner::run(&config, "BTCUSDT", &make_klines(&prices));

        // +1 on 109 with 100 allocated, harvested then closed flat at the end
        assert!(summary.harvested > dec!(0.9));
        assert_eq!(summary.vault, summary.harvested);
        assert_eq!(summary.trades[0].entry_price, dec!(109));
        assert_eq!(summary.final_wallet, dec!(1000) + summary.vault);
    }
}
