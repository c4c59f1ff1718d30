//! Simulated position bookkeeping
//!
//! [`EngineState`] holds the wallet and at most one open position per
//! instrument. [`PositionLedger`] applies one cycle's signal and price to that
//! state: it opens positions, tracks floating PnL, ratchets trailing stops,
//! harvests profit and closes positions. All money is `Decimal`.
//!
//! Accounting invariant: `free_cash + open allocations == starting cash +
//! locked_vault`, for every exit policy.

use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::{debug, info};

use crate::error::{AllocationError, ConfigError};
use crate::strategy::Signal;
use crate::types::Side;

const HUNDRED: Decimal = dec!(100);

// ============================================================================
// Configuration
// ============================================================================

/// How much capital an entry commits
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "scheme", rename_all = "snake_case")]
pub enum Allocation {
    /// Fixed amount of quote currency per entry
    Fixed { amount: Decimal },
    /// Fraction (0, 1] of the free cash at entry time
    WalletFraction { fraction: Decimal },
}

impl Allocation {
    pub fn amount(&self, free_cash: Decimal) -> Decimal {
        match self {
            Allocation::Fixed { amount } => *amount,
            Allocation::WalletFraction { fraction } => free_cash * *fraction,
        }
    }
}

/// Stop-loss / take-profit / trailing rules. Percentages are in percent units
/// (`0.5` means 0.5%).
///
/// No take-profit by default: a fixed target below `lock_in_pct` would close
/// every winner before the trailing stop engages.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProtectiveExit {
    pub stop_loss_pct: Option<Decimal>,
    pub take_profit_pct: Option<Decimal>,
    /// Floating PnL% at which the stop moves to break-even and starts trailing
    pub lock_in_pct: Option<Decimal>,
    /// Distance of the trailing stop behind price
    pub trail_pct: Decimal,
    /// Close once floating PnL% reaches this
    pub band_upper_pct: Option<Decimal>,
    /// Close once floating PnL% falls to this (negative)
    pub band_lower_pct: Option<Decimal>,
    pub exit_on_opposite_signal: bool,
}

impl Default for ProtectiveExit {
    fn default() -> Self {
        Self {
            stop_loss_pct: Some(dec!(0.5)),
            take_profit_pct: None,
            lock_in_pct: Some(dec!(2)),
            trail_pct: dec!(1),
            band_upper_pct: None,
            band_lower_pct: None,
            exit_on_opposite_signal: true,
        }
    }
}

/// What happens once harvested profit reaches the threshold
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProfitLockMode {
    /// Realize the floating PnL and move the entry price to the current price
    #[default]
    ResetBaseline,
    /// Close the position
    ClosePosition,
}

/// Exit and continuation policy for open positions
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "policy", rename_all = "snake_case")]
pub enum ExitPolicy {
    Protective(ProtectiveExit),
    /// Lock profit every time floating PnL reaches `threshold` quote units
    Harvest {
        threshold: Decimal,
        #[serde(default)]
        mode: ProfitLockMode,
    },
}

impl Default for ExitPolicy {
    fn default() -> Self {
        ExitPolicy::Protective(ProtectiveExit::default())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LedgerConfig {
    pub allocation: Allocation,
    pub exit: ExitPolicy,
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            allocation: Allocation::Fixed { amount: dec!(100) },
            exit: ExitPolicy::default(),
        }
    }
}

impl LedgerConfig {
    /// Reject sizing and exit settings that would refuse every entry or
    /// exit on the first tick.
    pub fn validate(&self) -> Result<(), ConfigError> {
        match self.allocation {
            Allocation::Fixed { amount } if amount <= Decimal::ZERO => {
                return Err(ConfigError::Invalid(format!(
                    "ledger.allocation.amount must be positive, got {}",
                    amount
                )));
            }
            Allocation::WalletFraction { fraction }
                if fraction <= Decimal::ZERO || fraction > Decimal::ONE =>
            {
                return Err(ConfigError::Invalid(format!(
                    "ledger.allocation.fraction must be in (0, 1], got {}",
                    fraction
                )));
            }
            _ => {}
        }

        match &self.exit {
            ExitPolicy::Protective(rules) => {
                let offsets = [
                    ("stop_loss_pct", rules.stop_loss_pct),
                    ("take_profit_pct", rules.take_profit_pct),
                    ("lock_in_pct", rules.lock_in_pct),
                    ("band_upper_pct", rules.band_upper_pct),
                    ("trail_pct", Some(rules.trail_pct)),
                ];
                for (name, value) in offsets {
                    if let Some(value) = value.filter(|v| *v <= Decimal::ZERO) {
                        return Err(ConfigError::Invalid(format!(
                            "ledger.exit.{} must be positive, got {}",
                            name, value
                        )));
                    }
                }
                if let Some(lower) = rules.band_lower_pct.filter(|v| *v >= Decimal::ZERO) {
                    return Err(ConfigError::Invalid(format!(
                        "ledger.exit.band_lower_pct must be negative, got {}",
                        lower
                    )));
                }
                if let Some(stop) = rules.stop_loss_pct.filter(|v| *v >= HUNDRED) {
                    return Err(ConfigError::Invalid(format!(
                        "ledger.exit.stop_loss_pct must be below 100, got {}",
                        stop
                    )));
                }
            }
            ExitPolicy::Harvest { threshold, .. } if *threshold <= Decimal::ZERO => {
                return Err(ConfigError::Invalid(format!(
                    "ledger.exit.threshold must be positive, got {}",
                    threshold
                )));
            }
            ExitPolicy::Harvest { .. } => {}
        }
        Ok(())
    }
}

/// Tradable-quantity constraints for one instrument
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct InstrumentSpec {
    pub min_qty: Decimal,
    pub qty_step: Decimal,
}

impl InstrumentSpec {
    pub fn new(min_qty: Decimal, qty_step: Decimal) -> Self {
        Self { min_qty, qty_step }
    }

    /// Round a raw quantity down to the instrument's step.
    pub fn normalize_quantity(&self, quantity: Decimal) -> Decimal {
        if self.qty_step.is_zero() {
            return quantity;
        }
        (quantity / self.qty_step).floor() * self.qty_step
    }
}

// ============================================================================
// State
// ============================================================================

/// An open simulated position
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Position {
    pub side: Side,
    pub entry_price: Decimal,
    pub allocation: Decimal,
    pub quantity: Decimal,
    pub stop_loss: Option<Decimal>,
    pub take_profit: Option<Decimal>,
    /// Profit harvested while this position stayed open
    pub locked_profit: Decimal,
    pub opened_at: i64,
}

impl Position {
    /// Unrealized PnL in quote currency at `price`.
    pub fn floating_pnl(&self, price: Decimal) -> Decimal {
        if self.entry_price.is_zero() {
            return Decimal::ZERO;
        }
        let diff = match self.side {
            Side::Long => price - self.entry_price,
            Side::Short => self.entry_price - price,
        };
        diff * self.allocation / self.entry_price
    }

    pub fn floating_pnl_pct(&self, price: Decimal) -> Decimal {
        if self.allocation.is_zero() {
            return Decimal::ZERO;
        }
        self.floating_pnl(price) / self.allocation * HUNDRED
    }

    fn stop_touched(&self, price: Decimal) -> bool {
        match (self.side, self.stop_loss) {
            (Side::Long, Some(stop)) => price <= stop,
            (Side::Short, Some(stop)) => price >= stop,
            (_, None) => false,
        }
    }

    fn take_profit_touched(&self, price: Decimal) -> bool {
        match (self.side, self.take_profit) {
            (Side::Long, Some(target)) => price >= target,
            (Side::Short, Some(target)) => price <= target,
            (_, None) => false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Wallet {
    pub free_cash: Decimal,
    /// Cumulative realized PnL
    pub locked_vault: Decimal,
}

/// Wallet and open positions owned by one engine instance
#[derive(Debug, Clone, Serialize)]
pub struct EngineState {
    pub wallet: Wallet,
    starting_cash: Decimal,
    positions: BTreeMap<String, Position>,
    closed_trades: u32,
    winning_trades: u32,
}

impl EngineState {
    pub fn new(starting_cash: Decimal) -> Self {
        Self {
            wallet: Wallet {
                free_cash: starting_cash,
                locked_vault: Decimal::ZERO,
            },
            starting_cash,
            positions: BTreeMap::new(),
            closed_trades: 0,
            winning_trades: 0,
        }
    }

    pub fn starting_cash(&self) -> Decimal {
        self.starting_cash
    }

    pub fn position(&self, symbol: &str) -> Option<&Position> {
        self.positions.get(symbol)
    }

    pub fn positions(&self) -> impl Iterator<Item = (&String, &Position)> {
        self.positions.iter()
    }

    pub fn open_positions(&self) -> usize {
        self.positions.len()
    }

    /// Capital currently committed to open positions
    pub fn open_allocation(&self) -> Decimal {
        self.positions.values().map(|p| p.allocation).sum()
    }

    pub fn closed_trades(&self) -> u32 {
        self.closed_trades
    }

    pub fn winning_trades(&self) -> u32 {
        self.winning_trades
    }

    /// Close `symbol`'s position at `price`, returning capital plus realized
    /// PnL to the wallet.
    pub fn close(&mut self, symbol: &str, price: Decimal, reason: ExitReason) -> Option<LedgerEvent> {
        let position = self.positions.remove(symbol)?;
        let realized = position.floating_pnl(price);

        self.wallet.free_cash += position.allocation + realized;
        self.wallet.locked_vault += realized;
        self.closed_trades += 1;
        if realized > Decimal::ZERO {
            self.winning_trades += 1;
        }

        info!(
            symbol,
            side = %position.side,
            entry = %position.entry_price,
            exit = %price,
            pnl = %realized.round_dp(4),
            reason = ?reason,
            "Closed position"
        );

        Some(LedgerEvent::Closed {
            side: position.side,
            reason,
            exit_price: price,
            allocation: position.allocation,
            realized_pnl: realized,
        })
    }
}

// ============================================================================
// Events
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExitReason {
    StopLoss,
    TakeProfit,
    PnlBand,
    OppositeSignal,
    ProfitLock,
    /// Replay ran out of bars
    EndOfData,
}

/// State changes the ledger made during one cycle
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum LedgerEvent {
    Opened {
        side: Side,
        entry_price: Decimal,
        allocation: Decimal,
        quantity: Decimal,
        stop_loss: Option<Decimal>,
        take_profit: Option<Decimal>,
    },
    StopRatcheted {
        from: Option<Decimal>,
        to: Decimal,
    },
    Harvested {
        amount: Decimal,
        new_entry: Decimal,
    },
    Closed {
        side: Side,
        reason: ExitReason,
        exit_price: Decimal,
        allocation: Decimal,
        realized_pnl: Decimal,
    },
}

// ============================================================================
// Ledger
// ============================================================================

/// Applies signals and prices to an [`EngineState`]
#[derive(Debug, Clone, Default)]
pub struct PositionLedger {
    config: LedgerConfig,
}

impl PositionLedger {
    pub fn new(config: LedgerConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &LedgerConfig {
        &self.config
    }

    /// Run one cycle for `symbol`.
    ///
    /// FLAT + Buy/Sell opens a position; an open position is marked to
    /// `price` and may ratchet, harvest or close. An `Err` means a refused
    /// entry and leaves `state` untouched.
    pub fn apply(
        &self,
        state: &mut EngineState,
        symbol: &str,
        price: Decimal,
        signal: Signal,
        instrument: &InstrumentSpec,
        now: i64,
    ) -> Result<Vec<LedgerEvent>, AllocationError> {
        if state.positions.contains_key(symbol) {
            return Ok(self.manage(state, symbol, price, signal));
        }

        match Side::from_signal(signal) {
            Some(side) => {
                let opened = self.open(state, symbol, side, price, instrument, now)?;
                Ok(vec![opened])
            }
            None => Ok(Vec::new()),
        }
    }

    fn open(
        &self,
        state: &mut EngineState,
        symbol: &str,
        side: Side,
        price: Decimal,
        instrument: &InstrumentSpec,
        now: i64,
    ) -> Result<LedgerEvent, AllocationError> {
        let free_cash = state.wallet.free_cash;
        let allocation = self.config.allocation.amount(free_cash);

        if allocation <= Decimal::ZERO {
            return Err(AllocationError::NonPositive(allocation));
        }
        if allocation > free_cash {
            return Err(AllocationError::InsufficientFunds {
                allocation,
                free_cash,
            });
        }
        if price <= Decimal::ZERO {
            return Err(AllocationError::InvalidPrice(price));
        }

        let quantity = instrument.normalize_quantity(allocation / price);
        if quantity <= Decimal::ZERO || quantity < instrument.min_qty {
            return Err(AllocationError::BelowMinQuantity {
                quantity,
                min_qty: instrument.min_qty,
            });
        }

        let (stop_loss, take_profit) = match &self.config.exit {
            ExitPolicy::Protective(rules) => (
                rules.stop_loss_pct.map(|pct| offset(price, side, -pct)),
                rules.take_profit_pct.map(|pct| offset(price, side, pct)),
            ),
            ExitPolicy::Harvest { .. } => (None, None),
        };

        state.wallet.free_cash -= allocation;
        state.positions.insert(
            symbol.to_string(),
            Position {
                side,
                entry_price: price,
                allocation,
                quantity,
                stop_loss,
                take_profit,
                locked_profit: Decimal::ZERO,
                opened_at: now,
            },
        );

        info!(
            symbol,
            side = %side,
            price = %price,
            allocation = %allocation,
            quantity = %quantity,
            "Opened position"
        );

        Ok(LedgerEvent::Opened {
            side,
            entry_price: price,
            allocation,
            quantity,
            stop_loss,
            take_profit,
        })
    }

    fn manage(
        &self,
        state: &mut EngineState,
        symbol: &str,
        price: Decimal,
        signal: Signal,
    ) -> Vec<LedgerEvent> {
        let mut events = Vec::new();
        let Some(position) = state.positions.get_mut(symbol) else {
            return events;
        };

        let exit = match &self.config.exit {
            ExitPolicy::Protective(rules) => {
                protective_step(position, rules, price, signal, &mut events)
            }
            ExitPolicy::Harvest { threshold, mode } => harvest_step(
                position,
                &mut state.wallet,
                *threshold,
                *mode,
                price,
                signal,
                &mut events,
            ),
        };

        if let Some(reason) = exit {
            events.extend(state.close(symbol, price, reason));
        }
        events
    }
}

/// `price` moved by `pct` percent in the side's favorable direction.
fn offset(price: Decimal, side: Side, pct: Decimal) -> Decimal {
    match side {
        Side::Long => price * (HUNDRED + pct) / HUNDRED,
        Side::Short => price * (HUNDRED - pct) / HUNDRED,
    }
}

fn protective_step(
    position: &mut Position,
    rules: &ProtectiveExit,
    price: Decimal,
    signal: Signal,
    events: &mut Vec<LedgerEvent>,
) -> Option<ExitReason> {
    let pnl_pct = position.floating_pnl_pct(price);

    if let Some(lock_in) = rules.lock_in_pct {
        if pnl_pct >= lock_in {
            let trailed = offset(price, position.side, -rules.trail_pct);
            let candidate = match position.side {
                Side::Long => trailed.max(position.entry_price),
                Side::Short => trailed.min(position.entry_price),
            };
            let tighter = match (position.side, position.stop_loss) {
                (_, None) => true,
                (Side::Long, Some(stop)) => candidate > stop,
                (Side::Short, Some(stop)) => candidate < stop,
            };
            if tighter {
                debug!(from = ?position.stop_loss, to = %candidate, "Trailing stop ratcheted");
                events.push(LedgerEvent::StopRatcheted {
                    from: position.stop_loss,
                    to: candidate,
                });
                position.stop_loss = Some(candidate);
            }
        }
    }

    if position.stop_touched(price) {
        return Some(ExitReason::StopLoss);
    }
    if position.take_profit_touched(price) {
        return Some(ExitReason::TakeProfit);
    }
    if rules.band_upper_pct.is_some_and(|upper| pnl_pct >= upper)
        || rules.band_lower_pct.is_some_and(|lower| pnl_pct <= lower)
    {
        return Some(ExitReason::PnlBand);
    }
    if rules.exit_on_opposite_signal && signal == position.side.opposite_signal() {
        return Some(ExitReason::OppositeSignal);
    }
    None
}

fn harvest_step(
    position: &mut Position,
    wallet: &mut Wallet,
    threshold: Decimal,
    mode: ProfitLockMode,
    price: Decimal,
    signal: Signal,
    events: &mut Vec<LedgerEvent>,
) -> Option<ExitReason> {
    if signal == position.side.opposite_signal() {
        return Some(ExitReason::OppositeSignal);
    }

    let pnl = position.floating_pnl(price);
    if pnl < threshold || pnl <= Decimal::ZERO {
        return None;
    }

    match mode {
        ProfitLockMode::ClosePosition => Some(ExitReason::ProfitLock),
        ProfitLockMode::ResetBaseline => {
            wallet.free_cash += pnl;
            wallet.locked_vault += pnl;
            position.locked_profit += pnl;
            position.entry_price = price;
            info!(amount = %pnl.round_dp(4), new_entry = %price, "Harvested profit");
            events.push(LedgerEvent::Harvested {
                amount: pnl,
                new_entry: price,
            });
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const BTC: &str = "BTCUSDT";

    fn trailing_only() -> LedgerConfig {
        LedgerConfig {
            allocation: Allocation::Fixed { amount: dec!(100) },
            exit: ExitPolicy::Protective(ProtectiveExit {
                stop_loss_pct: None,
                take_profit_pct: None,
                ..Default::default()
            }),
        }
    }

    fn with_take_profit() -> LedgerConfig {
        LedgerConfig {
            exit: ExitPolicy::Protective(ProtectiveExit {
                take_profit_pct: Some(dec!(1.0)),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    fn any_qty() -> InstrumentSpec {
        InstrumentSpec::default()
    }

    fn step(
        ledger: &PositionLedger,
        state: &mut EngineState,
        price: Decimal,
        signal: Signal,
    ) -> Vec<LedgerEvent> {
        ledger
            .apply(state, BTC, price, signal, &any_qty(), 0)
            .unwrap()
    }

    fn assert_conserved(state: &EngineState) {
        assert_eq!(
            state.wallet.free_cash + state.open_allocation(),
            state.starting_cash() + state.wallet.locked_vault
        );
    }

    #[test]
    fn test_open_debits_allocation() {
        let ledger = PositionLedger::new(LedgerConfig::default());
        let mut state = EngineState::new(dec!(1000));

        let events = step(&ledger, &mut state, dec!(100), Signal::Buy);
        assert_eq!(state.wallet.free_cash, dec!(900));
        let pos = state.position(BTC).unwrap();
        assert_eq!(pos.side, Side::Long);
        assert_eq!(pos.quantity, dec!(1));
        assert_eq!(pos.stop_loss, Some(dec!(99.5)));
        assert_eq!(pos.take_profit, None);
        assert!(matches!(events[0], LedgerEvent::Opened { .. }));
        assert_conserved(&state);
    }

    #[test]
    fn test_short_levels_mirror_long() {
        let ledger = PositionLedger::new(with_take_profit());
        let mut state = EngineState::new(dec!(1000));
        step(&ledger, &mut state, dec!(200), Signal::Sell);

        let pos = state.position(BTC).unwrap();
        assert_eq!(pos.side, Side::Short);
        assert_eq!(pos.stop_loss, Some(dec!(201)));
        assert_eq!(pos.take_profit, Some(dec!(198)));
        assert_eq!(pos.floating_pnl(dec!(190)), dec!(5));
    }

    #[test]
    fn test_wait_when_flat_does_nothing() {
        let ledger = PositionLedger::new(LedgerConfig::default());
        let mut state = EngineState::new(dec!(1000));
        assert!(step(&ledger, &mut state, dec!(100), Signal::Wait).is_empty());
        assert_eq!(state.wallet.free_cash, dec!(1000));
    }

    #[test]
    fn test_overdraft_is_rejected() {
        let ledger = PositionLedger::new(LedgerConfig {
            allocation: Allocation::Fixed { amount: dec!(500) },
            ..Default::default()
        });
        let mut state = EngineState::new(dec!(400));
        let err = ledger
            .apply(&mut state, BTC, dec!(100), Signal::Buy, &any_qty(), 0)
            .unwrap_err();
        assert_eq!(
            err,
            AllocationError::InsufficientFunds {
                allocation: dec!(500),
                free_cash: dec!(400)
            }
        );
        assert_eq!(state.wallet.free_cash, dec!(400));
        assert!(state.position(BTC).is_none());
    }

    #[test]
    fn test_below_min_quantity_is_rejected() {
        let ledger = PositionLedger::new(LedgerConfig {
            allocation: Allocation::Fixed { amount: dec!(50) },
            ..Default::default()
        });
        let mut state = EngineState::new(dec!(1000));
        // 50 / 60000 = 0.00083 BTC, floored to 0.000 at a 0.001 step
        let btc = InstrumentSpec::new(dec!(0.001), dec!(0.001));
        let err = ledger
            .apply(&mut state, BTC, dec!(60000), Signal::Buy, &btc, 0)
            .unwrap_err();
        assert!(matches!(err, AllocationError::BelowMinQuantity { .. }));
        assert_eq!(state.wallet.free_cash, dec!(1000));
    }

    #[test]
    fn test_wallet_fraction_allocation() {
        let ledger = PositionLedger::new(LedgerConfig {
            allocation: Allocation::WalletFraction {
                fraction: dec!(0.1),
            },
            ..Default::default()
        });
        let mut state = EngineState::new(dec!(1000));
        step(&ledger, &mut state, dec!(100), Signal::Buy);
        assert_eq!(state.position(BTC).unwrap().allocation, dec!(100));
        assert_eq!(state.wallet.free_cash, dec!(900));

        ledger
            .apply(&mut state, "ETHUSDT", dec!(10), Signal::Sell, &any_qty(), 0)
            .unwrap();
        assert_eq!(state.position("ETHUSDT").unwrap().allocation, dec!(90));
        assert_eq!(state.wallet.free_cash, dec!(810));
    }

    #[test]
    fn test_trailing_stop_ratchets_and_closes() {
        let ledger = PositionLedger::new(trailing_only());
        let mut state = EngineState::new(dec!(1000));
        step(&ledger, &mut state, dec!(100), Signal::Buy);
        assert_eq!(state.position(BTC).unwrap().stop_loss, None);

        // +2%: floating PnL 2, stop jumps past break-even to 1% below price
        let events = step(&ledger, &mut state, dec!(102), Signal::Wait);
        let pos = state.position(BTC).unwrap();
        assert_eq!(pos.floating_pnl(dec!(102)), dec!(2));
        assert_eq!(pos.stop_loss, Some(dec!(100.98)));
        assert_eq!(
            events,
            vec![LedgerEvent::StopRatcheted {
                from: None,
                to: dec!(100.98)
            }]
        );

        // back to the stop: closes with 0.98 realized
        let events = step(&ledger, &mut state, dec!(100.98), Signal::Wait);
        assert!(state.position(BTC).is_none());
        assert_eq!(state.wallet.free_cash, dec!(1000.98));
        assert_eq!(state.wallet.locked_vault, dec!(0.98));
        assert!(matches!(
            events.last(),
            Some(LedgerEvent::Closed {
                reason: ExitReason::StopLoss,
                ..
            })
        ));
        assert_eq!(state.closed_trades(), 1);
        assert_eq!(state.winning_trades(), 1);
    }

    #[test]
    fn test_default_exit_ratchets_at_lock_in() {
        let ledger = PositionLedger::new(LedgerConfig::default());
        let mut state = EngineState::new(dec!(1000));
        step(&ledger, &mut state, dec!(100), Signal::Buy);

        // +2% holds on defaults; the 0.5% stop moves up behind price
        let events = step(&ledger, &mut state, dec!(102), Signal::Wait);
        assert_eq!(
            events,
            vec![LedgerEvent::StopRatcheted {
                from: Some(dec!(99.5)),
                to: dec!(100.98)
            }]
        );
        assert_eq!(state.open_positions(), 1);

        let events = step(&ledger, &mut state, dec!(100.9), Signal::Wait);
        assert!(matches!(
            events[0],
            LedgerEvent::Closed {
                reason: ExitReason::StopLoss,
                ..
            }
        ));
        assert_eq!(state.wallet.locked_vault, dec!(0.9));
        assert_conserved(&state);
    }

    #[test]
    fn test_trailing_stop_never_loosens() {
        let ledger = PositionLedger::new(trailing_only());
        let mut state = EngineState::new(dec!(1000));
        step(&ledger, &mut state, dec!(100), Signal::Buy);

        let prices = [
            dec!(102),
            dec!(105),
            dec!(104),
            dec!(108),
            dec!(107.5),
            dec!(110),
            dec!(109),
        ];
        let mut stops = Vec::new();
        for price in prices {
            step(&ledger, &mut state, price, Signal::Wait);
            stops.push(state.position(BTC).unwrap().stop_loss.unwrap());
        }
        assert!(stops.windows(2).all(|w| w[1] >= w[0]));
        assert_eq!(*stops.last().unwrap(), dec!(108.9));
    }

    #[test]
    fn test_short_trailing_stop_moves_down() {
        let ledger = PositionLedger::new(trailing_only());
        let mut state = EngineState::new(dec!(1000));
        step(&ledger, &mut state, dec!(100), Signal::Sell);

        step(&ledger, &mut state, dec!(97), Signal::Wait);
        assert_eq!(state.position(BTC).unwrap().stop_loss, Some(dec!(97.97)));
        step(&ledger, &mut state, dec!(97.5), Signal::Wait);
        assert_eq!(state.position(BTC).unwrap().stop_loss, Some(dec!(97.97)));

        step(&ledger, &mut state, dec!(98.5), Signal::Wait);
        assert!(state.position(BTC).is_none());
        assert_eq!(state.wallet.locked_vault, dec!(1.5));
        assert_conserved(&state);
    }

    #[test]
    fn test_stop_loss_and_take_profit_touch() {
        let ledger = PositionLedger::new(with_take_profit());
        let mut state = EngineState::new(dec!(1000));

        step(&ledger, &mut state, dec!(100), Signal::Buy);
        let events = step(&ledger, &mut state, dec!(99.4), Signal::Wait);
        assert!(matches!(
            events[0],
            LedgerEvent::Closed {
                reason: ExitReason::StopLoss,
                ..
            }
        ));
        assert_eq!(state.wallet.free_cash, dec!(999.4));

        step(&ledger, &mut state, dec!(100), Signal::Buy);
        let events = step(&ledger, &mut state, dec!(101.2), Signal::Wait);
        assert!(matches!(
            events[0],
            LedgerEvent::Closed {
                reason: ExitReason::TakeProfit,
                ..
            }
        ));
        assert_eq!(state.wallet.locked_vault, dec!(0.6));
        assert_conserved(&state);
    }

    #[test]
    fn test_pnl_band_exit() {
        let ledger = PositionLedger::new(LedgerConfig {
            exit: ExitPolicy::Protective(ProtectiveExit {
                stop_loss_pct: None,
                take_profit_pct: None,
                lock_in_pct: None,
                band_upper_pct: Some(dec!(1)),
                band_lower_pct: Some(dec!(-0.5)),
                ..Default::default()
            }),
            ..Default::default()
        });
        let mut state = EngineState::new(dec!(1000));

        step(&ledger, &mut state, dec!(100), Signal::Buy);
        assert!(step(&ledger, &mut state, dec!(100.9), Signal::Wait).is_empty());
        let events = step(&ledger, &mut state, dec!(101), Signal::Wait);
        assert!(matches!(
            events[0],
            LedgerEvent::Closed {
                reason: ExitReason::PnlBand,
                ..
            }
        ));

        step(&ledger, &mut state, dec!(100), Signal::Buy);
        let events = step(&ledger, &mut state, dec!(99.5), Signal::Wait);
        assert!(matches!(
            events[0],
            LedgerEvent::Closed {
                reason: ExitReason::PnlBand,
                realized_pnl,
                ..
            } if realized_pnl == dec!(-0.5)
        ));
    }

    #[test]
    fn test_opposite_signal_closes_without_reentry() {
        let ledger = PositionLedger::new(trailing_only());
        let mut state = EngineState::new(dec!(1000));
        step(&ledger, &mut state, dec!(100), Signal::Buy);

        let events = step(&ledger, &mut state, dec!(101), Signal::Sell);
        assert_eq!(events.len(), 1);
        assert!(state.position(BTC).is_none());
        assert_eq!(state.wallet.free_cash, dec!(1001));

        // same signal opens on the next cycle
        step(&ledger, &mut state, dec!(101), Signal::Sell);
        assert_eq!(state.position(BTC).unwrap().side, Side::Short);
    }

    #[test]
    fn test_repeated_entry_signal_keeps_single_position() {
        let ledger = PositionLedger::new(trailing_only());
        let mut state = EngineState::new(dec!(1000));
        step(&ledger, &mut state, dec!(100), Signal::Buy);
        step(&ledger, &mut state, dec!(100.5), Signal::Buy);
        assert_eq!(state.open_positions(), 1);
        assert_eq!(state.wallet.free_cash, dec!(900));
    }

    #[test]
    fn test_harvest_resets_baseline() {
        let ledger = PositionLedger::new(LedgerConfig {
            allocation: Allocation::Fixed { amount: dec!(200) },
            exit: ExitPolicy::Harvest {
                threshold: dec!(1),
                mode: ProfitLockMode::ResetBaseline,
            },
        });
        let mut state = EngineState::new(dec!(1000));
        step(&ledger, &mut state, dec!(100), Signal::Buy);
        assert_eq!(state.position(BTC).unwrap().stop_loss, None);

        // +0.4% on 200 = 0.8, below the threshold
        assert!(step(&ledger, &mut state, dec!(100.4), Signal::Wait).is_empty());

        // +0.75% on 200 = 1.5
        let events = step(&ledger, &mut state, dec!(100.75), Signal::Wait);
        assert_eq!(
            events,
            vec![LedgerEvent::Harvested {
                amount: dec!(1.5),
                new_entry: dec!(100.75)
            }]
        );
        let pos = state.position(BTC).unwrap();
        assert_eq!(pos.entry_price, dec!(100.75));
        assert_eq!(pos.locked_profit, dec!(1.5));
        assert_eq!(pos.floating_pnl(dec!(100.75)), Decimal::ZERO);
        assert_eq!(state.wallet.free_cash, dec!(801.5));
        assert_eq!(state.wallet.locked_vault, dec!(1.5));
        assert_conserved(&state);
    }

    #[test]
    fn test_harvest_close_mode_and_opposite_signal() {
        let ledger = PositionLedger::new(LedgerConfig {
            allocation: Allocation::Fixed { amount: dec!(200) },
            exit: ExitPolicy::Harvest {
                threshold: dec!(1),
                mode: ProfitLockMode::ClosePosition,
            },
        });
        let mut state = EngineState::new(dec!(1000));
        step(&ledger, &mut state, dec!(100), Signal::Buy);
        let events = step(&ledger, &mut state, dec!(101), Signal::Wait);
        assert!(matches!(
            events[0],
            LedgerEvent::Closed {
                reason: ExitReason::ProfitLock,
                ..
            }
        ));
        assert_eq!(state.wallet.free_cash, dec!(1002));

        step(&ledger, &mut state, dec!(100), Signal::Buy);
        let events = step(&ledger, &mut state, dec!(99), Signal::Sell);
        assert!(matches!(
            events[0],
            LedgerEvent::Closed {
                reason: ExitReason::OppositeSignal,
                ..
            }
        ));
        assert_eq!(state.wallet.free_cash, dec!(1000));
        assert_eq!(state.wallet.locked_vault, Decimal::ZERO);
    }

    #[test]
    fn test_capital_conserved_over_mixed_sequence() {
        let ledger = PositionLedger::new(LedgerConfig::default());
        let mut state = EngineState::new(dec!(1000));
        let tape = [
            ("BTCUSDT", dec!(100), Signal::Buy),
            ("ETHUSDT", dec!(50), Signal::Sell),
            ("BTCUSDT", dec!(100.7), Signal::Wait),
            ("ETHUSDT", dec!(50.4), Signal::Wait),
            ("BTCUSDT", dec!(101.5), Signal::Wait),
            ("XRPUSDT", dec!(2), Signal::Buy),
            ("ETHUSDT", dec!(49), Signal::Buy),
            ("XRPUSDT", dec!(1.98), Signal::Sell),
        ];
        for (symbol, price, signal) in tape {
            ledger
                .apply(&mut state, symbol, price, signal, &any_qty(), 0)
                .unwrap();
            assert_conserved(&state);
            assert!(state.wallet.free_cash >= Decimal::ZERO);
        }
    }

    #[test]
    fn test_validate_rejects_unusable_settings() {
        LedgerConfig::default().validate().unwrap();
        with_take_profit().validate().unwrap();

        let bad = [
            LedgerConfig {
                allocation: Allocation::Fixed { amount: dec!(-5) },
                ..Default::default()
            },
            LedgerConfig {
                allocation: Allocation::WalletFraction {
                    fraction: dec!(1.5),
                },
                ..Default::default()
            },
            LedgerConfig {
                allocation: Allocation::WalletFraction {
                    fraction: Decimal::ZERO,
                },
                ..Default::default()
            },
            LedgerConfig {
                exit: ExitPolicy::Harvest {
                    threshold: dec!(-1),
                    mode: ProfitLockMode::ResetBaseline,
                },
                ..Default::default()
            },
            LedgerConfig {
                exit: ExitPolicy::Protective(ProtectiveExit {
                    stop_loss_pct: Some(dec!(-0.5)),
                    ..Default::default()
                }),
                ..Default::default()
            },
            LedgerConfig {
                exit: ExitPolicy::Protective(ProtectiveExit {
                    take_profit_pct: Some(Decimal::ZERO),
                    ..Default::default()
                }),
                ..Default::default()
            },
            LedgerConfig {
                exit: ExitPolicy::Protective(ProtectiveExit {
                    trail_pct: dec!(-1),
                    ..Default::default()
                }),
                ..Default::default()
            },
            LedgerConfig {
                exit: ExitPolicy::Protective(ProtectiveExit {
                    band_lower_pct: Some(dec!(0.5)),
                    ..Default::default()
                }),
                ..Default::default()
            },
        ];
        for config in bad {
            assert!(
                matches!(config.validate(), Err(ConfigError::Invalid(_))),
                "accepted {:?}",
                config
            );
        }
    }

    #[test]
    fn test_normalize_quantity_floors_to_step() {
        let spec = InstrumentSpec::new(dec!(0.01), dec!(0.01));
        assert_eq!(spec.normalize_quantity(dec!(0.0379)), dec!(0.03));
        assert_eq!(
            InstrumentSpec::default().normalize_quantity(dec!(0.0379)),
            dec!(0.0379)
        );
    }
}
