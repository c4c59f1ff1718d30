//! Live polling loop
//!
//! One [`CycleRunner`] owns the engine state. Each cycle fetches every
//! symbol concurrently, then walks the symbols in configured order through
//! indicators, decision and ledger, and finally hands one [`CycleReport`] to
//! every sink.

use chrono::{DateTime, Utc};
use futures_util::future::join_all;
use rust_decimal::Decimal;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::api::{MarketData, OrderHook, OrderRequest, PaperOrderHook};
use crate::config::BotConfig;
use crate::error::{EngineError, EngineResult};
use crate::indicators::{snapshot, PriceSeries};
use crate::ledger::{EngineState, LedgerEvent, PositionLedger};
use crate::report::{CycleReport, SymbolRecord, SymbolRow};
use crate::sinks::ReportSink;
use crate::strategy::{decide, Signal};
use crate::types::Action;

pub struct CycleRunner {
    config: BotConfig,
    market: Arc<dyn MarketData>,
    orders: Arc<dyn OrderHook>,
    ledger: PositionLedger,
    state: EngineState,
    series: HashMap<String, PriceSeries>,
    cycle: u64,
}

impl CycleRunner {
    pub fn new(config: BotConfig, market: Arc<dyn MarketData>) -> Self {
        let series = config
            .symbols
            .iter()
            .map(|s| (s.clone(), PriceSeries::new(config.history_cap)))
            .collect();
        Self {
            ledger: PositionLedger::new(config.ledger.clone()),
            state: EngineState::new(config.starting_cash),
            orders: Arc::new(PaperOrderHook),
            market,
            series,
            cycle: 0,
            config,
        }
    }

    pub fn with_order_hook(mut self, orders: Arc<dyn OrderHook>) -> Self {
        self.orders = orders;
        self
    }

    pub fn state(&self) -> &EngineState {
        &self.state
    }

    pub fn cycles_run(&self) -> u64 {
        self.cycle
    }

    /// Poll until `shutdown` resolves. A cycle that overruns the poll
    /// interval makes the next tick be skipped; shutdown is honored between
    /// cycles.
    pub async fn run<F>(&mut self, sinks: &[Arc<dyn ReportSink>], shutdown: F)
    where
        F: Future<Output = ()>,
    {
        let mut ticker = tokio::time::interval(self.config.poll_interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        tokio::pin!(shutdown);

        info!(
            symbols = ?self.config.symbols,
            source = self.market.name(),
            every_secs = self.config.poll_interval_secs,
            "Cycle runner starting"
        );

        loop {
            tokio::select! {
                _ = &mut shutdown => break,
                _ = ticker.tick() => {}
            }
            let report = self.run_cycle(Utc::now()).await;
            publish(sinks, &report).await;
        }

        info!(cycles = self.cycle, "Cycle runner stopped");
    }

    /// Execute one full cycle and return its report.
    pub async fn run_cycle(&mut self, now: DateTime<Utc>) -> CycleReport {
        self.cycle += 1;
        let fetched = self.fetch_all().await;

        let mut rows = Vec::with_capacity(fetched.len());
        let mut orders = Vec::new();

        for (symbol, result) in fetched {
            match result {
                Ok(closes) => {
                    let (record, requests) = self.process_symbol(&symbol, &closes, now);
                    orders.extend(requests);
                    rows.push(SymbolRow::Available(record));
                }
                Err(e) => {
                    warn!(symbol = %symbol, error = %e, "Skipping symbol this cycle");
                    rows.push(SymbolRow::Unavailable {
                        symbol,
                        reason: e.to_string(),
                    });
                }
            }
        }

        for order in &orders {
            match self.orders.submit(order).await {
                Ok(id) => info!(symbol = %order.symbol, order_id = %id, "Order hook accepted"),
                Err(e) => warn!(symbol = %order.symbol, error = %e, "Order hook failed"),
            }
        }

        let marks: HashMap<String, Decimal> = self
            .series
            .iter()
            .filter_map(|(symbol, series)| series.last().map(|p| (symbol.clone(), p)))
            .collect();

        let report = CycleReport::new(self.cycle, now, rows, &self.state, &marks);
        debug!(
            cycle = self.cycle,
            wallet = %report.wallet,
            vault = %report.vault,
            equity = %report.equity,
            "Cycle complete"
        );
        report
    }

    async fn fetch_all(&self) -> Vec<(String, EngineResult<Vec<Decimal>>)> {
        let timeout = self.config.fetch_timeout();
        let fetches = self.config.symbols.iter().map(|symbol| {
            let market = Arc::clone(&self.market);
            async move {
                let result = match tokio::time::timeout(timeout, market.recent_closes(symbol)).await
                {
                    Ok(Ok(closes)) if closes.is_empty() => {
                        Err(EngineError::fetch(symbol, "no closes returned"))
                    }
                    Ok(result) => result,
                    Err(_) => Err(EngineError::fetch(
                        symbol,
                        format!("timed out after {}s", timeout.as_secs()),
                    )),
                };
                (symbol.clone(), result)
            }
        });
        join_all(fetches).await
    }

    fn process_symbol(
        &mut self,
        symbol: &str,
        closes: &[Decimal],
        now: DateTime<Utc>,
    ) -> (SymbolRecord, Vec<OrderRequest>) {
        let series = self
            .series
            .entry(symbol.to_string())
            .or_insert_with(|| PriceSeries::new(self.config.history_cap));
        series.replace(closes);

        let snap = snapshot(series, &self.config.indicators);
        let price = series.last().unwrap_or_default();
        let signal = snap
            .as_ref()
            .map_or(Signal::Wait, |s| decide(s, &self.config.signal));

        let held_qty = self.state.position(symbol).map(|p| p.quantity);
        let instrument = self.config.instrument(symbol);
        let events = match self.ledger.apply(
            &mut self.state,
            symbol,
            price,
            signal,
            &instrument,
            now.timestamp_millis(),
        ) {
            Ok(events) => events,
            Err(e) => {
                warn!(symbol, error = %e, "Entry skipped");
                Vec::new()
            }
        };

        let orders = events
            .iter()
            .filter_map(|event| order_for(symbol, event, held_qty))
            .collect();

        let position = self.state.position(symbol).cloned();
        let (floating_pnl, floating_pnl_pct) = position
            .as_ref()
            .map(|p| (p.floating_pnl(price), p.floating_pnl_pct(price)))
            .unwrap_or_default();

        debug!(symbol, price = %price, signal = %signal, "Processed symbol");

        let record = SymbolRecord {
            symbol: symbol.to_string(),
            action: Action::new(signal, position.is_some()),
            signal,
            price,
            rsi: snap.as_ref().and_then(|s| s.rsi),
            ema_fast: snap.as_ref().and_then(|s| s.ema_fast),
            ema_slow: snap.as_ref().and_then(|s| s.ema_slow),
            position,
            floating_pnl,
            floating_pnl_pct,
            events,
        };
        (record, orders)
    }
}

/// Order mirrored from an open or close event; ratchets and harvests place none.
fn order_for(symbol: &str, event: &LedgerEvent, held_qty: Option<Decimal>) -> Option<OrderRequest> {
    match event {
        LedgerEvent::Opened {
            side,
            quantity,
            stop_loss,
            take_profit,
            ..
        } => Some(OrderRequest {
            symbol: symbol.to_string(),
            side: *side,
            quantity: *quantity,
            take_profit: *take_profit,
            stop_loss: *stop_loss,
            reduce_only: false,
        }),
        LedgerEvent::Closed { side, .. } => Some(OrderRequest {
            symbol: symbol.to_string(),
            side: *side,
            quantity: held_qty?,
            take_profit: None,
            stop_loss: None,
            reduce_only: true,
        }),
        LedgerEvent::StopRatcheted { .. } | LedgerEvent::Harvested { .. } => None,
    }
}

/// Hand a report to every sink; failures are logged and never stop the loop.
pub async fn publish(sinks: &[Arc<dyn ReportSink>], report: &CycleReport) {
    for sink in sinks {
        if let Err(e) = sink.publish(report).await {
            warn!(sink = sink.name(), cycle = report.cycle, error = %e, "Report sink failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Preset;
    use crate::ledger::{ExitPolicy, ExitReason, ProtectiveExit};
    use crate::sinks::SnapshotStore;
    use async_trait::async_trait;
    use rust_decimal_macros::dec;
    use std::collections::HashSet;
    use std::sync::Mutex;
    use std::time::Duration;

    /// Serves fixed closes per symbol; symbols in `failing` error out and
    /// symbols in `stalled` never answer within the timeout.
    #[derive(Default)]
    struct FakeMarket {
        closes: Mutex<HashMap<String, Vec<Decimal>>>,
        failing: Mutex<HashSet<String>>,
        stalled: HashSet<String>,
    }

    impl FakeMarket {
        fn set(&self, symbol: &str, closes: Vec<Decimal>) {
            self.closes.lock().unwrap().insert(symbol.to_string(), closes);
        }

        fn fail(&self, symbol: &str, failing: bool) {
            let mut set = self.failing.lock().unwrap();
            if failing {
                set.insert(symbol.to_string());
            } else {
                set.remove(symbol);
            }
        }
    }

    #[async_trait]
    impl MarketData for FakeMarket {
        fn name(&self) -> &str {
            "fake"
        }

        async fn recent_closes(&self, symbol: &str) -> EngineResult<Vec<Decimal>> {
            if self.stalled.contains(symbol) {
                tokio::time::sleep(Duration::from_secs(600)).await;
            }
            if self.failing.lock().unwrap().contains(symbol) {
                return Err(EngineError::fetch(symbol, "HTTP 503"));
            }
            Ok(self
                .closes
                .lock()
                .unwrap()
                .get(symbol)
                .cloned()
                .unwrap_or_default())
        }
    }

    #[derive(Default)]
    struct RecordingHook {
        orders: Mutex<Vec<OrderRequest>>,
    }

    #[async_trait]
    impl OrderHook for RecordingHook {
        async fn submit(&self, order: &OrderRequest) -> EngineResult<String> {
            self.orders.lock().unwrap().push(order.clone());
            Err(EngineError::OrderRejected("testnet down".to_string()))
        }
    }

    const SYMBOLS: [&str; 5] = ["BTCUSDT", "ETHUSDT", "BNBUSDT", "LTCUSDT", "XRPUSDT"];

    fn config(symbols: &[&str]) -> BotConfig {
        let mut config = BotConfig::default();
        config.symbols = symbols.iter().map(|s| s.to_string()).collect();
        config.signal.rsi_extremes = false;
        config
    }

    fn ramp(len: usize) -> Vec<Decimal> {
        (0..len).map(|i| Decimal::from(100 + i as i64)).collect()
    }

    /// Slide then a choppy rally; the last bar is a fresh crossover buy at 109.
    fn crossover_closes() -> Vec<Decimal> {
        let mut closes: Vec<Decimal> = (0..30).map(|i| Decimal::from(130 - i)).collect();
        let mut price = 101;
        for i in 0..16 {
            price += if i % 2 == 0 { 2 } else { -1 };
            closes.push(Decimal::from(price));
        }
        closes
    }

    #[tokio::test]
    async fn test_failed_symbol_does_not_block_others() {
        let market = Arc::new(FakeMarket::default());
        for symbol in SYMBOLS {
            market.set(symbol, ramp(30));
        }
        market.fail("LTCUSDT", true);

        let mut runner = CycleRunner::new(config(&SYMBOLS), market);
        let report = runner.run_cycle(Utc::now()).await;

        assert_eq!(report.cycle, 1);
        assert_eq!(report.rows.len(), 5);
        assert_eq!(report.available().count(), 4);
        let symbols: Vec<&str> = report.rows.iter().map(|r| r.symbol()).collect();
        assert_eq!(symbols, SYMBOLS);
        match &report.rows[3] {
            SymbolRow::Unavailable { symbol, reason } => {
                assert_eq!(symbol, "LTCUSDT");
                assert!(reason.contains("HTTP 503"));
            }
            other => panic!("expected unavailable row, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_empty_closes_are_unavailable() {
        let market = Arc::new(FakeMarket::default());
        market.set("BTCUSDT", ramp(30));
        let mut runner = CycleRunner::new(config(&["BTCUSDT", "SOLUSDT"]), market);
        let report = runner.run_cycle(Utc::now()).await;
        assert!(matches!(
            &report.rows[1],
            SymbolRow::Unavailable { reason, .. } if reason.contains("no closes")
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_stalled_fetch_times_out() {
        let market = Arc::new(FakeMarket {
            stalled: HashSet::from(["ETHUSDT".to_string()]),
            ..Default::default()
        });
        market.set("BTCUSDT", ramp(30));
        market.set("ETHUSDT", ramp(30));

        let mut runner = CycleRunner::new(config(&["BTCUSDT", "ETHUSDT"]), market);
        let report = runner.run_cycle(Utc::now()).await;
        assert_eq!(report.available().count(), 1);
        assert!(matches!(
            &report.rows[1],
            SymbolRow::Unavailable { reason, .. } if reason.contains("timed out after 5s")
        ));
    }

    #[tokio::test]
    async fn test_short_history_waits() {
        let market = Arc::new(FakeMarket::default());
        market.set("BTCUSDT", ramp(10));
        let mut runner = CycleRunner::new(config(&["BTCUSDT"]), market);
        let report = runner.run_cycle(Utc::now()).await;

        let record = report.available().next().unwrap();
        assert_eq!(record.action, Action::Wait);
        assert_eq!(record.ema_slow, None);
        assert!(record.rsi.is_none());
        assert_eq!(report.wallet, dec!(1000));
    }

    #[tokio::test]
    async fn test_position_survives_fetch_gap_then_takes_profit() {
        let market = Arc::new(FakeMarket::default());
        let hook = Arc::new(RecordingHook::default());
        let mut config = config(&["BTCUSDT"]);
        config.ledger.exit = ExitPolicy::Protective(ProtectiveExit {
            take_profit_pct: Some(dec!(1.0)),
            ..Default::default()
        });
        let mut runner = CycleRunner::new(config, market.clone()).with_order_hook(hook.clone());

        let mut closes = crossover_closes();
        market.set("BTCUSDT", closes.clone());
        let report = runner.run_cycle(Utc::now()).await;
        let record = report.available().next().unwrap();
        assert_eq!(record.action, Action::Buy);
        assert_eq!(record.price, dec!(109));
        let position = record.position.clone().unwrap();
        assert_eq!(position.quantity, dec!(0.917));
        assert_eq!(report.wallet, dec!(900));

        // data gap: position and wallet untouched, equity marked at last close
        market.fail("BTCUSDT", true);
        let report = runner.run_cycle(Utc::now()).await;
        assert_eq!(report.available().count(), 0);
        assert_eq!(runner.state().position("BTCUSDT"), Some(&position));
        assert_eq!(report.wallet, dec!(900));
        assert_eq!(report.equity, dec!(1000));

        // take-profit at +1%
        market.fail("BTCUSDT", false);
        closes.push(dec!(110.5));
        market.set("BTCUSDT", closes);
        let report = runner.run_cycle(Utc::now()).await;
        let record = report.available().next().unwrap();
        assert!(record.position.is_none());
        assert!(matches!(
            record.events.last(),
            Some(LedgerEvent::Closed {
                reason: ExitReason::TakeProfit,
                ..
            })
        ));
        assert!(report.wallet > dec!(1001));
        assert_eq!(report.wallet, dec!(1000) + report.vault);
        assert_eq!(runner.state().closed_trades(), 1);

        // hook rejections are logged only; both orders were still attempted
        let orders = hook.orders.lock().unwrap();
        assert_eq!(orders.len(), 2);
        assert!(!orders[0].reduce_only);
        assert_eq!(orders[0].take_profit, Some(dec!(110.09)));
        assert!(orders[1].reduce_only);
        assert_eq!(orders[1].quantity, dec!(0.917));
    }

    #[tokio::test]
    async fn test_insufficient_funds_skips_entry() {
        let market = Arc::new(FakeMarket::default());
        market.set("BTCUSDT", crossover_closes());
        let mut config = config(&["BTCUSDT"]);
        config.starting_cash = dec!(50);
        let mut runner = CycleRunner::new(config, market);

        let report = runner.run_cycle(Utc::now()).await;
        let record = report.available().next().unwrap();
        assert_eq!(record.signal, Signal::Buy);
        assert!(record.position.is_none());
        assert_eq!(report.wallet, dec!(50));
    }

    #[tokio::test]
    async fn test_swing_preset_fetches_enough_history_to_trade() {
        let mut config = BotConfig::default();
        config.symbols = vec!["BTCUSDT".to_string()];
        config.apply_preset(Preset::Swing);
        config.validate().unwrap();

        // one fetch of steadily falling closes drives RSI to 0
        let closes: Vec<Decimal> = (0..config.kline_limit as i64)
            .map(|i| Decimal::from(1000 - 5 * i))
            .collect();
        let market = Arc::new(FakeMarket::default());
        market.set("BTCUSDT", closes);

        let mut runner = CycleRunner::new(config, market);
        let report = runner.run_cycle(Utc::now()).await;
        let record = report.available().next().unwrap();
        assert_eq!(record.rsi, Some(0.0));
        assert_eq!(record.signal, Signal::Buy);
        assert_eq!(record.action, Action::Buy);
        assert!(record.position.is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_publishes_one_report_per_cycle() {
        let market = Arc::new(FakeMarket::default());
        market.set("BTCUSDT", ramp(30));
        let store = SnapshotStore::new();
        let sinks: Vec<Arc<dyn ReportSink>> = vec![Arc::new(store.clone())];

        let mut runner = CycleRunner::new(config(&["BTCUSDT"]), market);
        // ticks at 0s, 60s and 120s
        runner
            .run(&sinks, tokio::time::sleep(Duration::from_secs(150)))
            .await;

        assert_eq!(runner.cycles_run(), 3);
        assert_eq!(store.latest().await.unwrap().cycle, 3);
    }
}
