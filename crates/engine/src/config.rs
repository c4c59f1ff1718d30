//! Bot configuration
//!
//! Resolution order: built-in defaults, then an optional TOML file, then
//! environment variables, then CLI flags (applied by the binary). Call
//! [`BotConfig::validate`] once everything is merged.

use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use crate::error::ConfigError;
use crate::indicators::IndicatorConfig;
use crate::ledger::{ExitPolicy, InstrumentSpec, LedgerConfig, ProfitLockMode};
use crate::strategy::SignalRules;

const MIN_HISTORY_CAP: usize = 50;
const MAX_HISTORY_CAP: usize = 500;
/// Largest page either venue serves per kline request
const MAX_KLINE_LIMIT: u32 = 1000;

/// Market-data venue
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExchangeKind {
    #[default]
    Bybit,
    Binance,
}

impl FromStr for ExchangeKind {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "bybit" => Ok(ExchangeKind::Bybit),
            "binance" => Ok(ExchangeKind::Binance),
            _ => Err(ConfigError::InvalidEnv {
                key: "exchange".to_string(),
                value: s.to_string(),
            }),
        }
    }
}

impl fmt::Display for ExchangeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExchangeKind::Bybit => write!(f, "bybit"),
            ExchangeKind::Binance => write!(f, "binance"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TelegramConfig {
    pub enabled: bool,
    pub bot_token: Option<String>,
    pub chat_id: Option<String>,
    /// Broadcast on the first cycle and then every N cycles
    pub broadcast_every_cycles: u64,
    /// Answer /status and /balance from the configured chat
    pub commands: bool,
}

impl Default for TelegramConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            bot_token: None,
            chat_id: None,
            broadcast_every_cycles: 1,
            commands: true,
        }
    }
}

/// Optional real-order notification hook (Bybit v5)
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OrderConfig {
    pub enabled: bool,
    pub api_key: Option<String>,
    pub api_secret: Option<String>,
    pub category: String,
}

impl Default for OrderConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            api_key: None,
            api_secret: None,
            category: "linear".to_string(),
        }
    }
}

/// Every tunable of the bot
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BotConfig {
    pub symbols: Vec<String>,
    pub exchange: ExchangeKind,
    pub testnet: bool,
    pub kline_interval_mins: u32,
    /// Closes requested per fetch
    pub kline_limit: u32,
    pub poll_interval_secs: u64,
    pub fetch_timeout_secs: u64,
    pub history_cap: usize,
    pub starting_cash: Decimal,
    pub indicators: IndicatorConfig,
    pub signal: SignalRules,
    pub ledger: LedgerConfig,
    /// Quantity constraints by symbol; unknown symbols accept any quantity
    pub instruments: BTreeMap<String, InstrumentSpec>,
    pub telegram: TelegramConfig,
    pub orders: OrderConfig,
}

impl Default for BotConfig {
    fn default() -> Self {
        Self {
            symbols: ["BTCUSDT", "ETHUSDT", "BNBUSDT", "LTCUSDT", "XRPUSDT"]
                .into_iter()
                .map(String::from)
                .collect(),
            exchange: ExchangeKind::Bybit,
            testnet: false,
            kline_interval_mins: 1,
            kline_limit: 50,
            poll_interval_secs: 60,
            fetch_timeout_secs: 5,
            history_cap: crate::indicators::DEFAULT_HISTORY_CAP,
            starting_cash: dec!(1000),
            indicators: IndicatorConfig::default(),
            signal: SignalRules::default(),
            ledger: LedgerConfig::default(),
            instruments: default_instruments(),
            telegram: TelegramConfig::default(),
            orders: OrderConfig::default(),
        }
    }
}

/// Lot sizes for the majors the bot trades out of the box
pub fn default_instruments() -> BTreeMap<String, InstrumentSpec> {
    [
        ("BTCUSDT", dec!(0.001), dec!(0.001)),
        ("ETHUSDT", dec!(0.01), dec!(0.001)),
        ("BNBUSDT", dec!(0.1), dec!(0.01)),
        ("LTCUSDT", dec!(0.1), dec!(0.01)),
        ("XRPUSDT", dec!(1), dec!(1)),
    ]
    .into_iter()
    .map(|(symbol, min_qty, qty_step)| (symbol.to_string(), InstrumentSpec::new(min_qty, qty_step)))
    .collect()
}

impl BotConfig {
    /// Defaults overridden by `path` (if given) and the process environment.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut config = match path {
            Some(path) => Self::from_file(path)?,
            None => Self::default(),
        };
        config.apply_env_from(|key| std::env::var(key).ok())?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_toml(&content)
    }

    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(content)?)
    }

    /// Apply environment overrides read through `lookup`.
    pub fn apply_env_from<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(symbols) = lookup("DIGIBOT_SYMBOLS") {
            self.symbols = parse_symbols(&symbols);
        }
        if let Some(secs) = lookup("DIGIBOT_POLL_SECS") {
            self.poll_interval_secs = parse_env("DIGIBOT_POLL_SECS", &secs)?;
        }
        if let Some(exchange) = lookup("DIGIBOT_EXCHANGE") {
            self.exchange = exchange.parse().map_err(|_| ConfigError::InvalidEnv {
                key: "DIGIBOT_EXCHANGE".to_string(),
                value: exchange,
            })?;
        }
        if let Some(token) = lookup("TELEGRAM_BOT_TOKEN") {
            self.telegram.bot_token = Some(token);
            self.telegram.enabled = true;
        }
        if let Some(chat_id) = lookup("TELEGRAM_CHAT_ID") {
            self.telegram.chat_id = Some(chat_id);
        }
        if let Some(commands) = lookup("TELEGRAM_COMMANDS") {
            self.telegram.commands = parse_env("TELEGRAM_COMMANDS", &commands)?;
        }
        if let Some(key) = lookup("BYBIT_API_KEY") {
            self.orders.api_key = Some(key);
        }
        if let Some(secret) = lookup("BYBIT_API_SECRET") {
            self.orders.api_secret = Some(secret);
        }
        if let Some(testnet) = lookup("BYBIT_TESTNET") {
            self.testnet = parse_env("BYBIT_TESTNET", &testnet)?;
        }
        Ok(())
    }

    /// Overwrite EMA periods, RSI lines and the exit policy with a preset.
    /// The fetch size and history window grow to cover the new warm-up.
    pub fn apply_preset(&mut self, preset: Preset) {
        let p = preset.params();
        self.indicators.ema_fast = p.ema_fast;
        self.indicators.ema_slow = p.ema_slow;
        self.signal.overbought = p.overbought;
        self.signal.oversold = p.oversold;
        self.ledger.exit = ExitPolicy::Harvest {
            threshold: p.lock_threshold,
            mode: ProfitLockMode::ResetBaseline,
        };

        let warmup = self.indicators.warmup();
        self.history_cap = self.history_cap.max(warmup);
        self.kline_limit = self.kline_limit.max(warmup as u32);
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.symbols.is_empty() {
            return Err(ConfigError::Missing("symbols"));
        }
        let ind = &self.indicators;
        if ind.ema_fast == 0 || ind.ema_slow == 0 || ind.rsi_period == 0 {
            return Err(ConfigError::Invalid(
                "indicator periods must be positive".to_string(),
            ));
        }
        if ind.ema_fast >= ind.ema_slow {
            return Err(ConfigError::Invalid(format!(
                "fast EMA period ({}) must be shorter than slow ({})",
                ind.ema_fast, ind.ema_slow
            )));
        }
        if !(MIN_HISTORY_CAP..=MAX_HISTORY_CAP).contains(&self.history_cap) {
            return Err(ConfigError::Invalid(format!(
                "history_cap must be between {} and {}",
                MIN_HISTORY_CAP, MAX_HISTORY_CAP
            )));
        }
        if self.history_cap < ind.warmup() {
            return Err(ConfigError::Invalid(format!(
                "history_cap {} cannot hold the {} closes the indicators need",
                self.history_cap,
                ind.warmup()
            )));
        }

        let rules = &self.signal;
        if !(0.0..=100.0).contains(&rules.oversold)
            || !(0.0..=100.0).contains(&rules.overbought)
            || rules.oversold >= rules.overbought
        {
            return Err(ConfigError::Invalid(format!(
                "RSI lines must satisfy 0 <= oversold ({}) < overbought ({}) <= 100",
                rules.oversold, rules.overbought
            )));
        }
        if rules.chop_threshold < 0.0 {
            return Err(ConfigError::Invalid(
                "chop_threshold cannot be negative".to_string(),
            ));
        }

        if self.poll_interval_secs == 0 || self.fetch_timeout_secs == 0 {
            return Err(ConfigError::Invalid(
                "poll and fetch intervals must be positive".to_string(),
            ));
        }
        // each cycle sees only the latest fetch
        if (self.kline_limit as usize) < ind.warmup() {
            return Err(ConfigError::Invalid(format!(
                "kline_limit {} is shorter than the {} closes the indicators need",
                self.kline_limit,
                ind.warmup()
            )));
        }
        if self.kline_limit > MAX_KLINE_LIMIT {
            return Err(ConfigError::Invalid(format!(
                "kline_limit cannot exceed {}",
                MAX_KLINE_LIMIT
            )));
        }
        if self.starting_cash < Decimal::ZERO {
            return Err(ConfigError::Invalid(
                "starting_cash cannot be negative".to_string(),
            ));
        }
        self.ledger.validate()?;

        if self.telegram.enabled {
            if self.telegram.bot_token.as_deref().map_or(true, str::is_empty) {
                return Err(ConfigError::Missing("telegram.bot_token"));
            }
            if self.telegram.chat_id.as_deref().map_or(true, str::is_empty) {
                return Err(ConfigError::Missing("telegram.chat_id"));
            }
            if self.telegram.broadcast_every_cycles == 0 {
                return Err(ConfigError::Invalid(
                    "telegram.broadcast_every_cycles must be positive".to_string(),
                ));
            }
        }
        if self.orders.enabled {
            if self.orders.api_key.as_deref().map_or(true, str::is_empty) {
                return Err(ConfigError::Missing("orders.api_key"));
            }
            if self.orders.api_secret.as_deref().map_or(true, str::is_empty) {
                return Err(ConfigError::Missing("orders.api_secret"));
            }
        }
        Ok(())
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }

    pub fn fetch_timeout(&self) -> Duration {
        Duration::from_secs(self.fetch_timeout_secs)
    }

    pub fn instrument(&self, symbol: &str) -> InstrumentSpec {
        self.instruments.get(symbol).copied().unwrap_or_default()
    }
}

/// `"btcusdt, ETHUSDT"` -> `["BTCUSDT", "ETHUSDT"]`
pub fn parse_symbols(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(|s| s.trim().to_uppercase())
        .filter(|s| !s.is_empty())
        .collect()
}

fn parse_env<T: FromStr>(key: &str, value: &str) -> Result<T, ConfigError> {
    value.trim().parse().map_err(|_| ConfigError::InvalidEnv {
        key: key.to_string(),
        value: value.to_string(),
    })
}

// ============================================================================
// Presets
// ============================================================================

/// Trading modes from the multi-mode harvest bot
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Preset {
    Scalp,
    Hedge,
    Swing,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PresetParams {
    pub ema_fast: usize,
    pub ema_slow: usize,
    pub overbought: f64,
    pub oversold: f64,
    pub lock_threshold: Decimal,
}

impl Preset {
    pub fn params(self) -> PresetParams {
        match self {
            Preset::Scalp => PresetParams {
                ema_fast: 9,
                ema_slow: 21,
                overbought: 55.0,
                oversold: 45.0,
                lock_threshold: dec!(0.5),
            },
            Preset::Hedge => PresetParams {
                ema_fast: 12,
                ema_slow: 26,
                overbought: 60.0,
                oversold: 40.0,
                lock_threshold: dec!(1.0),
            },
            Preset::Swing => PresetParams {
                ema_fast: 20,
                ema_slow: 50,
                overbought: 65.0,
                oversold: 35.0,
                lock_threshold: dec!(2.0),
            },
        }
    }
}

impl FromStr for Preset {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "scalp" => Ok(Preset::Scalp),
            "hedge" => Ok(Preset::Hedge),
            "swing" => Ok(Preset::Swing),
            _ => Err(ConfigError::Invalid(format!("unknown preset '{}'", s))),
        }
    }
}
