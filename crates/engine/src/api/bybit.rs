//! Bybit v5 clients: public spot klines, signed market orders and the
//! account wallet balance

use async_trait::async_trait;
use chrono::Utc;
use hmac::{Hmac, Mac};
use reqwest::Client;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::Sha256;
use std::str::FromStr;
use std::time::Duration;
use tracing::{debug, info, warn};

use super::{bybit_interval, AccountBalance, MarketData, OrderHook, OrderRequest};
use crate::error::{EngineError, EngineResult};
use crate::types::{Kline, Side};

type HmacSha256 = Hmac<Sha256>;

const MAINNET_URL: &str = "https://api.bybit.com";
const TESTNET_URL: &str = "https://api-testnet.bybit.com";
const MAX_KLINES_PER_REQUEST: u32 = 1000;
const RECV_WINDOW: &str = "5000";
const ACCOUNT_TYPE: &str = "UNIFIED";

fn base_url(testnet: bool) -> &'static str {
    if testnet {
        TESTNET_URL
    } else {
        MAINNET_URL
    }
}

fn http_client() -> EngineResult<Client> {
    Client::builder()
        .timeout(Duration::from_secs(10))
        .build()
        .map_err(|e| EngineError::fetch("*", e))
}

/// Every v5 response is wrapped in this envelope
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Envelope<T> {
    ret_code: i64,
    ret_msg: String,
    result: Option<T>,
}

#[derive(Debug, Deserialize)]
struct KlineResult {
    #[serde(default)]
    list: Vec<Vec<String>>,
}

/// `[startTime, open, high, low, close, volume, turnover]`, all strings
fn parse_row(row: &[String], interval_ms: i64) -> Option<Kline> {
    let open_time: i64 = row.first()?.parse().ok()?;
    Some(Kline {
        open_time,
        open: Decimal::from_str(row.get(1)?).ok()?,
        high: Decimal::from_str(row.get(2)?).ok()?,
        low: Decimal::from_str(row.get(3)?).ok()?,
        close: Decimal::from_str(row.get(4)?).ok()?,
        volume: Decimal::from_str(row.get(5)?).ok()?,
        close_time: open_time + interval_ms - 1,
    })
}

/// Bybit public market data client (spot category)
#[derive(Clone)]
pub struct BybitClient {
    client: Client,
    base_url: String,
    interval_mins: u32,
    limit: u32,
}

impl BybitClient {
    pub fn new(testnet: bool, interval_mins: u32, limit: u32) -> EngineResult<Self> {
        Self::with_base_url(base_url(testnet), interval_mins, limit)
    }

    pub fn with_base_url(base_url: &str, interval_mins: u32, limit: u32) -> EngineResult<Self> {
        Ok(Self {
            client: http_client()?,
            base_url: base_url.trim_end_matches('/').to_string(),
            interval_mins,
            limit: limit.min(MAX_KLINES_PER_REQUEST),
        })
    }

    /// Fetch up to `limit` klines, oldest first
    pub async fn get_klines(&self, symbol: &str, limit: Option<u32>) -> EngineResult<Vec<Kline>> {
        let interval = bybit_interval(self.interval_mins);
        let limit = limit.unwrap_or(self.limit).min(MAX_KLINES_PER_REQUEST);
        let url = format!(
            "{}/v5/market/kline?category=spot&symbol={}&interval={}&limit={}",
            self.base_url, symbol, interval, limit
        );

        debug!(symbol, interval = %interval, "Fetching klines from Bybit");

        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| EngineError::fetch(symbol, e))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(EngineError::fetch(
                symbol,
                format!("Bybit API error {}: {}", status, body),
            ));
        }

        let envelope: Envelope<KlineResult> = response
            .json()
            .await
            .map_err(|e| EngineError::fetch(symbol, e))?;
        let klines = klines_from_envelope(symbol, envelope, self.interval_mins)?;

        debug!(symbol, count = klines.len(), "Fetched klines");
        Ok(klines)
    }
}

fn klines_from_envelope(
    symbol: &str,
    envelope: Envelope<KlineResult>,
    interval_mins: u32,
) -> EngineResult<Vec<Kline>> {
    if envelope.ret_code != 0 {
        return Err(EngineError::fetch(
            symbol,
            format!("Bybit retCode {}: {}", envelope.ret_code, envelope.ret_msg),
        ));
    }
    let rows = envelope.result.map(|r| r.list).unwrap_or_default();
    let interval_ms = i64::from(interval_mins) * 60_000;

    // Bybit lists newest first
    let mut klines: Vec<Kline> = rows
        .iter()
        .filter_map(|row| parse_row(row, interval_ms))
        .collect();
    klines.reverse();
    Ok(klines)
}

#[async_trait]
impl MarketData for BybitClient {
    fn name(&self) -> &str {
        "bybit"
    }

    async fn recent_closes(&self, symbol: &str) -> EngineResult<Vec<Decimal>> {
        let klines = self.get_klines(symbol, None).await?;
        Ok(klines.into_iter().map(|k| k.close).collect())
    }
}

// ============================================================================
// Signed orders
// ============================================================================

/// Hex HMAC-SHA256 of `payload` keyed by `secret`
pub fn sign(secret: &str, payload: &str) -> EngineResult<String> {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .map_err(|e| EngineError::OrderRejected(format!("invalid API secret: {}", e)))?;
    mac.update(payload.as_bytes());
    Ok(hex::encode(mac.finalize().into_bytes()))
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct CreateOrderBody<'a> {
    category: &'a str,
    symbol: &'a str,
    side: &'static str,
    order_type: &'static str,
    qty: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    take_profit: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    stop_loss: Option<String>,
    reduce_only: bool,
}

impl<'a> CreateOrderBody<'a> {
    fn market(category: &'a str, order: &'a OrderRequest) -> Self {
        // opening a long or closing a short buys
        let buys = matches!(
            (order.side, order.reduce_only),
            (Side::Long, false) | (Side::Short, true)
        );
        Self {
            category,
            symbol: &order.symbol,
            side: if buys { "Buy" } else { "Sell" },
            order_type: "Market",
            qty: order.quantity.normalize().to_string(),
            take_profit: order.take_profit.map(|p| p.normalize().to_string()),
            stop_loss: order.stop_loss.map(|p| p.normalize().to_string()),
            reduce_only: order.reduce_only,
        }
    }
}

/// Places Bybit v5 market orders signed with an API key pair
#[derive(Clone)]
pub struct BybitOrderClient {
    client: Client,
    base_url: String,
    api_key: String,
    api_secret: String,
    category: String,
}

impl BybitOrderClient {
    pub fn new(
        api_key: String,
        api_secret: String,
        testnet: bool,
        category: String,
    ) -> EngineResult<Self> {
        Ok(Self {
            client: http_client()?,
            base_url: base_url(testnet).to_string(),
            api_key,
            api_secret,
            category,
        })
    }

    fn signature(&self, timestamp: &str, body: &str) -> EngineResult<String> {
        let payload = format!("{}{}{}{}", timestamp, self.api_key, RECV_WINDOW, body);
        sign(&self.api_secret, &payload)
    }
}

#[async_trait]
impl OrderHook for BybitOrderClient {
    async fn submit(&self, order: &OrderRequest) -> EngineResult<String> {
        let body = serde_json::to_string(&CreateOrderBody::market(&self.category, order))
            .map_err(|e| EngineError::OrderRejected(e.to_string()))?;
        let timestamp = Utc::now().timestamp_millis().to_string();
        let signature = self.signature(&timestamp, &body)?;

        info!(symbol = %order.symbol, body = %body, "Submitting Bybit order");

        let response = self
            .client
            .post(format!("{}/v5/order/create", self.base_url))
            .header("X-BAPI-API-KEY", &self.api_key)
            .header("X-BAPI-SIGN", signature)
            .header("X-BAPI-SIGN-TYPE", "2")
            .header("X-BAPI-TIMESTAMP", &timestamp)
            .header("X-BAPI-RECV-WINDOW", RECV_WINDOW)
            .header("Content-Type", "application/json")
            .body(body)
            .send()
            .await
            .map_err(|e| EngineError::OrderRejected(e.to_string()))?;

        let envelope: Envelope<Value> = response
            .json()
            .await
            .map_err(|e| EngineError::OrderRejected(e.to_string()))?;

        if envelope.ret_code != 0 {
            warn!(symbol = %order.symbol, code = envelope.ret_code, msg = %envelope.ret_msg, "Bybit rejected order");
            return Err(EngineError::OrderRejected(format!(
                "retCode {}: {}",
                envelope.ret_code, envelope.ret_msg
            )));
        }

        let order_id = envelope
            .result
            .as_ref()
            .and_then(|r| r.get("orderId"))
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        Ok(order_id)
    }
}

// ============================================================================
// Account balance
// ============================================================================

#[derive(Debug, Deserialize)]
struct WalletBalanceResult {
    #[serde(default)]
    list: Vec<WalletAccount>,
}

#[derive(Debug, Deserialize)]
struct WalletAccount {
    #[serde(default)]
    coin: Vec<CoinBalance>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CoinBalance {
    coin: String,
    #[serde(default)]
    wallet_balance: String,
}

/// Wallet balance of `coin`; a coin the account has never held reads zero
fn balance_from_envelope(
    envelope: Envelope<WalletBalanceResult>,
    coin: &str,
) -> EngineResult<Decimal> {
    if envelope.ret_code != 0 {
        return Err(EngineError::Account(format!(
            "retCode {}: {}",
            envelope.ret_code, envelope.ret_msg
        )));
    }
    let Some(entry) = envelope
        .result
        .into_iter()
        .flat_map(|r| r.list)
        .flat_map(|account| account.coin)
        .find(|c| c.coin.eq_ignore_ascii_case(coin))
    else {
        return Ok(Decimal::ZERO);
    };
    if entry.wallet_balance.is_empty() {
        return Ok(Decimal::ZERO);
    }
    Decimal::from_str(&entry.wallet_balance).map_err(|e| {
        EngineError::Account(format!(
            "bad walletBalance '{}' for {}: {}",
            entry.wallet_balance, coin, e
        ))
    })
}

#[async_trait]
impl AccountBalance for BybitOrderClient {
    async fn wallet_balance(&self, coin: &str) -> EngineResult<Decimal> {
        let query = format!("accountType={}&coin={}", ACCOUNT_TYPE, coin);
        let timestamp = Utc::now().timestamp_millis().to_string();
        let signature = self.signature(&timestamp, &query)?;

        let response = self
            .client
            .get(format!("{}/v5/account/wallet-balance?{}", self.base_url, query))
            .header("X-BAPI-API-KEY", &self.api_key)
            .header("X-BAPI-SIGN", signature)
            .header("X-BAPI-SIGN-TYPE", "2")
            .header("X-BAPI-TIMESTAMP", &timestamp)
            .header("X-BAPI-RECV-WINDOW", RECV_WINDOW)
            .send()
            .await
            .map_err(|e| EngineError::Account(e.without_url().to_string()))?;

        let status = response.status();
        let envelope: Envelope<WalletBalanceResult> = response
            .json()
            .await
            .map_err(|e| EngineError::Account(format!("{} ({})", e.without_url(), status)))?;

        let balance = balance_from_envelope(envelope, coin)?;
        debug!(coin, balance = %balance, "Bybit wallet balance");
        Ok(balance)
    }
}
