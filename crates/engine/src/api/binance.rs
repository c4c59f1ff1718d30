//! Binance public API client for market data (no authentication required)

use async_trait::async_trait;
use reqwest::Client;
use rust_decimal::Decimal;
use serde::Deserialize;
use std::str::FromStr;
use std::time::Duration;
use tracing::debug;

use super::{binance_interval, MarketData};
use crate::error::{EngineError, EngineResult};
use crate::types::Kline;

const DEFAULT_BASE_URL: &str = "https://api.binance.com";
const MAX_KLINES_PER_REQUEST: u32 = 1000;

/// Binance public market data client
#[derive(Clone)]
pub struct BinanceClient {
    client: Client,
    base_url: String,
    interval: String,
    limit: u32,
}

/// Raw kline data from Binance API (array of arrays)
#[derive(Debug, Deserialize)]
#[allow(dead_code)]
struct RawKline(
    i64,    // 0: Open time
    String, // 1: Open
    String, // 2: High
    String, // 3: Low
    String, // 4: Close
    String, // 5: Volume
    i64,    // 6: Close time
    String, // 7: Quote asset volume
    u64,    // 8: Number of trades
    String, // 9: Taker buy base
    String, // 10: Taker buy quote
    String, // 11: Ignore
);

impl RawKline {
    fn into_kline(self) -> Option<Kline> {
        Some(Kline {
            open_time: self.0,
            open: Decimal::from_str(&self.1).ok()?,
            high: Decimal::from_str(&self.2).ok()?,
            low: Decimal::from_str(&self.3).ok()?,
            close: Decimal::from_str(&self.4).ok()?,
            volume: Decimal::from_str(&self.5).ok()?,
            close_time: self.6,
        })
    }
}

impl BinanceClient {
    pub fn new(interval_mins: u32, limit: u32) -> EngineResult<Self> {
        Self::with_base_url(DEFAULT_BASE_URL, interval_mins, limit)
    }

    pub fn with_base_url(base_url: &str, interval_mins: u32, limit: u32) -> EngineResult<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| EngineError::fetch("*", e))?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            interval: binance_interval(interval_mins),
            limit: limit.min(MAX_KLINES_PER_REQUEST),
        })
    }

    /// Fetch klines (candlestick data) for a symbol, oldest first
    pub async fn get_klines(
        &self,
        symbol: &str,
        start_time: Option<i64>,
        end_time: Option<i64>,
        limit: Option<u32>,
    ) -> EngineResult<Vec<Kline>> {
        let mut url = format!(
            "{}/api/v3/klines?symbol={}&interval={}",
            self.base_url, symbol, self.interval
        );

        if let Some(start) = start_time {
            url.push_str(&format!("&startTime={}", start));
        }
        if let Some(end) = end_time {
            url.push_str(&format!("&endTime={}", end));
        }

        let limit = limit.unwrap_or(self.limit).min(MAX_KLINES_PER_REQUEST);
        url.push_str(&format!("&limit={}", limit));

        debug!(symbol, interval = %self.interval, "Fetching klines from Binance");

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
                format!("Binance API error {}: {}", status, body),
            ));
        }

        let raw_klines: Vec<RawKline> = response
            .json()
            .await
            .map_err(|e| EngineError::fetch(symbol, e))?;

        let klines: Vec<Kline> = raw_klines
            .into_iter()
            .filter_map(RawKline::into_kline)
            .collect();

        debug!(symbol, count = klines.len(), "Fetched klines");
        Ok(klines)
    }
}

#[async_trait]
impl MarketData for BinanceClient {
    fn name(&self) -> &str {
        "binance"
    }

    async fn recent_closes(&self, symbol: &str) -> EngineResult<Vec<Decimal>> {
        let klines = self.get_klines(symbol, None, None, None).await?;
        Ok(klines.into_iter().map(|k| k.close).collect())
    }
}
