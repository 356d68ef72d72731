//! Typed, signed HTTP client for the exchange, sitting behind rate-limit /
//! circuit-breaker / retry / logging / metrics middleware.

use chrono::Utc;
use hmac::{Hmac, Mac};
use reqwest::Client as HttpClient;
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::error::CoreError;
use crate::exchange::circuit_breaker::{CircuitBreaker, CircuitBreakerError};
use crate::exchange::rate_limiter::RateLimiter;
use crate::exchange::retry::{with_retry, RetryPolicy};
use crate::metrics::Metrics;
use crate::redact::mask_credential;
use crate::types::{BalanceInfo, SymbolStatus, ValidationRules};

type HmacSha256 = Hmac<Sha256>;

#[derive(Clone)]
pub struct ExchangeCredentials {
    pub api_key: String,
    pub secret_key: String,
}

impl fmt::Debug for ExchangeCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExchangeCredentials")
            .field("api_key", &mask_credential(&self.api_key))
            .field("secret_key", &"[REDACTED]")
            .finish()
    }
}

pub struct ExchangeClient {
    http: HttpClient,
    calendar_http: HttpClient,
    base_url: String,
    calendar_base_url: String,
    credentials: ExchangeCredentials,
    rate_limiter: Arc<RateLimiter>,
    breaker: Arc<CircuitBreaker>,
    retry_policy: RetryPolicy,
    metrics: Arc<Metrics>,
}

#[derive(Debug, Deserialize)]
pub struct ServerTime {
    #[serde(rename = "serverTime")]
    pub server_time: i64,
}

#[derive(Debug, Deserialize)]
struct ExchangeInfoResponse {
    symbols: Vec<ExchangeInfoSymbol>,
}

#[derive(Debug, Deserialize)]
struct ExchangeInfoSymbol {
    symbol: String,
    #[serde(rename = "baseAsset")]
    base_asset: String,
    #[serde(rename = "quoteAsset")]
    quote_asset: String,
    status: String,
    filters: Vec<ExchangeFilter>,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "filterType")]
enum ExchangeFilter {
    #[serde(rename = "LOT_SIZE")]
    LotSize {
        #[serde(rename = "minQty")]
        min_qty: String,
        #[serde(rename = "maxQty")]
        max_qty: String,
        #[serde(rename = "stepSize")]
        step_size: String,
    },
    #[serde(rename = "MIN_NOTIONAL")]
    MinNotional {
        #[serde(rename = "minNotional")]
        min_notional: String,
    },
    #[serde(rename = "PRICE_FILTER")]
    PriceFilter {
        #[serde(rename = "tickSize")]
        tick_size: String,
    },
    #[serde(other)]
    Other,
}

#[derive(Debug, Deserialize)]
pub struct TickerPrice {
    pub symbol: String,
    #[serde(deserialize_with = "de_f64_from_str")]
    pub price: f64,
}

#[derive(Debug, Deserialize)]
pub struct Ticker24hr {
    pub symbol: String,
    #[serde(rename = "lastPrice", deserialize_with = "de_f64_from_str")]
    pub last_price: f64,
    #[serde(rename = "priceChangePercent", deserialize_with = "de_f64_from_str")]
    pub price_change_percent: f64,
    #[serde(rename = "volume", deserialize_with = "de_f64_from_str")]
    pub volume: f64,
}

fn de_f64_from_str<'de, D>(deserializer: D) -> Result<f64, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let s: String = Deserialize::deserialize(deserializer)?;
    s.parse::<f64>().map_err(serde::de::Error::custom)
}

#[derive(Debug, Deserialize)]
pub struct AccountInfo {
    pub balances: Vec<BalanceInfo>,
}

#[derive(Debug, Serialize)]
pub struct NewOrderRequest<'a> {
    pub symbol: &'a str,
    pub side: &'a str,
    #[serde(rename = "type")]
    pub order_type: &'a str,
    pub quantity: f64,
    pub price: Option<f64>,
    #[serde(rename = "timeInForce")]
    pub time_in_force: Option<&'a str>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct OrderResponse {
    #[serde(rename = "orderId")]
    pub order_id: String,
    pub symbol: String,
    pub status: String,
    #[serde(default, deserialize_with = "de_opt_f64_from_str")]
    pub price: Option<f64>,
    #[serde(rename = "executedQty", default, deserialize_with = "de_opt_f64_from_str")]
    pub executed_qty: Option<f64>,
}

fn de_opt_f64_from_str<'de, D>(deserializer: D) -> Result<Option<f64>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let s: Option<String> = Deserialize::deserialize(deserializer)?;
    match s {
        Some(s) if !s.is_empty() => s.parse::<f64>().map(Some).map_err(serde::de::Error::custom),
        _ => Ok(None),
    }
}

#[derive(Debug, Deserialize)]
struct RawCalendarEnvelope {
    data: RawCalendarData,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum RawCalendarData {
    NewCoins { #[serde(rename = "newCoins")] new_coins: Vec<RawCalendarEntry> },
    Data { data: Vec<RawCalendarEntry> },
}

#[derive(Debug, Deserialize)]
struct RawCalendarEntry {
    #[serde(rename = "vcoinId")]
    vcoin_id: String,
    symbol: Option<String>,
    #[serde(rename = "vcoinName")]
    vcoin_name: Option<String>,
    #[serde(rename = "projectName")]
    project_name: Option<String>,
    #[serde(rename = "firstOpenTime")]
    first_open_time: Option<i64>,
}

impl ExchangeClient {
    pub fn new(
        base_url: String,
        calendar_base_url: String,
        credentials: ExchangeCredentials,
        metrics: Arc<Metrics>,
    ) -> anyhow::Result<Self> {
        let http = reqwest::Client::builder()
            .pool_max_idle_per_host(20)
            .timeout(Duration::from_secs(3))
            .connect_timeout(Duration::from_secs(3))
            .tcp_keepalive(Duration::from_secs(60))
            .build()?;

        let calendar_http = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .user_agent(
                "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 \
                 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36",
            )
            .build()?;

        Ok(Self {
            http,
            calendar_http,
            base_url,
            calendar_base_url,
            credentials,
            rate_limiter: Arc::new(RateLimiter::default()),
            breaker: Arc::new(CircuitBreaker::default_for("exchange_api")),
            retry_policy: RetryPolicy::default(),
            metrics,
        })
    }

    fn sign(&self, query: &str) -> String {
        let mut mac = HmacSha256::new_from_slice(self.credentials.secret_key.as_bytes())
            .expect("hmac accepts any key length");
        mac.update(query.as_bytes());
        hex::encode(mac.finalize().into_bytes())
    }

    /// Builds a signed query string: params in insertion order, timestamp + recvWindow
    /// appended, HMAC-SHA256 signature appended last.
    fn signed_query(&self, mut params: Vec<(String, String)>, recv_window_ms: u32) -> String {
        params.push(("timestamp".into(), Utc::now().timestamp_millis().to_string()));
        params.push(("recvWindow".into(), recv_window_ms.to_string()));
        let query = params
            .iter()
            .map(|(k, v)| format!("{k}={v}"))
            .collect::<Vec<_>>()
            .join("&");
        let signature = self.sign(&query);
        format!("{query}&signature={signature}")
    }

    async fn execute<T, F, Fut>(&self, label: &'static str, call: F) -> Result<T, CoreError>
    where
        F: Fn() -> Fut,
        Fut: std::future::Future<Output = Result<T, CoreError>>,
    {
        let _permit = self.rate_limiter.acquire().await?;
        let started = std::time::Instant::now();

        let breaker_result = self
            .breaker
            .call(with_retry(&self.retry_policy, &call))
            .await;

        let elapsed_ms = started.elapsed().as_millis() as u64;
        self.metrics.observe_exchange_call(label, elapsed_ms);

        match breaker_result {
            Ok(value) => {
                debug!(endpoint = label, elapsed_ms, "exchange call succeeded");
                Ok(value)
            }
            Err(CircuitBreakerError::Open(_)) => {
                self.metrics.increment_counter("circuit_breaker_rejections");
                warn!(endpoint = label, "circuit breaker open, call rejected");
                Err(CoreError::exchange_api(
                    "CIRCUIT_BREAKER_OPEN",
                    format!("circuit breaker open for {label}"),
                    503,
                ))
            }
            Err(CircuitBreakerError::Inner(e)) => {
                self.metrics.increment_counter("exchange_call_errors");
                Err(e)
            }
        }
    }

    async fn get_json<T: for<'de> Deserialize<'de>>(
        &self,
        path: &str,
        query: Option<String>,
    ) -> Result<T, CoreError> {
        let url = match &query {
            Some(q) => format!("{}{path}?{q}", self.base_url),
            None => format!("{}{path}", self.base_url),
        };
        let mut builder = self.http.get(&url);
        if query.is_some() {
            builder = builder.header("X-MEXC-APIKEY", &self.credentials.api_key);
        }
        let response = builder
            .send()
            .await
            .map_err(|e| CoreError::trading("NETWORK_ERROR", e.to_string()))?;
        Self::parse_response(response).await
    }

    async fn parse_response<T: for<'de> Deserialize<'de>>(
        response: reqwest::Response,
    ) -> Result<T, CoreError> {
        let status = response.status();
        let text = response
            .text()
            .await
            .map_err(|e| CoreError::trading("NETWORK_ERROR", e.to_string()))?;
        if !status.is_success() {
            return Err(CoreError::exchange_api(
                "EXCHANGE_ERROR",
                text,
                status.as_u16(),
            ));
        }
        serde_json::from_str(&text)
            .map_err(|e| CoreError::exchange_api("DECODE_ERROR", e.to_string(), status.as_u16()))
    }

    pub async fn get_server_time(&self) -> Result<ServerTime, CoreError> {
        self.execute("getServerTime", || self.get_json("/api/v3/time", None))
            .await
    }

    pub async fn get_exchange_info(&self) -> Result<Vec<ValidationRules>, CoreError> {
        self.execute("getExchangeInfo", || {
            self.get_json::<ExchangeInfoResponse>("/api/v3/exchangeInfo", None)
        })
        .await
        .map(|resp| {
            resp.symbols
                .into_iter()
                .map(|s| {
                    let mut min_qty = 0.0;
                    let mut max_qty = f64::MAX;
                    let mut step_size = 0.0;
                    let mut min_notional = 0.0;
                    let mut tick_size = 0.0;
                    for filter in &s.filters {
                        match filter {
                            ExchangeFilter::LotSize {
                                min_qty: mq,
                                max_qty: xq,
                                step_size: ss,
                            } => {
                                min_qty = mq.parse().unwrap_or(0.0);
                                max_qty = xq.parse().unwrap_or(f64::MAX);
                                step_size = ss.parse().unwrap_or(0.0);
                            }
                            ExchangeFilter::MinNotional { min_notional: mn } => {
                                min_notional = mn.parse().unwrap_or(0.0);
                            }
                            ExchangeFilter::PriceFilter { tick_size: ts } => {
                                tick_size = ts.parse().unwrap_or(0.0);
                            }
                            ExchangeFilter::Other => {}
                        }
                    }
                    ValidationRules {
                        symbol: s.symbol,
                        min_qty,
                        max_qty,
                        step_size,
                        min_notional,
                        tick_size,
                        base_asset: s.base_asset,
                        quote_asset: s.quote_asset,
                        status: if s.status == "ENABLED" || s.status == "TRADING" {
                            SymbolStatus::Enabled
                        } else {
                            SymbolStatus::Disabled
                        },
                        loaded_at: Utc::now(),
                    }
                })
                .collect()
        })
    }

    pub async fn get_ticker_price(&self, symbol: &str) -> Result<TickerPrice, CoreError> {
        let query = format!("symbol={symbol}");
        self.execute("getTicker", || {
            self.get_json("/api/v3/ticker/price", Some(query.clone()))
        })
        .await
    }

    pub async fn get_ticker_24hr(&self) -> Result<Vec<Ticker24hr>, CoreError> {
        self.execute("getTicker24hr", || {
            self.get_json("/api/v3/ticker/24hr", None)
        })
        .await
    }

    pub async fn get_account_info(&self) -> Result<AccountInfo, CoreError> {
        let signed = self.signed_query(Vec::new(), 5_000);
        self.execute("getAccountInfo", || {
            self.get_json("/api/v3/account", Some(signed.clone()))
        })
        .await
    }

    pub async fn place_order(
        &self,
        symbol: &str,
        side: &str,
        order_type: &str,
        quantity: f64,
        price: Option<f64>,
        recv_window_ms: u32,
    ) -> Result<OrderResponse, CoreError> {
        let mut params = vec![
            ("symbol".to_string(), symbol.to_string()),
            ("side".to_string(), side.to_string()),
            ("type".to_string(), order_type.to_string()),
            ("quantity".to_string(), quantity.to_string()),
        ];
        if let Some(p) = price {
            params.push(("price".to_string(), p.to_string()));
            params.push(("timeInForce".to_string(), "GTC".to_string()));
        }
        let signed = self.signed_query(params, recv_window_ms);
        let url = format!("{}/api/v3/order", self.base_url);
        let api_key = self.credentials.api_key.clone();
        let http = self.http.clone();
        let url_for_call = url.clone();
        let signed_for_call = signed.clone();

        self.execute("placeOrder", move || {
            let http = http.clone();
            let url = url_for_call.clone();
            let signed = signed_for_call.clone();
            let api_key = api_key.clone();
            async move {
                let response = http
                    .post(format!("{url}?{signed}"))
                    .header("X-MEXC-APIKEY", api_key)
                    .send()
                    .await
                    .map_err(|e| CoreError::trading("NETWORK_ERROR", e.to_string()))?;
                Self::parse_response(response).await
            }
        })
        .await
    }

    pub async fn get_order(&self, symbol: &str, order_id: &str) -> Result<OrderResponse, CoreError> {
        let params = vec![
            ("symbol".to_string(), symbol.to_string()),
            ("orderId".to_string(), order_id.to_string()),
        ];
        let signed = self.signed_query(params, 5_000);
        self.execute("getOrder", || {
            self.get_json("/api/v3/order", Some(signed.clone()))
        })
        .await
    }

    pub async fn cancel_order(&self, symbol: &str, order_id: &str) -> Result<(), CoreError> {
        let params = vec![
            ("symbol".to_string(), symbol.to_string()),
            ("orderId".to_string(), order_id.to_string()),
        ];
        let signed = self.signed_query(params, 5_000);
        let url = format!("{}/api/v3/order?{signed}", self.base_url);
        self.execute("cancelOrder", || {
            let http = self.http.clone();
            let url = url.clone();
            let api_key = self.credentials.api_key.clone();
            async move {
                let response = http
                    .delete(url)
                    .header("X-MEXC-APIKEY", api_key)
                    .send()
                    .await
                    .map_err(|e| CoreError::trading("NETWORK_ERROR", e.to_string()))?;
                let _: serde_json::Value = Self::parse_response(response).await?;
                Ok(())
            }
        })
        .await
    }

    pub async fn get_open_orders(&self, symbol: Option<&str>) -> Result<Vec<OrderResponse>, CoreError> {
        let mut params = Vec::new();
        if let Some(s) = symbol {
            params.push(("symbol".to_string(), s.to_string()));
        }
        let signed = self.signed_query(params, 5_000);
        self.execute("getOpenOrders", || {
            self.get_json("/api/v3/openOrders", Some(signed.clone()))
        })
        .await
    }

    /// Fetches the public listing calendar. The calendar host frequently
    /// serves CDN block pages instead of JSON; on detection we degrade to an
    /// empty list rather than propagate, per the documented contract.
    pub async fn get_calendar(&self) -> Result<Vec<crate::types::CalendarEntry>, CoreError> {
        let url = format!("{}/api/operation/new_coin_calendar", self.calendar_base_url);
        let result = self
            .execute("getCalendar", || {
                let client = self.calendar_http.clone();
                let url = url.clone();
                let origin = self.calendar_base_url.clone();
                async move {
                    let response = client
                        .get(&url)
                        .header("Accept", "application/json")
                        .header("Referer", origin.clone())
                        .header("Origin", origin)
                        .send()
                        .await
                        .map_err(|e| CoreError::trading("NETWORK_ERROR", e.to_string()))?;
                    let status = response.status();
                    let text = response
                        .text()
                        .await
                        .map_err(|e| CoreError::trading("NETWORK_ERROR", e.to_string()))?;

                    let trimmed = text.trim_start();
                    if trimmed.starts_with("<!DOCTYPE") || trimmed.starts_with("<HTML") || trimmed.starts_with("<html") {
                        return Err(CoreError::exchange_api(
                            "CLOUDFLARE_BLOCK",
                            "calendar endpoint returned an HTML block page",
                            status.as_u16(),
                        ));
                    }
                    if !status.is_success() {
                        return Err(CoreError::exchange_api("EXCHANGE_ERROR", text, status.as_u16()));
                    }

                    let envelope: RawCalendarEnvelope = serde_json::from_str(&text).map_err(|e| {
                        CoreError::exchange_api("DECODE_ERROR", e.to_string(), status.as_u16())
                    })?;
                    Ok(envelope)
                }
            })
            .await;

        let envelope = match result {
            Ok(envelope) => envelope,
            Err(e) if e.code() == "CLOUDFLARE_BLOCK" => {
                warn!("calendar endpoint blocked, degrading to empty list");
                self.metrics.increment_counter("calendar_block_pages");
                return Ok(Vec::new());
            }
            Err(e) => {
                info!(error = %e, "calendar fetch failed, degrading to empty list");
                return Ok(Vec::new());
            }
        };

        let raw_entries = match envelope.data {
            RawCalendarData::NewCoins { new_coins } => new_coins,
            RawCalendarData::Data { data } => data,
        };

        Ok(raw_entries
            .into_iter()
            .filter_map(|e| {
                let first_open_time = e.first_open_time.unwrap_or(0);
                if first_open_time <= 0 {
                    return None;
                }
                Some(crate::types::CalendarEntry {
                    vcoin_id: e.vcoin_id,
                    symbol: e.symbol.unwrap_or_default(),
                    vcoin_name: e.vcoin_name.unwrap_or_default(),
                    project_name: e.project_name.unwrap_or_default(),
                    first_open_time,
                    zone: None,
                })
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_client() -> ExchangeClient {
        ExchangeClient::new(
            "https://api.example.com".into(),
            "https://www.example.com".into(),
            ExchangeCredentials {
                api_key: "key".into(),
                secret_key: "secret".into(),
            },
            Arc::new(Metrics::default()),
        )
        .unwrap()
    }

    #[test]
    fn signature_is_deterministic_for_same_input() {
        let client = test_client();
        let a = client.sign("symbol=BTCUSDT&timestamp=1");
        let b = client.sign("symbol=BTCUSDT&timestamp=1");
        assert_eq!(a, b);
        assert_ne!(a, client.sign("symbol=ETHUSDT&timestamp=1"));
    }

    #[test]
    fn credentials_debug_redacts_secret() {
        let creds = ExchangeCredentials {
            api_key: "abcdefgh".into(),
            secret_key: "topsecret".into(),
        };
        let debug = format!("{creds:?}");
        assert!(!debug.contains("topsecret"));
        assert!(debug.contains("[REDACTED]"));
    }
}
