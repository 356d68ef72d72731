//! Per-user trading configuration and process-wide engine configuration.
//!
//! Serde defaults let older persisted JSON keep loading after new fields are
//! added, and an atomic-tmp-then-rename save means a crash mid-write never
//! corrupts the file.

use serde::{Deserialize, Serialize};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

fn default_true() -> bool {
    true
}
fn default_polling_interval() -> u64 {
    5_000
}
fn default_order_timeout() -> u64 {
    10_000
}
fn default_price_tolerance_bps() -> u32 {
    100
}
fn default_max_trades_per_hour() -> u32 {
    10
}
fn default_sell_strategy() -> SellStrategy {
    SellStrategy::Combined
}
fn default_profit_target_bps() -> u32 {
    500
}
fn default_stop_loss_bps() -> u32 {
    300
}
fn default_trailing_stop_bps() -> u32 {
    200
}
fn default_time_based_exit_minutes() -> u32 {
    60
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SellStrategy {
    ProfitTarget,
    StopLoss,
    TimeBased,
    TrailingStop,
    Combined,
}

/// Per-user trading configuration: identity is (user_id, id).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TradingConfiguration {
    pub user_id: String,
    pub id: String,

    pub enabled_symbols: Vec<String>,
    pub per_trade_quote: f64,
    pub max_purchase: f64,
    pub daily_spend_limit: f64,
    #[serde(default = "default_max_trades_per_hour")]
    pub max_trades_per_hour: u32,
    #[serde(default = "default_polling_interval")]
    pub polling_interval_ms: u64,
    #[serde(default = "default_order_timeout")]
    pub order_timeout_ms: u64,
    #[serde(default = "default_price_tolerance_bps")]
    pub price_tolerance_bps: u32,
    #[serde(default = "default_true")]
    pub safety_enabled: bool,

    #[serde(default = "default_profit_target_bps")]
    pub profit_target_bps: u32,
    #[serde(default = "default_stop_loss_bps")]
    pub stop_loss_bps: u32,
    #[serde(default = "default_time_based_exit_minutes")]
    pub time_based_exit_minutes: u32,
    #[serde(default = "default_trailing_stop_bps")]
    pub trailing_stop_bps: u32,
    #[serde(default = "default_sell_strategy")]
    pub sell_strategy: SellStrategy,

    #[serde(default = "default_true")]
    pub is_active: bool,
}

impl TradingConfiguration {
    pub fn validate(&self) -> Result<(), String> {
        if self.per_trade_quote > self.daily_spend_limit {
            return Err("perTradeQuote must be <= dailySpendLimit".into());
        }
        if self.polling_interval_ms < 1_000 {
            return Err("pollingInterval must be >= 1000ms".into());
        }
        if self.order_timeout_ms < 5_000 {
            return Err("orderTimeout must be >= 5000ms".into());
        }
        // priceTolerance in [0.1%, 50%] -> basis points [10, 5000]
        if self.price_tolerance_bps < 10 || self.price_tolerance_bps > 5_000 {
            return Err("priceTolerance must be within [0.1%, 50%]".into());
        }
        Ok(())
    }
}

/// Process-wide knobs sourced from the environment.
#[derive(Clone)]
pub struct EngineConfig {
    pub exchange_api_key: String,
    pub exchange_secret_key: String,
    pub exchange_base_url: String,
    pub calendar_base_url: String,
    pub log_level: String,
    pub api_timeout_ms: u64,
    pub allowed_origins: Vec<String>,
    pub cors_enabled: bool,
    pub max_trades_per_hour: u32,
    pub default_polling_interval_ms: u64,
    pub default_order_timeout_ms: u64,
    pub ip_whitelist_enabled: bool,
    pub ip_whitelist: Vec<String>,
    pub admin_token: Option<String>,
    pub bind_addr: String,
}

impl std::fmt::Debug for EngineConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EngineConfig")
            .field("exchange_api_key", &crate::redact::mask_credential(&self.exchange_api_key))
            .field("exchange_secret_key", &"[REDACTED]")
            .field("exchange_base_url", &self.exchange_base_url)
            .field("calendar_base_url", &self.calendar_base_url)
            .field("log_level", &self.log_level)
            .field("api_timeout_ms", &self.api_timeout_ms)
            .field("allowed_origins", &self.allowed_origins)
            .field("cors_enabled", &self.cors_enabled)
            .field("max_trades_per_hour", &self.max_trades_per_hour)
            .field("default_polling_interval_ms", &self.default_polling_interval_ms)
            .field("default_order_timeout_ms", &self.default_order_timeout_ms)
            .field("ip_whitelist_enabled", &self.ip_whitelist_enabled)
            .field("ip_whitelist", &self.ip_whitelist)
            .field("admin_token", &self.admin_token.as_ref().map(|_| "[REDACTED]"))
            .field("bind_addr", &self.bind_addr)
            .finish()
    }
}

impl EngineConfig {
    pub fn from_env() -> anyhow::Result<Self> {
        dotenv::dotenv().ok();

        let get = |key: &str, default: &str| std::env::var(key).unwrap_or_else(|_| default.to_string());
        let get_u64 = |key: &str, default: u64| {
            std::env::var(key)
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(default)
        };
        let get_u32 = |key: &str, default: u32| {
            std::env::var(key)
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(default)
        };
        let get_bool = |key: &str, default: bool| {
            std::env::var(key)
                .ok()
                .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
                .unwrap_or(default)
        };
        let get_list = |key: &str| -> Vec<String> {
            std::env::var(key)
                .ok()
                .map(|v| v.split(',').map(|s| s.trim().to_string()).filter(|s| !s.is_empty()).collect())
                .unwrap_or_default()
        };

        let exchange_api_key = std::env::var("EXCHANGE_API_KEY").unwrap_or_default();
        let exchange_secret_key = std::env::var("EXCHANGE_SECRET_KEY").unwrap_or_default();
        if exchange_api_key.is_empty() || exchange_secret_key.is_empty() {
            warn!("EXCHANGE_API_KEY / EXCHANGE_SECRET_KEY are unset; client will fail to sign requests");
        }

        Ok(Self {
            exchange_api_key,
            exchange_secret_key,
            exchange_base_url: get("EXCHANGE_BASE_URL", "https://api.mexc.com"),
            calendar_base_url: get("CALENDAR_BASE_URL", "https://www.mexc.com"),
            log_level: get("LOG_LEVEL", "info"),
            api_timeout_ms: get_u64("API_TIMEOUT_MS", 3_000),
            allowed_origins: get_list("ALLOWED_ORIGINS"),
            cors_enabled: get_bool("CORS_ENABLED", true),
            max_trades_per_hour: get_u32("MAX_TRADES_PER_HOUR", 10),
            default_polling_interval_ms: get_u64("DEFAULT_POLLING_INTERVAL_MS", 5_000),
            default_order_timeout_ms: get_u64("DEFAULT_ORDER_TIMEOUT_MS", 10_000),
            ip_whitelist_enabled: get_bool("IP_WHITELIST_ENABLED", false),
            ip_whitelist: get_list("IP_WHITELIST"),
            admin_token: std::env::var("ADMIN_TOKEN").ok(),
            bind_addr: get("BIND_ADDR", "0.0.0.0:8080"),
        })
    }
}

/// Loads a `TradingConfiguration` from disk, or returns `default_config` if absent.
pub fn load_or_default(path: &Path, default_config: TradingConfiguration) -> TradingConfiguration {
    match fs::read_to_string(path) {
        Ok(contents) => match serde_json::from_str(&contents) {
            Ok(cfg) => {
                info!(path = %path.display(), "loaded trading configuration");
                cfg
            }
            Err(e) => {
                warn!(error = %e, "failed to parse trading configuration, using defaults");
                default_config
            }
        },
        Err(_) => default_config,
    }
}

/// Persists via write-to-tmp-then-rename so a crash mid-write can't corrupt the file.
pub fn save_atomic(path: &Path, config: &TradingConfiguration) -> anyhow::Result<()> {
    let tmp_path: PathBuf = path.with_extension("tmp");
    let json = serde_json::to_string_pretty(config)?;
    {
        let mut f = fs::File::create(&tmp_path)?;
        f.write_all(json.as_bytes())?;
        f.sync_all()?;
    }
    fs::rename(&tmp_path, path)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> TradingConfiguration {
        TradingConfiguration {
            user_id: "u1".into(),
            id: "c1".into(),
            enabled_symbols: vec!["BTCUSDT".into()],
            per_trade_quote: 10.0,
            max_purchase: 100.0,
            daily_spend_limit: 100.0,
            max_trades_per_hour: default_max_trades_per_hour(),
            polling_interval_ms: default_polling_interval(),
            order_timeout_ms: default_order_timeout(),
            price_tolerance_bps: default_price_tolerance_bps(),
            safety_enabled: true,
            profit_target_bps: default_profit_target_bps(),
            stop_loss_bps: default_stop_loss_bps(),
            time_based_exit_minutes: default_time_based_exit_minutes(),
            trailing_stop_bps: default_trailing_stop_bps(),
            sell_strategy: default_sell_strategy(),
            is_active: true,
        }
    }

    #[test]
    fn rejects_per_trade_quote_above_daily_limit() {
        let mut cfg = sample();
        cfg.per_trade_quote = 200.0;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn rejects_polling_interval_below_floor() {
        let mut cfg = sample();
        cfg.polling_interval_ms = 500;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn price_tolerance_boundaries() {
        let mut cfg = sample();
        cfg.price_tolerance_bps = 10; // 0.1%
        assert!(cfg.validate().is_ok());
        cfg.price_tolerance_bps = 5_000; // 50%
        assert!(cfg.validate().is_ok());
        cfg.price_tolerance_bps = 9;
        assert!(cfg.validate().is_err());
        cfg.price_tolerance_bps = 5_001;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn deserializes_partial_json_with_defaults() {
        let partial = serde_json::json!({
            "user_id": "u1",
            "id": "c1",
            "enabled_symbols": ["ETHUSDT"],
            "per_trade_quote": 5.0,
            "max_purchase": 50.0,
            "daily_spend_limit": 50.0,
        });
        let cfg: TradingConfiguration = serde_json::from_value(partial).unwrap();
        assert_eq!(cfg.max_trades_per_hour, 10);
        assert_eq!(cfg.polling_interval_ms, 5_000);
        assert!(matches!(cfg.sell_strategy, SellStrategy::Combined));
    }

    #[test]
    fn engine_config_debug_redacts_credentials() {
        let cfg = EngineConfig {
            exchange_api_key: "abcd1234efgh".into(),
            exchange_secret_key: "supersecretvalue".into(),
            exchange_base_url: "https://api.mexc.com".into(),
            calendar_base_url: "https://www.mexc.com".into(),
            log_level: "info".into(),
            api_timeout_ms: 3_000,
            allowed_origins: vec![],
            cors_enabled: true,
            max_trades_per_hour: 10,
            default_polling_interval_ms: 5_000,
            default_order_timeout_ms: 10_000,
            ip_whitelist_enabled: false,
            ip_whitelist: vec![],
            admin_token: Some("admin-secret".into()),
            bind_addr: "0.0.0.0:8080".into(),
        };
        let debug = format!("{cfg:?}");
        assert!(!debug.contains("supersecretvalue"));
        assert!(!debug.contains("admin-secret"));
        assert!(!debug.contains("abcd1234efgh"));
        assert!(debug.contains("[REDACTED]"));
    }

    #[test]
    fn roundtrips_through_json() {
        let cfg = sample();
        let json = serde_json::to_string(&cfg).unwrap();
        let back: TradingConfiguration = serde_json::from_str(&json).unwrap();
        assert_eq!(back.per_trade_quote, cfg.per_trade_quote);
        assert_eq!(back.sell_strategy as u8, cfg.sell_strategy as u8);
    }
}
