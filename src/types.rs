// =============================================================================
// Core domain entities from the Data Model, independent of storage shape.
// =============================================================================

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DetectionSource {
    Calendar,
    TickerDiff,
    ExchangeInfo,
    Symbolsv2,
    Websocket,
}

impl DetectionSource {
    /// Authority ranking used by the orchestrator's merge rule:
    /// calendar > symbolsv2 > exchange_info > ticker_diff. Lower is more authoritative.
    pub fn authority_rank(&self) -> u8 {
        match self {
            DetectionSource::Calendar => 0,
            DetectionSource::Symbolsv2 => 1,
            DetectionSource::ExchangeInfo => 2,
            DetectionSource::TickerDiff => 3,
            DetectionSource::Websocket => 4,
        }
    }
}

impl fmt::Display for DetectionSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            DetectionSource::Calendar => "calendar",
            DetectionSource::TickerDiff => "ticker_diff",
            DetectionSource::ExchangeInfo => "exchange_info",
            DetectionSource::Symbolsv2 => "symbolsv2",
            DetectionSource::Websocket => "websocket",
        };
        write!(f, "{s}")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Confidence {
    Low,
    Medium,
    High,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CalendarEntry {
    pub vcoin_id: String,
    pub symbol: String,
    pub vcoin_name: String,
    pub project_name: String,
    pub first_open_time: i64,
    pub zone: Option<String>,
}

impl CalendarEntry {
    pub fn is_valid(&self) -> bool {
        self.first_open_time > 0
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ListingSignal {
    pub symbol: String,
    pub source: DetectionSource,
    pub detected_at: DateTime<Utc>,
    pub listing_time: Option<DateTime<Utc>>,
    pub confidence: Confidence,
    pub freshness_deadline: DateTime<Utc>,
}

impl ListingSignal {
    /// Key used for dedup: (symbol, source, detectedAt truncated to the dedup window).
    pub fn dedup_bucket(&self, window_secs: i64) -> (String, DetectionSource, i64) {
        let bucket = self.detected_at.timestamp() / window_secs.max(1);
        (self.symbol.clone(), self.source, bucket)
    }

    pub fn is_fresh(&self, now: DateTime<Utc>) -> bool {
        now <= self.freshness_deadline
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ListingEvent {
    pub symbol: String,
    pub base_asset: String,
    pub quote_asset: String,
    pub listing_time: Option<DateTime<Utc>>,
    pub vcoin_id: Option<String>,
    pub project_name: Option<String>,
    pub detection_method: DetectionSource,
    pub initial_price: Option<f64>,
    pub detected_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl ListingEvent {
    pub fn new(
        symbol: String,
        base_asset: String,
        quote_asset: String,
        detection_method: DetectionSource,
        detected_at: DateTime<Utc>,
    ) -> Self {
        Self {
            symbol,
            base_asset,
            quote_asset,
            listing_time: None,
            vcoin_id: None,
            project_name: None,
            detection_method,
            initial_price: None,
            detected_at,
            expires_at: detected_at + chrono::Duration::hours(24),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum SymbolStatus {
    Enabled,
    Disabled,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidationRules {
    pub symbol: String,
    pub min_qty: f64,
    pub max_qty: f64,
    pub step_size: f64,
    pub min_notional: f64,
    pub tick_size: f64,
    pub base_asset: String,
    pub quote_asset: String,
    pub status: SymbolStatus,
    pub loaded_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Side {
    Buy,
    Sell,
}

impl fmt::Display for Side {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Side::Buy => write!(f, "BUY"),
            Side::Sell => write!(f, "SELL"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum OrderType {
    Market,
    Limit,
}

impl fmt::Display for OrderType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OrderType::Market => write!(f, "MARKET"),
            OrderType::Limit => write!(f, "LIMIT"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum TradeStatus {
    Pending,
    Success,
    Failed,
    Cancelled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SellReason {
    StopLoss,
    TrailingStop,
    ProfitTarget,
    TimeBased,
    Manual,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TradeAttempt {
    pub id: String,
    pub symbol: String,
    pub side: Side,
    pub order_type: OrderType,
    pub status: TradeStatus,
    pub requested_qty: f64,
    pub requested_price: Option<f64>,
    pub executed_qty: Option<f64>,
    pub executed_price: Option<f64>,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub execution_ms: i64,
    pub error_message: Option<String>,
    pub parent_trade_id: Option<String>,
    pub position_id: Option<String>,
    pub sell_reason: Option<SellReason>,
    pub configuration_id: String,
    pub listing_event_id: Option<String>,
    pub snapshot_of_config: Option<String>,
}

impl TradeAttempt {
    pub fn new_pending(
        symbol: String,
        side: Side,
        order_type: OrderType,
        requested_qty: f64,
        requested_price: Option<f64>,
        configuration_id: String,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            symbol,
            side,
            order_type,
            status: TradeStatus::Pending,
            requested_qty,
            requested_price,
            executed_qty: None,
            executed_price: None,
            created_at: Utc::now(),
            completed_at: None,
            execution_ms: 0,
            error_message: None,
            parent_trade_id: None,
            position_id: None,
            sell_reason: None,
            configuration_id,
            listing_event_id: None,
            snapshot_of_config: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Position {
    pub symbol: String,
    pub quantity: f64,
    pub entry_price: f64,
    pub entry_time: DateTime<Utc>,
    pub buy_order_id: String,
    pub trade_attempt_id: String,
    pub current_price: Option<f64>,
    pub unrealized_pnl: Option<f64>,
    pub unrealized_pnl_percent: Option<f64>,
    pub high_water_mark: f64,
}

impl Position {
    pub fn new(
        symbol: String,
        quantity: f64,
        entry_price: f64,
        buy_order_id: String,
        trade_attempt_id: String,
        entry_time: DateTime<Utc>,
    ) -> Self {
        Self {
            symbol,
            quantity,
            entry_price,
            entry_time,
            buy_order_id,
            trade_attempt_id,
            current_price: None,
            unrealized_pnl: None,
            unrealized_pnl_percent: None,
            high_water_mark: entry_price,
        }
    }

    pub fn mark_to_market(&mut self, price: f64) {
        self.current_price = Some(price);
        self.unrealized_pnl = Some((price - self.entry_price) * self.quantity);
        self.unrealized_pnl_percent = Some(if self.entry_price > 0.0 {
            (price - self.entry_price) / self.entry_price * 100.0
        } else {
            0.0
        });
        self.high_water_mark = self.high_water_mark.max(price);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ExchangeApiStatus {
    Ok,
    Degraded,
    Down,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BotStatus {
    pub is_running: bool,
    pub last_heartbeat: DateTime<Utc>,
    pub exchange_api_status: ExchangeApiStatus,
    pub api_response_time_ms: f64,
    pub uptime_secs: i64,
    pub version: String,
}

/// Account operating mode; defaults to the conservative `Demo` mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AccountMode {
    Demo,
    Live,
}

impl Default for AccountMode {
    fn default() -> Self {
        Self::Demo
    }
}

impl fmt::Display for AccountMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Demo => write!(f, "Demo"),
            Self::Live => write!(f, "Live"),
        }
    }
}

/// Engine-wide trading mode; defaults to `Paused` so a fresh deployment never
/// trades until an operator explicitly resumes it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TradingMode {
    Live,
    Paused,
    Killed,
}

impl Default for TradingMode {
    fn default() -> Self {
        Self::Paused
    }
}

impl fmt::Display for TradingMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Live => write!(f, "Live"),
            Self::Paused => write!(f, "Paused"),
            Self::Killed => write!(f, "Killed"),
        }
    }
}

/// Balance snapshot for a single asset from the exchange.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BalanceInfo {
    pub asset: String,
    #[serde(default)]
    pub free: f64,
    #[serde(default)]
    pub locked: f64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn authority_ranking_matches_merge_rule() {
        let mut sources = vec![
            DetectionSource::TickerDiff,
            DetectionSource::Calendar,
            DetectionSource::ExchangeInfo,
            DetectionSource::Symbolsv2,
        ];
        sources.sort_by_key(|s| s.authority_rank());
        assert_eq!(
            sources,
            vec![
                DetectionSource::Calendar,
                DetectionSource::Symbolsv2,
                DetectionSource::ExchangeInfo,
                DetectionSource::TickerDiff,
            ]
        );
    }

    #[test]
    fn mark_to_market_updates_high_water_mark() {
        let mut p = Position::new(
            "NEWUSDT".into(),
            10.0,
            1.0,
            "o1".into(),
            "t1".into(),
            Utc::now(),
        );
        p.mark_to_market(1.5);
        assert_eq!(p.high_water_mark, 1.5);
        p.mark_to_market(1.2);
        assert_eq!(p.high_water_mark, 1.5);
        assert_eq!(p.unrealized_pnl, Some((1.2 - 1.0) * 10.0));
    }
}
