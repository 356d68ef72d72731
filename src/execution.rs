//! Trade execution pipeline: `execute_trade` (BUY) and `execute_sell_trade`
//! (SELL), running the full validate -> size -> risk -> submit -> record
//! pipeline against the resilience fabric. Demo-mode simulation lets
//! `AccountMode::Demo` stand as the safe default for a fresh deployment.

use std::collections::VecDeque;
use std::sync::Arc;

use chrono::{NaiveDate, Utc};
use parking_lot::{Mutex, RwLock};
use tracing::{info, warn};

use crate::config::TradingConfiguration;
use crate::error::CoreError;
use crate::events::{AlertSeverity, BusEvent, EventBus, SystemAlert, TradeUpdate};
use crate::exchange::client::ExchangeClient;
use crate::exchange::rules_cache::RulesCache;
use crate::metrics::Metrics;
use crate::position_tracker::PositionTracker;
use crate::risk::{OrderRiskCheck, RiskEngine};
use crate::types::{AccountMode, ListingSignal, OrderType, Position, SellReason, Side, TradeAttempt, TradeStatus};
use crate::validator::OrderValidator;

/// Buy orders carry a planned protective stop even before the sell-strategy
/// engine takes over; the risk check's floor guards against a configured
/// `stopLossBps` so tight it would trip on exchange noise alone.
const MIN_STOP_DISTANCE_PCT: f64 = 0.001;

/// recvWindow ceiling enforced at the safety-check stage, independent of
/// whatever the caller requests.
const MAX_RECV_WINDOW_MS: u32 = 1_000;

fn today() -> NaiveDate {
    Utc::now().date_naive()
}

/// Minimal shape both the live order response and the demo synthetic fill
/// can be mapped into, so the fill-handling logic below doesn't care which
/// account mode produced it.
struct Fill {
    order_id: String,
    price: Option<f64>,
    executed_qty: Option<f64>,
}

struct SpendLedger {
    date: NaiveDate,
    spent_today: f64,
}

/// Bound on the in-memory trade journal exposed to the dashboard's
/// `getTradeHistory`/`getTradingStats` RPCs. Persistence is explicitly out
/// of scope, so this is a best-effort ring buffer, not a durable log.
const TRADE_JOURNAL_CAPACITY: usize = 500;

pub struct TradeExecutor {
    client: Arc<ExchangeClient>,
    rules_cache: Arc<RulesCache>,
    risk: Arc<RiskEngine>,
    tracker: Arc<PositionTracker>,
    config: Arc<RwLock<TradingConfiguration>>,
    bus: Arc<EventBus>,
    metrics: Arc<Metrics>,
    account_mode: RwLock<AccountMode>,
    hourly_trades: Mutex<VecDeque<chrono::DateTime<Utc>>>,
    spend_ledger: Mutex<SpendLedger>,
    trade_journal: Mutex<VecDeque<TradeAttempt>>,
}

impl TradeExecutor {
    pub fn new(
        client: Arc<ExchangeClient>,
        rules_cache: Arc<RulesCache>,
        risk: Arc<RiskEngine>,
        tracker: Arc<PositionTracker>,
        config: Arc<RwLock<TradingConfiguration>>,
        bus: Arc<EventBus>,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            client,
            rules_cache,
            risk,
            tracker,
            config,
            bus,
            metrics,
            account_mode: RwLock::new(AccountMode::default()),
            hourly_trades: Mutex::new(VecDeque::new()),
            spend_ledger: Mutex::new(SpendLedger {
                date: today(),
                spent_today: 0.0,
            }),
            trade_journal: Mutex::new(VecDeque::new()),
        }
    }

    /// Most recent trade attempts, newest last, capped at
    /// `TRADE_JOURNAL_CAPACITY`.
    pub fn trade_journal(&self) -> Vec<TradeAttempt> {
        self.trade_journal.lock().iter().cloned().collect()
    }

    fn record_journal(&self, attempt: &TradeAttempt) {
        let mut journal = self.trade_journal.lock();
        if journal.len() >= TRADE_JOURNAL_CAPACITY {
            journal.pop_front();
        }
        journal.push_back(attempt.clone());
    }

    pub fn set_account_mode(&self, mode: AccountMode) {
        *self.account_mode.write() = mode;
    }

    pub fn account_mode(&self) -> AccountMode {
        *self.account_mode.read()
    }

    fn prune_hourly_trades(&self) {
        let cutoff = Utc::now() - chrono::Duration::hours(1);
        let mut guard = self.hourly_trades.lock();
        while guard.front().is_some_and(|t| *t < cutoff) {
            guard.pop_front();
        }
    }

    fn trades_this_hour(&self) -> u32 {
        self.prune_hourly_trades();
        self.hourly_trades.lock().len() as u32
    }

    fn record_trade_timestamp(&self) {
        self.hourly_trades.lock().push_back(Utc::now());
    }

    fn daily_spend_remaining(&self, daily_spend_limit: f64) -> f64 {
        let mut ledger = self.spend_ledger.lock();
        let now = today();
        if ledger.date != now {
            ledger.date = now;
            ledger.spent_today = 0.0;
        }
        (daily_spend_limit - ledger.spent_today).max(0.0)
    }

    fn record_spend(&self, amount: f64) {
        let mut ledger = self.spend_ledger.lock();
        let now = today();
        if ledger.date != now {
            ledger.date = now;
            ledger.spent_today = 0.0;
        }
        ledger.spent_today += amount;
    }

    fn emit_alert(&self, severity: AlertSeverity, message: impl Into<String>) {
        self.bus.publish(BusEvent::SystemAlert(SystemAlert {
            severity,
            component: "trade_executor".to_string(),
            message: message.into(),
            action: None,
        }));
    }

    fn emit_trade_update(&self, attempt: &TradeAttempt) {
        self.bus.publish(BusEvent::TradeUpdate(TradeUpdate {
            id: attempt.id.clone(),
            symbol: attempt.symbol.clone(),
            status: format!("{:?}", attempt.status).to_uppercase(),
            strategy: attempt.order_type.to_string(),
            executed_price: attempt.executed_price,
            executed_quantity: attempt.executed_qty,
            execution_time: attempt.execution_ms,
            value: attempt.executed_price.unwrap_or(0.0) * attempt.executed_qty.unwrap_or(0.0),
        }));
    }

    /// `executeTrade(symbol, strategy=MARKET)`.
    pub async fn execute_trade(
        &self,
        symbol: &str,
        signal: Option<&ListingSignal>,
        strategy: OrderType,
        recv_window_ms: u32,
    ) -> Result<TradeAttempt, CoreError> {
        let config = self.config.read().clone();
        if !config.is_active || !config.safety_enabled {
            return Err(CoreError::trading("CONFIG_INACTIVE", "no active trading configuration"));
        }
        if !config.enabled_symbols.iter().any(|s| s == symbol) {
            return Err(CoreError::trading("SYMBOL_NOT_ENABLED", format!("{symbol} is not enabled")));
        }

        // Step 2: safety constraints.
        if recv_window_ms > MAX_RECV_WINDOW_MS {
            return Err(CoreError::trading(
                "RECV_WINDOW_TOO_WIDE",
                format!("recvWindow {recv_window_ms}ms exceeds {MAX_RECV_WINDOW_MS}ms ceiling"),
            ));
        }
        if let Some(sig) = signal {
            if !sig.is_fresh(Utc::now()) {
                self.metrics.increment_counter("trades_total_stale");
                return Err(CoreError::trading("SIGNAL_STALE", format!("signal for {symbol} past its freshness deadline")));
            }
        }
        if self.trades_this_hour() >= config.max_trades_per_hour {
            return Err(CoreError::trading(
                "SAFETY_TRADES_PER_HOUR",
                format!("{symbol}: hourly trade cap of {} reached", config.max_trades_per_hour),
            ));
        }

        // Step 3: candidate quantity.
        let ticker = self.client.get_ticker_price(symbol).await?;
        let last_price = ticker.price;
        let price = match strategy {
            OrderType::Market => last_price,
            OrderType::Limit => last_price * (1.0 + config.price_tolerance_bps as f64 / 10_000.0),
        };
        let candidate_qty = config.per_trade_quote / price;

        // Step 4: validator + auto-adjust. Fails closed when exchange filter
        // rules for the symbol haven't been cached yet.
        let (adjusted_qty, adjusted_price) = match (
            self.rules_cache.adjust_quantity(symbol, candidate_qty),
            self.rules_cache.adjust_price(symbol, price),
        ) {
            (Some(qty), Some(price)) => (qty, price),
            _ => {
                return Err(CoreError::trading("RULES_NOT_CACHED", format!("no exchange filter rules cached for {symbol}")));
            }
        };
        let validation = OrderValidator::validate(&self.rules_cache, symbol, adjusted_price, adjusted_qty);
        if !validation.valid {
            self.emit_alert(AlertSeverity::High, format!("{symbol} failed validation: {:?}", validation.errors));
            return Err(CoreError::trading("VALIDATION_FAILED", validation.errors.join("; ")));
        }

        // Step 5: risk manager.
        let daily_spend_remaining = self.daily_spend_remaining(config.daily_spend_limit);
        let planned_stop_loss = adjusted_price * (1.0 - config.stop_loss_bps as f64 / 10_000.0);
        let approval = self.risk.validate_order(&OrderRiskCheck {
            symbol: symbol.to_string(),
            qty: adjusted_qty,
            price: adjusted_price,
            stop_loss: Some(planned_stop_loss),
            stop_loss_floor_pct: MIN_STOP_DISTANCE_PCT,
            open_position_count: self.tracker.count() as u32,
            daily_spend_remaining,
        });
        if !approval.approved {
            let reason = approval.reason.unwrap_or_else(|| "risk check rejected order".to_string());
            self.emit_alert(AlertSeverity::High, format!("{symbol}: {reason}"));
            return Err(CoreError::trading("RISK_REJECTED", reason));
        }

        // Step 6: record PENDING attempt.
        let mut attempt = TradeAttempt::new_pending(
            symbol.to_string(),
            Side::Buy,
            strategy,
            adjusted_qty,
            Some(adjusted_price),
            config.id.clone(),
        );
        if let Some(sig) = signal {
            attempt.listing_event_id = Some(sig.dedup_bucket(60).0);
        }
        self.emit_trade_update(&attempt);

        // Step 7: submit.
        let started = std::time::Instant::now();
        let demo = self.account_mode() == AccountMode::Demo;
        let order_type_label = if matches!(strategy, OrderType::Limit) { "LIMIT" } else { "MARKET" };
        let submission: Result<Fill, CoreError> = if demo {
            info!(symbol, qty = adjusted_qty, price = adjusted_price, "simulated BUY (demo mode)");
            Ok(Fill {
                order_id: format!("demo-{}", attempt.id),
                price: Some(adjusted_price),
                executed_qty: Some(adjusted_qty),
            })
        } else {
            self.client
                .place_order(symbol, &Side::Buy.to_string(), order_type_label, adjusted_qty, Some(adjusted_price), recv_window_ms)
                .await
                .map(|r| Fill {
                    order_id: r.order_id,
                    price: r.price,
                    executed_qty: r.executed_qty,
                })
        };

        let execution_ms = started.elapsed().as_millis() as i64;
        attempt.execution_ms = execution_ms;
        attempt.completed_at = Some(Utc::now());

        match submission {
            Ok(fill) => {
                attempt.status = TradeStatus::Success;
                attempt.executed_price = fill.price.or(Some(adjusted_price));
                attempt.executed_qty = fill.executed_qty.or(Some(adjusted_qty));

                let executed_price = attempt.executed_price.unwrap_or(adjusted_price);
                let executed_qty = attempt.executed_qty.unwrap_or(adjusted_qty);

                let position = Position::new(
                    symbol.to_string(),
                    executed_qty,
                    executed_price,
                    fill.order_id.clone(),
                    attempt.id.clone(),
                    Utc::now(),
                );
                attempt.position_id = Some(symbol.to_string());
                self.tracker.open(position);
                self.record_spend(executed_price * executed_qty);
                self.record_trade_timestamp();
                self.metrics.increment_counter("trades_total_success");

                info!(symbol, executed_qty, executed_price, "BUY filled");
                self.emit_trade_update(&attempt);
                self.record_journal(&attempt);
                Ok(attempt)
            }
            Err(e) => {
                attempt.status = TradeStatus::Failed;
                attempt.error_message = Some(e.to_string());
                self.metrics.increment_counter("trades_total_failed");
                warn!(symbol, error = %e, "BUY submission failed");
                self.emit_trade_update(&attempt);
                self.emit_alert(AlertSeverity::High, format!("{symbol} BUY failed: {e}"));
                self.record_journal(&attempt);
                Err(e)
            }
        }
    }

    /// `executeSellTrade(symbol, qty?, strategy, sellReason)`.
    pub async fn execute_sell_trade(&self, symbol: &str, qty: Option<f64>, sell_reason: SellReason) -> anyhow::Result<TradeAttempt> {
        let position = self
            .tracker
            .get(symbol)
            .ok_or_else(|| anyhow::anyhow!("no open position for {symbol}"))?;
        let sell_qty = qty.unwrap_or(position.quantity).min(position.quantity);
        let config = self.config.read().clone();

        let mut attempt = TradeAttempt::new_pending(
            symbol.to_string(),
            Side::Sell,
            OrderType::Market,
            sell_qty,
            None,
            config.id.clone(),
        );
        attempt.parent_trade_id = Some(position.trade_attempt_id.clone());
        attempt.sell_reason = Some(sell_reason);
        self.emit_trade_update(&attempt);

        let started = std::time::Instant::now();
        let demo = self.account_mode() == AccountMode::Demo;
        let submission: Result<Fill, CoreError> = if demo {
            let price = position.current_price.unwrap_or(position.entry_price);
            Ok(Fill {
                order_id: format!("demo-{}", attempt.id),
                price: Some(price),
                executed_qty: Some(sell_qty),
            })
        } else {
            self.client
                .place_order(symbol, &Side::Sell.to_string(), "MARKET", sell_qty, None, 1_000)
                .await
                .map(|r| Fill {
                    order_id: r.order_id,
                    price: r.price,
                    executed_qty: r.executed_qty,
                })
        };

        attempt.execution_ms = started.elapsed().as_millis() as i64;
        attempt.completed_at = Some(Utc::now());

        match submission {
            Ok(fill) => {
                let exit_price = fill.price.unwrap_or_else(|| position.current_price.unwrap_or(position.entry_price));
                let executed_qty = fill.executed_qty.unwrap_or(sell_qty);
                attempt.status = TradeStatus::Success;
                attempt.executed_price = Some(exit_price);
                attempt.executed_qty = Some(executed_qty);

                if let Some(closed) = self.tracker.close(symbol, executed_qty, exit_price) {
                    self.risk.record_trade_result(closed.realized_pnl);
                    info!(symbol, realized_pnl = closed.realized_pnl, ?sell_reason, "SELL filled, position closed/reduced");
                }
                self.metrics.increment_counter("trades_total_success");
                self.emit_trade_update(&attempt);
                self.record_journal(&attempt);
                Ok(attempt)
            }
            Err(e) => {
                attempt.status = TradeStatus::Failed;
                attempt.error_message = Some(e.to_string());
                self.metrics.increment_counter("trades_total_failed");
                warn!(symbol, error = %e, "SELL submission failed");
                self.emit_trade_update(&attempt);
                self.emit_alert(AlertSeverity::High, format!("{symbol} SELL failed: {e}"));
                self.record_journal(&attempt);
                Err(e.into())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_config() -> TradingConfiguration {
        TradingConfiguration {
            user_id: "u1".into(),
            id: "c1".into(),
            enabled_symbols: vec!["NEWUSDT".into()],
            per_trade_quote: 10.0,
            max_purchase: 100.0,
            daily_spend_limit: 100.0,
            max_trades_per_hour: 10,
            polling_interval_ms: 5_000,
            order_timeout_ms: 10_000,
            price_tolerance_bps: 100,
            safety_enabled: true,
            profit_target_bps: 500,
            stop_loss_bps: 300,
            time_based_exit_minutes: 60,
            trailing_stop_bps: 200,
            sell_strategy: crate::config::SellStrategy::Combined,
            is_active: true,
        }
    }

    fn executor() -> TradeExecutor {
        let client = Arc::new(
            ExchangeClient::new(
                "https://api.mexc.com".to_string(),
                "https://www.mexc.com".to_string(),
                crate::exchange::client::ExchangeCredentials {
                    api_key: "k".to_string(),
                    secret_key: "s".to_string(),
                },
                Arc::new(Metrics::default()),
            )
            .unwrap(),
        );
        TradeExecutor::new(
            client,
            Arc::new(RulesCache::default()),
            Arc::new(RiskEngine::new(1_000.0, 0.1, 10, 0.2, 100, 5)),
            Arc::new(PositionTracker::new()),
            Arc::new(RwLock::new(sample_config())),
            Arc::new(EventBus::new()),
            Arc::new(Metrics::default()),
        )
    }

    #[test]
    fn daily_spend_ledger_resets_on_date_change() {
        let executor = executor();
        executor.record_spend(40.0);
        assert_eq!(executor.daily_spend_remaining(100.0), 60.0);

        executor.spend_ledger.lock().date = today() - chrono::Duration::days(1);
        assert_eq!(executor.daily_spend_remaining(100.0), 100.0);
    }

    #[test]
    fn hourly_trade_window_prunes_entries_older_than_an_hour() {
        let executor = executor();
        executor.hourly_trades.lock().push_back(Utc::now() - chrono::Duration::minutes(61));
        executor.record_trade_timestamp();
        assert_eq!(executor.trades_this_hour(), 1);
    }

    #[tokio::test]
    async fn demo_mode_sell_without_an_open_position_fails() {
        let executor = executor();
        let result = executor.execute_sell_trade("NEWUSDT", None, SellReason::Manual).await;
        assert!(result.is_err());
    }
}
