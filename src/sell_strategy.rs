//! Periodic exit engine: a tick loop that evaluates each open position
//! against four ordered sell rules, first match wins.
//!
//! Evaluated in order, first match wins: `STOP_LOSS` → `TRAILING_STOP` →
//! `PROFIT_TARGET` → `TIME_BASED`. Under `SellStrategy::Combined` all four
//! are active simultaneously with that same ordering; a non-combined
//! strategy only ever checks its own rule.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::clock::Clock;
use crate::config::{SellStrategy, TradingConfiguration};
use crate::events::EventBus;
use crate::exchange::client::ExchangeClient;
use crate::execution::TradeExecutor;
use crate::position_tracker::PositionTracker;
use crate::types::{Position, SellReason};

/// Price staleness budget: a quote older than this at evaluation time makes
/// the tick skip that position rather than act on an old price.
const MAX_QUOTE_AGE: Duration = Duration::from_secs(5);

fn matches_rule(position: &Position, config: &TradingConfiguration, reason: SellReason) -> bool {
    match config.sell_strategy {
        SellStrategy::Combined => true,
        SellStrategy::StopLoss => reason == SellReason::StopLoss,
        SellStrategy::TrailingStop => reason == SellReason::TrailingStop,
        SellStrategy::ProfitTarget => reason == SellReason::ProfitTarget,
        SellStrategy::TimeBased => reason == SellReason::TimeBased,
    }
}

/// Applies the four ordered rules to a single position snapshot and returns
/// the first one that fires, if any. Pure function so it can be unit tested
/// without a live exchange connection.
pub fn evaluate(position: &Position, config: &TradingConfiguration, now: chrono::DateTime<Utc>) -> Option<SellReason> {
    let price = position.current_price?;
    let entry = position.entry_price;

    let stop_loss_price = entry * (1.0 - config.stop_loss_bps as f64 / 10_000.0);
    if matches_rule(position, config, SellReason::StopLoss) && price <= stop_loss_price {
        return Some(SellReason::StopLoss);
    }

    if matches_rule(position, config, SellReason::TrailingStop) && position.high_water_mark > entry {
        let trail_trigger = position.high_water_mark * (1.0 - config.trailing_stop_bps as f64 / 10_000.0);
        if price <= trail_trigger {
            return Some(SellReason::TrailingStop);
        }
    }

    let profit_target_price = entry * (1.0 + config.profit_target_bps as f64 / 10_000.0);
    if matches_rule(position, config, SellReason::ProfitTarget) && price >= profit_target_price {
        return Some(SellReason::ProfitTarget);
    }

    if matches_rule(position, config, SellReason::TimeBased) {
        let held_for = now.signed_duration_since(position.entry_time);
        if held_for >= chrono::Duration::minutes(config.time_based_exit_minutes as i64) {
            return Some(SellReason::TimeBased);
        }
    }

    None
}

pub struct SellStrategyMonitor {
    tracker: Arc<PositionTracker>,
    client: Arc<ExchangeClient>,
    executor: Arc<TradeExecutor>,
    config: Arc<parking_lot::RwLock<TradingConfiguration>>,
    bus: Arc<EventBus>,
    clock: Arc<dyn Clock>,
    tick_interval: Duration,
}

impl SellStrategyMonitor {
    pub fn new(
        tracker: Arc<PositionTracker>,
        client: Arc<ExchangeClient>,
        executor: Arc<TradeExecutor>,
        config: Arc<parking_lot::RwLock<TradingConfiguration>>,
        bus: Arc<EventBus>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            tracker,
            client,
            executor,
            config,
            bus,
            clock,
            tick_interval: Duration::from_secs(1),
        }
    }

    async fn tick_once(&self) {
        let positions = self.tracker.list();
        let config = self.config.read().clone();

        for position in positions {
            let fetched_at = self.clock.now();
            let price = match self.client.get_ticker_price(&position.symbol).await {
                Ok(p) => p.price,
                Err(e) => {
                    warn!(symbol = %position.symbol, error = %e, "sell-strategy price fetch failed, will retry next tick");
                    continue;
                }
            };
            let now = self.clock.now();
            let age = now.signed_duration_since(fetched_at);
            if age.num_milliseconds() > MAX_QUOTE_AGE.as_millis() as i64 {
                debug!(symbol = %position.symbol, age_ms = age.num_milliseconds(), "quote too stale, skipping tick for this position");
                continue;
            }

            let marked = match self.tracker.mark_to_market(&position.symbol, price) {
                Some(p) => p,
                None => continue, // closed concurrently by the executor
            };

            if let Some(reason) = evaluate(&marked, &config, now) {
                info!(symbol = %marked.symbol, ?reason, price, "sell rule fired");
                if let Err(e) = self.executor.execute_sell_trade(&marked.symbol, None, reason).await {
                    warn!(symbol = %marked.symbol, error = %e, "sell execution failed");
                }
            }
        }
    }

    /// Runs the periodic, non-overlapping exit-monitor loop until `shutdown`
    /// resolves.
    pub async fn run(self, mut shutdown: tokio::sync::watch::Receiver<bool>) {
        let mut interval = tokio::time::interval(self.tick_interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

        info!("sell-strategy monitor started");
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    self.tick_once().await;
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("sell-strategy monitor shutting down");
                        break;
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration as ChronoDuration;

    fn base_config() -> TradingConfiguration {
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
            sell_strategy: SellStrategy::Combined,
            is_active: true,
        }
    }

    fn position_at(entry: f64, current: f64, high_water_mark: f64, entry_time: chrono::DateTime<Utc>) -> Position {
        let mut p = Position::new("NEWUSDT".into(), 10.0, entry, "o1".into(), "t1".into(), entry_time);
        p.high_water_mark = high_water_mark;
        p.current_price = Some(current);
        p
    }

    #[test]
    fn stop_loss_fires_first_even_when_other_rules_also_match() {
        let config = base_config();
        let now = Utc::now();
        // price crashed below both stop-loss and would also be a time-based exit
        let position = position_at(2.0, 1.9, 2.0, now - ChronoDuration::minutes(120));
        assert_eq!(evaluate(&position, &config, now), Some(SellReason::StopLoss));
    }

    #[test]
    fn trailing_stop_only_triggers_after_a_new_high() {
        let config = base_config();
        let now = Utc::now();
        let position = position_at(2.0, 1.99, 2.0, now);
        // high_water_mark == entry, so trailing stop's precondition is unmet
        assert_ne!(evaluate(&position, &config, now), Some(SellReason::TrailingStop));
    }

    #[test]
    fn trailing_stop_fires_after_giving_back_from_the_high() {
        let config = base_config();
        let now = Utc::now();
        // entry 2.00, ran to 2.20, trailing_stop_bps=200 (2%) -> trigger at 2.156
        let position = position_at(2.0, 2.15, 2.20, now);
        assert_eq!(evaluate(&position, &config, now), Some(SellReason::TrailingStop));
    }

    #[test]
    fn profit_target_fires_at_configured_bps() {
        let config = base_config();
        let now = Utc::now();
        let position = position_at(2.0, 2.11, 2.11, now);
        assert_eq!(evaluate(&position, &config, now), Some(SellReason::ProfitTarget));
    }

    #[test]
    fn time_based_exit_fires_after_the_configured_window() {
        let config = base_config();
        let now = Utc::now();
        let position = position_at(2.0, 2.01, 2.01, now - ChronoDuration::minutes(61));
        assert_eq!(evaluate(&position, &config, now), Some(SellReason::TimeBased));
    }

    #[test]
    fn non_combined_strategy_ignores_other_rules() {
        let mut config = base_config();
        config.sell_strategy = SellStrategy::ProfitTarget;
        let now = Utc::now();
        // would be a stop-loss under COMBINED, but strategy is PROFIT_TARGET only
        let position = position_at(2.0, 1.9, 2.0, now);
        assert_eq!(evaluate(&position, &config, now), None);
    }

    #[test]
    fn no_rule_fires_when_price_is_flat() {
        let config = base_config();
        let now = Utc::now();
        let position = position_at(2.0, 2.01, 2.01, now);
        assert_eq!(evaluate(&position, &config, now), None);
    }
}
