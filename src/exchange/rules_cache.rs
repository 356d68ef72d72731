//! Time-bounded cache of per-symbol exchange filters (LOT_SIZE, MIN_NOTIONAL, PRICE_FILTER).

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

use crate::types::{SymbolStatus, ValidationRules};

const DEFAULT_TTL: Duration = Duration::from_secs(3_600);

pub struct RulesCache {
    rules: RwLock<HashMap<String, ValidationRules>>,
    last_update: RwLock<Option<DateTime<Utc>>>,
    ttl: Duration,
}

impl RulesCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            rules: RwLock::new(HashMap::new()),
            last_update: RwLock::new(None),
            ttl,
        }
    }

    pub fn needs_refresh(&self, now: DateTime<Utc>) -> bool {
        match *self.last_update.read() {
            None => true,
            Some(last) => {
                (now - last).num_milliseconds() as u128 > self.ttl.as_millis() || self.rules.read().is_empty()
            }
        }
    }

    pub fn replace_all(&self, rules: Vec<ValidationRules>, now: DateTime<Utc>) {
        let mut map = self.rules.write();
        map.clear();
        for rule in rules {
            map.insert(rule.symbol.clone(), rule);
        }
        *self.last_update.write() = Some(now);
        info!(symbol_count = map.len(), "exchange rules cache refreshed");
    }

    pub fn get(&self, symbol: &str) -> Option<ValidationRules> {
        self.rules.read().get(symbol).cloned()
    }

    /// Rounds `qty` down to the nearest legal multiple of `stepSize`, clamped to [minQty, maxQty].
    pub fn adjust_quantity(&self, symbol: &str, qty: f64) -> Option<f64> {
        let rules = self.get(symbol)?;
        Some(round_down_to_step(qty, rules.step_size).clamp(rules.min_qty, rules.max_qty))
    }

    /// Rounds `price` down to the nearest legal multiple of `tickSize`.
    pub fn adjust_price(&self, symbol: &str, price: f64) -> Option<f64> {
        let rules = self.get(symbol)?;
        Some(round_down_to_step(price, rules.tick_size))
    }

    pub fn is_enabled(&self, symbol: &str) -> bool {
        self.get(symbol)
            .map(|r| r.status == SymbolStatus::Enabled)
            .unwrap_or(false)
    }
}

impl Default for RulesCache {
    fn default() -> Self {
        Self::new(DEFAULT_TTL)
    }
}

pub fn round_down_to_step(value: f64, step: f64) -> f64 {
    if step <= 0.0 {
        return value;
    }
    (value / step).floor() * step
}

pub type SharedRulesCache = Arc<RulesCache>;

#[cfg(test)]
mod tests {
    use super::*;

    fn rule(symbol: &str) -> ValidationRules {
        ValidationRules {
            symbol: symbol.to_string(),
            min_qty: 1.0,
            max_qty: 10_000.0,
            step_size: 1.0,
            min_notional: 5.0,
            tick_size: 0.0001,
            base_asset: "NEW".into(),
            quote_asset: "USDT".into(),
            status: SymbolStatus::Enabled,
            loaded_at: Utc::now(),
        }
    }

    #[test]
    fn adjust_quantity_rounds_down_and_clamps() {
        let cache = RulesCache::default();
        cache.replace_all(vec![rule("NEWUSDT")], Utc::now());
        assert_eq!(cache.adjust_quantity("NEWUSDT", 10.9), Some(10.0));
        assert_eq!(cache.adjust_quantity("NEWUSDT", 0.5), Some(1.0));
    }

    #[test]
    fn adjust_quantity_is_idempotent() {
        let cache = RulesCache::default();
        cache.replace_all(vec![rule("NEWUSDT")], Utc::now());
        let once = cache.adjust_quantity("NEWUSDT", 10.37).unwrap();
        let twice = cache.adjust_quantity("NEWUSDT", once).unwrap();
        assert_eq!(once, twice);
    }

    #[test]
    fn missing_symbol_returns_none() {
        let cache = RulesCache::default();
        assert_eq!(cache.get("MISSING"), None);
        assert_eq!(cache.adjust_quantity("MISSING", 1.0), None);
    }

    #[test]
    fn needs_refresh_when_empty() {
        let cache = RulesCache::default();
        assert!(cache.needs_refresh(Utc::now()));
    }
}
