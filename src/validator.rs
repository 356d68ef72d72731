//! Client-side pre-check of (symbol, price, qty) against exchange rules.
//!
//! Catches what would otherwise be a rejected exchange round-trip. Fails
//! closed when rules are missing, per the contract.

use crate::exchange::rules_cache::RulesCache;
use crate::types::SymbolStatus;

const EPSILON: f64 = 1e-8;

#[derive(Debug, Clone, Default)]
pub struct ValidationResult {
    pub valid: bool,
    pub errors: Vec<String>,
}

impl ValidationResult {
    fn ok() -> Self {
        Self {
            valid: true,
            errors: Vec::new(),
        }
    }

    fn fail(errors: Vec<String>) -> Self {
        Self {
            valid: false,
            errors,
        }
    }
}

pub struct OrderValidator;

impl OrderValidator {
    pub fn validate(rules_cache: &RulesCache, symbol: &str, price: f64, qty: f64) -> ValidationResult {
        let Some(rules) = rules_cache.get(symbol) else {
            return ValidationResult::fail(vec![format!("no validation rules cached for {symbol}")]);
        };

        let mut errors = Vec::new();

        if qty < rules.min_qty || qty > rules.max_qty {
            errors.push(format!(
                "qty {qty} outside [{}, {}]",
                rules.min_qty, rules.max_qty
            ));
        }

        if rules.step_size > 0.0 {
            let remainder = (qty / rules.step_size).round() * rules.step_size - qty;
            if remainder.abs() > EPSILON {
                errors.push(format!("qty {qty} is not a multiple of stepSize {}", rules.step_size));
            }
        }

        if price * qty < rules.min_notional {
            errors.push(format!(
                "notional {:.8} below minNotional {}",
                price * qty,
                rules.min_notional
            ));
        }

        if rules.tick_size > 0.0 {
            let remainder = (price / rules.tick_size).round() * rules.tick_size - price;
            if remainder.abs() > EPSILON {
                errors.push(format!("price {price} is not a multiple of tickSize {}", rules.tick_size));
            }
        }

        if rules.status != SymbolStatus::Enabled {
            errors.push(format!("symbol {symbol} status is not ENABLED"));
        }

        if errors.is_empty() {
            ValidationResult::ok()
        } else {
            ValidationResult::fail(errors)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ValidationRules;
    use chrono::Utc;

    fn cache_with(rule: ValidationRules) -> RulesCache {
        let cache = RulesCache::default();
        cache.replace_all(vec![rule], Utc::now());
        cache
    }

    fn rule() -> ValidationRules {
        ValidationRules {
            symbol: "NEWUSDT".into(),
            min_qty: 1.0,
            max_qty: 1_000.0,
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
    fn valid_order_passes() {
        let cache = cache_with(rule());
        let result = OrderValidator::validate(&cache, "NEWUSDT", 1.0, 10.0);
        assert!(result.valid, "{:?}", result.errors);
    }

    #[test]
    fn fails_closed_when_rules_missing() {
        let cache = RulesCache::default();
        let result = OrderValidator::validate(&cache, "UNKNOWN", 1.0, 10.0);
        assert!(!result.valid);
    }

    #[test]
    fn rejects_below_min_notional() {
        let cache = cache_with(rule());
        let result = OrderValidator::validate(&cache, "NEWUSDT", 0.5, 1.0);
        assert!(!result.valid);
        assert!(result.errors.iter().any(|e| e.contains("minNotional")));
    }

    #[test]
    fn rejects_disabled_symbol() {
        let mut r = rule();
        r.status = SymbolStatus::Disabled;
        let cache = cache_with(r);
        let result = OrderValidator::validate(&cache, "NEWUSDT", 1.0, 10.0);
        assert!(!result.valid);
    }
}
