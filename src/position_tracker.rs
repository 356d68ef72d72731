//! Symbol-keyed open-position book. At most one open position per symbol is
//! maintained at a time; closing drops the entry rather than keeping a
//! tombstone, since trade history lives on `TradeAttempt` records.

use std::collections::HashMap;

use parking_lot::RwLock;
use tracing::{debug, warn};

use crate::types::Position;

/// Outcome of closing a position, carrying the realized P&L so the caller
/// can fold it into daily risk bookkeeping without re-deriving it.
#[derive(Debug, Clone, Copy)]
pub struct ClosedPosition {
    pub quantity: f64,
    pub entry_price: f64,
    pub exit_price: f64,
    pub realized_pnl: f64,
    pub realized_pnl_percent: f64,
}

pub struct PositionTracker {
    positions: RwLock<HashMap<String, Position>>,
}

impl PositionTracker {
    pub fn new() -> Self {
        Self {
            positions: RwLock::new(HashMap::new()),
        }
    }

    /// Opens a position for `symbol`. Returns `false` without replacing the
    /// existing entry if one is already open for that symbol.
    pub fn open(&self, position: Position) -> bool {
        let mut guard = self.positions.write();
        if guard.contains_key(&position.symbol) {
            warn!(symbol = %position.symbol, "refusing to open a second position for the same symbol");
            return false;
        }
        debug!(symbol = %position.symbol, qty = position.quantity, price = position.entry_price, "position opened");
        guard.insert(position.symbol.clone(), position);
        true
    }

    pub fn get(&self, symbol: &str) -> Option<Position> {
        self.positions.read().get(symbol).cloned()
    }

    pub fn has_open(&self, symbol: &str) -> bool {
        self.positions.read().contains_key(symbol)
    }

    pub fn list(&self) -> Vec<Position> {
        self.positions.read().values().cloned().collect()
    }

    pub fn count(&self) -> usize {
        self.positions.read().len()
    }

    /// Marks a single symbol's position to market, returning the updated
    /// snapshot if one was open.
    pub fn mark_to_market(&self, symbol: &str, price: f64) -> Option<Position> {
        let mut guard = self.positions.write();
        let position = guard.get_mut(symbol)?;
        position.mark_to_market(price);
        Some(position.clone())
    }

    /// Marks every open position to the latest price in `prices`, skipping
    /// symbols with no quote available this tick.
    pub fn mark_all_to_market(&self, prices: &HashMap<String, f64>) {
        let mut guard = self.positions.write();
        for (symbol, position) in guard.iter_mut() {
            if let Some(price) = prices.get(symbol) {
                position.mark_to_market(*price);
            }
        }
    }

    /// Closes a full or partial position at `exit_price`, returning the
    /// realized result. A partial close (`close_qty < position.quantity`)
    /// shrinks the remaining position in place; a full close removes it.
    pub fn close(&self, symbol: &str, close_qty: f64, exit_price: f64) -> Option<ClosedPosition> {
        let mut guard = self.positions.write();
        let position = guard.get_mut(symbol)?;
        let qty = close_qty.min(position.quantity).max(0.0);
        if qty <= 0.0 {
            return None;
        }
        let realized_pnl = (exit_price - position.entry_price) * qty;
        let realized_pnl_percent = if position.entry_price > 0.0 {
            (exit_price - position.entry_price) / position.entry_price * 100.0
        } else {
            0.0
        };
        let result = ClosedPosition {
            quantity: qty,
            entry_price: position.entry_price,
            exit_price,
            realized_pnl,
            realized_pnl_percent,
        };

        if qty >= position.quantity {
            guard.remove(symbol);
            debug!(symbol, realized_pnl, "position closed in full");
        } else {
            position.quantity -= qty;
            debug!(symbol, remaining = position.quantity, realized_pnl, "position partially closed");
        }
        Some(result)
    }
}

impl Default for PositionTracker {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn position(symbol: &str, qty: f64, entry: f64) -> Position {
        Position::new(symbol.to_string(), qty, entry, "o1".into(), "t1".into(), Utc::now())
    }

    #[test]
    fn opening_twice_for_the_same_symbol_is_rejected() {
        let tracker = PositionTracker::new();
        assert!(tracker.open(position("NEWUSDT", 10.0, 1.0)));
        assert!(!tracker.open(position("NEWUSDT", 5.0, 1.2)));
        assert_eq!(tracker.count(), 1);
    }

    #[test]
    fn full_close_removes_the_position() {
        let tracker = PositionTracker::new();
        tracker.open(position("NEWUSDT", 10.0, 1.0));
        let closed = tracker.close("NEWUSDT", 10.0, 1.5).unwrap();
        assert_eq!(closed.realized_pnl, 5.0);
        assert!(!tracker.has_open("NEWUSDT"));
    }

    #[test]
    fn partial_close_shrinks_remaining_quantity() {
        let tracker = PositionTracker::new();
        tracker.open(position("NEWUSDT", 10.0, 1.0));
        let closed = tracker.close("NEWUSDT", 6.0, 1.5).unwrap();
        assert_eq!(closed.quantity, 6.0);
        assert_eq!(closed.realized_pnl, 3.0);
        let remaining = tracker.get("NEWUSDT").unwrap();
        assert_eq!(remaining.quantity, 4.0);
    }

    #[test]
    fn mark_all_to_market_skips_symbols_without_a_quote() {
        let tracker = PositionTracker::new();
        tracker.open(position("NEWUSDT", 10.0, 1.0));
        tracker.open(position("OLDUSDT", 5.0, 2.0));
        let mut prices = HashMap::new();
        prices.insert("NEWUSDT".to_string(), 1.2);
        tracker.mark_all_to_market(&prices);
        assert_eq!(tracker.get("NEWUSDT").unwrap().current_price, Some(1.2));
        assert_eq!(tracker.get("OLDUSDT").unwrap().current_price, None);
    }

    #[test]
    fn closing_unknown_symbol_returns_none() {
        let tracker = PositionTracker::new();
        assert!(tracker.close("GHOSTUSDT", 1.0, 1.0).is_none());
    }
}
