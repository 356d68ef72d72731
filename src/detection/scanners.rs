//! The three listing scanners: calendar, ticker-diff, exchange-info.
//! Each owns its own last-call timestamp so it self-throttles independently
//! of the global exchange rate limiter.

use chrono::Utc;
use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

use crate::detection::signal_store::new_signal;
use crate::exchange::client::ExchangeClient;
use crate::exchange::rules_cache::RulesCache;
use crate::types::{Confidence, DetectionSource, ListingSignal};

const KNOWN_QUOTES: [&str; 5] = ["USDT", "USDC", "BTC", "ETH", "BNB"];

/// Uppercases the symbol and appends `USDT` unless it already ends with a
/// known quote asset.
pub fn normalize_symbol(raw: &str) -> String {
    let upper = raw.to_ascii_uppercase();
    if KNOWN_QUOTES.iter().any(|q| upper.ends_with(q)) {
        upper
    } else {
        format!("{upper}USDT")
    }
}

struct RateGate {
    min_interval: Duration,
    last_call: Mutex<Option<Instant>>,
}

impl RateGate {
    fn new(min_interval: Duration) -> Self {
        Self {
            min_interval,
            last_call: Mutex::new(None),
        }
    }

    fn ready(&self) -> bool {
        let mut guard = self.last_call.lock();
        let now = Instant::now();
        let ready = guard.map(|last| now.duration_since(last) >= self.min_interval).unwrap_or(true);
        if ready {
            *guard = Some(now);
        }
        ready
    }
}

pub struct CalendarScanner {
    client: Arc<ExchangeClient>,
    gate: RateGate,
}

impl CalendarScanner {
    pub fn new(client: Arc<ExchangeClient>) -> Self {
        Self {
            client,
            gate: RateGate::new(Duration::from_secs(30)),
        }
    }

    pub async fn scan(&self) -> Vec<ListingSignal> {
        if !self.gate.ready() {
            return Vec::new();
        }
        let now = Utc::now();
        match self.client.get_calendar().await {
            Ok(entries) => entries
                .into_iter()
                .filter(|e| e.is_valid())
                .map(|e| {
                    let listing_time = chrono::DateTime::from_timestamp_millis(e.first_open_time);
                    new_signal(
                        normalize_symbol(&e.symbol),
                        DetectionSource::Calendar,
                        Confidence::High,
                        listing_time,
                        now,
                    )
                })
                .collect(),
            Err(e) => {
                warn!(error = %e, "calendar scanner failed, degrading to empty result");
                Vec::new()
            }
        }
    }
}

pub struct TickerDiffScanner {
    client: Arc<ExchangeClient>,
    gate: RateGate,
    previous_symbols: Mutex<Option<HashSet<String>>>,
}

impl TickerDiffScanner {
    pub fn new(client: Arc<ExchangeClient>) -> Self {
        Self {
            client,
            gate: RateGate::new(Duration::from_secs(15)),
            previous_symbols: Mutex::new(None),
        }
    }

    /// First tick only populates the baseline and emits nothing; subsequent
    /// ticks emit `currentSymbols \ previousSymbols`.
    pub async fn scan(&self) -> Vec<ListingSignal> {
        if !self.gate.ready() {
            return Vec::new();
        }
        let now = Utc::now();
        let current: HashSet<String> = match self.client.get_ticker_24hr().await {
            Ok(tickers) => tickers
                .into_iter()
                .filter(|t| t.symbol.ends_with("USDT"))
                .map(|t| t.symbol)
                .collect(),
            Err(e) => {
                warn!(error = %e, "ticker-diff scanner failed, degrading to empty result");
                return Vec::new();
            }
        };

        let mut guard = self.previous_symbols.lock();
        let previous = guard.take();
        let new_symbols: Vec<String> = match &previous {
            None => {
                debug!(count = current.len(), "ticker-diff baseline established");
                Vec::new()
            }
            Some(prev) => current.difference(prev).cloned().collect(),
        };
        *guard = Some(current);

        new_symbols
            .into_iter()
            .map(|symbol| new_signal(symbol, DetectionSource::TickerDiff, Confidence::Medium, None, now))
            .collect()
    }
}

/// Treated as an alias of the exchange-info scanner; `symbolsv2` is
/// degenerate upstream (just filters by status == TRADING).
///
/// Every successful fetch also feeds the shared `RulesCache` directly (the
/// response already carries each symbol's LOT_SIZE/MIN_NOTIONAL/PRICE_FILTER
/// filters), so a newly listed symbol has cached `ValidationRules` by the
/// time any dispatched signal for it reaches the trade executor.
pub struct ExchangeInfoScanner {
    client: Arc<ExchangeClient>,
    rules_cache: Arc<RulesCache>,
    gate: RateGate,
    previous_symbols: Mutex<Option<HashSet<String>>>,
}

impl ExchangeInfoScanner {
    pub fn new(client: Arc<ExchangeClient>, rules_cache: Arc<RulesCache>) -> Self {
        Self {
            client,
            rules_cache,
            gate: RateGate::new(Duration::from_secs(60)),
            previous_symbols: Mutex::new(None),
        }
    }

    pub async fn scan(&self) -> Vec<ListingSignal> {
        if !self.gate.ready() {
            return Vec::new();
        }
        let now = Utc::now();
        let rules = match self.client.get_exchange_info().await {
            Ok(r) => r,
            Err(e) => {
                warn!(error = %e, "exchange-info scanner failed, degrading to empty result");
                return Vec::new();
            }
        };

        self.rules_cache.replace_all(rules.clone(), now);

        let current: HashSet<String> = rules
            .into_iter()
            .filter(|r| r.status == crate::types::SymbolStatus::Enabled)
            .map(|r| r.symbol)
            .collect();

        let mut guard = self.previous_symbols.lock();
        let previous = guard.take();
        let new_symbols: Vec<String> = match &previous {
            None => Vec::new(),
            Some(prev) => current.difference(prev).cloned().collect(),
        };
        *guard = Some(current);

        new_symbols
            .into_iter()
            .map(|symbol| {
                new_signal(symbol, DetectionSource::ExchangeInfo, Confidence::Medium, None, now)
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalizes_bare_base_to_usdt() {
        assert_eq!(normalize_symbol("new"), "NEWUSDT");
    }

    #[test]
    fn leaves_known_quote_suffix_untouched() {
        assert_eq!(normalize_symbol("newbtc"), "NEWBTC");
        assert_eq!(normalize_symbol("NEWUSDC"), "NEWUSDC");
    }

    #[test]
    fn rate_gate_blocks_immediate_repeat_calls() {
        let gate = RateGate::new(Duration::from_secs(30));
        assert!(gate.ready());
        assert!(!gate.ready());
    }
}
