//! Ticks the three scanners on a fixed interval, fans them out concurrently,
//! merges overlapping signals by source authority, and dedups into the
//! signal store before notifying the configured sink.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info};

use crate::detection::signal_store::ListingSignalStore;
use crate::detection::scanners::{CalendarScanner, ExchangeInfoScanner, TickerDiffScanner};
use crate::types::ListingSignal;

pub struct DetectionOrchestrator {
    calendar: CalendarScanner,
    ticker_diff: TickerDiffScanner,
    exchange_info: ExchangeInfoScanner,
    store: Arc<ListingSignalStore>,
    tick_interval: Duration,
    sink: mpsc::UnboundedSender<ListingSignal>,
}

impl DetectionOrchestrator {
    pub fn new(
        calendar: CalendarScanner,
        ticker_diff: TickerDiffScanner,
        exchange_info: ExchangeInfoScanner,
        store: Arc<ListingSignalStore>,
        tick_interval: Duration,
        sink: mpsc::UnboundedSender<ListingSignal>,
    ) -> Self {
        Self {
            calendar,
            ticker_diff,
            exchange_info,
            store,
            tick_interval,
            sink,
        }
    }

    /// Merges signals for the same symbol observed by multiple scanners in a
    /// single tick, keeping only the highest-authority one
    /// (calendar > exchange_info/symbolsv2 > ticker_diff).
    fn merge(mut signals: Vec<ListingSignal>) -> Vec<ListingSignal> {
        signals.sort_by(|a, b| {
            a.source
                .authority_rank()
                .cmp(&b.source.authority_rank())
        });
        let mut seen = std::collections::HashSet::new();
        signals.retain(|s| seen.insert(s.symbol.clone()));
        signals
    }

    async fn tick_once(&self) {
        let (calendar, ticker, exch_info) = tokio::join!(
            self.calendar.scan(),
            self.ticker_diff.scan(),
            self.exchange_info.scan(),
        );

        let mut combined = Vec::with_capacity(calendar.len() + ticker.len() + exch_info.len());
        combined.extend(calendar);
        combined.extend(ticker);
        combined.extend(exch_info);

        let merged = Self::merge(combined);

        for signal in merged {
            if self.store.try_record(signal.clone()) {
                debug!(symbol = %signal.symbol, source = %signal.source, "new listing signal dispatched");
                if self.sink.send(signal).is_err() {
                    break;
                }
            }
        }
    }

    /// Runs the periodic, non-overlapping detection loop until `shutdown`
    /// resolves. A tick that is still running when the next one would fire
    /// is skipped (`Skip` missed-tick policy) rather than queued.
    pub async fn run(self, mut shutdown: tokio::sync::watch::Receiver<bool>) {
        let mut interval = tokio::time::interval(self.tick_interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

        info!(interval_secs = self.tick_interval.as_secs(), "detection orchestrator started");
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    self.tick_once().await;
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("detection orchestrator shutting down");
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
    use crate::types::{Confidence, DetectionSource};
    use chrono::Utc;

    fn signal(symbol: &str, source: DetectionSource) -> ListingSignal {
        let now = Utc::now();
        ListingSignal {
            symbol: symbol.to_string(),
            source,
            detected_at: now,
            listing_time: None,
            confidence: Confidence::High,
            freshness_deadline: now + chrono::Duration::seconds(60),
        }
    }

    #[test]
    fn merge_keeps_highest_authority_source() {
        let signals = vec![
            signal("NEWUSDT", DetectionSource::TickerDiff),
            signal("NEWUSDT", DetectionSource::Calendar),
            signal("NEWUSDT", DetectionSource::ExchangeInfo),
        ];
        let merged = DetectionOrchestrator::merge(signals);
        assert_eq!(merged.len(), 1);
        assert_eq!(merged[0].source, DetectionSource::Calendar);
    }

    #[test]
    fn merge_preserves_distinct_symbols() {
        let signals = vec![
            signal("AAAUSDT", DetectionSource::Calendar),
            signal("BBBUSDT", DetectionSource::TickerDiff),
        ];
        let merged = DetectionOrchestrator::merge(signals);
        assert_eq!(merged.len(), 2);
    }
}
