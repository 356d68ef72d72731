//! Persists listing signals, suppresses duplicates inside a dedup window,
//! and gates dispatch by freshness and recv-window.

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use std::collections::HashMap;
use tracing::debug;

use crate::types::{Confidence, DetectionSource, ListingSignal};

const DEFAULT_DEDUP_WINDOW_SECS: i64 = 60;

pub struct ListingSignalStore {
    signals: RwLock<HashMap<(String, DetectionSource, i64), ListingSignal>>,
    dedup_window_secs: i64,
}

impl ListingSignalStore {
    pub fn new(dedup_window_secs: i64) -> Self {
        Self {
            signals: RwLock::new(HashMap::new()),
            dedup_window_secs,
        }
    }

    /// Attempts to persist `signal`. Returns `true` if it was newly
    /// recorded (i.e. not a duplicate within the window); `false` if it was
    /// a duplicate and dropped. Store errors (not modeled here since this is
    /// in-memory) are documented to fail open per the contract.
    pub fn try_record(&self, signal: ListingSignal) -> bool {
        let key = signal.dedup_bucket(self.dedup_window_secs);
        let mut guard = self.signals.write();
        if guard.contains_key(&key) {
            debug!(symbol = %signal.symbol, source = %signal.source, "duplicate signal dropped");
            return false;
        }
        guard.insert(key, signal);
        true
    }

    pub fn evict_older_than(&self, now: DateTime<Utc>, max_age_secs: i64) {
        let mut guard = self.signals.write();
        guard.retain(|_, s| (now - s.detected_at).num_seconds() <= max_age_secs);
    }

    /// All signals currently held, most permissive read for the dashboard's
    /// `getRecentListings`/`getCalendarListings` RPCs. No ordering guarantee.
    pub fn list(&self) -> Vec<ListingSignal> {
        self.signals.read().values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.signals.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for ListingSignalStore {
    fn default() -> Self {
        Self::new(DEFAULT_DEDUP_WINDOW_SECS)
    }
}

/// Builds a fresh `ListingSignal` with the standard 60s freshness deadline.
pub fn new_signal(
    symbol: String,
    source: DetectionSource,
    confidence: Confidence,
    listing_time: Option<DateTime<Utc>>,
    now: DateTime<Utc>,
) -> ListingSignal {
    ListingSignal {
        symbol,
        source,
        detected_at: now,
        listing_time,
        confidence,
        freshness_deadline: now + chrono::Duration::seconds(60),
    }
}

/// Recv-window validation: the caller-supplied window must be in (0, 1000]ms.
pub fn validate_recv_window(recv_window_ms: u32) -> Result<(), String> {
    if recv_window_ms == 0 || recv_window_ms > 1_000 {
        Err(format!("recvWindow {recv_window_ms} outside (0, 1000]ms"))
    } else {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn duplicate_within_window_is_dropped() {
        let store = ListingSignalStore::new(60);
        let now = Utc::now();
        let s1 = new_signal("NEWUSDT".into(), DetectionSource::Calendar, Confidence::High, None, now);
        let s2 = new_signal("NEWUSDT".into(), DetectionSource::Calendar, Confidence::High, None, now);
        assert!(store.try_record(s1));
        assert!(!store.try_record(s2));
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn different_sources_both_recorded() {
        let store = ListingSignalStore::new(60);
        let now = Utc::now();
        let calendar = new_signal("NEWUSDT".into(), DetectionSource::Calendar, Confidence::High, None, now);
        let ticker = new_signal("NEWUSDT".into(), DetectionSource::TickerDiff, Confidence::Medium, None, now);
        assert!(store.try_record(calendar));
        assert!(store.try_record(ticker));
        assert_eq!(store.len(), 2);
    }

    #[test]
    fn recv_window_boundaries() {
        assert!(validate_recv_window(1).is_ok());
        assert!(validate_recv_window(1_000).is_ok());
        assert!(validate_recv_window(0).is_err());
        assert!(validate_recv_window(1_001).is_err());
    }

    #[test]
    fn eviction_drops_stale_entries() {
        let store = ListingSignalStore::new(60);
        let old = Utc::now() - chrono::Duration::seconds(120);
        let s = new_signal("OLDUSDT".into(), DetectionSource::Calendar, Confidence::High, None, old);
        store.try_record(s);
        store.evict_older_than(Utc::now(), 60);
        assert!(store.is_empty());
    }
}
