//! Lock-free counters/gauges plus simple bucketed latency histograms.
//!
//! No external metrics crate: the scrape endpoint is out of scope, but the
//! in-process registry itself is ambient and stays.

use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};

const LATENCY_BUCKETS_MS: [u64; 7] = [10, 25, 50, 100, 250, 500, 1_000];

struct Histogram {
    buckets: [AtomicU64; LATENCY_BUCKETS_MS.len() + 1],
    sum_ms: AtomicU64,
    count: AtomicU64,
}

impl Default for Histogram {
    fn default() -> Self {
        Self {
            buckets: std::array::from_fn(|_| AtomicU64::new(0)),
            sum_ms: AtomicU64::new(0),
            count: AtomicU64::new(0),
        }
    }
}

impl Histogram {
    fn observe(&self, value_ms: u64) {
        let idx = LATENCY_BUCKETS_MS
            .iter()
            .position(|b| value_ms <= *b)
            .unwrap_or(LATENCY_BUCKETS_MS.len());
        self.buckets[idx].fetch_add(1, Ordering::Relaxed);
        self.sum_ms.fetch_add(value_ms, Ordering::Relaxed);
        self.count.fetch_add(1, Ordering::Relaxed);
    }

    fn mean_ms(&self) -> f64 {
        let count = self.count.load(Ordering::Relaxed);
        if count == 0 {
            0.0
        } else {
            self.sum_ms.load(Ordering::Relaxed) as f64 / count as f64
        }
    }
}

pub struct Metrics {
    counters: RwLock<HashMap<&'static str, AtomicU64>>,
    gauges: RwLock<HashMap<&'static str, AtomicI64>>,
    exchange_call_latency: RwLock<HashMap<&'static str, Histogram>>,
}

impl Default for Metrics {
    fn default() -> Self {
        Self {
            counters: RwLock::new(HashMap::new()),
            gauges: RwLock::new(HashMap::new()),
            exchange_call_latency: RwLock::new(HashMap::new()),
        }
    }
}

impl Metrics {
    pub fn increment_counter(&self, name: &'static str) {
        self.add_counter(name, 1);
    }

    pub fn add_counter(&self, name: &'static str, delta: u64) {
        {
            let read = self.counters.read();
            if let Some(c) = read.get(name) {
                c.fetch_add(delta, Ordering::Relaxed);
                return;
            }
        }
        let mut write = self.counters.write();
        write
            .entry(name)
            .or_insert_with(|| AtomicU64::new(0))
            .fetch_add(delta, Ordering::Relaxed);
    }

    pub fn counter(&self, name: &str) -> u64 {
        self.counters
            .read()
            .get(name)
            .map(|c| c.load(Ordering::Relaxed))
            .unwrap_or(0)
    }

    pub fn set_gauge(&self, name: &'static str, value: i64) {
        {
            let read = self.gauges.read();
            if let Some(g) = read.get(name) {
                g.store(value, Ordering::Relaxed);
                return;
            }
        }
        let mut write = self.gauges.write();
        write
            .entry(name)
            .or_insert_with(|| AtomicI64::new(0))
            .store(value, Ordering::Relaxed);
    }

    pub fn gauge(&self, name: &str) -> i64 {
        self.gauges
            .read()
            .get(name)
            .map(|g| g.load(Ordering::Relaxed))
            .unwrap_or(0)
    }

    pub fn observe_exchange_call(&self, endpoint: &'static str, elapsed_ms: u64) {
        {
            let read = self.exchange_call_latency.read();
            if let Some(h) = read.get(endpoint) {
                h.observe(elapsed_ms);
                return;
            }
        }
        let mut write = self.exchange_call_latency.write();
        write
            .entry(endpoint)
            .or_insert_with(Histogram::default)
            .observe(elapsed_ms);
    }

    pub fn mean_exchange_latency_ms(&self, endpoint: &str) -> f64 {
        self.exchange_call_latency
            .read()
            .get(endpoint)
            .map(|h| h.mean_ms())
            .unwrap_or(0.0)
    }

    /// Fraction of completed trade attempts that succeeded, from the
    /// `trades_total_success` / `trades_total_failed` counters. `1.0` when
    /// nothing has completed yet — there is no evidence of failure.
    pub fn trade_success_rate(&self) -> f64 {
        let success = self.counter("trades_total_success") as f64;
        let failed = self.counter("trades_total_failed") as f64;
        let total = success + failed;
        if total == 0.0 {
            1.0
        } else {
            success / total
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_accumulate() {
        let m = Metrics::default();
        m.increment_counter("trades_total");
        m.increment_counter("trades_total");
        m.add_counter("trades_total", 3);
        assert_eq!(m.counter("trades_total"), 5);
    }

    #[test]
    fn gauges_overwrite() {
        let m = Metrics::default();
        m.set_gauge("queue_depth", 3);
        m.set_gauge("queue_depth", 7);
        assert_eq!(m.gauge("queue_depth"), 7);
    }

    #[test]
    fn histogram_tracks_mean() {
        let m = Metrics::default();
        m.observe_exchange_call("placeOrder", 10);
        m.observe_exchange_call("placeOrder", 30);
        assert_eq!(m.mean_exchange_latency_ms("placeOrder"), 20.0);
    }

    #[test]
    fn trade_success_rate_defaults_to_one_with_no_trades() {
        let m = Metrics::default();
        assert_eq!(m.trade_success_rate(), 1.0);
    }

    #[test]
    fn trade_success_rate_reflects_counters() {
        let m = Metrics::default();
        m.increment_counter("trades_total_success");
        m.increment_counter("trades_total_success");
        m.increment_counter("trades_total_success");
        m.increment_counter("trades_total_failed");
        assert_eq!(m.trade_success_rate(), 0.75);
    }
}
