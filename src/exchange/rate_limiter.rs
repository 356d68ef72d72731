//! Token-bucket rate limiter in front of the exchange client.
//!
//! reservoir 20, refill 20/s, minSpacing 50ms, maxConcurrent 10. Queue is
//! FIFO (a `tokio::sync::Semaphore` is itself FIFO-fair, so it doubles as
//! the concurrency gate and the queue).

use std::sync::atomic::{AtomicI64, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::error::CoreError;

pub struct RateLimiterConfig {
    pub reservoir: u32,
    pub refill_per_sec: u32,
    pub min_spacing: Duration,
    pub max_concurrent: usize,
    pub max_queue: usize,
}

impl Default for RateLimiterConfig {
    fn default() -> Self {
        Self {
            reservoir: 20,
            refill_per_sec: 20,
            min_spacing: Duration::from_millis(50),
            max_concurrent: 10,
            max_queue: 200,
        }
    }
}

/// A real reservoir/refill token bucket layered with a concurrency semaphore.
pub struct RateLimiter {
    config: RateLimiterConfig,
    tokens: AtomicU32,
    last_refill_ms: AtomicI64,
    last_call_ms: AtomicI64,
    concurrency: Arc<Semaphore>,
    queued: Arc<AtomicU32>,
    start: Instant,
}

pub struct Permit<'a> {
    _semaphore_permit: tokio::sync::SemaphorePermit<'a>,
}

impl RateLimiter {
    pub fn new(config: RateLimiterConfig) -> Self {
        let reservoir = config.reservoir;
        Self {
            concurrency: Arc::new(Semaphore::new(config.max_concurrent)),
            queued: Arc::new(AtomicU32::new(0)),
            tokens: AtomicU32::new(reservoir),
            last_refill_ms: AtomicI64::new(0),
            last_call_ms: AtomicI64::new(i64::MIN / 2),
            start: Instant::now(),
            config,
        }
    }

    pub fn queue_depth(&self) -> u32 {
        self.queued.load(Ordering::Relaxed)
    }

    fn elapsed_ms(&self) -> i64 {
        self.start.elapsed().as_millis() as i64
    }

    fn refill(&self) {
        let now = self.elapsed_ms();
        let last = self.last_refill_ms.load(Ordering::Acquire);
        let delta_ms = now - last;
        if delta_ms <= 0 {
            return;
        }
        let new_tokens = (delta_ms as f64 / 1000.0 * self.config.refill_per_sec as f64) as u32;
        if new_tokens > 0 {
            let current = self.tokens.load(Ordering::Acquire);
            let updated = (current + new_tokens).min(self.config.reservoir);
            self.tokens.store(updated, Ordering::Release);
            self.last_refill_ms.store(now, Ordering::Release);
        }
    }

    /// Acquires a slot, honoring reservoir, min-spacing, and max-concurrent.
    /// Returns `RATE_LIMIT_ERROR` (statusCode 429) if the queue is already saturated.
    pub async fn acquire(&self) -> Result<Permit<'_>, CoreError> {
        if self.queued.load(Ordering::Relaxed) as usize >= self.config.max_queue {
            return Err(CoreError::exchange_api(
                "RATE_LIMIT_ERROR",
                "rate limiter queue is full",
                429,
            ));
        }
        self.queued.fetch_add(1, Ordering::Relaxed);

        let permit = self
            .concurrency
            .acquire()
            .await
            .expect("semaphore never closed");
        self.queued.fetch_sub(1, Ordering::Relaxed);

        loop {
            self.refill();
            let now = self.elapsed_ms();
            let since_last = now - self.last_call_ms.load(Ordering::Acquire);
            let spacing_ok = since_last >= self.config.min_spacing.as_millis() as i64;

            let tokens = self.tokens.load(Ordering::Acquire);
            if tokens > 0 && spacing_ok {
                if self
                    .tokens
                    .compare_exchange(tokens, tokens - 1, Ordering::AcqRel, Ordering::Acquire)
                    .is_ok()
                {
                    self.last_call_ms.store(now, Ordering::Release);
                    break;
                }
                continue;
            }

            let wait_ms = if !spacing_ok {
                self.config.min_spacing.as_millis() as i64 - since_last
            } else {
                (1000 / self.config.refill_per_sec.max(1)) as i64
            };
            debug!(wait_ms, "rate limiter throttling request");
            tokio::time::sleep(Duration::from_millis(wait_ms.max(1) as u64)).await;
        }

        Ok(Permit {
            _semaphore_permit: permit,
        })
    }
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::new(RateLimiterConfig::default())
    }
}

/// Logs a warning when the queue depth is high enough to be operationally interesting.
pub fn log_if_backlogged(limiter: &RateLimiter) {
    let depth = limiter.queue_depth();
    if depth > limiter.config.max_concurrent as u32 {
        warn!(depth, "rate limiter queue backlogged");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn acquires_within_reservoir_without_sleeping() {
        let limiter = RateLimiter::new(RateLimiterConfig {
            reservoir: 5,
            refill_per_sec: 5,
            min_spacing: Duration::from_millis(0),
            max_concurrent: 5,
            max_queue: 10,
        });
        let start = Instant::now();
        for _ in 0..5 {
            let _permit = limiter.acquire().await.unwrap();
        }
        assert!(start.elapsed() < Duration::from_millis(200));
    }

    #[tokio::test]
    async fn rejects_when_queue_saturated() {
        let limiter = Arc::new(RateLimiter::new(RateLimiterConfig {
            reservoir: 1,
            refill_per_sec: 1,
            min_spacing: Duration::from_millis(10),
            max_concurrent: 1,
            max_queue: 0,
        }));
        let _permit = limiter.acquire().await.unwrap();
        // queue is zero-capacity and the one concurrency slot is held, so the
        // next logical caller should be rejected rather than hang. We model
        // saturation directly since the semaphore permit above is still live.
        limiter.queued.store(1, Ordering::Relaxed);
        let result = limiter.acquire().await;
        assert!(result.is_err());
    }
}
