//! Circuit breaker protecting the exchange client from cascading failures.
//!
//! CLOSED -> OPEN when the rolling-window error rate crosses the threshold;
//! OPEN -> HALF_OPEN after `reset_timeout`; HALF_OPEN admits a single probe,
//! closing on success or re-opening on failure.

use std::collections::VecDeque;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;
use tracing::{error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Debug, Clone, Copy)]
struct Bucket {
    started_at: Instant,
    successes: u32,
    failures: u32,
}

impl Bucket {
    fn new(now: Instant) -> Self {
        Self {
            started_at: now,
            successes: 0,
            failures: 0,
        }
    }
}

struct Inner {
    state: CircuitState,
    buckets: VecDeque<Bucket>,
    last_state_change: Instant,
    half_open_probe_in_flight: bool,
}

/// Rolling-window / error-rate circuit breaker, per logical endpoint group.
pub struct CircuitBreaker {
    name: String,
    window: Duration,
    bucket_width: Duration,
    bucket_count: usize,
    error_threshold: f64,
    min_requests: u32,
    reset_timeout: Duration,
    inner: Arc<RwLock<Inner>>,
}

#[derive(Debug, thiserror::Error)]
pub enum CircuitBreakerError<E> {
    #[error("circuit breaker [{0}] is open")]
    Open(String),

    #[error(transparent)]
    Inner(E),
}

impl CircuitBreaker {
    /// `window` rolling window (default 60s / 10 buckets per spec), `error_threshold`
    /// a fraction in (0,1] (default 0.5), `reset_timeout` time spent OPEN before a probe.
    pub fn new(
        name: impl Into<String>,
        window: Duration,
        bucket_count: usize,
        error_threshold: f64,
        reset_timeout: Duration,
    ) -> Self {
        let bucket_count = bucket_count.max(1);
        let now = Instant::now();
        Self {
            name: name.into(),
            window,
            bucket_width: window / bucket_count as u32,
            bucket_count,
            error_threshold,
            min_requests: 3,
            reset_timeout,
            inner: Arc::new(RwLock::new(Inner {
                state: CircuitState::Closed,
                buckets: VecDeque::from([Bucket::new(now)]),
                last_state_change: now,
                half_open_probe_in_flight: false,
            })),
        }
    }

    pub fn default_for(name: impl Into<String>) -> Self {
        Self::new(
            name,
            Duration::from_secs(60),
            10,
            0.5,
            Duration::from_secs(30),
        )
    }

    pub async fn state(&self) -> CircuitState {
        self.inner.read().await.state
    }

    /// Wraps a future with circuit-breaker protection.
    pub async fn call<F, T, E>(&self, fut: F) -> Result<T, CircuitBreakerError<E>>
    where
        F: Future<Output = Result<T, E>>,
    {
        {
            let mut guard = self.inner.write().await;
            self.roll_buckets(&mut guard);

            match guard.state {
                CircuitState::Open => {
                    if guard.last_state_change.elapsed() >= self.reset_timeout {
                        info!(breaker = %self.name, "OPEN -> HALF_OPEN (reset timeout elapsed)");
                        guard.state = CircuitState::HalfOpen;
                        guard.last_state_change = Instant::now();
                        guard.half_open_probe_in_flight = true;
                    } else {
                        return Err(CircuitBreakerError::Open(self.name.clone()));
                    }
                }
                CircuitState::HalfOpen => {
                    if guard.half_open_probe_in_flight {
                        return Err(CircuitBreakerError::Open(self.name.clone()));
                    }
                    guard.half_open_probe_in_flight = true;
                }
                CircuitState::Closed => {}
            }
        }

        match fut.await {
            Ok(value) => {
                self.on_success().await;
                Ok(value)
            }
            Err(e) => {
                self.on_failure().await;
                Err(CircuitBreakerError::Inner(e))
            }
        }
    }

    fn roll_buckets(&self, guard: &mut Inner) {
        let now = Instant::now();
        loop {
            let fresh = guard
                .buckets
                .back()
                .map(|b| now.duration_since(b.started_at) < self.bucket_width)
                .unwrap_or(false);
            if fresh {
                break;
            }
            guard.buckets.push_back(Bucket::new(now));
            while guard.buckets.len() > self.bucket_count {
                guard.buckets.pop_front();
            }
        }
        // Drop buckets older than the full window even if count is under the cap.
        while guard
            .buckets
            .front()
            .map(|b| now.duration_since(b.started_at) > self.window)
            .unwrap_or(false)
        {
            guard.buckets.pop_front();
        }
        if guard.buckets.is_empty() {
            guard.buckets.push_back(Bucket::new(now));
        }
    }

    fn window_error_rate(guard: &Inner) -> (u32, f64) {
        let (total, failures) = guard.buckets.iter().fold((0u32, 0u32), |acc, b| {
            (acc.0 + b.successes + b.failures, acc.1 + b.failures)
        });
        if total == 0 {
            (0, 0.0)
        } else {
            (total, failures as f64 / total as f64)
        }
    }

    async fn on_success(&self) {
        let mut guard = self.inner.write().await;
        self.roll_buckets(&mut guard);
        if let Some(b) = guard.buckets.back_mut() {
            b.successes += 1;
        }
        match guard.state {
            CircuitState::HalfOpen => {
                info!(breaker = %self.name, "HALF_OPEN -> CLOSED (probe succeeded)");
                guard.state = CircuitState::Closed;
                guard.last_state_change = Instant::now();
                guard.half_open_probe_in_flight = false;
                guard.buckets.clear();
                guard.buckets.push_back(Bucket::new(Instant::now()));
            }
            CircuitState::Closed => {}
            CircuitState::Open => {
                warn!(breaker = %self.name, "success recorded while OPEN (late completion)");
            }
        }
    }

    async fn on_failure(&self) {
        let mut guard = self.inner.write().await;
        self.roll_buckets(&mut guard);
        if let Some(b) = guard.buckets.back_mut() {
            b.failures += 1;
        }

        match guard.state {
            CircuitState::Closed => {
                let (total, rate) = Self::window_error_rate(&guard);
                if total >= self.min_requests && rate >= self.error_threshold {
                    error!(
                        breaker = %self.name,
                        error_rate = rate,
                        "CLOSED -> OPEN (error threshold breached)"
                    );
                    guard.state = CircuitState::Open;
                    guard.last_state_change = Instant::now();
                }
            }
            CircuitState::HalfOpen => {
                warn!(breaker = %self.name, "HALF_OPEN -> OPEN (probe failed)");
                guard.state = CircuitState::Open;
                guard.last_state_change = Instant::now();
                guard.half_open_probe_in_flight = false;
            }
            CircuitState::Open => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn opens_after_error_threshold_breached() {
        let cb = CircuitBreaker::new(
            "test",
            Duration::from_secs(60),
            10,
            0.5,
            Duration::from_millis(100),
        );

        for _ in 0..3 {
            let result: Result<(), CircuitBreakerError<&str>> =
                cb.call(async { Err::<(), &str>("boom") }).await;
            assert!(result.is_err());
        }

        assert_eq!(cb.state().await, CircuitState::Open);

        let result = cb.call(async { Ok::<(), &str>(()) }).await;
        assert!(matches!(result, Err(CircuitBreakerError::Open(_))));
    }

    #[tokio::test]
    async fn half_open_probe_closes_on_success() {
        let cb = CircuitBreaker::new(
            "test",
            Duration::from_secs(60),
            10,
            0.5,
            Duration::from_millis(50),
        );

        for _ in 0..4 {
            let _ = cb.call(async { Err::<(), &str>("boom") }).await;
        }
        assert_eq!(cb.state().await, CircuitState::Open);

        tokio::time::sleep(Duration::from_millis(80)).await;

        let result = cb.call(async { Ok::<(), &str>(()) }).await;
        assert!(result.is_ok());
        assert_eq!(cb.state().await, CircuitState::Closed);
    }

    #[tokio::test]
    async fn half_open_reopens_on_probe_failure() {
        let cb = CircuitBreaker::new(
            "test",
            Duration::from_secs(60),
            10,
            0.5,
            Duration::from_millis(50),
        );

        for _ in 0..4 {
            let _ = cb.call(async { Err::<(), &str>("boom") }).await;
        }
        tokio::time::sleep(Duration::from_millis(80)).await;

        let result = cb.call(async { Err::<(), &str>("boom") }).await;
        assert!(result.is_err());
        assert_eq!(cb.state().await, CircuitState::Open);
    }
}
