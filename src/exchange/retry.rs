//! Exponential backoff with multiplicative jitter, hand-rolled because the
//! exact policy (base 1000ms, multiplier 2, cap 30s, jitter +/-50%, retryable
//! classification with a code allow-list) needs tighter control than a
//! generic retry-middleware policy exposes.

use rand::Rng;
use std::future::Future;
use std::time::Duration;
use tracing::warn;

use crate::error::CoreError;

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub base: Duration,
    pub multiplier: f64,
    pub max: Duration,
    pub jitter_fraction: f64,
    pub retryable_status_allow_list: Vec<u16>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base: Duration::from_millis(1_000),
            multiplier: 2.0,
            max: Duration::from_secs(30),
            jitter_fraction: 0.5,
            retryable_status_allow_list: Vec::new(),
        }
    }
}

impl RetryPolicy {
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let raw_ms = self.base.as_millis() as f64 * self.multiplier.powi(attempt as i32);
        let capped_ms = raw_ms.min(self.max.as_millis() as f64);
        let mut rng = rand::thread_rng();
        let jitter = rng.gen_range(-self.jitter_fraction..=self.jitter_fraction);
        let jittered_ms = (capped_ms * (1.0 + jitter)).max(0.0);
        Duration::from_millis(jittered_ms as u64)
    }
}

/// Runs `op` under the retry policy. `op` is invoked fresh on every attempt
/// since HTTP requests aren't cloneable futures.
pub async fn with_retry<F, Fut, T>(policy: &RetryPolicy, mut op: F) -> Result<T, CoreError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, CoreError>>,
{
    let mut attempt = 0;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(err) => {
                let retryable = err.is_retryable(&policy.retryable_status_allow_list);
                if !retryable || attempt >= policy.max_retries {
                    return Err(err);
                }
                let delay = policy.delay_for_attempt(attempt);
                warn!(
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    code = err.code(),
                    "retrying after transient error"
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn delay_grows_and_is_capped() {
        let policy = RetryPolicy {
            jitter_fraction: 0.0,
            ..RetryPolicy::default()
        };
        assert_eq!(policy.delay_for_attempt(0), Duration::from_millis(1_000));
        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(2_000));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(4_000));
        assert_eq!(policy.delay_for_attempt(10), policy.max);
    }

    #[tokio::test]
    async fn retries_transient_errors_until_success() {
        let policy = RetryPolicy {
            base: Duration::from_millis(1),
            max: Duration::from_millis(5),
            ..RetryPolicy::default()
        };
        let attempts = AtomicU32::new(0);
        let result: Result<&str, CoreError> = with_retry(&policy, || {
            let n = attempts.fetch_add(1, Ordering::SeqCst);
            async move {
                if n < 2 {
                    Err(CoreError::exchange_api("UPSTREAM", "bad gateway", 502))
                } else {
                    Ok("ok")
                }
            }
        })
        .await;
        assert_eq!(result.unwrap(), "ok");
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn non_retryable_errors_terminate_immediately() {
        let policy = RetryPolicy::default();
        let attempts = AtomicU32::new(0);
        let result: Result<&str, CoreError> = with_retry(&policy, || {
            attempts.fetch_add(1, Ordering::SeqCst);
            async { Err(CoreError::exchange_api("BAD_REQUEST", "invalid", 400)) }
        })
        .await;
        assert!(result.is_err());
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
    }
}
