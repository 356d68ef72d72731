//! Typed error kinds shared across the core, each carrying a stable code and timestamp.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fmt;

#[derive(Debug, Clone, Serialize)]
pub struct ErrorEnvelope {
    pub code: String,
    pub message: String,
    pub timestamp: DateTime<Utc>,
}

impl ErrorEnvelope {
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
            timestamp: Utc::now(),
        }
    }
}

impl fmt::Display for ErrorEnvelope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.code, self.message)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum CoreError {
    #[error("trading error: {0}")]
    Trading(ErrorEnvelope),

    #[error("exchange api error ({status_code}): {0}", status_code = .1)]
    ExchangeApi(ErrorEnvelope, u16),

    #[error("database error: {0}")]
    Database(ErrorEnvelope),

    #[error("configuration error: {0}")]
    Configuration(ErrorEnvelope),

    #[error("security error: {0}")]
    Security(ErrorEnvelope),

    #[error("monitoring error: {0}")]
    Monitoring(ErrorEnvelope),
}

impl CoreError {
    pub fn code(&self) -> &str {
        match self {
            CoreError::Trading(e)
            | CoreError::ExchangeApi(e, _)
            | CoreError::Database(e)
            | CoreError::Configuration(e)
            | CoreError::Security(e)
            | CoreError::Monitoring(e) => &e.code,
        }
    }

    pub fn trading(code: &str, message: impl Into<String>) -> Self {
        CoreError::Trading(ErrorEnvelope::new(code, message))
    }

    pub fn exchange_api(code: &str, message: impl Into<String>, status_code: u16) -> Self {
        CoreError::ExchangeApi(ErrorEnvelope::new(code, message), status_code)
    }

    pub fn database(code: &str, message: impl Into<String>) -> Self {
        CoreError::Database(ErrorEnvelope::new(code, message))
    }

    pub fn configuration(code: &str, message: impl Into<String>) -> Self {
        CoreError::Configuration(ErrorEnvelope::new(code, message))
    }

    pub fn security(code: &str, message: impl Into<String>) -> Self {
        CoreError::Security(ErrorEnvelope::new(code, message))
    }

    pub fn monitoring(code: &str, message: impl Into<String>) -> Self {
        CoreError::Monitoring(ErrorEnvelope::new(code, message))
    }

    /// Retryable per §4.7: network errors, HTTP 429/5xx, and an explicit allow-list.
    pub fn is_retryable(&self, allow_list: &[u16]) -> bool {
        match self {
            CoreError::ExchangeApi(_, status) => {
                *status == 429 || (500..600).contains(status) || allow_list.contains(status)
            }
            CoreError::Trading(e) => e.code == "NETWORK_ERROR",
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retryable_classification() {
        let e = CoreError::exchange_api("UPSTREAM", "bad gateway", 502);
        assert!(e.is_retryable(&[]));
        let e = CoreError::exchange_api("BAD_REQUEST", "bad params", 400);
        assert!(!e.is_retryable(&[]));
        let e = CoreError::exchange_api("TEAPOT", "custom", 418);
        assert!(e.is_retryable(&[418]));
    }
}
