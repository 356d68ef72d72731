//! Resilience fabric sitting in front of the exchange HTTP API: rate
//! limiting, circuit breaking, retry, signing, and the rules cache that
//! feeds the order validator.

pub mod circuit_breaker;
pub mod client;
pub mod rate_limiter;
pub mod retry;
pub mod rules_cache;

pub use client::{ExchangeClient, ExchangeCredentials};
pub use rules_cache::RulesCache;
