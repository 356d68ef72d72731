// =============================================================================
// Listing Sniper — Main Entry Point
// =============================================================================
//
// The engine starts in Demo + Paused mode for safety. Operators must
// explicitly switch to Live/Running mode via the dashboard or API.
// =============================================================================

// ── Module declarations ──────────────────────────────────────────────────────
mod api;
mod app_state;
mod clock;
mod config;
mod credential_validator;
mod detection;
mod error;
mod events;
mod exchange;
mod execution;
mod metrics;
mod position_tracker;
mod redact;
mod risk;
mod sell_strategy;
mod supervisor;
mod types;
mod validator;

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use tokio::sync::mpsc;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use crate::app_state::AppState;
use crate::clock::SystemClock;
use crate::config::{load_or_default, EngineConfig, TradingConfiguration};
use crate::credential_validator::CredentialValidator;
use crate::detection::orchestrator::DetectionOrchestrator;
use crate::detection::scanners::{CalendarScanner, ExchangeInfoScanner, TickerDiffScanner};
use crate::detection::signal_store::ListingSignalStore;
use crate::events::{BusEvent, EventBus, ListingDetected, ListingMetadata};
use crate::exchange::client::{ExchangeClient, ExchangeCredentials};
use crate::exchange::rules_cache::RulesCache;
use crate::execution::TradeExecutor;
use crate::metrics::Metrics;
use crate::position_tracker::PositionTracker;
use crate::risk::RiskEngine;
use crate::sell_strategy::SellStrategyMonitor;
use crate::supervisor::BotSupervisor;
use crate::types::OrderType;

const CONFIG_PATH: &str = "trading_config.json";
const DETECTION_INTERVAL: Duration = Duration::from_secs(5);

/// Starting capital used to seed the risk engine's percentage-based limits.
/// Real capital accounting is sourced from the exchange account balance at
/// runtime via `getAccountInfo`; this is only the initial basis before the
/// first reconciliation.
const DEFAULT_CAPITAL: f64 = 1_000.0;

fn default_trading_configuration() -> TradingConfiguration {
    TradingConfiguration {
        user_id: "default".to_string(),
        id: uuid::Uuid::new_v4().to_string(),
        enabled_symbols: Vec::new(),
        per_trade_quote: 10.0,
        max_purchase: 50.0,
        daily_spend_limit: 100.0,
        max_trades_per_hour: 10,
        polling_interval_ms: 5_000,
        order_timeout_ms: 10_000,
        price_tolerance_bps: 100,
        safety_enabled: true,
        profit_target_bps: 500,
        stop_loss_bps: 300,
        time_based_exit_minutes: 60,
        trailing_stop_bps: 200,
        sell_strategy: crate::config::SellStrategy::Combined,
        is_active: false,
    }
}

fn main() -> ExitCode {
    let engine_config = match EngineConfig::from_env() {
        Ok(c) => c,
        Err(e) => {
            eprintln!("configuration error: {e}");
            return ExitCode::from(1);
        }
    };

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_new(&engine_config.log_level).unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    if engine_config.exchange_api_key.is_empty() || engine_config.exchange_secret_key.is_empty() {
        error!("EXCHANGE_API_KEY/EXCHANGE_SECRET_KEY are required to start");
        return ExitCode::from(2);
    }

    let runtime = match tokio::runtime::Runtime::new() {
        Ok(rt) => rt,
        Err(e) => {
            eprintln!("failed to start async runtime: {e}");
            return ExitCode::from(3);
        }
    };

    runtime.block_on(async_main(engine_config))
}

async fn async_main(engine_config: EngineConfig) -> ExitCode {
    info!("listing sniper starting in Demo + Paused mode");

    let config_path = PathBuf::from(CONFIG_PATH);
    let trading_config = load_or_default(&config_path, default_trading_configuration());
    let config = Arc::new(RwLock::new(trading_config));

    let clock = Arc::new(SystemClock) as Arc<dyn crate::clock::Clock>;
    let metrics = Arc::new(Metrics::default());
    let bus = Arc::new(EventBus::new());

    let credentials = ExchangeCredentials {
        api_key: engine_config.exchange_api_key.clone(),
        secret_key: engine_config.exchange_secret_key.clone(),
    };
    let client = match ExchangeClient::new(
        engine_config.exchange_base_url.clone(),
        engine_config.calendar_base_url.clone(),
        credentials,
        metrics.clone(),
    ) {
        Ok(c) => Arc::new(c),
        Err(e) => {
            error!(error = %e, "failed to construct exchange client");
            return ExitCode::from(2);
        }
    };

    let rules_cache = Arc::new(RulesCache::default());
    match client.get_exchange_info().await {
        Ok(rules) => rules_cache.replace_all(rules, chrono::Utc::now()),
        Err(e) => warn!(error = %e, "initial exchange-rules fetch failed, validator will fail closed until the next refresh"),
    }

    let risk = Arc::new(RiskEngine::new(DEFAULT_CAPITAL, 0.03, 5, 0.05, 50, 5));
    let tracker = Arc::new(PositionTracker::new());
    let signal_store = Arc::new(ListingSignalStore::default());
    let executor = Arc::new(TradeExecutor::new(
        client.clone(),
        rules_cache.clone(),
        risk.clone(),
        tracker.clone(),
        config.clone(),
        bus.clone(),
        metrics.clone(),
    ));

    let supervisor = BotSupervisor::new(
        metrics.clone(),
        bus.clone(),
        clock.clone(),
        env!("CARGO_PKG_VERSION").to_string(),
    );

    let state = Arc::new(AppState::new(
        clock.clone(),
        engine_config.clone(),
        config.clone(),
        config_path,
        client.clone(),
        rules_cache.clone(),
        risk.clone(),
        tracker.clone(),
        signal_store.clone(),
        executor.clone(),
        bus.clone(),
        metrics.clone(),
        supervisor.clone(),
    ));

    if let Err(e) = supervisor.start() {
        error!(error = %e, "failed to start supervisor");
        return ExitCode::from(3);
    }

    // ── Detection pipeline: scanners -> orchestrator -> trade executor ──────
    let (signal_tx, mut signal_rx) = mpsc::unbounded_channel();
    let orchestrator = DetectionOrchestrator::new(
        CalendarScanner::new(client.clone()),
        TickerDiffScanner::new(client.clone()),
        ExchangeInfoScanner::new(client.clone(), rules_cache.clone()),
        signal_store.clone(),
        DETECTION_INTERVAL,
        signal_tx,
    );
    let orchestrator_handle = tokio::spawn(orchestrator.run(supervisor.shutdown_receiver()));
    supervisor.track(orchestrator_handle).await;

    let dispatch_executor = executor.clone();
    let dispatch_state = state.clone();
    let dispatch_bus = bus.clone();
    let mut dispatch_shutdown = supervisor.shutdown_receiver();
    let dispatch_handle = tokio::spawn(async move {
        loop {
            tokio::select! {
                signal = signal_rx.recv() => {
                    match signal {
                        Some(signal) => {
                            let symbol = signal.symbol.clone();
                            match dispatch_executor.execute_trade(&symbol, Some(&signal), OrderType::Market, 1_000).await {
                                Ok(attempt) => {
                                    dispatch_bus.publish(BusEvent::ListingDetected(ListingDetected {
                                        id: attempt.id.clone(),
                                        symbol: symbol.clone(),
                                        price: attempt.executed_price,
                                        detected_at: signal.detected_at,
                                        metadata: ListingMetadata {
                                            detection_method: signal.source.to_string(),
                                            volume: None,
                                            change_24h: None,
                                        },
                                    }));
                                    dispatch_state.increment_version();
                                }
                                Err(e) => warn!(symbol = %symbol, error = %e, "automatic trade dispatch failed"),
                            };
                        }
                        None => break,
                    }
                }
                _ = dispatch_shutdown.changed() => {
                    if *dispatch_shutdown.borrow() {
                        break;
                    }
                }
            }
        }
    });
    supervisor.track(dispatch_handle).await;

    // ── Sell-strategy monitor ────────────────────────────────────────────────
    let sell_monitor = SellStrategyMonitor::new(
        tracker.clone(),
        client.clone(),
        executor.clone(),
        config.clone(),
        bus.clone(),
        clock.clone(),
    );
    let sell_monitor_handle = tokio::spawn(sell_monitor.run(supervisor.shutdown_receiver()));
    supervisor.track(sell_monitor_handle).await;

    // ── Credential / liveness probe ──────────────────────────────────────────
    let credential_validator = CredentialValidator::new(client.clone(), supervisor.clone(), bus.clone());
    let credential_handle = tokio::spawn(credential_validator.run(supervisor.shutdown_receiver()));
    supervisor.track(credential_handle).await;

    // ── HTTP/WebSocket server ────────────────────────────────────────────────
    let bind_addr = engine_config.bind_addr.clone();
    let router = api::rest::router(state.clone());
    let listener = match tokio::net::TcpListener::bind(&bind_addr).await {
        Ok(l) => l,
        Err(e) => {
            error!(error = %e, addr = %bind_addr, "failed to bind API listener");
            supervisor.stop().await;
            return ExitCode::from(3);
        }
    };
    info!(addr = %bind_addr, "API listening");

    let server_shutdown = supervisor.shutdown_receiver();
    let server_handle = tokio::spawn(async move {
        let mut shutdown = server_shutdown;
        axum::serve(listener, router)
            .with_graceful_shutdown(async move {
                let _ = shutdown.changed().await;
            })
            .await
            .ok();
    });
    supervisor.track(server_handle).await;

    match tokio::signal::ctrl_c().await {
        Ok(()) => info!("SIGINT received, shutting down"),
        Err(e) => error!(error = %e, "failed to listen for SIGINT"),
    }

    supervisor.stop().await;
    info!("listing sniper stopped cleanly");
    ExitCode::from(130)
}
