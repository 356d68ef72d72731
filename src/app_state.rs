// =============================================================================
// Central Application State — Listing Sniper
// =============================================================================
//
// The single source of truth for the engine. Every subsystem is constructed
// independently (composition root pattern) and handed to `AppState::new` as
// an already-wired `Arc`; `AppState` itself owns none of their internals,
// only the version counter and WebSocket bookkeeping needed to serve the
// dashboard API and push feed.
//
// Thread safety:
//   - Atomic counters for lock-free version tracking.
//   - parking_lot::RwLock for the mutable configuration and trading-mode
//     fields this struct owns directly.
//   - Arc wrappers for subsystem engines that manage their own interior
//     mutability.
// =============================================================================

use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::Utc;
use parking_lot::RwLock;
use serde::Serialize;

use crate::clock::Clock;
use crate::config::{EngineConfig, TradingConfiguration};
use crate::detection::signal_store::ListingSignalStore;
use crate::events::EventBus;
use crate::exchange::client::ExchangeClient;
use crate::exchange::rules_cache::RulesCache;
use crate::execution::TradeExecutor;
use crate::metrics::Metrics;
use crate::position_tracker::PositionTracker;
use crate::risk::{RiskEngine, RiskState};
use crate::supervisor::BotSupervisor;
use crate::types::{AccountMode, BotStatus, Position, TradeAttempt, TradingMode};

/// Central application state shared across all async tasks via `Arc<AppState>`.
pub struct AppState {
    pub clock: Arc<dyn Clock>,
    pub engine_config: EngineConfig,

    // ── Configuration ───────────────────────────────────────────────────
    pub config: Arc<RwLock<TradingConfiguration>>,
    config_path: PathBuf,

    // ── Exchange / detection / execution ────────────────────────────────
    pub client: Arc<ExchangeClient>,
    pub rules_cache: Arc<RulesCache>,
    pub risk: Arc<RiskEngine>,
    pub tracker: Arc<PositionTracker>,
    pub signal_store: Arc<ListingSignalStore>,
    pub executor: Arc<TradeExecutor>,

    // ── Event bus / metrics / lifecycle ─────────────────────────────────
    pub bus: Arc<EventBus>,
    pub metrics: Arc<Metrics>,
    pub supervisor: Arc<BotSupervisor>,

    // ── Version tracking ────────────────────────────────────────────────
    /// Monotonically increasing version counter. Incremented on every
    /// meaningful state mutation. The WebSocket feed uses this to detect
    /// changes and push updates.
    state_version: AtomicU64,
    /// WebSocket message sequence number (incremented per message sent).
    pub ws_sequence_number: AtomicU64,

    // ── Trading mode ─────────────────────────────────────────────────────
    trading_mode: RwLock<TradingMode>,

    // ── Operational status ──────────────────────────────────────────────
    pub ws_user_connected: RwLock<bool>,
    pub last_ws_user_event: RwLock<std::time::Instant>,
}

impl AppState {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        clock: Arc<dyn Clock>,
        engine_config: EngineConfig,
        config: Arc<RwLock<TradingConfiguration>>,
        config_path: PathBuf,
        client: Arc<ExchangeClient>,
        rules_cache: Arc<RulesCache>,
        risk: Arc<RiskEngine>,
        tracker: Arc<PositionTracker>,
        signal_store: Arc<ListingSignalStore>,
        executor: Arc<TradeExecutor>,
        bus: Arc<EventBus>,
        metrics: Arc<Metrics>,
        supervisor: Arc<BotSupervisor>,
    ) -> Self {
        Self {
            clock,
            engine_config,
            config,
            config_path,
            client,
            rules_cache,
            risk,
            tracker,
            signal_store,
            executor,
            bus,
            metrics,
            supervisor,
            state_version: AtomicU64::new(1),
            ws_sequence_number: AtomicU64::new(0),
            trading_mode: RwLock::new(TradingMode::default()),
            ws_user_connected: RwLock::new(false),
            last_ws_user_event: RwLock::new(std::time::Instant::now()),
        }
    }

    // ── Version Management ──────────────────────────────────────────────

    /// Atomically increment the state version. Call this after every
    /// meaningful mutation to signal WebSocket clients that fresh data is
    /// available.
    pub fn increment_version(&self) -> u64 {
        self.state_version.fetch_add(1, Ordering::SeqCst)
    }

    /// Read the current state version without modifying it.
    pub fn current_state_version(&self) -> u64 {
        self.state_version.load(Ordering::SeqCst)
    }

    // ── Trading mode ─────────────────────────────────────────────────────

    pub fn trading_mode(&self) -> TradingMode {
        *self.trading_mode.read()
    }

    /// Applies a trading-mode transition. `TradingConfiguration.is_active`
    /// (the flag `TradeExecutor` actually gates entries on) is kept in
    /// lockstep with the mode; `Killed` additionally trips the risk
    /// engine's kill switch so it survives even if the mode is later
    /// misreported.
    pub fn set_trading_mode(&self, mode: TradingMode) {
        *self.trading_mode.write() = mode;
        self.config.write().is_active = matches!(mode, TradingMode::Live);
        if matches!(mode, TradingMode::Killed) {
            self.risk.kill();
        }
        self.increment_version();
    }

    pub fn account_mode(&self) -> AccountMode {
        self.executor.account_mode()
    }

    pub fn set_account_mode(&self, mode: AccountMode) {
        self.executor.set_account_mode(mode);
        self.increment_version();
    }

    // ── Configuration ───────────────────────────────────────────────────

    /// Validates, installs, and persists a new trading configuration.
    /// Rejected (and left untouched) if validation fails.
    pub fn update_config(&self, new_config: TradingConfiguration) -> Result<(), String> {
        new_config.validate()?;
        *self.config.write() = new_config;
        self.increment_version();
        self.save_config().map_err(|e| e.to_string())
    }

    fn save_config(&self) -> anyhow::Result<()> {
        let cfg = self.config.read().clone();
        crate::config::save_atomic(&self.config_path, &cfg)
    }

    // ── Trade journal ───────────────────────────────────────────────────

    pub fn trade_journal(&self) -> Vec<TradeAttempt> {
        self.executor.trade_journal()
    }

    // ── Snapshot Builder ────────────────────────────────────────────────

    /// Build a complete, serialisable snapshot of the entire engine state.
    ///
    /// This is the payload sent to the dashboard via the REST
    /// `GET /api/v1/state` endpoint and the initial WebSocket push on
    /// connect.
    pub fn build_snapshot(&self) -> StateSnapshot {
        StateSnapshot {
            state_version: self.current_state_version(),
            server_time: Utc::now().timestamp_millis(),
            bot_status: self.supervisor.status(),
            trading_mode: self.trading_mode(),
            account_mode: self.account_mode(),
            risk: self.risk.get_state(),
            config: self.config.read().clone(),
            positions: self.tracker.list(),
        }
    }
}

// =============================================================================
// Serialisable snapshot type
// =============================================================================

/// Full engine state snapshot sent to the dashboard.
#[derive(Debug, Clone, Serialize)]
pub struct StateSnapshot {
    pub state_version: u64,
    pub server_time: i64,
    pub bot_status: BotStatus,
    pub trading_mode: TradingMode,
    pub account_mode: AccountMode,
    pub risk: RiskState,
    pub config: TradingConfiguration,
    pub positions: Vec<Position>,
}
