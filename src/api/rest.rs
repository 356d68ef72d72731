// =============================================================================
// REST API Endpoints — Axum 0.7
// =============================================================================
//
// All endpoints live under `/api/v1/`. Public endpoints (health) require no
// authentication. All other endpoints require a valid Bearer token checked via
// the `AuthBearer` extractor.
//
// CORS honors `EngineConfig.cors_enabled`/`allowed_origins`; it is not wide
// open by default like a dev-mode scaffold.
// =============================================================================

use std::sync::Arc;

use axum::{
    extract::{Json, State},
    http::{HeaderValue, StatusCode},
    response::IntoResponse,
    routing::{get, post},
    Router,
};
use serde::{Deserialize, Serialize};
use tower_http::cors::{Any, CorsLayer};
use tracing::{info, warn};

use crate::api::auth::AuthBearer;
use crate::app_state::AppState;
use crate::types::{AccountMode, OrderType, SellReason, TradingMode};

// =============================================================================
// Router construction
// =============================================================================

/// Build the full REST API router with CORS middleware and shared state.
pub fn router(state: Arc<AppState>) -> Router {
    let cors = build_cors(&state);

    Router::new()
        // ── Public ──────────────────────────────────────────────────
        .route("/api/v1/health", get(health))
        // ── Authenticated, read ─────────────────────────────────────
        .route("/api/v1/state", get(full_state))
        .route("/api/v1/positions", get(positions))
        .route("/api/v1/listings", get(listings))
        .route("/api/v1/bot-status", get(bot_status))
        .route("/api/v1/trade-journal", get(trade_journal))
        .route("/api/v1/trade-journal/stats", get(trade_journal_stats))
        .route("/api/v1/config", get(get_config))
        // ── Authenticated, write ─────────────────────────────────────
        .route("/api/v1/config", post(set_config))
        .route("/api/v1/control/pause", post(control_pause))
        .route("/api/v1/control/resume", post(control_resume))
        .route("/api/v1/control/kill", post(control_kill))
        .route("/api/v1/control/account-mode", post(control_account_mode))
        .route("/api/v1/trade/execute", post(trade_execute))
        .route("/api/v1/trade/sell", post(trade_sell))
        // ── WebSocket (handled separately in ws module but mounted here) ─
        .route("/api/v1/ws", get(crate::api::ws::ws_handler))
        .route("/api/v1/ws/:channel", get(crate::api::ws::ws_channel_handler))
        // ── Middleware & State ───────────────────────────────────────
        .layer(cors)
        .with_state(state)
}

fn build_cors(state: &Arc<AppState>) -> CorsLayer {
    if !state.engine_config.cors_enabled {
        return CorsLayer::new();
    }
    if state.engine_config.allowed_origins.is_empty() {
        return CorsLayer::new()
            .allow_origin(Any)
            .allow_methods(Any)
            .allow_headers(Any);
    }
    let origins: Vec<HeaderValue> = state
        .engine_config
        .allowed_origins
        .iter()
        .filter_map(|o| o.parse().ok())
        .collect();
    CorsLayer::new()
        .allow_origin(origins)
        .allow_methods(Any)
        .allow_headers(Any)
}

// =============================================================================
// Health (public)
// =============================================================================

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    state_version: u64,
    server_time: i64,
}

async fn health(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let resp = HealthResponse {
        status: "ok",
        state_version: state.current_state_version(),
        server_time: chrono::Utc::now().timestamp_millis(),
    };
    Json(resp)
}

// =============================================================================
// Full state snapshot (authenticated)
// =============================================================================

async fn full_state(_auth: AuthBearer, State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(state.build_snapshot())
}

// =============================================================================
// Positions (authenticated)
// =============================================================================

async fn positions(_auth: AuthBearer, State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(state.tracker.list())
}

// =============================================================================
// Listings (authenticated)
// =============================================================================

async fn listings(_auth: AuthBearer, State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(state.signal_store.list())
}

// =============================================================================
// Bot status (authenticated)
// =============================================================================

async fn bot_status(_auth: AuthBearer, State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(state.supervisor.status())
}

// =============================================================================
// Trade Journal (authenticated)
// =============================================================================

async fn trade_journal(_auth: AuthBearer, State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(state.trade_journal())
}

async fn trade_journal_stats(
    _auth: AuthBearer,
    State(state): State<Arc<AppState>>,
) -> impl IntoResponse {
    let journal = state.trade_journal();
    let risk = state.risk.get_state();
    let win_rate = if risk.daily_trades_count > 0 {
        risk.daily_wins as f64 / risk.daily_trades_count as f64
    } else {
        0.0
    };
    Json(serde_json::json!({
        "total_attempts": journal.len(),
        "daily_trades_count": risk.daily_trades_count,
        "daily_wins": risk.daily_wins,
        "daily_losses": risk.daily_losses,
        "win_rate": win_rate,
        "daily_pnl": risk.daily_pnl,
        "daily_pnl_pct": risk.daily_pnl_pct,
        "max_drawdown_today": risk.max_drawdown_today,
    }))
}

// =============================================================================
// Configuration (authenticated)
// =============================================================================

async fn get_config(_auth: AuthBearer, State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(state.config.read().clone())
}

async fn set_config(
    _auth: AuthBearer,
    State(state): State<Arc<AppState>>,
    Json(new_config): Json<crate::config::TradingConfiguration>,
) -> Result<impl IntoResponse, (StatusCode, Json<serde_json::Value>)> {
    match state.update_config(new_config) {
        Ok(()) => {
            info!("Trading configuration updated via API");
            Ok(Json(state.config.read().clone()))
        }
        Err(e) => {
            warn!(error = %e, "Rejected invalid trading configuration");
            Err((
                StatusCode::BAD_REQUEST,
                Json(serde_json::json!({ "error": e })),
            ))
        }
    }
}

// =============================================================================
// Control endpoints (authenticated)
// =============================================================================

#[derive(Serialize)]
struct ControlResponse {
    trading_mode: String,
    message: String,
}

async fn control_pause(_auth: AuthBearer, State(state): State<Arc<AppState>>) -> impl IntoResponse {
    state.set_trading_mode(TradingMode::Paused);
    info!("Trading PAUSED via API");
    Json(ControlResponse {
        trading_mode: TradingMode::Paused.to_string(),
        message: "Trading paused".to_string(),
    })
}

async fn control_resume(_auth: AuthBearer, State(state): State<Arc<AppState>>) -> impl IntoResponse {
    state.set_trading_mode(TradingMode::Live);
    info!("Trading RESUMED via API");
    Json(ControlResponse {
        trading_mode: TradingMode::Live.to_string(),
        message: "Trading resumed".to_string(),
    })
}

async fn control_kill(_auth: AuthBearer, State(state): State<Arc<AppState>>) -> impl IntoResponse {
    state.set_trading_mode(TradingMode::Killed);
    warn!("Trading KILLED via API");
    Json(ControlResponse {
        trading_mode: TradingMode::Killed.to_string(),
        message: "Trading killed — manual restart required".to_string(),
    })
}

#[derive(Deserialize)]
struct AccountModeRequest {
    account_mode: String,
    #[serde(default)]
    confirm_live: bool,
}

#[derive(Serialize)]
struct AccountModeResponse {
    account_mode: String,
}

async fn control_account_mode(
    _auth: AuthBearer,
    State(state): State<Arc<AppState>>,
    Json(req): Json<AccountModeRequest>,
) -> Result<impl IntoResponse, (StatusCode, Json<serde_json::Value>)> {
    let mode = match req.account_mode.to_lowercase().as_str() {
        "demo" => AccountMode::Demo,
        "live" => {
            if !req.confirm_live {
                return Err((
                    StatusCode::BAD_REQUEST,
                    Json(serde_json::json!({
                        "error": "Switching to Live mode requires confirm_live: true",
                    })),
                ));
            }
            warn!("Switching to LIVE account mode via API");
            AccountMode::Live
        }
        _ => {
            return Err((
                StatusCode::BAD_REQUEST,
                Json(serde_json::json!({
                    "error": format!("Invalid account mode: '{}'. Use 'demo' or 'live'.", req.account_mode),
                })),
            ));
        }
    };

    state.set_account_mode(mode);
    info!(account_mode = %mode, "Account mode changed via API");

    Ok(Json(AccountModeResponse {
        account_mode: mode.to_string(),
    }))
}

// =============================================================================
// Manual trade endpoints (authenticated)
// =============================================================================

#[derive(Deserialize)]
struct TradeExecuteRequest {
    symbol: String,
    #[serde(default)]
    order_type: Option<OrderType>,
    #[serde(default = "default_recv_window_ms")]
    recv_window_ms: u32,
}

fn default_recv_window_ms() -> u32 {
    1_000
}

async fn trade_execute(
    _auth: AuthBearer,
    State(state): State<Arc<AppState>>,
    Json(req): Json<TradeExecuteRequest>,
) -> Result<impl IntoResponse, (StatusCode, Json<serde_json::Value>)> {
    let order_type = req.order_type.unwrap_or(OrderType::Market);
    match state
        .executor
        .execute_trade(&req.symbol, None, order_type, req.recv_window_ms)
        .await
    {
        Ok(attempt) => {
            state.increment_version();
            Ok(Json(attempt))
        }
        Err(e) => {
            warn!(symbol = %req.symbol, error = %e, "manual trade execution failed");
            Err((
                StatusCode::UNPROCESSABLE_ENTITY,
                Json(serde_json::json!({ "error": e.to_string() })),
            ))
        }
    }
}

#[derive(Deserialize)]
struct TradeSellRequest {
    symbol: String,
    #[serde(default)]
    quantity: Option<f64>,
}

async fn trade_sell(
    _auth: AuthBearer,
    State(state): State<Arc<AppState>>,
    Json(req): Json<TradeSellRequest>,
) -> Result<impl IntoResponse, (StatusCode, Json<serde_json::Value>)> {
    match state
        .executor
        .execute_sell_trade(&req.symbol, req.quantity, SellReason::Manual)
        .await
    {
        Ok(attempt) => {
            state.increment_version();
            Ok(Json(attempt))
        }
        Err(e) => {
            warn!(symbol = %req.symbol, error = %e, "manual sell execution failed");
            Err((
                StatusCode::UNPROCESSABLE_ENTITY,
                Json(serde_json::json!({ "error": e.to_string() })),
            ))
        }
    }
}
