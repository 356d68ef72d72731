// =============================================================================
// WebSocket Handler — Event Bus Fan-Out
// =============================================================================
//
// Single logical endpoint with sub-path routing: `/`, `/bot`, `/alerts`,
// `/performance`. Every sub-path shares the same upgrade handshake and token
// check; the sub-path only narrows which `BusEvent` variants are forwarded.
//
// On connect each client receives an immediate full `StateSnapshot` so it can
// render before the first bus event arrives, then a live feed of envelopes
// from the shared `EventBus`. The server does not poll for state changes —
// it reacts to published events, matching the bus's own ordering guarantees.
//
// Reconnect/backoff and the polling fallback are client-side behaviors; the
// server's obligation is to close cleanly with code 1000 on supervisor
// shutdown and to never block publish on a slow subscriber (a lagging
// client sees a gap and resyncs via a fresh snapshot, not a disconnect).
// =============================================================================

use std::sync::Arc;

use axum::{
    extract::{
        ws::{CloseFrame, Message, WebSocket},
        Path, Query, State, WebSocketUpgrade,
    },
    response::IntoResponse,
};
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use tracing::{debug, info, warn};

use crate::api::auth::validate_token;
use crate::app_state::AppState;
use crate::events::BusEvent;

// =============================================================================
// Query parameters
// =============================================================================

#[derive(Deserialize)]
pub struct WsQuery {
    token: Option<String>,
}

/// Which sub-path a connection was opened on, and therefore which published
/// events it should receive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Channel {
    All,
    Bot,
    Alerts,
    Performance,
}

impl Channel {
    fn from_path(path: &str) -> Self {
        match path {
            "bot" => Channel::Bot,
            "alerts" => Channel::Alerts,
            "performance" => Channel::Performance,
            _ => Channel::All,
        }
    }

    fn accepts(self, event: &BusEvent) -> bool {
        match self {
            Channel::All => true,
            Channel::Bot => matches!(event, BusEvent::BotStatus(_)),
            Channel::Alerts => matches!(event, BusEvent::SystemAlert(_)),
            Channel::Performance => matches!(event, BusEvent::PerformanceMetric(_)),
        }
    }
}

// =============================================================================
// WebSocket upgrade handlers
// =============================================================================

/// Root endpoint (`/api/v1/ws`) — receives every published event.
pub async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
    Query(query): Query<WsQuery>,
) -> impl IntoResponse {
    upgrade(ws, state, query, Channel::All)
}

/// Sub-path endpoint (`/api/v1/ws/:channel`) — filters to `bot`, `alerts`,
/// or `performance`. Unrecognized sub-paths behave like the root endpoint.
pub async fn ws_channel_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
    Path(channel): Path<String>,
    Query(query): Query<WsQuery>,
) -> impl IntoResponse {
    upgrade(ws, state, query, Channel::from_path(&channel))
}

fn upgrade(
    ws: WebSocketUpgrade,
    state: Arc<AppState>,
    query: WsQuery,
    channel: Channel,
) -> axum::response::Response {
    let token = query.token.unwrap_or_default();
    if !validate_token(&token) {
        warn!("WebSocket connection rejected: invalid token");
        return (
            axum::http::StatusCode::FORBIDDEN,
            "Invalid or missing token",
        )
            .into_response();
    }

    info!(?channel, "WebSocket connection accepted — upgrading");
    ws.on_upgrade(move |socket| handle_ws_connection(socket, state, channel))
        .into_response()
}

// =============================================================================
// Connection handler
// =============================================================================

/// Manages a single WebSocket connection for its lifetime.
///
/// Runs three concurrent arms via `tokio::select!`:
///   1. **Shutdown** — close with code 1000 when the supervisor stops.
///   2. **Fan-out** — forward bus events matching `channel` as they arrive.
///   3. **Recv loop** — process incoming client frames (ping/pong, close,
///      heartbeat text messages).
async fn handle_ws_connection(socket: WebSocket, state: Arc<AppState>, channel: Channel) {
    {
        *state.ws_user_connected.write() = true;
        *state.last_ws_user_event.write() = std::time::Instant::now();
    }
    state.increment_version();

    let (mut sender, mut receiver) = socket.split();
    let mut events = state.bus.subscribe();

    if let Err(e) = send_json(&mut sender, &state, &state.build_snapshot()).await {
        warn!(error = %e, "failed to send initial WebSocket snapshot");
        cleanup(&state);
        return;
    }

    let mut shutdown = state.supervisor.shutdown_receiver();

    loop {
        tokio::select! {
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    info!("supervisor stopping — closing WebSocket with code 1000");
                    let _ = tokio::time::timeout(
                        std::time::Duration::from_secs(2),
                        sender.send(Message::Close(Some(CloseFrame {
                            code: 1000,
                            reason: "server shutting down".into(),
                        }))),
                    ).await;
                    break;
                }
            }

            event = events.recv() => {
                match event {
                    Ok(envelope) => {
                        if channel.accepts(&envelope.event) {
                            if let Err(e) = send_json(&mut sender, &state, &envelope).await {
                                debug!(error = %e, "WebSocket send failed — disconnecting");
                                break;
                            }
                        }
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(skipped, "WebSocket subscriber lagged — resyncing with a fresh snapshot");
                        if send_json(&mut sender, &state, &state.build_snapshot()).await.is_err() {
                            break;
                        }
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => {
                        info!("event bus closed — disconnecting");
                        break;
                    }
                }
            }

            msg = receiver.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        debug!(msg = %text, "WebSocket text message received (heartbeat)");
                        *state.last_ws_user_event.write() = std::time::Instant::now();
                    }
                    Some(Ok(Message::Ping(data))) => {
                        if let Err(e) = sender.send(Message::Pong(data)).await {
                            debug!(error = %e, "failed to send Pong — disconnecting");
                            break;
                        }
                    }
                    Some(Ok(Message::Pong(_))) => {}
                    Some(Ok(Message::Close(_))) => {
                        info!("WebSocket Close frame received — disconnecting");
                        break;
                    }
                    Some(Ok(Message::Binary(_))) => {}
                    Some(Err(e)) => {
                        warn!(error = %e, "WebSocket receive error — disconnecting");
                        break;
                    }
                    None => break,
                }
            }
        }
    }

    cleanup(&state);
}

// =============================================================================
// Helpers
// =============================================================================

async fn send_json<S, T>(sender: &mut S, state: &Arc<AppState>, payload: &T) -> Result<(), axum::Error>
where
    S: futures_util::Sink<Message, Error = axum::Error> + Unpin,
    T: serde::Serialize,
{
    state
        .ws_sequence_number
        .fetch_add(1, std::sync::atomic::Ordering::Relaxed);

    match serde_json::to_string(payload) {
        Ok(json) => sender.send(Message::Text(json.into())).await,
        Err(e) => {
            warn!(error = %e, "failed to serialize WebSocket payload");
            Ok(())
        }
    }
}

fn cleanup(state: &Arc<AppState>) {
    *state.ws_user_connected.write() = false;
    state.increment_version();
    info!("WebSocket connection closed — cleanup complete");
}
