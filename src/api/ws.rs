// =============================================================================
// WebSocket Handler — live candle push
// =============================================================================
//
// Clients connect to `/api/v1/ws/{symbol}/{interval}` and receive every
// candle the chart accepts, one JSON text frame per update.  The socket
// follows the chart's view, so it keeps streaming across an interval switch.
//
// The handler also answers Ping with Pong and ends on Close or when the feed
// is stopped.
// =============================================================================

use std::sync::Arc;

use axum::{
    extract::{
        ws::{Message, WebSocket},
        Path, State, WebSocketUpgrade,
    },
    http::StatusCode,
    response::IntoResponse,
};
use futures_util::{SinkExt, StreamExt};
use tokio::sync::broadcast::{self, error::RecvError};
use tracing::{debug, info, warn};

use crate::app_state::AppState;
use crate::market_data::{Candle, SubscriptionKey};

/// Axum handler for the WebSocket upgrade request.  404 when the feed is not
/// running.
pub async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
    Path((symbol, interval)): Path<(String, String)>,
) -> impl IntoResponse {
    let key = SubscriptionKey::new(symbol, interval);
    let Some(view) = state.view(&key) else {
        warn!(key = %key, "WebSocket rejected: feed not running");
        return (StatusCode::NOT_FOUND, "feed not running").into_response();
    };

    info!(key = %key, "WebSocket connection accepted");
    let updates = view.subscribe_updates();
    ws.on_upgrade(move |socket| handle_ws_connection(socket, key, updates))
        .into_response()
}

async fn handle_ws_connection(
    socket: WebSocket,
    key: SubscriptionKey,
    mut updates: broadcast::Receiver<Candle>,
) {
    let (mut sender, mut receiver) = socket.split();

    loop {
        tokio::select! {
            // ── Push: every accepted candle ─────────────────────────────
            update = updates.recv() => {
                match update {
                    Ok(candle) => {
                        let text = match serde_json::to_string(&candle) {
                            Ok(text) => text,
                            Err(e) => {
                                warn!(error = %e, "failed to serialise candle");
                                continue;
                            }
                        };
                        if let Err(e) = sender.send(Message::Text(text)).await {
                            debug!(error = %e, "WebSocket send failed — disconnecting");
                            break;
                        }
                    }
                    Err(RecvError::Lagged(skipped)) => {
                        warn!(key = %key, skipped, "WebSocket client lagging, updates dropped");
                    }
                    Err(RecvError::Closed) => {
                        info!(key = %key, "feed stopped — closing WebSocket");
                        let _ = sender.send(Message::Close(None)).await;
                        break;
                    }
                }
            }

            // ── Recv: control frames ────────────────────────────────────
            msg = receiver.next() => {
                match msg {
                    Some(Ok(Message::Ping(data))) => {
                        if let Err(e) = sender.send(Message::Pong(data)).await {
                            debug!(error = %e, "Failed to send Pong — disconnecting");
                            break;
                        }
                    }
                    Some(Ok(Message::Close(_))) => {
                        info!(key = %key, "WebSocket Close frame received — disconnecting");
                        break;
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        debug!(error = %e, "WebSocket receive error — disconnecting");
                        break;
                    }
                    None => {
                        debug!("WebSocket stream ended");
                        break;
                    }
                }
            }
        }
    }

    info!(key = %key, "WebSocket connection closed");
}
