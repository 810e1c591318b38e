// =============================================================================
// WebSocket Handler — tick / position / account push feed
// =============================================================================
//
// Clients connect to `/ws?token=<token>` and receive hub events as JSON
// frames `{type: tick|position|account, ...}` in hub acceptance order.
// Clients MAY send `{type: subscribe|unsubscribe, symbols: [...]}`; the
// core records the interest set but does not filter — per the contract,
// filtering is the collaborator's concern.
//
// The handler:
//   - Responds to Ping frames with Pong frames.
//   - Honors backpressure via the hub's bounded egress (drops are counted
//     per subscriber and exported in the state snapshot).
//   - Cleans up the subscription on disconnect.
// =============================================================================

use std::collections::HashSet;
use std::sync::Arc;

use axum::{
    extract::{
        ws::{Message, WebSocket},
        Query, State, WebSocketUpgrade,
    },
    response::IntoResponse,
};
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use tracing::{debug, info, warn};

use crate::api::auth::validate_ws_token;
use crate::api::rest::ApiContext;
use crate::app_state::AppState;

#[derive(Deserialize)]
pub struct WsQuery {
    token: Option<String>,
}

/// A client-originated control frame.
#[derive(Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
enum ClientFrame {
    Subscribe { symbols: Vec<String> },
    Unsubscribe { symbols: Vec<String> },
}

// =============================================================================
// Upgrade handler
// =============================================================================

/// Validates the token from the `?token=` query parameter before upgrading.
pub async fn ws_handler(
    ws: WebSocketUpgrade,
    State(ctx): State<ApiContext>,
    Query(query): Query<WsQuery>,
) -> impl IntoResponse {
    let token = query.token.unwrap_or_default();
    let now_ms = ctx.state.clock.now_ms();
    if !validate_ws_token(&token, now_ms) {
        warn!("WebSocket connection rejected: invalid token");
        return (axum::http::StatusCode::FORBIDDEN, "Invalid or missing token").into_response();
    }

    info!("WebSocket connection accepted, upgrading");
    ws.on_upgrade(move |socket| handle_ws_connection(socket, ctx.state))
        .into_response()
}

// =============================================================================
// Connection handler
// =============================================================================

async fn handle_ws_connection(socket: WebSocket, state: Arc<AppState>) {
    let mut subscription = state.hub.subscribe();
    let subscriber_id = subscription.id;
    info!(subscriber = subscriber_id, "WebSocket subscriber attached to hub");

    let (mut sender, mut receiver) = socket.split();
    // Interest set per the protocol; recorded, not enforced.
    let mut interests: HashSet<String> = HashSet::new();

    loop {
        tokio::select! {
            // ── Hub events -> client ────────────────────────────────────
            maybe_event = subscription.recv() => {
                let Some(event) = maybe_event else {
                    info!(subscriber = subscriber_id, "hub closed the subscription");
                    break;
                };
                match serde_json::to_string(&event) {
                    Ok(json) => {
                        if let Err(e) = sender.send(Message::Text(json.into())).await {
                            debug!(error = %e, "WebSocket send failed, disconnecting");
                            break;
                        }
                    }
                    Err(e) => warn!(error = %e, "failed to serialize hub event"),
                }
            }

            // ── Client frames ───────────────────────────────────────────
            msg = receiver.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        match serde_json::from_str::<ClientFrame>(&text) {
                            Ok(ClientFrame::Subscribe { symbols }) => {
                                for s in symbols {
                                    interests.insert(s.to_uppercase());
                                }
                                debug!(subscriber = subscriber_id, count = interests.len(), "interest set updated");
                            }
                            Ok(ClientFrame::Unsubscribe { symbols }) => {
                                for s in symbols {
                                    interests.remove(&s.to_uppercase());
                                }
                            }
                            Err(_) => {
                                debug!(msg = %text, "ignoring unrecognized client frame");
                            }
                        }
                    }
                    Some(Ok(Message::Ping(data))) => {
                        if let Err(e) = sender.send(Message::Pong(data)).await {
                            debug!(error = %e, "failed to send Pong, disconnecting");
                            break;
                        }
                    }
                    Some(Ok(Message::Pong(_))) => {}
                    Some(Ok(Message::Close(_))) => {
                        info!(subscriber = subscriber_id, "WebSocket Close frame received");
                        break;
                    }
                    Some(Ok(Message::Binary(_))) => {
                        debug!("WebSocket binary message ignored");
                    }
                    Some(Err(e)) => {
                        warn!(error = %e, "WebSocket receive error, disconnecting");
                        break;
                    }
                    None => {
                        info!(subscriber = subscriber_id, "WebSocket stream ended");
                        break;
                    }
                }
            }
        }
    }

    // Dropping the subscription unsubscribes from the hub exactly once.
    drop(subscription);
    info!(subscriber = subscriber_id, "WebSocket connection closed, cleanup complete");
}
