// =============================================================================
// WebSocket Handlers — /ws/market and /ws/signals
// =============================================================================
//
// Protocol:
//   - The FIRST client frame must be `{"type": "auth", "token": "..."}`;
//     unauthenticated clients are dropped after the auth window.
//   - The server sends the literal string "ping" every ping interval; the
//     client replies with the literal "pong". All other server messages are
//     JSON envelopes.
//
// Each connection registers with the matching broadcast client set; a writer
// task drains the set's outbound channel into the socket, and the read loop
// records pongs and handles disconnects.
// =============================================================================

use std::time::Duration;

use axum::{
    extract::{
        ws::{Message, WebSocket},
        State, WebSocketUpgrade,
    },
    response::IntoResponse,
};
use futures_util::{SinkExt, StreamExt};
use tracing::{debug, info, warn};

use crate::api::auth::validate_token;
use crate::api::rest::ApiContext;
use crate::broadcast::ClientSet;

pub async fn market_ws_handler(
    ws: WebSocketUpgrade,
    State(ctx): State<ApiContext>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_connection(socket, ctx, true))
}

pub async fn signals_ws_handler(
    ws: WebSocketUpgrade,
    State(ctx): State<ApiContext>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_connection(socket, ctx, false))
}

async fn handle_connection(mut socket: WebSocket, ctx: ApiContext, market: bool) {
    let auth_window =
        Duration::from_secs(ctx.state.config.read().broadcast.auth_window_secs);

    // ── First frame: auth, inside the window ────────────────────────────
    let authed = tokio::time::timeout(auth_window, socket.recv()).await;
    let token = match authed {
        Ok(Some(Ok(Message::Text(text)))) => serde_json::from_str::<serde_json::Value>(&text)
            .ok()
            .filter(|v| v.get("type").and_then(|t| t.as_str()) == Some("auth"))
            .and_then(|v| v.get("token").and_then(|t| t.as_str()).map(String::from)),
        Ok(_) => None,
        Err(_) => {
            debug!("ws client sent no auth frame within the window — dropping");
            None
        }
    };

    let Some(token) = token else {
        let _ = socket.send(Message::Close(None)).await;
        return;
    };
    if !validate_token(&token) {
        warn!("ws client presented an invalid token — dropping");
        let _ = socket.send(Message::Close(None)).await;
        return;
    }

    // ── Register with the matching client set ───────────────────────────
    let set: &ClientSet = if market { &ctx.state.sink.market } else { &ctx.state.sink.signals };
    let Ok((client_id, mut outbound)) = set.add_client() else {
        warn!("ws client set full — dropping connection");
        let _ = socket.send(Message::Close(None)).await;
        return;
    };

    let (mut write, mut read) = socket.split();

    loop {
        tokio::select! {
            // ── Writer: drain the broadcast channel ─────────────────────
            payload = outbound.recv() => {
                match payload {
                    Some(payload) => {
                        if write.send(Message::Text(payload)).await.is_err() {
                            debug!(client = %client_id, "ws send failed — disconnecting");
                            break;
                        }
                    }
                    // Channel closed: the sink evicted this client.
                    None => break,
                }
            }
            // ── Reader: pongs and disconnects ───────────────────────────
            frame = read.next() => {
                match frame {
                    Some(Ok(Message::Text(text))) => {
                        if text == "pong" {
                            set.record_pong(&client_id);
                        } else {
                            debug!(client = %client_id, "ignoring unexpected ws text frame");
                        }
                    }
                    Some(Ok(Message::Ping(data))) => {
                        if write.send(Message::Pong(data)).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(Message::Pong(_))) => {
                        set.record_pong(&client_id);
                    }
                    Some(Ok(Message::Close(_))) | None => {
                        info!(client = %client_id, "ws client disconnected");
                        break;
                    }
                    Some(Ok(Message::Binary(_))) => {
                        debug!(client = %client_id, "ignoring binary ws frame");
                    }
                    Some(Err(e)) => {
                        debug!(client = %client_id, error = %e, "ws receive error");
                        break;
                    }
                }
            }
        }
    }

    set.remove_client(&client_id);
}
