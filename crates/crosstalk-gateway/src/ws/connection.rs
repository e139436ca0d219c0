//! Per-connection WS task.
//!
//! State machine: AwaitingConnect → Authenticated → (runs until close).
//! The handshake must complete within the timeout or the connection drops.
//! After auth the loop multiplexes four sources: client frames, the
//! connection's outbound queue (handler responses and forwarded node
//! invokes), the broadcast event stream, and the heartbeat tick.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    extract::{ws::Message, ws::WebSocket, ConnectInfo, State, WebSocketUpgrade},
    http::HeaderMap,
    response::IntoResponse,
};
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tracing::{info, warn};

use crosstalk_core::config::{HANDSHAKE_TIMEOUT_MS, HEARTBEAT_INTERVAL_SECS, MAX_PAYLOAD_BYTES};
use crosstalk_exec::CallerIdentity;
use crosstalk_protocol::frames::{EventFrame, InboundFrame, ResFrame};
use crosstalk_protocol::handshake::ConnectParams;
use crosstalk_protocol::methods::CONNECT;

use crate::app::AppState;
use crate::auth::{self, AuthContext};
use crate::ws::{dispatch, handshake};

enum ConnState {
    AwaitingConnect,
    Authenticated(Box<CallerIdentity>),
    Closing,
}

/// Axum handler — upgrades HTTP to WebSocket at GET /ws.
pub async fn ws_handler(
    ws: WebSocketUpgrade,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> impl IntoResponse {
    let ctx = AuthContext {
        peer_ip: Some(peer.ip()),
        headers: lower_headers(&headers),
    };
    ws.on_upgrade(move |socket| handle_connection(socket, state, ctx))
}

fn lower_headers(headers: &HeaderMap) -> HashMap<String, String> {
    headers
        .iter()
        .filter_map(|(name, value)| {
            value
                .to_str()
                .ok()
                .map(|v| (name.as_str().to_lowercase(), v.to_string()))
        })
        .collect()
}

/// Per-connection task — lives for the entire WS session lifetime.
async fn handle_connection(socket: WebSocket, state: Arc<AppState>, ctx: AuthContext) {
    let conn_id = uuid::Uuid::new_v4().to_string();
    info!(conn_id = %conn_id, "new WS connection");

    let (mut tx, mut rx) = socket.split();
    let mut broadcast_rx = state.broadcaster.subscribe();
    let (out_tx, mut out_rx) = mpsc::unbounded_channel::<String>();

    // start in AwaitingConnect — send challenge immediately
    let nonce = handshake::make_nonce();
    if tx
        .send(Message::Text(handshake::challenge_event(&nonce).into()))
        .await
        .is_err()
    {
        return;
    }

    let mut conn_state = ConnState::AwaitingConnect;
    let mut is_node_conn = false;

    let handshake_deadline =
        tokio::time::Instant::now() + std::time::Duration::from_millis(HANDSHAKE_TIMEOUT_MS);
    let mut handshake_timer = Box::pin(tokio::time::sleep_until(handshake_deadline));

    let mut tick_interval =
        tokio::time::interval(std::time::Duration::from_secs(HEARTBEAT_INTERVAL_SECS));
    tick_interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            // client sent us something
            msg = rx.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        let text_ref: &str = &text;
                        if text_ref.len() > MAX_PAYLOAD_BYTES {
                            warn!(conn_id, size = text_ref.len(), "payload too large, dropping connection");
                            break;
                        }
                        conn_state = process_message(
                            &conn_id, text_ref, conn_state, &mut is_node_conn,
                            &out_tx, &state, &ctx,
                        )
                        .await;
                        if matches!(conn_state, ConnState::Closing) {
                            break;
                        }
                    }
                    Some(Ok(Message::Ping(data))) => {
                        let _ = tx.send(Message::Pong(data)).await;
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    _ => {}
                }
            }

            // handler responses and forwarded invokes for this client
            out = out_rx.recv() => {
                match out {
                    Some(payload) => {
                        if tx.send(Message::Text(payload.into())).await.is_err() {
                            break;
                        }
                    }
                    None => break,
                }
            }

            // broadcast event → forward to authenticated clients
            event = broadcast_rx.recv() => {
                if let Ok(payload) = event {
                    if matches!(conn_state, ConnState::Authenticated(_))
                        && tx.send(Message::Text(payload.into())).await.is_err()
                    {
                        break;
                    }
                }
            }

            // heartbeat tick (only meaningful after auth)
            _ = tick_interval.tick() => {
                if matches!(conn_state, ConnState::Authenticated(_)) {
                    let tick = EventFrame::new(
                        "tick",
                        serde_json::json!({ "ts": chrono::Utc::now().timestamp_millis() }),
                    )
                    .with_seq(state.next_seq());
                    let json = serde_json::to_string(&tick).unwrap_or_default();
                    if tx.send(Message::Text(json.into())).await.is_err() {
                        break;
                    }
                }
            }

            // handshake timeout — drop unauthed connections
            _ = &mut handshake_timer => {
                if matches!(conn_state, ConnState::AwaitingConnect) {
                    warn!(conn_id, "handshake timeout, closing connection");
                    break;
                }
            }
        }
    }

    state.nodes.unregister_conn(&conn_id);
    info!(conn_id, "WS connection closed");
}

/// Handle a single inbound text frame. Returns the new connection state.
#[allow(clippy::too_many_arguments)]
async fn process_message(
    conn_id: &str,
    text: &str,
    conn_state: ConnState,
    is_node_conn: &mut bool,
    out_tx: &mpsc::UnboundedSender<String>,
    state: &Arc<AppState>,
    ctx: &AuthContext,
) -> ConnState {
    let frame: InboundFrame = match serde_json::from_str(text) {
        Ok(f) => f,
        Err(e) => {
            warn!(conn_id, error = %e, "malformed frame, ignoring");
            return conn_state;
        }
    };

    match conn_state {
        // pre-auth: only `connect` is valid
        ConnState::AwaitingConnect => {
            let Some(req) = frame.as_req() else {
                return ConnState::AwaitingConnect;
            };

            if req.method != CONNECT {
                let res = ResFrame::err(&req.id, "PROTOCOL_ERROR", "must authenticate first");
                let _ = out_tx.send(serde_json::to_string(&res).unwrap_or_default());
                return ConnState::AwaitingConnect;
            }

            let params: ConnectParams = match req
                .params
                .and_then(|p| serde_json::from_value(p).ok())
            {
                Some(p) => p,
                None => {
                    let res = ResFrame::err(&req.id, "PROTOCOL_ERROR", "invalid connect params");
                    let _ = out_tx.send(serde_json::to_string(&res).unwrap_or_default());
                    return ConnState::Closing;
                }
            };

            let client_ip = ctx
                .client_ip(&state.config.gateway.auth.trusted_proxies)
                .map(|ip| ip.to_string())
                .unwrap_or_else(|| "unknown".to_string());
            let limit = state.limiter.check(&client_ip, "connect");
            if !limit.allowed {
                warn!(conn_id, ip = %client_ip, "connect rate limited");
                let res = ResFrame::err(&req.id, "UNAUTHORIZED", "too many attempts; slow down");
                let _ = out_tx.send(serde_json::to_string(&res).unwrap_or_default());
                return ConnState::Closing;
            }

            match auth::verify_auth(&params.auth, &state.config.gateway.auth, ctx) {
                Ok(capabilities) => {
                    let identity = CallerIdentity {
                        conn_id: conn_id.to_string(),
                        device_id: params.device_id.clone(),
                        capabilities,
                    };

                    if let Some(node) = &params.node {
                        state.nodes.register(node, conn_id, out_tx.clone());
                        *is_node_conn = true;
                    }

                    let hello = handshake::hello_ok_payload(state);
                    let res = ResFrame::ok(&req.id, hello);
                    let _ = out_tx.send(serde_json::to_string(&res).unwrap_or_default());
                    info!(conn_id, node = *is_node_conn, "client authenticated");
                    ConnState::Authenticated(Box::new(identity))
                }
                Err(failure) => {
                    state.limiter.record_failure(&client_ip, "connect");
                    warn!(conn_id, code = failure.code(), "auth failed");
                    let res = ResFrame::err(&req.id, "UNAUTHORIZED", failure.code());
                    let _ = out_tx.send(serde_json::to_string(&res).unwrap_or_default());
                    ConnState::Closing
                }
            }
        }

        // post-auth: responses from node hosts resolve pending invokes;
        // requests dispatch to method handlers off the socket loop
        ConnState::Authenticated(identity) => {
            if let Some(res) = frame.as_res() {
                if !state.nodes.resolve(res) {
                    warn!(conn_id, "response frame with no pending invoke");
                }
                return ConnState::Authenticated(identity);
            }

            if let Some(req) = frame.as_req() {
                let state = state.clone();
                let caller = (*identity).clone();
                let out_tx = out_tx.clone();
                tokio::spawn(async move {
                    let res = dispatch::route(
                        &req.method,
                        req.params.as_ref(),
                        &req.id,
                        &caller,
                        &state,
                    )
                    .await;
                    let _ = out_tx.send(serde_json::to_string(&res).unwrap_or_default());
                });
            }
            ConnState::Authenticated(identity)
        }

        ConnState::Closing => ConnState::Closing,
    }
}
