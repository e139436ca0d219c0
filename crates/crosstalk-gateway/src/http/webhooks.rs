//! Webhook ingress — POST /hooks/:name.
//!
//! One path per channel plugin. Bodies are read under a byte cap and a
//! deadline (413 on overflow, 408 on timeout, 400 on anything malformed).
//! Bearer tokens compare in constant time; a token matching more than one
//! configured target is ambiguous and refused. Passwordless targets are
//! reachable only from loopback with a local Host header and no forwarded
//! headers.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::{
    body::Body,
    extract::{ConnectInfo, Path, State},
    http::{HeaderMap, Request, StatusCode},
    response::{IntoResponse, Json, Response},
};
use serde_json::{json, Value};
use tracing::{info, warn};

use crosstalk_channels::types::{Envelope, Scope, Sender};
use crosstalk_core::config::WebhookTarget;

use crate::app::AppState;
use crate::auth::{strip_bearer, timing_safe_eq};

pub async fn webhook_handler(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    request: Request<Body>,
) -> Response {
    let cfg = &state.config.webhooks;
    if !cfg.enabled {
        return reply(StatusCode::NOT_FOUND, json!({"error": "webhooks disabled"}));
    }

    let matching: Vec<WebhookTarget> = cfg
        .targets
        .iter()
        .filter(|t| t.name == name)
        .cloned()
        .collect();
    if matching.is_empty() {
        warn!(name = %name, "unknown webhook target");
        return reply(StatusCode::NOT_FOUND, json!({"error": "unknown webhook"}));
    }

    let (parts, body) = request.into_parts();
    let headers = parts.headers;

    let target = match authenticate(&state, &headers, &peer, &matching) {
        Ok(target) => target,
        Err(response) => return response,
    };

    // bounded, deadline-bound body read
    let read = tokio::time::timeout(
        Duration::from_millis(cfg.read_timeout_ms),
        axum::body::to_bytes(body, cfg.max_body_bytes),
    )
    .await;
    let bytes = match read {
        Err(_) => {
            return reply(
                StatusCode::REQUEST_TIMEOUT,
                json!({"error": "body read timed out"}),
            )
        }
        Ok(Err(_)) => {
            return reply(
                StatusCode::PAYLOAD_TOO_LARGE,
                json!({"error": "body exceeds limit"}),
            )
        }
        Ok(Ok(bytes)) => bytes,
    };

    let payload = match parse_payload(&headers, &bytes) {
        Some(payload) => payload,
        None => {
            return reply(
                StatusCode::BAD_REQUEST,
                json!({"error": "body is not a JSON payload"}),
            )
        }
    };

    let envelope = envelope_from(&target, &payload);
    info!(name = %name, channel = %target.channel, "webhook accepted");
    state.router.ingest(envelope).await;

    reply(StatusCode::OK, json!({"ok": true}))
}

fn reply(status: StatusCode, body: Value) -> Response {
    (status, Json(body)).into_response()
}

/// Pick the single target the presented credentials match.
fn authenticate(
    state: &Arc<AppState>,
    headers: &HeaderMap,
    peer: &SocketAddr,
    matching: &[WebhookTarget],
) -> Result<WebhookTarget, Response> {
    let presented = headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .map(strip_bearer);

    if let Some(presented) = presented {
        let hits: Vec<&WebhookTarget> = matching
            .iter()
            .filter(|t| {
                t.token
                    .as_deref()
                    .is_some_and(|expected| timing_safe_eq(presented, expected))
            })
            .collect();
        return match hits.len() {
            1 => Ok(hits[0].clone()),
            0 => {
                state
                    .limiter
                    .record_failure(&peer.ip().to_string(), "webhook");
                Err(reply(
                    StatusCode::UNAUTHORIZED,
                    json!({"error": "bad token"}),
                ))
            }
            _ => {
                warn!("webhook token matches multiple targets");
                Err(reply(
                    StatusCode::UNAUTHORIZED,
                    json!({"error": "ambiguous webhook target"}),
                ))
            }
        };
    }

    // passwordless: loopback peer, local Host, and no forwarded headers
    let tokenless: Vec<&WebhookTarget> =
        matching.iter().filter(|t| t.token.is_none()).collect();
    if tokenless.len() == 1 && is_local_direct(headers, peer) {
        return Ok(tokenless[0].clone());
    }

    state
        .limiter
        .record_failure(&peer.ip().to_string(), "webhook");
    Err(reply(
        StatusCode::UNAUTHORIZED,
        json!({"error": "missing token"}),
    ))
}

/// All three passwordless conditions: loopback peer, localhost Host header,
/// and not one `x-forwarded-*` header in sight.
fn is_local_direct(headers: &HeaderMap, peer: &SocketAddr) -> bool {
    if !peer.ip().is_loopback() {
        return false;
    }
    let host_ok = headers
        .get("host")
        .and_then(|v| v.to_str().ok())
        .map(|host| {
            let bare = host.split(':').next().unwrap_or(host);
            matches!(bare, "localhost" | "127.0.0.1" | "::1" | "[::1]")
        })
        .unwrap_or(false);
    if !host_ok {
        return false;
    }
    !headers
        .keys()
        .any(|name| name.as_str().starts_with("x-forwarded-"))
}

/// Accept `application/json` directly, or a form with a JSON-bearing
/// `payload`/`data`/`message` field.
fn parse_payload(headers: &HeaderMap, bytes: &[u8]) -> Option<Value> {
    let content_type = headers
        .get("content-type")
        .and_then(|v| v.to_str().ok())
        .unwrap_or("application/json");

    if content_type.starts_with("application/x-www-form-urlencoded") {
        let text = std::str::from_utf8(bytes).ok()?;
        for pair in text.split('&') {
            let (field, value) = pair.split_once('=')?;
            if matches!(field, "payload" | "data" | "message") {
                let replaced = value.replace('+', " ");
                let decoded = urlencoding::decode(&replaced).ok()?;
                return serde_json::from_str(&decoded).ok();
            }
        }
        return None;
    }

    serde_json::from_slice(bytes).ok()
}

/// Map a webhook JSON payload onto a normalized envelope.
fn envelope_from(target: &WebhookTarget, payload: &Value) -> Envelope {
    let text = ["text", "message", "body"]
        .iter()
        .find_map(|field| payload.get(field).and_then(Value::as_str))
        .unwrap_or_default();
    let sender_id = ["sender", "from", "user"]
        .iter()
        .find_map(|field| payload.get(field).and_then(Value::as_str))
        .unwrap_or("webhook");

    let mut envelope = Envelope::text_message(&target.channel, sender_id, text);
    envelope.sender = Sender {
        id: sender_id.to_string(),
        display_name: payload
            .get("senderName")
            .and_then(Value::as_str)
            .map(str::to_string),
        account_id: payload
            .get("accountId")
            .and_then(Value::as_str)
            .map(str::to_string),
    };
    envelope.message_id = payload
        .get("messageId")
        .and_then(Value::as_str)
        .map(str::to_string);
    envelope.chat_guid = payload
        .get("chatGuid")
        .and_then(Value::as_str)
        .map(str::to_string);
    envelope.chat_identifier = payload
        .get("chatIdentifier")
        .and_then(Value::as_str)
        .map(str::to_string);
    envelope.chat_id = payload
        .get("chatId")
        .and_then(Value::as_str)
        .map(str::to_string);
    envelope.balloon_bundle_id = payload
        .get("balloonBundleId")
        .and_then(Value::as_str)
        .map(str::to_string);
    envelope.associated_message_id = payload
        .get("associatedMessageGuid")
        .or_else(|| payload.get("associatedMessageId"))
        .and_then(Value::as_str)
        .map(str::to_string);
    envelope.from_me = payload
        .get("fromMe")
        .and_then(Value::as_bool)
        .unwrap_or(false);
    envelope.was_mentioned = payload
        .get("wasMentioned")
        .and_then(Value::as_bool)
        .unwrap_or(false);
    if let Some(group) = payload.get("groupId").and_then(Value::as_str) {
        envelope.scope = Scope::Group(group.to_string());
    }
    envelope
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    fn headers(pairs: &[(&str, &str)]) -> HeaderMap {
        let mut map = HeaderMap::new();
        for (name, value) in pairs {
            map.insert(
                axum::http::HeaderName::from_bytes(name.as_bytes()).unwrap(),
                HeaderValue::from_str(value).unwrap(),
            );
        }
        map
    }

    #[test]
    fn local_direct_requires_all_three_conditions() {
        let loopback: SocketAddr = "127.0.0.1:9999".parse().unwrap();
        let remote: SocketAddr = "203.0.113.9:9999".parse().unwrap();

        assert!(is_local_direct(&headers(&[("host", "localhost:18789")]), &loopback));
        assert!(is_local_direct(&headers(&[("host", "127.0.0.1")]), &loopback));

        // remote peer
        assert!(!is_local_direct(&headers(&[("host", "localhost")]), &remote));
        // non-local host header
        assert!(!is_local_direct(&headers(&[("host", "gw.example.com")]), &loopback));
        // any forwarded header disqualifies
        assert!(!is_local_direct(
            &headers(&[("host", "localhost"), ("x-forwarded-for", "1.2.3.4")]),
            &loopback
        ));
    }

    #[test]
    fn json_and_form_payloads_parse() {
        let body = br#"{"text":"hi","sender":"alice"}"#;
        let parsed = parse_payload(&headers(&[("content-type", "application/json")]), body).unwrap();
        assert_eq!(parsed["text"], "hi");

        let form = b"payload=%7B%22text%22%3A%22hi%22%7D";
        let parsed = parse_payload(
            &headers(&[("content-type", "application/x-www-form-urlencoded")]),
            form,
        )
        .unwrap();
        assert_eq!(parsed["text"], "hi");

        assert!(parse_payload(&headers(&[("content-type", "application/json")]), b"not json").is_none());
    }

    #[test]
    fn envelope_mapping_carries_balloon_fields() {
        let target = WebhookTarget {
            name: "imsg".to_string(),
            channel: "imessage".to_string(),
            token: Some("t".to_string()),
        };
        let payload = json!({
            "text": "https://ex.com",
            "sender": "alice",
            "messageId": "m2",
            "balloonBundleId": "b",
            "associatedMessageGuid": "g1",
            "chatGuid": "chat-9",
        });

        let envelope = envelope_from(&target, &payload);
        assert_eq!(envelope.channel, "imessage");
        assert_eq!(envelope.message_id.as_deref(), Some("m2"));
        assert_eq!(envelope.balloon_bundle_id.as_deref(), Some("b"));
        assert_eq!(envelope.associated_message_id.as_deref(), Some("g1"));
        assert_eq!(
            crosstalk_channels::envelope::coalesce_key(&envelope),
            "imessage:default:balloon:g1"
        );
    }
}
