//! WS method routing. Every authenticated request lands here; each method
//! group has its own handler function below.

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};
use tracing::{info, warn};

use crosstalk_channels::types::Envelope;
use crosstalk_core::conffile::{parse_toml, redact, render_toml, restore_redacted};
use crosstalk_core::GatewayError;
use crosstalk_exec::approval::{
    has_override_flags, normalize_request_command, rebuild_forward_params, ApprovalDecision,
    ApprovalHost, CallerIdentity, ExecRequest,
};
use crosstalk_protocol::frames::ResFrame;
use crosstalk_protocol::methods;
use crosstalk_routing::commands::classify;
use crosstalk_routing::lane::IdemState;
use crosstalk_routing::{schedule_restart, RestartSentinel, SubmitOutcome};
use crosstalk_sessions::SessionKey;

use crate::app::AppState;
use crate::control;

/// Byte budget for a `chat.history` response.
const HISTORY_BYTE_BUDGET: usize = 256 * 1024;

/// Route a method call to its handler.
pub async fn route(
    method: &str,
    params: Option<&Value>,
    req_id: &str,
    caller: &CallerIdentity,
    state: &Arc<AppState>,
) -> ResFrame {
    let params = params.cloned().unwrap_or(Value::Null);
    let result = match method {
        "ping" => Ok(json!({ "pong": true })),
        methods::CHAT_SEND => chat_send(state, &params).await,
        methods::CHAT_ABORT => chat_abort(state, &params),
        methods::CHAT_HISTORY => chat_history(state, &params),
        methods::CONFIG_GET => config_get(state),
        methods::CONFIG_SET => config_set(state, &params, false).await,
        methods::CONFIG_PATCH => config_patch(state, &params).await,
        methods::CONFIG_APPLY => config_set(state, &params, true).await,
        methods::CONFIG_SCHEMA => Ok(config_schema()),
        methods::NODE_LIST => Ok(json!({ "nodes": state.nodes.list() })),
        methods::NODE_INVOKE => node_invoke(state, caller, &params).await,
        methods::EXEC_APPROVAL_REQUEST => approval_request(state, caller, &params),
        methods::EXEC_APPROVAL_RESOLVE => approval_resolve(state, caller, &params),
        _ => Err(GatewayError::MethodNotFound {
            method: method.to_string(),
        }),
    };

    match result {
        Ok(payload) => ResFrame::ok(req_id, payload),
        Err(e) => error_res(req_id, &e),
    }
}

fn error_res(req_id: &str, error: &GatewayError) -> ResFrame {
    ResFrame::err(req_id, error.code(), &error.to_string())
}

fn str_param<'a>(params: &'a Value, name: &str) -> Result<&'a str, GatewayError> {
    params
        .get(name)
        .and_then(Value::as_str)
        .ok_or_else(|| GatewayError::InvalidRequest(format!("missing '{name}'")))
}

// ── chat ─────────────────────────────────────────────────────────────────────

async fn chat_send(state: &Arc<AppState>, params: &Value) -> Result<Value, GatewayError> {
    let key_str = str_param(params, "sessionKey")?;
    let message = str_param(params, "message")?;
    let key = SessionKey::parse(key_str)
        .map_err(|e| GatewayError::InvalidRequest(e.to_string()))?;
    let idem_key = params
        .get("idempotencyKey")
        .and_then(Value::as_str)
        .map(str::to_string);

    // control commands answer synchronously, skipping the lane
    if let Some(command) = classify(message, &state.skills) {
        if let Some(reply) = control::execute(state, key_str, command).await {
            return Ok(json!({ "status": "ok", "reply": reply }));
        }
    }

    let lane = state.scheduler.lane(key_str);
    if let Some(idem_key) = &idem_key {
        match lane.idem_begin(idem_key) {
            None => {} // registered as in-flight; proceed
            Some((IdemState::InFlight, _)) => {
                return Ok(json!({ "status": "in_flight" }));
            }
            Some((IdemState::Ok, payload)) => {
                return Ok(payload.unwrap_or(json!({ "status": "ok" })));
            }
            Some((IdemState::Failed, payload)) => {
                return Ok(payload.unwrap_or(json!({ "status": "failed" })));
            }
        }
    }

    let mut envelope = Envelope::text_message(&key.channel, &key.scope_id, message);
    envelope.scope = match key.scope {
        crosstalk_sessions::KeyScope::Dm => crosstalk_channels::types::Scope::Dm,
        crosstalk_sessions::KeyScope::Group | crosstalk_sessions::KeyScope::Topic => {
            crosstalk_channels::types::Scope::Group(key.scope_id.clone())
        }
        crosstalk_sessions::KeyScope::Channel => {
            crosstalk_channels::types::Scope::Channel(key.scope_id.clone())
        }
    };
    envelope.thread_id = key.thread_id().map(str::to_string);

    match lane.submit_with(envelope, idem_key.clone()) {
        SubmitOutcome::Started(run_id) => Ok(json!({ "status": "started", "runId": run_id })),
        SubmitOutcome::Steering(run_id) | SubmitOutcome::Interrupting(run_id) => {
            Ok(json!({ "status": "started", "runId": run_id }))
        }
        SubmitOutcome::Buffered { depth } | SubmitOutcome::BufferedWithDrop { depth, .. } => {
            Ok(json!({ "status": "ok", "queued": depth }))
        }
        SubmitOutcome::RejectedFull => {
            // nothing will ever consume this envelope; settle the key now
            if let Some(idem_key) = &idem_key {
                lane.idem_finish(idem_key, false, Some(json!({ "status": "failed" })));
            }
            Err(GatewayError::Unavailable("message queue is full".to_string()))
        }
    }
}

fn chat_abort(state: &Arc<AppState>, params: &Value) -> Result<Value, GatewayError> {
    let key = str_param(params, "sessionKey")?;
    let run_id = params.get("runId").and_then(Value::as_str);
    let aborted = state.scheduler.abort(key, run_id);
    Ok(json!({ "aborted": aborted }))
}

fn chat_history(state: &Arc<AppState>, params: &Value) -> Result<Value, GatewayError> {
    let key_str = str_param(params, "sessionKey")?;
    let limit = params
        .get("limit")
        .and_then(Value::as_u64)
        .unwrap_or(50)
        .min(500) as usize;
    let key = SessionKey::parse(key_str)
        .map_err(|e| GatewayError::InvalidRequest(e.to_string()))?;

    let Some(session) = state
        .sessions
        .get(&key)
        .map_err(|e| GatewayError::Internal(e.to_string()))?
    else {
        return Ok(json!({ "messages": [] }));
    };

    let Some(path) = state
        .transcripts
        .resolve_existing(&session.session_id, Some(&key.agent_id))
    else {
        return Ok(json!({ "messages": [] }));
    };

    let raw = std::fs::read_to_string(&path)?;
    let mut messages: Vec<Value> = Vec::new();
    let mut budget = HISTORY_BYTE_BUDGET;
    // newest last; walk from the end so the byte budget keeps recent turns
    for line in raw.lines().rev() {
        if messages.len() >= limit || line.len() > budget {
            break;
        }
        if let Ok(entry) = serde_json::from_str::<Value>(line) {
            budget -= line.len();
            messages.push(entry);
        }
    }
    messages.reverse();
    Ok(json!({ "messages": messages }))
}

// ── config ───────────────────────────────────────────────────────────────────

fn config_get(state: &Arc<AppState>) -> Result<Value, GatewayError> {
    let snapshot = state.conf_file.read()?;
    let redacted = redact(&snapshot.parsed);
    let raw = render_toml(&redacted)?;
    Ok(json!({
        "config": redacted,
        "valid": snapshot.valid(),
        "issues": snapshot.issues,
        "raw": raw,
        "hash": snapshot.hash,
    }))
}

async fn config_set(
    state: &Arc<AppState>,
    params: &Value,
    restart: bool,
) -> Result<Value, GatewayError> {
    let raw = str_param(params, "raw")?;
    let base_hash = str_param(params, "baseHash")?;

    // restore redaction placeholders against the stored document so a
    // round-tripped redacted config does not erase secrets
    let mut incoming =
        parse_toml(raw).map_err(|e| GatewayError::InvalidRequest(format!("parse error: {e}")))?;
    let stored = state.conf_file.read()?;
    restore_redacted(&mut incoming, &stored.parsed);
    let restored_raw = render_toml(&incoming)?;

    let snapshot = state.conf_file.write(&restored_raw, base_hash)?;
    info!(path = %state.conf_file.path().display(), "config written");

    let sentinel = if restart {
        Some(schedule_config_restart(state, params, "config.apply").await?)
    } else {
        None
    };

    Ok(json!({
        "ok": true,
        "path": state.conf_file.path(),
        "config": redact(&snapshot.parsed),
        "hash": snapshot.hash,
        "restart": restart,
        "sentinel": sentinel,
    }))
}

async fn config_patch(state: &Arc<AppState>, params: &Value) -> Result<Value, GatewayError> {
    let patch = params
        .get("patch")
        .or_else(|| params.get("raw"))
        .ok_or_else(|| GatewayError::InvalidRequest("missing 'patch'".to_string()))?;
    let base_hash = str_param(params, "baseHash")?;

    let mut patch = patch.clone();
    let stored = state.conf_file.read()?;
    restore_redacted(&mut patch, &stored.parsed);

    let snapshot = state.conf_file.patch(&patch, base_hash)?;
    let sentinel = schedule_config_restart(state, params, "config.patch").await?;

    Ok(json!({
        "ok": true,
        "path": state.conf_file.path(),
        "config": redact(&snapshot.parsed),
        "hash": snapshot.hash,
        "restart": true,
        "sentinel": sentinel,
    }))
}

/// Write the sentinel and spawn the gated restart task.
async fn schedule_config_restart(
    state: &Arc<AppState>,
    params: &Value,
    kind: &str,
) -> Result<Value, GatewayError> {
    let mut sentinel = RestartSentinel::now(kind);
    sentinel.session_key = params
        .get("sessionKey")
        .and_then(Value::as_str)
        .map(str::to_string);
    sentinel.thread_id = sentinel
        .session_key
        .as_deref()
        .and_then(|k| SessionKey::parse(k).ok())
        .and_then(|k| k.thread_id().map(str::to_string));
    sentinel.message = params
        .get("note")
        .and_then(Value::as_str)
        .map(str::to_string)
        .or(Some("Config applied; gateway restarted.".to_string()));

    let delay_ms = params
        .get("restartDelayMs")
        .and_then(Value::as_u64)
        .unwrap_or(state.config.restart.delay_ms);
    let sentinel_value = serde_json::to_value(&sentinel)?;
    let path = RestartSentinel::path_in(&state.state_dir);

    state.restarting.store(true, Ordering::SeqCst);
    let gate = state.restart_gate();
    let max_wait = Duration::from_millis(state.config.restart.max_wait_ms);
    tokio::spawn(schedule_restart(
        gate,
        sentinel,
        path,
        Duration::from_millis(delay_ms),
        max_wait,
        Arc::new(crate::restart_signal),
    ));

    Ok(sentinel_value)
}

fn config_schema() -> Value {
    json!({
        "$schema": "https://json-schema.org/draft/2020-12/schema",
        "title": "CrosstalkConfig",
        "type": "object",
        "properties": {
            "gateway": {
                "type": "object",
                "properties": {
                    "port": { "type": "integer" },
                    "bind": { "type": "string" },
                    "auth": {
                        "type": "object",
                        "properties": {
                            "mode": { "enum": ["token", "password", "trusted-proxy", "none"] },
                            "token": { "type": "string" },
                            "password": { "type": "string" },
                            "trusted_proxies": { "type": "array", "items": { "type": "string" } },
                            "user_header": { "type": "string" },
                            "required_headers": { "type": "array", "items": { "type": "string" } },
                            "allow_users": { "type": "array", "items": { "type": "string" } },
                            "allow_tailscale": { "type": "boolean" }
                        }
                    },
                    "rate_limit": {
                        "type": "object",
                        "properties": {
                            "max_attempts": { "type": "integer" },
                            "window_secs": { "type": "integer" }
                        }
                    }
                }
            },
            "agent": {
                "type": "object",
                "properties": {
                    "model": { "type": "string" },
                    "block_streaming": { "type": "boolean" },
                    "retry_attempts": { "type": "integer" }
                }
            },
            "queue": {
                "type": "object",
                "properties": {
                    "mode": { "enum": ["collect", "followup", "steer", "steer+backlog", "interrupt"] },
                    "cap": { "type": "integer" },
                    "drop": { "enum": ["old", "new", "summarize"] },
                    "debounce_ms": { "type": "integer" }
                }
            },
            "webhooks": { "type": "object" },
            "media": { "type": "object" },
            "exec": { "type": "object" },
            "restart": { "type": "object" },
            "state": { "type": "object" }
        }
    })
}

// ── nodes & exec approvals ───────────────────────────────────────────────────

async fn node_invoke(
    state: &Arc<AppState>,
    caller: &CallerIdentity,
    params: &Value,
) -> Result<Value, GatewayError> {
    let node_id = str_param(params, "nodeId")?;
    let command = str_param(params, "command")?;
    let inner = params.get("params").cloned().unwrap_or(json!({}));

    if command == methods::SYSTEM_EXEC_APPROVALS_SET {
        return Err(GatewayError::InvalidRequest(
            "system.execApprovals.set is gateway-owned and cannot be forwarded".to_string(),
        ));
    }

    if command == methods::SYSTEM_RUN {
        let forwarded = gate_system_run(state, caller, &inner)?;
        return state.nodes.invoke(node_id, command, forwarded).await;
    }

    state.nodes.invoke(node_id, command, inner).await
}

/// The §exec gate: allowlist first, then the approval ledger.
fn gate_system_run(
    state: &Arc<AppState>,
    caller: &CallerIdentity,
    inner: &Value,
) -> Result<Value, GatewayError> {
    let agent_id = inner
        .get("agentId")
        .and_then(Value::as_str)
        .unwrap_or("main");

    if let Some(command_value) = inner.get("command") {
        if let Some(command_text) = normalize_request_command(command_value) {
            if let Some(hit) = state.approvals.match_allowlist(
                agent_id,
                &command_text,
                &state.config.exec.safe_bins,
            ) {
                info!(pattern = %hit.pattern, "system.run allowed by allowlist");
                return Ok(rebuild_forward_params(inner, ApprovalDecision::AllowAlways));
            }
        }
    }

    if has_override_flags(inner) {
        match state.ledger.gate_system_run(caller, inner) {
            Ok(forwarded) => Ok(forwarded),
            Err(e) => {
                warn!(code = e.code(), "system.run denied");
                state.emit_event(
                    "exec.denied",
                    json!({ "reason": "approval-required", "code": e.code() }),
                );
                Err(GatewayError::Unavailable(e.to_string()))
            }
        }
    } else {
        state.emit_event("exec.denied", json!({ "reason": "approval-required" }));
        Err(GatewayError::Unavailable(
            "approval required: call exec.approval.request first".to_string(),
        ))
    }
}

fn approval_request(
    state: &Arc<AppState>,
    caller: &CallerIdentity,
    params: &Value,
) -> Result<Value, GatewayError> {
    let id = str_param(params, "id")?;
    let command_value = params
        .get("command")
        .ok_or_else(|| GatewayError::InvalidRequest("missing 'command'".to_string()))?;
    let command = normalize_request_command(command_value)
        .ok_or_else(|| GatewayError::InvalidRequest("command is not tokenizable".to_string()))?;
    let host = match params.get("host").and_then(Value::as_str) {
        Some("node") => ApprovalHost::Node,
        Some("gateway") | None => ApprovalHost::Gateway,
        Some(other) => {
            return Err(GatewayError::InvalidRequest(format!("unknown host '{other}'")))
        }
    };

    let request = ExecRequest {
        command,
        host,
        cwd: params.get("cwd").and_then(Value::as_str).map(str::to_string),
        agent_id: params
            .get("agentId")
            .and_then(Value::as_str)
            .map(str::to_string),
        session_key: params
            .get("sessionKey")
            .and_then(Value::as_str)
            .map(str::to_string),
    };
    let ttl = params
        .get("timeoutMs")
        .and_then(Value::as_u64)
        .map(Duration::from_millis);

    let record = state.ledger.request(
        id,
        request,
        Some(&caller.conn_id),
        caller.device_id.as_deref(),
        ttl,
    );
    state.emit_event("exec.approval.requested", &record);

    // expire the ask if nobody answers in time
    let ledger = state.ledger.clone();
    let state_for_timeout = state.clone();
    let record_id = record.id.clone();
    let wait = Duration::from_millis(
        (record.expires_at_ms - record.created_at_ms).max(0) as u64,
    );
    tokio::spawn(async move {
        tokio::time::sleep(wait).await;
        if let Some(after) = ledger.timeout(&record_id) {
            if after.decision.is_none() {
                state_for_timeout.emit_event(
                    "exec.approval.timeout",
                    json!({ "id": record_id }),
                );
            }
        }
    });

    Ok(serde_json::to_value(&record)?)
}

fn approval_resolve(
    state: &Arc<AppState>,
    caller: &CallerIdentity,
    params: &Value,
) -> Result<Value, GatewayError> {
    let id = str_param(params, "id")?;
    let decision = match str_param(params, "decision")? {
        "allow-once" => ApprovalDecision::AllowOnce,
        "allow-always" => ApprovalDecision::AllowAlways,
        other => {
            return Err(GatewayError::InvalidRequest(format!(
                "unknown decision '{other}'"
            )))
        }
    };

    let record = state
        .ledger
        .resolve(id, decision, caller)
        .map_err(|e| GatewayError::Unavailable(e.to_string()))?;
    state.emit_event("exec.approval.resolved", &record);
    Ok(json!({ "ok": true, "id": record.id, "decision": decision.as_str() }))
}
