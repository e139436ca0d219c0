//! In-memory exec approval ledger.
//!
//! An operator asks for a command to run on a host; someone holding the
//! `operator.approvals` capability resolves the request; the decision is
//! then presented back with the actual `system.run`. The gate re-validates
//! everything at invoke time: record identity, expiry, requesting device,
//! and that the command being run is byte-for-byte the command that was
//! approved. Forwarded parameters are rebuilt from an allowlist so no
//! client-supplied `approved*` fields survive.

use std::collections::{HashMap, HashSet};
use std::sync::Mutex;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use tracing::{info, instrument, warn};

use crosstalk_core::config::APPROVAL_TTL_MS;
use crosstalk_core::types::Capability;

use crate::command::{normalize_argv, normalize_command, shell_split};
use crate::error::ApprovalError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ApprovalDecision {
    AllowOnce,
    AllowAlways,
}

impl ApprovalDecision {
    pub fn as_str(&self) -> &'static str {
        match self {
            ApprovalDecision::AllowOnce => "allow-once",
            ApprovalDecision::AllowAlways => "allow-always",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ApprovalHost {
    Gateway,
    Node,
}

/// What was asked for, normalized at request time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecRequest {
    /// Canonical command text (tokenized and re-quoted).
    pub command: String,
    pub host: ApprovalHost,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cwd: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub agent_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_key: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ApprovalRecord {
    pub id: String,
    pub request: ExecRequest,
    pub requested_by_conn_id: Option<String>,
    pub requested_by_device_id: Option<String>,
    pub created_at_ms: i64,
    pub expires_at_ms: i64,
    /// Set exactly once; `None` after resolution means timeout.
    pub decision: Option<ApprovalDecision>,
    pub resolved_at_ms: Option<i64>,
    pub resolved_by: Option<String>,
    /// The timed-out ask-fallback may be spent once.
    #[serde(skip)]
    ask_fallback_used: bool,
}

/// Who is invoking, as established at connect time.
#[derive(Debug, Clone)]
pub struct CallerIdentity {
    pub conn_id: String,
    pub device_id: Option<String>,
    pub capabilities: HashSet<Capability>,
}

impl CallerIdentity {
    pub fn can_approve(&self) -> bool {
        self.capabilities.contains(&Capability::OperatorApprovals)
    }
}

/// Parameter names copied into a forwarded `system.run`. Everything else —
/// in particular any `approved*` field the client sent — is dropped.
const FORWARD_FIELDS: &[&str] = &[
    "command",
    "rawCommand",
    "cwd",
    "env",
    "timeoutMs",
    "needsScreenRecording",
    "agentId",
    "sessionKey",
    "runId",
];

pub struct ApprovalLedger {
    records: Mutex<HashMap<String, ApprovalRecord>>,
    default_ttl: Duration,
}

impl ApprovalLedger {
    pub fn new(default_ttl: Duration) -> Self {
        Self {
            records: Mutex::new(HashMap::new()),
            default_ttl,
        }
    }

    pub fn with_default_ttl() -> Self {
        Self::new(Duration::from_millis(APPROVAL_TTL_MS))
    }

    /// Open a record. `ttl` falls back to the ledger default.
    #[instrument(skip_all, fields(id))]
    pub fn request(
        &self,
        id: &str,
        request: ExecRequest,
        requested_by_conn_id: Option<&str>,
        requested_by_device_id: Option<&str>,
        ttl: Option<Duration>,
    ) -> ApprovalRecord {
        let now = now_ms();
        let ttl = ttl.unwrap_or(self.default_ttl);
        let record = ApprovalRecord {
            id: id.to_string(),
            request,
            requested_by_conn_id: requested_by_conn_id.map(str::to_string),
            requested_by_device_id: requested_by_device_id.map(str::to_string),
            created_at_ms: now,
            expires_at_ms: now + ttl.as_millis() as i64,
            decision: None,
            resolved_at_ms: None,
            resolved_by: None,
            ask_fallback_used: false,
        };
        self.records
            .lock()
            .unwrap()
            .insert(id.to_string(), record.clone());
        info!(id, command = %record.request.command, "approval requested");
        record
    }

    /// Record a decision. Requires `operator.approvals`; a decision is set
    /// exactly once and is immutable afterwards.
    #[instrument(skip_all, fields(id, decision = decision.as_str()))]
    pub fn resolve(
        &self,
        id: &str,
        decision: ApprovalDecision,
        caller: &CallerIdentity,
    ) -> Result<ApprovalRecord, ApprovalError> {
        if !caller.can_approve() {
            return Err(ApprovalError::NotPermitted);
        }
        let mut records = self.records.lock().unwrap();
        let record = records
            .get_mut(id)
            .ok_or_else(|| ApprovalError::UnknownApprovalId(id.to_string()))?;
        if record.decision.is_some() || record.resolved_at_ms.is_some() {
            return Err(ApprovalError::AlreadyResolved(id.to_string()));
        }
        record.decision = Some(decision);
        record.resolved_at_ms = Some(now_ms());
        record.resolved_by = Some(caller.conn_id.clone());
        info!(id, "approval resolved");
        Ok(record.clone())
    }

    pub fn get_snapshot(&self, id: &str) -> Option<ApprovalRecord> {
        self.records.lock().unwrap().get(id).cloned()
    }

    /// Mark a record as timed out: `resolved_at_ms` set, no decision.
    pub fn timeout(&self, id: &str) -> Option<ApprovalRecord> {
        let mut records = self.records.lock().unwrap();
        let record = records.get_mut(id)?;
        if record.decision.is_none() && record.resolved_at_ms.is_none() {
            record.resolved_at_ms = Some(now_ms());
            warn!(id, "approval timed out without a decision");
        }
        Some(record.clone())
    }

    /// Drop records past expiry plus a grace lap. Called opportunistically.
    pub fn prune(&self) {
        let now = now_ms();
        self.records
            .lock()
            .unwrap()
            .retain(|_, record| now <= record.expires_at_ms + 60_000);
    }

    /// Validate an `approved=true` `system.run` against the ledger and
    /// rebuild the parameters that may be forwarded to the host.
    ///
    /// On success the returned params contain only [`FORWARD_FIELDS`] plus
    /// `approved: true` and the record's own decision.
    #[instrument(skip_all)]
    pub fn gate_system_run(
        &self,
        caller: &CallerIdentity,
        params: &Value,
    ) -> Result<Value, ApprovalError> {
        let run_id = params.get("runId").and_then(Value::as_str);
        let Some(run_id) = run_id else {
            return Err(ApprovalError::MissingRunId);
        };

        let mut records = self.records.lock().unwrap();
        let record = records
            .get_mut(run_id)
            .ok_or_else(|| ApprovalError::UnknownApprovalId(run_id.to_string()))?;

        if now_ms() > record.expires_at_ms {
            return Err(ApprovalError::Expired(run_id.to_string()));
        }

        // Device binding: the stable device id wins; connection id is the
        // fallback when the record never saw one.
        match (&record.requested_by_device_id, &caller.device_id) {
            (Some(recorded), Some(device)) if recorded == device => {}
            (Some(_), _) => return Err(ApprovalError::DeviceMismatch(run_id.to_string())),
            (None, _) => {
                if let Some(conn) = &record.requested_by_conn_id {
                    if conn != &caller.conn_id {
                        return Err(ApprovalError::DeviceMismatch(run_id.to_string()));
                    }
                }
            }
        }

        // The invoke must describe the exact approved request.
        let command = normalized_param_command(params)
            .ok_or_else(|| ApprovalError::RequestMismatch(run_id.to_string()))?;
        let host = match params.get("host").and_then(Value::as_str) {
            Some("node") => ApprovalHost::Node,
            Some("gateway") | None => ApprovalHost::Gateway,
            Some(_) => return Err(ApprovalError::RequestMismatch(run_id.to_string())),
        };
        let cwd = params.get("cwd").and_then(Value::as_str);
        let agent_id = params.get("agentId").and_then(Value::as_str);
        let session_key = params.get("sessionKey").and_then(Value::as_str);

        let matches = record.request.command == command
            && record.request.host == host
            && record.request.cwd.as_deref() == cwd
            && record.request.agent_id.as_deref() == agent_id
            && record.request.session_key.as_deref() == session_key;
        if !matches {
            return Err(ApprovalError::RequestMismatch(run_id.to_string()));
        }

        // rawCommand, when supplied, must tokenize to the same argv.
        if let Some(raw) = params.get("rawCommand").and_then(Value::as_str) {
            let raw_norm =
                normalize_command(raw).ok_or(ApprovalError::RawCommandMismatch)?;
            if raw_norm != command {
                return Err(ApprovalError::RawCommandMismatch);
            }
        }

        let decision = match record.decision {
            Some(decision) => decision,
            None => {
                let timed_out = record.resolved_at_ms.is_some();
                let asks_once = params.get("approvalDecision").and_then(Value::as_str)
                    == Some("allow-once");
                if timed_out && asks_once && caller.can_approve() && !record.ask_fallback_used {
                    record.ask_fallback_used = true;
                    info!(run_id, "timed-out approval consumed via ask fallback");
                    ApprovalDecision::AllowOnce
                } else {
                    return Err(ApprovalError::ApprovalRequired(run_id.to_string()));
                }
            }
        };

        Ok(rebuild_forward_params(params, decision))
    }
}

/// Normalized command from params: accepts an argv array or command text.
fn normalized_param_command(params: &Value) -> Option<String> {
    match params.get("command") {
        Some(Value::Array(items)) => {
            let argv: Option<Vec<String>> = items
                .iter()
                .map(|item| item.as_str().map(str::to_string))
                .collect();
            argv.map(|argv| normalize_argv(&argv))
        }
        Some(Value::String(text)) => normalize_command(text),
        _ => None,
    }
}

/// Normalize a request's command at `exec.approval.request` time.
pub fn normalize_request_command(command: &Value) -> Option<String> {
    normalized_param_command(&json!({ "command": command }))
}

/// Rebuild forwardable params from the allowlist and stamp the decision.
pub fn rebuild_forward_params(params: &Value, decision: ApprovalDecision) -> Value {
    let mut rebuilt = Map::new();
    if let Some(source) = params.as_object() {
        for field in FORWARD_FIELDS {
            if let Some(value) = source.get(*field) {
                rebuilt.insert((*field).to_string(), value.clone());
            }
        }
    }
    rebuilt.insert("approved".to_string(), Value::Bool(true));
    rebuilt.insert(
        "approvalDecision".to_string(),
        Value::String(decision.as_str().to_string()),
    );
    Value::Object(rebuilt)
}

/// Whether a `system.run` carries any approval override flags at all.
pub fn has_override_flags(params: &Value) -> bool {
    params
        .as_object()
        .is_some_and(|map| {
            map.get("approved").and_then(Value::as_bool) == Some(true)
                || map.contains_key("approvalDecision")
                || map.contains_key("runId")
        })
}

/// Consistency check reused by the request handler: a caller-supplied raw
/// command must tokenize to the given argv.
pub fn raw_matches_argv(raw: &str, argv: &[String]) -> bool {
    shell_split(raw).is_some_and(|tokens| tokens == argv)
}

fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn approver(conn: &str, device: Option<&str>) -> CallerIdentity {
        let mut capabilities = HashSet::new();
        capabilities.insert(Capability::OperatorApprovals);
        capabilities.insert(Capability::OperatorWrite);
        CallerIdentity {
            conn_id: conn.to_string(),
            device_id: device.map(str::to_string),
            capabilities,
        }
    }

    fn writer(conn: &str, device: Option<&str>) -> CallerIdentity {
        let mut capabilities = HashSet::new();
        capabilities.insert(Capability::OperatorWrite);
        CallerIdentity {
            conn_id: conn.to_string(),
            device_id: device.map(str::to_string),
            capabilities,
        }
    }

    fn echo_request() -> ExecRequest {
        ExecRequest {
            command: normalize_command("echo hi").unwrap(),
            host: ApprovalHost::Node,
            cwd: None,
            agent_id: None,
            session_key: None,
        }
    }

    fn run_params(run_id: &str) -> Value {
        json!({
            "command": ["echo", "hi"],
            "host": "node",
            "approved": true,
            "approvalDecision": "allow-always",
            "runId": run_id,
        })
    }

    #[test]
    fn bypass_without_any_record_is_rejected() {
        // S3: override flags, no prior exec.approval.request
        let ledger = ApprovalLedger::with_default_ttl();
        let caller = writer("c1", Some("dev-1"));

        let no_run_id = json!({
            "command": ["rm", "-rf", "/"],
            "approved": true,
            "approvalDecision": "allow-always",
        });
        assert_eq!(
            ledger.gate_system_run(&caller, &no_run_id).unwrap_err(),
            ApprovalError::MissingRunId
        );

        let fake_run_id = json!({
            "command": ["rm", "-rf", "/"],
            "approved": true,
            "runId": "x",
        });
        assert_eq!(
            ledger.gate_system_run(&caller, &fake_run_id).unwrap_err(),
            ApprovalError::UnknownApprovalId("x".to_string())
        );
    }

    #[test]
    fn resolve_requires_capability_and_sets_once() {
        let ledger = ApprovalLedger::with_default_ttl();
        ledger.request("a", echo_request(), Some("c1"), Some("dev-1"), None);

        assert_eq!(
            ledger
                .resolve("a", ApprovalDecision::AllowOnce, &writer("c2", None))
                .unwrap_err(),
            ApprovalError::NotPermitted
        );

        let approver = approver("c1", Some("dev-1"));
        ledger
            .resolve("a", ApprovalDecision::AllowOnce, &approver)
            .unwrap();
        assert_eq!(
            ledger
                .resolve("a", ApprovalDecision::AllowAlways, &approver)
                .unwrap_err(),
            ApprovalError::AlreadyResolved("a".to_string())
        );
        // the first decision is immutable
        assert_eq!(
            ledger.get_snapshot("a").unwrap().decision,
            Some(ApprovalDecision::AllowOnce)
        );
    }

    #[test]
    fn approved_run_rebuilds_params_from_allowlist() {
        let ledger = ApprovalLedger::with_default_ttl();
        ledger.request("a", echo_request(), Some("c1"), Some("dev-1"), None);
        let caller = approver("c1", Some("dev-1"));
        ledger
            .resolve("a", ApprovalDecision::AllowAlways, &caller)
            .unwrap();

        let mut params = run_params("a");
        params["env"] = json!({"FOO": "bar"});
        params["approvedBy"] = json!("sneaky");
        params["approvalDecision"] = json!("allow-once"); // client lies

        let forwarded = ledger.gate_system_run(&caller, &params).unwrap();
        assert_eq!(forwarded["approved"], json!(true));
        // the record's decision wins over the client-supplied one
        assert_eq!(forwarded["approvalDecision"], json!("allow-always"));
        assert!(forwarded.get("approvedBy").is_none());
        assert_eq!(forwarded["env"], json!({"FOO": "bar"}));
        assert_eq!(forwarded["runId"], json!("a"));
    }

    #[test]
    fn device_mismatch_blocks_replay() {
        // S4: C1 requests and resolves; C2 on another device replays
        let ledger = ApprovalLedger::with_default_ttl();
        ledger.request("a", echo_request(), Some("c1"), Some("dev-1"), None);
        let c1 = approver("c1", Some("dev-1"));
        ledger.resolve("a", ApprovalDecision::AllowOnce, &c1).unwrap();

        let c2 = approver("c2", Some("dev-2"));
        assert_eq!(
            ledger.gate_system_run(&c2, &run_params("a")).unwrap_err(),
            ApprovalError::DeviceMismatch("a".to_string())
        );
    }

    #[test]
    fn conn_id_fallback_when_record_has_no_device() {
        let ledger = ApprovalLedger::with_default_ttl();
        ledger.request("a", echo_request(), Some("c1"), None, None);
        let same_conn = approver("c1", None);
        ledger
            .resolve("a", ApprovalDecision::AllowOnce, &same_conn)
            .unwrap();

        let other_conn = approver("c9", None);
        assert_eq!(
            ledger
                .gate_system_run(&other_conn, &run_params("a"))
                .unwrap_err(),
            ApprovalError::DeviceMismatch("a".to_string())
        );
        assert!(ledger.gate_system_run(&same_conn, &run_params("a")).is_ok());
    }

    #[test]
    fn request_fields_must_all_match() {
        let ledger = ApprovalLedger::with_default_ttl();
        ledger.request("a", echo_request(), Some("c1"), Some("dev-1"), None);
        let caller = approver("c1", Some("dev-1"));
        ledger
            .resolve("a", ApprovalDecision::AllowOnce, &caller)
            .unwrap();

        // different command
        let mut params = run_params("a");
        params["command"] = json!(["echo", "pwned"]);
        assert_eq!(
            ledger.gate_system_run(&caller, &params).unwrap_err(),
            ApprovalError::RequestMismatch("a".to_string())
        );

        // different cwd
        let mut params = run_params("a");
        params["cwd"] = json!("/elsewhere");
        assert_eq!(
            ledger.gate_system_run(&caller, &params).unwrap_err(),
            ApprovalError::RequestMismatch("a".to_string())
        );

        // different host
        let mut params = run_params("a");
        params["host"] = json!("gateway");
        assert_eq!(
            ledger.gate_system_run(&caller, &params).unwrap_err(),
            ApprovalError::RequestMismatch("a".to_string())
        );
    }

    #[test]
    fn raw_command_must_tokenize_to_command() {
        let ledger = ApprovalLedger::with_default_ttl();
        ledger.request("a", echo_request(), Some("c1"), Some("dev-1"), None);
        let caller = approver("c1", Some("dev-1"));
        ledger
            .resolve("a", ApprovalDecision::AllowOnce, &caller)
            .unwrap();

        let mut params = run_params("a");
        params["rawCommand"] = json!("echo hi");
        assert!(ledger.gate_system_run(&caller, &params).is_ok());

        // flag-injection attempt: rawCommand smuggles an extra token
        ledger.request("b", echo_request(), Some("c1"), Some("dev-1"), None);
        ledger
            .resolve("b", ApprovalDecision::AllowOnce, &caller)
            .unwrap();
        let mut params = run_params("b");
        params["rawCommand"] = json!("echo hi --and-also $(rm -rf /)");
        assert_eq!(
            ledger.gate_system_run(&caller, &params).unwrap_err(),
            ApprovalError::RawCommandMismatch
        );
    }

    #[test]
    fn pending_record_is_approval_required() {
        let ledger = ApprovalLedger::with_default_ttl();
        ledger.request("a", echo_request(), Some("c1"), Some("dev-1"), None);
        let caller = approver("c1", Some("dev-1"));
        assert_eq!(
            ledger.gate_system_run(&caller, &run_params("a")).unwrap_err(),
            ApprovalError::ApprovalRequired("a".to_string())
        );
    }

    #[test]
    fn expired_record_is_rejected() {
        let ledger = ApprovalLedger::with_default_ttl();
        ledger.request(
            "a",
            echo_request(),
            Some("c1"),
            Some("dev-1"),
            Some(Duration::ZERO),
        );
        let caller = approver("c1", Some("dev-1"));
        std::thread::sleep(Duration::from_millis(5));
        assert_eq!(
            ledger.gate_system_run(&caller, &run_params("a")).unwrap_err(),
            ApprovalError::Expired("a".to_string())
        );
    }

    #[test]
    fn timed_out_record_allows_one_ask_fallback_for_approvers() {
        let ledger = ApprovalLedger::with_default_ttl();
        ledger.request("a", echo_request(), Some("c1"), Some("dev-1"), None);
        ledger.timeout("a");

        let mut params = run_params("a");
        params["approvalDecision"] = json!("allow-once");

        // a caller without operator.approvals cannot use the fallback
        let plain = writer("c1", Some("dev-1"));
        assert_eq!(
            ledger.gate_system_run(&plain, &params).unwrap_err(),
            ApprovalError::ApprovalRequired("a".to_string())
        );

        let caller = approver("c1", Some("dev-1"));
        let forwarded = ledger.gate_system_run(&caller, &params).unwrap();
        assert_eq!(forwarded["approvalDecision"], json!("allow-once"));

        // the fallback is single-use
        assert_eq!(
            ledger.gate_system_run(&caller, &params).unwrap_err(),
            ApprovalError::ApprovalRequired("a".to_string())
        );
    }

    #[test]
    fn override_flag_detection() {
        assert!(has_override_flags(&json!({"approved": true})));
        assert!(has_override_flags(&json!({"runId": "x"})));
        assert!(has_override_flags(&json!({"approvalDecision": "allow-once"})));
        assert!(!has_override_flags(&json!({"command": ["ls"]})));
        assert!(!has_override_flags(&json!({"approved": false})));
    }
}
