//! Raw config file handling for the `config.*` RPC surface.
//!
//! The validated [`CrosstalkConfig`](crate::config::CrosstalkConfig) tree is
//! what the process runs on; this module owns the *file*: content hashing for
//! optimistic concurrency, JSON merge-patch, secret redaction, and atomic
//! persistence. Clients edit the raw document and submit it back with the
//! hash they read — a stale hash is rejected so concurrent writers cannot
//! silently clobber each other.

use serde_json::Value;
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};

use crate::config::CrosstalkConfig;
use crate::error::{GatewayError, Result};

/// Placeholder substituted for secret values in redacted output.
pub const REDACTED: &str = "__REDACTED__";

/// Keys whose values never leave the process in clear text.
const SECRET_KEYS: &[&str] = &["token", "password", "secret", "api_key"];

/// A snapshot of the config file as read from disk.
#[derive(Debug, Clone)]
pub struct ConfigSnapshot {
    /// Raw file text, exactly as stored.
    pub raw: String,
    /// sha256 hex of `raw` — the `baseHash` clients must echo on write.
    pub hash: String,
    /// Parsed JSON form of the document (TOML is parsed then converted).
    pub parsed: Value,
    /// Validation issues, empty when the document extracts cleanly.
    pub issues: Vec<String>,
}

impl ConfigSnapshot {
    pub fn valid(&self) -> bool {
        self.issues.is_empty()
    }
}

pub struct ConfigFile {
    path: PathBuf,
}

impl ConfigFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read the file and compute its snapshot. A missing file reads as an
    /// empty document so first-run `config.get` still works.
    pub fn read(&self) -> Result<ConfigSnapshot> {
        let raw = match std::fs::read_to_string(&self.path) {
            Ok(s) => s,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => String::new(),
            Err(e) => return Err(e.into()),
        };
        let hash = content_hash(&raw);
        let (parsed, issues) = parse_and_validate(&raw);
        Ok(ConfigSnapshot {
            raw,
            hash,
            parsed,
            issues,
        })
    }

    /// Replace the whole document. `base_hash` must match the stored file.
    pub fn write(&self, raw: &str, base_hash: &str) -> Result<ConfigSnapshot> {
        let current = self.read()?;
        if current.hash != base_hash {
            return Err(GatewayError::Conflict(
                "config changed; re-run config.get and retry".to_string(),
            ));
        }
        let (_, issues) = parse_and_validate(raw);
        if !issues.is_empty() {
            return Err(GatewayError::InvalidRequest(format!(
                "config does not validate: {}",
                issues.join("; ")
            )));
        }
        persist_atomic(&self.path, raw)?;
        self.read()
    }

    /// Apply an RFC 7396 merge-patch to the parsed document and persist.
    pub fn patch(&self, patch: &Value, base_hash: &str) -> Result<ConfigSnapshot> {
        let current = self.read()?;
        if current.hash != base_hash {
            return Err(GatewayError::Conflict(
                "config changed; re-run config.get and retry".to_string(),
            ));
        }
        let mut doc = current.parsed.clone();
        merge_patch(&mut doc, patch);
        let raw = render_toml(&doc)?;
        let (_, issues) = parse_and_validate(&raw);
        if !issues.is_empty() {
            return Err(GatewayError::InvalidRequest(format!(
                "patched config does not validate: {}",
                issues.join("; ")
            )));
        }
        persist_atomic(&self.path, &raw)?;
        self.read()
    }
}

/// sha256 hex digest of the raw document.
pub fn content_hash(raw: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(raw.as_bytes());
    hex::encode(hasher.finalize())
}

/// Parse TOML to JSON and run the schema extraction, collecting issues
/// instead of failing — `config.get` reports both the raw document and why
/// it does not validate.
pub fn parse_and_validate(raw: &str) -> (Value, Vec<String>) {
    let mut issues = Vec::new();

    let parsed: Value = match parse_toml(raw) {
        Ok(v) => v,
        Err(e) => {
            issues.push(format!("parse error: {e}"));
            return (Value::Object(Default::default()), issues);
        }
    };

    if let Err(e) = serde_json::from_value::<CrosstalkConfig>(parsed.clone()) {
        issues.push(format!("schema error: {e}"));
    }

    (parsed, issues)
}

pub fn parse_toml(raw: &str) -> std::result::Result<Value, String> {
    use figment::providers::Format;
    if raw.trim().is_empty() {
        return Ok(Value::Object(Default::default()));
    }
    let figment = figment::Figment::from(figment::providers::Toml::string(raw));
    let v: Value = figment.extract().map_err(|e| e.to_string())?;
    Ok(v)
}

/// Render a JSON document back to TOML. figment has no serializer, so
/// tables, nested tables, and arrays-of-tables are emitted by hand.
pub fn render_toml(doc: &Value) -> Result<String> {
    let Value::Object(map) = doc else {
        return Err(GatewayError::InvalidRequest(
            "config document must be a table".to_string(),
        ));
    };
    let mut out = String::new();
    render_table(&mut out, "", map)?;
    Ok(out)
}

fn render_table(
    out: &mut String,
    prefix: &str,
    map: &serde_json::Map<String, Value>,
) -> Result<()> {
    // inline values first — they belong to the current section header
    for (key, value) in map {
        if is_inline(value) {
            out.push_str(&format!("{} = {}\n", key, toml_scalar(value)?));
        }
    }
    for (key, value) in map {
        let path = if prefix.is_empty() {
            key.clone()
        } else {
            format!("{prefix}.{key}")
        };
        match value {
            Value::Object(sub) => {
                out.push_str(&format!("\n[{path}]\n"));
                render_table(out, &path, sub)?;
            }
            Value::Array(items) if items.iter().any(Value::is_object) => {
                for item in items {
                    let Value::Object(sub) = item else {
                        return Err(GatewayError::InvalidRequest(format!(
                            "mixed array at '{path}' cannot render to TOML"
                        )));
                    };
                    out.push_str(&format!("\n[[{path}]]\n"));
                    render_table(out, &path, sub)?;
                }
            }
            _ => {}
        }
    }
    Ok(())
}

/// Renderable without a section header: scalars and arrays of scalars.
fn is_inline(value: &Value) -> bool {
    match value {
        Value::Object(_) => false,
        Value::Array(items) => !items.iter().any(Value::is_object),
        _ => true,
    }
}

fn toml_scalar(v: &Value) -> Result<String> {
    match v {
        Value::String(s) => Ok(format!("{:?}", s)),
        Value::Bool(b) => Ok(b.to_string()),
        Value::Number(n) => Ok(n.to_string()),
        Value::Array(items) => {
            let parts: Result<Vec<String>> = items.iter().map(toml_scalar).collect();
            Ok(format!("[{}]", parts?.join(", ")))
        }
        Value::Null => Ok("\"\"".to_string()),
        Value::Object(_) => Err(GatewayError::InvalidRequest(
            "nested table in scalar position".to_string(),
        )),
    }
}

/// RFC 7396 JSON merge-patch. `null` values delete keys; objects merge
/// recursively; everything else replaces.
pub fn merge_patch(target: &mut Value, patch: &Value) {
    match patch {
        Value::Object(patch_map) => {
            if !target.is_object() {
                *target = Value::Object(Default::default());
            }
            let target_map = target.as_object_mut().unwrap();
            for (k, v) in patch_map {
                if v.is_null() {
                    target_map.remove(k);
                } else {
                    merge_patch(target_map.entry(k.clone()).or_insert(Value::Null), v);
                }
            }
        }
        other => {
            *target = other.clone();
        }
    }
}

/// Replace secret values with [`REDACTED`] recursively.
pub fn redact(doc: &Value) -> Value {
    match doc {
        Value::Object(map) => {
            let mut out = serde_json::Map::new();
            for (k, v) in map {
                let lower = k.to_lowercase();
                let is_secret = SECRET_KEYS.iter().any(|s| lower.contains(s));
                if is_secret && v.is_string() {
                    out.insert(k.clone(), Value::String(REDACTED.to_string()));
                } else {
                    out.insert(k.clone(), redact(v));
                }
            }
            Value::Object(out)
        }
        Value::Array(items) => Value::Array(items.iter().map(redact).collect()),
        other => other.clone(),
    }
}

/// Restore [`REDACTED`] placeholders from the stored document so a client
/// that round-trips a redacted config does not erase secrets.
pub fn restore_redacted(doc: &mut Value, stored: &Value) {
    if let (Value::Object(map), Value::Object(stored_map)) = (&mut *doc, stored) {
        for (k, v) in map.iter_mut() {
            match v {
                Value::String(s) if s == REDACTED => {
                    if let Some(orig) = stored_map.get(k) {
                        *v = orig.clone();
                    }
                }
                _ => {
                    if let Some(orig) = stored_map.get(k) {
                        restore_redacted(v, orig);
                    }
                }
            }
        }
    }
}

/// tmp + rename so readers never observe a torn file.
pub fn persist_atomic(path: &Path, contents: &str) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let tmp = path.with_extension("tmp");
    std::fs::write(&tmp, contents)?;
    std::fs::rename(&tmp, path)?;
    Ok(())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn hash_changes_with_content() {
        assert_ne!(content_hash("a"), content_hash("b"));
        assert_eq!(content_hash("a"), content_hash("a"));
    }

    #[test]
    fn write_rejects_stale_hash() {
        let dir = tempfile::tempdir().unwrap();
        let file = ConfigFile::new(dir.path().join("crosstalk.toml"));

        let snap = file.read().unwrap();
        file.write("[gateway]\nport = 9000\n", &snap.hash).unwrap();

        // second writer still holding the pre-write hash loses the race
        let err = file.write("[gateway]\nport = 9001\n", &snap.hash).unwrap_err();
        assert_eq!(err.code(), "CONFLICT");
    }

    #[test]
    fn roundtrip_get_edit_set() {
        let dir = tempfile::tempdir().unwrap();
        let file = ConfigFile::new(dir.path().join("crosstalk.toml"));

        let first = file.read().unwrap();
        let written = file.write("[gateway]\nport = 9000\n", &first.hash).unwrap();
        assert_ne!(written.hash, first.hash);
        assert_eq!(written.parsed["gateway"]["port"], json!(9000));

        let again = file.read().unwrap();
        assert_eq!(again.hash, written.hash);
    }

    #[test]
    fn patch_merges_and_deletes() {
        let mut doc = json!({"gateway": {"port": 18789, "bind": "127.0.0.1"}});
        merge_patch(
            &mut doc,
            &json!({"gateway": {"port": 9000, "bind": null}, "agent": {"model": "m"}}),
        );
        assert_eq!(doc["gateway"]["port"], json!(9000));
        assert!(doc["gateway"].get("bind").is_none());
        assert_eq!(doc["agent"]["model"], json!("m"));
    }

    #[test]
    fn render_toml_round_trips_arrays_of_tables() {
        let doc = json!({
            "gateway": {"port": 18789, "auth": {"mode": "token"}},
            "webhooks": {
                "enabled": true,
                "targets": [
                    {"name": "imsg", "channel": "imessage", "token": "t1"},
                    {"name": "tg", "channel": "telegram"},
                ],
            },
        });
        let raw = render_toml(&doc).unwrap();
        let parsed = parse_toml(&raw).unwrap();
        assert_eq!(parsed["gateway"]["auth"]["mode"], json!("token"));
        assert_eq!(parsed["webhooks"]["targets"][0]["name"], json!("imsg"));
        assert_eq!(parsed["webhooks"]["targets"][1]["channel"], json!("telegram"));
    }

    #[test]
    fn invalid_schema_is_reported_not_fatal() {
        let (_, issues) = parse_and_validate("[gateway]\nport = \"not-a-number\"\n");
        assert!(!issues.is_empty());
    }

    #[test]
    fn redact_hides_secrets_and_restore_brings_them_back() {
        let stored = json!({"gateway": {"auth": {"token": "s3cret", "mode": "token"}}});
        let mut redacted = redact(&stored);
        assert_eq!(
            redacted["gateway"]["auth"]["token"],
            json!(REDACTED)
        );
        assert_eq!(redacted["gateway"]["auth"]["mode"], json!("token"));

        restore_redacted(&mut redacted, &stored);
        assert_eq!(redacted["gateway"]["auth"]["token"], json!("s3cret"));
    }
}
