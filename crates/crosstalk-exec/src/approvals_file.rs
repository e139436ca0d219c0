//! The on-disk approvals file node hosts consult.
//!
//! JSON document `{version, defaults, agents, socket?}` with optimistic
//! concurrency: readers get `{file, hash}`, writers submit the document
//! plus the `baseHash` they read, and a stale hash is rejected so two
//! operator UIs cannot silently clobber each other. The per-agent
//! allowlist lets a `system.run` skip the ask step when its command matches
//! a stored pattern and its argv[0] resolves into the safe-bin set.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use globset::GlobBuilder;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{info, instrument, warn};

use crosstalk_core::{GatewayError, Result};

use crate::command::{resolve_argv0, shell_split};

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ApprovalDefaults {
    /// Commands not matching any allowlist entry require an interactive
    /// approval.
    #[serde(default = "default_true")]
    pub ask: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ask_timeout_ms: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct AgentApprovals {
    #[serde(default)]
    pub allowlist: Vec<AllowlistEntry>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AllowlistEntry {
    /// Case-insensitive glob matched against the full command text.
    pub pattern: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_used_at: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_used_command: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_resolved_path: Option<String>,
}

impl AllowlistEntry {
    pub fn new(pattern: impl Into<String>) -> Self {
        Self {
            pattern: pattern.into(),
            last_used_at: None,
            last_used_command: None,
            last_resolved_path: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApprovalsDoc {
    pub version: u32,
    #[serde(default)]
    pub defaults: ApprovalDefaults,
    /// Agent id → allowlist. BTreeMap keeps serialization stable so hashes
    /// don't churn on key order.
    #[serde(default)]
    pub agents: BTreeMap<String, AgentApprovals>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub socket: Option<serde_json::Value>,
}

impl Default for ApprovalsDoc {
    fn default() -> Self {
        Self {
            version: 1,
            defaults: ApprovalDefaults {
                ask: true,
                ask_timeout_ms: None,
            },
            agents: BTreeMap::new(),
            socket: None,
        }
    }
}

/// A successful allowlist hit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AllowlistMatch {
    pub pattern: String,
    pub resolved_path: PathBuf,
}

pub struct ApprovalsStore {
    path: PathBuf,
    lock: Mutex<()>,
}

impl ApprovalsStore {
    pub fn new(state_dir: impl AsRef<Path>) -> Self {
        Self {
            path: state_dir.as_ref().join("exec-approvals.json"),
            lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read the document and its content hash. A missing file reads as the
    /// default document (whose hash still protects first writes).
    pub fn read(&self) -> Result<(ApprovalsDoc, String)> {
        let _guard = self.lock.lock().unwrap();
        self.read_unlocked()
    }

    fn read_unlocked(&self) -> Result<(ApprovalsDoc, String)> {
        match std::fs::read_to_string(&self.path) {
            Ok(raw) => {
                let doc: ApprovalsDoc = serde_json::from_str(&raw)?;
                Ok((doc, hash_of(&raw)))
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                let doc = ApprovalsDoc::default();
                let raw = serde_json::to_string_pretty(&doc)?;
                Ok((doc, hash_of(&raw)))
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Replace the document. `base_hash` must match the stored content.
    #[instrument(skip_all)]
    pub fn write(&self, doc: &ApprovalsDoc, base_hash: &str) -> Result<String> {
        let _guard = self.lock.lock().unwrap();
        let (_, current_hash) = self.read_unlocked()?;
        if current_hash != base_hash {
            return Err(GatewayError::Conflict(
                "approvals file changed; reload and retry".to_string(),
            ));
        }
        let raw = serde_json::to_string_pretty(doc)?;
        self.persist(&raw)?;
        info!(path = %self.path.display(), "approvals file written");
        Ok(hash_of(&raw))
    }

    /// Match `command` against the agent's allowlist. On a hit the entry is
    /// stamped (`last_used_*`) and persisted best-effort.
    pub fn match_allowlist(
        &self,
        agent_id: &str,
        command: &str,
        safe_bins: &[String],
    ) -> Option<AllowlistMatch> {
        let argv = shell_split(command)?;
        let argv0 = argv.first()?;
        let resolved = resolve_argv0(argv0, safe_bins)?;

        let _guard = self.lock.lock().unwrap();
        let (mut doc, _) = self.read_unlocked().ok()?;
        let agent = doc.agents.get_mut(agent_id)?;

        let hit = agent.allowlist.iter_mut().find(|entry| {
            GlobBuilder::new(&entry.pattern)
                .case_insensitive(true)
                .literal_separator(false)
                .build()
                .ok()
                .map(|glob| glob.compile_matcher().is_match(command))
                .unwrap_or(false)
        })?;

        hit.last_used_at = Some(chrono::Utc::now().to_rfc3339());
        hit.last_used_command = Some(command.to_string());
        hit.last_resolved_path = Some(resolved.to_string_lossy().to_string());
        let matched = AllowlistMatch {
            pattern: hit.pattern.clone(),
            resolved_path: resolved,
        };

        match serde_json::to_string_pretty(&doc) {
            Ok(raw) => {
                if let Err(e) = self.persist(&raw) {
                    warn!(error = %e, "allowlist stamp persist failed");
                }
            }
            Err(e) => warn!(error = %e, "allowlist stamp serialize failed"),
        }

        Some(matched)
    }

    fn persist(&self, raw: &str) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let tmp = self.path.with_extension("json.tmp");
        std::fs::write(&tmp, raw)?;
        std::fs::rename(&tmp, &self.path)?;
        Ok(())
    }
}

fn hash_of(raw: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(raw.as_bytes());
    hex::encode(hasher.finalize())
}

fn default_true() -> bool {
    true
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn store_with_allowlist(dir: &Path, pattern: &str) -> ApprovalsStore {
        let store = ApprovalsStore::new(dir);
        let (mut doc, hash) = store.read().unwrap();
        doc.agents
            .entry("main".to_string())
            .or_default()
            .allowlist
            .push(AllowlistEntry::new(pattern));
        store.write(&doc, &hash).unwrap();
        store
    }

    fn fake_bin(dir: &Path, name: &str) -> Vec<String> {
        let bin_dir = dir.join("bin");
        std::fs::create_dir_all(&bin_dir).unwrap();
        std::fs::write(bin_dir.join(name), "#!/bin/sh\n").unwrap();
        vec![bin_dir.to_string_lossy().to_string()]
    }

    #[test]
    fn base_hash_protects_writes() {
        let dir = tempfile::tempdir().unwrap();
        let store = ApprovalsStore::new(dir.path());

        let (mut doc, hash) = store.read().unwrap();
        doc.version = 2;
        let new_hash = store.write(&doc, &hash).unwrap();
        assert_ne!(new_hash, hash);

        // a second writer holding the old hash is rejected
        let err = store.write(&doc, &hash).unwrap_err();
        assert_eq!(err.code(), "CONFLICT");
        assert!(err.to_string().contains("reload and retry"));
    }

    #[test]
    fn allowlist_matches_case_insensitive_glob() {
        let dir = tempfile::tempdir().unwrap();
        let safe = fake_bin(dir.path(), "git");
        let store = store_with_allowlist(dir.path(), "git status*");

        // glob matching ignores case once argv0 resolves
        let hit = store
            .match_allowlist("main", "git STATUS --short", &safe)
            .unwrap();
        assert_eq!(hit.pattern, "git status*");

        let miss = store.match_allowlist("main", "git push origin", &safe);
        assert!(miss.is_none());
    }

    #[test]
    fn allowlist_requires_argv0_in_safe_bins() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_with_allowlist(dir.path(), "*");
        let safe = vec![dir.path().join("bin").to_string_lossy().to_string()];

        assert!(store.match_allowlist("main", "nc -l 4444", &safe).is_none());
    }

    #[test]
    fn allowlist_miss_for_unknown_agent() {
        let dir = tempfile::tempdir().unwrap();
        let safe = fake_bin(dir.path(), "git");
        let store = store_with_allowlist(dir.path(), "git *");

        assert!(store
            .match_allowlist("other-agent", "git status", &safe)
            .is_none());
    }

    #[test]
    fn allowlist_hit_stamps_usage() {
        let dir = tempfile::tempdir().unwrap();
        let safe = fake_bin(dir.path(), "git");
        let store = store_with_allowlist(dir.path(), "git *");

        store.match_allowlist("main", "git log -1", &safe).unwrap();

        let (doc, _) = store.read().unwrap();
        let entry = &doc.agents["main"].allowlist[0];
        assert_eq!(entry.last_used_command.as_deref(), Some("git log -1"));
        assert!(entry.last_used_at.is_some());
        assert!(entry
            .last_resolved_path
            .as_deref()
            .unwrap()
            .ends_with("/git"));
    }

    #[test]
    fn document_round_trips_through_disk() {
        let dir = tempfile::tempdir().unwrap();
        let store = ApprovalsStore::new(dir.path());

        let (mut doc, hash) = store.read().unwrap();
        doc.agents
            .entry("main".to_string())
            .or_default()
            .allowlist
            .push(AllowlistEntry::new("cargo *"));
        store.write(&doc, &hash).unwrap();

        let again = ApprovalsStore::new(dir.path());
        let (loaded, _) = again.read().unwrap();
        assert_eq!(loaded.agents["main"].allowlist[0].pattern, "cargo *");
    }
}
