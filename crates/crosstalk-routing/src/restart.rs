//! Restart gating.
//!
//! A reconfiguration that requires a restart never interrupts in-flight
//! work: the gate polls total queued envelopes plus total pending replies
//! and defers the restart signal until both reach zero or an absolute
//! timeout elapses. The sentinel file is always written before signaling so
//! the successor process can route a confirmation reply back to the
//! conversation that asked for the change.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crosstalk_core::config::RESTART_POLL_MS;

/// Written before the restart signal; consumed by the successor on boot.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RestartSentinel {
    /// What triggered the restart (e.g. "config.apply", "config.patch").
    pub kind: String,
    /// RFC3339 write instant.
    pub ts: String,
    /// Session that asked for the change — the confirmation reply routes
    /// back here.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_key: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub delivery_context: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub thread_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl RestartSentinel {
    pub fn now(kind: &str) -> Self {
        Self {
            kind: kind.to_string(),
            ts: chrono::Utc::now().to_rfc3339(),
            session_key: None,
            delivery_context: None,
            thread_id: None,
            message: None,
        }
    }

    pub fn path_in(state_dir: &Path) -> PathBuf {
        state_dir.join("restart.sentinel.json")
    }

    pub fn write(&self, path: &Path) -> std::io::Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let tmp = path.with_extension("json.tmp");
        std::fs::write(&tmp, serde_json::to_string_pretty(self)?)?;
        std::fs::rename(&tmp, path)
    }

    /// Read and remove the sentinel, if present. Called once at boot.
    pub fn consume(path: &Path) -> Option<Self> {
        let raw = std::fs::read_to_string(path).ok()?;
        let sentinel = serde_json::from_str(&raw).ok()?;
        if let Err(e) = std::fs::remove_file(path) {
            warn!(path = %path.display(), error = %e, "sentinel remove failed");
        }
        Some(sentinel)
    }
}

/// Work counters the gate observes. Wired to
/// `LaneScheduler::total_queue_size` and
/// `DispatcherRegistry::total_pending_replies` in production.
#[derive(Clone)]
pub struct RestartGate {
    queue_size: Arc<dyn Fn() -> usize + Send + Sync>,
    pending_replies: Arc<dyn Fn() -> usize + Send + Sync>,
}

impl RestartGate {
    pub fn new(
        queue_size: Arc<dyn Fn() -> usize + Send + Sync>,
        pending_replies: Arc<dyn Fn() -> usize + Send + Sync>,
    ) -> Self {
        Self {
            queue_size,
            pending_replies,
        }
    }

    pub fn can_restart(&self) -> bool {
        (self.queue_size)() + (self.pending_replies)() == 0
    }

    /// Wait until the gate opens or `max_wait` elapses. Returns whether the
    /// gate actually opened. Never forces termination — it only defers.
    pub async fn wait_until_idle(&self, max_wait: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + max_wait;
        loop {
            if self.can_restart() {
                return true;
            }
            if tokio::time::Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(Duration::from_millis(RESTART_POLL_MS)).await;
        }
    }
}

/// Schedule a gated restart: write the sentinel, wait `delay`, defer on the
/// gate, then emit the restart signal (SIGUSR1-equivalent, injected so
/// tests observe it instead of dying).
pub async fn schedule_restart(
    gate: RestartGate,
    sentinel: RestartSentinel,
    sentinel_path: PathBuf,
    delay: Duration,
    max_wait: Duration,
    signal: Arc<dyn Fn() + Send + Sync>,
) -> std::io::Result<()> {
    sentinel.write(&sentinel_path)?;
    info!(kind = %sentinel.kind, path = %sentinel_path.display(), "restart sentinel written");

    if !delay.is_zero() {
        tokio::time::sleep(delay).await;
    }

    let opened = gate.wait_until_idle(max_wait).await;
    if !opened {
        warn!(
            waited_ms = max_wait.as_millis() as u64,
            "restart gate timed out with work still pending; restarting anyway"
        );
    }

    info!("emitting restart signal");
    signal();
    Ok(())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
