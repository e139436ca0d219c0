use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::error::{GatewayError, Result};

// Protocol constants — must match operator client expectations exactly
pub const PROTOCOL_VERSION: u32 = 3;
pub const DEFAULT_PORT: u16 = 18789;
pub const DEFAULT_BIND: &str = "127.0.0.1";
pub const MAX_PAYLOAD_BYTES: usize = 128 * 1024; // 128 KB hard cap per frame
pub const HANDSHAKE_TIMEOUT_MS: u64 = 10_000; // close if client doesn't auth in 10s
pub const HEARTBEAT_INTERVAL_SECS: u64 = 30; // tick event cadence

/// Restart gate polls pending work at most this often.
pub const RESTART_POLL_MS: u64 = 50;

/// Default inbound coalescing window.
pub const DEBOUNCE_DEFAULT_MS: u64 = 500;

/// Default TTL for an exec approval record awaiting a decision.
pub const APPROVAL_TTL_MS: u64 = 30_000;

/// Top-level config (crosstalk.toml + CROSSTALK_* env overrides).
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct CrosstalkConfig {
    #[serde(default)]
    pub gateway: GatewayConfig,
    #[serde(default)]
    pub agent: AgentConfig,
    #[serde(default)]
    pub queue: QueueConfig,
    #[serde(default)]
    pub webhooks: WebhooksConfig,
    #[serde(default)]
    pub media: MediaConfig,
    #[serde(default)]
    pub exec: ExecConfig,
    #[serde(default)]
    pub restart: RestartConfig,
    #[serde(default)]
    pub state: StateConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_bind")]
    pub bind: String,
    #[serde(default)]
    pub auth: AuthConfig,
    #[serde(default)]
    pub rate_limit: RateLimitConfig,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            port: DEFAULT_PORT,
            bind: DEFAULT_BIND.to_string(),
            auth: AuthConfig::default(),
            rate_limit: RateLimitConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthConfig {
    #[serde(default)]
    pub mode: AuthMode,
    pub token: Option<String>,
    pub password: Option<String>,
    /// Peers allowed to speak for someone else via forwarded headers.
    #[serde(default)]
    pub trusted_proxies: Vec<String>,
    /// Header carrying the proxied user identity (trusted-proxy mode).
    pub user_header: Option<String>,
    /// Headers that must all be present in trusted-proxy mode.
    #[serde(default)]
    pub required_headers: Vec<String>,
    /// When non-empty, the proxied user must be a member.
    #[serde(default)]
    pub allow_users: Vec<String>,
    /// Accept a signed tailscale identity header set in token mode.
    #[serde(default)]
    pub allow_tailscale: bool,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            mode: AuthMode::Token,
            token: None,
            password: None,
            trusted_proxies: Vec::new(),
            user_header: None,
            required_headers: Vec::new(),
            allow_users: Vec::new(),
            allow_tailscale: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "kebab-case")]
pub enum AuthMode {
    #[default]
    Token,
    Password,
    TrustedProxy,
    None,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitConfig {
    #[serde(default = "default_rate_max")]
    pub max_attempts: u32,
    #[serde(default = "default_rate_window")]
    pub window_secs: u64,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_rate_max(),
            window_secs: default_rate_window(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    #[serde(default = "default_model")]
    pub model: String,
    /// Stream block replies as they complete instead of one final message.
    #[serde(default)]
    pub block_streaming: bool,
    /// Transient transport failures are retried this many times.
    #[serde(default = "default_retry_attempts")]
    pub retry_attempts: u32,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            model: default_model(),
            block_streaming: false,
            retry_attempts: default_retry_attempts(),
        }
    }
}

/// Per-session lane queueing defaults — overridable per session via `/queue`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueConfig {
    #[serde(default = "default_queue_mode")]
    pub mode: String,
    #[serde(default = "default_queue_cap")]
    pub cap: usize,
    #[serde(default = "default_drop_policy")]
    pub drop: String,
    #[serde(default = "default_debounce_ms")]
    pub debounce_ms: u64,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            mode: default_queue_mode(),
            cap: default_queue_cap(),
            drop: default_drop_policy(),
            debounce_ms: default_debounce_ms(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebhooksConfig {
    #[serde(default)]
    pub enabled: bool,
    /// Hard cap on a webhook request body.
    #[serde(default = "default_webhook_max_body")]
    pub max_body_bytes: usize,
    /// Give up reading the body after this long.
    #[serde(default = "default_webhook_read_timeout")]
    pub read_timeout_ms: u64,
    #[serde(default)]
    pub targets: Vec<WebhookTarget>,
}

impl Default for WebhooksConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            max_body_bytes: default_webhook_max_body(),
            read_timeout_ms: default_webhook_read_timeout(),
            targets: Vec::new(),
        }
    }
}

/// One webhook ingress target: a channel plugin path plus its bearer token.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebhookTarget {
    pub name: String,
    pub channel: String,
    pub token: Option<String>,
}

/// Outbound media safety: local paths must land under one of `allow_roots`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MediaConfig {
    #[serde(default)]
    pub allow_roots: Vec<String>,
    #[serde(default = "default_media_max_bytes")]
    pub max_bytes: u64,
}

impl Default for MediaConfig {
    fn default() -> Self {
        Self {
            allow_roots: Vec::new(),
            max_bytes: default_media_max_bytes(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecConfig {
    /// Approval records expire after this long without a decision.
    #[serde(default = "default_approval_ttl")]
    pub approval_ttl_ms: u64,
    /// Sub-exec combined output cap before truncation.
    #[serde(default = "default_exec_output_cap")]
    pub output_cap_bytes: usize,
    /// Sub-exec wall-clock budget before SIGKILL.
    #[serde(default = "default_exec_timeout")]
    pub timeout_ms: u64,
    /// Directories an allowlisted argv[0] may resolve into.
    #[serde(default = "default_safe_bins")]
    pub safe_bins: Vec<String>,
}

impl Default for ExecConfig {
    fn default() -> Self {
        Self {
            approval_ttl_ms: default_approval_ttl(),
            output_cap_bytes: default_exec_output_cap(),
            timeout_ms: default_exec_timeout(),
            safe_bins: default_safe_bins(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RestartConfig {
    /// Pause between the restart decision and the first gate poll.
    #[serde(default)]
    pub delay_ms: u64,
    /// Absolute ceiling on how long the gate may defer a restart.
    #[serde(default = "default_restart_max_wait")]
    pub max_wait_ms: u64,
}

impl Default for RestartConfig {
    fn default() -> Self {
        Self {
            delay_ms: 0,
            max_wait_ms: default_restart_max_wait(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateConfig {
    /// Root for sessions, transcripts, approvals, and the restart sentinel.
    /// Defaults to `~/.crosstalk`.
    pub dir: Option<String>,
}

impl Default for StateConfig {
    fn default() -> Self {
        Self { dir: None }
    }
}

impl StateConfig {
    pub fn resolve_dir(&self) -> PathBuf {
        if let Some(dir) = &self.dir {
            return PathBuf::from(dir);
        }
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".crosstalk")
    }
}

impl CrosstalkConfig {
    /// Load config: explicit path > CROSSTALK_CONFIG env > ~/.crosstalk/crosstalk.toml.
    ///
    /// Env overrides use the `CROSSTALK_` prefix with `__` as the section
    /// separator, e.g. `CROSSTALK_GATEWAY__PORT=9000`.
    pub fn load(path: Option<&str>) -> Result<Self> {
        let path = match path {
            Some(p) => PathBuf::from(p),
            None => match std::env::var("CROSSTALK_CONFIG") {
                Ok(p) => PathBuf::from(p),
                Err(_) => StateConfig::default().resolve_dir().join("crosstalk.toml"),
            },
        };

        Figment::new()
            .merge(Toml::file(&path))
            .merge(Env::prefixed("CROSSTALK_").split("__"))
            .extract()
            .map_err(|e| GatewayError::InvalidRequest(format!("config load failed: {e}")))
    }
}

fn default_port() -> u16 {
    DEFAULT_PORT
}

fn default_bind() -> String {
    DEFAULT_BIND.to_string()
}

fn default_model() -> String {
    "claude-sonnet-4-6".to_string()
}

fn default_retry_attempts() -> u32 {
    3
}

fn default_queue_mode() -> String {
    "collect".to_string()
}

fn default_queue_cap() -> usize {
    20
}

fn default_drop_policy() -> String {
    "old".to_string()
}

fn default_debounce_ms() -> u64 {
    DEBOUNCE_DEFAULT_MS
}

fn default_webhook_max_body() -> usize {
    1024 * 1024
}

fn default_webhook_read_timeout() -> u64 {
    10_000
}

fn default_media_max_bytes() -> u64 {
    32 * 1024 * 1024
}

fn default_approval_ttl() -> u64 {
    APPROVAL_TTL_MS
}

fn default_exec_output_cap() -> usize {
    200 * 1024
}

fn default_exec_timeout() -> u64 {
    120_000
}

fn default_safe_bins() -> Vec<String> {
    vec![
        "/bin".to_string(),
        "/usr/bin".to_string(),
        "/usr/local/bin".to_string(),
        "/opt/homebrew/bin".to_string(),
    ]
}

fn default_rate_max() -> u32 {
    10
}

fn default_rate_window() -> u64 {
    60
}

fn default_restart_max_wait() -> u64 {
    60_000
}
