//! Connection authentication and auth-failure rate limiting.
//!
//! Token and password modes compare shared secrets in constant time (both
//! sides are hashed first, so the byte comparison runs on fixed-length
//! unpredictable digests). Trusted-proxy mode trusts forwarded identity
//! headers only from configured proxy peers. A signed tailscale identity
//! header set can satisfy token mode when enabled.

use std::collections::{HashMap, HashSet};
use std::net::IpAddr;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use sha2::{Digest, Sha256};
use tracing::warn;

use crosstalk_core::config::{AuthConfig, AuthMode, RateLimitConfig};
use crosstalk_core::types::Capability;
use crosstalk_protocol::handshake::AuthPayload;

/// Why authentication failed — distinct codes so operators can tell a
/// missing secret from a misconfigured server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthFailure {
    TokenMissing,
    TokenMissingConfig,
    TokenMismatch,
    PasswordMissing,
    PasswordMissingConfig,
    PasswordMismatch,
    ProxyNotTrusted,
    ProxyHeaderMissing,
    UserNotAllowed,
    ModeMismatch,
}

impl AuthFailure {
    pub fn code(&self) -> &'static str {
        match self {
            AuthFailure::TokenMissing => "token_missing",
            AuthFailure::TokenMissingConfig => "token_missing_config",
            AuthFailure::TokenMismatch => "token_mismatch",
            AuthFailure::PasswordMissing => "password_missing",
            AuthFailure::PasswordMissingConfig => "password_missing_config",
            AuthFailure::PasswordMismatch => "password_mismatch",
            AuthFailure::ProxyNotTrusted => "proxy_not_trusted",
            AuthFailure::ProxyHeaderMissing => "proxy_header_missing",
            AuthFailure::UserNotAllowed => "user_not_allowed",
            AuthFailure::ModeMismatch => "auth_mode_mismatch",
        }
    }
}

/// Constant-time equality via digest comparison.
pub fn timing_safe_eq(a: &str, b: &str) -> bool {
    let da = Sha256::digest(a.as_bytes());
    let db = Sha256::digest(b.as_bytes());
    da == db
}

/// Strip an optional `Bearer ` prefix from a presented token.
pub fn strip_bearer(token: &str) -> &str {
    token.strip_prefix("Bearer ").unwrap_or(token).trim()
}

/// Request-side facts the verifier needs beyond the payload itself.
#[derive(Debug, Clone, Default)]
pub struct AuthContext {
    pub peer_ip: Option<IpAddr>,
    /// Lower-cased header map from the HTTP upgrade request.
    pub headers: HashMap<String, String>,
}

impl AuthContext {
    /// Proxy-aware client ip: `x-forwarded-for` is honored only when the
    /// immediate peer is itself a trusted proxy.
    pub fn client_ip(&self, trusted_proxies: &[String]) -> Option<IpAddr> {
        let peer = self.peer_ip?;
        let peer_trusted = trusted_proxies.iter().any(|p| p == &peer.to_string());
        if peer_trusted {
            if let Some(forwarded) = self.headers.get("x-forwarded-for") {
                if let Some(first) = forwarded.split(',').next() {
                    if let Ok(ip) = first.trim().parse() {
                        return Some(ip);
                    }
                }
            }
        }
        Some(peer)
    }

    fn has_tailscale_identity(&self) -> bool {
        self.headers.contains_key("tailscale-user-login")
            && self.headers.contains_key("tailscale-user-name")
    }
}

/// Verify a connect payload. Returns the capability set granted to the
/// connection.
pub fn verify_auth(
    payload: &AuthPayload,
    config: &AuthConfig,
    ctx: &AuthContext,
) -> Result<HashSet<Capability>, AuthFailure> {
    match config.mode {
        AuthMode::None => Ok(operator_caps()),

        AuthMode::Token => {
            // a signed tailscale identity can stand in for the token
            if config.allow_tailscale && ctx.has_tailscale_identity() {
                return Ok(operator_caps());
            }
            let configured = config
                .token
                .as_deref()
                .ok_or(AuthFailure::TokenMissingConfig)?;
            let presented = match payload {
                AuthPayload::Token { token } => strip_bearer(token),
                AuthPayload::None => return Err(AuthFailure::TokenMissing),
                _ => return Err(AuthFailure::ModeMismatch),
            };
            if presented.is_empty() {
                return Err(AuthFailure::TokenMissing);
            }
            if timing_safe_eq(presented, configured) {
                Ok(operator_caps())
            } else {
                Err(AuthFailure::TokenMismatch)
            }
        }

        AuthMode::Password => {
            let configured = config
                .password
                .as_deref()
                .ok_or(AuthFailure::PasswordMissingConfig)?;
            let presented = match payload {
                AuthPayload::Password { password } => password.as_str(),
                AuthPayload::None => return Err(AuthFailure::PasswordMissing),
                _ => return Err(AuthFailure::ModeMismatch),
            };
            if presented.is_empty() {
                return Err(AuthFailure::PasswordMissing);
            }
            if timing_safe_eq(presented, configured) {
                Ok(operator_caps())
            } else {
                Err(AuthFailure::PasswordMismatch)
            }
        }

        AuthMode::TrustedProxy => {
            let peer = ctx.peer_ip.ok_or(AuthFailure::ProxyNotTrusted)?;
            let trusted = config
                .trusted_proxies
                .iter()
                .any(|p| p == &peer.to_string());
            if !trusted {
                return Err(AuthFailure::ProxyNotTrusted);
            }

            let user_header = config
                .user_header
                .as_deref()
                .unwrap_or("x-forwarded-user")
                .to_lowercase();
            let user = ctx
                .headers
                .get(&user_header)
                .filter(|v| !v.is_empty())
                .ok_or(AuthFailure::ProxyHeaderMissing)?;

            for required in &config.required_headers {
                if !ctx.headers.contains_key(&required.to_lowercase()) {
                    return Err(AuthFailure::ProxyHeaderMissing);
                }
            }

            if !config.allow_users.is_empty() && !config.allow_users.contains(user) {
                warn!(user = %user, "trusted-proxy user not in allow list");
                return Err(AuthFailure::UserNotAllowed);
            }

            // proxied identities drive sessions but do not resolve approvals
            let mut caps = HashSet::new();
            caps.insert(Capability::OperatorRead);
            caps.insert(Capability::OperatorWrite);
            Ok(caps)
        }
    }
}

fn operator_caps() -> HashSet<Capability> {
    let mut caps = HashSet::new();
    caps.insert(Capability::OperatorRead);
    caps.insert(Capability::OperatorWrite);
    caps.insert(Capability::OperatorApprovals);
    caps
}

/// Outcome of a rate-limit check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RateDecision {
    pub allowed: bool,
    pub remaining: u32,
    pub retry_after_ms: u64,
}

/// Sliding-window failure counter keyed by `(scope, ip)`.
pub struct RateLimiter {
    config: RateLimitConfig,
    hits: Mutex<HashMap<String, Vec<Instant>>>,
}

impl RateLimiter {
    pub fn new(config: RateLimitConfig) -> Self {
        Self {
            config,
            hits: Mutex::new(HashMap::new()),
        }
    }

    fn window(&self) -> Duration {
        Duration::from_secs(self.config.window_secs)
    }

    pub fn check(&self, ip: &str, scope: &str) -> RateDecision {
        let key = format!("{scope}:{ip}");
        let now = Instant::now();
        let window = self.window();
        let mut hits = self.hits.lock().unwrap();
        let bucket = hits.entry(key).or_default();
        bucket.retain(|at| now.duration_since(*at) < window);

        let used = bucket.len() as u32;
        if used >= self.config.max_attempts {
            let oldest = bucket.first().copied().unwrap_or(now);
            let retry_after = window.saturating_sub(now.duration_since(oldest));
            return RateDecision {
                allowed: false,
                remaining: 0,
                retry_after_ms: retry_after.as_millis() as u64,
            };
        }
        RateDecision {
            allowed: true,
            remaining: self.config.max_attempts - used,
            retry_after_ms: 0,
        }
    }

    /// Record one auth failure against the window.
    pub fn record_failure(&self, ip: &str, scope: &str) {
        let key = format!("{scope}:{ip}");
        self.hits.lock().unwrap().entry(key).or_default().push(Instant::now());
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn token_config(token: &str) -> AuthConfig {
        AuthConfig {
            mode: AuthMode::Token,
            token: Some(token.to_string()),
            ..AuthConfig::default()
        }
    }

    #[test]
    fn token_auth_accepts_exact_and_bearer_forms() {
        let config = token_config("s3cret");
        let ctx = AuthContext::default();

        let ok = verify_auth(
            &AuthPayload::Token {
                token: "s3cret".to_string(),
            },
            &config,
            &ctx,
        );
        assert!(ok.is_ok());
        assert!(ok.unwrap().contains(&Capability::OperatorApprovals));

        assert!(verify_auth(
            &AuthPayload::Token {
                token: "Bearer s3cret".to_string(),
            },
            &config,
            &ctx,
        )
        .is_ok());
    }

    #[test]
    fn token_failures_are_distinguished() {
        let ctx = AuthContext::default();

        let missing_config = AuthConfig {
            mode: AuthMode::Token,
            token: None,
            ..AuthConfig::default()
        };
        assert_eq!(
            verify_auth(
                &AuthPayload::Token {
                    token: "x".to_string()
                },
                &missing_config,
                &ctx
            )
            .unwrap_err()
            .code(),
            "token_missing_config"
        );

        let config = token_config("right");
        assert_eq!(
            verify_auth(&AuthPayload::None, &config, &ctx)
                .unwrap_err()
                .code(),
            "token_missing"
        );
        assert_eq!(
            verify_auth(
                &AuthPayload::Token {
                    token: "wrong".to_string()
                },
                &config,
                &ctx
            )
            .unwrap_err()
            .code(),
            "token_mismatch"
        );
    }

    #[test]
    fn tailscale_identity_satisfies_token_mode_when_enabled() {
        let mut config = token_config("s3cret");
        config.allow_tailscale = true;

        let mut ctx = AuthContext::default();
        ctx.headers
            .insert("tailscale-user-login".to_string(), "alice@ts.net".to_string());
        ctx.headers
            .insert("tailscale-user-name".to_string(), "Alice".to_string());

        assert!(verify_auth(&AuthPayload::None, &config, &ctx).is_ok());

        // disabled → identity headers are ignored
        config.allow_tailscale = false;
        assert!(verify_auth(&AuthPayload::None, &config, &ctx).is_err());
    }

    #[test]
    fn trusted_proxy_checks_peer_headers_and_allow_list() {
        let config = AuthConfig {
            mode: AuthMode::TrustedProxy,
            trusted_proxies: vec!["10.0.0.1".to_string()],
            user_header: Some("x-forwarded-user".to_string()),
            required_headers: vec!["x-proxy-sig".to_string()],
            allow_users: vec!["alice".to_string()],
            ..AuthConfig::default()
        };
        let payload = AuthPayload::TrustedProxy {
            forwarded_user: "alice".to_string(),
        };

        // untrusted peer
        let mut ctx = AuthContext {
            peer_ip: Some("10.9.9.9".parse().unwrap()),
            headers: HashMap::new(),
        };
        assert_eq!(
            verify_auth(&payload, &config, &ctx).unwrap_err().code(),
            "proxy_not_trusted"
        );

        // trusted peer, missing headers
        ctx.peer_ip = Some("10.0.0.1".parse().unwrap());
        assert_eq!(
            verify_auth(&payload, &config, &ctx).unwrap_err().code(),
            "proxy_header_missing"
        );

        // all headers present, wrong user
        ctx.headers
            .insert("x-forwarded-user".to_string(), "mallory".to_string());
        ctx.headers
            .insert("x-proxy-sig".to_string(), "sig".to_string());
        assert_eq!(
            verify_auth(&payload, &config, &ctx).unwrap_err().code(),
            "user_not_allowed"
        );

        // allowed user — and approvals capability is withheld
        ctx.headers
            .insert("x-forwarded-user".to_string(), "alice".to_string());
        let caps = verify_auth(&payload, &config, &ctx).unwrap();
        assert!(caps.contains(&Capability::OperatorWrite));
        assert!(!caps.contains(&Capability::OperatorApprovals));
    }

    #[test]
    fn client_ip_uses_forwarded_only_from_trusted_peer() {
        let trusted = vec!["10.0.0.1".to_string()];
        let mut ctx = AuthContext {
            peer_ip: Some("10.0.0.1".parse().unwrap()),
            headers: HashMap::new(),
        };
        ctx.headers
            .insert("x-forwarded-for".to_string(), "203.0.113.7, 10.0.0.1".to_string());
        assert_eq!(
            ctx.client_ip(&trusted),
            Some("203.0.113.7".parse().unwrap())
        );

        // same headers from an untrusted peer: the peer address wins
        ctx.peer_ip = Some("10.9.9.9".parse().unwrap());
        assert_eq!(ctx.client_ip(&trusted), Some("10.9.9.9".parse().unwrap()));
    }

    #[test]
    fn rate_limiter_counts_failures_within_window() {
        let limiter = RateLimiter::new(RateLimitConfig {
            max_attempts: 3,
            window_secs: 60,
        });

        assert!(limiter.check("1.2.3.4", "connect").allowed);
        for _ in 0..3 {
            limiter.record_failure("1.2.3.4", "connect");
        }
        let decision = limiter.check("1.2.3.4", "connect");
        assert!(!decision.allowed);
        assert_eq!(decision.remaining, 0);
        assert!(decision.retry_after_ms > 0);

        // other scopes and ips are unaffected
        assert!(limiter.check("1.2.3.4", "webhook").allowed);
        assert!(limiter.check("5.6.7.8", "connect").allowed);
    }
}
