use serde::{Deserialize, Serialize};

use crate::error::{Result, SessionError};

/// Conversation scope segment of a session key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum KeyScope {
    Dm,
    Channel,
    Group,
    Topic,
}

impl KeyScope {
    pub fn as_str(&self) -> &'static str {
        match self {
            KeyScope::Dm => "dm",
            KeyScope::Channel => "channel",
            KeyScope::Group => "group",
            KeyScope::Topic => "topic",
        }
    }

    fn parse(s: &str) -> Option<Self> {
        match s {
            "dm" => Some(KeyScope::Dm),
            "channel" => Some(KeyScope::Channel),
            "group" => Some(KeyScope::Group),
            "topic" => Some(KeyScope::Topic),
            _ => None,
        }
    }
}

/// Marker used for the optional trailing thread segment. `topic` behaves
/// identically to `thread`; only the tag differs (Telegram forum topics vs
/// everything else).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ThreadMarker {
    Thread,
    Topic,
}

impl ThreadMarker {
    pub fn as_str(&self) -> &'static str {
        match self {
            ThreadMarker::Thread => "thread",
            ThreadMarker::Topic => "topic",
        }
    }
}

/// Structured route identifier for a session.
///
/// Wire grammar:
/// `agent:<agentId>:<channel>:<scope>:<scope-id>[:thread:<tid>|:topic:<tid>]`
///
/// The scope id may itself contain colons (iMessage chat GUIDs do); the
/// trailing thread segment is detected from the end of the string.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SessionKey {
    pub agent_id: String,
    pub channel: String,
    pub scope: KeyScope,
    pub scope_id: String,
    pub thread: Option<(ThreadMarker, String)>,
}

impl SessionKey {
    pub fn new(
        agent_id: impl Into<String>,
        channel: impl Into<String>,
        scope: KeyScope,
        scope_id: impl Into<String>,
    ) -> Self {
        Self {
            agent_id: agent_id.into(),
            channel: channel.into(),
            scope,
            scope_id: scope_id.into(),
            thread: None,
        }
    }

    pub fn with_thread(mut self, marker: ThreadMarker, tid: impl Into<String>) -> Self {
        self.thread = Some((marker, tid.into()));
        self
    }

    /// Return the canonical wire-format string.
    pub fn format(&self) -> String {
        let base = format!(
            "agent:{}:{}:{}:{}",
            self.agent_id,
            self.channel,
            self.scope.as_str(),
            self.scope_id
        );
        match &self.thread {
            Some((marker, tid)) => format!("{}:{}:{}", base, marker.as_str(), tid),
            None => base,
        }
    }

    /// Parse a wire-format key back into its parts.
    pub fn parse(s: &str) -> Result<Self> {
        let segments: Vec<&str> = s.split(':').collect();
        if segments.len() < 5 || segments[0] != "agent" {
            return Err(SessionError::InvalidKey(format!(
                "expected agent:<id>:<channel>:<scope>:<scope-id>: {s}"
            )));
        }

        let agent_id = segments[1];
        let channel = segments[2];
        let scope = KeyScope::parse(segments[3]).ok_or_else(|| {
            SessionError::InvalidKey(format!("unknown scope '{}': {s}", segments[3]))
        })?;

        // Trailing ":thread:<tid>" / ":topic:<tid>" — scope ids may contain
        // colons, so only the last two segments are candidates.
        let (scope_end, thread) = if segments.len() >= 7 {
            match segments[segments.len() - 2] {
                "thread" => (
                    segments.len() - 2,
                    Some((ThreadMarker::Thread, segments[segments.len() - 1].to_string())),
                ),
                "topic" => (
                    segments.len() - 2,
                    Some((ThreadMarker::Topic, segments[segments.len() - 1].to_string())),
                ),
                _ => (segments.len(), None),
            }
        } else {
            (segments.len(), None)
        };

        let scope_id = segments[4..scope_end].join(":");

        if agent_id.is_empty() || channel.is_empty() || scope_id.is_empty() {
            return Err(SessionError::InvalidKey(format!(
                "key segments must not be empty: {s}"
            )));
        }
        if let Some((_, tid)) = &thread {
            if tid.is_empty() {
                return Err(SessionError::InvalidKey(format!(
                    "thread id must not be empty: {s}"
                )));
            }
        }

        Ok(Self {
            agent_id: agent_id.to_string(),
            channel: channel.to_string(),
            scope,
            scope_id,
            thread,
        })
    }

    pub fn thread_id(&self) -> Option<&str> {
        self.thread.as_ref().map(|(_, tid)| tid.as_str())
    }
}

impl std::fmt::Display for SessionKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.format())
    }
}

/// Durable per-session metadata. The store is the only authority for
/// mapping session-key → `session_id`; transcripts are addressed only via
/// `session_id`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    /// Opaque agent-side conversation id (UUIDv7 — time-sortable).
    pub session_id: String,
    /// RFC3339 timestamp of the last update.
    pub updated_at: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub total_tokens: Option<u64>,
    /// Whether `total_tokens` reflects the latest turn or a stale estimate.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub total_tokens_fresh: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub input_tokens: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output_tokens: Option<u64>,
    #[serde(default)]
    pub compaction_count: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub memory_flush_at: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub memory_flush_compaction_count: Option<u32>,
    #[serde(default)]
    pub verbose_level: u8,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_channel: Option<String>,
    /// Last delivery address on that channel (chat id, user id, …).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_to: Option<String>,
    /// Transcript path, when one has been written.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_file: Option<String>,
    /// Per-session queue overrides set via `/queue`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub queue: Option<serde_json::Value>,
}

impl Session {
    pub fn fresh() -> Self {
        Self {
            session_id: uuid::Uuid::now_v7().to_string(),
            updated_at: chrono::Utc::now().to_rfc3339(),
            total_tokens: None,
            total_tokens_fresh: None,
            input_tokens: None,
            output_tokens: None,
            compaction_count: 0,
            memory_flush_at: None,
            memory_flush_compaction_count: None,
            verbose_level: 0,
            last_channel: None,
            last_to: None,
            session_file: None,
            queue: None,
        }
    }

    pub fn touch(&mut self) {
        self.updated_at = chrono::Utc::now().to_rfc3339();
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roundtrip_simple_key() {
        let key = SessionKey::new("main", "telegram", KeyScope::Dm, "12345");
        let s = key.format();
        assert_eq!(s, "agent:main:telegram:dm:12345");
        let parsed = SessionKey::parse(&s).expect("parse failed");
        assert_eq!(parsed, key);
    }

    #[test]
    fn roundtrip_thread_key() {
        let key = SessionKey::new("main", "discord", KeyScope::Channel, "c1")
            .with_thread(ThreadMarker::Thread, "t9");
        let s = key.format();
        assert_eq!(s, "agent:main:discord:channel:c1:thread:t9");
        let parsed = SessionKey::parse(&s).expect("parse failed");
        assert_eq!(parsed.thread_id(), Some("t9"));
    }

    #[test]
    fn topic_marker_round_trips() {
        let key = SessionKey::new("main", "telegram", KeyScope::Group, "g1")
            .with_thread(ThreadMarker::Topic, "44");
        let parsed = SessionKey::parse(&key.format()).expect("parse failed");
        assert_eq!(parsed.thread, Some((ThreadMarker::Topic, "44".to_string())));
    }

    #[test]
    fn scope_id_may_contain_colons() {
        let key = SessionKey::new(
            "main",
            "imessage",
            KeyScope::Group,
            "iMessage;+;chat123:456",
        );
        let parsed = SessionKey::parse(&key.format()).expect("parse failed");
        assert_eq!(parsed.scope_id, "iMessage;+;chat123:456");
    }

    #[test]
    fn missing_segments_are_rejected() {
        assert!(SessionKey::parse("agent:main:telegram:dm").is_err());
        assert!(SessionKey::parse("user:main:telegram:dm:1").is_err());
        assert!(SessionKey::parse("agent:main:telegram:nope:1").is_err());
        assert!(SessionKey::parse("agent::telegram:dm:1").is_err());
    }
}
