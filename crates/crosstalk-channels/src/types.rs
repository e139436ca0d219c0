use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Who sent an inbound message, as the adapter knows them.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Sender {
    /// Stable platform-native identifier.
    pub id: String,
    pub display_name: Option<String>,
    /// The receiving account on multi-account bridges (e.g. two SIM slots).
    pub account_id: Option<String>,
}

impl Sender {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            display_name: None,
            account_id: None,
        }
    }
}

/// Conversation scope of an envelope.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase", tag = "kind", content = "id")]
pub enum Scope {
    /// One-on-one conversation.
    Dm,
    /// Named channel (Discord/Slack style).
    Channel(String),
    /// Group chat with a group id.
    Group(String),
}

impl Scope {
    pub fn id(&self) -> Option<&str> {
        match self {
            Scope::Dm => None,
            Scope::Channel(id) | Scope::Group(id) => Some(id),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AttachmentKind {
    Image,
    Audio,
    Video,
    Sticker,
    File,
}

/// One media item attached to an envelope.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Attachment {
    pub kind: AttachmentKind,
    /// Provider-supplied local path.
    pub path: Option<String>,
    pub url: Option<String>,
    /// Declared MIME from the provider. Media-understanding decisions key
    /// off this field only — never a sniffed or fallback MIME.
    pub mime: Option<String>,
    /// Position within the original message; re-indexed globally when
    /// envelopes are coalesced so consumers can still address attachments.
    pub index: usize,
    /// Adapter-provided transcript for audio attachments, when available.
    pub transcript: Option<String>,
}

/// Context of the message this envelope replies to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplyRef {
    pub id: String,
    pub body: Option<String>,
    pub sender: Option<String>,
}

/// One inbound unit after normalization.
///
/// Carries enough to reconstruct a deterministic coalesce key without
/// re-reading adapter state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    /// Originating channel tag (e.g. "imessage", "telegram").
    pub channel: String,
    pub sender: Sender,
    pub scope: Scope,
    /// Topic/thread id within the scope, when the platform has threads.
    pub thread_id: Option<String>,
    pub text: String,
    pub attachments: Vec<Attachment>,
    pub reply_to: Option<ReplyRef>,
    pub received_at: DateTime<Utc>,
    /// Authored by the bot itself — cached but never processed.
    pub from_me: bool,
    /// Set on link-preview/sticker carrier events.
    pub balloon_bundle_id: Option<String>,
    /// The message a balloon carrier decorates.
    pub associated_message_id: Option<String>,
    pub was_mentioned: bool,
    /// Stable per-provider message id, when the platform has one.
    pub message_id: Option<String>,
    // Scope-key sources, first non-empty wins: chat_guid, chat_identifier, chat_id.
    pub chat_guid: Option<String>,
    pub chat_identifier: Option<String>,
    pub chat_id: Option<String>,
}

impl Envelope {
    /// Minimal envelope for tests and synthetic (scheduler-built) messages.
    pub fn text_message(channel: &str, sender_id: &str, text: &str) -> Self {
        Self {
            channel: channel.to_string(),
            sender: Sender::new(sender_id),
            scope: Scope::Dm,
            thread_id: None,
            text: text.to_string(),
            attachments: Vec::new(),
            reply_to: None,
            received_at: Utc::now(),
            from_me: false,
            balloon_bundle_id: None,
            associated_message_id: None,
            was_mentioned: false,
            message_id: None,
            chat_guid: None,
            chat_identifier: None,
            chat_id: None,
        }
    }
}

/// How a channel supports reply threading.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ReplyToMode {
    /// Thread to any message id the agent names.
    #[default]
    Any,
    /// Only the originating message can be threaded to; explicit foreign
    /// ids are dropped.
    CurrentOnly,
    /// Channel has no threading; all reply ids are stripped.
    Never,
}

/// Outbound reply payload produced by the agent or a control command.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ReplyPayload {
    pub text: Option<String>,
    pub media_url: Option<String>,
    #[serde(default)]
    pub media_urls: Vec<String>,
    /// Deliver audio media as a voice note where the platform distinguishes.
    #[serde(default)]
    pub audio_as_voice: bool,
    /// Opaque platform-specific extras passed through to the adapter.
    pub channel_data: Option<serde_json::Value>,
    pub reply_to_id: Option<String>,
    /// Set when a `[[reply:current]]` tag asked to thread to the
    /// originating message.
    #[serde(default)]
    pub reply_to_current: bool,
}

impl ReplyPayload {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: Some(text.into()),
            ..Default::default()
        }
    }

    /// A payload is enqueued iff it is renderable.
    pub fn renderable(&self) -> bool {
        self.text.as_deref().is_some_and(|t| !t.trim().is_empty())
            || self.media_url.is_some()
            || !self.media_urls.is_empty()
            || self.channel_data.is_some()
    }
}
