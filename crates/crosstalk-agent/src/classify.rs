//! Map raw agent-transport failures onto the error taxonomy.
//!
//! The transport reports everything as message strings; the known failure
//! families are detected by substring, lowercased. Detection here decides
//! recovery downstream: overflow and transcript damage reset the session,
//! transients retry, everything else surfaces as-is.

use crate::error::AgentError;

const CONTEXT_OVERFLOW_MARKERS: &[&str] = &[
    "prompt is too long",
    "context window",
    "context_length_exceeded",
    "maximum context length",
];

const ROLE_ORDERING_MARKERS: &[&str] = &[
    "roles must alternate",
    "unexpected role",
    "message order",
];

const CORRUPT_TRANSCRIPT_MARKERS: &[&str] = &[
    "invalid transcript",
    "corrupt",
    "malformed history",
];

const TRANSIENT_MARKERS: &[&str] = &[
    "rate limit",
    "429",
    "500",
    "502",
    "503",
    "529",
    "overloaded",
    "timed out",
    "timeout",
];

const CONNECTION_CLOSED_MARKER: &str = "connection was closed unexpectedly";

/// Classify a raw failure message from the agent transport.
pub fn classify_failure(message: &str) -> AgentError {
    let lower = message.to_lowercase();

    if CONTEXT_OVERFLOW_MARKERS.iter().any(|m| lower.contains(m)) {
        return AgentError::ContextOverflow(message.to_string());
    }
    if ROLE_ORDERING_MARKERS.iter().any(|m| lower.contains(m)) {
        return AgentError::RoleOrdering(message.to_string());
    }
    if CORRUPT_TRANSCRIPT_MARKERS.iter().any(|m| lower.contains(m)) {
        return AgentError::CorruptTranscript(message.to_string());
    }
    if lower.contains(CONNECTION_CLOSED_MARKER) || TRANSIENT_MARKERS.iter().any(|m| lower.contains(m))
    {
        return AgentError::Transient(message.to_string());
    }

    AgentError::Other(message.to_string())
}

/// User-visible rendition of a classified failure, for the reply channel.
pub fn friendly_reply(error: &AgentError) -> String {
    match error {
        AgentError::ContextOverflow(_) => {
            "Context limit exceeded; session reset. Your next message starts fresh.".to_string()
        }
        AgentError::RoleOrdering(_) => {
            "Message ordering conflict; session reset. Your next message starts fresh.".to_string()
        }
        AgentError::CorruptTranscript(_) => {
            "Conversation history was corrupted; session reset. Your next message starts fresh."
                .to_string()
        }
        AgentError::Transient(raw) if raw.to_lowercase().contains(CONNECTION_CLOSED_MARKER) => {
            format!("LLM connection failed.\n\n> {}", raw)
        }
        AgentError::Transient(raw) => format!("Temporary problem reaching the model: {}", raw),
        AgentError::Cancelled => "Stopped.".to_string(),
        AgentError::Other(raw) => format!("Agent error: {}", raw),
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
