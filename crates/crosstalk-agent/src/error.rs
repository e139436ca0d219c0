use thiserror::Error;

#[derive(Debug, Error, Clone)]
pub enum AgentError {
    /// The session's context window cannot hold the turn. The caller resets
    /// the session and replies visibly.
    #[error("Context window exhausted: {0}")]
    ContextOverflow(String),

    /// Persistent role-alternation conflict in the transcript.
    #[error("Message ordering conflict: {0}")]
    RoleOrdering(String),

    #[error("Transcript corrupted: {0}")]
    CorruptTranscript(String),

    /// Network-level failure worth retrying with backoff.
    #[error("Transient transport failure: {0}")]
    Transient(String),

    #[error("Run cancelled")]
    Cancelled,

    #[error("Agent failure: {0}")]
    Other(String),
}

impl AgentError {
    pub fn is_transient(&self) -> bool {
        matches!(self, AgentError::Transient(_))
    }
}
