use thiserror::Error;

/// Gateway-wide error taxonomy.
///
/// Every variant maps onto a stable wire code via [`GatewayError::code`] so
/// operator clients can branch on `error.code` instead of parsing messages.
#[derive(Debug, Error)]
pub enum GatewayError {
    /// Caller-fixable request problem: bad shape, stale `baseHash`,
    /// inconsistent command fields. Surfaced immediately, never retried.
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    /// Deterministic unavailability — approval pending/expired, node
    /// offline, dangerous tool denied. Not retried.
    #[error("Unavailable: {0}")]
    Unavailable(String),

    /// Concurrent mutation lost the race (hash mismatch) or the request
    /// matched more than one target.
    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Timeout after {ms}ms: {what}")]
    Timeout { what: String, ms: u64 },

    /// The agent reported that the session's context window cannot hold the
    /// turn. The session is reset by the caller.
    #[error("Context window exhausted")]
    ContextOverflow,

    /// Persistent role-alternation conflict reported by the agent transport.
    #[error("Message ordering conflict in transcript")]
    RoleOrdering,

    #[error("Transcript history is corrupted")]
    CorruptTranscript,

    /// Network-level 5xx/429 from the agent transport. Retried with
    /// jittered backoff by the agent layer before it reaches here.
    #[error("Transient transport failure: {0}")]
    Transient(String),

    #[error("Method not found: {method}")]
    MethodNotFound { method: String },

    #[error("Payload too large: {size} bytes (max {max})")]
    PayloadTooLarge { size: usize, max: usize },

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl GatewayError {
    /// Short error code string sent to clients in WS RES frames.
    pub fn code(&self) -> &'static str {
        match self {
            GatewayError::InvalidRequest(_) => "INVALID_REQUEST",
            GatewayError::Unauthorized(_) => "UNAUTHORIZED",
            GatewayError::Unavailable(_) => "UNAVAILABLE",
            GatewayError::Conflict(_) => "CONFLICT",
            GatewayError::Timeout { .. } => "TIMEOUT",
            GatewayError::ContextOverflow => "CONTEXT_OVERFLOW",
            GatewayError::RoleOrdering => "ROLE_ORDERING",
            GatewayError::CorruptTranscript => "CORRUPT_TRANSCRIPT",
            GatewayError::Transient(_) => "TRANSIENT",
            GatewayError::MethodNotFound { .. } => "METHOD_NOT_FOUND",
            GatewayError::PayloadTooLarge { .. } => "PAYLOAD_TOO_LARGE",
            GatewayError::Serialization(_) => "SERIALIZATION_ERROR",
            GatewayError::Io(_) => "IO_ERROR",
            GatewayError::Internal(_) => "INTERNAL_ERROR",
        }
    }

    /// Whether the caller may usefully retry the same request verbatim.
    pub fn retryable(&self) -> bool {
        matches!(self, GatewayError::Transient(_))
    }
}

pub type Result<T> = std::result::Result<T, GatewayError>;
