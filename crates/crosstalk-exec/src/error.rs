use thiserror::Error;

/// Rejection reasons for a `system.run` mediated by the approval ledger.
/// Each maps to a distinct wire detail code.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ApprovalError {
    #[error("approval override flags present but no runId")]
    MissingRunId,

    #[error("no approval record with id '{0}'")]
    UnknownApprovalId(String),

    #[error("approval '{0}' has expired")]
    Expired(String),

    #[error("approval '{0}' belongs to a different device")]
    DeviceMismatch(String),

    #[error("approval '{0}' does not match the requested command")]
    RequestMismatch(String),

    #[error("approval '{0}' has no decision yet")]
    ApprovalRequired(String),

    #[error("rawCommand does not match command tokens")]
    RawCommandMismatch,

    #[error("resolving approvals requires the operator.approvals capability")]
    NotPermitted,

    #[error("approval '{0}' already resolved")]
    AlreadyResolved(String),
}

impl ApprovalError {
    /// Wire detail code (`error.details.code`).
    pub fn code(&self) -> &'static str {
        match self {
            ApprovalError::MissingRunId => "MISSING_RUN_ID",
            ApprovalError::UnknownApprovalId(_) => "UNKNOWN_APPROVAL_ID",
            ApprovalError::Expired(_) => "APPROVAL_EXPIRED",
            ApprovalError::DeviceMismatch(_) => "APPROVAL_DEVICE_MISMATCH",
            ApprovalError::RequestMismatch(_) => "APPROVAL_REQUEST_MISMATCH",
            ApprovalError::ApprovalRequired(_) => "APPROVAL_REQUIRED",
            ApprovalError::RawCommandMismatch => "RAW_COMMAND_MISMATCH",
            ApprovalError::NotPermitted => "NOT_PERMITTED",
            ApprovalError::AlreadyResolved(_) => "APPROVAL_ALREADY_RESOLVED",
        }
    }
}

#[derive(Debug, Error)]
pub enum ExecError {
    #[error("spawn failed: {0}")]
    Spawn(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("archive entry rejected: {0}")]
    ArchiveEntry(String),

    #[error("extraction failed: {0}")]
    Extract(String),

    #[error("media path rejected: {0}")]
    MediaRejected(String),

    #[error("media too large: {size} bytes (max {max})")]
    MediaTooLarge { size: u64, max: u64 },
}

pub type Result<T> = std::result::Result<T, ExecError>;
