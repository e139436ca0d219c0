//! Exec mediation: the in-memory approval ledger, the on-disk approvals
//! file with its allowlist, sanitized subprocess execution, the archive
//! extraction guard, and outbound media path safety.

pub mod approval;
pub mod approvals_file;
pub mod archive;
pub mod command;
pub mod error;
pub mod media;
pub mod sanitize;
pub mod truncate;

pub use approval::{
    ApprovalDecision, ApprovalHost, ApprovalLedger, ApprovalRecord, CallerIdentity, ExecRequest,
};
pub use approvals_file::{AllowlistEntry, ApprovalsDoc, ApprovalsStore};
pub use error::{ApprovalError, ExecError};
pub use sanitize::{run_sanitized, ExecOutcome, ExecSpec};
