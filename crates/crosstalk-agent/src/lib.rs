//! The agent seam: the gateway invokes an opaque long-running agent and
//! consumes its stream through a capability struct. Failure classification
//! and transient retry live here; everything about models and tools is on
//! the far side of [`runner::AgentRunner`].

pub mod classify;
pub mod error;
pub mod retry;
pub mod runner;

pub use error::AgentError;
pub use runner::{AgentEvent, AgentRunner, RunHooks, RunOutcome, RunRequest};

/// Terminal payload text that suppresses outbound delivery while retaining
/// all bookkeeping.
pub const NO_REPLY: &str = "NO_REPLY";
