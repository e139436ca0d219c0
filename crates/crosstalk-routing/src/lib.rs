//! Session orchestration: inbound coalescing, per-session lane scheduling,
//! the outbound reply dispatcher, control-command classification, and the
//! restart gate.

pub mod commands;
pub mod debounce;
pub mod dispatcher;
pub mod lane;
pub mod queue;
pub mod restart;

pub use debounce::{Debouncer, DebouncerOptions};
pub use dispatcher::{
    total_pending_replies, DispatcherRegistry, ReplyContext, ReplyDispatcher, SendResult,
};
pub use lane::{Lane, LaneExecutor, LaneJob, LanePhase, LaneScheduler, SubmitOutcome};
pub use queue::{DropPolicy, QueueMode, QueuePatch, QueueSettings};
pub use restart::{schedule_restart, RestartGate, RestartSentinel};
