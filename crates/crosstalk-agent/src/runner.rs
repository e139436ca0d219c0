use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crosstalk_channels::types::ReplyPayload;

use crate::error::AgentError;

/// Events surfaced by a run beyond reply payloads: tool lifecycle and
/// anything else an operator UI may want to mirror.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum AgentEvent {
    ToolStarted { name: String },
    ToolFinished { name: String },
    Compaction { count: u32 },
    Other { name: String, payload: serde_json::Value },
}

/// Terminal result of one agent invocation.
#[derive(Debug, Clone, Default)]
pub struct RunOutcome {
    /// Final reply text; `NO_REPLY` suppresses delivery downstream.
    pub text: Option<String>,
    pub input_tokens: Option<u64>,
    pub output_tokens: Option<u64>,
    pub total_tokens: Option<u64>,
    /// Texts the agent already delivered itself through a messaging tool —
    /// the dispatcher dedupes final replies against these.
    pub tool_sent_texts: Vec<String>,
    /// Tool output captured before a steering cancellation; folded into the
    /// steered run's prompt in steer+backlog mode.
    pub partial_tool_output: Option<String>,
}

/// Capability set handed to a run — a struct of function-typed fields, not
/// an interface, so the runner has no back-reference into the scheduler.
#[derive(Clone)]
pub struct RunHooks {
    pub on_partial_reply: Option<Arc<dyn Fn(ReplyPayload) + Send + Sync>>,
    pub on_block_reply: Option<Arc<dyn Fn(ReplyPayload) + Send + Sync>>,
    pub on_tool_result: Option<Arc<dyn Fn(String) + Send + Sync>>,
    pub on_assistant_message_start: Option<Arc<dyn Fn() + Send + Sync>>,
    pub on_reasoning_stream: Option<Arc<dyn Fn(String) + Send + Sync>>,
    pub on_agent_event: Option<Arc<dyn Fn(AgentEvent) + Send + Sync>>,
    /// Polled whenever tool events would be shown; lets `/verbose` toggle
    /// mid-run.
    pub should_emit_tool_result: Arc<dyn Fn() -> bool + Send + Sync>,
    /// The lane-scoped cancellation signal.
    pub abort: CancellationToken,
}

impl RunHooks {
    /// Hooks that observe nothing — used by control commands and tests.
    pub fn silent(abort: CancellationToken) -> Self {
        Self {
            on_partial_reply: None,
            on_block_reply: None,
            on_tool_result: None,
            on_assistant_message_start: None,
            on_reasoning_stream: None,
            on_agent_event: None,
            should_emit_tool_result: Arc::new(|| false),
            abort,
        }
    }
}

impl std::fmt::Debug for RunHooks {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RunHooks")
            .field("aborted", &self.abort.is_cancelled())
            .finish()
    }
}

/// One unit of work for the runner.
#[derive(Debug, Clone)]
pub struct RunRequest {
    /// Fully assembled prompt, envelope markers included.
    pub prompt: String,
    /// Agent-side conversation id (transcript address).
    pub session_id: String,
    pub agent_id: String,
    pub model: Option<String>,
}

/// The opaque long-running agent. The gateway invokes it and consumes its
/// stream through [`RunHooks`]; everything about models, tools, and
/// transcript writing lives behind this seam.
#[async_trait]
pub trait AgentRunner: Send + Sync {
    async fn run(&self, request: RunRequest, hooks: RunHooks) -> Result<RunOutcome, AgentError>;
}
