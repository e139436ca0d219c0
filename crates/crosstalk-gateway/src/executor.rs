//! Lane executor: turns a scheduled job into an agent invocation.
//!
//! Owns everything the lane scheduler must not know about: prompt assembly
//! with envelope markers, the reply dispatcher for the run, typing
//! indicators, session bookkeeping, and error recovery (context overflow
//! and transcript damage reset the session with a visible reply).

use std::sync::atomic::Ordering;
use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crosstalk_agent::classify::{classify_failure, friendly_reply};
use crosstalk_agent::error::AgentError;
use crosstalk_agent::retry::retry_transient;
use crosstalk_agent::runner::{AgentRunner, RunHooks, RunOutcome, RunRequest};
use crosstalk_channels::envelope::{format_header, format_media_lines, format_reply_context};
use crosstalk_channels::manager::ChannelRegistry;
use crosstalk_channels::types::{Envelope, ReplyPayload, ReplyToMode, Scope};
use crosstalk_core::config::{AgentConfig, MediaConfig};
use crosstalk_exec::media::vet_media_path;
use crosstalk_routing::lane::{LaneExecutor, LaneJob};
use crosstalk_routing::{DispatcherRegistry, ReplyContext, ReplyDispatcher};
use crosstalk_sessions::{ArchiveReason, Session, SessionKey, SessionStore, TranscriptPaths};

pub struct GatewayExecutor {
    runner: Arc<dyn AgentRunner>,
    channels: Arc<ChannelRegistry>,
    sessions: Arc<SessionStore>,
    transcripts: Arc<TranscriptPaths>,
    dispatchers: DispatcherRegistry,
    agent_config: AgentConfig,
    media_config: MediaConfig,
    /// Live model selection, shared with the `/model` command.
    model: Arc<std::sync::RwLock<String>>,
}

impl GatewayExecutor {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        runner: Arc<dyn AgentRunner>,
        channels: Arc<ChannelRegistry>,
        sessions: Arc<SessionStore>,
        transcripts: Arc<TranscriptPaths>,
        dispatchers: DispatcherRegistry,
        agent_config: AgentConfig,
        media_config: MediaConfig,
        model: Arc<std::sync::RwLock<String>>,
    ) -> Self {
        Self {
            runner,
            channels,
            sessions,
            transcripts,
            dispatchers,
            agent_config,
            media_config,
            model,
        }
    }

    fn deliver_fn(
        &self,
        channel: String,
        conversation: String,
    ) -> crosstalk_routing::dispatcher::DeliverFn {
        let channels = self.channels.clone();
        let media_config = self.media_config.clone();
        Arc::new(move |payload: ReplyPayload| {
            let channels = channels.clone();
            let channel = channel.clone();
            let conversation = conversation.clone();
            let media_config = media_config.clone();
            Box::pin(async move {
                vet_outbound_media(&payload, &media_config)?;
                channels
                    .send(&channel, &conversation, &payload)
                    .await
                    .map_err(|e| e.to_string())
            })
        })
    }

    async fn set_typing(&self, channel: &str, conversation: &str, active: bool) {
        if let Some(adapter) = self.channels.get(channel) {
            if let Err(e) = adapter.set_typing(conversation, active).await {
                debug!(channel, error = %e, "typing indicator failed");
            }
        }
    }

    /// Archive the transcript, mint a fresh session id, and keep the
    /// user-tunable bits of the old record.
    fn reset_session(&self, key: &SessionKey, old: &Session) -> Option<Session> {
        self.transcripts.archive(
            &old.session_id,
            Some(key.agent_id.as_str()),
            ArchiveReason::Reset,
        );
        let verbose = old.verbose_level;
        let queue = old.queue.clone();
        match self.sessions.mutate(key, move |_| {
            let mut fresh = Session::fresh();
            fresh.verbose_level = verbose;
            fresh.queue = queue;
            Some(fresh)
        }) {
            Ok(next) => next,
            Err(e) => {
                warn!(key = %key, error = %e, "session reset failed");
                None
            }
        }
    }

    fn record_usage(&self, key: &SessionKey, envelope: &Envelope, outcome: &RunOutcome) {
        let channel = envelope.channel.clone();
        let to = conversation_of(envelope).to_string();
        let input = outcome.input_tokens;
        let output = outcome.output_tokens;
        let total = outcome.total_tokens;
        let result = self.sessions.mutate(key, move |current| {
            let mut session = current.unwrap_or_else(Session::fresh);
            if input.is_some() {
                session.input_tokens = input;
            }
            if output.is_some() {
                session.output_tokens = output;
            }
            if let Some(total) = total {
                session.total_tokens = Some(total);
                session.total_tokens_fresh = Some(true);
            }
            session.last_channel = Some(channel);
            session.last_to = Some(to);
            session.touch();
            Some(session)
        });
        if let Err(e) = result {
            warn!(key = %key, error = %e, "session usage update failed");
        }
    }
}

#[async_trait]
impl LaneExecutor for GatewayExecutor {
    async fn execute(
        &self,
        job: LaneJob,
        cancel: CancellationToken,
    ) -> Result<RunOutcome, AgentError> {
        let key = SessionKey::parse(&job.session_key)
            .map_err(|e| AgentError::Other(format!("bad session key: {e}")))?;
        let session = self
            .sessions
            .get_or_create(&key)
            .map_err(|e| AgentError::Other(format!("session store: {e}")))?;

        let envelope = &job.envelope;
        let channel = envelope.channel.clone();
        let conversation = conversation_of(envelope).to_string();
        let prompt = build_prompt(&job);

        let reply_mode = self
            .channels
            .get(&channel)
            .map(|adapter| adapter.reply_to_mode())
            .unwrap_or(ReplyToMode::Any);
        let dispatcher = ReplyDispatcher::new_in(
            self.dispatchers.clone(),
            job.session_key.clone(),
            ReplyContext {
                origin_message_id: envelope.message_id.clone(),
                mode: reply_mode,
                implicit_threading: true,
                block_streaming: self.agent_config.block_streaming,
            },
            self.deliver_fn(channel.clone(), conversation.clone()),
        );

        self.set_typing(&channel, &conversation, true).await;

        let request = RunRequest {
            prompt,
            session_id: session.session_id.clone(),
            agent_id: key.agent_id.clone(),
            model: self.model.read().ok().map(|m| (*m).clone()),
        };
        let hooks = {
            let dispatcher_partial = dispatcher.clone();
            let dispatcher_block = dispatcher.clone();
            let dispatcher_tool = dispatcher.clone();
            let verbose = job.verbose.clone();
            let sessions = self.sessions.clone();
            let event_key = key.clone();
            RunHooks {
                on_partial_reply: Some(Arc::new(move |payload| {
                    dispatcher_partial.send_partial(payload);
                })),
                on_block_reply: Some(Arc::new(move |payload| {
                    dispatcher_block.send_partial(payload);
                })),
                on_tool_result: Some(Arc::new(move |text| {
                    dispatcher_tool.record_tool_sent(&text);
                })),
                on_assistant_message_start: None,
                on_reasoning_stream: None,
                on_agent_event: Some(Arc::new(move |event| {
                    if let crosstalk_agent::AgentEvent::Compaction { count } = event {
                        let _ = sessions.mutate(&event_key, move |current| {
                            let mut session = current.unwrap_or_else(Session::fresh);
                            session.compaction_count = count;
                            session.touch();
                            Some(session)
                        });
                    }
                })),
                should_emit_tool_result: Arc::new(move || verbose.load(Ordering::SeqCst)),
                abort: cancel.clone(),
            }
        };

        let runner = self.runner.clone();
        let attempts = self.agent_config.retry_attempts;
        let run_result = retry_transient(attempts, || {
            let request = request.clone();
            let hooks = hooks.clone();
            let runner = runner.clone();
            async move { runner.run(request, hooks).await }
        })
        .await;

        let result = match run_result {
            Ok(outcome) => {
                for text in &outcome.tool_sent_texts {
                    dispatcher.record_tool_sent(text);
                }
                if let Some(text) = &outcome.text {
                    dispatcher.send_final(ReplyPayload::text(text.clone()));
                }
                self.record_usage(&key, envelope, &outcome);
                Ok(outcome)
            }
            Err(AgentError::Cancelled) => {
                // steering/interrupt/abort: partials stop here, the lane
                // decides what runs next
                Err(AgentError::Cancelled)
            }
            Err(raw) => {
                let error = match raw {
                    AgentError::Other(message) => classify_failure(&message),
                    other => other,
                };
                match &error {
                    AgentError::ContextOverflow(_)
                    | AgentError::RoleOrdering(_)
                    | AgentError::CorruptTranscript(_) => {
                        info!(key = %key, error = %error, "resetting session after agent failure");
                        self.reset_session(&key, &session);
                        dispatcher.send_final(ReplyPayload::text(friendly_reply(&error)));
                        // handled: the user sees the reset reply and the
                        // next message starts a fresh session
                        Ok(RunOutcome::default())
                    }
                    _ => {
                        dispatcher.send_final(ReplyPayload::text(friendly_reply(&error)));
                        Err(error)
                    }
                }
            }
        };

        dispatcher.mark_complete();
        dispatcher.wait_for_idle().await;
        dispatcher.unregister();
        self.set_typing(&channel, &conversation, false).await;

        result
    }
}

/// Local media paths must vet against the allow-roots before the adapter
/// sees them; remote URLs pass through (the platform fetches those itself).
fn vet_outbound_media(payload: &ReplyPayload, config: &MediaConfig) -> Result<(), String> {
    let candidates = payload
        .media_url
        .iter()
        .chain(payload.media_urls.iter());
    for media in candidates {
        let is_local = media.starts_with("file://")
            || media.starts_with('/')
            || media.starts_with('~');
        if !is_local {
            continue;
        }
        vet_media_path(media, &config.allow_roots, config.max_bytes)
            .map_err(|e| format!("outbound media rejected: {e}"))?;
    }
    Ok(())
}

fn conversation_of(envelope: &Envelope) -> &str {
    match &envelope.scope {
        Scope::Dm => envelope.sender.id.as_str(),
        Scope::Channel(id) | Scope::Group(id) => id.as_str(),
    }
}

fn scope_label(envelope: &Envelope) -> &'static str {
    match envelope.scope {
        Scope::Dm => "dm",
        Scope::Channel(_) => "channel",
        Scope::Group(_) => "group",
    }
}

/// Assemble the run prompt: envelope header, reply context, media markers,
/// carried-over output and backlog from steering, then the message body.
fn build_prompt(job: &LaneJob) -> String {
    let envelope = &job.envelope;
    let mut parts: Vec<String> = Vec::new();

    parts.push(format_header(envelope, scope_label(envelope), None));
    if let Some(reply) = &envelope.reply_to {
        parts.push(format_reply_context(
            reply.sender.as_deref().unwrap_or("unknown"),
            &reply.id,
        ));
    }
    parts.extend(format_media_lines(&envelope.attachments));

    if let Some(carried) = &job.carried_output {
        parts.push(format!(
            "[partial output from the interrupted run]\n{carried}"
        ));
    }
    for backlog in &job.backlog {
        let text = backlog.text.trim();
        if !text.is_empty() {
            parts.push(format!("[queued message] {text}"));
        }
    }

    // steering notes include the replacement message itself
    if job.steer_notes.is_empty() {
        parts.push(envelope.text.clone());
    } else {
        parts.extend(job.steer_notes.iter().cloned());
    }

    parts.join("\n")
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicBool;

    fn job(envelope: Envelope) -> LaneJob {
        LaneJob {
            session_key: "agent:main:telegram:dm:42".to_string(),
            run_id: crosstalk_core::types::RunId::new(),
            envelope,
            steer_notes: Vec::new(),
            carried_output: None,
            backlog: Vec::new(),
            verbose: Arc::new(AtomicBool::new(false)),
        }
    }

    #[test]
    fn prompt_carries_header_and_body() {
        let mut envelope = Envelope::text_message("telegram", "alice", "hello there");
        envelope.chat_id = Some("c42".to_string());
        let prompt = build_prompt(&job(envelope));

        assert!(prompt.starts_with("[Telegram dm id:c42 "));
        assert!(prompt.ends_with("hello there"));
    }

    #[test]
    fn prompt_includes_reply_context_and_media() {
        let mut envelope = Envelope::text_message("telegram", "alice", "see attached");
        envelope.reply_to = Some(crosstalk_channels::types::ReplyRef {
            id: "m7".to_string(),
            body: Some("earlier".to_string()),
            sender: Some("Bob".to_string()),
        });
        envelope.attachments.push(crosstalk_channels::types::Attachment {
            kind: crosstalk_channels::types::AttachmentKind::Image,
            path: Some("/tmp/pic.png".to_string()),
            url: None,
            mime: Some("image/png".to_string()),
            index: 0,
            transcript: None,
        });

        let prompt = build_prompt(&job(envelope));
        assert!(prompt.contains("[Replying to Bob id:m7]"));
        assert!(prompt.contains("[media attached: /tmp/pic.png (image/png)]"));
    }

    #[test]
    fn steered_prompt_uses_notes_and_carried_output() {
        let envelope = Envelope::text_message("telegram", "alice", "actually, make it a haiku");
        let mut job = job(envelope);
        job.steer_notes = vec!["actually, make it a haiku".to_string()];
        job.carried_output = Some("draft stanza one".to_string());
        job.backlog = vec![Envelope::text_message("telegram", "alice", "and sign it")];

        let prompt = build_prompt(&job);
        assert!(prompt.contains("partial output from the interrupted run"));
        assert!(prompt.contains("draft stanza one"));
        assert!(prompt.contains("[queued message] and sign it"));
        assert!(prompt.ends_with("actually, make it a haiku"));
    }
}
