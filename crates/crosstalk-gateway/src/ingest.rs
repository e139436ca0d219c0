//! Inbound routing: adapter fan-in → debouncer → control commands or the
//! lane scheduler.
//!
//! Every envelope from every adapter lands here. Bot-authored messages and
//! slash commands bypass the coalescing window; everything else buckets by
//! coalesce key and is combined on flush.

use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crosstalk_channels::envelope::{coalesce_key, combine_entries};
use crosstalk_channels::types::{Envelope, ReplyPayload, Scope};
use crosstalk_routing::commands::{classify, is_slash_command};
use crosstalk_routing::{Debouncer, DebouncerOptions, LaneScheduler, SubmitOutcome};
use crosstalk_sessions::{KeyScope, SessionKey, SessionStore, ThreadMarker};

use crate::app::AppState;
use crate::control;

pub struct InboundRouter {
    debouncer: Debouncer<Envelope>,
    scheduler: Arc<LaneScheduler>,
    #[allow(dead_code)]
    sessions: Arc<SessionStore>,
    state: Mutex<Option<Weak<AppState>>>,
    /// Shared with the debouncer's flush closure; filled by [`Self::bind`].
    self_slot: Arc<Mutex<Option<Weak<InboundRouter>>>>,
}

impl InboundRouter {
    pub fn new(
        scheduler: Arc<LaneScheduler>,
        sessions: Arc<SessionStore>,
        debounce_ms: u64,
    ) -> Self {
        // the debouncer's flush needs the router; break the cycle through a
        // late-bound weak reference
        let slot: Arc<Mutex<Option<Weak<InboundRouter>>>> = Arc::new(Mutex::new(None));
        let flush_slot = slot.clone();

        let debouncer = Debouncer::new(DebouncerOptions {
            debounce: Duration::from_millis(debounce_ms),
            build_key: Arc::new(coalesce_key),
            should_debounce: Arc::new(|envelope: &Envelope| {
                !envelope.from_me && !is_slash_command(&envelope.text)
            }),
            on_flush: Arc::new(move |entries: Vec<Envelope>| {
                let slot = flush_slot.clone();
                Box::pin(async move {
                    let router = slot
                        .lock()
                        .unwrap()
                        .as_ref()
                        .and_then(Weak::upgrade)
                        .ok_or_else(|| "router gone".to_string())?;
                    router.dispatch_flush(entries).await;
                    Ok(())
                })
            }),
            on_error: Arc::new(|e| warn!(error = %e, "inbound flush failed")),
        });

        Self {
            debouncer,
            scheduler,
            sessions,
            state: Mutex::new(None),
            self_slot: slot,
        }
    }

    /// Late-bind the app state and the router's own Arc. Called once after
    /// `AppState` construction.
    pub fn bind(self: &Arc<Self>, state: &Arc<AppState>) {
        *self.state.lock().unwrap() = Some(Arc::downgrade(state));
        *self.self_slot.lock().unwrap() = Some(Arc::downgrade(self));
    }

    /// Pump the merged adapter feed into the debouncer until it closes.
    pub async fn run(self: Arc<Self>, mut inbound: mpsc::Receiver<Envelope>) {
        info!("inbound router started");
        while let Some(envelope) = inbound.recv().await {
            self.ingest(envelope).await;
        }
        info!("inbound feed closed");
    }

    /// Offer one envelope to the debouncer.
    pub async fn ingest(&self, envelope: Envelope) {
        self.debouncer.enqueue(envelope).await;
    }

    async fn dispatch_flush(&self, entries: Vec<Envelope>) {
        let Some(envelope) = combine_entries(entries) else {
            return;
        };

        if envelope.from_me {
            debug!(channel = %envelope.channel, "own message cached, not processed");
            return;
        }

        let state = self.state.lock().unwrap().as_ref().and_then(Weak::upgrade);
        let key = session_key_for(&envelope).format();

        // slash commands route to the command handler synchronously and
        // never enter the lane
        if let Some(state) = &state {
            if let Some(command) = classify(&envelope.text, &state.skills) {
                match control::execute(state, &key, command).await {
                    Some(reply) => {
                        self.reply_direct(state, &envelope, &reply).await;
                        return;
                    }
                    None => {
                        // skill commands fall through to the agent lane
                    }
                }
            }
        }

        match self.scheduler.submit(&key, envelope.clone()) {
            SubmitOutcome::RejectedFull => {
                warn!(key = %key, "queue full, message rejected");
                if let Some(state) = &state {
                    self.reply_direct(
                        state,
                        &envelope,
                        "Message queue is full; try again in a moment.",
                    )
                    .await;
                }
            }
            outcome => debug!(key = %key, ?outcome, "envelope submitted"),
        }
    }

    async fn reply_direct(&self, state: &Arc<AppState>, envelope: &Envelope, text: &str) {
        let conversation = match &envelope.scope {
            Scope::Dm => envelope.sender.id.as_str(),
            Scope::Channel(id) | Scope::Group(id) => id.as_str(),
        };
        if let Err(e) = state
            .channels
            .send(&envelope.channel, conversation, &ReplyPayload::text(text))
            .await
        {
            warn!(channel = %envelope.channel, error = %e, "direct reply failed");
        }
    }
}

/// Route identity for an envelope: the session key its lane lives under.
pub fn session_key_for(envelope: &Envelope) -> SessionKey {
    let (scope, scope_id) = match &envelope.scope {
        Scope::Dm => (KeyScope::Dm, envelope.sender.id.clone()),
        Scope::Group(id) => (KeyScope::Group, id.clone()),
        Scope::Channel(id) => (KeyScope::Channel, id.clone()),
    };
    let mut key = SessionKey::new("main", &envelope.channel, scope, scope_id);
    if let Some(tid) = &envelope.thread_id {
        // Telegram forum topics keep their own tag; every other platform
        // threads generically
        let marker = if envelope.channel == "telegram" {
            ThreadMarker::Topic
        } else {
            ThreadMarker::Thread
        };
        key = key.with_thread(marker, tid.clone());
    }
    key
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
