use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use axum::{
    routing::{get, post},
    Router,
};
use serde::Serialize;
use tokio::sync::broadcast;

use crosstalk_channels::manager::ChannelRegistry;
use crosstalk_core::conffile::ConfigFile;
use crosstalk_core::config::CrosstalkConfig;
use crosstalk_exec::{ApprovalLedger, ApprovalsStore};
use crosstalk_protocol::frames::EventFrame;
use crosstalk_routing::{DispatcherRegistry, LaneScheduler, QueueSettings, RestartGate};
use crosstalk_sessions::{SessionStore, TranscriptPaths};

use crate::auth::RateLimiter;
use crate::executor::GatewayExecutor;
use crate::ingest::InboundRouter;
use crate::nodes::NodeRegistry;

const BROADCAST_CAPACITY: usize = 256;

/// Fan-out events to all connected WS clients via tokio broadcast channel.
pub struct EventBroadcaster {
    tx: broadcast::Sender<String>,
}

impl EventBroadcaster {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(BROADCAST_CAPACITY);
        Self { tx }
    }

    /// New client subscribes to the broadcast stream.
    pub fn subscribe(&self) -> broadcast::Receiver<String> {
        self.tx.subscribe()
    }

    /// Push a JSON event string to all subscribers.
    /// Silently drops if no subscribers exist.
    pub fn send(&self, payload: String) {
        let _ = self.tx.send(payload);
    }
}

impl Default for EventBroadcaster {
    fn default() -> Self {
        Self::new()
    }
}

/// Central shared state — passed as Arc<AppState> to all Axum handlers.
pub struct AppState {
    pub config: CrosstalkConfig,
    pub conf_file: ConfigFile,
    pub state_dir: PathBuf,
    pub event_seq: AtomicU64,
    pub broadcaster: EventBroadcaster,
    pub channels: Arc<ChannelRegistry>,
    pub sessions: Arc<SessionStore>,
    pub transcripts: Arc<TranscriptPaths>,
    pub scheduler: Arc<LaneScheduler>,
    pub ledger: Arc<ApprovalLedger>,
    pub approvals: Arc<ApprovalsStore>,
    pub nodes: NodeRegistry,
    pub limiter: RateLimiter,
    pub dispatchers: DispatcherRegistry,
    pub router: Arc<InboundRouter>,
    /// Installed skill command names; reserved against model aliases.
    pub skills: Vec<String>,
    /// Runtime model override (`/model`); shared with the executor.
    pub model: Arc<std::sync::RwLock<String>>,
    /// Runtime thinking-effort level (`/think`).
    pub thinking: std::sync::RwLock<Option<String>>,
    /// A gated restart has been scheduled.
    pub restarting: AtomicBool,
}

impl AppState {
    pub fn new(
        config: CrosstalkConfig,
        runner: Arc<dyn crosstalk_agent::AgentRunner>,
    ) -> (Arc<Self>, tokio::sync::mpsc::Receiver<crosstalk_channels::types::Envelope>) {
        let state_dir = config.state.resolve_dir();
        let (channels, inbound_rx) = ChannelRegistry::new();
        let channels = Arc::new(channels);

        let sessions = Arc::new(SessionStore::new(&state_dir));
        let transcripts = Arc::new(TranscriptPaths::new(&state_dir));
        let dispatchers = DispatcherRegistry::global();

        let model = Arc::new(std::sync::RwLock::new(config.agent.model.clone()));
        let executor = Arc::new(GatewayExecutor::new(
            runner,
            channels.clone(),
            sessions.clone(),
            transcripts.clone(),
            dispatchers.clone(),
            config.agent.clone(),
            config.media.clone(),
            model.clone(),
        ));
        let scheduler = Arc::new(LaneScheduler::new(
            QueueSettings::from_config(&config.queue),
            executor,
        ));

        let router = Arc::new(InboundRouter::new(
            scheduler.clone(),
            sessions.clone(),
            config.queue.debounce_ms,
        ));

        let state = Arc::new(Self {
            conf_file: ConfigFile::new(state_dir.join("crosstalk.toml")),
            state_dir: state_dir.clone(),
            event_seq: AtomicU64::new(0),
            broadcaster: EventBroadcaster::new(),
            channels,
            sessions,
            transcripts,
            scheduler,
            ledger: Arc::new(ApprovalLedger::new(std::time::Duration::from_millis(
                config.exec.approval_ttl_ms,
            ))),
            approvals: Arc::new(ApprovalsStore::new(&state_dir)),
            nodes: NodeRegistry::new(),
            limiter: RateLimiter::new(config.gateway.rate_limit.clone()),
            dispatchers,
            router,
            skills: Vec::new(),
            model,
            thinking: std::sync::RwLock::new(None),
            restarting: AtomicBool::new(false),
            config,
        });
        (state, inbound_rx)
    }

    /// Monotonically increasing sequence for broadcast events.
    pub fn next_seq(&self) -> u64 {
        self.event_seq.fetch_add(1, Ordering::Relaxed)
    }

    /// Broadcast a sequenced event frame to every operator connection.
    pub fn emit_event(&self, name: &str, payload: impl Serialize) {
        let frame = EventFrame::new(name, payload).with_seq(self.next_seq());
        let json = serde_json::to_string(&frame).unwrap_or_default();
        self.broadcaster.send(json);
    }

    /// The restart gate observes queued envelopes plus pending replies.
    pub fn restart_gate(&self) -> RestartGate {
        let scheduler = self.scheduler.clone();
        let dispatchers = self.dispatchers.clone();
        RestartGate::new(
            Arc::new(move || scheduler.total_queue_size()),
            Arc::new(move || dispatchers.total_pending_replies()),
        )
    }
}

/// Build the HTTP surface: WS endpoint plus the webhook ingress.
pub fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/ws", get(crate::ws::connection::ws_handler))
        .route("/hooks/{name}", post(crate::http::webhooks::webhook_handler))
        .layer(tower_http::trace::TraceLayer::new_for_http())
        .with_state(state)
}
