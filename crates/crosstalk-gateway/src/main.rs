use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use clap::Parser;
use tracing::{error, info, warn};

use crosstalk_agent::error::AgentError;
use crosstalk_agent::runner::{AgentRunner, RunHooks, RunOutcome, RunRequest};
use crosstalk_channels::types::ReplyPayload;
use crosstalk_gateway::app::{build_router, AppState};
use crosstalk_routing::RestartSentinel;
use crosstalk_sessions::SessionKey;

/// Multi-channel conversational gateway.
#[derive(Debug, Parser)]
#[command(name = "crosstalk-gateway", version)]
struct Cli {
    /// Path to crosstalk.toml (defaults to CROSSTALK_CONFIG or
    /// ~/.crosstalk/crosstalk.toml).
    #[arg(long)]
    config: Option<String>,

    /// Override the bind port.
    #[arg(long)]
    port: Option<u16>,
}

/// Placeholder runner used when no agent backend has been wired in. Real
/// deployments construct [`AppState`] with their own runner.
struct UnconfiguredRunner;

#[async_trait]
impl AgentRunner for UnconfiguredRunner {
    async fn run(&self, _request: RunRequest, _hooks: RunHooks) -> Result<RunOutcome, AgentError> {
        Err(AgentError::Other(
            "no agent backend is configured".to_string(),
        ))
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "crosstalk_gateway=info,tower_http=debug".into()),
        )
        .init();

    let cli = Cli::parse();

    let mut config = crosstalk_core::config::CrosstalkConfig::load(cli.config.as_deref())
        .unwrap_or_else(|e| {
            warn!("config load failed ({e}), using defaults");
            crosstalk_core::config::CrosstalkConfig::default()
        });
    if let Some(port) = cli.port {
        config.gateway.port = port;
    }

    let bind = config.gateway.bind.clone();
    let port = config.gateway.port;

    let (state, inbound_rx) = AppState::new(config, Arc::new(UnconfiguredRunner));
    state.router.bind(&state);

    // a restart sentinel from the predecessor routes a confirmation reply
    if let Some(sentinel) = RestartSentinel::consume(&RestartSentinel::path_in(&state.state_dir)) {
        info!(kind = %sentinel.kind, "restart sentinel consumed");
        spawn_restart_confirmation(state.clone(), sentinel);
    }

    // SIGUSR1 → re-exec in place (the sentinel is already on disk)
    spawn_restart_handler();

    // adapter fan-in → debouncer → lanes
    tokio::spawn(state.router.clone().run(inbound_rx));

    let router = build_router(state.clone());
    let addr: SocketAddr = format!("{bind}:{port}").parse()?;
    info!("crosstalk gateway listening on {addr}");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(
        listener,
        router.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .await?;

    Ok(())
}

/// Deliver the post-restart confirmation on the channel that asked for the
/// restart. Best-effort: the adapter may not have reconnected yet.
fn spawn_restart_confirmation(state: Arc<AppState>, sentinel: RestartSentinel) {
    tokio::spawn(async move {
        let Some(key_str) = sentinel.session_key else {
            return;
        };
        let Ok(key) = SessionKey::parse(&key_str) else {
            warn!(key = %key_str, "sentinel session key unparseable");
            return;
        };
        let message = sentinel
            .message
            .unwrap_or_else(|| "Gateway restarted.".to_string());

        // give adapters a moment to reconnect before the delivery attempt
        tokio::time::sleep(std::time::Duration::from_secs(2)).await;
        let conversation = key.scope_id.clone();
        if let Err(e) = state
            .channels
            .send(&key.channel, &conversation, &ReplyPayload::text(message))
            .await
        {
            warn!(channel = %key.channel, error = %e, "restart confirmation not delivered");
        }
    });
}

fn spawn_restart_handler() {
    tokio::spawn(async {
        let Ok(mut stream) =
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::user_defined1())
        else {
            warn!("SIGUSR1 handler unavailable");
            return;
        };
        stream.recv().await;
        info!("SIGUSR1 received; re-exec");

        let Ok(exe) = std::env::current_exe() else {
            error!("current_exe unavailable; exiting for supervisor restart");
            std::process::exit(1);
        };
        let args: Vec<String> = std::env::args().skip(1).collect();
        use std::os::unix::process::CommandExt;
        let err = std::process::Command::new(exe).args(args).exec();
        error!(error = %err, "re-exec failed");
        std::process::exit(1);
    });
}
