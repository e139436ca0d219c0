//! Control-command execution — `/help`, `/status`, `/model`, `/queue` and
//! friends run here synchronously, never through the agent lane.

use std::sync::Arc;

use tracing::info;

use crosstalk_core::config::PROTOCOL_VERSION;
use crosstalk_routing::commands::{self, ControlCommand};
use crosstalk_routing::queue::parse_queue_args;
use crosstalk_sessions::SessionKey;

use crate::app::AppState;

/// Execute a classified command for `session_key`. Returns the reply text,
/// or `None` when the command produces no immediate reply (skill commands
/// are forwarded to the agent lane by the caller).
pub async fn execute(state: &Arc<AppState>, session_key: &str, command: ControlCommand) -> Option<String> {
    match command {
        ControlCommand::Help => Some(commands::help_text()),

        ControlCommand::Status => Some(status_text(state, session_key)),

        ControlCommand::Models => {
            let mut lines = vec!["**Model aliases**".to_string()];
            for (alias, full) in commands::MODEL_ALIASES {
                lines.push(format!("- `{alias}` → `{full}`"));
            }
            Some(lines.join("\n"))
        }

        ControlCommand::Model(None) => {
            let model = state.model.read().map(|m| (*m).clone()).unwrap_or_default();
            Some(format!(
                "Current model: **{model}**\n\nSwitch with `/model opus|sonnet|haiku`"
            ))
        }

        ControlCommand::Model(Some(wanted)) => {
            match commands::resolve_model_alias(&wanted, &state.skills) {
                Some(resolved) => {
                    let previous = state
                        .model
                        .write()
                        .map(|mut m| std::mem::replace(&mut *m, resolved.to_string()))
                        .unwrap_or_default();
                    info!(previous = %previous, new = %resolved, "model switched via /model");
                    Some(format!("Model switched: **{previous}** -> **{resolved}**"))
                }
                None => Some(format!(
                    "Unknown model: `{wanted}`. Available: `opus`, `sonnet`, `haiku`"
                )),
            }
        }

        ControlCommand::Think(None) => {
            let level = state
                .thinking
                .read()
                .ok()
                .and_then(|t| t.clone())
                .unwrap_or_else(|| "off".to_string());
            Some(format!(
                "Thinking effort: **{level}** (`/think off|low|medium|high`)"
            ))
        }

        ControlCommand::Think(Some(level)) => match commands::think_level(&level) {
            Ok(level) => {
                if let Ok(mut slot) = state.thinking.write() {
                    *slot = Some(level.clone());
                }
                Some(format!("Thinking effort set to **{level}**"))
            }
            Err(message) => Some(message),
        },

        ControlCommand::Verbose(arg) => {
            let lane = state.scheduler.lane(session_key);
            let next = arg.unwrap_or(!lane.verbose());
            lane.set_verbose(next);
            persist_verbose(state, session_key, next);
            Some(if next {
                "Tool output: **on**".to_string()
            } else {
                "Tool output: **off**".to_string()
            })
        }

        ControlCommand::Queue(args) => {
            let lane = state.scheduler.lane(session_key);
            if args.trim().is_empty() {
                return Some(lane.settings().report());
            }
            match parse_queue_args(&args) {
                Ok(patch) if patch.is_empty() => Some(lane.settings().report()),
                Ok(patch) => {
                    let settings = lane.apply_queue_patch(&patch);
                    persist_queue(state, session_key, &settings);
                    Some(settings.report())
                }
                Err(message) => Some(format!("/queue: {message}")),
            }
        }

        ControlCommand::Stop => {
            let stopped = state.scheduler.abort(session_key, None);
            Some(if stopped {
                "Stopped the current run.".to_string()
            } else {
                "Nothing is running.".to_string()
            })
        }

        ControlCommand::Skill { .. } => None,
    }
}

fn status_text(state: &Arc<AppState>, session_key: &str) -> String {
    let mut lines = vec![format!(
        "**crosstalk v{}** (protocol v{PROTOCOL_VERSION})",
        env!("CARGO_PKG_VERSION")
    )];
    lines.push(format!(
        "- Model: `{}`",
        state.model.read().map(|m| (*m).clone()).unwrap_or_default()
    ));

    if let Ok(key) = SessionKey::parse(session_key) {
        if let Ok(Some(session)) = state.sessions.get(&key) {
            lines.push(format!("- Session: `{}`", session.session_id));
            if let Some(total) = session.total_tokens {
                let marker = if session.total_tokens_fresh.unwrap_or(false) {
                    ""
                } else {
                    " (stale)"
                };
                lines.push(format!("- Tokens: {total}{marker}"));
            }
            if session.compaction_count > 0 {
                lines.push(format!("- Compactions: {}", session.compaction_count));
            }
        }
    }

    let lane = state.scheduler.lane(session_key);
    lines.push(format!("- Lane: {:?}", lane.phase()));
    lines.push(format!("- {}", lane.settings().report()));
    lines.join("\n")
}

fn persist_verbose(state: &Arc<AppState>, session_key: &str, on: bool) {
    let Ok(key) = SessionKey::parse(session_key) else {
        return;
    };
    let _ = state.sessions.mutate(&key, |current| {
        let mut session = current.unwrap_or_else(crosstalk_sessions::Session::fresh);
        session.verbose_level = u8::from(on);
        session.touch();
        Some(session)
    });
}

fn persist_queue(
    state: &Arc<AppState>,
    session_key: &str,
    settings: &crosstalk_routing::QueueSettings,
) {
    let Ok(key) = SessionKey::parse(session_key) else {
        return;
    };
    let snapshot = serde_json::to_value(settings).ok();
    let _ = state.sessions.mutate(&key, move |current| {
        let mut session = current.unwrap_or_else(crosstalk_sessions::Session::fresh);
        session.queue = snapshot;
        session.touch();
        Some(session)
    });
}
