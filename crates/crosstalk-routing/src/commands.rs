//! Control-command classification — intercepted before the agent lane.
//!
//! A slash-prefixed message is routed to the command handler synchronously
//! and never enters the queue. Skill-provided command names are reserved:
//! they mask any model alias whose normalized alias collides. Precedence is
//! built-ins first, then skills (lexicographic), then model aliases.

use std::str::FromStr;

/// Known model aliases for user-friendly switching.
pub const MODEL_ALIASES: &[(&str, &str)] = &[
    ("opus", "claude-opus-4-6"),
    ("sonnet", "claude-sonnet-4-6"),
    ("haiku", "claude-haiku-4-5"),
];

/// Thinking-effort levels accepted by `/think`.
pub const THINK_LEVELS: &[&str] = &["off", "low", "medium", "high"];

/// A recognized control command, arguments parsed but not yet executed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlCommand {
    Help,
    Status,
    Models,
    /// `/model` with no argument reports; with an argument switches.
    Model(Option<String>),
    Think(Option<String>),
    /// `/verbose` toggles; `/verbose on|off` sets.
    Verbose(Option<bool>),
    Stop,
    /// `/queue [...]` — raw argument string, parsed by the queue layer.
    Queue(String),
    /// An installed skill command with its argument tail.
    Skill { name: String, args: String },
}

/// Classify `text` as a control command, or `None` to run it through the
/// agent lane. `skills` is the installed skill-command name set.
pub fn classify(text: &str, skills: &[String]) -> Option<ControlCommand> {
    let trimmed = text.trim();
    let rest = trimmed.strip_prefix('/')?;
    if rest.is_empty() {
        return None;
    }

    let (word, args) = match rest.split_once(char::is_whitespace) {
        Some((w, a)) => (w, a.trim()),
        None => (rest, ""),
    };
    let word = word.to_lowercase();

    // built-ins win over everything
    match word.as_str() {
        "help" => return Some(ControlCommand::Help),
        "status" => return Some(ControlCommand::Status),
        "models" => return Some(ControlCommand::Models),
        "model" => {
            let arg = if args.is_empty() {
                None
            } else {
                Some(args.to_string())
            };
            return Some(ControlCommand::Model(arg));
        }
        "think" | "thinking" => {
            let arg = if args.is_empty() {
                None
            } else {
                Some(args.to_lowercase())
            };
            return Some(ControlCommand::Think(arg));
        }
        "verbose" => {
            let arg = match args.to_lowercase().as_str() {
                "" => None,
                "on" | "true" => Some(true),
                "off" | "false" => Some(false),
                _ => None,
            };
            return Some(ControlCommand::Verbose(arg));
        }
        "stop" => return Some(ControlCommand::Stop),
        "queue" => return Some(ControlCommand::Queue(args.to_string())),
        _ => {}
    }

    // installed skills next — lexicographic order decides collisions
    let mut sorted: Vec<&String> = skills.iter().collect();
    sorted.sort();
    if let Some(name) = sorted.into_iter().find(|s| normalize(s) == word) {
        return Some(ControlCommand::Skill {
            name: name.clone(),
            args: args.to_string(),
        });
    }

    None
}

/// Whether `text` is a slash command at all — the debouncer bypasses these
/// without needing the full classification.
pub fn is_slash_command(text: &str) -> bool {
    let trimmed = text.trim_start();
    trimmed.starts_with('/')
        && trimmed
            .chars()
            .nth(1)
            .is_some_and(|c| c.is_ascii_alphanumeric())
}

/// Resolve a model alias or full id, honoring skill-name reservations: an
/// alias shadowed by an installed skill command no longer resolves.
pub fn resolve_model_alias(input: &str, skills: &[String]) -> Option<&'static str> {
    let lower = input.to_lowercase();
    for &(alias, full) in MODEL_ALIASES {
        if lower == alias {
            let reserved = skills.iter().any(|s| normalize(s) == alias);
            if reserved {
                return None;
            }
            return Some(full);
        }
        if lower == full {
            return Some(full);
        }
    }
    None
}

pub fn think_level(input: &str) -> Result<String, String> {
    let lower = input.to_lowercase();
    if THINK_LEVELS.contains(&lower.as_str()) {
        Ok(lower)
    } else {
        Err(format!(
            "unknown thinking level '{}' ({})",
            input,
            THINK_LEVELS.join(", ")
        ))
    }
}

fn normalize(name: &str) -> String {
    name.trim().trim_start_matches('/').to_lowercase()
}

/// Help text shown for `/help`.
pub fn help_text() -> String {
    "**Commands**\n\
     - `/help` — show this help\n\
     - `/status` — session and queue status\n\
     - `/model` — show current model; `/model <name>` to switch\n\
     - `/models` — list model aliases\n\
     - `/think <off|low|medium|high>` — set thinking effort\n\
     - `/verbose [on|off]` — toggle tool output\n\
     - `/queue` — show queue settings; `/queue mode:<m> debounce:<ms|s|m> cap:<n> drop:<p>` to change\n\
     - `/stop` — cancel the current run"
        .to_string()
}

impl FromStr for ControlCommand {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        classify(s, &[]).ok_or(())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_text_is_not_a_command() {
        assert!(classify("hello world", &[]).is_none());
        assert!(classify("a/b path", &[]).is_none());
        assert!(!is_slash_command("hello"));
    }

    #[test]
    fn builtins_classify_with_args() {
        assert_eq!(classify("/help", &[]), Some(ControlCommand::Help));
        assert_eq!(
            classify("/model sonnet", &[]),
            Some(ControlCommand::Model(Some("sonnet".to_string())))
        );
        assert_eq!(
            classify("/queue mode:steer cap:5", &[]),
            Some(ControlCommand::Queue("mode:steer cap:5".to_string()))
        );
        assert_eq!(classify("/verbose on", &[]), Some(ControlCommand::Verbose(Some(true))));
        assert_eq!(classify("/thinking high", &[]),
            Some(ControlCommand::Think(Some("high".to_string()))));
    }

    #[test]
    fn skill_commands_classify_after_builtins() {
        let skills = vec!["weather".to_string(), "status".to_string()];
        // built-in /status wins over a skill with the same name
        assert_eq!(classify("/status", &skills), Some(ControlCommand::Status));
        assert_eq!(
            classify("/weather tomorrow", &skills),
            Some(ControlCommand::Skill {
                name: "weather".to_string(),
                args: "tomorrow".to_string()
            })
        );
    }

    #[test]
    fn skill_name_masks_model_alias() {
        let skills = vec!["opus".to_string()];
        assert_eq!(resolve_model_alias("opus", &skills), None);
        assert_eq!(
            resolve_model_alias("sonnet", &skills),
            Some("claude-sonnet-4-6")
        );
        // full model ids always resolve
        assert_eq!(
            resolve_model_alias("claude-opus-4-6", &skills),
            Some("claude-opus-4-6")
        );
    }

    #[test]
    fn slash_detection_requires_a_word() {
        assert!(is_slash_command("/help"));
        assert!(is_slash_command("  /queue cap:3"));
        assert!(!is_slash_command("/ slash with space"));
        assert!(!is_slash_command("//comment"));
    }

    #[test]
    fn think_levels_validate() {
        assert_eq!(think_level("HIGH").unwrap(), "high");
        assert!(think_level("ultra").is_err());
    }
}
