//! Shell-command text helpers shared by the approval ledger and allowlist:
//! POSIX-ish tokenization, canonical re-quoting, and argv[0] resolution
//! against the safe-bin set.

use std::path::{Path, PathBuf};

/// Split `command` into tokens, honoring single quotes, double quotes, and
/// backslash escapes. Unterminated quotes return `None` — a command we
/// cannot tokenize is a command we refuse to compare.
pub fn shell_split(command: &str) -> Option<Vec<String>> {
    let mut tokens = Vec::new();
    let mut current = String::new();
    let mut in_token = false;
    let mut chars = command.chars();

    loop {
        let Some(c) = chars.next() else { break };
        match c {
            c if c.is_whitespace() => {
                if in_token {
                    tokens.push(std::mem::take(&mut current));
                    in_token = false;
                }
            }
            '\'' => {
                in_token = true;
                loop {
                    match chars.next() {
                        Some('\'') => break,
                        Some(c) => current.push(c),
                        None => return None,
                    }
                }
            }
            '"' => {
                in_token = true;
                loop {
                    match chars.next() {
                        Some('"') => break,
                        Some('\\') => match chars.next() {
                            Some(escaped) => current.push(escaped),
                            None => return None,
                        },
                        Some(c) => current.push(c),
                        None => return None,
                    }
                }
            }
            '\\' => {
                in_token = true;
                match chars.next() {
                    Some(escaped) => current.push(escaped),
                    None => return None,
                }
            }
            c => {
                in_token = true;
                current.push(c);
            }
        }
    }

    if in_token {
        tokens.push(current);
    }
    Some(tokens)
}

/// Canonical single-line rendition of an argv: tokens joined by single
/// spaces, quoting only where needed. Two commands are "the same command"
/// iff their normalized forms are byte-equal.
pub fn normalize_argv(argv: &[String]) -> String {
    argv.iter()
        .map(|token| quote_token(token))
        .collect::<Vec<_>>()
        .join(" ")
}

/// Normalize free-form command text through tokenize + re-quote.
pub fn normalize_command(command: &str) -> Option<String> {
    shell_split(command).map(|tokens| normalize_argv(&tokens))
}

fn quote_token(token: &str) -> String {
    if !token.is_empty()
        && token
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "-_./:=@%+,".contains(c))
    {
        return token.to_string();
    }
    // single-quote, escaping embedded single quotes the POSIX way
    format!("'{}'", token.replace('\'', r"'\''"))
}

/// Resolve argv[0] to an absolute binary path, constrained to `safe_bins`.
///
/// A bare name probes each safe directory in order; an absolute path is
/// accepted only when its parent directory (after canonicalization) is one
/// of the safe directories. Anything else — relative paths, traversal,
/// symlinks out of the set — resolves to `None`.
pub fn resolve_argv0(argv0: &str, safe_bins: &[String]) -> Option<PathBuf> {
    if argv0.is_empty() {
        return None;
    }

    if argv0.contains('/') {
        let path = Path::new(argv0);
        if !path.is_absolute() {
            return None;
        }
        let canonical = std::fs::canonicalize(path).ok()?;
        let parent = canonical.parent()?;
        let parent_ok = safe_bins.iter().any(|bin| {
            std::fs::canonicalize(bin)
                .map(|safe| safe == parent)
                .unwrap_or(false)
        });
        return parent_ok.then_some(canonical);
    }

    for bin in safe_bins {
        let candidate = Path::new(bin).join(argv0);
        if candidate.is_file() {
            return std::fs::canonicalize(&candidate).ok();
        }
    }
    None
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn split_plain_tokens() {
        assert_eq!(
            shell_split("echo hi there").unwrap(),
            vec!["echo", "hi", "there"]
        );
    }

    #[test]
    fn split_honors_quotes() {
        assert_eq!(
            shell_split(r#"grep "two words" 'single ''s'"#).unwrap(),
            vec!["grep", "two words", "single s"]
        );
    }

    #[test]
    fn split_rejects_unterminated_quote() {
        assert!(shell_split("echo 'oops").is_none());
        assert!(shell_split(r#"echo "oops"#).is_none());
    }

    #[test]
    fn normalize_is_stable_across_spacing() {
        let a = normalize_command("echo   hi    there").unwrap();
        let b = normalize_command("echo hi there").unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn normalize_quotes_only_when_needed() {
        let n = normalize_argv(&["echo".into(), "two words".into(), "plain".into()]);
        assert_eq!(n, "echo 'two words' plain");
    }

    #[test]
    fn equal_tokens_different_quoting_normalize_equal() {
        let a = normalize_command(r#"echo "hi there""#).unwrap();
        let b = normalize_command("echo 'hi there'").unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn resolve_bare_name_probes_safe_bins() {
        let dir = tempfile::tempdir().unwrap();
        let bin = dir.path().join("tool");
        std::fs::write(&bin, "#!/bin/sh\n").unwrap();

        let safe = vec![dir.path().to_string_lossy().to_string()];
        let resolved = resolve_argv0("tool", &safe).unwrap();
        assert_eq!(resolved, std::fs::canonicalize(&bin).unwrap());

        assert!(resolve_argv0("missing", &safe).is_none());
    }

    #[test]
    fn resolve_rejects_relative_and_foreign_paths() {
        let safe = vec!["/usr/bin".to_string()];
        assert!(resolve_argv0("./tool", &safe).is_none());
        assert!(resolve_argv0("../../bin/sh", &safe).is_none());
    }
}
