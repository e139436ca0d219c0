//! Sanitized subprocess execution.
//!
//! Sub-execs run with a scrubbed environment: caller `PATH` overrides are
//! ignored and loader/interpreter injection variables are stripped. Output
//! is capped and a timeout SIGKILLs the child.

use std::collections::HashMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use tokio::io::AsyncReadExt;
use tokio::process::Command;
use tracing::{debug, warn};

use crate::error::{ExecError, Result};
use crate::truncate::{cap_output, DEFAULT_OUTPUT_CAP};

/// Exact environment keys never forwarded to a child.
const STRIPPED_KEYS: &[&str] = &[
    "NODE_OPTIONS",
    "PYTHONHOME",
    "PYTHONPATH",
    "PERL5LIB",
    "PERL5OPT",
    "RUBYOPT",
];

/// Key prefixes never forwarded (dynamic-loader injection).
const STRIPPED_PREFIXES: &[&str] = &["DYLD_", "LD_"];

#[derive(Debug, Clone)]
pub struct ExecSpec {
    pub argv: Vec<String>,
    pub cwd: Option<PathBuf>,
    /// Caller-supplied additions; sanitized before use.
    pub env: HashMap<String, String>,
    pub timeout: Duration,
    pub output_cap: usize,
}

impl ExecSpec {
    pub fn new(argv: Vec<String>) -> Self {
        Self {
            argv,
            cwd: None,
            env: HashMap::new(),
            timeout: Duration::from_secs(120),
            output_cap: DEFAULT_OUTPUT_CAP,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ExecOutcome {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: Option<i32>,
    pub truncated: bool,
    pub timed_out: bool,
}

/// Drop dangerous keys from a caller-supplied environment. `PATH` is
/// removed outright — the child inherits the gateway's own `PATH`.
pub fn sanitize_env(env: &HashMap<String, String>) -> HashMap<String, String> {
    env.iter()
        .filter(|(key, _)| {
            let upper = key.to_uppercase();
            if upper == "PATH" {
                return false;
            }
            if STRIPPED_KEYS.contains(&upper.as_str()) {
                return false;
            }
            !STRIPPED_PREFIXES
                .iter()
                .any(|prefix| upper.starts_with(prefix))
        })
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect()
}

/// Run the spec to completion. Timeout SIGKILLs the child and marks the
/// outcome; overflowing output is capped with a truncation suffix.
pub async fn run_sanitized(spec: ExecSpec) -> Result<ExecOutcome> {
    let Some((program, args)) = spec.argv.split_first() else {
        return Err(ExecError::Spawn("empty argv".to_string()));
    };

    let mut command = Command::new(program);
    command
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    if let Some(cwd) = &spec.cwd {
        command.current_dir(cwd);
    }
    for (key, value) in sanitize_env(&spec.env) {
        command.env(key, value);
    }

    let mut child = command
        .spawn()
        .map_err(|e| ExecError::Spawn(format!("{program}: {e}")))?;

    // Drain both pipes concurrently so a chatty child never blocks on a
    // full pipe while we wait for exit.
    let stdout_task = drain(child.stdout.take(), spec.output_cap);
    let stderr_task = drain(child.stderr.take(), spec.output_cap);

    let mut timed_out = false;
    let status = match tokio::time::timeout(spec.timeout, child.wait()).await {
        Ok(status) => Some(status?),
        Err(_) => {
            timed_out = true;
            warn!(program, timeout_ms = spec.timeout.as_millis() as u64, "sub-exec timed out, killing");
            if let Err(e) = child.start_kill() {
                warn!(error = %e, "kill after timeout failed");
            }
            child.wait().await.ok()
        }
    };

    let (stdout_raw, stdout_overflow) = stdout_task.await.unwrap_or_default();
    let (stderr_raw, stderr_overflow) = stderr_task.await.unwrap_or_default();

    let (stdout, stdout_cut) = cap_output(&stdout_raw, spec.output_cap);
    let (stderr, stderr_cut) = cap_output(&stderr_raw, spec.output_cap);

    let outcome = ExecOutcome {
        stdout,
        stderr,
        exit_code: status.and_then(|s| s.code()),
        truncated: stdout_overflow || stderr_overflow || stdout_cut || stderr_cut,
        timed_out,
    };
    debug!(
        program,
        exit = ?outcome.exit_code,
        truncated = outcome.truncated,
        timed_out = outcome.timed_out,
        "sub-exec finished"
    );
    Ok(outcome)
}

/// Spawn a task draining a pipe to EOF, keeping at most `cap + 1` bytes
/// (the overhang only signals that truncation happened; the rest is read
/// and discarded so the child never blocks on a full pipe).
fn drain<R>(reader: Option<R>, cap: usize) -> tokio::task::JoinHandle<(String, bool)>
where
    R: tokio::io::AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let Some(mut reader) = reader else {
            return (String::new(), false);
        };
        let mut kept: Vec<u8> = Vec::new();
        let mut overflow = false;
        let mut chunk = [0u8; 8192];
        loop {
            match reader.read(&mut chunk).await {
                Ok(0) => break,
                Ok(n) => {
                    if kept.len() < cap + 1 {
                        let take = (cap + 1 - kept.len()).min(n);
                        kept.extend_from_slice(&chunk[..take]);
                        if take < n {
                            overflow = true;
                        }
                    } else {
                        overflow = true;
                    }
                }
                Err(_) => break,
            }
        }
        (String::from_utf8_lossy(&kept).to_string(), overflow)
    })
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn caller_env(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn path_override_is_ignored() {
        let env = sanitize_env(&caller_env(&[("PATH", "/tmp/evil"), ("HOME", "/home/u")]));
        assert!(!env.contains_key("PATH"));
        assert_eq!(env.get("HOME").map(String::as_str), Some("/home/u"));
    }

    #[test]
    fn loader_injection_keys_are_stripped() {
        let env = sanitize_env(&caller_env(&[
            ("LD_PRELOAD", "/tmp/evil.so"),
            ("DYLD_INSERT_LIBRARIES", "/tmp/evil.dylib"),
            ("NODE_OPTIONS", "--require /tmp/evil.js"),
            ("PYTHONPATH", "/tmp"),
            ("PERL5OPT", "-M/tmp"),
            ("RUBYOPT", "-r/tmp"),
            ("TERM", "xterm"),
        ]));
        assert_eq!(env.len(), 1);
        assert!(env.contains_key("TERM"));
    }

    #[test]
    fn stripping_is_case_insensitive_on_key() {
        let env = sanitize_env(&caller_env(&[("ld_preload", "/tmp/evil.so")]));
        assert!(env.is_empty());
    }

    #[tokio::test]
    async fn echo_round_trips() {
        let outcome = run_sanitized(ExecSpec::new(vec![
            "/bin/echo".to_string(),
            "hello".to_string(),
        ]))
        .await
        .unwrap();
        assert_eq!(outcome.stdout.trim(), "hello");
        assert_eq!(outcome.exit_code, Some(0));
        assert!(!outcome.truncated);
        assert!(!outcome.timed_out);
    }

    #[tokio::test]
    async fn timeout_kills_and_flags() {
        let mut spec = ExecSpec::new(vec!["/bin/sleep".to_string(), "5".to_string()]);
        spec.timeout = Duration::from_millis(150);
        let outcome = run_sanitized(spec).await.unwrap();
        assert!(outcome.timed_out);
        assert_eq!(outcome.exit_code, None, "SIGKILL leaves no exit code");
    }

    #[tokio::test]
    async fn overflowing_output_is_marked_truncated() {
        let mut spec = ExecSpec::new(vec![
            "/bin/sh".to_string(),
            "-c".to_string(),
            "yes x | head -c 4096".to_string(),
        ]);
        spec.output_cap = 512;
        let outcome = run_sanitized(spec).await.unwrap();
        assert!(outcome.truncated);
        assert!(outcome.stdout.ends_with(crate::truncate::TRUNCATION_SUFFIX));
    }

    #[tokio::test]
    async fn empty_argv_is_a_spawn_error() {
        let err = run_sanitized(ExecSpec::new(Vec::new())).await.unwrap_err();
        assert!(matches!(err, ExecError::Spawn(_)));
    }
}
