//! Transcript file addressing and archival.
//!
//! Transcripts are JSON-lines files addressed only by `session_id`. Reads
//! probe an ordered candidate list (current layout, then older layouts so
//! upgrades keep their history); writes always use the canonical path.

use std::path::{Path, PathBuf};

use chrono::{SecondsFormat, Utc};
use tracing::{debug, warn};

/// Why a transcript is being archived; becomes part of the suffix.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArchiveReason {
    Reset,
    Deleted,
    Bak,
}

impl ArchiveReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            ArchiveReason::Reset => "reset",
            ArchiveReason::Deleted => "deleted",
            ArchiveReason::Bak => "bak",
        }
    }
}

pub struct TranscriptPaths {
    state_dir: PathBuf,
}

impl TranscriptPaths {
    pub fn new(state_dir: impl Into<PathBuf>) -> Self {
        Self {
            state_dir: state_dir.into(),
        }
    }

    /// Canonical (write) path: `<state>/agents/<agent>/sessions/<id>.jsonl`.
    pub fn canonical(&self, session_id: &str, agent_id: &str) -> PathBuf {
        self.state_dir
            .join("agents")
            .join(agent_id)
            .join("sessions")
            .join(format!("{session_id}.jsonl"))
    }

    /// Ordered candidates to probe on read:
    /// 1. the canonical agent-scoped path,
    /// 2. the flat store-directory neighbor (pre-multi-agent layout),
    /// 3. the legacy home dot-directory.
    pub fn resolve_candidates(&self, session_id: &str, agent_id: Option<&str>) -> Vec<PathBuf> {
        let agent = agent_id.unwrap_or("main");
        let mut candidates = vec![
            self.canonical(session_id, agent),
            self.state_dir
                .join("sessions")
                .join(format!("{session_id}.jsonl")),
        ];
        if let Some(home) = dirs::home_dir() {
            candidates.push(
                home.join(".crosstalk")
                    .join("sessions")
                    .join(format!("{session_id}.jsonl")),
            );
        }
        candidates
    }

    /// First existing candidate, if any.
    pub fn resolve_existing(&self, session_id: &str, agent_id: Option<&str>) -> Option<PathBuf> {
        self.resolve_candidates(session_id, agent_id)
            .into_iter()
            .find(|p| p.exists())
    }

    /// Rename every existing candidate in place with a
    /// `.<reason>.<iso-timestamp>` suffix. Best-effort: failures are logged
    /// and ignored, a missing transcript is not an error.
    pub fn archive(&self, session_id: &str, agent_id: Option<&str>, reason: ArchiveReason) {
        let stamp = Utc::now()
            .to_rfc3339_opts(SecondsFormat::Secs, true)
            .replace(':', "-");
        for candidate in self.resolve_candidates(session_id, agent_id) {
            if !candidate.exists() {
                continue;
            }
            let archived = archived_name(&candidate, reason, &stamp);
            match std::fs::rename(&candidate, &archived) {
                Ok(()) => debug!(from = %candidate.display(), to = %archived.display(), "transcript archived"),
                Err(e) => warn!(path = %candidate.display(), error = %e, "transcript archive failed"),
            }
        }
    }
}

fn archived_name(path: &Path, reason: ArchiveReason, stamp: &str) -> PathBuf {
    let file = path
        .file_name()
        .map(|f| f.to_string_lossy().to_string())
        .unwrap_or_default();
    path.with_file_name(format!("{file}.{}.{stamp}", reason.as_str()))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn canonical_path_is_agent_scoped() {
        let paths = TranscriptPaths::new("/state");
        assert_eq!(
            paths.canonical("s1", "main"),
            PathBuf::from("/state/agents/main/sessions/s1.jsonl")
        );
    }

    #[test]
    fn candidates_are_ordered_canonical_first() {
        let paths = TranscriptPaths::new("/state");
        let candidates = paths.resolve_candidates("s1", Some("work"));
        assert_eq!(
            candidates[0],
            PathBuf::from("/state/agents/work/sessions/s1.jsonl")
        );
        assert_eq!(candidates[1], PathBuf::from("/state/sessions/s1.jsonl"));
    }

    #[test]
    fn resolve_prefers_canonical_but_falls_back() {
        let dir = tempfile::tempdir().unwrap();
        let paths = TranscriptPaths::new(dir.path());

        // only the flat neighbor exists
        let flat = dir.path().join("sessions").join("s1.jsonl");
        std::fs::create_dir_all(flat.parent().unwrap()).unwrap();
        std::fs::write(&flat, "{}\n").unwrap();

        assert_eq!(paths.resolve_existing("s1", None), Some(flat.clone()));

        // once the canonical file appears it wins
        let canonical = paths.canonical("s1", "main");
        std::fs::create_dir_all(canonical.parent().unwrap()).unwrap();
        std::fs::write(&canonical, "{}\n").unwrap();
        assert_eq!(paths.resolve_existing("s1", None), Some(canonical));
    }

    #[test]
    fn archive_renames_with_reason_suffix() {
        let dir = tempfile::tempdir().unwrap();
        let paths = TranscriptPaths::new(dir.path());

        let canonical = paths.canonical("s1", "main");
        std::fs::create_dir_all(canonical.parent().unwrap()).unwrap();
        std::fs::write(&canonical, "{}\n").unwrap();

        paths.archive("s1", None, ArchiveReason::Reset);

        assert!(!canonical.exists());
        let archived: Vec<_> = std::fs::read_dir(canonical.parent().unwrap())
            .unwrap()
            .filter_map(|e| e.ok())
            .map(|e| e.file_name().to_string_lossy().to_string())
            .filter(|name| name.contains(".reset."))
            .collect();
        assert_eq!(archived.len(), 1);
        assert!(archived[0].starts_with("s1.jsonl.reset."));
    }

    #[test]
    fn archive_missing_transcript_is_silent() {
        let dir = tempfile::tempdir().unwrap();
        let paths = TranscriptPaths::new(dir.path());
        paths.archive("missing", None, ArchiveReason::Bak);
    }
}
