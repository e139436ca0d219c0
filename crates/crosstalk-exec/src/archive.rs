//! Archive extraction guard for installable downloads.
//!
//! Every entry path is validated before any bytes land on disk: traversal
//! out of the target root (leading `..`, absolute paths, drive/UNC forms)
//! aborts the extraction, and tar symlink/hardlink entries are always
//! rejected. Compressed tars whose metadata is not streamable (bzip2) are
//! preflighted with a `tar tf` listing; any bad entry aborts before
//! extraction begins.

use std::path::{Component, Path, PathBuf};
use std::time::Duration;

use tracing::{debug, info};

use crate::error::{ExecError, Result};
use crate::sanitize::{run_sanitized, ExecSpec};

/// Tar entry kinds the guard distinguishes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TarEntryKind {
    File,
    Directory,
    Symlink,
    Hardlink,
    Other,
}

/// Validate one entry name against the target root.
///
/// Returns the root-relative path the entry may be written to, or `None`
/// when `strip_components` consumed the whole name (the entry is skipped).
pub fn validate_entry_path(name: &str, strip_components: usize) -> Result<Option<PathBuf>> {
    if name.is_empty() {
        return Err(ExecError::ArchiveEntry("empty entry name".to_string()));
    }
    // absolute, drive-letter, and UNC forms never extract
    if name.starts_with('/') || name.starts_with('\\') {
        return Err(ExecError::ArchiveEntry(format!("absolute path: {name}")));
    }
    let bytes = name.as_bytes();
    if bytes.len() >= 2 && bytes[1] == b':' && bytes[0].is_ascii_alphabetic() {
        return Err(ExecError::ArchiveEntry(format!("drive-letter path: {name}")));
    }

    let mut normalized: Vec<String> = Vec::new();
    for component in Path::new(name).components() {
        match component {
            Component::Normal(part) => {
                normalized.push(part.to_string_lossy().to_string());
            }
            Component::CurDir => {}
            Component::ParentDir => {
                if normalized.pop().is_none() {
                    return Err(ExecError::ArchiveEntry(format!(
                        "path escapes extraction root: {name}"
                    )));
                }
            }
            Component::RootDir | Component::Prefix(_) => {
                return Err(ExecError::ArchiveEntry(format!("absolute path: {name}")));
            }
        }
    }

    if normalized.len() <= strip_components {
        return Ok(None);
    }
    let rel: PathBuf = normalized[strip_components..].iter().collect();
    Ok(Some(rel))
}

/// Validate a tar entry: link types are rejected outright, then the path
/// rules apply.
pub fn validate_tar_entry(
    name: &str,
    kind: TarEntryKind,
    strip_components: usize,
) -> Result<Option<PathBuf>> {
    match kind {
        TarEntryKind::Symlink => Err(ExecError::ArchiveEntry(format!(
            "symlink entry rejected: {name}"
        ))),
        TarEntryKind::Hardlink => Err(ExecError::ArchiveEntry(format!(
            "hardlink entry rejected: {name}"
        ))),
        _ => validate_entry_path(name, strip_components),
    }
}

/// Parse one line of `tar tvf` output into (kind, name). The type flag is
/// the first character of the mode column; link targets after " -> " are
/// not part of the name.
pub fn parse_tvf_line(line: &str) -> Option<(TarEntryKind, String)> {
    let trimmed = line.trim();
    if trimmed.is_empty() {
        return None;
    }
    let kind = match trimmed.chars().next()? {
        'l' => TarEntryKind::Symlink,
        'h' => TarEntryKind::Hardlink,
        'd' => TarEntryKind::Directory,
        '-' => TarEntryKind::File,
        _ => TarEntryKind::Other,
    };
    // name is everything after the 5th whitespace-separated column for GNU
    // tar (mode owner size date time name); be tolerant and take the tail
    let mut columns = 0;
    let mut index = 0;
    let mut in_space = false;
    for (i, c) in trimmed.char_indices() {
        if c.is_whitespace() {
            if !in_space {
                columns += 1;
                in_space = true;
            }
        } else {
            in_space = false;
            if columns >= 5 {
                index = i;
                break;
            }
        }
    }
    if index == 0 {
        return None;
    }
    let name = trimmed[index..]
        .split(" -> ")
        .next()
        .unwrap_or("")
        .to_string();
    if name.is_empty() {
        return None;
    }
    Some((kind, name))
}

/// Preflight an archive with `tar tvf`: list, validate every entry, abort
/// on the first bad one.
pub async fn preflight_tar(archive: &Path, strip_components: usize) -> Result<Vec<PathBuf>> {
    let spec = ExecSpec {
        argv: vec![
            "tar".to_string(),
            "tvf".to_string(),
            archive.to_string_lossy().to_string(),
        ],
        cwd: None,
        env: Default::default(),
        timeout: Duration::from_secs(60),
        output_cap: 4 * 1024 * 1024,
    };
    let outcome = run_sanitized(spec).await?;
    if outcome.exit_code != Some(0) {
        return Err(ExecError::Extract(format!(
            "tar listing failed: {}",
            outcome.stderr.trim()
        )));
    }

    let mut kept = Vec::new();
    for line in outcome.stdout.lines() {
        let Some((kind, name)) = parse_tvf_line(line) else {
            continue;
        };
        if let Some(rel) = validate_tar_entry(&name, kind, strip_components)? {
            kept.push(rel);
        }
    }
    debug!(archive = %archive.display(), entries = kept.len(), "tar preflight passed");
    Ok(kept)
}

/// Preflight, then extract a tar (any compression the system tar handles)
/// under `dest`.
pub async fn extract_tar(archive: &Path, dest: &Path, strip_components: usize) -> Result<()> {
    preflight_tar(archive, strip_components).await?;
    std::fs::create_dir_all(dest)?;

    let spec = ExecSpec {
        argv: vec![
            "tar".to_string(),
            "xf".to_string(),
            archive.to_string_lossy().to_string(),
            "-C".to_string(),
            dest.to_string_lossy().to_string(),
            format!("--strip-components={strip_components}"),
        ],
        cwd: None,
        env: Default::default(),
        timeout: Duration::from_secs(300),
        output_cap: 1024 * 1024,
    };
    let outcome = run_sanitized(spec).await?;
    if outcome.exit_code != Some(0) {
        return Err(ExecError::Extract(format!(
            "tar extraction failed: {}",
            outcome.stderr.trim()
        )));
    }
    info!(archive = %archive.display(), dest = %dest.display(), "archive extracted");
    Ok(())
}

/// Preflight a zip via `unzip -Z1` (bare name listing), then extract.
/// `unzip` cannot strip leading segments, so a nonzero `strip_components`
/// on a zip is refused.
pub async fn extract_zip(archive: &Path, dest: &Path, strip_components: usize) -> Result<()> {
    if strip_components != 0 {
        return Err(ExecError::Extract(
            "strip_components is not supported for zip archives".to_string(),
        ));
    }

    let list = ExecSpec {
        argv: vec![
            "unzip".to_string(),
            "-Z1".to_string(),
            archive.to_string_lossy().to_string(),
        ],
        cwd: None,
        env: Default::default(),
        timeout: Duration::from_secs(60),
        output_cap: 4 * 1024 * 1024,
    };
    let outcome = run_sanitized(list).await?;
    if outcome.exit_code != Some(0) {
        return Err(ExecError::Extract(format!(
            "zip listing failed: {}",
            outcome.stderr.trim()
        )));
    }
    for name in outcome.stdout.lines() {
        let name = name.trim();
        if !name.is_empty() {
            validate_entry_path(name, 0)?;
        }
    }

    std::fs::create_dir_all(dest)?;
    let extract = ExecSpec {
        argv: vec![
            "unzip".to_string(),
            "-o".to_string(),
            archive.to_string_lossy().to_string(),
            "-d".to_string(),
            dest.to_string_lossy().to_string(),
        ],
        cwd: None,
        env: Default::default(),
        timeout: Duration::from_secs(300),
        output_cap: 1024 * 1024,
    };
    let outcome = run_sanitized(extract).await?;
    if outcome.exit_code != Some(0) {
        return Err(ExecError::Extract(format!(
            "zip extraction failed: {}",
            outcome.stderr.trim()
        )));
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_relative_entries_pass() {
        assert_eq!(
            validate_entry_path("pkg/src/main.rs", 0).unwrap(),
            Some(PathBuf::from("pkg/src/main.rs"))
        );
    }

    #[test]
    fn strip_components_drops_leading_segments() {
        assert_eq!(
            validate_entry_path("pkg-1.2/src/main.rs", 1).unwrap(),
            Some(PathBuf::from("src/main.rs"))
        );
        // fully consumed by stripping → skipped, not an error
        assert_eq!(validate_entry_path("pkg-1.2", 1).unwrap(), None);
    }

    #[test]
    fn traversal_is_rejected() {
        assert!(validate_entry_path("../evil", 0).is_err());
        assert!(validate_entry_path("ok/../../evil", 0).is_err());
        // a dotdot that stays inside the tree is fine
        assert_eq!(
            validate_entry_path("a/b/../c", 0).unwrap(),
            Some(PathBuf::from("a/c"))
        );
    }

    #[test]
    fn absolute_and_drive_paths_are_rejected() {
        assert!(validate_entry_path("/etc/passwd", 0).is_err());
        assert!(validate_entry_path("C:evil.exe", 0).is_err());
        assert!(validate_entry_path("c:/evil.exe", 0).is_err());
        assert!(validate_entry_path("\\\\server\\share\\x", 0).is_err());
    }

    #[test]
    fn link_entries_are_always_rejected() {
        assert!(validate_tar_entry("link", TarEntryKind::Symlink, 0).is_err());
        assert!(validate_tar_entry("hard", TarEntryKind::Hardlink, 0).is_err());
        assert!(validate_tar_entry("file", TarEntryKind::File, 0).unwrap().is_some());
    }

    #[test]
    fn tvf_lines_parse_kind_and_name() {
        let (kind, name) =
            parse_tvf_line("-rw-r--r-- user/group 1024 2026-07-01 10:00 pkg/file.txt").unwrap();
        assert_eq!(kind, TarEntryKind::File);
        assert_eq!(name, "pkg/file.txt");

        let (kind, name) =
            parse_tvf_line("lrwxrwxrwx user/group 0 2026-07-01 10:00 pkg/link -> ../../etc/passwd")
                .unwrap();
        assert_eq!(kind, TarEntryKind::Symlink);
        assert_eq!(name, "pkg/link");
    }

    #[tokio::test]
    async fn preflight_lists_clean_tar_entries() {
        let dir = tempfile::tempdir().unwrap();
        let payload = dir.path().join("payload");
        std::fs::create_dir_all(payload.join("pkg")).unwrap();
        std::fs::write(payload.join("pkg/a.txt"), "a").unwrap();
        std::fs::write(payload.join("pkg/b.txt"), "b").unwrap();
        let archive = dir.path().join("clean.tar");

        let build = ExecSpec {
            argv: vec![
                "tar".to_string(),
                "cf".to_string(),
                archive.to_string_lossy().to_string(),
                "-C".to_string(),
                payload.to_string_lossy().to_string(),
                "pkg".to_string(),
            ],
            cwd: None,
            env: Default::default(),
            timeout: Duration::from_secs(30),
            output_cap: 1024 * 1024,
        };
        let built = run_sanitized(build).await.unwrap();
        assert_eq!(built.exit_code, Some(0), "tar cf failed: {}", built.stderr);

        let mut kept = preflight_tar(&archive, 1).await.unwrap();
        kept.sort();
        assert_eq!(kept, vec![PathBuf::from("a.txt"), PathBuf::from("b.txt")]);
    }

    #[tokio::test]
    async fn extract_tar_round_trips_clean_archive() {
        let dir = tempfile::tempdir().unwrap();
        let payload = dir.path().join("payload");
        std::fs::create_dir_all(payload.join("pkg")).unwrap();
        std::fs::write(payload.join("pkg/hello.txt"), "hi").unwrap();
        let archive = dir.path().join("clean.tar");

        let build = ExecSpec {
            argv: vec![
                "tar".to_string(),
                "cf".to_string(),
                archive.to_string_lossy().to_string(),
                "-C".to_string(),
                payload.to_string_lossy().to_string(),
                "pkg".to_string(),
            ],
            cwd: None,
            env: Default::default(),
            timeout: Duration::from_secs(30),
            output_cap: 1024 * 1024,
        };
        assert_eq!(run_sanitized(build).await.unwrap().exit_code, Some(0));

        let dest = dir.path().join("out");
        extract_tar(&archive, &dest, 1).await.unwrap();
        assert_eq!(
            std::fs::read_to_string(dest.join("hello.txt")).unwrap(),
            "hi"
        );
    }
}
