//! Outbound media path safety.
//!
//! Agents name local files to send out on channels; only paths under the
//! configured allow-roots may leave the machine. The check is TOCTOU-safe:
//! the file is opened with `O_NOFOLLOW`, the realpath containment is
//! re-verified against the opened descriptor, and `(dev, ino)` of the
//! descriptor must equal the stat of the resolved path.

use std::os::unix::fs::OpenOptionsExt;
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};

use tracing::{debug, warn};

use crate::error::{ExecError, Result};

/// A vetted outbound media file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VettedMedia {
    /// Fully resolved path, guaranteed under an allow-root.
    pub path: PathBuf,
    pub size: u64,
}

/// Accepts `file://` URLs, absolute paths, and `~`-prefixed paths.
pub fn normalize_media_input(input: &str) -> Option<PathBuf> {
    let stripped = input.strip_prefix("file://").unwrap_or(input);
    if let Some(rest) = stripped.strip_prefix("~/") {
        return dirs::home_dir().map(|home| home.join(rest));
    }
    if stripped == "~" {
        return dirs::home_dir();
    }
    let path = PathBuf::from(stripped);
    path.is_absolute().then_some(path)
}

/// Validate `input` against `allow_roots` and the size cap.
pub fn vet_media_path(input: &str, allow_roots: &[String], max_bytes: u64) -> Result<VettedMedia> {
    let candidate = normalize_media_input(input)
        .ok_or_else(|| ExecError::MediaRejected(format!("not an absolute local path: {input}")))?;

    let mut owning_root: Option<&str> = None;
    for root in allow_roots {
        if root.is_empty() {
            warn!("empty media allow-root entry ignored");
            continue;
        }
        let root_path = Path::new(root);
        match candidate.strip_prefix(root_path) {
            Ok(rel)
                if !rel.as_os_str().is_empty()
                    && !rel.starts_with("..")
                    && !rel.is_absolute() =>
            {
                owning_root = Some(root);
                break;
            }
            _ => {}
        }
    }
    let root = owning_root.ok_or_else(|| {
        ExecError::MediaRejected(format!(
            "path is outside every allowed media root: {}",
            candidate.display()
        ))
    })?;

    // O_NOFOLLOW: a symlink leaf fails the open with ELOOP.
    let file = std::fs::OpenOptions::new()
        .read(true)
        .custom_flags(nix::libc::O_NOFOLLOW)
        .open(&candidate)
        .map_err(|e| {
            if e.raw_os_error() == Some(nix::libc::ELOOP) {
                ExecError::MediaRejected(format!("symlink rejected: {}", candidate.display()))
            } else {
                ExecError::MediaRejected(format!("open failed: {}: {e}", candidate.display()))
            }
        })?;

    let real = std::fs::canonicalize(&candidate)
        .map_err(|e| ExecError::MediaRejected(format!("realpath failed: {e}")))?;
    let real_root = std::fs::canonicalize(root)
        .map_err(|e| ExecError::MediaRejected(format!("allow-root unresolvable: {root}: {e}")))?;
    if !real.starts_with(&real_root) {
        return Err(ExecError::MediaRejected(format!(
            "resolved path escapes the allowed root: {}",
            real.display()
        )));
    }

    // the descriptor we opened must be the file the resolved path names
    let fd_stat = nix::sys::stat::fstat(file.as_raw_fd())
        .map_err(|e| ExecError::MediaRejected(format!("fstat failed: {e}")))?;
    let path_stat = nix::sys::stat::stat(&real)
        .map_err(|e| ExecError::MediaRejected(format!("stat failed: {e}")))?;
    if fd_stat.st_dev != path_stat.st_dev || fd_stat.st_ino != path_stat.st_ino {
        return Err(ExecError::MediaRejected(
            "file changed between checks".to_string(),
        ));
    }

    let size = fd_stat.st_size.max(0) as u64;
    if size > max_bytes {
        return Err(ExecError::MediaTooLarge {
            size,
            max: max_bytes,
        });
    }

    debug!(path = %real.display(), size, "outbound media vetted");
    Ok(VettedMedia { path: real, size })
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
