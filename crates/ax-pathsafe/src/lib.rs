//! # Safe Path Kernel
//!
//! Every filesystem path the host derives from untrusted input (channel
//! payloads, memory keys, skill names, identity file names) must be built
//! through this crate. It is the single sanctioned way to turn attacker
//! influenced strings into paths, and it guarantees the result stays inside
//! a declared base directory.
//!
//! ## Threat Model
//!
//! | Attack | Example segment | Defense |
//! |--------|-----------------|---------|
//! | Traversal | `../../etc/passwd` | `..` and separators rewritten to `_` |
//! | Absolute override | `/etc/passwd` | separators rewritten, join stays relative |
//! | NUL truncation | `notes\0.md` | NUL bytes rewritten to `_` |
//! | Drive/stream tricks | `C:secret` | `:` rewritten to `_` |
//! | Symlink escape | `link -> /` inside base | canonical resolution, prefix check |
//!
//! Two operations are exposed:
//!
//! - [`constrain`] builds a path from a base plus untrusted segments.
//! - [`assert_within`] re-checks a path that was previously stored and read
//!   back, without re-sanitizing it.
//!
//! Both fail with [`PathError::Escape`] when the resolved result is neither
//! the base itself nor a descendant of it.

use std::path::{Component, Path, PathBuf};

use thiserror::Error;

/// Maximum length of a single sanitized segment, in bytes.
const MAX_SEGMENT_BYTES: usize = 255;

/// Replacement for segments that sanitize down to nothing.
const EMPTY_PLACEHOLDER: &str = "_";

/// Errors from safe path construction.
#[derive(Debug, Error)]
pub enum PathError {
    /// The base directory could not be resolved.
    #[error("base directory unusable: {path}: {source}")]
    Base {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The candidate path resolved outside the base directory.
    #[error("path escapes base: {candidate} is not within {base}")]
    Escape { base: PathBuf, candidate: PathBuf },

    /// Filesystem error while resolving the candidate.
    #[error("path resolution failed: {0}")]
    Io(#[from] std::io::Error),
}

/// Result alias for path kernel operations.
pub type Result<T> = std::result::Result<T, PathError>;

/// Build a path under `base` from untrusted `segments`.
///
/// Each segment is sanitized (separators, `..`, `:`, and NUL become `_`;
/// surrounding whitespace and dots are stripped; empty segments become `_`;
/// at most 255 bytes survive), joined onto the canonicalized base, and the
/// result is resolved and checked for containment.
///
/// The final component is allowed to not exist yet, so callers can constrain
/// a path before creating the file. Containment is still checked against the
/// deepest existing ancestor, which defeats symlinks planted inside the base.
///
/// # Errors
///
/// [`PathError::Base`] when `base` cannot be canonicalized and
/// [`PathError::Escape`] when the result would land outside it.
///
/// # Example
///
/// ```
/// # let dir = tempfile::tempdir().unwrap();
/// # let base = dir.path();
/// let p = ax_pathsafe::constrain(base, &["notes", "../../../etc/passwd"]).unwrap();
/// assert!(p.starts_with(base));
/// ```
pub fn constrain<S: AsRef<str>>(base: impl AsRef<Path>, segments: &[S]) -> Result<PathBuf> {
    let base = canonical_base(base.as_ref())?;

    let mut joined = base.clone();
    for segment in segments {
        joined.push(sanitize_segment(segment.as_ref()));
    }

    let resolved = resolve_lenient(&joined)?;
    ensure_within(&base, resolved)
}

/// Re-check a previously constructed path against `base`.
///
/// Performs only canonical resolution and the containment check. Use this for
/// paths read back from storage, where sanitization already happened at write
/// time but the filesystem may have changed underneath.
pub fn assert_within(base: impl AsRef<Path>, candidate: impl AsRef<Path>) -> Result<PathBuf> {
    let base = canonical_base(base.as_ref())?;
    let resolved = resolve_lenient(candidate.as_ref())?;
    ensure_within(&base, resolved)
}

/// Sanitize one untrusted path segment into a plain file name.
///
/// This is exposed for callers that need the cleaned name itself, such as
/// workspace directory naming. The output never contains separators, `..`,
/// `:`, or NUL, and is at most 255 bytes.
pub fn sanitize_segment(segment: &str) -> String {
    let mut cleaned: String = segment
        .chars()
        .map(|c| match c {
            '/' | '\\' | ':' | '\0' => '_',
            c => c,
        })
        .collect();

    while cleaned.contains("..") {
        cleaned = cleaned.replace("..", "_");
    }

    let cleaned = cleaned
        .trim_matches(|c: char| c.is_whitespace() || c == '.')
        .to_string();

    let mut cleaned = if cleaned.is_empty() {
        EMPTY_PLACEHOLDER.to_string()
    } else {
        cleaned
    };

    if cleaned.len() > MAX_SEGMENT_BYTES {
        let mut cut = MAX_SEGMENT_BYTES;
        while !cleaned.is_char_boundary(cut) {
            cut -= 1;
        }
        cleaned.truncate(cut);
    }

    cleaned
}

fn canonical_base(base: &Path) -> Result<PathBuf> {
    base.canonicalize().map_err(|source| PathError::Base {
        path: base.to_path_buf(),
        source,
    })
}

/// Canonicalize the deepest existing ancestor of `path` and re-append the
/// rest. `canonicalize` alone fails on paths that do not exist yet.
fn resolve_lenient(path: &Path) -> Result<PathBuf> {
    if let Ok(resolved) = path.canonicalize() {
        return Ok(resolved);
    }

    let mut existing = path.to_path_buf();
    let mut tail: Vec<std::ffi::OsString> = Vec::new();

    loop {
        match existing.parent() {
            Some(parent) => {
                if let Some(name) = existing.file_name() {
                    tail.push(name.to_os_string());
                }
                existing = parent.to_path_buf();
                if existing.exists() {
                    break;
                }
            }
            None => break,
        }
    }

    let mut resolved = existing.canonicalize()?;
    for name in tail.iter().rev() {
        resolved.push(name);
    }

    // A `..` component smuggled past sanitization (e.g. via assert_within on
    // a stored path) must not survive resolution textually.
    let mut flattened = PathBuf::new();
    for comp in resolved.components() {
        match comp {
            Component::ParentDir => {
                flattened.pop();
            }
            Component::CurDir => {}
            other => flattened.push(other.as_os_str()),
        }
    }

    Ok(flattened)
}

fn ensure_within(base: &Path, candidate: PathBuf) -> Result<PathBuf> {
    if candidate == *base || candidate.starts_with(base) {
        Ok(candidate)
    } else {
        Err(PathError::Escape {
            base: base.to_path_buf(),
            candidate,
        })
    }
}
