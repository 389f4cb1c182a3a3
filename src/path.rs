//! Canonical remote paths.
//!
//! The remote file API reports paths in whatever convention the host OS
//! uses: `D:\home\site\wwwroot\app.js` on Windows hosts,
//! `/home/site/wwwroot/app.js` on Linux hosts.  Everything else in this
//! crate addresses files by a *canonical path*: the forward-slash relative
//! path below the home directory sentinel (`site/wwwroot/app.js`).  The
//! empty string is the home directory itself.

use crate::errors::{RemoteError, RemoteResult};

/// The conventional home-directory marker on app hosts.
pub const DEFAULT_SENTINEL: &str = "home";

/// Translates raw remote paths into canonical paths.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PathTranslator {
    sentinel: String,
}

impl Default for PathTranslator {
    fn default() -> Self {
        Self::new(DEFAULT_SENTINEL)
    }
}

impl PathTranslator {
    pub fn new(sentinel: impl Into<String>) -> Self {
        Self {
            sentinel: sentinel.into(),
        }
    }

    pub fn sentinel(&self) -> &str {
        &self.sentinel
    }

    /// Strip everything up to and including the first sentinel segment.
    ///
    /// Backslashes are treated as separators and empty segments (doubled or
    /// trailing separators) are dropped.  Fails with
    /// [`RemoteError::MalformedPath`] when no segment equals the sentinel.
    pub fn canonicalize(&self, raw: &str) -> RemoteResult<String> {
        let normalized = raw.replace('\\', "/");
        let mut segments = normalized.split('/');

        // Consume segments until the sentinel has been seen.
        if !segments.by_ref().any(|s| s == self.sentinel) {
            return Err(RemoteError::MalformedPath(format!(
                "'{raw}' does not contain a '{}' segment",
                self.sentinel
            )));
        }

        Ok(segments
            .filter(|s| !s.is_empty())
            .collect::<Vec<_>>()
            .join("/"))
    }
}

/// Split a canonical path into its segments.
pub fn segments(path: &str) -> impl Iterator<Item = &str> {
    path.split('/').filter(|s| !s.is_empty())
}

/// Normalise a caller-supplied canonical path: no leading, trailing or
/// doubled separators, backslashes folded.
pub fn normalize(path: &str) -> String {
    let folded = path.replace('\\', "/");
    segments(&folded).collect::<Vec<_>>().join("/")
}

/// The parent of a canonical path, or `None` for the home directory.
pub fn parent_of(path: &str) -> Option<&str> {
    let trimmed = path.trim_end_matches('/');
    if trimmed.is_empty() {
        return None;
    }
    match trimmed.rfind('/') {
        Some(idx) => Some(&trimmed[..idx]),
        None => Some(""),
    }
}

/// The last segment of a canonical path (empty for the home directory).
pub fn file_name(path: &str) -> &str {
    let trimmed = path.trim_end_matches('/');
    match trimmed.rfind('/') {
        Some(idx) => &trimmed[idx + 1..],
        None => trimmed,
    }
}

/// Append a child name to a canonical directory path.
pub fn join(dir: &str, name: &str) -> String {
    if dir.is_empty() {
        name.to_string()
    } else {
        format!("{dir}/{name}")
    }
}
