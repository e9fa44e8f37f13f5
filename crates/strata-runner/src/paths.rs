//! Typed coordination-store path helpers.
//!
//! All runner state lives under three roots:
//!
//! - `/announcements/<host>` — ephemeral worker announcements
//! - `/status/<host>/<taskId>` — persistent per-task status nodes
//! - `/tasks/<host>/<taskId>` — persistent assignment nodes
//!
//! Hosts and task IDs are embedded as raw path segments, so segments are
//! validated against separators and control characters before use. Task IDs
//! may contain whitespace; whitespace is legal in a segment.

use crate::error::{Error, Result};

/// Root path for ephemeral worker announcements.
pub const ANNOUNCEMENTS_PATH: &str = "/announcements";
/// Root path for per-worker task status nodes.
pub const STATUS_PATH: &str = "/status";
/// Root path for per-worker assignment nodes.
pub const TASKS_PATH: &str = "/tasks";

/// Returns the announcement path for `host`.
#[must_use]
pub fn announcement_path(host: &str) -> String {
    format!("{ANNOUNCEMENTS_PATH}/{host}")
}

/// Returns the status root for `host`.
#[must_use]
pub fn status_root(host: &str) -> String {
    format!("{STATUS_PATH}/{host}")
}

/// Returns the status path for a task on `host`.
#[must_use]
pub fn status_path(host: &str, task_id: &str) -> String {
    format!("{STATUS_PATH}/{host}/{task_id}")
}

/// Returns the assignment root for `host`.
#[must_use]
pub fn assignment_root(host: &str) -> String {
    format!("{TASKS_PATH}/{host}")
}

/// Returns the assignment path for a task on `host`.
#[must_use]
pub fn assignment_path(host: &str, task_id: &str) -> String {
    format!("{TASKS_PATH}/{host}/{task_id}")
}

/// Returns the final segment of a store path.
#[must_use]
pub fn last_segment(path: &str) -> &str {
    path.rsplit('/').next().unwrap_or(path)
}

/// Validates a single path segment (a host or task ID).
///
/// # Errors
///
/// Returns [`Error::Serialization`] when the segment is empty, contains a
/// path separator, or contains control characters.
pub fn validate_segment(segment: &str) -> Result<()> {
    if segment.is_empty() {
        return Err(Error::serialization("path segment cannot be empty"));
    }
    if segment.contains('/') || segment.contains('\\') {
        return Err(Error::serialization(format!(
            "path segment '{segment}' cannot contain a separator"
        )));
    }
    if segment
        .chars()
        .any(|c| c == '\n' || c == '\r' || c == '\0')
    {
        return Err(Error::serialization(format!(
            "path segment '{segment}' cannot contain control characters"
        )));
    }
    Ok(())
}
