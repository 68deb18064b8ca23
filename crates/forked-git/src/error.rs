//! Error types for git operations.
//!
//! [`GitError`] is the single error type returned by all [`GitRepo`](crate::GitRepo)
//! trait methods. Callers match on the variant (missing object, failed
//! command, dirty worktree) instead of parsing messages.

use std::path::PathBuf;

use thiserror::Error;

/// Errors returned by [`GitRepo`](crate::GitRepo) operations.
#[derive(Debug, Error)]
pub enum GitError {
    /// A requested object, ref, or path was not found.
    #[error("not found: {message}")]
    NotFound {
        /// Human-readable description of what was missing.
        message: String,
    },

    /// A git command exited unsuccessfully.
    #[error("`{command}` failed{}: {stderr}", exit_suffix(.exit_code))]
    CommandFailed {
        /// The full command line (for diagnostics).
        command: String,
        /// Captured stderr, trimmed.
        stderr: String,
        /// Process exit code, if the process was not killed by a signal.
        exit_code: Option<i32>,
    },

    /// An operation was refused because the working tree has uncommitted changes.
    #[error("dirty worktree at {}: {message}", path.display())]
    DirtyWorktree {
        /// Path to the worktree root.
        path: PathBuf,
        /// What was dirty.
        message: String,
    },

    /// git printed something that should have been an object id but was not.
    #[error("invalid OID `{value}`: {reason}")]
    InvalidOid {
        /// The raw value that failed validation.
        value: String,
        /// Why validation failed.
        reason: String,
    },

    /// Spawning git or touching the file system failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

#[allow(clippy::ref_option)]
fn exit_suffix(code: &Option<i32>) -> String {
    code.map(|c| format!(" (exit {c})")).unwrap_or_default()
}

impl From<crate::types::OidParseError> for GitError {
    fn from(e: crate::types::OidParseError) -> Self {
        Self::InvalidOid {
            value: e.value,
            reason: e.reason,
        }
    }
}
