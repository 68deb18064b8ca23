//! Error types for forked operations.
//!
//! Defines [`ForkedError`], the unified error type returned by the build,
//! sync, and guard entry points. Messages are written for whoever reads the
//! terminal next, human or agent: each variant says what went wrong and ends
//! with a "To fix:" hint. [`ForkedError::exit_code`] is the single source of
//! the process exit status.

use std::fmt;
use std::path::PathBuf;

use forked_git::GitError;

use crate::config::ConfigError;
use crate::selection::ResolutionError;

// ---------------------------------------------------------------------------
// ForkedError
// ---------------------------------------------------------------------------

/// Unified error type for forked operations.
#[derive(Debug)]
pub enum ForkedError {
    /// The selection request named something the configuration lacks.
    Resolution(ResolutionError),

    /// A replay stopped on a conflict; a bundle was written first.
    ConflictStop {
        /// Path of the persisted conflict bundle.
        bundle: PathBuf,
        /// Conflict episode number within the run.
        wave: u32,
        /// Patch branch being replayed.
        branch: String,
        /// Working copy left mid-replay.
        workdir: PathBuf,
        /// Command that resumes the replay.
        resume: String,
        /// Command that abandons the replay.
        abort: String,
        /// Why automatic resolution did not finish, if it was attempted.
        reason: Option<String>,
    },

    /// The guard failed under `block` or `require-override`.
    GuardViolation {
        /// What failed, including any missing override scopes.
        message: String,
        /// Path of the written report.
        report: PathBuf,
    },

    /// The environment is not in a state the operation can start from.
    Precondition {
        /// What is wrong.
        detail: String,
    },

    /// `forked.toml` is missing or invalid.
    Config(ConfigError),

    /// A git operation failed unexpectedly.
    Git(GitError),

    /// Reading or writing an artifact failed.
    Io(std::io::Error),
}

impl ForkedError {
    /// Process exit status for this error.
    #[must_use]
    pub const fn exit_code(&self) -> u8 {
        match self {
            Self::Resolution(_) | Self::GuardViolation { .. } => 2,
            Self::Config(_) => 3,
            Self::Precondition { .. } => 4,
            Self::ConflictStop { .. } => 10,
            Self::Git(_) | Self::Io(_) => 1,
        }
    }

    /// Shorthand for a [`ForkedError::Precondition`].
    pub fn precondition(detail: impl Into<String>) -> Self {
        Self::Precondition {
            detail: detail.into(),
        }
    }
}

// ---------------------------------------------------------------------------
// Display
// ---------------------------------------------------------------------------

impl fmt::Display for ForkedError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Resolution(err) => {
                write!(
                    f,
                    "could not resolve selection: {err}\n  To fix: check the names against the [features] and [overlays] tables in forked.toml."
                )
            }
            Self::ConflictStop {
                bundle,
                wave,
                branch,
                workdir,
                resume,
                abort,
                reason,
            } => {
                write!(
                    f,
                    "replay of '{branch}' stopped on a conflict (wave {wave})."
                )?;
                if let Some(reason) = reason {
                    write!(f, "\n  {reason}")?;
                }
                write!(
                    f,
                    "\n  Bundle: {}\n  To fix: resolve the conflicted files in {}, stage them, then run:\n    {resume}\n  Or abandon the replay with:\n    {abort}",
                    bundle.display(),
                    workdir.display()
                )
            }
            Self::GuardViolation { message, report } => {
                write!(
                    f,
                    "guard failed: {message}\n  Report: {}\n  To fix: resolve the violations, or add an override trailer covering the listed scopes.",
                    report.display()
                )
            }
            Self::Precondition { detail } => {
                write!(
                    f,
                    "{detail}\n  To fix: correct the repository state and retry."
                )
            }
            Self::Config(err) => {
                write!(
                    f,
                    "configuration error: {err}\n  To fix: edit forked.toml and correct the issue."
                )
            }
            Self::Git(err) => {
                write!(
                    f,
                    "git operation failed: {err}\n  To fix: check git state and retry. Run `git status` for details."
                )
            }
            Self::Io(err) => {
                write!(
                    f,
                    "I/O error: {err}\n  To fix: check file permissions and disk space."
                )
            }
        }
    }
}

// ---------------------------------------------------------------------------
// std::error::Error
// ---------------------------------------------------------------------------

impl std::error::Error for ForkedError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Resolution(err) => Some(err),
            Self::Config(err) => Some(err),
            Self::Git(err) => Some(err),
            Self::Io(err) => Some(err),
            _ => None,
        }
    }
}

// ---------------------------------------------------------------------------
// From impls
// ---------------------------------------------------------------------------

impl From<ResolutionError> for ForkedError {
    fn from(err: ResolutionError) -> Self {
        Self::Resolution(err)
    }
}

impl From<ConfigError> for ForkedError {
    fn from(err: ConfigError) -> Self {
        Self::Config(err)
    }
}

impl From<GitError> for ForkedError {
    fn from(err: GitError) -> Self {
        match err {
            GitError::DirtyWorktree { path, message } => Self::Precondition {
                detail: format!(
                    "working tree at {} has local changes: {message}",
                    path.display()
                ),
            },
            other => Self::Git(other),
        }
    }
}

impl From<std::io::Error> for ForkedError {
    fn from(err: std::io::Error) -> Self {
        Self::Io(err)
    }
}

impl From<serde_json::Error> for ForkedError {
    fn from(err: serde_json::Error) -> Self {
        Self::Io(err.into())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
