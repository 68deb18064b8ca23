//! Value types for the forked git adapter.
//!
//! These types form the vocabulary shared between the [`GitRepo`](crate::GitRepo)
//! trait and its callers. They carry no process handles or backend state.

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

// ---------------------------------------------------------------------------
// GitOid
// ---------------------------------------------------------------------------

/// A git object identifier (SHA-1, 20 bytes).
///
/// Stored as raw bytes for cheap comparison and `Copy` semantics.
/// Displays (and serializes) as 40 lowercase hex characters.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct GitOid([u8; 20]);

impl GitOid {
    /// Create a `GitOid` from raw bytes.
    #[must_use]
    pub const fn from_bytes(bytes: [u8; 20]) -> Self {
        Self(bytes)
    }

    /// Return the raw bytes.
    #[must_use]
    pub const fn as_bytes(&self) -> &[u8; 20] {
        &self.0
    }

    /// The abbreviated (7 character) hex form used in human output.
    #[must_use]
    pub fn short(&self) -> String {
        let mut s = self.to_string();
        s.truncate(7);
        s
    }
}

impl fmt::Display for GitOid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in &self.0 {
            write!(f, "{byte:02x}")?;
        }
        Ok(())
    }
}

impl fmt::Debug for GitOid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "GitOid({self})")
    }
}

impl FromStr for GitOid {
    type Err = OidParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.len() != 40 {
            return Err(OidParseError {
                value: s.to_owned(),
                reason: format!("expected 40 hex characters, got {}", s.len()),
            });
        }
        let mut bytes = [0u8; 20];
        for (i, chunk) in s.as_bytes().chunks(2).enumerate() {
            let hi = hex_digit(chunk[0]).ok_or_else(|| OidParseError {
                value: s.to_owned(),
                reason: format!("invalid hex digit '{}'", chunk[0] as char),
            })?;
            let lo = hex_digit(chunk[1]).ok_or_else(|| OidParseError {
                value: s.to_owned(),
                reason: format!("invalid hex digit '{}'", chunk[1] as char),
            })?;
            bytes[i] = (hi << 4) | lo;
        }
        Ok(Self(bytes))
    }
}

impl Serialize for GitOid {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for GitOid {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

/// Error from parsing a hex string into a [`GitOid`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct OidParseError {
    /// The raw value that failed.
    pub value: String,
    /// Why it failed.
    pub reason: String,
}

impl fmt::Display for OidParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid OID {:?}: {}", self.value, self.reason)
    }
}

impl std::error::Error for OidParseError {}

const fn hex_digit(b: u8) -> Option<u8> {
    match b {
        b'0'..=b'9' => Some(b - b'0'),
        b'a'..=b'f' => Some(b - b'a' + 10),
        b'A'..=b'F' => Some(b - b'A' + 10),
        _ => None,
    }
}

// ---------------------------------------------------------------------------
// HeadState
// ---------------------------------------------------------------------------

/// Where a working copy's `HEAD` currently points.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum HeadState {
    /// On a named local branch (short name, e.g. `"trunk"`).
    Branch(String),
    /// Detached at a commit.
    Detached(GitOid),
}

impl HeadState {
    /// The string to hand back to `git checkout` to return here.
    #[must_use]
    pub fn checkout_target(&self) -> String {
        match self {
            Self::Branch(name) => name.clone(),
            Self::Detached(oid) => oid.to_string(),
        }
    }
}

// ---------------------------------------------------------------------------
// WorktreeInfo
// ---------------------------------------------------------------------------

/// One entry of `git worktree list --porcelain`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct WorktreeInfo {
    /// Absolute path of the worktree.
    pub path: PathBuf,
    /// The checked-out commit, if any (`None` for a bare entry).
    pub head: Option<GitOid>,
    /// Short name of the checked-out branch; `None` when detached or bare.
    pub branch: Option<String>,
}

// ---------------------------------------------------------------------------
// Replay
// ---------------------------------------------------------------------------

/// The VCS mechanism that replays commits.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ReplayKind {
    /// `git cherry-pick`, one commit at a time (overlay builds).
    CherryPick,
    /// `git rebase` of a whole branch (sync).
    Rebase,
}

impl ReplayKind {
    /// The git subcommand name.
    #[must_use]
    pub const fn subcommand(self) -> &'static str {
        match self {
            Self::CherryPick => "cherry-pick",
            Self::Rebase => "rebase",
        }
    }

    /// The exact command that resumes a paused replay.
    #[must_use]
    pub fn continue_command(self) -> String {
        format!("git {} --continue", self.subcommand())
    }

    /// The exact command that abandons a paused replay.
    #[must_use]
    pub fn abort_command(self) -> String {
        format!("git {} --abort", self.subcommand())
    }
}

/// Result of one replay step.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReplayOutcome {
    /// The step completed and produced (or kept) commits.
    Applied,
    /// The step stopped with unmerged paths in the index.
    Conflicted,
    /// The step stopped because the commit would be empty.
    Empty,
}

/// Which side of a conflict to keep.
///
/// During a cherry-pick or rebase, `Ours` is the branch being built on
/// (trunk lineage) and `Theirs` is the incoming patch commit.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Side {
    /// Keep the target branch's version.
    Ours,
    /// Keep the incoming commit's version.
    Theirs,
}

impl Side {
    /// The `git checkout` flag selecting this side.
    #[must_use]
    pub const fn checkout_flag(self) -> &'static str {
        match self {
            Self::Ours => "--ours",
            Self::Theirs => "--theirs",
        }
    }
}

/// One unmerged path in the index, with the blob at each stage.
///
/// A `None` stage means the file did not exist on that side.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ConflictEntry {
    /// Repository-relative path.
    pub path: String,
    /// Stage 1: merge base.
    pub base: Option<GitOid>,
    /// Stage 2: the branch being built on.
    pub ours: Option<GitOid>,
    /// Stage 3: the incoming commit.
    pub theirs: Option<GitOid>,
}

impl ConflictEntry {
    /// The blob for the requested side.
    #[must_use]
    pub const fn side(&self, side: Side) -> Option<GitOid> {
        match side {
            Side::Ours => self.ours,
            Side::Theirs => self.theirs,
        }
    }
}

// ---------------------------------------------------------------------------
// Diff / tags
// ---------------------------------------------------------------------------

/// One line of `git diff --numstat`.
///
/// Binary files report `None` for both counts.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NumstatEntry {
    /// Repository-relative path (post-rename name).
    pub path: String,
    /// Lines added.
    pub added: Option<u64>,
    /// Lines removed.
    pub removed: Option<u64>,
}

/// An annotated tag pointing at a commit.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TagInfo {
    /// Short tag name.
    pub name: String,
    /// Tag creation time, seconds since the epoch.
    pub created: i64,
    /// The full tag message.
    pub message: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    const HEX: &str = "0123456789abcdef0123456789abcdef01234567";

    #[test]
    fn oid_display_roundtrip() {
        let oid: GitOid = HEX.parse().unwrap();
        assert_eq!(oid.to_string(), HEX);
        assert_eq!(oid.short(), "0123456");
    }

    #[test]
    fn oid_accepts_uppercase() {
        let oid: GitOid = HEX.to_uppercase().parse().unwrap();
        assert_eq!(oid.to_string(), HEX);
    }

    #[test]
    fn oid_rejects_wrong_length() {
        let err = "abc".parse::<GitOid>().unwrap_err();
        assert!(err.reason.contains("expected 40"));
    }

    #[test]
    fn oid_rejects_non_hex() {
        let bad = format!("{}zz", &HEX[..38]);
        let err = bad.parse::<GitOid>().unwrap_err();
        assert!(err.reason.contains("invalid hex digit"));
    }

    #[test]
    fn replay_kind_resume_commands() {
        assert_eq!(
            ReplayKind::CherryPick.continue_command(),
            "git cherry-pick --continue"
        );
        assert_eq!(ReplayKind::Rebase.abort_command(), "git rebase --abort");
    }

    #[test]
    fn head_state_checkout_target() {
        let oid: GitOid = HEX.parse().unwrap();
        assert_eq!(HeadState::Branch("trunk".into()).checkout_target(), "trunk");
        assert_eq!(HeadState::Detached(oid).checkout_target(), HEX);
    }
}
