//! The [`GitRepo`] trait, the single boundary between forked and git.
//!
//! The overlay builder, the sync driver, and the guard engine only ever see
//! `&dyn GitRepo`. The trait is object-safe so tests can substitute a double.
//!
//! | Group      | Methods                                                     |
//! |------------|-------------------------------------------------------------|
//! | Remotes    | `has_remote`, `fetch`                                       |
//! | Rev-parse  | `rev_parse`, `rev_parse_opt`                                |
//! | Branches   | `head_state`, `set_branch`, `checkout`, `checkout_branch_at`|
//! | Reset      | `reset_hard`, `reset_keep`, `is_clean`                      |
//! | History    | `merge_base`, `list_commits`, `upstream_equivalents`, ...   |
//! | Replay     | `cherry_pick`, `rebase_onto`, `continue_replay`, ...        |
//! | Diff       | `changed_paths`, `numstat`, `tree_blobs`, `read_blob`       |
//! | Tags/notes | `annotated_tags_at`, `read_note`, `write_note`              |
//! | Worktrees  | `list_worktrees`, `prune_worktrees`, `add_worktree`         |

use std::collections::BTreeMap;
use std::path::Path;

use crate::error::GitError;
use crate::types::{
    ConflictEntry, GitOid, HeadState, NumstatEntry, ReplayKind, ReplayOutcome, Side, TagInfo,
    WorktreeInfo,
};

/// The git abstraction used by every forked component.
///
/// Methods that inspect or mutate a working copy take an explicit `workdir`
/// (the main checkout or a linked worktree). Methods that only touch refs
/// and objects run against [`root`](GitRepo::root).
///
/// # Object safety
///
/// No generic methods and no `Self` in return position. Callers may use
/// `&dyn GitRepo` or `Box<dyn GitRepo>`.
pub trait GitRepo {
    /// Absolute path of the main working tree.
    fn root(&self) -> &Path;

    // -----------------------------------------------------------------------
    // Remotes
    // -----------------------------------------------------------------------

    /// Whether a remote with this name is configured.
    fn has_remote(&self, name: &str) -> Result<bool, GitError>;

    /// Fetch from a remote, updating its remote-tracking refs.
    fn fetch(&self, remote: &str) -> Result<(), GitError>;

    // -----------------------------------------------------------------------
    // Rev-parse
    // -----------------------------------------------------------------------

    /// Resolve a revision expression to a commit OID.
    ///
    /// Returns [`GitError::NotFound`] if the revision does not resolve.
    fn rev_parse(&self, rev: &str) -> Result<GitOid, GitError>;

    /// Resolve a revision expression, returning `None` if it does not exist.
    fn rev_parse_opt(&self, rev: &str) -> Result<Option<GitOid>, GitError>;

    // -----------------------------------------------------------------------
    // Branches / HEAD
    // -----------------------------------------------------------------------

    /// Where `HEAD` points in `workdir`.
    fn head_state(&self, workdir: &Path) -> Result<HeadState, GitError>;

    /// Force a local branch to point at `target` (`git branch -f`).
    ///
    /// Fails if the branch is checked out in any worktree.
    fn set_branch(&self, name: &str, target: GitOid) -> Result<(), GitError>;

    /// Check out a branch name or commit in `workdir`.
    fn checkout(&self, workdir: &Path, target: &str) -> Result<(), GitError>;

    /// Create or reset `branch` at `start` and check it out (`git checkout -B`).
    fn checkout_branch_at(&self, workdir: &Path, branch: &str, start: GitOid)
    -> Result<(), GitError>;

    /// Hard-reset the current branch in `workdir` to `target`.
    fn reset_hard(&self, workdir: &Path, target: GitOid) -> Result<(), GitError>;

    /// Move the current branch in `workdir` to `target`, keeping local
    /// changes that do not conflict (`git reset --keep`).
    fn reset_keep(&self, workdir: &Path, target: GitOid) -> Result<(), GitError>;

    /// Whether tracked files in `workdir` have no staged or unstaged changes.
    ///
    /// Untracked files are ignored.
    fn is_clean(&self, workdir: &Path) -> Result<bool, GitError>;

    // -----------------------------------------------------------------------
    // History
    // -----------------------------------------------------------------------

    /// Best common ancestor of two commits, or `None` for unrelated histories.
    fn merge_base(&self, a: GitOid, b: GitOid) -> Result<Option<GitOid>, GitError>;

    /// Commits in `base..tip`, oldest first.
    fn list_commits(&self, base: GitOid, tip: GitOid) -> Result<Vec<GitOid>, GitError>;

    /// Commits in `base..tip` whose patch already exists in `upstream`'s
    /// history (patch-id equivalence, not SHA equality).
    fn upstream_equivalents(
        &self,
        upstream: GitOid,
        tip: GitOid,
        base: GitOid,
    ) -> Result<Vec<GitOid>, GitError>;

    /// The subject line of a commit.
    fn commit_summary(&self, commit: GitOid) -> Result<String, GitError>;

    /// Raw values of every `key:` trailer in a commit message, one per trailer.
    fn commit_trailer_values(&self, commit: GitOid, key: &str) -> Result<Vec<String>, GitError>;

    // -----------------------------------------------------------------------
    // Replay
    // -----------------------------------------------------------------------

    /// Cherry-pick one commit onto the current branch in `workdir`
    /// (`git cherry-pick -x`).
    fn cherry_pick(&self, workdir: &Path, commit: GitOid) -> Result<ReplayOutcome, GitError>;

    /// Rebase `branch` onto `onto` in `workdir`. Leaves `branch` checked out.
    fn rebase_onto(&self, workdir: &Path, branch: &str, onto: GitOid)
    -> Result<ReplayOutcome, GitError>;

    /// The replay currently paused in `workdir`, if any.
    fn replay_in_progress(&self, workdir: &Path) -> Result<Option<ReplayKind>, GitError>;

    /// The commit being replayed when the replay paused
    /// (`CHERRY_PICK_HEAD` / `REBASE_HEAD`).
    fn replay_head(&self, workdir: &Path) -> Result<Option<GitOid>, GitError>;

    /// Continue a paused replay without opening an editor.
    ///
    /// Returns [`ReplayOutcome::Conflicted`] if the replay stopped again on
    /// unmerged paths (for a rebase this is the next conflicting commit), and
    /// [`ReplayOutcome::Empty`] if the staged result is empty.
    fn continue_replay(&self, workdir: &Path, kind: ReplayKind)
    -> Result<ReplayOutcome, GitError>;

    /// Skip the commit the replay is paused on. A rebase may stop again.
    fn skip_replay(&self, workdir: &Path, kind: ReplayKind) -> Result<ReplayOutcome, GitError>;

    /// Forget a paused replay without moving `HEAD` (`--quit`).
    fn quit_replay(&self, workdir: &Path, kind: ReplayKind) -> Result<(), GitError>;

    /// Unmerged index entries in `workdir`, sorted by path.
    fn conflicted_entries(&self, workdir: &Path) -> Result<Vec<ConflictEntry>, GitError>;

    /// Resolve one conflicted path by keeping `side` and staging the result.
    ///
    /// If `side` has no version of the file, the path is removed.
    fn take_side(&self, workdir: &Path, entry: &ConflictEntry, side: Side)
    -> Result<(), GitError>;

    // -----------------------------------------------------------------------
    // Diff / objects
    // -----------------------------------------------------------------------

    /// Paths changed between `merge-base(from, to)` and `to`, sorted. A
    /// rename lists both the old and the new path.
    fn changed_paths(&self, from: GitOid, to: GitOid) -> Result<Vec<String>, GitError>;

    /// Per-file line counts between `merge-base(from, to)` and `to`.
    fn numstat(&self, from: GitOid, to: GitOid) -> Result<Vec<NumstatEntry>, GitError>;

    /// Every blob in the tree of `rev`, keyed by path.
    fn tree_blobs(&self, rev: GitOid) -> Result<BTreeMap<String, GitOid>, GitError>;

    /// Raw content of a blob.
    fn read_blob(&self, oid: GitOid) -> Result<Vec<u8>, GitError>;

    // -----------------------------------------------------------------------
    // Tags / notes
    // -----------------------------------------------------------------------

    /// Annotated tags pointing at `commit`, newest first.
    ///
    /// Lightweight tags are not returned.
    fn annotated_tags_at(&self, commit: GitOid) -> Result<Vec<TagInfo>, GitError>;

    /// The note attached to `commit` under `notes_ref`, if any.
    fn read_note(&self, notes_ref: &str, commit: GitOid) -> Result<Option<String>, GitError>;

    /// Attach (or replace) the note on `commit` under `notes_ref`.
    fn write_note(&self, notes_ref: &str, commit: GitOid, message: &str) -> Result<(), GitError>;

    // -----------------------------------------------------------------------
    // Worktrees
    // -----------------------------------------------------------------------

    /// All worktrees registered with the repository, main worktree first.
    fn list_worktrees(&self) -> Result<Vec<WorktreeInfo>, GitError>;

    /// Drop registrations of worktrees whose directories are gone.
    fn prune_worktrees(&self) -> Result<(), GitError>;

    /// Create a linked worktree at `path` with `branch` created or reset at
    /// `start` (`git worktree add -B`).
    fn add_worktree(&self, path: &Path, branch: &str, start: GitOid) -> Result<(), GitError>;
}
