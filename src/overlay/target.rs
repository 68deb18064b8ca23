//! Overlay target acquisition: where the replay happens.
//!
//! With worktrees enabled each overlay gets its own working copy, so
//! concurrent builds of different overlays never share an index or `HEAD`.
//! A worktree already on the overlay branch is reused; otherwise a fresh
//! one is allocated under the worktree root. Without worktrees the build
//! runs in the main working copy, which must be clean.

use std::path::{Component, Path, PathBuf};

use forked_git::{GitOid, GitRepo, WorktreeInfo};
use tracing::{debug, info, instrument, warn};

use crate::config::ForkedConfig;
use crate::error::ForkedError;

/// Environment variable overriding `worktree.root`.
pub const WORKTREES_DIR_ENV: &str = "FORKED_WORKTREES_DIR";

/// Where an overlay build replays.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct OverlayTarget {
    /// Directory git commands run in.
    pub workdir: PathBuf,
    /// Path reported to the caller and the build log.
    pub reported: PathBuf,
    /// An existing worktree was reused.
    pub reused: bool,
    /// The build runs in the main working copy.
    pub in_place: bool,
}

/// Prepare a working copy on `overlay_branch` reset to `trunk_tip`.
///
/// `worktree_root` is the raw root setting (environment override already
/// applied by the caller, or `None` to use the configuration).
///
/// # Errors
/// Returns [`ForkedError::Precondition`] for a dirty main working copy or
/// an unusable worktree root, and [`ForkedError::Git`] if git fails.
#[instrument(skip(repo, cfg), fields(branch = overlay_branch))]
pub fn acquire(
    repo: &dyn GitRepo,
    cfg: &ForkedConfig,
    overlay_id: &str,
    overlay_branch: &str,
    trunk_tip: GitOid,
    use_worktree: bool,
    worktree_root: Option<&str>,
) -> Result<OverlayTarget, ForkedError> {
    if !(use_worktree && cfg.worktree.enabled) {
        return in_place(repo, overlay_id, overlay_branch, trunk_tip);
    }

    if let Some(existing) = find_worktree(repo, overlay_branch)? {
        return reuse(repo, &existing, overlay_branch, trunk_tip);
    }

    let raw_root = worktree_root.unwrap_or(&cfg.worktree.root);
    let path = allocate_path(repo.root(), raw_root, overlay_id)?;
    info!(path = %path.display(), "creating worktree");
    repo.add_worktree(&path, overlay_branch, trunk_tip)?;
    Ok(OverlayTarget {
        workdir: path.clone(),
        reported: path,
        reused: false,
        in_place: false,
    })
}

fn in_place(
    repo: &dyn GitRepo,
    overlay_id: &str,
    overlay_branch: &str,
    trunk_tip: GitOid,
) -> Result<OverlayTarget, ForkedError> {
    let root = repo.root().to_path_buf();
    if !repo.is_clean(&root)? {
        return Err(ForkedError::precondition(format!(
            "working tree at {} is not clean; commit or stash first",
            root.display()
        )));
    }
    repo.checkout_branch_at(&root, overlay_branch, trunk_tip)?;
    Ok(OverlayTarget {
        reported: root.join(format!(".overlay-{overlay_id}")),
        workdir: root,
        reused: false,
        in_place: true,
    })
}

/// A registered worktree with `branch` checked out. Registrations whose
/// directory has vanished are pruned first.
fn find_worktree(repo: &dyn GitRepo, branch: &str) -> Result<Option<WorktreeInfo>, ForkedError> {
    let on_branch = |list: Vec<WorktreeInfo>| {
        list.into_iter()
            .find(|wt| wt.branch.as_deref() == Some(branch))
    };
    let found = on_branch(repo.list_worktrees()?);
    match found {
        Some(wt) if !wt.path.exists() => {
            warn!(path = %wt.path.display(), "worktree directory missing; pruning");
            repo.prune_worktrees()?;
            Ok(on_branch(repo.list_worktrees()?))
        }
        other => Ok(other),
    }
}

fn reuse(
    repo: &dyn GitRepo,
    existing: &WorktreeInfo,
    overlay_branch: &str,
    trunk_tip: GitOid,
) -> Result<OverlayTarget, ForkedError> {
    let path = existing.path.clone();
    info!(path = %path.display(), "reusing worktree");
    if let Some(kind) = repo.replay_in_progress(&path)? {
        warn!(path = %path.display(), ?kind, "quitting paused replay in reused worktree");
        repo.quit_replay(&path, kind)?;
    }
    repo.reset_hard(&path, trunk_tip)?;
    let head = repo.head_state(&path)?;
    if head != forked_git::HeadState::Branch(overlay_branch.to_owned()) {
        repo.checkout_branch_at(&path, overlay_branch, trunk_tip)?;
    }
    Ok(OverlayTarget {
        workdir: path.clone(),
        reported: path,
        reused: true,
        in_place: false,
    })
}

/// Choose a fresh directory for overlay `id`.
///
/// Relative roots resolve against the repository root. A location inside
/// the repository tree is redirected to `<parent>/<repo-name>-worktrees/`.
/// An existing directory gets a `-1`, `-2`, ... suffix.
///
/// # Errors
/// Returns [`ForkedError::Precondition`] for a Windows-style absolute root
/// on a POSIX host, or if the parent directory cannot be created.
pub fn allocate_path(repo_root: &Path, raw_root: &str, id: &str) -> Result<PathBuf, ForkedError> {
    if cfg!(not(windows)) && looks_like_windows_absolute(raw_root) {
        return Err(ForkedError::precondition(format!(
            "worktree root '{raw_root}' looks like a Windows path on a POSIX host; set {WORKTREES_DIR_ENV} to an absolute POSIX path"
        )));
    }

    let root = Path::new(raw_root);
    let base = normalize(&if root.is_absolute() {
        root.to_path_buf()
    } else {
        repo_root.join(root)
    });

    let mut base = base;
    if base.starts_with(repo_root) {
        let name = repo_root
            .file_name()
            .map_or_else(|| "repo".to_owned(), |n| n.to_string_lossy().into_owned());
        let parent = repo_root.parent().unwrap_or(repo_root);
        let redirected = parent.join(format!("{name}-worktrees"));
        debug!(
            from = %base.display(),
            to = %redirected.display(),
            "worktree root is inside the repository; redirecting"
        );
        base = redirected;
    }

    std::fs::create_dir_all(&base).map_err(|e| {
        ForkedError::precondition(format!(
            "cannot create worktree root {}: {e}",
            base.display()
        ))
    })?;

    let candidate = base.join(id);
    if !candidate.exists() {
        return Ok(candidate);
    }
    warn!(path = %candidate.display(), "worktree directory exists; suffixing (run `git worktree prune` to clean stale entries)");
    let mut suffix = 1u32;
    loop {
        let alt = base.join(format!("{id}-{suffix}"));
        if !alt.exists() {
            return Ok(alt);
        }
        suffix += 1;
    }
}

fn looks_like_windows_absolute(raw: &str) -> bool {
    let bytes = raw.as_bytes();
    bytes.len() >= 3
        && bytes[0].is_ascii_alphabetic()
        && bytes[1] == b':'
        && (bytes[2] == b'\\' || bytes[2] == b'/')
}

/// Lexically resolve `.` and `..` without touching the filesystem.
fn normalize(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                out.pop();
            }
            other => out.push(other.as_os_str()),
        }
    }
    out
}
