//! Overlay build orchestration.
//!
//! A build runs these phases in order, one git operation at a time:
//!
//! 1. resolve the selection (before anything touches git);
//! 2. sync trunk to the upstream tip;
//! 3. acquire the overlay target (worktree or main working copy);
//! 4. replay each selected patch branch, commit by commit;
//! 5. write provenance (build log entry, tip note);
//! 6. restore the caller's checkout when the build ran in place.
//!
//! A conflict that cannot be resolved leaves the working copy paused
//! mid-replay with earlier branches already applied. The bundle and the
//! build log entry are written before the error is returned.

pub mod replay;
pub mod sync;
pub mod target;

use std::collections::HashSet;
use std::path::PathBuf;

use chrono::Utc;
use forked_git::{GitError, GitOid, GitRepo};
use tracing::{info, instrument, warn};

use crate::conflict::{PrecedenceRules, RunMode};
use crate::config::ForkedConfig;
use crate::error::ForkedError;
use crate::provenance::{
    self, BuildRecord, ConflictRecord, LogEvent, PatchRecord, ProvenanceNote, RunStatus,
    SelectionRecord, SkipReason, SkippedCommit,
};
use crate::selection::{self, Selection, SelectionRequest};

pub use replay::{ConflictMode, ConflictOptions};
pub use sync::{SyncOptions, SyncOutcome, sync};
pub use target::OverlayTarget;

// ---------------------------------------------------------------------------
// Options / outcome
// ---------------------------------------------------------------------------

/// Inputs for [`build_overlay`].
#[derive(Clone, Debug)]
pub struct BuildOptions {
    /// What to build.
    pub request: SelectionRequest,
    /// Overlay id; defaults to the profile name, else today's date.
    pub id: Option<String>,
    /// Build in a dedicated worktree (subject to `worktree.enabled`).
    pub use_worktree: bool,
    /// Drop commits whose patch already exists upstream.
    pub skip_upstream_equivalents: bool,
    /// Attach the provenance note to the overlay tip.
    pub write_note: bool,
    /// Conflict handling.
    pub conflicts: ConflictOptions,
    /// Worktree root override (`FORKED_WORKTREES_DIR`).
    pub worktree_root: Option<String>,
}

impl Default for BuildOptions {
    fn default() -> Self {
        Self {
            request: SelectionRequest::default(),
            id: None,
            use_worktree: true,
            skip_upstream_equivalents: false,
            write_note: true,
            conflicts: ConflictOptions::default(),
            worktree_root: None,
        }
    }
}

/// Result of a successful build.
#[derive(Clone, Debug)]
pub struct BuildOutcome {
    pub overlay_id: String,
    pub overlay_branch: String,
    pub tip: GitOid,
    pub target: OverlayTarget,
    pub selection: Selection,
    pub patches: Vec<PatchRecord>,
    pub conflicts: Vec<ConflictRecord>,
}

// ---------------------------------------------------------------------------
// Build
// ---------------------------------------------------------------------------

/// Build an overlay branch from the selected patch stack.
///
/// # Errors
/// - [`ForkedError::Resolution`] for unknown names (no git call made).
/// - [`ForkedError::Precondition`] for a missing remote or patch branch,
///   a dirty working copy, or an unusable worktree root.
/// - [`ForkedError::ConflictStop`] when a conflict stays unresolved.
#[instrument(skip_all, fields(id = tracing::field::Empty))]
pub fn build_overlay(
    repo: &dyn GitRepo,
    cfg: &ForkedConfig,
    options: &BuildOptions,
) -> Result<BuildOutcome, ForkedError> {
    // Init
    let selection = selection::resolve(cfg, &options.request)?;
    let rules = PrecedenceRules::from_config(cfg, &selection.features)?;
    for pattern in selection.unmatched_include.iter().chain(&selection.unmatched_exclude) {
        warn!(pattern = %pattern, "selection pattern matched no patch branch");
    }
    let overlay_id = options
        .id
        .clone()
        .unwrap_or_else(|| default_overlay_id(&selection));
    tracing::Span::current().record("id", overlay_id.as_str());
    let overlay_branch = cfg.overlay_branch(&overlay_id);
    let original = repo.head_state(repo.root())?;
    if !(options.use_worktree && cfg.worktree.enabled) && !repo.is_clean(repo.root())? {
        return Err(ForkedError::precondition(format!(
            "working tree at {} is not clean; commit or stash first",
            repo.root().display()
        )));
    }

    let trunk_tip = sync_trunk(repo, cfg, &selection.patches)?;

    let target = target::acquire(
        repo,
        cfg,
        &overlay_id,
        &overlay_branch,
        trunk_tip,
        options.use_worktree,
        options.worktree_root.as_deref(),
    )?;

    let mut session = replay::ReplaySession::new(
        repo,
        &target.workdir,
        RunMode::Build,
        &overlay_id,
        rules,
        options.conflicts.clone(),
    );
    let mut patches = Vec::with_capacity(selection.patches.len());
    let mut failure = None;
    for branch in &selection.patches {
        match replay_branch(
            repo,
            &mut session,
            branch,
            trunk_tip,
            options.skip_upstream_equivalents,
        ) {
            Ok(record) => patches.push(record),
            Err((record, err)) => {
                patches.push(record);
                failure = Some(err);
                break;
            }
        }
    }

    if let Some(err) = failure.take_if(|e| !matches!(e, ForkedError::ConflictStop { .. })) {
        return Err(err);
    }

    let conflicts = session.into_conflicts();
    let record = BuildRecord {
        timestamp: Utc::now(),
        overlay: overlay_branch.clone(),
        worktree: target.reported.clone(),
        reused_worktree: target.reused,
        trunk: cfg.branches.trunk.clone(),
        upstream: cfg.upstream_display(),
        selection: SelectionRecord::new(&selection, options.skip_upstream_equivalents),
        patches: patches.clone(),
        conflicts: conflicts.clone(),
        status: if failure.is_some() {
            RunStatus::Conflict
        } else {
            RunStatus::Success
        },
    };
    provenance::append_event(repo.root(), &LogEvent::Build(record))?;
    if let Some(err) = failure {
        return Err(err);
    }

    let tip = repo.rev_parse(&format!("refs/heads/{overlay_branch}"))?;
    if options.write_note {
        let note = ProvenanceNote::new(&selection, options.skip_upstream_equivalents);
        provenance::write_note(repo, tip, &note)?;
    }

    if target.in_place {
        repo.checkout(repo.root(), &original.checkout_target())?;
    }

    info!(
        overlay = %overlay_branch,
        tip = %tip.short(),
        patches = patches.len(),
        "overlay built"
    );
    Ok(BuildOutcome {
        overlay_id,
        overlay_branch,
        tip,
        target,
        selection,
        patches,
        conflicts,
    })
}

/// The id used when none is given: the profile name, else today's date.
#[must_use]
pub fn default_overlay_id(selection: &Selection) -> String {
    selection
        .overlay_profile
        .clone()
        .unwrap_or_else(|| chrono::Local::now().format("%Y-%m-%d").to_string())
}

/// Replay one patch branch. On failure the partial record is returned with
/// the error so the build log still shows what was attempted.
fn replay_branch(
    repo: &dyn GitRepo,
    session: &mut replay::ReplaySession<'_>,
    branch: &str,
    trunk_tip: GitOid,
    skip_equivalents: bool,
) -> Result<PatchRecord, (PatchRecord, ForkedError)> {
    let mut record = PatchRecord {
        branch: branch.to_owned(),
        commit_count: 0,
        skipped_count: 0,
        skipped_commits: Vec::new(),
    };
    let commits = match plan_branch(repo, branch, trunk_tip, skip_equivalents) {
        Ok(plan) => plan,
        Err(err) => return Err((record, err)),
    };
    record.commit_count = commits.iter().filter(|(_, equivalent)| !equivalent).count();
    if commits.is_empty() {
        info!(branch, "already contained in trunk; nothing to replay");
    }

    for (commit, equivalent) in commits {
        let result = if equivalent {
            Ok(Some(SkipReason::UpstreamEquivalent))
        } else {
            session
                .cherry_pick(branch, commit)
                .map(|end| (end == replay::StepEnd::Skipped).then_some(SkipReason::Empty))
        };
        match result {
            Ok(None) => {}
            Ok(Some(reason)) => {
                let summary = repo.commit_summary(commit).unwrap_or_default();
                record.skipped_commits.push(SkippedCommit {
                    sha: commit,
                    summary,
                    reason,
                });
                record.skipped_count += 1;
            }
            Err(err) => return Err((record, err)),
        }
    }
    Ok(record)
}

/// Commits in `merge-base(trunk, branch)..branch`, oldest first, each
/// flagged if its patch already exists upstream.
fn plan_branch(
    repo: &dyn GitRepo,
    branch: &str,
    trunk_tip: GitOid,
    skip_equivalents: bool,
) -> Result<Vec<(GitOid, bool)>, ForkedError> {
    let tip = repo.rev_parse(branch)?;
    let base = repo.merge_base(trunk_tip, tip)?.ok_or_else(|| {
        ForkedError::precondition(format!(
            "patch branch '{branch}' shares no history with trunk"
        ))
    })?;
    let commits = repo.list_commits(base, tip)?;
    let equivalents: HashSet<GitOid> = if skip_equivalents && !commits.is_empty() {
        repo.upstream_equivalents(trunk_tip, tip, base)?
            .into_iter()
            .collect()
    } else {
        HashSet::new()
    };
    Ok(commits
        .into_iter()
        .map(|c| (c, equivalents.contains(&c)))
        .collect())
}

// ---------------------------------------------------------------------------
// Trunk sync
// ---------------------------------------------------------------------------

/// Fetch upstream and move trunk to the upstream tip.
///
/// Every branch in `patches` must exist before trunk is touched.
///
/// # Errors
/// Returns [`ForkedError::Precondition`] for a missing remote, upstream
/// branch, or patch branch, or if trunk's worktree has conflicting local
/// changes.
#[instrument(skip(repo, cfg, patches))]
pub fn sync_trunk(
    repo: &dyn GitRepo,
    cfg: &ForkedConfig,
    patches: &[String],
) -> Result<GitOid, ForkedError> {
    let remote = &cfg.upstream.remote;
    if !repo.has_remote(remote)? {
        return Err(ForkedError::precondition(format!(
            "remote '{remote}' is not configured; add it with `git remote add {remote} <url>`"
        )));
    }
    repo.fetch(remote)?;

    let upstream_tip = match repo.rev_parse(&cfg.upstream_ref()) {
        Ok(oid) => oid,
        Err(GitError::NotFound { .. }) => {
            return Err(ForkedError::precondition(format!(
                "upstream branch '{}' not found after fetch",
                cfg.upstream_display()
            )));
        }
        Err(e) => return Err(e.into()),
    };

    let missing: Vec<&str> = patches
        .iter()
        .map(String::as_str)
        .filter(|b| !matches!(repo.rev_parse_opt(b), Ok(Some(_))))
        .collect();
    if !missing.is_empty() {
        return Err(ForkedError::precondition(format!(
            "patch branch(es) not found: {}",
            missing.join(", ")
        )));
    }

    let trunk = &cfg.branches.trunk;
    let checked_out: Option<PathBuf> = repo
        .list_worktrees()?
        .into_iter()
        .find(|wt| wt.branch.as_deref() == Some(trunk.as_str()))
        .map(|wt| wt.path);
    match checked_out {
        Some(path) => repo.reset_keep(&path, upstream_tip)?,
        None => repo.set_branch(trunk, upstream_tip)?,
    }
    info!(trunk = %trunk, tip = %upstream_tip.short(), "trunk synced");
    Ok(upstream_tip)
}
