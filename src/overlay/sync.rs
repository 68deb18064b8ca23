//! Patch-branch sync: move trunk to upstream and rebase every patch branch
//! onto it.
//!
//! Runs in the main working copy, which must be clean. Conflicts use the
//! same strategies and bundle format as builds, with `context.mode = sync`
//! and rebase resume commands. One rebase may stop several times; each
//! stop is its own wave.

use chrono::Utc;
use forked_git::GitRepo;
use tracing::{info, instrument};

use crate::conflict::{PrecedenceRules, RunMode};
use crate::config::ForkedConfig;
use crate::error::ForkedError;
use crate::provenance::{
    self, ConflictRecord, LogEvent, RunStatus, SyncBranchRecord, SyncBranchStatus, SyncRecord,
};

use super::replay::{ConflictOptions, ReplaySession};
use super::sync_trunk;

/// Bundle id used for sync runs (`sync-<wave>.json`).
pub const SYNC_BUNDLE_ID: &str = "sync";

/// Inputs for [`sync`].
#[derive(Clone, Debug, Default)]
pub struct SyncOptions {
    pub conflicts: ConflictOptions,
}

/// Result of a successful sync.
#[derive(Clone, Debug)]
pub struct SyncOutcome {
    pub branches: Vec<SyncBranchRecord>,
    pub conflicts: Vec<ConflictRecord>,
}

/// Sync trunk and rebase every branch in `patches.order` onto it.
///
/// # Errors
/// - [`ForkedError::Precondition`] for a dirty working copy, a missing
///   remote, or a missing patch branch.
/// - [`ForkedError::ConflictStop`] when a rebase conflict stays unresolved;
///   the branch is left mid-rebase and later branches are not touched.
#[instrument(skip_all)]
pub fn sync(
    repo: &dyn GitRepo,
    cfg: &ForkedConfig,
    options: &SyncOptions,
) -> Result<SyncOutcome, ForkedError> {
    let root = repo.root().to_path_buf();
    if !repo.is_clean(&root)? {
        return Err(ForkedError::precondition(format!(
            "working tree at {} is not clean; commit or stash first",
            root.display()
        )));
    }
    let all_features: Vec<String> = cfg.features.keys().cloned().collect();
    let rules = PrecedenceRules::from_config(cfg, &all_features)?;
    let original = repo.head_state(&root)?;

    let order = &cfg.patches.order;
    let trunk_tip = sync_trunk(repo, cfg, order)?;

    let mut session = ReplaySession::new(
        repo,
        &root,
        RunMode::Sync,
        SYNC_BUNDLE_ID,
        rules,
        options.conflicts.clone(),
    );
    let mut branches = Vec::with_capacity(order.len());
    let mut failure = None;
    for branch in order {
        let tip = repo.rev_parse(branch)?;
        if repo.merge_base(trunk_tip, tip)? == Some(trunk_tip) {
            branches.push(SyncBranchRecord {
                branch: branch.clone(),
                status: SyncBranchStatus::UpToDate,
            });
            continue;
        }
        match session.rebase(branch, trunk_tip) {
            Ok(_) => {
                info!(branch = %branch, "rebased");
                branches.push(SyncBranchRecord {
                    branch: branch.clone(),
                    status: SyncBranchStatus::Rebased,
                });
            }
            Err(err @ ForkedError::ConflictStop { .. }) => {
                branches.push(SyncBranchRecord {
                    branch: branch.clone(),
                    status: SyncBranchStatus::Conflict,
                });
                failure = Some(err);
                break;
            }
            Err(err) => return Err(err),
        }
    }

    let conflicts = session.into_conflicts();
    let record = SyncRecord {
        timestamp: Utc::now(),
        trunk: cfg.branches.trunk.clone(),
        upstream: cfg.upstream_display(),
        branches: branches.clone(),
        conflicts: conflicts.clone(),
        status: if failure.is_some() {
            RunStatus::Conflict
        } else {
            RunStatus::Success
        },
    };
    provenance::append_event(&root, &LogEvent::Sync(record))?;
    if let Some(err) = failure {
        return Err(err);
    }

    repo.checkout(&root, &original.checkout_target())?;
    Ok(SyncOutcome {
        branches,
        conflicts,
    })
}
