//! Replay of patch commits and conflict handling.
//!
//! A [`ReplaySession`] owns the wave counter for one invocation. Every
//! conflict episode, in any branch, takes the next wave number, so bundles
//! written by one run never overwrite each other.

use std::fmt;
use std::path::{Path, PathBuf};
use std::process::Command;

use forked_git::{GitOid, GitRepo, ReplayKind, ReplayOutcome, Side};
use tracing::{debug, info, instrument, warn};

use crate::conflict::{
    self, BlobsLocation, BundleContext, BundleLocation, ConflictBundle, Precedence,
    PrecedenceRules, RunMode,
};
use crate::error::ForkedError;
use crate::provenance::{ConflictRecord, ConflictResult};

/// Placeholder in an exec command replaced by the bundle path.
pub const BUNDLE_PLACEHOLDER: &str = "{json}";

// ---------------------------------------------------------------------------
// Options
// ---------------------------------------------------------------------------

/// What to do when a replay step conflicts.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub enum ConflictMode {
    /// Write a bundle and stop.
    #[default]
    Stop,
    /// Resolve by path bias, continue; stop if anything stays unresolved.
    Bias,
    /// Run an external resolver with the bundle path, then continue.
    Exec(String),
}

impl ConflictMode {
    fn label(&self) -> &'static str {
        match self {
            Self::Stop => "stop",
            Self::Bias => "bias",
            Self::Exec(_) => "exec",
        }
    }
}

impl fmt::Display for ConflictMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Conflict handling settings shared by build and sync.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ConflictOptions {
    pub mode: ConflictMode,
    /// Bundles were requested (`--emit-conflicts`), with or without a path.
    pub emit: bool,
    /// Explicit bundle path stem (`--emit-conflicts PATH`).
    pub emit_path: Option<PathBuf>,
    /// Raw blob export (`--conflict-blobs-dir [DIR]`).
    pub blobs: Option<BlobsLocation>,
}

// ---------------------------------------------------------------------------
// Session
// ---------------------------------------------------------------------------

/// How a replay step finally ended.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StepEnd {
    /// The commit (or the rest of the rebase) landed.
    Applied,
    /// The commit produced no change and was skipped.
    Skipped,
}

/// Replay state for one invocation.
pub struct ReplaySession<'a> {
    repo: &'a dyn GitRepo,
    workdir: PathBuf,
    mode: RunMode,
    rules: PrecedenceRules,
    location: BundleLocation,
    options: ConflictOptions,
    wave: u32,
    conflicts: Vec<ConflictRecord>,
}

impl<'a> ReplaySession<'a> {
    /// A session replaying in `workdir`. `id` names the bundles.
    #[must_use]
    pub fn new(
        repo: &'a dyn GitRepo,
        workdir: &Path,
        mode: RunMode,
        id: &str,
        rules: PrecedenceRules,
        options: ConflictOptions,
    ) -> Self {
        let location = BundleLocation::new(
            repo.root(),
            id,
            options.emit_path.as_deref(),
            options.blobs.clone(),
        );
        Self {
            repo,
            workdir: workdir.to_path_buf(),
            mode,
            rules,
            location,
            options,
            wave: 0,
            conflicts: Vec::new(),
        }
    }

    /// Consume the session, returning its conflict records.
    #[must_use]
    pub fn into_conflicts(self) -> Vec<ConflictRecord> {
        self.conflicts
    }

    fn kind(&self) -> ReplayKind {
        self.mode.replay_kind()
    }

    fn next_wave(&mut self) -> u32 {
        self.wave += 1;
        self.wave
    }

    /// Cherry-pick `commit` and settle the result.
    ///
    /// # Errors
    /// Returns [`ForkedError::ConflictStop`] if a conflict could not be
    /// resolved under the configured mode.
    pub fn cherry_pick(&mut self, branch: &str, commit: GitOid) -> Result<StepEnd, ForkedError> {
        let outcome = self.repo.cherry_pick(&self.workdir, commit)?;
        self.settle(branch, outcome)
    }

    /// Rebase `branch` onto `onto` and settle every stop along the way.
    ///
    /// # Errors
    /// Returns [`ForkedError::ConflictStop`] if a conflict could not be
    /// resolved under the configured mode.
    pub fn rebase(&mut self, branch: &str, onto: GitOid) -> Result<StepEnd, ForkedError> {
        let outcome = self.repo.rebase_onto(&self.workdir, branch, onto)?;
        self.settle(branch, outcome)
    }

    /// Drive a paused replay to completion or to a stop.
    ///
    /// A cherry-pick settles after one episode. A rebase can stop again on
    /// a later commit, which starts a new episode with its own wave.
    fn settle(&mut self, branch: &str, mut outcome: ReplayOutcome) -> Result<StepEnd, ForkedError> {
        let mut end = StepEnd::Applied;
        loop {
            match outcome {
                ReplayOutcome::Applied => return Ok(end),
                ReplayOutcome::Empty => {
                    debug!(branch, "skipping empty replay step");
                    outcome = self.repo.skip_replay(&self.workdir, self.kind())?;
                    if self.kind() == ReplayKind::CherryPick {
                        end = StepEnd::Skipped;
                    }
                }
                ReplayOutcome::Conflicted => {
                    outcome = self.resolve_episode(branch)?;
                    if outcome == ReplayOutcome::Conflicted && self.kind() == ReplayKind::CherryPick {
                        let wave = self.next_wave();
                        let commit = self.repo.replay_head(&self.workdir)?;
                        return Err(self.stop(
                            branch,
                            commit,
                            wave,
                            Some("continuing the replay raised new conflicts".to_owned()),
                        )?);
                    }
                }
            }
        }
    }

    /// Handle one conflict episode. Returns the outcome of continuing.
    #[instrument(skip(self), fields(mode = %self.options.mode, wave = self.wave + 1))]
    fn resolve_episode(&mut self, branch: &str) -> Result<ReplayOutcome, ForkedError> {
        let wave = self.next_wave();
        let commit = self.repo.replay_head(&self.workdir)?;
        info!(branch, wave, "replay conflict");

        match self.options.mode.clone() {
            ConflictMode::Stop => Err(self.stop(branch, commit, wave, None)?),
            ConflictMode::Bias => {
                let bundle = self.capture(branch, commit, wave)?;
                let kept = if self.options.emit || self.location.is_explicit() {
                    Some(self.persist(bundle.clone())?)
                } else {
                    None
                };
                let unresolved = self.apply_bias(&bundle)?;
                if unresolved > 0 {
                    let reason = format!("path bias left {unresolved} file(s) unresolved");
                    return Err(self.stop(branch, commit, wave, Some(reason))?);
                }
                let outcome = self.repo.continue_replay(&self.workdir, self.kind())?;
                self.record(kept, wave, branch, commit, ConflictResult::AutoContinued);
                Ok(outcome)
            }
            ConflictMode::Exec(command) => {
                let bundle = self.capture(branch, commit, wave)?;
                let path = self.persist(bundle)?;
                if let Err(reason) = run_resolver(&command, &path, &self.workdir) {
                    return Err(self.stop_with_bundle(branch, commit, wave, path, Some(reason)));
                }
                if self.repo.replay_in_progress(&self.workdir)?.is_none() {
                    self.record(Some(path), wave, branch, commit, ConflictResult::ExecContinued);
                    return Ok(ReplayOutcome::Applied);
                }
                let remaining = self.repo.conflicted_entries(&self.workdir)?.len();
                if remaining > 0 {
                    let reason = format!("resolver left {remaining} file(s) unresolved");
                    return Err(self.stop(branch, commit, wave, Some(reason))?);
                }
                let outcome = self.repo.continue_replay(&self.workdir, self.kind())?;
                self.record(Some(path), wave, branch, commit, ConflictResult::ExecContinued);
                Ok(outcome)
            }
        }
    }

    /// Take the recommended side for every file the bundle can resolve.
    /// Returns how many conflicted files are left for a human.
    fn apply_bias(&self, bundle: &ConflictBundle) -> Result<usize, ForkedError> {
        let entries = self.repo.conflicted_entries(&self.workdir)?;
        let mut resolved = 0;
        for (file, precedence) in bundle.resolvable() {
            let Some(entry) = entries.iter().find(|e| e.path == file.path) else {
                continue;
            };
            let side = match precedence {
                Precedence::Theirs => Side::Theirs,
                Precedence::Ours | Precedence::Manual => Side::Ours,
            };
            debug!(path = %entry.path, ?side, "bias");
            self.repo.take_side(&self.workdir, entry, side)?;
            resolved += 1;
        }
        let unresolved = entries.len() - resolved;
        debug!(wave = bundle.wave, unresolved, "bias applied");
        Ok(unresolved)
    }

    fn capture(
        &self,
        branch: &str,
        commit: Option<GitOid>,
        wave: u32,
    ) -> Result<ConflictBundle, ForkedError> {
        let context = BundleContext {
            mode: self.mode,
            patch_branch: branch.to_owned(),
            commit,
        };
        Ok(conflict::capture(
            self.repo,
            &self.workdir,
            context,
            &self.rules,
            wave,
        )?)
    }

    fn persist(&self, mut bundle: ConflictBundle) -> Result<PathBuf, ForkedError> {
        if let Some(dir) = self.location.blobs_dir(bundle.wave) {
            conflict::export_blobs(self.repo, &mut bundle, &dir)?;
        }
        let path = self.location.bundle_path(bundle.wave);
        conflict::write_bundle(&path, &bundle)?;
        info!(bundle = %path.display(), wave = bundle.wave, "conflict bundle written");
        Ok(path)
    }

    /// Capture what is still conflicted, persist it, and build the stop error.
    fn stop(
        &mut self,
        branch: &str,
        commit: Option<GitOid>,
        wave: u32,
        reason: Option<String>,
    ) -> Result<ForkedError, ForkedError> {
        let bundle = self.capture(branch, commit, wave)?;
        let path = self.persist(bundle)?;
        Ok(self.stop_with_bundle(branch, commit, wave, path, reason))
    }

    fn stop_with_bundle(
        &mut self,
        branch: &str,
        commit: Option<GitOid>,
        wave: u32,
        bundle: PathBuf,
        reason: Option<String>,
    ) -> ForkedError {
        if let Some(reason) = &reason {
            warn!(branch, wave, %reason, "conflict unresolved");
        }
        self.record(Some(bundle.clone()), wave, branch, commit, ConflictResult::Stopped);
        let kind = self.kind();
        ForkedError::ConflictStop {
            bundle,
            wave,
            branch: branch.to_owned(),
            workdir: self.workdir.clone(),
            resume: kind.continue_command(),
            abort: kind.abort_command(),
            reason,
        }
    }

    fn record(
        &mut self,
        bundle: Option<PathBuf>,
        wave: u32,
        branch: &str,
        commit: Option<GitOid>,
        result: ConflictResult,
    ) {
        self.conflicts.push(ConflictRecord {
            bundle,
            wave,
            branch: branch.to_owned(),
            commit,
            result,
        });
    }
}

// ---------------------------------------------------------------------------
// External resolver
// ---------------------------------------------------------------------------

/// Run `command` through `sh -c` in `workdir` with the bundle path
/// substituted for [`BUNDLE_PLACEHOLDER`].
fn run_resolver(command: &str, bundle: &Path, workdir: &Path) -> Result<(), String> {
    let line = expand_command(command, bundle);
    debug!(command = %line, "running conflict resolver");
    let output = Command::new("sh")
        .args(["-c", &line])
        .current_dir(workdir)
        .output()
        .map_err(|e| format!("could not run resolver {line:?}: {e}"))?;
    let stderr = String::from_utf8_lossy(&output.stderr);
    if !stderr.trim().is_empty() {
        debug!(stderr = %stderr.trim(), "resolver stderr");
    }
    if output.status.success() {
        Ok(())
    } else {
        let code = output
            .status
            .code()
            .map_or_else(|| "signal".to_owned(), |c| c.to_string());
        Err(format!("resolver exited with {code}: {}", stderr.trim()))
    }
}

/// Substitute the shell-quoted bundle path into `command`.
#[must_use]
pub fn expand_command(command: &str, bundle: &Path) -> String {
    let path = bundle.to_string_lossy();
    let quoted = format!("'{}'", path.replace('\'', r"'\''"));
    command.replace(BUNDLE_PLACEHOLDER, &quoted)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn expand_quotes_bundle_path() {
        let line = expand_command("resolve --bundle {json}", Path::new("/tmp/it's/b-1.json"));
        assert_eq!(line, r"resolve --bundle '/tmp/it'\''s/b-1.json'");
        assert_eq!(expand_command("true", Path::new("/x")), "true");
    }

    #[test]
    fn mode_display_matches_flag_values() {
        assert_eq!(ConflictMode::Exec("x".into()).to_string(), "exec");
        assert_eq!(ConflictMode::Bias.to_string(), "bias");
    }
}
