//! Overlay provenance: what produced a given overlay.
//!
//! Two records are kept:
//!
//! - the append-only build log (`.forked/logs/forked-build.log`), one JSON
//!   object per build or sync run;
//! - a `key=value` note on the overlay tip under [`NOTES_REF`], so the
//!   selection survives even if the log is lost.
//!
//! [`lookup`] reads them back in that order and falls back to re-resolving
//! the selection from configuration.

use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use forked_git::{GitOid, GitRepo};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::artifacts;
use crate::config::ForkedConfig;
use crate::error::ForkedError;
use crate::selection::{self, Selection, SelectionRequest, SelectionSource};

/// Notes ref carrying the build summary on each overlay tip.
pub const NOTES_REF: &str = "refs/notes/forked-meta";

// ---------------------------------------------------------------------------
// Build log records
// ---------------------------------------------------------------------------

/// One line of the build log.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event")]
pub enum LogEvent {
    /// An overlay build.
    #[serde(rename = "forked.build")]
    Build(BuildRecord),
    /// A patch-branch sync.
    #[serde(rename = "forked.sync")]
    Sync(SyncRecord),
}

/// Final state of a run.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    /// Every selected branch replayed.
    Success,
    /// The run stopped on an unresolved conflict.
    Conflict,
}

/// The selection as recorded in the log.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SelectionRecord {
    pub features: Vec<String>,
    pub patches: Vec<String>,
    pub overlay_profile: Option<String>,
    #[serde(default)]
    pub include: Vec<String>,
    #[serde(default)]
    pub exclude: Vec<String>,
    #[serde(default)]
    pub unmatched_include: Vec<String>,
    #[serde(default)]
    pub unmatched_exclude: Vec<String>,
    #[serde(default)]
    pub skip_upstream_equivalents: bool,
    pub source: SelectionSource,
    #[serde(default)]
    pub patch_feature_map: BTreeMap<String, Vec<String>>,
}

impl SelectionRecord {
    /// Record `selection` as used by a run.
    #[must_use]
    pub fn new(selection: &Selection, skip_upstream_equivalents: bool) -> Self {
        Self {
            features: selection.features.clone(),
            patches: selection.patches.clone(),
            overlay_profile: selection.overlay_profile.clone(),
            include: selection.include.clone(),
            exclude: selection.exclude.clone(),
            unmatched_include: selection.unmatched_include.clone(),
            unmatched_exclude: selection.unmatched_exclude.clone(),
            skip_upstream_equivalents,
            source: selection.source.clone(),
            patch_feature_map: selection.patch_feature_map.clone(),
        }
    }
}

/// Why a commit was not replayed.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SkipReason {
    /// Its patch already exists in trunk's history.
    UpstreamEquivalent,
    /// Replaying it produced no change.
    Empty,
}

/// A commit left out of the overlay.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SkippedCommit {
    pub sha: GitOid,
    pub summary: String,
    pub reason: SkipReason,
}

/// Per-branch replay counts.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PatchRecord {
    pub branch: String,
    /// Commits in `merge-base(trunk, branch)..branch`, less upstream
    /// equivalents.
    pub commit_count: usize,
    pub skipped_count: usize,
    #[serde(default)]
    pub skipped_commits: Vec<SkippedCommit>,
}

/// How a conflict episode ended.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ConflictResult {
    /// Path bias resolved every file and the replay continued.
    AutoContinued,
    /// The external command resolved it and the replay continued.
    ExecContinued,
    /// The run stopped here.
    Stopped,
}

/// Reference to one conflict episode.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConflictRecord {
    /// Bundle path; `None` when an automatic pass discarded it.
    pub bundle: Option<PathBuf>,
    pub wave: u32,
    pub branch: String,
    pub commit: Option<GitOid>,
    pub result: ConflictResult,
}

/// A `forked.build` entry.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildRecord {
    pub timestamp: DateTime<Utc>,
    /// Overlay branch name.
    pub overlay: String,
    pub worktree: PathBuf,
    #[serde(default)]
    pub reused_worktree: bool,
    pub trunk: String,
    pub upstream: String,
    pub selection: SelectionRecord,
    pub patches: Vec<PatchRecord>,
    #[serde(default)]
    pub conflicts: Vec<ConflictRecord>,
    pub status: RunStatus,
}

/// Per-branch result of a sync.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SyncBranchStatus {
    /// Already based on the new trunk tip.
    UpToDate,
    /// Rebased onto the new trunk tip.
    Rebased,
    /// Stopped on a conflict.
    Conflict,
}

impl fmt::Display for SyncBranchStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::UpToDate => "up-to-date",
            Self::Rebased => "rebased",
            Self::Conflict => "conflict",
        })
    }
}

/// One branch in a sync run.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncBranchRecord {
    pub branch: String,
    pub status: SyncBranchStatus,
}

/// A `forked.sync` entry.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncRecord {
    pub timestamp: DateTime<Utc>,
    pub trunk: String,
    pub upstream: String,
    pub branches: Vec<SyncBranchRecord>,
    #[serde(default)]
    pub conflicts: Vec<ConflictRecord>,
    pub status: RunStatus,
}

/// Append one event to the build log under `repo_root`.
///
/// # Errors
/// Returns an I/O error if the log cannot be written.
pub fn append_event(repo_root: &Path, event: &LogEvent) -> io::Result<()> {
    artifacts::append_json_line(&artifacts::build_log_path(repo_root), event)
}

/// The newest build record per overlay branch.
///
/// Unreadable lines are skipped with a warning. When two records carry the
/// same timestamp the later line wins.
///
/// # Errors
/// Returns an I/O error if the log exists but cannot be read.
pub fn latest_builds(repo_root: &Path) -> io::Result<BTreeMap<String, BuildRecord>> {
    let path = artifacts::build_log_path(repo_root);
    let text = match fs::read_to_string(&path) {
        Ok(text) => text,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(BTreeMap::new()),
        Err(e) => return Err(e),
    };

    let mut latest: BTreeMap<String, BuildRecord> = BTreeMap::new();
    for (index, line) in text.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let record = match serde_json::from_str::<LogEvent>(line) {
            Ok(LogEvent::Build(record)) => record,
            Ok(LogEvent::Sync(_)) => continue,
            Err(e) => {
                warn!(line = index + 1, error = %e, "skipping unreadable build log entry");
                continue;
            }
        };
        let newer = latest
            .get(&record.overlay)
            .is_none_or(|prev| record.timestamp >= prev.timestamp);
        if newer {
            latest.insert(record.overlay.clone(), record);
        }
    }
    Ok(latest)
}

// ---------------------------------------------------------------------------
// Overlay note
// ---------------------------------------------------------------------------

/// The summary attached to an overlay tip.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ProvenanceNote {
    pub features: Vec<String>,
    pub patches: Vec<String>,
    pub overlay_profile: Option<String>,
    pub skip_upstream_equivalents: bool,
}

impl ProvenanceNote {
    /// Summary of `selection`.
    #[must_use]
    pub fn new(selection: &Selection, skip_upstream_equivalents: bool) -> Self {
        Self {
            features: selection.features.clone(),
            patches: selection.patches.clone(),
            overlay_profile: selection.overlay_profile.clone(),
            skip_upstream_equivalents,
        }
    }

    /// Parse a note body. Unknown keys and lines without `=` are ignored.
    #[must_use]
    pub fn parse(text: &str) -> Self {
        let mut note = Self::default();
        for line in text.lines() {
            let Some((key, value)) = line.trim().split_once('=') else {
                continue;
            };
            let value = value.trim();
            match key.trim().to_lowercase().as_str() {
                "features" => note.features = split_list(value),
                "patches" => note.patches = split_list(value),
                "overlay_profile" => {
                    note.overlay_profile = (!value.is_empty()).then(|| value.to_owned());
                }
                "skip_upstream_equivalents" => {
                    note.skip_upstream_equivalents =
                        matches!(value.to_lowercase().as_str(), "1" | "true" | "yes");
                }
                _ => {}
            }
        }
        note
    }
}

impl fmt::Display for ProvenanceNote {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "features={}", self.features.join(","))?;
        writeln!(f, "patches={}", self.patches.join(","))?;
        writeln!(
            f,
            "overlay_profile={}",
            self.overlay_profile.as_deref().unwrap_or_default()
        )?;
        writeln!(
            f,
            "skip_upstream_equivalents={}",
            self.skip_upstream_equivalents
        )
    }
}

fn split_list(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_owned)
        .collect()
}

/// Attach `note` to `tip`, replacing any previous one.
///
/// # Errors
/// Returns [`ForkedError::Git`] if git refuses the note.
pub fn write_note(repo: &dyn GitRepo, tip: GitOid, note: &ProvenanceNote) -> Result<(), ForkedError> {
    repo.write_note(NOTES_REF, tip, &note.to_string())?;
    Ok(())
}

/// Read the note on `tip`, if one exists.
///
/// # Errors
/// Returns [`ForkedError::Git`] if the notes ref cannot be read.
pub fn read_note(repo: &dyn GitRepo, tip: GitOid) -> Result<Option<ProvenanceNote>, ForkedError> {
    Ok(repo
        .read_note(NOTES_REF, tip)?
        .filter(|body| !body.trim().is_empty())
        .map(|body| ProvenanceNote::parse(&body)))
}

// ---------------------------------------------------------------------------
// Lookup
// ---------------------------------------------------------------------------

/// Where a recovered selection came from.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ProvenanceSource {
    /// The newest build log entry.
    ProvenanceLog,
    /// The overlay tip's note.
    GitNote,
    /// Re-resolved from configuration.
    Derived,
}

/// A selection recovered for an existing overlay.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RecoveredSelection {
    pub source: ProvenanceSource,
    pub features: Vec<String>,
    pub patches: Vec<String>,
    pub overlay_profile: Option<String>,
    /// The resolver's own source tag, when known.
    pub resolver_source: Option<SelectionSource>,
}

/// Recover the selection that produced `overlay_branch` (tip `tip`).
///
/// Tries the build log, then the note, then re-resolves: the overlay
/// profile named by the overlay id if it exists, otherwise the default
/// selection.
///
/// # Errors
/// Returns an error if the build log or the notes ref cannot be read.
pub fn lookup(
    repo: &dyn GitRepo,
    cfg: &ForkedConfig,
    overlay_branch: &str,
    tip: GitOid,
) -> Result<RecoveredSelection, ForkedError> {
    if let Some(record) = latest_builds(repo.root())?.remove(overlay_branch) {
        let selection = record.selection;
        return Ok(RecoveredSelection {
            source: ProvenanceSource::ProvenanceLog,
            features: selection.features,
            patches: selection.patches,
            overlay_profile: selection.overlay_profile,
            resolver_source: Some(selection.source),
        });
    }

    if let Some(note) = read_note(repo, tip)? {
        return Ok(RecoveredSelection {
            source: ProvenanceSource::GitNote,
            features: note.features,
            patches: note.patches,
            overlay_profile: note.overlay_profile,
            resolver_source: None,
        });
    }

    warn!(overlay = overlay_branch, "no provenance recorded; deriving selection from configuration");
    let id = cfg.overlay_id(overlay_branch);
    let request = if cfg.overlays.contains_key(id) {
        SelectionRequest::overlay(id)
    } else {
        SelectionRequest::default()
    };
    match selection::resolve(cfg, &request) {
        Ok(resolved) => Ok(RecoveredSelection {
            source: ProvenanceSource::Derived,
            features: resolved.features,
            patches: resolved.patches,
            overlay_profile: resolved.overlay_profile,
            resolver_source: Some(resolved.source),
        }),
        Err(e) => {
            warn!(overlay = overlay_branch, error = %e, "resolver fallback failed");
            Ok(RecoveredSelection {
                source: ProvenanceSource::Derived,
                features: Vec::new(),
                patches: Vec::new(),
                overlay_profile: None,
                resolver_source: None,
            })
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn selection() -> Selection {
        Selection {
            features: vec!["payments".into()],
            patches: vec!["patch/payments/01".into()],
            overlay_profile: Some("dev".into()),
            include: vec![],
            exclude: vec![],
            unmatched_include: vec![],
            unmatched_exclude: vec![],
            source: SelectionSource::Overlay("dev".into()),
            patch_feature_map: BTreeMap::new(),
        }
    }

    fn build_record(overlay: &str, ts: &str, features: &[&str]) -> BuildRecord {
        let mut sel = SelectionRecord::new(&selection(), false);
        sel.features = features.iter().map(|s| (*s).to_owned()).collect();
        BuildRecord {
            timestamp: ts.parse().unwrap(),
            overlay: overlay.into(),
            worktree: PathBuf::from("/wt"),
            reused_worktree: false,
            trunk: "trunk".into(),
            upstream: "upstream/main".into(),
            selection: sel,
            patches: vec![],
            conflicts: vec![],
            status: RunStatus::Success,
        }
    }

    #[test]
    fn note_renders_and_parses() {
        let note = ProvenanceNote::new(&selection(), true);
        let text = note.to_string();
        assert!(text.contains("features=payments\n"));
        assert!(text.contains("overlay_profile=dev\n"));
        assert!(text.contains("skip_upstream_equivalents=true\n"));
        assert_eq!(ProvenanceNote::parse(&text), note);
    }

    #[test]
    fn note_parse_tolerates_noise() {
        let note = ProvenanceNote::parse("garbage\nFEATURES = a, ,b\noverlay_profile=\nskip_upstream_equivalents=yes\n");
        assert_eq!(note.features, vec!["a", "b"]);
        assert_eq!(note.overlay_profile, None);
        assert!(note.skip_upstream_equivalents);
    }

    #[test]
    fn log_event_is_tagged() {
        let event = LogEvent::Build(build_record("overlay/dev", "2024-05-01T10:00:00Z", &["payments"]));
        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["event"], "forked.build");
        assert_eq!(value["selection"]["source"], "overlay:dev");
        assert_eq!(value["status"], "success");
    }

    #[test]
    fn latest_builds_picks_newest_and_skips_corrupt_lines() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();
        append_event(root, &LogEvent::Build(build_record("overlay/dev", "2024-05-02T00:00:00Z", &["new"]))).unwrap();
        append_event(root, &LogEvent::Build(build_record("overlay/dev", "2024-05-01T00:00:00Z", &["old"]))).unwrap();
        append_event(root, &LogEvent::Build(build_record("overlay/qa", "2024-05-01T00:00:00Z", &["qa"]))).unwrap();
        let path = artifacts::build_log_path(root);
        let mut text = fs::read_to_string(&path).unwrap();
        text.push_str("{not json\n");
        fs::write(&path, text).unwrap();

        let latest = latest_builds(root).unwrap();
        assert_eq!(latest.len(), 2);
        assert_eq!(latest["overlay/dev"].selection.features, vec!["new"]);
        assert_eq!(latest["overlay/qa"].selection.features, vec!["qa"]);
    }

    #[test]
    fn missing_log_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        assert!(latest_builds(dir.path()).unwrap().is_empty());
    }

    #[test]
    fn skip_reason_and_conflict_result_spelling() {
        assert_eq!(
            serde_json::to_value(SkipReason::UpstreamEquivalent).unwrap(),
            "upstream-equivalent"
        );
        assert_eq!(
            serde_json::to_value(ConflictResult::AutoContinued).unwrap(),
            "auto-continued"
        );
        assert_eq!(
            serde_json::to_value(SyncBranchStatus::UpToDate).unwrap(),
            "up-to-date"
        );
        assert_eq!(
            serde_json::to_value(ProvenanceSource::ProvenanceLog).unwrap(),
            "provenance-log"
        );
    }
}
