//! Conflict bundles: resumable, machine-readable records of one conflict
//! episode.
//!
//! A bundle is written the moment a replay step stops with unmerged paths.
//! It lists every conflicted file with its base/ours/theirs blob ids, a
//! binary flag, and a recommended resolution, plus the exact commands that
//! continue or abort the paused replay.
//!
//! "Ours" is always the side being built on (trunk lineage) and "theirs" the
//! incoming patch commit, for both cherry-pick builds and rebase syncs.

use std::fmt;
use std::path::{Path, PathBuf};

use forked_git::{ConflictEntry, GitError, GitOid, GitRepo, ReplayKind};
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument};

use crate::artifacts;
use crate::config::{ConfigError, ForkedConfig};
use crate::error::ForkedError;
use crate::globs::PathGlobs;

/// Current bundle schema version.
pub const BUNDLE_SCHEMA_VERSION: u32 = 2;

/// How many leading bytes are scanned for NUL when classifying a blob.
const BINARY_SNIFF_LEN: usize = 8000;

// ---------------------------------------------------------------------------
// Bundle document
// ---------------------------------------------------------------------------

/// Which operation produced the conflict.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunMode {
    /// Overlay build (cherry-pick replay).
    Build,
    /// Patch-branch sync (rebase replay).
    Sync,
}

impl RunMode {
    /// The replay mechanism this mode uses.
    #[must_use]
    pub const fn replay_kind(self) -> ReplayKind {
        match self {
            Self::Build => ReplayKind::CherryPick,
            Self::Sync => ReplayKind::Rebase,
        }
    }
}

impl fmt::Display for RunMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Build => write!(f, "build"),
            Self::Sync => write!(f, "sync"),
        }
    }
}

/// Recommended resolution for one conflicted path.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Precedence {
    /// Keep the trunk-lineage version.
    Ours,
    /// Keep the incoming patch version.
    Theirs,
    /// No rule applies; a human or tool must decide.
    Manual,
}

/// Where the conflict happened.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BundleContext {
    /// Build or sync.
    pub mode: RunMode,
    /// The patch branch being replayed.
    pub patch_branch: String,
    /// The commit whose replay stopped, when known.
    pub commit: Option<GitOid>,
}

/// The precedence block of a file entry.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PrecedenceHint {
    /// The recommended side.
    pub recommended: Precedence,
}

/// Paths of exported raw blobs for one file.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExportedBlobs {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub base: Option<PathBuf>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ours: Option<PathBuf>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub theirs: Option<PathBuf>,
}

/// One conflicted file.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BundleFile {
    /// Repository-relative path.
    pub path: String,
    /// Blob at the merge base; `None` if the file did not exist there.
    pub base: Option<GitOid>,
    /// Blob on the side being built on.
    pub ours: Option<GitOid>,
    /// Blob in the incoming commit.
    pub theirs: Option<GitOid>,
    /// Whether any side looks binary.
    pub binary: bool,
    /// Recommended resolution.
    pub precedence: PrecedenceHint,
    /// Exported blob files, when requested.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub blobs: Option<ExportedBlobs>,
}

/// The exact next step for the paused replay.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResumeInstructions {
    /// Command that resumes the replay after resolution.
    #[serde(rename = "continue")]
    pub continue_cmd: String,
    /// Command that abandons the replay.
    pub abort: String,
    /// Working copy the commands must run in.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workdir: Option<PathBuf>,
}

impl ResumeInstructions {
    /// Instructions for `kind` paused in `workdir`.
    #[must_use]
    pub fn for_replay(kind: ReplayKind, workdir: &Path) -> Self {
        Self {
            continue_cmd: kind.continue_command(),
            abort: kind.abort_command(),
            workdir: Some(workdir.to_path_buf()),
        }
    }
}

/// A complete conflict bundle.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConflictBundle {
    /// Always [`BUNDLE_SCHEMA_VERSION`] when written.
    pub schema_version: u32,
    /// Conflict episode number within the run, starting at 1.
    pub wave: u32,
    pub context: BundleContext,
    pub files: Vec<BundleFile>,
    pub resume: ResumeInstructions,
}

impl ConflictBundle {
    /// Paths whose recommendation is not `manual`, with the recommended side.
    pub fn resolvable(&self) -> impl Iterator<Item = (&BundleFile, Precedence)> {
        self.files
            .iter()
            .filter(|f| f.precedence.recommended != Precedence::Manual)
            .map(|f| (f, f.precedence.recommended))
    }
}

// ---------------------------------------------------------------------------
// Precedence rules
// ---------------------------------------------------------------------------

/// Compiled rules deciding the recommended side for a path.
///
/// Order: `path_bias.ours`, `path_bias.theirs`, then sentinel hints
/// (`must_match_upstream` recommends ours, `must_diverge_from_upstream`
/// recommends theirs), else manual.
#[derive(Clone, Debug, Default)]
pub struct PrecedenceRules {
    ours: PathGlobs,
    theirs: PathGlobs,
    must_match: PathGlobs,
    must_diverge: PathGlobs,
}

impl PrecedenceRules {
    /// Compile the rules for a run whose active features are `features`.
    ///
    /// # Errors
    /// Returns [`ConfigError`] if any configured glob is invalid.
    pub fn from_config(cfg: &ForkedConfig, features: &[String]) -> Result<Self, ConfigError> {
        let sentinels = cfg.effective_sentinels(features);
        Ok(Self {
            ours: compile("path_bias.ours", &cfg.path_bias.ours)?,
            theirs: compile("path_bias.theirs", &cfg.path_bias.theirs)?,
            must_match: compile("sentinels.must_match_upstream", &sentinels.must_match_upstream)?,
            must_diverge: compile(
                "sentinels.must_diverge_from_upstream",
                &sentinels.must_diverge_from_upstream,
            )?,
        })
    }

    /// The recommended side for `path`.
    #[must_use]
    pub fn recommend(&self, path: &str) -> Precedence {
        if self.ours.matches(path) {
            Precedence::Ours
        } else if self.theirs.matches(path) {
            Precedence::Theirs
        } else if self.must_match.matches(path) {
            Precedence::Ours
        } else if self.must_diverge.matches(path) {
            Precedence::Theirs
        } else {
            Precedence::Manual
        }
    }
}

pub(crate) fn compile(field: &str, globs: &[String]) -> Result<PathGlobs, ConfigError> {
    PathGlobs::new(globs).map_err(|e| ConfigError {
        path: None,
        message: format!("invalid glob in {field}: {e}"),
    })
}

// ---------------------------------------------------------------------------
// Building
// ---------------------------------------------------------------------------

/// Capture the conflict currently paused in `workdir`.
///
/// # Errors
/// Returns [`GitError`] if the index or a blob cannot be read.
#[instrument(skip(repo, rules, context), fields(branch = %context.patch_branch))]
pub fn capture(
    repo: &dyn GitRepo,
    workdir: &Path,
    context: BundleContext,
    rules: &PrecedenceRules,
    wave: u32,
) -> Result<ConflictBundle, GitError> {
    let entries = repo.conflicted_entries(workdir)?;
    let mut files = Vec::with_capacity(entries.len());
    for entry in &entries {
        files.push(BundleFile {
            path: entry.path.clone(),
            base: entry.base,
            ours: entry.ours,
            theirs: entry.theirs,
            binary: entry_is_binary(repo, entry)?,
            precedence: PrecedenceHint {
                recommended: rules.recommend(&entry.path),
            },
            blobs: None,
        });
    }
    debug!(files = files.len(), "captured conflict");
    Ok(ConflictBundle {
        schema_version: BUNDLE_SCHEMA_VERSION,
        wave,
        resume: ResumeInstructions::for_replay(context.mode.replay_kind(), workdir),
        context,
        files,
    })
}

fn entry_is_binary(repo: &dyn GitRepo, entry: &ConflictEntry) -> Result<bool, GitError> {
    for oid in [entry.base, entry.ours, entry.theirs].into_iter().flatten() {
        if looks_binary(&repo.read_blob(oid)?) {
            return Ok(true);
        }
    }
    Ok(false)
}

/// Whether `bytes` contains a NUL within the sniffed prefix.
#[must_use]
pub fn looks_binary(bytes: &[u8]) -> bool {
    bytes.iter().take(BINARY_SNIFF_LEN).any(|b| *b == 0)
}

/// Write the raw base/ours/theirs blobs of every file under `dir`,
/// mirroring repository paths (`dir/base/<path>`, `dir/ours/<path>`,
/// `dir/theirs/<path>`), and record the locations in the bundle.
///
/// # Errors
/// Returns an error if a blob cannot be read or written.
pub fn export_blobs(
    repo: &dyn GitRepo,
    bundle: &mut ConflictBundle,
    dir: &Path,
) -> Result<(), ForkedError> {
    for file in &mut bundle.files {
        let mut exported = ExportedBlobs::default();
        for (side, oid, slot) in [
            ("base", file.base, &mut exported.base),
            ("ours", file.ours, &mut exported.ours),
            ("theirs", file.theirs, &mut exported.theirs),
        ] {
            let Some(oid) = oid else { continue };
            let target = dir.join(side).join(&file.path);
            artifacts::write_bytes_atomic(&target, &repo.read_blob(oid)?)?;
            *slot = Some(target);
        }
        file.blobs = Some(exported);
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Locations
// ---------------------------------------------------------------------------

/// Where bundles for a run go.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BundleLocation {
    repo_root: PathBuf,
    id: String,
    stem: Option<PathBuf>,
    blobs: Option<BlobsLocation>,
}

/// Where exported blobs go.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum BlobsLocation {
    /// Next to the bundle: `.forked/conflicts/<id>-<wave>/`.
    Default,
    /// `<dir>/<id>-<wave>/`.
    Dir(PathBuf),
}

impl BundleLocation {
    /// Bundles for run `id`. An explicit `path` is used as a stem: a
    /// trailing `.json` is dropped and `-<wave>.json` appended. Relative
    /// paths resolve against the repository root.
    #[must_use]
    pub fn new(repo_root: &Path, id: &str, path: Option<&Path>, blobs: Option<BlobsLocation>) -> Self {
        let stem = path.map(|p| {
            let abs = if p.is_absolute() {
                p.to_path_buf()
            } else {
                repo_root.join(p)
            };
            if abs.extension().is_some_and(|e| e == "json") {
                abs.with_extension("")
            } else {
                abs
            }
        });
        Self {
            repo_root: repo_root.to_path_buf(),
            id: id.to_owned(),
            stem,
            blobs,
        }
    }

    /// Whether the caller named an explicit bundle path.
    #[must_use]
    pub const fn is_explicit(&self) -> bool {
        self.stem.is_some()
    }

    /// The bundle path for `wave`.
    #[must_use]
    pub fn bundle_path(&self, wave: u32) -> PathBuf {
        match &self.stem {
            Some(stem) => {
                let mut name = stem.file_name().map(std::ffi::OsStr::to_os_string).unwrap_or_default();
                name.push(format!("-{wave}.json"));
                stem.with_file_name(name)
            }
            None => artifacts::conflicts_dir(&self.repo_root).join(format!("{}-{wave}.json", self.file_id())),
        }
    }

    /// The blob export directory for `wave`, if export was requested.
    #[must_use]
    pub fn blobs_dir(&self, wave: u32) -> Option<PathBuf> {
        let name = format!("{}-{wave}", self.file_id());
        match &self.blobs {
            None => None,
            Some(BlobsLocation::Default) => Some(artifacts::conflicts_dir(&self.repo_root).join(name)),
            Some(BlobsLocation::Dir(dir)) => {
                let base = if dir.is_absolute() {
                    dir.clone()
                } else {
                    self.repo_root.join(dir)
                };
                Some(base.join(name))
            }
        }
    }

    fn file_id(&self) -> String {
        self.id.replace('/', "-")
    }
}

/// Persist `bundle` at `path`.
///
/// # Errors
/// Returns an I/O error if the write fails.
pub fn write_bundle(path: &Path, bundle: &ConflictBundle) -> std::io::Result<()> {
    artifacts::write_json_atomic(path, bundle)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn oid(byte: u8) -> GitOid {
        GitOid::from_bytes([byte; 20])
    }

    fn rules(toml: &str, features: &[&str]) -> PrecedenceRules {
        let cfg = ForkedConfig::parse(toml).unwrap();
        let features: Vec<String> = features.iter().map(|s| (*s).to_owned()).collect();
        PrecedenceRules::from_config(&cfg, &features).unwrap()
    }

    #[test]
    fn path_bias_wins_over_sentinels() {
        let r = rules(
            r#"
[path_bias]
ours = ["*.lock"]
theirs = ["src/**"]

[guards.sentinels]
must_match_upstream = ["src/main.rs"]
must_diverge_from_upstream = ["branding/**"]
"#,
            &[],
        );
        assert_eq!(r.recommend("Cargo.lock"), Precedence::Ours);
        assert_eq!(r.recommend("src/main.rs"), Precedence::Theirs);
        assert_eq!(r.recommend("branding/logo.svg"), Precedence::Theirs);
        assert_eq!(r.recommend("README.md"), Precedence::Manual);
    }

    #[test]
    fn feature_sentinels_feed_recommendations() {
        let toml = r#"
[patches]
order = ["patch/a"]

[features.f]
patches = ["patch/a"]
[features.f.sentinels]
must_match_upstream = ["app.py"]
"#;
        assert_eq!(rules(toml, &["f"]).recommend("app.py"), Precedence::Ours);
        assert_eq!(rules(toml, &[]).recommend("app.py"), Precedence::Manual);
    }

    #[test]
    fn invalid_bias_glob_is_config_error() {
        let cfg = ForkedConfig::parse("[path_bias]\nours = [\"[bad\"]\n").unwrap();
        let err = PrecedenceRules::from_config(&cfg, &[]).unwrap_err();
        assert!(err.message.contains("path_bias.ours"));
    }

    #[test]
    fn binary_sniff_only_checks_prefix() {
        assert!(!looks_binary(b"plain text\n"));
        assert!(looks_binary(b"PNG\0data"));
        let mut late = vec![b'a'; BINARY_SNIFF_LEN];
        late.push(0);
        assert!(!looks_binary(&late));
    }

    #[test]
    fn default_location_uses_id_and_wave() {
        let loc = BundleLocation::new(Path::new("/repo"), "dev", None, None);
        assert!(!loc.is_explicit());
        assert_eq!(
            loc.bundle_path(1),
            PathBuf::from("/repo/.forked/conflicts/dev-1.json")
        );
        assert_eq!(
            loc.bundle_path(2),
            PathBuf::from("/repo/.forked/conflicts/dev-2.json")
        );
        assert_eq!(loc.blobs_dir(1), None);
    }

    #[test]
    fn explicit_location_is_a_stem() {
        let loc = BundleLocation::new(
            Path::new("/repo"),
            "dev",
            Some(Path::new(".forked/conflicts/test")),
            None,
        );
        assert!(loc.is_explicit());
        assert_eq!(
            loc.bundle_path(1),
            PathBuf::from("/repo/.forked/conflicts/test-1.json")
        );

        let json = BundleLocation::new(Path::new("/repo"), "dev", Some(Path::new("/tmp/out.json")), None);
        assert_eq!(json.bundle_path(3), PathBuf::from("/tmp/out-3.json"));
    }

    #[test]
    fn blob_dirs_are_per_wave() {
        let default = BundleLocation::new(Path::new("/repo"), "dev", None, Some(BlobsLocation::Default));
        assert_eq!(
            default.blobs_dir(2),
            Some(PathBuf::from("/repo/.forked/conflicts/dev-2"))
        );
        let dir = BundleLocation::new(
            Path::new("/repo"),
            "dev",
            None,
            Some(BlobsLocation::Dir(PathBuf::from("blobs"))),
        );
        assert_eq!(dir.blobs_dir(1), Some(PathBuf::from("/repo/blobs/dev-1")));
    }

    #[test]
    fn bundle_serializes_documented_shape() {
        let bundle = ConflictBundle {
            schema_version: BUNDLE_SCHEMA_VERSION,
            wave: 1,
            context: BundleContext {
                mode: RunMode::Build,
                patch_branch: "patch/x".into(),
                commit: Some(oid(0xab)),
            },
            files: vec![BundleFile {
                path: "x.txt".into(),
                base: Some(oid(1)),
                ours: Some(oid(2)),
                theirs: None,
                binary: false,
                precedence: PrecedenceHint {
                    recommended: Precedence::Manual,
                },
                blobs: None,
            }],
            resume: ResumeInstructions {
                continue_cmd: "git cherry-pick --continue".into(),
                abort: "git cherry-pick --abort".into(),
                workdir: None,
            },
        };
        let value = serde_json::to_value(&bundle).unwrap();
        assert_eq!(value["schema_version"], 2);
        assert_eq!(value["context"]["mode"], "build");
        assert_eq!(value["files"][0]["theirs"], serde_json::Value::Null);
        assert_eq!(value["files"][0]["precedence"]["recommended"], "manual");
        assert_eq!(value["resume"]["continue"], "git cherry-pick --continue");
        assert!(value["files"][0].get("blobs").is_none());
        assert!(value["resume"].get("workdir").is_none());
    }

    #[test]
    fn resolvable_skips_manual() {
        let file = |path: &str, p| BundleFile {
            path: path.into(),
            base: None,
            ours: None,
            theirs: None,
            binary: false,
            precedence: PrecedenceHint { recommended: p },
            blobs: None,
        };
        let bundle = ConflictBundle {
            schema_version: 2,
            wave: 1,
            context: BundleContext {
                mode: RunMode::Sync,
                patch_branch: "p".into(),
                commit: None,
            },
            files: vec![file("a", Precedence::Manual), file("b", Precedence::Theirs)],
            resume: ResumeInstructions::for_replay(ReplayKind::Rebase, Path::new("/w")),
        };
        let picked: Vec<_> = bundle.resolvable().map(|(f, p)| (f.path.as_str(), p)).collect();
        assert_eq!(picked, vec![("b", Precedence::Theirs)]);
        assert_eq!(bundle.resume.continue_cmd, "git rebase --continue");
    }
}
